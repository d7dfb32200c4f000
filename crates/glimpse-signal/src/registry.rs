//! Session registry
//!
//! Owns the lifecycle of session records in the shared store: creation,
//! lookup with lazy expiry, viewer membership, status changes, discovery, and
//! the periodic expiry sweep.
//!
//! Storage failures never reach the caller. They are logged and the operation
//! degrades to "not found", `false`, or an empty list.
//!
//! Mutations are read-modify-write cycles committed with
//! [`KvStore::compare_and_set`] and retried on conflict, so concurrent joins
//! never lose a viewer, even from registries in different processes.

use std::convert::Infallible;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use glimpse_core::code::{format_session_id, generate_session_id};
use glimpse_core::{
    session_key, Clock, KvStore, RegistryStats, Session, SessionConfig, SessionError,
    SessionMetadata, SessionStatus, StoreError, SystemClock, SESSION_PREFIX,
};

/// Registry of broadcast sessions backed by a [`KvStore`]
///
/// Cheap to clone; clones share the store and the sweeper.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    store: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    config: SessionConfig,
    /// Background expiry sweep, armed by the first `create_session`
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

/// Attempts at committing one session update before giving up
const MAX_WRITE_ATTEMPTS: usize = 64;

/// Result of a conditional session update
enum Update<E> {
    /// No such session, or it expired
    Missing,
    /// The edit refused the change
    Rejected(E),
    /// Nothing to write
    Unchanged(Session),
    Saved(Session),
}

impl Drop for RegistryInner {
    fn drop(&mut self) {
        if let Some(handle) = self.sweeper.get_mut().take() {
            handle.abort();
        }
    }
}

impl SessionRegistry {
    /// Create a registry with the system clock and default settings
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self::with_config(store, Arc::new(SystemClock), SessionConfig::default())
    }

    /// Create a registry with a custom clock and configuration
    pub fn with_config(
        store: Arc<dyn KvStore>,
        clock: Arc<dyn Clock>,
        config: SessionConfig,
    ) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                store,
                clock,
                config,
                sweeper: Mutex::new(None),
            }),
        }
    }

    pub fn store(&self) -> &Arc<dyn KvStore> {
        &self.inner.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.inner.clock
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    fn now(&self) -> i64 {
        self.inner.clock.now_ms()
    }

    fn expiry_ms(&self) -> i64 {
        self.inner.config.expiry_ms()
    }

    /// Create a new active session owned by `host_id`
    ///
    /// Never fails: if the record cannot be persisted the failure is logged
    /// and the session is still returned.
    pub async fn create_session(
        &self,
        host_id: &str,
        metadata: Option<SessionMetadata>,
    ) -> Session {
        let id = self.unused_session_id().await;

        let session = Session {
            id,
            status: SessionStatus::Active,
            host_id: host_id.to_string(),
            viewers: Vec::new(),
            created_at: self.now(),
            metadata,
        };

        if let Err(e) = self.save(&session).await {
            error!("Error saving session {}: {}", session.id, e);
        }

        self.ensure_sweeper();

        info!(
            session = %format_session_id(&session.id),
            host = %host_id,
            "Session created"
        );
        session
    }

    /// Pick a code that is not already stored (best effort)
    async fn unused_session_id(&self) -> String {
        let attempts = self.inner.config.id_attempts.max(1);
        let mut id = generate_session_id();

        for _ in 1..attempts {
            match self.inner.store.get(&session_key(&id)).await {
                Ok(Some(_)) => {
                    debug!("Session code {} already in use, regenerating", id);
                    id = generate_session_id();
                }
                _ => break,
            }
        }

        id
    }

    /// Look up a session; expired records are deleted and reported as missing
    pub async fn get_session(&self, id: &str) -> Option<Session> {
        let session = match self.read(id).await {
            Ok(Some(session)) => session,
            Ok(None) => return None,
            Err(e) => {
                error!("Error getting session {}: {}", id, e);
                return None;
            }
        };

        if session.is_expired(self.now(), self.expiry_ms()) {
            debug!("Session {} expired on read", id);
            self.remove_session(id).await;
            return None;
        }

        Some(session)
    }

    /// Add a viewer; idempotent. Returns `false` if the session is missing.
    ///
    /// `maxViewers` is not checked here, see [`Self::try_add_viewer`].
    pub async fn add_viewer(&self, id: &str, viewer_id: &str) -> bool {
        let update = self
            .update(id, |session| Ok::<_, Infallible>(session.insert_viewer(viewer_id)))
            .await;

        match update {
            Ok(Update::Missing) => false,
            Ok(Update::Saved(_)) => {
                debug!(session = %id, viewer = %viewer_id, "Viewer added");
                true
            }
            Ok(_) => true,
            Err(e) => {
                error!("Error saving session {}: {}", id, e);
                false
            }
        }
    }

    /// Add a viewer, enforcing status and capacity
    ///
    /// A viewer that is already listed is accepted even when the session is full.
    pub async fn try_add_viewer(&self, id: &str, viewer_id: &str) -> Result<Session, SessionError> {
        let update = self
            .update(id, |session| {
                if session.status != SessionStatus::Active {
                    return Err(SessionError::NotActive(id.to_string()));
                }
                if session.has_viewer(viewer_id) {
                    return Ok(false);
                }
                if let Some(max) = session.max_viewers() {
                    if session.is_full() {
                        return Err(SessionError::Capacity { max });
                    }
                }
                Ok(session.insert_viewer(viewer_id))
            })
            .await
            .map_err(|e| {
                error!("Error saving session {}: {}", id, e);
                SessionError::Storage(e)
            })?;

        match update {
            Update::Missing => Err(SessionError::NotFound(id.to_string())),
            Update::Rejected(e) => {
                if let SessionError::Capacity { max } = e {
                    info!(session = %id, max, "Join rejected: session full");
                }
                Err(e)
            }
            Update::Unchanged(session) => Ok(session),
            Update::Saved(session) => {
                debug!(session = %id, viewer = %viewer_id, "Viewer added");
                Ok(session)
            }
        }
    }

    /// Remove a viewer. Returns `false` only if the session is missing.
    pub async fn remove_viewer(&self, id: &str, viewer_id: &str) -> bool {
        let update = self
            .update(id, |session| Ok::<_, Infallible>(session.remove_viewer(viewer_id)))
            .await;

        match update {
            Ok(Update::Missing) => false,
            Ok(Update::Saved(_)) => {
                debug!(session = %id, viewer = %viewer_id, "Viewer removed");
                true
            }
            Ok(_) => true,
            Err(e) => {
                error!("Error saving session {}: {}", id, e);
                false
            }
        }
    }

    /// Set the status of a session
    pub async fn update_status(&self, id: &str, status: SessionStatus) -> bool {
        let update = self
            .update(id, |session| {
                let changed = session.status != status;
                session.status = status;
                Ok::<_, Infallible>(changed)
            })
            .await;

        match update {
            Ok(Update::Missing) => false,
            Ok(_) => {
                info!(session = %id, %status, "Session status updated");
                true
            }
            Err(e) => {
                error!("Error saving session {}: {}", id, e);
                false
            }
        }
    }

    /// Physically remove a session record
    pub async fn remove_session(&self, id: &str) {
        if let Err(e) = self.inner.store.delete(&session_key(id)).await {
            error!("Error removing session {}: {}", id, e);
        }
    }

    /// All active, unexpired sessions, newest first
    pub async fn list_active(&self) -> Vec<Session> {
        let now = self.now();
        let expiry = self.expiry_ms();

        let mut sessions: Vec<Session> = self
            .load_all()
            .await
            .into_iter()
            .filter_map(|(_, parsed)| parsed.ok())
            .filter(|s| s.is_live(now, expiry))
            .collect();

        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        sessions
    }

    /// Active sessions whose code, title, or description contains `query`
    pub async fn search_active(&self, query: &str) -> Vec<Session> {
        self.list_active()
            .await
            .into_iter()
            .filter(|s| s.matches_query(query))
            .collect()
    }

    /// Totals over the active sessions
    pub async fn stats(&self) -> RegistryStats {
        let sessions = self.list_active().await;
        RegistryStats {
            active_sessions: sessions.len(),
            total_viewers: sessions.iter().map(Session::viewer_count).sum(),
            oldest_created_at: sessions.iter().map(|s| s.created_at).min(),
        }
    }

    /// Delete every stored session older than the expiry window, whatever its status
    ///
    /// Unreadable records are deleted too. Returns the number of records removed.
    pub async fn sweep_expired(&self) -> usize {
        let now = self.now();
        let expiry = self.expiry_ms();
        let mut removed = 0;

        for (key, parsed) in self.load_all().await {
            let stale = match parsed {
                Ok(session) => session.is_expired(now, expiry),
                Err(e) => {
                    warn!("Removing unreadable session record {}: {}", key, e);
                    true
                }
            };

            if stale {
                match self.inner.store.delete(&key).await {
                    Ok(()) => removed += 1,
                    Err(e) => error!("Error removing session record {}: {}", key, e),
                }
            }
        }

        if removed > 0 {
            info!("Cleaned up {} expired sessions", removed);
        }
        removed
    }

    /// Whether the background sweep is running
    pub fn is_sweeper_armed(&self) -> bool {
        self.inner
            .sweeper
            .lock()
            .as_ref()
            .map_or(false, |h| !h.is_finished())
    }

    /// Start the periodic sweep unless it is already running
    ///
    /// Outside a tokio runtime this is a no-op; `sweep_expired` can still be
    /// called directly.
    pub fn ensure_sweeper(&self) {
        let mut sweeper = self.inner.sweeper.lock();
        if sweeper.as_ref().map_or(false, |h| !h.is_finished()) {
            return;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!("No tokio runtime, expiry sweep not armed");
            return;
        };

        let weak = Arc::downgrade(&self.inner);
        let period = self.inner.config.sweep_interval();
        *sweeper = Some(runtime.spawn(run_sweeper(weak, period)));
        debug!("Expiry sweep armed every {:?}", period);
    }

    /// Apply `edit` to a live session and commit it against the value it was read from
    ///
    /// `edit` returns whether it changed the session; it may run several times
    /// when other writers get in first.
    async fn update<E>(
        &self,
        id: &str,
        mut edit: impl FnMut(&mut Session) -> Result<bool, E>,
    ) -> Result<Update<E>, StoreError> {
        let key = session_key(id);

        for _ in 0..MAX_WRITE_ATTEMPTS {
            let Some(raw) = self.inner.store.get(&key).await? else {
                return Ok(Update::Missing);
            };
            let mut session: Session = serde_json::from_str(&raw)?;

            if session.is_expired(self.now(), self.expiry_ms()) {
                debug!("Session {} expired on read", id);
                self.remove_session(id).await;
                return Ok(Update::Missing);
            }

            match edit(&mut session) {
                Err(e) => return Ok(Update::Rejected(e)),
                Ok(false) => return Ok(Update::Unchanged(session)),
                Ok(true) => {}
            }

            let json = serde_json::to_string(&session)?;
            if self
                .inner
                .store
                .compare_and_set(&key, Some(&raw), Some(json))
                .await?
            {
                return Ok(Update::Saved(session));
            }

            debug!(session = %id, "Session changed underneath, retrying");
            tokio::task::yield_now().await;
        }

        Err(StoreError::Conflict(key))
    }

    async fn read(&self, id: &str) -> Result<Option<Session>, StoreError> {
        match self.inner.store.get(&session_key(id)).await? {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn save(&self, session: &Session) -> Result<(), StoreError> {
        let json = serde_json::to_string(session)?;
        self.inner.store.set(&session_key(&session.id), json).await
    }

    /// Every record under the session prefix, with parse failures kept apart
    async fn load_all(&self) -> Vec<(String, Result<Session, StoreError>)> {
        let keys = match self.inner.store.list_keys(SESSION_PREFIX).await {
            Ok(keys) => keys,
            Err(e) => {
                error!("Error listing sessions: {}", e);
                return Vec::new();
            }
        };

        let mut records = Vec::with_capacity(keys.len());
        for key in keys {
            match self.inner.store.get(&key).await {
                Ok(Some(json)) => {
                    let parsed = serde_json::from_str::<Session>(&json).map_err(StoreError::from);
                    records.push((key, parsed));
                }
                Ok(None) => {}
                Err(e) => error!("Error reading session record {}: {}", key, e),
            }
        }
        records
    }
}

/// Sweep loop; exits once the registry has been dropped
async fn run_sweeper(registry: Weak<RegistryInner>, period: std::time::Duration) {
    let mut tick = interval(period);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately
    tick.tick().await;

    loop {
        tick.tick().await;

        let Some(inner) = registry.upgrade() else {
            break;
        };
        SessionRegistry { inner }.sweep_expired().await;
    }
}
