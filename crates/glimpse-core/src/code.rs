//! Session codes
//!
//! Provides:
//! - Session code generation (pronounceable consonant/vowel/digit pattern)
//! - Display formatting (`XXXX-XXXX`) and parsing
//! - Share link construction and extraction

use url::Url;

/// Length of a session code in characters (without dashes)
pub const SESSION_ID_LENGTH: usize = 8;

/// Consonants used in session codes
const CONSONANTS: &[u8] = b"BCDFGHJKLMNPQRSTVWXYZ";

/// Vowels used in session codes
const VOWELS: &[u8] = b"AEIOU";

/// Digits used in session codes (0 and 1 are excluded, they read as O and I)
const DIGITS: &[u8] = b"23456789";

/// Character class of every position: C V D C V C D V
const PATTERN: [&[u8]; SESSION_ID_LENGTH] = [
    CONSONANTS, VOWELS, DIGITS, CONSONANTS, VOWELS, CONSONANTS, DIGITS, VOWELS,
];

/// Base URL for share links
pub const DEFAULT_SHARE_BASE_URL: &str = "https://glimpse.live/";

/// Generate a random session code (e.g., "BA7ZUM4E")
///
/// # Panics
/// Panics if the system random number generator fails (extremely rare).
/// Use `try_generate_session_id` if you need to handle this case.
pub fn generate_session_id() -> String {
    try_generate_session_id().expect("RNG failed - system entropy source unavailable")
}

/// Try to generate a random session code, returning an error if RNG fails
pub fn try_generate_session_id() -> Result<String, getrandom::Error> {
    let mut bytes = [0u8; SESSION_ID_LENGTH];
    getrandom::getrandom(&mut bytes)?;

    Ok(bytes
        .iter()
        .zip(PATTERN.iter())
        .map(|(b, class)| class[(*b as usize) % class.len()] as char)
        .collect())
}

/// Generate an opaque peer identifier (e.g., "viewer_3fa2c81b09d4")
pub fn generate_peer_id(prefix: &str) -> String {
    let mut bytes = [0u8; 6];
    if getrandom::getrandom(&mut bytes).is_err() {
        // Uniqueness only needs to hold within one session
        let nanos = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
        bytes.copy_from_slice(&nanos.to_le_bytes()[..6]);
    }
    format!("{}_{}", prefix, hex::encode(bytes))
}

/// Normalize user input into a session code (strip dashes and whitespace, uppercase)
pub fn parse_session_id(input: &str) -> String {
    input
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '-')
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

/// Check that a parsed code is 8 uppercase alphanumerics
pub fn validate_session_id(id: &str) -> bool {
    id.len() == SESSION_ID_LENGTH
        && id
            .bytes()
            .all(|b| b.is_ascii_uppercase() || b.is_ascii_digit())
}

/// Check that a code follows the generated consonant/vowel/digit pattern exactly
pub fn matches_code_pattern(id: &str) -> bool {
    id.len() == SESSION_ID_LENGTH
        && id
            .bytes()
            .zip(PATTERN.iter())
            .all(|(b, class)| class.contains(&b))
}

/// Format a code for display ("BA7ZUM4E" -> "BA7Z-UM4E"); other lengths pass through
pub fn format_session_id(id: &str) -> String {
    if id.len() == SESSION_ID_LENGTH && id.is_ascii() {
        format!("{}-{}", &id[..4], &id[4..])
    } else {
        id.to_string()
    }
}

/// Build a share link for a session code
pub fn make_share_link(base_url: &str, session_id: &str) -> String {
    let id = parse_session_id(session_id);
    match Url::parse(base_url) {
        Ok(mut url) => {
            url.query_pairs_mut().clear().append_pair("join", &id);
            url.to_string()
        }
        Err(_) => format!("{}?join={}", base_url, id),
    }
}

/// Extract a session code from a link, or normalize the input if it is already a code
///
/// Handles formats:
/// - `BA7Z-UM4E` / `ba7zum4e` (plain code)
/// - `https://glimpse.live/?join=BA7ZUM4E` (share link)
/// - `https://glimpse.live/j/BA7Z-UM4E` (short link)
pub fn extract_session_id(input: &str) -> Option<String> {
    let input = input.trim();

    if input.starts_with("http://") || input.starts_with("https://") {
        let url = Url::parse(input).ok()?;

        if let Some((_, code)) = url.query_pairs().find(|(k, _)| k == "join") {
            let id = parse_session_id(&code);
            return validate_session_id(&id).then_some(id);
        }

        let segments: Vec<&str> = url.path_segments()?.collect();
        let code = segments
            .windows(2)
            .find(|w| w[0] == "j" || w[0] == "join")
            .map(|w| w[1])?;
        let id = parse_session_id(code);
        return validate_session_id(&id).then_some(id);
    }

    let id = parse_session_id(input);
    validate_session_id(&id).then_some(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_id_generation() {
        for _ in 0..200 {
            let id = generate_session_id();
            assert_eq!(id.len(), SESSION_ID_LENGTH);
            assert!(matches_code_pattern(&id), "bad pattern: {}", id);
            assert!(validate_session_id(&id));
            assert_eq!(parse_session_id(&format_session_id(&id)), id);
        }
    }

    #[test]
    fn test_generated_ids_avoid_ambiguous_chars() {
        for _ in 0..200 {
            let id = generate_session_id();
            assert!(!id.contains(['0', '1', 'O', 'I']), "ambiguous char in {}", id);
        }
    }

    #[test]
    fn test_parse_session_id() {
        assert_eq!(parse_session_id("k7xm-p2qb"), "K7XMP2QB");
        assert_eq!(parse_session_id("K7XM P2QB"), "K7XMP2QB");
        assert_eq!(parse_session_id("  k-7-x-m-p-2-q-b "), "K7XMP2QB");
    }

    #[test]
    fn test_validate_session_id() {
        assert!(validate_session_id("K7XMP2QB"));
        assert!(validate_session_id("ABCDEFGH"));
        assert!(validate_session_id("12345678"));

        assert!(!validate_session_id("K7XMP2Q")); // too short
        assert!(!validate_session_id("K7XMP2QBA")); // too long
        assert!(!validate_session_id("k7xmp2qb")); // not parsed
        assert!(!validate_session_id("K7XM-P2Q")); // dash
        assert!(!validate_session_id(""));
    }

    #[test]
    fn test_code_pattern() {
        assert!(matches_code_pattern("BA7ZUM4E"));
        assert!(!matches_code_pattern("AA7ZUM4E")); // vowel in consonant slot
        assert!(!matches_code_pattern("BA1ZUM4E")); // excluded digit
        assert!(!matches_code_pattern("BA7ZUMAE")); // letter in digit slot
    }

    #[test]
    fn test_format_session_id() {
        assert_eq!(format_session_id("K7XMP2QB"), "K7XM-P2QB");
        assert_eq!(format_session_id("ABC"), "ABC");
        assert_eq!(format_session_id("ABCDEFGHI"), "ABCDEFGHI");
        assert_eq!(format_session_id(""), "");
    }

    #[test]
    fn test_generate_peer_id() {
        let a = generate_peer_id("viewer");
        let b = generate_peer_id("viewer");
        assert!(a.starts_with("viewer_"));
        assert_eq!(a.len(), "viewer_".len() + 12);
        assert_ne!(a, b);
    }

    #[test]
    fn test_make_share_link() {
        assert_eq!(
            make_share_link("https://glimpse.live/", "ba7z-um4e"),
            "https://glimpse.live/?join=BA7ZUM4E"
        );
    }

    #[test]
    fn test_extract_session_id() {
        assert_eq!(extract_session_id("BA7Z-UM4E"), Some("BA7ZUM4E".into()));
        assert_eq!(extract_session_id(" ba7zum4e "), Some("BA7ZUM4E".into()));
        assert_eq!(
            extract_session_id("https://glimpse.live/?join=BA7ZUM4E"),
            Some("BA7ZUM4E".into())
        );
        assert_eq!(
            extract_session_id("https://example.com/watch?foo=1&join=ba7z-um4e"),
            Some("BA7ZUM4E".into())
        );
        assert_eq!(
            extract_session_id("https://glimpse.live/j/BA7Z-UM4E"),
            Some("BA7ZUM4E".into())
        );
    }

    #[test]
    fn test_extract_session_id_invalid() {
        assert_eq!(extract_session_id(""), None);
        assert_eq!(extract_session_id("ABC"), None);
        assert_eq!(extract_session_id("https://glimpse.live/"), None);
        assert_eq!(extract_session_id("https://glimpse.live/?join=XY"), None);
        assert_eq!(extract_session_id("random text"), None);
    }
}
