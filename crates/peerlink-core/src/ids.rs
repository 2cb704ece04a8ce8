//! Identifier generation for sessions, host tokens, and transfers
//!
//! Session IDs are short and uppercase so they can be read aloud or typed.
//! Host tokens and transfer IDs are opaque and never shown to people.

/// Length of a session ID in characters
pub const SESSION_ID_LENGTH: usize = 12;

/// Characters used in session IDs
const SESSION_ID_CHARS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Characters used in opaque tokens (URL-safe)
const TOKEN_CHARS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789_-";

/// Length of a host token
pub const HOST_TOKEN_LENGTH: usize = 21;

/// Length of a transfer ID
pub const TRANSFER_ID_LENGTH: usize = 16;

/// Generate a random session ID (e.g., "K3Q9ZP2M7XTA")
pub fn generate_session_id() -> Result<String, getrandom::Error> {
    random_string(SESSION_ID_LENGTH, SESSION_ID_CHARS)
}

/// Generate an opaque token identifying the party that created a session
pub fn generate_host_token() -> Result<String, getrandom::Error> {
    random_string(HOST_TOKEN_LENGTH, TOKEN_CHARS)
}

/// Generate an ID for a file transfer
pub fn generate_transfer_id() -> Result<String, getrandom::Error> {
    random_string(TRANSFER_ID_LENGTH, TOKEN_CHARS)
}

/// Normalize a session ID (trim whitespace, uppercase)
pub fn normalize_session_id(id: &str) -> String {
    id.chars()
        .filter(|c| !c.is_whitespace())
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

/// Validate a session ID format
pub fn validate_session_id(id: &str) -> bool {
    id.len() == SESSION_ID_LENGTH && id.bytes().all(|b| SESSION_ID_CHARS.contains(&b))
}

fn random_string(len: usize, alphabet: &[u8]) -> Result<String, getrandom::Error> {
    // Rejection sampling keeps the distribution uniform
    let limit = 256 - (256 % alphabet.len());
    let mut out = String::with_capacity(len);
    let mut buf = [0u8; 32];

    while out.len() < len {
        getrandom::getrandom(&mut buf)?;
        for b in buf {
            if (b as usize) < limit {
                out.push(alphabet[(b as usize) % alphabet.len()] as char);
                if out.len() == len {
                    break;
                }
            }
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_id_generation() {
        let id = generate_session_id().unwrap();
        assert_eq!(id.len(), SESSION_ID_LENGTH);
        assert!(validate_session_id(&id));
        assert_eq!(id, id.to_ascii_uppercase());
    }

    #[test]
    fn test_session_ids_differ() {
        let a = generate_session_id().unwrap();
        let b = generate_session_id().unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_session_id_normalization() {
        assert_eq!(normalize_session_id(" abcd1234efgh "), "ABCD1234EFGH");
        assert!(validate_session_id(&normalize_session_id("abcd1234efgh")));
    }

    #[test]
    fn test_session_id_validation() {
        assert!(validate_session_id("ABCD1234EFGH"));
        assert!(!validate_session_id("ABCD1234EFG"));
        assert!(!validate_session_id("ABCD1234EFGH2"));
        assert!(!validate_session_id("abcd1234efgh"));
        assert!(!validate_session_id("ABCD-1234-EF"));
    }

    #[test]
    fn test_tokens_use_url_safe_alphabet() {
        let token = generate_host_token().unwrap();
        assert_eq!(token.len(), HOST_TOKEN_LENGTH);
        assert!(token.bytes().all(|b| TOKEN_CHARS.contains(&b)));

        let transfer = generate_transfer_id().unwrap();
        assert_eq!(transfer.len(), TRANSFER_ID_LENGTH);
    }
}
