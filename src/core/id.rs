use rand::Rng;

/// Length of a generated container ID in hex characters.
const ID_LEN: usize = 16;
/// Longest ID accepted from an external factory.
const MAX_ID_LEN: usize = 64;

/// Generate a random hex container ID (16 hex chars = 8 random bytes).
///
/// Factories may supply their own IDs; this is the default scheme.
pub fn generate_id() -> String {
    let mut rng = rand::thread_rng();
    let bytes: Vec<u8> = (0..ID_LEN / 2).map(|_| rng.gen()).collect();
    hex_encode(&bytes)
}

/// Encode bytes as a lowercase hex string.
fn hex_encode(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        s.push_str(&format!("{b:02x}"));
    }
    s
}

/// Validate a container ID supplied by a factory. IDs become directory
/// names, so path separators and relative components are rejected.
pub fn validate_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_ID_LEN
        && !id.starts_with('.')
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_id_has_correct_length() {
        let id = generate_id();
        assert_eq!(id.len(), ID_LEN);
    }

    #[test]
    fn generated_id_is_lowercase_hex() {
        let id = generate_id();
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(id, id.to_lowercase());
    }

    #[test]
    fn generated_id_is_valid() {
        assert!(validate_id(&generate_id()));
    }

    #[test]
    fn validate_accepts_reasonable_ids() {
        assert!(validate_id("ab12"));
        assert!(validate_id("web-frontend_2"));
        assert!(validate_id("c1.staging"));
    }

    #[test]
    fn validate_rejects_path_like_ids() {
        assert!(!validate_id(""));
        assert!(!validate_id("a/b"));
        assert!(!validate_id(".."));
        assert!(!validate_id(".hidden"));
        assert!(!validate_id(&"x".repeat(65)));
    }
}
