//! Code and secret generation for Driftway
//!
//! Provides:
//! - Room secret generation (long-lived private room identifiers)
//! - Pair key generation (short numeric pairing codes)
//! - Public room code generation
//! - Salted SHA-512 digests for identifiers shown to clients

use sha2::{Digest, Sha512};

/// Length of a freshly generated room secret
pub const ROOM_SECRET_LENGTH: usize = 256;

/// Shortest room secret a client may join with
pub const ROOM_SECRET_MIN_LENGTH: usize = 64;

/// Length of a pair key in digits
pub const PAIR_KEY_LENGTH: usize = 5;

/// Length of a public room code
pub const PUBLIC_ROOM_ID_LENGTH: usize = 5;

/// Salt mixed into peer id digests
pub const PEER_ID_SALT: &str = "driftway";

const ALPHANUMERIC: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
const DIGITS: &[u8] = b"0123456789";
const LOWER_ALPHANUMERIC: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Draw `length` characters uniformly-ish from `charset` using the OS RNG
pub fn try_random_string(length: usize, charset: &[u8]) -> Result<String, getrandom::Error> {
    let mut bytes = vec![0u8; length];
    getrandom::fill(&mut bytes)?;

    Ok(bytes
        .iter()
        .map(|b| charset[(*b as usize) % charset.len()] as char)
        .collect())
}

/// Generate a 256 character alphanumeric room secret
pub fn generate_room_secret() -> Result<String, getrandom::Error> {
    try_random_string(ROOM_SECRET_LENGTH, ALPHANUMERIC)
}

/// Generate a 5 digit pair key (leading zeros allowed, e.g. "04217")
pub fn generate_pair_key() -> Result<String, getrandom::Error> {
    try_random_string(PAIR_KEY_LENGTH, DIGITS)
}

/// Generate a 5 character lowercase public room code (e.g. "k3x9a")
pub fn generate_public_room_id() -> Result<String, getrandom::Error> {
    try_random_string(PUBLIC_ROOM_ID_LENGTH, LOWER_ALPHANUMERIC)
}

/// Check that a client-supplied secret may name a secret room
///
/// Secrets must be 64 to 256 ASCII characters.
pub fn is_valid_room_secret(secret: &str) -> bool {
    secret.is_ascii() && (ROOM_SECRET_MIN_LENGTH..=ROOM_SECRET_LENGTH).contains(&secret.len())
}

/// Hex encoded SHA-512 of `value` followed by `salt`
pub fn salted_hash(value: &str, salt: &str) -> String {
    let mut hasher = Sha512::new();
    hasher.update(value.as_bytes());
    hasher.update(salt.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_room_secret_generation() {
        let secret = generate_room_secret().unwrap();
        assert_eq!(secret.len(), ROOM_SECRET_LENGTH);
        assert!(secret.bytes().all(|b| b.is_ascii_alphanumeric()));
        assert!(is_valid_room_secret(&secret));
        assert_ne!(secret, generate_room_secret().unwrap());
    }

    #[test]
    fn test_pair_key_generation() {
        for _ in 0..100 {
            let key = generate_pair_key().unwrap();
            assert_eq!(key.len(), PAIR_KEY_LENGTH);
            assert!(key.bytes().all(|b| b.is_ascii_digit()));
        }
    }

    #[test]
    fn test_public_room_id_generation() {
        let id = generate_public_room_id().unwrap();
        assert_eq!(id.len(), PUBLIC_ROOM_ID_LENGTH);
        assert!(id
            .bytes()
            .all(|b| b.is_ascii_digit() || b.is_ascii_lowercase()));
    }

    #[test]
    fn test_room_secret_validation() {
        assert!(is_valid_room_secret(&"a".repeat(64)));
        assert!(is_valid_room_secret(&"a".repeat(256)));

        // Too short / too long
        assert!(!is_valid_room_secret(&"a".repeat(63)));
        assert!(!is_valid_room_secret(&"a".repeat(257)));

        // Non-ASCII
        let mut secret = "a".repeat(70);
        secret.push('é');
        assert!(!is_valid_room_secret(&secret));
    }

    #[test]
    fn test_salted_hash() {
        let a = salted_hash("peer", PEER_ID_SALT);
        let b = salted_hash("peer", PEER_ID_SALT);
        let c = salted_hash("peer", "other");

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 128); // 64 bytes = 128 hex chars
    }
}
