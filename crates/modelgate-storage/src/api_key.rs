// API key generation and verification
// Decision: 40-char alphanumeric tokens; the first 8 chars are the indexed
//           lookup prefix, the full token is stored only as an argon2 hash

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use rand::Rng;

const API_KEY_LENGTH: usize = 40;
pub const API_KEY_PREFIX_LENGTH: usize = 8;

/// Generated API key (full token shown only at creation)
#[derive(Debug)]
pub struct GeneratedApiKey {
    /// Full token, returned to the caller exactly once
    pub token: String,
    /// Argon2 hash for database storage
    pub hash: String,
    /// First 8 chars, the indexed lookup key
    pub prefix: String,
}

/// Generate a new API key with its storage hash
pub fn generate_api_key() -> anyhow::Result<GeneratedApiKey> {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    let token: String = (0..API_KEY_LENGTH)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect();

    let prefix = token[..API_KEY_PREFIX_LENGTH].to_string();
    let hash = hash_api_key(&token)?;

    Ok(GeneratedApiKey { token, hash, prefix })
}

/// Hash a raw token for storage
pub fn hash_api_key(token: &str) -> anyhow::Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(token.as_bytes(), &salt)
        .map_err(|e| anyhow::anyhow!("hash failure: {e}"))?;
    Ok(hash.to_string())
}

/// Verify a raw token against a stored hash
pub fn verify_api_key(token: &str, stored_hash: &str) -> bool {
    match PasswordHash::new(stored_hash) {
        Ok(parsed) => Argon2::default()
            .verify_password(token.as_bytes(), &parsed)
            .is_ok(),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_key_verifies_against_its_hash() {
        let key = generate_api_key().unwrap();
        assert_eq!(key.token.len(), API_KEY_LENGTH);
        assert_eq!(key.prefix.len(), API_KEY_PREFIX_LENGTH);
        assert!(key.token.starts_with(&key.prefix));
        assert!(verify_api_key(&key.token, &key.hash));
    }

    #[test]
    fn wrong_token_fails_verification() {
        let key = generate_api_key().unwrap();
        assert!(!verify_api_key("definitely-not-the-token-aaaaaaaaaaaaaaa", &key.hash));
    }

    #[test]
    fn keys_are_unique() {
        let a = generate_api_key().unwrap();
        let b = generate_api_key().unwrap();
        assert_ne!(a.token, b.token);
        assert_ne!(a.hash, b.hash);
    }

    #[test]
    fn garbage_hash_never_verifies() {
        assert!(!verify_api_key("whatever", "not-a-phc-string"));
    }
}
