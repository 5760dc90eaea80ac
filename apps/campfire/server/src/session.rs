use rand::{distributions::Alphanumeric, Rng};
use sha2::{Digest, Sha256};

/// Canonical form of a passphrase: trimmed, lowercased. Join codes are
/// issued uppercase but accepted in any case.
pub fn normalize_passphrase(raw: &str) -> String {
    raw.trim().to_ascii_lowercase()
}

/// Hash a normalized passphrase using SHA-256.
pub fn hash_passphrase(passphrase: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(passphrase.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Verify if a passphrase matches a hash.
pub fn verify_passphrase(passphrase: &str, hash: &str) -> bool {
    hash_passphrase(passphrase) == hash
}

/// Generate a six-character join code for rooms created without a
/// passphrase.
pub fn generate_join_code() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .map(|c| char::from(c).to_ascii_uppercase())
        .take(6)
        .collect()
}
