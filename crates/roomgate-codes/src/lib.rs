//! Attendance code generation and salted hashing.
//!
//! Codes are short-lived 4-digit secrets delivered out of band (e-mail).
//! Only the salted SHA-256 digest is ever persisted; the plaintext exists
//! in memory between generation and delivery and nowhere else.

use rand::{Rng, RngCore};
use sha2::{Digest, Sha256};

/// Length of an attendance code, in decimal digits.
pub const CODE_LEN: usize = 4;

const CODE_SPACE: u32 = 10_000;

/// Generate a cryptographically secure 4-digit attendance code.
///
/// Returns a string of exactly 4 digits (0000-9999), left-zero-padded.
/// Randomness failure is unrecoverable and panics rather than degrading
/// to a predictable source.
pub fn generate_code() -> String {
    let mut rng = rand::rng();
    let code: u32 = rng.random_range(0..CODE_SPACE);
    format!("{:04}", code)
}

/// Generate a random 16-byte salt, hex-encoded (32 chars).
pub fn generate_salt() -> String {
    let mut bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Hash a code with its salt: hex SHA-256 of `salt ++ code`.
///
/// Deterministic for fixed inputs, so verification recomputes and compares
/// digests instead of ever storing the code.
pub fn hash_code(code: &str, salt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(code.as_bytes());
    hex::encode(hasher.finalize())
}

/// Verify a submitted code against the stored digest and salt.
///
/// Comparison is constant-time over the recomputed digest. The 4-digit
/// space makes attempt-rate limiting the real defense; constant-time
/// comparison just avoids handing out a free side channel.
pub fn verify_code(submitted: &str, stored_hash: &str, stored_salt: &str) -> bool {
    let computed = hash_code(submitted, stored_salt);
    subtle::ConstantTimeEq::ct_eq(computed.as_bytes(), stored_hash.as_bytes()).into()
}

/// Check that a submitted string is exactly 4 ASCII digits.
///
/// Malformed input is rejected by callers before any attempt budget is
/// spent on it.
pub fn is_valid_code_format(s: &str) -> bool {
    s.len() == CODE_LEN && s.chars().all(|c| c.is_ascii_digit())
}
