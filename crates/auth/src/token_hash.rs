//! Argon2id hashing for setup-token plaintext: fixed cost parameters, a
//! fresh random salt per hash, and constant-time verification.

use argon2::Argon2;
use password_hash::{PasswordHasher, SaltString, rand_core::OsRng};

const HASH_LEN: usize = 32;

/// Argon2id parameters, deliberately lighter than an interactive-unlock
/// KDF — this guards short-lived bearer tokens, not a master key, and runs
/// on every setup-token lookup.
fn argon2() -> Argon2<'static> {
    Argon2::default()
}

/// Hashes a setup-token plaintext, returning hex-encoded salt and hash.
pub struct TokenHash {
    pub salt_hex: String,
    pub hash_hex: String,
}

impl TokenHash {
    /// Hashes `plaintext` under a freshly generated random salt.
    pub fn hash(plaintext: &str) -> Self {
        let salt = SaltString::generate(&mut OsRng);
        let mut out = [0u8; HASH_LEN];
        #[allow(clippy::expect_used)]
        argon2()
            .hash_password_into(plaintext.as_bytes(), salt.as_str().as_bytes(), &mut out)
            .expect("argon2id hashing with fixed-size output cannot fail");
        Self {
            salt_hex: to_hex(salt.as_str().as_bytes()),
            hash_hex: to_hex(&out),
        }
    }

    /// Verifies `plaintext` against a stored `(salt_hex, hash_hex)` pair.
    ///
    /// Always performs a full comparison regardless of length mismatch, to
    /// avoid leaking the stored hash length through timing.
    pub fn verify(plaintext: &str, salt_hex: &str, hash_hex: &str) -> bool {
        let (Some(salt), Some(expected)) = (from_hex(salt_hex), from_hex(hash_hex)) else {
            return false;
        };

        let mut computed = [0u8; HASH_LEN];
        if argon2()
            .hash_password_into(plaintext.as_bytes(), &salt, &mut computed)
            .is_err()
        {
            return false;
        }

        constant_time_eq(&computed, &expected)
    }
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn from_hex(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(s.get(i..i + 2)?, 16).ok())
        .collect()
}

/// Constant-time byte comparison. On length mismatch, still scans a
/// dummy buffer of the longer length so the branch taken does not depend on
/// the shorter input's length.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        let dummy = vec![0u8; a.len().max(b.len())];
        let mut diff = 0u8;
        for i in 0..dummy.len() {
            let x = a.get(i).copied().unwrap_or(0);
            let y = dummy.get(i).copied().unwrap_or(0);
            diff |= x ^ y;
        }
        let _ = diff;
        return false;
    }

    let mut diff = 0u8;
    for i in 0..a.len() {
        diff |= a[i] ^ b[i];
    }
    diff == 0
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_correct_plaintext() {
        let TokenHash { salt_hex, hash_hex } = TokenHash::hash("super-secret-setup-token");
        assert!(TokenHash::verify(
            "super-secret-setup-token",
            &salt_hex,
            &hash_hex
        ));
    }

    #[test]
    fn rejects_wrong_plaintext() {
        let TokenHash { salt_hex, hash_hex } = TokenHash::hash("correct-token");
        assert!(!TokenHash::verify("wrong-token", &salt_hex, &hash_hex));
    }

    #[test]
    fn rejects_malformed_hex() {
        assert!(!TokenHash::verify("anything", "not-hex", "also-not-hex"));
    }

    #[test]
    fn salts_differ_across_hashes() {
        let a = TokenHash::hash("same-plaintext");
        let b = TokenHash::hash("same-plaintext");
        assert_ne!(a.salt_hex, b.salt_hex);
        assert_ne!(a.hash_hex, b.hash_hex);
    }
}
