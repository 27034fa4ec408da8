//! Password hashing — Argon2id with per-user stored parameters.
//!
//! The parameters used at hash time are persisted as JSON next to the hash,
//! and verification always derives with the *stored* parameters, so raising
//! the defaults never breaks records written under the old ones.

use argon2::{Algorithm, Argon2, Params, Version};
use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;

use crate::errors::{ApiError, Result};

const SALT_LEN: usize = 16;
const DEFAULT_TIME_COST: u32 = 3;
const DEFAULT_MEMORY_KIB: u32 = 64 * 1024;
const DEFAULT_PARALLELISM: u32 = 1;
const DEFAULT_KEY_LENGTH: u32 = 32;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KdfParams {
    pub time: u32,
    pub memory: u32,
    pub parallelism: u32,
    pub key_length: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            time: DEFAULT_TIME_COST,
            memory: DEFAULT_MEMORY_KIB,
            parallelism: DEFAULT_PARALLELISM,
            key_length: DEFAULT_KEY_LENGTH,
        }
    }
}

/// Stored form of a hashed password: base64 hash, raw salt bytes, and the
/// parameters that produced the hash.
#[derive(Debug, Clone)]
pub struct PasswordHash {
    pub hash: String,
    pub salt: Vec<u8>,
    pub params: KdfParams,
}

pub fn hash_password(password: &str) -> Result<PasswordHash> {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);

    let params = KdfParams::default();
    let key = derive(password.as_bytes(), &salt, &params)?;

    Ok(PasswordHash {
        hash: STANDARD_NO_PAD.encode(key),
        salt: salt.to_vec(),
        params,
    })
}

/// Constant-time verification against a stored hash. Derives with the stored
/// parameters and the stored key length, not the current defaults.
pub fn verify_password(
    password: &str,
    stored_hash: &str,
    salt: &[u8],
    params: &KdfParams,
) -> Result<bool> {
    let expected = STANDARD_NO_PAD
        .decode(stored_hash)
        .map_err(|_| ApiError::Internal("corrupt stored password hash".to_string()))?;

    let mut params = params.clone();
    params.key_length = expected.len() as u32;
    let key = derive(password.as_bytes(), salt, &params)?;

    Ok(bool::from(key.as_slice().ct_eq(expected.as_slice())))
}

fn derive(password: &[u8], salt: &[u8], params: &KdfParams) -> Result<Vec<u8>> {
    let argon_params = Params::new(
        params.memory,
        params.time,
        params.parallelism,
        Some(params.key_length as usize),
    )
    .map_err(|e| ApiError::Internal(format!("invalid KDF parameters: {e}")))?;

    let argon = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon_params);
    let mut out = vec![0u8; params.key_length as usize];
    argon
        .hash_password_into(password, salt, &mut out)
        .map_err(|e| ApiError::Internal(format!("KDF failure: {e}")))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_and_verify_round_trip() {
        let stored = hash_password("correct horse battery staple").unwrap();
        assert_eq!(stored.salt.len(), SALT_LEN);

        let ok = verify_password(
            "correct horse battery staple",
            &stored.hash,
            &stored.salt,
            &stored.params,
        )
        .unwrap();
        assert!(ok);
    }

    #[test]
    fn wrong_password_rejected() {
        let stored = hash_password("hunter2hunter2").unwrap();
        let ok = verify_password("hunter3hunter3", &stored.hash, &stored.salt, &stored.params)
            .unwrap();
        assert!(!ok);
    }

    #[test]
    fn verifies_records_written_under_older_params() {
        // Simulate a record hashed before the defaults changed: weaker cost
        // settings and a shorter derived key.
        let legacy = KdfParams {
            time: 1,
            memory: 8 * 1024,
            parallelism: 1,
            key_length: 16,
        };
        let salt = [7u8; SALT_LEN];
        let key = derive(b"old-password", &salt, &legacy).unwrap();
        let stored_hash = STANDARD_NO_PAD.encode(key);

        let ok = verify_password("old-password", &stored_hash, &salt, &legacy).unwrap();
        assert!(ok);
        let ok = verify_password("new-password", &stored_hash, &salt, &legacy).unwrap();
        assert!(!ok);
    }

    #[test]
    fn salts_are_unique_per_hash() {
        let a = hash_password("same password").unwrap();
        let b = hash_password("same password").unwrap();
        assert_ne!(a.salt, b.salt);
        assert_ne!(a.hash, b.hash);
    }
}
