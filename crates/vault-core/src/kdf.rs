//! Key derivation
//!
//! Turns a user secret (password and/or key file) plus the cost parameters
//! stored in the container header into the 32-byte master key. Two
//! memory-hard Argon2 variants are supported, plus an iterated-SHA-256
//! algorithm kept for containers written by older releases.

use std::sync::atomic::{AtomicBool, Ordering};

use argon2::{Algorithm, Argon2, Params, Version};
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{Error, Result};

/// Numeric algorithm ids as written to the container header
pub const KDF_ID_ARGON2D: u32 = 1;
pub const KDF_ID_ARGON2ID: u32 = 2;
pub const KDF_ID_SHA256_ITER: u32 = 3;

const SALT_LEN_MIN: usize = 8;
const SALT_LEN_MAX: usize = 64;
const MEMORY_KIB_MAX: u32 = 1 << 22; // 4 GiB
const PARALLELISM_MAX: u32 = 64;

/// Key derivation algorithm selector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KdfAlgorithm {
    Argon2d,
    Argon2id,
    /// Iterated SHA-256 over `secret || salt`, for older containers
    LegacySha256,
}

impl KdfAlgorithm {
    /// Map a header algorithm id to a known algorithm
    pub fn from_id(id: u32) -> Result<Self> {
        match id {
            KDF_ID_ARGON2D => Ok(Self::Argon2d),
            KDF_ID_ARGON2ID => Ok(Self::Argon2id),
            KDF_ID_SHA256_ITER => Ok(Self::LegacySha256),
            other => Err(Error::UnsupportedKdf(other)),
        }
    }

    pub fn id(self) -> u32 {
        match self {
            Self::Argon2d => KDF_ID_ARGON2D,
            Self::Argon2id => KDF_ID_ARGON2ID,
            Self::LegacySha256 => KDF_ID_SHA256_ITER,
        }
    }

    /// Whether this algorithm uses the memory/parallelism costs
    pub fn is_memory_hard(self) -> bool {
        !matches!(self, Self::LegacySha256)
    }
}

/// Cost parameters stored in (and read back from) the container header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KdfParams {
    pub algorithm: KdfAlgorithm,
    pub salt: Vec<u8>,
    /// Memory cost in KiB (Argon2 only)
    pub memory_kib: u32,
    pub iterations: u32,
    /// Lane count (Argon2 only)
    pub parallelism: u32,
}

impl KdfParams {
    /// Recommended Argon2id parameters with a fresh random salt
    pub fn argon2id_default() -> Self {
        Self {
            algorithm: KdfAlgorithm::Argon2id,
            salt: random_salt(),
            memory_kib: 64 * 1024,
            iterations: 3,
            parallelism: 4,
        }
    }

    /// Legacy iterated-SHA-256 parameters with a fresh random salt
    pub fn legacy_default() -> Self {
        Self {
            algorithm: KdfAlgorithm::LegacySha256,
            salt: random_salt(),
            memory_kib: 0,
            iterations: 600_000,
            parallelism: 1,
        }
    }

    /// Replace the salt ahead of a save so derived keys never repeat
    /// across containers.
    pub fn regenerate_salt(&mut self) {
        self.salt = random_salt();
    }

    /// Check the costs against the algorithm's valid range
    pub fn validate(&self) -> Result<()> {
        if self.salt.len() < SALT_LEN_MIN || self.salt.len() > SALT_LEN_MAX {
            return Err(Error::InvalidParams(format!(
                "salt must be {SALT_LEN_MIN}..={SALT_LEN_MAX} bytes (got {})",
                self.salt.len()
            )));
        }
        if self.iterations == 0 {
            return Err(Error::InvalidParams("iterations must be at least 1".into()));
        }
        if self.algorithm.is_memory_hard() {
            if self.parallelism == 0 || self.parallelism > PARALLELISM_MAX {
                return Err(Error::InvalidParams(format!(
                    "parallelism must be 1..={PARALLELISM_MAX} (got {})",
                    self.parallelism
                )));
            }
            // Argon2 needs at least 8 KiB per lane
            if self.memory_kib < 8 * self.parallelism {
                return Err(Error::InvalidParams(format!(
                    "memory_kib must be at least {} for {} lanes (got {})",
                    8 * self.parallelism,
                    self.parallelism,
                    self.memory_kib
                )));
            }
            if self.memory_kib > MEMORY_KIB_MAX {
                return Err(Error::InvalidParams(format!(
                    "memory_kib must be at most {MEMORY_KIB_MAX} (got {})",
                    self.memory_kib
                )));
            }
        }
        Ok(())
    }
}

fn random_salt() -> Vec<u8> {
    use rand::{rngs::OsRng, RngCore};
    let mut salt = vec![0u8; 32];
    OsRng.fill_bytes(&mut salt);
    salt
}

/// Composite user secret: password and/or key file reduced to 32 bytes
///
/// Each component is hashed on its own, the concatenation is hashed again.
/// Zeroed on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SecretKey {
    composite: [u8; 32],
}

impl SecretKey {
    /// Build a secret from a password only
    pub fn from_password(password: &str) -> Self {
        Self::compose(Some(password.as_bytes()), None)
    }

    /// Build a secret from any combination of password and key file bytes
    pub fn compose(password: Option<&[u8]>, key_file: Option<&[u8]>) -> Self {
        let mut outer = Sha256::new();
        if let Some(pw) = password {
            outer.update(Sha256::digest(pw));
        }
        if let Some(kf) = key_file {
            outer.update(Sha256::digest(kf));
        }
        let mut composite = [0u8; 32];
        composite.copy_from_slice(&outer.finalize());
        Self { composite }
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.composite
    }
}

impl std::fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SecretKey(***)")
    }
}

/// The derived master key. Held only while a decrypt/encrypt operation is
/// in flight; zeroed on drop, never persisted.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct MasterKey {
    bytes: [u8; 32],
}

impl MasterKey {
    pub fn new(bytes: [u8; 32]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.bytes
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MasterKey(***)")
    }
}

/// Derive the master key from a secret and header parameters.
///
/// Deterministic: the same secret and parameters always produce the same
/// key. Nothing is logged or persisted.
pub fn derive(secret: &SecretKey, params: &KdfParams) -> Result<MasterKey> {
    params.validate()?;

    let mut out = [0u8; 32];
    match params.algorithm {
        KdfAlgorithm::Argon2d | KdfAlgorithm::Argon2id => {
            let algorithm = match params.algorithm {
                KdfAlgorithm::Argon2d => Algorithm::Argon2d,
                _ => Algorithm::Argon2id,
            };
            let a2_params = Params::new(
                params.memory_kib,
                params.iterations,
                params.parallelism,
                Some(32),
            )
            .map_err(|e| Error::InvalidParams(e.to_string()))?;
            let argon2 = Argon2::new(algorithm, Version::V0x13, a2_params);
            argon2
                .hash_password_into(secret.as_bytes(), &params.salt, &mut out)
                .map_err(|e| Error::InvalidParams(e.to_string()))?;
        }
        KdfAlgorithm::LegacySha256 => {
            let mut hasher = Sha256::new();
            hasher.update(secret.as_bytes());
            hasher.update(&params.salt);
            let mut digest = hasher.finalize();
            for _ in 1..params.iterations {
                digest = Sha256::digest(digest);
            }
            out.copy_from_slice(&digest);
        }
    }
    Ok(MasterKey::new(out))
}

/// Like [`derive`], but observes a cancellation flag before starting the
/// expensive phase. Once derivation is under way it runs to completion.
pub fn derive_cancellable(
    secret: &SecretKey,
    params: &KdfParams,
    cancel: &AtomicBool,
) -> Result<MasterKey> {
    if cancel.load(Ordering::Relaxed) {
        return Err(Error::Cancelled);
    }
    derive(secret, params)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cheap_argon2id() -> KdfParams {
        KdfParams {
            algorithm: KdfAlgorithm::Argon2id,
            salt: vec![7u8; 16],
            memory_kib: 64,
            iterations: 1,
            parallelism: 1,
        }
    }

    #[test]
    fn argon2_is_deterministic() {
        let secret = SecretKey::from_password("hunter2");
        let params = cheap_argon2id();
        let a = derive(&secret, &params).unwrap();
        let b = derive(&secret, &params).unwrap();
        assert_eq!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn different_salts_yield_different_keys() {
        let secret = SecretKey::from_password("hunter2");
        let mut params = cheap_argon2id();
        let a = derive(&secret, &params).unwrap();
        params.salt = vec![8u8; 16];
        let b = derive(&secret, &params).unwrap();
        assert_ne!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn legacy_sha256_is_deterministic() {
        let secret = SecretKey::from_password("hunter2");
        let params = KdfParams {
            algorithm: KdfAlgorithm::LegacySha256,
            salt: vec![1u8; 16],
            memory_kib: 0,
            iterations: 100,
            parallelism: 1,
        };
        let a = derive(&secret, &params).unwrap();
        let b = derive(&secret, &params).unwrap();
        assert_eq!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn key_file_changes_the_secret() {
        let a = SecretKey::compose(Some(b"pw"), None);
        let b = SecretKey::compose(Some(b"pw"), Some(b"keyfile"));
        assert_ne!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn out_of_range_costs_are_rejected() {
        let secret = SecretKey::from_password("x");
        let mut params = cheap_argon2id();
        params.iterations = 0;
        assert!(matches!(
            derive(&secret, &params),
            Err(Error::InvalidParams(_))
        ));

        let mut params = cheap_argon2id();
        params.memory_kib = 4; // below 8 KiB per lane
        assert!(matches!(
            derive(&secret, &params),
            Err(Error::InvalidParams(_))
        ));

        let mut params = cheap_argon2id();
        params.salt = vec![0u8; 4];
        assert!(matches!(
            derive(&secret, &params),
            Err(Error::InvalidParams(_))
        ));
    }

    #[test]
    fn unknown_algorithm_id_is_rejected() {
        assert!(matches!(
            KdfAlgorithm::from_id(99),
            Err(Error::UnsupportedKdf(99))
        ));
    }

    #[test]
    fn cancellation_flag_is_observed() {
        let secret = SecretKey::from_password("x");
        let params = cheap_argon2id();
        let cancel = AtomicBool::new(true);
        assert!(matches!(
            derive_cancellable(&secret, &params, &cancel),
            Err(Error::Cancelled)
        ));
    }
}
