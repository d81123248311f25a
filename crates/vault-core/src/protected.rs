//! In-memory protected values
//!
//! A protected value is kept ChaCha20-enciphered in memory under a random
//! per-value key and only decrypted on demand. The revealed form is zeroed
//! on drop. This narrows the window during which a password sits in
//! process memory as plaintext; it is not a defense against a debugger.

use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::ChaCha20;
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// A field value kept enciphered between uses
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct ProtectedValue {
    ciphertext: Vec<u8>,
    key: [u8; 32],
    nonce: [u8; 12],
}

impl ProtectedValue {
    /// Protect a plaintext value under a fresh random key and nonce
    pub fn new(plaintext: &[u8]) -> Self {
        let mut key = [0u8; 32];
        let mut nonce = [0u8; 12];
        OsRng.fill_bytes(&mut key);
        OsRng.fill_bytes(&mut nonce);

        let mut ciphertext = plaintext.to_vec();
        let mut cipher = ChaCha20::new(&key.into(), &nonce.into());
        cipher.apply_keystream(&mut ciphertext);

        Self {
            ciphertext,
            key,
            nonce,
        }
    }

    /// Protect a UTF-8 string
    pub fn from_str(plaintext: &str) -> Self {
        Self::new(plaintext.as_bytes())
    }

    /// Decrypt into a short-lived buffer that zeroes itself on drop
    pub fn reveal(&self) -> RevealedValue {
        let mut plaintext = self.ciphertext.clone();
        let mut cipher = ChaCha20::new(&self.key.into(), &self.nonce.into());
        cipher.apply_keystream(&mut plaintext);
        RevealedValue(plaintext)
    }

    pub fn len(&self) -> usize {
        self.ciphertext.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ciphertext.is_empty()
    }
}

impl PartialEq for ProtectedValue {
    fn eq(&self, other: &Self) -> bool {
        // length leaks through ct_eq anyway; compare plaintext in constant time
        self.reveal()
            .as_bytes()
            .ct_eq(other.reveal().as_bytes())
            .into()
    }
}

impl Eq for ProtectedValue {}

impl std::fmt::Debug for ProtectedValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ProtectedValue(***)")
    }
}

// Serialized transparently so UI layers exporting entries as JSON see the
// value; the on-disk codec never goes through serde for these.
impl Serialize for ProtectedValue {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let revealed = self.reveal();
        match std::str::from_utf8(revealed.as_bytes()) {
            Ok(s) => serializer.serialize_str(s),
            Err(_) => serializer.serialize_bytes(revealed.as_bytes()),
        }
    }
}

impl<'de> Deserialize<'de> for ProtectedValue {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(ProtectedValue::from_str(&s))
    }
}

/// Plaintext of a protected value, zeroed on drop
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct RevealedValue(Vec<u8>);

impl RevealedValue {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// View as UTF-8 if the value is text
    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.0).ok()
    }
}

impl std::fmt::Debug for RevealedValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RevealedValue(***)")
    }
}
