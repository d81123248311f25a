//! Cipher engine
//!
//! Streaming encryption/decryption of the container body with per-block
//! integrity. The body is chunked into an HMAC block stream: every block
//! carries an HMAC-SHA256 over its index, length and ciphertext, keyed by
//! a per-index key. The header itself is MACed under the reserved index
//! `u64::MAX`, which is what makes a wrong secret detectable before any
//! body bytes are decrypted.

use aes::Aes256;
use byteorder::{ByteOrder, LittleEndian};
use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::ChaCha20;
use cipher::block_padding::Pkcs7;
use cipher::{BlockDecryptMut, BlockEncryptMut};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256, Sha512};
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{Error, Result};
use crate::kdf::MasterKey;

type HmacSha256 = Hmac<Sha256>;
type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// Numeric cipher ids as written to the container header
pub const CIPHER_ID_AES256_CBC: u32 = 1;
pub const CIPHER_ID_CHACHA20: u32 = 2;

/// Block size of the HMAC block stream
const STREAM_BLOCK_SIZE: usize = 1 << 20;

/// Body cipher selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CipherAlgorithm {
    #[default]
    Aes256Cbc,
    ChaCha20,
}

impl CipherAlgorithm {
    /// Map a header cipher id to a known cipher
    pub fn from_id(id: u32) -> Result<Self> {
        match id {
            CIPHER_ID_AES256_CBC => Ok(Self::Aes256Cbc),
            CIPHER_ID_CHACHA20 => Ok(Self::ChaCha20),
            other => Err(Error::UnsupportedCipher(other)),
        }
    }

    pub fn id(self) -> u32 {
        match self {
            Self::Aes256Cbc => CIPHER_ID_AES256_CBC,
            Self::ChaCha20 => CIPHER_ID_CHACHA20,
        }
    }

    /// IV/nonce length the cipher expects
    pub fn iv_len(self) -> usize {
        match self {
            Self::Aes256Cbc => 16,
            Self::ChaCha20 => 12,
        }
    }
}

/// Keys expanded from the master seed and the derived master key.
/// Zeroed on drop; never cached beyond the operation in flight.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct KeySchedule {
    cipher_key: [u8; 32],
    hmac_key: [u8; 64],
}

impl KeySchedule {
    /// cipher key = SHA-256(seed || master key),
    /// hmac key   = SHA-512(seed || master key || 0x01)
    pub fn new(master_seed: &[u8; 32], master_key: &MasterKey) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(master_seed);
        hasher.update(master_key.as_bytes());
        let mut cipher_key = [0u8; 32];
        cipher_key.copy_from_slice(&hasher.finalize());

        let mut hasher = Sha512::new();
        hasher.update(master_seed);
        hasher.update(master_key.as_bytes());
        hasher.update([0x01]);
        let mut hmac_key = [0u8; 64];
        hmac_key.copy_from_slice(&hasher.finalize());

        Self {
            cipher_key,
            hmac_key,
        }
    }

    /// MAC over the raw header bytes, under the reserved block index
    pub fn header_mac(&self, header_bytes: &[u8]) -> Result<[u8; 32]> {
        block_mac(u64::MAX, &self.hmac_key, None, header_bytes)
    }

    /// Verify the stored header MAC in constant time
    pub fn verify_header_mac(&self, header_bytes: &[u8], stored: &[u8]) -> Result<()> {
        let computed = self.header_mac(header_bytes)?;
        if computed.ct_eq(stored).into() {
            Ok(())
        } else {
            Err(Error::AuthenticationFailed)
        }
    }
}

impl std::fmt::Debug for KeySchedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "KeySchedule(***)")
    }
}

/// Per-index block key: SHA-512(index || hmac key)
fn block_key(block_index: u64, hmac_key: &[u8; 64]) -> [u8; 64] {
    let mut hasher = Sha512::new();
    hasher.update(block_index.to_le_bytes());
    hasher.update(hmac_key);
    let mut key = [0u8; 64];
    key.copy_from_slice(&hasher.finalize());
    key
}

fn block_mac(
    block_index: u64,
    hmac_key: &[u8; 64],
    length: Option<u32>,
    data: &[u8],
) -> Result<[u8; 32]> {
    let key = block_key(block_index, hmac_key);
    let mut mac =
        HmacSha256::new_from_slice(&key).map_err(|_| Error::AuthenticationFailed)?;
    if let Some(len) = length {
        mac.update(&block_index.to_le_bytes());
        mac.update(&len.to_le_bytes());
    }
    mac.update(data);
    let mut out = [0u8; 32];
    out.copy_from_slice(&mac.finalize().into_bytes());
    Ok(out)
}

/// Encrypt a plaintext body and wrap it in an HMAC block stream.
///
/// Every save must arrive here with a fresh IV and master seed; nonce
/// reuse under the same key breaks the stream-cipher mode completely.
pub fn encrypt_stream(
    plaintext: &[u8],
    schedule: &KeySchedule,
    cipher: CipherAlgorithm,
    iv: &[u8],
) -> Result<Vec<u8>> {
    let ciphertext = encrypt_raw(plaintext, &schedule.cipher_key, cipher, iv)?;
    write_block_stream(&ciphertext, &schedule.hmac_key)
}

/// Verify and unwrap an HMAC block stream, then decrypt it.
///
/// Any MAC mismatch anywhere in the stream aborts with
/// [`Error::AuthenticationFailed`]; no partially-decrypted plaintext is
/// ever returned.
pub fn decrypt_stream(
    data: &[u8],
    schedule: &KeySchedule,
    cipher: CipherAlgorithm,
    iv: &[u8],
) -> Result<Vec<u8>> {
    let ciphertext = read_block_stream(data, &schedule.hmac_key)?;
    decrypt_raw(&ciphertext, &schedule.cipher_key, cipher, iv)
}

fn write_block_stream(data: &[u8], hmac_key: &[u8; 64]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(data.len() + 64);
    let mut block_index: u64 = 0;

    for chunk in data.chunks(STREAM_BLOCK_SIZE) {
        let mac = block_mac(block_index, hmac_key, Some(chunk.len() as u32), chunk)?;
        out.extend_from_slice(&mac);
        let mut len = [0u8; 4];
        LittleEndian::write_u32(&mut len, chunk.len() as u32);
        out.extend_from_slice(&len);
        out.extend_from_slice(chunk);
        block_index += 1;
    }

    // terminator: MAC over an empty block, zero length
    let mac = block_mac(block_index, hmac_key, Some(0), &[])?;
    out.extend_from_slice(&mac);
    out.extend_from_slice(&[0u8; 4]);
    Ok(out)
}

fn read_block_stream(data: &[u8], hmac_key: &[u8; 64]) -> Result<Vec<u8>> {
    let mut result = Vec::new();
    let mut pos = 0;
    let mut block_index: u64 = 0;

    loop {
        if pos + 36 > data.len() {
            return Err(Error::AuthenticationFailed);
        }

        let stored_mac = &data[pos..pos + 32];
        pos += 32;
        let block_size = LittleEndian::read_u32(&data[pos..pos + 4]) as usize;
        pos += 4;

        if pos + block_size > data.len() {
            return Err(Error::AuthenticationFailed);
        }
        let block_data = &data[pos..pos + block_size];
        pos += block_size;

        let computed = block_mac(block_index, hmac_key, Some(block_size as u32), block_data)?;
        if !bool::from(computed.ct_eq(stored_mac)) {
            return Err(Error::AuthenticationFailed);
        }

        if block_size == 0 {
            // nothing may follow the terminator block
            if pos != data.len() {
                return Err(Error::AuthenticationFailed);
            }
            break;
        }
        result.extend_from_slice(block_data);
        block_index += 1;
    }

    Ok(result)
}

fn encrypt_raw(
    data: &[u8],
    key: &[u8; 32],
    cipher: CipherAlgorithm,
    iv: &[u8],
) -> Result<Vec<u8>> {
    match cipher {
        CipherAlgorithm::Aes256Cbc => {
            let enc = Aes256CbcEnc::new_from_slices(key, iv)
                .map_err(|_| Error::AuthenticationFailed)?;
            let mut buffer = vec![0u8; data.len() + 16];
            buffer[..data.len()].copy_from_slice(data);
            let ciphertext = enc
                .encrypt_padded_mut::<Pkcs7>(&mut buffer, data.len())
                .map_err(|_| Error::AuthenticationFailed)?;
            Ok(ciphertext.to_vec())
        }
        CipherAlgorithm::ChaCha20 => {
            let mut stream = ChaCha20::new_from_slices(key, iv)
                .map_err(|_| Error::AuthenticationFailed)?;
            let mut buffer = data.to_vec();
            stream.apply_keystream(&mut buffer);
            Ok(buffer)
        }
    }
}

fn decrypt_raw(
    data: &[u8],
    key: &[u8; 32],
    cipher: CipherAlgorithm,
    iv: &[u8],
) -> Result<Vec<u8>> {
    match cipher {
        CipherAlgorithm::Aes256Cbc => {
            let dec = Aes256CbcDec::new_from_slices(key, iv)
                .map_err(|_| Error::AuthenticationFailed)?;
            let mut buffer = data.to_vec();
            let plaintext = dec
                .decrypt_padded_mut::<Pkcs7>(&mut buffer)
                .map_err(|_| Error::AuthenticationFailed)?;
            Ok(plaintext.to_vec())
        }
        CipherAlgorithm::ChaCha20 => encrypt_raw(data, key, cipher, iv),
    }
}

/// ChaCha20 keystream over protected field values inside the body.
///
/// The 32-byte stream key travels in the encrypted body; key and nonce are
/// expanded from its SHA-512. Values are enciphered in traversal order, so
/// encode and decode must walk the body identically.
pub struct ProtectedStreamCipher {
    cipher: ChaCha20,
}

impl ProtectedStreamCipher {
    pub fn new(stream_key: &[u8]) -> Result<Self> {
        let hash = Sha512::digest(stream_key);
        let key: [u8; 32] = hash[0..32]
            .try_into()
            .map_err(|_| Error::AuthenticationFailed)?;
        let nonce: [u8; 12] = hash[32..44]
            .try_into()
            .map_err(|_| Error::AuthenticationFailed)?;
        Ok(Self {
            cipher: ChaCha20::new(&key.into(), &nonce.into()),
        })
    }

    pub fn apply(&mut self, data: &mut [u8]) {
        self.cipher.apply_keystream(data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kdf::MasterKey;

    fn schedule() -> KeySchedule {
        KeySchedule::new(&[3u8; 32], &MasterKey::new([9u8; 32]))
    }

    #[test]
    fn aes_stream_round_trip() {
        let s = schedule();
        let iv = [5u8; 16];
        let plaintext = b"the quick brown fox".repeat(1000);
        let encrypted =
            encrypt_stream(&plaintext, &s, CipherAlgorithm::Aes256Cbc, &iv).unwrap();
        let decrypted =
            decrypt_stream(&encrypted, &s, CipherAlgorithm::Aes256Cbc, &iv).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn chacha20_stream_round_trip() {
        let s = schedule();
        let iv = [5u8; 12];
        let plaintext = b"vault body bytes".to_vec();
        let encrypted = encrypt_stream(&plaintext, &s, CipherAlgorithm::ChaCha20, &iv).unwrap();
        let decrypted = decrypt_stream(&encrypted, &s, CipherAlgorithm::ChaCha20, &iv).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn any_flipped_byte_fails_authentication() {
        let s = schedule();
        let iv = [5u8; 16];
        let encrypted =
            encrypt_stream(b"some secret payload", &s, CipherAlgorithm::Aes256Cbc, &iv).unwrap();

        for pos in [0, 10, 33, 40, encrypted.len() - 1] {
            let mut tampered = encrypted.clone();
            tampered[pos] ^= 0x01;
            assert!(matches!(
                decrypt_stream(&tampered, &s, CipherAlgorithm::Aes256Cbc, &iv),
                Err(Error::AuthenticationFailed)
            ));
        }
    }

    #[test]
    fn data_after_the_terminator_block_is_rejected() {
        let s = schedule();
        let iv = [5u8; 16];
        let mut encrypted =
            encrypt_stream(b"payload", &s, CipherAlgorithm::Aes256Cbc, &iv).unwrap();
        encrypted.push(0);
        assert!(matches!(
            decrypt_stream(&encrypted, &s, CipherAlgorithm::Aes256Cbc, &iv),
            Err(Error::AuthenticationFailed)
        ));
    }

    #[test]
    fn wrong_key_fails_authentication() {
        let s = schedule();
        let other = KeySchedule::new(&[3u8; 32], &MasterKey::new([8u8; 32]));
        let iv = [5u8; 16];
        let encrypted =
            encrypt_stream(b"payload", &s, CipherAlgorithm::Aes256Cbc, &iv).unwrap();
        assert!(matches!(
            decrypt_stream(&encrypted, &other, CipherAlgorithm::Aes256Cbc, &iv),
            Err(Error::AuthenticationFailed)
        ));
    }

    #[test]
    fn header_mac_detects_wrong_key() {
        let s = schedule();
        let mac = s.header_mac(b"header bytes").unwrap();
        assert!(s.verify_header_mac(b"header bytes", &mac).is_ok());

        let other = KeySchedule::new(&[3u8; 32], &MasterKey::new([8u8; 32]));
        assert!(matches!(
            other.verify_header_mac(b"header bytes", &mac),
            Err(Error::AuthenticationFailed)
        ));
    }

    #[test]
    fn protected_stream_cipher_is_symmetric() {
        let mut enc = ProtectedStreamCipher::new(&[1u8; 32]).unwrap();
        let mut dec = ProtectedStreamCipher::new(&[1u8; 32]).unwrap();

        let mut a = b"first".to_vec();
        let mut b = b"second value".to_vec();
        enc.apply(&mut a);
        enc.apply(&mut b);
        dec.apply(&mut a);
        dec.apply(&mut b);
        assert_eq!(a, b"first");
        assert_eq!(b, b"second value");
    }

    #[test]
    fn unknown_cipher_id_is_rejected() {
        assert!(matches!(
            CipherAlgorithm::from_id(7),
            Err(Error::UnsupportedCipher(7))
        ));
    }
}
