//! Container outer header
//!
//! The header is plaintext and fully parsed before any key derivation or
//! decryption happens: a magic signature, a format version, then a sequence
//! of id/length fields. Unknown field ids are retained verbatim and written
//! back on save so newer containers survive a load/save cycle here.

use byteorder::{ByteOrder, LittleEndian};

use crate::crypto::CipherAlgorithm;
use crate::error::{Error, Result};
use crate::kdf::{KdfAlgorithm, KdfParams};

/// Magic signature, first 8 bytes of every container
pub const SIG_1: u32 = 0x56_4C_54_42;
pub const SIG_2: u32 = 0xB5_4B_DB_86;

/// Format version written by this build
pub const VERSION_MAJOR: u16 = 1;
pub const VERSION_MINOR: u16 = 0;

// Header field ids
const FIELD_END: u8 = 0;
const FIELD_CIPHER_ID: u8 = 2;
const FIELD_COMPRESSION: u8 = 3;
const FIELD_MASTER_SEED: u8 = 4;
const FIELD_ENCRYPTION_IV: u8 = 7;
const FIELD_KDF_PARAMS: u8 = 11;

// Variant dictionary value types
const VD_VERSION: u16 = 0x0100;
const VD_TYPE_U32: u8 = 0x04;
const VD_TYPE_U64: u8 = 0x05;
const VD_TYPE_BYTES: u8 = 0x42;

/// Body compression flag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    None,
    #[default]
    Gzip,
}

impl Compression {
    fn from_flag(flag: u32) -> Result<Self> {
        match flag {
            0 => Ok(Self::None),
            1 => Ok(Self::Gzip),
            other => Err(Error::MalformedHeader(format!(
                "unknown compression flag: {other}"
            ))),
        }
    }

    fn flag(self) -> u32 {
        match self {
            Self::None => 0,
            Self::Gzip => 1,
        }
    }
}

/// Parsed outer header
#[derive(Debug, Clone)]
pub struct Header {
    /// (major, minor) format version
    pub version: (u16, u16),
    pub cipher: CipherAlgorithm,
    pub compression: Compression,
    pub master_seed: [u8; 32],
    pub encryption_iv: Vec<u8>,
    pub kdf: KdfParams,
    /// Unrecognized fields, kept in order for round-tripping
    pub unknown_fields: Vec<(u8, Vec<u8>)>,
}

/// A header read from a byte buffer, with the raw bytes it covers
#[derive(Debug)]
pub struct ParsedHeader {
    pub header: Header,
    /// Exact bytes of the header, as hashed and MACed by the codec
    pub raw: Vec<u8>,
    /// Offset of the first byte after the header
    pub end: usize,
}

impl Header {
    /// Build a header for a fresh save: random seed and IV, caller-chosen
    /// cipher, compression and KDF parameters.
    pub fn for_save(cipher: CipherAlgorithm, compression: Compression, kdf: KdfParams) -> Self {
        use rand::{rngs::OsRng, RngCore};
        let mut master_seed = [0u8; 32];
        OsRng.fill_bytes(&mut master_seed);
        let mut encryption_iv = vec![0u8; cipher.iv_len()];
        OsRng.fill_bytes(&mut encryption_iv);
        Self {
            version: (VERSION_MAJOR, VERSION_MINOR),
            cipher,
            compression,
            master_seed,
            encryption_iv,
            kdf,
            unknown_fields: Vec::new(),
        }
    }

    /// Serialize the header to bytes
    pub fn write(&self) -> Result<Vec<u8>> {
        if self.encryption_iv.len() != self.cipher.iv_len() {
            return Err(Error::MalformedHeader(format!(
                "IV length {} does not match cipher (wants {})",
                self.encryption_iv.len(),
                self.cipher.iv_len()
            )));
        }

        let mut out = Vec::with_capacity(256);
        let mut buf4 = [0u8; 4];
        LittleEndian::write_u32(&mut buf4, SIG_1);
        out.extend_from_slice(&buf4);
        LittleEndian::write_u32(&mut buf4, SIG_2);
        out.extend_from_slice(&buf4);

        let mut buf2 = [0u8; 2];
        LittleEndian::write_u16(&mut buf2, self.version.1);
        out.extend_from_slice(&buf2);
        LittleEndian::write_u16(&mut buf2, self.version.0);
        out.extend_from_slice(&buf2);

        let mut cipher_id = [0u8; 4];
        LittleEndian::write_u32(&mut cipher_id, self.cipher.id());
        write_field(&mut out, FIELD_CIPHER_ID, &cipher_id);

        let mut flag = [0u8; 4];
        LittleEndian::write_u32(&mut flag, self.compression.flag());
        write_field(&mut out, FIELD_COMPRESSION, &flag);

        write_field(&mut out, FIELD_MASTER_SEED, &self.master_seed);
        write_field(&mut out, FIELD_ENCRYPTION_IV, &self.encryption_iv);
        write_field(&mut out, FIELD_KDF_PARAMS, &write_kdf_params(&self.kdf));

        for (id, data) in &self.unknown_fields {
            write_field(&mut out, *id, data);
        }

        write_field(&mut out, FIELD_END, &[]);
        Ok(out)
    }
}

fn write_field(out: &mut Vec<u8>, id: u8, data: &[u8]) {
    out.push(id);
    let mut len = [0u8; 4];
    LittleEndian::write_u32(&mut len, data.len() as u32);
    out.extend_from_slice(&len);
    out.extend_from_slice(data);
}

/// Parse the outer header. All format/algorithm rejection happens here,
/// before a single byte of the body is touched.
pub fn read(data: &[u8]) -> Result<ParsedHeader> {
    if data.len() < 12 {
        return Err(Error::MalformedHeader("container too short".to_string()));
    }

    let sig1 = LittleEndian::read_u32(&data[0..4]);
    let sig2 = LittleEndian::read_u32(&data[4..8]);
    if sig1 != SIG_1 || sig2 != SIG_2 {
        return Err(Error::MalformedHeader("bad magic signature".to_string()));
    }

    let version_minor = LittleEndian::read_u16(&data[8..10]);
    let version_major = LittleEndian::read_u16(&data[10..12]);
    if version_major != VERSION_MAJOR {
        return Err(Error::UnsupportedVersion(version_major, version_minor));
    }

    let mut pos = 12;
    let mut cipher = None;
    let mut compression = Compression::None;
    let mut master_seed = None;
    let mut encryption_iv = None;
    let mut kdf = None;
    let mut unknown_fields = Vec::new();

    loop {
        if pos + 5 > data.len() {
            return Err(Error::MalformedHeader("truncated header".to_string()));
        }

        let field_id = data[pos];
        let field_len = LittleEndian::read_u32(&data[pos + 1..pos + 5]) as usize;
        pos += 5;

        if pos + field_len > data.len() {
            return Err(Error::MalformedHeader("truncated header field".to_string()));
        }

        let field_data = &data[pos..pos + field_len];
        pos += field_len;

        match field_id {
            FIELD_END => break,
            FIELD_CIPHER_ID => {
                if field_len < 4 {
                    return Err(Error::MalformedHeader("short cipher id field".to_string()));
                }
                cipher = Some(CipherAlgorithm::from_id(LittleEndian::read_u32(
                    field_data,
                ))?);
            }
            FIELD_COMPRESSION => {
                if field_len < 4 {
                    return Err(Error::MalformedHeader(
                        "short compression field".to_string(),
                    ));
                }
                compression = Compression::from_flag(LittleEndian::read_u32(field_data))?;
            }
            FIELD_MASTER_SEED => {
                let seed: [u8; 32] = field_data.try_into().map_err(|_| {
                    Error::MalformedHeader("master seed must be 32 bytes".to_string())
                })?;
                master_seed = Some(seed);
            }
            FIELD_ENCRYPTION_IV => encryption_iv = Some(field_data.to_vec()),
            FIELD_KDF_PARAMS => kdf = Some(read_kdf_params(field_data)?),
            other => unknown_fields.push((other, field_data.to_vec())),
        }
    }

    let header = Header {
        version: (version_major, version_minor),
        cipher: cipher
            .ok_or_else(|| Error::MalformedHeader("missing cipher id".to_string()))?,
        compression,
        master_seed: master_seed
            .ok_or_else(|| Error::MalformedHeader("missing master seed".to_string()))?,
        encryption_iv: encryption_iv
            .ok_or_else(|| Error::MalformedHeader("missing encryption IV".to_string()))?,
        kdf: kdf.ok_or_else(|| Error::MalformedHeader("missing KDF parameters".to_string()))?,
        unknown_fields,
    };

    if header.encryption_iv.len() != header.cipher.iv_len() {
        return Err(Error::MalformedHeader(format!(
            "IV length {} does not match cipher (wants {})",
            header.encryption_iv.len(),
            header.cipher.iv_len()
        )));
    }

    Ok(ParsedHeader {
        header,
        raw: data[0..pos].to_vec(),
        end: pos,
    })
}

/// Serialize KDF parameters as a variant dictionary
fn write_kdf_params(kdf: &KdfParams) -> Vec<u8> {
    let mut out = Vec::with_capacity(96);
    let mut buf2 = [0u8; 2];
    LittleEndian::write_u16(&mut buf2, VD_VERSION);
    out.extend_from_slice(&buf2);

    write_vd_u32(&mut out, b"$ID", kdf.algorithm.id());
    write_vd_bytes(&mut out, b"S", &kdf.salt);
    write_vd_u64(&mut out, b"M", u64::from(kdf.memory_kib) * 1024);
    write_vd_u64(&mut out, b"I", u64::from(kdf.iterations));
    write_vd_u32(&mut out, b"P", kdf.parallelism);

    out.push(0); // terminator
    out
}

fn write_vd_entry(out: &mut Vec<u8>, vtype: u8, key: &[u8], value: &[u8]) {
    out.push(vtype);
    let mut len = [0u8; 4];
    LittleEndian::write_u32(&mut len, key.len() as u32);
    out.extend_from_slice(&len);
    out.extend_from_slice(key);
    LittleEndian::write_u32(&mut len, value.len() as u32);
    out.extend_from_slice(&len);
    out.extend_from_slice(value);
}

fn write_vd_u32(out: &mut Vec<u8>, key: &[u8], value: u32) {
    let mut buf = [0u8; 4];
    LittleEndian::write_u32(&mut buf, value);
    write_vd_entry(out, VD_TYPE_U32, key, &buf);
}

fn write_vd_u64(out: &mut Vec<u8>, key: &[u8], value: u64) {
    let mut buf = [0u8; 8];
    LittleEndian::write_u64(&mut buf, value);
    write_vd_entry(out, VD_TYPE_U64, key, &buf);
}

fn write_vd_bytes(out: &mut Vec<u8>, key: &[u8], value: &[u8]) {
    write_vd_entry(out, VD_TYPE_BYTES, key, value);
}

/// Parse KDF parameters from the variant dictionary field
fn read_kdf_params(data: &[u8]) -> Result<KdfParams> {
    if data.len() < 2 {
        return Err(Error::MalformedHeader("KDF parameters too short".to_string()));
    }
    let mut pos = 2; // skip dictionary version

    let mut algorithm_id: Option<u32> = None;
    let mut salt: Option<Vec<u8>> = None;
    let mut memory: Option<u64> = None;
    let mut iterations: Option<u64> = None;
    let mut parallelism: Option<u32> = None;

    while pos < data.len() {
        let entry_type = data[pos];
        pos += 1;
        if entry_type == 0 {
            break;
        }

        if pos + 4 > data.len() {
            return Err(Error::MalformedHeader("truncated KDF entry".to_string()));
        }
        let key_len = LittleEndian::read_u32(&data[pos..pos + 4]) as usize;
        pos += 4;
        if pos + key_len > data.len() {
            return Err(Error::MalformedHeader("truncated KDF key".to_string()));
        }
        let key = &data[pos..pos + key_len];
        pos += key_len;

        if pos + 4 > data.len() {
            return Err(Error::MalformedHeader("truncated KDF entry".to_string()));
        }
        let value_len = LittleEndian::read_u32(&data[pos..pos + 4]) as usize;
        pos += 4;
        if pos + value_len > data.len() {
            return Err(Error::MalformedHeader("truncated KDF value".to_string()));
        }
        let value = &data[pos..pos + value_len];
        pos += value_len;

        match key {
            b"$ID" if value.len() >= 4 => {
                algorithm_id = Some(LittleEndian::read_u32(value));
            }
            b"S" => salt = Some(value.to_vec()),
            b"M" if value.len() >= 8 => memory = Some(LittleEndian::read_u64(value)),
            b"I" if value.len() >= 8 => iterations = Some(LittleEndian::read_u64(value)),
            b"P" if value.len() >= 4 => parallelism = Some(LittleEndian::read_u32(value)),
            _ => {} // unknown dictionary keys are ignored
        }
    }

    let algorithm_id = algorithm_id
        .ok_or_else(|| Error::MalformedHeader("missing KDF algorithm id".to_string()))?;
    let algorithm = KdfAlgorithm::from_id(algorithm_id)?;

    Ok(KdfParams {
        algorithm,
        salt: salt.ok_or_else(|| Error::MalformedHeader("missing KDF salt".to_string()))?,
        memory_kib: (memory.unwrap_or(0) / 1024) as u32,
        iterations: iterations
            .ok_or_else(|| Error::MalformedHeader("missing KDF iterations".to_string()))?
            as u32,
        parallelism: parallelism.unwrap_or(1),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kdf::KdfParams;

    fn sample_header() -> Header {
        Header::for_save(
            CipherAlgorithm::Aes256Cbc,
            Compression::Gzip,
            KdfParams::argon2id_default(),
        )
    }

    #[test]
    fn header_round_trip() {
        let header = sample_header();
        let bytes = header.write().unwrap();
        let parsed = read(&bytes).unwrap();

        assert_eq!(parsed.header.version, (VERSION_MAJOR, VERSION_MINOR));
        assert_eq!(parsed.header.cipher, header.cipher);
        assert_eq!(parsed.header.compression, header.compression);
        assert_eq!(parsed.header.master_seed, header.master_seed);
        assert_eq!(parsed.header.encryption_iv, header.encryption_iv);
        assert_eq!(parsed.header.kdf, header.kdf);
        assert_eq!(parsed.end, bytes.len());
        assert_eq!(parsed.raw, bytes);
    }

    #[test]
    fn bad_magic_is_malformed() {
        let mut bytes = sample_header().write().unwrap();
        bytes[0] ^= 0xff;
        assert!(matches!(read(&bytes), Err(Error::MalformedHeader(_))));
    }

    #[test]
    fn future_major_version_is_rejected() {
        let mut header = sample_header();
        header.version = (99, 0);
        let bytes = header.write().unwrap();
        assert!(matches!(
            read(&bytes),
            Err(Error::UnsupportedVersion(99, 0))
        ));
    }

    #[test]
    fn unknown_cipher_id_is_rejected() {
        let bytes = sample_header().write().unwrap();
        // cipher id field payload starts right after magic+version+field tag
        let mut bytes = bytes;
        let pos = 12 + 5; // first field payload
        LittleEndian::write_u32(&mut bytes[pos..pos + 4], 77);
        assert!(matches!(read(&bytes), Err(Error::UnsupportedCipher(77))));
    }

    #[test]
    fn unknown_header_fields_round_trip() {
        let mut header = sample_header();
        header.unknown_fields.push((42, vec![1, 2, 3, 4]));
        let bytes = header.write().unwrap();
        let parsed = read(&bytes).unwrap();
        assert_eq!(parsed.header.unknown_fields, vec![(42u8, vec![1, 2, 3, 4])]);

        // and they survive a second write
        let again = parsed.header.write().unwrap();
        assert_eq!(again, bytes);
    }

    #[test]
    fn truncated_header_is_malformed() {
        let bytes = sample_header().write().unwrap();
        assert!(matches!(
            read(&bytes[..20]),
            Err(Error::MalformedHeader(_))
        ));
    }
}
