//! Binary codec: the container format
//!
//! A vault is a single byte buffer: outer header, header SHA-256, header
//! HMAC, then the encrypted body as an HMAC block stream. The decrypted
//! body is a tag/length record stream describing the database. Unknown
//! record tags are carried through a load/save cycle untouched, at the
//! top level and inside group/entry records, so newer writers' data is
//! preserved rather than dropped.
//!
//! Decode order is fixed: header is parsed and validated first, the header
//! MAC is checked before any body byte is decrypted (this is where a wrong
//! secret surfaces), then the body is authenticated, decrypted,
//! decompressed and parsed.

use std::collections::{HashMap, HashSet};
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};

use byteorder::{ByteOrder, LittleEndian};
use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use sha2::Digest;
use uuid::Uuid;

use crate::binary::BinaryPool;
use crate::crypto::{self, CipherAlgorithm, KeySchedule, ProtectedStreamCipher};
use crate::database::Database;
use crate::entry::{Entry, EntrySnapshot};
use crate::error::{Error, Result};
use crate::field::{Field, FieldValue};
use crate::group::Group;
use crate::header::{self, Compression, Header, ParsedHeader, VERSION_MAJOR};
use crate::kdf::{self, KdfParams, MasterKey, SecretKey};
use crate::protected::ProtectedValue;
use crate::times;

// Top-level body record tags
const REC_END: u8 = 0;
const REC_META: u8 = 1;
const REC_STREAM_KEY: u8 = 2;
const REC_BINARY: u8 = 3;
const REC_GROUP: u8 = 4;
const REC_ENTRY: u8 = 5;
const REC_TOMBSTONE: u8 = 6;

// Group record tags
const GRP_UUID: u8 = 1;
const GRP_PARENT: u8 = 2;
const GRP_NAME: u8 = 3;
const GRP_NOTES: u8 = 4;
const GRP_ICON: u8 = 5;
const GRP_TIMES: u8 = 6;
const GRP_CHILDREN: u8 = 7;
const GRP_ENTRIES: u8 = 8;

// Entry record tags
const ENT_UUID: u8 = 1;
const ENT_PARENT: u8 = 2;
const ENT_TIMES: u8 = 3;
const ENT_ICON: u8 = 4;
const ENT_FIELD: u8 = 5;
const ENT_HISTORY: u8 = 6;

// Field value kinds
const KIND_TEXT: u8 = 0;
const KIND_PROTECTED: u8 = 1;
const KIND_BINARY_REF: u8 = 2;
const KIND_BOOL: u8 = 3;

const FLAG_AUTO_FILL: u8 = 0b0000_0001;

/// No-expiry sentinel in serialized times
const NO_EXPIRY: i64 = i64::MIN;

/// Choices for a save
#[derive(Debug, Clone)]
pub struct EncodeOptions {
    pub cipher: CipherAlgorithm,
    pub compression: Compression,
    pub kdf: KdfParams,
    /// Write this header version instead of the current one (must be a
    /// supported major version)
    pub header_version: Option<(u16, u16)>,
}

impl Default for EncodeOptions {
    fn default() -> Self {
        Self {
            cipher: CipherAlgorithm::default(),
            compression: Compression::default(),
            kdf: KdfParams::argon2id_default(),
            header_version: None,
        }
    }
}

/// Parse and validate the outer header only. Cheap; no key derivation.
pub fn read_header(data: &[u8]) -> Result<ParsedHeader> {
    header::read(data)
}

/// Decode a container into a database
pub fn decode(data: &[u8], secret: &SecretKey) -> Result<Database> {
    let parsed = read_header(data)?;
    let master_key = kdf::derive(secret, &parsed.header.kdf)?;
    decrypt_body(data, &parsed, &master_key)
}

/// Like [`decode`], but observes a cancellation flag up to the point where
/// decryption begins. Past that the operation completes or fails whole.
pub fn decode_cancellable(
    data: &[u8],
    secret: &SecretKey,
    cancel: &AtomicBool,
) -> Result<Database> {
    let parsed = read_header(data)?;
    let master_key = kdf::derive_cancellable(secret, &parsed.header.kdf, cancel)?;
    if cancel.load(Ordering::Relaxed) {
        return Err(Error::Cancelled);
    }
    decrypt_body(data, &parsed, &master_key)
}

/// Decrypt, authenticate and parse the body given an already-parsed header
/// and derived master key. This is the hand-off point for callers that run
/// key derivation on a worker.
pub fn decrypt_body(
    data: &[u8],
    parsed: &ParsedHeader,
    master_key: &MasterKey,
) -> Result<Database> {
    let header = &parsed.header;
    let checksum_pos = parsed.end;
    let mac_pos = checksum_pos + 32;
    let payload_pos = mac_pos + 32;
    if data.len() < payload_pos {
        return Err(Error::MalformedHeader(
            "container truncated after header".to_string(),
        ));
    }

    // plain integrity check first: catches corruption without leaking
    // anything about the secret
    let stored_checksum = &data[checksum_pos..mac_pos];
    let computed = sha2::Sha256::digest(&parsed.raw);
    if stored_checksum != computed.as_slice() {
        return Err(Error::MalformedHeader("header checksum mismatch".to_string()));
    }

    let schedule = KeySchedule::new(&header.master_seed, master_key);
    schedule.verify_header_mac(&parsed.raw, &data[mac_pos..payload_pos])?;

    let decrypted = crypto::decrypt_stream(
        &data[payload_pos..],
        &schedule,
        header.cipher,
        &header.encryption_iv,
    )?;

    let body = match header.compression {
        Compression::Gzip => gunzip(&decrypted)?,
        Compression::None => decrypted,
    };

    let mut db = parse_body(&body)?;
    db.set_unknown_header_fields(header.unknown_fields.clone());
    Ok(db)
}

/// Encode a database into a container
pub fn encode(db: &Database, secret: &SecretKey, options: &EncodeOptions) -> Result<Vec<u8>> {
    let mut kdf_params = options.kdf.clone();
    kdf_params.validate()?;
    // a fresh salt every save; the derived key never repeats across files
    kdf_params.regenerate_salt();

    let mut header = Header::for_save(options.cipher, options.compression, kdf_params);
    if let Some(version) = options.header_version {
        if version.0 != VERSION_MAJOR {
            return Err(Error::UnsupportedVersion(version.0, version.1));
        }
        header.version = version;
    }
    header.unknown_fields = db.unknown_header_fields().to_vec();

    let body = write_body(db)?;
    let body = match header.compression {
        Compression::Gzip => gzip(&body)?,
        Compression::None => body,
    };

    let master_key = kdf::derive(secret, &header.kdf)?;
    let schedule = KeySchedule::new(&header.master_seed, &master_key);

    let header_bytes = header.write()?;
    let encrypted = crypto::encrypt_stream(&body, &schedule, header.cipher, &header.encryption_iv)?;

    let mut out = Vec::with_capacity(header_bytes.len() + 64 + encrypted.len());
    out.extend_from_slice(&header_bytes);
    out.extend_from_slice(&sha2::Sha256::digest(&header_bytes));
    out.extend_from_slice(&schedule.header_mac(&header_bytes)?);
    out.extend_from_slice(&encrypted);
    Ok(out)
}

fn gzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

fn gunzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| Error::Corrupted(format!("decompression failed: {e}")))?;
    Ok(out)
}

// ---- body writing ------------------------------------------------------

fn write_record(out: &mut Vec<u8>, tag: u8, payload: &[u8]) {
    out.push(tag);
    let mut len = [0u8; 4];
    LittleEndian::write_u32(&mut len, payload.len() as u32);
    out.extend_from_slice(&len);
    out.extend_from_slice(payload);
}

fn write_body(db: &Database) -> Result<Vec<u8>> {
    use rand::{rngs::OsRng, RngCore};
    let mut stream_key = [0u8; 32];
    OsRng.fill_bytes(&mut stream_key);
    let mut stream = ProtectedStreamCipher::new(&stream_key)?;

    let mut out = Vec::new();

    let mut meta = Vec::with_capacity(40 + db.name().len());
    meta.extend_from_slice(db.uuid().as_bytes());
    meta.extend_from_slice(db.root_uuid().as_bytes());
    let mut gen = [0u8; 8];
    LittleEndian::write_u64(&mut gen, db.generation());
    meta.extend_from_slice(&gen);
    meta.extend_from_slice(db.name().as_bytes());
    write_record(&mut out, REC_META, &meta);

    write_record(&mut out, REC_STREAM_KEY, &stream_key);

    let mut binary_ids: Vec<_> = db.binaries().iter().map(|(id, _)| *id).collect();
    binary_ids.sort_unstable();
    for id in binary_ids {
        if let Some(data) = db.binaries().get(&id) {
            let mut payload = Vec::with_capacity(32 + data.len());
            payload.extend_from_slice(&id);
            payload.extend_from_slice(data);
            write_record(&mut out, REC_BINARY, &payload);
        }
    }

    // groups and their entries in depth-first display order; groups and
    // entries not reachable through membership lists go last so nothing is
    // ever dropped by a save
    let order = db.groups_depth_first();
    for group_uuid in &order {
        if let Some(group) = db.get_group(group_uuid) {
            write_record(&mut out, REC_GROUP, &write_group(group));
        }
    }
    let mut stray_groups: Vec<_> = db.groups().filter(|g| !order.contains(&g.uuid)).collect();
    stray_groups.sort_by_key(|g| g.uuid);
    for group in stray_groups {
        write_record(&mut out, REC_GROUP, &write_group(group));
    }
    let mut written = HashSet::new();
    for group_uuid in &order {
        if let Some(group) = db.get_group(group_uuid) {
            for entry_uuid in &group.entries {
                if let Some(entry) = db.get_entry(entry_uuid) {
                    write_record(&mut out, REC_ENTRY, &write_entry(entry, &mut stream));
                    written.insert(*entry_uuid);
                }
            }
        }
    }
    let mut stray: Vec<_> = db.entries().filter(|e| !written.contains(&e.uuid)).collect();
    stray.sort_by_key(|e| e.uuid);
    for entry in stray {
        write_record(&mut out, REC_ENTRY, &write_entry(entry, &mut stream));
    }

    let mut tombstones: Vec<_> = db.tombstones().collect();
    tombstones.sort_by_key(|(uuid, _)| **uuid);
    for (uuid, at) in tombstones {
        let mut payload = Vec::with_capacity(24);
        payload.extend_from_slice(uuid.as_bytes());
        let mut ts = [0u8; 8];
        LittleEndian::write_i64(&mut ts, times::to_micros(*at));
        payload.extend_from_slice(&ts);
        write_record(&mut out, REC_TOMBSTONE, &payload);
    }

    for (tag, payload) in db.unknown_records() {
        write_record(&mut out, *tag, payload);
    }

    write_record(&mut out, REC_END, &[]);
    Ok(out)
}

fn write_group(group: &Group) -> Vec<u8> {
    let mut out = Vec::new();
    write_record(&mut out, GRP_UUID, group.uuid.as_bytes());
    if let Some(parent) = group.parent {
        write_record(&mut out, GRP_PARENT, parent.as_bytes());
    }
    write_record(&mut out, GRP_NAME, group.name.as_bytes());
    if !group.notes.is_empty() {
        write_record(&mut out, GRP_NOTES, group.notes.as_bytes());
    }
    if let Some(icon) = group.icon_id {
        let mut buf = [0u8; 4];
        LittleEndian::write_u32(&mut buf, icon);
        write_record(&mut out, GRP_ICON, &buf);
    }
    let mut time_buf = [0u8; 25];
    LittleEndian::write_i64(&mut time_buf[0..8], times::to_micros(group.created));
    LittleEndian::write_i64(&mut time_buf[8..16], times::to_micros(group.modified));
    LittleEndian::write_i64(
        &mut time_buf[16..24],
        group.expires.map(times::to_micros).unwrap_or(NO_EXPIRY),
    );
    time_buf[24] = u8::from(group.expires_enabled);
    write_record(&mut out, GRP_TIMES, &time_buf);

    write_record(&mut out, GRP_CHILDREN, &write_uuid_list(&group.children));
    write_record(&mut out, GRP_ENTRIES, &write_uuid_list(&group.entries));

    for (tag, payload) in &group.unknown_fields {
        write_record(&mut out, *tag, payload);
    }
    out
}

fn write_uuid_list(uuids: &[Uuid]) -> Vec<u8> {
    let mut out = Vec::with_capacity(uuids.len() * 16);
    for uuid in uuids {
        out.extend_from_slice(uuid.as_bytes());
    }
    out
}

fn write_entry(entry: &Entry, stream: &mut ProtectedStreamCipher) -> Vec<u8> {
    let mut out = Vec::new();
    write_record(&mut out, ENT_UUID, entry.uuid.as_bytes());
    if let Some(parent) = entry.parent_group {
        write_record(&mut out, ENT_PARENT, parent.as_bytes());
    }

    let mut time_buf = [0u8; 33];
    LittleEndian::write_i64(&mut time_buf[0..8], times::to_micros(entry.created));
    LittleEndian::write_i64(&mut time_buf[8..16], times::to_micros(entry.modified));
    LittleEndian::write_i64(&mut time_buf[16..24], times::to_micros(entry.accessed));
    LittleEndian::write_i64(
        &mut time_buf[24..32],
        entry.expires.map(times::to_micros).unwrap_or(NO_EXPIRY),
    );
    time_buf[32] = u8::from(entry.expires_enabled);
    write_record(&mut out, ENT_TIMES, &time_buf);

    if let Some(icon) = entry.icon_id {
        let mut buf = [0u8; 4];
        LittleEndian::write_u32(&mut buf, icon);
        write_record(&mut out, ENT_ICON, &buf);
    }

    for field in entry.fields() {
        write_record(&mut out, ENT_FIELD, &write_field(field, stream));
    }

    for snapshot in entry.history() {
        let mut payload = Vec::new();
        let mut ts = [0u8; 8];
        LittleEndian::write_i64(&mut ts, times::to_micros(snapshot.timestamp));
        payload.extend_from_slice(&ts);
        for field in &snapshot.fields {
            write_record(&mut payload, ENT_FIELD, &write_field(field, stream));
        }
        write_record(&mut out, ENT_HISTORY, &payload);
    }

    for (tag, payload) in &entry.unknown_fields {
        write_record(&mut out, *tag, payload);
    }
    out
}

fn write_field(field: &Field, stream: &mut ProtectedStreamCipher) -> Vec<u8> {
    let (kind, mut value) = match &field.value {
        FieldValue::Text(s) => (KIND_TEXT, s.as_bytes().to_vec()),
        FieldValue::Protected(p) => {
            let mut bytes = p.reveal().as_bytes().to_vec();
            stream.apply(&mut bytes);
            (KIND_PROTECTED, bytes)
        }
        FieldValue::BinaryRef(id) => (KIND_BINARY_REF, id.to_vec()),
        FieldValue::Bool(b) => (KIND_BOOL, vec![u8::from(*b)]),
    };

    let mut out = Vec::with_capacity(10 + field.name.len() + value.len());
    out.push(kind);
    out.push(if field.auto_fill { FLAG_AUTO_FILL } else { 0 });
    let mut len = [0u8; 4];
    LittleEndian::write_u32(&mut len, field.name.len() as u32);
    out.extend_from_slice(&len);
    out.extend_from_slice(field.name.as_bytes());
    LittleEndian::write_u32(&mut len, value.len() as u32);
    out.extend_from_slice(&len);
    out.append(&mut value);
    out
}

// ---- body parsing ------------------------------------------------------

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.remaining() < len {
            return Err(Error::Corrupted("truncated record".to_string()));
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.bytes(1)?[0])
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(LittleEndian::read_u32(self.bytes(4)?))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(LittleEndian::read_u64(self.bytes(8)?))
    }

    fn i64(&mut self) -> Result<i64> {
        Ok(LittleEndian::read_i64(self.bytes(8)?))
    }

    fn uuid(&mut self) -> Result<Uuid> {
        let bytes: [u8; 16] = self
            .bytes(16)?
            .try_into()
            .map_err(|_| Error::Corrupted("bad uuid".to_string()))?;
        Ok(Uuid::from_bytes(bytes))
    }

    /// Next (tag, payload) record, or None at end of input
    fn record(&mut self) -> Result<Option<(u8, &'a [u8])>> {
        if self.remaining() == 0 {
            return Ok(None);
        }
        let tag = self.u8()?;
        let len = self.u32()? as usize;
        Ok(Some((tag, self.bytes(len)?)))
    }
}

fn read_timestamp(us: i64) -> Result<DateTime<Utc>> {
    times::from_micros(us).ok_or_else(|| Error::Corrupted("timestamp out of range".to_string()))
}

fn read_utf8(bytes: &[u8]) -> Result<String> {
    String::from_utf8(bytes.to_vec()).map_err(|_| Error::Corrupted("invalid UTF-8".to_string()))
}

fn parse_body(body: &[u8]) -> Result<Database> {
    let mut reader = Reader::new(body);

    let mut meta: Option<(Uuid, Uuid, u64, String)> = None;
    let mut stream: Option<ProtectedStreamCipher> = None;
    let mut binaries = BinaryPool::new();
    let mut groups: HashMap<Uuid, Group> = HashMap::new();
    let mut entries: HashMap<Uuid, Entry> = HashMap::new();
    let mut tombstones: HashMap<Uuid, DateTime<Utc>> = HashMap::new();
    let mut unknown_records = Vec::new();

    loop {
        let Some((tag, payload)) = reader.record()? else {
            return Err(Error::Corrupted("body missing end record".to_string()));
        };
        match tag {
            REC_END => break,
            REC_META => {
                let mut r = Reader::new(payload);
                let uuid = r.uuid()?;
                let root = r.uuid()?;
                let generation = r.u64()?;
                let name = read_utf8(r.bytes(r.remaining())?)?;
                meta = Some((uuid, root, generation, name));
            }
            REC_STREAM_KEY => {
                stream = Some(ProtectedStreamCipher::new(payload)?);
            }
            REC_BINARY => {
                if payload.len() < 32 {
                    return Err(Error::Corrupted("short binary record".to_string()));
                }
                let id: [u8; 32] = payload[..32]
                    .try_into()
                    .map_err(|_| Error::Corrupted("bad binary id".to_string()))?;
                let data = payload[32..].to_vec();
                if BinaryPool::hash(&data) != id {
                    return Err(Error::Corrupted("binary content hash mismatch".to_string()));
                }
                binaries.insert_with_id(id, data);
            }
            REC_GROUP => {
                let group = parse_group(payload)?;
                groups.insert(group.uuid, group);
            }
            REC_ENTRY => {
                let stream = stream
                    .as_mut()
                    .ok_or_else(|| Error::Corrupted("entry before stream key".to_string()))?;
                let entry = parse_entry(payload, stream)?;
                entries.insert(entry.uuid, entry);
            }
            REC_TOMBSTONE => {
                let mut r = Reader::new(payload);
                let uuid = r.uuid()?;
                let at = read_timestamp(r.i64()?)?;
                tombstones.insert(uuid, at);
            }
            other => unknown_records.push((other, payload.to_vec())),
        }
    }

    let (uuid, root, generation, name) =
        meta.ok_or_else(|| Error::Corrupted("body missing metadata record".to_string()))?;

    repair_links(root, &mut groups, &mut entries);

    let mut db = Database::from_parts(
        uuid, name, generation, root, groups, entries, binaries, tombstones,
    )?;
    db.set_unknown_records(unknown_records);
    Ok(db)
}

/// Bring parent pointers and membership lists back into agreement after a
/// decode. A parent that is missing, self-referential or part of a loop
/// falls back to the root, and membership lists are rebuilt from the
/// (then valid) parent pointers, so every group and entry in the container
/// ends up reachable from the root. The stored display order is kept for
/// members both representations agree on.
fn repair_links(root: Uuid, groups: &mut HashMap<Uuid, Group>, entries: &mut HashMap<Uuid, Entry>) {
    let mut group_ids: Vec<Uuid> = groups.keys().copied().collect();
    group_ids.sort_unstable();

    for uuid in &group_ids {
        if *uuid == root {
            if let Some(group) = groups.get_mut(uuid) {
                group.parent = None;
            }
            continue;
        }
        let parent_ok = groups
            .get(uuid)
            .and_then(|g| g.parent)
            .map(|p| p != *uuid && groups.contains_key(&p))
            .unwrap_or(false);
        if !parent_ok {
            if let Some(group) = groups.get_mut(uuid) {
                group.parent = Some(root);
            }
        }
    }

    // a parent chain that loops can never reach the root; break it there
    for uuid in &group_ids {
        if *uuid == root {
            continue;
        }
        let mut seen = HashSet::from([*uuid]);
        let mut current = groups.get(uuid).and_then(|g| g.parent);
        while let Some(p) = current {
            if p == root {
                break;
            }
            if !seen.insert(p) {
                if let Some(group) = groups.get_mut(uuid) {
                    group.parent = Some(root);
                }
                break;
            }
            current = groups.get(&p).and_then(|g| g.parent);
        }
    }

    let mut entry_ids: Vec<Uuid> = entries.keys().copied().collect();
    entry_ids.sort_unstable();
    for uuid in &entry_ids {
        let parent_ok = entries
            .get(uuid)
            .and_then(|e| e.parent_group)
            .map(|p| groups.contains_key(&p))
            .unwrap_or(false);
        if !parent_ok {
            if let Some(entry) = entries.get_mut(uuid) {
                entry.parent_group = Some(root);
            }
        }
    }

    let mut child_of: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
    for uuid in &group_ids {
        if *uuid == root {
            continue;
        }
        if let Some(parent) = groups.get(uuid).and_then(|g| g.parent) {
            child_of.entry(parent).or_default().push(*uuid);
        }
    }
    let mut member_of: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
    for uuid in &entry_ids {
        if let Some(parent) = entries.get(uuid).and_then(|e| e.parent_group) {
            member_of.entry(parent).or_default().push(*uuid);
        }
    }
    for uuid in &group_ids {
        let children = child_of.remove(uuid).unwrap_or_default();
        let members = member_of.remove(uuid).unwrap_or_default();
        if let Some(group) = groups.get_mut(uuid) {
            group.children = keep_order(&group.children, &children);
            group.entries = keep_order(&group.entries, &members);
        }
    }
}

/// `stored` display order restricted to `actual` members, with members the
/// stored order never saw appended in their sorted fallback order.
fn keep_order(stored: &[Uuid], actual: &[Uuid]) -> Vec<Uuid> {
    let mut out: Vec<Uuid> = stored.iter().filter(|u| actual.contains(u)).copied().collect();
    for uuid in actual {
        if !out.contains(uuid) {
            out.push(*uuid);
        }
    }
    out
}

fn parse_group(payload: &[u8]) -> Result<Group> {
    let mut reader = Reader::new(payload);
    let mut uuid = None;
    let mut parent = None;
    let mut name = None;
    let mut notes = String::new();
    let mut icon_id = None;
    let mut time_parts = None;
    let mut children = Vec::new();
    let mut entry_order = Vec::new();
    let mut unknown_fields = Vec::new();

    while let Some((tag, data)) = reader.record()? {
        match tag {
            GRP_UUID => uuid = Some(Reader::new(data).uuid()?),
            GRP_PARENT => parent = Some(Reader::new(data).uuid()?),
            GRP_NAME => name = Some(read_utf8(data)?),
            GRP_NOTES => notes = read_utf8(data)?,
            GRP_ICON => icon_id = Some(Reader::new(data).u32()?),
            GRP_TIMES => time_parts = Some(parse_group_times(data)?),
            GRP_CHILDREN => children = parse_uuid_list(data)?,
            GRP_ENTRIES => entry_order = parse_uuid_list(data)?,
            other => unknown_fields.push((other, data.to_vec())),
        }
    }

    let uuid = uuid.ok_or_else(|| Error::Corrupted("group without uuid".to_string()))?;
    let name = name.ok_or_else(|| Error::Corrupted("group without name".to_string()))?;
    let (created, modified, expires, expires_enabled) =
        time_parts.ok_or_else(|| Error::Corrupted("group without times".to_string()))?;

    let mut group = Group::with_uuid(uuid, name);
    group.parent = parent;
    group.notes = notes;
    group.icon_id = icon_id;
    group.created = created;
    group.modified = modified;
    group.expires = expires;
    group.expires_enabled = expires_enabled;
    group.children = children;
    group.entries = entry_order;
    group.unknown_fields = unknown_fields;
    Ok(group)
}

type GroupTimes = (DateTime<Utc>, DateTime<Utc>, Option<DateTime<Utc>>, bool);

fn parse_group_times(data: &[u8]) -> Result<GroupTimes> {
    let mut r = Reader::new(data);
    let created = read_timestamp(r.i64()?)?;
    let modified = read_timestamp(r.i64()?)?;
    let expires_raw = r.i64()?;
    let expires = if expires_raw == NO_EXPIRY {
        None
    } else {
        Some(read_timestamp(expires_raw)?)
    };
    let expires_enabled = r.u8()? != 0;
    Ok((created, modified, expires, expires_enabled))
}

fn parse_uuid_list(data: &[u8]) -> Result<Vec<Uuid>> {
    if data.len() % 16 != 0 {
        return Err(Error::Corrupted("uuid list length not a multiple of 16".to_string()));
    }
    let mut reader = Reader::new(data);
    let mut out = Vec::with_capacity(data.len() / 16);
    while reader.remaining() > 0 {
        out.push(reader.uuid()?);
    }
    Ok(out)
}

fn parse_entry(payload: &[u8], stream: &mut ProtectedStreamCipher) -> Result<Entry> {
    let mut reader = Reader::new(payload);
    let mut uuid = None;
    let mut parent = None;
    let mut icon_id = None;
    let mut time_parts = None;
    let mut fields = Vec::new();
    let mut history = Vec::new();
    let mut unknown_fields = Vec::new();

    while let Some((tag, data)) = reader.record()? {
        match tag {
            ENT_UUID => uuid = Some(Reader::new(data).uuid()?),
            ENT_PARENT => parent = Some(Reader::new(data).uuid()?),
            ENT_TIMES => time_parts = Some(parse_entry_times(data)?),
            ENT_ICON => icon_id = Some(Reader::new(data).u32()?),
            ENT_FIELD => fields.push(parse_field(data, stream)?),
            ENT_HISTORY => {
                let mut r = Reader::new(data);
                let timestamp = read_timestamp(r.i64()?)?;
                let mut snapshot_fields = Vec::new();
                while let Some((tag, field_data)) = r.record()? {
                    if tag == ENT_FIELD {
                        snapshot_fields.push(parse_field(field_data, stream)?);
                    }
                }
                history.push(EntrySnapshot {
                    timestamp,
                    fields: snapshot_fields,
                });
            }
            other => unknown_fields.push((other, data.to_vec())),
        }
    }

    let uuid = uuid.ok_or_else(|| Error::Corrupted("entry without uuid".to_string()))?;
    let (created, modified, accessed, expires, expires_enabled) =
        time_parts.ok_or_else(|| Error::Corrupted("entry without times".to_string()))?;

    let mut entry = Entry::new("");
    entry.uuid = uuid;
    entry.parent_group = parent;
    entry.icon_id = icon_id;
    entry.created = created;
    entry.modified = modified;
    entry.accessed = accessed;
    entry.expires = expires;
    entry.expires_enabled = expires_enabled;
    entry.set_fields_raw(fields);
    entry.set_history_raw(history);
    entry.unknown_fields = unknown_fields;
    Ok(entry)
}

type EntryTimes = (
    DateTime<Utc>,
    DateTime<Utc>,
    DateTime<Utc>,
    Option<DateTime<Utc>>,
    bool,
);

fn parse_entry_times(data: &[u8]) -> Result<EntryTimes> {
    let mut r = Reader::new(data);
    let created = read_timestamp(r.i64()?)?;
    let modified = read_timestamp(r.i64()?)?;
    let accessed = read_timestamp(r.i64()?)?;
    let expires_raw = r.i64()?;
    let expires = if expires_raw == NO_EXPIRY {
        None
    } else {
        Some(read_timestamp(expires_raw)?)
    };
    let expires_enabled = r.u8()? != 0;
    Ok((created, modified, accessed, expires, expires_enabled))
}

fn parse_field(data: &[u8], stream: &mut ProtectedStreamCipher) -> Result<Field> {
    let mut r = Reader::new(data);
    let kind = r.u8()?;
    let flags = r.u8()?;
    let name_len = r.u32()? as usize;
    let name = read_utf8(r.bytes(name_len)?)?;
    let value_len = r.u32()? as usize;
    let value_bytes = r.bytes(value_len)?;

    let value = match kind {
        KIND_TEXT => FieldValue::Text(read_utf8(value_bytes)?),
        KIND_PROTECTED => {
            let mut plaintext = value_bytes.to_vec();
            stream.apply(&mut plaintext);
            FieldValue::Protected(ProtectedValue::new(&plaintext))
        }
        KIND_BINARY_REF => {
            let id: [u8; 32] = value_bytes
                .try_into()
                .map_err(|_| Error::Corrupted("bad binary reference".to_string()))?;
            FieldValue::BinaryRef(id)
        }
        KIND_BOOL => FieldValue::Bool(value_bytes.first().copied().unwrap_or(0) != 0),
        other => {
            return Err(Error::Corrupted(format!("unknown field kind: {other}")));
        }
    };

    let mut field = Field::new(name, value);
    field.auto_fill = flags & FLAG_AUTO_FILL != 0;
    Ok(field)
}
