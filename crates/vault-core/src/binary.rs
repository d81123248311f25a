//! Content-addressed binary attachments
//!
//! Attachments are stored once per database, keyed by the SHA-256 of their
//! content. Entries reference them through [`BinaryId`] fields, so the same
//! file attached to ten entries costs its size once.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Content hash identifying a blob in the pool
pub type BinaryId = [u8; 32];

/// Deduplicated attachment storage owned by a database
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BinaryPool {
    blobs: HashMap<BinaryId, Vec<u8>>,
}

impl BinaryPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a blob, returning its content id. Inserting the same content
    /// twice is a no-op.
    pub fn insert(&mut self, data: Vec<u8>) -> BinaryId {
        let id = Self::hash(&data);
        self.blobs.entry(id).or_insert(data);
        id
    }

    /// Insert a blob under a known id (codec path; the id has been
    /// verified against the content by the caller).
    pub(crate) fn insert_with_id(&mut self, id: BinaryId, data: Vec<u8>) {
        self.blobs.insert(id, data);
    }

    pub fn get(&self, id: &BinaryId) -> Option<&[u8]> {
        self.blobs.get(id).map(Vec::as_slice)
    }

    pub fn contains(&self, id: &BinaryId) -> bool {
        self.blobs.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&BinaryId, &[u8])> {
        self.blobs.iter().map(|(id, data)| (id, data.as_slice()))
    }

    /// Drop blobs no entry references anymore
    pub fn retain_referenced(&mut self, referenced: &HashSet<BinaryId>) {
        self.blobs.retain(|id, _| referenced.contains(id));
    }

    /// Take every blob from `other` that this pool does not have yet
    pub fn absorb(&mut self, other: &BinaryPool) {
        for (id, data) in &other.blobs {
            self.blobs.entry(*id).or_insert_with(|| data.clone());
        }
    }

    pub fn hash(data: &[u8]) -> BinaryId {
        let mut id = [0u8; 32];
        id.copy_from_slice(&Sha256::digest(data));
        id
    }
}
