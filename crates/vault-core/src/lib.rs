//! Core engine for encrypted credential vaults
//!
//! A vault is a single encrypted container holding a tree of groups,
//! credential entries with per-field edit history, and content-addressed
//! binary attachments. This crate covers the whole pipeline from bytes to
//! model and back: key derivation, the authenticated container codec, and
//! the in-memory database with its mutation API. Sync-style reconciliation
//! of two databases lives in the companion `vault-merge` crate.
//!
//! ```no_run
//! use vault_core::{Database, EntryBuilder, SecretKey};
//!
//! # fn main() -> vault_core::Result<()> {
//! let mut db = Database::new("Personal");
//! db.add_entry(None, EntryBuilder::new("GitHub").username("alice").password("s3cret").build())?;
//!
//! let secret = SecretKey::from_password("master password");
//! let bytes = vault_core::save(&db, &secret, &Default::default())?;
//! let restored = vault_core::open(&bytes, &secret)?;
//! assert_eq!(restored.metadata().entry_count, 1);
//! # Ok(())
//! # }
//! ```

pub mod binary;
pub mod codec;
pub mod crypto;
pub mod database;
pub mod entry;
pub mod error;
pub mod field;
pub mod group;
pub mod header;
pub mod kdf;
pub mod protected;
pub mod times;

pub use binary::{BinaryId, BinaryPool};
pub use codec::{decode_cancellable, read_header, EncodeOptions};
pub use crypto::CipherAlgorithm;
pub use database::{Database, DatabaseMetadata, GroupTreeNode};
pub use entry::{Entry, EntryBuilder, EntrySnapshot};
pub use error::{Error, Result};
pub use field::{Field, FieldValue};
pub use group::Group;
pub use header::{Compression, Header, ParsedHeader};
pub use kdf::{KdfAlgorithm, KdfParams, MasterKey, SecretKey};
pub use protected::{ProtectedValue, RevealedValue};

/// Decrypt and parse a vault container
pub fn open(data: &[u8], secret: &SecretKey) -> Result<Database> {
    codec::decode(data, secret)
}

/// Serialize and encrypt a database into a vault container
pub fn save(db: &Database, secret: &SecretKey, options: &EncodeOptions) -> Result<Vec<u8>> {
    codec::encode(db, secret, options)
}
