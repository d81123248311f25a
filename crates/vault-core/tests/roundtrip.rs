//! End-to-end container tests: build a database through the public API,
//! save it, reopen it, and check what comes back.

use vault_core::{
    open, save, CipherAlgorithm, Compression, Database, EncodeOptions, Entry, EntryBuilder, Error,
    FieldValue, Group, KdfParams, SecretKey,
};

const FIELD_PASSWORD: &str = "Password";

fn fast_options() -> EncodeOptions {
    let mut kdf = KdfParams::argon2id_default();
    kdf.memory_kib = 64;
    kdf.iterations = 1;
    kdf.parallelism = 1;
    EncodeOptions {
        kdf,
        ..EncodeOptions::default()
    }
}

fn populated_db() -> Database {
    let mut db = Database::new("Personal");
    let root = db.root_uuid();
    let work = db.add_group(root, Group::new("Work")).unwrap();
    let email = db.add_group(work, Group::new("Email")).unwrap();

    db.add_entry(
        Some(work),
        EntryBuilder::new("GitHub")
            .username("alice")
            .password("hunter2")
            .url("https://github.com")
            .build(),
    )
    .unwrap();
    let e = db
        .add_entry(
            Some(email),
            EntryBuilder::new("Fastmail").username("alice@example.com").build(),
        )
        .unwrap();
    db.set_field(&e, FIELD_PASSWORD, FieldValue::protected("old-password"))
        .unwrap();
    db.set_field(&e, FIELD_PASSWORD, FieldValue::protected("new-password"))
        .unwrap();
    db.attach_binary(&e, "backup-codes", b"1111 2222 3333".to_vec())
        .unwrap();
    db
}

#[test]
fn save_open_round_trip_preserves_everything() {
    let db = populated_db();
    let secret = SecretKey::from_password("master");

    let bytes = save(&db, &secret, &fast_options()).unwrap();
    let restored = open(&bytes, &secret).unwrap();

    assert_eq!(restored, db);
    assert_eq!(restored.metadata().entry_count, 2);
    assert_eq!(restored.metadata().group_count, 3);
}

#[test]
fn protected_values_survive_the_container() {
    let db = populated_db();
    let secret = SecretKey::from_password("master");
    let restored = open(&save(&db, &secret, &fast_options()).unwrap(), &secret).unwrap();

    let entry = restored
        .entries()
        .find(|e| e.title() == "Fastmail")
        .unwrap();
    match entry.field(FIELD_PASSWORD) {
        Some(FieldValue::Protected(p)) => {
            assert_eq!(p.reveal().as_str(), Some("new-password"));
        }
        other => panic!("expected protected password, got {other:?}"),
    }
    // history carries the prior password too
    assert!(!entry.history().is_empty());
}

#[test]
fn two_saves_of_the_same_database_differ_on_the_wire() {
    let db = populated_db();
    let secret = SecretKey::from_password("master");
    let a = save(&db, &secret, &fast_options()).unwrap();
    let b = save(&db, &secret, &fast_options()).unwrap();
    // fresh seed, IV and salt every save
    assert_ne!(a, b);
    assert_eq!(open(&a, &secret).unwrap(), open(&b, &secret).unwrap());
}

#[test]
fn wrong_password_reports_authentication_failure_only() {
    let db = populated_db();
    let secret = SecretKey::from_password("master");
    let bytes = save(&db, &secret, &fast_options()).unwrap();

    let err = open(&bytes, &SecretKey::from_password("masterr")).unwrap_err();
    assert!(matches!(err, Error::AuthenticationFailed));
    // the message must not hint at which check failed
    assert_eq!(
        err.to_string(),
        "authentication failed: wrong secret or corrupted data"
    );
}

#[test]
fn key_file_is_part_of_the_secret() {
    let db = populated_db();
    let secret = SecretKey::compose(Some(b"master"), Some(b"keyfile-bytes"));
    let bytes = save(&db, &secret, &fast_options()).unwrap();

    assert!(open(&bytes, &secret).is_ok());
    assert!(matches!(
        open(&bytes, &SecretKey::from_password("master")),
        Err(Error::AuthenticationFailed)
    ));
}

#[test]
fn tampered_body_is_rejected() {
    let db = populated_db();
    let secret = SecretKey::from_password("master");
    let mut bytes = save(&db, &secret, &fast_options()).unwrap();

    let last = bytes.len() - 1;
    bytes[last] ^= 0x01;
    assert!(matches!(
        open(&bytes, &secret),
        Err(Error::AuthenticationFailed)
    ));
}

#[test]
fn garbage_input_is_malformed_not_a_panic() {
    let secret = SecretKey::from_password("master");
    assert!(matches!(
        open(b"not a vault", &secret),
        Err(Error::MalformedHeader(_))
    ));
    assert!(matches!(open(&[], &secret), Err(Error::MalformedHeader(_))));
}

#[test]
fn every_cipher_and_compression_combination_round_trips() {
    let db = populated_db();
    let secret = SecretKey::from_password("master");

    for cipher in [CipherAlgorithm::Aes256Cbc, CipherAlgorithm::ChaCha20] {
        for compression in [Compression::Gzip, Compression::None] {
            let options = EncodeOptions {
                cipher,
                compression,
                ..fast_options()
            };
            let bytes = save(&db, &secret, &options).unwrap();
            assert_eq!(open(&bytes, &secret).unwrap(), db, "{cipher:?}/{compression:?}");
        }
    }
}

#[test]
fn unknown_kdf_id_is_rejected_before_any_decryption() {
    let db = populated_db();
    let secret = SecretKey::from_password("master");
    let mut bytes = save(&db, &secret, &fast_options()).unwrap();

    // rewrite the $ID value inside the KDF parameter dictionary
    let pos = bytes.windows(3).position(|w| w == b"$ID").unwrap();
    let value = pos + 3 + 4; // key bytes, then the value length prefix
    bytes[value..value + 4].copy_from_slice(&99u32.to_le_bytes());

    assert!(matches!(
        open(&bytes, &secret),
        Err(Error::UnsupportedKdf(99))
    ));
}

#[test]
fn tombstones_survive_a_save() {
    let mut db = populated_db();
    let doomed = db.add_entry(None, Entry::new("Throwaway")).unwrap();
    db.delete_entry(&doomed).unwrap();

    let secret = SecretKey::from_password("master");
    let restored = open(&save(&db, &secret, &fast_options()).unwrap(), &secret).unwrap();
    assert_eq!(restored.tombstone(&doomed), db.tombstone(&doomed));
}
