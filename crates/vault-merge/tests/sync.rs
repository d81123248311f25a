//! A full sync cycle: two devices open the same container, edit
//! independently, and reconcile through the merge engine. The merged
//! result must itself survive a save/open round trip.

use vault_core::{
    open, save, Database, EncodeOptions, EntryBuilder, FieldValue, Group, KdfParams, SecretKey,
};
use vault_merge::merge;

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

#[test]
fn two_devices_diverge_and_reconcile() {
    let secret = SecretKey::from_password("shared master");

    let mut db = Database::new("Family");
    let shared = db.add_group(db.root_uuid(), Group::new("Shared")).unwrap();
    let wifi = db
        .add_entry(Some(shared), EntryBuilder::new("Wi-Fi").password("old-wifi").build())
        .unwrap();
    let synced = save(&db, &secret, &fast_options()).unwrap();

    // device A rotates the Wi-Fi password
    let mut device_a = open(&synced, &secret).unwrap();
    device_a
        .set_field(&wifi, FIELD_PASSWORD, FieldValue::protected("new-wifi"))
        .unwrap();

    // device B adds a new entry in parallel
    std::thread::sleep(std::time::Duration::from_millis(2));
    let mut device_b = open(&synced, &secret).unwrap();
    let router = device_b
        .add_entry(Some(shared), EntryBuilder::new("Router admin").password("hunter2").build())
        .unwrap();

    let (merged, stats) = merge(&device_a, &device_b).unwrap();
    assert_eq!(stats.entries_added, 1);
    assert_eq!(
        merged.get_entry(&wifi).unwrap().field(FIELD_PASSWORD),
        Some(&FieldValue::protected("new-wifi"))
    );
    assert!(merged.get_entry(&router).is_some());

    // and the reconciled database round-trips through the container
    let bytes = save(&merged, &secret, &fast_options()).unwrap();
    let reopened = open(&bytes, &secret).unwrap();
    assert_eq!(reopened, merged);
}

#[test]
fn replaying_a_merge_after_saving_changes_nothing() {
    let secret = SecretKey::from_password("shared master");

    let mut db = Database::new("Family");
    let entry = db.add_entry(None, EntryBuilder::new("Bank").password("p1").build()).unwrap();
    let synced = save(&db, &secret, &fast_options()).unwrap();

    let device_a = open(&synced, &secret).unwrap();
    let mut device_b = open(&synced, &secret).unwrap();
    device_b.delete_entry(&entry).unwrap();

    let (merged, _) = merge(&device_a, &device_b).unwrap();
    assert!(merged.get_entry(&entry).is_none());
    assert!(merged.tombstone(&entry).is_some());

    let bytes = save(&merged, &secret, &fast_options()).unwrap();
    let reopened = open(&bytes, &secret).unwrap();
    let (again, _) = merge(&reopened, &device_b).unwrap();
    assert_eq!(again, merged);
}
