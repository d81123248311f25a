//! Last-write-wins reconciliation
//!
//! Every object (group or entry) resolves independently: the side with the
//! newer modification time wins; an exact tie falls back to a content
//! digest so the outcome never depends on argument order. Deletions are
//! arbitrated through tombstones, and an edit at or after the deletion
//! time revives the object. Entry histories are unioned, and the losing
//! side's current state is preserved as a history snapshot, so a merge
//! never destroys a value the user could want back.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use uuid::Uuid;
use vault_core::field::Field;
use vault_core::times;
use vault_core::{Database, Entry, EntrySnapshot, FieldValue, Group};

use crate::types::{MergeError, MergeStats, Side};

/// Merge a remote replica into a local one, producing a new database.
///
/// Both inputs are left untouched. The merged generation is the maximum of
/// the two inputs, not an increment, so replaying the same merge does not
/// make the replicas diverge again.
pub fn merge(local: &Database, remote: &Database) -> Result<(Database, MergeStats), MergeError> {
    if local.uuid() != remote.uuid() {
        return Err(MergeError::DatabaseMismatch {
            local: local.uuid(),
            remote: remote.uuid(),
        });
    }

    let root = local.root_uuid();
    let mut stats = MergeStats::default();

    // union of tombstones, newest marker per id; the root is never deletable
    let mut tombstones: HashMap<Uuid, DateTime<Utc>> = HashMap::new();
    for (uuid, at) in local.tombstones().chain(remote.tombstones()) {
        tombstones
            .entry(*uuid)
            .and_modify(|cur| *cur = (*cur).max(*at))
            .or_insert(*at);
    }
    tombstones.remove(&root);

    // ---- resolve groups ------------------------------------------------

    let group_ids: BTreeSet<Uuid> = local
        .groups()
        .map(|g| g.uuid)
        .chain(remote.groups().map(|g| g.uuid))
        .collect();

    let mut groups: HashMap<Uuid, Group> = HashMap::new();
    let mut group_side: HashMap<Uuid, Side> = HashMap::new();

    for uuid in group_ids {
        let (winner, side, remote_only) = match (local.get_group(&uuid), remote.get_group(&uuid)) {
            (Some(l), Some(r)) => {
                let side = pick_side(l.modified, r.modified, || group_digest(l), || group_digest(r));
                let winner = match side {
                    Side::Local => l.clone(),
                    Side::Remote => r.clone(),
                };
                (winner, side, false)
            }
            (Some(l), None) => (l.clone(), Side::Local, false),
            (None, Some(r)) => (r.clone(), Side::Remote, true),
            (None, None) => unreachable!("id came from one of the two sides"),
        };

        if uuid != root {
            if let Some(&at) = tombstones.get(&uuid) {
                if winner.modified >= at {
                    tombstones.remove(&uuid);
                    stats.tombstones_discarded += 1;
                } else {
                    stats.groups_deleted += 1;
                    continue;
                }
            }
        }
        if remote_only {
            stats.groups_added += 1;
        }
        groups.insert(uuid, winner);
        group_side.insert(uuid, side);
    }

    // ---- resolve entries -----------------------------------------------

    let entry_ids: BTreeSet<Uuid> = local
        .entries()
        .map(|e| e.uuid)
        .chain(remote.entries().map(|e| e.uuid))
        .collect();

    let mut entries: HashMap<Uuid, Entry> = HashMap::new();
    let mut entry_side: HashMap<Uuid, Side> = HashMap::new();

    for uuid in entry_ids {
        let (merged, side, remote_only, differed) =
            match (local.get_entry(&uuid), remote.get_entry(&uuid)) {
                (Some(l), Some(r)) => {
                    let side =
                        pick_side(l.modified, r.modified, || entry_digest(l), || entry_digest(r));
                    let (winner, loser) = match side {
                        Side::Local => (l, r),
                        Side::Remote => (r, l),
                    };
                    let mut merged = winner.clone();
                    merged.union_history(loser.history());
                    if loser.modified != winner.modified {
                        merged.push_snapshot(EntrySnapshot {
                            timestamp: loser.modified,
                            fields: loser.fields().to_vec(),
                        });
                    }
                    merged.created = winner.created.min(loser.created);
                    merged.accessed = winner.accessed.max(loser.accessed);
                    (merged, side, false, l != r)
                }
                (Some(l), None) => (l.clone(), Side::Local, false, false),
                (None, Some(r)) => (r.clone(), Side::Remote, true, false),
                (None, None) => unreachable!("id came from one of the two sides"),
            };

        if let Some(&at) = tombstones.get(&uuid) {
            if merged.modified >= at {
                tombstones.remove(&uuid);
                stats.tombstones_discarded += 1;
            } else {
                stats.entries_deleted += 1;
                continue;
            }
        }
        if remote_only {
            stats.entries_added += 1;
        }
        if differed {
            stats.entries_resolved += 1;
        }
        entries.insert(uuid, merged);
        entry_side.insert(uuid, side);
    }

    // ---- reattach the tree ---------------------------------------------

    // every surviving group hangs off its nearest surviving ancestor
    let mut parent_of: BTreeMap<Uuid, Uuid> = BTreeMap::new();
    for (uuid, group) in &groups {
        if *uuid == root {
            continue;
        }
        let side_db = side_db(group_side[uuid], local, remote);
        parent_of.insert(
            *uuid,
            surviving_ancestor(group.parent, side_db, &groups, root),
        );
    }

    // conflicting moves on the two sides can close a loop; break it at the root
    let to_break: Vec<Uuid> = parent_of
        .keys()
        .filter(|&&uuid| {
            let mut seen = HashSet::from([uuid]);
            let mut current = parent_of[&uuid];
            while current != root {
                if !seen.insert(current) {
                    return true;
                }
                current = parent_of.get(&current).copied().unwrap_or(root);
            }
            false
        })
        .copied()
        .collect();
    for uuid in to_break {
        parent_of.insert(uuid, root);
    }

    let mut entry_parent: BTreeMap<Uuid, Uuid> = BTreeMap::new();
    for (uuid, entry) in &entries {
        let side_db = side_db(entry_side[uuid], local, remote);
        entry_parent.insert(
            *uuid,
            surviving_ancestor(entry.parent_group, side_db, &groups, root),
        );
    }

    // membership by parent; BTreeMap iteration keeps the fallback order stable
    let mut group_members: BTreeMap<Uuid, Vec<Uuid>> = BTreeMap::new();
    for (&child, &parent) in &parent_of {
        group_members.entry(parent).or_default().push(child);
    }
    let mut entry_members: BTreeMap<Uuid, Vec<Uuid>> = BTreeMap::new();
    for (&entry, &parent) in &entry_parent {
        entry_members.entry(parent).or_default().push(entry);
    }

    let group_uuids: Vec<Uuid> = groups.keys().copied().collect();
    for uuid in group_uuids {
        let child_set = group_members.remove(&uuid).unwrap_or_default();
        let entry_set = entry_members.remove(&uuid).unwrap_or_default();
        if let Some(group) = groups.get_mut(&uuid) {
            // winner's display order first, members it never saw appended
            group.children = ordered_union(&group.children, &child_set);
            group.entries = ordered_union(&group.entries, &entry_set);
            group.parent = if uuid == root {
                None
            } else {
                Some(parent_of[&uuid])
            };
        }
    }
    for (uuid, parent) in entry_parent {
        if let Some(entry) = entries.get_mut(&uuid) {
            entry.parent_group = Some(parent);
        }
    }

    // ---- assemble --------------------------------------------------------

    let name = if remote.generation() > local.generation() {
        remote.name().to_string()
    } else {
        local.name().to_string()
    };

    let mut binaries = local.binaries().clone();
    binaries.absorb(remote.binaries());

    let mut db = Database::from_parts(
        local.uuid(),
        name,
        local.generation().max(remote.generation()),
        root,
        groups,
        entries,
        binaries,
        tombstones,
    )?;
    db.prune_binaries();
    Ok((db, stats))
}

fn side_db<'a>(side: Side, local: &'a Database, remote: &'a Database) -> &'a Database {
    match side {
        Side::Local => local,
        Side::Remote => remote,
    }
}

/// Newer modification time wins; ties resolve by content digest so the
/// result is independent of which replica is "local".
fn pick_side(
    local_modified: DateTime<Utc>,
    remote_modified: DateTime<Utc>,
    local_digest: impl FnOnce() -> [u8; 32],
    remote_digest: impl FnOnce() -> [u8; 32],
) -> Side {
    match local_modified.cmp(&remote_modified) {
        std::cmp::Ordering::Greater => Side::Local,
        std::cmp::Ordering::Less => Side::Remote,
        std::cmp::Ordering::Equal => {
            if local_digest() >= remote_digest() {
                Side::Local
            } else {
                Side::Remote
            }
        }
    }
}

/// Walk `start`'s ancestor chain in `side_db` until a group that survived
/// the merge is found; the root catches everything else.
fn surviving_ancestor(
    start: Option<Uuid>,
    side_db: &Database,
    kept: &HashMap<Uuid, Group>,
    root: Uuid,
) -> Uuid {
    let mut current = start;
    while let Some(uuid) = current {
        if kept.contains_key(&uuid) {
            return uuid;
        }
        current = side_db.get_group(&uuid).and_then(|g| g.parent);
    }
    root
}

/// `stored` order first (restricted to actual members), then members the
/// stored order never saw, in their already-sorted fallback order.
fn ordered_union(stored: &[Uuid], members: &[Uuid]) -> Vec<Uuid> {
    let mut out: Vec<Uuid> = stored.iter().filter(|u| members.contains(u)).copied().collect();
    for member in members {
        if !out.contains(member) {
            out.push(*member);
        }
    }
    out
}

fn hash_len(hasher: &mut Sha256, len: usize) {
    hasher.update((len as u64).to_le_bytes());
}

fn hash_time(hasher: &mut Sha256, at: DateTime<Utc>) {
    hasher.update(times::to_micros(at).to_le_bytes());
}

fn hash_field(hasher: &mut Sha256, field: &Field) {
    hash_len(hasher, field.name.len());
    hasher.update(field.name.as_bytes());
    hasher.update([u8::from(field.auto_fill)]);
    match &field.value {
        FieldValue::Text(s) => {
            hasher.update([0]);
            hash_len(hasher, s.len());
            hasher.update(s.as_bytes());
        }
        FieldValue::Protected(p) => {
            let revealed = p.reveal();
            hasher.update([1]);
            hash_len(hasher, revealed.as_bytes().len());
            hasher.update(revealed.as_bytes());
        }
        FieldValue::BinaryRef(id) => {
            hasher.update([2]);
            hasher.update(id);
        }
        FieldValue::Bool(b) => {
            hasher.update([3, u8::from(*b)]);
        }
    }
}

fn entry_digest(entry: &Entry) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(entry.uuid.as_bytes());
    if let Some(parent) = entry.parent_group {
        hasher.update(parent.as_bytes());
    }
    hash_time(&mut hasher, entry.created);
    hash_time(&mut hasher, entry.modified);
    hash_len(&mut hasher, entry.fields().len());
    for field in entry.fields() {
        hash_field(&mut hasher, field);
    }
    hash_len(&mut hasher, entry.history().len());
    for snapshot in entry.history() {
        hash_time(&mut hasher, snapshot.timestamp);
        for field in &snapshot.fields {
            hash_field(&mut hasher, field);
        }
    }
    hasher.finalize().into()
}

fn group_digest(group: &Group) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(group.uuid.as_bytes());
    if let Some(parent) = group.parent {
        hasher.update(parent.as_bytes());
    }
    hash_len(&mut hasher, group.name.len());
    hasher.update(group.name.as_bytes());
    hash_len(&mut hasher, group.notes.len());
    hasher.update(group.notes.as_bytes());
    hash_time(&mut hasher, group.created);
    hash_time(&mut hasher, group.modified);
    for child in &group.children {
        hasher.update(child.as_bytes());
    }
    for entry in &group.entries {
        hasher.update(entry.as_bytes());
    }
    hasher.finalize().into()
}
