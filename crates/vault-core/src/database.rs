//! The in-memory database: arena-style storage and the mutation API
//!
//! Groups and entries live in id-indexed tables owned by the database;
//! parent/child relations are stored as id references, never as owning
//! pointers, so the tree cannot form reference cycles. Every mutation bumps
//! the generation counter. Deletes leave tombstones behind for the merge
//! engine instead of silently vanishing.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::binary::{BinaryId, BinaryPool};
use crate::entry::Entry;
use crate::error::{Error, Result};
use crate::field::FieldValue;
use crate::group::Group;
use crate::times;

/// A credential database: root group tree, entries, attachments, tombstones
#[derive(Debug, Clone, PartialEq)]
pub struct Database {
    uuid: Uuid,
    name: String,
    generation: u64,
    groups: HashMap<Uuid, Group>,
    entries: HashMap<Uuid, Entry>,
    root: Uuid,
    binaries: BinaryPool,
    tombstones: HashMap<Uuid, DateTime<Utc>>,
    unknown_records: Vec<(u8, Vec<u8>)>,
    unknown_header_fields: Vec<(u8, Vec<u8>)>,
}

/// Metadata about the database (for display without walking the tree)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseMetadata {
    pub name: String,
    pub entry_count: usize,
    pub group_count: usize,
    pub generation: u64,
}

/// A tree node for ordered rendering of the group hierarchy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupTreeNode {
    pub uuid: Uuid,
    pub name: String,
    pub entry_count: usize,
    pub children: Vec<GroupTreeNode>,
}

impl Database {
    /// Create a new empty database with a root group
    pub fn new(name: impl Into<String>) -> Self {
        let root = Group::new("Root");
        let root_uuid = root.uuid;
        let mut groups = HashMap::new();
        groups.insert(root_uuid, root);

        Self {
            uuid: Uuid::new_v4(),
            name: name.into(),
            generation: 0,
            groups,
            entries: HashMap::new(),
            root: root_uuid,
            binaries: BinaryPool::new(),
            tombstones: HashMap::new(),
            unknown_records: Vec::new(),
            unknown_header_fields: Vec::new(),
        }
    }

    /// Reassemble a database from raw parts (codec and merge paths).
    ///
    /// Validates that the root group exists; link consistency is the
    /// caller's responsibility.
    #[allow(clippy::too_many_arguments)]
    pub fn from_parts(
        uuid: Uuid,
        name: String,
        generation: u64,
        root: Uuid,
        groups: HashMap<Uuid, Group>,
        entries: HashMap<Uuid, Entry>,
        binaries: BinaryPool,
        tombstones: HashMap<Uuid, DateTime<Utc>>,
    ) -> Result<Self> {
        if !groups.contains_key(&root) {
            return Err(Error::Corrupted("root group missing".to_string()));
        }
        Ok(Self {
            uuid,
            name,
            generation,
            groups,
            entries,
            root,
            binaries,
            tombstones,
            unknown_records: Vec::new(),
            unknown_header_fields: Vec::new(),
        })
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn rename(&mut self, name: impl Into<String>) {
        self.name = name.into();
        self.bump();
    }

    /// Flat counter incremented by every mutation
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn root_uuid(&self) -> Uuid {
        self.root
    }

    /// The root group. Always present.
    pub fn root_group(&self) -> &Group {
        &self.groups[&self.root]
    }

    pub fn metadata(&self) -> DatabaseMetadata {
        DatabaseMetadata {
            name: self.name.clone(),
            entry_count: self.entries.len(),
            group_count: self.groups.len(),
            generation: self.generation,
        }
    }

    fn bump(&mut self) {
        self.generation += 1;
    }

    // ---- lookups -------------------------------------------------------

    pub fn entries(&self) -> impl Iterator<Item = &Entry> {
        self.entries.values()
    }

    pub fn get_entry(&self, uuid: &Uuid) -> Option<&Entry> {
        self.entries.get(uuid)
    }

    pub fn groups(&self) -> impl Iterator<Item = &Group> {
        self.groups.values()
    }

    pub fn get_group(&self, uuid: &Uuid) -> Option<&Group> {
        self.groups.get(uuid)
    }

    /// Deletion markers kept for merge reconciliation
    pub fn tombstones(&self) -> impl Iterator<Item = (&Uuid, &DateTime<Utc>)> {
        self.tombstones.iter()
    }

    pub fn tombstone(&self, uuid: &Uuid) -> Option<DateTime<Utc>> {
        self.tombstones.get(uuid).copied()
    }

    pub fn binaries(&self) -> &BinaryPool {
        &self.binaries
    }

    pub(crate) fn unknown_records(&self) -> &[(u8, Vec<u8>)] {
        &self.unknown_records
    }

    pub(crate) fn set_unknown_records(&mut self, records: Vec<(u8, Vec<u8>)>) {
        self.unknown_records = records;
    }

    /// Unrecognized outer-header fields, written back verbatim on save
    pub(crate) fn unknown_header_fields(&self) -> &[(u8, Vec<u8>)] {
        &self.unknown_header_fields
    }

    pub(crate) fn set_unknown_header_fields(&mut self, fields: Vec<(u8, Vec<u8>)>) {
        self.unknown_header_fields = fields;
    }

    // ---- group mutations -----------------------------------------------

    /// Add a group under `parent`
    pub fn add_group(&mut self, parent: Uuid, mut group: Group) -> Result<Uuid> {
        if !self.groups.contains_key(&parent) {
            return Err(Error::GroupNotFound(parent));
        }
        let uuid = group.uuid;
        group.parent = Some(parent);
        self.groups.insert(uuid, group);
        if let Some(p) = self.groups.get_mut(&parent) {
            p.add_child(uuid);
        }
        self.bump();
        Ok(uuid)
    }

    pub fn rename_group(&mut self, uuid: &Uuid, name: impl Into<String>) -> Result<()> {
        let group = self.groups.get_mut(uuid).ok_or(Error::GroupNotFound(*uuid))?;
        group.name = name.into();
        group.mark_modified();
        self.bump();
        Ok(())
    }

    /// Move a group under a new parent. Rejects moving the root and any
    /// move that would make a group its own ancestor.
    pub fn move_group(&mut self, uuid: &Uuid, new_parent: &Uuid) -> Result<()> {
        if *uuid == self.root {
            return Err(Error::InvalidGroup("cannot move the root group".to_string()));
        }
        if !self.groups.contains_key(uuid) {
            return Err(Error::GroupNotFound(*uuid));
        }
        if !self.groups.contains_key(new_parent) {
            return Err(Error::GroupNotFound(*new_parent));
        }
        if self.is_ancestor_or_self(uuid, new_parent) {
            return Err(Error::InvalidGroup(
                "a group cannot become its own ancestor".to_string(),
            ));
        }

        let old_parent = self.groups[uuid].parent;
        if let Some(op) = old_parent {
            if let Some(g) = self.groups.get_mut(&op) {
                g.remove_child(uuid);
            }
        }
        if let Some(g) = self.groups.get_mut(new_parent) {
            g.add_child(*uuid);
        }
        if let Some(g) = self.groups.get_mut(uuid) {
            g.parent = Some(*new_parent);
            g.mark_modified();
        }
        self.bump();
        Ok(())
    }

    /// Walk parents of `candidate` and report whether `uuid` is on the path
    /// (or is the candidate itself).
    fn is_ancestor_or_self(&self, uuid: &Uuid, candidate: &Uuid) -> bool {
        let mut current = Some(*candidate);
        while let Some(c) = current {
            if c == *uuid {
                return true;
            }
            current = self.groups.get(&c).and_then(|g| g.parent);
        }
        false
    }

    /// Delete a group. Cascades to contained entries and subgroups; every
    /// deleted object is recorded as a tombstone.
    pub fn delete_group(&mut self, uuid: &Uuid) -> Result<()> {
        if *uuid == self.root {
            return Err(Error::InvalidGroup("cannot delete the root group".to_string()));
        }
        if !self.groups.contains_key(uuid) {
            return Err(Error::GroupNotFound(*uuid));
        }

        let now = times::now();
        let mut group_queue = vec![*uuid];
        let mut doomed_groups = Vec::new();
        while let Some(g) = group_queue.pop() {
            if let Some(group) = self.groups.get(&g) {
                group_queue.extend(group.children.iter().copied());
                doomed_groups.push(g);
            }
        }

        if let Some(parent) = self.groups[uuid].parent {
            if let Some(p) = self.groups.get_mut(&parent) {
                p.remove_child(uuid);
            }
        }

        for g in doomed_groups {
            if let Some(group) = self.groups.remove(&g) {
                for entry_uuid in &group.entries {
                    self.entries.remove(entry_uuid);
                    self.tombstones.insert(*entry_uuid, now);
                }
                self.tombstones.insert(g, now);
            }
        }
        self.bump();
        Ok(())
    }

    // ---- entry mutations -----------------------------------------------

    /// Add an entry to a group (root if `parent` is None)
    pub fn add_entry(&mut self, parent: Option<Uuid>, mut entry: Entry) -> Result<Uuid> {
        let parent = parent.or(entry.parent_group).unwrap_or(self.root);
        if !self.groups.contains_key(&parent) {
            return Err(Error::GroupNotFound(parent));
        }
        let uuid = entry.uuid;
        entry.parent_group = Some(parent);
        self.entries.insert(uuid, entry);
        if let Some(g) = self.groups.get_mut(&parent) {
            g.add_entry(uuid);
        }
        // an add supersedes any tombstone for the same id
        self.tombstones.remove(&uuid);
        self.bump();
        Ok(uuid)
    }

    /// Edit a field on an entry; the prior state goes into its history
    pub fn set_field(&mut self, uuid: &Uuid, name: &str, value: FieldValue) -> Result<()> {
        let entry = self.entries.get_mut(uuid).ok_or(Error::EntryNotFound(*uuid))?;
        entry.set_field(name, value);
        self.bump();
        Ok(())
    }

    /// Move an entry into a different group
    pub fn move_entry(&mut self, uuid: &Uuid, new_group: &Uuid) -> Result<()> {
        if !self.entries.contains_key(uuid) {
            return Err(Error::EntryNotFound(*uuid));
        }
        if !self.groups.contains_key(new_group) {
            return Err(Error::GroupNotFound(*new_group));
        }

        let old_group = self.entries[uuid].parent_group;
        if let Some(og) = old_group {
            if let Some(g) = self.groups.get_mut(&og) {
                g.remove_entry(uuid);
            }
        }
        if let Some(g) = self.groups.get_mut(new_group) {
            g.add_entry(*uuid);
        }
        if let Some(e) = self.entries.get_mut(uuid) {
            e.parent_group = Some(*new_group);
            e.modified = times::now();
        }
        self.bump();
        Ok(())
    }

    /// Delete an entry, recording a tombstone
    pub fn delete_entry(&mut self, uuid: &Uuid) -> Result<Entry> {
        let entry = self.entries.remove(uuid).ok_or(Error::EntryNotFound(*uuid))?;
        if let Some(parent) = entry.parent_group {
            if let Some(g) = self.groups.get_mut(&parent) {
                g.remove_entry(uuid);
            }
        }
        self.tombstones.insert(*uuid, times::now());
        self.bump();
        Ok(entry)
    }

    /// Attach a blob to an entry as a binary-reference field
    pub fn attach_binary(&mut self, uuid: &Uuid, field_name: &str, data: Vec<u8>) -> Result<BinaryId> {
        if !self.entries.contains_key(uuid) {
            return Err(Error::EntryNotFound(*uuid));
        }
        let id = self.binaries.insert(data);
        self.set_field(uuid, field_name, FieldValue::BinaryRef(id))?;
        Ok(id)
    }

    /// Read an attached blob back
    pub fn binary(&self, id: &BinaryId) -> Result<&[u8]> {
        self.binaries.get(id).ok_or(Error::BinaryNotFound)
    }

    // ---- merge support -------------------------------------------------

    /// Record a deletion marker directly (merge path)
    pub fn set_tombstone(&mut self, uuid: Uuid, at: DateTime<Utc>) {
        self.tombstones.insert(uuid, at);
    }

    /// Drop a deletion marker (an edit won over the delete)
    pub fn discard_tombstone(&mut self, uuid: &Uuid) -> bool {
        self.tombstones.remove(uuid).is_some()
    }

    // ---- traversal -----------------------------------------------------

    /// Ordered tree of the group hierarchy for rendering
    pub fn group_tree(&self) -> GroupTreeNode {
        self.build_group_tree(&self.root)
    }

    fn build_group_tree(&self, uuid: &Uuid) -> GroupTreeNode {
        let group = &self.groups[uuid];
        GroupTreeNode {
            uuid: *uuid,
            name: group.name.clone(),
            entry_count: group.entries.len(),
            children: group
                .children
                .iter()
                .filter(|c| self.groups.contains_key(c))
                .map(|c| self.build_group_tree(c))
                .collect(),
        }
    }

    /// Entries of one group, in display order
    pub fn entries_in_group(&self, group_uuid: &Uuid) -> Vec<&Entry> {
        self.groups
            .get(group_uuid)
            .map(|group| {
                group
                    .entries
                    .iter()
                    .filter_map(|uuid| self.entries.get(uuid))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Group UUIDs in depth-first display order, root first. Each group is
    /// visited at most once, so a malformed child list cannot loop.
    pub fn groups_depth_first(&self) -> Vec<Uuid> {
        let mut out = Vec::with_capacity(self.groups.len());
        let mut seen = HashSet::with_capacity(self.groups.len());
        let mut stack = vec![self.root];
        while let Some(uuid) = stack.pop() {
            if !seen.insert(uuid) {
                continue;
            }
            if let Some(group) = self.groups.get(&uuid) {
                out.push(uuid);
                for child in group.children.iter().rev() {
                    if self.groups.contains_key(child) {
                        stack.push(*child);
                    }
                }
            }
        }
        out
    }

    /// Every binary id referenced from current fields or history
    pub fn referenced_binaries(&self) -> HashSet<BinaryId> {
        let mut refs = HashSet::new();
        for entry in self.entries.values() {
            for field in entry.fields() {
                if let FieldValue::BinaryRef(id) = &field.value {
                    refs.insert(*id);
                }
            }
            for snapshot in entry.history() {
                for field in &snapshot.fields {
                    if let FieldValue::BinaryRef(id) = &field.value {
                        refs.insert(*id);
                    }
                }
            }
        }
        refs
    }

    /// Drop attachments nothing references anymore (save path)
    pub fn prune_binaries(&mut self) {
        let referenced = self.referenced_binaries();
        self.binaries.retain_referenced(&referenced);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::EntryBuilder;
    use crate::field::{FIELD_PASSWORD, FIELD_USERNAME};

    #[test]
    fn new_database_has_root_only() {
        let db = Database::new("Personal");
        assert_eq!(db.name(), "Personal");
        assert_eq!(db.groups().count(), 1);
        assert_eq!(db.entries().count(), 0);
        assert_eq!(db.generation(), 0);
    }

    #[test]
    fn mutations_bump_the_generation() {
        let mut db = Database::new("Test");
        let g = db.add_group(db.root_uuid(), Group::new("Work")).unwrap();
        let e = db.add_entry(Some(g), Entry::new("GitHub")).unwrap();
        db.set_field(&e, FIELD_USERNAME, FieldValue::Text("alice".into()))
            .unwrap();
        db.delete_entry(&e).unwrap();
        assert_eq!(db.generation(), 4);
    }

    #[test]
    fn delete_entry_leaves_a_tombstone() {
        let mut db = Database::new("Test");
        let e = db.add_entry(None, Entry::new("GitHub")).unwrap();
        db.delete_entry(&e).unwrap();
        assert!(db.get_entry(&e).is_none());
        assert!(db.tombstone(&e).is_some());
    }

    #[test]
    fn group_delete_cascades_and_tombstones_everything() {
        let mut db = Database::new("Test");
        let work = db.add_group(db.root_uuid(), Group::new("Work")).unwrap();
        let sub = db.add_group(work, Group::new("CI")).unwrap();
        let e1 = db.add_entry(Some(work), Entry::new("A")).unwrap();
        let e2 = db.add_entry(Some(sub), Entry::new("B")).unwrap();

        db.delete_group(&work).unwrap();

        assert!(db.get_group(&work).is_none());
        assert!(db.get_group(&sub).is_none());
        assert!(db.get_entry(&e1).is_none());
        assert!(db.get_entry(&e2).is_none());
        for uuid in [work, sub, e1, e2] {
            assert!(db.tombstone(&uuid).is_some(), "missing tombstone for {uuid}");
        }
    }

    #[test]
    fn cannot_delete_or_move_root() {
        let mut db = Database::new("Test");
        let root = db.root_uuid();
        let g = db.add_group(root, Group::new("Work")).unwrap();
        assert!(matches!(db.delete_group(&root), Err(Error::InvalidGroup(_))));
        assert!(matches!(db.move_group(&root, &g), Err(Error::InvalidGroup(_))));
    }

    #[test]
    fn moving_a_group_under_its_descendant_is_rejected() {
        let mut db = Database::new("Test");
        let a = db.add_group(db.root_uuid(), Group::new("A")).unwrap();
        let b = db.add_group(a, Group::new("B")).unwrap();
        let c = db.add_group(b, Group::new("C")).unwrap();

        assert!(matches!(db.move_group(&a, &c), Err(Error::InvalidGroup(_))));
        assert!(matches!(db.move_group(&a, &a), Err(Error::InvalidGroup(_))));
        // a legal reshuffle still works
        db.move_group(&c, &a).unwrap();
        assert_eq!(db.get_group(&c).unwrap().parent, Some(a));
    }

    #[test]
    fn move_entry_updates_both_groups() {
        let mut db = Database::new("Test");
        let work = db.add_group(db.root_uuid(), Group::new("Work")).unwrap();
        let e = db.add_entry(None, Entry::new("GitHub")).unwrap();

        db.move_entry(&e, &work).unwrap();
        assert_eq!(db.get_entry(&e).unwrap().parent_group, Some(work));
        assert!(db.root_group().entries.is_empty());
        assert_eq!(db.get_group(&work).unwrap().entries, vec![e]);
    }

    #[test]
    fn re_adding_a_deleted_entry_clears_its_tombstone() {
        let mut db = Database::new("Test");
        let entry = Entry::new("GitHub");
        let uuid = db.add_entry(None, entry.clone()).unwrap();
        db.delete_entry(&uuid).unwrap();
        db.add_entry(None, entry).unwrap();
        assert!(db.tombstone(&uuid).is_none());
    }

    #[test]
    fn attachments_are_content_addressed() {
        let mut db = Database::new("Test");
        let e1 = db.add_entry(None, Entry::new("A")).unwrap();
        let e2 = db.add_entry(None, Entry::new("B")).unwrap();

        let id1 = db.attach_binary(&e1, "ssh-key", vec![1, 2, 3]).unwrap();
        let id2 = db.attach_binary(&e2, "ssh-key", vec![1, 2, 3]).unwrap();
        assert_eq!(id1, id2);
        assert_eq!(db.binaries().len(), 1);
        assert_eq!(db.binary(&id1).unwrap(), &[1, 2, 3]);
    }

    #[test]
    fn prune_drops_unreferenced_binaries() {
        let mut db = Database::new("Test");
        let e = db.add_entry(None, Entry::new("A")).unwrap();
        db.attach_binary(&e, "key", vec![1]).unwrap();
        db.binaries.insert(vec![9, 9, 9]); // orphan

        db.prune_binaries();
        assert_eq!(db.binaries().len(), 1);
    }

    #[test]
    fn group_tree_reflects_display_order() {
        let mut db = Database::new("Test");
        let a = db.add_group(db.root_uuid(), Group::new("A")).unwrap();
        let b = db.add_group(db.root_uuid(), Group::new("B")).unwrap();
        db.add_entry(Some(a), EntryBuilder::new("X").build()).unwrap();

        let tree = db.group_tree();
        assert_eq!(tree.children.len(), 2);
        assert_eq!(tree.children[0].uuid, a);
        assert_eq!(tree.children[0].entry_count, 1);
        assert_eq!(tree.children[1].uuid, b);
    }

    #[test]
    fn field_edits_go_through_history() {
        let mut db = Database::new("Test");
        let e = db
            .add_entry(None, EntryBuilder::new("Bank").password("p1").build())
            .unwrap();
        db.set_field(&e, FIELD_PASSWORD, FieldValue::protected("p2"))
            .unwrap();
        assert_eq!(db.get_entry(&e).unwrap().history().len(), 1);
    }
}
