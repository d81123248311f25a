//! Groups: the folder tree of a vault

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::times;

/// A group containing entries and subgroups
///
/// Child order is meaningful: it is the user-visible sort, preserved by
/// the codec and by merges. The parent reference is a non-owning
/// back-reference used for move/delete validation only; ownership lives in
/// the database's id-indexed tables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Group {
    /// Unique identifier for this group
    pub uuid: Uuid,
    /// Group name
    pub name: String,
    /// Notes for this group
    pub notes: String,
    /// Icon ID
    pub icon_id: Option<u32>,
    /// UUID of the parent group (None for root)
    pub parent: Option<Uuid>,
    /// UUIDs of child groups, in display order
    #[serde(default)]
    pub children: Vec<Uuid>,
    /// UUIDs of entries in this group, in display order
    #[serde(default)]
    pub entries: Vec<Uuid>,
    /// Creation time
    pub created: DateTime<Utc>,
    /// Last modification time
    pub modified: DateTime<Utc>,
    /// Expiry time (if set)
    pub expires: Option<DateTime<Utc>>,
    /// Whether expiry is enabled
    pub expires_enabled: bool,
    /// Unrecognized container tags carried through load/save
    #[serde(default, skip)]
    pub unknown_fields: Vec<(u8, Vec<u8>)>,
}

impl Group {
    /// Create a new group with the given name
    pub fn new(name: impl Into<String>) -> Self {
        let now = times::now();
        Self {
            uuid: Uuid::new_v4(),
            name: name.into(),
            notes: String::new(),
            icon_id: None,
            parent: None,
            children: Vec::new(),
            entries: Vec::new(),
            created: now,
            modified: now,
            expires: None,
            expires_enabled: false,
            unknown_fields: Vec::new(),
        }
    }

    /// Create a group with a specific UUID (codec load path)
    pub fn with_uuid(uuid: Uuid, name: impl Into<String>) -> Self {
        let mut group = Self::new(name);
        group.uuid = uuid;
        group
    }

    /// Append a child group UUID, keeping order
    pub fn add_child(&mut self, child_uuid: Uuid) {
        if !self.children.contains(&child_uuid) {
            self.children.push(child_uuid);
            self.mark_modified();
        }
    }

    /// Remove a child group UUID
    pub fn remove_child(&mut self, child_uuid: &Uuid) -> bool {
        if let Some(pos) = self.children.iter().position(|u| u == child_uuid) {
            self.children.remove(pos);
            self.mark_modified();
            true
        } else {
            false
        }
    }

    /// Append an entry UUID, keeping order
    pub fn add_entry(&mut self, entry_uuid: Uuid) {
        if !self.entries.contains(&entry_uuid) {
            self.entries.push(entry_uuid);
            self.mark_modified();
        }
    }

    /// Remove an entry UUID from this group
    pub fn remove_entry(&mut self, entry_uuid: &Uuid) -> bool {
        if let Some(pos) = self.entries.iter().position(|u| u == entry_uuid) {
            self.entries.remove(pos);
            self.mark_modified();
            true
        } else {
            false
        }
    }

    /// Check if this is a root group (no parent)
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    /// Mark as modified
    pub fn mark_modified(&mut self) {
        self.modified = times::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_creation() {
        let group = Group::new("Email");
        assert_eq!(group.name, "Email");
        assert!(group.is_root());
        assert!(group.children.is_empty());
        assert!(group.entries.is_empty());
    }

    #[test]
    fn child_order_is_preserved() {
        let mut group = Group::new("Parent");
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let c = Uuid::new_v4();

        group.add_child(a);
        group.add_child(b);
        group.add_child(c);
        assert_eq!(group.children, vec![a, b, c]);

        // adding the same child again must not duplicate or reorder
        group.add_child(b);
        assert_eq!(group.children, vec![a, b, c]);

        assert!(group.remove_child(&b));
        assert_eq!(group.children, vec![a, c]);
        assert!(!group.remove_child(&b));
    }

    #[test]
    fn entry_membership() {
        let mut group = Group::new("Parent");
        let entry_uuid = Uuid::new_v4();

        group.add_entry(entry_uuid);
        assert_eq!(group.entries.len(), 1);

        assert!(group.remove_entry(&entry_uuid));
        assert!(group.entries.is_empty());
    }
}
