//! Entries and their edit history

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::field::{Field, FieldValue, FIELD_NOTES, FIELD_PASSWORD, FIELD_TITLE, FIELD_URL, FIELD_USERNAME};
use crate::times;

/// An immutable snapshot of an entry's fields, taken before a destructive
/// edit. Ordered by timestamp within [`Entry::history`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntrySnapshot {
    /// Modification time of the state this snapshot captured
    pub timestamp: DateTime<Utc>,
    pub fields: Vec<Field>,
}

/// A credential entry
///
/// Fields are an ordered, name-unique sequence. Editing a field pushes the
/// prior state into history first; history is append-only and never
/// rewritten by later edits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    /// Unique identifier, stable across saves and syncs
    pub uuid: Uuid,
    /// UUID of the owning group
    pub parent_group: Option<Uuid>,
    fields: Vec<Field>,
    history: Vec<EntrySnapshot>,
    /// Icon ID
    pub icon_id: Option<u32>,
    /// Creation time
    pub created: DateTime<Utc>,
    /// Last modification time
    pub modified: DateTime<Utc>,
    /// Last access time
    pub accessed: DateTime<Utc>,
    /// Expiry time (if set)
    pub expires: Option<DateTime<Utc>>,
    /// Whether expiry is enabled
    pub expires_enabled: bool,
    /// Unrecognized container tags carried through load/save
    #[serde(default, skip)]
    pub unknown_fields: Vec<(u8, Vec<u8>)>,
}

impl Entry {
    /// Create a new entry with the given title
    pub fn new(title: impl Into<String>) -> Self {
        let now = times::now();
        Self {
            uuid: Uuid::new_v4(),
            parent_group: None,
            fields: vec![Field::new(FIELD_TITLE, title.into())],
            history: Vec::new(),
            icon_id: None,
            created: now,
            modified: now,
            accessed: now,
            expires: None,
            expires_enabled: false,
            unknown_fields: Vec::new(),
        }
    }

    /// Ordered fields
    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// Look up a field value by name
    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields.iter().find(|f| f.name == name).map(|f| &f.value)
    }

    /// The Title field, or an empty string
    pub fn title(&self) -> &str {
        self.field(FIELD_TITLE).and_then(FieldValue::as_text).unwrap_or("")
    }

    /// Set or replace a field value.
    ///
    /// The prior state of the entry is pushed into history first; the edit
    /// itself is destructive to current state only. No-op if the value is
    /// unchanged.
    pub fn set_field(&mut self, name: impl Into<String>, value: FieldValue) {
        let name = name.into();
        if self.field(&name) == Some(&value) {
            return;
        }
        self.push_current_to_history();
        match self.fields.iter_mut().find(|f| f.name == name) {
            Some(field) => field.value = value,
            None => self.fields.push(Field::new(name, value)),
        }
        self.touch_modified();
    }

    /// Remove a field. Returns false if it did not exist.
    pub fn remove_field(&mut self, name: &str) -> bool {
        let Some(pos) = self.fields.iter().position(|f| f.name == name) else {
            return false;
        };
        self.push_current_to_history();
        self.fields.remove(pos);
        self.touch_modified();
        true
    }

    /// Toggle auto-fill matching for a field
    pub fn set_auto_fill(&mut self, name: &str, auto_fill: bool) -> bool {
        match self.fields.iter_mut().find(|f| f.name == name) {
            Some(field) => {
                field.auto_fill = auto_fill;
                true
            }
            None => false,
        }
    }

    /// Prior states, oldest first
    pub fn history(&self) -> &[EntrySnapshot] {
        &self.history
    }

    /// Append a snapshot, keeping history ordered by timestamp and
    /// de-duplicated by timestamp. Existing snapshots are never replaced.
    pub fn push_snapshot(&mut self, snapshot: EntrySnapshot) {
        if self.history.iter().any(|s| s.timestamp == snapshot.timestamp) {
            return;
        }
        let pos = self
            .history
            .partition_point(|s| s.timestamp < snapshot.timestamp);
        self.history.insert(pos, snapshot);
    }

    /// Union another history sequence into this one (sync merge path)
    pub fn union_history(&mut self, other: &[EntrySnapshot]) {
        for snapshot in other {
            self.push_snapshot(snapshot.clone());
        }
    }

    /// Check if this entry has expired
    pub fn is_expired(&self) -> bool {
        if !self.expires_enabled {
            return false;
        }
        self.expires.map(|exp| exp < Utc::now()).unwrap_or(false)
    }

    /// Update the accessed timestamp
    pub fn touch(&mut self) {
        self.accessed = times::now();
    }

    fn push_current_to_history(&mut self) {
        let snapshot = EntrySnapshot {
            timestamp: self.modified,
            fields: self.fields.clone(),
        };
        self.push_snapshot(snapshot);
    }

    /// Bump the modification time, strictly monotonic per entry so each
    /// edit gets a distinct history timestamp.
    fn touch_modified(&mut self) {
        let bumped = self.modified + Duration::microseconds(1);
        self.modified = times::now().max(bumped);
    }

    /// Codec path: install fields without recording history
    pub(crate) fn set_fields_raw(&mut self, fields: Vec<Field>) {
        self.fields = fields;
    }

    /// Codec path: install history without ordering checks on each push
    pub(crate) fn set_history_raw(&mut self, mut history: Vec<EntrySnapshot>) {
        history.sort_by_key(|s| s.timestamp);
        history.dedup_by_key(|s| s.timestamp);
        self.history = history;
    }
}

/// Builder for creating entries; sets fields directly without recording
/// construction as edit history.
pub struct EntryBuilder {
    entry: Entry,
}

impl EntryBuilder {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            entry: Entry::new(title),
        }
    }

    pub fn username(self, username: impl Into<String>) -> Self {
        self.field(FIELD_USERNAME, FieldValue::Text(username.into()))
    }

    pub fn password(self, password: &str) -> Self {
        self.field(FIELD_PASSWORD, FieldValue::protected(password))
    }

    pub fn url(self, url: impl Into<String>) -> Self {
        self.field(FIELD_URL, FieldValue::Text(url.into()))
    }

    pub fn notes(self, notes: impl Into<String>) -> Self {
        self.field(FIELD_NOTES, FieldValue::Text(notes.into()))
    }

    pub fn field(mut self, name: impl Into<String>, value: FieldValue) -> Self {
        let name = name.into();
        match self.entry.fields.iter_mut().find(|f| f.name == name) {
            Some(field) => field.value = value,
            None => self.entry.fields.push(Field::new(name, value)),
        }
        self
    }

    pub fn auto_fill(mut self, name: &str) -> Self {
        self.entry.set_auto_fill(name, true);
        self
    }

    pub fn parent_group(mut self, group_uuid: Uuid) -> Self {
        self.entry.parent_group = Some(group_uuid);
        self
    }

    pub fn expires(mut self, expires: DateTime<Utc>) -> Self {
        self.entry.expires = Some(expires);
        self.entry.expires_enabled = true;
        self
    }

    pub fn build(self) -> Entry {
        self.entry
    }
}
