//! Fields: named values attached to entries

use serde::{Deserialize, Serialize};

use crate::binary::BinaryId;
use crate::protected::ProtectedValue;

/// Standard field names every client understands
pub const FIELD_TITLE: &str = "Title";
pub const FIELD_USERNAME: &str = "UserName";
pub const FIELD_PASSWORD: &str = "Password";
pub const FIELD_URL: &str = "URL";
pub const FIELD_NOTES: &str = "Notes";

/// The closed set of value kinds a field can hold
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    /// Plain text
    Text(String),
    /// Sensitive text, enciphered in memory between uses
    Protected(ProtectedValue),
    /// Reference into the database's content-addressed binary pool
    BinaryRef(BinaryId),
    /// Flag value
    Bool(bool),
}

impl FieldValue {
    /// Protect a sensitive string value
    pub fn protected(plaintext: &str) -> Self {
        Self::Protected(ProtectedValue::from_str(plaintext))
    }

    /// Plain text view, if this is an unprotected text value
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_protected(&self) -> bool {
        matches!(self, Self::Protected(_))
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<bool> for FieldValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

/// A named field on an entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub value: FieldValue,
    /// Marks the field as a candidate for auto-fill matching
    #[serde(default)]
    pub auto_fill: bool,
}

impl Field {
    pub fn new(name: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            auto_fill: false,
        }
    }

    pub fn with_auto_fill(mut self) -> Self {
        self.auto_fill = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_conversion() {
        let field = Field::new(FIELD_URL, "https://example.com");
        assert_eq!(field.value.as_text(), Some("https://example.com"));
        assert!(!field.value.is_protected());
    }

    #[test]
    fn protected_values_compare_by_plaintext() {
        let a = FieldValue::protected("s3cret");
        let b = FieldValue::protected("s3cret");
        assert_eq!(a, b);
        assert!(a.is_protected());
        assert_eq!(a.as_text(), None);
    }
}
