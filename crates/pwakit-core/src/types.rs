//! Wire types shared by the cache controller and its pages

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Version descriptor published next to the app (`version.json`).
///
/// Only `version` is authoritative. Versions are compared by string equality,
/// so a rollback to an older string still counts as a change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionDescriptor {
    pub version: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Fields we do not interpret but keep when re-serializing.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl VersionDescriptor {
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            description: None,
            extra: Map::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Parse a descriptor from raw JSON bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Serialize back to JSON bytes.
    pub fn to_vec(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Strict string comparison of the `version` fields.
    pub fn same_version(&self, other: &VersionDescriptor) -> bool {
        self.version == other.version
    }
}

/// Messages a page sends to a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PageMessage {
    /// Promote a waiting worker to active immediately.
    SkipWaiting,
    /// Run the version check now.
    CheckForUpdates,
}

impl PageMessage {
    /// Decode a message from its JSON form, returning `None` for unknown types.
    pub fn from_value(value: &Value) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }
}

/// Messages a worker sends to its pages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerMessage {
    UpdateAvailable {
        version: String,
        #[serde(rename = "oldVersion")]
        old_version: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_descriptor_keeps_unknown_fields() {
        let raw = br#"{"version":"1.0.9","description":"bugfixes","build":42}"#;
        let descriptor = VersionDescriptor::from_slice(raw).unwrap();
        assert_eq!(descriptor.version, "1.0.9");
        assert_eq!(descriptor.description.as_deref(), Some("bugfixes"));

        let value: Value = serde_json::from_slice(&descriptor.to_vec().unwrap()).unwrap();
        assert_eq!(value["build"], json!(42));
    }

    #[test]
    fn test_descriptor_without_description() {
        let descriptor = VersionDescriptor::from_slice(br#"{"version":"2"}"#).unwrap();
        assert!(descriptor.description.is_none());
        assert_eq!(serde_json::to_value(&descriptor).unwrap(), json!({"version": "2"}));
    }

    #[test]
    fn test_version_comparison_is_string_equality() {
        let a = VersionDescriptor::new("1.0.10");
        let b = VersionDescriptor::new("1.0.9");
        let c = VersionDescriptor::new("1.0.10").with_description("other text");
        assert!(!a.same_version(&b));
        assert!(a.same_version(&c));
        // no semver normalisation
        assert!(!VersionDescriptor::new("1.0").same_version(&VersionDescriptor::new("1.0.0")));
    }

    #[test]
    fn test_page_message_wire_format() {
        assert_eq!(
            serde_json::to_value(PageMessage::SkipWaiting).unwrap(),
            json!({"type": "SKIP_WAITING"})
        );
        assert_eq!(
            PageMessage::from_value(&json!({"type": "CHECK_FOR_UPDATES"})),
            Some(PageMessage::CheckForUpdates)
        );
        assert_eq!(PageMessage::from_value(&json!({"type": "PING"})), None);
        assert_eq!(PageMessage::from_value(&json!("SKIP_WAITING")), None);
    }

    #[test]
    fn test_update_available_wire_format() {
        let message = WorkerMessage::UpdateAvailable {
            version: "1.0.9".into(),
            old_version: "1.0.8".into(),
            description: Some("bugfixes".into()),
        };
        assert_eq!(
            serde_json::to_value(&message).unwrap(),
            json!({
                "type": "UPDATE_AVAILABLE",
                "version": "1.0.9",
                "oldVersion": "1.0.8",
                "description": "bugfixes"
            })
        );

        let bare = WorkerMessage::UpdateAvailable {
            version: "3".into(),
            old_version: "2".into(),
            description: None,
        };
        assert_eq!(
            serde_json::to_value(&bare).unwrap(),
            json!({"type": "UPDATE_AVAILABLE", "version": "3", "oldVersion": "2"})
        );
    }
}
