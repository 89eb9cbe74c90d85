use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Snapshot category: `backup` is operator-requested, `version` is taken
/// automatically before a renewal or restore.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotKind {
    Backup,
    Version,
}

impl fmt::Display for SnapshotKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Backup => write!(f, "backup"),
            Self::Version => write!(f, "version"),
        }
    }
}

/// One archived file set for a certificate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotEntry {
    /// Millisecond timestamp, strictly increasing per certificate.
    pub id: u64,
    #[serde(rename = "type")]
    pub kind: SnapshotKind,
    /// What caused the snapshot (`pre-renewal`, `pre-restore`, `manual`, …).
    pub trigger: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub fingerprint_at_snapshot: String,
    /// Basenames of the archived files.
    pub files: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_kind_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&SnapshotKind::Backup).unwrap(),
            "\"backup\""
        );
        assert_eq!(
            serde_json::to_string(&SnapshotKind::Version).unwrap(),
            "\"version\""
        );
    }

    #[test]
    fn test_entry_roundtrip_uses_camel_case() {
        let entry = SnapshotEntry {
            id: 1700000000000,
            kind: SnapshotKind::Version,
            trigger: "pre-renewal".to_string(),
            description: "before renewal".to_string(),
            created_at: Utc::now(),
            fingerprint_at_snapshot: "ab".repeat(32),
            files: vec!["leaf.pem".to_string(), "leaf.key".to_string()],
        };
        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("\"fingerprintAtSnapshot\""));
        assert!(json.contains("\"type\":\"version\""));
        let back: SnapshotEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(back, entry);
    }
}
