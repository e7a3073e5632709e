//! Continuous-integration report notes.
//!
//! CI systems append one report note per run; only the newest report for a
//! revision is mirrored to the review service as a unit-test result.

use serde::{Deserialize, Serialize};

use crate::scm::Note;

/// Git notes ref that carries CI reports.
pub const CI_REF: &str = "refs/notes/devtools/ci";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CiReport {
    /// Decimal epoch seconds.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub timestamp: String,
    /// Link to the build log or dashboard.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub url: String,
    /// "success" or "failure".
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub status: String,
}

impl CiReport {
    fn parse(note: &Note) -> Option<Self> {
        serde_json::from_slice(note.as_bytes()).ok()
    }

    fn timestamp_seconds(&self) -> i64 {
        self.timestamp.parse().unwrap_or(0)
    }
}

/// The newest valid CI report among the given notes, if any.
#[must_use]
pub fn latest_report(notes: &[Note]) -> Option<CiReport> {
    notes
        .iter()
        .filter_map(CiReport::parse)
        .max_by_key(CiReport::timestamp_seconds)
}
