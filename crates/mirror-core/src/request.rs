//! Review request notes.
//!
//! A review request is the annotation that marks a revision as wanting
//! review: which ref is under review, which ref it should merge into, and
//! who asked. Requests can be amended by appending a newer note; the
//! latest request wins.

use serde::{Deserialize, Serialize};

use crate::scm::Note;

/// Git notes ref that carries review requests.
pub const REQUEST_REF: &str = "refs/notes/devtools/reviews";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewRequest {
    /// Decimal epoch seconds, same representation as comment timestamps.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub timestamp: String,
    /// Ref being reviewed (the head that moves as the author revises).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub review_ref: String,
    /// Ref the change is intended to merge into.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub target_ref: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub requester: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reviewers: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

impl ReviewRequest {
    fn parse(note: &Note) -> Option<Self> {
        serde_json::from_slice(note.as_bytes()).ok()
    }

    fn timestamp_seconds(&self) -> i64 {
        self.timestamp.parse().unwrap_or(0)
    }
}

/// The most recent valid review request among the given notes, if any.
///
/// Notes that are not valid requests are ignored; the ref is heterogeneous.
#[must_use]
pub fn latest_request(notes: &[Note]) -> Option<ReviewRequest> {
    notes
        .iter()
        .filter_map(ReviewRequest::parse)
        .max_by_key(ReviewRequest::timestamp_seconds)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request_note(timestamp: &str, description: &str) -> Note {
        let request = ReviewRequest {
            timestamp: timestamp.to_string(),
            review_ref: "refs/heads/feature".to_string(),
            target_ref: "refs/heads/main".to_string(),
            requester: "dev@example.com".to_string(),
            description: description.to_string(),
            ..ReviewRequest::default()
        };
        Note::from(serde_json::to_vec(&request).expect("serialize"))
    }

    #[test]
    fn test_latest_request_wins() {
        let notes = vec![
            request_note("100", "first"),
            request_note("300", "amended"),
            request_note("200", "middle"),
        ];
        let latest = latest_request(&notes).expect("latest");
        assert_eq!(latest.description, "amended");
    }

    #[test]
    fn test_invalid_notes_are_ignored() {
        let notes = vec![Note::from("not json"), request_note("1", "only valid")];
        let latest = latest_request(&notes).expect("latest");
        assert_eq!(latest.description, "only valid");
    }

    #[test]
    fn test_no_valid_requests() {
        assert!(latest_request(&[Note::from("junk")]).is_none());
    }

    #[test]
    fn test_wire_field_names_are_camel_case() {
        let note = request_note("1", "d");
        let text = note.as_text();
        assert!(text.contains("reviewRef"), "unexpected json: {text}");
        assert!(text.contains("targetRef"), "unexpected json: {text}");
    }
}
