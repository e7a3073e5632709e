//! Review comment model and the fuzzy overlap matcher.
//!
//! Comments live as JSON git notes and as reconstructed Phabricator
//! transactions. The two systems disagree on field layouts, quoting
//! conventions, and identity representations, so equality alone cannot tell
//! whether two records describe the same human action. `Comment::overlaps`
//! is the fudge-factor that bridges the gap, and [`CommentSet`] applies it
//! to decide which comments are genuinely new.

use std::collections::HashMap;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use crate::scm::Note;

/// Git notes ref that carries review discussion comments.
pub const DISCUSS_REF: &str = "refs/notes/devtools/discuss";

/// A line range within a file. Only the start line participates in overlap
/// comparisons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineRange {
    #[serde(rename = "startLine")]
    pub start_line: u32,
}

/// Where a comment is anchored, in decreasing specificity: a single line
/// (`range` present), a whole file (`path` present), or a whole revision.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub commit: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range: Option<LineRange>,
}

impl Location {
    /// Two locations overlap only within the same revision, with exact
    /// per-field equality. A whole-file location never matches a line.
    #[must_use]
    pub fn overlaps(&self, other: &Self) -> bool {
        if self.commit != other.commit || self.path != other.path {
            return false;
        }
        match (self.range, other.range) {
            (None, None) => true,
            (Some(a), Some(b)) => a.start_line == b.start_line,
            _ => false,
        }
    }
}

/// A single review comment.
///
/// Appears in any of four contexts: a comment on a whole revision, on a
/// file, on a line, or a reply to another comment (`parent` set to the
/// parent's content hash). Instances are immutable once written; the
/// annotation store only ever appends.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    /// Decimal epoch seconds. Zero-padded to at least 10 digits before
    /// hashing/serializing so lexicographic order matches numeric order.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub author: String,
    /// Content hash of the comment this one replies to, if any.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub parent: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    /// Tri-state review verdict: `None` = FYI, `Some(true)` = accept,
    /// `Some(false)` = reject.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved: Option<bool>,
}

/// Zero-pad a decimal epoch-seconds timestamp to at least 10 digits.
///
/// Timestamps that do not parse as integers are left untouched; they are
/// not in a format we understand, so normalizing them would only make
/// matters worse.
fn normalize_timestamp(timestamp: &str) -> String {
    if timestamp.len() >= 10 {
        return timestamp.to_string();
    }
    match timestamp.parse::<i64>() {
        Ok(seconds) => format!("{seconds:010}"),
        Err(_) => timestamp.to_string(),
    }
}

impl Comment {
    /// Parse a review comment from a git note.
    pub fn parse(note: &Note) -> Result<Self> {
        serde_json::from_slice(note.as_bytes()).context("Malformed review comment note")
    }

    /// Canonical serialized form: fixed field order, omitted fields elided,
    /// timestamp normalized. This is the byte stream the content hash is
    /// computed over.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        let mut canonical = self.clone();
        canonical.timestamp = normalize_timestamp(&self.timestamp);
        serde_json::to_vec(&canonical).context("Failed to serialize review comment")
    }

    /// Write the comment as a JSON-formatted git note.
    pub fn to_note(&self) -> Result<Note> {
        Ok(Note::from(self.serialize()?))
    }

    /// Content hash (SHA-1 over the canonical serialized bytes). This is
    /// the comment's identity: structurally identical comments collapse to
    /// one hash.
    pub fn hash(&self) -> Result<String> {
        let bytes = self.serialize()?;
        Ok(hex::encode(Sha1::digest(&bytes)))
    }

    /// The description used when one user posts a comment on behalf of
    /// another, prefixed with attribution.
    #[must_use]
    pub fn quote_description(&self) -> String {
        format!("{}:\n\n{}", self.author, self.description)
    }

    /// Whether this comment's description is a quote of `other`, in either
    /// the literal or the backslash-escaped-newline representation.
    fn is_quote(&self, other: &Self) -> bool {
        let quoted = other.quote_description();
        if self.description == quoted {
            return true;
        }
        if self.description == quoted.replace('\n', "\\n") {
            return true;
        }
        self.description.replace('\n', "\\n") == quoted
    }

    /// Whether two descriptions are roughly the same: identical, or one is
    /// a quote of the other posted on behalf of the original author.
    fn description_overlaps(&self, other: &Self) -> bool {
        self.description == other.description || self.is_quote(other) || other.is_quote(self)
    }

    /// Whether two comments from the two systems represent the same human
    /// action.
    ///
    /// Overlap requires all three of:
    /// - descriptions that match directly or through quoting;
    /// - compatible resolved states (both unset, or both set to the same
    ///   verdict; timestamps are deliberately not compared);
    /// - the same anchor location (both absent, or exactly equal).
    ///
    /// Symmetric by construction; callers on the harvesting path still
    /// check both orders as a guard against asymmetric quoting.
    #[must_use]
    pub fn overlaps(&self, other: &Self) -> bool {
        if !self.description_overlaps(other) {
            return false;
        }
        match (self.resolved, other.resolved) {
            (None, None) => {}
            (Some(a), Some(b)) => {
                if a != b {
                    return false;
                }
            }
            _ => return false,
        }
        match (&self.location, &other.location) {
            (None, None) => true,
            (Some(a), Some(b)) => a.overlaps(b),
            _ => false,
        }
    }
}

/// A comment with its content hash and its replies, as threaded in the
/// annotation store.
#[derive(Debug, Clone)]
pub struct CommentThread {
    pub hash: String,
    pub comment: Comment,
    pub children: Vec<CommentThread>,
}

/// Comments keyed by content hash.
///
/// The map is unordered; callers that need a particular order must impose
/// one themselves. Inserting a structurally identical comment twice is a
/// no-op, which is what makes harvesting idempotent for exact duplicates.
#[derive(Debug, Clone, Default)]
pub struct CommentSet {
    by_hash: HashMap<String, Comment>,
}

impl CommentSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a comment under its content hash, returning the hash.
    pub fn insert(&mut self, comment: Comment) -> Result<String> {
        let hash = comment.hash()?;
        self.by_hash.insert(hash.clone(), comment);
        Ok(hash)
    }

    /// Fold a threaded collection into the set, recursing into replies so
    /// that a parent and its children are each independently represented.
    pub fn add_threads(&mut self, threads: &[CommentThread]) {
        for thread in threads {
            self.by_hash
                .insert(thread.hash.clone(), thread.comment.clone());
            self.add_threads(&thread.children);
        }
    }

    /// Return exactly those comments that overlap none of `exclude`.
    ///
    /// Both comparison orders are checked for each pair. Output order is
    /// unspecified.
    #[must_use]
    pub fn filter_overlapping(&self, exclude: &[Comment]) -> Vec<Comment> {
        self.by_hash
            .values()
            .filter(|candidate| {
                !exclude
                    .iter()
                    .any(|e| e.overlaps(candidate) || candidate.overlaps(e))
            })
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn get(&self, hash: &str) -> Option<&Comment> {
        self.by_hash.get(hash)
    }

    #[must_use]
    pub fn contains(&self, hash: &str) -> bool {
        self.by_hash.contains_key(hash)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Comment)> {
        self.by_hash.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_hash.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_hash.is_empty()
    }
}

/// Parse every note that is a valid review comment, ignoring the rest.
///
/// Notes refs are heterogeneous; only some entries are review comments, so
/// parse failures here are expected and silent.
#[must_use]
pub fn parse_all_valid(notes: &[Note]) -> CommentSet {
    let mut comments = CommentSet::new();
    for note in notes {
        if let Ok(comment) = Comment::parse(note) {
            // A comment that cannot be hashed cannot be deduplicated; skip it.
            let _ = comments.insert(comment);
        }
    }
    comments
}

/// Assemble flat hash-keyed comments into reply threads.
///
/// A comment whose parent hash is absent from the set becomes a root; this
/// keeps orphaned replies visible rather than dropping them.
#[must_use]
pub fn build_threads(comments: &CommentSet) -> Vec<CommentThread> {
    let mut children_of: HashMap<&str, Vec<&str>> = HashMap::new();
    let mut roots: Vec<&str> = Vec::new();
    for (hash, comment) in comments.iter() {
        if !comment.parent.is_empty() && comments.contains(&comment.parent) {
            children_of
                .entry(comment.parent.as_str())
                .or_default()
                .push(hash);
        } else {
            roots.push(hash);
        }
    }

    fn assemble(
        hash: &str,
        comments: &CommentSet,
        children_of: &HashMap<&str, Vec<&str>>,
    ) -> Option<CommentThread> {
        let comment = comments.get(hash)?.clone();
        let children = children_of
            .get(hash)
            .map(|hashes| {
                hashes
                    .iter()
                    .filter_map(|child| assemble(child, comments, children_of))
                    .collect()
            })
            .unwrap_or_default();
        Some(CommentThread {
            hash: hash.to_string(),
            comment,
            children,
        })
    }

    roots
        .into_iter()
        .filter_map(|hash| assemble(hash, comments, &children_of))
        .collect()
}

/// Whether `candidate` overlaps any comment in the given threads, replies
/// included. Both comparison orders are checked.
#[must_use]
pub fn has_overlap(candidate: &Comment, threads: &[CommentThread]) -> bool {
    threads.iter().any(|thread| {
        candidate.overlaps(&thread.comment)
            || thread.comment.overlaps(candidate)
            || has_overlap(candidate, &thread.children)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line_location() -> Location {
        Location {
            commit: "ABCDEFG".to_string(),
            path: "hello.txt".to_string(),
            range: Some(LineRange { start_line: 42 }),
        }
    }

    fn original_comment() -> Comment {
        Comment {
            timestamp: "012345".to_string(),
            author: "foo@bar.com".to_string(),
            location: Some(line_location()),
            description: "Some comment description\n\nWith some text in it.".to_string(),
            ..Comment::default()
        }
    }

    fn quote_of(original: &Comment, author: &str) -> Comment {
        Comment {
            timestamp: "456789".to_string(),
            author: author.to_string(),
            location: original.location.clone(),
            description: original.quote_description(),
            ..Comment::default()
        }
    }

    #[test]
    fn test_quoted_comment_overlaps_both_orders() {
        let original = original_comment();
        let quoted = quote_of(&original, "bot@robots-r-us.com");
        assert!(original.overlaps(&quoted));
        assert!(quoted.overlaps(&original));
    }

    #[test]
    fn test_escaped_newline_quote_overlaps() {
        let original = original_comment();
        let mut quoted = quote_of(&original, "bot@robots-r-us.com");
        quoted.description = quoted.description.replace('\n', "\\n");
        assert!(original.overlaps(&quoted));
        assert!(quoted.overlaps(&original));
    }

    #[test]
    fn test_overlap_is_symmetric() {
        let original = original_comment();
        let quoted = quote_of(&original, "bot@robots-r-us.com");
        let reply = Comment {
            description: "Actually, I disagree".to_string(),
            ..quote_of(&original, "bot@robots-r-us.com")
        };
        for a in [&original, &quoted, &reply] {
            for b in [&original, &quoted, &reply] {
                assert_eq!(a.overlaps(b), b.overlaps(a), "{a:?} vs {b:?}");
            }
        }
    }

    #[test]
    fn test_resolved_state_overlaps() {
        let mut a = Comment {
            timestamp: "012345".to_string(),
            author: "bar@foo.com".to_string(),
            resolved: Some(false),
            ..Comment::default()
        };
        let mut b = a.clone();

        b.resolved = Some(true);
        assert!(!a.overlaps(&b), "differing verdicts must not overlap");

        b.resolved = Some(false);
        assert!(a.overlaps(&b), "matching verdicts overlap");

        // Timestamp-agnostic: same verdict at a different time still overlaps.
        b.timestamp = "56789".to_string();
        assert!(a.overlaps(&b));

        b.timestamp = "012345".to_string();
        b.resolved = None;
        assert!(!a.overlaps(&b), "set vs unset must not overlap");

        a.resolved = None;
        assert!(a.overlaps(&b), "both unset with nothing else differing");
    }

    #[test]
    fn test_location_overlap_requires_exact_match() {
        let line = line_location();
        let whole_file = Location {
            range: None,
            ..line_location()
        };
        let other_commit = Location {
            commit: "HIJKLMN".to_string(),
            ..line_location()
        };

        assert!(line.overlaps(&line.clone()));
        assert!(whole_file.overlaps(&whole_file.clone()));
        assert!(
            !line.overlaps(&whole_file),
            "whole file never matches a line"
        );
        assert!(!whole_file.overlaps(&line));
        assert!(!line.overlaps(&other_commit));
    }

    #[test]
    fn test_comment_with_location_never_overlaps_without() {
        let with = original_comment();
        let without = Comment {
            location: None,
            ..original_comment()
        };
        assert!(!with.overlaps(&without));
        assert!(!without.overlaps(&with));
    }

    #[test]
    fn test_timestamp_zero_padding_in_serialized_form() {
        let comment = Comment {
            timestamp: "123".to_string(),
            author: "a@b.com".to_string(),
            description: "hi".to_string(),
            ..Comment::default()
        };
        let json = String::from_utf8(comment.serialize().expect("serialize")).expect("utf8");
        assert!(json.contains("\"0000000123\""), "unexpected json: {json}");
    }

    #[test]
    fn test_non_numeric_timestamp_left_alone() {
        let comment = Comment {
            timestamp: "bogus".to_string(),
            description: "hi".to_string(),
            ..Comment::default()
        };
        let json = String::from_utf8(comment.serialize().expect("serialize")).expect("utf8");
        assert!(json.contains("\"bogus\""));
    }

    #[test]
    fn test_round_trip_preserves_hash() {
        let comment = Comment {
            timestamp: "42".to_string(),
            author: "foo@bar.com".to_string(),
            location: Some(line_location()),
            description: "body".to_string(),
            resolved: Some(true),
            ..Comment::default()
        };
        let note = comment.to_note().expect("to_note");
        let parsed = Comment::parse(&note).expect("parse");
        assert_eq!(
            comment.hash().expect("hash"),
            parsed.hash().expect("hash"),
            "round-trip must not change the content hash"
        );
    }

    #[test]
    fn test_parse_all_valid_skips_junk() {
        let notes = vec![
            original_comment().to_note().expect("to_note"),
            Note::from(b"this is not json".to_vec()),
            Note::from(b"[1, 2, 3]".to_vec()),
        ];
        let comments = parse_all_valid(&notes);
        assert_eq!(comments.len(), 1);
    }

    #[test]
    fn test_filter_overlapping_keeps_only_the_reply() {
        let original = original_comment();
        let quoted = quote_of(&original, "bot@robots-r-us.com");
        let reply = Comment {
            description: format!("'{}': Actually, I disagree", original.description),
            ..quote_of(&original, "bot@robots-r-us.com")
        };

        let mut candidates = CommentSet::new();
        candidates.insert(original.clone()).expect("insert");
        candidates.insert(quoted).expect("insert");
        candidates.insert(reply.clone()).expect("insert");

        let filtered = candidates.filter_overlapping(std::slice::from_ref(&original));
        assert_eq!(filtered.len(), 1, "unexpected result: {filtered:?}");
        assert_eq!(filtered[0], reply);
    }

    #[test]
    fn test_filter_overlapping_with_empty_exclusions_returns_everything() {
        let mut candidates = CommentSet::new();
        candidates.insert(original_comment()).expect("insert");
        assert_eq!(candidates.filter_overlapping(&[]).len(), 1);
    }

    #[test]
    fn test_build_threads_and_recursive_overlap() {
        let root = original_comment();
        let root_hash = root.hash().expect("hash");
        let reply = Comment {
            timestamp: "012346".to_string(),
            author: "baz@bar.com".to_string(),
            parent: root_hash.clone(),
            description: "a reply".to_string(),
            ..Comment::default()
        };

        let mut set = CommentSet::new();
        set.insert(root).expect("insert");
        set.insert(reply.clone()).expect("insert");

        let threads = build_threads(&set);
        assert_eq!(threads.len(), 1);
        assert_eq!(threads[0].hash, root_hash);
        assert_eq!(threads[0].children.len(), 1);

        // The reply is only reachable through recursion into children.
        assert!(has_overlap(&reply, &threads));
        let unrelated = Comment {
            description: "something else entirely".to_string(),
            ..Comment::default()
        };
        assert!(!has_overlap(&unrelated, &threads));
    }

    #[test]
    fn test_orphaned_reply_becomes_a_root() {
        let orphan = Comment {
            parent: "deadbeef".repeat(5),
            description: "reply to nothing".to_string(),
            ..Comment::default()
        };
        let mut set = CommentSet::new();
        set.insert(orphan).expect("insert");
        assert_eq!(build_threads(&set).len(), 1);
    }
}
