//! Source-control collaborator interface.
//!
//! The annotation store is the version-control system's notes mechanism:
//! append-only, keyed by (notes ref, revision), eventually synced through
//! the ordinary remote plumbing. The [`Repo`] trait is everything the
//! reconciliation core needs from it; [`git::GitRepo`] is the production
//! implementation.

use std::fmt;
use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};

pub mod git;

/// A git revision identifier (commit hash or ref name).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Revision(String);

impl Revision {
    #[must_use]
    pub fn new(revision: impl Into<String>) -> Self {
        Self(revision.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Revision {
    fn from(revision: &str) -> Self {
        Self(revision.to_string())
    }
}

/// An opaque byte payload annotating a revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Note(Vec<u8>);

impl Note {
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Lossy UTF-8 view, for logging and for tools that take strings.
    #[must_use]
    pub fn as_text(&self) -> String {
        String::from_utf8_lossy(&self.0).into_owned()
    }
}

impl From<Vec<u8>> for Note {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl From<&str> for Note {
    fn from(text: &str) -> Self {
        Self(text.as_bytes().to_vec())
    }
}

/// Metadata for a single commit.
///
/// `time` is the author timestamp as decimal epoch seconds, matching the
/// comment timestamp representation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommitDetails {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub commit: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub author: String,
    #[serde(default, rename = "authorEmail", skip_serializing_if = "String::is_empty")]
    pub author_email: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tree: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub time: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parents: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub summary: String,
}

/// A local source-code repository plus its annotation store.
///
/// Reads of absent data (no notes, unknown revision) return empty results;
/// writes and structural queries return errors. Pull and push failures are
/// recoverable; everything else the sync layer treats as fatal.
pub trait Repo {
    /// Path to the repository working directory.
    fn path(&self) -> &Path;

    /// A hash summarizing the full observable state of the repository's
    /// references. Used to detect "nothing changed" ticks.
    fn state_fingerprint(&self) -> String;

    /// The notes under `notes_ref` annotating `revision`, one per line.
    /// Empty when the revision has no annotations.
    fn notes(&self, notes_ref: &str, revision: &Revision) -> Vec<Note>;

    /// Append a note to a revision, attributed to `author`.
    fn append_note(
        &self,
        notes_ref: &str,
        revision: &Revision,
        note: &Note,
        author: &str,
    ) -> Result<()>;

    /// Every revision annotated under `notes_ref`. Notes pointing at
    /// objects the repo does not (yet) know about are skipped.
    fn list_annotated_revisions(&self, notes_ref: &str) -> Vec<Revision>;

    /// The latest common ancestor of the two revisions; the left-hand side
    /// for review diffs. Fails when the target ref has been deleted.
    fn merge_base(&self, from: &Revision, to: &Revision) -> Result<Revision>;

    /// Raw diff between two revisions with whole-file context.
    fn raw_diff(&self, from: &Revision, to: &Revision) -> Result<String>;

    /// Commit metadata for the given revision.
    fn commit_details(&self, revision: &Revision) -> Result<CommitDetails>;

    /// Update local state from the remote. Failures abort the current
    /// repository's tick, not the process.
    fn pull(&self) -> Result<()>;

    /// Publish local annotation updates to the remote.
    fn push(&self) -> Result<()>;
}
