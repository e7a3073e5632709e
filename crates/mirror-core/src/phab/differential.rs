//! The Differential review service.
//!
//! Implements the [`ReviewService`] seam on top of the Conduit RPC
//! transport, the diff store, and the direct database reads. One backend
//! handle is shared between the service and the review objects it hands
//! out, so reviews can load their own comment history lazily.

use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::ci::{latest_report, CI_REF};
use crate::comment::{Comment, CommentSet};
use crate::phab::conduit::ConduitClient;
use crate::phab::db::ReviewDatabase;
use crate::phab::diff::{abbreviate_ref_name, DiffStore};
use crate::phab::users::ConduitUsers;
use crate::remote::identity::IdentityDirectory;
use crate::remote::transactions::reconstruct;
use crate::remote::{RemoteReview, ReviewService};
use crate::request::ReviewRequest;
use crate::scm::{Repo, Revision};

/// Marker the service uses to tag commit hashes, as opposed to tree or
/// blob hashes, in a review's hash list.
const COMMIT_HASH_TYPE: &str = "gtcm";

/// The service limits review titles to this many characters.
const TITLE_LIMIT: usize = 256;

const STATUS_CLOSED: &str = "3";
const STATUS_ABANDONED: &str = "4";

/// Default parent directory for the service's working copies. When a repo
/// lives there, the remainder of its path is the repo's callsign.
const REPO_DIR_PREFIX: &str = "/var/repo/";

/// A review as returned by `differential.query`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReviewRecord {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub phid: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub branch: String,
    #[serde(default)]
    pub status: String,
    #[serde(default, rename = "statusName")]
    pub status_name: String,
    #[serde(default, rename = "authorPHID")]
    pub author_phid: String,
    #[serde(default)]
    pub reviewers: Vec<String>,
    /// Pairs of (hash type, hash); only `gtcm` entries are commits.
    #[serde(default)]
    pub hashes: Vec<Vec<String>>,
    /// Ids of the diffs attached to this review, oldest first.
    #[serde(default)]
    pub diffs: Vec<String>,
}

impl ReviewRecord {
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.status == STATUS_CLOSED || self.status == STATUS_ABANDONED
    }

    fn commit_hashes(&self) -> impl Iterator<Item = &str> {
        self.hashes.iter().filter_map(|pair| {
            (pair.len() == 2 && pair[0] == COMMIT_HASH_TYPE).then(|| pair[1].as_str())
        })
    }

    /// The oldest commit in this review that the local repo knows about.
    /// Among equally old commits the last one listed wins.
    #[must_use]
    pub fn first_commit(&self, repo: &dyn Repo) -> Option<Revision> {
        let mut commits_by_time: BTreeMap<i64, &str> = BTreeMap::new();
        for commit in self.commit_hashes() {
            let Ok(details) = repo.commit_details(&Revision::from(commit)) else {
                continue;
            };
            if let Ok(time) = details.time.parse::<i64>() {
                commits_by_time.insert(time, commit);
            }
        }
        commits_by_time
            .into_iter()
            .next()
            .map(|(_, commit)| Revision::from(commit))
    }
}

/// One open review plus the backend needed to load its comments.
pub struct DifferentialReview {
    record: ReviewRecord,
    backend: Rc<Backend>,
}

impl RemoteReview for DifferentialReview {
    fn first_relevant_commit(&self, repo: &dyn Repo) -> Option<Revision> {
        self.record.first_commit(repo)
    }

    fn load_comments(&self) -> Result<Vec<Comment>> {
        let log = self.backend.database.transactions(&self.record.phid)?;
        reconstruct(&log, &self.backend.database, &self.backend.identities)
    }
}

struct Backend {
    conduit: Rc<ConduitClient>,
    diffs: Rc<DiffStore>,
    database: ReviewDatabase,
    identities: IdentityDirectory,
}

/// The production review service.
pub struct Phabricator {
    backend: Rc<Backend>,
}

impl Default for Phabricator {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Serialize, Default)]
struct ReviewQuery {
    #[serde(rename = "commitHashes", skip_serializing_if = "Vec::is_empty")]
    commit_hashes: Vec<Vec<String>>,
    #[serde(skip_serializing_if = "String::is_empty")]
    status: String,
}

#[derive(Debug, Serialize, Default)]
#[serde(rename_all = "camelCase")]
struct RevisionFields {
    #[serde(skip_serializing_if = "String::is_empty")]
    title: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    summary: String,
    #[serde(rename = "reviewerPHIDs", skip_serializing_if = "Vec::is_empty")]
    reviewer_phids: Vec<String>,
    #[serde(rename = "ccPHIDs", skip_serializing_if = "Vec::is_empty")]
    cc_phids: Vec<String>,
}

#[derive(Debug, Serialize)]
struct CreateRevisionRequest {
    diffid: u64,
    fields: RevisionFields,
}

#[derive(Debug, Deserialize)]
struct DifferentialRevision {
    #[serde(rename = "revisionid")]
    revision_id: u64,
    #[serde(default)]
    uri: String,
}

#[derive(Debug, Serialize)]
struct UpdateRevisionRequest {
    id: String,
    diffid: String,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    fields: HashMap<String, Value>,
}

#[derive(Debug, Serialize)]
struct CloseRequest {
    #[serde(rename = "revisionID")]
    revision_id: u64,
}

#[derive(Debug, Serialize)]
struct CreateInlineRequest {
    #[serde(rename = "revisionID")]
    revision_id: String,
    #[serde(rename = "diffID")]
    diff_id: String,
    #[serde(rename = "filePath")]
    file_path: String,
    #[serde(rename = "lineNumber")]
    line_number: u32,
    content: String,
    /// 0 anchors to the left-hand side, 1 to the right. Mirrored comments
    /// always go on the right-hand side.
    #[serde(rename = "isNewFile")]
    is_new_file: u32,
}

#[derive(Debug, Serialize)]
struct CreateCommentRequest {
    revision_id: String,
    action: String,
    attach_inlines: bool,
}

#[derive(Debug, Serialize)]
struct UpdateUnitResultsRequest {
    diffid: String,
    result: String,
    link: String,
}

#[derive(Debug, Serialize)]
struct LookSoonRequest {
    callsigns: Vec<String>,
}

/// Split a request description into a title and an optional summary,
/// honoring the service's title length limit.
fn title_and_summary(description: &str) -> (String, String) {
    let first_line = description.split('\n').next().unwrap_or_default();
    let title: String = if first_line.chars().count() > TITLE_LIMIT {
        let truncated: String = first_line.chars().take(TITLE_LIMIT - 4).collect();
        format!("{truncated}...")
    } else {
        first_line.to_string()
    };
    let summary = if title == description {
        String::new()
    } else {
        description.to_string()
    };
    (title, summary)
}

impl Phabricator {
    #[must_use]
    pub fn new() -> Self {
        let conduit = Rc::new(ConduitClient::new());
        let diffs = Rc::new(DiffStore::new(Rc::clone(&conduit)));
        let backend = Rc::new(Backend {
            database: ReviewDatabase::new(Rc::clone(&diffs)),
            identities: IdentityDirectory::new(Box::new(ConduitUsers::new(Rc::clone(&conduit)))),
            conduit,
            diffs,
        });
        Self { backend }
    }

    fn query_reviews(&self, query: &ReviewQuery) -> Result<Vec<ReviewRecord>> {
        let records: Option<Vec<ReviewRecord>> =
            self.backend.conduit.call("differential.query", query)?;
        Ok(records.unwrap_or_default())
    }

    /// Reviews containing the given commit, filtered to the request's
    /// review ref. The service's own branch filter is unreliable, so all
    /// matches are fetched and filtered here.
    fn reviews_for(&self, review_ref: &str, revision: &Revision) -> Result<Vec<ReviewRecord>> {
        let records = self.query_reviews(&ReviewQuery {
            commit_hashes: vec![vec![
                COMMIT_HASH_TYPE.to_string(),
                revision.to_string(),
            ]],
            ..ReviewQuery::default()
        })?;
        Ok(records
            .into_iter()
            .filter(|record| {
                record.branch == review_ref || record.branch == abbreviate_ref_name(review_ref)
            })
            .collect())
    }

    /// Fire a best-effort publish call, logging instead of failing.
    fn publish<Req: Serialize>(&self, method: &str, request: &Req) {
        if let Err(err) = self.backend.conduit.call::<Req, Value>(method, request) {
            warn!(method, error = %err, "publish call failed, skipping");
        }
    }

    fn close_review(&self, record: &ReviewRecord) -> Result<()> {
        let revision_id = record
            .id
            .parse()
            .with_context(|| format!("Bad review id: {}", record.id))?;
        // Closing can legitimately fail, for instance when the change was
        // merged without being accepted or the review belongs to someone
        // else. Log and move on.
        self.publish("differential.close", &CloseRequest { revision_id });
        Ok(())
    }

    fn revision_fields(&self, request: &ReviewRequest) -> RevisionFields {
        let (title, summary) = title_and_summary(&request.description);
        let mut fields = RevisionFields {
            title,
            summary,
            ..RevisionFields::default()
        };
        for reviewer in &request.reviewers {
            match self.backend.identities.lookup_name(reviewer) {
                Ok(Some(identity)) => fields.reviewer_phids.push(identity.id),
                Ok(None) => {}
                Err(err) => warn!(reviewer, error = %err, "reviewer lookup failed"),
            }
        }
        if !request.requester.is_empty() {
            match self.backend.identities.lookup_name(&request.requester) {
                Ok(Some(identity)) => fields.cc_phids.push(identity.id),
                Ok(None) => {}
                Err(err) => warn!(requester = %request.requester, error = %err, "requester lookup failed"),
            }
        }
        fields
    }

    fn create_revision(
        &self,
        diff_id: u64,
        request: &ReviewRequest,
    ) -> Result<DifferentialRevision> {
        let create_request = CreateRevisionRequest {
            diffid: diff_id,
            fields: self.revision_fields(request),
        };
        let revision: Option<DifferentialRevision> = self
            .backend
            .conduit
            .call("differential.createrevision", &create_request)?;
        revision.context("Revision creation returned no response")
    }

    /// Mirror the not-yet-published local comments into the review, and
    /// attach the latest CI report to the review's newest diff.
    fn mirror_comments(
        &self,
        repo: &dyn Repo,
        record: &ReviewRecord,
        known_comments: &CommentSet,
    ) -> Result<()> {
        let review = DifferentialReview {
            record: record.clone(),
            backend: Rc::clone(&self.backend),
        };
        let existing = review.load_comments()?;
        let new_comments = known_comments.filter_overlapping(&existing);

        let mut commit_to_diff: HashMap<String, String> = HashMap::new();
        let mut last_commit = String::new();
        for diff_id in &record.diffs {
            let commit = self.backend.diffs.last_commit_for(diff_id);
            commit_to_diff.insert(commit.clone(), diff_id.clone());
            last_commit = commit;
        }

        if let Some(diff_id) = commit_to_diff.get(&last_commit).filter(|_| !last_commit.is_empty())
        {
            let notes = repo.notes(CI_REF, &Revision::from(last_commit.as_str()));
            if let Some(report) = latest_report(&notes) {
                debug!(diff = %diff_id, status = %report.status, "attaching CI report");
                if !report.url.is_empty() {
                    self.publish(
                        "differential.updateunitresults",
                        &UpdateUnitResultsRequest {
                            diffid: diff_id.clone(),
                            result: report.status,
                            link: report.url,
                        },
                    );
                }
            }
        }

        let mut inlines = Vec::new();
        for comment in &new_comments {
            // Whole-revision comments have no anchor on this service and
            // are not mirrored.
            let Some(location) = &comment.location else {
                continue;
            };
            if location.path.is_empty() {
                continue;
            }
            let Some(diff_id) = commit_to_diff.get(&location.commit) else {
                continue;
            };
            inlines.push(CreateInlineRequest {
                revision_id: record.id.clone(),
                diff_id: diff_id.clone(),
                file_path: location.path.clone(),
                line_number: location.range.map_or(1, |range| range.start_line),
                content: comment.quote_description(),
                is_new_file: 1,
            });
        }
        let any_inlines = !inlines.is_empty();
        for inline in &inlines {
            self.publish("differential.createinline", inline);
        }
        if any_inlines {
            // Inline comments only become visible once a top-level comment
            // publishes them.
            self.publish(
                "differential.createcomment",
                &CreateCommentRequest {
                    revision_id: record.id.clone(),
                    action: "comment".to_string(),
                    attach_inlines: true,
                },
            );
        }
        Ok(())
    }

    /// Bring one review in line with the current head of the review ref:
    /// attach a new diff if the head moved, then mirror comments.
    fn update_review_diffs(
        &self,
        repo: &dyn Repo,
        record: &ReviewRecord,
        head_commit: &str,
        request: &ReviewRequest,
        known_comments: &CommentSet,
    ) -> Result<()> {
        if record.is_closed() {
            return Ok(());
        }

        let Ok(merge_base) = repo.merge_base(
            &Revision::from(request.target_ref.as_str()),
            &Revision::from(head_commit),
        ) else {
            // The target ref was deleted while we were working.
            return Ok(());
        };

        if record.commit_hashes().any(|commit| commit == head_commit) {
            return self.mirror_comments(repo, record, known_comments);
        }

        let diff = self.backend.diffs.create(
            repo,
            &merge_base,
            &Revision::from(head_commit),
            request,
            &record.diffs,
        )?;
        let Some(diff) = diff else {
            // The service silently refused to create the diff.
            return Ok(());
        };
        let update_request = UpdateRevisionRequest {
            id: record.id.clone(),
            diffid: diff.id.to_string(),
            fields: HashMap::new(),
        };
        let _: Option<Value> = self
            .backend
            .conduit
            .call("differential.updaterevision", &update_request)?;
        Ok(())
    }
}

impl ReviewService for Phabricator {
    type Review = DifferentialReview;

    fn ensure_request_exists(
        &self,
        repo: &dyn Repo,
        revision: &Revision,
        request: &ReviewRequest,
        known_comments: &CommentSet,
    ) -> Result<()> {
        let target = Revision::from(request.target_ref.as_str());
        let Ok(merge_base) = repo.merge_base(&target, revision) else {
            // The revision may have been merged or garbage collected;
            // either way the request no longer points at reviewable work.
            info!(
                revision = %revision,
                target = %request.target_ref,
                "ignoring review request without a merge base"
            );
            return Ok(());
        };

        let existing = self.reviews_for(&request.review_ref, revision)?;
        if merge_base == *revision {
            // Already merged in; close whatever is still open.
            for record in existing.iter().filter(|record| !record.is_closed()) {
                self.close_review(record)?;
            }
            return Ok(());
        }

        let Ok(head) = repo.commit_details(&Revision::from(request.review_ref.as_str())) else {
            info!(
                review_ref = %request.review_ref,
                "ignoring review request because the review ref does not exist"
            );
            return Ok(());
        };

        if !existing.is_empty() {
            for record in &existing {
                self.update_review_diffs(repo, record, &head.commit, request, known_comments)?;
            }
            return Ok(());
        }

        let diff = self
            .backend
            .diffs
            .create(repo, &merge_base, revision, request, &[])?;
        let Some(diff) = diff else {
            // Silent refusal; the revision is already merged in.
            return Ok(());
        };
        let created = self.create_revision(diff.id, request)?;
        info!(
            diff = diff.id,
            review = created.revision_id,
            uri = %created.uri,
            revision = %revision,
            "created review"
        );

        // The review ref may already contain further commits; make sure at
        // least the first and last of them are attached.
        for record in self.reviews_for(&request.review_ref, revision)? {
            self.update_review_diffs(repo, &record, &head.commit, request, known_comments)?;
        }
        Ok(())
    }

    fn list_open_reviews(&self, _repo: &dyn Repo) -> Result<Vec<DifferentialReview>> {
        let records = self.query_reviews(&ReviewQuery {
            status: "status-open".to_string(),
            ..ReviewQuery::default()
        })?;
        Ok(records
            .into_iter()
            .map(|record| DifferentialReview {
                record,
                backend: Rc::clone(&self.backend),
            })
            .collect())
    }

    fn refresh(&self, repo: &dyn Repo) -> Result<()> {
        // The callsign is only discoverable when the mirror runs over the
        // service's own repo directories.
        let path = repo.path().to_string_lossy();
        let Some(callsign) = path.strip_prefix(REPO_DIR_PREFIX) else {
            return Ok(());
        };
        let _: Option<Value> = self.backend.conduit.call(
            "diffusion.looksoon",
            &LookSoonRequest {
                callsigns: vec![callsign.to_string()],
            },
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scm::{CommitDetails, Note};
    use std::path::{Path, PathBuf};

    struct StubRepo {
        path: PathBuf,
        commit_times: HashMap<String, String>,
    }

    impl Repo for StubRepo {
        fn path(&self) -> &Path {
            &self.path
        }
        fn state_fingerprint(&self) -> String {
            String::new()
        }
        fn notes(&self, _notes_ref: &str, _revision: &Revision) -> Vec<Note> {
            Vec::new()
        }
        fn append_note(
            &self,
            _notes_ref: &str,
            _revision: &Revision,
            _note: &Note,
            _author: &str,
        ) -> Result<()> {
            Ok(())
        }
        fn list_annotated_revisions(&self, _notes_ref: &str) -> Vec<Revision> {
            Vec::new()
        }
        fn merge_base(&self, from: &Revision, _to: &Revision) -> Result<Revision> {
            Ok(from.clone())
        }
        fn raw_diff(&self, _from: &Revision, _to: &Revision) -> Result<String> {
            Ok(String::new())
        }
        fn commit_details(&self, revision: &Revision) -> Result<CommitDetails> {
            let time = self
                .commit_times
                .get(revision.as_str())
                .context("unknown commit")?;
            Ok(CommitDetails {
                commit: revision.to_string(),
                time: time.clone(),
                ..CommitDetails::default()
            })
        }
        fn pull(&self) -> Result<()> {
            Ok(())
        }
        fn push(&self) -> Result<()> {
            Ok(())
        }
    }

    fn record_with_hashes(hashes: Vec<Vec<String>>) -> ReviewRecord {
        ReviewRecord {
            id: "17".to_string(),
            phid: "PHID-DREV-17".to_string(),
            hashes,
            ..ReviewRecord::default()
        }
    }

    #[test]
    fn test_review_record_parses_query_output() {
        let record: ReviewRecord = serde_json::from_str(
            r#"{
                "id": "42",
                "phid": "PHID-DREV-42",
                "title": "Fix the widget",
                "branch": "feature",
                "status": "0",
                "statusName": "Needs Review",
                "hashes": [["gtcm", "abc123"], ["gttr", "def456"]],
                "diffs": ["9", "7"]
            }"#,
        )
        .expect("parse");
        assert_eq!(record.id, "42");
        assert_eq!(record.commit_hashes().collect::<Vec<_>>(), vec!["abc123"]);
        assert!(!record.is_closed());
    }

    #[test]
    fn test_closed_statuses() {
        for (status, closed) in [("0", false), ("3", true), ("4", true)] {
            let record = ReviewRecord {
                status: status.to_string(),
                ..ReviewRecord::default()
            };
            assert_eq!(record.is_closed(), closed, "status {status}");
        }
    }

    #[test]
    fn test_first_commit_is_oldest_known() {
        let repo = StubRepo {
            path: PathBuf::from("/repos/widget"),
            commit_times: HashMap::from([
                ("aaa".to_string(), "300".to_string()),
                ("bbb".to_string(), "100".to_string()),
            ]),
        };
        let record = record_with_hashes(vec![
            vec!["gtcm".to_string(), "aaa".to_string()],
            vec!["gtcm".to_string(), "bbb".to_string()],
            vec!["gtcm".to_string(), "unknown".to_string()],
            vec!["gttr".to_string(), "ccc".to_string()],
        ]);
        assert_eq!(record.first_commit(&repo), Some(Revision::from("bbb")));
    }

    #[test]
    fn test_first_commit_without_known_commits() {
        let repo = StubRepo {
            path: PathBuf::from("/repos/widget"),
            commit_times: HashMap::new(),
        };
        let record = record_with_hashes(vec![vec!["gtcm".to_string(), "aaa".to_string()]]);
        assert_eq!(record.first_commit(&repo), None);
    }

    #[test]
    fn test_title_and_summary_single_line() {
        let (title, summary) = title_and_summary("Fix the widget");
        assert_eq!(title, "Fix the widget");
        assert_eq!(summary, "");
    }

    #[test]
    fn test_title_and_summary_multiline() {
        let (title, summary) = title_and_summary("Fix the widget\n\nIt was broken.");
        assert_eq!(title, "Fix the widget");
        assert_eq!(summary, "Fix the widget\n\nIt was broken.");
    }

    #[test]
    fn test_title_is_truncated_at_the_limit() {
        let long = "x".repeat(300);
        let (title, summary) = title_and_summary(&long);
        assert_eq!(title.chars().count(), TITLE_LIMIT - 1);
        assert!(title.ends_with("..."));
        assert_eq!(summary, long);
    }

    #[test]
    fn test_inline_request_wire_format() {
        let request = CreateInlineRequest {
            revision_id: "17".to_string(),
            diff_id: "9".to_string(),
            file_path: "src/widget.rs".to_string(),
            line_number: 12,
            content: "reviewer@example.com:\n\nlooks wrong".to_string(),
            is_new_file: 1,
        };
        let json = serde_json::to_value(&request).expect("serialize");
        assert_eq!(json["revisionID"], "17");
        assert_eq!(json["diffID"], "9");
        assert_eq!(json["filePath"], "src/widget.rs");
        assert_eq!(json["lineNumber"], 12);
        assert_eq!(json["isNewFile"], 1);
    }
}
