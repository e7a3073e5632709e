//! Diff resources on the review service.
//!
//! A review revision is backed by one diff per round of changes. The
//! service parses raw diffs server-side, so creating a diff is a two-step
//! dance: upload the raw text, then read back the parsed change objects
//! and attach them to a structured diff with commit metadata.

use std::collections::HashMap;
use std::rc::Rc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::phab::conduit::ConduitClient;
use crate::request::ReviewRequest;
use crate::scm::{Repo, Revision};

#[derive(Debug, Serialize)]
struct CreateRawDiffRequest {
    diff: String,
}

#[derive(Debug, Deserialize)]
struct RawDiff {
    id: u64,
}

#[derive(Debug, Serialize)]
struct QueryDiffsRequest {
    ids: Vec<u64>,
}

/// One diff as returned by `differential.querydiffs`.
#[derive(Debug, Clone, Deserialize)]
pub struct QueryDiffItem {
    pub id: String,
    #[serde(default)]
    pub changes: Vec<Value>,
    #[serde(default)]
    pub properties: Value,
}

impl QueryDiffItem {
    /// The last commit included in this diff.
    ///
    /// The service does not store the right-hand-side commit hash
    /// directly, only a map of "local commits"; the newest of those is the
    /// one the diff was generated from.
    #[must_use]
    pub fn last_commit(&self) -> String {
        self.properties
            .get("local:commits")
            .and_then(Value::as_object)
            .map_or_else(String::new, |commits| {
                let mut newest: Option<(i64, &str)> = None;
                for (commit, data) in commits {
                    let Some(timestamp) = data
                        .get("time")
                        .and_then(Value::as_str)
                        .and_then(|time| time.parse::<i64>().ok())
                    else {
                        continue;
                    };
                    if newest.is_none_or(|(best, _)| timestamp >= best) {
                        newest = Some((timestamp, commit));
                    }
                }
                newest.map_or_else(String::new, |(_, commit)| commit.to_string())
            })
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateDiffRequest {
    #[serde(skip_serializing_if = "String::is_empty")]
    branch: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    source_control_base_revision: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    source_control_system: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    source_path: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    lint_status: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    unit_status: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    changes: Vec<Value>,
}

/// A newly created diff resource.
#[derive(Debug, Clone, Deserialize)]
pub struct DifferentialDiff {
    #[serde(rename = "diffid")]
    pub id: u64,
    #[serde(default)]
    pub uri: String,
}

#[derive(Debug, Serialize)]
struct SetDiffPropertyRequest {
    diff_id: u64,
    name: String,
    data: String,
}

/// Diff-level operations, shared by review creation and comment anchoring.
pub struct DiffStore {
    conduit: Rc<ConduitClient>,
}

impl DiffStore {
    #[must_use]
    pub fn new(conduit: Rc<ConduitClient>) -> Self {
        Self { conduit }
    }

    /// Read one diff back from the service.
    pub fn read(&self, diff_id: u64) -> Result<Option<QueryDiffItem>> {
        let response: Option<HashMap<String, QueryDiffItem>> = self
            .conduit
            .call("differential.querydiffs", &QueryDiffsRequest { ids: vec![diff_id] })?;
        Ok(response.and_then(|mut diffs| diffs.remove(&diff_id.to_string())))
    }

    /// The last commit behind a diff identified by its decimal string id,
    /// or empty when anything along the chain is missing.
    #[must_use]
    pub fn last_commit_for(&self, diff_id: &str) -> String {
        let Ok(id) = diff_id.parse::<u64>() else {
            return String::new();
        };
        match self.read(id) {
            Ok(Some(diff)) => diff.last_commit(),
            _ => String::new(),
        }
    }

    /// Upload a raw diff and read back the service's parsed change objects.
    fn parsed_changes(&self, repo: &dyn Repo, from: &Revision, to: &Revision) -> Result<Vec<Value>> {
        let raw = repo.raw_diff(from, to)?;
        let created: Option<RawDiff> = self
            .conduit
            .call("differential.createrawdiff", &CreateRawDiffRequest { diff: raw })?;
        let created = created.context("Raw diff upload returned no diff id")?;
        let diff = self
            .read(created.id)?
            .with_context(|| format!("Failed to read back raw diff {}..{}", from, to))?;
        Ok(diff.changes)
    }

    /// Create a structured diff for `merge_base..revision`, carrying over
    /// the local-commit history of any prior diffs on the same review.
    ///
    /// `None` means the service silently refused, which happens when the
    /// revision is already merged in.
    pub fn create(
        &self,
        repo: &dyn Repo,
        merge_base: &Revision,
        revision: &Revision,
        request: &ReviewRequest,
        prior_diffs: &[String],
    ) -> Result<Option<DifferentialDiff>> {
        let details = repo.commit_details(revision)?;
        let changes = self.parsed_changes(repo, merge_base, revision)?;
        let create_request = CreateDiffRequest {
            branch: abbreviate_ref_name(&request.review_ref).to_string(),
            source_control_base_revision: merge_base.to_string(),
            source_control_system: "git".to_string(),
            source_path: repo.path().to_string_lossy().into_owned(),
            // Status code 5 means "postponed".
            lint_status: "5".to_string(),
            unit_status: "5".to_string(),
            changes,
        };
        let created: Option<DifferentialDiff> =
            self.conduit.call("differential.creatediff", &create_request)?;
        let Some(diff) = created else {
            return Ok(None);
        };

        let mut local_commits: serde_json::Map<String, Value> = serde_json::Map::new();
        for prior in prior_diffs {
            if let Ok(id) = prior.parse::<u64>() {
                if let Some(prior_diff) = self.read(id)? {
                    if let Some(commits) = prior_diff
                        .properties
                        .get("local:commits")
                        .and_then(Value::as_object)
                    {
                        local_commits.extend(commits.clone());
                    }
                }
            }
        }
        local_commits.insert(revision.to_string(), serde_json::to_value(&details)?);

        self.set_property(diff.id, "local:commits", &Value::Object(local_commits).to_string())?;
        self.set_property(diff.id, "arc:unit", "{}")?;
        Ok(Some(diff))
    }

    fn set_property(&self, diff_id: u64, name: &str, data: &str) -> Result<()> {
        let _: Option<Value> = self.conduit.call(
            "differential.setdiffproperty",
            &SetDiffPropertyRequest {
                diff_id,
                name: name.to_string(),
                data: data.to_string(),
            },
        )?;
        Ok(())
    }
}

/// Strip the `refs/heads/` prefix so branch fields match what the service
/// displays.
#[must_use]
pub fn abbreviate_ref_name(ref_name: &str) -> &str {
    ref_name.strip_prefix("refs/heads/").unwrap_or(ref_name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_last_commit_picks_the_newest_local_commit() {
        let diff = QueryDiffItem {
            id: "12".to_string(),
            changes: Vec::new(),
            properties: json!({
                "local:commits": {
                    "aaa": {"time": "100"},
                    "bbb": {"time": "300"},
                    "ccc": {"time": "200"},
                }
            }),
        };
        assert_eq!(diff.last_commit(), "bbb");
    }

    #[test]
    fn test_last_commit_without_properties_is_empty() {
        let diff = QueryDiffItem {
            id: "12".to_string(),
            changes: Vec::new(),
            properties: Value::Null,
        };
        assert_eq!(diff.last_commit(), "");
    }

    #[test]
    fn test_abbreviate_ref_name() {
        assert_eq!(abbreviate_ref_name("refs/heads/main"), "main");
        assert_eq!(abbreviate_ref_name("refs/tags/v1"), "refs/tags/v1");
        assert_eq!(abbreviate_ref_name("main"), "main");
    }
}
