//! Direct reads of the review service's backing database.
//!
//! The service exposes no API for reading review comments, so the
//! transaction log is read straight from the `phabricator_differential`
//! schema through the `mysql` command-line client. Three tables are
//! involved: `differential_transaction` holds the top-level review
//! actions, `differential_transaction_comment` holds comment bodies, and
//! `differential_changeset` maps a comment's anchor back to a file in a
//! diff.

use std::process::Command;
use std::rc::Rc;

use anyhow::{bail, Context, Result};

use crate::comment::{LineRange, Location};
use crate::exec::{run_checked, REMOTE_TIMEOUT};
use crate::phab::diff::DiffStore;
use crate::remote::transactions::{
    CommentPayload, PayloadSource, Transaction, TransactionAction, TransactionLog,
};

/// Run a SQL query, one result row per line, columns tab-separated.
fn run_sql(query: &str) -> Result<String> {
    let mut command = Command::new("mysql");
    command.args(["-Ns", "-e", query]);
    let stdout = run_checked(command, None, Some(REMOTE_TIMEOUT))?;
    Ok(stdout.trim_matches('\n').to_string())
}

/// Run a SQL query with raw output, for contents that may contain tabs.
fn run_sql_raw(query: &str) -> Result<String> {
    let mut command = Command::new("mysql");
    command.args(["-Ns", "-r", "-e", query]);
    let stdout = run_checked(command, None, Some(REMOTE_TIMEOUT))?;
    Ok(stdout.strip_suffix('\n').unwrap_or(&stdout).to_string())
}

fn nullable(column: &str) -> Option<String> {
    if column == "NULL" {
        None
    } else {
        Some(column.to_string())
    }
}

/// Parse the result rows of the transaction query into log entries.
///
/// Each row has 7 columns: id, phid, authorPHID, dateCreated,
/// transactionType, newValue, commentPHID.
fn parse_transactions(result: &str) -> Result<Vec<Transaction>> {
    if result.trim() == "" {
        return Ok(Vec::new());
    }
    let mut transactions = Vec::new();
    for line in result.split('\n') {
        let columns: Vec<&str> = line.split('\t').collect();
        if columns.len() != 7 {
            bail!("Unexpected number of transaction columns: {columns:?}");
        }
        let sequence_id = columns[0]
            .parse()
            .with_context(|| format!("Bad transaction id: {}", columns[0]))?;
        let created_at = columns[3]
            .parse()
            .with_context(|| format!("Bad transaction timestamp: {}", columns[3]))?;
        // The verdict is stored JSON-encoded, quotes included.
        let action = match (columns[4], nullable(columns[5]).as_deref()) {
            ("differential:action", Some("\"accept\"")) => TransactionAction::Accept,
            ("differential:action", Some("\"reject\"")) => TransactionAction::Reject,
            _ => TransactionAction::Comment,
        };
        transactions.push(Transaction {
            sequence_id,
            phid: columns[1].to_string(),
            author_phid: columns[2].to_string(),
            created_at,
            action,
            comment_phid: nullable(columns[6]),
        });
    }
    Ok(transactions)
}

/// One row of the transaction-comment query: phid, changesetID,
/// lineNumber, replyToCommentPHID. The body itself is fetched separately
/// so tab characters in it cannot corrupt column splitting.
#[derive(Debug, PartialEq, Eq)]
struct CommentRow {
    phid: String,
    changeset_id: Option<u64>,
    line_number: u32,
    reply_to_phid: Option<String>,
}

fn parse_comment_row(result: &str) -> Result<CommentRow> {
    let lines: Vec<&str> = result.split('\n').collect();
    if lines.len() != 1 {
        bail!("Unexpected number of comment rows: {lines:?}");
    }
    let columns: Vec<&str> = lines[0].split('\t').collect();
    if columns.len() != 4 {
        bail!("Unexpected number of comment columns: {columns:?}");
    }
    let changeset_id = match nullable(columns[1]) {
        Some(id) => Some(
            id.parse()
                .with_context(|| format!("Bad changeset id: {id}"))?,
        ),
        None => None,
    };
    Ok(CommentRow {
        phid: columns[0].to_string(),
        changeset_id,
        line_number: columns[2]
            .parse()
            .with_context(|| format!("Bad line number: {}", columns[2]))?,
        reply_to_phid: nullable(columns[3]),
    })
}

/// Reads a review's transaction log and comment payloads.
pub struct ReviewDatabase {
    diffs: Rc<DiffStore>,
}

impl ReviewDatabase {
    #[must_use]
    pub fn new(diffs: Rc<DiffStore>) -> Self {
        Self { diffs }
    }

    /// The full ordered transaction log for one review.
    pub fn transactions(&self, review_phid: &str) -> Result<TransactionLog> {
        let query = format!(
            r#"select id, phid, authorPHID, dateCreated, transactionType, newValue, commentPHID
  from phabricator_differential.differential_transaction
  where objectPHID="{review_phid}"
    and viewPolicy="public"
    and (transactionType = "differential:action" or
         transactionType = "differential:inline" or
         transactionType = "core:comment")
  order by id;"#
        );
        let transactions = parse_transactions(&run_sql(&query)?)?;
        Ok(TransactionLog::new(transactions)?)
    }

    /// Resolve a changeset to the (commit, filename) pair a comment is
    /// anchored to. The commit comes from the changeset's owning diff.
    fn changeset_anchor(&self, changeset_id: u64) -> Result<(String, String)> {
        let filename = run_sql(&format!(
            r#"select filename from phabricator_differential.differential_changeset
  where id = "{changeset_id}";"#
        ))?;
        let diff_id = run_sql(&format!(
            r#"select diffID from phabricator_differential.differential_changeset
  where id = "{changeset_id}";"#
        ))?;
        let diff_id: u64 = diff_id
            .parse()
            .with_context(|| format!("Bad diff id for changeset {changeset_id}: {diff_id}"))?;
        let commit = self
            .diffs
            .read(diff_id)?
            .map(|diff| diff.last_commit())
            .unwrap_or_default();
        Ok((commit, filename))
    }
}

impl PayloadSource for ReviewDatabase {
    fn load(&self, transaction_phid: &str) -> Result<Option<CommentPayload>> {
        let result = run_sql(&format!(
            r#"select phid, changesetID, lineNumber, replyToCommentPHID
  from phabricator_differential.differential_transaction_comment
  where viewPolicy = "public" and transactionPHID = "{transaction_phid}";"#
        ))?;
        if result.trim().is_empty() {
            return Ok(None);
        }
        let row = parse_comment_row(&result)?;

        let location = match row.changeset_id {
            Some(changeset_id) => {
                let (commit, filename) = self.changeset_anchor(changeset_id)?;
                if filename.is_empty() {
                    None
                } else {
                    Some(Location {
                        commit,
                        path: filename,
                        range: (row.line_number != 0)
                            .then_some(LineRange { start_line: row.line_number }),
                    })
                }
            }
            None => None,
        };

        let content = run_sql_raw(&format!(
            r#"select content from phabricator_differential.differential_transaction_comment
  where phid = "{}";"#,
            row.phid
        ))?;

        Ok(Some(CommentPayload {
            content,
            location,
            reply_to_phid: row.reply_to_phid,
        }))
    }
}
