//! Reconstruction of a threaded comment history from the review service's
//! flat transaction log.
//!
//! The remote service records every review action (commenting, accepting,
//! rejecting) as one atomic transaction in an append-only log. This
//! module replays that log and rebuilds the comment records the annotation
//! store understands, including synthetic records for implicit side
//! effects (an acceptance resolving earlier rejections).
//!
//! Correctness of reply threading depends on processing the log in
//! ascending sequence order, so the input is an ordered sequence type that
//! refuses out-of-order construction rather than trusting the caller.

use std::collections::HashMap;

use anyhow::{Context, Result};
use thiserror::Error;
use tracing::debug;

use crate::comment::{Comment, Location};
use crate::remote::identity::IdentityDirectory;

/// What a transaction did to the review.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionAction {
    /// A plain comment or inline comment (or publish-trigger noise that
    /// carries no payload at all).
    Comment,
    /// The actor accepted the change.
    Accept,
    /// The actor rejected the change.
    Reject,
}

/// One atomic recorded action from the remote review service's log.
#[derive(Debug, Clone)]
pub struct Transaction {
    /// Position in the log; strictly ascending.
    pub sequence_id: u64,
    /// The transaction's own opaque identifier. Reply-to references point
    /// at these.
    pub phid: String,
    /// Opaque id of the actor, resolved through the identity directory.
    pub author_phid: String,
    /// Creation time in epoch seconds.
    pub created_at: u64,
    pub action: TransactionAction,
    /// Set when the transaction carries a comment payload.
    pub comment_phid: Option<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransactionLogError {
    #[error("transaction log is not in ascending sequence order: {prev} followed by {next}")]
    OutOfOrder { prev: u64, next: u64 },
}

/// An ordered view of a review's transaction log.
///
/// Construction fails on any non-ascending sequence id; reconstruction
/// relies on causal predecessors being processed before dependents.
#[derive(Debug, Default)]
pub struct TransactionLog {
    transactions: Vec<Transaction>,
}

impl TransactionLog {
    pub fn new(transactions: Vec<Transaction>) -> Result<Self, TransactionLogError> {
        for pair in transactions.windows(2) {
            if pair[1].sequence_id <= pair[0].sequence_id {
                return Err(TransactionLogError::OutOfOrder {
                    prev: pair[0].sequence_id,
                    next: pair[1].sequence_id,
                });
            }
        }
        Ok(Self { transactions })
    }

    pub fn iter(&self) -> impl Iterator<Item = &Transaction> {
        self.transactions.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }
}

/// The comment body attached to a transaction, with its anchor location
/// already joined against the diff metadata.
#[derive(Debug, Clone, Default)]
pub struct CommentPayload {
    pub content: String,
    pub location: Option<Location>,
    /// The phid of the transaction this comment replies to, if any.
    pub reply_to_phid: Option<String>,
}

/// Source of comment payloads, keyed by the owning transaction's phid.
pub trait PayloadSource {
    fn load(&self, transaction_phid: &str) -> Result<Option<CommentPayload>>;
}

/// Replay the transaction log and emit the equivalent comment records.
///
/// Output order is emission order: one record per non-empty transaction,
/// with accept-derived synthetic children emitted immediately before the
/// triggering transaction's own record.
///
/// Each acceptance re-derives one synthetic "resolved" child for every
/// rejection this actor has made anywhere earlier in the log. The
/// history is cumulative and never cleared, so a second acceptance
/// re-synthesizes children for rejections that were already covered by
/// the first. Downstream consumers depend on the exact count, so this is
/// reproduced as-is rather than de-duplicated here.
pub fn reconstruct(
    log: &TransactionLog,
    payloads: &dyn PayloadSource,
    identities: &IdentityDirectory,
) -> Result<Vec<Comment>> {
    let mut comments: Vec<Comment> = Vec::new();
    let mut emitted_by_phid: HashMap<&str, Comment> = HashMap::new();
    let mut rejections_by_actor: HashMap<String, Vec<String>> = HashMap::new();

    for transaction in log.iter() {
        let author = identities
            .lookup_id(&transaction.author_phid)?
            .with_context(|| format!("Unknown actor identity: {}", transaction.author_phid))?;

        let mut comment = Comment {
            timestamp: transaction.created_at.to_string(),
            author: author.preferred_handle().to_string(),
            ..Comment::default()
        };

        if transaction.comment_phid.is_some() {
            let payload = payloads.load(&transaction.phid)?.with_context(|| {
                format!("Missing comment payload for transaction {}", transaction.phid)
            })?;
            comment.description = payload.content;
            comment.location = payload.location;
            if let Some(reply_to) = &payload.reply_to_phid {
                // The parent must already have been emitted; the ascending
                // order of the log guarantees it when the reference is valid.
                if let Some(parent) = emitted_by_phid.get(reply_to.as_str()) {
                    comment.parent = parent.hash()?;
                }
            }
        }

        match transaction.action {
            TransactionAction::Accept => {
                comment.resolved = Some(true);
                if let Some(rejections) = rejections_by_actor.get(&author.name) {
                    for rejection_hash in rejections {
                        let child = Comment {
                            timestamp: comment.timestamp.clone(),
                            author: comment.author.clone(),
                            parent: rejection_hash.clone(),
                            resolved: Some(true),
                            ..Comment::default()
                        };
                        debug!(
                            parent = %rejection_hash,
                            actor = %author.name,
                            "synthesizing approval child for earlier rejection"
                        );
                        comments.push(child);
                    }
                }
            }
            TransactionAction::Reject => comment.resolved = Some(false),
            TransactionAction::Comment => {}
        }

        // Publishing an inline comment also records an empty top-level
        // transaction; those carry no information and are dropped.
        let empty = comment.parent.is_empty()
            && comment.location.is_none()
            && comment.description.is_empty()
            && comment.resolved.is_none();
        if empty {
            continue;
        }

        if comment.resolved == Some(false) {
            rejections_by_actor
                .entry(author.name.clone())
                .or_default()
                .push(comment.hash()?);
        }
        emitted_by_phid.insert(transaction.phid.as_str(), comment.clone());
        comments.push(comment);
    }

    debug!(count = comments.len(), "reconstructed comments");
    Ok(comments)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::identity::{Identity, IdentityResolver};
    use std::collections::HashMap;

    /// Resolver that fabricates `<id>@example.com` identities, mirroring
    /// the shape the real directory returns.
    struct FixtureResolver;

    impl IdentityResolver for FixtureResolver {
        fn resolve_by_id(&self, id: &str) -> Result<Option<Identity>> {
            Ok(Some(Identity {
                id: id.to_string(),
                name: id.to_string(),
                email: format!("{id}@example.com"),
                ..Identity::default()
            }))
        }

        fn resolve_by_name(&self, _name: &str) -> Result<Option<Identity>> {
            Ok(None)
        }
    }

    struct MapPayloads(HashMap<String, CommentPayload>);

    impl PayloadSource for MapPayloads {
        fn load(&self, transaction_phid: &str) -> Result<Option<CommentPayload>> {
            Ok(self.0.get(transaction_phid).cloned())
        }
    }

    struct NoPayloads;

    impl PayloadSource for NoPayloads {
        fn load(&self, _transaction_phid: &str) -> Result<Option<CommentPayload>> {
            Ok(None)
        }
    }

    fn directory() -> IdentityDirectory {
        IdentityDirectory::new(Box::new(FixtureResolver))
    }

    fn action(sequence_id: u64, actor: &str, action: TransactionAction) -> Transaction {
        Transaction {
            sequence_id,
            phid: format!("PHID-XACT-{sequence_id}"),
            author_phid: actor.to_string(),
            created_at: sequence_id,
            action,
            comment_phid: None,
        }
    }

    fn verdict(author: &str, timestamp: u64, resolved: bool, parent: &str) -> Comment {
        Comment {
            timestamp: timestamp.to_string(),
            author: format!("{author}@example.com"),
            parent: parent.to_string(),
            resolved: Some(resolved),
            ..Comment::default()
        }
    }

    #[test]
    fn test_out_of_order_log_is_rejected() {
        let err = TransactionLog::new(vec![
            action(2, "u1", TransactionAction::Comment),
            action(1, "u1", TransactionAction::Comment),
        ])
        .expect_err("must reject");
        assert_eq!(err, TransactionLogError::OutOfOrder { prev: 2, next: 1 });
    }

    #[test]
    fn test_duplicate_sequence_ids_are_rejected() {
        assert!(TransactionLog::new(vec![
            action(1, "u1", TransactionAction::Comment),
            action(1, "u1", TransactionAction::Comment),
        ])
        .is_err());
    }

    /// The reference accept/reject interleaving: one actor cycling through
    /// reject/accept twice with a second actor's rejection in between.
    ///
    /// Every acceptance synthesizes a resolved child for each of the
    /// actor's earlier rejections, cumulatively, so the second acceptance
    /// re-derives a child for the first rejection as well as the second.
    #[test]
    fn test_reconstruction_of_repeated_accept_reject_cycles() {
        use TransactionAction::{Accept, Reject};
        let log = TransactionLog::new(vec![
            action(1, "u1", Reject),
            action(2, "u1", Accept),
            action(3, "u1", Reject),
            action(4, "u2", Reject),
            action(5, "u1", Accept),
        ])
        .expect("ordered log");

        let comments = reconstruct(&log, &NoPayloads, &directory()).expect("reconstruct");

        let c1 = verdict("u1", 1, false, "");
        let c4 = verdict("u1", 3, false, "");
        let c1_hash = c1.hash().expect("hash");
        let c4_hash = c4.hash().expect("hash");
        let expected = vec![
            c1.clone(),
            verdict("u1", 2, true, &c1_hash),
            verdict("u1", 2, true, ""),
            c4,
            verdict("u2", 4, false, ""),
            verdict("u1", 5, true, &c1_hash),
            verdict("u1", 5, true, &c4_hash),
            verdict("u1", 5, true, ""),
        ];

        assert_eq!(comments.len(), 8, "got: {comments:#?}");
        assert_eq!(comments, expected);
    }

    #[test]
    fn test_empty_transactions_are_dropped() {
        let log = TransactionLog::new(vec![action(1, "u1", TransactionAction::Comment)])
            .expect("ordered log");
        let comments = reconstruct(&log, &NoPayloads, &directory()).expect("reconstruct");
        assert!(comments.is_empty(), "noise must not be emitted: {comments:?}");
    }

    #[test]
    fn test_reply_to_resolves_to_parent_hash() {
        let mut t1 = action(1, "u1", TransactionAction::Comment);
        t1.comment_phid = Some("PHID-CMNT-1".to_string());
        let mut t2 = action(2, "u2", TransactionAction::Comment);
        t2.comment_phid = Some("PHID-CMNT-2".to_string());

        let mut payloads = HashMap::new();
        payloads.insert(
            t1.phid.clone(),
            CommentPayload {
                content: "first!".to_string(),
                ..CommentPayload::default()
            },
        );
        payloads.insert(
            t2.phid.clone(),
            CommentPayload {
                content: "replying".to_string(),
                reply_to_phid: Some(t1.phid.clone()),
                ..CommentPayload::default()
            },
        );

        let log = TransactionLog::new(vec![t1, t2]).expect("ordered log");
        let comments =
            reconstruct(&log, &MapPayloads(payloads), &directory()).expect("reconstruct");

        assert_eq!(comments.len(), 2);
        assert_eq!(comments[1].parent, comments[0].hash().expect("hash"));
    }

    #[test]
    fn test_reply_to_unknown_transaction_leaves_no_parent() {
        let mut t1 = action(1, "u1", TransactionAction::Comment);
        t1.comment_phid = Some("PHID-CMNT-1".to_string());

        let mut payloads = HashMap::new();
        payloads.insert(
            t1.phid.clone(),
            CommentPayload {
                content: "orphan reply".to_string(),
                reply_to_phid: Some("PHID-XACT-GONE".to_string()),
                ..CommentPayload::default()
            },
        );

        let log = TransactionLog::new(vec![t1]).expect("ordered log");
        let comments =
            reconstruct(&log, &MapPayloads(payloads), &directory()).expect("reconstruct");
        assert_eq!(comments.len(), 1);
        assert!(comments[0].parent.is_empty());
    }

    #[test]
    fn test_missing_payload_for_comment_transaction_is_fatal() {
        let mut t1 = action(1, "u1", TransactionAction::Comment);
        t1.comment_phid = Some("PHID-CMNT-1".to_string());
        let log = TransactionLog::new(vec![t1]).expect("ordered log");
        assert!(reconstruct(&log, &NoPayloads, &directory()).is_err());
    }

    #[test]
    fn test_author_falls_back_to_account_name_without_email() {
        struct NoEmailResolver;
        impl IdentityResolver for NoEmailResolver {
            fn resolve_by_id(&self, id: &str) -> Result<Option<Identity>> {
                Ok(Some(Identity {
                    id: id.to_string(),
                    name: format!("account-{id}"),
                    ..Identity::default()
                }))
            }
            fn resolve_by_name(&self, _name: &str) -> Result<Option<Identity>> {
                Ok(None)
            }
        }

        let log = TransactionLog::new(vec![action(1, "u9", TransactionAction::Reject)])
            .expect("ordered log");
        let directory = IdentityDirectory::new(Box::new(NoEmailResolver));
        let comments = reconstruct(&log, &NoPayloads, &directory).expect("reconstruct");
        assert_eq!(comments[0].author, "account-u9");
    }
}
