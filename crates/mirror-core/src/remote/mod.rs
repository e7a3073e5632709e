//! Review-service collaborator interface.
//!
//! The remote review service is specified only at this seam; the
//! Phabricator implementation lives in [`crate::phab`]. Everything the
//! sync controller does with the remote side goes through these two
//! traits, which is also what makes the controller testable with
//! in-memory fakes.

use anyhow::Result;

use crate::comment::{Comment, CommentSet};
use crate::request::ReviewRequest;
use crate::scm::{Repo, Revision};

pub mod identity;
pub mod transactions;

/// One open review on the remote service.
pub trait RemoteReview {
    /// The oldest locally-recorded revision included in this review, by
    /// commit time. `None` when no included commit is known locally, in
    /// which case the review is skipped this tick.
    fn first_relevant_commit(&self, repo: &dyn Repo) -> Option<Revision>;

    /// The review's full comment history, reconstructed from the remote
    /// transaction log. Replayed in full on every call; deduplication
    /// happens downstream.
    fn load_comments(&self) -> Result<Vec<Comment>>;
}

/// The remote review service.
pub trait ReviewService {
    type Review: RemoteReview;

    /// Make sure a remote review exists (and is up to date) for the given
    /// revision and request. `known_comments` is everything already
    /// recorded locally, so the remote side can avoid re-displaying
    /// comments that were mirrored from it in the first place.
    fn ensure_request_exists(
        &self,
        repo: &dyn Repo,
        revision: &Revision,
        request: &ReviewRequest,
        known_comments: &CommentSet,
    ) -> Result<()>;

    /// All reviews the service knows about that are not yet closed.
    fn list_open_reviews(&self, repo: &dyn Repo) -> Result<Vec<Self::Review>>;

    /// Advise the service that the underlying repository has changed and
    /// should be re-scanned.
    fn refresh(&self, repo: &dyn Repo) -> Result<()>;
}
