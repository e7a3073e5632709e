//! The reconciliation loop.
//!
//! One controller owns the per-repository caches and drives both
//! directions of the mirror on every tick: publishing review requests and
//! local comments to the remote service, and harvesting remote discussion
//! back into the annotation store.
//!
//! Repositories are processed sequentially; none of the cache maps are
//! synchronized, so a controller must stay on one thread.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Result;
use tracing::{debug, info, warn};

use crate::comment::{
    build_threads, has_overlap, parse_all_valid, CommentThread, DISCUSS_REF,
};
use crate::remote::{RemoteReview, ReviewService};
use crate::request::{latest_request, REQUEST_REF};
use crate::scm::{Repo, Revision};

/// Drives reconciliation between local annotation stores and the remote
/// review service.
///
/// Request creation is gated on a repository state fingerprint; harvesting
/// runs every tick regardless, because the remote transaction log moves
/// independently of local state.
pub struct SyncController<S: ReviewService> {
    service: S,
    sync_to_remote: bool,
    processed_states: HashMap<PathBuf, String>,
    known_threads: HashMap<PathBuf, HashMap<Revision, Vec<CommentThread>>>,
    open_reviews: HashMap<PathBuf, Vec<S::Review>>,
}

impl<S: ReviewService> SyncController<S> {
    #[must_use]
    pub fn new(service: S, sync_to_remote: bool) -> Self {
        Self {
            service,
            sync_to_remote,
            processed_states: HashMap::new(),
            known_threads: HashMap::new(),
            open_reviews: HashMap::new(),
        }
    }

    /// Run one reconciliation pass over every repository in turn.
    ///
    /// Errors from a repository's pass propagate immediately; the process
    /// model is crash-and-restart rather than best-effort continuation.
    pub fn tick<'a>(&mut self, repos: impl IntoIterator<Item = &'a dyn Repo>) -> Result<()> {
        for repo in repos {
            self.sync_repo(repo)?;
        }
        Ok(())
    }

    /// One repository's pass: pull, publish requests if state moved,
    /// harvest remote comments, push.
    pub fn sync_repo(&mut self, repo: &dyn Repo) -> Result<()> {
        let path = repo.path().to_path_buf();

        if self.sync_to_remote {
            if let Err(err) = repo.pull() {
                warn!(repo = %path.display(), error = %err, "pull failed, skipping this pass");
                return Ok(());
            }
        }

        let fingerprint = repo.state_fingerprint();
        let changed = self
            .processed_states
            .get(&path)
            .is_none_or(|previous| *previous != fingerprint);
        if changed {
            self.publish_requests(repo, &path)?;
            self.open_reviews
                .insert(path.clone(), self.service.list_open_reviews(repo)?);
            self.processed_states.insert(path.clone(), fingerprint);
            self.service.refresh(repo)?;
        }

        // Take the review list out so harvesting can borrow the comment
        // cache mutably at the same time.
        let reviews = self.open_reviews.remove(&path).unwrap_or_default();
        let result = self.harvest(repo, &path, &reviews);
        self.open_reviews.insert(path.clone(), reviews);
        result?;

        if self.sync_to_remote {
            if let Err(err) = repo.push() {
                warn!(repo = %path.display(), error = %err, "push failed, will retry next tick");
            }
        }
        Ok(())
    }

    /// Mirror every pending review request to the remote service, and
    /// rebuild the per-revision comment cache while the notes are in hand.
    fn publish_requests(&mut self, repo: &dyn Repo, path: &Path) -> Result<()> {
        info!(repo = %path.display(), "processing repository state");
        let threads_by_revision = self.known_threads.entry(path.to_path_buf()).or_default();
        threads_by_revision.clear();
        for revision in repo.list_annotated_revisions(REQUEST_REF) {
            let Some(request) = latest_request(&repo.notes(REQUEST_REF, &revision)) else {
                continue;
            };
            let known = parse_all_valid(&repo.notes(DISCUSS_REF, &revision));
            let threads = build_threads(&known);
            self.service
                .ensure_request_exists(repo, &revision, &request, &known)?;
            threads_by_revision.insert(revision, threads);
        }
        Ok(())
    }

    /// Pull every open review's reconstructed comment history and append
    /// whatever the annotation store does not already cover.
    fn harvest(&mut self, repo: &dyn Repo, path: &Path, reviews: &[S::Review]) -> Result<()> {
        for review in reviews {
            let Some(revision) = review.first_relevant_commit(repo) else {
                debug!(repo = %path.display(), "review has no locally known commit, skipping");
                continue;
            };
            let threads = self
                .known_threads
                .entry(path.to_path_buf())
                .or_default()
                .entry(revision.clone())
                .or_insert_with(|| {
                    build_threads(&parse_all_valid(&repo.notes(DISCUSS_REF, &revision)))
                });
            for comment in review.load_comments()? {
                if has_overlap(&comment, threads) {
                    continue;
                }
                let note = comment.to_note()?;
                repo.append_note(DISCUSS_REF, &revision, &note, &comment.author)?;
                info!(
                    repo = %path.display(),
                    revision = %revision,
                    author = %comment.author,
                    "mirrored remote comment into annotation store"
                );
                threads.push(CommentThread {
                    hash: comment.hash()?,
                    comment,
                    children: Vec::new(),
                });
            }
        }
        Ok(())
    }
}
