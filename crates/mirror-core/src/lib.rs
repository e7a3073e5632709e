//! mirror-core — reconciliation logic for mirroring code reviews between
//! git-notes annotations and a Phabricator instance.
//!
//! This crate owns the comment model and its overlap matching, the
//! transaction-log reconstruction, the SCM and review-service seams, and
//! the sync controller that ties them together.

pub mod cache;
pub mod ci;
pub mod comment;
pub mod exec;
pub mod phab;
pub mod remote;
pub mod request;
pub mod scm;
pub mod sync;
