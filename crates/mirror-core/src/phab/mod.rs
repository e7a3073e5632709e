//! Phabricator as the remote review service.
//!
//! The service is reached three ways: the Conduit RPC API for everything
//! it exposes, direct database reads for the comment data it does not,
//! and the diff store for anchoring comments to commits.

pub mod conduit;
pub mod db;
pub mod diff;
pub mod differential;
pub mod users;

pub use differential::Phabricator;
