//! higit - a git-compatible local repository engine
//!
//! mirrors remote git repositories into bare repositories on disk and
//! answers questions about them without a git installation.
//!
//! # Core concepts
//!
//! - **Object store**: zlib-compressed loose objects addressed by SHA-1 or
//!   SHA-256, with a quarantine that incoming packs land in before they are
//!   verified and promoted
//! - **Refs**: branch, tag and tracking refs updated by compare-and-swap
//! - **Transport**: the upload-pack protocol over `ssh`, or served in process
//!   for local paths
//! - **Lifecycle**: clone into staging, fetch, delete, under one base
//!   directory shared with the engine's ed25519 identity
//!
//! # Example usage
//!
//! ```no_run
//! use higit::api::Engine;
//!
//! let engine = Engine::new();
//! engine.init_system("/var/lib/higit");
//! let response = engine.init_repo("/var/lib/higit", "git@github.com:owner/repo.git", "repo", "github");
//! if response.is_ok() {
//!     let log = engine.history("git@github.com:owner/repo.git", "main", 20, 0);
//!     println!("{}", log.data);
//! }
//! ```

mod config;
mod error;
mod hash;
mod repo;

pub mod api;
pub mod identity;
pub mod lifecycle;
pub mod object;
pub mod ops;
pub mod pack;
pub mod progress;
pub mod refs;
pub mod transport;
pub mod types;

#[cfg(test)]
mod testutil;

pub use config::{Config, Remote, Settings};
pub use error::{Error, ErrorKind, Result};
pub use hash::{HashAlgorithm, ObjectId};
pub use repo::{Repo, RepoLock};
pub use types::{Commit, EntryMode, Signature, Tag, Tree, TreeEntry};
