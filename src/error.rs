use std::fmt;
use std::path::PathBuf;

use crate::ObjectId;

/// error type for engine operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("repository not found at {0}")]
    NoRepo(PathBuf),

    #[error("repository at {path} uses {found}, requested {requested}")]
    FormatMismatch {
        path: PathBuf,
        found: String,
        requested: String,
    },

    #[error("system not initialized: call init_system first")]
    NotInitialized,

    #[error("{0} is not the engine base directory")]
    NotEngineBase(PathBuf),

    #[error("no repository registered for {0}")]
    UnknownRepo(String),

    #[error("repository at {path} belongs to {found}, not {requested}")]
    RemoteMismatch {
        path: PathBuf,
        found: String,
        requested: String,
    },

    #[error("invalid repository name: {0:?}")]
    InvalidRepoName(String),

    #[error("repository at {0} has no remote configured")]
    NoRemote(PathBuf),

    #[error("repository busy: {0}")]
    RepoBusy(PathBuf),

    #[error("ref not found: {0}")]
    RefNotFound(String),

    #[error("branch not found on remote: {0}")]
    BranchNotFound(String),

    #[error("invalid ref name: {0}")]
    InvalidRef(String),

    #[error("ref {name} changed concurrently (expected {expected}, found {found})")]
    RefConflict {
        name: String,
        expected: String,
        found: String,
    },

    #[error("ref {0} is locked by another writer")]
    RefLocked(String),

    #[error("path not found in tree: {0}")]
    PathNotFound(String),

    #[error("path is a directory, not a file: {0}")]
    NotAFile(String),

    #[error("path is not a directory: {0}")]
    NotADirectory(String),

    #[error("{id} is a {found}, expected a {expected}")]
    WrongKind {
        id: ObjectId,
        found: &'static str,
        expected: &'static str,
    },

    #[error("object not found: {0}")]
    ObjectNotFound(ObjectId),

    #[error("corrupt object: hash mismatch for {0}")]
    CorruptObject(ObjectId),

    #[error("corrupt object: {0}")]
    CorruptObjectMessage(String),

    #[error("corrupt pack: {0}")]
    CorruptPack(String),

    #[error("incomplete history: {count} objects missing below {tip}")]
    Incomplete { tip: ObjectId, count: usize },

    #[error("invalid tree entry name: {0}")]
    InvalidEntryName(String),

    #[error("duplicate tree entry name: {0}")]
    DuplicateEntryName(String),

    #[error("invalid object type: {0}")]
    InvalidObjectType(String),

    #[error("invalid hash hex: {0}")]
    InvalidHashHex(String),

    #[error("ssh key not found at {0}")]
    KeyNotFound(PathBuf),

    #[error("invalid ssh key: {0}")]
    InvalidKey(String),

    #[error("authentication rejected by remote: {0}")]
    Authentication(String),

    #[error("network failure: {0}")]
    Network(String),

    #[error("remote repository not found: {0}")]
    RemoteRepoNotFound(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("remote error: {0}")]
    Remote(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("config error: {0}")]
    Config(#[from] toml::de::Error),

    #[error("config serialization error: {0}")]
    ConfigSerialize(#[from] toml::ser::Error),

    #[error("json serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// coarse classification every error maps onto
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    Conflict,
    AuthenticationFailure,
    NetworkFailure,
    Corruption,
    InvalidState,
    Unsupported,
    TypeMismatch,
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::AuthenticationFailure => "authentication_failure",
            ErrorKind::NetworkFailure => "network_failure",
            ErrorKind::Corruption => "corruption",
            ErrorKind::InvalidState => "invalid_state",
            ErrorKind::Unsupported => "unsupported",
            ErrorKind::TypeMismatch => "type_mismatch",
            ErrorKind::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NoRepo(_)
            | Error::UnknownRepo(_)
            | Error::RefNotFound(_)
            | Error::BranchNotFound(_)
            | Error::PathNotFound(_)
            | Error::ObjectNotFound(_)
            | Error::KeyNotFound(_)
            | Error::RemoteRepoNotFound(_) => ErrorKind::NotFound,

            Error::RefConflict { .. } | Error::RefLocked(_) | Error::RepoBusy(_) => {
                ErrorKind::Conflict
            }

            Error::Authentication(_) => ErrorKind::AuthenticationFailure,

            Error::Network(_) | Error::Remote(_) => ErrorKind::NetworkFailure,

            Error::CorruptObject(_)
            | Error::CorruptObjectMessage(_)
            | Error::CorruptPack(_)
            | Error::Incomplete { .. }
            | Error::InvalidKey(_)
            | Error::Protocol(_)
            | Error::Config(_) => ErrorKind::Corruption,

            Error::NotAFile(_) | Error::NotADirectory(_) | Error::WrongKind { .. } => {
                ErrorKind::TypeMismatch
            }

            Error::Unsupported(_) => ErrorKind::Unsupported,

            Error::Cancelled => ErrorKind::Cancelled,

            Error::FormatMismatch { .. }
            | Error::NotInitialized
            | Error::NotEngineBase(_)
            | Error::RemoteMismatch { .. }
            | Error::InvalidRepoName(_)
            | Error::NoRemote(_)
            | Error::InvalidRef(_)
            | Error::InvalidEntryName(_)
            | Error::DuplicateEntryName(_)
            | Error::InvalidObjectType(_)
            | Error::InvalidHashHex(_)
            | Error::Io { .. }
            | Error::ConfigSerialize(_)
            | Error::Json(_) => ErrorKind::InvalidState,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// helper to wrap io errors with path context
pub trait IoResultExt<T> {
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T> IoResultExt<T> for std::io::Result<T> {
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T> {
        self.map_err(|source| Error::Io {
            path: path.into(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(Error::RefNotFound("x".into()).kind(), ErrorKind::NotFound);
        assert_eq!(Error::RefLocked("x".into()).kind(), ErrorKind::Conflict);
        assert_eq!(Error::NotAFile("a".into()).kind(), ErrorKind::TypeMismatch);
        assert_eq!(Error::Cancelled.kind(), ErrorKind::Cancelled);
        assert_eq!(
            Error::Network("refused".into()).kind(),
            ErrorKind::NetworkFailure
        );
    }

    #[test]
    fn test_branch_not_found_message_is_distinct() {
        let ref_err = Error::RefNotFound("dev".into()).to_string();
        let branch_err = Error::BranchNotFound("dev".into()).to_string();
        assert_ne!(ref_err, branch_err);
        assert!(branch_err.contains("remote"));
    }
}
