//! Storage Policy Handlers
//!
//! The transfer engine and the session dispatcher are agnostic to where
//! bytes come from or go to. A [`Handler`] supplies that policy: it decides
//! whether a request is allowed and opens the byte source or sink backing
//! it. [`DirHandler`] is the stock implementation serving a directory tree.

use std::fmt;
use std::path::{Component, Path, PathBuf};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::protocol::{ErrorCode, Mode};

/// Transfer direction as seen from the client's request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// The client reads a file from the server (RRQ).
    Read,
    /// The client writes a file to the server (WRQ).
    Write,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read => write!(f, "read"),
            Self::Write => write!(f, "write"),
        }
    }
}

/// Why the storage policy refused a request.
///
/// Each variant maps onto the wire error code reported to the peer.
#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("Access denied.")]
    AccessDenied,

    #[error("File not found.")]
    NotFound,

    #[error("File already exists.")]
    AlreadyExists,

    #[error("{0}")]
    Io(#[from] std::io::Error),
}

impl PolicyError {
    /// The wire error code this refusal is reported as.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::AccessDenied => ErrorCode::AccessViolation,
            Self::NotFound => ErrorCode::FileNotFound,
            Self::AlreadyExists => ErrorCode::FileAlreadyExists,
            Self::Io(_) => ErrorCode::NotDefined,
        }
    }
}

/// Byte source backing a read request.
pub type Source = Box<dyn AsyncRead + Send + Unpin>;

/// Byte sink backing a write request.
pub type Sink = Box<dyn AsyncWrite + Send + Unpin>;

/// Storage policy consulted by a session.
///
/// Sessions call [`authorize`](Handler::authorize) before touching storage,
/// then open a source or sink for the transfer. The handler never sees the
/// socket; refusals are turned into ERROR packets by the session.
pub trait Handler: Send + Sync + 'static {
    /// Decide whether a transfer in the given direction may proceed.
    fn authorize(&self, direction: Direction, filename: &str) -> Result<(), PolicyError>;

    /// Open the byte source backing a read request.
    fn open_source(&self, filename: &str, mode: Mode) -> Result<Source, PolicyError>;

    /// Open the byte sink backing a write request.
    fn open_sink(&self, filename: &str, mode: Mode) -> Result<Sink, PolicyError>;

    /// Remove a partially written destination after a failed write.
    fn discard(&self, filename: &str);
}

/// Access switches for [`DirHandler`].
#[derive(Debug, Clone, Copy)]
pub struct DirPolicy {
    /// Serve read requests.
    pub read: bool,
    /// Serve write requests.
    pub write: bool,
    /// Allow write requests to replace an existing file. When false, a
    /// write request for an existing file is refused with "File already
    /// exists" instead of truncating it.
    pub overwrite: bool,
}

impl Default for DirPolicy {
    fn default() -> Self {
        Self {
            read: true,
            write: true,
            overwrite: true,
        }
    }
}

/// Read-write handler over a directory tree.
///
/// Requested filenames are resolved relative to the root directory. A name
/// that is absolute or escapes the root through parent components is denied.
pub struct DirHandler {
    root: PathBuf,
    policy: DirPolicy,
}

impl DirHandler {
    /// Create a handler serving files from and to `root`.
    pub fn new(root: impl Into<PathBuf>, policy: DirPolicy) -> Self {
        Self {
            root: root.into(),
            policy,
        }
    }

    /// The directory this handler serves.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a requested filename inside the root directory.
    fn resolve(&self, filename: &str) -> Result<PathBuf, PolicyError> {
        let relative = Path::new(filename);
        // Only plain path segments are allowed; this rejects absolute paths,
        // drive prefixes and any ".." traversal out of the root.
        if relative.components().any(|c| !matches!(c, Component::Normal(_))) {
            return Err(PolicyError::AccessDenied);
        }
        Ok(self.root.join(relative))
    }
}

impl Handler for DirHandler {
    fn authorize(&self, direction: Direction, filename: &str) -> Result<(), PolicyError> {
        match direction {
            Direction::Read if !self.policy.read => return Err(PolicyError::AccessDenied),
            Direction::Write if !self.policy.write => return Err(PolicyError::AccessDenied),
            _ => {}
        }
        self.resolve(filename).map(|_| ())
    }

    fn open_source(&self, filename: &str, mode: Mode) -> Result<Source, PolicyError> {
        let path = self.resolve(filename)?;
        tracing::debug!("Opening {} for {} read", path.display(), mode);
        let file = std::fs::File::open(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => PolicyError::NotFound,
            std::io::ErrorKind::PermissionDenied => PolicyError::AccessDenied,
            _ => PolicyError::Io(e),
        })?;
        Ok(Box::new(tokio::fs::File::from_std(file)))
    }

    fn open_sink(&self, filename: &str, mode: Mode) -> Result<Sink, PolicyError> {
        let path = self.resolve(filename)?;
        if !self.policy.overwrite && path.exists() {
            return Err(PolicyError::AlreadyExists);
        }
        tracing::debug!("Opening {} for {} write", path.display(), mode);
        let file = std::fs::File::create(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::PermissionDenied => PolicyError::AccessDenied,
            _ => PolicyError::Io(e),
        })?;
        Ok(Box::new(tokio::fs::File::from_std(file)))
    }

    fn discard(&self, filename: &str) {
        if let Ok(path) = self.resolve(filename) {
            if let Err(e) = std::fs::remove_file(&path) {
                tracing::debug!("Could not remove {}: {}", path.display(), e);
            }
        }
    }
}
