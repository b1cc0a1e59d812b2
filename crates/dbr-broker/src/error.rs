//! ---
//! dbr_section: "02-tuple-space"
//! dbr_subsection: "module"
//! dbr_type: "source"
//! dbr_scope: "code"
//! dbr_description: "Tuple-space result and error vocabulary."
//! dbr_version: "v0.0.0-prealpha"
//! dbr_owner: "tbd"
//! ---
use std::path::PathBuf;
use std::time::Duration;

use dbr_common::ErrorCode;

use crate::tag::Tag;
use crate::types::NamespaceHandle;

/// Result alias used throughout the tuple-space crate.
pub type Result<T> = std::result::Result<T, DbrError>;

/// Error type for tuple-space operations.
///
/// Every variant maps onto exactly one [`ErrorCode`]; the variants carry the
/// context a caller needs to decide between retrying, escalating, or aborting.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DbrError {
    /// Malformed argument (empty or oversized key, missing selector, ...).
    #[error("invalid argument: {0}")]
    Invalid(String),
    /// The handle was never issued, or has been detached or deleted.
    #[error("namespace handle {0} is not valid")]
    Handle(NamespaceHandle),
    /// The request has not completed yet.
    #[error("operation in progress")]
    InProgress,
    /// A blocking call exceeded its deadline.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
    /// The caller buffer cannot hold the matched payload.
    #[error("buffer of {provided} bytes is too small; {required} bytes required")]
    UserBuffer {
        /// Capacity the caller offered.
        provided: usize,
        /// Capacity needed to complete the operation.
        required: usize,
    },
    /// No matching tuple, or no such namespace.
    #[error("entry not available")]
    Unavailable,
    /// A namespace with this name already exists.
    #[error("namespace {0} already exists")]
    Exists(String),
    /// Delete refused while other handles remain attached.
    #[error("namespace {name} is still referenced by {references} handle(s)")]
    NamespaceBusy {
        /// Namespace name.
        name: String,
        /// Live handles at the time of the request.
        references: usize,
    },
    /// The namespace behind a handle no longer exists.
    #[error("namespace {0} is invalid")]
    NamespaceInvalid(String),
    /// Backend resource exhaustion.
    #[error("insufficient memory or storage: {0}")]
    NoMemory(String),
    /// Unknown or already collected request tag.
    #[error("unknown request tag {0}")]
    Tag(Tag),
    /// Every tag slot is taken by uncollected requests.
    #[error("{0} request tags outstanding; collect completed tags with test")]
    TagsExhausted(usize),
    /// A file needed by the operation does not exist.
    #[error("file not found: {}", .0.display())]
    NoFile(PathBuf),
    /// The backend cannot be reached.
    #[error("backend unreachable: {0}")]
    NoConnect(String),
    /// The request was cancelled before it resolved.
    #[error("operation was cancelled")]
    Cancelled,
    /// The backend does not provide this operation.
    #[error("{0} is not implemented by this backend")]
    NotImplemented(&'static str),
    /// The operation is not valid in the current state.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
    /// The request could not be submitted to the backend.
    #[error("failed to post request to backend: {0}")]
    BackendPost(String),
    /// Unclassified backend failure.
    #[error("backend error: {0}")]
    Backend(String),
}

impl DbrError {
    /// Canonical result code for the error.
    pub fn code(&self) -> ErrorCode {
        match self {
            DbrError::Invalid(_) => ErrorCode::Invalid,
            DbrError::Handle(_) => ErrorCode::Handle,
            DbrError::InProgress => ErrorCode::InProgress,
            DbrError::Timeout(_) => ErrorCode::Timeout,
            DbrError::UserBuffer { .. } => ErrorCode::UserBuffer,
            DbrError::Unavailable => ErrorCode::Unavailable,
            DbrError::Exists(_) => ErrorCode::Exists,
            DbrError::NamespaceBusy { .. } => ErrorCode::NamespaceBusy,
            DbrError::NamespaceInvalid(_) => ErrorCode::NamespaceInvalid,
            DbrError::NoMemory(_) => ErrorCode::NoMemory,
            DbrError::Tag(_) | DbrError::TagsExhausted(_) => ErrorCode::TagError,
            DbrError::NoFile(_) => ErrorCode::NoFile,
            DbrError::NoConnect(_) => ErrorCode::NoConnect,
            DbrError::Cancelled => ErrorCode::Cancelled,
            DbrError::NotImplemented(_) => ErrorCode::NotImplemented,
            DbrError::InvalidOperation(_) => ErrorCode::InvalidOperation,
            DbrError::BackendPost(_) => ErrorCode::BackendPost,
            DbrError::Backend(_) => ErrorCode::BackendGeneral,
        }
    }

    /// Whether repeating the request may succeed without caller intervention.
    pub fn is_retryable(&self) -> bool {
        self.code().is_retryable()
    }

    /// Required buffer size reported by a UBUFFER failure.
    pub fn required_size(&self) -> Option<usize> {
        match self {
            DbrError::UserBuffer { required, .. } => Some(*required),
            _ => None,
        }
    }
}

impl From<std::io::Error> for DbrError {
    fn from(err: std::io::Error) -> Self {
        DbrError::Backend(err.to_string())
    }
}

impl From<serde_json::Error> for DbrError {
    fn from(err: serde_json::Error) -> Self {
        DbrError::Backend(format!("serialization error: {err}"))
    }
}
