//! ---
//! dbr_section: "01-core-functionality"
//! dbr_subsection: "module"
//! dbr_type: "source"
//! dbr_scope: "code"
//! dbr_description: "Shared primitives and utilities for the Data Broker."
//! dbr_version: "v0.0.0-prealpha"
//! dbr_owner: "tbd"
//! ---
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, FromRepr, IntoStaticStr};

/// Ordered result vocabulary shared by tuple-space and orchestrator operations.
///
/// The discriminants are stable and form the wire-level code surface; new kinds
/// may only be appended.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumIter,
    FromRepr,
    IntoStaticStr,
)]
#[repr(i32)]
pub enum ErrorCode {
    #[strum(serialize = "SUCCESS")]
    Success = 0,
    #[strum(serialize = "GENERIC")]
    Generic,
    #[strum(serialize = "INVALID")]
    Invalid,
    #[strum(serialize = "HANDLE")]
    Handle,
    #[strum(serialize = "INPROGRESS")]
    InProgress,
    #[strum(serialize = "TIMEOUT")]
    Timeout,
    #[strum(serialize = "UBUFFER")]
    UserBuffer,
    #[strum(serialize = "UNAVAIL")]
    Unavailable,
    #[strum(serialize = "EXISTS")]
    Exists,
    #[strum(serialize = "NSBUSY")]
    NamespaceBusy,
    #[strum(serialize = "NSINVAL")]
    NamespaceInvalid,
    #[strum(serialize = "NOMEMORY")]
    NoMemory,
    #[strum(serialize = "TAGERROR")]
    TagError,
    #[strum(serialize = "NOFILE")]
    NoFile,
    #[strum(serialize = "NOAUTH")]
    NoAuth,
    #[strum(serialize = "NOCONNECT")]
    NoConnect,
    #[strum(serialize = "CANCELLED")]
    Cancelled,
    #[strum(serialize = "NOTIMPL")]
    NotImplemented,
    #[strum(serialize = "INVALIDOP")]
    InvalidOperation,
    #[strum(serialize = "BE_POST")]
    BackendPost,
    #[strum(serialize = "BE_GENERAL")]
    BackendGeneral,
    #[strum(serialize = "ITERATOR")]
    Iterator,
    #[strum(serialize = "PLUGIN")]
    Plugin,
}

const UNKNOWN_ERROR: &str = "Unknown Error";

impl ErrorCode {
    /// Human-readable description of the code.
    pub fn message(self) -> &'static str {
        match self {
            ErrorCode::Success => "Operation successful",
            ErrorCode::Generic => "A general or unknown error has occurred",
            ErrorCode::Invalid => "Invalid argument",
            ErrorCode::Handle => "An invalid handle was encountered inside",
            ErrorCode::InProgress => "Operation in progress",
            ErrorCode::Timeout => "Operation timed out",
            ErrorCode::UserBuffer => "Provided user buffer problem (too small, not available)",
            ErrorCode::Unavailable => "Entry not available",
            ErrorCode::Exists => "Entry already exists",
            ErrorCode::NamespaceBusy => "Namespace still referenced by a client",
            ErrorCode::NamespaceInvalid => "Namespace is invalid",
            ErrorCode::NoMemory => "Insufficient memory or storage",
            ErrorCode::TagError => "Invalid tag",
            ErrorCode::NoFile => "File not found",
            ErrorCode::NoAuth => "Access authorization required or failed",
            ErrorCode::NoConnect => "Connection to a storage backend failed",
            ErrorCode::Cancelled => "Operation was cancelled",
            ErrorCode::NotImplemented => "Operation not implemented",
            ErrorCode::InvalidOperation => "Invalid operation",
            ErrorCode::BackendPost => "Failed to post request to back-end",
            ErrorCode::BackendGeneral => "Unspecified back-end error",
            ErrorCode::Iterator => "Iterator exhausted or invalid",
            ErrorCode::Plugin => "Error while processing request/data in data adapter",
        }
    }

    /// Numeric value of the code.
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    /// Whether the caller may retry the same operation and expect progress.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorCode::InProgress | ErrorCode::UserBuffer | ErrorCode::Timeout
        )
    }
}

/// Look up the message for a raw code; out-of-range values yield a generic string.
pub fn error_message(code: i32) -> &'static str {
    ErrorCode::from_repr(code)
        .map(ErrorCode::message)
        .unwrap_or(UNKNOWN_ERROR)
}
