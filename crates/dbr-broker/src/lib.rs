//! ---
//! dbr_section: "02-tuple-space"
//! dbr_subsection: "module"
//! dbr_type: "source"
//! dbr_scope: "code"
//! dbr_description: "Tuple-space protocol: namespaces, groups, tuples, and request tags."
//! dbr_version: "v0.0.0-prealpha"
//! dbr_owner: "tbd"
//! ---
//! Clients work through [`DataBroker`]: namespaces are created or attached to
//! obtain handles, tuples are stored and retrieved by exact name or wildcard
//! template, and asynchronous variants return [`Tag`]s resolved with
//! [`DataBroker::test`] or [`DataBroker::cancel`].

pub mod backend;
pub mod broker;
pub mod error;
pub mod matching;
pub mod snapshot;
pub mod tag;
pub mod types;

pub use backend::{
    Backend, ClusterControl, FetchMode, FetchedTuple, MemoryBackend, MemoryLimits, NamespaceOps,
    TupleOps,
};
pub use broker::DataBroker;
pub use dbr_common::ErrorCode;
pub use error::{DbrError, Result};
pub use matching::MatchTemplate;
pub use snapshot::{NamespaceImage, TupleImage};
pub use tag::{RequestKind, Resolution, Tag, TagPoll, TagState, TagTracker};
pub use types::{
    Capabilities, ClusterStatus, Directory, Group, NamespaceHandle, NamespaceId, NamespaceInfo,
    NamespaceState, OpFlags, PersistenceLevel, TupleSelector,
};
