//! ---
//! dbr_section: "02-tuple-space"
//! dbr_subsection: "module"
//! dbr_type: "source"
//! dbr_scope: "code"
//! dbr_description: "Asynchronous request tags and their completion state."
//! dbr_version: "v0.0.0-prealpha"
//! dbr_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use bytes::Bytes;
use dbr_common::ErrorCode;
use parking_lot::Mutex;
use tokio::task::AbortHandle;
use tracing::{debug, trace};

use crate::error::{DbrError, Result};

/// Handle to an in-flight asynchronous request. Values are never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tag(u64);

impl Tag {
    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tag-{}", self.0)
    }
}

/// Kind of request a tag was issued for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestKind {
    Put,
    Get,
    Read,
    /// Tuple submitted together with a server-side function reference.
    Eval { function: String },
}

impl RequestKind {
    pub fn name(&self) -> &'static str {
        match self {
            RequestKind::Put => "put",
            RequestKind::Get => "get",
            RequestKind::Read => "read",
            RequestKind::Eval { .. } => "eval",
        }
    }
}

/// Lifecycle of a tag. Terminal states are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TagState {
    Issued,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl TagState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TagState::Completed | TagState::Failed | TagState::Cancelled
        )
    }
}

/// Final outcome of a tagged request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Finished; carries the payload for get/read requests.
    Completed(Option<Bytes>),
    Failed(DbrError),
    Cancelled,
}

impl Resolution {
    pub fn state(&self) -> TagState {
        match self {
            Resolution::Completed(_) => TagState::Completed,
            Resolution::Failed(_) => TagState::Failed,
            Resolution::Cancelled => TagState::Cancelled,
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            Resolution::Completed(_) => ErrorCode::Success,
            Resolution::Failed(err) => err.code(),
            Resolution::Cancelled => ErrorCode::Cancelled,
        }
    }

    /// Collapse into a plain result, mapping cancellation onto CANCELLED.
    pub fn into_result(self) -> Result<Option<Bytes>> {
        match self {
            Resolution::Completed(payload) => Ok(payload),
            Resolution::Failed(err) => Err(err),
            Resolution::Cancelled => Err(DbrError::Cancelled),
        }
    }
}

/// Answer to a non-blocking `test`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagPoll {
    Pending(TagState),
    Resolved(Resolution),
}

impl TagPoll {
    pub fn state(&self) -> TagState {
        match self {
            TagPoll::Pending(state) => *state,
            TagPoll::Resolved(resolution) => resolution.state(),
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, TagPoll::Pending(_))
    }

    /// Result code as reported by `test`: INPROGRESS until resolved.
    pub fn code(&self) -> ErrorCode {
        match self {
            TagPoll::Pending(_) => ErrorCode::InProgress,
            TagPoll::Resolved(resolution) => resolution.code(),
        }
    }
}

#[derive(Debug)]
struct TagEntry {
    kind: RequestKind,
    state: TagState,
    resolution: Option<Resolution>,
    abort: Option<AbortHandle>,
    issued_at: Instant,
}

/// Owns the completion state of every uncollected tag.
#[derive(Debug)]
pub struct TagTracker {
    next: AtomicU64,
    capacity: usize,
    entries: Mutex<HashMap<Tag, TagEntry>>,
}

impl TagTracker {
    pub fn new(capacity: usize) -> Self {
        Self {
            next: AtomicU64::new(1),
            capacity: capacity.max(1),
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Allocate a fresh tag in the ISSUED state.
    pub fn issue(&self, kind: RequestKind) -> Result<Tag> {
        let mut entries = self.entries.lock();
        if entries.len() >= self.capacity {
            return Err(DbrError::TagsExhausted(entries.len()));
        }
        let tag = Tag(self.next.fetch_add(1, Ordering::Relaxed));
        trace!(%tag, kind = kind.name(), "tag issued");
        entries.insert(
            tag,
            TagEntry {
                kind,
                state: TagState::Issued,
                resolution: None,
                abort: None,
                issued_at: Instant::now(),
            },
        );
        Ok(tag)
    }

    /// Associate the task executing the request so cancellation can stop it.
    pub fn bind_task(&self, tag: Tag, abort: AbortHandle) {
        let mut entries = self.entries.lock();
        match entries.get_mut(&tag) {
            Some(entry) if !entry.state.is_terminal() => entry.abort = Some(abort),
            Some(entry) if entry.state == TagState::Cancelled => abort.abort(),
            _ => {}
        }
    }

    /// Move ISSUED to IN_PROGRESS. Returns false when the request must not run.
    pub fn begin(&self, tag: Tag) -> bool {
        let mut entries = self.entries.lock();
        match entries.get_mut(&tag) {
            Some(entry) if entry.state == TagState::Issued => {
                entry.state = TagState::InProgress;
                true
            }
            _ => false,
        }
    }

    /// Record the outcome. Returns false when the tag already reached a terminal state.
    pub fn resolve(&self, tag: Tag, outcome: Result<Option<Bytes>>) -> bool {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(&tag) else {
            return false;
        };
        if entry.state.is_terminal() {
            return false;
        }
        let resolution = match outcome {
            Ok(payload) => Resolution::Completed(payload),
            Err(DbrError::Cancelled) => Resolution::Cancelled,
            Err(err) => Resolution::Failed(err),
        };
        entry.state = resolution.state();
        entry.resolution = Some(resolution);
        entry.abort = None;
        debug!(
            %tag,
            kind = entry.kind.name(),
            state = ?entry.state,
            elapsed_ms = entry.issued_at.elapsed().as_millis() as u64,
            "tag resolved"
        );
        true
    }

    /// Report the current state without blocking.
    ///
    /// A terminal answer collects the tag; later calls fail with TAGERROR.
    pub fn test(&self, tag: Tag) -> Result<TagPoll> {
        let mut entries = self.entries.lock();
        let state = entries.get(&tag).map(|entry| entry.state);
        match state {
            None => Err(DbrError::Tag(tag)),
            Some(state) if !state.is_terminal() => Ok(TagPoll::Pending(state)),
            Some(_) => {
                let entry = entries.remove(&tag).ok_or(DbrError::Tag(tag))?;
                let resolution = entry.resolution.unwrap_or(Resolution::Cancelled);
                Ok(TagPoll::Resolved(resolution))
            }
        }
    }

    /// Request cancellation; returns the state the tag ends up in.
    pub fn cancel(&self, tag: Tag) -> Result<TagState> {
        let mut entries = self.entries.lock();
        let entry = entries.get_mut(&tag).ok_or(DbrError::Tag(tag))?;
        if entry.state.is_terminal() {
            return Ok(entry.state);
        }
        entry.state = TagState::Cancelled;
        entry.resolution = Some(Resolution::Cancelled);
        if let Some(abort) = entry.abort.take() {
            abort.abort();
        }
        debug!(%tag, kind = entry.kind.name(), "tag cancelled");
        Ok(TagState::Cancelled)
    }

    /// Current state without collecting.
    pub fn state(&self, tag: Tag) -> Option<TagState> {
        self.entries.lock().get(&tag).map(|entry| entry.state)
    }

    /// Number of tags issued and not yet collected.
    pub fn outstanding(&self) -> usize {
        self.entries.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_resolves_once() {
        let tracker = TagTracker::new(8);
        let tag = tracker.issue(RequestKind::Put).expect("tag");
        assert_eq!(tracker.test(tag).unwrap(), TagPoll::Pending(TagState::Issued));
        assert!(tracker.begin(tag));
        assert!(!tracker.begin(tag));
        assert_eq!(tracker.test(tag).unwrap().code(), ErrorCode::InProgress);

        assert!(tracker.resolve(tag, Ok(None)));
        assert!(!tracker.resolve(tag, Err(DbrError::Unavailable)));
        assert_eq!(
            tracker.test(tag).unwrap(),
            TagPoll::Resolved(Resolution::Completed(None))
        );
        assert_eq!(tracker.test(tag), Err(DbrError::Tag(tag)));
    }

    #[test]
    fn tags_are_never_reused() {
        let tracker = TagTracker::new(2);
        let first = tracker.issue(RequestKind::Get).unwrap();
        tracker.resolve(first, Ok(None));
        tracker.test(first).unwrap();
        let second = tracker.issue(RequestKind::Get).unwrap();
        assert!(second.value() > first.value());
    }

    #[test]
    fn capacity_limits_outstanding_tags() {
        let tracker = TagTracker::new(1);
        let tag = tracker.issue(RequestKind::Read).unwrap();
        let err = tracker.issue(RequestKind::Read).unwrap_err();
        assert_eq!(err.code(), ErrorCode::TagError);
        tracker.cancel(tag).unwrap();
        tracker.test(tag).unwrap();
        assert!(tracker.issue(RequestKind::Read).is_ok());
    }

    #[test]
    fn cancel_after_completion_reports_terminal_state() {
        let tracker = TagTracker::new(4);
        let tag = tracker.issue(RequestKind::Get).unwrap();
        tracker.begin(tag);
        tracker.resolve(tag, Ok(Some(Bytes::from_static(b"Hello"))));
        assert_eq!(tracker.cancel(tag).unwrap(), TagState::Completed);
        assert_eq!(
            tracker.test(tag).unwrap(),
            TagPoll::Resolved(Resolution::Completed(Some(Bytes::from_static(b"Hello"))))
        );
    }

    #[test]
    fn cancel_wins_over_late_completion() {
        let tracker = TagTracker::new(4);
        let tag = tracker.issue(RequestKind::Get).unwrap();
        tracker.begin(tag);
        assert_eq!(tracker.cancel(tag).unwrap(), TagState::Cancelled);
        assert!(!tracker.resolve(tag, Ok(Some(Bytes::from_static(b"late")))));
        assert_eq!(tracker.test(tag).unwrap().code(), ErrorCode::Cancelled);
    }

    #[test]
    fn unknown_tags_fail() {
        let tracker = TagTracker::new(4);
        let bogus = Tag(99);
        assert_eq!(tracker.cancel(bogus), Err(DbrError::Tag(bogus)));
        assert_eq!(tracker.test(bogus), Err(DbrError::Tag(bogus)));
    }
}
