use thiserror::Error;

use crate::key::{Key, VersionTag};
use crate::handle::Permission;

/// Misuse of the programming model that is detected at the call site.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum UsageError {
    #[error("Publication {key} @ {version} was fetched more than {n_readers} time(s)")]
    OverSubscribed {
        key: Key,
        version: VersionTag,
        n_readers: usize,
    },

    #[error("Publication {key} @ {version} already exists")]
    DuplicatePublication { key: Key, version: VersionTag },

    #[error("Key {0} already has a live initial access on this rank")]
    DuplicateKey(Key),

    #[error("Handle to {0} is not available in this scope, capture it in the task first")]
    NotCaptured(Key),

    #[error("Handle to {key} needs {requested} permission but the scope only holds {held}")]
    PermissionDenied {
        key: Key,
        requested: Permission,
        held: Permission,
    },

    #[error("Value of {0} is not available here, it belongs to deferred work")]
    ValueUnavailable(Key),

    #[error("Value of {0} was read before anything set it")]
    Uninitialized(Key),

    #[error("Value of {key} is not a {expected}")]
    TypeMismatch { key: Key, expected: &'static str },
}

/// Top-level error returned when driving a rank or a world.
#[derive(Debug, Error)]
pub enum NagareError {
    #[error(transparent)]
    Usage(#[from] UsageError),

    #[error("Task '{0}':\n{1}")]
    Task(String, anyhow::Error),

    #[error("Rank stalled with {pending} unfinished task(s):\n{report}")]
    Stalled { pending: usize, report: String },

    #[error("Failed to build worker pool")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    #[error("Rank {0} panicked")]
    RankPanicked(usize),

    #[error("Rank {0}:\n{1}")]
    Rank(usize, anyhow::Error),
}
