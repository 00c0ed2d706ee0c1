//! Worktree lifecycle: path policy, branch coordination, per-job
//! orchestration, and crash-recovery reconciliation.
//!
//! Every code-modifying job gets its own git worktree on its own branch,
//! guarded by a time-bounded lock in the record store. A job that stops
//! renewing its lock is considered crashed; the reconciler reclaims its
//! worktree after the TTL passes. That TTL is the crash detector — there is
//! no other liveness channel.

pub mod branch;
pub mod manager;
pub mod paths;
pub mod reconcile;

use std::path::PathBuf;

pub use branch::{BranchCoordinator, BranchState, RollbackReport};
pub use manager::{
    FallbackReason, JobContext, ReadyWorktree, RenewalHandle, SetupOutcome,
    WorktreeLifecycleManager,
};
pub use reconcile::{ReconcileReport, Reconciler};

use crate::git::GitError;

/// Failure taxonomy for worktree operations.
///
/// `PolicyViolation` and `NotFound` are fatal to the operation and never
/// retried automatically. `LockContention` is reported — the caller decides
/// whether to skip, retry, or fall back to non-isolated execution.
#[derive(Debug, thiserror::Error)]
pub enum WorktreeError {
    #[error("unsafe worktree path {path}: {reason}")]
    PolicyViolation { path: PathBuf, reason: String },
    #[error("resource is busy: held by {locked_by}")]
    LockContention { locked_by: String },
    #[error(transparent)]
    Git(#[from] GitError),
    #[error("{0} not found")]
    NotFound(String),
    #[error("worktree verification failed: {0}")]
    VerificationFailed(String),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}
