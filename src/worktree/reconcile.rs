//! Crash-recovery reconciliation.
//!
//! A single sweep that diffs persisted records against what git reports on
//! disk, then repairs the difference: orphaned records, expired locks,
//! pending cleanups, and git's own stale bookkeeping. Safe to run
//! repeatedly and alongside live jobs — healthy `running`/`creating`
//! records with live locks are never touched. One bad record never blunts
//! the cleanup of the rest.

use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::config::WorktreeConfig;
use crate::events::EventBroadcaster;
use crate::git::GitGateway;
use crate::storage::{Storage, WorktreeStatus};
use crate::worktree::branch::same_path;
use crate::worktree::{paths, WorktreeError};

/// Tally of one reconcile pass. With no divergence to repair, every counter
/// is zero — running the pass twice in a row yields an empty second report.
#[derive(Debug, Default, Serialize)]
pub struct ReconcileReport {
    /// Records whose worktree vanished from disk (marked `error`).
    pub orphaned: u32,
    /// On-disk entries under the managed root with no record. Reported only
    /// — deciding their fate is a human's job.
    pub untracked: Vec<String>,
    /// Expired locks released (records moved to `cleanup_pending`).
    pub expired_locks: u32,
    /// `cleanup_pending` worktrees physically removed.
    pub cleaned: u32,
    /// Individual failures encountered while sweeping (the pass continues).
    pub errors: u32,
}

impl ReconcileReport {
    pub fn is_empty(&self) -> bool {
        self.orphaned == 0
            && self.untracked.is_empty()
            && self.expired_locks == 0
            && self.cleaned == 0
            && self.errors == 0
    }
}

pub struct Reconciler {
    storage: Arc<Storage>,
    gateway: Arc<GitGateway>,
    broadcaster: Arc<EventBroadcaster>,
    config: WorktreeConfig,
}

impl Reconciler {
    pub fn new(
        storage: Arc<Storage>,
        gateway: Arc<GitGateway>,
        broadcaster: Arc<EventBroadcaster>,
        config: WorktreeConfig,
    ) -> Self {
        Self {
            storage,
            gateway,
            broadcaster,
            config,
        }
    }

    /// One reconcile pass for a project.
    ///
    /// Only two things are fatal: failing to read the record store and
    /// failing to list worktrees on disk. Everything past that is tallied
    /// and the sweep continues.
    pub async fn run(
        &self,
        project_id: &str,
        repo_path: &std::path::Path,
    ) -> Result<ReconcileReport, WorktreeError> {
        let mut report = ReconcileReport::default();

        let entries = self.gateway.list_worktrees(repo_path).await?;
        let records = self.storage.list_active(project_id).await?;

        // 1. Orphans: a non-terminal record with no live on-disk entry means
        //    a crash mid-operation. Mark it; never try to remove a path that
        //    is not there.
        for rec in &records {
            let wt_path = PathBuf::from(&rec.worktree_path);
            let on_disk = wt_path.exists()
                && entries
                    .iter()
                    .any(|e| same_path(&e.path, &wt_path) && !e.prunable);
            if !on_disk {
                warn!(
                    record_id = %rec.id,
                    path = %rec.worktree_path,
                    status = %rec.status,
                    "worktree missing from disk — marking record as error"
                );
                self.storage
                    .set_error(&rec.id, "missing from disk — likely crashed mid-operation")
                    .await?;
                report.orphaned += 1;
            }
        }

        // 2. Untracked: entries under the managed root that no record claims.
        let root = paths::compute_root(
            &self.config.root_mode,
            self.config.custom_root.as_deref(),
            repo_path,
        );
        for entry in &entries {
            if !entry.path.starts_with(&root) {
                continue;
            }
            let tracked = records
                .iter()
                .any(|r| same_path(&PathBuf::from(&r.worktree_path), &entry.path));
            if !tracked {
                debug!(path = %entry.path.display(), "untracked worktree under managed root");
                report.untracked.push(entry.path.display().to_string());
            }
        }

        // 3. Expired locks: the crash detector. Release and queue for
        //    cleanup. (Re-queried so records retired in step 1 are skipped.)
        for rec in self.storage.list_expired_locks(project_id).await? {
            info!(
                record_id = %rec.id,
                locked_by = ?rec.locked_by,
                "lock expired — releasing and queueing cleanup"
            );
            self.storage.force_release_lock(&rec.id).await?;
            self.storage
                .set_status(&rec.id, WorktreeStatus::CleanupPending)
                .await?;
            report.expired_locks += 1;
        }

        // 4. Pending cleanups, one at a time; a failure moves to the next.
        for rec in self
            .storage
            .list_by_status(project_id, WorktreeStatus::CleanupPending)
            .await?
        {
            let wt_path = PathBuf::from(&rec.worktree_path);
            if !wt_path.exists() {
                // Directory already gone; the final prune fixes git's books.
                self.storage
                    .set_status(&rec.id, WorktreeStatus::Cleaned)
                    .await?;
                report.cleaned += 1;
                continue;
            }
            if !paths::is_allowed(&wt_path, &root, repo_path) {
                self.storage
                    .set_error(&rec.id, "refusing cleanup: path outside the managed root")
                    .await?;
                report.errors += 1;
                continue;
            }
            match self.gateway.remove_worktree(repo_path, &wt_path, true).await {
                Ok(()) => {
                    self.storage
                        .set_status(&rec.id, WorktreeStatus::Cleaned)
                        .await?;
                    report.cleaned += 1;
                }
                Err(e) => {
                    warn!(record_id = %rec.id, err = %e, "cleanup failed — continuing sweep");
                    self.storage.set_error(&rec.id, &e.to_string()).await?;
                    report.errors += 1;
                }
            }
        }

        // 5. Let git reconcile its own bookkeeping. Never fatal.
        if let Err(e) = self.gateway.prune_worktrees(repo_path).await {
            warn!(err = %e, "worktree prune failed");
        }

        if !report.is_empty() {
            info!(
                orphaned = report.orphaned,
                untracked = report.untracked.len(),
                expired_locks = report.expired_locks,
                cleaned = report.cleaned,
                errors = report.errors,
                "reconcile pass repaired divergence"
            );
            self.broadcaster.broadcast(
                "worktree.reconciled",
                json!({
                    "project_id": project_id,
                    "orphaned": report.orphaned,
                    "untracked": report.untracked,
                    "expired_locks": report.expired_locks,
                    "cleaned": report.cleaned,
                    "errors": report.errors,
                }),
            );
        }

        Ok(report)
    }
}
