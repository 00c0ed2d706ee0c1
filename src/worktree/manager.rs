//! Per-job worktree orchestration.
//!
//! `setup()` hands a pipeline run a ready, locked working copy — reusing a
//! healthy one when the card has been here before, creating one otherwise.
//! The record and its lock are written in a single insert, so two concurrent
//! setups for the same card can never both claim the path: the loser sees
//! the winner's record and is told "busy".
//!
//! Degradation to non-isolated execution (isolation disabled, git too old,
//! concurrency cap) is reported through [`SetupOutcome::Fallback`], logged,
//! and broadcast — never silent.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing::{debug, info, warn};

use crate::config::{CleanupPolicy, WorktreeConfig};
use crate::events::EventBroadcaster;
use crate::git::{AddWorktreeOpts, GitGateway};
use crate::storage::{Storage, WorktreeRecordRow, WorktreeStatus};
use crate::worktree::branch::{self, same_path, BranchCoordinator, BranchState, EnsureOpts};
use crate::worktree::{paths, WorktreeError};

// ─── Types ───────────────────────────────────────────────────────────────────

/// Identity and context of a unit of work entering the pipeline.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub project_id: String,
    pub card_id: String,
    pub job_id: String,
    pub card_title: String,
    /// Issue-tracker provider the card came from ("github", "linear", …).
    pub provider: String,
    pub repo_path: PathBuf,
    /// Branch the worker branch is cut from (e.g. "main").
    pub base_branch: String,
}

/// Why isolation could not be used for this job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FallbackReason {
    IsolationDisabled,
    UnsupportedGitVersion,
    ConcurrencyCapReached { active: i64, max: usize },
}

impl std::fmt::Display for FallbackReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FallbackReason::IsolationDisabled => write!(f, "worktree isolation disabled"),
            FallbackReason::UnsupportedGitVersion => {
                write!(f, "installed git does not support worktrees")
            }
            FallbackReason::ConcurrencyCapReached { active, max } => {
                write!(f, "concurrency cap reached ({active}/{max} active worktrees)")
            }
        }
    }
}

/// Result of `setup()` — a tri-state, not an error: `Busy` and `Fallback`
/// are expected answers the caller routes on.
#[derive(Debug)]
pub enum SetupOutcome {
    Ready(ReadyWorktree),
    /// Another worker holds the card's worktree; the caller must not proceed.
    Busy { locked_by: String },
    /// Isolation unavailable; caller falls back to non-isolated execution.
    Fallback(FallbackReason),
}

/// A locked, verified working copy ready for the job.
#[derive(Debug)]
pub struct ReadyWorktree {
    pub record_id: String,
    pub path: PathBuf,
    pub branch: String,
    /// Commit the worker branch was cut from.
    pub base_ref: String,
    pub branch_state: BranchState,
    pub reused: bool,
}

/// Handle to the background lock-renewal task. Owned by the job that
/// started it and aborted on its teardown path — there is no process-wide
/// timer table.
pub struct RenewalHandle {
    task: tokio::task::JoinHandle<()>,
}

impl RenewalHandle {
    pub fn stop(self) {
        self.task.abort();
    }
}

impl Drop for RenewalHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

// ─── Manager ─────────────────────────────────────────────────────────────────

pub struct WorktreeLifecycleManager {
    storage: Arc<Storage>,
    gateway: Arc<GitGateway>,
    branches: BranchCoordinator,
    broadcaster: Arc<EventBroadcaster>,
    config: WorktreeConfig,
    /// Opaque worker identity used as lock holder.
    worker_id: String,
}

impl WorktreeLifecycleManager {
    pub fn new(
        storage: Arc<Storage>,
        gateway: Arc<GitGateway>,
        broadcaster: Arc<EventBroadcaster>,
        config: WorktreeConfig,
        worker_id: String,
    ) -> Self {
        let branches = BranchCoordinator::new(gateway.clone());
        Self {
            storage,
            gateway,
            branches,
            broadcaster,
            config,
            worker_id,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn config(&self) -> &WorktreeConfig {
        &self.config
    }

    // ─── Setup ───────────────────────────────────────────────────────────────

    /// Produce a ready working copy for the job, or say why not.
    pub async fn setup(&self, job: &JobContext) -> Result<SetupOutcome, WorktreeError> {
        if !self.config.enabled {
            return Ok(self.fallback(job, FallbackReason::IsolationDisabled));
        }
        if !self.gateway.supports_worktrees().await {
            return Ok(self.fallback(job, FallbackReason::UnsupportedGitVersion));
        }

        let branch = branch::branch_name(
            &self.config.branch_prefix,
            &job.provider,
            &job.card_id,
            &job.card_title,
        );

        // A record for this card, or for the branch the card maps to.
        let existing = match self
            .storage
            .find_active_for_card(&job.project_id, &job.card_id)
            .await?
        {
            Some(rec) => Some(rec),
            None => {
                let by_branch = self
                    .storage
                    .find_active_for_branch(&job.project_id, &branch)
                    .await?;
                if let Some(rec) = by_branch {
                    if rec.card_id != job.card_id {
                        // Branch collision across cards — exactly one live
                        // record may own a branch name.
                        return Ok(SetupOutcome::Busy {
                            locked_by: rec
                                .locked_by
                                .unwrap_or_else(|| format!("card {}", rec.card_id)),
                        });
                    }
                    Some(rec)
                } else {
                    None
                }
            }
        };

        if let Some(rec) = existing {
            match self.try_reuse(job, rec, &branch).await? {
                Some(outcome) => return Ok(outcome),
                // Unhealthy record was retired; fall through to recreate.
                None => {}
            }
        }

        // Cap applies to net-new worktrees only — reuse never re-counts.
        if self.config.max_per_project > 0 {
            let active = self.storage.count_active(&job.project_id).await?;
            if active >= self.config.max_per_project as i64 {
                return Ok(self.fallback(
                    job,
                    FallbackReason::ConcurrencyCapReached {
                        active,
                        max: self.config.max_per_project,
                    },
                ));
            }
        }

        self.create(job, &branch).await
    }

    /// Reuse path: verify health, take the lock, refresh the branch.
    ///
    /// `Ok(None)` means the record was unhealthy and has been retired.
    async fn try_reuse(
        &self,
        job: &JobContext,
        rec: WorktreeRecordRow,
        branch: &str,
    ) -> Result<Option<SetupOutcome>, WorktreeError> {
        // Healthy means: on disk, listed by git, and still on the branch the
        // card derives to.
        let healthy = rec.branch_name == branch && self.verify_health(&rec).await;
        if !healthy {
            warn!(
                record_id = %rec.id,
                path = %rec.worktree_path,
                "existing worktree failed health check — retiring record"
            );
            self.storage
                .set_error(&rec.id, "failed health check: missing or mismatched on disk")
                .await?;
            self.notify_status(&rec.id, &job.card_id, WorktreeStatus::Error);
            return Ok(None);
        }

        let acquired = self
            .storage
            .try_acquire_lock(&rec.id, &self.worker_id, self.config.lock_ttl_secs)
            .await?;
        if !acquired {
            let holder = self
                .storage
                .get_worktree(&rec.id)
                .await?
                .and_then(|r| r.locked_by)
                .unwrap_or_else(|| "unknown".to_string());
            info!(record_id = %rec.id, locked_by = %holder, "worktree locked by another worker");
            return Ok(Some(SetupOutcome::Busy { locked_by: holder }));
        }

        let wt_path = PathBuf::from(&rec.worktree_path);
        let branch_state = match self
            .branches
            .ensure(
                &wt_path,
                branch,
                &job.base_branch,
                EnsureOpts {
                    fetch_first: true,
                    force: false,
                },
            )
            .await
        {
            Ok(state) => state,
            Err(WorktreeError::LockContention { locked_by }) => {
                self.storage.release_lock(&rec.id, &self.worker_id).await?;
                return Ok(Some(SetupOutcome::Busy { locked_by }));
            }
            Err(e) => {
                self.storage.release_lock(&rec.id, &self.worker_id).await?;
                self.storage.set_error(&rec.id, &e.to_string()).await?;
                self.notify_status(&rec.id, &job.card_id, WorktreeStatus::Error);
                return Err(e);
            }
        };

        self.storage
            .set_status(&rec.id, WorktreeStatus::Running)
            .await?;
        self.notify_status(&rec.id, &job.card_id, WorktreeStatus::Running);
        info!(record_id = %rec.id, branch, "reusing existing worktree");

        Ok(Some(SetupOutcome::Ready(ReadyWorktree {
            record_id: rec.id,
            path: wt_path,
            branch: branch.to_string(),
            base_ref: rec.base_ref,
            branch_state,
            reused: true,
        })))
    }

    /// Create path: record-with-lock first (claims path + branch atomically),
    /// then the on-disk worktree, then verification.
    async fn create(&self, job: &JobContext, branch: &str) -> Result<SetupOutcome, WorktreeError> {
        let root = paths::compute_root(
            &self.config.root_mode,
            self.config.custom_root.as_deref(),
            &job.repo_path,
        );
        let dir_name = branch
            .rsplit('/')
            .next()
            .unwrap_or(branch)
            .to_string();
        let wt_path = root.join(&dir_name);

        if !paths::is_allowed(&wt_path, &root, &job.repo_path) {
            return Err(WorktreeError::PolicyViolation {
                path: wt_path,
                reason: "candidate escapes the managed worktree root".to_string(),
            });
        }

        // Fatal when the base cannot be resolved — no safe default exists.
        let (base_ref_name, base_sha) = self
            .branches
            .resolve_base(&job.repo_path, &job.base_branch)
            .await?;

        let rec = match self
            .storage
            .create_worktree_record(
                &job.project_id,
                &job.card_id,
                Some(&job.job_id),
                &job.repo_path.to_string_lossy(),
                &wt_path.to_string_lossy(),
                branch,
                &base_sha,
                &self.worker_id,
                self.config.lock_ttl_secs,
            )
            .await
        {
            Ok(rec) => rec,
            Err(e) => {
                // Unique-index loss: a concurrent setup claimed the branch or
                // path between our lookup and insert.
                if let Some(other) = self
                    .storage
                    .find_active_for_branch(&job.project_id, branch)
                    .await?
                {
                    return Ok(SetupOutcome::Busy {
                        locked_by: other.locked_by.unwrap_or_else(|| "unknown".to_string()),
                    });
                }
                return Err(WorktreeError::Storage(e));
            }
        };
        self.notify_status(&rec.id, &job.card_id, WorktreeStatus::Creating);

        match self
            .materialize(job, &rec, branch, &base_ref_name, &wt_path)
            .await
        {
            Ok(branch_state) => {
                self.storage
                    .set_status(&rec.id, WorktreeStatus::Running)
                    .await?;
                self.notify_status(&rec.id, &job.card_id, WorktreeStatus::Running);
                info!(record_id = %rec.id, branch, path = %wt_path.display(), "worktree created");
                Ok(SetupOutcome::Ready(ReadyWorktree {
                    record_id: rec.id,
                    path: wt_path,
                    branch: branch.to_string(),
                    base_ref: base_sha,
                    branch_state,
                    reused: false,
                }))
            }
            Err(WorktreeError::LockContention { locked_by }) => {
                self.storage
                    .set_error(&rec.id, &format!("branch held by {locked_by}"))
                    .await?;
                self.notify_status(&rec.id, &job.card_id, WorktreeStatus::Error);
                Ok(SetupOutcome::Busy { locked_by })
            }
            Err(e) => {
                self.storage.set_error(&rec.id, &e.to_string()).await?;
                self.notify_status(&rec.id, &job.card_id, WorktreeStatus::Error);
                Err(e)
            }
        }
    }

    /// Run the actual `git worktree add` for a fresh record and verify it.
    async fn materialize(
        &self,
        job: &JobContext,
        rec: &WorktreeRecordRow,
        branch: &str,
        base_ref_name: &str,
        wt_path: &Path,
    ) -> Result<BranchState, WorktreeError> {
        if let Some(parent) = wt_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| WorktreeError::VerificationFailed(format!("create root: {e}")))?;
        }

        // Stale bookkeeping from a crashed worktree would make git refuse to
        // reuse its branch; prune first.
        if let Err(e) = self.gateway.prune_worktrees(&job.repo_path).await {
            debug!(err = %e, "worktree prune before add failed");
        }

        let mut state = BranchState {
            worker_branch: Some(branch.to_string()),
            base_branch: Some(job.base_branch.clone()),
            base_head_sha: Some(rec.base_ref.clone()),
            ..Default::default()
        };
        state.starting_branch = self.gateway.current_branch(&job.repo_path).await.ok();

        if self
            .gateway
            .branch_exists_local(&job.repo_path, branch)
            .await?
        {
            self.branches
                .check_not_held_elsewhere(&job.repo_path, branch, false)
                .await?;
            self.gateway
                .add_worktree(&job.repo_path, wt_path, branch, None, AddWorktreeOpts::default())
                .await?;
        } else if self
            .gateway
            .branch_exists_remote(&job.repo_path, branch)
            .await?
        {
            self.gateway
                .add_worktree(
                    &job.repo_path,
                    wt_path,
                    branch,
                    Some(&format!("origin/{branch}")),
                    AddWorktreeOpts {
                        new_branch: true,
                        track: true,
                    },
                )
                .await?;
        } else {
            self.gateway
                .add_worktree(
                    &job.repo_path,
                    wt_path,
                    branch,
                    Some(base_ref_name),
                    AddWorktreeOpts {
                        new_branch: true,
                        track: false,
                    },
                )
                .await?;
        }

        if !self.verify_health(rec).await {
            return Err(WorktreeError::VerificationFailed(format!(
                "worktree at {} not present or unhealthy after add",
                wt_path.display()
            )));
        }
        Ok(state)
    }

    /// Disk-reality check: the path exists, git lists it, it is not
    /// prunable, and (when not detached) it has the recorded branch.
    async fn verify_health(&self, rec: &WorktreeRecordRow) -> bool {
        let wt_path = PathBuf::from(&rec.worktree_path);
        if !wt_path.exists() {
            return false;
        }
        let repo = PathBuf::from(&rec.repo_path);
        let entries = match self.gateway.list_worktrees(&repo).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(err = %e, "could not list worktrees for health check");
                return false;
            }
        };
        entries.iter().any(|e| {
            same_path(&e.path, &wt_path)
                && !e.prunable
                && (e.detached || e.branch.as_deref() == Some(rec.branch_name.as_str()))
        })
    }

    // ─── Lock renewal ────────────────────────────────────────────────────────

    /// Keep the lock alive while the job runs. Renews at half the TTL so a
    /// live job is never mistaken for a crashed one. The handle must be
    /// stopped (or dropped) as soon as the job finishes, fails, or cancels.
    pub fn start_lock_renewal(&self, record_id: &str) -> RenewalHandle {
        let storage = self.storage.clone();
        let record_id = record_id.to_string();
        let worker = self.worker_id.clone();
        let ttl = self.config.lock_ttl_secs;
        let period = Duration::from_secs((ttl / 2).max(1));

        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick fires immediately; skip it.
            interval.tick().await;
            loop {
                interval.tick().await;
                match storage.renew_lock(&record_id, &worker, ttl).await {
                    Ok(true) => debug!(record_id = %record_id, "lock renewed"),
                    Ok(false) => {
                        warn!(record_id = %record_id, "lock no longer held — stopping renewal");
                        break;
                    }
                    Err(e) => {
                        // Transient storage trouble: keep trying until the
                        // TTL verdict is definitive.
                        warn!(record_id = %record_id, err = %e, "lock renewal failed");
                    }
                }
            }
        });
        RenewalHandle { task }
    }

    // ─── Cleanup & cancellation ──────────────────────────────────────────────

    /// Apply the configured cleanup policy for a finished job.
    ///
    /// The lock is released first, unconditionally — a worktree must never
    /// stay locked after its job ended, whatever the policy does next.
    pub async fn cleanup(&self, record_id: &str, success: bool) -> Result<(), WorktreeError> {
        let rec = self
            .storage
            .get_worktree(record_id)
            .await?
            .ok_or_else(|| WorktreeError::NotFound(format!("worktree record {record_id}")))?;

        self.storage.release_lock(record_id, &self.worker_id).await?;

        let policy = self.config.cleanup_for(success);
        match policy {
            CleanupPolicy::Immediate => {
                self.remove_on_disk(&rec).await?;
                self.storage
                    .set_status(record_id, WorktreeStatus::Cleaned)
                    .await?;
                self.notify_status(record_id, &rec.card_id, WorktreeStatus::Cleaned);
                info!(record_id, "worktree removed");
            }
            CleanupPolicy::Delay => {
                self.storage
                    .set_status(record_id, WorktreeStatus::CleanupPending)
                    .await?;
                self.notify_status(record_id, &rec.card_id, WorktreeStatus::CleanupPending);
                debug!(record_id, "worktree queued for delayed cleanup");
            }
            CleanupPolicy::Never => {
                self.storage
                    .set_status(record_id, WorktreeStatus::Ready)
                    .await?;
                self.notify_status(record_id, &rec.card_id, WorktreeStatus::Ready);
                debug!(record_id, "worktree kept for manual reuse");
            }
        }
        Ok(())
    }

    /// Park a worktree while its run waits on approval: release the lock and
    /// mark `ready` so a resumed run (possibly another worker) can reclaim it
    /// through the normal reuse path.
    pub async fn park(&self, record_id: &str) -> Result<(), WorktreeError> {
        let rec = self
            .storage
            .get_worktree(record_id)
            .await?
            .ok_or_else(|| WorktreeError::NotFound(format!("worktree record {record_id}")))?;
        self.storage.release_lock(record_id, &self.worker_id).await?;
        self.storage
            .set_status(record_id, WorktreeStatus::Ready)
            .await?;
        self.notify_status(record_id, &rec.card_id, WorktreeStatus::Ready);
        debug!(record_id, "worktree parked pending approval");
        Ok(())
    }

    /// Physically remove a worktree, path-policy-checked and recorded.
    pub(crate) async fn remove_on_disk(&self, rec: &WorktreeRecordRow) -> Result<(), WorktreeError> {
        let repo = PathBuf::from(&rec.repo_path);
        let wt_path = PathBuf::from(&rec.worktree_path);
        let root = paths::compute_root(
            &self.config.root_mode,
            self.config.custom_root.as_deref(),
            &repo,
        );
        if !paths::is_allowed(&wt_path, &root, &repo) {
            return Err(WorktreeError::PolicyViolation {
                path: wt_path,
                reason: "refusing to remove a path outside the managed root".to_string(),
            });
        }
        match self.gateway.remove_worktree(&repo, &wt_path, true).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.storage.set_error(&rec.id, &e.to_string()).await?;
                Err(WorktreeError::Git(e))
            }
        }
    }

    /// Cancellation teardown. All four steps run even if earlier ones fail:
    /// stop renewal → optional branch rollback → release lock → failure-path
    /// cleanup. A still-locked abandoned worktree is the one outcome this
    /// must never produce.
    pub async fn cancel(
        &self,
        ready: &ReadyWorktree,
        renewal: Option<RenewalHandle>,
    ) -> Result<(), WorktreeError> {
        if let Some(handle) = renewal {
            handle.stop();
        }

        if self.config.rollback_on_cancel {
            let report = self
                .branches
                .rollback(&ready.path, &ready.branch_state)
                .await;
            if !report.fully_clean() {
                warn!(
                    record_id = %ready.record_id,
                    failures = ?report.failures,
                    "rollback completed with failures"
                );
            }
        }

        if let Err(e) = self
            .storage
            .release_lock(&ready.record_id, &self.worker_id)
            .await
        {
            warn!(record_id = %ready.record_id, err = %e, "lock release failed during cancel");
        }

        self.cleanup(&ready.record_id, false).await?;

        // The worker branch cannot be deleted while its worktree holds it;
        // finish the rollback once the worktree is gone.
        if self.config.rollback_on_cancel {
            let state = &ready.branch_state;
            if let Some(worker) = state.worker_branch.as_deref() {
                if state.starting_branch.as_deref() != Some(worker) {
                    if let Some(rec) = self.storage.get_worktree(&ready.record_id).await? {
                        let repo = PathBuf::from(&rec.repo_path);
                        if let Err(e) = self.gateway.delete_branch(&repo, worker, true).await {
                            debug!(worker, err = %e, "worker branch kept after cancel");
                        }
                    }
                }
            }
        }
        Ok(())
    }

    // ─── Helpers ─────────────────────────────────────────────────────────────

    fn fallback(&self, job: &JobContext, reason: FallbackReason) -> SetupOutcome {
        warn!(card_id = %job.card_id, %reason, "falling back to non-isolated execution");
        self.broadcaster.broadcast(
            "job.fallback",
            json!({
                "card_id": job.card_id,
                "project_id": job.project_id,
                "reason": reason.to_string(),
            }),
        );
        SetupOutcome::Fallback(reason)
    }

    fn notify_status(&self, record_id: &str, card_id: &str, status: WorktreeStatus) {
        self.broadcaster.broadcast(
            "worktree.status_changed",
            json!({
                "record_id": record_id,
                "card_id": card_id,
                "status": status.as_str(),
            }),
        );
    }
}
