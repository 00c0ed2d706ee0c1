//! Branch naming, preparation, and rollback.
//!
//! Branch names are derived deterministically from card identity so a card
//! always maps to the same branch across runs. Preparation follows a strict
//! decision tree (local branch → remote-tracking branch → new from base) and
//! never force-updates a dirty tree — correctness over freshness. Rollback
//! is best-effort multi-step: each step logs-and-continues, since a partial
//! rollback is better than none.

use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::git::GitGateway;
use crate::worktree::WorktreeError;

const MAX_SLUG_LEN: usize = 48;

/// Deterministic, filesystem-and-git-safe branch name for a card.
///
/// `patchwork/add-login-page` for card title "Add login page". Falls back to
/// `<provider>-<external_id>` when the title yields an empty slug.
pub fn branch_name(prefix: &str, provider: &str, external_id: &str, title: &str) -> String {
    let mut s = slug(title);
    if s.is_empty() {
        s = slug(&format!("{provider}-{external_id}"));
    }
    format!("{prefix}/{s}")
}

/// Lowercase alphanumeric with single dashes, bounded length, no leading or
/// trailing dash.
pub fn slug(input: &str) -> String {
    let mut out = String::with_capacity(input.len().min(MAX_SLUG_LEN));
    let mut last_dash = true;
    for c in input.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
        if out.len() >= MAX_SLUG_LEN {
            break;
        }
    }
    while out.ends_with('-') {
        out.pop();
    }
    out
}

/// Per-run branch bookkeeping, captured at setup time to support rollback.
/// Scoped to one pipeline run and discarded with it.
#[derive(Debug, Clone, Default)]
pub struct BranchState {
    pub starting_branch: Option<String>,
    pub base_branch: Option<String>,
    pub base_head_sha: Option<String>,
    pub worker_branch: Option<String>,
}

/// Options for [`BranchCoordinator::ensure`].
#[derive(Debug, Clone, Copy, Default)]
pub struct EnsureOpts {
    /// Fetch from origin before deciding (failure downgrades to a warning).
    pub fetch_first: bool,
    /// Proceed even when the branch is checked out in another worktree.
    pub force: bool,
}

/// Outcome of a rollback attempt. Steps are independent; one failing does
/// not stop the rest.
#[derive(Debug, Default)]
pub struct RollbackReport {
    pub reset_ok: bool,
    pub checkout_ok: bool,
    /// `None` when no branch deletion was needed.
    pub branch_deleted: Option<bool>,
    pub failures: Vec<String>,
}

impl RollbackReport {
    pub fn fully_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Decides how a card's branch comes into existence and how it is unwound.
pub struct BranchCoordinator {
    gateway: Arc<GitGateway>,
}

impl BranchCoordinator {
    pub fn new(gateway: Arc<GitGateway>) -> Self {
        Self { gateway }
    }

    /// Make `branch` the checked-out branch at `path`.
    ///
    /// Decision tree:
    /// 1. local branch exists → conflict check, checkout, fast-forward if the
    ///    tree is clean;
    /// 2. remote-tracking branch exists → create a local tracking branch,
    ///    same conflict check;
    /// 3. neither → create a new branch from `origin/<base>` or local
    ///    `<base>`, failing with `NotFound` when neither resolves.
    pub async fn ensure(
        &self,
        path: &Path,
        branch: &str,
        base_branch: &str,
        opts: EnsureOpts,
    ) -> Result<BranchState, WorktreeError> {
        let mut state = BranchState {
            worker_branch: Some(branch.to_string()),
            base_branch: Some(base_branch.to_string()),
            ..Default::default()
        };
        state.starting_branch = self.gateway.current_branch(path).await.ok();

        if opts.fetch_first {
            if let Err(e) = self.gateway.fetch(path, "origin").await {
                warn!(err = %e, "fetch failed — continuing with stale refs");
            }
        }

        if self.gateway.branch_exists_local(path, branch).await? {
            self.check_not_held_elsewhere(path, branch, opts.force).await?;
            self.gateway.checkout(path, branch).await?;
            self.update_from_upstream(path, branch).await;
        } else if self.gateway.branch_exists_remote(path, branch).await? {
            self.check_not_held_elsewhere(path, branch, opts.force).await?;
            self.gateway
                .create_branch(path, branch, Some(&format!("origin/{branch}")), true)
                .await?;
            self.gateway.checkout(path, branch).await?;
        } else {
            let (base_ref, base_sha) = self.resolve_base(path, base_branch).await?;
            self.gateway
                .create_branch(path, branch, Some(&base_ref), false)
                .await?;
            self.gateway.checkout(path, branch).await?;
            state.base_head_sha = Some(base_sha);
            info!(branch, base = %base_ref, "created worker branch");
        }

        if state.base_head_sha.is_none() {
            state.base_head_sha = self.gateway.head_sha(path).await.ok();
        }
        Ok(state)
    }

    /// Prefer `origin/<base>`, fall back to local `<base>`.
    pub async fn resolve_base(
        &self,
        path: &Path,
        base_branch: &str,
    ) -> Result<(String, String), WorktreeError> {
        let remote_ref = format!("origin/{base_branch}");
        if let Some(sha) = self.gateway.rev_parse(path, &remote_ref).await? {
            return Ok((remote_ref, sha));
        }
        if let Some(sha) = self.gateway.rev_parse(path, base_branch).await? {
            return Ok((base_branch.to_string(), sha));
        }
        Err(WorktreeError::NotFound(format!("base branch {base_branch}")))
    }

    /// Fail when another worktree has the branch checked out.
    pub async fn check_not_held_elsewhere(
        &self,
        path: &Path,
        branch: &str,
        force: bool,
    ) -> Result<(), WorktreeError> {
        let entries = self.gateway.list_worktrees(path).await?;
        for entry in entries {
            if entry.branch.as_deref() == Some(branch) && !same_path(&entry.path, path) {
                if force {
                    warn!(branch, holder = %entry.path.display(), "branch held elsewhere — forced");
                    return Ok(());
                }
                return Err(WorktreeError::LockContention {
                    locked_by: entry.path.display().to_string(),
                });
            }
        }
        Ok(())
    }

    /// Fast-forward from upstream, but only when the tree is clean.
    /// Every failure here downgrades to a warning — the run continues with
    /// stale local state.
    async fn update_from_upstream(&self, path: &Path, branch: &str) {
        match self.gateway.is_clean(path).await {
            Ok(true) => {
                if let Err(e) = self.gateway.fast_forward(path).await {
                    debug!(branch, err = %e, "no fast-forward from upstream");
                }
            }
            Ok(false) => {
                debug!(branch, "tree has uncommitted changes — skipping update");
            }
            Err(e) => warn!(branch, err = %e, "could not check tree state"),
        }
    }

    /// Unwind a cancelled run: hard-reset to the recorded base, return to the
    /// starting branch, delete the worker branch. Each step is attempted even
    /// when an earlier one fails.
    pub async fn rollback(&self, path: &Path, state: &BranchState) -> RollbackReport {
        let mut report = RollbackReport::default();

        match self
            .gateway
            .reset_hard(path, state.base_head_sha.as_deref())
            .await
        {
            Ok(()) => report.reset_ok = true,
            Err(e) => {
                warn!(err = %e, "rollback: reset failed — continuing");
                report.failures.push(format!("reset: {e}"));
            }
        }

        if let Some(starting) = state.starting_branch.as_deref() {
            match self.gateway.checkout(path, starting).await {
                Ok(()) => report.checkout_ok = true,
                Err(e) => {
                    warn!(starting, err = %e, "rollback: checkout of starting branch failed");
                    report.failures.push(format!("checkout {starting}: {e}"));
                }
            }
        } else {
            // Nothing recorded to return to; the reset is the whole rollback.
            report.checkout_ok = true;
        }

        if let (Some(worker), starting) = (
            state.worker_branch.as_deref(),
            state.starting_branch.as_deref(),
        ) {
            if Some(worker) != starting {
                match self.gateway.delete_branch(path, worker, true).await {
                    Ok(()) => report.branch_deleted = Some(true),
                    Err(e) => {
                        warn!(worker, err = %e, "rollback: branch delete failed");
                        report.branch_deleted = Some(false);
                        report.failures.push(format!("delete {worker}: {e}"));
                    }
                }
            }
        }

        report
    }
}

/// Normalized path equality helper for worktree entries (macOS private
/// symlinks and trailing slashes make naive equality flaky).
pub fn same_path(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slug_basic() {
        assert_eq!(slug("Add login page"), "add-login-page");
    }

    #[test]
    fn test_slug_collapses_punctuation() {
        assert_eq!(slug("Fix: (auth) -- token refresh!"), "fix-auth-token-refresh");
    }

    #[test]
    fn test_slug_bounded_and_trimmed() {
        let long = "a".repeat(200);
        assert_eq!(slug(&long).len(), MAX_SLUG_LEN);
        assert_eq!(slug("!!!trailing???"), "trailing");
    }

    #[test]
    fn test_branch_name_deterministic() {
        let a = branch_name("patchwork", "github", "42", "Add login page");
        let b = branch_name("patchwork", "github", "42", "Add login page");
        assert_eq!(a, "patchwork/add-login-page");
        assert_eq!(a, b);
    }

    #[test]
    fn test_branch_name_falls_back_to_identity() {
        assert_eq!(
            branch_name("patchwork", "github", "42", "!!!"),
            "patchwork/github-42"
        );
    }
}
