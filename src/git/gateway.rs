//! Thin async wrapper over the `git` binary.
//!
//! Every operation is scoped to an explicit repository path via `git -C` —
//! nothing here changes the process working directory. Failures are values:
//! they carry the command line and captured stderr so callers can surface
//! them without re-running anything. Interactive credential prompts are
//! suppressed so a misconfigured remote fails fast instead of hanging the
//! pipeline.

use std::path::{Path, PathBuf};

use tokio::process::Command;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

/// Minimum git version with usable `git worktree` support.
pub const MIN_WORKTREE_VERSION: (u32, u32) = (2, 5);

#[derive(Debug, thiserror::Error)]
pub enum GitError {
    #[error("failed to spawn git: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("`{command}` failed: {stderr}")]
    Command { command: String, stderr: String },
    #[error("git version {found} does not support worktrees (requires 2.5+)")]
    UnsupportedVersion { found: String },
    #[error("could not parse git version from `{0}`")]
    VersionParse(String),
}

impl GitError {
    /// True for a non-zero exit (as opposed to spawn/parse failures).
    pub fn is_command_failure(&self) -> bool {
        matches!(self, GitError::Command { .. })
    }
}

/// On-disk worktree entry as reported by `git worktree list --porcelain`.
///
/// Authoritative for existence and health only — business status lives in
/// the record store, never here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitWorktreeEntry {
    pub path: PathBuf,
    pub head_sha: String,
    /// Short branch name (`refs/heads/` stripped). `None` when detached or bare.
    pub branch: Option<String>,
    pub bare: bool,
    pub detached: bool,
    pub locked: bool,
    pub prunable: bool,
}

/// Options for [`GitGateway::add_worktree`].
#[derive(Debug, Clone, Copy, Default)]
pub struct AddWorktreeOpts {
    /// Create the branch (`-b`) instead of checking out an existing one.
    pub new_branch: bool,
    /// Set up upstream tracking (`--track`) — only meaningful with `new_branch`.
    pub track: bool,
}

/// Async gateway to git subcommands.
///
/// Stateless apart from a cached version probe; cheap to share behind an
/// `Arc`.
pub struct GitGateway {
    version: OnceCell<(u32, u32)>,
}

impl Default for GitGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl GitGateway {
    pub fn new() -> Self {
        Self {
            version: OnceCell::new(),
        }
    }

    /// Run `git -C <repo> <args…>` and return trimmed stdout.
    async fn run(&self, repo: &Path, args: &[&str]) -> Result<String, GitError> {
        let output = Command::new("git")
            .arg("-C")
            .arg(repo)
            .args(args)
            .env("GIT_TERMINAL_PROMPT", "0")
            .env("GIT_SSH_COMMAND", "ssh -oBatchMode=yes")
            .output()
            .await?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            let command = format!("git -C {} {}", repo.display(), args.join(" "));
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            debug!(command = %command, stderr = %stderr, "git command failed");
            Err(GitError::Command { command, stderr })
        }
    }

    /// Run a repo-less git command (`git --version` and friends).
    async fn run_global(&self, args: &[&str]) -> Result<String, GitError> {
        let output = Command::new("git")
            .args(args)
            .env("GIT_TERMINAL_PROMPT", "0")
            .output()
            .await?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            Err(GitError::Command {
                command: format!("git {}", args.join(" ")),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }

    // ─── Version gate ────────────────────────────────────────────────────────

    async fn query_version(&self) -> Result<(u32, u32), GitError> {
        let raw = self.run_global(&["--version"]).await?;
        parse_version(&raw).ok_or(GitError::VersionParse(raw))
    }

    async fn cached_version(&self) -> Result<(u32, u32), GitError> {
        self.version
            .get_or_try_init(|| self.query_version())
            .await
            .copied()
    }

    /// Whether the installed git supports the worktree feature.
    ///
    /// A probe failure counts as unsupported — callers fall back to
    /// non-isolated execution rather than crashing.
    pub async fn supports_worktrees(&self) -> bool {
        match self.cached_version().await {
            Ok(v) => v >= MIN_WORKTREE_VERSION,
            Err(e) => {
                warn!(err = %e, "could not determine git version — treating worktrees as unsupported");
                false
            }
        }
    }

    async fn ensure_worktree_support(&self) -> Result<(), GitError> {
        let v = self.cached_version().await?;
        if v >= MIN_WORKTREE_VERSION {
            Ok(())
        } else {
            Err(GitError::UnsupportedVersion {
                found: format!("{}.{}", v.0, v.1),
            })
        }
    }

    // ─── Worktrees ───────────────────────────────────────────────────────────

    pub async fn list_worktrees(&self, repo: &Path) -> Result<Vec<GitWorktreeEntry>, GitError> {
        self.ensure_worktree_support().await?;
        let out = self.run(repo, &["worktree", "list", "--porcelain"]).await?;
        Ok(parse_worktree_list(&out))
    }

    /// `git worktree add` — either checks out an existing branch or creates a
    /// new one (`-b`) from `base_ref`.
    pub async fn add_worktree(
        &self,
        repo: &Path,
        path: &Path,
        branch: &str,
        base_ref: Option<&str>,
        opts: AddWorktreeOpts,
    ) -> Result<(), GitError> {
        self.ensure_worktree_support().await?;
        let path_str = path.to_string_lossy().into_owned();
        let mut args: Vec<&str> = vec!["worktree", "add"];
        if opts.new_branch {
            if opts.track {
                args.push("--track");
            }
            args.push("-b");
            args.push(branch);
            args.push(&path_str);
            args.push(base_ref.unwrap_or("HEAD"));
        } else {
            args.push(&path_str);
            args.push(branch);
        }
        self.run(repo, &args).await?;
        Ok(())
    }

    pub async fn remove_worktree(
        &self,
        repo: &Path,
        path: &Path,
        force: bool,
    ) -> Result<(), GitError> {
        self.ensure_worktree_support().await?;
        let path_str = path.to_string_lossy().into_owned();
        let mut args: Vec<&str> = vec!["worktree", "remove"];
        if force {
            args.push("--force");
        }
        args.push(&path_str);
        self.run(repo, &args).await?;
        Ok(())
    }

    /// Reconcile git's own worktree bookkeeping with reality.
    pub async fn prune_worktrees(&self, repo: &Path) -> Result<(), GitError> {
        self.ensure_worktree_support().await?;
        self.run(repo, &["worktree", "prune"]).await?;
        Ok(())
    }

    // ─── Branches & refs ─────────────────────────────────────────────────────

    pub async fn branch_exists_local(&self, repo: &Path, branch: &str) -> Result<bool, GitError> {
        self.ref_exists(repo, &format!("refs/heads/{branch}")).await
    }

    pub async fn branch_exists_remote(&self, repo: &Path, branch: &str) -> Result<bool, GitError> {
        self.ref_exists(repo, &format!("refs/remotes/origin/{branch}"))
            .await
    }

    async fn ref_exists(&self, repo: &Path, full_ref: &str) -> Result<bool, GitError> {
        match self
            .run(repo, &["show-ref", "--verify", "--quiet", full_ref])
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if e.is_command_failure() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Short name of the currently checked-out branch (`HEAD` when detached).
    pub async fn current_branch(&self, repo: &Path) -> Result<String, GitError> {
        self.run(repo, &["rev-parse", "--abbrev-ref", "HEAD"]).await
    }

    pub async fn head_sha(&self, repo: &Path) -> Result<String, GitError> {
        self.run(repo, &["rev-parse", "HEAD"]).await
    }

    /// Resolve a revision to a sha, or `None` if it does not exist.
    pub async fn rev_parse(&self, repo: &Path, rev: &str) -> Result<Option<String>, GitError> {
        match self
            .run(repo, &["rev-parse", "--verify", "--quiet", &format!("{rev}^{{commit}}")])
            .await
        {
            Ok(sha) => Ok(Some(sha)),
            Err(e) if e.is_command_failure() => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn fetch(&self, repo: &Path, remote: &str) -> Result<(), GitError> {
        self.run(repo, &["fetch", "--quiet", remote]).await?;
        Ok(())
    }

    pub async fn checkout(&self, repo: &Path, rev: &str) -> Result<(), GitError> {
        self.run(repo, &["checkout", "--quiet", rev]).await?;
        Ok(())
    }

    /// `git reset --hard [rev]` — plain `reset --hard` when `rev` is `None`.
    pub async fn reset_hard(&self, repo: &Path, rev: Option<&str>) -> Result<(), GitError> {
        let mut args: Vec<&str> = vec!["reset", "--hard", "--quiet"];
        if let Some(rev) = rev {
            args.push(rev);
        }
        self.run(repo, &args).await?;
        Ok(())
    }

    /// Fast-forward the current branch from its upstream.
    pub async fn fast_forward(&self, repo: &Path) -> Result<(), GitError> {
        self.run(repo, &["merge", "--ff-only", "--quiet", "@{upstream}"])
            .await?;
        Ok(())
    }

    /// Create a branch without checking it out. `track` sets upstream to the
    /// start point (which must be a remote-tracking ref for that to stick).
    pub async fn create_branch(
        &self,
        repo: &Path,
        branch: &str,
        start_point: Option<&str>,
        track: bool,
    ) -> Result<(), GitError> {
        let mut args: Vec<&str> = vec!["branch"];
        if track {
            args.push("--track");
        }
        args.push(branch);
        if let Some(start) = start_point {
            args.push(start);
        }
        self.run(repo, &args).await?;
        Ok(())
    }

    pub async fn delete_branch(&self, repo: &Path, branch: &str, force: bool) -> Result<(), GitError> {
        let flag = if force { "-D" } else { "-d" };
        self.run(repo, &["branch", flag, branch]).await?;
        Ok(())
    }

    /// True when the working tree has no uncommitted changes.
    pub async fn is_clean(&self, repo: &Path) -> Result<bool, GitError> {
        let out = self.run(repo, &["status", "--porcelain"]).await?;
        Ok(out.is_empty())
    }
}

// ─── Parsing ─────────────────────────────────────────────────────────────────

fn parse_version(raw: &str) -> Option<(u32, u32)> {
    // "git version 2.39.2" / "git version 2.39.2.windows.1"
    let rest = raw.trim().strip_prefix("git version ")?;
    let mut parts = rest.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    Some((major, minor))
}

fn parse_worktree_list(output: &str) -> Vec<GitWorktreeEntry> {
    let mut entries = Vec::new();
    let mut current: Option<GitWorktreeEntry> = None;

    for line in output.lines() {
        let line = line.trim_end();
        if line.is_empty() {
            if let Some(e) = current.take() {
                entries.push(e);
            }
            continue;
        }
        if let Some(path) = line.strip_prefix("worktree ") {
            if let Some(e) = current.take() {
                entries.push(e);
            }
            current = Some(GitWorktreeEntry {
                path: PathBuf::from(path),
                head_sha: String::new(),
                branch: None,
                bare: false,
                detached: false,
                locked: false,
                prunable: false,
            });
            continue;
        }
        let Some(entry) = current.as_mut() else {
            continue;
        };
        if let Some(sha) = line.strip_prefix("HEAD ") {
            entry.head_sha = sha.to_string();
        } else if let Some(branch_ref) = line.strip_prefix("branch ") {
            entry.branch = Some(
                branch_ref
                    .strip_prefix("refs/heads/")
                    .unwrap_or(branch_ref)
                    .to_string(),
            );
        } else if line == "bare" {
            entry.bare = true;
        } else if line == "detached" {
            entry.detached = true;
        } else if line == "locked" || line.starts_with("locked ") {
            entry.locked = true;
        } else if line == "prunable" || line.starts_with("prunable ") {
            entry.prunable = true;
        }
    }
    if let Some(e) = current.take() {
        entries.push(e);
    }
    entries
}
