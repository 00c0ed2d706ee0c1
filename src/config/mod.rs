//! Daemon configuration.
//!
//! Three layers, resolved field-by-field with documented precedence:
//!
//! 1. built-in defaults (the `Default` impls below)
//! 2. `{data_dir}/config.toml` — global operator settings
//! 3. `<repo>/.patchwork/project.toml` — per-project overrides; every field
//!    is optional and a present value wins over the global layer
//!
//! CLI flags / env vars (parsed in `main`) sit above all three for the
//! handful of daemon-level knobs they cover (`--data-dir`, `--log`).

use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::worktree::paths::WorktreeRootMode;

const DEFAULT_MAX_PER_PROJECT: usize = 3;
const DEFAULT_LOCK_TTL_SECS: u64 = 300;
const DEFAULT_RECONCILE_INTERVAL_SECS: u64 = 900;
const DEFAULT_BRANCH_PREFIX: &str = "patchwork";

// ─── Cleanup policy ──────────────────────────────────────────────────────────

/// What happens to a worktree once its job ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupPolicy {
    /// Remove the worktree as soon as the job ends.
    Immediate,
    /// Mark `cleanup_pending`; the reconciler sweeps it later.
    Delay,
    /// Leave the worktree in place (`ready`) for manual reuse.
    Never,
}

// ─── Worktree section ────────────────────────────────────────────────────────

/// `[worktree]` in config.toml.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorktreeConfig {
    /// Master switch — `false` forces non-isolated execution for every job.
    pub enabled: bool,
    /// Where managed worktrees live: `in_repo`, `sibling`, or `custom`.
    pub root_mode: WorktreeRootMode,
    /// Absolute root directory, only used with `root_mode = "custom"`.
    pub custom_root: Option<PathBuf>,
    /// Maximum concurrently active worktrees per project (0 = unlimited).
    pub max_per_project: usize,
    /// Lock time-to-live in seconds. A job that stops renewing for this long
    /// is considered crashed and its worktree becomes reclaimable.
    pub lock_ttl_secs: u64,
    /// Prefix for generated branch names, e.g. `patchwork/add-login-page`.
    pub branch_prefix: String,
    pub cleanup_on_success: CleanupPolicy,
    pub cleanup_on_failure: CleanupPolicy,
    /// Roll the branch back to its base when a job is cancelled.
    pub rollback_on_cancel: bool,
    /// How often the background reconcile sweep runs (seconds).
    pub reconcile_interval_secs: u64,
}

impl Default for WorktreeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            root_mode: WorktreeRootMode::default(),
            custom_root: None,
            max_per_project: DEFAULT_MAX_PER_PROJECT,
            lock_ttl_secs: DEFAULT_LOCK_TTL_SECS,
            branch_prefix: DEFAULT_BRANCH_PREFIX.to_string(),
            cleanup_on_success: CleanupPolicy::Immediate,
            cleanup_on_failure: CleanupPolicy::Delay,
            rollback_on_cancel: true,
            reconcile_interval_secs: DEFAULT_RECONCILE_INTERVAL_SECS,
        }
    }
}

impl WorktreeConfig {
    /// Cleanup policy for a finished job.
    pub fn cleanup_for(&self, success: bool) -> CleanupPolicy {
        if success {
            self.cleanup_on_success
        } else {
            self.cleanup_on_failure
        }
    }

    /// Apply a per-project override layer. Present fields win.
    pub fn with_overrides(&self, o: &WorktreeOverrides) -> WorktreeConfig {
        WorktreeConfig {
            enabled: o.enabled.unwrap_or(self.enabled),
            root_mode: o.root_mode.clone().unwrap_or_else(|| self.root_mode.clone()),
            custom_root: o.custom_root.clone().or_else(|| self.custom_root.clone()),
            max_per_project: o.max_per_project.unwrap_or(self.max_per_project),
            lock_ttl_secs: o.lock_ttl_secs.unwrap_or(self.lock_ttl_secs),
            branch_prefix: o
                .branch_prefix
                .clone()
                .unwrap_or_else(|| self.branch_prefix.clone()),
            cleanup_on_success: o.cleanup_on_success.unwrap_or(self.cleanup_on_success),
            cleanup_on_failure: o.cleanup_on_failure.unwrap_or(self.cleanup_on_failure),
            rollback_on_cancel: o.rollback_on_cancel.unwrap_or(self.rollback_on_cancel),
            reconcile_interval_secs: o
                .reconcile_interval_secs
                .unwrap_or(self.reconcile_interval_secs),
        }
    }
}

/// `[worktree]` in `.patchwork/project.toml` — every field optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorktreeOverrides {
    pub enabled: Option<bool>,
    pub root_mode: Option<WorktreeRootMode>,
    pub custom_root: Option<PathBuf>,
    pub max_per_project: Option<usize>,
    pub lock_ttl_secs: Option<u64>,
    pub branch_prefix: Option<String>,
    pub cleanup_on_success: Option<CleanupPolicy>,
    pub cleanup_on_failure: Option<CleanupPolicy>,
    pub rollback_on_cancel: Option<bool>,
    pub reconcile_interval_secs: Option<u64>,
}

// ─── Approval section ────────────────────────────────────────────────────────

/// Whether a generated plan needs human sign-off before execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanningMode {
    /// No planning step at all.
    Disabled,
    /// Plan is generated and recorded but execution proceeds immediately.
    Auto,
    /// Execution suspends until the plan is approved.
    RequireApproval,
}

impl PlanningMode {
    pub fn requires_approval(&self) -> bool {
        matches!(self, PlanningMode::RequireApproval)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PlanningMode::Disabled => "disabled",
            PlanningMode::Auto => "auto",
            PlanningMode::RequireApproval => "require_approval",
        }
    }
}

/// `[approval]` in config.toml.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApprovalConfig {
    pub planning_mode: PlanningMode,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            planning_mode: PlanningMode::Auto,
        }
    }
}

/// `[approval]` in `.patchwork/project.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ApprovalOverrides {
    pub planning_mode: Option<PlanningMode>,
}

impl ApprovalConfig {
    pub fn with_overrides(&self, o: &ApprovalOverrides) -> ApprovalConfig {
        ApprovalConfig {
            planning_mode: o.planning_mode.unwrap_or(self.planning_mode),
        }
    }
}

// ─── Observability section ───────────────────────────────────────────────────

/// `[observability]` in config.toml.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log SQLite queries that exceed this threshold (milliseconds).
    /// Set to 0 to disable slow query logging.
    pub slow_query_threshold_ms: u64,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            slow_query_threshold_ms: 100,
        }
    }
}

// ─── TOML files ──────────────────────────────────────────────────────────────

/// `{data_dir}/config.toml`.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct TomlConfig {
    /// Log level filter string, e.g. "debug", "info,patchworkd=trace".
    log: Option<String>,
    worktree: WorktreeConfig,
    approval: ApprovalConfig,
    observability: ObservabilityConfig,
}

/// `<repo>/.patchwork/project.toml`.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ProjectOverrides {
    pub worktree: WorktreeOverrides,
    pub approval: ApprovalOverrides,
}

impl ProjectOverrides {
    /// Load the override file for a repository. Missing file → empty layer;
    /// a malformed file is a warning, not a failure (the global config still
    /// applies).
    pub fn load(repo_path: &Path) -> ProjectOverrides {
        let path = repo_path.join(".patchwork").join("project.toml");
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(_) => return ProjectOverrides::default(),
        };
        match toml::from_str(&raw) {
            Ok(o) => o,
            Err(e) => {
                warn!(path = %path.display(), err = %e, "ignoring malformed project.toml");
                ProjectOverrides::default()
            }
        }
    }
}

// ─── DaemonConfig ────────────────────────────────────────────────────────────

/// Effective daemon-wide configuration.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub data_dir: PathBuf,
    /// Log filter; CLI/env beats TOML beats "info".
    pub log: String,
    pub worktree: WorktreeConfig,
    pub approval: ApprovalConfig,
    pub observability: ObservabilityConfig,
}

impl DaemonConfig {
    /// Load global config. `log_override` comes from `--log` / `PATCHWORK_LOG`.
    pub fn load(data_dir: PathBuf, log_override: Option<String>) -> Result<Self> {
        let path = data_dir.join("config.toml");
        let file: TomlConfig = if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            toml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?
        } else {
            TomlConfig::default()
        };

        Ok(Self {
            data_dir,
            log: log_override
                .or(file.log)
                .unwrap_or_else(|| "info".to_string()),
            worktree: file.worktree,
            approval: file.approval,
            observability: file.observability,
        })
    }

    /// Worktree settings effective for one repository (project layer applied).
    pub fn worktree_for(&self, repo_path: &Path) -> WorktreeConfig {
        let overrides = ProjectOverrides::load(repo_path);
        self.worktree.with_overrides(&overrides.worktree)
    }

    /// Approval settings effective for one repository.
    pub fn approval_for(&self, repo_path: &Path) -> ApprovalConfig {
        let overrides = ProjectOverrides::load(repo_path);
        self.approval.with_overrides(&overrides.approval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let wt = WorktreeConfig::default();
        assert!(wt.enabled);
        assert_eq!(wt.max_per_project, 3);
        assert_eq!(wt.lock_ttl_secs, 300);
        assert_eq!(wt.cleanup_for(true), CleanupPolicy::Immediate);
        assert_eq!(wt.cleanup_for(false), CleanupPolicy::Delay);
    }

    #[test]
    fn test_toml_section_parse() {
        let raw = r#"
            log = "debug"

            [worktree]
            root_mode = "in_repo"
            max_per_project = 8
            cleanup_on_failure = "never"

            [approval]
            planning_mode = "require_approval"
        "#;
        let cfg: TomlConfig = toml::from_str(raw).unwrap();
        assert_eq!(cfg.log.as_deref(), Some("debug"));
        assert_eq!(cfg.worktree.root_mode, WorktreeRootMode::InRepo);
        assert_eq!(cfg.worktree.max_per_project, 8);
        // Unset fields keep their defaults.
        assert_eq!(cfg.worktree.lock_ttl_secs, 300);
        assert_eq!(cfg.worktree.cleanup_on_failure, CleanupPolicy::Never);
        assert!(cfg.approval.planning_mode.requires_approval());
    }

    #[test]
    fn test_project_layer_wins_field_by_field() {
        let global = WorktreeConfig::default();
        let raw = r#"
            [worktree]
            max_per_project = 1
            branch_prefix = "cards"
        "#;
        let overrides: ProjectOverrides = toml::from_str(raw).unwrap();
        let effective = global.with_overrides(&overrides.worktree);
        assert_eq!(effective.max_per_project, 1);
        assert_eq!(effective.branch_prefix, "cards");
        // Fields absent from the project layer fall through to global.
        assert!(effective.enabled);
        assert_eq!(effective.lock_ttl_secs, global.lock_ttl_secs);
    }

    #[test]
    fn test_empty_overrides_are_identity() {
        let global = WorktreeConfig::default();
        let effective = global.with_overrides(&WorktreeOverrides::default());
        assert_eq!(effective.max_per_project, global.max_per_project);
        assert_eq!(effective.branch_prefix, global.branch_prefix);
    }
}
