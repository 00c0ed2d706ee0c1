//! Integration tests for the plan-approval gate and the pipeline runner.

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tempfile::TempDir;

use patchworkd::approval::{ApprovalGate, GateDecision};
use patchworkd::config::{PlanningMode, WorktreeConfig};
use patchworkd::events::EventBroadcaster;
use patchworkd::git::GitGateway;
use patchworkd::pipeline::{AgentOutcome, AgentRunner, JobRunner, RunOutcome};
use patchworkd::storage::{ApprovalStatus, Storage, WorktreeStatus};
use patchworkd::tracker::NoopTracker;
use patchworkd::worktree::paths::WorktreeRootMode;
use patchworkd::worktree::{JobContext, WorktreeLifecycleManager};

fn git(dir: &Path, args: &[&str]) {
    let out = std::process::Command::new("git")
        .arg("-C")
        .arg(dir)
        .args(args)
        .output()
        .expect("run git");
    assert!(
        out.status.success(),
        "git {args:?} failed: {}",
        String::from_utf8_lossy(&out.stderr)
    );
}

fn init_test_repo(dir: &Path) -> String {
    std::fs::create_dir_all(dir).expect("create repo dir");
    let out = std::process::Command::new("git")
        .arg("init")
        .arg(dir)
        .output()
        .expect("git init");
    assert!(out.status.success());
    git(dir, &["config", "user.email", "test@example.com"]);
    git(dir, &["config", "user.name", "Test"]);
    git(dir, &["commit", "--allow-empty", "-m", "Initial commit"]);
    let out = std::process::Command::new("git")
        .arg("-C")
        .arg(dir)
        .args(["rev-parse", "--abbrev-ref", "HEAD"])
        .output()
        .expect("rev-parse");
    String::from_utf8_lossy(&out.stdout).trim().to_string()
}

fn job(repo: &Path, base: &str, card: &str, title: &str) -> JobContext {
    JobContext {
        project_id: "proj-1".to_string(),
        card_id: card.to_string(),
        job_id: format!("job-{card}"),
        card_title: title.to_string(),
        provider: "github".to_string(),
        repo_path: repo.to_path_buf(),
        base_branch: base.to_string(),
    }
}

/// Stand-in for the opaque AI tool.
struct StubAgent {
    succeed: bool,
}

#[async_trait]
impl AgentRunner for StubAgent {
    async fn plan(&self, job: &JobContext, _workdir: &Path) -> Result<String> {
        Ok(format!("1. implement {}\n2. add tests", job.card_title))
    }

    async fn execute(
        &self,
        _job: &JobContext,
        _workdir: &Path,
        extra_context: &[String],
    ) -> Result<AgentOutcome> {
        Ok(AgentOutcome {
            output: format!("done ({} follow-ups applied)", extra_context.len()),
            success: self.succeed,
        })
    }
}

struct Fixture {
    _tmp: TempDir,
    repo: std::path::PathBuf,
    base: String,
    storage: Arc<Storage>,
    gate: Arc<ApprovalGate>,
    manager: Arc<WorktreeLifecycleManager>,
}

async fn fixture() -> Fixture {
    let tmp = TempDir::new().expect("tempdir");
    let repo = tmp.path().join("repo");
    let base = init_test_repo(&repo);

    let config = WorktreeConfig {
        root_mode: WorktreeRootMode::Custom,
        custom_root: Some(tmp.path().join("worktrees")),
        ..Default::default()
    };

    let storage = Arc::new(Storage::new(&tmp.path().join("data")).await.expect("storage"));
    let broadcaster = Arc::new(EventBroadcaster::new());
    let gate = Arc::new(ApprovalGate::new(storage.clone(), broadcaster.clone()));
    let manager = Arc::new(WorktreeLifecycleManager::new(
        storage.clone(),
        Arc::new(GitGateway::new()),
        broadcaster,
        config,
        "worker-a".to_string(),
    ));

    Fixture {
        _tmp: tmp,
        repo,
        base,
        storage,
        gate,
        manager,
    }
}

fn runner(fx: &Fixture, mode: PlanningMode, succeed: bool) -> JobRunner {
    JobRunner::new(
        fx.manager.clone(),
        fx.gate.clone(),
        Arc::new(StubAgent { succeed }),
        Arc::new(NoopTracker),
        mode,
    )
}

// ─── Gate-only transitions ───────────────────────────────────────────────────

#[tokio::test]
async fn test_gate_is_passthrough_when_approval_not_required() {
    let fx = fixture().await;
    let j = job(&fx.repo, &fx.base, "card-1", "Add login page");
    let decision = fx
        .gate
        .check(&j, "a plan", PlanningMode::Auto)
        .await
        .expect("check");
    assert_eq!(decision, GateDecision::Proceed);
    // Pass-through creates no record.
    assert!(fx
        .storage
        .get_approval_for_job(&j.job_id)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_gate_creates_pending_and_suspends_once() {
    let fx = fixture().await;
    let j = job(&fx.repo, &fx.base, "card-1", "Add login page");

    let first = fx
        .gate
        .check(&j, "the plan", PlanningMode::RequireApproval)
        .await
        .expect("check");
    let approval_id = match first {
        GateDecision::AwaitingApproval { approval_id } => approval_id,
        other => panic!("expected AwaitingApproval, got {other:?}"),
    };

    // Re-checking re-evaluates the same record — no duplicate.
    let second = fx
        .gate
        .check(&j, "a different plan", PlanningMode::RequireApproval)
        .await
        .expect("re-check");
    assert_eq!(
        second,
        GateDecision::AwaitingApproval {
            approval_id: approval_id.clone()
        }
    );
    let record = fx
        .storage
        .get_approval_for_job(&j.job_id)
        .await
        .unwrap()
        .expect("record");
    assert_eq!(record.id, approval_id);
    assert_eq!(record.plan, "the plan", "original plan retained");
}

#[tokio::test]
async fn test_gate_approved_proceeds_and_rejected_cancels() {
    let fx = fixture().await;
    let j = job(&fx.repo, &fx.base, "card-1", "Add login page");

    let approval_id = match fx
        .gate
        .check(&j, "the plan", PlanningMode::RequireApproval)
        .await
        .expect("check")
    {
        GateDecision::AwaitingApproval { approval_id } => approval_id,
        other => panic!("expected AwaitingApproval, got {other:?}"),
    };

    assert!(fx.gate.resolve(&approval_id, true).await.expect("approve"));
    let decision = fx
        .gate
        .check(&j, "the plan", PlanningMode::RequireApproval)
        .await
        .expect("re-check");
    assert_eq!(decision, GateDecision::Proceed);

    // A rejected record for another job yields cancellation, not suspension.
    let j2 = job(&fx.repo, &fx.base, "card-2", "Second card");
    let id2 = match fx
        .gate
        .check(&j2, "plan two", PlanningMode::RequireApproval)
        .await
        .expect("check")
    {
        GateDecision::AwaitingApproval { approval_id } => approval_id,
        other => panic!("expected AwaitingApproval, got {other:?}"),
    };
    assert!(fx.gate.resolve(&id2, false).await.expect("reject"));
    let decision = fx
        .gate
        .check(&j2, "plan two", PlanningMode::RequireApproval)
        .await
        .expect("re-check");
    assert_eq!(decision, GateDecision::Rejected { approval_id: id2 });
}

// ─── Pipeline end-to-end ─────────────────────────────────────────────────────

#[tokio::test]
async fn test_run_suspends_then_resumes_after_approval() {
    let fx = fixture().await;
    let r = runner(&fx, PlanningMode::RequireApproval, true);
    let j = job(&fx.repo, &fx.base, "card-1", "Add login page");

    let approval_id = match r.run(&j).await.expect("first run") {
        RunOutcome::Suspended { approval_id } => approval_id,
        other => panic!("expected Suspended, got {other:?}"),
    };

    // Parked: worktree kept, lock released, resumable from storage alone.
    let rec = fx
        .storage
        .find_active_for_card("proj-1", "card-1")
        .await
        .unwrap()
        .expect("record");
    assert_eq!(rec.status(), WorktreeStatus::Ready);
    assert!(rec.locked_by.is_none());
    assert!(std::path::Path::new(&rec.worktree_path).exists());

    // Still pending → suspends again, same approval record.
    match r.run(&j).await.expect("second run") {
        RunOutcome::Suspended { approval_id: again } => assert_eq!(again, approval_id),
        other => panic!("expected Suspended, got {other:?}"),
    }

    fx.gate.resolve(&approval_id, true).await.expect("approve");

    match r.run(&j).await.expect("resumed run") {
        RunOutcome::Completed { success } => assert!(success),
        other => panic!("expected Completed, got {other:?}"),
    }
    // Success + default policy: worktree cleaned.
    let rec = fx.storage.get_worktree(&rec.id).await.unwrap().expect("record");
    assert_eq!(rec.status(), WorktreeStatus::Cleaned);
    let approval = fx
        .storage
        .get_approval_for_job(&j.job_id)
        .await
        .unwrap()
        .expect("approval");
    assert_eq!(approval.status(), ApprovalStatus::Approved);
}

#[tokio::test]
async fn test_rejected_plan_cancels_run() {
    let fx = fixture().await;
    let r = runner(&fx, PlanningMode::RequireApproval, true);
    let j = job(&fx.repo, &fx.base, "card-1", "Add login page");

    let approval_id = match r.run(&j).await.expect("first run") {
        RunOutcome::Suspended { approval_id } => approval_id,
        other => panic!("expected Suspended, got {other:?}"),
    };
    fx.gate.resolve(&approval_id, false).await.expect("reject");

    match r.run(&j).await.expect("second run") {
        RunOutcome::Cancelled { reason } => assert_eq!(reason, "plan rejected"),
        other => panic!("expected Cancelled, got {other:?}"),
    }
    // Cancellation released the lock and applied the failure policy.
    let rec = fx
        .storage
        .find_active_for_card("proj-1", "card-1")
        .await
        .unwrap()
        .expect("record");
    assert!(rec.locked_by.is_none());
    assert_eq!(rec.status(), WorktreeStatus::CleanupPending);
}

#[tokio::test]
async fn test_abort_follow_up_cancels_run() {
    let fx = fixture().await;
    let r = runner(&fx, PlanningMode::Auto, true);
    let j = job(&fx.repo, &fx.base, "card-1", "Add login page");

    fx.storage
        .add_follow_up(&j.job_id, "abort", "")
        .await
        .expect("queue abort");

    match r.run(&j).await.expect("run") {
        RunOutcome::Cancelled { reason } => {
            assert_eq!(reason, "aborted by follow-up instruction")
        }
        other => panic!("expected Cancelled, got {other:?}"),
    }
}

#[tokio::test]
async fn test_follow_up_instructions_reach_the_agent() {
    let fx = fixture().await;
    let r = runner(&fx, PlanningMode::Auto, true);
    let j = job(&fx.repo, &fx.base, "card-1", "Add login page");

    fx.storage
        .add_follow_up(&j.job_id, "instruction", "also update the docs")
        .await
        .expect("queue follow-up");

    match r.run(&j).await.expect("run") {
        RunOutcome::Completed { success } => assert!(success),
        other => panic!("expected Completed, got {other:?}"),
    }
    // Consumed instructions end up applied.
    assert!(fx
        .storage
        .pending_follow_ups(&j.job_id)
        .await
        .unwrap()
        .is_empty());
}
