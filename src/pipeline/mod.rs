//! Pipeline run orchestration.
//!
//! One card, one sequential run: setup → plan → approval gate → execute →
//! cleanup. Runs for different cards proceed concurrently as independent
//! tasks; the only cross-run coordination is the record-store lock.
//!
//! Suspension ("awaiting approval") and cancellation are ordinary return
//! values, not errors — the error channel is reserved for actual failures.

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{info, warn};

use crate::approval::{ApprovalGate, FollowUpSignal, GateDecision};
use crate::config::PlanningMode;
use crate::tracker::{
    self, IssueTracker, LABEL_AWAITING_REVIEW, LABEL_DONE, LABEL_FAILED, LABEL_IN_PROGRESS,
};
use crate::worktree::{
    FallbackReason, JobContext, ReadyWorktree, RenewalHandle, SetupOutcome,
    WorktreeLifecycleManager,
};

/// Result of an opaque AI-tool invocation.
#[derive(Debug, Clone)]
pub struct AgentOutcome {
    pub output: String,
    pub success: bool,
}

/// The AI tool behind the pipeline. Opaque: it receives a working directory
/// and context, emits text, and reports success — how is not this crate's
/// business.
#[async_trait]
pub trait AgentRunner: Send + Sync {
    /// Produce a plan for the card.
    async fn plan(&self, job: &JobContext, workdir: &Path) -> Result<String>;

    /// Execute the card's change. `extra_context` carries drained follow-up
    /// instructions, oldest first.
    async fn execute(
        &self,
        job: &JobContext,
        workdir: &Path,
        extra_context: &[String],
    ) -> Result<AgentOutcome>;
}

/// How a pipeline run ended. Suspension and cancellation are values here —
/// only infrastructure failures travel the error channel.
#[derive(Debug)]
pub enum RunOutcome {
    Completed { success: bool },
    /// Parked pending plan approval; resumable via a fresh `run()` once the
    /// approval record is resolved.
    Suspended { approval_id: String },
    Cancelled { reason: String },
    /// Another worker holds the card's worktree.
    Busy { locked_by: String },
}

pub struct JobRunner {
    manager: Arc<WorktreeLifecycleManager>,
    gate: Arc<ApprovalGate>,
    runner: Arc<dyn AgentRunner>,
    tracker: Arc<dyn IssueTracker>,
    planning_mode: PlanningMode,
}

impl JobRunner {
    pub fn new(
        manager: Arc<WorktreeLifecycleManager>,
        gate: Arc<ApprovalGate>,
        runner: Arc<dyn AgentRunner>,
        tracker: Arc<dyn IssueTracker>,
        planning_mode: PlanningMode,
    ) -> Self {
        Self {
            manager,
            gate,
            runner,
            tracker,
            planning_mode,
        }
    }

    /// Run the pipeline for one card, end to end.
    pub async fn run(&self, job: &JobContext) -> Result<RunOutcome> {
        match self.manager.setup(job).await? {
            SetupOutcome::Busy { locked_by } => Ok(RunOutcome::Busy { locked_by }),
            SetupOutcome::Fallback(reason) => self.run_non_isolated(job, reason).await,
            SetupOutcome::Ready(ready) => {
                let renewal = self.manager.start_lock_renewal(&ready.record_id);
                self.run_isolated(job, ready, renewal).await
            }
        }
    }

    /// Isolated path: the worktree is locked and renewed for the duration.
    async fn run_isolated(
        &self,
        job: &JobContext,
        ready: ReadyWorktree,
        renewal: RenewalHandle,
    ) -> Result<RunOutcome> {
        tracker::try_set_label(self.tracker.as_ref(), &job.card_id, LABEL_IN_PROGRESS).await;

        let plan = match self.runner.plan(job, &ready.path).await {
            Ok(plan) => plan,
            Err(e) => {
                renewal.stop();
                self.manager.cleanup(&ready.record_id, false).await?;
                tracker::try_set_label(self.tracker.as_ref(), &job.card_id, LABEL_FAILED).await;
                return Err(e);
            }
        };

        match self.gate.check(job, &plan, self.planning_mode).await? {
            GateDecision::Proceed => {}
            GateDecision::AwaitingApproval { approval_id } => {
                renewal.stop();
                self.manager.park(&ready.record_id).await?;
                tracker::try_set_label(self.tracker.as_ref(), &job.card_id, LABEL_AWAITING_REVIEW)
                    .await;
                tracker::try_comment(self.tracker.as_ref(), &job.card_id, &plan).await;
                info!(job_id = %job.job_id, "run suspended awaiting plan approval");
                return Ok(RunOutcome::Suspended { approval_id });
            }
            GateDecision::Rejected { .. } => {
                self.manager.cancel(&ready, Some(renewal)).await?;
                tracker::try_set_label(self.tracker.as_ref(), &job.card_id, LABEL_FAILED).await;
                return Ok(RunOutcome::Cancelled {
                    reason: "plan rejected".to_string(),
                });
            }
        }

        let context = match self.gate.drain_follow_ups(&job.job_id).await? {
            FollowUpSignal::Abort => {
                self.manager.cancel(&ready, Some(renewal)).await?;
                return Ok(RunOutcome::Cancelled {
                    reason: "aborted by follow-up instruction".to_string(),
                });
            }
            FollowUpSignal::Instructions(list) => list,
        };

        let outcome = match self.runner.execute(job, &ready.path, &context).await {
            Ok(outcome) => outcome,
            Err(e) => {
                renewal.stop();
                self.manager.cleanup(&ready.record_id, false).await?;
                tracker::try_set_label(self.tracker.as_ref(), &job.card_id, LABEL_FAILED).await;
                return Err(e);
            }
        };
        self.gate.mark_applied(&job.job_id).await?;

        renewal.stop();
        self.manager.cleanup(&ready.record_id, outcome.success).await?;

        let label = if outcome.success { LABEL_DONE } else { LABEL_FAILED };
        tracker::try_set_label(self.tracker.as_ref(), &job.card_id, label).await;

        Ok(RunOutcome::Completed {
            success: outcome.success,
        })
    }

    /// Non-isolated path: run directly in the main checkout. Reported, never
    /// silent — setup already logged and broadcast the reason.
    async fn run_non_isolated(
        &self,
        job: &JobContext,
        reason: FallbackReason,
    ) -> Result<RunOutcome> {
        warn!(card_id = %job.card_id, %reason, "running without worktree isolation");
        tracker::try_set_label(self.tracker.as_ref(), &job.card_id, LABEL_IN_PROGRESS).await;

        let plan = self.runner.plan(job, &job.repo_path).await?;
        match self.gate.check(job, &plan, self.planning_mode).await? {
            GateDecision::Proceed => {}
            GateDecision::AwaitingApproval { approval_id } => {
                tracker::try_set_label(self.tracker.as_ref(), &job.card_id, LABEL_AWAITING_REVIEW)
                    .await;
                return Ok(RunOutcome::Suspended { approval_id });
            }
            GateDecision::Rejected { .. } => {
                return Ok(RunOutcome::Cancelled {
                    reason: "plan rejected".to_string(),
                });
            }
        }

        let context = match self.gate.drain_follow_ups(&job.job_id).await? {
            FollowUpSignal::Abort => {
                return Ok(RunOutcome::Cancelled {
                    reason: "aborted by follow-up instruction".to_string(),
                })
            }
            FollowUpSignal::Instructions(list) => list,
        };

        let outcome = self.runner.execute(job, &job.repo_path, &context).await?;
        self.gate.mark_applied(&job.job_id).await?;

        let label = if outcome.success { LABEL_DONE } else { LABEL_FAILED };
        tracker::try_set_label(self.tracker.as_ref(), &job.card_id, label).await;

        Ok(RunOutcome::Completed {
            success: outcome.success,
        })
    }
}
