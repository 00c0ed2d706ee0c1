//! Plan-approval gate and follow-up instructions.
//!
//! The gate pauses a pipeline run until a human has reviewed the generated
//! plan. Suspension is a value ([`GateDecision::AwaitingApproval`]), not an
//! error — the caller persists enough state to resume from storage later;
//! there is no in-memory continuation to lose.

use std::sync::Arc;

use anyhow::Result;
use serde_json::json;
use tracing::{debug, info};

use crate::config::PlanningMode;
use crate::events::EventBroadcaster;
use crate::storage::{ApprovalStatus, Storage};
use crate::worktree::JobContext;

/// Follow-up instruction kind that aborts the run instead of feeding it.
pub const FOLLOW_UP_ABORT: &str = "abort";

/// What the pipeline should do after consulting the gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    /// No approval needed, or approval already granted.
    Proceed,
    /// A pending approval exists; park the run and resume on resolution.
    AwaitingApproval { approval_id: String },
    /// The plan was rejected; cancel the run. A signal, not an error.
    Rejected { approval_id: String },
}

/// Result of draining the follow-up queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FollowUpSignal {
    /// An abort instruction was queued; cancel the run.
    Abort,
    /// Instruction contents, oldest first, to fold into the prompt context.
    Instructions(Vec<String>),
}

pub struct ApprovalGate {
    storage: Arc<Storage>,
    broadcaster: Arc<EventBroadcaster>,
}

impl ApprovalGate {
    pub fn new(storage: Arc<Storage>, broadcaster: Arc<EventBroadcaster>) -> Self {
        Self {
            storage,
            broadcaster,
        }
    }

    /// Evaluate the gate for a job's plan.
    ///
    /// Idempotent per job: a prior record is re-evaluated instead of
    /// duplicated, so a resumed run lands exactly where it left off.
    pub async fn check(
        &self,
        job: &JobContext,
        plan: &str,
        mode: PlanningMode,
    ) -> Result<GateDecision> {
        if !mode.requires_approval() {
            return Ok(GateDecision::Proceed);
        }

        if let Some(existing) = self.storage.get_approval_for_job(&job.job_id).await? {
            return Ok(match existing.status() {
                ApprovalStatus::Approved | ApprovalStatus::Skipped => {
                    debug!(job_id = %job.job_id, "plan already approved — proceeding");
                    GateDecision::Proceed
                }
                ApprovalStatus::Rejected => GateDecision::Rejected {
                    approval_id: existing.id,
                },
                ApprovalStatus::Pending => GateDecision::AwaitingApproval {
                    approval_id: existing.id,
                },
            });
        }

        let approval = self
            .storage
            .create_approval(
                &job.job_id,
                &job.card_id,
                &job.project_id,
                plan,
                mode.as_str(),
            )
            .await?;
        info!(job_id = %job.job_id, approval_id = %approval.id, "plan awaiting approval");
        self.broadcaster.broadcast(
            "approval.requested",
            json!({
                "approval_id": approval.id,
                "job_id": job.job_id,
                "card_id": job.card_id,
                "project_id": job.project_id,
            }),
        );
        Ok(GateDecision::AwaitingApproval {
            approval_id: approval.id,
        })
    }

    /// Resolve a pending approval. Returns `false` when it was already
    /// terminal (terminal records are immutable).
    pub async fn resolve(&self, approval_id: &str, approve: bool) -> Result<bool> {
        let status = if approve {
            ApprovalStatus::Approved
        } else {
            ApprovalStatus::Rejected
        };
        let changed = self.storage.resolve_approval(approval_id, status).await?;
        if changed {
            info!(approval_id, status = status.as_str(), "plan approval resolved");
            self.broadcaster.broadcast(
                "approval.resolved",
                json!({ "approval_id": approval_id, "status": status.as_str() }),
            );
        }
        Ok(changed)
    }

    /// Mark a pending approval skipped (e.g. planning mode changed mid-run).
    pub async fn skip(&self, approval_id: &str) -> Result<bool> {
        self.storage
            .resolve_approval(approval_id, ApprovalStatus::Skipped)
            .await
    }

    // ─── Follow-up instructions ──────────────────────────────────────────────

    /// Drain pending follow-ups for a job, oldest first.
    ///
    /// An `abort` instruction short-circuits: it is marked applied and the
    /// caller receives [`FollowUpSignal::Abort`]. Everything else moves to
    /// `processing` and is returned for the run to fold into its prompt;
    /// call [`Self::mark_applied`] once consumed.
    pub async fn drain_follow_ups(&self, job_id: &str) -> Result<FollowUpSignal> {
        let pending = self.storage.pending_follow_ups(job_id).await?;
        let mut collected = Vec::new();
        for row in pending {
            if row.kind == FOLLOW_UP_ABORT {
                self.storage.set_follow_up_status(&row.id, "applied").await?;
                info!(job_id, "abort instruction received");
                return Ok(FollowUpSignal::Abort);
            }
            self.storage
                .set_follow_up_status(&row.id, "processing")
                .await?;
            collected.push(row.content);
        }
        Ok(FollowUpSignal::Instructions(collected))
    }

    /// Mark every `processing` instruction for the job as consumed.
    pub async fn mark_applied(&self, job_id: &str) -> Result<u64> {
        self.storage.mark_follow_ups_applied(job_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn gate() -> (TempDir, Arc<Storage>, ApprovalGate) {
        let tmp = TempDir::new().expect("tempdir");
        let storage = Arc::new(Storage::new(tmp.path()).await.expect("storage"));
        let gate = ApprovalGate::new(storage.clone(), Arc::new(EventBroadcaster::new()));
        (tmp, storage, gate)
    }

    #[tokio::test]
    async fn test_drain_preserves_fifo_order() {
        let (_tmp, storage, gate) = gate().await;
        storage.add_follow_up("job-1", "instruction", "do A").await.unwrap();
        storage.add_follow_up("job-1", "instruction", "then B").await.unwrap();

        match gate.drain_follow_ups("job-1").await.unwrap() {
            FollowUpSignal::Instructions(list) => {
                assert_eq!(list, vec!["do A".to_string(), "then B".to_string()]);
            }
            FollowUpSignal::Abort => panic!("no abort was queued"),
        }
        // Drained instructions are processing, not pending.
        assert!(storage.pending_follow_ups("job-1").await.unwrap().is_empty());
        assert_eq!(gate.mark_applied("job-1").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_abort_short_circuits_drain() {
        let (_tmp, storage, gate) = gate().await;
        storage.add_follow_up("job-1", FOLLOW_UP_ABORT, "").await.unwrap();
        storage.add_follow_up("job-1", "instruction", "never read").await.unwrap();

        assert_eq!(
            gate.drain_follow_ups("job-1").await.unwrap(),
            FollowUpSignal::Abort
        );
        // The later instruction stays pending for a future run.
        assert_eq!(storage.pending_follow_ups("job-1").await.unwrap().len(), 1);
    }
}
