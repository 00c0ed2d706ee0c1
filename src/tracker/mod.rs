//! Issue-tracker seam.
//!
//! The pipeline updates card labels and posts comments opportunistically —
//! when a tracker is wired in and reachable. Absence or failure is never
//! fatal: the tracker mirrors state, it does not own it.

use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, warn};

pub const LABEL_IN_PROGRESS: &str = "pw:in-progress";
pub const LABEL_AWAITING_REVIEW: &str = "pw:awaiting-review";
pub const LABEL_DONE: &str = "pw:done";
pub const LABEL_FAILED: &str = "pw:failed";

#[async_trait]
pub trait IssueTracker: Send + Sync {
    async fn set_label(&self, card_id: &str, label: &str) -> Result<()>;
    async fn comment(&self, card_id: &str, body: &str) -> Result<()>;
}

/// Tracker used when no issue-tracker integration is configured.
pub struct NoopTracker;

#[async_trait]
impl IssueTracker for NoopTracker {
    async fn set_label(&self, card_id: &str, label: &str) -> Result<()> {
        debug!(card_id, label, "no tracker configured — label not mirrored");
        Ok(())
    }

    async fn comment(&self, card_id: &str, _body: &str) -> Result<()> {
        debug!(card_id, "no tracker configured — comment dropped");
        Ok(())
    }
}

/// Best-effort label update. Failures are warnings, never errors.
pub async fn try_set_label(tracker: &dyn IssueTracker, card_id: &str, label: &str) {
    if let Err(e) = tracker.set_label(card_id, label).await {
        warn!(card_id, label, err = %e, "tracker label update failed — continuing");
    }
}

/// Best-effort comment. Failures are warnings, never errors.
pub async fn try_comment(tracker: &dyn IssueTracker, card_id: &str, body: &str) {
    if let Err(e) = tracker.comment(card_id, body).await {
        warn!(card_id, err = %e, "tracker comment failed — continuing");
    }
}
