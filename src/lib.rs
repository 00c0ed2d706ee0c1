pub mod approval;
pub mod config;
pub mod events;
pub mod git;
pub mod pipeline;
pub mod storage;
pub mod tracker;
pub mod worktree;

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use uuid::Uuid;

use approval::ApprovalGate;
use config::DaemonConfig;
use events::EventBroadcaster;
use git::GitGateway;
use storage::Storage;
use worktree::{Reconciler, WorktreeLifecycleManager};

/// Shared application state passed to CLI handlers and background tasks.
///
/// There is deliberately no "current project" in here — every operation
/// takes its repository and project explicitly.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<DaemonConfig>,
    pub storage: Arc<Storage>,
    pub broadcaster: Arc<EventBroadcaster>,
    pub gateway: Arc<GitGateway>,
    /// Opaque identity this process uses as lock holder.
    pub worker_id: String,
}

impl AppContext {
    pub async fn init(config: DaemonConfig) -> Result<Self> {
        let storage = Arc::new(
            Storage::new_with_slow_query(
                &config.data_dir,
                config.observability.slow_query_threshold_ms,
            )
            .await?,
        );
        Ok(Self {
            config: Arc::new(config),
            storage,
            broadcaster: Arc::new(EventBroadcaster::new()),
            gateway: Arc::new(GitGateway::new()),
            worker_id: Uuid::new_v4().to_string(),
        })
    }

    /// Lifecycle manager bound to one repository's effective settings.
    pub fn lifecycle_manager(&self, repo_path: &Path) -> WorktreeLifecycleManager {
        WorktreeLifecycleManager::new(
            self.storage.clone(),
            self.gateway.clone(),
            self.broadcaster.clone(),
            self.config.worktree_for(repo_path),
            self.worker_id.clone(),
        )
    }

    /// Reconciler bound to one repository's effective settings.
    pub fn reconciler(&self, repo_path: &Path) -> Reconciler {
        Reconciler::new(
            self.storage.clone(),
            self.gateway.clone(),
            self.broadcaster.clone(),
            self.config.worktree_for(repo_path),
        )
    }

    pub fn approval_gate(&self) -> ApprovalGate {
        ApprovalGate::new(self.storage.clone(), self.broadcaster.clone())
    }
}
