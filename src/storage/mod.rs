//! SQLite-backed record store (WAL mode — crash-safe worktree bookkeeping).
//!
//! All cross-task coordination goes through this store: worktree records
//! with their time-bounded locks, plan approvals, and follow-up
//! instructions. Lock acquisition is a single guarded `UPDATE` so the
//! check-expiry-then-set sequence is indivisible at the database level —
//! there is deliberately no in-process lock table to get out of sync.

use std::path::Path;
use std::str::FromStr;

use anyhow::{anyhow, Context as _, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::{sqlite::SqliteConnectOptions, ConnectOptions, SqlitePool};
use uuid::Uuid;

/// Default timeout for individual SQLite queries.
/// Prevents hung queries from blocking the daemon indefinitely.
const QUERY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// Execute a future with the standard query timeout.
async fn with_timeout<T>(fut: impl std::future::Future<Output = Result<T>>) -> Result<T> {
    match tokio::time::timeout(QUERY_TIMEOUT, fut).await {
        Ok(result) => result,
        Err(_) => Err(anyhow!(
            "database query timed out after {}s",
            QUERY_TIMEOUT.as_secs()
        )),
    }
}

fn now_ts() -> i64 {
    Utc::now().timestamp()
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

// ─── Status enums ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorktreeStatus {
    Creating,
    Running,
    Ready,
    CleanupPending,
    Cleaned,
    Error,
}

impl WorktreeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorktreeStatus::Creating => "creating",
            WorktreeStatus::Running => "running",
            WorktreeStatus::Ready => "ready",
            WorktreeStatus::CleanupPending => "cleanup_pending",
            WorktreeStatus::Cleaned => "cleaned",
            WorktreeStatus::Error => "error",
        }
    }

    /// Terminal records no longer occupy a path or branch.
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorktreeStatus::Cleaned | WorktreeStatus::Error)
    }
}

impl FromStr for WorktreeStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "creating" => WorktreeStatus::Creating,
            "running" => WorktreeStatus::Running,
            "ready" => WorktreeStatus::Ready,
            "cleanup_pending" => WorktreeStatus::CleanupPending,
            "cleaned" => WorktreeStatus::Cleaned,
            "error" => WorktreeStatus::Error,
            other => return Err(anyhow!("unknown worktree status: {other}")),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    Skipped,
}

impl ApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalStatus::Pending => "pending",
            ApprovalStatus::Approved => "approved",
            ApprovalStatus::Rejected => "rejected",
            ApprovalStatus::Skipped => "skipped",
        }
    }
}

impl FromStr for ApprovalStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "pending" => ApprovalStatus::Pending,
            "approved" => ApprovalStatus::Approved,
            "rejected" => ApprovalStatus::Rejected,
            "skipped" => ApprovalStatus::Skipped,
            other => return Err(anyhow!("unknown approval status: {other}")),
        })
    }
}

// ─── Row types ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct WorktreeRecordRow {
    pub id: String,
    pub project_id: String,
    pub card_id: String,
    pub job_id: Option<String>,
    /// Main repository checkout the worktree belongs to.
    pub repo_path: String,
    pub worktree_path: String,
    pub branch_name: String,
    pub base_ref: String,
    pub status: String,
    pub locked_by: Option<String>,
    /// Epoch seconds; the lock is live only while `now < lock_expires_at`.
    pub lock_expires_at: Option<i64>,
    pub last_error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl WorktreeRecordRow {
    pub fn status(&self) -> WorktreeStatus {
        self.status.parse().unwrap_or(WorktreeStatus::Error)
    }

    /// An expired lock is equivalent to no lock.
    pub fn lock_is_live(&self, now: i64) -> bool {
        self.locked_by.is_some() && self.lock_expires_at.map(|t| now < t).unwrap_or(false)
    }
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct PlanApprovalRow {
    pub id: String,
    pub job_id: String,
    pub card_id: String,
    pub project_id: String,
    pub plan: String,
    pub planning_mode: String,
    pub status: String,
    pub created_at: String,
    pub updated_at: String,
}

impl PlanApprovalRow {
    pub fn status(&self) -> ApprovalStatus {
        self.status.parse().unwrap_or(ApprovalStatus::Pending)
    }
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct FollowUpRow {
    pub id: String,
    pub job_id: String,
    pub kind: String,
    pub content: String,
    pub status: String,
    pub created_at: String,
}

// ─── Storage ─────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct Storage {
    pool: SqlitePool,
}

impl Storage {
    pub async fn new(data_dir: &Path) -> Result<Self> {
        Self::new_with_slow_query(data_dir, 0).await
    }

    /// Create storage with slow-query logging enabled.
    ///
    /// `slow_query_ms` is the threshold in milliseconds — queries exceeding
    /// it are logged at WARN level. Set to 0 to disable.
    pub async fn new_with_slow_query(data_dir: &Path, slow_query_ms: u64) -> Result<Self> {
        tokio::fs::create_dir_all(data_dir).await?;
        let db_path = data_dir.join("patchwork.db");
        let mut opts =
            SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", db_path.display()))?
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
                .create_if_missing(true);

        if slow_query_ms > 0 {
            opts = opts.log_slow_statements(
                log::LevelFilter::Warn,
                std::time::Duration::from_millis(slow_query_ms),
            );
        }

        let pool = SqlitePool::connect_with(opts).await?;
        Self::migrate(&pool).await?;
        Ok(Self { pool })
    }

    /// Return a clone of the connection pool (cheap — Arc-backed).
    pub fn pool(&self) -> SqlitePool {
        self.pool.clone()
    }

    async fn migrate(pool: &SqlitePool) -> Result<()> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS worktrees (
                id TEXT PRIMARY KEY,
                project_id TEXT NOT NULL,
                card_id TEXT NOT NULL,
                job_id TEXT,
                repo_path TEXT NOT NULL,
                worktree_path TEXT NOT NULL,
                branch_name TEXT NOT NULL,
                base_ref TEXT NOT NULL,
                status TEXT NOT NULL,
                locked_by TEXT,
                lock_expires_at INTEGER,
                last_error TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_worktrees_live_path
                ON worktrees(project_id, worktree_path)
                WHERE status NOT IN ('cleaned', 'error');
            CREATE UNIQUE INDEX IF NOT EXISTS idx_worktrees_live_branch
                ON worktrees(project_id, branch_name)
                WHERE status NOT IN ('cleaned', 'error');
            CREATE INDEX IF NOT EXISTS idx_worktrees_card
                ON worktrees(project_id, card_id);

            CREATE TABLE IF NOT EXISTS plan_approvals (
                id TEXT PRIMARY KEY,
                job_id TEXT NOT NULL UNIQUE,
                card_id TEXT NOT NULL,
                project_id TEXT NOT NULL,
                plan TEXT NOT NULL,
                planning_mode TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS follow_ups (
                id TEXT PRIMARY KEY,
                job_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                content TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_follow_ups_job
                ON follow_ups(job_id, status, created_at);
            ",
        )
        .execute(pool)
        .await
        .context("creating patchwork tables")?;
        Ok(())
    }

    // ─── Worktree records ────────────────────────────────────────────────────

    /// Insert a new record in `creating` with the lock pre-set.
    ///
    /// Creation and locking are one write, so there is no window where a
    /// second job could claim the same path. The partial unique indexes on
    /// `(project_id, worktree_path)` / `(project_id, branch_name)` reject a
    /// duplicate live record at the database level.
    #[allow(clippy::too_many_arguments)]
    pub async fn create_worktree_record(
        &self,
        project_id: &str,
        card_id: &str,
        job_id: Option<&str>,
        repo_path: &str,
        worktree_path: &str,
        branch_name: &str,
        base_ref: &str,
        locked_by: &str,
        lock_ttl_secs: u64,
    ) -> Result<WorktreeRecordRow> {
        let id = Uuid::new_v4().to_string();
        let now = now_rfc3339();
        let expires = now_ts() + lock_ttl_secs as i64;
        with_timeout(async {
            sqlx::query(
                "INSERT INTO worktrees
                   (id, project_id, card_id, job_id, repo_path, worktree_path, branch_name, base_ref,
                    status, locked_by, lock_expires_at, created_at, updated_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, 'creating', ?, ?, ?, ?)",
            )
            .bind(&id)
            .bind(project_id)
            .bind(card_id)
            .bind(job_id)
            .bind(repo_path)
            .bind(worktree_path)
            .bind(branch_name)
            .bind(base_ref)
            .bind(locked_by)
            .bind(expires)
            .bind(&now)
            .bind(&now)
            .execute(&self.pool)
            .await
            .context("inserting worktree record")?;
            Ok(())
        })
        .await?;
        self.get_worktree(&id)
            .await?
            .ok_or_else(|| anyhow!("worktree record not found after insert"))
    }

    pub async fn get_worktree(&self, id: &str) -> Result<Option<WorktreeRecordRow>> {
        let row = sqlx::query_as::<_, WorktreeRecordRow>("SELECT * FROM worktrees WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    /// Most recent non-terminal record for a card, if any.
    pub async fn find_active_for_card(
        &self,
        project_id: &str,
        card_id: &str,
    ) -> Result<Option<WorktreeRecordRow>> {
        let row = sqlx::query_as::<_, WorktreeRecordRow>(
            "SELECT * FROM worktrees
             WHERE project_id = ? AND card_id = ?
               AND status NOT IN ('cleaned', 'error')
             ORDER BY created_at DESC LIMIT 1",
        )
        .bind(project_id)
        .bind(card_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn find_active_for_branch(
        &self,
        project_id: &str,
        branch_name: &str,
    ) -> Result<Option<WorktreeRecordRow>> {
        let row = sqlx::query_as::<_, WorktreeRecordRow>(
            "SELECT * FROM worktrees
             WHERE project_id = ? AND branch_name = ?
               AND status NOT IN ('cleaned', 'error')
             LIMIT 1",
        )
        .bind(project_id)
        .bind(branch_name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// All non-terminal records for a project.
    pub async fn list_active(&self, project_id: &str) -> Result<Vec<WorktreeRecordRow>> {
        with_timeout(async {
            let rows = sqlx::query_as::<_, WorktreeRecordRow>(
                "SELECT * FROM worktrees
                 WHERE project_id = ? AND status NOT IN ('cleaned', 'error')
                 ORDER BY created_at",
            )
            .bind(project_id)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        })
        .await
    }

    pub async fn list_by_status(
        &self,
        project_id: &str,
        status: WorktreeStatus,
    ) -> Result<Vec<WorktreeRecordRow>> {
        let rows = sqlx::query_as::<_, WorktreeRecordRow>(
            "SELECT * FROM worktrees WHERE project_id = ? AND status = ? ORDER BY created_at",
        )
        .bind(project_id)
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Count of records occupying a worktree path (the concurrency cap input).
    pub async fn count_active(&self, project_id: &str) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM worktrees
             WHERE project_id = ? AND status NOT IN ('cleaned', 'error')",
        )
        .bind(project_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    pub async fn set_status(&self, id: &str, status: WorktreeStatus) -> Result<()> {
        sqlx::query("UPDATE worktrees SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(now_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Transition to `error`, retaining the message for inspection.
    pub async fn set_error(&self, id: &str, message: &str) -> Result<()> {
        sqlx::query(
            "UPDATE worktrees SET status = 'error', last_error = ?, updated_at = ? WHERE id = ?",
        )
        .bind(message)
        .bind(now_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ─── Locks ───────────────────────────────────────────────────────────────

    /// Atomic lock acquisition: succeeds iff no live lock is held by another
    /// worker. Re-acquisition by the current holder extends the TTL.
    pub async fn try_acquire_lock(
        &self,
        id: &str,
        worker: &str,
        ttl_secs: u64,
    ) -> Result<bool> {
        let now = now_ts();
        let expires = now + ttl_secs as i64;
        let result = sqlx::query(
            "UPDATE worktrees
             SET locked_by = ?, lock_expires_at = ?, updated_at = ?
             WHERE id = ?
               AND (locked_by IS NULL
                    OR locked_by = ?
                    OR lock_expires_at IS NULL
                    OR lock_expires_at <= ?)",
        )
        .bind(worker)
        .bind(expires)
        .bind(now_rfc3339())
        .bind(id)
        .bind(worker)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Extend the lock — only while `worker` still holds it.
    pub async fn renew_lock(&self, id: &str, worker: &str, ttl_secs: u64) -> Result<bool> {
        let expires = now_ts() + ttl_secs as i64;
        let result = sqlx::query(
            "UPDATE worktrees
             SET lock_expires_at = ?, updated_at = ?
             WHERE id = ? AND locked_by = ?",
        )
        .bind(expires)
        .bind(now_rfc3339())
        .bind(id)
        .bind(worker)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Release the lock held by `worker`. A no-op if someone else holds it.
    pub async fn release_lock(&self, id: &str, worker: &str) -> Result<()> {
        sqlx::query(
            "UPDATE worktrees
             SET locked_by = NULL, lock_expires_at = NULL, updated_at = ?
             WHERE id = ? AND locked_by = ?",
        )
        .bind(now_rfc3339())
        .bind(id)
        .bind(worker)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Forced release, holder ignored. Reconciler-only, after TTL expiry.
    pub async fn force_release_lock(&self, id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE worktrees
             SET locked_by = NULL, lock_expires_at = NULL, updated_at = ?
             WHERE id = ?",
        )
        .bind(now_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Non-terminal records whose lock has expired.
    pub async fn list_expired_locks(&self, project_id: &str) -> Result<Vec<WorktreeRecordRow>> {
        let rows = sqlx::query_as::<_, WorktreeRecordRow>(
            "SELECT * FROM worktrees
             WHERE project_id = ?
               AND status NOT IN ('cleaned', 'error')
               AND locked_by IS NOT NULL
               AND lock_expires_at IS NOT NULL
               AND lock_expires_at <= ?",
        )
        .bind(project_id)
        .bind(now_ts())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    // ─── Plan approvals ──────────────────────────────────────────────────────

    pub async fn get_approval_for_job(&self, job_id: &str) -> Result<Option<PlanApprovalRow>> {
        let row = sqlx::query_as::<_, PlanApprovalRow>(
            "SELECT * FROM plan_approvals WHERE job_id = ?",
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn get_approval(&self, id: &str) -> Result<Option<PlanApprovalRow>> {
        let row =
            sqlx::query_as::<_, PlanApprovalRow>("SELECT * FROM plan_approvals WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row)
    }

    pub async fn create_approval(
        &self,
        job_id: &str,
        card_id: &str,
        project_id: &str,
        plan: &str,
        planning_mode: &str,
    ) -> Result<PlanApprovalRow> {
        let id = Uuid::new_v4().to_string();
        let now = now_rfc3339();
        sqlx::query(
            "INSERT INTO plan_approvals
               (id, job_id, card_id, project_id, plan, planning_mode, status, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, 'pending', ?, ?)",
        )
        .bind(&id)
        .bind(job_id)
        .bind(card_id)
        .bind(project_id)
        .bind(plan)
        .bind(planning_mode)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await
        .context("inserting plan approval")?;
        self.get_approval(&id)
            .await?
            .ok_or_else(|| anyhow!("approval not found after insert"))
    }

    /// Move a pending approval to a terminal status. Returns `false` when the
    /// record was not pending (terminal statuses are immutable).
    pub async fn resolve_approval(&self, id: &str, status: ApprovalStatus) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE plan_approvals SET status = ?, updated_at = ?
             WHERE id = ? AND status = 'pending'",
        )
        .bind(status.as_str())
        .bind(now_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    // ─── Follow-up instructions ──────────────────────────────────────────────

    pub async fn add_follow_up(&self, job_id: &str, kind: &str, content: &str) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO follow_ups (id, job_id, kind, content, status, created_at)
             VALUES (?, ?, ?, ?, 'pending', ?)",
        )
        .bind(&id)
        .bind(job_id)
        .bind(kind)
        .bind(content)
        .bind(now_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(id)
    }

    /// Pending instructions for a job, oldest first.
    pub async fn pending_follow_ups(&self, job_id: &str) -> Result<Vec<FollowUpRow>> {
        let rows = sqlx::query_as::<_, FollowUpRow>(
            "SELECT * FROM follow_ups
             WHERE job_id = ? AND status = 'pending'
             ORDER BY created_at",
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn set_follow_up_status(&self, id: &str, status: &str) -> Result<()> {
        sqlx::query("UPDATE follow_ups SET status = ? WHERE id = ?")
            .bind(status)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Mark every `processing` instruction for a job as consumed.
    pub async fn mark_follow_ups_applied(&self, job_id: &str) -> Result<u64> {
        let result =
            sqlx::query("UPDATE follow_ups SET status = 'applied' WHERE job_id = ? AND status = 'processing'")
                .bind(job_id)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn test_storage() -> (TempDir, Storage) {
        let tmp = TempDir::new().expect("tempdir");
        let storage = Storage::new(tmp.path()).await.expect("storage");
        (tmp, storage)
    }

    async fn insert_record(storage: &Storage, card: &str, worker: &str) -> WorktreeRecordRow {
        storage
            .create_worktree_record(
                "proj-1",
                card,
                Some("job-1"),
                "/tmp/repo",
                &format!("/tmp/wt/{card}"),
                &format!("patchwork/{card}"),
                "abc123",
                worker,
                300,
            )
            .await
            .expect("create record")
    }

    #[tokio::test]
    async fn test_create_sets_lock_atomically() {
        let (_tmp, storage) = test_storage().await;
        let rec = insert_record(&storage, "card-1", "worker-a").await;
        assert_eq!(rec.status(), WorktreeStatus::Creating);
        assert_eq!(rec.locked_by.as_deref(), Some("worker-a"));
        assert!(rec.lock_is_live(now_ts()));
    }

    #[tokio::test]
    async fn test_duplicate_live_branch_rejected() {
        let (_tmp, storage) = test_storage().await;
        insert_record(&storage, "card-1", "worker-a").await;
        // Same branch+path, still live — the partial unique index fires.
        let dup = storage
            .create_worktree_record(
                "proj-1",
                "card-1",
                None,
                "/tmp/repo",
                "/tmp/wt/card-1",
                "patchwork/card-1",
                "abc123",
                "worker-b",
                300,
            )
            .await;
        assert!(dup.is_err());
    }

    #[tokio::test]
    async fn test_terminal_record_frees_branch_for_reuse() {
        let (_tmp, storage) = test_storage().await;
        let rec = insert_record(&storage, "card-1", "worker-a").await;
        storage.set_status(&rec.id, WorktreeStatus::Cleaned).await.unwrap();
        // Branch/path free again once the old record is terminal.
        insert_record(&storage, "card-1", "worker-b").await;
    }

    #[tokio::test]
    async fn test_lock_exclusive_while_live() {
        let (_tmp, storage) = test_storage().await;
        let rec = insert_record(&storage, "card-1", "worker-a").await;
        let stolen = storage
            .try_acquire_lock(&rec.id, "worker-b", 300)
            .await
            .unwrap();
        assert!(!stolen, "live lock must not be stolen");
        // The holder can re-acquire (TTL extension).
        let renewed = storage
            .try_acquire_lock(&rec.id, "worker-a", 300)
            .await
            .unwrap();
        assert!(renewed);
    }

    #[tokio::test]
    async fn test_concurrent_acquires_one_winner() {
        let (_tmp, storage) = test_storage().await;
        let rec = insert_record(&storage, "card-1", "worker-a").await;
        storage.release_lock(&rec.id, "worker-a").await.unwrap();

        let (a, b) = tokio::join!(
            storage.try_acquire_lock(&rec.id, "worker-x", 300),
            storage.try_acquire_lock(&rec.id, "worker-y", 300),
        );
        let wins = [a.unwrap(), b.unwrap()].iter().filter(|w| **w).count();
        assert_eq!(wins, 1, "exactly one concurrent acquire may win");
    }

    #[tokio::test]
    async fn test_expired_lock_is_reclaimable() {
        let (_tmp, storage) = test_storage().await;
        let rec = insert_record(&storage, "card-1", "worker-a").await;
        // Force the lock into the past.
        sqlx::query("UPDATE worktrees SET lock_expires_at = ? WHERE id = ?")
            .bind(now_ts() - 10)
            .bind(&rec.id)
            .execute(&storage.pool)
            .await
            .unwrap();

        let expired = storage.list_expired_locks("proj-1").await.unwrap();
        assert_eq!(expired.len(), 1);

        // A different identity acquires without an explicit release.
        let taken = storage
            .try_acquire_lock(&rec.id, "worker-b", 300)
            .await
            .unwrap();
        assert!(taken);
    }

    #[tokio::test]
    async fn test_renew_only_for_holder() {
        let (_tmp, storage) = test_storage().await;
        let rec = insert_record(&storage, "card-1", "worker-a").await;
        assert!(storage.renew_lock(&rec.id, "worker-a", 300).await.unwrap());
        assert!(!storage.renew_lock(&rec.id, "worker-b", 300).await.unwrap());
    }

    #[tokio::test]
    async fn test_release_is_holder_scoped() {
        let (_tmp, storage) = test_storage().await;
        let rec = insert_record(&storage, "card-1", "worker-a").await;
        // Wrong holder: no-op.
        storage.release_lock(&rec.id, "worker-b").await.unwrap();
        let rec = storage.get_worktree(&rec.id).await.unwrap().unwrap();
        assert_eq!(rec.locked_by.as_deref(), Some("worker-a"));
        // Right holder: released.
        storage.release_lock(&rec.id, "worker-a").await.unwrap();
        let rec = storage.get_worktree(&rec.id).await.unwrap().unwrap();
        assert!(rec.locked_by.is_none());
    }

    #[tokio::test]
    async fn test_count_active_excludes_terminal() {
        let (_tmp, storage) = test_storage().await;
        let a = insert_record(&storage, "card-1", "w").await;
        insert_record(&storage, "card-2", "w").await;
        assert_eq!(storage.count_active("proj-1").await.unwrap(), 2);
        storage.set_error(&a.id, "boom").await.unwrap();
        assert_eq!(storage.count_active("proj-1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_approval_terminal_is_immutable() {
        let (_tmp, storage) = test_storage().await;
        let approval = storage
            .create_approval("job-1", "card-1", "proj-1", "the plan", "require_approval")
            .await
            .unwrap();
        assert_eq!(approval.status(), ApprovalStatus::Pending);
        assert!(storage
            .resolve_approval(&approval.id, ApprovalStatus::Approved)
            .await
            .unwrap());
        // Already terminal — second resolve is refused.
        assert!(!storage
            .resolve_approval(&approval.id, ApprovalStatus::Rejected)
            .await
            .unwrap());
        let row = storage.get_approval(&approval.id).await.unwrap().unwrap();
        assert_eq!(row.status(), ApprovalStatus::Approved);
    }

    #[tokio::test]
    async fn test_follow_up_fifo_and_lifecycle() {
        let (_tmp, storage) = test_storage().await;
        storage.add_follow_up("job-1", "instruction", "first").await.unwrap();
        storage.add_follow_up("job-1", "instruction", "second").await.unwrap();

        let pending = storage.pending_follow_ups("job-1").await.unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].content, "first");

        storage
            .set_follow_up_status(&pending[0].id, "processing")
            .await
            .unwrap();
        assert_eq!(storage.pending_follow_ups("job-1").await.unwrap().len(), 1);

        let applied = storage.mark_follow_ups_applied("job-1").await.unwrap();
        assert_eq!(applied, 1);
    }
}
