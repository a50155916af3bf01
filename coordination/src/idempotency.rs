//! Fleet-wide job idempotency on top of the cache store.
//!
//! Key scheme for a job kind `K` and entity id `E`:
//! - `lock:{K}:{E}`      — the distributed lock (owner token value).
//! - `execution:{K}:{E}` — hash with execution id, status, phase, progress,
//!   owner instance, and heartbeat timestamp.
//! - `recent:{K}:{E}`    — short-TTL marker written on successful
//!   completion; suppresses duplicates for the dedup window.
//!
//! A worker that dies mid-job stops heartbeating; its lock expires and the
//! next claimer observes the stale heartbeat and proceeds.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use review_domain::JobKind;

use crate::error::{CacheError, CacheResult};
use crate::store::CacheStore;

fn lock_key(kind: JobKind, entity: i64) -> String {
    format!("lock:{}:{}", kind.as_str(), entity)
}

fn execution_key(kind: JobKind, entity: i64) -> String {
    format!("execution:{}:{}", kind.as_str(), entity)
}

fn recent_key(kind: JobKind, entity: i64) -> String {
    format!("recent:{}:{}", kind.as_str(), entity)
}

/// Tunables of the claim protocol. Validated at startup: the lock must
/// outlive three missed heartbeats and must not outlive the job timeout.
#[derive(Debug, Clone)]
pub struct IdempotencyConfig {
    pub lock_ttl: Duration,
    pub heartbeat_interval: Duration,
    pub liveness_window: Duration,
    pub dedup_window: Duration,
    pub execution_timeout: Duration,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            lock_ttl: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(5),
            liveness_window: Duration::from_secs(15),
            dedup_window: Duration::from_secs(300),
            execution_timeout: Duration::from_secs(30 * 60),
        }
    }
}

impl IdempotencyConfig {
    pub fn validate(&self) -> CacheResult<()> {
        if self.lock_ttl < self.heartbeat_interval * 3 {
            return Err(CacheError::Config(format!(
                "lock ttl {:?} must be at least 3x the heartbeat interval {:?}",
                self.lock_ttl, self.heartbeat_interval
            )));
        }
        if self.lock_ttl > self.execution_timeout {
            return Err(CacheError::Config(format!(
                "lock ttl {:?} must not exceed the job execution timeout {:?}",
                self.lock_ttl, self.execution_timeout
            )));
        }
        Ok(())
    }
}

/// Why a claim was not granted. None of these are errors: the queue message
/// is acked and the event logged at info.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    RecentlyCompleted,
    AlreadyRunning,
    LockContested,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SkipReason::RecentlyCompleted => "recently completed",
            SkipReason::AlreadyRunning => "already running",
            SkipReason::LockContested => "lock contested",
        };
        f.write_str(s)
    }
}

/// Result of a claim attempt.
pub enum ClaimOutcome {
    Acquired(ExecutionHandle),
    Skipped(SkipReason),
}

/// Execution status as stored in the hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecStatus {
    fn as_str(self) -> &'static str {
        match self {
            ExecStatus::Running => "Running",
            ExecStatus::Completed => "Completed",
            ExecStatus::Failed => "Failed",
            ExecStatus::Cancelled => "Cancelled",
        }
    }

    fn parse(s: &str) -> Option<ExecStatus> {
        match s {
            "Running" => Some(ExecStatus::Running),
            "Completed" => Some(ExecStatus::Completed),
            "Failed" => Some(ExecStatus::Failed),
            "Cancelled" => Some(ExecStatus::Cancelled),
            _ => None,
        }
    }
}

/// Decoded `execution:{K}:{E}` hash.
#[derive(Debug, Clone)]
pub struct ExecutionState {
    pub execution_id: String,
    pub status: ExecStatus,
    pub phase: String,
    pub progress: u8,
    pub owner_instance: String,
    pub started_at: String,
    pub heartbeat_at_ms: i64,
    pub error: Option<String>,
}

impl ExecutionState {
    fn from_hash(hash: &HashMap<String, String>) -> Option<ExecutionState> {
        let status = ExecStatus::parse(hash.get("status")?.as_str())?;
        Some(ExecutionState {
            execution_id: hash.get("executionId").cloned().unwrap_or_default(),
            status,
            phase: hash.get("phase").cloned().unwrap_or_default(),
            progress: hash
                .get("progress")
                .and_then(|p| p.parse().ok())
                .unwrap_or(0),
            owner_instance: hash.get("ownerInstance").cloned().unwrap_or_default(),
            started_at: hash.get("startedAt").cloned().unwrap_or_default(),
            heartbeat_at_ms: hash
                .get("heartbeatAt")
                .and_then(|p| p.parse().ok())
                .unwrap_or(0),
            error: hash.get("error").cloned(),
        })
    }

    fn heartbeat_is_fresh(&self, liveness_window: Duration) -> bool {
        let age_ms = Utc::now().timestamp_millis() - self.heartbeat_at_ms;
        age_ms >= 0 && (age_ms as u128) < liveness_window.as_millis()
    }
}

/// Claims executions for `(job kind, entity)` pairs and exposes handles that
/// track their progress and liveness.
pub struct IdempotencyService {
    store: Arc<CacheStore>,
    cfg: IdempotencyConfig,
    instance: String,
}

impl IdempotencyService {
    pub fn new(store: Arc<CacheStore>, cfg: IdempotencyConfig, instance: &str) -> CacheResult<Self> {
        cfg.validate()?;
        Ok(Self {
            store,
            cfg,
            instance: instance.to_string(),
        })
    }

    /// Attempt to claim the execution of `(kind, entity)`.
    ///
    /// Protocol: dedup-marker check → liveness check → lock acquisition →
    /// double-check of the first two (another worker may have finished
    /// between the check and the lock) → execution hash write → heartbeat.
    pub async fn claim(&self, kind: JobKind, entity: i64) -> CacheResult<ClaimOutcome> {
        if let Some(reason) = self.pre_check(kind, entity).await? {
            return Ok(ClaimOutcome::Skipped(reason));
        }

        let token = uuid::Uuid::new_v4().to_string();
        let lock = lock_key(kind, entity);
        if !self
            .store
            .acquire_lock(&lock, &token, self.cfg.lock_ttl)
            .await?
        {
            return Ok(ClaimOutcome::Skipped(SkipReason::LockContested));
        }

        // Double-check now that we hold the lock.
        if let Some(reason) = self.pre_check(kind, entity).await? {
            let _ = self.store.release_lock(&lock, &token).await;
            return Ok(ClaimOutcome::Skipped(reason));
        }

        let execution_id = uuid::Uuid::new_v4().to_string();
        let exec_key = execution_key(kind, entity);
        let now_ms = Utc::now().timestamp_millis().to_string();
        let fields: Vec<(&str, String)> = vec![
            ("executionId", execution_id.clone()),
            ("status", ExecStatus::Running.as_str().to_string()),
            ("phase", "Claimed".to_string()),
            ("progress", "0".to_string()),
            ("ownerInstance", self.instance.clone()),
            ("startedAt", Utc::now().to_rfc3339()),
            ("heartbeatAt", now_ms),
        ];
        // The hash must outlive the lock so late observers can still read a
        // terminal status.
        let exec_ttl = self.cfg.execution_timeout + self.cfg.lock_ttl;
        self.store
            .hash_set_multi(&exec_key, &fields, Some(exec_ttl))
            .await?;

        let heartbeat = self.spawn_heartbeat(lock.clone(), exec_key.clone(), token.clone());

        info!(
            job = %kind,
            entity,
            execution = %execution_id,
            "claimed execution"
        );

        Ok(ClaimOutcome::Acquired(ExecutionHandle {
            store: Arc::clone(&self.store),
            kind,
            entity,
            lock_key: lock,
            exec_key,
            token,
            execution_id,
            dedup_window: self.cfg.dedup_window,
            heartbeat,
            settled: false,
        }))
    }

    /// Read the current execution state, if any.
    pub async fn execution_state(
        &self,
        kind: JobKind,
        entity: i64,
    ) -> CacheResult<Option<ExecutionState>> {
        let hash = self.store.hash_get_all(&execution_key(kind, entity)).await?;
        Ok(ExecutionState::from_hash(&hash))
    }

    /// Bounded poll until the execution reaches a terminal status. Returns
    /// `true` when it completed successfully. Used by the composite
    /// analysis job when a child claim is held elsewhere.
    pub async fn await_completion(
        &self,
        kind: JobKind,
        entity: i64,
        timeout: Duration,
    ) -> CacheResult<bool> {
        let deadline = tokio::time::Instant::now() + timeout;
        let poll = Duration::from_millis(250).min(timeout);
        loop {
            match self.execution_state(kind, entity).await? {
                Some(state) if state.status == ExecStatus::Completed => return Ok(true),
                Some(state) if state.status != ExecStatus::Running => return Ok(false),
                // Missing hash with a recent marker means it finished and
                // the hash was evicted; treat as success.
                None => {
                    let recent = self.store.get(&recent_key(kind, entity)).await?;
                    return Ok(recent.is_some());
                }
                _ => {}
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(poll).await;
        }
    }

    async fn pre_check(&self, kind: JobKind, entity: i64) -> CacheResult<Option<SkipReason>> {
        if !self.cfg.dedup_window.is_zero()
            && self.store.get(&recent_key(kind, entity)).await?.is_some()
        {
            return Ok(Some(SkipReason::RecentlyCompleted));
        }
        if let Some(state) = self.execution_state(kind, entity).await? {
            if state.status == ExecStatus::Running
                && state.heartbeat_is_fresh(self.cfg.liveness_window)
            {
                return Ok(Some(SkipReason::AlreadyRunning));
            }
        }
        Ok(None)
    }

    fn spawn_heartbeat(&self, lock: String, exec_key: String, token: String) -> JoinHandle<()> {
        let store = Arc::clone(&self.store);
        let interval = self.cfg.heartbeat_interval;
        let lock_ttl = self.cfg.lock_ttl;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                match store.refresh_lock(&lock, &token, lock_ttl).await {
                    Ok(true) => {
                        let now_ms = Utc::now().timestamp_millis().to_string();
                        if let Err(e) = store.hash_set(&exec_key, "heartbeatAt", &now_ms).await {
                            warn!(key = %exec_key, error = %e, "heartbeat hash update failed");
                        }
                    }
                    Ok(false) => {
                        warn!(key = %lock, "heartbeat found the lock gone or re-owned");
                    }
                    Err(e) => {
                        warn!(key = %lock, error = %e, "heartbeat refresh failed");
                    }
                }
            }
        })
    }
}

/// The right to execute one job. Report progress through it and settle it
/// with [`complete`](ExecutionHandle::complete) or
/// [`fail`](ExecutionHandle::fail); dropping it unsettled records the
/// execution as failed (abandoned by caller).
pub struct ExecutionHandle {
    store: Arc<CacheStore>,
    kind: JobKind,
    entity: i64,
    lock_key: String,
    exec_key: String,
    token: String,
    execution_id: String,
    dedup_window: Duration,
    heartbeat: JoinHandle<()>,
    settled: bool,
}

impl ExecutionHandle {
    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    pub fn job_kind(&self) -> JobKind {
        self.kind
    }

    pub fn entity_id(&self) -> i64 {
        self.entity
    }

    /// Record progress (percent plus a phase label) on the execution hash.
    pub async fn report_progress(&self, percent: u8, phase: &str) -> CacheResult<()> {
        let fields: Vec<(&str, String)> = vec![
            ("progress", percent.min(100).to_string()),
            ("phase", phase.to_string()),
        ];
        self.store
            .hash_set_multi(&self.exec_key, &fields, None)
            .await
    }

    /// Mark the execution completed, arm the dedup marker, and release the
    /// lock.
    pub async fn complete(mut self) -> CacheResult<()> {
        self.settled = true;
        self.heartbeat.abort();
        let fields: Vec<(&str, String)> = vec![
            ("status", ExecStatus::Completed.as_str().to_string()),
            ("progress", "100".to_string()),
        ];
        self.store
            .hash_set_multi(&self.exec_key, &fields, None)
            .await?;
        if !self.dedup_window.is_zero() {
            self.store
                .set(
                    &recent_key(self.kind, self.entity),
                    &Utc::now().to_rfc3339(),
                    Some(self.dedup_window),
                )
                .await?;
        }
        self.store.release_lock(&self.lock_key, &self.token).await?;
        info!(job = %self.kind, entity = self.entity, execution = %self.execution_id, "execution completed");
        Ok(())
    }

    /// Mark the execution failed (or cancelled) and release the lock. No
    /// dedup marker is written, so a retry may run immediately.
    pub async fn fail(mut self, kind: &str, message: &str) -> CacheResult<()> {
        self.settled = true;
        self.heartbeat.abort();
        let status = if kind == "Cancelled" {
            ExecStatus::Cancelled
        } else {
            ExecStatus::Failed
        };
        let fields: Vec<(&str, String)> = vec![
            ("status", status.as_str().to_string()),
            ("error", format!("{kind}: {message}")),
        ];
        self.store
            .hash_set_multi(&self.exec_key, &fields, None)
            .await?;
        self.store.release_lock(&self.lock_key, &self.token).await?;
        info!(
            job = %self.kind,
            entity = self.entity,
            execution = %self.execution_id,
            kind,
            message,
            "execution failed"
        );
        Ok(())
    }
}

impl Drop for ExecutionHandle {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        self.heartbeat.abort();
        debug!(job = %self.kind, entity = self.entity, "execution handle dropped unsettled");
        let Ok(rt) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let store = Arc::clone(&self.store);
        let exec_key = self.exec_key.clone();
        let lock_key = self.lock_key.clone();
        let token = self.token.clone();
        rt.spawn(async move {
            let fields: Vec<(&str, String)> = vec![
                ("status", ExecStatus::Failed.as_str().to_string()),
                ("error", "AbandonedByCaller: handle dropped".to_string()),
            ];
            if let Err(e) = store.hash_set_multi(&exec_key, &fields, None).await {
                warn!(key = %exec_key, error = %e, "failed to mark abandoned execution");
            }
            let _ = store.release_lock(&lock_key, &token).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_cfg() -> IdempotencyConfig {
        IdempotencyConfig {
            lock_ttl: Duration::from_millis(300),
            heartbeat_interval: Duration::from_millis(50),
            liveness_window: Duration::from_millis(150),
            dedup_window: Duration::from_secs(60),
            execution_timeout: Duration::from_secs(5),
        }
    }

    fn service(cfg: IdempotencyConfig) -> (Arc<CacheStore>, IdempotencyService) {
        let store = Arc::new(CacheStore::memory("test:"));
        let svc = IdempotencyService::new(Arc::clone(&store), cfg, "worker-a").unwrap();
        (store, svc)
    }

    #[test]
    fn config_validation_rejects_weak_locks() {
        let cfg = IdempotencyConfig {
            lock_ttl: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(5),
            ..IdempotencyConfig::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = IdempotencyConfig {
            lock_ttl: Duration::from_secs(60),
            execution_timeout: Duration::from_secs(30),
            ..IdempotencyConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[tokio::test]
    async fn complete_then_claim_hits_the_dedup_window() {
        let (_, svc) = service(fast_cfg());

        let handle = match svc.claim(JobKind::AiReview, 42).await.unwrap() {
            ClaimOutcome::Acquired(h) => h,
            ClaimOutcome::Skipped(r) => panic!("unexpected skip: {r}"),
        };
        handle.complete().await.unwrap();

        match svc.claim(JobKind::AiReview, 42).await.unwrap() {
            ClaimOutcome::Skipped(SkipReason::RecentlyCompleted) => {}
            _ => panic!("expected RecentlyCompleted"),
        }
    }

    #[tokio::test]
    async fn concurrent_claim_is_skipped_while_running() {
        let (_, svc) = service(fast_cfg());

        let _handle = match svc.claim(JobKind::AiReview, 7).await.unwrap() {
            ClaimOutcome::Acquired(h) => h,
            ClaimOutcome::Skipped(r) => panic!("unexpected skip: {r}"),
        };

        match svc.claim(JobKind::AiReview, 7).await.unwrap() {
            ClaimOutcome::Skipped(reason) => {
                assert!(matches!(
                    reason,
                    SkipReason::AlreadyRunning | SkipReason::LockContested
                ));
            }
            ClaimOutcome::Acquired(_) => panic!("second claim must not succeed"),
        }
    }

    #[tokio::test]
    async fn failed_execution_allows_immediate_retry() {
        let (_, svc) = service(fast_cfg());

        let handle = match svc.claim(JobKind::RiskAnalysis, 9).await.unwrap() {
            ClaimOutcome::Acquired(h) => h,
            ClaimOutcome::Skipped(r) => panic!("unexpected skip: {r}"),
        };
        handle.fail("PersistenceFailed", "db down").await.unwrap();

        match svc.claim(JobKind::RiskAnalysis, 9).await.unwrap() {
            ClaimOutcome::Acquired(h) => h.complete().await.unwrap(),
            ClaimOutcome::Skipped(r) => panic!("retry should claim, got skip: {r}"),
        }
    }

    #[tokio::test]
    async fn stale_execution_is_taken_over_after_lock_expiry() {
        let (store, svc) = service(fast_cfg());

        // Simulate a dead worker: execution hash says Running, but there is
        // no lock and the heartbeat is old.
        let stale_ms = (Utc::now().timestamp_millis() - 10_000).to_string();
        let fields: Vec<(&str, String)> = vec![
            ("executionId", "dead-worker-exec".to_string()),
            ("status", "Running".to_string()),
            ("phase", "Dispatching".to_string()),
            ("progress", "33".to_string()),
            ("ownerInstance", "worker-dead".to_string()),
            ("startedAt", Utc::now().to_rfc3339()),
            ("heartbeatAt", stale_ms),
        ];
        store
            .hash_set_multi("execution:AIReview:99", &fields, None)
            .await
            .unwrap();

        match svc.claim(JobKind::AiReview, 99).await.unwrap() {
            ClaimOutcome::Acquired(h) => {
                assert_ne!(h.execution_id(), "dead-worker-exec");
                h.complete().await.unwrap();
            }
            ClaimOutcome::Skipped(r) => panic!("stale state must be claimable, got {r}"),
        }
    }

    #[tokio::test]
    async fn heartbeat_keeps_the_lock_alive_past_its_ttl() {
        let (store, svc) = service(fast_cfg());

        let handle = match svc.claim(JobKind::PrSummary, 5).await.unwrap() {
            ClaimOutcome::Acquired(h) => h,
            ClaimOutcome::Skipped(r) => panic!("unexpected skip: {r}"),
        };

        // Sleep past the raw lock TTL; the heartbeat must have refreshed it.
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(
            !store
                .acquire_lock("lock:PRSummary:5", "intruder", Duration::from_secs(1))
                .await
                .unwrap(),
            "lock should still be held by the heartbeating owner"
        );
        handle.complete().await.unwrap();
    }

    #[tokio::test]
    async fn dropped_handle_marks_execution_failed() {
        let (_, svc) = service(fast_cfg());

        {
            let _handle = match svc.claim(JobKind::Comprehensive, 3).await.unwrap() {
                ClaimOutcome::Acquired(h) => h,
                ClaimOutcome::Skipped(r) => panic!("unexpected skip: {r}"),
            };
            // Dropped here without complete/fail.
        }
        // Drop cleanup runs on a spawned task.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let state = svc
            .execution_state(JobKind::Comprehensive, 3)
            .await
            .unwrap()
            .expect("execution hash present");
        assert_eq!(state.status, ExecStatus::Failed);
        assert!(state.error.unwrap_or_default().contains("Abandoned"));
    }

    #[tokio::test]
    async fn progress_is_visible_to_observers() {
        let (_, svc) = service(fast_cfg());

        let handle = match svc.claim(JobKind::AiReview, 11).await.unwrap() {
            ClaimOutcome::Acquired(h) => h,
            ClaimOutcome::Skipped(r) => panic!("unexpected skip: {r}"),
        };
        handle.report_progress(40, "Dispatching(2/5)").await.unwrap();

        let state = svc
            .execution_state(JobKind::AiReview, 11)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state.progress, 40);
        assert_eq!(state.phase, "Dispatching(2/5)");
        handle.complete().await.unwrap();
    }

    #[tokio::test]
    async fn await_completion_observes_a_finishing_job() {
        let (_, svc) = service(fast_cfg());
        let svc = Arc::new(svc);

        let handle = match svc.claim(JobKind::RiskAnalysis, 7).await.unwrap() {
            ClaimOutcome::Acquired(h) => h,
            ClaimOutcome::Skipped(r) => panic!("unexpected skip: {r}"),
        };

        let waiter = {
            let svc = Arc::clone(&svc);
            tokio::spawn(async move {
                svc.await_completion(JobKind::RiskAnalysis, 7, Duration::from_secs(2))
                    .await
                    .unwrap()
            })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.complete().await.unwrap();
        assert!(waiter.await.unwrap());
    }
}
