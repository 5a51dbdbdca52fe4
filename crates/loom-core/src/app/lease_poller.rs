//! LeaseExpirationPoller - 期限切れ lease の回収
//!
//! Runs next to each scheduler. Two loops of the same shape scan the Store for
//! stale scheduler leases and stale task-runner leases of the domain and
//! expire them one at a time:
//!
//! - expiring a scheduler lease orphans its graphs (another scheduler's sweep
//!   claims them)
//! - expiring a runner lease puts its running tasks back to ready
//!
//! Expiry is idempotent in the Store, so several pollers may race on the same
//! lease; only one of them sees `Some`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::domain::{LoomError, SchedulerId};
use crate::ports::TaskGraphStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LeaseKind {
    Scheduler,
    TaskRunner,
}

pub struct LeaseExpirationPoller {
    inner: Arc<PollerInner>,
    shutdown: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

struct PollerInner {
    scheduler_id: SchedulerId,
    domain: String,
    store: Arc<dyn TaskGraphStore>,
    poll_interval: Duration,
    /// Staleness window; the owning scheduler's poll interval.
    lease_adjust: Duration,
    running: AtomicBool,
}

impl LeaseExpirationPoller {
    pub fn new(
        scheduler_id: SchedulerId,
        domain: impl Into<String>,
        store: Arc<dyn TaskGraphStore>,
        poll_interval: Duration,
        lease_adjust: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(PollerInner {
                scheduler_id,
                domain: domain.into(),
                store,
                poll_interval,
                lease_adjust,
                running: AtomicBool::new(false),
            }),
            shutdown: CancellationToken::new(),
            handles: Vec::new(),
        }
    }

    /// Start both loops. `parent` ties the poller to its scheduler: cancelling
    /// it stops the poller too.
    pub fn start(&mut self, parent: &CancellationToken) {
        if self.is_running() {
            return;
        }
        self.shutdown = parent.child_token();
        self.inner.running.store(true, Ordering::SeqCst);

        for kind in [LeaseKind::Scheduler, LeaseKind::TaskRunner] {
            let inner = Arc::clone(&self.inner);
            let shutdown = self.shutdown.clone();
            self.handles
                .push(tokio::spawn(async move { inner.poll(kind, shutdown).await }));
        }
    }

    pub fn stop(&mut self) {
        self.inner.running.store(false, Ordering::SeqCst);
        self.shutdown.cancel();
        self.handles.clear();
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst) && !self.shutdown.is_cancelled()
    }

    /// One scan for stale scheduler leases. Returns how many were expired.
    pub async fn expire_scheduler_leases(&self) -> Result<usize, LoomError> {
        self.inner.scan(LeaseKind::Scheduler).await
    }

    /// One scan for stale task-runner leases. Returns how many were expired.
    pub async fn expire_task_runner_leases(&self) -> Result<usize, LoomError> {
        self.inner.scan(LeaseKind::TaskRunner).await
    }
}

impl Drop for LeaseExpirationPoller {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl PollerInner {
    async fn poll(&self, kind: LeaseKind, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + self.poll_interval,
            self.poll_interval,
        );
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if !self.running.load(Ordering::SeqCst) {
                break;
            }
            if let Err(err) = self.scan(kind).await {
                error!(
                    scheduler_id = %self.scheduler_id,
                    domain = %self.domain,
                    lease_kind = ?kind,
                    error = %err,
                    "failed to find expired leases"
                );
            }
        }
    }

    async fn scan(&self, kind: LeaseKind) -> Result<usize, LoomError> {
        match kind {
            LeaseKind::Scheduler => {
                let ids: Vec<SchedulerId> = self
                    .store
                    .find_expired_scheduler_leases(&self.domain, self.lease_adjust)
                    .await?
                    .into_iter()
                    .map(|lease| lease.scheduler_id)
                    .collect();

                let mut expired = 0;
                for id in ids {
                    match self.store.expire_scheduler_lease(id).await {
                        Ok(Some(_)) => {
                            expired += 1;
                            info!(
                                expired_scheduler_id = %id,
                                scheduler_id = %self.scheduler_id,
                                domain = %self.domain,
                                "found expired lease for scheduler"
                            );
                        }
                        Ok(None) => {}
                        Err(err) => warn!(
                            expired_scheduler_id = %id,
                            scheduler_id = %self.scheduler_id,
                            error = %err,
                            "failed to expire scheduler lease"
                        ),
                    }
                }
                Ok(expired)
            }
            LeaseKind::TaskRunner => {
                let ids: Vec<_> = self
                    .store
                    .find_expired_task_runner_leases(&self.domain, self.lease_adjust)
                    .await?
                    .into_iter()
                    .map(|lease| lease.runner_id)
                    .collect();

                let mut expired = 0;
                for id in ids {
                    match self.store.expire_task_runner_lease(id).await {
                        Ok(Some(_)) => {
                            expired += 1;
                            info!(
                                expired_task_runner_id = %id,
                                scheduler_id = %self.scheduler_id,
                                domain = %self.domain,
                                "found expired lease for task runner"
                            );
                        }
                        Ok(None) => {}
                        Err(err) => warn!(
                            expired_task_runner_id = %id,
                            scheduler_id = %self.scheduler_id,
                            error = %err,
                            "failed to expire task runner lease"
                        ),
                    }
                }
                Ok(expired)
            }
        }
    }
}
