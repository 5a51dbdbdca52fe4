//! Liveness leases of schedulers and task runners.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{RunnerId, SchedulerId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerLease {
    pub scheduler_id: SchedulerId,
    pub domain: String,
    pub poll_interval: Duration,
    pub last_seen: DateTime<Utc>,
    pub expired_at: Option<DateTime<Utc>>,
}

impl SchedulerLease {
    pub fn new(
        scheduler_id: SchedulerId,
        domain: impl Into<String>,
        poll_interval: Duration,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            scheduler_id,
            domain: domain.into(),
            poll_interval,
            last_seen: now,
            expired_at: None,
        }
    }

    pub fn is_stale(&self, now: DateTime<Utc>, adjust: Duration) -> bool {
        self.expired_at.is_none() && is_stale(self.last_seen, now, adjust)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerLease {
    pub runner_id: RunnerId,
    pub domain: String,
    pub heartbeat_interval: Duration,
    pub last_seen: DateTime<Utc>,
    pub expired_at: Option<DateTime<Utc>>,
}

impl RunnerLease {
    pub fn new(
        runner_id: RunnerId,
        domain: impl Into<String>,
        heartbeat_interval: Duration,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            runner_id,
            domain: domain.into(),
            heartbeat_interval,
            last_seen: now,
            expired_at: None,
        }
    }

    pub fn is_stale(&self, now: DateTime<Utc>, adjust: Duration) -> bool {
        self.expired_at.is_none() && is_stale(self.last_seen, now, adjust)
    }

    pub fn is_live(&self) -> bool {
        self.expired_at.is_none()
    }
}

fn is_stale(last_seen: DateTime<Utc>, now: DateTime<Utc>, adjust: Duration) -> bool {
    let adjust = TimeDelta::from_std(adjust).unwrap_or(TimeDelta::MAX);
    now.signed_duration_since(last_seen) > adjust
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_is_stale_only_after_adjust_window() {
        let start = Utc::now();
        let lease = SchedulerLease::new(
            SchedulerId::generate(),
            "default",
            Duration::from_millis(3000),
            start,
        );
        let adjust = Duration::from_millis(3000);

        assert!(!lease.is_stale(start + TimeDelta::milliseconds(3000), adjust));
        assert!(lease.is_stale(start + TimeDelta::milliseconds(3001), adjust));
    }

    #[test]
    fn expired_lease_is_not_reported_again() {
        let start = Utc::now();
        let mut lease = RunnerLease::new(
            RunnerId::generate(),
            "default",
            Duration::from_millis(500),
            start,
        );
        lease.expired_at = Some(start);
        assert!(!lease.is_stale(start + TimeDelta::seconds(60), Duration::from_secs(1)));
        assert!(!lease.is_live());
    }
}
