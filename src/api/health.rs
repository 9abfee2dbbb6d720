//! Shared health state for the /health endpoint.
//! Updated by the monitor, settlement worker and synchronizers.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};

use dashmap::DashMap;
use serde::Serialize;

/// Last observed state of one log watcher.
#[derive(Debug, Clone, Default, Serialize)]
pub struct WatcherStatus {
    pub checkpoint: u64,
    pub head: u64,
    pub last_run_at: i64,
    pub last_error: Option<String>,
}

/// Shared health metrics. Updated by pipeline components, read by API.
#[derive(Default)]
pub struct HealthState {
    /// False after a ledger call fails, true again after one succeeds.
    pub ledger_reachable: AtomicBool,
    /// Unix seconds of the last settled payout (0 = none).
    pub last_payout_at: AtomicI64,
    pub payouts_sent: AtomicU64,
    pub payouts_failed: AtomicU64,
    /// watched address → status
    pub watchers: DashMap<String, WatcherStatus>,
}

impl HealthState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_ledger_reachable(&self, v: bool) {
        self.ledger_reachable.store(v, Ordering::Relaxed);
    }

    pub fn ledger_reachable(&self) -> bool {
        self.ledger_reachable.load(Ordering::Relaxed)
    }

    pub fn set_last_payout_at(&self, secs: i64) {
        self.last_payout_at.store(secs, Ordering::Relaxed);
    }

    pub fn last_payout_at(&self) -> i64 {
        self.last_payout_at.load(Ordering::Relaxed)
    }

    pub fn inc_payouts_sent(&self) {
        self.payouts_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn payouts_sent(&self) -> u64 {
        self.payouts_sent.load(Ordering::Relaxed)
    }

    pub fn inc_payouts_failed(&self) {
        self.payouts_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn payouts_failed(&self) -> u64 {
        self.payouts_failed.load(Ordering::Relaxed)
    }

    pub fn record_watcher(&self, address: &str, status: WatcherStatus) {
        self.watchers.insert(address.to_string(), status);
    }

    pub fn watcher_snapshot(&self) -> Vec<(String, WatcherStatus)> {
        let mut out: Vec<_> = self
            .watchers
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }
}
