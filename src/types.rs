use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::ledger::TxHash;

pub fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

// ---------------------------------------------------------------------------
// Prices
// ---------------------------------------------------------------------------

/// One OHLCV sample. `timestamp` is the bucket start in unix seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Candle {
    pub timestamp: i64,
    pub symbol: String,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

// ---------------------------------------------------------------------------
// Anomalies
// ---------------------------------------------------------------------------

/// Output of a detection strategy, not yet persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct Anomaly {
    pub timestamp: i64,
    pub symbol: String,
    pub strategy: &'static str,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub body_ratio: f64,
    pub range_ratio: f64,
}

/// A persisted anomaly. Only `settled_at` changes after the row is written.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct AnomalyEvent {
    pub id: i64,
    pub timestamp: i64,
    pub symbol: String,
    pub strategy: String,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub body_ratio: f64,
    pub range_ratio: f64,
    pub detected_at: i64,
    /// Set once settlement ran to completion; None means still owed.
    pub settled_at: Option<i64>,
}

// ---------------------------------------------------------------------------
// Policies / payouts / balances
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum PolicyStatus {
    Active,
    Claimed,
    Inactive,
}

impl std::fmt::Display for PolicyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PolicyStatus::Active => "active",
            PolicyStatus::Claimed => "claimed",
            PolicyStatus::Inactive => "inactive",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Policy {
    pub id: i64,
    pub user_address: String,
    /// Index in the user's on-chain policy list, once known.
    pub onchain_id: Option<i64>,
    pub premium: f64,
    pub coverage_amount: f64,
    pub purchase_time: i64,
    pub expiry_time: i64,
    pub status: PolicyStatus,
    pub tx_hash: Option<String>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Payout {
    pub id: i64,
    pub policy_id: Option<i64>,
    pub user_address: String,
    pub amount: f64,
    pub anomaly_event_id: Option<i64>,
    pub onchain_policy_id: Option<i64>,
    pub tx_hash: String,
    pub executed_at: i64,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Balance {
    pub token_address: String,
    pub user_address: String,
    pub balance: f64,
    pub last_updated: i64,
}

// ---------------------------------------------------------------------------
// Settlement results
// ---------------------------------------------------------------------------

/// What happened to one eligible policy during settlement of an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyOutcome {
    Paid { tx_hash: TxHash, onchain_policy_id: u64 },
    /// No active, unclaimed, unexpired entry in the user's on-chain list.
    NoOnChainPolicy,
    InsufficientPool { available: u128, required: u128 },
    Failed { reason: String },
}

#[derive(Debug, Clone, Default)]
pub struct SettlementOutcome {
    pub event_id: i64,
    /// (local policy id, outcome) in processing order. Empty means no eligible policies.
    pub results: Vec<(i64, PolicyOutcome)>,
}

impl SettlementOutcome {
    pub fn is_noop(&self) -> bool {
        self.results
            .iter()
            .all(|(_, o)| !matches!(o, PolicyOutcome::Paid { .. } | PolicyOutcome::Failed { .. }))
    }

    pub fn paid(&self) -> usize {
        self.results
            .iter()
            .filter(|(_, o)| matches!(o, PolicyOutcome::Paid { .. }))
            .count()
    }

    pub fn failed(&self) -> usize {
        self.results
            .iter()
            .filter(|(_, o)| matches!(o, PolicyOutcome::Failed { .. }))
            .count()
    }
}

// ---------------------------------------------------------------------------
// Sync results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncResult {
    /// First and last block scanned, None when already caught up.
    pub range: Option<(u64, u64)>,
    pub chunks: u64,
    pub logs_handled: usize,
    pub logs_skipped: usize,
    /// Checkpoint after this attempt.
    pub checkpoint: u64,
}
