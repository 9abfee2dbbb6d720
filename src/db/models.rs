/// Write-side row shapes and aggregate query results.
/// Read-side rows live in `crate::types` since the API serializes them as-is.
use serde::Serialize;

use crate::types::PolicyStatus;

/// A policy as seen on the ledger, keyed by (user_address, purchase_time).
#[derive(Debug, Clone)]
pub struct NewPolicy {
    pub user_address: String,
    pub onchain_id: Option<i64>,
    pub premium: f64,
    pub coverage_amount: f64,
    pub purchase_time: i64,
    pub expiry_time: i64,
    /// None keeps the stored status (or `active` for a new row).
    pub status: Option<PolicyStatus>,
    pub tx_hash: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewPayout {
    pub policy_id: Option<i64>,
    pub user_address: String,
    pub amount: f64,
    pub anomaly_event_id: Option<i64>,
    pub onchain_policy_id: Option<i64>,
    pub tx_hash: String,
    pub executed_at: i64,
}

#[derive(Debug, Clone, Default, Serialize, sqlx::FromRow)]
pub struct SystemStats {
    pub total_prices: i64,
    pub total_anomalies: i64,
    pub total_policies: i64,
    pub active_policies: i64,
    pub total_payouts: i64,
    pub total_paid_out: f64,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct CheckpointRow {
    pub contract_address: String,
    pub last_synced_block: i64,
    pub updated_at: i64,
}
