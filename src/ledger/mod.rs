//! Ledger boundary: the capability trait the rest of the crate depends on,
//! plus the value types that cross it.

pub mod bindings;
pub mod contracts;
pub mod events;
pub mod rpc;

#[cfg(test)]
pub mod mock;

use std::time::Duration;

use alloy::primitives::{hex, Log, U256};
use async_trait::async_trait;

use crate::error::{AppError, Result};

pub use alloy::primitives::{Address, Bytes, TxHash};
pub use contracts::{Erc20, InsurancePool, OnChainPolicy, PriceFeed};
pub use rpc::RpcLedger;

/// Lowercase 0x-hex, the form addresses are persisted under. `Display` on
/// [`Address`] is checksummed and must not be used for store keys.
pub fn address_key(address: &Address) -> String {
    hex::encode_prefixed(address.as_slice())
}

/// Parses a user-supplied address in any letter case.
pub fn parse_address(raw: &str) -> Result<Address> {
    raw.trim()
        .parse::<Address>()
        .map_err(|e| AppError::BadRequest(format!("invalid address {raw}: {e}")))
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// One mined contract log together with its position in the chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub inner: Log,
    pub block_number: u64,
    pub log_index: u64,
    pub tx_hash: TxHash,
}

impl LogEntry {
    pub fn address(&self) -> Address {
        self.inner.address
    }
}

/// A state-changing call. Nonce, gas price and gas limit are always set by
/// the caller right before submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxRequest {
    pub from: Address,
    pub to: Address,
    pub data: Bytes,
    pub gas: u64,
    pub gas_price: u128,
    pub nonce: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxReceipt {
    pub tx_hash: TxHash,
    pub block_number: u64,
    pub success: bool,
    pub gas_used: u64,
}

// ---------------------------------------------------------------------------
// Capability
// ---------------------------------------------------------------------------

#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Current chain head height.
    async fn block_number(&self) -> Result<u64>;

    /// Timestamp (unix seconds) of the block at `height`.
    async fn block_timestamp(&self, height: u64) -> Result<u64>;

    /// Read-only contract call against the latest state.
    async fn call(&self, to: Address, data: Bytes) -> Result<Bytes>;

    /// Logs emitted by `address` in the inclusive range `[from, to]`.
    /// Entries the node returns in a malformed shape are dropped with a warning.
    async fn get_logs(&self, address: Address, from: u64, to: u64) -> Result<Vec<LogEntry>>;

    async fn pending_nonce(&self, account: Address) -> Result<u64>;

    async fn suggest_gas_price(&self) -> Result<u128>;

    /// Signs with the local key for `tx.from` and broadcasts.
    async fn send_transaction(&self, tx: TxRequest) -> Result<TxHash>;

    /// Waits until the transaction is mined, or fails with
    /// [`AppError::Confirmation`] once `timeout` elapses.
    async fn wait_for_receipt(&self, tx_hash: TxHash, timeout: Duration) -> Result<TxReceipt>;
}

// ---------------------------------------------------------------------------
// Fixed-point conversion
// ---------------------------------------------------------------------------

/// Human amount → ledger integer with `decimals` places, rounded half up.
pub fn to_fixed_point(amount: f64, decimals: u32) -> u128 {
    if !amount.is_finite() || amount <= 0.0 {
        return 0;
    }
    (amount * 10f64.powi(decimals as i32) + 0.5).floor() as u128
}

pub fn from_fixed_point(raw: u128, decimals: u32) -> f64 {
    raw as f64 / 10f64.powi(decimals as i32)
}

/// Narrows a 256-bit ABI value; amounts past u128 are treated as malformed.
pub fn narrow_u128(v: U256, what: &str) -> Result<u128> {
    u128::try_from(v).map_err(|_| AppError::Abi(format!("{what} {v} exceeds u128")))
}

pub fn narrow_u64(v: U256, what: &str) -> Result<u64> {
    u64::try_from(v).map_err(|_| AppError::Abi(format!("{what} {v} exceeds u64")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_key_is_lowercase_hex() {
        let a = parse_address("0x00000000000000000000000000000000000000Ab").unwrap();
        assert_eq!(address_key(&a), "0x00000000000000000000000000000000000000ab");
        assert!(!a.is_zero());
        assert!(Address::ZERO.is_zero());
    }

    #[test]
    fn malformed_address_is_bad_request() {
        assert!(matches!(parse_address("0x1234"), Err(AppError::BadRequest(_))));
        assert!(matches!(parse_address("not-hex"), Err(AppError::BadRequest(_))));
    }

    #[test]
    fn fixed_point_rounds_half_up() {
        assert_eq!(to_fixed_point(1000.0, 6), 1_000_000_000);
        assert_eq!(to_fixed_point(2.0000004, 6), 2_000_000);
        assert_eq!(to_fixed_point(2.0000006, 6), 2_000_001);
        assert_eq!(to_fixed_point(-3.0, 6), 0);
        assert_eq!(from_fixed_point(2_500_000, 6), 2.5);
    }

    #[test]
    fn oversized_values_do_not_narrow() {
        assert_eq!(narrow_u64(U256::from(7u64), "id").unwrap(), 7);
        assert!(matches!(narrow_u64(U256::MAX, "id"), Err(AppError::Abi(_))));
        assert!(matches!(narrow_u128(U256::MAX, "amount"), Err(AppError::Abi(_))));
    }
}
