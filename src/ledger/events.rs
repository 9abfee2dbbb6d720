//! Decoding of the contract events the synchronizer cares about.

use alloy::sol_types::SolEvent;

use crate::error::{AppError, Result};
use crate::ledger::bindings::{IInsurancePool, IERC20};
use crate::ledger::{narrow_u128, narrow_u64, Address, LogEntry};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolEvent {
    PolicyPurchased {
        user: Address,
        policy_id: u64,
        premium: u128,
        coverage: u128,
        expiry_time: u64,
    },
    PayoutExecuted {
        user: Address,
        policy_id: u64,
        event_id: u64,
        amount: u128,
    },
}

impl PoolEvent {
    /// Ok(None) for events the pool emits that we do not track
    /// (ownership, oracle changes, initialization).
    pub fn decode(log: &LogEntry) -> Result<Option<Self>> {
        let data = &log.inner.data;
        let Some(sig) = data.topics().first() else {
            return Err(AppError::Abi("log without topics".to_string()));
        };

        if *sig == IInsurancePool::PolicyPurchased::SIGNATURE_HASH {
            let ev = IInsurancePool::PolicyPurchased::decode_log_data(data)?;
            return Ok(Some(PoolEvent::PolicyPurchased {
                user: ev.user,
                policy_id: narrow_u64(ev.policyId, "policy id")?,
                premium: narrow_u128(ev.premium, "premium")?,
                coverage: narrow_u128(ev.coverage, "coverage")?,
                expiry_time: narrow_u64(ev.expiryTime, "expiry time")?,
            }));
        }

        if *sig == IInsurancePool::PayoutExecuted::SIGNATURE_HASH {
            let ev = IInsurancePool::PayoutExecuted::decode_log_data(data)?;
            return Ok(Some(PoolEvent::PayoutExecuted {
                user: ev.user,
                policy_id: narrow_u64(ev.policyId, "policy id")?,
                event_id: narrow_u64(ev.spikeId, "event id")?,
                amount: narrow_u128(ev.amount, "amount")?,
            }));
        }

        Ok(None)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferEvent {
    pub from: Address,
    pub to: Address,
    pub value: u128,
}

impl TransferEvent {
    pub fn decode(log: &LogEntry) -> Result<Option<Self>> {
        let data = &log.inner.data;
        let Some(sig) = data.topics().first() else {
            return Err(AppError::Abi("log without topics".to_string()));
        };
        if *sig != IERC20::Transfer::SIGNATURE_HASH {
            return Ok(None);
        }
        let ev = IERC20::Transfer::decode_log_data(data)?;
        Ok(Some(TransferEvent {
            from: ev.from,
            to: ev.to,
            value: narrow_u128(ev.value, "value")?,
        }))
    }
}

// ---------------------------------------------------------------------------
// Builders used by tests and the in-process ledger
// ---------------------------------------------------------------------------
