//! Typed views over the three contracts we talk to.

use std::sync::Arc;

use alloy::primitives::{Bytes, U256};
use alloy::sol_types::SolCall;

use crate::error::{AppError, Result};
use crate::ledger::bindings::{AggregatorV3Interface, IInsurancePool, Policy, IERC20};
use crate::ledger::{narrow_u128, narrow_u64, Address, LedgerClient};

/// The pool's `Policy` struct with amounts narrowed to native integers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OnChainPolicy {
    pub user: Address,
    pub premium: u128,
    pub coverage: u128,
    pub purchase_time: u64,
    pub expiry_time: u64,
    pub active: bool,
    pub claimed: bool,
}

impl OnChainPolicy {
    pub fn is_payable_at(&self, ledger_now: u64) -> bool {
        self.active && !self.claimed && self.expiry_time >= ledger_now
    }
}

impl TryFrom<Policy> for OnChainPolicy {
    type Error = AppError;

    fn try_from(p: Policy) -> Result<Self> {
        Ok(Self {
            user: p.user,
            premium: narrow_u128(p.premium, "premium")?,
            coverage: narrow_u128(p.coverageAmount, "coverage")?,
            purchase_time: narrow_u64(p.purchaseTime, "purchase time")?,
            expiry_time: narrow_u64(p.expiryTime, "expiry time")?,
            active: p.active,
            claimed: p.claimed,
        })
    }
}

impl From<&OnChainPolicy> for Policy {
    fn from(p: &OnChainPolicy) -> Self {
        Policy {
            user: p.user,
            premium: U256::from(p.premium),
            coverageAmount: U256::from(p.coverage),
            purchaseTime: U256::from(p.purchase_time),
            expiryTime: U256::from(p.expiry_time),
            active: p.active,
            claimed: p.claimed,
        }
    }
}

/// Decodes the `getUserPolicies` return data.
pub fn decode_user_policies(data: &[u8]) -> Result<Vec<OnChainPolicy>> {
    IInsurancePool::getUserPoliciesCall::abi_decode_returns(data)?
        .into_iter()
        .map(OnChainPolicy::try_from)
        .collect()
}

// ---------------------------------------------------------------------------
// InsurancePool
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct InsurancePool {
    ledger: Arc<dyn LedgerClient>,
    address: Address,
}

impl InsurancePool {
    pub fn new(ledger: Arc<dyn LedgerClient>, address: Address) -> Self {
        Self { ledger, address }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    async fn call<C: SolCall>(&self, call: C) -> Result<Bytes> {
        self.ledger.call(self.address, call.abi_encode().into()).await
    }

    pub async fn pool_balance(&self) -> Result<u128> {
        let out = self.call(IInsurancePool::getPoolBalanceCall {}).await?;
        narrow_u128(IInsurancePool::getPoolBalanceCall::abi_decode_returns(&out)?, "pool balance")
    }

    pub async fn user_policies(&self, user: Address) -> Result<Vec<OnChainPolicy>> {
        let out = self.call(IInsurancePool::getUserPoliciesCall { user }).await?;
        decode_user_policies(&out)
    }

    pub async fn oracle(&self) -> Result<Address> {
        let out = self.call(IInsurancePool::oracleCall {}).await?;
        Ok(IInsurancePool::oracleCall::abi_decode_returns(&out)?)
    }

    /// Calldata for `executePayout(user, policyId, spikeId)`.
    pub fn execute_payout_calldata(user: Address, policy_id: u64, event_id: u64) -> Bytes {
        IInsurancePool::executePayoutCall {
            user,
            policyId: U256::from(policy_id),
            spikeId: U256::from(event_id),
        }
        .abi_encode()
        .into()
    }
}

// ---------------------------------------------------------------------------
// Erc20
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct Erc20 {
    ledger: Arc<dyn LedgerClient>,
    address: Address,
}

impl Erc20 {
    pub fn new(ledger: Arc<dyn LedgerClient>, address: Address) -> Self {
        Self { ledger, address }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub async fn balance_of(&self, owner: Address) -> Result<u128> {
        let data = IERC20::balanceOfCall { owner }.abi_encode();
        let out = self.ledger.call(self.address, data.into()).await?;
        narrow_u128(IERC20::balanceOfCall::abi_decode_returns(&out)?, "balance")
    }
}

// ---------------------------------------------------------------------------
// PriceFeed (AggregatorV3)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Round {
    pub round_id: u128,
    pub answer: i128,
    pub updated_at: u64,
}

#[derive(Clone)]
pub struct PriceFeed {
    ledger: Arc<dyn LedgerClient>,
    address: Address,
}

impl PriceFeed {
    pub fn new(ledger: Arc<dyn LedgerClient>, address: Address) -> Self {
        Self { ledger, address }
    }

    pub async fn latest_round(&self) -> Result<Round> {
        let data = AggregatorV3Interface::latestRoundDataCall {}.abi_encode();
        let out = self.ledger.call(self.address, data.into()).await?;
        decode_round(&out)
    }
}

pub fn decode_round(data: &[u8]) -> Result<Round> {
    let ret = AggregatorV3Interface::latestRoundDataCall::abi_decode_returns(data)?;
    let magnitude = i128::try_from(narrow_u128(ret.answer.unsigned_abs(), "answer")?)
        .map_err(|_| AppError::Abi(format!("answer {} exceeds i128", ret.answer)))?;
    Ok(Round {
        round_id: u128::try_from(ret.roundId)
            .map_err(|_| AppError::Abi(format!("round id {} exceeds u128", ret.roundId)))?,
        answer: if ret.answer.is_negative() { -magnitude } else { magnitude },
        updated_at: narrow_u64(ret.updatedAt, "updatedAt")?,
    })
}
