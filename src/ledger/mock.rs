//! In-process ledger for tests. Holds pool, token and feed state in memory and
//! answers the same calls the RPC client would make.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use alloy::primitives::{I256, U256};
use alloy::sol_types::{SolCall, SolInterface, SolValue};
use async_trait::async_trait;

use crate::error::{AppError, Result};
use crate::ledger::bindings::{AggregatorV3Interface, IInsurancePool, Policy, IERC20};
use crate::ledger::contracts::OnChainPolicy;
use crate::ledger::events::build;
use crate::ledger::{Address, Bytes, LedgerClient, LogEntry, TxHash, TxReceipt, TxRequest};

pub const GENESIS_TIME: u64 = 1_700_000_000;
pub const BLOCK_TIME: u64 = 12;

pub fn addr(b: u8) -> Address {
    Address::repeat_byte(b)
}

/// Hash of the payout mined at `height`.
pub fn payout_hash(height: u64) -> TxHash {
    TxHash::from(U256::from(height))
}

pub struct State {
    pub head: u64,
    pub pool: Address,
    pub logs: Vec<LogEntry>,
    /// get_logs fails once for any range containing one of these heights.
    pub fail_logs_at: HashSet<u64>,
    /// The next N block_number calls fail.
    pub fail_block_number: u32,
    /// The next N contract calls fail.
    pub fail_calls: u32,
    pub policies: HashMap<Address, Vec<OnChainPolicy>>,
    pub pool_balance: u128,
    pub token_balances: HashMap<Address, u128>,
    pub oracle: Address,
    /// Payouts to these users are mined with a failed status.
    pub revert_for: HashSet<Address>,
    pub round: (i128, u64),
    pub sent: Vec<TxRequest>,
    pub receipts: HashMap<TxHash, TxReceipt>,
    pub nonce: u64,
    pub get_logs_calls: Vec<(u64, u64)>,
}

pub struct ScriptedLedger {
    state: Mutex<State>,
}

impl ScriptedLedger {
    pub fn new(pool: Address, oracle: Address) -> Self {
        Self {
            state: Mutex::new(State {
                head: 0,
                pool,
                logs: Vec::new(),
                fail_logs_at: HashSet::new(),
                fail_block_number: 0,
                fail_calls: 0,
                policies: HashMap::new(),
                pool_balance: 0,
                token_balances: HashMap::new(),
                oracle,
                revert_for: HashSet::new(),
                round: (0, 0),
                sent: Vec::new(),
                receipts: HashMap::new(),
                nonce: 0,
                get_logs_calls: Vec::new(),
            }),
        }
    }

    pub fn edit<R>(&self, f: impl FnOnce(&mut State) -> R) -> R {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    pub fn sent_count(&self) -> usize {
        self.edit(|s| s.sent.len())
    }

    pub fn time_at(height: u64) -> u64 {
        GENESIS_TIME + height * BLOCK_TIME
    }
}

/// Decrements a failure budget, reporting whether this call should fail.
fn take_failure(budget: &mut u32) -> bool {
    if *budget == 0 {
        return false;
    }
    *budget -= 1;
    true
}

impl State {
    /// Appends a purchase to the user's list, mines it in a new block and
    /// emits the matching log. Returns the on-chain index.
    pub fn purchase(&mut self, user: Address, premium: u128, coverage: u128, duration: u64) -> u64 {
        self.head += 1;
        let now = ScriptedLedger::time_at(self.head);
        let list = self.policies.entry(user).or_default();
        list.push(OnChainPolicy {
            user,
            premium,
            coverage,
            purchase_time: now,
            expiry_time: now + duration,
            active: true,
            claimed: false,
        });
        let id = (list.len() - 1) as u64;
        let tx = TxHash::from(U256::from(1_000_000 + self.head));
        self.logs.push(build::policy_purchased(
            self.pool, user, id, premium, coverage, now + duration, self.head, tx,
        ));
        id
    }

    fn execute_payout(&mut self, tx: &TxRequest) -> Result<TxReceipt> {
        let call = IInsurancePool::executePayoutCall::abi_decode(&tx.data)?;
        let user = call.user;
        let policy_id = u64::try_from(call.policyId).map_err(|_| AppError::Rpc("bad policy id".into()))?;
        let event_id = u64::try_from(call.spikeId).map_err(|_| AppError::Rpc("bad spike id".into()))?;

        self.head += 1;
        let tx_hash = payout_hash(self.head);
        let mut receipt = TxReceipt {
            tx_hash,
            block_number: self.head,
            success: false,
            gas_used: 21_000,
        };
        if self.revert_for.contains(&user) {
            return Ok(receipt);
        }
        let Some(policy) = self
            .policies
            .get_mut(&user)
            .and_then(|l| l.get_mut(policy_id as usize))
        else {
            return Ok(receipt);
        };
        if policy.claimed || self.pool_balance < policy.coverage {
            return Ok(receipt);
        }
        policy.claimed = true;
        policy.active = false;
        self.pool_balance -= policy.coverage;
        self.logs.push(build::payout_executed(
            self.pool,
            user,
            policy_id,
            event_id,
            policy.coverage,
            self.head,
            tx_hash,
        ));
        receipt.success = true;
        receipt.gas_used = 80_000;
        Ok(receipt)
    }

    fn answer(&self, data: &[u8]) -> Result<Vec<u8>> {
        if let Ok(call) = IInsurancePool::IInsurancePoolCalls::abi_decode(data) {
            use IInsurancePool::IInsurancePoolCalls as C;
            return match call {
                C::getPoolBalance(_) => Ok(U256::from(self.pool_balance).abi_encode()),
                C::oracle(_) => Ok(self.oracle.abi_encode()),
                C::getUserPolicies(c) => {
                    let list = self.policies.get(&c.user).map(Vec::as_slice).unwrap_or_default();
                    Ok(list.iter().map(Policy::from).collect::<Vec<_>>().abi_encode())
                }
                C::executePayout(_) => Err(AppError::Rpc("executePayout is not a view".into())),
            };
        }
        if let Ok(IERC20::IERC20Calls::balanceOf(c)) = IERC20::IERC20Calls::abi_decode(data) {
            let balance = self.token_balances.get(&c.owner).copied().unwrap_or(0);
            return Ok(U256::from(balance).abi_encode());
        }
        if AggregatorV3Interface::AggregatorV3InterfaceCalls::abi_decode(data).is_ok() {
            let (answer, updated_at) = self.round;
            let answer = I256::try_from(answer).map_err(|e| AppError::Rpc(e.to_string()))?;
            let updated_at = U256::from(updated_at);
            return Ok((U256::from(1u64), answer, updated_at, updated_at, U256::from(1u64)).abi_encode_params());
        }
        Err(AppError::Rpc("execution reverted: unknown selector".into()))
    }
}

#[async_trait]
impl LedgerClient for ScriptedLedger {
    async fn block_number(&self) -> Result<u64> {
        self.edit(|s| {
            if take_failure(&mut s.fail_block_number) {
                return Err(AppError::Rpc("eth_blockNumber: connection refused".into()));
            }
            Ok(s.head)
        })
    }

    async fn block_timestamp(&self, height: u64) -> Result<u64> {
        Ok(Self::time_at(height))
    }

    async fn call(&self, _to: Address, data: Bytes) -> Result<Bytes> {
        self.edit(|s| {
            if take_failure(&mut s.fail_calls) {
                return Err(AppError::Rpc("eth_call: connection reset".into()));
            }
            s.answer(&data).map(Bytes::from)
        })
    }

    async fn get_logs(&self, address: Address, from: u64, to: u64) -> Result<Vec<LogEntry>> {
        self.edit(|s| {
            s.get_logs_calls.push((from, to));
            if let Some(h) = s.fail_logs_at.iter().copied().find(|h| (from..=to).contains(h)) {
                s.fail_logs_at.remove(&h);
                return Err(AppError::Rpc(format!("getLogs {from}-{to} timed out")));
            }
            Ok(s.logs
                .iter()
                .filter(|l| l.address() == address && (from..=to).contains(&l.block_number))
                .cloned()
                .collect())
        })
    }

    async fn pending_nonce(&self, _account: Address) -> Result<u64> {
        Ok(self.edit(|s| s.nonce))
    }

    async fn suggest_gas_price(&self) -> Result<u128> {
        Ok(1_000_000_000)
    }

    async fn send_transaction(&self, tx: TxRequest) -> Result<TxHash> {
        self.edit(|s| {
            if tx.from != s.oracle {
                return Err(AppError::Rpc(format!("no key for {}", tx.from)));
            }
            if tx.nonce != s.nonce {
                return Err(AppError::Rpc(format!("nonce too low: {} != {}", tx.nonce, s.nonce)));
            }
            s.nonce += 1;
            let receipt = s.execute_payout(&tx)?;
            s.sent.push(tx);
            let hash = receipt.tx_hash;
            s.receipts.insert(hash, receipt);
            Ok(hash)
        })
    }

    async fn wait_for_receipt(&self, tx_hash: TxHash, timeout: Duration) -> Result<TxReceipt> {
        self.edit(|s| s.receipts.get(&tx_hash).cloned()).ok_or_else(|| {
            AppError::Confirmation(format!(
                "transaction {tx_hash} not mined after {}s",
                timeout.as_secs()
            ))
        })
    }
}
