use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::api::health::HealthState;
use crate::api::latency::LatencyStats;
use crate::db::models::NewPayout;
use crate::db::Store;
use crate::error::{AppError, Result};
use crate::ledger::{self, address_key, Address, InsurancePool, LedgerClient, TxRequest};
use crate::types::{now_secs, AnomalyEvent, Policy, PolicyOutcome, SettlementOutcome};

#[derive(Debug, Clone)]
pub struct SettlementSettings {
    pub gas_limit: u64,
    pub confirm_timeout: Duration,
    /// How often events left unsettled by an earlier failure are retried.
    pub retry_every: Duration,
    pub token_decimals: u32,
}

/// Unsettled events picked up per retry pass.
const RETRY_BATCH: i64 = 100;

enum Work {
    Queued(AnomalyEvent),
    Backlog,
}

/// Owns the oracle signing identity. Exactly one engine may run per signer;
/// events are settled one at a time.
#[derive(Clone)]
pub struct SettlementEngine {
    store: Store,
    ledger: Arc<dyn LedgerClient>,
    pool: InsurancePool,
    signer: Address,
    settings: SettlementSettings,
    latency: Arc<LatencyStats>,
    health: Arc<HealthState>,
}

impl SettlementEngine {
    pub fn new(
        store: Store,
        ledger: Arc<dyn LedgerClient>,
        pool_address: Address,
        signer: Address,
        settings: SettlementSettings,
        latency: Arc<LatencyStats>,
        health: Arc<HealthState>,
    ) -> Self {
        let pool = InsurancePool::new(Arc::clone(&ledger), pool_address);
        Self {
            store,
            ledger,
            pool,
            signer,
            settings,
            latency,
            health,
        }
    }

    /// Fails when the pool names a different oracle. An unreachable ledger
    /// only warns.
    pub async fn verify_oracle(&self) -> Result<()> {
        match self.pool.oracle().await {
            Ok(oracle) if oracle == self.signer => {
                self.health.set_ledger_reachable(true);
                info!(oracle = %oracle, pool = %self.pool.address(), "oracle address verified");
                Ok(())
            }
            Ok(oracle) => Err(AppError::Config(format!(
                "signing address {} is not the pool oracle {}",
                self.signer, oracle
            ))),
            Err(e) => {
                self.health.set_ledger_reachable(false);
                warn!("could not verify oracle address: {e}");
                Ok(())
            }
        }
    }

    /// Consumes anomalies until the queue closes or shutdown is signalled.
    /// The backlog of unsettled events is swept once at start and then every
    /// `retry_every`. A confirmation wait in progress at shutdown is
    /// abandoned; nothing is written locally for it.
    pub async fn run(self, mut rx: mpsc::Receiver<AnomalyEvent>, mut shutdown: watch::Receiver<bool>) {
        info!(signer = %self.signer, "settlement worker started");
        let mut retry = tokio::time::interval(self.settings.retry_every);
        retry.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            let work = tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                _ = retry.tick() => Work::Backlog,
                ev = rx.recv() => match ev {
                    Some(ev) => Work::Queued(ev),
                    None => break,
                },
            };

            tokio::select! {
                _ = self.process(work) => {}
                _ = shutdown.changed() => {
                    warn!("shutdown during settlement, in-flight work abandoned");
                    break;
                }
            }
        }
        info!("settlement worker stopped");
    }

    async fn process(&self, work: Work) {
        match work {
            Work::Queued(event) => {
                if let Err(e) = self.settle_and_mark(&event).await {
                    error!(event_id = event.id, "settlement aborted, will retry: {e}");
                }
            }
            Work::Backlog => match self.retry_unsettled().await {
                Ok(0) => {}
                Ok(n) => info!(settled = n, "unsettled backlog processed"),
                Err(e) => warn!("backlog retry stopped: {e}"),
            },
        }
    }

    /// Settles `event` unless an earlier attempt already completed, then
    /// marks it settled. Returns None when there was nothing left to do.
    /// On error the event stays unsettled for the next retry pass.
    pub async fn settle_and_mark(&self, event: &AnomalyEvent) -> Result<Option<SettlementOutcome>> {
        if self.store.is_settled(event.id).await? {
            return Ok(None);
        }
        let outcome = self.settle(event).await?;
        self.store.mark_settled(event.id, now_secs()).await?;
        info!(
            event_id = outcome.event_id,
            policies = outcome.results.len(),
            paid = outcome.paid(),
            failed = outcome.failed(),
            "settlement finished"
        );
        Ok(Some(outcome))
    }

    /// Settles owed events oldest first. Stops at the first event that
    /// fails again, since later ones would hit the same outage.
    pub async fn retry_unsettled(&self) -> Result<usize> {
        let backlog = self.store.unsettled_anomalies(RETRY_BATCH).await?;
        let mut settled = 0;
        for event in &backlog {
            if self.settle_and_mark(event).await?.is_some() {
                settled += 1;
            }
        }
        Ok(settled)
    }

    /// Pays every eligible policy for `event`. Errors reading local state or
    /// ledger time abort the whole event; everything after that is isolated
    /// per policy.
    pub async fn settle(&self, event: &AnomalyEvent) -> Result<SettlementOutcome> {
        let mut outcome = SettlementOutcome {
            event_id: event.id,
            results: Vec::new(),
        };

        let policies = self.store.eligible_policies(now_secs()).await?;
        if policies.is_empty() {
            info!(event_id = event.id, "no eligible policies, nothing to settle");
            return Ok(outcome);
        }

        let ledger_now = match self.ledger_time().await {
            Ok(t) => t,
            Err(e) => {
                self.health.set_ledger_reachable(false);
                return Err(e);
            }
        };

        for policy in &policies {
            let result = match self.settle_policy(event, policy, ledger_now).await {
                Ok(r) => r,
                Err(e) => PolicyOutcome::Failed {
                    reason: e.to_string(),
                },
            };
            self.log_outcome(event, policy, &result);
            outcome.results.push((policy.id, result));
        }
        Ok(outcome)
    }

    async fn ledger_time(&self) -> Result<u64> {
        let head = self.ledger.block_number().await?;
        self.ledger.block_timestamp(head).await
    }

    async fn settle_policy(
        &self,
        event: &AnomalyEvent,
        policy: &Policy,
        ledger_now: u64,
    ) -> Result<PolicyOutcome> {
        let user = ledger::parse_address(&policy.user_address)?;

        let onchain = self.pool.user_policies(user).await?;
        let Some((index, _)) = onchain
            .iter()
            .enumerate()
            .find(|(_, p)| p.is_payable_at(ledger_now))
        else {
            return Ok(PolicyOutcome::NoOnChainPolicy);
        };
        let onchain_id = index as u64;

        let required = ledger::to_fixed_point(policy.coverage_amount, self.settings.token_decimals);
        let available = self.pool.pool_balance().await?;
        if available < required {
            return Ok(PolicyOutcome::InsufficientPool {
                available,
                required,
            });
        }

        let nonce = self.ledger.pending_nonce(self.signer).await?;
        let gas_price = self.ledger.suggest_gas_price().await?;
        let tx = TxRequest {
            from: self.signer,
            to: self.pool.address(),
            data: InsurancePool::execute_payout_calldata(user, onchain_id, event.id.max(0) as u64),
            gas: self.settings.gas_limit,
            gas_price,
            nonce,
        };

        let submitted = Instant::now();
        let tx_hash = self.ledger.send_transaction(tx).await?;
        info!(
            policy_id = policy.id,
            user = %user,
            onchain_id,
            nonce,
            gas_price = %gas_price,
            tx_hash = %tx_hash,
            "payout submitted"
        );

        let receipt = self
            .ledger
            .wait_for_receipt(tx_hash, self.settings.confirm_timeout)
            .await?;
        self.latency.record(submitted.elapsed());
        self.health.set_ledger_reachable(true);

        if !receipt.success {
            return Ok(PolicyOutcome::Failed {
                reason: format!("transaction {tx_hash} failed in block {}", receipt.block_number),
            });
        }

        let payout = NewPayout {
            policy_id: Some(policy.id),
            user_address: policy.user_address.clone(),
            amount: policy.coverage_amount,
            anomaly_event_id: Some(event.id),
            onchain_policy_id: Some(onchain_id as i64),
            tx_hash: tx_hash.to_string(),
            executed_at: now_secs(),
        };
        if let Err(e) = self.store.record_payout(&payout).await {
            // The ledger already paid; the pool watcher rebuilds this row from
            // the PayoutExecuted log.
            error!(
                policy_id = policy.id,
                tx_hash = %tx_hash,
                "payout confirmed but local record failed: {e}"
            );
        }

        Ok(PolicyOutcome::Paid {
            tx_hash,
            onchain_policy_id: onchain_id,
        })
    }

    fn log_outcome(&self, event: &AnomalyEvent, policy: &Policy, result: &PolicyOutcome) {
        match result {
            PolicyOutcome::Paid { tx_hash, .. } => {
                self.health.inc_payouts_sent();
                self.health.set_last_payout_at(now_secs());
                info!(
                    event = "PAYOUT",
                    event_id = event.id,
                    policy_id = policy.id,
                    user = %policy.user_address,
                    amount = policy.coverage_amount,
                    tx_hash = %tx_hash,
                    "payout confirmed"
                );
            }
            PolicyOutcome::NoOnChainPolicy => warn!(
                event_id = event.id,
                policy_id = policy.id,
                user = %policy.user_address,
                "no payable on-chain policy, skipped"
            ),
            PolicyOutcome::InsufficientPool {
                available,
                required,
            } => warn!(
                event_id = event.id,
                policy_id = policy.id,
                user = %policy.user_address,
                available = %available,
                required = %required,
                "pool balance below coverage, skipped"
            ),
            PolicyOutcome::Failed { reason } => {
                self.health.inc_payouts_failed();
                error!(
                    event_id = event.id,
                    policy_id = policy.id,
                    user = %policy.user_address,
                    "payout failed: {reason}"
                );
            }
        }
    }
}
