use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};

use crate::db::models::NewPolicy;
use crate::db::Store;
use crate::error::Result;
use crate::ledger::{
    address_key, from_fixed_point, parse_address, Address, Erc20, InsurancePool, LedgerClient, OnChainPolicy,
};
use crate::types::{now_secs, PolicyStatus};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub users: usize,
    pub policies: usize,
    pub balances: usize,
    pub expired: u64,
    pub errors: usize,
}

/// Full re-read of ledger state. The checkpointed scan stays canonical; this
/// only corrects drift.
#[derive(Clone)]
pub struct Reconciler {
    store: Store,
    pool: InsurancePool,
    token: Erc20,
    decimals: u32,
}

fn ledger_status(p: &OnChainPolicy) -> PolicyStatus {
    if p.claimed {
        PolicyStatus::Claimed
    } else if p.active {
        PolicyStatus::Active
    } else {
        PolicyStatus::Inactive
    }
}

impl Reconciler {
    pub fn new(
        store: Store,
        ledger: Arc<dyn LedgerClient>,
        pool_address: Address,
        token_address: Address,
        decimals: u32,
    ) -> Self {
        Self {
            store,
            pool: InsurancePool::new(Arc::clone(&ledger), pool_address),
            token: Erc20::new(ledger, token_address),
            decimals,
        }
    }

    pub async fn refresh_balance(&self, user: Address) -> Result<f64> {
        let raw = self.token.balance_of(user).await?;
        let balance = from_fixed_point(raw, self.decimals);
        self.store
            .upsert_balance(&address_key(&self.token.address()), &address_key(&user), balance, now_secs())
            .await?;
        Ok(balance)
    }

    /// Upserts every entry of the user's on-chain policy list.
    pub async fn sync_user_policies(&self, user: Address) -> Result<usize> {
        let list = self.pool.user_policies(user).await?;
        for (index, p) in list.iter().enumerate() {
            self.store
                .upsert_policy(&NewPolicy {
                    user_address: address_key(&user),
                    onchain_id: Some(index as i64),
                    premium: from_fixed_point(p.premium, self.decimals),
                    coverage_amount: from_fixed_point(p.coverage, self.decimals),
                    purchase_time: p.purchase_time as i64,
                    expiry_time: p.expiry_time as i64,
                    status: Some(ledger_status(p)),
                    tx_hash: None,
                })
                .await?;
        }
        Ok(list.len())
    }

    /// On-demand refresh for one user: policies, balance, then the expiry sweep.
    pub async fn refresh_user(&self, user: Address) -> Result<()> {
        let policies = self.sync_user_policies(user).await?;
        let balance = self.refresh_balance(user).await?;
        let expired = self.store.expire_policies(now_secs()).await?;
        info!(user = %user, policies, balance, expired, "user refreshed");
        Ok(())
    }

    pub async fn full_pass(&self) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();

        for raw in self.store.distinct_policy_users().await? {
            let user = match parse_address(&raw) {
                Ok(a) => a,
                Err(e) => {
                    warn!(user = %raw, "skipping malformed stored address: {e}");
                    report.errors += 1;
                    continue;
                }
            };
            report.users += 1;
            match self.sync_user_policies(user).await {
                Ok(n) => report.policies += n,
                Err(e) => {
                    warn!(user = %user, "policy reconciliation failed: {e}");
                    report.errors += 1;
                }
            }
        }

        let token_key = address_key(&self.token.address());
        for row in self.store.all_balances().await? {
            if row.token_address != token_key {
                continue;
            }
            let Ok(user) = parse_address(&row.user_address) else {
                report.errors += 1;
                continue;
            };
            match self.refresh_balance(user).await {
                Ok(_) => report.balances += 1,
                Err(e) => {
                    warn!(user = %user, "balance refresh failed: {e}");
                    report.errors += 1;
                }
            }
        }

        report.expired = self.store.expire_policies(now_secs()).await?;
        Ok(report)
    }

    pub async fn run(self, every: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(every_secs = every.as_secs(), "reconciler started");
        let mut ticker = tokio::time::interval(every);
        // The first tick fires immediately; skip it so startup is not a full rescan.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            match self.full_pass().await {
                Ok(r) => info!(
                    users = r.users,
                    policies = r.policies,
                    balances = r.balances,
                    expired = r.expired,
                    errors = r.errors,
                    "reconciliation pass complete"
                ),
                Err(e) => warn!("reconciliation pass failed: {e}"),
            }
        }
        info!("reconciler stopped");
    }
}
