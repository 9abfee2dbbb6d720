use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::api::health::{HealthState, WatcherStatus};
use crate::db::Store;
use crate::error::Result;
use crate::ledger::{address_key, Address, LedgerClient};
use crate::sync::{LogDisposition, LogHandler};
use crate::types::{now_secs, SyncResult};

#[derive(Debug, Clone)]
pub struct SyncSettings {
    /// Blocks per getLogs request.
    pub chunk_size: u64,
    /// How far behind head the first ever scan starts.
    pub lookback: u64,
    pub interval: Duration,
}

/// Incremental log scanner for one watched address.
pub struct EventSynchronizer<H> {
    store: Store,
    ledger: Arc<dyn LedgerClient>,
    address: Address,
    handler: H,
    settings: SyncSettings,
    health: Arc<HealthState>,
}

impl<H: LogHandler> EventSynchronizer<H> {
    pub fn new(
        store: Store,
        ledger: Arc<dyn LedgerClient>,
        address: Address,
        handler: H,
        settings: SyncSettings,
        health: Arc<HealthState>,
    ) -> Self {
        Self {
            store,
            ledger,
            address,
            handler,
            settings,
            health,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(watcher = self.handler.name(), address = %self.address, "synchronizer started");
        let mut ticker = tokio::time::interval(self.settings.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            match self.sync_once().await {
                Ok(res) if res.range.is_some() => info!(
                    watcher = self.handler.name(),
                    from = res.range.map(|r| r.0),
                    to = res.range.map(|r| r.1),
                    chunks = res.chunks,
                    handled = res.logs_handled,
                    skipped = res.logs_skipped,
                    "sync pass complete"
                ),
                Ok(_) => debug!(watcher = self.handler.name(), "up to date"),
                Err(e) => warn!(watcher = self.handler.name(), "sync pass failed, checkpoint held: {e}"),
            }
        }
        info!(watcher = self.handler.name(), "synchronizer stopped");
    }

    /// Scans `[checkpoint + 1, head]` and advances the checkpoint to head only
    /// when every chunk succeeded.
    pub async fn sync_once(&self) -> Result<SyncResult> {
        let key = address_key(&self.address);
        let checkpoint = self.store.checkpoint(&key).await?;

        let result = self.scan_from(&key, checkpoint).await;
        let status = match &result {
            Ok(r) => WatcherStatus {
                checkpoint: r.checkpoint,
                head: r.range.map(|(_, to)| to).unwrap_or(r.checkpoint),
                last_run_at: now_secs(),
                last_error: None,
            },
            Err(e) => WatcherStatus {
                checkpoint,
                head: 0,
                last_run_at: now_secs(),
                last_error: Some(e.to_string()),
            },
        };
        self.health.record_watcher(&key, status);
        result
    }

    async fn scan_from(&self, key: &str, checkpoint: u64) -> Result<SyncResult> {
        let head = self.ledger.block_number().await?;
        let mut res = SyncResult {
            checkpoint,
            ..Default::default()
        };
        if head <= checkpoint {
            return Ok(res);
        }

        // First sync starts near head; older history is never backfilled.
        let base = if checkpoint == 0 {
            head.saturating_sub(self.settings.lookback)
        } else {
            checkpoint
        };
        let from = base + 1;
        res.range = Some((from, head));

        let chunk = self.settings.chunk_size.max(1);
        let mut lo = from;
        while lo <= head {
            let hi = lo.saturating_add(chunk - 1).min(head);
            let mut logs = self.ledger.get_logs(self.address, lo, hi).await?;
            logs.sort_by_key(|l| (l.block_number, l.log_index));

            for log in &logs {
                match self.handler.handle(log).await {
                    Ok(LogDisposition::Applied) => res.logs_handled += 1,
                    Ok(LogDisposition::Ignored) => {}
                    Err(e) if e.is_decode() => {
                        res.logs_skipped += 1;
                        warn!(
                            watcher = self.handler.name(),
                            block = log.block_number,
                            tx_hash = %log.tx_hash,
                            "undecodable log skipped: {e}"
                        );
                    }
                    Err(e) => return Err(e),
                }
            }
            res.chunks += 1;
            debug!(watcher = self.handler.name(), lo, hi, logs = logs.len(), "chunk done");
            lo = hi + 1;
        }

        self.store.advance_checkpoint(key, head, now_secs()).await?;
        res.checkpoint = head;
        Ok(res)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::contracts::InsurancePool;
    use crate::ledger::events::build;
    use crate::ledger::mock::{addr, ScriptedLedger};
    use crate::ledger::{TxHash, TxRequest};
    use alloy::primitives::LogData;
    use crate::sync::{PoolEventHandler, Reconciler, TokenTransferHandler};
    use crate::types::PolicyStatus;

    const USDC: u128 = 1_000_000;
    const POOL: u8 = 1;
    const ORACLE: u8 = 2;
    const TOKEN: u8 = 7;

    fn settings(chunk_size: u64, lookback: u64) -> SyncSettings {
        SyncSettings {
            chunk_size,
            lookback,
            interval: Duration::from_secs(15),
        }
    }

    fn pool_sync(
        store: &Store,
        ledger: &Arc<ScriptedLedger>,
        s: SyncSettings,
    ) -> EventSynchronizer<PoolEventHandler> {
        let handler = PoolEventHandler::new(store.clone(), ledger.clone(), 6);
        EventSynchronizer::new(
            store.clone(),
            ledger.clone(),
            addr(POOL),
            handler,
            s,
            Arc::new(HealthState::new()),
        )
    }

    async fn pay(ledger: &ScriptedLedger, user: Address, onchain_id: u64, event_id: u64) -> TxHash {
        let nonce = ledger.pending_nonce(addr(ORACLE)).await.unwrap();
        ledger
            .send_transaction(TxRequest {
                from: addr(ORACLE),
                to: addr(POOL),
                data: InsurancePool::execute_payout_calldata(user, onchain_id, event_id),
                gas: 300_000,
                gas_price: 1,
                nonce,
            })
            .await
            .unwrap()
    }

    fn setup() -> (Arc<ScriptedLedger>, Address) {
        let ledger = Arc::new(ScriptedLedger::new(addr(POOL), addr(ORACLE)));
        ledger.edit(|s| s.pool_balance = 10_000 * USDC);
        (ledger, addr(3))
    }

    #[tokio::test]
    async fn purchase_and_payout_replayed_twice_claims_once() {
        let store = Store::memory().await;
        let (ledger, user) = setup();
        ledger.edit(|s| s.purchase(user, 10 * USDC, 100 * USDC, 86_400));
        let tx_hash = pay(&ledger, user, 0, 42).await;
        // One-block chunks; the third fails once, so blocks 1 and 2 are
        // delivered twice.
        ledger.edit(|s| {
            s.head = 3;
            s.fail_logs_at.insert(3);
        });

        let sync = pool_sync(&store, &ledger, settings(1, 1_000));
        assert!(sync.sync_once().await.is_err());
        let second = sync.sync_once().await.unwrap();
        assert_eq!(second.logs_handled, 2);
        assert_eq!(second.checkpoint, 3);

        let policies = store.policies(Some(&address_key(&user)), 10).await.unwrap();
        assert_eq!(policies.len(), 1);
        assert_eq!(policies[0].status, PolicyStatus::Claimed);
        assert_eq!(policies[0].onchain_id, Some(0));

        let payouts = store.recent_payouts(None, 10).await.unwrap();
        assert_eq!(payouts.len(), 1);
        assert_eq!(payouts[0].tx_hash, tx_hash.to_string());
        assert_eq!(payouts[0].policy_id, Some(policies[0].id));
        assert_eq!(payouts[0].anomaly_event_id, Some(42));
        assert_eq!(payouts[0].amount, 100.0);
    }

    #[tokio::test]
    async fn identical_payout_logs_yield_one_row() {
        let store = Store::memory().await;
        let (ledger, user) = setup();
        ledger.edit(|s| {
            s.head = 10;
            let log = build::payout_executed(addr(POOL), user, 0, 5, 50 * USDC, 10, TxHash::repeat_byte(0xd0));
            s.logs.push(log.clone());
            s.logs.push(log);
        });

        let res = pool_sync(&store, &ledger, settings(1_000, 1_000)).sync_once().await.unwrap();
        assert_eq!(res.logs_handled, 2);
        let payouts = store.recent_payouts(None, 10).await.unwrap();
        assert_eq!(payouts.len(), 1);
        assert_eq!(payouts[0].policy_id, None);
    }

    #[tokio::test]
    async fn failed_chunk_holds_checkpoint_without_gap() {
        let store = Store::memory().await;
        let (ledger, user) = setup();
        ledger.edit(|s| {
            s.head = 499;
            s.purchase(user, 10 * USDC, 100 * USDC, 86_400);
            s.head = 2_500;
            s.fail_logs_at.insert(1_500);
        });

        let sync = pool_sync(&store, &ledger, settings(1_000, 10_000));
        assert!(sync.sync_once().await.is_err());
        assert_eq!(store.checkpoint(&address_key(&addr(POOL))).await.unwrap(), 0);

        let res = sync.sync_once().await.unwrap();
        assert_eq!(res.range, Some((1, 2_500)));
        assert_eq!(res.chunks, 3);
        assert_eq!(res.checkpoint, 2_500);
        assert_eq!(store.checkpoint(&address_key(&addr(POOL))).await.unwrap(), 2_500);

        let calls = ledger.edit(|s| s.get_logs_calls.clone());
        assert_eq!(
            calls,
            vec![(1, 1_000), (1_001, 2_000), (1, 1_000), (1_001, 2_000), (2_001, 2_500)]
        );
        // The purchase chunk ran twice; still one policy.
        assert_eq!(store.policies(None, 10).await.unwrap().len(), 1);

        // Caught up: no-op, checkpoint unchanged.
        let idle = sync.sync_once().await.unwrap();
        assert_eq!(idle.range, None);
        assert_eq!(idle.checkpoint, 2_500);
    }

    #[tokio::test]
    async fn first_sync_seeds_from_lookback() {
        let store = Store::memory().await;
        let (ledger, user) = setup();
        ledger.edit(|s| {
            s.head = 2_999;
            s.purchase(user, 10 * USDC, 100 * USDC, 86_400);
            s.head = 5_000;
        });

        let res = pool_sync(&store, &ledger, settings(1_000, 1_000)).sync_once().await.unwrap();
        assert_eq!(res.range, Some((4_001, 5_000)));
        assert_eq!(res.chunks, 1);
        // Purchase before the seed point is not backfilled.
        assert!(store.policies(None, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn undecodable_log_is_skipped_and_checkpoint_advances() {
        let store = Store::memory().await;
        let (ledger, user) = setup();
        ledger.edit(|s| {
            s.purchase(user, 10 * USDC, 100 * USDC, 86_400);
            s.head += 1;
            let mut bad = build::policy_purchased(addr(POOL), user, 1, 1, 1, 1, s.head, TxHash::repeat_byte(0xba));
            let topics = bad.inner.data.topics().to_vec();
            bad.inner.data = LogData::new_unchecked(topics, bad.inner.data.data[..40].to_vec().into());
            s.logs.push(bad);
        });

        let res = pool_sync(&store, &ledger, settings(1_000, 1_000)).sync_once().await.unwrap();
        assert_eq!(res.logs_handled, 1);
        assert_eq!(res.logs_skipped, 1);
        assert_eq!(res.checkpoint, 2);
    }

    #[tokio::test]
    async fn transfer_refreshes_non_zero_parties() {
        let store = Store::memory().await;
        let (ledger, user) = setup();
        ledger.edit(|s| {
            s.head = 3;
            s.token_balances.insert(user, 25 * USDC);
            s.logs.push(build::transfer(addr(TOKEN), Address::ZERO, user, 25 * USDC, 3, TxHash::repeat_byte(0x11)));
        });

        let res = token_sync(&store, &ledger).sync_once().await.unwrap();
        assert_eq!(res.logs_handled, 1);

        let balances = store.all_balances().await.unwrap();
        assert_eq!(balances.len(), 1);
        assert_eq!(balances[0].user_address, address_key(&user));
        assert_eq!(balances[0].balance, 25.0);
    }

    fn token_sync(store: &Store, ledger: &Arc<ScriptedLedger>) -> EventSynchronizer<TokenTransferHandler> {
        let reconciler = Reconciler::new(store.clone(), ledger.clone(), addr(POOL), addr(TOKEN), 6);
        EventSynchronizer::new(
            store.clone(),
            ledger.clone(),
            addr(TOKEN),
            TokenTransferHandler::new(reconciler),
            settings(1_000, 1_000),
            Arc::new(HealthState::new()),
        )
    }

    #[tokio::test]
    async fn failed_balance_read_holds_token_checkpoint() {
        let store = Store::memory().await;
        let (ledger, user) = setup();
        ledger.edit(|s| {
            s.head = 3;
            s.token_balances.insert(user, 25 * USDC);
            s.logs.push(build::transfer(addr(TOKEN), Address::ZERO, user, 25 * USDC, 3, TxHash::repeat_byte(0x11)));
            s.fail_calls = 1;
        });
        let sync = token_sync(&store, &ledger);

        assert!(sync.sync_once().await.is_err());
        assert_eq!(store.checkpoint(&address_key(&addr(TOKEN))).await.unwrap(), 0);
        assert!(store.all_balances().await.unwrap().is_empty());

        let res = sync.sync_once().await.unwrap();
        assert_eq!(res.checkpoint, 3);
        let balances = store.all_balances().await.unwrap();
        assert_eq!(balances.len(), 1);
        assert_eq!(balances[0].balance, 25.0);
    }
}
