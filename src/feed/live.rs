//! Live price poller: reads `latestRoundData` from one aggregator and folds
//! each new round into the open OHLC bucket.

use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::db::Store;
use crate::error::Result;
use crate::ledger::contracts::Round;
use crate::ledger::PriceFeed;
use crate::types::Candle;

/// Aggregator answers carry 8 decimals.
pub const FEED_DECIMALS: i32 = 8;

pub struct LivePriceFeed {
    feed: PriceFeed,
    store: Store,
    symbol: String,
    candle_secs: i64,
    last_round: Option<u128>,
    current: Option<Candle>,
}

impl LivePriceFeed {
    pub fn new(feed: PriceFeed, store: Store, symbol: String, candle_secs: u64) -> Self {
        Self {
            feed,
            store,
            symbol,
            candle_secs: candle_secs.max(1) as i64,
            last_round: None,
            current: None,
        }
    }

    pub async fn run(mut self, every: Duration, mut shutdown: watch::Receiver<bool>) {
        // Continue the stored bucket across restarts.
        match self.store.latest_candle(&self.symbol).await {
            Ok(c) => self.current = c,
            Err(e) => warn!("could not load latest candle: {e}"),
        }
        info!(symbol = %self.symbol, candle_secs = self.candle_secs, "live price feed started");

        let mut ticker = tokio::time::interval(every);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            if let Err(e) = self.poll().await {
                warn!(symbol = %self.symbol, "price poll failed: {e}");
            }
        }
        info!("live price feed stopped");
    }

    /// Returns the candle written, if the round was new and usable.
    pub async fn poll(&mut self) -> Result<Option<Candle>> {
        let round = self.feed.latest_round().await?;
        if self.last_round == Some(round.round_id) {
            debug!(round = %round.round_id, "no new round");
            return Ok(None);
        }
        self.last_round = Some(round.round_id);

        match self.apply_round(&round) {
            RoundUpdate::Candle(candle) => {
                self.store.upsert_candle(&candle).await?;
                Ok(Some(candle))
            }
            RoundUpdate::NonPositive => {
                warn!(round = %round.round_id, answer = %round.answer, "non-positive answer ignored");
                Ok(None)
            }
            RoundUpdate::ClosedBucket { bucket, current } => {
                warn!(
                    round = %round.round_id,
                    bucket,
                    current,
                    "round for an already closed bucket ignored"
                );
                Ok(None)
            }
        }
    }

    fn apply_round(&mut self, round: &Round) -> RoundUpdate {
        if round.answer <= 0 {
            return RoundUpdate::NonPositive;
        }
        let price = round.answer as f64 / 10f64.powi(FEED_DECIMALS);
        let ts = round.updated_at as i64;
        let bucket = ts - ts.rem_euclid(self.candle_secs);

        let candle = match self.current.take() {
            Some(mut c) if c.timestamp == bucket => {
                c.high = c.high.max(price);
                c.low = c.low.min(price);
                c.close = price;
                c
            }
            // Late rounds for an older bucket are dropped rather than reopening it.
            Some(c) if c.timestamp > bucket => {
                let current = c.timestamp;
                self.current = Some(c);
                return RoundUpdate::ClosedBucket { bucket, current };
            }
            _ => Candle {
                timestamp: bucket,
                symbol: self.symbol.clone(),
                open: price,
                high: price,
                low: price,
                close: price,
                volume: 0.0,
            },
        };
        self.current = Some(candle.clone());
        RoundUpdate::Candle(candle)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum RoundUpdate {
    Candle(Candle),
    NonPositive,
    /// The round belongs to `bucket`, older than the open `current` one.
    ClosedBucket { bucket: i64, current: i64 },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::ledger::mock::{addr, ScriptedLedger};

    const E8: i128 = 100_000_000;

    async fn feed() -> (LivePriceFeed, Arc<ScriptedLedger>, Store) {
        let store = Store::memory().await;
        let ledger = Arc::new(ScriptedLedger::new(addr(1), addr(2)));
        let pf = PriceFeed::new(ledger.clone(), addr(8));
        (LivePriceFeed::new(pf, store.clone(), "BTCUSDT".into(), 60), ledger, store)
    }

    fn round(id: u128, answer: i128, updated_at: u64) -> Round {
        Round {
            round_id: id,
            answer,
            updated_at,
        }
    }

    fn folded(update: RoundUpdate) -> Candle {
        match update {
            RoundUpdate::Candle(c) => c,
            other => panic!("expected a candle, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn rounds_fold_into_bucket() {
        let (mut f, _, _) = feed().await;
        f.apply_round(&round(1, 100 * E8, 1_700_000_040));
        f.apply_round(&round(2, 80 * E8, 1_700_000_050));
        let c = folded(f.apply_round(&round(3, 99 * E8, 1_700_000_059)));
        // 1_700_000_040 is a multiple of 60.
        assert_eq!(c.timestamp, 1_700_000_040);
        assert_eq!((c.open, c.high, c.low, c.close), (100.0, 100.0, 80.0, 99.0));

        let next = folded(f.apply_round(&round(4, 101 * E8, 1_700_000_100)));
        assert_eq!(next.open, 101.0);
        assert!(next.timestamp > c.timestamp);
    }

    #[tokio::test]
    async fn poll_writes_once_per_round() {
        let (mut f, ledger, store) = feed().await;
        ledger.edit(|s| s.round = (95_000 * E8, 1_700_000_000));
        assert!(f.poll().await.unwrap().is_some());
        // The mock always reports round id 1.
        assert!(f.poll().await.unwrap().is_none());
        let stored = store.latest_candle("BTCUSDT").await.unwrap().unwrap();
        assert_eq!(stored.close, 95_000.0);
    }

    #[tokio::test]
    async fn negative_answer_is_ignored() {
        let (mut f, _, _) = feed().await;
        assert_eq!(f.apply_round(&round(1, -5, 1_700_000_000)), RoundUpdate::NonPositive);
        assert!(f.current.is_none());
    }

    #[tokio::test]
    async fn late_round_does_not_reopen_closed_bucket() {
        let (mut f, _, _) = feed().await;
        folded(f.apply_round(&round(1, 100 * E8, 1_700_000_100)));
        assert_eq!(
            f.apply_round(&round(2, 50 * E8, 1_700_000_050)),
            RoundUpdate::ClosedBucket {
                bucket: 1_700_000_040,
                current: 1_700_000_100
            }
        );
        let open = f.current.clone().unwrap();
        assert_eq!((open.timestamp, open.low), (1_700_000_100, 100.0));
    }
}
