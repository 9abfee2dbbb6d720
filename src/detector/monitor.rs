use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::db::Store;
use crate::detector::DetectionStrategy;
use crate::error::{AppError, Result};
use crate::types::{now_secs, Anomaly, AnomalyEvent};

/// Evaluates stored candles and hands each newly persisted anomaly to the
/// settlement worker. Live checks only look at buckets that have closed.
pub struct CandleMonitor {
    store: Store,
    strategy: DetectionStrategy,
    symbol: String,
    candle_secs: i64,
    settle_tx: mpsc::Sender<AnomalyEvent>,
    /// Start of the newest closed bucket already evaluated.
    last_checked: Option<i64>,
}

impl CandleMonitor {
    pub fn new(
        store: Store,
        strategy: DetectionStrategy,
        symbol: String,
        candle_secs: u64,
        settle_tx: mpsc::Sender<AnomalyEvent>,
    ) -> Self {
        Self {
            store,
            strategy,
            symbol,
            candle_secs: candle_secs.max(1) as i64,
            settle_tx,
            last_checked: None,
        }
    }

    /// Checks newly closed candles on every tick and on every insert signal.
    pub async fn run(
        mut self,
        every: Duration,
        mut notify_rx: mpsc::Receiver<()>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(symbol = %self.symbol, strategy = self.strategy.name(), "candle monitor started");
        let mut ticker = tokio::time::interval(every);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                Some(()) = notify_rx.recv() => {}
                _ = shutdown.changed() => break,
            }
            if let Err(e) = self.check_closed(now_secs()).await {
                warn!(symbol = %self.symbol, "detection check failed: {e}");
            }
        }
        info!("candle monitor stopped");
    }

    /// Evaluates candles whose bucket ended by `now` and were not evaluated
    /// before. The first call only looks at the newest closed bucket.
    pub async fn check_closed(&mut self, now: i64) -> Result<Vec<AnomalyEvent>> {
        let started_by = now - self.candle_secs;
        let candles = match self.last_checked {
            Some(after) => self.store.candles_between(&self.symbol, after, started_by).await?,
            None => self
                .store
                .latest_candle_started_by(&self.symbol, started_by)
                .await?
                .into_iter()
                .collect(),
        };
        if candles.is_empty() {
            debug!(symbol = %self.symbol, "no newly closed candle");
        }

        let mut created = Vec::new();
        for candle in &candles {
            if let Some(a) = self.strategy.evaluate(candle) {
                if let Some(event) = self.persist_and_enqueue(&a).await? {
                    created.push(event);
                }
            }
            self.last_checked = Some(candle.timestamp);
        }
        Ok(created)
    }

    /// Replay: evaluate every stored candle for the symbol in order. Returns
    /// the number of newly created events.
    pub async fn scan_all(&self) -> Result<usize> {
        let candles = self.store.candles_for_symbol(&self.symbol).await?;
        let found = self.strategy.scan(&candles);
        let mut created = 0;
        for a in &found {
            if self.persist_and_enqueue(a).await?.is_some() {
                created += 1;
            }
        }
        info!(
            symbol = %self.symbol,
            candles = candles.len(),
            detected = found.len(),
            created,
            "historical scan complete"
        );
        Ok(created)
    }

    async fn persist_and_enqueue(&self, a: &Anomaly) -> Result<Option<AnomalyEvent>> {
        let Some(event) = self.store.insert_anomaly(a, now_secs()).await? else {
            return Ok(None);
        };
        info!(
            event = "ANOMALY",
            id = event.id,
            symbol = %event.symbol,
            timestamp = event.timestamp,
            depth = event.range_ratio,
            body = event.body_ratio,
            "anomaly detected"
        );
        self.settle_tx
            .send(event.clone())
            .await
            .map_err(|e| AppError::ChannelSend(e.to_string()))?;
        Ok(Some(event))
    }
}
