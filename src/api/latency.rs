//! In-memory latency histogram for payout confirmation.
//! Records time from transaction submission to a mined receipt.

use std::sync::Mutex;
use std::time::Duration;

use hdrhistogram::Histogram;

/// Shared latency stats. Settlement records, API reads.
/// Values stored in milliseconds.
pub struct LatencyStats {
    inner: Mutex<Option<Histogram<u64>>>,
}

impl LatencyStats {
    /// Tracks 1ms to 1h, 3 significant figures.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Histogram::new_with_bounds(1, 3_600_000, 3).ok()),
        }
    }

    pub fn record_ms(&self, ms: u64) {
        if let Ok(mut guard) = self.inner.lock() {
            if let Some(h) = guard.as_mut() {
                let _ = h.record(ms.clamp(1, 3_600_000));
            }
        }
    }

    pub fn record(&self, d: Duration) {
        let ms = d.as_millis().min(u128::from(u64::MAX)) as u64;
        self.record_ms(ms);
    }

    /// (p50_ms, p95_ms, p99_ms). None if no samples.
    pub fn percentiles(&self) -> (Option<u64>, Option<u64>, Option<u64>) {
        let Ok(guard) = self.inner.lock() else {
            return (None, None, None);
        };
        match guard.as_ref() {
            Some(h) if h.len() > 0 => (
                Some(h.value_at_quantile(0.5)),
                Some(h.value_at_quantile(0.95)),
                Some(h.value_at_quantile(0.99)),
            ),
            _ => (None, None, None),
        }
    }

    pub fn len(&self) -> u64 {
        self.inner
            .lock()
            .ok()
            .and_then(|g| g.as_ref().map(|h| h.len()))
            .unwrap_or(0)
    }
}

impl Default for LatencyStats {
    fn default() -> Self {
        Self::new()
    }
}
