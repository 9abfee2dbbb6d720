use crate::types::{Anomaly, Candle};

pub const DEFAULT_DEPTH_THRESHOLD: f64 = 0.15;
pub const DEFAULT_RECOVERY_THRESHOLD: f64 = 0.02;
pub const DEFAULT_BODY_RATIO_MAX: f64 = 0.3;
pub const DEFAULT_RANGE_THRESHOLD: f64 = 0.1;

/// Candle classifier. Pure: the same candle and thresholds always give the
/// same verdict, so replaying history is safe.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DetectionStrategy {
    /// Deep lower wick measured from the body top, with the close back near
    /// the open.
    WickDepth {
        depth_threshold: f64,
        recovery_threshold: f64,
    },
    /// Small body relative to a wide range. Used for bulk historical scans.
    BodyRange {
        body_ratio_max: f64,
        range_threshold: f64,
    },
}

impl Default for DetectionStrategy {
    fn default() -> Self {
        DetectionStrategy::WickDepth {
            depth_threshold: DEFAULT_DEPTH_THRESHOLD,
            recovery_threshold: DEFAULT_RECOVERY_THRESHOLD,
        }
    }
}

impl DetectionStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            DetectionStrategy::WickDepth { .. } => "wick_depth",
            DetectionStrategy::BodyRange { .. } => "body_range",
        }
    }

    /// Degenerate candles (flat range, zero reference price) never detect.
    pub fn evaluate(&self, c: &Candle) -> Option<Anomaly> {
        if c.high == c.low {
            return None;
        }
        let body = (c.close - c.open).abs();

        let (body_ratio, range_ratio) = match *self {
            DetectionStrategy::WickDepth {
                depth_threshold,
                recovery_threshold,
            } => {
                if c.open <= 0.0 {
                    return None;
                }
                let reference = c.open.max(c.close);
                let wick_depth = (reference - c.low) / reference;
                let body_ratio = body / c.open;
                if wick_depth < depth_threshold || body_ratio >= recovery_threshold {
                    return None;
                }
                (body_ratio, wick_depth)
            }
            DetectionStrategy::BodyRange {
                body_ratio_max,
                range_threshold,
            } => {
                if c.close <= 0.0 {
                    return None;
                }
                let range = c.high - c.low;
                let body_ratio = body / range;
                let range_ratio = range / c.close;
                if body_ratio > body_ratio_max || range_ratio < range_threshold {
                    return None;
                }
                (body_ratio, range_ratio)
            }
        };

        Some(Anomaly {
            timestamp: c.timestamp,
            symbol: c.symbol.clone(),
            strategy: self.name(),
            open: c.open,
            high: c.high,
            low: c.low,
            close: c.close,
            body_ratio,
            range_ratio,
        })
    }

    /// Evaluates each candle on its own, in timestamp order.
    pub fn scan(&self, candles: &[Candle]) -> Vec<Anomaly> {
        let mut ordered: Vec<&Candle> = candles.iter().collect();
        ordered.sort_by_key(|c| c.timestamp);
        ordered.into_iter().filter_map(|c| self.evaluate(c)).collect()
    }
}
