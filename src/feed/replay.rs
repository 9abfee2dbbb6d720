//! CSV replay loader: `timestamp,open,high,low,close,volume` with a header row.

use std::path::Path;

use chrono::{DateTime, NaiveDateTime};
use tracing::{info, warn};

use crate::db::Store;
use crate::error::{AppError, Result};
use crate::types::Candle;

const NAIVE_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%SZ", "%Y-%m-%dT%H:%M:%S"];

/// Unix values above this are milliseconds.
const MILLIS_CUTOFF: i64 = 1_000_000_000_000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayStats {
    pub loaded: usize,
    pub skipped: usize,
}

/// Naive formats are read as UTC.
pub fn parse_timestamp(raw: &str) -> Result<i64> {
    let s = raw.trim();
    for fmt in NAIVE_FORMATS {
        if let Ok(t) = NaiveDateTime::parse_from_str(s, fmt) {
            return Ok(t.and_utc().timestamp());
        }
    }
    if let Ok(t) = DateTime::parse_from_rfc3339(s) {
        return Ok(t.timestamp());
    }
    match s.parse::<i64>() {
        Ok(ms) if ms > MILLIS_CUTOFF => Ok(ms / 1_000),
        Ok(secs) => Ok(secs),
        Err(_) => Err(AppError::PriceData(format!("unsupported timestamp format: {s}"))),
    }
}

pub fn parse_row(line: &str, symbol: &str) -> Result<Candle> {
    let parts: Vec<&str> = line.split(',').map(str::trim).collect();
    if parts.len() < 6 {
        return Err(AppError::PriceData(format!(
            "expected 6 columns, got {}",
            parts.len()
        )));
    }
    let num = |i: usize| -> Result<f64> {
        parts[i]
            .parse::<f64>()
            .map_err(|e| AppError::PriceData(format!("column {i} '{}': {e}", parts[i])))
    };
    Ok(Candle {
        timestamp: parse_timestamp(parts[0])?,
        symbol: symbol.to_string(),
        open: num(1)?,
        high: num(2)?,
        low: num(3)?,
        close: num(4)?,
        volume: num(5)?,
    })
}

/// Loads every parseable row into the store. Bad rows are logged and skipped;
/// store failures abort the load.
pub async fn load_csv(store: &Store, path: impl AsRef<Path>, symbol: &str) -> Result<ReplayStats> {
    let path = path.as_ref();
    let text = tokio::fs::read_to_string(path).await?;
    let mut stats = ReplayStats::default();

    for (n, line) in text.lines().enumerate().skip(1) {
        if line.trim().is_empty() {
            continue;
        }
        match parse_row(line, symbol) {
            Ok(candle) => {
                store.upsert_candle(&candle).await?;
                stats.loaded += 1;
            }
            Err(e) => {
                warn!(line = n + 1, "skipping price row: {e}");
                stats.skipped += 1;
            }
        }
    }

    info!(
        path = %path.display(),
        symbol,
        loaded = stats.loaded,
        skipped = stats.skipped,
        "price replay loaded"
    );
    Ok(stats)
}
