use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use alloy::signers::local::PrivateKeySigner;

use crate::detector::strategy::{
    DEFAULT_BODY_RATIO_MAX, DEFAULT_DEPTH_THRESHOLD, DEFAULT_RANGE_THRESHOLD, DEFAULT_RECOVERY_THRESHOLD,
};
use crate::detector::DetectionStrategy;
use crate::error::{AppError, Result};
use crate::ledger::Address;

/// Capacity of the detection → settlement queue.
pub const CHANNEL_CAPACITY: usize = 1024;

/// Capacity of the "candle inserted" signal. Extra signals are dropped.
pub const NOTIFY_CAPACITY: usize = 100;


#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Poll the price feed and run every watcher until shutdown.
    Live,
    /// Load a CSV, settle what it triggers, sync once, exit.
    Replay,
}

impl FromStr for Mode {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "live" => Ok(Mode::Live),
            "replay" => Ok(Mode::Replay),
            other => Err(AppError::Config(format!("MODE must be live or replay, got {other}"))),
        }
    }
}

/// Oracle signing key. Debug output shows the derived address only.
#[derive(Clone)]
pub struct OracleKey(PrivateKeySigner);

impl OracleKey {
    pub fn address(&self) -> Address {
        self.0.address()
    }

    pub fn signer(&self) -> PrivateKeySigner {
        self.0.clone()
    }
}

impl fmt::Debug for OracleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("OracleKey").field(&self.address()).finish()
    }
}

impl FromStr for OracleKey {
    type Err = AppError;

    fn from_str(raw: &str) -> Result<Self> {
        raw.trim()
            .parse::<PrivateKeySigner>()
            .map(OracleKey)
            .map_err(|_| AppError::Config("ORACLE_PRIVATE_KEY must be a 32-byte hex secp256k1 key".to_string()))
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    pub db_path: String,
    pub api_port: u16,
    pub mode: Mode,
    pub symbol: String,
    /// Required when `mode` is replay (REPLAY_CSV).
    pub replay_csv: Option<String>,
    pub strategy: DetectionStrategy,
    pub detect_interval: Duration,

    pub rpc_url: String,
    pub pool_address: Address,
    pub token_address: Address,
    /// Signs payouts; its address must match the pool's oracle().
    pub oracle_key: OracleKey,
    pub oracle_address: Address,
    pub token_decimals: u32,

    /// Live poller is off when unset (PRICE_FEED_ADDRESS).
    pub price_feed_address: Option<Address>,
    pub price_poll: Duration,
    pub candle_secs: u64,

    pub sync_interval: Duration,
    pub sync_chunk_size: u64,
    pub sync_lookback: u64,
    pub reconcile_interval: Duration,

    pub payout_gas_limit: u64,
    pub confirm_timeout: Duration,
    /// How often unsettled anomalies are swept back into settlement.
    pub settle_retry: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str, default: &str| get(key).unwrap_or_else(|| default.to_string());
        let required = |key: &str| {
            get(key)
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| AppError::Config(format!("{key} is required")))
        };

        let mode: Mode = var("MODE", "live").parse()?;
        let replay_csv = get("REPLAY_CSV").filter(|v| !v.trim().is_empty());
        if mode == Mode::Replay && replay_csv.is_none() {
            return Err(AppError::Config("REPLAY_CSV is required in replay mode".to_string()));
        }

        let strategy = match var("DETECTOR_STRATEGY", "wick_depth").trim() {
            "wick_depth" => DetectionStrategy::WickDepth {
                depth_threshold: threshold(&get, "DEPTH_THRESHOLD", DEFAULT_DEPTH_THRESHOLD)?,
                recovery_threshold: threshold(&get, "RECOVERY_THRESHOLD", DEFAULT_RECOVERY_THRESHOLD)?,
            },
            "body_range" => DetectionStrategy::BodyRange {
                body_ratio_max: threshold(&get, "BODY_RATIO_MAX", DEFAULT_BODY_RATIO_MAX)?,
                range_threshold: threshold(&get, "RANGE_THRESHOLD", DEFAULT_RANGE_THRESHOLD)?,
            },
            other => {
                return Err(AppError::Config(format!(
                    "DETECTOR_STRATEGY must be wick_depth or body_range, got {other}"
                )))
            }
        };

        let sync_chunk_size: u64 = number(&get, "SYNC_CHUNK_SIZE", 1000)?;
        if sync_chunk_size == 0 {
            return Err(AppError::Config("SYNC_CHUNK_SIZE must be non-zero".to_string()));
        }

        let oracle_key: OracleKey = required("ORACLE_PRIVATE_KEY")?.parse()?;
        let oracle_address = oracle_key.address();
        if let Some(raw) = get("ORACLE_ADDRESS").filter(|v| !v.trim().is_empty()) {
            let declared = address(&raw, "ORACLE_ADDRESS")?;
            if declared != oracle_address {
                return Err(AppError::Config(format!(
                    "ORACLE_ADDRESS {declared} does not match ORACLE_PRIVATE_KEY ({oracle_address})"
                )));
            }
        }

        Ok(Self {
            log_level: var("LOG_LEVEL", "info"),
            db_path: var("DB_PATH", "wickguard.db"),
            api_port: var("API_PORT", "8080")
                .parse::<u16>()
                .map_err(|_| AppError::Config("API_PORT must be a valid port number".to_string()))?,
            mode,
            symbol: var("SYMBOL", "BTCUSDT"),
            replay_csv,
            strategy,
            detect_interval: secs(&get, "DETECT_INTERVAL_SECS", 30)?,

            rpc_url: required("RPC_URL")?,
            pool_address: address(&required("POOL_ADDRESS")?, "POOL_ADDRESS")?,
            token_address: address(&required("TOKEN_ADDRESS")?, "TOKEN_ADDRESS")?,
            oracle_key,
            oracle_address,
            token_decimals: number(&get, "TOKEN_DECIMALS", 6)?,

            price_feed_address: get("PRICE_FEED_ADDRESS")
                .filter(|v| !v.trim().is_empty())
                .map(|v| address(&v, "PRICE_FEED_ADDRESS"))
                .transpose()?,
            price_poll: secs(&get, "PRICE_POLL_SECS", 10)?,
            candle_secs: number::<u64>(&get, "CANDLE_SECS", 60)?.max(1),

            sync_interval: secs(&get, "SYNC_INTERVAL_SECS", 15)?,
            sync_chunk_size,
            sync_lookback: number(&get, "SYNC_LOOKBACK", 1000)?,
            reconcile_interval: secs(&get, "RECONCILE_INTERVAL_SECS", 3600)?,

            payout_gas_limit: number(&get, "PAYOUT_GAS_LIMIT", 300_000)?,
            confirm_timeout: secs(&get, "CONFIRM_TIMEOUT_SECS", 300)?,
            settle_retry: secs(&get, "SETTLE_RETRY_SECS", 30)?,
        })
    }
}

fn number<T>(get: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
{
    match get(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| AppError::Config(format!("{key} must be a non-negative integer, got {raw}"))),
    }
}

/// Intervals must be at least one second; tokio panics on a zero period.
fn secs(get: &impl Fn(&str) -> Option<String>, key: &str, default: u64) -> Result<Duration> {
    let n: u64 = number(get, key, default)?;
    if n == 0 {
        return Err(AppError::Config(format!("{key} must be at least 1")));
    }
    Ok(Duration::from_secs(n))
}

fn threshold(get: &impl Fn(&str) -> Option<String>, key: &str, default: f64) -> Result<f64> {
    let v = match get(key) {
        None => default,
        Some(raw) => raw
            .trim()
            .parse::<f64>()
            .map_err(|_| AppError::Config(format!("{key} must be a number, got {raw}")))?,
    };
    if !v.is_finite() || v <= 0.0 {
        return Err(AppError::Config(format!("{key} must be positive and finite, got {v}")));
    }
    Ok(v)
}

fn address(raw: &str, key: &str) -> Result<Address> {
    raw.parse()
        .map_err(|_| AppError::Config(format!("{key} must be a 20-byte hex address, got {raw}")))
}
