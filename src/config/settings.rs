use dotenv::dotenv;
use std::{env, str::FromStr, time::Duration};

use crate::services::circuit_breaker::BreakerConfig;

#[derive(Debug, Clone)]
pub struct Settings {
    pub server_port: u16,
    pub ws_port: u16,
    pub database_url: String,
    pub redis_url: String,
    pub quote_provider_url: String,
    pub analysis_service_url: String,
    pub log_format: String,
    pub scan: ScanConfig,
}

impl Settings {
    pub fn new() -> Result<Self, Box<dyn std::error::Error>> {
        dotenv().ok(); // loads `.env` file automatically

        let server_port = env::var("SERVER_PORT")
            .map_err(|_| "SERVER_PORT missing from env")?
            .parse::<u16>()
            .map_err(|_| "SERVER_PORT must be a valid u16")?;
        let ws_port = env::var("WS_PORT")
            .unwrap_or_else(|_| "8081".into())
            .parse::<u16>()
            .map_err(|_| "WS_PORT must be a valid u16")?;

        let database_url = env::var("DATABASE_URL").map_err(|_| "DATABASE_URL missing")?;
        let redis_url = env::var("REDIS_URL")
            .unwrap_or_else(|_| "redis://127.0.0.1:6379".into());
        let quote_provider_url = env::var("QUOTE_PROVIDER_URL")
            .unwrap_or_else(|_| "https://query1.finance.yahoo.com".into());
        let analysis_service_url = env::var("ANALYSIS_SERVICE_URL")
            .unwrap_or_else(|_| "http://127.0.0.1:5000".into());
        let log_format = env::var("LOG_FORMAT").unwrap_or_default().to_lowercase();

        Ok(Self {
            server_port,
            ws_port,
            database_url,
            redis_url,
            quote_provider_url,
            analysis_service_url,
            log_format,
            scan: ScanConfig::from_env()?,
        })
    }

    pub fn json_logs(&self) -> bool {
        self.log_format == "json"
    }
}

const DEFAULT_SYMBOLS: &[&str] = &["SPY", "QQQ", "AAPL", "MSFT", "NVDA", "AMZN", "GOOGL", "META", "TSLA"];

/// Liquid names where a volume surge means something.
const ACCUMULATOR_SYMBOLS: &[&str] = &[
    "AAPL", "MSFT", "NVDA", "AMZN", "GOOGL", "META", "TSLA", "AMD", "NFLX", "AVGO", "JPM", "SPY", "QQQ",
];

/// Every tunable of the scan pipeline. `Default` carries the production values.
#[derive(Debug, Clone)]
pub struct ScanConfig {
    pub scan_interval: Duration,
    pub health_interval: Duration,
    pub health_timeout: Duration,
    pub quote_timeout: Duration,
    pub chunk_timeout: Duration,
    pub chunk_pause: Duration,
    pub history_chunk_size: usize,
    pub analysis_chunk_size: usize,
    pub lookback_days: u32,
    pub history_tail: usize,
    pub retry_attempts: u32,
    pub retry_base_delay: Duration,
    pub connect_scan_delay: Duration,
    pub default_symbols: Vec<String>,
    /// High-liquidity subset eligible for the fast-accumulator ranking.
    pub accumulator_symbols: Vec<String>,
    pub top_recommendations: usize,
    pub top_strategy_members: usize,
    pub top_accumulators: usize,
    pub breaker: BreakerConfig,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            scan_interval: Duration::from_secs(60),
            health_interval: Duration::from_secs(30),
            health_timeout: Duration::from_secs(5),
            quote_timeout: Duration::from_secs(20),
            chunk_timeout: Duration::from_secs(20),
            chunk_pause: Duration::from_millis(250),
            history_chunk_size: 25,
            analysis_chunk_size: 10,
            lookback_days: 100,
            history_tail: 30,
            retry_attempts: 2,
            retry_base_delay: Duration::from_millis(500),
            connect_scan_delay: Duration::from_secs(2),
            default_symbols: owned(DEFAULT_SYMBOLS),
            accumulator_symbols: owned(ACCUMULATOR_SYMBOLS),
            top_recommendations: 5,
            top_strategy_members: 10,
            top_accumulators: 5,
            breaker: BreakerConfig::default(),
        }
    }
}

impl ScanConfig {
    /// Defaults, overridden by whichever `SCAN_*` / `BREAKER_*` vars are set.
    pub fn from_env() -> Result<Self, Box<dyn std::error::Error>> {
        let d = Self::default();
        let b = d.breaker;

        Ok(Self {
            scan_interval: secs("SCAN_INTERVAL_SECS", d.scan_interval)?,
            health_interval: secs("HEALTH_INTERVAL_SECS", d.health_interval)?,
            health_timeout: secs("HEALTH_TIMEOUT_SECS", d.health_timeout)?,
            quote_timeout: secs("QUOTE_TIMEOUT_SECS", d.quote_timeout)?,
            chunk_timeout: secs("CHUNK_TIMEOUT_SECS", d.chunk_timeout)?,
            chunk_pause: millis("CHUNK_PAUSE_MS", d.chunk_pause)?,
            history_chunk_size: parsed("HISTORY_CHUNK_SIZE", d.history_chunk_size)?.max(1),
            analysis_chunk_size: parsed("ANALYSIS_CHUNK_SIZE", d.analysis_chunk_size)?.max(1),
            lookback_days: parsed("HISTORY_LOOKBACK_DAYS", d.lookback_days)?,
            history_tail: parsed("HISTORY_TAIL", d.history_tail)?,
            retry_attempts: parsed("RETRY_ATTEMPTS", d.retry_attempts)?.max(1),
            retry_base_delay: millis("RETRY_BASE_DELAY_MS", d.retry_base_delay)?,
            connect_scan_delay: millis("CONNECT_SCAN_DELAY_MS", d.connect_scan_delay)?,
            default_symbols: list("DEFAULT_SYMBOLS", d.default_symbols),
            accumulator_symbols: list("ACCUMULATOR_SYMBOLS", d.accumulator_symbols),
            top_recommendations: parsed("TOP_RECOMMENDATIONS", d.top_recommendations)?,
            top_strategy_members: parsed("TOP_STRATEGY_MEMBERS", d.top_strategy_members)?,
            top_accumulators: parsed("TOP_ACCUMULATORS", d.top_accumulators)?,
            breaker: BreakerConfig {
                error_threshold_pct: parsed("BREAKER_ERROR_THRESHOLD_PCT", b.error_threshold_pct)?,
                window: secs("BREAKER_WINDOW_SECS", b.window)?,
                min_calls: parsed("BREAKER_MIN_CALLS", b.min_calls)?.max(1),
                cool_down: secs("BREAKER_COOL_DOWN_SECS", b.cool_down)?,
                call_timeout: secs("BREAKER_CALL_TIMEOUT_SECS", b.call_timeout)?,
            },
        })
    }
}

fn parsed<T: FromStr>(key: &str, default: T) -> Result<T, String> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| format!("{key} has an invalid value: {raw}")),
        Err(_) => Ok(default),
    }
}

fn secs(key: &str, default: Duration) -> Result<Duration, String> {
    parsed(key, default.as_secs()).map(Duration::from_secs)
}

fn millis(key: &str, default: Duration) -> Result<Duration, String> {
    parsed(key, default.as_millis() as u64).map(Duration::from_millis)
}

/// Comma-separated list; blanks dropped. Unset keeps the default.
fn list(key: &str, default: Vec<String>) -> Vec<String> {
    env::var(key)
        .map(|raw| split_list(&raw))
        .unwrap_or(default)
}

fn owned(symbols: &[&str]) -> Vec<String> {
    symbols.iter().map(|s| s.to_string()).collect()
}

pub(crate) fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
