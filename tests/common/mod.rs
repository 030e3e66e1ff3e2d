// tests/common/mod.rs
//! In-memory providers shared by the integration tests.
#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use serde_json::json;

use scanraptor_backend::{
    config::settings::ScanConfig,
    db::{models::StrategyDefinition, queries::WatchlistStore},
    services::{
        analysis::{AnalysisRequest, AnalysisResult, AnalysisService, StrategyMatch},
        market_data::{Bar, HistoryProvider, Quote, QuoteProvider},
        scan_bus::{ScanBus, ScanEvent},
        scanner::{ScanDeps, Scanner},
    },
    utils::errors::{ApiError, StoreError},
};

pub fn owned(v: &[&str]) -> Vec<String> {
    v.iter().map(|s| s.to_string()).collect()
}

pub fn quote(symbol: &str, pct: f64) -> Quote {
    Quote {
        symbol: symbol.to_string(),
        display_name: Some(format!("{symbol} Corp")),
        price: Some(50.0),
        percent_change: Some(pct),
        volume: Some(3_000.0),
        currency: Some("USD".into()),
        fifty_two_week_high: Some(60.0),
        fifty_two_week_low: Some(40.0),
    }
}

pub fn bars(n: usize) -> Vec<Bar> {
    let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    (0..n)
        .map(|i| Bar {
            date: start + chrono::Duration::days(i as i64),
            open: 50.0,
            high: 51.0,
            low: 49.0,
            close: 50.0 + i as f64 * 0.1,
            volume: 1_000.0,
        })
        .collect()
}

// ---------------------------------------------------------------- market data

#[derive(Default)]
pub struct MockMarket {
    /// Symbols the provider knows; unknown ones are silently absent.
    pub known: HashMap<String, Quote>,
    pub quotes_fail: bool,
    pub quote_delay: Duration,
    pub history_fails: HashSet<String>,
    pub quote_calls: AtomicUsize,
    pub history_calls: AtomicUsize,
}

impl MockMarket {
    pub fn with(symbols: &[(&str, f64)]) -> Self {
        Self {
            known: symbols.iter().map(|(s, p)| (s.to_string(), quote(s, *p))).collect(),
            ..Self::default()
        }
    }
}

#[async_trait]
impl QuoteProvider for MockMarket {
    async fn get_quotes(&self, symbols: &[String]) -> Result<HashMap<String, Quote>, ApiError> {
        self.quote_calls.fetch_add(1, Ordering::SeqCst);
        if !self.quote_delay.is_zero() {
            tokio::time::sleep(self.quote_delay).await;
        }
        if self.quotes_fail {
            return Err(ApiError::Status { code: 502, body: "bad gateway".into() });
        }
        Ok(symbols
            .iter()
            .filter_map(|s| self.known.get(s).map(|q| (s.clone(), q.clone())))
            .collect())
    }
}

#[async_trait]
impl HistoryProvider for MockMarket {
    async fn get_history(&self, symbol: &str, _lookback_days: u32) -> Result<Vec<Bar>, ApiError> {
        self.history_calls.fetch_add(1, Ordering::SeqCst);
        if self.history_fails.contains(symbol) {
            return Err(ApiError::Other(format!("no chart for {symbol}")));
        }
        Ok(bars(60))
    }
}

// ------------------------------------------------------------------ analysis

#[derive(Default)]
pub struct MockAnalysis {
    /// symbol → (rsi, recommendedSignal, matched strategy names)
    pub verdicts: HashMap<String, (f64, Option<&'static str>, Vec<&'static str>)>,
    pub always_fail: bool,
    pub healthy: bool,
    pub analyze_calls: AtomicUsize,
}

#[async_trait]
impl AnalysisService for MockAnalysis {
    async fn analyze(&self, req: &AnalysisRequest<'_>) -> Result<AnalysisResult, ApiError> {
        self.analyze_calls.fetch_add(1, Ordering::SeqCst);
        if self.always_fail {
            return Err(ApiError::Status { code: 500, body: "boom".into() });
        }
        let (rsi, rec, matches) = self
            .verdicts
            .get(&req.quote.symbol)
            .cloned()
            .unwrap_or((50.0, None, vec![]));
        let mut indicators = BTreeMap::new();
        indicators.insert("rsi".to_string(), json!(rsi));
        indicators.insert("avgVolume20".to_string(), json!(1_000.0));
        Ok(AnalysisResult {
            indicators,
            signal: None,
            recommended_signal: rec.map(str::to_string),
            matched_strategies: matches
                .into_iter()
                .map(|name| StrategyMatch { strategy_name: name.into(), strategy_type: "Bullish".into() })
                .collect(),
        })
    }

    async fn health(&self) -> Result<(), ApiError> {
        if self.healthy {
            Ok(())
        } else {
            Err(ApiError::Status { code: 503, body: String::new() })
        }
    }
}

// --------------------------------------------------------------------- store

#[derive(Default)]
pub struct MockStore {
    pub tracked: Vec<String>,
    pub fail: bool,
}

#[async_trait]
impl WatchlistStore for MockStore {
    async fn list_tracked_symbols(&self) -> Result<Vec<String>, StoreError> {
        if self.fail {
            return Err(StoreError::Db(sqlx::Error::PoolTimedOut));
        }
        Ok(self.tracked.clone())
    }

    async fn list_strategy_definitions(&self) -> Result<Vec<StrategyDefinition>, StoreError> {
        Ok(vec![])
    }
}

// ------------------------------------------------------------------- wiring

pub struct Harness {
    pub scanner: Arc<Scanner>,
    pub market: Arc<MockMarket>,
    pub analysis: Arc<MockAnalysis>,
    pub bus: ScanBus,
}

pub fn test_config(defaults: &[&str]) -> ScanConfig {
    ScanConfig {
        default_symbols: owned(defaults),
        accumulator_symbols: owned(defaults),
        ..ScanConfig::default()
    }
}

pub fn harness(market: MockMarket, analysis: MockAnalysis, store: MockStore, config: ScanConfig) -> Harness {
    let market = Arc::new(market);
    let analysis = Arc::new(analysis);
    let bus = ScanBus::new();
    let deps = ScanDeps {
        quotes: market.clone(),
        history: market.clone(),
        analysis: analysis.clone(),
        store: Arc::new(store),
    };
    let scanner = Arc::new(Scanner::new(deps, config, bus.clone()));
    Harness { scanner, market, analysis, bus }
}

/// Everything currently buffered on a receiver.
pub fn drain(rx: &mut tokio::sync::broadcast::Receiver<ScanEvent>) -> Vec<ScanEvent> {
    let mut out = vec![];
    while let Ok(ev) = rx.try_recv() {
        out.push(ev);
    }
    out
}
