//! Scan orchestrator.
//! -----------------------------------------------------------------
//! One cycle = gate → universe → quotes → history → analysis →
//! aggregate → broadcast. Only the gate, an empty universe and a failed
//! quote call end a cycle early; everything after that loses single
//! symbols at worst.
//!
//! Cycles never overlap: [`Scanner::trigger`] is single-flight and folds
//! any triggers that arrive mid-cycle into one follow-up run.
//! -----------------------------------------------------------------

pub mod aggregate;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Instant;

use chrono::Utc;
use regex::Regex;
use serde::Serialize;
use tracing::Instrument;
use uuid::Uuid;

use crate::config::settings::ScanConfig;
use crate::db::models::StrategyDefinition;
use crate::db::queries::WatchlistStore;
use crate::services::analysis::{AnalysisRequest, AnalysisResult, AnalysisService};
use crate::services::chunked::{run_chunked, ChunkPlan, ItemError};
use crate::services::circuit_breaker::{BreakerError, CircuitBreaker};
use crate::services::health::HealthMonitor;
use crate::services::market_data::{Bar, HistoryProvider, Quote, QuoteProvider};
use crate::services::retry::{retry_with_backoff, RetryPolicy};
use crate::services::scan_bus::{ScanBus, ScanEvent, ScanPhase};
use crate::utils::errors::{ApiError, CycleAbort};

use self::aggregate::{aggregate, ScanSnapshot};

/// External collaborators of a cycle.
#[derive(Clone)]
pub struct ScanDeps {
    pub quotes: Arc<dyn QuoteProvider>,
    pub history: Arc<dyn HistoryProvider>,
    pub analysis: Arc<dyn AnalysisService>,
    pub store: Arc<dyn WatchlistStore>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CycleOutcome {
    Completed { universe: usize, analyzed: usize },
    Paused,
    NoSymbols,
    QuoteFailed,
    /// Folded into a cycle that was already running.
    Coalesced,
}

impl CycleOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            CycleOutcome::Completed { .. } => "completed",
            CycleOutcome::Paused => "paused",
            CycleOutcome::NoSymbols => "no_symbols",
            CycleOutcome::QuoteFailed => "quote_failed",
            CycleOutcome::Coalesced => "coalesced",
        }
    }
}

impl From<&CycleAbort> for CycleOutcome {
    fn from(abort: &CycleAbort) -> Self {
        match abort {
            CycleAbort::ServiceOffline => CycleOutcome::Paused,
            CycleAbort::NoSymbols => CycleOutcome::NoSymbols,
            CycleAbort::QuoteStage(_) => CycleOutcome::QuoteFailed,
        }
    }
}

pub struct Scanner {
    deps: ScanDeps,
    config: ScanConfig,
    breaker: Arc<CircuitBreaker>,
    health: Arc<HealthMonitor>,
    bus: ScanBus,
    in_flight: tokio::sync::Mutex<()>,
    rerun_pending: AtomicBool,
    last_outcome: Mutex<Option<CycleOutcome>>,
}

impl Scanner {
    pub fn new(deps: ScanDeps, config: ScanConfig, bus: ScanBus) -> Self {
        let breaker = Arc::new(CircuitBreaker::new("analysis", config.breaker));
        let health = Arc::new(HealthMonitor::new(
            deps.analysis.clone(),
            config.health_timeout,
            bus.clone(),
        ));
        Self {
            deps,
            config,
            breaker,
            health,
            bus,
            in_flight: tokio::sync::Mutex::new(()),
            rerun_pending: AtomicBool::new(false),
            last_outcome: Mutex::new(None),
        }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    pub fn bus(&self) -> &ScanBus {
        &self.bus
    }

    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    pub fn last_outcome(&self) -> Option<CycleOutcome> {
        self.last_outcome
            .lock()
            .map(|g| (*g).clone())
            .unwrap_or_else(|poisoned| (*poisoned.into_inner()).clone())
    }

    /// Entry point for every trigger (timer, subscriber join, watchlist change).
    ///
    /// If a cycle is already running the call returns `Coalesced` at once and
    /// the running trigger performs exactly one more cycle when it finishes,
    /// however many triggers were folded into it.
    pub async fn trigger(&self) -> CycleOutcome {
        self.rerun_pending.store(true, Ordering::SeqCst);
        let mut outcome = CycleOutcome::Coalesced;
        loop {
            {
                let Ok(_guard) = self.in_flight.try_lock() else {
                    log::debug!("scan already running, trigger coalesced");
                    return outcome;
                };
                if self.rerun_pending.swap(false, Ordering::SeqCst) {
                    outcome = self.run_cycle().await;
                }
            }
            // a trigger may have slipped in between the last check and the unlock
            if !self.rerun_pending.load(Ordering::SeqCst) {
                return outcome;
            }
        }
    }

    /// One full cycle; only ever called under the `in_flight` guard.
    async fn run_cycle(&self) -> CycleOutcome {
        let cycle_id = Uuid::new_v4();
        let span = tracing::info_span!("scan_cycle", %cycle_id);
        let started = Instant::now();

        let outcome = match self.cycle().instrument(span).await {
            Ok((universe, analyzed)) => CycleOutcome::Completed { universe, analyzed },
            Err(abort) => {
                self.report_abort(&abort);
                CycleOutcome::from(&abort)
            }
        };

        let elapsed_ms = started.elapsed().as_secs_f64() * 1_000.0;
        metrics::increment_counter!("scan_cycles_total", "outcome" => outcome.label());
        metrics::histogram!("scan_cycle_ms", elapsed_ms);
        log::info!("scan cycle {cycle_id} finished: {} in {elapsed_ms:.0}ms", outcome.label());

        match self.last_outcome.lock() {
            Ok(mut g) => *g = Some(outcome.clone()),
            Err(poisoned) => *poisoned.into_inner() = Some(outcome.clone()),
        }
        outcome
    }

    async fn cycle(&self) -> Result<(usize, usize), CycleAbort> {
        // 1. gate
        if !self.health.is_available() {
            return Err(CycleAbort::ServiceOffline);
        }
        self.bus.status(ScanPhase::Starting, "Scan started");

        // 2. universe
        let universe = self.resolve_universe().await;
        if universe.is_empty() {
            return Err(CycleAbort::NoSymbols);
        }

        // 3. quotes, one bulk call
        self.bus.status(
            ScanPhase::Progress,
            format!("Fetching quotes for {} symbols", universe.len()),
        );
        let quotes = self.fetch_quotes(&universe).await?;

        // 4. history, symbol by symbol
        self.bus.status(
            ScanPhase::Progress,
            format!("Fetching price history for {} symbols", universe.len()),
        );
        let histories = self.fetch_histories(universe.clone()).await;

        // 5. analysis through the breaker
        let strategies = self.load_strategies().await;
        self.bus.status(
            ScanPhase::Progress,
            format!("Analyzing {} symbols", histories.len()),
        );
        let analyses = self
            .analyze_all(&universe, &quotes, &histories, &strategies)
            .await;

        // 6. aggregate + 7. broadcast
        let snapshot = aggregate(&universe, &quotes, &histories, &analyses, &self.config);
        let analyzed = snapshot.stocks.len();
        self.broadcast(snapshot, universe.len());
        Ok((universe.len(), analyzed))
    }

    /// Defaults first, then every tracked symbol; normalised and de-duplicated.
    pub async fn resolve_universe(&self) -> Vec<String> {
        let tracked = match self.deps.store.list_tracked_symbols().await {
            Ok(symbols) => symbols,
            Err(e) => {
                log::warn!("watchlist lookup failed, scanning defaults only: {e}");
                Vec::new()
            }
        };
        normalize_universe(self.config.default_symbols.iter().chain(tracked.iter()))
    }

    async fn fetch_quotes(&self, universe: &[String]) -> Result<HashMap<String, Quote>, CycleAbort> {
        let limit = self.config.quote_timeout;
        let quotes = tokio::time::timeout(limit, self.deps.quotes.get_quotes(universe))
            .await
            .map_err(|_| CycleAbort::QuoteStage(ApiError::Timeout(limit)))?
            .map_err(CycleAbort::QuoteStage)?;

        if quotes.is_empty() {
            return Err(CycleAbort::QuoteStage(ApiError::Other(
                "quote provider returned no quotes".into(),
            )));
        }
        Ok(quotes)
    }

    /// Symbols whose history could not be fetched (or came back empty) are left out.
    async fn fetch_histories(&self, symbols: Vec<String>) -> HashMap<String, Vec<Bar>> {
        let plan = ChunkPlan::new(
            self.config.history_chunk_size,
            self.config.chunk_timeout,
            self.config.chunk_pause,
        );
        let policy = RetryPolicy::new(self.config.retry_attempts, self.config.retry_base_delay);
        let lookback = self.config.lookback_days;
        let provider = &self.deps.history;

        let out = run_chunked(symbols.clone(), plan, |symbol: String| async move {
            let label = format!("history {symbol}");
            retry_with_backoff(policy, &label, || provider.get_history(&symbol, lookback)).await
        })
        .await;

        let mut histories = HashMap::with_capacity(symbols.len());
        for (symbol, result) in symbols.into_iter().zip(out.results) {
            match result {
                Ok(bars) if !bars.is_empty() => {
                    histories.insert(symbol, bars);
                }
                Ok(_) => log::debug!("{symbol}: empty price history, skipped"),
                Err(e) => log::warn!("{symbol}: price history unavailable: {e}"),
            }
        }
        histories
    }

    async fn load_strategies(&self) -> Vec<StrategyDefinition> {
        self.deps
            .store
            .list_strategy_definitions()
            .await
            .unwrap_or_else(|e| {
                log::warn!("custom strategies unavailable, analysing without them: {e}");
                Vec::new()
            })
    }

    async fn analyze_all(
        &self,
        universe: &[String],
        quotes: &HashMap<String, Quote>,
        histories: &HashMap<String, Vec<Bar>>,
        strategies: &[StrategyDefinition],
    ) -> HashMap<String, AnalysisResult> {
        let items: Vec<(&str, &Quote, &[Bar])> = universe
            .iter()
            .filter_map(|s| Some((s.as_str(), quotes.get(s)?, histories.get(s)?.as_slice())))
            .collect();
        let symbols: Vec<&str> = items.iter().map(|(s, _, _)| *s).collect();

        let plan = ChunkPlan::new(
            self.config.analysis_chunk_size,
            self.config.chunk_timeout,
            self.config.chunk_pause,
        );
        let breaker = &self.breaker;
        let service = &self.deps.analysis;

        let out = run_chunked(items, plan, |(_, quote, history)| async move {
            let req = AnalysisRequest { quote, history, strategies };
            breaker.execute(|| service.analyze(&req)).await
        })
        .await;

        let mut rejected = 0usize;
        let mut analyses = HashMap::with_capacity(symbols.len());
        for (symbol, result) in symbols.into_iter().zip(out.results) {
            match result {
                Ok(analysis) => {
                    analyses.insert(symbol.to_string(), analysis);
                }
                Err(ItemError::Failed(BreakerError::Open)) => rejected += 1,
                Err(e) => log::warn!("{symbol}: analysis failed: {e}"),
            }
        }
        if rejected > 0 {
            log::debug!("{rejected} analysis call(s) rejected by open breaker");
        }
        analyses
    }

    fn broadcast(&self, snapshot: ScanSnapshot, universe: usize) {
        let ScanSnapshot { stocks, strategy_index, top_buys, top_sells, accumulators } = snapshot;
        let analyzed = stocks.len();

        self.bus.publish(ScanEvent::StocksUpdate(Arc::new(stocks)));
        self.bus.publish(ScanEvent::Recommendations {
            top_buys: Arc::new(top_buys),
            top_sells: Arc::new(top_sells),
        });
        self.bus.publish(ScanEvent::StrategyMatches {
            timestamp: Utc::now(),
            groups: Arc::new(strategy_index),
        });
        self.bus.publish(ScanEvent::FastAccumulators(Arc::new(accumulators)));
        self.bus.status(
            ScanPhase::Done,
            format!("Scan complete: {analyzed} of {universe} symbols analyzed"),
        );
    }

    fn report_abort(&self, abort: &CycleAbort) {
        match abort {
            CycleAbort::ServiceOffline => log::info!("{abort}"),
            CycleAbort::NoSymbols => log::info!("{abort}"),
            CycleAbort::QuoteStage(_) => log::error!("{abort}"),
        }
        self.bus.status(ScanPhase::Error, abort.to_string());
        if let CycleAbort::QuoteStage(e) = abort {
            self.bus.publish(ScanEvent::FetchError { message: e.to_string() });
        }
    }
}

fn symbol_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^[A-Z0-9^][A-Z0-9.\-^=&]{0,19}$").ok())
        .as_ref()
}

/// Trim + upper-case, drop malformed tickers, keep the first occurrence.
pub fn normalize_universe<'a>(raw: impl IntoIterator<Item = &'a String>) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut universe = Vec::new();
    for symbol in raw {
        let symbol = symbol.trim().to_uppercase();
        if symbol.is_empty() {
            continue;
        }
        if !symbol_pattern().is_some_and(|re| re.is_match(&symbol)) {
            log::warn!("ignoring malformed symbol {symbol:?}");
            continue;
        }
        if seen.insert(symbol.clone()) {
            universe.push(symbol);
        }
    }
    universe
}
