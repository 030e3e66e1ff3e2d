// tests/scan_pipeline.rs
mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use common::*;
use scanraptor_backend::services::{
    analysis::{STRONG_BUY, STRONG_SELL},
    circuit_breaker::BreakerState,
    scan_bus::{ScanEvent, ScanPhase},
    scanner::CycleOutcome,
    scheduler,
};

fn stock_symbols(events: &[ScanEvent]) -> Option<Vec<String>> {
    events.iter().find_map(|ev| match ev {
        ScanEvent::StocksUpdate(stocks) => Some(stocks.iter().map(|s| s.quote.symbol.clone()).collect()),
        _ => None,
    })
}

fn statuses(events: &[ScanEvent]) -> Vec<(ScanPhase, String)> {
    events
        .iter()
        .filter_map(|ev| match ev {
            ScanEvent::ScanStatus { message, phase } => Some((*phase, message.clone())),
            _ => None,
        })
        .collect()
}

fn healthy() -> MockAnalysis {
    MockAnalysis { healthy: true, ..MockAnalysis::default() }
}

// ─── Partial failure ────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn history_failure_drops_only_that_symbol() {
    let mut market = MockMarket::with(&[("A", 1.0), ("B", 2.0)]);
    market.history_fails.insert("B".into());
    let mut analysis = healthy();
    analysis.verdicts.insert("A".into(), (20.0, Some(STRONG_BUY), vec!["Oversold"]));
    analysis.verdicts.insert("B".into(), (10.0, Some(STRONG_BUY), vec!["Oversold"]));

    let h = harness(market, analysis, MockStore::default(), test_config(&["A", "B"]));
    h.scanner.health().set_available(true);
    let mut rx = h.bus.subscribe();

    let outcome = h.scanner.trigger().await;
    assert_eq!(outcome, CycleOutcome::Completed { universe: 2, analyzed: 1 });

    // B was retried, then given up on; it never reached the analysis service
    assert_eq!(h.market.history_calls.load(Ordering::SeqCst), 1 + 2);
    assert_eq!(h.analysis.analyze_calls.load(Ordering::SeqCst), 1);

    let events = drain(&mut rx);
    assert_eq!(stock_symbols(&events), Some(vec!["A".to_string()]));

    for ev in &events {
        match ev {
            ScanEvent::Recommendations { top_buys, top_sells } => {
                assert_eq!(top_buys.len(), 1);
                assert_eq!(top_buys[0].quote.symbol, "A");
                assert!(top_sells.is_empty());
            }
            ScanEvent::StrategyMatches { groups, .. } => {
                let members: Vec<_> = groups["Oversold"].stocks.iter().map(|s| s.symbol()).collect();
                assert_eq!(members, vec!["A"]);
            }
            ScanEvent::FastAccumulators(acc) => assert!(acc.iter().all(|a| a.symbol == "A")),
            _ => {}
        }
    }

    let last = statuses(&events).pop().unwrap();
    assert_eq!(last.0, ScanPhase::Done);
}

#[tokio::test(start_paused = true)]
async fn history_tail_is_trimmed() {
    let market = MockMarket::with(&[("A", 1.0)]);
    let mut config = test_config(&["A"]);
    config.history_tail = 7;
    let h = harness(market, healthy(), MockStore::default(), config);
    h.scanner.health().set_available(true);
    let mut rx = h.bus.subscribe();

    h.scanner.trigger().await;
    let events = drain(&mut rx);
    let stocks = events
        .iter()
        .find_map(|ev| match ev {
            ScanEvent::StocksUpdate(s) => Some(s.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(stocks[0].history.len(), 7);
    assert_eq!(stocks[0].history.last(), bars(60).last());
}

// ─── Fatal aborts ───────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn offline_service_pauses_without_touching_providers() {
    let h = harness(
        MockMarket::with(&[("A", 1.0)]),
        healthy(),
        MockStore::default(),
        test_config(&["A"]),
    );
    // never probed → still unavailable
    let mut rx = h.bus.subscribe();

    assert_eq!(h.scanner.trigger().await, CycleOutcome::Paused);
    assert_eq!(h.market.quote_calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.market.history_calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.analysis.analyze_calls.load(Ordering::SeqCst), 0);

    let events = drain(&mut rx);
    assert_eq!(events.len(), 1, "only the paused status: {events:?}");
    match &events[0] {
        ScanEvent::ScanStatus { message, phase } => {
            assert_eq!(*phase, ScanPhase::Error);
            assert!(message.to_lowercase().contains("paused"));
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn quote_failure_aborts_with_fetch_error() {
    let mut market = MockMarket::with(&[("A", 1.0)]);
    market.quotes_fail = true;
    let h = harness(market, healthy(), MockStore::default(), test_config(&["A"]));
    h.scanner.health().set_available(true);
    let mut rx = h.bus.subscribe();

    assert_eq!(h.scanner.trigger().await, CycleOutcome::QuoteFailed);
    assert_eq!(h.market.history_calls.load(Ordering::SeqCst), 0);

    let events = drain(&mut rx);
    assert!(stock_symbols(&events).is_none());
    assert!(events.iter().any(|e| matches!(e, ScanEvent::FetchError { .. })));
    assert_eq!(statuses(&events).last().map(|s| s.0), Some(ScanPhase::Error));
}

#[tokio::test(start_paused = true)]
async fn hung_quote_provider_is_cut_off() {
    let mut market = MockMarket::with(&[("A", 1.0)]);
    market.quote_delay = Duration::from_secs(300);
    let h = harness(market, healthy(), MockStore::default(), test_config(&["A"]));
    h.scanner.health().set_available(true);

    let started = tokio::time::Instant::now();
    assert_eq!(h.scanner.trigger().await, CycleOutcome::QuoteFailed);
    assert!(started.elapsed() < Duration::from_secs(21));
}

#[tokio::test(start_paused = true)]
async fn empty_universe_is_reported() {
    let h = harness(MockMarket::default(), healthy(), MockStore::default(), test_config(&[]));
    h.scanner.health().set_available(true);
    let mut rx = h.bus.subscribe();

    assert_eq!(h.scanner.trigger().await, CycleOutcome::NoSymbols);
    assert_eq!(h.market.quote_calls.load(Ordering::SeqCst), 0);
    let events = drain(&mut rx);
    assert!(stock_symbols(&events).is_none());
    assert_eq!(statuses(&events).last().map(|s| s.0), Some(ScanPhase::Error));
}

// ─── Universe resolution ────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn tracked_symbols_join_defaults() {
    let store = MockStore { tracked: owned(&["msft", "A", "AAPL"]), fail: false };
    let h = harness(MockMarket::default(), healthy(), store, test_config(&["A"]));
    assert_eq!(h.scanner.resolve_universe().await, owned(&["A", "MSFT", "AAPL"]));
}

#[tokio::test(start_paused = true)]
async fn store_outage_falls_back_to_defaults() {
    let store = MockStore { tracked: vec![], fail: true };
    let h = harness(MockMarket::default(), healthy(), store, test_config(&["A", "B"]));
    assert_eq!(h.scanner.resolve_universe().await, owned(&["A", "B"]));
}

// ─── Single flight ──────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn concurrent_triggers_coalesce_into_one_rerun() {
    let mut market = MockMarket::with(&[("A", 1.0)]);
    market.quote_delay = Duration::from_secs(1);
    let h = harness(market, healthy(), MockStore::default(), test_config(&["A"]));
    h.scanner.health().set_available(true);

    let first = {
        let scanner = Arc::clone(&h.scanner);
        tokio::spawn(async move { scanner.trigger().await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(h.scanner.trigger().await, CycleOutcome::Coalesced);
    assert_eq!(h.scanner.trigger().await, CycleOutcome::Coalesced);

    let outcome = first.await.unwrap();
    assert!(matches!(outcome, CycleOutcome::Completed { analyzed: 1, .. }));
    // the running cycle plus exactly one follow-up
    assert_eq!(h.market.quote_calls.load(Ordering::SeqCst), 2);
}

// ─── Determinism ────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn identical_inputs_broadcast_identical_results() {
    let market = MockMarket::with(&[("A", 3.0), ("B", 1.0), ("C", 2.0), ("D", -1.0)]);
    let mut analysis = healthy();
    analysis.verdicts.insert("A".into(), (80.0, Some(STRONG_SELL), vec!["Hot"]));
    analysis.verdicts.insert("B".into(), (20.0, Some(STRONG_BUY), vec!["Hot", "Cold"]));
    analysis.verdicts.insert("C".into(), (20.0, Some(STRONG_BUY), vec!["Cold"]));
    let h = harness(market, analysis, MockStore::default(), test_config(&["A", "B", "C", "D"]));
    h.scanner.health().set_available(true);
    let mut rx = h.bus.subscribe();

    let data_json = |events: Vec<ScanEvent>| -> Vec<String> {
        events
            .into_iter()
            .filter(|e| !matches!(e, ScanEvent::ScanStatus { .. } | ScanEvent::StrategyMatches { .. }))
            .map(|e| e.to_json().unwrap())
            .collect()
    };

    h.scanner.trigger().await;
    let first = data_json(drain(&mut rx));
    h.scanner.trigger().await;
    let second = data_json(drain(&mut rx));

    assert_eq!(first.len(), 3);
    assert_eq!(first, second);
}

// ─── Breaker ────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn failing_analysis_opens_breaker_and_marks_service_offline() {
    let symbols: Vec<String> = (0..12).map(|i| format!("S{i}")).collect();
    let pairs: Vec<(&str, f64)> = symbols.iter().map(|s| (s.as_str(), 1.0)).collect();
    let market = MockMarket::with(&pairs);
    let analysis = MockAnalysis { healthy: true, always_fail: true, ..MockAnalysis::default() };
    let refs: Vec<&str> = symbols.iter().map(String::as_str).collect();
    let h = harness(market, analysis, MockStore::default(), test_config(&refs));
    h.scanner.health().set_available(true);
    let _bridge = scheduler::spawn_breaker_bridge(Arc::clone(&h.scanner));
    let mut rx = h.bus.subscribe();

    let outcome = h.scanner.trigger().await;
    assert_eq!(outcome, CycleOutcome::Completed { universe: 12, analyzed: 0 });
    assert_eq!(h.scanner.breaker().state(), BreakerState::Open);
    // the first failure trips the breaker; every later call fails fast
    assert_eq!(h.analysis.analyze_calls.load(Ordering::SeqCst), 1);

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(!h.scanner.health().is_available());
    let events = drain(&mut rx);
    assert!(events.contains(&ScanEvent::ServiceStatus { available: false }));

    // next cycle is gated
    assert_eq!(h.scanner.trigger().await, CycleOutcome::Paused);
}

#[tokio::test(start_paused = true)]
async fn probe_reopens_the_gate() {
    let h = harness(
        MockMarket::with(&[("A", 1.0)]),
        healthy(),
        MockStore::default(),
        test_config(&["A"]),
    );
    assert_eq!(h.scanner.trigger().await, CycleOutcome::Paused);
    assert!(h.scanner.health().check_once().await);
    assert!(matches!(h.scanner.trigger().await, CycleOutcome::Completed { .. }));
    assert_eq!(
        h.scanner.last_outcome(),
        Some(CycleOutcome::Completed { universe: 1, analyzed: 1 })
    );
}
