//! Turning one cycle's stage outputs into broadcastable rankings.
//!
//! Everything here is pure and order-stable: identical inputs always produce
//! an identical [`ScanSnapshot`] (ties keep universe order).

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};

use serde::Serialize;
use statrs::statistics::{Data as StatsData, Distribution};

use crate::config::settings::ScanConfig;
use crate::services::analysis::{
    AnalysisResult, AVG_VOLUME_INDICATOR, RANKING_INDICATOR, STRONG_BUY, STRONG_SELL,
};
use crate::services::market_data::{Bar, Quote};

const VOLUME_WEIGHT: f64 = 0.7;
const CHANGE_WEIGHT: f64 = 0.3;
const AVG_VOLUME_PERIOD: usize = 20;

/// Quote + analysis + recent bars for one symbol that survived every stage.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalyzedStock {
    #[serde(flatten)]
    pub quote: Quote,
    #[serde(flatten)]
    pub analysis: AnalysisResult,
    pub history: Vec<Bar>,
}

impl AnalyzedStock {
    pub fn symbol(&self) -> &str {
        &self.quote.symbol
    }

    fn percent_change_or(&self, missing: f64) -> f64 {
        self.quote.percent_change.filter(|v| v.is_finite()).unwrap_or(missing)
    }

    fn ranking_value_or(&self, missing: f64) -> f64 {
        self.analysis.indicator(RANKING_INDICATOR).unwrap_or(missing)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StrategyGroup {
    #[serde(rename = "type")]
    pub strategy_type: String,
    pub stocks: Vec<AnalyzedStock>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Accumulator {
    pub symbol: String,
    pub display_name: Option<String>,
    pub price: Option<f64>,
    pub percent_change: f64,
    pub volume_ratio: f64,
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ScanSnapshot {
    pub stocks: Vec<AnalyzedStock>,
    pub strategy_index: BTreeMap<String, StrategyGroup>,
    pub top_buys: Vec<AnalyzedStock>,
    pub top_sells: Vec<AnalyzedStock>,
    pub accumulators: Vec<Accumulator>,
}

/// Joins the stage outputs; symbols missing a quote or an analysis are dropped.
pub fn aggregate(
    universe: &[String],
    quotes: &HashMap<String, Quote>,
    histories: &HashMap<String, Vec<Bar>>,
    analyses: &HashMap<String, AnalysisResult>,
    cfg: &ScanConfig,
) -> ScanSnapshot {
    let stocks: Vec<AnalyzedStock> = universe
        .iter()
        .filter_map(|sym| {
            let quote = quotes.get(sym)?;
            let analysis = analyses.get(sym)?;
            let history = histories
                .get(sym)
                .map(|bars| tail(bars, cfg.history_tail).to_vec())
                .unwrap_or_default();
            Some(AnalyzedStock {
                quote: quote.clone(),
                analysis: analysis.clone(),
                history,
            })
        })
        .collect();

    let accumulator_set: HashSet<String> = cfg
        .accumulator_symbols
        .iter()
        .map(|s| s.trim().to_uppercase())
        .collect();

    ScanSnapshot {
        strategy_index: strategy_index(&stocks, cfg.top_strategy_members),
        top_buys: top_recommendations(&stocks, STRONG_BUY, cfg.top_recommendations),
        top_sells: top_recommendations(&stocks, STRONG_SELL, cfg.top_recommendations),
        accumulators: fast_accumulators(&stocks, histories, &accumulator_set, cfg.top_accumulators),
        stocks,
    }
}

fn tail(bars: &[Bar], n: usize) -> &[Bar] {
    &bars[bars.len().saturating_sub(n)..]
}

/// strategy name → type + its members, best percent change first.
pub fn strategy_index(stocks: &[AnalyzedStock], limit: usize) -> BTreeMap<String, StrategyGroup> {
    let mut index: BTreeMap<String, StrategyGroup> = BTreeMap::new();
    for stock in stocks {
        for m in &stock.analysis.matched_strategies {
            let group = index
                .entry(m.strategy_name.clone())
                .or_insert_with(|| StrategyGroup {
                    strategy_type: m.strategy_type.clone(),
                    stocks: Vec::new(),
                });
            // a strategy listed twice for one stock counts once
            if group.stocks.last().map(AnalyzedStock::symbol) != Some(stock.symbol()) {
                group.stocks.push(stock.clone());
            }
        }
    }
    for group in index.values_mut() {
        group.stocks.sort_by(|a, b| {
            b.percent_change_or(f64::NEG_INFINITY)
                .total_cmp(&a.percent_change_or(f64::NEG_INFINITY))
        });
        group.stocks.truncate(limit);
    }
    index
}

/// STRONG BUY: most oversold first (ascending indicator).
/// STRONG SELL: most overbought first (descending indicator).
/// Stocks without the indicator rank last.
pub fn top_recommendations(stocks: &[AnalyzedStock], label: &str, limit: usize) -> Vec<AnalyzedStock> {
    let mut picks: Vec<AnalyzedStock> = stocks
        .iter()
        .filter(|s| s.analysis.is_recommended(label))
        .cloned()
        .collect();

    let order: fn(&AnalyzedStock, &AnalyzedStock) -> Ordering = if label == STRONG_SELL {
        |a, b| {
            b.ranking_value_or(f64::NEG_INFINITY)
                .total_cmp(&a.ranking_value_or(f64::NEG_INFINITY))
        }
    } else {
        |a, b| {
            a.ranking_value_or(f64::INFINITY)
                .total_cmp(&b.ranking_value_or(f64::INFINITY))
        }
    };
    picks.sort_by(order);
    picks.truncate(limit);
    picks
}

/// Volume-surge × price-change ranking over the configured liquid subset.
pub fn fast_accumulators(
    stocks: &[AnalyzedStock],
    histories: &HashMap<String, Vec<Bar>>,
    eligible: &HashSet<String>,
    limit: usize,
) -> Vec<Accumulator> {
    let mut ranked: Vec<Accumulator> = stocks
        .iter()
        .filter(|s| eligible.contains(s.symbol()))
        .filter_map(|s| {
            let avg = s
                .analysis
                .indicator(AVG_VOLUME_INDICATOR)
                .or_else(|| {
                    histories
                        .get(s.symbol())
                        .and_then(|bars| average_volume(bars, AVG_VOLUME_PERIOD))
                })?;
            let entry = score_accumulator(s.quote.percent_change?, s.quote.volume?, avg)?;
            Some(Accumulator {
                symbol: s.quote.symbol.clone(),
                display_name: s.quote.display_name.clone(),
                price: s.quote.price,
                percent_change: entry.0,
                volume_ratio: entry.1,
                score: entry.2,
            })
        })
        .collect();

    ranked.sort_by(|a, b| b.score.total_cmp(&a.score));
    ranked.truncate(limit);
    ranked
}

/// `(percent_change, volume_ratio, score)` when the stock qualifies.
pub fn score_accumulator(percent_change: f64, volume: f64, avg_volume: f64) -> Option<(f64, f64, f64)> {
    if !(percent_change > 0.0) || !(avg_volume > 0.0) || !volume.is_finite() {
        return None;
    }
    let ratio = volume / avg_volume;
    let score = VOLUME_WEIGHT * ratio + CHANGE_WEIGHT * percent_change;
    (score > 0.0 && score.is_finite()).then_some((percent_change, ratio, score))
}

/// Mean volume of up to `period` sessions before the latest bar.
pub fn average_volume(bars: &[Bar], period: usize) -> Option<f64> {
    if bars.len() < 2 {
        return None;
    }
    let prior = &bars[..bars.len() - 1];
    let window: Vec<f64> = tail(prior, period).iter().map(|b| b.volume).collect();
    StatsData::new(window).mean().filter(|m| *m > 0.0)
}
