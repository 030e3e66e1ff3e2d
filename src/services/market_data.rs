//! Quote / history provider seam and its Yahoo-shaped HTTP adapter.
//! -----------------------------------------------------------------
//! ‣ `QuoteProvider::get_quotes` is one bulk call for the whole universe.
//! ‣ `HistoryProvider::get_history` is per symbol, daily bars, ascending.
//! ‣ Field names on `Quote` follow the provider payload; the analysis
//!   service reads the same names.
//! -----------------------------------------------------------------

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder, Url};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::utils::errors::ApiError;

/// Point-in-time snapshot for one symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub symbol: String,
    #[serde(rename = "shortName", alias = "displayName", default)]
    pub display_name: Option<String>,
    #[serde(rename = "regularMarketPrice", default)]
    pub price: Option<f64>,
    #[serde(rename = "regularMarketChangePercent", default)]
    pub percent_change: Option<f64>,
    #[serde(rename = "regularMarketVolume", default)]
    pub volume: Option<f64>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(rename = "fiftyTwoWeekHigh", default)]
    pub fifty_two_week_high: Option<f64>,
    #[serde(rename = "fiftyTwoWeekLow", default)]
    pub fifty_two_week_low: Option<f64>,
}

/// One daily OHLCV session.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub date:   DateTime<Utc>,
    pub open:   f64,
    pub high:   f64,
    pub low:    f64,
    pub close:  f64,
    pub volume: f64,
}

#[async_trait]
pub trait QuoteProvider: Send + Sync {
    async fn get_quotes(&self, symbols: &[String]) -> Result<HashMap<String, Quote>, ApiError>;
}

#[async_trait]
pub trait HistoryProvider: Send + Sync {
    async fn get_history(&self, symbol: &str, lookback_days: u32) -> Result<Vec<Bar>, ApiError>;
}

// ================================================================
// HTTP adapter
// ================================================================

#[derive(Clone)]
pub struct HttpMarketData {
    http: Client,
    base_url: String,
}

impl HttpMarketData {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// `base_url` + fixed path + one percent-encoded trailing segment per `segments`.
    fn endpoint(&self, path: &str, segments: &[&str]) -> Result<Url, ApiError> {
        let mut url = Url::parse(&format!("{}{path}", self.base_url))
            .map_err(|e| ApiError::Other(format!("bad market data URL: {e}")))?;
        url.path_segments_mut()
            .map_err(|_| ApiError::Other(format!("market data URL cannot take a path: {}", self.base_url)))?
            .extend(segments);
        Ok(url)
    }

    async fn get_text(&self, req: RequestBuilder) -> Result<String, ApiError> {
        let resp = req.send().await?;
        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            return Err(ApiError::Status { code: status.as_u16(), body });
        }
        Ok(body)
    }
}

#[async_trait]
impl QuoteProvider for HttpMarketData {
    async fn get_quotes(&self, symbols: &[String]) -> Result<HashMap<String, Quote>, ApiError> {
        if symbols.is_empty() {
            return Ok(HashMap::new());
        }
        let url = self.endpoint("/v7/finance/quote", &[])?;
        let req = self.http.get(url).query(&[("symbols", symbols.join(","))]);
        let body = self.get_text(req).await?;
        parse_quote_response(&body)
    }
}

#[async_trait]
impl HistoryProvider for HttpMarketData {
    async fn get_history(&self, symbol: &str, lookback_days: u32) -> Result<Vec<Bar>, ApiError> {
        let url = self.endpoint("/v8/finance/chart", &[symbol])?;
        let req = self
            .http
            .get(url)
            .query(&[("range", format!("{lookback_days}d")), ("interval", "1d".to_string())]);
        let body = self.get_text(req).await?;
        parse_chart_response(&body)
    }
}

/* ─────────────────────────────────────────  wire structs ─ */

#[derive(Debug, Deserialize)]
struct QuoteEnvelope {
    #[serde(rename = "quoteResponse")]
    quote_response: QuoteResult,
}

#[derive(Debug, Deserialize)]
struct QuoteResult {
    #[serde(default)]
    result: Vec<Quote>,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct ChartEnvelope {
    chart: ChartData,
}

#[derive(Debug, Deserialize)]
struct ChartData {
    #[serde(default)]
    result: Option<Vec<ChartResult>>,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct ChartResult {
    #[serde(default)]
    timestamp: Vec<i64>,
    indicators: ChartIndicators,
}

#[derive(Debug, Deserialize)]
struct ChartIndicators {
    quote: Vec<ChartQuote>,
}

#[derive(Debug, Deserialize)]
struct ChartQuote {
    #[serde(default)]
    open: Vec<Option<f64>>,
    #[serde(default)]
    high: Vec<Option<f64>>,
    #[serde(default)]
    low: Vec<Option<f64>>,
    #[serde(default)]
    close: Vec<Option<f64>>,
    #[serde(default)]
    volume: Vec<Option<f64>>,
}

fn upstream_error(err: &Option<Value>) -> Option<String> {
    match err {
        None | Some(Value::Null) => None,
        Some(v) => Some(v.to_string()),
    }
}

/// Quotes keyed by symbol; entries without a symbol are impossible by construction.
pub(crate) fn parse_quote_response(body: &str) -> Result<HashMap<String, Quote>, ApiError> {
    let env: QuoteEnvelope = serde_json::from_str(body)?;
    if let Some(e) = upstream_error(&env.quote_response.error) {
        return Err(ApiError::Other(format!("quote API error: {e}")));
    }
    Ok(env
        .quote_response
        .result
        .into_iter()
        .map(|q| (q.symbol.clone(), q))
        .collect())
}

/// Bars ascending by date; sessions with any missing field are skipped.
pub(crate) fn parse_chart_response(body: &str) -> Result<Vec<Bar>, ApiError> {
    let env: ChartEnvelope = serde_json::from_str(body)?;
    if let Some(e) = upstream_error(&env.chart.error) {
        return Err(ApiError::Other(format!("chart API error: {e}")));
    }
    let Some(result) = env.chart.result.and_then(|r| r.into_iter().next()) else {
        return Ok(vec![]);
    };
    let Some(q) = result.indicators.quote.first() else {
        return Ok(vec![]);
    };

    let at = |v: &Vec<Option<f64>>, i: usize| v.get(i).copied().flatten();
    let mut bars: Vec<Bar> = result
        .timestamp
        .iter()
        .enumerate()
        .filter_map(|(i, &ts)| {
            Some(Bar {
                date: DateTime::<Utc>::from_timestamp(ts, 0)?,
                open: at(&q.open, i)?,
                high: at(&q.high, i)?,
                low: at(&q.low, i)?,
                close: at(&q.close, i)?,
                volume: at(&q.volume, i)?,
            })
        })
        .collect();
    bars.sort_by_key(|b| b.date);
    Ok(bars)
}
