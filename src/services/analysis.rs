// src/services/analysis.rs

//!  Analysis-service adapter
//!
//!  * `POST /analyze` with `{quote, history, strategies}` → [`AnalysisResult`]
//!  * `GET  /health`  → any 2xx means healthy
//!
//!  Indicator maths lives entirely on the remote side; the scanner only reads
//!  a couple of named indicators back out of the result.

use std::collections::BTreeMap;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    db::models::StrategyDefinition,
    services::market_data::{Bar, Quote},
    utils::errors::ApiError,
};

/// Indicator used to rank STRONG BUY / STRONG SELL picks.
pub const RANKING_INDICATOR: &str = "rsi";
/// 20-session average volume, as reported by the service.
pub const AVG_VOLUME_INDICATOR: &str = "avgVolume20";

pub const STRONG_BUY: &str = "STRONG BUY";
pub const STRONG_SELL: &str = "STRONG SELL";

#[derive(Debug, Serialize)]
pub struct AnalysisRequest<'a> {
    pub quote: &'a Quote,
    pub history: &'a [Bar],
    pub strategies: &'a [StrategyDefinition],
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyMatch {
    #[serde(rename = "name", alias = "strategyName")]
    pub strategy_name: String,
    #[serde(rename = "type", alias = "strategyType")]
    pub strategy_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisResult {
    /// Named indicator values; nested groups (macd, bbands, …) pass through untouched.
    #[serde(default)]
    pub indicators: BTreeMap<String, Value>,
    #[serde(default)]
    pub signal: Option<String>,
    #[serde(default)]
    pub recommended_signal: Option<String>,
    #[serde(rename = "customStrategyMatches", alias = "matchedStrategies", default)]
    pub matched_strategies: Vec<StrategyMatch>,
}

impl AnalysisResult {
    /// Numeric top-level indicator, if present and finite.
    pub fn indicator(&self, name: &str) -> Option<f64> {
        self.indicators
            .get(name)
            .and_then(Value::as_f64)
            .filter(|v| v.is_finite())
    }

    pub fn is_recommended(&self, label: &str) -> bool {
        self.recommended_signal.as_deref() == Some(label)
    }
}

#[async_trait]
pub trait AnalysisService: Send + Sync {
    async fn analyze(&self, req: &AnalysisRequest<'_>) -> Result<AnalysisResult, ApiError>;
    /// Cheap liveness probe, separate from `analyze`.
    async fn health(&self) -> Result<(), ApiError>;
}

#[derive(Clone)]
pub struct HttpAnalysisClient {
    http: Client,
    base_url: String,
}

impl HttpAnalysisClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl AnalysisService for HttpAnalysisClient {
    async fn analyze(&self, req: &AnalysisRequest<'_>) -> Result<AnalysisResult, ApiError> {
        let resp = self
            .http
            .post(format!("{}/analyze", self.base_url))
            .json(req)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ApiError::Status { code: status.as_u16(), body });
        }
        Ok(resp.json::<AnalysisResult>().await?)
    }

    async fn health(&self) -> Result<(), ApiError> {
        let resp = self.http.get(format!("{}/health", self.base_url)).send().await?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(ApiError::Status { code: resp.status().as_u16(), body: String::new() })
        }
    }
}
