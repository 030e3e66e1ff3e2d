// src/utils/errors.rs

use std::{error::Error, fmt, time::Duration};
use reqwest;
use serde_json;

/// Errors coming from external API calls (HTTP, JSON, status codes, timeouts).
#[derive(Debug)]
pub enum ApiError {
    Http(reqwest::Error),
    Json(serde_json::Error),
    Status { code: u16, body: String },
    Timeout(Duration),
    Other(String),
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApiError::Http(e)                => write!(f, "HTTP error: {}", e),
            ApiError::Json(e)                => write!(f, "JSON error: {}", e),
            ApiError::Status { code, body }  => write!(f, "upstream returned {}: {}", code, body),
            ApiError::Timeout(after)         => write!(f, "timed out after {:?}", after),
            ApiError::Other(msg)             => write!(f, "{}", msg),
        }
    }
}

impl Error for ApiError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ApiError::Http(e) => Some(e),
            ApiError::Json(e) => Some(e),
            _                 => None,
        }
    }
}

// Conversions from underlying errors into ApiError
impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self { ApiError::Http(err) }
}
impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self { ApiError::Json(err) }
}

/// Persistence-side failures (watchlists, strategy definitions).
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("db: {0}")]
    Db(#[from] sqlx::Error),
}

/// Snapshot cache / pub-sub failures.
#[derive(thiserror::Error, Debug)]
pub enum CacheError {
    #[error("redis: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("serde: {0}")]
    Serde(#[from] serde_json::Error),
}

/// The three conditions that end a scan cycle before any stock data is broadcast.
#[derive(thiserror::Error, Debug)]
pub enum CycleAbort {
    #[error("Scan paused: analysis service is offline")]
    ServiceOffline,
    #[error("Scan skipped: no symbols to scan")]
    NoSymbols,
    #[error("Quote fetch failed: {0}")]
    QuoteStage(ApiError),
}
