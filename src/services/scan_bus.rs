//! Typed fan-out for everything a scan cycle reports.
//! -----------------------------------------------------------------
//! ‣ One `tokio::broadcast` ring; every event carries its own topic.
//! ‣ Fire-and-forget: publishing with nobody listening is not an error,
//!   and a subscriber that falls behind simply skips ahead.
//! ‣ Payloads sit behind `Arc` so a fan-out to N sockets clones pointers,
//!   not stock lists.
//!
//! Usage from a transport task:
//! ```ignore
//! let mut rx = bus.subscribe();
//! while let Ok(ev) = rx.recv().await { socket.send(ev.to_json()?).await?; }
//! ```
//! -----------------------------------------------------------------

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast::{self, Receiver, Sender};

use crate::services::scanner::aggregate::{Accumulator, AnalyzedStock, StrategyGroup};

const CAPACITY: usize = 256; // ring-buffer shared by all topics

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanPhase {
    Starting,
    Progress,
    Done,
    Error,
}

/// Wire shape: `{"topic": "<snake_case>", "payload": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "topic", content = "payload", rename_all = "snake_case")]
pub enum ScanEvent {
    ScanStatus {
        message: String,
        phase: ScanPhase,
    },
    StocksUpdate(Arc<Vec<AnalyzedStock>>),
    #[serde(rename_all = "camelCase")]
    Recommendations {
        top_buys: Arc<Vec<AnalyzedStock>>,
        top_sells: Arc<Vec<AnalyzedStock>>,
    },
    StrategyMatches {
        timestamp: DateTime<Utc>,
        groups: Arc<BTreeMap<String, StrategyGroup>>,
    },
    FastAccumulators(Arc<Vec<Accumulator>>),
    ServiceStatus {
        available: bool,
    },
    FetchError {
        message: String,
    },
}

impl ScanEvent {
    pub fn status(phase: ScanPhase, message: impl Into<String>) -> Self {
        ScanEvent::ScanStatus { message: message.into(), phase }
    }

    pub fn topic(&self) -> &'static str {
        match self {
            ScanEvent::ScanStatus { .. } => "scan_status",
            ScanEvent::StocksUpdate(_) => "stocks_update",
            ScanEvent::Recommendations { .. } => "recommendations",
            ScanEvent::StrategyMatches { .. } => "strategy_matches",
            ScanEvent::FastAccumulators(_) => "fast_accumulators",
            ScanEvent::ServiceStatus { .. } => "service_status",
            ScanEvent::FetchError { .. } => "fetch_error",
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[derive(Clone)]
pub struct ScanBus {
    tx: Sender<ScanEvent>,
}

impl ScanBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CAPACITY);
        Self { tx }
    }

    /// Returns how many subscribers the event reached (0 is fine).
    pub fn publish(&self, event: ScanEvent) -> usize {
        log::trace!("bus: {}", event.topic());
        self.tx.send(event).unwrap_or(0)
    }

    pub fn status(&self, phase: ScanPhase, message: impl Into<String>) -> usize {
        self.publish(ScanEvent::status(phase, message))
    }

    pub fn subscribe(&self) -> Receiver<ScanEvent> {
        self.tx.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for ScanBus {
    fn default() -> Self {
        Self::new()
    }
}
