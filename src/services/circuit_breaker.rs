//! Circuit breaker guarding calls to the analysis service.
//!
//! * CLOSED: calls pass; outcomes are kept for a sliding observation window.
//!   Once the failure ratio inside the window reaches the threshold the
//!   breaker opens.
//! * OPEN: calls fail fast with [`BreakerError::Open`] until the cool-down
//!   has elapsed, then the next caller becomes the half-open trial.
//! * HALF_OPEN: exactly one trial is in flight; success closes (counters
//!   reset), failure reopens with a fresh cool-down.
//!
//! Every call is bounded by `call_timeout`; a timeout counts as a failure.
//! Transitions are published on a broadcast channel (see [`CircuitBreaker::subscribe`]).

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Observable transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerEvent {
    Opened,
    HalfOpen,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BreakerConfig {
    /// Failure percentage (0-100) inside the window that trips the breaker.
    pub error_threshold_pct: f64,
    pub window: Duration,
    /// Calls needed inside the window before the ratio is evaluated.
    pub min_calls: u32,
    pub cool_down: Duration,
    pub call_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            error_threshold_pct: 50.0,
            window: Duration::from_secs(10),
            min_calls: 1,
            cool_down: Duration::from_secs(30),
            call_timeout: Duration::from_secs(15),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum BreakerError<E> {
    #[error("circuit breaker is open")]
    Open,
    #[error("call timed out after {0:?}")]
    Timeout(Duration),
    #[error("{0}")]
    Inner(E),
}

impl<E> BreakerError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, BreakerError::Open)
    }
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    /// `(finished_at, failed)` for calls completed while CLOSED.
    outcomes: VecDeque<(Instant, bool)>,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

impl Default for Inner {
    fn default() -> Self {
        Self {
            state: BreakerState::Closed,
            outcomes: VecDeque::new(),
            opened_at: None,
            trial_in_flight: false,
        }
    }
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: &'static str,
    config: BreakerConfig,
    inner: Mutex<Inner>,
    events: broadcast::Sender<BreakerEvent>,
}

impl CircuitBreaker {
    pub fn new(name: &'static str, config: BreakerConfig) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            name,
            config,
            inner: Mutex::new(Inner::default()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BreakerEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    /// `(calls, failures)` currently inside the observation window.
    pub fn window_counts(&self) -> (usize, usize) {
        let mut inner = self.lock();
        self.prune(&mut inner, Instant::now());
        let failures = inner.outcomes.iter().filter(|(_, failed)| *failed).count();
        (inner.outcomes.len(), failures)
    }

    /// Run `op` through the breaker.
    pub async fn execute<T, E, F, Fut>(&self, op: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let Some(mut permit) = self.admit() else {
            log::debug!("{}: call rejected, breaker open", self.name);
            return Err(BreakerError::Open);
        };

        match tokio::time::timeout(self.config.call_timeout, op()).await {
            Ok(Ok(value)) => {
                permit.settle(true);
                Ok(value)
            }
            Ok(Err(e)) => {
                permit.settle(false);
                Err(BreakerError::Inner(e))
            }
            Err(_) => {
                permit.settle(false);
                Err(BreakerError::Timeout(self.config.call_timeout))
            }
        }
    }

    fn admit(&self) -> Option<Permit<'_>> {
        let mut inner = self.lock();
        let trial = match inner.state {
            BreakerState::Closed => false,
            BreakerState::Open => {
                let cooled = inner
                    .opened_at
                    .map(|at| at.elapsed() >= self.config.cool_down)
                    .unwrap_or(true);
                if !cooled {
                    return None;
                }
                self.transition(&mut inner, BreakerState::HalfOpen);
                inner.trial_in_flight = true;
                true
            }
            BreakerState::HalfOpen => {
                if inner.trial_in_flight {
                    return None;
                }
                inner.trial_in_flight = true;
                true
            }
        };
        Some(Permit { breaker: self, trial, settled: false })
    }

    fn record(&self, trial: bool, ok: bool) {
        let mut inner = self.lock();
        let now = Instant::now();

        if trial {
            inner.trial_in_flight = false;
            if ok {
                inner.outcomes.clear();
                inner.opened_at = None;
                self.transition(&mut inner, BreakerState::Closed);
            } else {
                inner.opened_at = Some(now);
                self.transition(&mut inner, BreakerState::Open);
            }
            return;
        }

        // late results from calls admitted before the breaker opened are dropped
        if inner.state != BreakerState::Closed {
            return;
        }

        inner.outcomes.push_back((now, !ok));
        self.prune(&mut inner, now);

        let total = inner.outcomes.len();
        let failures = inner.outcomes.iter().filter(|(_, failed)| *failed).count();
        if total >= self.config.min_calls as usize
            && failures as f64 * 100.0 / total as f64 >= self.config.error_threshold_pct
        {
            inner.opened_at = Some(now);
            self.transition(&mut inner, BreakerState::Open);
        }
    }

    fn prune(&self, inner: &mut Inner, now: Instant) {
        while let Some(&(at, _)) = inner.outcomes.front() {
            if now.duration_since(at) > self.config.window {
                inner.outcomes.pop_front();
            } else {
                break;
            }
        }
    }

    fn transition(&self, inner: &mut Inner, to: BreakerState) {
        if inner.state == to {
            return;
        }
        inner.state = to;

        let (event, label) = match to {
            BreakerState::Open => (BreakerEvent::Opened, "open"),
            BreakerState::HalfOpen => (BreakerEvent::HalfOpen, "half_open"),
            BreakerState::Closed => (BreakerEvent::Closed, "closed"),
        };
        match event {
            BreakerEvent::Opened => log::warn!("{}: breaker opened", self.name),
            _ => log::info!("{}: breaker {label}", self.name),
        }
        metrics::increment_counter!("breaker_transitions_total", "state" => label);
        // no receivers is fine
        let _ = self.events.send(event);
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // state stays consistent even if a holder panicked mid-update
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// One admitted call. Dropping it unsettled (caller cancelled) counts as a failure.
struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl Permit<'_> {
    fn settle(&mut self, ok: bool) {
        self.settled = true;
        self.breaker.record(self.trial, ok);
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.record(self.trial, false);
        }
    }
}
