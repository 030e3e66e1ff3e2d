//! Background loops that keep the pipeline moving.
//!
//! * scan timer → [`Scanner::trigger`]
//! * health timer → [`HealthMonitor::check_once`](crate::services::health::HealthMonitor::check_once)
//! * breaker transitions → availability flag + user-visible status

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::services::circuit_breaker::BreakerEvent;
use crate::services::scan_bus::ScanPhase;
use crate::services::scanner::Scanner;

/// Fires a cycle immediately, then every `scan_interval`.
pub fn spawn_scan_loop(scanner: Arc<Scanner>) -> JoinHandle<()> {
    let period = scanner.config().scan_interval;
    tokio::spawn(async move {
        let mut iv = tokio::time::interval(period);
        // a slow cycle pushes the next tick back instead of bunching them up
        iv.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            iv.tick().await;
            scanner.trigger().await;
        }
    })
}

/// Probes every `health_interval`; the start-up probe is the caller's job.
pub fn spawn_health_loop(scanner: Arc<Scanner>) -> JoinHandle<()> {
    let period = scanner.config().health_interval;
    let health = scanner.health().clone();
    tokio::spawn(async move {
        let mut iv = interval_at(Instant::now() + period, period);
        iv.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            iv.tick().await;
            health.check_once().await;
        }
    })
}

/// Mirrors breaker transitions onto the availability flag.
pub fn spawn_breaker_bridge(scanner: Arc<Scanner>) -> JoinHandle<()> {
    let mut rx = scanner.breaker().subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => on_breaker_event(&scanner, event),
                Err(RecvError::Lagged(n)) => log::warn!("breaker bridge skipped {n} event(s)"),
                Err(RecvError::Closed) => break,
            }
        }
    })
}

pub(crate) fn on_breaker_event(scanner: &Scanner, event: BreakerEvent) {
    let bus = scanner.bus();
    match event {
        BreakerEvent::Opened => {
            scanner.health().set_available(false);
            bus.status(
                ScanPhase::Error,
                "Analysis service is failing; analysis paused until it recovers",
            );
        }
        BreakerEvent::HalfOpen => {
            bus.status(ScanPhase::Progress, "Checking whether the analysis service has recovered");
        }
        BreakerEvent::Closed => {
            scanner.health().set_available(true);
        }
    }
}

/// Runs one trigger after `delay`; used when a subscriber joins.
pub fn schedule_scan(scanner: Arc<Scanner>, delay: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        scanner.trigger().await;
    })
}
