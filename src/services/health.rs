//! Liveness of the analysis service, tracked as one boolean.
//!
//! Only changes are reported: flipping the flag publishes a single
//! `service_status` event and logs once; re-asserting the current value is
//! silent. Starts out unavailable until the first probe succeeds.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::services::analysis::AnalysisService;
use crate::services::scan_bus::{ScanBus, ScanEvent};

pub struct HealthMonitor {
    service: Arc<dyn AnalysisService>,
    available: AtomicBool,
    probe_timeout: Duration,
    bus: ScanBus,
}

impl HealthMonitor {
    pub fn new(service: Arc<dyn AnalysisService>, probe_timeout: Duration, bus: ScanBus) -> Self {
        Self {
            service,
            available: AtomicBool::new(false),
            probe_timeout,
            bus,
        }
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// Returns `true` when the flag actually changed.
    pub fn set_available(&self, available: bool) -> bool {
        let previous = self.available.swap(available, Ordering::SeqCst);
        if previous == available {
            return false;
        }
        if available {
            log::info!("analysis service is back online");
        } else {
            log::warn!("analysis service went offline");
        }
        self.bus.publish(ScanEvent::ServiceStatus { available });
        true
    }

    /// One probe with its own short timeout; updates the flag edge-triggered.
    pub async fn check_once(&self) -> bool {
        let healthy = match tokio::time::timeout(self.probe_timeout, self.service.health()).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                log::debug!("health probe failed: {e}");
                false
            }
            Err(_) => {
                log::debug!("health probe timed out after {:?}", self.probe_timeout);
                false
            }
        };
        self.set_available(healthy);
        healthy
    }
}
