//! [`ForcedDegradation`], a [`DegradationDetector`] that tests arm to force view changes.

use std::{
    sync::{Arc, Mutex},
    time::Instant,
};

use rbft_rs::monitor::{
    detector::{DegradationDetector, MonitorDetector},
    implementation::ThroughputMonitor,
};

/// Reports the master as degraded while the monitor has seen exactly the armed number of view
/// changes, and defers to [`MonitorDetector`] otherwise. Clones share the trigger.
#[derive(Clone, Default)]
pub(crate) struct ForcedDegradation(Arc<Mutex<Option<u64>>>);

impl ForcedDegradation {
    pub(crate) fn new() -> ForcedDegradation {
        ForcedDegradation::default()
    }

    /// Force one view change away from the view reached after `total_view_changes` view changes.
    pub(crate) fn arm(&self, total_view_changes: u64) {
        *self.0.lock().unwrap() = Some(total_view_changes);
    }
}

impl DegradationDetector for ForcedDegradation {
    fn is_master_degraded(&mut self, monitor: &mut ThroughputMonitor, now: Instant) -> bool {
        if *self.0.lock().unwrap() == Some(monitor.total_view_changes()) {
            return true;
        }
        MonitorDetector.is_master_degraded(monitor, now)
    }
}
