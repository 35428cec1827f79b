/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The pluggable [`DegradationDetector`] trait and its default implementation.

use std::time::Instant;

use super::implementation::ThroughputMonitor;

/// Decides, every `perf_check_freq`, whether the master instance is degraded.
///
/// A `true` result makes the node start a view change, unless one is already in progress.
pub trait DegradationDetector: Send {
    fn is_master_degraded(&mut self, monitor: &mut ThroughputMonitor, now: Instant) -> bool;
}

/// Defers to [`ThroughputMonitor::is_master_degraded`].
#[derive(Clone, Copy, Debug, Default)]
pub struct MonitorDetector;

impl DegradationDetector for MonitorDetector {
    fn is_master_degraded(&mut self, monitor: &mut ThroughputMonitor, now: Instant) -> bool {
        monitor.is_master_degraded(now)
    }
}
