/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The [`ThroughputMonitor`] type, which measures every instance of a node over a window.

use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use crate::types::data_types::{CryptoHash, InstanceId};

/// Thresholds of a [`ThroughputMonitor`].
#[derive(Clone)]
pub struct MonitorConfiguration {
    pub instance_count: usize,
    /// The master is degraded if it orders fewer than this fraction of the requests the average
    /// backup instance orders.
    pub throughput_ratio_threshold: f64,
    /// The master is degraded if the requests it orders take longer than this on average, or if a
    /// request it has yet to order has been waiting for longer than this.
    pub max_master_latency: Duration,
    /// Minimum average number of requests the backups must order in a window before the throughput
    /// ratio is considered meaningful.
    pub min_backup_requests: u64,
}

/// Per-node measurements of the ordering throughput of every instance, and of the latency of the
/// master instance.
///
/// ## Windows
///
/// Measurements cover the window that started at the monitor's creation, or at its last
/// [`reset`](Self::reset), which the node calls every time a view change completes.
///
/// ## Latching
///
/// Once [`is_master_degraded`](Self::is_master_degraded) returns `true`, it keeps returning `true`
/// until the next reset, so that a view change that takes several checks to complete is not
/// re-evaluated against a partially recovered master.
pub struct ThroughputMonitor {
    config: MonitorConfiguration,
    window_start: Instant,
    ordered_requests: Vec<u64>,
    // When each request that the master instance has not ordered yet was received.
    unordered_since: HashMap<CryptoHash, Instant>,
    master_latency_total: Duration,
    master_latency_count: u32,
    degraded: bool,
    total_view_changes: u64,
}

impl ThroughputMonitor {
    pub fn new(config: MonitorConfiguration, now: Instant) -> Self {
        let instance_count = config.instance_count;
        Self {
            config,
            window_start: now,
            ordered_requests: vec![0; instance_count],
            unordered_since: HashMap::new(),
            master_latency_total: Duration::ZERO,
            master_latency_count: 0,
            degraded: false,
            total_view_changes: 0,
        }
    }

    /// Start measuring the latency of the request with `digest`.
    pub fn request_received(&mut self, digest: CryptoHash, now: Instant) {
        self.unordered_since.entry(digest).or_insert(now);
    }

    /// Stop measuring the latency of the request with `digest`, which will never be ordered.
    pub fn request_dropped(&mut self, digest: &CryptoHash) {
        self.unordered_since.remove(digest);
    }

    /// Record that `inst_id` ordered a batch of the requests in `req_idr`.
    pub fn batch_ordered(&mut self, inst_id: InstanceId, req_idr: &[CryptoHash], now: Instant) {
        if let Some(count) = self.ordered_requests.get_mut(inst_id.int() as usize) {
            *count += req_idr.len() as u64;
        }
        if !inst_id.is_master() {
            return;
        }
        for digest in req_idr {
            if let Some(received) = self.unordered_since.remove(digest) {
                self.master_latency_total += now.saturating_duration_since(received);
                self.master_latency_count += 1;
            }
        }
    }

    /// Number of requests `inst_id` ordered in the current window.
    pub fn ordered_requests(&self, inst_id: InstanceId) -> u64 {
        self.ordered_requests
            .get(inst_id.int() as usize)
            .copied()
            .unwrap_or(0)
    }

    /// Requests per second `inst_id` ordered in the current window.
    pub fn throughput(&self, inst_id: InstanceId, now: Instant) -> f64 {
        let elapsed = now
            .saturating_duration_since(self.window_start)
            .max(Duration::from_millis(1));
        self.ordered_requests(inst_id) as f64 / elapsed.as_secs_f64()
    }

    /// Ratio between the number of requests the master ordered and the average number of requests a
    /// backup ordered in the current window.
    ///
    /// `None` if there are no backup instances, or if the backups did not order enough requests for
    /// the comparison to mean anything.
    pub fn master_throughput_ratio(&self) -> Option<f64> {
        let backups = self.ordered_requests.get(1..).unwrap_or_default();
        if backups.is_empty() {
            return None;
        }
        let backup_avg = backups.iter().sum::<u64>() as f64 / backups.len() as f64;
        if backup_avg == 0.0 || backup_avg < self.config.min_backup_requests as f64 {
            return None;
        }
        Some(self.ordered_requests(InstanceId::MASTER) as f64 / backup_avg)
    }

    /// Average latency of the requests the master ordered in the current window.
    pub fn master_avg_latency(&self) -> Option<Duration> {
        if self.master_latency_count == 0 {
            None
        } else {
            Some(self.master_latency_total / self.master_latency_count)
        }
    }

    /// How long the oldest request the master has not ordered yet has been waiting.
    pub fn oldest_unordered_wait(&self, now: Instant) -> Option<Duration> {
        self.unordered_since
            .values()
            .min()
            .map(|received| now.saturating_duration_since(*received))
    }

    /// Check whether the master instance is degraded. Latched until the next [`reset`](Self::reset).
    pub fn is_master_degraded(&mut self, now: Instant) -> bool {
        if self.degraded {
            return true;
        }

        let too_slow = self
            .master_throughput_ratio()
            .is_some_and(|ratio| ratio < self.config.throughput_ratio_threshold);
        let too_late = self
            .master_avg_latency()
            .is_some_and(|latency| latency > self.config.max_master_latency)
            || self
                .oldest_unordered_wait(now)
                .is_some_and(|wait| wait > self.config.max_master_latency);

        self.degraded = too_slow || too_late;
        self.degraded
    }

    /// Start a new window after a view change.
    ///
    /// Requests the master still has to order start waiting anew, since the new master primary can
    /// only be blamed for the time they spend waiting in its view.
    pub fn reset(&mut self, now: Instant) {
        self.window_start = now;
        self.ordered_requests.iter_mut().for_each(|count| *count = 0);
        self.unordered_since.values_mut().for_each(|received| *received = now);
        self.master_latency_total = Duration::ZERO;
        self.master_latency_count = 0;
        self.degraded = false;
        self.total_view_changes += 1;
    }

    /// Number of resets, i.e., completed view changes, over the lifetime of the monitor.
    pub fn total_view_changes(&self) -> u64 {
        self.total_view_changes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> MonitorConfiguration {
        MonitorConfiguration {
            instance_count: 3,
            throughput_ratio_threshold: 0.4,
            max_master_latency: Duration::from_secs(10),
            min_backup_requests: 10,
        }
    }

    fn digests(range: std::ops::Range<u8>) -> Vec<CryptoHash> {
        range.map(|i| CryptoHash::new([i; 32])).collect()
    }

    #[test]
    fn slow_master_is_degraded_and_stays_degraded_until_reset() {
        let start = Instant::now();
        let mut monitor = ThroughputMonitor::new(config(), start);
        let requests = digests(0..20);
        let now = start + Duration::from_secs(1);

        monitor.batch_ordered(InstanceId::new(1), &requests, now);
        monitor.batch_ordered(InstanceId::new(2), &requests, now);
        monitor.batch_ordered(InstanceId::MASTER, &requests[..10], now);
        assert_eq!(monitor.master_throughput_ratio(), Some(0.5));
        assert!(!monitor.is_master_degraded(now));

        monitor.batch_ordered(InstanceId::new(1), &requests, now);
        monitor.batch_ordered(InstanceId::new(2), &requests, now);
        assert!(monitor.is_master_degraded(now));

        // Catching up does not clear the latch.
        monitor.batch_ordered(InstanceId::MASTER, &requests, now);
        assert!(monitor.is_master_degraded(now));

        monitor.reset(now);
        assert!(!monitor.is_master_degraded(now));
        assert_eq!(monitor.total_view_changes(), 1);
        assert_eq!(monitor.ordered_requests(InstanceId::new(1)), 0);
    }

    #[test]
    fn idle_backups_do_not_make_the_master_look_slow() {
        let start = Instant::now();
        let mut monitor = ThroughputMonitor::new(config(), start);
        monitor.batch_ordered(InstanceId::new(1), &digests(0..3), start);
        assert_eq!(monitor.master_throughput_ratio(), None);
        assert!(!monitor.is_master_degraded(start));
    }

    #[test]
    fn requests_waiting_too_long_for_the_master_degrade_it() {
        let start = Instant::now();
        let mut monitor = ThroughputMonitor::new(config(), start);
        let requests = digests(0..2);
        for digest in &requests {
            monitor.request_received(*digest, start);
        }

        let later = start + Duration::from_secs(4);
        monitor.batch_ordered(InstanceId::MASTER, &requests[..1], later);
        assert_eq!(monitor.master_avg_latency(), Some(Duration::from_secs(4)));
        assert!(!monitor.is_master_degraded(later));

        let too_late = start + Duration::from_secs(11);
        assert!(monitor.is_master_degraded(too_late));

        // After a view change the waiting request gets a fresh deadline.
        monitor.reset(too_late);
        assert_eq!(monitor.oldest_unordered_wait(too_late), Some(Duration::ZERO));
        assert!(!monitor.is_master_degraded(too_late + Duration::from_secs(1)));
    }

    #[test]
    fn dropped_requests_stop_waiting_on_the_master() {
        let start = Instant::now();
        let mut monitor = ThroughputMonitor::new(config(), start);
        let requests = digests(0..1);
        monitor.request_received(requests[0], start);

        monitor.request_dropped(&requests[0]);
        let much_later = start + Duration::from_secs(60);
        assert_eq!(monitor.oldest_unordered_wait(much_later), None);
        assert!(!monitor.is_master_degraded(much_later));
    }

    #[test]
    fn throughput_is_measured_per_second_of_window() {
        let start = Instant::now();
        let mut monitor = ThroughputMonitor::new(config(), start);
        monitor.batch_ordered(InstanceId::MASTER, &digests(0..8), start);
        let throughput = monitor.throughput(InstanceId::MASTER, start + Duration::from_secs(2));
        assert!((throughput - 4.0).abs() < 1e-9);
    }
}
