/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Configuration of a [`Node`](crate::node::Node).
//!
//! A single [`Configuration`] is built by the library user and then split into the configurations
//! of each sub-protocol.

use std::time::Duration;

use typed_builder::TypedBuilder;

use crate::{
    monitor::implementation::MonitorConfiguration,
    node::NodeConfiguration,
    three_phase::implementation::ReplicaConfiguration,
    types::{
        crypto_primitives::SigningKey,
        pool::{Pool, Quorums},
    },
    view_change::implementation::ViewChangeConfiguration,
};

/// Stores the user-defined parameters required to start a node.
///
/// ## Pool
///
/// Every node of a pool must be configured with the same `pool`, since primaries, quorums, and
/// the number of protocol instances are all derived from it. A node's own key (`me`) must be a
/// member of the pool.
///
/// ## Durations
///
/// `perf_check_freq`, `view_change_timeout` and `max_master_latency` must be "well below"
/// [u64::MAX] seconds. A good limit is to cap them at [u32::MAX]. The view change timeout doubles
/// on every retry, so keep `view_change_timeout * 2^view_change_max_retries` within that limit too.
///
/// ## Log Events
///
/// Events are logged using the [log](https://docs.rs/log/latest/log/) crate. To get these messages
/// printed onto a terminal or to a file, set up a [logging
/// implementation](https://docs.rs/log/latest/log/#available-logging-implementations).
#[derive(Clone, TypedBuilder)]
#[builder(builder_method(doc = "
    Create a builder for building a [Configuration]. On the builder call the following methods to construct a valid [Configuration].

    Required:
    - `.me(...)`
    - `.pool(...)`
    - `.chk_freq(...)`
    - `.perf_check_freq(...)`
    - `.view_change_timeout(...)`
    - `.log_events(...)`

    Optional:
    - `.log_size(...)`
    - `.max_batch_size(...)`
    - `.quorum(...)`
    - `.view_change_max_retries(...)`
    - `.throughput_ratio_threshold(...)`
    - `.max_master_latency(...)`
    - `.min_backup_requests(...)`
    - `.future_view_buffer_capacity(...)`
    - `.request_dedup_window(...)`
"))]
pub struct Configuration {
    #[builder(setter(doc = "Set the node's keypair. Its verifying key identifies the node in the pool. Required."))]
    pub me: SigningKey,
    #[builder(setter(doc = "Set the pool of nodes that run the protocol. Required."))]
    pub pool: Pool,
    #[builder(setter(doc = "Set the number of ordered batches per checkpoint window. Must be at least 1. Required."))]
    pub chk_freq: u64,
    #[builder(setter(doc = "Set how often the degradation detector is consulted. Required."))]
    pub perf_check_freq: Duration,
    #[builder(setter(doc = "Set how long a view change may take before it is retried. Required."))]
    pub view_change_timeout: Duration,
    #[builder(setter(doc = "Enable logging? Required."))]
    pub log_events: bool,

    #[builder(default, setter(strip_option, doc = "Set the width of the watermark window, i.e., how far past the last stable checkpoint a primary may propose. Defaults to 3 checkpoint windows."))]
    pub log_size: Option<u64>,
    #[builder(default = 100, setter(doc = "Set the maximum number of requests per batch. Defaults to 100."))]
    pub max_batch_size: usize,
    #[builder(default, setter(strip_option, doc = "Override the strong quorum. Defaults to n - f."))]
    pub quorum: Option<usize>,
    #[builder(default = 3, setter(doc = "Set how many times a view change is retried for the same target view before the target is escalated. Defaults to 3."))]
    pub view_change_max_retries: u32,
    #[builder(default = 0.4, setter(doc = "Set the ratio of master to average backup throughput below which the master is degraded. Defaults to 0.4."))]
    pub throughput_ratio_threshold: f64,
    #[builder(default = Duration::from_secs(60), setter(doc = "Set the average master request latency above which the master is degraded. Defaults to 60 seconds."))]
    pub max_master_latency: Duration,
    #[builder(default = 10, setter(doc = "Set how many requests the backups must have ordered on average before the throughput ratio is trusted. Defaults to 10."))]
    pub min_backup_requests: u64,
    #[builder(default = 1024, setter(doc = "Set the maximum number of messages for future views a node holds on to. Defaults to 1024."))]
    pub future_view_buffer_capacity: usize,
    #[builder(default, setter(strip_option, doc = "Set how many master batches before the last stable checkpoint a node keeps rejecting resubmissions of the requests ordered in. Defaults to 100 checkpoint windows."))]
    pub request_dedup_window: Option<u64>,
}

#[allow(clippy::from_over_into)]
impl
    Into<(
        ReplicaConfiguration,
        MonitorConfiguration,
        ViewChangeConfiguration,
        NodeConfiguration,
    )> for Configuration
{
    fn into(
        self,
    ) -> (
        ReplicaConfiguration,
        MonitorConfiguration,
        ViewChangeConfiguration,
        NodeConfiguration,
    ) {
        let me = self.me.verifying_key();
        let quorums = Quorums::new(&self.pool, self.quorum);
        let chk_freq = self.chk_freq.max(1);

        let replica_config = ReplicaConfiguration {
            me,
            quorums,
            pool_size: self.pool.len(),
            max_batch_size: self.max_batch_size.max(1),
            chk_freq,
            log_size: self.log_size.unwrap_or(3 * chk_freq),
        };

        let monitor_config = MonitorConfiguration {
            instance_count: self.pool.instance_count(),
            throughput_ratio_threshold: self.throughput_ratio_threshold,
            max_master_latency: self.max_master_latency,
            min_backup_requests: self.min_backup_requests,
        };

        let view_change_config = ViewChangeConfiguration {
            me,
            quorums,
            view_change_timeout: self.view_change_timeout,
            view_change_max_retries: self.view_change_max_retries,
        };

        let node_config = NodeConfiguration {
            me,
            pool: self.pool,
            perf_check_freq: self.perf_check_freq,
            future_view_buffer_capacity: self.future_view_buffer_capacity,
            request_dedup_window: self.request_dedup_window.unwrap_or(100 * chk_freq),
            log_events: self.log_events,
        };

        (replica_config, monitor_config, view_change_config, node_config)
    }
}
