/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Detection of a degraded master instance.
//!
//! Every node runs `f + 1` instances of the three-phase protocol on the same requests, but only the
//! master instance's batches are committed. A faulty master primary can therefore slow the whole
//! pool down without ever violating safety. The [`ThroughputMonitor`](implementation::ThroughputMonitor)
//! compares the throughput of the master instance with that of the backup instances, whose primaries
//! are other nodes, and checks the latency of the requests the master orders. When the master falls
//! behind, the node starts a [view change](crate::view_change), which rotates every primary.
//!
//! Whether the master counts as degraded is decided by a [`DegradationDetector`](detector::DegradationDetector).
//! Nodes use [`MonitorDetector`](detector::MonitorDetector) unless another one is provided.

pub mod detector;

pub mod implementation;
