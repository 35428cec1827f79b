/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Network communication between nodes of a pool.
//!
//! Library users connect nodes by implementing the [`Network`](network::Network) trait. Protocol
//! components send messages through a [`SenderHandle`](sending::SenderHandle), and the
//! [node](crate::node::Node) polls for incoming messages and routes them to the components.

pub mod messages;

pub mod network;

pub(crate) mod receiving;

pub(crate) mod sending;
