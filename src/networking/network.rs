/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The [`Network`] trait that library users implement to connect nodes of a pool.

use crate::types::crypto_primitives::VerifyingKey;

use super::messages::Message;

/// Authenticated, best-effort transport between the members of a pool.
///
/// Implementations are expected to authenticate the origin of every message they deliver: the
/// protocol trusts the `VerifyingKey` returned by [`recv`](Self::recv) to identify the sender.
pub trait Network: Clone + Send {
    /// Send a message to all other members of the pool without blocking.
    fn broadcast(&mut self, message: Message);

    /// Send a message to the specified peer without blocking.
    fn send(&mut self, peer: VerifyingKey, message: Message);

    /// Receive a message from any peer. Returns immediately with a None if no message is available now.
    fn recv(&mut self) -> Option<(VerifyingKey, Message)>;
}
