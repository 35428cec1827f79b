/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Definitions for the [`Pool`] of participating nodes and the [`Quorums`] derived from its size.

use std::slice;

use super::{
    crypto_primitives::VerifyingKey,
    data_types::{InstanceId, ViewNumber},
};

/// Identities of the `n` nodes that run the protocol.
///
/// The pool maintains its members in ascending order of their [verifying keys](VerifyingKey), so
/// that every node derives the same primary for every view and instance.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Pool {
    // The verifying keys of members are included here in ascending order.
    members: Vec<VerifyingKey>,
}

impl Pool {
    /// Create a pool out of `members`. Duplicates are dropped.
    pub fn new(members: impl IntoIterator<Item = VerifyingKey>) -> Pool {
        let mut members: Vec<VerifyingKey> = members.into_iter().collect();
        members.sort_by_key(|member| member.to_bytes());
        members.dedup();
        Pool { members }
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn contains(&self, member: &VerifyingKey) -> bool {
        self.position(member).is_some()
    }

    pub fn position(&self, member: &VerifyingKey) -> Option<usize> {
        let member_bytes = member.to_bytes();
        self.members
            .binary_search_by(|m| m.to_bytes().cmp(&member_bytes))
            .ok()
    }

    /// Get an iterator through the members' verifying keys which walks through them in ascending order.
    pub fn members(&self) -> slice::Iter<VerifyingKey> {
        self.members.iter()
    }

    /// Maximum number of faulty nodes the pool tolerates: `f = (n - 1) / 3`.
    pub fn f(&self) -> usize {
        self.len().saturating_sub(1) / 3
    }

    /// Number of protocol instances each node runs: one master plus `f` backups.
    pub fn instance_count(&self) -> usize {
        self.f() + 1
    }

    /// Get the primary of instance `inst_id` in view `view`.
    ///
    /// Primaries rotate round-robin through the pool, and each instance is offset by its id so that,
    /// in any view, the primaries of different instances are different nodes.
    ///
    /// # Panics
    ///
    /// Panics if the pool is empty. [`Node`](crate::node::Node)s refuse to start with an empty pool.
    pub fn primary(&self, view: ViewNumber, inst_id: InstanceId) -> VerifyingKey {
        let n = self.len() as u64;
        let idx = (view.int() + inst_id.int() as u64) % n;
        self.members[idx as usize]
    }
}

/// Vote thresholds derived from the pool size.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Quorums {
    /// Votes needed to prepare, commit, stabilize a checkpoint, or agree on a view change.
    /// Defaults to `n - f`, i.e., `2f + 1` in a pool of `3f + 1` nodes.
    pub strong: usize,

    /// Votes needed to be sure at least one honest node is involved: `f + 1`.
    pub weak: usize,
}

impl Quorums {
    /// Compute the quorums of `pool`, optionally overriding the strong quorum.
    pub fn new(pool: &Pool, strong_override: Option<usize>) -> Quorums {
        let f = pool.f();
        Quorums {
            strong: strong_override.unwrap_or(pool.len() - f),
            weak: f + 1,
        }
    }

    /// Whether these quorums can be reached in `pool`, and are not reached without any votes.
    pub fn fit(&self, pool: &Pool) -> bool {
        (1..=pool.len()).contains(&self.strong)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::crypto_primitives::SigningKey;

    fn pool_of(n: u8) -> Pool {
        Pool::new((0..n).map(|i| SigningKey::from_bytes(&[i; 32]).verifying_key()))
    }

    #[test]
    fn fault_tolerance_and_quorums_follow_pool_size() {
        let pool = pool_of(4);
        assert_eq!(pool.f(), 1);
        assert_eq!(pool.instance_count(), 2);
        assert_eq!(Quorums::new(&pool, None), Quorums { strong: 3, weak: 2 });

        let pool = pool_of(7);
        assert_eq!(pool.f(), 2);
        assert_eq!(Quorums::new(&pool, None), Quorums { strong: 5, weak: 3 });
        assert_eq!(Quorums::new(&pool, Some(6)).strong, 6);
        assert!(Quorums::new(&pool, Some(7)).fit(&pool));
        assert!(!Quorums::new(&pool, Some(8)).fit(&pool));
        assert!(!Quorums::new(&pool, Some(0)).fit(&pool));

        let pool = pool_of(1);
        assert_eq!(pool.f(), 0);
        assert_eq!(Quorums::new(&pool, None), Quorums { strong: 1, weak: 1 });
    }

    #[test]
    fn primaries_rotate_and_differ_between_instances() {
        let pool = pool_of(4);
        let members: Vec<VerifyingKey> = pool.members().copied().collect();

        assert_eq!(pool.primary(ViewNumber::new(0), InstanceId::MASTER), members[0]);
        assert_eq!(pool.primary(ViewNumber::new(0), InstanceId::new(1)), members[1]);
        assert_eq!(pool.primary(ViewNumber::new(1), InstanceId::MASTER), members[1]);
        assert_eq!(pool.primary(ViewNumber::new(3), InstanceId::new(1)), members[0]);
        assert_ne!(
            pool.primary(ViewNumber::new(5), InstanceId::MASTER),
            pool.primary(ViewNumber::new(5), InstanceId::new(1))
        );
    }

    #[test]
    fn members_are_sorted_and_deduplicated() {
        let key = SigningKey::from_bytes(&[9; 32]).verifying_key();
        let pool = Pool::new([key, key]);
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.position(&key), Some(0));
        let members: Vec<[u8; 32]> = pool_of(4).members().map(|m| m.to_bytes()).collect();
        assert!(members.windows(2).all(|w| w[0] < w[1]));
    }
}
