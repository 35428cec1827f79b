/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Generic tally of votes used to detect quorums.
//!
//! The same [`VoteCollector`] backs Prepare and Commit tallies in the
//! [three-phase protocol](crate::three_phase) and checkpoint tallies in the
//! [checkpoint tracker](crate::checkpoints). What is voted on (the "ballot") differs per use: a
//! batch digest together with its state and transaction roots for Prepares, the batch digest alone
//! for Commits, and the checkpoint digest for Checkpoints.

use std::{
    collections::{HashMap, HashSet},
    hash::Hash,
};

use super::crypto_primitives::VerifyingKey;

/// Counts, per ballot, the distinct voters that voted for it.
///
/// Each voter is counted at most once: the first ballot received from a voter sticks, and any later
/// vote from the same voter, matching or conflicting, is ignored. This means a node that equivocates
/// can never contribute to two different quorums.
#[derive(Clone, Debug)]
pub(crate) struct VoteCollector<B: Copy + Eq + Hash> {
    ballots: HashMap<VerifyingKey, B>,
    tallies: HashMap<B, HashSet<VerifyingKey>>,
}

impl<B: Copy + Eq + Hash> VoteCollector<B> {
    pub(crate) fn new() -> Self {
        Self {
            ballots: HashMap::new(),
            tallies: HashMap::new(),
        }
    }

    /// Record `voter`'s vote for `ballot`. Returns whether the vote was counted.
    pub(crate) fn collect(&mut self, voter: VerifyingKey, ballot: B) -> bool {
        if self.ballots.contains_key(&voter) {
            return false;
        }
        self.ballots.insert(voter, ballot);
        self.tallies.entry(ballot).or_default().insert(voter);
        true
    }

    /// Number of distinct voters that voted for `ballot`.
    pub(crate) fn count(&self, ballot: &B) -> usize {
        self.tallies.get(ballot).map_or(0, |voters| voters.len())
    }
}

impl<B: Copy + Eq + Hash> Default for VoteCollector<B> {
    fn default() -> Self {
        Self::new()
    }
}
