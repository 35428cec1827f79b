/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Compact, append-only merkle trees.
//!
//! Hashing follows RFC 6962 (Certificate Transparency):
//! - The hash of the empty tree is `SHA256("")`.
//! - A leaf `d` hashes to `SHA256(0x00 || d)`.
//! - An interior node hashes to `SHA256(0x01 || left || right)`.
//! - A tree of `n` leaves is split at the largest power of two strictly smaller than `n`.
//!
//! ## Representation
//!
//! A tree of size `n` is fully described by its "frontier": the roots of the perfect subtrees
//! that the binary representation of `n` decomposes it into, one per set bit. Frontiers are stored
//! as immutable linked stacks in a [`HashArena`], smallest subtree first. A
//! [`CompactMerkleTree`] is a `(size, head)` pair pointing into the arena, so it is `Copy`, and two
//! trees that share a prefix of leaves share the tail of their frontier.
//!
//! Appending a leaf to a tree never mutates existing arena nodes: it pushes new ones and returns a
//! new tree, leaving the original tree valid. This is what lets a ledger hold its committed tree and a
//! speculative extension of it at the same time.

use std::collections::HashMap;

use crate::types::{
    crypto_primitives::{CryptoHasher, Digest},
    data_types::CryptoHash,
};

const LEAF_PREFIX: u8 = 0x00;
const NODE_PREFIX: u8 = 0x01;

/// Index of a frontier node in a [`HashArena`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) struct NodeHandle(usize);

#[derive(Clone, Debug)]
struct FrontierNode {
    hash: CryptoHash,
    next: Option<NodeHandle>,
}

/// An append-only merkle tree whose frontier lives in a [`HashArena`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct CompactMerkleTree {
    size: u64,
    head: Option<NodeHandle>,
}

impl CompactMerkleTree {
    /// The tree with no leaves.
    pub(crate) const fn empty() -> Self {
        Self {
            size: 0,
            head: None,
        }
    }

    /// Number of leaves in the tree.
    pub(crate) const fn size(&self) -> u64 {
        self.size
    }
}

/// Storage for the frontier nodes of one or more [`CompactMerkleTree`]s.
#[derive(Clone, Debug, Default)]
pub(crate) struct HashArena {
    nodes: Vec<FrontierNode>,
}

impl HashArena {
    pub(crate) fn new() -> Self {
        Self { nodes: Vec::new() }
    }

    /// Number of frontier nodes currently held, reachable or not.
    pub(crate) fn len(&self) -> usize {
        self.nodes.len()
    }

    fn push(&mut self, hash: CryptoHash, next: Option<NodeHandle>) -> NodeHandle {
        self.nodes.push(FrontierNode { hash, next });
        NodeHandle(self.nodes.len() - 1)
    }

    fn node(&self, handle: NodeHandle) -> &FrontierNode {
        &self.nodes[handle.0]
    }

    /// Return the tree obtained by appending a leaf containing `data` to `tree`.
    pub(crate) fn append(&mut self, tree: CompactMerkleTree, data: &[u8]) -> CompactMerkleTree {
        let mut acc = leaf_hash(data);
        let mut head = tree.head;
        let mut bits = tree.size;

        // Every trailing set bit of the old size is a perfect subtree that the new leaf completes.
        while bits & 1 == 1 {
            match head {
                Some(handle) => {
                    let node = self.node(handle);
                    acc = node_hash(&node.hash, &acc);
                    head = node.next;
                }
                None => break,
            }
            bits >>= 1;
        }

        let new_head = self.push(acc, head);
        CompactMerkleTree {
            size: tree.size + 1,
            head: Some(new_head),
        }
    }

    /// Return the tree obtained by appending one leaf per item of `leaves` to `tree`, in order.
    pub(crate) fn extend<'a>(
        &mut self,
        tree: CompactMerkleTree,
        leaves: impl IntoIterator<Item = &'a [u8]>,
    ) -> CompactMerkleTree {
        leaves
            .into_iter()
            .fold(tree, |tree, leaf| self.append(tree, leaf))
    }

    /// Compute the root hash of `tree`.
    pub(crate) fn root(&self, tree: &CompactMerkleTree) -> CryptoHash {
        let Some(head) = tree.head else {
            return empty_hash();
        };

        let mut node = self.node(head);
        let mut root = node.hash;
        while let Some(next) = node.next {
            node = self.node(next);
            root = node_hash(&node.hash, &root);
        }
        root
    }

    /// Drop every node that is not reachable from one of `trees`, rewriting the trees' handles in
    /// place. Nodes shared between trees stay shared.
    pub(crate) fn retain(&mut self, trees: &mut [&mut CompactMerkleTree]) {
        let old_nodes = std::mem::take(&mut self.nodes);
        let mut moved: HashMap<usize, NodeHandle> = HashMap::new();

        for tree in trees.iter_mut() {
            // Collect the frontier smallest-first, then re-push it largest-first so that `next`
            // links always point at nodes that already exist in the new arena.
            let mut chain = Vec::new();
            let mut cursor = tree.head;
            while let Some(handle) = cursor {
                if moved.contains_key(&handle.0) {
                    break;
                }
                chain.push(handle.0);
                cursor = old_nodes[handle.0].next;
            }

            let mut next = cursor.and_then(|handle| moved.get(&handle.0).copied());
            for old in chain.into_iter().rev() {
                let new_handle = self.push(old_nodes[old].hash, next);
                moved.insert(old, new_handle);
                next = Some(new_handle);
            }

            tree.head = tree.head.and_then(|handle| moved.get(&handle.0).copied());
        }
    }
}

/// Root hash of the empty tree.
pub(crate) fn empty_hash() -> CryptoHash {
    CryptoHash::new(CryptoHasher::digest(b"").into())
}

pub(crate) fn leaf_hash(data: &[u8]) -> CryptoHash {
    let mut hasher = CryptoHasher::new();
    hasher.update([LEAF_PREFIX]);
    hasher.update(data);
    CryptoHash::new(hasher.finalize().into())
}

pub(crate) fn node_hash(left: &CryptoHash, right: &CryptoHash) -> CryptoHash {
    let mut hasher = CryptoHasher::new();
    hasher.update([NODE_PREFIX]);
    hasher.update(left.bytes());
    hasher.update(right.bytes());
    CryptoHash::new(hasher.finalize().into())
}
