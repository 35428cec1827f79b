/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Types that exist only to store numbers and bytes, and do not have any major "active" behavior.

use std::{
    fmt::{self, Debug, Display, Formatter},
    hash::Hash,
    ops::{Add, AddAssign, Sub},
};

use borsh::{BorshDeserialize, BorshSerialize};

/// Index of a protocol instance.
///
/// Instance `0` is the master instance: only the batches it orders are applied to the ledgers. Every
/// other instance is a backup instance whose sole purpose is to give the
/// [monitor](crate::monitor) a throughput baseline to compare the master against.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize,
)]
pub struct InstanceId(u32);

impl InstanceId {
    /// The `InstanceId` of the master instance.
    pub const MASTER: InstanceId = InstanceId(0);

    /// Create a new `InstanceId` with an `int` value.
    pub const fn new(int: u32) -> Self {
        Self(int)
    }

    /// Get the `u32` value of this `InstanceId`.
    pub const fn int(&self) -> u32 {
        self.0
    }

    /// Whether this is the master instance.
    pub const fn is_master(&self) -> bool {
        self.0 == 0
    }
}

impl Display for InstanceId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// Number of a view. Starts at 0 and only ever increases, once per completed view change.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize,
)]
pub struct ViewNumber(u64);

impl ViewNumber {
    /// Create a new `ViewNumber` with an `int` value.
    pub const fn new(int: u64) -> Self {
        Self(int)
    }

    /// The view every node starts in.
    pub const fn init() -> Self {
        Self(0)
    }

    /// Get the `u64` value of this `ViewNumber`.
    pub const fn int(&self) -> u64 {
        self.0
    }
}

impl Display for ViewNumber {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl Add<u64> for ViewNumber {
    type Output = ViewNumber;
    fn add(self, rhs: u64) -> Self::Output {
        ViewNumber::new(self.0 + rhs)
    }
}

impl AddAssign<u64> for ViewNumber {
    fn add_assign(&mut self, rhs: u64) {
        self.0.add_assign(rhs)
    }
}

/// Per-instance sequence number of a Pre-Prepare.
///
/// `PpSeqNo`s are assigned by the primary, starting at 1 and increasing by 1 for every batch. They
/// are never reset by a view change: the new primary resumes from the last agreed ordered number.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    BorshDeserialize,
    BorshSerialize,
)]
pub struct PpSeqNo(u64);

impl PpSeqNo {
    /// Create a new `PpSeqNo` with an `int` value.
    pub const fn new(int: u64) -> Self {
        Self(int)
    }

    /// Get the `u64` value of this `PpSeqNo`.
    pub const fn int(&self) -> u64 {
        self.0
    }
}

impl Display for PpSeqNo {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl Add<u64> for PpSeqNo {
    type Output = PpSeqNo;
    fn add(self, rhs: u64) -> Self::Output {
        PpSeqNo::new(self.0 + rhs)
    }
}

impl AddAssign<u64> for PpSeqNo {
    fn add_assign(&mut self, rhs: u64) {
        self.0.add_assign(rhs)
    }
}

impl Sub<PpSeqNo> for PpSeqNo {
    type Output = u64;
    fn sub(self, rhs: PpSeqNo) -> Self::Output {
        self.0 - rhs.0
    }
}

/// Identifier of one of the ledgers a node maintains (e.g., a pool ledger and a domain ledger).
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize,
)]
pub struct LedgerId(u8);

impl LedgerId {
    /// Create a new `LedgerId` with an `int` value.
    pub const fn new(int: u8) -> Self {
        Self(int)
    }

    /// Get the `u8` value of this `LedgerId`.
    pub const fn int(&self) -> u8 {
        self.0
    }
}

impl Display for LedgerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// 1-based position of a transaction in a ledger.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize,
)]
pub struct SeqNo(u64);

impl SeqNo {
    /// Create a new `SeqNo` with an `int` value.
    pub const fn new(int: u64) -> Self {
        Self(int)
    }

    /// Get the `u64` value of this `SeqNo`.
    pub const fn int(&self) -> u64 {
        self.0
    }
}

impl Display for SeqNo {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// Inclusive pair of ledger sequence numbers returned by the ledger's append and commit operations.
///
/// For a non-empty range, the number of transactions covered is `end - start + 1`. Operations that
/// touch zero transactions return a range whose bounds are anchored at the ledger's current size, so
/// that callers can still tell where the ledger stands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SeqNoRange {
    pub start: SeqNo,
    pub end: SeqNo,
}

impl SeqNoRange {
    pub const fn new(start: u64, end: u64) -> Self {
        Self {
            start: SeqNo::new(start),
            end: SeqNo::new(end),
        }
    }
}

impl Display for SeqNoRange {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.start, self.end)
    }
}

/// 32-byte cryptographic hash. Within this crate, always a SHA256 hash.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize)]
pub struct CryptoHash([u8; 32]);

impl CryptoHash {
    /// Create a new `CryptoHash` wrapping `bytes`.
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// The all-zeroes hash. Used as the state and transaction root of batches ordered by backup
    /// instances, which never touch the ledgers.
    pub const fn zero() -> Self {
        Self([0u8; 32])
    }

    /// Get the inner `[u8; 32]` value of this `CryptoHash`.
    pub const fn bytes(&self) -> [u8; 32] {
        self.0
    }
}

impl Display for CryptoHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl Debug for CryptoHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
