/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Cryptographic primitives.
//!
//! The definitions and re-exports in this module provide two categories of cryptographic primitives:
//! 1. **Cryptographic Hashes**: provided by the [`sha2`] crate.
//! 2. **Node identities**: [`VerifyingKey`]s provided by the [`ed25519_dalek`] crate. Messages are
//!    authenticated by the transport layer, so this crate only ever compares and orders keys.

use borsh::BorshSerialize;

use super::data_types::CryptoHash;

// re-exports below.
pub use sha2::Digest;
pub use sha2::Sha256 as CryptoHasher;

pub use ed25519_dalek::{SigningKey, VerifyingKey};

/// Hash the Borsh serialization of `value`.
pub(crate) fn hash_of<T: BorshSerialize>(value: &T) -> CryptoHash {
    let mut hasher = CryptoHasher::new();
    // Serializing into a Vec cannot fail.
    let bytes = value.try_to_vec().unwrap_or_default();
    hasher.update(&bytes);
    CryptoHash::new(hasher.finalize().into())
}
