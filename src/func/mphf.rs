/*
 * SPDX-FileCopyrightText: 2025 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! Minimal perfect hash functions used by [static shards](super::StaticShard).
//!
//! We use PHast with a deterministically seeded `ahash` hasher: the same
//! seeds must be used at construction and at load time, or a deserialized
//! function would map keys to different slots.

use ph::phast;
use ph::seeds::Bits8;
use ph::Seedable;
use std::io;

/// The seeded hasher used inside our functions.
pub type MphfHasher = Seedable<ahash::RandomState>;

/// PHast, 8 bits per seed, with [`MphfHasher`].
pub type Mphf = phast::Function<Bits8, phast::SeedOnly, phast::DefaultCompressedArray, MphfHasher>;

pub fn mphf_hasher() -> MphfHasher {
    Seedable(ahash::RandomState::with_seeds(0, 0, 0, 0))
}

fn mphf_params() -> phast::Params<Bits8> {
    phast::Params::new(Bits8, phast::bits_per_seed_to_100_bucket_size(8))
}

/// Builds a function over a slice of distinct keys.
pub fn build_mphf(keys: &[u64]) -> Mphf {
    Mphf::with_slice_p_hash_sc(keys, &mphf_params(), mphf_hasher(), phast::SeedOnly)
}

/// Reads a function written with [`Mphf::write`].
pub fn read_mphf(reader: &mut dyn io::Read) -> io::Result<Mphf> {
    Mphf::read_with_hasher_sc(reader, mphf_hasher(), phast::SeedOnly)
}
