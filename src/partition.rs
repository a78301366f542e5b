/*
 * SPDX-FileCopyrightText: 2025 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! The first level of the index.
//!
//! A [`KeyPartition`] splits the key space into 2<sup>`split_bits`</sup>
//! groups using the highest `split_bits` bits of a key of `key_bits` bits.
//! Each group owns a [`StaticShard`] mapping the keys of the group to their
//! L1 value, and is stored in its own file `<base>.L1.p<group>`.
//!
//! Construction happens in two steps: keys are first
//! [inserted](KeyPartition::insert) with their values, and then
//! [`KeyPartition::build`] builds and writes the shards. A loaded partition
//! is read-only.

use crate::func::{create_gz, open_gz, ShardHeader, StaticShard};
use crate::meta::l1_path;
use crate::sched::{run_in_waves, thread_pool, WaveLimits};
use anyhow::{ensure, Context, Result};
use dsi_progress_logger::ProgressLog;
use rayon::prelude::*;
use std::io::Write;
use std::path::Path;

/// The maximum number of split bits.
pub const MAX_SPLIT_BITS: u32 = 24;

/// Errors raised by a [`KeyPartition`].
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum PartitionError {
    #[error("Key {key:#x} belongs to group {group}, but there are only {num_groups} groups")]
    /// The highest bits of a key select a group that does not exist: the
    /// key is wider than the declared key width.
    KeyOutOfRange {
        key: u64,
        group: u64,
        num_groups: usize,
    },
    #[error("Cannot split {key_bits}-bit keys using {split_bits} bits")]
    /// The number of split bits is larger than the key width or than
    /// [`MAX_SPLIT_BITS`].
    InvalidSplit { key_bits: u32, split_bits: u32 },
    #[error("Duplicate key {0:#x}")]
    /// The same key has been inserted twice.
    DuplicateKey(u64),
}

/// A partition of the key space into groups, each mapped by a static
/// function.
#[derive(Debug)]
pub struct KeyPartition {
    key_bits: u32,
    split_bits: u32,
    shift: u32,
    signature_bits: usize,
    check_dups: bool,
    /// Keys and values waiting for [`KeyPartition::build`].
    pending: Vec<(Vec<u64>, Vec<u64>)>,
    /// The shards of a loaded partition; `None` for empty groups.
    shards: Vec<Option<StaticShard>>,
}

impl KeyPartition {
    /// Creates an empty partition for keys of `key_bits` bits split in
    /// 2<sup>`split_bits`</sup> groups, whose shards will store signatures
    /// of `signature_bits` bits.
    pub fn new(key_bits: u32, split_bits: u32, signature_bits: usize) -> Result<Self> {
        ensure!(
            key_bits <= 64 && split_bits <= key_bits && split_bits <= MAX_SPLIT_BITS,
            PartitionError::InvalidSplit {
                key_bits,
                split_bits
            }
        );
        let num_groups = 1_usize << split_bits;
        Ok(Self {
            key_bits,
            split_bits,
            shift: key_bits - split_bits,
            signature_bits,
            check_dups: true,
            pending: empty_groups(num_groups),
            shards: Vec::new(),
        })
    }

    /// Sets whether [`KeyPartition::build`] checks for duplicate keys.
    ///
    /// The check costs a sort of each group, but without it a duplicate key
    /// makes the construction of the minimal perfect hash function fail in
    /// unpredictable ways.
    pub fn check_dups(mut self, check_dups: bool) -> Self {
        self.check_dups = check_dups;
        self
    }

    pub fn key_bits(&self) -> u32 {
        self.key_bits
    }

    pub fn split_bits(&self) -> u32 {
        self.split_bits
    }

    pub fn num_groups(&self) -> usize {
        1 << self.split_bits
    }

    /// Returns the number of keys inserted and not yet built.
    pub fn num_pending(&self) -> usize {
        self.pending.iter().map(|(keys, _)| keys.len()).sum()
    }

    #[inline(always)]
    fn group(&self, key: u64) -> u64 {
        key.checked_shr(self.shift).unwrap_or(0)
    }

    /// Records the value of a key.
    pub fn insert(&mut self, key: u64, value: u64) -> Result<(), PartitionError> {
        let group = self.group(key);
        let num_groups = self.num_groups();
        if group >= num_groups as u64 {
            return Err(PartitionError::KeyOutOfRange {
                key,
                group,
                num_groups,
            });
        }
        let (keys, values) = &mut self.pending[group as usize];
        keys.push(key);
        values.push(value);
        Ok(())
    }

    /// Builds the shards of all groups and writes them to
    /// `<base>.L1.p<group>`, releasing the inserted keys.
    ///
    /// Values must fit in `value_bits` bits. Groups are processed in waves
    /// of at most `threads` groups, and a wave is closed early when the
    /// number of its keys exceeds `key_limit`.
    pub fn build(
        &mut self,
        value_bits: usize,
        threads: usize,
        base: impl AsRef<Path>,
        key_limit: u64,
        pl: &mut impl ProgressLog,
    ) -> Result<()> {
        let base = base.as_ref();
        let pool = thread_pool(threads)?;
        let num_groups = self.num_groups();
        let pending = std::mem::replace(&mut self.pending, empty_groups(num_groups));
        let num_keys = pending.iter().map(|(keys, _)| keys.len()).sum::<usize>();

        pl.item_name("group")
            .expected_updates(Some(pending.len()))
            .start(format!(
                "Building {} L1 groups ({} keys)...",
                pending.len(),
                num_keys
            ));

        let signature_bits = self.signature_bits;
        let check_dups = self.check_dups;
        run_in_waves(
            pending.into_iter().enumerate().collect(),
            WaveLimits::new(threads, key_limit),
            |(_, (keys, _))| (keys.len() as u64, 0),
            &pool,
            |(group, (keys, values))| {
                if check_dups {
                    check_duplicates(&keys)?;
                }
                let path = l1_path(base, group);
                let mut out = create_gz(&path)?;
                if keys.is_empty() {
                    out.write_all(&ShardHeader::EMPTY)?;
                } else {
                    let shard =
                        StaticShard::with_values(&keys, &values, value_bits, signature_bits)
                            .with_context(|| format!("Could not build L1 group {}", group))?;
                    shard.store(&mut out)?;
                }
                out.finish()?
                    .flush()
                    .with_context(|| format!("Could not write {}", path.display()))?;
                log::debug!("Wrote L1 group {} ({} keys)", group, keys.len());
                Ok(())
            },
            pl,
        )?;

        pl.done();
        Ok(())
    }

    /// Loads a partition written by [`KeyPartition::build`], reading groups
    /// in parallel using `threads` threads.
    pub fn load(
        base: impl AsRef<Path>,
        key_bits: u32,
        split_bits: u32,
        threads: usize,
    ) -> Result<Self> {
        let base = base.as_ref();
        let mut partition = Self::new(key_bits, split_bits, 0)?;
        partition.pending.clear();
        let pool = thread_pool(threads)?;
        let num_groups = partition.num_groups();

        partition.shards = pool.install(|| {
            (0..num_groups)
                .into_par_iter()
                .map(|group| {
                    let path = l1_path(base, group);
                    StaticShard::load(&mut open_gz(&path)?)
                        .with_context(|| format!("Could not load {}", path.display()))
                })
                .collect::<Result<Vec<_>>>()
        })?;

        log::info!(
            "Loaded {} L1 groups ({} empty)",
            partition.shards.len(),
            partition.shards.iter().filter(|s| s.is_none()).count()
        );
        Ok(partition)
    }

    /// Returns the L1 value of a key of a loaded partition.
    ///
    /// Keys of empty groups, keys outside the key space, and keys detected
    /// as not inserted by the shard signatures have value zero.
    #[inline]
    pub fn query(&self, key: u64) -> u64 {
        match self.shards.get(self.group(key) as usize) {
            Some(Some(shard)) => shard.get(key),
            _ => 0,
        }
    }
}

fn empty_groups(num_groups: usize) -> Vec<(Vec<u64>, Vec<u64>)> {
    (0..num_groups).map(|_| (Vec::new(), Vec::new())).collect()
}

fn check_duplicates(keys: &[u64]) -> Result<(), PartitionError> {
    let mut sorted = keys.to_vec();
    sorted.sort_unstable();
    match sorted.windows(2).find(|w| w[0] == w[1]) {
        Some(w) => Err(PartitionError::DuplicateKey(w[0])),
        None => Ok(()),
    }
}
