/*
 * SPDX-FileCopyrightText: 2025 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! Construction of indices.
//!
//! An [`IndexBuilder`] makes two passes over a [`TagReader`]:
//!
//! 1. [`IndexBuilder::estimate_parameters`] samples a prefix of the input
//!    and produces an [`EncodingPlan`];
//! 2. [`IndexBuilder::construct_from_reader`] [classifies](IndexBuilder::classify)
//!    every pair, routing keys to the L1 partition and to value-list nodes,
//!    and then [persists](StagedIndex::persist) the result.
//!
//! [`IndexBuilder::build`] runs both passes.
//!
//! # Classification
//!
//! A key with a single tag `t` gets L1 value `t + 1`. A key with
//! `c` tags, where `2 ≤ c ≤ short_list_limit`, goes to the active short-list
//! node of cardinality `c`. Longer lists are sorted, deduplicated and
//! delta-encoded: if the code is shorter than a bitmap over the tag space,
//! the key goes to the active delta-encoded node of the length group of the
//! code, otherwise to the active bitmap node. Keys with an empty list are
//! skipped.
//!
//! Each bucket (cardinality, length group, or bitmap) has an active node.
//! When adding a key to the active node would make its number of keys times
//! the per-key cost exceed [`l2_limit`](BuildConfig::l2_limit), a new node is
//! appended to the node list and becomes the active node of the bucket. Keys
//! routed to node `i` get L1 value `i + l2_id_shift`.

mod config;
pub use config::*;

mod estimate;
pub use estimate::*;

use crate::l2::codec::{self, bitmap_len, encode_deltas};
use crate::l2::ValueListNode;
use crate::meta::{l2_path, IndexMetadata};
use crate::partition::KeyPartition;
use crate::reader::TagReader;
use crate::sched::{run_in_waves, thread_pool, WaveLimits};
use crate::Tag;
use anyhow::{ensure, Context, Result};
use dsi_progress_logger::ProgressLog;
use itertools::Itertools;
use std::path::Path;

/// The largest supported number of samples.
pub const MAX_SAMPLE_COUNT: u32 = 1 << 16;

/// Fatal build errors.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum BuildError {
    #[error("Invalid k-mer length {0} (must be between 1 and 32)")]
    /// Keys must fit in 64 bits.
    InvalidKmerLength(u32),
    #[error("Invalid sample count {0}")]
    /// The sample count must be positive and at most [`MAX_SAMPLE_COUNT`].
    InvalidSampleCount(u32),
    #[error("Key {key:#x} has tag {tag}, but there are {sample_count} samples")]
    /// A tag is not smaller than the sample count.
    TagOutOfRange {
        key: u64,
        tag: Tag,
        sample_count: u32,
    },
}

/// Statistics about a built index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BuildSummary {
    /// The number of keys with at least one tag.
    pub num_keys: u64,
    /// Keys with a single tag, stored in L1.
    pub direct_keys: u64,
    /// Keys stored in short-list nodes.
    pub short_keys: u64,
    /// Keys stored in delta-encoded nodes.
    pub encoded_keys: u64,
    /// Keys stored in bitmap nodes.
    pub mapp_keys: u64,
    /// Keys with an empty tag list, which are not stored.
    pub skipped_keys: u64,
    pub num_nodes: usize,
    pub split_bits: u32,
    pub l1_value_bits: u32,
}

/// Builds indices.
///
/// ```rust
/// # use anyhow::Result;
/// # fn main() -> Result<()> {
/// use dsi_progress_logger::no_logging;
/// use tagmap::prelude::*;
///
/// let dir = tempfile::tempdir()?;
/// let base = dir.path().join("index");
/// let mut reader = VecTagReader::new(31, 10, vec![(1, vec![3]), (2, vec![1, 2])]);
/// IndexBuilder::new(BuildConfig::default().threads(2)).build(&mut reader, &base, no_logging![])?;
///
/// let index = TagIndex::load(&base, 2)?;
/// assert_eq!(index.query(1), vec![3]);
/// assert_eq!(index.query(2), vec![1, 2]);
/// #     Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct IndexBuilder {
    config: BuildConfig,
}

impl IndexBuilder {
    pub fn new(config: BuildConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &BuildConfig {
        &self.config
    }

    /// Returns the largest cardinality of lists stored as short lists.
    pub fn short_list_limit(&self, sample_count: u32) -> usize {
        let limit = codec::short_list_limit(sample_count);
        self.config
            .short_list_limit
            .map_or(limit, |l| l.clamp(1, limit))
    }

    fn check_reader(reader: &impl TagReader) -> Result<()> {
        let kmer_length = reader.kmer_length();
        ensure!(
            (1..=32).contains(&kmer_length),
            BuildError::InvalidKmerLength(kmer_length)
        );
        let sample_count = reader.sample_count();
        ensure!(
            (1..=MAX_SAMPLE_COUNT).contains(&sample_count),
            BuildError::InvalidSampleCount(sample_count)
        );
        Ok(())
    }

    /// Samples the input and estimates the parameters of the index; the
    /// reader is reset afterwards.
    pub fn estimate_parameters(
        &self,
        reader: &mut impl TagReader,
        pl: &mut impl ProgressLog,
    ) -> Result<EncodingPlan> {
        Self::check_reader(reader)?;
        estimate_parameters(
            reader,
            self.short_list_limit(reader.sample_count()),
            self.config.sample_limit,
            self.config.l2_limit,
            pl,
        )
    }

    /// Streams all pairs of the reader, routing each key to L1 and to a
    /// value-list node, and returns the in-memory result.
    pub fn classify(
        &self,
        reader: &mut impl TagReader,
        plan: &EncodingPlan,
        pl: &mut impl ProgressLog,
    ) -> Result<StagedIndex> {
        Self::check_reader(reader)?;
        let kmer_length = reader.kmer_length();
        let sample_count = reader.sample_count();
        ensure!(
            plan.sample_count == sample_count,
            "The plan was estimated for {} samples, but the reader has {}",
            plan.sample_count,
            sample_count
        );
        let key_bits = 2 * kmer_length;
        let split_bits = self
            .config
            .split_bits
            .unwrap_or_else(|| plan.split_bits(self.config.keys_per_group, key_bits));

        let mut partition = KeyPartition::new(key_bits, split_bits, self.config.signature_bits)?
            .check_dups(self.config.check_dups);
        let mut meta = IndexMetadata::new(kmer_length, sample_count, split_bits);
        let l2_id_shift = meta.l2_id_shift;
        let l2_limit = self.config.l2_limit;
        let short_list_limit = self.short_list_limit(sample_count);
        let bitmap_len = bitmap_len(sample_count);

        let mut nodes: Vec<ValueListNode> = Vec::new();
        let mut active_short: Vec<Option<usize>> = vec![None; short_list_limit + 1];
        let mut active_encoded: Vec<Option<usize>> = vec![None; plan.group_widths.len()];
        let mut active_mapp: Option<usize> = None;
        let mut summary = BuildSummary {
            split_bits,
            ..Default::default()
        };

        pl.item_name("pair")
            .expected_updates(Some(plan.estimated_keys as usize))
            .start("Classifying...");

        let mut tags: Vec<Tag> = Vec::new();
        let mut sorted: Vec<Tag> = Vec::new();
        let mut row: Vec<u8> = Vec::new();

        while let Some(key) = reader.next_value_list(&mut tags)? {
            pl.light_update();
            if let Some(&tag) = tags.iter().find(|&&tag| tag >= sample_count) {
                return Err(BuildError::TagOutOfRange {
                    key,
                    tag,
                    sample_count,
                }
                .into());
            }

            let value = match tags.len() {
                0 => {
                    summary.skipped_keys += 1;
                    continue;
                }
                1 => {
                    summary.direct_keys += 1;
                    tags[0] as u64 + 1
                }
                c if c <= short_list_limit => {
                    let index = active_node(&mut nodes, &mut active_short[c], c, l2_limit, || {
                        ValueListNode::short(c, sample_count)
                    });
                    nodes[index].add(key, &tags)?;
                    summary.short_keys += 1;
                    index as u64 + l2_id_shift
                }
                _ => {
                    sorted.clear();
                    sorted.extend(tags.iter().copied().sorted_unstable().dedup());
                    row.clear();
                    encode_deltas(&sorted, &mut row);

                    let index = if row.len() < bitmap_len {
                        let group = plan.group_of(row.len());
                        let width = plan.group_width(group);
                        let index = active_node(
                            &mut nodes,
                            &mut active_encoded[group],
                            width,
                            l2_limit,
                            || ValueListNode::value_index_encoded(width, sample_count),
                        );
                        summary.encoded_keys += 1;
                        nodes[index].add_encoded(key, &row)?;
                        index
                    } else {
                        let index =
                            active_node(&mut nodes, &mut active_mapp, bitmap_len, l2_limit, || {
                                ValueListNode::mapp(sample_count)
                            });
                        summary.mapp_keys += 1;
                        nodes[index].add(key, &sorted)?;
                        index
                    };
                    index as u64 + l2_id_shift
                }
            };

            partition.insert(key, value)?;
            summary.num_keys += 1;
        }
        pl.done();

        let mut l1_value_bits = 8;
        while (1_u64 << l1_value_bits) < nodes.len() as u64 + l2_id_shift + 5 {
            l1_value_bits += 1;
        }
        meta.l1_value_bits = l1_value_bits;
        meta.num_keys = summary.num_keys;
        meta.nodes = nodes.iter().map(ValueListNode::descriptor).collect();
        summary.l1_value_bits = l1_value_bits;
        summary.num_nodes = nodes.len();

        pl.info(format_args!(
            "{} keys: {} direct, {} in short lists, {} delta-encoded, {} in bitmaps ({} skipped)",
            summary.num_keys,
            summary.direct_keys,
            summary.short_keys,
            summary.encoded_keys,
            summary.mapp_keys,
            summary.skipped_keys
        ));
        pl.info(format_args!(
            "{} L2 nodes, {} L1 value bits, {} split bits",
            nodes.len(),
            l1_value_bits,
            split_bits
        ));

        Ok(StagedIndex {
            config: self.config.clone(),
            meta,
            partition,
            nodes,
            summary,
        })
    }

    /// Classifies all pairs of the reader and writes the index with base
    /// path `base`.
    pub fn construct_from_reader(
        &self,
        reader: &mut impl TagReader,
        plan: &EncodingPlan,
        base: impl AsRef<Path>,
        pl: &mut impl ProgressLog,
    ) -> Result<BuildSummary> {
        self.classify(reader, plan, pl)?.persist(base, pl)
    }

    /// Estimates parameters, classifies all pairs and writes the index with
    /// base path `base`.
    pub fn build(
        &self,
        reader: &mut impl TagReader,
        base: impl AsRef<Path>,
        pl: &mut impl ProgressLog,
    ) -> Result<BuildSummary> {
        let plan = self.estimate_parameters(reader, pl)?;
        self.construct_from_reader(reader, &plan, base, pl)
    }
}

/// Returns the index of the active node of a bucket, allocating a new node
/// if there is no active node or if adding a key of the given cost would
/// exceed `l2_limit`.
fn active_node(
    nodes: &mut Vec<ValueListNode>,
    active: &mut Option<usize>,
    cost: usize,
    l2_limit: u64,
    new_node: impl FnOnce() -> ValueListNode,
) -> usize {
    if let Some(index) = *active {
        let count = nodes[index].key_count() as u64;
        if count == 0 || (count + 1) * cost as u64 <= l2_limit {
            return index;
        }
        log::debug!(
            "Node {} is full ({} keys of cost {}); rotating",
            index,
            count,
            cost
        );
    }
    nodes.push(new_node());
    let index = nodes.len() - 1;
    *active = Some(index);
    index
}

/// The result of [`IndexBuilder::classify`]: an index whose keys have been
/// routed, but whose static functions have not been built yet.
#[derive(Debug)]
pub struct StagedIndex {
    config: BuildConfig,
    meta: IndexMetadata,
    partition: KeyPartition,
    nodes: Vec<ValueListNode>,
    summary: BuildSummary,
}

impl StagedIndex {
    pub fn metadata(&self) -> &IndexMetadata {
        &self.meta
    }

    pub fn nodes(&self) -> &[ValueListNode] {
        &self.nodes
    }

    pub fn summary(&self) -> &BuildSummary {
        &self.summary
    }

    /// Writes the metadata, builds and writes the L1 partition, and then
    /// constructs and writes all value-list nodes.
    ///
    /// Nodes are processed in waves, from the largest to the smallest
    /// number of values; the L1 partition is dropped before starting with
    /// nodes.
    pub fn persist(
        self,
        base: impl AsRef<Path>,
        pl: &mut impl ProgressLog,
    ) -> Result<BuildSummary> {
        let base = base.as_ref();
        let Self {
            config,
            meta,
            mut partition,
            nodes,
            summary,
        } = self;

        meta.save(base)?;

        partition.build(
            meta.l1_value_bits as usize,
            config.threads,
            base,
            config.l1_queue_key_limit,
            pl,
        )?;
        drop(partition);

        let mut nodes = nodes.into_iter().enumerate().collect::<Vec<_>>();
        nodes.sort_by_key(|(_, node)| std::cmp::Reverse(node.value_count()));
        let limits = WaveLimits::new(config.threads, config.l2_queue_key_limit)
            .value_limit(config.l2_queue_value_limit);
        let pool = thread_pool(config.threads)?;

        pl.item_name("node")
            .expected_updates(Some(nodes.len()))
            .start(format!("Building {} L2 nodes...", nodes.len()));

        run_in_waves(
            nodes,
            limits,
            |(_, node)| (node.key_count() as u64, node.value_count() as u64),
            &pool,
            |(index, mut node)| {
                node.construct()
                    .with_context(|| format!("Could not build L2 node {}", index))?;
                node.persist(l2_path(base, index))?;
                log::debug!(
                    "Wrote L2 node {} ({} keys, {} values)",
                    index,
                    node.key_count(),
                    node.value_count()
                );
                Ok(())
            },
            pl,
        )?;

        pl.done();
        Ok(summary)
    }
}
