/*
 * SPDX-FileCopyrightText: 2025 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! Loading and querying indices.

use crate::l2::ValueListNode;
use crate::meta::{l2_path, IndexMetadata};
use crate::partition::KeyPartition;
use crate::sched::ResourceScheduler;
use crate::Tag;
use anyhow::{Context, Result};
use derivative::Derivative;
use derive_setters::*;
use rayon::prelude::*;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Parameters for [`TagIndex::load_with`].
#[derive(Setters, Debug, Clone, Derivative)]
#[derivative(Default)]
#[setters(generate = false)]
pub struct LoadConfig {
    /// The number of threads loading L1 groups and L2 nodes. The default
    /// is 8.
    #[setters(generate = true)]
    #[derivative(Default(value = "8"))]
    threads: usize,

    /// The budget in MiB for the payloads of L2 nodes being loaded
    /// concurrently. The default is 16 GiB.
    #[setters(generate = true)]
    #[derivative(Default(value = "16 << 10"))]
    memory_budget: u64,
}

/// A loaded index.
///
/// Queries are read-only, so an index can be shared among threads.
#[derive(Debug)]
pub struct TagIndex {
    meta: IndexMetadata,
    l1: KeyPartition,
    nodes: Vec<ValueListNode>,
}

impl TagIndex {
    /// Loads the index with base path `base` using `threads` threads.
    pub fn load(base: impl AsRef<Path>, threads: usize) -> Result<Self> {
        Self::load_with(base, &LoadConfig::default().threads(threads))
    }

    /// Loads the index with base path `base`.
    ///
    /// After reading the metadata and the L1 partition, L2 nodes are loaded
    /// by a [`ResourceScheduler`] with [`threads`](LoadConfig::threads)
    /// workers: worker `w` loads the nodes whose index is congruent to `w`
    /// modulo the number of threads, and its cost is the size in MiB of the
    /// payloads of its nodes.
    pub fn load_with(base: impl AsRef<Path>, config: &LoadConfig) -> Result<Self> {
        let base = base.as_ref();
        let threads = config.threads.max(1);
        let meta = IndexMetadata::load(base)?;
        let l1 = KeyPartition::load(base, meta.key_bits(), meta.l1_split_bits, threads)?;

        let num_nodes = meta.nodes.len();
        let num_tasks = threads.min(num_nodes);
        let scheduler = ResourceScheduler::new(num_tasks.max(1), config.memory_budget.max(1));
        let descriptors = Arc::new(meta.nodes.clone());
        let base_path: Arc<PathBuf> = Arc::new(base.to_owned());
        let sample_count = meta.sample_count;

        let mut handles = Vec::with_capacity(num_tasks);
        for worker in 0..num_tasks {
            let indices = (worker..num_nodes).step_by(num_tasks).collect::<Vec<_>>();
            let bytes: u64 = indices.iter().map(|&i| descriptors[i].payload_bytes()).sum();
            let cost = (bytes >> 20).max(1);
            let descriptors = descriptors.clone();
            let base_path = base_path.clone();
            handles.push(scheduler.submit(cost, move || -> Result<Vec<(usize, ValueListNode)>> {
                log::debug!(
                    "Loading {} L2 nodes ({} bytes) in task {}",
                    indices.len(),
                    bytes,
                    worker
                );
                indices
                    .into_iter()
                    .map(|i| {
                        let path = l2_path(base_path.as_path(), i);
                        ValueListNode::load(&path, &descriptors[i], sample_count)
                            .with_context(|| format!("Could not load L2 node {}", i))
                            .map(|node| (i, node))
                    })
                    .collect()
            })?);
        }

        let mut slots: Vec<Option<ValueListNode>> = (0..num_nodes).map(|_| None).collect();
        for handle in handles {
            for (i, node) in handle.join()?? {
                slots[i] = Some(node);
            }
        }
        scheduler.shutdown();

        let nodes = slots
            .into_iter()
            .enumerate()
            .map(|(i, node)| node.with_context(|| format!("L2 node {} was not loaded", i)))
            .collect::<Result<Vec<_>>>()?;

        log::info!(
            "Loaded index {} ({} keys, {} L2 nodes)",
            base.display(),
            meta.num_keys,
            nodes.len()
        );
        Ok(Self { meta, l1, nodes })
    }

    pub fn metadata(&self) -> &IndexMetadata {
        &self.meta
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    /// Returns the tags of a key.
    ///
    /// The result is empty for keys that are not in the index, except with
    /// probability depending on the number of signature bits used at
    /// construction time.
    pub fn query(&self, key: u64) -> Vec<Tag> {
        let mut tags = Vec::new();
        self.query_into(key, &mut tags);
        tags
    }

    /// Replaces the content of `out` with the tags of a key.
    pub fn query_into(&self, key: u64, out: &mut Vec<Tag>) {
        out.clear();
        let value = self.l1.query(key);
        if value == 0 {
            return;
        }
        if value < self.meta.l2_id_shift {
            out.push((value - 1) as Tag);
            return;
        }
        match self.nodes.get((value - self.meta.l2_id_shift) as usize) {
            Some(node) => node.query(key, out),
            None => log::debug!(
                "Key {:#x} has L1 value {} beyond the {} L2 nodes",
                key,
                value,
                self.nodes.len()
            ),
        }
    }

    /// Returns the tags of many keys, querying in parallel.
    pub fn query_all(&self, keys: &[u64]) -> Vec<Vec<Tag>> {
        keys.par_iter().map(|&key| self.query(key)).collect()
    }
}
