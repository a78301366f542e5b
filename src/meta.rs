/*
 * SPDX-FileCopyrightText: 2025 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! Index metadata and file names.
//!
//! An index with base path `<base>` is made of the following files:
//!
//! ```text
//! <base>.meta.toml     # IndexMetadata
//! <base>.L1.p<group>   # one L1 shard for each of the 2^split_bits groups
//! <base>.L2.<node>     # one file for each value-list node
//! ```

use crate::l2::{NodeDescriptor, NodeKind};
use anyhow::{bail, ensure, Context, Result};
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

/// Magic string identifying the metadata of an index.
pub const FORMAT_MAGIC: &str = "TAGMAP";

/// Format version; increment on breaking changes.
pub const FORMAT_VERSION: u32 = 1;

fn with_suffix(base: &Path, suffix: &str) -> PathBuf {
    let mut path = OsString::from(base.as_os_str());
    path.push(suffix);
    PathBuf::from(path)
}

/// Returns the path of the metadata file.
pub fn meta_path(base: impl AsRef<Path>) -> PathBuf {
    with_suffix(base.as_ref(), ".meta.toml")
}

/// Returns the path of the file of an L1 group.
pub fn l1_path(base: impl AsRef<Path>, group: usize) -> PathBuf {
    with_suffix(base.as_ref(), &format!(".L1.p{}", group))
}

/// Returns the path of the file of an L2 node.
pub fn l2_path(base: impl AsRef<Path>, node: usize) -> PathBuf {
    with_suffix(base.as_ref(), &format!(".L2.{}", node))
}

/// The metadata of an index.
///
/// Stored as TOML, so it can be inspected by hand.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexMetadata {
    /// Magic string for format identification.
    pub magic: String,
    pub format_version: u32,
    /// The length of k-mers; keys have twice as many bits.
    pub kmer_length: u32,
    /// The number of samples; tags are smaller than this value.
    pub sample_count: u32,
    /// The number of bits used to split the key space into L1 groups.
    pub l1_split_bits: u32,
    /// The smallest L1 value pointing to an L2 node.
    pub l2_id_shift: u64,
    /// The bit width of L1 values.
    pub l1_value_bits: u32,
    /// The number of keys of the index.
    pub num_keys: u64,
    /// The L2 nodes, in order of node index.
    pub nodes: Vec<NodeDescriptor>,
}

impl IndexMetadata {
    pub fn new(kmer_length: u32, sample_count: u32, l1_split_bits: u32) -> Self {
        Self {
            magic: FORMAT_MAGIC.to_string(),
            format_version: FORMAT_VERSION,
            kmer_length,
            sample_count,
            l1_split_bits,
            l2_id_shift: sample_count as u64 + 2,
            l1_value_bits: 0,
            num_keys: 0,
            nodes: Vec::new(),
        }
    }

    /// Returns the number of bits of a key.
    pub fn key_bits(&self) -> u32 {
        2 * self.kmer_length
    }

    /// Saves the metadata to `<base>.meta.toml`.
    pub fn save(&self, base: impl AsRef<Path>) -> Result<()> {
        let path = meta_path(base);
        let toml_str = toml::to_string_pretty(self).context("Could not serialize metadata")?;
        fs::write(&path, toml_str)
            .with_context(|| format!("Could not write metadata to {}", path.display()))?;
        Ok(())
    }

    /// Loads and validates the metadata in `<base>.meta.toml`.
    pub fn load(base: impl AsRef<Path>) -> Result<Self> {
        let path = meta_path(base);
        let toml_str = fs::read_to_string(&path)
            .with_context(|| format!("Could not read metadata from {}", path.display()))?;
        let meta: Self = toml::from_str(&toml_str)
            .with_context(|| format!("Could not parse metadata in {}", path.display()))?;
        meta.validate()
            .with_context(|| format!("Invalid metadata in {}", path.display()))?;
        Ok(meta)
    }

    fn validate(&self) -> Result<()> {
        if self.magic != FORMAT_MAGIC {
            bail!(
                "Invalid magic: expected '{}', got '{}'",
                FORMAT_MAGIC,
                self.magic
            );
        }
        if self.format_version > FORMAT_VERSION {
            bail!(
                "Unsupported format version: {} (max supported: {})",
                self.format_version,
                FORMAT_VERSION
            );
        }
        ensure!(
            (1..=32).contains(&self.kmer_length),
            "Invalid k-mer length {}",
            self.kmer_length
        );
        ensure!(
            self.l1_split_bits <= self.key_bits(),
            "Cannot split {}-bit keys using {} bits",
            self.key_bits(),
            self.l1_split_bits
        );
        ensure!(
            self.l2_id_shift == self.sample_count as u64 + 2,
            "L2 id shift {} does not match sample count {}",
            self.l2_id_shift,
            self.sample_count
        );
        ensure!(
            self.l1_value_bits <= 64,
            "Invalid L1 value width {}",
            self.l1_value_bits
        );
        for (i, node) in self.nodes.iter().enumerate() {
            let valid = match node.kind {
                NodeKind::Short => {
                    node.width >= 2 && node.width * node.tag_bits as usize <= 64
                }
                NodeKind::ValueIndexEncoded | NodeKind::Mapp => node.width > 0,
            };
            ensure!(valid, "Invalid descriptor of node {}: {:?}", i, node);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths() {
        assert_eq!(meta_path("/tmp/idx"), PathBuf::from("/tmp/idx.meta.toml"));
        assert_eq!(l1_path("/tmp/idx", 3), PathBuf::from("/tmp/idx.L1.p3"));
        assert_eq!(l2_path("idx", 12), PathBuf::from("idx.L2.12"));
    }

    #[test]
    fn test_save_load() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let base = dir.path().join("index");
        let mut meta = IndexMetadata::new(31, 100, 4);
        meta.l1_value_bits = 8;
        meta.num_keys = 42;
        meta.nodes.push(NodeDescriptor {
            kind: NodeKind::Short,
            width: 3,
            tag_bits: 7,
            keys: 10,
            values: 30,
        });
        meta.nodes.push(NodeDescriptor {
            kind: NodeKind::Mapp,
            width: 13,
            tag_bits: 0,
            keys: 2,
            values: 26,
        });
        meta.save(&base)?;
        assert_eq!(IndexMetadata::load(&base)?, meta);
        Ok(())
    }

    #[test]
    fn test_invalid() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let base = dir.path().join("index");
        let mut meta = IndexMetadata::new(31, 100, 4);
        meta.l2_id_shift = 7;
        meta.save(&base)?;
        assert!(IndexMetadata::load(&base).is_err());

        let mut meta = IndexMetadata::new(31, 100, 4);
        meta.magic = "XXX".to_string();
        meta.save(&base)?;
        assert!(IndexMetadata::load(&base).is_err());

        assert!(IndexMetadata::load(dir.path().join("missing")).is_err());
        Ok(())
    }
}
