/*
 * SPDX-FileCopyrightText: 2025 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

use super::codec::{pack_short, unpack_short};
use super::NodeError;
use crate::bits::BitFieldVec;
use crate::func::{create_gz, open_gz, StaticShard};
use crate::Tag;
use anyhow::{ensure, Context, Result};
use epserde::prelude::*;
use std::io::Write;
use std::path::Path;

/// A node storing lists of fixed cardinality.
///
/// Each list is packed in a code of `cardinality · tag_bits ≤ 64` bits, and
/// codes are stored in a [`BitFieldVec`] indexed by the slot of the key in
/// the static function of the node. The order of the tags of a list is
/// preserved.
#[derive(Debug)]
pub struct ShortValueList {
    cardinality: usize,
    tag_bits: u32,
    /// Keys waiting for construction.
    keys: Vec<u64>,
    /// The codes, in insertion order before construction and in slot order
    /// afterwards.
    codes: BitFieldVec,
    shard: Option<StaticShard>,
}

impl ShortValueList {
    /// Creates an empty node for lists of `cardinality` tags of `tag_bits`
    /// bits.
    ///
    /// # Panics
    ///
    /// If `cardinality · tag_bits` is larger than 64.
    pub fn new(cardinality: usize, tag_bits: u32) -> Self {
        let code_bits = cardinality * tag_bits as usize;
        assert!(
            code_bits <= 64,
            "{} tags of {} bits do not fit in a word",
            cardinality,
            tag_bits
        );
        Self {
            cardinality,
            tag_bits,
            keys: Vec::new(),
            codes: BitFieldVec::new(code_bits, 0),
            shard: None,
        }
    }

    pub fn cardinality(&self) -> usize {
        self.cardinality
    }

    pub fn tag_bits(&self) -> u32 {
        self.tag_bits
    }

    pub fn key_count(&self) -> usize {
        self.codes.len()
    }

    pub fn is_sealed(&self) -> bool {
        self.shard.is_some()
    }

    pub fn add(&mut self, key: u64, tags: &[Tag]) -> Result<(), NodeError> {
        if self.is_sealed() {
            return Err(NodeError::Sealed);
        }
        if tags.len() != self.cardinality {
            return Err(NodeError::WrongCardinality {
                expected: self.cardinality,
                actual: tags.len(),
            });
        }
        if let Some(&tag) = tags
            .iter()
            .find(|&&tag| tag.checked_shr(self.tag_bits).unwrap_or(0) != 0)
        {
            return Err(NodeError::TagOutOfRange {
                tag,
                sample_count: 1 << self.tag_bits,
            });
        }
        self.keys.push(key);
        self.codes.push(pack_short(tags, self.tag_bits));
        Ok(())
    }

    pub fn construct(&mut self) -> Result<()> {
        ensure!(!self.is_sealed(), NodeError::Sealed);
        let shard = StaticShard::index_only(&self.keys, 0)?;
        let mut codes = BitFieldVec::new(self.codes.bit_width(), self.keys.len());
        for (key, code) in self.keys.iter().zip(self.codes.iter()) {
            let slot = shard
                .slot(*key)
                .with_context(|| format!("Key {:#x} has no slot", key))?;
            codes.set(slot, code);
        }
        self.codes = codes;
        self.keys = Vec::new();
        self.shard = Some(shard);
        Ok(())
    }

    pub fn persist(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let shard = self.shard.as_ref().ok_or(NodeError::NotConstructed)?;
        let mut out = create_gz(path)?;
        shard.store(&mut out)?;
        self.codes.serialize(&mut out)?;
        out.finish()?
            .flush()
            .with_context(|| format!("Could not write {}", path.display()))?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>, cardinality: usize, tag_bits: u32) -> Result<Self> {
        let path = path.as_ref();
        ensure!(
            cardinality
                .checked_mul(tag_bits as usize)
                .is_some_and(|bits| bits <= 64),
            "Invalid short-list node: {} tags of {} bits",
            cardinality,
            tag_bits
        );
        let mut input = open_gz(path)?;
        let shard = StaticShard::load(&mut input)
            .with_context(|| format!("Could not load {}", path.display()))?
            .with_context(|| format!("Node file {} is empty", path.display()))?;
        let codes = BitFieldVec::deserialize_checked(&mut input)
            .with_context(|| format!("Could not load the codes of {}", path.display()))?;
        ensure!(
            codes.len() == shard.len() && codes.bit_width() == cardinality * tag_bits as usize,
            "Node file {} contains {} codes of {} bits for {} keys",
            path.display(),
            codes.len(),
            codes.bit_width(),
            shard.len()
        );
        Ok(Self {
            cardinality,
            tag_bits,
            keys: Vec::new(),
            codes,
            shard: Some(shard),
        })
    }

    /// Appends the tags of a key to `out`; nothing is appended if the node
    /// has not been constructed.
    #[inline]
    pub fn query(&self, key: u64, out: &mut Vec<Tag>) {
        if let Some(slot) = self.shard.as_ref().and_then(|shard| shard.slot(key)) {
            unpack_short(self.codes.get(slot), self.cardinality, self.tag_bits, out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_construct_and_query() -> Result<()> {
        let mut node = ShortValueList::new(3, 5);
        for key in 0..1000_u64 {
            let tags = [(key % 32) as Tag, 31 - (key % 32) as Tag, 7];
            node.add(key * 1_000_003, &tags)?;
        }
        node.construct()?;
        assert_eq!(node.key_count(), 1000);
        let mut out = Vec::new();
        for key in 0..1000_u64 {
            out.clear();
            node.query(key * 1_000_003, &mut out);
            assert_eq!(out, [(key % 32) as Tag, 31 - (key % 32) as Tag, 7]);
        }
        Ok(())
    }

    #[test]
    fn test_errors() -> Result<()> {
        let mut node = ShortValueList::new(2, 4);
        assert_eq!(
            node.add(1, &[1, 2, 3]),
            Err(NodeError::WrongCardinality {
                expected: 2,
                actual: 3
            })
        );
        assert_eq!(
            node.add(1, &[1, 16]),
            Err(NodeError::TagOutOfRange {
                tag: 16,
                sample_count: 16
            })
        );
        node.add(1, &[1, 2])?;
        node.construct()?;
        assert_eq!(node.add(2, &[1, 2]), Err(NodeError::Sealed));
        Ok(())
    }
}
