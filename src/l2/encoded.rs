/*
 * SPDX-FileCopyrightText: 2025 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

use super::codec::{decode_bitmap, decode_deltas, encode_bitmap, encode_deltas};
use super::{EncodingKind, NodeError};
use crate::func::{create_gz, open_gz, StaticShard};
use crate::Tag;
use anyhow::{ensure, Context, Result};
use epserde::prelude::*;
use std::io::Write;
use std::path::Path;

/// A node storing encoded lists in byte rows of fixed width.
///
/// Rows shorter than the width are padded with zeroes; since no code of the
/// delta encoding starts with a zero byte, padding is detected when
/// decoding. After construction, row `i` belongs to the key with slot `i`
/// in the static function of the node.
#[derive(Debug)]
pub struct EncodedValueList {
    kind: EncodingKind,
    width: usize,
    sample_count: u32,
    /// Keys waiting for construction.
    keys: Vec<u64>,
    rows: Vec<u8>,
    shard: Option<StaticShard>,
}

impl EncodedValueList {
    pub fn new(kind: EncodingKind, width: usize, sample_count: u32) -> Self {
        Self {
            kind,
            width,
            sample_count,
            keys: Vec::new(),
            rows: Vec::new(),
            shard: None,
        }
    }

    pub fn kind(&self) -> EncodingKind {
        self.kind
    }

    /// Returns the width in bytes of a row.
    pub fn width(&self) -> usize {
        self.width
    }

    pub fn key_count(&self) -> usize {
        if self.width == 0 {
            self.keys.len()
        } else {
            self.rows.len() / self.width
        }
    }

    pub fn is_sealed(&self) -> bool {
        self.shard.is_some()
    }

    /// Encodes a list of tags and adds it.
    ///
    /// For delta-encoded nodes the list must be strictly increasing.
    pub fn add(&mut self, key: u64, tags: &[Tag]) -> Result<(), NodeError> {
        if let Some(&tag) = tags.iter().find(|&&tag| tag >= self.sample_count) {
            return Err(NodeError::TagOutOfRange {
                tag,
                sample_count: self.sample_count,
            });
        }
        let mut row = Vec::with_capacity(self.width);
        match self.kind {
            EncodingKind::ValueIndexEncoded => encode_deltas(tags, &mut row),
            EncodingKind::Mapp => encode_bitmap(tags, self.width, &mut row),
        }
        self.add_encoded(key, &row)
    }

    /// Adds an encoded row, padding it to the width of the node.
    pub fn add_encoded(&mut self, key: u64, row: &[u8]) -> Result<(), NodeError> {
        if self.is_sealed() {
            return Err(NodeError::Sealed);
        }
        if row.len() > self.width {
            return Err(NodeError::RowTooWide {
                width: self.width,
                actual: row.len(),
            });
        }
        self.keys.push(key);
        self.rows.extend_from_slice(row);
        self.rows.resize(self.keys.len() * self.width, 0);
        Ok(())
    }

    pub fn construct(&mut self) -> Result<()> {
        ensure!(!self.is_sealed(), NodeError::Sealed);
        let shard = StaticShard::index_only(&self.keys, 0)?;
        let mut rows = vec![0; self.rows.len()];
        if self.width != 0 {
            for (key, row) in self.keys.iter().zip(self.rows.chunks_exact(self.width)) {
                let slot = shard
                    .slot(*key)
                    .with_context(|| format!("Key {:#x} has no slot", key))?;
                rows[slot * self.width..][..self.width].copy_from_slice(row);
            }
        }
        self.rows = rows;
        self.keys = Vec::new();
        self.shard = Some(shard);
        Ok(())
    }

    pub fn persist(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let shard = self.shard.as_ref().ok_or(NodeError::NotConstructed)?;
        let mut out = create_gz(path)?;
        shard.store(&mut out)?;
        self.width.serialize(&mut out)?;
        self.rows.serialize(&mut out)?;
        out.finish()?
            .flush()
            .with_context(|| format!("Could not write {}", path.display()))?;
        Ok(())
    }

    pub fn load(
        path: impl AsRef<Path>,
        kind: EncodingKind,
        width: usize,
        sample_count: u32,
    ) -> Result<Self> {
        let path = path.as_ref();
        let mut input = open_gz(path)?;
        let shard = StaticShard::load(&mut input)
            .with_context(|| format!("Could not load {}", path.display()))?
            .with_context(|| format!("Node file {} is empty", path.display()))?;

        let stored_width = usize::deserialize_full(&mut input)
            .with_context(|| format!("Node file {} is truncated", path.display()))?;
        ensure!(
            stored_width == width,
            "Node file {} has rows of {} bytes, expected {}",
            path.display(),
            stored_width,
            width
        );
        let rows = Vec::<u8>::deserialize_full(&mut input)
            .with_context(|| format!("Node file {} is truncated", path.display()))?;
        ensure!(
            shard.len().checked_mul(width) == Some(rows.len()),
            "Node file {} has {} row bytes for {} keys of {} bytes",
            path.display(),
            rows.len(),
            shard.len(),
            width
        );

        Ok(Self {
            kind,
            width,
            sample_count,
            keys: Vec::new(),
            rows,
            shard: Some(shard),
        })
    }

    /// Appends the tags of a key to `out`; nothing is appended if the node
    /// has not been constructed.
    #[inline]
    pub fn query(&self, key: u64, out: &mut Vec<Tag>) {
        if let Some(slot) = self.shard.as_ref().and_then(|shard| shard.slot(key)) {
            let row = &self.rows[slot * self.width..][..self.width];
            match self.kind {
                EncodingKind::ValueIndexEncoded => decode_deltas(row, out),
                EncodingKind::Mapp => decode_bitmap(row, out),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::l2::codec::{bitmap_len, delta_encoded_len};

    #[test]
    fn test_delta_rows() -> Result<()> {
        let lists = (0..500_u32)
            .map(|i| (0..(i % 7 + 1)).map(|j| i + j * 37).collect::<Vec<_>>())
            .collect::<Vec<_>>();
        let width = lists.iter().map(|l| delta_encoded_len(l)).max().unwrap();
        let mut node = EncodedValueList::new(EncodingKind::ValueIndexEncoded, width, 1 << 16);
        for (key, list) in lists.iter().enumerate() {
            node.add(key as u64 + 100, list)?;
        }
        node.construct()?;
        assert_eq!(node.key_count(), lists.len());
        let mut out = Vec::new();
        for (key, list) in lists.iter().enumerate() {
            out.clear();
            node.query(key as u64 + 100, &mut out);
            assert_eq!(&out, list);
        }
        Ok(())
    }

    #[test]
    fn test_bitmap_rows() -> Result<()> {
        let mut node = EncodedValueList::new(EncodingKind::Mapp, bitmap_len(20), 20);
        node.add(1, &[0, 5, 19])?;
        node.add(2, &[])?;
        node.construct()?;
        let mut out = Vec::new();
        node.query(1, &mut out);
        assert_eq!(out, [0, 5, 19]);
        out.clear();
        node.query(2, &mut out);
        assert!(out.is_empty());
        Ok(())
    }

    #[test]
    fn test_errors() -> Result<()> {
        let mut node = EncodedValueList::new(EncodingKind::ValueIndexEncoded, 2, 10);
        assert_eq!(
            node.add_encoded(1, &[1, 2, 3]),
            Err(NodeError::RowTooWide {
                width: 2,
                actual: 3
            })
        );
        assert_eq!(
            node.add(1, &[3, 10]),
            Err(NodeError::TagOutOfRange {
                tag: 10,
                sample_count: 10
            })
        );
        node.add(1, &[3, 4])?;
        node.construct()?;
        assert_eq!(node.add_encoded(2, &[1]), Err(NodeError::Sealed));
        assert!(node.construct().is_err());
        Ok(())
    }
}
