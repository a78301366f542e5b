/*
 * SPDX-FileCopyrightText: 2025 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! The second level of the index.
//!
//! Keys with more than one tag are stored in *value-list nodes*. Each node
//! stores lists of the same shape: a [`ShortValueList`] stores lists of a
//! fixed cardinality packed in a single integer, whereas an
//! [`EncodedValueList`] stores byte rows of fixed width, containing either
//! delta-encoded lists ([`EncodingKind::ValueIndexEncoded`]) or bitmaps over
//! the tag space ([`EncodingKind::Mapp`]). See the [`codec`] module for the
//! encodings.
//!
//! A node has two phases: keys are [added](ValueListNode::add) with their
//! lists, and then [`ValueListNode::construct`] builds an index-only
//! [`StaticShard`](crate::func::StaticShard) over the keys and sorts the
//! payload table by slot, sealing the node. A sealed node can be
//! [persisted](ValueListNode::persist) to its own file and
//! [queried](ValueListNode::query).

pub mod codec;

mod encoded;
pub use encoded::*;

mod short;
pub use short::*;

use crate::Tag;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Errors raised by value-list nodes.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum NodeError {
    #[error("The node has been sealed")]
    /// Keys were added after [`ValueListNode::construct`].
    Sealed,
    #[error("The node has not been constructed")]
    /// The node was persisted or queried before [`ValueListNode::construct`].
    NotConstructed,
    #[error("Expected {expected} tags, got {actual}")]
    /// A list added to a short-list node has the wrong cardinality.
    WrongCardinality { expected: usize, actual: usize },
    #[error("Row of {actual} bytes does not fit in {width} bytes")]
    /// An encoded row is wider than the rows of the node.
    RowTooWide { width: usize, actual: usize },
    #[error("Short-list nodes do not store encoded rows")]
    /// An encoded row was added to a short-list node.
    NotEncoded,
    #[error("Tag {tag} is not smaller than the sample count {sample_count}")]
    /// A tag is outside the tag space.
    TagOutOfRange { tag: Tag, sample_count: u32 },
}

/// The encoding of the rows of an [`EncodedValueList`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncodingKind {
    /// Delta lists in VByte code.
    ValueIndexEncoded,
    /// Bitmaps over the tag space.
    Mapp,
}

/// The kind of a node, as stored in the index metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Short,
    ValueIndexEncoded,
    Mapp,
}

impl From<EncodingKind> for NodeKind {
    fn from(kind: EncodingKind) -> Self {
        match kind {
            EncodingKind::ValueIndexEncoded => NodeKind::ValueIndexEncoded,
            EncodingKind::Mapp => NodeKind::Mapp,
        }
    }
}

/// A description of a node, sufficient to load it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    pub kind: NodeKind,
    /// The cardinality of the lists of a short-list node, or the width in
    /// bytes of the rows of an encoded node.
    pub width: usize,
    /// The number of bits per tag of a short-list node; zero otherwise.
    pub tag_bits: u32,
    /// The number of keys of the node.
    pub keys: u64,
    /// The number of keys times the per-key cost.
    pub values: u64,
}

impl NodeDescriptor {
    /// Returns the size in bytes of the payload table of the node.
    pub fn payload_bytes(&self) -> u64 {
        match self.kind {
            NodeKind::Short => {
                (self.keys * self.width as u64 * self.tag_bits as u64).div_ceil(8)
            }
            NodeKind::ValueIndexEncoded | NodeKind::Mapp => self.keys * self.width as u64,
        }
    }
}

/// A value-list node.
#[derive(Debug)]
pub enum ValueListNode {
    Short(ShortValueList),
    Encoded(EncodedValueList),
}

impl ValueListNode {
    /// Creates an empty short-list node for lists of `cardinality` tags
    /// smaller than `sample_count`.
    pub fn short(cardinality: usize, sample_count: u32) -> Self {
        Self::Short(ShortValueList::new(cardinality, codec::tag_bits(sample_count)))
    }

    /// Creates an empty node of delta-encoded rows of `width` bytes.
    pub fn value_index_encoded(width: usize, sample_count: u32) -> Self {
        Self::Encoded(EncodedValueList::new(
            EncodingKind::ValueIndexEncoded,
            width,
            sample_count,
        ))
    }

    /// Creates an empty node of bitmaps over `sample_count` tags.
    pub fn mapp(sample_count: u32) -> Self {
        Self::Encoded(EncodedValueList::new(
            EncodingKind::Mapp,
            codec::bitmap_len(sample_count),
            sample_count,
        ))
    }

    /// Adds a key with its list of tags, encoding the list as required by
    /// the node.
    ///
    /// Lists of delta-encoded nodes must be strictly increasing.
    pub fn add(&mut self, key: u64, tags: &[Tag]) -> Result<(), NodeError> {
        match self {
            Self::Short(node) => node.add(key, tags),
            Self::Encoded(node) => node.add(key, tags),
        }
    }

    /// Adds a key with an already encoded row.
    pub fn add_encoded(&mut self, key: u64, row: &[u8]) -> Result<(), NodeError> {
        match self {
            Self::Short(_) => Err(NodeError::NotEncoded),
            Self::Encoded(node) => node.add_encoded(key, row),
        }
    }

    /// Builds the static function of the node and seals it.
    pub fn construct(&mut self) -> Result<()> {
        match self {
            Self::Short(node) => node.construct(),
            Self::Encoded(node) => node.construct(),
        }
    }

    /// Writes a sealed node to a file.
    pub fn persist(&self, path: impl AsRef<Path>) -> Result<()> {
        match self {
            Self::Short(node) => node.persist(path),
            Self::Encoded(node) => node.persist(path),
        }
    }

    /// Loads the node described by `descriptor` from a file.
    pub fn load(
        path: impl AsRef<Path>,
        descriptor: &NodeDescriptor,
        sample_count: u32,
    ) -> Result<Self> {
        Ok(match descriptor.kind {
            NodeKind::Short => Self::Short(ShortValueList::load(
                path,
                descriptor.width,
                descriptor.tag_bits,
            )?),
            NodeKind::ValueIndexEncoded => Self::Encoded(EncodedValueList::load(
                path,
                EncodingKind::ValueIndexEncoded,
                descriptor.width,
                sample_count,
            )?),
            NodeKind::Mapp => Self::Encoded(EncodedValueList::load(
                path,
                EncodingKind::Mapp,
                descriptor.width,
                sample_count,
            )?),
        })
    }

    /// Creates an empty node as described by `descriptor`.
    pub fn from_descriptor(descriptor: &NodeDescriptor, sample_count: u32) -> Self {
        match descriptor.kind {
            NodeKind::Short => Self::Short(ShortValueList::new(descriptor.width, descriptor.tag_bits)),
            NodeKind::ValueIndexEncoded => Self::value_index_encoded(descriptor.width, sample_count),
            NodeKind::Mapp => Self::mapp(sample_count),
        }
    }

    /// Appends the tags of a key to `out`.
    ///
    /// The result is arbitrary on keys that were not added to the node.
    #[inline]
    pub fn query(&self, key: u64, out: &mut Vec<Tag>) {
        match self {
            Self::Short(node) => node.query(key, out),
            Self::Encoded(node) => node.query(key, out),
        }
    }

    /// Returns the number of keys of the node.
    pub fn key_count(&self) -> usize {
        match self {
            Self::Short(node) => node.key_count(),
            Self::Encoded(node) => node.key_count(),
        }
    }

    /// Returns the number of keys times the per-key cost (the cardinality
    /// for short lists, the row width for encoded lists).
    pub fn value_count(&self) -> usize {
        match self {
            Self::Short(node) => node.key_count() * node.cardinality(),
            Self::Encoded(node) => node.key_count() * node.width(),
        }
    }

    pub fn is_sealed(&self) -> bool {
        match self {
            Self::Short(node) => node.is_sealed(),
            Self::Encoded(node) => node.is_sealed(),
        }
    }

    pub fn descriptor(&self) -> NodeDescriptor {
        let (kind, width, tag_bits) = match self {
            Self::Short(node) => (NodeKind::Short, node.cardinality(), node.tag_bits()),
            Self::Encoded(node) => (node.kind().into(), node.width(), 0),
        };
        NodeDescriptor {
            kind,
            width,
            tag_bits,
            keys: self.key_count() as u64,
            values: self.value_count() as u64,
        }
    }
}
