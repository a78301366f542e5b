/*
 * SPDX-FileCopyrightText: 2025 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

#![doc = include_str!("../README.md")]
#![deny(unconditional_recursion)]

pub mod bits;
pub mod builder;
pub mod func;
pub mod index;
pub mod l2;
pub mod meta;
pub mod partition;
pub mod reader;
pub mod sched;

/// A sample tag.
///
/// Tags of an index with `sample_count` samples are smaller than
/// `sample_count`.
pub type Tag = u32;

pub mod prelude {
    pub use crate::builder::{BuildConfig, BuildSummary, EncodingPlan, IndexBuilder};
    pub use crate::index::{LoadConfig, TagIndex};
    pub use crate::l2::{NodeKind, ValueListNode};
    pub use crate::meta::IndexMetadata;
    pub use crate::partition::KeyPartition;
    pub use crate::reader::{GroupStatus, TagReader, TextTagReader, VecTagReader};
    pub use crate::sched::{ResourceScheduler, TaskHandle};
    pub use crate::Tag;
}
