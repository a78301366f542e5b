/*
 * SPDX-FileCopyrightText: 2025 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

use derivative::Derivative;
use derive_setters::*;

/// Parameters of an [`IndexBuilder`](super::IndexBuilder).
///
/// The defaults are tuned for indices with billions of keys and thousands
/// of samples; for small indices they simply yield a single node per
/// encoding bucket.
///
/// ```rust
/// use tagmap::builder::BuildConfig;
///
/// let config = BuildConfig::default().threads(4).split_bits(2);
/// ```
#[derive(Setters, Debug, Clone, Derivative)]
#[derivative(Default)]
#[setters(generate = false)]
pub struct BuildConfig {
    /// The maximum number of parallel threads to use. The default is 8.
    #[setters(generate = true)]
    #[derivative(Default(value = "8"))]
    pub(crate) threads: usize,

    /// The capacity of a value-list node, as keys times per-key cost. When
    /// adding a key to the active node of a bucket would exceed this
    /// value, a new node is allocated. The default is 100 Mi.
    #[setters(generate = true)]
    #[derivative(Default(value = "104_857_600"))]
    pub(crate) l2_limit: u64,

    /// A wave of L2 node constructions is closed when its number of keys
    /// exceeds this value. The default is 384 Mi.
    #[setters(generate = true)]
    #[derivative(Default(value = "384 << 20"))]
    pub(crate) l2_queue_key_limit: u64,

    /// A wave of L2 node constructions is closed when its number of values
    /// exceeds this value. The default is 32 Gi.
    #[setters(generate = true)]
    #[derivative(Default(value = "32 << 30"))]
    pub(crate) l2_queue_value_limit: u64,

    /// A wave of L1 group constructions is closed when its number of keys
    /// exceeds this value. The default is 384 Mi.
    #[setters(generate = true)]
    #[derivative(Default(value = "384 << 20"))]
    pub(crate) l1_queue_key_limit: u64,

    /// The maximum number of pairs sampled to estimate parameters. The
    /// default is 16 Mi.
    #[setters(generate = true)]
    #[derivative(Default(value = "16 << 20"))]
    pub(crate) sample_limit: usize,

    /// The number of bits used to split the key space into L1 groups. If
    /// not set, it is derived from the estimated number of keys so that
    /// each group contains about [`keys_per_group`](BuildConfig::keys_per_group)
    /// keys.
    #[setters(generate = true, strip_option)]
    pub(crate) split_bits: Option<u32>,

    /// The target number of keys of an L1 group. The default is 4 Mi.
    #[setters(generate = true)]
    #[derivative(Default(value = "4 << 20"))]
    pub(crate) keys_per_group: u64,

    /// The largest cardinality of lists stored as short lists. It cannot
    /// exceed `64 / tag_bits`, which is also the default.
    #[setters(generate = true, strip_option)]
    pub(crate) short_list_limit: Option<usize>,

    /// The number of bits of the signatures stored by L1 shards. Larger
    /// values make queries on keys that are not in the index return an
    /// empty list with higher probability. The default is 16.
    #[setters(generate = true)]
    #[derivative(Default(value = "16"))]
    pub(crate) signature_bits: usize,

    /// Check for duplicate keys. Duplicate keys make the construction of
    /// minimal perfect hash functions fail, so we suggest to disable this
    /// check only when keys are guaranteed to be distinct. The default is
    /// true.
    #[setters(generate = true)]
    #[derivative(Default(value = "true"))]
    pub(crate) check_dups: bool,
}
