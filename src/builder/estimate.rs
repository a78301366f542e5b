/*
 * SPDX-FileCopyrightText: 2025 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! Estimation of the shape of an index from a sample of its input.

use crate::l2::codec::{bitmap_len, delta_encoded_len};
use crate::partition::MAX_SPLIT_BITS;
use crate::reader::TagReader;
use crate::Tag;
use anyhow::Result;
use dsi_progress_logger::ProgressLog;
use itertools::Itertools;

/// The outcome of the estimation pass.
///
/// Besides the (extrapolated) histograms, a plan maps each delta-encoded
/// length to a *length group*: lengths are walked in increasing order, and
/// a new group is started whenever the estimated volume (keys times
/// length) of the current group would exceed the node capacity. All lists
/// of a group are stored in rows as wide as the largest length of the
/// group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodingPlan {
    /// The number of samples.
    pub sample_count: u32,
    /// The largest cardinality of lists stored as short lists.
    pub short_list_limit: usize,
    /// The number of pairs in the sample.
    pub sampled: u64,
    /// Whether the sample is a proper prefix of the input.
    pub truncated: bool,
    /// The estimated number of pairs of the input.
    pub estimated_keys: u64,
    /// The estimated number of lists of each cardinality up to
    /// [`short_list_limit`](EncodingPlan::short_list_limit).
    pub cardinality_histogram: Vec<u64>,
    /// The estimated number of longer lists with each delta-encoded length,
    /// clamped to the bitmap length.
    pub length_histogram: Vec<u64>,
    /// The length group of each length up to the bitmap length.
    pub length_to_group: Vec<usize>,
    /// The row width of each length group.
    pub group_widths: Vec<usize>,
}

impl EncodingPlan {
    /// Returns the length group of a delta-encoded length.
    pub fn group_of(&self, len: usize) -> usize {
        self.length_to_group
            .get(len)
            .copied()
            .unwrap_or(self.group_widths.len().saturating_sub(1))
    }

    /// Returns the row width of a length group.
    pub fn group_width(&self, group: usize) -> usize {
        self.group_widths[group]
    }

    /// Returns the number of split bits yielding groups of about
    /// `keys_per_group` keys, given that keys have `key_bits` bits.
    pub fn split_bits(&self, keys_per_group: u64, key_bits: u32) -> u32 {
        let groups = self.estimated_keys.div_ceil(keys_per_group.max(1));
        let bits = groups.next_power_of_two().ilog2();
        bits.min(key_bits).min(MAX_SPLIT_BITS)
    }
}

/// Samples up to `sample_limit` pairs from `reader` and computes an
/// [`EncodingPlan`] for nodes of capacity `l2_limit`; the reader is reset
/// afterwards.
pub fn estimate_parameters(
    reader: &mut impl TagReader,
    short_list_limit: usize,
    sample_limit: usize,
    l2_limit: u64,
    pl: &mut impl ProgressLog,
) -> Result<EncodingPlan> {
    let sample_count = reader.sample_count();
    let bitmap_len = bitmap_len(sample_count);
    let mut cardinality_histogram = vec![0_u64; short_list_limit + 1];
    let mut length_histogram = vec![0_u64; bitmap_len + 1];
    let mut tags: Vec<Tag> = Vec::new();
    let mut sorted: Vec<Tag> = Vec::new();
    let mut sampled = 0_u64;

    pl.item_name("pair")
        .expected_updates(Some(sample_limit))
        .start("Sampling...");

    while (sampled as usize) < sample_limit {
        if reader.next_value_list(&mut tags)?.is_none() {
            break;
        }
        sampled += 1;
        if tags.len() <= short_list_limit {
            cardinality_histogram[tags.len()] += 1;
        } else {
            sorted.clear();
            sorted.extend(tags.iter().copied().sorted_unstable().dedup());
            let len = delta_encoded_len(&sorted).min(bitmap_len);
            length_histogram[len] += 1;
        }
        pl.light_update();
    }
    pl.done();

    let truncated =
        sampled as usize == sample_limit && reader.next_value_list(&mut tags)?.is_some();
    let mut estimated_keys = sampled;

    if truncated {
        let (current, total) = reader
            .group_status()
            .iter()
            .fold((0_u64, 0_u64), |(c, t), s| (c + s.current, t + s.total));
        if current > 0 && total > current {
            let rate = total as f64 / current as f64;
            pl.info(format_args!(
                "Sample is {:.2}% of the input; scaling histograms by {:.3}",
                100.0 / rate,
                rate
            ));
            for x in cardinality_histogram
                .iter_mut()
                .chain(length_histogram.iter_mut())
            {
                *x = (*x as f64 * rate) as u64;
            }
            estimated_keys = (sampled as f64 * rate) as u64;
        }
    }

    let mut length_to_group = vec![0; bitmap_len + 1];
    let mut group_widths = vec![0];
    let mut sq = 0_u64;
    for len in 1..=bitmap_len {
        let count = length_histogram[len];
        if (sq + count) * len as u64 > l2_limit {
            sq = 0;
            group_widths.push(0);
        }
        sq += count;
        let group = group_widths.len() - 1;
        length_to_group[len] = group;
        group_widths[group] = len;
    }
    // Rows of length zero never occur, but they must map to a valid group
    group_widths[0] = group_widths[0].max(1);

    pl.info(format_args!(
        "Estimated {} keys; {} length groups with widths {:?}",
        estimated_keys,
        group_widths.len(),
        group_widths
    ));
    log::debug!("Length histogram: {:?}", length_histogram);

    reader.reset()?;

    Ok(EncodingPlan {
        sample_count,
        short_list_limit,
        sampled,
        truncated,
        estimated_keys,
        cardinality_histogram,
        length_histogram,
        length_to_group,
        group_widths,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::VecTagReader;
    use dsi_progress_logger::no_logging;

    #[test]
    fn test_histograms() -> Result<()> {
        // Sample count 100: 7 bits per tag, 9 tags per short list, 13-byte
        // bitmaps
        let mut pairs = Vec::new();
        for key in 0..10 {
            pairs.push((key, vec![1]));
        }
        for key in 10..15 {
            pairs.push((key, vec![1, 2, 3]));
        }
        for key in 15..18 {
            pairs.push((key, (0..10).collect()));
        }
        for key in 18..20 {
            pairs.push((key, (0..100).collect()));
        }
        let mut reader = VecTagReader::new(31, 100, pairs);
        let plan = estimate_parameters(&mut reader, 9, 1000, 1 << 20, no_logging![])?;

        assert!(!plan.truncated);
        assert_eq!(plan.estimated_keys, 20);
        assert_eq!(plan.cardinality_histogram[1], 10);
        assert_eq!(plan.cardinality_histogram[3], 5);
        assert_eq!(plan.length_histogram[10], 3);
        assert_eq!(plan.length_histogram[13], 2);
        assert_eq!(plan.group_widths, vec![13]);
        assert_eq!(plan.group_of(10), 0);

        // The reader has been reset
        assert_eq!(reader.next_value_list(&mut Vec::new())?, Some(0));
        Ok(())
    }

    #[test]
    fn test_length_groups() -> Result<()> {
        let pairs = (0..30_u64)
            .map(|key| (key, (0..(10 + key as u32 % 3)).collect::<Vec<_>>()))
            .collect();
        let mut reader = VecTagReader::new(31, 1000, pairs);
        // Ten lists of each length 10, 11, 12: with capacity 150 every
        // length needs its own group
        let plan = estimate_parameters(&mut reader, 4, 1000, 150, no_logging![])?;
        assert_eq!(plan.length_histogram[10..13], [10, 10, 10]);
        let groups = [plan.group_of(10), plan.group_of(11), plan.group_of(12)];
        assert!(groups[0] < groups[1] && groups[1] < groups[2]);
        assert_eq!(plan.group_width(plan.group_of(11)), 11);
        Ok(())
    }

    #[test]
    fn test_extrapolation() -> Result<()> {
        let pairs = (0..100_u64).map(|key| (key, vec![0, 1])).collect();
        let mut reader = VecTagReader::new(31, 16, pairs);
        let plan = estimate_parameters(&mut reader, 16, 25, 1 << 20, no_logging![])?;
        assert!(plan.truncated);
        // 26 pairs have been read when the status is queried
        assert_eq!(plan.estimated_keys, (25.0 * 100.0 / 26.0) as u64);
        assert_eq!(plan.sampled, 25);
        Ok(())
    }

    #[test]
    fn test_split_bits() {
        let mut plan = EncodingPlan {
            sample_count: 10,
            short_list_limit: 16,
            sampled: 0,
            truncated: false,
            estimated_keys: 0,
            cardinality_histogram: vec![],
            length_histogram: vec![],
            length_to_group: vec![0],
            group_widths: vec![1],
        };
        assert_eq!(plan.split_bits(1000, 62), 0);
        plan.estimated_keys = 1000;
        assert_eq!(plan.split_bits(1000, 62), 0);
        plan.estimated_keys = 1001;
        assert_eq!(plan.split_bits(1000, 62), 1);
        plan.estimated_keys = 5000;
        assert_eq!(plan.split_bits(1000, 62), 3);
        assert_eq!(plan.split_bits(1000, 2), 2);
        plan.estimated_keys = u64::MAX / 2;
        assert_eq!(plan.split_bits(1, 62), MAX_SPLIT_BITS);
    }
}
