/*
 * SPDX-FileCopyrightText: 2025 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! Encodings of tag lists.
//!
//! There are three encodings, matching the three kinds of
//! [value-list nodes](super::ValueListNode):
//!
//! - *short lists* pack `c` tags of [`tag_bits`] bits each into a single
//!   integer of `c · tag_bits ≤ 64` bits, tag `i` at bit offset `i ·
//!   tag_bits`;
//! - *delta lists* store the first tag and then the gaps between
//!   consecutive tags of a strictly increasing list using a VByte code in
//!   which the length of each code is written in unary in the first byte;
//!   since the unary marker is always present, a zero byte never starts a
//!   code, and rows can be zero-padded to a fixed width;
//! - *bitmaps* set bit `t % 8` of byte `t / 8` for each tag `t`.

use crate::Tag;

/// Returns the number of bits used to represent a tag in a short list: the
/// smallest `b ≥ 1` such that `2^b ≥ sample_count`.
pub fn tag_bits(sample_count: u32) -> u32 {
    let mut bits = 1;
    while (1_u64 << bits) < sample_count as u64 {
        bits += 1;
    }
    bits
}

/// Returns the largest cardinality of a list that can be stored as a short
/// list.
pub fn short_list_limit(sample_count: u32) -> usize {
    (64 / tag_bits(sample_count)) as usize
}

/// Returns the length in bytes of a bitmap over `sample_count` tags.
pub fn bitmap_len(sample_count: u32) -> usize {
    (sample_count as usize).div_ceil(8)
}

/// Compute the length in bytes of value encoded as VByte
#[inline(always)]
fn encode_int_len(value: u32) -> usize {
    let mut value = value as u64;
    let mut len = 1;
    let mut max = 1_u64 << 7;
    while value >= max {
        len += 1;
        value -= max;
        max <<= 7;
    }
    len
}

/// VByte encode an integer
#[inline(always)]
fn encode_int(value: u32, data: &mut Vec<u8>) {
    let mut value = value as u64;
    let mut len = 1_usize;
    let mut max = 1_u64 << 7;
    while value >= max {
        value -= max;
        max <<= 7;
        len += 1;
    }
    let bits_in_first = 8 - len;
    // write len - 1 in unary at the start
    let mut first = 1_u8 << bits_in_first;
    // write the lowest bits of the value
    let mask = first.saturating_sub(1);
    first |= value as u8 & mask;
    data.push(first);
    // remove the written bits
    value >>= bits_in_first;
    for _ in 0..len.saturating_sub(1) {
        data.push(value as u8);
        value >>= 8;
    }
}

/// Decodes a VByte integer, returning `None` on a padding byte or if the
/// code is truncated.
#[inline(always)]
fn decode_int(data: &[u8]) -> Option<(u32, &[u8])> {
    let first = *data.first()?;
    if first == 0 {
        return None;
    }
    let len = first.leading_zeros() as usize + 1;
    if len > data.len() {
        return None;
    }
    let mut base = 0_u32;
    // get the non-unary code bits
    let mut res = (first & (0xff >> len)) as u32;
    let mut shift = 8 - len;
    for value in &data[1..len] {
        base <<= 7;
        base += 1 << 7;
        res |= (*value as u32) << shift;
        shift += 8;
    }
    Some((res + base, &data[len..]))
}

/// Returns the length in bytes of the delta encoding of a strictly
/// increasing list of tags.
pub fn delta_encoded_len(tags: &[Tag]) -> usize {
    let mut prev = 0;
    tags.iter()
        .enumerate()
        .map(|(i, &tag)| {
            let gap = if i == 0 { tag } else { tag - prev };
            prev = tag;
            encode_int_len(gap)
        })
        .sum()
}

/// Appends the delta encoding of a strictly increasing list of tags to
/// `out`.
pub fn encode_deltas(tags: &[Tag], out: &mut Vec<u8>) {
    let mut prev = 0;
    for (i, &tag) in tags.iter().enumerate() {
        debug_assert!(i == 0 || tag > prev, "Tags are not strictly increasing");
        encode_int(if i == 0 { tag } else { tag - prev }, out);
        prev = tag;
    }
}

/// Decodes a possibly zero-padded delta-encoded row, appending the tags to
/// `out`.
pub fn decode_deltas(mut row: &[u8], out: &mut Vec<Tag>) {
    let mut acc = 0;
    let mut first = true;
    while let Some((gap, rest)) = decode_int(row) {
        acc = if first { gap } else { acc + gap };
        first = false;
        out.push(acc);
        row = rest;
    }
}

/// Appends a bitmap of `len` bytes with the bits of `tags` set to `out`.
pub fn encode_bitmap(tags: &[Tag], len: usize, out: &mut Vec<u8>) {
    let start = out.len();
    out.resize(start + len, 0);
    for &tag in tags {
        out[start + tag as usize / 8] |= 1 << (tag % 8);
    }
}

/// Appends the positions of the set bits of `row` to `out`, in increasing
/// order.
pub fn decode_bitmap(row: &[u8], out: &mut Vec<Tag>) {
    for (i, &byte) in row.iter().enumerate() {
        let mut byte = byte;
        while byte != 0 {
            out.push(i as Tag * 8 + byte.trailing_zeros());
            byte &= byte - 1;
        }
    }
}

/// Packs a short list of tags into a single integer.
pub fn pack_short(tags: &[Tag], tag_bits: u32) -> u64 {
    debug_assert!(tags.len() as u32 * tag_bits <= 64);
    tags.iter()
        .enumerate()
        .fold(0, |code, (i, &tag)| code | (tag as u64) << (i as u32 * tag_bits))
}

/// Unpacks `cardinality` tags from a short-list code, appending them to
/// `out`.
pub fn unpack_short(code: u64, cardinality: usize, tag_bits: u32, out: &mut Vec<Tag>) {
    let mask = (1_u64 << tag_bits) - 1;
    for i in 0..cardinality as u32 {
        out.push(((code >> (i * tag_bits)) & mask) as Tag);
    }
}
