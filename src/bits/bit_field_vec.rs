/*
 * SPDX-FileCopyrightText: 2023 Inria
 * SPDX-FileCopyrightText: 2023 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

/*!

Vectors of values of fixed bit width.

Elements are stored contiguously in 64-bit words, with no padding bits (in
particular, unless the bit width is a power of two some elements will be
stored across word boundaries). The bit width can be any value between zero
and 64; a vector of bit width zero occupies a single word regardless of its
length and returns zero for every index.

These vectors hold the value columns of [static shards](crate::func) and
the packed payload tables of [short value lists](crate::l2::ShortValueList).
They are serialized with [ε-serde](epserde); since a deserialized
vector comes from an untrusted stream, [`BitFieldVec::deserialize_checked`]
verifies that its parts are consistent before returning it.

*/

use anyhow::{ensure, Context, Result};
use epserde::prelude::*;
use mem_dbg::*;
use std::io::Read;

macro_rules! panic_if_out_of_bounds {
    ($index: expr, $len: expr) => {
        if $index >= $len {
            panic!("Index out of bounds: {} >= {}", $index, $len)
        }
    };
}

macro_rules! panic_if_value {
    ($value: expr, $mask: expr, $bit_width: expr) => {
        if $value & $mask != $value {
            panic!("Value {} does not fit in {} bits", $value, $bit_width);
        }
    };
}

/// A vector of bit fields of fixed width.
#[derive(Epserde, Debug, Clone, PartialEq, Eq, Hash, MemDbg, MemSize)]
pub struct BitFieldVec {
    /// The underlying storage.
    data: Vec<u64>,
    /// The bit width of the values stored in the vector.
    bit_width: usize,
    /// A mask with its lowest `bit_width` bits set to one.
    mask: u64,
    /// The length of the vector.
    len: usize,
}

fn mask(bit_width: usize) -> u64 {
    if bit_width == 0 {
        0
    } else {
        u64::MAX >> (64 - bit_width)
    }
}

/// Returns the number of words backing `len` values of width `bit_width`,
/// or `None` if the number of bits overflows.
#[inline(always)]
fn words_for(bit_width: usize, len: usize) -> Option<usize> {
    // We need at least one word to handle the case of bit width zero.
    Some(Ord::max(1, len.checked_mul(bit_width)?.div_ceil(64)))
}

fn words_or_panic(bit_width: usize, len: usize) -> usize {
    words_for(bit_width, len)
        .unwrap_or_else(|| panic!("{} values of width {} overflow", len, bit_width))
}

/// Returns the number of bits necessary to represent `max_value`.
///
/// Zero needs zero bits.
#[inline(always)]
pub fn bit_width_for(max_value: u64) -> usize {
    (u64::BITS - max_value.leading_zeros()) as usize
}

impl BitFieldVec {
    /// Creates a new zero-initialized vector of given bit width and length.
    pub fn new(bit_width: usize, len: usize) -> Self {
        assert!(bit_width <= 64, "Bit width {} is larger than 64", bit_width);
        Self {
            data: vec![0; words_or_panic(bit_width, len)],
            bit_width,
            mask: mask(bit_width),
            len,
        }
    }

    /// Creates an empty vector that doesn't need to reallocate for up to
    /// `capacity` elements.
    pub fn with_capacity(bit_width: usize, capacity: usize) -> Self {
        assert!(bit_width <= 64, "Bit width {} is larger than 64", bit_width);
        let mut data = Vec::with_capacity(words_or_panic(bit_width, capacity));
        data.push(0);
        Self {
            data,
            bit_width,
            mask: mask(bit_width),
            len: 0,
        }
    }

    /// Rebuilds a vector from its raw parts, checking that `data` contains
    /// exactly the expected number of words.
    pub fn from_raw_parts(data: Vec<u64>, bit_width: usize, len: usize) -> Result<Self> {
        ensure!(bit_width <= 64, "Bit width {} is larger than 64", bit_width);
        let words = words_for(bit_width, len)
            .with_context(|| format!("{} values of width {} overflow", len, bit_width))?;
        ensure!(
            data.len() == words,
            "Expected {} words for {} values of width {}, found {}",
            words,
            len,
            bit_width,
            data.len()
        );
        Ok(Self {
            data,
            bit_width,
            mask: mask(bit_width),
            len,
        })
    }

    /// Returns the bit width of the values inside this vector.
    pub fn bit_width(&self) -> usize {
        self.bit_width
    }

    /// Returns the mask used to extract values from this vector.
    /// This will keep the lowest `bit_width` bits.
    pub fn mask(&self) -> u64 {
        self.mask
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns the backing words.
    pub fn as_words(&self) -> &[u64] {
        &self.data
    }

    /// Adds a value at the end of the vector.
    pub fn push(&mut self, value: u64) {
        panic_if_value!(value, self.mask, self.bit_width);
        if (self.len + 1) * self.bit_width > self.data.len() * 64 {
            self.data.push(0);
        }
        self.set_unchecked(self.len, value);
        self.len += 1;
    }

    /// Returns the value at the given index.
    ///
    /// # Panics
    ///
    /// Panics if the index is out of bounds.
    #[inline]
    pub fn get(&self, index: usize) -> u64 {
        panic_if_out_of_bounds!(index, self.len);
        self.get_unchecked(index)
    }

    /// Sets the element at the specified index.
    ///
    /// # Panics
    ///
    /// Panics if the index is out of bounds or the value does not fit in
    /// [`bit_width`](BitFieldVec::bit_width) bits.
    #[inline]
    pub fn set(&mut self, index: usize, value: u64) {
        panic_if_out_of_bounds!(index, self.len);
        panic_if_value!(value, self.mask, self.bit_width);
        self.set_unchecked(index, value);
    }

    #[inline(always)]
    fn get_unchecked(&self, index: usize) -> u64 {
        let pos = index * self.bit_width;
        let word_index = pos / 64;
        let bit_index = pos % 64;

        if bit_index + self.bit_width <= 64 {
            (self.data[word_index] >> bit_index) & self.mask
        } else {
            (self.data[word_index] >> bit_index | self.data[word_index + 1] << (64 - bit_index))
                & self.mask
        }
    }

    #[inline(always)]
    fn set_unchecked(&mut self, index: usize, value: u64) {
        let pos = index * self.bit_width;
        let word_index = pos / 64;
        let bit_index = pos % 64;

        if bit_index + self.bit_width <= 64 {
            let mut word = self.data[word_index];
            word &= !(self.mask << bit_index);
            word |= value << bit_index;
            self.data[word_index] = word;
        } else {
            let mut word = self.data[word_index];
            word &= (1 << bit_index) - 1;
            word |= value << bit_index;
            self.data[word_index] = word;

            let mut word = self.data[word_index + 1];
            word &= !(self.mask >> (64 - bit_index));
            word |= value >> (64 - bit_index);
            self.data[word_index + 1] = word;
        }
    }

    /// Returns an iterator over the values of the vector.
    pub fn iter(&self) -> impl ExactSizeIterator<Item = u64> + '_ {
        (0..self.len).map(move |i| self.get_unchecked(i))
    }

    /// Deserializes a vector with [ε-serde](epserde) and checks that its
    /// width, mask, length and backing words agree.
    pub fn deserialize_checked(reader: &mut impl Read) -> Result<Self> {
        let v = Self::deserialize_full(reader)?;
        let stored_mask = v.mask;
        let v = Self::from_raw_parts(v.data, v.bit_width, v.len)?;
        ensure!(v.mask == stored_mask, "Corrupted mask {:#x}", stored_mask);
        Ok(v)
    }
}

impl core::iter::Extend<u64> for BitFieldVec {
    fn extend<T: IntoIterator<Item = u64>>(&mut self, iter: T) {
        for value in iter {
            self.push(value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_get_across_words() {
        for bit_width in [0, 1, 3, 7, 13, 31, 33, 63, 64] {
            let mut v = BitFieldVec::with_capacity(bit_width, 10);
            let m = mask(bit_width);
            for i in 0..200_u64 {
                v.push(i.wrapping_mul(0x9E37_79B9_7F4A_7C15) & m);
            }
            assert_eq!(v.len(), 200);
            for i in 0..200_u64 {
                assert_eq!(v.get(i as usize), i.wrapping_mul(0x9E37_79B9_7F4A_7C15) & m);
            }
        }
    }

    #[test]
    fn test_set_preserves_neighbours() {
        let mut v = BitFieldVec::new(5, 40);
        for i in 0..40 {
            v.set(i, (i % 32) as u64);
        }
        v.set(12, 31);
        assert_eq!(v.get(11), 11);
        assert_eq!(v.get(12), 31);
        assert_eq!(v.get(13), 13);
    }

    #[test]
    fn test_epserde() -> Result<()> {
        use epserde::utils::AlignedCursor;
        let mut v = BitFieldVec::with_capacity(11, 0);
        v.extend((0..1000).map(|x| x % 2048));
        let mut cursor = <AlignedCursor<maligned::A16>>::new();
        v.serialize(&mut cursor)?;
        cursor.set_position(0);
        let w = BitFieldVec::deserialize_checked(&mut cursor)?;
        assert_eq!(v, w);
        Ok(())
    }

    #[test]
    fn test_inconsistent_parts() {
        // The number of bits overflows
        assert!(BitFieldVec::from_raw_parts(vec![0], 64, usize::MAX).is_err());
        assert!(BitFieldVec::from_raw_parts(vec![0], 65, 1).is_err());
        assert!(BitFieldVec::from_raw_parts(vec![0; 2], 11, 5).is_err());
        assert!(BitFieldVec::from_raw_parts(vec![0; 2], 11, 10).is_ok());
    }

    #[test]
    fn test_truncated_stream() -> Result<()> {
        let v = BitFieldVec::new(7, 100);
        let mut buffer = Vec::new();
        v.serialize(&mut buffer)?;
        assert!(BitFieldVec::deserialize_checked(&mut &buffer[..buffer.len() - 8]).is_err());
        Ok(())
    }

    #[test]
    fn test_mem_size() {
        let v = BitFieldVec::new(11, 1000);
        assert_eq!(v.as_words().len(), 172);
        assert!(v.mem_size(SizeFlags::default()) >= 172 * 8);
    }

    #[test]
    fn test_bit_width_for() {
        assert_eq!(bit_width_for(0), 0);
        assert_eq!(bit_width_for(1), 1);
        assert_eq!(bit_width_for(255), 8);
        assert_eq!(bit_width_for(256), 9);
        assert_eq!(bit_width_for(u64::MAX), 64);
    }

    #[test]
    #[should_panic]
    fn test_value_too_large() {
        let mut v = BitFieldVec::new(4, 1);
        v.set(0, 16);
    }
}
