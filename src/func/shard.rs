/*
 * SPDX-FileCopyrightText: 2025 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

use super::header::{FormatError, ShardHeader};
use super::mphf::{build_mphf, read_mphf, Mphf};
use crate::bits::BitFieldVec;
use anyhow::{bail, ensure, Result};
use epserde::prelude::*;
use std::fmt;
use std::io::{Read, Write};
use xxhash_rust::xxh3;

/// The seed of the hash providing key signatures.
const SIGNATURE_SEED: u64 = 0x5851_f42d_4c95_7f2d;

/// A static function from a fixed set of 64-bit keys to values of bounded
/// bit width.
///
/// A minimal perfect hash function maps the `n` keys bijectively onto the
/// slots `[0..n)`; a [`BitFieldVec`] stores the value of each slot. If the
/// shard is built without values ([`StaticShard::index_only`]), the slot
/// itself is the value: callers then keep payloads in slot order.
///
/// Optionally, each slot stores a *signature* of `signature_bits` bits of
/// its key, as in a signed function: on a key outside the key set the
/// shard then returns zero except with probability 2<sup>-`signature_bits`</sup>.
/// Without signatures, the result on keys outside the key set is arbitrary.
pub struct StaticShard {
    mphf: Mphf,
    values: BitFieldVec,
    signatures: BitFieldVec,
    num_keys: usize,
    signature_seed: u64,
}

#[inline(always)]
fn signature(key: u64, seed: u64, mask: u64) -> u64 {
    xxh3::xxh3_64_with_seed(&key.to_le_bytes(), seed) & mask
}

impl StaticShard {
    /// Builds a shard mapping `keys[i]` to `values[i]`.
    ///
    /// Keys must be distinct, and values must fit in `value_bits` bits.
    pub fn with_values(
        keys: &[u64],
        values: &[u64],
        value_bits: usize,
        signature_bits: usize,
    ) -> Result<Self> {
        ensure!(
            keys.len() == values.len(),
            "{} keys but {} values",
            keys.len(),
            values.len()
        );
        Self::build(keys, Some((values, value_bits)), signature_bits)
    }

    /// Builds a shard without stored values: [`StaticShard::slot`] returns
    /// the position of each key in `[0..keys.len())`.
    pub fn index_only(keys: &[u64], signature_bits: usize) -> Result<Self> {
        Self::build(keys, None, signature_bits)
    }

    fn build(
        keys: &[u64],
        values: Option<(&[u64], usize)>,
        signature_bits: usize,
    ) -> Result<Self> {
        ensure!(!keys.is_empty(), "Cannot build a shard without keys");
        ensure!(
            signature_bits <= 64,
            "Signature width {} is larger than 64",
            signature_bits
        );
        let num_keys = keys.len();
        let mphf = build_mphf(keys);

        let value_bits = values.map_or(0, |(_, bits)| bits);
        let mut vals = BitFieldVec::new(value_bits, if values.is_some() { num_keys } else { 0 });
        let mut signatures =
            BitFieldVec::new(signature_bits, if signature_bits > 0 { num_keys } else { 0 });
        let value_mask = vals.mask();
        let signature_mask = signatures.mask();

        for (i, &key) in keys.iter().enumerate() {
            let slot = mphf.get(&key);
            if slot >= num_keys {
                bail!("Key {:#x} mapped to slot {} of {}", key, slot, num_keys);
            }
            if let Some((values, _)) = values {
                let value = values[i];
                ensure!(
                    value & value_mask == value,
                    "Value {} does not fit in {} bits",
                    value,
                    value_bits
                );
                vals.set(slot, value);
            }
            if signature_bits > 0 {
                signatures.set(slot, signature(key, SIGNATURE_SEED, signature_mask));
            }
        }

        Ok(Self {
            mphf,
            values: vals,
            signatures,
            num_keys,
            signature_seed: SIGNATURE_SEED,
        })
    }

    /// Returns the slot of a key, or `None` if the key is detected as not
    /// belonging to the key set.
    #[inline]
    pub fn slot(&self, key: u64) -> Option<usize> {
        let slot = self.mphf.get(&key);
        if slot >= self.num_keys {
            return None;
        }
        if self.signatures.bit_width() != 0
            && self.signatures.get(slot)
                != signature(key, self.signature_seed, self.signatures.mask())
        {
            return None;
        }
        Some(slot)
    }

    /// Returns the value associated with a key, or zero if the key is
    /// detected as not belonging to the key set.
    #[inline]
    pub fn get(&self, key: u64) -> u64 {
        match self.slot(key) {
            Some(slot) if !self.values.is_empty() => self.values.get(slot),
            Some(slot) => slot as u64,
            None => 0,
        }
    }

    pub fn len(&self) -> usize {
        self.num_keys
    }

    pub fn is_empty(&self) -> bool {
        self.num_keys == 0
    }

    fn mphf_bytes(&self) -> Result<Vec<u8>> {
        let mut buffer = Vec::with_capacity(self.mphf.write_bytes());
        self.mphf.write(&mut buffer)?;
        Ok(buffer)
    }

    fn header_for(&self, mphf_bytes: &[u8]) -> ShardHeader {
        ShardHeader {
            num_keys: self.num_keys as u64,
            value_bits: self.values.bit_width() as u8,
            signature_bits: self.signatures.bit_width() as u8,
            mphf_bytes: mphf_bytes.len() as u64,
            signature_seed: self.signature_seed,
        }
    }

    /// Returns the header of this shard; the size of the minimal perfect
    /// hash function is the number of bytes [`StaticShard::store`] writes.
    pub fn header(&self) -> Result<ShardHeader> {
        Ok(self.header_for(&self.mphf_bytes()?))
    }

    /// Writes the minimal perfect hash function, the values and the
    /// signatures, returning the header describing them.
    pub fn write_payload(&self, writer: &mut impl Write) -> Result<ShardHeader> {
        let mphf = self.mphf_bytes()?;
        writer.write_all(&mphf)?;
        self.values.serialize(writer)?;
        self.signatures.serialize(writer)?;
        Ok(self.header_for(&mphf))
    }

    /// Writes the header followed by the payload.
    pub fn store(&self, writer: &mut impl Write) -> Result<()> {
        let mphf = self.mphf_bytes()?;
        writer.write_all(&self.header_for(&mphf).to_bytes())?;
        writer.write_all(&mphf)?;
        self.values.serialize(writer)?;
        self.signatures.serialize(writer)?;
        Ok(())
    }

    /// Reads a shard written by [`StaticShard::store`], or `None` if the
    /// stream starts with the [empty-shard sentinel](ShardHeader::EMPTY).
    pub fn load(reader: &mut impl Read) -> Result<Option<Self>> {
        match ShardHeader::read(reader)? {
            None => Ok(None),
            Some(header) => Ok(Some(Self::read(&header, reader)?)),
        }
    }

    /// Reads a shard whose header has already been read.
    pub fn read(header: &ShardHeader, reader: &mut impl Read) -> Result<Self> {
        // The buffer grows with the bytes actually read
        let mut mphf_buf = Vec::new();
        reader
            .by_ref()
            .take(header.mphf_bytes)
            .read_to_end(&mut mphf_buf)?;
        if mphf_buf.len() as u64 != header.mphf_bytes {
            return Err(FormatError::Truncated {
                expected: header.mphf_bytes,
                actual: mphf_buf.len() as u64,
            }
            .into());
        }
        let mut mphf_reader = mphf_buf.as_slice();
        let mphf = read_mphf(&mut mphf_reader)?;
        ensure!(
            mphf_reader.is_empty(),
            "{} trailing bytes after the minimal perfect hash function",
            mphf_reader.len()
        );
        let values = BitFieldVec::deserialize_checked(reader)?;
        let signatures = BitFieldVec::deserialize_checked(reader)?;
        let num_keys = usize::try_from(header.num_keys)?;

        ensure!(
            values.bit_width() == header.value_bits as usize
                && signatures.bit_width() == header.signature_bits as usize,
            "Shard widths do not match its header"
        );
        ensure!(
            values.is_empty() || values.len() == num_keys,
            "Shard has {} values for {} keys",
            values.len(),
            num_keys
        );
        ensure!(
            signatures.is_empty() || signatures.len() == num_keys,
            "Shard has {} signatures for {} keys",
            signatures.len(),
            num_keys
        );

        Ok(Self {
            mphf,
            values,
            signatures,
            num_keys,
            signature_seed: header.signature_seed,
        })
    }
}

impl fmt::Debug for StaticShard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticShard")
            .field("num_keys", &self.num_keys)
            .field("value_bits", &self.values.bit_width())
            .field("signature_bits", &self.signatures.bit_width())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::super::header::HEADER_SIZE;
    use super::*;

    #[test]
    fn test_values() -> Result<()> {
        let keys = (0..10_000_u64)
            .map(|i| i.wrapping_mul(0x9E37_79B9_7F4A_7C15))
            .collect::<Vec<_>>();
        let values = (0..10_000_u64).map(|i| i % 300).collect::<Vec<_>>();
        let shard = StaticShard::with_values(&keys, &values, 9, 0)?;
        for (key, value) in keys.iter().zip(&values) {
            assert_eq!(shard.get(*key), *value);
        }
        Ok(())
    }

    #[test]
    fn test_index_only_is_a_permutation() -> Result<()> {
        let keys = (1..=1000_u64).map(|i| i << 20).collect::<Vec<_>>();
        let shard = StaticShard::index_only(&keys, 0)?;
        let mut seen = vec![false; keys.len()];
        for &key in &keys {
            let slot = shard.slot(key).unwrap();
            assert!(!seen[slot]);
            seen[slot] = true;
        }
        Ok(())
    }

    #[test]
    fn test_signatures_reject_absent_keys() -> Result<()> {
        let keys = (0..1000_u64).collect::<Vec<_>>();
        let values = vec![5; 1000];
        let shard = StaticShard::with_values(&keys, &values, 3, 32)?;
        for key in 1000..2000 {
            assert_eq!(shard.get(key), 0);
        }
        Ok(())
    }

    #[test]
    fn test_payload_round_trip() -> Result<()> {
        let keys = (0..500_u64).map(|i| i * 7 + 3).collect::<Vec<_>>();
        let values = (0..500_u64).collect::<Vec<_>>();
        let shard = StaticShard::with_values(&keys, &values, 9, 8)?;
        let mut buffer = Vec::new();
        let header = shard.write_payload(&mut buffer)?;
        assert_eq!(header, shard.header()?);
        let loaded = StaticShard::read(&header, &mut buffer.as_slice())?;
        for (key, value) in keys.iter().zip(&values) {
            assert_eq!(loaded.get(*key), *value);
        }
        Ok(())
    }

    #[test]
    fn test_header_counts_written_bytes() -> Result<()> {
        let keys = (0..500_u64).collect::<Vec<_>>();
        let shard = StaticShard::index_only(&keys, 16)?;
        let mut mphf = Vec::new();
        shard.mphf.write(&mut mphf)?;
        assert_eq!(shard.header()?.mphf_bytes, mphf.len() as u64);

        let mut buffer = Vec::new();
        shard.store(&mut buffer)?;
        assert_eq!(&buffer[HEADER_SIZE..][..mphf.len()], mphf.as_slice());
        let loaded = StaticShard::load(&mut buffer.as_slice())?.unwrap();
        for &key in &keys {
            assert_eq!(loaded.slot(key), shard.slot(key));
        }
        Ok(())
    }

    #[test]
    fn test_malformed_payload() -> Result<()> {
        let keys = (0..100_u64).collect::<Vec<_>>();
        let shard = StaticShard::with_values(&keys, &vec![1; 100], 2, 0)?;
        let mut buffer = Vec::new();
        shard.store(&mut buffer)?;
        let header = ShardHeader::parse(buffer[..HEADER_SIZE].try_into()?)?.unwrap();
        let payload = &buffer[HEADER_SIZE..];

        // A function size beyond the end of the stream
        let huge = ShardHeader {
            mphf_bytes: u64::MAX,
            ..header
        };
        let err = StaticShard::read(&huge, &mut &payload[..]).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<FormatError>(),
            Some(FormatError::Truncated { .. })
        ));

        // More keys than values
        let huge = ShardHeader {
            num_keys: u64::MAX,
            ..header
        };
        assert!(StaticShard::read(&huge, &mut &payload[..]).is_err());

        // A truncated value column
        assert!(StaticShard::read(&header, &mut &payload[..payload.len() - 16]).is_err());
        Ok(())
    }

    #[test]
    fn test_value_too_wide() {
        assert!(StaticShard::with_values(&[1, 2], &[1, 8], 3, 0).is_err());
        assert!(StaticShard::index_only(&[], 0).is_err());
    }
}
