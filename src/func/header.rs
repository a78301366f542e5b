/*
 * SPDX-FileCopyrightText: 2025 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! Fixed-size headers of shard files.
//!
//! Every shard file starts with [`HEADER_SIZE`] bytes. A header made of
//! zeroes is the sentinel of an empty shard (a key-space group without
//! keys); since the magic cookie is not zero, no actual shard can have such
//! a header.
//!
//! The layout is little-endian:
//!
//! | Offset | Size | Field            |
//! |-------:|-----:|------------------|
//! |      0 |    4 | magic (`TGMS`)   |
//! |      4 |    2 | version          |
//! |      6 |    1 | value bits       |
//! |      7 |    1 | signature bits   |
//! |      8 |    8 | number of keys   |
//! |     16 |    8 | MPHF bytes       |
//! |     24 |    8 | signature seed   |

use std::io::Read;

pub const HEADER_SIZE: usize = 32;
const MAGIC: [u8; 4] = *b"TGMS";
const VERSION: u16 = 1;

/// Errors in the format of a shard file.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum FormatError {
    #[error("Bad magic cookie {0:02x?}")]
    /// The header does not start with the expected magic cookie.
    BadMagic([u8; 4]),
    #[error("Unsupported shard version {0}")]
    /// The header has been written by an unknown version.
    UnsupportedVersion(u16),
    #[error("Invalid widths: {value_bits} value bits, {signature_bits} signature bits")]
    /// The bit widths of values or signatures are larger than 64.
    InvalidWidth { value_bits: u8, signature_bits: u8 },
    #[error("Empty shard")]
    /// The header describes a shard without keys.
    NoKeys,
    #[error("Truncated shard: expected {expected} bytes, found {actual}")]
    /// A section of the payload is shorter than its size in the header.
    Truncated { expected: u64, actual: u64 },
}

/// The header of a non-empty shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardHeader {
    pub num_keys: u64,
    pub value_bits: u8,
    pub signature_bits: u8,
    pub mphf_bytes: u64,
    pub signature_seed: u64,
}

impl ShardHeader {
    /// The bytes of the sentinel header of an empty shard.
    pub const EMPTY: [u8; HEADER_SIZE] = [0; HEADER_SIZE];

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0; HEADER_SIZE];
        buf[0..4].copy_from_slice(&MAGIC);
        buf[4..6].copy_from_slice(&VERSION.to_le_bytes());
        buf[6] = self.value_bits;
        buf[7] = self.signature_bits;
        buf[8..16].copy_from_slice(&self.num_keys.to_le_bytes());
        buf[16..24].copy_from_slice(&self.mphf_bytes.to_le_bytes());
        buf[24..32].copy_from_slice(&self.signature_seed.to_le_bytes());
        buf
    }

    /// Parses a header, returning `None` for the empty-shard sentinel.
    pub fn parse(buf: &[u8; HEADER_SIZE]) -> Result<Option<Self>, FormatError> {
        if *buf == Self::EMPTY {
            return Ok(None);
        }
        let mut word = [0; 8];
        let magic = [buf[0], buf[1], buf[2], buf[3]];
        if magic != MAGIC {
            return Err(FormatError::BadMagic(magic));
        }
        let version = u16::from_le_bytes([buf[4], buf[5]]);
        if version != VERSION {
            return Err(FormatError::UnsupportedVersion(version));
        }
        let (value_bits, signature_bits) = (buf[6], buf[7]);
        if value_bits > 64 || signature_bits > 64 {
            return Err(FormatError::InvalidWidth {
                value_bits,
                signature_bits,
            });
        }
        word.copy_from_slice(&buf[8..16]);
        let num_keys = u64::from_le_bytes(word);
        if num_keys == 0 {
            return Err(FormatError::NoKeys);
        }
        word.copy_from_slice(&buf[16..24]);
        let mphf_bytes = u64::from_le_bytes(word);
        word.copy_from_slice(&buf[24..32]);
        let signature_seed = u64::from_le_bytes(word);
        Ok(Some(Self {
            num_keys,
            value_bits,
            signature_bits,
            mphf_bytes,
            signature_seed,
        }))
    }

    /// Reads and parses a header.
    ///
    /// A truncated header is an I/O error.
    pub fn read(reader: &mut impl Read) -> anyhow::Result<Option<Self>> {
        let mut buf = [0; HEADER_SIZE];
        reader.read_exact(&mut buf)?;
        Ok(Self::parse(&buf)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> ShardHeader {
        ShardHeader {
            num_keys: 1000,
            value_bits: 9,
            signature_bits: 16,
            mphf_bytes: 4321,
            signature_seed: 0xdead_beef,
        }
    }

    #[test]
    fn test_parse() {
        let bytes = header().to_bytes();
        assert_eq!(ShardHeader::parse(&bytes), Ok(Some(header())));
        assert_eq!(ShardHeader::parse(&ShardHeader::EMPTY), Ok(None));
    }

    #[test]
    fn test_malformed() {
        let mut bytes = header().to_bytes();
        bytes[0] = b'X';
        assert!(matches!(
            ShardHeader::parse(&bytes),
            Err(FormatError::BadMagic(_))
        ));

        let mut bytes = header().to_bytes();
        bytes[4] = 7;
        assert_eq!(
            ShardHeader::parse(&bytes),
            Err(FormatError::UnsupportedVersion(7))
        );

        let mut bytes = header().to_bytes();
        bytes[7] = 65;
        assert!(matches!(
            ShardHeader::parse(&bytes),
            Err(FormatError::InvalidWidth { .. })
        ));

        let mut bytes = ShardHeader::EMPTY;
        bytes[31] = 1;
        assert!(ShardHeader::parse(&bytes).is_err());
    }

    #[test]
    fn test_truncated() {
        let bytes = header().to_bytes();
        assert!(ShardHeader::read(&mut &bytes[..20]).is_err());
    }
}
