/*
 * SPDX-FileCopyrightText: 2025 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! Static functions on 64-bit keys.
//!
//! A [`StaticShard`] maps a fixed set of keys to small integer values. Shards
//! are stored in gzip-compressed files made of a fixed-size
//! [header](ShardHeader) followed by a payload; the helpers [`create_gz`] and
//! [`open_gz`] open such files.

pub mod header;
pub use header::*;

pub mod mphf;

mod shard;
pub use shard::*;

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

/// Creates a gzip-compressed file.
///
/// The stream must be closed with [`GzEncoder::finish`] to detect errors.
pub fn create_gz(path: impl AsRef<Path>) -> Result<GzEncoder<BufWriter<File>>> {
    let path = path.as_ref();
    let file =
        File::create(path).with_context(|| format!("Could not create {}", path.display()))?;
    Ok(GzEncoder::new(BufWriter::new(file), Compression::default()))
}

/// Opens a gzip-compressed file.
pub fn open_gz(path: impl AsRef<Path>) -> Result<GzDecoder<BufReader<File>>> {
    let path = path.as_ref();
    let file = File::open(path).with_context(|| format!("Could not open {}", path.display()))?;
    Ok(GzDecoder::new(BufReader::new(file)))
}
