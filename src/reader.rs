/*
 * SPDX-FileCopyrightText: 2025 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

/*!

Sources of (key, tag list) pairs.

An [`IndexBuilder`](crate::builder::IndexBuilder) consumes a [`TagReader`],
which streams pairs in a single pass, can be [reset](TagReader::reset) to
perform a second pass, and reports its progress through
[`TagReader::group_status`].

We provide an in-memory [`VecTagReader`] and a [`TextTagReader`] reading
text files, possibly compressed with gzip or Zstandard, in which each
line contains a key (decimal, or hexadecimal with a `0x` prefix) followed
by whitespace and a comma-separated list of tags, as in

```text
0x1f3a 0,4,17
12345 3
```

Empty lines and lines starting with `#` are skipped.

*/

use crate::Tag;
use anyhow::{bail, Context, Result};
use flate2::read::GzDecoder;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use zstd::stream::read::Decoder;

/// Progress counters of a group of input.
///
/// Units are reader-specific, but `current / total` is the fraction of the
/// group that has been read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GroupStatus {
    pub current: u64,
    pub total: u64,
}

/// A resettable stream of (key, tag list) pairs.
pub trait TagReader {
    /// Returns the length of the k-mers encoded by keys.
    fn kmer_length(&self) -> u32;

    /// Returns an upper bound on tags plus one (i.e., the number of
    /// samples).
    fn sample_count(&self) -> u32;

    /// Reads the next pair, storing the tags in `tags` and returning the
    /// key, or returns `None` if the stream is exhausted.
    ///
    /// `tags` is cleared before being filled.
    fn next_value_list(&mut self, tags: &mut Vec<Tag>) -> Result<Option<u64>>;

    /// Rewinds the stream to its start.
    fn reset(&mut self) -> Result<()>;

    /// Returns the progress counters of each group of input.
    fn group_status(&self) -> Vec<GroupStatus>;
}

impl<R: TagReader + ?Sized> TagReader for &mut R {
    fn kmer_length(&self) -> u32 {
        (**self).kmer_length()
    }

    fn sample_count(&self) -> u32 {
        (**self).sample_count()
    }

    fn next_value_list(&mut self, tags: &mut Vec<Tag>) -> Result<Option<u64>> {
        (**self).next_value_list(tags)
    }

    fn reset(&mut self) -> Result<()> {
        (**self).reset()
    }

    fn group_status(&self) -> Vec<GroupStatus> {
        (**self).group_status()
    }
}

/// A [`TagReader`] over pairs held in memory.
#[derive(Debug, Clone)]
pub struct VecTagReader {
    kmer_length: u32,
    sample_count: u32,
    pairs: Vec<(u64, Vec<Tag>)>,
    pos: usize,
}

impl VecTagReader {
    pub fn new(kmer_length: u32, sample_count: u32, pairs: Vec<(u64, Vec<Tag>)>) -> Self {
        Self {
            kmer_length,
            sample_count,
            pairs,
            pos: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

impl TagReader for VecTagReader {
    fn kmer_length(&self) -> u32 {
        self.kmer_length
    }

    fn sample_count(&self) -> u32 {
        self.sample_count
    }

    fn next_value_list(&mut self, tags: &mut Vec<Tag>) -> Result<Option<u64>> {
        tags.clear();
        Ok(self.pairs.get(self.pos).map(|(key, list)| {
            tags.extend_from_slice(list);
            self.pos += 1;
            *key
        }))
    }

    fn reset(&mut self) -> Result<()> {
        self.pos = 0;
        Ok(())
    }

    fn group_status(&self) -> Vec<GroupStatus> {
        vec![GroupStatus {
            current: self.pos as u64,
            total: self.pairs.len() as u64,
        }]
    }
}

/// Counts the bytes read from the underlying file.
struct CountingReader<R> {
    inner: R,
    count: Arc<AtomicU64>,
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.count.fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }
}

/// A [`TagReader`] over a text file, possibly compressed.
///
/// Files whose name ends with `.gz` are decompressed with gzip, files
/// whose name ends with `.zst` with Zstandard. Progress is measured in
/// bytes of the file on disk, so it is meaningful also for compressed
/// files.
pub struct TextTagReader {
    path: PathBuf,
    kmer_length: u32,
    sample_count: u32,
    lines: Box<dyn BufRead + Send>,
    line: String,
    line_number: usize,
    bytes_read: Arc<AtomicU64>,
    file_len: u64,
}

impl TextTagReader {
    pub fn new(path: impl AsRef<Path>, kmer_length: u32, sample_count: u32) -> Result<Self> {
        let path = path.as_ref().to_owned();
        let bytes_read = Arc::new(AtomicU64::new(0));
        let (lines, file_len) = Self::open(&path, &bytes_read)?;
        Ok(Self {
            path,
            kmer_length,
            sample_count,
            lines,
            line: String::with_capacity(128),
            line_number: 0,
            bytes_read,
            file_len,
        })
    }

    fn open(path: &Path, bytes_read: &Arc<AtomicU64>) -> Result<(Box<dyn BufRead + Send>, u64)> {
        let file =
            File::open(path).with_context(|| format!("Could not open {}", path.display()))?;
        let file_len = file.metadata()?.len();
        bytes_read.store(0, Ordering::Relaxed);
        let counted = CountingReader {
            inner: file,
            count: bytes_read.clone(),
        };
        let lines: Box<dyn BufRead + Send> = match path.extension().and_then(|e| e.to_str()) {
            Some("gz") => Box::new(BufReader::new(GzDecoder::new(counted))),
            Some("zst") => Box::new(BufReader::new(Decoder::new(counted)?)),
            _ => Box::new(BufReader::new(counted)),
        };
        Ok((lines, file_len))
    }

    fn parse_key(s: &str) -> Option<u64> {
        match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            Some(hex) => u64::from_str_radix(hex, 16).ok(),
            None => s.parse().ok(),
        }
    }
}

impl TagReader for TextTagReader {
    fn kmer_length(&self) -> u32 {
        self.kmer_length
    }

    fn sample_count(&self) -> u32 {
        self.sample_count
    }

    fn next_value_list(&mut self, tags: &mut Vec<Tag>) -> Result<Option<u64>> {
        tags.clear();
        loop {
            self.line.clear();
            if self.lines.read_line(&mut self.line)? == 0 {
                return Ok(None);
            }
            self.line_number += 1;
            let line = self.line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let mut fields = line.split_whitespace();
            let (key, list) = (fields.next(), fields.next());
            let Some(key) = key.and_then(Self::parse_key) else {
                bail!(
                    "{}:{}: invalid key in line \"{}\"",
                    self.path.display(),
                    self.line_number,
                    line
                );
            };
            for tag in list.into_iter().flat_map(|l| l.split(',')) {
                match tag.parse::<Tag>() {
                    Ok(tag) => tags.push(tag),
                    Err(_) => bail!(
                        "{}:{}: invalid tag \"{}\"",
                        self.path.display(),
                        self.line_number,
                        tag
                    ),
                }
            }
            return Ok(Some(key));
        }
    }

    fn reset(&mut self) -> Result<()> {
        let (lines, file_len) = Self::open(&self.path, &self.bytes_read)?;
        self.lines = lines;
        self.file_len = file_len;
        self.line_number = 0;
        Ok(())
    }

    fn group_status(&self) -> Vec<GroupStatus> {
        vec![GroupStatus {
            current: self.bytes_read.load(Ordering::Relaxed),
            total: self.file_len,
        }]
    }
}
