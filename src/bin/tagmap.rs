/*
 * SPDX-FileCopyrightText: 2025 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dsi_progress_logger::*;
use std::path::PathBuf;
use tagmap::prelude::*;

#[derive(Parser, Debug)]
#[command(about = "Build and query indices mapping k-mers to lists of sample tags", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Build an index from a text file of (key, tag list) pairs.
    Build(BuildArgs),
    /// Print the tags of some keys.
    Query(QueryArgs),
}

#[derive(clap::Args, Debug)]
struct BuildArgs {
    /// The input file; each line contains a key followed by a comma-separated
    /// list of tags. Files ending in .gz or .zst are decompressed.
    input: PathBuf,
    /// The base path of the index files.
    base: PathBuf,
    /// The length of the k-mers encoded by keys.
    #[arg(short, long)]
    kmer_length: u32,
    /// The number of samples; tags must be smaller than this value.
    #[arg(short, long)]
    samples: u32,
    /// Use this number of threads.
    #[arg(short, long, default_value_t = 8)]
    threads: usize,
    /// The number of high bits of keys used to split them into L1 groups.
    /// If not given, it is derived from the estimated number of keys.
    #[arg(long)]
    split_bits: Option<u32>,
    /// The maximum number of pairs sampled to estimate parameters.
    #[arg(long)]
    sample_limit: Option<usize>,
    /// The capacity of a value-list node.
    #[arg(long)]
    l2_limit: Option<u64>,
    /// The number of bits of key signatures in L1.
    #[arg(long, default_value_t = 16)]
    signature_bits: usize,
    /// Do not check for duplicate keys.
    #[arg(long)]
    no_check_dups: bool,
}

#[derive(clap::Args, Debug)]
struct QueryArgs {
    /// The base path of the index files.
    base: PathBuf,
    /// The keys to query, in decimal or hexadecimal with a 0x prefix.
    #[arg(required = true)]
    keys: Vec<String>,
    /// Use this number of threads for loading.
    #[arg(short, long, default_value_t = 8)]
    threads: usize,
    /// The memory budget in MiB for loading value-list nodes.
    #[arg(short, long)]
    memory_budget: Option<u64>,
}

fn parse_key(s: &str) -> Result<u64> {
    match s.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    }
    .with_context(|| format!("Invalid key \"{}\"", s))
}

fn build(args: BuildArgs) -> Result<()> {
    let mut config = BuildConfig::default()
        .threads(args.threads)
        .signature_bits(args.signature_bits)
        .check_dups(!args.no_check_dups);
    if let Some(split_bits) = args.split_bits {
        config = config.split_bits(split_bits);
    }
    if let Some(sample_limit) = args.sample_limit {
        config = config.sample_limit(sample_limit);
    }
    if let Some(l2_limit) = args.l2_limit {
        config = config.l2_limit(l2_limit);
    }

    let mut reader = TextTagReader::new(&args.input, args.kmer_length, args.samples)?;
    let mut pl = ProgressLogger::default();
    pl.display_memory(true);

    let summary = IndexBuilder::new(config).build(&mut reader, &args.base, &mut pl)?;
    log::info!(
        "Built index {} with {} keys and {} L2 nodes",
        args.base.display(),
        summary.num_keys,
        summary.num_nodes
    );
    Ok(())
}

fn query(args: QueryArgs) -> Result<()> {
    let keys = args
        .keys
        .iter()
        .map(|s| parse_key(s))
        .collect::<Result<Vec<_>>>()?;
    let mut config = LoadConfig::default().threads(args.threads);
    if let Some(memory_budget) = args.memory_budget {
        config = config.memory_budget(memory_budget);
    }

    let index = TagIndex::load_with(&args.base, &config)?;
    let mut tags = Vec::new();
    for key in keys {
        index.query_into(key, &mut tags);
        println!(
            "{:#x}\t{}",
            key,
            tags.iter()
                .map(|t| t.to_string())
                .collect::<Vec<_>>()
                .join(",")
        );
    }
    Ok(())
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .try_init()?;

    match Cli::parse().command {
        Command::Build(args) => build(args),
        Command::Query(args) => query(args),
    }
}
