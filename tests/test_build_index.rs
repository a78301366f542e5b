/*
 * SPDX-FileCopyrightText: 2025 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

use anyhow::Result;
use dsi_progress_logger::*;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::io::Write;
use std::path::Path;
use tagmap::builder::BuildError;
use tagmap::meta::{l2_path, meta_path, IndexMetadata};
use tagmap::partition::KeyPartition;
use tagmap::prelude::*;

/// Generates `n` pairs over `sample_count` samples with lists of all
/// kinds; long lists are sorted and deduplicated, as returned by queries.
fn gen_pairs(n: u64, sample_count: u32, rng: &mut SmallRng) -> Vec<(u64, Vec<Tag>)> {
    (0..n)
        .map(|i| {
            let key = i.wrapping_mul(0x9e37_79b9_7f4a_7c15) >> 2;
            let tags = match rng.random_range(0..8) {
                0 => vec![],
                1..=2 => vec![rng.random_range(0..sample_count)],
                3..=4 => (0..rng.random_range(2..=4))
                    .map(|_| rng.random_range(0..sample_count))
                    .collect(),
                5..=6 => {
                    let mut tags = (0..rng.random_range(10..40))
                        .map(|_| rng.random_range(0..sample_count))
                        .collect::<Vec<_>>();
                    tags.sort_unstable();
                    tags.dedup();
                    tags
                }
                _ => (0..sample_count).filter(|_| rng.random_bool(0.7)).collect(),
            };
            (key, tags)
        })
        .collect()
}

fn check(index: &TagIndex, pairs: &[(u64, Vec<Tag>)]) {
    let mut tags = Vec::new();
    for (key, expected) in pairs {
        index.query_into(*key, &mut tags);
        assert_eq!(&tags, expected, "key {:#x}", key);
    }
}

fn build(
    config: BuildConfig,
    pairs: Vec<(u64, Vec<Tag>)>,
    sample_count: u32,
    base: &Path,
    pl: &mut impl ProgressLog,
) -> Result<BuildSummary> {
    let mut reader = VecTagReader::new(31, sample_count, pairs);
    IndexBuilder::new(config).build(&mut reader, base, pl)
}

#[test]
fn test_round_trip() -> Result<()> {
    let _ = env_logger::builder()
        .is_test(true)
        .filter_level(log::LevelFilter::Info)
        .try_init();
    let mut pl = ProgressLogger::default();
    let mut rng = SmallRng::seed_from_u64(0);
    let dir = tempfile::tempdir()?;

    for (n, sample_count) in [(0, 10), (1, 10), (1000, 100), (20_000, 1000)] {
        let base = dir.path().join(format!("idx-{}-{}", n, sample_count));
        let pairs = gen_pairs(n, sample_count, &mut rng);
        let config = BuildConfig::default()
            .threads(4)
            .signature_bits(32)
            .keys_per_group(1000);
        let summary = build(config, pairs.clone(), sample_count, &base, &mut pl)?;
        assert_eq!(
            summary.num_keys + summary.skipped_keys,
            n,
            "{:?}",
            summary
        );

        let index = TagIndex::load(&base, 4)?;
        assert_eq!(index.metadata().num_keys, summary.num_keys);
        assert_eq!(index.metadata().l1_split_bits, summary.split_bits);
        assert_eq!(index.num_nodes(), summary.num_nodes);
        check(&index, &pairs);
    }
    Ok(())
}

#[test]
fn test_every_encoding() -> Result<()> {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = tempfile::tempdir()?;
    let base = dir.path().join("idx");

    // 64 samples: short lists up to three tags, 8-byte bitmaps
    let pairs = vec![
        (1, vec![3]),
        (2, vec![1, 2]),
        (3, vec![9, 4, 9]),
        (4, (0..12).collect()),
        (5, vec![0, 20, 40, 60, 61, 62, 63, 1, 2, 3, 4]),
        (6, vec![40, 10, 30, 20, 20]),
        (7, vec![63]),
    ];
    let summary = build(
        BuildConfig::default().threads(2).short_list_limit(3),
        pairs.clone(),
        64,
        &base,
        no_logging![],
    )?;
    assert_eq!(summary.direct_keys, 2);
    assert_eq!(summary.short_keys, 2);
    assert_eq!(summary.mapp_keys, 2);
    assert_eq!(summary.encoded_keys, 1);

    let index = TagIndex::load(&base, 2)?;
    let kinds = index
        .metadata()
        .nodes
        .iter()
        .map(|node| node.kind)
        .collect::<Vec<_>>();
    assert!(kinds.contains(&NodeKind::Short));
    assert!(kinds.contains(&NodeKind::ValueIndexEncoded));
    assert!(kinds.contains(&NodeKind::Mapp));

    assert_eq!(index.query(1), vec![3]);
    assert_eq!(index.query(7), vec![63]);
    // Short lists are returned as given
    assert_eq!(index.query(2), vec![1, 2]);
    assert_eq!(index.query(3), vec![9, 4, 9]);
    // Longer lists are sorted and deduplicated
    assert_eq!(index.query(4), (0..12).collect::<Vec<_>>());
    assert_eq!(
        index.query(5),
        vec![0, 1, 2, 3, 4, 20, 40, 60, 61, 62, 63]
    );
    assert_eq!(index.query(6), vec![10, 20, 30, 40]);
    Ok(())
}

#[test]
fn test_node_capacity() -> Result<()> {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut rng = SmallRng::seed_from_u64(1);
    let dir = tempfile::tempdir()?;
    let base = dir.path().join("idx");
    let pairs = gen_pairs(5000, 200, &mut rng);
    let l2_limit = 2000;

    let summary = build(
        BuildConfig::default()
            .threads(3)
            .l2_limit(l2_limit)
            .split_bits(4)
            .signature_bits(32),
        pairs.clone(),
        200,
        &base,
        no_logging![],
    )?;
    assert_eq!(summary.split_bits, 4);
    assert!(summary.num_nodes > 10);

    let index = TagIndex::load_with(&base, &LoadConfig::default().threads(3).memory_budget(1))?;
    for node in &index.metadata().nodes {
        assert!(node.keys > 0);
        assert!(node.keys == 1 || node.values <= l2_limit, "{:?}", node);
    }
    // Values must address every node
    let meta = index.metadata();
    assert!(1 << meta.l1_value_bits >= meta.nodes.len() as u64 + meta.l2_id_shift);
    check(&index, &pairs);
    Ok(())
}

#[test]
fn test_missing_nodes() -> Result<()> {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut rng = SmallRng::seed_from_u64(5);
    let dir = tempfile::tempdir()?;
    let base = dir.path().join("idx");
    let pairs = gen_pairs(3000, 200, &mut rng);
    let summary = build(
        BuildConfig::default().l2_limit(1000).signature_bits(32),
        pairs.clone(),
        200,
        &base,
        no_logging![],
    )?;
    assert!(summary.num_nodes > 2);

    // Forget the trailing half of the nodes
    let mut meta = IndexMetadata::load(&base)?;
    let kept = meta.nodes.len() / 2;
    meta.nodes.truncate(kept);
    meta.save(&base)?;

    let index = TagIndex::load(&base, 2)?;
    assert_eq!(index.num_nodes(), kept);
    let l1 = KeyPartition::load(&base, meta.key_bits(), meta.l1_split_bits, 2)?;
    let mut routed_to_missing = 0;
    for (key, expected) in &pairs {
        if l1.query(*key) >= meta.l2_id_shift + kept as u64 {
            routed_to_missing += 1;
            assert!(index.query(*key).is_empty(), "key {:#x}", key);
        } else {
            assert_eq!(&index.query(*key), expected, "key {:#x}", key);
        }
    }
    assert!(routed_to_missing > 0);
    Ok(())
}

#[test]
fn test_text_input() -> Result<()> {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut rng = SmallRng::seed_from_u64(2);
    let dir = tempfile::tempdir()?;
    let input = dir.path().join("pairs.txt.zst");
    let base = dir.path().join("idx");

    let pairs = gen_pairs(2000, 300, &mut rng);
    let mut out = zstd::stream::write::Encoder::new(std::fs::File::create(&input)?, 0)?;
    for (key, tags) in &pairs {
        let tags = tags.iter().map(|t| t.to_string()).collect::<Vec<_>>();
        writeln!(out, "{:#x} {}", key, tags.join(","))?;
    }
    out.finish()?;

    let mut reader = TextTagReader::new(&input, 31, 300)?;
    IndexBuilder::new(BuildConfig::default().signature_bits(32)).build(
        &mut reader,
        &base,
        no_logging![],
    )?;
    check(&TagIndex::load(&base, 8)?, &pairs);
    Ok(())
}

#[test]
fn test_estimate_then_construct() -> Result<()> {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut rng = SmallRng::seed_from_u64(3);
    let dir = tempfile::tempdir()?;
    let base = dir.path().join("idx");
    let pairs = gen_pairs(10_000, 500, &mut rng);

    let builder = IndexBuilder::new(
        BuildConfig::default()
            .sample_limit(1000)
            .keys_per_group(1000)
            .signature_bits(32),
    );
    let mut reader = VecTagReader::new(31, 500, pairs.clone());
    let plan = builder.estimate_parameters(&mut reader, no_logging![])?;
    assert!(plan.truncated);
    assert_eq!(plan.sampled, 1000);
    // Extrapolated from the position of the reader
    assert!(plan.estimated_keys > 9000 && plan.estimated_keys <= 10_000);

    let summary = builder.construct_from_reader(&mut reader, &plan, &base, no_logging![])?;
    // About 10 groups of 1000 keys
    assert_eq!(summary.split_bits, 4);
    check(&TagIndex::load(&base, 4)?, &pairs);
    Ok(())
}

#[test]
fn test_errors() -> Result<()> {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = tempfile::tempdir()?;
    let base = dir.path().join("idx");

    let err = build(
        BuildConfig::default(),
        vec![(1, vec![0, 10])],
        10,
        &base,
        no_logging![],
    )
    .unwrap_err();
    assert_eq!(
        err.downcast_ref::<BuildError>(),
        Some(&BuildError::TagOutOfRange {
            key: 1,
            tag: 10,
            sample_count: 10
        })
    );

    let mut reader = VecTagReader::new(33, 10, vec![]);
    let err = IndexBuilder::default()
        .build(&mut reader, &base, no_logging![])
        .unwrap_err();
    assert_eq!(
        err.downcast_ref::<BuildError>(),
        Some(&BuildError::InvalidKmerLength(33))
    );

    // Duplicate keys
    assert!(build(
        BuildConfig::default(),
        vec![(1, vec![2]), (1, vec![3])],
        10,
        &base,
        no_logging![],
    )
    .is_err());

    // Missing files
    assert!(TagIndex::load(dir.path().join("missing"), 2).is_err());
    build(
        BuildConfig::default(),
        vec![(1, vec![2, 3]), (2, vec![4])],
        10,
        &base,
        no_logging![],
    )?;
    assert!(meta_path(&base).exists());
    std::fs::remove_file(l2_path(&base, 0))?;
    assert!(TagIndex::load(&base, 2).is_err());
    Ok(())
}

#[cfg(feature = "slow_tests")]
#[test]
fn test_large() -> Result<()> {
    let _ = env_logger::builder()
        .is_test(true)
        .filter_level(log::LevelFilter::Info)
        .try_init();
    let mut pl = ProgressLogger::default();
    let mut rng = SmallRng::seed_from_u64(4);
    let dir = tempfile::tempdir()?;
    let base = dir.path().join("idx");
    let pairs = gen_pairs(2_000_000, 5000, &mut rng);

    let summary = build(
        BuildConfig::default()
            .keys_per_group(100_000)
            .l2_limit(10 << 20)
            .signature_bits(32),
        pairs.clone(),
        5000,
        &base,
        &mut pl,
    )?;
    pl.info(format_args!("{:?}", summary));

    let index = TagIndex::load(&base, 8)?;
    check(&index, &pairs);
    let keys = pairs.iter().map(|(key, _)| *key).collect::<Vec<_>>();
    let results = index.query_all(&keys);
    for ((_, expected), tags) in pairs.iter().zip(results) {
        assert_eq!(expected, &tags);
    }
    Ok(())
}
