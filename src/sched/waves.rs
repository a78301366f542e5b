/*
 * SPDX-FileCopyrightText: 2025 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! Wave-based bounded parallel execution.
//!
//! Items are cut, in order, into *waves*: a wave is closed as soon as it
//! contains [`WaveLimits::max_items`] items, or the cumulative number of
//! keys of its items exceeds [`WaveLimits::key_limit`], or their cumulative
//! number of values exceeds [`WaveLimits::value_limit`]. Note that the item
//! triggering the closure belongs to the wave it closes. The items of a wave
//! are processed in parallel, and the next wave starts only after the
//! previous one has completed, so peak memory is bounded by the volume of a
//! single wave.

use anyhow::{Context, Result};
use dsi_progress_logger::ProgressLog;
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};

/// Bounds on the size of a wave.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaveLimits {
    /// The maximum number of items in a wave.
    pub max_items: usize,
    /// A wave is closed when the sum of the key counts of its items exceeds
    /// this value.
    pub key_limit: u64,
    /// A wave is closed when the sum of the value counts of its items
    /// exceeds this value.
    pub value_limit: u64,
}

impl WaveLimits {
    /// Limits bounding just the number of items and of keys.
    pub fn new(max_items: usize, key_limit: u64) -> Self {
        Self {
            max_items: max_items.max(1),
            key_limit,
            value_limit: u64::MAX,
        }
    }

    /// Bounds also the number of values of each wave.
    pub fn value_limit(mut self, value_limit: u64) -> Self {
        self.value_limit = value_limit;
        self
    }
}

/// Builds a thread pool with the given number of threads.
pub fn thread_pool(num_threads: usize) -> Result<ThreadPool> {
    ThreadPoolBuilder::new()
        .num_threads(num_threads.max(1))
        .thread_name(|i| format!("tagmap-wave-{}", i))
        .build()
        .context("Could not build the thread pool")
}

/// Cuts `items` into waves using the `(keys, values)` weights returned by
/// `weight`.
pub fn split_waves<T>(
    items: impl IntoIterator<Item = T>,
    limits: WaveLimits,
    weight: impl Fn(&T) -> (u64, u64),
) -> Vec<Vec<T>> {
    let mut waves = Vec::new();
    let mut wave = Vec::new();
    let (mut keys, mut values) = (0_u64, 0_u64);

    for item in items {
        let (k, v) = weight(&item);
        keys = keys.saturating_add(k);
        values = values.saturating_add(v);
        wave.push(item);

        if wave.len() >= limits.max_items || keys > limits.key_limit || values > limits.value_limit
        {
            waves.push(std::mem::take(&mut wave));
            keys = 0;
            values = 0;
        }
    }
    if !wave.is_empty() {
        waves.push(wave);
    }
    waves
}

/// Cuts `items` into waves using the `(keys, values)` weights returned by
/// `weight`, and applies `f` to the items of each wave in parallel on
/// `pool`.
///
/// Results are returned in the order of `items`. The first error stops the
/// processing: waves that have not started yet are not run.
pub fn run_in_waves<T, R, W, F>(
    items: Vec<T>,
    limits: WaveLimits,
    weight: W,
    pool: &ThreadPool,
    f: F,
    pl: &mut impl ProgressLog,
) -> Result<Vec<R>>
where
    T: Send,
    R: Send,
    W: Fn(&T) -> (u64, u64),
    F: Fn(T) -> Result<R> + Send + Sync,
{
    let mut results = Vec::with_capacity(items.len());
    let waves = split_waves(items, limits, weight);
    let num_waves = waves.len();

    for (i, wave) in waves.into_iter().enumerate() {
        let len = wave.len();
        log::debug!("Wave {}/{}: {} items", i + 1, num_waves, len);
        let done: Vec<R> = pool.install(|| wave.into_par_iter().map(&f).collect::<Result<_>>())?;
        results.extend(done);
        pl.update_with_count(len);
    }

    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use dsi_progress_logger::no_logging;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_wave_boundaries() {
        let weights = [10_u64, 10, 50, 1, 1, 1, 1, 1, 1, 100, 1];
        let waves = split_waves(weights, WaveLimits::new(4, 30), |&w| (w, 0));
        assert_eq!(
            waves,
            vec![vec![10, 10, 50], vec![1, 1, 1, 1], vec![1, 1, 100], vec![1]]
        );

        let waves = split_waves(0..6_u64, WaveLimits::new(10, u64::MAX).value_limit(4), |&v| (0, v));
        assert_eq!(waves, vec![vec![0, 1, 2, 3], vec![4, 5]]);

        assert!(split_waves(Vec::<u64>::new(), WaveLimits::new(1, 1), |_| (1, 1)).is_empty());
    }

    #[test]
    fn test_results_in_order() -> Result<()> {
        let pool = thread_pool(4)?;
        let items = (0..100_u64).collect::<Vec<_>>();
        let results = run_in_waves(
            items.clone(),
            WaveLimits::new(4, 30),
            |&w| (w, 0),
            &pool,
            |w| Ok(w * 2),
            no_logging![],
        )?;
        assert_eq!(results, items.iter().map(|w| w * 2).collect::<Vec<_>>());
        Ok(())
    }

    #[test]
    fn test_waves_are_sequential() -> Result<()> {
        let pool = thread_pool(4)?;
        let in_flight = AtomicUsize::new(0);
        let max_in_flight = AtomicUsize::new(0);
        run_in_waves(
            (0..40).collect::<Vec<usize>>(),
            WaveLimits::new(3, u64::MAX),
            |_| (1, 1),
            &pool,
            |_| {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                max_in_flight.fetch_max(now, Ordering::SeqCst);
                std::thread::sleep(std::time::Duration::from_millis(1));
                in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            },
            no_logging![],
        )?;
        assert!(max_in_flight.load(Ordering::SeqCst) <= 3);
        Ok(())
    }

    #[test]
    fn test_value_limit_and_errors() -> Result<()> {
        let pool = thread_pool(2)?;
        let result = run_in_waves(
            (0..10).collect::<Vec<u64>>(),
            WaveLimits::new(8, u64::MAX).value_limit(5),
            |&i| (0, i),
            &pool,
            |i| {
                anyhow::ensure!(i != 7, "Item 7");
                Ok(i)
            },
            no_logging![],
        );
        assert!(result.is_err());
        Ok(())
    }
}
