//! Partition tables
//!
//! A partition of `n` elements over `D` contexts is a table of `D + 1`
//! non-decreasing offsets starting at 0 and ending at `n`; device `i` owns
//! `[part[i], part[i + 1])`. Any device may own an empty range.
//!
//! The active policy is process-wide and latched on first use. Until then
//! it may be replaced exactly once with [`set_partitioning`].

use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::Instant;

use parking_lot::Mutex;

use crate::config::{PartitionPolicy, RuntimeConfig};
use crate::context::{Context, ContextId};
use crate::error::{Error, Result};
use crate::util::alignup;
use crate::vector::DeviceVector;

/// A partitioning policy.
pub type PartitionFn = fn(usize, &[Context]) -> Vec<usize>;

/// Elements per buffer in the throughput probe.
pub const PERF_TEST_SIZE: usize = 1 << 20;

static POLICY: OnceLock<PartitionFn> = OnceLock::new();
static WEIGHTS: OnceLock<Mutex<HashMap<ContextId, f64>>> = OnceLock::new();

/// Install `policy` for the rest of the process.
///
/// Fails with [`Error::PartitioningAlreadySet`] if a policy is already
/// active, including the default one latched by an earlier partition. The
/// active policy is kept in that case.
pub fn set_partitioning(policy: PartitionFn) -> Result<()> {
    POLICY.set(policy).map_err(|_| {
        tracing::warn!("partitioning policy already active; keeping it");
        Error::PartitioningAlreadySet
    })?;
    tracing::debug!("partition_policy_installed");
    Ok(())
}

fn active_policy() -> PartitionFn {
    *POLICY.get_or_init(|| {
        let policy = RuntimeConfig::global().partition;
        tracing::debug!(policy = ?policy, "partition_policy_defaulted");
        match policy {
            PartitionPolicy::Perf => partition_by_vector_perf,
            PartitionPolicy::Equal => partition_equally,
        }
    })
}

/// Partition `n` elements over `contexts` with the active policy.
pub fn partition(n: usize, contexts: &[Context]) -> Vec<usize> {
    let part = active_policy()(n, contexts);
    debug_assert!(is_valid(&part, n, contexts.len()), "policy returned {part:?}");
    tracing::trace!(n, devices = contexts.len(), part = ?part, "partition_computed");
    part
}

/// Equal chunks rounded up to the alignment; the tail may be short or empty.
pub fn partition_equally(n: usize, contexts: &[Context]) -> Vec<usize> {
    let devices = contexts.len();
    match devices {
        0 => vec![0],
        1 => vec![0, n],
        _ => {
            let chunk = alignup(n.div_ceil(devices), RuntimeConfig::global().alignment);
            let mut part = Vec::with_capacity(devices + 1);
            part.push(0);
            for i in 0..devices {
                part.push((part[i] + chunk).min(n));
            }
            part
        }
    }
}

/// Chunks proportional to each context's measured vector throughput.
///
/// Weights are measured once per context and reused, so two partitions of
/// the same length over the same contexts are always identical.
pub fn partition_by_vector_perf(n: usize, contexts: &[Context]) -> Vec<usize> {
    match contexts.len() {
        0 => return vec![0],
        1 => return vec![0, n],
        _ if n == 0 => return vec![0; contexts.len() + 1],
        _ => {}
    }
    let weights: Vec<f64> = contexts.iter().map(device_vector_perf).collect();
    split_by_weights(n, &weights, RuntimeConfig::global().alignment)
}

/// Throughput weight of `ctx`: one over the time of `a = b + c` on
/// [`PERF_TEST_SIZE`] floats, measured on the second of two runs.
pub fn device_vector_perf(ctx: &Context) -> f64 {
    let weights = WEIGHTS.get_or_init(|| Mutex::new(HashMap::new()));
    if let Some(&weight) = weights.lock().get(&ctx.id()) {
        return weight;
    }

    let weight = match measure(ctx) {
        Ok(seconds) => 1.0 / seconds.max(1e-9),
        Err(error) => {
            tracing::warn!(context = %ctx.id(), error = %error, "vector throughput probe failed; using unit weight");
            1.0
        }
    };
    // A concurrent probe of the same context may have finished first.
    *weights.lock().entry(ctx.id()).or_insert(weight)
}

fn measure(ctx: &Context) -> Result<f64> {
    let single = std::slice::from_ref(ctx);
    let a = DeviceVector::<f32>::new(single, PERF_TEST_SIZE)?;
    let b = DeviceVector::<f32>::new(single, PERF_TEST_SIZE)?;
    let c = DeviceVector::<f32>::new(single, PERF_TEST_SIZE)?;

    a.assign(&b + &c)?;
    a.finish()?;

    let start = Instant::now();
    a.assign(&b + &c)?;
    a.finish()?;
    let seconds = start.elapsed().as_secs_f64();

    tracing::debug!(
        context = %ctx.id(),
        device = %ctx.info().name,
        elements = PERF_TEST_SIZE,
        seconds,
        "vector_perf_measured"
    );
    Ok(seconds)
}

/// Split `n` by `weights`, aligning every boundary but the last.
pub(crate) fn split_by_weights(n: usize, weights: &[f64], alignment: usize) -> Vec<usize> {
    let devices = weights.len();
    let usable = weights.iter().all(|w| w.is_finite() && *w > 0.0);
    let total: f64 = if usable { weights.iter().sum() } else { devices as f64 };

    let mut part = Vec::with_capacity(devices + 1);
    part.push(0);
    for (i, &weight) in weights.iter().enumerate() {
        let next = if i + 1 == devices {
            n
        } else {
            let weight = if usable { weight } else { 1.0 };
            let share = (n as f64 * weight / total) as usize;
            (part[i] + alignup(share, alignment)).min(n)
        };
        part.push(next);
    }
    part
}

/// Table invariants: `devices + 1` entries, non-decreasing, `0..=n`.
pub(crate) fn is_valid(part: &[usize], n: usize, devices: usize) -> bool {
    if devices == 0 {
        return part == [0];
    }
    part.len() == devices + 1 && part[0] == 0 && part[devices] == n && part.windows(2).all(|w| w[0] <= w[1])
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn contexts(count: usize) -> Vec<Context> {
        (0..count).map(|_| Context::cpu()).collect()
    }

    #[test]
    fn single_device_owns_everything() {
        let ctx = contexts(1);
        assert_eq!(partition_equally(1000, &ctx), vec![0, 1000]);
        assert_eq!(partition_by_vector_perf(1000, &ctx), vec![0, 1000]);
    }

    #[test]
    fn equal_chunks_are_aligned() {
        let ctx = contexts(3);
        assert_eq!(partition_equally(100, &ctx), vec![0, 48, 96, 100]);
        assert_eq!(partition_equally(10, &ctx), vec![0, 10, 10, 10]);
        assert_eq!(partition_equally(0, &ctx), vec![0, 0, 0, 0]);
    }

    #[test]
    fn empty_vector_needs_no_measurement() {
        let ctx = contexts(2);
        assert_eq!(partition_by_vector_perf(0, &ctx), vec![0, 0, 0]);
    }

    #[test]
    fn weights_split_proportionally() {
        assert_eq!(split_by_weights(1024, &[3.0, 1.0], 16), vec![0, 768, 1024]);
        assert_eq!(split_by_weights(100, &[1.0, 1.0, 1.0, 1.0], 16), vec![0, 32, 64, 96, 100]);
        assert_eq!(split_by_weights(50, &[f64::NAN, 1.0], 16), vec![0, 32, 50]);
    }

    #[test]
    fn validity_check_rejects_broken_tables() {
        assert!(is_valid(&[0, 5, 5, 9], 9, 3));
        assert!(!is_valid(&[0, 6, 5, 9], 9, 3));
        assert!(!is_valid(&[1, 5, 9], 9, 2));
        assert!(!is_valid(&[0, 9], 10, 1));
    }

    proptest! {
        #[test]
        fn equal_partition_is_a_valid_table(n in 0usize..100_000, devices in 1usize..6) {
            let ctx = contexts(devices);
            let part = partition_equally(n, &ctx);
            prop_assert!(is_valid(&part, n, devices), "{:?}", part);
        }

        #[test]
        fn weighted_partition_is_a_valid_table(
            n in 0usize..1_000_000,
            weights in proptest::collection::vec(0.001f64..1000.0, 1..8),
        ) {
            let part = split_by_weights(n, &weights, 16);
            prop_assert!(is_valid(&part, n, weights.len()), "{:?}", part);
            for boundary in &part[..weights.len()] {
                prop_assert!(*boundary % 16 == 0 || *boundary == n);
            }
        }
    }
}
