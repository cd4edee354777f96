//! Integration tests for distributed vectors and fused expressions
//!
//! Every test partitions equally so that no throughput probe runs; the
//! probe itself is covered in `partition_policy.rs`.

use manifold_backends::CpuBackend;
use manifold_core::expr::{cos, fmax, sqrt, UserFunction};
use manifold_core::{
    copy_range_from_host, copy_range_to_host, partition_equally, set_partitioning, Context, DeviceVector, Error,
    Result,
};
use proptest::prelude::*;

static EQUAL_PARTITIONING: std::sync::Once = std::sync::Once::new();
fn setup() {
    manifold_tracing::init_test_tracing();
    EQUAL_PARTITIONING.call_once(|| {
        let _ = set_partitioning(partition_equally);
    });
}

fn cpu_contexts(n: usize) -> Vec<Context> {
    setup();
    (0..n).map(|_| Context::cpu()).collect()
}

fn cpu(ctx: &Context) -> &CpuBackend {
    ctx.downcast::<CpuBackend>().expect("cpu context")
}

// ============================================================================
// End-to-end expressions
// ============================================================================

#[test]
fn test_sqrt_cos_end_to_end() -> Result<()> {
    let contexts = cpu_contexts(2);
    let n = 1 << 20;
    let xs: Vec<f32> = (0..n).map(|i| i as f32 / n as f32).collect();
    let ys: Vec<f32> = (0..n).map(|i| (i % 1000) as f32 * 1e-3).collect();

    let x = DeviceVector::from_slice(&contexts, &xs)?;
    let y = DeviceVector::from_slice(&contexts, &ys)?;
    let z = DeviceVector::new(&contexts, n)?;
    z.assign(sqrt(2.0 * &x) + cos(&y))?;

    let out = z.to_vec()?;
    for i in 0..n {
        let expected = (2.0 * xs[i]).sqrt() + ys[i].cos();
        assert!((out[i] - expected).abs() <= 1e-6, "element {i}: {} vs {expected}", out[i]);
    }
    Ok(())
}

#[test]
fn test_vector_appears_on_both_sides() -> Result<()> {
    let contexts = cpu_contexts(3);
    let x = DeviceVector::from_slice(&contexts, &vec![1.5f64; 77])?;
    let y = DeviceVector::from_slice(&contexts, &(0..77).map(f64::from).collect::<Vec<_>>())?;

    x.assign(&x * &x + fmax(&y, 10.0))?;
    let expected: Vec<f64> = (0..77).map(|i| 2.25 + f64::from(i).max(10.0)).collect();
    assert_eq!(x.to_vec()?, expected);
    Ok(())
}

#[test]
fn test_user_function_inside_expression() -> Result<()> {
    let contexts = cpu_contexts(2);
    let clamp = UserFunction::<i32>::new("clamp01", &["v"], "return v < 0 ? 0 : (v > 100 ? 100 : v);")?;
    let x = DeviceVector::from_slice(&contexts, &(-50..150).collect::<Vec<i32>>())?;
    let y = DeviceVector::new(&contexts, 200)?;

    y.assign(clamp.call([&x * 2i32]) + 1i32)?;
    let expected: Vec<i32> = (-50..150).map(|v: i32| (v * 2).clamp(0, 100) + 1).collect();
    assert_eq!(y.to_vec()?, expected);
    Ok(())
}

// ============================================================================
// Kernel cache
// ============================================================================

#[test]
fn test_one_build_two_launches() -> Result<()> {
    let contexts = cpu_contexts(1);
    let x = DeviceVector::from_slice(&contexts, &[1.0f32, 2.0, 3.0])?;
    let y = DeviceVector::from_slice(&contexts, &[4.0f32, 5.0, 6.0])?;
    let z = DeviceVector::new(&contexts, 3)?;

    z.assign(&x + &y)?;
    z.assign(&x + &y)?;
    assert_eq!(z.to_vec()?, vec![5.0, 7.0, 9.0]);
    assert_eq!(cpu(&contexts[0]).programs_built(), 1);
    assert_eq!(cpu(&contexts[0]).kernels_launched(), 2);
    Ok(())
}

#[test]
fn test_shape_ignores_operands_and_constants() -> Result<()> {
    let contexts = cpu_contexts(1);
    let a = DeviceVector::from_slice(&contexts, &[1u64, 2, 3])?;
    let b = DeviceVector::from_slice(&contexts, &[10u64, 20, 30])?;
    let c = DeviceVector::new(&contexts, 3)?;

    c.assign(&a * 2u64 + &b)?;
    assert_eq!(c.to_vec()?, vec![12, 24, 36]);
    c.assign(&b * 5u64 + &a)?;
    assert_eq!(c.to_vec()?, vec![51, 102, 153]);
    assert_eq!(cpu(&contexts[0]).programs_built(), 1);

    c.assign(&a + &b * 5u64)?;
    assert_eq!(cpu(&contexts[0]).programs_built(), 2);
    Ok(())
}

#[test]
fn test_each_context_builds_its_own_kernel() -> Result<()> {
    let contexts = cpu_contexts(3);
    let x = DeviceVector::from_slice(&contexts, &vec![2.0f32; 100])?;
    x.assign(-&x)?;
    x.assign(-&x)?;
    assert_eq!(x.to_vec()?, vec![2.0; 100]);
    for ctx in &contexts {
        assert_eq!(cpu(ctx).programs_built(), 1, "{ctx:?}");
    }
    Ok(())
}

// ============================================================================
// Layout checks
// ============================================================================

#[test]
fn test_partition_mismatch_is_fatal() -> Result<()> {
    let contexts = cpu_contexts(2);
    let x = DeviceVector::<f32>::new(&contexts, 100)?;
    let y = DeviceVector::<f32>::new(&contexts[..1], 100)?;
    assert!(matches!(x.assign(&y), Err(Error::PartitionMismatch(_))));
    assert!(matches!(x.assign(&x + &y), Err(Error::PartitionMismatch(_))));
    Ok(())
}

// ============================================================================
// Host transfers
// ============================================================================

#[test]
fn test_range_copies() -> Result<()> {
    let contexts = cpu_contexts(3);
    let x = DeviceVector::from_slice(&contexts, &(0..100).collect::<Vec<u32>>())?;

    let mut window = [0u32; 20];
    copy_range_to_host(x.range(40..60)?, &mut window, true)?;
    assert_eq!(window.to_vec(), (40..60).collect::<Vec<_>>());

    copy_range_from_host(&[7u32; 20], x.range(40..60)?, true)?;
    assert_eq!(x.get(39)?, 39);
    assert_eq!(x.get(40)?, 7);
    assert_eq!(x.get(59)?, 7);
    assert_eq!(x.get(60)?, 60);
    assert!(matches!(x.get(100), Err(Error::IndexOutOfBounds { .. })));
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_write_then_read_round_trips(
        data in prop::collection::vec(any::<i64>(), 0..300),
        devices in 1usize..4,
        window in (0usize..300, 0usize..300),
    ) {
        let contexts = cpu_contexts(devices);
        let x = DeviceVector::from_slice(&contexts, &data).unwrap();
        prop_assert_eq!(x.to_vec().unwrap(), data.clone());

        let lo = window.0.min(data.len());
        let hi = window.1.clamp(lo, data.len());
        let patch: Vec<i64> = (lo..hi).map(|i| i as i64 * -3).collect();
        x.write_data(lo, &patch, false).unwrap();
        let mut out = vec![0i64; hi - lo];
        x.read_data(lo, &mut out, true).unwrap();
        prop_assert_eq!(out, patch);
    }
}
