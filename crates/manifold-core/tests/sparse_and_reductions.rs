//! Integration tests for sparse products, reductions and a small solver
//! built from both.

use manifold_backends::{DeviceInfo, DeviceKind};
use manifold_core::expr::fabs;
use manifold_core::{
    max, min, partition_equally, set_partitioning, sum, Context, DeviceVector, ReduceOp, Reductor, Result, SpMat,
};

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

fn gpu_like_contexts(n: usize) -> Vec<Context> {
    setup();
    let info = DeviceInfo::new("sim-gpu", DeviceKind::Gpu)
        .with_compute_units(4)
        .with_max_work_group_size(64);
    Context::simulated(n, &info)
}

/// CSR arrays of the tridiagonal matrix `[off, diag, off]` of order `n`.
fn tridiagonal(n: usize, diag: f64, off: f64) -> (Vec<usize>, Vec<usize>, Vec<f64>) {
    let mut row = vec![0];
    let mut col = Vec::with_capacity(3 * n);
    let mut val = Vec::with_capacity(3 * n);
    for i in 0..n {
        if i > 0 {
            col.push(i - 1);
            val.push(off);
        }
        col.push(i);
        val.push(diag);
        if i + 1 < n {
            col.push(i + 1);
            val.push(off);
        }
        row.push(col.len());
    }
    (row, col, val)
}

fn host_spmv(row: &[usize], col: &[usize], val: &[f64], x: &[f64]) -> Vec<f64> {
    row.windows(2)
        .map(|w| (w[0]..w[1]).map(|j| val[j] * x[col[j]]).sum())
        .collect()
}

// ============================================================================
// Sparse matrix-vector products
// ============================================================================

#[test]
fn test_identity_and_ones() -> Result<()> {
    let contexts = cpu_contexts(2);

    let eye = SpMat::new(&contexts, 4, 4, &[0, 1, 2, 3, 4], &[0, 1, 2, 3], &[1.0f64; 4])?;
    let x = DeviceVector::from_slice(&contexts, &[3.0, -1.0, 0.5, 8.0])?;
    let y = DeviceVector::new(&contexts, 4)?;
    y.assign(&eye * &x)?;
    assert_eq!(y.to_vec()?, vec![3.0, -1.0, 0.5, 8.0]);

    let ones = SpMat::new(&contexts, 3, 3, &[0, 3, 6, 9], &[0, 1, 2, 0, 1, 2, 0, 1, 2], &[1.0f32; 9])?;
    let x = DeviceVector::from_slice(&contexts, &[1.0, 2.0, 3.0])?;
    let y = DeviceVector::new(&contexts, 3)?;
    y.assign(&ones * &x)?;
    assert_eq!(y.to_vec()?, vec![6.0, 6.0, 6.0]);
    Ok(())
}

#[test]
fn test_spmv_on_gpu_like_devices() -> Result<()> {
    let contexts = gpu_like_contexts(3);
    let n = 500;
    let (row, col, val) = tridiagonal(n, 4.0, -1.0);
    let a = SpMat::new(&contexts, n, n, &row, &col, &val)?;
    let xs: Vec<f64> = (0..n).map(|i| ((i * 7) % 11) as f64).collect();
    let x = DeviceVector::from_slice(&contexts, &xs)?;
    let y = DeviceVector::from_slice(&contexts, &vec![1.0; n])?;

    y.assign(&a * &x - &y)?;
    let expected: Vec<f64> = host_spmv(&row, &col, &val, &xs).into_iter().map(|v| v - 1.0).collect();
    assert_eq!(y.to_vec()?, expected);
    Ok(())
}

// ============================================================================
// Reductions
// ============================================================================

#[test]
fn test_reductions_over_simulated_devices() -> Result<()> {
    let contexts = gpu_like_contexts(4);
    let n = 10_001;
    let xs: Vec<i64> = (0..n).map(|i| (i * 7919) % 2003 - 1000).collect();
    let x = DeviceVector::from_slice(&contexts, &xs)?;

    assert_eq!(sum(&x)?, xs.iter().sum::<i64>());
    assert_eq!(max(&x)?, *xs.iter().max().unwrap());
    assert_eq!(min(&x)?, *xs.iter().min().unwrap());
    assert_eq!(max(-&x)?, -*xs.iter().min().unwrap());
    Ok(())
}

#[test]
fn test_reductor_is_reusable_and_deterministic() -> Result<()> {
    let contexts = cpu_contexts(3);
    let xs: Vec<f32> = (0..4096).map(|i| (i as f32 * 0.37).sin()).collect();
    let x = DeviceVector::from_slice(&contexts, &xs)?;

    let total = Reductor::new(&contexts, ReduceOp::Sum)?;
    let first = total.apply(&x * &x)?;
    for _ in 0..3 {
        assert_eq!(total.apply(&x * &x)?.to_bits(), first.to_bits());
    }
    let expected: f32 = xs.iter().map(|v| v * v).sum();
    assert!((first - expected).abs() / expected < 1e-4);

    let largest = xs.iter().fold(0.0f32, |m, v| m.max(v.abs()));
    assert_eq!(Reductor::new(&contexts, ReduceOp::Max)?.apply(fabs(&x))?, largest);
    Ok(())
}

// ============================================================================
// Conjugate gradient
// ============================================================================

#[test]
fn test_conjugate_gradient_on_tridiagonal_system() -> Result<()> {
    let contexts = cpu_contexts(3);
    let n = 256;
    let (row, col, val) = tridiagonal(n, 4.0, -1.0);
    let a = SpMat::new(&contexts, n, n, &row, &col, &val)?;
    let bs: Vec<f64> = (0..n).map(|i| 1.0 + (i % 5) as f64).collect();

    let b = DeviceVector::from_slice(&contexts, &bs)?;
    let x = DeviceVector::from_slice(&contexts, &vec![0.0; n])?;
    let r = DeviceVector::new(&contexts, n)?;
    let p = DeviceVector::new(&contexts, n)?;
    let q = DeviceVector::new(&contexts, n)?;
    let dot = Reductor::new(&contexts, ReduceOp::Sum)?;

    r.assign(&b - &a * &x)?;
    p.assign(&r)?;
    let mut rho = dot.apply(&r * &r)?;
    let mut iterations = 0;
    while rho.sqrt() > 1e-10 && iterations < n {
        q.assign(&a * &p)?;
        let alpha = rho / dot.apply(&p * &q)?;
        x.assign(&x + alpha * &p)?;
        r.assign(&r - alpha * &q)?;
        let next = dot.apply(&r * &r)?;
        p.assign(&r + (next / rho) * &p)?;
        rho = next;
        iterations += 1;
    }

    assert!(iterations < n, "no convergence after {iterations} iterations");
    let residual = host_spmv(&row, &col, &val, &x.to_vec()?)
        .iter()
        .zip(&bs)
        .map(|(ax, b)| (ax - b).powi(2))
        .sum::<f64>()
        .sqrt();
    assert!(residual < 1e-8, "residual {residual}");
    Ok(())
}
