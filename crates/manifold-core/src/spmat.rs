//! Distributed CSR sparse matrices
//!
//! Rows are partitioned over the contexts with the active partition policy.
//! Each device keeps its block of rows (row pointers rebased to zero, global
//! column indices) plus a staging buffer for the full input vector, since any
//! row may read any column.
//!
//! A product is staged before anything is written: `x` is gathered into every
//! staging buffer first, so `y` may alias `x` or be read by the rest of the
//! expression.
//!
//! ```rust
//! use manifold_core::{Context, DeviceVector, SpMat};
//!
//! # fn main() -> manifold_core::Result<()> {
//! let contexts = vec![Context::cpu()];
//! // [[2, 0], [1, 3]]
//! let a = SpMat::new(&contexts, 2, 2, &[0, 1, 3], &[0, 0, 1], &[2.0f32, 1.0, 3.0])?;
//! let x = DeviceVector::from_slice(&contexts, &[1.0, 2.0])?;
//! let y = DeviceVector::from_slice(&contexts, &[10.0, 10.0])?;
//! y.assign(&a * &x + &y)?;
//! assert_eq!(y.to_vec()?, vec![12.0, 17.0]);
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::marker::PhantomData;
use std::ops::Mul;

use manifold_backends::{wait_all, Backend, BufferHandle, KernelArg, MemFlags, ScalarValue};
use rayon::prelude::*;

use crate::compiler;
use crate::context::{same_contexts, Context};
use crate::dispatch::launch_config;
use crate::error::{Error, Result};
use crate::expr::{BinaryOp, Expr};
use crate::partition::partition;
use crate::scalar::Scalar;
use crate::vector::DeviceVector;

/// Device-resident block of rows.
struct Shard {
    rows: usize,
    row: BufferHandle,
    col: BufferHandle,
    val: BufferHandle,
    /// Full copy of the input vector, `ncols` elements.
    x: BufferHandle,
}

/// Host-side block before upload.
struct HostShard<T> {
    row: Vec<u64>,
    col: Vec<u64>,
    val: Vec<T>,
}

pub struct SpMat<T: Scalar> {
    contexts: Vec<Context>,
    nrows: usize,
    ncols: usize,
    nnz: usize,
    part: Vec<usize>,
    /// `None` for devices that own no rows.
    shards: Vec<Option<Shard>>,
    _marker: PhantomData<T>,
}

impl<T: Scalar> SpMat<T> {
    /// Upload an `nrows x ncols` matrix in compressed sparse row form.
    ///
    /// `row_ptr` has `nrows + 1` non-decreasing entries from 0 to `nnz`;
    /// `col` and `val` have `nnz` entries each, with every column below
    /// `ncols`.
    pub fn new(
        contexts: &[Context],
        nrows: usize,
        ncols: usize,
        row_ptr: &[usize],
        col: &[usize],
        val: &[T],
    ) -> Result<Self> {
        validate_csr(nrows, ncols, row_ptr, col, val)?;
        if contexts.is_empty() && nrows > 0 {
            return Err(Error::InvalidOperation(format!(
                "cannot distribute {nrows} rows over zero contexts"
            )));
        }
        let _perf = manifold_tracing::perf_span!("spmat_upload", rows = nrows, nnz = val.len());

        let part = partition(nrows, contexts);
        let host: Vec<HostShard<T>> = (0..contexts.len())
            .into_par_iter()
            .map(|d| {
                let (lo, hi) = (part[d], part[d + 1]);
                let base = row_ptr[lo];
                let (begin, end) = (row_ptr[lo], row_ptr[hi]);
                HostShard {
                    row: row_ptr[lo..=hi].iter().map(|&p| (p - base) as u64).collect(),
                    col: col[begin..end].iter().map(|&c| c as u64).collect(),
                    val: val[begin..end].to_vec(),
                }
            })
            .collect();

        let mut matrix = Self {
            contexts: contexts.to_vec(),
            nrows,
            ncols,
            nnz: val.len(),
            part,
            shards: Vec::with_capacity(contexts.len()),
            _marker: PhantomData,
        };
        for (d, shard) in host.iter().enumerate() {
            let rows = matrix.part[d + 1] - matrix.part[d];
            let uploaded = if rows > 0 {
                Some(upload(matrix.contexts[d].backend(), rows, ncols, shard)?)
            } else {
                None
            };
            matrix.shards.push(uploaded);
        }

        tracing::debug!(
            rows = nrows,
            cols = ncols,
            nnz = matrix.nnz,
            part = ?matrix.part,
            "spmat_created"
        );
        Ok(matrix)
    }

    pub fn nrows(&self) -> usize {
        self.nrows
    }

    pub fn ncols(&self) -> usize {
        self.ncols
    }

    /// Stored non-zeros.
    pub fn nnz(&self) -> usize {
        self.nnz
    }

    /// Row partition table.
    pub fn partition(&self) -> &[usize] {
        &self.part
    }

    pub fn contexts(&self) -> &[Context] {
        &self.contexts
    }

    /// `y = alpha * A * x`, or `y += alpha * A * x` when `append` is set.
    ///
    /// `y` must be partitioned like the matrix rows. `x` may live anywhere;
    /// it is staged in full on every device before the first launch.
    #[tracing::instrument(skip_all, fields(rows = self.nrows, append))]
    pub fn mul(&self, x: &DeviceVector<T>, y: &DeviceVector<T>, alpha: T, append: bool) -> Result<()> {
        self.check_output(y)?;
        self.stage(x)?;
        self.launch(y, alpha, append)
    }

    /// Copy `x` into every device's staging buffer.
    ///
    /// Partitions of `x` on the same context are copied on the device; the
    /// rest go through one blocking host gather.
    pub(crate) fn stage(&self, x: &DeviceVector<T>) -> Result<()> {
        if x.len() != self.ncols {
            return Err(Error::BufferSizeMismatch {
                expected: self.ncols,
                actual: x.len(),
            });
        }
        let size = std::mem::size_of::<T>();
        let mut gathered: Option<Vec<T>> = None;

        for (d, shard) in self.shards.iter().enumerate() {
            let Some(shard) = shard else { continue };
            let ctx = &self.contexts[d];
            for p in x.active_devices() {
                let (lo, hi) = (x.part_start(p), x.part_start(p) + x.part_size(p));
                if x.contexts()[p].id() == ctx.id() {
                    ctx.backend()
                        .enqueue_copy(x.handle(p)?, shard.x, 0, lo * size, (hi - lo) * size)?;
                } else {
                    if gathered.is_none() {
                        gathered = Some(x.to_vec()?);
                    }
                    let host = gathered.as_deref().unwrap_or_default();
                    ctx.backend()
                        .enqueue_write(shard.x, lo * size, bytemuck::cast_slice(&host[lo..hi]))?;
                }
            }
        }
        // Later launches share the staging device's in-order queue.
        tracing::trace!(devices = self.shards.len(), host_gather = gathered.is_some(), "spmv_staged");
        Ok(())
    }

    /// Run the product on the staged input.
    pub(crate) fn launch(&self, y: &DeviceVector<T>, alpha: T, append: bool) -> Result<()> {
        self.check_output(y)?;
        let _perf = manifold_tracing::perf_span!("spmv", rows = self.nrows, nnz = self.nnz);

        let active: Vec<usize> = (0..self.shards.len()).filter(|&d| self.shards[d].is_some()).collect();
        let kernels = active
            .iter()
            .map(|&d| compiler::compile_spmv::<T>(&self.contexts[d]))
            .collect::<Result<Vec<_>>>()?;

        for (&d, kernel) in active.iter().zip(&kernels) {
            let Some(shard) = &self.shards[d] else { continue };
            let ctx = &self.contexts[d];
            let args = [
                KernelArg::Scalar(ScalarValue::U64(shard.rows as u64)),
                KernelArg::Scalar(alpha.to_value()),
                KernelArg::Scalar(ScalarValue::I32(i32::from(append))),
                KernelArg::Buffer(shard.row),
                KernelArg::Buffer(shard.col),
                KernelArg::Buffer(shard.val),
                KernelArg::Buffer(shard.x),
                KernelArg::Buffer(y.handle(d)?),
            ];
            let config = launch_config(ctx.info(), shard.rows, kernel.work_group_size());
            let event = ctx.backend().enqueue_kernel(kernel.kernel(), &args, config)?;
            y.record(d, event);
        }
        Ok(())
    }

    fn check_output(&self, y: &DeviceVector<T>) -> Result<()> {
        if y.partition() == self.part.as_slice() && same_contexts(y.contexts(), &self.contexts) {
            Ok(())
        } else {
            Err(Error::mismatch(format!(
                "output partition {:?} does not match matrix rows {:?}",
                y.partition(),
                self.part
            )))
        }
    }
}

fn validate_csr<T>(nrows: usize, ncols: usize, row_ptr: &[usize], col: &[usize], val: &[T]) -> Result<()> {
    if row_ptr.len() != nrows + 1 {
        return Err(Error::InvalidMatrix(format!(
            "{} row pointers for {nrows} rows",
            row_ptr.len()
        )));
    }
    if row_ptr[0] != 0 {
        return Err(Error::InvalidMatrix(format!("first row pointer is {}", row_ptr[0])));
    }
    if let Some(r) = row_ptr.windows(2).position(|w| w[0] > w[1]) {
        return Err(Error::InvalidMatrix(format!("row pointers decrease at row {r}")));
    }
    if col.len() != val.len() || row_ptr[nrows] != col.len() {
        return Err(Error::InvalidMatrix(format!(
            "row pointers end at {}, with {} columns and {} values",
            row_ptr[nrows],
            col.len(),
            val.len()
        )));
    }
    if let Some(&c) = col.iter().find(|&&c| c >= ncols) {
        return Err(Error::InvalidMatrix(format!("column {c} outside {ncols} columns")));
    }
    Ok(())
}

/// Allocate and fill one shard. Empty arrays still get one element.
fn upload<T: Scalar>(backend: &dyn Backend, rows: usize, ncols: usize, host: &HostShard<T>) -> Result<Shard> {
    let elem_size = std::mem::size_of::<T>();
    let layout = [
        (host.row.len(), 8, MemFlags::ReadOnly),
        (host.col.len(), 8, MemFlags::ReadOnly),
        (host.val.len(), elem_size, MemFlags::ReadOnly),
        (ncols, elem_size, MemFlags::ReadWrite),
    ];

    let mut buffers = Vec::with_capacity(layout.len());
    for (elements, size, flags) in layout {
        match backend.allocate_buffer(elements.max(1) * size, flags) {
            Ok(buffer) => buffers.push(buffer),
            Err(error) => {
                release(backend, &buffers);
                return Err(error.into());
            }
        }
    }
    let shard = Shard {
        rows,
        row: buffers[0],
        col: buffers[1],
        val: buffers[2],
        x: buffers[3],
    };

    let written = (|| -> Result<()> {
        let mut events = vec![backend.enqueue_write(shard.row, 0, bytemuck::cast_slice(&host.row))?];
        if !host.val.is_empty() {
            events.push(backend.enqueue_write(shard.col, 0, bytemuck::cast_slice(&host.col))?);
            events.push(backend.enqueue_write(shard.val, 0, bytemuck::cast_slice(&host.val))?);
        }
        wait_all(&events)?;
        Ok(())
    })();
    if let Err(error) = written {
        release(backend, &buffers);
        return Err(error);
    }
    Ok(shard)
}

/// Free buffers of a shard whose upload did not complete.
fn release(backend: &dyn Backend, buffers: &[BufferHandle]) {
    for &buffer in buffers {
        if let Err(error) = backend.free_buffer(buffer) {
            tracing::warn!(%buffer, error = %error, "failed to free matrix buffer");
        }
    }
}

impl<T: Scalar> Drop for SpMat<T> {
    fn drop(&mut self) {
        for (ctx, shard) in self.contexts.iter().zip(&self.shards) {
            let Some(shard) = shard else { continue };
            for buffer in [shard.row, shard.col, shard.val, shard.x] {
                if let Err(error) = ctx.backend().free_buffer(buffer) {
                    tracing::warn!(context = %ctx.id(), %buffer, error = %error, "failed to free matrix buffer");
                }
            }
        }
    }
}

impl<T: Scalar> fmt::Debug for SpMat<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpMat")
            .field("nrows", &self.nrows)
            .field("ncols", &self.ncols)
            .field("nnz", &self.nnz)
            .field("element_type", &T::cl_name())
            .field("part", &self.part)
            .finish()
    }
}

impl<'a, T: Scalar> Mul<&'a DeviceVector<T>> for &'a SpMat<T> {
    type Output = Expr<'a, T>;
    fn mul(self, x: &'a DeviceVector<T>) -> Expr<'a, T> {
        Expr::SpMv(self, x)
    }
}

/// `y = A * x`, `y = A * x + e`, `y = e + A * x`, `y = A * x - e`, `y = e - A * x`.
///
/// When `e` does not read `y`, the product is written first and `e` folded
/// in with a second kernel. Otherwise `x` is staged, `y` is set to `e` (or
/// `-e`), and the product is accumulated on top.
pub(crate) fn assign_with_product<T: Scalar>(y: &DeviceVector<T>, expr: &Expr<'_, T>) -> Result<()> {
    let (a, x, rest, op, product_first) = match expr {
        Expr::SpMv(a, x) => return a.mul(x, y, T::one(), false),
        Expr::Binary(op @ (BinaryOp::Add | BinaryOp::Sub), lhs, rhs) => match (&**lhs, &**rhs) {
            (Expr::SpMv(a, x), e) if !e.contains_spmv() => (*a, *x, e, *op, true),
            (e, Expr::SpMv(a, x)) if !e.contains_spmv() => (*a, *x, e, *op, false),
            _ => return Err(nested()),
        },
        _ => return Err(nested()),
    };
    for v in rest.vectors() {
        y.check_layout(v)?;
    }

    if !rest.references(y) {
        a.mul(x, y, T::one(), false)?;
        let combined = match (op, product_first) {
            (BinaryOp::Sub, false) => Expr::binary(BinaryOp::Sub, rest.clone(), y),
            _ => Expr::binary(op, y, rest.clone()),
        };
        return y.assign_expr(&combined);
    }

    a.stage(x)?;
    let (seed, alpha) = match (op, product_first) {
        (BinaryOp::Sub, true) => (-rest.clone(), T::one()),
        (BinaryOp::Sub, false) => (rest.clone(), T::one().negate()),
        _ => (rest.clone(), T::one()),
    };
    y.assign(seed)?;
    a.launch(y, alpha, true)
}

fn nested() -> Error {
    Error::unsupported(
        "a sparse matrix-vector product can only be the whole right-hand side, \
         or one side of a top-level sum or difference",
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{cpu_contexts, use_equal_partitioning};
    use manifold_backends::{BackendError, CpuBackend, DeviceInfo, DeviceKind};

    /// Tridiagonal `[-1, 2, -1]` of order `n`.
    fn laplacian(n: usize) -> (Vec<usize>, Vec<usize>, Vec<f64>) {
        let (mut row, mut col, mut val) = (vec![0], Vec::new(), Vec::new());
        for i in 0..n {
            for (j, v) in [(i.wrapping_sub(1), -1.0), (i, 2.0), (i + 1, -1.0)] {
                if j < n {
                    col.push(j);
                    val.push(v);
                }
            }
            row.push(col.len());
        }
        (row, col, val)
    }

    fn dense_product(n: usize, x: &[f64]) -> Vec<f64> {
        (0..n)
            .map(|i| {
                let left = if i > 0 { x[i - 1] } else { 0.0 };
                let right = if i + 1 < n { x[i + 1] } else { 0.0 };
                2.0 * x[i] - left - right
            })
            .collect()
    }

    #[test]
    fn identity_times_x_is_x() -> Result<()> {
        let contexts = cpu_contexts(2);
        let a = SpMat::new(&contexts, 4, 4, &[0, 1, 2, 3, 4], &[0, 1, 2, 3], &[1.0f32; 4])?;
        let x = DeviceVector::from_slice(&contexts, &[1.0, 2.0, 3.0, 4.0])?;
        let y = DeviceVector::new(&contexts, 4)?;
        y.assign(&a * &x)?;
        assert_eq!(y.to_vec()?, vec![1.0, 2.0, 3.0, 4.0]);
        assert_eq!((a.nrows(), a.ncols(), a.nnz()), (4, 4, 4));
        Ok(())
    }

    #[test]
    fn dense_ones_sum_the_input() -> Result<()> {
        let contexts = cpu_contexts(1);
        let a = SpMat::new(&contexts, 3, 3, &[0, 3, 6, 9], &[0, 1, 2, 0, 1, 2, 0, 1, 2], &[1i64; 9])?;
        let x = DeviceVector::from_slice(&contexts, &[1, 2, 3])?;
        let y = DeviceVector::new(&contexts, 3)?;
        a.mul(&x, &y, 1, false)?;
        assert_eq!(y.to_vec()?, vec![6, 6, 6]);
        a.mul(&x, &y, 2, true)?;
        assert_eq!(y.to_vec()?, vec![18, 18, 18]);
        Ok(())
    }

    #[test]
    fn rows_spread_over_devices() -> Result<()> {
        let contexts = cpu_contexts(3);
        let n = 100;
        let (row, col, val) = laplacian(n);
        let a = SpMat::new(&contexts, n, n, &row, &col, &val)?;
        let host: Vec<f64> = (0..n).map(|i| (i * i % 17) as f64).collect();
        let x = DeviceVector::from_slice(&contexts, &host)?;
        let y = DeviceVector::new(&contexts, n)?;

        y.assign(&a * &x)?;
        assert_eq!(y.to_vec()?, dense_product(n, &host));
        assert_eq!(a.partition(), x.partition());
        Ok(())
    }

    #[test]
    fn combined_forms_with_and_without_aliasing() -> Result<()> {
        let contexts = cpu_contexts(2);
        let n = 40;
        let (row, col, val) = laplacian(n);
        let a = SpMat::new(&contexts, n, n, &row, &col, &val)?;
        let xs: Vec<f64> = (0..n).map(|i| i as f64).collect();
        let rs: Vec<f64> = (0..n).map(|i| 100.0 - i as f64).collect();
        let ax = dense_product(n, &xs);
        let x = DeviceVector::from_slice(&contexts, &xs)?;
        let r = DeviceVector::from_slice(&contexts, &rs)?;
        let y = DeviceVector::new(&contexts, n)?;

        // `e` does not read `y`.
        y.assign(&a * &x + &r)?;
        assert_eq!(y.to_vec()?, (0..n).map(|i| ax[i] + rs[i]).collect::<Vec<_>>());
        y.assign(&a * &x - 2.0 * &r)?;
        assert_eq!(y.to_vec()?, (0..n).map(|i| ax[i] - 2.0 * rs[i]).collect::<Vec<_>>());
        y.assign(&r - &a * &x)?;
        assert_eq!(y.to_vec()?, (0..n).map(|i| rs[i] - ax[i]).collect::<Vec<_>>());

        // `e` reads `y`, and `x` is `y` itself.
        y.copy_from_host(&xs)?;
        y.assign(&y - &a * &y)?;
        assert_eq!(y.to_vec()?, (0..n).map(|i| xs[i] - ax[i]).collect::<Vec<_>>());

        y.copy_from_host(&xs)?;
        y.assign(&a * &y - &y)?;
        assert_eq!(y.to_vec()?, (0..n).map(|i| ax[i] - xs[i]).collect::<Vec<_>>());

        y.copy_from_host(&xs)?;
        y.assign(&y * 3.0 + &a * &x)?;
        assert_eq!(y.to_vec()?, (0..n).map(|i| 3.0 * xs[i] + ax[i]).collect::<Vec<_>>());
        Ok(())
    }

    #[test]
    fn unsigned_difference_wraps_like_the_host() -> Result<()> {
        let contexts = cpu_contexts(1);
        let a = SpMat::new(&contexts, 2, 2, &[0, 1, 2], &[0, 1], &[2u32, 3])?;
        let y = DeviceVector::from_slice(&contexts, &[10u32, 10])?;
        y.assign(&y - &a * &y)?;
        assert_eq!(y.to_vec()?, vec![10u32.wrapping_sub(20), 10u32.wrapping_sub(30)]);
        Ok(())
    }

    #[test]
    fn input_on_other_contexts_is_gathered() -> Result<()> {
        let rows = cpu_contexts(2);
        let elsewhere = cpu_contexts(1);
        let (row, col, val) = laplacian(8);
        let a = SpMat::new(&rows, 8, 8, &row, &col, &val)?;
        let host: Vec<f64> = (1..=8).map(f64::from).collect();
        let x = DeviceVector::from_slice(&elsewhere, &host)?;
        let y = DeviceVector::new(&rows, 8)?;

        a.mul(&x, &y, 0.5, false)?;
        let expected: Vec<f64> = dense_product(8, &host).into_iter().map(|v| 0.5 * v).collect();
        assert_eq!(y.to_vec()?, expected);
        Ok(())
    }

    #[test]
    fn malformed_input_is_rejected() {
        let contexts = cpu_contexts(1);
        let cases: [(&[usize], &[usize], &[f32]); 5] = [
            (&[0, 1], &[0], &[1.0]),
            (&[1, 1, 1], &[0], &[1.0]),
            (&[0, 2, 1], &[0, 1], &[1.0, 1.0]),
            (&[0, 1, 2], &[0, 1], &[1.0]),
            (&[0, 1, 2], &[0, 2], &[1.0, 1.0]),
        ];
        for (row, col, val) in cases {
            let result = SpMat::new(&contexts, 2, 2, row, col, val);
            assert!(matches!(result, Err(Error::InvalidMatrix(_))), "{row:?} {col:?}");
        }
    }

    #[test]
    fn products_elsewhere_in_the_tree_are_rejected() -> Result<()> {
        let contexts = cpu_contexts(1);
        let a = SpMat::new(&contexts, 2, 2, &[0, 1, 2], &[0, 1], &[1.0f32, 1.0])?;
        let x = DeviceVector::from_slice(&contexts, &[1.0, 2.0])?;
        let y = DeviceVector::new(&contexts, 2)?;

        assert!(matches!(y.assign(2.0 * (&a * &x)), Err(Error::UnsupportedExpression(_))));
        assert!(matches!(y.assign(&a * &x + &a * &x), Err(Error::UnsupportedExpression(_))));
        assert!(matches!(
            y.assign(crate::expr::sqrt(&a * &x)),
            Err(Error::UnsupportedExpression(_))
        ));
        assert!(matches!(crate::reduce::sum(&a * &x), Err(Error::UnsupportedExpression(_))));
        Ok(())
    }

    #[test]
    fn shapes_must_agree() -> Result<()> {
        let contexts = cpu_contexts(2);
        let (row, col, val) = laplacian(6);
        let a = SpMat::new(&contexts, 6, 6, &row, &col, &val)?;
        let short = DeviceVector::<f64>::new(&contexts, 5)?;
        let y = DeviceVector::<f64>::new(&contexts, 6)?;
        assert!(matches!(a.mul(&short, &y, 1.0, false), Err(Error::BufferSizeMismatch { .. })));
        assert!(matches!(a.mul(&y, &short, 1.0, false), Err(Error::PartitionMismatch(_))));
        Ok(())
    }

    #[test]
    fn buffers_are_released_on_drop() -> Result<()> {
        let contexts = cpu_contexts(1);
        let backend = contexts[0].downcast::<CpuBackend>().unwrap();
        let a = SpMat::new(&contexts, 2, 2, &[0, 0, 0], &[], &[] as &[f32])?;
        assert_eq!(backend.live_buffers(), 4);
        drop(a);
        assert_eq!(backend.live_buffers(), 0);
        Ok(())
    }

    #[test]
    fn failed_upload_frees_partial_shard() {
        use_equal_partitioning();
        // Row offsets, columns and values fit (56 bytes); the staging vector does not.
        let info = DeviceInfo::new("tight", DeviceKind::Cpu).with_global_mem_bytes(60);
        let contexts = vec![Context::new(CpuBackend::with_info(info))];
        let backend = contexts[0].downcast::<CpuBackend>().unwrap();

        let err = SpMat::new(&contexts, 2, 2, &[0, 1, 2], &[0, 1], &[1.0f64, 1.0]).unwrap_err();
        assert!(matches!(err, Error::Backend(BackendError::AllocationFailed { size: 16, .. })));
        assert_eq!(backend.live_buffers(), 0);
    }
}
