//! Expression assignment: argument binding and per-device launches
//!
//! For every device owning a non-empty partition of the target, the cached
//! kernel is bound as `(n, res, terminals...)` and enqueued without waiting.
//! The call returns once every launch is queued; [`DeviceVector::finish`]
//! or a blocking read synchronizes.

use std::time::Instant;

use manifold_backends::{BufferHandle, DeviceInfo, KernelArg, LaunchConfig, ScalarValue};

use crate::compiler;
use crate::error::Result;
use crate::expr::{BinaryOp, Expr, Terminal};
use crate::instrumentation::ExecutionMetrics;
use crate::scalar::Scalar;
use crate::spmat;
use crate::util::alignup;
use crate::vector::DeviceVector;

/// Occupancy multiplier for non-CPU devices.
const GPU_WAVES: usize = 4;

/// Launch grid for `psize` elements with work-groups of `wg`.
///
/// CPU-class devices get one work-item per element, rounded up to whole
/// groups. Other devices get a fixed grid and rely on the grid-strided loop.
pub(crate) fn launch_config(info: &DeviceInfo, psize: usize, wg: usize) -> LaunchConfig {
    let global = if info.is_cpu() {
        alignup(psize, wg)
    } else {
        info.compute_units * wg * GPU_WAVES
    };
    LaunchConfig::new(global.max(wg), wg)
}

/// Kernel arguments for device `d`: element count, output, then terminals.
pub(crate) fn bind_args<T: Scalar>(
    d: usize,
    psize: usize,
    output: BufferHandle,
    terminals: &[Terminal<'_, T>],
) -> Result<Vec<KernelArg>> {
    let mut args = Vec::with_capacity(terminals.len() + 2);
    args.push(KernelArg::Scalar(ScalarValue::U64(psize as u64)));
    args.push(KernelArg::Buffer(output));
    for terminal in terminals {
        args.push(match terminal {
            Terminal::Vector(v) => KernelArg::Buffer(v.handle(d)?),
            Terminal::Constant(c) => KernelArg::Scalar(c.to_value()),
        });
    }
    Ok(args)
}

impl<T: Scalar> DeviceVector<T> {
    /// `self = expr`, evaluated on the devices.
    ///
    /// Every vector in `expr` must share this vector's contexts and partition.
    /// A sparse matrix-vector product is only accepted at the top of the tree
    /// (see [`SpMat`](crate::SpMat)).
    #[tracing::instrument(skip_all, fields(elements = self.len(), devices = self.nparts()))]
    pub fn assign<'a>(&self, expr: impl Into<Expr<'a, T>>) -> Result<()>
    where
        T: 'a,
    {
        let expr = expr.into();
        match &expr {
            Expr::Vector(v) if std::ptr::eq(*v, self) => Ok(()),
            Expr::Vector(v) => self.assign_vector(v),
            e if e.contains_spmv() => spmat::assign_with_product(self, e),
            e => self.assign_expr(e),
        }
    }

    /// Generic fused-kernel path.
    pub(crate) fn assign_expr(&self, expr: &Expr<'_, T>) -> Result<()> {
        let terminals = expr.terminals();
        for v in expr.vectors() {
            self.check_layout(v)?;
        }

        let start = Instant::now();
        let active: Vec<usize> = self.active_devices().collect();
        let kernels = active
            .iter()
            .map(|&d| compiler::compile(expr, &self.contexts()[d]))
            .collect::<Result<Vec<_>>>()?;

        for (&d, kernel) in active.iter().zip(&kernels) {
            let ctx = &self.contexts()[d];
            let psize = self.part_size(d);
            let args = bind_args(d, psize, self.handle(d)?, &terminals)?;
            let config = launch_config(ctx.info(), psize, kernel.work_group_size());
            let event = ctx.backend().enqueue_kernel(kernel.kernel(), &args, config)?;
            self.record(d, event);
        }

        if let Some(kernel) = kernels.first() {
            ExecutionMetrics::new(kernel.name(), self.len(), kernels.len(), start).log();
        }
        Ok(())
    }

    /// `self = self op expr`.
    pub fn assign_op<'a>(&'a self, op: BinaryOp, expr: impl Into<Expr<'a, T>>) -> Result<()> {
        self.assign(Expr::binary(op, self, expr))
    }

    pub fn assign_add<'a>(&'a self, expr: impl Into<Expr<'a, T>>) -> Result<()> {
        self.assign_op(BinaryOp::Add, expr)
    }

    pub fn assign_sub<'a>(&'a self, expr: impl Into<Expr<'a, T>>) -> Result<()> {
        self.assign_op(BinaryOp::Sub, expr)
    }

    pub fn assign_mul<'a>(&'a self, expr: impl Into<Expr<'a, T>>) -> Result<()> {
        self.assign_op(BinaryOp::Mul, expr)
    }

    pub fn assign_div<'a>(&'a self, expr: impl Into<Expr<'a, T>>) -> Result<()> {
        self.assign_op(BinaryOp::Div, expr)
    }

    pub fn assign_rem<'a>(&'a self, expr: impl Into<Expr<'a, T>>) -> Result<()> {
        self.assign_op(BinaryOp::Rem, expr)
    }

    /// Set every element to `value`.
    pub fn fill(&self, value: T) -> Result<()> {
        self.assign(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::expr::{cos, sqrt, UserFunction};
    use crate::test_support::{cpu_contexts, use_equal_partitioning};
    use crate::Context;
    use manifold_backends::{CpuBackend, DeviceKind};

    #[test]
    fn launch_size_depends_on_device_class() {
        let cpu = DeviceInfo::new("cpu", DeviceKind::Cpu).with_compute_units(8);
        let gpu = DeviceInfo::new("gpu", DeviceKind::Gpu).with_compute_units(8);
        assert_eq!(launch_config(&cpu, 1000, 256), LaunchConfig::new(1024, 256));
        assert_eq!(launch_config(&cpu, 1, 256), LaunchConfig::new(256, 256));
        assert_eq!(launch_config(&gpu, 1000, 256), LaunchConfig::new(8 * 256 * 4, 256));
        assert_eq!(launch_config(&gpu, 10_000_000, 64), LaunchConfig::new(8 * 64 * 4, 64));
    }

    #[test]
    fn fused_expression_over_three_devices() -> Result<()> {
        let contexts = cpu_contexts(3);
        let xs: Vec<f32> = (0..200).map(|i| i as f32).collect();
        let ys: Vec<f32> = (0..200).map(|i| (i % 7) as f32).collect();
        let x = DeviceVector::from_slice(&contexts, &xs)?;
        let y = DeviceVector::from_slice(&contexts, &ys)?;
        let z = DeviceVector::new(&contexts, 200)?;

        z.assign(sqrt(2.0 * &x) + cos(&y))?;
        let out = z.to_vec()?;
        for i in 0..200 {
            let expected = (2.0 * xs[i]).sqrt() + ys[i].cos();
            assert!((out[i] - expected).abs() < 1e-5, "{i}: {} vs {expected}", out[i]);
        }
        Ok(())
    }

    #[test]
    fn gpu_class_grid_covers_the_partition() -> Result<()> {
        use_equal_partitioning();
        let info = DeviceInfo::new("sim-gpu", DeviceKind::Gpu)
            .with_compute_units(2)
            .with_max_work_group_size(16);
        let contexts = Context::simulated(2, &info);
        let x = DeviceVector::from_slice(&contexts, &(0..1000).collect::<Vec<i64>>())?;
        let y = DeviceVector::new(&contexts, 1000)?;

        // 2 * 16 * 4 = 128 work-items per device, each striding over ~500 elements.
        y.assign(&x * 3i64 - 1i64)?;
        assert_eq!(y.to_vec()?, (0..1000).map(|i| i * 3 - 1).collect::<Vec<i64>>());
        Ok(())
    }

    #[test]
    fn compound_assignment_reads_the_target() -> Result<()> {
        let contexts = cpu_contexts(2);
        let x = DeviceVector::from_slice(&contexts, &[10u32; 40])?;
        let y = DeviceVector::from_slice(&contexts, &[3u32; 40])?;

        x.assign_add(&y)?;
        x.assign_mul(2u32)?;
        x.assign_rem(7u32)?;
        x.assign_sub(1u32)?;
        x.assign_div(&y)?;
        assert_eq!(x.to_vec()?, vec![(((10 + 3) * 2) % 7 - 1) / 3; 40]);

        x.assign(&x - &x)?;
        assert_eq!(x.to_vec()?, vec![0; 40]);
        Ok(())
    }

    #[test]
    fn fill_and_copy_assignment() -> Result<()> {
        let contexts = cpu_contexts(2);
        let x = DeviceVector::<f64>::new(&contexts, 33)?;
        let y = DeviceVector::<f64>::new(&contexts, 33)?;
        x.fill(2.5)?;
        y.assign(&x)?;
        assert_eq!(y.to_vec()?, vec![2.5; 33]);
        Ok(())
    }

    #[test]
    fn mismatched_operands_are_rejected_before_launch() -> Result<()> {
        let contexts = cpu_contexts(2);
        let x = DeviceVector::<f32>::new(&contexts, 64)?;
        let shorter = DeviceVector::<f32>::new(&contexts, 48)?;
        let elsewhere = DeviceVector::<f32>::new(&cpu_contexts(2), 64)?;

        assert!(matches!(x.assign(&shorter + 1.0), Err(Error::PartitionMismatch(_))));
        assert!(matches!(x.assign(&elsewhere * 2.0), Err(Error::PartitionMismatch(_))));
        let launched: usize = contexts
            .iter()
            .map(|c| c.downcast::<CpuBackend>().unwrap().kernels_launched())
            .sum();
        assert_eq!(launched, 0);
        Ok(())
    }

    #[test]
    fn user_functions_run_on_the_device() -> Result<()> {
        let contexts = cpu_contexts(1);
        let axpy = UserFunction::<f64>::new("axpy", &["a", "x", "y"], "return a * x + y;")?;
        let x = DeviceVector::from_slice(&contexts, &[1.0, 2.0, 3.0])?;
        let y = DeviceVector::from_slice(&contexts, &[0.5, 0.5, 0.5])?;
        let z = DeviceVector::new(&contexts, 3)?;

        z.assign(axpy.call([Expr::from(2.0), Expr::from(&x), Expr::from(&y)]))?;
        assert_eq!(z.to_vec()?, vec![2.5, 4.5, 6.5]);
        Ok(())
    }

    #[test]
    fn build_errors_abort_the_assignment() -> Result<()> {
        let contexts = cpu_contexts(1);
        let broken = UserFunction::<f32>::new("broken", &["a"], "return a +;")?;
        let x = DeviceVector::<f32>::new(&contexts, 4)?;
        let err = x.assign(broken.call([&x])).unwrap_err();
        match err {
            Error::Build { kernel, log } => {
                assert!(kernel.starts_with("vexpr_float_u6broken1x"));
                assert!(log.contains("error:"));
            }
            other => panic!("unexpected {other:?}"),
        }
        Ok(())
    }
}
