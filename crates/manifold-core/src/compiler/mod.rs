//! Expression-to-kernel compiler
//!
//! On a cache miss for `(shape, context)` the tree is lowered to kernel
//! source in one traversal, built on the context, and the kernel handle is
//! stored together with its work-group size. Cache hits skip all of that.
//!
//! Build failures surface as [`Error::Build`] with the device compiler's
//! log, unmodified. Nothing is retried.

pub mod cache;
mod codegen;

use std::sync::Arc;
use std::time::Instant;

use manifold_backends::{BackendError, ProgramHandle};

pub use cache::{CacheStats, CompiledKernel, KernelCache};

use crate::config::RuntimeConfig;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::expr::{Expr, Shape};
use crate::instrumentation::CompilationMetrics;
use crate::reduce::ReduceOp;
use crate::scalar::Scalar;

/// Preferred work-group size before device limits apply.
pub const MAX_WORK_GROUP_SIZE: usize = 1024;

/// Kernel for `expr` on `ctx`, built on first use.
pub fn compile<T: Scalar>(expr: &Expr<'_, T>, ctx: &Context) -> Result<Arc<CompiledKernel>> {
    let shape = expr.shape();
    KernelCache::global().get_or_build(&shape, ctx.id(), || {
        let kernel = codegen::expression_kernel(expr, &shape)?;
        build_kernel(ctx, &kernel.name, &kernel.source)
    })
}

/// Source that [`compile`] would build for `expr`.
pub fn expression_source<T: Scalar>(expr: &Expr<'_, T>) -> Result<String> {
    Ok(codegen::expression_kernel(expr, &expr.shape())?.source)
}

pub(crate) fn reduction_shape<T: Scalar>(expr: &Expr<'_, T>, op: ReduceOp) -> Shape {
    Shape::new(format!("reduce_{}_{}", op.token(), expr.shape()))
}

pub(crate) fn compile_reduction<T: Scalar>(expr: &Expr<'_, T>, op: ReduceOp, ctx: &Context) -> Result<Arc<CompiledKernel>> {
    let shape = reduction_shape(expr, op);
    KernelCache::global().get_or_build(&shape, ctx.id(), || {
        let kernel = codegen::reduction_kernel(expr, op, &shape)?;
        build_kernel(ctx, &kernel.name, &kernel.source)
    })
}

pub(crate) fn compile_spmv<T: Scalar>(ctx: &Context) -> Result<Arc<CompiledKernel>> {
    let shape = Shape::new(format!("spmv_{}", T::cl_name()));
    KernelCache::global().get_or_build(&shape, ctx.id(), || {
        let kernel = codegen::spmv_kernel::<T>(&shape);
        build_kernel(ctx, &kernel.name, &kernel.source)
    })
}

/// Build raw kernel source on `ctx`, outside the expression grammar.
///
/// Pair with [`DeviceVector::buffer`](crate::DeviceVector::buffer) and the
/// context's backend to launch hand-written kernels.
pub fn build_sources(ctx: &Context, source: &str) -> Result<ProgramHandle> {
    build_program(ctx, "<user source>", source)
}

fn build_program(ctx: &Context, kernel: &str, source: &str) -> Result<ProgramHandle> {
    if RuntimeConfig::global().show_kernels {
        println!("{source}");
    }
    tracing::debug!(context = %ctx.id(), kernel, source, "kernel_source");

    ctx.backend().build_program(source).map_err(|error| match error {
        BackendError::BuildFailed { log } => {
            tracing::error!(context = %ctx.id(), kernel, log = %log, "kernel_build_failed");
            Error::Build {
                kernel: kernel.to_string(),
                log,
            }
        }
        other => Error::Backend(other),
    })
}

fn build_kernel(ctx: &Context, name: &str, source: &str) -> Result<CompiledKernel> {
    let start = Instant::now();
    let program = build_program(ctx, name, source)?;
    let kernel = ctx.backend().create_kernel(program, name)?;
    let work_group_size = work_group_size(ctx.backend().kernel_work_group_size(kernel)?);

    CompilationMetrics::new(name, ctx.id().get(), source.len(), work_group_size, start).log();
    Ok(CompiledKernel {
        name: name.to_string(),
        program,
        kernel,
        work_group_size,
    })
}

/// [`MAX_WORK_GROUP_SIZE`] halved until it fits `limit`.
pub fn work_group_size(limit: usize) -> usize {
    let mut size = MAX_WORK_GROUP_SIZE;
    while size > limit && size > 1 {
        size /= 2;
    }
    size
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::cpu_contexts;
    use crate::vector::DeviceVector;
    use manifold_backends::{CpuBackend, DeviceInfo, DeviceKind, KernelArg, LaunchConfig, ScalarValue};

    #[test]
    fn work_group_size_halves_to_the_limit() {
        assert_eq!(work_group_size(4096), 1024);
        assert_eq!(work_group_size(1024), 1024);
        assert_eq!(work_group_size(1000), 512);
        assert_eq!(work_group_size(256), 256);
        assert_eq!(work_group_size(3), 2);
        assert_eq!(work_group_size(0), 1);
    }

    #[test]
    fn device_limit_sets_the_cached_work_group_size() {
        crate::test_support::use_equal_partitioning();
        let info = DeviceInfo::new("small", DeviceKind::Gpu).with_max_work_group_size(96);
        let contexts = Context::simulated(1, &info);
        let x = DeviceVector::<f32>::new(&contexts, 4).unwrap();

        let kernel = compile(&(&x * 3.0), &contexts[0]).unwrap();
        assert_eq!(kernel.work_group_size(), 64);
        assert_eq!(kernel.name(), "vexpr_float_mul_v_c");
    }

    #[test]
    fn same_shape_builds_once_per_context() {
        let contexts = cpu_contexts(2);
        let x = DeviceVector::<u64>::new(&contexts[..1], 4).unwrap();
        let y = DeviceVector::<u64>::new(&contexts[..1], 4).unwrap();

        let a = compile(&(&x + &y), &contexts[0]).unwrap();
        let b = compile(&(&y + &x), &contexts[0]).unwrap();
        let c = compile(&(&x + &y), &contexts[1]).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));

        let built = |ctx: &Context| ctx.downcast::<CpuBackend>().unwrap().programs_built();
        assert_eq!(built(&contexts[0]), 1);
        assert_eq!(built(&contexts[1]), 1);
    }

    #[test]
    fn hand_written_kernels_run_on_native_buffers() -> Result<()> {
        const SOURCE: &str = "kernel void twice_plus(ulong n, global int *x, int k) {\n\
                                  for(size_t i = get_global_id(0); i < n; i += get_global_size(0)) x[i] = 2 * x[i] + k;\n\
                              }";
        let contexts = cpu_contexts(3);
        let v = DeviceVector::from_slice(&contexts, &(0..100).collect::<Vec<i32>>())?;

        for (d, ctx) in contexts.iter().enumerate() {
            let Some(buffer) = v.buffer(d) else { continue };
            let program = build_sources(ctx, SOURCE)?;
            let kernel = ctx.backend().create_kernel(program, "twice_plus")?;
            let args = [
                KernelArg::Scalar(ScalarValue::U64(v.part_size(d) as u64)),
                KernelArg::Buffer(buffer),
                KernelArg::Scalar(ScalarValue::I32(d as i32)),
            ];
            ctx.backend().enqueue_kernel(kernel, &args, LaunchConfig::new(64, 64))?.wait()?;
        }

        let expected: Vec<i32> = (0..100)
            .map(|i| 2 * i + v.partition().partition_point(|&start| start <= i as usize) as i32 - 1)
            .collect();
        assert_eq!(v.to_vec()?, expected);
        Ok(())
    }

    #[test]
    fn build_errors_keep_the_device_log() {
        let contexts = cpu_contexts(1);
        let err = build_sources(&contexts[0], "kernel void broken(ulong n) { n = ; }").unwrap_err();
        match err {
            Error::Build { kernel, log } => {
                assert_eq!(kernel, "<user source>");
                assert!(log.starts_with("1:") && log.contains("error:"), "{log}");
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
