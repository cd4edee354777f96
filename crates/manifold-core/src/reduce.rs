//! Reductions of vector expressions to a single scalar
//!
//! Each device folds its partition into one partial per work-item, the
//! partials are read back, and the host folds them in device order. The
//! host fold is sequential, so repeated reductions of the same data give
//! bit-identical results.
//!
//! ```rust
//! use manifold_core::{Context, DeviceVector, ReduceOp, Reductor};
//!
//! # fn main() -> manifold_core::Result<()> {
//! let contexts = vec![Context::cpu()];
//! let x = DeviceVector::from_slice(&contexts, &[1.0f64, -4.0, 2.5])?;
//! let max = Reductor::new(&contexts, ReduceOp::Max)?;
//! assert_eq!(max.apply(&x)?, 2.5);
//! assert_eq!(manifold_core::sum(&x * &x)?, 23.25);
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::marker::PhantomData;
use std::time::Instant;

use manifold_backends::{wait_all, BufferHandle, MemFlags};

use crate::compiler::{self, MAX_WORK_GROUP_SIZE};
use crate::context::{same_contexts, Context};
use crate::dispatch::bind_args;
use crate::error::{Error, Result};
use crate::expr::Expr;
use crate::instrumentation::ExecutionMetrics;
use crate::scalar::Scalar;
use crate::util::alignup;

const GPU_WAVES: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReduceOp {
    Sum,
    Max,
    Min,
}

impl ReduceOp {
    pub fn token(self) -> &'static str {
        match self {
            ReduceOp::Sum => "sum",
            ReduceOp::Max => "max",
            ReduceOp::Min => "min",
        }
    }

    /// Neutral element on the host.
    pub fn identity<T: Scalar>(self) -> T {
        match self {
            ReduceOp::Sum => T::zero(),
            ReduceOp::Max => T::lowest(),
            ReduceOp::Min => T::highest(),
        }
    }

    pub fn fold<T: Scalar>(self, acc: T, value: T) -> T {
        match self {
            ReduceOp::Sum => Scalar::add(acc, value),
            ReduceOp::Max => acc.max_of(value),
            ReduceOp::Min => acc.min_of(value),
        }
    }

    /// Neutral element as kernel source.
    pub(crate) fn identity_literal<T: Scalar>(self) -> &'static str {
        match self {
            ReduceOp::Sum => "0",
            ReduceOp::Max => T::min_literal(),
            ReduceOp::Min => T::max_literal(),
        }
    }

    pub(crate) fn combine_source(self, acc: &str, value: &str) -> String {
        match self {
            ReduceOp::Sum => format!("{acc} + ({value})"),
            ReduceOp::Max => format!("max({acc}, {value})"),
            ReduceOp::Min => format!("min({acc}, {value})"),
        }
    }
}

impl fmt::Display for ReduceOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

/// Reusable reduction over a fixed list of contexts.
///
/// Owns one buffer of partial results per context, sized for the largest
/// grid the context can be given.
pub struct Reductor<T: Scalar> {
    contexts: Vec<Context>,
    op: ReduceOp,
    partials: Vec<BufferHandle>,
    capacity: Vec<usize>,
    _marker: PhantomData<T>,
}

impl<T: Scalar> Reductor<T> {
    pub fn new(contexts: &[Context], op: ReduceOp) -> Result<Self> {
        let mut reductor = Self {
            contexts: contexts.to_vec(),
            op,
            partials: Vec::with_capacity(contexts.len()),
            capacity: Vec::with_capacity(contexts.len()),
            _marker: PhantomData,
        };
        for ctx in contexts {
            let info = ctx.info();
            let waves = if info.is_cpu() { 1 } else { GPU_WAVES };
            let capacity = info.compute_units.max(1) * MAX_WORK_GROUP_SIZE.min(info.max_work_group_size) * waves;
            let buffer = ctx
                .backend()
                .allocate_buffer(capacity * std::mem::size_of::<T>(), MemFlags::ReadWrite)?;
            // Pushed one at a time so Drop frees whatever was allocated.
            reductor.partials.push(buffer);
            reductor.capacity.push(capacity);
        }
        Ok(reductor)
    }

    pub fn op(&self) -> ReduceOp {
        self.op
    }

    pub fn contexts(&self) -> &[Context] {
        &self.contexts
    }

    /// Reduce `expr` over every element of its vectors.
    ///
    /// The expression must read at least one vector, and all of its vectors
    /// must be partitioned over this reductor's contexts. Empty vectors
    /// reduce to the identity of the operation.
    #[tracing::instrument(skip_all, fields(op = %self.op))]
    pub fn apply<'a>(&self, expr: impl Into<Expr<'a, T>>) -> Result<T>
    where
        T: 'a,
    {
        let expr = expr.into();
        if expr.contains_spmv() {
            return Err(Error::unsupported("sparse matrix-vector products cannot be reduced"));
        }
        let vectors = expr.vectors();
        let Some(&layout) = vectors.first() else {
            return Err(Error::unsupported("a reduction needs at least one vector operand"));
        };
        for v in &vectors[1..] {
            layout.check_layout(v)?;
        }
        if !same_contexts(layout.contexts(), &self.contexts) {
            return Err(Error::mismatch(format!(
                "vectors live on {} contexts, reductor on {} others",
                layout.nparts(),
                self.contexts.len()
            )));
        }

        let start = Instant::now();
        let active: Vec<usize> = layout.active_devices().collect();
        let kernels = active
            .iter()
            .map(|&d| compiler::compile_reduction(&expr, self.op, &self.contexts[d]))
            .collect::<Result<Vec<_>>>()?;

        let terminals = expr.terminals();
        let mut grids = Vec::with_capacity(active.len());
        for (&d, kernel) in active.iter().zip(&kernels) {
            let ctx = &self.contexts[d];
            let psize = layout.part_size(d);
            let wg = kernel.work_group_size();
            let global = self.grid(d, psize, wg)?;
            let args = bind_args(d, psize, self.partials[d], &terminals)?;
            let event = ctx
                .backend()
                .enqueue_kernel(kernel.kernel(), &args, manifold_backends::LaunchConfig::new(global, wg))?;
            grids.push((d, global, event));
        }

        let mut result = self.op.identity::<T>();
        for (d, global, launched) in grids {
            let mut host = vec![T::zero(); global];
            let read = self.contexts[d]
                .backend()
                .enqueue_read(self.partials[d], 0, bytemuck::cast_slice_mut(&mut host))?;
            wait_all([&launched, &read])?;
            result = host.into_iter().fold(result, |acc, v| self.op.fold(acc, v));
        }

        if let Some(kernel) = kernels.first() {
            ExecutionMetrics::new(kernel.name(), layout.len(), kernels.len(), start).log();
        }
        Ok(result)
    }

    /// Work-items for device `d`: never more than its partials buffer holds.
    fn grid(&self, d: usize, psize: usize, wg: usize) -> Result<usize> {
        let info = self.contexts[d].info();
        let capacity = self.capacity[d];
        if wg > capacity {
            return Err(Error::InvalidOperation(format!(
                "work-group of {wg} exceeds {capacity} partials on device {d}"
            )));
        }
        let global = if info.is_cpu() {
            alignup(psize, wg).min(info.compute_units.max(1) * wg)
        } else {
            info.compute_units.max(1) * wg * GPU_WAVES
        };
        Ok(global.min(capacity / wg * wg).max(wg))
    }
}

impl<T: Scalar> Drop for Reductor<T> {
    fn drop(&mut self) {
        for (ctx, &buffer) in self.contexts.iter().zip(&self.partials) {
            if let Err(error) = ctx.backend().free_buffer(buffer) {
                tracing::warn!(context = %ctx.id(), %buffer, error = %error, "failed to free reduction partials");
            }
        }
    }
}

impl<T: Scalar> fmt::Debug for Reductor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reductor")
            .field("op", &self.op)
            .field("element_type", &T::cl_name())
            .field("capacity", &self.capacity)
            .finish()
    }
}

fn reduce_with<'a, T: Scalar>(op: ReduceOp, expr: Expr<'a, T>) -> Result<T> {
    let Some(first) = expr.vectors().first().copied() else {
        return Err(Error::unsupported("a reduction needs at least one vector operand"));
    };
    Reductor::new(first.contexts(), op)?.apply(expr)
}

/// Sum of `expr` over the contexts of its first vector.
pub fn sum<'a, T: Scalar>(expr: impl Into<Expr<'a, T>>) -> Result<T> {
    reduce_with(ReduceOp::Sum, expr.into())
}

pub fn max<'a, T: Scalar>(expr: impl Into<Expr<'a, T>>) -> Result<T> {
    reduce_with(ReduceOp::Max, expr.into())
}

pub fn min<'a, T: Scalar>(expr: impl Into<Expr<'a, T>>) -> Result<T> {
    reduce_with(ReduceOp::Min, expr.into())
}
