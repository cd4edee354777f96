//! # manifold-core - Distributed Vector Expressions
//!
//! Vectors partitioned over several device contexts, combined with ordinary
//! Rust operators and evaluated by kernels generated and built at run time.
//!
//! ## Architecture
//!
//! ```text
//!   z.assign(sqrt(2.0 * &x) + cos(&y))
//!                 │
//!                 ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │  Expr tree: operators, builtins, user functions, A * x  │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │  shape ("float_add_sqrt_mul_c_v_cos_v")
//!                       ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │  KernelCache: (shape, context) -> built kernel          │
//! │  miss: codegen -> build -> work-group size              │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │  one launch per non-empty partition
//!              ┌────────┼────────┐
//!              ▼        ▼        ▼
//!          ┌──────┐ ┌──────┐ ┌──────┐
//!          │ ctx0 │ │ ctx1 │ │ ctx2 │   manifold-backends
//!          └──────┘ └──────┘ └──────┘
//! ```
//!
//! - [`DeviceVector`]: one logical vector, one buffer per context
//! - [`partition`]: how elements are split; equal or throughput-weighted
//! - [`compiler`]: shape encoding, source generation and the kernel cache
//! - [`SpMat`]: CSR matrices with row-partitioned products
//! - [`Reductor`]: sum, min and max of any element-wise expression
//!
//! ## Example
//!
//! ```rust
//! use manifold_core::{expr::cos, expr::sqrt, Context, DeviceVector};
//!
//! # fn main() -> manifold_core::Result<()> {
//! let contexts = vec![Context::cpu()];
//! let x = DeviceVector::from_slice(&contexts, &[0.5f32, 2.0, 8.0])?;
//! let y = DeviceVector::from_slice(&contexts, &[0.0f32, 0.0, 0.0])?;
//! let z = DeviceVector::new(&contexts, 3)?;
//!
//! z.assign(sqrt(2.0 * &x) + cos(&y))?;
//! assert_eq!(z.to_vec()?, vec![2.0, 3.0, 5.0]);
//! assert_eq!(manifold_core::sum(&z)?, 10.0);
//! # Ok(())
//! # }
//! ```
//!
//! ## Configuration
//!
//! [`RuntimeConfig`] is read once from `MANIFOLD_SHOW_KERNELS`,
//! `MANIFOLD_PARTITION` (`perf` or `equal`) and `MANIFOLD_ALIGNMENT`.

pub mod compiler;
pub mod config;
pub mod context;
mod dispatch;
pub mod error;
pub mod expr;
pub mod instrumentation;
pub mod partition;
pub mod reduce;
pub mod scalar;
pub mod spmat;
pub mod util;
pub mod vector;

// Re-export primary types
pub use compiler::{CacheStats, CompiledKernel, KernelCache};
pub use config::{PartitionPolicy, RuntimeConfig};
pub use context::{Context, ContextId};
pub use error::{Error, Result};
pub use expr::{BinaryOp, Builtin, Expr, Shape, UnaryOp, UserFunction};
pub use partition::{partition_by_vector_perf, partition_equally, set_partitioning, PartitionFn};
pub use reduce::{max, min, sum, ReduceOp, Reductor};
pub use scalar::Scalar;
pub use spmat::SpMat;
pub use vector::{copy_from_host, copy_range_from_host, copy_range_to_host, copy_to_host, DeviceRange, DeviceVector};

pub use manifold_backends as backends;

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Once;

    use crate::context::Context;
    use crate::partition::{partition_equally, set_partitioning};

    /// Latch equal partitioning before any test partitions a vector, so unit
    /// tests never run the throughput probe.
    pub(crate) fn use_equal_partitioning() {
        static INSTALL: Once = Once::new();
        INSTALL.call_once(|| {
            let _ = set_partitioning(partition_equally);
        });
    }

    /// `n` fresh CPU contexts.
    pub(crate) fn cpu_contexts(n: usize) -> Vec<Context> {
        use_equal_partitioning();
        (0..n).map(|_| Context::cpu()).collect()
    }
}
