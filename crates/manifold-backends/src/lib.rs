//! Device contexts for manifold
//!
//! This crate provides:
//! - **Backend trait**: one device context with one in-order command queue
//! - **Events**: completion markers returned by every enqueue
//! - **CPU backend**: simulated device that builds and interprets kernel source
//! - **CUDA backend**: NVRTC build and launch of the same source (`cuda` feature)
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                 manifold-core (vectors,                 │
//! │           expression compiler, dispatch, spmv)          │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │  kernel source + KernelArg lists
//!                       ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │                     Backend trait                       │
//! │  buffers · transfers · build · launch · events · finish │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │
//!              ┌────────┴────────┐
//!              ▼                 ▼
//!        ┌──────────┐      ┌──────────┐
//!        │   CPU    │      │   CUDA   │
//!        │ (sim.)   │      │ Backend  │
//!        └──────────┘      └──────────┘
//! ```
//!
//! # Usage
//!
//! ```rust
//! use manifold_backends::{Backend, CpuBackend, MemFlags};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let backend = CpuBackend::new();
//! let buffer = backend.allocate_buffer(16, MemFlags::ReadWrite)?;
//! backend.enqueue_write(buffer, 0, bytemuck::cast_slice(&[1u32, 2, 3, 4]))?;
//!
//! let mut out = [0u32; 4];
//! backend.enqueue_read(buffer, 0, bytemuck::cast_slice_mut(&mut out))?.wait()?;
//! assert_eq!(out, [1, 2, 3, 4]);
//!
//! backend.free_buffer(buffer)?;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod backends;
pub mod error;
pub mod event;
pub mod kernel_lang;

pub use backend::{
    Backend, BufferHandle, DeviceInfo, DeviceKind, KernelArg, KernelHandle, LaunchConfig, MemFlags, ProgramHandle,
    ScalarType, ScalarValue,
};
pub use backends::{CpuBackend, CudaBackend};
pub use error::{BackendError, Result};
pub use event::{wait_all, Event};
