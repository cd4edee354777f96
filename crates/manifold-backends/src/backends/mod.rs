//! Backend implementations for different devices
//!
//! This module contains:
//! - `cpu` - Simulated device (reference implementation)
//! - `cuda` - CUDA GPU backend (NVIDIA GPUs, `cuda` feature)

pub mod cpu;
pub mod cuda;

pub use cpu::CpuBackend;
pub use cuda::CudaBackend;
