//! CUDA backend implementation for NVIDIA GPUs
//!
//! Builds the same kernel source the CPU backend accepts by prepending a
//! header that maps the OpenCL-C vocabulary onto CUDA, compiling with NVRTC
//! and launching through `cudarc`.
//!
//! # Architecture
//!
//! ```text
//! CudaBackend
//! ├── Device   - CUDA device and its default stream (the in-order queue)
//! ├── Buffers  - CudaSlice<u8> per handle
//! └── Kernels  - PTX modules loaded per built program
//! ```
//!
//! Transfers are synchronous with respect to the stream and return
//! completed events; launches are asynchronous and surface their errors at
//! [`Backend::finish`].
//!
//! # Usage
//!
//! ```rust,ignore
//! use manifold_backends::{Backend, CudaBackend};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let backend = CudaBackend::new(0)?;
//! println!("{} with {} SMs", backend.info().name, backend.info().compute_units);
//! # Ok(())
//! # }
//! ```

use crate::error::{BackendError, Result};

#[cfg(feature = "cuda")]
use crate::backend::{
    Backend, BufferHandle, DeviceInfo, DeviceKind, KernelArg, KernelHandle, LaunchConfig, MemFlags, ProgramHandle,
    ScalarValue,
};
#[cfg(feature = "cuda")]
use crate::event::Event;
#[cfg(feature = "cuda")]
use parking_lot::{Mutex, RwLock};
#[cfg(feature = "cuda")]
use std::collections::HashMap;
#[cfg(feature = "cuda")]
use std::sync::atomic::{AtomicU64, Ordering};
#[cfg(feature = "cuda")]
use std::sync::Arc;

#[cfg(feature = "cuda")]
use cudarc::driver::{
    sys::CUdevice_attribute, CudaDevice, CudaFunction, CudaSlice, DevicePtr, DeviceSlice, LaunchAsync,
    LaunchConfig as CudaLaunchConfig,
};
#[cfg(feature = "cuda")]
use cudarc::nvrtc::{compile_ptx_with_opts, CompileOptions};

/// Prepended to every program so OpenCL-C kernels build as CUDA.
#[cfg(any(feature = "cuda", test))]
const COMPAT_HEADER: &str = r#"
#define kernel extern "C" __global__
#define __kernel extern "C" __global__
#define global
#define __global
#define restrict __restrict__
#define INFINITY __int_as_float(0x7f800000)
typedef unsigned int uint;
typedef unsigned long long ulong;
__device__ inline size_t get_global_id(int d) { return d == 0 ? (size_t)blockIdx.x * blockDim.x + threadIdx.x : 0; }
__device__ inline size_t get_global_size(int d) { return d == 0 ? (size_t)gridDim.x * blockDim.x : 1; }
__device__ inline size_t get_local_id(int d) { return d == 0 ? threadIdx.x : 0; }
__device__ inline size_t get_local_size(int d) { return d == 0 ? blockDim.x : 1; }
__device__ inline size_t get_group_id(int d) { return d == 0 ? blockIdx.x : 0; }
__device__ inline size_t get_num_groups(int d) { return d == 0 ? gridDim.x : 1; }
"#;

/// Kernel entry point names declared in `source`, in order.
#[cfg(any(feature = "cuda", test))]
fn kernel_names(source: &str) -> Vec<String> {
    let mut names = Vec::new();
    let mut rest = source;
    while let Some(at) = rest.find("kernel void ") {
        let after = &rest[at + "kernel void ".len()..];
        let name: String = after
            .chars()
            .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
            .collect();
        if !name.is_empty() {
            names.push(name);
        }
        rest = after;
    }
    names
}

#[cfg(feature = "cuda")]
struct CudaKernel {
    function: CudaFunction,
}

/// CUDA backend
///
/// One device, launched on its default stream.
#[cfg(feature = "cuda")]
pub struct CudaBackend {
    device: Arc<CudaDevice>,
    info: DeviceInfo,
    max_threads_per_block: usize,
    buffers: RwLock<HashMap<u64, CudaSlice<u8>>>,
    programs: RwLock<HashMap<u64, Vec<String>>>,
    kernels: RwLock<HashMap<u64, CudaKernel>>,
    next_id: AtomicU64,
    // Serializes module loading; cudarc keys modules by name.
    load_lock: Mutex<()>,
}

#[cfg(feature = "cuda")]
fn driver_error(operation: &str, error: impl std::fmt::Display) -> BackendError {
    BackendError::command_failed(operation, error)
}

#[cfg(feature = "cuda")]
impl CudaBackend {
    /// Open the CUDA device with the given ordinal.
    ///
    /// # Errors
    ///
    /// Returns an error if no such device exists or the driver fails to
    /// initialize.
    pub fn new(ordinal: usize) -> Result<Self> {
        let device = CudaDevice::new(ordinal).map_err(|e| driver_error("CUDA device initialization", e))?;

        let attribute = |attr| {
            device
                .attribute(attr)
                .map(|v| v.max(1) as usize)
                .map_err(|e| driver_error("CUDA attribute query", e))
        };
        let compute_units = attribute(CUdevice_attribute::CU_DEVICE_ATTRIBUTE_MULTIPROCESSOR_COUNT)?;
        let max_threads_per_block = attribute(CUdevice_attribute::CU_DEVICE_ATTRIBUTE_MAX_THREADS_PER_BLOCK)?;
        let name = device.name().map_err(|e| driver_error("CUDA device name", e))?;

        let info = DeviceInfo::new(name, DeviceKind::Gpu)
            .with_compute_units(compute_units)
            .with_max_work_group_size(max_threads_per_block);

        tracing::info!(
            device = %info.name,
            compute_units = info.compute_units,
            max_work_group_size = info.max_work_group_size,
            "cuda_device_opened"
        );

        Ok(Self {
            device,
            info,
            max_threads_per_block,
            buffers: RwLock::new(HashMap::new()),
            programs: RwLock::new(HashMap::new()),
            kernels: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            load_lock: Mutex::new(()),
        })
    }

    /// Check if CUDA is available on this system
    pub fn is_available() -> bool {
        CudaDevice::new(0).is_ok()
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn checked(&self, handle: BufferHandle, offset: usize, size: usize) -> Result<usize> {
        let buffers = self.buffers.read();
        let buffer = buffers
            .get(&handle.id())
            .ok_or(BackendError::InvalidBufferHandle(handle.id()))?;
        let buffer_size = buffer.len();
        match offset.checked_add(size) {
            Some(end) if end <= buffer_size => Ok(end),
            _ => Err(BackendError::BufferOutOfBounds {
                offset,
                size,
                buffer_size,
            }),
        }
    }
}

#[cfg(feature = "cuda")]
impl Backend for CudaBackend {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn allocate_buffer(&self, size: usize, _flags: MemFlags) -> Result<BufferHandle> {
        let slice = self
            .device
            .alloc_zeros::<u8>(size.max(1))
            .map_err(|e| BackendError::AllocationFailed {
                size,
                reason: e.to_string(),
            })?;
        let id = self.next_id();
        self.buffers.write().insert(id, slice);
        Ok(BufferHandle::new(id))
    }

    fn free_buffer(&self, handle: BufferHandle) -> Result<()> {
        self.buffers
            .write()
            .remove(&handle.id())
            .map(|_| ())
            .ok_or(BackendError::InvalidBufferHandle(handle.id()))
    }

    fn buffer_size(&self, handle: BufferHandle) -> Result<usize> {
        self.buffers
            .read()
            .get(&handle.id())
            .map(|b| b.len())
            .ok_or(BackendError::InvalidBufferHandle(handle.id()))
    }

    fn enqueue_write(&self, handle: BufferHandle, offset: usize, data: &[u8]) -> Result<Event> {
        let end = self.checked(handle, offset, data.len())?;
        let mut buffers = self.buffers.write();
        let buffer = buffers
            .get_mut(&handle.id())
            .ok_or(BackendError::InvalidBufferHandle(handle.id()))?;
        let mut view = buffer.slice_mut(offset..end);
        self.device
            .htod_sync_copy_into(data, &mut view)
            .map_err(|e| driver_error("host to device copy", e))?;
        Ok(Event::completed())
    }

    fn enqueue_read(&self, handle: BufferHandle, offset: usize, data: &mut [u8]) -> Result<Event> {
        let end = self.checked(handle, offset, data.len())?;
        let buffers = self.buffers.read();
        let buffer = buffers
            .get(&handle.id())
            .ok_or(BackendError::InvalidBufferHandle(handle.id()))?;
        let view = buffer.slice(offset..end);
        self.device
            .dtoh_sync_copy_into(&view, data)
            .map_err(|e| driver_error("device to host copy", e))?;
        Ok(Event::completed())
    }

    fn enqueue_copy(
        &self,
        src: BufferHandle,
        dst: BufferHandle,
        src_offset: usize,
        dst_offset: usize,
        size: usize,
    ) -> Result<Event> {
        let src_end = self.checked(src, src_offset, size)?;
        let dst_end = self.checked(dst, dst_offset, size)?;

        // Stage through the host when source and destination coincide.
        if src == dst {
            let mut staged = vec![0u8; size];
            self.enqueue_read(src, src_offset, &mut staged)?;
            return self.enqueue_write(dst, dst_offset, &staged);
        }

        let mut buffers = self.buffers.write();
        let mut target = buffers
            .remove(&dst.id())
            .ok_or(BackendError::InvalidBufferHandle(dst.id()))?;
        let result = match buffers.get(&src.id()) {
            Some(source) => {
                let view = source.slice(src_offset..src_end);
                let mut out = target.slice_mut(dst_offset..dst_end);
                self.device
                    .dtod_copy(&view, &mut out)
                    .map_err(|e| driver_error("device to device copy", e))
            }
            None => Err(BackendError::InvalidBufferHandle(src.id())),
        };
        buffers.insert(dst.id(), target);
        result.map(|_| Event::completed())
    }

    fn build_program(&self, source: &str) -> Result<ProgramHandle> {
        let full = format!("{COMPAT_HEADER}\n{source}");
        let options = CompileOptions {
            options: vec!["-default-device".to_string()],
            ..Default::default()
        };
        let ptx = compile_ptx_with_opts(full, options).map_err(|e| BackendError::BuildFailed { log: e.to_string() })?;

        let id = self.next_id();
        let module = format!("manifold_prog_{id}");
        let names = kernel_names(source);
        // Module function names must be 'static; programs live for the
        // whole process, like the kernel cache that owns them.
        let leaked: Vec<&'static str> = names.iter().map(|n| &*Box::leak(n.clone().into_boxed_str())).collect();

        let _guard = self.load_lock.lock();
        self.device
            .load_ptx(ptx, &module, &leaked)
            .map_err(|e| driver_error("PTX load", e))?;
        self.programs.write().insert(id, names);
        Ok(ProgramHandle::new(id))
    }

    fn create_kernel(&self, program: ProgramHandle, name: &str) -> Result<KernelHandle> {
        let programs = self.programs.read();
        let names = programs
            .get(&program.id())
            .ok_or(BackendError::InvalidProgramHandle(program.id()))?;
        if !names.iter().any(|n| n == name) {
            return Err(BackendError::KernelNotFound(name.to_string()));
        }
        let module = format!("manifold_prog_{}", program.id());
        let function = self
            .device
            .get_func(&module, name)
            .ok_or_else(|| BackendError::KernelNotFound(name.to_string()))?;

        let id = self.next_id();
        self.kernels.write().insert(id, CudaKernel { function });
        Ok(KernelHandle::new(id))
    }

    fn kernel_work_group_size(&self, kernel: KernelHandle) -> Result<usize> {
        if self.kernels.read().contains_key(&kernel.id()) {
            Ok(self.max_threads_per_block)
        } else {
            Err(BackendError::InvalidKernelHandle(kernel.id()))
        }
    }

    fn enqueue_kernel(&self, kernel: KernelHandle, args: &[KernelArg], config: LaunchConfig) -> Result<Event> {
        config.validate()?;
        let function = self
            .kernels
            .read()
            .get(&kernel.id())
            .map(|k| k.function.clone())
            .ok_or(BackendError::InvalidKernelHandle(kernel.id()))?;

        let buffers = self.buffers.read();
        // Argument storage must outlive the launch call.
        let mut pointers: Vec<u64> = Vec::with_capacity(args.len());
        let mut scalars: Vec<Vec<u8>> = Vec::with_capacity(args.len());
        for arg in args {
            match arg {
                KernelArg::Buffer(handle) => {
                    let buffer = buffers
                        .get(&handle.id())
                        .ok_or(BackendError::InvalidBufferHandle(handle.id()))?;
                    pointers.push(*buffer.device_ptr());
                }
                KernelArg::Scalar(value) => scalars.push(ScalarValue::to_le_bytes(value)),
            }
        }

        let (mut p, mut s) = (0, 0);
        let mut params: Vec<*mut std::ffi::c_void> = Vec::with_capacity(args.len());
        for arg in args {
            match arg {
                KernelArg::Buffer(_) => {
                    params.push(&mut pointers[p] as *mut u64 as *mut std::ffi::c_void);
                    p += 1;
                }
                KernelArg::Scalar(_) => {
                    params.push(scalars[s].as_mut_ptr() as *mut std::ffi::c_void);
                    s += 1;
                }
            }
        }

        let cfg = CudaLaunchConfig {
            grid_dim: (config.num_groups() as u32, 1, 1),
            block_dim: (config.local_size as u32, 1, 1),
            shared_mem_bytes: 0,
        };
        // SAFETY: `params` points at storage that lives until the launch
        // call returns, and the argument kinds were produced from `args` in
        // signature order.
        unsafe { function.launch(cfg, &mut params[..]) }.map_err(|e| driver_error("kernel launch", e))?;
        Ok(Event::completed())
    }

    fn finish(&self) -> Result<()> {
        self.device.synchronize().map_err(|e| driver_error("stream synchronize", e))
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

#[cfg(not(feature = "cuda"))]
pub struct CudaBackend;

#[cfg(not(feature = "cuda"))]
impl CudaBackend {
    pub fn new(_ordinal: usize) -> Result<Self> {
        Err(BackendError::UnsupportedOperation(
            "CUDA backend requires 'cuda' feature to be enabled".into(),
        ))
    }

    pub fn is_available() -> bool {
        false
    }
}
