//! CPU backend implementation
//!
//! Simulated device used as the reference implementation of [`Backend`].
//!
//! # Architecture
//!
//! ```text
//! CpuBackend
//! ├── CommandQueue   - worker thread executing writes, copies, launches in order
//! ├── MemoryManager  - host vectors standing in for device buffers
//! ├── Programs       - kernel source built by the kernel language front end
//! └── Kernels        - entry points, launched by interpreting each work-item
//! ```
//!
//! The reported [`DeviceInfo`] is configurable, so a `CpuBackend` can pose
//! as a GPU-class device with a given compute unit count and work-group
//! limit. Each instance has its own queue; separate instances run
//! concurrently.
//!
//! # Usage
//!
//! ```rust
//! use manifold_backends::{Backend, CpuBackend, DeviceInfo, DeviceKind};
//!
//! let cpu = CpuBackend::new();
//! assert!(cpu.info().is_cpu());
//!
//! let gpu_like = CpuBackend::with_info(
//!     DeviceInfo::new("sim-gpu", DeviceKind::Gpu)
//!         .with_compute_units(8)
//!         .with_max_work_group_size(256),
//! );
//! assert_eq!(gpu_like.info().max_work_group_size, 256);
//! ```

pub(crate) mod memory;
mod queue;

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::backend::{
    Backend, BufferHandle, DeviceInfo, DeviceKind, KernelArg, KernelHandle, LaunchConfig, MemFlags, ProgramHandle,
};
use crate::error::{BackendError, Result};
use crate::event::Event;
use crate::kernel_lang::{self, Program, Value, VarType};
use memory::MemoryManager;
use queue::CommandQueue;

#[derive(Clone)]
struct KernelEntry {
    name: String,
    program: Arc<Program>,
    index: usize,
}

struct CpuState {
    info: DeviceInfo,
    memory: RwLock<MemoryManager>,
    /// Buffer sizes as seen by callers; updated at enqueue time.
    allocations: RwLock<HashMap<u64, usize>>,
    programs: RwLock<HashMap<u64, Arc<Program>>>,
    kernels: RwLock<HashMap<u64, KernelEntry>>,
    next_id: AtomicU64,
    programs_built: AtomicUsize,
    kernels_launched: AtomicUsize,
}

impl CpuState {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn allocation(&self, handle: BufferHandle) -> Result<usize> {
        self.allocations
            .read()
            .get(&handle.id())
            .copied()
            .ok_or(BackendError::InvalidBufferHandle(handle.id()))
    }

    fn check_range(&self, handle: BufferHandle, offset: usize, size: usize) -> Result<()> {
        let buffer_size = self.allocation(handle)?;
        match offset.checked_add(size) {
            Some(end) if end <= buffer_size => Ok(()),
            _ => Err(BackendError::BufferOutOfBounds {
                offset,
                size,
                buffer_size,
            }),
        }
    }
}

/// CPU backend simulating one device context and its queue.
pub struct CpuBackend {
    state: Arc<CpuState>,
    queue: CommandQueue,
}

fn describe(param: VarType) -> String {
    match param {
        VarType::Scalar(ty) => ty.to_string(),
        VarType::Pointer(ty) => format!("global {ty} *"),
    }
}

impl CpuBackend {
    /// Create a CPU-class device sized to this machine.
    pub fn new() -> Self {
        let compute_units = std::thread::available_parallelism().map_or(1, |n| n.get());
        Self::with_info(
            DeviceInfo::new("manifold-cpu", DeviceKind::Cpu)
                .with_compute_units(compute_units)
                .with_max_work_group_size(1024)
                .with_global_mem_bytes(1 << 32),
        )
    }

    /// Create a simulated device that reports `info`.
    pub fn with_info(info: DeviceInfo) -> Self {
        let queue = CommandQueue::new(info.name.clone());
        Self {
            state: Arc::new(CpuState {
                info,
                memory: RwLock::new(MemoryManager::new()),
                allocations: RwLock::new(HashMap::new()),
                programs: RwLock::new(HashMap::new()),
                kernels: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                programs_built: AtomicUsize::new(0),
                kernels_launched: AtomicUsize::new(0),
            }),
            queue,
        }
    }

    /// Number of programs successfully built on this device.
    pub fn programs_built(&self) -> usize {
        self.state.programs_built.load(Ordering::SeqCst)
    }

    /// Number of kernel launches enqueued on this device.
    pub fn kernels_launched(&self) -> usize {
        self.state.kernels_launched.load(Ordering::SeqCst)
    }

    /// Number of buffers currently allocated.
    pub fn live_buffers(&self) -> usize {
        self.state.allocations.read().len()
    }

    fn bind_args(&self, entry: &KernelEntry, args: &[KernelArg]) -> Result<Vec<Value>> {
        let function = entry.program.function(entry.index);
        if args.len() != function.params.len() {
            return Err(BackendError::InvalidKernelArgs(format!(
                "kernel '{}' takes {} arguments, {} given",
                entry.name,
                function.params.len(),
                args.len()
            )));
        }

        function
            .params
            .iter()
            .zip(args)
            .enumerate()
            .map(|(i, (param, arg))| match (*param, *arg) {
                (VarType::Pointer(elem), KernelArg::Buffer(handle)) => {
                    self.state.allocation(handle)?;
                    Ok(Value::Ptr {
                        buffer: handle.id(),
                        elem,
                    })
                }
                (VarType::Scalar(ty), KernelArg::Scalar(value)) if value.scalar_type() == ty => Ok(Value::from(value)),
                (param, arg) => Err(BackendError::InvalidKernelArgs(format!(
                    "argument {i} of kernel '{}' expects {}, got {:?}",
                    entry.name,
                    describe(param),
                    arg
                ))),
            })
            .collect()
    }
}

impl Default for CpuBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CpuBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CpuBackend").field("info", &self.state.info).finish()
    }
}

impl Backend for CpuBackend {
    fn info(&self) -> &DeviceInfo {
        &self.state.info
    }

    fn allocate_buffer(&self, size: usize, _flags: MemFlags) -> Result<BufferHandle> {
        let id = self.state.next_id();
        {
            let mut allocations = self.state.allocations.write();
            let limit = self.state.info.global_mem_bytes;
            let used: usize = allocations.values().sum();
            if limit > 0 && (used as u64).saturating_add(size as u64) > limit {
                return Err(BackendError::AllocationFailed {
                    size,
                    reason: format!("{used} of {limit} bytes in use"),
                });
            }
            allocations.insert(id, size);
        }
        let state = Arc::clone(&self.state);
        self.queue.submit(
            "allocate",
            Box::new(move || {
                state.memory.write().insert(id, size);
                Ok(())
            }),
        )?;
        Ok(BufferHandle::new(id))
    }

    fn free_buffer(&self, handle: BufferHandle) -> Result<()> {
        self.state
            .allocations
            .write()
            .remove(&handle.id())
            .ok_or(BackendError::InvalidBufferHandle(handle.id()))?;
        let state = Arc::clone(&self.state);
        self.queue
            .submit("free", Box::new(move || state.memory.write().remove(handle.id())))?;
        Ok(())
    }

    fn buffer_size(&self, handle: BufferHandle) -> Result<usize> {
        self.state.allocation(handle)
    }

    fn enqueue_write(&self, handle: BufferHandle, offset: usize, data: &[u8]) -> Result<Event> {
        self.state.check_range(handle, offset, data.len())?;
        let state = Arc::clone(&self.state);
        let data = data.to_vec();
        self.queue.submit(
            "write",
            Box::new(move || state.memory.write().write(handle.id(), offset, &data)),
        )
    }

    fn enqueue_read(&self, handle: BufferHandle, offset: usize, data: &mut [u8]) -> Result<Event> {
        self.state.check_range(handle, offset, data.len())?;
        // The host slice cannot outlive this call, so the read runs in queue
        // order right here.
        self.queue.drain()?;
        self.state.memory.read().read(handle.id(), offset, data)?;
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
        self.state.check_range(src, src_offset, size)?;
        self.state.check_range(dst, dst_offset, size)?;
        let state = Arc::clone(&self.state);
        self.queue.submit(
            "copy",
            Box::new(move || {
                state
                    .memory
                    .write()
                    .copy(src.id(), dst.id(), src_offset, dst_offset, size)
            }),
        )
    }

    fn build_program(&self, source: &str) -> Result<ProgramHandle> {
        let program = kernel_lang::compile(source).map_err(|e| BackendError::BuildFailed { log: e.to_string() })?;
        let id = self.state.next_id();
        tracing::debug!(
            device = %self.state.info.name,
            program = id,
            kernels = ?program.kernel_names().collect::<Vec<_>>(),
            "program_built"
        );
        self.state.programs.write().insert(id, Arc::new(program));
        self.state.programs_built.fetch_add(1, Ordering::SeqCst);
        Ok(ProgramHandle::new(id))
    }

    fn create_kernel(&self, program: ProgramHandle, name: &str) -> Result<KernelHandle> {
        let program = self
            .state
            .programs
            .read()
            .get(&program.id())
            .cloned()
            .ok_or(BackendError::InvalidProgramHandle(program.id()))?;
        let index = program
            .kernel(name)
            .ok_or_else(|| BackendError::KernelNotFound(name.to_string()))?;

        let id = self.state.next_id();
        self.state.kernels.write().insert(
            id,
            KernelEntry {
                name: name.to_string(),
                program,
                index,
            },
        );
        Ok(KernelHandle::new(id))
    }

    fn kernel_work_group_size(&self, kernel: KernelHandle) -> Result<usize> {
        if self.state.kernels.read().contains_key(&kernel.id()) {
            Ok(self.state.info.max_work_group_size)
        } else {
            Err(BackendError::InvalidKernelHandle(kernel.id()))
        }
    }

    fn enqueue_kernel(&self, kernel: KernelHandle, args: &[KernelArg], config: LaunchConfig) -> Result<Event> {
        let entry = self
            .state
            .kernels
            .read()
            .get(&kernel.id())
            .cloned()
            .ok_or(BackendError::InvalidKernelHandle(kernel.id()))?;
        config.validate()?;
        if config.local_size > self.state.info.max_work_group_size {
            return Err(BackendError::InvalidLaunchConfig(format!(
                "local size {} exceeds device limit {}",
                config.local_size, self.state.info.max_work_group_size
            )));
        }
        let values = self.bind_args(&entry, args)?;

        self.state.kernels_launched.fetch_add(1, Ordering::SeqCst);
        tracing::trace!(device = %self.state.info.name, kernel = %entry.name, grid = %config, "kernel_enqueued");

        let state = Arc::clone(&self.state);
        self.queue.submit(
            "kernel launch",
            Box::new(move || {
                let mut memory = state.memory.write();
                kernel_lang::launch(
                    &entry.program,
                    entry.index,
                    &values,
                    config.global_size,
                    config.local_size,
                    &mut *memory,
                )
                .map_err(|e| BackendError::command_failed(format!("kernel '{}'", entry.name), e))
            }),
        )
    }

    fn finish(&self) -> Result<()> {
        self.queue.finish()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ScalarValue;

    const SCALE: &str = "kernel void scale(ulong n, global float *x, float a) {\n\
                             for(size_t i = get_global_id(0); i < n; i += get_global_size(0)) x[i] *= a;\n\
                         }";

    fn upload(backend: &CpuBackend, data: &[f32]) -> BufferHandle {
        let buffer = backend.allocate_buffer(data.len() * 4, MemFlags::ReadWrite).unwrap();
        backend.enqueue_write(buffer, 0, bytemuck::cast_slice(data)).unwrap();
        buffer
    }

    fn download(backend: &CpuBackend, buffer: BufferHandle, len: usize) -> Vec<f32> {
        let mut out = vec![0.0f32; len];
        backend
            .enqueue_read(buffer, 0, bytemuck::cast_slice_mut(&mut out))
            .unwrap()
            .wait()
            .unwrap();
        out
    }

    #[test]
    fn launches_a_built_kernel() {
        let backend = CpuBackend::new();
        let buffer = upload(&backend, &[1.0, 2.0, 3.0]);
        let kernel = backend
            .create_kernel(backend.build_program(SCALE).unwrap(), "scale")
            .unwrap();
        let args = [
            KernelArg::Scalar(ScalarValue::U64(3)),
            KernelArg::Buffer(buffer),
            KernelArg::Scalar(ScalarValue::F32(10.0)),
        ];
        backend.enqueue_kernel(kernel, &args, LaunchConfig::new(2, 1)).unwrap();

        assert_eq!(download(&backend, buffer, 3), vec![10.0, 20.0, 30.0]);
        assert_eq!(backend.programs_built(), 1);
        assert_eq!(backend.kernels_launched(), 1);
        backend.finish().unwrap();
    }

    #[test]
    fn build_errors_carry_the_log() {
        let backend = CpuBackend::new();
        match backend.build_program("kernel void k(global float *x) { x[0] = y; }") {
            Err(BackendError::BuildFailed { log }) => assert!(log.contains("undeclared identifier 'y'")),
            other => panic!("expected build failure, got {other:?}"),
        }
        assert_eq!(backend.programs_built(), 0);
    }

    #[test]
    fn argument_mismatches_are_rejected_before_queueing() {
        let backend = CpuBackend::new();
        let buffer = upload(&backend, &[1.0]);
        let kernel = backend
            .create_kernel(backend.build_program(SCALE).unwrap(), "scale")
            .unwrap();

        let wrong_type = [
            KernelArg::Scalar(ScalarValue::U64(1)),
            KernelArg::Buffer(buffer),
            KernelArg::Scalar(ScalarValue::F64(1.0)),
        ];
        assert!(matches!(
            backend.enqueue_kernel(kernel, &wrong_type, LaunchConfig::new(1, 1)),
            Err(BackendError::InvalidKernelArgs(_))
        ));
        assert!(matches!(
            backend.enqueue_kernel(kernel, &wrong_type[..2], LaunchConfig::new(1, 1)),
            Err(BackendError::InvalidKernelArgs(_))
        ));
        assert_eq!(backend.kernels_launched(), 0);
    }

    #[test]
    fn device_failures_surface_on_the_event_and_finish() {
        let backend = CpuBackend::new();
        let buffer = upload(&backend, &[1.0, 2.0]);
        let kernel = backend
            .create_kernel(backend.build_program(SCALE).unwrap(), "scale")
            .unwrap();
        // n larger than the buffer walks off the end.
        let args = [
            KernelArg::Scalar(ScalarValue::U64(8)),
            KernelArg::Buffer(buffer),
            KernelArg::Scalar(ScalarValue::F32(2.0)),
        ];
        let event = backend.enqueue_kernel(kernel, &args, LaunchConfig::new(8, 8)).unwrap();
        assert!(matches!(event.wait(), Err(BackendError::CommandFailed { .. })));
        assert!(backend.finish().is_err());
        assert!(backend.finish().is_ok());
    }

    #[test]
    fn copies_and_frees_follow_queue_order() {
        let backend = CpuBackend::new();
        let a = upload(&backend, &[1.0, 2.0, 3.0, 4.0]);
        let b = backend.allocate_buffer(16, MemFlags::ReadWrite).unwrap();
        backend.enqueue_copy(a, b, 4, 0, 8).unwrap();
        backend.free_buffer(a).unwrap();

        assert_eq!(download(&backend, b, 4), vec![2.0, 3.0, 0.0, 0.0]);
        assert_eq!(backend.live_buffers(), 1);
        assert!(matches!(
            backend.buffer_size(a),
            Err(BackendError::InvalidBufferHandle(_))
        ));
    }

    #[test]
    fn allocations_respect_reported_memory() {
        let backend = CpuBackend::with_info(DeviceInfo::new("tight", DeviceKind::Cpu).with_global_mem_bytes(64));
        let a = backend.allocate_buffer(48, MemFlags::ReadWrite).unwrap();
        assert!(matches!(
            backend.allocate_buffer(32, MemFlags::ReadWrite),
            Err(BackendError::AllocationFailed { size: 32, .. })
        ));
        backend.free_buffer(a).unwrap();
        assert!(backend.allocate_buffer(64, MemFlags::ReadWrite).is_ok());
    }

    #[test]
    fn transfers_are_bounds_checked_synchronously() {
        let backend = CpuBackend::new();
        let buffer = backend.allocate_buffer(8, MemFlags::ReadWrite).unwrap();
        assert!(matches!(
            backend.enqueue_write(buffer, 4, &[0u8; 8]),
            Err(BackendError::BufferOutOfBounds { .. })
        ));
        assert!(backend.enqueue_read(buffer, 0, &mut [0u8; 9]).is_err());
    }

    #[test]
    fn launch_is_limited_by_device_work_group_size() {
        let backend = CpuBackend::with_info(DeviceInfo::new("small", DeviceKind::Gpu).with_max_work_group_size(64));
        let kernel = backend
            .create_kernel(backend.build_program(SCALE).unwrap(), "scale")
            .unwrap();
        assert_eq!(backend.kernel_work_group_size(kernel).unwrap(), 64);
        let buffer = upload(&backend, &[1.0]);
        let args = [
            KernelArg::Scalar(ScalarValue::U64(1)),
            KernelArg::Buffer(buffer),
            KernelArg::Scalar(ScalarValue::F32(2.0)),
        ];
        assert!(backend.enqueue_kernel(kernel, &args, LaunchConfig::new(128, 128)).is_err());
    }

    #[test]
    fn unknown_kernel_name_is_reported() {
        let backend = CpuBackend::new();
        let program = backend.build_program(SCALE).unwrap();
        assert_eq!(
            backend.create_kernel(program, "missing").unwrap_err(),
            BackendError::KernelNotFound("missing".into())
        );
    }
}
