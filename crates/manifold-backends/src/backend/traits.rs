//! Backend trait: one device context with one in-order command queue.

use std::any::Any;

use super::types::{BufferHandle, DeviceInfo, KernelArg, KernelHandle, LaunchConfig, MemFlags, ProgramHandle};
use crate::error::Result;
use crate::event::Event;

/// One device context and its command queue.
///
/// Commands enqueued on the same backend execute in enqueue order. Nothing
/// orders commands across backends; callers synchronize through the
/// returned [`Event`]s or [`Backend::finish`].
///
/// All methods take `&self` so a backend can be shared behind an `Arc` by
/// every vector, matrix and cache entry that targets it.
///
/// ```rust
/// use manifold_backends::{Backend, CpuBackend, KernelArg, LaunchConfig, MemFlags, ScalarValue};
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let backend = CpuBackend::new();
/// let buffer = backend.allocate_buffer(4 * 4, MemFlags::ReadWrite)?;
/// backend.enqueue_write(buffer, 0, bytemuck::cast_slice(&[1.0f32, 2.0, 3.0, 4.0]))?;
///
/// let program = backend.build_program(
///     "kernel void twice(ulong n, global float *x) {\n\
///          for(size_t i = get_global_id(0); i < n; i += get_global_size(0)) x[i] *= 2;\n\
///      }",
/// )?;
/// let kernel = backend.create_kernel(program, "twice")?;
/// let args = [KernelArg::Scalar(ScalarValue::U64(4)), KernelArg::Buffer(buffer)];
/// backend.enqueue_kernel(kernel, &args, LaunchConfig::new(4, 4))?;
///
/// let mut out = [0.0f32; 4];
/// backend.enqueue_read(buffer, 0, bytemuck::cast_slice_mut(&mut out))?.wait()?;
/// assert_eq!(out, [2.0, 4.0, 6.0, 8.0]);
/// # Ok(())
/// # }
/// ```
pub trait Backend: Send + Sync {
    // ============================================================================================
    // Device
    // ============================================================================================

    fn info(&self) -> &DeviceInfo;

    // ============================================================================================
    // Buffer Management
    // ============================================================================================

    /// Allocate `size` bytes of zeroed device memory.
    fn allocate_buffer(&self, size: usize, flags: MemFlags) -> Result<BufferHandle>;

    /// Release a buffer once every command already enqueued has run.
    fn free_buffer(&self, handle: BufferHandle) -> Result<()>;

    fn buffer_size(&self, handle: BufferHandle) -> Result<usize>;

    // ============================================================================================
    // Transfers
    // ============================================================================================

    /// Copy `data` into the buffer at byte `offset`.
    ///
    /// The data is captured before returning; the call never waits for the
    /// device.
    fn enqueue_write(&self, handle: BufferHandle, offset: usize, data: &[u8]) -> Result<Event>;

    /// Copy buffer bytes starting at `offset` into `data`.
    ///
    /// `data` holds the result once the returned event completes. Backends
    /// that cannot keep the host borrow past the call run the transfer in
    /// queue order before returning a completed event.
    fn enqueue_read(&self, handle: BufferHandle, offset: usize, data: &mut [u8]) -> Result<Event>;

    /// Device-side copy of `size` bytes.
    fn enqueue_copy(
        &self,
        src: BufferHandle,
        dst: BufferHandle,
        src_offset: usize,
        dst_offset: usize,
        size: usize,
    ) -> Result<Event>;

    // ============================================================================================
    // Programs and Kernels
    // ============================================================================================

    /// Compile kernel source.
    ///
    /// # Errors
    ///
    /// [`BackendError::BuildFailed`](crate::BackendError::BuildFailed) with the
    /// compiler's log when the source does not build.
    fn build_program(&self, source: &str) -> Result<ProgramHandle>;

    fn create_kernel(&self, program: ProgramHandle, name: &str) -> Result<KernelHandle>;

    /// Largest work-group size this kernel can be launched with.
    fn kernel_work_group_size(&self, kernel: KernelHandle) -> Result<usize>;

    /// Launch `kernel` with positional `args`.
    ///
    /// Argument count and kinds are checked before anything is queued.
    fn enqueue_kernel(&self, kernel: KernelHandle, args: &[KernelArg], config: LaunchConfig) -> Result<Event>;

    // ============================================================================================
    // Synchronization
    // ============================================================================================

    /// Wait until the queue is empty and report the first failure of any
    /// command queued since the previous `finish`.
    fn finish(&self) -> Result<()>;

    fn as_any(&self) -> &dyn Any;
}
