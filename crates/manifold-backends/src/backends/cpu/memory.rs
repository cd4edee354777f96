//! Host memory standing in for device buffers.
//!
//! Only the queue worker mutates buffers; reads happen after the queue has
//! drained. Every access is bounds checked.

use std::collections::HashMap;

use crate::backend::ScalarType;
use crate::error::{BackendError, Result};
use crate::kernel_lang::{DeviceMemory, ExecError, Value};

#[derive(Default)]
pub(crate) struct MemoryManager {
    buffers: HashMap<u64, Vec<u8>>,
}

impl MemoryManager {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&mut self, id: u64, size: usize) {
        self.buffers.insert(id, vec![0u8; size]);
    }

    pub(crate) fn remove(&mut self, id: u64) -> Result<()> {
        self.buffers
            .remove(&id)
            .map(|_| ())
            .ok_or(BackendError::InvalidBufferHandle(id))
    }

    pub(crate) fn len(&self) -> usize {
        self.buffers.len()
    }

    fn buffer(&self, id: u64) -> Result<&Vec<u8>> {
        self.buffers.get(&id).ok_or(BackendError::InvalidBufferHandle(id))
    }

    fn checked_range(buffer_size: usize, offset: usize, size: usize) -> Result<std::ops::Range<usize>> {
        match offset.checked_add(size) {
            Some(end) if end <= buffer_size => Ok(offset..end),
            _ => Err(BackendError::BufferOutOfBounds {
                offset,
                size,
                buffer_size,
            }),
        }
    }

    pub(crate) fn write(&mut self, id: u64, offset: usize, data: &[u8]) -> Result<()> {
        let buffer = self.buffers.get_mut(&id).ok_or(BackendError::InvalidBufferHandle(id))?;
        let range = Self::checked_range(buffer.len(), offset, data.len())?;
        buffer[range].copy_from_slice(data);
        Ok(())
    }

    pub(crate) fn read(&self, id: u64, offset: usize, out: &mut [u8]) -> Result<()> {
        let buffer = self.buffer(id)?;
        let range = Self::checked_range(buffer.len(), offset, out.len())?;
        out.copy_from_slice(&buffer[range]);
        Ok(())
    }

    pub(crate) fn copy(&mut self, src: u64, dst: u64, src_offset: usize, dst_offset: usize, size: usize) -> Result<()> {
        let src_range = Self::checked_range(self.buffer(src)?.len(), src_offset, size)?;
        let dst_range = Self::checked_range(self.buffer(dst)?.len(), dst_offset, size)?;

        if src == dst {
            let buffer = self.buffers.get_mut(&src).ok_or(BackendError::InvalidBufferHandle(src))?;
            buffer.copy_within(src_range, dst_range.start);
            return Ok(());
        }

        let staged = self.buffer(src)?[src_range].to_vec();
        let buffer = self.buffers.get_mut(&dst).ok_or(BackendError::InvalidBufferHandle(dst))?;
        buffer[dst_range].copy_from_slice(&staged);
        Ok(())
    }

    fn element(&self, buffer: u64, elem: ScalarType, index: i64) -> std::result::Result<&[u8], ExecError> {
        let data = self
            .buffers
            .get(&buffer)
            .ok_or_else(|| ExecError::new(format!("invalid buffer handle {buffer}")))?;
        let size = elem.size_bytes();
        let len = data.len() / size;
        if index < 0 || index as usize >= len {
            return Err(ExecError::new(format!(
                "index {index} out of bounds for buffer of {len} {elem} elements"
            )));
        }
        let start = index as usize * size;
        Ok(&data[start..start + size])
    }
}

impl DeviceMemory for MemoryManager {
    fn load(&self, buffer: u64, elem: ScalarType, index: i64) -> std::result::Result<Value, ExecError> {
        let bytes = self.element(buffer, elem, index)?;
        Ok(match elem {
            ScalarType::F32 => Value::F32(bytemuck::pod_read_unaligned(bytes)),
            ScalarType::F64 => Value::F64(bytemuck::pod_read_unaligned(bytes)),
            ScalarType::I32 => Value::I32(bytemuck::pod_read_unaligned(bytes)),
            ScalarType::U32 => Value::U32(bytemuck::pod_read_unaligned(bytes)),
            ScalarType::I64 => Value::I64(bytemuck::pod_read_unaligned(bytes)),
            ScalarType::U64 => Value::U64(bytemuck::pod_read_unaligned(bytes)),
        })
    }

    fn store(&mut self, buffer: u64, elem: ScalarType, index: i64, value: Value) -> std::result::Result<(), ExecError> {
        // Bounds check before borrowing mutably.
        self.element(buffer, elem, index)?;
        let value = value.cast(elem)?;
        let start = index as usize * elem.size_bytes();
        let data = match self.buffers.get_mut(&buffer) {
            Some(data) => &mut data[start..start + elem.size_bytes()],
            None => return Err(ExecError::new(format!("invalid buffer handle {buffer}"))),
        };
        match value {
            Value::F32(v) => data.copy_from_slice(bytemuck::bytes_of(&v)),
            Value::F64(v) => data.copy_from_slice(bytemuck::bytes_of(&v)),
            Value::I32(v) => data.copy_from_slice(bytemuck::bytes_of(&v)),
            Value::U32(v) => data.copy_from_slice(bytemuck::bytes_of(&v)),
            Value::I64(v) => data.copy_from_slice(bytemuck::bytes_of(&v)),
            Value::U64(v) => data.copy_from_slice(bytemuck::bytes_of(&v)),
            Value::Ptr { .. } => return Err(ExecError::new("cannot store a pointer")),
        }
        Ok(())
    }
}
