//! Distributed device vectors
//!
//! A [`DeviceVector`] splits one logical vector over a list of contexts.
//! Device `d` holds elements `[part[d], part[d + 1])` in its own buffer and
//! remembers the completion event of the last command that touched it.
//!
//! Everything that only changes device contents (`assign`, `write_data`,
//! `set`, ...) takes `&self`, so a vector may appear on both sides of an
//! assignment. Structural changes (`resize`, `take`, `swap`) take
//! `&mut self`.
//!
//! ```rust
//! use manifold_core::{Context, DeviceVector};
//!
//! # fn main() -> manifold_core::Result<()> {
//! let contexts = vec![Context::cpu()];
//! let x = DeviceVector::from_slice(&contexts, &[1.0f32, 2.0, 3.0])?;
//! assert_eq!(x.to_vec()?, vec![1.0, 2.0, 3.0]);
//! assert_eq!(x.get(1)?, 2.0);
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::marker::PhantomData;
use std::ops::{Bound, RangeBounds};
use std::time::Instant;

use manifold_backends::{wait_all, BufferHandle, Event, MemFlags};
use parking_lot::Mutex;

use crate::context::{same_contexts, Context};
use crate::error::{Error, Result};
use crate::partition::partition;
use crate::scalar::Scalar;

pub struct DeviceVector<T: Scalar> {
    contexts: Vec<Context>,
    part: Vec<usize>,
    /// `None` for zero-width partitions.
    buffers: Vec<Option<BufferHandle>>,
    /// Last event issued against each device's buffer.
    events: Mutex<Vec<Option<Event>>>,
    _marker: PhantomData<T>,
}

impl<T: Scalar> DeviceVector<T> {
    /// Allocate `n` uninitialized elements partitioned over `contexts`.
    pub fn new(contexts: &[Context], n: usize) -> Result<Self> {
        Self::with_flags(contexts, n, MemFlags::ReadWrite)
    }

    pub fn with_flags(contexts: &[Context], n: usize, flags: MemFlags) -> Result<Self> {
        if contexts.is_empty() && n > 0 {
            return Err(Error::InvalidOperation(format!(
                "cannot distribute {n} elements over zero contexts"
            )));
        }
        Self::with_partition(contexts, partition(n, contexts), flags)
    }

    /// Allocate and fill from `data` with a blocking scatter write.
    pub fn from_slice(contexts: &[Context], data: &[T]) -> Result<Self> {
        Self::from_slice_with_flags(contexts, data, MemFlags::ReadWrite)
    }

    pub fn from_slice_with_flags(contexts: &[Context], data: &[T], flags: MemFlags) -> Result<Self> {
        let vector = Self::with_flags(contexts, data.len(), flags)?;
        vector.write_data(0, data, true)?;
        Ok(vector)
    }

    /// A vector with no devices and no elements.
    pub fn empty() -> Self {
        Self {
            contexts: Vec::new(),
            part: vec![0],
            buffers: Vec::new(),
            events: Mutex::new(Vec::new()),
            _marker: PhantomData,
        }
    }

    pub(crate) fn with_partition(contexts: &[Context], part: Vec<usize>, flags: MemFlags) -> Result<Self> {
        let devices = contexts.len();
        let mut vector = Self {
            contexts: contexts.to_vec(),
            part,
            buffers: vec![None; devices],
            events: Mutex::new(vec![None; devices]),
            _marker: PhantomData,
        };
        for d in 0..devices {
            let size = vector.part_size(d);
            if size > 0 {
                let bytes = size * std::mem::size_of::<T>();
                vector.buffers[d] = Some(vector.contexts[d].backend().allocate_buffer(bytes, flags)?);
            }
        }
        tracing::debug!(
            elements = vector.len(),
            devices,
            element_type = T::cl_name(),
            part = ?vector.part,
            "vector_allocated"
        );
        Ok(vector)
    }

    /// Replace `self` with a fresh, uninitialized vector of `n` elements.
    pub fn resize(&mut self, contexts: &[Context], n: usize) -> Result<()> {
        *self = Self::new(contexts, n)?;
        Ok(())
    }

    /// Replace `self` with a fresh vector holding `data`.
    pub fn resize_from_slice(&mut self, contexts: &[Context], data: &[T]) -> Result<()> {
        *self = Self::from_slice(contexts, data)?;
        Ok(())
    }

    /// Replace `self` with a copy of `other`, layout and contents.
    pub fn resize_like(&mut self, other: &Self) -> Result<()> {
        *self = other.try_clone()?;
        Ok(())
    }

    /// Move the contents out, leaving `self` empty.
    pub fn take(&mut self) -> Self {
        std::mem::take(self)
    }

    pub fn swap(&mut self, other: &mut Self) {
        std::mem::swap(self, other);
    }

    /// New vector with the same layout and a device-side copy of the contents.
    pub fn try_clone(&self) -> Result<Self> {
        let copy = Self::with_partition(&self.contexts, self.part.clone(), MemFlags::ReadWrite)?;
        copy.assign_vector(self)?;
        Ok(copy)
    }

    /// Copy `other` into `self`, one device-to-device copy per partition.
    ///
    /// Both vectors must share contexts and partition table.
    pub fn assign_vector(&self, other: &Self) -> Result<()> {
        self.check_layout(other)?;
        for d in self.active_devices() {
            let bytes = self.part_size(d) * std::mem::size_of::<T>();
            let event = self.contexts[d]
                .backend()
                .enqueue_copy(other.handle(d)?, self.handle(d)?, 0, 0, bytes)?;
            self.record(d, event);
        }
        Ok(())
    }

    /// Write `data` at global `offset`, one transfer per intersecting device.
    ///
    /// With `blocking == false` the call returns once the transfers are
    /// enqueued; [`finish`](Self::finish) waits for them.
    #[tracing::instrument(skip_all, fields(offset, elements = data.len(), blocking))]
    pub fn write_data(&self, offset: usize, data: &[T], blocking: bool) -> Result<()> {
        let end = self.checked_end(offset, data.len())?;
        let start = Instant::now();
        let mut issued = Vec::new();

        for (d, lo, hi) in self.intersecting(offset, end) {
            let base = self.part[d];
            let event = self.contexts[d].backend().enqueue_write(
                self.handle(d)?,
                (lo - base) * std::mem::size_of::<T>(),
                bytemuck::cast_slice(&data[lo - offset..hi - offset]),
            )?;
            self.record(d, event.clone());
            issued.push(event);
        }

        if blocking {
            wait_all(&issued)?;
            let duration_us = start.elapsed().as_micros() as u64;
            manifold_tracing::performance::record_transfer(std::mem::size_of_val(data), "H2D", duration_us);
        }
        tracing::debug!(devices = issued.len(), "vector_write");
        Ok(())
    }

    /// Read into `out` from global `offset`, one transfer per intersecting device.
    #[tracing::instrument(skip_all, fields(offset, elements = out.len(), blocking))]
    pub fn read_data(&self, offset: usize, out: &mut [T], blocking: bool) -> Result<()> {
        let end = self.checked_end(offset, out.len())?;
        let start = Instant::now();
        let mut issued = Vec::new();

        for (d, lo, hi) in self.intersecting(offset, end) {
            let base = self.part[d];
            let event = self.contexts[d].backend().enqueue_read(
                self.handle(d)?,
                (lo - base) * std::mem::size_of::<T>(),
                bytemuck::cast_slice_mut(&mut out[lo - offset..hi - offset]),
            )?;
            self.record(d, event.clone());
            issued.push(event);
        }

        if blocking {
            wait_all(&issued)?;
            let duration_us = start.elapsed().as_micros() as u64;
            manifold_tracing::performance::record_transfer(std::mem::size_of_val(out), "D2H", duration_us);
        }
        tracing::debug!(devices = issued.len(), "vector_read");
        Ok(())
    }

    /// Blocking write of the whole vector.
    pub fn copy_from_host(&self, data: &[T]) -> Result<()> {
        copy_from_host(data, self, true)
    }

    /// Blocking read of the whole vector.
    pub fn copy_to_host(&self, out: &mut [T]) -> Result<()> {
        copy_to_host(self, out, true)
    }

    pub fn to_vec(&self) -> Result<Vec<T>> {
        let mut out = vec![T::zero(); self.len()];
        self.read_data(0, &mut out, true)?;
        Ok(out)
    }

    /// Device-resident view of `range`.
    pub fn range(&self, range: impl RangeBounds<usize>) -> Result<DeviceRange<'_, T>> {
        let out_of_bounds = |index: usize| Error::IndexOutOfBounds { index, len: self.len() };
        let start = match range.start_bound() {
            Bound::Included(&s) => s,
            Bound::Excluded(&s) => s.checked_add(1).ok_or_else(|| out_of_bounds(s))?,
            Bound::Unbounded => 0,
        };
        let end = match range.end_bound() {
            Bound::Included(&e) => e.checked_add(1).ok_or_else(|| out_of_bounds(e))?,
            Bound::Excluded(&e) => e,
            Bound::Unbounded => self.len(),
        };
        if start > end || end > self.len() {
            return Err(out_of_bounds(start.max(end)));
        }
        Ok(DeviceRange {
            vector: self,
            start,
            end,
        })
    }

    /// Read one element. Blocking; meant for inspection, not bulk access.
    pub fn get(&self, index: usize) -> Result<T> {
        let d = self.owner(index)?;
        let mut value = [T::zero()];
        let offset = (index - self.part[d]) * std::mem::size_of::<T>();
        self.contexts[d]
            .backend()
            .enqueue_read(self.handle(d)?, offset, bytemuck::cast_slice_mut(&mut value))?
            .wait()?;
        Ok(value[0])
    }

    /// Write one element. Blocking; meant for inspection, not bulk access.
    pub fn set(&self, index: usize, value: T) -> Result<()> {
        let d = self.owner(index)?;
        let offset = (index - self.part[d]) * std::mem::size_of::<T>();
        let event = self.contexts[d]
            .backend()
            .enqueue_write(self.handle(d)?, offset, bytemuck::bytes_of(&value))?;
        self.record(d, event.clone());
        event.wait()?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.part.last().copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of contexts, including those owning an empty range.
    pub fn nparts(&self) -> usize {
        self.contexts.len()
    }

    pub fn part_size(&self, d: usize) -> usize {
        self.part[d + 1] - self.part[d]
    }

    pub fn part_start(&self, d: usize) -> usize {
        self.part[d]
    }

    pub fn partition(&self) -> &[usize] {
        &self.part
    }

    pub fn contexts(&self) -> &[Context] {
        &self.contexts
    }

    /// Native buffer on device `d`, for launching hand-written kernels.
    pub fn buffer(&self, d: usize) -> Option<BufferHandle> {
        self.buffers.get(d).copied().flatten()
    }

    /// Wait for every command issued against this vector.
    pub fn finish(&self) -> Result<()> {
        let pending: Vec<Event> = self.events.lock().iter_mut().filter_map(Option::take).collect();
        wait_all(&pending)?;
        Ok(())
    }

    /// Devices owning a non-empty range.
    pub(crate) fn active_devices(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.nparts()).filter(|&d| self.part_size(d) > 0)
    }

    pub(crate) fn handle(&self, d: usize) -> Result<BufferHandle> {
        self.buffer(d)
            .ok_or_else(|| Error::InvalidOperation(format!("device {d} holds no elements")))
    }

    pub(crate) fn record(&self, d: usize, event: Event) {
        self.events.lock()[d] = Some(event);
    }

    pub(crate) fn same_layout(&self, other: &Self) -> bool {
        self.part == other.part && same_contexts(&self.contexts, &other.contexts)
    }

    pub(crate) fn check_layout(&self, other: &Self) -> Result<()> {
        if self.same_layout(other) {
            Ok(())
        } else {
            Err(Error::mismatch(format!(
                "partition {:?} over {} contexts vs {:?} over {}",
                self.part,
                self.nparts(),
                other.part,
                other.nparts()
            )))
        }
    }

    fn checked_end(&self, offset: usize, count: usize) -> Result<usize> {
        offset
            .checked_add(count)
            .filter(|&end| end <= self.len())
            .ok_or(Error::IndexOutOfBounds {
                index: offset.saturating_add(count),
                len: self.len(),
            })
    }

    /// `(device, lo, hi)` for every partition meeting `[start, end)`.
    fn intersecting(&self, start: usize, end: usize) -> impl Iterator<Item = (usize, usize, usize)> + '_ {
        (0..self.nparts()).filter_map(move |d| {
            let lo = start.max(self.part[d]);
            let hi = end.min(self.part[d + 1]);
            (lo < hi).then_some((d, lo, hi))
        })
    }

    fn owner(&self, index: usize) -> Result<usize> {
        if index >= self.len() {
            return Err(Error::IndexOutOfBounds { index, len: self.len() });
        }
        Ok(self.part.partition_point(|&p| p <= index) - 1)
    }
}

impl<T: Scalar> Default for DeviceVector<T> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<T: Scalar> Drop for DeviceVector<T> {
    fn drop(&mut self) {
        for (ctx, buffer) in self.contexts.iter().zip(&self.buffers) {
            if let Some(buffer) = buffer {
                if let Err(error) = ctx.backend().free_buffer(*buffer) {
                    tracing::warn!(context = %ctx.id(), buffer = %buffer, error = %error, "buffer_free_failed");
                }
            }
        }
    }
}

impl<T: Scalar> fmt::Debug for DeviceVector<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceVector")
            .field("element_type", &T::cl_name())
            .field("len", &self.len())
            .field("partition", &self.part)
            .finish()
    }
}

/// A contiguous range of a [`DeviceVector`], still on the devices.
#[derive(Debug)]
pub struct DeviceRange<'a, T: Scalar> {
    vector: &'a DeviceVector<T>,
    start: usize,
    end: usize,
}

impl<T: Scalar> Clone for DeviceRange<'_, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T: Scalar> Copy for DeviceRange<'_, T> {}

impl<'a, T: Scalar> DeviceRange<'a, T> {
    pub fn vector(&self) -> &'a DeviceVector<T> {
        self.vector
    }

    pub fn start(&self) -> usize {
        self.start
    }

    pub fn end(&self) -> usize {
        self.end
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Copy all of `src` into `dst`.
pub fn copy_to_host<T: Scalar>(src: &DeviceVector<T>, dst: &mut [T], blocking: bool) -> Result<()> {
    if dst.len() != src.len() {
        return Err(Error::BufferSizeMismatch {
            expected: src.len(),
            actual: dst.len(),
        });
    }
    src.read_data(0, dst, blocking)
}

/// Copy all of `src` into `dst`.
pub fn copy_from_host<T: Scalar>(src: &[T], dst: &DeviceVector<T>, blocking: bool) -> Result<()> {
    if src.len() != dst.len() {
        return Err(Error::BufferSizeMismatch {
            expected: dst.len(),
            actual: src.len(),
        });
    }
    dst.write_data(0, src, blocking)
}

pub fn copy_range_to_host<T: Scalar>(src: DeviceRange<'_, T>, dst: &mut [T], blocking: bool) -> Result<()> {
    if dst.len() != src.len() {
        return Err(Error::BufferSizeMismatch {
            expected: src.len(),
            actual: dst.len(),
        });
    }
    src.vector.read_data(src.start, dst, blocking)
}

pub fn copy_range_from_host<T: Scalar>(src: &[T], dst: DeviceRange<'_, T>, blocking: bool) -> Result<()> {
    if src.len() != dst.len() {
        return Err(Error::BufferSizeMismatch {
            expected: dst.len(),
            actual: src.len(),
        });
    }
    dst.vector.write_data(dst.start, src, blocking)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{cpu_contexts, use_equal_partitioning};
    use manifold_backends::CpuBackend;

    #[test]
    fn scatter_and_gather_across_devices() -> Result<()> {
        use_equal_partitioning();
        let contexts = cpu_contexts(3);
        let data: Vec<i32> = (0..100).collect();
        let v = DeviceVector::from_slice(&contexts, &data)?;

        assert_eq!(v.partition(), &[0, 48, 96, 100]);
        assert_eq!(v.nparts(), 3);
        assert_eq!(v.part_size(2), 4);
        assert_eq!(v.to_vec()?, data);
        Ok(())
    }

    #[test]
    fn partial_transfers_touch_only_intersecting_devices() -> Result<()> {
        use_equal_partitioning();
        let contexts = cpu_contexts(2);
        let v = DeviceVector::from_slice(&contexts, &[0u32; 40])?;

        v.write_data(30, &[7, 8, 9, 10, 11], false)?;
        v.finish()?;

        let mut window = [0u32; 7];
        v.read_data(29, &mut window, true)?;
        assert_eq!(window, [0, 7, 8, 9, 10, 11, 0]);
        assert!(v.write_data(38, &[1, 2, 3], true).is_err());
        Ok(())
    }

    #[test]
    fn element_access_finds_the_owner() -> Result<()> {
        use_equal_partitioning();
        let contexts = cpu_contexts(4);
        let v = DeviceVector::from_slice(&contexts, &(0..50).map(f64::from).collect::<Vec<_>>())?;

        v.set(33, -1.0)?;
        assert_eq!(v.get(33)?, -1.0);
        assert_eq!(v.get(49)?, 49.0);
        assert!(matches!(v.get(50), Err(Error::IndexOutOfBounds { index: 50, len: 50 })));
        Ok(())
    }

    #[test]
    fn zero_width_partitions_own_no_buffer() -> Result<()> {
        use_equal_partitioning();
        let contexts = cpu_contexts(3);
        let v = DeviceVector::<f32>::new(&contexts, 10)?;
        assert!(v.buffer(0).is_some());
        assert!(v.buffer(1).is_none());
        assert!(v.buffer(2).is_none());
        assert_eq!(v.active_devices().collect::<Vec<_>>(), vec![0]);
        Ok(())
    }

    #[test]
    fn take_leaves_an_empty_vector_and_drop_frees() -> Result<()> {
        let contexts = cpu_contexts(1);
        let ctx = contexts[0].clone();
        let mut a = DeviceVector::from_slice(&contexts, &[1.0f32, 2.0])?;
        let b = a.take();

        assert!(a.is_empty());
        assert_eq!(a.nparts(), 0);
        assert_eq!(b.to_vec()?, vec![1.0, 2.0]);

        let backend = ctx.downcast::<CpuBackend>().unwrap();
        assert_eq!(backend.live_buffers(), 1);
        drop(b);
        assert_eq!(backend.live_buffers(), 0);
        Ok(())
    }

    #[test]
    fn clone_and_resize_like_copy_contents() -> Result<()> {
        use_equal_partitioning();
        let contexts = cpu_contexts(2);
        let a = DeviceVector::from_slice(&contexts, &[1i64, 2, 3, 4, 5])?;
        let b = a.try_clone()?;
        a.set(0, 100)?;
        assert_eq!(b.to_vec()?, vec![1, 2, 3, 4, 5]);

        let mut c = DeviceVector::empty();
        c.resize_like(&a)?;
        assert_eq!(c.to_vec()?, vec![100, 2, 3, 4, 5]);

        c.resize(&contexts, 3)?;
        assert_eq!(c.len(), 3);
        Ok(())
    }

    #[test]
    fn assign_vector_requires_matching_layout() -> Result<()> {
        use_equal_partitioning();
        let contexts = cpu_contexts(2);
        let a = DeviceVector::from_slice(&contexts, &[1.0f32; 64])?;
        let b = DeviceVector::<f32>::new(&contexts, 64)?;
        b.assign_vector(&a)?;
        assert_eq!(b.to_vec()?, vec![1.0; 64]);

        let other = DeviceVector::<f32>::new(&cpu_contexts(2), 64)?;
        assert!(matches!(other.assign_vector(&a), Err(Error::PartitionMismatch(_))));
        Ok(())
    }

    #[test]
    fn ranges_copy_windows() -> Result<()> {
        use_equal_partitioning();
        let contexts = cpu_contexts(2);
        let v = DeviceVector::from_slice(&contexts, &[0u64; 32])?;

        copy_range_from_host(&[5, 6, 7], v.range(14..17)?, true)?;
        let mut out = [0u64; 5];
        copy_range_to_host(v.range(13..=17)?, &mut out, true)?;
        assert_eq!(out, [0, 5, 6, 7, 0]);

        assert!(v.range(30..40).is_err());
        assert!(matches!(
            copy_range_to_host(v.range(..)?, &mut out, true),
            Err(Error::BufferSizeMismatch { expected: 32, actual: 5 })
        ));
        Ok(())
    }

    #[test]
    fn ranges_ending_past_usize_max_are_rejected() -> Result<()> {
        use_equal_partitioning();
        let v = DeviceVector::from_slice(&cpu_contexts(1), &[1u32, 2, 3])?;

        assert!(matches!(
            v.range(0..=usize::MAX),
            Err(Error::IndexOutOfBounds { index: usize::MAX, len: 3 })
        ));
        assert!(matches!(
            v.range((Bound::Excluded(usize::MAX), Bound::Unbounded)),
            Err(Error::IndexOutOfBounds { index: usize::MAX, len: 3 })
        ));
        assert_eq!(v.range(0..=2)?.len(), 3);
        Ok(())
    }

    #[test]
    fn zero_contexts_only_hold_empty_vectors() {
        use_equal_partitioning();
        assert!(DeviceVector::<f32>::new(&[], 0).is_ok());
        assert!(matches!(
            DeviceVector::<f32>::new(&[], 4),
            Err(Error::InvalidOperation(_))
        ));
    }
}
