//! Process-wide kernel cache keyed by (shape, context)
//!
//! Entries are never removed. Each key owns a slot with its own lock, so the
//! first caller for a key builds while later callers for that key wait and
//! then reuse the result; callers for other keys are not blocked.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use manifold_backends::{KernelHandle, ProgramHandle};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use crate::context::ContextId;
use crate::error::Result;
use crate::expr::Shape;

/// A built kernel ready to launch on one context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledKernel {
    pub(crate) name: String,
    pub(crate) program: ProgramHandle,
    pub(crate) kernel: KernelHandle,
    pub(crate) work_group_size: usize,
}

impl CompiledKernel {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn program(&self) -> ProgramHandle {
        self.program
    }

    pub fn kernel(&self) -> KernelHandle {
        self.kernel
    }

    pub fn work_group_size(&self) -> usize {
        self.work_group_size
    }
}

type Slot = Arc<Mutex<Option<Arc<CompiledKernel>>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct CacheStats {
    /// Keys with a built kernel.
    pub entries: usize,
    /// Lookups answered without building.
    pub hits: usize,
    /// Successful builds.
    pub builds: usize,
}

#[derive(Default)]
pub struct KernelCache {
    slots: RwLock<HashMap<(Shape, ContextId), Slot>>,
    hits: AtomicUsize,
    builds: AtomicUsize,
}

impl KernelCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// The cache shared by every assignment in the process.
    pub fn global() -> &'static KernelCache {
        static CACHE: OnceLock<KernelCache> = OnceLock::new();
        CACHE.get_or_init(KernelCache::new)
    }

    /// Return the kernel for `(shape, context)`, running `build` on a miss.
    ///
    /// A failed build leaves the slot empty and returns the error.
    pub fn get_or_build(
        &self,
        shape: &Shape,
        context: ContextId,
        build: impl FnOnce() -> Result<CompiledKernel>,
    ) -> Result<Arc<CompiledKernel>> {
        let slot = self.slot(shape, context);
        let mut entry = slot.lock();
        if let Some(kernel) = entry.as_ref() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Arc::clone(kernel));
        }

        let kernel = Arc::new(build()?);
        self.builds.fetch_add(1, Ordering::Relaxed);
        *entry = Some(Arc::clone(&kernel));
        Ok(kernel)
    }

    pub fn get(&self, shape: &Shape, context: ContextId) -> Option<Arc<CompiledKernel>> {
        let slot = self.slots.read().get(&(shape.clone(), context)).cloned()?;
        let entry = slot.lock();
        entry.clone()
    }

    pub fn len(&self) -> usize {
        self.slots.read().values().filter(|slot| slot.lock().is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.len(),
            hits: self.hits.load(Ordering::Relaxed),
            builds: self.builds.load(Ordering::Relaxed),
        }
    }

    fn slot(&self, shape: &Shape, context: ContextId) -> Slot {
        let key = (shape.clone(), context);
        if let Some(slot) = self.slots.read().get(&key) {
            return Arc::clone(slot);
        }
        Arc::clone(self.slots.write().entry(key).or_default())
    }
}
