//! Device contexts
//!
//! A [`Context`] is a cheap, cloneable handle to one backend (one device and
//! its in-order queue). Its [`ContextId`] is unique for the life of the
//! process and, together with an expression shape, keys the kernel cache.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use manifold_backends::{Backend, CpuBackend, DeviceInfo};

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a [`Context`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(u64);

impl ContextId {
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx{}", self.0)
    }
}

/// Handle to one device context.
///
/// Clones share the backend and the identity.
#[derive(Clone)]
pub struct Context {
    id: ContextId,
    backend: Arc<dyn Backend>,
}

impl Context {
    pub fn new<B: Backend + 'static>(backend: B) -> Self {
        Self::from_arc(Arc::new(backend))
    }

    pub fn from_arc(backend: Arc<dyn Backend>) -> Self {
        let id = ContextId(NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed));
        tracing::debug!(context = %id, device = %backend.info().name, kind = %backend.info().kind, "context_created");
        Self { id, backend }
    }

    /// Context on a fresh simulated CPU device.
    pub fn cpu() -> Self {
        Self::new(CpuBackend::new())
    }

    /// `count` contexts, each on its own simulated device reporting `info`.
    pub fn simulated(count: usize, info: &DeviceInfo) -> Vec<Self> {
        (0..count)
            .map(|i| {
                let mut info = info.clone();
                info.name = format!("{}-{i}", info.name);
                Self::new(CpuBackend::with_info(info))
            })
            .collect()
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn backend(&self) -> &dyn Backend {
        self.backend.as_ref()
    }

    pub fn info(&self) -> &DeviceInfo {
        self.backend.info()
    }

    /// Concrete backend behind this context, if it is a `B`.
    pub fn downcast<B: Backend + 'static>(&self) -> Option<&B> {
        self.backend.as_any().downcast_ref::<B>()
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.id)
            .field("device", &self.backend.info().name)
            .finish()
    }
}

impl PartialEq for Context {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Context {}

/// True when both lists name the same contexts in the same order.
pub(crate) fn same_contexts(a: &[Context], b: &[Context]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.id == y.id)
}
