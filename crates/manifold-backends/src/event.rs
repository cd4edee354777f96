//! Completion markers for queued commands.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::error::{BackendError, Result};

struct EventState {
    result: Mutex<Option<Result<()>>>,
    ready: Condvar,
}

/// Marks completion of one enqueued command.
///
/// Cloning shares the marker. Waiting returns the command's own error if
/// it failed on the device.
#[derive(Clone)]
pub struct Event {
    state: Arc<EventState>,
}

impl Event {
    /// A marker that completes when the backend signals it.
    pub fn pending() -> Self {
        Self {
            state: Arc::new(EventState {
                result: Mutex::new(None),
                ready: Condvar::new(),
            }),
        }
    }

    /// A marker for work that already finished successfully.
    pub fn completed() -> Self {
        let event = Self::pending();
        event.complete(Ok(()));
        event
    }

    /// A marker for work that already failed.
    pub fn failed(error: BackendError) -> Self {
        let event = Self::pending();
        event.complete(Err(error));
        event
    }

    /// Record the outcome and wake all waiters. Later calls are ignored.
    pub fn complete(&self, result: Result<()>) {
        let mut guard = self.state.result.lock();
        if guard.is_none() {
            *guard = Some(result);
            self.state.ready.notify_all();
        }
    }

    pub fn is_complete(&self) -> bool {
        self.state.result.lock().is_some()
    }

    /// Block until the command finished.
    pub fn wait(&self) -> Result<()> {
        let mut guard = self.state.result.lock();
        loop {
            if let Some(result) = guard.as_ref() {
                return result.clone();
            }
            self.state.ready.wait(&mut guard);
        }
    }
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Event").field("complete", &self.is_complete()).finish()
    }
}

/// Wait for every event and return the first error, if any.
pub fn wait_all<'a>(events: impl IntoIterator<Item = &'a Event>) -> Result<()> {
    let mut first_error = None;
    for event in events {
        if let Err(e) = event.wait() {
            first_error.get_or_insert(e);
        }
    }
    first_error.map_or(Ok(()), Err)
}
