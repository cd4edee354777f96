//! In-order command queue backed by one worker thread.

use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;

use crate::error::{BackendError, Result};
use crate::event::Event;

type Job = Box<dyn FnOnce() -> Result<()> + Send>;

struct Command {
    operation: &'static str,
    job: Job,
    event: Event,
}

pub(crate) struct CommandQueue {
    sender: Mutex<Option<Sender<Command>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    /// First failure since the last `finish`.
    failure: Arc<Mutex<Option<BackendError>>>,
}

impl CommandQueue {
    pub(crate) fn new(device: String) -> Self {
        let (sender, receiver) = mpsc::channel::<Command>();
        let failure = Arc::new(Mutex::new(None));
        let worker_failure = Arc::clone(&failure);

        let worker = thread::spawn(move || {
            for command in receiver {
                let result = (command.job)();
                if let Err(error) = &result {
                    tracing::debug!(
                        device = %device,
                        operation = command.operation,
                        error = %error,
                        "queued_command_failed"
                    );
                    let mut first = worker_failure.lock();
                    if first.is_none() {
                        *first = Some(error.clone());
                    }
                }
                command.event.complete(result);
            }
        });

        Self {
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
            failure,
        }
    }

    /// Queue `job` behind everything submitted before it.
    pub(crate) fn submit(&self, operation: &'static str, job: Job) -> Result<Event> {
        let event = Event::pending();
        let command = Command {
            operation,
            job,
            event: event.clone(),
        };
        let sender = self.sender.lock();
        match sender.as_ref() {
            Some(sender) => sender.send(command).map_err(|_| BackendError::QueueClosed)?,
            None => return Err(BackendError::QueueClosed),
        }
        Ok(event)
    }

    /// Wait until every command submitted so far has run.
    pub(crate) fn drain(&self) -> Result<()> {
        self.submit("marker", Box::new(|| Ok(())))?.wait()
    }

    /// Drain, then report and clear the first recorded failure.
    pub(crate) fn finish(&self) -> Result<()> {
        self.drain()?;
        match self.failure.lock().take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

impl Drop for CommandQueue {
    fn drop(&mut self) {
        // Closing the channel lets the worker run what is left and exit.
        self.sender.lock().take();
        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn commands_run_in_submission_order() {
        let queue = CommandQueue::new("test".into());
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..16 {
            let log = Arc::clone(&log);
            queue
                .submit(
                    "push",
                    Box::new(move || {
                        log.lock().push(i);
                        Ok(())
                    }),
                )
                .unwrap();
        }
        queue.drain().unwrap();
        assert_eq!(*log.lock(), (0..16).collect::<Vec<_>>());
    }

    #[test]
    fn failures_reach_the_event_and_finish_once() {
        let queue = CommandQueue::new("test".into());
        let event = queue
            .submit("boom", Box::new(|| Err(BackendError::Other("boom".into()))))
            .unwrap();
        assert_eq!(event.wait(), Err(BackendError::Other("boom".into())));
        assert_eq!(queue.finish(), Err(BackendError::Other("boom".into())));
        assert!(queue.finish().is_ok());
    }

    #[test]
    fn drop_runs_pending_commands() {
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let queue = CommandQueue::new("test".into());
            for _ in 0..4 {
                let counter = Arc::clone(&counter);
                queue
                    .submit(
                        "count",
                        Box::new(move || {
                            counter.fetch_add(1, Ordering::SeqCst);
                            Ok(())
                        }),
                    )
                    .unwrap();
            }
        }
        assert_eq!(counter.load(Ordering::SeqCst), 4);
    }
}
