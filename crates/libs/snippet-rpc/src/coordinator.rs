use std::any::Any;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc;
use std::thread::{self, JoinHandle, ThreadId};

use crate::error::BoxError;

pub const COORDINATOR_THREAD_NAME: &str = "snippet-coordinator";

type Job = Box<dyn FnOnce() + Send + 'static>;

/// A single dedicated thread that runs affinity-tagged work in submission order.
///
/// Callers block until their job has finished; jobs submitted from the
/// coordinator thread itself run inline.
#[derive(Debug)]
pub struct Coordinator {
    sender: Option<mpsc::Sender<Job>>,
    thread_id: ThreadId,
    handle: Option<JoinHandle<()>>,
}

impl Coordinator {
    pub fn spawn() -> io::Result<Self> {
        let (sender, receiver) = mpsc::channel::<Job>();
        let handle = thread::Builder::new().name(COORDINATOR_THREAD_NAME.to_string()).spawn(
            move || {
                for job in receiver {
                    job();
                }
                log::debug!("coordinator: job channel closed, exiting");
            },
        )?;
        Ok(Self { sender: Some(sender), thread_id: handle.thread().id(), handle: Some(handle) })
    }

    pub fn is_current(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    /// Runs `job` on the coordinator thread and returns its outcome.
    /// A panic inside the job is reported as an error.
    pub fn run<R, F>(&self, job: F) -> Result<R, BoxError>
    where
        R: Send + 'static,
        F: FnOnce() -> Result<R, BoxError> + Send + 'static,
    {
        if self.is_current() {
            return guarded(job);
        }
        let sender = self.sender.as_ref().ok_or("coordinator thread has stopped")?;
        let (reply_tx, reply_rx) = mpsc::sync_channel(1);
        sender
            .send(Box::new(move || {
                let _ = reply_tx.send(guarded(job));
            }))
            .map_err(|_| "coordinator thread has stopped")?;
        reply_rx.recv().map_err(|_| "coordinator dropped the job")?
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        self.sender.take();
        if self.is_current() {
            return;
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::warn!("coordinator: thread panicked during shutdown");
            }
        }
    }
}

pub(crate) fn guarded<R, F>(job: F) -> Result<R, BoxError>
where
    F: FnOnce() -> Result<R, BoxError>,
{
    panic::catch_unwind(AssertUnwindSafe(job))
        .unwrap_or_else(|payload| Err(format!("panicked: {}", panic_message(&*payload)).into()))
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "unknown panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn current_thread_name() -> Option<String> {
        thread::current().name().map(str::to_string)
    }

    #[test]
    fn jobs_run_on_the_named_thread() {
        let coordinator = Coordinator::spawn().expect("spawn coordinator");
        let name = coordinator.run(|| Ok(current_thread_name())).expect("run");
        assert_eq!(name.as_deref(), Some(COORDINATOR_THREAD_NAME));
        assert!(!coordinator.is_current());
    }

    #[test]
    fn nested_jobs_run_inline() {
        let coordinator = Arc::new(Coordinator::spawn().expect("spawn coordinator"));
        let inner = Arc::clone(&coordinator);
        let value = coordinator
            .run(move || {
                assert!(inner.is_current());
                inner.run(|| Ok(41)).map(|n| n + 1)
            })
            .expect("nested run");
        assert_eq!(value, 42);
    }

    #[test]
    fn errors_and_panics_come_back_to_the_caller() {
        let coordinator = Coordinator::spawn().expect("spawn coordinator");
        let err = coordinator.run(|| Err::<(), _>("nope".into())).expect_err("error");
        assert_eq!(err.to_string(), "nope");

        let err =
            coordinator.run(|| -> Result<(), BoxError> { panic!("boom") }).expect_err("panic");
        assert_eq!(err.to_string(), "panicked: boom");

        assert_eq!(coordinator.run(|| Ok("still alive")).expect("after panic"), "still alive");
    }
}
