//! Task structure, state machine, and the caller-facing handle.

use crate::events::Events;
use crate::reactor::Reactor;
use parking_lot::Mutex;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// What a callback wants done with its task once it returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Next {
    /// Leave the task unqueued; it can be scheduled again via its handle.
    Idle,
    /// Requeue immediately with no deadline.
    Rearm,
    /// Requeue with a fresh deadline relative to now.
    RearmIn(Duration),
}

/// State of a task.
///
/// A task is owned by the queue only while `Queued`/`Running`; outside of
/// those states the queue holds no reference to it. Cancellation from a
/// non-worker thread transitions through `CancelRequested` and is
/// acknowledged by the worker as `Cancelled`; `Dead` means the task left the
/// reactor without (further) dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TaskState {
    /// Not armed; schedulable.
    Unqueued,
    /// On the queue awaiting readiness or deadline.
    Queued,
    /// Callback currently executing on the worker.
    Running,
    /// Cancel asked for; the worker finalises it on its next pass.
    CancelRequested {
        /// Request came from within a callback on the worker thread, so the
        /// handshake is skipped to avoid self-deadlock.
        from_worker: bool,
    },
    /// Cancel acknowledged by the worker; the canceller may drop the task.
    Cancelled,
    /// Finished: fired as one-shot, torn down at shutdown, or discarded.
    Dead,
}

/// Deadline and state share one lock; both are only ever mutated together.
pub(crate) struct TaskCell {
    pub(crate) state: TaskState,
    /// Absolute monotonic deadline; `None` means no deadline.
    pub(crate) deadline: Option<Instant>,
}

pub(crate) type TaskFn = Box<dyn FnMut(Events) -> Next + Send>;

/// One registered unit of work: an optional watched descriptor plus a
/// callback, with an optional deadline armed at schedule time.
pub(crate) struct Task {
    pub(crate) fd: Option<RawFd>,
    pub(crate) interest: Events,
    /// Fire once and discard, never returning to the caller.
    pub(crate) once: bool,
    pub(crate) cell: Mutex<TaskCell>,
    pub(crate) cb: Mutex<TaskFn>,
}

impl Task {
    pub(crate) fn new(fd: Option<RawFd>, interest: Events, once: bool, cb: TaskFn) -> Arc<Task> {
        Arc::new(Task {
            fd,
            interest,
            once,
            cell: Mutex::new(TaskCell {
                state: TaskState::Unqueued,
                deadline: None,
            }),
            cb: Mutex::new(cb),
        })
    }
}

/// Owning handle to a registered task.
///
/// Dropping the handle cancels the task. From any thread other than the
/// reactor worker this blocks until the worker has confirmed the task is no
/// longer in its active set, so the callback is guaranteed not to run (and
/// not to be running) once the drop returns. From within a callback on the
/// worker thread the teardown is deferred to the current sweep instead.
pub struct TaskHandle {
    pub(crate) reactor: Reactor,
    pub(crate) task: Arc<Task>,
}

impl TaskHandle {
    /// Arm the task, appending it to the queue tail.
    ///
    /// `None` means no deadline; `Some(Duration::ZERO)` fires on the next
    /// iteration. Scheduling an already-queued task is a no-op. Fails if the
    /// reactor is shutting down or the watched-descriptor bound is reached.
    pub fn schedule(&self, timeout: Option<Duration>) -> Result<(), crate::ReactorError> {
        self.reactor.schedule_task(&self.task, timeout)
    }

    /// Cancel the task, consuming the handle. Equivalent to dropping it.
    pub fn cancel(self) {}
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        self.reactor.cancel_task(&self.task);
    }
}
