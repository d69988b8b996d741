//! The poll reactor: one worker thread multiplexing descriptor readiness and
//! deadlines, driven and cancelled from any thread.
//!
//! The worker owns every callback invocation, so callbacks get a serial
//! execution model even while other application threads register, re-arm,
//! and cancel work concurrently. A nonblocking eventfd is registered as an
//! always-armed task so that cross-thread changes (new task, cancellation,
//! hook swap, shutdown) interrupt the blocking wait promptly.

use crate::events::Events;
use crate::task::{Next, Task, TaskFn, TaskHandle, TaskState};
use once_cell::sync::OnceCell;
use parking_lot::{Condvar, Mutex};
use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Upper bound on the poll set, including the slot reserved for the pre/post
/// hook. Descriptor tasks beyond this fail to schedule.
pub const MAX_WATCHED: usize = 64;

/// Error from reactor operations.
#[derive(Debug, Error)]
pub enum ReactorError {
    #[error("descriptor tasks need a non-empty interest set")]
    EmptyInterest,
    #[error("watched descriptor limit reached ({0})")]
    QueueFull(usize),
    #[error("reactor is shutting down")]
    Dead,
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// An external event source folded into the worker's poll set.
///
/// `pre` runs immediately before the blocking wait and may claim the reserved
/// poll slot; `post` runs immediately after the wait returns, strictly before
/// any task dispatch, with the readiness of the claimed slot (empty if the
/// slot was not claimed or not ready).
pub trait PollHook: Send {
    fn pre(&mut self) -> Option<(RawFd, Events)>;
    fn post(&mut self, revents: Events);
}

struct QueueState {
    /// Queued tasks in insertion order; new arrivals always append, so a
    /// dispatch snapshot is never invalidated by callback-side submissions.
    tasks: Vec<Arc<Task>>,
    hooks: Option<Box<dyn PollHook>>,
    /// The worker has the hook object out of the slot for this iteration.
    hooks_busy: bool,
    kill: bool,
    /// Worker is dispatching; self-wakes are pointless and suppressed.
    no_wake: bool,
    /// Bumped once per iteration after the wait returns; hook setters
    /// rendezvous on it.
    seq: u32,
    sig_seq: bool,
}

struct Shared {
    queue: Mutex<QueueState>,
    cond: Condvar,
    /// External handles: `Reactor` clones plus live `TaskHandle`s. The
    /// worker is told to die when the last one drops.
    handles: AtomicUsize,
    wake_fd: OwnedFd,
    worker_id: OnceCell<ThreadId>,
    join: Mutex<Option<JoinHandle<()>>>,
}

/// Cloneable handle to a running reactor.
///
/// The worker thread is asked to tear itself down when the last handle
/// (including task handles) drops; `shutdown` does so synchronously.
pub struct Reactor {
    shared: Arc<Shared>,
}

impl Reactor {
    /// Create the reactor and spawn its worker thread.
    ///
    /// Fails atomically: on any sub-step failure everything already created
    /// is released.
    pub fn new() -> Result<Reactor, ReactorError> {
        let wake_fd = new_eventfd()?;
        let wake_raw = wake_fd.as_raw_fd();

        let shared = Arc::new(Shared {
            queue: Mutex::new(QueueState {
                tasks: Vec::new(),
                hooks: None,
                hooks_busy: false,
                kill: false,
                no_wake: false,
                seq: 0,
                sig_seq: false,
            }),
            cond: Condvar::new(),
            handles: AtomicUsize::new(1),
            wake_fd,
            worker_id: OnceCell::new(),
            join: Mutex::new(None),
        });

        // The always-armed self-wake task: drain the eventfd and stay queued.
        let wake_task = Task::new(
            Some(wake_raw),
            Events::IN,
            false,
            Box::new(move |revents: Events| {
                if !revents.is_empty() {
                    drain_eventfd(wake_raw);
                }
                Next::Rearm
            }) as TaskFn,
        );
        {
            let mut st = shared.queue.lock();
            wake_task.cell.lock().state = TaskState::Queued;
            st.tasks.push(wake_task);
        }

        let worker_shared = Arc::clone(&shared);
        let join = thread::Builder::new()
            .name("vbuf-reactor".to_string())
            .spawn(move || worker_loop(&worker_shared))
            .map_err(ReactorError::Io)?;
        let _ = shared.worker_id.set(join.thread().id());
        *shared.join.lock() = Some(join);

        Ok(Reactor { shared })
    }

    /// Register a task watching `fd` for `interest`. The task starts
    /// unqueued; arm it with [`TaskHandle::schedule`]. The descriptor must
    /// stay open for as long as the task can be queued.
    pub fn new_task<F>(&self, fd: RawFd, interest: Events, cb: F) -> Result<TaskHandle, ReactorError>
    where
        F: FnMut(Events) -> Next + Send + 'static,
    {
        if interest.is_empty() {
            return Err(ReactorError::EmptyInterest);
        }
        Ok(TaskHandle {
            reactor: self.clone(),
            task: Task::new(Some(fd), interest, false, Box::new(cb)),
        })
    }

    /// Register a descriptor-less task; it fires on its deadline only.
    pub fn new_timer<F>(&self, cb: F) -> TaskHandle
    where
        F: FnMut(Events) -> Next + Send + 'static,
    {
        TaskHandle {
            reactor: self.clone(),
            task: Task::new(None, Events::empty(), false, Box::new(cb)),
        }
    }

    /// Run `f` on the worker thread on the very next iteration.
    pub fn spawn_once<F>(&self, f: F) -> Result<(), ReactorError>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut f = Some(f);
        let task = Task::new(
            None,
            Events::empty(),
            true,
            Box::new(move |_| {
                if let Some(f) = f.take() {
                    f();
                }
                Next::Idle
            }) as TaskFn,
        );
        self.schedule_task(&task, Some(Duration::ZERO))
    }

    /// Install (or clear) the pre/post poll hook.
    ///
    /// Blocks until the worker is no longer using the previously installed
    /// hook, so the caller may release whatever that hook referenced once
    /// this returns. Called from the worker thread (inside a callback) the
    /// swap happens immediately.
    pub fn set_hooks(&self, hooks: Option<Box<dyn PollHook>>) {
        let mut st = self.shared.queue.lock();
        if !self.is_worker() {
            while st.hooks_busy && !st.kill {
                st.sig_seq = true;
                let seq = st.seq;
                self.wake_locked(&st);
                while st.seq == seq && !st.kill {
                    self.shared.cond.wait(&mut st);
                }
            }
        }
        let old = std::mem::replace(&mut st.hooks, hooks);
        // Kick the worker so the new hook joins the poll set promptly.
        self.wake_locked(&st);
        drop(st);
        drop(old);
    }

    /// Mark the reactor for teardown and join the worker. All still-queued
    /// tasks die without their callbacks firing. From the worker thread this
    /// only marks the kill (joining would self-deadlock).
    pub fn shutdown(self) {
        if self.is_worker() {
            let mut st = self.shared.queue.lock();
            st.kill = true;
            self.wake_locked(&st);
            return;
        }
        let join = self.shared.join.lock().take();
        {
            let mut st = self.shared.queue.lock();
            st.kill = true;
            self.wake_locked(&st);
        }
        if let Some(join) = join {
            let _ = join.join();
        }
    }

    pub(crate) fn schedule_task(
        &self,
        task: &Arc<Task>,
        timeout: Option<Duration>,
    ) -> Result<(), ReactorError> {
        let mut st = self.shared.queue.lock();
        if st.kill {
            return Err(ReactorError::Dead);
        }
        let mut cell = task.cell.lock();
        match cell.state {
            TaskState::Unqueued | TaskState::Running => {
                if task.fd.is_some() {
                    let watched = st.tasks.iter().filter(|t| t.fd.is_some()).count();
                    if watched >= MAX_WATCHED - 1 {
                        return Err(ReactorError::QueueFull(MAX_WATCHED));
                    }
                }
                cell.deadline = timeout.map(|t| Instant::now() + t);
                cell.state = TaskState::Queued;
                drop(cell);
                st.tasks.push(Arc::clone(task));
                self.wake_locked(&st);
                Ok(())
            }
            TaskState::Queued => Ok(()),
            _ => Err(ReactorError::Dead),
        }
    }

    /// Cancel a task. External callers block until the worker acknowledges;
    /// from within a callback the teardown is deferred to the current sweep.
    pub(crate) fn cancel_task(&self, task: &Arc<Task>) {
        let from_worker = self.is_worker();
        let mut st = self.shared.queue.lock();
        let mut cell = task.cell.lock();
        match cell.state {
            TaskState::Unqueued | TaskState::Cancelled | TaskState::Dead => {
                cell.state = TaskState::Dead;
            }
            TaskState::CancelRequested { .. } => {}
            TaskState::Queued | TaskState::Running => {
                cell.state = TaskState::CancelRequested { from_worker };
                drop(cell);
                if from_worker {
                    return;
                }
                self.wake_locked(&st);
                loop {
                    let state = task.cell.lock().state;
                    if matches!(state, TaskState::Cancelled | TaskState::Dead) {
                        break;
                    }
                    self.shared.cond.wait(&mut st);
                }
            }
        }
    }

    fn wake_locked(&self, st: &QueueState) {
        if !st.no_wake {
            write_eventfd(self.shared.wake_fd.as_raw_fd());
        }
    }

    fn is_worker(&self) -> bool {
        self.shared.worker_id.get() == Some(&thread::current().id())
    }
}

impl Clone for Reactor {
    fn clone(&self) -> Reactor {
        self.shared.handles.fetch_add(1, Ordering::Relaxed);
        Reactor {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        if self.shared.handles.fetch_sub(1, Ordering::AcqRel) == 1 {
            let mut st = self.shared.queue.lock();
            st.kill = true;
            self.wake_locked(&st);
        }
    }
}

fn new_eventfd() -> io::Result<OwnedFd> {
    let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
    if fd == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn write_eventfd(fd: RawFd) {
    let one: u64 = 1;
    loop {
        let rv = unsafe { libc::write(fd, (&one as *const u64).cast(), 8) };
        if rv != -1 || io::Error::last_os_error().kind() != io::ErrorKind::Interrupted {
            break;
        }
    }
}

fn drain_eventfd(fd: RawFd) {
    let mut buf = [0u8; 8];
    loop {
        let rv = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), 8) };
        if rv != -1 || io::Error::last_os_error().kind() != io::ErrorKind::Interrupted {
            break;
        }
    }
}

fn remove_task(tasks: &mut Vec<Arc<Task>>, task: &Arc<Task>) {
    if let Some(pos) = tasks.iter().position(|t| Arc::ptr_eq(t, task)) {
        tasks.remove(pos);
    }
}

/// Milliseconds until `deadline`, rounded up, clamped for poll(2).
fn remaining_ms(deadline: Instant, now: Instant) -> libc::c_int {
    if deadline <= now {
        return 0;
    }
    let micros = (deadline - now).as_micros();
    ((micros + 999) / 1000).min(libc::c_int::MAX as u128) as libc::c_int
}

fn worker_loop(shared: &Shared) {
    let mut fatal = false;
    let mut st = shared.queue.lock();

    loop {
        // Sweep: finalise pending cancels, build the poll set, and find the
        // nearest deadline.
        let now = Instant::now();
        let mut pollfds: Vec<libc::pollfd> = Vec::with_capacity(MAX_WATCHED);
        let mut snapshot: Vec<(Arc<Task>, Option<usize>)> = Vec::with_capacity(st.tasks.len());
        let mut timeout_ms: libc::c_int = -1;

        let mut i = 0;
        while i < st.tasks.len() {
            let task = Arc::clone(&st.tasks[i]);
            let mut cell = task.cell.lock();
            match cell.state {
                TaskState::CancelRequested { from_worker } => {
                    cell.state = if from_worker {
                        TaskState::Dead
                    } else {
                        TaskState::Cancelled
                    };
                    drop(cell);
                    st.tasks.remove(i);
                    shared.cond.notify_all();
                }
                TaskState::Queued => {
                    let slot = task.fd.map(|fd| {
                        pollfds.push(libc::pollfd {
                            fd,
                            events: task.interest.bits(),
                            revents: 0,
                        });
                        pollfds.len() - 1
                    });
                    if let Some(deadline) = cell.deadline {
                        let ms = remaining_ms(deadline, now);
                        if timeout_ms < 0 || ms < timeout_ms {
                            timeout_ms = ms;
                        }
                    }
                    drop(cell);
                    snapshot.push((task, slot));
                    i += 1;
                }
                _ => {
                    i += 1;
                }
            }
        }

        let took_hooks = st.hooks.is_some();
        let mut hooks = if took_hooks {
            st.hooks_busy = true;
            st.hooks.take()
        } else {
            None
        };
        drop(st);

        // Reserved slot for the hook, claimed by pre().
        let hook_idx = pollfds.len();
        pollfds.push(libc::pollfd {
            fd: -1,
            events: 0,
            revents: 0,
        });
        if let Some(h) = hooks.as_mut() {
            if let Some((fd, interest)) = h.pre() {
                pollfds[hook_idx] = libc::pollfd {
                    fd,
                    events: interest.bits(),
                    revents: 0,
                };
            }
        }
        let nfds = (hook_idx + usize::from(pollfds[hook_idx].fd != -1)) as libc::nfds_t;

        // Blocking wait; interruptions are retried, anything else is fatal.
        let mut poll_err: Option<io::Error> = None;
        loop {
            let rv = unsafe { libc::poll(pollfds.as_mut_ptr(), nfds, timeout_ms) };
            if rv == -1 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                poll_err = Some(err);
            }
            break;
        }

        if let Some(h) = hooks.as_mut() {
            h.post(Events::from_bits(pollfds[hook_idx].revents));
        }

        if let Some(err) = poll_err {
            eprintln!("[reactor] poll failed: {err}");
            fatal = true;
        }

        let now = Instant::now();
        st = shared.queue.lock();
        st.no_wake = true;

        // Hook rendezvous: bump the sequence and hand the hook object back.
        st.seq = st.seq.wrapping_add(1);
        if st.sig_seq {
            st.sig_seq = false;
            shared.cond.notify_all();
        }
        if took_hooks {
            st.hooks = hooks.take();
            st.hooks_busy = false;
        }

        if fatal {
            break;
        }

        // Dispatch ready tasks from the snapshot. Callbacks run unlocked;
        // anything they submit lands at the queue tail and is picked up by
        // the next sweep.
        for (task, slot) in snapshot {
            let revents = match slot {
                Some(ix) => Events::from_bits(pollfds[ix].revents),
                None => Events::empty(),
            };
            {
                let mut cell = task.cell.lock();
                if cell.state != TaskState::Queued {
                    continue;
                }
                let expired = cell.deadline.map_or(false, |dl| now >= dl);
                if revents.is_empty() && !expired {
                    continue;
                }
                cell.state = TaskState::Running;
            }
            remove_task(&mut st.tasks, &task);
            drop(st);

            let next = {
                let mut cb = task.cb.lock();
                cb(revents)
            };

            st = shared.queue.lock();
            let mut cell = task.cell.lock();
            match cell.state {
                TaskState::CancelRequested { from_worker } => {
                    cell.state = if from_worker {
                        TaskState::Dead
                    } else {
                        TaskState::Cancelled
                    };
                    shared.cond.notify_all();
                }
                TaskState::Running => {
                    if task.once {
                        cell.state = TaskState::Dead;
                    } else {
                        match next {
                            Next::Idle => {
                                cell.state = TaskState::Unqueued;
                                cell.deadline = None;
                            }
                            Next::Rearm => {
                                cell.state = TaskState::Queued;
                                cell.deadline = None;
                                drop(cell);
                                st.tasks.push(Arc::clone(&task));
                            }
                            Next::RearmIn(d) => {
                                cell.state = TaskState::Queued;
                                cell.deadline = Some(Instant::now() + d);
                                drop(cell);
                                st.tasks.push(Arc::clone(&task));
                            }
                        }
                    }
                }
                // Re-armed through the handle during the callback.
                TaskState::Queued => {}
                _ => {}
            }
        }

        st.no_wake = false;
        if st.kill {
            break;
        }
    }

    // Teardown: every remaining task dies without firing, waiters are
    // released, and the hook (if any) is dropped outside the lock.
    st.kill = true;
    for task in st.tasks.drain(..) {
        task.cell.lock().state = TaskState::Dead;
    }
    let hooks = st.hooks.take();
    st.hooks_busy = false;
    shared.cond.notify_all();
    drop(st);
    drop(hooks);
}
