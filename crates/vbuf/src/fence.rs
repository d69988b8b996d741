//! Release-fence watching: run a callback once the kernel has drained all
//! fences on a buffer, i.e. no other consumer (display, decoder) still holds
//! it.
//!
//! A dma-buf descriptor polls writable exactly when every implicit fence on
//! it has signalled, so this is one reactor task watching for `OUT` with a
//! bounded deadline as a stuck-fence backstop.

use crate::dmabuf::DmaBuf;
use std::ops::Deref;
use std::time::Duration;
use vbuf_reactor::{Events, Next, Reactor, ReactorError, TaskHandle};

/// Backstop deadline: a fence outstanding this long is treated as released.
pub const RELEASE_TIMEOUT: Duration = Duration::from_secs(1);

/// Arm a watch on `buf`, invoking `on_release` once from the reactor worker
/// when its fences drain (or on the backstop deadline). The buffer handle is
/// held by the watch, so the underlying buffer stays alive until then.
///
/// Descriptor-less buffers carry no fences and complete via a next-iteration
/// one-shot; no watch handle is returned for them.
pub fn watch_release<B, F>(
    reactor: &Reactor,
    buf: B,
    mut on_release: F,
) -> Result<Option<TaskHandle>, ReactorError>
where
    B: Deref<Target = DmaBuf> + Send + 'static,
    F: FnMut(&DmaBuf, Events) + Send + 'static,
{
    let Some(fd) = buf.fd().map(|fd| std::os::unix::io::AsRawFd::as_raw_fd(&fd)) else {
        reactor.spawn_once(move || {
            on_release(&buf, Events::empty());
        })?;
        return Ok(None);
    };

    let task = reactor.new_task(fd, Events::OUT, move |revents| {
        on_release(&buf, revents);
        Next::Idle
    })?;
    task.schedule(Some(RELEASE_TIMEOUT))?;
    Ok(Some(task))
}
