use super::{Backend, DeadlineTable, Handle, Ready, Scheduler};
use crate::io::EventStream;
use anyhow::{Result, bail};
use evdev::KeyCode;
use std::io::{self, Read};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd};
use std::time::{Duration, Instant};

/// Single threaded: waits on the input descriptor with a timeout equal to the
/// earliest deadline. Timing out is what "fired" means here, and cancelling
/// is just dropping the deadline before it elapses.
///
/// A deadline that has passed is served before input already waiting on the
/// descriptor, since arrival times of unread records are unknown. If the loop
/// falls behind a deadline, a source press that arrived just before it counts
/// as late.
pub(crate) struct PollLoop<R> {
    stream: EventStream<R>,
    deadlines: DeadlineTable,
}

impl<R: Read + AsFd> PollLoop<R> {
    pub fn new(stream: EventStream<R>) -> Self {
        Self {
            stream,
            deadlines: DeadlineTable::default(),
        }
    }
}

impl<R> Scheduler for PollLoop<R> {
    fn schedule(&mut self, key: KeyCode, delay: Duration) -> Handle {
        self.deadlines.arm(key, Instant::now() + delay)
    }

    fn cancel(&mut self, handle: Handle) {
        self.deadlines.disarm(handle);
    }

    fn is_pending(&self, handle: Handle) -> bool {
        self.deadlines.contains(handle)
    }
}

impl<R: Read + AsFd> Backend for PollLoop<R> {
    fn next_ready(&mut self) -> Result<Ready> {
        loop {
            let timeout = match self.deadlines.earliest() {
                Some((_, deadline)) => {
                    let now = Instant::now();
                    if deadline <= now {
                        match self.deadlines.fire_earliest() {
                            Some(ready) => return Ok(ready),
                            None => bail!("No armed action to fire"),
                        }
                    }
                    timeout_ms(deadline - now)
                }
                None => -1,
            };

            if wait_readable(self.stream.get_ref().as_fd(), timeout)? {
                return Ok(match self.stream.next_frame()? {
                    Some(frame) => Ready::Frame(frame),
                    None => Ready::End,
                });
            }
        }
    }

    fn outstanding(&self) -> usize {
        self.deadlines.len()
    }

    fn deadlines_mut(&mut self) -> &mut DeadlineTable {
        &mut self.deadlines
    }
}

/// Rounds up so a wakeup never lands before the deadline.
fn timeout_ms(remaining: Duration) -> i32 {
    let ms = remaining.as_micros().div_ceil(1000);
    i32::try_from(ms).unwrap_or(i32::MAX)
}

/// `false` on timeout or EINTR; the caller re-derives the timeout either way.
fn wait_readable(fd: BorrowedFd<'_>, timeout_ms: i32) -> io::Result<bool> {
    let mut pollfd = libc::pollfd {
        fd: fd.as_raw_fd(),
        events: libc::POLLIN,
        revents: 0,
    };

    // SAFETY: pollfd is a valid, exclusively borrowed array of length 1
    let rc = unsafe { libc::poll(&mut pollfd, 1, timeout_ms) };
    if rc < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return Ok(false);
        }
        return Err(err);
    }

    Ok(rc > 0)
}
