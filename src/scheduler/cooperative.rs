use super::{Backend, DeadlineTable, Handle, Ready, Scheduler};
use crate::codec::{FrameError, InputEventFrame};
use crate::io::EventStream;
use anyhow::{Result, bail};
use evdev::KeyCode;
use std::io::{self, ErrorKind, Read};
use std::os::fd::{AsRawFd, RawFd};
use std::time::{Duration, Instant};
use tokio::io::unix::AsyncFd;
use tokio::runtime::{Builder, Runtime};
use tokio::time;

/// Cooperative delays: frame reads and deadline sleeps are tasks on one
/// single-threaded runtime, so a firing can only resume between two reads.
///
/// The input must be pollable (pipe, socket, tty); it is switched to
/// non-blocking mode.
pub(crate) struct DeadlineQueue<R: AsRawFd> {
    // Declared before the runtime so it deregisters while the reactor is alive.
    input: AsyncFd<EventStream<R>>,
    deadlines: DeadlineTable,
    runtime: Runtime,
}

impl<R: Read + AsRawFd> DeadlineQueue<R> {
    pub fn new(stream: EventStream<R>) -> Result<Self> {
        let runtime = Builder::new_current_thread()
            .enable_io()
            .enable_time()
            .build()?;

        set_nonblocking(stream.as_raw_fd())?;
        let input = {
            let _context = runtime.enter();
            AsyncFd::new(stream)?
        };

        Ok(Self {
            input,
            deadlines: DeadlineTable::default(),
            runtime,
        })
    }
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    // SAFETY: fcntl on a descriptor owned by the stream, no pointers involved
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: as above
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Resolves once a whole record (or the end of input) has been read. Dropping
/// it midway loses nothing: partial records stay buffered in the stream.
async fn read_frame<R: Read + AsRawFd>(
    input: &mut AsyncFd<EventStream<R>>,
) -> Result<Option<InputEventFrame>, FrameError> {
    loop {
        let mut guard = input.readable_mut().await?;
        let attempt = guard.try_io(|inner| match inner.get_mut().next_frame() {
            Err(FrameError::Io(e)) if e.kind() == ErrorKind::WouldBlock => Err(e),
            other => Ok(other),
        });

        match attempt {
            Ok(result) => return result?,
            Err(_would_block) => continue,
        }
    }
}

fn fire_earliest(deadlines: &mut DeadlineTable) -> Result<Ready> {
    match deadlines.fire_earliest() {
        Some(ready) => Ok(ready),
        None => bail!("No armed action to fire"),
    }
}

impl<R: Read + AsRawFd> Scheduler for DeadlineQueue<R> {
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

impl<R: Read + AsRawFd> Backend for DeadlineQueue<R> {
    fn next_ready(&mut self) -> Result<Ready> {
        let Self {
            input,
            deadlines,
            runtime,
        } = self;

        let earliest = deadlines.earliest().map(|(_, deadline)| deadline);
        if earliest.is_some_and(|deadline| deadline <= Instant::now()) {
            return fire_earliest(deadlines);
        }

        let woke = runtime.block_on(async move {
            match earliest {
                Some(deadline) => tokio::select! {
                    biased;
                    frame = read_frame(input) => Some(frame),
                    () = time::sleep_until(deadline.into()) => None,
                },
                None => Some(read_frame(input).await),
            }
        });

        match woke {
            Some(frame) => Ok(match frame? {
                Some(frame) => Ready::Frame(frame),
                None => Ready::End,
            }),
            None => fire_earliest(deadlines),
        }
    }

    fn outstanding(&self) -> usize {
        self.deadlines.len()
    }

    fn deadlines_mut(&mut self) -> &mut DeadlineTable {
        &mut self.deadlines
    }
}
