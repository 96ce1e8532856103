use super::{Backend, DeadlineTable, Handle, Ready, Scheduler};
use crate::codec::{FrameError, InputEventFrame};
use crate::io::EventStream;
use anyhow::Result;
use crossbeam_channel::{Receiver, Sender, unbounded};
use evdev::KeyCode;
use log::trace;
use std::io::Read;
use std::thread;
use std::time::{Duration, Instant};

enum Message {
    Frame(InputEventFrame),
    End,
    Failed(FrameError),
    Fired(Handle),
}

/// Background clock threads. Each scheduled action gets a sleeper thread that
/// only posts a notification; the coordinator decides whether it still counts.
pub(crate) struct ThreadTimers {
    tx: Sender<Message>,
    rx: Receiver<Message>,
    armed: DeadlineTable,
}

impl ThreadTimers {
    pub fn spawn<R: Read + Send + 'static>(stream: EventStream<R>) -> Self {
        let (tx, rx) = unbounded();
        spawn_reader(stream, tx.clone());
        Self {
            tx,
            rx,
            armed: DeadlineTable::default(),
        }
    }
}

fn spawn_reader<R: Read + Send + 'static>(mut stream: EventStream<R>, tx: Sender<Message>) {
    thread::spawn(move || {
        loop {
            let message = match stream.next_frame() {
                Ok(Some(frame)) => Message::Frame(frame),
                Ok(None) => Message::End,
                Err(e) => Message::Failed(e),
            };
            let done = !matches!(message, Message::Frame(_));
            if tx.send(message).is_err() || done {
                return;
            }
        }
    });
}

fn spawn_timer(handle: Handle, delay: Duration, tx: Sender<Message>) {
    thread::spawn(move || {
        thread::sleep(delay);
        let _ = tx.send(Message::Fired(handle));
    });
}

impl Scheduler for ThreadTimers {
    fn schedule(&mut self, key: KeyCode, delay: Duration) -> Handle {
        let handle = self.armed.arm(key, Instant::now() + delay);
        spawn_timer(handle, delay, self.tx.clone());
        handle
    }

    fn cancel(&mut self, handle: Handle) {
        // The sleeper keeps running; its notification is dropped on arrival.
        self.armed.disarm(handle);
    }

    fn is_pending(&self, handle: Handle) -> bool {
        self.armed.contains(handle)
    }
}

impl Backend for ThreadTimers {
    fn next_ready(&mut self) -> Result<Ready> {
        loop {
            match self.rx.recv()? {
                Message::Frame(frame) => return Ok(Ready::Frame(frame)),
                Message::End => return Ok(Ready::End),
                Message::Failed(e) => return Err(e.into()),
                Message::Fired(handle) => match self.armed.disarm(handle) {
                    Some(key) => return Ok(Ready::Fired { handle, key }),
                    None => trace!("Dropping notification for retired {handle:?}"),
                },
            }
        }
    }

    fn outstanding(&self) -> usize {
        self.armed.len()
    }

    fn deadlines_mut(&mut self) -> &mut DeadlineTable {
        &mut self.armed
    }
}
