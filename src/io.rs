use crate::codec::{FRAME_SIZE, FrameError, InputEventFrame, PRESS, RELEASE, REPEAT};
use anyhow::Result;
use colored::{ColoredString, Colorize};
use evdev::KeyCode;
use log::debug;
use std::io::{ErrorKind, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::thread;
use std::time::{Duration, Instant};

/// Pulls whole `input_event` records off a byte stream.
pub(crate) struct EventStream<R> {
    reader: R,
    buf: [u8; FRAME_SIZE],
    filled: usize,
}

impl<R: Read> EventStream<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buf: [0u8; FRAME_SIZE],
            filled: 0,
        }
    }

    /// Blocks until a full record is available. `None` means the stream ended cleanly
    /// on a record boundary. A non-blocking reader surfaces `WouldBlock` as an I/O
    /// error and the bytes read so far are kept for the next call.
    pub fn next_frame(&mut self) -> Result<Option<InputEventFrame>, FrameError> {
        while self.filled < FRAME_SIZE {
            match self.reader.read(&mut self.buf[self.filled..]) {
                Ok(0) if self.filled == 0 => return Ok(None),
                Ok(0) => {
                    return Err(FrameError::Truncated {
                        expected: FRAME_SIZE,
                        actual: self.filled,
                    });
                }
                Ok(n) => self.filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }

        self.filled = 0;
        InputEventFrame::decode(&self.buf).map(Some)
    }

    pub fn get_ref(&self) -> &R {
        &self.reader
    }
}

impl<R: AsRawFd> AsRawFd for EventStream<R> {
    fn as_raw_fd(&self) -> RawFd {
        self.reader.as_raw_fd()
    }
}

/// Where an emitted key came from, for the debug log.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Origin {
    Raw,
    Chord,
    Tap,
    Timer,
    Flush,
}

impl Origin {
    fn label(self) -> &'static str {
        match self {
            Origin::Raw => "raw",
            Origin::Chord => "chord",
            Origin::Tap => "tap",
            Origin::Timer => "timer",
            Origin::Flush => "flush",
        }
    }
}

/// Ordered, flushed writer of `input_event` records.
pub(crate) struct OutputSink<W> {
    writer: W,
    holdoff: Duration,
    quiet_until: Option<Instant>,
}

impl<W: Write> OutputSink<W> {
    pub fn new(writer: W, holdoff: Duration) -> Self {
        Self {
            writer,
            holdoff,
            quiet_until: None,
        }
    }

    /// Writes a frame exactly as it was read.
    pub fn passthrough(&mut self, frame: &InputEventFrame) -> Result<()> {
        self.write_frame(frame)?;
        self.writer.flush()?;

        if let Some(key) = frame.key_code() {
            log_key(key, frame.value, Origin::Raw);
        }

        Ok(())
    }

    /// Writes a synthesized key followed by its SYN report, then holds off
    /// further writes so the consumer sees distinct events.
    pub fn emit_key(&mut self, key: KeyCode, value: u32, origin: Origin) -> Result<()> {
        self.write_frame(&InputEventFrame::key(key, value))?;
        self.write_frame(&InputEventFrame::syn())?;
        self.writer.flush()?;

        if !self.holdoff.is_zero() {
            self.quiet_until = Some(Instant::now() + self.holdoff);
        }

        log_key(key, value, origin);
        Ok(())
    }

    fn write_frame(&mut self, frame: &InputEventFrame) -> Result<()> {
        if let Some(until) = self.quiet_until.take() {
            let now = Instant::now();
            if until > now {
                thread::sleep(until - now);
            }
        }

        self.writer.write_all(&frame.encode())?;
        Ok(())
    }

    #[cfg(test)]
    pub fn get_ref(&self) -> &W {
        &self.writer
    }
}

fn log_key(key: KeyCode, value: u32, origin: Origin) {
    debug!(
        "{}[{}] {} [{}]",
        if is_modifier(key) { "    " } else { "" },
        value_arrow(value),
        key_name(key).bright_blue(),
        origin.label().purple(),
    );
}

fn key_name(key: KeyCode) -> String {
    let name = format!("{key:?}");
    name.strip_prefix("KEY_").map(str::to_owned).unwrap_or(name)
}

fn value_arrow(value: u32) -> ColoredString {
    match value {
        PRESS => "↓".green().bold(),
        RELEASE => "↑".red().bold(),
        REPEAT => "⟳".yellow().bold(),
        _ => "?".normal(),
    }
}

fn is_modifier(key: KeyCode) -> bool {
    matches!(
        key,
        KeyCode::KEY_LEFTSHIFT
            | KeyCode::KEY_RIGHTSHIFT
            | KeyCode::KEY_LEFTCTRL
            | KeyCode::KEY_RIGHTCTRL
            | KeyCode::KEY_LEFTALT
            | KeyCode::KEY_RIGHTALT
            | KeyCode::KEY_LEFTMETA
            | KeyCode::KEY_RIGHTMETA
    )
}
