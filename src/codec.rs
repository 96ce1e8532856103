use evdev::KeyCode;
use libc::c_long;
use std::io;
use std::mem::size_of;
use thiserror::Error;

pub(crate) const EV_SYN: u16 = 0;
pub(crate) const EV_KEY: u16 = 1;
pub(crate) const SYN_REPORT: u16 = 0;

pub(crate) const RELEASE: u32 = 0;
pub(crate) const PRESS: u32 = 1;
pub(crate) const REPEAT: u32 = 2;

const TIME_WIDTH: usize = size_of::<c_long>();

/// Size of one `struct input_event` on this platform.
pub(crate) const FRAME_SIZE: usize = 2 * TIME_WIDTH + 2 + 2 + 4;

// The downstream consumer reads the kernel struct directly, so the layouts must agree.
const _: () = assert!(FRAME_SIZE == size_of::<libc::input_event>());

#[derive(Debug, Error)]
pub(crate) enum FrameError {
    #[error("input event record must be {expected} bytes, got {actual}")]
    Size { expected: usize, actual: usize },
    #[error("input ended mid record: read {actual} of {expected} bytes")]
    Truncated { expected: usize, actual: usize },
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// One decoded `input_event` record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct InputEventFrame {
    pub sec: c_long,
    pub usec: c_long,
    pub event_type: u16,
    pub code: u16,
    pub value: u32,
}

impl InputEventFrame {
    /// Key frame with zeroed timestamps, as written for synthesized keys.
    pub fn key(key: KeyCode, value: u32) -> Self {
        Self {
            sec: 0,
            usec: 0,
            event_type: EV_KEY,
            code: key.code(),
            value,
        }
    }

    pub fn syn() -> Self {
        Self {
            sec: 0,
            usec: 0,
            event_type: EV_SYN,
            code: SYN_REPORT,
            value: 0,
        }
    }

    /// The key code when this is an `EV_KEY` frame.
    pub fn key_code(&self) -> Option<KeyCode> {
        (self.event_type == EV_KEY).then(|| KeyCode::new(self.code))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.len() != FRAME_SIZE {
            return Err(FrameError::Size {
                expected: FRAME_SIZE,
                actual: bytes.len(),
            });
        }

        let mut at = 0;
        let sec = c_long::from_ne_bytes(take(bytes, &mut at));
        let usec = c_long::from_ne_bytes(take(bytes, &mut at));
        let event_type = u16::from_ne_bytes(take(bytes, &mut at));
        let code = u16::from_ne_bytes(take(bytes, &mut at));
        let value = u32::from_ne_bytes(take(bytes, &mut at));

        Ok(Self {
            sec,
            usec,
            event_type,
            code,
            value,
        })
    }

    pub fn encode(&self) -> [u8; FRAME_SIZE] {
        let mut out = [0u8; FRAME_SIZE];
        let mut at = 0;
        put(&mut out, &mut at, &self.sec.to_ne_bytes());
        put(&mut out, &mut at, &self.usec.to_ne_bytes());
        put(&mut out, &mut at, &self.event_type.to_ne_bytes());
        put(&mut out, &mut at, &self.code.to_ne_bytes());
        put(&mut out, &mut at, &self.value.to_ne_bytes());
        out
    }
}

fn take<const N: usize>(bytes: &[u8], at: &mut usize) -> [u8; N] {
    let mut field = [0u8; N];
    field.copy_from_slice(&bytes[*at..*at + N]);
    *at += N;
    field
}

fn put(out: &mut [u8], at: &mut usize, field: &[u8]) {
    out[*at..*at + field.len()].copy_from_slice(field);
    *at += field.len();
}
