pub(crate) mod cooperative;
pub(crate) mod poll;
pub(crate) mod threads;

use crate::codec::InputEventFrame;
use anyhow::Result;
use evdev::KeyCode;
use std::collections::BTreeMap;
use std::thread;
use std::time::{Duration, Instant};

/// Identifies one scheduled action. Never reused within a run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct Handle(u64);

/// One-shot delayed "emit this key as a normal press" actions.
///
/// A handle ends either fired or cancelled, never both. Cancelling a handle
/// that already fired or was already cancelled does nothing.
pub(crate) trait Scheduler {
    fn schedule(&mut self, key: KeyCode, delay: Duration) -> Handle;

    fn cancel(&mut self, handle: Handle);

    fn is_pending(&self, handle: Handle) -> bool;
}

/// What woke the coordinator up.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Ready {
    Frame(InputEventFrame),
    /// The action is retired by the time this is returned, so a later cancel is a no-op.
    Fired { handle: Handle, key: KeyCode },
    End,
}

/// A scheduler that also owns the input side, so it can hand the coordinator
/// frames and due actions one at a time in the order they became ready.
pub(crate) trait Backend: Scheduler {
    fn next_ready(&mut self) -> Result<Ready>;

    /// Actions still armed.
    fn outstanding(&self) -> usize;

    fn deadlines_mut(&mut self) -> &mut DeadlineTable;

    /// Once input has ended: sleeps until the earliest armed action is due and
    /// retires it. `None` when nothing is armed.
    fn wait_due(&mut self) -> Option<Ready> {
        let (_, deadline) = self.deadlines_mut().earliest()?;
        let now = Instant::now();
        if deadline > now {
            thread::sleep(deadline - now);
        }
        self.deadlines_mut().fire_earliest()
    }
}

/// Armed actions and their deadlines, owned by whichever loop coordinates them.
#[derive(Debug, Default)]
pub(crate) struct DeadlineTable {
    issued: u64,
    armed: BTreeMap<Handle, (Instant, KeyCode)>,
}

impl DeadlineTable {
    pub fn arm(&mut self, key: KeyCode, deadline: Instant) -> Handle {
        self.issued += 1;
        let handle = Handle(self.issued);
        self.armed.insert(handle, (deadline, key));
        handle
    }

    /// Removes the action, returning its key if it was still armed.
    pub fn disarm(&mut self, handle: Handle) -> Option<KeyCode> {
        self.armed.remove(&handle).map(|(_, key)| key)
    }

    pub fn contains(&self, handle: Handle) -> bool {
        self.armed.contains_key(&handle)
    }

    /// Earliest deadline; ties go to the action scheduled first.
    pub fn earliest(&self) -> Option<(Handle, Instant)> {
        self.armed
            .iter()
            .map(|(handle, (deadline, _))| (*handle, *deadline))
            .min_by_key(|(handle, deadline)| (*deadline, *handle))
    }

    /// Retires the earliest action and reports it as fired.
    pub fn fire_earliest(&mut self) -> Option<Ready> {
        let (handle, _) = self.earliest()?;
        let key = self.disarm(handle)?;
        Some(Ready::Fired { handle, key })
    }

    pub fn len(&self) -> usize {
        self.armed.len()
    }

    #[cfg(test)]
    pub fn find(&self, key: KeyCode) -> Option<Handle> {
        self.armed
            .iter()
            .find(|(_, (_, armed_key))| *armed_key == key)
            .map(|(handle, _)| *handle)
    }
}
