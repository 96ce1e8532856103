use crate::codec::{InputEventFrame, PRESS, RELEASE};
use crate::config::ChordRule;
use crate::io::Origin;
use crate::scheduler::{Handle, Scheduler};
use crate::state::{SourceKey, TargetState, source_table};
use evdev::KeyCode;
use log::{debug, trace};
use std::time::Duration;

/// A write the coordinator must perform, in order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Output {
    /// Forward the frame exactly as read.
    Passthrough(InputEventFrame),
    /// Synthesize a key event (plus SYN).
    Key {
        key: KeyCode,
        value: u32,
        origin: Origin,
    },
}

fn press(key: KeyCode, origin: Origin) -> Output {
    Output::Key {
        key,
        value: PRESS,
        origin,
    }
}

/// Watches the source keys and turns them into the target key when they all
/// go down within the threshold of each other.
///
/// Every source press is held back behind a scheduled action. If the action
/// fires, the key was a plain press and is emitted late. If the remaining
/// sources arrive while all the others are still held back, their presses are
/// swallowed and one target press goes out instead. A fast release or any
/// other key press resolves held-back presses immediately.
pub(crate) struct ChordEngine<S> {
    scheduler: S,
    target: KeyCode,
    threshold: Duration,
    sources: Vec<SourceKey>,
    state: TargetState,
    presses: u64,
}

impl<S: Scheduler> ChordEngine<S> {
    pub fn new(rule: &ChordRule, scheduler: S) -> Self {
        Self {
            scheduler,
            target: rule.target,
            threshold: rule.threshold,
            sources: source_table(&rule.sources),
            state: TargetState::Idle,
            presses: 0,
        }
    }

    pub fn scheduler_mut(&mut self) -> &mut S {
        &mut self.scheduler
    }

    #[cfg(test)]
    pub fn state(&self) -> TargetState {
        self.state
    }

    pub fn on_frame(&mut self, frame: InputEventFrame) -> Vec<Output> {
        let out = match frame.key_code() {
            None => vec![Output::Passthrough(frame)],
            Some(key) => match self.source_index(key) {
                None if frame.value == PRESS => self.flush_pending(frame),
                None => vec![Output::Passthrough(frame)],
                Some(idx) => match frame.value {
                    PRESS => self.source_press(idx),
                    RELEASE => self.source_release(idx, frame),
                    _ => self.source_repeat(idx, frame),
                },
            },
        };

        debug_assert!(self.invariant_holds());
        out
    }

    /// The threshold ran out for a source with no chord forming.
    pub fn on_fired(&mut self, handle: Handle, key: KeyCode) -> Vec<Output> {
        let Some(source) = self
            .sources
            .iter_mut()
            .find(|source| source.pending == Some(handle))
        else {
            trace!("No source waiting on {handle:?}");
            return Vec::new();
        };

        source.pending = None;
        source.emitted = true;
        vec![press(key, Origin::Timer)]
    }

    /// The target is idle exactly when no source is held as part of a chord.
    pub fn invariant_holds(&self) -> bool {
        self.sources.iter().all(|source| !source.down) == (self.state == TargetState::Idle)
    }

    fn source_index(&self, key: KeyCode) -> Option<usize> {
        self.sources.iter().position(|source| source.key == key)
    }

    fn is_pending(&self, idx: usize) -> bool {
        self.sources[idx]
            .pending
            .is_some_and(|handle| self.scheduler.is_pending(handle))
    }

    /// Emits a held-back press now instead of waiting for its action.
    fn resolve(&mut self, idx: usize, origin: Origin) -> Option<Output> {
        let handle = self.sources[idx].pending.take()?;
        if !self.scheduler.is_pending(handle) {
            return None;
        }
        self.scheduler.cancel(handle);

        let source = &mut self.sources[idx];
        source.emitted = true;
        Some(press(source.key, origin))
    }

    /// Another key went down, so nothing held back can become a chord.
    fn flush_pending(&mut self, frame: InputEventFrame) -> Vec<Output> {
        let mut waiting: Vec<usize> = (0..self.sources.len())
            .filter(|&idx| self.is_pending(idx))
            .collect();
        waiting.sort_by_key(|&idx| self.sources[idx].last_press);

        let mut out: Vec<Output> = waiting
            .into_iter()
            .filter_map(|idx| self.resolve(idx, Origin::Flush))
            .collect();
        out.push(Output::Passthrough(frame));
        out
    }

    fn source_press(&mut self, idx: usize) -> Vec<Output> {
        let chord = (0..self.sources.len())
            .filter(|&other| other != idx)
            .all(|other| self.is_pending(other));

        if chord {
            for source in self.sources.iter_mut() {
                if let Some(handle) = source.pending.take() {
                    self.scheduler.cancel(handle);
                }
                source.down = true;
                source.emitted = false;
            }
            self.state = TargetState::Pressed;
            debug!("Chord completed by {:?}", self.sources[idx].key);

            return vec![Output::Key {
                key: self.target,
                value: PRESS,
                origin: Origin::Chord,
            }];
        }

        if let Some(stale) = self.sources[idx].pending.take() {
            self.scheduler.cancel(stale);
        }
        let key = self.sources[idx].key;
        let handle = self.scheduler.schedule(key, self.threshold);
        self.presses += 1;

        let source = &mut self.sources[idx];
        source.pending = Some(handle);
        source.last_press = self.presses;
        if self.state != TargetState::Idle {
            source.down = true;
        }

        Vec::new()
    }

    fn source_release(&mut self, idx: usize, frame: InputEventFrame) -> Vec<Output> {
        match self.state {
            TargetState::Pressed => {
                self.state = TargetState::Released;
                self.sources[idx].down = false;
                self.settle();

                vec![Output::Key {
                    key: self.target,
                    value: RELEASE,
                    origin: Origin::Chord,
                }]
            }
            TargetState::Released => {
                // Only a source pressed again after the chord let go has anything to release.
                let mut out: Vec<Output> = self.resolve(idx, Origin::Tap).into_iter().collect();
                let source = &mut self.sources[idx];
                if source.emitted {
                    source.emitted = false;
                    out.push(Output::Passthrough(frame));
                }
                source.down = false;
                self.settle();
                out
            }
            TargetState::Idle => {
                let mut out: Vec<Output> = self.resolve(idx, Origin::Tap).into_iter().collect();
                self.sources[idx].emitted = false;
                out.push(Output::Passthrough(frame));
                out
            }
        }
    }

    fn source_repeat(&mut self, idx: usize, frame: InputEventFrame) -> Vec<Output> {
        // Repeats only make sense once the key's own press is out.
        if self.state == TargetState::Idle && !self.is_pending(idx) {
            vec![Output::Passthrough(frame)]
        } else {
            Vec::new()
        }
    }

    fn settle(&mut self) {
        if self.state == TargetState::Released && self.sources.iter().all(|source| !source.down) {
            self.state = TargetState::Idle;
            debug!("All source keys up");
        }
    }
}
