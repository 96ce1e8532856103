use crate::scheduler::Handle;
use evdev::KeyCode;

/// Whether the synthesized target key is currently in play.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub(crate) enum TargetState {
    #[default]
    Idle,
    Pressed,
    Released,
}

/// One configured source key.
#[derive(Clone, Debug)]
pub(crate) struct SourceKey {
    pub key: KeyCode,
    /// Delayed "plain press" waiting to either fire or be absorbed into a chord.
    pub pending: Option<Handle>,
    /// Held as part of a chord; all false exactly when the target is idle.
    pub down: bool,
    /// The key's own press has gone out, so its release must too.
    pub emitted: bool,
    /// Press sequence number, used to flush pending keys oldest first.
    pub last_press: u64,
}

impl SourceKey {
    fn new(key: KeyCode) -> Self {
        Self {
            key,
            pending: None,
            down: false,
            emitted: false,
            last_press: 0,
        }
    }
}

pub(crate) fn source_table(keys: &[KeyCode]) -> Vec<SourceKey> {
    keys.iter().copied().map(SourceKey::new).collect()
}
