//! Agent activity derived from the session's event stream
//!
//! `reduce` is a pure function of the current state and one signal; the
//! session feeds it every relevant event in order.

use crate::events::ActivityState;

/// Inputs the activity state reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivitySignal {
    CallStarted,
    /// Agent text or audio fragment
    Fragment,
    TurnComplete,
    /// The last active playback unit finished
    PlaybackDrained,
    Interrupted,
    CallEnded,
}

pub fn reduce(state: ActivityState, signal: ActivitySignal) -> ActivityState {
    use ActivitySignal::*;
    use ActivityState::*;

    match (state, signal) {
        (_, CallStarted) => Listening,
        (_, CallEnded) => Idle,
        (Thinking, Fragment) => Speaking,
        (s, Fragment) => s,
        (_, TurnComplete) => Thinking,
        (Thinking, PlaybackDrained) => Thinking,
        (Idle, PlaybackDrained) => Idle,
        (_, PlaybackDrained) => Listening,
        (Idle, Interrupted) => Idle,
        (_, Interrupted) => Listening,
    }
}

#[derive(Debug, Default)]
pub struct ActivityTracker {
    state: ActivityState,
}

impl ActivityTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ActivityState {
        self.state
    }

    /// Apply a signal; returns true when the state changed.
    pub fn apply(&mut self, signal: ActivitySignal) -> bool {
        let next = reduce(self.state, signal);
        let changed = next != self.state;
        self.state = next;
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ActivitySignal::*;

    fn run(signals: &[ActivitySignal]) -> ActivityState {
        signals
            .iter()
            .fold(ActivityState::Idle, |s, &sig| reduce(s, sig))
    }

    #[test]
    fn test_turn_cycle() {
        assert_eq!(run(&[CallStarted]), ActivityState::Listening);
        assert_eq!(run(&[CallStarted, TurnComplete]), ActivityState::Thinking);
        assert_eq!(run(&[CallStarted, TurnComplete, Fragment]), ActivityState::Speaking);
        assert_eq!(
            run(&[CallStarted, TurnComplete, Fragment, PlaybackDrained]),
            ActivityState::Listening
        );
    }

    #[test]
    fn test_fragment_outside_thinking_keeps_state() {
        assert_eq!(run(&[CallStarted, Fragment]), ActivityState::Listening);
    }

    #[test]
    fn test_drain_while_thinking_stays_thinking() {
        assert_eq!(
            run(&[CallStarted, TurnComplete, Fragment, TurnComplete, PlaybackDrained]),
            ActivityState::Thinking
        );
    }

    #[test]
    fn test_interruption_returns_to_listening() {
        assert_eq!(
            run(&[CallStarted, TurnComplete, Fragment, Interrupted]),
            ActivityState::Listening
        );
        assert_eq!(run(&[CallStarted, TurnComplete, Interrupted]), ActivityState::Listening);
    }

    #[test]
    fn test_idle_outside_call() {
        assert_eq!(run(&[Interrupted, PlaybackDrained]), ActivityState::Idle);
        assert_eq!(run(&[CallStarted, TurnComplete, CallEnded]), ActivityState::Idle);
    }

    #[test]
    fn test_tracker_reports_changes() {
        let mut tracker = ActivityTracker::new();
        assert!(tracker.apply(CallStarted));
        assert!(!tracker.apply(Fragment));
        assert!(tracker.apply(TurnComplete));
        assert_eq!(tracker.state(), ActivityState::Thinking);
    }
}
