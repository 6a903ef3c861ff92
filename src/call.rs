//! Call lifecycle state machine
//!
//! idle → connecting → connected → ended | error. Idle, ended and error are
//! start points; every other transition is rejected.

use crate::events::CallState;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid call transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: CallState,
    pub to: CallState,
}

/// Why a call is leaving its active states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    UserStop,
    RemoteClosed,
    Failed,
}

#[derive(Debug, Default)]
pub struct CallStateMachine {
    state: CallState,
}

impl CallStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    fn transition(&mut self, to: CallState) -> Result<CallState, InvalidTransition> {
        let from = self.state;
        let allowed = match to {
            CallState::Connecting => from.can_start(),
            CallState::Connected => from == CallState::Connecting,
            CallState::Ended | CallState::Error => from.is_active(),
            CallState::Idle => false,
        };
        if !allowed {
            return Err(InvalidTransition { from, to });
        }
        debug!(%from, %to, "call transition");
        self.state = to;
        Ok(from)
    }

    pub fn begin_start(&mut self) -> Result<CallState, InvalidTransition> {
        self.transition(CallState::Connecting)
    }

    pub fn connected(&mut self) -> Result<CallState, InvalidTransition> {
        self.transition(CallState::Connected)
    }

    /// Move to the terminal state matching `reason`.
    pub fn end(&mut self, reason: EndReason) -> Result<CallState, InvalidTransition> {
        match reason {
            EndReason::UserStop | EndReason::RemoteClosed => self.transition(CallState::Ended),
            EndReason::Failed => self.transition(CallState::Error),
        }
    }
}
