//! Session state machine.

/// Externally visible state of a live voice session.
///
/// `Idle → Connecting → Listening ⇄ Thinking ⇄ Speaking`, with any state
/// able to reach `Closed` (explicit stop) or `Failed` (device/transport
/// error). Terminal states are never left.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Listening,
    Thinking,
    Speaking,
    Closed,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Failed)
    }

    /// Whether `self → next` is a legal transition.
    pub fn can_transition(self, next: SessionState) -> bool {
        use SessionState::*;
        if self.is_terminal() {
            return false;
        }
        // Stop and failure are reachable from every live state.
        if matches!(next, Closed | Failed) {
            return true;
        }
        matches!(
            (self, next),
            (Idle, Connecting)
                | (Connecting, Listening)
                | (Listening, Thinking)
                | (Listening, Speaking)
                | (Thinking, Listening)
                | (Thinking, Speaking)
                | (Speaking, Listening)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::SessionState::*;

    #[test]
    fn terminal_states_are_sticky() {
        for next in [Idle, Connecting, Listening, Thinking, Speaking, Closed, Failed] {
            assert!(!Closed.can_transition(next));
            assert!(!Failed.can_transition(next));
        }
    }

    #[test]
    fn stop_and_failure_reachable_from_any_live_state() {
        for from in [Idle, Connecting, Listening, Thinking, Speaking] {
            assert!(from.can_transition(Closed));
            assert!(from.can_transition(Failed));
        }
    }

    #[test]
    fn conversation_cycle() {
        assert!(Idle.can_transition(Connecting));
        assert!(Connecting.can_transition(Listening));
        assert!(Listening.can_transition(Speaking));
        assert!(Speaking.can_transition(Listening));
        assert!(Listening.can_transition(Thinking));
        assert!(Thinking.can_transition(Speaking));
        assert!(!Speaking.can_transition(Connecting));
        assert!(!Idle.can_transition(Speaking));
    }
}
