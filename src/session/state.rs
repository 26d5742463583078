/// Device session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No UUID yet
    Unregistered,
    /// UUID known, no session with the relay
    Registered,
    /// Start-session request outstanding
    SessionStarting,
    /// Main loop running
    Running,
    /// Stopped, either on request or after a fatal identity error
    Stopped,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unregistered => "unregistered",
            Self::Registered => "registered",
            Self::SessionStarting => "session-starting",
            Self::Running => "running",
            Self::Stopped => "stopped",
        }
    }

    /// Whether `next` may follow this state.
    pub fn can_transition(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Unregistered, Registered)
                | (Registered, SessionStarting)
                | (SessionStarting, Running)
                | (_, Stopped)
        )
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
