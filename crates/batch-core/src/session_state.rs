use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    #[default]
    Disconnected,
    Connecting,
    Ready,
    Faulted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    ConnectStarted,
    ConnectSucceeded,
    ConnectFailed,
    IoFailed,
    Closed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Ready => "ready",
            SessionState::Faulted => "faulted",
        }
    }

    /// Numeric code exported as a gauge (0=disconnected,1=connecting,2=ready,3=faulted).
    pub fn code(&self) -> f64 {
        match self {
            SessionState::Disconnected => 0.0,
            SessionState::Connecting => 1.0,
            SessionState::Ready => 2.0,
            SessionState::Faulted => 3.0,
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, SessionState::Ready)
    }

    pub fn next(self, event: SessionEvent) -> SessionState {
        match (self, event) {
            (_, SessionEvent::Closed) => SessionState::Disconnected,
            (_, SessionEvent::ConnectStarted) => SessionState::Connecting,
            (SessionState::Connecting, SessionEvent::ConnectSucceeded) => SessionState::Ready,
            (_, SessionEvent::ConnectFailed) => SessionState::Faulted,
            (SessionState::Ready, SessionEvent::IoFailed) => SessionState::Faulted,
            // An I/O failure outside Ready leaves the state as it was.
            (state, SessionEvent::IoFailed) => state,
            // A late connect success after a reset is ignored.
            (state, SessionEvent::ConnectSucceeded) => state,
        }
    }
}
