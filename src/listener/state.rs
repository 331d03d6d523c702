use std::fmt;

/// Lifecycle of one folder listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListenerState {
    /// No session. Waiting for the lease, a backoff delay, or the first connect.
    Disconnected,
    Authenticating,
    Selecting,
    /// Restoring the cursor and running catch-up.
    Syncing,
    /// Waiting for IDLE push.
    Idle,
    /// Waiting for the next poll tick.
    Polling,
    Fetching,
    /// Gave up: terminal auth failure or too many consecutive failures.
    /// Nothing restarts the listener until an operator reset.
    Suspended,
    /// Exited after a stop request.
    Stopped,
}

impl ListenerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ListenerState::Disconnected => "disconnected",
            ListenerState::Authenticating => "authenticating",
            ListenerState::Selecting => "selecting",
            ListenerState::Syncing => "syncing",
            ListenerState::Idle => "idle",
            ListenerState::Polling => "polling",
            ListenerState::Fetching => "fetching",
            ListenerState::Suspended => "suspended",
            ListenerState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for ListenerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
