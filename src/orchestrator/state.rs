use serde::{Deserialize, Serialize};

/// Bootstrap decision state. Exactly one value is active at a time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "endpoint", rename_all = "snake_case")]
pub enum ApplicationState {
    Initializing,
    PreparingData,
    Verifying,
    Verified,
    /// Redirect to the resolved endpoint. Terminal and locked.
    Ready(String),
    /// Native experience. Terminal for the current cycle.
    Standby,
    /// Connectivity lost while undecided. Resolves only to `Standby`.
    Disconnected,
}

impl ApplicationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::PreparingData => "preparing_data",
            Self::Verifying => "verifying",
            Self::Verified => "verified",
            Self::Ready(_) => "ready",
            Self::Standby => "standby",
            Self::Disconnected => "disconnected",
        }
    }

    pub fn endpoint(&self) -> Option<&str> {
        match self {
            Self::Ready(endpoint) => Some(endpoint),
            _ => None,
        }
    }

    /// Whether a UI can render this state as a final decision.
    pub fn is_settled(&self) -> bool {
        matches!(self, Self::Ready(_) | Self::Standby)
    }
}

impl std::fmt::Display for ApplicationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ready(endpoint) => write!(f, "ready({endpoint})"),
            other => f.write_str(other.as_str()),
        }
    }
}
