use serde::{Deserialize, Serialize};

/// Streaming session state machine.
///
/// State transitions:
/// ```text
/// idle → configured → capturing → streaming → stopping → configured
///   ↑                                                        │
///   └──────────────────────── release() ─────────────────────┘
/// ```
///
/// Capture activity is tracked next to the state: a session that stopped
/// streaming settles in `Configured` while its capture may still be running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    Configured,
    Capturing,
    Streaming,
    Stopping,
}

impl SessionState {
    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }

    pub fn is_configured(&self) -> bool {
        !matches!(self, Self::Idle)
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self, Self::Streaming)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Configured => "configured",
            Self::Capturing => "capturing",
            Self::Streaming => "streaming",
            Self::Stopping => "stopping",
        }
    }
}
