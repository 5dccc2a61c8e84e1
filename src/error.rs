use thiserror::Error;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("no running instance for workload {namespace}/{workload}")]
    NotFound { namespace: String, workload: String },

    #[error("container {container} in {instance} is not running")]
    ContainerNotReady { instance: String, container: String },

    #[error("exec transport to {target} failed: {message}")]
    Transport { target: String, message: String },

    #[error("no session matching '{marker}' in {instance}; the server process is not running")]
    SessionNotFound { instance: String, marker: String },

    #[error("console channel is closed")]
    ChannelClosed,

    #[error("Invalid JSON format")]
    MalformedInput(String),

    #[error("{context}: {message}")]
    Orchestrator { context: String, message: String },
}

impl BridgeError {
    pub fn transport(target: impl Into<String>, error: impl std::fmt::Display) -> Self {
        Self::Transport {
            target: target.into(),
            message: error.to_string(),
        }
    }

    pub fn orchestrator(context: impl Into<String>, error: impl std::fmt::Display) -> Self {
        Self::Orchestrator {
            context: context.into(),
            message: error.to_string(),
        }
    }

    /// Normal end-of-session signals that should not be reported as failures.
    pub fn is_terminal_signal(&self) -> bool {
        matches!(self, Self::ChannelClosed)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not_found",
            Self::ContainerNotReady { .. } => "container_not_ready",
            Self::Transport { .. } => "transport_error",
            Self::SessionNotFound { .. } => "session_not_found",
            Self::ChannelClosed => "channel_closed",
            Self::MalformedInput(_) => "malformed_input",
            Self::Orchestrator { .. } => "orchestrator_error",
        }
    }
}

pub type BridgeResult<T> = std::result::Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::BridgeError;

    #[test]
    fn malformed_input_renders_browser_message() {
        let error = BridgeError::MalformedInput("expected value at line 1".to_string());
        assert_eq!(error.to_string(), "Invalid JSON format");
        assert_eq!(error.kind(), "malformed_input");
    }

    #[test]
    fn session_not_found_is_distinct_from_transport() {
        let missing = BridgeError::SessionNotFound {
            instance: "default/mc-0".to_string(),
            marker: "minecraft".to_string(),
        };
        let transport = BridgeError::transport("default/mc-0", "connection reset");
        assert!(missing.to_string().contains("server process is not running"));
        assert_ne!(missing.kind(), transport.kind());
        assert!(!missing.is_terminal_signal());
        assert!(BridgeError::ChannelClosed.is_terminal_signal());
    }
}
