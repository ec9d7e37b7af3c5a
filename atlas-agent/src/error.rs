use thiserror::Error;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Malformed {kind} object: {reason}")]
    MalformedObject { kind: &'static str, reason: String },

    #[error("Kubernetes error: {0}")]
    Kubernetes(String),

    #[error("Container runtime error: {0}")]
    Runtime(String),

    #[error("Config server error: {0}")]
    ConfigServer(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl AgentError {
    pub fn malformed(kind: &'static str, reason: impl Into<String>) -> Self {
        Self::MalformedObject {
            kind,
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, AgentError>;
