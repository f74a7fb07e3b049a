use thiserror::Error;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Config error: {0}")]
    Config(String),

    /// Unparseable envelope or audio payload. The message is dropped.
    #[error("Malformed input: {0}")]
    MalformedInput(String),

    /// Invalid frame length or sample alignment. The frame is dropped.
    #[error("Codec error: {0}")]
    Codec(String),

    /// Recognition, dialogue, synthesis or intake failed. Aborts the current turn only.
    #[error("{service} failed: {message}")]
    Collaborator { service: String, message: String },

    #[error("Socket error: {0}")]
    Socket(String),

    /// A new call session could not be allocated.
    #[error("Call setup failed: {0}")]
    SessionSetup(String),

    #[error("Recording error: {0}")]
    Recording(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl DispatchError {
    pub fn collaborator(service: &str, message: impl std::fmt::Display) -> Self {
        Self::Collaborator {
            service: service.to_string(),
            message: message.to_string(),
        }
    }

    /// Short label used for log fields and metric labels.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::MalformedInput(_) => "malformed_input",
            Self::Codec(_) => "codec",
            Self::Collaborator { .. } => "collaborator",
            Self::Socket(_) => "socket",
            Self::SessionSetup(_) => "session_setup",
            Self::Recording(_) => "recording",
            Self::Io(_) => "io",
            Self::Json(_) => "json",
            Self::Other(_) => "other",
        }
    }
}

pub type Result<T> = std::result::Result<T, DispatchError>;
