use thiserror::Error;

#[derive(Error, Debug)]
pub enum NamingError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Path is required")]
    PathRequired,

    #[error("Path not found: {0}")]
    PathNotFound(String),

    #[error("Source or destination path not found: {source_path} -> {dest_path}")]
    SourceOrDestNotFound {
        source_path: String,
        dest_path: String,
    },

    #[error("Source and destination paths required")]
    SourceAndDestRequired,

    #[error("Path already exists: {0}")]
    AlreadyExists(String),

    #[error("Refusing to delete registration root {path} (shorter than {watermark} bytes)")]
    ProtectedPath { path: String, watermark: usize },

    #[error("Failed to connect to storage server {addr}: {source}")]
    ConnectFailure {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("No acknowledgment from storage server {0}")]
    NoAcknowledgment(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Unreadable command line: {0}")]
    InvalidLine(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Storage server registry is full ({0} servers)")]
    RegistryFull(usize),

    #[error("No storage server available")]
    NoStorageServer,

    #[error("Too many clients connected ({0})")]
    TooManyClients(usize),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl NamingError {
    /// The single line a client sees when its request fails.
    pub fn client_message(&self) -> String {
        match self {
            NamingError::PathRequired => "ERROR: Path is required".to_string(),
            // A protected registration root is indistinguishable from a missing
            // path on the wire.
            NamingError::PathNotFound(_) | NamingError::ProtectedPath { .. } => {
                "ERROR: Path not found".to_string()
            }
            NamingError::SourceOrDestNotFound { .. } => {
                "ERROR: Source or destination path not found".to_string()
            }
            NamingError::SourceAndDestRequired => {
                "ERROR: Source and destination paths required".to_string()
            }
            NamingError::AlreadyExists(_) => "ERROR: Path already there".to_string(),
            NamingError::ConnectFailure { .. } => {
                "ERROR: Failed to connect to Storage Server".to_string()
            }
            NamingError::NoAcknowledgment(_) => {
                "ERROR: No acknowledgment from Storage Server".to_string()
            }
            NamingError::InvalidOperation(_) | NamingError::InvalidLine(_) => {
                "ERROR: Invalid operation".to_string()
            }
            NamingError::NoStorageServer => "ERROR: No storage server available".to_string(),
            NamingError::TooManyClients(_) => "ERROR: Too many clients connected".to_string(),
            other => format!("ERROR: {}", other),
        }
    }
}

pub type Result<T> = std::result::Result<T, NamingError>;
