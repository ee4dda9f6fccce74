use argus_proto::{ErrorKind, WireError};
use thiserror::Error;

/// Errors surfaced from world operations. Maps 1:1 onto the wire error
/// kinds so the server boundary is a straight conversion.
#[derive(Debug, Error)]
pub enum WorldError {
    #[error("entity not found: {0}")]
    NotFound(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("permission denied")]
    PermissionDenied,
    #[error("canceled")]
    Canceled,
    #[error("internal: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<&WorldError> for WireError {
    fn from(err: &WorldError) -> Self {
        let kind = match err {
            WorldError::NotFound(_) => ErrorKind::NotFound,
            WorldError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            WorldError::PermissionDenied => ErrorKind::PermissionDenied,
            WorldError::Canceled => ErrorKind::Canceled,
            WorldError::Internal(_) => ErrorKind::Internal,
        };
        WireError::new(kind, err.to_string())
    }
}

/// A sink write failure. Terminates the one stream it belongs to and
/// nothing else.
#[derive(Debug, Error)]
pub enum SendError {
    #[error("receiver closed")]
    Closed,
    #[error("send failed: {0}")]
    Other(anyhow::Error),
}

/// Errors from the world file load/flush path.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("document {index}: {source}")]
    Parse { index: usize, source: serde_yaml::Error },
    #[error("serialize: {0}")]
    Serialize(serde_yaml::Error),
    #[error("{0}")]
    World(#[from] WorldError),
}
