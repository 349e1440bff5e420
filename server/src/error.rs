use crate::session::ConnectionId;
use shared::CodecError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid config file: {0}")]
    ConfigFile(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("unknown connection {0}")]
    UnknownConnection(ConnectionId),

    #[error("connection {0} is already closed")]
    ConnectionClosed(ConnectionId),

    #[error("endpoint {0} registered twice")]
    DuplicateEndpoint(u32),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errors_convert_and_describe_themselves() {
        let err: ServerError = CodecError::InvalidUtf8 { offset: 3 }.into();
        assert!(matches!(err, ServerError::Codec(_)));

        let err: ServerError = serde_json::from_str::<u32>("nope").unwrap_err().into();
        assert!(err.to_string().starts_with("invalid config file"));
        assert_eq!(
            ServerError::UnknownConnection(4).to_string(),
            "unknown connection 4"
        );
    }
}
