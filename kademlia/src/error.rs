use thiserror::Error as ThisError;

pub type Result<T> = std::result::Result<T, Error>;

/// Represents muddle's kademlia Error.
#[derive(ThisError, Debug)]
pub enum Error {
    #[error(transparent)]
    IO(#[from] std::io::Error),

    #[error("Invalid address size: expected {expected} bytes, got {got}")]
    InvalidAddressSize { expected: usize, got: usize },

    #[error("Invalid uri: {0}")]
    InvalidUri(String),

    #[error("Unknown rpc method: {0}")]
    UnknownRpcMethod(u8),

    #[error("Rpc error: {0}")]
    Rpc(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error(transparent)]
    MuddleCore(#[from] muddle_core::Error),
}

impl From<url::ParseError> for Error {
    fn from(err: url::ParseError) -> Self {
        Error::InvalidUri(err.to_string())
    }
}
