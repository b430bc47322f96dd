pub mod close;
pub mod codec;

pub use close::{CloseCode, CloseStatus, Disposition};
pub use codec::{decode, encode_data, DecodeError, Frame, MAX_DATA_PAYLOAD, MIN_READ_SIZE};

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("read buffer too small: {got} bytes (min: {min})")]
    BufferTooSmall { min: usize, got: usize },

    #[error("invalid server response: {0}")]
    InvalidServerResponse(String),

    #[error("server closed stream: {0}")]
    ServerClosedStream(CloseStatus),

    #[error("stream closed")]
    StreamClosed,

    #[error("operation cancelled")]
    Cancelled,

    #[error("frame too large: {got} bytes (max: {max})")]
    FrameTooLarge { max: usize, got: usize },

    #[error("transport error: {0}")]
    Transport(String),
}

impl From<DecodeError> for RelayError {
    fn from(err: DecodeError) -> Self {
        RelayError::InvalidServerResponse(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;
