use thiserror::Error;

pub type Result<T, E = Error> = core::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    /// The request has no target node (empty or missing URI).
    #[error("request has no target node")]
    MissingTarget,
    #[error("unsupported method code 0x{0:02X}")]
    UnsupportedMethod(u8),
    #[error("payload is not valid JSON: {0}")]
    InvalidPayload(#[from] serde_json::Error),
    #[error("out of memory while encoding request")]
    OutOfMemory,
    #[error("malformed CBOR: {0}")]
    Cbor(String),
}

impl From<minicbor::decode::Error> for Error {
    fn from(e: minicbor::decode::Error) -> Self {
        Error::Cbor(e.to_string())
    }
}
