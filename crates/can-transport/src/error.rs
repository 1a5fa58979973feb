use thiserror::Error;

pub type Result<T, E = TransportError> = core::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("interface not found: {0}")]
    InterfaceNotFound(String),
    #[error("operation not supported on this backend: {0}")]
    Unsupported(&'static str),
    #[error("I/O error: {0}")]
    Io(String),
    #[error("timeout")]
    Timeout,
    #[error("invalid frame: {0}")]
    InvalidFrame(&'static str),
    #[error("ISO-TP: {0}")]
    IsoTp(#[from] IsoTpError),
}

/// Failures of the ISO 15765-2 segmentation layer.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum IsoTpError {
    #[error("payload of {0} bytes exceeds the ISO-TP limit")]
    PayloadTooLarge(usize),
    #[error("empty payload")]
    EmptyPayload,
    #[error("unknown protocol control information 0x{0:02X}")]
    UnknownPci(u8),
    #[error("frame too short for its PCI")]
    Truncated,
    #[error("consecutive frame out of sequence (expected {expected}, got {got})")]
    Sequence { expected: u8, got: u8 },
    #[error("consecutive frame without a first frame")]
    Unexpected,
    #[error("receiver reported overflow")]
    Overflow,
    #[error("no flow control from receiver")]
    FlowTimeout,
}
