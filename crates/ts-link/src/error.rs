use std::time::Duration;

use can_transport::{IsoTpError, TransportError};
use thiserror::Error;

pub type Result<T, E = LinkError> = core::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum LinkError {
    /// Another request held the channel for the whole acquire timeout.
    #[error("link busy")]
    Busy,
    #[error("no response within {0:?}")]
    Timeout(Duration),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serial port: {0}")]
    Serial(#[from] serialport::Error),
    #[error("CAN: {0}")]
    Bus(#[from] TransportError),
    #[error("ISO-TP: {0}")]
    IsoTp(#[from] IsoTpError),
}
