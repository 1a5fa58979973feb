use thiserror::Error;
use ts_link::LinkError;

pub type Result<T, E = RegistryError> = core::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("device not connected: {0}")]
    DeviceNotFound(String),
    #[error("no device id in request")]
    NoDevice,
    #[error("registry full ({0} slots)")]
    Full(usize),
    #[error("link: {0}")]
    Link(#[from] LinkError),
    #[error("codec: {0}")]
    Codec(#[from] thingset::Error),
    #[error("device at address {address} did not identify itself: {reason}")]
    Resolve { address: u8, reason: String },
}
