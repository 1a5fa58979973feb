use crate::{BusInfo, CanFilter, CanFrame, Result, TransportError};

/// A minimal blocking CAN bus interface.
///
/// Receive and send both take `&mut self`; links that share one bus between a
/// receive task and request senders wrap it in a mutex and keep `recv`
/// timeouts short.
pub trait CanBus {
    /// Open a CAN interface by name (e.g., "can0", "/dev/ttyACM0").
    fn open(name: &str) -> Result<Self>
    where
        Self: Sized;

    /// Attempt to list available interfaces for this backend.
    fn list() -> Result<Vec<BusInfo>>
    where
        Self: Sized;

    /// Set acceptance filters if supported.
    fn set_filters(&mut self, _filters: &[CanFilter]) -> Result<()> {
        Err(TransportError::Unsupported("filters not supported"))
    }

    /// Receive one frame (blocking with optional timeout in milliseconds).
    fn recv(&mut self, timeout_ms: Option<u64>) -> Result<CanFrame>;

    /// Send one frame.
    fn send(&mut self, frame: &CanFrame) -> Result<()>;
}
