use std::time::Duration;

use crate::Result;

/// One request/response exchange with a device.
///
/// `address` selects the device on shared buses and is ignored by
/// point-to-point links. Implementations serialize concurrent callers so that
/// exchanges never interleave on the wire.
pub trait Link: Send + Sync {
    fn send(&self, request: &[u8], address: u8, timeout: Duration) -> Result<Vec<u8>>;
}

impl<F> Link for F
where
    F: Fn(&[u8], u8, Duration) -> Result<Vec<u8>> + Send + Sync,
{
    fn send(&self, request: &[u8], address: u8, timeout: Duration) -> Result<Vec<u8>> {
        self(request, address, timeout)
    }
}
