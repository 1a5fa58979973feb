use std::ops::Range;

use serde::{Deserialize, Serialize};
use thingset::{http_status, StatusCode};

/// Registry slot and CAN address of the gateway itself.
pub const SELF_ADDRESS: u8 = 0;

/// Transport address of a device on a point-to-point serial link.
pub const SERIAL_ADDRESS: u8 = u8::MAX;

pub const DEFAULT_CAPACITY: usize = 10;

/// Name the gateway's own device is listed under.
pub const SELF_NAME: &str = "self";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    Local,
    Serial,
    Can,
}

/// Identity of a resolved device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub device_id: String,
    pub name: String,
    pub address: u8,
    pub transport: TransportKind,
}

/// Lifecycle of one registry slot, as reported by
/// [`crate::Registry::slots`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SlotState {
    AddressKnown { address: u8 },
    Resolved(DeviceInfo),
}

/// Outcome of one executed request.
///
/// `block` is the decoded response; for text devices it is the raw line, for
/// binary devices the status byte followed by the payload as JSON.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: Option<u8>,
    pub block: Vec<u8>,
    pub data: Option<Range<usize>>,
}

impl Response {
    /// Payload of the response as JSON text.
    pub fn data(&self) -> Option<&str> {
        let range = self.data.clone()?;
        std::str::from_utf8(self.block.get(range)?).ok()
    }

    pub fn status_code(&self) -> Option<StatusCode> {
        self.status.and_then(StatusCode::from_u8)
    }

    /// HTTP status to answer the caller with; a response without a readable
    /// status is an internal error.
    pub fn http_status(&self) -> u16 {
        self.status.map_or(500, http_status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_accessors() {
        let resp = Response {
            status: Some(0x85),
            block: b":85 Content. {\"a\":1}".to_vec(),
            data: Some(13..20),
        };
        assert_eq!(resp.data(), Some("{\"a\":1}"));
        assert_eq!(resp.status_code(), Some(StatusCode::Content));
        assert_eq!(resp.http_status(), 200);

        let broken = Response {
            status: None,
            block: b"garbage".to_vec(),
            data: None,
        };
        assert_eq!(broken.data(), None);
        assert_eq!(broken.http_status(), 500);
    }

    #[test]
    fn test_slot_state_json() {
        let s = SlotState::AddressKnown { address: 20 };
        assert_eq!(
            serde_json::to_string(&s).unwrap(),
            r#"{"state":"address_known","address":20}"#
        );
    }
}
