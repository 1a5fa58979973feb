//! Per-device binding of wire format and link.

use std::fmt;
use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;

use thingset::{cbor, text, Method, UriElements};
use ts_link::Link;

use crate::types::{Response, TransportKind, SELF_ADDRESS, SERIAL_ADDRESS};
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireFormat {
    /// `line_terminated` appends `\n` to every request.
    Text { line_terminated: bool },
    Binary,
}

/// How requests for one device are built, sent and decoded.
#[derive(Clone)]
pub struct Driver {
    pub kind: TransportKind,
    pub format: WireFormat,
    pub address: u8,
    pub timeout: Duration,
    link: Arc<dyn Link>,
}

impl fmt::Debug for Driver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Driver")
            .field("kind", &self.kind)
            .field("format", &self.format)
            .field("address", &self.address)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl Driver {
    pub fn local(link: Arc<dyn Link>) -> Self {
        Self {
            kind: TransportKind::Local,
            format: WireFormat::Text {
                line_terminated: true,
            },
            address: SELF_ADDRESS,
            timeout: Duration::ZERO,
            link,
        }
    }

    pub fn serial(link: Arc<dyn Link>, timeout: Duration) -> Self {
        Self {
            kind: TransportKind::Serial,
            format: WireFormat::Text {
                line_terminated: true,
            },
            address: SERIAL_ADDRESS,
            timeout,
            link,
        }
    }

    /// CAN devices get either CBOR or unterminated text requests.
    pub fn can(link: Arc<dyn Link>, address: u8, binary: bool, timeout: Duration) -> Self {
        let format = if binary {
            WireFormat::Binary
        } else {
            WireFormat::Text {
                line_terminated: false,
            }
        };
        Self {
            kind: TransportKind::Can,
            format,
            address,
            timeout,
            link,
        }
    }

    pub fn build_query(&self, method: Method, uri: &UriElements<'_>) -> Result<Vec<u8>> {
        let query = match self.format {
            WireFormat::Text { line_terminated } => {
                text::build_query(method, uri, line_terminated)?.into_bytes()
            }
            WireFormat::Binary => cbor::build_query(method, uri)?,
        };
        Ok(query)
    }

    pub fn send(&self, query: &[u8]) -> Result<Vec<u8>> {
        Ok(self.link.send(query, self.address, self.timeout)?)
    }

    pub fn decode_status(&self, block: &[u8]) -> Option<u8> {
        match self.format {
            WireFormat::Text { .. } => std::str::from_utf8(block).ok().and_then(text::response_status),
            WireFormat::Binary => cbor::response_status(block),
        }
    }

    /// Turns a raw response into a block whose payload part is JSON text.
    ///
    /// Binary blocks are consumed and rebuilt, so the status must be read
    /// before calling this.
    pub fn decode_payload(&self, block: Vec<u8>) -> Result<(Vec<u8>, Option<Range<usize>>)> {
        match self.format {
            WireFormat::Text { .. } => {
                let range = std::str::from_utf8(&block)
                    .ok()
                    .and_then(|line| text::parse_response(line).1)
                    .map(|payload| block.len() - payload.len()..block.len());
                Ok((block, range))
            }
            WireFormat::Binary => {
                let status = cbor::response_status(&block);
                let payload = cbor::response_payload(block)?;
                let mut out: Vec<u8> = status.into_iter().collect();
                let range = payload.map(|json| {
                    let start = out.len();
                    out.extend_from_slice(json.as_bytes());
                    start..out.len()
                });
                Ok((out, range))
            }
        }
    }

    /// Status first, then payload.
    pub fn decode(&self, block: Vec<u8>) -> Result<Response> {
        let status = self.decode_status(&block);
        let (block, data) = self.decode_payload(block)?;
        Ok(Response {
            status,
            block,
            data,
        })
    }

    /// Builds, sends and decodes one request.
    pub fn request(&self, method: Method, uri: &UriElements<'_>) -> Result<Response> {
        let query = self.build_query(method, uri)?;
        let block = self.send(&query)?;
        self.decode(block)
    }
}
