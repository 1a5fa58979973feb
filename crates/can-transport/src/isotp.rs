//! ISO 15765-2 (ISO-TP) segmentation for classic CAN, normal addressing.
//!
//! The module is split along the direction of traffic: [`Segmenter`] turns one
//! outgoing payload into frame data, [`Reassembler`] consumes incoming frame
//! data and yields complete payloads plus the flow-control frames that have to
//! be answered. Neither touches the bus; callers move the bytes.

use crate::IsoTpError;
use std::time::Duration;

/// Largest payload expressible by a classic first frame.
pub const MAX_PAYLOAD: usize = 4095;

const SF_MAX_DATA: usize = 7;
const FF_DATA: usize = 6;
const CF_DATA: usize = 7;

const PCI_SINGLE: u8 = 0x0;
const PCI_FIRST: u8 = 0x1;
const PCI_CONSECUTIVE: u8 = 0x2;
const PCI_FLOW: u8 = 0x3;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlowStatus {
    Continue,
    Wait,
    Overflow,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FlowControl {
    pub status: FlowStatus,
    /// Consecutive frames allowed before the next flow control; 0 = unlimited.
    pub block_size: u8,
    pub st_min: Duration,
}

impl FlowControl {
    pub fn continue_to_send(block_size: u8, st_min: Duration) -> Self {
        Self {
            status: FlowStatus::Continue,
            block_size,
            st_min,
        }
    }

    pub fn overflow() -> Self {
        Self {
            status: FlowStatus::Overflow,
            block_size: 0,
            st_min: Duration::ZERO,
        }
    }

    pub fn encode(&self) -> [u8; 3] {
        let status = match self.status {
            FlowStatus::Continue => 0,
            FlowStatus::Wait => 1,
            FlowStatus::Overflow => 2,
        };
        [PCI_FLOW << 4 | status, self.block_size, encode_st_min(self.st_min)]
    }

    fn decode(data: &[u8]) -> Result<Self, IsoTpError> {
        if data.len() < 3 {
            return Err(IsoTpError::Truncated);
        }
        let status = match data[0] & 0x0F {
            0 => FlowStatus::Continue,
            1 => FlowStatus::Wait,
            2 => FlowStatus::Overflow,
            _ => return Err(IsoTpError::UnknownPci(data[0])),
        };
        Ok(Self {
            status,
            block_size: data[1],
            st_min: decode_st_min(data[2]),
        })
    }
}

fn encode_st_min(st_min: Duration) -> u8 {
    let us = st_min.as_micros();
    if us == 0 {
        0
    } else if us < 1000 {
        // 0xF1..=0xF9 encode 100..=900 us
        0xF0 + (us / 100).clamp(1, 9) as u8
    } else {
        (us / 1000).min(0x7F) as u8
    }
}

fn decode_st_min(raw: u8) -> Duration {
    match raw {
        0x00..=0x7F => Duration::from_millis(u64::from(raw)),
        0xF1..=0xF9 => Duration::from_micros(u64::from(raw - 0xF0) * 100),
        // reserved values are treated as the maximum
        _ => Duration::from_millis(0x7F),
    }
}

/// A decoded protocol control information header.
#[derive(Debug, PartialEq, Eq)]
pub enum Pci<'a> {
    Single(&'a [u8]),
    First { total: usize, data: &'a [u8] },
    Consecutive { seq: u8, data: &'a [u8] },
    Flow(FlowControl),
}

pub fn parse(data: &[u8]) -> Result<Pci<'_>, IsoTpError> {
    let head = *data.first().ok_or(IsoTpError::Truncated)?;
    match head >> 4 {
        PCI_SINGLE => {
            let len = usize::from(head & 0x0F);
            if len == 0 || len > SF_MAX_DATA {
                return Err(IsoTpError::UnknownPci(head));
            }
            data.get(1..1 + len)
                .map(Pci::Single)
                .ok_or(IsoTpError::Truncated)
        }
        PCI_FIRST => {
            if data.len() < 2 {
                return Err(IsoTpError::Truncated);
            }
            let total = usize::from(head & 0x0F) << 8 | usize::from(data[1]);
            if total <= SF_MAX_DATA {
                return Err(IsoTpError::UnknownPci(head));
            }
            Ok(Pci::First {
                total,
                data: &data[2..],
            })
        }
        PCI_CONSECUTIVE => Ok(Pci::Consecutive {
            seq: head & 0x0F,
            data: &data[1..],
        }),
        PCI_FLOW => FlowControl::decode(data).map(Pci::Flow),
        _ => Err(IsoTpError::UnknownPci(head)),
    }
}

/// Splits one outgoing payload into single/first/consecutive frame data.
pub struct Segmenter<'a> {
    payload: &'a [u8],
    offset: usize,
    seq: u8,
}

impl<'a> Segmenter<'a> {
    pub fn new(payload: &'a [u8]) -> Result<Self, IsoTpError> {
        if payload.is_empty() {
            return Err(IsoTpError::EmptyPayload);
        }
        if payload.len() > MAX_PAYLOAD {
            return Err(IsoTpError::PayloadTooLarge(payload.len()));
        }
        Ok(Self {
            payload,
            offset: 0,
            seq: 1,
        })
    }

    pub fn is_single(&self) -> bool {
        self.payload.len() <= SF_MAX_DATA
    }

    /// Data of the single frame or first frame.
    pub fn first(&mut self) -> Vec<u8> {
        let len = self.payload.len();
        if self.is_single() {
            self.offset = len;
            let mut out = Vec::with_capacity(1 + len);
            out.push(PCI_SINGLE << 4 | len as u8);
            out.extend_from_slice(self.payload);
            return out;
        }
        self.offset = FF_DATA;
        let mut out = Vec::with_capacity(8);
        out.push(PCI_FIRST << 4 | (len >> 8) as u8 & 0x0F);
        out.push(len as u8);
        out.extend_from_slice(&self.payload[..FF_DATA]);
        out
    }

    pub fn next_consecutive(&mut self) -> Option<Vec<u8>> {
        if self.is_done() {
            return None;
        }
        let end = (self.offset + CF_DATA).min(self.payload.len());
        let mut out = Vec::with_capacity(8);
        out.push(PCI_CONSECUTIVE << 4 | self.seq);
        out.extend_from_slice(&self.payload[self.offset..end]);
        self.offset = end;
        self.seq = (self.seq + 1) & 0x0F;
        Some(out)
    }

    pub fn is_done(&self) -> bool {
        self.offset >= self.payload.len()
    }
}

/// Outcome of feeding one frame to a [`Reassembler`].
#[derive(Debug, PartialEq, Eq)]
pub enum RxEvent {
    /// More consecutive frames are expected.
    Pending,
    /// The given flow control must be sent back to the transmitter.
    SendFlow(FlowControl),
    /// A payload is complete.
    Complete(Vec<u8>),
    /// A flow control for our own outgoing transfer was received.
    Flow(FlowControl),
}

pub struct Reassembler {
    buf: Vec<u8>,
    expected: usize,
    next_seq: u8,
    in_block: u8,
    capacity: usize,
    block_size: u8,
    st_min: Duration,
}

impl Reassembler {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: Vec::new(),
            expected: 0,
            next_seq: 1,
            in_block: 0,
            capacity: capacity.min(MAX_PAYLOAD),
            block_size: 8,
            st_min: Duration::ZERO,
        }
    }

    pub fn with_flow(mut self, block_size: u8, st_min: Duration) -> Self {
        self.block_size = block_size;
        self.st_min = st_min;
        self
    }

    pub fn is_idle(&self) -> bool {
        self.expected == 0
    }

    pub fn reset(&mut self) {
        self.buf.clear();
        self.expected = 0;
        self.next_seq = 1;
        self.in_block = 0;
    }

    pub fn on_frame(&mut self, data: &[u8]) -> Result<RxEvent, IsoTpError> {
        match parse(data)? {
            Pci::Single(payload) => {
                self.reset();
                Ok(RxEvent::Complete(payload.to_vec()))
            }
            Pci::First { total, data } => {
                self.reset();
                if total > self.capacity {
                    return Ok(RxEvent::SendFlow(FlowControl::overflow()));
                }
                self.expected = total;
                self.buf.reserve(total);
                self.buf.extend_from_slice(&data[..data.len().min(total)]);
                Ok(RxEvent::SendFlow(FlowControl::continue_to_send(
                    self.block_size,
                    self.st_min,
                )))
            }
            Pci::Consecutive { seq, data } => {
                if self.is_idle() {
                    return Err(IsoTpError::Unexpected);
                }
                if seq != self.next_seq {
                    let expected = self.next_seq;
                    self.reset();
                    return Err(IsoTpError::Sequence { expected, got: seq });
                }
                let remaining = self.expected - self.buf.len();
                self.buf
                    .extend_from_slice(&data[..data.len().min(remaining)]);
                self.next_seq = (self.next_seq + 1) & 0x0F;
                if self.buf.len() >= self.expected {
                    let payload = std::mem::take(&mut self.buf);
                    self.reset();
                    return Ok(RxEvent::Complete(payload));
                }
                self.in_block = self.in_block.wrapping_add(1);
                if self.block_size > 0 && self.in_block >= self.block_size {
                    self.in_block = 0;
                    return Ok(RxEvent::SendFlow(FlowControl::continue_to_send(
                        self.block_size,
                        self.st_min,
                    )));
                }
                Ok(RxEvent::Pending)
            }
            Pci::Flow(fc) => Ok(RxEvent::Flow(fc)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_payload_is_single_frame() {
        let mut seg = Segmenter::new(b"?info").unwrap();
        assert!(seg.is_single());
        assert_eq!(seg.first(), b"\x05?info".to_vec());
        assert!(seg.is_done());
        assert_eq!(seg.next_consecutive(), None);
    }

    #[test]
    fn test_segment_and_reassemble() {
        let payload: Vec<u8> = (0u8..40).collect();
        let mut seg = Segmenter::new(&payload).unwrap();
        let mut rx = Reassembler::new(512).with_flow(0, Duration::ZERO);

        let first = seg.first();
        assert_eq!(first[0], 0x10);
        assert_eq!(first[1], 40);
        match rx.on_frame(&first).unwrap() {
            RxEvent::SendFlow(fc) => assert_eq!(fc.status, FlowStatus::Continue),
            other => panic!("unexpected {other:?}"),
        }

        let mut done = None;
        while let Some(cf) = seg.next_consecutive() {
            if let RxEvent::Complete(p) = rx.on_frame(&cf).unwrap() {
                done = Some(p);
            }
        }
        assert_eq!(done, Some(payload));
        assert!(rx.is_idle());
    }

    #[test]
    fn test_block_size_requests_flow_control() {
        let payload = vec![0xAB; 6 + 7 * 3];
        let mut seg = Segmenter::new(&payload).unwrap();
        let mut rx = Reassembler::new(512).with_flow(2, Duration::ZERO);
        rx.on_frame(&seg.first()).unwrap();
        let cf1 = seg.next_consecutive().unwrap();
        let cf2 = seg.next_consecutive().unwrap();
        assert_eq!(rx.on_frame(&cf1).unwrap(), RxEvent::Pending);
        assert!(matches!(rx.on_frame(&cf2).unwrap(), RxEvent::SendFlow(_)));
    }

    #[test]
    fn test_out_of_sequence_resets() {
        let payload = vec![1u8; 20];
        let mut seg = Segmenter::new(&payload).unwrap();
        let mut rx = Reassembler::new(512);
        rx.on_frame(&seg.first()).unwrap();
        let _skipped = seg.next_consecutive();
        let cf = seg.next_consecutive().unwrap();
        assert_eq!(
            rx.on_frame(&cf),
            Err(IsoTpError::Sequence {
                expected: 1,
                got: 2
            })
        );
        assert!(rx.is_idle());
    }

    #[test]
    fn test_oversized_transfer_gets_overflow() {
        let payload = vec![0u8; 600];
        let mut seg = Segmenter::new(&payload).unwrap();
        let mut rx = Reassembler::new(512);
        assert_eq!(
            rx.on_frame(&seg.first()).unwrap(),
            RxEvent::SendFlow(FlowControl::overflow())
        );
    }

    #[test]
    fn test_flow_control_roundtrip_st_min() {
        let fc = FlowControl::continue_to_send(8, Duration::from_micros(300));
        let raw = fc.encode();
        assert_eq!(raw, [0x30, 8, 0xF3]);
        assert_eq!(parse(&raw).unwrap(), Pci::Flow(fc));
    }

    #[test]
    fn test_rejects_empty_and_huge_payloads() {
        assert!(matches!(Segmenter::new(&[]), Err(IsoTpError::EmptyPayload)));
        let huge = vec![0u8; MAX_PAYLOAD + 1];
        assert!(matches!(
            Segmenter::new(&huge),
            Err(IsoTpError::PayloadTooLarge(_))
        ));
    }
}
