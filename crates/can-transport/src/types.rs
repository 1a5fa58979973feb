use core::fmt;
use time::OffsetDateTime;

/// Fixed upper bits of the 29-bit identifiers carrying ThingSet ISO-TP traffic.
pub const ISOTP_ID_PREFIX: u32 = 0x1ADA;

/// 11-bit or 29-bit CAN identifier
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct CanId {
    raw: u32,
    extended: bool,
}

impl CanId {
    pub fn standard(id11: u16) -> Option<Self> {
        if id11 <= 0x7FF {
            Some(Self {
                raw: id11 as u32,
                extended: false,
            })
        } else {
            None
        }
    }

    pub fn extended(id29: u32) -> Option<Self> {
        if id29 <= 0x1FFF_FFFF {
            Some(Self {
                raw: id29,
                extended: true,
            })
        } else {
            None
        }
    }

    /// Identifier of an ISO-TP frame travelling from `source` to `target`.
    pub fn isotp(target: u8, source: u8) -> Self {
        Self {
            raw: ISOTP_ID_PREFIX << 16 | (target as u32) << 8 | source as u32,
            extended: true,
        }
    }

    /// Returns `(target, source)` if this id belongs to the ISO-TP range.
    pub fn isotp_addresses(&self) -> Option<(u8, u8)> {
        if self.extended && self.raw >> 16 == ISOTP_ID_PREFIX {
            Some(((self.raw >> 8) as u8, self.raw as u8))
        } else {
            None
        }
    }

    /// Source node address of a publication frame (lowest byte).
    pub fn source_address(&self) -> u8 {
        self.raw as u8
    }

    /// Data node id carried in bits 8..24 of a publication frame.
    pub fn data_node_id(&self) -> u16 {
        (self.raw >> 8) as u16
    }

    pub fn raw(&self) -> u32 {
        self.raw
    }
    pub fn is_extended(&self) -> bool {
        self.extended
    }
}

impl fmt::Display for CanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.extended {
            write!(f, "0x{raw:08X}", raw = self.raw)
        } else {
            write!(f, "0x{raw:03X}", raw = self.raw)
        }
    }
}

/// A classic CAN data frame
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CanFrame {
    pub id: CanId,
    pub len: u8,
    pub data: [u8; 8],
    pub rtr: bool,
    pub timestamp: Option<Timestamp>,
}

impl CanFrame {
    pub fn new(id: CanId, data: &[u8]) -> Option<Self> {
        if data.len() > 8 {
            return None;
        }
        let mut buf = [0u8; 8];
        buf[..data.len()].copy_from_slice(data);
        Some(Self {
            id,
            len: data.len() as u8,
            data: buf,
            rtr: false,
            timestamp: None,
        })
    }

    /// Valid payload bytes of the frame.
    pub fn payload(&self) -> &[u8] {
        let len = usize::from(self.len).min(8);
        &self.data[..len]
    }

    pub fn stamped(mut self) -> Self {
        self.timestamp = Some(Timestamp(OffsetDateTime::now_utc()));
        self
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CanFilter {
    pub id: CanId,
    pub mask: u32,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Timestamp(pub OffsetDateTime);

#[derive(Clone, Debug)]
pub struct BusInfo {
    pub name: String,
    pub driver: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_isotp_id_layout() {
        let id = CanId::isotp(0x14, 0xF1);
        assert_eq!(id.raw(), 0x1ADA_14F1);
        assert!(id.is_extended());
        assert_eq!(id.isotp_addresses(), Some((0x14, 0xF1)));
    }

    #[test]
    fn test_publication_fields() {
        let id = CanId::extended(0x0007_010A).unwrap();
        assert_eq!(id.source_address(), 0x0A);
        assert_eq!(id.data_node_id(), 0x0701);
        assert_eq!(id.isotp_addresses(), None);
    }

    #[test]
    fn test_frame_payload_respects_len() {
        let id = CanId::standard(0x123).unwrap();
        let frame = CanFrame::new(id, &[1, 2, 3]).unwrap();
        assert_eq!(frame.payload(), &[1, 2, 3]);
        assert!(CanFrame::new(id, &[0; 9]).is_none());
    }
}
