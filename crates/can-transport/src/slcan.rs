use crate::{BusInfo, CanBus, CanFrame, CanId, Result, TransportError};
use serialport::{SerialPort, SerialPortType};
use std::io::{ErrorKind, Read, Write};
use std::time::Duration;

/// SLCAN text protocol over serial (USB-CAN dongles used next to the gateway)
pub struct SlcanBus {
    port: Box<dyn SerialPort>,
    pending: Vec<u8>,
}

impl SlcanBus {
    pub fn open_with(path: &str, bitrate: Option<SlcanBitrate>) -> Result<Self> {
        let mut port = serialport::new(path, 115200)
            .timeout(Duration::from_millis(200))
            .open()
            .map_err(|e| TransportError::Io(e.to_string()))?;
        // Close, set bitrate, open
        let _ = port.write_all(b"C\r");
        let code = bitrate.unwrap_or(SlcanBitrate::B500k).code();
        port.write_all(&[b'S', code, b'\r'])
            .map_err(|e| TransportError::Io(e.to_string()))?;
        port.write_all(b"O\r")
            .map_err(|e| TransportError::Io(e.to_string()))?;
        tracing::info!(path, "SLCAN channel opened");
        Ok(SlcanBus {
            port,
            pending: Vec::with_capacity(64),
        })
    }

    fn encode_frame(frame: &CanFrame) -> Result<Vec<u8>> {
        if frame.rtr {
            return Err(TransportError::Unsupported("RTR not implemented"));
        }
        if frame.len > 8 {
            return Err(TransportError::InvalidFrame("dlc > 8"));
        }
        let mut line = if frame.id.is_extended() {
            format!("T{:08X}{}", frame.id.raw(), frame.len)
        } else {
            format!("t{:03X}{}", frame.id.raw(), frame.len)
        };
        for byte in frame.payload() {
            line.push_str(&format!("{byte:02X}"));
        }
        line.push('\r');
        Ok(line.into_bytes())
    }

    fn parse_frame(line: &[u8]) -> Result<CanFrame> {
        let (kind, rest) = line
            .split_first()
            .ok_or(TransportError::InvalidFrame("empty"))?;
        let id_len = match kind {
            b't' | b'r' => 3,
            b'T' | b'R' => 8,
            _ => return Err(TransportError::InvalidFrame("unknown header")),
        };
        if rest.len() < id_len + 1 {
            return Err(TransportError::InvalidFrame("short header"));
        }
        let raw_id = hex_u32(&rest[..id_len])?;
        let id = if id_len == 3 {
            CanId::standard(raw_id as u16)
        } else {
            CanId::extended(raw_id)
        }
        .ok_or(TransportError::InvalidFrame("id range"))?;

        let dlc = rest[id_len].wrapping_sub(b'0');
        if dlc > 8 {
            return Err(TransportError::InvalidFrame("dlc > 8"));
        }
        let hex = &rest[id_len + 1..];
        let mut data = [0u8; 8];
        for (i, byte) in data.iter_mut().enumerate().take(usize::from(dlc)) {
            let pair = hex
                .get(i * 2..i * 2 + 2)
                .ok_or(TransportError::InvalidFrame("short data"))?;
            *byte = hex_u32(pair)? as u8;
        }
        let frame = CanFrame {
            id,
            len: dlc,
            data,
            rtr: matches!(kind, b'r' | b'R'),
            timestamp: None,
        };
        Ok(frame.stamped())
    }
}

fn hex_u32(digits: &[u8]) -> Result<u32> {
    let text = std::str::from_utf8(digits).map_err(|_| TransportError::InvalidFrame("utf8"))?;
    u32::from_str_radix(text, 16).map_err(|_| TransportError::InvalidFrame("hex"))
}

impl CanBus for SlcanBus {
    fn open(path: &str) -> Result<Self>
    where
        Self: Sized,
    {
        Self::open_with(path, Some(SlcanBitrate::B500k))
    }

    fn list() -> Result<Vec<BusInfo>> {
        let ports =
            serialport::available_ports().map_err(|e| TransportError::Io(e.to_string()))?;
        Ok(ports
            .into_iter()
            .map(|p| BusInfo {
                driver: match p.port_type {
                    SerialPortType::UsbPort(_) => "slcan-serial".to_string(),
                    _ => "serial".to_string(),
                },
                name: p.port_name,
            })
            .collect())
    }

    fn recv(&mut self, timeout_ms: Option<u64>) -> Result<CanFrame> {
        if let Some(ms) = timeout_ms {
            self.port.set_timeout(Duration::from_millis(ms)).ok();
        }
        let mut buf = [0u8; 128];
        loop {
            if let Some(pos) = self.pending.iter().position(|&b| b == b'\r') {
                let line: Vec<u8> = self.pending.drain(..=pos).collect();
                let trimmed = &line[..line.len() - 1];
                // Bare CRs acknowledge commands
                if trimmed.is_empty() {
                    continue;
                }
                return Self::parse_frame(trimmed);
            }
            match self.port.read(&mut buf) {
                Ok(0) => continue,
                Ok(n) => self.pending.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == ErrorKind::TimedOut => return Err(TransportError::Timeout),
                Err(e) => return Err(TransportError::Io(e.to_string())),
            }
        }
    }

    fn send(&mut self, frame: &CanFrame) -> Result<()> {
        let line = Self::encode_frame(frame)?;
        self.port
            .write_all(&line)
            .map_err(|e| TransportError::Io(e.to_string()))
    }
}

/// Supported SLCAN bitrates (mapped to Sx codes)
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SlcanBitrate {
    B10k,  // S0
    B20k,  // S1
    B50k,  // S2
    B100k, // S3
    B125k, // S4
    B250k, // S5
    B500k, // S6
    B800k, // S7
    B1M,   // S8
}

impl SlcanBitrate {
    pub fn code(self) -> u8 {
        match self {
            SlcanBitrate::B10k => b'0',
            SlcanBitrate::B20k => b'1',
            SlcanBitrate::B50k => b'2',
            SlcanBitrate::B100k => b'3',
            SlcanBitrate::B125k => b'4',
            SlcanBitrate::B250k => b'5',
            SlcanBitrate::B500k => b'6',
            SlcanBitrate::B800k => b'7',
            SlcanBitrate::B1M => b'8',
        }
    }

    /// Maps a bitrate in bit/s to the closest supported code.
    pub fn from_bps(bps: u32) -> Option<Self> {
        Some(match bps {
            10_000 => SlcanBitrate::B10k,
            20_000 => SlcanBitrate::B20k,
            50_000 => SlcanBitrate::B50k,
            100_000 => SlcanBitrate::B100k,
            125_000 => SlcanBitrate::B125k,
            250_000 => SlcanBitrate::B250k,
            500_000 => SlcanBitrate::B500k,
            800_000 => SlcanBitrate::B800k,
            1_000_000 => SlcanBitrate::B1M,
            _ => return None,
        })
    }
}
