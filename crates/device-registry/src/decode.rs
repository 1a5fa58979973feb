//! Decoding of single-frame CAN publications into telemetry.
//!
//! A publication frame carries one data node: the source address sits in the
//! low byte of the id, the data node id in the 16 bits above it, and the
//! payload starts with a type tag.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use can_transport::CanFrame;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

const TAG_TRUE: u8 = 61;
const TAG_FALSE: u8 = 60;
const TAG_POS_INT32: u8 = 6;
const TAG_NEG_INT32: u8 = 7;
const TAG_FLOAT32: u8 = 30;
const TAG_DECFRAC: u8 = 36;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TelemetryValue {
    F64(f64),
    I64(i64),
    Bool(bool),
}

impl From<TelemetryValue> for Value {
    fn from(v: TelemetryValue) -> Self {
        match v {
            TelemetryValue::F64(f) => serde_json::Number::from_f64(f).map_or(Value::Null, Value::Number),
            TelemetryValue::I64(i) => Value::from(i),
            TelemetryValue::Bool(b) => Value::Bool(b),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryRecord {
    pub address: u8,
    pub node: u16,
    pub name: String,
    pub value: TelemetryValue,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ts: Option<String>,
}

/// Decodes the payload of one publication frame.
///
/// Decimal fractions are only understood with exponent -3; anything else, and
/// short frames, give `None`.
pub fn decode_value(data: &[u8]) -> Option<TelemetryValue> {
    let be32 = |at: usize| -> Option<u32> {
        let bytes: [u8; 4] = data.get(at..at + 4)?.try_into().ok()?;
        Some(u32::from_be_bytes(bytes))
    };
    let value = match *data.first()? {
        TAG_TRUE => TelemetryValue::Bool(true),
        TAG_FALSE => TelemetryValue::Bool(false),
        TAG_POS_INT32 => TelemetryValue::I64(i64::from(be32(1)?)),
        TAG_NEG_INT32 => TelemetryValue::I64(-(i64::from(be32(1)?) + 1)),
        TAG_FLOAT32 => TelemetryValue::F64(round3(f64::from(f32::from_bits(be32(1)?)))),
        TAG_DECFRAC => {
            let mantissa = f64::from(be32(4)?);
            match (data.get(2)?, data.get(3)?) {
                (0x22, 0x1a) => TelemetryValue::F64(round3(mantissa / 1000.0)),
                (0x22, 0x3a) => TelemetryValue::F64(round3(-(mantissa + 1.0) / 1000.0)),
                _ => return None,
            }
        }
        _ => return None,
    };
    Some(value)
}

fn round3(v: f64) -> f64 {
    (v * 1000.0).round() / 1000.0
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
pub struct NodeName {
    pub id: u16,
    pub name: String,
}

/// Names of the data nodes published by the device at one address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
pub struct NodeTable {
    pub address: u8,
    pub nodes: Vec<NodeName>,
}

impl NodeTable {
    fn from_pairs(address: u8, pairs: &[(u16, &str)]) -> Self {
        Self {
            address,
            nodes: pairs
                .iter()
                .map(|&(id, name)| NodeName {
                    id,
                    name: name.to_string(),
                })
                .collect(),
        }
    }

    /// Battery management system at address 0.
    pub fn bms() -> Self {
        Self::from_pairs(
            0,
            &[
                (0x70, "Bat_V"),
                (0x71, "Bat_A"),
                (0x72, "Bat_degC"),
                (0x76, "IC_degC"),
                (0x77, "MOSFETs_degC"),
            ],
        )
    }

    /// Solar charge controller at address 10.
    pub fn mppt() -> Self {
        Self::from_pairs(
            10,
            &[
                (0x04, "LoadState"),
                (0x0F, "SolarMaxDay_W"),
                (0x10, "LoadMaxDay_W"),
                (0x70, "Bat_V"),
                (0x71, "Solar_V"),
                (0x72, "Bat_A"),
                (0x73, "Load_A"),
                (0x74, "Bat_degC"),
                (0x76, "Int_degC"),
                (0x77, "Mosfet_degC"),
                (0x78, "ChgState"),
                (0x79, "DCDCState"),
                (0x7a, "Solar_A"),
                (0x7d, "Bat_W"),
                (0x7e, "Solar_W"),
                (0x7f, "Load_W"),
                (0xa0, "SolarInDay_Wh"),
                (0xa1, "LoadOutDay_Wh"),
                (0xa2, "BatChgDay_Wh"),
                (0xa3, "BatDisDay_Wh"),
                (0x06, "SOC"),
                (0xA4, "Dis_Ah"),
            ],
        )
    }

    pub fn name_of(&self, id: u16) -> Option<&str> {
        self.nodes.iter().find(|n| n.id == id).map(|n| n.name.as_str())
    }
}

/// Latest published value of every data node, per source address.
#[derive(Debug, Default)]
pub struct TelemetryStore {
    tables: HashMap<u8, NodeTable>,
    values: BTreeMap<u8, BTreeMap<u16, TelemetryValue>>,
    updated: BTreeSet<u8>,
}

impl TelemetryStore {
    pub fn new(tables: impl IntoIterator<Item = NodeTable>) -> Self {
        Self {
            tables: tables.into_iter().map(|t| (t.address, t)).collect(),
            ..Default::default()
        }
    }

    /// Store with the BMS and MPPT tables.
    pub fn with_builtin_tables() -> Self {
        Self::new([NodeTable::bms(), NodeTable::mppt()])
    }

    fn key(&self, address: u8, node: u16) -> String {
        self.tables
            .get(&address)
            .and_then(|t| t.name_of(node))
            .map_or_else(|| format!("0x{node:x}"), str::to_string)
    }

    /// Takes one publication frame. ISO-TP and remote frames are ignored.
    pub fn record(&mut self, frame: &CanFrame) -> Option<TelemetryRecord> {
        if frame.rtr || frame.id.isotp_addresses().is_some() {
            return None;
        }
        let address = frame.id.source_address();
        let node = frame.id.data_node_id();
        let Some(value) = decode_value(frame.payload()) else {
            tracing::debug!(address, node, data = ?frame.payload(), "undecodable publication");
            return None;
        };
        self.values.entry(address).or_default().insert(node, value);
        self.updated.insert(address);
        let ts = frame
            .timestamp
            .and_then(|t| t.0.format(&time::format_description::well_known::Rfc3339).ok());
        Some(TelemetryRecord {
            address,
            node,
            name: self.key(address, node),
            value,
            ts,
        })
    }

    /// Addresses with new values since the last call.
    pub fn take_updated(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.updated).into_iter().collect()
    }

    /// All values of one address as a JSON object: named nodes in table
    /// order, then unnamed ones by id.
    pub fn json(&self, address: u8) -> Option<String> {
        let values = self.values.get(&address)?;
        let mut obj = Map::new();
        if let Some(table) = self.tables.get(&address) {
            for n in &table.nodes {
                if let Some(&v) = values.get(&n.id) {
                    obj.insert(n.name.clone(), v.into());
                }
            }
        }
        for (&id, &v) in values {
            let known = self.tables.get(&address).is_some_and(|t| t.name_of(id).is_some());
            if !known {
                obj.insert(format!("0x{id:x}"), v.into());
            }
        }
        Some(Value::Object(obj).to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use can_transport::CanId;

    fn publication(address: u8, node: u16, data: &[u8]) -> CanFrame {
        let id = CanId::extended(u32::from(node) << 8 | u32::from(address)).unwrap();
        CanFrame::new(id, data).unwrap()
    }

    #[test]
    fn test_decode_tags() {
        assert_eq!(decode_value(&[61]), Some(TelemetryValue::Bool(true)));
        assert_eq!(decode_value(&[60]), Some(TelemetryValue::Bool(false)));
        assert_eq!(decode_value(&[6, 0, 0, 1, 0]), Some(TelemetryValue::I64(256)));
        assert_eq!(decode_value(&[7, 0, 0, 0, 4]), Some(TelemetryValue::I64(-5)));
        let f = 12.8f32.to_bits().to_be_bytes();
        assert_eq!(
            decode_value(&[30, f[0], f[1], f[2], f[3]]),
            Some(TelemetryValue::F64(12.8))
        );
    }

    #[test]
    fn test_decode_decfrac() {
        assert_eq!(
            decode_value(&[36, 0x82, 0x22, 0x1a, 0, 0, 0x32, 0x00]),
            Some(TelemetryValue::F64(12.8))
        );
        assert_eq!(
            decode_value(&[36, 0x82, 0x22, 0x3a, 0, 0, 0x01, 0xF3]),
            Some(TelemetryValue::F64(-0.5))
        );
        assert_eq!(decode_value(&[36, 0x82, 0x21, 0x1a, 0, 0, 0, 1]), None);
    }

    #[test]
    fn test_short_or_unknown_payload() {
        assert_eq!(decode_value(&[]), None);
        assert_eq!(decode_value(&[6, 0, 1]), None);
        assert_eq!(decode_value(&[99, 0, 0, 0, 0]), None);
    }

    #[test]
    fn test_store_renders_named_json() {
        let mut store = TelemetryStore::with_builtin_tables();
        let rec = store.record(&publication(10, 0x70, &[6, 0, 0, 0, 13])).unwrap();
        assert_eq!(rec.name, "Bat_V");
        store.record(&publication(10, 0x04, &[61]));
        store.record(&publication(10, 0x1234, &[7, 0, 0, 0, 0]));
        assert_eq!(
            store.json(10).unwrap(),
            r#"{"LoadState":true,"Bat_V":13,"0x1234":-1}"#
        );
        assert_eq!(store.take_updated(), vec![10]);
        assert!(store.take_updated().is_empty());
        assert_eq!(store.json(3), None);
    }

    #[test]
    fn test_latest_value_wins() {
        let mut store = TelemetryStore::with_builtin_tables();
        store.record(&publication(0, 0x71, &[6, 0, 0, 0, 1]));
        store.record(&publication(0, 0x71, &[6, 0, 0, 0, 2]));
        assert_eq!(store.json(0).unwrap(), r#"{"Bat_A":2}"#);
    }

    #[test]
    fn test_isotp_frames_are_not_telemetry() {
        let mut store = TelemetryStore::default();
        let frame = CanFrame::new(CanId::isotp(0xF1, 0x14), &[0x02, 0x85, 0xF6]).unwrap();
        assert!(store.record(&frame).is_none());
    }
}
