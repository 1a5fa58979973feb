//! Simulated charge controller on the mock CAN bus.
//!
//! Answers ISO-TP requests from its own node store and publishes a few
//! measurements once per second, so the gateway can be exercised without
//! hardware.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use can_transport::isotp::{Reassembler, RxEvent, Segmenter};
use can_transport::{CanFrame, CanId, MockHandle};
use serde_json::{json, Map, Value};
use thingset::store::{Access, Store};
use thingset::{cbor, text, Method};

/// Node address of the simulated device.
pub const SIM_ADDRESS: u8 = 10;
pub const SIM_DEVICE_ID: &str = "SIMMPPT01";

fn group(v: Value) -> Map<String, Value> {
    match v {
        Value::Object(m) => m,
        _ => Map::new(),
    }
}

fn sim_store() -> Store {
    let mut store = Store::new();
    store.add_group(
        "info",
        Access::ReadOnly,
        group(json!({
            "DeviceType": "MPPT",
            "DeviceID": SIM_DEVICE_ID,
            "Manufacturer": "Libre Solar",
            "FirmwareVersion": "sim",
        })),
    );
    store.add_group(
        "meas",
        Access::ReadOnly,
        group(json!({ "Bat_V": 13.2, "Solar_V": 18.4, "Bat_A": 2.5, "SOC": 87 })),
    );
    store.add_group(
        "conf",
        Access::ReadWrite,
        group(json!({ "BatChgVoltage": 14.4, "LoadDisconnect_V": 11.8 })),
    );
    store
}

/// Runs one request against the store, in the wire format it arrived in.
fn answer(store: &mut Store, request: &[u8], binary: bool) -> Vec<u8> {
    if !binary {
        return store.process(&String::from_utf8_lossy(request)).into_bytes();
    }
    let Ok(req) = cbor::parse_request(request) else {
        return vec![0xA0];
    };
    let Some(method) = Method::from_code(req.method) else {
        return vec![0xA5];
    };
    let mut query = String::new();
    query.push(method.text_char(&req.node));
    query.push_str(&req.node);
    if let Some(payload) = &req.payload {
        query.push(' ');
        query.push_str(payload);
    }
    let line = store.process(&query);
    let (status, payload) = text::parse_response(&line);
    cbor::encode_response(status.unwrap_or(0xC0), payload).unwrap_or_else(|_| vec![0xC0])
}

/// Makes the device at [`SIM_ADDRESS`] answer requests sent on the bus.
pub fn install(handle: &MockHandle, binary: bool) {
    let mut store = sim_store();
    let mut rx = Reassembler::new(ts_link::can::RX_CAPACITY);
    handle.set_responder(move |frame| {
        let Some((SIM_ADDRESS, source)) = frame.id.isotp_addresses() else {
            return Vec::new();
        };
        let id = CanId::isotp(source, SIM_ADDRESS);
        match rx.on_frame(frame.payload()) {
            Ok(RxEvent::SendFlow(fc)) => CanFrame::new(id, &fc.encode()).into_iter().collect(),
            Ok(RxEvent::Complete(request)) => {
                let response = answer(&mut store, &request, binary);
                let Ok(mut seg) = Segmenter::new(&response) else {
                    return Vec::new();
                };
                let mut frames: Vec<CanFrame> = CanFrame::new(id, &seg.first()).into_iter().collect();
                while let Some(data) = seg.next_consecutive() {
                    frames.extend(CanFrame::new(id, &data));
                }
                frames
            }
            Ok(_) => Vec::new(),
            Err(e) => {
                tracing::debug!(error = %e, "sim: bad ISO-TP frame");
                Vec::new()
            }
        }
    });
}

fn publication(node: u16, data: &[u8]) -> Option<CanFrame> {
    let id = CanId::extended(u32::from(node) << 8 | u32::from(SIM_ADDRESS))?;
    CanFrame::new(id, data).map(CanFrame::stamped)
}

fn float32(v: f32) -> [u8; 5] {
    let b = v.to_bits().to_be_bytes();
    [30, b[0], b[1], b[2], b[3]]
}

/// Publishes measurements until `stop` is set.
pub fn spawn_publisher(handle: MockHandle, stop: Arc<AtomicBool>) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let mut tick: u32 = 0;
        while !stop.load(Ordering::Relaxed) {
            let bat_mv = 13_200 + tick % 50;
            let m = bat_mv.to_be_bytes();
            let frames = [
                publication(0x04, &[61]),
                publication(0x70, &[36, 0x82, 0x22, 0x1a, m[0], m[1], m[2], m[3]]),
                publication(0x71, &float32(18.4)),
                publication(0x06, &[6, 0, 0, 0, 87]),
            ];
            for frame in frames.into_iter().flatten() {
                handle.inject(frame);
            }
            tick = tick.wrapping_add(1);
            for _ in 0..10 {
                if stop.load(Ordering::Relaxed) {
                    break;
                }
                thread::sleep(Duration::from_millis(100));
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use thingset::parse_uri;

    #[test]
    fn test_text_answers() {
        let mut store = sim_store();
        let resp = answer(&mut store, b"?info/DeviceType", false);
        assert_eq!(resp, b":85 Content. \"MPPT\"");
    }

    #[test]
    fn test_binary_answers() {
        let mut store = sim_store();
        let query = cbor::build_query(Method::Get, &parse_uri(Some("x/info/DeviceID"))).unwrap();
        let resp = answer(&mut store, &query, true);
        assert_eq!(cbor::response_status(&resp), Some(0x85));
        assert_eq!(
            cbor::response_payload(resp).unwrap().as_deref(),
            Some("\"SIMMPPT01\"")
        );

        let query = cbor::build_query(
            Method::Patch,
            &parse_uri(Some("x/conf")).with_payload(Some("{\"BatChgVoltage\":14.2}")),
        )
        .unwrap();
        assert_eq!(answer(&mut store, &query, true), vec![0x84]);
        assert_eq!(store.get("conf/BatChgVoltage").unwrap(), 14.2);
    }
}
