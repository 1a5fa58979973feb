//! Device slots and request dispatch.
//!
//! Slot 0 always holds the gateway itself. CAN devices first show up as a
//! bare address (seen on a publication) and are identified with an `info`
//! request the next time the device list is built; serial devices are
//! identified right when the link comes up. A device that fails to identify
//! is dropped.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::{Map, Value};
use thingset::{parse_uri, Method, StatusCode, UriElements};
use ts_link::{Link, LinkError};

use crate::drivers::Driver;
use crate::metrics::MetricsHub;
use crate::types::{DeviceInfo, Response, SlotState, TransportKind, SELF_ADDRESS, SELF_NAME};
use crate::{RegistryError, Result};

/// A resolved device and the way to reach it.
#[derive(Debug)]
pub struct Device {
    pub info: DeviceInfo,
    pub driver: Driver,
}

enum Slot {
    AddressKnown { address: u8 },
    Resolved(Arc<Device>),
}

struct CanBinding {
    link: Arc<dyn Link>,
    binary: bool,
    timeout: Duration,
}

pub struct Registry {
    capacity: usize,
    slots: Mutex<Vec<Option<Slot>>>,
    can: Mutex<Option<Arc<CanBinding>>>,
    metrics: Option<MetricsHub>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Registry {
    /// Creates a registry whose slot 0 is the gateway's own device, answered
    /// by `self_link`.
    pub fn new(capacity: usize, self_link: Arc<dyn Link>, self_id: impl Into<String>) -> Self {
        let capacity = capacity.max(1);
        let me = Device {
            info: DeviceInfo {
                device_id: self_id.into(),
                name: SELF_NAME.to_string(),
                address: SELF_ADDRESS,
                transport: TransportKind::Local,
            },
            driver: Driver::local(self_link),
        };
        let mut slots: Vec<Option<Slot>> = (0..capacity).map(|_| None).collect();
        slots[0] = Some(Slot::Resolved(Arc::new(me)));
        Self {
            capacity,
            slots: Mutex::new(slots),
            can: Mutex::new(None),
            metrics: None,
        }
    }

    /// Lists the gateway under `name` instead of "self".
    pub fn with_self_name(self, name: impl Into<String>) -> Self {
        {
            let mut slots = lock(&self.slots);
            if let Some(Slot::Resolved(me)) = slots[0].take() {
                let mut info = me.info.clone();
                info.name = name.into();
                let driver = me.driver.clone();
                slots[0] = Some(Slot::Resolved(Arc::new(Device { info, driver })));
            }
        }
        self
    }

    pub fn with_metrics(mut self, metrics: MetricsHub) -> Self {
        metrics.gw.devices_resolved.set(1);
        self.metrics = Some(metrics);
        self
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Link used to identify and talk to devices seen on the CAN bus.
    pub fn attach_can(&self, link: Arc<dyn Link>, binary: bool, timeout: Duration) {
        *lock(&self.can) = Some(Arc::new(CanBinding {
            link,
            binary,
            timeout,
        }));
    }

    /// Puts `slot` in the first free entry of the locked `slots`.
    fn place(&self, slots: &mut [Option<Slot>], slot: Slot) -> Result<usize> {
        let Some(idx) = slots.iter().position(Option::is_none) else {
            tracing::warn!(capacity = self.capacity, "device registry full");
            return Err(RegistryError::Full(self.capacity));
        };
        slots[idx] = Some(slot);
        Ok(idx)
    }

    /// Adds an already identified device.
    pub fn insert(&self, device: Device) -> Result<usize> {
        tracing::info!(
            device_id = %device.info.device_id,
            name = %device.info.name,
            address = device.info.address,
            "device registered"
        );
        let idx = self.place(&mut lock(&self.slots), Slot::Resolved(Arc::new(device)))?;
        self.update_gauge();
        Ok(idx)
    }

    /// Records a CAN node address seen on the bus. Returns whether a new slot
    /// was taken.
    ///
    /// Address 0 is the gateway's own slot and 0xFF is not a node address;
    /// both are ignored, as are addresses already known.
    pub fn note_can_address(&self, address: u8) -> Result<bool> {
        if address == SELF_ADDRESS || address == u8::MAX {
            return Ok(false);
        }
        let mut slots = lock(&self.slots);
        let known = slots.iter().flatten().any(|slot| match slot {
            Slot::AddressKnown { address: a } => *a == address,
            Slot::Resolved(d) => d.info.transport == TransportKind::Can && d.info.address == address,
        });
        if known {
            return Ok(false);
        }
        self.place(&mut slots, Slot::AddressKnown { address })?;
        drop(slots);
        tracing::info!(address, "new CAN node");
        Ok(true)
    }

    /// Identifies the device on a serial link and registers it.
    ///
    /// The first request after the UART opens often gets lost, hence
    /// `attempts`, each waiting up to `resolve_timeout`. Later requests use
    /// `request_timeout`.
    pub fn resolve_serial(
        &self,
        link: Arc<dyn Link>,
        request_timeout: Duration,
        resolve_timeout: Duration,
        attempts: u32,
    ) -> Result<DeviceInfo> {
        let identifier = Driver::serial(link.clone(), resolve_timeout);
        let (name, device_id) = identify(&identifier, attempts.max(1))?;
        let driver = Driver::serial(link, request_timeout);
        let info = DeviceInfo {
            device_id,
            name,
            address: driver.address,
            transport: TransportKind::Serial,
        };
        self.insert(Device {
            info: info.clone(),
            driver,
        })?;
        Ok(info)
    }

    /// Resolved device by id.
    pub fn get(&self, device_id: &str) -> Option<Arc<Device>> {
        lock(&self.slots).iter().flatten().find_map(|slot| match slot {
            Slot::Resolved(d) if d.info.device_id == device_id => Some(d.clone()),
            _ => None,
        })
    }

    /// Drops a device; the gateway's own slot cannot be removed.
    pub fn remove(&self, device_id: &str) -> bool {
        let removed = {
            let mut slots = lock(&self.slots);
            let found = slots.iter().enumerate().skip(1).find_map(|(i, slot)| match slot {
                Some(Slot::Resolved(d)) if d.info.device_id == device_id => Some(i),
                _ => None,
            });
            if let Some(i) = found {
                slots[i] = None;
            }
            found.is_some()
        };
        if removed {
            tracing::info!(device_id, "device removed");
            self.update_gauge();
        }
        removed
    }

    /// Runs one request given as URI (`device_id/node/path[/]`), optional
    /// JSON content and HTTP method name.
    ///
    /// No registry lock is held while the device is being talked to.
    pub fn execute(&self, uri: Option<&str>, content: Option<&str>, http_method: &str) -> Result<Response> {
        let method = Method::from_http(http_method);
        let elements: UriElements<'_> = parse_uri(uri).with_payload(content);
        let device_id = elements.device_id.as_deref().ok_or(RegistryError::NoDevice)?;
        let device = self
            .get(device_id)
            .ok_or_else(|| RegistryError::DeviceNotFound(device_id.to_string()))?;

        if let Some(m) = &self.metrics {
            m.gw.requests.inc();
        }
        let result = device.driver.request(method, &elements);
        match &result {
            Ok(resp) => tracing::debug!(device_id, status = ?resp.status, "request done"),
            Err(e) => {
                tracing::warn!(device_id, error = %e, "request failed");
                if let Some(m) = &self.metrics {
                    m.gw.request_failures.inc();
                    if matches!(e, RegistryError::Link(LinkError::Timeout(_))) {
                        m.gw.timeouts.inc();
                    }
                }
            }
        }
        result
    }

    /// JSON object mapping device name to device id for every identified
    /// device, pretty printed.
    ///
    /// CAN nodes known only by address are identified first; those that do
    /// not answer are dropped from the registry.
    pub fn device_list(&self) -> String {
        self.resolve_pending();
        let mut list = Map::new();
        for slot in lock(&self.slots).iter().flatten() {
            if let Slot::Resolved(d) = slot {
                list.insert(d.info.name.clone(), Value::String(d.info.device_id.clone()));
            }
        }
        if list.is_empty() {
            return "{}".to_string();
        }
        serde_json::to_string_pretty(&Value::Object(list)).unwrap_or_else(|_| "{}".to_string())
    }

    /// Current state of every occupied slot, in slot order.
    pub fn slots(&self) -> Vec<SlotState> {
        lock(&self.slots)
            .iter()
            .flatten()
            .map(|slot| match slot {
                Slot::AddressKnown { address } => SlotState::AddressKnown { address: *address },
                Slot::Resolved(d) => SlotState::Resolved(d.info.clone()),
            })
            .collect()
    }

    fn resolve_pending(&self) {
        let pending: Vec<(usize, u8)> = lock(&self.slots)
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| match slot {
                Some(Slot::AddressKnown { address }) => Some((i, *address)),
                _ => None,
            })
            .collect();
        if pending.is_empty() {
            return;
        }
        let Some(can) = lock(&self.can).clone() else {
            tracing::debug!(pending = pending.len(), "no CAN link to identify nodes with");
            return;
        };

        for (idx, address) in pending {
            let driver = Driver::can(can.link.clone(), address, can.binary, can.timeout);
            let outcome = identify(&driver, 1);
            let mut slots = lock(&self.slots);
            let still_pending = matches!(slots[idx], Some(Slot::AddressKnown { address: a }) if a == address);
            if !still_pending {
                continue;
            }
            match outcome {
                Ok((name, device_id)) => {
                    tracing::info!(address, %name, %device_id, "CAN node identified");
                    let info = DeviceInfo {
                        device_id,
                        name,
                        address,
                        transport: TransportKind::Can,
                    };
                    slots[idx] = Some(Slot::Resolved(Arc::new(Device { info, driver })));
                }
                Err(e) => {
                    tracing::warn!(address, error = %e, "dropping CAN node");
                    slots[idx] = None;
                }
            }
        }
        self.update_gauge();
    }

    fn update_gauge(&self) {
        if let Some(m) = &self.metrics {
            let n = lock(&self.slots)
                .iter()
                .filter(|s| matches!(s, Some(Slot::Resolved(_))))
                .count();
            m.gw.devices_resolved.set(n as i64);
        }
    }
}

/// Asks a device for its `info` object and returns `(DeviceType, DeviceID)`.
fn identify(driver: &Driver, attempts: u32) -> Result<(String, String)> {
    let uri = UriElements::node("info");
    let mut reason = String::new();
    for attempt in 1..=attempts {
        match driver.request(Method::Get, &uri) {
            Ok(resp) if resp.status_code() == Some(StatusCode::Content) => {
                match resp.data().and_then(|d| serde_json::from_str::<Value>(d).ok()) {
                    Some(info) => {
                        let field = |k: &str| info.get(k).and_then(Value::as_str).map(str::to_string);
                        if let (Some(name), Some(id)) = (field("DeviceType"), field("DeviceID")) {
                            return Ok((name, id));
                        }
                        reason = "info lacks DeviceType or DeviceID".into();
                    }
                    None => reason = "info is not a JSON object".into(),
                }
            }
            Ok(resp) => reason = format!("info answered with status {:?}", resp.status),
            Err(e) => reason = e.to_string(),
        }
        tracing::debug!(address = driver.address, attempt, %reason, "identify attempt failed");
    }
    Err(RegistryError::Resolve {
        address: driver.address,
        reason,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use thingset::{cbor, GatewayInfo, Store};
    use ts_link::LocalLink;

    const T: Duration = Duration::from_millis(5);

    fn registry(capacity: usize) -> Registry {
        let store = Store::gateway(&GatewayInfo {
            device_id: "gw1".into(),
            ..Default::default()
        });
        Registry::new(capacity, Arc::new(LocalLink::new(store)), "gw1")
    }

    /// Binary CAN bus with an MPPT at 20; every other address is silent.
    fn can_bus(seen: Arc<Mutex<Vec<u8>>>) -> Arc<dyn Link> {
        Arc::new(move |req: &[u8], addr: u8, t: Duration| -> ts_link::Result<Vec<u8>> {
            seen.lock().unwrap().push(addr);
            if addr != 20 {
                return Err(LinkError::Timeout(t));
            }
            let req = cbor::parse_request(req).unwrap();
            let answer = match req.node.as_str() {
                "info" => cbor::encode_response(0x85, Some(r#"{"DeviceType":"MPPT","DeviceID":"ABCD1234"}"#)),
                "meas" => cbor::encode_response(0x85, Some(r#"{"Bat_V":13.1}"#)),
                _ => cbor::encode_response(0xA4, None),
            };
            Ok(answer.unwrap())
        })
    }

    #[test]
    fn test_self_device_is_present() {
        let reg = registry(4);
        let resp = reg.execute(Some("gw1/info/DeviceID"), None, "GET").unwrap();
        assert_eq!(resp.status, Some(0x85));
        assert_eq!(resp.data(), Some("\"gw1\""));
        assert_eq!(reg.device_list(), "{\n  \"self\": \"gw1\"\n}");
        assert!(!reg.remove("gw1"));
    }

    #[test]
    fn test_self_name_from_config() {
        let reg = registry(2).with_self_name("Gateway");
        assert_eq!(reg.device_list(), "{\n  \"Gateway\": \"gw1\"\n}");
        assert!(reg.get("gw1").is_some());
    }

    #[test]
    fn test_unknown_or_missing_device() {
        let reg = registry(4);
        assert!(matches!(
            reg.execute(Some("nope/info"), None, "GET"),
            Err(RegistryError::DeviceNotFound(id)) if id == "nope"
        ));
        assert!(matches!(reg.execute(None, None, "GET"), Err(RegistryError::NoDevice)));
        assert!(matches!(reg.execute(Some(""), None, "GET"), Err(RegistryError::NoDevice)));
    }

    #[test]
    fn test_serial_resolve_retries() {
        let reg = registry(4);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let link = move |req: &[u8], _: u8, t: Duration| -> ts_link::Result<Vec<u8>> {
            assert_eq!(req, b"?info\n");
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(LinkError::Timeout(t));
            }
            Ok(br#":85 Content. {"DeviceType":"BMS","DeviceID":"XY12"}"#.to_vec())
        };
        let info = reg.resolve_serial(Arc::new(link), T, T, 2).unwrap();
        assert_eq!(info.name, "BMS");
        assert_eq!(info.device_id, "XY12");
        assert_eq!(info.address, crate::SERIAL_ADDRESS);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(reg.get("XY12").is_some());
    }

    #[test]
    fn test_serial_resolve_rejects_bad_status() {
        let reg = registry(4);
        let link = |_: &[u8], _: u8, _: Duration| -> ts_link::Result<Vec<u8>> { Ok(b":A4 Not Found.".to_vec()) };
        let err = reg.resolve_serial(Arc::new(link), T, T, 2).unwrap_err();
        assert!(matches!(err, RegistryError::Resolve { .. }));
        assert_eq!(reg.slots().len(), 1);
    }

    #[test]
    fn test_can_nodes_resolve_lazily() {
        let reg = registry(4);
        let seen = Arc::new(Mutex::new(Vec::new()));
        reg.attach_can(can_bus(seen.clone()), true, T);

        assert!(reg.note_can_address(20).unwrap());
        assert!(reg.note_can_address(30).unwrap());
        assert!(!reg.note_can_address(20).unwrap());
        assert!(!reg.note_can_address(0).unwrap());
        assert!(!reg.note_can_address(0xFF).unwrap());
        assert!(seen.lock().unwrap().is_empty());

        let list: Value = serde_json::from_str(&reg.device_list()).unwrap();
        assert_eq!(list, serde_json::json!({"self": "gw1", "MPPT": "ABCD1234"}));
        assert_eq!(*seen.lock().unwrap(), vec![20, 30]);
        assert_eq!(
            reg.slots()[1],
            SlotState::Resolved(DeviceInfo {
                device_id: "ABCD1234".into(),
                name: "MPPT".into(),
                address: 20,
                transport: TransportKind::Can,
            })
        );
        assert_eq!(reg.slots().len(), 2);

        // resolved nodes are not queried again, and keep their slot
        reg.device_list();
        assert_eq!(seen.lock().unwrap().len(), 2);
        assert!(!reg.note_can_address(20).unwrap());
    }

    #[test]
    fn test_execute_on_can_device() {
        let reg = registry(4);
        let seen = Arc::new(Mutex::new(Vec::new()));
        reg.attach_can(can_bus(seen), true, T);
        reg.note_can_address(20).unwrap();
        reg.device_list();

        let resp = reg.execute(Some("ABCD1234/meas"), None, "get").unwrap();
        assert_eq!(resp.http_status(), 200);
        assert_eq!(resp.data(), Some(r#"{"Bat_V":13.1}"#));

        let resp = reg.execute(Some("ABCD1234/nothing"), None, "GET").unwrap();
        assert_eq!(resp.http_status(), 404);
    }

    #[test]
    fn test_registry_full() {
        let reg = registry(2);
        assert!(reg.note_can_address(20).unwrap());
        assert!(matches!(reg.note_can_address(21), Err(RegistryError::Full(2))));
    }

    #[test]
    fn test_concurrent_sightings_take_one_slot() {
        let reg = Arc::new(registry(8));
        let barrier = Arc::new(std::sync::Barrier::new(8));
        let workers: Vec<_> = (0..8)
            .map(|_| {
                let reg = reg.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    reg.note_can_address(20).unwrap()
                })
            })
            .collect();
        let taken = workers.into_iter().map(|w| w.join().unwrap()).filter(|t| *t).count();
        assert_eq!(taken, 1);
        let known = reg
            .slots()
            .iter()
            .filter(|s| **s == SlotState::AddressKnown { address: 20 })
            .count();
        assert_eq!(known, 1);
    }

    #[test]
    fn test_pending_nodes_wait_for_can_link() {
        let reg = registry(3);
        reg.note_can_address(20).unwrap();
        reg.device_list();
        assert_eq!(reg.slots()[1], SlotState::AddressKnown { address: 20 });
    }

    #[test]
    fn test_metrics_track_requests_and_devices() {
        let hub = MetricsHub::new().unwrap();
        let reg = registry(4).with_metrics(hub.clone());
        let link = |_: &[u8], _: u8, t: Duration| -> ts_link::Result<Vec<u8>> { Err(LinkError::Timeout(t)) };
        reg.insert(Device {
            info: DeviceInfo {
                device_id: "dead".into(),
                name: "Dead".into(),
                address: crate::SERIAL_ADDRESS,
                transport: TransportKind::Serial,
            },
            driver: Driver::serial(Arc::new(link), T),
        })
        .unwrap();
        assert_eq!(hub.gw.devices_resolved.get(), 2);
        assert!(reg.execute(Some("dead/info"), None, "GET").is_err());
        assert_eq!(hub.gw.requests.get(), 1);
        assert_eq!(hub.gw.timeouts.get(), 1);
        assert!(reg.remove("dead"));
        assert_eq!(hub.gw.devices_resolved.get(), 1);
    }
}
