//! In-process node tree answering text requests.
//!
//! Backs the gateway's own device. Nodes are grouped; each group carries an
//! [`Access`] level, and leaves are plain JSON values.

use std::collections::HashMap;

use serde_json::{Map, Value};

use crate::method::Method;
use crate::status::StatusCode;
use crate::text;
use crate::uri::UriElements;

/// Type id mixed into the derived device id.
pub const DEVICE_TYPE_ID: u64 = 9;

const BASE32_ALPHABET: &[u8; 32] = b"0123456789abcdefghjkmnpqrstvwxyz";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Access {
    ReadOnly,
    ReadWrite,
    Exec,
}

pub type ExecFn = Box<dyn FnMut() + Send>;
pub type ChangeFn = Box<dyn FnMut(&str) + Send>;

/// Identity values published under `info`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GatewayInfo {
    pub device_id: String,
    pub manufacturer: String,
    pub firmware_version: String,
}

#[derive(Default)]
pub struct Store {
    root: Map<String, Value>,
    groups: Vec<(String, Access)>,
    functions: HashMap<String, ExecFn>,
    on_change: Option<ChangeFn>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("root", &self.root)
            .field("groups", &self.groups)
            .field("functions", &self.functions.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    /// Node tree of the gateway itself.
    pub fn gateway(info: &GatewayInfo) -> Self {
        let mut store = Self::new();
        store.add_group(
            "info",
            Access::ReadOnly,
            object([
                ("DeviceID", Value::from(info.device_id.as_str())),
                ("Manufacturer", Value::from(info.manufacturer.as_str())),
                ("FirmwareVersion", Value::from(info.firmware_version.as_str())),
            ]),
        );
        store.add_group(
            "conf/general",
            Access::ReadWrite,
            object([
                ("WifiSSID", Value::from("")),
                ("WifiPassword", Value::from("")),
                ("MdnsHostname", Value::from("ts-gateway")),
                ("TsUseCan", Value::from(false)),
                ("TsUseSerial", Value::from(true)),
            ]),
        );
        store.add_group(
            "conf/emoncms",
            Access::ReadWrite,
            object([
                ("Activate", Value::from(false)),
                ("Hostname", Value::from("")),
                ("Apikey", Value::from("")),
                ("Url", Value::from("")),
                ("SerialNode", Value::from("")),
                ("MPPT", Value::from("")),
                ("BMS", Value::from("")),
                ("Port", Value::from("80")),
            ]),
        );
        store.add_group(
            "conf/mqtt",
            Access::ReadWrite,
            object([
                ("Activate", Value::from(false)),
                ("BrokerHostname", Value::from("")),
                ("UseSSL", Value::from(false)),
                ("UseBrokerAuth", Value::from(false)),
                ("Username", Value::from("")),
                ("Password", Value::from("")),
                ("PubInterval", Value::from(60u32)),
            ]),
        );
        store.add_function(
            "rpc/x-reset",
            Box::new(|| tracing::warn!("reset requested, no handler installed")),
        );
        store
    }

    /// Adds (or replaces) a group of leaves at `path`.
    pub fn add_group(&mut self, path: &str, access: Access, leaves: Map<String, Value>) {
        if let Some(slot) = self.node_mut_or_insert(path) {
            *slot = Value::Object(leaves);
        }
        self.groups.retain(|(p, _)| p != path);
        self.groups.push((path.to_string(), access));
    }

    /// Registers a callable node; a later registration replaces the callback.
    pub fn add_function(&mut self, path: &str, f: ExecFn) {
        if let Some(slot) = self.node_mut_or_insert(path) {
            *slot = Value::Null;
        }
        if let Some((parent, _)) = path.rsplit_once('/') {
            if self.access(parent).is_none() {
                self.groups.push((parent.to_string(), Access::Exec));
            }
        }
        self.functions.insert(path.to_string(), f);
    }

    /// Hook called with the group path after every successful patch.
    pub fn on_change(&mut self, f: ChangeFn) {
        self.on_change = Some(f);
    }

    pub fn get(&self, path: &str) -> Option<&Value> {
        let mut parts = path.split('/').filter(|p| !p.is_empty());
        let first = parts.next()?;
        parts.try_fold(self.root.get(first)?, |node, key| node.get(key))
    }

    /// Overwrites a leaf regardless of access level.
    pub fn set(&mut self, path: &str, value: Value) -> bool {
        match self.node_mut(path) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }

    /// Current values of a `conf` group as JSON, for persisting.
    pub fn export(&mut self, group: &str) -> Option<String> {
        let node = format!("conf/{group}");
        let query = text::build_query(Method::Get, &UriElements::node(&node), false).ok()?;
        let response = self.process(&query);
        text::parse_response(&response).1.map(str::to_string)
    }

    /// Restores a `conf` group from JSON produced by [`Store::export`].
    pub fn import(&mut self, group: &str, json: &str) -> Option<u8> {
        let node = format!("conf/{group}");
        let uri = UriElements::node(&node).with_payload(Some(json));
        let query = text::build_query(Method::Patch, &uri, false).ok()?;
        let response = self.process(&query);
        text::response_status(&response)
    }

    /// Handles one text request and returns the text response.
    pub fn process(&mut self, request: &str) -> String {
        let request = request.trim_end_matches(['\n', '\r']);
        let mut chars = request.chars();
        let Some(lead) = chars.next() else {
            return respond(StatusCode::BadRequest, None);
        };
        let rest = chars.as_str();
        let (node, payload) = match rest.split_once(' ') {
            Some((node, payload)) => (node, Some(payload)),
            None => (rest, None),
        };
        tracing::debug!(%lead, node, "processing local request");
        match lead {
            '?' => self.read(node),
            '=' => self.patch(node, payload),
            '!' => self.exec(node),
            '+' | '-' => respond(StatusCode::MethodNotAllowed, None),
            _ => respond(StatusCode::BadRequest, None),
        }
    }

    fn read(&self, node: &str) -> String {
        if node.is_empty() {
            return content(&Value::Object(self.root.clone()));
        }
        if let Some(parent) = node.strip_suffix('/') {
            let children = if parent.is_empty() {
                Some(&self.root)
            } else {
                self.get(parent).and_then(Value::as_object)
            };
            return match children {
                Some(map) => content(&Value::from(map.keys().cloned().collect::<Vec<_>>())),
                None if self.get(parent).is_some() => respond(StatusCode::BadRequest, None),
                None => respond(StatusCode::NotFound, None),
            };
        }
        match self.get(node) {
            Some(value) => content(value),
            None => respond(StatusCode::NotFound, None),
        }
    }

    fn patch(&mut self, node: &str, payload: Option<&str>) -> String {
        let node = node.trim_end_matches('/');
        let Some(Value::Object(current)) = self.get(node) else {
            let status = if self.get(node).is_some() {
                StatusCode::MethodNotAllowed
            } else {
                StatusCode::NotFound
            };
            return respond(status, None);
        };
        match self.access(node) {
            Some(Access::ReadWrite) => {}
            Some(Access::ReadOnly) => return respond(StatusCode::Forbidden, None),
            _ => return respond(StatusCode::MethodNotAllowed, None),
        }
        let Some(Ok(Value::Object(update))) = payload.map(serde_json::from_str::<Value>) else {
            return respond(StatusCode::UnsupportedFormat, None);
        };

        for (key, value) in &update {
            match current.get(key) {
                None => return respond(StatusCode::NotFound, None),
                Some(old) if !same_kind(old, value) => {
                    return respond(StatusCode::UnsupportedFormat, None)
                }
                Some(_) => {}
            }
        }
        if let Some(Value::Object(target)) = self.node_mut(node) {
            target.extend(update);
        }
        tracing::info!(group = node, "configuration changed");
        if let Some(hook) = self.on_change.as_mut() {
            hook(node);
        }
        respond(StatusCode::Changed, None)
    }

    fn exec(&mut self, node: &str) -> String {
        if let Some(f) = self.functions.get_mut(node) {
            f();
            return respond(StatusCode::Valid, None);
        }
        if self.get(node).is_some() {
            respond(StatusCode::MethodNotAllowed, None)
        } else {
            respond(StatusCode::NotFound, None)
        }
    }

    // Access of the deepest registered group containing `path`.
    fn access(&self, path: &str) -> Option<Access> {
        self.groups
            .iter()
            .filter(|(g, _)| {
                path == g || path.strip_prefix(g.as_str()).is_some_and(|r| r.starts_with('/'))
            })
            .max_by_key(|(g, _)| g.len())
            .map(|(_, a)| *a)
    }

    fn node_mut(&mut self, path: &str) -> Option<&mut Value> {
        let mut parts = path.split('/').filter(|p| !p.is_empty());
        let first = parts.next()?;
        parts.try_fold(self.root.get_mut(first)?, |node, key| node.get_mut(key))
    }

    fn node_mut_or_insert(&mut self, path: &str) -> Option<&mut Value> {
        let mut parts = path.split('/').filter(|p| !p.is_empty());
        let first = parts.next()?;
        let mut node = self
            .root
            .entry(first.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        for key in parts {
            if !node.is_object() {
                *node = Value::Object(Map::new());
            }
            node = node
                .as_object_mut()?
                .entry(key.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
        }
        Some(node)
    }
}

fn object<const N: usize>(leaves: [(&str, Value); N]) -> Map<String, Value> {
    leaves.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
}

fn same_kind(old: &Value, new: &Value) -> bool {
    match (old, new) {
        (Value::Bool(_), Value::Bool(_)) | (Value::String(_), Value::String(_)) => true,
        (Value::Number(o), Value::Number(n)) => !o.is_u64() || n.is_u64(),
        _ => false,
    }
}

fn respond(status: StatusCode, payload: Option<&str>) -> String {
    match payload {
        Some(p) => format!(":{:02X} {}. {p}", status.code(), status.description()),
        None => format!(":{:02X} {}.", status.code(), status.description()),
    }
}

fn content(value: &Value) -> String {
    respond(StatusCode::Content, Some(&value.to_string()))
}

/// Base32 rendering used for device ids (no `i`, `l`, `o`, `u`).
pub fn base32(mut value: u64) -> String {
    let mut out = Vec::with_capacity(13);
    while value != 0 {
        out.push(BASE32_ALPHABET[(value % 32) as usize]);
        value >>= 5;
    }
    out.reverse();
    String::from_utf8_lossy(&out).into_owned()
}

/// Device id from a 48-bit hardware address: type id above the low 32 bits.
pub fn derive_device_id(hardware_id: u64) -> String {
    base32((DEVICE_TYPE_ID << 32) | (hardware_id & 0xFFFF_FFFF))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    fn store() -> Store {
        Store::gateway(&GatewayInfo {
            device_id: "abc123".into(),
            manufacturer: "Libre Solar".into(),
            firmware_version: "v1.0".into(),
        })
    }

    #[test]
    fn test_get_leaf_and_group() {
        let mut s = store();
        assert_eq!(s.process("?info/DeviceID\n"), ":85 Content. \"abc123\"");
        let response = s.process("?info");
        let (status, payload) = text::parse_response(&response);
        assert_eq!(status, Some(0x85));
        let v: Value = serde_json::from_str(payload.unwrap()).unwrap();
        assert_eq!(v["Manufacturer"], "Libre Solar");
    }

    #[test]
    fn test_listings() {
        let mut s = store();
        assert_eq!(s.process("?/"), ":85 Content. [\"info\",\"conf\",\"rpc\"]");
        assert_eq!(
            s.process("?conf/"),
            ":85 Content. [\"general\",\"emoncms\",\"mqtt\"]"
        );
        assert_eq!(s.process("?nope/"), ":A4 Not Found.");
        assert_eq!(s.process("?info/DeviceID/"), ":A0 Bad Request.");
    }

    #[test]
    fn test_patch_writable_group() {
        let mut s = store();
        let changed = Arc::new(Mutex::new(Vec::new()));
        let seen = changed.clone();
        s.on_change(Box::new(move |g| seen.lock().unwrap().push(g.to_string())));

        assert_eq!(
            s.process("=conf/mqtt {\"Activate\":true,\"PubInterval\":30}\n"),
            ":84 Changed."
        );
        assert_eq!(s.get("conf/mqtt/PubInterval"), Some(&Value::from(30)));
        assert_eq!(*changed.lock().unwrap(), vec!["conf/mqtt".to_string()]);
    }

    #[test]
    fn test_patch_rejections() {
        let mut s = store();
        assert_eq!(s.process("=info {\"DeviceID\":\"x\"}"), ":A3 Forbidden.");
        assert_eq!(s.process("=conf/mqtt {\"Nope\":1}"), ":A4 Not Found.");
        assert_eq!(
            s.process("=conf/mqtt {\"Activate\":\"yes\"}"),
            ":AF Unsupported Content-Format."
        );
        assert_eq!(
            s.process("=conf/mqtt {\"PubInterval\":-1}"),
            ":AF Unsupported Content-Format."
        );
        assert_eq!(s.process("=conf/mqtt {broken"), ":AF Unsupported Content-Format.");
        assert_eq!(s.process("=missing {}"), ":A4 Not Found.");
        // a rejected patch leaves every value untouched
        s.process("=conf/mqtt {\"Activate\":true,\"Nope\":1}");
        assert_eq!(s.get("conf/mqtt/Activate"), Some(&Value::from(false)));
    }

    #[test]
    fn test_exec_and_unsupported_methods() {
        let mut s = store();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        s.add_function(
            "rpc/x-reset",
            Box::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            }),
        );
        assert_eq!(s.process("!rpc/x-reset"), ":83 Valid.");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(s.process("!info"), ":A5 Method Not Allowed.");
        assert_eq!(s.process("!rpc/x-missing"), ":A4 Not Found.");
        assert_eq!(s.process("+conf/mqtt 1"), ":A5 Method Not Allowed.");
        assert_eq!(s.process("-conf/mqtt"), ":A5 Method Not Allowed.");
        assert_eq!(s.process("=rpc {\"x-reset\":null}"), ":A5 Method Not Allowed.");
        assert_eq!(s.process(""), ":A0 Bad Request.");
    }

    #[test]
    fn test_export_import() {
        let mut s = store();
        s.set("conf/general/WifiSSID", Value::from("home"));
        let saved = s.export("general").unwrap();
        assert!(saved.contains("\"WifiSSID\":\"home\""));

        let mut fresh = store();
        assert_eq!(fresh.import("general", &saved), Some(0x84));
        assert_eq!(fresh.get("conf/general/WifiSSID"), Some(&Value::from("home")));
        assert_eq!(fresh.import("nothing", "{}"), Some(0xA4));
    }

    #[test]
    fn test_device_id_derivation() {
        assert_eq!(base32(0), "");
        assert_eq!(base32(31), "z");
        assert_eq!(base32(32), "10");
        let id = derive_device_id(0xAABB_CCDD_EEFF);
        assert_eq!(id, base32((9 << 32) | 0xCCDD_EEFF));
        assert_eq!(id.len(), 8);
        assert!(!id.contains(['i', 'l', 'o', 'u']));
    }
}
