//! device-registry: the devices behind a ThingSet gateway
//!
//! Keeps one slot per known device, binds each to a wire format and link,
//! and dispatches requests addressed as `device_id/node/path`. Also decodes
//! CAN publications into telemetry and loads the gateway configuration.

mod error;
pub use error::{RegistryError, Result};

mod types;
pub use types::*;

mod drivers;
pub use drivers::{Driver, WireFormat};

mod registry;
pub use registry::{Device, Registry};

mod loader;
pub use loader::{
    load_config, CanBackend, CanConfig, GatewayConfig, RegistryConfig, SelfDeviceConfig, SerialConfig,
};

mod metrics;
pub use metrics::{GatewayMetrics, MetricsHub};

mod decode;
pub use decode::{decode_value, NodeName, NodeTable, TelemetryRecord, TelemetryStore, TelemetryValue};
