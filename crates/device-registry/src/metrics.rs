use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};

#[derive(Clone)]
pub struct GatewayMetrics {
    pub requests: IntCounter,
    pub request_failures: IntCounter,
    pub timeouts: IntCounter,
    pub publications: IntCounter,
    pub can_rx_frames: IntCounter,
    pub devices_resolved: IntGauge,
}

#[derive(Clone)]
pub struct MetricsHub {
    pub registry: Registry,
    pub gw: GatewayMetrics,
}

impl MetricsHub {
    pub fn new() -> Result<Self, String> {
        let registry = Registry::new();
        let counter = |name: &str, help: &str| {
            IntCounter::new(name, help).map_err(|e| format!("metrics init error: {e}"))
        };
        let gw = GatewayMetrics {
            requests: counter("ts_requests", "Requests dispatched to devices")?,
            request_failures: counter("ts_request_failures", "Requests that got no response")?,
            timeouts: counter("ts_timeouts", "Requests that timed out on their link")?,
            publications: counter("ts_publications", "Publication messages received")?,
            can_rx_frames: counter("ts_can_rx_frames", "CAN publication frames received")?,
            devices_resolved: IntGauge::new("ts_devices_resolved", "Devices with a known identity")
                .map_err(|e| format!("metrics init error: {e}"))?,
        };
        let _ = registry.register(Box::new(gw.requests.clone()));
        let _ = registry.register(Box::new(gw.request_failures.clone()));
        let _ = registry.register(Box::new(gw.timeouts.clone()));
        let _ = registry.register(Box::new(gw.publications.clone()));
        let _ = registry.register(Box::new(gw.can_rx_frames.clone()));
        let _ = registry.register(Box::new(gw.devices_resolved.clone()));
        Ok(Self { registry, gw })
    }

    pub fn encode_text(&self) -> String {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buf) {
            return format!("error encoding metrics: {e}");
        }
        String::from_utf8(buf).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exposition_lists_counters() {
        let hub = MetricsHub::new().unwrap();
        hub.gw.requests.inc();
        hub.gw.devices_resolved.set(2);
        let text = hub.encode_text();
        assert!(text.contains("ts_requests 1"));
        assert!(text.contains("ts_devices_resolved 2"));
    }
}
