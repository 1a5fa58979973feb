//! Runtime wiring of links, registry and telemetry.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use can_transport::{CanBus, CanFrame, MockBus};
use device_registry::{CanBackend, GatewayConfig, MetricsHub, Registry, TelemetryStore};
use thingset::Store;
use ts_link::{CanLink, LocalLink, SerialLink};
use tracing::{info, warn};

use crate::sim;

pub struct Gateway {
    pub config: GatewayConfig,
    pub registry: Arc<Registry>,
    pub telemetry: Arc<Mutex<TelemetryStore>>,
    pub metrics: MetricsHub,
    pub serial: Option<Arc<SerialLink>>,
    serial_name: Option<String>,
    stop: Arc<AtomicBool>,
    workers: Vec<JoinHandle<()>>,
}

impl Gateway {
    /// Brings up every configured link. With `mock`, the serial port is left
    /// closed and a simulated device answers on a mock CAN bus.
    pub fn start(config: GatewayConfig, mock: bool) -> Result<Self> {
        let metrics = MetricsHub::new().map_err(|e| anyhow!(e))?;
        let mut store = Store::gateway(&config.self_device.gateway_info());
        store.on_change(Box::new(|group: &str| info!(group, "configuration changed")));
        let self_id = config.self_device.device_id();
        let registry = Registry::new(
            config.registry.capacity,
            Arc::new(LocalLink::new(store)),
            self_id.clone(),
        )
        .with_self_name(config.self_device.device_type.clone())
        .with_metrics(metrics.clone());
        info!(device_id = %self_id, "gateway device ready");

        let mut gw = Self {
            telemetry: Arc::new(Mutex::new(TelemetryStore::new(config.can.node_tables.clone()))),
            registry: Arc::new(registry),
            metrics,
            serial: None,
            serial_name: None,
            stop: Arc::new(AtomicBool::new(false)),
            workers: Vec::new(),
            config,
        };

        if mock {
            let bus = MockBus::open(&gw.config.can.interface)?;
            let handle = bus.handle();
            sim::install(&handle, gw.config.can.binary);
            gw.start_can(bus)?;
            gw.workers.push(sim::spawn_publisher(handle, gw.stop.clone()));
            return Ok(gw);
        }

        if gw.config.can.enabled {
            match gw.config.can.backend {
                CanBackend::Mock => {
                    let bus = MockBus::open(&gw.config.can.interface)?;
                    gw.start_can(bus)?;
                }
                CanBackend::Slcan => gw.start_slcan()?,
            }
        }
        if gw.config.serial.enabled {
            gw.start_serial()?;
        }
        Ok(gw)
    }

    #[cfg(feature = "slcan")]
    fn start_slcan(&mut self) -> Result<()> {
        let can = &self.config.can;
        let bitrate = can_transport::SlcanBitrate::from_bps(can.bitrate)
            .ok_or_else(|| anyhow!("unsupported SLCAN bitrate {}", can.bitrate))?;
        let bus = can_transport::SlcanBus::open_with(&can.interface, Some(bitrate))
            .with_context(|| format!("opening SLCAN adapter {}", can.interface))?;
        self.start_can(bus)
    }

    #[cfg(not(feature = "slcan"))]
    fn start_slcan(&mut self) -> Result<()> {
        anyhow::bail!("built without SLCAN support")
    }

    fn start_can<B: CanBus + Send + 'static>(&mut self, bus: B) -> Result<()> {
        let can = self.config.can.clone();
        let (link, mut receiver) = CanLink::new(bus, can.client_address, can.binary);

        let registry = self.registry.clone();
        let telemetry = self.telemetry.clone();
        let rx_frames = self.metrics.gw.can_rx_frames.clone();
        receiver.on_publication(Box::new(move |frame: &CanFrame| {
            rx_frames.inc();
            let record = telemetry
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .record(frame);
            if let Some(record) = record {
                tracing::trace!(address = record.address, name = %record.name, "telemetry");
                if let Err(e) = registry.note_can_address(record.address) {
                    warn!(address = record.address, error = %e, "cannot track CAN node");
                }
            }
        }));

        let stop = self.stop.clone();
        let worker = thread::Builder::new()
            .name("can-rx".into())
            .spawn(move || {
                if let Err(e) = receiver.run(&stop) {
                    tracing::error!(error = %e, "CAN receiver stopped");
                }
            })?;
        self.workers.push(worker);
        self.registry.attach_can(Arc::new(link), can.binary, can.timeout());
        info!(interface = %can.interface, binary = can.binary, "CAN link up");
        Ok(())
    }

    fn start_serial(&mut self) -> Result<()> {
        let cfg = self.config.serial.clone();
        let (link, mut receiver) = SerialLink::open(&cfg.port, cfg.baud_rate)
            .with_context(|| format!("opening serial port {}", cfg.port))?;
        let stop = self.stop.clone();
        let worker = thread::Builder::new()
            .name("serial-rx".into())
            .spawn(move || {
                if let Err(e) = receiver.run(&stop) {
                    tracing::error!(error = %e, "serial receiver stopped");
                }
            })?;
        self.workers.push(worker);

        let link = Arc::new(link);
        match self
            .registry
            .resolve_serial(link.clone(), cfg.timeout(), cfg.resolve_timeout(), cfg.resolve_attempts)
        {
            Ok(dev) => {
                info!(name = %dev.name, device_id = %dev.device_id, "serial device found");
                self.serial_name = Some(dev.name);
            }
            Err(e) => warn!(port = %cfg.port, error = %e, "no ThingSet device on serial port"),
        }
        self.serial = Some(link);
        Ok(())
    }

    /// Gives CAN nodes time to publish, then identifies them.
    pub fn discover(&self, settle: Duration) -> String {
        thread::sleep(settle);
        self.registry.device_list()
    }

    /// Stops the receive loops and waits for them.
    pub fn shutdown(self) {
        self.stop.store(true, Ordering::Relaxed);
        for worker in self.workers {
            if worker.join().is_err() {
                warn!("worker thread panicked");
            }
        }
    }

    /// One line of output for every serial publication and every CAN node
    /// with new values, until `limit` lines or `stop` is set.
    pub fn listen(&self, limit: Option<u32>, stop: &AtomicBool, mut emit: impl FnMut(String)) {
        let mut emitted = 0u32;
        let done = |n: u32| limit.is_some_and(|l| n >= l);
        while !stop.load(Ordering::Relaxed) && !done(emitted) {
            if let Some(serial) = &self.serial {
                if let Some(message) = serial.publication(Duration::from_millis(200)) {
                    self.metrics.gw.publications.inc();
                    if let Some(line) = message.as_str().map(|m| self.serial_line(m)) {
                        emit(line);
                        emitted += 1;
                    }
                }
            } else {
                thread::sleep(Duration::from_millis(200));
            }
            let updated = self
                .telemetry
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take_updated();
            for address in updated {
                if done(emitted) {
                    break;
                }
                let json = self
                    .telemetry
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .json(address);
                if let Some(json) = json {
                    self.metrics.gw.publications.inc();
                    emit(format!("{{\"source\":\"can\",\"address\":{address},\"data\":{json}}}"));
                    emitted += 1;
                }
            }
        }
    }

    fn serial_line(&self, message: &str) -> String {
        // "#<node> <json>" or "# <json>"
        let data = message.split_once(' ').map_or("", |(_, d)| d.trim());
        let data = serde_json::from_str::<serde_json::Value>(data)
            .unwrap_or_else(|_| serde_json::Value::String(data.to_string()));
        serde_json::json!({
            "source": "serial",
            "device": self.serial_name.as_deref().unwrap_or("serial"),
            "data": data,
        })
        .to_string()
    }
}
