use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use can_transport::isotp::{FlowControl, FlowStatus, Reassembler, RxEvent, Segmenter};
use can_transport::{CanBus, CanFrame, CanId, IsoTpError, TransportError};

use crate::channel::{Channel, Framing};
use crate::{Link, LinkError, Result};

/// Address the gateway uses on the bus.
pub const DEFAULT_CLIENT_ADDRESS: u8 = 0xF1;

/// Largest response accepted from a device.
pub const RX_CAPACITY: usize = 512;

const POLL: Duration = Duration::from_millis(5);
const IDLE: Duration = Duration::from_millis(1);

pub type PublicationHandler = Box<dyn FnMut(&CanFrame) + Send>;

#[derive(Default)]
struct FlowSlot {
    last: Mutex<Option<FlowControl>>,
    arrived: Condvar,
}

impl FlowSlot {
    fn lock(&self) -> MutexGuard<'_, Option<FlowControl>> {
        self.last.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn put(&self, fc: FlowControl) {
        *self.lock() = Some(fc);
        self.arrived.notify_all();
    }

    fn take(&self, timeout: Duration) -> Option<FlowControl> {
        let slot = self.lock();
        let (mut slot, _) = self
            .arrived
            .wait_timeout_while(slot, timeout, |s| s.is_none())
            .unwrap_or_else(PoisonError::into_inner);
        slot.take()
    }
}

/// ThingSet over ISO-TP on a shared CAN bus.
///
/// Requests to any device address go through one [`Channel`], so only one
/// exchange is on the bus at a time. The paired [`CanReceiver`] must be
/// running for responses and flow control to arrive.
pub struct CanLink<B> {
    bus: Arc<Mutex<B>>,
    client: u8,
    channel: Arc<Channel>,
    flow: Arc<FlowSlot>,
}

impl<B: CanBus + Send + 'static> CanLink<B> {
    /// `binary` selects the response framing of the devices on this bus.
    pub fn new(bus: B, client: u8, binary: bool) -> (Self, CanReceiver<B>) {
        let framing = if binary { Framing::Binary } else { Framing::Text };
        let bus = Arc::new(Mutex::new(bus));
        let channel = Arc::new(Channel::with_capacity(framing, RX_CAPACITY));
        let flow = Arc::new(FlowSlot::default());
        let receiver = CanReceiver {
            bus: bus.clone(),
            client,
            channel: channel.clone(),
            flow: flow.clone(),
            transfers: HashMap::new(),
            on_publication: None,
        };
        let link = Self {
            bus,
            client,
            channel,
            flow,
        };
        (link, receiver)
    }

    pub fn client_address(&self) -> u8 {
        self.client
    }

    pub fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }

    fn transmit(&self, id: CanId, data: &[u8]) -> Result<()> {
        let frame = CanFrame::new(id, data).ok_or(TransportError::InvalidFrame("ISO-TP frame data"))?;
        transmit(&self.bus, &frame)
    }

    fn send_segmented(&self, request: &[u8], address: u8, deadline: Instant) -> Result<()> {
        let mut seg = Segmenter::new(request)?;
        let id = CanId::isotp(address, self.client);
        self.flow.lock().take();
        self.transmit(id, &seg.first())?;

        while !seg.is_done() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let fc = self.flow.take(remaining).ok_or(IsoTpError::FlowTimeout)?;
            match fc.status {
                FlowStatus::Overflow => return Err(IsoTpError::Overflow.into()),
                FlowStatus::Wait => continue,
                FlowStatus::Continue => {}
            }
            let mut sent = 0u8;
            while let Some(data) = seg.next_consecutive() {
                if !fc.st_min.is_zero() {
                    std::thread::sleep(fc.st_min);
                }
                self.transmit(id, &data)?;
                sent = sent.wrapping_add(1);
                if fc.block_size != 0 && sent >= fc.block_size {
                    break;
                }
            }
        }
        Ok(())
    }
}

impl<B: CanBus + Send + 'static> Link for CanLink<B> {
    /// `timeout` bounds the whole exchange: waiting for the channel, for
    /// flow control and for the response.
    fn send(&self, request: &[u8], address: u8, timeout: Duration) -> Result<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        let remaining = || deadline.saturating_duration_since(Instant::now());
        let guard = self.channel.request_from(address, timeout)?;
        self.send_segmented(request, address, deadline)?;
        tracing::debug!(address, len = request.len(), "sent ISO-TP request");
        guard.into_response(remaining()).ok_or(LinkError::Timeout(timeout))
    }
}

fn transmit<B: CanBus>(bus: &Mutex<B>, frame: &CanFrame) -> Result<()> {
    bus.lock().unwrap_or_else(PoisonError::into_inner).send(frame)?;
    Ok(())
}

/// Receive loop of a [`CanLink`].
///
/// ISO-TP frames addressed to the gateway are reassembled per source address;
/// every other frame is a publication and goes to the handler.
pub struct CanReceiver<B> {
    bus: Arc<Mutex<B>>,
    client: u8,
    channel: Arc<Channel>,
    flow: Arc<FlowSlot>,
    transfers: HashMap<u8, Reassembler>,
    on_publication: Option<PublicationHandler>,
}

impl<B: CanBus + Send + 'static> CanReceiver<B> {
    pub fn on_publication(&mut self, handler: PublicationHandler) {
        self.on_publication = Some(handler);
    }

    /// Waits briefly for one frame and processes it. Returns whether a frame
    /// was received.
    pub fn poll(&mut self) -> Result<bool> {
        let received = {
            let mut bus = self.bus.lock().unwrap_or_else(PoisonError::into_inner);
            bus.recv(Some(POLL.as_millis() as u64))
        };
        match received {
            Ok(frame) => {
                self.handle(&frame)?;
                Ok(true)
            }
            Err(TransportError::Timeout) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    pub fn run(&mut self, stop: &AtomicBool) -> Result<()> {
        while !stop.load(Ordering::Relaxed) {
            if !self.poll()? {
                // let senders take the bus between polls
                std::thread::sleep(IDLE);
            }
        }
        Ok(())
    }

    fn handle(&mut self, frame: &CanFrame) -> Result<()> {
        let Some((target, source)) = frame.id.isotp_addresses() else {
            if let Some(handler) = self.on_publication.as_mut() {
                handler(frame);
            }
            return Ok(());
        };
        if target != self.client {
            tracing::trace!(target, source, "ISO-TP frame for another node");
            return Ok(());
        }
        let transfer = self
            .transfers
            .entry(source)
            .or_insert_with(|| Reassembler::new(RX_CAPACITY));
        match transfer.on_frame(frame.payload()) {
            Ok(RxEvent::Pending) => {}
            Ok(RxEvent::SendFlow(fc)) => {
                let reply = CanFrame::new(CanId::isotp(source, self.client), &fc.encode())
                    .ok_or(TransportError::InvalidFrame("flow control"))?;
                transmit(&self.bus, &reply)?;
                if fc.status == FlowStatus::Overflow {
                    tracing::warn!(source, "response exceeds {RX_CAPACITY} bytes");
                }
            }
            Ok(RxEvent::Complete(payload)) => {
                let claim = self.channel.deliver_from(source, payload);
                tracing::debug!(source, ?claim, "ISO-TP message complete");
            }
            Ok(RxEvent::Flow(fc)) if self.channel.peer() == Some(source) => self.flow.put(fc),
            Ok(RxEvent::Flow(_)) => tracing::trace!(source, "flow control from another node"),
            Err(e) => tracing::warn!(source, error = %e, "dropping ISO-TP transfer"),
        }
        Ok(())
    }
}
