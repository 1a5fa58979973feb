use crate::{BusInfo, CanBus, CanFilter, CanFrame, Result, TransportError};
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

type Responder = Box<dyn FnMut(&CanFrame) -> Vec<CanFrame> + Send>;

#[derive(Default)]
struct Shared {
    rx: VecDeque<CanFrame>,
    sent: Vec<CanFrame>,
    responder: Option<Responder>,
}

#[derive(Default)]
struct Wire {
    state: Mutex<Shared>,
    arrived: Condvar,
}

impl Wire {
    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// An in-process mock bus.
///
/// Frames injected through a [`MockHandle`] are returned by `recv`; frames
/// passed to `send` are recorded and, if a responder is installed, answered
/// with whatever frames the responder returns. This is enough to emulate a
/// remote ThingSet node in tests.
pub struct MockBus {
    name: String,
    wire: Arc<Wire>,
}

/// Test-side view of a [`MockBus`].
#[derive(Clone)]
pub struct MockHandle {
    wire: Arc<Wire>,
}

impl MockBus {
    pub fn handle(&self) -> MockHandle {
        MockHandle {
            wire: self.wire.clone(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl MockHandle {
    /// Queue a frame as if it had been received from the bus.
    pub fn inject(&self, frame: CanFrame) {
        self.wire.lock().rx.push_back(frame);
        self.wire.arrived.notify_all();
    }

    /// Frames sent through the bus so far.
    pub fn sent(&self) -> Vec<CanFrame> {
        self.wire.lock().sent.clone()
    }

    pub fn set_responder<F>(&self, responder: F)
    where
        F: FnMut(&CanFrame) -> Vec<CanFrame> + Send + 'static,
    {
        self.wire.lock().responder = Some(Box::new(responder));
    }
}

impl CanBus for MockBus {
    fn open(name: &str) -> Result<Self> {
        Ok(Self {
            name: name.to_string(),
            wire: Arc::new(Wire::default()),
        })
    }

    fn list() -> Result<Vec<BusInfo>> {
        Ok(vec![BusInfo {
            name: "mock0".to_string(),
            driver: "mock".to_string(),
        }])
    }

    fn set_filters(&mut self, _filters: &[CanFilter]) -> Result<()> {
        Err(TransportError::Unsupported(
            "mock backend has no hardware filters",
        ))
    }

    fn recv(&mut self, timeout_ms: Option<u64>) -> Result<CanFrame> {
        let wait = Duration::from_millis(timeout_ms.unwrap_or(100));
        let guard = self.wire.lock();
        let (mut guard, _) = self
            .wire
            .arrived
            .wait_timeout_while(guard, wait, |s| s.rx.is_empty())
            .unwrap_or_else(PoisonError::into_inner);
        match guard.rx.pop_front() {
            Some(frame) => Ok(frame.stamped()),
            None => Err(TransportError::Timeout),
        }
    }

    fn send(&mut self, frame: &CanFrame) -> Result<()> {
        let mut responder = {
            let mut shared = self.wire.lock();
            shared.sent.push(frame.clone());
            shared.responder.take()
        };
        if let Some(respond) = responder.as_mut() {
            let replies = respond(frame);
            let mut shared = self.wire.lock();
            shared.rx.extend(replies);
            if shared.responder.is_none() {
                shared.responder = responder;
            }
            drop(shared);
            self.wire.arrived.notify_all();
        }
        tracing::trace!(bus = %self.name, id = %frame.id, len = frame.len, "mock tx");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CanId;

    #[test]
    fn test_recv_times_out_when_idle() {
        let mut bus = MockBus::open("mock0").unwrap();
        assert!(matches!(bus.recv(Some(5)), Err(TransportError::Timeout)));
    }

    #[test]
    fn test_injected_frames_are_received_in_order() {
        let mut bus = MockBus::open("mock0").unwrap();
        let handle = bus.handle();
        let id = CanId::standard(0x10).unwrap();
        handle.inject(CanFrame::new(id, &[1]).unwrap());
        handle.inject(CanFrame::new(id, &[2]).unwrap());
        assert_eq!(bus.recv(Some(5)).unwrap().payload(), &[1]);
        assert_eq!(bus.recv(Some(5)).unwrap().payload(), &[2]);
    }

    #[test]
    fn test_responder_answers_sent_frames() {
        let mut bus = MockBus::open("mock0").unwrap();
        let handle = bus.handle();
        handle.set_responder(|frame| {
            let mut echo = frame.clone();
            echo.data[0] = echo.data[0].wrapping_add(1);
            vec![echo]
        });
        let id = CanId::standard(0x20).unwrap();
        bus.send(&CanFrame::new(id, &[41]).unwrap()).unwrap();
        assert_eq!(handle.sent().len(), 1);
        assert_eq!(bus.recv(Some(5)).unwrap().payload(), &[42]);
    }
}
