//! Shared request/response and publication mailbox of one physical link.
//!
//! A receive task classifies every incoming message by its lead byte and
//! hands it to the [`Channel`]; request senders and publication consumers
//! block on it. Only one request can be in flight at a time: the
//! [`RequestGuard`] returned by [`Channel::request`] owns the response slot
//! until it is dropped.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use thingset::PUBMSG_CODE;

use crate::{LinkError, Result};

/// Response and publication buffer size of the serial link.
pub const DEFAULT_CAPACITY: usize = 1024;

/// How lead bytes are told apart.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Framing {
    /// `:` starts a response, `#` a publication.
    Text,
    /// Status bytes (0x80 and up) start a response, 0x1F a publication.
    Binary,
}

impl Framing {
    pub fn is_response(self, lead: u8) -> bool {
        match self {
            Framing::Text => lead == b':',
            Framing::Binary => lead >= 0x80,
        }
    }

    pub fn is_publication(self, lead: u8) -> bool {
        match self {
            Framing::Text => lead == b'#',
            Framing::Binary => lead == PUBMSG_CODE,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelState {
    Idle,
    AwaitingResponse,
    Receiving,
    ResponseReady,
}

/// Destination of a message that is being received.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Claim {
    Response,
    Publication,
    Discard,
}

struct Inner {
    request_held: bool,
    state: ChannelState,
    response: Vec<u8>,
    /// Node the pending request was sent to, on shared buses.
    peer: Option<u8>,
    pub_held: bool,
    pub_receiving: bool,
    publication: Option<Vec<u8>>,
}

pub struct Channel {
    framing: Framing,
    capacity: usize,
    inner: Mutex<Inner>,
    changed: Condvar,
}

impl Channel {
    pub fn new(framing: Framing) -> Self {
        Self::with_capacity(framing, DEFAULT_CAPACITY)
    }

    pub fn with_capacity(framing: Framing, capacity: usize) -> Self {
        Self {
            framing,
            capacity,
            inner: Mutex::new(Inner {
                request_held: false,
                state: ChannelState::Idle,
                response: Vec::new(),
                peer: None,
                pub_held: false,
                pub_receiving: false,
                publication: None,
            }),
            changed: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn framing(&self) -> Framing {
        self.framing
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn state(&self) -> ChannelState {
        self.lock().state
    }

    /// Takes the response slot, waiting at most `timeout` for a previous
    /// request to finish. The request bytes must be written only after this
    /// returns, so that the response cannot be missed.
    pub fn request(&self, timeout: Duration) -> Result<RequestGuard<'_>> {
        self.acquire(None, timeout)
    }

    /// Like [`Channel::request`], but only a response that comes from `peer`
    /// (see [`Channel::deliver_from`]) is accepted.
    pub fn request_from(&self, peer: u8, timeout: Duration) -> Result<RequestGuard<'_>> {
        self.acquire(Some(peer), timeout)
    }

    /// Node the pending request waits on, if it was taken with
    /// [`Channel::request_from`].
    pub fn peer(&self) -> Option<u8> {
        let inner = self.lock();
        if inner.request_held {
            inner.peer
        } else {
            None
        }
    }

    fn acquire(&self, peer: Option<u8>, timeout: Duration) -> Result<RequestGuard<'_>> {
        let inner = self.lock();
        let (mut inner, _) = self
            .changed
            .wait_timeout_while(inner, timeout, |i| i.request_held)
            .unwrap_or_else(PoisonError::into_inner);
        if inner.request_held {
            tracing::warn!(?timeout, "could not acquire channel");
            return Err(LinkError::Busy);
        }
        inner.request_held = true;
        inner.peer = peer;
        inner.state = ChannelState::AwaitingResponse;
        inner.response.clear();
        Ok(RequestGuard {
            channel: self,
            response: None,
        })
    }

    /// Called by the receive task when a new message starts.
    pub fn begin_frame(&self, lead: u8) -> Claim {
        self.begin(lead, None)
    }

    fn begin(&self, lead: u8, source: Option<u8>) -> Claim {
        let mut inner = self.lock();
        if self.framing.is_response(lead) {
            if let (Some(peer), Some(source)) = (inner.peer, source) {
                if peer != source && inner.state == ChannelState::AwaitingResponse {
                    tracing::trace!(peer, source, "dropping response from another node");
                    return Claim::Discard;
                }
            }
            if inner.state == ChannelState::AwaitingResponse {
                inner.state = ChannelState::Receiving;
                return Claim::Response;
            }
            tracing::trace!(lead, "dropping unsolicited response");
        } else if self.framing.is_publication(lead) {
            if !inner.pub_held && !inner.pub_receiving {
                inner.pub_receiving = true;
                return Claim::Publication;
            }
            tracing::debug!("publication slot busy, dropping message");
        }
        Claim::Discard
    }

    /// Stores a finished message; bytes beyond the capacity are dropped.
    pub fn finish_frame(&self, claim: Claim, mut frame: Vec<u8>) {
        frame.truncate(self.capacity);
        let mut inner = self.lock();
        match claim {
            Claim::Response if inner.state == ChannelState::Receiving => {
                inner.response = frame;
                inner.state = ChannelState::ResponseReady;
            }
            Claim::Publication => {
                inner.pub_receiving = false;
                inner.publication = Some(frame);
            }
            _ => return,
        }
        drop(inner);
        self.changed.notify_all();
    }

    /// Classifies and stores a message that arrived in one piece.
    pub fn deliver(&self, frame: Vec<u8>) -> Claim {
        self.deliver_inner(None, frame)
    }

    /// Like [`Channel::deliver`] for a message from node `source`.
    pub fn deliver_from(&self, source: u8, frame: Vec<u8>) -> Claim {
        self.deliver_inner(Some(source), frame)
    }

    fn deliver_inner(&self, source: Option<u8>, frame: Vec<u8>) -> Claim {
        let claim = frame
            .first()
            .map_or(Claim::Discard, |&lead| self.begin(lead, source));
        self.finish_frame(claim, frame);
        claim
    }

    /// Waits for the latest publication and holds the slot until the guard is
    /// dropped. Publications arriving meanwhile are dropped.
    pub fn publication(&self, timeout: Duration) -> Option<PublicationGuard<'_>> {
        let inner = self.lock();
        let (mut inner, _) = self
            .changed
            .wait_timeout_while(inner, timeout, |i| i.pub_held || i.publication.is_none())
            .unwrap_or_else(PoisonError::into_inner);
        if inner.pub_held {
            return None;
        }
        let message = inner.publication.take()?;
        inner.pub_held = true;
        Some(PublicationGuard {
            channel: self,
            message,
        })
    }
}

/// Exclusive use of the response slot for one exchange.
pub struct RequestGuard<'a> {
    channel: &'a Channel,
    response: Option<Vec<u8>>,
}

impl RequestGuard<'_> {
    /// Waits for the response, including its lead byte.
    pub fn response(&mut self, timeout: Duration) -> Option<&[u8]> {
        if self.response.is_none() {
            let inner = self.channel.lock();
            let (mut inner, _) = self
                .channel
                .changed
                .wait_timeout_while(inner, timeout, |i| i.state != ChannelState::ResponseReady)
                .unwrap_or_else(PoisonError::into_inner);
            if inner.state == ChannelState::ResponseReady {
                self.response = Some(std::mem::take(&mut inner.response));
                inner.state = ChannelState::Idle;
            }
        }
        self.response.as_deref()
    }

    pub fn into_response(mut self, timeout: Duration) -> Option<Vec<u8>> {
        self.response(timeout)?;
        self.response.take()
    }
}

impl Drop for RequestGuard<'_> {
    fn drop(&mut self) {
        let mut inner = self.channel.lock();
        inner.request_held = false;
        inner.peer = None;
        inner.state = ChannelState::Idle;
        inner.response.clear();
        drop(inner);
        self.channel.changed.notify_all();
    }
}

/// A received publication; the slot is released on drop.
pub struct PublicationGuard<'a> {
    channel: &'a Channel,
    message: Vec<u8>,
}

impl PublicationGuard<'_> {
    pub fn as_bytes(&self) -> &[u8] {
        &self.message
    }

    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.message).ok()
    }
}

impl std::ops::Deref for PublicationGuard<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.message
    }
}

impl Drop for PublicationGuard<'_> {
    fn drop(&mut self) {
        self.channel.lock().pub_held = false;
        self.channel.changed.notify_all();
    }
}
