//! ts-link: request/response links to ThingSet devices
//!
//! Every physical link (UART, CAN bus) is shared by all callers of the
//! gateway. The [`channel::Channel`] serializes exchanges on one link and
//! routes incoming messages to either the waiting request or the publication
//! slot. The [`Link`] trait is the single send primitive the device registry
//! works with.

mod error;
pub use error::{LinkError, Result};

mod traits;
pub use traits::Link;

pub mod channel;
pub use channel::{Channel, ChannelState, Framing};

pub mod can;
pub use can::{CanLink, CanReceiver, DEFAULT_CLIENT_ADDRESS};

pub mod serial;
pub use serial::{LineReceiver, SerialLink, SerialReceiver};

mod local;
pub use local::LocalLink;
