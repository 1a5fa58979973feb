//! can-transport: CAN bus abstractions for the ThingSet gateway
//!
//! This crate provides traits and types for interacting with Controller Area Network (CAN)
//! interfaces, with feature-gated backends, plus the ISO-TP segmentation used to carry
//! ThingSet requests larger than one frame. The default build enables a `mock` backend so
//! that binaries and tests run on any host without native drivers.

mod types;
pub use types::{BusInfo, CanFilter, CanFrame, CanId, Timestamp, ISOTP_ID_PREFIX};

mod error;
pub use error::{IsoTpError, Result, TransportError};

mod traits;
pub use traits::CanBus;

pub mod isotp;

#[cfg(feature = "mock")]
mod mock;

#[cfg(feature = "mock")]
pub use mock::{MockBus, MockHandle};

#[cfg(feature = "slcan")]
mod slcan;

#[cfg(feature = "slcan")]
pub use slcan::{SlcanBitrate, SlcanBus};
