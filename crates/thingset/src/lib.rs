//! thingset: request/response engine for the ThingSet protocol
//!
//! Pure protocol logic shared by every transport of the gateway: URI parsing,
//! the text and binary (CBOR) codecs, the status taxonomy, and a small node
//! store that lets the gateway answer requests addressed to itself.

mod error;
pub use error::{Error, Result};

mod method;
pub use method::{is_exec_node, Method, FETCH_CODE, PUBMSG_CODE};

mod status;
pub use status::{http_status, StatusCode};

mod uri;
pub use uri::{parse_uri, ListSubnodes, UriElements};

pub mod cbor;
pub mod store;
pub mod text;

pub use store::{Access, GatewayInfo, Store};
