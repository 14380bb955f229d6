//! Transport layer module.

pub mod ipmitool;
pub mod mock;
pub mod traits;

pub use ipmitool::{IpmitoolConfig, IpmitoolTransport};
pub use mock::{MockReply, MockTransport};
pub use traits::{ChannelKind, IpmiRequest, IpmiResponse, IpmiTransport, TransportError};
