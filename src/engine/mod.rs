//! Flow engines
//!
//! One handler per transport protocol, fed by the userspace stack's accept
//! callbacks. Both gate through [`crate::flow`], dial through the proxy
//! registry, and report a [`crate::summary::SocketSummary`] per flow.

pub mod split;
pub mod tcp;
pub mod udp;

pub use split::{calc_timeout, HelloSplitWriter, UpstreamWriter};
pub use tcp::TcpHandler;
pub use udp::{UdpHandler, MAX_CONN_ERRORS};
