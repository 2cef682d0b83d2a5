//! Forwarding pipelines.
//!
//! [`TcpProxy`] runs one pipeline per accepted connection: allowlist and
//! admission checks, upstream dial, then two concurrent copy directions
//! with bandwidth accounting. [`UdpProxy`] dispatches datagrams into
//! virtual sessions, each with an upstream reader task for the return
//! path.

mod tcp;
mod udp;

pub use tcp::TcpProxy;
pub use udp::UdpProxy;
