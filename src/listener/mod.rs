//! Listener lifecycle management.
//!
//! The [`ListenerManager`] builds one TCP or UDP listener per configured
//! endpoint, starts them atomically (a bind failure rolls back the ones
//! already started), and coordinates graceful shutdown: stop accepting,
//! cancel in-flight work, close rate-limit background tasks and session
//! tables, and wait for the drain within a bounded budget.

mod error;
mod manager;
mod tcp;
mod udp;

pub use error::{ListenerError, ListenerResult};
pub use manager::{Listener, ListenerManager};
pub use tcp::TcpListener;
pub use udp::UdpListener;
