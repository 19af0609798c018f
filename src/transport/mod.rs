//! Live-update transports and the connection manager

pub mod manager;
pub mod polling;
pub mod socket;
pub mod stream;
pub mod traits;

pub use manager::ConnectionManager;
pub use polling::PollingTransport;
pub use socket::{validate_outbound, SocketTransport};
pub use stream::{SseFrame, SseParser, StreamTransport};
pub use traits::*;
