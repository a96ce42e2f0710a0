//! Tunnel engine core
//!
//! - Byte-stream channel over one socket
//! - SOCKS5 negotiator
//! - Obfuscation protocol plugin contract
//! - Per-connection state machine
//! - Listener set and lifecycle management

pub mod channel;
pub mod connection;
pub mod engine;
pub mod protocol;
pub mod socks;

pub use channel::Channel;
pub use connection::Connection;
pub use engine::{ConnectionId, Engine, ListenerParams};
pub use protocol::{Protocol, ProtocolError, ProtocolFactory, RecvOutcome};
pub use socks::{SocksNegotiator, SocksRet, SocksStatus};
