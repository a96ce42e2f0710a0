//! Obfuscation protocol plugin contract
//!
//! The engine is the sole driver of these calls: `handshake` once before any
//! application data, `send` for plaintext heading to the obfuscated peer,
//! `recv` for wire bytes heading back. Plugins never touch sockets; they
//! transform between the byte buffers the engine hands them.

use bytes::BytesMut;
use thiserror::Error;

/// Failure inside a protocol plugin. Any error closes the connection
/// without a reply to either peer.
#[derive(Error, Debug)]
#[error("{0}")]
pub struct ProtocolError(pub String);

impl ProtocolError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// Outcome of a successful `recv` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvOutcome {
    /// Plaintext (possibly none yet) appended; nothing else to do
    Good,
    /// The plugin wants to emit bytes in the reverse direction right away;
    /// the engine must follow up with a `send` call in the same turn
    SendPending,
}

/// Per-connection obfuscation state
pub trait Protocol: Send {
    /// Append the initial handshake prelude, if the protocol has one.
    /// Called exactly once, before any application data flows.
    fn handshake(&mut self, out: &mut BytesMut) -> Result<(), ProtocolError>;

    /// Consume plaintext from `source`, append obfuscated bytes to `dest`
    fn send(&mut self, source: &mut BytesMut, dest: &mut BytesMut) -> Result<(), ProtocolError>;

    /// Consume obfuscated bytes from `source`, append recovered plaintext
    /// to `dest`. An `Err` is unrecoverable and closes the connection.
    fn recv(
        &mut self,
        source: &mut BytesMut,
        dest: &mut BytesMut,
    ) -> Result<RecvOutcome, ProtocolError>;
}

/// Constructs per-connection protocol state from shared parameters
pub trait ProtocolFactory: Send + Sync {
    fn create(&self) -> Result<Box<dyn Protocol>, ProtocolError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Doubler;

    impl Protocol for Doubler {
        fn handshake(&mut self, _out: &mut BytesMut) -> Result<(), ProtocolError> {
            Ok(())
        }

        fn send(
            &mut self,
            source: &mut BytesMut,
            dest: &mut BytesMut,
        ) -> Result<(), ProtocolError> {
            for b in source.split() {
                dest.extend_from_slice(&[b, b]);
            }
            Ok(())
        }

        fn recv(
            &mut self,
            source: &mut BytesMut,
            dest: &mut BytesMut,
        ) -> Result<RecvOutcome, ProtocolError> {
            let bytes = source.split();
            dest.extend_from_slice(&bytes);
            Ok(RecvOutcome::Good)
        }
    }

    #[test]
    fn test_object_safety() {
        let mut plugin: Box<dyn Protocol> = Box::new(Doubler);
        let mut src = BytesMut::from(&b"ab"[..]);
        let mut dst = BytesMut::new();
        plugin.send(&mut src, &mut dst).unwrap();
        assert_eq!(&dst[..], b"aabb");
        assert!(src.is_empty());
    }

    #[test]
    fn test_protocol_error_display() {
        let err = ProtocolError::new("truncated frame");
        assert_eq!(format!("{}", err), "truncated frame");
    }
}
