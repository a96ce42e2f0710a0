//! Identity protocol: bytes pass through unchanged, no prelude.

use bytes::BytesMut;

use crate::core::protocol::{Protocol, ProtocolError, ProtocolFactory, RecvOutcome};

pub struct NullProtocol;

impl Protocol for NullProtocol {
    fn handshake(&mut self, _out: &mut BytesMut) -> Result<(), ProtocolError> {
        Ok(())
    }

    fn send(&mut self, source: &mut BytesMut, dest: &mut BytesMut) -> Result<(), ProtocolError> {
        let bytes = source.split();
        dest.extend_from_slice(&bytes);
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

pub struct NullFactory;

impl ProtocolFactory for NullFactory {
    fn create(&self) -> Result<Box<dyn Protocol>, ProtocolError> {
        Ok(Box::new(NullProtocol))
    }
}
