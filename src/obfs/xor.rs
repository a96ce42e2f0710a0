//! Keyed rolling-XOR protocol
//!
//! The prelude is a 4-byte magic run through the same keystream as the data,
//! so each direction of the wire starts with a verifiable header. Peers with
//! mismatched keys fail the magic check on the first `recv` instead of
//! silently corrupting the stream.

use bytes::{BufMut, BytesMut};
use std::sync::Arc;

use crate::core::protocol::{Protocol, ProtocolError, ProtocolFactory, RecvOutcome};

const MAGIC: [u8; 4] = [0x9e, 0x5a, 0xc3, 0x17];

pub struct XorProtocol {
    key: Arc<[u8]>,
    send_pos: usize,
    recv_pos: usize,
    /// Magic bytes still expected at the head of the inbound stream
    prelude_pending: usize,
}

impl XorProtocol {
    fn new(key: Arc<[u8]>) -> Self {
        Self {
            key,
            send_pos: 0,
            recv_pos: 0,
            prelude_pending: MAGIC.len(),
        }
    }
}

impl Protocol for XorProtocol {
    fn handshake(&mut self, out: &mut BytesMut) -> Result<(), ProtocolError> {
        for b in MAGIC {
            out.put_u8(b ^ self.key[self.send_pos % self.key.len()]);
            self.send_pos += 1;
        }
        Ok(())
    }

    fn send(&mut self, source: &mut BytesMut, dest: &mut BytesMut) -> Result<(), ProtocolError> {
        dest.reserve(source.len());
        for b in source.split() {
            dest.put_u8(b ^ self.key[self.send_pos % self.key.len()]);
            self.send_pos += 1;
        }
        Ok(())
    }

    fn recv(
        &mut self,
        source: &mut BytesMut,
        dest: &mut BytesMut,
    ) -> Result<RecvOutcome, ProtocolError> {
        dest.reserve(source.len());
        for b in source.split() {
            let plain = b ^ self.key[self.recv_pos % self.key.len()];
            self.recv_pos += 1;
            if self.prelude_pending > 0 {
                let expect = MAGIC[MAGIC.len() - self.prelude_pending];
                if plain != expect {
                    return Err(ProtocolError::new("bad handshake prelude"));
                }
                self.prelude_pending -= 1;
            } else {
                dest.put_u8(plain);
            }
        }
        Ok(RecvOutcome::Good)
    }
}

pub struct XorFactory {
    key: Arc<[u8]>,
}

impl XorFactory {
    pub fn new(key: &[u8]) -> Self {
        assert!(!key.is_empty(), "xor key must be non-empty");
        Self {
            key: Arc::from(key),
        }
    }
}

impl ProtocolFactory for XorFactory {
    fn create(&self) -> Result<Box<dyn Protocol>, ProtocolError> {
        Ok(Box::new(XorProtocol::new(Arc::clone(&self.key))))
    }
}
