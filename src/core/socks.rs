//! SOCKS5 negotiator
//!
//! Per-connection state machine for method selection and the CONNECT
//! request (RFC 1928). It never touches sockets: the connection feeds it
//! the input read buffer and it appends replies to the input write buffer,
//! so the engine decides when and how much data moves.

use bytes::{Buf, BytesMut};
use std::io;
use std::net::SocketAddr;

use crate::address::{Address, DecodeResult};

pub const SOCKS_VERSION: u8 = 0x05;
pub const METHOD_NO_AUTH: u8 = 0x00;
pub const METHOD_NO_ACCEPTABLE: u8 = 0xFF;

pub const CMD_CONNECT: u8 = 0x01;

pub const REP_SUCCESS: u8 = 0x00;
pub const REP_GENERAL_FAILURE: u8 = 0x01;
pub const REP_NOT_ALLOWED: u8 = 0x02;
pub const REP_NETWORK_UNREACHABLE: u8 = 0x03;
pub const REP_HOST_UNREACHABLE: u8 = 0x04;
pub const REP_CONNECTION_REFUSED: u8 = 0x05;
pub const REP_TTL_EXPIRED: u8 = 0x06;
pub const REP_CMD_NOT_SUPPORTED: u8 = 0x07;

/// Negotiation progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocksStatus {
    WaitingMethods,
    WaitingRequest,
    HaveAddress,
    SentReply,
}

/// Result of one `handle` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocksRet {
    /// Progress was made; call again
    Good,
    /// Need more input bytes
    Incomplete,
    /// Unrecoverable parse error
    Broken,
    /// Well-formed request, but the command is not CONNECT
    CmdNotConnect,
}

pub struct SocksNegotiator {
    status: SocksStatus,
    addr: Option<Address>,
    bound: Option<SocketAddr>,
}

impl Default for SocksNegotiator {
    fn default() -> Self {
        Self::new()
    }
}

impl SocksNegotiator {
    pub fn new() -> Self {
        Self {
            status: SocksStatus::WaitingMethods,
            addr: None,
            bound: None,
        }
    }

    pub fn status(&self) -> SocksStatus {
        self.status
    }

    /// Requested target. Defined from `HaveAddress` on.
    pub fn address(&self) -> Option<&Address> {
        self.addr.as_ref()
    }

    /// Record the address we actually connected to, for the success reply.
    pub fn set_address(&mut self, peer: SocketAddr) {
        self.bound = Some(peer);
    }

    /// Consume negotiation bytes from `input`, append replies to `output`.
    ///
    /// Driving the negotiator past `WaitingRequest` is a programming bug.
    pub fn handle(&mut self, input: &mut BytesMut, output: &mut BytesMut) -> SocksRet {
        match self.status {
            SocksStatus::WaitingMethods => self.handle_methods(input, output),
            SocksStatus::WaitingRequest => self.handle_request(input),
            SocksStatus::HaveAddress | SocksStatus::SentReply => {
                panic!("SOCKS negotiator driven past the request stage")
            }
        }
    }

    /// Method selection: VER NMETHODS METHODS...
    fn handle_methods(&mut self, input: &mut BytesMut, output: &mut BytesMut) -> SocksRet {
        if input.len() < 2 {
            return SocksRet::Incomplete;
        }
        if input[0] != SOCKS_VERSION {
            return SocksRet::Broken;
        }
        let nmethods = input[1] as usize;
        if input.len() < 2 + nmethods {
            return SocksRet::Incomplete;
        }
        let no_auth = input[2..2 + nmethods].contains(&METHOD_NO_AUTH);
        input.advance(2 + nmethods);

        if !no_auth {
            output.extend_from_slice(&[SOCKS_VERSION, METHOD_NO_ACCEPTABLE]);
            return SocksRet::Broken;
        }
        output.extend_from_slice(&[SOCKS_VERSION, METHOD_NO_AUTH]);
        self.status = SocksStatus::WaitingRequest;
        SocksRet::Good
    }

    /// Request: VER CMD RSV ATYP DST.ADDR DST.PORT
    fn handle_request(&mut self, input: &mut BytesMut) -> SocksRet {
        if input.len() < 4 {
            return SocksRet::Incomplete;
        }
        if input[0] != SOCKS_VERSION || input[2] != 0x00 {
            return SocksRet::Broken;
        }
        let cmd = input[1];
        let (addr, consumed) = match Address::decode(&input[3..]) {
            DecodeResult::Ok(addr, consumed) => (addr, consumed),
            DecodeResult::NeedMoreData => return SocksRet::Incomplete,
            DecodeResult::Invalid(_) => return SocksRet::Broken,
        };
        input.advance(3 + consumed);

        if cmd != CMD_CONNECT {
            return SocksRet::CmdNotConnect;
        }
        self.addr = Some(addr);
        self.status = SocksStatus::HaveAddress;
        SocksRet::Good
    }

    /// Append the final reply. Uses the recorded bound address; if none was
    /// recorded the all-zeros address goes out, which SOCKS5 permits.
    pub fn send_reply(&mut self, output: &mut BytesMut, code: u8) {
        let bound = self
            .bound
            .map(Address::from)
            .unwrap_or(Address::IPv4([0, 0, 0, 0], 0));

        let mut encoded = Vec::with_capacity(22);
        encoded.push(SOCKS_VERSION);
        encoded.push(code);
        encoded.push(0x00);
        bound.encode(&mut encoded);
        output.extend_from_slice(&encoded);
        self.status = SocksStatus::SentReply;
    }
}

/// Map a connect failure to the nearest SOCKS5 reply code
pub fn error_to_reply(err: &io::Error) -> u8 {
    match err.kind() {
        io::ErrorKind::ConnectionRefused => REP_CONNECTION_REFUSED,
        io::ErrorKind::PermissionDenied => REP_NOT_ALLOWED,
        io::ErrorKind::NetworkUnreachable => REP_NETWORK_UNREACHABLE,
        io::ErrorKind::HostUnreachable | io::ErrorKind::NotFound => REP_HOST_UNREACHABLE,
        io::ErrorKind::TimedOut => REP_TTL_EXPIRED,
        _ => REP_GENERAL_FAILURE,
    }
}
