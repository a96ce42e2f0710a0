//! Connect targets and their SOCKS5 wire form
//!
//! On the wire an address is an ATYP byte, the host (4 octets, 16 octets,
//! or a length-prefixed name), and a big-endian port.

use std::borrow::Cow;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// SOCKS5 ATYP identifiers
pub const ATYP_IPV4: u8 = 1;
pub const ATYP_DOMAIN: u8 = 3;
pub const ATYP_IPV6: u8 = 4;

/// Outcome of decoding from a byte buffer
#[derive(Debug)]
pub enum DecodeResult<T> {
    /// Decoded a value, consuming this many bytes
    Ok(T, usize),
    /// More bytes required
    NeedMoreData,
    /// Malformed input
    Invalid(&'static str),
}

/// A connect target: literal IP or a hostname to be resolved
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    /// IPv4 address
    IPv4([u8; 4], u16),
    /// IPv6 address
    IPv6([u8; 16], u16),
    /// Domain name
    Domain(String, u16),
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.socket_addr() {
            Some(sa) => write!(f, "{}", sa),
            None => write!(f, "{}:{}", self.host(), self.port()),
        }
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        match addr.ip() {
            IpAddr::V4(ip) => Address::IPv4(ip.octets(), addr.port()),
            IpAddr::V6(ip) => Address::IPv6(ip.octets(), addr.port()),
        }
    }
}

impl Address {
    /// Append the wire form to `buf`, returning how many bytes were written
    pub fn encode(&self, buf: &mut Vec<u8>) -> usize {
        let start = buf.len();
        match self {
            Address::IPv4(ip, _) => {
                buf.push(ATYP_IPV4);
                buf.extend_from_slice(ip);
            }
            Address::IPv6(ip, _) => {
                buf.push(ATYP_IPV6);
                buf.extend_from_slice(ip);
            }
            Address::Domain(domain, _) => {
                buf.push(ATYP_DOMAIN);
                buf.push(domain.len() as u8);
                buf.extend_from_slice(domain.as_bytes());
            }
        }
        buf.extend_from_slice(&self.port().to_be_bytes());
        buf.len() - start
    }

    /// Get the port number
    pub fn port(&self) -> u16 {
        match *self {
            Address::IPv4(_, port) | Address::IPv6(_, port) => port,
            Address::Domain(_, port) => port,
        }
    }

    /// Host portion, without the port
    pub fn host(&self) -> Cow<'_, str> {
        match self {
            Address::Domain(domain, _) => Cow::Borrowed(domain.as_str()),
            Address::IPv4(ip, _) => Ipv4Addr::from(*ip).to_string().into(),
            Address::IPv6(ip, _) => Ipv6Addr::from(*ip).to_string().into(),
        }
    }

    /// Literal socket address, if this target needs no resolution
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        match self {
            Address::IPv4(ip, port) => {
                Some(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(*ip)), *port))
            }
            Address::IPv6(ip, port) => {
                Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(*ip)), *port))
            }
            Address::Domain(..) => None,
        }
    }

    /// Decode one wire-form address from the front of `buf`
    pub fn decode(buf: &[u8]) -> DecodeResult<Self> {
        let Some(&atyp) = buf.first() else {
            return DecodeResult::NeedMoreData;
        };

        // Host field length; the domain form spends one extra byte on its
        // own length prefix
        let host_len = match atyp {
            ATYP_IPV4 => 4,
            ATYP_IPV6 => 16,
            ATYP_DOMAIN => match buf.get(1) {
                Some(&len) => 1 + len as usize,
                None => return DecodeResult::NeedMoreData,
            },
            _ => return DecodeResult::Invalid("unknown address type"),
        };

        let total = 1 + host_len + 2;
        if buf.len() < total {
            return DecodeResult::NeedMoreData;
        }
        let port = u16::from_be_bytes([buf[total - 2], buf[total - 1]]);

        let addr = match atyp {
            ATYP_IPV4 => {
                let mut ip = [0u8; 4];
                ip.copy_from_slice(&buf[1..5]);
                Address::IPv4(ip, port)
            }
            ATYP_IPV6 => {
                let mut ip = [0u8; 16];
                ip.copy_from_slice(&buf[1..17]);
                Address::IPv6(ip, port)
            }
            _ => match std::str::from_utf8(&buf[2..1 + host_len]) {
                Ok(name) => Address::Domain(name.to_string(), port),
                Err(_) => return DecodeResult::Invalid("domain is not valid UTF-8"),
            },
        };
        DecodeResult::Ok(addr, total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decoded(bytes: &[u8]) -> (Address, usize) {
        match Address::decode(bytes) {
            DecodeResult::Ok(addr, used) => (addr, used),
            other => panic!("decode failed: {:?}", other),
        }
    }

    #[test]
    fn decode_ipv4() {
        let (addr, used) = decoded(&[0x01, 10, 20, 30, 40, 0x00, 0x35]);
        assert_eq!(addr, Address::IPv4([10, 20, 30, 40], 53));
        assert_eq!(used, 7);
    }

    #[test]
    fn decode_ipv6() {
        let ip = Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 0x17);
        let mut bytes = vec![0x04];
        bytes.extend_from_slice(&ip.octets());
        bytes.extend_from_slice(&9001u16.to_be_bytes());

        let (addr, used) = decoded(&bytes);
        assert_eq!(addr, Address::IPv6(ip.octets(), 9001));
        assert_eq!(used, 19);
    }

    #[test]
    fn decode_domain() {
        let mut bytes = vec![0x03, 5];
        bytes.extend_from_slice(b"relay");
        bytes.extend_from_slice(&443u16.to_be_bytes());

        let (addr, used) = decoded(&bytes);
        assert_eq!(addr, Address::Domain("relay".to_string(), 443));
        assert_eq!(used, bytes.len());
    }

    #[test]
    fn decode_ignores_trailing_bytes() {
        let mut bytes = vec![0x01, 127, 0, 0, 1, 0x1F, 0x90];
        bytes.extend_from_slice(b"leftover");
        let (addr, used) = decoded(&bytes);
        assert_eq!(addr, Address::IPv4([127, 0, 0, 1], 8080));
        assert_eq!(used, 7);
    }

    #[test]
    fn decode_rejects_every_truncation() {
        let mut full = vec![0x03, 5];
        full.extend_from_slice(b"relay");
        full.extend_from_slice(&443u16.to_be_bytes());
        for cut in 0..full.len() {
            assert!(
                matches!(Address::decode(&full[..cut]), DecodeResult::NeedMoreData),
                "prefix of {} bytes should be incomplete",
                cut
            );
        }

        let v4 = [0x01, 10, 20, 30, 40, 0x00, 0x35];
        for cut in 0..v4.len() {
            assert!(matches!(
                Address::decode(&v4[..cut]),
                DecodeResult::NeedMoreData
            ));
        }
    }

    #[test]
    fn decode_rejects_unknown_atyp() {
        // 0x02 is not a SOCKS5 address type
        let bytes = [0x02, 127, 0, 0, 1, 0x00, 0x50];
        assert!(matches!(Address::decode(&bytes), DecodeResult::Invalid(_)));
    }

    #[test]
    fn decode_rejects_non_utf8_domain() {
        let bytes = [0x03, 2, 0xC0, 0xC0, 0x1F, 0x40];
        assert!(matches!(Address::decode(&bytes), DecodeResult::Invalid(_)));
    }

    #[test]
    fn encode_ipv4_layout() {
        // Appends after existing content and reports only its own length
        let mut wire = vec![0xAA];
        let written = Address::IPv4([198, 51, 100, 2], 1080).encode(&mut wire);
        assert_eq!(written, 7);
        assert_eq!(wire, vec![0xAA, 0x01, 198, 51, 100, 2, 0x04, 0x38]);
    }

    #[test]
    fn encode_decode_roundtrip() {
        let cases = [
            Address::IPv4([192, 0, 2, 7], 8080),
            Address::IPv6(Ipv6Addr::LOCALHOST.octets(), 443),
            Address::Domain("bridge.example".to_string(), 9050),
        ];
        for case in cases {
            let mut wire = Vec::new();
            let written = case.encode(&mut wire);
            assert_eq!(written, wire.len());

            let (addr, used) = decoded(&wire);
            assert_eq!(addr, case);
            assert_eq!(used, wire.len());
        }
    }

    #[test]
    fn display_formats() {
        assert_eq!(
            Address::IPv4([10, 20, 30, 40], 53).to_string(),
            "10.20.30.40:53"
        );
        assert_eq!(
            Address::IPv6(Ipv6Addr::LOCALHOST.octets(), 8443).to_string(),
            "[::1]:8443"
        );
        assert_eq!(
            Address::Domain("relay.invalid".to_string(), 7001).to_string(),
            "relay.invalid:7001"
        );
    }

    #[test]
    fn from_socket_addr_and_back() {
        let sa: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let addr = Address::from(sa);
        assert_eq!(addr, Address::IPv4([127, 0, 0, 1], 9000));
        assert_eq!(addr.socket_addr(), Some(sa));

        let sa6: SocketAddr = "[::1]:4433".parse().unwrap();
        assert_eq!(Address::from(sa6).socket_addr(), Some(sa6));
    }

    #[test]
    fn domain_has_no_literal_socket_addr() {
        let addr = Address::Domain("bridge.example".to_string(), 80);
        assert!(addr.socket_addr().is_none());
    }

    #[test]
    fn host_and_port_accessors() {
        let v4 = Address::IPv4([10, 0, 0, 1], 80);
        assert_eq!(v4.host(), "10.0.0.1");
        assert_eq!(v4.port(), 80);

        let named = Address::Domain("bridge.example".to_string(), 9050);
        assert_eq!(named.host(), "bridge.example");
        assert_eq!(named.port(), 9050);
    }
}
