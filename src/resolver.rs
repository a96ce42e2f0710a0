//! Hostname resolution seam
//!
//! The engine consumes DNS through this trait so tests can substitute a
//! fixed resolver and SOCKS hostname connects never block the accept path.

use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use tokio::net::lookup_host;

use crate::address::Address;

/// Resolves a connect target to a socket address
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, host: &str, port: u16) -> io::Result<SocketAddr>;
}

/// Resolver backed by the operating system (getaddrinfo via tokio)
pub struct SystemResolver;

#[async_trait]
impl Resolver for SystemResolver {
    async fn resolve(&self, host: &str, port: u16) -> io::Result<SocketAddr> {
        let mut addrs = lookup_host((host, port)).await?;
        addrs.next().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no addresses found for {}", host),
            )
        })
    }
}

/// Resolve an [`Address`], short-circuiting literal IPs
pub async fn resolve_address(resolver: &dyn Resolver, addr: &Address) -> io::Result<SocketAddr> {
    match addr.socket_addr() {
        Some(sa) => Ok(sa),
        None => resolver.resolve(&addr.host(), addr.port()).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolve_literal_ipv4() {
        let addr = Address::IPv4([127, 0, 0, 1], 8080);
        let sa = resolve_address(&SystemResolver, &addr).await.unwrap();
        assert_eq!(sa.to_string(), "127.0.0.1:8080");
    }

    #[tokio::test]
    async fn test_resolve_literal_ipv6() {
        let addr = Address::IPv6([0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1], 443);
        let sa = resolve_address(&SystemResolver, &addr).await.unwrap();
        assert_eq!(sa.to_string(), "[::1]:443");
    }

    #[tokio::test]
    async fn test_resolve_localhost() {
        let addr = Address::Domain("localhost".to_string(), 80);
        assert!(resolve_address(&SystemResolver, &addr).await.is_ok());
    }

    #[tokio::test]
    async fn test_resolve_empty_domain_fails() {
        let addr = Address::Domain("".to_string(), 80);
        assert!(resolve_address(&SystemResolver, &addr).await.is_err());
    }
}
