//! Byte-stream channel
//!
//! One end of a TCP connection with buffered, direction-gated I/O. The
//! channel owns its socket (closed exactly once, on drop) and never blocks:
//! the owning connection asks for the channel's current `Interest`, awaits
//! readiness, then calls [`Channel::service`] for one non-blocking round of
//! reads and writes. Disabling the read side stops draining the kernel
//! buffer, which backpressures the remote peer through TCP.

use bytes::BytesMut;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, Interest, Ready};
use tokio::net::TcpStream;

/// What one `service` round accomplished
#[derive(Debug, Default, Clone, Copy)]
pub struct Progress {
    /// Bytes appended to the read buffer
    pub bytes_read: usize,
    /// The remote peer closed its write side
    pub eof: bool,
    /// Bytes taken off the write buffer
    pub bytes_written: usize,
    /// The write buffer became empty in this round
    pub drained: bool,
}

pub struct Channel {
    stream: TcpStream,
    /// Bytes received and not yet consumed by the connection
    pub read_buf: BytesMut,
    /// Bytes queued for the wire
    pub write_buf: BytesMut,
    read_enabled: bool,
    read_chunk: usize,
    eof: bool,
}

impl Channel {
    /// Wrap an already-connected socket. Reading starts disabled; the
    /// connection enables it once there is somewhere for the bytes to go.
    pub fn from_stream(stream: TcpStream, read_chunk: usize) -> Self {
        Self {
            stream,
            read_buf: BytesMut::new(),
            write_buf: BytesMut::new(),
            read_enabled: false,
            read_chunk,
            eof: false,
        }
    }

    /// Open a channel by connecting out, with a timeout.
    pub async fn connect(
        addr: SocketAddr,
        timeout: Duration,
        nodelay: bool,
        read_chunk: usize,
    ) -> io::Result<Self> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??;
        if nodelay {
            let _ = stream.set_nodelay(true);
        }
        Ok(Self::from_stream(stream, read_chunk))
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.stream.peer_addr()
    }

    pub fn set_read_enabled(&mut self, on: bool) {
        self.read_enabled = on;
    }

    /// Whether a readable event would be acted on
    pub fn wants_read(&self) -> bool {
        self.read_enabled && !self.eof
    }

    /// Whether there are bytes waiting for the wire
    pub fn wants_write(&self) -> bool {
        !self.write_buf.is_empty()
    }

    pub fn saw_eof(&self) -> bool {
        self.eof
    }

    /// Await readiness for `interest`. The caller derives `interest` from
    /// `wants_read`/`wants_write`; passing an interest the channel does not
    /// want merely wastes a wakeup.
    pub async fn ready(&self, interest: Interest) -> io::Result<Ready> {
        self.stream.ready(interest).await
    }

    /// One non-blocking round of I/O against a readiness report.
    pub fn service(&mut self, ready: Ready) -> io::Result<Progress> {
        let mut progress = Progress::default();

        if ready.is_readable() && self.wants_read() {
            self.read_buf.reserve(self.read_chunk);
            let spare = self.read_buf.capacity() - self.read_buf.len();
            let start = self.read_buf.len();
            self.read_buf.resize(start + spare, 0);
            match self.stream.try_read(&mut self.read_buf[start..]) {
                Ok(0) => {
                    self.read_buf.truncate(start);
                    self.eof = true;
                    progress.eof = true;
                }
                Ok(n) => {
                    self.read_buf.truncate(start + n);
                    progress.bytes_read = n;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.read_buf.truncate(start);
                }
                Err(e) => {
                    self.read_buf.truncate(start);
                    return Err(e);
                }
            }
        }

        if ready.is_writable() && self.wants_write() {
            match self.stream.try_write(&self.write_buf) {
                Ok(n) => {
                    let _ = self.write_buf.split_to(n);
                    progress.bytes_written = n;
                    progress.drained = self.write_buf.is_empty();
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e),
            }
        }

        Ok(progress)
    }

    /// Await some inbound bytes (negotiation path). Returns the byte count,
    /// 0 on EOF.
    pub async fn read_some(&mut self) -> io::Result<usize> {
        if self.eof {
            return Ok(0);
        }
        self.read_buf.reserve(self.read_chunk);
        let n = self.stream.read_buf(&mut self.read_buf).await?;
        if n == 0 {
            self.eof = true;
        }
        Ok(n)
    }

    /// Write out the entire pending write buffer (negotiation path).
    pub async fn flush_pending(&mut self) -> io::Result<()> {
        while !self.write_buf.is_empty() {
            let n = self.stream.write_buf(&mut self.write_buf).await?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "socket closed while flushing",
                ));
            }
        }
        Ok(())
    }

    /// Drain the write buffer, then send FIN. Used on the surviving side of
    /// a half-close so buffered bytes reach the peer before it sees EOF.
    pub async fn drain_and_shutdown(&mut self) -> io::Result<()> {
        self.flush_pending().await?;
        self.stream.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt as _;
    use tokio::net::TcpListener;

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn test_service_reads_when_enabled() {
        let (mut client, server) = socket_pair().await;
        let mut ch = Channel::from_stream(server, 4096);
        ch.set_read_enabled(true);

        client.write_all(b"hello").await.unwrap();

        let ready = ch.ready(Interest::READABLE).await.unwrap();
        let progress = ch.service(ready).unwrap();
        assert_eq!(progress.bytes_read, 5);
        assert_eq!(&ch.read_buf[..], b"hello");
    }

    #[tokio::test]
    async fn test_disabled_read_buffers_nothing() {
        let (mut client, server) = socket_pair().await;
        let mut ch = Channel::from_stream(server, 4096);
        assert!(!ch.wants_read());

        client.write_all(b"early").await.unwrap();

        // A readable report with reading disabled must not consume bytes
        let ready = ch.ready(Interest::READABLE).await.unwrap();
        let progress = ch.service(ready).unwrap();
        assert_eq!(progress.bytes_read, 0);
        assert!(ch.read_buf.is_empty());

        ch.set_read_enabled(true);
        let ready = ch.ready(Interest::READABLE).await.unwrap();
        let progress = ch.service(ready).unwrap();
        assert_eq!(progress.bytes_read, 5);
    }

    #[tokio::test]
    async fn test_service_detects_eof() {
        let (client, server) = socket_pair().await;
        let mut ch = Channel::from_stream(server, 4096);
        ch.set_read_enabled(true);
        drop(client);

        loop {
            let ready = ch.ready(Interest::READABLE).await.unwrap();
            let progress = ch.service(ready).unwrap();
            if progress.eof {
                break;
            }
        }
        assert!(ch.saw_eof());
        assert!(!ch.wants_read());
    }

    #[tokio::test]
    async fn test_write_drain_progress() {
        let (client, server) = socket_pair().await;
        let mut ch = Channel::from_stream(server, 4096);
        ch.write_buf.extend_from_slice(b"outbound");
        assert!(ch.wants_write());

        let mut total = 0;
        let mut drained = false;
        while !drained {
            let ready = ch.ready(Interest::WRITABLE).await.unwrap();
            let progress = ch.service(ready).unwrap();
            total += progress.bytes_written;
            drained = progress.drained;
        }
        assert_eq!(total, 8);
        assert!(!ch.wants_write());

        let mut buf = [0u8; 8];
        let mut client = client;
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"outbound");
    }

    #[tokio::test]
    async fn test_read_some_and_flush_pending() {
        let (mut client, server) = socket_pair().await;
        let mut ch = Channel::from_stream(server, 4096);

        client.write_all(b"\x05\x01\x00").await.unwrap();
        let n = ch.read_some().await.unwrap();
        assert_eq!(n, 3);
        assert_eq!(&ch.read_buf[..], b"\x05\x01\x00");

        ch.write_buf.extend_from_slice(b"\x05\x00");
        ch.flush_pending().await.unwrap();
        let mut buf = [0u8; 2];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"\x05\x00");
    }

    #[tokio::test]
    async fn test_drain_and_shutdown_delivers_then_eof() {
        let (mut client, server) = socket_pair().await;
        let mut ch = Channel::from_stream(server, 4096);
        ch.write_buf.extend_from_slice(&[0xAB; 100]);

        ch.drain_and_shutdown().await.unwrap();

        let mut buf = Vec::new();
        client.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf.len(), 100);
        assert!(buf.iter().all(|&b| b == 0xAB));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Bind then drop to get a port with nothing listening
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = Channel::connect(addr, Duration::from_secs(2), true, 4096).await;
        assert!(result.is_err());
    }
}
