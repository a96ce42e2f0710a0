//! Per-connection state machine
//!
//! A connection pairs two channels: `input` wraps the accepted socket,
//! `output` is connected toward the downstream peer (lazily, after SOCKS
//! negotiation, in socks-client mode). Which side carries plaintext depends
//! on the mode: the accepted side in client modes, the connected side in
//! simple-server mode.
//!
//! Lifecycle: Negotiating (socks only) -> Connecting -> Open -> Flushing ->
//! Closed. Each phase is a code position in [`Connection::drive`]; the
//! `state` field tracks it for logging and assertions.

use bytes::BytesMut;
use std::io;
use std::sync::Arc;
use tokio::io::Interest;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use crate::address::Address;
use crate::config::{ConnConfig, ListenerMode};
use crate::core::channel::Channel;
use crate::core::protocol::{Protocol, ProtocolError, RecvOutcome};
use crate::core::socks::{self, SocksNegotiator, SocksRet, SocksStatus};
use crate::logger::log;
use crate::resolver::{resolve_address, Resolver};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    Negotiating,
    Connecting,
    Open,
    Flushing,
    Closed,
}

pub struct Connection {
    mode: ListenerMode,
    config: ConnConfig,
    state: ConnState,
    proto: Box<dyn Protocol>,
    socks: Option<SocksNegotiator>,
    input: Channel,
    output: Option<Channel>,
    target: Option<Address>,
    resolver: Arc<dyn Resolver>,
    cancel: CancellationToken,
    peer: String,
}

/// Which channel a readiness event arrived on
enum Side {
    Input,
    Output,
}

fn proto_err(e: ProtocolError) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e)
}

/// Readiness interest for one channel. Reading is withheld while the peer
/// channel has too much buffered, so a stalled peer backpressures the
/// source through the kernel instead of ballooning our buffers.
fn channel_interest(ch: &Channel, peer_buffered: usize, high_water: usize) -> Option<Interest> {
    let mut interest = None;
    if ch.wants_read() && peer_buffered < high_water {
        interest = Some(Interest::READABLE);
    }
    if ch.wants_write() {
        interest = Some(match interest {
            Some(i) => i | Interest::WRITABLE,
            None => Interest::WRITABLE,
        });
    }
    interest
}

impl Connection {
    /// Build a connection around a freshly accepted socket. In socks-client
    /// mode `target` is discovered during negotiation; in the simple modes
    /// it is the listener's fixed target.
    pub fn new(
        mode: ListenerMode,
        stream: TcpStream,
        target: Option<Address>,
        proto: Box<dyn Protocol>,
        resolver: Arc<dyn Resolver>,
        config: ConnConfig,
        cancel: CancellationToken,
    ) -> Self {
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "<unknown>".to_string());
        let socks = matches!(mode, ListenerMode::SocksClient).then(SocksNegotiator::new);
        let state = if socks.is_some() {
            ConnState::Negotiating
        } else {
            ConnState::Connecting
        };
        Self {
            mode,
            config,
            state,
            proto,
            socks,
            input: Channel::from_stream(stream, config.read_chunk),
            output: None,
            target,
            resolver,
            cancel,
            peer,
        }
    }

    /// Run the connection to completion. Cancellation (barbaric shutdown)
    /// abandons the state machine mid-flight; both sockets and all buffered
    /// bytes are released on drop.
    pub async fn run(mut self) {
        let cancel = self.cancel.clone();
        tokio::select! {
            result = self.drive() => {
                if let Err(e) = result {
                    log::debug!(peer = %self.peer, error = %e, "Connection ended with error");
                }
            }
            _ = cancel.cancelled() => {
                log::debug!(peer = %self.peer, "Connection force-closed");
            }
        }
        log::debug!(peer = %self.peer, last_state = ?self.state, "Tearing down");
        self.state = ConnState::Closed;
        log::connection(&self.peer, "closed");
    }

    async fn drive(&mut self) -> io::Result<()> {
        let target = match self.mode {
            ListenerMode::SocksClient => match self.negotiate().await? {
                Some(addr) => addr,
                None => return Ok(()),
            },
            _ => self
                .target
                .clone()
                .expect("simple-mode listener carries a fixed target"),
        };

        self.state = ConnState::Connecting;
        if !self.open_downstream(&target).await? {
            return Ok(());
        }
        self.shuttle().await
    }

    /// S0: drive the SOCKS negotiator until it has a target address.
    /// Returns None when the connection was rejected (reply already
    /// flushed) or the client went away.
    async fn negotiate(&mut self) -> io::Result<Option<Address>> {
        let deadline = tokio::time::Instant::now() + self.config.negotiation_timeout;

        loop {
            loop {
                let negotiator = self.socks.as_mut().expect("negotiator in socks mode");
                if negotiator.status() == SocksStatus::HaveAddress {
                    let addr = negotiator.address().cloned().expect("address available");
                    // Method-selection reply goes out before we start connecting
                    self.input.flush_pending().await?;
                    log::debug!(peer = %self.peer, target = %addr, "SOCKS request accepted");
                    return Ok(Some(addr));
                }
                match negotiator.handle(&mut self.input.read_buf, &mut self.input.write_buf) {
                    SocksRet::Good => continue,
                    SocksRet::Incomplete => break,
                    SocksRet::Broken => {
                        log::debug!(peer = %self.peer, "SOCKS negotiation broken");
                        if negotiator.status() == SocksStatus::WaitingRequest {
                            negotiator
                                .send_reply(&mut self.input.write_buf, socks::REP_GENERAL_FAILURE);
                        }
                        return self.flush_reject().await.map(|_| None);
                    }
                    SocksRet::CmdNotConnect => {
                        log::debug!(peer = %self.peer, "SOCKS command not supported");
                        negotiator
                            .send_reply(&mut self.input.write_buf, socks::REP_CMD_NOT_SUPPORTED);
                        return self.flush_reject().await.map(|_| None);
                    }
                }
            }

            self.input.flush_pending().await?;
            let n = tokio::time::timeout_at(deadline, self.input.read_some())
                .await
                .map_err(|_| {
                    io::Error::new(io::ErrorKind::TimedOut, "SOCKS negotiation timed out")
                })??;
            if n == 0 {
                // Client went away mid-negotiation
                return Ok(None);
            }
        }
    }

    /// Flush a negative SOCKS reply, then half-close so the client sees it
    /// before the connection disappears.
    async fn flush_reject(&mut self) -> io::Result<()> {
        self.state = ConnState::Flushing;
        self.input.drain_and_shutdown().await
    }

    /// S1: resolve, queue the handshake prelude, connect the output
    /// channel. Returns false when the connection is finished (failure
    /// paths report back to the SOCKS client where one exists).
    async fn open_downstream(&mut self, target: &Address) -> io::Result<bool> {
        let resolved = match resolve_address(self.resolver.as_ref(), target).await {
            Ok(addr) => addr,
            Err(e) => {
                log::warn!(peer = %self.peer, target = %target, error = %e, "Resolution failed");
                return self.on_connect_failure(&e).await.map(|_| false);
            }
        };

        // The prelude is queued before the connect so it precedes any
        // application data on its channel.
        let mut prelude = BytesMut::new();
        if let Err(e) = self.proto.handshake(&mut prelude) {
            log::warn!(peer = %self.peer, error = %e, "Protocol handshake failed");
            if self.socks.is_some() {
                return self
                    .on_connect_failure(&proto_err(e))
                    .await
                    .map(|_| false);
            }
            return Ok(false);
        }
        if self.mode == ListenerMode::SimpleServer {
            // Server-to-client prelude travels back on the accepted side
            self.input.write_buf.extend_from_slice(&prelude);
            prelude.clear();
        }

        let mut output = match Channel::connect(
            resolved,
            self.config.connect_timeout,
            self.config.tcp_nodelay,
            self.config.read_chunk,
        )
        .await
        {
            Ok(ch) => ch,
            Err(e) => {
                log::warn!(peer = %self.peer, target = %target, error = %e, "Connect failed");
                return self.on_connect_failure(&e).await.map(|_| false);
            }
        };
        output.write_buf.extend_from_slice(&prelude);

        if let Some(mut negotiator) = self.socks.take() {
            // Tell the client where we actually landed; if the kernel can't
            // say, the all-zeros address is legal in SOCKS5.
            if let Ok(peer) = output.peer_addr() {
                negotiator.set_address(peer);
            }
            negotiator.send_reply(&mut self.input.write_buf, socks::REP_SUCCESS);
            // The success reply reaches the client before any pipelined
            // payload moves toward the target.
            self.input.flush_pending().await?;
        }

        self.output = Some(output);
        Ok(true)
    }

    /// Connect-phase failure: report to the SOCKS client when there is one,
    /// otherwise just tear down. Queued prelude bytes are discarded.
    async fn on_connect_failure(&mut self, err: &io::Error) -> io::Result<()> {
        if let Some(mut negotiator) = self.socks.take() {
            self.input.write_buf.clear();
            negotiator.send_reply(&mut self.input.write_buf, socks::error_to_reply(err));
            return self.flush_reject().await;
        }
        Ok(())
    }

    /// S2: shuttle bytes through the protocol until one side ends, then
    /// flush the survivor (S3) and close.
    async fn shuttle(&mut self) -> io::Result<()> {
        self.state = ConnState::Open;
        log::debug!(peer = %self.peer, mode = %self.mode, "Tunnel open");

        let Connection {
            mode,
            config,
            state,
            proto,
            input,
            output,
            peer,
            ..
        } = self;
        let output = output.as_mut().expect("output channel in open state");
        // In simple-server mode the accepted side carries the wire format
        // and the connected side is cleartext; everywhere else the reverse
        let wire_on_input = matches!(mode, ListenerMode::SimpleServer);

        input.set_read_enabled(true);
        output.set_read_enabled(true);

        // Bytes the client pipelined behind its CONNECT request were parked
        // in the input read buffer during negotiation; move them now.
        if !wire_on_input && !input.read_buf.is_empty() {
            proto
                .send(&mut input.read_buf, &mut output.write_buf)
                .map_err(proto_err)?;
        }

        loop {
            let input_interest =
                channel_interest(input, output.write_buf.len(), config.write_high_water);
            let output_interest =
                channel_interest(output, input.write_buf.len(), config.write_high_water);

            let (side, readiness) = tokio::select! {
                r = input.ready(input_interest.unwrap_or(Interest::READABLE)),
                    if input_interest.is_some() => (Side::Input, r),
                r = output.ready(output_interest.unwrap_or(Interest::READABLE)),
                    if output_interest.is_some() => (Side::Output, r),
                _ = tokio::time::sleep(config.idle_timeout) => {
                    log::debug!(peer = %peer, "Idle timeout");
                    let survivor = if input.wants_write() { input } else { output };
                    *state = ConnState::Flushing;
                    return Self::flush_survivor(survivor, config).await;
                }
            };

            match side {
                Side::Input => match readiness.and_then(|ready| input.service(ready)) {
                    Ok(progress) => {
                        if progress.bytes_read > 0 {
                            if wire_on_input {
                                match proto.recv(&mut input.read_buf, &mut output.write_buf) {
                                    Ok(RecvOutcome::Good) => {}
                                    Ok(RecvOutcome::SendPending) => {
                                        proto
                                            .send(&mut input.read_buf, &mut output.write_buf)
                                            .map_err(proto_err)?;
                                    }
                                    Err(e) => return Err(proto_err(e)),
                                }
                            } else {
                                proto
                                    .send(&mut input.read_buf, &mut output.write_buf)
                                    .map_err(proto_err)?;
                            }
                        }
                        if progress.eof {
                            log::debug!(peer = %peer, "EOF on input side");
                            *state = ConnState::Flushing;
                            return Self::flush_survivor(output, config).await;
                        }
                    }
                    Err(e) => {
                        log::debug!(peer = %peer, error = %e, "Error on input side");
                        *state = ConnState::Flushing;
                        return Self::flush_survivor(output, config).await;
                    }
                },
                Side::Output => match readiness.and_then(|ready| output.service(ready)) {
                    Ok(progress) => {
                        if progress.bytes_read > 0 {
                            if wire_on_input {
                                proto
                                    .send(&mut output.read_buf, &mut input.write_buf)
                                    .map_err(proto_err)?;
                            } else {
                                match proto.recv(&mut output.read_buf, &mut input.write_buf) {
                                    Ok(RecvOutcome::Good) => {}
                                    Ok(RecvOutcome::SendPending) => {
                                        // The same-turn follow-up always moves
                                        // input read bytes to the output write
                                        // side, whichever channel fired
                                        proto
                                            .send(&mut input.read_buf, &mut output.write_buf)
                                            .map_err(proto_err)?;
                                    }
                                    Err(e) => return Err(proto_err(e)),
                                }
                            }
                        }
                        if progress.eof {
                            log::debug!(peer = %peer, "EOF on output side");
                            *state = ConnState::Flushing;
                            return Self::flush_survivor(input, config).await;
                        }
                    }
                    Err(e) => {
                        log::debug!(peer = %peer, error = %e, "Error on output side");
                        *state = ConnState::Flushing;
                        return Self::flush_survivor(input, config).await;
                    }
                },
            }
        }
    }

    /// S3: the surviving side drains whatever is buffered, then sends FIN.
    /// Nothing reads during the flush, so the buffer only shrinks.
    async fn flush_survivor(survivor: &mut Channel, config: &ConnConfig) -> io::Result<()> {
        if !survivor.wants_write() {
            return Ok(());
        }
        match tokio::time::timeout(config.idle_timeout, survivor.drain_and_shutdown()).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "flush timed out",
            )),
        }
    }
}
