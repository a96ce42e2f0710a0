//! Listener set and lifecycle management
//!
//! An [`Engine`] is an explicit context value: it owns the listener set,
//! the live-connection registry, the shutting-down flag and the
//! finish-shutdown hook. Several engines can coexist in one process, which
//! the integration tests rely on.

use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::address::Address;
use crate::config::{ConnConfig, ListenerMode};
use crate::core::connection::Connection;
use crate::core::protocol::ProtocolFactory;
use crate::error::{Result, TunnelError};
use crate::logger::log;
use crate::resolver::Resolver;

pub type ConnectionId = u64;

/// Everything a listener needs to mint connections. Moved into
/// [`Engine::spawn_listener`]; on failure the caller gets the error and the
/// params are dropped, nothing else.
pub struct ListenerParams {
    pub mode: ListenerMode,
    pub listen: SocketAddr,
    /// Fixed downstream target; required in the simple modes
    pub target: Option<Address>,
    pub factory: Arc<dyn ProtocolFactory>,
    pub config: ConnConfig,
}

struct ListenerHandle {
    local_addr: SocketAddr,
    mode: ListenerMode,
    task: JoinHandle<()>,
}

pub struct Engine {
    resolver: Arc<dyn Resolver>,
    connections: DashMap<ConnectionId, CancellationToken>,
    next_conn_id: AtomicU64,
    shutting_down: AtomicBool,
    finished: AtomicBool,
    done_tx: watch::Sender<bool>,
    done_rx: watch::Receiver<bool>,
    listeners: Mutex<Vec<ListenerHandle>>,
}

impl Engine {
    pub fn new(resolver: Arc<dyn Resolver>) -> Arc<Self> {
        let (done_tx, done_rx) = watch::channel(false);
        Arc::new(Self {
            resolver,
            connections: DashMap::new(),
            next_conn_id: AtomicU64::new(1),
            shutting_down: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            done_tx,
            done_rx,
            listeners: Mutex::new(Vec::new()),
        })
    }

    /// Bind a listener and start accepting. Returns the bound address
    /// (useful when the params asked for port 0).
    pub async fn spawn_listener(self: &Arc<Self>, params: ListenerParams) -> Result<SocketAddr> {
        if self.is_shutting_down() {
            return Err(TunnelError::Connection(
                "engine is shutting down".to_string(),
            ));
        }

        let listener = TcpListener::bind(params.listen).await.map_err(|e| {
            log::warn!(address = %params.listen, error = %e, "Failed to bind listener");
            TunnelError::Io(e)
        })?;
        let local_addr = listener.local_addr()?;
        let mode = params.mode;

        let engine = Arc::clone(self);
        let task = tokio::spawn(async move {
            accept_loop(engine, listener, params).await;
        });

        self.listeners.lock().unwrap().push(ListenerHandle {
            local_addr,
            mode,
            task,
        });
        log::listener(&local_addr.to_string(), &mode.to_string(), "bound");
        Ok(local_addr)
    }

    /// Stop accepting and, if `barbaric`, force-close every live
    /// connection. Once the connection set is empty the finish-shutdown
    /// hook fires; [`Engine::wait_shutdown`] observes it.
    pub fn start_shutdown(&self, barbaric: bool) {
        if !self.shutting_down.swap(true, Ordering::SeqCst) {
            log::info!(barbaric = barbaric, "Shutdown started");
        }

        if barbaric {
            for entry in self.connections.iter() {
                entry.value().cancel();
            }
        }

        if self.connections.is_empty() {
            self.finish_shutdown();
        }
    }

    /// Destroy every listener, closing the accept sockets. Idempotent.
    pub fn free_all_listeners(&self) {
        let mut listeners = self.listeners.lock().unwrap();
        if listeners.is_empty() {
            return;
        }
        log::info!(count = listeners.len(), "Closing all listeners");
        for handle in listeners.drain(..) {
            handle.task.abort();
            log::listener(
                &handle.local_addr.to_string(),
                &handle.mode.to_string(),
                "closed",
            );
        }
    }

    /// Resolves once the engine has fully shut down.
    pub async fn wait_shutdown(&self) {
        let mut rx = self.done_rx.clone();
        // wait_for also inspects the current value, so a finish that
        // happened before this call still resolves
        let _ = rx.wait_for(|done| *done).await;
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Admit a new connection. Refused while shutting down.
    fn register(&self) -> Option<(ConnectionId, CancellationToken)> {
        if self.is_shutting_down() {
            return None;
        }
        let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        self.connections.insert(id, token.clone());
        // Shutdown may have raced the insert; an entry added after the
        // cancel sweep would never be told to die, so back it out.
        if self.is_shutting_down() {
            self.connections.remove(&id);
            return None;
        }
        Some((id, token))
    }

    fn unregister(&self, id: ConnectionId) {
        self.connections.remove(&id);
        if self.is_shutting_down() && self.connections.is_empty() {
            self.finish_shutdown();
        }
    }

    fn finish_shutdown(&self) {
        if self
            .finished
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            log::info!("Shutdown complete");
            let _ = self.done_tx.send(true);
        }
    }
}

async fn accept_loop(engine: Arc<Engine>, listener: TcpListener, params: ListenerParams) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                log::warn!(error = %e, "Failed to accept connection");
                continue;
            }
        };

        if engine.is_shutting_down() {
            // Refuse: the socket drops here, unregistered and unserved
            continue;
        }

        spawn_connection(&engine, stream, peer, &params);
    }
}

fn spawn_connection(engine: &Arc<Engine>, stream: TcpStream, peer: SocketAddr, params: &ListenerParams) {
    log::connection(&peer.to_string(), "accepted");

    if params.config.tcp_nodelay {
        let _ = stream.set_nodelay(true);
    }

    let proto = match params.factory.create() {
        Ok(p) => p,
        Err(e) => {
            log::warn!(peer = %peer, error = %e, "Protocol creation failed, closing connection");
            return;
        }
    };

    let Some((id, token)) = engine.register() else {
        return;
    };

    let conn = Connection::new(
        params.mode,
        stream,
        params.target.clone(),
        proto,
        Arc::clone(&engine.resolver),
        params.config,
        token,
    );

    log::debug!(
        peer = %peer,
        conn_id = id,
        live = engine.connection_count(),
        "Connection registered"
    );

    let engine = Arc::clone(engine);
    tokio::spawn(async move {
        let _guard = scopeguard::guard((), move |_| {
            engine.unregister(id);
        });
        conn.run().await;
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::obfs::NullFactory;
    use crate::resolver::SystemResolver;
    use std::time::Duration;

    fn test_engine() -> Arc<Engine> {
        Engine::new(Arc::new(SystemResolver))
    }

    fn test_params(listen: &str) -> ListenerParams {
        ListenerParams {
            mode: ListenerMode::SimpleClient,
            listen: listen.parse().unwrap(),
            target: Some(Address::IPv4([127, 0, 0, 1], 1)),
            factory: Arc::new(NullFactory),
            config: ConnConfig::default(),
        }
    }

    #[test]
    fn test_register_unregister() {
        let engine = test_engine();
        let (id1, _t1) = engine.register().unwrap();
        let (id2, _t2) = engine.register().unwrap();
        assert_ne!(id1, id2);
        assert_eq!(engine.connection_count(), 2);

        engine.unregister(id1);
        assert_eq!(engine.connection_count(), 1);
        engine.unregister(id2);
        assert_eq!(engine.connection_count(), 0);
    }

    #[test]
    fn test_no_admission_after_shutdown() {
        let engine = test_engine();
        engine.start_shutdown(false);
        assert!(engine.register().is_none());
        assert_eq!(engine.connection_count(), 0);
    }

    #[test]
    fn test_shutdown_flag_is_sticky() {
        let engine = test_engine();
        engine.start_shutdown(false);
        assert!(engine.is_shutting_down());
        engine.start_shutdown(false);
        assert!(engine.is_shutting_down());
    }

    #[tokio::test]
    async fn test_finish_waits_for_connections() {
        let engine = test_engine();
        let (id, _token) = engine.register().unwrap();

        engine.start_shutdown(false);
        // A live connection must hold the shutdown open
        let waited =
            tokio::time::timeout(Duration::from_millis(50), engine.wait_shutdown()).await;
        assert!(waited.is_err());

        engine.unregister(id);
        tokio::time::timeout(Duration::from_secs(1), engine.wait_shutdown())
            .await
            .expect("shutdown should complete once the registry is empty");
    }

    #[tokio::test]
    async fn test_shutdown_with_empty_registry_finishes_immediately() {
        let engine = test_engine();
        engine.start_shutdown(false);
        tokio::time::timeout(Duration::from_secs(1), engine.wait_shutdown())
            .await
            .expect("empty engine should finish at once");
    }

    #[tokio::test]
    async fn test_barbaric_cancels_registered_tokens() {
        let engine = test_engine();
        let (_id1, t1) = engine.register().unwrap();
        let (_id2, t2) = engine.register().unwrap();

        engine.start_shutdown(true);
        assert!(t1.is_cancelled());
        assert!(t2.is_cancelled());
    }

    #[tokio::test]
    async fn test_spawn_listener_reports_bound_addr() {
        let engine = test_engine();
        let addr = engine
            .spawn_listener(test_params("127.0.0.1:0"))
            .await
            .unwrap();
        assert_ne!(addr.port(), 0);
        engine.free_all_listeners();
    }

    #[tokio::test]
    async fn test_spawn_listener_bind_conflict() {
        let engine = test_engine();
        let addr = engine
            .spawn_listener(test_params("127.0.0.1:0"))
            .await
            .unwrap();
        // Second bind to the same port must fail and cost nothing
        let err = engine.spawn_listener(test_params(&addr.to_string())).await;
        assert!(err.is_err());
        engine.free_all_listeners();
    }

    #[tokio::test]
    async fn test_free_all_listeners_idempotent() {
        let engine = test_engine();
        engine
            .spawn_listener(test_params("127.0.0.1:0"))
            .await
            .unwrap();
        engine.free_all_listeners();
        engine.free_all_listeners();
    }

    #[tokio::test]
    async fn test_no_listener_after_free() {
        let engine = test_engine();
        let addr = engine
            .spawn_listener(test_params("127.0.0.1:0"))
            .await
            .unwrap();
        engine.free_all_listeners();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn test_spawn_listener_refused_during_shutdown() {
        let engine = test_engine();
        engine.start_shutdown(false);
        assert!(engine.spawn_listener(test_params("127.0.0.1:0")).await.is_err());
    }
}
