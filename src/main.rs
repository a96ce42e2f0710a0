//! Tunnel proxy driver
//!
//! Thin shell around the engine: parse configuration, bind the listener,
//! then wait for signals. The first signal starts a graceful shutdown
//! (stop accepting, let live tunnels drain); a second one escalates to
//! barbaric and force-closes everything.

// Use mimalloc as the global allocator for better performance
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::Result;
use std::sync::Arc;

use veiltun::config::{CliArgs, ConnConfig};
use veiltun::core::{Engine, ListenerParams};
use veiltun::logger::{self, log, LogLevel};
use veiltun::obfs;
use veiltun::resolver::SystemResolver;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = CliArgs::parse_args();
    cli.validate()?;

    logger::init_logger(LogLevel::parse(&cli.log_level));

    log::info!(
        mode = %cli.mode,
        listen = %cli.listen,
        protocol = %cli.protocol,
        "Starting tunnel proxy"
    );

    let factory = obfs::factory(&cli.protocol, cli.protocol_key.as_deref())?;
    let engine = Engine::new(Arc::new(SystemResolver));

    let params = ListenerParams {
        mode: cli.mode,
        listen: cli.listen_addr()?,
        target: cli.target_addr()?,
        factory,
        config: ConnConfig::from_cli(&cli),
    };
    let bound = engine.spawn_listener(params).await?;
    log::info!(address = %bound, "Listening");

    let signal_engine = Arc::clone(&engine);
    tokio::spawn(async move {
        let mut signals_seen = 0u32;
        loop {
            wait_for_signal().await;
            signals_seen += 1;
            if signals_seen == 1 {
                log::info!("Signal received, shutting down gracefully (again to force)");
                signal_engine.free_all_listeners();
                signal_engine.start_shutdown(false);
            } else {
                log::info!("Second signal, forcing shutdown");
                signal_engine.start_shutdown(true);
            }
        }
    });

    engine.wait_shutdown().await;
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigint = signal(SignalKind::interrupt()).expect("Failed to setup SIGINT");
    let mut sigterm = signal(SignalKind::terminate()).expect("Failed to setup SIGTERM");

    tokio::select! {
        _ = sigint.recv() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    tokio::signal::ctrl_c().await.ok();
}
