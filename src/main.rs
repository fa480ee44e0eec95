use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

use namekeeper::config::{Cli, NamingConfig};
use namekeeper::server::NamingServer;

/// Set from the signal handler; polled by the main thread.
static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn signal_handler(_sig: libc::c_int) {
    SHUTDOWN_REQUESTED.store(true, Ordering::Relaxed);
}

fn install_signal_handlers() {
    unsafe {
        use nix::sys::signal::{signal, SigHandler, Signal};
        signal(Signal::SIGINT, SigHandler::Handler(signal_handler)).ok();
        signal(Signal::SIGTERM, SigHandler::Handler(signal_handler)).ok();
    }
}

fn main() {
    let cli = Cli::parse();

    let config = NamingConfig::try_from(cli.command).unwrap_or_else(|e| {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    });

    // Set up logging
    let log_dir = config
        .log_file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| std::path::Path::new("/tmp"));
    let log_name = config
        .log_file
        .file_name()
        .unwrap_or_else(|| std::ffi::OsStr::new("namekeeper.log"));
    let file_appender = tracing_appender::rolling::never(log_dir, log_name);
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(false),
        )
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        );
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Error: failed to set tracing subscriber: {}", e);
        std::process::exit(1);
    }

    info!(
        "namekeeper starting: {}",
        serde_json::to_string(&config).unwrap_or_default()
    );

    let server = match NamingServer::bind(config) {
        Ok(server) => server,
        Err(e) => {
            error!("Failed to bind listeners: {}", e);
            std::process::exit(1);
        }
    };

    install_signal_handlers();
    let shutdown = Arc::new(AtomicBool::new(false));
    let handle = match server.spawn(Arc::clone(&shutdown)) {
        Ok(handle) => handle,
        Err(e) => {
            error!("Failed to start naming server: {}", e);
            std::process::exit(1);
        }
    };

    while !SHUTDOWN_REQUESTED.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_millis(200));
    }

    eprintln!("namekeeper: shutting down (received signal)...");
    info!(
        "Shutting down with {} storage servers and {} indexed paths",
        handle.namespace.server_count(),
        handle.namespace.path_count()
    );
    info!(
        "Lookup cache: {}",
        serde_json::to_string(&handle.namespace.cache_stats()).unwrap_or_default()
    );
    handle.shutdown();
}
