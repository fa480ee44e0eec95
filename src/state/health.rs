use std::io::Write;
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use super::namespace::Namespace;
use super::registry::ServerHealth;
use crate::wire::records::StorageRequest;

const PING_TIMEOUT: Duration = Duration::from_secs(2);
const TICK: Duration = Duration::from_secs(1);

/// Start a background thread that periodically pings unreachable storage
/// servers and marks them active again once a ping goes through.
pub fn start_health_thread(
    namespace: Arc<Namespace>,
    interval_secs: u64,
    shutdown: Arc<AtomicBool>,
) -> std::io::Result<std::thread::JoinHandle<()>> {
    let interval = Duration::from_secs(interval_secs);

    std::thread::Builder::new()
        .name("namekeeper-health".to_string())
        .spawn(move || {
            debug!("Health thread started, interval_secs={}", interval_secs);
            while wait_for_next_round(interval, &shutdown) {
                let recovered = ping_unreachable(&namespace);
                if recovered > 0 {
                    debug!("{} storage servers reachable again", recovered);
                }
            }
            debug!("Health thread shutting down");
        })
}

/// Sleep for `interval` in short ticks. Returns false once shutdown is requested.
fn wait_for_next_round(interval: Duration, shutdown: &AtomicBool) -> bool {
    let mut slept = Duration::ZERO;
    while slept < interval {
        if shutdown.load(Ordering::Relaxed) {
            return false;
        }
        let step = TICK.min(interval - slept);
        std::thread::sleep(step);
        slept += step;
    }
    !shutdown.load(Ordering::Relaxed)
}

/// Try each unreachable server once. Returns how many came back.
pub fn ping_unreachable(namespace: &Namespace) -> usize {
    let mut recovered = 0;
    for endpoint in namespace.unreachable_servers() {
        match ping(endpoint.peer_addr()) {
            Ok(()) => {
                namespace.set_health(endpoint.index, ServerHealth::Active);
                recovered += 1;
            }
            Err(e) => {
                debug!(
                    "Storage server {} still unreachable at {}: {}",
                    endpoint.index,
                    endpoint.peer_addr(),
                    e
                );
            }
        }
    }
    recovered
}

/// Deliver a whole PING record so the peer never sees a truncated request.
/// No acknowledgment is awaited.
fn ping(addr: SocketAddr) -> crate::error::Result<()> {
    let record = StorageRequest::ping().encode()?;
    let mut stream = TcpStream::connect_timeout(&addr, PING_TIMEOUT)?;
    stream.set_write_timeout(Some(PING_TIMEOUT))?;
    stream.write_all(&record)?;
    Ok(())
}
