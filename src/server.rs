use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::config::NamingConfig;
use crate::coordinator::NamespaceCoordinator;
use crate::error::{NamingError, Result};
use crate::state::health;
use crate::state::lock_table::ResourceLockTable;
use crate::state::namespace::Namespace;
use crate::state::registry::{Registration, ServerHealth};
use crate::storage::TcpStorageChannel;
use crate::wire::records::RegistrationRecord;

/// How long an accept loop sleeps when no connection is pending.
const ACCEPT_POLL: Duration = Duration::from_millis(50);

type Coordinator = NamespaceCoordinator<TcpStorageChannel>;

/// Live sessions of one kind, counted against a ceiling.
#[derive(Debug)]
pub struct SessionSlots {
    live: AtomicUsize,
    max: usize,
}

impl SessionSlots {
    pub fn new(max: usize) -> Arc<Self> {
        Arc::new(Self {
            live: AtomicUsize::new(0),
            max,
        })
    }

    /// Claim a slot, or None when all of them are taken.
    pub fn try_claim(self: &Arc<Self>) -> Option<SessionSlot> {
        self.live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| {
                (live < self.max).then_some(live + 1)
            })
            .ok()
            .map(|_| SessionSlot {
                slots: Arc::clone(self),
            })
    }

    pub fn live(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    pub fn max(&self) -> usize {
        self.max
    }
}

/// A claimed session slot, given back when dropped.
#[derive(Debug)]
pub struct SessionSlot {
    slots: Arc<SessionSlots>,
}

impl Drop for SessionSlot {
    fn drop(&mut self) {
        self.slots.live.fetch_sub(1, Ordering::AcqRel);
    }
}

/// A naming server with both listeners bound but not yet serving.
pub struct NamingServer {
    config: NamingConfig,
    coordinator: Arc<Coordinator>,
    client_listener: TcpListener,
    storage_listener: TcpListener,
}

impl NamingServer {
    pub fn bind(config: NamingConfig) -> Result<Self> {
        config.validate()?;
        let namespace = Arc::new(Namespace::new(
            config.cache_capacity,
            config.max_storage_servers,
        )?);
        let locks = Arc::new(ResourceLockTable::new());
        let storage = TcpStorageChannel::new(config.storage_timeout());
        let coordinator = Arc::new(NamespaceCoordinator::new(namespace, locks, storage));

        let client_listener = TcpListener::bind(SocketAddr::new(config.ip, config.client_port))?;
        let storage_listener = TcpListener::bind(SocketAddr::new(config.ip, config.storage_port))?;
        client_listener.set_nonblocking(true)?;
        storage_listener.set_nonblocking(true)?;

        Ok(Self {
            config,
            coordinator,
            client_listener,
            storage_listener,
        })
    }

    pub fn client_addr(&self) -> Result<SocketAddr> {
        Ok(self.client_listener.local_addr()?)
    }

    pub fn storage_addr(&self) -> Result<SocketAddr> {
        Ok(self.storage_listener.local_addr()?)
    }

    pub fn namespace(&self) -> Arc<Namespace> {
        Arc::clone(self.coordinator.namespace())
    }

    pub fn locks(&self) -> Arc<ResourceLockTable> {
        Arc::clone(self.coordinator.locks())
    }

    /// Start the accept loops and the health thread.
    pub fn spawn(self, shutdown: Arc<AtomicBool>) -> Result<ServerHandle> {
        let client_addr = self.client_addr()?;
        let storage_addr = self.storage_addr()?;
        let namespace = self.namespace();
        let client_slots = SessionSlots::new(self.config.max_clients);
        let mut threads = Vec::new();

        let client_shutdown = Arc::clone(&shutdown);
        let client_listener = self.client_listener;
        let coordinator = Arc::clone(&self.coordinator);
        let accept_slots = Arc::clone(&client_slots);
        threads.push(
            std::thread::Builder::new()
                .name("namekeeper-client-accept".to_string())
                .spawn(move || {
                    accept_clients(client_listener, coordinator, accept_slots, client_shutdown)
                })?,
        );

        let storage_shutdown = Arc::clone(&shutdown);
        let storage_listener = self.storage_listener;
        let storage_namespace = Arc::clone(&namespace);
        let storage_slots = SessionSlots::new(self.config.max_storage_servers);
        threads.push(
            std::thread::Builder::new()
                .name("namekeeper-storage-accept".to_string())
                .spawn(move || {
                    accept_storage(
                        storage_listener,
                        storage_namespace,
                        storage_slots,
                        storage_shutdown,
                    )
                })?,
        );

        threads.push(health::start_health_thread(
            Arc::clone(&namespace),
            self.config.health_interval_secs,
            Arc::clone(&shutdown),
        )?);

        info!(
            "Naming server listening: clients on {}, storage servers on {}",
            client_addr, storage_addr
        );

        Ok(ServerHandle {
            client_addr,
            storage_addr,
            namespace,
            client_slots,
            shutdown,
            threads,
        })
    }
}

/// A running naming server.
pub struct ServerHandle {
    pub client_addr: SocketAddr,
    pub storage_addr: SocketAddr,
    pub namespace: Arc<Namespace>,
    client_slots: Arc<SessionSlots>,
    shutdown: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
}

impl ServerHandle {
    pub fn live_clients(&self) -> usize {
        self.client_slots.live()
    }


    /// Stop accepting connections and wait for the background threads.
    pub fn shutdown(self) {
        self.shutdown.store(true, Ordering::Relaxed);
        for thread in self.threads {
            let _ = thread.join();
        }
        info!("Naming server stopped");
    }
}

fn accept_clients(
    listener: TcpListener,
    coordinator: Arc<Coordinator>,
    slots: Arc<SessionSlots>,
    shutdown: Arc<AtomicBool>,
) {
    while !shutdown.load(Ordering::Relaxed) {
        match listener.accept() {
            Ok((stream, peer)) => {
                if let Err(e) = stream.set_nonblocking(false) {
                    warn!("Dropping client {}: {}", peer, e);
                    continue;
                }
                let Some(slot) = slots.try_claim() else {
                    refuse_client(stream, peer, slots.max());
                    continue;
                };
                info!("New client connected from {}", peer);
                let coordinator = Arc::clone(&coordinator);
                // Sessions are not joined: each blocks on its client until
                // the client hangs up, and the process exit reclaims them.
                let spawned = std::thread::Builder::new()
                    .name(format!("namekeeper-client-{}", peer))
                    .spawn(move || {
                        let _slot = slot;
                        let peer = peer.to_string();
                        if let Err(e) = coordinator.serve_session(stream, &peer) {
                            warn!("Client {} session ended: {}", peer, e);
                        }
                    });
                if let Err(e) = spawned {
                    error!("Failed to spawn client session for {}: {}", peer, e);
                }
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => std::thread::sleep(ACCEPT_POLL),
            Err(e) => {
                error!("Error accepting client connection: {}", e);
                std::thread::sleep(ACCEPT_POLL);
            }
        }
    }
    debug!("Client accept loop stopped");
}

fn refuse_client(mut stream: TcpStream, peer: SocketAddr, max: usize) {
    let error = NamingError::TooManyClients(max);
    warn!("Refusing client {}: {}", peer, error);
    let _ = stream.set_write_timeout(Some(ACCEPT_POLL));
    let _ = stream.write_all(format!("{}\n", error.client_message()).as_bytes());
}

fn accept_storage(
    listener: TcpListener,
    namespace: Arc<Namespace>,
    slots: Arc<SessionSlots>,
    shutdown: Arc<AtomicBool>,
) {
    while !shutdown.load(Ordering::Relaxed) {
        match listener.accept() {
            Ok((stream, peer)) => {
                let Some(slot) = slots.try_claim() else {
                    warn!("Refusing storage server {}: {} sessions open", peer, slots.max());
                    continue;
                };
                if let Err(e) = stream.set_nonblocking(false) {
                    warn!("Dropping storage server {}: {}", peer, e);
                    continue;
                }
                info!("New storage server connected from {}", peer);
                let namespace = Arc::clone(&namespace);
                let spawned = std::thread::Builder::new()
                    .name(format!("namekeeper-storage-{}", peer))
                    .spawn(move || {
                        let _slot = slot;
                        serve_storage(stream, peer, &namespace);
                    });
                if let Err(e) = spawned {
                    error!("Failed to spawn storage session for {}: {}", peer, e);
                }
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => std::thread::sleep(ACCEPT_POLL),
            Err(e) => {
                error!("Error accepting storage server connection: {}", e);
                std::thread::sleep(ACCEPT_POLL);
            }
        }
    }
    debug!("Storage accept loop stopped");
}

/// Register a storage server, then watch its connection until it closes.
pub fn serve_storage(mut stream: TcpStream, peer: SocketAddr, namespace: &Namespace) {
    let record = match RegistrationRecord::read_from(&mut stream) {
        Ok(record) => record,
        Err(e) => {
            warn!("Bad registration from {}: {}", peer, e);
            return;
        }
    };

    let index = match namespace.register(&record) {
        Ok(Registration::New { index, paths }) => {
            info!(
                "Registered storage server {} with IP: {}, client port: {}, peer port: {}, root: {} ({} paths)",
                index,
                record.ip,
                record.client_port,
                record.peer_port,
                record.root,
                paths.len()
            );
            index
        }
        Ok(Registration::Returned { index }) => {
            info!("Storage server {} came back from {}", index, peer);
            index
        }
        Err(e) => {
            warn!("Registration from {} rejected: {}", peer, e);
            return;
        }
    };

    let mut buf = [0u8; 1024];
    loop {
        match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(_) => continue,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!("Error receiving data from storage server {}: {}", index, e);
                break;
            }
        }
    }

    info!("Connection lost with storage server {} ({})", index, record.ip);
    namespace.set_health(index, ServerHealth::Unreachable);
}
