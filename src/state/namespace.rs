use parking_lot::Mutex;
use tracing::{debug, info};

use super::lookup_cache::{CacheStats, LookupCache};
use super::path_index::{PathIndex, Resolution};
use super::registry::{
    check_path_len, Registration, Registry, ServerEndpoint, ServerHealth, ServerListing,
};
use super::ServerIndex;
use crate::error::{NamingError, Result};
use crate::wire::records::RegistrationRecord;

struct NamespaceState {
    index: PathIndex,
    cache: LookupCache,
    registry: Registry,
}

impl NamespaceState {
    fn resolve(&mut self, path: &str) -> Resolution {
        if let Some(server) = self.cache.get(path) {
            debug!("Cache hit for {} -> server {}", path, server);
            return Resolution::Found(server);
        }
        let resolution = self.index.search(path);
        if let Resolution::Found(server) = resolution {
            self.cache.put(path, server);
        }
        debug!("Cache miss for {} -> {:?}", path, resolution);
        resolution
    }
}

/// The authoritative namespace: path index, lookup cache and storage-server
/// registry behind one lock. Every method is atomic with respect to the
/// others, so the cache can never observe a half-applied mutation.
pub struct Namespace {
    state: Mutex<NamespaceState>,
}

impl Namespace {
    pub fn new(cache_capacity: usize, max_servers: usize) -> Result<Self> {
        Ok(Self {
            state: Mutex::new(NamespaceState {
                index: PathIndex::new(),
                cache: LookupCache::new(cache_capacity)?,
                registry: Registry::new(max_servers),
            }),
        })
    }

    /// Resolve through the cache first, then the index. Only registered files
    /// are cached.
    pub fn resolve(&self, path: &str) -> Resolution {
        self.state.lock().resolve(path)
    }

    /// The server responsible for `path`: its owner if it is a registered file,
    /// or the server holding the first registered path below it.
    pub fn owner_of(&self, path: &str) -> Option<ServerIndex> {
        let mut state = self.state.lock();
        match state.resolve(path) {
            Resolution::Found(server) => Some(server),
            Resolution::DirectoryPrefix => state.registry.owner_of_subtree(path),
            Resolution::NotFound => None,
        }
    }

    /// Where a new entry at `path` should live: with its nearest registered
    /// ancestor directory, else on the first active server.
    pub fn placement_for(&self, path: &str) -> Option<ServerIndex> {
        let state = self.state.lock();
        let mut dir = path;
        while let Some(at) = dir.rfind('/') {
            dir = &dir[..at];
            if dir.is_empty() {
                break;
            }
            match state.index.search(dir) {
                Resolution::Found(server) => return Some(server),
                Resolution::DirectoryPrefix => {
                    if let Some(server) = state.registry.owner_of_subtree(dir) {
                        return Some(server);
                    }
                }
                Resolution::NotFound => {}
            }
        }
        state.registry.first_active()
    }

    pub fn register(&self, record: &RegistrationRecord) -> Result<Registration> {
        let mut state = self.state.lock();
        let registration = state.registry.register(record)?;
        if let Registration::New { index, paths } = &registration {
            for path in paths {
                state.index.insert(path, *index);
                // A stale hint for a re-registered path must not survive.
                state.cache.delete(path);
            }
            info!(
                "Indexed {} paths for storage server {} ({})",
                paths.len(),
                index,
                record.root
            );
        }
        Ok(registration)
    }

    /// Record a successful CREATE. Fails if the path appeared in the meantime.
    pub fn apply_create(&self, server: ServerIndex, path: &str) -> Result<()> {
        check_path_len(path)?;
        let mut state = self.state.lock();
        if state.index.search(path) != Resolution::NotFound {
            return Err(NamingError::AlreadyExists(path.to_string()));
        }
        if state.registry.get(server).is_none() {
            return Err(NamingError::PathNotFound(format!("server {}", server)));
        }
        state.index.insert(path, server);
        state.registry.add_path(server, path);
        state.cache.delete(path);
        state.cache.put(path, server);
        info!("Inserted {} for server {}", path, server);
        Ok(())
    }

    /// Record a successful DELETE of `path` and everything registered below it.
    pub fn apply_delete(&self, server: ServerIndex, path: &str) -> Vec<String> {
        let mut state = self.state.lock();
        let mut removed = state.registry.remove_paths_under(server, path);
        for p in state.index.paths_under(path) {
            if !removed.contains(&p) && state.index.search(&p) == Resolution::Found(server) {
                removed.push(p);
            }
        }
        for p in &removed {
            state.index.delete(p);
            state.cache.delete(p);
        }
        state.cache.delete(path);
        info!("Removed {} paths under {} from server {}", removed.len(), path, server);
        removed
    }

    pub fn invalidate(&self, path: &str) {
        self.state.lock().cache.delete(path);
    }

    pub fn endpoint(&self, server: ServerIndex) -> Option<ServerEndpoint> {
        self.state.lock().registry.get(server).map(|e| e.endpoint())
    }

    pub fn health(&self, server: ServerIndex) -> Option<ServerHealth> {
        self.state.lock().registry.get(server).map(|e| e.health)
    }

    /// Shortest path ever registered on `server`; shorter deletes are refused.
    pub fn delete_watermark(&self, server: ServerIndex) -> Option<usize> {
        self.state.lock().registry.get(server).map(|e| e.min_path_len)
    }

    pub fn set_health(&self, server: ServerIndex, health: ServerHealth) {
        let previous = self.state.lock().registry.set_health(server, health);
        if let Some(previous) = previous {
            if previous != health {
                info!("Storage server {} is now {}", server, health);
            }
        }
    }

    pub fn unreachable_servers(&self) -> Vec<ServerEndpoint> {
        self.state.lock().registry.unreachable()
    }

    pub fn list(&self) -> Vec<ServerListing> {
        self.state.lock().registry.listing()
    }

    pub fn server_count(&self) -> usize {
        self.state.lock().registry.len()
    }

    pub fn path_count(&self) -> usize {
        self.state.lock().index.len()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.state.lock().cache.stats()
    }

    /// Cached paths, most recently used first.
    pub fn cached_paths(&self) -> Vec<(String, ServerIndex)> {
        self.state.lock().cache.entries()
    }
}
