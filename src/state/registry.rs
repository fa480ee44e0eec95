use std::collections::BTreeSet;
use std::net::{IpAddr, SocketAddr};

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::path_index::is_within;
use super::ServerIndex;
use crate::error::{NamingError, Result};
use crate::wire::records::{RegistrationRecord, PATH_WIDTH};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerHealth {
    Active,
    Unreachable,
}

impl std::fmt::Display for ServerHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerHealth::Active => f.write_str("active"),
            ServerHealth::Unreachable => f.write_str("unreachable"),
        }
    }
}

/// Where to reach a storage server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerEndpoint {
    pub index: ServerIndex,
    pub ip: IpAddr,
    /// Port clients talk to directly for reads and writes.
    pub client_port: u16,
    /// Port the naming server forwards commands to.
    pub peer_port: u16,
}

impl ServerEndpoint {
    pub fn peer_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.peer_port)
    }
}

#[derive(Debug, Clone)]
pub struct StorageServerEntry {
    pub index: ServerIndex,
    pub ip: IpAddr,
    pub client_port: u16,
    pub peer_port: u16,
    pub root: String,
    pub paths: BTreeSet<String>,
    /// Length of the shortest path ever registered on this server.
    pub min_path_len: usize,
    pub health: ServerHealth,
    pub registered_at: DateTime<Utc>,
    pub last_change: DateTime<Utc>,
}

impl StorageServerEntry {
    pub fn endpoint(&self) -> ServerEndpoint {
        ServerEndpoint {
            index: self.index,
            ip: self.ip,
            client_port: self.client_port,
            peer_port: self.peer_port,
        }
    }

    fn note_path_len(&mut self, path: &str) {
        self.min_path_len = self.min_path_len.min(path.len());
    }
}

/// One line of a LIST reply.
#[derive(Debug, Clone, Serialize)]
pub struct ServerListing {
    pub index: ServerIndex,
    pub address: String,
    pub health: ServerHealth,
    pub paths: Vec<String>,
    pub registered_at: DateTime<Utc>,
    pub last_change: DateTime<Utc>,
}

impl ServerListing {
    pub fn render(&self) -> String {
        let paths = if self.paths.is_empty() {
            "No paths available.".to_string()
        } else {
            self.paths.join(",")
        };
        format!("ss_index {} ({}): {}", self.index, self.health, paths)
    }
}

/// Outcome of a registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Registration {
    /// A new server; its paths still need indexing.
    New {
        index: ServerIndex,
        paths: Vec<String>,
    },
    /// A known server reconnected with the same path set.
    Returned { index: ServerIndex },
}

impl Registration {
    pub fn index(&self) -> ServerIndex {
        match self {
            Registration::New { index, .. } | Registration::Returned { index } => *index,
        }
    }
}

/// Paths that cannot fit a storage request are never indexed.
pub fn check_path_len(path: &str) -> Result<()> {
    if path.len() > PATH_WIDTH {
        return Err(NamingError::Protocol(format!(
            "path of {} bytes exceeds the {} byte limit",
            path.len(),
            PATH_WIDTH
        )));
    }
    Ok(())
}

/// Append-only table of storage servers. Indices are stable for the lifetime
/// of the process.
#[derive(Debug)]
pub struct Registry {
    servers: Vec<StorageServerEntry>,
    max_servers: usize,
}

impl Registry {
    pub fn new(max_servers: usize) -> Self {
        Self {
            servers: Vec::new(),
            max_servers,
        }
    }

    pub fn register(&mut self, record: &RegistrationRecord) -> Result<Registration> {
        let paths: BTreeSet<String> = record.paths().into_iter().collect();
        for path in &paths {
            check_path_len(path)?;
        }
        let now = Utc::now();

        if let Some(existing) = self
            .servers
            .iter_mut()
            .find(|s| !paths.is_empty() && s.paths == paths)
        {
            existing.ip = record.ip;
            existing.client_port = record.client_port;
            existing.peer_port = record.peer_port;
            existing.health = ServerHealth::Active;
            existing.last_change = now;
            return Ok(Registration::Returned {
                index: existing.index,
            });
        }

        if self.servers.len() >= self.max_servers {
            return Err(NamingError::RegistryFull(self.max_servers));
        }

        let index = self.servers.len();
        let min_path_len = paths.iter().map(String::len).min().unwrap_or(usize::MAX);
        let listed = paths.iter().cloned().collect();
        self.servers.push(StorageServerEntry {
            index,
            ip: record.ip,
            client_port: record.client_port,
            peer_port: record.peer_port,
            root: record.root.clone(),
            paths,
            min_path_len,
            health: ServerHealth::Active,
            registered_at: now,
            last_change: now,
        });
        Ok(Registration::New {
            index,
            paths: listed,
        })
    }

    pub fn get(&self, index: ServerIndex) -> Option<&StorageServerEntry> {
        self.servers.get(index)
    }

    pub fn add_path(&mut self, index: ServerIndex, path: &str) -> bool {
        match self.servers.get_mut(index) {
            Some(entry) => {
                entry.note_path_len(path);
                entry.last_change = Utc::now();
                entry.paths.insert(path.to_string())
            }
            None => false,
        }
    }

    /// Drop `path` and everything registered below it from one server.
    pub fn remove_paths_under(&mut self, index: ServerIndex, path: &str) -> Vec<String> {
        let Some(entry) = self.servers.get_mut(index) else {
            return Vec::new();
        };
        let removed: Vec<String> = entry
            .paths
            .iter()
            .filter(|p| is_within(p, path))
            .cloned()
            .collect();
        for p in &removed {
            entry.paths.remove(p);
        }
        if !removed.is_empty() {
            entry.last_change = Utc::now();
        }
        removed
    }

    /// First server holding a registered path at or below `dir`.
    pub fn owner_of_subtree(&self, dir: &str) -> Option<ServerIndex> {
        self.servers
            .iter()
            .find(|s| s.paths.iter().any(|p| is_within(p, dir)))
            .map(|s| s.index)
    }

    pub fn first_active(&self) -> Option<ServerIndex> {
        self.servers
            .iter()
            .find(|s| s.health == ServerHealth::Active)
            .map(|s| s.index)
    }

    /// Returns the previous health, or None for an unknown index.
    pub fn set_health(&mut self, index: ServerIndex, health: ServerHealth) -> Option<ServerHealth> {
        let entry = self.servers.get_mut(index)?;
        let previous = entry.health;
        if previous != health {
            entry.health = health;
            entry.last_change = Utc::now();
        }
        Some(previous)
    }

    pub fn unreachable(&self) -> Vec<ServerEndpoint> {
        self.servers
            .iter()
            .filter(|s| s.health == ServerHealth::Unreachable)
            .map(StorageServerEntry::endpoint)
            .collect()
    }

    pub fn listing(&self) -> Vec<ServerListing> {
        self.servers
            .iter()
            .map(|s| ServerListing {
                index: s.index,
                address: SocketAddr::new(s.ip, s.client_port).to_string(),
                health: s.health,
                paths: s.paths.iter().cloned().collect(),
                registered_at: s.registered_at,
                last_change: s.last_change,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }
}
