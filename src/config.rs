use clap::{Parser, Subcommand};
use serde::Serialize;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{NamingError, Result};

#[derive(Parser, Debug)]
#[command(
    name = "namekeeper",
    about = "Naming server for a distributed file store"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the naming server
    Serve {
        /// Address both listeners bind to
        #[arg(long, default_value = "127.0.0.1")]
        ip: IpAddr,

        /// Port clients connect to
        #[arg(long, default_value_t = 4000)]
        client_port: u16,

        /// Port storage servers register on
        #[arg(long, default_value_t = 4001)]
        storage_port: u16,

        /// Log file path
        #[arg(long, default_value = "/tmp/namekeeper.log")]
        log_file: PathBuf,

        /// Number of entries kept in the path lookup cache
        #[arg(long, default_value_t = 90)]
        cache_capacity: usize,

        /// Clients connected at once; further clients are refused
        #[arg(long, default_value_t = 256)]
        max_clients: usize,

        /// Upper bound on registered storage servers
        #[arg(long, default_value_t = 500)]
        max_storage_servers: usize,

        /// Give up on a storage server acknowledgment after this many seconds
        #[arg(long)]
        storage_timeout_secs: Option<u64>,

        /// Seconds between reachability pings to unreachable storage servers
        #[arg(long, default_value_t = 30)]
        health_interval_secs: u64,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct NamingConfig {
    pub ip: IpAddr,
    pub client_port: u16,
    pub storage_port: u16,
    pub log_file: PathBuf,
    pub cache_capacity: usize,
    pub max_clients: usize,
    pub max_storage_servers: usize,
    pub storage_timeout_secs: Option<u64>,
    pub health_interval_secs: u64,
}

impl NamingConfig {
    /// Defaults suitable for an in-process server on an ephemeral port.
    pub fn local(log_file: PathBuf) -> Self {
        Self {
            ip: IpAddr::from([127, 0, 0, 1]),
            client_port: 0,
            storage_port: 0,
            log_file,
            cache_capacity: 90,
            max_clients: 16,
            max_storage_servers: 500,
            storage_timeout_secs: None,
            health_interval_secs: 30,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.cache_capacity == 0 {
            return Err(NamingError::Config(
                "cache capacity must be at least 1".to_string(),
            ));
        }
        if self.max_clients == 0 {
            return Err(NamingError::Config(
                "max clients must be at least 1".to_string(),
            ));
        }
        if self.max_storage_servers == 0 {
            return Err(NamingError::Config(
                "max storage servers must be at least 1".to_string(),
            ));
        }
        if self.health_interval_secs == 0 {
            return Err(NamingError::Config(
                "health interval must be at least one second".to_string(),
            ));
        }
        Ok(())
    }

    pub fn storage_timeout(&self) -> Option<Duration> {
        self.storage_timeout_secs.map(Duration::from_secs)
    }
}

impl TryFrom<Command> for NamingConfig {
    type Error = NamingError;

    fn try_from(command: Command) -> Result<Self> {
        let Command::Serve {
            ip,
            client_port,
            storage_port,
            log_file,
            cache_capacity,
            max_clients,
            max_storage_servers,
            storage_timeout_secs,
            health_interval_secs,
        } = command;

        let config = NamingConfig {
            ip,
            client_port,
            storage_port,
            log_file,
            cache_capacity,
            max_clients,
            max_storage_servers,
            storage_timeout_secs,
            health_interval_secs,
        };
        config.validate()?;
        Ok(config)
    }
}
