use std::io::Write;
use std::net::TcpStream;
use std::time::Duration;

use tracing::debug;

use crate::error::{NamingError, Result};
use crate::state::registry::ServerEndpoint;
use crate::wire::records::{read_ack, StorageRequest};

/// Outbound command channel to storage servers.
pub trait StorageChannel: Send + Sync {
    /// Deliver `request` to the server's peer port and wait for its
    /// acknowledgment text.
    fn forward(&self, endpoint: &ServerEndpoint, request: &StorageRequest) -> Result<String>;
}

/// Opens a fresh connection per request, as storage servers expect.
#[derive(Debug, Clone, Default)]
pub struct TcpStorageChannel {
    ack_timeout: Option<Duration>,
}

impl TcpStorageChannel {
    pub fn new(ack_timeout: Option<Duration>) -> Self {
        Self { ack_timeout }
    }
}

impl StorageChannel for TcpStorageChannel {
    fn forward(&self, endpoint: &ServerEndpoint, request: &StorageRequest) -> Result<String> {
        let addr = endpoint.peer_addr();
        let encoded = request.encode()?;
        let mut stream =
            TcpStream::connect(addr).map_err(|source| NamingError::ConnectFailure {
                addr: addr.to_string(),
                source,
            })?;
        stream.set_read_timeout(self.ack_timeout)?;
        stream.write_all(&encoded)?;
        stream.flush()?;
        debug!(
            "Forwarded {} {} to storage server {} at {}",
            request.operation, request.source_path, endpoint.index, addr
        );

        match read_ack(&mut stream) {
            Ok(Some(ack)) => Ok(ack),
            Ok(None) => Err(NamingError::NoAcknowledgment(addr.to_string())),
            Err(e) => {
                debug!("Reading acknowledgment from {} failed: {}", addr, e);
                Err(NamingError::NoAcknowledgment(addr.to_string()))
            }
        }
    }
}
