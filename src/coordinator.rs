use std::io::{BufRead, BufReader, ErrorKind, Read, Write};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::{NamingError, Result};
use crate::state::lock_table::ResourceLockTable;
use crate::state::namespace::Namespace;
use crate::state::path_index::Resolution;
use crate::state::registry::{ServerEndpoint, ServerHealth};
use crate::state::ServerIndex;
use crate::storage::StorageChannel;
use crate::wire::command::{ClientCommand, EntryKind, Operation, ASYNC_WRITE_MARKER};
use crate::wire::records::{is_success_ack, ResolutionRecord, StorageRequest};

pub const ASYNC_WRITE_DONE: &str = "Async write completed";
pub const ASYNC_WRITE_NOT_DONE: &str = "Async write not completed";

/// Whether a client session continues after a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionControl {
    Continue,
    Close,
}

/// Longest command line a client may send, terminator excluded.
pub const MAX_LINE_LEN: usize = 4096;

/// One line read from a client.
#[derive(Debug)]
pub enum ClientLine {
    Text(String),
    /// Too long or not UTF-8. The rest of the line has been discarded.
    Unusable(NamingError),
}

/// Line-oriented view of one client connection.
pub struct ClientSession<C: Read + Write> {
    stream: BufReader<C>,
}

impl<C: Read + Write> ClientSession<C> {
    pub fn new(stream: C) -> Self {
        Self {
            stream: BufReader::new(stream),
        }
    }

    /// Next line's bytes and whether it overflowed `MAX_LINE_LEN`, or None
    /// once the client hung up. Bytes past the cap are consumed, not kept.
    fn read_raw(&mut self) -> Result<Option<(Vec<u8>, bool)>> {
        let mut line = Vec::new();
        let mut overflowed = false;
        let mut seen = false;
        loop {
            let available = match self.stream.fill_buf() {
                Ok(buf) => buf,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            if available.is_empty() {
                break;
            }
            seen = true;
            let (chunk, used, done) = match available.iter().position(|b| *b == b'\n') {
                Some(end) => (&available[..end], end + 1, true),
                None => (available, available.len(), false),
            };
            let room = MAX_LINE_LEN - line.len();
            if chunk.len() > room {
                overflowed = true;
                line.extend_from_slice(&chunk[..room]);
            } else {
                line.extend_from_slice(chunk);
            }
            self.stream.consume(used);
            if done {
                break;
            }
        }
        if !seen {
            return Ok(None);
        }
        while line.last() == Some(&b'\r') {
            line.pop();
        }
        Ok(Some((line, overflowed)))
    }

    /// Next line without its terminator, or None once the client hung up.
    /// Used for acknowledgments and feedback, so invalid UTF-8 is replaced.
    pub fn read_line(&mut self) -> Result<Option<String>> {
        Ok(self
            .read_raw()?
            .map(|(line, _)| String::from_utf8_lossy(&line).into_owned()))
    }

    /// Next command line, or None once the client hung up.
    pub fn read_command(&mut self) -> Result<Option<ClientLine>> {
        let Some((line, overflowed)) = self.read_raw()? else {
            return Ok(None);
        };
        if overflowed {
            return Ok(Some(ClientLine::Unusable(NamingError::InvalidLine(format!(
                "longer than {} bytes",
                MAX_LINE_LEN
            )))));
        }
        Ok(Some(match String::from_utf8(line) {
            Ok(text) => ClientLine::Text(text),
            Err(_) => ClientLine::Unusable(NamingError::InvalidLine("not valid UTF-8".into())),
        }))
    }

    pub fn send_line(&mut self, text: &str) -> Result<()> {
        let out = self.stream.get_mut();
        out.write_all(text.as_bytes())?;
        out.write_all(b"\n")?;
        out.flush()?;
        Ok(())
    }

    pub fn send_record(&mut self, record: &ResolutionRecord) -> Result<()> {
        record.write_to(self.stream.get_mut())
    }

    /// Length-prefixed text block.
    pub fn send_block(&mut self, text: &str) -> Result<()> {
        let out = self.stream.get_mut();
        out.write_all(&(text.len() as u64).to_be_bytes())?;
        out.write_all(text.as_bytes())?;
        out.flush()?;
        Ok(())
    }

    pub fn into_inner(self) -> C {
        self.stream.into_inner()
    }
}

/// Runs each client operation: resolves paths, takes the right kind of hold
/// on the owning server, talks to storage servers and applies the resulting
/// namespace changes.
///
/// Errors returned from the operation methods are failures of the client
/// connection itself; everything else is reported to the client as an
/// `ERROR:` line and the session carries on.
pub struct NamespaceCoordinator<S: StorageChannel> {
    namespace: Arc<Namespace>,
    locks: Arc<ResourceLockTable>,
    storage: S,
}

impl<S: StorageChannel> NamespaceCoordinator<S> {
    pub fn new(namespace: Arc<Namespace>, locks: Arc<ResourceLockTable>, storage: S) -> Self {
        Self {
            namespace,
            locks,
            storage,
        }
    }

    pub fn namespace(&self) -> &Arc<Namespace> {
        &self.namespace
    }

    pub fn locks(&self) -> &Arc<ResourceLockTable> {
        &self.locks
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    /// Serve commands until the client quits or disconnects.
    pub fn serve_session<C: Read + Write>(&self, client: C, peer: &str) -> Result<()> {
        let mut session = ClientSession::new(client);
        self.serve(&mut session)?;
        info!("Client {} disconnected", peer);
        Ok(())
    }

    pub fn serve<C: Read + Write>(&self, session: &mut ClientSession<C>) -> Result<()> {
        while let Some(line) = session.read_command()? {
            let control = match line {
                ClientLine::Text(text) => self.execute_line(session, &text)?,
                ClientLine::Unusable(e) => {
                    warn!("Rejected command line: {}", e);
                    session.send_line(&e.client_message())?;
                    SessionControl::Continue
                }
            };
            if control == SessionControl::Close {
                break;
            }
        }
        Ok(())
    }

    pub fn execute_line<C: Read + Write>(
        &self,
        session: &mut ClientSession<C>,
        line: &str,
    ) -> Result<SessionControl> {
        match ClientCommand::parse(line) {
            Ok(Some(command)) => {
                info!("Received command from client: {}", line);
                self.execute(session, command)
            }
            Ok(None) => Ok(SessionControl::Continue),
            Err(e) => {
                warn!("Rejected command {:?}: {}", line, e);
                session.send_line(&e.client_message())?;
                Ok(SessionControl::Continue)
            }
        }
    }

    pub fn execute<C: Read + Write>(
        &self,
        session: &mut ClientSession<C>,
        command: ClientCommand,
    ) -> Result<SessionControl> {
        match command {
            ClientCommand::Read { path } => self.read(session, &path)?,
            ClientCommand::Write { path, data } => {
                debug!("WRITE {} carries {} opaque bytes", path, data.len());
                self.exclusive(session, Operation::Write, &path)?
            }
            ClientCommand::Stream { path } => self.exclusive(session, Operation::Stream, &path)?,
            ClientCommand::GetInfo { path } => {
                self.exclusive(session, Operation::GetInfo, &path)?
            }
            ClientCommand::Delete { path } => self.delete(session, &path)?,
            ClientCommand::Create { path, kind } => self.create(session, &path, kind)?,
            ClientCommand::Copy { source, dest } => self.copy(session, &source, &dest)?,
            ClientCommand::List => self.list(session)?,
            ClientCommand::Quit => {
                let feedback = session.read_line()?.unwrap_or_default();
                info!("Client feedback: {}", feedback);
                return Ok(SessionControl::Close);
            }
        }
        Ok(SessionControl::Continue)
    }

    /// Resolve `path` to a registered file and its server's endpoint.
    fn locate_file(&self, path: &str) -> Option<ServerEndpoint> {
        match self.namespace.resolve(path) {
            Resolution::Found(server) => self.namespace.endpoint(server),
            Resolution::DirectoryPrefix | Resolution::NotFound => None,
        }
    }

    /// Tell the client the path is unknown, then wait for its acknowledgment.
    fn send_not_found<C: Read + Write>(
        &self,
        session: &mut ClientSession<C>,
        operation: Operation,
        path: &str,
    ) -> Result<()> {
        warn!("{} {}: path not found", operation, path);
        session.send_record(&ResolutionRecord::not_found())?;
        let ack = session.read_line()?.unwrap_or_default();
        debug!("{} received from client for {}", ack, operation);
        Ok(())
    }

    fn read<C: Read + Write>(&self, session: &mut ClientSession<C>, path: &str) -> Result<()> {
        let Some(endpoint) = self.locate_file(path) else {
            return self.send_not_found(session, Operation::Read, path);
        };

        let _read = self.locks.begin_read(endpoint.index);
        session.send_record(&ResolutionRecord::found(&endpoint))?;
        let ack = session.read_line()?.unwrap_or_default();
        info!("Received ack from client for READ {}: {}", path, ack);
        Ok(())
    }

    /// WRITE, STREAM and GET_INFO hold the server exclusively while the
    /// client works against it. STREAM only needs the handoff serialized.
    fn exclusive<C: Read + Write>(
        &self,
        session: &mut ClientSession<C>,
        operation: Operation,
        path: &str,
    ) -> Result<()> {
        let Some(endpoint) = self.locate_file(path) else {
            return self.send_not_found(session, operation, path);
        };

        let guard = self.locks.begin_write(endpoint.index);
        session.send_record(&ResolutionRecord::found(&endpoint))?;
        if operation == Operation::Stream {
            guard.release();
            return Ok(());
        }

        let ack = session.read_line()?.unwrap_or_default();
        info!("Received ack from client for {} {}: {}", operation, path, ack);

        if operation == Operation::Write && ack == ASYNC_WRITE_MARKER {
            let reply = match self.forward(endpoint.index, &StorageRequest::async_status(path)) {
                Ok(status) if is_success_ack(&status) => ASYNC_WRITE_DONE,
                Ok(status) => {
                    warn!("Async write of {} did not finish: {}", path, status);
                    ASYNC_WRITE_NOT_DONE
                }
                Err(e) => {
                    warn!("Async write status for {} unavailable: {}", path, e);
                    ASYNC_WRITE_NOT_DONE
                }
            };
            drop(guard);
            session.send_line(reply)?;
        }
        Ok(())
    }

    fn delete<C: Read + Write>(&self, session: &mut ClientSession<C>, path: &str) -> Result<()> {
        let Some(server) = self.namespace.owner_of(path) else {
            let error = NamingError::PathNotFound(path.to_string());
            return self.reject(session, Operation::Delete, error);
        };

        let watermark = self.namespace.delete_watermark(server).unwrap_or(0);
        if path.len() < watermark {
            return self.reject(
                session,
                Operation::Delete,
                NamingError::ProtectedPath {
                    path: path.to_string(),
                    watermark,
                },
            );
        }

        let guard = self.locks.begin_write(server);
        let outcome = self.forward(server, &StorageRequest::delete(path));
        let ack = match outcome {
            Ok(ack) => {
                if is_success_ack(&ack) {
                    let removed = self.namespace.apply_delete(server, path);
                    debug!("DELETE {} dropped {:?}", path, removed);
                }
                ack
            }
            Err(e) => {
                drop(guard);
                return self.reject(session, Operation::Delete, e);
            }
        };
        drop(guard);
        info!("ack-- {}", ack);
        session.send_line(&ack)
    }

    fn create<C: Read + Write>(
        &self,
        session: &mut ClientSession<C>,
        path: &str,
        kind: EntryKind,
    ) -> Result<()> {
        if self.namespace.resolve(path).exists() {
            let error = NamingError::AlreadyExists(path.to_string());
            return self.reject(session, Operation::Create, error);
        }
        let Some(server) = self.namespace.placement_for(path) else {
            return self.reject(session, Operation::Create, NamingError::NoStorageServer);
        };

        let ack = match self.forward(server, &StorageRequest::create(path, kind.as_str())) {
            Ok(ack) => ack,
            Err(e) => return self.reject(session, Operation::Create, e),
        };
        if is_success_ack(&ack) {
            if let Err(e) = self.namespace.apply_create(server, path) {
                warn!("CREATE {} acknowledged but not indexed: {}", path, e);
            }
        }
        info!("ack-- {}", ack);
        session.send_line(&ack)
    }

    fn copy<C: Read + Write>(
        &self,
        session: &mut ClientSession<C>,
        source: &str,
        dest: &str,
    ) -> Result<()> {
        let source_server = self.namespace.owner_of(source);
        let dest_server = self.namespace.owner_of(dest);
        let (Some(source_server), Some(dest_server)) = (source_server, dest_server) else {
            return self.reject(
                session,
                Operation::Copy,
                NamingError::SourceOrDestNotFound {
                    source_path: source.to_string(),
                    dest_path: dest.to_string(),
                },
            );
        };
        debug!("COPY {} (server {}) -> {} (server {})", source, source_server, dest, dest_server);

        let ack = match self.forward(dest_server, &StorageRequest::copy(source, dest)) {
            Ok(ack) => ack,
            Err(e) => return self.reject(session, Operation::Copy, e),
        };
        if is_success_ack(&ack) {
            self.namespace.invalidate(dest);
        }
        info!("ack-- {}", ack);
        session.send_line(&ack)
    }

    fn list<C: Read + Write>(&self, session: &mut ClientSession<C>) -> Result<()> {
        let listing = self.namespace.list();
        let mut text = String::new();
        for server in &listing {
            text.push_str(&server.render());
            text.push('\n');
        }
        info!("Listing {} storage servers", listing.len());
        debug!(
            "LIST snapshot: {}",
            serde_json::to_string(&listing).unwrap_or_default()
        );
        session.send_block(&text)
    }

    /// Send a request to a storage server, keeping its health current.
    fn forward(&self, server: ServerIndex, request: &StorageRequest) -> Result<String> {
        let endpoint = self
            .namespace
            .endpoint(server)
            .ok_or_else(|| NamingError::PathNotFound(format!("storage server {}", server)))?;
        match self.storage.forward(&endpoint, request) {
            Ok(ack) => {
                self.namespace.set_health(server, ServerHealth::Active);
                Ok(ack)
            }
            Err(e) => {
                if matches!(e, NamingError::ConnectFailure { .. }) {
                    self.namespace.set_health(server, ServerHealth::Unreachable);
                }
                Err(e)
            }
        }
    }

    fn reject<C: Read + Write>(
        &self,
        session: &mut ClientSession<C>,
        operation: Operation,
        error: NamingError,
    ) -> Result<()> {
        warn!("{} failed: {}", operation, error);
        session.send_line(&error.client_message())
    }
}
