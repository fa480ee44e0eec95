#![allow(dead_code)]

use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Cursor, Read, Write};
use std::net::{IpAddr, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use namekeeper::config::NamingConfig;
use namekeeper::error::{NamingError, Result};
use namekeeper::server::{NamingServer, ServerHandle};
use namekeeper::state::registry::ServerEndpoint;
use namekeeper::storage::StorageChannel;
use namekeeper::wire::records::{RegistrationRecord, ResolutionRecord, StorageRequest};

pub const LOCALHOST: [u8; 4] = [127, 0, 0, 1];

/// Poll `cond` until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    cond()
}

pub fn registration(
    client_port: u16,
    peer_port: u16,
    root: &str,
    paths: &[&str],
) -> RegistrationRecord {
    RegistrationRecord {
        ip: IpAddr::from(LOCALHOST),
        client_port,
        peer_port,
        root: root.to_string(),
        raw_paths: paths.join("\n"),
    }
}

/// A port nothing is listening on.
pub fn dead_port() -> u16 {
    let listener = TcpListener::bind(SocketAddr::from((LOCALHOST, 0))).expect("bind spare port");
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

// ---------------------------------------------------------------------------
// In-process naming server
// ---------------------------------------------------------------------------

pub struct TestServer {
    pub handle: Option<ServerHandle>,
    _log_dir: tempfile::TempDir,
}

impl TestServer {
    pub fn start() -> Self {
        Self::with_config(|_| {})
    }

    pub fn with_config(adjust: impl FnOnce(&mut NamingConfig)) -> Self {
        let log_dir = tempfile::tempdir().expect("create log dir");
        let mut config = NamingConfig::local(log_dir.path().join("namekeeper.log"));
        adjust(&mut config);
        let server = NamingServer::bind(config).expect("bind naming server");
        let handle = server
            .spawn(Arc::new(AtomicBool::new(false)))
            .expect("spawn naming server");
        Self {
            handle: Some(handle),
            _log_dir: log_dir,
        }
    }

    pub fn handle(&self) -> &ServerHandle {
        self.handle.as_ref().unwrap()
    }

    pub fn client(&self) -> NamingClient {
        NamingClient::connect(self.handle().client_addr)
    }

    /// Register a storage server and wait until the naming server has indexed it.
    pub fn register(&self, record: &RegistrationRecord) -> TcpStream {
        let before = self.handle().namespace.server_count();
        let mut stream =
            TcpStream::connect(self.handle().storage_addr).expect("connect storage port");
        stream.write_all(&record.encode().unwrap()).unwrap();
        let namespace = Arc::clone(&self.handle().namespace);
        let first = record.paths().first().cloned();
        assert!(
            wait_until(Duration::from_secs(5), || {
                namespace.server_count() > before
                    || first.as_deref().is_some_and(|p| namespace.resolve(p).exists())
            }),
            "registration was not indexed"
        );
        stream
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.shutdown();
        }
    }
}

// ---------------------------------------------------------------------------
// Client side of the naming protocol
// ---------------------------------------------------------------------------

pub struct NamingClient {
    reader: BufReader<TcpStream>,
}

impl NamingClient {
    pub fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).expect("connect client port");
        stream
            .set_read_timeout(Some(Duration::from_secs(10)))
            .unwrap();
        Self {
            reader: BufReader::new(stream),
        }
    }

    pub fn send(&mut self, line: &str) {
        let stream = self.reader.get_mut();
        stream.write_all(line.as_bytes()).unwrap();
        stream.write_all(b"\n").unwrap();
        stream.flush().unwrap();
    }

    pub fn read_line(&mut self) -> String {
        let mut line = String::new();
        self.reader.read_line(&mut line).expect("read reply line");
        line.trim_end().to_string()
    }

    pub fn read_record(&mut self) -> ResolutionRecord {
        ResolutionRecord::read_from(&mut self.reader).expect("read resolution record")
    }

    pub fn read_block(&mut self) -> String {
        let mut len = [0u8; 8];
        self.reader.read_exact(&mut len).unwrap();
        let mut text = vec![0u8; u64::from_be_bytes(len) as usize];
        self.reader.read_exact(&mut text).unwrap();
        String::from_utf8(text).unwrap()
    }
}

// ---------------------------------------------------------------------------
// Fake storage server reachable over TCP
// ---------------------------------------------------------------------------

/// Listens on a peer port and answers forwarded requests. `None` from the
/// responder closes the connection without an acknowledgment.
pub struct FakeStorageServer {
    pub peer_port: u16,
    pub requests: Arc<Mutex<Vec<StorageRequest>>>,
}

impl FakeStorageServer {
    pub fn start(
        respond: impl Fn(&StorageRequest) -> Option<String> + Send + Sync + 'static,
    ) -> Self {
        let listener =
            TcpListener::bind(SocketAddr::from((LOCALHOST, 0))).expect("bind fake storage");
        let peer_port = listener.local_addr().unwrap().port();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&requests);

        std::thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(mut stream) = stream else { continue };
                let Ok(request) = StorageRequest::read_from(&mut stream) else {
                    continue;
                };
                seen.lock().unwrap().push(request.clone());
                if let Some(ack) = respond(&request) {
                    let _ = stream.write_all(ack.as_bytes());
                }
            }
        });

        Self { peer_port, requests }
    }

    /// Acknowledges everything with `success`.
    pub fn always_succeeds() -> Self {
        Self::start(|_| Some("success".to_string()))
    }

    pub fn requests(&self) -> Vec<StorageRequest> {
        self.requests.lock().unwrap().clone()
    }
}

// ---------------------------------------------------------------------------
// In-memory doubles for driving the coordinator directly
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum FakeReply {
    Ack(String),
    Silent,
    Unreachable,
}

/// Storage channel that records requests and replies from a script.
pub struct ScriptedChannel {
    pub forwarded: Mutex<Vec<(usize, StorageRequest, Instant)>>,
    replies: Mutex<VecDeque<FakeReply>>,
    default_reply: FakeReply,
    delay: Duration,
}

impl ScriptedChannel {
    pub fn replying(reply: FakeReply) -> Self {
        Self {
            forwarded: Mutex::new(Vec::new()),
            replies: Mutex::new(VecDeque::new()),
            default_reply: reply,
            delay: Duration::ZERO,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn then(self, reply: FakeReply) -> Self {
        self.replies.lock().unwrap().push_back(reply);
        self
    }

    pub fn forwarded(&self) -> Vec<(usize, StorageRequest)> {
        self.forwarded
            .lock()
            .unwrap()
            .iter()
            .map(|(server, request, _)| (*server, request.clone()))
            .collect()
    }
}

impl StorageChannel for ScriptedChannel {
    fn forward(&self, endpoint: &ServerEndpoint, request: &StorageRequest) -> Result<String> {
        self.forwarded
            .lock()
            .unwrap()
            .push((endpoint.index, request.clone(), Instant::now()));
        std::thread::sleep(self.delay);
        let reply = self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.default_reply.clone());
        let addr = endpoint.peer_addr().to_string();
        match reply {
            FakeReply::Ack(ack) => Ok(ack),
            FakeReply::Silent => Err(NamingError::NoAcknowledgment(addr)),
            FakeReply::Unreachable => Err(NamingError::ConnectFailure {
                addr,
                source: std::io::Error::from(std::io::ErrorKind::ConnectionRefused),
            }),
        }
    }
}

/// A client connection whose input is scripted up front.
pub struct ScriptedClient {
    input: Cursor<Vec<u8>>,
    pub output: Vec<u8>,
}

impl ScriptedClient {
    pub fn new(lines: &[&str]) -> Self {
        let mut input = String::new();
        for line in lines {
            input.push_str(line);
            input.push('\n');
        }
        Self::from_bytes(input.into_bytes())
    }

    pub fn from_bytes(input: Vec<u8>) -> Self {
        Self {
            input: Cursor::new(input),
            output: Vec::new(),
        }
    }
}

impl Read for ScriptedClient {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.input.read(buf)
    }
}

impl Write for ScriptedClient {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.output.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Reads back what the naming server wrote to a scripted client.
pub struct Transcript<'a> {
    rest: &'a [u8],
}

impl<'a> Transcript<'a> {
    pub fn new(output: &'a [u8]) -> Self {
        Self { rest: output }
    }

    pub fn record(&mut self) -> ResolutionRecord {
        ResolutionRecord::read_from(&mut self.rest).expect("resolution record")
    }

    pub fn line(&mut self) -> String {
        let end = self
            .rest
            .iter()
            .position(|b| *b == b'\n')
            .expect("newline-terminated reply");
        let line = String::from_utf8(self.rest[..end].to_vec()).unwrap();
        self.rest = &self.rest[end + 1..];
        line
    }

    pub fn block(&mut self) -> String {
        let (len, rest) = self.rest.split_at(8);
        let len = u64::from_be_bytes(len.try_into().unwrap()) as usize;
        let text = String::from_utf8(rest[..len].to_vec()).unwrap();
        self.rest = &rest[len..];
        text
    }

    pub fn is_empty(&self) -> bool {
        self.rest.is_empty()
    }
}
