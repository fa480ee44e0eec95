//! Fixed-layout records exchanged with clients and storage servers.
//!
//! Text fields are NUL padded to their width; integers are big-endian.

use std::io::{Read, Write};
use std::net::IpAddr;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{NamingError, Result};
use crate::state::registry::ServerEndpoint;

pub const IP_WIDTH: usize = 16;
pub const OPERATION_WIDTH: usize = 32;
pub const PATH_WIDTH: usize = 256;
pub const PAYLOAD_WIDTH: usize = 1024;
pub const ACK_MAX: usize = 1024;

pub const RESOLUTION_RECORD_LEN: usize = IP_WIDTH + 4 + 4;
pub const STORAGE_REQUEST_LEN: usize = OPERATION_WIDTH + PATH_WIDTH * 2 + PAYLOAD_WIDTH;

/// Upper bound on the variable sections of a registration record.
const MAX_REGISTRATION_SECTION: usize = 16 * 1024 * 1024;

fn put_fixed(buf: &mut BytesMut, value: &str, width: usize, field: &str) -> Result<()> {
    let bytes = value.as_bytes();
    if bytes.len() > width {
        return Err(NamingError::Protocol(format!(
            "{} is {} bytes, limit is {}",
            field,
            bytes.len(),
            width
        )));
    }
    buf.put_slice(bytes);
    buf.put_bytes(0, width - bytes.len());
    Ok(())
}

fn take_fixed(buf: &mut &[u8], width: usize) -> Result<String> {
    let field = &buf[..width];
    let end = field.iter().position(|b| *b == 0).unwrap_or(width);
    let value = std::str::from_utf8(&field[..end])
        .map_err(|e| NamingError::Protocol(format!("field is not UTF-8: {}", e)))?
        .to_string();
    buf.advance(width);
    Ok(value)
}

fn parse_ip(text: &str) -> Result<IpAddr> {
    text.parse()
        .map_err(|_| NamingError::Protocol(format!("invalid ip address {:?}", text)))
}

/// Reply to READ / WRITE / STREAM / GET_INFO telling the client where to go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolutionRecord {
    pub ip: Option<IpAddr>,
    pub port: i32,
    /// -1 when the path does not resolve to a file.
    pub server_index: i32,
}

impl ResolutionRecord {
    pub fn found(endpoint: &ServerEndpoint) -> Self {
        Self {
            ip: Some(endpoint.ip),
            port: i32::from(endpoint.client_port),
            server_index: i32::try_from(endpoint.index).unwrap_or(i32::MAX),
        }
    }

    pub fn not_found() -> Self {
        Self {
            ip: None,
            port: -1,
            server_index: -1,
        }
    }

    pub fn is_found(&self) -> bool {
        self.server_index >= 0
    }

    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(RESOLUTION_RECORD_LEN);
        let ip = self.ip.map(|ip| ip.to_string()).unwrap_or_default();
        put_fixed(&mut buf, &ip, IP_WIDTH, "ip")?;
        buf.put_i32(self.port);
        buf.put_i32(self.server_index);
        Ok(buf.freeze())
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_all(&self.encode()?)?;
        w.flush()?;
        Ok(())
    }

    pub fn read_from<R: Read>(r: &mut R) -> Result<Self> {
        let mut raw = [0u8; RESOLUTION_RECORD_LEN];
        r.read_exact(&mut raw)?;
        let mut buf = &raw[..];
        let ip = take_fixed(&mut buf, IP_WIDTH)?;
        let ip = if ip.is_empty() {
            None
        } else {
            Some(parse_ip(&ip)?)
        };
        Ok(Self {
            ip,
            port: buf.get_i32(),
            server_index: buf.get_i32(),
        })
    }
}

/// Command forwarded from the naming server to a storage server's peer port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageRequest {
    pub operation: String,
    pub source_path: String,
    pub dest_path: String,
    pub payload: String,
}

impl StorageRequest {
    pub const DELETE: &'static str = "DELETE";
    pub const CREATE: &'static str = "CREATE";
    pub const COPY: &'static str = "COPY";
    pub const ASYNC_STATUS: &'static str = "ASYNC_STATUS";
    /// Reachability check; storage servers may ignore it.
    pub const PING: &'static str = "PING";

    pub fn delete(path: &str) -> Self {
        Self::new(Self::DELETE, path, "", "")
    }

    pub fn create(path: &str, kind: &str) -> Self {
        Self::new(Self::CREATE, path, "", kind)
    }

    pub fn copy(source: &str, dest: &str) -> Self {
        Self::new(Self::COPY, source, dest, "")
    }

    pub fn async_status(path: &str) -> Self {
        Self::new(Self::ASYNC_STATUS, path, "", "")
    }

    pub fn ping() -> Self {
        Self::new(Self::PING, "", "", "")
    }

    fn new(operation: &str, source: &str, dest: &str, payload: &str) -> Self {
        Self {
            operation: operation.to_string(),
            source_path: source.to_string(),
            dest_path: dest.to_string(),
            payload: payload.to_string(),
        }
    }

    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(STORAGE_REQUEST_LEN);
        put_fixed(&mut buf, &self.operation, OPERATION_WIDTH, "operation")?;
        put_fixed(&mut buf, &self.source_path, PATH_WIDTH, "source path")?;
        put_fixed(&mut buf, &self.dest_path, PATH_WIDTH, "destination path")?;
        put_fixed(&mut buf, &self.payload, PAYLOAD_WIDTH, "payload")?;
        Ok(buf.freeze())
    }

    pub fn read_from<R: Read>(r: &mut R) -> Result<Self> {
        let mut raw = vec![0u8; STORAGE_REQUEST_LEN];
        r.read_exact(&mut raw)?;
        let mut buf = &raw[..];
        Ok(Self {
            operation: take_fixed(&mut buf, OPERATION_WIDTH)?,
            source_path: take_fixed(&mut buf, PATH_WIDTH)?,
            dest_path: take_fixed(&mut buf, PATH_WIDTH)?,
            payload: take_fixed(&mut buf, PAYLOAD_WIDTH)?,
        })
    }
}

/// Sent once by a storage server when it joins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationRecord {
    pub ip: IpAddr,
    pub client_port: u16,
    pub peer_port: u16,
    /// Directory the storage server exports.
    pub root: String,
    /// Hosted paths separated by newlines, tabs or commas.
    pub raw_paths: String,
}

impl RegistrationRecord {
    /// Hosted paths with delimiters normalized and empty items dropped.
    pub fn paths(&self) -> Vec<String> {
        normalize_delimiters(&self.raw_paths)
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .collect()
    }

    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(
            IP_WIDTH + 16 + self.root.len() + self.raw_paths.len(),
        );
        put_fixed(&mut buf, &self.ip.to_string(), IP_WIDTH, "ip")?;
        buf.put_u32(u32::from(self.client_port));
        buf.put_u32(u32::from(self.peer_port));
        for section in [&self.root, &self.raw_paths] {
            let len = u32::try_from(section.len())
                .map_err(|_| NamingError::Protocol("registration section too large".to_string()))?;
            buf.put_u32(len);
            buf.put_slice(section.as_bytes());
        }
        Ok(buf.freeze())
    }

    pub fn read_from<R: Read>(r: &mut R) -> Result<Self> {
        let mut header = [0u8; IP_WIDTH + 8];
        r.read_exact(&mut header)?;
        let mut buf = &header[..];
        let ip = parse_ip(&take_fixed(&mut buf, IP_WIDTH)?)?;
        let client_port = port_from(buf.get_u32())?;
        let peer_port = port_from(buf.get_u32())?;
        let root = read_section(r)?;
        let raw_paths = read_section(r)?;
        Ok(Self {
            ip,
            client_port,
            peer_port,
            root,
            raw_paths,
        })
    }
}

fn port_from(value: u32) -> Result<u16> {
    u16::try_from(value).map_err(|_| NamingError::Protocol(format!("invalid port {}", value)))
}

fn read_section<R: Read>(r: &mut R) -> Result<String> {
    let mut len = [0u8; 4];
    r.read_exact(&mut len)?;
    let len = u32::from_be_bytes(len) as usize;
    if len > MAX_REGISTRATION_SECTION {
        return Err(NamingError::Protocol(format!(
            "registration section of {} bytes exceeds limit",
            len
        )));
    }
    let mut data = vec![0u8; len];
    r.read_exact(&mut data)?;
    String::from_utf8(data)
        .map_err(|e| NamingError::Protocol(format!("registration section is not UTF-8: {}", e)))
}

/// Collapse runs of newline / tab delimiters into single commas.
pub fn normalize_delimiters(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut in_run = false;
    for c in raw.chars() {
        if c == '\n' || c == '\t' || c == '\r' {
            if !in_run {
                out.push(',');
            }
            in_run = true;
        } else {
            out.push(c);
            in_run = false;
        }
    }
    out
}

/// Read one storage-server acknowledgment. An empty read means the server
/// went away without answering.
pub fn read_ack<R: Read>(r: &mut R) -> Result<Option<String>> {
    let mut buf = [0u8; ACK_MAX];
    let n = r.read(&mut buf)?;
    if n == 0 {
        return Ok(None);
    }
    let end = buf[..n].iter().position(|b| *b == 0).unwrap_or(n);
    Ok(Some(
        String::from_utf8_lossy(&buf[..end]).trim_end().to_string(),
    ))
}

pub fn is_success_ack(ack: &str) -> bool {
    ack.to_ascii_lowercase().contains("success")
}
