use std::fmt;
use std::str::FromStr;

use crate::error::{NamingError, Result};

/// Marker a client sends back when its WRITE is completing asynchronously on
/// the storage server.
pub const ASYNC_WRITE_MARKER: &str = "Asynchronously writing data to file";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Read,
    Write,
    Stream,
    GetInfo,
    Delete,
    Create,
    Copy,
    List,
    Quit,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Read => "READ",
            Operation::Write => "WRITE",
            Operation::Stream => "STREAM",
            Operation::GetInfo => "GET_INFO",
            Operation::Delete => "DELETE",
            Operation::Create => "CREATE",
            Operation::Copy => "COPY",
            Operation::List => "LIST",
            Operation::Quit => "QUIT",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = NamingError;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "READ" => Operation::Read,
            "WRITE" => Operation::Write,
            "STREAM" => Operation::Stream,
            "GET_INFO" => Operation::GetInfo,
            "DELETE" => Operation::Delete,
            "CREATE" => Operation::Create,
            "COPY" => Operation::Copy,
            "LIST" => Operation::List,
            "QUIT" => Operation::Quit,
            other => return Err(NamingError::InvalidOperation(other.to_string())),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
}

impl EntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryKind::File => "file",
            EntryKind::Directory => "dir",
        }
    }
}

impl FromStr for EntryKind {
    type Err = NamingError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "file" | "f" | "1" => Ok(EntryKind::File),
            "dir" | "directory" | "d" | "0" => Ok(EntryKind::Directory),
            other => Err(NamingError::Protocol(format!("unknown entry kind {:?}", other))),
        }
    }
}

/// One parsed line from a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientCommand {
    Read { path: String },
    /// `data` is forwarded untouched; the naming server never interprets it.
    Write { path: String, data: String },
    Stream { path: String },
    GetInfo { path: String },
    Delete { path: String },
    Create { path: String, kind: EntryKind },
    Copy { source: String, dest: String },
    List,
    Quit,
}

impl ClientCommand {
    pub fn operation(&self) -> Operation {
        match self {
            ClientCommand::Read { .. } => Operation::Read,
            ClientCommand::Write { .. } => Operation::Write,
            ClientCommand::Stream { .. } => Operation::Stream,
            ClientCommand::GetInfo { .. } => Operation::GetInfo,
            ClientCommand::Delete { .. } => Operation::Delete,
            ClientCommand::Create { .. } => Operation::Create,
            ClientCommand::Copy { .. } => Operation::Copy,
            ClientCommand::List => Operation::List,
            ClientCommand::Quit => Operation::Quit,
        }
    }

    /// Parse `OPERATION path [path_or_data]`. Blank lines yield `None`.
    pub fn parse(line: &str) -> Result<Option<Self>> {
        let line = line.trim_end_matches(['\r', '\n']);
        let trimmed = line.trim_start();
        let Some((verb, rest)) = split_token(trimmed) else {
            return Ok(None);
        };
        let operation: Operation = verb.parse()?;

        let target = split_token(rest);
        let required = || target.ok_or(NamingError::PathRequired);

        let command = match operation {
            Operation::List => ClientCommand::List,
            Operation::Quit => ClientCommand::Quit,
            Operation::Read => ClientCommand::Read {
                path: required()?.0.to_string(),
            },
            Operation::Write => {
                let (path, data) = required()?;
                ClientCommand::Write {
                    path: path.to_string(),
                    data: data.trim_start().to_string(),
                }
            }
            Operation::Stream => ClientCommand::Stream {
                path: required()?.0.to_string(),
            },
            Operation::GetInfo => ClientCommand::GetInfo {
                path: required()?.0.to_string(),
            },
            Operation::Delete => ClientCommand::Delete {
                path: required()?.0.to_string(),
            },
            Operation::Create => {
                let (path, rest) = required()?;
                let kind = match split_token(rest) {
                    Some((kind, _)) => kind.parse()?,
                    None if path.ends_with('/') && path.len() > 1 => EntryKind::Directory,
                    None => EntryKind::File,
                };
                let path = if path.len() > 1 {
                    path.trim_end_matches('/')
                } else {
                    path
                };
                ClientCommand::Create {
                    path: path.to_string(),
                    kind,
                }
            }
            Operation::Copy => {
                let (source, rest) = required()?;
                let (dest, _) = split_token(rest).ok_or(NamingError::SourceAndDestRequired)?;
                ClientCommand::Copy {
                    source: source.to_string(),
                    dest: dest.to_string(),
                }
            }
        };
        Ok(Some(command))
    }
}

/// Split off the first whitespace-delimited token.
fn split_token(s: &str) -> Option<(&str, &str)> {
    let s = s.trim_start();
    if s.is_empty() {
        return None;
    }
    match s.find(char::is_whitespace) {
        Some(at) => Some((&s[..at], &s[at..])),
        None => Some((s, "")),
    }
}
