use std::collections::BTreeMap;

use super::ServerIndex;

/// Outcome of walking the index for a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// The path is registered and owned by this storage server.
    Found(ServerIndex),
    /// Not registered itself, but registered paths exist below it.
    DirectoryPrefix,
    NotFound,
}

impl Resolution {
    pub fn server(self) -> Option<ServerIndex> {
        match self {
            Resolution::Found(index) => Some(index),
            _ => None,
        }
    }

    pub fn exists(self) -> bool {
        !matches!(self, Resolution::NotFound)
    }
}

#[derive(Debug, Default)]
struct TrieNode {
    children: BTreeMap<u8, TrieNode>,
    server: Option<ServerIndex>,
}

impl TrieNode {
    fn count(&self) -> usize {
        let mut total = 0;
        let mut stack = vec![self];
        while let Some(node) = stack.pop() {
            total += 1;
            stack.extend(node.children.values());
        }
        total
    }

    /// Registered paths at or below this node, in byte order. `prefix` holds
    /// the bytes leading to this node.
    fn collect(&self, prefix: &[u8], out: &mut Vec<String>) {
        let mut path = prefix.to_vec();
        // (node, length of `path` above the node, byte leading into it)
        let mut stack: Vec<(&TrieNode, usize, Option<u8>)> = vec![(self, path.len(), None)];
        while let Some((node, depth, byte)) = stack.pop() {
            path.truncate(depth);
            if let Some(byte) = byte {
                path.push(byte);
            }
            if node.server.is_some() {
                out.push(String::from_utf8_lossy(&path).into_owned());
            }
            for (byte, child) in node.children.iter().rev() {
                stack.push((child, path.len(), Some(*byte)));
            }
        }
    }
}

// Long paths make deep chains; tear them down without recursing.
impl Drop for TrieNode {
    fn drop(&mut self) {
        let mut pending: Vec<TrieNode> = std::mem::take(&mut self.children)
            .into_values()
            .collect();
        while let Some(mut node) = pending.pop() {
            pending.extend(std::mem::take(&mut node.children).into_values());
        }
    }
}

/// Prefix tree from path bytes to the storage server that owns the path.
///
/// Each node owns its children outright; a node with a server index is a
/// registered path, a node without one only exists while it has descendants.
#[derive(Debug, Default)]
pub struct PathIndex {
    root: TrieNode,
    registered: usize,
}

impl PathIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `path` as owned by `server`. Re-inserting overwrites the owner.
    pub fn insert(&mut self, path: &str, server: ServerIndex) {
        let mut node = &mut self.root;
        for byte in path.bytes() {
            node = node.children.entry(byte).or_default();
        }
        if node.server.replace(server).is_none() {
            self.registered += 1;
        }
    }

    pub fn search(&self, path: &str) -> Resolution {
        let mut node = &self.root;
        for byte in path.bytes() {
            match node.children.get(&byte) {
                Some(child) => node = child,
                None => return Resolution::NotFound,
            }
        }
        match node.server {
            Some(server) => Resolution::Found(server),
            None if !node.children.is_empty() => Resolution::DirectoryPrefix,
            None => Resolution::NotFound,
        }
    }

    /// Unregister `path`, pruning ancestors left with neither an owner nor
    /// children. Returns false if the path was not registered.
    pub fn delete(&mut self, path: &str) -> bool {
        let bytes = path.as_bytes();

        // Deepest node on the walk that outlives the deletion: the root, a
        // registered path, or a branch point.
        let mut anchor = 0;
        let mut node = &self.root;
        for (depth, byte) in bytes.iter().enumerate() {
            if depth == 0 || node.server.is_some() || node.children.len() > 1 {
                anchor = depth;
            }
            match node.children.get(byte) {
                Some(child) => node = child,
                None => return false,
            }
        }
        if node.server.is_none() {
            return false;
        }
        let prune = !bytes.is_empty() && node.children.is_empty();

        let stop = if prune { anchor } else { bytes.len() };
        let mut node = &mut self.root;
        for byte in &bytes[..stop] {
            match node.children.get_mut(byte) {
                Some(child) => node = child,
                None => return false,
            }
        }
        if prune {
            node.children.remove(&bytes[anchor]);
        } else {
            node.server = None;
        }
        self.registered -= 1;
        true
    }

    /// Registered paths equal to `prefix` or nested below `prefix/`.
    pub fn paths_under(&self, prefix: &str) -> Vec<String> {
        let mut node = &self.root;
        for byte in prefix.bytes() {
            match node.children.get(&byte) {
                Some(child) => node = child,
                None => return Vec::new(),
            }
        }
        let mut found = Vec::new();
        node.collect(prefix.as_bytes(), &mut found);
        found.retain(|p| is_within(p, prefix));
        found
    }

    /// Number of registered paths.
    pub fn len(&self) -> usize {
        self.registered
    }

    pub fn is_empty(&self) -> bool {
        self.registered == 0
    }

    /// Live nodes, root included.
    pub fn node_count(&self) -> usize {
        self.root.count()
    }

    /// Drop every node except the root.
    pub fn clear(&mut self) {
        self.root = TrieNode::default();
        self.registered = 0;
    }
}

/// True when `path` is `dir` itself or lies below it.
pub fn is_within(path: &str, dir: &str) -> bool {
    if dir.is_empty() || path == dir {
        return true;
    }
    match path.strip_prefix(dir) {
        Some(rest) => dir.ends_with('/') || rest.starts_with('/'),
        None => false,
    }
}
