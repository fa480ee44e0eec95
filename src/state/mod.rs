pub mod health;
pub mod lock_table;
pub mod lookup_cache;
pub mod namespace;
pub mod path_index;
pub mod registry;

/// Position of a storage server in the registry. Stable for the lifetime of
/// the naming server.
pub type ServerIndex = usize;
