pub mod config;
pub mod coordinator;
pub mod error;
pub mod server;
pub mod state;
pub mod storage;
pub mod wire;
