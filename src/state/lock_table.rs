use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use tracing::debug;

use super::ServerIndex;

#[derive(Debug, Default)]
struct GateState {
    active_reads: usize,
    writers_waiting: usize,
    writing: bool,
}

/// Read/write coordination for every path hosted on one storage server.
#[derive(Debug, Default)]
pub struct ServerGate {
    state: Mutex<GateState>,
    changed: Condvar,
}

impl ServerGate {
    fn enter_read(&self) {
        let mut state = self.state.lock();
        while state.writing || state.writers_waiting > 0 {
            self.changed.wait(&mut state);
        }
        state.active_reads += 1;
    }

    fn leave_read(&self) {
        let mut state = self.state.lock();
        state.active_reads -= 1;
        if state.active_reads == 0 {
            self.changed.notify_all();
        }
    }

    /// A waiting writer holds off readers that arrive after it, so it only
    /// waits for the reads already active.
    fn enter_write(&self) {
        let mut state = self.state.lock();
        state.writers_waiting += 1;
        while state.writing || state.active_reads > 0 {
            self.changed.wait(&mut state);
        }
        state.writers_waiting -= 1;
        state.writing = true;
    }

    fn leave_write(&self) {
        let mut state = self.state.lock();
        state.writing = false;
        self.changed.notify_all();
    }
}

/// Releases an active read when dropped.
#[must_use = "the read is released as soon as the guard is dropped"]
pub struct ReadGuard {
    gate: Arc<ServerGate>,
    server: ServerIndex,
}

impl Drop for ReadGuard {
    fn drop(&mut self) {
        self.gate.leave_read();
        debug!("Read released on server {}", self.server);
    }
}

/// Exclusive hold on a server's gate, released when dropped.
#[must_use = "the write lock is released as soon as the guard is dropped"]
pub struct WriteGuard {
    gate: Arc<ServerGate>,
    server: ServerIndex,
}

impl WriteGuard {
    /// Give the gate back before the operation finishes, e.g. once a stream
    /// has been handed off.
    pub fn release(self) {}
}

impl Drop for WriteGuard {
    fn drop(&mut self) {
        self.gate.leave_write();
        debug!("Write lock released on server {}", self.server);
    }
}

/// One gate per storage server index. Reads against a server never block
/// each other. A write waits until that server's active reads drain, and new
/// readers queue behind it until it is released.
#[derive(Debug, Default)]
pub struct ResourceLockTable {
    gates: DashMap<ServerIndex, Arc<ServerGate>>,
}

impl ResourceLockTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn gate(&self, server: ServerIndex) -> Arc<ServerGate> {
        Arc::clone(self.gates.entry(server).or_default().value())
    }

    pub fn begin_read(&self, server: ServerIndex) -> ReadGuard {
        let gate = self.gate(server);
        gate.enter_read();
        debug!("Read active on server {}", server);
        ReadGuard { gate, server }
    }

    pub fn begin_write(&self, server: ServerIndex) -> WriteGuard {
        let gate = self.gate(server);
        gate.enter_write();
        debug!("Write lock acquired on server {}", server);
        WriteGuard { gate, server }
    }

    pub fn active_reads(&self, server: ServerIndex) -> usize {
        self.gates
            .get(&server)
            .map_or(0, |gate| gate.state.lock().active_reads)
    }

    pub fn waiting_writers(&self, server: ServerIndex) -> usize {
        self.gates
            .get(&server)
            .map_or(0, |gate| gate.state.lock().writers_waiting)
    }

    pub fn is_writing(&self, server: ServerIndex) -> bool {
        self.gates
            .get(&server)
            .is_some_and(|gate| gate.state.lock().writing)
    }
}
