//! The staging table (C8): a volatile `(node_id, pid) -> Option<StagingBuffer>` map. Written
//! only by the dispatcher (on `*_REQUEST`); freed by the dispatcher itself (on `WRITE` commit)
//! or by the completion poller (on `READ_REPLY`) — the two frees are mutually exclusive per
//! `(node, pid)` because the client protocol never sends both for the same transaction.

use std::sync::Mutex;

use dicl_wire::{MAX_NODE, MAX_PROCESS};

/// An owned scratch buffer of `num * PAGE_SIZE` bytes, exclusively held by the dispatcher between
/// a `*_REQUEST` and its commit/reply.
pub struct StagingBuffer {
    pub bytes: Box<[u8]>,
}

impl StagingBuffer {
    pub fn new(num_pages: u8) -> Self {
        StagingBuffer {
            bytes: vec![0u8; num_pages as usize * dicl_wire::PAGE_SIZE].into_boxed_slice(),
        }
    }

    pub fn addr(&self) -> u64 {
        self.bytes.as_ptr() as u64
    }
}

/// Flat `MAX_NODE * MAX_PROCESS` table of in-flight staging buffers, one mutex per slot so
/// unrelated `(node, pid)` pairs never contend.
pub struct StagingTable {
    slots: Vec<Mutex<Option<StagingBuffer>>>,
}

impl StagingTable {
    pub fn new() -> Self {
        StagingTable {
            slots: (0..MAX_NODE * MAX_PROCESS).map(|_| Mutex::new(None)).collect(),
        }
    }

    fn index(node_id: u8, pid: u8) -> usize {
        node_id as usize * MAX_PROCESS + pid as usize
    }

    /// Installs a freshly allocated staging buffer for `(node_id, pid)`, returning its address.
    /// Invariant 1 (SPEC_FULL.md §3): the slot must be empty when this is called — the client
    /// protocol never issues a second `*_REQUEST` for a pid with one already in flight.
    pub fn install(&self, node_id: u8, pid: u8, buffer: StagingBuffer) -> u64 {
        let addr = buffer.addr();
        let mut slot = self.slots[Self::index(node_id, pid)].lock().unwrap();
        *slot = Some(buffer);
        addr
    }

    /// Takes the staging buffer for `(node_id, pid)`, if any, freeing the slot. Used by both the
    /// write-commit path (dispatcher) and the read-reply path (poller).
    pub fn take(&self, node_id: u8, pid: u8) -> Option<StagingBuffer> {
        self.slots[Self::index(node_id, pid)].lock().unwrap().take()
    }

    /// Reads the raw base address of an in-flight staging buffer without consuming it — used by
    /// the write-commit path, which reads the client's written pages out of staging before
    /// freeing it.
    pub fn addr_of(&self, node_id: u8, pid: u8) -> Option<u64> {
        self.slots[Self::index(node_id, pid)]
            .lock()
            .unwrap()
            .as_ref()
            .map(StagingBuffer::addr)
    }

    pub fn with_buffer<R>(&self, node_id: u8, pid: u8, f: impl FnOnce(&StagingBuffer) -> R) -> Option<R> {
        self.slots[Self::index(node_id, pid)]
            .lock()
            .unwrap()
            .as_ref()
            .map(f)
    }
}

impl Default for StagingTable {
    fn default() -> Self {
        Self::new()
    }
}

impl dicl_rdma::StagingFree for StagingTable {
    fn take(&self, node_id: u8, pid: u8) {
        let _ = StagingTable::take(self, node_id, pid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn install_then_take_round_trips() {
        let table = StagingTable::new();
        let buf = StagingBuffer::new(2);
        let addr = table.install(3, 9, buf);
        assert_eq!(table.addr_of(3, 9), Some(addr));
        let taken = table.take(3, 9);
        assert!(taken.is_some());
        assert_eq!(table.addr_of(3, 9), None);
    }

    #[test]
    fn distinct_pids_do_not_alias() {
        let table = StagingTable::new();
        table.install(0, 0, StagingBuffer::new(1));
        assert_eq!(table.addr_of(0, 1), None);
    }
}
