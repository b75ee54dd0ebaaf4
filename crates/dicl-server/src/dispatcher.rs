//! The dispatcher (C7): executes the staged write / write-commit / read protocols against the
//! persistent log (C2) and index (C3), and posts replies through the RDMA transport (C1 for the
//! immediate, C9 for where the reply lands).
//!
//! A `READ_REQUEST` with `num > 1` copies each resolved log entry individually into its own
//! staging slot, since resolved addresses are not guaranteed contiguous in log order. The
//! staging address published back to the client is always the address of the staging buffer
//! this dispatcher itself allocated, read once from [`StagingTable::install`] and reused for
//! both the metadata-region write and the reply payload.

use std::sync::mpsc::Receiver;
use std::sync::Arc;

use dicl_index::PersistentIndex;
use dicl_log::LogPool;
use dicl_rdma::ServerContext;
use dicl_wire::layout::staging_addr_offset;
use dicl_wire::{MessageType, PageKey, RequestRecord, TxState, PAGE_SIZE};

use crate::staging::{StagingBuffer, StagingTable};

pub struct Dispatcher {
    pub transport: Arc<ServerContext>,
    pub log: Arc<LogPool>,
    pub index: Arc<PersistentIndex>,
    pub staging: Arc<StagingTable>,
}

impl Dispatcher {
    /// Consumes requests from `rx` until every sender has dropped (i.e. the poller has shut
    /// down). There is exactly one dispatcher thread; it is the sole mutator of the log, index,
    /// and staging table (§5).
    pub fn run(self, rx: Receiver<RequestRecord>) {
        for request in rx.iter() {
            if let Err(e) = self.handle(request) {
                tracing::error!(error = %e, ?request, "failed to handle request");
            }
        }
        tracing::info!("dispatcher exiting: request queue closed");
    }

    fn handle(&self, request: RequestRecord) -> Result<(), dicl_rdma::RdmaError> {
        match request.msg_type {
            MessageType::WriteRequest => self.handle_write_request(request),
            MessageType::Write => self.handle_write(request),
            MessageType::ReadRequest => self.handle_read_request(request),
            other => {
                tracing::warn!(?other, "request queue received an unexpected message type");
                Ok(())
            }
        }
    }

    fn read_key(&self, node_id: u8, pid: u8, i: u8) -> PageKey {
        self.transport.meta_region.read().unwrap().read_key(node_id, pid, i)
    }

    fn handle_write_request(&self, req: RequestRecord) -> Result<(), dicl_rdma::RdmaError> {
        let buffer = StagingBuffer::new(req.num);
        let addr = self.staging.install(req.node_id, req.pid, buffer);

        self.transport
            .meta_region
            .write()
            .unwrap()
            .write_staging_addr(req.node_id, req.pid, addr);

        tracing::debug!(
            node_id = req.node_id,
            pid = req.pid,
            num = req.num,
            addr,
            "allocated staging buffer for write"
        );

        dicl_rdma::post_meta_request(
            &self.transport,
            req.node_id,
            req.pid,
            MessageType::WriteRequestReply,
            TxState::WriteReady,
            req.num,
            Some((&addr as *const u64 as *const u8, std::mem::size_of::<u64>())),
            staging_addr_offset(req.pid) as u64,
        )
    }

    fn handle_write(&self, req: RequestRecord) -> Result<(), dicl_rdma::RdmaError> {
        let keys: Vec<PageKey> = (0..req.num)
            .map(|i| self.read_key(req.node_id, req.pid, i))
            .collect();

        let commit_result = self.staging.with_buffer(req.node_id, req.pid, |buffer| {
            for (i, key) in keys.iter().enumerate() {
                let page = &buffer.bytes[i * PAGE_SIZE..(i + 1) * PAGE_SIZE];
                let log_addr = self.log.alloc_and_persist(page)?;
                self.index.insert(*key, log_addr.0)?;
            }
            Ok::<(), anyhow::Error>(())
        });

        self.staging.take(req.node_id, req.pid);

        match commit_result {
            Some(Ok(())) => {
                tracing::debug!(node_id = req.node_id, pid = req.pid, num = req.num, "write committed");
                dicl_rdma::post_meta_request(
                    &self.transport,
                    req.node_id,
                    req.pid,
                    MessageType::WriteReply,
                    TxState::WriteCommitted,
                    req.num,
                    None,
                    staging_addr_offset(req.pid) as u64,
                )
            }
            Some(Err(e)) => {
                tracing::error!(error = %e, node_id = req.node_id, pid = req.pid, "write commit failed");
                dicl_rdma::post_meta_request(
                    &self.transport,
                    req.node_id,
                    req.pid,
                    MessageType::WriteReply,
                    TxState::Aborted,
                    req.num,
                    None,
                    staging_addr_offset(req.pid) as u64,
                )
            }
            None => {
                tracing::warn!(node_id = req.node_id, pid = req.pid, "WRITE with no staged buffer, dropped");
                Ok(())
            }
        }
    }

    fn handle_read_request(&self, req: RequestRecord) -> Result<(), dicl_rdma::RdmaError> {
        let keys: Vec<PageKey> = (0..req.num)
            .map(|i| self.read_key(req.node_id, req.pid, i))
            .collect();

        let resolved: Option<Vec<u64>> = keys.iter().map(|k| self.index.get(*k)).collect();

        let Some(addresses) = resolved else {
            tracing::debug!(node_id = req.node_id, pid = req.pid, "read aborted: missing key");
            return dicl_rdma::post_meta_request(
                &self.transport,
                req.node_id,
                req.pid,
                MessageType::ReadRequestReply,
                TxState::Aborted,
                req.num,
                None,
                staging_addr_offset(req.pid) as u64,
            );
        };

        let mut buffer = StagingBuffer::new(req.num);
        for (i, addr) in addresses.into_iter().enumerate() {
            let slot = &mut buffer.bytes[i * PAGE_SIZE..(i + 1) * PAGE_SIZE];
            if let Err(e) = self.log.read_into(dicl_log::LogAddress(addr), slot) {
                tracing::error!(error = %e, node_id = req.node_id, pid = req.pid, "log read failed");
                return Ok(());
            }
        }

        let addr = self.staging.install(req.node_id, req.pid, buffer);
        self.transport
            .meta_region
            .write()
            .unwrap()
            .write_staging_addr(req.node_id, req.pid, addr);

        dicl_rdma::post_meta_request(
            &self.transport,
            req.node_id,
            req.pid,
            MessageType::ReadRequestReply,
            TxState::ReadReady,
            req.num,
            Some((&addr as *const u64 as *const u8, std::mem::size_of::<u64>())),
            staging_addr_offset(req.pid) as u64,
        )
    }
}
