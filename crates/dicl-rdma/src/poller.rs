//! The completion poller (C6): a single loop draining the receive CQ, decoding immediates,
//! reposting receive work requests, and handing decoded requests to the dispatcher over the
//! request queue (C4).

use std::sync::mpsc::Sender;
use std::sync::Arc;

use dicl_wire::{unpack, MessageType, RequestRecord};

use crate::abi::*;
use crate::context::ServerContext;
use crate::error::RdmaError;
use crate::send::post_zero_len_recv;

/// Frees a staging buffer on `READ_REPLY` (the client has finished RDMA-reading it). Implemented
/// by the staging table (C8), which lives in the server binary crate — this trait is the seam
/// that lets the poller free staging without depending on the dispatcher's own crate.
pub trait StagingFree: Send + Sync {
    fn take(&self, node_id: u8, pid: u8);
}

/// Runs the completion poller forever (it only returns on a provider-fatal error, per §4.6 — the
/// caller is expected to treat that as fatal for the process).
pub fn run_poller(
    ctx: Arc<ServerContext>,
    tx: Sender<RequestRecord>,
    staging: Arc<dyn StagingFree>,
) -> Result<(), RdmaError> {
    let mut wc: rdma_sys::ibv_wc = unsafe { std::mem::zeroed() };
    loop {
        let ne = unsafe { rdma_sys::ibv_poll_cq(ctx.recv_cq, 1, &mut wc) };
        if ne < 0 {
            return Err(RdmaError::PollCq);
        }
        if ne < 1 {
            continue;
        }
        if wc.status as u32 != IBV_WC_SUCCESS {
            return Err(RdmaError::CompletionFailed {
                wr_id: wc.wr_id,
                status: wc.status as u32,
            });
        }

        match wc.opcode as u32 {
            IBV_WC_RECV_RDMA_WITH_IMM => {
                let bits = dicl_wire::imm::from_network(wc.imm_data);
                let decoded = unpack(bits);

                post_zero_len_recv(&ctx, decoded.node_id)?;

                let Ok(msg_type) = MessageType::from_code(decoded.type_code) else {
                    tracing::warn!(code = decoded.type_code, "unrecognized message type, dropped");
                    continue;
                };

                match msg_type {
                    MessageType::WriteRequest | MessageType::Write | MessageType::ReadRequest => {
                        if decoded.num as usize > dicl_wire::NUM_ENTRY {
                            tracing::warn!(
                                num = decoded.num,
                                max = dicl_wire::NUM_ENTRY,
                                node_id = decoded.node_id,
                                pid = decoded.pid,
                                "num out of range, dropped"
                            );
                            continue;
                        }
                        let record = RequestRecord::new(
                            msg_type,
                            decoded.node_id,
                            decoded.pid,
                            decoded.num,
                        );
                        // An unbounded channel: enqueue never blocks and only fails if every
                        // dispatcher-side receiver has been dropped, i.e. the process is
                        // shutting down.
                        let _ = tx.send(record);
                    }
                    MessageType::ReadReply => {
                        staging.take(decoded.node_id, decoded.pid);
                    }
                    other => {
                        tracing::warn!(?other, "unexpected message type at the poller, dropped");
                    }
                }
            }
            IBV_WC_RDMA_READ => {
                // Informational only: the client performing an RDMA read of its staged pages.
            }
            other => {
                tracing::warn!(opcode = other, "unexpected completion opcode");
            }
        }
    }
}
