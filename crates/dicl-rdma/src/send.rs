//! `post_meta_request`/`post_recv` equivalents: the small number of send/receive-queue postings
//! the dispatcher and bootstrap threads need, each a thin, signaled, inline-polled wrapper over
//! `ibv_post_send`/`ibv_post_recv` (§4.5, §4.7).

use std::ptr;

use dicl_wire::{pack, MessageType, TxState};

use crate::abi::*;
use crate::context::ServerContext;
use crate::error::RdmaError;

/// Posts a zero-length receive work request on `node_id`'s queue pair. The distilled protocol
/// only needs receive completions for their immediate data, never an actual payload.
pub fn post_zero_len_recv(ctx: &ServerContext, node_id: u8) -> Result<(), RdmaError> {
    let mut sge: rdma_sys::ibv_sge = unsafe { std::mem::zeroed() };
    sge.addr = 0;
    sge.length = 0;
    sge.lkey = ctx.lkey();

    let mut wr: rdma_sys::ibv_recv_wr = unsafe { std::mem::zeroed() };
    wr.wr_id = 0;
    wr.sg_list = &mut sge;
    wr.num_sge = 1;
    wr.next = ptr::null_mut();

    let mut bad_wr: *mut rdma_sys::ibv_recv_wr = ptr::null_mut();
    let rc = unsafe { rdma_sys::ibv_post_recv(ctx.qp[node_id as usize], &mut wr, &mut bad_wr) };
    if rc != 0 {
        return Err(RdmaError::PostRecv(node_id));
    }
    Ok(())
}

/// One signaled RDMA-write-with-immediate carrying `payload` (or no payload at all, for a
/// commit/abort reply) to `offset` bytes into the peer's advertised metadata-region slice, with
/// the immediate encoding `(node_id, pid, msg_type, tx_state, num)`. Polls the send CQ inline
/// for this request's own completion before returning, mirroring `post_meta_request`.
pub fn post_meta_request(
    ctx: &ServerContext,
    node_id: u8,
    pid: u8,
    msg_type: MessageType,
    tx_state: TxState,
    num: u8,
    payload: Option<(*const u8, usize)>,
    offset: u64,
) -> Result<(), RdmaError> {
    let (addr, len) = payload.unwrap_or((ptr::null(), 0));

    let mut sge: rdma_sys::ibv_sge = unsafe { std::mem::zeroed() };
    sge.addr = addr as u64;
    sge.length = len as u32;
    sge.lkey = ctx.lkey();

    let imm = dicl_wire::imm::to_network(pack(
        ctx.node_id(),
        pid,
        msg_type.code(),
        tx_state.code(),
        num,
    ));

    let mut wr: rdma_sys::ibv_send_wr = unsafe { std::mem::zeroed() };
    wr.opcode = IBV_WR_RDMA_WRITE_WITH_IMM;
    wr.sg_list = &mut sge;
    wr.num_sge = 1;
    wr.send_flags = IBV_SEND_SIGNALED;
    wr.imm_data = imm;
    wr.wr.rdma.remote_addr = ctx.remote_mm(node_id) + offset;
    wr.wr.rdma.rkey = ctx.remote_rkey(node_id);

    tracing::debug!(node_id, pid, num, ?msg_type, ?tx_state, "post_meta_request");

    let mut bad_wr: *mut rdma_sys::ibv_send_wr = ptr::null_mut();
    if unsafe { rdma_sys::ibv_post_send(ctx.qp[node_id as usize], &mut wr, &mut bad_wr) } != 0 {
        return Err(RdmaError::PostSend(node_id));
    }

    poll_send_completion(ctx)
}

fn poll_send_completion(ctx: &ServerContext) -> Result<(), RdmaError> {
    let mut wc: rdma_sys::ibv_wc = unsafe { std::mem::zeroed() };
    loop {
        let ne = unsafe { rdma_sys::ibv_poll_cq(ctx.send_cq, 1, &mut wc) };
        if ne < 0 {
            return Err(RdmaError::PollCq);
        }
        if ne >= 1 {
            break;
        }
    }
    if wc.status as u32 != IBV_WC_SUCCESS {
        return Err(RdmaError::CompletionFailed {
            wr_id: wc.wr_id,
            status: wc.status as u32,
        });
    }
    Ok(())
}
