//! Queue-pair state machine: RESET → INIT → RTR → RTS, attributes exactly as `modify_qp` in the
//! original transport set them (§4.5).

use dicl_wire::NodeInfo;

use crate::abi::*;
use crate::error::RdmaError;

const MIN_RNR_TIMER: u8 = 12;
const MAX_DEST_RD_ATOMIC: u8 = 16;
const TIMEOUT: u8 = 14;
const RETRY_CNT: u8 = 7;
const RNR_RETRY: u8 = 7;
const MAX_RD_ATOMIC: u8 = 16;

/// Drives `qp` through INIT, RTR, and RTS in sequence for the peer described by `dest`. `my_psn`
/// is this side's own starting packet sequence number (chosen locally, sent to the peer out of
/// band as part of the bootstrap `NodeInfo`).
pub fn bring_up(
    qp: *mut rdma_sys::ibv_qp,
    ib_port: u8,
    my_psn: u32,
    dest: &NodeInfo,
) -> Result<(), RdmaError> {
    to_init(qp, ib_port, dest.node_id)?;
    to_rtr(qp, ib_port, dest)?;
    to_rts(qp, my_psn, dest.node_id)?;
    Ok(())
}

fn to_init(qp: *mut rdma_sys::ibv_qp, ib_port: u8, peer_node: u8) -> Result<(), RdmaError> {
    let mut attr: rdma_sys::ibv_qp_attr = unsafe { std::mem::zeroed() };
    attr.qp_state = IBV_QPS_INIT;
    attr.pkey_index = 0;
    attr.port_num = ib_port;
    attr.qp_access_flags =
        IBV_ACCESS_LOCAL_WRITE | IBV_ACCESS_REMOTE_READ | IBV_ACCESS_REMOTE_WRITE | IBV_ACCESS_REMOTE_ATOMIC;

    let flags = IBV_QP_STATE | IBV_QP_PKEY_INDEX | IBV_QP_PORT | IBV_QP_ACCESS_FLAGS;
    if unsafe { rdma_sys::ibv_modify_qp(qp, &mut attr, flags as i32) } != 0 {
        return Err(RdmaError::ModifyQp("INIT", peer_node));
    }
    Ok(())
}

fn to_rtr(qp: *mut rdma_sys::ibv_qp, ib_port: u8, dest: &NodeInfo) -> Result<(), RdmaError> {
    let mut attr: rdma_sys::ibv_qp_attr = unsafe { std::mem::zeroed() };
    attr.qp_state = IBV_QPS_RTR;
    attr.path_mtu = IBV_MTU_4096;
    attr.dest_qp_num = dest.qpn;
    attr.rq_psn = dest.psn;
    attr.max_dest_rd_atomic = MAX_DEST_RD_ATOMIC;
    attr.min_rnr_timer = MIN_RNR_TIMER;
    attr.ah_attr.is_global = 0;
    attr.ah_attr.dlid = dest.lid;
    attr.ah_attr.sl = 0;
    attr.ah_attr.src_path_bits = 1;
    attr.ah_attr.port_num = ib_port;

    let gid_nonzero = dest.gid.iter().any(|&b| b != 0);
    if gid_nonzero {
        attr.ah_attr.is_global = 1;
        attr.ah_attr.grh.hop_limit = 1;
        unsafe { attr.ah_attr.grh.dgid.raw = dest.gid };
        attr.ah_attr.grh.sgid_index = 0;
    }

    let flags = IBV_QP_STATE
        | IBV_QP_PATH_MTU
        | IBV_QP_DEST_QPN
        | IBV_QP_RQ_PSN
        | IBV_QP_MAX_DEST_RD_ATOMIC
        | IBV_QP_MIN_RNR_TIMER
        | IBV_QP_AV;
    if unsafe { rdma_sys::ibv_modify_qp(qp, &mut attr, flags as i32) } != 0 {
        return Err(RdmaError::ModifyQp("RTR", dest.node_id));
    }
    Ok(())
}

fn to_rts(qp: *mut rdma_sys::ibv_qp, my_psn: u32, peer_node: u8) -> Result<(), RdmaError> {
    let mut attr: rdma_sys::ibv_qp_attr = unsafe { std::mem::zeroed() };
    attr.qp_state = IBV_QPS_RTS;
    attr.timeout = TIMEOUT;
    attr.retry_cnt = RETRY_CNT;
    attr.rnr_retry = RNR_RETRY;
    attr.sq_psn = my_psn;
    attr.max_rd_atomic = MAX_RD_ATOMIC;
    attr.max_dest_rd_atomic = MAX_DEST_RD_ATOMIC;

    let flags = IBV_QP_STATE
        | IBV_QP_TIMEOUT
        | IBV_QP_RETRY_CNT
        | IBV_QP_RNR_RETRY
        | IBV_QP_SQ_PSN
        | IBV_QP_MAX_QP_RD_ATOMIC;
    if unsafe { rdma_sys::ibv_modify_qp(qp, &mut attr, flags as i32) } != 0 {
        return Err(RdmaError::ModifyQp("RTS", peer_node));
    }
    Ok(())
}

/// A fresh, locally chosen starting packet sequence number, masked to the 24 significant bits
/// the wire format carries.
pub fn random_psn() -> u32 {
    use rand::Rng;
    rand::thread_rng().gen::<u32>() & 0x00ff_ffff
}
