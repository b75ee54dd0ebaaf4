use std::io;
use thiserror::Error;

/// Every one of these is "provider fatal" in the sense of SPEC_FULL.md §7: the caller's job is
/// to log the context and abort the process, not to retry.
#[derive(Debug, Error)]
pub enum RdmaError {
    #[error("no usable RDMA device found")]
    NoDevice,
    #[error("ibv_open_device failed")]
    OpenDevice,
    #[error("ibv_query_device failed")]
    QueryDevice,
    #[error("ibv_query_port failed")]
    QueryPort,
    #[error("ibv_query_gid failed")]
    QueryGid,
    #[error("ibv_alloc_pd failed")]
    AllocPd,
    #[error("ibv_create_cq failed")]
    CreateCq,
    #[error("ibv_create_qp[{0}] failed")]
    CreateQp(usize),
    #[error("ibv_reg_mr failed")]
    RegisterMr,
    #[error("ibv_modify_qp to {0} failed for node {1}")]
    ModifyQp(&'static str, u8),
    #[error("ibv_post_recv to node {0} failed")]
    PostRecv(u8),
    #[error("ibv_post_send to node {0} failed")]
    PostSend(u8),
    #[error("ibv_poll_cq failed")]
    PollCq,
    #[error("completion for wr_id {wr_id} failed with status {status}")]
    CompletionFailed { wr_id: u64, status: u32 },
    #[error("bootstrap exchange with a client failed")]
    NodeInfo(#[from] dicl_wire::node_info::NodeInfoError),
    #[error("io error during RDMA bootstrap")]
    Io(#[from] io::Error),
}
