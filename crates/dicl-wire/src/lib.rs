//! Wire-level types shared between the server and the kernel client: the size of a page, the
//! layout of the client-facing metadata region, the RDMA immediate codec, and the fixed-size
//! `NodeInfo` struct exchanged once per client during TCP bootstrap.

pub mod imm;
pub mod layout;
pub mod message;
pub mod node_info;
pub mod request;

pub use imm::{pack, unpack, Immediate};
pub use message::{MessageType, TxState};
pub use node_info::NodeInfo;
pub use request::RequestRecord;

/// Unique identifier of one logical cached page.
pub type PageKey = u64;

/// Size in bytes of one cached page. Matches the client's compile-time page size.
pub const PAGE_SIZE: usize = 4096;

/// Maximum number of client nodes the server will ever bootstrap a QP for.
pub const MAX_NODE: usize = 256;

/// Maximum number of concurrent (pid) transactions tracked per node.
pub const MAX_PROCESS: usize = 256;

/// Number of consecutive key/staging-addr entries available per (node, pid) sub-slice.
pub const NUM_ENTRY: usize = 32;

/// Stride, in bytes, between consecutive key slots within a pid sub-slice. Shared with the
/// client header; must be at least 16 (one key + one staging address).
pub const METADATA_SIZE: usize = 16;

/// Size in bytes of one (node, pid) sub-slice of the client metadata region.
pub const PER_PID_META_REGION_SIZE: usize = NUM_ENTRY * METADATA_SIZE;

/// Size in bytes of one node's slice of the client metadata region.
pub const PER_NODE_META_REGION_SIZE: usize = MAX_PROCESS * PER_PID_META_REGION_SIZE;

/// Total size in bytes of the server's client-facing metadata region.
pub const LOCAL_META_REGION_SIZE: usize = MAX_NODE * PER_NODE_META_REGION_SIZE;

/// Default size of the persistent log pool (file-backed PMem stand-in).
pub const LOG_SIZE: u64 = 16 << 30; // 16 GiB

/// Default size of the persistent index pool.
pub const INDEX_SIZE: u64 = 1 << 30; // 1 GiB

/// Fixed node id the server identifies itself with during bootstrap.
pub const SERVER_NODE_ID: u8 = 0;

/// Byte offset, within a node's slice of the metadata region, of pid `pid`'s key/staging-addr
/// sub-slice.
pub const fn pid_region_offset(pid: u8) -> usize {
    pid as usize * PER_PID_META_REGION_SIZE
}

/// Byte offset, within a pid sub-slice, of the server-written staging address reserved slot.
pub const STAGING_ADDR_OFFSET: usize = 8;
