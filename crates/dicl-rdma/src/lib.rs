//! The RDMA transport layer: queue-pair bring-up (C5), the completion poller (C6), and the
//! client-facing metadata region (C9).
//!
//! The verbs surface itself (`ibv_*` types and functions) comes from `rdma-sys`, a direct
//! bindgen binding of libibverbs. The small set of numeric verbs constants this crate needs
//! (queue-pair states, access flags, attribute-mask bits, work-completion opcodes) are declared
//! locally in [`abi`] rather than threaded through `rdma-sys`'s generated constant paths — those
//! values are part of the stable `rdma/ib_verbs.h` uAPI, not this repository's invention.

mod abi;
mod bootstrap;
mod context;
mod error;
mod meta_region;
mod poller;
mod qp;
mod send;

pub use bootstrap::run_bootstrap;
pub use context::ServerContext;
pub use error::RdmaError;
pub use meta_region::MetaRegion;
pub use poller::{run_poller, StagingFree};
pub use send::{post_meta_request, post_zero_len_recv};
