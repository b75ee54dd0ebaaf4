//! Byte-offset arithmetic over the client-facing metadata region (§4.9). Kept separate from
//! `dicl-rdma`'s actual memory-mapped window so the arithmetic can be unit-tested without an
//! RDMA provider.

use crate::{METADATA_SIZE, PER_NODE_META_REGION_SIZE, PER_PID_META_REGION_SIZE};

/// Byte offset, relative to the node's slice of the metadata region, of the `i`-th key in a
/// batch starting at pid `pid`.
pub const fn key_offset(pid: u8, i: u8) -> usize {
    pid as usize * PER_PID_META_REGION_SIZE + i as usize * METADATA_SIZE
}

/// Byte offset, relative to the node's slice of the metadata region, of the server-written
/// staging address for pid `pid`.
pub const fn staging_addr_offset(pid: u8) -> usize {
    pid as usize * PER_PID_META_REGION_SIZE + 8
}

/// Byte offset, relative to the start of the whole metadata region, of node `node_id`'s slice.
pub const fn node_offset(node_id: u8) -> usize {
    node_id as usize * PER_NODE_META_REGION_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offsets_are_strictly_increasing_within_a_pid() {
        assert_eq!(key_offset(0, 0), 0);
        assert_eq!(staging_addr_offset(0), 8);
        assert_eq!(key_offset(0, 1), METADATA_SIZE);
        assert!(key_offset(0, 1) > staging_addr_offset(0));
    }

    #[test]
    fn node_offsets_do_not_overlap() {
        assert_eq!(node_offset(0), 0);
        assert_eq!(node_offset(1), PER_NODE_META_REGION_SIZE);
        assert!(node_offset(1) >= node_offset(0) + PER_NODE_META_REGION_SIZE);
    }
}
