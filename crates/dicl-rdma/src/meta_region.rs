//! The client-facing metadata region (C9): the single buffer the implicit on-demand MR covers.
//! The client RDMA-writes request keys into it and RDMA-reads the staging address the
//! dispatcher publishes back into it.

use dicl_wire::layout::{key_offset, node_offset, staging_addr_offset};
use dicl_wire::LOCAL_META_REGION_SIZE;

/// A boxed, page-aligned-by-construction byte buffer sized for every node's and every pid's
/// sub-slice. Boxed (not stack-allocated) so its address is stable across moves of the owning
/// [`crate::ServerContext`] and is sized to register as a single memory region.
pub struct MetaRegion {
    buf: Box<[u8; LOCAL_META_REGION_SIZE]>,
}

impl MetaRegion {
    pub fn new() -> Self {
        MetaRegion {
            buf: vec![0u8; LOCAL_META_REGION_SIZE]
                .into_boxed_slice()
                .try_into()
                .expect("LOCAL_META_REGION_SIZE buffer has the declared length"),
        }
    }

    /// Base address of the region, as registered with the provider. Used both as the MR's
    /// virtual address base and to compute each node's advertised `mm` during bootstrap.
    pub fn base_addr(&self) -> u64 {
        self.buf.as_ptr() as u64
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Address of node `node_id`'s slice, as advertised to that client during bootstrap.
    pub fn node_base_addr(&self, node_id: u8) -> u64 {
        self.base_addr() + node_offset(node_id) as u64
    }

    fn pid_slice(&self, node_id: u8, pid: u8) -> &[u8] {
        let start = node_offset(node_id) + dicl_wire::pid_region_offset(pid);
        &self.buf[start..start + dicl_wire::PER_PID_META_REGION_SIZE]
    }

    fn pid_slice_mut(&mut self, node_id: u8, pid: u8) -> &mut [u8] {
        let start = node_offset(node_id) + dicl_wire::pid_region_offset(pid);
        &mut self.buf[start..start + dicl_wire::PER_PID_META_REGION_SIZE]
    }

    /// Reads the `i`-th key of the batch addressed to `(node_id, pid)`.
    pub fn read_key(&self, node_id: u8, pid: u8, i: u8) -> u64 {
        let slice = self.pid_slice(node_id, pid);
        let at = key_offset(0, i); // key_offset is pid-relative; pid base already applied above.
        u64::from_ne_bytes(slice[at..at + 8].try_into().unwrap())
    }

    /// Publishes `addr` into the server-reserved staging-address slot for `(node_id, pid)`, the
    /// value the client will RDMA-read back.
    pub fn write_staging_addr(&mut self, node_id: u8, pid: u8, addr: u64) {
        let slice = self.pid_slice_mut(node_id, pid);
        let at = staging_addr_offset(0);
        slice[at..at + 8].copy_from_slice(&addr.to_ne_bytes());
    }

    /// Byte offset, relative to the whole region's base, of pid `pid`'s reserved staging-address
    /// slot within node `node_id`'s slice. This is the `offset` argument `post_meta_request`
    /// uses to address the correct remote location.
    pub fn staging_addr_region_offset(node_id: u8, pid: u8) -> u64 {
        (node_offset(node_id) + staging_addr_offset(pid)) as u64
    }
}

impl Default for MetaRegion {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn written_staging_addr_round_trips_through_offsets() {
        let mut region = MetaRegion::new();
        region.write_staging_addr(3, 7, 0xdead_beef);
        let start = node_offset(3) + dicl_wire::pid_region_offset(7);
        let at = start + staging_addr_offset(0);
        let got = u64::from_ne_bytes(region.buf[at..at + 8].try_into().unwrap());
        assert_eq!(got, 0xdead_beef);
    }

    #[test]
    fn different_nodes_do_not_alias() {
        let mut region = MetaRegion::new();
        region.write_staging_addr(0, 0, 1);
        region.write_staging_addr(1, 0, 2);
        assert_ne!(
            MetaRegion::staging_addr_region_offset(0, 0),
            MetaRegion::staging_addr_region_offset(1, 0)
        );
    }
}
