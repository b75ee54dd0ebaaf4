//! Provider bring-up: device discovery, protection domain, completion queues, the implicit
//! on-demand memory region, and the per-node queue-pair array. Mirrors the shape of
//! `server_init_ctx`/`server_init_interface`, minus the PMem pool (that's C2/C3, not this
//! crate's concern).

use std::ffi::CStr;
use std::ptr;
use std::sync::atomic::{AtomicU32, AtomicU64};

use dicl_wire::{MAX_NODE, SERVER_NODE_ID};

use crate::abi::*;
use crate::error::RdmaError;
use crate::meta_region::MetaRegion;

/// Receive-queue depth per queue pair. Matches the distilled spec's default.
const RX_DEPTH: i32 = 256;

/// Every long-lived provider handle the server holds, plus the per-node connection state
/// (`remote_mm`/`rkey`) bootstrap fills in and the dispatcher/poller later read.
///
/// Raw `ibv_*` pointers are not `Send`/`Sync` by default; this type is shared behind an `Arc`
/// across exactly three threads (bootstrap, poller, dispatcher-facing senders) whose access
/// pattern is coordinated by the protocol itself (§5), so the unsafe impls below are sound:
/// each QP's fields are only ever touched by the bootstrap thread (at connection time) and by
/// the poller/dispatcher's `post_*` calls (after bring-up), never concurrently for the same QP.
pub struct ServerContext {
    pub(crate) context: *mut rdma_sys::ibv_context,
    pub(crate) pd: *mut rdma_sys::ibv_pd,
    pub(crate) send_cq: *mut rdma_sys::ibv_cq,
    pub(crate) recv_cq: *mut rdma_sys::ibv_cq,
    pub(crate) mr: *mut rdma_sys::ibv_mr,
    pub(crate) port_lid: u16,
    pub(crate) ib_port: u8,
    pub(crate) qp: Vec<*mut rdma_sys::ibv_qp>,
    pub(crate) remote_mm: Vec<AtomicU64>,
    pub(crate) rkey: Vec<AtomicU32>,
    pub meta_region: std::sync::RwLock<MetaRegion>,
}

unsafe impl Send for ServerContext {}
unsafe impl Sync for ServerContext {}

impl ServerContext {
    /// Opens `device_name` (falling back to the first available device if `None` or not found,
    /// matching the original's `mlx5_0`-preferred probing), allocates a PD, a pair of CQs sized
    /// for `RX_DEPTH` outstanding work requests, registers a single implicit on-demand MR
    /// covering the whole process address space, and creates (but does not yet transition) one
    /// RC queue pair per possible client node.
    pub fn open(ib_port: u8, device_name: Option<&str>) -> Result<ServerContext, RdmaError> {
        let mut num_devices = 0i32;
        let dev_list = unsafe { rdma_sys::ibv_get_device_list(&mut num_devices) };
        if dev_list.is_null() || num_devices == 0 {
            return Err(RdmaError::NoDevice);
        }

        let mut chosen = ptr::null_mut();
        unsafe {
            let devices = std::slice::from_raw_parts(dev_list, num_devices as usize);
            for &dev in devices {
                let name = CStr::from_ptr(rdma_sys::ibv_get_device_name(dev));
                if device_name.map(|want| name.to_str() == Ok(want)).unwrap_or(false) {
                    chosen = dev;
                    break;
                }
            }
            if chosen.is_null() {
                chosen = devices[0];
            }
        }

        let context = unsafe { rdma_sys::ibv_open_device(chosen) };
        unsafe { rdma_sys::ibv_free_device_list(dev_list) };
        if context.is_null() {
            return Err(RdmaError::OpenDevice);
        }

        let mut dev_attr: rdma_sys::ibv_device_attr = unsafe { std::mem::zeroed() };
        if unsafe { rdma_sys::ibv_query_device(context, &mut dev_attr) } != 0 {
            return Err(RdmaError::QueryDevice);
        }

        let mut port_attr: rdma_sys::ibv_port_attr = unsafe { std::mem::zeroed() };
        if unsafe { rdma_sys::ibv_query_port(context, ib_port, &mut port_attr) } != 0 {
            return Err(RdmaError::QueryPort);
        }

        let pd = unsafe { rdma_sys::ibv_alloc_pd(context) };
        if pd.is_null() {
            return Err(RdmaError::AllocPd);
        }

        let send_cq = unsafe {
            rdma_sys::ibv_create_cq(context, RX_DEPTH, ptr::null_mut(), ptr::null_mut(), 0)
        };
        let recv_cq = unsafe {
            rdma_sys::ibv_create_cq(context, RX_DEPTH, ptr::null_mut(), ptr::null_mut(), 0)
        };
        if send_cq.is_null() || recv_cq.is_null() {
            return Err(RdmaError::CreateCq);
        }

        let meta_region = MetaRegion::new();
        // Implicit on-demand MR: addr=0, len=usize::MAX covers the whole address space, so any
        // buffer this process owns (the meta region, staging buffers) is remotely addressable
        // without a per-buffer registration call.
        let mr = unsafe {
            rdma_sys::ibv_reg_mr(
                pd,
                ptr::null_mut(),
                usize::MAX,
                (IBV_ACCESS_LOCAL_WRITE
                    | IBV_ACCESS_REMOTE_READ
                    | IBV_ACCESS_REMOTE_WRITE
                    | IBV_ACCESS_REMOTE_ATOMIC
                    | IBV_ACCESS_ON_DEMAND) as i32,
            )
        };
        if mr.is_null() {
            return Err(RdmaError::RegisterMr);
        }

        let mut qp = Vec::with_capacity(MAX_NODE);
        for i in 0..MAX_NODE {
            let mut init_attr: rdma_sys::ibv_qp_init_attr = unsafe { std::mem::zeroed() };
            init_attr.send_cq = send_cq;
            init_attr.recv_cq = recv_cq;
            init_attr.cap.max_send_wr = RX_DEPTH as u32;
            init_attr.cap.max_recv_wr = RX_DEPTH as u32;
            init_attr.cap.max_send_sge = 1;
            init_attr.cap.max_recv_sge = 1;
            init_attr.qp_type = IBV_QPT_RC;

            let created = unsafe { rdma_sys::ibv_create_qp(pd, &mut init_attr) };
            if created.is_null() {
                return Err(RdmaError::CreateQp(i));
            }
            qp.push(created);
        }

        tracing::info!(ib_port, nodes = MAX_NODE, "RDMA provider ready");

        Ok(ServerContext {
            context,
            pd,
            send_cq,
            recv_cq,
            mr,
            port_lid: port_attr.lid,
            ib_port,
            qp,
            remote_mm: (0..MAX_NODE).map(|_| AtomicU64::new(0)).collect(),
            rkey: (0..MAX_NODE).map(|_| AtomicU32::new(0)).collect(),
            meta_region: std::sync::RwLock::new(meta_region),
        })
    }

    pub fn node_id(&self) -> u8 {
        SERVER_NODE_ID
    }

    pub fn local_lid(&self) -> u16 {
        self.port_lid
    }

    pub fn query_gid(&self, gid_index: i32) -> Result<rdma_sys::ibv_gid, RdmaError> {
        let mut gid: rdma_sys::ibv_gid = unsafe { std::mem::zeroed() };
        if unsafe { rdma_sys::ibv_query_gid(self.context, self.ib_port, gid_index, &mut gid) } != 0
        {
            return Err(RdmaError::QueryGid);
        }
        Ok(gid)
    }

    pub fn qp_num(&self, node_id: u8) -> u32 {
        unsafe { (*self.qp[node_id as usize]).qp_num }
    }

    pub fn rkey(&self) -> u32 {
        unsafe { (*self.mr).rkey }
    }

    pub fn lkey(&self) -> u32 {
        unsafe { (*self.mr).lkey }
    }

    pub fn set_remote(&self, node_id: u8, mm: u64, rkey: u32) {
        self.remote_mm[node_id as usize].store(mm, std::sync::atomic::Ordering::Release);
        self.rkey[node_id as usize].store(rkey, std::sync::atomic::Ordering::Release);
    }

    pub fn remote_mm(&self, node_id: u8) -> u64 {
        self.remote_mm[node_id as usize].load(std::sync::atomic::Ordering::Acquire)
    }

    pub fn remote_rkey(&self, node_id: u8) -> u32 {
        self.rkey[node_id as usize].load(std::sync::atomic::Ordering::Acquire)
    }
}

impl Drop for ServerContext {
    fn drop(&mut self) {
        unsafe {
            for &qp in &self.qp {
                rdma_sys::ibv_destroy_qp(qp);
            }
            rdma_sys::ibv_dereg_mr(self.mr);
            rdma_sys::ibv_destroy_cq(self.send_cq);
            rdma_sys::ibv_destroy_cq(self.recv_cq);
            rdma_sys::ibv_dealloc_pd(self.pd);
            rdma_sys::ibv_close_device(self.context);
        }
    }
}
