//! [`RequestRecord`]: the decoded unit of work handed from the completion poller (C6) to the
//! dispatcher (C7) over the request queue (C4).

use crate::MessageType;

/// A fully-decoded client request, ready for the dispatcher. Constructed by the poller from an
/// unpacked immediate; owned exclusively by whichever side currently holds it (poller until
/// enqueued, dispatcher after dequeue).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestRecord {
    pub msg_type: MessageType,
    pub node_id: u8,
    pub pid: u8,
    pub num: u8,
}

impl RequestRecord {
    pub const fn new(msg_type: MessageType, node_id: u8, pid: u8, num: u8) -> Self {
        RequestRecord {
            msg_type,
            node_id,
            pid,
            num,
        }
    }
}
