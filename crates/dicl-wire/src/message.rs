//! The closed set of message/state codes carried in the 4-bit `type` and `tx_state` fields of an
//! immediate. Modeled as exhaustively-matched enums rather than an integer and an if/else chain
//! (see DESIGN.md — "dynamic dispatch").

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unrecognized code {0:#x}")]
pub struct UnknownCode(pub u8);

/// Message type, carried in immediate bits `[15:12]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// C→S: begin write of `num` pages; keys already staged in the meta region.
    WriteRequest,
    /// S→C: staging address published; `tx_state = WriteReady`.
    WriteRequestReply,
    /// C→S: pages now in staging; commit.
    Write,
    /// S→C: `tx_state = WriteCommitted`, or `Aborted` if the batch could not be fully persisted.
    WriteReply,
    /// C→S: begin read of `num` pages by keys in the meta region.
    ReadRequest,
    /// S→C: `tx_state = ReadReady` with a staging address, or `Aborted` on a missing key.
    ReadRequestReply,
    /// C→S: client has consumed staging; server may free it.
    ReadReply,
}

impl MessageType {
    pub const fn code(self) -> u8 {
        match self {
            MessageType::WriteRequest => 0,
            MessageType::WriteRequestReply => 1,
            MessageType::Write => 2,
            MessageType::WriteReply => 3,
            MessageType::ReadRequest => 4,
            MessageType::ReadRequestReply => 5,
            MessageType::ReadReply => 6,
        }
    }

    pub const fn from_code(code: u8) -> Result<Self, UnknownCode> {
        match code {
            0 => Ok(MessageType::WriteRequest),
            1 => Ok(MessageType::WriteRequestReply),
            2 => Ok(MessageType::Write),
            3 => Ok(MessageType::WriteReply),
            4 => Ok(MessageType::ReadRequest),
            5 => Ok(MessageType::ReadRequestReply),
            6 => Ok(MessageType::ReadReply),
            other => Err(UnknownCode(other)),
        }
    }
}

/// Transaction state, carried in immediate bits `[11:8]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TxState {
    WriteReady,
    WriteCommitted,
    ReadReady,
    /// The offending request could not be completed: a `READ_REQUEST` with a missing key, or a
    /// `WRITE` that hit an allocation failure (log pool full, index split OOM) partway through
    /// its batch. Carried on either `READ_REQUEST_REPLY` or `WRITE_REPLY`; the message type the
    /// immediate is attached to disambiguates which.
    Aborted,
    /// No transaction-state payload is meaningful for this message (e.g. a client→server
    /// request, which carries no reply state yet).
    None,
}

impl TxState {
    pub const fn code(self) -> u8 {
        match self {
            TxState::WriteReady => 0,
            TxState::WriteCommitted => 1,
            TxState::ReadReady => 2,
            TxState::Aborted => 3,
            TxState::None => 0xf,
        }
    }

    pub const fn from_code(code: u8) -> Result<Self, UnknownCode> {
        match code {
            0 => Ok(TxState::WriteReady),
            1 => Ok(TxState::WriteCommitted),
            2 => Ok(TxState::ReadReady),
            3 => Ok(TxState::Aborted),
            0xf => Ok(TxState::None),
            other => Err(UnknownCode(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_type_round_trips() {
        for t in [
            MessageType::WriteRequest,
            MessageType::WriteRequestReply,
            MessageType::Write,
            MessageType::WriteReply,
            MessageType::ReadRequest,
            MessageType::ReadRequestReply,
            MessageType::ReadReply,
        ] {
            assert_eq!(MessageType::from_code(t.code()), Ok(t));
        }
    }

    #[test]
    fn tx_state_round_trips() {
        for s in [
            TxState::WriteReady,
            TxState::WriteCommitted,
            TxState::ReadReady,
            TxState::Aborted,
            TxState::None,
        ] {
            assert_eq!(TxState::from_code(s.code()), Ok(s));
        }
    }

    #[test]
    fn unknown_code_is_rejected() {
        assert_eq!(MessageType::from_code(9), Err(UnknownCode(9)));
    }
}
