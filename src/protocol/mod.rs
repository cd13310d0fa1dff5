//! Wire protocol for the control and data channels.
//!
//! Both channels carry framed [`Envelope`]s over TCP. The control channel
//! connects storage nodes and initiators to the metadata manager; the data
//! channel connects initiators (and the rebuild worker) to storage nodes.
//! Every data-channel request carries an [`IoToken`].

mod connection;
mod frame;

pub use connection::Connection;
pub use frame::{encode_frame, read_frame, write_frame, Envelope, MAX_FRAME_SIZE};

use crate::auth::IoToken;
use crate::cluster::{TokenGrant, VolumeLayout};
use crate::error::WireError;
use crate::types::*;
use serde::{Deserialize, Serialize};

/// Messages that have an operation name on the wire.
pub trait Operation {
    fn operation(&self) -> &'static str;
}

/// Requests sent to the metadata manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ControlRequest {
    Register(Registration),
    Heartbeat(Heartbeat),
    IssueToken {
        client_id: ClientId,
        volume_id: VolumeId,
        chunk_id: ChunkId,
        operation: IoOperation,
    },
    VolumeLayout {
        client_id: ClientId,
        volume_id: VolumeId,
    },
    ReserveOnWrite {
        chunk_id: ChunkId,
        bytes: u64,
    },
    ReportDegradedWrite {
        chunk_id: ChunkId,
        missed: Vec<NodeId>,
    },
    ReportIoTimeout {
        node_id: NodeId,
    },
    IoAck(IoAck),
}

impl Operation for ControlRequest {
    fn operation(&self) -> &'static str {
        match self {
            ControlRequest::Register(_) => "REGISTER",
            ControlRequest::Heartbeat(_) => "HEARTBEAT",
            ControlRequest::IssueToken { .. } => "ISSUE_TOKEN",
            ControlRequest::VolumeLayout { .. } => "VOLUME_LAYOUT",
            ControlRequest::ReserveOnWrite { .. } => "RESERVE_ON_WRITE",
            ControlRequest::ReportDegradedWrite { .. } => "REPORT_DEGRADED_WRITE",
            ControlRequest::ReportIoTimeout { .. } => "REPORT_IO_TIMEOUT",
            ControlRequest::IoAck(_) => "IO_ACK",
        }
    }
}

/// Replies from the metadata manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ControlResponse {
    /// Registration accepted. A returning storage node gets its recovery report.
    Registered {
        node_id: NodeId,
        recovery: Option<RecoveryReport>,
    },
    HeartbeatAck {
        recovery: Option<RecoveryReport>,
    },
    Token(TokenGrant),
    Layout(VolumeLayout),
    Reserved {
        bytes: u64,
    },
    Ok,
    Error(WireError),
}

impl Operation for ControlResponse {
    fn operation(&self) -> &'static str {
        match self {
            ControlResponse::Registered { .. } => "REGISTERED",
            ControlResponse::HeartbeatAck { .. } => "HEARTBEAT_ACK",
            ControlResponse::Token(_) => "TOKEN",
            ControlResponse::Layout(_) => "LAYOUT",
            ControlResponse::Reserved { .. } => "RESERVED",
            ControlResponse::Ok => "OK",
            ControlResponse::Error(_) => "ERROR",
        }
    }
}

/// Requests sent to a storage node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DataRequest {
    Write {
        token: IoToken,
        /// Offset within the chunk.
        offset: u64,
        data: Vec<u8>,
    },
    Read {
        token: IoToken,
        offset: u64,
        length: u64,
    },
    /// Drop local copies of the chunks named by WRITE tokens.
    Discard {
        tokens: Vec<IoToken>,
    },
}

impl Operation for DataRequest {
    fn operation(&self) -> &'static str {
        match self {
            DataRequest::Write { .. } => "WRITE",
            DataRequest::Read { .. } => "READ",
            DataRequest::Discard { .. } => "DISCARD",
        }
    }
}

/// Replies from a storage node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DataResponse {
    Written { bytes: u64 },
    Data(Vec<u8>),
    Discarded { chunks: usize },
    Error(WireError),
}

impl Operation for DataResponse {
    fn operation(&self) -> &'static str {
        match self {
            DataResponse::Written { .. } => "WRITTEN",
            DataResponse::Data(_) => "DATA",
            DataResponse::Discarded { .. } => "DISCARDED",
            DataResponse::Error(_) => "ERROR",
        }
    }
}
