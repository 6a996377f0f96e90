//! Synchronous database calls from the interpreter thread.
//!
//! The interpreter cannot await, so each call is a blocking round trip: the
//! request goes to a dedicated database thread over a channel, the caller
//! parks on the status word of a [`SharedTransferBuffer`], and the worker
//! publishes a JSON [`BridgeReply`] into the buffer before waking it.

pub mod buffer;
pub mod worker;

use serde::{Deserialize, Serialize};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Result, SandboxError};
use crate::types::{QueryOutcome, SqlValue};

pub use buffer::{SharedTransferBuffer, WaitOutcome};
pub use worker::DatabaseSubWorker;

use buffer::{
    INIT_FAILED, INIT_LOADED, INIT_PENDING, INIT_SLOT, STATUS_ERROR, STATUS_PENDING,
    STATUS_SLOT, STATUS_SUCCESS,
};

/// Messages understood by the database sub-worker.
#[derive(Debug, Clone)]
pub enum BridgeRequest {
    /// Replace the worker's database with a fresh instance loaded from `dump_id`.
    SqlInit { dump_id: String },
    SqlRequest { sql: String, params: Vec<SqlValue> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    #[default]
    Query,
    BufferOverflow,
    DumpLoad,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeFailure {
    pub error: String,
    #[serde(default)]
    pub kind: FailureKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dump_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capacity: Option<usize>,
}

/// JSON payload written into the shared buffer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BridgeReply {
    Rows(QueryOutcome),
    Failure(BridgeFailure),
}

impl BridgeReply {
    pub fn from_error(err: &SandboxError) -> Self {
        let mut failure = BridgeFailure {
            error: err.to_string(),
            kind: FailureKind::Query,
            dump_id: None,
            size: None,
            capacity: None,
        };
        match err {
            SandboxError::BufferOverflow { size, capacity } => {
                failure.kind = FailureKind::BufferOverflow;
                failure.size = Some(*size);
                failure.capacity = Some(*capacity);
            }
            SandboxError::DumpLoad { dump_id, message } => {
                failure.kind = FailureKind::DumpLoad;
                failure.dump_id = Some(dump_id.clone());
                failure.error = message.clone();
            }
            _ => {}
        }
        BridgeReply::Failure(failure)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        // Serializing plain data into a Vec cannot fail.
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| SandboxError::protocol(format!("malformed bridge reply: {}", e)))
    }

    pub fn into_result(self) -> Result<QueryOutcome> {
        match self {
            BridgeReply::Rows(outcome) => Ok(outcome),
            BridgeReply::Failure(failure) => Err(match failure.kind {
                FailureKind::Query => SandboxError::Query {
                    message: failure.error,
                },
                FailureKind::BufferOverflow => SandboxError::BufferOverflow {
                    size: failure.size.unwrap_or_default(),
                    capacity: failure.capacity.unwrap_or_default(),
                },
                FailureKind::DumpLoad => SandboxError::DumpLoad {
                    dump_id: failure.dump_id.unwrap_or_default(),
                    message: failure.error,
                },
            }),
        }
    }
}

/// Caller side of the bridge, owned by the interpreter thread.
pub struct SyncBridge {
    buffer: Arc<SharedTransferBuffer>,
    requests: Sender<BridgeRequest>,
    timeout: Option<Duration>,
}

impl SyncBridge {
    pub fn new(
        buffer: Arc<SharedTransferBuffer>,
        requests: Sender<BridgeRequest>,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            buffer,
            requests,
            timeout,
        }
    }

    /// Load `dump_id` into a fresh database and block until the worker reports back.
    pub fn initialize(&self, dump_id: &str) -> Result<()> {
        let _call = self.buffer.begin_call()?;
        self.buffer.store(INIT_SLOT, INIT_PENDING);
        self.send(BridgeRequest::SqlInit {
            dump_id: dump_id.to_string(),
        })?;

        self.block_on(INIT_SLOT, INIT_PENDING)?;
        match self.buffer.load(INIT_SLOT) {
            INIT_LOADED => {
                tracing::debug!(dump_id, "bridge database ready");
                Ok(())
            }
            INIT_FAILED => {
                let reply = BridgeReply::from_bytes(&self.buffer.read_payload())?;
                match reply.into_result() {
                    Err(err) => Err(err),
                    Ok(_) => Err(SandboxError::protocol("init failure without error payload")),
                }
            }
            other => Err(SandboxError::protocol(format!("unexpected init state {}", other))),
        }
    }

    /// Execute one statement on the worker and block until its reply is published.
    pub fn call(&self, sql: &str, params: &[SqlValue]) -> Result<QueryOutcome> {
        let _call = self.buffer.begin_call()?;
        self.buffer.store(STATUS_SLOT, STATUS_PENDING);
        self.send(BridgeRequest::SqlRequest {
            sql: sql.to_string(),
            params: params.to_vec(),
        })?;

        self.block_on(STATUS_SLOT, STATUS_PENDING)?;
        let status = self.buffer.load(STATUS_SLOT);
        let reply = BridgeReply::from_bytes(&self.buffer.read_payload())?;
        match (status, reply) {
            (STATUS_SUCCESS, reply @ BridgeReply::Rows(_)) => reply.into_result(),
            (STATUS_ERROR, reply @ BridgeReply::Failure(_)) => reply.into_result(),
            (status, _) => Err(SandboxError::protocol(format!(
                "reply does not match status {}",
                status
            ))),
        }
    }

    fn send(&self, request: BridgeRequest) -> Result<()> {
        self.requests
            .send(request)
            .map_err(|_| SandboxError::Terminated)
    }

    fn block_on(&self, slot: usize, pending: i32) -> Result<()> {
        match self.buffer.wait(slot, pending, self.timeout) {
            WaitOutcome::Ok | WaitOutcome::NotEqual => Ok(()),
            WaitOutcome::TimedOut => Err(SandboxError::BridgeTimeout {
                millis: self.timeout.map(|t| t.as_millis() as u64).unwrap_or_default(),
            }),
        }
    }
}
