//! Database sub-worker answering the interpreter's blocking bridge calls.

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;

use super::buffer::{SharedTransferBuffer, STATUS_ERROR, STATUS_SUCCESS};
use super::{BridgeReply, BridgeRequest};
use crate::database::DatabaseInstance;
use crate::error::{Result, SandboxError};
use crate::store::DumpStore;

pub struct DatabaseSubWorker {
    requests: Sender<BridgeRequest>,
}

impl DatabaseSubWorker {
    /// Start the worker thread. It lives until every request sender is dropped.
    pub fn spawn(buffer: Arc<SharedTransferBuffer>, dumps: Arc<dyn DumpStore>) -> Result<Self> {
        let (requests, inbox) = mpsc::channel();
        std::thread::Builder::new()
            .name("querybox-db-bridge".to_string())
            .spawn(move || serve(inbox, buffer, dumps))
            .map_err(|e| SandboxError::Config {
                reason: format!("failed to spawn database worker: {}", e),
            })?;
        Ok(Self { requests })
    }

    pub fn sender(&self) -> Sender<BridgeRequest> {
        self.requests.clone()
    }
}

fn serve(inbox: Receiver<BridgeRequest>, buffer: Arc<SharedTransferBuffer>, dumps: Arc<dyn DumpStore>) {
    let mut db = DatabaseInstance::new();

    for request in inbox {
        match request {
            BridgeRequest::SqlInit { dump_id } => {
                db = DatabaseInstance::new();
                let outcome = db.initialize(dumps.as_ref(), &dump_id);
                buffer.signal_init(outcome.as_ref().map(|_| ()));
            }
            BridgeRequest::SqlRequest { sql, params } => {
                tracing::debug!(sql = %sql, params = params.len(), "bridge query");
                let (status, payload) = match db.query(&sql, &params) {
                    Ok(outcome) => (STATUS_SUCCESS, BridgeReply::Rows(outcome).to_bytes()),
                    Err(err) => (STATUS_ERROR, BridgeReply::from_error(&err).to_bytes()),
                };
                if let Err(err) = buffer.publish(status, &payload) {
                    tracing::warn!(error = %err, "bridge reply rejected");
                }
            }
        }
    }
    tracing::debug!("database bridge worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::SyncBridge;
    use crate::store::MemoryDumpStore;
    use crate::types::SqlValue;
    use std::time::Duration;

    fn bridge(size: usize) -> (SyncBridge, DatabaseSubWorker) {
        let buffer = Arc::new(SharedTransferBuffer::new(size).unwrap());
        let dumps: Arc<dyn DumpStore> = Arc::new(
            MemoryDumpStore::new()
                .with("t", "CREATE TABLE t(x int, s text); INSERT INTO t VALUES (1, 'a'), (2, 'b');")
                .with("broken", "INSERT INTO nowhere VALUES (1);"),
        );
        let worker = DatabaseSubWorker::spawn(Arc::clone(&buffer), dumps).unwrap();
        let bridge = SyncBridge::new(buffer, worker.sender(), Some(Duration::from_secs(5)));
        (bridge, worker)
    }

    #[test]
    fn test_blocking_query_round_trip() {
        let (bridge, _worker) = bridge(4096);
        bridge.initialize("t").unwrap();
        let outcome = bridge
            .call("SELECT s FROM t WHERE x = ?1", &[SqlValue::Integer(2)])
            .unwrap();
        assert_eq!(outcome.rows, vec![vec![SqlValue::Text("b".into())]]);
    }

    #[test]
    fn test_engine_error_reaches_caller() {
        let (bridge, _worker) = bridge(4096);
        bridge.initialize("t").unwrap();
        let err = bridge.call("SELECT nope FROM t", &[]).unwrap_err();
        assert_eq!(
            err,
            SandboxError::Query {
                message: "no such column: nope".into()
            }
        );
        assert!(bridge.call("SELECT 1", &[]).is_ok());
    }

    #[test]
    fn test_oversized_result_is_buffer_overflow() {
        let (bridge, _worker) = bridge(256);
        bridge.initialize("t").unwrap();
        let err = bridge
            .call("WITH RECURSIVE n(i) AS (SELECT 1 UNION ALL SELECT i + 1 FROM n WHERE i < 500) SELECT i FROM n", &[])
            .unwrap_err();
        assert!(matches!(err, SandboxError::BufferOverflow { capacity: 248, .. }));
    }

    #[test]
    fn test_failed_init_is_dump_error() {
        let (bridge, _worker) = bridge(4096);
        let err = bridge.initialize("broken").unwrap_err();
        assert!(matches!(err, SandboxError::DumpLoad { ref dump_id, .. } if dump_id == "broken"));
    }

    #[test]
    fn test_reinitialize_gives_fresh_database() {
        let (bridge, _worker) = bridge(4096);
        bridge.initialize("t").unwrap();
        bridge.call("DELETE FROM t", &[]).unwrap();
        bridge.initialize("t").unwrap();
        let outcome = bridge.call("SELECT count(*) FROM t", &[]).unwrap();
        assert_eq!(outcome.rows, vec![vec![SqlValue::Integer(2)]]);
    }
}
