//! Body of a SQL-mode isolated context.

use std::sync::Arc;

use super::DatabaseInstance;
use crate::error::SandboxError;
use crate::protocol::{Envelope, WorkerRequest, WorkerResponse};
use crate::sandbox::{Inbox, MessagePort};
use crate::store::DumpStore;
use crate::types::QueryOutcome;

/// Serve requests until the inbox closes. The context owns exactly one
/// database, loaded by the first `INITIALIZE`.
pub fn serve(inbox: Inbox, port: MessagePort, dumps: Arc<dyn DumpStore>) {
    let mut db = DatabaseInstance::new();

    for Envelope { call_id, message } in inbox {
        match message {
            WorkerRequest::Initialize { dump_id } => {
                let response = match db.initialize(dumps.as_ref(), &dump_id) {
                    Ok(()) => WorkerResponse::DumpLoaded { dump_id },
                    Err(err) => WorkerResponse::DumpLoadError {
                        dump_id,
                        message: dump_failure_message(err),
                    },
                };
                port.post(call_id, response);
            }
            WorkerRequest::ExecuteQuery { sql, golden } => {
                port.post(call_id, WorkerResponse::DbReady);
                let response = match db.query(&sql, &[]) {
                    Ok(result) => WorkerResponse::QueryResult {
                        result,
                        golden: golden.and_then(|golden| run_golden(&mut db, &golden)),
                    },
                    Err(err) => WorkerResponse::QueryError {
                        message: err.to_string(),
                    },
                };
                port.post(call_id, response);
            }
            WorkerRequest::ExecutePython { .. } => {
                tracing::warn!(call_id, "python request sent to a SQL context");
                port.post(
                    call_id,
                    WorkerResponse::PythonError {
                        message: "this sandbox only executes SQL".to_string(),
                        stdout: String::new(),
                    },
                );
            }
        }
    }
    tracing::debug!("SQL context inbox closed");
}

fn run_golden(db: &mut DatabaseInstance, golden: &str) -> Option<QueryOutcome> {
    match db.query(golden, &[]) {
        Ok(outcome) => Some(outcome),
        Err(err) => {
            tracing::warn!(error = %err, "golden query failed");
            None
        }
    }
}

pub(crate) fn dump_failure_message(err: SandboxError) -> String {
    match err {
        SandboxError::DumpLoad { message, .. } => message,
        other => other.to_string(),
    }
}
