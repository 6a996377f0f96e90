//! Messages exchanged between the coordinator and an isolated context.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::types::QueryOutcome;

/// Request wrapped with the id of the call that issued it.
#[derive(Debug, Clone)]
pub struct Envelope<T> {
    pub call_id: u64,
    pub message: T,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerRequest {
    Initialize {
        dump_id: String,
    },
    ExecuteQuery {
        sql: String,
        #[serde(default)]
        golden: Option<String>,
    },
    ExecutePython {
        code: String,
        dump_id: String,
        #[serde(default)]
        env: BTreeMap<String, String>,
        #[serde(default)]
        files: BTreeMap<String, String>,
    },
}

impl WorkerRequest {
    pub fn kind(&self) -> RequestKind {
        match self {
            WorkerRequest::Initialize { .. } => RequestKind::Initialize,
            WorkerRequest::ExecuteQuery { .. } => RequestKind::ExecuteQuery,
            WorkerRequest::ExecutePython { .. } => RequestKind::ExecutePython,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Initialize,
    ExecuteQuery,
    ExecutePython,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerResponse {
    DumpLoaded {
        dump_id: String,
    },
    DumpLoadError {
        dump_id: String,
        message: String,
    },
    /// Database accepted the query; informational only.
    DbReady,
    QueryResult {
        result: QueryOutcome,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        golden: Option<QueryOutcome>,
    },
    QueryError {
        message: String,
    },
    PythonResult {
        stdout: String,
    },
    PythonError {
        message: String,
        #[serde(default)]
        stdout: String,
    },
}

impl WorkerResponse {
    /// Whether this message ends a call of the given kind. Anything else is a
    /// progress notice and the call keeps listening.
    pub fn settles(&self, kind: RequestKind) -> bool {
        match kind {
            RequestKind::Initialize => matches!(
                self,
                WorkerResponse::DumpLoaded { .. } | WorkerResponse::DumpLoadError { .. }
            ),
            RequestKind::ExecuteQuery => matches!(
                self,
                WorkerResponse::QueryResult { .. } | WorkerResponse::QueryError { .. }
            ),
            RequestKind::ExecutePython => matches!(
                self,
                WorkerResponse::PythonResult { .. }
                    | WorkerResponse::PythonError { .. }
                    | WorkerResponse::DumpLoadError { .. }
            ),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            WorkerResponse::DumpLoaded { .. } => "DUMP_LOADED",
            WorkerResponse::DumpLoadError { .. } => "DUMP_LOAD_ERROR",
            WorkerResponse::DbReady => "DB_READY",
            WorkerResponse::QueryResult { .. } => "QUERY_RESULT",
            WorkerResponse::QueryError { .. } => "QUERY_ERROR",
            WorkerResponse::PythonResult { .. } => "PYTHON_RESULT",
            WorkerResponse::PythonError { .. } => "PYTHON_ERROR",
        }
    }
}
