pub mod bridge;
pub mod config;
pub mod coordinator;
pub mod database;
pub mod error;
pub mod grading;
pub mod logging;
pub mod protocol;
pub mod python;
pub mod sandbox;
pub mod store;
pub mod types;

pub use config::SandboxConfig;
pub use coordinator::Coordinator;
pub use error::{Result, SandboxError};
pub use grading::Verdict;
pub use store::{DirectoryDumpStore, DumpStore, MemoryCatalog, MemoryDumpStore, ProblemCatalog};
pub use types::{ExecutionRequest, ExecutionResult, ExecutionStatus, Field, Mode, Problem, QueryOutcome, SqlValue};
