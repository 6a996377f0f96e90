pub mod engine;
pub mod worker;

use crate::error::{Result, SandboxError};
use crate::store::DumpStore;
use crate::types::{QueryOutcome, SqlValue};

pub use engine::DatabaseEngine;

/// Lifecycle of a database instance. `LoadFailed` is terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatabaseState {
    Uninitialized,
    Loading,
    Ready,
    Executing,
    LoadFailed(String),
}

/// A database engine bound to exactly one dump.
pub struct DatabaseInstance {
    state: DatabaseState,
    dump_id: Option<String>,
    engine: Option<DatabaseEngine>,
}

impl Default for DatabaseInstance {
    fn default() -> Self {
        Self::new()
    }
}

impl DatabaseInstance {
    pub fn new() -> Self {
        Self {
            state: DatabaseState::Uninitialized,
            dump_id: None,
            engine: None,
        }
    }

    pub fn state(&self) -> &DatabaseState {
        &self.state
    }

    pub fn dump_id(&self) -> Option<&str> {
        self.dump_id.as_deref()
    }

    /// Fetch `dump_id` and load it into a fresh engine. Only the first call loads;
    /// repeating it for the same dump is a no-op.
    pub fn initialize(&mut self, store: &dyn DumpStore, dump_id: &str) -> Result<()> {
        match &self.state {
            DatabaseState::Ready | DatabaseState::Executing => {
                return match self.dump_id.as_deref() {
                    Some(current) if current == dump_id => Ok(()),
                    current => Err(SandboxError::DumpLoad {
                        dump_id: dump_id.to_string(),
                        message: format!(
                            "instance already holds dump '{}'",
                            current.unwrap_or_default()
                        ),
                    }),
                };
            }
            DatabaseState::LoadFailed(message) => {
                return Err(SandboxError::DumpLoad {
                    dump_id: dump_id.to_string(),
                    message: message.clone(),
                });
            }
            DatabaseState::Uninitialized | DatabaseState::Loading => {}
        }

        self.state = DatabaseState::Loading;
        self.dump_id = Some(dump_id.to_string());
        match Self::load(store, dump_id) {
            Ok(engine) => {
                self.engine = Some(engine);
                self.state = DatabaseState::Ready;
                tracing::info!(dump_id, "database dump loaded");
                Ok(())
            }
            Err(err) => {
                self.engine = None;
                let message = match &err {
                    SandboxError::DumpLoad { message, .. } => message.clone(),
                    other => other.to_string(),
                };
                self.state = DatabaseState::LoadFailed(message.clone());
                tracing::warn!(dump_id, error = %message, "database dump failed to load");
                Err(SandboxError::DumpLoad {
                    dump_id: dump_id.to_string(),
                    message,
                })
            }
        }
    }

    fn load(store: &dyn DumpStore, dump_id: &str) -> Result<DatabaseEngine> {
        let sql = store.fetch_dump(dump_id).map_err(|e| SandboxError::DumpLoad {
            dump_id: dump_id.to_string(),
            message: format!("{:#}", e),
        })?;
        tracing::debug!(dump_id, bytes = sql.len(), "executing database dump");
        let engine = DatabaseEngine::open()?;
        engine.load_dump(dump_id, &sql)?;
        Ok(engine)
    }

    pub fn query(&mut self, sql: &str, params: &[SqlValue]) -> Result<QueryOutcome> {
        match &self.state {
            DatabaseState::Ready => {}
            DatabaseState::LoadFailed(message) => {
                return Err(SandboxError::Query {
                    message: format!("database failed to load: {}", message),
                })
            }
            _ => {
                return Err(SandboxError::Query {
                    message: "database is not initialized".to_string(),
                })
            }
        }
        let engine = self.engine.as_ref().ok_or_else(|| SandboxError::Query {
            message: "database is not initialized".to_string(),
        })?;

        self.state = DatabaseState::Executing;
        let outcome = engine.query(sql, params);
        self.state = DatabaseState::Ready;
        outcome
    }
}
