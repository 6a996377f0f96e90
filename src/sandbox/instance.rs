use std::sync::Arc;

use super::IsolatedContext;
use crate::config::SandboxConfig;
use crate::database;
use crate::error::Result;
use crate::python;
use crate::store::DumpStore;
use crate::types::{Mode, Problem};

/// A live isolated context bound to one problem and its dump.
///
/// Never reused across problems; it is terminated and replaced instead.
pub struct SandboxInstance {
    problem_id: u64,
    mode: Mode,
    dump_id: String,
    context: IsolatedContext,
    initialized: bool,
}

impl SandboxInstance {
    pub fn create(
        problem: &Problem,
        config: &SandboxConfig,
        dumps: Arc<dyn DumpStore>,
    ) -> Result<Self> {
        let context = match problem.mode {
            Mode::Sql => {
                let name = format!("querybox-sql-{}", problem.id);
                IsolatedContext::spawn(&name, move |inbox, port| {
                    database::worker::serve(inbox, port, dumps)
                })?
            }
            Mode::Python => {
                let name = format!("querybox-python-{}", problem.id);
                let config = config.clone();
                IsolatedContext::spawn(&name, move |inbox, port| {
                    python::serve(inbox, port, dumps, config)
                })?
            }
        };

        tracing::info!(
            problem_id = problem.id,
            mode = ?problem.mode,
            dump_id = %problem.database_dump_id,
            "sandbox created"
        );
        Ok(Self {
            problem_id: problem.id,
            mode: problem.mode,
            dump_id: problem.database_dump_id.clone(),
            context,
            initialized: false,
        })
    }

    pub fn problem_id(&self) -> u64 {
        self.problem_id
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn dump_id(&self) -> &str {
        &self.dump_id
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub(crate) fn mark_initialized(&mut self) {
        self.initialized = true;
    }

    pub fn context(&self) -> &IsolatedContext {
        &self.context
    }

    pub fn is_terminated(&self) -> bool {
        self.context.is_terminated()
    }

    /// Whether every thread of the sandbox has stopped running guest work.
    pub fn is_finished(&self) -> bool {
        self.context.is_finished()
    }

    pub fn terminate(&mut self) {
        tracing::info!(problem_id = self.problem_id, "terminating sandbox");
        self.context.terminate();
    }
}
