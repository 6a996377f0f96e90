//! Per-session entry point: owns the active problem and its sandbox.

use std::sync::Arc;

use crate::config::SandboxConfig;
use crate::error::{Result, SandboxError};
use crate::grading::{self, Verdict};
use crate::protocol::{WorkerRequest, WorkerResponse};
use crate::sandbox::SandboxInstance;
use crate::store::{DumpStore, ProblemCatalog};
use crate::types::{ExecutionRequest, ExecutionResult, Mode, Problem};

pub struct Coordinator {
    config: SandboxConfig,
    dumps: Arc<dyn DumpStore>,
    problem: Option<Problem>,
    sandbox: Option<SandboxInstance>,
    next_call_id: u64,
}

impl Coordinator {
    pub fn new(config: SandboxConfig, dumps: Arc<dyn DumpStore>) -> Self {
        Self {
            config,
            dumps,
            problem: None,
            sandbox: None,
            next_call_id: 1,
        }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    pub fn problem(&self) -> Option<&Problem> {
        self.problem.as_ref()
    }

    /// Whether a live sandbox currently backs the session.
    pub fn has_sandbox(&self) -> bool {
        self.sandbox.is_some()
    }

    /// Make `problem` the active one. A different problem always gets a new
    /// sandbox; reopening the same problem keeps the current one.
    pub fn open_problem(&mut self, problem: Problem) {
        let same = self.problem.as_ref() == Some(&problem);
        if !same {
            self.discard_sandbox("problem switched");
            tracing::info!(problem_id = problem.id, mode = ?problem.mode, "problem opened");
        }
        self.problem = Some(problem);
    }

    pub fn load_problem(&mut self, catalog: &dyn ProblemCatalog, id: u64) -> Result<&Problem> {
        let problem = catalog.fetch_problem(id).map_err(|e| SandboxError::Store {
            operation: "fetch_problem".to_string(),
            reason: format!("{:#}", e),
        })?;
        self.open_problem(problem);
        self.problem.as_ref().ok_or_else(|| SandboxError::Store {
            operation: "fetch_problem".to_string(),
            reason: format!("problem {} missing after load", id),
        })
    }

    /// Execute `code` against the active problem.
    pub async fn run(&mut self, code: &str) -> Result<ExecutionResult> {
        let problem = self.problem.clone().ok_or_else(|| SandboxError::Config {
            reason: "no problem is open".to_string(),
        })?;

        let request = problem.request(code);
        let outcome = match self.config.execution_timeout() {
            Some(limit) => {
                let outcome = tokio::time::timeout(limit, self.execute(&problem, &request)).await;
                match outcome {
                    Ok(outcome) => outcome,
                    Err(_) => Err(SandboxError::Timeout {
                        millis: limit.as_millis() as u64,
                    }),
                }
            }
            None => self.execute(&problem, &request).await,
        };

        if let Err(err) = &outcome {
            let discard = err.is_fatal()
                || (problem.mode == Mode::Python
                    && self.config.discard_python_after_error
                    && matches!(err, SandboxError::Interpreter { .. }));
            if discard {
                tracing::warn!(problem_id = problem.id, error = %err, "discarding sandbox");
                self.discard_sandbox("execution failed");
            } else {
                tracing::debug!(problem_id = problem.id, error = %err, "execution failed");
            }
        }
        outcome
    }

    /// Like [`Coordinator::run`], with failures folded into an error result.
    pub async fn run_to_result(&mut self, code: &str) -> ExecutionResult {
        match self.run(code).await {
            Ok(result) => result,
            Err(err) => ExecutionResult::failure(&err),
        }
    }

    /// Run `code` and grade it. A failed run is an incorrect submission and
    /// its error is returned as is.
    pub async fn submit(&mut self, code: &str) -> Result<bool> {
        match self.run(code).await {
            Ok(result) => Ok(self.grade(result)?.is_correct),
            Err(err) => {
                tracing::info!(error = %err, "submission rejected");
                Err(err)
            }
        }
    }

    /// Like [`Coordinator::submit`], keeping the graded result. A failed run
    /// yields an incorrect verdict carrying the error message.
    pub async fn submit_to_verdict(&mut self, code: &str) -> Result<Verdict> {
        let result = self.run_to_result(code).await;
        self.grade(result)
    }

    fn grade(&self, result: ExecutionResult) -> Result<Verdict> {
        let problem = self.problem.as_ref().ok_or_else(|| SandboxError::Config {
            reason: "no problem is open".to_string(),
        })?;
        let verdict = grading::grade(problem.mode, result, problem.solution_hash.as_deref());
        tracing::info!(
            problem_id = problem.id,
            is_correct = verdict.is_correct,
            "submission graded"
        );
        Ok(verdict)
    }

    /// Terminate the sandbox and forget the active problem.
    pub fn close(&mut self) {
        self.discard_sandbox("session closed");
        self.problem = None;
    }

    async fn execute(
        &mut self,
        problem: &Problem,
        request: &ExecutionRequest,
    ) -> Result<ExecutionResult> {
        if self.sandbox.is_none() {
            let sandbox = SandboxInstance::create(problem, &self.config, Arc::clone(&self.dumps))?;
            self.sandbox = Some(sandbox);
        }
        match request.mode {
            Mode::Sql => self.execute_sql(request, problem.golden.clone()).await,
            Mode::Python => self.execute_python(request).await,
        }
    }

    async fn execute_sql(
        &mut self,
        request: &ExecutionRequest,
        golden: Option<String>,
    ) -> Result<ExecutionResult> {
        let needs_init = !self.sandbox_ref()?.is_initialized();
        if needs_init {
            let call_id = self.call_id();
            let init = WorkerRequest::Initialize {
                dump_id: request.database_dump_id.clone(),
            };
            match self.sandbox_ref()?.context().call(call_id, init).await? {
                WorkerResponse::DumpLoaded { .. } => {
                    if let Some(sandbox) = self.sandbox.as_mut() {
                        sandbox.mark_initialized();
                    }
                }
                response => return Err(unexpected_or_dump_error(response)),
            }
        }

        let call_id = self.call_id();
        let query = WorkerRequest::ExecuteQuery {
            sql: request.source_code.clone(),
            golden,
        };
        match self.sandbox_ref()?.context().call(call_id, query).await? {
            WorkerResponse::QueryResult { result, golden } => {
                let mut result = ExecutionResult::from_query(result);
                result.expected = golden;
                Ok(result)
            }
            WorkerResponse::QueryError { message } => Err(SandboxError::Query { message }),
            response => Err(unexpected_or_dump_error(response)),
        }
    }

    async fn execute_python(&mut self, request: &ExecutionRequest) -> Result<ExecutionResult> {
        let call_id = self.call_id();
        let execution = WorkerRequest::ExecutePython {
            code: request.source_code.clone(),
            dump_id: request.database_dump_id.clone(),
            env: request.env.clone(),
            files: request.aux_files.clone(),
        };
        match self.sandbox_ref()?.context().call(call_id, execution).await? {
            WorkerResponse::PythonResult { stdout } => Ok(ExecutionResult::from_stdout(stdout)),
            WorkerResponse::PythonError { message, stdout } => {
                Err(SandboxError::Interpreter { message, stdout })
            }
            response => Err(unexpected_or_dump_error(response)),
        }
    }

    fn sandbox_ref(&self) -> Result<&SandboxInstance> {
        self.sandbox.as_ref().ok_or(SandboxError::Terminated)
    }

    fn call_id(&mut self) -> u64 {
        let id = self.next_call_id;
        self.next_call_id += 1;
        id
    }

    fn discard_sandbox(&mut self, reason: &str) {
        if let Some(mut sandbox) = self.sandbox.take() {
            tracing::info!(problem_id = sandbox.problem_id(), reason, "sandbox discarded");
            sandbox.terminate();
        }
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        self.discard_sandbox("coordinator dropped");
    }
}

fn unexpected_or_dump_error(response: WorkerResponse) -> SandboxError {
    match response {
        WorkerResponse::DumpLoadError { dump_id, message } => SandboxError::DumpLoad { dump_id, message },
        other => SandboxError::protocol(format!("unexpected {} response", other.name())),
    }
}
