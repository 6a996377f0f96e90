//! Embedded interpreter for Python-mode problems.
//!
//! One [`PythonSandbox`] lives on the interpreter thread of a sandbox. Every
//! execution gets a fresh global scope, its own shim instance and a freshly
//! loaded database reached through the sync bridge.

pub mod driver;
mod shim;

use rustpython_vm::{
    builtins::PyBaseExceptionRef,
    compiler::Mode,
    signal::{user_signal_channel, UserSignalSender},
    AsObject, Interpreter, VirtualMachine,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::bridge::{DatabaseSubWorker, SharedTransferBuffer, SyncBridge};
use crate::config::SandboxConfig;
use crate::database::worker::dump_failure_message;
use crate::error::{Result, SandboxError};
use crate::protocol::{Envelope, WorkerRequest, WorkerResponse};
use crate::sandbox::{Inbox, MessagePort};
use crate::store::DumpStore;

pub use driver::{BridgedDriver, DatabaseDriver, DirectDriver};
use shim::{CapturedOutput, ExecutionGuard};

/// Pause between interrupts while a terminated sandbox is still running guest code.
const INTERRUPT_INTERVAL: Duration = Duration::from_millis(20);

pub struct PythonSandbox {
    interpreter: Interpreter,
    interrupts: UserSignalSender,
}

impl PythonSandbox {
    pub fn build(config: &SandboxConfig) -> Self {
        let mut settings = rustpython_vm::Settings::default();
        for path in &config.python_path {
            if std::path::Path::new(path).is_dir() {
                settings.path_list.push(path.clone());
            }
        }
        let (interrupts, receiver) = user_signal_channel();
        let interpreter = Interpreter::with_init(settings, move |vm| {
            vm.add_native_modules(rustpython_stdlib::get_module_inits());
            vm.set_user_signal_channel(receiver);
        });
        tracing::debug!(paths = config.python_path.len(), "python interpreter ready");
        Self {
            interpreter,
            interrupts,
        }
    }

    /// Handle for stopping guest code from another thread.
    pub fn interrupter(&self) -> Interrupter {
        Interrupter {
            signals: self.interrupts.clone(),
        }
    }

    /// Run `code` to completion and return everything it printed.
    ///
    /// A fatal driver error (buffer overflow, lost bridge) fails the run even
    /// when guest code caught the exception raised for it.
    pub fn run(
        &self,
        code: &str,
        env: &BTreeMap<String, String>,
        files: &BTreeMap<String, String>,
        driver: Arc<dyn DatabaseDriver>,
    ) -> Result<String> {
        let output = CapturedOutput::default();
        let outcome = self
            .interpreter
            .enter(|vm| execute(vm, code, env, files, Arc::clone(&driver), &output));

        if let Some(fatal) = driver.take_fatal() {
            return Err(fatal);
        }
        outcome
    }
}

fn execute(
    vm: &VirtualMachine,
    source: &str,
    env: &BTreeMap<String, String>,
    files: &BTreeMap<String, String>,
    driver: Arc<dyn DatabaseDriver>,
    output: &CapturedOutput,
) -> Result<String> {
    let mut guard = ExecutionGuard::capture(vm, output);

    let shim = guard
        .current_import()
        .and_then(|original| shim::load(vm, driver, original, env, files))
        .map_err(|exc| guest_failure(vm, &exc, output))?;
    guard
        .install_import_hook(shim.import_hook)
        .and_then(|()| guard.install_open(shim.open))
        .map_err(|exc| guest_failure(vm, &exc, output))?;

    let code = vm
        .compile(source, Mode::Exec, "<string>".to_owned())
        .map_err(|err| {
            let stdout = output.snapshot();
            SandboxError::Interpreter {
                message: join_output(&stdout, &format!("SyntaxError: {}", err)),
                stdout,
            }
        })?;

    let scope = vm.new_scope_with_builtins();
    let _ = scope
        .globals
        .set_item("__name__", vm.ctx.new_str("__main__").into(), vm);

    match vm.run_code_obj(code, scope) {
        Ok(_) => Ok(output.snapshot()),
        Err(exc) => Err(guest_failure(vm, &exc, output)),
    }
}

/// Build the error for an exception escaping guest code: captured output
/// followed by the traceback.
fn guest_failure(vm: &VirtualMachine, exc: &PyBaseExceptionRef, output: &CapturedOutput) -> SandboxError {
    let stdout = output.snapshot();

    // Rendering the traceback is diagnostic only; fall back to the exception text.
    let mut traceback = String::new();
    if vm.write_exception(&mut traceback, exc).is_err() || traceback.trim().is_empty() {
        traceback = exc
            .as_object()
            .str(vm)
            .map(|s| s.as_str().to_owned())
            .unwrap_or_else(|_| "guest code raised an exception".to_string());
    }

    SandboxError::Interpreter {
        message: join_output(&stdout, traceback.trim_end()),
        stdout,
    }
}

fn join_output(stdout: &str, error: &str) -> String {
    if stdout.is_empty() {
        error.to_string()
    } else if stdout.ends_with('\n') {
        format!("{}{}", stdout, error)
    } else {
        format!("{}\n{}", stdout, error)
    }
}

/// Body of a Python-mode isolated context: interpreter, shared buffer and
/// database sub-worker all belong to this thread.
pub fn serve(inbox: Inbox, port: MessagePort, dumps: Arc<dyn DumpStore>, config: SandboxConfig) {
    let driver = match start_bridge(&config, dumps) {
        Ok(driver) => Arc::new(driver),
        Err(err) => {
            tracing::error!(error = %err, "python sandbox could not start");
            for Envelope { call_id, .. } in inbox {
                port.post(
                    call_id,
                    WorkerResponse::PythonError {
                        message: err.to_string(),
                        stdout: String::new(),
                    },
                );
            }
            return;
        }
    };
    let sandbox = PythonSandbox::build(&config);
    spawn_watchdog(port.clone(), sandbox.interrupter());

    for Envelope { call_id, message } in inbox {
        match message {
            WorkerRequest::ExecutePython {
                code,
                dump_id,
                env,
                files,
            } => {
                // Every execution starts from a freshly loaded dump.
                if let Err(err) = driver.bridge().initialize(&dump_id) {
                    port.post(
                        call_id,
                        WorkerResponse::DumpLoadError {
                            dump_id,
                            message: dump_failure_message(err),
                        },
                    );
                    continue;
                }
                port.post(call_id, WorkerResponse::DumpLoaded { dump_id });

                let response = match sandbox.run(&code, &env, &files, driver.clone()) {
                    Ok(stdout) => WorkerResponse::PythonResult { stdout },
                    Err(SandboxError::Interpreter { message, stdout }) => {
                        WorkerResponse::PythonError { message, stdout }
                    }
                    Err(other) => WorkerResponse::PythonError {
                        message: other.to_string(),
                        stdout: String::new(),
                    },
                };
                port.post(call_id, response);
            }
            WorkerRequest::Initialize { dump_id } => {
                let response = match driver.bridge().initialize(&dump_id) {
                    Ok(()) => WorkerResponse::DumpLoaded { dump_id },
                    Err(err) => WorkerResponse::DumpLoadError {
                        dump_id,
                        message: dump_failure_message(err),
                    },
                };
                port.post(call_id, response);
            }
            WorkerRequest::ExecuteQuery { .. } => {
                tracing::warn!(call_id, "SQL request sent to a python context");
                port.post(
                    call_id,
                    WorkerResponse::QueryError {
                        message: "this sandbox only executes Python".to_string(),
                    },
                );
            }
        }
    }
    tracing::debug!("python context inbox closed");
}

/// Cross-thread handle raising `KeyboardInterrupt` in the guest code of one
/// [`PythonSandbox`].
#[derive(Clone)]
pub struct Interrupter {
    signals: UserSignalSender,
}

impl Interrupter {
    /// Interrupt at the next bytecode instruction. Returns `false` once the
    /// interpreter is gone.
    pub fn interrupt(&self) -> bool {
        self.signals
            .send(Box::new(|vm: &VirtualMachine| {
                Err(vm.new_exception_msg(
                    vm.ctx.exceptions.keyboard_interrupt.to_owned(),
                    "execution cancelled".to_owned(),
                ))
            }))
            .is_ok()
    }
}

/// After termination, interrupt the guest repeatedly until the interpreter
/// is dropped. Guest code may catch one interrupt but not all of them.
fn spawn_watchdog(port: MessagePort, interrupter: Interrupter) {
    let spawned = std::thread::Builder::new()
        .name(format!("{}-watchdog", port.context()))
        .spawn(move || {
            port.wait_terminated();
            let mut sent = 0u32;
            while interrupter.interrupt() {
                sent += 1;
                std::thread::sleep(INTERRUPT_INTERVAL);
            }
            tracing::debug!(context = %port.context(), interrupts = sent, "python interpreter released");
        });
    if let Err(err) = spawned {
        tracing::warn!(error = %err, "interrupt watchdog could not start");
    }
}

fn start_bridge(config: &SandboxConfig, dumps: Arc<dyn DumpStore>) -> Result<BridgedDriver> {
    let buffer = Arc::new(SharedTransferBuffer::new(config.buffer_size)?);
    let worker = DatabaseSubWorker::spawn(Arc::clone(&buffer), dumps)?;
    let bridge = SyncBridge::new(buffer, worker.sender(), config.bridge_timeout());
    Ok(BridgedDriver::new(bridge))
}
