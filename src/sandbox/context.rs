//! An isolated execution context: one named OS thread owning its engine,
//! reachable only through messages.
//!
//! Requests go in over a channel. Responses come back through a
//! [`MessagePort`] that routes each message to the listener registered for
//! its call id. A listener is removed as soon as its call settles, or when the
//! awaiting future is dropped.

use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use crate::error::{Result, SandboxError};
use crate::protocol::{Envelope, WorkerRequest, WorkerResponse};

pub type Inbox = Receiver<Envelope<WorkerRequest>>;

#[derive(Default)]
struct Listeners {
    terminated: AtomicBool,
    slots: Mutex<HashMap<u64, UnboundedSender<WorkerResponse>>>,
    shut: Condvar,
}

impl Listeners {
    fn shut_down(&self) {
        let mut slots = self.slots.lock();
        self.terminated.store(true, Ordering::SeqCst);
        slots.clear();
        self.shut.notify_all();
    }

    fn wait_shut_down(&self) {
        let mut slots = self.slots.lock();
        while !self.terminated.load(Ordering::SeqCst) {
            self.shut.wait(&mut slots);
        }
    }
}

/// Outbound side handed to the context's thread.
#[derive(Clone)]
pub struct MessagePort {
    context: Arc<str>,
    listeners: Arc<Listeners>,
}

impl MessagePort {
    pub fn context(&self) -> &str {
        &self.context
    }

    pub fn is_terminated(&self) -> bool {
        self.listeners.terminated.load(Ordering::SeqCst)
    }

    /// Block until the owning context is terminated or its thread has ended.
    pub fn wait_terminated(&self) {
        self.listeners.wait_shut_down();
    }

    pub fn post(&self, call_id: u64, message: WorkerResponse) {
        if self.is_terminated() {
            tracing::trace!(context = %self.context, call_id, kind = message.name(), "dropped after termination");
            return;
        }
        let slots = self.listeners.slots.lock();
        match slots.get(&call_id) {
            Some(listener) => {
                tracing::debug!(context = %self.context, call_id, kind = message.name(), "posting message");
                let _ = listener.send(message);
            }
            None => {
                tracing::debug!(context = %self.context, call_id, kind = message.name(), "no listener for message");
            }
        }
    }
}

/// Receives the messages of one call. Deregisters itself on drop.
pub struct Listener {
    call_id: u64,
    rx: UnboundedReceiver<WorkerResponse>,
    listeners: Arc<Listeners>,
}

impl Listener {
    /// Next message for this call, or `None` once the context is gone.
    pub async fn next(&mut self) -> Option<WorkerResponse> {
        self.rx.recv().await
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.listeners.slots.lock().remove(&self.call_id);
    }
}

pub struct IsolatedContext {
    name: Arc<str>,
    requests: Option<Sender<Envelope<WorkerRequest>>>,
    listeners: Arc<Listeners>,
    thread: Option<JoinHandle<()>>,
}

impl IsolatedContext {
    /// Start a context whose thread runs `body` until its inbox closes.
    pub fn spawn<F>(name: &str, body: F) -> Result<Self>
    where
        F: FnOnce(Inbox, MessagePort) + Send + 'static,
    {
        let name: Arc<str> = Arc::from(name);
        let (requests, inbox) = mpsc::channel();
        let listeners = Arc::new(Listeners::default());
        let port = MessagePort {
            context: Arc::clone(&name),
            listeners: Arc::clone(&listeners),
        };

        let thread_name = name.to_string();
        let thread = std::thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                let guard_listeners = Arc::clone(&port.listeners);
                if catch_unwind(AssertUnwindSafe(|| body(inbox, port))).is_err() {
                    tracing::error!(context = %thread_name, "context thread panicked");
                }
                // Whatever is still waiting can no longer be answered.
                guard_listeners.shut_down();
            })
            .map_err(|e| SandboxError::Config {
                reason: format!("failed to spawn context thread {}: {}", name, e),
            })?;

        tracing::info!(context = %name, "isolated context started");
        Ok(Self {
            name,
            requests: Some(requests),
            listeners,
            thread: Some(thread),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_terminated(&self) -> bool {
        self.listeners.terminated.load(Ordering::SeqCst)
    }

    /// Whether the context's thread has run to completion.
    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Register a listener for `call_id`. Must happen before the request is posted.
    pub fn listen(&self, call_id: u64) -> Result<Listener> {
        if self.is_terminated() {
            return Err(SandboxError::Terminated);
        }
        let (tx, rx) = unbounded_channel();
        self.listeners.slots.lock().insert(call_id, tx);
        Ok(Listener {
            call_id,
            rx,
            listeners: Arc::clone(&self.listeners),
        })
    }

    pub fn post(&self, call_id: u64, message: WorkerRequest) -> Result<()> {
        let requests = self.requests.as_ref().ok_or(SandboxError::Terminated)?;
        requests
            .send(Envelope { call_id, message })
            .map_err(|_| SandboxError::Terminated)
    }

    /// Post `request` and wait for the message that settles it. Progress
    /// messages in between are logged and skipped.
    pub async fn call(&self, call_id: u64, request: WorkerRequest) -> Result<WorkerResponse> {
        let kind = request.kind();
        let mut listener = self.listen(call_id)?;
        self.post(call_id, request)?;

        loop {
            let message = listener.next().await.ok_or(SandboxError::Terminated)?;
            if message.settles(kind) {
                return Ok(message);
            }
            tracing::debug!(context = %self.name, call_id, kind = message.name(), "progress message");
        }
    }

    /// Abandon the context. In-flight calls fail with [`SandboxError::Terminated`]
    /// and nothing the thread posts afterwards is delivered.
    pub fn terminate(&mut self) {
        if self.requests.is_none() {
            return;
        }
        // The thread exits once its current job ends and it sees the closed
        // inbox. Bodies that run guest code watch for the shutdown to cut the job short.
        self.listeners.shut_down();
        self.requests = None;
        tracing::info!(context = %self.name, "isolated context terminated");
    }
}

impl Drop for IsolatedContext {
    fn drop(&mut self) {
        self.terminate();
    }
}
