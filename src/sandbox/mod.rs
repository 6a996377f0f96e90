pub mod context;
pub mod instance;

pub use context::{Inbox, IsolatedContext, Listener, MessagePort};
pub use instance::SandboxInstance;
