/// querybox error types and classification helpers
/// Main error type for sandbox operations
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SandboxError {
    /// Dump could not be fetched or executed; the sandbox must be discarded
    #[error("Failed to load database dump '{dump_id}': {message}")]
    DumpLoad { dump_id: String, message: String },
    /// Statement failed inside the engine; the sandbox stays usable
    #[error("{message}")]
    Query { message: String },
    /// Guest code raised; `stdout` holds whatever was captured before the failure
    #[error("{message}")]
    Interpreter { message: String, stdout: String },
    /// Bridge reply did not fit into the shared transfer buffer
    #[error("Result too large for buffer: {size} bytes (capacity {capacity} bytes)")]
    BufferOverflow { size: usize, capacity: usize },
    /// Guest connect() arguments differ from the expected credentials
    #[error("connection to server failed: {field} does not match")]
    CredentialMismatch { field: String },
    /// Isolated context was terminated while the call was in flight
    #[error("Sandbox terminated before the call completed")]
    Terminated,
    /// Caller-side execution deadline expired
    #[error("Execution timed out after {millis} ms")]
    Timeout { millis: u64 },
    /// Bridge wait deadline expired without a reply from the database worker
    #[error("Database worker did not answer within {millis} ms")]
    BridgeTimeout { millis: u64 },
    /// A second bridge call was issued while one was still in flight
    #[error("A bridge call is already in flight")]
    BridgeBusy,
    /// Message or payload violated the worker protocol
    #[error("Protocol error: {reason}")]
    Protocol { reason: String },
    /// Invalid configuration
    #[error("Configuration error: {reason}")]
    Config { reason: String },
    /// Collaborator store failure (dump or problem lookup)
    #[error("Store error in {operation}: {reason}")]
    Store { operation: String, reason: String },
}

impl SandboxError {
    /// Fatal errors invalidate the sandbox instance that produced them.
    pub fn is_fatal(&self) -> bool {
        match self {
            SandboxError::DumpLoad { .. } => true,
            SandboxError::Terminated => true,
            SandboxError::Timeout { .. } => true,
            SandboxError::BridgeTimeout { .. } => true,
            SandboxError::Protocol { .. } => true,
            SandboxError::BufferOverflow { .. } => false,
            SandboxError::Query { .. } => false,
            SandboxError::Interpreter { .. } => false,
            SandboxError::CredentialMismatch { .. } => false,
            SandboxError::BridgeBusy => false,
            SandboxError::Config { .. } => false,
            SandboxError::Store { .. } => false,
        }
    }

    /// Output captured before the failure, if any.
    pub fn partial_stdout(&self) -> Option<&str> {
        match self {
            SandboxError::Interpreter { stdout, .. } if !stdout.is_empty() => Some(stdout),
            _ => None,
        }
    }

    pub(crate) fn protocol(reason: impl Into<String>) -> Self {
        SandboxError::Protocol {
            reason: reason.into(),
        }
    }
}

pub type Result<T, E = SandboxError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dump_error_display() {
        let err = SandboxError::DumpLoad {
            dump_id: "northwind".to_string(),
            message: "near \"CREAT\": syntax error".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("northwind"));
        assert!(msg.contains("syntax error"));
    }

    #[test]
    fn test_query_error_is_verbatim() {
        let err = SandboxError::Query {
            message: "no such table: t".to_string(),
        };
        assert_eq!(err.to_string(), "no such table: t");
    }

    #[test]
    fn test_fatal_detection() {
        assert!(SandboxError::DumpLoad {
            dump_id: "x".into(),
            message: "boom".into()
        }
        .is_fatal());
        assert!(SandboxError::Terminated.is_fatal());
        assert!(!SandboxError::Query {
            message: "syntax".into()
        }
        .is_fatal());
        assert!(!SandboxError::CredentialMismatch {
            field: "user".into()
        }
        .is_fatal());
    }

    #[test]
    fn test_partial_stdout() {
        let err = SandboxError::Interpreter {
            message: "ZeroDivisionError".into(),
            stdout: "before\n".into(),
        };
        assert_eq!(err.partial_stdout(), Some("before\n"));
        assert_eq!(SandboxError::Terminated.partial_stdout(), None);
    }
}
