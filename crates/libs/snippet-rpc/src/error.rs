use std::error::Error as StdError;
use std::io;

use thiserror::Error;

/// Error type returned by snippet handlers, constructors and shutdown hooks.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Errors produced while dispatching a single request.
///
/// Every variant is confined to the response of the request that caused it;
/// none of them terminates the session.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum RpcError {
    #[error("Unknown RPC: {method}")]
    UnknownMethod { method: String },

    #[error("Too many parameters specified: {method} accepts {accepted}, got {supplied}")]
    Arity { method: String, accepted: usize, supplied: usize },

    #[error("Argument {position} is not present")]
    MissingArgument { position: usize },

    #[error("Argument {position} should be of type {expected}, but is of type {actual}")]
    ArgumentType { position: usize, expected: String, actual: String },

    #[error("{method} requires capability level {required}, current level is {current}")]
    CapabilityGate { method: String, required: u32, current: u32 },

    #[error("{method} failed: {trace}")]
    InvocationFailure { method: String, trace: String },

    #[error("snippet dispatcher has been shut down")]
    ShutDown,

    #[error("cannot schedule {method}: {reason}")]
    Schedule { method: String, reason: String },
}

impl RpcError {
    /// Wraps a handler error, keeping its whole `source()` chain in the trace.
    pub fn invocation(method: impl Into<String>, error: &(dyn StdError + 'static)) -> Self {
        let mut trace = error.to_string();
        let mut source = error.source();
        while let Some(cause) = source {
            trace.push_str("\n  caused by: ");
            trace.push_str(&cause.to_string());
            source = cause.source();
        }
        Self::InvocationFailure { method: method.into(), trace }
    }

    /// Converts a boxed handler error, passing `RpcError`s through unchanged.
    pub fn from_handler(method: &str, error: BoxError) -> Self {
        match error.downcast::<RpcError>() {
            Ok(rpc_error) => *rpc_error,
            Err(other) => Self::invocation(method, other.as_ref()),
        }
    }

    /// Returns `true` when the client sent something the method cannot accept.
    pub fn is_argument_error(&self) -> bool {
        matches!(
            self,
            Self::Arity { .. } | Self::MissingArgument { .. } | Self::ArgumentType { .. }
        )
    }
}

/// Configuration errors found while building a [`crate::Registry`].
///
/// These are programming errors in the set of registered units and are meant
/// to abort startup.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum RegistryError {
    #[error(
        "An RPC with the name {method} is already known (units {first_unit} and {second_unit})"
    )]
    DuplicateMethod { method: String, first_unit: String, second_unit: String },

    #[error("snippet unit {unit} is registered twice")]
    DuplicateUnit { unit: String },

    #[error("{method} is a reserved control command and cannot be registered by {unit}")]
    ReservedName { method: String, unit: String },

    #[error("invalid default for parameter {position} of {method}: {message}")]
    InvalidDefault { method: String, position: usize, message: String },
}

/// Conditions that end a session.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SessionError {
    #[error("session {session_id}: malformed request: {message}")]
    Protocol { session_id: u64, message: String },

    #[error("session {session_id}: handshake rejected")]
    Handshake { session_id: u64 },

    #[error("session io error: {0}")]
    Io(#[from] io::Error),
}
