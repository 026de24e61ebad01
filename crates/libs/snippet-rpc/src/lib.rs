//! Line-delimited JSON-RPC dispatch for host-defined "snippet" methods.
//!
//! A [`Registry`] indexes the methods of every [`SnippetUnit`]. The
//! [`Dispatcher`] validates and converts arguments, builds snippet instances
//! lazily and runs handlers, optionally on a single coordinator thread. Async
//! methods report later through the shared [`EventCache`], which clients read
//! with the built-in `eventWaitAndGet` family. `scheduleRpc` re-enters the
//! dispatcher after a delay. [`SessionServer`] exposes all of it over TCP.

pub mod builtins;
pub mod codec;
mod coordinator;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod protocol;
pub mod registry;
mod scheduler;
pub mod server;
pub mod value;

pub use builtins::{builtin_units, EventSnippet, EventTimeout, ScheduleRpcSnippet};
pub use codec::{Codec, CodecError, ObjectConverter};
pub use coordinator::COORDINATOR_THREAD_NAME;
pub use dispatch::{Args, Call, Dispatcher, DispatcherBuilder, Invocation};
pub use error::{BoxError, RegistryError, RpcError, SessionError};
pub use events::{Event, EventCache, DEFAULT_QUEUE_CAPACITY, DEFAULT_WAIT_TIMEOUT};
pub use protocol::{RpcRequest, RpcResponse, PROTOCOL_MAJOR_VERSION, PROTOCOL_MINOR_VERSION};
pub use registry::{
    Affinity, CallKind, MethodDescriptor, MethodSpec, ParamSpec, Registry, Snippet,
    SnippetContext, SnippetUnit, UnitBuilder,
};
pub use scheduler::SCHEDULE_RPC_METHOD;
pub use server::{ServerOptions, SessionServer};
pub use value::{CustomValue, RpcValue, WireType};
