//! Snippet units every dispatcher serves: event retrieval and delayed calls.

mod event;
mod schedule;

pub use event::{event_unit, EventSnippet, EventTimeout, EVENT_SNIPPET};
pub use schedule::{schedule_unit, ScheduleRpcSnippet, SCHEDULE_RPC_SNIPPET};

use crate::registry::SnippetUnit;

/// The built-in units, to be registered alongside the host's own.
pub fn builtin_units() -> Vec<SnippetUnit> {
    vec![event_unit(), schedule_unit()]
}
