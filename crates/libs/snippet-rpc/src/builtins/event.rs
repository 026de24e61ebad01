use std::sync::Arc;
use std::time::Duration;

use serde_json::Value as JsonValue;
use thiserror::Error;

use crate::dispatch::Call;
use crate::error::{BoxError, RpcError};
use crate::events::EventCache;
use crate::registry::{MethodSpec, ParamSpec, Snippet, SnippetContext, SnippetUnit};
use crate::value::{RpcValue, WireType};

pub const EVENT_SNIPPET: &str = "EventSnippet";

/// Raised when no matching event arrives in time.
#[derive(Debug, Error)]
#[error("timeout.")]
pub struct EventTimeout;

/// Read side of the event cache for clients.
#[derive(Debug)]
pub struct EventSnippet {
    events: Arc<EventCache>,
}

impl EventSnippet {
    pub fn new(events: Arc<EventCache>) -> Self {
        Self { events }
    }

    fn timeout(call: &Call) -> Result<Option<Duration>, RpcError> {
        let millis = call.args().opt_long(2)?;
        Ok(millis.map(|ms| Duration::from_millis(u64::try_from(ms).unwrap_or(0))))
    }

    fn wait(&self, call: &Call) -> Result<(), BoxError> {
        let args = call.args();
        let timeout = Self::timeout(call)?;
        self.events.peek(args.str(0)?, args.str(1)?, timeout).ok_or(EventTimeout)?;
        Ok(())
    }

    fn wait_and_get(&self, call: &Call) -> Result<JsonValue, BoxError> {
        let args = call.args();
        let timeout = Self::timeout(call)?;
        let event = self.events.wait(args.str(0)?, args.str(1)?, timeout).ok_or(EventTimeout)?;
        Ok(event.to_json())
    }

    fn get_all(&self, call: &Call) -> Result<RpcValue, RpcError> {
        let args = call.args();
        let events = self.events.get_all(args.str(0)?, args.str(1)?);
        Ok(RpcValue::list(events.iter().map(|event| event.to_json())))
    }
}

impl Snippet for EventSnippet {
    fn shutdown(&self) -> Result<(), BoxError> {
        self.events.clear_all();
        Ok(())
    }
}

fn event_params(spec: MethodSpec) -> MethodSpec {
    spec.param(ParamSpec::required("callbackId", WireType::String))
        .param(ParamSpec::required("eventName", WireType::String))
}

pub fn event_unit() -> SnippetUnit {
    SnippetUnit::builder(EVENT_SNIPPET, |context: &SnippetContext| {
        Ok(EventSnippet::new(Arc::clone(context.events())))
    })
    .rpc(
        event_params(MethodSpec::rpc("eventWait"))
            .param(ParamSpec::optional("timeout", WireType::Long))
            .description("Blocks until an event arrives, leaving it queued."),
        EventSnippet::wait,
    )
    .rpc(
        event_params(MethodSpec::rpc("eventWaitAndGet"))
            .param(ParamSpec::optional("timeout", WireType::Long))
            .returns(WireType::Object)
            .description("Blocks until an event arrives, then removes and returns it."),
        EventSnippet::wait_and_get,
    )
    .rpc(
        event_params(MethodSpec::rpc("eventGetAll"))
            .returns(WireType::array(WireType::Object))
            .description("Removes and returns every queued event, oldest first."),
        EventSnippet::get_all,
    )
    .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::Dispatcher;
    use crate::events::Event;
    use crate::registry::Registry;
    use serde_json::json;
    use std::time::Instant;

    fn dispatcher() -> Arc<Dispatcher> {
        let registry = Registry::build([event_unit()]).expect("registry");
        Dispatcher::builder(registry).build().expect("dispatcher")
    }

    #[test]
    fn wait_and_get_returns_the_event_json() {
        let dispatcher = dispatcher();
        dispatcher.events().post(Event::new("1-1", "Greeted").with("who", "sam"));
        let invocation = dispatcher
            .invoke(1, 2, "eventWaitAndGet", &[json!("1-1"), json!("Greeted"), json!(100)])
            .expect("event");
        assert_eq!(invocation.result["callbackId"], json!("1-1"));
        assert_eq!(invocation.result["data"], json!({ "who": "sam" }));
        assert_eq!(dispatcher.events().pending("1-1", "Greeted"), 0);
    }

    #[test]
    fn waits_report_timeout_as_an_error() {
        let dispatcher = dispatcher();
        let err = dispatcher
            .invoke(1, 2, "eventWaitAndGet", &[json!("1-1"), json!("Never"), json!(10)])
            .expect_err("timeout");
        assert_eq!(err.to_string(), "eventWaitAndGet failed: timeout.");
        let err = dispatcher
            .invoke(1, 3, "eventWait", &[json!("1-1"), json!("Never"), json!(0)])
            .expect_err("timeout");
        assert_eq!(err.to_string(), "eventWait failed: timeout.");
    }

    #[test]
    fn waits_without_a_timeout_use_the_cache_default() {
        let events = Arc::new(EventCache::with_limits(16, Duration::from_millis(30)));
        let registry = Registry::build([event_unit()]).expect("registry");
        let dispatcher = Dispatcher::builder(registry).events(events).build().expect("dispatcher");

        let started = Instant::now();
        let err = dispatcher
            .invoke(1, 2, "eventWaitAndGet", &[json!("1-1"), json!("Never")])
            .expect_err("timeout");
        assert_eq!(err.to_string(), "eventWaitAndGet failed: timeout.");
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(30), "returned after {elapsed:?}");
        assert!(elapsed < Duration::from_secs(5));

        dispatcher.events().post(Event::new("1-1", "Greeted").with("who", "world"));
        let invocation = dispatcher
            .invoke(1, 3, "eventWaitAndGet", &[json!("1-1"), json!("Greeted")])
            .expect("event");
        assert_eq!(invocation.result["data"], json!({ "who": "world" }));
    }

    #[test]
    fn event_wait_leaves_the_event_queued() {
        let dispatcher = dispatcher();
        dispatcher.events().post(Event::new("1-1", "Ready"));
        let invocation = dispatcher
            .invoke(1, 2, "eventWait", &[json!("1-1"), json!("Ready"), json!(10)])
            .expect("ready");
        assert_eq!(invocation.result, JsonValue::Null);
        assert_eq!(dispatcher.events().pending("1-1", "Ready"), 1);
    }

    #[test]
    fn get_all_drains_in_order() {
        let dispatcher = dispatcher();
        for n in 0..3 {
            dispatcher.events().post(Event::new("4-4", "Tick").with("n", n));
        }
        let invocation =
            dispatcher.invoke(1, 2, "eventGetAll", &[json!("4-4"), json!("Tick")]).expect("all");
        let ns = invocation
            .result
            .as_array()
            .expect("array")
            .iter()
            .map(|event| event["data"]["n"].clone())
            .collect::<Vec<_>>();
        assert_eq!(ns, vec![json!(0), json!(1), json!(2)]);
        let again =
            dispatcher.invoke(1, 3, "eventGetAll", &[json!("4-4"), json!("Tick")]).expect("all");
        assert_eq!(again.result, json!([]));
    }

    #[test]
    fn shutdown_clears_the_cache() {
        let dispatcher = dispatcher();
        dispatcher.events().post(Event::new("1-1", "Left"));
        dispatcher.invoke(1, 2, "eventGetAll", &[json!("9-9"), json!("x")]).expect("construct");
        dispatcher.shutdown();
        assert_eq!(dispatcher.events().pending("1-1", "Left"), 0);
    }
}
