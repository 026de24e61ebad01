use std::sync::Arc;
use std::time::Duration;

use serde_json::Value as JsonValue;
use tokio::runtime::Handle;

use crate::dispatch::{Dispatcher, Invocation};
use crate::error::RpcError;
use crate::events::Event;

/// Name of the built-in method that arms delayed invocations.
pub const SCHEDULE_RPC_METHOD: &str = "scheduleRpc";

/// One-shot timers that re-enter the dispatcher after a delay.
#[derive(Debug)]
pub(crate) struct Scheduler {
    runtime: Option<Handle>,
}

impl Scheduler {
    pub(crate) fn new(runtime: Option<Handle>) -> Self {
        Self { runtime }
    }

    pub(crate) fn schedule(
        &self,
        dispatcher: Arc<Dispatcher>,
        callback_id: String,
        method: String,
        delay: Duration,
        params: Vec<JsonValue>,
    ) -> Result<(), RpcError> {
        if method == SCHEDULE_RPC_METHOD {
            return Err(RpcError::Schedule {
                method,
                reason: "delayed calls cannot schedule further calls".to_string(),
            });
        }
        let runtime = self.runtime.clone().or_else(|| Handle::try_current().ok()).ok_or_else(
            || RpcError::Schedule {
                method: method.clone(),
                reason: "no async runtime available".to_string(),
            },
        )?;
        log::debug!("scheduler: {method} armed for {callback_id} in {}ms", delay.as_millis());
        runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            let outcome = {
                let dispatcher = Arc::clone(&dispatcher);
                let target = method.clone();
                let callback_id = callback_id.clone();
                tokio::task::spawn_blocking(move || {
                    dispatcher.invoke_with_callback(&target, &params, callback_id)
                })
                .await
            };
            let outcome = outcome.unwrap_or_else(|err| {
                Err(RpcError::InvocationFailure { method: method.clone(), trace: err.to_string() })
            });
            if let Err(err) = &outcome {
                log::warn!("scheduler: {method} for {callback_id} failed: {err}");
            }
            dispatcher.events().post(outcome_event(&callback_id, &method, outcome));
        });
        Ok(())
    }
}

/// Event posted under `(callback_id, method)` once a delayed call finishes.
pub(crate) fn outcome_event(
    callback_id: &str,
    method: &str,
    outcome: Result<Invocation, RpcError>,
) -> Event {
    let event = Event::new(callback_id, method);
    match outcome {
        Ok(invocation) => event
            .with("successful", true)
            .with("reason", JsonValue::Null)
            .with("result", invocation.result)
            .with("callback", invocation.callback.map_or(JsonValue::Null, JsonValue::String)),
        Err(err) => event
            .with("successful", false)
            .with("reason", err.to_string())
            .with("result", JsonValue::Null)
            .with("callback", JsonValue::Null),
    }
}
