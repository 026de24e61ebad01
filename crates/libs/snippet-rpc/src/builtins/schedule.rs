use std::time::Duration;

use serde_json::Value as JsonValue;

use crate::dispatch::Call;
use crate::error::RpcError;
use crate::registry::{MethodSpec, ParamSpec, Snippet, SnippetContext, SnippetUnit};
use crate::scheduler::SCHEDULE_RPC_METHOD;
use crate::value::WireType;

pub const SCHEDULE_RPC_SNIPPET: &str = "ScheduleRpcSnippet";

/// Lets clients arm delayed calls that outlive their own session.
#[derive(Debug, Default)]
pub struct ScheduleRpcSnippet;

impl ScheduleRpcSnippet {
    fn schedule_rpc(&self, call: &Call) -> Result<(), RpcError> {
        let args = call.args();
        let method = args.str(0)?;
        let delay = Duration::from_millis(u64::try_from(args.long(1)?).unwrap_or(0));
        let codec = call.dispatcher().codec();
        let params = args
            .opt_list(2)?
            .map(|items| items.iter().map(|item| codec.to_wire(item)).collect::<Vec<JsonValue>>())
            .unwrap_or_default();
        let callback_id = call.callback_id().unwrap_or_default();
        call.dispatcher().schedule(callback_id, method, delay, params)
    }
}

impl Snippet for ScheduleRpcSnippet {}

pub fn schedule_unit() -> SnippetUnit {
    SnippetUnit::builder(SCHEDULE_RPC_SNIPPET, |_context: &SnippetContext| Ok(ScheduleRpcSnippet))
        .rpc(
            MethodSpec::async_rpc(SCHEDULE_RPC_METHOD)
                .param(ParamSpec::required("methodName", WireType::String))
                .param(ParamSpec::required("delayTimerMs", WireType::Long))
                .param(ParamSpec::optional("params", WireType::array(WireType::Json)))
                .description(
                    "Calls methodName after delayTimerMs and posts the outcome as a \
                     methodName event under this call's callback id.",
                ),
            ScheduleRpcSnippet::schedule_rpc,
        )
        .build()
}
