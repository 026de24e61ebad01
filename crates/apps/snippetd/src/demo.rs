//! Example snippet units served by `snippetd`.

use serde_json::{json, Value};
use snippet_rpc::{
    Affinity, BoxError, Call, Codec, CustomValue, MethodSpec, ObjectConverter, ParamSpec,
    RpcError, RpcValue, Snippet, SnippetContext, SnippetUnit, WireType,
};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

pub const GREETED_EVENT: &str = "Greeted";
pub const TASK_RESULT_EVENT: &str = "AsyncTaskResult";
pub const POINT_TYPE: &str = "Point";

/// Synchronous methods over every built-in wire type.
#[derive(Debug, Default)]
pub struct ExampleSnippet;

impl ExampleSnippet {
    fn greet(&self, call: &Call) -> Result<String, RpcError> {
        let args = call.args();
        let punctuation = args.opt_str(2)?.unwrap_or("!");
        Ok(format!("{}, {}{}", args.str(1)?, args.str(0)?, punctuation))
    }

    fn sum(&self, call: &Call) -> Result<i64, RpcError> {
        let mut total = 0_i64;
        for value in call.args().list(0)? {
            total = total.saturating_add(value.as_i64().unwrap_or(0));
        }
        Ok(total)
    }

    fn midpoint(&self, call: &Call) -> Result<RpcValue, RpcError> {
        let a = call.args().custom::<Point>(0)?;
        let b = call.args().custom::<Point>(1)?;
        Ok(RpcValue::custom(Point { x: (a.x + b.x) / 2.0, y: (a.y + b.y) / 2.0 }))
    }
}

impl Snippet for ExampleSnippet {}

pub fn example_unit() -> SnippetUnit {
    SnippetUnit::builder("ExampleSnippet", |_context: &SnippetContext| Ok(ExampleSnippet))
        .rpc(
            MethodSpec::rpc("echo")
                .param(ParamSpec::required("value", WireType::Int))
                .returns(WireType::Int)
                .description("Returns its argument."),
            |_: &ExampleSnippet, call: &Call| call.args().int(0),
        )
        .rpc(
            MethodSpec::rpc("greet")
                .param(ParamSpec::required("name", WireType::String))
                .param(ParamSpec::with_default("greeting", WireType::String, "Hello"))
                .param(ParamSpec::optional("punctuation", WireType::String))
                .returns(WireType::String),
            ExampleSnippet::greet,
        )
        .rpc(
            MethodSpec::rpc("bytesOf")
                .param(ParamSpec::required("text", WireType::String))
                .returns(WireType::Bytes)
                .description("UTF-8 encoding of text."),
            |_: &ExampleSnippet, call: &Call| {
                call.args().str(0).map(|text| RpcValue::Bytes(text.as_bytes().to_vec()))
            },
        )
        .rpc(
            MethodSpec::rpc("sum")
                .param(ParamSpec::required("values", WireType::array(WireType::Long)))
                .returns(WireType::Long),
            ExampleSnippet::sum,
        )
        .rpc(
            MethodSpec::rpc("midpoint")
                .param(ParamSpec::required("a", WireType::custom(POINT_TYPE)))
                .param(ParamSpec::required("b", WireType::custom(POINT_TYPE)))
                .returns(WireType::custom(POINT_TYPE)),
            ExampleSnippet::midpoint,
        )
        .rpc(
            MethodSpec::rpc("fail").description("Always fails."),
            |_: &ExampleSnippet, _: &Call| -> Result<(), BoxError> {
                Err("requested failure".into())
            },
        )
        .rpc(
            MethodSpec::rpc("modernOnly").min_level(30).returns(WireType::Bool),
            |_: &ExampleSnippet, _: &Call| Ok::<_, BoxError>(true),
        )
        .build()
}

/// Methods whose real result is delivered later as an event.
#[derive(Debug, Default)]
pub struct ExampleAsyncSnippet;

impl ExampleAsyncSnippet {
    fn delayed_greet(&self, call: &Call) -> Result<(), RpcError> {
        let args = call.args();
        let delay = Duration::from_millis(u64::try_from(args.long(1)?).unwrap_or(0));
        let event = call.event(GREETED_EVENT).with("who", args.str(0)?);
        let events = Arc::clone(call.events());
        thread::spawn(move || {
            thread::sleep(delay);
            events.post(event);
        });
        Ok(())
    }

    fn try_event(&self, call: &Call) -> Result<(), RpcError> {
        let data = call.args().json(0)?.as_object().cloned().unwrap_or_default();
        call.events().post(call.event(TASK_RESULT_EVENT).with_data(data));
        Ok(())
    }
}

impl Snippet for ExampleAsyncSnippet {}

pub fn example_async_unit() -> SnippetUnit {
    SnippetUnit::builder("ExampleAsyncSnippet", |_context: &SnippetContext| {
        Ok(ExampleAsyncSnippet)
    })
    .rpc(
        MethodSpec::async_rpc("delayedGreet")
            .param(ParamSpec::required("name", WireType::String))
            .param(ParamSpec::with_default("delayMs", WireType::Long, "100"))
            .description("Posts a Greeted event after delayMs."),
        ExampleAsyncSnippet::delayed_greet,
    )
    .rpc(
        MethodSpec::async_rpc("tryEvent")
            .param(ParamSpec::required("data", WireType::Object))
            .description("Posts data back as an AsyncTaskResult event."),
        ExampleAsyncSnippet::try_event,
    )
    .build()
}

/// A snippet bound to the coordinator thread for its whole life.
#[derive(Debug)]
pub struct CoordinatorSnippet {
    owner: String,
}

impl CoordinatorSnippet {
    fn new() -> Self {
        Self { owner: current_thread_name() }
    }
}

impl Snippet for CoordinatorSnippet {
    fn shutdown(&self) -> Result<(), BoxError> {
        log::debug!("demo: coordinator snippet released on {}", current_thread_name());
        Ok(())
    }
}

fn current_thread_name() -> String {
    thread::current().name().unwrap_or("unnamed").to_string()
}

pub fn coordinator_unit() -> SnippetUnit {
    SnippetUnit::builder("CoordinatorSnippet", |_context: &SnippetContext| {
        Ok(CoordinatorSnippet::new())
    })
    .construct_on(Affinity::Coordinator)
    .shutdown_on(Affinity::Coordinator)
    .rpc(
        MethodSpec::rpc("coordinatorThread")
            .on(Affinity::Coordinator)
            .returns(WireType::map(WireType::String))
            .description("Names the threads that built and serve this snippet."),
        |snippet: &CoordinatorSnippet, _: &Call| {
            Ok::<_, BoxError>(RpcValue::map([
                ("constructedOn", snippet.owner.clone()),
                ("calledOn", current_thread_name()),
            ]))
        },
    )
    .build()
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

/// Encodes [`Point`] as `{"x": .., "y": ..}`.
#[derive(Debug, Default)]
pub struct PointConverter;

impl ObjectConverter for PointConverter {
    fn serialize(&self, value: &dyn CustomValue) -> Option<Value> {
        let point = value.as_any().downcast_ref::<Point>()?;
        Some(json!({ "x": point.x, "y": point.y }))
    }

    fn deserialize(&self, value: &Value, type_name: &str) -> Result<Option<RpcValue>, BoxError> {
        if type_name != POINT_TYPE {
            return Ok(None);
        }
        let coordinate = |key: &str| {
            value.get(key).and_then(Value::as_f64).ok_or_else(|| format!("missing {key}"))
        };
        Ok(Some(RpcValue::custom(Point { x: coordinate("x")?, y: coordinate("y")? })))
    }
}

pub fn demo_codec() -> Codec {
    Codec::with_converter(Arc::new(PointConverter))
}

pub fn demo_units() -> Vec<SnippetUnit> {
    vec![example_unit(), example_async_unit(), coordinator_unit()]
}
