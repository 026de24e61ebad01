use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde_json::Value as JsonValue;
use tokio::runtime::Handle;

use crate::codec::Codec;
use crate::coordinator::{guarded, Coordinator};
use crate::error::{BoxError, RpcError};
use crate::events::{Event, EventCache};
use crate::registry::{Affinity, Instance, MethodDescriptor, Registry, SnippetContext, UnitId};
use crate::scheduler::Scheduler;
use crate::value::RpcValue;

/// Outcome of a successful dispatch, ready to be framed into a response.
#[derive(Clone, Debug, PartialEq)]
pub struct Invocation {
    pub result: JsonValue,
    /// Present only for async methods.
    pub callback: Option<String>,
}

pub struct DispatcherBuilder {
    registry: Registry,
    events: Option<Arc<EventCache>>,
    codec: Codec,
    capability_level: u32,
    runtime: Option<Handle>,
}

impl DispatcherBuilder {
    pub fn events(mut self, events: Arc<EventCache>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn codec(mut self, codec: Codec) -> Self {
        self.codec = codec;
        self
    }

    /// Level compared against each method's minimum capability level.
    pub fn capability_level(mut self, level: u32) -> Self {
        self.capability_level = level;
        self
    }

    /// Runtime used for delayed invocations. Defaults to the runtime the
    /// dispatcher is built in, if any.
    pub fn runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Starts the coordinator thread and returns the shared dispatcher.
    pub fn build(self) -> io::Result<Arc<Dispatcher>> {
        let coordinator = Coordinator::spawn()?;
        let instances = self.registry.units().iter().map(|_| Mutex::new(None)).collect();
        let runtime = self.runtime.or_else(|| Handle::try_current().ok());
        Ok(Arc::new_cyclic(|me| Dispatcher {
            registry: self.registry,
            codec: self.codec,
            events: self.events.unwrap_or_default(),
            capability_level: self.capability_level,
            instances,
            coordinator,
            scheduler: Scheduler::new(runtime),
            shut_down: AtomicBool::new(false),
            me: me.clone(),
        }))
    }
}

/// Resolves requests against the registry and runs them on snippet instances.
pub struct Dispatcher {
    registry: Registry,
    codec: Codec,
    events: Arc<EventCache>,
    capability_level: u32,
    instances: Vec<Mutex<Option<Instance>>>,
    coordinator: Coordinator,
    scheduler: Scheduler,
    shut_down: AtomicBool,
    me: Weak<Dispatcher>,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("registry", &self.registry)
            .field("capability_level", &self.capability_level)
            .field("shut_down", &self.is_shut_down())
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    pub fn builder(registry: Registry) -> DispatcherBuilder {
        DispatcherBuilder {
            registry,
            events: None,
            codec: Codec::new(),
            capability_level: 0,
            runtime: None,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn events(&self) -> &Arc<EventCache> {
        &self.events
    }

    pub fn codec(&self) -> &Codec {
        &self.codec
    }

    pub fn capability_level(&self) -> u32 {
        self.capability_level
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Dispatches a client request. Async methods receive the callback id
    /// `"{session_id}-{request_id}"`.
    pub fn invoke(
        &self,
        session_id: u64,
        request_id: i64,
        method: &str,
        params: &[JsonValue],
    ) -> Result<Invocation, RpcError> {
        self.invoke_with_callback(method, params, format!("{session_id}-{request_id}"))
    }

    /// Dispatches with an explicit callback id; used by delayed invocations
    /// to reuse the id of the call that armed them.
    pub fn invoke_with_callback(
        &self,
        method: &str,
        params: &[JsonValue],
        callback_id: String,
    ) -> Result<Invocation, RpcError> {
        if self.is_shut_down() {
            return Err(RpcError::ShutDown);
        }
        let descriptor = self
            .registry
            .lookup(method)
            .ok_or_else(|| RpcError::UnknownMethod { method: method.to_string() })?;
        let args = self.resolve_args(&descriptor, params)?;
        if let Some(required) = descriptor.min_level() {
            if self.capability_level < required {
                return Err(RpcError::CapabilityGate {
                    method: method.to_string(),
                    required,
                    current: self.capability_level,
                });
            }
        }
        let dispatcher = self.me.upgrade().ok_or(RpcError::ShutDown)?;
        let instance = dispatcher.instance(descriptor.unit_id(), method)?;
        let callback = descriptor.is_async().then_some(callback_id);
        let call = Call {
            descriptor: Arc::clone(&descriptor),
            args,
            callback_id: callback.clone(),
            dispatcher,
        };
        let handler = descriptor.handler();
        let value = self
            .run_on(descriptor.affinity(), move || handler(&instance, &call))
            .map_err(|err| RpcError::from_handler(method, err))?;
        Ok(Invocation { result: self.codec.to_wire(&value), callback })
    }

    fn resolve_args(
        &self,
        descriptor: &MethodDescriptor,
        params: &[JsonValue],
    ) -> Result<Args, RpcError> {
        let declared = descriptor.params();
        if params.len() > declared.len() {
            return Err(RpcError::Arity {
                method: descriptor.name().to_string(),
                accepted: declared.len(),
                supplied: params.len(),
            });
        }
        let mut values = Vec::with_capacity(declared.len());
        for (index, param) in declared.iter().enumerate() {
            let position = index + 1;
            let value = match params.get(index) {
                Some(wire) => self
                    .codec
                    .from_wire(wire, param.wire_type())
                    .map_err(|err| err.into_argument_error(position, param.wire_type()))?,
                None => match param.default_value() {
                    Some(default) => default.clone(),
                    None if param.is_optional() => RpcValue::Null,
                    None => return Err(RpcError::MissingArgument { position }),
                },
            };
            values.push(value);
        }
        Ok(Args(values))
    }

    /// Returns the unit's instance, constructing it on first use.
    ///
    /// Units built on the coordinator take their slot lock only on the
    /// coordinator thread, so coordinator handlers may dispatch into them.
    fn instance(self: &Arc<Self>, unit_id: UnitId, method: &str) -> Result<Instance, RpcError> {
        if let Some(instance) = self.slot(unit_id).as_ref() {
            return Ok(Arc::clone(instance));
        }
        let entry = self.registry.unit(unit_id);
        let built = match entry.construct_affinity() {
            Affinity::Caller => guarded(|| self.construct(unit_id)),
            Affinity::Coordinator => {
                let me = Arc::clone(self);
                self.coordinator.run(move || me.construct(unit_id))
            }
        };
        built.map_err(|err| match RpcError::from_handler(method, err) {
            RpcError::InvocationFailure { method, trace } => RpcError::InvocationFailure {
                method,
                trace: format!("cannot construct {}: {trace}", entry.name()),
            },
            other => other,
        })
    }

    fn slot(&self, unit_id: UnitId) -> MutexGuard<'_, Option<Instance>> {
        self.instances[unit_id.index()].lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs the constructor on the current thread unless another caller
    /// finished first.
    fn construct(&self, unit_id: UnitId) -> Result<Instance, BoxError> {
        let mut slot = self.slot(unit_id);
        if let Some(instance) = slot.as_ref() {
            return Ok(Arc::clone(instance));
        }
        let entry = self.registry.unit(unit_id);
        let context = SnippetContext::new(Arc::clone(&self.events), self.capability_level);
        let instance = (entry.constructor())(&context)?;
        log::info!("dispatch: constructed snippet {}", entry.name());
        *slot = Some(Arc::clone(&instance));
        Ok(instance)
    }

    fn run_on<R, F>(&self, affinity: Affinity, job: F) -> Result<R, BoxError>
    where
        R: Send + 'static,
        F: FnOnce() -> Result<R, BoxError> + Send + 'static,
    {
        match affinity {
            Affinity::Caller => guarded(job),
            Affinity::Coordinator => self.coordinator.run(job),
        }
    }

    /// Arms a one-shot delayed call of `method` whose outcome is posted as an
    /// event under `(callback_id, method)`.
    pub fn schedule(
        &self,
        callback_id: &str,
        method: &str,
        delay: Duration,
        params: Vec<JsonValue>,
    ) -> Result<(), RpcError> {
        let dispatcher = self.me.upgrade().ok_or(RpcError::ShutDown)?;
        self.scheduler.schedule(
            dispatcher,
            callback_id.to_string(),
            method.to_string(),
            delay,
            params,
        )
    }

    /// Releases every blocked event waiter, runs the shutdown hook of every
    /// constructed instance and refuses any further invocation. Hook failures
    /// are logged, not returned.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.events.close();
        for (entry, slot) in self.registry.units().iter().zip(&self.instances) {
            let Some(instance) = slot.lock().unwrap_or_else(PoisonError::into_inner).take() else {
                continue;
            };
            let hook = entry.shutdown_hook();
            if let Err(err) = self.run_on(entry.shutdown_affinity(), move || hook(&instance)) {
                log::warn!("dispatch: shutdown of {} failed: {}", entry.name(), err);
            }
        }
        log::info!("dispatch: shut down");
    }
}

/// Resolved arguments of a call, one per declared parameter.
///
/// Accessors take the 0-based parameter index; errors report the 1-based
/// argument position the client sees.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Args(Vec<RpcValue>);

impl Args {
    pub fn new(values: Vec<RpcValue>) -> Self {
        Self(values)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&RpcValue> {
        self.0.get(index)
    }

    pub fn values(&self) -> &[RpcValue] {
        &self.0
    }

    fn typed<'a, T>(
        &'a self,
        index: usize,
        expected: &str,
        extract: impl FnOnce(&'a RpcValue) -> Option<T>,
    ) -> Result<T, RpcError> {
        self.opt_typed(index, expected, extract)?
            .ok_or(RpcError::MissingArgument { position: index + 1 })
    }

    fn opt_typed<'a, T>(
        &'a self,
        index: usize,
        expected: &str,
        extract: impl FnOnce(&'a RpcValue) -> Option<T>,
    ) -> Result<Option<T>, RpcError> {
        match self.0.get(index) {
            None | Some(RpcValue::Null) => Ok(None),
            Some(value) => extract(value).map(Some).ok_or_else(|| RpcError::ArgumentType {
                position: index + 1,
                expected: expected.to_string(),
                actual: value.kind_name().to_string(),
            }),
        }
    }

    pub fn bool(&self, index: usize) -> Result<bool, RpcError> {
        self.typed(index, "bool", RpcValue::as_bool)
    }

    pub fn int(&self, index: usize) -> Result<i32, RpcError> {
        self.typed(index, "int", RpcValue::as_i32)
    }

    pub fn long(&self, index: usize) -> Result<i64, RpcError> {
        self.typed(index, "long", RpcValue::as_i64)
    }

    pub fn double(&self, index: usize) -> Result<f64, RpcError> {
        self.typed(index, "double", RpcValue::as_f64)
    }

    pub fn str(&self, index: usize) -> Result<&str, RpcError> {
        self.typed(index, "string", RpcValue::as_str)
    }

    pub fn bytes(&self, index: usize) -> Result<&[u8], RpcError> {
        self.typed(index, "bytes", RpcValue::as_bytes)
    }

    pub fn list(&self, index: usize) -> Result<&[RpcValue], RpcError> {
        self.typed(index, "list", RpcValue::as_list)
    }

    pub fn json(&self, index: usize) -> Result<&JsonValue, RpcError> {
        self.typed(index, "json", RpcValue::as_json)
    }

    pub fn custom<T: std::any::Any>(&self, index: usize) -> Result<&T, RpcError> {
        self.typed(index, std::any::type_name::<T>(), RpcValue::downcast_ref::<T>)
    }

    pub fn opt_bool(&self, index: usize) -> Result<Option<bool>, RpcError> {
        self.opt_typed(index, "bool", RpcValue::as_bool)
    }

    pub fn opt_int(&self, index: usize) -> Result<Option<i32>, RpcError> {
        self.opt_typed(index, "int", RpcValue::as_i32)
    }

    pub fn opt_long(&self, index: usize) -> Result<Option<i64>, RpcError> {
        self.opt_typed(index, "long", RpcValue::as_i64)
    }

    pub fn opt_str(&self, index: usize) -> Result<Option<&str>, RpcError> {
        self.opt_typed(index, "string", RpcValue::as_str)
    }

    pub fn opt_list(&self, index: usize) -> Result<Option<&[RpcValue]>, RpcError> {
        self.opt_typed(index, "list", RpcValue::as_list)
    }
}

/// Everything a handler sees about the request it is serving.
pub struct Call {
    descriptor: Arc<MethodDescriptor>,
    args: Args,
    callback_id: Option<String>,
    dispatcher: Arc<Dispatcher>,
}

impl Call {
    pub fn method(&self) -> &str {
        self.descriptor.name()
    }

    pub fn descriptor(&self) -> &MethodDescriptor {
        &self.descriptor
    }

    pub fn args(&self) -> &Args {
        &self.args
    }

    /// The minted callback id; `None` for synchronous methods.
    pub fn callback_id(&self) -> Option<&str> {
        self.callback_id.as_deref()
    }

    /// A fresh event addressed to this call's callback id.
    pub fn event(&self, name: impl Into<String>) -> Event {
        Event::new(self.callback_id.clone().unwrap_or_default(), name)
    }

    pub fn events(&self) -> &Arc<EventCache> {
        self.dispatcher.events()
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }
}

impl fmt::Debug for Call {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Call")
            .field("method", &self.method())
            .field("args", &self.args)
            .field("callback_id", &self.callback_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{MethodSpec, ParamSpec, Snippet, SnippetUnit};
    use crate::value::WireType;
    use crate::COORDINATOR_THREAD_NAME;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::sync::{mpsc, Barrier};
    use std::thread;
    use std::time::Instant;

    #[derive(Default)]
    struct Counters {
        constructed: AtomicUsize,
        shut_down: AtomicUsize,
    }

    struct Toy {
        counters: Arc<Counters>,
    }

    impl Snippet for Toy {
        fn shutdown(&self) -> Result<(), BoxError> {
            self.counters.shut_down.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn thread_name() -> String {
        thread::current().name().unwrap_or_default().to_string()
    }

    fn toy_unit(counters: &Arc<Counters>) -> SnippetUnit {
        let counters = Arc::clone(counters);
        SnippetUnit::builder("ToySnippet", move |_context: &SnippetContext| {
            counters.constructed.fetch_add(1, Ordering::SeqCst);
            Ok(Toy { counters: Arc::clone(&counters) })
        })
        .rpc(
            MethodSpec::rpc("echo").param(ParamSpec::required("value", WireType::Int)),
            |_: &Toy, call: &Call| call.args().int(0),
        )
        .rpc(
            MethodSpec::rpc("greet")
                .param(ParamSpec::required("name", WireType::String))
                .param(ParamSpec::with_default("times", WireType::Int, "2"))
                .param(ParamSpec::optional("suffix", WireType::String)),
            |_: &Toy, call: &Call| -> Result<String, RpcError> {
                let args = call.args();
                let suffix = args.opt_str(2)?.unwrap_or("!");
                let times = usize::try_from(args.int(1)?).unwrap_or(0);
                Ok(format!("{}{suffix}", args.str(0)?.repeat(times)))
            },
        )
        .rpc(MethodSpec::async_rpc("later"), |_: &Toy, call: &Call| {
            Ok::<_, BoxError>(call.callback_id().map(str::to_string))
        })
        .rpc(MethodSpec::rpc("gated").min_level(30), |_: &Toy, _: &Call| Ok::<_, BoxError>(true))
        .rpc(MethodSpec::rpc("where").on(Affinity::Coordinator), |_: &Toy, _: &Call| {
            Ok::<_, BoxError>(thread_name())
        })
        .rpc(MethodSpec::rpc("fail"), |_: &Toy, _: &Call| -> Result<(), BoxError> {
            Err("it broke".into())
        })
        .rpc(MethodSpec::rpc("explode"), |_: &Toy, _: &Call| -> Result<(), BoxError> {
            panic!("kaboom")
        })
        .build()
    }

    fn dispatcher(counters: &Arc<Counters>, level: u32) -> Arc<Dispatcher> {
        let registry = Registry::build([toy_unit(counters)]).expect("registry");
        Dispatcher::builder(registry).capability_level(level).build().expect("dispatcher")
    }

    #[test]
    fn unknown_methods_never_construct_instances() {
        let counters = Arc::new(Counters::default());
        let dispatcher = dispatcher(&counters, 0);
        let err = dispatcher.invoke(1, 1, "nope", &[]).expect_err("unknown");
        assert_eq!(err, RpcError::UnknownMethod { method: "nope".into() });
        assert_eq!(err.to_string(), "Unknown RPC: nope");
        assert_eq!(counters.constructed.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn sync_results_have_no_callback() {
        let counters = Arc::new(Counters::default());
        let dispatcher = dispatcher(&counters, 0);
        let invocation = dispatcher.invoke(1, 5, "echo", &[json!(42)]).expect("echo");
        assert_eq!(invocation, Invocation { result: json!(42), callback: None });
    }

    #[test]
    fn instances_are_constructed_once() {
        let counters = Arc::new(Counters::default());
        let dispatcher = dispatcher(&counters, 0);
        let workers = (0..8)
            .map(|n| {
                let dispatcher = Arc::clone(&dispatcher);
                thread::spawn(move || dispatcher.invoke(n, 1, "echo", &[json!(n)]))
            })
            .collect::<Vec<_>>();
        for worker in workers {
            worker.join().expect("worker thread").expect("echo");
        }
        assert_eq!(counters.constructed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn arguments_resolve_through_defaults_and_optionals() {
        let counters = Arc::new(Counters::default());
        let dispatcher = dispatcher(&counters, 0);
        let greet = |params: &[JsonValue]| dispatcher.invoke(1, 1, "greet", params);
        assert_eq!(greet(&[json!("ab")]).expect("defaults").result, json!("abab!"));
        assert_eq!(greet(&[json!("x"), json!(3), json!("?")]).expect("all").result, json!("xxx?"));
        assert_eq!(greet(&[json!("x"), json!(1), json!(null)]).expect("null").result, json!("x!"));
    }

    #[test]
    fn argument_errors_carry_positions() {
        let counters = Arc::new(Counters::default());
        let dispatcher = dispatcher(&counters, 0);
        let err = dispatcher.invoke(1, 1, "echo", &[]).expect_err("missing");
        assert_eq!(err.to_string(), "Argument 1 is not present");

        let err = dispatcher.invoke(1, 1, "greet", &[json!("x"), json!("two")]).expect_err("type");
        assert_eq!(err.to_string(), "Argument 2 should be of type int, but is of type string");

        let err = dispatcher.invoke(1, 1, "echo", &[json!(1), json!(2)]).expect_err("arity");
        assert_eq!(err, RpcError::Arity { method: "echo".into(), accepted: 1, supplied: 2 });
    }

    #[test]
    fn async_methods_receive_the_minted_callback_id() {
        let counters = Arc::new(Counters::default());
        let dispatcher = dispatcher(&counters, 0);
        let invocation = dispatcher.invoke(3, 9, "later", &[]).expect("later");
        assert_eq!(invocation.callback.as_deref(), Some("3-9"));
        assert_eq!(invocation.result, json!("3-9"));
    }

    #[test]
    fn capability_gate_blocks_before_construction() {
        let counters = Arc::new(Counters::default());
        let low = dispatcher(&counters, 29);
        let err = low.invoke(1, 1, "gated", &[]).expect_err("gated");
        assert_eq!(
            err,
            RpcError::CapabilityGate { method: "gated".into(), required: 30, current: 29 }
        );
        assert_eq!(counters.constructed.load(Ordering::SeqCst), 0);

        let high = dispatcher(&counters, 30);
        assert_eq!(high.invoke(1, 1, "gated", &[]).expect("gated").result, json!(true));
    }

    #[test]
    fn coordinator_affinity_runs_on_the_coordinator_thread() {
        let counters = Arc::new(Counters::default());
        let dispatcher = dispatcher(&counters, 0);
        let invocation = dispatcher.invoke(1, 1, "where", &[]).expect("where");
        assert_eq!(invocation.result, json!(COORDINATOR_THREAD_NAME));
    }

    #[test]
    fn handler_failures_and_panics_become_invocation_failures() {
        let counters = Arc::new(Counters::default());
        let dispatcher = dispatcher(&counters, 0);
        let err = dispatcher.invoke(1, 1, "fail", &[]).expect_err("fail");
        assert_eq!(err.to_string(), "fail failed: it broke");

        let err = dispatcher.invoke(1, 2, "explode", &[]).expect_err("explode");
        assert!(matches!(
            err,
            RpcError::InvocationFailure { ref trace, .. } if trace.contains("kaboom")
        ));
        let after = dispatcher.invoke(1, 3, "echo", &[json!(7)]).expect("still serving");
        assert_eq!(after.result, json!(7));
    }

    #[test]
    fn shutdown_runs_hooks_once_and_refuses_new_work() {
        let counters = Arc::new(Counters::default());
        let dispatcher = dispatcher(&counters, 0);
        dispatcher.invoke(1, 1, "echo", &[json!(1)]).expect("echo");
        dispatcher.shutdown();
        dispatcher.shutdown();
        assert_eq!(counters.shut_down.load(Ordering::SeqCst), 1);
        assert!(dispatcher.is_shut_down());
        assert_eq!(dispatcher.invoke(1, 2, "echo", &[json!(1)]), Err(RpcError::ShutDown));
    }

    #[test]
    fn shutdown_releases_blocked_event_waiters() {
        let registry = Registry::build(crate::builtin_units()).expect("registry");
        let dispatcher = Dispatcher::builder(registry).build().expect("dispatcher");
        let waiter = {
            let dispatcher = Arc::clone(&dispatcher);
            thread::spawn(move || {
                let started = Instant::now();
                let params = [json!("7-1"), json!("never"), json!(600_000)];
                (dispatcher.invoke(7, 2, "eventWaitAndGet", &params), started.elapsed())
            })
        };
        thread::sleep(Duration::from_millis(50));
        dispatcher.shutdown();
        let (outcome, elapsed) = waiter.join().expect("waiter thread");
        assert!(outcome.is_err());
        assert!(elapsed < Duration::from_secs(5), "waiter held for {elapsed:?}");
        assert!(dispatcher.events().is_closed());
    }

    struct Hub;

    impl Snippet for Hub {}

    struct Leaf;

    impl Snippet for Leaf {}

    #[test]
    fn coordinator_handlers_can_dispatch_into_unbuilt_coordinator_units() {
        let counters = Arc::new(Counters::default());
        let relay_running = Arc::new(Barrier::new(2));
        let hub = {
            let relay_running = Arc::clone(&relay_running);
            SnippetUnit::builder("HubSnippet", |_context: &SnippetContext| Ok(Hub))
                .rpc(
                    MethodSpec::rpc("relay").on(Affinity::Coordinator),
                    move |_: &Hub, call: &Call| {
                        relay_running.wait();
                        thread::sleep(Duration::from_millis(100));
                        let leaf = call.dispatcher().invoke(9, 1, "leafEcho", &[json!(5)]);
                        leaf.map(|done| done.result)
                    },
                )
                .build()
        };
        let leaf = {
            let counters = Arc::clone(&counters);
            SnippetUnit::builder("LeafSnippet", move |_context: &SnippetContext| {
                counters.constructed.fetch_add(1, Ordering::SeqCst);
                Ok(Leaf)
            })
            .construct_on(Affinity::Coordinator)
            .rpc(
                MethodSpec::rpc("leafEcho").param(ParamSpec::required("value", WireType::Int)),
                |_: &Leaf, call: &Call| call.args().int(0),
            )
            .build()
        };
        let registry = Registry::build([hub, leaf]).expect("registry");
        let dispatcher = Dispatcher::builder(registry).build().expect("dispatcher");

        let (done_tx, done_rx) = mpsc::channel();
        let relay = {
            let dispatcher = Arc::clone(&dispatcher);
            let done_tx = done_tx.clone();
            thread::spawn(move || {
                let _ = done_tx.send(("relay", dispatcher.invoke(1, 1, "relay", &[])));
            })
        };
        relay_running.wait();
        let direct = {
            let dispatcher = Arc::clone(&dispatcher);
            thread::spawn(move || {
                let _ = done_tx.send(("direct", dispatcher.invoke(2, 1, "leafEcho", &[json!(6)])));
            })
        };
        for _ in 0..2 {
            let (name, outcome) =
                done_rx.recv_timeout(Duration::from_secs(10)).expect("both calls finish");
            let expected = if name == "relay" { json!(5) } else { json!(6) };
            assert_eq!(outcome.expect(name).result, expected);
        }
        relay.join().expect("relay thread");
        direct.join().expect("direct thread");
        assert_eq!(counters.constructed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn shutdown_skips_units_that_were_never_built() {
        let counters = Arc::new(Counters::default());
        let dispatcher = dispatcher(&counters, 0);
        dispatcher.shutdown();
        assert_eq!(counters.shut_down.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn args_accessors_report_client_positions() {
        let args = Args::new(vec![RpcValue::Int(1), RpcValue::Null, RpcValue::from("s")]);
        assert_eq!(args.int(0), Ok(1));
        assert_eq!(args.long(0), Ok(1));
        assert_eq!(args.str(1), Err(RpcError::MissingArgument { position: 2 }));
        assert_eq!(args.opt_str(1), Ok(None));
        assert_eq!(
            args.bool(2),
            Err(RpcError::ArgumentType {
                position: 3,
                expected: "bool".into(),
                actual: "string".into(),
            })
        );
        assert_eq!(args.opt_int(9), Ok(None));
    }
}
