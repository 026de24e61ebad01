use std::any::Any;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::codec::parse_default;
use crate::dispatch::Call;
use crate::error::{BoxError, RegistryError};
use crate::events::EventCache;
use crate::protocol::RESERVED_METHODS;
use crate::value::{RpcValue, WireType};

/// Where a constructor, method or shutdown hook runs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Affinity {
    /// On whichever thread is dispatching the request.
    #[default]
    Caller,
    /// On the single coordinator thread; the caller blocks until it finishes.
    Coordinator,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallKind {
    Sync,
    /// The dispatcher mints a callback id and hands it to the handler.
    Async,
}

/// Parses a default's canonical string into a value.
pub type DefaultParser = Arc<dyn Fn(&str) -> Result<RpcValue, BoxError> + Send + Sync>;

#[derive(Clone)]
pub struct ParamSpec {
    name: String,
    wire_type: WireType,
    default: Option<String>,
    optional: bool,
    parser: Option<DefaultParser>,
    default_value: Option<RpcValue>,
}

impl ParamSpec {
    pub fn required(name: impl Into<String>, wire_type: WireType) -> Self {
        Self {
            name: name.into(),
            wire_type,
            default: None,
            optional: false,
            parser: None,
            default_value: None,
        }
    }

    /// Resolved to null when the client leaves it out.
    pub fn optional(name: impl Into<String>, wire_type: WireType) -> Self {
        Self { optional: true, ..Self::required(name, wire_type) }
    }

    /// Resolved from `default` when the client leaves it out.
    pub fn with_default(
        name: impl Into<String>,
        wire_type: WireType,
        default: impl Into<String>,
    ) -> Self {
        Self { default: Some(default.into()), ..Self::required(name, wire_type) }
    }

    /// Overrides the built-in default parser for this parameter.
    pub fn parser<F>(mut self, parser: F) -> Self
    where
        F: Fn(&str) -> Result<RpcValue, BoxError> + Send + Sync + 'static,
    {
        self.parser = Some(Arc::new(parser));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn wire_type(&self) -> &WireType {
        &self.wire_type
    }

    pub fn default_text(&self) -> Option<&str> {
        self.default.as_deref()
    }

    pub fn is_optional(&self) -> bool {
        self.optional
    }

    pub(crate) fn default_value(&self) -> Option<&RpcValue> {
        self.default_value.as_ref()
    }

    fn parse_default(&self, raw: &str) -> Result<RpcValue, String> {
        match &self.parser {
            Some(parser) => parser(raw).map_err(|err| err.to_string()),
            None => parse_default(raw, &self.wire_type).map_err(|err| err.to_string()),
        }
    }
}

impl fmt::Debug for ParamSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParamSpec")
            .field("name", &self.name)
            .field("wire_type", &self.wire_type)
            .field("default", &self.default)
            .field("optional", &self.optional)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for ParamSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.default, self.optional) {
            (Some(default), _) => write!(f, "{}: {} = {}", self.name, self.wire_type, default),
            (None, true) => write!(f, "{}?: {}", self.name, self.wire_type),
            (None, false) => write!(f, "{}: {}", self.name, self.wire_type),
        }
    }
}

/// Declaration of one remotely callable method.
#[derive(Clone, Debug)]
pub struct MethodSpec {
    name: String,
    kind: CallKind,
    params: Vec<ParamSpec>,
    returns: Option<WireType>,
    min_level: Option<u32>,
    affinity: Affinity,
    description: String,
}

impl MethodSpec {
    pub fn rpc(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: CallKind::Sync,
            params: Vec::new(),
            returns: None,
            min_level: None,
            affinity: Affinity::Caller,
            description: String::new(),
        }
    }

    /// The callback id is not part of `params`; handlers read it from the [`Call`].
    pub fn async_rpc(name: impl Into<String>) -> Self {
        Self { kind: CallKind::Async, ..Self::rpc(name) }
    }

    pub fn param(mut self, param: ParamSpec) -> Self {
        self.params.push(param);
        self
    }

    pub fn returns(mut self, wire_type: WireType) -> Self {
        self.returns = Some(wire_type);
        self
    }

    pub fn min_level(mut self, level: u32) -> Self {
        self.min_level = Some(level);
        self
    }

    pub fn on(mut self, affinity: Affinity) -> Self {
        self.affinity = affinity;
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

pub(crate) type Instance = Arc<dyn Any + Send + Sync>;
pub(crate) type Handler = dyn Fn(&Instance, &Call) -> Result<RpcValue, BoxError> + Send + Sync;
type Constructor = dyn Fn(&SnippetContext) -> Result<Instance, BoxError> + Send + Sync;
type ShutdownHook = dyn Fn(&Instance) -> Result<(), BoxError> + Send + Sync;

/// Resolved, immutable description of a registered method.
pub struct MethodDescriptor {
    spec: MethodSpec,
    unit: String,
    unit_id: UnitId,
    handler: Arc<Handler>,
}

impl MethodDescriptor {
    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn unit(&self) -> &str {
        &self.unit
    }

    pub fn kind(&self) -> CallKind {
        self.spec.kind
    }

    pub fn is_async(&self) -> bool {
        self.spec.kind == CallKind::Async
    }

    pub fn params(&self) -> &[ParamSpec] {
        &self.spec.params
    }

    pub fn returns(&self) -> Option<&WireType> {
        self.spec.returns.as_ref()
    }

    pub fn min_level(&self) -> Option<u32> {
        self.spec.min_level
    }

    pub fn affinity(&self) -> Affinity {
        self.spec.affinity
    }

    pub fn description(&self) -> &str {
        &self.spec.description
    }

    pub(crate) fn unit_id(&self) -> UnitId {
        self.unit_id
    }

    pub(crate) fn handler(&self) -> Arc<Handler> {
        Arc::clone(&self.handler)
    }

    /// One line of `help` output.
    pub fn help_line(&self) -> String {
        let tag = match self.spec.kind {
            CallKind::Sync => "@Rpc",
            CallKind::Async => "@AsyncRpc",
        };
        let params = self.spec.params.iter().map(ToString::to_string).collect::<Vec<_>>();
        let returns = self.spec.returns.as_ref().map_or("void".to_string(), ToString::to_string);
        let mut line = format!("{tag} {}({}) returns {returns}", self.spec.name, params.join(", "));
        if !self.spec.description.is_empty() {
            line.push_str("  // ");
            line.push_str(&self.spec.description);
        }
        line
    }
}

impl fmt::Debug for MethodDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodDescriptor")
            .field("spec", &self.spec)
            .field("unit", &self.unit)
            .finish_non_exhaustive()
    }
}

/// Shared state handed to snippet constructors.
#[derive(Clone, Debug)]
pub struct SnippetContext {
    events: Arc<EventCache>,
    capability_level: u32,
}

impl SnippetContext {
    pub fn new(events: Arc<EventCache>, capability_level: u32) -> Self {
        Self { events, capability_level }
    }

    pub fn events(&self) -> &Arc<EventCache> {
        &self.events
    }

    pub fn capability_level(&self) -> u32 {
        self.capability_level
    }
}

/// A host object whose methods are exposed over RPC.
pub trait Snippet: Send + Sync + 'static {
    /// Runs once when the dispatcher shuts down, if the instance was built.
    fn shutdown(&self) -> Result<(), BoxError> {
        Ok(())
    }
}

/// A snippet type together with its constructor and method table.
pub struct SnippetUnit {
    name: String,
    constructor: Arc<Constructor>,
    construct_affinity: Affinity,
    shutdown: Arc<ShutdownHook>,
    shutdown_affinity: Affinity,
    methods: Vec<(MethodSpec, Arc<Handler>)>,
}

impl SnippetUnit {
    pub fn builder<T, F>(name: impl Into<String>, constructor: F) -> UnitBuilder<T>
    where
        T: Snippet,
        F: Fn(&SnippetContext) -> Result<T, BoxError> + Send + Sync + 'static,
    {
        let constructor: Arc<Constructor> = Arc::new(move |context: &SnippetContext| {
            constructor(context).map(|instance| Arc::new(instance) as Instance)
        });
        let shutdown: Arc<ShutdownHook> = Arc::new(|instance: &Instance| {
            (**instance).downcast_ref::<T>().map_or(Ok(()), |snippet| snippet.shutdown())
        });
        UnitBuilder {
            unit: SnippetUnit {
                name: name.into(),
                constructor,
                construct_affinity: Affinity::Caller,
                shutdown,
                shutdown_affinity: Affinity::Caller,
                methods: Vec::new(),
            },
            _instance: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for SnippetUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let methods = self.methods.iter().map(|(spec, _)| spec.name.as_str()).collect::<Vec<_>>();
        f.debug_struct("SnippetUnit").field("name", &self.name).field("methods", &methods).finish()
    }
}

pub struct UnitBuilder<T> {
    unit: SnippetUnit,
    _instance: PhantomData<fn() -> T>,
}

impl<T: Snippet> UnitBuilder<T> {
    pub fn construct_on(mut self, affinity: Affinity) -> Self {
        self.unit.construct_affinity = affinity;
        self
    }

    pub fn shutdown_on(mut self, affinity: Affinity) -> Self {
        self.unit.shutdown_affinity = affinity;
        self
    }

    pub fn rpc<F, R, E>(mut self, spec: MethodSpec, handler: F) -> Self
    where
        F: Fn(&T, &Call) -> Result<R, E> + Send + Sync + 'static,
        R: Into<RpcValue>,
        E: Into<BoxError>,
    {
        let method = spec.name.clone();
        let erased: Arc<Handler> = Arc::new(
            move |instance: &Instance, call: &Call| -> Result<RpcValue, BoxError> {
                let typed = (**instance).downcast_ref::<T>().ok_or_else(|| -> BoxError {
                    format!("instance for {method} has an unexpected type").into()
                })?;
                handler(typed, call).map(Into::into).map_err(Into::into)
            },
        );
        self.unit.methods.push((spec, erased));
        self
    }

    pub fn build(self) -> SnippetUnit {
        self.unit
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) struct UnitId(usize);

impl UnitId {
    pub(crate) fn index(self) -> usize {
        self.0
    }
}

/// Construction and shutdown hooks of a registered unit.
pub(crate) struct UnitEntry {
    name: String,
    constructor: Arc<Constructor>,
    construct_affinity: Affinity,
    shutdown: Arc<ShutdownHook>,
    shutdown_affinity: Affinity,
}

impl UnitEntry {
    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn construct_affinity(&self) -> Affinity {
        self.construct_affinity
    }

    pub(crate) fn shutdown_affinity(&self) -> Affinity {
        self.shutdown_affinity
    }

    pub(crate) fn constructor(&self) -> Arc<Constructor> {
        Arc::clone(&self.constructor)
    }

    pub(crate) fn shutdown_hook(&self) -> Arc<ShutdownHook> {
        Arc::clone(&self.shutdown)
    }
}

/// Name-indexed table of every callable method, built once at startup.
pub struct Registry {
    units: Vec<UnitEntry>,
    methods: HashMap<String, Arc<MethodDescriptor>>,
}

impl Registry {
    pub fn build<I>(units: I) -> Result<Self, RegistryError>
    where
        I: IntoIterator<Item = SnippetUnit>,
    {
        let mut entries = Vec::new();
        let mut unit_names = HashSet::new();
        let mut methods: HashMap<String, Arc<MethodDescriptor>> = HashMap::new();

        for unit in units {
            if !unit_names.insert(unit.name.clone()) {
                return Err(RegistryError::DuplicateUnit { unit: unit.name });
            }
            let unit_id = UnitId(entries.len());
            for (mut spec, handler) in unit.methods {
                if RESERVED_METHODS.contains(&spec.name.as_str()) {
                    return Err(RegistryError::ReservedName { method: spec.name, unit: unit.name });
                }
                if let Some(existing) = methods.get(&spec.name) {
                    return Err(RegistryError::DuplicateMethod {
                        method: spec.name,
                        first_unit: existing.unit.clone(),
                        second_unit: unit.name,
                    });
                }
                for (index, param) in spec.params.iter_mut().enumerate() {
                    let Some(raw) = param.default.clone() else { continue };
                    let value = param.parse_default(&raw).map_err(|message| {
                        RegistryError::InvalidDefault {
                            method: spec.name.clone(),
                            position: index + 1,
                            message,
                        }
                    })?;
                    param.default_value = Some(value);
                }
                let descriptor =
                    MethodDescriptor { spec, unit: unit.name.clone(), unit_id, handler };
                methods.insert(descriptor.spec.name.clone(), Arc::new(descriptor));
            }
            entries.push(UnitEntry {
                name: unit.name,
                constructor: unit.constructor,
                construct_affinity: unit.construct_affinity,
                shutdown: unit.shutdown,
                shutdown_affinity: unit.shutdown_affinity,
            });
        }

        log::debug!("registry: {} units, {} methods", entries.len(), methods.len());
        Ok(Self { units: entries, methods })
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<MethodDescriptor>> {
        self.methods.get(name).cloned()
    }

    pub fn method_names(&self) -> Vec<&str> {
        let mut names = self.methods.keys().map(String::as_str).collect::<Vec<_>>();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    /// Listing of every method, grouped by unit, both sorted by name.
    pub fn help_text(&self) -> String {
        let mut by_unit: BTreeMap<&str, BTreeMap<&str, String>> = BTreeMap::new();
        for descriptor in self.methods.values() {
            by_unit
                .entry(descriptor.unit())
                .or_default()
                .insert(descriptor.name(), descriptor.help_line());
        }
        let mut help = String::new();
        for (unit, lines) in by_unit {
            help.push_str(&format!("\nRPCs provided by {unit}:\n"));
            for line in lines.values() {
                help.push_str("  ");
                help.push_str(line);
                help.push('\n');
            }
        }
        help
    }

    pub(crate) fn units(&self) -> &[UnitEntry] {
        &self.units
    }

    pub(crate) fn unit(&self, id: UnitId) -> &UnitEntry {
        &self.units[id.index()]
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("units", &self.units.iter().map(UnitEntry::name).collect::<Vec<_>>())
            .field("methods", &self.method_names())
            .finish()
    }
}
