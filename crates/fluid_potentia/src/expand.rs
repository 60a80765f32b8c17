//! Record expander
//!
//! Turns a component's flattened configuration into its expanded tree:
//!
//! | Value in the flat table          | Expanded into                          |
//! |----------------------------------|----------------------------------------|
//! | plain value                      | writable cell                          |
//! | `"{context}.path"`               | live reference                         |
//! | `{"$compute": {func, args}}`     | derived computation                    |
//! | `{"$effect": {func, args}}`      | reaction, optionally returning cleanup |
//! | `{"$method": {func, args}}`      | callable bound to the component        |
//! | `{"$component": {...}}`          | child component                        |
//! | `{"$component": "{ref}"}`        | injected component                     |
//! | `{"$linkage": {...}}`            | linkage rule                           |
//!
//! Constructs are keyed by their dotted key path and reused across reruns
//! while their record is unchanged, so handles handed out earlier stay
//! valid. Constructs whose key disappears are disposed.

use std::rc::Rc;

use fluid_core::reactive::{Cleanup, Derived, Effect, Signal};
use indexmap::IndexMap;

use crate::error::InstantiatorError;
use crate::events::LifecycleEventKind;
use crate::instantiator::Instantiator;
use crate::layer::{record_of, record_type, MergeRecord, RecordKind, LAYERS_KEY};
use crate::merge::MergeOutcome;
use crate::reference::{
    fetch_context_reference, is_reference, parse_reference, settle, ContextName, Reference,
};
use crate::registry::LinkageRule;
use crate::shadow::{join_path, LifecycleStatus, ShadowId};
use crate::value::{NativeFn, Reactive, Site, Table, Value};

/// What the last expansion of a component built
#[derive(Default)]
pub(crate) struct Expansion {
    /// Flat configuration the constructs were built from
    pub flat: Option<Value>,
    pub constructs: IndexMap<String, Construct>,
}

impl Expansion {
    /// Key path and kind of every construct
    pub(crate) fn summary(&self) -> Vec<(String, &'static str)> {
        self.constructs
            .iter()
            .map(|(key, construct)| (key.clone(), construct.kind()))
            .collect()
    }
}

/// One reactive construct owned by a component's expansion
pub(crate) enum Construct {
    Cell {
        cell: Signal<Value>,
        /// Configuration value the cell was last set from
        source: Value,
    },
    Reference {
        source: Rc<str>,
        reference: Reference,
    },
    Compute {
        record: Value,
        derived: Derived<Value>,
        refs: Vec<Reference>,
    },
    Reaction {
        record: Value,
        effect: Effect,
        refs: Vec<Reference>,
    },
    Method {
        record: Value,
        func: NativeFn,
        refs: Vec<Reference>,
    },
    Child {
        record: Value,
        child: ShadowId,
    },
    Injection {
        record: Value,
        effect: Effect,
        cell: Signal<Value>,
        reference: Reference,
    },
    Linkage {
        record: Value,
    },
}

impl Construct {
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Construct::Cell { .. } => "cell",
            Construct::Reference { .. } => "reference",
            Construct::Compute { .. } => "compute",
            Construct::Reaction { .. } => "effect",
            Construct::Method { .. } => "method",
            Construct::Child { .. } => "component",
            Construct::Injection { .. } => "injection",
            Construct::Linkage { .. } => "linkage",
        }
    }

    fn record(&self) -> Option<&Value> {
        match self {
            Construct::Compute { record, .. }
            | Construct::Reaction { record, .. }
            | Construct::Method { record, .. }
            | Construct::Child { record, .. }
            | Construct::Injection { record, .. }
            | Construct::Linkage { record } => Some(record),
            Construct::Cell { .. } | Construct::Reference { .. } => None,
        }
    }

    /// Value standing for this construct in the expanded tree
    fn value(&self) -> Value {
        match self {
            Construct::Cell { cell, .. } | Construct::Injection { cell, .. } => {
                Value::Reactive(Reactive::Cell(*cell))
            }
            Construct::Reference { reference, .. } => Value::Reactive(reference.handle()),
            Construct::Compute { derived, .. } => Value::Reactive(Reactive::Derived(*derived)),
            Construct::Method { func, .. } => Value::Func(func.clone()),
            Construct::Child { child, .. } => Value::Component(*child),
            Construct::Reaction { .. } | Construct::Linkage { .. } => Value::Null,
        }
    }
}

/// Release whatever a construct holds
pub(crate) fn dispose_construct(
    inst: &Instantiator,
    owner: ShadowId,
    key: &str,
    construct: Construct,
) {
    let graph = inst.graph();
    match construct {
        Construct::Cell { cell, .. } => graph.dispose_signal(cell),
        Construct::Reference { reference, .. } => reference.dispose(graph),
        Construct::Compute { derived, refs, .. } => {
            graph.dispose_derived(derived);
            refs.iter().for_each(|r| r.dispose(graph));
        }
        Construct::Reaction { effect, refs, .. } => {
            graph.dispose_effect(effect);
            refs.iter().for_each(|r| r.dispose(graph));
        }
        Construct::Method { refs, .. } => refs.iter().for_each(|r| r.dispose(graph)),
        Construct::Child { child, .. } => {
            if inst.is_alive(child) && inst.parent_of(child) == Some(owner) {
                if let Some(path) = inst.path_of(child) {
                    if let Err(err) = inst.destroy_path(&path) {
                        inst.record_fault(err);
                    }
                }
            }
        }
        Construct::Injection {
            effect,
            cell,
            reference,
            ..
        } => {
            graph.dispose_effect(effect);
            if let Some(owner_path) = inst.path_of(owner) {
                inst.remove_injection(&join_path(&owner_path, key));
            }
            reference.dispose(graph);
            graph.dispose_signal(cell);
        }
        Construct::Linkage { .. } => inst.linkages().remove(owner, key),
    }
}

// =============================================================================
// INVOCATIONS
// =============================================================================

enum Target {
    Named(Rc<str>),
    Direct(NativeFn),
    Referenced(Reference),
}

enum Arg {
    Literal(Value),
    Referenced(Reference),
    /// `{arguments}.N...`, bound when a method is called
    Call(usize, Vec<String>),
}

/// A parsed `{func, funcName, args}` body
struct Invocation {
    target: Target,
    args: Vec<Arg>,
    args_given: bool,
    site: Site,
}

impl Invocation {
    fn parse(
        inst: &Instantiator,
        owner: ShadowId,
        kind: RecordKind,
        body: &Value,
        site: &Site,
    ) -> Result<Self, InstantiatorError> {
        let malformed = |reason: String| InstantiatorError::MalformedRecord {
            kind: kind.to_string(),
            site: site.to_string(),
            reason,
        };
        let Some(table) = body.as_map() else {
            return Err(malformed(format!("expected a map, found a {}", body.kind())));
        };

        let raw_args: Vec<Value> = match table.get("args") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::List(items)) => items.iter().cloned().collect(),
            Some(single) => vec![single.clone()],
        };
        let args_given = !matches!(table.get("args"), None | Some(Value::Null));

        // Validate every reference before any derived gets allocated
        let func_ref = match table.get("func") {
            Some(Value::String(s)) if is_reference(s) => Some(parse_reference(s)?),
            _ => None,
        };
        let mut parsed_args = Vec::with_capacity(raw_args.len());
        for arg in &raw_args {
            match arg {
                Value::String(s) if is_reference(s) => parsed_args.push(Some(parse_reference(s)?)),
                _ => parsed_args.push(None),
            }
        }

        let target = match (table.get("func"), table.get("funcName"), func_ref) {
            (Some(Value::String(s)), _, Some(_)) => Target::Referenced(fetch_context_reference(
                inst,
                s,
                owner,
                site.segs.clone(),
            )?),
            (Some(Value::Func(f)), _, _) => Target::Direct(f.clone()),
            (Some(Value::String(name)), _, None) | (None, Some(Value::String(name)), _) => {
                Target::Named(name.clone())
            }
            _ => return Err(malformed("missing func or funcName".to_string())),
        };

        let mut args = Vec::with_capacity(raw_args.len());
        for (raw, parsed) in raw_args.into_iter().zip(parsed_args) {
            let arg = match parsed {
                Some(parsed)
                    if kind == RecordKind::Method && parsed.context == ContextName::Arguments =>
                {
                    let mut path = parsed.path.into_iter();
                    let Some(index) = path.next().and_then(|seg| seg.parse::<usize>().ok())
                    else {
                        return Err(malformed(
                            "{arguments} must be followed by an argument index".to_string(),
                        ));
                    };
                    Arg::Call(index, path.collect())
                }
                Some(_) => Arg::Referenced(fetch_context_reference(
                    inst,
                    raw.as_str().unwrap_or_default(),
                    owner,
                    site.segs.clone(),
                )?),
                None => Arg::Literal(raw),
            };
            args.push(arg);
        }

        Ok(Self {
            target,
            args,
            args_given,
            site: site.clone(),
        })
    }

    /// Every reference handle this invocation holds
    fn references(&self) -> Vec<Reference> {
        let mut refs = Vec::new();
        if let Target::Referenced(reference) = &self.target {
            refs.push(reference.clone());
        }
        for arg in &self.args {
            if let Arg::Referenced(reference) = arg {
                refs.push(reference.clone());
            }
        }
        refs
    }

    fn function(&self, inst: &Instantiator) -> Result<NativeFn, Value> {
        match &self.target {
            Target::Direct(func) => Ok(func.clone()),
            Target::Named(name) => inst.functions().get(name).ok_or_else(|| {
                Value::unavailable(
                    format!("function \"{}\" is not registered", name),
                    Some(self.site.clone()),
                )
            }),
            Target::Referenced(reference) => match reference.read(inst.graph()) {
                Value::Func(func) => Ok(func),
                Value::Unavailable(u) => Err(Value::Unavailable(u)),
                other => Err(Value::unavailable(
                    format!("{} is a {}, not a function", reference.source, other.kind()),
                    Some(self.site.clone()),
                )),
            },
        }
    }

    /// Current argument values; the first unavailable one short-circuits
    fn arguments(&self, inst: &Instantiator, call_args: &[Value]) -> Result<Vec<Value>, Value> {
        let mut values = Vec::with_capacity(self.args.len());
        for arg in &self.args {
            let value = match arg {
                Arg::Literal(value) => value.clone(),
                Arg::Referenced(reference) => reference.read(inst.graph()),
                Arg::Call(index, path) => {
                    pluck(call_args.get(*index).cloned().unwrap_or_default(), path)
                }
            };
            if value.is_unavailable() {
                return Err(value);
            }
            values.push(value);
        }
        Ok(values)
    }

    fn evaluate(&self, inst: &Instantiator, call_args: &[Value]) -> Value {
        let func = match self.function(inst) {
            Ok(func) => func,
            Err(unavailable) => return unavailable,
        };
        let args = match self.arguments(inst, call_args) {
            Ok(args) => args,
            Err(unavailable) => return unavailable,
        };
        settle(inst.graph(), func.call(inst, &args))
    }
}

/// Follow plain keys and list indexes into a call argument
fn pluck(value: Value, path: &[String]) -> Value {
    let mut current = value;
    for segment in path {
        let next = match &current {
            Value::Map(table) => table.get(segment).cloned(),
            Value::List(items) => segment
                .parse::<usize>()
                .ok()
                .and_then(|index| items.get(index).cloned()),
            _ => None,
        };
        current = match next {
            Some(value) => value,
            None => return Value::unavailable(format!("no argument key \"{}\"", segment), None),
        };
    }
    current
}

fn cause_of(value: &Value) -> String {
    value
        .as_unavailable()
        .map(|u| u.to_string())
        .unwrap_or_default()
}

// =============================================================================
// EXPANSION
// =============================================================================

/// Re-expand a component whenever its merge outcome changes
pub(crate) fn create_expansion_effect(
    inst: &Instantiator,
    id: ShadowId,
    merge: Derived<MergeOutcome>,
) -> Effect {
    let this = inst.weak();
    inst.graph().create_effect(move |graph| {
        let Some(inst) = this.upgrade() else {
            return;
        };
        let Some(outcome) = graph.get_derived(merge) else {
            return;
        };
        graph.untrack(|| expand_component(&inst, id, outcome.flat));
    })
}

fn expand_component(inst: &Instantiator, id: ShadowId, flat: Value) {
    let graph = inst.graph();
    let Some((status, path, expanded_cell, previous)) = inst.with_shadow_mut(id, |s| {
        (
            s.status,
            s.path.clone(),
            s.expanded,
            std::mem::take(&mut s.expansion),
        )
    }) else {
        return;
    };
    let unchanged = status == LifecycleStatus::Live && previous.flat.as_ref() == Some(&flat);
    if status.is_ending() || unchanged {
        inst.with_shadow_mut(id, |s| s.expansion = previous);
        return;
    }

    let mut expander = Expander {
        inst,
        owner: id,
        path: path.clone(),
        old: previous.constructs,
        next: IndexMap::new(),
        segs: Vec::new(),
    };
    let expanded = match &flat {
        Value::Map(table) => Value::map(expander.expand_table(table)),
        Value::Unavailable(_) => flat.clone(),
        other => Value::unavailable(
            format!("merged configuration is a {}", other.kind()),
            Some(Site::new(id, path.clone(), Vec::new())),
        ),
    };
    let Expander { old, next, .. } = expander;
    for (key, construct) in old {
        dispose_construct(inst, id, &key, construct);
    }

    let kept = inst
        .with_shadow(id, |s| s.status != LifecycleStatus::Destroyed)
        .unwrap_or(false);
    if !kept {
        for (key, construct) in next {
            dispose_construct(inst, id, &key, construct);
        }
        return;
    }
    inst.with_shadow_mut(id, |s| {
        s.expansion = Expansion {
            flat: Some(flat),
            constructs: next,
        }
    });

    if graph.get_untracked(expanded_cell).as_ref() != Some(&expanded) {
        graph.set(expanded_cell, expanded);
    }

    let created = inst
        .with_shadow_mut(id, |s| {
            if s.status == LifecycleStatus::Constructing {
                s.status = LifecycleStatus::Live;
                Some((s.key.clone(), s.parent))
            } else {
                None
            }
        })
        .flatten();
    if let Some((key, parent)) = created {
        inst.emit(inst.event(LifecycleEventKind::Create, id, &path, &key, parent, true));
    }
}

struct Expander<'a> {
    inst: &'a Instantiator,
    owner: ShadowId,
    path: String,
    /// Constructs of the previous run not claimed yet
    old: IndexMap<String, Construct>,
    next: IndexMap<String, Construct>,
    segs: Vec<String>,
}

impl Expander<'_> {
    fn site(&self) -> Site {
        Site::new(self.owner, self.path.clone(), self.segs.clone())
    }

    fn fault(&self, err: InstantiatorError) -> Value {
        let value = Value::unavailable(err.to_string(), Some(self.site()));
        self.inst.record_fault(err);
        value
    }

    fn install(&mut self, key: String, construct: Construct) -> Value {
        if self.inst.config().trace_expansion {
            tracing::trace!("{}#{} -> {}", self.path, key, construct.kind());
        }
        let value = construct.value();
        self.next.insert(key, construct);
        value
    }

    fn dispose(&self, key: &str, construct: Construct) {
        dispose_construct(self.inst, self.owner, key, construct);
    }

    fn expand_table(&mut self, table: &Table) -> Table {
        let mut out = Table::with_capacity(table.len());
        for (key, value) in table {
            if key == LAYERS_KEY {
                out.insert(key.clone(), value.clone());
                continue;
            }
            self.segs.push(key.clone());
            let expanded = self.expand_entry(value);
            self.segs.pop();
            out.insert(key.clone(), expanded);
        }
        out
    }

    fn expand_entry(&mut self, value: &Value) -> Value {
        let key = self.segs.join(".");
        let previous = self.old.shift_remove(&key);
        if let Some((kind, body)) = record_of(value) {
            return self.expand_record(key, kind, body, value, previous);
        }
        match value {
            Value::Map(table) => {
                if let Some(previous) = previous {
                    self.dispose(&key, previous);
                }
                Value::map(self.expand_table(table))
            }
            Value::String(source) if is_reference(source) => {
                self.expand_reference(key, source, previous)
            }
            _ => self.expand_cell(key, value, previous),
        }
    }

    fn expand_cell(&mut self, key: String, value: &Value, previous: Option<Construct>) -> Value {
        let inst = self.inst;
        let graph = inst.graph();
        let cell = match previous {
            Some(Construct::Cell { cell, source }) => {
                if source != *value {
                    graph.set(cell, value.clone());
                }
                cell
            }
            other => {
                if let Some(other) = other {
                    self.dispose(&key, other);
                }
                graph.create_signal(value.clone())
            }
        };
        self.install(
            key,
            Construct::Cell {
                cell,
                source: value.clone(),
            },
        )
    }

    fn expand_reference(
        &mut self,
        key: String,
        source: &Rc<str>,
        previous: Option<Construct>,
    ) -> Value {
        match previous {
            Some(Construct::Reference {
                source: old,
                reference,
            }) if old == *source => self.install(
                key,
                Construct::Reference {
                    source: old,
                    reference,
                },
            ),
            other => {
                if let Some(other) = other {
                    self.dispose(&key, other);
                }
                match fetch_context_reference(self.inst, source, self.owner, self.segs.clone()) {
                    Ok(reference) => self.install(
                        key,
                        Construct::Reference {
                            source: source.clone(),
                            reference,
                        },
                    ),
                    Err(err) => self.fault(err),
                }
            }
        }
    }

    fn expand_record(
        &mut self,
        key: String,
        kind: RecordKind,
        body: &Value,
        record: &Value,
        previous: Option<Construct>,
    ) -> Value {
        let inst = self.inst;
        if let Some(previous) = previous {
            // A child destroyed on its own stays gone until its record changes
            if previous.record() == Some(record) {
                return self.install(key, previous);
            }
            // A live child takes the new record in place
            let repush = kind == RecordKind::Component
                && body.as_map().is_some()
                && matches!(&previous, Construct::Child { child, .. } if inst.is_alive(*child));
            if !repush {
                self.dispose(&key, previous);
            }
        }

        match kind {
            RecordKind::Compute | RecordKind::Effect | RecordKind::Method => {
                let site = self.site();
                let invocation = match Invocation::parse(inst, self.owner, kind, body, &site) {
                    Ok(invocation) => invocation,
                    Err(err) => return self.fault(err),
                };
                let construct = match kind {
                    RecordKind::Compute => self.build_compute(record, invocation),
                    RecordKind::Effect => self.build_reaction(record, invocation),
                    _ => self.build_method(&key, record, invocation),
                };
                self.install(key, construct)
            }
            RecordKind::Component => match body {
                Value::Map(layer) => self.build_child(key, record, layer),
                Value::String(source) if is_reference(source) => {
                    self.build_injection(key, record, source)
                }
                other => self.fault(InstantiatorError::MalformedRecord {
                    kind: kind.to_string(),
                    site: self.site().to_string(),
                    reason: format!("expected a map or a reference, found a {}", other.kind()),
                }),
            },
            RecordKind::Linkage => self.build_linkage(key, record, body),
        }
    }

    fn build_compute(&self, record: &Value, invocation: Invocation) -> Construct {
        let refs = invocation.references();
        let this = self.inst.weak();
        let derived = self.inst.graph().create_derived(move |_| {
            let Some(inst) = this.upgrade() else {
                return Value::unavailable("instantiator dropped", None);
            };
            invocation.evaluate(&inst, &[])
        });
        Construct::Compute {
            record: record.clone(),
            derived,
            refs,
        }
    }

    fn build_reaction(&self, record: &Value, invocation: Invocation) -> Construct {
        let refs = invocation.references();
        let this = self.inst.weak();
        let effect = self.inst.graph().create_reaction(move |_| {
            let inst = this.upgrade()?;
            let func = match invocation.function(&inst) {
                Ok(func) => func,
                Err(unavailable) => {
                    tracing::debug!("effect at {} skipped: {}", invocation.site, cause_of(&unavailable));
                    return None;
                }
            };
            let args = match invocation.arguments(&inst, &[]) {
                Ok(args) => args,
                Err(unavailable) => {
                    tracing::debug!("effect at {} skipped: {}", invocation.site, cause_of(&unavailable));
                    return None;
                }
            };
            let Value::Func(disposer) = func.call(&inst, &args) else {
                return None;
            };
            let this = inst.weak();
            Some(Box::new(move || {
                if let Some(inst) = this.upgrade() {
                    disposer.call(&inst, &[]);
                }
            }) as Cleanup)
        });
        Construct::Reaction {
            record: record.clone(),
            effect,
            refs,
        }
    }

    fn build_method(&self, key: &str, record: &Value, invocation: Invocation) -> Construct {
        let refs = invocation.references();
        let owner = self.owner;
        let func = NativeFn::new(format!("{}#{}", self.path, key), move |inst, call_args| {
            if invocation.args_given {
                return invocation.evaluate(inst, call_args);
            }
            let func = match invocation.function(inst) {
                Ok(func) => func,
                Err(unavailable) => return unavailable,
            };
            let mut args = Vec::with_capacity(call_args.len() + 1);
            args.push(Value::Component(owner));
            args.extend_from_slice(call_args);
            settle(inst.graph(), func.call(inst, &args))
        });
        Construct::Method {
            record: record.clone(),
            func,
            refs,
        }
    }

    fn build_child(&mut self, key: String, record: &Value, layer: &Rc<Table>) -> Value {
        let records = vec![MergeRecord::new(
            record_type::SUBCOMPONENT,
            layer.as_ref().clone(),
        )];
        match self.inst.push_inner(self.owner, &key, records, None) {
            Ok(Some(child)) => self.install(
                key,
                Construct::Child {
                    record: record.clone(),
                    child,
                },
            ),
            Ok(None) => Value::Null,
            Err(err) => self.fault(err),
        }
    }

    fn build_injection(&mut self, key: String, record: &Value, source: &Rc<str>) -> Value {
        let inst = self.inst;
        let graph = inst.graph();
        let reference = match fetch_context_reference(inst, source, self.owner, self.segs.clone())
        {
            Ok(reference) => reference,
            Err(err) => return self.fault(err),
        };
        let cell = graph.create_signal(Value::Null);

        let this = inst.weak();
        let owner = self.owner;
        let member_key = key.clone();
        let handle = reference.handle();
        let source = source.clone();
        let effect = graph.create_effect(move |graph| {
            let Some(inst) = this.upgrade() else {
                return;
            };
            let resolved = handle.read(graph);
            graph.untrack(|| {
                let target = resolved.as_component().filter(|id| inst.is_alive(*id));
                let value = match target {
                    Some(id) => match inst.record_injection(owner, &member_key, Some(id)) {
                        Ok(()) => Value::Component(id),
                        Err(err) => {
                            let value = Value::unavailable(err.to_string(), None);
                            inst.record_fault(err);
                            value
                        }
                    },
                    None => {
                        if let Err(err) = inst.record_injection(owner, &member_key, None) {
                            inst.record_fault(err);
                        }
                        if resolved.is_unavailable() {
                            resolved.clone()
                        } else {
                            Value::unavailable(
                                format!("{} does not resolve to a live component", source),
                                None,
                            )
                        }
                    }
                };
                if graph.get_untracked(cell).as_ref() != Some(&value) {
                    graph.set(cell, value);
                }
            });
        });

        self.install(
            key,
            Construct::Injection {
                record: record.clone(),
                effect,
                cell,
                reference,
            },
        )
    }

    fn build_linkage(&mut self, key: String, record: &Value, body: &Value) -> Value {
        let lists = body.as_map().map(|table| {
            (
                table.get("inputLayers").map(Value::string_list).unwrap_or_default(),
                table.get("outputLayers").map(Value::string_list).unwrap_or_default(),
            )
        });
        let (inputs, outputs) = match lists {
            Some((inputs, outputs)) if !inputs.is_empty() && !outputs.is_empty() => (inputs, outputs),
            _ => {
                return self.fault(InstantiatorError::MalformedRecord {
                    kind: RecordKind::Linkage.to_string(),
                    site: self.site().to_string(),
                    reason: "inputLayers and outputLayers must both name layers".to_string(),
                })
            }
        };
        self.inst.linkages().register(LinkageRule {
            owner: self.owner,
            key: key.clone(),
            inputs,
            outputs,
        });
        self.install(
            key,
            Construct::Linkage {
                record: record.clone(),
            },
        )
    }
}
