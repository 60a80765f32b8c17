//! Proxy materializer
//!
//! A [`Proxy`] is the read/write facade over one component, or over a
//! signal-bearing subtree of it. Reads dereference reactive cells; nested
//! signal-bearing maps and sub-components come back as further proxies,
//! memoized per path so repeated access yields the same `Rc`.
//!
//! Writes never touch cells directly. They are folded into the
//! component's `live` merge record and flow back through the merge engine.

use std::rc::{Rc, Weak};

use crate::error::{InstantiatorError, Result};
use crate::instantiator::Instantiator;
use crate::layer::{is_record_table, record_type, MergeRecord, LAYERS_KEY};
use crate::reference::{follow, settle};
use crate::shadow::{LifecycleStatus, ShadowId};
use crate::value::{Site, Table, Value};

/// Result of reading one key through a proxy
#[derive(Clone, Debug)]
pub enum Facet {
    /// A plain value, reactive handles already read
    Value(Value),
    /// A sub-component or a nested signal-bearing map
    Proxy(Rc<Proxy>),
}

impl Facet {
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Facet::Value(value) => Some(value),
            Facet::Proxy(_) => None,
        }
    }

    pub fn as_proxy(&self) -> Option<&Rc<Proxy>> {
        match self {
            Facet::Proxy(proxy) => Some(proxy),
            Facet::Value(_) => None,
        }
    }

    /// Plain value, settling a proxy's subtree if needed
    pub fn into_value(self) -> Value {
        match self {
            Facet::Value(value) => value,
            Facet::Proxy(proxy) => proxy.value(),
        }
    }
}

/// Read/write facade over a component
pub struct Proxy {
    inst: Weak<Instantiator>,
    component: ShadowId,
    segs: Vec<String>,
}

impl std::fmt::Debug for Proxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Proxy")
            .field("component", &self.component)
            .field("segs", &self.segs)
            .finish()
    }
}

impl Proxy {
    pub(crate) fn new(inst: Weak<Instantiator>, component: ShadowId, segs: Vec<String>) -> Self {
        Self {
            inst,
            component,
            segs,
        }
    }

    pub fn component(&self) -> ShadowId {
        self.component
    }

    /// Key path inside the component; empty for the component itself
    pub fn segs(&self) -> &[String] {
        &self.segs
    }

    /// `component.path#seg.seg`
    pub fn path(&self) -> String {
        let path = self
            .inst
            .upgrade()
            .and_then(|inst| inst.path_of(self.component))
            .unwrap_or_default();
        self.site_for(path, self.segs.clone()).to_string()
    }

    /// Status of the component; a removed component reads as destroyed
    pub fn lifecycle_status(&self) -> LifecycleStatus {
        self.inst
            .upgrade()
            .and_then(|inst| inst.status_of(self.component))
            .unwrap_or(LifecycleStatus::Destroyed)
    }

    fn instantiator(&self) -> Result<Rc<Instantiator>> {
        self.inst
            .upgrade()
            .ok_or_else(|| InstantiatorError::NotRegistered {
                path: self.segs.join("."),
            })
    }

    fn site_for(&self, path: String, segs: Vec<String>) -> Site {
        Site::new(self.component, path, segs)
    }

    /// Dereferenced value at `segs` inside the component (tracked)
    fn locate(&self, inst: &Instantiator, segs: &[String]) -> Value {
        if segs.is_empty() {
            return inst.expanded(self.component).unwrap_or_else(|| {
                Value::unavailable("component has been destroyed", None)
            });
        }
        follow(
            inst,
            inst.graph(),
            Value::Component(self.component),
            segs,
            self.component,
        )
    }

    // =========================================================================
    // READS
    // =========================================================================

    /// Read one key
    pub fn get(&self, key: &str) -> Facet {
        let Ok(inst) = self.instantiator() else {
            return Facet::Value(Value::unavailable("instantiator dropped", None));
        };
        let mut segs = self.segs.clone();
        segs.push(key.to_string());
        let value = self.locate(&inst, &segs);
        match value {
            Value::Component(id) if inst.is_alive(id) => Facet::Proxy(inst.proxy_at(id, Vec::new())),
            Value::Component(_) => Facet::Value(Value::unavailable(
                "component has been destroyed",
                Some(self.site_for(inst.path_of(self.component).unwrap_or_default(), segs)),
            )),
            Value::Map(ref table) if !is_record_table(table) && value.bears_signals() => {
                Facet::Proxy(inst.proxy_at(self.component, segs))
            }
            other => Facet::Value(settle(inst.graph(), other)),
        }
    }

    /// Snapshot of the whole subtree, sub-components left as handles
    pub fn value(&self) -> Value {
        let Ok(inst) = self.instantiator() else {
            return Value::unavailable("instantiator dropped", None);
        };
        settle(inst.graph(), self.locate(&inst, &self.segs))
    }

    /// Keys readable through this proxy
    ///
    /// At the component level this includes children pushed directly and
    /// injected components.
    pub fn keys(&self) -> Vec<String> {
        let Ok(inst) = self.instantiator() else {
            return Vec::new();
        };
        let mut keys: Vec<String> = self
            .locate(&inst, &self.segs)
            .as_map()
            .map(|table| {
                table
                    .keys()
                    .filter(|key| key.as_str() != LAYERS_KEY)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        if self.segs.is_empty() {
            let members = inst
                .with_shadow(self.component, |s| {
                    s.child_components
                        .keys()
                        .chain(s.injected_children.keys())
                        .cloned()
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default();
            for member in members {
                if !keys.contains(&member) {
                    keys.push(member);
                }
            }
        }
        keys
    }

    // =========================================================================
    // CALLS & WRITES
    // =========================================================================

    /// Call the method stored at `key`
    ///
    /// Anything other than a function yields an unavailable value.
    pub fn call(&self, key: &str, args: &[Value]) -> Result<Value> {
        let inst = self.instantiator()?;
        let mut segs = self.segs.clone();
        segs.push(key.to_string());
        inst.entry(|| {
            let target = inst.graph().untrack(|| self.locate(&inst, &segs));
            Ok(match target {
                Value::Func(func) => func.call(&inst, args),
                Value::Unavailable(u) => Value::Unavailable(u),
                other => Value::unavailable(
                    format!("\"{}\" is a {}, not a method", key, other.kind()),
                    Some(self.site_for(inst.path_of(self.component).unwrap_or_default(), segs.clone())),
                ),
            })
        })
    }

    /// Write `key` through the component's `live` record
    pub fn set(&self, key: &str, value: impl Into<Value>) -> Result<()> {
        let inst = self.instantiator()?;
        let mut segs = self.segs.clone();
        segs.push(key.to_string());
        let value = value.into();
        inst.entry(|| inst.write_live(self.component, &segs, value))
    }
}

impl Instantiator {
    /// Fold a write into the component's `live` record
    pub(crate) fn write_live(&self, id: ShadowId, segs: &[String], value: Value) -> Result<()> {
        let Some((cell, status, path)) = self.with_shadow(id, |s| (s.potentia, s.status, s.path.clone()))
        else {
            return Err(InstantiatorError::NotRegistered {
                path: segs.join("."),
            });
        };
        if id == self.root() {
            return Err(InstantiatorError::MalformedRecord {
                kind: record_type::LIVE.to_string(),
                site: segs.join("."),
                reason: "the tree root holds no configuration".to_string(),
            });
        }
        if status.is_ending() {
            return Err(InstantiatorError::AlreadyDestroyed { path, status });
        }

        let mut potentia = self.graph().get_untracked(cell).unwrap_or_default();
        let mut live = potentia.live_layer().cloned().unwrap_or_default();
        set_path(&mut live, segs, value);
        potentia.absorb(vec![MergeRecord::new(record_type::LIVE, live)], None);
        tracing::debug!("live write at {:?}#{}", path, segs.join("."));
        self.graph().set(cell, potentia);
        Ok(())
    }
}

/// Insert `value` at `segs`, replacing non-map steps with empty maps
fn set_path(table: &mut Table, segs: &[String], value: Value) {
    let Some((last, parents)) = segs.split_last() else {
        return;
    };
    let mut current = table;
    for segment in parents {
        let entry = current
            .entry(segment.clone())
            .or_insert_with(|| Value::map(Table::new()));
        if !matches!(entry, Value::Map(inner) if !is_record_table(inner)) {
            *entry = Value::map(Table::new());
        }
        let Value::Map(inner) = entry else {
            return;
        };
        current = Rc::make_mut(inner);
    }
    current.insert(last.clone(), value);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_set_path_builds_nested_maps() {
        let mut live = Value::from_json(json!({"style": {"color": "red"}, "label": 1}))
            .into_table()
            .unwrap();
        set_path(
            &mut live,
            &["style".to_string(), "size".to_string()],
            Value::from(4),
        );
        set_path(
            &mut live,
            &["label".to_string(), "text".to_string()],
            Value::from("hi"),
        );

        let style = live["style"].as_map().unwrap();
        assert_eq!(style["color"].as_str(), Some("red"));
        assert_eq!(style["size"].as_f64(), Some(4.0));
        assert_eq!(live["label"].as_map().unwrap()["text"].as_str(), Some("hi"));
    }
}
