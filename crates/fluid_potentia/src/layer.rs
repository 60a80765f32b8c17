//! Layers, merge records and the desired state of one tree position
//!
//! A [`Potentia`] is what a parent asks for at a member position: layer
//! names plus typed [`MergeRecord`]s. Records are replaced wholesale per
//! type; the deep merge across all of them happens once, in the merge
//! engine.

use std::fmt;
use std::rc::Rc;

use rustc_hash::FxHashSet;

use crate::reference::is_reference;
use crate::value::{Table, Value};

/// One bundle of configuration key/value pairs
pub type Layer = Table;

/// Key holding a layer's (or record's) list of layer names
pub const LAYERS_KEY: &str = "$layers";

/// Well-known merge record types
pub mod record_type {
    /// Configuration supplied by the caller
    pub const USER: &str = "user";
    /// Configuration supplied by a view template
    pub const TEMPLATE: &str = "template";
    /// Configuration supplied by a parent's `$component` record
    pub const SUBCOMPONENT: &str = "subcomponent";
    /// Writes made through a proxy; always flattened last
    pub const LIVE: &str = "live";
}

/// Tags of the single-key record maps understood by the expander
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RecordKind {
    Method,
    Compute,
    Effect,
    Component,
    Linkage,
}

impl RecordKind {
    pub const ALL: [RecordKind; 5] = [
        RecordKind::Method,
        RecordKind::Compute,
        RecordKind::Effect,
        RecordKind::Component,
        RecordKind::Linkage,
    ];

    pub fn key(self) -> &'static str {
        match self {
            RecordKind::Method => "$method",
            RecordKind::Compute => "$compute",
            RecordKind::Effect => "$effect",
            RecordKind::Component => "$component",
            RecordKind::Linkage => "$linkage",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.key() == key)
    }

    fn is_invocation(self) -> bool {
        matches!(
            self,
            RecordKind::Method | RecordKind::Compute | RecordKind::Effect
        )
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key()[1..])
    }
}

/// Recognise a record: a map with exactly one key, which is a record tag
pub fn record_of(value: &Value) -> Option<(RecordKind, &Value)> {
    let table = value.as_map()?;
    if table.len() != 1 {
        return None;
    }
    let (key, body) = table.first()?;
    RecordKind::from_key(key).map(|kind| (kind, body))
}

/// Whether a table is a record rather than a plain nested map
pub fn is_record_table(table: &Table) -> bool {
    table.len() == 1
        && table
            .keys()
            .next()
            .map_or(false, |key| RecordKind::from_key(key).is_some())
}

/// Build a record value from its tag and body
pub fn record(kind: RecordKind, body: Value) -> Value {
    let mut table = Table::with_capacity(1);
    table.insert(kind.key().to_string(), body);
    Value::map(table)
}

/// A typed layer contributed to one tree position
#[derive(Clone, Debug, PartialEq)]
pub struct MergeRecord {
    pub record_type: String,
    pub layer: Rc<Layer>,
}

impl MergeRecord {
    /// Record with compact forms in `layer` expanded
    pub fn new(record_type: impl Into<String>, layer: Layer) -> Self {
        Self {
            record_type: record_type.into(),
            layer: Rc::new(normalize_layer(&layer)),
        }
    }

    pub fn user(layer: Layer) -> Self {
        Self::new(record_type::USER, layer)
    }

    /// Record from a JSON object; anything else yields an empty layer
    pub fn from_json(record_type: impl Into<String>, json: serde_json::Value) -> Self {
        let layer = Value::from_json(json).into_table().unwrap_or_default();
        Self::new(record_type, layer)
    }

    pub fn is_live(&self) -> bool {
        self.record_type == record_type::LIVE
    }
}

/// Desired state for one tree position
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Potentia {
    pub layer_names: Vec<String>,
    pub merge_records: Vec<MergeRecord>,
}

impl Potentia {
    pub fn new(layer_names: Vec<String>, merge_records: Vec<MergeRecord>) -> Self {
        Self {
            layer_names,
            merge_records,
        }
    }

    /// The "nothing configured here" sentinel
    pub fn is_empty(&self) -> bool {
        self.layer_names.is_empty() && self.merge_records.is_empty()
    }

    /// Fold an incoming push into this potentia
    ///
    /// An incoming record replaces every existing record of its type, taking
    /// the position of the first one; types not seen before are appended in
    /// arrival order. Layer names are replaced only when supplied.
    pub fn absorb(&mut self, incoming: Vec<MergeRecord>, layer_names: Option<Vec<String>>) {
        if let Some(names) = layer_names {
            self.layer_names = names;
        }
        if incoming.is_empty() {
            return;
        }

        let incoming_types: FxHashSet<String> =
            incoming.iter().map(|r| r.record_type.clone()).collect();
        let mut placed: FxHashSet<String> = FxHashSet::default();
        let mut merged = Vec::with_capacity(self.merge_records.len() + incoming.len());

        for existing in self.merge_records.drain(..) {
            if !incoming_types.contains(&existing.record_type) {
                merged.push(existing);
            } else if placed.insert(existing.record_type.clone()) {
                merged.extend(
                    incoming
                        .iter()
                        .filter(|r| r.record_type == existing.record_type)
                        .cloned(),
                );
            }
        }
        for record in incoming {
            if !placed.contains(&record.record_type) {
                merged.push(record);
            }
        }
        self.merge_records = merged;
    }

    /// Records in flattening order: everything else first, live writes last
    pub fn flatten_order(&self) -> impl Iterator<Item = &MergeRecord> {
        self.merge_records
            .iter()
            .filter(|r| !r.is_live())
            .chain(self.merge_records.iter().filter(|r| r.is_live()))
    }

    /// The layer accumulated from proxy writes, if any
    pub fn live_layer(&self) -> Option<&Layer> {
        self.merge_records
            .iter()
            .rev()
            .find(|r| r.is_live())
            .map(|r| r.layer.as_ref())
    }

    /// Layer names listed directly, including `$layers` carried by records
    pub fn direct_layer_names(&self) -> Vec<String> {
        let mut names = self.layer_names.clone();
        for record in self.flatten_order() {
            if let Some(listed) = record.layer.get(LAYERS_KEY) {
                for name in listed.string_list() {
                    if !names.contains(&name) {
                        names.push(name);
                    }
                }
            }
        }
        names
    }
}

// =============================================================================
// COMPACT FORMS
// =============================================================================

/// Expand compact/shorthand forms throughout a layer
///
/// - `"$layers": "name"` becomes a one-element list
/// - `"$compute": "sum({self}.a, 2)"` becomes `{funcName, args}`
/// - `"$method": "name"` becomes `{funcName}`, `"{ref}"` becomes `{func}`
/// - `"$component": "layerName"` becomes `{"$layers": ["layerName"]}`
pub fn normalize_layer(layer: &Layer) -> Layer {
    layer
        .iter()
        .map(|(key, value)| {
            let value = if key == LAYERS_KEY {
                Value::list(value.string_list().into_iter().map(Value::from).collect())
            } else {
                normalize_value(value)
            };
            (key.clone(), value)
        })
        .collect()
}

fn normalize_value(value: &Value) -> Value {
    if let Some((kind, body)) = record_of(value) {
        return record(kind, normalize_body(kind, body));
    }
    match value {
        Value::Map(table) => Value::map(normalize_layer(table)),
        other => other.clone(),
    }
}

fn normalize_body(kind: RecordKind, body: &Value) -> Value {
    match (kind, body) {
        (kind, Value::String(s)) if kind.is_invocation() => invocation_shorthand(s),
        (kind, Value::Func(f)) if kind.is_invocation() => {
            let mut table = Table::new();
            table.insert("func".to_string(), Value::Func(f.clone()));
            Value::map(table)
        }
        (RecordKind::Component, Value::String(s)) if !is_reference(s) => {
            let mut table = Table::new();
            table.insert(
                LAYERS_KEY.to_string(),
                Value::list(vec![Value::string(s.trim())]),
            );
            Value::map(table)
        }
        (RecordKind::Component, Value::Map(table)) => Value::map(normalize_layer(table)),
        (RecordKind::Linkage, Value::Map(table)) => Value::map(
            table
                .iter()
                .map(|(k, v)| {
                    let v = match k.as_str() {
                        "inputLayers" | "outputLayers" => {
                            Value::list(v.string_list().into_iter().map(Value::from).collect())
                        }
                        _ => v.clone(),
                    };
                    (k.clone(), v)
                })
                .collect(),
        ),
        _ => body.clone(),
    }
}

/// `name`, `name(a, b)` or `{ref}` to an invocation body
fn invocation_shorthand(source: &str) -> Value {
    let source = source.trim();
    let mut table = Table::new();
    if is_reference(source) {
        table.insert("func".to_string(), Value::string(source));
        return Value::map(table);
    }
    match source.find('(') {
        Some(open) if source.ends_with(')') => {
            let name = source[..open].trim();
            let inner = &source[open + 1..source.len() - 1];
            table.insert("funcName".to_string(), Value::string(name));
            table.insert("args".to_string(), Value::list(split_args(inner)));
        }
        _ => {
            table.insert("funcName".to_string(), Value::string(source));
        }
    }
    Value::map(table)
}

fn split_args(inner: &str) -> Vec<Value> {
    if inner.trim().is_empty() {
        return Vec::new();
    }
    // Commas inside quoted literals belong to the literal
    let mut args = Vec::new();
    let mut quote = None;
    let mut start = 0;
    for (i, c) in inner.char_indices() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '"' | '\'') => quote = Some(c),
            (None, ',') => {
                args.push(parse_literal(&inner[start..i]));
                start = i + 1;
            }
            _ => {}
        }
    }
    args.push(parse_literal(&inner[start..]));
    args
}

fn parse_literal(token: &str) -> Value {
    let token = token.trim();
    let quoted = token.len() >= 2
        && ((token.starts_with('"') && token.ends_with('"'))
            || (token.starts_with('\'') && token.ends_with('\'')));
    if quoted {
        return Value::string(&token[1..token.len() - 1]);
    }
    match token {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        "null" => Value::Null,
        _ => token
            .parse::<f64>()
            .map(Value::Number)
            .unwrap_or_else(|_| Value::string(token)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn layer(json: serde_json::Value) -> Layer {
        Value::from_json(json).into_table().unwrap_or_default()
    }

    fn xs(potentia: &Potentia) -> Vec<(String, Option<f64>)> {
        potentia
            .merge_records
            .iter()
            .map(|r| (r.record_type.clone(), r.layer.get("x").and_then(Value::as_f64)))
            .collect()
    }

    #[test]
    fn test_absorb_replaces_type_in_place() {
        let mut potentia = Potentia::default();
        potentia.absorb(
            vec![
                MergeRecord::from_json("a", json!({"x": 1})),
                MergeRecord::from_json("b", json!({"x": 2})),
            ],
            None,
        );
        potentia.absorb(vec![MergeRecord::from_json("a", json!({"x": 3}))], None);

        assert_eq!(
            xs(&potentia),
            vec![("a".to_string(), Some(3.0)), ("b".to_string(), Some(2.0))]
        );
    }

    #[test]
    fn test_absorb_appends_new_types_and_keeps_names() {
        let mut potentia = Potentia::new(vec!["base".into()], Vec::new());
        potentia.absorb(vec![MergeRecord::from_json("a", json!({"x": 1}))], None);
        potentia.absorb(vec![MergeRecord::from_json("c", json!({"x": 5}))], None);

        assert_eq!(potentia.layer_names, vec!["base".to_string()]);
        assert_eq!(
            xs(&potentia),
            vec![("a".to_string(), Some(1.0)), ("c".to_string(), Some(5.0))]
        );

        potentia.absorb(Vec::new(), Some(vec!["other".into()]));
        assert_eq!(potentia.layer_names, vec!["other".to_string()]);
    }

    #[test]
    fn test_live_records_flatten_last() {
        let mut potentia = Potentia::default();
        potentia.absorb(
            vec![
                MergeRecord::from_json(record_type::LIVE, json!({"x": 9})),
                MergeRecord::from_json(record_type::USER, json!({"x": 1})),
            ],
            None,
        );
        let order: Vec<&str> = potentia
            .flatten_order()
            .map(|r| r.record_type.as_str())
            .collect();
        assert_eq!(order, vec![record_type::USER, record_type::LIVE]);
        assert_eq!(
            potentia.live_layer().and_then(|l| l.get("x")).and_then(Value::as_f64),
            Some(9.0)
        );
    }

    #[test]
    fn test_direct_layer_names_include_record_layers() {
        let potentia = Potentia::new(
            vec!["a".into()],
            vec![MergeRecord::from_json(
                record_type::USER,
                json!({"$layers": ["b", "a"]}),
            )],
        );
        assert_eq!(potentia.direct_layer_names(), vec!["a", "b"]);
    }

    #[test]
    fn test_record_recognition() {
        let compute = Value::from_json(json!({"$compute": {"funcName": "sum"}}));
        assert_eq!(record_of(&compute).map(|(k, _)| k), Some(RecordKind::Compute));

        let two_keys = Value::from_json(json!({"$compute": {}, "other": 1}));
        assert!(record_of(&two_keys).is_none());

        let unknown = Value::from_json(json!({"$unknown": 1}));
        assert!(record_of(&unknown).is_none());
    }

    #[test]
    fn test_quoted_commas_stay_in_one_argument() {
        let normalized = normalize_layer(&layer(json!({
            "label": {"$compute": "join('a,b', \"c, d\", 2)"},
        })));

        let (_, body) = record_of(&normalized["label"]).unwrap();
        let args = body.as_map().unwrap()["args"].as_list().unwrap();
        assert_eq!(args.len(), 3);
        assert_eq!(args[0].as_str(), Some("a,b"));
        assert_eq!(args[1].as_str(), Some("c, d"));
        assert_eq!(args[2].as_f64(), Some(2.0));
    }

    #[test]
    fn test_normalize_compact_invocations() {
        let normalized = normalize_layer(&layer(json!({
            "$layers": "single",
            "total": {"$compute": "sum({self}.a, 2, 'two', true)"},
            "reset": {"$method": "reset"},
            "forward": {"$method": "{other}.reset"},
            "nested": {"child": {"$component": "widget"}},
        })));

        assert_eq!(normalized[LAYERS_KEY].string_list(), vec!["single"]);

        let (kind, body) = record_of(&normalized["total"]).unwrap();
        assert_eq!(kind, RecordKind::Compute);
        let body = body.as_map().unwrap();
        assert_eq!(body["funcName"].as_str(), Some("sum"));
        let args = body["args"].as_list().unwrap();
        assert_eq!(args[0].as_str(), Some("{self}.a"));
        assert_eq!(args[1].as_f64(), Some(2.0));
        assert_eq!(args[2].as_str(), Some("two"));
        assert_eq!(args[3].as_bool(), Some(true));

        let (_, reset) = record_of(&normalized["reset"]).unwrap();
        assert_eq!(reset.as_map().unwrap()["funcName"].as_str(), Some("reset"));

        let (_, forward) = record_of(&normalized["forward"]).unwrap();
        assert_eq!(forward.as_map().unwrap()["func"].as_str(), Some("{other}.reset"));

        let child = &normalized["nested"].as_map().unwrap()["child"];
        let (kind, body) = record_of(child).unwrap();
        assert_eq!(kind, RecordKind::Component);
        assert_eq!(body.as_map().unwrap()[LAYERS_KEY].string_list(), vec!["widget"]);
    }

    #[test]
    fn test_normalize_keeps_injection_reference() {
        let normalized = normalize_layer(&layer(json!({"peer": {"$component": "{sibling}"}})));
        let (_, body) = record_of(&normalized["peer"]).unwrap();
        assert_eq!(body.as_str(), Some("{sibling}"));
    }
}
