//! Potentia merge engine
//!
//! One derived computation per component flattens its potentia into a
//! single nested table:
//!
//! 1. direct layer names (potentia names plus `$layers` carried by records),
//!    widened by linkage rules until nothing new fires
//! 2. the layer hierarchy, most-general first
//! 3. the merge records in order, `live` records last
//!
//! Later layers override earlier ones key by key; plain nested maps merge
//! recursively, records and non-map values replace wholesale.

use std::rc::Rc;

use fluid_core::reactive::{Derived, Signal};

use crate::instantiator::Instantiator;
use crate::layer::{is_record_table, Potentia, LAYERS_KEY};
use crate::shadow::ShadowId;
use crate::value::{Site, Table, Value};

/// Result of flattening one potentia
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MergeOutcome {
    /// Layer names the component carries directly, linkage outputs included
    pub direct_names: Rc<Vec<String>>,
    /// The flattened table, or an unavailable marker
    pub flat: Value,
}

pub(crate) fn create_merge(
    inst: &Instantiator,
    id: ShadowId,
    potentia: Signal<Potentia>,
) -> Derived<MergeOutcome> {
    let this = inst.weak();
    inst.graph().create_derived(move |graph| {
        let Some(inst) = this.upgrade() else {
            return MergeOutcome::default();
        };
        let potentia = graph.get(potentia).unwrap_or_default();
        flatten(&inst, id, &potentia)
    })
}

/// Flatten a potentia against the current registries (tracked)
pub(crate) fn flatten(inst: &Instantiator, id: ShadowId, potentia: &Potentia) -> MergeOutcome {
    let mut names = potentia.direct_layer_names();
    let mut rounds = 0;

    let chain = loop {
        let chain = match inst.layers().resolve_hierarchy(&names) {
            Ok(chain) => chain,
            Err(cause) => {
                let path = inst.path_of(id).unwrap_or_default();
                tracing::debug!("merge of {:?} unavailable: {}", path, cause);
                return MergeOutcome {
                    direct_names: Rc::new(names),
                    flat: Value::unavailable(cause, Some(Site::new(id, path, Vec::new()))),
                };
            }
        };
        let carried: Vec<String> = chain.iter().map(|(name, _)| name.clone()).collect();
        let linked = inst.linkages().outputs_for(&carried);
        if linked.is_empty() {
            break chain;
        }
        rounds += 1;
        if rounds > inst.config().max_linkage_rounds {
            tracing::warn!(
                "linkages still firing after {} rounds for {:?}; ignoring {:?}",
                inst.config().max_linkage_rounds,
                inst.path_of(id).unwrap_or_default(),
                linked
            );
            break chain;
        }
        names.extend(linked);
    };

    let mut flat = Table::new();
    for (_, layer) in &chain {
        deep_merge_into(&mut flat, layer);
    }
    for record in potentia.flatten_order() {
        deep_merge_into(&mut flat, &record.layer);
    }
    flat.insert(
        LAYERS_KEY.to_string(),
        Value::list(names.iter().map(|name| Value::from(name.as_str())).collect()),
    );

    MergeOutcome {
        direct_names: Rc::new(names),
        flat: Value::map(flat),
    }
}

/// Merge `source` over `target` key by key
pub fn deep_merge_into(target: &mut Table, source: &Table) {
    for (key, incoming) in source {
        let merged = match (target.get_mut(key), incoming) {
            (Some(Value::Map(existing)), Value::Map(update))
                if !is_record_table(existing) && !is_record_table(update) =>
            {
                deep_merge_into(Rc::make_mut(existing), update);
                true
            }
            _ => false,
        };
        if !merged {
            target.insert(key.clone(), incoming.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::{record_type, MergeRecord};
    use serde_json::json;

    fn table(json: serde_json::Value) -> Table {
        Value::from_json(json).into_table().unwrap_or_default()
    }

    fn flat_of(outcome: &MergeOutcome) -> &Table {
        outcome.flat.as_map().expect("flat table")
    }

    #[test]
    fn test_deep_merge_nested_maps() {
        let mut target = table(json!({"style": {"color": "red", "size": 1}, "label": "a"}));
        deep_merge_into(
            &mut target,
            &table(json!({"style": {"size": 2}, "label": ["b"]})),
        );

        let style = target["style"].as_map().unwrap();
        assert_eq!(style["color"].as_str(), Some("red"));
        assert_eq!(style["size"].as_f64(), Some(2.0));
        assert_eq!(target["label"].string_list(), vec!["b"]);
    }

    #[test]
    fn test_deep_merge_replaces_records() {
        let mut target = table(json!({"total": {"$compute": {"funcName": "sum"}}}));
        deep_merge_into(&mut target, &table(json!({"total": {"value": 3}})));

        let total = target["total"].as_map().unwrap();
        assert_eq!(total.len(), 1);
        assert_eq!(total["value"].as_f64(), Some(3.0));
    }

    #[test]
    fn test_merge_override_order() {
        let inst = Instantiator::new();
        let id = inst.root();
        let mut potentia = Potentia::default();
        potentia.absorb(
            vec![
                MergeRecord::from_json("a", json!({"x": 1})),
                MergeRecord::from_json("b", json!({"x": 2})),
            ],
            None,
        );
        let outcome = flatten(&inst, id, &potentia);
        assert_eq!(flat_of(&outcome)["x"].as_f64(), Some(2.0));

        potentia.absorb(vec![MergeRecord::from_json("a", json!({"x": 3}))], None);
        let outcome = flatten(&inst, id, &potentia);
        assert_eq!(flat_of(&outcome)["x"].as_f64(), Some(2.0));

        potentia.absorb(vec![MergeRecord::from_json("b", json!({"x": 4}))], None);
        let outcome = flatten(&inst, id, &potentia);
        assert_eq!(flat_of(&outcome)["x"].as_f64(), Some(4.0));
    }

    #[test]
    fn test_layers_then_records_then_live() {
        let inst = Instantiator::new();
        inst.layers().define_json("base", json!({"x": 1, "y": 1, "z": 1}));
        let potentia = Potentia::new(
            vec!["base".into()],
            vec![
                MergeRecord::from_json(record_type::LIVE, json!({"z": 3})),
                MergeRecord::from_json(record_type::USER, json!({"y": 2, "z": 2})),
            ],
        );

        let outcome = flatten(&inst, inst.root(), &potentia);
        let flat = flat_of(&outcome);
        assert_eq!(flat["x"].as_f64(), Some(1.0));
        assert_eq!(flat["y"].as_f64(), Some(2.0));
        assert_eq!(flat["z"].as_f64(), Some(3.0));
        assert_eq!(flat[LAYERS_KEY].string_list(), vec!["base"]);
    }

    #[test]
    fn test_missing_layer_is_unavailable() {
        let inst = Instantiator::new();
        let potentia = Potentia::new(vec!["ghost".into()], Vec::new());

        let outcome = flatten(&inst, inst.root(), &potentia);
        let unavailable = outcome.flat.as_unavailable().expect("unavailable");
        assert!(unavailable.cause.contains("ghost"));
        assert_eq!(*outcome.direct_names, vec!["ghost".to_string()]);
    }

    #[test]
    fn test_linkage_widens_names() {
        use crate::registry::LinkageRule;

        let inst = Instantiator::new();
        inst.layers().define_json("a", json!({}));
        inst.layers().define_json("b", json!({}));
        inst.layers().define_json("ab", json!({"both": true}));
        inst.linkages().register(LinkageRule {
            owner: inst.root(),
            key: "rule".into(),
            inputs: vec!["a".into(), "b".into()],
            outputs: vec!["ab".into()],
        });

        let potentia = Potentia::new(vec!["a".into(), "b".into()], Vec::new());
        let outcome = flatten(&inst, inst.root(), &potentia);
        assert_eq!(*outcome.direct_names, vec!["a", "b", "ab"]);
        assert_eq!(flat_of(&outcome)["both"].as_bool(), Some(true));
    }
}
