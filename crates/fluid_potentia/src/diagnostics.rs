//! Statistics and tree dumps

use std::fmt::Write as _;

use fluid_core::reactive::ReactiveStats;

use crate::instantiator::Instantiator;
use crate::shadow::ShadowId;

/// Statistics about an instantiator
#[derive(Debug, Clone)]
pub struct InstantiatorStats {
    /// Live shadows, the tree root included
    pub components: usize,
    /// Registered paths, created and injected
    pub paths: usize,
    pub injected_paths: usize,
    pub linkage_rules: usize,
    pub listeners: usize,
    /// Memoized proxies
    pub proxies: usize,
    /// Expansion constructs across all components
    pub constructs: usize,
    pub reactive: ReactiveStats,
}

impl Instantiator {
    pub fn stats(&self) -> InstantiatorStats {
        let (components, constructs) = {
            let shadows = self.shadows.borrow();
            let constructs = shadows
                .values()
                .map(|shadow| shadow.expansion.constructs.len())
                .sum();
            (shadows.len(), constructs)
        };
        let (paths, injected_paths) = {
            let paths = self.paths.borrow();
            let injected = paths.values().filter(|entry| !entry.created).count();
            (paths.len(), injected)
        };
        InstantiatorStats {
            components,
            paths,
            injected_paths,
            linkage_rules: self.linkages().len(),
            listeners: self.listener_count(),
            proxies: self.proxy_count(),
            constructs,
            reactive: self.graph().stats(),
        }
    }

    /// Indented dump of the component tree
    ///
    /// One line per component with its status and layer names, then its
    /// expansion constructs, then injected members marked with `->`.
    pub fn describe(&self) -> String {
        let mut out = String::new();
        self.describe_into(&mut out, self.root(), 0);
        out
    }

    fn describe_into(&self, out: &mut String, id: ShadowId, depth: usize) {
        let indent = "  ".repeat(depth);
        let line = self.with_shadow(id, |s| {
            let names = self
                .graph()
                .get_untracked(s.potentia)
                .map(|potentia| potentia.direct_layer_names())
                .unwrap_or_default();
            let label = if s.path.is_empty() {
                "<root>".to_string()
            } else {
                s.key.clone()
            };
            let layers = if names.is_empty() {
                String::new()
            } else {
                format!(" [{}]", names.join(", "))
            };
            let constructs = s.expansion.summary();
            let injected: Vec<(String, ShadowId)> = s
                .injected_children
                .iter()
                .map(|(key, target)| (key.clone(), *target))
                .collect();
            (
                format!("{}{} ({}){}", indent, label, s.status, layers),
                constructs,
                injected,
            )
        });
        let Some((header, constructs, injected)) = line else {
            return;
        };
        let _ = writeln!(out, "{}", header);
        for (key, kind) in constructs {
            let _ = writeln!(out, "{}  .{}: {}", indent, key, kind);
        }

        for (_, child) in self.children_of(id) {
            self.describe_into(out, child, depth + 1);
        }
        for (key, target) in injected {
            let target_path = self.path_of(target).unwrap_or_default();
            let _ = writeln!(out, "{}  {} -> {}", indent, key, target_path);
        }
    }
}
