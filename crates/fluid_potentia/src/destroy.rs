//! Destroy engine
//!
//! Teardown runs in two passes. The first marks the component and its
//! in-place children `destroying`, depth-first in creation order, firing
//! `onDestroy` while everything is still readable. The second walks the
//! collected records children-first and, for each one, drops injections,
//! clears the registry and scope entries, disposes the reactive pipeline
//! and only then fires `afterDestroy`.

use crate::error::{InstantiatorError, Result};
use crate::events::LifecycleEventKind;
use crate::expand::dispose_construct;
use crate::instantiator::Instantiator;
use crate::scope;
use crate::shadow::{join_path, LifecycleStatus, PathEntry, ShadowId};

/// One component queued for the second pass
#[derive(Debug)]
struct DestroyRec {
    id: ShadowId,
    path: String,
    key: String,
    parent: Option<ShadowId>,
}

impl Instantiator {
    /// Tear down whatever is registered at `path`
    ///
    /// A created component goes away with all its in-place children. An
    /// injected occurrence only loses that path; the component stays alive
    /// at its canonical path.
    pub fn destroy(&self, path: &str) -> Result<()> {
        self.entry(|| self.destroy_path(path))
    }

    /// Tear down a component by handle, through its canonical path
    pub fn destroy_component(&self, id: ShadowId) -> Result<()> {
        let Some(path) = self.path_of(id) else {
            return Err(InstantiatorError::NotRegistered {
                path: format!("{:?}", id),
            });
        };
        self.destroy(&path)
    }

    pub(crate) fn destroy_path(&self, path: &str) -> Result<()> {
        if path.is_empty() {
            return Err(InstantiatorError::RootDestroy);
        }
        let entry = self.paths.borrow().get(path).cloned();
        let Some(entry) = entry else {
            return Err(InstantiatorError::NotRegistered {
                path: path.to_string(),
            });
        };
        if !entry.created {
            self.remove_injection(path);
            return Ok(());
        }

        let mut recs = Vec::new();
        self.clear_component(path, &entry, &mut recs)?;
        self.finish(recs);
        Ok(())
    }

    /// First pass: mark, recurse into children, fire `onDestroy`
    fn clear_component(
        &self,
        path: &str,
        entry: &PathEntry,
        recs: &mut Vec<DestroyRec>,
    ) -> Result<()> {
        let id = entry.component;
        let Some(status) = self.status_of(id) else {
            return Err(InstantiatorError::NotRegistered {
                path: path.to_string(),
            });
        };
        if status.is_ending() {
            return Err(InstantiatorError::AlreadyDestroyed {
                path: path.to_string(),
                status,
            });
        }

        let children = self
            .with_shadow_mut(id, |s| {
                s.status = LifecycleStatus::Destroying;
                s.child_components
                    .iter()
                    .map(|(key, child)| (key.clone(), *child))
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        tracing::debug!("destroying {:?} with {} children", path, children.len());

        for (key, child) in children {
            let child_path = join_path(path, &key);
            let child_entry = self.paths.borrow().get(&child_path).cloned();
            match child_entry {
                Some(child_entry) if child_entry.component == child && self.is_alive(child) => {
                    self.clear_component(&child_path, &child_entry, recs)?;
                }
                // Already being torn down by an outer call
                Some(_) if !self.is_alive(child) => {}
                _ => tracing::warn!("child {:?} of {:?} is not registered", key, path),
            }
        }

        self.emit(self.event(
            LifecycleEventKind::Destroy,
            id,
            path,
            &entry.key,
            entry.parent,
            true,
        ));
        recs.push(DestroyRec {
            id,
            path: path.to_string(),
            key: entry.key.clone(),
            parent: entry.parent,
        });
        Ok(())
    }

    /// Second pass, children before their parents
    fn finish(&self, recs: Vec<DestroyRec>) {
        let graph = self.graph();
        for rec in recs {
            for other in self.injected_paths_of(rec.id) {
                self.remove_injection(&other);
            }
            let injected_here = self
                .with_shadow(rec.id, |s| s.injected_children.keys().cloned().collect::<Vec<_>>())
                .unwrap_or_default();
            for key in injected_here {
                self.remove_injection(&join_path(&rec.path, &key));
            }

            scope::clear_scope(self, rec.id);
            {
                let mut paths = self.paths.borrow_mut();
                if paths.get(&rec.path).map(|entry| entry.component) == Some(rec.id) {
                    paths.remove(&rec.path);
                }
            }
            if let Some(parent) = rec.parent {
                let version = self.with_shadow_mut(parent, |p| {
                    if p.child_components.get(&rec.key) == Some(&rec.id) {
                        p.child_components.shift_remove(&rec.key);
                    }
                    p.children_version
                });
                if let Some(version) = version {
                    graph.update(version, |v| v + 1);
                }
            }
            self.emit(self.event(
                LifecycleEventKind::ComponentClear,
                rec.id,
                &rec.path,
                &rec.key,
                rec.parent,
                true,
            ));

            let pipeline = self.with_shadow_mut(rec.id, |s| {
                (
                    std::mem::take(&mut s.framework_effects),
                    std::mem::take(&mut s.expansion),
                    s.merge.take(),
                )
            });
            if let Some((effects, expansion, merge)) = pipeline {
                for effect in effects {
                    graph.dispose_effect(effect);
                }
                for (key, construct) in expansion.constructs {
                    dispose_construct(self, rec.id, &key, construct);
                }
                if let Some(merge) = merge {
                    graph.dispose_derived(merge);
                }
            }
            self.linkages().remove_owner(rec.id);

            self.with_shadow_mut(rec.id, |s| s.status = LifecycleStatus::Destroyed);
            self.forget_proxies(rec.id);
            self.emit(self.event(
                LifecycleEventKind::AfterDestroy,
                rec.id,
                &rec.path,
                &rec.key,
                rec.parent,
                true,
            ));

            let removed = self.shadows.borrow_mut().remove(rec.id);
            if let Some(shadow) = removed {
                graph.dispose_signal(shadow.potentia);
                graph.dispose_signal(shadow.scope);
                graph.dispose_signal(shadow.children_version);
                graph.dispose_signal(shadow.expanded);
            }
            tracing::debug!("destroyed {:?}", rec.path);
        }
    }
}
