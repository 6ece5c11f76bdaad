// Copyright (c) 2024 Mike Tsao

use crate::types::ModuleId;
use anyhow::{anyhow, Result};
use core::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::Arc;

/// A stable external reference to one `(module, parameter)` pair.
///
/// A UI or automation source holds an `Arc<ParamHandle>` and keeps driving
/// the parameter through it even as modules come and go: a handle whose
/// module leaves the graph simply goes inert, and it works again if a module
/// with the same id returns. A handle whose module id is [ModuleId::UNSET]
/// is unbound.
#[derive(Debug)]
pub struct ParamHandle {
    module_id: AtomicI64,
    param_id: AtomicUsize,
    tag: String,
}
impl ParamHandle {
    /// An unbound handle carrying an opaque tag (a MIDI mapping name, an
    /// automation lane label — the engine doesn't care).
    pub fn new(tag: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            module_id: AtomicI64::new(ModuleId::UNSET.0),
            param_id: AtomicUsize::new(0),
            tag: tag.into(),
        })
    }

    /// The referenced module, [ModuleId::UNSET] when unbound.
    pub fn module_id(&self) -> ModuleId {
        ModuleId(self.module_id.load(Ordering::Relaxed))
    }

    /// The referenced parameter index.
    pub fn param_id(&self) -> usize {
        self.param_id.load(Ordering::Relaxed)
    }

    /// Whether the handle currently points at a target.
    pub fn is_bound(&self) -> bool {
        self.module_id() != ModuleId::UNSET
    }

    #[allow(missing_docs)]
    pub fn tag(&self) -> &str {
        &self.tag
    }

    fn bind(&self, module_id: ModuleId, param_id: usize) {
        self.module_id.store(module_id.0, Ordering::Relaxed);
        self.param_id.store(param_id, Ordering::Relaxed);
    }

    fn unbind(&self) {
        self.module_id.store(ModuleId::UNSET.0, Ordering::Relaxed);
        self.param_id.store(0, Ordering::Relaxed);
    }
}

/// The set of registered [ParamHandle]s, indexed by target so that lookup
/// during a mouse drag stays cheap. The registry carries its own mutex:
/// rebinding runs under the engine's *reader* lock (so it can happen while a
/// block is in flight), and this finer lock is what keeps concurrent rebinds
/// coherent.
#[derive(Debug, Default)]
pub(crate) struct HandleRegistry {
    inner: Mutex<HandleRegistryInner>,
}

#[derive(Debug, Default)]
struct HandleRegistryInner {
    handles: Vec<Arc<ParamHandle>>,
    by_target: FxHashMap<(ModuleId, usize), Arc<ParamHandle>>,
}
impl HandleRegistry {
    /// Registers a handle. If the handle arrives already bound to a target
    /// another handle claims, the incoming handle is unbound; rebinding is
    /// [HandleRegistry::update()]'s job.
    pub fn add(&self, handle: &Arc<ParamHandle>) {
        let mut inner = self.inner.lock();
        if handle.is_bound() {
            let target = (handle.module_id(), handle.param_id());
            if inner.by_target.contains_key(&target) {
                handle.unbind();
            } else {
                inner.by_target.insert(target, Arc::clone(handle));
            }
        }
        inner.handles.push(Arc::clone(handle));
    }

    /// Unregisters a handle. The handle keeps its ids; only the registry
    /// forgets it.
    pub fn remove(&self, handle: &Arc<ParamHandle>) -> Result<()> {
        let mut inner = self.inner.lock();
        let before = inner.handles.len();
        inner.handles.retain(|h| !Arc::ptr_eq(h, handle));
        if inner.handles.len() == before {
            return Err(anyhow!("param handle \"{}\" is not registered", handle.tag()));
        }
        let target = (handle.module_id(), handle.param_id());
        let owns_target = inner
            .by_target
            .get(&target)
            .is_some_and(|current| Arc::ptr_eq(current, handle));
        if owns_target {
            inner.by_target.remove(&target);
        }
        Ok(())
    }

    /// The unique handle bound to the given target, if any.
    pub fn get(&self, module_id: ModuleId, param_id: usize) -> Option<Arc<ParamHandle>> {
        self.inner.lock().by_target.get(&(module_id, param_id)).cloned()
    }

    /// Rebinds a registered handle to a new target.
    ///
    /// When another handle already claims the target: with `overwrite` the
    /// old handle is unbound and the new one takes the target; without it the
    /// incoming handle is unbound instead. Either way at most one handle
    /// references any target.
    pub fn update(
        &self,
        handle: &Arc<ParamHandle>,
        module_id: ModuleId,
        param_id: usize,
        overwrite: bool,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        if !inner.handles.iter().any(|h| Arc::ptr_eq(h, handle)) {
            return Err(anyhow!("param handle \"{}\" is not registered", handle.tag()));
        }

        // Release the handle's current claim.
        let old_target = (handle.module_id(), handle.param_id());
        let owns_old_target = inner
            .by_target
            .get(&old_target)
            .is_some_and(|current| Arc::ptr_eq(current, handle));
        if owns_old_target {
            inner.by_target.remove(&old_target);
        }

        handle.bind(module_id, param_id);
        if module_id == ModuleId::UNSET {
            handle.unbind();
            return Ok(());
        }

        let target = (module_id, param_id);
        if let Some(old) = inner.by_target.get(&target).cloned() {
            if overwrite {
                old.unbind();
                inner.by_target.insert(target, Arc::clone(handle));
            } else {
                handle.unbind();
            }
        } else {
            inner.by_target.insert(target, Arc::clone(handle));
        }
        Ok(())
    }

    /// Unbinds every registered handle. Used by
    /// [Engine::clear()](super::Engine::clear); the handles stay registered
    /// so their owners can rebind them.
    pub fn unbind_all(&self) {
        let mut inner = self.inner.lock();
        for handle in &inner.handles {
            handle.unbind();
        }
        inner.by_target.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overwrite_steals_the_target() {
        let registry = HandleRegistry::default();
        let h1 = ParamHandle::new("first");
        let h2 = ParamHandle::new("second");
        registry.add(&h1);
        registry.add(&h2);

        registry.update(&h1, ModuleId(5), 0, true).unwrap();
        assert!(Arc::ptr_eq(&registry.get(ModuleId(5), 0).unwrap(), &h1));

        registry.update(&h2, ModuleId(5), 0, true).unwrap();
        assert_eq!(
            h1.module_id(),
            ModuleId::UNSET,
            "the displaced handle should be reset"
        );
        assert!(Arc::ptr_eq(&registry.get(ModuleId(5), 0).unwrap(), &h2));
    }

    #[test]
    fn no_overwrite_yields_to_the_incumbent() {
        let registry = HandleRegistry::default();
        let h1 = ParamHandle::new("first");
        let h2 = ParamHandle::new("second");
        registry.add(&h1);
        registry.add(&h2);

        registry.update(&h1, ModuleId(5), 0, true).unwrap();
        registry.update(&h2, ModuleId(5), 0, false).unwrap();
        assert!(
            Arc::ptr_eq(&registry.get(ModuleId(5), 0).unwrap(), &h1),
            "the incumbent should keep the target"
        );
        assert!(!h2.is_bound(), "the latecomer should be unbound");
    }

    #[test]
    fn rebinding_releases_the_old_target() {
        let registry = HandleRegistry::default();
        let h = ParamHandle::new("roaming");
        registry.add(&h);

        registry.update(&h, ModuleId(1), 2, true).unwrap();
        registry.update(&h, ModuleId(3), 4, true).unwrap();
        assert!(registry.get(ModuleId(1), 2).is_none());
        assert!(Arc::ptr_eq(&registry.get(ModuleId(3), 4).unwrap(), &h));
    }

    #[test]
    fn unregistered_handles_are_rejected() {
        let registry = HandleRegistry::default();
        let h = ParamHandle::new("stranger");
        assert!(registry.update(&h, ModuleId(1), 0, true).is_err());
        assert!(registry.remove(&h).is_err());
    }

    #[test]
    fn remove_clears_the_index_entry() {
        let registry = HandleRegistry::default();
        let h = ParamHandle::new("short-lived");
        registry.add(&h);
        registry.update(&h, ModuleId(7), 1, true).unwrap();
        registry.remove(&h).unwrap();
        assert!(registry.get(ModuleId(7), 1).is_none());
    }
}
