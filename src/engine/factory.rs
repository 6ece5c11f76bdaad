// Copyright (c) 2024 Mike Tsao

use crate::{traits::Module, types::ModuleKey};
use rustc_hash::{FxHashMap, FxHashSet};

/// The signature of a function that constructs a fresh module of one kind.
pub type ModuleFactoryFn = fn() -> Box<dyn Module>;

/// [ModuleFactory] accepts [ModuleKey]s and constructs the corresponding
/// modules. Deserialization uses it to rebuild a patch from the keys recorded
/// in the JSON.
#[derive(Debug, Default)]
pub struct ModuleFactory {
    constructors: FxHashMap<ModuleKey, ModuleFactoryFn>,
    keys: FxHashSet<ModuleKey>,

    is_registration_complete: bool,
    sorted_keys: Vec<ModuleKey>,
}
impl ModuleFactory {
    /// Registers a constructor for the given [ModuleKey].
    pub fn register_module(&mut self, key: ModuleKey, f: ModuleFactoryFn) {
        if self.is_registration_complete {
            panic!("attempt to register a module after registration completed");
        }
        if self.keys.insert(key.clone()) {
            self.constructors.insert(key, f);
        } else {
            panic!("register_module({key}): duplicate key. Exiting.");
        }
    }

    /// Tells the factory that we won't be registering any more modules,
    /// allowing it to do some final housekeeping.
    pub fn finalize(mut self) -> Self {
        self.is_registration_complete = true;
        self.sorted_keys = self.keys.iter().cloned().collect();
        self.sorted_keys.sort();
        self
    }

    /// Constructs a new module of the kind corresponding to the given
    /// [ModuleKey], if that kind is registered.
    pub fn new_module(&self, key: &ModuleKey) -> Option<Box<dyn Module>> {
        if let Some(f) = self.constructors.get(key) {
            Some(f())
        } else {
            tracing::warn!(%key, "no module registered for key");
            None
        }
    }

    /// Returns all registered [ModuleKey]s.
    pub fn keys(&self) -> &FxHashSet<ModuleKey> {
        &self.keys
    }

    /// Returns all registered [ModuleKey]s in sorted order, for consistent
    /// display in a browser UI.
    pub fn sorted_keys(&self) -> &[ModuleKey] {
        if !self.is_registration_complete {
            panic!("sorted_keys() can be called only after registration is complete.")
        }
        &self.sorted_keys
    }
}
