// Copyright (c) 2024 Mike Tsao

//! Identifying metadata that a module implementation reports about itself.

use core::fmt::Display;
use serde::{Deserialize, Serialize};

/// Identifies a kind of module, such as an oscillator, a filter, or an audio
/// interface. Patches name modules by key so that deserialization can ask a
/// [ModuleFactory](crate::engine::ModuleFactory) to reconstruct them.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct ModuleKey {
    /// The collection the module ships in.
    pub plugin: String,
    /// The module's name within its plugin.
    pub model: String,
}
impl ModuleKey {
    #[allow(missing_docs)]
    pub fn new(plugin: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            plugin: plugin.into(),
            model: model.into(),
        }
    }
}
impl Display for ModuleKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}.{}", self.plugin, self.model)
    }
}

/// Everything a patch file records about what a module *is*: its key plus the
/// version of the implementation that saved it.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ModuleDescriptor {
    #[allow(missing_docs)]
    pub plugin: String,
    #[allow(missing_docs)]
    pub model: String,
    /// Implementation version, recorded for diagnostics. The engine treats it
    /// as opaque.
    pub version: String,
}
impl ModuleDescriptor {
    #[allow(missing_docs)]
    pub fn new(plugin: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            plugin: plugin.into(),
            model: model.into(),
            version: String::default(),
        }
    }

    /// Builder-style version setter.
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// The factory key for this kind of module.
    pub fn key(&self) -> ModuleKey {
        ModuleKey::new(self.plugin.clone(), self.model.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_key_round_trip() {
        let d = ModuleDescriptor::new("core", "vco").with_version("2.1.0");
        assert_eq!(d.key(), ModuleKey::new("core", "vco"));
        assert_eq!(d.key().to_string(), "core.vco");
        assert_eq!(d.version, "2.1.0");
    }
}
