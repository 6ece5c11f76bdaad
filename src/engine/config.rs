// Copyright (c) 2024 Mike Tsao

use super::ModuleFactory;
use derive_builder::Builder;
use std::sync::Arc;

/// Settings fixed at [Engine](super::Engine) construction.
#[derive(Builder, Clone, Debug)]
pub struct EngineConfig {
    /// The initial sample rate in Hz.
    #[builder(default = "44_100.0")]
    pub sample_rate: f32,

    /// How many frames the fallback clock steps per block when no master
    /// module is driving timing.
    #[builder(default = "256")]
    pub fallback_block_frames: usize,

    /// How many worker threads process modules, counting the thread that
    /// calls [step_block()](super::Engine::step_block) as one of them.
    #[builder(default = "1")]
    pub workers: usize,

    /// Constructs modules during patch deserialization.
    #[builder(default)]
    pub factory: Arc<ModuleFactory>,
}
impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfigBuilder::default().build().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_defaults_are_sensible() {
        let config = EngineConfig::default();
        assert_eq!(config.sample_rate, 44_100.0);
        assert_eq!(config.fallback_block_frames, 256);
        assert_eq!(config.workers, 1);
    }

    #[test]
    fn builder_overrides() {
        let config = EngineConfigBuilder::default()
            .sample_rate(48_000.0)
            .workers(4)
            .build()
            .unwrap();
        assert_eq!(config.sample_rate, 48_000.0);
        assert_eq!(config.workers, 4);
    }
}
