// Copyright (c) 2024 Mike Tsao

//! The engine proper: the locked patch container, the block scheduler and
//! its worker pool, parameter handles, the CPU meter, and the patch
//! serializer.

/// The most commonly used imports.
pub mod prelude {
    pub use super::{
        Engine, EngineConfig, EngineConfigBuilder, ModuleFactory, ModuleFactoryFn, ParamHandle,
        PATCH_VERSION,
    };
}

pub use {
    config::{EngineConfig, EngineConfigBuilder},
    engine::Engine,
    factory::{ModuleFactory, ModuleFactoryFn},
    handles::ParamHandle,
    serializer::PATCH_VERSION,
};

mod config;
#[allow(clippy::module_inception)]
mod engine;
mod factory;
mod handles;
mod meter;
mod patch;
mod serializer;
mod workers;
