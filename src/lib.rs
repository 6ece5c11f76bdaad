// Copyright (c) 2024 Mike Tsao

#![warn(missing_docs)]
#![allow(rustdoc::private_intra_doc_links)]

//! Tangle steps a patchable graph of audio/CV modules in real time.
//!
//! The [Engine] owns a set of [modules](traits::Module) connected by
//! [cables](graph::Cable) and advances them in sample-accurate lockstep, one
//! block at a time, while a UI or persistence layer mutates the patch from
//! other threads. Timing comes from a master module (typically the one
//! talking to the audio interface) or, when none is set, from the engine's
//! own fallback clock.
//!
//! The usual shape of a host:
//!
//! * Register module constructors in a [ModuleFactory] so patches can be
//!   reloaded.
//! * Build an [Engine] with [EngineConfigBuilder], add modules and cables,
//!   and call [Engine::start_fallback_thread()] (or designate a master
//!   module that calls [Engine::step_block()] itself).
//! * Drive parameters from the UI with [Engine::set_param_smooth_value()]
//!   and [ParamHandle]s; save and restore with [Engine::to_json()] and
//!   [Engine::from_json()].

/// A collection of imports that are useful to users of this crate. `use
/// tangle::prelude::*;` for easier onboarding.
pub mod prelude {
    pub use super::{
        engine::prelude::*, graph::prelude::*, traits::prelude::*, types::prelude::*,
        util::prelude::*,
    };
}

// Fundamental structures that are important enough to re-export at top level.
pub use engine::{Engine, EngineConfig, EngineConfigBuilder, ModuleFactory, ParamHandle};

pub mod engine;
pub mod graph;
pub mod traits;
pub mod types;
pub mod util;
