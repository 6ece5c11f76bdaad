// Copyright (c) 2024 Mike Tsao

//! The traits that define how signal-processing modules plug into the engine.

use crate::{
    graph::{InputPort, OutputPort, Param},
    types::ModuleDescriptor,
};
use core::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use strum_macros::Display;

/// Quick import of all important traits.
pub mod prelude {
    pub use super::{BypassRoute, Module, ModuleEvent, ProcessArgs};
}

/// Per-frame timing information handed to [Module::process()].
#[derive(Clone, Debug, Default)]
pub struct ProcessArgs {
    /// The engine's current sample rate in Hz.
    pub sample_rate: f32,
    /// `1.0 / sample_rate`, in seconds.
    pub sample_time: f32,
    /// The frame being produced. Not necessarily monotonic across blocks; the
    /// host may move it when its playhead jumps.
    pub frame: i64,

    pub(crate) yield_flag: Arc<AtomicBool>,
}
impl ProcessArgs {
    /// Hints that the current call will take a while (more than ~0.1 ms):
    /// workers waiting on this module switch from spinning to sleeping for
    /// the remainder of the block. Call it before doing anything slow.
    pub fn yield_workers(&self) {
        self.yield_flag.store(true, Ordering::Release);
    }
}

/// Lifecycle notifications delivered to [Module::on_event()]. Each fires
/// exactly once per logical occurrence, in FIFO order per module, and never
/// concurrently with that module's [Module::process()].
#[derive(Clone, Debug, Display, PartialEq)]
pub enum ModuleEvent {
    /// The module was added to the engine.
    Add,
    /// The module is about to be removed from the engine.
    Remove,
    /// The user asked the module to return to its initial state.
    Reset,
    /// The user asked the module to randomize itself.
    Randomize,
    /// The module was bypassed. While bypassed it receives no
    /// [Module::process()] calls; the engine copies its
    /// [bypass routes](Module::bypass_routes) instead.
    Bypass,
    /// The module was un-bypassed.
    UnBypass,
    /// The engine's sample rate changed (also delivered once on add, with
    /// `old_rate == new_rate`, so a freshly mounted module learns the current
    /// rate).
    SampleRateChange {
        #[allow(missing_docs)]
        old_rate: f32,
        #[allow(missing_docs)]
        new_rate: f32,
    },
    /// The patch is about to be saved.
    Save,
}

/// While a module is bypassed, the engine copies the voltage on one of its
/// input ports directly to one of its output ports.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BypassRoute {
    /// Index of the input port to copy from.
    pub input: usize,
    /// Index of the output port to copy to.
    pub output: usize,
}

/// A signal-processing unit that the engine steps one frame at a time.
///
/// The engine treats modules as opaque: it knows only how many parameters and
/// ports a module has, and calls the hooks below. Implementations must keep
/// [Module::process()] deterministic in its inputs (offline rendering depends
/// on it) and must not block in it; a module that is about to do something
/// slow should call [Engine::yield_workers()](crate::engine::Engine::yield_workers)
/// first.
///
/// `process()` runs on a worker thread with the graph read-locked.
/// `on_event()` runs under the writer lock, so it may freely mutate internal
/// state.
pub trait Module: core::fmt::Debug + Send {
    /// Identifying metadata, recorded in patch files.
    fn descriptor(&self) -> ModuleDescriptor;

    /// How many parameters the module exposes. Parameter ids are
    /// `0..num_params()`.
    fn num_params(&self) -> usize {
        0
    }

    /// How many input ports the module exposes.
    fn num_inputs(&self) -> usize {
        0
    }

    /// How many output ports the module exposes.
    fn num_outputs(&self) -> usize {
        0
    }

    /// The input→output copies the engine should perform while this module is
    /// bypassed. Called once, when the module is added.
    fn bypass_routes(&self) -> Vec<BypassRoute> {
        Vec::new()
    }

    /// Produces one frame: read `inputs`, write `outputs`. Parameter values
    /// are already smoothed for this frame.
    fn process(
        &mut self,
        args: &ProcessArgs,
        inputs: &[InputPort],
        outputs: &[OutputPort],
        params: &[Param],
    );

    /// Responds to a lifecycle notification.
    #[allow(unused_variables)]
    fn on_event(&mut self, event: &ModuleEvent) {}

    /// Serializes module-internal state into the patch's opaque `data` field.
    /// The engine never looks inside the value.
    fn to_json(&self) -> Option<serde_json::Value> {
        None
    }

    /// Restores module-internal state from the opaque `data` field.
    #[allow(unused_variables)]
    fn from_json(&mut self, data: &serde_json::Value) -> anyhow::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_display_is_usable_in_diagnostics() {
        assert_eq!(ModuleEvent::Add.to_string(), "Add");
        assert_eq!(
            ModuleEvent::SampleRateChange {
                old_rate: 44_100.0,
                new_rate: 48_000.0
            }
            .to_string(),
            "SampleRateChange"
        );
    }
}
