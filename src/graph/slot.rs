// Copyright (c) 2024 Mike Tsao

use super::{InputPort, OutputPort, Param, ParamBank};
use crate::{
    traits::{BypassRoute, Module, ModuleEvent, ProcessArgs},
    types::{ModuleDescriptor, ModuleId},
};
use core::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use parking_lot::Mutex;
use std::sync::Arc;

/// The engine-side mount for one module: the module itself plus the
/// parameter bank and ports the engine manages on its behalf.
///
/// The module sits behind a mutex. During a frame, exactly one worker takes
/// the lock to call `process()`, so the lock is uncontended on the hot path;
/// its real job is to make `to_json()` and event delivery impossible to
/// overlap with `process()` on the same module.
#[derive(Debug)]
pub(crate) struct ModuleSlot {
    id: ModuleId,
    module: Mutex<Box<dyn Module>>,
    descriptor: ModuleDescriptor,
    // Arc so a ParamRef can keep writing atomically without any lock, even
    // across topology changes.
    params: Arc<ParamBank>,
    inputs: Box<[InputPort]>,
    outputs: Box<[OutputPort]>,
    bypass_routes: Box<[BypassRoute]>,
    bypassed: AtomicBool,
    // Expander adjacency, recorded for serialization. UNSET means no
    // neighbor.
    left_neighbor: AtomicI64,
    right_neighbor: AtomicI64,
}
impl ModuleSlot {
    pub fn new(id: ModuleId, module: Box<dyn Module>) -> Self {
        let descriptor = module.descriptor();
        let params = Arc::new(ParamBank::new(module.num_params()));
        let inputs = (0..module.num_inputs())
            .map(|_| InputPort::default())
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let outputs = (0..module.num_outputs())
            .map(|_| OutputPort::default())
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let bypass_routes = module.bypass_routes().into_boxed_slice();
        Self {
            id,
            module: Mutex::new(module),
            descriptor,
            params,
            inputs,
            outputs,
            bypass_routes,
            bypassed: AtomicBool::new(false),
            left_neighbor: AtomicI64::new(ModuleId::UNSET.0),
            right_neighbor: AtomicI64::new(ModuleId::UNSET.0),
        }
    }

    pub fn id(&self) -> ModuleId {
        self.id
    }

    pub fn descriptor(&self) -> &ModuleDescriptor {
        &self.descriptor
    }

    pub fn params(&self) -> &[Param] {
        self.params.params()
    }

    pub fn param_bank(&self) -> &Arc<ParamBank> {
        &self.params
    }

    pub fn inputs(&self) -> &[InputPort] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[OutputPort] {
        &self.outputs
    }

    pub fn is_bypassed(&self) -> bool {
        self.bypassed.load(Ordering::Relaxed)
    }

    /// Flips the bypass flag, zeroing all outputs on the way in so stale
    /// voltages don't keep flowing. Returns whether the flag changed.
    pub fn set_bypassed(&self, bypassed: bool) -> bool {
        if self.bypassed.swap(bypassed, Ordering::Relaxed) == bypassed {
            return false;
        }
        if bypassed {
            for output in self.outputs.iter() {
                output.zero();
            }
        }
        true
    }

    pub fn left_neighbor(&self) -> Option<ModuleId> {
        let raw = self.left_neighbor.load(Ordering::Relaxed);
        (raw != ModuleId::UNSET.0).then_some(ModuleId(raw))
    }

    pub fn right_neighbor(&self) -> Option<ModuleId> {
        let raw = self.right_neighbor.load(Ordering::Relaxed);
        (raw != ModuleId::UNSET.0).then_some(ModuleId(raw))
    }

    pub fn set_neighbors(&self, left: Option<ModuleId>, right: Option<ModuleId>) {
        self.left_neighbor
            .store(left.unwrap_or(ModuleId::UNSET).0, Ordering::Relaxed);
        self.right_neighbor
            .store(right.unwrap_or(ModuleId::UNSET).0, Ordering::Relaxed);
    }

    /// Marks this module as having at least one parameter mid-smoothing.
    pub fn arm_smoothing(&self) {
        self.params.arm_smoothing();
    }

    /// Advances all armed parameter smoothers by one frame.
    pub fn step_smoothing(&self, lambda: f32) {
        self.params.step_smoothing(lambda);
    }

    /// Produces one frame. A bypassed module gets its bypass routes copied
    /// instead of a `process()` call.
    pub fn process_frame(&self, args: &ProcessArgs) {
        if self.is_bypassed() {
            for route in self.bypass_routes.iter() {
                if let (Some(input), Some(output)) =
                    (self.inputs.get(route.input), self.outputs.get(route.output))
                {
                    output.set_channels(input.channels());
                    for channel in 0..input.channels() {
                        output.set_voltage(channel, input.voltage(channel));
                    }
                }
            }
        } else {
            let mut module = self.module.lock();
            module.process(args, &self.inputs, &self.outputs, self.params.params());
        }
    }

    /// Delivers a lifecycle event. Callers hold the graph writer lock (or,
    /// for `Save`, the reader lock), so this never overlaps `process()`.
    pub fn on_event(&self, event: &ModuleEvent) {
        self.module.lock().on_event(event);
    }

    /// The module's opaque serialized state.
    pub fn module_to_json(&self) -> Option<serde_json::Value> {
        self.module.lock().to_json()
    }

    pub fn module_from_json(&self, data: &serde_json::Value) -> anyhow::Result<()> {
        self.module.lock().from_json(data)
    }

    /// Scoped access to the module itself.
    pub fn with_module<R>(&self, f: impl FnOnce(&dyn Module) -> R) -> R {
        let module = self.module.lock();
        f(module.as_ref())
    }

    /// Scoped mutable access to the module itself.
    pub fn with_module_mut<R>(&self, f: impl FnOnce(&mut dyn Module) -> R) -> R {
        let mut module = self.module.lock();
        f(module.as_mut())
    }

    /// Consumes the slot, returning ownership of the module to the caller.
    pub fn into_module(self) -> Box<dyn Module> {
        self.module.into_inner()
    }
}
