// Copyright (c) 2024 Mike Tsao

use crate::{
    graph::{Cable, ModuleSlot},
    types::{CableId, ModuleId},
};
use anyhow::{anyhow, Result};
use rustc_hash::FxHashMap;
use std::sync::Arc;

/// A cable whose endpoints have been resolved to their mounted modules, so
/// per-frame propagation doesn't chase ids through the registries.
#[derive(Debug)]
pub(crate) struct CableEdge {
    pub cable: Cable,
    pub source: Arc<ModuleSlot>,
    pub sink: Arc<ModuleSlot>,
}

/// Everything behind the engine's readers-writer lock: the module and cable
/// registries, their insertion orders, and the master-module designation.
///
/// Module evaluation order is insertion order, full stop. The engine never
/// topologically sorts; a cable that closes a cycle just costs one sample of
/// latency like every other cable, which is what keeps feedback patches
/// well defined no matter how workers are scheduled.
#[derive(Debug, Default)]
pub(crate) struct Patch {
    modules: FxHashMap<ModuleId, Arc<ModuleSlot>>,
    module_order: Vec<Arc<ModuleSlot>>,
    /// Snapshot of `module_order` that `step_block` hands to the worker pool.
    /// Refreshed on every topology change, cloned per block, never touched by
    /// workers through the graph lock.
    eval: Arc<Vec<Arc<ModuleSlot>>>,
    cables: FxHashMap<CableId, CableEdge>,
    cable_order: Vec<CableId>,
    pub master_module: Option<ModuleId>,
}
impl Patch {
    pub fn slot(&self, id: ModuleId) -> Option<&Arc<ModuleSlot>> {
        self.modules.get(&id)
    }

    pub fn has_module(&self, id: ModuleId) -> bool {
        self.modules.contains_key(&id)
    }

    pub fn num_modules(&self) -> usize {
        self.modules.len()
    }

    pub fn module_ids(&self) -> Vec<ModuleId> {
        self.module_order.iter().map(|slot| slot.id()).collect()
    }

    pub fn eval_list(&self) -> Arc<Vec<Arc<ModuleSlot>>> {
        Arc::clone(&self.eval)
    }

    pub fn add_module(&mut self, slot: Arc<ModuleSlot>) -> Result<()> {
        let id = slot.id();
        if self.modules.contains_key(&id) {
            return Err(anyhow!("module id {id} is already taken"));
        }
        self.modules.insert(id, Arc::clone(&slot));
        self.module_order.push(slot);
        self.refresh_eval();
        Ok(())
    }

    /// Removes a module, cascading: every cable touching it goes too, and the
    /// master designation is cleared if it pointed here. Returns the removed
    /// slot, which by then holds the only strong reference to the module.
    pub fn remove_module(&mut self, id: ModuleId) -> Result<Arc<ModuleSlot>> {
        let slot = self
            .modules
            .remove(&id)
            .ok_or_else(|| anyhow!("module {id} is not in the patch"))?;
        let touching: Vec<CableId> = self
            .cable_order
            .iter()
            .filter(|cable_id| {
                let edge = &self.cables[*cable_id];
                edge.cable.output_module == id || edge.cable.input_module == id
            })
            .copied()
            .collect();
        for cable_id in touching {
            let _ = self.remove_cable(cable_id);
        }
        if self.master_module == Some(id) {
            self.master_module = None;
        }
        self.module_order.retain(|s| s.id() != id);
        self.refresh_eval();
        Ok(slot)
    }

    pub fn has_cable(&self, id: CableId) -> bool {
        self.cables.contains_key(&id)
    }

    pub fn num_cables(&self) -> usize {
        self.cables.len()
    }

    pub fn cable_ids(&self) -> Vec<CableId> {
        self.cable_order.clone()
    }

    pub fn cable(&self, id: CableId) -> Option<&Cable> {
        self.cables.get(&id).map(|edge| &edge.cable)
    }

    pub fn add_cable(&mut self, id: CableId, cable: Cable) -> Result<()> {
        if self.cables.contains_key(&id) {
            return Err(anyhow!("cable id {id} is already taken"));
        }
        let source = self
            .modules
            .get(&cable.output_module)
            .ok_or_else(|| anyhow!("output module {} is not in the patch", cable.output_module))?;
        let sink = self
            .modules
            .get(&cable.input_module)
            .ok_or_else(|| anyhow!("input module {} is not in the patch", cable.input_module))?;
        let output = source.outputs().get(cable.output_port).ok_or_else(|| {
            anyhow!(
                "module {} has no output port {}",
                cable.output_module,
                cable.output_port
            )
        })?;
        let input = sink.inputs().get(cable.input_port).ok_or_else(|| {
            anyhow!(
                "module {} has no input port {}",
                cable.input_module,
                cable.input_port
            )
        })?;
        if input.is_connected() {
            return Err(anyhow!(
                "input port {} of module {} already has a cable",
                cable.input_port,
                cable.input_module
            ));
        }

        input.set_connected(true);
        output.set_connected(true);
        let edge = CableEdge {
            cable,
            source: Arc::clone(source),
            sink: Arc::clone(sink),
        };
        self.cables.insert(id, edge);
        self.cable_order.push(id);
        Ok(())
    }

    pub fn remove_cable(&mut self, id: CableId) -> Result<Cable> {
        let edge = self
            .cables
            .remove(&id)
            .ok_or_else(|| anyhow!("cable {id} is not in the patch"))?;
        self.cable_order.retain(|cable_id| *cable_id != id);

        // The input side loses its only cable; the output side may still feed
        // others.
        if let Some(input) = edge.sink.inputs().get(edge.cable.input_port) {
            input.reset();
        }
        let output_still_used = self.cables.values().any(|other| {
            other.cable.output_module == edge.cable.output_module
                && other.cable.output_port == edge.cable.output_port
        });
        if !output_still_used {
            if let Some(output) = edge.source.outputs().get(edge.cable.output_port) {
                output.set_connected(false);
            }
        }
        Ok(edge.cable)
    }

    /// Empties the patch, returning the slots in insertion order so the
    /// caller can deliver `Remove` events and hand modules back.
    pub fn clear(&mut self) -> Vec<Arc<ModuleSlot>> {
        for edge in self.cables.values() {
            if let Some(input) = edge.sink.inputs().get(edge.cable.input_port) {
                input.reset();
            }
        }
        self.cables.clear();
        self.cable_order.clear();
        self.modules.clear();
        self.master_module = None;
        let order = core::mem::take(&mut self.module_order);
        self.refresh_eval();
        order
    }

    /// Latches every cable: the producer's voltages and channel count become
    /// the consumer's input for the *next* frame. Runs between worker rounds,
    /// so no module is mid-`process` while buffers copy.
    pub fn propagate_cables(&self) {
        for id in &self.cable_order {
            if let Some(edge) = self.cables.get(id) {
                if let (Some(output), Some(input)) = (
                    edge.source.outputs().get(edge.cable.output_port),
                    edge.sink.inputs().get(edge.cable.input_port),
                ) {
                    input.latch_from(output);
                }
            }
        }
    }

    /// Visits every slot in insertion order.
    pub fn for_each_slot(&self, mut f: impl FnMut(&Arc<ModuleSlot>)) {
        for slot in &self.module_order {
            f(slot);
        }
    }

    fn refresh_eval(&mut self) {
        self.eval = Arc::new(self.module_order.clone());
    }
}
