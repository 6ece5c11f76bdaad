// Copyright (c) 2024 Mike Tsao

//! The patch wire format. This is a stable external contract: camelCase
//! field names, explicit ids, module `data` opaque to the engine.

use crate::{graph::ModuleSlot, types::{CableId, ModuleId}};
use serde::{Deserialize, Serialize};

/// The current patch-format generation.
pub const PATCH_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct PatchJson {
    pub version: u32,
    pub modules: Vec<ModuleEntry>,
    pub cables: Vec<CableEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master_module_id: Option<ModuleId>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ModuleEntry {
    pub id: ModuleId,
    pub plugin: String,
    pub model: String,
    #[serde(default)]
    pub version: String,
    pub params: Vec<ParamEntry>,
    #[serde(default)]
    pub bypassed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub left_module_id: Option<ModuleId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub right_module_id: Option<ModuleId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct ParamEntry {
    pub id: usize,
    pub value: f32,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CableEntry {
    pub id: CableId,
    pub output_module_id: ModuleId,
    pub output_port_id: usize,
    pub input_module_id: ModuleId,
    pub input_port_id: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
}

/// Serializes one mounted module. Takes the slot's module lock (inside
/// [ModuleSlot::module_to_json]), so it cannot overlap that module's
/// `process()`.
pub(crate) fn module_entry(slot: &ModuleSlot) -> ModuleEntry {
    let descriptor = slot.descriptor();
    ModuleEntry {
        id: slot.id(),
        plugin: descriptor.plugin.clone(),
        model: descriptor.model.clone(),
        version: descriptor.version.clone(),
        params: slot
            .params()
            .iter()
            .enumerate()
            .map(|(id, param)| ParamEntry {
                id,
                value: param.value(),
            })
            .collect(),
        bypassed: slot.is_bypassed(),
        left_module_id: slot.left_neighbor(),
        right_module_id: slot.right_neighbor(),
        data: slot.module_to_json(),
    }
}

/// Applies a module entry's mutable state (params, bypass, adjacency, opaque
/// data) to a mounted module.
pub(crate) fn apply_module_entry(slot: &ModuleSlot, entry: &ModuleEntry) -> anyhow::Result<()> {
    for param_entry in &entry.params {
        if let Some(param) = slot.params().get(param_entry.id) {
            param.set_value(param_entry.value);
        } else {
            tracing::warn!(
                module_id = %slot.id(),
                param_id = param_entry.id,
                "patch names a parameter the module doesn't have; ignoring"
            );
        }
    }
    slot.set_bypassed(entry.bypassed);
    slot.set_neighbors(entry.left_module_id, entry.right_module_id);
    if let Some(data) = &entry.data {
        slot.module_from_json(data)?;
    }
    Ok(())
}
