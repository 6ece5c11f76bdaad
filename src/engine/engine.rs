// Copyright (c) 2024 Mike Tsao

use super::{
    config::EngineConfig,
    factory::ModuleFactory,
    handles::{HandleRegistry, ParamHandle},
    meter::Meter,
    patch::Patch,
    serializer::{self, CableEntry, ModuleEntry, PatchJson, PATCH_VERSION},
    workers::WorkerPool,
};
use crate::{
    graph::{smoothing_lambda, Cable, ModuleSlot, Param, ParamRef},
    traits::{Module, ModuleEvent, ProcessArgs},
    types::{CableId, IdFactory, ModuleId, ModuleKey},
};
use anyhow::{anyhow, Result};
use atomic_float::{AtomicF32, AtomicF64};
use core::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use delegate::delegate;
use parking_lot::{Mutex, RwLock};
use std::{
    sync::Arc,
    thread::JoinHandle,
    time::{Duration, Instant},
};

/// How often the idle fallback clock checks whether the master module has
/// been unset.
const FALLBACK_IDLE_POLL: Duration = Duration::from_millis(10);

/// Owns a patch of modules and cables and steps them in time.
///
/// The engine holds a readers-writer lock over the patch. Operations that
/// manipulate topology (documented as write-locking) exclude everything
/// else; observational operations and [Engine::step_block()] share the read
/// side, and a second mutex keeps two `step_block` calls from overlapping.
/// Parameter storage is atomic: resolve a [ParamRef] once and every read and
/// write through it is a plain atomic operation that never waits for a block
/// to finish.
///
/// All methods take `&self`; an `Engine` is meant to be shared across a UI
/// thread, an audio callback, and any number of observers.
#[derive(Debug)]
pub struct Engine {
    shared: Arc<EngineShared>,
    fallback: Mutex<Option<JoinHandle<()>>>,
}
impl Default for Engine {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}
impl Engine {
    #[allow(missing_docs)]
    pub fn new(config: EngineConfig) -> Self {
        let workers = config.workers.max(1);
        let yield_flag = Arc::new(AtomicBool::new(false));
        let shared = Arc::new(EngineShared {
            patch: RwLock::new(Patch::default()),
            step_mutex: Mutex::new(()),
            pool: Mutex::new(WorkerPool::new(workers, &yield_flag)),
            yield_flag,
            handles: HandleRegistry::default(),
            module_ids: IdFactory::default(),
            cable_ids: IdFactory::default(),
            factory: Arc::clone(&config.factory),
            sample_rate: AtomicF32::new(config.sample_rate),
            sample_rate_is_explicit: AtomicBool::new(false),
            smoothing: AtomicF32::new(smoothing_lambda(1.0 / config.sample_rate)),
            block: AtomicI64::new(0),
            frame: AtomicI64::new(0),
            block_frame: AtomicI64::new(0),
            block_time: AtomicF64::new(0.0),
            block_frames: AtomicUsize::new(0),
            meter: Meter::default(),
            epoch: Instant::now(),
            fallback_block_frames: config.fallback_block_frames.max(1),
            fallback_running: AtomicBool::new(false),
            workers: AtomicUsize::new(workers),
        });
        Self {
            shared,
            fallback: Mutex::new(None),
        }
    }

    delegate! {
        to self.shared {
            /// Advances the engine by `frames` frames. Only the master module
            /// (or the fallback clock) should call this. Read-locks, and
            /// serializes against other `step_block` calls.
            pub fn step_block(&self, frames: usize);
            /// The number of `step_block` calls since the engine was created.
            pub fn block(&self) -> i64;
            /// The frame counter, which increases once per sample step. Not
            /// necessarily monotonic: the host may reset it. While a block is
            /// running this observes the in-progress frame, not the frame the
            /// block started at (that one is [Engine::block_frame()]).
            pub fn frame(&self) -> i64;
            /// Moves the frame counter, typically because the host playhead
            /// jumped.
            pub fn set_frame(&self, frame: i64);
            /// The frame at which the current/most recent block started.
            pub fn block_frame(&self) -> i64;
            /// Seconds on the engine's monotonic clock when the current/most
            /// recent block started.
            pub fn block_time(&self) -> f64;
            /// The number of frames in the current/most recent block.
            pub fn block_frames(&self) -> usize;
            /// The span of the current/most recent block in seconds.
            pub fn block_duration(&self) -> f64;
            /// The engine's sample rate in Hz.
            pub fn sample_rate(&self) -> f32;
            /// `1.0 / sample_rate`, in seconds.
            pub fn sample_time(&self) -> f32;
            /// Average fraction of real time spent processing blocks,
            /// exponentially smoothed over the last second or so.
            pub fn meter_average(&self) -> f64;
            /// Worst per-block load observed over roughly the last two
            /// seconds.
            pub fn meter_max(&self) -> f64;
            /// Switches waiting workers from spinning to sleeping for the
            /// remainder of the block. Modules should call this (via
            /// [ProcessArgs::yield_workers()]) before doing anything slow.
            pub fn yield_workers(&self);
        }
    }

    /// Sets the sample rate to step modules at. Write-locks; also relaunches
    /// the worker pool.
    pub fn set_sample_rate(&self, sample_rate: f32) {
        self.shared
            .sample_rate_is_explicit
            .store(true, Ordering::Relaxed);
        self.shared.apply_sample_rate(sample_rate);
    }

    /// Applies a sample rate only if none has been set explicitly — the
    /// "Auto" setting following whatever the audio device wants.
    pub fn set_suggested_sample_rate(&self, sample_rate: f32) {
        if !self.shared.sample_rate_is_explicit.load(Ordering::Relaxed) {
            self.shared.apply_sample_rate(sample_rate);
        }
    }

    /// How many workers (including the stepping thread) process each block.
    pub fn thread_count(&self) -> usize {
        self.shared.workers.load(Ordering::Relaxed)
    }

    /// Changes the worker count, relaunching the pool. Write-locks.
    pub fn set_thread_count(&self, workers: usize) {
        let workers = workers.max(1);
        let _patch = self.shared.patch.write();
        self.shared.workers.store(workers, Ordering::Relaxed);
        self.shared.relaunch_pool();
        tracing::debug!(workers, "relaunched worker pool");
    }

    // ------------------------------------------------------------------
    // Modules

    /// Adds a module, minting an id for it. The engine owns the module until
    /// [Engine::remove_module()] hands it back. Write-locks.
    pub fn add_module(&self, module: Box<dyn Module>) -> Result<ModuleId> {
        let id = self.shared.module_ids.mint_next();
        self.add_module_inner(module, id)
    }

    /// Adds a module under a caller-chosen id (a patch being restored, a test
    /// that wants stable ids). Fails if the id is taken. Write-locks.
    pub fn add_module_with_id(&self, module: Box<dyn Module>, id: ModuleId) -> Result<ModuleId> {
        if id == ModuleId::UNSET {
            return Err(anyhow!("cannot add a module with the unset id"));
        }
        self.shared.module_ids.notify_externally_minted_id(&id);
        self.add_module_inner(module, id)
    }

    fn add_module_inner(&self, module: Box<dyn Module>, id: ModuleId) -> Result<ModuleId> {
        let mut patch = self.shared.patch.write();
        let slot = Arc::new(ModuleSlot::new(id, module));
        patch.add_module(Arc::clone(&slot))?;
        slot.on_event(&ModuleEvent::Add);
        let rate = self.shared.sample_rate.load(Ordering::Relaxed);
        slot.on_event(&ModuleEvent::SampleRateChange {
            old_rate: rate,
            new_rate: rate,
        });
        tracing::debug!(module_id = %id, "added module");
        Ok(id)
    }

    /// Removes a module, returning ownership of it. Every cable touching the
    /// module is removed too, and the master designation is cleared if it
    /// pointed here. Write-locks.
    pub fn remove_module(&self, id: ModuleId) -> Result<Box<dyn Module>> {
        let mut patch = self.shared.patch.write();
        if let Some(slot) = patch.slot(id) {
            slot.on_event(&ModuleEvent::Remove);
        }
        let slot = patch.remove_module(id)?;
        // The pool may still hold last block's module list; refresh it so the
        // slot's reference count drains.
        self.shared.pool.lock().clear_job();
        drop(patch);
        tracing::debug!(module_id = %id, "removed module");
        match Arc::try_unwrap(slot) {
            Ok(slot) => Ok(slot.into_module()),
            Err(_) => Err(anyhow!("module {id} was removed but is still referenced")),
        }
    }

    /// Removes all modules and cables. Registered param handles go inert but
    /// stay registered. Write-locks.
    pub fn clear(&self) {
        let mut patch = self.shared.patch.write();
        patch.for_each_slot(|slot| slot.on_event(&ModuleEvent::Remove));
        let removed = patch.clear();
        self.shared.pool.lock().clear_job();
        drop(patch);
        self.shared.handles.unbind_all();
        drop(removed);
        tracing::debug!("cleared patch");
    }

    #[allow(missing_docs)]
    pub fn num_modules(&self) -> usize {
        self.shared.patch.read().num_modules()
    }

    #[allow(missing_docs)]
    pub fn has_module(&self, id: ModuleId) -> bool {
        self.shared.patch.read().has_module(id)
    }

    /// All module ids, in insertion (evaluation) order. Read-locks.
    pub fn module_ids(&self) -> Vec<ModuleId> {
        self.shared.patch.read().module_ids()
    }

    /// Runs `f` with shared access to the module. Read-locks, and holds the
    /// module's own lock so `process()` cannot be running at the same time.
    pub fn with_module<R>(&self, id: ModuleId, f: impl FnOnce(&dyn Module) -> R) -> Result<R> {
        self.with_slot(id, |slot| slot.with_module(f))
    }

    /// Runs `f` with exclusive access to the module. Write-locks.
    pub fn with_module_mut<R>(
        &self,
        id: ModuleId,
        f: impl FnOnce(&mut dyn Module) -> R,
    ) -> Result<R> {
        let patch = self.shared.patch.write();
        let slot = patch
            .slot(id)
            .ok_or_else(|| anyhow!("module {id} is not in the patch"))?;
        Ok(slot.with_module_mut(f))
    }

    /// Designates the module whose processing drives timing (typically an
    /// audio-interface module), or clears the designation with `None`, at
    /// which point the fallback clock (if started) takes over. Write-locks.
    pub fn set_master_module(&self, id: Option<ModuleId>) -> Result<()> {
        let mut patch = self.shared.patch.write();
        if let Some(id) = id {
            if !patch.has_module(id) {
                return Err(anyhow!("module {id} is not in the patch"));
            }
        }
        patch.master_module = id;
        Ok(())
    }

    #[allow(missing_docs)]
    pub fn master_module(&self) -> Option<ModuleId> {
        self.shared.patch.read().master_module
    }

    /// Triggers a `Reset` event for the module. Write-locks.
    pub fn reset_module(&self, id: ModuleId) -> Result<()> {
        self.dispatch_event(id, &ModuleEvent::Reset)
    }

    /// Triggers a `Randomize` event for the module. Write-locks.
    pub fn randomize_module(&self, id: ModuleId) -> Result<()> {
        self.dispatch_event(id, &ModuleEvent::Randomize)
    }

    /// Sets the bypassed state, delivering `Bypass`/`UnBypass` on an actual
    /// change. While bypassed a module's declared bypass routes are copied in
    /// place of its `process()`. Write-locks.
    pub fn bypass_module(&self, id: ModuleId, bypassed: bool) -> Result<()> {
        let patch = self.shared.patch.write();
        let slot = patch
            .slot(id)
            .ok_or_else(|| anyhow!("module {id} is not in the patch"))?;
        if slot.set_bypassed(bypassed) {
            slot.on_event(if bypassed {
                &ModuleEvent::Bypass
            } else {
                &ModuleEvent::UnBypass
            });
        }
        Ok(())
    }

    #[allow(missing_docs)]
    pub fn is_module_bypassed(&self, id: ModuleId) -> Result<bool> {
        self.with_slot(id, |slot| slot.is_bypassed())
    }

    /// Records which modules sit physically adjacent to this one, for patch
    /// formats that care about expander placement. Write-locks.
    pub fn set_module_neighbors(
        &self,
        id: ModuleId,
        left: Option<ModuleId>,
        right: Option<ModuleId>,
    ) -> Result<()> {
        let patch = self.shared.patch.write();
        let slot = patch
            .slot(id)
            .ok_or_else(|| anyhow!("module {id} is not in the patch"))?;
        slot.set_neighbors(left, right);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Cables

    /// Adds a cable, minting an id for it. Both endpoints must exist, the
    /// port indices must be valid, and the input port must be free.
    /// Write-locks.
    pub fn add_cable(&self, cable: Cable) -> Result<CableId> {
        let id = self.shared.cable_ids.mint_next();
        self.shared.patch.write().add_cable(id, cable)?;
        Ok(id)
    }

    /// Adds a cable under a caller-chosen id. Write-locks.
    pub fn add_cable_with_id(&self, cable: Cable, id: CableId) -> Result<CableId> {
        self.shared.cable_ids.notify_externally_minted_id(&id);
        self.shared.patch.write().add_cable(id, cable)?;
        Ok(id)
    }

    /// Removes a cable, returning it. The consumer's input port reverts to
    /// reading silence. Write-locks.
    pub fn remove_cable(&self, id: CableId) -> Result<Cable> {
        self.shared.patch.write().remove_cable(id)
    }

    #[allow(missing_docs)]
    pub fn num_cables(&self) -> usize {
        self.shared.patch.read().num_cables()
    }

    #[allow(missing_docs)]
    pub fn has_cable(&self, id: CableId) -> bool {
        self.shared.patch.read().has_cable(id)
    }

    /// All cable ids, in insertion order. Read-locks.
    pub fn cable_ids(&self) -> Vec<CableId> {
        self.shared.patch.read().cable_ids()
    }

    #[allow(missing_docs)]
    pub fn cable(&self, id: CableId) -> Option<Cable> {
        self.shared.patch.read().cable(id).cloned()
    }

    // ------------------------------------------------------------------
    // Params

    /// Resolves a [ParamRef]: the never-blocking way to drive a parameter.
    ///
    /// Resolution itself read-locks to find the module; every read and write
    /// through the returned ref is then a relaxed atomic operation that
    /// cannot wait for a block or a topology change. Resolve once (on
    /// mouse-down, at automation-lane bind time) and write through the ref
    /// from then on.
    pub fn param_ref(&self, id: ModuleId, param_id: usize) -> Result<ParamRef> {
        let patch = self.shared.patch.read();
        let slot = patch
            .slot(id)
            .ok_or_else(|| anyhow!("module {id} is not in the patch"))?;
        if slot.params().len() <= param_id {
            return Err(anyhow!("module {id} has no parameter {param_id}"));
        }
        Ok(ParamRef::new(Arc::clone(slot.param_bank()), param_id))
    }

    /// Sets a parameter instantly, canceling any smoothing in progress. The
    /// store itself is a relaxed atomic, but the id lookup in front of it
    /// briefly read-locks; a caller on the real-time path holds a
    /// [ParamRef] (see [Engine::param_ref()]) and skips the lookup entirely.
    pub fn set_param_value(&self, id: ModuleId, param_id: usize, value: f32) -> Result<()> {
        self.with_param(id, param_id, |param, _| param.set_value(value))
    }

    /// Reads a parameter. Same locking caveat as [Engine::set_param_value()]:
    /// the lookup read-locks, the load itself is atomic.
    pub fn param_value(&self, id: ModuleId, param_id: usize) -> Result<f32> {
        self.with_param(id, param_id, |param, _| param.value())
    }

    /// Asks a parameter to glide toward `value` over the next few frames
    /// instead of jumping. Same locking caveat as
    /// [Engine::set_param_value()].
    pub fn set_param_smooth_value(&self, id: ModuleId, param_id: usize, value: f32) -> Result<()> {
        self.with_param(id, param_id, |param, slot| {
            param.set_smooth_target(value);
            slot.arm_smoothing();
        })
    }

    /// The target a smoothed parameter is moving toward (equal to the value
    /// when idle).
    pub fn param_smooth_value(&self, id: ModuleId, param_id: usize) -> Result<f32> {
        self.with_param(id, param_id, |param, _| param.smooth_target())
    }

    // ------------------------------------------------------------------
    // Param handles

    /// Registers a [ParamHandle]. Write-locks.
    pub fn add_param_handle(&self, handle: &Arc<ParamHandle>) {
        let _patch = self.shared.patch.write();
        self.shared.handles.add(handle);
    }

    /// Unregisters a [ParamHandle]. Write-locks.
    pub fn remove_param_handle(&self, handle: &Arc<ParamHandle>) -> Result<()> {
        let _patch = self.shared.patch.write();
        self.shared.handles.remove(handle)
    }

    /// The unique handle bound to `(module_id, param_id)`, if any.
    /// Read-locks.
    pub fn param_handle(&self, module_id: ModuleId, param_id: usize) -> Option<Arc<ParamHandle>> {
        let _patch = self.shared.patch.read();
        self.shared.handles.get(module_id, param_id)
    }

    /// Rebinds a registered handle to a new target. If another handle claims
    /// the target, `overwrite` decides which of the two ends up unbound.
    /// Read-locks (the registry's own lock makes this safe mid-block, which
    /// matters because it runs under mouse drags).
    pub fn update_param_handle(
        &self,
        handle: &Arc<ParamHandle>,
        module_id: ModuleId,
        param_id: usize,
        overwrite: bool,
    ) -> Result<()> {
        let _patch = self.shared.patch.read();
        self.shared
            .handles
            .update(handle, module_id, param_id, overwrite)
    }

    // ------------------------------------------------------------------
    // Serialization

    /// Serializes the patch. Read-locks; each module's `to_json()` runs
    /// behind that module's lock, so it never overlaps the module's
    /// `process()`.
    pub fn to_json(&self) -> Result<serde_json::Value> {
        let patch = self.shared.patch.read();
        let mut modules = Vec::new();
        patch.for_each_slot(|slot| modules.push(serializer::module_entry(slot)));
        let mut cables = Vec::new();
        for id in patch.cable_ids() {
            if let Some(cable) = patch.cable(id) {
                cables.push(CableEntry {
                    id,
                    output_module_id: cable.output_module,
                    output_port_id: cable.output_port,
                    input_module_id: cable.input_module,
                    input_port_id: cable.input_port,
                    color: cable.color.clone(),
                });
            }
        }
        let doc = PatchJson {
            version: PATCH_VERSION,
            modules,
            cables,
            master_module_id: patch.master_module,
        };
        Ok(serde_json::to_value(doc)?)
    }

    /// Replaces the patch with the serialized one. On malformed input the
    /// engine is left empty and consistent; entries that can't be satisfied
    /// (unknown model, dangling cable endpoint, duplicate id) are skipped
    /// with a logged warning, first come first served. Write-locks.
    pub fn from_json(&self, json: &serde_json::Value) -> Result<()> {
        let mut patch = self.shared.patch.write();

        // Clear before parsing: a failed load must leave the engine empty,
        // not half the old patch.
        patch.for_each_slot(|slot| slot.on_event(&ModuleEvent::Remove));
        patch.clear();
        self.shared.pool.lock().clear_job();
        self.shared.handles.unbind_all();

        let parsed: PatchJson = serde::Deserialize::deserialize(json)
            .map_err(|e| anyhow!("malformed patch JSON: {e}"))?;
        if parsed.version != PATCH_VERSION {
            tracing::warn!(
                version = parsed.version,
                expected = PATCH_VERSION,
                "patch version differs; attempting to load anyway"
            );
        }

        let rate = self.shared.sample_rate.load(Ordering::Relaxed);
        for entry in &parsed.modules {
            let key = ModuleKey::new(entry.plugin.clone(), entry.model.clone());
            let Some(module) = self.shared.factory.new_module(&key) else {
                tracing::warn!(%key, module_id = %entry.id, "skipping unknown module");
                continue;
            };
            if patch.has_module(entry.id) {
                tracing::warn!(module_id = %entry.id, "duplicate module id in patch; keeping the first");
                continue;
            }
            self.shared.module_ids.notify_externally_minted_id(&entry.id);
            let slot = Arc::new(ModuleSlot::new(entry.id, module));
            if let Err(e) = serializer::apply_module_entry(&slot, entry) {
                tracing::warn!(module_id = %entry.id, "skipping module whose data failed to load: {e}");
                continue;
            }
            if let Err(e) = patch.add_module(Arc::clone(&slot)) {
                tracing::warn!(module_id = %entry.id, "skipping module: {e}");
                continue;
            }
            slot.on_event(&ModuleEvent::Add);
            slot.on_event(&ModuleEvent::SampleRateChange {
                old_rate: rate,
                new_rate: rate,
            });
        }

        for entry in &parsed.cables {
            self.shared.cable_ids.notify_externally_minted_id(&entry.id);
            let mut cable = Cable::new(
                entry.output_module_id,
                entry.output_port_id,
                entry.input_module_id,
                entry.input_port_id,
            );
            cable.color = entry.color.clone();
            if let Err(e) = patch.add_cable(entry.id, cable) {
                tracing::warn!(cable_id = %entry.id, "skipping cable: {e}");
            }
        }

        if let Some(master) = parsed.master_module_id {
            if patch.has_module(master) {
                patch.master_module = Some(master);
            } else {
                tracing::warn!(module_id = %master, "master module not present; ignoring");
            }
        }
        Ok(())
    }

    /// Serializes one module (with its engine-side params, bypass state, and
    /// adjacency). Read-locks.
    pub fn module_to_json(&self, id: ModuleId) -> Result<serde_json::Value> {
        let patch = self.shared.patch.read();
        let slot = patch
            .slot(id)
            .ok_or_else(|| anyhow!("module {id} is not in the patch"))?;
        Ok(serde_json::to_value(serializer::module_entry(slot))?)
    }

    /// Restores one module's state from its serialized form. Write-locks.
    pub fn module_from_json(&self, id: ModuleId, json: &serde_json::Value) -> Result<()> {
        let patch = self.shared.patch.write();
        let slot = patch
            .slot(id)
            .ok_or_else(|| anyhow!("module {id} is not in the patch"))?;
        let entry: ModuleEntry = serde::Deserialize::deserialize(json)
            .map_err(|e| anyhow!("malformed module JSON: {e}"))?;
        serializer::apply_module_entry(slot, &entry)
    }

    /// Dispatches `Save` to every module so each can settle state it wants
    /// serialized. Read-locks.
    pub fn prepare_save(&self) {
        let patch = self.shared.patch.read();
        patch.for_each_slot(|slot| slot.on_event(&ModuleEvent::Save));
    }

    // ------------------------------------------------------------------
    // Fallback clock

    /// Starts the internal clock thread. Whenever no master module is set,
    /// it steps blocks of the configured size on absolute deadlines computed
    /// from the sample rate, so timing doesn't drift; while a master is set
    /// it idles. Does nothing if already started.
    pub fn start_fallback_thread(&self) {
        let mut guard = self.fallback.lock();
        if guard.is_some() {
            return;
        }
        self.shared.fallback_running.store(true, Ordering::Release);
        let shared = Arc::clone(&self.shared);
        *guard = Some(
            std::thread::Builder::new()
                .name("tangle-fallback".into())
                .spawn(move || shared.fallback_run())
                .expect("spawning the fallback clock thread failed"),
        );
        tracing::debug!("fallback clock started");
    }

    // ------------------------------------------------------------------

    fn with_slot<R>(&self, id: ModuleId, f: impl FnOnce(&ModuleSlot) -> R) -> Result<R> {
        let patch = self.shared.patch.read();
        let slot = patch
            .slot(id)
            .ok_or_else(|| anyhow!("module {id} is not in the patch"))?;
        Ok(f(slot))
    }

    fn with_param<R>(
        &self,
        id: ModuleId,
        param_id: usize,
        f: impl FnOnce(&Param, &ModuleSlot) -> R,
    ) -> Result<R> {
        let patch = self.shared.patch.read();
        let slot = patch
            .slot(id)
            .ok_or_else(|| anyhow!("module {id} is not in the patch"))?;
        let param = slot
            .params()
            .get(param_id)
            .ok_or_else(|| anyhow!("module {id} has no parameter {param_id}"))?;
        Ok(f(param, slot))
    }

    fn dispatch_event(&self, id: ModuleId, event: &ModuleEvent) -> Result<()> {
        let patch = self.shared.patch.write();
        let slot = patch
            .slot(id)
            .ok_or_else(|| anyhow!("module {id} is not in the patch"))?;
        slot.on_event(event);
        Ok(())
    }
}
impl Drop for Engine {
    fn drop(&mut self) {
        self.shared.fallback_running.store(false, Ordering::Release);
        if let Some(handle) = self.fallback.lock().take() {
            let _ = handle.join();
        }
    }
}

/// The state shared between the engine facade, its worker threads, and the
/// fallback clock.
#[derive(Debug)]
struct EngineShared {
    patch: RwLock<Patch>,
    step_mutex: Mutex<()>,
    pool: Mutex<WorkerPool>,
    yield_flag: Arc<AtomicBool>,
    handles: HandleRegistry,
    module_ids: IdFactory<ModuleId>,
    cable_ids: IdFactory<CableId>,
    factory: Arc<ModuleFactory>,

    sample_rate: AtomicF32,
    sample_rate_is_explicit: AtomicBool,
    /// Per-frame parameter smoothing coefficient for the current rate.
    smoothing: AtomicF32,
    block: AtomicI64,
    frame: AtomicI64,
    block_frame: AtomicI64,
    block_time: AtomicF64,
    block_frames: AtomicUsize,
    meter: Meter,
    epoch: Instant,
    fallback_block_frames: usize,
    fallback_running: AtomicBool,
    workers: AtomicUsize,
}
impl EngineShared {
    fn step_block(&self, frames: usize) {
        let patch = self.patch.read();
        let _step_guard = self.step_mutex.lock();
        let start = Instant::now();

        let sample_rate = self.sample_rate.load(Ordering::Relaxed);
        let sample_time = 1.0 / sample_rate;
        let lambda = self.smoothing.load(Ordering::Relaxed);
        let eval = patch.eval_list();

        self.block_frame
            .store(self.frame.load(Ordering::Relaxed), Ordering::Relaxed);
        self.block_time
            .store(self.epoch.elapsed().as_secs_f64(), Ordering::Relaxed);
        self.block_frames.store(frames, Ordering::Relaxed);

        let pool = self.pool.lock();
        for _ in 0..frames {
            for slot in eval.iter() {
                slot.step_smoothing(lambda);
            }
            let args = ProcessArgs {
                sample_rate,
                sample_time,
                frame: self.frame.load(Ordering::Relaxed),
                yield_flag: Arc::clone(&self.yield_flag),
            };
            let completed = pool.run_frame(&eval, args);
            if completed {
                patch.propagate_cables();
            }
            self.frame.fetch_add(1, Ordering::Relaxed);
            if !completed {
                // A module panicked; the rest of the block is abandoned. The
                // patch itself is still consistent.
                break;
            }
        }
        self.yield_flag.store(false, Ordering::Release);
        drop(pool);

        self.block.fetch_add(1, Ordering::Relaxed);
        let elapsed = start.elapsed().as_secs_f64();
        let duration = frames as f64 / sample_rate as f64;
        let load = if duration > 0.0 {
            elapsed / duration
        } else {
            0.0
        };
        self.meter
            .record(load, duration, self.epoch.elapsed().as_secs_f64());
    }

    fn block(&self) -> i64 {
        self.block.load(Ordering::Relaxed)
    }

    fn frame(&self) -> i64 {
        self.frame.load(Ordering::Relaxed)
    }

    fn set_frame(&self, frame: i64) {
        self.frame.store(frame, Ordering::Relaxed);
    }

    fn block_frame(&self) -> i64 {
        self.block_frame.load(Ordering::Relaxed)
    }

    fn block_time(&self) -> f64 {
        self.block_time.load(Ordering::Relaxed)
    }

    fn block_frames(&self) -> usize {
        self.block_frames.load(Ordering::Relaxed)
    }

    fn block_duration(&self) -> f64 {
        self.block_frames() as f64 / self.sample_rate() as f64
    }

    fn sample_rate(&self) -> f32 {
        self.sample_rate.load(Ordering::Relaxed)
    }

    fn sample_time(&self) -> f32 {
        1.0 / self.sample_rate()
    }

    fn meter_average(&self) -> f64 {
        self.meter.average()
    }

    fn meter_max(&self) -> f64 {
        self.meter.max()
    }

    fn yield_workers(&self) {
        self.yield_flag.store(true, Ordering::Release);
    }

    fn apply_sample_rate(&self, sample_rate: f32) {
        let patch = self.patch.write();
        let old_rate = self.sample_rate.swap(sample_rate, Ordering::Relaxed);
        self.smoothing
            .store(smoothing_lambda(1.0 / sample_rate), Ordering::Relaxed);
        let event = ModuleEvent::SampleRateChange {
            old_rate,
            new_rate: sample_rate,
        };
        patch.for_each_slot(|slot| slot.on_event(&event));
        drop(patch);
        self.relaunch_pool();
        tracing::debug!(old_rate, new_rate = sample_rate, "sample rate changed");
    }

    fn relaunch_pool(&self) {
        let mut pool = self.pool.lock();
        *pool = WorkerPool::new(self.workers.load(Ordering::Relaxed), &self.yield_flag);
    }

    fn fallback_run(&self) {
        let frames = self.fallback_block_frames;
        let mut deadline = Instant::now();
        while self.fallback_running.load(Ordering::Acquire) {
            if self.patch.read().master_module.is_some() {
                // A master module owns timing; idle until it's unset.
                std::thread::sleep(FALLBACK_IDLE_POLL);
                deadline = Instant::now();
                continue;
            }
            self.step_block(frames);
            let sample_rate = self.sample_rate.load(Ordering::Relaxed) as f64;
            deadline += Duration::from_secs_f64(frames as f64 / sample_rate);
            let now = Instant::now();
            if deadline > now {
                std::thread::sleep(deadline - now);
            } else {
                // Fell behind real time; re-anchor rather than sprint to
                // catch up.
                deadline = now;
            }
        }
        tracing::debug!("fallback clock stopped");
    }
}
