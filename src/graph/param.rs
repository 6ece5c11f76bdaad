// Copyright (c) 2024 Mike Tsao

//! Engine-side parameter storage. Values are relaxed atomics so that a UI
//! thread can read and write them without ever blocking the audio thread;
//! modules read each parameter once per frame, which is the only ordering
//! anyone needs.

use atomic_float::AtomicF32;
use core::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Smoothing time constant: about 60 samples at 44.1 kHz. Short enough to
/// feel immediate under a mouse drag, long enough to avoid zipper noise.
pub(crate) const SMOOTHING_TAU: f32 = 60.0 / 44_100.0;

/// When a smoothed value gets this close to its target, it snaps.
const SMOOTHING_EPSILON: f32 = 1e-6;

/// One mutable parameter of a mounted module: the current value plus the
/// target that per-frame smoothing moves it toward.
#[derive(Debug, Default)]
pub struct Param {
    value: AtomicF32,
    target: AtomicF32,
    smoothing: AtomicBool,
}
impl Param {
    /// The current (possibly mid-smoothing) value.
    pub fn value(&self) -> f32 {
        self.value.load(Ordering::Relaxed)
    }

    /// Sets the value instantly, canceling any smoothing in progress.
    pub fn set_value(&self, value: f32) {
        self.smoothing.store(false, Ordering::Relaxed);
        self.value.store(value, Ordering::Relaxed);
        self.target.store(value, Ordering::Relaxed);
    }

    /// The target that smoothing is moving toward. Equal to
    /// [Param::value()] when no smoothing is in progress.
    pub fn smooth_target(&self) -> f32 {
        self.target.load(Ordering::Relaxed)
    }

    /// Asks the value to glide toward `target` over the next few frames.
    pub fn set_smooth_target(&self, target: f32) {
        self.target.store(target, Ordering::Relaxed);
        self.smoothing.store(true, Ordering::Relaxed);
    }

    /// Advances smoothing by one frame. `lambda` is the per-frame filter
    /// coefficient `1 - exp(-sample_time / tau)`. Returns whether the
    /// parameter still needs smoothing after this step.
    pub(crate) fn step_smoothing(&self, lambda: f32) -> bool {
        if !self.smoothing.load(Ordering::Relaxed) {
            return false;
        }
        let value = self.value.load(Ordering::Relaxed);
        let target = self.target.load(Ordering::Relaxed);
        let next = value + (target - value) * lambda;
        // Snap when close, and also when a step no longer moves the value
        // (the increment has shrunk below one ulp, which happens before the
        // epsilon test fires for large-magnitude values).
        if (target - value).abs() < SMOOTHING_EPSILON || next == value {
            self.value.store(target, Ordering::Relaxed);
            self.smoothing.store(false, Ordering::Relaxed);
            false
        } else {
            self.value.store(next, Ordering::Relaxed);
            true
        }
    }
}

/// The per-frame smoothing coefficient for the given sample time.
pub(crate) fn smoothing_lambda(sample_time: f32) -> f32 {
    1.0 - (-sample_time / SMOOTHING_TAU).exp()
}

/// A mounted module's parameters, plus the flag that lets the scheduler skip
/// the whole bank with one load when nothing is gliding.
#[derive(Debug)]
pub(crate) struct ParamBank {
    params: Box<[Param]>,
    smoothing_armed: AtomicBool,
}
impl ParamBank {
    pub fn new(len: usize) -> Self {
        Self {
            params: (0..len)
                .map(|_| Param::default())
                .collect::<Vec<_>>()
                .into_boxed_slice(),
            smoothing_armed: AtomicBool::new(false),
        }
    }

    pub fn params(&self) -> &[Param] {
        &self.params
    }

    pub fn arm_smoothing(&self) {
        self.smoothing_armed.store(true, Ordering::Relaxed);
    }

    /// Advances all armed parameter smoothers by one frame, disarming the
    /// bank once every parameter has settled.
    pub fn step_smoothing(&self, lambda: f32) {
        if !self.smoothing_armed.load(Ordering::Relaxed) {
            return;
        }
        let mut any_active = false;
        for param in self.params.iter() {
            if param.step_smoothing(lambda) {
                any_active = true;
            }
        }
        if !any_active {
            self.smoothing_armed.store(false, Ordering::Relaxed);
        }
    }
}

/// A pre-resolved reference to one parameter of one mounted module.
///
/// This is the guaranteed never-blocking way to drive a parameter: resolve it
/// once with [Engine::param_ref()](crate::engine::Engine::param_ref) (which
/// looks the module up under the read lock), then every read and write
/// through it is a relaxed atomic operation that cannot wait for a block or a
/// topology change. A UI resolves a ref on mouse-down and writes through it
/// for the rest of the drag.
///
/// The ref pins the parameter storage, not the module: if the module is
/// removed, writes land in storage nothing reads anymore, harmlessly. Unlike
/// a [ParamHandle](crate::engine::ParamHandle) it does not reattach when the
/// module id returns; resolve a fresh one.
#[derive(Clone, Debug)]
pub struct ParamRef {
    bank: Arc<ParamBank>,
    index: usize,
}
impl ParamRef {
    /// `index` has been validated against the bank by the caller.
    pub(crate) fn new(bank: Arc<ParamBank>, index: usize) -> Self {
        Self { bank, index }
    }

    /// The current (possibly mid-smoothing) value.
    pub fn value(&self) -> f32 {
        self.bank.params[self.index].value()
    }

    /// Sets the value instantly, canceling any smoothing in progress.
    pub fn set_value(&self, value: f32) {
        self.bank.params[self.index].set_value(value);
    }

    /// The target smoothing is moving toward.
    pub fn smooth_target(&self) -> f32 {
        self.bank.params[self.index].smooth_target()
    }

    /// Asks the value to glide toward `target` over the next few frames.
    pub fn set_smooth_target(&self, target: f32) {
        self.bank.params[self.index].set_smooth_target(target);
        self.bank.arm_smoothing();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use more_asserts::{assert_gt, assert_lt};

    #[test]
    fn set_value_is_instant() {
        let p = Param::default();
        p.set_value(0.73);
        assert_eq!(p.value(), 0.73);
        assert_eq!(p.smooth_target(), 0.73);
        assert!(!p.step_smoothing(0.5), "instant set should not arm smoothing");
    }

    #[test]
    fn smoothing_converges_monotonically() {
        let p = Param::default();
        let lambda = smoothing_lambda(1.0 / 48_000.0);
        p.set_smooth_target(1.0);

        let mut previous = p.value();
        for _ in 0..1024 {
            p.step_smoothing(lambda);
            assert_gt!(p.value(), previous - f32::EPSILON);
            previous = p.value();
        }
        assert_lt!((p.value() - 1.0).abs(), 1e-3);
    }

    #[test]
    fn smoothing_snaps_when_close() {
        let p = Param::default();
        p.set_value(1.0);
        p.set_smooth_target(1.0 + SMOOTHING_EPSILON / 2.0);
        assert!(!p.step_smoothing(0.1), "a negligible delta should snap immediately");
        assert_eq!(p.value(), p.smooth_target());
    }

    #[test]
    fn instant_set_cancels_smoothing() {
        let p = Param::default();
        p.set_smooth_target(5.0);
        p.set_value(2.0);
        assert!(!p.step_smoothing(0.5));
        assert_eq!(p.value(), 2.0);
    }

    #[test]
    fn bank_disarms_once_everything_settles() {
        let bank = ParamBank::new(2);
        bank.params()[0].set_smooth_target(1.0);
        bank.arm_smoothing();

        let lambda = smoothing_lambda(1.0 / 48_000.0);
        for _ in 0..2048 {
            bank.step_smoothing(lambda);
        }
        assert_eq!(bank.params()[0].value(), 1.0);
        assert!(
            !bank.smoothing_armed.load(Ordering::Relaxed),
            "the bank should disarm after all parameters settle"
        );
    }

    #[test]
    fn param_ref_reads_and_writes_the_same_storage() {
        let bank = Arc::new(ParamBank::new(1));
        let param_ref = ParamRef::new(Arc::clone(&bank), 0);

        param_ref.set_value(0.25);
        assert_eq!(bank.params()[0].value(), 0.25);

        param_ref.set_smooth_target(1.0);
        assert_eq!(param_ref.smooth_target(), 1.0);
        assert!(
            bank.smoothing_armed.load(Ordering::Relaxed),
            "a smooth-set through a ref should arm the bank"
        );
    }
}
