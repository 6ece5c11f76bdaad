// Copyright (c) 2024 Mike Tsao

//! Polyphonic voltage ports. An output port is written by its owning module
//! during [Module::process()](crate::traits::Module::process); an input port
//! is a latched copy that the block scheduler refreshes from the connected
//! output once per frame.

use atomic_float::AtomicF32;
use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};

/// The maximum number of polyphonic voices a port can carry.
pub const MAX_CHANNELS: usize = 16;

/// The fixed bank of voltage lanes behind every port. Lanes are relaxed
/// atomics: the producing module is the only writer while a frame is in
/// flight, and the frame barriers order writers against readers, so plain
/// loads and stores are all that is needed.
#[derive(Debug)]
struct Voltages {
    lanes: [AtomicF32; MAX_CHANNELS],
    channels: AtomicU8,
}
impl Default for Voltages {
    fn default() -> Self {
        Self {
            lanes: core::array::from_fn(|_| AtomicF32::new(0.0)),
            channels: AtomicU8::new(1),
        }
    }
}
impl Voltages {
    fn get(&self, channel: usize) -> f32 {
        if channel < MAX_CHANNELS {
            self.lanes[channel].load(Ordering::Relaxed)
        } else {
            0.0
        }
    }

    fn set(&self, channel: usize, voltage: f32) {
        if channel < MAX_CHANNELS {
            self.lanes[channel].store(voltage, Ordering::Relaxed);
        }
    }

    fn channels(&self) -> usize {
        self.channels.load(Ordering::Relaxed) as usize
    }

    fn set_channels(&self, channels: usize) {
        self.channels
            .store(channels.min(MAX_CHANNELS) as u8, Ordering::Relaxed);
    }

    fn zero(&self) {
        for lane in &self.lanes {
            lane.store(0.0, Ordering::Relaxed);
        }
    }
}

/// A module's input. Reads the voltages that the most recent cable
/// propagation latched; a disconnected input reads one channel of 0 V.
#[derive(Debug, Default)]
pub struct InputPort {
    voltages: Voltages,
    connected: AtomicBool,
}
impl InputPort {
    /// The voltage on the given channel. Channels at or beyond
    /// [InputPort::channels()] read 0 V.
    pub fn voltage(&self, channel: usize) -> f32 {
        self.voltages.get(channel)
    }

    /// The voltage on the given channel, or `fallback` if nothing is plugged
    /// in. Modules use this for normalled inputs.
    pub fn voltage_or(&self, channel: usize, fallback: f32) -> f32 {
        if self.is_connected() {
            self.voltage(channel)
        } else {
            fallback
        }
    }

    /// How many voices the connected output is producing. 1 when
    /// disconnected.
    pub fn channels(&self) -> usize {
        self.voltages.channels()
    }

    /// Whether a cable is plugged into this input.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Copies the connected output's channel count and voltages into this
    /// port. Non-finite voltages are squashed to 0 V so one misbehaving
    /// module cannot poison everything downstream.
    pub(crate) fn latch_from(&self, output: &OutputPort) {
        let channels = output.channels();
        self.voltages.set_channels(channels.max(1));
        for channel in 0..MAX_CHANNELS {
            let v = if channel < channels {
                let v = output.voltage(channel);
                if v.is_finite() {
                    v
                } else {
                    0.0
                }
            } else {
                0.0
            };
            self.voltages.set(channel, v);
        }
    }

    pub(crate) fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Relaxed);
    }

    /// Returns the port to its unplugged state: one channel of 0 V.
    pub(crate) fn reset(&self) {
        self.voltages.zero();
        self.voltages.set_channels(1);
        self.set_connected(false);
    }
}

/// A module's output. The owning module overwrites the voltages (and,
/// optionally, the channel count) every frame.
#[derive(Debug, Default)]
pub struct OutputPort {
    voltages: Voltages,
    connected: AtomicBool,
}
impl OutputPort {
    #[allow(missing_docs)]
    pub fn voltage(&self, channel: usize) -> f32 {
        self.voltages.get(channel)
    }

    #[allow(missing_docs)]
    pub fn set_voltage(&self, channel: usize, voltage: f32) {
        self.voltages.set(channel, voltage);
    }

    /// How many voices this output is producing.
    pub fn channels(&self) -> usize {
        self.voltages.channels()
    }

    /// Declares how many voices this output produces, clamped to
    /// `0..=MAX_CHANNELS`. Consumers adapt on the next propagation.
    pub fn set_channels(&self, channels: usize) {
        self.voltages.set_channels(channels);
    }

    /// Whether at least one cable is plugged into this output.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub(crate) fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Relaxed);
    }

    pub(crate) fn zero(&self) {
        self.voltages.zero();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disconnected_input_reads_silence() {
        let input = InputPort::default();
        assert!(!input.is_connected());
        assert_eq!(input.channels(), 1);
        assert_eq!(input.voltage(0), 0.0);
        assert_eq!(
            input.voltage_or(0, 2.5),
            2.5,
            "disconnected input should fall back to the normalled value"
        );
    }

    #[test]
    fn latch_copies_voltages_and_channels() {
        let output = OutputPort::default();
        let input = InputPort::default();

        output.set_channels(3);
        output.set_voltage(0, 1.0);
        output.set_voltage(1, -10.0);
        output.set_voltage(2, 0.25);
        input.latch_from(&output);

        assert_eq!(input.channels(), 3);
        assert_eq!(input.voltage(0), 1.0);
        assert_eq!(input.voltage(1), -10.0);
        assert_eq!(input.voltage(2), 0.25);
        assert_eq!(input.voltage(3), 0.0, "unused lanes should read 0 V");
    }

    #[test]
    fn latch_squashes_non_finite_voltages() {
        let output = OutputPort::default();
        let input = InputPort::default();

        output.set_voltage(0, f32::NAN);
        input.latch_from(&output);
        assert_eq!(input.voltage(0), 0.0);

        output.set_voltage(0, f32::INFINITY);
        input.latch_from(&output);
        assert_eq!(input.voltage(0), 0.0);
    }

    #[test]
    fn channel_count_clamps() {
        let output = OutputPort::default();
        output.set_channels(100);
        assert_eq!(output.channels(), MAX_CHANNELS);
        output.set_channels(0);
        assert_eq!(output.channels(), 0);
    }

    #[test]
    fn out_of_range_lanes_are_inert() {
        let output = OutputPort::default();
        output.set_voltage(MAX_CHANNELS, 5.0);
        assert_eq!(output.voltage(MAX_CHANNELS), 0.0);
    }
}
