// Copyright (c) 2024 Mike Tsao

//! Provides a random-number generator suitable for randomizing module state.

use byteorder::{BigEndian, ByteOrder};
use delegate::delegate;

/// A pseudorandom number generator (PRNG) sized for audio work: module
/// randomization, test signals, dither. Not cryptographically secure.
#[derive(Debug)]
pub struct Rng(oorandom::Rand32);
impl Default for Rng {
    fn default() -> Self {
        // We want to panic if this fails, because it indicates that a core OS
        // facility isn't functioning.
        Self::new_with_seed(Self::generate_seed().unwrap())
    }
}
#[allow(missing_docs)]
impl Rng {
    /// Pass the same number to [Rng::new_with_seed()] to get the same stream
    /// back again. Good for reproducing test failures.
    pub fn new_with_seed(seed: u64) -> Self {
        Self(oorandom::Rand32::new(seed))
    }

    /// Creates a sufficiently high-quality seed for [Rng].
    pub fn generate_seed() -> anyhow::Result<u64> {
        let mut bytes = [0u8; 8];

        getrandom::getrandom(&mut bytes)?;
        Ok(BigEndian::read_u64(&bytes))
    }

    /// A uniform value in -1.0..1.0, handy for scaling into a voltage range.
    pub fn rand_bipolar(&mut self) -> f32 {
        self.rand_float() * 2.0 - 1.0
    }

    delegate! {
        to self.0 {
            pub fn rand_u32(&mut self) -> u32;
            pub fn rand_i32(&mut self) -> i32;
            /// A uniform value in 0.0..1.0.
            pub fn rand_float(&mut self) -> f32;
            pub fn rand_range(&mut self, range: core::ops::Range<u32>) -> u32;
        }
    }
}
