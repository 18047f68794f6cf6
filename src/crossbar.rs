//! Simulated crossbar array

use std::ops::Range;
use rand::{Rng, SeedableRng};
use rand::rngs::StdRng;
use thiserror::Error;

use crate::device::{DeviceModel, ModelError};

/// Error type for crossbar operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CrossbarError {
    /// Word or bit outside of the configured array
    #[error("Address W{word}B{bit} outside of {words}×{bits} array")]
    AddressOutOfBounds { word: usize, bit: usize, words: usize, bits: usize },
    /// Device model rejected its parameters
    #[error("Device model error: {0}")]
    Model(#[from] ModelError),
}


/// A `words × bits` array of simulated devices
///
/// Devices are stored in a `(words+1) × (bits+1)` grid so that they can
/// be addressed with the 1-based word/bit numbers used on the wire; row
/// and column 0 are never touched. The array also owns the random
/// generator used to inject read noise.
pub struct Crossbar<M: DeviceModel> {
    words: usize,
    bits: usize,
    devices: Vec<M>,
    read_noise: f64,
    rng: StdRng,
}

impl<M: DeviceModel + Clone> Crossbar<M> {

    /// Create a new array populated with clones of `prototype`. Every
    /// device is initialised at a resistance drawn uniformly from
    /// `band`.
    pub fn new(words: usize, bits: usize, prototype: &M, band: Range<f64>,
        read_noise: f64, mut rng: StdRng) -> Result<Self, CrossbarError> {

        let mut devices: Vec<M> = Vec::with_capacity((words+1)*(bits+1));

        for w in 0..=words {
            for b in 0..=bits {
                let mut dev = prototype.clone();
                // sentinel row/column keep the prototype state
                if w > 0 && b > 0 {
                    let rinit = if band.start < band.end {
                        rng.gen_range(band.clone())
                    } else {
                        band.start
                    };
                    dev.initialise(rinit)?;
                }
                devices.push(dev);
            }
        }

        Ok(Crossbar { words, bits, devices, read_noise, rng })
    }

    /// Same as [`Crossbar::new`] with a deterministic noise generator
    pub fn with_seed(words: usize, bits: usize, prototype: &M, band: Range<f64>,
        read_noise: f64, seed: u64) -> Result<Self, CrossbarError> {
        Self::new(words, bits, prototype, band, read_noise, StdRng::seed_from_u64(seed))
    }
}

impl<M: DeviceModel> Crossbar<M> {

    pub fn words(&self) -> usize {
        self.words
    }

    pub fn bits(&self) -> usize {
        self.bits
    }

    fn check(&self, word: usize, bit: usize) -> Result<(), CrossbarError> {
        if word < 1 || word > self.words || bit < 1 || bit > self.bits {
            return Err(CrossbarError::AddressOutOfBounds {
                word, bit, words: self.words, bits: self.bits });
        }
        Ok(())
    }

    #[inline]
    fn idx(&self, word: usize, bit: usize) -> usize {
        word * (self.bits + 1) + bit
    }

    /// Apply a pulse of `amplitude` volts for `pw` seconds to the device
    /// at `(word, bit)`, integrating in steps of `dt`. Every other device
    /// sharing the word or the bit line sees `amplitude/2` for the whole
    /// duration (V/2 write scheme); all other devices are unaffected.
    pub fn pulse(&mut self, word: usize, bit: usize, amplitude: f64, pw: f64, dt: f64)
        -> Result<(), CrossbarError> {

        self.check(word, bit)?;

        let steps = if dt > 0.0 { ((pw / dt).round() as usize).max(1) } else { 1 };
        let half = amplitude / 2.0;
        let selected = self.idx(word, bit);

        for _ in 0..steps {
            self.devices[selected].step_dt(amplitude, dt);

            // halo along the word line
            for b in 1..=self.bits {
                if b != bit {
                    let i = self.idx(word, b);
                    self.devices[i].step_dt(half, dt);
                }
            }

            // and along the bit line
            for w in 1..=self.words {
                if w != word {
                    let i = self.idx(w, bit);
                    self.devices[i].step_dt(half, dt);
                }
            }
        }

        Ok(())
    }

    /// Read a device. The result carries a uniformly distributed
    /// multiplicative error of at most `read_noise`.
    pub fn read(&mut self, word: usize, bit: usize) -> Result<f64, CrossbarError> {
        self.check(word, bit)?;
        let rmem = self.devices[self.idx(word, bit)].resistance();
        let noise: f64 = self.rng.gen_range(-1.0..1.0);
        Ok(rmem + self.read_noise * rmem * noise)
    }

    /// Noiseless state of a device
    pub fn resistance(&self, word: usize, bit: usize) -> Result<f64, CrossbarError> {
        self.check(word, bit)?;
        Ok(self.devices[self.idx(word, bit)].resistance())
    }

    /// Direct access to a device
    pub fn device_mut(&mut self, word: usize, bit: usize) -> Result<&mut M, CrossbarError> {
        self.check(word, bit)?;
        let i = self.idx(word, bit);
        Ok(&mut self.devices[i])
    }
}


#[cfg(test)]
mod tests {

    use super::*;
    use crate::device::{ParametricDevice, DeviceModel};
    use assert_matches::assert_matches;

    fn array(proto: &ParametricDevice) -> Crossbar<ParametricDevice> {
        Crossbar::with_seed(32, 32, proto, 8000.0..12000.0, 0.01, 42).unwrap()
    }

    fn snapshot(cb: &Crossbar<ParametricDevice>) -> Vec<u64> {
        let mut res = Vec::with_capacity(32*32);
        for w in 1..=32 {
            for b in 1..=32 {
                res.push(cb.resistance(w, b).unwrap().to_bits());
            }
        }
        res
    }

    #[test]
    fn initial_band() {
        let cb = array(&ParametricDevice::default());
        for w in 1..=32 {
            for b in 1..=32 {
                let r = cb.resistance(w, b).unwrap();
                assert!(r >= 8000.0 && r < 12000.0);
            }
        }
    }

    #[test]
    fn halo_only_on_shared_lines() {
        let mut cb = array(&ParametricDevice::default());
        let before = snapshot(&cb);

        cb.pulse(5, 7, 2.0, 1e-4, 1e-6).unwrap();
        let after = snapshot(&cb);

        for w in 1..=32usize {
            for b in 1..=32usize {
                let i = (w-1)*32 + (b-1);
                if w == 5 || b == 7 {
                    assert_ne!(before[i], after[i], "W{}B{} should have moved", w, b);
                } else {
                    assert_eq!(before[i], after[i], "W{}B{} should be untouched", w, b);
                }
            }
        }
    }

    #[test]
    fn halo_receives_half_voltage() {
        let proto = ParametricDevice::default();
        let mut cb = Crossbar::with_seed(32, 32, &proto, 10_000.0..10_000.0, 0.01, 1).unwrap();

        cb.pulse(5, 7, 2.0, 1e-4, 1e-6).unwrap();

        // reference trajectories integrated in isolation
        let mut full = proto.clone();
        full.initialise(10_000.0).unwrap();
        let mut half = proto.clone();
        half.initialise(10_000.0).unwrap();
        for _ in 0..100 {
            full.step_dt(2.0, 1e-6);
            half.step_dt(1.0, 1e-6);
        }

        assert_eq!(cb.resistance(5, 7).unwrap(), full.resistance());
        for b in (1..=32).filter(|b| *b != 7) {
            assert_eq!(cb.resistance(5, b).unwrap(), half.resistance());
        }
        for w in (1..=32).filter(|w| *w != 5) {
            assert_eq!(cb.resistance(w, 7).unwrap(), half.resistance());
        }
        assert_eq!(cb.resistance(6, 8).unwrap(), 10_000.0);
    }

    #[test]
    fn inert_array_is_untouched() {
        let mut cb = array(&ParametricDevice::inert());
        let before = snapshot(&cb);
        cb.pulse(5, 7, 3.0, 1e-4, 1e-6).unwrap();
        assert_eq!(before, snapshot(&cb));
    }

    #[test]
    fn read_noise_bound() {
        let proto = ParametricDevice::inert();
        let mut cb = Crossbar::with_seed(4, 4, &proto, 10_000.0..10_000.0, 0.01, 7).unwrap();

        for _ in 0..10_000 {
            let r = cb.read(2, 2).unwrap();
            assert!(r >= 9900.0 && r <= 10100.0);
            assert!(r != 0.0);
        }
        // reads do not disturb the state
        assert_eq!(cb.resistance(2, 2).unwrap(), 10_000.0);
    }

    #[test]
    fn out_of_bounds() {
        let mut cb = Crossbar::with_seed(3, 3, &ParametricDevice::default(),
            8000.0..12000.0, 0.01, 0).unwrap();

        assert_matches!(cb.read(0, 1), Err(CrossbarError::AddressOutOfBounds { word: 0, .. }));
        assert_matches!(cb.read(4, 1), Err(CrossbarError::AddressOutOfBounds { word: 4, .. }));
        assert_matches!(cb.pulse(1, 4, 1.0, 1e-4, 1e-6),
            Err(CrossbarError::AddressOutOfBounds { bit: 4, .. }));
    }
}
