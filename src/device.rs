//! Resistive switching device models
//!
//! Every crosspoint of the simulated crossbar is an implementor of
//! [`DeviceModel`]. The canonical model is [`ParametricDevice`], a
//! data-driven threshold model that integrates the resistance itself. An
//! alternate [`BiolekDevice`] integrates a normalised state variable
//! clamped to `[0, 1]`.

use thiserror::Error;

// Width of the smoothed step used by the parametric window, in ohms
const STP_WIDTH: f64 = 1.0;
// Largest share of the distance to r(V) covered by one integration step
const STEP_FRACTION: f64 = 0.5;
// Bound on the subdivisions of a single timestep
const MAX_SUBSTEPS: usize = 1000;


/// Error type for device model operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModelError {
    /// Initial resistance must be finite and strictly positive
    #[error("Invalid initial resistance: {0} Ω")]
    NonPositiveResistance(f64),
}


/// Common behaviour of all device models.
///
/// A model owns its resistive state exclusively; the only way to evolve
/// it is [`DeviceModel::step_dt`].
pub trait DeviceModel: Send {

    /// Set the starting resistance. Fails (leaving the state untouched)
    /// if `rinit` is not finite or not strictly positive.
    fn initialise(&mut self, rinit: f64) -> Result<(), ModelError>;

    /// Integrate one timestep of `dt` seconds under `voltage` volts.
    fn step_dt(&mut self, voltage: f64, dt: f64);

    /// Current resistance in ohms
    fn resistance(&self) -> f64;
}

fn check_rinit(rinit: f64) -> Result<(), ModelError> {
    if !rinit.is_finite() || rinit <= 0.0 {
        return Err(ModelError::NonPositiveResistance(rinit));
    }
    Ok(())
}

/// Logistic step; 0 for large negative `x`, 1 for large positive `x`
fn stp(x: f64) -> f64 {
    1.0 / (1.0 + (-x / STP_WIDTH).exp())
}


/// Parametric threshold model
///
/// For a bias `V` the branch `(A, t, a0, a1)` is selected by the sign of
/// `V` (`p` for positive, `n` for negative). The resistance evolves as
///
/// ```text
/// r(V)   = a0 + a1·V
/// s(V)   = A·(exp(|V|/t) − 1)
/// dR/dt  = s(V) · stp(sign(A)·(r(V) − R)) · (r(V) − R)²
/// ```
///
/// so the state moves towards the absolute threshold `r(V)` in the
/// direction given by the sign of `A` but only while `r(V)` lies on that
/// side. A timestep whose Euler update would cover more than half of the
/// remaining distance to `r(V)` is subdivided, so `R` approaches the
/// threshold without crossing it. `R` itself is never clamped; a
/// parameter set whose `r(V)` is negative will drive it there.
#[derive(Clone, Debug, PartialEq)]
pub struct ParametricDevice {
    pub ap: f64,
    pub an: f64,
    pub a0p: f64,
    pub a1p: f64,
    pub a0n: f64,
    pub a1n: f64,
    pub tp: f64,
    pub tn: f64,
    rmem: f64,
}

impl ParametricDevice {

    /// Create a new device with the specified parameters. The initial
    /// resistance is 10 kΩ until [`DeviceModel::initialise`] is called.
    pub fn new(ap: f64, an: f64, a0p: f64, a1p: f64, a0n: f64, a1n: f64,
        tp: f64, tn: f64) -> Self {
        ParametricDevice { ap, an, a0p, a1p, a0n, a1n, tp, tn, rmem: 10_000.0 }
    }

    /// A device that never switches (`Ap = An = 0`)
    pub fn inert() -> Self {
        let mut dev = Self::default();
        dev.ap = 0.0;
        dev.an = 0.0;
        dev
    }

    /// Absolute threshold `r(V)`
    pub fn threshold(&self, voltage: f64) -> f64 {
        if voltage > 0.0 {
            self.a0p + self.a1p * voltage
        } else {
            self.a0n + self.a1n * voltage
        }
    }

    /// Switching sensitivity `s(V)`
    pub fn sensitivity(&self, voltage: f64) -> f64 {
        if voltage > 0.0 {
            self.ap * ((voltage.abs() / self.tp).exp() - 1.0)
        } else if voltage < 0.0 {
            self.an * ((voltage.abs() / self.tn).exp() - 1.0)
        } else {
            0.0
        }
    }

    /// Window function gating the approach towards `r(V)`
    pub fn window(&self, voltage: f64) -> f64 {
        let a = if voltage > 0.0 { self.ap } else { self.an };
        let dist = self.threshold(voltage) - self.rmem;
        stp(a.signum() * dist) * dist * dist
    }
}

impl Default for ParametricDevice {
    /// Parameters of the devices populating the virtual instrument.
    /// Positive bias drives the resistance down towards `4 kΩ − 250 Ω/V`,
    /// negative bias drives it up towards `14 kΩ + 2 kΩ/|V|`. Both
    /// thresholds stay positive well beyond the ±13 V of the instrument.
    fn default() -> Self {
        ParametricDevice::new(-7.0e-4, 7.0e-4, 4000.0, -250.0,
            14000.0, -2000.0, 0.4, 0.4)
    }
}

impl DeviceModel for ParametricDevice {

    fn initialise(&mut self, rinit: f64) -> Result<(), ModelError> {
        check_rinit(rinit)?;
        self.rmem = rinit;
        Ok(())
    }

    fn step_dt(&mut self, voltage: f64, dt: f64) {
        if voltage == 0.0 {
            return;
        }

        let sensitivity = self.sensitivity(voltage);
        let target = self.threshold(voltage);
        let mut left = dt;

        for _ in 0..MAX_SUBSTEPS {
            let drdt = sensitivity * self.window(voltage);
            if drdt == 0.0 || !drdt.is_finite() || left <= 0.0 {
                return;
            }

            let reach = STEP_FRACTION * (target - self.rmem).abs();
            let h = if (drdt * left).abs() > reach {
                reach / drdt.abs()
            } else {
                left
            };

            self.rmem += drdt * h;
            left -= h;
        }
    }

    fn resistance(&self) -> f64 {
        self.rmem
    }
}


/// Linear drift model with a Biolek window
///
/// The normalised state `x` maps linearly between `Roff` (`x = 0`) and
/// `Ron` (`x = 1`). It evolves as `dx/dt = k·i·(1 − (x − stp(−i))^(2p))`
/// where `i = V/R`, and is clamped to `[0, 1]` after every step.
#[derive(Clone, Debug, PartialEq)]
pub struct BiolekDevice {
    pub ron: f64,
    pub roff: f64,
    pub k: f64,
    pub p: i32,
    x: f64,
}

impl BiolekDevice {

    pub fn new(ron: f64, roff: f64, k: f64, p: i32) -> Self {
        BiolekDevice { ron, roff, k, p, x: 0.5 }
    }

    /// Normalised internal state
    pub fn state(&self) -> f64 {
        self.x
    }
}

impl Default for BiolekDevice {
    fn default() -> Self {
        BiolekDevice::new(1000.0, 20000.0, 1.0e6, 2)
    }
}

impl DeviceModel for BiolekDevice {

    fn initialise(&mut self, rinit: f64) -> Result<(), ModelError> {
        check_rinit(rinit)?;
        self.x = ((self.roff - rinit) / (self.roff - self.ron)).clamp(0.0, 1.0);
        Ok(())
    }

    fn step_dt(&mut self, voltage: f64, dt: f64) {
        let current = voltage / self.resistance();
        let step = if current < 0.0 { 1.0 } else { 0.0 };
        let window = 1.0 - (self.x - step).powi(2 * self.p);
        self.x = (self.x + self.k * current * window * dt).clamp(0.0, 1.0);
    }

    fn resistance(&self) -> f64 {
        self.ron * self.x + self.roff * (1.0 - self.x)
    }
}


#[cfg(test)]
mod tests {

    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn initialise_rejects_nonpositive() {
        let mut dev = ParametricDevice::default();
        dev.initialise(5000.0).unwrap();

        assert_matches!(dev.initialise(0.0), Err(ModelError::NonPositiveResistance(_)));
        assert_matches!(dev.initialise(-10.0), Err(ModelError::NonPositiveResistance(_)));
        assert_matches!(dev.initialise(f64::NAN), Err(ModelError::NonPositiveResistance(_)));

        // state untouched by the failed calls
        assert_eq!(dev.resistance(), 5000.0);

        let mut dev = BiolekDevice::default();
        assert_matches!(dev.initialise(0.0), Err(ModelError::NonPositiveResistance(_)));
    }

    #[test]
    fn inert_device_is_bit_identical() {
        let mut dev = ParametricDevice::inert();
        dev.initialise(10_123.456).unwrap();
        for _ in 0..1000 {
            dev.step_dt(2.5, 1e-6);
            dev.step_dt(-2.5, 1e-6);
        }
        assert_eq!(dev.resistance().to_bits(), 10_123.456f64.to_bits());
    }

    #[test]
    fn default_polarity() {
        let mut dev = ParametricDevice::default();
        dev.initialise(10_000.0).unwrap();

        for _ in 0..100 { dev.step_dt(1.5, 1e-6); }
        let after_pos = dev.resistance();
        assert!(after_pos < 10_000.0);

        for _ in 0..100 { dev.step_dt(-1.5, 1e-6); }
        assert!(dev.resistance() > after_pos);
    }

    #[test]
    fn zero_bias_is_noop() {
        let mut dev = ParametricDevice::default();
        dev.initialise(9000.0).unwrap();
        dev.step_dt(0.0, 1.0);
        assert_eq!(dev.resistance(), 9000.0);
    }

    #[test]
    fn threshold_gates_motion() {
        // positive branch floor is 4000 - 250·V; a device already
        // below it must not move under positive bias
        let mut dev = ParametricDevice::default();
        dev.initialise(1000.0).unwrap();
        for _ in 0..1000 { dev.step_dt(1.0, 1e-6); }
        assert!((dev.resistance() - 1000.0).abs() < 1e-6);
    }

    #[test]
    fn full_range_stays_physical() {
        let mut dev = ParametricDevice::default();
        dev.initialise(10_000.0).unwrap();

        for &v in &[10.0, -10.0, 13.0, -13.0, 10.0] {
            for _ in 0..100 {
                dev.step_dt(v, 1e-6);
            }
            let r = dev.resistance();
            assert!(r.is_finite() && r > 0.0, "{} Ω after {} V", r, v);

            // never beyond the threshold it is driven towards
            let floor = dev.threshold(v);
            if v > 0.0 {
                assert!(r >= floor, "{} Ω below {} Ω", r, floor);
            } else {
                assert!(r <= floor, "{} Ω above {} Ω", r, floor);
            }
        }
    }

    #[test]
    fn thresholds_positive_over_range() {
        let dev = ParametricDevice::default();
        for i in -130..=130 {
            let v = (i as f64) / 10.0;
            assert!(dev.threshold(v) > 0.0, "r({}) = {}", v, dev.threshold(v));
        }
    }

    #[test]
    fn half_bias_moves_less() {
        let mut full = ParametricDevice::default();
        let mut half = ParametricDevice::default();
        full.initialise(10_000.0).unwrap();
        half.initialise(10_000.0).unwrap();

        for _ in 0..100 {
            full.step_dt(2.0, 1e-6);
            half.step_dt(1.0, 1e-6);
        }

        assert!((10_000.0 - full.resistance()) > (10_000.0 - half.resistance()));
    }

    #[test]
    fn biolek_clamps_state() {
        let mut dev = BiolekDevice::default();
        dev.initialise(10_000.0).unwrap();

        for _ in 0..10_000 { dev.step_dt(5.0, 1e-3); }
        assert_eq!(dev.state(), 1.0);
        assert_eq!(dev.resistance(), dev.ron);

        for _ in 0..10_000 { dev.step_dt(-5.0, 1e-3); }
        assert_eq!(dev.state(), 0.0);
        assert_eq!(dev.resistance(), dev.roff);
    }
}
