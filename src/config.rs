//! Instrument, simulation and connection settings

use std::ops::Range;
use std::time::Duration;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;

/// Largest crossbar ArC ONE can address
pub const MAX_WORDS: usize = 32;
/// Largest crossbar ArC ONE can address
pub const MAX_BITS: usize = 32;


/// Read-out front-end configuration
#[derive(Clone, Copy, Debug, PartialEq, FromPrimitive)]
#[repr(u8)]
pub enum ReadMode {
    /// Classic voltage divider
    Classic = 0,
    /// Transimpedance amplifier
    TIA = 1,
    /// Four-point transimpedance amplifier
    TIA4P = 2,
    /// TIA4P with negative read-out voltage. Never selected by the user;
    /// substituted on the wire when `TIA4P` is combined with `Vread < 0`.
    TIA4PNeg = 3,
}

/// Session mode of the instrument
#[derive(Clone, Copy, Debug, PartialEq, FromPrimitive)]
#[repr(u8)]
pub enum SessionMode {
    /// Devices on the internal socket
    Local = 0,
    /// Devices connected through the external BNCs
    ExternalBNC = 1,
    /// Internal devices routed to the BNCs
    BNCToLocal = 2,
    /// No instrument connected
    Offline = 3,
}

/// Biasing scheme for non-selected lines during writes
#[derive(Clone, Copy, Debug, PartialEq, FromPrimitive)]
#[repr(u8)]
pub enum SneakPath {
    /// V/3 biasing
    OneThird = 0,
    /// V/2 biasing
    OneHalf = 1,
}

/// Addressing mode of a _read all_ job
#[derive(Clone, Copy, Debug, PartialEq, FromPrimitive)]
#[repr(u8)]
pub enum ReadAllMode {
    /// Every crosspoint in the configured array
    All = 1,
    /// Only the crosspoints of a custom selection
    Custom = 2,
}

/// Waveform of a curve tracer sweep
#[derive(Clone, Copy, Debug, PartialEq, FromPrimitive)]
#[repr(u8)]
pub enum CurveType {
    Staircase = 0,
    Pulsed = 1,
}

/// Polarity span of a curve tracer sweep
#[derive(Clone, Copy, Debug, PartialEq, FromPrimitive)]
#[repr(u8)]
pub enum CurveSpan {
    PosThenNeg = 0,
    NegThenPos = 1,
    PosOnly = 2,
    NegOnly = 3,
}

/// Convert a wire number into one of the enumerated settings above
pub(crate) fn enum_from_f64<T: FromPrimitive>(val: f64) -> Option<T> {
    if val.fract() != 0.0 {
        return None;
    }
    T::from_i64(val as i64)
}


/// Hardware configuration of an ArC ONE session
///
/// This is what the full initialisation job (`0`) transfers to the
/// instrument and it is also the context the virtual instrument consults
/// when validating addresses and tagging history entries.
#[derive(Clone, Debug, PartialEq)]
pub struct HardwareConfig {
    /// Number of reads averaged by the firmware per read-out
    pub cycles: u32,
    /// Active word lines
    pub words: usize,
    /// Active bit lines
    pub bits: usize,
    pub read_mode: ReadMode,
    pub session_mode: SessionMode,
    pub sneak_path: SneakPath,
    /// Read-out voltage
    pub vread: f64,
}

impl Default for HardwareConfig {
    fn default() -> Self {
        HardwareConfig {
            cycles: 50,
            words: MAX_WORDS,
            bits: MAX_BITS,
            read_mode: ReadMode::TIA4P,
            session_mode: SessionMode::Local,
            sneak_path: SneakPath::OneHalf,
            vread: 0.5,
        }
    }
}

impl HardwareConfig {

    pub fn with_size(mut self, words: usize, bits: usize) -> Self {
        self.words = words;
        self.bits = bits;
        self
    }

    pub fn with_read(mut self, mode: ReadMode, vread: f64) -> Self {
        self.read_mode = mode;
        self.vread = vread;
        self
    }

    pub fn with_cycles(mut self, cycles: u32) -> Self {
        self.cycles = cycles;
        self
    }

    pub fn with_sneak_path(mut self, sneak_path: SneakPath) -> Self {
        self.sneak_path = sneak_path;
        self
    }

    pub fn with_session_mode(mut self, mode: SessionMode) -> Self {
        self.session_mode = mode;
        self
    }

    /// Read mode as actually sent to the instrument. ArC ONE expects
    /// mode `3` for a four-point TIA read at negative voltage.
    pub fn wire_read_mode(&self) -> u8 {
        if self.read_mode == ReadMode::TIA4P && self.vread < 0.0 {
            ReadMode::TIA4PNeg as u8
        } else {
            self.read_mode as u8
        }
    }
}


/// Parameters of the simulated instrument
#[derive(Clone, Debug)]
pub struct SimulationConfig {
    /// Physical size of the simulated crossbar
    pub words: usize,
    pub bits: usize,
    /// Band of the randomised initial resistances
    pub init_band: Range<f64>,
    /// Relative amplitude of the uniform read noise
    pub read_noise: f64,
    /// Integration steps per pulse
    pub steps_per_pulse: usize,
    /// Upper bound of the integration timestep
    pub max_dt: f64,
    /// Seed for the noise generator; `None` seeds from entropy
    pub seed: Option<u64>,
    /// Deadline for blocking reads; `None` waits indefinitely
    pub read_timeout: Option<Duration>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        SimulationConfig {
            words: MAX_WORDS,
            bits: MAX_BITS,
            init_band: 8_000.0..12_000.0,
            read_noise: 0.01,
            steps_per_pulse: 100,
            max_dt: 1.0e-6,
            seed: None,
            read_timeout: Some(Duration::from_secs(30)),
        }
    }
}

impl SimulationConfig {

    pub fn with_size(mut self, words: usize, bits: usize) -> Self {
        self.words = words;
        self.bits = bits;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_init_band(mut self, band: Range<f64>) -> Self {
        self.init_band = band;
        self
    }

    pub fn with_read_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Timestep used to integrate a pulse of `pw` seconds
    pub fn dt_for(&self, pw: f64) -> f64 {
        let steps = self.steps_per_pulse.max(1) as f64;
        (pw / steps).min(self.max_dt)
    }
}


/// Serial connection settings for a physical ArC ONE
#[derive(Clone, Debug)]
pub struct SerialConfig {
    pub port: String,
    pub baud_rate: u32,
    /// Timeout of individual port operations
    pub port_timeout: Duration,
    /// Deadline for bulk float reads; `None` waits indefinitely
    pub read_timeout: Option<Duration>,
    /// Deadline for the initialisation handshake
    pub init_timeout: Duration,
}

impl SerialConfig {

    pub fn new(port: &str) -> Self {
        SerialConfig {
            port: port.to_string(),
            baud_rate: 921_600,
            port_timeout: Duration::from_millis(100),
            read_timeout: Some(Duration::from_secs(10)),
            init_timeout: Duration::from_secs(2),
        }
    }

    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }

    pub fn with_read_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.read_timeout = timeout;
        self
    }
}
