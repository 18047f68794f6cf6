use std::io::{Read, Write, ErrorKind};
use std::sync::PoisonError;
use std::sync::mpsc::SendError;
use std::time::{Duration, Instant};
use log::{debug, warn, info};
use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};
use thiserror::Error;

use crate::config::{HardwareConfig, ReadAllMode, SerialConfig};
use crate::crossbar::CrossbarError;
use crate::device::ModelError;
use crate::dispatch::ProtocolError;
use crate::jobs::{JobParams, PulseParams, ReadAllParams};
use crate::mask::DeviceMask;

// Bounds of the polling interval while waiting for serial data
const MIN_POLL: Duration = Duration::from_micros(1);
const MAX_POLL: Duration = Duration::from_millis(10);


#[derive(Error, Debug)]
pub enum ArC1Error {
    /// Low level serial port error
    #[error("Serial port error: {0}")]
    SerialError(#[from] serialport::Error),
    /// I/O error on an open connection
    #[error("I/O error: {0}")]
    IOError(#[from] std::io::Error),
    /// Tokens could not be matched to a job
    #[error("Protocol error: {0}")]
    ProtocolFraming(ProtocolError),
    /// Word or bit outside of the configured array
    #[error("Address W{word}B{bit} outside of {words}×{bits} array")]
    AddressOutOfBounds { word: usize, bit: usize, words: usize, bits: usize },
    /// Simulated device rejected its parameters
    #[error("Device model error: {0}")]
    ModelError(#[from] ModelError),
    /// Instrument did not respond in time
    #[error("Instrument timed out after {0:?}")]
    InstrumentTimeout(Duration),
    /// Initialisation handshake failed; the connection is closed
    #[error("Instrument did not confirm initialisation: {0}")]
    InitConfirmationFailure(String),
    /// Read attempted with no job producing output
    #[error("No job active")]
    NoJobActive,
    /// Connection has been closed
    #[error("Instrument not connected")]
    NotConnected,
    /// The simulation worker failed
    #[error("Worker error: {0}")]
    WorkerError(String),
    /// Response does not match what the job produces
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl std::convert::From<CrossbarError> for ArC1Error {
    fn from(error: CrossbarError) -> Self {
        match error {
            CrossbarError::AddressOutOfBounds { word, bit, words, bits } => {
                ArC1Error::AddressOutOfBounds { word, bit, words, bits }
            },
            CrossbarError::Model(err) => ArC1Error::ModelError(err)
        }
    }
}

impl std::convert::From<ProtocolError> for ArC1Error {
    fn from(error: ProtocolError) -> Self {
        match error {
            ProtocolError::Address(err) => ArC1Error::from(err),
            err => ArC1Error::ProtocolFraming(err)
        }
    }
}

impl<T> std::convert::From<PoisonError<T>> for ArC1Error {
    fn from(error: PoisonError<T>) -> Self {
        ArC1Error::WorkerError(error.to_string())
    }
}

impl<T> std::convert::From<SendError<T>> for ArC1Error {
    fn from(_: SendError<T>) -> Self {
        ArC1Error::WorkerError("worker is not running".to_string())
    }
}


/// Common interface of real and simulated ArC ONE instruments
///
/// Implementors only need to provide the raw transport (`write_b`,
/// `read_floats` and `readline`); everything else is built on top of the
/// ArC ONE line protocol and works identically on both.
///
/// ```no_run
/// use libarc1::{HardwareConfig, Interface, SimulationConfig, VirtualArC};
///
/// let mut arc = VirtualArC::new(SimulationConfig::default()).unwrap();
/// arc.initialise(&HardwareConfig::default()).unwrap();
///
/// let res = arc.read_one(5, 7).unwrap();
/// println!("W5B7: {} Ω", res);
/// ```
pub trait Interface {

    /// Write raw protocol data. Tokens are newline delimited; partial
    /// tokens may be split across calls.
    fn write_b(&mut self, data: &str) -> Result<(), ArC1Error>;

    /// Read `n` values of a numeric response. Blocks until they are
    /// available.
    fn read_floats(&mut self, n: usize) -> Result<Vec<f32>, ArC1Error>;

    /// Read a text response
    fn readline(&mut self) -> Result<String, ArC1Error>;

    /// Reset the instrument and transfer the complete hardware
    /// configuration. The instrument must confirm with `1`.
    fn initialise(&mut self, config: &HardwareConfig) -> Result<(), ArC1Error> {
        self.reset()?;
        self.submit(&JobParams::Init(config.clone()), &[])?;

        let line = self.readline()?;
        if line.trim() != "1" {
            return Err(ArC1Error::InitConfirmationFailure(
                format!("unexpected response {:?}", line.trim())));
        }

        info!("Instrument initialised for a {}×{} array", config.words, config.bits);
        Ok(())
    }

    /// Send the reset job (`00`)
    fn reset(&mut self) -> Result<(), ArC1Error> {
        self.submit(&JobParams::Reset, &[])
    }

    /// Write a complete job, devices included
    fn submit(&mut self, job: &JobParams, devices: &[(usize, usize)]) -> Result<(), ArC1Error> {
        let mut data = String::new();
        for tok in job.to_tokens(devices) {
            data.push_str(&tok);
            data.push('\n');
        }
        debug!("Submitting job {}", job.kind().code());
        self.write_b(&data)
    }

    /// Update the read-out settings without a full initialisation
    fn update_read(&mut self, config: &HardwareConfig) -> Result<(), ArC1Error> {
        self.submit(&JobParams::UpdateRead { read_mode: config.read_mode,
            vread: config.vread }, &[])
    }

    /// Update averaging cycles and the sneak path scheme
    fn update_hw(&mut self, config: &HardwareConfig) -> Result<(), ArC1Error> {
        self.submit(&JobParams::UpdateHardware { cycles: config.cycles,
            sneak_path: config.sneak_path }, &[])
    }

    /// Connect a device to the external BNCs
    fn queue_select(&mut self, word: usize, bit: usize) -> Result<(), ArC1Error> {
        self.submit(&JobParams::Select, &[(word, bit)])
    }

    /// Read a single device
    fn read_one(&mut self, word: usize, bit: usize) -> Result<f32, ArC1Error> {
        self.submit(&JobParams::ReadSingle, &[(word, bit)])?;
        Ok(self.read_floats(1)?[0])
    }

    /// Pulse a device and read it back
    fn pulseread_one(&mut self, word: usize, bit: usize, amplitude: f64, pw: f64)
        -> Result<f32, ArC1Error> {
        self.submit(&JobParams::PulseRead(PulseParams { word, bit, amplitude, pw }), &[])?;
        Ok(self.read_floats(1)?[0])
    }

    /// Read every device of a `words × bits` array, word-major
    fn read_all(&mut self, words: usize, bits: usize) -> Result<Vec<f32>, ArC1Error> {
        self.submit(&JobParams::ReadAll(ReadAllParams { mode: ReadAllMode::All,
            words, bits }), &[])?;
        self.read_floats(words * bits)
    }

    /// Read the devices of a custom array, word-major
    fn read_masked(&mut self, mask: &DeviceMask) -> Result<Vec<f32>, ArC1Error> {
        let devices: Vec<(usize, usize)> = mask.iter().collect();
        self.submit(&JobParams::ReadAll(ReadAllParams { mode: ReadAllMode::Custom,
            words: mask.words(), bits: mask.bits() }), &devices)?;
        self.read_floats(devices.len())
    }

    /// Collect the `(resistance, amplitude, pulse width)` triples of one
    /// device of a multi-sample job, up to and excluding the sentinel.
    fn read_triples(&mut self) -> Result<Vec<(f32, f32, f32)>, ArC1Error> {
        let mut res = Vec::new();
        loop {
            let vals = self.read_floats(3)?;
            let triple = (vals[0], vals[1], vals[2]);
            if triple == (0.0, 0.0, 0.0) {
                return Ok(res);
            }
            res.push(triple);
        }
    }
}


/// List serial ports an ArC ONE may be connected to
pub fn find_ports() -> Result<Vec<String>, ArC1Error> {
    let ports = serialport::available_ports()?;
    Ok(ports.into_iter().map(|p| p.port_name).collect())
}


/// Byte stream an [`ArC1`] talks over
///
/// Implemented for every serial port; anything else that can report how
/// many bytes are waiting can stand in for one.
pub trait Transport: Read + Write + Send {
    /// Number of bytes that can be read without blocking
    fn bytes_to_read(&self) -> Result<u32, ArC1Error>;
}

impl Transport for Box<dyn SerialPort> {
    fn bytes_to_read(&self) -> Result<u32, ArC1Error> {
        Ok(SerialPort::bytes_to_read(&**self)?)
    }
}


/// A physical ArC ONE on a serial port
pub struct ArC1 {
    port: Option<Box<dyn Transport>>,
    config: SerialConfig,
}

impl ArC1 {

    /// Open the serial port described by `config` (8N1, no flow control)
    pub fn open(config: SerialConfig) -> Result<ArC1, ArC1Error> {
        let port = serialport::new(config.port.as_str(), config.baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(config.port_timeout)
            .open()?;

        info!("Opened {} at {} baud", config.port, config.baud_rate);

        Ok(ArC1::with_transport(Box::new(port), config))
    }

    /// Talk to an instrument over an already open `transport`. Only the
    /// timeouts of `config` are used.
    pub fn with_transport(transport: Box<dyn Transport>, config: SerialConfig) -> ArC1 {
        ArC1 { port: Some(transport), config }
    }

    /// Close the connection. Every subsequent operation fails with
    /// [`ArC1Error::NotConnected`].
    pub fn close(&mut self) {
        if self.port.take().is_some() {
            info!("Closed {}", self.config.port);
        }
    }

    pub fn is_open(&self) -> bool {
        self.port.is_some()
    }

    fn port(&mut self) -> Result<&mut Box<dyn Transport>, ArC1Error> {
        self.port.as_mut().ok_or(ArC1Error::NotConnected)
    }

    /// Block until at least `n` bytes are waiting on the port. The port
    /// is polled at exponentially increasing intervals.
    fn wait_for_bytes(&mut self, n: usize, timeout: Option<Duration>) -> Result<(), ArC1Error> {

        let start = Instant::now();
        let mut interval = MIN_POLL;

        loop {
            let available = self.port()?.bytes_to_read()? as usize;
            if available >= n {
                return Ok(());
            }

            if let Some(t) = timeout {
                if start.elapsed() >= t {
                    warn!("Timed out waiting for {} bytes ({} available)", n, available);
                    return Err(ArC1Error::InstrumentTimeout(t));
                }
            }

            spin_sleep::sleep(interval);
            interval = (interval * 2).min(MAX_POLL);
        }
    }

    fn readline_within(&mut self, timeout: Option<Duration>) -> Result<String, ArC1Error> {

        let start = Instant::now();
        let mut line: Vec<u8> = Vec::new();
        let mut byte = [0u8; 1];

        loop {
            match self.port()?.read(&mut byte) {
                Ok(1) => {
                    if byte[0] == b'\n' {
                        break;
                    }
                    line.push(byte[0]);
                },
                Ok(_) => {},
                Err(err) if err.kind() == ErrorKind::TimedOut => {},
                Err(err) => return Err(err.into())
            }

            if let Some(t) = timeout {
                if start.elapsed() >= t {
                    return Err(ArC1Error::InstrumentTimeout(t));
                }
            }
        }

        let line = String::from_utf8_lossy(&line).trim().to_string();
        tokdbg!(">>", &line);
        Ok(line)
    }

    fn handshake(&mut self, config: &HardwareConfig) -> Result<(), ArC1Error> {
        self.reset()?;
        self.submit(&JobParams::Init(config.clone()), &[])?;

        let line = self.readline_within(Some(self.config.init_timeout))?;
        if line != "1" {
            return Err(ArC1Error::InitConfirmationFailure(
                format!("unexpected response {:?}", line)));
        }
        Ok(())
    }
}

impl Interface for ArC1 {

    fn write_b(&mut self, data: &str) -> Result<(), ArC1Error> {
        tokdbg!("<<", data);
        let port = self.port()?;
        port.write_all(data.as_bytes())?;
        port.flush()?;
        Ok(())
    }

    fn read_floats(&mut self, n: usize) -> Result<Vec<f32>, ArC1Error> {
        self.wait_for_bytes(4*n, self.config.read_timeout)?;

        let mut buf = vec![0u8; 4*n];
        self.port()?.read_exact(&mut buf)?;

        let vals: Vec<f32> = buf.chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        tokdbg!(">>", &vals);

        Ok(vals)
    }

    fn readline(&mut self) -> Result<String, ArC1Error> {
        self.readline_within(self.config.read_timeout)
    }

    /// Same as [`Interface::initialise`] with the deadline of
    /// [`SerialConfig::init_timeout`]. Any failure closes the port.
    fn initialise(&mut self, config: &HardwareConfig) -> Result<(), ArC1Error> {
        match self.handshake(config) {
            Ok(()) => {
                info!("Instrument initialised for a {}×{} array", config.words, config.bits);
                Ok(())
            },
            Err(err) => {
                self.close();
                match err {
                    err @ ArC1Error::InitConfirmationFailure(_) => Err(err),
                    err => Err(ArC1Error::InitConfirmationFailure(err.to_string()))
                }
            }
        }
    }
}

impl Drop for ArC1 {
    fn drop(&mut self) {
        self.close();
    }
}
