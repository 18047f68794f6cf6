//! Line protocol state machine
//!
//! The [`Dispatcher`] consumes the newline-delimited tokens a client
//! writes to the instrument, one at a time, and decides when a job has
//! been fully described. It is table driven: the layout of every job
//! comes from its [`JobDescriptor`]. Whenever an executor must run the
//! dispatcher hands back a [`Dispatch`] and parks in
//! [`DispatcherState::Executing`] until its owner calls
//! [`Dispatcher::complete`].

use std::mem;
use std::sync::Arc;
use log::{debug, warn, error};
use thiserror::Error;

use crate::config::{HardwareConfig, ReadAllMode};
use crate::crossbar::CrossbarError;
use crate::jobs::{self, Addressing, JobDescriptor, JobKind, JobParams, Token};
use crate::mask::DeviceMask;


/// Error type for protocol handling
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    /// A parameter token could not be decoded. The job is discarded
    /// and the dispatcher waits for the next job code.
    #[error("Malformed {field} for job {job}: {token:?}")]
    Framing { job: &'static str, field: &'static str, token: String },
    /// Token accounting has been lost; nothing more is accepted until
    /// the dispatcher is reset.
    #[error("Protocol desynchronised: {0}")]
    Desynchronised(String),
    /// A token arrived while an executor is still being handed off
    #[error("Job still executing")]
    Busy,
    /// Device address outside the active array
    #[error("{0}")]
    Address(#[from] CrossbarError),
}


/// Progress of the current job
#[derive(Clone, Debug, PartialEq)]
pub enum DispatcherState {
    AwaitingJobCode,
    AccumulatingJobParams {
        job: JobKind,
        collected: Vec<Token>,
    },
    AccumulatingDeviceAddress {
        job: JobKind,
        params: Arc<JobParams>,
        /// Devices still to be addressed; `None` while the device count
        /// of a custom read-all is outstanding
        remaining: Option<usize>,
        /// Word of a half-received address
        word: Option<usize>,
        /// Addresses gathered for a single run (custom read-all)
        collected: Vec<(usize, usize)>,
        /// Set once an address has been rejected; the rest of the job
        /// is consumed but never executed
        discard: bool,
    },
    Executing {
        job: JobKind,
        params: Arc<JobParams>,
        remaining: usize,
    },
}


/// A fully described executor run
#[derive(Clone, Debug, PartialEq)]
pub struct Dispatch {
    pub params: Arc<JobParams>,
    /// Devices, in execution order. Empty for jobs that address no
    /// device.
    pub devices: Vec<(usize, usize)>,
}

impl Dispatch {
    pub fn kind(&self) -> JobKind {
        self.params.kind()
    }
}


/// Table driven job dispatcher
pub struct Dispatcher {
    state: DispatcherState,
    config: HardwareConfig,
    poisoned: Option<String>,
}

impl Dispatcher {

    /// Create a new dispatcher validating addresses against `config`
    pub fn new(config: HardwareConfig) -> Self {
        Dispatcher { state: DispatcherState::AwaitingJobCode, config, poisoned: None }
    }

    pub fn state(&self) -> &DispatcherState {
        &self.state
    }

    pub fn config(&self) -> &HardwareConfig {
        &self.config
    }

    /// Replace the active array configuration
    pub fn set_config(&mut self, config: HardwareConfig) {
        self.config = config;
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned.is_some()
    }

    /// Drop any partial job and clear a desynchronised condition
    pub fn reset(&mut self) {
        self.state = DispatcherState::AwaitingJobCode;
        self.poisoned = None;
    }

    /// Acknowledge that the last [`Dispatch`] has been handed off. The
    /// dispatcher moves on to the next device of the job, if any.
    pub fn complete(&mut self) {
        self.state = match mem::replace(&mut self.state, DispatcherState::AwaitingJobCode) {
            DispatcherState::Executing { job, params, remaining } if remaining > 0 => {
                DispatcherState::AccumulatingDeviceAddress {
                    job, params, remaining: Some(remaining), word: None,
                    collected: Vec::new(), discard: false
                }
            },
            DispatcherState::Executing { .. } => DispatcherState::AwaitingJobCode,
            other => other
        };
    }

    /// Consume one raw token.
    pub fn feed(&mut self, raw: &str) -> Result<Option<Dispatch>, ProtocolError> {

        if let Some(reason) = &self.poisoned {
            return Err(ProtocolError::Desynchronised(reason.clone()));
        }

        tokdbg!("<<", raw);

        match mem::replace(&mut self.state, DispatcherState::AwaitingJobCode) {
            DispatcherState::AwaitingJobCode => {
                let code = raw.trim_end_matches(|c: char| c == '\r' || c == '\n');
                match jobs::descriptor(code) {
                    Some(desc) => self.begin(desc),
                    None => {
                        debug!("Ignoring unknown job code {:?}", code);
                        Ok(None)
                    }
                }
            },
            DispatcherState::AccumulatingJobParams { job, mut collected } => {
                collected.push(Token::parse(raw));
                let desc = job.descriptor();
                if collected.len() < desc.arity() {
                    self.state = DispatcherState::AccumulatingJobParams { job, collected };
                    Ok(None)
                } else {
                    self.params_complete(desc, collected)
                }
            },
            DispatcherState::AccumulatingDeviceAddress { job, params, remaining, word,
                collected, discard } => {
                self.address_token(raw, job, params, remaining, word, collected, discard)
            },
            executing @ DispatcherState::Executing { .. } => {
                self.state = executing;
                Err(ProtocolError::Busy)
            }
        }
    }

    fn begin(&mut self, desc: &'static JobDescriptor) -> Result<Option<Dispatch>, ProtocolError> {
        debug!("Job {} ({:?}) started", desc.code, desc.kind);
        if desc.arity() == 0 {
            return self.params_complete(desc, Vec::new());
        }
        self.state = DispatcherState::AccumulatingJobParams {
            job: desc.kind,
            collected: Vec::with_capacity(desc.arity())
        };
        Ok(None)
    }

    fn params_complete(&mut self, desc: &'static JobDescriptor, collected: Vec<Token>)
        -> Result<Option<Dispatch>, ProtocolError> {

        let params = JobParams::decode(desc, &collected).map_err(|err| {
            warn!("Discarding job {}: {}", desc.code, err);
            err
        })?;

        match desc.devices {
            Addressing::None => self.execute(Arc::new(params), vec![], 0),
            Addressing::Embedded => {
                let device = match &params {
                    JobParams::PulseRead(p) => (p.word, p.bit),
                    _ => return Err(self.poison(format!("job {} has no embedded address", desc.code)))
                };
                self.check(device, (self.config.words, self.config.bits))?;
                self.execute(Arc::new(params), vec![device], 0)
            },
            Addressing::Single => {
                self.await_devices(desc.kind, Arc::new(params), Some(1));
                Ok(None)
            },
            Addressing::Counted => {
                let count = match collected.last().and_then(Token::as_usize) {
                    Some(c) => c,
                    None => {
                        let tok = collected.last().map(|t| t.to_string()).unwrap_or_default();
                        return Err(self.poison(format!("invalid device count {:?} for job {}",
                            tok, desc.code)));
                    }
                };
                if count > 0 {
                    self.await_devices(desc.kind, Arc::new(params), Some(count));
                }
                Ok(None)
            },
            Addressing::Masked => {
                let (mode, words, bits) = match &params {
                    JobParams::ReadAll(p) => (p.mode, p.words, p.bits),
                    _ => return Err(self.poison(format!("job {} has no array selection", desc.code)))
                };
                self.check((words, bits), (self.config.words, self.config.bits))?;
                match mode {
                    ReadAllMode::All => {
                        let devices = DeviceMask::all(words, bits).iter().collect();
                        self.execute(Arc::new(params), devices, 0)
                    },
                    ReadAllMode::Custom => {
                        self.await_devices(desc.kind, Arc::new(params), None);
                        Ok(None)
                    }
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn address_token(&mut self, raw: &str, job: JobKind, params: Arc<JobParams>,
        remaining: Option<usize>, word: Option<usize>, mut collected: Vec<(usize, usize)>,
        discard: bool) -> Result<Option<Dispatch>, ProtocolError> {

        let val = match Token::parse(raw).as_usize() {
            Some(v) => v,
            None => return Err(self.poison(format!("invalid address token {:?} for job {}",
                raw.trim(), job.code())))
        };

        let remaining = match remaining {
            Some(r) => r,
            None => {
                // device count of a custom read-all; never more than the
                // selectable crosspoints
                let limit = match &*params {
                    JobParams::ReadAll(p) => p.words * p.bits,
                    _ => 0
                };
                if val > limit {
                    return Err(self.poison(format!("device count {} exceeds the {} \
                        crosspoints of job {}", val, limit, job.code())));
                }
                if val > 0 {
                    self.state = DispatcherState::AccumulatingDeviceAddress {
                        job, params, remaining: Some(val), word: None,
                        collected: Vec::with_capacity(val), discard
                    };
                }
                return Ok(None);
            }
        };

        let word = match word {
            Some(w) => w,
            None => {
                self.state = DispatcherState::AccumulatingDeviceAddress {
                    job, params, remaining: Some(remaining), word: Some(val), collected, discard
                };
                return Ok(None);
            }
        };

        let device = (word, val);
        let remaining = remaining - 1;

        if discard {
            if remaining > 0 {
                self.state = DispatcherState::AccumulatingDeviceAddress {
                    job, params, remaining: Some(remaining), word: None, collected, discard
                };
            }
            return Ok(None);
        }

        let bounds = match &*params {
            JobParams::ReadAll(p) => (p.words, p.bits),
            _ => (self.config.words, self.config.bits)
        };

        if let Err(err) = self.check(device, bounds) {
            warn!("Aborting job {}: {}", job.code(), err);
            if remaining > 0 {
                self.state = DispatcherState::AccumulatingDeviceAddress {
                    job, params, remaining: Some(remaining), word: None,
                    collected: Vec::new(), discard: true
                };
            }
            return Err(err);
        }

        if job.descriptor().devices == Addressing::Masked {
            // every selected crosspoint yields exactly one value
            if collected.contains(&device) {
                let err = ProtocolError::Framing { job: job.code(), field: "address",
                    token: format!("W{}B{}", device.0, device.1) };
                warn!("Aborting job {}: {}", job.code(), err);
                if remaining > 0 {
                    self.state = DispatcherState::AccumulatingDeviceAddress {
                        job, params, remaining: Some(remaining), word: None,
                        collected: Vec::new(), discard: true
                    };
                }
                return Err(err);
            }
            collected.push(device);
            if remaining > 0 {
                self.state = DispatcherState::AccumulatingDeviceAddress {
                    job, params, remaining: Some(remaining), word: None, collected, discard
                };
                return Ok(None);
            }

            let mut mask = DeviceMask::new(bounds.0, bounds.1);
            for (w, b) in collected {
                mask.set(w, b, true)?;
            }
            return self.execute(params, mask.iter().collect(), 0);
        }

        self.execute(params, vec![device], remaining)
    }

    fn await_devices(&mut self, job: JobKind, params: Arc<JobParams>, remaining: Option<usize>) {
        self.state = DispatcherState::AccumulatingDeviceAddress {
            job, params, remaining, word: None, collected: Vec::new(), discard: false
        };
    }

    fn execute(&mut self, params: Arc<JobParams>, devices: Vec<(usize, usize)>, remaining: usize)
        -> Result<Option<Dispatch>, ProtocolError> {

        let job = params.kind();
        debug!("Dispatching job {} over {} device(s)", job.code(), devices.len());
        self.state = DispatcherState::Executing { job, params: params.clone(), remaining };

        Ok(Some(Dispatch { params, devices }))
    }

    fn check(&self, (word, bit): (usize, usize), (words, bits): (usize, usize))
        -> Result<(), ProtocolError> {
        if word < 1 || word > words || bit < 1 || bit > bits {
            return Err(CrossbarError::AddressOutOfBounds { word, bit, words, bits }.into());
        }
        Ok(())
    }

    fn poison(&mut self, reason: String) -> ProtocolError {
        error!("Protocol desynchronised: {}", reason);
        self.state = DispatcherState::AwaitingJobCode;
        self.poisoned = Some(reason.clone());
        ProtocolError::Desynchronised(reason)
    }
}
