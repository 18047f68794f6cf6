//! Simulated ArC ONE
//!
//! [`VirtualArC`] speaks the ArC ONE line protocol over an in-memory
//! channel instead of a serial port. Written tokens go through a
//! [`Dispatcher`]; complete jobs are queued to a worker thread that runs
//! the executors against a simulated [`Crossbar`] and fills an
//! [`OutputBuffer`] which the client drains with
//! [`Interface::read_floats`] and [`Interface::readline`].

use std::sync::{Arc, Mutex, PoisonError};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::thread::{self, JoinHandle};
use log::{debug, error, warn};
use rand::SeedableRng;
use rand::rngs::StdRng;

use crate::buffer::{Output, OutputBuffer};
use crate::config::{HardwareConfig, SimulationConfig};
use crate::crossbar::Crossbar;
use crate::device::{DeviceModel, ParametricDevice};
use crate::dispatch::{Dispatch, Dispatcher};
use crate::executors::{self, Cancellation, HistoryEntry, JobContext};
use crate::instrument::{ArC1Error, Interface};
use crate::jobs::JobParams;


type HistorySink = Arc<Mutex<Option<Sender<HistoryEntry>>>>;

// A dispatch and the cancellation generation it was queued under
type Queued = (Dispatch, usize);

/// Apply a configuration job to `config`. Returns the outcome of an
/// initialisation, `None` for every other job.
fn apply_settings(config: &mut HardwareConfig, params: &JobParams, sim: &SimulationConfig)
    -> Option<bool> {

    match params {
        JobParams::Init(new) => {
            let fits = new.words >= 1 && new.bits >= 1 &&
                new.words <= sim.words && new.bits <= sim.bits;
            if fits {
                *config = new.clone();
            }
            Some(fits)
        },
        JobParams::UpdateRead { read_mode, vread } => {
            config.read_mode = *read_mode;
            config.vread = *vread;
            None
        },
        JobParams::UpdateHardware { cycles, sneak_path } => {
            config.cycles = *cycles;
            config.sneak_path = *sneak_path;
            None
        },
        _ => None
    }
}


/// A simulated ArC ONE
pub struct VirtualArC<M: DeviceModel = ParametricDevice> {
    dispatcher: Dispatcher,
    crossbar: Arc<Mutex<Crossbar<M>>>,
    output: Arc<OutputBuffer>,
    sim: SimulationConfig,
    cancel: Cancellation,
    history: HistorySink,
    jobs: Option<Sender<Queued>>,
    worker: Option<JoinHandle<()>>,
    // incomplete token from the last write
    partial: String,
}

impl VirtualArC<ParametricDevice> {

    /// Create a new virtual instrument populated with the default
    /// parametric devices.
    pub fn new(sim: SimulationConfig) -> Result<Self, ArC1Error> {
        VirtualArC::with_device(sim, &ParametricDevice::default())
    }
}

impl<M: DeviceModel + Clone + 'static> VirtualArC<M> {

    /// Create a new virtual instrument populated with clones of
    /// `prototype`.
    pub fn with_device(sim: SimulationConfig, prototype: &M) -> Result<Self, ArC1Error> {

        let rng = match sim.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy()
        };

        let crossbar = Crossbar::new(sim.words, sim.bits, prototype, sim.init_band.clone(),
            sim.read_noise, rng)?;
        let crossbar = Arc::new(Mutex::new(crossbar));
        let output = Arc::new(OutputBuffer::new());
        let cancel = Cancellation::new();
        let history: HistorySink = Arc::new(Mutex::new(None));
        let config = HardwareConfig::default().with_size(sim.words, sim.bits);

        let (sender, receiver) = channel();

        let worker = {
            let crossbar = crossbar.clone();
            let output = output.clone();
            let cancel = cancel.clone();
            let history = history.clone();
            let sim = sim.clone();
            let config = config.clone();

            thread::Builder::new()
                .name("virtualarc".to_string())
                .spawn(move || {
                    worker(receiver, crossbar, output, cancel, history, sim, config)
                })?
        };

        Ok(VirtualArC {
            dispatcher: Dispatcher::new(config),
            crossbar,
            output,
            sim,
            cancel,
            history,
            jobs: Some(sender),
            worker: Some(worker),
            partial: String::new(),
        })
    }

    /// The simulated array
    pub fn crossbar(&self) -> Arc<Mutex<Crossbar<M>>> {
        self.crossbar.clone()
    }

    /// Active hardware configuration as seen by the protocol engine
    pub fn config(&self) -> &HardwareConfig {
        self.dispatcher.config()
    }

    pub fn simulation(&self) -> &SimulationConfig {
        &self.sim
    }

    /// Subscribe to the measurement history. Only one subscriber is
    /// active at a time; a new call replaces the previous one.
    pub fn history(&self) -> Receiver<HistoryEntry> {
        let (tx, rx) = channel();
        let mut sink = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        *sink = Some(tx);
        rx
    }

    /// Ask every queued or running multi-sample job to stop. Each
    /// device still gets its end-of-stream marker. Jobs written after
    /// this call are not affected.
    pub fn cancel(&self) {
        debug!("Cancellation requested");
        self.cancel.request();
    }

    /// Drop any partially written job and recover from a
    /// desynchronised stream
    pub fn resync(&mut self) {
        self.partial.clear();
        self.dispatcher.reset();
    }

    /// `true` if a job is queued or running
    pub fn busy(&self) -> bool {
        self.output.in_flight() > 0
    }

    fn handle_token(&mut self, tok: &str) -> Result<(), ArC1Error> {

        let dispatch = match self.dispatcher.feed(tok)? {
            Some(d) => d,
            None => return Ok(())
        };

        // settings must be visible to the next job's address checks
        let mut config = self.dispatcher.config().clone();
        if let Some(false) = apply_settings(&mut config, &dispatch.params, &self.sim) {
            warn!("Requested array does not fit the {}×{} simulation",
                self.sim.words, self.sim.bits);
        }
        self.dispatcher.set_config(config);

        self.output.begin();
        let sent = match &self.jobs {
            Some(jobs) => jobs.send((dispatch, self.cancel.generation()))
                .map_err(ArC1Error::from),
            None => Err(ArC1Error::NotConnected)
        };
        self.dispatcher.complete();

        if let Err(err) = sent {
            self.output.finish();
            return Err(err);
        }

        Ok(())
    }

    fn pop(&self) -> Result<Output, ArC1Error> {
        self.output.pop(self.sim.read_timeout)
    }
}

fn worker<M: DeviceModel>(receiver: Receiver<Queued>, crossbar: Arc<Mutex<Crossbar<M>>>,
    output: Arc<OutputBuffer>, cancel: Cancellation, history: HistorySink,
    sim: SimulationConfig, mut config: HardwareConfig) {

    for (dispatch, generation) in receiver {
        match apply_settings(&mut config, &dispatch.params, &sim) {
            Some(true) => output.push_line("1"),
            Some(false) => output.push_line("0"),
            None => {}
        }

        let res = run_dispatch(&dispatch, generation, &crossbar, &output, &cancel, &history,
            &sim, &config);
        if let Err(err) = res {
            error!("Job {} failed: {}", dispatch.kind().code(), err);
            output.fail(err);
        }

        output.finish();
    }

    debug!("Worker exiting");
}

#[allow(clippy::too_many_arguments)]
fn run_dispatch<M: DeviceModel>(dispatch: &Dispatch, generation: usize,
    crossbar: &Mutex<Crossbar<M>>, output: &OutputBuffer, cancel: &Cancellation,
    history: &HistorySink, sim: &SimulationConfig, config: &HardwareConfig)
    -> Result<(), ArC1Error> {

    if dispatch.devices.is_empty() {
        return Ok(());
    }

    let sink = history.lock()?.clone();
    let mut crossbar = crossbar.lock()?;

    let mut ctx = JobContext {
        crossbar: &mut crossbar,
        output,
        config,
        sim,
        history: sink.as_ref(),
        cancel,
        generation,
    };

    executors::run(&mut ctx, dispatch)?;
    Ok(())
}

impl<M: DeviceModel + Clone + 'static> Interface for VirtualArC<M> {

    fn write_b(&mut self, data: &str) -> Result<(), ArC1Error> {

        self.partial.push_str(data);

        // only complete tokens are consumed
        let complete = match self.partial.rfind('\n') {
            Some(idx) => {
                let rest = self.partial.split_off(idx + 1);
                std::mem::replace(&mut self.partial, rest)
            },
            None => return Ok(())
        };

        // keep going after a failure so that the rest of the job is
        // accounted for; report the first error
        let mut first_err: Option<ArC1Error> = None;

        for tok in complete.split('\n').filter(|t| !t.is_empty()) {
            let tok = tok.trim_end_matches('\r');
            if let Err(err) = self.handle_token(tok) {
                if first_err.is_none() {
                    first_err = Some(err);
                }
            }
        }

        match first_err {
            Some(err) => Err(err),
            None => Ok(())
        }
    }

    fn read_floats(&mut self, n: usize) -> Result<Vec<f32>, ArC1Error> {
        let mut res = Vec::with_capacity(n);
        for _ in 0..n {
            match self.pop()? {
                Output::Float(val) => res.push(val),
                Output::Line(line) => {
                    return Err(ArC1Error::InvalidResponse(
                        format!("expected a value, got line {:?}", line)));
                }
            }
        }
        Ok(res)
    }

    fn readline(&mut self) -> Result<String, ArC1Error> {
        match self.pop()? {
            Output::Line(line) => Ok(line),
            Output::Float(val) => Err(ArC1Error::InvalidResponse(
                format!("expected a line, got value {}", val)))
        }
    }

    /// Resynchronises the protocol engine before resetting the
    /// instrument.
    fn reset(&mut self) -> Result<(), ArC1Error> {
        self.resync();
        self.submit(&JobParams::Reset, &[])
    }
}

impl<M: DeviceModel> Drop for VirtualArC<M> {
    fn drop(&mut self) {
        // closing the queue stops the worker
        self.jobs.take();
        self.cancel.request();
        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                error!("Worker panicked");
            }
        }
    }
}
