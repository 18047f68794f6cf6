//! Measurement routines of the virtual instrument
//!
//! Every executor works on one [`Dispatch`] at a time and writes its
//! results to the [`OutputBuffer`] in exactly the framing ArC ONE uses
//! on the wire. Single-shot jobs emit one float per device. Multi-sample
//! jobs emit `(resistance, amplitude, pulse width)` triples and finish
//! every device with the sentinel triple `(0, 0, 0)`.
//!
//! Interpulse delays and current compliance are enforced by the ArC ONE
//! firmware only; they are parsed but not simulated.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::Sender;
use log::{debug, trace};

use crate::buffer::OutputBuffer;
use crate::config::{CurveSpan, HardwareConfig, ReadMode, SimulationConfig};
use crate::crossbar::{Crossbar, CrossbarError};
use crate::device::DeviceModel;
use crate::dispatch::Dispatch;
use crate::jobs::{CurveTracerParams, EnduranceParams, FormFinderParams, JobParams};
use crate::jobs::{PulseParams, SwitchSeekerParams};

// Slack for accumulated float error when comparing against limits
const EPS: f64 = 1e-9;


/// A single measurement as recorded in the session history
#[derive(Clone, Debug, PartialEq)]
pub struct HistoryEntry {
    pub word: usize,
    pub bit: usize,
    pub resistance: f64,
    pub amplitude: f64,
    pub pulse_width: f64,
    /// `S R` for reads, `P` for pulses, or a multi-sample job tag with
    /// an `_s`, `_i` or `_e` suffix
    pub tag: String,
    pub read_mode: ReadMode,
    pub read_voltage: f64,
}


/// Cancellation requests shared between an instrument and its runs
///
/// Every request advances a generation counter. A job remembers the
/// generation current when it was queued and stops as soon as it
/// changes, so a request reaches every job queued or running at that
/// moment but none queued afterwards.
#[derive(Clone, Debug, Default)]
pub struct Cancellation {
    generation: Arc<AtomicUsize>,
}

impl Cancellation {

    pub fn new() -> Self {
        Cancellation::default()
    }

    /// Stop everything queued so far
    pub fn request(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Generation to tag a newly queued job with
    pub fn generation(&self) -> usize {
        self.generation.load(Ordering::SeqCst)
    }

    /// `true` if a request was made after `generation` was taken
    pub fn is_requested(&self, generation: usize) -> bool {
        self.generation() != generation
    }
}


/// Everything an executor needs to run
pub struct JobContext<'a, M: DeviceModel> {
    pub crossbar: &'a mut Crossbar<M>,
    pub output: &'a OutputBuffer,
    pub config: &'a HardwareConfig,
    pub sim: &'a SimulationConfig,
    pub history: Option<&'a Sender<HistoryEntry>>,
    pub cancel: &'a Cancellation,
    /// Cancellation generation the job was queued under
    pub generation: usize,
}

impl<'a, M: DeviceModel> JobContext<'a, M> {

    fn record(&self, word: usize, bit: usize, resistance: f64, amplitude: f64,
        pulse_width: f64, tag: String) {

        if let Some(tx) = self.history {
            let entry = HistoryEntry {
                word, bit, resistance, amplitude, pulse_width, tag,
                read_mode: self.config.read_mode,
                read_voltage: self.config.vread,
            };
            // nobody listening is fine
            if tx.send(entry).is_err() {
                trace!("History receiver gone");
            }
        }
    }

    fn pulse(&mut self, word: usize, bit: usize, amplitude: f64, pw: f64) -> Result<(), CrossbarError> {
        let dt = self.sim.dt_for(pw);
        self.crossbar.pulse(word, bit, amplitude, pw, dt)
    }
}


/// Run an executor for a dispatched job. Configuration jobs have no
/// executor and are ignored.
pub fn run<M: DeviceModel>(ctx: &mut JobContext<'_, M>, dispatch: &Dispatch) -> Result<(), CrossbarError> {

    debug!("Executing job {} on {} device(s)", dispatch.kind().code(), dispatch.devices.len());

    match &*dispatch.params {
        JobParams::ReadSingle | JobParams::ReadAll(_) => read(ctx, &dispatch.devices),
        JobParams::PulseRead(p) => pulse_read(ctx, p),
        JobParams::Endurance(_) | JobParams::FormFinder(_) | JobParams::CurveTracer(_) |
            JobParams::SwitchSeekerFast(_) | JobParams::SwitchSeekerSlow(_) => {
            let tag = dispatch.kind().tag();
            for &(word, bit) in &dispatch.devices {
                multi_sample(ctx, word, bit, tag, &dispatch.params)?;
            }
            Ok(())
        },
        _ => Ok(())
    }
}

/// Read every device once, in the order given
fn read<M: DeviceModel>(ctx: &mut JobContext<'_, M>, devices: &[(usize, usize)]) -> Result<(), CrossbarError> {
    for &(word, bit) in devices {
        let res = ctx.crossbar.read(word, bit)?;
        ctx.output.push_float(res);
        ctx.record(word, bit, res, ctx.config.vread, 0.0, "S R".to_string());
    }
    Ok(())
}

fn pulse_read<M: DeviceModel>(ctx: &mut JobContext<'_, M>, p: &PulseParams) -> Result<(), CrossbarError> {
    ctx.pulse(p.word, p.bit, p.amplitude, p.pw)?;
    let res = ctx.crossbar.read(p.word, p.bit)?;
    ctx.output.push_float(res);
    ctx.record(p.word, p.bit, res, p.amplitude, p.pw, "P".to_string());
    Ok(())
}


/// Reasons a multi-sample run stops early
enum Halt {
    Cancelled,
    Failed(CrossbarError),
}

impl From<CrossbarError> for Halt {
    fn from(err: CrossbarError) -> Self {
        Halt::Failed(err)
    }
}


/// Assigns the `_s`/`_i`/`_e` suffixes. The last sample of a device is
/// only known once the run is over, so one entry is always held back.
struct Tagger {
    base: &'static str,
    count: usize,
    pending: Option<(f64, f64, f64)>,
}

impl Tagger {
    fn new(base: &'static str) -> Self {
        Tagger { base, count: 0, pending: None }
    }

    /// Push a new sample; returns the previous one with its final tag
    fn sample(&mut self, sample: (f64, f64, f64)) -> Option<((f64, f64, f64), String)> {
        let prev = self.pending.replace(sample).map(|s| {
            let suffix = if self.count == 1 { "s" } else { "i" };
            (s, format!("{}_{}", self.base, suffix))
        });
        self.count += 1;
        prev
    }

    fn finish(&mut self) -> Option<((f64, f64, f64), String)> {
        self.pending.take().map(|s| (s, format!("{}_e", self.base)))
    }
}


/// One device of a multi-sample job
struct Run<'r, 'a, M: DeviceModel> {
    ctx: &'r mut JobContext<'a, M>,
    word: usize,
    bit: usize,
    tagger: Tagger,
}

impl<'r, 'a, M: DeviceModel> Run<'r, 'a, M> {

    fn pulse(&mut self, amplitude: f64, pw: f64) -> Result<(), Halt> {
        if self.ctx.cancel.is_requested(self.ctx.generation) {
            return Err(Halt::Cancelled);
        }
        self.ctx.pulse(self.word, self.bit, amplitude, pw)?;
        Ok(())
    }

    fn read(&mut self) -> Result<f64, Halt> {
        Ok(self.ctx.crossbar.read(self.word, self.bit)?)
    }

    /// Average of `reads` consecutive reads; at least one read is done
    fn read_avg(&mut self, reads: u32) -> Result<f64, Halt> {
        let reads = reads.max(1);
        let mut acc = 0.0;
        for _ in 0..reads {
            acc += self.read()?;
        }
        Ok(acc / (reads as f64))
    }

    fn emit(&mut self, res: f64, amplitude: f64, pw: f64) {
        self.ctx.output.push_triple(res, amplitude, pw);
        if let Some(((r, v, t), tag)) = self.tagger.sample((res, amplitude, pw)) {
            self.ctx.record(self.word, self.bit, r, v, t, tag);
        }
    }

    fn finish(&mut self) {
        if let Some(((r, v, t), tag)) = self.tagger.finish() {
            self.ctx.record(self.word, self.bit, r, v, t, tag);
        }
        self.ctx.output.push_sentinel();
    }
}

fn multi_sample<M: DeviceModel>(ctx: &mut JobContext<'_, M>, word: usize, bit: usize,
    tag: &'static str, params: &JobParams) -> Result<(), CrossbarError> {

    let mut run = Run { ctx, word, bit, tagger: Tagger::new(tag) };

    let res = match params {
        JobParams::Endurance(p) => endurance(&mut run, p),
        JobParams::FormFinder(p) => form_finder(&mut run, p),
        JobParams::CurveTracer(p) => curve_tracer(&mut run, p),
        JobParams::SwitchSeekerFast(p) => switch_seeker(&mut run, p, false),
        JobParams::SwitchSeekerSlow(p) => switch_seeker(&mut run, p, true),
        _ => Ok(())
    };

    match res {
        Ok(()) => {},
        Err(Halt::Cancelled) => debug!("Job cancelled on W{}B{}", word, bit),
        Err(Halt::Failed(err)) => return Err(err)
    }

    run.finish();
    Ok(())
}


fn endurance<M: DeviceModel>(run: &mut Run<'_, '_, M>, p: &EnduranceParams) -> Result<(), Halt> {
    for _ in 0..p.cycles {
        for _ in 0..p.pos_pulses {
            run.pulse(p.pos_v, p.pos_pw)?;
            let res = run.read()?;
            run.emit(res, p.pos_v, p.pos_pw);
        }
        for _ in 0..p.neg_pulses {
            run.pulse(p.neg_v, p.neg_pw)?;
            let res = run.read()?;
            run.emit(res, p.neg_v, p.neg_pw);
        }
    }
    Ok(())
}


fn form_finder<M: DeviceModel>(run: &mut Run<'_, '_, M>, p: &FormFinderParams) -> Result<(), Halt> {

    let polarity = if p.vmin < 0.0 { -1.0 } else { 1.0 };
    let vmax = p.vmax.abs();
    let vstep = p.vstep.abs();
    let mut mag = p.vmin.abs();
    let mut pw = p.pwmin;

    let mstart = run.read_avg(1)?;

    loop {
        let v = polarity * mag;

        for _ in 0..p.nr_pulses {
            run.pulse(v, pw)?;
            let res = run.read()?;
            run.emit(res, v, pw);

            if res < p.rthr {
                return Ok(());
            }
            if p.rthr_p > 0.0 && ((res - mstart).abs() / mstart * 100.0) >= p.rthr_p {
                return Ok(());
            }
        }

        let next = if p.linear_pw() {
            pw + p.pwstep
        } else {
            pw * (1.0 + p.pwstep / 100.0)
        };

        // a step that does not widen the pulse moves on to the next voltage
        if next > p.pwmax * (1.0 + EPS) || next <= pw {
            pw = p.pwmin;
            if vstep == 0.0 {
                return Ok(());
            }
            mag += vstep;
            if mag > vmax + EPS {
                return Ok(());
            }
        } else {
            pw = next;
        }
    }
}


/// `start` up to `peak` inclusive and back down to `start` without
/// repeating the peak. All values share the sign of `sign`.
fn half_ramp(start: f64, peak: f64, step: f64, sign: f64) -> Vec<f64> {
    let start = start.abs();
    let peak = peak.abs();
    let step = step.abs();

    let mut up: Vec<f64> = Vec::new();
    if step == 0.0 || start >= peak {
        up.push(start);
    } else {
        let mut k = 0u32;
        loop {
            let v = start + (k as f64) * step;
            if v > peak + EPS {
                break;
            }
            up.push(v);
            k += 1;
        }
    }

    let mut down: Vec<f64> = up.iter().rev().skip(1).copied().collect();
    up.append(&mut down);
    up.iter().map(|v| sign * v).collect()
}

fn curve_tracer<M: DeviceModel>(run: &mut Run<'_, '_, M>, p: &CurveTracerParams) -> Result<(), Halt> {

    let pos = half_ramp(p.vstart, p.vpos, p.vstep, 1.0);
    let neg = half_ramp(p.vstart, p.vneg, p.vstep, -1.0);

    let sweep: Vec<f64> = match p.span {
        CurveSpan::PosThenNeg => pos.iter().chain(neg.iter()).copied().collect(),
        CurveSpan::NegThenPos => neg.iter().chain(pos.iter()).copied().collect(),
        CurveSpan::PosOnly => pos,
        CurveSpan::NegOnly => neg,
    };

    for _ in 0..p.cycles {
        for &v in &sweep {
            run.pulse(v, p.pwstep)?;
            let res = run.read()?;
            run.emit(res, v, p.pwstep);
        }
    }

    Ok(())
}


fn diverged(baseline: f64, res: f64, percent: f64) -> bool {
    (res - baseline).abs() / baseline * 100.0 > percent
}

/// `N` programming pulses (optionally read back), then the average of
/// `M` trailer reads
fn ss_basic_unit<M: DeviceModel>(run: &mut Run<'_, '_, M>, trailer: u32, pulses: u32,
    v: f64, pw: f64, check_read: bool) -> Result<f64, Halt> {

    for _ in 0..pulses {
        run.pulse(v, pw)?;
        if check_read {
            let res = run.read()?;
            run.emit(res, v, pw);
        }
    }

    let avg = run.read_avg(trailer)?;
    run.emit(avg, v, pw);
    Ok(avg)
}

/// Candidate magnitudes `Vmin, Vmin+Vstep, …, Vmax`
fn magnitudes(p: &SwitchSeekerParams) -> Vec<f64> {
    let vmin = p.vmin.abs();
    let vmax = p.vmax.abs();
    let vstep = p.vstep.abs();

    if vstep == 0.0 || vmin >= vmax {
        return vec![vmin];
    }

    let mut res = Vec::new();
    let mut k = 0u32;
    loop {
        let v = vmin + (k as f64) * vstep;
        if v > vmax + EPS {
            break;
        }
        res.push(v);
        k += 1;
    }
    res
}

/// Look for the polarity that switches the device. Fast mode tries both
/// polarities at every magnitude; slow mode sweeps all magnitudes at one
/// polarity before trying the other.
fn ss_polarity<M: DeviceModel>(run: &mut Run<'_, '_, M>, p: &SwitchSeekerParams,
    slow: bool) -> Result<Option<f64>, Halt> {

    let mags = magnitudes(p);
    let mut schedule: Vec<(f64, f64)> = Vec::with_capacity(2*mags.len());

    if slow {
        for pol in &[1.0, -1.0] {
            for m in &mags {
                schedule.push((*pol, *m));
            }
        }
    } else {
        for m in &mags {
            schedule.push((1.0, *m));
            schedule.push((-1.0, *m));
        }
    }

    for (pol, mag) in schedule {
        let baseline = run.read_avg(p.trailer_reads)?;
        let res = ss_basic_unit(run, p.trailer_reads, p.prog_pulses, pol*mag, p.pw,
            p.check_read)?;
        if diverged(baseline, res, p.tol) {
            return Ok(Some(pol));
        }
    }

    Ok(None)
}

fn switch_seeker<M: DeviceModel>(run: &mut Run<'_, '_, M>, p: &SwitchSeekerParams,
    slow: bool) -> Result<(), Halt> {

    let polarity = if p.skip_stage1 != 0 {
        (p.skip_stage1.signum()) as f64
    } else {
        match ss_polarity(run, p, slow)? {
            Some(pol) => pol,
            None => {
                debug!("No switching polarity found on W{}B{}", run.word, run.bit);
                return Ok(());
            }
        }
    };

    let mags = magnitudes(p);
    let mut pol = -polarity;

    for _ in 0..p.cycles {
        let baseline = run.read_avg(p.trailer_reads)?;
        for &mag in &mags {
            let res = ss_basic_unit(run, p.trailer_reads, p.prog_pulses, pol*mag, p.pw,
                p.check_read)?;
            if diverged(baseline, res, p.thr) {
                break;
            }
        }
        pol = -pol;
    }

    Ok(())
}


#[cfg(test)]
mod tests {

    use super::*;
    use std::sync::mpsc::{channel, Receiver};
    use crate::buffer::Output;
    use crate::config::CurveType;
    use crate::device::ParametricDevice;

    struct Bench {
        crossbar: Crossbar<ParametricDevice>,
        output: OutputBuffer,
        config: HardwareConfig,
        sim: SimulationConfig,
        tx: Sender<HistoryEntry>,
        rx: Receiver<HistoryEntry>,
        cancel: Cancellation,
        generation: usize,
    }

    impl Bench {
        fn new(proto: ParametricDevice) -> Self {
            let (tx, rx) = channel();
            Bench {
                crossbar: Crossbar::with_seed(8, 8, &proto, 10_000.0..10_000.0, 0.01, 3).unwrap(),
                output: OutputBuffer::new(),
                config: HardwareConfig::default().with_size(8, 8),
                sim: SimulationConfig::default().with_size(8, 8),
                tx, rx,
                cancel: Cancellation::new(),
                generation: 0,
            }
        }

        fn run(&mut self, params: JobParams, devices: Vec<(usize, usize)>) -> Vec<f32> {
            let dispatch = Dispatch { params: Arc::new(params), devices };
            let mut ctx = JobContext {
                crossbar: &mut self.crossbar,
                output: &self.output,
                config: &self.config,
                sim: &self.sim,
                history: Some(&self.tx),
                cancel: &self.cancel,
                generation: self.generation,
            };
            run(&mut ctx, &dispatch).unwrap();

            let mut res = Vec::new();
            while !self.output.is_empty() {
                match self.output.pop(None) {
                    Ok(Output::Float(f)) => res.push(f),
                    other => panic!("unexpected output {:?}", other)
                }
            }
            res
        }

        fn tags(&self) -> Vec<String> {
            self.rx.try_iter().map(|e| e.tag).collect()
        }
    }

    fn triples(floats: &[f32]) -> Vec<(f32, f32, f32)> {
        assert_eq!(floats.len() % 3, 0);
        floats.chunks(3).map(|c| (c[0], c[1], c[2])).collect()
    }

    fn is_sentinel(t: &(f32, f32, f32)) -> bool {
        *t == (0.0, 0.0, 0.0)
    }

    fn endurance_params(pos: u32, neg: u32, cycles: u32) -> JobParams {
        JobParams::Endurance(EnduranceParams {
            pos_v: 1.5, pos_pw: 1e-4, pos_cutoff: 0.0, neg_v: -1.5, neg_pw: 1e-4,
            neg_cutoff: 0.0, interpulse: 1e-3, pos_pulses: pos, neg_pulses: neg, cycles })
    }

    fn ss_params(skip: i32, cycles: u32) -> SwitchSeekerParams {
        SwitchSeekerParams {
            pw: 1e-4, vmin: 0.5, vstep: 0.5, vmax: 1.5, interpulse: 1e-3, thr: 10.0,
            trailer_reads: 3, prog_pulses: 1, cycles, tol: 5.0, check_read: false,
            skip_stage1: skip }
    }

    #[test]
    fn endurance_framing_and_tags() {
        let mut bench = Bench::new(ParametricDevice::default());
        let out = triples(&bench.run(endurance_params(2, 1, 1), vec![(1, 1), (2, 2)]));

        // 3 samples and a sentinel per device
        assert_eq!(out.len(), 8);
        for (i, t) in out.iter().enumerate() {
            assert_eq!(is_sentinel(t), i == 3 || i == 7);
        }
        assert_eq!(out[0].1, 1.5);
        assert_eq!(out[2].1, -1.5);

        assert_eq!(bench.tags(), vec!["EN_s", "EN_i", "EN_e", "EN_s", "EN_i", "EN_e"]);
    }

    #[test]
    fn single_sample_is_tagged_end() {
        let mut bench = Bench::new(ParametricDevice::default());
        bench.run(endurance_params(1, 0, 1), vec![(3, 3)]);
        assert_eq!(bench.tags(), vec!["EN_e"]);
    }

    #[test]
    fn form_finder_absolute_threshold() {
        let mut bench = Bench::new(ParametricDevice::default());
        let params = FormFinderParams {
            vmin: 0.5, vstep: 0.5, vmax: 4.0, pwmin: 1e-4, pwstep: 100.0, pwmax: 1e-3,
            interpulse: 1e-3, rthr: 5000.0, rthr_p: 0.0, psr: 0.0, nr_pulses: 5,
            linear: None };

        let out = triples(&bench.run(JobParams::FormFinder(params), vec![(4, 4)]));

        let (last, body) = out.split_last().unwrap();
        assert!(is_sentinel(last));
        assert!(!body.is_empty());
        assert!(body.iter().all(|t| !is_sentinel(t)));
        assert!(body.last().unwrap().0 < 5000.0);
        assert!(body[..body.len()-1].iter().all(|t| t.0 >= 5000.0));

        // 5 pulses × 4 widths × 8 voltages at most
        assert!(body.len() <= 5 * 4 * 8);

        // polarity follows Vmin and the width never exceeds its limit
        assert!(body.iter().all(|t| t.1 > 0.0 && (t.2 as f64) <= 1e-3 * 1.0001));
    }

    #[test]
    fn form_finder_exhausts() {
        let mut bench = Bench::new(ParametricDevice::inert());
        let params = FormFinderParams {
            vmin: -0.5, vstep: 0.5, vmax: -1.0, pwmin: 1e-4, pwstep: 1e-4, pwmax: 2e-4,
            interpulse: 1e-3, rthr: 5000.0, rthr_p: 0.0, psr: 0.0, nr_pulses: 2,
            linear: Some(true) };

        let out = triples(&bench.run(JobParams::FormFinder(params), vec![(1, 1)]));

        // 2 voltages × 2 widths × 2 pulses then the sentinel
        assert_eq!(out.len(), 9);
        assert!(is_sentinel(&out[8]));
        let volts: Vec<f32> = out[..8].iter().map(|t| t.1).collect();
        assert_eq!(volts, vec![-0.5, -0.5, -0.5, -0.5, -1.0, -1.0, -1.0, -1.0]);
    }

    #[test]
    fn curve_tracer_spans() {
        let pos = vec![0.1, 0.2, 0.3, 0.2, 0.1];
        let neg = vec![-0.1, -0.2, -0.1];
        let both = |a: &Vec<f64>, b: &Vec<f64>| -> Vec<f64> {
            a.iter().chain(b.iter()).copied().collect()
        };

        let cases = [
            (CurveSpan::PosThenNeg, 1, both(&pos, &neg)),
            (CurveSpan::NegThenPos, 1, both(&neg, &pos)),
            (CurveSpan::PosOnly, 1, pos.clone()),
            (CurveSpan::NegOnly, 1, neg.clone()),
            (CurveSpan::PosOnly, 2, both(&pos, &pos)),
        ];

        for (span, cycles, expected) in cases.iter() {
            let mut bench = Bench::new(ParametricDevice::inert());
            let params = CurveTracerParams {
                vpos: 0.3, vneg: -0.2, vstart: 0.1, vstep: 0.1, pwstep: 1e-3,
                interpulse: 1e-3, csp: 1e-3, csn: 1e-3, cycles: *cycles,
                curve_type: CurveType::Staircase, span: *span, halt_return: false };

            let out = triples(&bench.run(JobParams::CurveTracer(params), vec![(2, 2)]));

            assert_eq!(out.len(), expected.len() + 1, "{:?}", span);
            for (t, v) in out.iter().zip(expected.iter()) {
                assert!((t.1 as f64 - v).abs() < 1e-6, "{:?}: {} != {}", span, t.1, v);
                assert_eq!(t.2, 1e-3f32);
            }
            assert!(is_sentinel(out.last().unwrap()));
        }
    }

    #[test]
    fn form_finder_relative_threshold() {
        let mut bench = Bench::new(ParametricDevice::default());
        // an absolute threshold of 0 Ω never triggers
        let params = FormFinderParams {
            vmin: 0.5, vstep: 0.5, vmax: 4.0, pwmin: 1e-4, pwstep: 100.0, pwmax: 1e-3,
            interpulse: 1e-3, rthr: 0.0, rthr_p: 5.0, psr: 0.0, nr_pulses: 5,
            linear: None };

        let out = triples(&bench.run(JobParams::FormFinder(params), vec![(5, 5)]));

        let (last, body) = out.split_last().unwrap();
        assert!(is_sentinel(last));
        assert!(body.len() < 5 * 4 * 8);

        // the starting read is within 1% of 10 kΩ so a 5% move ends below
        // 9595 Ω and everything before it stays above 9405 Ω
        let (stop, before) = body.split_last().unwrap();
        assert!(stop.0 < 9600.0, "stopped at {}", stop.0);
        assert!(before.iter().all(|t| t.0 > 9400.0));
    }

    #[test]
    fn form_finder_pulse_modes() {
        let desc = crate::jobs::descriptor("141").unwrap();
        let raw = ["1.0", "0", "1.0", "0.0001", "100", "0.0004", "0.001", "0", "0", "0",
            "1", "0"];
        let tokens: Vec<_> = raw.iter().map(|s| crate::jobs::Token::parse(s)).collect();

        let params = JobParams::decode(desc, &tokens).unwrap();
        assert_eq!(params.kind().code(), "141");

        // mode 0 grows the width by pwstep percent
        let mut bench = Bench::new(ParametricDevice::inert());
        let out = triples(&bench.run(params.clone(), vec![(1, 1)]));
        assert_eq!(out.len(), 4);
        let widths: Vec<f64> = out[..3].iter().map(|t| t.2 as f64).collect();
        for (w, e) in widths.iter().zip([1e-4, 2e-4, 4e-4].iter()) {
            assert!((w - e).abs() < e * 1e-6, "{} != {}", w, e);
        }
        assert!(out[..3].iter().all(|t| t.1 == 1.0));

        // mode 1 adds pwstep seconds, which overshoots straight away
        let linear = match params {
            JobParams::FormFinder(p) => FormFinderParams { linear: Some(true), ..p },
            other => panic!("unexpected params {:?}", other)
        };
        let mut bench = Bench::new(ParametricDevice::inert());
        let out = triples(&bench.run(JobParams::FormFinder(linear), vec![(1, 1)]));
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].2, 1e-4f32);
    }

    #[test]
    fn switch_seeker_stage1_failure() {
        let mut bench = Bench::new(ParametricDevice::inert());
        let out = triples(&bench.run(JobParams::SwitchSeekerFast(ss_params(0, 2)),
            vec![(1, 1)]));

        // three magnitudes, both polarities, then give up
        assert_eq!(out.len(), 7);
        let volts: Vec<f32> = out[..6].iter().map(|t| t.1).collect();
        assert_eq!(volts, vec![0.5, -0.5, 1.0, -1.0, 1.5, -1.5]);
        assert!(is_sentinel(&out[6]));
    }

    #[test]
    fn switch_seeker_stage1_success() {
        // only one polarity moves the device; at 1.5 V and 1 ms the move is
        // about 10%, well clear of the 5% tolerance and the read noise
        let cases = [
            (ParametricDevice::new(0.0, 7.0e-4, 4000.0, -250.0, 14000.0, -2000.0, 0.4, 0.4),
                vec![1.5, -1.5, 1.5, 2.0, -1.5, -2.0]),
            (ParametricDevice::new(-7.0e-4, 0.0, 4000.0, -250.0, 14000.0, -2000.0, 0.4, 0.4),
                vec![1.5, -1.5, -2.0, 1.5, 2.0]),
        ];

        for (proto, expected) in cases.iter() {
            let mut bench = Bench::new(proto.clone());
            let params = SwitchSeekerParams {
                pw: 1e-3, vmin: 1.5, vstep: 0.5, vmax: 2.0, interpulse: 1e-3, thr: 50.0,
                trailer_reads: 3, prog_pulses: 1, cycles: 2, tol: 5.0, check_read: false,
                skip_stage1: 0 };

            let out = triples(&bench.run(JobParams::SwitchSeekerFast(params), vec![(1, 1)]));

            // stage 1 stops at the first polarity that switched and stage 2
            // opens with the opposite one
            assert_eq!(out.len(), expected.len() + 1);
            let volts: Vec<f32> = out[..expected.len()].iter().map(|t| t.1).collect();
            let expected: Vec<f32> = expected.iter().map(|v| *v as f32).collect();
            assert_eq!(volts, expected);
            assert!(is_sentinel(out.last().unwrap()));
        }
    }

    #[test]
    fn switch_seeker_slow_order() {
        let mut bench = Bench::new(ParametricDevice::inert());
        let out = triples(&bench.run(JobParams::SwitchSeekerSlow(ss_params(0, 2)),
            vec![(1, 1)]));

        let volts: Vec<f32> = out[..6].iter().map(|t| t.1).collect();
        assert_eq!(volts, vec![0.5, 1.0, 1.5, -0.5, -1.0, -1.5]);
    }

    #[test]
    fn switch_seeker_skips_stage1() {
        let mut bench = Bench::new(ParametricDevice::inert());
        let out = triples(&bench.run(JobParams::SwitchSeekerFast(ss_params(1, 2)),
            vec![(1, 1)]));

        // two alternating cycles of full ramps, starting opposite to +1
        assert_eq!(out.len(), 7);
        let volts: Vec<f32> = out[..6].iter().map(|t| t.1).collect();
        assert_eq!(volts, vec![-0.5, -1.0, -1.5, 0.5, 1.0, 1.5]);
        assert_eq!(bench.tags(), vec!["SS2_s", "SS2_i", "SS2_i", "SS2_i", "SS2_i", "SS2_e"]);
    }

    #[test]
    fn cancelled_run_ends_each_device() {
        let mut bench = Bench::new(ParametricDevice::default());
        bench.cancel.request();

        let out = triples(&bench.run(endurance_params(5, 5, 5), vec![(1, 1), (2, 2)]));
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(is_sentinel));
    }

    #[test]
    fn cancellation_spares_later_jobs() {
        let mut bench = Bench::new(ParametricDevice::default());
        bench.cancel.request();
        bench.cancel.request();

        // queued after both requests
        bench.generation = bench.cancel.generation();
        let out = triples(&bench.run(endurance_params(2, 2, 2), vec![(1, 1)]));
        assert_eq!(out.len(), 9);
        assert!(is_sentinel(&out[8]));
        assert!(out[..8].iter().all(|t| !is_sentinel(t)));

        // a new request stops it again
        bench.cancel.request();
        let out = triples(&bench.run(endurance_params(2, 2, 2), vec![(1, 1)]));
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn reads_are_never_zero() {
        let mut bench = Bench::new(ParametricDevice::default());
        let out = bench.run(JobParams::ReadSingle, vec![(1, 1)]);
        assert_eq!(out.len(), 1);
        assert!(out[0] > 0.0);
        assert_eq!(bench.tags(), vec!["S R"]);
    }

    #[test]
    fn pulse_read_moves_device() {
        let mut bench = Bench::new(ParametricDevice::default());
        let out = bench.run(JobParams::PulseRead(PulseParams {
            word: 2, bit: 3, amplitude: 2.0, pw: 1e-4 }), vec![(2, 3)]);
        assert_eq!(out.len(), 1);
        assert!(bench.crossbar.resistance(2, 3).unwrap() < 10_000.0);
        assert_eq!(bench.tags(), vec!["P"]);
    }
}
