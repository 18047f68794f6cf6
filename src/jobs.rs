//! Jobs understood by ArC ONE
//!
//! Every operation of the instrument is a _job_: a job code followed by
//! a fixed, job-specific number of parameters and, for most jobs, one or
//! more device addresses. The layout of every job is described by a
//! [`JobDescriptor`] and the descriptors are collected in a single table
//! (see [`descriptor`]) shared by the client side ([`JobParams::to_tokens`])
//! and the instrument side ([`Dispatcher`][`crate::dispatch::Dispatcher`]).

use std::collections::HashMap;
use std::fmt;
use num_traits::FromPrimitive;

use crate::config::{HardwareConfig, ReadMode, SessionMode, SneakPath};
use crate::config::{ReadAllMode, CurveType, CurveSpan, enum_from_f64};
use crate::dispatch::ProtocolError;


/// A single newline-delimited token
///
/// Tokens are decoded leniently: anything that parses as a float is
/// numeric, everything else is kept verbatim.
#[derive(Clone, Debug, PartialEq)]
pub enum Token {
    Num(f64),
    Text(String),
}

impl Token {

    /// Decode a raw token. Surrounding whitespace (including the
    /// line terminator) is ignored.
    pub fn parse(raw: &str) -> Token {
        let raw = raw.trim();
        match raw.parse::<f64>() {
            Ok(v) => Token::Num(v),
            Err(_) => Token::Text(raw.to_string())
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Token::Num(v) => Some(*v),
            Token::Text(_) => None
        }
    }

    /// Interpret as a non-negative integer (device counts, addresses)
    pub fn as_usize(&self) -> Option<usize> {
        match self {
            Token::Num(v) if *v >= 0.0 && v.fract() == 0.0 => Some(*v as usize),
            _ => None
        }
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Num(v) => write!(f, "{}", v),
            Token::Text(s) => write!(f, "{}", s)
        }
    }
}


/// All jobs known to ArC ONE
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum JobKind {
    ReadSingle,
    ReadAll,
    PulseRead,
    Endurance,
    FormFinder,
    FormFinderLinear,
    CurveTracer,
    SwitchSeekerFast,
    SwitchSeekerSlow,
    Reset,
    Init,
    UpdateRead,
    UpdateHardware,
    Select,
}

impl JobKind {

    /// Wire code of this job
    pub fn code(&self) -> &'static str {
        match self {
            JobKind::ReadSingle => "1",
            JobKind::ReadAll => "2",
            JobKind::PulseRead => "3",
            JobKind::Endurance => "191",
            JobKind::FormFinder => "14",
            JobKind::FormFinderLinear => "141",
            JobKind::CurveTracer => "201",
            JobKind::SwitchSeekerFast => "15",
            JobKind::SwitchSeekerSlow => "152",
            JobKind::Reset => "00",
            JobKind::Init => "0",
            JobKind::UpdateRead => "01",
            JobKind::UpdateHardware => "011",
            JobKind::Select => "02",
        }
    }

    /// History tag of this job's samples
    pub fn tag(&self) -> &'static str {
        match self {
            JobKind::ReadSingle | JobKind::ReadAll => "S R",
            JobKind::PulseRead => "P",
            JobKind::Endurance => "EN",
            JobKind::FormFinder | JobKind::FormFinderLinear => "FF",
            JobKind::CurveTracer => "CT",
            JobKind::SwitchSeekerFast | JobKind::SwitchSeekerSlow => "SS2",
            _ => ""
        }
    }

    pub fn descriptor(&self) -> &'static JobDescriptor {
        // every kind has a table entry
        &JOBS[self.code()]
    }
}


/// How device addresses follow the parameters of a job
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Addressing {
    /// No device is involved
    None,
    /// Word and bit are the first two parameters
    Embedded,
    /// One `word, bit` pair follows the parameters
    Single,
    /// The last parameter is a device count, followed by as many
    /// `word, bit` pairs. The job runs once per device.
    Counted,
    /// Read-all addressing: a complete array, or (custom mode) a count
    /// followed by `word, bit` pairs, gathered and run once.
    Masked,
}

/// Wire layout of a job
#[derive(Clone, Debug)]
pub struct JobDescriptor {
    pub kind: JobKind,
    pub code: &'static str,
    /// Names of the positional parameters, in wire order
    pub params: &'static [&'static str],
    pub devices: Addressing,
}

impl JobDescriptor {

    /// Number of tokens gathered before device addressing starts,
    /// including the device count for [`Addressing::Counted`] jobs.
    pub fn arity(&self) -> usize {
        match self.devices {
            Addressing::Counted => self.params.len() + 1,
            _ => self.params.len()
        }
    }
}

const NO_PARAMS: &[&str] = &[];
const READALL_PARAMS: &[&str] = &["mode", "words", "bits"];
const PULSE_PARAMS: &[&str] = &["word", "bit", "amplitude", "pw"];
const ENDURANCE_PARAMS: &[&str] = &["posV", "posPW", "posCutoff", "negV", "negPW",
    "negCutoff", "interpulse", "posPulses", "negPulses", "cycles"];
const FORMFINDER_PARAMS: &[&str] = &["Vmin", "Vstep", "Vmax", "pwmin", "pwstep",
    "pwmax", "interpulse", "Rthr", "Rthr_p", "pSR", "nrP"];
const FORMFINDER_LIN_PARAMS: &[&str] = &["Vmin", "Vstep", "Vmax", "pwmin", "pwstep",
    "pwmax", "interpulse", "Rthr", "Rthr_p", "pSR", "nrP", "pulseMode"];
const CURVETRACER_PARAMS: &[&str] = &["Vpos", "Vneg", "Vstart", "Vstep", "pwstep",
    "interpulse", "CSp", "CSn", "cycles", "type", "option", "returnFlag"];
const SWITCHSEEKER_PARAMS: &[&str] = &["pw", "Vmin", "Vstep", "Vmax", "interpulse",
    "thr", "trailerReads", "progPulses", "cycles", "tol", "checkRead", "skipStage1"];
const INIT_PARAMS: &[&str] = &["cycles", "words", "bits", "readmode", "sessionmode",
    "sneakpath", "Vread"];
const UPDATE_READ_PARAMS: &[&str] = &["readmode", "Vread"];
const UPDATE_HW_PARAMS: &[&str] = &["cycles", "sneakpath"];

/// Every job code known to the instrument
pub const JOB_CODES: [&str; 14] = ["1", "2", "3", "191", "14", "141", "201", "15",
    "152", "00", "0", "01", "011", "02"];

lazy_static! {
    static ref JOBS: HashMap<&'static str, JobDescriptor> = {
        let table: Vec<(JobKind, &'static [&'static str], Addressing)> = vec![
            (JobKind::ReadSingle, NO_PARAMS, Addressing::Single),
            (JobKind::ReadAll, READALL_PARAMS, Addressing::Masked),
            (JobKind::PulseRead, PULSE_PARAMS, Addressing::Embedded),
            (JobKind::Endurance, ENDURANCE_PARAMS, Addressing::Counted),
            (JobKind::FormFinder, FORMFINDER_PARAMS, Addressing::Counted),
            (JobKind::FormFinderLinear, FORMFINDER_LIN_PARAMS, Addressing::Counted),
            (JobKind::CurveTracer, CURVETRACER_PARAMS, Addressing::Counted),
            (JobKind::SwitchSeekerFast, SWITCHSEEKER_PARAMS, Addressing::Counted),
            (JobKind::SwitchSeekerSlow, SWITCHSEEKER_PARAMS, Addressing::Counted),
            (JobKind::Reset, NO_PARAMS, Addressing::None),
            (JobKind::Init, INIT_PARAMS, Addressing::None),
            (JobKind::UpdateRead, UPDATE_READ_PARAMS, Addressing::None),
            (JobKind::UpdateHardware, UPDATE_HW_PARAMS, Addressing::None),
            (JobKind::Select, NO_PARAMS, Addressing::Single),
        ];

        let mut map = HashMap::with_capacity(table.len());
        for (kind, params, devices) in table {
            map.insert(kind.code(), JobDescriptor { kind, code: kind.code(), params, devices });
        }
        map
    };
}

/// Look up the descriptor of a job code. Matching is exact.
pub fn descriptor(code: &str) -> Option<&'static JobDescriptor> {
    JOBS.get(code)
}


/// Parameters of a _read all_ job
#[derive(Clone, Debug, PartialEq)]
pub struct ReadAllParams {
    pub mode: ReadAllMode,
    pub words: usize,
    pub bits: usize,
}

/// Parameters of a pulse-then-read job
#[derive(Clone, Debug, PartialEq)]
pub struct PulseParams {
    pub word: usize,
    pub bit: usize,
    pub amplitude: f64,
    pub pw: f64,
}

/// Parameters of an endurance job
#[derive(Clone, Debug, PartialEq)]
pub struct EnduranceParams {
    pub pos_v: f64,
    pub pos_pw: f64,
    /// Current cutoff; enforced by the firmware only
    pub pos_cutoff: f64,
    pub neg_v: f64,
    pub neg_pw: f64,
    pub neg_cutoff: f64,
    pub interpulse: f64,
    pub pos_pulses: u32,
    pub neg_pulses: u32,
    pub cycles: u32,
}

/// Parameters of a FormFinder job
#[derive(Clone, Debug, PartialEq)]
pub struct FormFinderParams {
    pub vmin: f64,
    pub vstep: f64,
    pub vmax: f64,
    pub pwmin: f64,
    /// Pulse width step; percentage unless the linear mode is selected
    pub pwstep: f64,
    pub pwmax: f64,
    pub interpulse: f64,
    /// Absolute resistance threshold
    pub rthr: f64,
    /// Relative resistance threshold (%); `0` disables it
    pub rthr_p: f64,
    /// Series resistance; hardware only
    pub psr: f64,
    pub nr_pulses: u32,
    /// Linear pulse width step flag. `None` selects the legacy job
    /// (`14`) which always steps pulse widths by percentage.
    pub linear: Option<bool>,
}

impl FormFinderParams {
    pub fn linear_pw(&self) -> bool {
        self.linear.unwrap_or(false)
    }
}

/// Parameters of a CurveTracer job
#[derive(Clone, Debug, PartialEq)]
pub struct CurveTracerParams {
    pub vpos: f64,
    pub vneg: f64,
    pub vstart: f64,
    pub vstep: f64,
    pub pwstep: f64,
    pub interpulse: f64,
    /// Current compliance; firmware only
    pub csp: f64,
    pub csn: f64,
    pub cycles: u32,
    pub curve_type: CurveType,
    pub span: CurveSpan,
    /// Halt and return on compliance; firmware only
    pub halt_return: bool,
}

/// Parameters of a SwitchSeeker job
#[derive(Clone, Debug, PartialEq)]
pub struct SwitchSeekerParams {
    pub pw: f64,
    pub vmin: f64,
    pub vstep: f64,
    pub vmax: f64,
    pub interpulse: f64,
    /// Switching threshold of the second stage (%)
    pub thr: f64,
    pub trailer_reads: u32,
    pub prog_pulses: u32,
    pub cycles: u32,
    /// Tolerance band of the first stage (%)
    pub tol: f64,
    pub check_read: bool,
    /// `0` runs the polarity search, `±1` skips it with a fixed polarity
    pub skip_stage1: i32,
}


/// Fully decoded parameters of a job
#[derive(Clone, Debug, PartialEq)]
pub enum JobParams {
    ReadSingle,
    ReadAll(ReadAllParams),
    PulseRead(PulseParams),
    Endurance(EnduranceParams),
    FormFinder(FormFinderParams),
    CurveTracer(CurveTracerParams),
    SwitchSeekerFast(SwitchSeekerParams),
    SwitchSeekerSlow(SwitchSeekerParams),
    Reset,
    Init(HardwareConfig),
    UpdateRead { read_mode: ReadMode, vread: f64 },
    UpdateHardware { cycles: u32, sneak_path: SneakPath },
    Select,
}


/// Sequential reader over the parameter tokens of a job
struct Fields<'a> {
    desc: &'static JobDescriptor,
    tokens: &'a [Token],
    pos: usize,
}

impl<'a> Fields<'a> {

    fn new(desc: &'static JobDescriptor, tokens: &'a [Token]) -> Self {
        Fields { desc, tokens, pos: 0 }
    }

    fn framing(&self, idx: usize) -> ProtocolError {
        ProtocolError::Framing {
            job: self.desc.code,
            field: self.desc.params.get(idx).copied().unwrap_or("count"),
            token: self.tokens.get(idx).map(|t| t.to_string()).unwrap_or_default(),
        }
    }

    /// Next numeric field; `NaN` and infinities are rejected
    fn f64(&mut self) -> Result<f64, ProtocolError> {
        let idx = self.pos;
        self.pos += 1;
        self.tokens.get(idx)
            .and_then(Token::as_f64)
            .filter(|v| v.is_finite())
            .ok_or_else(|| self.framing(idx))
    }

    fn usize(&mut self) -> Result<usize, ProtocolError> {
        let idx = self.pos;
        self.pos += 1;
        self.tokens.get(idx).and_then(Token::as_usize).ok_or_else(|| self.framing(idx))
    }

    fn u32(&mut self) -> Result<u32, ProtocolError> {
        let idx = self.pos;
        let val = self.usize()?;
        if val > u32::MAX as usize {
            return Err(self.framing(idx));
        }
        Ok(val as u32)
    }

    fn flag(&mut self) -> Result<bool, ProtocolError> {
        Ok(self.f64()? != 0.0)
    }

    /// `-1`, `0` or `1` following the sign of the token
    fn polarity(&mut self) -> Result<i32, ProtocolError> {
        let val = self.f64()?;
        if val > 0.0 {
            Ok(1)
        } else if val < 0.0 {
            Ok(-1)
        } else {
            Ok(0)
        }
    }

    fn choice<T: FromPrimitive>(&mut self) -> Result<T, ProtocolError> {
        let idx = self.pos;
        enum_from_f64(self.f64()?).ok_or_else(|| self.framing(idx))
    }
}

// Integers are sent as integers, everything else as floats
fn int<T: fmt::Display>(val: T) -> String {
    format!("{}", val)
}

fn float(val: f64) -> String {
    format!("{}", val)
}

fn flag(val: bool) -> String {
    if val { "1".to_string() } else { "0".to_string() }
}

impl JobParams {

    /// Kind of this job
    pub fn kind(&self) -> JobKind {
        match self {
            JobParams::ReadSingle => JobKind::ReadSingle,
            JobParams::ReadAll(_) => JobKind::ReadAll,
            JobParams::PulseRead(_) => JobKind::PulseRead,
            JobParams::Endurance(_) => JobKind::Endurance,
            JobParams::FormFinder(p) => match p.linear {
                None => JobKind::FormFinder,
                Some(_) => JobKind::FormFinderLinear,
            },
            JobParams::CurveTracer(_) => JobKind::CurveTracer,
            JobParams::SwitchSeekerFast(_) => JobKind::SwitchSeekerFast,
            JobParams::SwitchSeekerSlow(_) => JobKind::SwitchSeekerSlow,
            JobParams::Reset => JobKind::Reset,
            JobParams::Init(_) => JobKind::Init,
            JobParams::UpdateRead { .. } => JobKind::UpdateRead,
            JobParams::UpdateHardware { .. } => JobKind::UpdateHardware,
            JobParams::Select => JobKind::Select,
        }
    }

    /// Build the parameter record of job `desc` from its positional
    /// parameter tokens. The device count of counted jobs is not part of
    /// the record and is ignored if present.
    pub fn decode(desc: &'static JobDescriptor, tokens: &[Token]) -> Result<JobParams, ProtocolError> {

        let mut f = Fields::new(desc, tokens);

        let params = match desc.kind {
            JobKind::ReadSingle => JobParams::ReadSingle,
            JobKind::ReadAll => JobParams::ReadAll(ReadAllParams {
                mode: f.choice()?,
                words: f.usize()?,
                bits: f.usize()?,
            }),
            JobKind::PulseRead => JobParams::PulseRead(PulseParams {
                word: f.usize()?,
                bit: f.usize()?,
                amplitude: f.f64()?,
                pw: f.f64()?,
            }),
            JobKind::Endurance => JobParams::Endurance(EnduranceParams {
                pos_v: f.f64()?,
                pos_pw: f.f64()?,
                pos_cutoff: f.f64()?,
                neg_v: f.f64()?,
                neg_pw: f.f64()?,
                neg_cutoff: f.f64()?,
                interpulse: f.f64()?,
                pos_pulses: f.u32()?,
                neg_pulses: f.u32()?,
                cycles: f.u32()?,
            }),
            JobKind::FormFinder | JobKind::FormFinderLinear => {
                let mut p = FormFinderParams {
                    vmin: f.f64()?,
                    vstep: f.f64()?,
                    vmax: f.f64()?,
                    pwmin: f.f64()?,
                    pwstep: f.f64()?,
                    pwmax: f.f64()?,
                    interpulse: f.f64()?,
                    rthr: f.f64()?,
                    rthr_p: f.f64()?,
                    psr: f.f64()?,
                    nr_pulses: f.u32()?,
                    linear: None,
                };
                if desc.kind == JobKind::FormFinderLinear {
                    p.linear = Some(f.flag()?);
                }
                JobParams::FormFinder(p)
            },
            JobKind::CurveTracer => JobParams::CurveTracer(CurveTracerParams {
                vpos: f.f64()?,
                vneg: f.f64()?,
                vstart: f.f64()?,
                vstep: f.f64()?,
                pwstep: f.f64()?,
                interpulse: f.f64()?,
                csp: f.f64()?,
                csn: f.f64()?,
                cycles: f.u32()?,
                curve_type: f.choice()?,
                span: f.choice()?,
                halt_return: f.flag()?,
            }),
            JobKind::SwitchSeekerFast | JobKind::SwitchSeekerSlow => {
                let p = SwitchSeekerParams {
                    pw: f.f64()?,
                    vmin: f.f64()?,
                    vstep: f.f64()?,
                    vmax: f.f64()?,
                    interpulse: f.f64()?,
                    thr: f.f64()?,
                    trailer_reads: f.u32()?,
                    prog_pulses: f.u32()?,
                    cycles: f.u32()?,
                    tol: f.f64()?,
                    check_read: f.flag()?,
                    skip_stage1: f.polarity()?,
                };
                if desc.kind == JobKind::SwitchSeekerFast {
                    JobParams::SwitchSeekerFast(p)
                } else {
                    JobParams::SwitchSeekerSlow(p)
                }
            },
            JobKind::Reset => JobParams::Reset,
            JobKind::Init => JobParams::Init(HardwareConfig {
                cycles: f.u32()?,
                words: f.usize()?,
                bits: f.usize()?,
                read_mode: f.choice::<ReadMode>()?,
                session_mode: f.choice::<SessionMode>()?,
                sneak_path: f.choice::<SneakPath>()?,
                vread: f.f64()?,
            }),
            JobKind::UpdateRead => JobParams::UpdateRead {
                read_mode: f.choice()?,
                vread: f.f64()?,
            },
            JobKind::UpdateHardware => JobParams::UpdateHardware {
                cycles: f.u32()?,
                sneak_path: f.choice()?,
            },
            JobKind::Select => JobParams::Select,
        };

        Ok(params)
    }

    /// Positional parameter tokens of this job, without the job code,
    /// device count or device addresses.
    pub fn param_tokens(&self) -> Vec<String> {
        match self {
            JobParams::ReadSingle | JobParams::Reset | JobParams::Select => vec![],
            JobParams::ReadAll(p) => vec![int(p.mode as u8), int(p.words), int(p.bits)],
            JobParams::PulseRead(p) => vec![int(p.word), int(p.bit), float(p.amplitude),
                float(p.pw)],
            JobParams::Endurance(p) => vec![float(p.pos_v), float(p.pos_pw),
                float(p.pos_cutoff), float(p.neg_v), float(p.neg_pw), float(p.neg_cutoff),
                float(p.interpulse), int(p.pos_pulses), int(p.neg_pulses), int(p.cycles)],
            JobParams::FormFinder(p) => {
                let mut v = vec![float(p.vmin), float(p.vstep), float(p.vmax),
                    float(p.pwmin), float(p.pwstep), float(p.pwmax), float(p.interpulse),
                    float(p.rthr), float(p.rthr_p), float(p.psr), int(p.nr_pulses)];
                if let Some(linear) = p.linear {
                    v.push(flag(linear));
                }
                v
            },
            JobParams::CurveTracer(p) => vec![float(p.vpos), float(p.vneg), float(p.vstart),
                float(p.vstep), float(p.pwstep), float(p.interpulse), float(p.csp),
                float(p.csn), int(p.cycles), int(p.curve_type as u8), int(p.span as u8),
                flag(p.halt_return)],
            JobParams::SwitchSeekerFast(p) | JobParams::SwitchSeekerSlow(p) => vec![
                float(p.pw), float(p.vmin), float(p.vstep), float(p.vmax),
                float(p.interpulse), float(p.thr), int(p.trailer_reads),
                int(p.prog_pulses), int(p.cycles), float(p.tol), flag(p.check_read),
                int(p.skip_stage1)],
            JobParams::Init(c) => vec![int(c.cycles), int(c.words), int(c.bits),
                int(c.wire_read_mode()), int(c.session_mode as u8), int(c.sneak_path as u8),
                float(c.vread)],
            JobParams::UpdateRead { read_mode, vread } => {
                let conf = HardwareConfig::default().with_read(*read_mode, *vread);
                vec![int(conf.wire_read_mode()), float(*vread)]
            },
            JobParams::UpdateHardware { cycles, sneak_path } => vec![int(cycles),
                int(*sneak_path as u8)],
        }
    }

    /// Complete wire sequence of this job: code, parameters and device
    /// addressing. `devices` is ignored by jobs that address no device
    /// or embed their address; single-device jobs use the first entry.
    pub fn to_tokens(&self, devices: &[(usize, usize)]) -> Vec<String> {
        let kind = self.kind();
        let desc = kind.descriptor();

        let mut tokens = Vec::with_capacity(1 + desc.arity() + 2*devices.len());
        tokens.push(kind.code().to_string());
        tokens.append(&mut self.param_tokens());

        fn push_devices(tokens: &mut Vec<String>, devs: &[(usize, usize)]) {
            for (w, b) in devs {
                tokens.push(int(w));
                tokens.push(int(b));
            }
        }

        match desc.devices {
            Addressing::None | Addressing::Embedded => {},
            Addressing::Single => {
                push_devices(&mut tokens, &devices[..devices.len().min(1)]);
            },
            Addressing::Counted => {
                tokens.push(int(devices.len()));
                push_devices(&mut tokens, devices);
            },
            Addressing::Masked => {
                if let JobParams::ReadAll(ReadAllParams { mode: ReadAllMode::Custom, .. }) = self {
                    tokens.push(int(devices.len()));
                    push_devices(&mut tokens, devices);
                }
            }
        }

        tokens
    }
}
