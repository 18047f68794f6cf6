//! Interface library and virtual instrument for ArC ONE™
//!
//! `libarc1` talks to ArC ONE memristor characterisation boards over the
//! ArC ONE line protocol. The same protocol is implemented by a simulated
//! instrument, [`VirtualArC`], which models a crossbar of resistive
//! switching devices including the half-select disturbance of
//! neighbouring devices during writes. Both the physical board
//! ([`ArC1`]) and the simulation implement [`Interface`] so client code
//! can switch between them freely.
//!
//! ## Example
//!
//! ```
//! use libarc1::{HardwareConfig, Interface, SimulationConfig, VirtualArC};
//!
//! let sim = SimulationConfig::default().with_size(4, 4).with_seed(1);
//! let mut arc = VirtualArC::new(sim).unwrap();
//! arc.initialise(&HardwareConfig::default().with_size(4, 4)).unwrap();
//!
//! // pulse W2B3 with 1.5 V for 100 μs and read it back
//! let res = arc.pulseread_one(2, 3, 1.5, 100e-6).unwrap();
//! assert!(res > 0.0);
//!
//! // read every device of the array
//! let all = arc.read_all(4, 4).unwrap();
//! assert_eq!(all.len(), 16);
//! ```
//!
//! Long running jobs (endurance, FormFinder, CurveTracer, SwitchSeeker)
//! stream `(resistance, amplitude, pulse width)` triples for every
//! device, terminated by `(0, 0, 0)`; see [`Interface::read_triples`].

#[macro_use] extern crate lazy_static;
#[macro_use] mod macros;

pub mod buffer;
pub mod config;
pub mod crossbar;
pub mod device;
pub mod dispatch;
pub mod executors;
pub mod instrument;
pub mod jobs;
pub mod mask;
pub mod virtualarc;

pub use config::{HardwareConfig, SimulationConfig, SerialConfig};
pub use config::{ReadMode, SessionMode, SneakPath, CurveType, CurveSpan, ReadAllMode};
pub use crossbar::{Crossbar, CrossbarError};
pub use device::{DeviceModel, ParametricDevice, BiolekDevice, ModelError};
pub use dispatch::{Dispatcher, DispatcherState, ProtocolError};
pub use executors::HistoryEntry;
pub use instrument::{ArC1, ArC1Error, Interface, find_ports};
pub use jobs::JobParams;
pub use mask::DeviceMask;
pub use virtualarc::VirtualArC;
