//! Cycle-driven simulation harness
//!
//! Steps a device-under-test one tick at a time, records every tick into a
//! VCD waveform, and stops when the model signals completion or a tick budget
//! runs out.
//!
//! - `clock`: monotonic simulation time
//! - `dut`: the contract a model implements to be driven and traced
//! - `core`: built-in behaviour-IR model loaded from JSON
//! - `vcd`: streaming VCD recorder
//! - `driver`: the simulation loop and its termination rules

pub mod clock;
pub mod config;
pub mod core;
pub mod driver;
pub mod dut;
pub mod error;
pub mod vcd;

pub use clock::{SimClock, SimTime};
pub use config::{HarnessConfig, DEFAULT_BUDGET};
pub use core::{IrModel, IrModelOptions, IrModule};
pub use driver::{simulate, Driver, DriverState, RunReport, TerminationReason};
pub use dut::{DeviceUnderTest, SignalInfo, Traceable};
pub use error::{HarnessError, HarnessResult};
pub use vcd::{TraceOptions, TraceStats, VcdRecorder};
