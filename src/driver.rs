//! Simulation loop
//!
//! `Uninitialized -> Running -> Terminated`. Each tick evaluates the model,
//! dumps a trace record stamped with the current time, then advances the
//! clock. Termination (finish signal OR budget reached) is checked at the
//! start of every tick, so no evaluate/dump happens once it holds.
//!
//! On every exit path the trace is closed before the model is dropped: the
//! terminal transition and the error path both close the recorder, and the
//! recorder field is declared (and therefore dropped) ahead of the model.

use std::error::Error as _;
use std::fs::File;
use std::io::{BufWriter, Write};

use tracing::{debug, error, info, trace};

use crate::clock::{SimClock, SimTime};
use crate::config::HarnessConfig;
use crate::dut::{DeviceUnderTest, Traceable};
use crate::error::{HarnessError, HarnessResult};
use crate::vcd::{TraceStats, VcdRecorder};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    Uninitialized,
    Running,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    /// The model asserted its finish signal
    Finished,
    /// The clock reached the tick budget
    BudgetExhausted,
}

/// Outcome of a completed run.
#[derive(Debug, Clone)]
pub struct RunReport {
    /// Ticks executed (evaluate + dump pairs)
    pub ticks: u64,
    /// Clock value at termination
    pub final_time: SimTime,
    /// Trace records written
    pub records: u64,
    pub reason: TerminationReason,
    pub trace_stats: TraceStats,
}

pub struct Driver<M, W: Write> {
    // Dropped before `model`
    recorder: VcdRecorder<W>,
    model: M,
    clock: SimClock,
    budget: u64,
    ticks: u64,
    state: DriverState,
    reason: Option<TerminationReason>,
}

impl<M: DeviceUnderTest + Traceable> Driver<M, BufWriter<File>> {
    /// Construct the model, then open the trace file named by `config`.
    ///
    /// A construction failure returns before any trace file exists. A trace
    /// open failure drops the model without it ever being evaluated.
    pub fn start<F>(config: &HarnessConfig, construct: F) -> HarnessResult<Self>
    where
        F: FnOnce() -> HarnessResult<M>,
    {
        config.validate()?;
        let model = construct()?;
        let recorder = VcdRecorder::create(&config.trace_path, &config.trace_options())?;
        let mut driver = Self::with_recorder(model, recorder, config.budget);
        driver.begin()?;
        Ok(driver)
    }
}

impl<M: DeviceUnderTest + Traceable, W: Write> Driver<M, W> {
    /// Assemble a driver from an already-built model and recorder.
    pub fn with_recorder(model: M, recorder: VcdRecorder<W>, budget: u64) -> Self {
        Self {
            recorder,
            model,
            clock: SimClock::new(),
            budget,
            ticks: 0,
            state: DriverState::Uninitialized,
            reason: None,
        }
    }

    /// Replace the clock. Only meaningful before the first tick.
    pub fn with_clock(mut self, clock: SimClock) -> Self {
        self.clock = clock;
        self
    }

    /// Attach the model to the trace and enter `Running`.
    pub fn begin(&mut self) -> HarnessResult<()> {
        if self.state != DriverState::Uninitialized {
            return Ok(());
        }
        if let Err(e) = self.recorder.attach(&self.model) {
            return Err(self.abort(e));
        }
        self.state = DriverState::Running;
        info!(budget = self.budget, start = self.clock.now(), "simulation running");
        Ok(())
    }

    fn termination(&self) -> Option<TerminationReason> {
        if self.model.is_finished() {
            Some(TerminationReason::Finished)
        } else if self.clock.now() >= self.budget {
            Some(TerminationReason::BudgetExhausted)
        } else {
            None
        }
    }

    /// Execute one tick. Returns `Ok(false)` once the run has terminated.
    pub fn step(&mut self) -> HarnessResult<bool> {
        match self.state {
            DriverState::Terminated => return Ok(false),
            DriverState::Uninitialized => self.begin()?,
            DriverState::Running => {}
        }

        if let Some(reason) = self.termination() {
            self.state = DriverState::Terminated;
            self.reason = Some(reason);
            self.recorder.close()?;
            info!(
                ?reason,
                ticks = self.ticks,
                time = self.clock.now(),
                records = self.recorder.records(),
                "simulation terminated"
            );
            return Ok(false);
        }

        let now = self.clock.now();
        self.model.evaluate();
        if let Err(e) = self.recorder.dump(now, &self.model) {
            return Err(self.abort(e));
        }
        if let Err(e) = self.clock.advance() {
            return Err(self.abort(e));
        }
        self.ticks += 1;
        trace!(time = now, "tick");
        Ok(true)
    }

    /// Fatal path: terminate and release the trace, keeping the first error.
    fn abort(&mut self, err: HarnessError) -> HarnessError {
        self.state = DriverState::Terminated;
        if let Err(close_err) = self.recorder.close() {
            debug!("trace close after failure also failed: {}", close_err);
        }
        match err.source() {
            Some(cause) => error!(
                ticks = self.ticks,
                time = self.clock.now(),
                "simulation aborted: {}: {}",
                err,
                cause
            ),
            None => error!(
                ticks = self.ticks,
                time = self.clock.now(),
                "simulation aborted: {}",
                err
            ),
        }
        if !self.recorder.is_complete() {
            error!("trace is incomplete ({} records written)", self.recorder.records());
        }
        err
    }

    /// Run to termination, then close the trace and drop the model.
    pub fn run(mut self) -> HarnessResult<RunReport> {
        while self.step()? {}
        Ok(self.report())
    }

    fn report(&self) -> RunReport {
        RunReport {
            ticks: self.ticks,
            final_time: self.clock.now(),
            records: self.recorder.records(),
            reason: self.reason.unwrap_or(TerminationReason::BudgetExhausted),
            trace_stats: self.recorder.stats(),
        }
    }

    pub fn state(&self) -> DriverState {
        self.state
    }

    pub fn now(&self) -> SimTime {
        self.clock.now()
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn budget(&self) -> u64 {
        self.budget
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn recorder(&self) -> &VcdRecorder<W> {
        &self.recorder
    }
}

/// Build the model, open the trace from `config` and run to termination.
pub fn simulate<M, F>(config: &HarnessConfig, construct: F) -> HarnessResult<RunReport>
where
    M: DeviceUnderTest + Traceable,
    F: FnOnce() -> HarnessResult<M>,
{
    Driver::start(config, construct)?.run()
}
