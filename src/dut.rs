//! Device-under-test contract
//!
//! The driver only ever calls [`DeviceUnderTest::evaluate`] and
//! [`DeviceUnderTest::is_finished`]. Signal visibility for tracing lives in
//! [`Traceable`], which only the trace recorder uses.
//!
//! Construction is the implementor's own fallible constructor (reporting
//! [`HarnessError::ModelConstruction`](crate::HarnessError::ModelConstruction))
//! and destruction is `Drop`.

/// Evaluable hardware model.
pub trait DeviceUnderTest {
    /// Advance the model by exactly one step. Call at most once per tick.
    fn evaluate(&mut self);

    /// Completion signal. Once true it must stay true for the rest of the run.
    fn is_finished(&self) -> bool;
}

/// Name and bit width of one observable signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalInfo {
    pub name: String,
    pub width: usize,
}

impl SignalInfo {
    pub fn new(name: impl Into<String>, width: usize) -> Self {
        Self {
            name: name.into(),
            width,
        }
    }
}

/// Signal table and value sampling for waveform recording.
pub trait Traceable {
    /// Observable signals, in sampling order. Must not change during a run.
    fn signals(&self) -> Vec<SignalInfo>;

    /// Write the current value of every signal into `out`, indexed like
    /// [`Traceable::signals`]. `out.len()` equals the signal count.
    fn sample(&self, out: &mut [u64]);
}
