//! Harness error taxonomy
//!
//! Every variant is fatal for the run. The driver releases the trace sink and
//! the model before any of these reach the caller.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::clock::SimTime;

pub type HarnessResult<T> = Result<T, HarnessError>;

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("Model construction failed: {0}")]
    ModelConstruction(String),

    #[error("Failed to open trace {}", path.display())]
    TraceOpen {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Trace write failed ({context})")]
    TraceWrite {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("Out-of-order trace dump: t={time} after t={last}")]
    TraceOrder { time: SimTime, last: SimTime },

    #[error("Trace dump at t={0} after the trace was closed")]
    TraceClosed(SimTime),

    #[error("Simulation clock overflowed at t={0}")]
    ClockOverflow(SimTime),

    #[error("Unknown signal: {0}")]
    UnknownSignal(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl HarnessError {
    /// Process exit code reported by the binary for this failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            HarnessError::Config(_) | HarnessError::UnknownSignal(_) => 2,
            HarnessError::ModelConstruction(_) => 3,
            HarnessError::TraceOpen { .. } => 4,
            HarnessError::TraceWrite { .. } => 5,
            HarnessError::TraceOrder { .. }
            | HarnessError::TraceClosed(_)
            | HarnessError::ClockOverflow(_) => 70,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_are_distinct_per_failure_class() {
        let open = HarnessError::TraceOpen {
            path: PathBuf::from("/nope/trace.vcd"),
            source: io::Error::new(io::ErrorKind::NotFound, "missing"),
        };
        let write = HarnessError::TraceWrite {
            context: "t=7".into(),
            source: io::Error::new(io::ErrorKind::Other, "disk full"),
        };

        assert_eq!(HarnessError::ModelConstruction("x".into()).exit_code(), 3);
        assert_eq!(open.exit_code(), 4);
        assert_eq!(write.exit_code(), 5);
        assert_eq!(HarnessError::ClockOverflow(u64::MAX).exit_code(), 70);
        assert_eq!(HarnessError::Config("bad".into()).exit_code(), 2);
    }

    #[test]
    fn test_messages_carry_context() {
        let err = HarnessError::TraceOpen {
            path: PathBuf::from("/nope/trace.vcd"),
            source: io::Error::new(io::ErrorKind::NotFound, "missing"),
        };
        assert!(err.to_string().contains("/nope/trace.vcd"));

        let err = HarnessError::TraceWrite {
            context: "t=7".into(),
            source: io::Error::new(io::ErrorKind::Other, "disk full"),
        };
        // The cause is reachable through `source()` only, not repeated in the message
        assert_eq!(err.to_string(), "Trace write failed (t=7)");
        let cause = std::error::Error::source(&err).map(|s| s.to_string());
        assert_eq!(cause.as_deref(), Some("disk full"));

        let err = HarnessError::TraceOrder { time: 3, last: 5 };
        assert_eq!(err.to_string(), "Out-of-order trace dump: t=3 after t=5");
    }
}
