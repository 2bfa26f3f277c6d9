//! Run configuration
//!
//! Loaded from a JSON file; every field has a default so an empty object is a
//! valid configuration. Command-line flags override individual fields.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::core::IrModelOptions;
use crate::error::{HarnessError, HarnessResult};
use crate::vcd::TraceOptions;

/// Tick budget of the reference harness
pub const DEFAULT_BUDGET: u64 = 2000;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HarnessConfig {
    /// Maximum number of ticks before the run is forced to stop
    pub budget: u64,
    /// Output VCD file
    pub trace_path: PathBuf,
    pub timescale: String,
    /// Top-level `$scope` name in the trace
    pub module_name: String,
    /// Signals (exact names or substrings) to trace; empty traces everything
    pub trace_signals: Vec<String>,
    /// Model signal that ends the run when non-zero
    pub finish_signal: Option<String>,
    /// Model input toggled every tick
    pub clock_signal: Option<String>,
    pub reset_signal: Option<String>,
    /// Ticks the reset input is held asserted at the start of the run
    pub reset_ticks: u64,
    pub reset_active_low: bool,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            budget: DEFAULT_BUDGET,
            trace_path: PathBuf::from("ddr_sim.vcd"),
            timescale: "1ns".to_string(),
            module_name: "top".to_string(),
            trace_signals: Vec::new(),
            finish_signal: Some("finish".to_string()),
            clock_signal: None,
            reset_signal: None,
            reset_ticks: 0,
            reset_active_low: false,
        }
    }
}

impl HarnessConfig {
    pub fn load(path: impl AsRef<Path>) -> HarnessResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| HarnessError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_json(&content)
    }

    pub fn from_json(json: &str) -> HarnessResult<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| HarnessError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> HarnessResult<()> {
        if self.trace_path.as_os_str().is_empty() {
            return Err(HarnessError::Config("trace_path must not be empty".into()));
        }
        if !is_valid_timescale(&self.timescale) {
            return Err(HarnessError::Config(format!(
                "invalid timescale '{}' (expected 1, 10 or 100 followed by a unit, s to fs)",
                self.timescale
            )));
        }
        if self.module_name.trim().is_empty() || self.module_name.contains(char::is_whitespace) {
            return Err(HarnessError::Config(format!(
                "invalid module name '{}'",
                self.module_name
            )));
        }
        if self.reset_ticks > 0 && self.reset_signal.is_none() {
            return Err(HarnessError::Config(
                "reset_ticks is set but no reset_signal is configured".into(),
            ));
        }
        Ok(())
    }

    pub fn trace_options(&self) -> TraceOptions {
        TraceOptions {
            timescale: self.timescale.clone(),
            module_name: self.module_name.clone(),
            signals: self.trace_signals.clone(),
        }
    }

    pub fn model_options(&self) -> IrModelOptions {
        IrModelOptions {
            clock: self.clock_signal.clone(),
            reset: self.reset_signal.clone(),
            reset_ticks: self.reset_ticks,
            reset_active_low: self.reset_active_low,
            finish: self.finish_signal.clone(),
        }
    }
}

fn is_valid_timescale(ts: &str) -> bool {
    let digits = ts.trim_end_matches(|c: char| c.is_ascii_alphabetic());
    let unit = &ts[digits.len()..];
    matches!(digits.trim_end(), "1" | "10" | "100")
        && matches!(unit, "s" | "ms" | "us" | "ns" | "ps" | "fs")
}
