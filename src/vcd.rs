//! VCD (Value Change Dump) trace recorder
//!
//! Owns the waveform sink for one run:
//! - Header (`$timescale`, scope, `$var` declarations) is written when the
//!   model is attached, so an empty run still produces a well-formed file
//! - Every dump writes exactly one `#time` record; the first record carries
//!   `$dumpvars` with all traced values, later records only value changes
//! - Dump timestamps must strictly increase
//! - Every write is flushed before it returns, so a failing sink is reported
//!   by the dump that hit it
//! - `close` is idempotent and also runs on drop
//!
//! A trace whose writes failed is marked incomplete and gets a best-effort
//! `$comment` marker on close.

use std::fmt::Write as _;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::clock::SimTime;
use crate::dut::{SignalInfo, Traceable};
use crate::error::{HarnessError, HarnessResult};

/// Presentation settings for the VCD header and signal selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceOptions {
    /// Time scale string (e.g. "1ns", "10ps")
    pub timescale: String,
    /// Module name for the top-level `$scope`
    pub module_name: String,
    /// Signal names or substrings to trace (empty = all signals)
    pub signals: Vec<String>,
}

impl Default for TraceOptions {
    fn default() -> Self {
        Self {
            timescale: "1ns".to_string(),
            module_name: "top".to_string(),
            signals: Vec::new(),
        }
    }
}

/// VCD recorder over any byte sink.
pub struct VcdRecorder<W: Write> {
    /// Output sink (None only after `into_inner`)
    writer: Option<W>,

    /// Sink accepts dumps
    open: bool,

    /// No write has failed so far
    complete: bool,

    options: TraceOptions,

    /// Signal table captured at attach time
    signals: Vec<SignalInfo>,

    /// Indices into `signals` that are written to the trace, ascending
    traced: Vec<usize>,

    /// VCD identifier for each signal (indexed by signal index)
    vcd_ids: Vec<String>,

    /// Scratch buffer the model samples into
    current: Vec<u64>,

    /// Values as of the last record, for change detection
    prev_values: Vec<u64>,

    attached: bool,

    first_time: Option<SimTime>,
    last_time: Option<SimTime>,

    records: u64,
    value_changes: u64,

    start_instant: Option<Instant>,
}

impl VcdRecorder<BufWriter<File>> {
    /// Create (truncate) a VCD file and wrap it in a recorder.
    pub fn create(path: impl AsRef<Path>, options: &TraceOptions) -> HarnessResult<Self> {
        let path = path.as_ref();
        let file = File::create(path).map_err(|source| HarnessError::TraceOpen {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(path = %path.display(), "opened VCD trace");
        Ok(Self::new(BufWriter::new(file), options))
    }
}

impl<W: Write> VcdRecorder<W> {
    /// Wrap an already-open sink.
    pub fn new(writer: W, options: &TraceOptions) -> Self {
        Self {
            writer: Some(writer),
            open: true,
            complete: true,
            options: options.clone(),
            signals: Vec::new(),
            traced: Vec::new(),
            vcd_ids: Vec::new(),
            current: Vec::new(),
            prev_values: Vec::new(),
            attached: false,
            first_time: None,
            last_time: None,
            records: 0,
            value_changes: 0,
            start_instant: None,
        }
    }

    /// Capture the model's signal table, resolve the signal selection and
    /// write the VCD header. A second call is a no-op.
    pub fn attach<M: Traceable + ?Sized>(&mut self, model: &M) -> HarnessResult<()> {
        if self.attached {
            return Ok(());
        }
        if !self.open {
            return Err(HarnessError::TraceClosed(self.last_time.unwrap_or(0)));
        }

        self.signals = model.signals();
        let n = self.signals.len();
        self.vcd_ids = (0..n).map(idx_to_vcd_id).collect();
        self.current = vec![0; n];
        self.prev_values = vec![0; n];
        self.traced = self.resolve_selection();
        self.start_instant = Some(Instant::now());
        self.attached = true;

        let header = self.render_header();
        self.write_bytes(header.as_bytes(), "header")?;
        debug!(
            traced = self.traced.len(),
            total = n,
            "attached model to VCD trace"
        );
        Ok(())
    }

    fn resolve_selection(&self) -> Vec<usize> {
        if self.options.signals.is_empty() {
            return (0..self.signals.len()).collect();
        }

        let mut selected = vec![false; self.signals.len()];
        for pattern in &self.options.signals {
            let exact = self.signals.iter().position(|s| &s.name == pattern);
            let mut matched = 0usize;
            match exact {
                Some(idx) => {
                    selected[idx] = true;
                    matched = 1;
                }
                None => {
                    for (idx, sig) in self.signals.iter().enumerate() {
                        if sig.name.contains(pattern.as_str()) {
                            selected[idx] = true;
                            matched += 1;
                        }
                    }
                }
            }
            if matched == 0 {
                warn!(pattern = %pattern, "trace selection matches no signal");
            }
        }

        selected
            .iter()
            .enumerate()
            .filter_map(|(idx, &on)| on.then_some(idx))
            .collect()
    }

    fn render_header(&self) -> String {
        let mut header = String::new();
        let _ = writeln!(header, "$timescale {} $end", self.options.timescale);
        let _ = writeln!(header, "$scope module {} $end", self.options.module_name);
        for &idx in &self.traced {
            let sig = &self.signals[idx];
            let _ = writeln!(
                header,
                "$var wire {} {} {} $end",
                sig.width.max(1),
                self.vcd_ids[idx],
                sanitize_name(&sig.name)
            );
        }
        header.push_str("$upscope $end\n");
        header.push_str("$enddefinitions $end\n");
        header
    }

    /// Record one snapshot of `model` at `time`.
    pub fn dump<M: Traceable + ?Sized>(&mut self, time: SimTime, model: &M) -> HarnessResult<()> {
        if !self.open {
            return Err(HarnessError::TraceClosed(time));
        }
        if let Some(last) = self.last_time {
            if time <= last {
                return Err(HarnessError::TraceOrder { time, last });
            }
        }
        if !self.attached {
            self.attach(model)?;
        }

        model.sample(&mut self.current);

        let mut record = String::new();
        let _ = writeln!(record, "#{}", time);

        let mut changed = 0u64;
        if self.records == 0 {
            record.push_str("$dumpvars\n");
            for &idx in &self.traced {
                self.push_value(&mut record, idx);
            }
            record.push_str("$end\n");
        } else {
            for &idx in &self.traced {
                if self.current[idx] != self.prev_values[idx] {
                    self.push_value(&mut record, idx);
                    changed += 1;
                }
            }
        }

        self.write_bytes(record.as_bytes(), &format!("t={}", time))?;

        self.prev_values.copy_from_slice(&self.current);
        self.value_changes += changed;
        self.records += 1;
        self.first_time.get_or_insert(time);
        self.last_time = Some(time);
        Ok(())
    }

    fn push_value(&self, out: &mut String, idx: usize) {
        let width = self.signals[idx].width.max(1);
        out.push_str(&format_value(self.current[idx], width, &self.vcd_ids[idx]));
        out.push('\n');
    }

    fn write_bytes(&mut self, bytes: &[u8], context: &str) -> HarnessResult<()> {
        let Some(writer) = self.writer.as_mut() else {
            return Err(HarnessError::TraceClosed(self.last_time.unwrap_or(0)));
        };
        if let Err(source) = writer.write_all(bytes).and_then(|()| writer.flush()) {
            self.complete = false;
            return Err(HarnessError::TraceWrite {
                context: context.to_string(),
                source,
            });
        }
        Ok(())
    }

    /// Flush and release the sink. Calling it again is a no-op.
    pub fn close(&mut self) -> HarnessResult<()> {
        if !self.open {
            return Ok(());
        }
        self.open = false;

        let records = self.records;
        let incomplete = !self.complete;
        let Some(writer) = self.writer.as_mut() else {
            return Ok(());
        };

        if incomplete {
            let marker = format!("$comment trace incomplete after {} records $end\n", records);
            if writer.write_all(marker.as_bytes()).is_err() {
                warn!("could not append incomplete-trace marker");
            }
        }

        let flushed = writer.flush();
        debug!(records, complete = self.complete, "closed VCD trace");
        if let Err(source) = flushed {
            self.complete = false;
            return Err(HarnessError::TraceWrite {
                context: "flush".to_string(),
                source,
            });
        }
        Ok(())
    }

    /// Close the recorder and hand back the sink.
    pub fn into_inner(mut self) -> HarnessResult<W> {
        self.close()?;
        self.writer
            .take()
            .ok_or(HarnessError::TraceClosed(self.last_time.unwrap_or(0)))
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    /// False once any write to the sink has failed.
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Number of `#time` records written.
    pub fn records(&self) -> u64 {
        self.records
    }

    pub fn last_time(&self) -> Option<SimTime> {
        self.last_time
    }

    /// Names of the signals written to the trace.
    pub fn traced_signal_names(&self) -> Vec<&str> {
        self.traced.iter().map(|&i| self.signals[i].name.as_str()).collect()
    }

    pub fn stats(&self) -> TraceStats {
        TraceStats {
            records: self.records,
            value_changes: self.value_changes,
            traced_signals: self.traced.len(),
            total_signals: self.signals.len(),
            time_range: self.first_time.zip(self.last_time),
            complete: self.complete,
            elapsed: self.start_instant.map(|t| t.elapsed()),
        }
    }
}

impl<W: Write> Drop for VcdRecorder<W> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("VCD trace close on drop failed: {}", e);
        }
    }
}

/// Statistics about a VCD trace
#[derive(Debug, Clone)]
pub struct TraceStats {
    pub records: u64,
    /// Value changes written after the initial `$dumpvars` block
    pub value_changes: u64,
    pub traced_signals: usize,
    pub total_signals: usize,
    /// First and last dumped timestamps
    pub time_range: Option<(SimTime, SimTime)>,
    pub complete: bool,
    pub elapsed: Option<Duration>,
}

/// Convert a signal index to a VCD identifier (printable ASCII 33-126)
fn idx_to_vcd_id(idx: usize) -> String {
    const BASE: usize = 94;
    const OFFSET: u8 = b'!';

    let mut id = Vec::new();
    let mut n = idx;
    loop {
        id.push(OFFSET + (n % BASE) as u8);
        n /= BASE;
        if n == 0 {
            break;
        }
        n -= 1;
    }
    id.reverse();
    String::from_utf8(id).unwrap_or_default()
}

fn format_value(value: u64, width: usize, vcd_id: &str) -> String {
    if width == 1 {
        format!("{}{}", value & 1, vcd_id)
    } else {
        let masked = if width >= 64 {
            value
        } else {
            value & ((1u64 << width) - 1)
        };
        format!("b{:0width$b} {}", masked, vcd_id, width = width)
    }
}

fn sanitize_name(name: &str) -> String {
    name.chars()
        .filter(|&c| c != ']')
        .map(|c| match c {
            '.' | '[' => '_',
            c if c.is_whitespace() => '_',
            c => c,
        })
        .collect()
}
