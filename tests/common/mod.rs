#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::io::{self, Write};
use std::path::Path;
use std::rc::Rc;

use cycle_harness::{DeviceUnderTest, SignalInfo, Traceable};

/// 4-bit counter clocked by `clk`; `done` goes high when the count is 5.
pub const COUNTER_IR: &str = r#"{
    "name": "counter",
    "ports": [
        {"name": "clk", "direction": "in", "width": 1},
        {"name": "rst", "direction": "in", "width": 1},
        {"name": "done", "direction": "out", "width": 1}
    ],
    "regs": [{"name": "count", "width": 4, "reset_value": 0}],
    "assigns": [
        {"target": "done", "expr": {"type": "binary_op", "op": "==",
            "left": {"type": "signal", "name": "count", "width": 4},
            "right": {"type": "literal", "value": 5, "width": 4}, "width": 1}}
    ],
    "processes": [{"name": "seq", "clock": "clk", "clocked": true, "statements": [
        {"target": "count", "expr": {"type": "mux",
            "condition": {"type": "signal", "name": "rst", "width": 1},
            "when_true": {"type": "literal", "value": 0, "width": 4},
            "when_false": {"type": "binary_op", "op": "+",
                "left": {"type": "signal", "name": "count", "width": 4},
                "right": {"type": "literal", "value": 1, "width": 4}, "width": 4},
            "width": 4}}
    ]}]
}"#;

/// Observations that outlive the model.
#[derive(Default, Clone)]
pub struct Probe {
    pub evaluations: Rc<Cell<u64>>,
    pub dropped: Rc<Cell<bool>>,
}

/// Model that asserts finish during a chosen tick (or never).
pub struct ScriptedDut {
    finish_at: Option<u64>,
    evaluations: u64,
    probe: Probe,
}

impl ScriptedDut {
    pub fn new(finish_at: Option<u64>, probe: &Probe) -> Self {
        Self {
            finish_at,
            evaluations: 0,
            probe: probe.clone(),
        }
    }
}

impl DeviceUnderTest for ScriptedDut {
    fn evaluate(&mut self) {
        self.evaluations += 1;
        self.probe.evaluations.set(self.evaluations);
    }

    fn is_finished(&self) -> bool {
        self.finish_at.is_some_and(|k| self.evaluations > k)
    }
}

impl Traceable for ScriptedDut {
    fn signals(&self) -> Vec<SignalInfo> {
        vec![SignalInfo::new("tick", 32), SignalInfo::new("finish", 1)]
    }

    fn sample(&self, out: &mut [u64]) {
        out[0] = self.evaluations;
        out[1] = self.is_finished() as u64;
    }
}

impl Drop for ScriptedDut {
    fn drop(&mut self) {
        self.probe.dropped.set(true);
    }
}

/// Sink whose `fail_at`-th write (counting from 0) fails; every other
/// write lands in `data`.
pub struct FailingWriter {
    pub data: Rc<RefCell<Vec<u8>>>,
    fail_at: usize,
    writes: usize,
}

impl FailingWriter {
    pub fn new(fail_at: usize) -> Self {
        Self {
            data: Rc::default(),
            fail_at,
            writes: 0,
        }
    }
}

impl Write for FailingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.writes;
        self.writes += 1;
        if n == self.fail_at {
            return Err(io::Error::new(io::ErrorKind::Other, "no space left on device"));
        }
        self.data.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// `#time` stamps in a VCD file, in file order.
pub fn timestamps(path: &Path) -> Vec<u64> {
    std::fs::read_to_string(path)
        .unwrap()
        .lines()
        .filter_map(|l| l.strip_prefix('#'))
        .map(|t| t.parse().unwrap())
        .collect()
}
