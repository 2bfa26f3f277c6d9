//! Behaviour-IR model - the harness's built-in device under test
//!
//! Loads a JSON module description (ports, nets, regs, combinational assigns,
//! clocked processes, memories) and interprets it:
//! - Combinational assigns are topologically ordered and compiled to a flat
//!   instruction list with pre-resolved signal indices
//! - Clocked processes compute next-register values before the edge and
//!   commit them on the rising edge of their clock
//! - Optional stimulus: a free-running clock input (one tick = one
//!   half-period) and a reset input held for the first N ticks
//! - An optional finish signal latches completion once it goes non-zero

use std::collections::{HashMap, HashSet};
use std::path::Path;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::dut::{DeviceUnderTest, SignalInfo, Traceable};
use crate::error::{HarnessError, HarnessResult};

// ============================================================================
// IR description (JSON)
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    In,
    Out,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IrPort {
    pub name: String,
    pub direction: Direction,
    pub width: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IrNet {
    pub name: String,
    pub width: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IrReg {
    pub name: String,
    pub width: usize,
    #[serde(default)]
    pub reset_value: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IrExpr {
    Signal { name: String, width: usize },
    Literal { value: i64, width: usize },
    UnaryOp {
        op: String,
        operand: Box<IrExpr>,
        width: usize,
    },
    BinaryOp {
        op: String,
        left: Box<IrExpr>,
        right: Box<IrExpr>,
        width: usize,
    },
    Mux {
        condition: Box<IrExpr>,
        when_true: Box<IrExpr>,
        when_false: Box<IrExpr>,
        width: usize,
    },
    Slice {
        base: Box<IrExpr>,
        low: usize,
        high: usize,
        width: usize,
    },
    Concat { parts: Vec<IrExpr>, width: usize },
    Resize { expr: Box<IrExpr>, width: usize },
    MemRead {
        memory: String,
        addr: Box<IrExpr>,
        width: usize,
    },
}

impl IrExpr {
    fn width(&self) -> usize {
        match self {
            IrExpr::Signal { width, .. }
            | IrExpr::Literal { width, .. }
            | IrExpr::UnaryOp { width, .. }
            | IrExpr::BinaryOp { width, .. }
            | IrExpr::Mux { width, .. }
            | IrExpr::Slice { width, .. }
            | IrExpr::Concat { width, .. }
            | IrExpr::Resize { width, .. }
            | IrExpr::MemRead { width, .. } => *width,
        }
    }

    /// Names of all signals this expression reads.
    fn collect_reads<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            IrExpr::Signal { name, .. } => out.push(name),
            IrExpr::Literal { .. } => {}
            IrExpr::UnaryOp { operand, .. } => operand.collect_reads(out),
            IrExpr::BinaryOp { left, right, .. } => {
                left.collect_reads(out);
                right.collect_reads(out);
            }
            IrExpr::Mux { condition, when_true, when_false, .. } => {
                condition.collect_reads(out);
                when_true.collect_reads(out);
                when_false.collect_reads(out);
            }
            IrExpr::Slice { base, .. } => base.collect_reads(out),
            IrExpr::Concat { parts, .. } => parts.iter().for_each(|p| p.collect_reads(out)),
            IrExpr::Resize { expr, .. } => expr.collect_reads(out),
            IrExpr::MemRead { addr, .. } => addr.collect_reads(out),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct IrAssign {
    pub target: String,
    pub expr: IrExpr,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IrProcess {
    #[serde(default)]
    pub name: String,
    pub clock: Option<String>,
    pub clocked: bool,
    pub statements: Vec<IrAssign>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IrMemory {
    pub name: String,
    pub depth: usize,
    pub width: usize,
    #[serde(default)]
    pub initial_data: Vec<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IrModule {
    #[serde(default)]
    pub name: String,
    pub ports: Vec<IrPort>,
    #[serde(default)]
    pub nets: Vec<IrNet>,
    #[serde(default)]
    pub regs: Vec<IrReg>,
    #[serde(default)]
    pub assigns: Vec<IrAssign>,
    #[serde(default)]
    pub processes: Vec<IrProcess>,
    #[serde(default)]
    pub memories: Vec<IrMemory>,
}

// ============================================================================
// Flat instruction model
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Src {
    Sig(usize),
    Imm(u64),
    Tmp(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UnaryOp {
    Not,
    ReduceAnd,
    ReduceOr,
    ReduceXor,
    Copy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinaryOp {
    And,
    Or,
    Xor,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Shl,
    Shr,
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
}

#[derive(Debug, Clone, Copy)]
enum Instr {
    Unary {
        op: UnaryOp,
        src: Src,
        operand_mask: u64,
        dst: usize,
        mask: u64,
    },
    Binary {
        op: BinaryOp,
        lhs: Src,
        rhs: Src,
        dst: usize,
        mask: u64,
    },
    Mux {
        cond: Src,
        when_true: Src,
        when_false: Src,
        dst: usize,
        mask: u64,
    },
    Slice {
        src: Src,
        low: u32,
        dst: usize,
        mask: u64,
    },
    Zero { dst: usize },
    ConcatPart {
        src: Src,
        shift: u32,
        part_mask: u64,
        dst: usize,
    },
    MemRead {
        mem: usize,
        addr: Src,
        dst: usize,
        mask: u64,
    },
    /// Write a value into the signal table
    Store { src: Src, signal: usize, mask: u64 },
    /// Write a value into the next-register buffer
    StoreNext { src: Src, slot: usize, mask: u64 },
}

#[inline]
pub fn compute_mask(width: usize) -> u64 {
    if width >= 64 {
        u64::MAX
    } else {
        (1u64 << width) - 1
    }
}

#[inline(always)]
fn read(src: Src, signals: &[u64], temps: &[u64]) -> u64 {
    match src {
        Src::Sig(i) => signals[i],
        Src::Imm(v) => v,
        Src::Tmp(i) => temps[i],
    }
}

fn binary(op: BinaryOp, l: u64, r: u64) -> u64 {
    match op {
        BinaryOp::And => l & r,
        BinaryOp::Or => l | r,
        BinaryOp::Xor => l ^ r,
        BinaryOp::Add => l.wrapping_add(r),
        BinaryOp::Sub => l.wrapping_sub(r),
        BinaryOp::Mul => l.wrapping_mul(r),
        BinaryOp::Div => l.checked_div(r).unwrap_or(0),
        BinaryOp::Mod => l.checked_rem(r).unwrap_or(0),
        BinaryOp::Shl => l.checked_shl(r.min(64) as u32).unwrap_or(0),
        BinaryOp::Shr => l.checked_shr(r.min(64) as u32).unwrap_or(0),
        BinaryOp::Eq => (l == r) as u64,
        BinaryOp::Ne => (l != r) as u64,
        BinaryOp::Lt => (l < r) as u64,
        BinaryOp::Gt => (l > r) as u64,
        BinaryOp::Le => (l <= r) as u64,
        BinaryOp::Ge => (l >= r) as u64,
    }
}

fn execute(
    program: &[Instr],
    signals: &mut [u64],
    temps: &mut [u64],
    memories: &[Vec<u64>],
    next_regs: &mut [u64],
) {
    for instr in program {
        match *instr {
            Instr::Unary { op, src, operand_mask, dst, mask } => {
                let v = read(src, signals, temps);
                temps[dst] = match op {
                    UnaryOp::Not => !v & mask,
                    UnaryOp::ReduceAnd => ((v & operand_mask) == operand_mask) as u64,
                    UnaryOp::ReduceOr => (v & operand_mask != 0) as u64,
                    UnaryOp::ReduceXor => ((v & operand_mask).count_ones() & 1) as u64,
                    UnaryOp::Copy => v & mask,
                };
            }
            Instr::Binary { op, lhs, rhs, dst, mask } => {
                let l = read(lhs, signals, temps);
                let r = read(rhs, signals, temps);
                temps[dst] = binary(op, l, r) & mask;
            }
            Instr::Mux { cond, when_true, when_false, dst, mask } => {
                let v = if read(cond, signals, temps) != 0 {
                    read(when_true, signals, temps)
                } else {
                    read(when_false, signals, temps)
                };
                temps[dst] = v & mask;
            }
            Instr::Slice { src, low, dst, mask } => {
                temps[dst] = read(src, signals, temps).checked_shr(low).unwrap_or(0) & mask;
            }
            Instr::Zero { dst } => temps[dst] = 0,
            Instr::ConcatPart { src, shift, part_mask, dst } => {
                let part = read(src, signals, temps) & part_mask;
                temps[dst] |= part.checked_shl(shift).unwrap_or(0);
            }
            Instr::MemRead { mem, addr, dst, mask } => {
                let a = read(addr, signals, temps) as usize;
                temps[dst] = memories[mem].get(a).copied().unwrap_or(0) & mask;
            }
            Instr::Store { src, signal, mask } => {
                signals[signal] = read(src, signals, temps) & mask;
            }
            Instr::StoreNext { src, slot, mask } => {
                next_regs[slot] = read(src, signals, temps) & mask;
            }
        }
    }
}

fn alloc_temp(next: &mut usize, max: &mut usize) -> usize {
    let t = *next;
    *next += 1;
    *max = (*max).max(*next);
    t
}

/// Expression compiler state shared across all assigns of one module.
struct Compiler<'a> {
    name_to_idx: &'a HashMap<String, usize>,
    mem_to_idx: &'a HashMap<String, usize>,
    widths: &'a [usize],
    max_temps: usize,
}

impl Compiler<'_> {
    /// Compile `expr` into `out` and return where its value ends up.
    /// Temporaries are reused per top-level assign.
    fn compile(&mut self, expr: &IrExpr, out: &mut Vec<Instr>, next_tmp: &mut usize) -> Src {
        match expr {
            // Unknown signals read as 0
            IrExpr::Signal { name, .. } => match self.name_to_idx.get(name) {
                Some(&idx) => Src::Sig(idx),
                None => Src::Imm(0),
            },
            IrExpr::Literal { value, width } => Src::Imm((*value as u64) & compute_mask(*width)),
            IrExpr::UnaryOp { op, operand, width } => {
                let src = self.compile(operand, out, next_tmp);
                let operand_mask = compute_mask(self.width_of(operand));
                let op = match op.as_str() {
                    "~" | "not" | "!" => UnaryOp::Not,
                    "&" | "reduce_and" => UnaryOp::ReduceAnd,
                    "|" | "reduce_or" => UnaryOp::ReduceOr,
                    "^" | "reduce_xor" => UnaryOp::ReduceXor,
                    _ => UnaryOp::Copy,
                };
                let dst = alloc_temp(next_tmp, &mut self.max_temps);
                out.push(Instr::Unary {
                    op,
                    src,
                    operand_mask,
                    dst,
                    mask: compute_mask(*width),
                });
                Src::Tmp(dst)
            }
            IrExpr::BinaryOp { op, left, right, width } => {
                let lhs = self.compile(left, out, next_tmp);
                let rhs = self.compile(right, out, next_tmp);
                let op = match op.as_str() {
                    "&" => BinaryOp::And,
                    "|" => BinaryOp::Or,
                    "^" => BinaryOp::Xor,
                    "+" => BinaryOp::Add,
                    "-" => BinaryOp::Sub,
                    "*" => BinaryOp::Mul,
                    "/" => BinaryOp::Div,
                    "%" => BinaryOp::Mod,
                    "<<" => BinaryOp::Shl,
                    ">>" => BinaryOp::Shr,
                    "==" => BinaryOp::Eq,
                    "!=" => BinaryOp::Ne,
                    "<" => BinaryOp::Lt,
                    ">" => BinaryOp::Gt,
                    "<=" | "le" => BinaryOp::Le,
                    ">=" => BinaryOp::Ge,
                    other => {
                        warn!(op = other, "unsupported binary operator, treating as '&'");
                        BinaryOp::And
                    }
                };
                let dst = alloc_temp(next_tmp, &mut self.max_temps);
                out.push(Instr::Binary {
                    op,
                    lhs,
                    rhs,
                    dst,
                    mask: compute_mask(*width),
                });
                Src::Tmp(dst)
            }
            IrExpr::Mux { condition, when_true, when_false, width } => {
                let cond = self.compile(condition, out, next_tmp);
                let t = self.compile(when_true, out, next_tmp);
                let f = self.compile(when_false, out, next_tmp);
                let dst = alloc_temp(next_tmp, &mut self.max_temps);
                out.push(Instr::Mux {
                    cond,
                    when_true: t,
                    when_false: f,
                    dst,
                    mask: compute_mask(*width),
                });
                Src::Tmp(dst)
            }
            IrExpr::Slice { base, low, width, .. } => {
                let src = self.compile(base, out, next_tmp);
                let dst = alloc_temp(next_tmp, &mut self.max_temps);
                out.push(Instr::Slice {
                    src,
                    low: (*low).min(64) as u32,
                    dst,
                    mask: compute_mask(*width),
                });
                Src::Tmp(dst)
            }
            IrExpr::Concat { parts, width } => {
                let dst = alloc_temp(next_tmp, &mut self.max_temps);
                out.push(Instr::Zero { dst });
                // Last part is least significant
                let mut shift = 0usize;
                for part in parts.iter().rev() {
                    let src = self.compile(part, out, next_tmp);
                    let part_width = self.width_of(part);
                    out.push(Instr::ConcatPart {
                        src,
                        shift: shift.min(64) as u32,
                        part_mask: compute_mask(part_width),
                        dst,
                    });
                    shift += part_width;
                }
                let masked = alloc_temp(next_tmp, &mut self.max_temps);
                out.push(Instr::Unary {
                    op: UnaryOp::Copy,
                    src: Src::Tmp(dst),
                    operand_mask: u64::MAX,
                    dst: masked,
                    mask: compute_mask(*width),
                });
                Src::Tmp(masked)
            }
            IrExpr::Resize { expr, width } => {
                let src = self.compile(expr, out, next_tmp);
                let dst = alloc_temp(next_tmp, &mut self.max_temps);
                out.push(Instr::Unary {
                    op: UnaryOp::Copy,
                    src,
                    operand_mask: u64::MAX,
                    dst,
                    mask: compute_mask(*width),
                });
                Src::Tmp(dst)
            }
            // Unknown memories read as 0
            IrExpr::MemRead { memory, addr, width } => match self.mem_to_idx.get(memory) {
                Some(&mem) => {
                    let addr = self.compile(addr, out, next_tmp);
                    let dst = alloc_temp(next_tmp, &mut self.max_temps);
                    out.push(Instr::MemRead {
                        mem,
                        addr,
                        dst,
                        mask: compute_mask(*width),
                    });
                    Src::Tmp(dst)
                }
                None => Src::Imm(0),
            },
        }
    }

    /// Declared width of a referenced signal wins over the width in the expression.
    fn width_of(&self, expr: &IrExpr) -> usize {
        match expr {
            IrExpr::Signal { name, width } => self
                .name_to_idx
                .get(name)
                .and_then(|&i| self.widths.get(i).copied())
                .unwrap_or(*width),
            other => other.width(),
        }
    }
}

/// Order combinational assigns so every assign runs after the assigns that
/// drive the signals it reads. Assigns caught in a combinational loop keep
/// their source order and run last.
fn topological_order(assigns: &[IrAssign]) -> Vec<usize> {
    let mut drivers: HashMap<&str, Vec<usize>> = HashMap::new();
    for (i, a) in assigns.iter().enumerate() {
        drivers.entry(a.target.as_str()).or_default().push(i);
    }

    let deps: Vec<HashSet<usize>> = assigns
        .iter()
        .enumerate()
        .map(|(i, a)| {
            let mut reads = Vec::new();
            a.expr.collect_reads(&mut reads);
            reads
                .into_iter()
                .filter_map(|name| drivers.get(name))
                .flatten()
                .copied()
                .filter(|&d| d != i)
                .collect()
        })
        .collect();

    let n = assigns.len();
    let mut level: Vec<Option<usize>> = vec![None; n];
    let mut levels: Vec<Vec<usize>> = Vec::new();
    loop {
        let mut progress = false;
        for i in 0..n {
            if level[i].is_some() {
                continue;
            }
            let mut max_dep: Option<usize> = None;
            let mut ready = true;
            for &d in &deps[i] {
                match level[d] {
                    Some(l) => max_dep = Some(max_dep.map_or(l, |m| m.max(l))),
                    None => {
                        ready = false;
                        break;
                    }
                }
            }
            if ready {
                let my_level = max_dep.map_or(0, |l| l + 1);
                level[i] = Some(my_level);
                if levels.len() <= my_level {
                    levels.resize_with(my_level + 1, Vec::new);
                }
                levels[my_level].push(i);
                progress = true;
            }
        }
        if !progress {
            break;
        }
    }

    let mut order: Vec<usize> = levels.into_iter().flatten().collect();
    let cyclic: Vec<usize> = (0..n).filter(|&i| level[i].is_none()).collect();
    if !cyclic.is_empty() {
        warn!(count = cyclic.len(), "combinational loop detected, evaluating in source order");
        order.extend(cyclic);
    }
    order
}

// ============================================================================
// Model
// ============================================================================

/// Stimulus and completion wiring for an [`IrModel`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IrModelOptions {
    /// Signal toggled on every evaluation (free-running clock)
    pub clock: Option<String>,
    /// Signal held asserted for the first `reset_ticks` evaluations
    pub reset: Option<String>,
    pub reset_ticks: u64,
    pub reset_active_low: bool,
    /// Signal whose non-zero value ends the run
    pub finish: Option<String>,
}

/// Upper bound on edge/settle passes per evaluation (derived clocks)
const MAX_EDGE_PASSES: usize = 10;

pub struct IrModel {
    name: String,
    signals: Vec<u64>,
    widths: Vec<usize>,
    names: Vec<String>,
    name_to_idx: HashMap<String, usize>,
    temps: Vec<u64>,
    memories: Vec<Vec<u64>>,
    comb_program: Vec<Instr>,
    seq_program: Vec<Instr>,
    next_regs: Vec<u64>,
    /// Unique clock signals driving clocked processes
    clock_indices: Vec<usize>,
    /// Clock values as of the end of the previous evaluation
    prev_clocks: Vec<u64>,
    /// Per clock: (next-register slot, target signal)
    clock_domains: Vec<Vec<(usize, usize)>>,
    stimulus_clock: Option<usize>,
    reset: Option<usize>,
    reset_ticks: u64,
    reset_active_low: bool,
    finish_signal: Option<usize>,
    finished: bool,
    evaluations: u64,
}

impl IrModel {
    /// Read and build a model from an IR JSON file.
    pub fn load(path: impl AsRef<Path>, options: &IrModelOptions) -> HarnessResult<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            HarnessError::ModelConstruction(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json(&json, options)
    }

    pub fn from_json(json: &str, options: &IrModelOptions) -> HarnessResult<Self> {
        // Deeply nested expression trees exceed serde_json's default depth
        let mut deserializer = serde_json::Deserializer::from_str(json);
        deserializer.disable_recursion_limit();
        let ir: IrModule = serde::Deserialize::deserialize(&mut deserializer)
            .map_err(|e| {
                HarnessError::ModelConstruction(format!("failed to parse IR JSON: {}", e))
            })?;
        Self::build(ir, options)
    }

    pub fn build(ir: IrModule, options: &IrModelOptions) -> HarnessResult<Self> {
        let mut signals = Vec::new();
        let mut widths = Vec::new();
        let mut names = Vec::new();
        let mut name_to_idx = HashMap::new();

        // Ports, then nets, then registers (at their reset values)
        let declared = ir
            .ports
            .iter()
            .map(|p| (&p.name, p.width, 0))
            .chain(ir.nets.iter().map(|n| (&n.name, n.width, 0)))
            .chain(ir.regs.iter().map(|r| (&r.name, r.width, r.reset_value.unwrap_or(0))));
        for (name, width, init) in declared {
            if name_to_idx.insert(name.clone(), signals.len()).is_some() {
                return Err(HarnessError::ModelConstruction(format!(
                    "signal '{}' declared more than once",
                    name
                )));
            }
            signals.push(init & compute_mask(width));
            widths.push(width);
            names.push(name.clone());
        }

        let mut mem_to_idx = HashMap::new();
        let mut memories = Vec::with_capacity(ir.memories.len());
        for mem in &ir.memories {
            let mut data = vec![0u64; mem.depth];
            let n = mem.initial_data.len().min(mem.depth);
            data[..n].copy_from_slice(&mem.initial_data[..n]);
            mem_to_idx.insert(mem.name.clone(), memories.len());
            memories.push(data);
        }

        let mut compiler = Compiler {
            name_to_idx: &name_to_idx,
            mem_to_idx: &mem_to_idx,
            widths: &widths,
            max_temps: 0,
        };

        let mut comb_program = Vec::new();
        for i in topological_order(&ir.assigns) {
            let assign = &ir.assigns[i];
            let Some(&signal) = name_to_idx.get(&assign.target) else {
                debug!(signal = %assign.target, "skipping assign to undeclared signal");
                continue;
            };
            let mut next_tmp = 0;
            let src = compiler.compile(&assign.expr, &mut comb_program, &mut next_tmp);
            comb_program.push(Instr::Store {
                src,
                signal,
                mask: compute_mask(widths[signal]),
            });
        }

        let mut seq_program = Vec::new();
        let mut clock_indices: Vec<usize> = Vec::new();
        let mut clock_domains: Vec<Vec<(usize, usize)>> = Vec::new();
        let mut slots = 0usize;
        for process in ir.processes.iter().filter(|p| p.clocked) {
            let clock_name = process.clock.as_deref().unwrap_or("clk");
            let clock = *name_to_idx.get(clock_name).ok_or_else(|| {
                HarnessError::ModelConstruction(format!(
                    "process '{}' is clocked by unknown signal '{}'",
                    process.name, clock_name
                ))
            })?;
            let domain = match clock_indices.iter().position(|&c| c == clock) {
                Some(d) => d,
                None => {
                    clock_indices.push(clock);
                    clock_domains.push(Vec::new());
                    clock_indices.len() - 1
                }
            };

            for stmt in &process.statements {
                let Some(&target) = name_to_idx.get(&stmt.target) else {
                    debug!(signal = %stmt.target, "skipping register update of undeclared signal");
                    continue;
                };
                let mut next_tmp = 0;
                let src = compiler.compile(&stmt.expr, &mut seq_program, &mut next_tmp);
                seq_program.push(Instr::StoreNext {
                    src,
                    slot: slots,
                    mask: compute_mask(widths[target]),
                });
                clock_domains[domain].push((slots, target));
                slots += 1;
            }
        }

        let temps = vec![0u64; compiler.max_temps.max(1)];

        let lookup = |name: &Option<String>, role: &str| -> HarnessResult<Option<usize>> {
            match name {
                None => Ok(None),
                Some(n) => name_to_idx.get(n).copied().map(Some).ok_or_else(|| {
                    HarnessError::ModelConstruction(format!(
                        "{} signal '{}' not found in design",
                        role, n
                    ))
                }),
            }
        };
        let stimulus_clock = lookup(&options.clock, "clock")?;
        let reset = lookup(&options.reset, "reset")?;
        let finish_signal = match &options.finish {
            Some(n) => {
                let idx = name_to_idx.get(n).copied();
                if idx.is_none() {
                    warn!(signal = %n, "finish signal not in design, run ends on budget only");
                }
                idx
            }
            None => None,
        };

        let prev_clocks = vec![0; clock_indices.len()];
        let mut model = Self {
            name: ir.name,
            signals,
            widths,
            names,
            name_to_idx,
            temps,
            memories,
            comb_program,
            seq_program,
            next_regs: vec![0; slots],
            clock_indices,
            prev_clocks,
            clock_domains,
            stimulus_clock,
            reset,
            reset_ticks: options.reset_ticks,
            reset_active_low: options.reset_active_low,
            finish_signal,
            finished: false,
            evaluations: 0,
        };

        model.settle();
        for (i, &clk) in model.clock_indices.iter().enumerate() {
            model.prev_clocks[i] = model.signals[clk] & 1;
        }

        debug!(
            module = %model.name,
            signals = model.signals.len(),
            comb_instrs = model.comb_program.len(),
            registers = slots,
            clocks = model.clock_indices.len(),
            "built IR model"
        );
        Ok(model)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of completed evaluations.
    pub fn evaluations(&self) -> u64 {
        self.evaluations
    }

    pub fn poke(&mut self, name: &str, value: u64) -> HarnessResult<()> {
        let idx = *self
            .name_to_idx
            .get(name)
            .ok_or_else(|| HarnessError::UnknownSignal(name.to_string()))?;
        self.signals[idx] = value & compute_mask(self.widths[idx]);
        Ok(())
    }

    pub fn peek(&self, name: &str) -> HarnessResult<u64> {
        self.name_to_idx
            .get(name)
            .map(|&idx| self.signals[idx])
            .ok_or_else(|| HarnessError::UnknownSignal(name.to_string()))
    }

    /// Apply forwarded command-line arguments. `+name=value` pokes a signal
    /// (decimal or `0x` hex); anything else is ignored.
    pub fn apply_plusargs<S: AsRef<str>>(&mut self, args: &[S]) -> HarnessResult<()> {
        for arg in args {
            let arg = arg.as_ref();
            let Some((name, value)) = arg.strip_prefix('+').and_then(|a| a.split_once('=')) else {
                debug!(arg, "ignoring argument");
                continue;
            };
            let parsed = match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
                Some(hex) => u64::from_str_radix(hex, 16),
                None => value.parse::<u64>(),
            }
            .map_err(|e| HarnessError::Config(format!("bad value in '{}': {}", arg, e)))?;
            self.poke(name, parsed)?;
            debug!(signal = name, value = parsed, "applied plusarg");
        }
        Ok(())
    }

    /// Run combinational logic to a fixed point (single pass, assigns are ordered).
    fn settle(&mut self) {
        execute(
            &self.comb_program,
            &mut self.signals,
            &mut self.temps,
            &self.memories,
            &mut self.next_regs,
        );
    }

    fn drive_stimulus(&mut self) {
        if let Some(clk) = self.stimulus_clock {
            self.signals[clk] = (self.signals[clk] ^ 1) & compute_mask(self.widths[clk]);
        }
        if let Some(rst) = self.reset {
            let asserted = self.evaluations < self.reset_ticks;
            let level = asserted != self.reset_active_low;
            self.signals[rst] = level as u64;
        }
    }

    fn step(&mut self) {
        self.drive_stimulus();
        self.settle();

        execute(
            &self.seq_program,
            &mut self.signals,
            &mut self.temps,
            &self.memories,
            &mut self.next_regs,
        );

        let mut committed = vec![false; self.next_regs.len()];
        for _ in 0..MAX_EDGE_PASSES {
            let mut any_edge = false;
            for (d, &clk) in self.clock_indices.iter().enumerate() {
                let now = self.signals[clk] & 1;
                if self.prev_clocks[d] == 0 && now == 1 {
                    any_edge = true;
                    for &(slot, target) in &self.clock_domains[d] {
                        if !committed[slot] {
                            self.signals[target] = self.next_regs[slot];
                            committed[slot] = true;
                        }
                    }
                }
                self.prev_clocks[d] = now;
            }
            if !any_edge {
                break;
            }
            self.settle();
        }

        self.evaluations += 1;
        if let Some(f) = self.finish_signal {
            if self.signals[f] != 0 && !self.finished {
                debug!(evaluation = self.evaluations, "model asserted finish");
                self.finished = true;
            }
        }
    }
}

impl DeviceUnderTest for IrModel {
    fn evaluate(&mut self) {
        self.step();
    }

    fn is_finished(&self) -> bool {
        self.finished
    }
}

impl Traceable for IrModel {
    fn signals(&self) -> Vec<SignalInfo> {
        self.names
            .iter()
            .zip(&self.widths)
            .map(|(n, &w)| SignalInfo::new(n.clone(), w))
            .collect()
    }

    fn sample(&self, out: &mut [u64]) {
        out.copy_from_slice(&self.signals);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 4-bit counter with a synchronous reset and a `done` flag at 5.
    const COUNTER_IR: &str = r#"{
        "name": "counter",
        "ports": [
            {"name": "clk", "direction": "in", "width": 1},
            {"name": "rst", "direction": "in", "width": 1},
            {"name": "done", "direction": "out", "width": 1}
        ],
        "nets": [{"name": "count_next", "width": 4}],
        "regs": [{"name": "count", "width": 4, "reset_value": 0}],
        "assigns": [
            {"target": "done", "expr": {"type": "binary_op", "op": "==",
                "left": {"type": "signal", "name": "count", "width": 4},
                "right": {"type": "literal", "value": 5, "width": 4}, "width": 1}},
            {"target": "count_next", "expr": {"type": "binary_op", "op": "+",
                "left": {"type": "signal", "name": "count", "width": 4},
                "right": {"type": "literal", "value": 1, "width": 4}, "width": 4}}
        ],
        "processes": [{"name": "seq", "clock": "clk", "clocked": true, "statements": [
            {"target": "count", "expr": {"type": "mux",
                "condition": {"type": "signal", "name": "rst", "width": 1},
                "when_true": {"type": "literal", "value": 0, "width": 4},
                "when_false": {"type": "signal", "name": "count_next", "width": 4},
                "width": 4}}
        ]}]
    }"#;

    fn counter(options: IrModelOptions) -> IrModel {
        IrModel::from_json(COUNTER_IR, &options).unwrap()
    }

    fn clocked() -> IrModelOptions {
        IrModelOptions {
            clock: Some("clk".into()),
            finish: Some("done".into()),
            ..IrModelOptions::default()
        }
    }

    #[test]
    fn test_signal_table_order_and_widths() {
        let model = counter(IrModelOptions::default());
        let names: Vec<_> = model.signals().into_iter().map(|s| (s.name, s.width)).collect();
        assert_eq!(
            names,
            vec![
                ("clk".to_string(), 1),
                ("rst".to_string(), 1),
                ("done".to_string(), 1),
                ("count_next".to_string(), 4),
                ("count".to_string(), 4),
            ]
        );
    }

    #[test]
    fn test_initial_settle_drives_combinational_nets() {
        let model = counter(IrModelOptions::default());
        assert_eq!(model.peek("count_next").unwrap(), 1);
        assert_eq!(model.peek("done").unwrap(), 0);
    }

    #[test]
    fn test_free_running_clock_counts_on_rising_edges() {
        let mut model = counter(clocked());
        // Tick 0 is a rising edge, tick 1 falling, tick 2 rising...
        model.evaluate();
        assert_eq!(model.peek("clk").unwrap(), 1);
        assert_eq!(model.peek("count").unwrap(), 1);
        model.evaluate();
        assert_eq!(model.peek("count").unwrap(), 1);
        model.evaluate();
        assert_eq!(model.peek("count").unwrap(), 2);
        assert_eq!(model.evaluations(), 3);
    }

    #[test]
    fn test_finish_latches_and_stays_asserted() {
        let mut model = counter(clocked());
        let mut finished_at = None;
        for tick in 0..40u64 {
            model.evaluate();
            if model.is_finished() && finished_at.is_none() {
                finished_at = Some(tick);
            }
        }
        // count reaches 5 on the 5th rising edge: tick 8
        assert_eq!(finished_at, Some(8));
        // The counter keeps wrapping past 5 but completion stays latched
        assert_ne!(model.peek("count").unwrap(), 5);
        assert!(model.is_finished());
    }

    #[test]
    fn test_reset_hold_keeps_registers_cleared() {
        let mut model = counter(IrModelOptions {
            reset: Some("rst".into()),
            reset_ticks: 4,
            ..clocked()
        });
        for _ in 0..4 {
            model.evaluate();
            assert_eq!(model.peek("rst").unwrap(), 1);
            assert_eq!(model.peek("count").unwrap(), 0);
        }
        model.evaluate();
        assert_eq!(model.peek("rst").unwrap(), 0);
        assert_eq!(model.peek("count").unwrap(), 1);
    }

    #[test]
    fn test_active_low_reset_level() {
        let mut model = counter(IrModelOptions {
            reset: Some("rst".into()),
            reset_ticks: 1,
            reset_active_low: true,
            ..clocked()
        });
        model.evaluate();
        assert_eq!(model.peek("rst").unwrap(), 0);
        model.evaluate();
        assert_eq!(model.peek("rst").unwrap(), 1);
    }

    #[test]
    fn test_missing_stimulus_signal_fails_construction() {
        let err = IrModel::from_json(
            COUNTER_IR,
            &IrModelOptions {
                clock: Some("sys_clk".into()),
                ..IrModelOptions::default()
            },
        )
        .err()
        .unwrap();
        assert!(matches!(err, HarnessError::ModelConstruction(ref m) if m.contains("sys_clk")));
    }

    #[test]
    fn test_missing_finish_signal_is_not_fatal() {
        let mut model = counter(IrModelOptions {
            finish: Some("tb_done".into()),
            ..IrModelOptions::default()
        });
        model.evaluate();
        assert!(!model.is_finished());
    }

    #[test]
    fn test_bad_json_and_duplicates_fail_construction() {
        assert!(matches!(
            IrModel::from_json("{not json", &IrModelOptions::default()),
            Err(HarnessError::ModelConstruction(_))
        ));

        let dup = r#"{"ports": [{"name": "a", "direction": "in", "width": 1}],
                      "nets": [{"name": "a", "width": 1}]}"#;
        assert!(matches!(
            IrModel::from_json(dup, &IrModelOptions::default()),
            Err(HarnessError::ModelConstruction(ref m)) if m.contains("more than once")
        ));
    }

    #[test]
    fn test_assign_order_does_not_depend_on_source_order() {
        // b depends on a, but b's assign comes first
        let ir = r#"{
            "ports": [{"name": "x", "direction": "in", "width": 8}],
            "nets": [{"name": "a", "width": 8}, {"name": "b", "width": 8}],
            "assigns": [
                {"target": "b", "expr": {"type": "binary_op", "op": "+",
                    "left": {"type": "signal", "name": "a", "width": 8},
                    "right": {"type": "literal", "value": 1, "width": 8}, "width": 8}},
                {"target": "a", "expr": {"type": "binary_op", "op": "*",
                    "left": {"type": "signal", "name": "x", "width": 8},
                    "right": {"type": "literal", "value": 2, "width": 8}, "width": 8}}
            ]
        }"#;
        let mut model = IrModel::from_json(ir, &IrModelOptions::default()).unwrap();
        model.poke("x", 20).unwrap();
        model.evaluate();
        assert_eq!(model.peek("a").unwrap(), 40);
        assert_eq!(model.peek("b").unwrap(), 41);
    }

    #[test]
    fn test_expression_operators() {
        let ir = r#"{
            "ports": [{"name": "x", "direction": "in", "width": 8}],
            "nets": [
                {"name": "slice", "width": 4},
                {"name": "cat", "width": 12},
                {"name": "rxor", "width": 1},
                {"name": "inv", "width": 8},
                {"name": "div0", "width": 8},
                {"name": "mem", "width": 8}
            ],
            "assigns": [
                {"target": "slice", "expr": {"type": "slice",
                    "base": {"type": "signal", "name": "x", "width": 8},
                    "low": 4, "high": 7, "width": 4}},
                {"target": "cat", "expr": {"type": "concat", "width": 12, "parts": [
                    {"type": "literal", "value": 10, "width": 4},
                    {"type": "signal", "name": "x", "width": 8}]}},
                {"target": "rxor", "expr": {"type": "unary_op", "op": "^",
                    "operand": {"type": "signal", "name": "x", "width": 8}, "width": 1}},
                {"target": "inv", "expr": {"type": "unary_op", "op": "~",
                    "operand": {"type": "signal", "name": "x", "width": 8}, "width": 8}},
                {"target": "div0", "expr": {"type": "binary_op", "op": "/",
                    "left": {"type": "signal", "name": "x", "width": 8},
                    "right": {"type": "literal", "value": 0, "width": 8}, "width": 8}},
                {"target": "mem", "expr": {"type": "mem_read", "memory": "rom", "width": 8,
                    "addr": {"type": "literal", "value": 2, "width": 2}}}
            ],
            "memories": [{"name": "rom", "depth": 4, "width": 8, "initial_data": [1, 2, 99]}]
        }"#;
        let mut model = IrModel::from_json(ir, &IrModelOptions::default()).unwrap();
        model.poke("x", 0xB5).unwrap();
        model.evaluate();
        assert_eq!(model.peek("slice").unwrap(), 0xB);
        assert_eq!(model.peek("cat").unwrap(), 0xAB5);
        assert_eq!(model.peek("rxor").unwrap(), 1); // 0xB5 has five set bits
        assert_eq!(model.peek("inv").unwrap(), 0x4A);
        assert_eq!(model.peek("div0").unwrap(), 0);
        assert_eq!(model.peek("mem").unwrap(), 99);
    }

    #[test]
    fn test_plusargs_poke_signals() {
        let mut model = counter(IrModelOptions::default());
        model
            .apply_plusargs(&["+count=0x3", "--ignored", "+verbose", "+rst=1"])
            .unwrap();
        assert_eq!(model.peek("count").unwrap(), 3);
        assert_eq!(model.peek("rst").unwrap(), 1);

        let err = model.apply_plusargs(&["+nope=1"]).unwrap_err();
        assert!(matches!(err, HarnessError::UnknownSignal(ref s) if s == "nope"));
        let err = model.apply_plusargs(&["+count=zz"]).unwrap_err();
        assert!(matches!(err, HarnessError::Config(_)));
    }

    #[test]
    fn test_poke_masks_to_width() {
        let mut model = counter(IrModelOptions::default());
        model.poke("count", 0x1F).unwrap();
        assert_eq!(model.peek("count").unwrap(), 0xF);
        assert!(model.poke("missing", 1).is_err());
    }
}
