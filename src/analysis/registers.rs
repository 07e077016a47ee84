//! Backward liveness of the guest registers {A,B,C,D,E,H,L,F,SP}.
//!
//! Memory is treated conservatively: a store through `(HL)` keeps H and L
//! read even when the stored value is dead, and dead stores to memory are
//! never eliminated. F is read by anything conditional and written by
//! anything that touches flags, so `PUSH AF`/`POP AF` round-trips stay
//! consistent with the flag analysis.

use super::MAX_DATAFLOW_ITERATIONS;
use super::blocks::CodeDatabase;
use super::cfg::ControlFlowGraph;
use crate::decoder::{AluOp, Op, Place, Reg8, Reg16, RotOp, StackReg, Target8};
use bitflags::bitflags;
use std::collections::BTreeMap;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct RegSet: u16 {
        const A = 1 << 0;
        const B = 1 << 1;
        const C = 1 << 2;
        const D = 1 << 3;
        const E = 1 << 4;
        const H = 1 << 5;
        const L = 1 << 6;
        const F = 1 << 7;
        const SP = 1 << 8;
    }
}

impl RegSet {
    pub const NONE: RegSet = RegSet::empty();
    pub const HL: RegSet = RegSet::H.union(RegSet::L);

    pub fn of(r: Reg8) -> RegSet {
        match r {
            Reg8::A => RegSet::A,
            Reg8::B => RegSet::B,
            Reg8::C => RegSet::C,
            Reg8::D => RegSet::D,
            Reg8::E => RegSet::E,
            Reg8::H => RegSet::H,
            Reg8::L => RegSet::L,
        }
    }

    pub fn of_pair(rr: Reg16) -> RegSet {
        match rr {
            Reg16::BC => RegSet::B | RegSet::C,
            Reg16::DE => RegSet::D | RegSet::E,
            Reg16::HL => RegSet::HL,
            Reg16::SP => RegSet::SP,
        }
    }

    pub fn of_stack_pair(rr: StackReg) -> RegSet {
        match rr {
            StackReg::BC => RegSet::B | RegSet::C,
            StackReg::DE => RegSet::D | RegSet::E,
            StackReg::HL => RegSet::HL,
            StackReg::AF => RegSet::A | RegSet::F,
        }
    }
}

/// Register reads and writes of one instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegBehavior {
    pub reads: RegSet,
    pub writes: RegSet,
}

/// Registers a place consumes when used as a source, and the pair updates a
/// post-increment/decrement mode performs.
fn place_reads(place: Place) -> RegSet {
    match place {
        Place::Reg(r) => RegSet::of(r),
        Place::HlInd | Place::HliInd | Place::HldInd => RegSet::HL,
        Place::BcInd => RegSet::B | RegSet::C,
        Place::DeInd => RegSet::D | RegSet::E,
        Place::Abs(_) | Place::High(_) => RegSet::NONE,
        Place::HighC => RegSet::C,
    }
}

/// Registers a place needs just to form its address when used as a store
/// destination.
fn place_addr_reads(place: Place) -> RegSet {
    match place {
        Place::Reg(_) => RegSet::NONE,
        other => place_reads(other),
    }
}

fn place_writes(place: Place) -> RegSet {
    match place {
        Place::Reg(r) => RegSet::of(r),
        Place::HliInd | Place::HldInd => RegSet::HL,
        _ => RegSet::NONE,
    }
}

fn target_reads(target: Target8) -> RegSet {
    match target {
        Target8::Reg(r) => RegSet::of(r),
        Target8::HlInd => RegSet::HL,
    }
}

fn target_writes(target: Target8) -> RegSet {
    match target {
        Target8::Reg(r) => RegSet::of(r),
        Target8::HlInd => RegSet::NONE, // the write goes to memory
    }
}

pub fn behavior(op: &Op) -> RegBehavior {
    let (reads, writes) = match *op {
        Op::Nop | Op::Stop | Op::Halt | Op::Di | Op::Ei | Op::Invalid(_) => {
            (RegSet::NONE, RegSet::NONE)
        }
        Op::Ld { dst, src } => (
            place_reads(src) | place_addr_reads(dst),
            place_writes(dst) | if matches!(src, Place::HliInd | Place::HldInd) {
                RegSet::HL
            } else {
                RegSet::NONE
            },
        ),
        Op::LdImm { dst, .. } => {
            let reads = match dst {
                Target8::Reg(_) => RegSet::NONE,
                Target8::HlInd => RegSet::HL, // address formation
            };
            (reads, target_writes(dst))
        }
        Op::Ld16 { dst, .. } => (RegSet::NONE, RegSet::of_pair(dst)),
        Op::LdSpHl => (RegSet::HL, RegSet::SP),
        Op::LdHlSpOff(_) => (RegSet::SP, RegSet::HL | RegSet::F),
        Op::LdMemSp(_) => (RegSet::SP, RegSet::NONE),
        Op::AddSp(_) => (RegSet::SP, RegSet::SP | RegSet::F),
        Op::Inc16(rr) | Op::Dec16(rr) => (RegSet::of_pair(rr), RegSet::of_pair(rr)),
        Op::Inc8(t) | Op::Dec8(t) => (target_reads(t), target_writes(t) | RegSet::F),
        Op::AddHl(rr) => (RegSet::HL | RegSet::of_pair(rr), RegSet::HL | RegSet::F),
        Op::Alu { op, src } => {
            let mut reads = RegSet::A;
            match src {
                crate::decoder::AluSrc::Reg(r) => reads |= RegSet::of(r),
                crate::decoder::AluSrc::HlInd => reads |= RegSet::HL,
                crate::decoder::AluSrc::Imm(_) => {}
            }
            if matches!(op, AluOp::Adc | AluOp::Sbc) {
                reads |= RegSet::F;
            }
            let writes = if op == AluOp::Cp {
                RegSet::F
            } else {
                RegSet::A | RegSet::F
            };
            (reads, writes)
        }
        Op::RotA(rot) => {
            let mut reads = RegSet::A;
            if matches!(rot, RotOp::Rl | RotOp::Rr) {
                reads |= RegSet::F;
            }
            (reads, RegSet::A | RegSet::F)
        }
        Op::Daa => (RegSet::A | RegSet::F, RegSet::A | RegSet::F),
        Op::Cpl => (RegSet::A, RegSet::A | RegSet::F),
        Op::Scf => (RegSet::NONE, RegSet::F),
        Op::Ccf => (RegSet::F, RegSet::F),
        Op::Rot { op, target } => {
            let mut reads = target_reads(target);
            if matches!(op, RotOp::Rl | RotOp::Rr) {
                reads |= RegSet::F;
            }
            (reads, target_writes(target) | RegSet::F)
        }
        Op::Bit { target, .. } => (target_reads(target), RegSet::F),
        Op::Res { target, .. } | Op::Set { target, .. } => {
            (target_reads(target), target_writes(target))
        }
        Op::Push(rr) => (RegSet::of_stack_pair(rr) | RegSet::SP, RegSet::SP),
        Op::Pop(rr) => (RegSet::SP, RegSet::of_stack_pair(rr) | RegSet::SP),
        Op::Jr { cond, .. } | Op::Jp { cond, .. } => {
            let reads = if cond.is_some() { RegSet::F } else { RegSet::NONE };
            (reads, RegSet::NONE)
        }
        Op::JpHl => (RegSet::HL, RegSet::NONE),
        Op::Call { cond, .. } => {
            let mut reads = RegSet::SP;
            if cond.is_some() {
                reads |= RegSet::F;
            }
            (reads, RegSet::SP)
        }
        Op::Rst(_) => (RegSet::SP, RegSet::SP),
        Op::Ret { cond } => {
            let mut reads = RegSet::SP;
            if cond.is_some() {
                reads |= RegSet::F;
            }
            (reads, RegSet::SP)
        }
        Op::Reti => (RegSet::SP, RegSet::SP),
    };
    RegBehavior { reads, writes }
}

/// Fixpoint result mirroring the flag analysis.
#[derive(Debug, Clone, Default)]
pub struct RegisterLiveness {
    live_in: BTreeMap<u16, RegSet>,
    live_after: BTreeMap<u16, Vec<RegSet>>,
}

impl RegisterLiveness {
    pub fn analyze(db: &CodeDatabase, cfg: &ControlFlowGraph) -> RegisterLiveness {
        let mut result = RegisterLiveness::default();
        let order = cfg.reachable();
        for &addr in &order {
            result.live_in.insert(addr, RegSet::NONE);
        }

        let mut iterations = 0;
        loop {
            let mut changed = false;
            for &addr in order.iter().rev() {
                let live_out = result.block_live_out(cfg, addr);
                let block = &db.blocks[&addr];
                let mut live = live_out;
                let mut after = vec![RegSet::NONE; block.instructions.len()];
                for (idx, instr) in block.instructions.iter().enumerate().rev() {
                    after[idx] = live;
                    let b = behavior(&instr.op);
                    live = (live - b.writes) | b.reads;
                }
                if result.live_in.get(&addr) != Some(&live) {
                    result.live_in.insert(addr, live);
                    changed = true;
                }
                result.live_after.insert(addr, after);
            }
            iterations += 1;
            if !changed {
                break;
            }
            if iterations >= MAX_DATAFLOW_ITERATIONS {
                log::warn!(
                    "register liveness did not converge after {} iterations; using last state",
                    iterations
                );
                break;
            }
        }
        result
    }

    fn block_live_out(&self, cfg: &ControlFlowGraph, addr: u16) -> RegSet {
        let Some(node) = cfg.nodes.get(&addr) else {
            return RegSet::all();
        };
        if node.successors.is_empty() {
            return RegSet::all();
        }
        let mut out = RegSet::NONE;
        for &succ in &node.successors {
            out |= self.live_in.get(&succ).copied().unwrap_or(RegSet::all());
        }
        out
    }

    /// Registers still observable after instruction `idx` of the given block.
    pub fn live_after(&self, block: u16, idx: usize) -> RegSet {
        self.live_after
            .get(&block)
            .and_then(|v| v.get(idx))
            .copied()
            .unwrap_or(RegSet::all())
    }

    pub fn live_in(&self, block: u16) -> RegSet {
        self.live_in.get(&block).copied().unwrap_or(RegSet::all())
    }
}
