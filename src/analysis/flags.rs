//! Backward liveness of the Z/N/H/C condition flags.
//!
//! Per instruction the transfer is `live_before = (live_after \ kills) ∪
//! reads`; block live-out is the union of successor live-ins, and blocks
//! without static successors assume every flag live. The cached per-
//! instruction live-after sets tell the transpiler which flag writes to emit.

use super::MAX_DATAFLOW_ITERATIONS;
use super::blocks::CodeDatabase;
use super::cfg::ControlFlowGraph;
use crate::cpu_state::FlagSet;
use crate::decoder::{AluOp, Cond, Op, RotOp, StackReg};
use std::collections::BTreeMap;

/// Flag reads/writes/kills of one instruction. On this ISA every flag write
/// is unconditional, so `kills == writes`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlagBehavior {
    pub reads: FlagSet,
    pub writes: FlagSet,
    pub kills: FlagSet,
}

fn cond_reads(cond: Cond) -> FlagSet {
    match cond {
        Cond::Nz | Cond::Z => FlagSet::Z,
        Cond::Nc | Cond::C => FlagSet::C,
    }
}

pub fn behavior(op: &Op) -> FlagBehavior {
    let reads = match op {
        Op::Jr { cond: Some(c), .. }
        | Op::Jp { cond: Some(c), .. }
        | Op::Call { cond: Some(c), .. }
        | Op::Ret { cond: Some(c) } => cond_reads(*c),
        Op::Alu { op: AluOp::Adc | AluOp::Sbc, .. } => FlagSet::C,
        Op::RotA(RotOp::Rl | RotOp::Rr) => FlagSet::C,
        Op::Rot { op: RotOp::Rl | RotOp::Rr, .. } => FlagSet::C,
        Op::Daa => FlagSet::N | FlagSet::H | FlagSet::C,
        Op::Ccf => FlagSet::C,
        // PUSH AF stores the whole flag byte.
        Op::Push(StackReg::AF) => FlagSet::ZNHC,
        _ => FlagSet::NONE,
    };
    let writes = op.flags_written();
    FlagBehavior { reads, writes, kills: writes }
}

/// Fixpoint result: per-block live-in and per-instruction live-after sets.
#[derive(Debug, Clone, Default)]
pub struct FlagLiveness {
    live_in: BTreeMap<u16, FlagSet>,
    live_after: BTreeMap<u16, Vec<FlagSet>>,
}

impl FlagLiveness {
    pub fn analyze(db: &CodeDatabase, cfg: &ControlFlowGraph) -> FlagLiveness {
        let mut result = FlagLiveness::default();
        let order = cfg.reachable();
        for &addr in &order {
            result.live_in.insert(addr, FlagSet::NONE);
        }

        let mut iterations = 0;
        loop {
            let mut changed = false;
            // Backward problem: visiting in reverse BFS order converges fast.
            for &addr in order.iter().rev() {
                let live_out = result.block_live_out(cfg, addr);
                let block = &db.blocks[&addr];
                let mut live = live_out;
                let mut after = vec![FlagSet::NONE; block.instructions.len()];
                for (idx, instr) in block.instructions.iter().enumerate().rev() {
                    after[idx] = live;
                    let b = behavior(&instr.op);
                    live = (live - b.kills) | b.reads;
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
                    "flag liveness did not converge after {} iterations; using last state",
                    iterations
                );
                break;
            }
        }
        result
    }

    /// Union of the successors' live-ins; everything is live past an exit the
    /// graph cannot see (returns, indirect jumps, halts, edges out of the
    /// analyzed region).
    fn block_live_out(&self, cfg: &ControlFlowGraph, addr: u16) -> FlagSet {
        let Some(node) = cfg.nodes.get(&addr) else {
            return FlagSet::ZNHC;
        };
        if node.successors.is_empty() {
            return FlagSet::ZNHC;
        }
        let mut out = FlagSet::NONE;
        for &succ in &node.successors {
            out |= self.live_in.get(&succ).copied().unwrap_or(FlagSet::ZNHC);
        }
        out
    }

    /// Flags still observable after instruction `idx` of the given block.
    /// Unanalyzed positions conservatively report everything live.
    pub fn live_after(&self, block: u16, idx: usize) -> FlagSet {
        self.live_after
            .get(&block)
            .and_then(|v| v.get(idx))
            .copied()
            .unwrap_or(FlagSet::ZNHC)
    }

    pub fn live_in(&self, block: u16) -> FlagSet {
        self.live_in.get(&block).copied().unwrap_or(FlagSet::ZNHC)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::blocks::CodeDatabase;
    use crate::analysis::cfg::ControlFlowGraph;

    fn analyze(code: &[(usize, &[u8])]) -> (CodeDatabase, ControlFlowGraph, FlagLiveness) {
        let mut rom = vec![0u8; 0x8000];
        for (addr, bytes) in code {
            rom[*addr..*addr + bytes.len()].copy_from_slice(bytes);
        }
        let db = CodeDatabase::analyze(&rom);
        let cfg = ControlFlowGraph::build(&db);
        let live = FlagLiveness::analyze(&db, &cfg);
        (db, cfg, live)
    }

    #[test]
    fn behavior_tables() {
        let b = behavior(&Op::Jr { cond: Some(Cond::Nz), target: 0 });
        assert_eq!(b.reads, FlagSet::Z);
        assert_eq!(b.writes, FlagSet::NONE);

        let b = behavior(&Op::Alu {
            op: AluOp::Adc,
            src: crate::decoder::AluSrc::Imm(1),
        });
        assert_eq!(b.reads, FlagSet::C);
        assert_eq!(b.writes, FlagSet::ZNHC);

        let b = behavior(&Op::Daa);
        assert_eq!(b.reads, FlagSet::N | FlagSet::H | FlagSet::C);

        let b = behavior(&Op::Inc8(crate::decoder::Target8::Reg(crate::decoder::Reg8::A)));
        assert_eq!(b.writes, FlagSet::Z | FlagSet::N | FlagSet::H);
        assert_eq!(b.kills, b.writes);
    }

    #[test]
    fn dead_inc_flags_are_not_live() {
        // 0x0100: INC A ; DEC A ; JP 0x0100: nothing reads the flags.
        let (_, _, live) = analyze(&[(0x0100, &[0x3C, 0x3D, 0xC3, 0x00, 0x01])]);
        // After INC A, the DEC overwrites Z/N/H before any read.
        let after_inc = live.live_after(0x0100, 0);
        assert_eq!(after_inc & (FlagSet::Z | FlagSet::N | FlagSet::H), FlagSet::NONE);
    }

    #[test]
    fn branch_keeps_z_live_through_the_loop() {
        // 0x0100: DEC B ; JR NZ, self-block: Z feeds the branch.
        let (_, _, live) = analyze(&[(0x0100, &[0x05, 0x20, 0xFD, 0x76])]);
        let after_dec = live.live_after(0x0100, 0);
        assert!(after_dec.contains(FlagSet::Z));
    }

    #[test]
    fn flags_are_live_past_a_return() {
        // CP d8 ; RET: the caller might branch on the comparison.
        let (_, _, live) = analyze(&[(0x0100, &[0xFE, 0xFF, 0xC9])]);
        let after_cp = live.live_after(0x0100, 0);
        assert_eq!(after_cp, FlagSet::ZNHC);
    }

    #[test]
    fn analysis_is_idempotent() {
        let code: &[(usize, &[u8])] = &[(0x0100, &[0x05, 0x20, 0xFD, 0xFE, 0x10, 0xC8, 0x18, 0xF8])];
        let (db, cfg, first) = analyze(code);
        let second = FlagLiveness::analyze(&db, &cfg);
        for (&addr, block) in &db.blocks {
            for idx in 0..block.instructions.len() {
                assert_eq!(first.live_after(addr, idx), second.live_after(addr, idx));
            }
        }
    }
}
