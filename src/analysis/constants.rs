//! Forward constant propagation over the guest registers.
//!
//! Each register carries a three-point lattice `Bottom ⊑ Const(v) ⊑ Top`,
//! met pointwise at join points. The flag byte F is tracked as one more
//! lattice slot so that carry-dependent operations (ADC/SBC, RL/RR) can fold
//! when the carry is statically known; operations whose flag result cannot
//! be computed from constant inputs push F to Top.

use super::MAX_DATAFLOW_ITERATIONS;
use super::blocks::{CodeDatabase, ExitKind};
use super::cfg::ControlFlowGraph;
use crate::alu;
use crate::cpu_state::{FLAG_C, FLAG_H, FLAG_N, FLAG_Z};
use crate::decoder::{AluOp, AluSrc, Op, Place, Reg8, Reg16, RotOp, StackReg, Target8};
use crate::exec::{apply_alu, apply_rot};
use std::collections::BTreeMap;

/// One register's lattice value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConstVal {
    /// No path has produced a value yet (meet identity).
    #[default]
    Bottom,
    Const(u8),
    /// Statically unknown.
    Top,
}

impl ConstVal {
    pub fn meet(self, other: ConstVal) -> ConstVal {
        match (self, other) {
            (ConstVal::Bottom, x) | (x, ConstVal::Bottom) => x,
            (ConstVal::Top, _) | (_, ConstVal::Top) => ConstVal::Top,
            (ConstVal::Const(a), ConstVal::Const(b)) => {
                if a == b {
                    ConstVal::Const(a)
                } else {
                    ConstVal::Top
                }
            }
        }
    }

    pub fn known(self) -> Option<u8> {
        match self {
            ConstVal::Const(v) => Some(v),
            _ => None,
        }
    }
}

/// Lattice state for {A,B,C,D,E,H,L} plus the flag byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConstState {
    regs: [ConstVal; 7],
    f: ConstVal,
}

const REG_ORDER: [Reg8; 7] = [
    Reg8::A,
    Reg8::B,
    Reg8::C,
    Reg8::D,
    Reg8::E,
    Reg8::H,
    Reg8::L,
];

fn reg_index(r: Reg8) -> usize {
    REG_ORDER.iter().position(|&x| x == r).unwrap()
}

impl ConstState {
    /// All-Bottom: the meet identity.
    pub fn bottom() -> ConstState {
        ConstState {
            regs: [ConstVal::Bottom; 7],
            f: ConstVal::Bottom,
        }
    }

    /// All-Top: nothing known. The state at every analysis entry point.
    pub fn unknown() -> ConstState {
        ConstState {
            regs: [ConstVal::Top; 7],
            f: ConstVal::Top,
        }
    }

    pub fn reg(&self, r: Reg8) -> ConstVal {
        self.regs[reg_index(r)]
    }

    pub fn set_reg(&mut self, r: Reg8, value: ConstVal) {
        self.regs[reg_index(r)] = value;
    }

    pub fn flags(&self) -> ConstVal {
        self.f
    }

    /// True when the carry flag has a statically-known value.
    pub fn carry(&self) -> Option<bool> {
        self.f.known().map(|f| f & FLAG_C != 0)
    }

    pub fn meet(mut self, other: &ConstState) -> ConstState {
        for i in 0..7 {
            self.regs[i] = self.regs[i].meet(other.regs[i]);
        }
        self.f = self.f.meet(other.f);
        self
    }

    fn pair(&self, rr: Reg16) -> Option<u16> {
        let (hi, lo) = match rr {
            Reg16::BC => (Reg8::B, Reg8::C),
            Reg16::DE => (Reg8::D, Reg8::E),
            Reg16::HL => (Reg8::H, Reg8::L),
            Reg16::SP => return None, // SP is not tracked
        };
        Some(((self.reg(hi).known()? as u16) << 8) | self.reg(lo).known()? as u16)
    }

    fn set_pair(&mut self, rr: Reg16, value: ConstVal16) {
        let (hi, lo) = match rr {
            Reg16::BC => (Reg8::B, Reg8::C),
            Reg16::DE => (Reg8::D, Reg8::E),
            Reg16::HL => (Reg8::H, Reg8::L),
            Reg16::SP => return,
        };
        match value {
            Some(v) => {
                self.set_reg(hi, ConstVal::Const((v >> 8) as u8));
                self.set_reg(lo, ConstVal::Const((v & 0xFF) as u8));
            }
            None => {
                self.set_reg(hi, ConstVal::Top);
                self.set_reg(lo, ConstVal::Top);
            }
        }
    }
}

type ConstVal16 = Option<u16>;

/// Applies one instruction's transfer function.
fn transfer(state: &mut ConstState, op: &Op) {
    // Carries the preserved flag bits over a partial flag write, or gives up.
    fn merge_flags(state: &mut ConstState, written: u8, preserved_mask: u8) {
        state.f = match state.f.known() {
            Some(old) => ConstVal::Const(written | (old & preserved_mask)),
            None if preserved_mask == 0 => ConstVal::Const(written),
            None => ConstVal::Top,
        };
    }

    match *op {
        Op::Nop | Op::Stop | Op::Halt | Op::Di | Op::Ei | Op::Invalid(_) => {}
        Op::LdImm { dst, value } => {
            if let Target8::Reg(r) = dst {
                state.set_reg(r, ConstVal::Const(value));
            }
        }
        Op::Ld { dst, src } => {
            // Post-increment/decrement modes move HL whichever side they are on.
            let hl_step: i32 = match (dst, src) {
                (Place::HliInd, _) | (_, Place::HliInd) => 1,
                (Place::HldInd, _) | (_, Place::HldInd) => -1,
                _ => 0,
            };
            if let Place::Reg(r) = dst {
                let value = match src {
                    Place::Reg(s) => state.reg(s),
                    _ => ConstVal::Top, // memory and I/O reads are opaque
                };
                state.set_reg(r, value);
            }
            if hl_step != 0 {
                let new = state
                    .pair(Reg16::HL)
                    .map(|hl| hl.wrapping_add(hl_step as u16));
                state.set_pair(Reg16::HL, new);
            }
        }
        Op::Ld16 { dst, value } => state.set_pair(dst, Some(value)),
        Op::LdSpHl | Op::LdMemSp(_) => {}
        Op::LdHlSpOff(_) => {
            state.set_pair(Reg16::HL, None);
            state.f = ConstVal::Top;
        }
        Op::AddSp(_) => state.f = ConstVal::Top,
        Op::Inc16(rr) => {
            let new = state.pair(rr).map(|v| v.wrapping_add(1));
            state.set_pair(rr, new);
        }
        Op::Dec16(rr) => {
            let new = state.pair(rr).map(|v| v.wrapping_sub(1));
            state.set_pair(rr, new);
        }
        Op::Inc8(Target8::Reg(r)) => match state.reg(r).known() {
            Some(v) => {
                let (result, flags) = alu::inc8(v);
                state.set_reg(r, ConstVal::Const(result));
                merge_flags(state, flags, FLAG_C);
            }
            None => {
                state.set_reg(r, ConstVal::Top);
                state.f = ConstVal::Top;
            }
        },
        Op::Dec8(Target8::Reg(r)) => match state.reg(r).known() {
            Some(v) => {
                let (result, flags) = alu::dec8(v);
                state.set_reg(r, ConstVal::Const(result));
                merge_flags(state, flags, FLAG_C);
            }
            None => {
                state.set_reg(r, ConstVal::Top);
                state.f = ConstVal::Top;
            }
        },
        Op::Inc8(Target8::HlInd) | Op::Dec8(Target8::HlInd) => state.f = ConstVal::Top,
        Op::AddHl(rr) => {
            match (state.pair(Reg16::HL), state.pair(rr)) {
                (Some(hl), Some(v)) => {
                    let (result, flags) = alu::add_hl(hl, v);
                    state.set_pair(Reg16::HL, Some(result));
                    merge_flags(state, flags, FLAG_Z);
                }
                _ => {
                    state.set_pair(Reg16::HL, None);
                    state.f = ConstVal::Top;
                }
            }
        }
        Op::Alu { op, src } => {
            // XOR A zeroes the accumulator whatever it held.
            if op == AluOp::Xor && src == AluSrc::Reg(Reg8::A) {
                state.set_reg(Reg8::A, ConstVal::Const(0));
                state.f = ConstVal::Const(FLAG_Z);
                return;
            }
            let operand = match src {
                AluSrc::Imm(v) => Some(v),
                AluSrc::Reg(r) => state.reg(r).known(),
                AluSrc::HlInd => None,
            };
            let carry = state.carry();
            let needs_carry = matches!(op, AluOp::Adc | AluOp::Sbc);
            match (state.reg(Reg8::A).known(), operand) {
                (Some(a), Some(v)) if !needs_carry || carry.is_some() => {
                    let (result, flags) = apply_alu(op, a, v, carry.unwrap_or(false));
                    state.set_reg(Reg8::A, ConstVal::Const(result));
                    state.f = ConstVal::Const(flags);
                }
                _ => {
                    if op != AluOp::Cp {
                        state.set_reg(Reg8::A, ConstVal::Top);
                    }
                    state.f = ConstVal::Top;
                }
            }
        }
        Op::RotA(rot) => {
            let needs_carry = matches!(rot, RotOp::Rl | RotOp::Rr);
            match (state.reg(Reg8::A).known(), state.carry()) {
                (Some(a), carry) if !needs_carry || carry.is_some() => {
                    let (result, flags) = apply_rot(rot, a, carry.unwrap_or(false));
                    state.set_reg(Reg8::A, ConstVal::Const(result));
                    state.f = ConstVal::Const(flags & !FLAG_Z);
                }
                _ => {
                    state.set_reg(Reg8::A, ConstVal::Top);
                    state.f = ConstVal::Top;
                }
            }
        }
        Op::Daa => match (state.reg(Reg8::A).known(), state.f.known()) {
            (Some(a), Some(f)) => {
                let (result, flags) = alu::daa(a, f);
                state.set_reg(Reg8::A, ConstVal::Const(result));
                state.f = ConstVal::Const(flags | (f & FLAG_N));
            }
            _ => {
                state.set_reg(Reg8::A, ConstVal::Top);
                state.f = ConstVal::Top;
            }
        },
        Op::Cpl => {
            if let Some(a) = state.reg(Reg8::A).known() {
                state.set_reg(Reg8::A, ConstVal::Const(!a));
            } else {
                state.set_reg(Reg8::A, ConstVal::Top);
            }
            merge_flags(state, FLAG_N | FLAG_H, FLAG_Z | FLAG_C);
        }
        Op::Scf => merge_flags(state, FLAG_C, FLAG_Z),
        Op::Ccf => {
            state.f = match state.f.known() {
                Some(f) => ConstVal::Const((f & FLAG_Z) | ((f & FLAG_C) ^ FLAG_C)),
                None => ConstVal::Top,
            };
        }
        Op::Rot { op, target } => match target {
            Target8::Reg(r) => {
                let needs_carry = matches!(op, RotOp::Rl | RotOp::Rr);
                match (state.reg(r).known(), state.carry()) {
                    (Some(v), carry) if !needs_carry || carry.is_some() => {
                        let (result, flags) = apply_rot(op, v, carry.unwrap_or(false));
                        state.set_reg(r, ConstVal::Const(result));
                        state.f = ConstVal::Const(flags);
                    }
                    _ => {
                        state.set_reg(r, ConstVal::Top);
                        state.f = ConstVal::Top;
                    }
                }
            }
            Target8::HlInd => state.f = ConstVal::Top,
        },
        Op::Bit { bit, target } => {
            let value = match target {
                Target8::Reg(r) => state.reg(r).known(),
                Target8::HlInd => None,
            };
            match value {
                Some(v) => merge_flags(state, alu::bit(bit, v), FLAG_C),
                None => state.f = ConstVal::Top,
            }
        }
        Op::Res { bit, target } | Op::Set { bit, target } => {
            if let Target8::Reg(r) = target {
                let apply = |v: u8| match op {
                    Op::Res { .. } => alu::res(bit, v),
                    _ => alu::set(bit, v),
                };
                state.set_reg(
                    r,
                    match state.reg(r).known() {
                        Some(v) => ConstVal::Const(apply(v)),
                        None => ConstVal::Top,
                    },
                );
            }
        }
        Op::Push(_) => {}
        Op::Pop(rr) => match rr {
            StackReg::BC => state.set_pair(Reg16::BC, None),
            StackReg::DE => state.set_pair(Reg16::DE, None),
            StackReg::HL => state.set_pair(Reg16::HL, None),
            StackReg::AF => {
                state.set_reg(Reg8::A, ConstVal::Top);
                state.f = ConstVal::Top;
            }
        },
        // Control flow has no register effect.
        Op::Jr { .. }
        | Op::Jp { .. }
        | Op::JpHl
        | Op::Call { .. }
        | Op::Ret { .. }
        | Op::Reti
        | Op::Rst(_) => {}
    }
}

/// Fixpoint result: the lattice state before each instruction.
#[derive(Debug, Clone, Default)]
pub struct ConstantAnalysis {
    before: BTreeMap<u16, Vec<ConstState>>,
}

impl ConstantAnalysis {
    pub fn analyze(db: &CodeDatabase, cfg: &ControlFlowGraph) -> ConstantAnalysis {
        let order = cfg.reachable();
        let mut entry_state: BTreeMap<u16, ConstState> = BTreeMap::new();
        let mut out_state: BTreeMap<u16, ConstState> = BTreeMap::new();

        let mut iterations = 0;
        loop {
            let mut changed = false;
            for &addr in &order {
                let node = &cfg.nodes[&addr];
                // Meet over predecessors. A block the graph cannot explain an
                // entry to (entry point, call target, indirect target) starts
                // unknown, as does the fallthrough of a call: the callee may
                // clobber anything before returning there.
                let mut incoming = ConstState::bottom();
                let mut any_pred = false;
                for &pred in &node.predecessors {
                    let pred_block = &db.blocks[&pred];
                    let contribution = if pred_block.exit == ExitKind::Call
                        && pred_block.next_addr() == addr
                    {
                        ConstState::unknown()
                    } else {
                        out_state
                            .get(&pred)
                            .copied()
                            .unwrap_or_else(ConstState::bottom)
                    };
                    incoming = incoming.meet(&contribution);
                    any_pred = true;
                }
                if !any_pred || db.entry_points.contains(&addr) || db.call_targets.contains(&addr) {
                    incoming = incoming.meet(&ConstState::unknown());
                }

                if entry_state.get(&addr) != Some(&incoming) {
                    entry_state.insert(addr, incoming);
                    changed = true;
                }

                let mut state = incoming;
                for instr in &db.blocks[&addr].instructions {
                    transfer(&mut state, &instr.op);
                }
                if out_state.get(&addr) != Some(&state) {
                    out_state.insert(addr, state);
                    changed = true;
                }
            }
            iterations += 1;
            if !changed {
                break;
            }
            if iterations >= MAX_DATAFLOW_ITERATIONS {
                log::warn!(
                    "constant propagation did not converge after {} iterations; using last state",
                    iterations
                );
                break;
            }
        }

        // Cache the per-instruction states off the converged entry states.
        let mut result = ConstantAnalysis::default();
        for &addr in &order {
            let mut state = entry_state
                .get(&addr)
                .copied()
                .unwrap_or_else(ConstState::unknown);
            let block = &db.blocks[&addr];
            let mut before = Vec::with_capacity(block.instructions.len());
            for instr in &block.instructions {
                before.push(state);
                transfer(&mut state, &instr.op);
            }
            result.before.insert(addr, before);
        }
        result
    }

    /// The lattice value of `reg` just before instruction `idx` executes.
    pub fn constant_at(&self, block: u16, idx: usize, reg: Reg8) -> ConstVal {
        self.state_at(block, idx)
            .map(|s| s.reg(reg))
            .unwrap_or(ConstVal::Top)
    }

    /// The whole state just before instruction `idx`, if analyzed.
    pub fn state_at(&self, block: u16, idx: usize) -> Option<&ConstState> {
        self.before.get(&block).and_then(|v| v.get(idx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::blocks::CodeDatabase;
    use crate::analysis::cfg::ControlFlowGraph;

    fn analyze(code: &[(usize, &[u8])]) -> ConstantAnalysis {
        let mut rom = vec![0u8; 0x8000];
        for (addr, bytes) in code {
            rom[*addr..*addr + bytes.len()].copy_from_slice(bytes);
        }
        let db = CodeDatabase::analyze(&rom);
        let cfg = ControlFlowGraph::build(&db);
        ConstantAnalysis::analyze(&db, &cfg)
    }

    #[test]
    fn meet_follows_the_lattice() {
        use ConstVal::*;
        assert_eq!(Bottom.meet(Const(3)), Const(3));
        assert_eq!(Const(3).meet(Const(3)), Const(3));
        assert_eq!(Const(3).meet(Const(4)), Top);
        assert_eq!(Top.meet(Const(3)), Top);
        assert_eq!(Bottom.meet(Bottom), Bottom);
    }

    #[test]
    fn xor_a_then_copy_propagates_zero() {
        // 0x0100: XOR A ; LD B, A ; JP self.
        let consts = analyze(&[(0x0100, &[0xAF, 0x47, 0xC3, 0x00, 0x01])]);
        assert_eq!(consts.constant_at(0x0100, 0, Reg8::A), ConstVal::Top);
        assert_eq!(consts.constant_at(0x0100, 1, Reg8::A), ConstVal::Const(0));
        assert_eq!(consts.constant_at(0x0100, 2, Reg8::B), ConstVal::Const(0));
    }

    #[test]
    fn load_immediate_then_inc_folds() {
        // LD A, 0x41 ; INC A ; HALT.
        let consts = analyze(&[(0x0100, &[0x3E, 0x41, 0x3C, 0x76])]);
        assert_eq!(consts.constant_at(0x0100, 2, Reg8::A), ConstVal::Const(0x42));
    }

    #[test]
    fn memory_reads_are_opaque() {
        // LD A, (HL) ; HALT.
        let consts = analyze(&[(0x0100, &[0x7E, 0x76])]);
        assert_eq!(consts.constant_at(0x0100, 1, Reg8::A), ConstVal::Top);
    }

    #[test]
    fn join_meets_conflicting_values_to_top() {
        // 0x0100: JR NZ, +2 ; LD A,1 ; JR +2(skip) ... two paths give A=1 / A=2
        // 0x0100: 20 04       JR NZ, 0x0106
        // 0x0102: 3E 01       LD A, 1
        // 0x0104: 18 02       JR 0x0108
        // 0x0106: 3E 02       LD A, 2
        // 0x0108: 47          LD B, A ; 76 HALT
        let consts = analyze(&[(
            0x0100,
            &[0x20, 0x04, 0x3E, 0x01, 0x18, 0x02, 0x3E, 0x02, 0x47, 0x76],
        )]);
        assert_eq!(consts.constant_at(0x0108, 0, Reg8::A), ConstVal::Top);
    }

    #[test]
    fn join_keeps_agreeing_values() {
        // Both paths set A=7 before meeting.
        // 0x0100: 20 04       JR NZ, 0x0106
        // 0x0102: 3E 07       LD A, 7
        // 0x0104: 18 02       JR 0x0108
        // 0x0106: 3E 07       LD A, 7
        // 0x0108: 47 76
        let consts = analyze(&[(
            0x0100,
            &[0x20, 0x04, 0x3E, 0x07, 0x18, 0x02, 0x3E, 0x07, 0x47, 0x76],
        )]);
        assert_eq!(consts.constant_at(0x0108, 0, Reg8::A), ConstVal::Const(7));
    }

    #[test]
    fn scf_makes_the_carry_known_for_adc() {
        // LD A, 1 ; SCF ; ADC A, 1 -> A = 3.
        // 0: LD A,1  1: SCF  2: ADC A,1  3: HALT
        let consts = analyze(&[(0x0100, &[0x3E, 0x01, 0x37, 0xCE, 0x01, 0x76])]);
        let before_adc = consts.state_at(0x0100, 2).unwrap();
        assert_eq!(before_adc.carry(), Some(true));
        assert_eq!(consts.constant_at(0x0100, 3, Reg8::A), ConstVal::Const(3));
        // The folded ADC also pins the flag byte.
        let before_halt = consts.state_at(0x0100, 3).unwrap();
        assert_eq!(before_halt.carry(), Some(false));
    }

    #[test]
    fn call_fallthrough_forgets_everything() {
        // LD B, 9 ; CALL 0x0200 ; (return lands at 0x0105) LD A, B ; HALT
        let consts = analyze(&[
            (0x0100, &[0x06, 0x09, 0xCD, 0x00, 0x02, 0x78, 0x76]),
            (0x0200, &[0xC9]),
        ]);
        // The callee may clobber B before returning.
        assert_eq!(consts.constant_at(0x0105, 0, Reg8::B), ConstVal::Top);
    }

    #[test]
    fn ld16_splits_into_register_halves() {
        // LD HL, 0x8010 ; HALT
        let consts = analyze(&[(0x0100, &[0x21, 0x10, 0x80, 0x76])]);
        assert_eq!(consts.constant_at(0x0100, 1, Reg8::H), ConstVal::Const(0x80));
        assert_eq!(consts.constant_at(0x0100, 1, Reg8::L), ConstVal::Const(0x10));
    }
}
