//! Block transpiler: lowers an analyzed basic block into a step program.
//!
//! Each guest instruction becomes at most a handful of typed steps. The
//! three analyses drive the lowering: dead flag writes are masked out, dead
//! register writes are dropped (memory reads are always preserved), and
//! operations over statically-known values collapse into literal stores.
//! The terminator becomes a typed [`Exit`] the engine evaluates at run time.

use crate::analysis::blocks::{BasicBlock, ExitKind};
use crate::analysis::constants::{ConstState, ConstantAnalysis};
use crate::analysis::flags::FlagLiveness;
use crate::analysis::registers::{RegSet, RegisterLiveness};
use crate::cpu_state::{CpuState, FlagSet};
use crate::decoder::{AluOp, AluSrc, Cond, Op, Place, Reg8, RotOp, Target8};
use crate::exec;
use crate::mmu::Mmu;
use crate::{CoreError, CoreResult};

/// One lowered step of a compiled block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Run the instruction through the semantic core, committing only the
    /// given flags.
    Exec { op: Op, flags: FlagSet },
    /// Literal register store (constant-folded).
    SetReg { dst: Reg8, value: u8 },
    /// Literal flag result, already narrowed to the live set.
    SetFlags { mask: FlagSet, value: u8 },
    /// Perform a memory read for its side effects and drop the value.
    ReadDiscard { src: Place },
}

/// Typed terminator of a compiled block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Exit {
    Fallthrough { next: u16 },
    Jump { target: u16 },
    Branch { cond: Cond, target: u16, fallthrough: u16, taken_extra: u8 },
    Call { cond: Option<Cond>, target: u16, resume: u16, taken_extra: u8 },
    Rst { target: u16, resume: u16 },
    Ret { cond: Option<Cond>, fallthrough: u16, taken_extra: u8, enable_ime: bool },
    /// `JP (HL)`: dispatch on the updated PC.
    Indirect,
    Halt { resume: u16 },
}

/// Outcome of running one compiled block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockResult {
    /// Statically-known next block, when there is one. `None` means the
    /// dispatcher should continue from `cpu.pc`.
    pub next: Option<u16>,
    pub cycles: u32,
    pub halted: bool,
}

/// A host-executable block: `(cpu, mmu) -> BlockResult`.
#[derive(Debug, Clone)]
pub struct CompiledBlock {
    pub entry: u16,
    pub end: u16,
    pub steps: Vec<Step>,
    pub exit: Exit,
    /// Straight-line cycle cost, terminator base included; branch-taken
    /// extras are added by the exit evaluation.
    pub base_cycles: u32,
}

/// Lowers one analyzed block. The analyses may be consulted conservatively
/// (everything live, nothing constant) for blocks discovered after the
/// whole-ROM pass.
pub fn transpile(
    block: &BasicBlock,
    flags: &FlagLiveness,
    regs: &RegisterLiveness,
    consts: &ConstantAnalysis,
) -> CoreResult<CompiledBlock> {
    if block.instructions.is_empty() {
        return Err(CoreError::Transpile(format!(
            "block {:#06X} has no instructions",
            block.start
        )));
    }

    let mut steps = Vec::new();
    let mut base_cycles = 0u32;
    let terminator_at = if block.terminator().is_some() {
        block.instructions.len() - 1
    } else {
        block.instructions.len()
    };

    for (idx, instr) in block.instructions.iter().enumerate() {
        base_cycles += instr.cycles.base() as u32;
        if idx >= terminator_at {
            break;
        }
        let live_flags = flags.live_after(block.start, idx);
        let live_regs = regs.live_after(block.start, idx);
        let state = consts.state_at(block.start, idx).copied();
        lower(&mut steps, &instr.op, live_flags, live_regs, state);
    }

    let exit = lower_exit(block)?;
    Ok(CompiledBlock {
        entry: block.start,
        end: block.end,
        steps,
        exit,
        base_cycles,
    })
}

/// Narrows an instruction's flag writes to the live subset.
fn flag_mask(op: &Op, live: FlagSet) -> FlagSet {
    op.flags_written() & live
}

/// Lowers one straight-line instruction, appending its steps.
fn lower(
    steps: &mut Vec<Step>,
    op: &Op,
    live_flags: FlagSet,
    live_regs: RegSet,
    state: Option<ConstState>,
) {
    let mask = flag_mask(op, live_flags);
    let reg_dead = |r: Reg8| !live_regs.contains(RegSet::of(r));

    match *op {
        // A NOP costs cycles but does no work.
        Op::Nop => {}
        Op::LdImm { dst: Target8::Reg(r), value } => {
            if !reg_dead(r) {
                steps.push(Step::SetReg { dst: r, value });
            }
        }
        Op::Ld { dst: Place::Reg(r), src } => {
            match src {
                Place::Reg(s) => {
                    if reg_dead(r) {
                        return;
                    }
                    // Known source folds to a literal store with no
                    // indirection through the source register.
                    match state.and_then(|st| st.reg(s).known()) {
                        Some(value) => steps.push(Step::SetReg { dst: r, value }),
                        None => steps.push(Step::Exec { op: *op, flags: mask }),
                    }
                }
                // Memory sources may be I/O with read handlers: the read is
                // preserved, only the dead register store is elided.
                _ => {
                    if reg_dead(r) {
                        steps.push(Step::ReadDiscard { src });
                    } else {
                        steps.push(Step::Exec { op: *op, flags: mask });
                    }
                }
            }
        }
        Op::Alu { op: alu_op, src } => {
            lower_alu(steps, alu_op, src, mask, live_regs, state);
        }
        Op::Inc8(Target8::Reg(r)) | Op::Dec8(Target8::Reg(r)) => {
            if reg_dead(r) && mask.is_empty() {
                return;
            }
            match state.and_then(|st| st.reg(r).known()) {
                Some(v) => {
                    let (result, flags) = if matches!(op, Op::Inc8(_)) {
                        crate::alu::inc8(v)
                    } else {
                        crate::alu::dec8(v)
                    };
                    if !reg_dead(r) {
                        steps.push(Step::SetReg { dst: r, value: result });
                    }
                    push_flags(steps, mask, flags);
                }
                None => steps.push(Step::Exec { op: *op, flags: mask }),
            }
        }
        Op::Rot { op: rot, target: Target8::Reg(r) } => {
            if reg_dead(r) && mask.is_empty() {
                return;
            }
            let carry = state.and_then(|st| st.carry());
            let needs_carry = matches!(rot, RotOp::Rl | RotOp::Rr);
            match state.and_then(|st| st.reg(r).known()) {
                Some(v) if !needs_carry || carry.is_some() => {
                    let (result, flags) = exec::apply_rot(rot, v, carry.unwrap_or(false));
                    if !reg_dead(r) {
                        steps.push(Step::SetReg { dst: r, value: result });
                    }
                    push_flags(steps, mask, flags);
                }
                _ => steps.push(Step::Exec { op: *op, flags: mask }),
            }
        }
        Op::Bit { bit, target: Target8::Reg(r) } => {
            if mask.is_empty() {
                return; // pure flag producer
            }
            match state.and_then(|st| st.reg(r).known()) {
                Some(v) => push_flags(steps, mask, crate::alu::bit(bit, v)),
                None => steps.push(Step::Exec { op: *op, flags: mask }),
            }
        }
        Op::Res { target: Target8::Reg(r), .. } | Op::Set { target: Target8::Reg(r), .. } => {
            if reg_dead(r) {
                return;
            }
            steps.push(Step::Exec { op: *op, flags: mask });
        }
        Op::Scf | Op::Ccf => {
            if mask.is_empty() {
                return;
            }
            steps.push(Step::Exec { op: *op, flags: mask });
        }
        Op::Cpl => {
            if reg_dead(Reg8::A) && mask.is_empty() {
                return;
            }
            steps.push(Step::Exec { op: *op, flags: mask });
        }
        // Unknown bytes in a code position: placeholder, no semantics.
        Op::Invalid(_) => {}
        // Everything else runs through the semantic core with a narrowed
        // flag mask. Memory-writing forms are never elided.
        _ => steps.push(Step::Exec { op: *op, flags: mask }),
    }
}

/// ALU lowering: full constant fold when all inputs are known, otherwise
/// operand literalization and carry simplification.
fn lower_alu(
    steps: &mut Vec<Step>,
    alu_op: AluOp,
    src: AluSrc,
    mask: FlagSet,
    live_regs: RegSet,
    state: Option<ConstState>,
) {
    let a_dead = !live_regs.contains(RegSet::A);
    let pure_src = !matches!(src, AluSrc::HlInd);

    // Dead destination, dead flags, no memory read: nothing observable.
    if a_dead && mask.is_empty() && pure_src && alu_op != AluOp::Cp {
        return;
    }
    if alu_op == AluOp::Cp && mask.is_empty() && pure_src {
        return; // CP only produces flags
    }

    // XOR A needs no analysis: the accumulator becomes zero.
    if alu_op == AluOp::Xor && src == AluSrc::Reg(Reg8::A) {
        if !a_dead {
            steps.push(Step::SetReg { dst: Reg8::A, value: 0 });
        }
        push_flags(steps, mask, crate::cpu_state::FLAG_Z);
        return;
    }

    let operand = match src {
        AluSrc::Imm(v) => Some(v),
        AluSrc::Reg(r) => state.and_then(|st| st.reg(r).known()),
        AluSrc::HlInd => None,
    };
    let carry = state.and_then(|st| st.carry());
    let needs_carry = matches!(alu_op, AluOp::Adc | AluOp::Sbc);
    let a_known = state.and_then(|st| st.reg(Reg8::A).known());

    // Full fold: both operands (and the carry, when read) are constants.
    if let (Some(a), Some(v)) = (a_known, operand) {
        if !needs_carry || carry.is_some() {
            let (result, flags) = exec::apply_alu(alu_op, a, v, carry.unwrap_or(false));
            if alu_op != AluOp::Cp && !a_dead {
                steps.push(Step::SetReg { dst: Reg8::A, value: result });
            }
            push_flags(steps, mask, flags);
            return;
        }
    }

    // Partial folds: a known register operand becomes an immediate, and a
    // known-clear carry turns ADC/SBC into the carry-less form.
    let mut lowered_op = alu_op;
    if needs_carry && carry == Some(false) {
        lowered_op = match alu_op {
            AluOp::Adc => AluOp::Add,
            AluOp::Sbc => AluOp::Sub,
            other => other,
        };
    }
    let lowered_src = match (src, operand) {
        (AluSrc::Reg(_), Some(v)) => AluSrc::Imm(v),
        _ => src,
    };
    steps.push(Step::Exec { op: Op::Alu { op: lowered_op, src: lowered_src }, flags: mask });
}

fn push_flags(steps: &mut Vec<Step>, mask: FlagSet, value: u8) {
    if !mask.is_empty() {
        steps.push(Step::SetFlags { mask, value });
    }
}

/// Builds the typed exit from the block's terminator (or its synthetic
/// fallthrough).
fn lower_exit(block: &BasicBlock) -> CoreResult<Exit> {
    let next = block.next_addr();
    let Some(term) = block.terminator() else {
        // Split fallthrough carries its single recorded target; running off
        // the end of ROM continues at the next address (open-bus fetches).
        let target = block.targets.first().copied().unwrap_or(next);
        return Ok(Exit::Fallthrough { next: target });
    };
    let extra = term.cycles.taken_extra();

    let exit = match term.op {
        Op::Jp { cond: None, target } | Op::Jr { cond: None, target } => Exit::Jump { target },
        Op::Jp { cond: Some(cond), target } | Op::Jr { cond: Some(cond), target } => {
            Exit::Branch { cond, target, fallthrough: next, taken_extra: extra }
        }
        Op::Call { cond, target } => Exit::Call { cond, target, resume: next, taken_extra: extra },
        Op::Rst(target) => Exit::Rst { target, resume: next },
        Op::Ret { cond } => Exit::Ret {
            cond,
            fallthrough: next,
            taken_extra: extra,
            enable_ime: false,
        },
        Op::Reti => Exit::Ret {
            cond: None,
            fallthrough: next,
            taken_extra: 0,
            enable_ime: true,
        },
        Op::JpHl => Exit::Indirect,
        Op::Halt => Exit::Halt { resume: next },
        ref other => {
            return Err(CoreError::Transpile(format!(
                "unexpected terminator {:?} in block {:#06X}",
                other, block.start
            )));
        }
    };
    debug_assert!(block.exit != ExitKind::Fallthrough);
    Ok(exit)
}

impl CompiledBlock {
    /// Advances guest state by one block.
    pub fn run(&self, cpu: &mut CpuState, mmu: &mut Mmu) -> BlockResult {
        for step in &self.steps {
            match step {
                Step::Exec { op, flags } => exec::run_straight(cpu, mmu, op, *flags),
                Step::SetReg { dst, value } => exec::set_reg8(cpu, *dst, *value),
                Step::SetFlags { mask, value } => cpu.apply_flags(*value, *mask),
                Step::ReadDiscard { src } => {
                    let _ = exec::read_place(cpu, mmu, *src);
                }
            }
        }

        let mut cycles = self.base_cycles;
        let mut halted = false;
        let next = match self.exit {
            Exit::Fallthrough { next } => {
                cpu.pc = next;
                Some(next)
            }
            Exit::Jump { target } => {
                cpu.pc = target;
                Some(target)
            }
            Exit::Branch { cond, target, fallthrough, taken_extra } => {
                if exec::cond_met(cpu, cond) {
                    cycles += taken_extra as u32;
                    cpu.pc = target;
                    Some(target)
                } else {
                    cpu.pc = fallthrough;
                    Some(fallthrough)
                }
            }
            Exit::Call { cond, target, resume, taken_extra } => {
                if cond.is_none_or(|c| exec::cond_met(cpu, c)) {
                    cycles += taken_extra as u32;
                    cpu.push_word(resume, mmu);
                    cpu.pc = target;
                    Some(target)
                } else {
                    cpu.pc = resume;
                    Some(resume)
                }
            }
            Exit::Rst { target, resume } => {
                cpu.push_word(resume, mmu);
                cpu.pc = target;
                Some(target)
            }
            Exit::Ret { cond, fallthrough, taken_extra, enable_ime } => {
                if cond.is_none_or(|c| exec::cond_met(cpu, c)) {
                    cycles += taken_extra as u32;
                    cpu.pc = cpu.pop_word(mmu);
                    if enable_ime {
                        cpu.ime = true;
                    }
                    None
                } else {
                    // The not-taken path must continue at the address after
                    // the RET, never at the stale PC.
                    cpu.pc = fallthrough;
                    Some(fallthrough)
                }
            }
            Exit::Indirect => {
                cpu.pc = cpu.hl();
                None
            }
            Exit::Halt { resume } => {
                // Unconditional: the engine stops dispatching until the next
                // interrupt wakes the guest.
                cpu.pc = resume;
                cpu.halted = true;
                halted = true;
                Some(resume)
            }
        };

        BlockResult { next, cycles, halted }
    }
}
