//! Semantic core: applies one typed instruction to guest state.
//!
//! Straight-line semantics live in [`run_straight`], which takes the set of
//! flags to materialize; transpiled blocks pass the liveness-narrowed mask,
//! the interpreter passes the instruction's full write set. Control-flow
//! semantics (used only by the interpreter; compiled blocks evaluate their
//! typed exit instead) live in [`execute`].

use crate::alu;
use crate::cpu_state::{CpuState, FLAG_C, FLAG_H, FLAG_N, FlagSet};
use crate::decoder::{AluOp, AluSrc, Cond, Instruction, Op, Place, Reg8, Reg16, RotOp, StackReg, Target8};
use crate::mmu::Mmu;

// --- Register plumbing shared with the transpiler and engine ---

#[inline]
pub fn get_reg8(cpu: &CpuState, r: Reg8) -> u8 {
    match r {
        Reg8::A => cpu.a,
        Reg8::B => cpu.b,
        Reg8::C => cpu.c,
        Reg8::D => cpu.d,
        Reg8::E => cpu.e,
        Reg8::H => cpu.h,
        Reg8::L => cpu.l,
    }
}

#[inline]
pub fn set_reg8(cpu: &mut CpuState, r: Reg8, value: u8) {
    match r {
        Reg8::A => cpu.a = value,
        Reg8::B => cpu.b = value,
        Reg8::C => cpu.c = value,
        Reg8::D => cpu.d = value,
        Reg8::E => cpu.e = value,
        Reg8::H => cpu.h = value,
        Reg8::L => cpu.l = value,
    }
}

#[inline]
pub fn get_reg16(cpu: &CpuState, rr: Reg16) -> u16 {
    match rr {
        Reg16::BC => cpu.bc(),
        Reg16::DE => cpu.de(),
        Reg16::HL => cpu.hl(),
        Reg16::SP => cpu.sp,
    }
}

#[inline]
pub fn set_reg16(cpu: &mut CpuState, rr: Reg16, value: u16) {
    match rr {
        Reg16::BC => cpu.set_bc(value),
        Reg16::DE => cpu.set_de(value),
        Reg16::HL => cpu.set_hl(value),
        Reg16::SP => cpu.sp = value,
    }
}

#[inline]
pub fn cond_met(cpu: &CpuState, cond: Cond) -> bool {
    match cond {
        Cond::Nz => !cpu.flag(crate::cpu_state::FLAG_Z),
        Cond::Z => cpu.flag(crate::cpu_state::FLAG_Z),
        Cond::Nc => !cpu.flag(FLAG_C),
        Cond::C => cpu.flag(FLAG_C),
    }
}

/// Reads an 8-bit place, applying the HL post-increment/decrement modes.
pub fn read_place(cpu: &mut CpuState, mmu: &Mmu, place: Place) -> u8 {
    match place {
        Place::Reg(r) => get_reg8(cpu, r),
        Place::HlInd => mmu.read8(cpu.hl()),
        Place::BcInd => mmu.read8(cpu.bc()),
        Place::DeInd => mmu.read8(cpu.de()),
        Place::HliInd => {
            let addr = cpu.hl();
            cpu.set_hl(addr.wrapping_add(1));
            mmu.read8(addr)
        }
        Place::HldInd => {
            let addr = cpu.hl();
            cpu.set_hl(addr.wrapping_sub(1));
            mmu.read8(addr)
        }
        Place::Abs(addr) => mmu.read8(addr),
        Place::High(offset) => mmu.read8(0xFF00 | offset as u16),
        Place::HighC => mmu.read8(0xFF00 | cpu.c as u16),
    }
}

/// Writes an 8-bit place, applying the HL post-increment/decrement modes.
pub fn write_place(cpu: &mut CpuState, mmu: &mut Mmu, place: Place, value: u8) {
    match place {
        Place::Reg(r) => set_reg8(cpu, r, value),
        Place::HlInd => mmu.write8(cpu.hl(), value),
        Place::BcInd => mmu.write8(cpu.bc(), value),
        Place::DeInd => mmu.write8(cpu.de(), value),
        Place::HliInd => {
            let addr = cpu.hl();
            mmu.write8(addr, value);
            cpu.set_hl(addr.wrapping_add(1));
        }
        Place::HldInd => {
            let addr = cpu.hl();
            mmu.write8(addr, value);
            cpu.set_hl(addr.wrapping_sub(1));
        }
        Place::Abs(addr) => mmu.write8(addr, value),
        Place::High(offset) => mmu.write8(0xFF00 | offset as u16, value),
        Place::HighC => mmu.write8(0xFF00 | cpu.c as u16, value),
    }
}

#[inline]
fn read_target(cpu: &CpuState, mmu: &Mmu, target: Target8) -> u8 {
    match target {
        Target8::Reg(r) => get_reg8(cpu, r),
        Target8::HlInd => mmu.read8(cpu.hl()),
    }
}

#[inline]
fn write_target(cpu: &mut CpuState, mmu: &mut Mmu, target: Target8, value: u8) {
    match target {
        Target8::Reg(r) => set_reg8(cpu, r, value),
        Target8::HlInd => mmu.write8(cpu.hl(), value),
    }
}

/// Evaluates the ALU input operand.
#[inline]
pub fn alu_operand(cpu: &CpuState, mmu: &Mmu, src: AluSrc) -> u8 {
    match src {
        AluSrc::Reg(r) => get_reg8(cpu, r),
        AluSrc::HlInd => mmu.read8(cpu.hl()),
        AluSrc::Imm(value) => value,
    }
}

/// Applies an ALU operation to `(a, operand)`, returning the new accumulator
/// (unchanged for CP) and the full flag byte.
pub fn apply_alu(op: AluOp, a: u8, operand: u8, carry_in: bool) -> (u8, u8) {
    match op {
        AluOp::Add => alu::add8(a, operand, false),
        AluOp::Adc => alu::add8(a, operand, carry_in),
        AluOp::Sub => alu::sub8(a, operand, false),
        AluOp::Sbc => alu::sub8(a, operand, carry_in),
        AluOp::And => alu::and8(a, operand),
        AluOp::Xor => alu::xor8(a, operand),
        AluOp::Or => alu::or8(a, operand),
        AluOp::Cp => {
            let (_, flags) = alu::sub8(a, operand, false);
            (a, flags)
        }
    }
}

/// Applies a rotate/shift helper to `value`, returning `(result, flags)`.
pub fn apply_rot(op: RotOp, value: u8, carry_in: bool) -> (u8, u8) {
    match op {
        RotOp::Rlc => alu::rlc(value),
        RotOp::Rrc => alu::rrc(value),
        RotOp::Rl => alu::rl(value, carry_in),
        RotOp::Rr => alu::rr(value, carry_in),
        RotOp::Sla => alu::sla(value),
        RotOp::Sra => alu::sra(value),
        RotOp::Swap => alu::swap(value),
        RotOp::Srl => alu::srl(value),
    }
}

/// Executes one non-terminator instruction. `mask` selects which of the
/// instruction's flag writes are committed to F.
pub fn run_straight(cpu: &mut CpuState, mmu: &mut Mmu, op: &Op, mask: FlagSet) {
    match *op {
        Op::Nop => {}
        Op::Stop => cpu.stopped = true,
        Op::Di => {
            cpu.ime = false;
            cpu.ime_scheduled = false;
        }
        Op::Ei => cpu.ime_scheduled = true,
        // Data bytes decoded in a code position; treated as a no-op.
        Op::Invalid(_) => {}
        Op::Ld { dst, src } => {
            let value = read_place(cpu, mmu, src);
            write_place(cpu, mmu, dst, value);
        }
        Op::LdImm { dst, value } => write_target(cpu, mmu, dst, value),
        Op::Ld16 { dst, value } => set_reg16(cpu, dst, value),
        Op::LdSpHl => cpu.sp = cpu.hl(),
        Op::LdHlSpOff(offset) => {
            let (value, flags) = alu::add_sp(cpu.sp, offset);
            cpu.set_hl(value);
            cpu.apply_flags(flags, mask);
        }
        Op::LdMemSp(addr) => mmu.write16(addr, cpu.sp),
        Op::AddSp(offset) => {
            let (value, flags) = alu::add_sp(cpu.sp, offset);
            cpu.sp = value;
            cpu.apply_flags(flags, mask);
        }
        Op::Inc16(rr) => set_reg16(cpu, rr, get_reg16(cpu, rr).wrapping_add(1)),
        Op::Dec16(rr) => set_reg16(cpu, rr, get_reg16(cpu, rr).wrapping_sub(1)),
        Op::Inc8(target) => {
            let (result, flags) = alu::inc8(read_target(cpu, mmu, target));
            write_target(cpu, mmu, target, result);
            cpu.apply_flags(flags, mask);
        }
        Op::Dec8(target) => {
            let (result, flags) = alu::dec8(read_target(cpu, mmu, target));
            write_target(cpu, mmu, target, result);
            cpu.apply_flags(flags, mask);
        }
        Op::AddHl(rr) => {
            let (result, flags) = alu::add_hl(cpu.hl(), get_reg16(cpu, rr));
            cpu.set_hl(result);
            cpu.apply_flags(flags, mask);
        }
        Op::Alu { op, src } => {
            let operand = alu_operand(cpu, mmu, src);
            let (result, flags) = apply_alu(op, cpu.a, operand, cpu.flag(FLAG_C));
            cpu.a = result;
            cpu.apply_flags(flags, mask);
        }
        Op::RotA(rot) => {
            let (result, flags) = apply_rot(rot, cpu.a, cpu.flag(FLAG_C));
            cpu.a = result;
            // The accumulator rotates always clear Z.
            cpu.apply_flags(flags & !crate::cpu_state::FLAG_Z, mask);
        }
        Op::Daa => {
            let (result, flags) = alu::daa(cpu.a, cpu.f);
            cpu.a = result;
            cpu.apply_flags(flags, mask);
        }
        Op::Cpl => {
            cpu.a = !cpu.a;
            cpu.apply_flags(FLAG_N | FLAG_H, mask);
        }
        Op::Scf => cpu.apply_flags(FLAG_C, mask),
        Op::Ccf => {
            let flags = if cpu.flag(FLAG_C) { 0 } else { FLAG_C };
            cpu.apply_flags(flags, mask);
        }
        Op::Rot { op, target } => {
            let value = read_target(cpu, mmu, target);
            let (result, flags) = apply_rot(op, value, cpu.flag(FLAG_C));
            write_target(cpu, mmu, target, result);
            cpu.apply_flags(flags, mask);
        }
        Op::Bit { bit, target } => {
            let value = read_target(cpu, mmu, target);
            cpu.apply_flags(alu::bit(bit, value), mask);
        }
        Op::Res { bit, target } => {
            let value = read_target(cpu, mmu, target);
            write_target(cpu, mmu, target, alu::res(bit, value));
        }
        Op::Set { bit, target } => {
            let value = read_target(cpu, mmu, target);
            write_target(cpu, mmu, target, alu::set(bit, value));
        }
        Op::Push(rr) => {
            let value = match rr {
                StackReg::BC => cpu.bc(),
                StackReg::DE => cpu.de(),
                StackReg::HL => cpu.hl(),
                StackReg::AF => cpu.af(),
            };
            cpu.push_word(value, mmu);
        }
        Op::Pop(rr) => {
            let value = cpu.pop_word(mmu);
            match rr {
                StackReg::BC => cpu.set_bc(value),
                StackReg::DE => cpu.set_de(value),
                StackReg::HL => cpu.set_hl(value),
                // set_af masks the phantom low nibble of F.
                StackReg::AF => cpu.set_af(value),
            }
        }
        // Terminators are not straight-line work.
        Op::Jr { .. }
        | Op::Jp { .. }
        | Op::JpHl
        | Op::Call { .. }
        | Op::Ret { .. }
        | Op::Reti
        | Op::Rst(_)
        | Op::Halt => {
            debug_assert!(false, "terminator passed to run_straight: {:?}", op);
        }
    }
}

/// Result of interpreting a single instruction.
#[derive(Debug, Clone, Copy)]
pub struct ExecResult {
    pub cycles: u32,
    /// True when the instruction was an unused opcode slot.
    pub unknown: bool,
}

/// Interprets one instruction, control flow included. The PC is advanced past
/// the instruction first, then control transfers overwrite it, so relative
/// and return semantics match the hardware.
pub fn execute(cpu: &mut CpuState, mmu: &mut Mmu, instr: &Instruction) -> ExecResult {
    cpu.pc = instr.next_addr();
    let mut cycles = instr.cycles.base() as u32;
    let mut unknown = false;

    match instr.op {
        Op::Jr { cond, target } | Op::Jp { cond, target } => {
            if cond.is_none_or(|c| cond_met(cpu, c)) {
                cpu.pc = target;
                cycles += instr.cycles.taken_extra() as u32;
            }
        }
        Op::JpHl => cpu.pc = cpu.hl(),
        Op::Call { cond, target } => {
            if cond.is_none_or(|c| cond_met(cpu, c)) {
                cpu.push_word(instr.next_addr(), mmu);
                cpu.pc = target;
                cycles += instr.cycles.taken_extra() as u32;
            }
        }
        Op::Rst(vector) => {
            cpu.push_word(instr.next_addr(), mmu);
            cpu.pc = vector;
        }
        Op::Ret { cond } => {
            if cond.is_none_or(|c| cond_met(cpu, c)) {
                cpu.pc = cpu.pop_word(mmu);
                cycles += instr.cycles.taken_extra() as u32;
            }
        }
        Op::Reti => {
            cpu.pc = cpu.pop_word(mmu);
            cpu.ime = true;
        }
        // The guest stays halted until the next interrupt wakes it.
        Op::Halt => cpu.halted = true,
        Op::Invalid(opcode) => {
            log::warn!("unknown opcode {:#04X} at {:#06X}", opcode, instr.addr);
            unknown = true;
        }
        _ => run_straight(cpu, mmu, &instr.op, instr.op.flags_written()),
    }

    ExecResult { cycles, unknown }
}
