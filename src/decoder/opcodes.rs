//! Metadata for the 256 primary opcode slots: mnemonic, encoded length and
//! cycle cost. Conditional control flow carries a (not-taken, taken) pair.
//! CB-prefixed metadata is regular enough to be computed in `decoder::decode`.

use super::{Cycles, Meta};
use lazy_static::lazy_static;

macro_rules! instr {
    ($mne:expr, $len:expr, $cyc:expr) => {
        Meta::new($mne, $len, Cycles::Fixed($cyc))
    };
    ($mne:expr, $len:expr, $nt:expr, $tk:expr) => {
        Meta::new($mne, $len, Cycles::Branch { not_taken: $nt, taken: $tk })
    };
}
macro_rules! invalid {
    () => {
        Meta::invalid()
    };
}

lazy_static! {
    pub static ref OPCODES: [Meta; 256] = [
        // --- 0x00 ---
        instr!("NOP", 1, 4),
        instr!("LD BC, d16", 3, 12),
        instr!("LD (BC), A", 1, 8),
        instr!("INC BC", 1, 8),
        instr!("INC B", 1, 4),
        instr!("DEC B", 1, 4),
        instr!("LD B, d8", 2, 8),
        instr!("RLCA", 1, 4),
        instr!("LD (a16), SP", 3, 20),
        instr!("ADD HL, BC", 1, 8),
        instr!("LD A, (BC)", 1, 8),
        instr!("DEC BC", 1, 8),
        instr!("INC C", 1, 4),
        instr!("DEC C", 1, 4),
        instr!("LD C, d8", 2, 8),
        instr!("RRCA", 1, 4),
        // --- 0x10 ---
        instr!("STOP", 2, 4),
        instr!("LD DE, d16", 3, 12),
        instr!("LD (DE), A", 1, 8),
        instr!("INC DE", 1, 8),
        instr!("INC D", 1, 4),
        instr!("DEC D", 1, 4),
        instr!("LD D, d8", 2, 8),
        instr!("RLA", 1, 4),
        instr!("JR r8", 2, 12),
        instr!("ADD HL, DE", 1, 8),
        instr!("LD A, (DE)", 1, 8),
        instr!("DEC DE", 1, 8),
        instr!("INC E", 1, 4),
        instr!("DEC E", 1, 4),
        instr!("LD E, d8", 2, 8),
        instr!("RRA", 1, 4),
        // --- 0x20 ---
        instr!("JR NZ, r8", 2, 8, 12),
        instr!("LD HL, d16", 3, 12),
        instr!("LD (HL+), A", 1, 8),
        instr!("INC HL", 1, 8),
        instr!("INC H", 1, 4),
        instr!("DEC H", 1, 4),
        instr!("LD H, d8", 2, 8),
        instr!("DAA", 1, 4),
        instr!("JR Z, r8", 2, 8, 12),
        instr!("ADD HL, HL", 1, 8),
        instr!("LD A, (HL+)", 1, 8),
        instr!("DEC HL", 1, 8),
        instr!("INC L", 1, 4),
        instr!("DEC L", 1, 4),
        instr!("LD L, d8", 2, 8),
        instr!("CPL", 1, 4),
        // --- 0x30 ---
        instr!("JR NC, r8", 2, 8, 12),
        instr!("LD SP, d16", 3, 12),
        instr!("LD (HL-), A", 1, 8),
        instr!("INC SP", 1, 8),
        instr!("INC (HL)", 1, 12),
        instr!("DEC (HL)", 1, 12),
        instr!("LD (HL), d8", 2, 12),
        instr!("SCF", 1, 4),
        instr!("JR C, r8", 2, 8, 12),
        instr!("ADD HL, SP", 1, 8),
        instr!("LD A, (HL-)", 1, 8),
        instr!("DEC SP", 1, 8),
        instr!("INC A", 1, 4),
        instr!("DEC A", 1, 4),
        instr!("LD A, d8", 2, 8),
        instr!("CCF", 1, 4),
        // --- 0x40: LD B/C, r ---
        instr!("LD B, B", 1, 4), instr!("LD B, C", 1, 4),
        instr!("LD B, D", 1, 4), instr!("LD B, E", 1, 4),
        instr!("LD B, H", 1, 4), instr!("LD B, L", 1, 4),
        instr!("LD B, (HL)", 1, 8), instr!("LD B, A", 1, 4),
        instr!("LD C, B", 1, 4), instr!("LD C, C", 1, 4),
        instr!("LD C, D", 1, 4), instr!("LD C, E", 1, 4),
        instr!("LD C, H", 1, 4), instr!("LD C, L", 1, 4),
        instr!("LD C, (HL)", 1, 8), instr!("LD C, A", 1, 4),
        // --- 0x50: LD D/E, r ---
        instr!("LD D, B", 1, 4), instr!("LD D, C", 1, 4),
        instr!("LD D, D", 1, 4), instr!("LD D, E", 1, 4),
        instr!("LD D, H", 1, 4), instr!("LD D, L", 1, 4),
        instr!("LD D, (HL)", 1, 8), instr!("LD D, A", 1, 4),
        instr!("LD E, B", 1, 4), instr!("LD E, C", 1, 4),
        instr!("LD E, D", 1, 4), instr!("LD E, E", 1, 4),
        instr!("LD E, H", 1, 4), instr!("LD E, L", 1, 4),
        instr!("LD E, (HL)", 1, 8), instr!("LD E, A", 1, 4),
        // --- 0x60: LD H/L, r ---
        instr!("LD H, B", 1, 4), instr!("LD H, C", 1, 4),
        instr!("LD H, D", 1, 4), instr!("LD H, E", 1, 4),
        instr!("LD H, H", 1, 4), instr!("LD H, L", 1, 4),
        instr!("LD H, (HL)", 1, 8), instr!("LD H, A", 1, 4),
        instr!("LD L, B", 1, 4), instr!("LD L, C", 1, 4),
        instr!("LD L, D", 1, 4), instr!("LD L, E", 1, 4),
        instr!("LD L, H", 1, 4), instr!("LD L, L", 1, 4),
        instr!("LD L, (HL)", 1, 8), instr!("LD L, A", 1, 4),
        // --- 0x70: LD (HL), r / HALT / LD A, r ---
        instr!("LD (HL), B", 1, 8), instr!("LD (HL), C", 1, 8),
        instr!("LD (HL), D", 1, 8), instr!("LD (HL), E", 1, 8),
        instr!("LD (HL), H", 1, 8), instr!("LD (HL), L", 1, 8),
        instr!("HALT", 1, 4), instr!("LD (HL), A", 1, 8),
        instr!("LD A, B", 1, 4), instr!("LD A, C", 1, 4),
        instr!("LD A, D", 1, 4), instr!("LD A, E", 1, 4),
        instr!("LD A, H", 1, 4), instr!("LD A, L", 1, 4),
        instr!("LD A, (HL)", 1, 8), instr!("LD A, A", 1, 4),
        // --- 0x80: ADD / ADC ---
        instr!("ADD A, B", 1, 4), instr!("ADD A, C", 1, 4),
        instr!("ADD A, D", 1, 4), instr!("ADD A, E", 1, 4),
        instr!("ADD A, H", 1, 4), instr!("ADD A, L", 1, 4),
        instr!("ADD A, (HL)", 1, 8), instr!("ADD A, A", 1, 4),
        instr!("ADC A, B", 1, 4), instr!("ADC A, C", 1, 4),
        instr!("ADC A, D", 1, 4), instr!("ADC A, E", 1, 4),
        instr!("ADC A, H", 1, 4), instr!("ADC A, L", 1, 4),
        instr!("ADC A, (HL)", 1, 8), instr!("ADC A, A", 1, 4),
        // --- 0x90: SUB / SBC ---
        instr!("SUB A, B", 1, 4), instr!("SUB A, C", 1, 4),
        instr!("SUB A, D", 1, 4), instr!("SUB A, E", 1, 4),
        instr!("SUB A, H", 1, 4), instr!("SUB A, L", 1, 4),
        instr!("SUB A, (HL)", 1, 8), instr!("SUB A, A", 1, 4),
        instr!("SBC A, B", 1, 4), instr!("SBC A, C", 1, 4),
        instr!("SBC A, D", 1, 4), instr!("SBC A, E", 1, 4),
        instr!("SBC A, H", 1, 4), instr!("SBC A, L", 1, 4),
        instr!("SBC A, (HL)", 1, 8), instr!("SBC A, A", 1, 4),
        // --- 0xA0: AND / XOR ---
        instr!("AND A, B", 1, 4), instr!("AND A, C", 1, 4),
        instr!("AND A, D", 1, 4), instr!("AND A, E", 1, 4),
        instr!("AND A, H", 1, 4), instr!("AND A, L", 1, 4),
        instr!("AND A, (HL)", 1, 8), instr!("AND A, A", 1, 4),
        instr!("XOR A, B", 1, 4), instr!("XOR A, C", 1, 4),
        instr!("XOR A, D", 1, 4), instr!("XOR A, E", 1, 4),
        instr!("XOR A, H", 1, 4), instr!("XOR A, L", 1, 4),
        instr!("XOR A, (HL)", 1, 8), instr!("XOR A, A", 1, 4),
        // --- 0xB0: OR / CP ---
        instr!("OR A, B", 1, 4), instr!("OR A, C", 1, 4),
        instr!("OR A, D", 1, 4), instr!("OR A, E", 1, 4),
        instr!("OR A, H", 1, 4), instr!("OR A, L", 1, 4),
        instr!("OR A, (HL)", 1, 8), instr!("OR A, A", 1, 4),
        instr!("CP A, B", 1, 4), instr!("CP A, C", 1, 4),
        instr!("CP A, D", 1, 4), instr!("CP A, E", 1, 4),
        instr!("CP A, H", 1, 4), instr!("CP A, L", 1, 4),
        instr!("CP A, (HL)", 1, 8), instr!("CP A, A", 1, 4),
        // --- 0xC0 ---
        instr!("RET NZ", 1, 8, 20),
        instr!("POP BC", 1, 12),
        instr!("JP NZ, a16", 3, 12, 16),
        instr!("JP a16", 3, 16),
        instr!("CALL NZ, a16", 3, 12, 24),
        instr!("PUSH BC", 1, 16),
        instr!("ADD A, d8", 2, 8),
        instr!("RST 00H", 1, 16),
        instr!("RET Z", 1, 8, 20),
        instr!("RET", 1, 16),
        instr!("JP Z, a16", 3, 12, 16),
        instr!("PREFIX CB", 1, 4), // never surfaced; decode() substitutes CB metadata
        instr!("CALL Z, a16", 3, 12, 24),
        instr!("CALL a16", 3, 24),
        instr!("ADC A, d8", 2, 8),
        instr!("RST 08H", 1, 16),
        // --- 0xD0 ---
        instr!("RET NC", 1, 8, 20),
        instr!("POP DE", 1, 12),
        instr!("JP NC, a16", 3, 12, 16),
        invalid!(),
        instr!("CALL NC, a16", 3, 12, 24),
        instr!("PUSH DE", 1, 16),
        instr!("SUB A, d8", 2, 8),
        instr!("RST 10H", 1, 16),
        instr!("RET C", 1, 8, 20),
        instr!("RETI", 1, 16),
        instr!("JP C, a16", 3, 12, 16),
        invalid!(),
        instr!("CALL C, a16", 3, 12, 24),
        invalid!(),
        instr!("SBC A, d8", 2, 8),
        instr!("RST 18H", 1, 16),
        // --- 0xE0 ---
        instr!("LDH (a8), A", 2, 12),
        instr!("POP HL", 1, 12),
        instr!("LD (C), A", 1, 8),
        invalid!(),
        invalid!(),
        instr!("PUSH HL", 1, 16),
        instr!("AND A, d8", 2, 8),
        instr!("RST 20H", 1, 16),
        instr!("ADD SP, r8", 2, 16),
        instr!("JP HL", 1, 4),
        instr!("LD (a16), A", 3, 16),
        invalid!(),
        invalid!(),
        invalid!(),
        instr!("XOR A, d8", 2, 8),
        instr!("RST 28H", 1, 16),
        // --- 0xF0 ---
        instr!("LDH A, (a8)", 2, 12),
        instr!("POP AF", 1, 12),
        instr!("LD A, (C)", 1, 8),
        instr!("DI", 1, 4),
        invalid!(),
        instr!("PUSH AF", 1, 16),
        instr!("OR A, d8", 2, 8),
        instr!("RST 30H", 1, 16),
        instr!("LD HL, SP+r8", 2, 12),
        instr!("LD SP, HL", 1, 8),
        instr!("LD A, (a16)", 3, 16),
        instr!("EI", 1, 4),
        invalid!(),
        invalid!(),
        instr!("CP A, d8", 2, 8),
        instr!("RST 38H", 1, 16),
    ];
}
