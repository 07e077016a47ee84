//! Typed decoder for the SM83 instruction set.
//!
//! Every primary and CB-prefixed opcode decodes to an [`Op`] with structured
//! operands; mnemonic strings exist only as table metadata for logs and
//! disassembly. The decoder is total: the eleven unused primary slots decode
//! to [`Op::Invalid`] (length 1, 4 cycles).

mod opcodes;

pub use opcodes::OPCODES;

use crate::cpu_state::FlagSet;

// --- Operand kinds ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Reg8 {
    A,
    B,
    C,
    D,
    E,
    H,
    L,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Reg16 {
    BC,
    DE,
    HL,
    SP,
}

/// Pairs addressable by PUSH/POP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StackReg {
    BC,
    DE,
    HL,
    AF,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Cond {
    Nz,
    Z,
    Nc,
    C,
}

/// An 8-bit location reachable by a load: a register or one of the memory
/// addressing modes. Loads never have two memory operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Place {
    Reg(Reg8),
    HlInd,
    BcInd,
    DeInd,
    /// `(HL+)`: reads/writes through HL, then increments HL.
    HliInd,
    /// `(HL-)`: reads/writes through HL, then decrements HL.
    HldInd,
    Abs(u16),
    /// `(0xFF00 + a8)`.
    High(u8),
    /// `(0xFF00 + C)`.
    HighC,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AluOp {
    Add,
    Adc,
    Sub,
    Sbc,
    And,
    Xor,
    Or,
    Cp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AluSrc {
    Reg(Reg8),
    HlInd,
    Imm(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotOp {
    Rlc,
    Rrc,
    Rl,
    Rr,
    Sla,
    Sra,
    Swap,
    Srl,
}

/// Target of a CB operation or of INC/DEC/`LD _, n`: a register or `(HL)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target8 {
    Reg(Reg8),
    HlInd,
}

impl Target8 {
    fn from_bits(bits: u8) -> Target8 {
        match bits & 0x07 {
            0 => Target8::Reg(Reg8::B),
            1 => Target8::Reg(Reg8::C),
            2 => Target8::Reg(Reg8::D),
            3 => Target8::Reg(Reg8::E),
            4 => Target8::Reg(Reg8::H),
            5 => Target8::Reg(Reg8::L),
            6 => Target8::HlInd,
            _ => Target8::Reg(Reg8::A),
        }
    }

    fn as_place(self) -> Place {
        match self {
            Target8::Reg(r) => Place::Reg(r),
            Target8::HlInd => Place::HlInd,
        }
    }
}

// --- The instruction sum type ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Nop,
    Stop,
    Halt,
    Di,
    Ei,
    Invalid(u8),
    /// All 8-bit moves, including the memory addressing modes.
    Ld { dst: Place, src: Place },
    /// `LD r, n` and `LD (HL), n`.
    LdImm { dst: Target8, value: u8 },
    Ld16 { dst: Reg16, value: u16 },
    LdSpHl,
    LdHlSpOff(i8),
    LdMemSp(u16),
    AddSp(i8),
    Inc16(Reg16),
    Dec16(Reg16),
    Inc8(Target8),
    Dec8(Target8),
    AddHl(Reg16),
    Alu { op: AluOp, src: AluSrc },
    /// RLCA/RRCA/RLA/RRA: like the CB rotate but Z is cleared.
    RotA(RotOp),
    Daa,
    Cpl,
    Scf,
    Ccf,
    Rot { op: RotOp, target: Target8 },
    Bit { bit: u8, target: Target8 },
    Res { bit: u8, target: Target8 },
    Set { bit: u8, target: Target8 },
    /// Relative jump with the target already resolved to an absolute address.
    Jr { cond: Option<Cond>, target: u16 },
    Jp { cond: Option<Cond>, target: u16 },
    JpHl,
    Call { cond: Option<Cond>, target: u16 },
    Ret { cond: Option<Cond> },
    Reti,
    Rst(u16),
    Push(StackReg),
    Pop(StackReg),
}

/// How an instruction can end a basic block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitClass {
    /// Not a terminator.
    None,
    Jump,
    Branch,
    Call,
    Return,
    Halt,
    Indirect,
}

impl Op {
    /// Classifies the instruction for the block analyzer.
    pub fn exit_class(&self) -> ExitClass {
        match self {
            Op::Jp { cond: None, .. } | Op::Jr { cond: None, .. } => ExitClass::Jump,
            Op::Jp { cond: Some(_), .. } | Op::Jr { cond: Some(_), .. } => ExitClass::Branch,
            Op::Call { .. } | Op::Rst(_) => ExitClass::Call,
            Op::Ret { .. } | Op::Reti => ExitClass::Return,
            Op::Halt => ExitClass::Halt,
            Op::JpHl => ExitClass::Indirect,
            _ => ExitClass::None,
        }
    }

    pub fn is_terminator(&self) -> bool {
        self.exit_class() != ExitClass::None
    }

    /// Static branch/call targets recoverable from the encoding.
    pub fn static_targets(&self) -> Vec<u16> {
        match self {
            Op::Jp { target, .. }
            | Op::Jr { target, .. }
            | Op::Call { target, .. }
            | Op::Rst(target) => vec![*target],
            _ => Vec::new(),
        }
    }

    /// The set of flags this instruction writes. On the SM83 every flag write
    /// is unconditional, so this doubles as the kill set.
    pub fn flags_written(&self) -> FlagSet {
        match self {
            // AND/OR/XOR/CP force some flags to fixed values, but they still write all four.
            Op::Alu { .. } => FlagSet::ZNHC,
            Op::Inc8(_) => FlagSet::Z | FlagSet::N | FlagSet::H,
            Op::Dec8(_) => FlagSet::Z | FlagSet::N | FlagSet::H,
            Op::AddHl(_) => FlagSet::N | FlagSet::H | FlagSet::C,
            Op::AddSp(_) | Op::LdHlSpOff(_) => FlagSet::ZNHC,
            Op::RotA(_) => FlagSet::ZNHC,
            Op::Rot { .. } => FlagSet::ZNHC,
            Op::Bit { .. } => FlagSet::Z | FlagSet::N | FlagSet::H,
            Op::Daa => FlagSet::Z | FlagSet::H | FlagSet::C,
            Op::Cpl => FlagSet::N | FlagSet::H,
            Op::Scf | Op::Ccf => FlagSet::N | FlagSet::H | FlagSet::C,
            Op::Pop(StackReg::AF) => FlagSet::ZNHC,
            _ => FlagSet::NONE,
        }
    }
}

/// Cycle cost of an instruction, in T-cycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cycles {
    Fixed(u8),
    Branch { not_taken: u8, taken: u8 },
}

impl Cycles {
    /// The cost when the instruction does not branch.
    #[inline]
    pub fn base(&self) -> u8 {
        match self {
            Cycles::Fixed(n) => *n,
            Cycles::Branch { not_taken, .. } => *not_taken,
        }
    }

    /// Additional cost when a conditional branch is taken.
    #[inline]
    pub fn taken_extra(&self) -> u8 {
        match self {
            Cycles::Fixed(_) => 0,
            Cycles::Branch { not_taken, taken } => taken - not_taken,
        }
    }
}

/// Table metadata for one opcode slot.
#[derive(Debug, Clone, Copy)]
pub struct Meta {
    pub mnemonic: &'static str,
    pub length: u8,
    pub cycles: Cycles,
}

impl Meta {
    pub const fn new(mnemonic: &'static str, length: u8, cycles: Cycles) -> Self {
        Meta {
            mnemonic,
            length,
            cycles,
        }
    }

    pub const fn invalid() -> Self {
        Meta {
            mnemonic: "INVALID",
            length: 1,
            cycles: Cycles::Fixed(4),
        }
    }
}

/// One decoded instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    pub addr: u16,
    /// Primary opcodes are 0x00..=0xFF; CB-prefixed ones are 0xCB00 | x.
    pub opcode: u16,
    pub op: Op,
    pub length: u8,
    pub cycles: Cycles,
    pub mnemonic: &'static str,
}

impl Instruction {
    /// Address of the next sequential instruction.
    #[inline]
    pub fn next_addr(&self) -> u16 {
        self.addr.wrapping_add(self.length as u16)
    }
}

/// Decodes one instruction starting at `addr`, fetching bytes through `fetch`.
pub fn decode(fetch: impl Fn(u16) -> u8, addr: u16) -> Instruction {
    let opcode = fetch(addr);
    if opcode == 0xCB {
        let cb = fetch(addr.wrapping_add(1));
        return Instruction {
            addr,
            opcode: 0xCB00 | cb as u16,
            op: decode_cb(cb),
            length: 2,
            cycles: Cycles::Fixed(cb_cycles(cb)),
            mnemonic: cb_family_name(cb),
        };
    }

    let meta = &OPCODES[opcode as usize];
    let d8 = || fetch(addr.wrapping_add(1));
    let r8 = || fetch(addr.wrapping_add(1)) as i8;
    let d16 = || u16::from_le_bytes([fetch(addr.wrapping_add(1)), fetch(addr.wrapping_add(2))]);
    // Relative targets resolve against the address after the 2-byte instruction.
    let rel = |off: i8| addr.wrapping_add(2).wrapping_add(off as i16 as u16);

    let op = match opcode {
        0x00 => Op::Nop,
        0x01 => Op::Ld16 { dst: Reg16::BC, value: d16() },
        0x02 => Op::Ld { dst: Place::BcInd, src: Place::Reg(Reg8::A) },
        0x03 => Op::Inc16(Reg16::BC),
        0x04 => Op::Inc8(Target8::Reg(Reg8::B)),
        0x05 => Op::Dec8(Target8::Reg(Reg8::B)),
        0x06 => Op::LdImm { dst: Target8::Reg(Reg8::B), value: d8() },
        0x07 => Op::RotA(RotOp::Rlc),
        0x08 => Op::LdMemSp(d16()),
        0x09 => Op::AddHl(Reg16::BC),
        0x0A => Op::Ld { dst: Place::Reg(Reg8::A), src: Place::BcInd },
        0x0B => Op::Dec16(Reg16::BC),
        0x0C => Op::Inc8(Target8::Reg(Reg8::C)),
        0x0D => Op::Dec8(Target8::Reg(Reg8::C)),
        0x0E => Op::LdImm { dst: Target8::Reg(Reg8::C), value: d8() },
        0x0F => Op::RotA(RotOp::Rrc),
        0x10 => Op::Stop,
        0x11 => Op::Ld16 { dst: Reg16::DE, value: d16() },
        0x12 => Op::Ld { dst: Place::DeInd, src: Place::Reg(Reg8::A) },
        0x13 => Op::Inc16(Reg16::DE),
        0x14 => Op::Inc8(Target8::Reg(Reg8::D)),
        0x15 => Op::Dec8(Target8::Reg(Reg8::D)),
        0x16 => Op::LdImm { dst: Target8::Reg(Reg8::D), value: d8() },
        0x17 => Op::RotA(RotOp::Rl),
        0x18 => Op::Jr { cond: None, target: rel(r8()) },
        0x19 => Op::AddHl(Reg16::DE),
        0x1A => Op::Ld { dst: Place::Reg(Reg8::A), src: Place::DeInd },
        0x1B => Op::Dec16(Reg16::DE),
        0x1C => Op::Inc8(Target8::Reg(Reg8::E)),
        0x1D => Op::Dec8(Target8::Reg(Reg8::E)),
        0x1E => Op::LdImm { dst: Target8::Reg(Reg8::E), value: d8() },
        0x1F => Op::RotA(RotOp::Rr),
        0x20 => Op::Jr { cond: Some(Cond::Nz), target: rel(r8()) },
        0x21 => Op::Ld16 { dst: Reg16::HL, value: d16() },
        0x22 => Op::Ld { dst: Place::HliInd, src: Place::Reg(Reg8::A) },
        0x23 => Op::Inc16(Reg16::HL),
        0x24 => Op::Inc8(Target8::Reg(Reg8::H)),
        0x25 => Op::Dec8(Target8::Reg(Reg8::H)),
        0x26 => Op::LdImm { dst: Target8::Reg(Reg8::H), value: d8() },
        0x27 => Op::Daa,
        0x28 => Op::Jr { cond: Some(Cond::Z), target: rel(r8()) },
        0x29 => Op::AddHl(Reg16::HL),
        0x2A => Op::Ld { dst: Place::Reg(Reg8::A), src: Place::HliInd },
        0x2B => Op::Dec16(Reg16::HL),
        0x2C => Op::Inc8(Target8::Reg(Reg8::L)),
        0x2D => Op::Dec8(Target8::Reg(Reg8::L)),
        0x2E => Op::LdImm { dst: Target8::Reg(Reg8::L), value: d8() },
        0x2F => Op::Cpl,
        0x30 => Op::Jr { cond: Some(Cond::Nc), target: rel(r8()) },
        0x31 => Op::Ld16 { dst: Reg16::SP, value: d16() },
        0x32 => Op::Ld { dst: Place::HldInd, src: Place::Reg(Reg8::A) },
        0x33 => Op::Inc16(Reg16::SP),
        0x34 => Op::Inc8(Target8::HlInd),
        0x35 => Op::Dec8(Target8::HlInd),
        0x36 => Op::LdImm { dst: Target8::HlInd, value: d8() },
        0x37 => Op::Scf,
        0x38 => Op::Jr { cond: Some(Cond::C), target: rel(r8()) },
        0x39 => Op::AddHl(Reg16::SP),
        0x3A => Op::Ld { dst: Place::Reg(Reg8::A), src: Place::HldInd },
        0x3B => Op::Dec16(Reg16::SP),
        0x3C => Op::Inc8(Target8::Reg(Reg8::A)),
        0x3D => Op::Dec8(Target8::Reg(Reg8::A)),
        0x3E => Op::LdImm { dst: Target8::Reg(Reg8::A), value: d8() },
        0x3F => Op::Ccf,
        0x76 => Op::Halt,
        0x40..=0x7F => Op::Ld {
            dst: Target8::from_bits(opcode >> 3).as_place(),
            src: Target8::from_bits(opcode).as_place(),
        },
        0x80..=0xBF => Op::Alu {
            op: alu_from_bits(opcode >> 3),
            src: match Target8::from_bits(opcode) {
                Target8::Reg(r) => AluSrc::Reg(r),
                Target8::HlInd => AluSrc::HlInd,
            },
        },
        0xC0 => Op::Ret { cond: Some(Cond::Nz) },
        0xC1 => Op::Pop(StackReg::BC),
        0xC2 => Op::Jp { cond: Some(Cond::Nz), target: d16() },
        0xC3 => Op::Jp { cond: None, target: d16() },
        0xC4 => Op::Call { cond: Some(Cond::Nz), target: d16() },
        0xC5 => Op::Push(StackReg::BC),
        0xC6 => Op::Alu { op: AluOp::Add, src: AluSrc::Imm(d8()) },
        0xC7 => Op::Rst(0x00),
        0xC8 => Op::Ret { cond: Some(Cond::Z) },
        0xC9 => Op::Ret { cond: None },
        0xCA => Op::Jp { cond: Some(Cond::Z), target: d16() },
        0xCC => Op::Call { cond: Some(Cond::Z), target: d16() },
        0xCD => Op::Call { cond: None, target: d16() },
        0xCE => Op::Alu { op: AluOp::Adc, src: AluSrc::Imm(d8()) },
        0xCF => Op::Rst(0x08),
        0xD0 => Op::Ret { cond: Some(Cond::Nc) },
        0xD1 => Op::Pop(StackReg::DE),
        0xD2 => Op::Jp { cond: Some(Cond::Nc), target: d16() },
        0xD4 => Op::Call { cond: Some(Cond::Nc), target: d16() },
        0xD5 => Op::Push(StackReg::DE),
        0xD6 => Op::Alu { op: AluOp::Sub, src: AluSrc::Imm(d8()) },
        0xD7 => Op::Rst(0x10),
        0xD8 => Op::Ret { cond: Some(Cond::C) },
        0xD9 => Op::Reti,
        0xDA => Op::Jp { cond: Some(Cond::C), target: d16() },
        0xDC => Op::Call { cond: Some(Cond::C), target: d16() },
        0xDE => Op::Alu { op: AluOp::Sbc, src: AluSrc::Imm(d8()) },
        0xDF => Op::Rst(0x18),
        0xE0 => Op::Ld { dst: Place::High(d8()), src: Place::Reg(Reg8::A) },
        0xE1 => Op::Pop(StackReg::HL),
        0xE2 => Op::Ld { dst: Place::HighC, src: Place::Reg(Reg8::A) },
        0xE5 => Op::Push(StackReg::HL),
        0xE6 => Op::Alu { op: AluOp::And, src: AluSrc::Imm(d8()) },
        0xE7 => Op::Rst(0x20),
        0xE8 => Op::AddSp(r8()),
        0xE9 => Op::JpHl,
        0xEA => Op::Ld { dst: Place::Abs(d16()), src: Place::Reg(Reg8::A) },
        0xEE => Op::Alu { op: AluOp::Xor, src: AluSrc::Imm(d8()) },
        0xEF => Op::Rst(0x28),
        0xF0 => Op::Ld { dst: Place::Reg(Reg8::A), src: Place::High(d8()) },
        0xF1 => Op::Pop(StackReg::AF),
        0xF2 => Op::Ld { dst: Place::Reg(Reg8::A), src: Place::HighC },
        0xF3 => Op::Di,
        0xF5 => Op::Push(StackReg::AF),
        0xF6 => Op::Alu { op: AluOp::Or, src: AluSrc::Imm(d8()) },
        0xF7 => Op::Rst(0x30),
        0xF8 => Op::LdHlSpOff(r8()),
        0xF9 => Op::LdSpHl,
        0xFA => Op::Ld { dst: Place::Reg(Reg8::A), src: Place::Abs(d16()) },
        0xFB => Op::Ei,
        0xFE => Op::Alu { op: AluOp::Cp, src: AluSrc::Imm(d8()) },
        0xFF => Op::Rst(0x38),
        _ => Op::Invalid(opcode),
    };

    Instruction {
        addr,
        opcode: opcode as u16,
        op,
        length: meta.length,
        cycles: meta.cycles,
        mnemonic: meta.mnemonic,
    }
}

/// Decodes against a ROM byte slice; out-of-range reads see open bus (0xFF).
pub fn decode_at(rom: &[u8], addr: u16) -> Instruction {
    decode(|a| rom.get(a as usize).copied().unwrap_or(0xFF), addr)
}

fn alu_from_bits(bits: u8) -> AluOp {
    match bits & 0x07 {
        0 => AluOp::Add,
        1 => AluOp::Adc,
        2 => AluOp::Sub,
        3 => AluOp::Sbc,
        4 => AluOp::And,
        5 => AluOp::Xor,
        6 => AluOp::Or,
        _ => AluOp::Cp,
    }
}

fn decode_cb(cb: u8) -> Op {
    let target = Target8::from_bits(cb);
    let bit = (cb >> 3) & 0x07;
    match cb {
        0x00..=0x07 => Op::Rot { op: RotOp::Rlc, target },
        0x08..=0x0F => Op::Rot { op: RotOp::Rrc, target },
        0x10..=0x17 => Op::Rot { op: RotOp::Rl, target },
        0x18..=0x1F => Op::Rot { op: RotOp::Rr, target },
        0x20..=0x27 => Op::Rot { op: RotOp::Sla, target },
        0x28..=0x2F => Op::Rot { op: RotOp::Sra, target },
        0x30..=0x37 => Op::Rot { op: RotOp::Swap, target },
        0x38..=0x3F => Op::Rot { op: RotOp::Srl, target },
        0x40..=0x7F => Op::Bit { bit, target },
        0x80..=0xBF => Op::Res { bit, target },
        0xC0..=0xFF => Op::Set { bit, target },
    }
}

fn cb_cycles(cb: u8) -> u8 {
    let hl = cb & 0x07 == 6;
    match cb {
        // BIT only reads (HL), so the memory form is cheaper than RMW.
        0x40..=0x7F if hl => 12,
        _ if hl => 16,
        _ => 8,
    }
}

fn cb_family_name(cb: u8) -> &'static str {
    match cb {
        0x00..=0x07 => "RLC",
        0x08..=0x0F => "RRC",
        0x10..=0x17 => "RL",
        0x18..=0x1F => "RR",
        0x20..=0x27 => "SLA",
        0x28..=0x2F => "SRA",
        0x30..=0x37 => "SWAP",
        0x38..=0x3F => "SRL",
        0x40..=0x7F => "BIT",
        0x80..=0xBF => "RES",
        0xC0..=0xFF => "SET",
    }
}

/// Renders an instruction with its operand values substituted, in the style
/// of the metadata mnemonics.
pub fn disassemble(instr: &Instruction) -> String {
    if instr.opcode > 0xFF {
        let target = match instr.op {
            Op::Rot { target, .. }
            | Op::Bit { target, .. }
            | Op::Res { target, .. }
            | Op::Set { target, .. } => target,
            _ => return instr.mnemonic.to_string(),
        };
        let operand = match target {
            Target8::Reg(r) => format!("{:?}", r),
            Target8::HlInd => "(HL)".to_string(),
        };
        return match instr.op {
            Op::Bit { bit, .. } | Op::Res { bit, .. } | Op::Set { bit, .. } => {
                format!("{} {}, {}", instr.mnemonic, bit, operand)
            }
            _ => format!("{} {}", instr.mnemonic, operand),
        };
    }

    match instr.op {
        Op::Jr { target, .. } | Op::Jp { target, .. } | Op::Call { target, .. } => instr
            .mnemonic
            .replace("r8", &format!("${:04X}", target))
            .replace("a16", &format!("${:04X}", target)),
        Op::Ld16 { value, .. } | Op::LdMemSp(value) => {
            instr.mnemonic.replace("d16", &format!("${:04X}", value)).replace(
                "a16",
                &format!("${:04X}", value),
            )
        }
        Op::LdImm { value, .. } => instr.mnemonic.replace("d8", &format!("${:02X}", value)),
        Op::Alu { src: AluSrc::Imm(value), .. } => {
            instr.mnemonic.replace("d8", &format!("${:02X}", value))
        }
        Op::AddSp(off) | Op::LdHlSpOff(off) => {
            instr.mnemonic.replace("r8", &format!("{:+}", off))
        }
        Op::Ld { dst: Place::Abs(a), .. } | Op::Ld { src: Place::Abs(a), .. } => {
            instr.mnemonic.replace("a16", &format!("${:04X}", a))
        }
        Op::Ld { dst: Place::High(o), .. } | Op::Ld { src: Place::High(o), .. } => {
            instr.mnemonic.replace("a8", &format!("${:02X}", o))
        }
        _ => instr.mnemonic.to_string(),
    }
}
