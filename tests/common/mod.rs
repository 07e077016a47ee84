//! Shared helpers: assemble tiny ROM images and spin up engines.

#![allow(dead_code)] // not every suite uses every helper

use dmgjit::analysis::blocks::CodeDatabase;
use dmgjit::analysis::cfg::ControlFlowGraph;
use dmgjit::analysis::constants::ConstantAnalysis;
use dmgjit::analysis::flags::FlagLiveness;
use dmgjit::analysis::registers::RegisterLiveness;
use dmgjit::cartridge::{Cartridge, compute_header_checksum};
use dmgjit::cpu_state::CpuState;
use dmgjit::engine::Engine;
use dmgjit::mmu::Mmu;

/// Builds a 32 KiB ROM-only image with a valid header and the given byte
/// runs patched in.
pub fn build_rom(code: &[(usize, &[u8])]) -> Vec<u8> {
    let mut rom = vec![0u8; 0x8000];
    for (addr, bytes) in code {
        rom[*addr..*addr + bytes.len()].copy_from_slice(bytes);
    }
    rom[0x0147] = 0x00; // ROM only
    rom[0x0148] = 0x00;
    rom[0x0149] = 0x00;
    rom[0x014D] = compute_header_checksum(&rom);
    rom
}

/// The full static pipeline over a ROM image.
pub struct Analyzed {
    pub rom: Vec<u8>,
    pub db: CodeDatabase,
    pub cfg: ControlFlowGraph,
    pub flags: FlagLiveness,
    pub regs: RegisterLiveness,
    pub consts: ConstantAnalysis,
}

pub fn analyze(code: &[(usize, &[u8])]) -> Analyzed {
    let rom = build_rom(code);
    let db = CodeDatabase::analyze(&rom);
    let cfg = ControlFlowGraph::build(&db);
    let flags = FlagLiveness::analyze(&db, &cfg);
    let regs = RegisterLiveness::analyze(&db, &cfg);
    let consts = ConstantAnalysis::analyze(&db, &cfg);
    Analyzed { rom, db, cfg, flags, regs, consts }
}

pub fn engine(code: &[(usize, &[u8])]) -> Engine {
    Engine::new(build_rom(code)).expect("engine construction")
}

/// A fresh post-boot CPU and a bus over the given image.
pub fn cpu_and_mmu(rom: Vec<u8>) -> (CpuState, Mmu) {
    let cart = Cartridge::load(rom).expect("cartridge");
    let mut mmu = Mmu::new(&cart);
    let cpu = CpuState::post_boot();
    CpuState::initialize_post_boot_io(&mut mmu);
    (cpu, mmu)
}

/// Snapshot of the observable register file for equivalence checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegSnapshot {
    pub a: u8,
    pub f: u8,
    pub b: u8,
    pub c: u8,
    pub d: u8,
    pub e: u8,
    pub h: u8,
    pub l: u8,
    pub sp: u16,
    pub pc: u16,
}

pub fn snapshot(cpu: &CpuState) -> RegSnapshot {
    RegSnapshot {
        a: cpu.a,
        f: cpu.f,
        b: cpu.b,
        c: cpu.c,
        d: cpu.d,
        e: cpu.e,
        h: cpu.h,
        l: cpu.l,
        sp: cpu.sp,
        pc: cpu.pc,
    }
}
