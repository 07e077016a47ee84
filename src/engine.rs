//! Recompilation engine: code cache, dispatcher loop, interrupt service and
//! frame stepping.
//!
//! The dispatcher looks up the compiled block for the current PC, executes
//! it, then performs the between-blocks work: cycle accounting, PPU
//! stepping, interrupt service and the delayed EI promotion. ROM addresses
//! are analyzed and transpiled on first dispatch; everything else gets the
//! per-instruction interpreter routine.

use crate::analysis::blocks::CodeDatabase;
use crate::analysis::cfg::ControlFlowGraph;
use crate::analysis::constants::ConstantAnalysis;
use crate::analysis::flags::FlagLiveness;
use crate::analysis::registers::RegisterLiveness;
use crate::cartridge::Cartridge;
use crate::cpu_state::CpuState;
use crate::interpreter;
use crate::memory_map::{
    IF_ADDR, INTERRUPT_ENABLE_REGISTER, JOYPAD_VECTOR, LCD_STAT_VECTOR, SERIAL_VECTOR,
    TIMER_VECTOR, VBLANK_VECTOR, WRITABLE_START,
};
use crate::mmu::Mmu;
use crate::ppu::Ppu;
use crate::transpiler::{self, CompiledBlock};
use crate::CoreResult;
use std::collections::HashMap;
use std::rc::Rc;

/// One frame of guest time in T-cycles.
pub const CYCLES_PER_FRAME: u32 = 70_224;
/// Cost of taking an interrupt.
pub const INTERRUPT_CYCLES: u32 = 20;

/// Interrupt priority order: bit index and service vector.
const INTERRUPT_TABLE: [(u8, u16); 5] = [
    (0, VBLANK_VECTOR),
    (1, LCD_STAT_VECTOR),
    (2, TIMER_VECTOR),
    (3, SERIAL_VECTOR),
    (4, JOYPAD_VECTOR),
];

#[derive(Debug, Clone, Copy, Default)]
pub struct Stats {
    pub blocks_analyzed: u64,
    pub blocks_compiled: u64,
    pub blocks_executed: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub compile_failures: u64,
    pub interpreter_steps: u64,
    pub interpreter_unknown: u64,
    pub interrupts_serviced: u64,
    pub total_cycles: u64,
}

/// A code-cache entry: either a transpiled block or the per-instruction
/// fallback routine.
#[derive(Clone)]
enum CacheEntry {
    Jit(Rc<CompiledBlock>),
    Fallback,
}

pub struct Engine {
    cpu: CpuState,
    mmu: Mmu,
    ppu: Ppu,
    cartridge: Cartridge,

    db: CodeDatabase,
    flags: FlagLiveness,
    regs: RegisterLiveness,
    consts: ConstantAnalysis,

    cache: HashMap<u16, CacheEntry>,
    stats: Stats,
    stop_requested: bool,
}

impl Engine {
    /// Loads the cartridge and runs the whole-ROM analysis pipeline.
    pub fn new(rom: Vec<u8>) -> CoreResult<Engine> {
        let cartridge = Cartridge::load(rom)?;
        let mut mmu = Mmu::new(&cartridge);

        let db = CodeDatabase::analyze(&cartridge.data);
        let cfg = ControlFlowGraph::build(&db);
        let flags = FlagLiveness::analyze(&db, &cfg);
        let regs = RegisterLiveness::analyze(&db, &cfg);
        let consts = ConstantAnalysis::analyze(&db, &cfg);

        let cpu = CpuState::post_boot();
        CpuState::initialize_post_boot_io(&mut mmu);

        let stats = Stats {
            blocks_analyzed: db.blocks.len() as u64,
            ..Stats::default()
        };

        Ok(Engine {
            cpu,
            mmu,
            ppu: Ppu::new(),
            cartridge,
            db,
            flags,
            regs,
            consts,
            cache: HashMap::new(),
            stats,
            stop_requested: false,
        })
    }

    /// Returns the guest to the post-boot state. The code cache and the
    /// analyses survive: ROM is immutable, so compiled blocks stay valid.
    pub fn reset(&mut self) {
        self.cpu = CpuState::post_boot();
        self.mmu = Mmu::new(&self.cartridge);
        CpuState::initialize_post_boot_io(&mut self.mmu);
        self.ppu = Ppu::new();
        self.stop_requested = false;
    }

    pub fn state(&self) -> &CpuState {
        &self.cpu
    }

    pub fn state_mut(&mut self) -> &mut CpuState {
        &mut self.cpu
    }

    pub fn mmu(&self) -> &Mmu {
        &self.mmu
    }

    pub fn mmu_mut(&mut self) -> &mut Mmu {
        &mut self.mmu
    }

    pub fn ppu(&self) -> &Ppu {
        &self.ppu
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// Asks the dispatcher loops to stop at the next block boundary.
    pub fn stop(&mut self) {
        self.stop_requested = true;
    }

    /// Runs one block (or one idle tick while halted) plus the boundary
    /// work. Returns the cycles consumed.
    pub fn step(&mut self) -> u32 {
        let mut cycles = if self.cpu.halted || self.cpu.stopped {
            4 // idle tick; the PPU keeps scanning
        } else {
            self.dispatch()
        };

        self.stats.total_cycles += cycles as u64;
        self.cpu.cycles += cycles as u64;
        self.ppu.step(cycles, &mut self.mmu);

        // Any pending enabled interrupt wakes a halted CPU even with IME off.
        let pending = self.pending_interrupts();
        if pending != 0 {
            self.cpu.halted = false;
            self.cpu.stopped = false;
        }
        if self.cpu.ime && pending != 0 {
            let serviced = self.service_interrupt(pending);
            self.stats.total_cycles += serviced as u64;
            self.cpu.cycles += serviced as u64;
            self.ppu.step(serviced, &mut self.mmu);
            cycles += serviced;
        }

        // EI takes effect one block late.
        if self.cpu.ime_scheduled {
            self.cpu.ime = true;
            self.cpu.ime_scheduled = false;
        }

        cycles
    }

    /// Runs until one frame's worth of cycles has elapsed (or the host asked
    /// to stop).
    pub fn execute_frame(&mut self) {
        let mut elapsed = 0u32;
        while elapsed < CYCLES_PER_FRAME && !self.stop_requested {
            elapsed += self.step();
        }
        self.stop_requested = false;
    }

    /// Runs until `max_cycles` guest cycles have elapsed.
    pub fn run(&mut self, max_cycles: u64) {
        let target = self.stats.total_cycles + max_cycles;
        while self.stats.total_cycles < target && !self.stop_requested {
            self.step();
        }
        self.stop_requested = false;
    }

    // --- Dispatch ---

    fn dispatch(&mut self) -> u32 {
        let pc = self.cpu.pc;
        if !self.cache.contains_key(&pc) {
            self.stats.cache_misses += 1;
            let entry = self.compile(pc);
            self.cache.insert(pc, entry);
        } else {
            self.stats.cache_hits += 1;
        }

        match self.cache.get(&pc).cloned().unwrap() {
            CacheEntry::Jit(block) => {
                self.stats.blocks_executed += 1;
                let result = block.run(&mut self.cpu, &mut self.mmu);
                result.cycles
            }
            CacheEntry::Fallback => {
                self.stats.interpreter_steps += 1;
                let result = interpreter::step(&mut self.cpu, &mut self.mmu);
                if result.unknown {
                    self.stats.interpreter_unknown += 1;
                }
                result.cycles
            }
        }
    }

    /// Miss path: transpile ROM code, interpret everything else.
    fn compile(&mut self, pc: u16) -> CacheEntry {
        let in_rom = pc < WRITABLE_START && (pc as usize) < self.cartridge.data.len();
        if !in_rom {
            return CacheEntry::Fallback;
        }

        // On-demand discovery covers targets of indirect jumps the static
        // pass could not see; the analyses answer conservatively for them.
        if !self.db.blocks.contains_key(&pc) {
            if self.db.discover_block(&self.cartridge.data, pc).is_none() {
                return CacheEntry::Fallback;
            }
            self.stats.blocks_analyzed += 1;
        }
        let block = &self.db.blocks[&pc];

        match transpiler::transpile(block, &self.flags, &self.regs, &self.consts) {
            Ok(compiled) => {
                self.stats.blocks_compiled += 1;
                CacheEntry::Jit(Rc::new(compiled))
            }
            Err(err) => {
                log::warn!("transpile failed at {:#06X}: {}; using interpreter", pc, err);
                self.stats.compile_failures += 1;
                CacheEntry::Fallback
            }
        }
    }

    // --- Interrupts ---

    fn pending_interrupts(&self) -> u8 {
        self.mmu.read8(INTERRUPT_ENABLE_REGISTER) & self.mmu.read8(IF_ADDR) & 0x1F
    }

    /// Services the highest-priority pending interrupt: clears IME and the
    /// IF bit, pushes PC and jumps to the vector.
    fn service_interrupt(&mut self, pending: u8) -> u32 {
        for (bit, vector) in INTERRUPT_TABLE {
            if pending & (1 << bit) != 0 {
                self.cpu.ime = false;
                self.cpu.ime_scheduled = false;
                let flags = self.mmu.read8(IF_ADDR);
                self.mmu.write8(IF_ADDR, flags & !(1 << bit));
                let pc = self.cpu.pc;
                self.cpu.push_word(pc, &mut self.mmu);
                self.cpu.pc = vector;
                self.stats.interrupts_serviced += 1;
                return INTERRUPT_CYCLES;
            }
        }
        0
    }
}
