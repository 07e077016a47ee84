//! Two-pass basic-block discovery.
//!
//! Pass 1 walks the ROM from every entry point collecting branch and call
//! targets. Pass 2 walks again and partitions reachable bytes into blocks,
//! splitting wherever the next address is a known target so that every
//! target in the database starts a block.

use crate::decoder::{self, ExitClass, Instruction};
use crate::memory_map::WRITABLE_START;
use std::collections::{BTreeMap, BTreeSet, VecDeque};

/// How a block hands control back to the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    /// Runs into the next block (split on an incoming target, or the end of
    /// ROM).
    Fallthrough,
    Jump,
    Branch,
    Call,
    Return,
    Halt,
    Indirect,
}

impl ExitKind {
    fn from_class(class: ExitClass) -> ExitKind {
        match class {
            ExitClass::None => ExitKind::Fallthrough,
            ExitClass::Jump => ExitKind::Jump,
            ExitClass::Branch => ExitKind::Branch,
            ExitClass::Call => ExitKind::Call,
            ExitClass::Return => ExitKind::Return,
            ExitClass::Halt => ExitKind::Halt,
            ExitClass::Indirect => ExitKind::Indirect,
        }
    }
}

/// A maximal straight-line run of instructions. The identity of a block is
/// its start address.
#[derive(Debug, Clone)]
pub struct BasicBlock {
    pub start: u16,
    /// Address of the last byte of the last instruction.
    pub end: u16,
    pub instructions: Vec<Instruction>,
    pub exit: ExitKind,
    /// Statically-known control targets (jump/branch/call destinations, or
    /// the single split-fallthrough successor).
    pub targets: Vec<u16>,
}

impl BasicBlock {
    /// First address after the block.
    #[inline]
    pub fn next_addr(&self) -> u16 {
        self.end.wrapping_add(1)
    }

    pub fn terminator(&self) -> Option<&Instruction> {
        self.instructions.last().filter(|i| i.op.is_terminator())
    }
}

/// Everything pass 1 and pass 2 learned about a ROM.
#[derive(Debug, Clone, Default)]
pub struct CodeDatabase {
    pub blocks: BTreeMap<u16, BasicBlock>,
    pub jump_targets: BTreeSet<u16>,
    pub call_targets: BTreeSet<u16>,
    pub entry_points: BTreeSet<u16>,
}

/// The RST vectors plus the five interrupt vectors plus the cartridge entry
/// point, filtered to ROM bounds.
pub fn entry_points(rom_len: usize) -> BTreeSet<u16> {
    let mut points = BTreeSet::new();
    for vector in (0x0000..=0x0038).step_by(8) {
        points.insert(vector);
    }
    for vector in [0x0040, 0x0048, 0x0050, 0x0058, 0x0060, 0x0100] {
        points.insert(vector);
    }
    points.retain(|&p| (p as usize) < rom_len);
    points
}

impl CodeDatabase {
    /// Runs both passes over a ROM image.
    pub fn analyze(rom: &[u8]) -> CodeDatabase {
        let mut db = CodeDatabase {
            entry_points: entry_points(rom.len()),
            ..CodeDatabase::default()
        };
        db.discover_targets(rom);
        db.form_blocks(rom);
        db
    }

    fn in_code(&self, rom: &[u8], addr: u16) -> bool {
        addr < WRITABLE_START && (addr as usize) < rom.len()
    }

    /// Pass 1: breadth-first target discovery from the entry points.
    fn discover_targets(&mut self, rom: &[u8]) {
        let mut queue: VecDeque<u16> = self.entry_points.iter().copied().collect();
        let mut scanned: BTreeSet<u16> = BTreeSet::new();

        while let Some(start) = queue.pop_front() {
            if !self.in_code(rom, start) || !scanned.insert(start) {
                continue;
            }
            let mut addr = start;
            loop {
                if !self.in_code(rom, addr) {
                    break;
                }
                let instr = decoder::decode_at(rom, addr);
                let next = instr.next_addr();
                match instr.op.exit_class() {
                    ExitClass::Jump => {
                        for target in instr.op.static_targets() {
                            self.jump_targets.insert(target);
                            queue.push_back(target);
                        }
                        break;
                    }
                    ExitClass::Branch => {
                        for target in instr.op.static_targets() {
                            self.jump_targets.insert(target);
                            queue.push_back(target);
                        }
                        queue.push_back(next);
                        break;
                    }
                    ExitClass::Call => {
                        for target in instr.op.static_targets() {
                            self.call_targets.insert(target);
                            queue.push_back(target);
                        }
                        queue.push_back(next);
                        break;
                    }
                    ExitClass::Return | ExitClass::Halt | ExitClass::Indirect => break,
                    ExitClass::None => {
                        if scanned.contains(&next) {
                            break;
                        }
                        addr = next;
                    }
                }
                // Re-mark straight-line progress so convergent scans stop early.
                scanned.insert(addr);
            }
        }
    }

    /// True when `addr` is a known control target or entry point, i.e. must
    /// start its own block.
    pub fn is_target(&self, addr: u16) -> bool {
        self.jump_targets.contains(&addr)
            || self.call_targets.contains(&addr)
            || self.entry_points.contains(&addr)
    }

    /// Pass 2: breadth-first block formation from the entry points.
    fn form_blocks(&mut self, rom: &[u8]) {
        let mut queue: VecDeque<u16> = self.entry_points.iter().copied().collect();
        while let Some(start) = queue.pop_front() {
            if self.blocks.contains_key(&start) || !self.in_code(rom, start) {
                continue;
            }
            let block = self.scan_block(rom, start);

            // Queue everything this block can statically reach.
            for &target in &block.targets {
                queue.push_back(target);
            }
            match block.exit {
                ExitKind::Branch | ExitKind::Call => queue.push_back(block.next_addr()),
                _ => {}
            }

            self.blocks.insert(start, block);
        }
    }

    /// Decodes one block starting at `start` against the known target sets.
    fn scan_block(&self, rom: &[u8], start: u16) -> BasicBlock {
        let mut instructions = Vec::new();
        let mut addr = start;
        loop {
            let instr = decoder::decode_at(rom, addr);
            let next = instr.next_addr();
            let class = instr.op.exit_class();
            let targets = instr.op.static_targets();
            let end = next.wrapping_sub(1);
            instructions.push(instr);

            if class != ExitClass::None {
                return BasicBlock {
                    start,
                    end,
                    instructions,
                    exit: ExitKind::from_class(class),
                    targets,
                };
            }
            // Split so the upcoming target owns its own block.
            if self.is_target(next) {
                return BasicBlock {
                    start,
                    end,
                    instructions,
                    exit: ExitKind::Fallthrough,
                    targets: vec![next],
                };
            }
            // Ran off the end of ROM.
            if !self.in_code(rom, next) {
                return BasicBlock {
                    start,
                    end,
                    instructions,
                    exit: ExitKind::Fallthrough,
                    targets: Vec::new(),
                };
            }
            addr = next;
        }
    }

    /// On-demand discovery for the dispatcher: forms and installs the block
    /// at `addr` (and records its targets) if it lies in ROM. Returns the
    /// block on success.
    pub fn discover_block(&mut self, rom: &[u8], addr: u16) -> Option<&BasicBlock> {
        if !self.in_code(rom, addr) {
            return None;
        }
        if !self.blocks.contains_key(&addr) {
            let block = self.scan_block(rom, addr);
            match block.exit {
                ExitKind::Jump | ExitKind::Branch => {
                    self.jump_targets.extend(block.targets.iter().copied());
                }
                ExitKind::Call => {
                    self.call_targets.extend(block.targets.iter().copied());
                }
                _ => {}
            }
            self.blocks.insert(addr, block);
        }
        self.blocks.get(&addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rom_with(code: &[(usize, &[u8])]) -> Vec<u8> {
        let mut rom = vec![0u8; 0x8000];
        for (addr, bytes) in code {
            rom[*addr..*addr + bytes.len()].copy_from_slice(bytes);
        }
        rom
    }

    #[test]
    fn splits_on_incoming_branch_target() {
        // 0x0100: JR NZ, +2 ; then five NOPs.
        let rom = rom_with(&[(0x0100, &[0x20, 0x02])]);
        let db = CodeDatabase::analyze(&rom);

        let b1 = &db.blocks[&0x0100];
        assert_eq!(b1.end, 0x0101);
        assert_eq!(b1.exit, ExitKind::Branch);
        assert_eq!(b1.targets, vec![0x0104]);

        let b2 = &db.blocks[&0x0102];
        assert_eq!(b2.exit, ExitKind::Fallthrough);
        assert_eq!(b2.targets, vec![0x0104]);

        assert!(db.blocks.contains_key(&0x0104));
    }

    #[test]
    fn every_rom_target_starts_a_block() {
        let rom = rom_with(&[
            (0x0100, &[0xC3, 0x00, 0x02]),       // JP 0x0200
            (0x0200, &[0xCD, 0x00, 0x03]),       // CALL 0x0300
            (0x0203, &[0x18, 0xFE]),             // JR self
            (0x0300, &[0xC9]),                   // RET
        ]);
        let db = CodeDatabase::analyze(&rom);
        for target in db.jump_targets.iter().chain(db.call_targets.iter()) {
            assert_eq!(db.blocks[target].start, *target);
        }
        assert!(db.jump_targets.contains(&0x0200));
        assert!(db.call_targets.contains(&0x0300));
        // Jump and call target sets are populated disjointly.
        assert!(db.jump_targets.is_disjoint(&db.call_targets));
    }

    #[test]
    fn block_lengths_tile_their_address_range() {
        let rom = rom_with(&[
            (0x0100, &[0x3E, 0x10, 0x06, 0x20, 0xC3, 0x00, 0x02]), // LD A; LD B; JP
            (0x0200, &[0x76]),                                     // HALT
        ]);
        let db = CodeDatabase::analyze(&rom);
        for block in db.blocks.values() {
            assert!(block.end >= block.start);
            let total: u32 = block.instructions.iter().map(|i| i.length as u32).sum();
            assert_eq!(total, (block.end - block.start + 1) as u32);
            // Only the final instruction may terminate.
            for instr in &block.instructions[..block.instructions.len() - 1] {
                assert!(!instr.op.is_terminator());
            }
        }
        assert_eq!(db.blocks[&0x0200].exit, ExitKind::Halt);
    }

    #[test]
    fn invalid_opcodes_do_not_end_a_block() {
        // LD A, d8; unused slot 0xD3; JP 0x0100.
        let rom = rom_with(&[(0x0100, &[0x3E, 0x01, 0xD3, 0xC3, 0x00, 0x01])]);
        let db = CodeDatabase::analyze(&rom);
        let block = &db.blocks[&0x0100];
        assert_eq!(block.instructions.len(), 3);
        assert_eq!(block.exit, ExitKind::Jump);
    }

    #[test]
    fn halt_ends_scanning_in_both_passes() {
        let rom = rom_with(&[(0x0100, &[0x00, 0x76, 0xC3, 0x00, 0x01])]);
        let db = CodeDatabase::analyze(&rom);
        let block = &db.blocks[&0x0100];
        assert_eq!(block.exit, ExitKind::Halt);
        // The jump after HALT is dynamically unreachable and stays invisible.
        assert!(!db.blocks.contains_key(&0x0102));
    }

    #[test]
    fn on_demand_discovery_appends_to_the_database() {
        let rom = rom_with(&[
            (0x0100, &[0x76]),             // reachable part
            (0x0400, &[0xC3, 0x00, 0x05]), // only reachable via JP (HL)
        ]);
        let mut db = CodeDatabase::analyze(&rom);
        assert!(!db.blocks.contains_key(&0x0400));
        let block = db.discover_block(&rom, 0x0400).unwrap();
        assert_eq!(block.exit, ExitKind::Jump);
        assert!(db.jump_targets.contains(&0x0500));
        assert!(db.discover_block(&rom, 0xC000).is_none());
    }

    #[test]
    fn entry_points_include_vectors_within_bounds() {
        let points = entry_points(0x8000);
        assert_eq!(points.len(), 14); // 8 RST + 5 interrupt vectors + 0x0100
        assert!(points.contains(&0x0100));
        assert!(points.contains(&0x0040));
        let tiny = entry_points(0x0050);
        assert!(!tiny.contains(&0x0100));
    }
}
