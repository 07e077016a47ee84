//! Block discovery, CFG and dataflow properties over assembled ROMs.

use dmgjit::analysis::blocks::{CodeDatabase, ExitKind};
use dmgjit::analysis::constants::{ConstVal, ConstantAnalysis};
use dmgjit::analysis::flags::FlagLiveness;
use dmgjit::cpu_state::FlagSet;
use dmgjit::decoder::Reg8;

mod common;
use common::analyze;

/// A small program exercising branches, a call/ret pair, a loop and an
/// indirect jump.
fn sample_program() -> common::Analyzed {
    analyze(&[
        // 0x0100: entry. Count down, call a leaf, jump through HL.
        (0x0100, &[0x06, 0x03]),             // LD B, 3
        (0x0102, &[0x05]),                   // DEC B
        (0x0103, &[0x20, 0xFD]),             // JR NZ, -3 (loop to 0x0102)
        (0x0105, &[0xCD, 0x00, 0x02]),       // CALL 0x0200
        (0x0108, &[0x21, 0x00, 0x03]),       // LD HL, 0x0300
        (0x010B, &[0xE9]),                   // JP (HL)
        // 0x0200: leaf with a conditional return.
        (0x0200, &[0xFE, 0xFF]),             // CP 0xFF
        (0x0202, &[0xC8]),                   // RET Z
        (0x0203, &[0xC9]),                   // RET
        // 0x0300: indirect target (invisible to the static pass).
        (0x0300, &[0x76]),                   // HALT
    ])
}

#[test]
fn blocks_tile_their_ranges_and_terminate_once() {
    let a = sample_program();
    for block in a.db.blocks.values() {
        assert!(block.end >= block.start);
        let total: u32 = block.instructions.iter().map(|i| i.length as u32).sum();
        assert_eq!(total, (block.end - block.start + 1) as u32, "{:#06X}", block.start);
        let last = block.instructions.len() - 1;
        for (idx, instr) in block.instructions.iter().enumerate() {
            if idx < last {
                assert!(!instr.op.is_terminator(), "{:#06X}[{}]", block.start, idx);
            }
        }
    }
}

#[test]
fn analyzed_targets_start_blocks() {
    let a = sample_program();
    for &target in a.db.jump_targets.iter().chain(a.db.call_targets.iter()) {
        if (target as usize) < a.rom.len() && target < 0x8000 {
            assert_eq!(a.db.blocks[&target].start, target);
        }
    }
}

#[test]
fn cfg_edges_are_symmetric_everywhere() {
    let a = sample_program();
    for (&addr, node) in &a.cfg.nodes {
        for &succ in &node.successors {
            assert!(a.cfg.nodes[&succ].predecessors.contains(&addr));
        }
        for &pred in &node.predecessors {
            assert!(a.cfg.nodes[&pred].successors.contains(&addr));
        }
    }
}

#[test]
fn dominator_basics_hold() {
    let a = sample_program();
    for addr in a.cfg.reachable() {
        let doms = &a.cfg.dominators[&addr];
        assert!(doms.contains(&a.cfg.entry));
        assert!(doms.contains(&addr));
    }
}

#[test]
fn loop_detection_finds_the_countdown() {
    let a = sample_program();
    let lp = a
        .cfg
        .loops
        .iter()
        .find(|l| l.header == 0x0102)
        .expect("countdown loop");
    assert!(lp.back_edges.contains(&(0x0102, 0x0102)));
}

#[test]
fn indirect_blocks_have_no_static_successors() {
    let a = sample_program();
    let jp_hl_block = a
        .db
        .blocks
        .values()
        .find(|b| b.exit == ExitKind::Indirect)
        .expect("JP (HL) block");
    assert!(a.cfg.successors(jp_hl_block.start).next().is_none());
    // The indirect target stays invisible until runtime discovery.
    assert!(!a.db.blocks.contains_key(&0x0300));
}

#[test]
fn block_split_scenario_from_branch() {
    // JR NZ, +2 followed by NOPs.
    let a = analyze(&[(0x0100, &[0x20, 0x02])]);
    let b1 = &a.db.blocks[&0x0100];
    assert_eq!((b1.start, b1.end), (0x0100, 0x0101));
    assert_eq!(b1.exit, ExitKind::Branch);
    assert_eq!(b1.targets, vec![0x0104]);
    assert_eq!(a.db.blocks[&0x0102].exit, ExitKind::Fallthrough);
    assert_eq!(a.db.blocks[&0x0102].targets, vec![0x0104]);
    assert!(a.db.blocks.contains_key(&0x0104));
}

#[test]
fn liveness_reruns_identically() {
    let a = sample_program();
    let again = FlagLiveness::analyze(&a.db, &a.cfg);
    for (&addr, block) in &a.db.blocks {
        for idx in 0..block.instructions.len() {
            assert_eq!(
                a.flags.live_after(addr, idx),
                again.live_after(addr, idx),
                "{:#06X}[{}]",
                addr,
                idx
            );
        }
    }
    let consts_again = ConstantAnalysis::analyze(&a.db, &a.cfg);
    for (&addr, block) in &a.db.blocks {
        for idx in 0..block.instructions.len() {
            for reg in [Reg8::A, Reg8::B, Reg8::H, Reg8::L] {
                assert_eq!(
                    a.consts.constant_at(addr, idx, reg),
                    consts_again.constant_at(addr, idx, reg)
                );
            }
        }
    }
}

#[test]
fn flag_elimination_scenario() {
    // INC A ; DEC A ; JP self: no reader, so INC's flags are dead...
    let a = analyze(&[(0x0100, &[0x3C, 0x3D, 0xC3, 0x00, 0x01])]);
    let after_inc = a.flags.live_after(0x0100, 0);
    assert_eq!(after_inc & (FlagSet::Z | FlagSet::N | FlagSet::H), FlagSet::NONE);

    // ...but a following JR Z keeps Z alive.
    let b = analyze(&[(0x0100, &[0x3C, 0x28, 0xFB, 0x76])]); // INC A ; JR Z back
    let after_inc = b.flags.live_after(0x0100, 0);
    assert!(after_inc.contains(FlagSet::Z));
}

#[test]
fn constant_propagation_through_copies() {
    // XOR A ; LD B, A: classic zeroing idiom.
    let a = analyze(&[(0x0100, &[0xAF, 0x47, 0xC3, 0x00, 0x01])]);
    assert_eq!(a.consts.constant_at(0x0100, 1, Reg8::A), ConstVal::Const(0));
    assert_eq!(a.consts.constant_at(0x0100, 2, Reg8::B), ConstVal::Const(0));
}

#[test]
fn constant_propagation_is_sound_under_execution() {
    // Every Const the analyzer reports must match the value the interpreter
    // actually computes along the straight-line path.
    let code: &[(usize, &[u8])] = &[(
        0x0100,
        // XOR A; LD B,A; LD C,0x10; INC C; LD HL,0x1234; ADD HL,HL; SCF; ADC A,1; HALT
        &[0xAF, 0x47, 0x0E, 0x10, 0x0C, 0x21, 0x34, 0x12, 0x29, 0x37, 0xCE, 0x01, 0x76],
    )];
    let a = analyze(code);
    let (mut cpu, mut mmu) = common::cpu_and_mmu(a.rom.clone());
    cpu.pc = 0x0100;

    let block = &a.db.blocks[&0x0100];
    for (idx, _) in block.instructions.iter().enumerate() {
        for reg in [Reg8::A, Reg8::B, Reg8::C, Reg8::D, Reg8::E, Reg8::H, Reg8::L] {
            if let ConstVal::Const(v) = a.consts.constant_at(0x0100, idx, reg) {
                let actual = match reg {
                    Reg8::A => cpu.a,
                    Reg8::B => cpu.b,
                    Reg8::C => cpu.c,
                    Reg8::D => cpu.d,
                    Reg8::E => cpu.e,
                    Reg8::H => cpu.h,
                    Reg8::L => cpu.l,
                };
                assert_eq!(actual, v, "reg {:?} before instruction {}", reg, idx);
            }
        }
        dmgjit::interpreter::step(&mut cpu, &mut mmu);
    }
}

#[test]
fn on_demand_discovery_matches_static_formation() {
    // The same bytes analyzed statically and on demand produce one block
    // shape.
    let rom = common::build_rom(&[(0x0100, &[0x3E, 0x05, 0xC3, 0x00, 0x01])]);
    let static_db = CodeDatabase::analyze(&rom);
    let mut dynamic_db = CodeDatabase::default();
    let block = dynamic_db.discover_block(&rom, 0x0100).unwrap();
    let reference = &static_db.blocks[&0x0100];
    assert_eq!(block.end, reference.end);
    assert_eq!(block.exit, reference.exit);
    assert_eq!(block.targets, reference.targets);
}
