//! Engine behavior: dispatch, caching, interrupts, frames and the RAM
//! fallback path.

use dmgjit::engine::{CYCLES_PER_FRAME, Engine};
use dmgjit::memory_map::{IF_ADDR, INTERRUPT_ENABLE_REGISTER};

mod common;
use common::{build_rom, engine};

#[test]
fn jp_threading_executes_compiled_blocks() {
    // 0x0100: LD A,0x11 ; JP 0x0200. 0x0200: LD B,0x22 ; JP 0x0100.
    let mut eng = engine(&[
        (0x0100, &[0x3E, 0x11, 0xC3, 0x00, 0x02]),
        (0x0200, &[0x06, 0x22, 0xC3, 0x00, 0x01]),
    ]);
    eng.step();
    assert_eq!(eng.state().a, 0x11);
    assert_eq!(eng.state().pc, 0x0200);
    eng.step();
    assert_eq!(eng.state().b, 0x22);
    assert_eq!(eng.state().pc, 0x0100);
    assert_eq!(eng.stats().blocks_executed, 2);
    assert_eq!(eng.stats().cache_misses, 2);

    // The loop comes back around through the cache.
    eng.step();
    assert_eq!(eng.stats().cache_hits, 1);
    assert_eq!(eng.stats().blocks_compiled, 2);
}

#[test]
fn call_and_return_round_trip() {
    // 0x0100: CALL 0x0200 ; HALT. 0x0200: LD A,0x77 ; RET.
    let mut eng = engine(&[
        (0x0100, &[0xCD, 0x00, 0x02, 0x76]),
        (0x0200, &[0x3E, 0x77, 0xC9]),
    ]);
    eng.step(); // CALL block
    assert_eq!(eng.state().pc, 0x0200);
    eng.step(); // leaf body + RET
    assert_eq!(eng.state().a, 0x77);
    assert_eq!(eng.state().pc, 0x0103);
    eng.step(); // HALT block
    assert!(eng.state().halted);
}

#[test]
fn vblank_interrupt_is_serviced_next_boundary() {
    // NOP-loop at the entry; vector 0x0040 counts into B and returns.
    let mut eng = engine(&[
        (0x0100, &[0xC3, 0x00, 0x01]),
        (0x0040, &[0x04, 0xD9]), // INC B ; RETI
    ]);
    eng.mmu_mut().write8(INTERRUPT_ENABLE_REGISTER, 0x01);
    eng.state_mut().ime = true;
    eng.mmu_mut().write8(IF_ADDR, 0x01);

    let before_sp = eng.state().sp;
    let cycles = eng.step();
    // Block cycles plus the 20-cycle interrupt entry.
    assert_eq!(cycles, 16 + 20);
    assert_eq!(eng.state().pc, 0x0040);
    assert!(!eng.state().ime);
    assert_eq!(eng.mmu().read8(IF_ADDR) & 0x01, 0);
    assert_eq!(eng.state().sp, before_sp - 2);
    // The pushed return address is the interrupted PC.
    assert_eq!(eng.mmu().read16(eng.state().sp), 0x0100);

    // RETI restores IME and pops back into the loop.
    eng.step();
    assert_eq!(eng.state().b, 1);
    assert!(eng.state().ime);
    assert_eq!(eng.state().pc, 0x0100);
}

#[test]
fn frame_execution_reaches_vblank_and_wakes_halted_guest() {
    // EI ; enable V-Blank ; HALT ; loop. Vector increments B.
    let mut eng = engine(&[
        // LD A,0x01 ; LDH (0xFF),A (IE=1) ; EI ; HALT ; JR -2 (back to HALT)
        (0x0100, &[0x3E, 0x01, 0xE0, 0xFF, 0xFB, 0x76, 0x18, 0xFD]),
        (0x0040, &[0x04, 0xD9]), // INC B ; RETI
    ]);
    eng.execute_frame();
    assert!(eng.stats().total_cycles >= CYCLES_PER_FRAME as u64);
    assert!(eng.state().b >= 1, "V-Blank handler never ran");
    assert!(eng.stats().interrupts_serviced >= 1);
    assert_eq!(eng.ppu().frames_completed(), 1);
}

#[test]
fn ei_enable_is_delayed_one_boundary() {
    let mut eng = engine(&[(0x0100, &[0xFB, 0xC3, 0x00, 0x01])]); // EI ; JP self
    eng.mmu_mut().write8(INTERRUPT_ENABLE_REGISTER, 0x01);
    eng.mmu_mut().write8(IF_ADDR, 0x01);

    // First boundary: IME was still off when service ran; EI promotes after.
    eng.step();
    assert!(eng.state().ime);
    assert_eq!(eng.state().pc, 0x0100);
    // Second boundary services.
    eng.step();
    assert_eq!(eng.state().pc, 0x0040);
}

#[test]
fn ram_code_runs_through_the_interpreter_fallback() {
    let mut eng = engine(&[(0x0100, &[0x76])]);
    // Hand-place a routine in WRAM: LD A,0x10 ; INC A ; JP 0xC000.
    for (i, byte) in [0x3E, 0x10, 0x3C, 0xC3, 0x00, 0xC0].iter().enumerate() {
        eng.mmu_mut().write8(0xC000 + i as u16, *byte);
    }
    eng.state_mut().pc = 0xC000;

    eng.step(); // LD A,0x10: exactly one instruction
    assert_eq!(eng.state().a, 0x10);
    assert_eq!(eng.state().pc, 0xC002);
    assert_eq!(eng.stats().interpreter_steps, 1);
    assert_eq!(eng.stats().blocks_executed, 0);

    // The guest may rewrite the very next instruction; the fallback decodes
    // fresh bytes every time.
    eng.mmu_mut().write8(0xC002, 0x3D); // DEC A
    eng.step();
    assert_eq!(eng.state().a, 0x0F);
    assert_eq!(eng.stats().interpreter_steps, 2);
}

#[test]
fn indirect_jump_discovers_rom_blocks_on_demand() {
    // LD HL,0x0400 ; JP (HL). 0x0400 is statically invisible.
    let mut eng = engine(&[
        (0x0100, &[0x21, 0x00, 0x04, 0xE9]),
        (0x0400, &[0x3E, 0x99, 0x76]),
    ]);
    let analyzed_before = eng.stats().blocks_analyzed;
    eng.step(); // JP (HL)
    assert_eq!(eng.state().pc, 0x0400);
    eng.step(); // discovered, transpiled, executed
    assert_eq!(eng.state().a, 0x99);
    assert!(eng.state().halted);
    assert_eq!(eng.stats().blocks_analyzed, analyzed_before + 1);
    assert_eq!(eng.stats().compile_failures, 0);
}

#[test]
fn block_entry_sequence_is_deterministic() {
    let code: &[(usize, &[u8])] = &[
        (0x0100, &[0x06, 0x03]),       // LD B,3
        (0x0102, &[0x05, 0x20, 0xFD]), // DEC B ; JR NZ,-3
        (0x0105, &[0xCD, 0x00, 0x02]), // CALL 0x0200
        (0x0108, &[0x76]),             // HALT
        (0x0200, &[0xC9]),             // RET
    ];
    let trace = |rom: Vec<u8>| -> Vec<u16> {
        let mut eng = Engine::new(rom).unwrap();
        let mut pcs = Vec::new();
        for _ in 0..32 {
            if eng.state().halted {
                break;
            }
            pcs.push(eng.state().pc);
            eng.step();
        }
        pcs
    };
    let first = trace(build_rom(code));
    let second = trace(build_rom(code));
    assert_eq!(first, second);
}

#[test]
fn halted_guest_still_burns_the_frame_budget() {
    let mut eng = engine(&[(0x0100, &[0x76])]); // HALT with no interrupts
    eng.execute_frame();
    assert!(eng.state().halted);
    assert!(eng.stats().total_cycles >= CYCLES_PER_FRAME as u64);
}

#[test]
fn reset_preserves_the_code_cache() {
    let mut eng = engine(&[(0x0100, &[0x3E, 0x07, 0xC3, 0x00, 0x01])]);
    eng.step();
    let compiled = eng.stats().blocks_compiled;
    assert_eq!(eng.state().a, 0x07);
    eng.reset();
    assert_eq!(eng.state().pc, 0x0100);
    assert_eq!(eng.state().a, 0x01); // post-boot A
    eng.step();
    assert_eq!(eng.state().a, 0x07);
    // No recompilation was needed after reset.
    assert_eq!(eng.stats().blocks_compiled, compiled);
}

#[test]
fn stop_halts_the_frame_loop_between_blocks() {
    let mut eng = engine(&[(0x0100, &[0xC3, 0x00, 0x01])]);
    eng.stop();
    eng.execute_frame();
    // One stop consumes at most a handful of boundary turns, not a frame.
    assert!(eng.stats().total_cycles < CYCLES_PER_FRAME as u64);
}

#[test]
fn interrupt_priority_prefers_vblank() {
    let mut eng = engine(&[
        (0x0100, &[0x00, 0xC3, 0x00, 0x01]),
        (0x0040, &[0xD9]),
        (0x0048, &[0xD9]),
    ]);
    eng.mmu_mut().write8(INTERRUPT_ENABLE_REGISTER, 0x03);
    eng.mmu_mut().write8(IF_ADDR, 0x03); // V-Blank and STAT both pending
    eng.state_mut().ime = true;
    eng.step();
    assert_eq!(eng.state().pc, 0x0040);
    // STAT stays pending for the next turn.
    assert_ne!(eng.mmu().read8(IF_ADDR) & 0x02, 0);
}
