//! Per-instruction fallback executor.
//!
//! Installed for code in writable memory and for any block the transpiler
//! gives up on. Each invocation fetches and decodes exactly one instruction
//! at the current PC through the MMU, so self-modifying RAM code always sees
//! its freshest bytes.

use crate::cpu_state::CpuState;
use crate::decoder;
use crate::exec::{self, ExecResult};
use crate::mmu::Mmu;

/// Executes the single instruction at `cpu.pc`.
pub fn step(cpu: &mut CpuState, mmu: &mut Mmu) -> ExecResult {
    let instr = decoder::decode(|addr| mmu.read8(addr), cpu.pc);
    exec::execute(cpu, mmu, &instr)
}
