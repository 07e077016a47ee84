//! Dynamic recompiler for Game Boy (Sharp SM83) machine code.
//!
//! ROM bytes are decoded into a typed instruction representation, partitioned
//! into basic blocks, analyzed (control flow, flag/register liveness, constant
//! propagation) and transpiled into step programs the engine executes at block
//! granularity. Code discovered in writable memory falls back to a
//! one-instruction-at-a-time interpreter.

pub mod alu;
pub mod analysis;
pub mod cartridge;
pub mod cpu_state;
pub mod decoder;
pub mod engine;
pub mod exec;
pub mod interpreter;
pub mod memory_map;
pub mod mmu;
pub mod ppu;
pub mod transpiler;

use std::fmt;

/// Errors the core can surface to a host. Everything that happens after a
/// successful `Engine::new` is recovered internally and at most logged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    Rom(String),
    Analysis(String),
    Transpile(String),
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoreError::Rom(msg) => write!(f, "ROM error: {}", msg),
            CoreError::Analysis(msg) => write!(f, "analysis error: {}", msg),
            CoreError::Transpile(msg) => write!(f, "transpile error: {}", msg),
        }
    }
}

impl std::error::Error for CoreError {}

pub type CoreResult<T> = Result<T, CoreError>;
