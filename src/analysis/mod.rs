//! Static analysis over ROM code: block discovery, control flow and the
//! three dataflow passes the transpiler consumes.

pub mod blocks;
pub mod cfg;
pub mod constants;
pub mod flags;
pub mod registers;

/// Dataflow iteration cap. Realistic ROMs converge in a handful of passes;
/// hitting the cap means a bug, and the analyses log and proceed with their
/// last (conservative) state.
pub const MAX_DATAFLOW_ITERATIONS: usize = 1000;
