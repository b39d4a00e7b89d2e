pub mod chunk;
pub mod compile;
pub mod compile_error;
pub mod disasm;
pub mod op;
pub mod serialize;

pub use chunk::{BytecodeFunction, Chunk};
pub use compile::compile;
pub use op::Op;
