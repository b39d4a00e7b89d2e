//! Tmbdl bytecode pipeline: code generator, stack VM, and the `.tmbdlc`
//! binary container.

pub mod bytecode;
pub mod lang;
pub mod runtime;

pub use bytecode::compile::compile;
pub use bytecode::compile_error::CompileError;
pub use bytecode::serialize::{deserialize, serialize, FormatError};
pub use bytecode::{Chunk, Op};
pub use lang::value::Value;
pub use runtime::natives::register_native;
pub use runtime::runtime_error::{ErrorKind, RuntimeError};
pub use runtime::vm::{Vm, VmOptions};
