pub mod natives;
pub mod runtime_error;
pub mod vm;

pub use natives::register_native;
pub use runtime_error::{ErrorKind, RuntimeError};
pub use vm::{Vm, VmOptions};
