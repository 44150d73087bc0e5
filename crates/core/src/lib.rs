//! Ayu core: the pieces shared by the compiler and the virtual machine.
//!
//! - `intern`: process-wide string intern table; names and string literals
//!   become cheap index handles
//! - `value`: the runtime `Value` sum type, closures, and upvalue cells
//! - `chunk`: bytecode chunks (opcode stream + literal pool)
//! - `disasm`: human-readable chunk dumps for debugging
//!
//! The compiler produces `Chunk`s full of `Value` literals; the runtime
//! executes them. Neither side reaches around this crate.

pub mod chunk;
pub mod disasm;
pub mod intern;
pub mod value;

pub use chunk::{Chunk, Op};
pub use disasm::disassemble;
pub use intern::Istr;
pub use value::{Array, Closure, FnDesc, NativeFn, NativeHandler, Object, Upvalue, Value};
