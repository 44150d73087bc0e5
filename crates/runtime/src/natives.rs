//! Default native functions.
//!
//! Hosts can register anything via [`Vm::def_native`]; these are the two
//! every embedding wants. Handlers receive the `run` output stream plus
//! exactly `arity` argument values.

use std::io::Write;

use ayu_core::intern::Istr;
use ayu_core::value::Value;

use crate::vm::Vm;

/// Register the default natives (`log`, `to_str`) on a VM.
pub fn install_defaults(vm: &mut Vm) {
    vm.def_native("log", 1, log);
    vm.def_native("to_str", 1, to_str);
}

/// Print a value and a newline to the run output stream.
fn log(out: &mut dyn Write, args: &[Value]) -> Result<Value, String> {
    writeln!(out, "{}", args[0]).map_err(|e| format!("log: {e}"))?;
    Ok(Value::Nil)
}

/// Render a value as a string.
fn to_str(_out: &mut dyn Write, args: &[Value]) -> Result<Value, String> {
    Ok(Value::Str(Istr::new(&args[0].to_string())))
}
