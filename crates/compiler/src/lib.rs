//! Ayu compiler front end.
//!
//! The pipeline is strictly forward:
//!
//! ```text
//! source text -> lexer -> tokens -> parser -> AST -> compiler -> function
//! ```
//!
//! Each stage reports failure as `Err(String)` with a human-readable
//! diagnostic; nothing downstream calls back into an earlier stage.

pub mod ast;
pub mod compiler;
pub mod lexer;
pub mod parser;

pub use ast::{Node, NodeKind, Param};
pub use compiler::Compiler;
pub use lexer::{Lexer, Pos, TokKind, Token};
pub use parser::Parser;

use std::path::Path;
use std::rc::Rc;

use ayu_core::Closure;

/// Compile source text into a top-level script function.
///
/// `name` labels the resulting chunk in diagnostics and disassembly.
pub fn compile_source(source: &str, name: &str) -> Result<Rc<Closure>, String> {
    let tokens = Lexer::from_source(source).lex()?;
    let ast = Parser::new(tokens).parse()?;
    Compiler::script(name).compile(&ast)
}

/// Compile an `.ayu` file into a top-level script function.
pub fn compile_file(path: &Path) -> Result<Rc<Closure>, String> {
    let tokens = Lexer::from_path(path)?.lex()?;
    let ast = Parser::new(tokens).parse()?;
    let name = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "script".to_string());
    Compiler::script(&name).compile(&ast)
}
