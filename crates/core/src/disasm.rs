//! Chunk disassembly.
//!
//! One instruction per line: a zero-padded offset, the mnemonic, then the
//! decoded operands (literal-pool values for literal operands, absolute
//! `(src -> dst)` targets for jumps). Function-valued literals are dumped
//! after the owning chunk, recursively, with dotted labels.

use std::io::{self, Write};

use crate::chunk::{Chunk, Op};
use crate::value::Value;

/// Dump `chunk` and every function literal reachable from it.
pub fn disassemble<W: Write>(chunk: &Chunk, out: &mut W) -> io::Result<()> {
    writeln!(out, "{}:", chunk.name)?;
    body(chunk, out)
}

fn body<W: Write>(chunk: &Chunk, out: &mut W) -> io::Result<()> {
    let mut offset = 0;
    while offset < chunk.len() {
        offset = instruction(chunk, offset, out)?;
    }
    writeln!(out)?;

    for lit in &chunk.literals {
        if let Value::Function(closure) = lit {
            let inner = &closure.desc.chunk;
            writeln!(out, "{}.{}:", chunk.name, inner.name)?;
            body(inner, out)?;
        }
    }
    Ok(())
}

/// Print the instruction at `offset`, returning the offset just past it.
pub fn instruction<W: Write>(chunk: &Chunk, offset: usize, out: &mut W) -> io::Result<usize> {
    write!(out, "{offset:04} ")?;

    let op = match chunk.read_op(offset) {
        Ok(op) => op,
        Err(_) => {
            writeln!(out, "bad op {:#04x}", chunk.read_u8(offset))?;
            return Ok(offset + 1);
        }
    };
    let m = op.mnemonic();

    match op {
        Op::Lit8 => {
            let idx = chunk.read_u8(offset + 1);
            writeln!(out, "{m:<9}{}", chunk.literals[usize::from(idx)])?;
            Ok(offset + 2)
        }
        Op::Lit16 => {
            let idx = chunk.read_u16(offset + 1);
            writeln!(out, "{m:<9}{}", chunk.literals[usize::from(idx)])?;
            Ok(offset + 3)
        }
        Op::GlobDef
        | Op::GlobGet
        | Op::GlobSet
        | Op::PropDef
        | Op::PropGet
        | Op::PropSet => {
            let idx = chunk.read_u16(offset + 1);
            writeln!(out, "{m:<9}{}", chunk.literals[usize::from(idx)])?;
            Ok(offset + 3)
        }
        Op::LocGet | Op::LocSet | Op::UpvalGet | Op::UpvalSet | Op::Array => {
            writeln!(out, "{m:<9}{}", chunk.read_u16(offset + 1))?;
            Ok(offset + 3)
        }
        Op::Jmp | Op::JmpFalse | Op::JmpFalsePop => {
            let off = chunk.read_u16(offset + 1);
            let dst = offset + 3 + usize::from(off);
            writeln!(out, "{m:<9}{off:<10}({offset} -> {dst})")?;
            Ok(offset + 3)
        }
        Op::JmpBackPop => {
            let off = chunk.read_u16(offset + 1);
            let dst = offset + 3 - usize::from(off);
            writeln!(out, "{m:<9}{off:<10}({offset} -> {dst})")?;
            Ok(offset + 3)
        }
        Op::Call => {
            writeln!(out, "{m:<9}{}", chunk.read_u8(offset + 1))?;
            Ok(offset + 2)
        }
        Op::Closure => {
            let idx = chunk.read_u16(offset + 1);
            writeln!(out, "{m:<9}{}", chunk.literals[usize::from(idx)])?;
            let count = chunk.read_u16(offset + 3);
            let mut at = offset + 5;
            for _ in 0..count {
                let is_local = chunk.read_u8(at) != 0;
                let index = chunk.read_u16(at + 1);
                let kind = if is_local { "local" } else { "upvalue" };
                writeln!(out, "     | {kind} {index}")?;
                at += 3;
            }
            Ok(at)
        }
        _ => {
            writeln!(out, "{m}")?;
            Ok(offset + 1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intern::Istr;

    fn dump(chunk: &Chunk) -> String {
        let mut buf = Vec::new();
        disassemble(chunk, &mut buf).unwrap();
        String::from_utf8(buf).unwrap()
    }

    #[test]
    fn simple_ops_one_per_line() {
        let mut ch = Chunk::new(Istr::new("main"));
        ch.push_op(Op::Ld0);
        ch.push_op(Op::Ld1);
        ch.push_op(Op::Add);
        ch.push_op(Op::Ret);
        let text = dump(&ch);
        assert!(text.starts_with("main:\n"));
        assert!(text.contains("0000 ld_0"));
        assert!(text.contains("0001 ld_1"));
        assert!(text.contains("0002 add"));
        assert!(text.contains("0003 ret"));
    }

    #[test]
    fn keyword_ops_use_key_mnemonics() {
        let mut ch = Chunk::new(Istr::new("main"));
        ch.push_op(Op::True);
        ch.push_op(Op::False);
        ch.push_op(Op::Nil);
        ch.push_op(Op::With);
        let text = dump(&ch);
        assert!(text.contains("0000 key_true"), "got: {text}");
        assert!(text.contains("0001 key_false"), "got: {text}");
        assert!(text.contains("0002 key_nil"), "got: {text}");
        assert!(text.contains("0003 key_with"), "got: {text}");
    }

    #[test]
    fn literals_are_decoded() {
        let mut ch = Chunk::new(Istr::new("main"));
        ch.emit_literal(Value::Num(42.5)).unwrap();
        let text = dump(&ch);
        assert!(text.contains("lit_8    42.5"));
    }

    #[test]
    fn jumps_show_absolute_targets() {
        let mut ch = Chunk::new(Istr::new("main"));
        ch.push_op(Op::Jmp);
        ch.push_u16(4);
        let text = dump(&ch);
        assert!(text.contains("(0 -> 7)"), "got: {text}");
    }

    #[test]
    fn backward_jumps_subtract() {
        let mut ch = Chunk::new(Istr::new("main"));
        ch.push_op(Op::Nil);
        ch.push_op(Op::JmpBackPop);
        ch.push_u16(4);
        let text = dump(&ch);
        assert!(text.contains("(1 -> 0)"), "got: {text}");
    }
}
