//! Bytecode chunks.
//!
//! A chunk is a flat byte stream of one-byte opcodes, each followed by a
//! fixed operand block, plus the literal pool those operands index into.
//! Multi-byte operands are little-endian. The compiler appends; the VM
//! and disassembler read.

use num_enum::TryFromPrimitive;

use crate::intern::Istr;
use crate::value::Value;

/// One-byte operation codes.
///
/// Operand layout (after the opcode byte):
/// - `Lit8`: u8 literal index
/// - `Lit16`, `GlobDef`/`GlobGet`/`GlobSet`, `PropDef`/`PropGet`/`PropSet`:
///   u16 literal index
/// - `LocGet`/`LocSet`, `UpvalGet`/`UpvalSet`: u16 slot
/// - `Jmp`/`JmpFalse`/`JmpFalsePop`/`JmpBackPop`: u16 byte offset,
///   relative to the ip after the operand is consumed (`JmpBackPop`
///   subtracts, the others add)
/// - `Call`: u8 argument count
/// - `Array`: u16 element count
/// - `Closure`: u16 literal index, u16 upvalue count k, then k pairs of
///   (u8 is_local, u16 index)
/// - everything else: no operands
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum Op {
    Ret,
    Pop,
    PopLoc,
    Ld0,
    Ld1,
    Lit8,
    Lit16,
    Neg,
    Inv,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    Lt,
    Gt,
    True,
    False,
    Nil,
    With,
    GlobDef,
    GlobGet,
    GlobSet,
    LocGet,
    LocSet,
    UpvalGet,
    UpvalSet,
    UpvalClose,
    Jmp,
    JmpFalse,
    JmpFalsePop,
    JmpBackPop,
    Call,
    NewObj,
    PropDef,
    PropGet,
    PropSet,
    Array,
    SizedArray,
    IdxGet,
    IdxSet,
    Closure,
}

impl Op {
    /// Disassembly mnemonic.
    pub fn mnemonic(self) -> &'static str {
        match self {
            Op::Ret => "ret",
            Op::Pop => "pop",
            Op::PopLoc => "pop_loc",
            Op::Ld0 => "ld_0",
            Op::Ld1 => "ld_1",
            Op::Lit8 => "lit_8",
            Op::Lit16 => "lit_16",
            Op::Neg => "neg",
            Op::Inv => "inv",
            Op::Add => "add",
            Op::Sub => "sub",
            Op::Mul => "mul",
            Op::Div => "div",
            Op::Mod => "mod",
            Op::Eq => "eq",
            Op::Lt => "lt",
            Op::Gt => "gt",
            Op::True => "key_true",
            Op::False => "key_false",
            Op::Nil => "key_nil",
            Op::With => "key_with",
            Op::GlobDef => "glob_d",
            Op::GlobGet => "glob_g",
            Op::GlobSet => "glob_s",
            Op::LocGet => "loc_g",
            Op::LocSet => "loc_s",
            Op::UpvalGet => "upval_g",
            Op::UpvalSet => "upval_s",
            Op::UpvalClose => "upval_c",
            Op::Jmp => "jmp",
            Op::JmpFalse => "jmpf",
            Op::JmpFalsePop => "jmpf_pop",
            Op::JmpBackPop => "jmpb_pop",
            Op::Call => "call",
            Op::NewObj => "new_obj",
            Op::PropDef => "prop_d",
            Op::PropGet => "prop_g",
            Op::PropSet => "prop_s",
            Op::Array => "array",
            Op::SizedArray => "szd_arr",
            Op::IdxGet => "idx_g",
            Op::IdxSet => "idx_s",
            Op::Closure => "closure",
        }
    }
}

/// Opcode stream + literal pool + debug name.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub code: Vec<u8>,
    pub literals: Vec<Value>,
    pub name: Istr,
}

impl Chunk {
    pub fn new(name: Istr) -> Chunk {
        Chunk {
            code: Vec::new(),
            literals: Vec::new(),
            name,
        }
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    pub fn push_op(&mut self, op: Op) {
        self.code.push(op as u8);
    }

    pub fn push_u8(&mut self, byte: u8) {
        self.code.push(byte);
    }

    pub fn push_u16(&mut self, word: u16) {
        self.code.extend_from_slice(&word.to_le_bytes());
    }

    /// Append a literal to the pool, returning its index.
    ///
    /// Fails once the pool outgrows what a `Lit16`-class operand can
    /// address.
    pub fn add_literal(&mut self, value: Value) -> Result<u16, String> {
        let idx = self.literals.len();
        if idx > usize::from(u16::MAX) {
            return Err(format!("Too many literals in chunk '{}'", self.name));
        }
        self.literals.push(value);
        Ok(idx as u16)
    }

    /// Append a literal and emit the narrowest load for it (`lit_8` when
    /// the index fits in a byte, `lit_16` otherwise).
    pub fn emit_literal(&mut self, value: Value) -> Result<(), String> {
        let idx = self.add_literal(value)?;
        if let Ok(short) = u8::try_from(idx) {
            self.push_op(Op::Lit8);
            self.push_u8(short);
        } else {
            self.push_op(Op::Lit16);
            self.push_u16(idx);
        }
        Ok(())
    }

    pub fn read_u8(&self, at: usize) -> u8 {
        self.code[at]
    }

    pub fn read_u16(&self, at: usize) -> u16 {
        u16::from_le_bytes([self.code[at], self.code[at + 1]])
    }

    pub fn read_op(&self, at: usize) -> Result<Op, String> {
        Op::try_from(self.code[at])
            .map_err(|_| format!("Bad opcode byte {:#04x} at offset {at}", self.code[at]))
    }

    /// Overwrite a previously-emitted u16 operand (jump patching).
    pub fn patch_u16(&mut self, at: usize, word: u16) {
        let bytes = word.to_le_bytes();
        self.code[at] = bytes[0];
        self.code[at + 1] = bytes[1];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn u16_operands_are_little_endian() {
        let mut ch = Chunk::new(Istr::new("test"));
        ch.push_u16(0x1234);
        assert_eq!(ch.code, vec![0x34, 0x12]);
        assert_eq!(ch.read_u16(0), 0x1234);
    }

    #[test]
    fn patching_overwrites_in_place() {
        let mut ch = Chunk::new(Istr::new("test"));
        ch.push_op(Op::Jmp);
        ch.push_u16(0xffff);
        ch.patch_u16(1, 7);
        assert_eq!(ch.read_u16(1), 7);
    }

    #[test]
    fn emit_literal_picks_narrowest_load() {
        let mut ch = Chunk::new(Istr::new("test"));
        ch.emit_literal(Value::Num(2.5)).unwrap();
        assert_eq!(ch.read_op(0).unwrap(), Op::Lit8);
        assert_eq!(ch.read_u8(1), 0);

        // Fill the low pool, then the 257th literal needs a wide load.
        for i in 0..=255 {
            ch.add_literal(Value::Num(f64::from(i))).unwrap();
        }
        let at = ch.len();
        ch.emit_literal(Value::Num(9.0)).unwrap();
        assert_eq!(ch.read_op(at).unwrap(), Op::Lit16);
        assert_eq!(ch.read_u16(at + 1), 257);
    }

    #[test]
    fn opcode_bytes_round_trip() {
        for op in [Op::Ret, Op::Closure, Op::JmpBackPop, Op::SizedArray] {
            assert_eq!(Op::try_from(op as u8).unwrap(), op);
        }
        assert!(Op::try_from(0xee).is_err());
    }
}
