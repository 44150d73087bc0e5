//! The virtual machine.
//!
//! A tight dispatch loop over one-byte opcodes. Each call frame pins the
//! executing closure, its byte-indexed resume ip, and its stack base; the
//! base points at the closure value itself, so local slot `k` lives at
//! `stack[base + k]` with slot 0 reserved for the closure.
//!
//! Upvalues that still point into the stack are kept in a list ordered by
//! descending slot, so closing everything at or above a frame base is a
//! walk off the front of the list.

use std::cell::RefCell;
use std::collections::HashMap;
use std::io::Write;
use std::rc::Rc;

use ayu_core::chunk::Op;
use ayu_core::intern::Istr;
use ayu_core::value::{Closure, NativeFn, NativeHandler, Upvalue, Value};

/// Default value-stack pre-allocation, and the floor for custom ones:
/// the stack never reserves fewer entries than this, so deep recursion
/// does not pay for repeated growth.
const STACK_RESERVE: usize = u16::MAX as usize + 1;

/// Call depth limit; exceeding it is a runtime error, not an abort.
const MAX_FRAMES: usize = 255;

struct CallFrame {
    closure: Rc<Closure>,
    ip: usize,
    base: usize,
}

pub struct Vm {
    frames: Vec<CallFrame>,
    stack: Vec<Value>,
    globals: HashMap<Istr, Value>,
    /// Open upvalue cells, ordered by descending stack slot.
    open_upvals: Vec<Rc<RefCell<Upvalue>>>,
}

impl Vm {
    /// A VM ready to run a compiled script function, with the default
    /// stack reservation.
    pub fn new(script: Rc<Closure>) -> Vm {
        Vm::with_stack_reserve(script, STACK_RESERVE)
    }

    /// A VM whose value stack pre-allocates `reserve` entries. Values
    /// below the built-in floor are raised to it; hosts running deeply
    /// recursive programs can pass something larger.
    pub fn with_stack_reserve(script: Rc<Closure>, reserve: usize) -> Vm {
        let mut stack = Vec::with_capacity(reserve.max(STACK_RESERVE));
        stack.push(Value::Function(script.clone()));
        let mut frames = Vec::with_capacity(MAX_FRAMES);
        frames.push(CallFrame { closure: script, ip: 0, base: 0 });
        Vm {
            frames,
            stack,
            globals: HashMap::new(),
            open_upvals: Vec::new(),
        }
    }

    /// Register a native function under a global name.
    pub fn def_native(&mut self, name: &str, arity: u8, handler: NativeHandler) {
        self.globals
            .insert(Istr::new(name), Value::Native(NativeFn { arity, handler }));
    }

    /// Current binding of a global, if any.
    pub fn global(&self, name: &str) -> Option<Value> {
        self.globals.get(&Istr::new(name)).cloned()
    }

    /// Execute to completion. Natives write through `out`; the first
    /// failure aborts the run.
    pub fn run(&mut self, out: &mut dyn Write) -> Result<(), String> {
        loop {
            let op = self.read_op()?;
            match op {
                Op::Ret => {
                    let result = self.pop()?;
                    let frame = self.frames.pop().expect("a frame is executing");
                    self.close_upvals(frame.base);
                    if self.frames.is_empty() {
                        return Ok(());
                    }
                    self.stack.truncate(frame.base);
                    self.stack.push(result);
                }
                Op::Pop | Op::PopLoc => {
                    self.pop()?;
                }
                Op::Ld0 => self.stack.push(Value::Num(0.0)),
                Op::Ld1 => self.stack.push(Value::Num(1.0)),
                Op::Lit8 => {
                    let idx = usize::from(self.read_u8()?);
                    let value = self.literal(idx)?;
                    self.stack.push(value);
                }
                Op::Lit16 => {
                    let idx = usize::from(self.read_u16()?);
                    let value = self.literal(idx)?;
                    self.stack.push(value);
                }
                Op::True => self.stack.push(Value::Bool(true)),
                Op::False => self.stack.push(Value::Bool(false)),
                Op::Nil => self.stack.push(Value::Nil),
                Op::Neg => {
                    let a = self.pop()?.unbox();
                    match a {
                        Value::Num(n) => self.stack.push(Value::Num(-n)),
                        other => return Err(format!("Can't negate {other}")),
                    }
                }
                Op::Inv => {
                    let a = self.pop()?;
                    self.stack.push(Value::Bool(!a.is_truthy()));
                }
                Op::Add | Op::Sub | Op::Mul | Op::Div | Op::Mod | Op::Lt | Op::Gt => {
                    self.binary(op, out)?;
                }
                Op::Eq => {
                    let b = self.pop()?;
                    let a = self.pop()?;
                    self.stack.push(Value::Bool(a == b));
                }
                Op::GlobDef => {
                    let name = self.read_name()?;
                    let value = self.pop()?;
                    self.globals.insert(name, value);
                }
                Op::GlobGet => {
                    let name = self.read_name()?;
                    match self.globals.get(&name) {
                        Some(value) => self.stack.push(value.clone()),
                        None => return Err(format!("Could not find {name} in globals")),
                    }
                }
                Op::GlobSet => {
                    let name = self.read_name()?;
                    let value = self.peek()?.clone();
                    match self.globals.get_mut(&name) {
                        Some(slot) => *slot = value,
                        None => return Err(format!("Could not find {name} in globals")),
                    }
                }
                Op::LocGet => {
                    let slot = usize::from(self.read_u16()?);
                    let idx = self.frame().base + slot;
                    let value = self
                        .stack
                        .get(idx)
                        .cloned()
                        .ok_or_else(|| format!("Local slot {slot} out of range"))?;
                    self.stack.push(value);
                }
                Op::LocSet => {
                    let slot = usize::from(self.read_u16()?);
                    let idx = self.frame().base + slot;
                    let value = self.peek()?.clone();
                    if idx >= self.stack.len() {
                        return Err(format!("Local slot {slot} out of range"));
                    }
                    // A slot holding a by-ref box is written through.
                    match &self.stack[idx] {
                        Value::Ref(cell) => *cell.borrow_mut() = value.unbox(),
                        _ => self.stack[idx] = value,
                    }
                }
                Op::UpvalGet => {
                    let slot = usize::from(self.read_u16()?);
                    let cell = self.upval_cell(slot)?;
                    let value = match &*cell.borrow() {
                        Upvalue::Open(idx) => self
                            .stack
                            .get(*idx)
                            .cloned()
                            .ok_or_else(|| format!("Upvalue {slot} points off the stack"))?,
                        Upvalue::Closed(v) => v.clone(),
                    };
                    self.stack.push(value);
                }
                Op::UpvalSet => {
                    let slot = usize::from(self.read_u16()?);
                    let cell = self.upval_cell(slot)?;
                    let value = self.peek()?.clone();
                    let open_slot = match &*cell.borrow() {
                        Upvalue::Open(idx) => Some(*idx),
                        Upvalue::Closed(_) => None,
                    };
                    match open_slot {
                        Some(idx) => match self.stack.get_mut(idx) {
                            Some(target) => *target = value,
                            None => {
                                return Err(format!("Upvalue {slot} points off the stack"));
                            }
                        },
                        None => *cell.borrow_mut() = Upvalue::Closed(value),
                    }
                }
                Op::UpvalClose => {
                    let top = self.stack.len().saturating_sub(1);
                    self.close_upvals(top);
                    self.pop()?;
                }
                Op::Jmp => {
                    let off = usize::from(self.read_u16()?);
                    self.frame_mut().ip += off;
                }
                Op::JmpFalse => {
                    let off = usize::from(self.read_u16()?);
                    if !self.peek()?.is_truthy() {
                        self.frame_mut().ip += off;
                    }
                }
                Op::JmpFalsePop => {
                    let off = usize::from(self.read_u16()?);
                    let cond = self.pop()?;
                    if !cond.is_truthy() {
                        self.frame_mut().ip += off;
                    }
                }
                Op::JmpBackPop => {
                    let off = usize::from(self.read_u16()?);
                    let cond = self.pop()?;
                    if cond.is_truthy() {
                        self.frame_mut().ip -= off;
                    }
                }
                Op::Call => {
                    let nargs = self.read_u8()?;
                    self.call_value(nargs, out)?;
                }
                Op::NewObj => self.stack.push(Value::new_object()),
                Op::PropDef => {
                    let name = self.read_name()?;
                    let value = self.pop()?;
                    match self.peek()?.clone().unbox() {
                        Value::Object(fields) => {
                            fields.borrow_mut().insert(name, value);
                        }
                        other => {
                            return Err(format!("Can't define field {name} on {other}"));
                        }
                    }
                }
                Op::PropGet => {
                    let name = self.read_name()?;
                    let receiver = self.pop()?.unbox();
                    match &receiver {
                        Value::Object(fields) => {
                            let value = fields.borrow().get(&name).cloned();
                            match value {
                                Some(v) => self.stack.push(v),
                                None => {
                                    return Err(format!("Failed to find {name} in {receiver}"));
                                }
                            }
                        }
                        other => return Err(format!("Failed to find {name} in {other}")),
                    }
                }
                Op::PropSet => {
                    let name = self.read_name()?;
                    let value = self.pop()?;
                    let receiver = self.pop()?.unbox();
                    match receiver {
                        Value::Object(fields) => {
                            fields.borrow_mut().insert(name, value.clone());
                            self.stack.push(value);
                        }
                        other => return Err(format!("Can't set field {name} on {other}")),
                    }
                }
                Op::With => {
                    let b = self.pop()?.unbox();
                    let a = self.pop()?.unbox();
                    match (&a, &b) {
                        (Value::Object(left), Value::Object(right)) => {
                            let mut merged = left.borrow().clone();
                            for (k, v) in right.borrow().iter() {
                                merged.insert(*k, v.clone());
                            }
                            self.stack
                                .push(Value::Object(Rc::new(RefCell::new(merged))));
                        }
                        _ => return Err(format!("Can't do {a} with {b}")),
                    }
                }
                Op::Array => {
                    let count = usize::from(self.read_u16()?);
                    if self.stack.len() < count {
                        return Err("Value stack underflow building array".to_string());
                    }
                    let items = self.stack.split_off(self.stack.len() - count);
                    self.stack.push(Value::new_array(items));
                }
                Op::SizedArray => {
                    let value = self.pop()?;
                    let size = self.pop()?.unbox();
                    match size {
                        Value::Num(n) if n >= 0.0 => {
                            let len = n.floor() as usize;
                            self.stack.push(Value::new_array(vec![value; len]));
                        }
                        other => {
                            return Err(format!("Size of sized array must be a number, got {other}"));
                        }
                    }
                }
                Op::IdxGet => {
                    let index = self.pop()?.unbox();
                    let target = self.pop()?.unbox();
                    let value = self.index_get(&target, &index)?;
                    self.stack.push(value);
                }
                Op::IdxSet => {
                    let value = self.pop()?;
                    let index = self.pop()?.unbox();
                    let target = self.pop()?.unbox();
                    match (&target, &index) {
                        (Value::Array(items), Value::Num(n)) => {
                            let idx = array_index(*n, items.borrow().len(), &target, &index)?;
                            items.borrow_mut()[idx] = value.clone();
                            self.stack.push(value);
                        }
                        _ => return Err(format!("Can't perform {target}[{index}]")),
                    }
                }
                Op::Closure => {
                    let lit = usize::from(self.read_u16()?);
                    let proto = match self.literal(lit)? {
                        Value::Function(f) => f,
                        other => {
                            return Err(format!("Closure literal is not a function: {other}"));
                        }
                    };
                    let count = usize::from(self.read_u16()?);
                    let mut upvals = Vec::with_capacity(count);
                    for _ in 0..count {
                        let is_local = self.read_u8()? != 0;
                        let index = usize::from(self.read_u16()?);
                        if is_local {
                            let slot = self.frame().base + index;
                            upvals.push(self.capture_upval(slot));
                        } else {
                            upvals.push(self.upval_cell(index)?);
                        }
                    }
                    let closure = Closure { desc: proto.desc.clone(), upvals };
                    self.stack.push(Value::Function(Rc::new(closure)));
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Frame and operand access
    // ------------------------------------------------------------------

    fn frame(&self) -> &CallFrame {
        self.frames.last().expect("a frame is executing")
    }

    fn frame_mut(&mut self) -> &mut CallFrame {
        self.frames.last_mut().expect("a frame is executing")
    }

    fn read_op(&mut self) -> Result<Op, String> {
        let frame = self.frame_mut();
        let chunk = &frame.closure.desc.chunk;
        if frame.ip >= chunk.len() {
            return Err(format!("Ran off the end of chunk {}", chunk.name));
        }
        let op = chunk.read_op(frame.ip)?;
        frame.ip += 1;
        Ok(op)
    }

    fn read_u8(&mut self) -> Result<u8, String> {
        let frame = self.frame_mut();
        let byte = frame.closure.desc.chunk.read_u8(frame.ip);
        frame.ip += 1;
        Ok(byte)
    }

    fn read_u16(&mut self) -> Result<u16, String> {
        let frame = self.frame_mut();
        let word = frame.closure.desc.chunk.read_u16(frame.ip);
        frame.ip += 2;
        Ok(word)
    }

    fn literal(&self, idx: usize) -> Result<Value, String> {
        let chunk = &self.frame().closure.desc.chunk;
        chunk
            .literals
            .get(idx)
            .cloned()
            .ok_or_else(|| format!("Literal {idx} out of range in chunk {}", chunk.name))
    }

    /// Read a u16 literal operand that must name an interned string.
    fn read_name(&mut self) -> Result<Istr, String> {
        let idx = usize::from(self.read_u16()?);
        match self.literal(idx)? {
            Value::Str(name) => Ok(name),
            other => Err(format!("Name literal is not a string: {other}")),
        }
    }

    fn upval_cell(&self, slot: usize) -> Result<Rc<RefCell<Upvalue>>, String> {
        self.frame()
            .closure
            .upvals
            .get(slot)
            .cloned()
            .ok_or_else(|| format!("Upvalue slot {slot} out of range"))
    }

    fn pop(&mut self) -> Result<Value, String> {
        self.stack
            .pop()
            .ok_or_else(|| "Value stack underflow".to_string())
    }

    fn peek(&self) -> Result<&Value, String> {
        self.stack
            .last()
            .ok_or_else(|| "Value stack underflow".to_string())
    }

    // ------------------------------------------------------------------
    // Arithmetic and dispatch
    // ------------------------------------------------------------------

    fn binary(&mut self, op: Op, out: &mut dyn Write) -> Result<(), String> {
        let b = self.pop()?.unbox();
        let a = self.pop()?.unbox();

        if let (Value::Num(x), Value::Num(y)) = (&a, &b) {
            let result = match op {
                Op::Add => Value::Num(x + y),
                Op::Sub => Value::Num(x - y),
                Op::Mul => Value::Num(x * y),
                Op::Div => Value::Num(x / y),
                Op::Mod => Value::Num(x % y),
                Op::Lt => Value::Bool(x < y),
                Op::Gt => Value::Bool(x > y),
                _ => return Err(format!("Not a binary operator: {}", op.mnemonic())),
            };
            self.stack.push(result);
            return Ok(());
        }

        if op == Op::Add {
            if let (Value::Str(x), Value::Str(y)) = (&a, &b) {
                self.stack.push(Value::Str(x.concat(*y)));
                return Ok(());
            }
        }

        // User-level operator overloading: the left operand is an object
        // with a method stored under the operator's symbol. Re-dispatch
        // as a member call; the method's return value is the result.
        if let Some(sym) = overload_symbol(op) {
            if let Value::Object(fields) = &a {
                let method = fields.borrow().get(&Istr::new(sym)).cloned();
                if let Some(method) = method {
                    self.stack.push(method);
                    self.stack.push(a);
                    self.stack.push(b);
                    return self.call_value(2, out);
                }
            }
        }

        Err(format!("Couldn't do {a} {} {b}", op_symbol(op)))
    }

    /// Invoke the callee sitting `nargs` slots below the top.
    fn call_value(&mut self, nargs: u8, out: &mut dyn Write) -> Result<(), String> {
        let argc = usize::from(nargs);
        if self.stack.len() < argc + 1 {
            return Err("Value stack underflow in call".to_string());
        }
        let callee_idx = self.stack.len() - 1 - argc;
        let callee = self.stack[callee_idx].clone().unbox();

        match callee {
            Value::Native(native) => {
                if native.arity != nargs {
                    return Err(format!(
                        "Expected {} args to native function, got {nargs}",
                        native.arity
                    ));
                }
                let args: Vec<Value> = self.stack[callee_idx + 1..].to_vec();
                let result = (native.handler)(out, &args)?;
                self.stack.truncate(callee_idx);
                self.stack.push(result);
                Ok(())
            }
            Value::Function(closure) => {
                let desc = closure.desc.clone();
                match desc.variadic_start {
                    Some(rest) => {
                        let rest = usize::from(rest);
                        if argc < rest {
                            return Err(format!(
                                "Expected at least {rest} args to {}, got {argc}",
                                desc.name()
                            ));
                        }
                        // Pack surplus arguments into the rest array.
                        let surplus = self.stack.split_off(callee_idx + 1 + rest);
                        self.stack.push(Value::new_array(surplus));
                    }
                    None => {
                        if argc != usize::from(desc.arity) {
                            return Err(format!(
                                "Expected {} args to {}, got {argc}",
                                desc.arity,
                                desc.name()
                            ));
                        }
                    }
                }
                // Box by-reference parameters.
                for (i, by_ref) in desc.ref_params.iter().enumerate() {
                    let idx = callee_idx + 1 + i;
                    if *by_ref && idx < self.stack.len() && !matches!(self.stack[idx], Value::Ref(_))
                    {
                        let plain = std::mem::replace(&mut self.stack[idx], Value::Nil);
                        self.stack[idx] = Value::boxed(plain);
                    }
                }
                if self.frames.len() >= MAX_FRAMES {
                    return Err("Call stack overflow".to_string());
                }
                self.frames.push(CallFrame { closure, ip: 0, base: callee_idx });
                Ok(())
            }
            other => Err(format!("Can't call {other}")),
        }
    }

    fn index_get(&self, target: &Value, index: &Value) -> Result<Value, String> {
        match (target, index) {
            (Value::Array(items), Value::Num(n)) => {
                let items = items.borrow();
                let idx = array_index(*n, items.len(), target, index)?;
                Ok(items[idx].clone())
            }
            _ => Err(format!("Can't perform {target}[{index}]")),
        }
    }

    // ------------------------------------------------------------------
    // Upvalues
    // ------------------------------------------------------------------

    /// Find or create the open upvalue cell for a stack slot. Closures
    /// capturing the same local share one cell.
    fn capture_upval(&mut self, slot: usize) -> Rc<RefCell<Upvalue>> {
        let mut insert_at = self.open_upvals.len();
        for (i, cell) in self.open_upvals.iter().enumerate() {
            let open = match &*cell.borrow() {
                Upvalue::Open(idx) => *idx,
                Upvalue::Closed(_) => continue,
            };
            if open == slot {
                return cell.clone();
            }
            if open < slot {
                insert_at = i;
                break;
            }
        }
        let cell = Rc::new(RefCell::new(Upvalue::Open(slot)));
        self.open_upvals.insert(insert_at, cell.clone());
        cell
    }

    /// Close every open upvalue at or above `from`: move the stack value
    /// into the cell and drop it from the open list.
    fn close_upvals(&mut self, from: usize) {
        loop {
            let Some(front) = self.open_upvals.first() else { break };
            let idx = match &*front.borrow() {
                Upvalue::Open(idx) => *idx,
                Upvalue::Closed(_) => break,
            };
            if idx < from {
                break;
            }
            let cell = self.open_upvals.remove(0);
            let value = self.stack.get(idx).cloned().unwrap_or(Value::Nil);
            *cell.borrow_mut() = Upvalue::Closed(value);
        }
    }

    /// Stack depth (tests and diagnostics).
    pub fn stack_len(&self) -> usize {
        self.stack.len()
    }
}

fn op_symbol(op: Op) -> &'static str {
    match op {
        Op::Add => "+",
        Op::Sub => "-",
        Op::Mul => "*",
        Op::Div => "/",
        Op::Mod => "%",
        Op::Lt => "<",
        Op::Gt => ">",
        _ => "?",
    }
}

/// Only the arithmetic operators dispatch to object methods.
fn overload_symbol(op: Op) -> Option<&'static str> {
    Some(match op {
        Op::Add => "+",
        Op::Sub => "-",
        Op::Mul => "*",
        Op::Div => "/",
        Op::Mod => "%",
        _ => return None,
    })
}

fn array_index(n: f64, len: usize, target: &Value, index: &Value) -> Result<usize, String> {
    if n < 0.0 || !n.is_finite() {
        return Err(format!("Can't perform {target}[{index}]"));
    }
    let idx = n.floor() as usize;
    if idx >= len {
        return Err(format!("Index {idx} out of bounds for array of length {len}"));
    }
    Ok(idx)
}
