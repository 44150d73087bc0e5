//! Single-pass bytecode compiler: AST to chunks.
//!
//! One function context per function being compiled, kept as a stack
//! (innermost last). Each context tracks its locals (slot 0 is reserved
//! for the closure itself), its upvalue specs, the current block depth,
//! and any active loops. Name resolution walks local -> upvalue ->
//! global; upvalue resolution recurses outward, marking captured locals
//! as it goes.
//!
//! Forward jumps are emitted with a `0xffff` placeholder and patched once
//! the target offset is known; the only backward jump is the `for` loop
//! trampoline.

use std::rc::Rc;

use ayu_core::chunk::{Chunk, Op};
use ayu_core::intern::Istr;
use ayu_core::value::{Closure, FnDesc, Value};

use crate::ast::{Node, NodeKind, Param};
use crate::lexer::TokKind;

const CTX: &str = "compiler always has an active function context";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FnKind {
    Script,
    Fn,
}

#[derive(Debug)]
struct Local {
    name: Istr,
    depth: usize,
    captured: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct UpvalSpec {
    index: u16,
    is_local: bool,
}

#[derive(Debug)]
struct LoopCtx {
    /// Block depth of the loop body; jump-out statements pop everything
    /// at or beyond it.
    depth: usize,
    next_jumps: Vec<usize>,
    break_jumps: Vec<usize>,
}

struct FnCtx {
    chunk: Chunk,
    kind: FnKind,
    arity: u8,
    variadic_start: Option<u8>,
    ref_params: Vec<bool>,
    locals: Vec<Local>,
    upvals: Vec<UpvalSpec>,
    depth: usize,
    loops: Vec<LoopCtx>,
}

impl FnCtx {
    fn new(name: Istr, kind: FnKind) -> FnCtx {
        FnCtx {
            chunk: Chunk::new(name),
            kind,
            arity: 0,
            variadic_start: None,
            ref_params: Vec::new(),
            // Slot 0 holds the closure being executed.
            locals: vec![Local { name: Istr::new(""), depth: 0, captured: false }],
            upvals: Vec::new(),
            depth: 0,
            loops: Vec::new(),
        }
    }

    fn into_desc(self) -> FnDesc {
        let upval_count = self.upvals.len() as u16;
        FnDesc {
            chunk: self.chunk,
            arity: self.arity,
            variadic_start: self.variadic_start,
            ref_params: self.ref_params,
            upval_count,
        }
    }
}

pub struct Compiler {
    ctxs: Vec<FnCtx>,
    /// Counter for synthetic names (`field@0001`, `@end0002`).
    synth: u32,
}

impl Compiler {
    /// A compiler for a top-level script chunk named `name`.
    pub fn script(name: &str) -> Compiler {
        Compiler {
            ctxs: vec![FnCtx::new(Istr::new(name), FnKind::Script)],
            synth: 0,
        }
    }

    /// Compile a parsed program (a block node) into a script function.
    pub fn compile(mut self, root: &Node) -> Result<Rc<Closure>, String> {
        let NodeKind::Block(stmts) = &root.kind else {
            return Err("Compiler input must be a block".to_string());
        };
        for stmt in stmts {
            self.node(stmt)?;
            self.pop_for_stmt(stmt);
        }
        self.chunk().push_op(Op::Ret);
        let ctx = self.ctxs.pop().expect(CTX);
        Ok(Rc::new(Closure::bare(Rc::new(ctx.into_desc()))))
    }

    fn ctx(&mut self) -> &mut FnCtx {
        self.ctxs.last_mut().expect(CTX)
    }

    fn chunk(&mut self) -> &mut Chunk {
        &mut self.ctx().chunk
    }

    fn name_literal(&mut self, name: &str) -> Result<u16, String> {
        let value = Value::Str(Istr::new(name));
        self.chunk().add_literal(value)
    }

    fn node(&mut self, n: &Node) -> Result<(), String> {
        match &n.kind {
            NodeKind::Number(v) => self.number(*v),
            NodeKind::Str(s) => {
                let value = Value::Str(Istr::new(s));
                self.chunk().emit_literal(value)
            }
            NodeKind::True => {
                self.chunk().push_op(Op::True);
                Ok(())
            }
            NodeKind::False => {
                self.chunk().push_op(Op::False);
                Ok(())
            }
            NodeKind::Nil => {
                self.chunk().push_op(Op::Nil);
                Ok(())
            }
            NodeKind::FieldGet { target: Some(target), field } => {
                self.node(target)?;
                let lit = self.name_literal(field)?;
                let ch = self.chunk();
                ch.push_op(Op::PropGet);
                ch.push_u16(lit);
                Ok(())
            }
            NodeKind::FieldGet { target: None, field } => self.get_var(field),
            NodeKind::VarDef { name, value } => self.var_def(name, value),
            NodeKind::BinOp { op, lhs, rhs } => self.bin_op(*op, lhs, rhs),
            NodeKind::UnOp { op, target } => self.un_op(*op, target),
            NodeKind::If { cases, else_body } => self.if_expr(cases, else_body.as_deref()),
            NodeKind::Block(exprs) => {
                self.begin_block();
                for e in exprs {
                    self.node(e)?;
                    self.pop_for_stmt(e);
                }
                self.end_block();
                Ok(())
            }
            NodeKind::FnDef { name, args, body, is_variadic } => {
                self.fn_def(name, args, *is_variadic, body)
            }
            NodeKind::AnonFnDef { args, body, is_variadic } => {
                self.function("", args, *is_variadic, body)
            }
            NodeKind::Call { callee, args } => self.call(callee, args),
            NodeKind::MemberCall { receiver, field, args } => {
                self.member_call(receiver, field, args)
            }
            NodeKind::Object(fields) => self.object(fields),
            NodeKind::Array(exprs) => self.array(exprs),
            NodeKind::SizedArray { size, value } => {
                self.node(size)?;
                self.node(value)?;
                self.chunk().push_op(Op::SizedArray);
                Ok(())
            }
            NodeKind::For { var, iterable, body } => self.for_loop(var, iterable, body),
            NodeKind::Ret(value) => self.ret_stmt(value.as_deref()),
            NodeKind::Next => self.loop_jump(false, "next"),
            NodeKind::Break => self.loop_jump(true, "break"),
            NodeKind::Range { .. } => {
                Err("Range expressions are only supported as for-loop iterables".to_string())
            }
            NodeKind::Deco { .. } => Err("Unexpected decorator outside a statement".to_string()),
            NodeKind::Decorated { decos, target } => self.decorated(decos, target),
        }
    }

    /// Drop the value of an expression statement; definitions, loops, and
    /// jump statements leave nothing behind.
    fn pop_for_stmt(&mut self, n: &Node) {
        match &n.kind {
            NodeKind::VarDef { .. }
            | NodeKind::FnDef { .. }
            | NodeKind::For { .. }
            | NodeKind::Ret(_)
            | NodeKind::Next
            | NodeKind::Break
            | NodeKind::Block(_) => {}
            NodeKind::Decorated { target, .. }
                if matches!(target.kind, NodeKind::FnDef { .. }) => {}
            _ => self.chunk().push_op(Op::Pop),
        }
    }

    // ------------------------------------------------------------------
    // Literals and names
    // ------------------------------------------------------------------

    fn number(&mut self, v: f64) -> Result<(), String> {
        if v == 0.0 {
            self.chunk().push_op(Op::Ld0);
            Ok(())
        } else if v == 1.0 {
            self.chunk().push_op(Op::Ld1);
            Ok(())
        } else {
            self.chunk().emit_literal(Value::Num(v))
        }
    }

    fn get_var(&mut self, name: &str) -> Result<(), String> {
        let interned = Istr::new(name);
        let top = self.ctxs.len() - 1;
        if let Some(slot) = self.resolve_local_in(top, interned) {
            let ch = self.chunk();
            ch.push_op(Op::LocGet);
            ch.push_u16(slot);
        } else if let Some(up) = self.resolve_upval(top, interned)? {
            let ch = self.chunk();
            ch.push_op(Op::UpvalGet);
            ch.push_u16(up);
        } else {
            let lit = self.name_literal(name)?;
            let ch = self.chunk();
            ch.push_op(Op::GlobGet);
            ch.push_u16(lit);
        }
        Ok(())
    }

    /// Write top-of-stack to `name` without popping (assignment yields
    /// the stored value).
    fn set_var(&mut self, name: &str) -> Result<(), String> {
        let interned = Istr::new(name);
        let top = self.ctxs.len() - 1;
        if let Some(slot) = self.resolve_local_in(top, interned) {
            let ch = self.chunk();
            ch.push_op(Op::LocSet);
            ch.push_u16(slot);
        } else if let Some(up) = self.resolve_upval(top, interned)? {
            let ch = self.chunk();
            ch.push_op(Op::UpvalSet);
            ch.push_u16(up);
        } else {
            let lit = self.name_literal(name)?;
            let ch = self.chunk();
            ch.push_op(Op::GlobSet);
            ch.push_u16(lit);
        }
        Ok(())
    }

    fn resolve_local_in(&self, ci: usize, name: Istr) -> Option<u16> {
        let locals = &self.ctxs[ci].locals;
        for (i, local) in locals.iter().enumerate().rev() {
            if local.name == name {
                return Some(i as u16);
            }
        }
        None
    }

    fn resolve_upval(&mut self, ci: usize, name: Istr) -> Result<Option<u16>, String> {
        if ci == 0 {
            return Ok(None);
        }
        let parent = ci - 1;
        if let Some(slot) = self.resolve_local_in(parent, name) {
            self.ctxs[parent].locals[usize::from(slot)].captured = true;
            return self.add_upval(ci, slot, true).map(Some);
        }
        if let Some(up) = self.resolve_upval(parent, name)? {
            return self.add_upval(ci, up, false).map(Some);
        }
        Ok(None)
    }

    fn add_upval(&mut self, ci: usize, index: u16, is_local: bool) -> Result<u16, String> {
        let ctx = &mut self.ctxs[ci];
        for (i, spec) in ctx.upvals.iter().enumerate() {
            if spec.index == index && spec.is_local == is_local {
                return Ok(i as u16);
            }
        }
        if ctx.upvals.len() >= 255 {
            return Err(format!("Too many upvalues in {}", ctx.chunk.name));
        }
        ctx.upvals.push(UpvalSpec { index, is_local });
        Ok((ctx.upvals.len() - 1) as u16)
    }

    fn add_local(&mut self, name: &str) -> Result<(), String> {
        let interned = Istr::new(name);
        let ctx = self.ctxs.last_mut().expect(CTX);
        if ctx.locals.len() > usize::from(u16::MAX) {
            return Err(format!("Too many locals in {}", ctx.chunk.name));
        }
        for local in ctx.locals.iter().rev() {
            if local.depth < ctx.depth {
                break;
            }
            if local.name == interned {
                return Err(format!("Variable {name} already exists in scope"));
            }
        }
        let depth = ctx.depth;
        ctx.locals.push(Local { name: interned, depth, captured: false });
        Ok(())
    }

    fn var_def(&mut self, name: &str, value: &Node) -> Result<(), String> {
        if matches!(value.kind, NodeKind::VarDef { .. }) {
            return Err(format!("A definition has no value to bind '{name}' to"));
        }
        self.node(value)?;
        if self.ctx().depth > 0 {
            self.add_local(name)
        } else {
            let lit = self.name_literal(name)?;
            let ch = self.chunk();
            ch.push_op(Op::GlobDef);
            ch.push_u16(lit);
            Ok(())
        }
    }

    // ------------------------------------------------------------------
    // Blocks, scopes, jumps
    // ------------------------------------------------------------------

    fn begin_block(&mut self) {
        self.ctx().depth += 1;
    }

    /// Close the current scope, popping (or closing into upvalues) every
    /// local it declared.
    fn end_block(&mut self) {
        let ctx = self.ctxs.last_mut().expect(CTX);
        ctx.depth -= 1;
        while ctx.locals.len() > 1 {
            let Some(last) = ctx.locals.last() else { break };
            if last.depth <= ctx.depth {
                break;
            }
            let captured = last.captured;
            ctx.locals.pop();
            if captured {
                ctx.chunk.push_op(Op::UpvalClose);
            } else {
                ctx.chunk.push_op(Op::PopLoc);
            }
        }
    }

    /// Emit a forward jump with a placeholder operand, returning the
    /// operand offset for patching.
    fn emit_jump(&mut self, op: Op) -> usize {
        let ch = self.chunk();
        ch.push_op(op);
        let at = ch.len();
        ch.push_u16(0xffff);
        at
    }

    fn patch_jump(&mut self, at: usize) -> Result<(), String> {
        let ch = self.chunk();
        let dist = ch.len() - at - 2;
        if dist > usize::from(u16::MAX) {
            return Err("Jump distance overflows a u16 operand".to_string());
        }
        ch.patch_u16(at, dist as u16);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Operators
    // ------------------------------------------------------------------

    fn bin_op(&mut self, op: TokKind, lhs: &Node, rhs: &Node) -> Result<(), String> {
        match op {
            TokKind::Assign
            | TokKind::AddAssign
            | TokKind::SubAssign
            | TokKind::MulAssign
            | TokKind::DivAssign
            | TokKind::ModAssign => self.assignment(op, lhs, rhs),
            // `a & b`: keep a if falsy, else b.
            TokKind::And => {
                self.node(lhs)?;
                let end = self.emit_jump(Op::JmpFalse);
                self.chunk().push_op(Op::Pop);
                self.node(rhs)?;
                self.patch_jump(end)
            }
            // `a | b`: keep a if truthy, else b.
            TokKind::Or => {
                self.node(lhs)?;
                let else_jump = self.emit_jump(Op::JmpFalse);
                let end = self.emit_jump(Op::Jmp);
                self.patch_jump(else_jump)?;
                self.chunk().push_op(Op::Pop);
                self.node(rhs)?;
                self.patch_jump(end)
            }
            _ => {
                self.node(lhs)?;
                self.node(rhs)?;
                let ch = self.chunk();
                match op {
                    TokKind::Add => ch.push_op(Op::Add),
                    TokKind::Sub => ch.push_op(Op::Sub),
                    TokKind::Mul => ch.push_op(Op::Mul),
                    TokKind::Div => ch.push_op(Op::Div),
                    TokKind::Mod => ch.push_op(Op::Mod),
                    TokKind::Eq => ch.push_op(Op::Eq),
                    TokKind::Neq => {
                        ch.push_op(Op::Eq);
                        ch.push_op(Op::Inv);
                    }
                    TokKind::Lt => ch.push_op(Op::Lt),
                    TokKind::Gt => ch.push_op(Op::Gt),
                    TokKind::Le => {
                        ch.push_op(Op::Gt);
                        ch.push_op(Op::Inv);
                    }
                    TokKind::Ge => {
                        ch.push_op(Op::Lt);
                        ch.push_op(Op::Inv);
                    }
                    TokKind::LSquare => ch.push_op(Op::IdxGet),
                    TokKind::With => ch.push_op(Op::With),
                    other => return Err(format!("Unknown infix operator {other}")),
                }
                Ok(())
            }
        }
    }

    fn un_op(&mut self, op: TokKind, target: &Node) -> Result<(), String> {
        match op {
            TokKind::Sub => {
                self.node(target)?;
                self.chunk().push_op(Op::Neg);
                Ok(())
            }
            TokKind::Exclaim => {
                self.node(target)?;
                self.chunk().push_op(Op::Inv);
                Ok(())
            }
            // Unary plus is identity.
            TokKind::Add => self.node(target),
            TokKind::Inc | TokKind::Dec => self.increment(op, target),
            other => Err(format!("Unknown unary operator {other}")),
        }
    }

    /// Assignment and compound assignment. Field and index targets
    /// re-evaluate their receiver (and index) for the read-modify-write
    /// forms; the whole expression yields the stored value.
    fn assignment(&mut self, op: TokKind, lhs: &Node, rhs: &Node) -> Result<(), String> {
        let base = match op {
            TokKind::Assign => None,
            TokKind::AddAssign => Some(Op::Add),
            TokKind::SubAssign => Some(Op::Sub),
            TokKind::MulAssign => Some(Op::Mul),
            TokKind::DivAssign => Some(Op::Div),
            TokKind::ModAssign => Some(Op::Mod),
            other => return Err(format!("Unknown assignment operator {other}")),
        };

        match &lhs.kind {
            NodeKind::BinOp { op: TokKind::LSquare, lhs: arr, rhs: idx } => {
                self.node(arr)?;
                self.node(idx)?;
                if let Some(bop) = base {
                    self.node(arr)?;
                    self.node(idx)?;
                    self.chunk().push_op(Op::IdxGet);
                    self.node(rhs)?;
                    self.chunk().push_op(bop);
                } else {
                    self.node(rhs)?;
                }
                self.chunk().push_op(Op::IdxSet);
                Ok(())
            }
            NodeKind::FieldGet { target: Some(target), field } => {
                self.node(target)?;
                if let Some(bop) = base {
                    self.node(target)?;
                    let lit = self.name_literal(field)?;
                    let ch = self.chunk();
                    ch.push_op(Op::PropGet);
                    ch.push_u16(lit);
                    self.node(rhs)?;
                    self.chunk().push_op(bop);
                } else {
                    self.node(rhs)?;
                }
                let lit = self.name_literal(field)?;
                let ch = self.chunk();
                ch.push_op(Op::PropSet);
                ch.push_u16(lit);
                Ok(())
            }
            NodeKind::FieldGet { target: None, field } => {
                if let Some(bop) = base {
                    self.get_var(field)?;
                    self.node(rhs)?;
                    self.chunk().push_op(bop);
                } else {
                    self.node(rhs)?;
                }
                self.set_var(field)
            }
            _ => Err(format!("Invalid assignment target: {}", lhs.kind.tag())),
        }
    }

    /// `x++` / `x--`: read-modify-write yielding the updated value.
    fn increment(&mut self, op: TokKind, target: &Node) -> Result<(), String> {
        let bop = if op == TokKind::Inc { Op::Add } else { Op::Sub };
        match &target.kind {
            NodeKind::FieldGet { target: None, field } => {
                self.get_var(field)?;
                let ch = self.chunk();
                ch.push_op(Op::Ld1);
                ch.push_op(bop);
                self.set_var(field)
            }
            NodeKind::FieldGet { target: Some(recv), field } => {
                self.node(recv)?;
                self.node(recv)?;
                let lit = self.name_literal(field)?;
                let ch = self.chunk();
                ch.push_op(Op::PropGet);
                ch.push_u16(lit);
                ch.push_op(Op::Ld1);
                ch.push_op(bop);
                let lit = self.name_literal(field)?;
                let ch = self.chunk();
                ch.push_op(Op::PropSet);
                ch.push_u16(lit);
                Ok(())
            }
            NodeKind::BinOp { op: TokKind::LSquare, lhs: arr, rhs: idx } => {
                self.node(arr)?;
                self.node(idx)?;
                self.node(arr)?;
                self.node(idx)?;
                let ch = self.chunk();
                ch.push_op(Op::IdxGet);
                ch.push_op(Op::Ld1);
                ch.push_op(bop);
                ch.push_op(Op::IdxSet);
                Ok(())
            }
            _ => Err(format!("Invalid increment target: {}", target.kind.tag())),
        }
    }

    // ------------------------------------------------------------------
    // Control flow
    // ------------------------------------------------------------------

    /// `if` always yields exactly one value: the taken arm's trailing
    /// expression, or nil when the arm ends in a non-value statement or
    /// no arm matches.
    fn if_expr(&mut self, cases: &[(Node, Node)], else_body: Option<&Node>) -> Result<(), String> {
        let mut end_jumps = Vec::new();
        for (cond, body) in cases {
            self.node(cond)?;
            let next_arm = self.emit_jump(Op::JmpFalsePop);
            self.value_block(body)?;
            end_jumps.push(self.emit_jump(Op::Jmp));
            self.patch_jump(next_arm)?;
        }
        match else_body {
            Some(body) => self.value_block(body)?,
            None => self.chunk().push_op(Op::Nil),
        }
        for jump in end_jumps {
            self.patch_jump(jump)?;
        }
        Ok(())
    }

    /// Compile a body (block or bare expression) in value position: all
    /// statements but the last are popped, and a `nil` is padded in when
    /// the last statement produces no value.
    fn value_block(&mut self, body: &Node) -> Result<(), String> {
        match &body.kind {
            NodeKind::Block(exprs) => {
                if exprs.is_empty() {
                    self.chunk().push_op(Op::Nil);
                    return Ok(());
                }
                let last = exprs.len() - 1;
                for (i, e) in exprs.iter().enumerate() {
                    self.node(e)?;
                    if i < last {
                        self.pop_for_stmt(e);
                    }
                }
                if !leaves_value(&exprs[last]) {
                    self.chunk().push_op(Op::Nil);
                }
                Ok(())
            }
            _ => {
                self.node(body)?;
                if !leaves_value(body) {
                    self.chunk().push_op(Op::Nil);
                }
                Ok(())
            }
        }
    }

    fn for_loop(&mut self, var: &str, iterable: &Node, body: &Node) -> Result<(), String> {
        let NodeKind::Range { start, finish } = &iterable.kind else {
            return Err("For loops only support range iterables".to_string());
        };
        let NodeKind::Block(stmts) = &body.kind else {
            return Err("For loop body must be a block".to_string());
        };

        self.begin_block();
        self.node(start)?;
        self.add_local(var)?;
        let top = self.ctxs.len() - 1;
        let slot = self
            .resolve_local_in(top, Istr::new(var))
            .ok_or_else(|| format!("Loop variable {var} did not resolve"))?;

        self.node(finish)?;
        let end_name = format!("@end{}", self.synth);
        self.synth += 1;
        self.add_local(&end_name)?;
        let end_slot = self
            .resolve_local_in(top, Istr::new(&end_name))
            .ok_or_else(|| "Loop bound did not resolve".to_string())?;

        self.begin_block();
        let body_depth = self.ctx().depth;
        let loop_start = self.chunk().len();
        self.ctx().loops.push(LoopCtx {
            depth: body_depth,
            next_jumps: Vec::new(),
            break_jumps: Vec::new(),
        });

        for stmt in stmts {
            self.node(stmt)?;
            self.pop_for_stmt(stmt);
        }

        let finished = self.ctx().loops.pop().expect("loop context is still open");
        self.end_block();

        // `next` lands here, on the step block.
        for jump in finished.next_jumps {
            self.patch_jump(jump)?;
        }

        // var = var + 1; repeat while var < bound.
        let ch = self.chunk();
        ch.push_op(Op::LocGet);
        ch.push_u16(slot);
        ch.push_op(Op::Ld1);
        ch.push_op(Op::Add);
        ch.push_op(Op::LocSet);
        ch.push_u16(slot);
        ch.push_op(Op::LocGet);
        ch.push_u16(end_slot);
        ch.push_op(Op::Lt);
        ch.push_op(Op::JmpBackPop);
        let at = ch.len();
        let dist = at + 2 - loop_start;
        if dist > usize::from(u16::MAX) {
            return Err("Jump distance overflows a u16 operand".to_string());
        }
        ch.push_u16(dist as u16);

        for jump in finished.break_jumps {
            self.patch_jump(jump)?;
        }
        self.end_block();
        Ok(())
    }

    /// `next`/`break`: pop any locals declared since the loop body
    /// opened, then jump out; patched by the enclosing `for`.
    fn loop_jump(&mut self, is_break: bool, what: &str) -> Result<(), String> {
        let ctx = self.ctxs.last_mut().expect(CTX);
        let Some(depth) = ctx.loops.last().map(|l| l.depth) else {
            return Err(format!("Can't use {what} outside of a for loop"));
        };
        for local in ctx.locals.iter().rev() {
            if local.depth < depth {
                break;
            }
            if local.captured {
                ctx.chunk.push_op(Op::UpvalClose);
            } else {
                ctx.chunk.push_op(Op::PopLoc);
            }
        }
        ctx.chunk.push_op(Op::Jmp);
        let at = ctx.chunk.len();
        ctx.chunk.push_u16(0xffff);
        let current = ctx.loops.last_mut().expect("loop context is still open");
        if is_break {
            current.break_jumps.push(at);
        } else {
            current.next_jumps.push(at);
        }
        Ok(())
    }

    fn ret_stmt(&mut self, value: Option<&Node>) -> Result<(), String> {
        if self.ctx().kind == FnKind::Script {
            return Err("Can't return from top level".to_string());
        }
        match value {
            Some(v) => self.node(v)?,
            None => self.chunk().push_op(Op::Nil),
        }
        self.chunk().push_op(Op::Ret);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Functions, calls, aggregates
    // ------------------------------------------------------------------

    /// Compile a function body into its own context, then emit the
    /// `closure` instruction (plus upvalue specs) in the current one.
    fn function(
        &mut self,
        name: &str,
        args: &[Param],
        is_variadic: bool,
        body: &Node,
    ) -> Result<(), String> {
        if args.len() > usize::from(u8::MAX) {
            return Err(format!("Too many parameters in function {name}"));
        }
        let chunk_name = if name.is_empty() { "anonymous" } else { name };
        let mut ctx = FnCtx::new(Istr::new(chunk_name), FnKind::Fn);
        ctx.arity = args.len() as u8;
        ctx.variadic_start = if is_variadic {
            args.len().checked_sub(1).map(|i| i as u8)
        } else {
            None
        };
        ctx.ref_params = args.iter().map(|p| p.by_ref).collect();
        self.ctxs.push(ctx);

        self.begin_block();
        for param in args {
            self.add_local(&param.name)?;
        }
        self.value_block(body)?;
        self.chunk().push_op(Op::Ret);

        let done = self.ctxs.pop().expect(CTX);
        let specs = done.upvals.clone();
        let proto = Value::Function(Rc::new(Closure::bare(Rc::new(done.into_desc()))));

        let lit = self.chunk().add_literal(proto)?;
        let ch = self.chunk();
        ch.push_op(Op::Closure);
        ch.push_u16(lit);
        ch.push_u16(specs.len() as u16);
        for spec in &specs {
            ch.push_u8(u8::from(spec.is_local));
            ch.push_u16(spec.index);
        }
        Ok(())
    }

    fn fn_def(
        &mut self,
        name: &str,
        args: &[Param],
        is_variadic: bool,
        body: &Node,
    ) -> Result<(), String> {
        self.function(name, args, is_variadic, body)?;
        if self.ctx().depth > 0 {
            self.add_local(name)
        } else {
            let lit = self.name_literal(name)?;
            let ch = self.chunk();
            ch.push_op(Op::GlobDef);
            ch.push_u16(lit);
            Ok(())
        }
    }

    fn call(&mut self, callee: &Node, args: &[Node]) -> Result<(), String> {
        self.node(callee)?;
        for arg in args {
            self.node(arg)?;
        }
        if args.len() > usize::from(u8::MAX) {
            return Err("Too many args in call".to_string());
        }
        let ch = self.chunk();
        ch.push_op(Op::Call);
        ch.push_u8(args.len() as u8);
        Ok(())
    }

    /// `receiver:field(args)`: look the method up, then re-push the
    /// receiver as argument 0.
    fn member_call(&mut self, receiver: &Node, field: &str, args: &[Node]) -> Result<(), String> {
        self.node(receiver)?;
        let lit = self.name_literal(field)?;
        let ch = self.chunk();
        ch.push_op(Op::PropGet);
        ch.push_u16(lit);

        self.node(receiver)?;
        for arg in args {
            self.node(arg)?;
        }
        if args.len() + 1 > usize::from(u8::MAX) {
            return Err("Too many args in call".to_string());
        }
        let ch = self.chunk();
        ch.push_op(Op::Call);
        ch.push_u8((args.len() + 1) as u8);
        Ok(())
    }

    fn object(&mut self, fields: &[(String, Node)]) -> Result<(), String> {
        self.chunk().push_op(Op::NewObj);
        for (key, value) in fields {
            // Methods get a synthetic name so disassembly stays readable.
            if let NodeKind::AnonFnDef { args, body, is_variadic } = &value.kind {
                let synthetic = format!("{key}@{:04}", self.synth);
                self.synth += 1;
                self.function(&synthetic, args, *is_variadic, body)?;
            } else {
                self.node(value)?;
            }
            let lit = self.name_literal(key)?;
            let ch = self.chunk();
            ch.push_op(Op::PropDef);
            ch.push_u16(lit);
        }
        Ok(())
    }

    fn array(&mut self, exprs: &[Node]) -> Result<(), String> {
        if exprs.len() > usize::from(u16::MAX) {
            return Err("Too many values in array".to_string());
        }
        for e in exprs {
            self.node(e)?;
        }
        let ch = self.chunk();
        ch.push_op(Op::Array);
        ch.push_u16(exprs.len() as u16);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Decorators
    // ------------------------------------------------------------------

    /// `@d(k=v) target` desugars to `d(target, [| k=v |])`; chains fold
    /// left to right, each wrapping the previous result. Decorated
    /// function definitions are bound back to the function's name.
    fn decorated(&mut self, decos: &[Node], target: &Node) -> Result<(), String> {
        match &target.kind {
            NodeKind::FnDef { name, args, body, is_variadic } => {
                let anon = Node::new(
                    NodeKind::AnonFnDef {
                        args: args.clone(),
                        body: body.clone(),
                        is_variadic: *is_variadic,
                    },
                    target.begin,
                    target.end,
                );
                let chain = deco_chain(decos, anon)?;
                let def = Node::new(
                    NodeKind::VarDef { name: name.clone(), value: Box::new(chain) },
                    target.begin,
                    target.end,
                );
                self.node(&def)
            }
            NodeKind::For { .. } | NodeKind::Ret(_) | NodeKind::Next | NodeKind::Break => {
                Err(format!("Can't decorate a {}", target.kind.tag()))
            }
            _ => {
                let chain = deco_chain(decos, target.clone())?;
                self.node(&chain)
            }
        }
    }
}

fn deco_chain(decos: &[Node], target: Node) -> Result<Node, String> {
    let mut wrapped = target;
    for deco in decos {
        let NodeKind::Deco { name, fields } = &deco.kind else {
            return Err("Malformed decorator".to_string());
        };
        let callee = Node::new(
            NodeKind::FieldGet { target: None, field: name.clone() },
            deco.begin,
            deco.end,
        );
        let mut args = vec![wrapped];
        if !fields.is_empty() {
            args.push(Node::new(NodeKind::Object(fields.clone()), deco.begin, deco.end));
        }
        wrapped = Node::new(
            NodeKind::Call { callee: Box::new(callee), args },
            deco.begin,
            deco.end,
        );
    }
    Ok(wrapped)
}

/// Does this statement leave a value on the stack when compiled?
fn leaves_value(n: &Node) -> bool {
    match &n.kind {
        NodeKind::VarDef { .. }
        | NodeKind::FnDef { .. }
        | NodeKind::For { .. }
        | NodeKind::Next
        | NodeKind::Break
        | NodeKind::Block(_) => false,
        NodeKind::Decorated { target, .. } => !matches!(target.kind, NodeKind::FnDef { .. }),
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::Lexer;
    use crate::parser::Parser;
    use ayu_core::disasm;

    fn compile(source: &str) -> Rc<Closure> {
        let toks = Lexer::from_source(source).lex().unwrap();
        let ast = Parser::new(toks).parse().unwrap();
        Compiler::script("test").compile(&ast).unwrap()
    }

    fn compile_err(source: &str) -> String {
        let toks = Lexer::from_source(source).lex().unwrap();
        let ast = Parser::new(toks).parse().unwrap();
        Compiler::script("test").compile(&ast).unwrap_err()
    }

    /// Decode a chunk's opcodes, skipping operands.
    fn ops(chunk: &Chunk) -> Vec<Op> {
        let mut sink = Vec::new();
        let mut decoded = Vec::new();
        let mut offset = 0;
        while offset < chunk.len() {
            decoded.push(chunk.read_op(offset).unwrap());
            offset = disasm::instruction(chunk, offset, &mut sink).unwrap();
        }
        decoded
    }

    #[test]
    fn arithmetic_uses_short_loads() {
        let script = compile("1 + 2 * 0");
        assert_eq!(
            ops(&script.desc.chunk),
            vec![Op::Ld1, Op::Lit8, Op::Ld0, Op::Mul, Op::Add, Op::Pop, Op::Ret]
        );
    }

    #[test]
    fn top_level_definition_is_global() {
        let script = compile("x := 5");
        assert_eq!(ops(&script.desc.chunk), vec![Op::Lit8, Op::GlobDef, Op::Ret]);
    }

    #[test]
    fn string_statement_is_popped() {
        let script = compile("\"hello\"");
        assert_eq!(ops(&script.desc.chunk), vec![Op::Lit8, Op::Pop, Op::Ret]);
    }

    #[test]
    fn function_locals_resolve_to_slots() {
        let script = compile("f : a b -> a + b");
        let Value::Function(inner) = &script.desc.chunk.literals[0] else {
            panic!("expected a function literal");
        };
        assert_eq!(inner.desc.arity, 2);
        assert_eq!(
            ops(&inner.desc.chunk),
            vec![Op::LocGet, Op::LocGet, Op::Add, Op::Ret]
        );
        // Params occupy slots 1 and 2; slot 0 is the closure.
        assert_eq!(inner.desc.chunk.read_u16(1), 1);
        assert_eq!(inner.desc.chunk.read_u16(4), 2);
    }

    #[test]
    fn closure_captures_are_counted() {
        let script = compile("outer : -> { c := 0\n : -> c }");
        let Value::Function(outer) = &script.desc.chunk.literals[0] else {
            panic!("expected outer function literal");
        };
        let inner = outer
            .desc
            .chunk
            .literals
            .iter()
            .find_map(|lit| match lit {
                Value::Function(f) => Some(f),
                _ => None,
            })
            .expect("inner function literal");
        assert_eq!(inner.desc.upval_count, 1);
        assert_eq!(ops(&inner.desc.chunk), vec![Op::UpvalGet, Op::Ret]);
    }

    #[test]
    fn captured_locals_close_on_scope_exit() {
        // The loop variable is captured by the closure defined inside the
        // body, so the loop's scope exit closes rather than pops it.
        let script = compile("fs := [0]\nfor i : 0..3 { fs[0] = : -> i }");
        assert!(ops(&script.desc.chunk).contains(&Op::UpvalClose));
    }

    #[test]
    fn if_chain_shape() {
        let script = compile("if true { 1 } elif false { 2 } else { 3 }");
        let decoded = ops(&script.desc.chunk);
        assert_eq!(decoded.iter().filter(|o| **o == Op::JmpFalsePop).count(), 2);
        assert_eq!(decoded.iter().filter(|o| **o == Op::Jmp).count(), 2);
    }

    #[test]
    fn if_without_else_pads_nil() {
        let script = compile("if true { 1 }");
        assert!(ops(&script.desc.chunk).contains(&Op::Nil));
    }

    #[test]
    fn for_loop_emits_backward_jump() {
        let script = compile("total := 0\nfor i : 1..5 { total = total + i }");
        let chunk = &script.desc.chunk;
        let decoded = ops(chunk);
        assert!(decoded.contains(&Op::JmpBackPop));
        // The trampoline jumps back to the start of the body.
        let mut offset = 0;
        let mut sink = Vec::new();
        while offset < chunk.len() {
            if chunk.read_op(offset).unwrap() == Op::JmpBackPop {
                let dist = usize::from(chunk.read_u16(offset + 1));
                assert!(offset + 3 - dist < offset, "backward jump goes backward");
            }
            offset = disasm::instruction(chunk, offset, &mut sink).unwrap();
        }
    }

    #[test]
    fn member_call_pushes_receiver_twice() {
        let script = compile("v := 0\nx := v:dist(1)");
        let decoded = ops(&script.desc.chunk);
        let globs = decoded.iter().filter(|o| **o == Op::GlobGet).count();
        assert_eq!(globs, 2, "receiver is read once for the method, once as arg 0");
        assert!(decoded.contains(&Op::PropGet));
        assert!(decoded.contains(&Op::Call));
    }

    #[test]
    fn duplicate_local_is_rejected() {
        let err = compile_err("f { x := 1\n x := 2 }");
        assert!(err.contains("already exists"), "got: {err}");
    }

    #[test]
    fn shadowing_in_inner_scope_is_allowed() {
        // Duplicate names are only rejected within one scope.
        compile("f { x := 1\n for i : 0..2 { x := 2\n x } }");
    }

    #[test]
    fn ret_at_top_level_is_rejected() {
        let err = compile_err("ret 1");
        assert!(err.contains("top level"), "got: {err}");
    }

    #[test]
    fn next_outside_loop_is_rejected() {
        let err = compile_err("next");
        assert!(err.contains("outside of a for loop"), "got: {err}");
    }

    #[test]
    fn break_outside_loop_is_rejected() {
        let err = compile_err("break");
        assert!(err.contains("outside of a for loop"), "got: {err}");
    }

    #[test]
    fn range_outside_for_is_rejected() {
        let err = compile_err("x := 1..5");
        assert!(err.contains("for-loop iterable"), "got: {err}");
    }

    #[test]
    fn for_over_non_range_is_rejected() {
        let err = compile_err("for i : [1, 2] { i }");
        assert!(err.contains("range"), "got: {err}");
    }

    #[test]
    fn chained_definition_is_rejected() {
        let err = compile_err("a := b := 1");
        assert!(err.contains("has no value"), "got: {err}");
    }

    #[test]
    fn splat_is_rejected_by_the_compiler() {
        let err = compile_err("(a*)");
        assert!(err.contains("Unknown unary operator"), "got: {err}");
    }

    #[test]
    fn decorated_function_binds_to_its_name() {
        let script = compile("deco : f -> f\n@deco\ng : x -> x");
        let decoded = ops(&script.desc.chunk);
        // The decorated definition compiles to deco(<closure>) bound to g.
        assert_eq!(decoded.iter().filter(|o| **o == Op::GlobDef).count(), 2);
        assert!(decoded.contains(&Op::Call));
        assert!(decoded.contains(&Op::Closure));
    }

    #[test]
    fn decorator_fields_become_an_object_argument() {
        let script = compile("deco : f opts -> f\n@deco(depth=2)\ng : x -> x");
        let decoded = ops(&script.desc.chunk);
        assert!(decoded.contains(&Op::NewObj));
        assert!(decoded.contains(&Op::PropDef));
    }

    #[test]
    fn object_methods_get_synthetic_names() {
        let script = compile("v := [| tick : -> 1 |]");
        let method = script
            .desc
            .chunk
            .literals
            .iter()
            .find_map(|lit| match lit {
                Value::Function(f) => Some(f),
                _ => None,
            })
            .expect("method literal");
        assert!(method.desc.chunk.name.as_str().starts_with("tick@"));
    }

    #[test]
    fn variadic_descriptor_records_rest_parameter() {
        let script = compile("f : a rest \\ -> rest");
        let Value::Function(inner) = &script.desc.chunk.literals[0] else {
            panic!("expected function literal");
        };
        assert_eq!(inner.desc.arity, 2);
        assert_eq!(inner.desc.variadic_start, Some(1));
    }

    #[test]
    fn by_ref_flags_recorded() {
        let script = compile("f : a* b -> b");
        let Value::Function(inner) = &script.desc.chunk.literals[0] else {
            panic!("expected function literal");
        };
        assert_eq!(inner.desc.ref_params, vec![true, false]);
    }

    #[test]
    fn too_many_call_args_is_rejected() {
        let mut source = String::from("f(");
        for i in 0..=256 {
            source.push_str(&format!("{i},"));
        }
        source.push(')');
        let err = compile_err(&source);
        assert!(err.contains("Too many args"), "got: {err}");
    }
}
