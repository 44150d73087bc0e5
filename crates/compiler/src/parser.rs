//! Recursive-descent parser: tokens to AST.
//!
//! Precedence climbs from `define` (loosest) down to `atom`; see the
//! chain starting at [`Parser::expr`]. Two places backtrack over a saved
//! cursor: `ret` (which takes an optional value expression), and `*` in
//! `mul`, which doubles as a postfix splat marker when no operand
//! follows. Everything else is a single token of lookahead.
//!
//! Failures carry the expected kind, the observed token, and the name of
//! the parser function that noticed.

use crate::ast::{Node, NodeKind, Param};
use crate::lexer::{Pos, TokKind, Token};

pub struct Parser {
    toks: Vec<Token>,
    idx: usize,
}

impl Parser {
    pub fn new(mut toks: Vec<Token>) -> Parser {
        // The lexer always terminates the stream; guard anyway so the
        // cursor accessors can't run off the end.
        if !matches!(toks.last(), Some(t) if t.kind == TokKind::Eof) {
            let at = toks.last().map(|t| t.end).unwrap_or_else(Pos::start);
            toks.push(Token { kind: TokKind::Eof, lexeme: String::new(), begin: at, end: at });
        }
        Parser { toks, idx: 0 }
    }

    fn tok(&self) -> &Token {
        &self.toks[self.idx.min(self.toks.len() - 1)]
    }

    fn peek(&self) -> &Token {
        &self.toks[(self.idx + 1).min(self.toks.len() - 1)]
    }

    fn kind(&self) -> TokKind {
        self.tok().kind
    }

    fn advance(&mut self) {
        if self.idx < self.toks.len() - 1 {
            self.idx += 1;
        }
    }

    fn save(&self) -> usize {
        self.idx
    }

    fn restore(&mut self, state: usize) {
        self.idx = state;
    }

    fn expect(&mut self, kind: TokKind, ctx: &'static str) -> Result<Token, String> {
        if self.kind() != kind {
            return Err(format!("Expected {kind}, got {} in {ctx}", self.tok()));
        }
        let tok = self.tok().clone();
        self.advance();
        Ok(tok)
    }

    /// Advance past `kind` if it is the current token; otherwise no-op.
    fn consume(&mut self, kind: TokKind) {
        if self.kind() == kind {
            self.advance();
        }
    }

    /// Parse the whole token stream as a top-level block.
    pub fn parse(&mut self) -> Result<Node, String> {
        let begin = self.tok().begin;
        let mut exprs = Vec::new();
        while self.kind() != TokKind::Eof {
            if self.kind() == TokKind::Semicolon {
                self.advance();
                continue;
            }
            exprs.push(self.statement()?);
        }
        let end = self.tok().end;
        Ok(Node::new(NodeKind::Block(exprs), begin, end))
    }

    fn statement(&mut self) -> Result<Node, String> {
        let decos = self.decorators()?;

        let stmt = if self.kind() == TokKind::Id
            && matches!(self.peek().kind, TokKind::Colon | TokKind::LCurly)
        {
            self.function()?
        } else {
            match self.kind() {
                TokKind::For => self.for_loop()?,
                TokKind::Ret => {
                    let tok = self.tok().clone();
                    self.advance();
                    let state = self.save();
                    match self.expr() {
                        Ok(value) => {
                            let end = value.end;
                            Node::new(NodeKind::Ret(Some(Box::new(value))), tok.begin, end)
                        }
                        Err(_) => {
                            self.restore(state);
                            Node::new(NodeKind::Ret(None), tok.begin, tok.end)
                        }
                    }
                }
                TokKind::Next => {
                    let tok = self.tok().clone();
                    self.advance();
                    Node::new(NodeKind::Next, tok.begin, tok.end)
                }
                TokKind::Break => {
                    let tok = self.tok().clone();
                    self.advance();
                    Node::new(NodeKind::Break, tok.begin, tok.end)
                }
                _ => self.expr()?,
            }
        };

        if decos.is_empty() {
            return Ok(stmt);
        }
        let begin = decos[0].begin;
        let end = stmt.end;
        Ok(Node::new(
            NodeKind::Decorated { decos, target: Box::new(stmt) },
            begin,
            end,
        ))
    }

    fn decorators(&mut self) -> Result<Vec<Node>, String> {
        let mut decos = Vec::new();
        while self.kind() == TokKind::At {
            let begin = self.tok().begin;
            self.advance();
            let name = self.expect(TokKind::Id, "decorators")?;
            let mut fields = Vec::new();
            if self.kind() == TokKind::LParen {
                self.advance();
                while self.kind() == TokKind::Id {
                    let field = self.expect(TokKind::Id, "decorators")?;
                    self.expect(TokKind::Assign, "decorators")?;
                    let value = self.expr()?;
                    fields.push((field.lexeme, value));
                    self.consume(TokKind::Comma);
                }
                self.expect(TokKind::RParen, "decorators")?;
            }
            let end = name.end;
            decos.push(Node::new(
                NodeKind::Deco { name: name.lexeme, fields },
                begin,
                end,
            ));
        }
        Ok(decos)
    }

    /// `name : a b* c \ -> expr`, `name : a { block }`, `name { block }`,
    /// or the anonymous `: a -> expr` form. A `*` after a parameter marks
    /// it by-reference; `\` after the final parameter marks the function
    /// variadic.
    fn function(&mut self) -> Result<Node, String> {
        let begin = self.tok().begin;
        let name = if self.kind() == TokKind::Id {
            self.expect(TokKind::Id, "function")?.lexeme
        } else {
            String::new()
        };

        let mut args = Vec::new();
        let mut is_variadic = false;
        if self.kind() == TokKind::Colon {
            self.advance();
            while self.kind() == TokKind::Id {
                let arg = self.expect(TokKind::Id, "function")?;
                let mut by_ref = false;
                if self.kind() == TokKind::Mul {
                    by_ref = true;
                    self.advance();
                }
                args.push(Param { name: arg.lexeme, by_ref });
                if self.kind() == TokKind::Backslash {
                    is_variadic = true;
                    self.advance();
                    break;
                }
            }
            if is_variadic && self.kind() == TokKind::Id {
                return Err(format!(
                    "Variadic marker must follow the last parameter, got {} in function",
                    self.tok()
                ));
            }
        }

        let body = if self.kind() == TokKind::RArrow {
            self.advance();
            if self.kind() == TokKind::LCurly {
                self.block()?
            } else {
                self.expr()?
            }
        } else if self.kind() == TokKind::LCurly {
            self.block()?
        } else {
            return Err(format!("Expected -> or {{, got {} in function", self.tok()));
        };
        let end = body.end;

        if name.is_empty() {
            Ok(Node::new(
                NodeKind::AnonFnDef { args, body: Box::new(body), is_variadic },
                begin,
                end,
            ))
        } else {
            Ok(Node::new(
                NodeKind::FnDef { name, args, body: Box::new(body), is_variadic },
                begin,
                end,
            ))
        }
    }

    fn block(&mut self) -> Result<Node, String> {
        let begin = self.tok().begin;
        self.expect(TokKind::LCurly, "block")?;
        let mut exprs = Vec::new();
        while self.kind() != TokKind::RCurly {
            if self.kind() == TokKind::Eof {
                return Err(format!("Unterminated block starting at {begin}"));
            }
            if self.kind() == TokKind::Semicolon {
                self.advance();
                continue;
            }
            exprs.push(self.statement()?);
        }
        let end = self.tok().end;
        self.advance();
        Ok(Node::new(NodeKind::Block(exprs), begin, end))
    }

    fn for_loop(&mut self) -> Result<Node, String> {
        let begin = self.tok().begin;
        self.expect(TokKind::For, "for_loop")?;
        let var = self.expect(TokKind::Id, "for_loop")?;
        self.expect(TokKind::Colon, "for_loop")?;
        let iterable = self.expr()?;
        let body = self.block()?;
        let end = body.end;
        Ok(Node::new(
            NodeKind::For {
                var: var.lexeme,
                iterable: Box::new(iterable),
                body: Box::new(body),
            },
            begin,
            end,
        ))
    }

    pub fn expr(&mut self) -> Result<Node, String> {
        self.define()
    }

    fn define(&mut self) -> Result<Node, String> {
        let lhs = self.assign()?;
        if self.kind() != TokKind::Walrus {
            return Ok(lhs);
        }
        self.advance();
        let rhs = self.define()?;
        let (begin, end) = (lhs.begin, rhs.end);
        match lhs.kind {
            NodeKind::FieldGet { target: None, field } => Ok(Node::new(
                NodeKind::VarDef { name: field, value: Box::new(rhs) },
                begin,
                end,
            )),
            _ => Err(format!("Invalid left-hand side of ':=' at {begin} in define")),
        }
    }

    fn assign(&mut self) -> Result<Node, String> {
        let mut lhs = self.sym_or()?;
        while matches!(
            self.kind(),
            TokKind::Assign
                | TokKind::AddAssign
                | TokKind::SubAssign
                | TokKind::MulAssign
                | TokKind::DivAssign
                | TokKind::ModAssign
        ) {
            if !is_assign_target(&lhs.kind) {
                return Err(format!(
                    "Invalid left-hand side of assignment at {} in assign",
                    lhs.begin
                ));
            }
            let op = self.kind();
            self.advance();
            let rhs = self.sym_or()?;
            lhs = binary(op, lhs, rhs);
        }
        Ok(lhs)
    }

    fn sym_or(&mut self) -> Result<Node, String> {
        let mut lhs = self.sym_and()?;
        while self.kind() == TokKind::Or {
            self.advance();
            let rhs = self.sym_and()?;
            lhs = binary(TokKind::Or, lhs, rhs);
        }
        Ok(lhs)
    }

    fn sym_and(&mut self) -> Result<Node, String> {
        let mut lhs = self.comp()?;
        while self.kind() == TokKind::And {
            self.advance();
            let rhs = self.comp()?;
            lhs = binary(TokKind::And, lhs, rhs);
        }
        Ok(lhs)
    }

    fn comp(&mut self) -> Result<Node, String> {
        let mut lhs = self.additive()?;
        while matches!(
            self.kind(),
            TokKind::Eq | TokKind::Neq | TokKind::Lt | TokKind::Le | TokKind::Gt | TokKind::Ge
        ) {
            let op = self.kind();
            self.advance();
            let rhs = self.additive()?;
            lhs = binary(op, lhs, rhs);
        }
        Ok(lhs)
    }

    fn additive(&mut self) -> Result<Node, String> {
        let mut lhs = self.mul()?;
        while matches!(self.kind(), TokKind::Add | TokKind::Sub) {
            let op = self.kind();
            self.advance();
            let rhs = self.mul()?;
            lhs = binary(op, lhs, rhs);
        }
        Ok(lhs)
    }

    fn mul(&mut self) -> Result<Node, String> {
        let mut lhs = self.range_expr()?;
        while matches!(self.kind(), TokKind::Mul | TokKind::Div | TokKind::Mod) {
            let op = self.kind();
            self.advance();
            if op == TokKind::Mul {
                // `*` is also the postfix splat marker; if nothing parses
                // as an operand, reinterpret it that way, keeping the
                // left-associative shape.
                let state = self.save();
                match self.range_expr() {
                    Ok(rhs) => lhs = binary(op, lhs, rhs),
                    Err(_) => {
                        self.restore(state);
                        lhs = splat(lhs);
                    }
                }
            } else {
                let rhs = self.range_expr()?;
                lhs = binary(op, lhs, rhs);
            }
        }
        Ok(lhs)
    }

    fn range_expr(&mut self) -> Result<Node, String> {
        let lhs = self.with_expr()?;
        if self.kind() != TokKind::Range {
            return Ok(lhs);
        }
        self.advance();
        let rhs = self.with_expr()?;
        let (begin, end) = (lhs.begin, rhs.end);
        Ok(Node::new(
            NodeKind::Range { start: Box::new(lhs), finish: Box::new(rhs) },
            begin,
            end,
        ))
    }

    fn with_expr(&mut self) -> Result<Node, String> {
        let lhs = self.pre_unary()?;
        if self.kind() != TokKind::With {
            return Ok(lhs);
        }
        self.advance();
        let rhs = self.pre_unary()?;
        if !matches!(rhs.kind, NodeKind::Object(_)) {
            return Err("Expected object on rhs of with expr".to_string());
        }
        Ok(binary(TokKind::With, lhs, rhs))
    }

    fn pre_unary(&mut self) -> Result<Node, String> {
        let begin = self.tok().begin;
        if matches!(self.kind(), TokKind::Exclaim | TokKind::Add | TokKind::Sub) {
            let op = self.kind();
            self.advance();
            let target = self.post_unary()?;
            let end = target.end;
            return Ok(Node::new(
                NodeKind::UnOp { op, target: Box::new(target) },
                begin,
                end,
            ));
        }
        self.post_unary()
    }

    fn post_unary(&mut self) -> Result<Node, String> {
        let target = self.call_expr()?;
        if matches!(self.kind(), TokKind::Inc | TokKind::Dec) {
            let op = self.kind();
            let end = self.tok().end;
            self.advance();
            let begin = target.begin;
            return Ok(Node::new(
                NodeKind::UnOp { op, target: Box::new(target) },
                begin,
                end,
            ));
        }
        Ok(target)
    }

    fn call_expr(&mut self) -> Result<Node, String> {
        let mut body = self.atom()?;
        loop {
            match self.kind() {
                TokKind::LParen => {
                    self.advance();
                    let args = self.call_args()?;
                    let (begin, end) = (body.begin, self.tok().begin);
                    body = Node::new(
                        NodeKind::Call { callee: Box::new(body), args },
                        begin,
                        end,
                    );
                }
                TokKind::Dot => {
                    self.advance();
                    let field = self.expect(TokKind::Id, "call")?;
                    let (begin, end) = (body.begin, field.end);
                    body = Node::new(
                        NodeKind::FieldGet { target: Some(Box::new(body)), field: field.lexeme },
                        begin,
                        end,
                    );
                }
                TokKind::LSquare => {
                    self.advance();
                    let index = self.expr()?;
                    let close = self.expect(TokKind::RSquare, "call")?;
                    let (begin, end) = (body.begin, close.end);
                    body = Node::new(
                        NodeKind::BinOp {
                            op: TokKind::LSquare,
                            lhs: Box::new(body),
                            rhs: Box::new(index),
                        },
                        begin,
                        end,
                    );
                }
                TokKind::Colon => {
                    // Member call needs `: id (`; anything else leaves the
                    // colon for an enclosing rule.
                    let state = self.save();
                    self.advance();
                    if self.kind() != TokKind::Id {
                        self.restore(state);
                        break;
                    }
                    let field = self.expect(TokKind::Id, "call")?;
                    if self.kind() != TokKind::LParen {
                        self.restore(state);
                        break;
                    }
                    self.advance();
                    let args = self.call_args()?;
                    let (begin, end) = (body.begin, self.tok().begin);
                    body = Node::new(
                        NodeKind::MemberCall {
                            receiver: Box::new(body),
                            field: field.lexeme,
                            args,
                        },
                        begin,
                        end,
                    );
                }
                _ => break,
            }
        }
        Ok(body)
    }

    /// Arguments up to and including the closing `)`.
    fn call_args(&mut self) -> Result<Vec<Node>, String> {
        let mut args = Vec::new();
        while self.kind() != TokKind::RParen {
            if self.kind() == TokKind::Eof {
                return Err("Unterminated argument list in call".to_string());
            }
            args.push(self.expr()?);
            self.consume(TokKind::Comma);
        }
        self.advance();
        Ok(args)
    }

    fn atom(&mut self) -> Result<Node, String> {
        let begin = self.tok().begin;
        match self.kind() {
            TokKind::LParen => {
                self.advance();
                let inner = self.expr()?;
                self.expect(TokKind::RParen, "atom")?;
                Ok(inner)
            }
            TokKind::Number => {
                let tok = self.tok().clone();
                self.advance();
                let value: f64 = tok
                    .lexeme
                    .parse()
                    .map_err(|e| format!("Bad number literal '{}' at {}: {e}", tok.lexeme, tok.begin))?;
                Ok(Node::new(NodeKind::Number(value), tok.begin, tok.end))
            }
            TokKind::Str => {
                let tok = self.tok().clone();
                self.advance();
                Ok(Node::new(NodeKind::Str(tok.lexeme), tok.begin, tok.end))
            }
            TokKind::If => self.if_expr(),
            TokKind::Colon => self.function(),
            TokKind::Id => {
                let tok = self.tok().clone();
                self.advance();
                Ok(Node::new(
                    NodeKind::FieldGet { target: None, field: tok.lexeme },
                    tok.begin,
                    tok.end,
                ))
            }
            TokKind::LObject => self.object(),
            TokKind::LSquare => self.array(),
            TokKind::True => {
                self.advance();
                Ok(Node::new(NodeKind::True, begin, self.tok().begin))
            }
            TokKind::False => {
                self.advance();
                Ok(Node::new(NodeKind::False, begin, self.tok().begin))
            }
            TokKind::Nil => {
                self.advance();
                Ok(Node::new(NodeKind::Nil, begin, self.tok().begin))
            }
            _ => Err(format!("Expected atom, got {} in atom", self.tok())),
        }
    }

    fn if_expr(&mut self) -> Result<Node, String> {
        let begin = self.tok().begin;
        self.expect(TokKind::If, "if_expr")?;
        let mut cases = Vec::new();
        let cond = self.expr()?;
        let body = self.block()?;
        cases.push((cond, body));
        while self.kind() == TokKind::Elif {
            self.advance();
            let cond = self.expr()?;
            let body = self.block()?;
            cases.push((cond, body));
        }
        let else_body = if self.kind() == TokKind::Else {
            self.advance();
            Some(Box::new(self.block()?))
        } else {
            None
        };
        let end = self.tok().begin;
        Ok(Node::new(NodeKind::If { cases, else_body }, begin, end))
    }

    /// `[| name = expr, name : args -> expr, "sym" = expr |]`
    ///
    /// Field names are identifier or string tokens; a `:` after the name
    /// begins a method (function literal) instead of `= expr`.
    fn object(&mut self) -> Result<Node, String> {
        let begin = self.tok().begin;
        self.expect(TokKind::LObject, "object")?;
        let mut fields = Vec::new();
        while matches!(self.kind(), TokKind::Id | TokKind::Str) {
            let key = self.tok().clone();
            self.advance();
            let value = if self.kind() == TokKind::Colon {
                self.function()?
            } else {
                self.expect(TokKind::Assign, "object")?;
                self.expr()?
            };
            fields.push((key.lexeme, value));
            self.consume(TokKind::Comma);
        }
        let close = self.expect(TokKind::RObject, "object")?;
        Ok(Node::new(NodeKind::Object(fields), begin, close.end))
    }

    /// `[a, b, c]` or `[size; value]`.
    fn array(&mut self) -> Result<Node, String> {
        let begin = self.tok().begin;
        self.expect(TokKind::LSquare, "array")?;
        if self.kind() == TokKind::RSquare {
            let close = self.tok().clone();
            self.advance();
            return Ok(Node::new(NodeKind::Array(Vec::new()), begin, close.end));
        }

        let first = self.expr()?;
        if self.kind() == TokKind::Semicolon {
            self.advance();
            let value = self.expr()?;
            let close = self.expect(TokKind::RSquare, "array")?;
            return Ok(Node::new(
                NodeKind::SizedArray { size: Box::new(first), value: Box::new(value) },
                begin,
                close.end,
            ));
        }

        let mut exprs = vec![first];
        while self.kind() == TokKind::Comma {
            self.advance();
            if self.kind() == TokKind::RSquare {
                break;
            }
            exprs.push(self.expr()?);
        }
        let close = self.expect(TokKind::RSquare, "array")?;
        Ok(Node::new(NodeKind::Array(exprs), begin, close.end))
    }
}

fn is_assign_target(kind: &NodeKind) -> bool {
    matches!(
        kind,
        NodeKind::FieldGet { .. } | NodeKind::BinOp { op: TokKind::LSquare, .. }
    )
}

fn binary(op: TokKind, lhs: Node, rhs: Node) -> Node {
    let (begin, end) = (lhs.begin, rhs.end);
    Node::new(
        NodeKind::BinOp { op, lhs: Box::new(lhs), rhs: Box::new(rhs) },
        begin,
        end,
    )
}

/// Reinterpret a dangling `*` as a postfix unary on the rightmost
/// operand, preserving the left-associative tree shape.
fn splat(lhs: Node) -> Node {
    let (begin, end) = (lhs.begin, lhs.end);
    match lhs.kind {
        NodeKind::BinOp { op, lhs: bl, rhs: br } => {
            let (rb, re) = (br.begin, br.end);
            let wrapped = Node::new(NodeKind::UnOp { op: TokKind::Mul, target: br }, rb, re);
            Node::new(
                NodeKind::BinOp { op, lhs: bl, rhs: Box::new(wrapped) },
                begin,
                end,
            )
        }
        kind => {
            let inner = Node::new(kind, begin, end);
            Node::new(
                NodeKind::UnOp { op: TokKind::Mul, target: Box::new(inner) },
                begin,
                end,
            )
        }
    }
}
