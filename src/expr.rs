//! Expression evaluator
//!
//! A shunting-yard parser over the line cursor, using an operand stack and
//! an operator stack with a sentinel at the base of every (sub)expression.
//! The same parse drives both modes: while interpreting, popping an
//! operator applies it to popped operand values; while compiling, popping
//! an operator emits the matching VM opcode and operand values ride the
//! target's evaluation stack instead.
//!
//! `^` appears in three roles: prefix it is the byte dereference, infix it
//! is power.  Infix xor is spelled `!` (prefix `!` is logical not).

use std::io::Write;

use crate::bytecode::{shl, shr, Op};
use crate::engine::{load_op, target_addr, CallFrame, Engine, Frame, Mode};
use crate::error::Error;
use crate::lexer::{is_alpha, is_digit, Cursor, ShortName};
use crate::vars::{Location, VarType};

/// Depth of the operand and operator stacks.
pub(crate) const STACK_SIZE: usize = 16;

/// Expression operator tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OpTok {
    // binary
    Pow,
    Div,
    Mod,
    Mul,
    Add,
    Sub,
    Gt,
    Lt,
    BitAnd,
    BitOr,
    BitXor,
    Eql,
    Neql,
    Gte,
    Lte,
    And,
    Or,
    Lsh,
    Rsh,
    // unary
    Neg,
    Pos,
    Not,
    BitNot,
    DerefWord,
    DerefByte,
    /// Marks the base of a (sub)expression on the operator stack.
    Sentinel,
}

impl OpTok {
    pub(crate) fn is_unary(self) -> bool {
        matches!(
            self,
            OpTok::Neg | OpTok::Pos | OpTok::Not | OpTok::BitNot | OpTok::DerefWord | OpTok::DerefByte
        )
    }

    /// Higher binds tighter.  The sentinel must be lowest.
    pub(crate) fn precedence(self) -> u8 {
        match self {
            OpTok::Neg | OpTok::Pos | OpTok::Not | OpTok::BitNot | OpTok::DerefWord
            | OpTok::DerefByte => 11,
            OpTok::Pow | OpTok::Div | OpTok::Mul | OpTok::Mod => 10,
            OpTok::Add | OpTok::Sub => 9,
            OpTok::Lsh | OpTok::Rsh => 8,
            OpTok::Gt | OpTok::Gte | OpTok::Lt | OpTok::Lte => 7,
            OpTok::Eql | OpTok::Neql => 6,
            OpTok::BitAnd => 5,
            OpTok::BitXor => 4,
            OpTok::BitOr => 3,
            OpTok::And => 2,
            OpTok::Or => 1,
            OpTok::Sentinel => 0,
        }
    }
}

/// Recognize a binary operator at the cursor without consuming it.
/// Two-character operators are tried first.
fn scan_binary(cursor: &Cursor) -> Option<(OpTok, usize)> {
    let c0 = cursor.peek()?;
    if let Some(c1) = cursor.peek_at(1) {
        let two = match (c0, c1) {
            (b'=', b'=') => Some(OpTok::Eql),
            (b'!', b'=') => Some(OpTok::Neql),
            (b'>', b'=') => Some(OpTok::Gte),
            (b'<', b'=') => Some(OpTok::Lte),
            (b'&', b'&') => Some(OpTok::And),
            (b'|', b'|') => Some(OpTok::Or),
            (b'<', b'<') => Some(OpTok::Lsh),
            (b'>', b'>') => Some(OpTok::Rsh),
            _ => None,
        };
        if let Some(op) = two {
            return Some((op, 2));
        }
    }
    let one = match c0 {
        b'^' => OpTok::Pow,
        b'/' => OpTok::Div,
        b'%' => OpTok::Mod,
        b'*' => OpTok::Mul,
        b'+' => OpTok::Add,
        b'-' => OpTok::Sub,
        b'>' => OpTok::Gt,
        b'<' => OpTok::Lt,
        b'&' => OpTok::BitAnd,
        b'|' => OpTok::BitOr,
        b'!' => OpTok::BitXor,
        _ => return None,
    };
    Some((one, 1))
}

fn scan_unary(c: u8) -> Option<OpTok> {
    match c {
        b'-' => Some(OpTok::Neg),
        b'+' => Some(OpTok::Pos),
        b'!' => Some(OpTok::Not),
        b'~' => Some(OpTok::BitNot),
        b'*' => Some(OpTok::DerefWord),
        b'^' => Some(OpTok::DerefByte),
        _ => None,
    }
}

/// x^y with 16-bit wraparound; an exponent of zero yields 1.
fn pow16(base: u16, exp: u16) -> u16 {
    let mut r: u16 = 1;
    for _ in 0..exp {
        r = r.wrapping_mul(base);
    }
    r
}

impl<W: Write> Engine<W> {
    /// Evaluate the expression at the cursor.  With `check_no_more`, the
    /// statement must end here (`;` or end of line).
    pub(crate) fn eval(&mut self, check_no_more: bool) -> Result<u16, Error> {
        self.cursor.eat_space();
        if self.cursor.at_end() {
            return Err(Error::Expr);
        }
        self.expr()?;
        if check_no_more && !self.cursor.at_end() && self.cursor.peek() != Some(b';') {
            return Err(Error::Extra(self.cursor.rest().to_string()));
        }
        self.pop_operand()
    }

    /// E: predicate (binary-op predicate)*, then reduce to the sentinel.
    pub(crate) fn expr(&mut self) -> Result<(), Error> {
        self.predicate()?;
        while let Some((op, len)) = scan_binary(&self.cursor) {
            self.push_operator(op)?;
            self.cursor.advance(len);
            self.predicate()?;
        }
        while self.operators.last() != Some(&OpTok::Sentinel) {
            self.pop_operator()?;
        }
        Ok(())
    }

    /// P: one operand — variable (subscripted, or a call), literal,
    /// parenthesized subexpression, or unary-prefixed predicate.
    pub(crate) fn predicate(&mut self) -> Result<(), Error> {
        self.cursor.eat_space();
        let Some(c) = self.cursor.peek() else {
            return Err(Error::Syntax);
        };
        if c == b'&' || is_alpha(c) {
            let address = c == b'&';
            if address {
                self.cursor.bump();
                if !self.cursor.peek().is_some_and(is_alpha) {
                    return Err(Error::Var);
                }
            }
            let (key, full) = self.cursor.scan_ident();
            let mut idx = None;
            if self.cursor.peek() == Some(b'[') {
                idx = Some(self.subscript()?);
            } else if self.cursor.peek() == Some(b'(') {
                // No taking the address of functions.
                if address {
                    return Err(Error::Var);
                }
                self.call_in_expression(&full)?;
                self.cursor.eat_space();
                return Ok(());
            }
            self.get_var(&key, idx, address)?;
            self.cursor.eat_space();
            Ok(())
        } else if is_digit(c) {
            let v = self.cursor.parse_int()?;
            self.push_operand(v)?;
            self.cursor.eat_space();
            Ok(())
        } else if c == b'$' {
            self.cursor.bump();
            let v = self.cursor.parse_hex()?;
            self.push_operand(v)?;
            self.cursor.eat_space();
            Ok(())
        } else if c == b'(' {
            self.cursor.bump();
            self.push_operator_raw(OpTok::Sentinel)?;
            self.expr()?;
            self.cursor.expect(b')')?;
            self.pop_operator_raw();
            Ok(())
        } else if let Some(op) = scan_unary(c) {
            self.push_operator_raw(op)?;
            self.cursor.bump();
            self.predicate()
        } else {
            Err(Error::Extra(self.cursor.rest().to_string()))
        }
    }

    /// Parse `[expr]` as its own subexpression.
    pub(crate) fn subscript(&mut self) -> Result<u16, Error> {
        self.push_operator_raw(OpTok::Sentinel)?;
        self.cursor.expect(b'[')?;
        let idx = self.eval(false)?;
        self.cursor.expect(b']')?;
        self.pop_operator_raw();
        Ok(idx)
    }

    /// A subroutine invoked as a function inside an expression.  While
    /// interpreting, the sub runs to its `return` and the return register
    /// becomes the predicate's value; while compiling, the emitted call
    /// leaves the value on the VM stack.
    fn call_in_expression(&mut self, name: &str) -> Result<(), Error> {
        match self.mode {
            Mode::Compile => self.docall(name),
            Mode::Interpret => {
                // Keep the enclosing expression's pending operators out of
                // reach while the sub body evaluates its own expressions.
                self.push_operator_raw(OpTok::Sentinel)?;
                self.flow_push(Frame::Call(CallFrame::Expr))?;
                if let Err(e) = self.docall(name) {
                    if matches!(self.flow.last(), Some(Frame::Call(CallFrame::Expr))) {
                        self.flow.pop();
                    }
                    return Err(e);
                }
                self.run(true)?;
                match self.flow.pop() {
                    Some(Frame::Call(CallFrame::Expr)) => {}
                    _ => return Err(Error::Stack),
                }
                self.pop_operator_raw();
                let r = self.ret_register;
                self.push_operand(r)?;
                Ok(())
            }
        }
    }

    /// Load a variable's value (or address) as a predicate.
    pub(crate) fn get_var(
        &mut self,
        key: &ShortName,
        idx: Option<u16>,
        address: bool,
    ) -> Result<(), Error> {
        let (i, _) = self.vars.find(key, false).ok_or(Error::Var)?;
        let ent = self.vars.ents[i];
        if ent.dims == 0 {
            if idx.is_some() {
                return Err(Error::Subscript);
            }
            match self.mode {
                Mode::Compile => {
                    let (addr, rel) = target_addr(&ent)?;
                    self.gen.emit_ldi(addr);
                    if address {
                        if rel {
                            self.gen.emit(Op::Rtoa);
                        }
                    } else {
                        self.gen.emit(load_op(rel, ent.ty));
                    }
                }
                Mode::Interpret => {
                    let Location::Arena(off) = ent.loc else {
                        return Err(Error::Var);
                    };
                    let v = if address {
                        off
                    } else {
                        match ent.ty {
                            VarType::Word => self.vars.arena.peek_word(off),
                            VarType::Byte => self.vars.arena.peek_byte(off) as u16,
                        }
                    };
                    self.push_operand(v)?;
                }
            }
        } else {
            // Arrays.  Special case: &A is &A[0].
            let idx = match idx {
                Some(v) => v,
                None => {
                    if !address {
                        return Err(Error::Subscript);
                    }
                    if self.mode == Mode::Compile {
                        self.gen.emit_ldi(0);
                    }
                    0
                }
            };
            match self.mode {
                Mode::Compile => {
                    // The index is on the VM stack; scale and add the base.
                    if ent.ty == VarType::Word {
                        self.gen.emit_ldi(2);
                        self.gen.emit(Op::Mul);
                    }
                    match ent.loc {
                        Location::TargetAbs(base) => {
                            self.gen.emit_ldi(base);
                            self.gen.emit(Op::Add);
                            if !address {
                                self.gen.emit(load_op(false, ent.ty));
                            }
                        }
                        Location::TargetRel(base) => {
                            self.gen.emit_ldi(base as u16);
                            self.gen.emit(Op::Add);
                            if address {
                                self.gen.emit(Op::Rtoa);
                            } else {
                                self.gen.emit(load_op(true, ent.ty));
                            }
                        }
                        Location::TargetRefSlot(slot) => {
                            self.gen.emit_ldi(slot as u16);
                            self.gen.emit(Op::LdrWord);
                            self.gen.emit(Op::Add);
                            if !address {
                                self.gen.emit(load_op(false, ent.ty));
                            }
                        }
                        Location::Arena(_) => return Err(Error::Var),
                    }
                }
                Mode::Interpret => {
                    if idx >= ent.size {
                        return Err(Error::Subscript);
                    }
                    let Location::Arena(body) = ent.loc else {
                        return Err(Error::Var);
                    };
                    let off = body.wrapping_add(idx * ent.ty.size());
                    let v = if address {
                        off
                    } else {
                        match ent.ty {
                            VarType::Word => self.vars.arena.peek_word(off),
                            VarType::Byte => self.vars.arena.peek_byte(off) as u16,
                        }
                    };
                    self.push_operand(v)?;
                }
            }
        }
        Ok(())
    }

    /// Push a binary operator, reducing anything of equal or higher
    /// precedence first.
    pub(crate) fn push_operator(&mut self, op: OpTok) -> Result<(), Error> {
        loop {
            let top = self.operators.last().copied().unwrap_or(OpTok::Sentinel);
            if top.precedence() >= op.precedence() {
                self.pop_operator()?;
            } else {
                break;
            }
        }
        self.push_operator_raw(op)
    }

    /// Pop one operator and apply it (interpret) or emit it (compile).
    fn pop_operator(&mut self) -> Result<(), Error> {
        let tok = match self.operators.pop() {
            None | Some(OpTok::Sentinel) => return Err(Error::Expr),
            Some(t) => t,
        };
        let x = self.pop_operand()?;
        if tok.is_unary() {
            match self.mode {
                Mode::Compile => match tok {
                    OpTok::Neg => self.gen.emit(Op::Neg),
                    OpTok::Pos => {}
                    OpTok::Not => self.gen.emit(Op::Not),
                    OpTok::BitNot => self.gen.emit(Op::BitNot),
                    OpTok::DerefWord => self.gen.emit(Op::LdaWord),
                    OpTok::DerefByte => self.gen.emit(Op::LdaByte),
                    _ => unreachable!(),
                },
                Mode::Interpret => {
                    let r = match tok {
                        OpTok::Neg => x.wrapping_neg(),
                        OpTok::Pos => x,
                        OpTok::Not => (x == 0) as u16,
                        OpTok::BitNot => !x,
                        OpTok::DerefWord => self.vars.arena.peek_word(x),
                        OpTok::DerefByte => self.vars.arena.peek_byte(x) as u16,
                        _ => unreachable!(),
                    };
                    self.push_operand(r)?;
                }
            }
            return Ok(());
        }
        let y = self.pop_operand()?;
        match self.mode {
            Mode::Compile => match tok {
                OpTok::Pow => self.emit_pow(),
                OpTok::Div => self.gen.emit(Op::Div),
                OpTok::Mod => self.gen.emit(Op::Mod),
                OpTok::Mul => self.gen.emit(Op::Mul),
                OpTok::Add => self.gen.emit(Op::Add),
                OpTok::Sub => self.gen.emit(Op::Sub),
                OpTok::Gt => self.gen.emit(Op::Gt),
                OpTok::Gte => self.gen.emit(Op::Gte),
                OpTok::Lt => self.gen.emit(Op::Lt),
                OpTok::Lte => self.gen.emit(Op::Lte),
                OpTok::Eql => self.gen.emit(Op::Eql),
                OpTok::Neql => self.gen.emit(Op::Neql),
                OpTok::And => self.gen.emit(Op::And),
                OpTok::Or => self.gen.emit(Op::Or),
                OpTok::BitAnd => self.gen.emit(Op::BitAnd),
                OpTok::BitOr => self.gen.emit(Op::BitOr),
                OpTok::BitXor => self.gen.emit(Op::BitXor),
                OpTok::Lsh => self.gen.emit(Op::Lsh),
                OpTok::Rsh => self.gen.emit(Op::Rsh),
                _ => unreachable!(),
            },
            Mode::Interpret => {
                let r = match tok {
                    OpTok::Pow => pow16(y, x),
                    OpTok::Div => {
                        if x == 0 {
                            return Err(Error::DivZero);
                        }
                        y / x
                    }
                    OpTok::Mod => {
                        if x == 0 {
                            return Err(Error::DivZero);
                        }
                        y % x
                    }
                    OpTok::Mul => y.wrapping_mul(x),
                    OpTok::Add => y.wrapping_add(x),
                    OpTok::Sub => y.wrapping_sub(x),
                    OpTok::Gt => (y > x) as u16,
                    OpTok::Gte => (y >= x) as u16,
                    OpTok::Lt => (y < x) as u16,
                    OpTok::Lte => (y <= x) as u16,
                    OpTok::Eql => (y == x) as u16,
                    OpTok::Neql => (y != x) as u16,
                    OpTok::And => (y != 0 && x != 0) as u16,
                    OpTok::Or => (y != 0 || x != 0) as u16,
                    OpTok::BitAnd => y & x,
                    OpTok::BitOr => y | x,
                    OpTok::BitXor => y ^ x,
                    OpTok::Lsh => shl(y, x),
                    OpTok::Rsh => shr(y, x),
                    _ => unreachable!(),
                };
                self.push_operand(r)?;
            }
        }
        Ok(())
    }

    /// The VM has no power opcode; emit an inline multiply loop over
    /// [base, exp] that leaves the result alone on the stack.
    fn emit_pow(&mut self) {
        self.gen.emit_ldi(1); // [b, e, r]
        let top = self.gen.pc;
        let exit = top + 18;
        self.gen.emit(Op::Over); // [b, e, r, e]
        self.gen.emit(Op::Not);
        self.gen.emit_ldi(exit);
        self.gen.emit(Op::Brnch); // exit when e == 0
        self.gen.emit_ldi(3);
        self.gen.emit(Op::Pick); // [b, e, r, b]
        self.gen.emit(Op::Mul); // [b, e, r*b]
        self.gen.emit(Op::Swap);
        self.gen.emit(Op::Dec);
        self.gen.emit(Op::Swap); // [b, e-1, r*b]
        self.gen.emit_ldi(top);
        self.gen.emit(Op::Jmp);
        // exit: [b, 0, r] -> [r]
        self.gen.emit(Op::Swap);
        self.gen.emit(Op::Drop);
        self.gen.emit(Op::Swap);
        self.gen.emit(Op::Drop);
    }

    /// Push a value (interpret) or emit a load-immediate (compile).
    pub(crate) fn push_operand(&mut self, v: u16) -> Result<(), Error> {
        if self.mode == Mode::Compile {
            self.gen.emit_ldi(v);
            return Ok(());
        }
        if self.operands.len() >= STACK_SIZE {
            return Err(Error::Complex);
        }
        self.operands.push(v);
        Ok(())
    }

    /// Pop a value; in compile mode values are stand-ins for what the VM
    /// stack will hold.
    pub(crate) fn pop_operand(&mut self) -> Result<u16, Error> {
        if self.mode == Mode::Compile {
            return Ok(0);
        }
        self.operands.pop().ok_or(Error::Expr)
    }

    pub(crate) fn push_operator_raw(&mut self, op: OpTok) -> Result<(), Error> {
        if self.operators.len() >= STACK_SIZE {
            return Err(Error::Complex);
        }
        self.operators.push(op);
        Ok(())
    }

    pub(crate) fn pop_operator_raw(&mut self) -> Option<OpTok> {
        self.operators.pop()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval_str(src: &str) -> Result<u16, Error> {
        let mut e = Engine::new(Vec::new());
        e.cursor = Cursor::immediate(src);
        e.eval(true)
    }

    #[test]
    fn test_precedence() {
        assert_eq!(eval_str("2+3*4").unwrap(), 14);
        assert_eq!(eval_str("(2+3)*4").unwrap(), 20);
        assert_eq!(eval_str("17%5").unwrap(), 2);
        assert_eq!(eval_str("1+2<<3").unwrap(), 24);
        assert_eq!(eval_str("10-2-3").unwrap(), 5);
    }

    #[test]
    fn test_power() {
        assert_eq!(eval_str("2^10").unwrap(), 1024);
        assert_eq!(eval_str("5^0").unwrap(), 1);
        assert_eq!(eval_str("2^3*3").unwrap(), 24);
    }

    #[test]
    fn test_xor_is_bang() {
        assert_eq!(eval_str("12!10").unwrap(), 6);
        assert_eq!(eval_str("1!0").unwrap(), 1);
    }

    #[test]
    fn test_unary() {
        assert_eq!(eval_str("-5").unwrap(), 0xfffb);
        assert_eq!(eval_str("!0").unwrap(), 1);
        assert_eq!(eval_str("!7").unwrap(), 0);
        assert_eq!(eval_str("~0").unwrap(), 0xffff);
        assert_eq!(eval_str("--5").unwrap(), 5);
    }

    #[test]
    fn test_comparisons_unsigned() {
        assert_eq!(eval_str("65535>1").unwrap(), 1);
        assert_eq!(eval_str("3<=3").unwrap(), 1);
        assert_eq!(eval_str("2==2").unwrap(), 1);
        assert_eq!(eval_str("2!=2").unwrap(), 0);
    }

    #[test]
    fn test_logical() {
        assert_eq!(eval_str("1&&2").unwrap(), 1);
        assert_eq!(eval_str("1&&0").unwrap(), 0);
        assert_eq!(eval_str("0||3").unwrap(), 1);
        assert_eq!(eval_str("2>1&&3>2").unwrap(), 1);
    }

    #[test]
    fn test_hex_literals() {
        assert_eq!(eval_str("$ff").unwrap(), 255);
        assert_eq!(eval_str("$8000>>15").unwrap(), 1);
    }

    #[test]
    fn test_wraparound() {
        assert_eq!(eval_str("65535+1").unwrap(), 0);
        assert_eq!(eval_str("0-1").unwrap(), 0xffff);
        assert_eq!(eval_str("256*256").unwrap(), 0);
    }

    #[test]
    fn test_neg_plus_value_is_zero() {
        assert_eq!(eval_str("-1234+1234").unwrap(), 0);
    }

    #[test]
    fn test_big_shift_clears() {
        assert_eq!(eval_str("1<<16").unwrap(), 0);
        assert_eq!(eval_str("$ffff>>16").unwrap(), 0);
    }

    #[test]
    fn test_division_by_zero() {
        assert_eq!(eval_str("1/0"), Err(Error::DivZero));
        assert_eq!(eval_str("1%0"), Err(Error::DivZero));
    }

    #[test]
    fn test_trailing_junk() {
        assert!(matches!(eval_str("1 2"), Err(Error::Extra(_))));
    }

    #[test]
    fn test_too_complex() {
        let deep = format!("{}1{}", "(".repeat(20), ")".repeat(20));
        assert_eq!(eval_str(&deep), Err(Error::Complex));
    }

    #[test]
    fn test_undefined_variable() {
        assert_eq!(eval_str("nosuch"), Err(Error::Var));
    }
}
