//! Compiler back end: bytecode emission and linking
//!
//! `CodeGen` owns the output buffer and the compile-time shadows of the
//! VM's registers.  As the statement engine walks the source it emits
//! instructions here; the shadow stack pointer tracks every byte the
//! emitted code will push or pop, which is what makes compile-time
//! addresses of variables correct at run time.
//!
//! Forward references (`if`/`while` false branches, the jump over a sub
//! body) are emitted as `LDI $ffff` placeholders whose operand address is
//! stashed until the destination is known, then patched with `fixup`.
//! Subroutine calls are patched last: `link` resolves every recorded call
//! site against the subroutine definition table.

use crate::bytecode::{Op, CALL_STACK_LIM, CALL_STACK_TOP, PC_START};
use crate::error::Error;

/// Subroutine names are significant to eight characters.
pub const SUB_NAME_LEN: usize = 8;

pub type SubName = [u8; SUB_NAME_LEN];

/// Build a subroutine table key from a name.
pub fn sub_name(ident: &str) -> SubName {
    let mut key = [0u8; SUB_NAME_LEN];
    for (i, b) in ident.bytes().take(SUB_NAME_LEN).enumerate() {
        key[i] = b;
    }
    key
}

/// An entry in the subroutine definition table (name, entry PC) or the
/// call-site table (name, address of the JSR operand to patch).
#[derive(Debug, Clone, Copy)]
pub struct SubEnt {
    pub name: SubName,
    pub addr: u16,
}

/// Compiler state: output buffer, shadow registers and the tables the
/// linkage pass consumes.
pub struct CodeGen {
    code: Vec<u8>,
    /// Shadow program counter.
    pub pc: u16,
    /// Shadow stack pointer; mirrors the VM's SP at every reachable PC.
    pub sp: u16,
    /// Shadow frame pointer.
    pub fp: u16,
    /// PC captured just before a statement's argument expressions were
    /// compiled; `endwhile` jumps back here to re-evaluate the guard.
    pub pc_before_eval: u16,
    /// Set between `sub` and `endsub`.
    pub in_sub: bool,
    /// Operand address of the jump over the current sub body, patched at
    /// `endsub`.
    pub sub_skip: Option<u16>,
    pub subs: Vec<SubEnt>,
    pub calls: Vec<SubEnt>,
}

impl CodeGen {
    pub fn new() -> Self {
        CodeGen {
            code: Vec::new(),
            pc: PC_START,
            sp: CALL_STACK_TOP,
            fp: CALL_STACK_TOP,
            pc_before_eval: PC_START,
            in_sub: false,
            sub_skip: None,
            subs: Vec::new(),
            calls: Vec::new(),
        }
    }

    /// Clear all state before a fresh compilation.
    pub fn reset(&mut self) {
        *self = CodeGen::new();
    }

    /// Emit one opcode byte.
    pub fn emit(&mut self, op: Op) {
        self.code.push(op.into());
        self.pc = self.pc.wrapping_add(1);
    }

    /// Emit `LDI` followed by a little-endian word.
    pub fn emit_ldi(&mut self, word: u16) {
        self.code.push(Op::Ldi.into());
        let [lo, hi] = word.to_le_bytes();
        self.code.push(lo);
        self.code.push(hi);
        self.pc = self.pc.wrapping_add(3);
    }

    /// Emit `PRMSG` followed by the NUL-terminated string.
    pub fn emit_prmsg(&mut self, msg: &str) {
        self.emit(Op::PrMsg);
        for b in msg.bytes() {
            self.code.push(b);
            self.pc = self.pc.wrapping_add(1);
        }
        self.code.push(0);
        self.pc = self.pc.wrapping_add(1);
    }

    /// Overwrite a previously emitted placeholder operand.
    pub fn fixup(&mut self, addr: u16, word: u16) {
        let idx = (addr - PC_START) as usize;
        let [lo, hi] = word.to_le_bytes();
        self.code[idx] = lo;
        self.code[idx + 1] = hi;
    }

    /// Allocate bytes on the target call stack.  Returns the new shadow SP,
    /// which is the address just below the allocated block.
    ///
    /// Code that pushes matching `PSHWORD`/`PSHBYTE` instructions must be
    /// emitted alongside, or the shadow SP will diverge from the VM's.
    pub fn push_callstack(&mut self, bytes: u32) -> Result<u16, Error> {
        if (self.sp as u32) < CALL_STACK_LIM as u32 + bytes {
            return Err(Error::NoTargetMem);
        }
        self.sp -= bytes as u16;
        Ok(self.sp)
    }

    /// Release bytes from the target call stack.
    pub fn pop_callstack(&mut self, bytes: u32) {
        self.sp += bytes as u16;
    }

    /// Resolve every call site against the subroutine definition table.
    pub fn link(&mut self) -> Result<(), Error> {
        for i in 0..self.calls.len() {
            let call = self.calls[i];
            let target = self
                .subs
                .iter()
                .find(|s| s.name == call.name)
                .ok_or(Error::Link)?
                .addr;
            self.fixup(call.addr, target);
        }
        Ok(())
    }

    /// The emitted image, from PC-start through the last byte emitted.
    pub fn image(&self) -> &[u8] {
        &self.code
    }
}
