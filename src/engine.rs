//! Statement engine
//!
//! One engine drives both execution modes.  Statements are parsed straight
//! off the line cursor; a mode switch decides whether each operation is
//! performed immediately (interpret) or emitted as bytecode for the VM
//! (compile).  Control flow is tracked on a stack of typed frames: the
//! frame variant is the construct's tag, and popping a mismatched variant
//! is how `endif` without `if` and friends are detected.

use std::fs;
use std::io::{self, Read, Write};

use crate::bytecode::Op;
use crate::compiler::{sub_name, CodeGen, SubEnt};
use crate::error::Error;
use crate::expr::OpTok;
use crate::lexer::{is_alpha, Cursor, ShortName};
use crate::program::Program;
use crate::vars::{Location, ScopeTable, VarEnt, VarType};

/// Maximum number of open control-flow frames.
const FLOW_STACK_FRAMES: usize = 64;

/// Execution mode: evaluate directly or emit bytecode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Interpret,
    Compile,
}

/// Outcome of `exec_line`, for the REPL to report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplStatus {
    /// Line ran to completion (or hit `end`).
    Ok,
    /// An error was reported.
    Err,
    /// The user interrupted execution.
    Break,
    /// The `quit` statement was executed; the session should end.
    Quit,
}

/// Line-editor state driven by the `:a`/`:i` commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditMode {
    Off,
    /// Appending after a line; `.` alone leaves this mode.
    Append,
    /// The next line becomes the new first line, then switch to append.
    InsertFirst,
}

/// What an `if` or `while` observed when it was entered while
/// interpreting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SkipStatus {
    /// The skip flag was already set; the condition was not evaluated.
    AlreadySkipping,
    /// Condition false: this construct set the skip flag.
    CondFalse,
    /// Condition true: statements execute.
    CondTrue,
}

#[derive(Debug, Clone)]
pub(crate) enum IfFrame {
    Interp(SkipStatus),
    /// Operand addresses awaiting fixup: the false-branch target, and the
    /// jump emitted by `else` to skip its block.
    Compile {
        false_fix: Option<u16>,
        end_fix: Option<u16>,
    },
}

#[derive(Debug, Clone)]
pub(crate) enum WhileFrame {
    Interp { status: SkipStatus, ret: Cursor },
    /// `top` is the PC of the guard expression; `false_fix` the branch
    /// operand patched at `endwhile`.
    Compile { top: u16, false_fix: u16 },
}

#[derive(Debug, Clone)]
pub(crate) enum ForFrame {
    Interp {
        ty: VarType,
        ret: Cursor,
        limit: u16,
        addr: u16,
    },
    Compile {
        ty: VarType,
        relative: bool,
        body: u16,
        addr: u16,
    },
}

#[derive(Debug, Clone)]
pub(crate) enum CallFrame {
    /// A real activation; `ret` points just past the call's argument list.
    Interp { ret: Cursor },
    /// Marker pushed under the activation when a sub is invoked from
    /// within an expression; `return` stopping on it hands the value back
    /// to the expression parser.
    Expr,
}

/// A control-flow stack frame.  The variant is the frame's tag.
#[derive(Debug, Clone)]
pub(crate) enum Frame {
    If(IfFrame),
    While(WhileFrame),
    For(ForFrame),
    Call(CallFrame),
}

/// How a statement's arguments are parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArgShape {
    /// The whole rest of the line belongs to the statement.
    FullLine,
    /// No arguments permitted.
    NoArgs,
    /// One expression, then end of statement.
    OneArg,
    /// Two comma-separated expressions.
    TwoArgs,
    /// One expression; the statement parses any tail itself.
    InitialArg,
    /// One quoted string literal.
    OneStrArg,
    /// One bare name; the statement parses any tail itself.
    InitialNameArg,
    /// The statement does all its own parsing.
    Custom,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StmtTok {
    Comment,
    PrDec,
    PrDecS,
    PrHex,
    PrMsg,
    PrNl,
    PrStr,
    PrCh,
    KbdCh,
    KbdLn,
    Quit,
    Clear,
    Vars,
    Word,
    Byte,
    Run,
    Comp,
    New,
    Sub,
    EndSub,
    If,
    Else,
    EndIf,
    Free,
    Call,
    Return,
    For,
    EndFor,
    While,
    EndWhile,
    End,
    PokeWord,
    PokeByte,
    Load,
    Save,
    List,
    Change,
    Append,
    Insert,
    Delete,
}

struct StmtEnt {
    name: &'static str,
    tok: StmtTok,
    shape: ArgShape,
}

/// Statement table.  Scanned in order, so a name that is a prefix of
/// another relies on the separator check to fall through to the longer
/// entry.
const STMT_TABLE: &[StmtEnt] = &[
    StmtEnt { name: "'", tok: StmtTok::Comment, shape: ArgShape::FullLine },
    StmtEnt { name: "pr.dec", tok: StmtTok::PrDec, shape: ArgShape::OneArg },
    StmtEnt { name: "pr.dec.s", tok: StmtTok::PrDecS, shape: ArgShape::OneArg },
    StmtEnt { name: "pr.hex", tok: StmtTok::PrHex, shape: ArgShape::OneArg },
    StmtEnt { name: "pr.msg", tok: StmtTok::PrMsg, shape: ArgShape::OneStrArg },
    StmtEnt { name: "pr.nl", tok: StmtTok::PrNl, shape: ArgShape::NoArgs },
    StmtEnt { name: "pr.str", tok: StmtTok::PrStr, shape: ArgShape::OneArg },
    StmtEnt { name: "pr.ch", tok: StmtTok::PrCh, shape: ArgShape::OneArg },
    StmtEnt { name: "kbd.ch", tok: StmtTok::KbdCh, shape: ArgShape::OneArg },
    StmtEnt { name: "kbd.ln", tok: StmtTok::KbdLn, shape: ArgShape::TwoArgs },
    StmtEnt { name: "quit", tok: StmtTok::Quit, shape: ArgShape::NoArgs },
    StmtEnt { name: "clear", tok: StmtTok::Clear, shape: ArgShape::NoArgs },
    StmtEnt { name: "vars", tok: StmtTok::Vars, shape: ArgShape::NoArgs },
    StmtEnt { name: "word", tok: StmtTok::Word, shape: ArgShape::Custom },
    StmtEnt { name: "byte", tok: StmtTok::Byte, shape: ArgShape::Custom },
    StmtEnt { name: "run", tok: StmtTok::Run, shape: ArgShape::NoArgs },
    StmtEnt { name: "comp", tok: StmtTok::Comp, shape: ArgShape::NoArgs },
    StmtEnt { name: "new", tok: StmtTok::New, shape: ArgShape::NoArgs },
    StmtEnt { name: "sub", tok: StmtTok::Sub, shape: ArgShape::InitialNameArg },
    StmtEnt { name: "endsub", tok: StmtTok::EndSub, shape: ArgShape::NoArgs },
    StmtEnt { name: "if", tok: StmtTok::If, shape: ArgShape::OneArg },
    StmtEnt { name: "else", tok: StmtTok::Else, shape: ArgShape::NoArgs },
    StmtEnt { name: "endif", tok: StmtTok::EndIf, shape: ArgShape::NoArgs },
    StmtEnt { name: "free", tok: StmtTok::Free, shape: ArgShape::NoArgs },
    StmtEnt { name: "call", tok: StmtTok::Call, shape: ArgShape::InitialNameArg },
    StmtEnt { name: "return", tok: StmtTok::Return, shape: ArgShape::OneArg },
    StmtEnt { name: "for", tok: StmtTok::For, shape: ArgShape::Custom },
    StmtEnt { name: "endfor", tok: StmtTok::EndFor, shape: ArgShape::NoArgs },
    StmtEnt { name: "while", tok: StmtTok::While, shape: ArgShape::OneArg },
    StmtEnt { name: "endwhile", tok: StmtTok::EndWhile, shape: ArgShape::NoArgs },
    StmtEnt { name: "end", tok: StmtTok::End, shape: ArgShape::NoArgs },
    StmtEnt { name: "*", tok: StmtTok::PokeWord, shape: ArgShape::InitialArg },
    StmtEnt { name: "^", tok: StmtTok::PokeByte, shape: ArgShape::InitialArg },
    StmtEnt { name: ":r", tok: StmtTok::Load, shape: ArgShape::OneStrArg },
    StmtEnt { name: ":w", tok: StmtTok::Save, shape: ArgShape::OneStrArg },
    StmtEnt { name: ":l", tok: StmtTok::List, shape: ArgShape::Custom },
    StmtEnt { name: ":c", tok: StmtTok::Change, shape: ArgShape::InitialArg },
    StmtEnt { name: ":a", tok: StmtTok::Append, shape: ArgShape::OneArg },
    StmtEnt { name: ":i", tok: StmtTok::Insert, shape: ArgShape::OneArg },
    StmtEnt { name: ":d", tok: StmtTok::Delete, shape: ArgShape::InitialArg },
];

/// Variable assignment and the three statements that look like it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AssignMode {
    Word,
    Byte,
    Let,
    For,
}

/// Outcome of one parsed line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Ctl {
    /// End of line reached; the caller advances to the next line.
    Done,
    /// `end` (or a return to an expression call) stopped execution.
    Stop,
    /// `quit` was executed; unwind to the prompt.
    Quit,
}

/// Outcome of one statement.
enum StCtl {
    Next,
    /// The statement consumed the rest of the line (editor commands).
    LineDone,
    Stop,
    Quit,
}

/// Locals collected while binding a call's arguments, created together
/// once the callee frame is opened.
enum NewLocal {
    Scalar(ShortName, VarType, u16),
    Array(ShortName, VarType, u8, u16, u16),
}

/// The interpreter/compiler engine.  All language state lives here;
/// output goes to the `out` sink so callers can capture it.
pub struct Engine<W: Write> {
    pub program: Program,
    pub out: W,
    pub edit: EditMode,
    edit_after: usize,
    pub(crate) vars: ScopeTable,
    pub(crate) flow: Vec<Frame>,
    pub(crate) operands: Vec<u16>,
    pub(crate) operators: Vec<OpTok>,
    pub(crate) cursor: Cursor,
    pub(crate) skip: bool,
    pub(crate) sub_skip: bool,
    /// Set by the `quit` statement; `exec_line` turns it into
    /// [`ReplStatus::Quit`] even when quitting happened at expression
    /// depth.
    pub(crate) quit: bool,
    pub(crate) mode: Mode,
    pub(crate) gen: CodeGen,
    pub(crate) ret_register: u16,
}

impl<W: Write> Engine<W> {
    pub fn new(out: W) -> Self {
        let mut engine = Engine {
            program: Program::new(),
            out,
            edit: EditMode::Off,
            edit_after: 0,
            vars: ScopeTable::new(),
            flow: Vec::new(),
            operands: Vec::new(),
            operators: Vec::new(),
            cursor: Cursor::immediate(""),
            skip: false,
            sub_skip: false,
            quit: false,
            mode: Mode::Interpret,
            gen: CodeGen::new(),
            ret_register: 0,
        };
        engine.reset_expr_stacks();
        engine
    }

    /// Parse and execute one line of immediate input.  This is the REPL's
    /// entry point into the engine.
    pub fn exec_line(&mut self, line: &str) -> ReplStatus {
        self.quit = false;
        self.reset_expr_stacks();
        self.cursor = Cursor::immediate(line);
        let status = match self.parse_line() {
            Ok(Ctl::Quit) => ReplStatus::Quit,
            Ok(_) => {
                if self.flow.is_empty() {
                    ReplStatus::Ok
                } else {
                    let _ = write!(self.out, "?{}", Error::Stack);
                    self.reset_after_error();
                    ReplStatus::Err
                }
            }
            Err(Error::Interrupted) => {
                self.reset_after_error();
                ReplStatus::Break
            }
            Err(e) => {
                let _ = write!(self.out, "?{}", e);
                self.reset_after_error();
                ReplStatus::Err
            }
        };
        self.skip = false;
        if self.quit {
            ReplStatus::Quit
        } else {
            status
        }
    }

    /// Compile the stored program and return the bytecode image, from the
    /// load address through the terminating `END`.
    pub fn compile_program(&mut self) -> Result<Vec<u8>, Error> {
        self.mode = Mode::Compile;
        self.gen.reset();
        self.reset_expr_stacks();
        let res = self.compile_inner();
        self.mode = Mode::Interpret;
        self.vars.clear();
        res?;
        Ok(self.gen.image().to_vec())
    }

    fn compile_inner(&mut self) -> Result<(), Error> {
        self.run(false)?;
        self.gen.emit(Op::End);
        self.gen.link()
    }

    /// Feed one line to the editor while in append/insert mode.
    pub fn edit_line(&mut self, text: &str) {
        match self.edit {
            EditMode::Off => {}
            EditMode::InsertFirst => {
                self.program.insert_first(text);
                self.edit_after = 1;
                self.edit = EditMode::Append;
            }
            EditMode::Append => {
                self.program.insert_at(self.edit_after, text);
                self.edit_after += 1;
            }
        }
    }

    /// Leave editor append mode.
    pub fn end_edit(&mut self) {
        self.edit = EditMode::Off;
    }

    /// Run the stored program.  `cont` resumes at the current cursor
    /// (subroutine execution); otherwise variables and control flow are
    /// cleared and execution starts at line 1.  Returns how the run
    /// ended so `quit` can unwind to the prompt.
    pub(crate) fn run(&mut self, cont: bool) -> Result<Ctl, Error> {
        self.skip = false;
        self.sub_skip = false;
        if !cont {
            self.vars.clear();
            self.flow.clear();
            if self.program.is_empty() {
                return Ok(Ctl::Done);
            }
            self.cursor = Cursor::at_line(self.program.line(0), 0);
        }
        loop {
            match self.parse_line()? {
                Ctl::Stop => return Ok(Ctl::Stop),
                Ctl::Quit => return Ok(Ctl::Quit),
                Ctl::Done => match self.cursor.line {
                    None => return Ok(Ctl::Done),
                    Some(i) => {
                        if i + 1 >= self.program.len() {
                            return Ok(Ctl::Done);
                        }
                        self.cursor = Cursor::at_line(self.program.line(i + 1), i + 1);
                    }
                },
            }
        }
    }

    /// Execute statements from the cursor to the end of its line.
    pub(crate) fn parse_line(&mut self) -> Result<Ctl, Error> {
        loop {
            if self.check_interrupt() {
                return Err(Error::Interrupted);
            }
            self.cursor.eat_space();
            while self.cursor.peek() == Some(b';') {
                self.cursor.bump();
                self.cursor.eat_space();
            }
            if self.cursor.at_end() {
                return Ok(Ctl::Done);
            }
            match self.statement()? {
                StCtl::Next => {}
                StCtl::LineDone => return Ok(Ctl::Done),
                StCtl::Stop => return Ok(Ctl::Stop),
                StCtl::Quit => return Ok(Ctl::Quit),
            }
        }
    }

    /// Poll for a user interrupt between statements.  Hosted builds have
    /// line-buffered stdin and no key to poll, so this reports false;
    /// a port with raw keyboard access hooks in here.
    fn check_interrupt(&self) -> bool {
        false
    }

    fn match_statement(&self) -> Option<&'static StmtEnt> {
        for ent in STMT_TABLE {
            if self.cursor.starts_with(ent.name) {
                // Keyword statements need a separator after the name so
                // that e.g. "pr.dec" does not swallow "pr.dec.s" and
                // "word1 = 5" stays an assignment.
                let needs_sep = ent.name.as_bytes()[0].is_ascii_alphabetic();
                let next = self.cursor.peek_at(ent.name.len());
                if !needs_sep || matches!(next, None | Some(b' ') | Some(b';')) {
                    return Some(ent);
                }
            }
        }
        None
    }

    /// Parse and execute one statement.
    fn statement(&mut self) -> Result<StCtl, Error> {
        let start = self.cursor.clone();

        // Sequential flow met a `sub`: consume the body without executing.
        if self.sub_skip {
            if let Some(ent) = self.match_statement() {
                if ent.tok == StmtTok::EndSub {
                    self.cursor.advance(ent.name.len());
                    self.sub_skip = false;
                    return Ok(StCtl::Next);
                }
            }
            self.cursor.skip_statement();
            return Ok(StCtl::Next);
        }

        let ent = self.match_statement();

        // While skipping a not-taken branch, only the statements that
        // manipulate the skip flag are observed.
        if self.skip {
            let observed = matches!(
                ent.map(|e| e.tok),
                Some(
                    StmtTok::If
                        | StmtTok::Else
                        | StmtTok::EndIf
                        | StmtTok::While
                        | StmtTok::EndWhile
                )
            );
            if !observed {
                self.cursor.skip_statement();
                return Ok(StCtl::Next);
            }
        }

        let Some(ent) = ent else {
            // Anything else is attempted as a variable assignment.
            self.assign_or_create(AssignMode::Let)?;
            return Ok(StCtl::Next);
        };
        self.cursor.advance(ent.name.len());
        self.cursor.eat_space();

        // Remember where the argument code begins; `endwhile` jumps back
        // here to re-evaluate its guard.
        self.gen.pc_before_eval = self.gen.pc;

        let mut strarg = String::new();
        let mut namearg = String::new();
        let (arg, arg2): (u16, u16) = match ent.shape {
            ArgShape::NoArgs => {
                self.check_no_more_args()?;
                (0, 0)
            }
            ArgShape::OneArg => {
                if self.skip {
                    // The construct will record "already skipping"; the
                    // condition text is consumed unevaluated.
                    self.cursor.skip_statement();
                    (0, 0)
                } else {
                    (self.eval(true)?, 0)
                }
            }
            ArgShape::TwoArgs => {
                let a = self.eval(false)?;
                self.cursor.eat_space();
                self.cursor.expect(b',')?;
                let b = self.eval(false)?;
                (a, b)
            }
            ArgShape::InitialArg => (self.eval(false)?, 0),
            ArgShape::OneStrArg => {
                strarg = self.parse_string()?;
                self.check_no_more_args()?;
                (0, 0)
            }
            ArgShape::InitialNameArg => {
                if !self.cursor.peek().is_some_and(is_alpha) {
                    return Err(Error::Syntax);
                }
                let (_, full) = self.cursor.scan_ident();
                namearg = full;
                (0, 0)
            }
            ArgShape::FullLine => {
                while !self.cursor.at_end() {
                    self.cursor.bump();
                }
                (0, 0)
            }
            ArgShape::Custom => (0, 0),
        };

        match ent.tok {
            StmtTok::Comment => {}
            StmtTok::Quit => {
                if self.mode == Mode::Compile {
                    // In compiled code quit simply stops the VM.
                    self.gen.emit(Op::End);
                } else {
                    let _ = self.out.write_all(b"Bye!\n");
                    let _ = self.out.flush();
                    self.quit = true;
                    return Ok(StCtl::Quit);
                }
            }
            StmtTok::PrDec => {
                if self.mode == Mode::Compile {
                    self.gen.emit(Op::PrDec);
                } else {
                    self.print_dec(arg);
                }
            }
            StmtTok::PrDecS => {
                if self.mode == Mode::Compile {
                    // Test bit 15; on a negative value print '-' and the
                    // two's-complement magnitude.
                    self.gen.emit(Op::Dup);
                    self.gen.emit_ldi(0x8000);
                    self.gen.emit(Op::BitAnd);
                    self.gen.emit(Op::Not);
                    let past_minus = self.gen.pc + 9;
                    self.gen.emit_ldi(past_minus);
                    self.gen.emit(Op::Brnch);
                    self.gen.emit_ldi(u16::from(b'-'));
                    self.gen.emit(Op::PrCh);
                    self.gen.emit(Op::Neg);
                    self.gen.emit(Op::PrDec);
                } else {
                    let mut v = arg;
                    if v & 0x8000 != 0 {
                        self.print_ch(b'-');
                        v = v.wrapping_neg();
                    }
                    self.print_dec(v);
                }
            }
            StmtTok::PrHex => {
                if self.mode == Mode::Compile {
                    self.gen.emit(Op::PrHex);
                } else {
                    self.print_hex(arg);
                }
            }
            StmtTok::PrMsg => {
                if self.mode == Mode::Compile {
                    self.gen.emit_prmsg(&strarg);
                } else {
                    let _ = self.out.write_all(strarg.as_bytes());
                }
            }
            StmtTok::PrNl => {
                if self.mode == Mode::Compile {
                    self.gen.emit_ldi(10);
                    self.gen.emit(Op::PrCh);
                } else {
                    self.print_ch(b'\n');
                }
            }
            StmtTok::PrStr => {
                if self.mode == Mode::Compile {
                    self.gen.emit(Op::PrStr);
                } else {
                    let mut a = arg;
                    loop {
                        let c = self.vars.arena.peek_byte(a);
                        if c == 0 {
                            break;
                        }
                        self.print_ch(c);
                        a = a.wrapping_add(1);
                    }
                }
            }
            StmtTok::PrCh => {
                if self.mode == Mode::Compile {
                    self.gen.emit(Op::PrCh);
                } else {
                    self.print_ch(arg as u8);
                }
            }
            StmtTok::KbdCh => {
                if self.mode == Mode::Compile {
                    // Address is on the VM stack; KBDCH pushes the key.
                    self.gen.emit(Op::KbdCh);
                    self.gen.emit(Op::Swap);
                    self.gen.emit(Op::StaByte);
                } else {
                    let c = read_key();
                    self.vars.arena.poke_byte(arg, c);
                }
            }
            StmtTok::KbdLn => {
                if self.mode == Mode::Compile {
                    self.gen.emit(Op::KbdLn);
                } else {
                    let text = read_input_line();
                    let max = (arg2 as usize).saturating_sub(1);
                    let bytes = &text.as_bytes()[..text.len().min(max)];
                    for (i, &b) in bytes.iter().enumerate() {
                        self.vars.arena.poke_byte(arg.wrapping_add(i as u16), b);
                    }
                    self.vars
                        .arena
                        .poke_byte(arg.wrapping_add(bytes.len() as u16), 0);
                }
            }
            StmtTok::Clear => self.vars.clear(),
            StmtTok::Vars => self.print_vars(),
            StmtTok::Word => self.assign_or_create(AssignMode::Word)?,
            StmtTok::Byte => self.assign_or_create(AssignMode::Byte)?,
            StmtTok::Run => {
                if self.mode == Mode::Compile {
                    return Err(Error::Syntax);
                }
                let saved = self.cursor.clone();
                match self.run(false) {
                    Ok(Ctl::Quit) => return Ok(StCtl::Quit),
                    Ok(_) => {}
                    Err(e) => self.report_run_error(&e),
                }
                self.cursor = saved;
            }
            StmtTok::Comp => {
                if self.mode == Mode::Compile {
                    return Err(Error::Syntax);
                }
                let saved = self.cursor.clone();
                match self.compile_program() {
                    Ok(image) => match fs::write("bytecode", &image) {
                        Ok(()) => {
                            let _ = writeln!(
                                self.out,
                                "Writing bytecode: {} bytes",
                                image.len()
                            );
                        }
                        Err(_) => {
                            let _ = writeln!(self.out, "?{}", Error::File);
                        }
                    },
                    Err(e) => self.report_run_error(&e),
                }
                self.cursor = saved;
            }
            StmtTok::New => self.program.clear(),
            StmtTok::Sub => self.dosubr(&namearg)?,
            StmtTok::EndSub => return self.doendsubr(),
            StmtTok::If => self.doif(arg)?,
            StmtTok::Else => self.doelse()?,
            StmtTok::EndIf => self.doendif()?,
            StmtTok::Free => {
                let _ = writeln!(
                    self.out,
                    "{} vars, code space pretty much unlimited!",
                    self.vars.arena.free_space()
                );
            }
            StmtTok::Call => {
                let was_immediate = self.cursor.line.is_none();
                self.docall(&namearg)?;
                if self.mode == Mode::Compile {
                    // Discard the return value.
                    self.gen.emit(Op::Drop);
                } else if was_immediate && self.run(true)? == Ctl::Quit {
                    return Ok(StCtl::Quit);
                }
            }
            StmtTok::Return => {
                self.doreturn(arg)?;
                if self.mode == Mode::Interpret
                    && matches!(self.flow.last(), Some(Frame::Call(CallFrame::Expr)))
                {
                    return Ok(StCtl::Stop);
                }
            }
            StmtTok::For => self.assign_or_create(AssignMode::For)?,
            StmtTok::EndFor => self.doendfor()?,
            StmtTok::While => self.dowhile(start, arg)?,
            StmtTok::EndWhile => self.doendwhile()?,
            StmtTok::End => {
                if self.mode == Mode::Compile {
                    self.gen.emit(Op::End);
                } else {
                    return Ok(StCtl::Stop);
                }
            }
            StmtTok::PokeWord | StmtTok::PokeByte => {
                self.cursor.eat_space();
                self.cursor.expect(b'=')?;
                let value = self.eval(true)?;
                if self.mode == Mode::Compile {
                    self.gen.emit(Op::Swap);
                    self.gen.emit(match ent.tok {
                        StmtTok::PokeWord => Op::StaWord,
                        _ => Op::StaByte,
                    });
                } else if ent.tok == StmtTok::PokeWord {
                    self.vars.arena.poke_word(arg, value);
                } else {
                    self.vars.arena.poke_byte(arg, value as u8);
                }
            }
            StmtTok::Load => {
                self.vars.clear();
                self.program.clear();
                let n = self.program.load(&strarg).map_err(|_| Error::File)?;
                let _ = writeln!(self.out, "{} lines", n);
                return Ok(StCtl::LineDone);
            }
            StmtTok::Save => {
                self.program.save(&strarg).map_err(|_| Error::File)?;
                let _ = writeln!(self.out, "OK");
            }
            StmtTok::List => {
                if self.cursor.at_end() {
                    let _ = self.program.list(1, 32767, &mut self.out);
                } else {
                    let from = self.eval(false)?;
                    self.cursor.eat_space();
                    if self.cursor.at_end() {
                        let _ = self.program.list(from as usize, 32767, &mut self.out);
                    } else {
                        self.cursor.expect(b',')?;
                        let to = self.eval(true)?;
                        let _ = self.program.list(from as usize, to as usize, &mut self.out);
                    }
                }
            }
            StmtTok::Change => {
                self.cursor.eat_space();
                self.cursor.expect(b':')?;
                let text = self.cursor.rest().to_string();
                if !self.program.change(arg as usize, &text) {
                    return Err(Error::Line);
                }
                // Do not execute the changed text.
                return Ok(StCtl::LineDone);
            }
            StmtTok::Append => {
                let n = arg as usize;
                if n == 0 || n > self.program.len() {
                    return Err(Error::Line);
                }
                self.edit = EditMode::Append;
                self.edit_after = n;
            }
            StmtTok::Insert => {
                let n = arg as usize;
                if n <= 1 {
                    self.edit = EditMode::InsertFirst;
                } else {
                    if n - 1 > self.program.len() {
                        return Err(Error::Line);
                    }
                    self.edit = EditMode::Append;
                    self.edit_after = n - 1;
                }
            }
            StmtTok::Delete => {
                self.cursor.eat_space();
                if self.cursor.at_end() || self.cursor.peek() == Some(b';') {
                    self.program.delete(arg as usize, arg as usize);
                } else {
                    self.cursor.expect(b',')?;
                    let to = self.eval(true)?;
                    self.program.delete(arg as usize, to as usize);
                }
            }
        }
        Ok(StCtl::Next)
    }

    fn check_no_more_args(&mut self) -> Result<(), Error> {
        self.cursor.eat_space();
        if !self.cursor.at_end() && self.cursor.peek() != Some(b';') {
            return Err(Error::Extra(self.cursor.rest().to_string()));
        }
        Ok(())
    }

    /// Parse a quoted string literal (no escapes).
    fn parse_string(&mut self) -> Result<String, Error> {
        if self.cursor.peek() != Some(b'"') {
            return Err(Error::Str);
        }
        self.cursor.bump();
        let mut s = String::new();
        loop {
            match self.cursor.peek() {
                Some(b'"') => {
                    self.cursor.bump();
                    return Ok(s);
                }
                Some(c) => {
                    s.push(c as char);
                    self.cursor.bump();
                }
                None => return Err(Error::Str),
            }
        }
    }

    /// Shared parse for `word`/`byte` declarations, assignment and the
    /// head of a `for` statement, all of which read
    /// `name[dim] = expr` / `name = expr` (with `: limit` for `for`).
    fn assign_or_create(&mut self, mode: AssignMode) -> Result<(), Error> {
        if !self.cursor.peek().is_some_and(is_alpha) {
            return Err(Error::Var);
        }
        let (key, _) = self.cursor.scan_ident();

        let mut dims = 0u8;
        let mut dim: u16 = 0;
        let mut idx: u16 = 0;
        let subscripted = self.cursor.peek() == Some(b'[');
        if subscripted {
            dims = 1;
            match mode {
                AssignMode::Word | AssignMode::Byte => {
                    // Array dimensions must be numeric literals.
                    self.cursor.expect(b'[')?;
                    dim = self.cursor.parse_int()?;
                    self.cursor.eat_space();
                    self.cursor.expect(b']')?;
                }
                _ => idx = self.subscript()?,
            }
        }
        self.cursor.eat_space();
        self.cursor.expect(b'=')?;
        let val = self.eval(mode != AssignMode::For)?;

        match mode {
            AssignMode::Word | AssignMode::Byte => {
                let ty = if mode == AssignMode::Word {
                    VarType::Word
                } else {
                    VarType::Byte
                };
                let sz = if dim == 0 { 1 } else { dim };
                self.create_var(key, ty, dims, sz, val)?;
            }
            AssignMode::Let | AssignMode::For => {
                self.set_var(&key, subscripted, idx, val)?;
            }
        }
        if mode != AssignMode::For {
            return Ok(());
        }

        // for NAME = init : limit
        self.cursor.expect(b':')?;
        let limit = self.eval(true)?;
        match self.mode {
            Mode::Compile => {
                let (addr, ty, relative) = self.lookup_target_scalar(&key)?;
                // The limit stays on the VM stack; the top of the loop
                // re-duplicates it for each iteration's test.
                let body = self.gen.pc;
                self.gen.emit(Op::Dup);
                self.flow_push(Frame::For(ForFrame::Compile {
                    ty,
                    relative,
                    body,
                    addr,
                }))?;
            }
            Mode::Interpret => {
                let (addr, ty) = self.lookup_interp_scalar(&key)?;
                self.flow_push(Frame::For(ForFrame::Interp {
                    ty,
                    ret: self.cursor.clone(),
                    limit,
                    addr,
                }))?;
            }
        }
        Ok(())
    }

    /// Create a variable in the current scope.  In compile mode this
    /// allocates target call-stack storage and emits the push of the
    /// initializer (which the evaluated expression left on the VM stack).
    fn create_var(
        &mut self,
        key: ShortName,
        ty: VarType,
        dims: u8,
        sz: u16,
        val: u16,
    ) -> Result<(), Error> {
        match self.mode {
            Mode::Interpret => self.vars.create_interp(key, ty, dims, sz, val, None),
            Mode::Compile => {
                self.vars.check_redef(&key)?;
                if sz < 1 {
                    return Err(Error::Dim);
                }
                let bytes = sz as u32 * ty.size() as u32;
                let newsp = self.gen.push_callstack(bytes)?;
                let loc = if self.gen.in_sub {
                    Location::TargetRel(newsp.wrapping_sub(self.gen.fp) as i16)
                } else {
                    Location::TargetAbs(newsp + 1)
                };
                if dims == 0 {
                    self.gen.emit(match ty {
                        VarType::Word => Op::PshWord,
                        VarType::Byte => Op::PshByte,
                    });
                    self.vars.insert(VarEnt { name: key, ty, dims, size: 1, loc });
                } else {
                    // Push sz copies of the initializer (on the VM stack)
                    // with a count-down loop, then drop the temporaries.
                    self.gen.emit_ldi(sz);
                    let top = self.gen.pc;
                    self.gen.emit(Op::Dec);
                    self.gen.emit(Op::Dup);
                    self.gen.emit_ldi(3);
                    self.gen.emit(Op::Pick);
                    self.gen.emit(match ty {
                        VarType::Word => Op::PshWord,
                        VarType::Byte => Op::PshByte,
                    });
                    self.gen.emit_ldi(0);
                    self.gen.emit(Op::Neql);
                    self.gen.emit_ldi(top);
                    self.gen.emit(Op::Brnch);
                    self.gen.emit(Op::Drop);
                    self.gen.emit(Op::Drop);
                    self.vars.insert(VarEnt { name: key, ty, dims, size: sz, loc });
                }
                Ok(())
            }
        }
    }

    /// Store to an existing variable.  In compile mode the value (and for
    /// arrays the index, below it) is on the VM stack.
    pub(crate) fn set_var(
        &mut self,
        key: &ShortName,
        subscripted: bool,
        idx: u16,
        value: u16,
    ) -> Result<(), Error> {
        let (i, _) = self.vars.find(key, false).ok_or(Error::Var)?;
        let ent = self.vars.ents[i];
        if ent.dims == 0 {
            if subscripted {
                return Err(Error::Subscript);
            }
            match self.mode {
                Mode::Compile => {
                    let (addr, rel) = target_addr(&ent)?;
                    self.gen.emit_ldi(addr);
                    self.gen.emit(store_op(rel, ent.ty));
                }
                Mode::Interpret => {
                    let Location::Arena(off) = ent.loc else {
                        return Err(Error::Var);
                    };
                    match ent.ty {
                        VarType::Word => self.vars.arena.poke_word(off, value),
                        VarType::Byte => self.vars.arena.poke_byte(off, value as u8),
                    }
                }
            }
        } else {
            if !subscripted {
                return Err(Error::Subscript);
            }
            match self.mode {
                Mode::Compile => {
                    // Stack is [index, value]; bring the index up, scale
                    // it, add the base and store.
                    self.gen.emit(Op::Swap);
                    if ent.ty == VarType::Word {
                        self.gen.emit_ldi(2);
                        self.gen.emit(Op::Mul);
                    }
                    match ent.loc {
                        Location::TargetAbs(base) => {
                            self.gen.emit_ldi(base);
                            self.gen.emit(Op::Add);
                            self.gen.emit(store_op(false, ent.ty));
                        }
                        Location::TargetRel(base) => {
                            self.gen.emit_ldi(base as u16);
                            self.gen.emit(Op::Add);
                            self.gen.emit(store_op(true, ent.ty));
                        }
                        Location::TargetRefSlot(slot) => {
                            self.gen.emit_ldi(slot as u16);
                            self.gen.emit(Op::LdrWord);
                            self.gen.emit(Op::Add);
                            self.gen.emit(store_op(false, ent.ty));
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
                    match ent.ty {
                        VarType::Word => self.vars.arena.poke_word(body + idx * 2, value),
                        VarType::Byte => self.vars.arena.poke_byte(body + idx, value as u8),
                    }
                }
            }
        }
        Ok(())
    }

    /// Compile-time lookup of a scalar's target address (no code emitted).
    fn lookup_target_scalar(&self, key: &ShortName) -> Result<(u16, VarType, bool), Error> {
        let (i, _) = self.vars.find(key, false).ok_or(Error::Var)?;
        let ent = self.vars.ents[i];
        if ent.dims != 0 {
            return Err(Error::Type);
        }
        let (addr, rel) = target_addr(&ent)?;
        Ok((addr, ent.ty, rel))
    }

    /// Interpret-mode lookup of a scalar's arena address.
    fn lookup_interp_scalar(&self, key: &ShortName) -> Result<(u16, VarType), Error> {
        let (i, _) = self.vars.find(key, false).ok_or(Error::Var)?;
        let ent = self.vars.ents[i];
        if ent.dims != 0 {
            return Err(Error::Type);
        }
        let Location::Arena(off) = ent.loc else {
            return Err(Error::Var);
        };
        Ok((off, ent.ty))
    }

    fn doif(&mut self, arg: u16) -> Result<(), Error> {
        match self.mode {
            Mode::Compile => {
                // The condition value is on the VM stack.  Branch over the
                // block when it is false; the destination is patched at
                // `else` or `endif`.
                self.gen.emit(Op::Not);
                let false_fix = self.gen.pc + 1;
                self.gen.emit_ldi(0xffff);
                self.gen.emit(Op::Brnch);
                self.flow_push(Frame::If(IfFrame::Compile {
                    false_fix: Some(false_fix),
                    end_fix: None,
                }))
            }
            Mode::Interpret => {
                let status = if self.skip {
                    SkipStatus::AlreadySkipping
                } else if arg == 0 {
                    self.skip = true;
                    SkipStatus::CondFalse
                } else {
                    SkipStatus::CondTrue
                };
                self.flow_push(Frame::If(IfFrame::Interp(status)))
            }
        }
    }

    fn doelse(&mut self) -> Result<(), Error> {
        match self.flow.last() {
            Some(Frame::If(IfFrame::Compile { false_fix, .. })) => {
                let false_fix = *false_fix;
                // Jump over the else block when the if block ran.
                let end_fix = self.gen.pc + 1;
                self.gen.emit_ldi(0xffff);
                self.gen.emit(Op::Jmp);
                if let Some(f) = false_fix {
                    let here = self.gen.pc;
                    self.gen.fixup(f, here);
                }
                if let Some(Frame::If(IfFrame::Compile { false_fix, end_fix: e })) =
                    self.flow.last_mut()
                {
                    *false_fix = None;
                    *e = Some(end_fix);
                }
                Ok(())
            }
            Some(Frame::If(IfFrame::Interp(status))) => {
                match status {
                    SkipStatus::CondTrue => self.skip = true,
                    SkipStatus::CondFalse => self.skip = false,
                    SkipStatus::AlreadySkipping => {}
                }
                Ok(())
            }
            _ => Err(Error::NoIf),
        }
    }

    fn doendif(&mut self) -> Result<(), Error> {
        if !matches!(self.flow.last(), Some(Frame::If(_))) {
            return Err(Error::NoIf);
        }
        let Some(Frame::If(frame)) = self.flow.pop() else {
            unreachable!();
        };
        match frame {
            IfFrame::Compile { false_fix, end_fix } => {
                let here = self.gen.pc;
                if let Some(f) = false_fix {
                    self.gen.fixup(f, here);
                }
                if let Some(e) = end_fix {
                    self.gen.fixup(e, here);
                }
            }
            IfFrame::Interp(status) => {
                if status != SkipStatus::AlreadySkipping {
                    self.skip = false;
                }
            }
        }
        Ok(())
    }

    fn dowhile(&mut self, start: Cursor, arg: u16) -> Result<(), Error> {
        match self.mode {
            Mode::Compile => {
                let top = self.gen.pc_before_eval;
                self.gen.emit(Op::Not);
                let false_fix = self.gen.pc + 1;
                self.gen.emit_ldi(0xffff);
                self.gen.emit(Op::Brnch);
                self.flow_push(Frame::While(WhileFrame::Compile { top, false_fix }))
            }
            Mode::Interpret => {
                let status = if self.skip {
                    SkipStatus::AlreadySkipping
                } else if arg == 0 {
                    self.skip = true;
                    SkipStatus::CondFalse
                } else {
                    SkipStatus::CondTrue
                };
                self.flow_push(Frame::While(WhileFrame::Interp { status, ret: start }))
            }
        }
    }

    fn doendwhile(&mut self) -> Result<(), Error> {
        if !matches!(self.flow.last(), Some(Frame::While(_))) {
            return Err(Error::NoWhile);
        }
        let Some(Frame::While(frame)) = self.flow.pop() else {
            unreachable!();
        };
        match frame {
            WhileFrame::Compile { top, false_fix } => {
                // Jump back and re-evaluate the guard.
                self.gen.emit_ldi(top);
                self.gen.emit(Op::Jmp);
                let here = self.gen.pc;
                self.gen.fixup(false_fix, here);
            }
            WhileFrame::Interp { status, ret } => match status {
                SkipStatus::AlreadySkipping => {}
                SkipStatus::CondFalse => self.skip = false,
                SkipStatus::CondTrue => self.cursor = ret,
            },
        }
        Ok(())
    }

    fn doendfor(&mut self) -> Result<(), Error> {
        match self.flow.last() {
            Some(Frame::For(ForFrame::Compile { ty, relative, body, addr })) => {
                let (ty, relative, body, addr) = (*ty, *relative, *body, *addr);
                self.flow.pop();
                // The loop limit is on the VM stack (duplicated at the
                // top of the loop).  Increment the control variable,
                // store it back, and loop while limit >= new value.
                self.gen.emit_ldi(addr);
                self.gen.emit(load_op(relative, ty));
                self.gen.emit(Op::Inc);
                self.gen.emit(Op::Dup);
                self.gen.emit_ldi(addr);
                self.gen.emit(store_op(relative, ty));
                self.gen.emit(Op::Gte);
                self.gen.emit_ldi(body);
                self.gen.emit(Op::Brnch);
                self.gen.emit(Op::Drop);
                Ok(())
            }
            Some(Frame::For(ForFrame::Interp { ty, ret, limit, addr })) => {
                let (ty, ret, limit, addr) = (*ty, ret.clone(), *limit, *addr);
                let val = match ty {
                    VarType::Word => self.vars.arena.peek_word(addr),
                    VarType::Byte => self.vars.arena.peek_byte(addr) as u16,
                };
                if val < limit {
                    match ty {
                        VarType::Word => {
                            self.vars.arena.poke_word(addr, val.wrapping_add(1))
                        }
                        VarType::Byte => {
                            self.vars.arena.poke_byte(addr, (val as u8).wrapping_add(1))
                        }
                    }
                    self.cursor = ret;
                } else {
                    self.flow.pop();
                }
                Ok(())
            }
            _ => Err(Error::NoFor),
        }
    }

    /// Subroutine declaration.  Met in sequential interpret flow the body
    /// is skipped; the compiler compiles it in place behind a jump.
    fn dosubr(&mut self, name: &str) -> Result<(), Error> {
        match self.mode {
            Mode::Interpret => {
                self.sub_skip = true;
                Ok(())
            }
            Mode::Compile => {
                // Jump over the body; patched at endsub.
                let skip_fix = self.gen.pc + 1;
                self.gen.emit_ldi(0xffff);
                self.gen.emit(Op::Jmp);
                self.gen.sub_skip = Some(skip_fix);
                self.gen.subs.push(SubEnt {
                    name: sub_name(name),
                    addr: self.gen.pc,
                });
                self.vars.mark_call_frame();
                self.gen.in_sub = true;
                self.gen.emit(Op::SpToFp);
                self.gen.fp = self.gen.sp;

                self.cursor.eat_space();
                self.cursor.expect(b'(')?;
                loop {
                    self.cursor.eat_space();
                    if self.cursor.peek() == Some(b')') {
                        break;
                    }
                    let ty = if self.cursor.starts_with("word ") {
                        VarType::Word
                    } else if self.cursor.starts_with("byte ") {
                        VarType::Byte
                    } else {
                        return Err(Error::Arg);
                    };
                    self.cursor.advance(5);
                    self.cursor.eat_space();
                    let (key, _) = self.cursor.scan_ident();
                    let mut arraymode = false;
                    if self.cursor.peek() == Some(b'[') {
                        self.cursor.bump();
                        if self.cursor.peek() == Some(b']') {
                            self.cursor.bump();
                            arraymode = true;
                        } else {
                            return Err(Error::Arg);
                        }
                    }

                    // The caller pushes arguments left to right, so each
                    // new formal displaces the earlier ones further from
                    // the frame pointer by its own size.
                    let slot: i16 = if arraymode { 2 } else { ty.size() as i16 };
                    let local_start = self
                        .vars
                        .ents
                        .iter()
                        .rposition(VarEnt::is_sentinel)
                        .map(|i| i + 1)
                        .unwrap_or(0);
                    for ent in &mut self.vars.ents[local_start..] {
                        match &mut ent.loc {
                            Location::TargetRel(a) | Location::TargetRefSlot(a) => *a += slot,
                            _ => {}
                        }
                    }

                    // Relative address 4 skips the return address and the
                    // saved frame pointer.
                    self.vars.insert(VarEnt {
                        name: key,
                        ty,
                        dims: if arraymode { 1 } else { 0 },
                        size: if arraymode { 0 } else { 1 },
                        loc: if arraymode {
                            Location::TargetRefSlot(4)
                        } else {
                            Location::TargetRel(4)
                        },
                    });

                    self.cursor.eat_space();
                    if self.cursor.peek() == Some(b',') {
                        self.cursor.bump();
                    }
                }
                self.cursor.expect(b')')?;
                Ok(())
            }
        }
    }

    fn doendsubr(&mut self) -> Result<StCtl, Error> {
        match self.mode {
            Mode::Compile => {
                self.gen.sp = self.gen.fp;
                self.gen.in_sub = false;
                self.vars.delete_call_frame();
                self.doreturn(0)?;
                if let Some(fix) = self.gen.sub_skip.take() {
                    let here = self.gen.pc;
                    self.gen.fixup(fix, here);
                }
                Ok(StCtl::Next)
            }
            Mode::Interpret => {
                if !self
                    .flow
                    .iter()
                    .any(|f| matches!(f, Frame::Call(CallFrame::Interp { .. })))
                {
                    return Err(Error::RunSub);
                }
                self.doreturn(0)?;
                if matches!(self.flow.last(), Some(Frame::Call(CallFrame::Expr))) {
                    Ok(StCtl::Stop)
                } else {
                    Ok(StCtl::Next)
                }
            }
        }
    }

    /// Bind a call's arguments and transfer to the subroutine.
    ///
    /// Both the call's argument list (at the cursor) and the declaration's
    /// formal list (on the `sub` line) are walked in step.  Scalar formals
    /// take a copy of the evaluated argument; array formals alias the
    /// caller's payload.
    pub(crate) fn docall(&mut self, name: &str) -> Result<(), Error> {
        let (line_idx, paren) = self.program.find_sub(name).ok_or(Error::NoSub)?;
        let mut decl = Cursor::at_line(self.program.line(line_idx), line_idx);
        decl.advance(paren);
        decl.expect(b'(')?;

        self.cursor.eat_space();
        self.cursor.expect(b'(')?;
        // Guard the enclosing expression's pending operators while the
        // arguments are evaluated.
        self.push_operator_raw(OpTok::Sentinel)?;

        let mut argbytes: u16 = 0;
        let mut newlocals: Vec<NewLocal> = Vec::new();
        loop {
            decl.eat_space();
            if decl.peek() == Some(b')') {
                decl.bump();
                decl.eat_space();
                break;
            }
            let ty = if decl.starts_with("word ") {
                VarType::Word
            } else if decl.starts_with("byte ") {
                VarType::Byte
            } else {
                return Err(Error::Arg);
            };
            decl.advance(5);
            decl.eat_space();
            let (fkey, _) = decl.scan_ident();
            let mut arraymode = false;
            if decl.peek() == Some(b'[') {
                decl.bump();
                if decl.peek() == Some(b']') {
                    decl.bump();
                    arraymode = true;
                } else {
                    return Err(Error::Arg);
                }
            }

            if self.cursor.at_end() || self.cursor.peek() == Some(b')') {
                return Err(Error::Arg);
            }
            if !arraymode {
                let v = self.eval(false)?;
                match self.mode {
                    Mode::Compile => {
                        self.gen.emit(match ty {
                            VarType::Word => Op::PshWord,
                            VarType::Byte => Op::PshByte,
                        });
                        argbytes += ty.size();
                    }
                    Mode::Interpret => newlocals.push(NewLocal::Scalar(fkey, ty, v)),
                }
            } else {
                // Array pass-by-reference: the actual must be an array
                // variable of the same element type.
                if !self.cursor.peek().is_some_and(is_alpha) {
                    return Err(Error::Var);
                }
                let (akey, _) = self.cursor.scan_ident();
                let (i, _) = self.vars.find(&akey, false).ok_or(Error::Var)?;
                let ent = self.vars.ents[i];
                if ent.ty != ty || ent.dims == 0 {
                    return Err(Error::Type);
                }
                match self.mode {
                    Mode::Compile => {
                        // Pass the absolute payload address as a word.
                        match ent.loc {
                            Location::TargetAbs(base) => self.gen.emit_ldi(base),
                            Location::TargetRel(base) => {
                                self.gen.emit_ldi(base as u16);
                                self.gen.emit(Op::Rtoa);
                            }
                            Location::TargetRefSlot(slot) => {
                                self.gen.emit_ldi(slot as u16);
                                self.gen.emit(Op::LdrWord);
                            }
                            Location::Arena(_) => return Err(Error::Var),
                        }
                        self.gen.emit(Op::PshWord);
                        argbytes += 2;
                    }
                    Mode::Interpret => {
                        let Location::Arena(body) = ent.loc else {
                            return Err(Error::Var);
                        };
                        newlocals.push(NewLocal::Array(fkey, ty, ent.dims, ent.size, body));
                    }
                }
            }

            self.cursor.eat_space();
            if self.cursor.peek() == Some(b',') {
                self.cursor.bump();
            }
            self.cursor.eat_space();
            decl.eat_space();
            if decl.peek() == Some(b',') {
                decl.bump();
            }
        }
        self.cursor.eat_space();
        self.cursor.expect(b')')?;
        self.pop_operator_raw();

        match self.mode {
            Mode::Compile => {
                self.gen.emit_ldi(0xffff);
                let site = self.gen.pc - 2;
                self.gen.calls.push(SubEnt {
                    name: sub_name(name),
                    addr: site,
                });
                self.gen.emit(Op::Jsr);
                // The caller drops the argument bytes it pushed; the
                // return value stays on the evaluation stack.
                if argbytes > 0 {
                    self.gen.emit_ldi(argbytes);
                    self.gen.emit(Op::Discard);
                }
            }
            Mode::Interpret => {
                self.flow_push(Frame::Call(CallFrame::Interp {
                    ret: self.cursor.clone(),
                }))?;
                self.vars.mark_call_frame();
                for nl in newlocals {
                    match nl {
                        NewLocal::Scalar(k, ty, v) => {
                            self.vars.create_interp(k, ty, 0, 1, v, None)?
                        }
                        NewLocal::Array(k, ty, dims, size, body) => {
                            self.vars.create_interp(k, ty, dims, size, 0, Some(body))?
                        }
                    }
                }
                // Resume just after the formal list so one-line subs work.
                self.cursor = decl;
            }
        }
        Ok(())
    }

    /// Return from a subroutine with a value.
    pub(crate) fn doreturn(&mut self, val: u16) -> Result<(), Error> {
        match self.mode {
            Mode::Compile => {
                // Each for loop still open at this point holds two words
                // (its limit and the iteration copy) on the evaluation
                // stack beneath the return value; drop them.
                let open_fors = self
                    .flow
                    .iter()
                    .filter(|f| matches!(f, Frame::For(ForFrame::Compile { .. })))
                    .count();
                for _ in 0..open_fors * 2 {
                    self.gen.emit(Op::Swap);
                    self.gen.emit(Op::Drop);
                }
                // Value is on the evaluation stack; drop the locals and go.
                self.gen.emit(Op::FpToSp);
                self.gen.emit(Op::Rts);
                Ok(())
            }
            Mode::Interpret => {
                // Unwind any inner loop/if frames down to the activation.
                let idx = self
                    .flow
                    .iter()
                    .rposition(|f| matches!(f, Frame::Call(CallFrame::Interp { .. })))
                    .ok_or(Error::Stack)?;
                let Frame::Call(CallFrame::Interp { ret }) = self.flow[idx].clone() else {
                    unreachable!();
                };
                self.flow.truncate(idx);
                self.ret_register = val;
                self.vars.delete_call_frame();
                self.cursor = ret;
                Ok(())
            }
        }
    }

    pub(crate) fn flow_push(&mut self, frame: Frame) -> Result<(), Error> {
        if self.flow.len() >= FLOW_STACK_FRAMES {
            return Err(Error::Stack);
        }
        self.flow.push(frame);
        Ok(())
    }

    pub(crate) fn reset_expr_stacks(&mut self) {
        self.operators.clear();
        self.operators.push(OpTok::Sentinel);
        self.operands.clear();
    }

    /// Report a program-level error or break, then reset engine state the
    /// way the outermost prompt expects it.
    fn report_run_error(&mut self, e: &Error) {
        let line = self
            .cursor
            .line
            .map(|i| (i + 1) as i64)
            .unwrap_or(-1);
        if *e == Error::Interrupted {
            let _ = writeln!(self.out, "\nBrk at {}", line);
        } else {
            let _ = writeln!(self.out, "?{} err at {}", e, line);
        }
        self.reset_after_error();
    }

    fn reset_after_error(&mut self) {
        self.flow.clear();
        self.skip = false;
        self.sub_skip = false;
        self.vars.unwind_frames();
        self.reset_expr_stacks();
    }

    pub(crate) fn print_dec(&mut self, v: u16) {
        let _ = write!(self.out, "{}", v);
    }

    pub(crate) fn print_hex(&mut self, v: u16) {
        let _ = write!(self.out, "${:04x}", v);
    }

    pub(crate) fn print_ch(&mut self, c: u8) {
        let _ = self.out.write_all(&[c]);
    }

    /// Dump the variable table.
    fn print_vars(&mut self) {
        for i in 0..self.vars.ents.len() {
            let ent = self.vars.ents[i];
            let mut line = String::new();
            for &b in &ent.name {
                line.push(if b == 0 { ' ' } else { b as char });
            }
            if ent.dims != 0 {
                line.push_str(&format!("[{}]", ent.size));
            }
            line.push(' ');
            line.push(match ent.ty {
                VarType::Word => 'w',
                VarType::Byte => 'b',
            });
            if ent.dims == 0 && !ent.is_sentinel() {
                let v = match ent.loc {
                    Location::Arena(off) => match ent.ty {
                        VarType::Word => self.vars.arena.peek_word(off),
                        VarType::Byte => self.vars.arena.peek_byte(off) as u16,
                    },
                    Location::TargetAbs(a) => a,
                    Location::TargetRel(a) | Location::TargetRefSlot(a) => a as u16,
                };
                line.push_str(&format!(" {}", v));
            }
            let _ = writeln!(self.out, "{}", line);
        }
    }
}

/// Target address bits and whether they are FP-relative.
pub(crate) fn target_addr(ent: &VarEnt) -> Result<(u16, bool), Error> {
    match ent.loc {
        Location::TargetAbs(a) => Ok((a, false)),
        Location::TargetRel(a) => Ok((a as u16, true)),
        _ => Err(Error::Type),
    }
}

pub(crate) fn load_op(relative: bool, ty: VarType) -> Op {
    match (relative, ty) {
        (false, VarType::Word) => Op::LdaWord,
        (false, VarType::Byte) => Op::LdaByte,
        (true, VarType::Word) => Op::LdrWord,
        (true, VarType::Byte) => Op::LdrByte,
    }
}

pub(crate) fn store_op(relative: bool, ty: VarType) -> Op {
    match (relative, ty) {
        (false, VarType::Word) => Op::StaWord,
        (false, VarType::Byte) => Op::StaByte,
        (true, VarType::Word) => Op::StrWord,
        (true, VarType::Byte) => Op::StrByte,
    }
}

fn read_key() -> u8 {
    let mut b = [0u8; 1];
    match io::stdin().read(&mut b) {
        Ok(1) => b[0],
        _ => 0,
    }
}

fn read_input_line() -> String {
    let mut s = String::new();
    let _ = io::stdin().read_line(&mut s);
    while s.ends_with('\n') || s.ends_with('\r') {
        s.pop();
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> Engine<Vec<u8>> {
        Engine::new(Vec::new())
    }

    fn output(e: &Engine<Vec<u8>>) -> String {
        String::from_utf8(e.out.clone()).unwrap()
    }

    #[test]
    fn test_print_statements() {
        let mut e = engine();
        assert_eq!(e.exec_line("pr.dec 42; pr.ch 32; pr.hex 255; pr.nl"), ReplStatus::Ok);
        assert_eq!(output(&e), "42 $00ff\n");
    }

    #[test]
    fn test_assignment_and_lookup() {
        let mut e = engine();
        e.exec_line("word x = 7");
        e.exec_line("x = x + 1");
        e.exec_line("pr.dec x");
        assert_eq!(output(&e), "8");
    }

    #[test]
    fn test_byte_truncates() {
        let mut e = engine();
        e.exec_line("byte b = 300");
        e.exec_line("pr.dec b");
        assert_eq!(output(&e), "44");
    }

    #[test]
    fn test_array_subscripts() {
        let mut e = engine();
        e.exec_line("word a[3] = 5");
        e.exec_line("a[1] = 9");
        e.exec_line("pr.dec a[0]; pr.dec a[1]; pr.dec a[2]");
        assert_eq!(output(&e), "595");
    }

    #[test]
    fn test_subscript_out_of_range() {
        let mut e = engine();
        e.exec_line("word a[3] = 0");
        assert_eq!(e.exec_line("a[3] = 1"), ReplStatus::Err);
        assert!(output(&e).contains("?bad subscript"));
    }

    #[test]
    fn test_if_else_immediate() {
        let mut e = engine();
        e.exec_line("word x = 7");
        e.exec_line("if x > 5; pr.msg \"big\"; else; pr.msg \"small\"; endif");
        assert_eq!(output(&e), "big");
    }

    #[test]
    fn test_if_false_path() {
        let mut e = engine();
        e.exec_line("word x = 3");
        e.exec_line("if x > 5; pr.msg \"big\"; else; pr.msg \"small\"; endif");
        assert_eq!(output(&e), "small");
    }

    #[test]
    fn test_nested_if_while_skipped() {
        let mut e = engine();
        e.exec_line("word x = 0");
        e.exec_line("if x; while 1; pr.msg \"no\"; endwhile; endif; pr.msg \"yes\"");
        assert_eq!(output(&e), "yes");
    }

    #[test]
    fn test_endif_without_if() {
        let mut e = engine();
        assert_eq!(e.exec_line("endif"), ReplStatus::Err);
        assert!(output(&e).contains("?no if"));
    }

    #[test]
    fn test_endwhile_without_while() {
        let mut e = engine();
        assert_eq!(e.exec_line("endwhile"), ReplStatus::Err);
        assert!(output(&e).contains("?no while"));
    }

    #[test]
    fn test_endfor_without_for() {
        let mut e = engine();
        assert_eq!(e.exec_line("endfor"), ReplStatus::Err);
        assert!(output(&e).contains("?no for"));
    }

    #[test]
    fn test_while_loop_immediate() {
        let mut e = engine();
        e.exec_line("word n = 1; word s = 0");
        e.exec_line("while n <= 10; s = s + n; n = n + 1; endwhile");
        e.exec_line("pr.dec s");
        assert_eq!(output(&e), "55");
    }

    #[test]
    fn test_for_loop_immediate() {
        let mut e = engine();
        e.exec_line("byte i = 0");
        e.exec_line("for i = 1:5; pr.dec i; pr.ch 32; endfor");
        assert_eq!(output(&e), "1 2 3 4 5 ");
    }

    #[test]
    fn test_for_runs_once_when_limit_equals_init() {
        let mut e = engine();
        e.exec_line("word i = 0");
        e.exec_line("for i = 3:3; pr.dec i; endfor");
        assert_eq!(output(&e), "3");
    }

    #[test]
    fn test_run_program_with_sub() {
        let mut e = engine();
        e.program.push("sub sq(word x); return x*x; endsub");
        e.program.push("pr.dec sq(6); pr.nl");
        e.exec_line("run");
        assert_eq!(output(&e), "36\n");
    }

    #[test]
    fn test_call_statement_and_globals() {
        let mut e = engine();
        e.program.push("word g = 0");
        e.program.push("sub bump(word n); g = g + n; return 0; endsub");
        e.program.push("call bump(5)");
        e.program.push("call bump(7)");
        e.program.push("pr.dec g");
        e.exec_line("run");
        assert_eq!(output(&e), "12");
    }

    #[test]
    fn test_array_pass_by_reference() {
        let mut e = engine();
        e.program.push("word a[3] = 0");
        e.program
            .push("sub fill(word v[]); v[0]=10; v[1]=20; v[2]=30; return 0; endsub");
        e.program.push("call fill(a)");
        e.program.push("pr.dec a[0]; pr.ch 32; pr.dec a[1]; pr.ch 32; pr.dec a[2]");
        e.exec_line("run");
        assert_eq!(output(&e), "10 20 30");
    }

    #[test]
    fn test_local_shadows_global_in_sub() {
        let mut e = engine();
        e.program.push("word x = 1");
        e.program.push("sub f(word y); word x = 100; return x + y; endsub");
        e.program.push("pr.dec f(5); pr.ch 32; pr.dec x");
        e.exec_line("run");
        assert_eq!(output(&e), "105 1");
    }

    #[test]
    fn test_locals_released_after_return() {
        let mut e = engine();
        e.program.push("sub f(word y); word loc = 3; return y; endsub");
        e.program.push("pr.dec f(1)");
        e.program.push("pr.dec loc");
        e.exec_line("run");
        assert!(output(&e).contains("?variable name expected"));
    }

    #[test]
    fn test_return_unwinds_inner_frames() {
        let mut e = engine();
        e.program.push("sub f(word n); if n > 0; return 1; endif; return 2; endsub");
        e.program.push("pr.dec f(5); pr.dec f(0)");
        e.exec_line("run");
        assert_eq!(output(&e), "12");
    }

    #[test]
    fn test_call_arity_mismatch() {
        let mut e = engine();
        e.program.push("sub f(word a, word b); return a+b; endsub");
        e.program.push("call f(1)");
        e.exec_line("run");
        assert!(output(&e).contains("?argument"));
    }

    #[test]
    fn test_array_arg_type_mismatch() {
        let mut e = engine();
        e.program.push("byte a[4] = 0");
        e.program.push("sub f(word v[]); return 0; endsub");
        e.program.push("call f(a)");
        e.exec_line("run");
        assert!(output(&e).contains("?type"));
    }

    #[test]
    fn test_pr_dec_s() {
        let mut e = engine();
        e.exec_line("pr.dec.s 65535; pr.ch 32; pr.dec.s 7");
        assert_eq!(output(&e), "-1 7");
    }

    #[test]
    fn test_poke_and_deref() {
        let mut e = engine();
        e.exec_line("*$1000 = 513; pr.dec ^$1000; pr.ch 32; pr.dec ^$1001");
        assert_eq!(output(&e), "1 2");
    }

    #[test]
    fn test_address_of_variable() {
        let mut e = engine();
        e.exec_line("word x = 99");
        e.exec_line("pr.dec *&x");
        assert_eq!(output(&e), "99");
    }

    #[test]
    fn test_editor_append_delete_list() {
        let mut e = engine();
        e.program.push("pr.dec 1");
        e.program.push("pr.dec 2");
        e.program.push("pr.dec 3");
        e.exec_line(":d 2");
        e.exec_line(":l");
        assert_eq!(output(&e), "1 pr.dec 1\n2 pr.dec 3\n");
    }

    #[test]
    fn test_editor_delete_line_zero_is_noop() {
        let mut e = engine();
        e.program.push("pr.dec 1");
        assert_eq!(e.exec_line(":d 0"), ReplStatus::Ok);
        assert_eq!(e.program.len(), 1);
    }

    #[test]
    fn test_editor_change_does_not_execute() {
        let mut e = engine();
        e.program.push("pr.dec 1");
        e.exec_line(":c 1:pr.dec 9");
        assert_eq!(output(&e), "");
        e.exec_line("run");
        assert_eq!(output(&e), "9");
    }

    #[test]
    fn test_flow_residue_reported_at_prompt() {
        let mut e = engine();
        assert_eq!(e.exec_line("if 1"), ReplStatus::Err);
        assert!(output(&e).contains("?stack"));
        // and the stack was reset
        assert!(e.flow.is_empty());
    }

    #[test]
    fn test_clear_wipes_variables() {
        let mut e = engine();
        e.exec_line("word x = 1");
        e.exec_line("clear");
        assert_eq!(e.exec_line("pr.dec x"), ReplStatus::Err);
    }

    #[test]
    fn test_division_by_zero() {
        let mut e = engine();
        assert_eq!(e.exec_line("pr.dec 1/0"), ReplStatus::Err);
        assert!(output(&e).contains("?div by zero"));
    }

    #[test]
    fn test_sequential_sub_is_skipped() {
        let mut e = engine();
        e.program.push("sub f(word x); pr.msg \"body\"; return 0; endsub");
        e.program.push("pr.msg \"main\"");
        e.exec_line("run");
        assert_eq!(output(&e), "main");
    }

    #[test]
    fn test_endsub_at_prompt_is_an_error() {
        let mut e = engine();
        assert_eq!(e.exec_line("endsub"), ReplStatus::Err);
        assert!(output(&e).contains("?ran into sub"));
    }

    #[test]
    fn test_error_reports_program_line() {
        let mut e = engine();
        e.program.push("pr.dec 1");
        e.program.push("pr.dec 1/0");
        e.exec_line("run");
        assert!(output(&e).contains("?div by zero err at 2"));
    }

    #[test]
    fn test_quit_returns_status() {
        let mut e = engine();
        assert_eq!(e.exec_line("quit"), ReplStatus::Quit);
        assert_eq!(output(&e), "Bye!\n");
    }

    #[test]
    fn test_quit_stops_rest_of_line() {
        let mut e = engine();
        assert_eq!(e.exec_line("pr.dec 1; quit; pr.dec 2"), ReplStatus::Quit);
        assert_eq!(output(&e), "1Bye!\n");
    }

    #[test]
    fn test_quit_stops_program_run() {
        let mut e = engine();
        e.program.push("pr.dec 1");
        e.program.push("quit");
        e.program.push("pr.dec 2");
        assert_eq!(e.exec_line("run"), ReplStatus::Quit);
        assert_eq!(output(&e), "1Bye!\n");
    }

    #[test]
    fn test_quit_in_compiled_program_stops_the_vm() {
        let mut e = engine();
        e.program.push("pr.dec 1");
        e.program.push("quit");
        e.program.push("pr.dec 2");
        let image = e.compile_program().unwrap();
        let mut vm = crate::vm::Vm::new(Vec::new());
        vm.load_image(&image);
        vm.run().unwrap();
        assert_eq!(String::from_utf8(vm.out).unwrap(), "1");
    }

    #[test]
    fn test_engine_usable_after_quit() {
        let mut e = engine();
        assert_eq!(e.exec_line("quit"), ReplStatus::Quit);
        assert_eq!(e.exec_line("pr.dec 5"), ReplStatus::Ok);
        assert_eq!(output(&e), "Bye!\n5");
    }
}
