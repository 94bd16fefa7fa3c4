//! EightBall — an integer-only procedural language
//!
//! The crate bundles the three pieces that make up the system:
//!
//! - an interactive interpreter with a line editor ([`Engine`]),
//! - a single-pass compiler that emits bytecode for the companion
//!   virtual machine (the `comp` statement / [`Engine::compile_program`]),
//! - the stack-based VM that executes compiled images ([`Vm`]).
//!
//! The interpreter and compiler share one parser; a compiled program
//! produces the same output the interpreter does.

pub mod bytecode;
pub mod compiler;
pub mod disasm;
pub mod engine;
pub mod error;
pub mod expr;
pub mod lexer;
pub mod program;
pub mod vars;
pub mod vm;

pub use engine::{EditMode, Engine, ReplStatus};
pub use error::{Error, VmError};
pub use vm::Vm;
