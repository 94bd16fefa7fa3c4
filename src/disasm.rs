//! Bytecode disassembler

use std::io::{self, Write};

use crate::bytecode::{Op, PC_START};

/// Render a bytecode image, one instruction per line.  Word operands are
/// decoded little-endian; `PRMSG` shows its inline string.
pub fn disassemble(image: &[u8], out: &mut dyn Write) -> io::Result<()> {
    let mut pc = 0usize;
    while pc < image.len() {
        let addr = PC_START as usize + pc;
        match Op::try_from(image[pc]) {
            Err(_) => {
                writeln!(out, "${:04x}: ??? ${:02x}", addr, image[pc])?;
                pc += 1;
            }
            Ok(Op::PrMsg) => {
                write!(out, "${:04x}: {} \"", addr, Op::PrMsg.mnemonic())?;
                pc += 1;
                while pc < image.len() && image[pc] != 0 {
                    out.write_all(&[image[pc]])?;
                    pc += 1;
                }
                writeln!(out, "\"")?;
                pc += 1;
            }
            Ok(op) if op.has_word_operand() => {
                if pc + 2 >= image.len() {
                    writeln!(out, "${:04x}: {} <truncated>", addr, op.mnemonic())?;
                    break;
                }
                let w = u16::from_le_bytes([image[pc + 1], image[pc + 2]]);
                writeln!(out, "${:04x}: {} ${:04x}", addr, op.mnemonic(), w)?;
                pc += 3;
            }
            Ok(op) => {
                writeln!(out, "${:04x}: {}", addr, op.mnemonic())?;
                pc += 1;
            }
        }
    }
    Ok(())
}
