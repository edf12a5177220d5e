//! Bytecode verification.
//!
//! Pure structural validation of a code body, run exactly once per code
//! object before its first interpretation. Two passes: decode instruction
//! boundaries, then check every operand against them and against the
//! literal pool.

use crate::bytecode::Opcode;
use crate::code::CompiledCode;
use crate::error::VerifyError;

/// Verify a code object's bytecode body.
pub fn verify_bytecode(code: &CompiledCode) -> Result<(), VerifyError> {
    let words = code.bytecode();
    let literals = code.literals_len() as u64;

    // Pass 1: decode boundaries.
    let mut boundaries = Vec::new();
    let mut ip = 0usize;
    while ip < words.len() {
        let opcode = match Opcode::from_word(words[ip]) {
            Some(op) => op,
            None => {
                return Err(VerifyError::UnknownOpcode {
                    ip: ip as u32,
                    opcode: words[ip] as u8,
                })
            }
        };
        if ip + opcode.width() > words.len() {
            return Err(VerifyError::Truncated { ip: ip as u32 });
        }
        boundaries.push(ip as u32);
        ip += opcode.width();
    }

    // Pass 2: operand checks.
    for &start in boundaries.iter() {
        let ip = start as usize;
        let opcode = Opcode::from_word(words[ip]).expect("pass 1 accepted this word");
        match opcode {
            Opcode::PushLiteral | Opcode::Send | Opcode::LoadConst => {
                let index = words[ip + 1];
                if index >= literals {
                    return Err(VerifyError::LiteralOutOfRange {
                        ip: start,
                        index,
                    });
                }
            }
            Opcode::Goto => {
                let target = words[ip + 1];
                let valid = target <= u32::MAX as u64
                    && boundaries.binary_search(&(target as u32)).is_ok();
                if !valid {
                    return Err(VerifyError::InvalidJumpTarget { ip: start, target });
                }
            }
            Opcode::Noop | Opcode::PushValue | Opcode::Return => {}
        }
    }

    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
