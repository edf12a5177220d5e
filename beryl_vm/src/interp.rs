//! Reference interpreter entry.
//!
//! The production interpreter is an external collaborator; this is the
//! minimal entry the default environment installs so code objects can be
//! driven end to end (scripts, dispatch routing, breakpoint plumbing).
//! It executes the structural opcodes this core defines and refuses
//! anything that needs the full runtime.

use crate::args::Arguments;
use crate::bytecode::Opcode;
use crate::code::CompiledCode;
use crate::error::{RuntimeError, VmResult};
use crate::thread::VmThread;
use beryl_core::Value;

/// Execute an internalized code object's stream.
pub fn run_bytecode(
    _thread: &mut VmThread,
    code: &CompiledCode,
    _args: &mut Arguments,
) -> VmResult<Value> {
    let Some(mcode) = code.machine_code() else {
        return Err(RuntimeError::internal(
            "interpreter entry reached without machine code",
        ));
    };

    let mut stack: Vec<Value> = Vec::with_capacity(code.stack_size() as usize);
    let mut ip = 0usize;

    while ip < mcode.size() {
        let word = mcode.opcode_word(ip);
        let opcode = Opcode::from_word(word)
            .ok_or_else(|| RuntimeError::internal("unverified word in machine code"))?;
        match opcode {
            Opcode::Noop => ip += 1,
            Opcode::PushLiteral => {
                let index = mcode.opcode_word(ip + 1) as usize;
                stack.push(code.literal(index));
                ip += 2;
            }
            Opcode::PushValue => {
                stack.push(Value::from_raw(mcode.opcode_word(ip + 1)));
                ip += 2;
            }
            Opcode::LoadConst => {
                // No constant cache here; resolve through the literal pool.
                let index = mcode.opcode_word(ip + 1) as usize;
                stack.push(code.literal(index));
                ip += 2;
            }
            Opcode::Goto => {
                ip = mcode.opcode_word(ip + 1) as usize;
            }
            Opcode::Send => {
                return Err(RuntimeError::Unsupported {
                    what: "message send in the reference interpreter",
                });
            }
            Opcode::Return => return Ok(stack.pop().unwrap_or(Value::nil())),
        }
    }

    Ok(stack.pop().unwrap_or(Value::nil()))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::BytecodeBuilder;
    use crate::thread::VmEnv;
    use beryl_core::intern;
    use std::sync::Arc;

    fn run(words: Vec<u64>, literals: Vec<Value>) -> VmResult<Value> {
        let env = Arc::new(VmEnv::new());
        let mut thread = VmThread::new(Arc::clone(&env));
        let mut code = CompiledCode::new(intern("probe"), intern("probe.brl"));
        code.set_bytecode(words);
        code.set_literals(literals);
        code.internalize(&env).unwrap();
        let mut args = Arguments::script(Value::nil());
        run_bytecode(&mut thread, &code, &mut args)
    }

    #[test]
    fn test_returns_literal() {
        let mut b = BytecodeBuilder::new();
        b.push_literal(0).ret();
        let result = run(b.build(), vec![Value::fixnum(42)]).unwrap();
        assert_eq!(result.as_fixnum(), Some(42));
    }

    #[test]
    fn test_returns_embedded_value() {
        let mut b = BytecodeBuilder::new();
        b.push_value(Value::object(0x99)).ret();
        let result = run(b.build(), vec![]).unwrap();
        assert_eq!(result.as_object(), Some(0x99));
    }

    #[test]
    fn test_goto_skips() {
        let mut b = BytecodeBuilder::new();
        b.goto(4); // skip over the first push (ips 2..4)
        b.push_literal(0);
        b.push_literal(1);
        b.ret();
        let result = run(b.build(), vec![Value::fixnum(1), Value::fixnum(2)]).unwrap();
        assert_eq!(result.as_fixnum(), Some(2));
    }

    #[test]
    fn test_empty_body_returns_nil() {
        let result = run(vec![], vec![]).unwrap();
        assert!(result.is_nil());
    }

    #[test]
    fn test_send_is_unsupported() {
        let mut b = BytecodeBuilder::new();
        b.send(0).ret();
        let err = run(b.build(), vec![Value::symbol(intern("inspect"))]).unwrap_err();
        assert!(matches!(err, RuntimeError::Unsupported { .. }));
    }
}
