//! Error types for the code-object subsystem.
//!
//! Three kinds of failure arise here and they are kept distinct:
//! verifier rejections ([`VerifyError`]), the failure sentinels of
//! internalize-gated operations ([`CodeError`]), and execution failures
//! ([`RuntimeError`]). Absence (a name not bound, no enclosing frame) is
//! never an error; those paths return `Option`.

use std::fmt;

/// Result alias for execution paths.
pub type VmResult<T> = Result<T, RuntimeError>;

// =============================================================================
// Verification
// =============================================================================

/// A bytecode body the verifier rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyError {
    /// A word whose opcode field names no instruction.
    UnknownOpcode {
        /// Offset of the offending word.
        ip: u32,
        /// The unrecognized opcode byte.
        opcode: u8,
    },
    /// An instruction whose operands run past the end of the stream.
    Truncated {
        /// Offset of the truncated instruction.
        ip: u32,
    },
    /// An operand indexing outside the literal pool.
    LiteralOutOfRange {
        /// Offset of the instruction.
        ip: u32,
        /// The out-of-range index.
        index: u64,
    },
    /// A branch to something other than an instruction boundary.
    InvalidJumpTarget {
        /// Offset of the branch instruction.
        ip: u32,
        /// The rejected target.
        target: u64,
    },
}

impl fmt::Display for VerifyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VerifyError::UnknownOpcode { ip, opcode } => {
                write!(f, "unknown opcode {:#04x} at ip {}", opcode, ip)
            }
            VerifyError::Truncated { ip } => {
                write!(f, "truncated instruction at ip {}", ip)
            }
            VerifyError::LiteralOutOfRange { ip, index } => {
                write!(f, "literal index {} out of range at ip {}", index, ip)
            }
            VerifyError::InvalidJumpTarget { ip, target } => {
                write!(f, "jump from ip {} to invalid target {}", ip, target)
            }
        }
    }
}

impl std::error::Error for VerifyError {}

// =============================================================================
// Code-object failure sentinels
// =============================================================================

/// Failure sentinel returned by operations that require an internalized
/// code object (breakpoint administration, call-site enumeration).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodeError {
    /// Internalization failed because the verifier rejected the body.
    Verify(VerifyError),
    /// The given ip is not an instruction boundary.
    InvalidIp {
        /// The rejected ip.
        ip: u32,
    },
}

impl fmt::Display for CodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodeError::Verify(err) => write!(f, "bytecode verification failed: {}", err),
            CodeError::InvalidIp { ip } => write!(f, "ip {} is not an instruction boundary", ip),
        }
    }
}

impl std::error::Error for CodeError {}

impl From<VerifyError> for CodeError {
    fn from(err: VerifyError) -> Self {
        CodeError::Verify(err)
    }
}

// =============================================================================
// Runtime errors
// =============================================================================

/// An execution failure propagating out of a dispatch entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    /// A language-level exception raised and not rescued.
    Raise {
        /// The exception message.
        message: String,
    },
    /// Argument count outside the code's declared shape.
    ArgumentCount {
        /// Arguments actually supplied.
        given: u32,
        /// Minimum the code accepts.
        required: u32,
        /// Maximum the code accepts (ignoring splat).
        total: u32,
    },
    /// Internalization failed inside a dispatch entry.
    Code(CodeError),
    /// A toplevel script raised; carries the formatted diagnostic line.
    Toplevel {
        /// The single-line diagnostic.
        diagnostic: String,
    },
    /// The operation needs a collaborator this build does not provide.
    Unsupported {
        /// What was attempted.
        what: &'static str,
    },
    /// An internal inconsistency that is recoverable for the caller.
    Internal {
        /// Description of the inconsistency.
        message: String,
    },
}

impl RuntimeError {
    /// A raised exception.
    pub fn raise(message: impl Into<String>) -> RuntimeError {
        RuntimeError::Raise {
            message: message.into(),
        }
    }

    /// An internal inconsistency.
    pub fn internal(message: impl Into<String>) -> RuntimeError {
        RuntimeError::Internal {
            message: message.into(),
        }
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeError::Raise { message } => write!(f, "{}", message),
            RuntimeError::ArgumentCount {
                given,
                required,
                total,
            } => write!(
                f,
                "wrong number of arguments (given {}, expected {}..{})",
                given, required, total
            ),
            RuntimeError::Code(err) => write!(f, "{}", err),
            RuntimeError::Toplevel { diagnostic } => write!(f, "{}", diagnostic),
            RuntimeError::Unsupported { what } => write!(f, "{} is not supported here", what),
            RuntimeError::Internal { message } => write!(f, "internal error: {}", message),
        }
    }
}

impl std::error::Error for RuntimeError {}

impl From<CodeError> for RuntimeError {
    fn from(err: CodeError) -> Self {
        RuntimeError::Code(err)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verify_error_display() {
        let err = VerifyError::UnknownOpcode { ip: 4, opcode: 0xfe };
        assert_eq!(err.to_string(), "unknown opcode 0xfe at ip 4");
    }

    #[test]
    fn test_code_error_wraps_verify() {
        let err: CodeError = VerifyError::Truncated { ip: 2 }.into();
        assert!(matches!(err, CodeError::Verify(_)));
        assert!(err.to_string().contains("truncated"));
    }

    #[test]
    fn test_argument_count_display() {
        let err = RuntimeError::ArgumentCount {
            given: 3,
            required: 1,
            total: 2,
        };
        assert_eq!(
            err.to_string(),
            "wrong number of arguments (given 3, expected 1..2)"
        );
    }

    #[test]
    fn test_runtime_from_code_error() {
        let err: RuntimeError = CodeError::InvalidIp { ip: 9 }.into();
        assert!(matches!(err, RuntimeError::Code(CodeError::InvalidIp { ip: 9 })));
    }
}
