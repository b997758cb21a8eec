//! Typed errors surfaced to the host.
//!
//! Script-level failure (the `fail` status) is not an error: it travels as an
//! execution status and leaves the VM usable. `VmError` is for host-level
//! problems: malformed modules, bad registrations, type misuse the code
//! stream should have made impossible, and native callbacks that error out.

use std::error::Error as StdError;
use std::fmt;

/// One entry of a captured stack trace, innermost frame first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceItem {
    pub func: String,
    pub file: String,
    pub line: u32,
}

impl fmt::Display for TraceItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}() (at {}:{})", self.func, self.file, self.line)
    }
}

/// Render a trace the way diagnostics print it, one frame per line.
pub fn format_trace(trace: &[TraceItem]) -> String {
    let mut out = String::new();
    for item in trace {
        out.push_str(&item.to_string());
        out.push('\n');
    }
    out
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VmError {
    /// Module failed registration-time validation.
    InvalidModule {
        module: String,
        reason: String,
    },
    /// A lookup named something the VM has no registration for.
    NotFound {
        what: &'static str,
        name: String,
    },
    /// An operand had the wrong runtime type for the instruction.
    TypeMismatch {
        expected: &'static str,
        got: &'static str,
    },
    /// The operand stack held fewer values than the instruction needs.
    StackUnderflow {
        op: &'static str,
    },
    /// An index was out of range (lists, fields, constants, vtable slots).
    IndexOutOfBounds {
        what: &'static str,
        index: usize,
        len: usize,
    },
    /// A native callback returned an error. The trace is captured at the
    /// point of the error, before cleanup unwinds the fiber.
    Native {
        message: String,
        trace: Vec<TraceItem>,
    },
    /// Execution state violated an engine invariant. Reaching this means a
    /// bug in the VM or a code stream that bypassed validation.
    Internal {
        message: String,
    },
}

impl VmError {
    pub fn invalid_module(module: impl Into<String>, reason: impl Into<String>) -> Self {
        VmError::InvalidModule {
            module: module.into(),
            reason: reason.into(),
        }
    }

    pub fn not_found(what: &'static str, name: impl Into<String>) -> Self {
        VmError::NotFound {
            what,
            name: name.into(),
        }
    }

    pub fn type_mismatch(expected: &'static str, got: &'static str) -> Self {
        VmError::TypeMismatch { expected, got }
    }

    pub fn stack_underflow(op: &'static str) -> Self {
        VmError::StackUnderflow { op }
    }

    pub fn index_out_of_bounds(what: &'static str, index: usize, len: usize) -> Self {
        VmError::IndexOutOfBounds { what, index, len }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        VmError::Internal {
            message: message.into(),
        }
    }

    pub fn native(message: impl Into<String>) -> Self {
        VmError::Native {
            message: message.into(),
            trace: Vec::new(),
        }
    }

    /// Attach a captured trace to a native error that has none yet.
    pub(crate) fn with_trace(self, trace: Vec<TraceItem>) -> Self {
        match self {
            VmError::Native { message, trace: old } if old.is_empty() => {
                VmError::Native { message, trace }
            }
            other => other,
        }
    }

    /// The trace attached to this error, if any.
    pub fn trace(&self) -> &[TraceItem] {
        match self {
            VmError::Native { trace, .. } => trace,
            _ => &[],
        }
    }
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmError::InvalidModule { module, reason } => {
                write!(f, "invalid module '{}': {}", module, reason)
            }
            VmError::NotFound { what, name } => write!(f, "{} not found: '{}'", what, name),
            VmError::TypeMismatch { expected, got } => {
                write!(f, "type mismatch: expected {}, got {}", expected, got)
            }
            VmError::StackUnderflow { op } => write!(f, "operand stack underflow in {}", op),
            VmError::IndexOutOfBounds { what, index, len } => {
                write!(f, "{} index {} out of bounds (len {})", what, index, len)
            }
            VmError::Native { message, trace } => {
                write!(f, "native error: {}", message)?;
                if !trace.is_empty() {
                    write!(f, "\n{}", format_trace(trace))?;
                }
                Ok(())
            }
            VmError::Internal { message } => write!(f, "internal error: {}", message),
        }
    }
}

impl StdError for VmError {}

pub type Result<T> = std::result::Result<T, VmError>;
