//! Loadable code units and their registration-time validation.
//!
//! A module is a flat instruction stream plus a constant table, a function
//! table of offsets into that stream, and one source line per instruction
//! for diagnostics. The structural rules the engine depends on (defer bodies
//! contain no `Return` and no nested defer, paral bodies are branch lists,
//! every function ends in `ExitFrame`) are checked once when the module is
//! registered, never during execution.

use std::cell::RefCell;
use std::rc::Rc;

use rustc_hash::FxHashMap;

use crate::error::VmError;
use crate::opcode::{BlockKind, Op};
use crate::value::closure::FuncAddr;
use crate::value::heap::Value;

/// How a lambda binds one outer-scope variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capture {
    /// Snapshot the slot's value at closure creation.
    Copy(u8),
    /// Share the slot's cell; the slot must have been boxed with `BoxVar`.
    Cell(u8),
}

impl Capture {
    pub fn slot(&self) -> u8 {
        match self {
            Capture::Copy(s) | Capture::Cell(s) => *s,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FuncDef {
    pub name: Rc<str>,
    /// First instruction of the body.
    pub entry_ip: usize,
    /// The function's `ExitFrame` instruction; `Return` jumps here.
    pub exit_ip: usize,
    pub args_num: u8,
    /// Total local slots, including capture slots.
    pub locals_num: u8,
    /// Captured variables, installed into leading local slots in order.
    pub captures: Vec<Capture>,
}

#[derive(Debug)]
pub struct Module {
    pub name: Rc<str>,
    /// Source file name used in stack traces.
    pub file: Rc<str>,
    pub code: Vec<Op>,
    /// Source line per instruction, parallel to `code`.
    pub lines: Vec<u32>,
    pub constants: Vec<Value>,
    pub funcs: Vec<FuncDef>,
    by_name: FxHashMap<Rc<str>, usize>,
}

impl Module {
    pub fn new(
        name: impl AsRef<str>,
        file: impl AsRef<str>,
        code: Vec<Op>,
        lines: Vec<u32>,
        constants: Vec<Value>,
        funcs: Vec<FuncDef>,
    ) -> Self {
        let by_name = funcs
            .iter()
            .enumerate()
            .map(|(i, f)| (Rc::clone(&f.name), i))
            .collect();
        Module {
            name: Rc::from(name.as_ref()),
            file: Rc::from(file.as_ref()),
            code,
            lines,
            constants,
            funcs,
            by_name,
        }
    }

    pub fn func_idx(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }

    /// Source line for an instruction, 0 when out of range.
    pub fn line_at(&self, ip: usize) -> u32 {
        self.lines.get(ip).copied().unwrap_or(0)
    }

    fn err(&self, reason: impl Into<String>) -> VmError {
        VmError::invalid_module(self.name.as_ref(), reason)
    }

    /// Structural validation run at registration.
    pub fn validate(&self) -> Result<(), VmError> {
        if self.lines.len() != self.code.len() {
            return Err(self.err(format!(
                "line table length {} does not match code length {}",
                self.lines.len(),
                self.code.len()
            )));
        }
        for func in &self.funcs {
            if func.entry_ip > func.exit_ip || func.exit_ip >= self.code.len() {
                return Err(self.err(format!("function '{}' has a bad code range", func.name)));
            }
            if self.code[func.exit_ip] != Op::ExitFrame {
                return Err(self.err(format!(
                    "function '{}' does not end in an exit instruction",
                    func.name
                )));
            }
            if (func.captures.len() + func.args_num as usize) > func.locals_num as usize {
                return Err(self.err(format!(
                    "function '{}' declares fewer locals than captures and args",
                    func.name
                )));
            }
        }
        for (ip, op) in self.code.iter().enumerate() {
            match *op {
                Op::Constant(idx) => {
                    if idx as usize >= self.constants.len() {
                        return Err(self.err(format!("constant index {} out of range", idx)));
                    }
                }
                Op::Jump(target) | Op::JumpZ(target) | Op::DefArg(_, target) => {
                    if target >= self.code.len() {
                        return Err(self.err(format!("jump target {} out of range", target)));
                    }
                }
                Op::Block(kind, len) => {
                    if ip + len >= self.code.len() {
                        return Err(self.err(format!("block at {} runs past end of code", ip)));
                    }
                    match kind {
                        BlockKind::Defer => self.validate_defer_body(ip, len)?,
                        BlockKind::Paral | BlockKind::ParalAll => {
                            self.validate_paral_body(ip, len)?
                        }
                        BlockKind::Seq => {}
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// A defer body may not return and may not register another defer
    /// directly inside itself. Lambdas referenced from the body are separate
    /// functions and stay free to do both.
    fn validate_defer_body(&self, ip: usize, len: usize) -> Result<(), VmError> {
        for j in ip + 1..=ip + len {
            match self.code[j] {
                Op::Return(_) => {
                    return Err(self.err(format!("return inside defer body at {}", j)));
                }
                Op::Block(BlockKind::Defer, _) => {
                    return Err(self.err(format!("defer nested inside defer body at {}", j)));
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// A paral body is a branch list: consecutive `Seq` sub-blocks, with
    /// block-level `Defer` sub-blocks allowed between them.
    fn validate_paral_body(&self, ip: usize, len: usize) -> Result<(), VmError> {
        let end = ip + len;
        let mut j = ip + 1;
        let mut branches = 0usize;
        while j <= end {
            match self.code[j] {
                Op::Block(BlockKind::Seq, blen) => {
                    if j + blen > end {
                        return Err(self.err(format!("paral branch at {} overruns block", j)));
                    }
                    branches += 1;
                    j += blen + 1;
                }
                Op::Block(BlockKind::Defer, blen) => {
                    if j + blen > end {
                        return Err(self.err(format!("paral defer at {} overruns block", j)));
                    }
                    j += blen + 1;
                }
                _ => {
                    return Err(self.err(format!(
                        "paral body at {} contains a bare instruction; branches must be blocks",
                        j
                    )));
                }
            }
        }
        if branches == 0 {
            return Err(self.err(format!("paral block at {} has no branches", ip)));
        }
        Ok(())
    }
}

/// A host-visible class: field count, vtable of script methods, and shared
/// static storage.
#[derive(Debug)]
pub struct ClassDef {
    pub name: Rc<str>,
    pub fields_num: usize,
    /// Virtual-slot table; a subclass registers its own `ClassDef` whose
    /// table carries the overridden entries.
    pub vtable: Vec<FuncAddr>,
    pub statics: RefCell<Vec<Value>>,
}

impl ClassDef {
    pub fn new(name: impl AsRef<str>, fields_num: usize, vtable: Vec<FuncAddr>) -> Self {
        ClassDef {
            name: Rc::from(name.as_ref()),
            fields_num,
            vtable,
            statics: RefCell::new(Vec::new()),
        }
    }

    pub fn with_statics(self, statics: Vec<Value>) -> Self {
        *self.statics.borrow_mut() = statics;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opcode::ArgsInfo;

    fn module(code: Vec<Op>, funcs: Vec<FuncDef>) -> Module {
        let lines = vec![1; code.len()];
        Module::new("m", "m.ski", code, lines, vec![Value::Num(0.0)], funcs)
    }

    fn func(name: &str, entry: usize, exit: usize) -> FuncDef {
        FuncDef {
            name: Rc::from(name),
            entry_ip: entry,
            exit_ip: exit,
            args_num: 0,
            locals_num: 0,
            captures: Vec::new(),
        }
    }

    #[test]
    fn test_valid_module_passes() {
        let m = module(
            vec![Op::Constant(0), Op::Return(1), Op::ExitFrame],
            vec![func("main", 0, 2)],
        );
        assert!(m.validate().is_ok());
    }

    #[test]
    fn test_missing_exit_rejected() {
        let m = module(vec![Op::Constant(0), Op::Nop], vec![func("main", 0, 1)]);
        assert!(m.validate().is_err());
    }

    #[test]
    fn test_return_in_defer_rejected() {
        let m = module(
            vec![
                Op::Block(BlockKind::Defer, 1),
                Op::Return(0),
                Op::ExitFrame,
            ],
            vec![func("main", 0, 2)],
        );
        let err = m.validate().unwrap_err();
        assert!(err.to_string().contains("return inside defer"));
    }

    #[test]
    fn test_nested_defer_rejected() {
        let m = module(
            vec![
                Op::Block(BlockKind::Defer, 2),
                Op::Block(BlockKind::Defer, 1),
                Op::Nop,
                Op::ExitFrame,
            ],
            vec![func("main", 0, 3)],
        );
        let err = m.validate().unwrap_err();
        assert!(err.to_string().contains("defer nested inside defer"));
    }

    #[test]
    fn test_paral_requires_branch_blocks() {
        let m = module(
            vec![Op::Block(BlockKind::Paral, 1), Op::Nop, Op::ExitFrame],
            vec![func("main", 0, 2)],
        );
        let err = m.validate().unwrap_err();
        assert!(err.to_string().contains("branches must be blocks"));

        let ok = module(
            vec![
                Op::Block(BlockKind::Paral, 2),
                Op::Block(BlockKind::Seq, 1),
                Op::Nop,
                Op::ExitFrame,
            ],
            vec![func("main", 0, 3)],
        );
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn test_bad_jump_target_rejected() {
        let m = module(
            vec![Op::Jump(99), Op::ExitFrame],
            vec![func("main", 0, 1)],
        );
        assert!(m.validate().is_err());
    }

    #[test]
    fn test_call_args_unused_in_validation() {
        // Calls are resolved against VM registries at run time; validation
        // only cares about stream structure.
        let m = module(
            vec![Op::CallNative(7, ArgsInfo::new(2)), Op::ExitFrame],
            vec![func("main", 0, 1)],
        );
        assert!(m.validate().is_ok());
    }
}
