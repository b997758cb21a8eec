//! Call frames.
//!
//! A frame is immutable after construction except for its local slots, which
//! sit behind a `RefCell` so that sequence and paral-branch executions
//! referencing the same frame observe each other's writes. Frames are shared
//! by `Rc`: the owning exec's frame list holds one reference, the frame's
//! region holds another, and nested block executions borrow more.

use std::cell::RefCell;
use std::rc::Rc;

use crate::error::VmError;
use crate::module::{FuncDef, Module};
use crate::opcode::ArgsInfo;
use crate::value::heap::Value;

/// `return_ip` of a fiber's root frame; one past it is never executed
/// because the root region is gone by then.
pub(crate) const NO_IP: usize = usize::MAX - 1;

#[derive(Debug)]
pub struct Frame {
    pub module: Rc<Module>,
    pub func_idx: usize,
    pub locals: RefCell<Vec<Value>>,
    pub args_info: ArgsInfo,
    /// Instruction of the call that created this frame.
    pub return_ip: usize,
    /// Operand-stack depth at entry; everything above it belongs to the
    /// callee and is truncated on exit.
    pub stack_base: usize,
}

impl Frame {
    pub fn func(&self) -> &FuncDef {
        &self.module.funcs[self.func_idx]
    }

    pub fn name(&self) -> &str {
        &self.func().name
    }

    pub fn exit_ip(&self) -> usize {
        self.func().exit_ip
    }

    pub fn local(&self, slot: u8) -> Result<Value, VmError> {
        let locals = self.locals.borrow();
        locals
            .get(slot as usize)
            .cloned()
            .ok_or_else(|| VmError::index_out_of_bounds("local", slot as usize, locals.len()))
    }

    pub fn set_local(&self, slot: u8, v: Value) -> Result<(), VmError> {
        let mut locals = self.locals.borrow_mut();
        let len = locals.len();
        match locals.get_mut(slot as usize) {
            Some(dst) => {
                *dst = v;
                Ok(())
            }
            None => Err(VmError::index_out_of_bounds("local", slot as usize, len)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame() -> Frame {
        let module = Rc::new(Module::new(
            "m",
            "m.ski",
            vec![crate::opcode::Op::ExitFrame],
            vec![1],
            vec![],
            vec![FuncDef {
                name: Rc::from("f"),
                entry_ip: 0,
                exit_ip: 0,
                args_num: 0,
                locals_num: 2,
                captures: vec![],
            }],
        ));
        Frame {
            module,
            func_idx: 0,
            locals: RefCell::new(vec![Value::Null; 2]),
            args_info: ArgsInfo::default(),
            return_ip: NO_IP,
            stack_base: 0,
        }
    }

    #[test]
    fn test_local_roundtrip() {
        let f = frame();
        f.set_local(1, Value::Num(5.0)).unwrap();
        assert_eq!(f.local(1).unwrap(), Value::Num(5.0));
        assert!(f.local(2).is_err());
        assert!(f.set_local(9, Value::Null).is_err());
    }

    #[test]
    fn test_shared_locals_visible_through_clones() {
        let f = Rc::new(frame());
        let alias = Rc::clone(&f);
        f.set_local(0, Value::Num(1.0)).unwrap();
        assert_eq!(alias.local(0).unwrap(), Value::Num(1.0));
    }
}
