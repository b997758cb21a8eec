//! Function pointers and closures.
//!
//! A `FuncPtr` targets either a script function (module + function index) or
//! a registered native, plus the values captured when the closure literal
//! executed. By-value captures are snapshots; by-reference captures are
//! `Cell` objects shared with the defining scope. Captures occupy the
//! leading local slots of the materialized frame, so a lambda's argument
//! slots start after them.

use std::fmt;
use std::rc::Rc;

use crate::module::Module;
use crate::value::heap::Value;

/// A script function location: the module it lives in plus its index in the
/// module's function table.
#[derive(Debug, Clone)]
pub struct FuncAddr {
    pub module: Rc<Module>,
    pub func_idx: usize,
}

impl FuncAddr {
    pub fn name(&self) -> &str {
        &self.module.funcs[self.func_idx].name
    }

    pub fn entry_ip(&self) -> usize {
        self.module.funcs[self.func_idx].entry_ip
    }
}

#[derive(Debug, Clone)]
pub enum CallTarget {
    Script(FuncAddr),
    Native(u32),
}

#[derive(Debug, Clone)]
pub struct FuncPtr {
    pub target: CallTarget,
    pub upvals: Vec<Value>,
}

impl FuncPtr {
    pub fn script(addr: FuncAddr, upvals: Vec<Value>) -> Self {
        FuncPtr {
            target: CallTarget::Script(addr),
            upvals,
        }
    }

    pub fn native(idx: u32) -> Self {
        FuncPtr {
            target: CallTarget::Native(idx),
            upvals: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        match &self.target {
            CallTarget::Script(addr) => addr.name(),
            CallTarget::Native(_) => "<native>",
        }
    }
}

impl fmt::Display for FuncPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<fn:{}>", self.name())
    }
}
