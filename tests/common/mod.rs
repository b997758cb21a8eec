//! Shared helpers for the integration suites: a small bytecode assembler and
//! a couple of logging natives.

#![allow(dead_code)]

use std::cell::RefCell;
use std::rc::Rc;

use skein::{Capture, FuncDef, Module, NativeOutcome, Op, TraceItem, Value, Vm};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Assembles one module out of hand-written instruction streams. Functions
/// are appended to a single flat code space; every function body gets its
/// `ExitFrame` epilogue appended automatically. Line numbers are synthetic:
/// instruction index plus one.
pub struct ModuleBuilder {
    code: Vec<Op>,
    lines: Vec<u32>,
    constants: Vec<Value>,
    funcs: Vec<FuncDef>,
}

impl ModuleBuilder {
    pub fn new() -> Self {
        ModuleBuilder {
            code: Vec::new(),
            lines: Vec::new(),
            constants: Vec::new(),
            funcs: Vec::new(),
        }
    }

    /// Where the next function body will start; jump targets are absolute,
    /// so bodies are laid out against this.
    pub fn next_ip(&self) -> usize {
        self.code.len()
    }

    pub fn constant(&mut self, v: Value) -> u32 {
        self.constants.push(v);
        (self.constants.len() - 1) as u32
    }

    pub fn num(&mut self, n: f64) -> u32 {
        self.constant(Value::Num(n))
    }

    pub fn str(&mut self, s: &str) -> u32 {
        self.constant(Value::str(s))
    }

    pub fn func(
        &mut self,
        name: &str,
        args_num: u8,
        locals_num: u8,
        captures: Vec<Capture>,
        body: Vec<Op>,
    ) -> u32 {
        let entry_ip = self.code.len();
        self.code.extend(body);
        self.code.push(Op::ExitFrame);
        let exit_ip = self.code.len() - 1;
        while self.lines.len() < self.code.len() {
            self.lines.push(self.lines.len() as u32 + 1);
        }
        self.funcs.push(FuncDef {
            name: Rc::from(name),
            entry_ip,
            exit_ip,
            args_num,
            locals_num,
            captures,
        });
        (self.funcs.len() - 1) as u32
    }

    pub fn build(self, name: &str) -> Module {
        let file = format!("{}.ski", name);
        Module::new(name, file, self.code, self.lines, self.constants, self.funcs)
    }
}

/// Prologue popping the supplied arguments into their slots. The caller
/// pushed them left to right, so the pops go from the last formal backwards.
pub fn arg_prologue(slots: &[u8]) -> Vec<Op> {
    slots.iter().rev().map(|&s| Op::ArgVar(s)).collect()
}

/// Register a `log` native that pops one value and records its rendering.
pub fn install_log(vm: &mut Vm) -> (Rc<RefCell<Vec<String>>>, u32) {
    let log = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&log);
    let idx = vm.register_native("log", move |_vm, exec, _info| {
        let v = exec.pop("log")?;
        sink.borrow_mut().push(v.to_string());
        Ok(NativeOutcome::Done)
    });
    (log, idx)
}

/// Register a `record` native that captures the stack trace at its call site.
pub fn install_record(vm: &mut Vm) -> (Rc<RefCell<Vec<TraceItem>>>, u32) {
    let captured = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&captured);
    let idx = vm.register_native("record", move |vm, exec, _info| {
        *sink.borrow_mut() = vm.capture_trace(exec);
        Ok(NativeOutcome::Done)
    });
    (captured, idx)
}

pub fn tick_n(vm: &mut Vm, n: usize) {
    for _ in 0..n {
        vm.tick().unwrap();
    }
}
