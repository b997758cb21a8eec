//! The execution engine: exec states, regions, and the dispatch loop.
//!
//! Execution is region-bounded. Each call frame pushes a frame region; each
//! structured block executing in place (defer bodies) pushes a plain region
//! with a `[min_ip, max_ip]` range. When the instruction pointer leaves the
//! top region's range the region is popped and its registered defers run.
//! Frame regions are unbounded and are popped explicitly by `ExitFrame`.
//!
//! An exec either runs its active coroutine (suspended blocks and native
//! coroutines have priority) or dispatches one instruction. The coroutine
//! tick protocol increments the instruction pointer optimistically and backs
//! it out when the coroutine reports it is still running, so a completed
//! coroutine naturally resumes at the instruction after its call site unless
//! its tick placed the pointer elsewhere.

use std::fmt;
use std::rc::Rc;

use smallvec::SmallVec;
use tracing::trace;

use crate::error::VmError;
use crate::opcode::{BlockKind, Op};
use crate::value::heap::{HeapObject, ListStorage, Value};
use crate::vm::block::BlockCoro;
use crate::vm::defer::DeferBlock;
use crate::vm::frame::Frame;
use crate::vm::Vm;

/// Outcome of one slice of execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecStatus {
    Success,
    Failure,
    Running,
}

/// A bounded span of execution tied to a frame.
///
/// Non-frame regions cover defer bodies and sub-block bottoms: leaving their
/// range pops them. Frame regions span the whole function and are popped by
/// `ExitFrame`.
pub struct Region {
    pub frame: Rc<Frame>,
    pub min_ip: usize,
    pub max_ip: usize,
    pub is_frame: bool,
    pub defers: Vec<DeferBlock>,
}

impl Region {
    pub fn frame(frame: Rc<Frame>) -> Self {
        Region {
            frame,
            min_ip: 0,
            max_ip: usize::MAX,
            is_frame: true,
            defers: Vec::new(),
        }
    }

    pub fn block(frame: Rc<Frame>, min_ip: usize, max_ip: usize) -> Self {
        Region {
            frame,
            min_ip,
            max_ip,
            is_frame: false,
            defers: Vec::new(),
        }
    }
}

impl fmt::Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<region:{}..{}{} defers:{}>",
            self.min_ip,
            self.max_ip,
            if self.is_frame { " frame" } else { "" },
            self.defers.len()
        )
    }
}

/// Everything one linear execution needs: the fiber has one, and every
/// sequence block and paral branch carries its own nested one.
#[derive(Default)]
pub struct ExecState {
    pub ip: usize,
    pub stack: SmallVec<[Value; 32]>,
    pub frames: Vec<Rc<Frame>>,
    pub regions: Vec<Region>,
    pub coroutine: Option<Box<dyn BlockCoro>>,
    /// Return values in flight between `Return` and the frame exit, and
    /// across block boundaries on the way there.
    pub ret: Vec<Value>,
}

impl ExecState {
    pub fn push(&mut self, v: Value) {
        self.stack.push(v);
    }

    pub fn pop(&mut self, op: &'static str) -> Result<Value, VmError> {
        self.stack.pop().ok_or(VmError::StackUnderflow { op })
    }

    pub fn pop_num(&mut self, op: &'static str) -> Result<f64, VmError> {
        let v = self.pop(op)?;
        v.as_num()
            .ok_or_else(|| VmError::type_mismatch("num", v.type_name()))
    }

    /// The frame the instruction pointer currently belongs to.
    pub fn current_frame(&self) -> Option<Rc<Frame>> {
        self.regions.last().map(|r| Rc::clone(&r.frame))
    }
}

impl fmt::Debug for ExecState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecState")
            .field("ip", &self.ip)
            .field("stack", &self.stack.len())
            .field("frames", &self.frames.len())
            .field("regions", &self.regions)
            .field("coroutine", &self.coroutine.is_some())
            .field("ret", &self.ret.len())
            .finish()
    }
}

impl Vm {
    /// Run `exec` until it suspends, fails, or unwinds down to `waterline`
    /// regions. Defer bodies re-enter this with a waterline above zero so
    /// they cannot unwind past their own region.
    pub(crate) fn execute(
        &mut self,
        exec: &mut ExecState,
        waterline: usize,
    ) -> Result<ExecStatus, VmError> {
        while exec.regions.len() > waterline {
            match self.execute_once(exec)? {
                ExecStatus::Success => {}
                st => return Ok(st),
            }
        }
        Ok(ExecStatus::Success)
    }

    fn execute_once(&mut self, exec: &mut ExecState) -> Result<ExecStatus, VmError> {
        // The active coroutine has priority over regular dispatch.
        if exec.coroutine.is_some() {
            return self.tick_coroutine(exec);
        }

        let (frame, min_ip, max_ip, is_frame) = match exec.regions.last() {
            Some(r) => (Rc::clone(&r.frame), r.min_ip, r.max_ip, r.is_frame),
            None => return Ok(ExecStatus::Success),
        };

        if !is_frame && (exec.ip < min_ip || exec.ip > max_ip) {
            self.pop_region(exec)?;
            return Ok(ExecStatus::Success);
        }

        let op = match frame.module.code.get(exec.ip) {
            Some(op) => *op,
            None => {
                return Err(VmError::index_out_of_bounds(
                    "code",
                    exec.ip,
                    frame.module.code.len(),
                ))
            }
        };
        trace!(ip = exec.ip, func = frame.name(), ?op, "dispatch");

        match op {
            Op::Nop => {}

            Op::Constant(idx) => {
                let v = frame.module.constants.get(idx as usize).cloned().ok_or(
                    VmError::index_out_of_bounds(
                        "constant",
                        idx as usize,
                        frame.module.constants.len(),
                    ),
                )?;
                exec.push(v);
            }
            Op::Pop => {
                exec.pop("Pop")?;
            }

            Op::Add => {
                let b = exec.pop("Add")?;
                let a = exec.pop("Add")?;
                let v = match (&a, &b) {
                    (Value::Num(x), Value::Num(y)) => Value::Num(x + y),
                    (Value::Str(x), Value::Str(y)) => {
                        let mut s = String::with_capacity(x.len() + y.len());
                        s.push_str(x);
                        s.push_str(y);
                        Value::str(s)
                    }
                    _ => return Err(VmError::type_mismatch("num or str", a.type_name())),
                };
                exec.push(v);
            }
            Op::Sub => self.binary_num(exec, "Sub", |a, b| a - b)?,
            Op::Mul => self.binary_num(exec, "Mul", |a, b| a * b)?,
            Op::Div => self.binary_num(exec, "Div", |a, b| a / b)?,
            Op::Mod => self.binary_num(exec, "Mod", |a, b| a % b)?,
            Op::UnaryNot => {
                let v = exec.pop("UnaryNot")?;
                exec.push(Value::Bool(!v.truthy()));
            }
            Op::UnaryNeg => {
                let n = exec.pop_num("UnaryNeg")?;
                exec.push(Value::Num(-n));
            }
            Op::Eq => {
                let b = exec.pop("Eq")?;
                let a = exec.pop("Eq")?;
                exec.push(Value::Bool(a == b));
            }
            Op::Ne => {
                let b = exec.pop("Ne")?;
                let a = exec.pop("Ne")?;
                exec.push(Value::Bool(a != b));
            }
            Op::Lt => self.compare(exec, "Lt", |o| o == std::cmp::Ordering::Less)?,
            Op::Le => self.compare(exec, "Le", |o| o != std::cmp::Ordering::Greater)?,
            Op::Gt => self.compare(exec, "Gt", |o| o == std::cmp::Ordering::Greater)?,
            Op::Ge => self.compare(exec, "Ge", |o| o != std::cmp::Ordering::Less)?,

            Op::DeclVar(slot) => frame.set_local(slot, Value::Null)?,
            Op::GetVar(slot) => {
                let v = frame.local(slot)?;
                exec.push(v);
            }
            Op::SetVar(slot) => {
                let v = exec.pop("SetVar")?;
                frame.set_local(slot, v)?;
            }
            Op::ArgVar(slot) => {
                let v = exec.pop("ArgVar")?;
                frame.set_local(slot, v)?;
            }
            Op::ArgRef(slot) => {
                let v = exec.pop("ArgRef")?;
                if v.cell_get().is_none() {
                    return Err(VmError::type_mismatch("cell", v.type_name()));
                }
                frame.set_local(slot, v)?;
            }
            Op::Inc(slot) => {
                let v = frame.local(slot)?;
                let n = v
                    .as_num()
                    .ok_or_else(|| VmError::type_mismatch("num", v.type_name()))?;
                frame.set_local(slot, Value::Num(n + 1.0))?;
            }
            Op::Dec(slot) => {
                let v = frame.local(slot)?;
                let n = v
                    .as_num()
                    .ok_or_else(|| VmError::type_mismatch("num", v.type_name()))?;
                frame.set_local(slot, Value::Num(n - 1.0))?;
            }

            Op::BoxVar(slot) => {
                let v = frame.local(slot)?;
                frame.set_local(slot, Value::cell(v))?;
            }
            Op::RefVar(slot) => {
                let v = frame.local(slot)?;
                if v.cell_get().is_none() {
                    return Err(VmError::type_mismatch("cell", v.type_name()));
                }
                exec.push(v);
            }
            Op::GetCell(slot) => {
                let v = frame.local(slot)?;
                let inner = v
                    .cell_get()
                    .ok_or_else(|| VmError::type_mismatch("cell", v.type_name()))?;
                exec.push(inner);
            }
            Op::SetCell(slot) => {
                let v = exec.pop("SetCell")?;
                let cell = frame.local(slot)?;
                if !cell.cell_set(v) {
                    return Err(VmError::type_mismatch("cell", cell.type_name()));
                }
            }

            Op::Jump(target) => {
                exec.ip = target;
                return Ok(ExecStatus::Success);
            }
            Op::JumpZ(target) => {
                let cond = exec.pop("JumpZ")?;
                exec.ip = if cond.truthy() { exec.ip + 1 } else { target };
                return Ok(ExecStatus::Success);
            }

            Op::New(class_idx) => {
                let class = self.class(class_idx)?;
                let fields = vec![Value::Null; class.fields_num];
                exec.push(Value::obj(HeapObject::Instance {
                    class,
                    fields: std::cell::RefCell::new(fields),
                }));
            }
            Op::GetAttr(slot) => {
                let obj = exec.pop("GetAttr")?;
                let v = with_instance(&obj, |fields| {
                    fields.get(slot as usize).cloned().ok_or_else(|| {
                        VmError::index_out_of_bounds("field", slot as usize, fields.len())
                    })
                })??;
                exec.push(v);
            }
            Op::SetAttr(slot) => {
                let obj = exec.pop("SetAttr")?;
                let v = exec.pop("SetAttr")?;
                with_instance_mut(&obj, |fields| {
                    let len = fields.len();
                    match fields.get_mut(slot as usize) {
                        Some(dst) => {
                            *dst = v;
                            Ok(())
                        }
                        None => Err(VmError::index_out_of_bounds("field", slot as usize, len)),
                    }
                })??;
            }
            Op::GetStatic(class_idx, slot) => {
                let class = self.class(class_idx)?;
                let statics = class.statics.borrow();
                let v = statics.get(slot as usize).cloned().ok_or_else(|| {
                    VmError::index_out_of_bounds("static", slot as usize, statics.len())
                })?;
                drop(statics);
                exec.push(v);
            }
            Op::SetStatic(class_idx, slot) => {
                let v = exec.pop("SetStatic")?;
                let class = self.class(class_idx)?;
                let mut statics = class.statics.borrow_mut();
                let len = statics.len();
                match statics.get_mut(slot as usize) {
                    Some(dst) => *dst = v,
                    None => {
                        return Err(VmError::index_out_of_bounds("static", slot as usize, len))
                    }
                }
            }

            Op::NewList(n) => {
                let n = n as usize;
                let at = exec
                    .stack
                    .len()
                    .checked_sub(n)
                    .ok_or(VmError::StackUnderflow { op: "NewList" })?;
                let mut items = self.list_pool.acquire();
                items.extend(exec.stack.drain(at..));
                exec.push(Value::obj(HeapObject::List(std::cell::RefCell::new(
                    ListStorage {
                        items,
                        pool: Some(self.list_pool.downgrade()),
                    },
                ))));
            }
            Op::ListGet => {
                let idx = self.list_index(exec, "ListGet")?;
                let list = exec.pop("ListGet")?;
                let v = with_list(&list, |items| {
                    items
                        .get(idx)
                        .cloned()
                        .ok_or_else(|| VmError::index_out_of_bounds("list", idx, items.len()))
                })??;
                exec.push(v);
            }
            Op::ListSet => {
                let v = exec.pop("ListSet")?;
                let idx = self.list_index(exec, "ListSet")?;
                let list = exec.pop("ListSet")?;
                with_list_mut(&list, |items| {
                    let len = items.len();
                    match items.get_mut(idx) {
                        Some(dst) => {
                            *dst = v;
                            Ok(())
                        }
                        None => Err(VmError::index_out_of_bounds("list", idx, len)),
                    }
                })??;
            }
            Op::ListLen => {
                let list = exec.pop("ListLen")?;
                let len = with_list(&list, |items| items.len())?;
                exec.push(Value::Num(len as f64));
            }

            Op::CallFunc(func_idx, info) => {
                self.call_func(exec, &frame, func_idx, info)?;
                return Ok(ExecStatus::Success);
            }
            Op::CallNative(native_idx, info) => {
                return self.dispatch_native(exec, native_idx, info);
            }
            Op::CallMethodVirt(vslot, info) => {
                self.call_method_virt(exec, vslot, info)?;
                return Ok(ExecStatus::Success);
            }
            Op::CallPtr(info) => {
                return self.call_ptr(exec, info);
            }
            Op::Lambda(func_idx) => {
                self.make_closure(exec, &frame, func_idx)?;
            }
            Op::DefArg(arg_idx, skip_to) => {
                exec.ip = if frame.args_info.default_used(arg_idx) {
                    exec.ip + 1
                } else {
                    skip_to
                };
                return Ok(ExecStatus::Success);
            }

            Op::Return(n) => {
                let at = exec
                    .stack
                    .len()
                    .checked_sub(n as usize)
                    .ok_or(VmError::StackUnderflow { op: "Return" })?;
                exec.ret.extend(exec.stack.drain(at..));
                exec.ip = frame.exit_ip();
                return Ok(ExecStatus::Success);
            }
            Op::ExitFrame => {
                // The dispatch clone must go first or the locals buffer
                // can never be unwrapped back into the pool.
                drop(frame);
                self.exit_frame(exec)?;
                return Ok(ExecStatus::Success);
            }
            Op::Block(kind, len) => {
                return self.make_block(exec, &frame, kind, len);
            }
        }

        exec.ip += 1;
        Ok(ExecStatus::Success)
    }

    /// Tick the active coroutine with the optimistic ip protocol.
    fn tick_coroutine(&mut self, exec: &mut ExecState) -> Result<ExecStatus, VmError> {
        let mut coro = match exec.coroutine.take() {
            Some(c) => c,
            None => return Ok(ExecStatus::Success),
        };
        exec.ip += 1;
        match coro.tick(self, exec) {
            Err(e) => {
                // Put it back so cleanup can still cancel it.
                exec.coroutine = Some(coro);
                Err(e)
            }
            Ok(ExecStatus::Running) => {
                exec.ip -= 1;
                exec.coroutine = Some(coro);
                Ok(ExecStatus::Running)
            }
            Ok(st) => {
                coro.destruct(self, exec)?;
                Ok(st)
            }
        }
    }

    /// Pop the top region and run its defers.
    pub(crate) fn pop_region(&mut self, exec: &mut ExecState) -> Result<(), VmError> {
        if let Some(region) = exec.regions.pop() {
            let Region { defers, frame, .. } = region;
            drop(frame);
            self.run_defers(exec, defers)?;
        }
        Ok(())
    }

    /// `ExitFrame`: run frame defers, restore the caller's ip, hand over
    /// return values, release the frame.
    pub(crate) fn exit_frame(&mut self, exec: &mut ExecState) -> Result<(), VmError> {
        let region = exec
            .regions
            .pop()
            .ok_or_else(|| VmError::internal("exit with no region"))?;
        debug_assert!(region.is_frame, "exit must land on a frame region");
        let Region { defers, frame: region_frame, .. } = region;
        drop(region_frame);
        self.run_defers(exec, defers)?;

        let frame = exec
            .frames
            .pop()
            .ok_or_else(|| VmError::internal("exit with no frame"))?;
        exec.ip = frame.return_ip.wrapping_add(1);
        exec.stack.truncate(frame.stack_base);
        exec.stack.extend(exec.ret.drain(..));
        self.release_frame(frame);
        Ok(())
    }

    /// Unwind an exec completely: cancel the active coroutine, pop every
    /// region running its defers, release every frame. Used for external
    /// stop, failure cleanup, and branch cancellation.
    pub(crate) fn exit_scope(&mut self, exec: &mut ExecState) -> Result<(), VmError> {
        if let Some(mut coro) = exec.coroutine.take() {
            coro.destruct(self, exec)?;
        }
        while let Some(region) = exec.regions.pop() {
            let Region { defers, frame, is_frame, .. } = region;
            drop(frame);
            self.run_defers(exec, defers)?;
            if is_frame {
                if let Some(f) = exec.frames.pop() {
                    self.release_frame(f);
                }
            }
        }
        exec.frames.clear();
        exec.ret.clear();
        exec.stack.clear();
        Ok(())
    }

    pub(crate) fn release_frame(&mut self, frame: Rc<Frame>) {
        if let Ok(frame) = Rc::try_unwrap(frame) {
            self.locals_pool.release(frame.locals.into_inner());
        }
    }

    fn binary_num(
        &mut self,
        exec: &mut ExecState,
        op: &'static str,
        f: impl Fn(f64, f64) -> f64,
    ) -> Result<(), VmError> {
        let b = exec.pop_num(op)?;
        let a = exec.pop_num(op)?;
        exec.push(Value::Num(f(a, b)));
        Ok(())
    }

    fn compare(
        &mut self,
        exec: &mut ExecState,
        op: &'static str,
        f: impl Fn(std::cmp::Ordering) -> bool,
    ) -> Result<(), VmError> {
        let b = exec.pop(op)?;
        let a = exec.pop(op)?;
        let ord = match (&a, &b) {
            (Value::Num(x), Value::Num(y)) => x
                .partial_cmp(y)
                .ok_or_else(|| VmError::type_mismatch("comparable num", "nan"))?,
            (Value::Str(x), Value::Str(y)) => x.cmp(y),
            _ => return Err(VmError::type_mismatch("num or str", a.type_name())),
        };
        exec.push(Value::Bool(f(ord)));
        Ok(())
    }

    fn list_index(&mut self, exec: &mut ExecState, op: &'static str) -> Result<usize, VmError> {
        let n = exec.pop_num(op)?;
        if n < 0.0 {
            return Err(VmError::index_out_of_bounds("list", usize::MAX, 0));
        }
        Ok(n as usize)
    }
}

fn with_instance<R>(
    v: &Value,
    f: impl FnOnce(&Vec<Value>) -> R,
) -> Result<R, VmError> {
    match v.as_obj().map(|o| o.as_ref()) {
        Some(HeapObject::Instance { fields, .. }) => Ok(f(&fields.borrow())),
        _ => Err(VmError::type_mismatch("instance", v.type_name())),
    }
}

fn with_instance_mut<R>(
    v: &Value,
    f: impl FnOnce(&mut Vec<Value>) -> R,
) -> Result<R, VmError> {
    match v.as_obj().map(|o| o.as_ref()) {
        Some(HeapObject::Instance { fields, .. }) => Ok(f(&mut fields.borrow_mut())),
        _ => Err(VmError::type_mismatch("instance", v.type_name())),
    }
}

fn with_list<R>(v: &Value, f: impl FnOnce(&Vec<Value>) -> R) -> Result<R, VmError> {
    match v.as_obj().map(|o| o.as_ref()) {
        Some(HeapObject::List(storage)) => Ok(f(&storage.borrow().items)),
        _ => Err(VmError::type_mismatch("list", v.type_name())),
    }
}

fn with_list_mut<R>(v: &Value, f: impl FnOnce(&mut Vec<Value>) -> R) -> Result<R, VmError> {
    match v.as_obj().map(|o| o.as_ref()) {
        Some(HeapObject::List(storage)) => Ok(f(&mut storage.borrow_mut().items)),
        _ => Err(VmError::type_mismatch("list", v.type_name())),
    }
}
