//! The four call-dispatch forms and closure creation.
//!
//! All script calls share one protocol: the caller pushes arguments left to
//! right, the call instruction carries an `ArgsInfo` describing what was
//! supplied, and the callee's prologue pops arguments into local slots from
//! the last formal backwards, running default-value expressions for omitted
//! formals. Native calls hand the VM, the running exec, and the `ArgsInfo`
//! to the callback; a callback may finish, fail, or install a coroutine.

use std::cell::RefCell;
use std::rc::Rc;

use crate::error::VmError;
use crate::module::ClassDef;
use crate::opcode::ArgsInfo;
use crate::value::closure::{CallTarget, FuncAddr, FuncPtr};
use crate::value::heap::{HeapObject, Value};
use crate::vm::block::BlockCoro;
use crate::vm::exec::{ExecState, ExecStatus, Region};
use crate::vm::frame::Frame;
use crate::vm::Vm;

/// What a native callback did.
pub enum NativeOutcome {
    /// Finished synchronously; results, if any, are on the operand stack.
    Done,
    /// Script-level failure: the fiber unwinds running defers.
    Failure,
    /// Suspend: the coroutine is ticked until it finishes.
    Coro(Box<dyn BlockCoro>),
}

pub type NativeCb =
    Rc<dyn Fn(&mut Vm, &mut ExecState, ArgsInfo) -> Result<NativeOutcome, VmError>>;

pub struct NativeDef {
    pub name: Rc<str>,
    pub cb: NativeCb,
}

impl std::fmt::Debug for NativeDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<native:{}>", self.name)
    }
}

impl Vm {
    pub(crate) fn class(&self, idx: u16) -> Result<Rc<ClassDef>, VmError> {
        self.classes
            .get(idx as usize)
            .cloned()
            .ok_or_else(|| VmError::index_out_of_bounds("class", idx as usize, self.classes.len()))
    }

    /// Local call: a function in the current frame's module.
    pub(crate) fn call_func(
        &mut self,
        exec: &mut ExecState,
        frame: &Rc<Frame>,
        func_idx: u32,
        info: ArgsInfo,
    ) -> Result<(), VmError> {
        let addr = FuncAddr {
            module: Rc::clone(&frame.module),
            func_idx: func_idx as usize,
        };
        self.call_addr(exec, addr, &[], None, info)
    }

    /// Virtual call: the receiver sits under the arguments; its class's
    /// vtable slot names the method actually invoked.
    pub(crate) fn call_method_virt(
        &mut self,
        exec: &mut ExecState,
        vslot: u16,
        info: ArgsInfo,
    ) -> Result<(), VmError> {
        let num_args = info.num_args as usize;
        let recv_at = exec
            .stack
            .len()
            .checked_sub(num_args + 1)
            .ok_or(VmError::StackUnderflow { op: "CallMethodVirt" })?;
        let recv = exec.stack.remove(recv_at);
        let addr = match recv.as_obj().map(|o| o.as_ref()) {
            Some(HeapObject::Instance { class, .. }) => class
                .vtable
                .get(vslot as usize)
                .cloned()
                .ok_or_else(|| {
                    VmError::index_out_of_bounds("vtable", vslot as usize, class.vtable.len())
                })?,
            _ => return Err(VmError::type_mismatch("instance", recv.type_name())),
        };
        self.call_addr(exec, addr, &[], Some(recv), info)
    }

    /// Function-pointer call: pops the closure, then dispatches to its
    /// script or native target.
    pub(crate) fn call_ptr(
        &mut self,
        exec: &mut ExecState,
        info: ArgsInfo,
    ) -> Result<ExecStatus, VmError> {
        let v = exec.pop("CallPtr")?;
        let ptr = v
            .as_closure()
            .ok_or_else(|| VmError::type_mismatch("closure", v.type_name()))?
            .clone();
        match ptr.target {
            CallTarget::Script(addr) => {
                self.call_addr(exec, addr, &ptr.upvals, None, info)?;
                Ok(ExecStatus::Success)
            }
            CallTarget::Native(idx) => self.dispatch_native(exec, idx, info),
        }
    }

    /// Native call following the coroutine-or-result protocol. The ip only
    /// advances past the call on synchronous success, so a suspended call
    /// resumes after it and a failed call is reported at it.
    pub(crate) fn dispatch_native(
        &mut self,
        exec: &mut ExecState,
        idx: u32,
        info: ArgsInfo,
    ) -> Result<ExecStatus, VmError> {
        let native = self
            .natives
            .get(idx as usize)
            .cloned()
            .ok_or_else(|| VmError::not_found("native", idx.to_string()))?;
        match (native.cb)(self, exec, info)? {
            NativeOutcome::Done => {
                exec.ip += 1;
                Ok(ExecStatus::Success)
            }
            NativeOutcome::Failure => Ok(ExecStatus::Failure),
            NativeOutcome::Coro(coro) => {
                exec.coroutine = Some(coro);
                Ok(ExecStatus::Success)
            }
        }
    }

    /// Push a frame and a frame region for a script call and move the ip to
    /// its entry. Captures fill the leading local slots; a method receiver
    /// goes to slot 0.
    pub(crate) fn call_addr(
        &mut self,
        exec: &mut ExecState,
        addr: FuncAddr,
        upvals: &[Value],
        recv: Option<Value>,
        info: ArgsInfo,
    ) -> Result<(), VmError> {
        let func = addr
            .module
            .funcs
            .get(addr.func_idx)
            .ok_or_else(|| {
                VmError::index_out_of_bounds("function", addr.func_idx, addr.module.funcs.len())
            })?;
        let num_args = info.num_args as usize;
        if exec.stack.len() < num_args {
            return Err(VmError::StackUnderflow { op: "Call" });
        }
        let stack_base = exec.stack.len() - num_args;

        let mut locals = self.locals_pool.acquire();
        locals.resize(func.locals_num as usize, Value::Null);
        for (i, uv) in upvals.iter().enumerate() {
            match locals.get_mut(i) {
                Some(slot) => *slot = uv.clone(),
                None => {
                    return Err(VmError::internal(format!(
                        "capture slot {} exceeds locals of '{}'",
                        i, func.name
                    )))
                }
            }
        }
        if let Some(recv) = recv {
            match locals.first_mut() {
                Some(slot) => *slot = recv,
                None => {
                    return Err(VmError::internal(format!(
                        "method '{}' declares no receiver slot",
                        func.name
                    )))
                }
            }
        }

        let entry_ip = func.entry_ip;
        let frame = Rc::new(Frame {
            module: Rc::clone(&addr.module),
            func_idx: addr.func_idx,
            locals: RefCell::new(locals),
            args_info: info,
            return_ip: exec.ip,
            stack_base,
        });
        exec.frames.push(Rc::clone(&frame));
        exec.regions.push(Region::frame(frame));
        exec.ip = entry_ip;
        Ok(())
    }

    /// `Lambda`: capture the function's declared upvalues from the current
    /// frame and push the closure.
    pub(crate) fn make_closure(
        &mut self,
        exec: &mut ExecState,
        frame: &Rc<Frame>,
        func_idx: u32,
    ) -> Result<(), VmError> {
        use crate::module::Capture;

        let func = frame
            .module
            .funcs
            .get(func_idx as usize)
            .ok_or_else(|| {
                VmError::index_out_of_bounds(
                    "function",
                    func_idx as usize,
                    frame.module.funcs.len(),
                )
            })?;
        let mut upvals = Vec::with_capacity(func.captures.len());
        for cap in &func.captures {
            let v = frame.local(cap.slot())?;
            match cap {
                Capture::Copy(_) => upvals.push(v),
                Capture::Cell(_) => {
                    if v.cell_get().is_none() {
                        return Err(VmError::type_mismatch("cell", v.type_name()));
                    }
                    upvals.push(v);
                }
            }
        }
        let addr = FuncAddr {
            module: Rc::clone(&frame.module),
            func_idx: func_idx as usize,
        };
        exec.push(Value::obj(HeapObject::Closure(FuncPtr::script(addr, upvals))));
        Ok(())
    }
}
