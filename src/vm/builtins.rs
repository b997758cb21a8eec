//! Built-in natives: suspension primitives and fiber control.

use crate::error::VmError;
use crate::value::heap::{HeapObject, Value};
use crate::vm::block::BlockCoro;
use crate::vm::call::NativeOutcome;
use crate::vm::exec::{ExecState, ExecStatus};
use crate::vm::Vm;

/// `yield()`: suspend for exactly one tick.
struct YieldOnce {
    ticked: bool,
}

impl BlockCoro for YieldOnce {
    fn tick(&mut self, _vm: &mut Vm, _ext: &mut ExecState) -> Result<ExecStatus, VmError> {
        if self.ticked {
            Ok(ExecStatus::Success)
        } else {
            self.ticked = true;
            Ok(ExecStatus::Running)
        }
    }
}

/// `suspend()`: never completes; the fiber runs until stopped externally.
struct SuspendForever;

impl BlockCoro for SuspendForever {
    fn tick(&mut self, _vm: &mut Vm, _ext: &mut ExecState) -> Result<ExecStatus, VmError> {
        Ok(ExecStatus::Running)
    }
}

/// `wait_ticks(n)`: suspend for `n` ticks.
struct WaitTicks {
    left: u64,
}

impl BlockCoro for WaitTicks {
    fn tick(&mut self, _vm: &mut Vm, _ext: &mut ExecState) -> Result<ExecStatus, VmError> {
        if self.left == 0 {
            Ok(ExecStatus::Success)
        } else {
            self.left -= 1;
            Ok(ExecStatus::Running)
        }
    }
}

pub(crate) fn install(vm: &mut Vm) {
    vm.register_native("yield", |_vm, _exec, _info| {
        Ok(NativeOutcome::Coro(Box::new(YieldOnce { ticked: false })))
    });

    vm.register_native("suspend", |_vm, _exec, _info| {
        Ok(NativeOutcome::Coro(Box::new(SuspendForever)))
    });

    vm.register_native("wait_ticks", |_vm, exec, _info| {
        let n = exec.pop_num("wait_ticks")?;
        Ok(NativeOutcome::Coro(Box::new(WaitTicks {
            left: n.max(0.0) as u64,
        })))
    });

    vm.register_native("fail", |_vm, _exec, _info| Ok(NativeOutcome::Failure));

    // start(closure) -> fiber: schedules a new fiber on the VM and leaves a
    // first-class fiber value on the stack.
    vm.register_native("start", |vm, exec, _info| {
        let v = exec.pop("start")?;
        let ptr = v
            .as_closure()
            .ok_or_else(|| VmError::type_mismatch("closure", v.type_name()))?
            .clone();
        let handle = vm.start_ptr(&ptr, Vec::new())?;
        exec.push(Value::obj(HeapObject::Fiber(handle)));
        Ok(NativeOutcome::Done)
    });

    // stop(fiber): stops the fiber immediately, running its defers. A fiber
    // stopping itself is queued until its current tick finishes.
    vm.register_native("stop", |vm, exec, _info| {
        let v = exec.pop("stop")?;
        let handle = v
            .as_fiber()
            .ok_or_else(|| VmError::type_mismatch("fiber", v.type_name()))?
            .clone();
        vm.stop(&handle)?;
        Ok(NativeOutcome::Done)
    });
}
