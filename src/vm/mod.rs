//! The virtual machine: registries, pools, and the fiber scheduler.
//!
//! The VM owns no threads and never blocks. The host drives it by calling
//! `tick()` (or `tick_fiber()` for a single fiber); each tick advances every
//! attached fiber until it suspends, finishes, or fails. Fibers live in
//! handles so that script values, the scheduler, and the host can all refer
//! to the same fiber while it is taken out for execution.

pub mod block;
pub mod builtins;
pub mod call;
pub mod defer;
pub mod exec;
pub mod fiber;
pub mod frame;
pub mod trace;

use std::rc::Rc;

use rustc_hash::FxHashMap;
use tracing::{debug, error};

use crate::error::{TraceItem, VmError};
use crate::module::{ClassDef, Module};
use crate::opcode::ArgsInfo;
use crate::value::closure::{CallTarget, FuncAddr, FuncPtr};
use crate::value::heap::Value;
use crate::value::pool::{Pool, PoolStats};
use call::{NativeCb, NativeDef, NativeOutcome};
use exec::{ExecState, ExecStatus};
use fiber::{Fiber, FiberHandle, FiberStatus, WeakFiberHandle};
use frame::Frame;

/// Pool counters exposed to hosts and tests.
#[derive(Debug, Clone, Copy)]
pub struct VmStats {
    pub frame_locals: PoolStats,
    pub lists: PoolStats,
}

pub struct Vm {
    modules: FxHashMap<Rc<str>, Rc<Module>>,
    pub(crate) classes: Vec<Rc<ClassDef>>,
    pub(crate) natives: Vec<Rc<NativeDef>>,
    natives_by_name: FxHashMap<Rc<str>, u32>,
    fibers: Vec<FiberHandle>,
    next_fiber_id: u32,
    pub(crate) locals_pool: Pool<Vec<Value>>,
    pub(crate) list_pool: Pool<Vec<Value>>,
    /// Frames of enclosing execs while the VM runs a nested one; lets trace
    /// capture see the whole chain from inside a native callback.
    pub(crate) trace_outer: Vec<Rc<Frame>>,
    /// Fibers asked to stop while they were executing.
    pending_stops: Vec<WeakFiberHandle>,
    draining_stops: bool,
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

impl Vm {
    pub fn new() -> Self {
        let mut vm = Vm {
            modules: FxHashMap::default(),
            classes: Vec::new(),
            natives: Vec::new(),
            natives_by_name: FxHashMap::default(),
            fibers: Vec::new(),
            next_fiber_id: 0,
            locals_pool: Pool::new(),
            list_pool: Pool::new(),
            trace_outer: Vec::new(),
            pending_stops: Vec::new(),
            draining_stops: false,
        };
        builtins::install(&mut vm);
        vm
    }

    // ── registration ────────────────────────────────────────────────────

    /// Validate and register a module.
    pub fn register_module(&mut self, module: Module) -> Result<Rc<Module>, VmError> {
        module.validate()?;
        let module = Rc::new(module);
        self.modules
            .insert(Rc::clone(&module.name), Rc::clone(&module));
        Ok(module)
    }

    pub fn module(&self, name: &str) -> Option<Rc<Module>> {
        self.modules.get(name).cloned()
    }

    /// Register a class; the returned index is what `New` instructions use.
    pub fn register_class(&mut self, class: ClassDef) -> u16 {
        self.classes.push(Rc::new(class));
        (self.classes.len() - 1) as u16
    }

    /// Register a native callback; the returned index is what `CallNative`
    /// instructions use.
    pub fn register_native<F>(&mut self, name: &str, cb: F) -> u32
    where
        F: Fn(&mut Vm, &mut ExecState, ArgsInfo) -> Result<NativeOutcome, VmError> + 'static,
    {
        let name: Rc<str> = Rc::from(name);
        let idx = self.natives.len() as u32;
        self.natives.push(Rc::new(NativeDef {
            name: Rc::clone(&name),
            cb: Rc::new(cb) as NativeCb,
        }));
        self.natives_by_name.insert(name, idx);
        idx
    }

    pub fn native_idx(&self, name: &str) -> Option<u32> {
        self.natives_by_name.get(name).copied()
    }

    pub fn func_addr(&self, module: &str, func: &str) -> Result<FuncAddr, VmError> {
        let module = self
            .modules
            .get(module)
            .cloned()
            .ok_or_else(|| VmError::not_found("module", module))?;
        let func_idx = module
            .func_idx(func)
            .ok_or_else(|| VmError::not_found("function", func))?;
        Ok(FuncAddr { module, func_idx })
    }

    // ── fibers ──────────────────────────────────────────────────────────

    /// Start a fiber for a named function. The fiber is attached to the
    /// scheduler and will run on the next tick.
    pub fn start(&mut self, module: &str, func: &str, args: Vec<Value>) -> Result<FiberHandle, VmError> {
        let addr = self.func_addr(module, func)?;
        self.spawn(addr, &[], args)
    }

    /// Start a fiber for a closure, installing its captures.
    pub fn start_ptr(&mut self, ptr: &FuncPtr, args: Vec<Value>) -> Result<FiberHandle, VmError> {
        match &ptr.target {
            CallTarget::Script(addr) => self.spawn(addr.clone(), &ptr.upvals, args),
            CallTarget::Native(_) => Err(VmError::type_mismatch("script function", "native")),
        }
    }

    fn spawn(
        &mut self,
        addr: FuncAddr,
        upvals: &[Value],
        args: Vec<Value>,
    ) -> Result<FiberHandle, VmError> {
        self.next_fiber_id += 1;
        let mut fiber = Fiber::new(self.next_fiber_id);
        let info = ArgsInfo::new(args.len() as u8);
        for a in args {
            fiber.exec.push(a);
        }
        fiber.exec.ip = frame::NO_IP;
        self.call_addr(&mut fiber.exec, addr, upvals, None, info)?;
        debug!(id = fiber.id, "fiber started");
        let handle = FiberHandle::new(fiber);
        self.fibers.push(handle.clone());
        Ok(handle)
    }

    /// Remove a fiber from the scheduler without stopping it; the host
    /// ticks it manually from then on.
    pub fn detach(&mut self, handle: &FiberHandle) {
        self.fibers.retain(|h| !h.same(handle));
    }

    /// Put a detached fiber back under scheduler control.
    pub fn attach(&mut self, handle: &FiberHandle) {
        if !self.fibers.iter().any(|h| h.same(handle)) {
            self.fibers.push(handle.clone());
        }
    }

    pub fn fiber_count(&self) -> usize {
        self.fibers.len()
    }

    /// Tick every attached fiber once, including fibers attached during
    /// this very tick. Returns whether any fiber is still alive.
    pub fn tick(&mut self) -> Result<bool, VmError> {
        let mut i = 0;
        while i < self.fibers.len() {
            let handle = self.fibers[i].clone();
            self.tick_fiber(&handle)?;
            i += 1;
        }
        self.fibers.retain(|h| !h.finished());
        Ok(!self.fibers.is_empty())
    }

    /// Tick one fiber. Returns whether it is still alive.
    pub fn tick_fiber(&mut self, handle: &FiberHandle) -> Result<bool, VmError> {
        let mut fiber = match handle.try_take() {
            Some(f) => f,
            None => return Err(VmError::internal("fiber is already executing")),
        };
        if fiber.status.finished() {
            handle.put(fiber);
            return Ok(false);
        }

        fiber.status = FiberStatus::Running;
        fiber.ticks += 1;
        let res = self.execute(&mut fiber.exec, 0);

        match res {
            Ok(ExecStatus::Running) => {
                fiber.status = FiberStatus::Suspended;
                handle.put(fiber);
                self.drain_pending_stops()?;
                Ok(true)
            }
            Ok(ExecStatus::Success) => {
                fiber.result.extend(fiber.exec.stack.drain(..));
                fiber.status = FiberStatus::Success;
                debug!(id = fiber.id, ticks = fiber.ticks, "fiber finished");
                handle.put(fiber);
                self.drain_pending_stops()?;
                Ok(false)
            }
            Ok(ExecStatus::Failure) => {
                let cleanup = self.exit_scope(&mut fiber.exec);
                fiber.status = FiberStatus::Failure;
                debug!(id = fiber.id, "fiber failed");
                handle.put(fiber);
                self.drain_pending_stops()?;
                cleanup?;
                Ok(false)
            }
            Err(e) => {
                // Capture the trace before cleanup tears the frames down.
                let trace = trace::capture(&self.trace_outer, &fiber.exec);
                if let Err(cleanup) = self.exit_scope(&mut fiber.exec) {
                    error!(error = %cleanup, "cleanup after native error failed");
                }
                fiber.status = FiberStatus::Failure;
                handle.put(fiber);
                self.drain_pending_stops()?;
                Err(e.with_trace(trace))
            }
        }
    }

    /// Stop a fiber: run every pending defer on every exit path, release
    /// its state, and mark it stopped. Stopping a finished fiber is a
    /// no-op. A fiber that is currently executing is queued and stopped as
    /// soon as its tick completes.
    pub fn stop(&mut self, handle: &FiberHandle) -> Result<(), VmError> {
        let mut fiber = match handle.try_take() {
            Some(f) => f,
            None => {
                self.pending_stops.push(handle.downgrade());
                return Ok(());
            }
        };
        if fiber.status.finished() {
            handle.put(fiber);
            return Ok(());
        }
        debug!(id = fiber.id, "fiber stopped");
        let cleanup = self.exit_scope(&mut fiber.exec);
        fiber.status = FiberStatus::Stopped;
        handle.put(fiber);
        cleanup?;
        self.drain_pending_stops()
    }

    /// Stop every attached fiber.
    pub fn stop_all(&mut self) -> Result<(), VmError> {
        let handles = self.fibers.clone();
        for h in &handles {
            self.stop(h)?;
        }
        self.fibers.retain(|h| !h.finished());
        Ok(())
    }

    /// One pass over the pending-stop queue. Fibers still executing stay
    /// queued for the next pass; entries whose fiber is gone are dropped.
    fn drain_pending_stops(&mut self) -> Result<(), VmError> {
        if self.draining_stops || self.pending_stops.is_empty() {
            return Ok(());
        }
        self.draining_stops = true;
        let batch = std::mem::take(&mut self.pending_stops);
        let mut result = Ok(());
        for weak in batch {
            let Some(handle) = weak.upgrade() else { continue };
            if handle.try_with(|_| ()).is_none() {
                // still executing, keep for the next pass
                self.pending_stops.push(weak);
                continue;
            }
            if let Err(e) = self.stop(&handle) {
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        self.draining_stops = false;
        result
    }

    // ── diagnostics ─────────────────────────────────────────────────────

    /// Stack trace of a fiber between ticks, innermost frame first.
    pub fn stack_trace(&self, handle: &FiberHandle) -> Vec<TraceItem> {
        handle
            .try_with(|f| trace::capture(&[], &f.exec))
            .unwrap_or_default()
    }

    pub fn stats(&self) -> VmStats {
        VmStats {
            frame_locals: self.locals_pool.stats(),
            lists: self.list_pool.stats(),
        }
    }
}
