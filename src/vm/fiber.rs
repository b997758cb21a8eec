//! Fibers: cooperative units of execution driven by host ticks.
//!
//! A fiber is an independent execution context: it owns its operand stack,
//! call frames, regions, and active coroutine. The VM takes the fiber out of
//! its handle for the duration of a tick and puts it back afterwards, so the
//! handle can be held by script values and by the host at the same time.

use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

use crate::value::heap::Value;
use crate::vm::exec::ExecState;

/// Fiber status as observed between ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FiberStatus {
    /// Attached but never ticked.
    Idle,
    /// Currently executing (taken out of its handle).
    Running,
    /// Suspended at a suspension point, waiting for the next tick.
    Suspended,
    /// Finished normally; results are available.
    Success,
    /// Finished by script failure or a native error.
    Failure,
    /// Stopped externally before finishing.
    Stopped,
}

impl FiberStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            FiberStatus::Idle => "idle",
            FiberStatus::Running => "running",
            FiberStatus::Suspended => "suspended",
            FiberStatus::Success => "success",
            FiberStatus::Failure => "failure",
            FiberStatus::Stopped => "stopped",
        }
    }

    /// Finished fibers are never ticked again.
    pub fn finished(self) -> bool {
        matches!(
            self,
            FiberStatus::Success | FiberStatus::Failure | FiberStatus::Stopped
        )
    }
}

/// Result-oriented view of a fiber: has it produced an outcome yet.
/// Idle and stopped fibers have none; suspension is still "running".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultStatus {
    None,
    Running,
    Success,
    Failure,
}

impl From<FiberStatus> for ResultStatus {
    fn from(status: FiberStatus) -> Self {
        match status {
            FiberStatus::Idle | FiberStatus::Stopped => ResultStatus::None,
            FiberStatus::Running | FiberStatus::Suspended => ResultStatus::Running,
            FiberStatus::Success => ResultStatus::Success,
            FiberStatus::Failure => ResultStatus::Failure,
        }
    }
}

#[derive(Debug)]
pub struct Fiber {
    pub id: u32,
    /// Ticks this fiber has received.
    pub ticks: u64,
    pub status: FiberStatus,
    pub exec: ExecState,
    /// Return values of the root function, in declaration order.
    pub result: Vec<Value>,
}

impl Fiber {
    pub fn new(id: u32) -> Self {
        Fiber {
            id,
            ticks: 0,
            status: FiberStatus::Idle,
            exec: ExecState::default(),
            result: Vec::new(),
        }
    }
}

/// A handle to a fiber with take/put semantics.
///
/// Wraps `Rc<RefCell<Option<Fiber>>>`. The `Option` makes "fiber is
/// currently executing on the VM" representable as `None` with no dummy
/// fiber needed.
///
/// - `take()` extracts the fiber (sets slot to None)
/// - `put()` returns the fiber (sets slot to Some)
/// - `with()`/`with_mut()` borrow in place for read/write
/// - `try_with()` returns None if the fiber is taken or already borrowed
#[derive(Clone)]
pub struct FiberHandle(Rc<RefCell<Option<Fiber>>>);

impl FiberHandle {
    pub fn new(fiber: Fiber) -> Self {
        FiberHandle(Rc::new(RefCell::new(Some(fiber))))
    }

    /// Take the fiber out of the handle. Panics if already taken.
    pub fn take(&self) -> Fiber {
        self.0
            .borrow_mut()
            .take()
            .expect("FiberHandle::take: fiber already taken (currently executing on VM)")
    }

    /// Take the fiber out, or None when it is currently executing.
    pub fn try_take(&self) -> Option<Fiber> {
        self.0.borrow_mut().take()
    }

    /// Put a fiber back into the handle. Panics if slot is occupied.
    pub fn put(&self, fiber: Fiber) {
        let mut slot = self.0.borrow_mut();
        assert!(
            slot.is_none(),
            "FiberHandle::put: slot already occupied (fiber not taken)"
        );
        *slot = Some(fiber);
    }

    /// Borrow the fiber immutably. Panics if taken.
    pub fn with<R>(&self, f: impl FnOnce(&Fiber) -> R) -> R {
        let borrow = self.0.borrow();
        let fiber = borrow
            .as_ref()
            .expect("FiberHandle::with: fiber is taken (currently executing on VM)");
        f(fiber)
    }

    /// Borrow the fiber mutably. Panics if taken.
    pub fn with_mut<R>(&self, f: impl FnOnce(&mut Fiber) -> R) -> R {
        let mut borrow = self.0.borrow_mut();
        let fiber = borrow
            .as_mut()
            .expect("FiberHandle::with_mut: fiber is taken (currently executing on VM)");
        f(fiber)
    }

    /// Try to borrow the fiber immutably. Returns None if taken or already
    /// mutably borrowed (used by Debug/Display where panicking is wrong).
    pub fn try_with<R>(&self, f: impl FnOnce(&Fiber) -> R) -> Option<R> {
        let borrow = self.0.try_borrow().ok()?;
        let fiber = borrow.as_ref()?;
        Some(f(fiber))
    }

    /// Status as observed from outside; a taken fiber reads as running.
    pub fn status(&self) -> FiberStatus {
        self.try_with(|f| f.status).unwrap_or(FiberStatus::Running)
    }

    /// Coarse outcome view of `status()`.
    pub fn result_status(&self) -> ResultStatus {
        self.status().into()
    }

    pub fn finished(&self) -> bool {
        self.status().finished()
    }

    pub fn id(&self) -> u32 {
        self.try_with(|f| f.id).unwrap_or(0)
    }

    /// Clone of the fiber's result values; empty until it succeeds.
    pub fn results(&self) -> Vec<Value> {
        self.try_with(|f| f.result.clone()).unwrap_or_default()
    }

    /// Pop the last result value, for the common single-result case.
    pub fn pop_result(&self) -> Option<Value> {
        self.try_with(|_| ())?;
        self.with_mut(|f| f.result.pop())
    }

    /// Two handles naming the same fiber.
    pub fn same(&self, other: &FiberHandle) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    pub fn downgrade(&self) -> WeakFiberHandle {
        WeakFiberHandle(Rc::downgrade(&self.0))
    }
}

impl fmt::Debug for FiberHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.try_with(|fib| fib.status.as_str()) {
            Some(status) => write!(f, "<fiber-handle:{}>", status),
            None => write!(f, "<fiber-handle:taken>"),
        }
    }
}

/// A weak reference to a fiber handle, used where a strong reference would
/// keep a finished fiber alive (pending-stop queue, host bookkeeping).
#[derive(Clone)]
pub struct WeakFiberHandle(Weak<RefCell<Option<Fiber>>>);

impl WeakFiberHandle {
    pub fn upgrade(&self) -> Option<FiberHandle> {
        self.0.upgrade().map(FiberHandle)
    }
}

impl fmt::Debug for WeakFiberHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<weak-fiber-handle>")
    }
}
