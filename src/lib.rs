//! skein: a tick-driven bytecode virtual machine with cooperative fibers,
//! parallel blocks, and deferred cleanup.
//!
//! The host registers modules (validated instruction streams), classes, and
//! native callbacks, then starts fibers and drives them with [`Vm::tick`].
//! Execution is cooperative: a fiber runs until it hits a suspension point
//! (`yield`, `wait_ticks`, a suspended native, a paral block with running
//! branches) and resumes on the next tick. `defer` blocks run their bodies
//! on every exit path: normal completion, failure, break or return past the
//! scope, and external stop.

pub mod error;
pub mod module;
pub mod opcode;
pub mod value;
pub mod vm;

pub use error::{format_trace, TraceItem, VmError};
pub use module::{Capture, ClassDef, FuncDef, Module};
pub use opcode::{ArgsInfo, BlockKind, Op};
pub use value::closure::{CallTarget, FuncAddr, FuncPtr};
pub use value::heap::{HeapObject, Value};
pub use value::pool::PoolStats;
pub use vm::block::BlockCoro;
pub use vm::call::NativeOutcome;
pub use vm::exec::{ExecState, ExecStatus};
pub use vm::fiber::{FiberHandle, FiberStatus, ResultStatus, WeakFiberHandle};
pub use vm::{Vm, VmStats};
