//! Deferred cleanup blocks.
//!
//! A `defer` instruction does not execute its body; it registers the body's
//! code range on the innermost defer-supporting scope (the top region, or a
//! paral block's own list). When that scope ends, for any reason, the bodies
//! run in reverse registration order. A defer body executes in place on the
//! owning exec: the instruction pointer is saved, a bounded region is pushed
//! over the body, and execution re-enters the dispatch loop with a waterline
//! that stops it from unwinding past the body. The active coroutine is
//! parked for the duration so block dispatch cannot hijack the run.

use std::rc::Rc;

use tracing::trace;

use crate::error::VmError;
use crate::vm::exec::{ExecState, ExecStatus, Region};
use crate::vm::frame::Frame;
use crate::vm::Vm;

/// A registered defer body: the frame it belongs to and its code range.
#[derive(Debug, Clone)]
pub struct DeferBlock {
    pub frame: Rc<Frame>,
    pub ip: usize,
    pub max_ip: usize,
}

impl Vm {
    /// Run `defers` in reverse registration order on `exec`.
    ///
    /// Defer bodies must complete synchronously and successfully; a body
    /// that suspends or fails is a structural error.
    pub(crate) fn run_defers(
        &mut self,
        exec: &mut ExecState,
        mut defers: Vec<DeferBlock>,
    ) -> Result<(), VmError> {
        if defers.is_empty() {
            return Ok(());
        }
        let parked = exec.coroutine.take();
        while let Some(d) = defers.pop() {
            trace!(ip = d.ip, max_ip = d.max_ip, "defer body");
            let ip_orig = exec.ip;
            exec.ip = d.ip;
            exec.regions
                .push(Region::block(Rc::clone(&d.frame), d.ip, d.max_ip));
            let waterline = exec.regions.len() - 1;
            let st = self.execute(exec, waterline)?;
            if st != ExecStatus::Success {
                return Err(VmError::internal(format!(
                    "defer execution finished with invalid status {:?}",
                    st
                )));
            }
            exec.ip = ip_orig;
        }
        exec.coroutine = parked;
        Ok(())
    }
}
