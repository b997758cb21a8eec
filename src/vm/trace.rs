//! Stack-trace reconstruction.
//!
//! Frames do not record their own instruction pointer; frame `i`'s position
//! is the `return_ip` recorded by frame `i+1`, and the innermost frame's
//! position comes from the active coroutine chain (or from the exec itself
//! when nothing is suspended). The walk collects frames outermost-first
//! across nested block executions, then emits items innermost-first.

use std::rc::Rc;

use crate::error::TraceItem;
use crate::vm::block::trace_exec;
use crate::vm::exec::ExecState;
use crate::vm::frame::Frame;
use crate::vm::Vm;

/// Capture a trace from an exec, prefixed by already-known outer frames.
pub(crate) fn capture(outer: &[Rc<Frame>], exec: &ExecState) -> Vec<TraceItem> {
    let mut calls: Vec<Rc<Frame>> = outer.to_vec();
    let mut tip = None;
    trace_exec(exec, &mut calls, &mut tip);
    let tip_ip = tip.unwrap_or(exec.ip);

    let mut items = Vec::with_capacity(calls.len());
    for (i, frm) in calls.iter().enumerate() {
        let item_ip = match calls.get(i + 1) {
            Some(next) => next.return_ip,
            None => tip_ip,
        };
        items.push(TraceItem {
            func: frm.name().to_string(),
            file: frm.module.file.to_string(),
            line: frm.module.line_at(item_ip),
        });
    }
    items.reverse();
    items
}

impl Vm {
    /// Trace of the exec currently being executed. Meant for native
    /// callbacks, which receive the innermost exec; frames of enclosing
    /// block executions are tracked by the VM while it descends.
    pub fn capture_trace(&self, exec: &ExecState) -> Vec<TraceItem> {
        capture(&self.trace_outer, exec)
    }
}
