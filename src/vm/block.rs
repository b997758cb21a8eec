//! Block coroutines: suspended structured blocks.
//!
//! When dispatch hits a `Block` instruction for a sequence or paral block it
//! materializes a coroutine object and installs it as the exec's active
//! coroutine; the block's body then runs inside the coroutine across as many
//! ticks as it needs. Sequence blocks and paral branches carry their own
//! nested `ExecState` whose bottom region references the enclosing frame, so
//! locals stay shared while control state is isolated. A `defer` sub-block
//! found while scanning a paral body registers on the paral block itself and
//! runs when the block ends.

use std::rc::Rc;

use crate::error::VmError;
use crate::opcode::BlockKind;
use crate::vm::defer::DeferBlock;
use crate::vm::exec::{ExecState, ExecStatus, Region};
use crate::vm::frame::Frame;
use crate::vm::Vm;

/// A suspended block: ticked while running, destructed exactly once when it
/// completes, fails, or is cancelled.
pub trait BlockCoro {
    fn tick(&mut self, vm: &mut Vm, ext: &mut ExecState) -> Result<ExecStatus, VmError>;

    /// Cancel or finalize: run pending defers, unwind nested state.
    fn destruct(&mut self, _vm: &mut Vm, _ext: &mut ExecState) -> Result<(), VmError> {
        Ok(())
    }

    /// Contribute nested call frames and the innermost ip to a stack trace.
    /// Returns false when this coroutine has no nested position.
    fn trace(&self, _calls: &mut Vec<Rc<Frame>>, _tip: &mut Option<usize>) -> bool {
        false
    }
}

/// Linear scope with its own suspension bookkeeping. Doubles as a paral
/// branch: when the nested exec finishes, the raw ip is handed to the
/// parent and the enclosing paral block decides whether it fell off its
/// own range (normal finish) or jumped out (break or return).
pub struct SeqBlock {
    pub exec: ExecState,
}

impl SeqBlock {
    pub fn new(frame: Rc<Frame>, min_ip: usize, max_ip: usize) -> Self {
        let mut exec = ExecState::default();
        exec.ip = min_ip;
        exec.regions.push(Region::block(frame, min_ip, max_ip));
        SeqBlock { exec }
    }
}

impl BlockCoro for SeqBlock {
    fn tick(&mut self, vm: &mut Vm, ext: &mut ExecState) -> Result<ExecStatus, VmError> {
        let st = vm.execute_nested(ext, &mut self.exec)?;
        if st == ExecStatus::Success {
            ext.ip = self.exec.ip;
            ext.ret.append(&mut self.exec.ret);
        }
        Ok(st)
    }

    fn destruct(&mut self, vm: &mut Vm, _ext: &mut ExecState) -> Result<(), VmError> {
        vm.exit_scope(&mut self.exec)
    }

    fn trace(&self, calls: &mut Vec<Rc<Frame>>, tip: &mut Option<usize>) -> bool {
        trace_exec(&self.exec, calls, tip);
        true
    }
}

/// First-to-finish parallel block: branches tick left to right each tick;
/// the first branch to finish ends the block and cancels its siblings.
pub struct ParalBlock {
    min_ip: usize,
    max_ip: usize,
    /// Branch being ticked; preserved during cleanup for stack traces.
    cur: usize,
    branches: Vec<Box<dyn BlockCoro>>,
    defers: Vec<DeferBlock>,
}

impl BlockCoro for ParalBlock {
    fn tick(&mut self, vm: &mut Vm, ext: &mut ExecState) -> Result<ExecStatus, VmError> {
        ext.ip = self.min_ip;
        self.cur = 0;
        while self.cur < self.branches.len() {
            let st = self.branches[self.cur].tick(vm, ext)?;
            if st != ExecStatus::Running {
                let mut done = self.branches.remove(self.cur);
                done.destruct(vm, ext)?;
                if ext.ip > self.min_ip && ext.ip < self.max_ip {
                    ext.ip = self.max_ip + 1;
                }
                return Ok(st);
            }
            self.cur += 1;
        }
        Ok(ExecStatus::Running)
    }

    fn destruct(&mut self, vm: &mut Vm, ext: &mut ExecState) -> Result<(), VmError> {
        self.cur = 0;
        while self.cur < self.branches.len() {
            let mut b = std::mem::replace(&mut self.branches[self.cur], Box::new(DoneBranch));
            b.destruct(vm, ext)?;
            self.cur += 1;
        }
        self.branches.clear();
        let defers = std::mem::take(&mut self.defers);
        vm.run_defers(ext, defers)
    }

    fn trace(&self, calls: &mut Vec<Rc<Frame>>, tip: &mut Option<usize>) -> bool {
        match self.branches.get(self.cur) {
            Some(b) => b.trace(calls, tip),
            None => false,
        }
    }
}

/// Wait-all parallel block. Finished branches retire; a failing branch fails
/// the block at once; a branch that jumps out (break or return) force-
/// finishes the block with success, skipping the remaining branches.
pub struct ParalAllBlock {
    min_ip: usize,
    max_ip: usize,
    cur: usize,
    branches: Vec<Box<dyn BlockCoro>>,
    defers: Vec<DeferBlock>,
}

impl BlockCoro for ParalAllBlock {
    fn tick(&mut self, vm: &mut Vm, ext: &mut ExecState) -> Result<ExecStatus, VmError> {
        ext.ip = self.min_ip;
        self.cur = 0;
        while self.cur < self.branches.len() {
            let st = self.branches[self.cur].tick(vm, ext)?;
            if ext.ip < self.min_ip.saturating_sub(1) || ext.ip > self.max_ip + 1 {
                let mut done = self.branches.remove(self.cur);
                done.destruct(vm, ext)?;
                return Ok(ExecStatus::Success);
            }
            match st {
                ExecStatus::Success => {
                    let mut done = self.branches.remove(self.cur);
                    done.destruct(vm, ext)?;
                }
                ExecStatus::Failure => {
                    let mut done = self.branches.remove(self.cur);
                    done.destruct(vm, ext)?;
                    return Ok(ExecStatus::Failure);
                }
                ExecStatus::Running => self.cur += 1,
            }
        }
        if !self.branches.is_empty() {
            return Ok(ExecStatus::Running);
        }
        if ext.ip > self.min_ip && ext.ip < self.max_ip {
            ext.ip = self.max_ip + 1;
        }
        Ok(ExecStatus::Success)
    }

    fn destruct(&mut self, vm: &mut Vm, ext: &mut ExecState) -> Result<(), VmError> {
        self.cur = 0;
        while self.cur < self.branches.len() {
            let mut b = std::mem::replace(&mut self.branches[self.cur], Box::new(DoneBranch));
            b.destruct(vm, ext)?;
            self.cur += 1;
        }
        self.branches.clear();
        let defers = std::mem::take(&mut self.defers);
        vm.run_defers(ext, defers)
    }

    fn trace(&self, calls: &mut Vec<Rc<Frame>>, tip: &mut Option<usize>) -> bool {
        match self.branches.get(self.cur) {
            Some(b) => b.trace(calls, tip),
            None => false,
        }
    }
}

/// Placeholder swapped in while a branch is destructed in place.
struct DoneBranch;

impl BlockCoro for DoneBranch {
    fn tick(&mut self, _vm: &mut Vm, _ext: &mut ExecState) -> Result<ExecStatus, VmError> {
        Ok(ExecStatus::Success)
    }
}

/// Walk a nested exec for trace purposes: contribute its call frames, then
/// either descend into its coroutine or report its own ip as the tip.
pub(crate) fn trace_exec(
    exec: &ExecState,
    calls: &mut Vec<Rc<Frame>>,
    tip: &mut Option<usize>,
) {
    for f in &exec.frames {
        calls.push(Rc::clone(f));
    }
    let nested = exec
        .coroutine
        .as_ref()
        .map_or(false, |c| c.trace(calls, tip));
    if !nested {
        *tip = Some(exec.ip);
    }
}

impl Vm {
    /// Run a nested exec, keeping the outer frame chain visible to trace
    /// capture for the duration.
    pub(crate) fn execute_nested(
        &mut self,
        ext: &mut ExecState,
        sub: &mut ExecState,
    ) -> Result<ExecStatus, VmError> {
        let mark = self.trace_outer.len();
        self.trace_outer.extend(ext.frames.iter().cloned());
        let res = self.execute(sub, 0);
        self.trace_outer.truncate(mark);
        res
    }

    /// Materialize a `Block` instruction. Defer blocks register and are
    /// skipped; the other kinds install a coroutine and leave the ip at the
    /// block instruction for the coroutine tick protocol.
    pub(crate) fn make_block(
        &mut self,
        exec: &mut ExecState,
        frame: &Rc<Frame>,
        kind: BlockKind,
        len: usize,
    ) -> Result<ExecStatus, VmError> {
        let ip = exec.ip;
        match kind {
            BlockKind::Defer => {
                let region = exec
                    .regions
                    .last_mut()
                    .ok_or_else(|| VmError::internal("defer with no region"))?;
                region.defers.push(DeferBlock {
                    frame: Rc::clone(frame),
                    ip: ip + 1,
                    max_ip: ip + len,
                });
                exec.ip = ip + len + 1;
            }
            BlockKind::Seq => {
                exec.coroutine = Some(Box::new(SeqBlock::new(Rc::clone(frame), ip + 1, ip + len)));
            }
            BlockKind::Paral | BlockKind::ParalAll => {
                let (branches, defers) = self.scan_branches(frame, ip, len)?;
                let coro: Box<dyn BlockCoro> = if kind == BlockKind::Paral {
                    Box::new(ParalBlock {
                        min_ip: ip + 1,
                        max_ip: ip + len,
                        cur: 0,
                        branches,
                        defers,
                    })
                } else {
                    Box::new(ParalAllBlock {
                        min_ip: ip + 1,
                        max_ip: ip + len,
                        cur: 0,
                        branches,
                        defers,
                    })
                };
                exec.coroutine = Some(coro);
            }
        }
        Ok(ExecStatus::Success)
    }

    /// Scan a paral body into branch coroutines and block-level defers.
    fn scan_branches(
        &mut self,
        frame: &Rc<Frame>,
        ip: usize,
        len: usize,
    ) -> Result<(Vec<Box<dyn BlockCoro>>, Vec<DeferBlock>), VmError> {
        use crate::opcode::Op;

        let mut branches: Vec<Box<dyn BlockCoro>> = Vec::new();
        let mut defers = Vec::new();
        let end = ip + len;
        let mut j = ip + 1;
        while j <= end {
            match frame.module.code.get(j) {
                Some(&Op::Block(BlockKind::Seq, blen)) => {
                    branches.push(Box::new(SeqBlock::new(
                        Rc::clone(frame),
                        j + 1,
                        j + blen,
                    )));
                    j += blen + 1;
                }
                Some(&Op::Block(BlockKind::Defer, blen)) => {
                    defers.push(DeferBlock {
                        frame: Rc::clone(frame),
                        ip: j + 1,
                        max_ip: j + blen,
                    });
                    j += blen + 1;
                }
                _ => {
                    return Err(VmError::internal(format!(
                        "malformed paral body at {}",
                        j
                    )))
                }
            }
        }
        Ok((branches, defers))
    }
}
