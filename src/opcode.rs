//! The instruction set consumed by the execution engine.
//!
//! A module is one flat code space (`Vec<Op>`); functions are entry offsets
//! within it. Jump targets are absolute instruction indices. The front end
//! (out of scope) is expected to emit a validated stream; `Module::validate`
//! re-checks the structural rules the engine relies on.

/// Which formal parameters of a call were explicitly supplied.
///
/// `num_args` is the number of values the caller actually pushed;
/// bit `i` of `defaults_mask` is set when formal `i` was omitted and its
/// default-value expression must run (see [`Op::DefArg`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ArgsInfo {
    pub num_args: u8,
    pub defaults_mask: u32,
}

impl ArgsInfo {
    pub fn new(num_args: u8) -> Self {
        ArgsInfo {
            num_args,
            defaults_mask: 0,
        }
    }

    pub fn with_defaults(num_args: u8, defaults_mask: u32) -> Self {
        ArgsInfo {
            num_args,
            defaults_mask,
        }
    }

    /// True when formal `idx` was omitted by the caller and the callee
    /// must evaluate its default-value expression.
    pub fn default_used(&self, idx: u8) -> bool {
        (self.defaults_mask >> idx) & 1 == 1
    }
}

/// Structured block kinds materialized by [`Op::Block`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    /// Linear scope with its own suspension/defer bookkeeping.
    Seq,
    /// First-to-finish parallel block.
    Paral,
    /// Wait-all parallel block (early-exit override for return/break).
    ParalAll,
    /// Deferred cleanup block: registered, not executed, at this point.
    Defer,
}

/// One instruction.
///
/// Local-variable indices are frame slot indices fixed at compile time.
/// A scope containing no suspension point, no break/continue/return target
/// and no defer is emitted with no `Block` record at all.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Op {
    Nop,

    // -- constants and operand stack --
    Constant(u32),
    Pop,

    // -- arithmetic / logic (numbers and strings per Value semantics) --
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    UnaryNot,
    UnaryNeg,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,

    // -- locals --
    DeclVar(u8),
    GetVar(u8),
    SetVar(u8),
    Inc(u8),
    Dec(u8),
    /// Pop one call argument into a local slot (by value).
    ArgVar(u8),
    /// Pop one call argument into a local slot; the popped value is a Cell
    /// aliasing the caller's storage (by reference).
    ArgRef(u8),

    // -- by-reference cells --
    /// Re-box the local's current value into a fresh shared cell, in place.
    BoxVar(u8),
    /// Push the cell held in the local slot (the cell itself, not its value).
    RefVar(u8),
    /// Push the value read through the cell held in the local slot.
    GetCell(u8),
    /// Pop a value and write it through the cell held in the local slot.
    SetCell(u8),

    // -- jumps (absolute targets) --
    Jump(usize),
    JumpZ(usize),

    // -- classes / instances --
    New(u16),
    GetAttr(u16),
    SetAttr(u16),
    GetStatic(u16, u16),
    SetStatic(u16, u16),

    // -- lists --
    NewList(u16),
    ListGet,
    ListSet,
    ListLen,

    // -- calls --
    CallFunc(u32, ArgsInfo),
    CallNative(u32, ArgsInfo),
    CallMethodVirt(u16, ArgsInfo),
    CallPtr(ArgsInfo),

    // -- closures --
    /// Create a closure over the function's declared capture list,
    /// capturing from the current frame at this point of execution.
    Lambda(u32),

    // -- default arguments --
    /// Jump to `.1` (skipping the default-value expression) when formal
    /// `.0` was explicitly supplied by the caller.
    DefArg(u8, usize),

    // -- control --
    /// Pop `n` return values and unwind to the function's exit.
    Return(u8),
    /// Function epilogue: run frame defers, hand results to the caller,
    /// release the frame.
    ExitFrame,
    /// Begin a structured block spanning the next `len` instructions.
    Block(BlockKind, usize),
}
