//! Fiber lifecycle, scheduler control, stack traces, and pool hygiene.

mod common;

use std::cell::RefCell;
use std::rc::Rc;

use common::{arg_prologue, install_log, install_record, ModuleBuilder};
use skein::{
    ArgsInfo, BlockKind, FiberHandle, FiberStatus, NativeOutcome, Op, ResultStatus, Value, Vm,
};

#[test]
fn test_status_lifecycle_and_results() {
    common::init_tracing();
    let mut vm = Vm::new();
    let yld = vm.native_idx("yield").unwrap();
    let mut b = ModuleBuilder::new();
    let c5 = b.num(5.0);
    b.func(
        "main",
        0,
        0,
        vec![],
        vec![
            Op::CallNative(yld, ArgsInfo::new(0)),
            Op::Constant(c5),
            Op::Return(1),
        ],
    );
    vm.register_module(b.build("m")).unwrap();

    let h = vm.start("m", "main", vec![]).unwrap();
    assert_eq!(h.status(), FiberStatus::Idle);
    assert_eq!(h.result_status(), ResultStatus::None);
    vm.tick().unwrap();
    assert_eq!(h.status(), FiberStatus::Suspended);
    assert_eq!(h.result_status(), ResultStatus::Running);
    vm.tick().unwrap();
    assert_eq!(h.status(), FiberStatus::Success);
    assert_eq!(h.result_status(), ResultStatus::Success);
    assert_eq!(h.with(|f| f.ticks), 2);
    assert_eq!(h.results(), vec![Value::Num(5.0)]);
    assert_eq!(h.pop_result(), Some(Value::Num(5.0)));
    assert!(h.results().is_empty());
}

#[test]
fn test_script_starts_and_stops_fibers() {
    let mut vm = Vm::new();
    let (log, log_idx) = install_log(&mut vm);
    let yld = vm.native_idx("yield").unwrap();
    let susp = vm.native_idx("suspend").unwrap();
    let start = vm.native_idx("start").unwrap();
    let stop = vm.native_idx("stop").unwrap();

    let mut b = ModuleBuilder::new();
    let wc = b.str("wclean");
    let worker = b.func(
        "worker",
        0,
        0,
        vec![],
        vec![
            Op::Block(BlockKind::Defer, 2),
            Op::Constant(wc),
            Op::CallNative(log_idx, ArgsInfo::new(1)),
            Op::CallNative(susp, ArgsInfo::new(0)),
        ],
    );
    b.func(
        "main",
        0,
        1,
        vec![],
        vec![
            Op::Lambda(worker),
            Op::CallNative(start, ArgsInfo::new(1)),
            Op::SetVar(0),
            Op::CallNative(yld, ArgsInfo::new(0)),
            Op::GetVar(0),
            Op::CallNative(stop, ArgsInfo::new(1)),
            Op::Return(0),
        ],
    );
    vm.register_module(b.build("m")).unwrap();

    let h = vm.start("m", "main", vec![]).unwrap();
    vm.tick().unwrap();
    assert_eq!(vm.fiber_count(), 2);
    assert!(log.borrow().is_empty());
    vm.tick().unwrap();
    assert_eq!(h.status(), FiberStatus::Success);
    assert_eq!(*log.borrow(), vec!["wclean".to_string()]);
    assert_eq!(vm.fiber_count(), 0);
}

#[test]
fn test_self_stop_is_queued_until_tick_ends() {
    let mut vm = Vm::new();
    let (log, log_idx) = install_log(&mut vm);
    let susp = vm.native_idx("suspend").unwrap();

    let me: Rc<RefCell<Option<FiberHandle>>> = Rc::new(RefCell::new(None));
    let slot = Rc::clone(&me);
    let stop_me = vm.register_native("stop_me", move |vm, _exec, _info| {
        let h = slot.borrow().clone().expect("handle installed by the test");
        vm.stop(&h)?;
        Ok(NativeOutcome::Done)
    });

    let mut b = ModuleBuilder::new();
    let clean = b.str("clean");
    b.func(
        "main",
        0,
        0,
        vec![],
        vec![
            Op::Block(BlockKind::Defer, 2),
            Op::Constant(clean),
            Op::CallNative(log_idx, ArgsInfo::new(1)),
            Op::CallNative(stop_me, ArgsInfo::new(0)),
            Op::CallNative(susp, ArgsInfo::new(0)),
        ],
    );
    vm.register_module(b.build("m")).unwrap();

    let h = vm.start("m", "main", vec![]).unwrap();
    *me.borrow_mut() = Some(h.clone());

    vm.tick().unwrap();
    assert_eq!(h.status(), FiberStatus::Stopped);
    assert_eq!(*log.borrow(), vec!["clean".to_string()]);
}

#[test]
fn test_detach_and_manual_ticking() {
    let mut vm = Vm::new();
    let susp = vm.native_idx("suspend").unwrap();
    let mut b = ModuleBuilder::new();
    b.func(
        "main",
        0,
        0,
        vec![],
        vec![Op::CallNative(susp, ArgsInfo::new(0)), Op::Return(0)],
    );
    vm.register_module(b.build("m")).unwrap();

    let h = vm.start("m", "main", vec![]).unwrap();
    vm.detach(&h);
    assert!(!vm.tick().unwrap());
    assert_eq!(h.status(), FiberStatus::Idle);

    assert!(vm.tick_fiber(&h).unwrap());
    assert_eq!(h.status(), FiberStatus::Suspended);

    vm.attach(&h);
    assert!(vm.tick().unwrap());
    vm.stop(&h).unwrap();
    assert_eq!(h.status(), FiberStatus::Stopped);
}

#[test]
fn test_stop_all() {
    let mut vm = Vm::new();
    let susp = vm.native_idx("suspend").unwrap();
    let mut b = ModuleBuilder::new();
    b.func(
        "main",
        0,
        0,
        vec![],
        vec![Op::CallNative(susp, ArgsInfo::new(0)), Op::Return(0)],
    );
    vm.register_module(b.build("m")).unwrap();

    let a = vm.start("m", "main", vec![]).unwrap();
    let b2 = vm.start("m", "main", vec![]).unwrap();
    vm.tick().unwrap();
    vm.stop_all().unwrap();
    assert_eq!(a.status(), FiberStatus::Stopped);
    assert_eq!(b2.status(), FiberStatus::Stopped);
    assert_eq!(vm.fiber_count(), 0);
}

#[test]
fn test_finished_fiber_is_inert() {
    let mut vm = Vm::new();
    let mut b = ModuleBuilder::new();
    let c5 = b.num(5.0);
    b.func(
        "main",
        0,
        0,
        vec![],
        vec![Op::Constant(c5), Op::Return(1)],
    );
    vm.register_module(b.build("m")).unwrap();

    let h = vm.start("m", "main", vec![]).unwrap();
    vm.tick().unwrap();
    assert_eq!(h.status(), FiberStatus::Success);

    assert!(!vm.tick_fiber(&h).unwrap());
    vm.stop(&h).unwrap();
    assert_eq!(h.status(), FiberStatus::Success);
    assert_eq!(h.results(), vec![Value::Num(5.0)]);
}

#[test]
fn test_stack_trace_between_ticks() {
    let mut vm = Vm::new();
    let yld = vm.native_idx("yield").unwrap();
    let mut b = ModuleBuilder::new();
    let foo = b.func(
        "foo",
        0,
        0,
        vec![],
        vec![Op::CallNative(yld, ArgsInfo::new(0)), Op::Return(0)],
    );
    b.func(
        "main",
        0,
        0,
        vec![],
        vec![Op::CallFunc(foo, ArgsInfo::new(0)), Op::Return(0)],
    );
    vm.register_module(b.build("m")).unwrap();

    let h = vm.start("m", "main", vec![]).unwrap();
    vm.tick().unwrap();
    assert_eq!(h.status(), FiberStatus::Suspended);

    let trace = vm.stack_trace(&h);
    let funcs: Vec<&str> = trace.iter().map(|t| t.func.as_str()).collect();
    assert_eq!(funcs, vec!["foo", "main"]);
    assert!(trace.iter().all(|t| t.file == "m.ski"));
}

#[test]
fn test_stack_trace_from_native_inside_paral() {
    let mut vm = Vm::new();
    let (captured, record) = install_record(&mut vm);
    let mut b = ModuleBuilder::new();
    let wow = b.func(
        "wow",
        0,
        0,
        vec![],
        vec![Op::CallNative(record, ArgsInfo::new(0)), Op::Return(0)],
    );
    let bar = b.func(
        "bar",
        0,
        0,
        vec![],
        vec![Op::CallFunc(wow, ArgsInfo::new(0)), Op::Return(0)],
    );
    let foo = b.func(
        "foo",
        0,
        0,
        vec![],
        vec![Op::CallFunc(bar, ArgsInfo::new(0)), Op::Return(0)],
    );
    b.func(
        "main",
        0,
        0,
        vec![],
        vec![
            Op::Block(BlockKind::Paral, 2),
            Op::Block(BlockKind::Seq, 1),
            Op::CallFunc(foo, ArgsInfo::new(0)),
            Op::Return(0),
        ],
    );
    vm.register_module(b.build("m")).unwrap();

    let h = vm.start("m", "main", vec![]).unwrap();
    vm.tick().unwrap();
    assert_eq!(h.status(), FiberStatus::Success);

    let trace = captured.borrow();
    let funcs: Vec<&str> = trace.iter().map(|t| t.func.as_str()).collect();
    // the paral branch shares main's frame; it must not appear twice
    assert_eq!(funcs, vec!["wow", "bar", "foo", "main"]);
}

#[test]
fn test_pools_balance_after_execution() {
    let mut vm = Vm::new();
    let mut b = ModuleBuilder::new();
    let c1 = b.num(1.0);
    let c2 = b.num(2.0);
    let mut add_body = arg_prologue(&[0, 1]);
    add_body.extend([Op::GetVar(0), Op::GetVar(1), Op::Add, Op::Return(1)]);
    let add = b.func("add", 2, 2, vec![], add_body);
    b.func(
        "main",
        0,
        1,
        vec![],
        vec![
            Op::Constant(c1),
            Op::Constant(c2),
            Op::NewList(2),
            Op::SetVar(0),
            Op::Constant(c1),
            Op::Constant(c2),
            Op::CallFunc(add, ArgsInfo::new(2)),
            Op::Return(1),
        ],
    );
    vm.register_module(b.build("m")).unwrap();

    let h = vm.start("m", "main", vec![]).unwrap();
    vm.tick().unwrap();
    assert_eq!(h.results(), vec![Value::Num(3.0)]);

    let stats = vm.stats();
    assert_eq!(stats.frame_locals.outstanding(), 0);
    assert!(stats.frame_locals.misses >= 2);
    assert_eq!(
        stats.frame_locals.released,
        stats.frame_locals.hits + stats.frame_locals.misses
    );
    assert_eq!(stats.lists.outstanding(), 0);
    assert_eq!(stats.lists.misses, 1);

    // a second run reuses the recycled buffers
    vm.start("m", "main", vec![]).unwrap();
    vm.tick().unwrap();
    let stats = vm.stats();
    assert!(stats.frame_locals.hits >= 2);
    assert!(stats.lists.hits >= 1);
    assert_eq!(stats.frame_locals.outstanding(), 0);
    assert_eq!(stats.lists.outstanding(), 0);
}

#[test]
fn test_frame_buffers_recycle_within_one_run() {
    // repeated calls in a single tick must hit the pool, not allocate
    let mut vm = Vm::new();
    let mut b = ModuleBuilder::new();
    let inner = b.func("inner", 0, 1, vec![], vec![Op::Return(0)]);
    let outer = b.func(
        "outer",
        0,
        1,
        vec![],
        vec![Op::CallFunc(inner, ArgsInfo::new(0)), Op::Return(0)],
    );
    b.func(
        "main",
        0,
        1,
        vec![],
        vec![
            Op::CallFunc(outer, ArgsInfo::new(0)),
            Op::CallFunc(outer, ArgsInfo::new(0)),
            Op::Return(0),
        ],
    );
    vm.register_module(b.build("m")).unwrap();

    let h = vm.start("m", "main", vec![]).unwrap();
    vm.tick().unwrap();
    assert_eq!(h.status(), FiberStatus::Success);

    let stats = vm.stats();
    // the second outer/inner pair reuses the first pair's buffers
    assert!(stats.frame_locals.hits >= 2);
    assert_eq!(stats.frame_locals.outstanding(), 0);
}
