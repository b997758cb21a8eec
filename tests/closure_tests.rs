//! Closures: by-value snapshots, by-reference cells, and capture
//! pass-through across nesting levels.

mod common;

use common::{arg_prologue, ModuleBuilder};
use skein::{ArgsInfo, Capture, FiberStatus, Op, Value, Vm};

#[test]
fn test_by_value_capture_snapshots() {
    let mut vm = Vm::new();
    let mut b = ModuleBuilder::new();
    let c5 = b.num(5.0);
    let c6 = b.num(6.0);
    let f = b.func(
        "f",
        0,
        1,
        vec![Capture::Copy(0)],
        vec![Op::GetVar(0), Op::Return(1)],
    );
    b.func(
        "main",
        0,
        2,
        vec![],
        vec![
            Op::Constant(c5),
            Op::SetVar(0),
            Op::Lambda(f),
            Op::SetVar(1),
            // mutation after capture must not be visible to the closure
            Op::Constant(c6),
            Op::SetVar(0),
            Op::GetVar(1),
            Op::CallPtr(ArgsInfo::new(0)),
            Op::Return(1),
        ],
    );
    vm.register_module(b.build("m")).unwrap();

    let h = vm.start("m", "main", vec![]).unwrap();
    vm.tick().unwrap();
    assert_eq!(h.results(), vec![Value::Num(5.0)]);
}

#[test]
fn test_by_cell_capture_shares_storage() {
    let mut vm = Vm::new();
    let mut b = ModuleBuilder::new();
    let c1 = b.num(1.0);
    let c5 = b.num(5.0);
    let g = b.func(
        "g",
        0,
        1,
        vec![Capture::Cell(0)],
        vec![
            Op::GetCell(0),
            Op::Constant(c1),
            Op::Add,
            Op::SetCell(0),
        ],
    );
    b.func(
        "main",
        0,
        1,
        vec![],
        vec![
            Op::Constant(c5),
            Op::SetVar(0),
            Op::BoxVar(0),
            Op::Lambda(g),
            Op::CallPtr(ArgsInfo::new(0)),
            Op::GetCell(0),
            Op::Return(1),
        ],
    );
    vm.register_module(b.build("m")).unwrap();

    let h = vm.start("m", "main", vec![]).unwrap();
    vm.tick().unwrap();
    assert_eq!(h.results(), vec![Value::Num(6.0)]);
}

#[test]
fn test_cell_passes_through_nested_lambdas() {
    let mut vm = Vm::new();
    let mut b = ModuleBuilder::new();
    let c1 = b.num(1.0);
    let c42 = b.num(42.0);
    let inner = b.func(
        "inner",
        0,
        1,
        vec![Capture::Cell(0)],
        vec![Op::Constant(c42), Op::SetCell(0)],
    );
    let outer = b.func(
        "outer",
        0,
        1,
        vec![Capture::Cell(0)],
        vec![Op::Lambda(inner), Op::CallPtr(ArgsInfo::new(0))],
    );
    b.func(
        "main",
        0,
        1,
        vec![],
        vec![
            Op::Constant(c1),
            Op::SetVar(0),
            Op::BoxVar(0),
            Op::Lambda(outer),
            Op::CallPtr(ArgsInfo::new(0)),
            Op::GetCell(0),
            Op::Return(1),
        ],
    );
    vm.register_module(b.build("m")).unwrap();

    let h = vm.start("m", "main", vec![]).unwrap();
    vm.tick().unwrap();
    assert_eq!(h.status(), FiberStatus::Success);
    assert_eq!(h.results(), vec![Value::Num(42.0)]);
}

#[test]
fn test_two_closures_hold_distinct_snapshots() {
    let mut vm = Vm::new();
    let mut b = ModuleBuilder::new();
    let c1 = b.num(1.0);
    let c2 = b.num(2.0);
    let f = b.func(
        "f",
        0,
        1,
        vec![Capture::Copy(0)],
        vec![Op::GetVar(0), Op::Return(1)],
    );
    b.func(
        "main",
        0,
        3,
        vec![],
        vec![
            Op::Constant(c1),
            Op::SetVar(0),
            Op::Lambda(f),
            Op::SetVar(1),
            Op::Constant(c2),
            Op::SetVar(0),
            Op::Lambda(f),
            Op::SetVar(2),
            Op::GetVar(1),
            Op::CallPtr(ArgsInfo::new(0)),
            Op::GetVar(2),
            Op::CallPtr(ArgsInfo::new(0)),
            Op::Add,
            Op::Return(1),
        ],
    );
    vm.register_module(b.build("m")).unwrap();

    let h = vm.start("m", "main", vec![]).unwrap();
    vm.tick().unwrap();
    assert_eq!(h.results(), vec![Value::Num(3.0)]);
}

#[test]
fn test_closure_call_with_arguments() {
    let mut vm = Vm::new();
    let mut b = ModuleBuilder::new();
    let c3 = b.num(3.0);
    let c4 = b.num(4.0);
    let mut adder_body = arg_prologue(&[0, 1]);
    adder_body.extend([Op::GetVar(0), Op::GetVar(1), Op::Add, Op::Return(1)]);
    let adder = b.func("adder", 2, 2, vec![], adder_body);
    b.func(
        "main",
        0,
        0,
        vec![],
        vec![
            Op::Constant(c3),
            Op::Constant(c4),
            Op::Lambda(adder),
            Op::CallPtr(ArgsInfo::new(2)),
            Op::Return(1),
        ],
    );
    vm.register_module(b.build("m")).unwrap();

    let h = vm.start("m", "main", vec![]).unwrap();
    vm.tick().unwrap();
    assert_eq!(h.results(), vec![Value::Num(7.0)]);
}

#[test]
fn test_closure_as_function_argument() {
    let mut vm = Vm::new();
    let mut b = ModuleBuilder::new();
    let c11 = b.num(11.0);
    let k = b.func("k", 0, 0, vec![], vec![Op::Constant(c11), Op::Return(1)]);
    let apply = b.func(
        "apply",
        1,
        1,
        vec![],
        vec![
            Op::ArgVar(0),
            Op::GetVar(0),
            Op::CallPtr(ArgsInfo::new(0)),
            Op::Return(1),
        ],
    );
    b.func(
        "main",
        0,
        0,
        vec![],
        vec![
            Op::Lambda(k),
            Op::CallFunc(apply, ArgsInfo::new(1)),
            Op::Return(1),
        ],
    );
    vm.register_module(b.build("m")).unwrap();

    let h = vm.start("m", "main", vec![]).unwrap();
    vm.tick().unwrap();
    assert_eq!(h.results(), vec![Value::Num(11.0)]);
}
