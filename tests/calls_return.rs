mod common;

use common::{fatal_message, int, run, str_op, strings, Asm};
use skein::{Op, Program, RunOutcome, Value, Vm, Want};

#[test]
fn return_values_are_spliced_by_caller_want() {
    let mut program = Program::default();

    let mut triple = Asm::new();
    triple.stmt(1);
    triple.ret(|a| {
        a.op(int(1));
        a.op(int(2));
        a.op(int(3));
    });
    let triple_id = program.add_unit(triple.finish("triple")).unwrap();

    let mut a = Asm::new();
    a.stmt(1);
    a.call(triple_id, Want::List, |_| {});
    a.call(triple_id, Want::Scalar, |_| {});
    a.call(triple_id, Want::Void, |_| {});
    let main_id = program.add_unit(a.finish("main")).unwrap();
    program.entry = main_id;

    let mut vm = Vm::new(program).unwrap();
    let RunOutcome::Done { values } = vm.run() else {
        panic!("expected done");
    };
    assert_eq!(
        values,
        vec![Value::Int(1), Value::Int(2), Value::Int(3), Value::Int(3)]
    );
}

#[test]
fn empty_return_in_scalar_context_yields_undef() {
    let mut program = Program::default();

    let mut nothing = Asm::new();
    nothing.ret(|_| {});
    let nothing_id = program.add_unit(nothing.finish("nothing")).unwrap();

    let mut a = Asm::new();
    a.stmt(1);
    a.call(nothing_id, Want::Scalar, |_| {});
    let main_id = program.add_unit(a.finish("main")).unwrap();
    program.entry = main_id;

    let mut vm = Vm::new(program).unwrap();
    let RunOutcome::Done { values } = vm.run() else {
        panic!("expected done");
    };
    assert_eq!(values, vec![Value::Undef]);
}

#[test]
fn return_outside_a_callable_is_fatal() {
    let mut program = Program::default();
    let mut a = Asm::new();
    a.stmt(1);
    a.ret(|_| {});
    program.add_unit(a.finish("main")).unwrap();

    let message = fatal_message(run(program));
    assert!(
        message.starts_with("Can't return outside a subroutine"),
        "{message}"
    );
}

#[test]
fn wantarray_reflects_the_callers_context() {
    let mut program = Program::default();
    let say = program.add_host_import("say").unwrap();

    let mut observer = Asm::new();
    observer.stmt(1);
    observer.call_host(say, |a| {
        a.op(Op::Wantarray);
    });
    observer.ret(|_| {});
    let observer_id = program.add_unit(observer.finish("observer")).unwrap();

    let mut a = Asm::new();
    a.stmt(1);
    a.call(observer_id, Want::List, |_| {});
    a.call(observer_id, Want::Scalar, |_| {});
    a.call(observer_id, Want::Void, |_| {});
    let main_id = program.add_unit(a.finish("main")).unwrap();
    program.entry = main_id;

    let (log, rec) = common::recorder();
    let mut vm = Vm::new(program).unwrap();
    vm.register_host(say, rec).unwrap();
    assert!(matches!(vm.run(), RunOutcome::Done { .. }));
    assert_eq!(strings(&log.borrow()), vec!["1", "0", ""]);
}

#[test]
fn arguments_are_visible_through_load_arg_and_arg_count() {
    let mut program = Program::default();
    let say = program.add_host_import("say").unwrap();

    let mut sub = Asm::new();
    sub.stmt(1);
    sub.call_host(say, |a| {
        a.op(Op::ArgCount);
        a.op(Op::LoadArg { index: 0 });
        a.op(Op::LoadArg { index: 1 });
        a.op(Op::LoadArg { index: 5 });
    });
    sub.ret(|_| {});
    let sub_id = program.add_unit(sub.finish("shower")).unwrap();

    let mut a = Asm::new();
    a.stmt(1);
    a.call(sub_id, Want::Void, |a| {
        a.op(int(7));
        a.op(str_op("eight"));
    });
    let main_id = program.add_unit(a.finish("main")).unwrap();
    program.entry = main_id;

    let (log, rec) = common::recorder();
    let mut vm = Vm::new(program).unwrap();
    vm.register_host(say, rec).unwrap();
    assert!(matches!(vm.run(), RunOutcome::Done { .. }));
    // Out-of-range arguments read as undef.
    assert_eq!(strings(&log.borrow()), vec!["2", "7", "eight", ""]);
}

#[test]
fn multicall_return_resumes_after_the_light_call() {
    let mut program = Program::default();
    let say = program.add_host_import("say").unwrap();

    let mut cb = Asm::new();
    cb.stmt(1);
    cb.ret(|a| {
        a.op(int(7));
    });
    let cb_id = program.add_unit(cb.finish("callback")).unwrap();

    let mut a = Asm::new();
    a.stmt(1);
    a.op(Op::LightCall { unit: cb_id });
    a.call_host(say, |a| {
        a.op(str_op("after"));
    });
    let main_id = program.add_unit(a.finish("main")).unwrap();
    program.entry = main_id;

    let (log, rec) = common::recorder();
    let mut vm = Vm::new(program).unwrap();
    vm.register_host(say, rec).unwrap();
    let RunOutcome::Done { values } = vm.run() else {
        panic!("expected done");
    };
    assert_eq!(values, vec![Value::Int(7)]);
    assert_eq!(strings(&log.borrow()), vec!["after"]);
}

#[test]
fn format_frames_enter_and_return_like_callables() {
    let mut program = Program::default();

    let mut report = Asm::new();
    report.stmt(1);
    report.ret(|a| {
        a.op(str_op("formatted"));
    });
    let report_id = program.add_unit(report.finish("report")).unwrap();

    let mut a = Asm::new();
    a.stmt(1);
    a.op(Op::EnterFormat { unit: report_id });
    let main_id = program.add_unit(a.finish("main")).unwrap();
    program.entry = main_id;

    let mut vm = Vm::new(program).unwrap();
    let RunOutcome::Done { values } = vm.run() else {
        panic!("expected done");
    };
    assert_eq!(values, vec![Value::Str("formatted".to_string())]);
}

#[test]
fn calling_a_non_code_value_raises() {
    let mut program = Program::default();
    let mut a = Asm::new();
    a.stmt(1);
    a.op(Op::PushMark);
    a.op(int(5));
    a.op(Op::Call { want: Want::Void });
    program.add_unit(a.finish("main")).unwrap();

    let message = fatal_message(run(program));
    assert!(message.starts_with("Not a CODE reference"), "{message}");
}

#[test]
fn exit_terminates_from_any_depth() {
    let mut program = Program::default();
    let v = program.add_slot("v").unwrap();

    let mut deep = Asm::new();
    deep.stmt(1);
    deep.op(int(1));
    deep.op(int(9));
    deep.foreach(v, None, skein::IterSource::Range, false, |a| {
        a.op(int(4));
        a.op(Op::Exit);
    });
    deep.ret(|_| {});
    let deep_id = program.add_unit(deep.finish("deep")).unwrap();

    let mut a = Asm::new();
    a.stmt(1);
    a.call(deep_id, Want::Void, |_| {});
    let main_id = program.add_unit(a.finish("main")).unwrap();
    program.entry = main_id;

    assert_eq!(run(program), RunOutcome::Exited { status: 4 });
}
