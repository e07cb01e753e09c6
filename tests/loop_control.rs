mod common;

use common::{fatal_message, int, ints, recorder, run, run_done, Asm};
use skein::{IterSource, Op, Program, RunOutcome, Value, Vm, Want};

#[test]
fn last_stops_range_loop_after_third_body() {
    let mut program = Program::default();
    let v = program.add_slot("v").unwrap();
    let say = program.add_host_import("say").unwrap();

    let mut a = Asm::new();
    a.stmt(1);
    a.op(int(1));
    a.op(int(5));
    a.foreach(v, None, IterSource::Range, false, |a| {
        a.stmt(2);
        a.call_host(say, |a| {
            a.op(Op::Load { slot: v });
        });
        a.op(Op::Load { slot: v });
        a.op(int(3));
        a.op(Op::NumEq);
        a.jump_if_false("keep_going");
        a.op(Op::Last { label: None });
        a.label("keep_going");
    });
    program.add_unit(a.finish("main")).unwrap();

    let (log, rec) = recorder();
    let mut vm = Vm::new(program).unwrap();
    vm.register_host(say, rec).unwrap();
    assert!(matches!(vm.run(), RunOutcome::Done { .. }));
    assert_eq!(ints(&log.borrow()), vec![1, 2, 3]);
}

#[test]
fn next_skips_rest_of_body() {
    let mut program = Program::default();
    let v = program.add_slot("v").unwrap();
    let say = program.add_host_import("say").unwrap();

    let mut a = Asm::new();
    a.stmt(1);
    a.op(int(1));
    a.op(int(4));
    a.foreach(v, None, IterSource::Range, false, |a| {
        a.op(Op::Load { slot: v });
        a.op(int(2));
        a.op(Op::NumEq);
        a.jump_if_false("record");
        a.op(Op::Next { label: None });
        a.label("record");
        a.call_host(say, |a| {
            a.op(Op::Load { slot: v });
        });
    });
    program.add_unit(a.finish("main")).unwrap();

    let (log, rec) = recorder();
    let mut vm = Vm::new(program).unwrap();
    vm.register_host(say, rec).unwrap();
    assert!(matches!(vm.run(), RunOutcome::Done { .. }));
    assert_eq!(ints(&log.borrow()), vec![1, 3, 4]);
}

#[test]
fn redo_reruns_body_without_advancing_the_iterator() {
    let mut program = Program::default();
    let v = program.add_slot("v").unwrap();
    let flag = program.add_slot("flag").unwrap();
    let say = program.add_host_import("say").unwrap();

    let mut a = Asm::new();
    a.stmt(1);
    a.op(int(1));
    a.op(int(2));
    a.foreach(v, None, IterSource::Range, false, |a| {
        a.call_host(say, |a| {
            a.op(Op::Load { slot: v });
        });
        a.op(Op::Load { slot: flag });
        a.op(Op::Not);
        a.jump_if_false("no_redo");
        a.op(int(1));
        a.op(Op::Store { slot: flag });
        a.op(Op::Redo { label: None });
        a.label("no_redo");
    });
    program.add_unit(a.finish("main")).unwrap();

    let (log, rec) = recorder();
    let mut vm = Vm::new(program).unwrap();
    vm.register_host(say, rec).unwrap();
    assert!(matches!(vm.run(), RunOutcome::Done { .. }));
    assert_eq!(ints(&log.borrow()), vec![1, 1, 2]);
}

#[test]
fn unlabeled_last_targets_the_innermost_loop() {
    let mut program = Program::default();
    let o = program.add_slot("o").unwrap();
    let i = program.add_slot("i").unwrap();
    let say = program.add_host_import("say").unwrap();

    let mut a = Asm::new();
    a.stmt(1);
    a.op(int(1));
    a.op(int(2));
    a.foreach(o, None, IterSource::Range, false, |a| {
        a.op(int(1));
        a.op(int(9));
        a.foreach(i, None, IterSource::Range, false, |a| {
            a.call_host(say, |a| {
                a.op(Op::Load { slot: o });
                a.op(int(10));
                a.op(Op::Mul);
                a.op(Op::Load { slot: i });
                a.op(Op::Add);
            });
            a.op(Op::Load { slot: i });
            a.op(int(2));
            a.op(Op::NumEq);
            a.jump_if_false("more");
            a.op(Op::Last { label: None });
            a.label("more");
        });
    });
    program.add_unit(a.finish("main")).unwrap();

    let (log, rec) = recorder();
    let mut vm = Vm::new(program).unwrap();
    vm.register_host(say, rec).unwrap();
    assert!(matches!(vm.run(), RunOutcome::Done { .. }));
    assert_eq!(ints(&log.borrow()), vec![11, 12, 21, 22]);
}

#[test]
fn labeled_last_exits_the_matching_outer_loop() {
    let mut program = Program::default();
    let o = program.add_slot("o").unwrap();
    let i = program.add_slot("i").unwrap();
    let say = program.add_host_import("say").unwrap();

    let mut a = Asm::new();
    a.stmt(1);
    a.op(int(1));
    a.op(int(3));
    a.foreach(o, Some("OUTER"), IterSource::Range, false, |a| {
        a.op(int(1));
        a.op(int(3));
        a.foreach(i, None, IterSource::Range, false, |a| {
            a.call_host(say, |a| {
                a.op(Op::Load { slot: o });
                a.op(int(10));
                a.op(Op::Mul);
                a.op(Op::Load { slot: i });
                a.op(Op::Add);
            });
            a.op(Op::Load { slot: i });
            a.op(int(2));
            a.op(Op::NumEq);
            a.jump_if_false("onward");
            a.op(Op::Last {
                label: Some("OUTER".to_string()),
            });
            a.label("onward");
        });
    });
    a.stmt(2);
    a.call_host(say, |a| {
        a.op(int(999));
    });
    program.add_unit(a.finish("main")).unwrap();

    let (log, rec) = recorder();
    let mut vm = Vm::new(program).unwrap();
    vm.register_host(say, rec).unwrap();
    assert!(matches!(vm.run(), RunOutcome::Done { .. }));
    assert_eq!(ints(&log.borrow()), vec![11, 12, 999]);
}

#[test]
fn labeled_next_continues_the_outer_loop() {
    let mut program = Program::default();
    let o = program.add_slot("o").unwrap();
    let i = program.add_slot("i").unwrap();
    let say = program.add_host_import("say").unwrap();

    let mut a = Asm::new();
    a.stmt(1);
    a.op(int(1));
    a.op(int(2));
    a.foreach(o, Some("OUTER"), IterSource::Range, false, |a| {
        a.op(int(1));
        a.op(int(2));
        a.foreach(i, None, IterSource::Range, false, |a| {
            a.call_host(say, |a| {
                a.op(Op::Load { slot: o });
                a.op(int(10));
                a.op(Op::Mul);
                a.op(Op::Load { slot: i });
                a.op(Op::Add);
            });
            a.op(Op::Next {
                label: Some("OUTER".to_string()),
            });
        });
    });
    a.call_host(say, |a| {
        a.op(int(99));
    });
    program.add_unit(a.finish("main")).unwrap();

    let (log, rec) = recorder();
    let mut vm = Vm::new(program).unwrap();
    vm.register_host(say, rec).unwrap();
    assert!(matches!(vm.run(), RunOutcome::Done { .. }));
    assert_eq!(ints(&log.borrow()), vec![11, 21, 99]);
}

#[test]
fn last_across_a_subroutine_frame_is_no_enclosing_loop() {
    let mut program = Program::default();
    let v = program.add_slot("v").unwrap();

    let mut breaker = Asm::new();
    breaker.stmt(1);
    breaker.op(Op::Last { label: None });
    let breaker_id = program.add_unit(breaker.finish("breaker")).unwrap();

    let mut a = Asm::new();
    a.stmt(1);
    a.op(int(1));
    a.op(int(3));
    a.foreach(v, None, IterSource::Range, false, |a| {
        a.call(breaker_id, Want::Void, |_| {});
    });
    let main_id = program.add_unit(a.finish("main")).unwrap();
    program.entry = main_id;

    let message = fatal_message(run(program));
    assert!(
        message.starts_with("Can't \"last\" outside a loop block"),
        "{message}"
    );
}

#[test]
fn missing_label_is_label_not_found() {
    let mut program = Program::default();
    let v = program.add_slot("v").unwrap();

    let mut a = Asm::new();
    a.stmt(1);
    a.op(int(1));
    a.op(int(3));
    a.foreach(v, Some("HERE"), IterSource::Range, false, |a| {
        a.op(Op::Last {
            label: Some("ELSEWHERE".to_string()),
        });
    });
    program.add_unit(a.finish("main")).unwrap();

    let message = fatal_message(run(program));
    assert!(
        message.starts_with("Label not found for \"last ELSEWHERE\""),
        "{message}"
    );
}

#[test]
fn while_loop_honors_last_and_next() {
    let mut program = Program::default();
    let n = program.add_slot("n").unwrap();
    let say = program.add_host_import("say").unwrap();

    let mut a = Asm::new();
    a.stmt(1);
    a.op(int(0));
    a.op(Op::Store { slot: n });
    a.while_loop(
        None,
        |a| {
            a.op(Op::Load { slot: n });
            a.op(int(10));
            a.op(Op::Lt);
        },
        |a| {
            a.op(Op::Load { slot: n });
            a.op(int(1));
            a.op(Op::Add);
            a.op(Op::Store { slot: n });
            // Skip recording even values.
            a.op(Op::Load { slot: n });
            a.op(int(2));
            a.op(Op::NumEq);
            a.jump_if_false("odd");
            a.op(Op::Next { label: None });
            a.label("odd");
            a.call_host(say, |a| {
                a.op(Op::Load { slot: n });
            });
            a.op(Op::Load { slot: n });
            a.op(int(3));
            a.op(Op::NumEq);
            a.jump_if_false("continue");
            a.op(Op::Last { label: None });
            a.label("continue");
        },
    );
    a.call_host(say, |a| {
        a.op(Op::Load { slot: n });
    });
    program.add_unit(a.finish("main")).unwrap();

    let (log, rec) = recorder();
    let mut vm = Vm::new(program).unwrap();
    vm.register_host(say, rec).unwrap();
    assert!(matches!(vm.run(), RunOutcome::Done { .. }));
    assert_eq!(ints(&log.borrow()), vec![1, 3, 3]);
}

#[test]
fn list_context_collects_one_entry_per_iteration() {
    let mut program = Program::default();
    let v = program.add_slot("v").unwrap();

    let mut a = Asm::new();
    a.stmt(1);
    a.op(int(1));
    a.op(int(3));
    a.foreach(v, None, IterSource::Range, false, |a| {
        a.op(Op::Load { slot: v });
        a.op(int(10));
        a.op(Op::Mul);
    });
    program.add_unit(a.finish("main")).unwrap();

    assert_eq!(
        run_done(program),
        vec![Value::Int(10), Value::Int(20), Value::Int(30)]
    );
}

#[test]
fn last_keeps_collected_values_and_discards_the_partial_iteration() {
    let mut program = Program::default();
    let v = program.add_slot("v").unwrap();

    let mut a = Asm::new();
    a.stmt(1);
    a.op(int(1));
    a.op(int(5));
    a.foreach(v, None, IterSource::Range, false, |a| {
        a.op(Op::Load { slot: v });
        a.op(int(10));
        a.op(Op::Mul);
        a.op(Op::Load { slot: v });
        a.op(int(3));
        a.op(Op::NumEq);
        a.jump_if_false("go_on");
        a.op(Op::Last { label: None });
        a.label("go_on");
    });
    program.add_unit(a.finish("main")).unwrap();

    assert_eq!(run_done(program), vec![Value::Int(10), Value::Int(20)]);
}

#[test]
fn scalar_context_keeps_only_the_final_iteration_value() {
    let mut program = Program::default();
    let v = program.add_slot("v").unwrap();

    let mut a = Asm::new();
    a.stmt(1);
    a.op(int(1));
    a.op(int(3));
    a.foreach(v, None, IterSource::Range, false, |a| {
        a.op(Op::Load { slot: v });
        a.op(int(2));
        a.op(Op::Mul);
    });
    program.add_unit(a.finish("main")).unwrap();

    let mut vm = Vm::new(program).unwrap();
    vm.set_root_want(Want::Scalar);
    let RunOutcome::Done { values } = vm.run() else {
        panic!("expected done");
    };
    assert_eq!(values, vec![Value::Int(6)]);
}

#[test]
fn void_context_discards_iteration_values() {
    let mut program = Program::default();
    let v = program.add_slot("v").unwrap();

    let mut a = Asm::new();
    a.stmt(1);
    a.op(int(1));
    a.op(int(3));
    a.foreach(v, None, IterSource::Range, false, |a| {
        a.op(Op::Load { slot: v });
    });
    program.add_unit(a.finish("main")).unwrap();

    let mut vm = Vm::new(program).unwrap();
    vm.set_root_want(Want::Void);
    let RunOutcome::Done { values } = vm.run() else {
        panic!("expected done");
    };
    assert!(values.is_empty());
}
