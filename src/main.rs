use std::process;

use skein::{
    Block, BlockId, BlockKind, CodeUnit, Const, HostError, IterSource, Op, Program, RunOutcome,
    Slot, Value, Vm, Want,
};

/// A small demonstration program: a range loop cut short by `last`, then a
/// raise captured by a catch frame.
fn demo_program() -> Program {
    let mut program = Program::default();
    let sum = program.add_slot("sum").expect("slot");
    let v = program.add_slot("v").expect("slot");
    let say = program.add_host_import("say").expect("host import");

    let code = vec![
        // my sum = 0;
        Op::Stmt { line: 1, label: None },
        Op::Const { value: Const::Int(0) },
        Op::Store { slot: sum },
        // for v in 1..10 { last if v > 6; sum = sum + v; }
        Op::Stmt { line: 2, label: None },
        Op::Const { value: Const::Int(1) },
        Op::Const { value: Const::Int(10) },
        Op::EnterIter {
            var: v,
            label: None,
            block: BlockId(0),
            source: IterSource::Range,
            reversed: false,
            body_pc: 8,
            next_pc: 7,
            exit_pc: 18,
        },
        Op::IterNext,
        Op::Load { slot: v },
        Op::Const { value: Const::Int(6) },
        Op::Gt,
        Op::JumpIfFalse { target_pc: 13 },
        Op::Last { label: None },
        Op::Load { slot: sum },
        Op::Load { slot: v },
        Op::Add,
        Op::Store { slot: sum },
        Op::Jump { target_pc: 7 },
        // try { raise "demo raise" }
        Op::Stmt { line: 3, label: None },
        Op::EnterTry {
            resume_pc: 24,
            keep_error: false,
        },
        Op::Stmt { line: 4, label: None },
        Op::Const {
            value: Const::Str("demo raise".to_string()),
        },
        Op::Raise,
        Op::LeaveTry,
        // say last_error; say sum;
        Op::Stmt { line: 5, label: None },
        Op::PushMark,
        Op::LastError,
        Op::CallHost { host: say },
        Op::Stmt { line: 6, label: None },
        Op::PushMark,
        Op::Load { slot: sum },
        Op::CallHost { host: say },
    ];

    program
        .add_unit(CodeUnit {
            name: "main".to_string(),
            code,
            blocks: vec![Block {
                parent: None,
                kind: BlockKind::Loop,
                start_pc: 6,
                end_pc: 18,
            }],
        })
        .expect("unit");
    program
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let program = demo_program();
    let say = program.host_import_id("say").expect("say registered");

    let mut vm = match Vm::new(program) {
        Ok(vm) => vm,
        Err(e) => {
            eprintln!("program error: {e}");
            process::exit(2);
        }
    };
    vm.set_root_want(Want::Void);
    vm.register_host(say, |args: &[Value]| {
        for v in args {
            println!("{v}");
        }
        Ok(Vec::new())
    })
    .expect("host registration");

    match vm.run() {
        RunOutcome::Done { .. } => {}
        RunOutcome::Exited { status } => process::exit(status),
        // The message has already been written to the diagnostic stream.
        RunOutcome::Fatal { .. } => process::exit(1),
    }
}
