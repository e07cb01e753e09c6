#![allow(dead_code)]

//! Shared helpers for the integration suite: a tiny op assembler with
//! symbolic labels (the tests' stand-in for the out-of-scope front-end),
//! plus program-running and host-recording conveniences.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use skein::{
    Block, BlockId, BlockKind, CodeUnit, Const, HostError, HostId, IterSource, Op, Pc, Program,
    RunOutcome, Slot, UnitId, Value, Vm, Want,
};

pub fn int(n: i64) -> Op {
    Op::Const {
        value: Const::Int(n),
    }
}

pub fn str_op(s: &str) -> Op {
    Op::Const {
        value: Const::Str(s.to_string()),
    }
}

pub fn code_op(unit: UnitId) -> Op {
    Op::Const {
        value: Const::Code(unit),
    }
}

pub fn undef_op() -> Op {
    Op::Const {
        value: Const::Undef,
    }
}

pub fn ints(values: &[Value]) -> Vec<i64> {
    values.iter().map(Value::as_int).collect()
}

pub fn strings(values: &[Value]) -> Vec<String> {
    values.iter().map(Value::to_string).collect()
}

pub fn run(program: Program) -> RunOutcome {
    Vm::new(program).expect("valid program").run()
}

pub fn run_done(program: Program) -> Vec<Value> {
    match run(program) {
        RunOutcome::Done { values } => values,
        other => panic!("expected done, got {other:?}"),
    }
}

pub fn fatal_message(out: RunOutcome) -> String {
    match out {
        RunOutcome::Fatal { message } => message,
        other => panic!("expected fatal, got {other:?}"),
    }
}

/// A host import that records every argument it receives.
pub fn recorder() -> (
    Rc<RefCell<Vec<Value>>>,
    impl FnMut(&[Value]) -> Result<Vec<Value>, HostError>,
) {
    let log = Rc::new(RefCell::new(Vec::new()));
    let sink = log.clone();
    (log, move |args: &[Value]| {
        sink.borrow_mut().extend(args.iter().cloned());
        Ok(Vec::new())
    })
}

/// A small assembler over [`Op`] with symbolic labels, block-tree
/// bookkeeping, and structured helpers for the looping and exception
/// constructs. `finish` resolves every label reference and yields a
/// [`CodeUnit`].
#[derive(Default)]
pub struct Asm {
    ops: Vec<Op>,
    blocks: Vec<Block>,
    open_blocks: Vec<BlockId>,
    labels: HashMap<String, Pc>,
    patches: Vec<(usize, &'static str, String)>,
    fresh: u32,
}

impl Asm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn op(&mut self, op: Op) -> &mut Self {
        self.ops.push(op);
        self
    }

    pub fn here(&self) -> Pc {
        self.ops.len() as Pc
    }

    /// Defines `name` at the current pc.
    pub fn label(&mut self, name: &str) -> &mut Self {
        if self.labels.insert(name.to_string(), self.here()).is_some() {
            panic!("assembler label `{name}` defined twice");
        }
        self
    }

    fn fresh_name(&mut self, base: &str) -> String {
        self.fresh += 1;
        format!("{base}#{}", self.fresh)
    }

    fn patched(&mut self, op: Op, fields: &[(&'static str, &str)]) {
        let ix = self.ops.len();
        self.ops.push(op);
        for (field, label) in fields {
            self.patches.push((ix, field, label.to_string()));
        }
    }

    pub fn stmt(&mut self, line: u32) -> &mut Self {
        self.op(Op::Stmt { line, label: None })
    }

    pub fn stmt_labeled(&mut self, line: u32, label: &str) -> &mut Self {
        self.op(Op::Stmt {
            line,
            label: Some(label.to_string()),
        })
    }

    pub fn jump(&mut self, target: &str) {
        self.patched(Op::Jump { target_pc: Pc::MAX }, &[("target", target)]);
    }

    pub fn jump_if_false(&mut self, target: &str) {
        self.patched(Op::JumpIfFalse { target_pc: Pc::MAX }, &[("target", target)]);
    }

    pub fn begin_block(&mut self, kind: BlockKind) -> BlockId {
        let parent = self.open_blocks.last().copied();
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(Block {
            parent,
            kind,
            start_pc: self.here(),
            end_pc: Pc::MAX,
        });
        self.open_blocks.push(id);
        id
    }

    pub fn end_block(&mut self) {
        let id = self.open_blocks.pop().expect("an open block");
        self.blocks[id.0 as usize].end_pc = self.here();
    }

    /// `{ ... }` — a bare lexical block with its own pseudo frame.
    pub fn bare_block(&mut self, body: impl FnOnce(&mut Asm)) {
        let id = self.begin_block(BlockKind::Bare);
        self.op(Op::EnterBlock { block: id });
        body(self);
        self.op(Op::LeaveBlock);
        self.end_block();
    }

    /// `for var (source) { ... }` — the iteration source must already be on
    /// the stack (marked values for `Stack`, two bounds for `Range`).
    pub fn foreach(
        &mut self,
        var: Slot,
        label: Option<&str>,
        source: IterSource,
        reversed: bool,
        body: impl FnOnce(&mut Asm),
    ) {
        let next_l = self.fresh_name("iter_next");
        let body_l = self.fresh_name("iter_body");
        let exit_l = self.fresh_name("iter_exit");
        let block = self.begin_block(BlockKind::Loop);
        self.patched(
            Op::EnterIter {
                var,
                label: label.map(str::to_string),
                block,
                source,
                reversed,
                body_pc: Pc::MAX,
                next_pc: Pc::MAX,
                exit_pc: Pc::MAX,
            },
            &[("body", &body_l), ("next", &next_l), ("exit", &exit_l)],
        );
        self.label(&next_l);
        self.op(Op::IterNext);
        self.label(&body_l);
        body(self);
        self.jump(&next_l);
        self.end_block();
        self.label(&exit_l);
    }

    /// `while (cond) { ... }`.
    pub fn while_loop(
        &mut self,
        label: Option<&str>,
        cond: impl FnOnce(&mut Asm),
        body: impl FnOnce(&mut Asm),
    ) {
        let cond_l = self.fresh_name("loop_cond");
        let body_l = self.fresh_name("loop_body");
        let leave_l = self.fresh_name("loop_leave");
        let exit_l = self.fresh_name("loop_exit");
        let block = self.begin_block(BlockKind::Loop);
        self.patched(
            Op::EnterLoop {
                label: label.map(str::to_string),
                block,
                body_pc: Pc::MAX,
                next_pc: Pc::MAX,
                exit_pc: Pc::MAX,
            },
            &[("body", &body_l), ("next", &cond_l), ("exit", &exit_l)],
        );
        self.label(&cond_l);
        cond(self);
        self.jump_if_false(&leave_l);
        self.label(&body_l);
        body(self);
        self.jump(&cond_l);
        self.label(&leave_l);
        self.op(Op::LeaveLoop);
        self.end_block();
        self.label(&exit_l);
    }

    /// `try { ... }` — on raise, control resumes right after the construct.
    pub fn try_block(&mut self, keep_error: bool, body: impl FnOnce(&mut Asm)) {
        let resume = self.fresh_name("try_resume");
        self.patched(
            Op::EnterTry {
                resume_pc: Pc::MAX,
                keep_error,
            },
            &[("resume", &resume)],
        );
        body(self);
        self.op(Op::LeaveTry);
        self.label(&resume);
    }

    /// `eval $src` — source text must already be on the stack.
    pub fn eval_text(&mut self) {
        let resume = self.fresh_name("eval_resume");
        self.patched(Op::EvalText { resume_pc: Pc::MAX }, &[("resume", &resume)]);
        self.label(&resume);
    }

    /// `grep { ... } list` — marked source values must be on the stack.
    pub fn grep(&mut self, topic: Slot, want: Want, body: impl FnOnce(&mut Asm)) {
        self.lazy(false, topic, want, body);
    }

    /// `map { ... } list`.
    pub fn map(&mut self, topic: Slot, want: Want, body: impl FnOnce(&mut Asm)) {
        self.lazy(true, topic, want, body);
    }

    fn lazy(&mut self, is_map: bool, topic: Slot, want: Want, body: impl FnOnce(&mut Asm)) {
        let body_l = self.fresh_name("lazy_body");
        let done_l = self.fresh_name("lazy_done");
        let start = if is_map {
            Op::MapStart {
                topic,
                body_pc: Pc::MAX,
                done_pc: Pc::MAX,
                want,
            }
        } else {
            Op::GrepStart {
                topic,
                body_pc: Pc::MAX,
                done_pc: Pc::MAX,
                want,
            }
        };
        self.patched(start, &[("body", &body_l), ("done", &done_l)]);
        self.label(&body_l);
        body(self);
        let cont = if is_map {
            Op::MapWhile { body_pc: Pc::MAX }
        } else {
            Op::GrepWhile { body_pc: Pc::MAX }
        };
        self.patched(cont, &[("body", &body_l)]);
        self.label(&done_l);
    }

    /// `callee(args...)`.
    pub fn call(&mut self, unit: UnitId, want: Want, args: impl FnOnce(&mut Asm)) {
        self.op(Op::PushMark);
        args(self);
        self.op(code_op(unit));
        self.op(Op::Call { want });
    }

    pub fn call_host(&mut self, host: HostId, args: impl FnOnce(&mut Asm)) {
        self.op(Op::PushMark);
        args(self);
        self.op(Op::CallHost { host });
    }

    /// `return values...`.
    pub fn ret(&mut self, values: impl FnOnce(&mut Asm)) {
        self.op(Op::PushMark);
        values(self);
        self.op(Op::Return);
    }

    pub fn finish(self, name: &str) -> CodeUnit {
        assert!(
            self.open_blocks.is_empty(),
            "unbalanced blocks in unit `{name}`"
        );
        let Asm {
            mut ops,
            blocks,
            labels,
            patches,
            ..
        } = self;
        for (ix, field, label) in patches {
            let pc = *labels
                .get(&label)
                .unwrap_or_else(|| panic!("undefined assembler label `{label}`"));
            patch_op(&mut ops[ix], field, pc);
        }
        CodeUnit {
            name: name.to_string(),
            code: ops,
            blocks,
        }
    }
}

fn patch_op(op: &mut Op, field: &str, pc: Pc) {
    match (op, field) {
        (Op::Jump { target_pc }, "target") => *target_pc = pc,
        (Op::JumpIfFalse { target_pc }, "target") => *target_pc = pc,
        (Op::EnterTry { resume_pc, .. }, "resume") => *resume_pc = pc,
        (Op::EvalText { resume_pc }, "resume") => *resume_pc = pc,
        (Op::EnterIter { body_pc, .. }, "body") => *body_pc = pc,
        (Op::EnterIter { next_pc, .. }, "next") => *next_pc = pc,
        (Op::EnterIter { exit_pc, .. }, "exit") => *exit_pc = pc,
        (Op::EnterLoop { body_pc, .. }, "body") => *body_pc = pc,
        (Op::EnterLoop { next_pc, .. }, "next") => *next_pc = pc,
        (Op::EnterLoop { exit_pc, .. }, "exit") => *exit_pc = pc,
        (Op::SubstIter { body_pc }, "body") => *body_pc = pc,
        (Op::GrepStart { body_pc, .. }, "body") => *body_pc = pc,
        (Op::GrepStart { done_pc, .. }, "done") => *done_pc = pc,
        (Op::MapStart { body_pc, .. }, "body") => *body_pc = pc,
        (Op::MapStart { done_pc, .. }, "done") => *done_pc = pc,
        (Op::GrepWhile { body_pc }, "body") => *body_pc = pc,
        (Op::MapWhile { body_pc }, "body") => *body_pc = pc,
        (op, field) => panic!("cannot patch field `{field}` of {op:?}"),
    }
}
