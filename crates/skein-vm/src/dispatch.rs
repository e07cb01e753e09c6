//! The control-transfer dispatcher: `return`, loop control, `goto`, and
//! raise/catch. Every non-local transfer locates a target frame on the
//! context stack, unwinds the frames above it (each drain bounded by the
//! frame's recorded watermark), and resumes at a continuation recorded in
//! the target.

use tracing::{debug, warn};

use skein_code::{BlockId, BlockKind, IterSource, Pc, Slot, UnitId, Want};

use crate::context::{
    Continuation, EvalData, EvalKind, FormatData, Frame, FrameKind, LoopData, LoopSearch,
    PseudoData, SubData, SubstData,
};
use crate::iter::IterState;
use crate::{EvalScope, ModuleState, RunOutcome, Value, Vm};

/// Replay-chain cap for `goto` into nested blocks.
const GOTO_REPLAY_LIMIT: usize = 64;
/// Recursion depth at which entering a unit warns.
const DEEP_RECURSION_WARN: u32 = 100;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum LoopCtl {
    Last,
    Next,
    Redo,
}

impl LoopCtl {
    fn name(self) -> &'static str {
        match self {
            LoopCtl::Last => "last",
            LoopCtl::Next => "next",
            LoopCtl::Redo => "redo",
        }
    }
}

impl Vm {
    /// An inconsistent program state (a machine bug, not a user error);
    /// terminates the run without touching the last-error slot.
    pub(crate) fn fatal(&mut self, message: String) -> RunOutcome {
        RunOutcome::Fatal { message }
    }

    /// An uncaught raise: the message goes to the diagnostic stream and the
    /// run terminates.
    fn fatal_uncaught(&mut self, msg: Value) -> RunOutcome {
        let mut text = msg.to_string();
        if !text.ends_with('\n') {
            text.push('\n');
        }
        eprint!("{text}");
        RunOutcome::Fatal { message: text }
    }

    pub(crate) fn push_new_frame(&mut self, kind: FrameKind, oldsp: usize, want: Want) {
        self.cx.push(Frame {
            kind,
            oldsp,
            oldmark: self.marks.len(),
            oldlazy: self.lazy.len(),
            scope: self.saves.height(),
            oldloc: self.loc,
            want,
        });
    }

    /// Restores the value/mark stacks and location marker recorded in an
    /// exiting frame.
    fn restore_frame_base(&mut self, frame: &Frame) {
        self.stack.truncate(frame.oldsp);
        self.marks.truncate(frame.oldmark);
        self.lazy.truncate(frame.oldlazy);
        self.loc = frame.oldloc;
    }

    /// Splices returned values onto the stack honoring the target's want:
    /// `Void` discards, `Scalar` keeps the last value only, `List` keeps
    /// all.
    fn splice_values(&mut self, mut values: Vec<Value>, want: Want) {
        match want {
            Want::Void => {}
            Want::Scalar => self.stack.push(values.pop().unwrap_or(Value::Undef)),
            Want::List => self.stack.append(&mut values),
        }
    }

    /// Pops the top frame during an unwind: per-kind bookkeeping, then a
    /// drain to the frame's watermark. An error from a cleanup is returned
    /// to the caller, which must treat the unwind target as stale.
    fn pop_frame_unwound(&mut self) -> Result<(), String> {
        let frame = self.cx.pop().expect("unwind with an empty context stack");
        debug!("unwinding {} frame", frame.kind_name());
        match &frame.kind {
            FrameKind::Sub(sub) => {
                let d = &mut self.unit_depths[sub.unit.0 as usize];
                *d = d.saturating_sub(1);
            }
            FrameKind::Eval(data) => {
                self.in_eval = data.saved_in_eval;
                if let EvalKind::Require { module } = &data.kind {
                    // The load did not finish; the success assumption must
                    // be reversible.
                    if matches!(self.modules.get(module), Some(ModuleState::InProgress)) {
                        self.modules.remove(module);
                    }
                }
            }
            _ => {}
        }
        self.marks.truncate(frame.oldmark);
        self.lazy.truncate(frame.oldlazy);
        self.close_scope(frame.scope)
    }

    /// Unwinds all frames above `keep` (or every frame when `keep` is
    /// `None`). Returns `Ok(true)` when a cleanup raised and control has
    /// already been transferred elsewhere; the caller abandons its own
    /// transfer.
    fn unwind_to(&mut self, keep: Option<usize>) -> Result<bool, RunOutcome> {
        let floor = keep.map(|ix| ix + 1).unwrap_or(0);
        while self.cx.len() > floor {
            if let Err(msg) = self.pop_frame_unwound() {
                let located = self.with_location(msg);
                self.raise_value(Value::Str(located))?;
                return Ok(true);
            }
        }
        Ok(false)
    }

    // ---- raise / catch -------------------------------------------------

    /// Raises `msg` as a user-level exception: stores it in the last-error
    /// slot and transfers control to the nearest exception frame. Exposed so
    /// host subsystems can trigger the same unwinding as a script-level
    /// raise; an `Err` is the run's final outcome (nothing caught it).
    pub fn raise_str(&mut self, msg: String) -> Result<(), RunOutcome> {
        let msg = if msg.is_empty() {
            "Died".to_string()
        } else {
            msg
        };
        let msg = self.with_location(msg);
        self.raise_value(Value::Str(msg))
    }

    /// Transfers control to the nearest exception frame's captured
    /// resumption environment, storing `msg` in the last-error slot.
    ///
    /// Re-entrant case: when a cleanup running during this unwind raises,
    /// the environment of the frame being unwound is stale; the search
    /// continues outward to the next surviving exception frame, preserving
    /// the newer error.
    pub(crate) fn raise_value(&mut self, msg: Value) -> Result<(), RunOutcome> {
        let mut msg = msg;
        'searching: loop {
            self.last_error = msg.clone();
            if !self.in_eval {
                return Err(self.fatal_uncaught(msg));
            }
            let Some(ix) = self.cx.find_eval("die") else {
                return Err(self.fatal_uncaught(msg));
            };

            while self.cx.len() > ix + 1 {
                if let Err(new_msg) = self.pop_frame_unwound() {
                    msg = Value::Str(self.with_location(new_msg));
                    continue 'searching;
                }
            }

            // Pop the target frame itself. If its own drain raises, the
            // captured environment is stale and the new error propagates
            // outward.
            let frame = self.cx.pop().expect("exception frame present");
            let FrameKind::Eval(data) = frame.kind else {
                return Err(self.fatal("panic: die".to_string()));
            };
            self.in_eval = data.saved_in_eval;
            if let EvalKind::Require { module } = &data.kind {
                self.modules.remove(module);
            }
            self.marks.truncate(frame.oldmark);
            self.lazy.truncate(frame.oldlazy);
            if let Err(new_msg) = self.close_scope(frame.scope) {
                msg = Value::Str(self.with_location(new_msg));
                continue 'searching;
            }
            self.loc = frame.oldloc;

            match data.kind {
                EvalKind::Require { .. } => {
                    // A failed load converts into a new raise seen by the
                    // requiring scope.
                    let text = msg.to_string();
                    msg = Value::Str(
                        self.with_location(format!("{text}Compilation failed in require")),
                    );
                    continue 'searching;
                }
                EvalKind::Try | EvalKind::Text => {
                    self.stack.truncate(frame.oldsp);
                    match frame.want {
                        Want::Void => {}
                        Want::Scalar | Want::List => self.stack.push(msg.clone()),
                    }
                    self.last_error = msg;
                    self.unit = data.resume.unit;
                    self.pc = data.resume.pc;
                    return Ok(());
                }
            }
        }
    }

    pub(crate) fn op_enter_try(&mut self, resume_pc: Pc, keep_error: bool) {
        let want = self.cur_want();
        let oldsp = self.stack.len();
        self.push_new_frame(
            FrameKind::Eval(EvalData {
                kind: EvalKind::Try,
                resume: Continuation {
                    unit: self.unit,
                    pc: resume_pc as usize,
                },
                keep_error,
                saved_in_eval: self.in_eval,
            }),
            oldsp,
            want,
        );
        self.in_eval = true;
        if !keep_error {
            self.last_error = Value::Str(String::new());
        }
    }

    pub(crate) fn op_leave_try(&mut self) -> Result<(), RunOutcome> {
        let is_eval = matches!(self.cx.top().map(|f| &f.kind), Some(FrameKind::Eval(_)));
        if !is_eval {
            return Err(self.fatal("mismatched leave_try".to_string()));
        }
        let frame = self.cx.pop().expect("eval frame present");
        let FrameKind::Eval(ref data) = frame.kind else {
            unreachable!("checked above");
        };
        self.in_eval = data.saved_in_eval;
        if !data.keep_error {
            self.last_error = Value::Str(String::new());
        }
        let at = frame.oldsp.min(self.stack.len());
        let values: Vec<Value> = self.stack.drain(at..).collect();
        self.marks.truncate(frame.oldmark);
        self.lazy.truncate(frame.oldlazy);
        if let Err(msg) = self.close_scope(frame.scope) {
            return self.raise_str(msg);
        }
        self.loc = frame.oldloc;
        let want = frame.want;
        match want {
            Want::Scalar => self.stack.push(values.last().cloned().unwrap_or(Value::Undef)),
            Want::List => self.stack.extend(values),
            Want::Void => {}
        }
        Ok(())
    }

    pub(crate) fn op_raise(&mut self) -> Result<(), RunOutcome> {
        let Some(v) = self.stack.pop() else {
            return Err(self.fatal("value stack underflow in raise".to_string()));
        };
        match v {
            Value::Str(s) => self.raise_str(s),
            Value::Undef => self.raise_str(String::new()),
            other => self.raise_value(other),
        }
    }

    // ---- eval-string and require ---------------------------------------

    /// Brings the per-program side tables in line after the compiler
    /// collaborator extended the program.
    fn sync_program_tables(&mut self) {
        self.unit_depths.resize(self.program.units.len(), 0);
        while self.host_fns.len() < self.program.hosts.len() {
            self.host_fns.push(None);
        }
        while self.slots.len() < self.program.slots.len() {
            self.slots.push(Value::Undef.cell());
        }
    }

    pub(crate) fn op_eval_text(&mut self, resume_pc: Pc) -> Result<(), RunOutcome> {
        let Some(src) = self.stack.pop() else {
            return Err(self.fatal("value stack underflow in eval".to_string()));
        };
        let source = src.to_string();
        let Some(mut compiler) = self.compiler.take() else {
            return self.raise_str("eval requires a compiler collaborator".to_string());
        };
        let scope = EvalScope {
            unit: self.unit,
            loc: self.loc,
        };
        let result = compiler.compile(&source, scope, &mut self.program);
        self.compiler = Some(compiler);
        let unit_id = match result {
            Ok(id) => id,
            Err(e) => return self.raise_str(e.message),
        };
        self.sync_program_tables();
        if let Err(e) = skein_code::verify_program(&self.program) {
            return Err(self.fatal(format!("compiler produced an invalid program: {e}")));
        }
        if self.program.unit(unit_id).is_none() {
            return Err(self.fatal("compiler returned an unknown unit id".to_string()));
        }

        let want = self.cur_want();
        let oldsp = self.stack.len();
        self.push_new_frame(
            FrameKind::Eval(EvalData {
                kind: EvalKind::Text,
                resume: Continuation {
                    unit: self.unit,
                    pc: resume_pc as usize,
                },
                keep_error: false,
                saved_in_eval: self.in_eval,
            }),
            oldsp,
            want,
        );
        self.in_eval = true;
        self.unit = unit_id;
        self.pc = 0;
        Ok(())
    }

    pub(crate) fn op_require(&mut self) -> Result<(), RunOutcome> {
        let Some(name_v) = self.stack.pop() else {
            return Err(self.fatal("value stack underflow in require".to_string()));
        };
        let name = name_v.to_string();
        if name.is_empty() {
            return self.raise_str("Null filename used".to_string());
        }
        // A finished or in-progress load is simply true; the in-progress
        // mark is what stops recursive loads from recursing forever.
        if self.modules.contains_key(&name) {
            self.stack.push(Value::Int(1));
            return Ok(());
        }

        let Some(mut locator) = self.locator.take() else {
            return self.raise_str("require needs a module locator collaborator".to_string());
        };
        let located = locator.locate(&name, &self.search_paths);
        self.locator = Some(locator);
        let source = match located {
            Ok(s) => s,
            Err(_) => {
                return self.raise_str(format!("Can't locate {name} in module search path"));
            }
        };

        // Mark the load before compiling so a recursive require of the same
        // module sees it.
        self.modules.insert(name.clone(), ModuleState::InProgress);

        let Some(mut compiler) = self.compiler.take() else {
            self.modules.remove(&name);
            return self.raise_str("require needs a compiler collaborator".to_string());
        };
        let scope = EvalScope {
            unit: self.unit,
            loc: self.loc,
        };
        let result = compiler.compile(&source, scope, &mut self.program);
        self.compiler = Some(compiler);
        let unit_id = match result {
            Ok(id) => id,
            Err(e) => {
                self.modules.remove(&name);
                let mut text = e.message;
                if !text.ends_with('\n') {
                    text = self.with_location(text);
                }
                let full = self.with_location(format!("{text}Compilation failed in require"));
                return self.raise_value(Value::Str(full));
            }
        };
        self.sync_program_tables();
        if let Err(e) = skein_code::verify_program(&self.program) {
            self.modules.remove(&name);
            return Err(self.fatal(format!("compiler produced an invalid program: {e}")));
        }

        let oldsp = self.stack.len();
        self.push_new_frame(
            FrameKind::Eval(EvalData {
                kind: EvalKind::Require { module: name },
                resume: Continuation {
                    unit: self.unit,
                    pc: self.pc,
                },
                keep_error: false,
                saved_in_eval: self.in_eval,
            }),
            oldsp,
            Want::Scalar,
        );
        self.in_eval = true;
        self.unit = unit_id;
        self.pc = 0;
        Ok(())
    }

    // ---- calls and return ----------------------------------------------

    pub(crate) fn op_call(&mut self, want: Want) -> Result<(), RunOutcome> {
        let Some(callee) = self.stack.pop() else {
            return Err(self.fatal("value stack underflow in call".to_string()));
        };
        let Value::Code(unit_id) = callee else {
            return self.raise_str("Not a CODE reference".to_string());
        };
        if self.program.unit(unit_id).is_none() {
            return self.raise_str("Undefined subroutine called".to_string());
        }
        let Some(m) = self.marks.pop() else {
            return Err(self.fatal("mark stack underflow in call".to_string()));
        };
        if m > self.stack.len() {
            return Err(self.fatal("stale mark in call".to_string()));
        }
        let arg_len = self.stack.len() - m;
        self.push_new_frame(
            FrameKind::Sub(SubData {
                unit: unit_id,
                ret: Continuation {
                    unit: self.unit,
                    pc: self.pc,
                },
                arg_base: m,
                arg_len,
            }),
            m,
            want,
        );
        self.bump_depth(unit_id);
        self.unit = unit_id;
        self.pc = 0;
        Ok(())
    }

    fn bump_depth(&mut self, unit: UnitId) {
        let d = &mut self.unit_depths[unit.0 as usize];
        *d += 1;
        if *d == DEEP_RECURSION_WARN {
            warn!(
                "Deep recursion on subroutine \"{}\"",
                self.unit_name(unit)
            );
        }
    }

    pub(crate) fn op_light_call(&mut self, unit: UnitId) {
        let want = self.cur_want();
        let oldsp = self.stack.len();
        self.push_new_frame(
            FrameKind::Pseudo(PseudoData {
                block: None,
                multicall: Some(Continuation {
                    unit: self.unit,
                    pc: self.pc,
                }),
            }),
            oldsp,
            want,
        );
        self.unit = unit;
        self.pc = 0;
    }

    pub(crate) fn op_enter_format(&mut self, unit: UnitId) {
        let want = self.cur_want();
        let oldsp = self.stack.len();
        self.push_new_frame(
            FrameKind::Format(FormatData {
                unit,
                ret: Continuation {
                    unit: self.unit,
                    pc: self.pc,
                },
            }),
            oldsp,
            want,
        );
        self.unit = unit;
        self.pc = 0;
    }

    pub(crate) fn op_return(&mut self) -> Result<(), RunOutcome> {
        let Some(retmark) = self.marks.pop() else {
            return Err(self.fatal("mark stack underflow in return".to_string()));
        };
        let at = retmark.min(self.stack.len());
        let values: Vec<Value> = self.stack.drain(at..).collect();

        // Nearest callable, with multicall pseudo-frames handled in place.
        let mut target = None;
        for ix in (0..self.cx.len()).rev() {
            let frame = self.cx.get(ix).expect("frame index in range");
            match &frame.kind {
                FrameKind::Sub(_) | FrameKind::Eval(_) | FrameKind::Format(_) => {
                    target = Some(ix);
                    break;
                }
                FrameKind::Pseudo(p) if p.multicall.is_some() => {
                    target = Some(ix);
                    break;
                }
                FrameKind::Subst(_) => debug!("Exiting substitution via return"),
                _ => {}
            }
        }
        let Some(ix) = target else {
            return self.raise_str("Can't return outside a subroutine".to_string());
        };
        if self.unwind_to(Some(ix))? {
            return Ok(());
        }

        let frame = self.cx.pop().expect("return target present");
        match frame.kind {
            FrameKind::Sub(ref sub) => {
                let sub_unit = sub.unit;
                let ret = sub.ret;
                let d = &mut self.unit_depths[sub_unit.0 as usize];
                *d = d.saturating_sub(1);
                if let Err(msg) = self.close_scope(frame.scope) {
                    return self.raise_str(msg);
                }
                self.restore_frame_base(&frame);
                self.splice_values(values, frame.want);
                self.unit = ret.unit;
                self.pc = ret.pc;
            }
            FrameKind::Eval(ref data) => {
                self.in_eval = data.saved_in_eval;
                let resume = data.resume;
                let keep_error = data.keep_error;
                if let EvalKind::Require { module } = &data.kind {
                    let module = module.clone();
                    let ok = values.last().map_or(false, Value::is_true);
                    if !ok {
                        // Unassume the success assumed earlier.
                        self.modules.remove(&module);
                        if let Err(msg) = self.close_scope(frame.scope) {
                            return self.raise_str(msg);
                        }
                        self.restore_frame_base(&frame);
                        return self.raise_str(format!("{module} did not return a true value"));
                    }
                    self.modules.insert(module, ModuleState::Loaded);
                }
                if !keep_error {
                    self.last_error = Value::Str(String::new());
                }
                if let Err(msg) = self.close_scope(frame.scope) {
                    return self.raise_str(msg);
                }
                self.restore_frame_base(&frame);
                self.splice_values(values, frame.want);
                self.unit = resume.unit;
                self.pc = resume.pc;
            }
            FrameKind::Format(ref fd) => {
                let ret = fd.ret;
                if let Err(msg) = self.close_scope(frame.scope) {
                    return self.raise_str(msg);
                }
                self.restore_frame_base(&frame);
                self.splice_values(values, frame.want);
                self.unit = ret.unit;
                self.pc = ret.pc;
            }
            FrameKind::Pseudo(ref p) => {
                let ret = p.multicall.expect("multicall continuation present");
                if let Err(msg) = self.close_scope(frame.scope) {
                    return self.raise_str(msg);
                }
                self.restore_frame_base(&frame);
                self.splice_values(values, frame.want);
                self.unit = ret.unit;
                self.pc = ret.pc;
            }
            _ => return Err(self.fatal("panic: return".to_string())),
        }
        Ok(())
    }

    // ---- loops ----------------------------------------------------------

    pub(crate) fn op_enter_loop(
        &mut self,
        label: Option<String>,
        block: BlockId,
        body_pc: Pc,
        next_pc: Pc,
        exit_pc: Pc,
    ) {
        let want = self.cur_want();
        let oldsp = self.stack.len();
        let body_scope = self.saves.height();
        self.push_new_frame(
            FrameKind::Loop(LoopData {
                label,
                block,
                var: None,
                iter: None,
                body_pc: body_pc as usize,
                next_pc: next_pc as usize,
                exit_pc: exit_pc as usize,
                body_scope,
                collected: 0,
                started: false,
            }),
            oldsp,
            want,
        );
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn op_enter_iter(
        &mut self,
        var: Slot,
        label: Option<String>,
        block: BlockId,
        source: IterSource,
        reversed: bool,
        body_pc: Pc,
        next_pc: Pc,
        exit_pc: Pc,
    ) -> Result<(), RunOutcome> {
        let state = match source {
            IterSource::Range => {
                let Some(hi) = self.stack.pop() else {
                    return Err(self.fatal("value stack underflow in iterator range".to_string()));
                };
                let Some(lo) = self.stack.pop() else {
                    return Err(self.fatal("value stack underflow in iterator range".to_string()));
                };
                match IterState::over_range(&lo, &hi) {
                    Ok(state) => state,
                    Err(msg) => return self.raise_str(msg),
                }
            }
            IterSource::Stack => {
                let Some(m) = self.marks.pop() else {
                    return Err(self.fatal("mark stack underflow in iterator".to_string()));
                };
                let at = m.min(self.stack.len());
                let items: Vec<Value> = self.stack.drain(at..).collect();
                IterState::over_items(items, reversed)
            }
        };

        let want = self.cur_want();
        let oldsp = self.stack.len();
        let scope = self.saves.height();
        // The loop variable is rebound to a fresh cell for the loop's
        // lifetime; the old binding is part of the frame's entry saves.
        self.saves.push(crate::SaveAction::RestoreBinding {
            slot: var,
            cell: self.slots[var.0 as usize].clone(),
        });
        self.slots[var.0 as usize] = Value::Undef.cell();
        let body_scope = self.saves.height();

        self.cx.push(Frame {
            kind: FrameKind::Loop(LoopData {
                label,
                block,
                var: Some(var),
                iter: Some(state),
                body_pc: body_pc as usize,
                next_pc: next_pc as usize,
                exit_pc: exit_pc as usize,
                body_scope,
                collected: 0,
                started: false,
            }),
            oldsp,
            oldmark: self.marks.len(),
            oldlazy: self.lazy.len(),
            scope,
            oldloc: self.loc,
            want,
        });
        Ok(())
    }

    pub(crate) fn op_iter_next(&mut self) -> Result<(), RunOutcome> {
        let (oldsp, want, body_scope, started, mut collected) = {
            let Some(frame) = self.cx.top() else {
                return Err(self.fatal("iter_next outside a loop".to_string()));
            };
            let FrameKind::Loop(d) = &frame.kind else {
                return Err(self.fatal("iter_next outside a loop".to_string()));
            };
            if d.iter.is_none() {
                return Err(self.fatal("iter_next in a non-iterator loop".to_string()));
            }
            (frame.oldsp, frame.want, d.body_scope, d.started, d.collected)
        };

        // Fold the finished iteration's value(s) into the collected region.
        if started {
            let base = oldsp + collected;
            match want {
                Want::Void => self.stack.truncate(oldsp),
                Want::Scalar => {
                    if self.stack.len() > base {
                        let v = self.stack.last().cloned().unwrap_or(Value::Undef);
                        self.stack.truncate(oldsp);
                        self.stack.push(v);
                        collected = 1;
                    } else {
                        self.stack.truncate(base);
                    }
                }
                Want::List => {
                    collected = self.stack.len().saturating_sub(oldsp);
                }
            }
            if let Err(msg) = self.close_scope(body_scope) {
                return self.raise_str(msg);
            }
        }

        let (next_val, var, body_pc, exit_pc) = {
            let frame = self.cx.top_mut().expect("loop frame present");
            let FrameKind::Loop(d) = &mut frame.kind else {
                unreachable!("checked above");
            };
            d.collected = collected;
            let next_val = d.iter.as_mut().expect("iterator present").next();
            if next_val.is_some() {
                d.started = true;
            }
            (next_val, d.var, d.body_pc, d.exit_pc)
        };

        match next_val {
            Some(v) => {
                if let Some(var) = var {
                    *self.slots[var.0 as usize].borrow_mut() = v;
                }
                self.pc = body_pc;
            }
            None => {
                let frame = self.cx.pop().expect("loop frame present");
                self.stack.truncate(frame.oldsp + collected);
                if frame.want == Want::Scalar && collected == 0 {
                    self.stack.push(Value::Undef);
                }
                self.marks.truncate(frame.oldmark);
                self.lazy.truncate(frame.oldlazy);
                if let Err(msg) = self.close_scope(frame.scope) {
                    return self.raise_str(msg);
                }
                self.loc = frame.oldloc;
                self.pc = exit_pc;
            }
        }
        Ok(())
    }

    pub(crate) fn op_leave_loop(&mut self) -> Result<(), RunOutcome> {
        let is_loop = matches!(self.cx.top().map(|f| &f.kind), Some(FrameKind::Loop(_)));
        if !is_loop {
            return Err(self.fatal("mismatched leave_loop".to_string()));
        }
        let frame = self.cx.pop().expect("loop frame present");
        self.stack.truncate(frame.oldsp);
        if frame.want == Want::Scalar {
            self.stack.push(Value::Undef);
        }
        self.marks.truncate(frame.oldmark);
        self.lazy.truncate(frame.oldlazy);
        if let Err(msg) = self.close_scope(frame.scope) {
            return self.raise_str(msg);
        }
        self.loc = frame.oldloc;
        Ok(())
    }

    pub(crate) fn op_loop_ctl(
        &mut self,
        kind: LoopCtl,
        label: Option<String>,
    ) -> Result<(), RunOutcome> {
        let name = kind.name();
        let ix = match &label {
            None => match self.cx.find_loop_unlabeled(name) {
                LoopSearch::Found(ix) => ix,
                LoopSearch::NoLoop => {
                    return self.raise_str(format!("Can't \"{name}\" outside a loop block"));
                }
            },
            Some(l) => match self.cx.find_loop_labeled(l, name) {
                Some(ix) => ix,
                None => {
                    return self.raise_str(format!("Label not found for \"{name} {l}\""));
                }
            },
        };
        if self.unwind_to(Some(ix))? {
            return Ok(());
        }

        match kind {
            LoopCtl::Last => {
                let frame = self.cx.pop().expect("loop frame present");
                let FrameKind::Loop(d) = frame.kind else {
                    return Err(self.fatal("panic: last".to_string()));
                };
                self.stack.truncate(frame.oldsp + d.collected);
                if frame.want == Want::Scalar && d.collected == 0 {
                    self.stack.push(Value::Undef);
                }
                self.marks.truncate(frame.oldmark);
                self.lazy.truncate(frame.oldlazy);
                if let Err(msg) = self.close_scope(frame.scope) {
                    return self.raise_str(msg);
                }
                self.loc = frame.oldloc;
                self.pc = d.exit_pc;
            }
            LoopCtl::Next | LoopCtl::Redo => {
                let (oldsp, collected, body_scope, oldmark, oldlazy, target_pc) = {
                    let frame = self.cx.top().expect("loop frame present");
                    let FrameKind::Loop(d) = &frame.kind else {
                        return Err(self.fatal(format!("panic: {name}")));
                    };
                    let target = if kind == LoopCtl::Next {
                        d.next_pc
                    } else {
                        d.body_pc
                    };
                    (
                        frame.oldsp,
                        d.collected,
                        d.body_scope,
                        frame.oldmark,
                        frame.oldlazy,
                        target,
                    )
                };
                // Only scopes opened inside the body are drained; the loop
                // frame itself survives. `redo` re-enters the body without
                // advancing the iterator.
                self.stack.truncate(oldsp + collected);
                self.marks.truncate(oldmark);
                self.lazy.truncate(oldlazy);
                if let Err(msg) = self.close_scope(body_scope) {
                    return self.raise_str(msg);
                }
                self.pc = target_pc;
            }
        }
        Ok(())
    }

    // ---- blocks and goto -------------------------------------------------

    pub(crate) fn op_enter_block(&mut self, block: BlockId) {
        let want = self.cur_want();
        let oldsp = self.stack.len();
        self.push_new_frame(
            FrameKind::Pseudo(PseudoData {
                block: Some(block),
                multicall: None,
            }),
            oldsp,
            want,
        );
    }

    pub(crate) fn op_leave_block(&mut self) -> Result<(), RunOutcome> {
        let is_block = matches!(
            self.cx.top().map(|f| &f.kind),
            Some(FrameKind::Pseudo(PseudoData {
                multicall: None,
                ..
            }))
        );
        if !is_block {
            return Err(self.fatal("mismatched leave_block".to_string()));
        }
        let frame = self.cx.pop().expect("pseudo frame present");
        // Blocks are transparent to values; only marks and scopes reset.
        self.marks.truncate(frame.oldmark);
        self.lazy.truncate(frame.oldlazy);
        if let Err(msg) = self.close_scope(frame.scope) {
            return self.raise_str(msg);
        }
        self.loc = frame.oldloc;
        Ok(())
    }

    pub(crate) fn op_goto_label(&mut self, label: String) -> Result<(), RunOutcome> {
        // Static search of the current unit's lexical block tree.
        let (target_pc, target_chain, loop_blocks) = {
            let unit = self.program.unit(self.unit).expect("current unit");
            let Some(target_pc) = unit.find_label(&label) else {
                return self.raise_str(format!("Can't find label {label}"));
            };
            let chain = unit.block_chain(target_pc);
            let loops: Vec<bool> = chain
                .iter()
                .map(|b| {
                    unit.block(*b)
                        .map_or(false, |bl| bl.kind == BlockKind::Loop)
                })
                .collect();
            (target_pc, chain, loops)
        };

        // Active block chain between the innermost callable and the top.
        let callable_ix = self.cx.find(|_, f| {
            matches!(
                f.kind,
                FrameKind::Sub(_) | FrameKind::Eval(_) | FrameKind::Format(_)
            )
        });
        let first_active = callable_ix.map(|ix| ix + 1).unwrap_or(0);
        let mut active: Vec<(usize, BlockId)> = Vec::new();
        for ix in first_active..self.cx.len() {
            match &self.cx.get(ix).expect("frame index in range").kind {
                FrameKind::Pseudo(p) => {
                    if let Some(b) = p.block {
                        active.push((ix, b));
                    }
                }
                FrameKind::Loop(d) => active.push((ix, d.block)),
                _ => {}
            }
        }

        let mut common = 0;
        while common < active.len()
            && common < target_chain.len()
            && active[common].1 == target_chain[common]
        {
            common += 1;
        }
        let entering: Vec<BlockId> = target_chain[common..].to_vec();
        if entering.len() > GOTO_REPLAY_LIMIT {
            return self.raise_str("Target of goto is too deeply nested".to_string());
        }
        // A loop's per-iteration state cannot be synthesized by jumping in.
        if loop_blocks[common..].iter().any(|is_loop| *is_loop) {
            return self.raise_str(
                "Can't \"goto\" into the middle of a foreach loop".to_string(),
            );
        }

        let keep_ix = if common > 0 {
            Some(active[common - 1].0)
        } else {
            callable_ix
        };
        if self.unwind_to(keep_ix)? {
            return Ok(());
        }

        // Replay entry of the blocks lexically enclosing the label: their
        // scope-entry side effects run again, their statements do not.
        for block in entering {
            self.op_enter_block(block);
        }
        self.pc = target_pc as usize;
        Ok(())
    }

    pub(crate) fn op_goto_code(&mut self) -> Result<(), RunOutcome> {
        let Some(callee) = self.stack.pop() else {
            return Err(self.fatal("value stack underflow in goto".to_string()));
        };
        let unit_id = match callee {
            Value::Code(u) => u,
            Value::Undef => return self.raise_str("Goto undefined subroutine".to_string()),
            _ => return self.raise_str("goto must have label".to_string()),
        };
        if self.program.unit(unit_id).is_none() {
            return self.raise_str("Goto undefined subroutine".to_string());
        }
        let Some(m) = self.marks.pop() else {
            return Err(self.fatal("mark stack underflow in goto".to_string()));
        };
        let at = m.min(self.stack.len());
        let args: Vec<Value> = self.stack.drain(at..).collect();

        let mut found = None;
        for ix in (0..self.cx.len()).rev() {
            let frame = self.cx.get(ix).expect("frame index in range");
            match &frame.kind {
                FrameKind::Sub(_) => {
                    found = Some(ix);
                    break;
                }
                FrameKind::Pseudo(p) if p.multicall.is_some() => {
                    return self.raise_str(
                        "Can't goto subroutine from a sort sub (or similar callback)".to_string(),
                    );
                }
                FrameKind::Eval(d) => {
                    let msg = match d.kind {
                        EvalKind::Try => "Can't goto subroutine from an eval-block",
                        EvalKind::Text | EvalKind::Require { .. } => {
                            "Can't goto subroutine from an eval-string"
                        }
                    };
                    return self.raise_str(msg.to_string());
                }
                FrameKind::Format(_) => {
                    return self.raise_str("Can't goto subroutine from a format".to_string());
                }
                FrameKind::Subst(_) => debug!("Exiting substitution via goto"),
                _ => {}
            }
        }
        let Some(ix) = found else {
            return self.raise_str("Can't goto subroutine outside a subroutine".to_string());
        };
        if self.unwind_to(Some(ix))? {
            return Ok(());
        }

        // Reuse the frame: drain its dynamic scope, transplant the argument
        // list, and swap the callee bookkeeping.
        let (scope, old_unit, arg_base, oldmark, oldlazy) = {
            let frame = self.cx.top().expect("subroutine frame present");
            let FrameKind::Sub(sub) = &frame.kind else {
                return Err(self.fatal("panic: goto".to_string()));
            };
            (frame.scope, sub.unit, sub.arg_base, frame.oldmark, frame.oldlazy)
        };
        if let Err(msg) = self.close_scope(scope) {
            return self.raise_str(msg);
        }
        let d = &mut self.unit_depths[old_unit.0 as usize];
        *d = d.saturating_sub(1);
        self.bump_depth(unit_id);

        self.stack.truncate(arg_base);
        let arg_len = args.len();
        self.stack.extend(args);
        self.marks.truncate(oldmark);
        self.lazy.truncate(oldlazy);

        let frame = self.cx.top_mut().expect("subroutine frame present");
        let FrameKind::Sub(sub) = &mut frame.kind else {
            unreachable!("checked above");
        };
        sub.unit = unit_id;
        sub.arg_len = arg_len;

        self.unit = unit_id;
        self.pc = 0;
        Ok(())
    }

    // ---- substitution ----------------------------------------------------

    pub(crate) fn op_enter_subst(&mut self, cap: u32) {
        let want = self.cur_want();
        let oldsp = self.stack.len();
        self.push_new_frame(
            FrameKind::Subst(SubstData { iters: 0, cap }),
            oldsp,
            want,
        );
    }

    pub(crate) fn op_subst_iter(&mut self, body_pc: Pc) -> Result<(), RunOutcome> {
        let over = {
            let Some(frame) = self.cx.top_mut() else {
                return Err(self.fatal("subst_iter outside a substitution".to_string()));
            };
            let FrameKind::Subst(d) = &mut frame.kind else {
                return Err(self.fatal("subst_iter outside a substitution".to_string()));
            };
            d.iters += 1;
            d.iters > d.cap
        };
        if over {
            return self.raise_str("Substitution loop".to_string());
        }
        self.pc = body_pc as usize;
        Ok(())
    }

    pub(crate) fn op_leave_subst(&mut self) -> Result<(), RunOutcome> {
        let is_subst = matches!(self.cx.top().map(|f| &f.kind), Some(FrameKind::Subst(_)));
        if !is_subst {
            return Err(self.fatal("mismatched leave_subst".to_string()));
        }
        let frame = self.cx.pop().expect("substitution frame present");
        self.marks.truncate(frame.oldmark);
        self.lazy.truncate(frame.oldlazy);
        if let Err(msg) = self.close_scope(frame.scope) {
            return self.raise_str(msg);
        }
        self.loc = frame.oldloc;
        Ok(())
    }
}
