//! The op dispatch loop. Ops either manipulate the value/mark stacks in
//! place or hand control to the dispatcher; non-local transfer happens by
//! rewriting `unit`/`pc` and truncating stacks, never by unwinding the host
//! call stack.

use skein_code::{Const, Op, Want};

use crate::context::FrameKind;
use crate::dispatch::LoopCtl;
use crate::lazy::LazyKind;
use crate::scope::Watermark;
use crate::{Loc, RunOutcome, SaveAction, Value, Vm};

fn const_to_value(c: Const) -> Value {
    match c {
        Const::Undef => Value::Undef,
        Const::Int(n) => Value::Int(n),
        Const::Num(n) => Value::Num(n),
        Const::Str(s) => Value::Str(s),
        Const::Code(u) => Value::Code(u),
    }
}

impl Vm {
    /// Drives the program to completion. Idempotent once finished.
    pub fn run(&mut self) -> RunOutcome {
        if let Some(out) = &self.finished {
            return out.clone();
        }
        let out = self.run_loop();
        self.finished = Some(out.clone());
        out
    }

    fn run_loop(&mut self) -> RunOutcome {
        loop {
            let code_len = self
                .program
                .unit(self.unit)
                .map(|u| u.code.len())
                .unwrap_or(0);
            if self.pc >= code_len {
                if !self.cx.is_empty() {
                    let name = self.unit_name(self.unit).to_string();
                    return self.fatal(format!("unit `{name}` fell off the end"));
                }
                // Whole-program fall-through: drain any root-level saves,
                // then hand back whatever the entry unit left behind.
                if let Err(msg) = self.close_scope(Watermark(0)) {
                    match self.raise_str(msg) {
                        Err(out) => return out,
                        Ok(()) => continue,
                    }
                }
                let values = std::mem::take(&mut self.stack);
                return RunOutcome::Done { values };
            }

            let op = self.program.units[self.unit.0 as usize].code[self.pc].clone();
            self.pc += 1;

            let result = match op {
                Op::Stmt { line, .. } => {
                    self.loc = Loc {
                        unit: self.unit,
                        line,
                    };
                    Ok(())
                }
                Op::Const { value } => {
                    self.stack.push(const_to_value(value));
                    Ok(())
                }
                Op::Pop => match self.stack.pop() {
                    Some(_) => Ok(()),
                    None => Err(self.fatal("value stack underflow".to_string())),
                },
                Op::PushMark => {
                    self.marks.push(self.stack.len());
                    Ok(())
                }

                Op::Load { slot } => {
                    let v = self.slots[slot.0 as usize].borrow().clone();
                    self.stack.push(v);
                    Ok(())
                }
                Op::Store { slot } => match self.stack.pop() {
                    Some(v) => {
                        *self.slots[slot.0 as usize].borrow_mut() = v;
                        Ok(())
                    }
                    None => Err(self.fatal("value stack underflow in store".to_string())),
                },
                Op::LocalScalar { slot } => {
                    let old = self.slots[slot.0 as usize].borrow().clone();
                    self.save(SaveAction::RestoreScalar { slot, value: old });
                    *self.slots[slot.0 as usize].borrow_mut() = Value::Undef;
                    Ok(())
                }

                Op::LoadArg { index } => self.op_load_arg(index),
                Op::ArgCount => self.op_arg_count(),
                Op::LastError => {
                    self.stack.push(self.last_error.clone());
                    Ok(())
                }
                Op::Wantarray => {
                    let v = match self
                        .cx
                        .find_callable("wantarray")
                        .and_then(|ix| self.cx.get(ix))
                        .map(|f| f.want)
                    {
                        Some(Want::List) => Value::Int(1),
                        Some(Want::Scalar) => Value::Int(0),
                        Some(Want::Void) | None => Value::Undef,
                    };
                    self.stack.push(v);
                    Ok(())
                }

                Op::Add => self.op_arith(i64::checked_add, |a, b| a + b),
                Op::Sub => self.op_arith(i64::checked_sub, |a, b| a - b),
                Op::Mul => self.op_arith(i64::checked_mul, |a, b| a * b),
                Op::Lt => self.op_cmp(|o| o == std::cmp::Ordering::Less),
                Op::Le => self.op_cmp(|o| o != std::cmp::Ordering::Greater),
                Op::Gt => self.op_cmp(|o| o == std::cmp::Ordering::Greater),
                Op::Ge => self.op_cmp(|o| o != std::cmp::Ordering::Less),
                Op::NumEq => self.op_cmp(|o| o == std::cmp::Ordering::Equal),
                Op::NumNe => self.op_cmp(|o| o != std::cmp::Ordering::Equal),
                Op::Concat => self.op_concat(),
                Op::Not => match self.stack.pop() {
                    Some(v) => {
                        self.stack.push(Value::Int(i64::from(!v.is_true())));
                        Ok(())
                    }
                    None => Err(self.fatal("value stack underflow in not".to_string())),
                },

                Op::Jump { target_pc } => {
                    self.pc = target_pc as usize;
                    Ok(())
                }
                Op::JumpIfFalse { target_pc } => match self.stack.pop() {
                    Some(v) => {
                        if !v.is_true() {
                            self.pc = target_pc as usize;
                        }
                        Ok(())
                    }
                    None => Err(self.fatal("value stack underflow in branch".to_string())),
                },

                Op::EnterBlock { block } => {
                    self.op_enter_block(block);
                    Ok(())
                }
                Op::LeaveBlock => self.op_leave_block(),

                Op::Call { want } => self.op_call(want),
                Op::LightCall { unit } => {
                    self.op_light_call(unit);
                    Ok(())
                }
                Op::CallHost { host } => self.op_call_host(host.0 as usize),
                Op::EnterFormat { unit } => {
                    self.op_enter_format(unit);
                    Ok(())
                }
                Op::Return => self.op_return(),

                Op::EnterLoop {
                    label,
                    block,
                    body_pc,
                    next_pc,
                    exit_pc,
                } => {
                    self.op_enter_loop(label, block, body_pc, next_pc, exit_pc);
                    Ok(())
                }
                Op::EnterIter {
                    var,
                    label,
                    block,
                    source,
                    reversed,
                    body_pc,
                    next_pc,
                    exit_pc,
                } => self.op_enter_iter(
                    var, label, block, source, reversed, body_pc, next_pc, exit_pc,
                ),
                Op::IterNext => self.op_iter_next(),
                Op::LeaveLoop => self.op_leave_loop(),

                Op::Last { label } => self.op_loop_ctl(LoopCtl::Last, label),
                Op::Next { label } => self.op_loop_ctl(LoopCtl::Next, label),
                Op::Redo { label } => self.op_loop_ctl(LoopCtl::Redo, label),

                Op::Goto { label } => self.op_goto_label(label),
                Op::GotoCode => self.op_goto_code(),

                Op::EnterTry {
                    resume_pc,
                    keep_error,
                } => {
                    self.op_enter_try(resume_pc, keep_error);
                    Ok(())
                }
                Op::LeaveTry => self.op_leave_try(),
                Op::Raise => self.op_raise(),
                Op::EvalText { resume_pc } => self.op_eval_text(resume_pc),
                Op::Require => self.op_require(),

                Op::EnterSubst { cap } => {
                    self.op_enter_subst(cap);
                    Ok(())
                }
                Op::SubstIter { body_pc } => self.op_subst_iter(body_pc),
                Op::LeaveSubst => self.op_leave_subst(),

                Op::GrepStart {
                    topic,
                    body_pc,
                    done_pc,
                    want,
                } => self.op_lazy_start(LazyKind::Grep, topic, body_pc, done_pc, want),
                Op::GrepWhile { body_pc } => self.op_grep_while(body_pc),
                Op::MapStart {
                    topic,
                    body_pc,
                    done_pc,
                    want,
                } => self.op_lazy_start(LazyKind::Map, topic, body_pc, done_pc, want),
                Op::MapWhile { body_pc } => self.op_map_while(body_pc),

                Op::Exit => match self.stack.pop() {
                    Some(v) => Err(RunOutcome::Exited {
                        status: v.as_int() as i32,
                    }),
                    None => Err(self.fatal("value stack underflow in exit".to_string())),
                },
            };

            if let Err(out) = result {
                return out;
            }
        }
    }

    fn pop2(&mut self) -> Result<(Value, Value), RunOutcome> {
        let Some(b) = self.stack.pop() else {
            return Err(self.fatal("value stack underflow".to_string()));
        };
        let Some(a) = self.stack.pop() else {
            return Err(self.fatal("value stack underflow".to_string()));
        };
        Ok((a, b))
    }

    fn op_concat(&mut self) -> Result<(), RunOutcome> {
        let (a, b) = self.pop2()?;
        self.stack.push(Value::Str(format!("{a}{b}")));
        Ok(())
    }

    fn op_arith(
        &mut self,
        int_op: fn(i64, i64) -> Option<i64>,
        num_op: fn(f64, f64) -> f64,
    ) -> Result<(), RunOutcome> {
        let (a, b) = self.pop2()?;
        let v = match (&a, &b) {
            (Value::Int(x), Value::Int(y)) => match int_op(*x, *y) {
                Some(n) => Value::Int(n),
                None => Value::Num(num_op(*x as f64, *y as f64)),
            },
            _ => Value::Num(num_op(a.as_num(), b.as_num())),
        };
        self.stack.push(v);
        Ok(())
    }

    fn op_cmp(&mut self, accept: fn(std::cmp::Ordering) -> bool) -> Result<(), RunOutcome> {
        let (a, b) = self.pop2()?;
        let truth = a
            .as_num()
            .partial_cmp(&b.as_num())
            .map(accept)
            .unwrap_or(false);
        self.stack.push(Value::Int(i64::from(truth)));
        Ok(())
    }

    /// The innermost subroutine frame's argument region.
    fn sub_args(&self) -> Option<(usize, usize)> {
        for ix in (0..self.cx.len()).rev() {
            if let Some(frame) = self.cx.get(ix) {
                if let FrameKind::Sub(sub) = &frame.kind {
                    return Some((sub.arg_base, sub.arg_len));
                }
            }
        }
        None
    }

    fn op_load_arg(&mut self, index: u32) -> Result<(), RunOutcome> {
        let Some((base, len)) = self.sub_args() else {
            return Err(self.fatal("load_arg outside a subroutine".to_string()));
        };
        let v = if (index as usize) < len {
            self.stack[base + index as usize].clone()
        } else {
            Value::Undef
        };
        self.stack.push(v);
        Ok(())
    }

    fn op_arg_count(&mut self) -> Result<(), RunOutcome> {
        let Some((_, len)) = self.sub_args() else {
            return Err(self.fatal("arg_count outside a subroutine".to_string()));
        };
        self.stack.push(Value::Int(len as i64));
        Ok(())
    }

    fn op_call_host(&mut self, ix: usize) -> Result<(), RunOutcome> {
        if ix >= self.host_fns.len() {
            return Err(self.fatal(format!("host import id {ix} out of range")));
        }
        if self.host_fns[ix].is_none() {
            let name = self.program.hosts[ix].clone();
            return Err(self.fatal(format!("unregistered host import `{name}`")));
        }
        let Some(m) = self.marks.pop() else {
            return Err(self.fatal("mark stack underflow in host call".to_string()));
        };
        let at = m.min(self.stack.len());
        let args: Vec<Value> = self.stack.drain(at..).collect();

        let mut f = self.host_fns[ix].take().expect("checked above");
        let result = f.call(&args);
        self.host_fns[ix] = Some(f);

        match result {
            Ok(values) => {
                self.stack.extend(values);
                Ok(())
            }
            Err(e) => self.raise_str(e.message),
        }
    }
}
