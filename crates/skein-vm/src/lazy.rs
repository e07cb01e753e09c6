//! The lazy list evaluator: cooperative, in-place incremental evaluation of
//! map/grep-style combinators over the value stack.
//!
//! Three marks steer each construct: *origin* (where the destination region
//! starts), the *source cursor*, and the *destination cursor*. Kept and
//! produced values are compacted toward the origin; when a map body yields
//! more than the consumed-source gap can hold, the stack tail is shifted
//! outward once by `max(needed, elements-above-the-gap)` rather than per
//! element.

use skein_code::{Pc, Slot, Want};

use crate::scope::Watermark;
use crate::{RunOutcome, Value, Vm};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum LazyKind {
    Grep,
    Map,
}

#[derive(Debug)]
pub(crate) struct LazyCtl {
    pub kind: LazyKind,
    pub topic: Slot,
    pub want: Want,
    /// Destination region start.
    pub origin: usize,
    /// Index of the source element currently bound to the topic.
    pub src: usize,
    /// Next write position for kept/produced values.
    pub dst: usize,
    /// One past the last source element.
    pub end: usize,
    /// Stack height at body entry; body output lives above this.
    pub body_base: usize,
    pub outer: Watermark,
    pub inner: Watermark,
}

impl Vm {
    pub(crate) fn op_lazy_start(
        &mut self,
        kind: LazyKind,
        topic: Slot,
        body_pc: Pc,
        done_pc: Pc,
        want: Want,
    ) -> Result<(), RunOutcome> {
        let Some(origin) = self.marks.pop() else {
            return Err(self.fatal("mark stack underflow in list combinator".to_string()));
        };
        if origin > self.stack.len() {
            return Err(self.fatal("stale mark in list combinator".to_string()));
        }
        if self.stack.len() == origin {
            // No source elements at all.
            if want == Want::Scalar {
                self.stack.push(Value::Int(0));
            }
            self.pc = done_pc as usize;
            return Ok(());
        }

        let outer = self.open_scope();
        self.saves.push(crate::SaveAction::RestoreBinding {
            slot: topic,
            cell: self.slots[topic.0 as usize].clone(),
        });
        self.slots[topic.0 as usize] = self.stack[origin].clone().cell();
        let inner = self.open_scope();

        let end = self.stack.len();
        self.lazy.push(LazyCtl {
            kind,
            topic,
            want,
            origin,
            src: origin,
            dst: origin,
            end,
            body_base: end,
            outer,
            inner,
        });
        self.pc = body_pc as usize;
        Ok(())
    }

    pub(crate) fn op_grep_while(&mut self, body_pc: Pc) -> Result<(), RunOutcome> {
        let Some(result) = self.stack.pop() else {
            return Err(self.fatal("value stack underflow in grep".to_string()));
        };
        let Some(ctl) = self.lazy.last() else {
            return Err(self.fatal("grep outside a list combinator".to_string()));
        };
        if ctl.kind != LazyKind::Grep {
            return Err(self.fatal("mismatched grep continuation".to_string()));
        }
        let (want, topic, origin, mut src, mut dst, end, inner) = (
            ctl.want, ctl.topic, ctl.origin, ctl.src, ctl.dst, ctl.end, ctl.inner,
        );

        if let Err(msg) = self.close_scope(inner) {
            return self.raise_str(msg);
        }

        if result.is_true() {
            if want == Want::List {
                self.stack[dst] = self.stack[src].clone();
            }
            dst += 1;
        }
        src += 1;

        if src >= end {
            self.lazy_finish(origin, dst, end, want)
        } else {
            let ctl = self.lazy.last_mut().expect("combinator still active");
            ctl.src = src;
            ctl.dst = dst;
            ctl.inner = self.saves.height();
            *self.slots[topic.0 as usize].borrow_mut() = self.stack[src].clone();
            self.pc = body_pc as usize;
            Ok(())
        }
    }

    pub(crate) fn op_map_while(&mut self, body_pc: Pc) -> Result<(), RunOutcome> {
        let Some(ctl) = self.lazy.last() else {
            return Err(self.fatal("map outside a list combinator".to_string()));
        };
        if ctl.kind != LazyKind::Map {
            return Err(self.fatal("mismatched map continuation".to_string()));
        }
        let (want, topic, origin, src, mut dst, mut end, mut body_base, inner) = (
            ctl.want, ctl.topic, ctl.origin, ctl.src, ctl.dst, ctl.end, ctl.body_base, ctl.inner,
        );

        let items = self.stack.len() - body_base;
        let mut next_src = src + 1;

        match want {
            Want::List if items > 0 => {
                let room = next_src - dst;
                if items > room {
                    // Make room once, shifting the tail outward by at least
                    // the number of elements being moved so repeated small
                    // overflows stay amortized.
                    let needed = items - room;
                    let moving = self.stack.len() - next_src;
                    let shift = needed.max(moving);
                    self.stack.splice(
                        next_src..next_src,
                        std::iter::repeat(Value::Undef).take(shift),
                    );
                    next_src += shift;
                    end += shift;
                    body_base += shift;
                }
                for i in 0..items {
                    self.stack[dst + i] = self.stack[body_base + i].clone();
                }
                dst += items;
            }
            // The scalar result counts source elements, not body output.
            Want::Scalar => dst += 1,
            _ => {}
        }
        self.stack.truncate(body_base);

        if let Err(msg) = self.close_scope(inner) {
            return self.raise_str(msg);
        }

        if next_src >= end {
            self.lazy_finish(origin, dst, end, want)
        } else {
            let ctl = self.lazy.last_mut().expect("combinator still active");
            ctl.src = next_src;
            ctl.dst = dst;
            ctl.end = end;
            ctl.body_base = end;
            ctl.inner = self.saves.height();
            *self.slots[topic.0 as usize].borrow_mut() = self.stack[next_src].clone();
            self.pc = body_pc as usize;
            Ok(())
        }
    }

    /// Completes a combinator: closes the outer scope, pops the control
    /// entry, and shapes the result region for the enclosing want.
    fn lazy_finish(
        &mut self,
        origin: usize,
        dst: usize,
        end: usize,
        want: Want,
    ) -> Result<(), RunOutcome> {
        let ctl = self.lazy.pop().expect("combinator still active");
        if let Err(msg) = self.close_scope(ctl.outer) {
            return self.raise_str(msg);
        }
        match want {
            Want::List => {
                // Results already sit compacted at [origin, dst); drop the
                // consumed tail.
                self.stack.drain(dst..end.min(self.stack.len()));
            }
            Want::Scalar => {
                self.stack.truncate(origin);
                self.stack.push(Value::Int((dst - origin) as i64));
            }
            Want::Void => {
                self.stack.truncate(origin);
            }
        }
        Ok(())
    }
}
