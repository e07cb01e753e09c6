//! The context stack: a LIFO stack of frames describing the active dynamic
//! scopes, plus the canonical searches used by the control-transfer
//! dispatcher.

use tracing::{debug, warn};

use skein_code::{BlockId, Slot, UnitId, Want};

use crate::iter::IterState;
use crate::scope::Watermark;
use crate::Loc;

/// A resumption point: a unit plus a program counter within it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Continuation {
    pub unit: UnitId,
    pub pc: usize,
}

#[derive(Debug)]
pub(crate) struct PseudoData {
    /// The lexical block this frame marks, when entered via a block op.
    pub block: Option<BlockId>,
    /// Present for lightweight callback (multicall) frames: where to resume
    /// when the callee returns.
    pub multicall: Option<Continuation>,
}

#[derive(Debug)]
pub(crate) struct SubData {
    pub unit: UnitId,
    pub ret: Continuation,
    /// The caller's argument region `[arg_base, arg_base + arg_len)` on the
    /// value stack; a tail-call transplants a new argument list here.
    pub arg_base: usize,
    pub arg_len: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum EvalKind {
    /// A textual try-body (`catch` construct).
    Try,
    /// A string-evaluation body produced by the compiler collaborator.
    Text,
    /// A module load; the in-progress mark must be rolled back if the
    /// attempt fails.
    Require { module: String },
}

#[derive(Debug)]
pub(crate) struct EvalData {
    pub kind: EvalKind,
    /// The one-shot resumption environment: where control lands just after
    /// the construct. Consumed by raise delivery or by normal completion.
    pub resume: Continuation,
    pub keep_error: bool,
    pub saved_in_eval: bool,
}

#[derive(Debug)]
pub(crate) struct LoopData {
    pub label: Option<String>,
    pub block: BlockId,
    pub var: Option<Slot>,
    pub iter: Option<IterState>,
    pub body_pc: usize,
    pub next_pc: usize,
    pub exit_pc: usize,
    /// Save-stack height after the loop's own entry saves; `next`/`redo`
    /// drain to here, never past.
    pub body_scope: Watermark,
    /// Values collected so far at `[oldsp, oldsp + collected)`.
    pub collected: usize,
    /// True once the first iteration has been dispatched.
    pub started: bool,
}

#[derive(Debug)]
pub(crate) struct SubstData {
    pub iters: u32,
    pub cap: u32,
}

#[derive(Debug)]
pub(crate) struct FormatData {
    pub unit: UnitId,
    pub ret: Continuation,
}

#[derive(Debug)]
pub(crate) enum FrameKind {
    Pseudo(PseudoData),
    Sub(SubData),
    Eval(EvalData),
    Loop(LoopData),
    Subst(SubstData),
    Format(FormatData),
}

/// One activation record. The common fields snapshot everything the
/// dispatcher restores when the frame exits: value-stack and mark-stack
/// heights, the save-stack watermark taken at entry (before the frame's own
/// entry saves), the location marker, and the want-context for the frame's
/// body.
#[derive(Debug)]
pub(crate) struct Frame {
    pub kind: FrameKind,
    pub oldsp: usize,
    pub oldmark: usize,
    pub oldlazy: usize,
    pub scope: Watermark,
    pub oldloc: Loc,
    pub want: Want,
}

impl Frame {
    pub(crate) fn kind_name(&self) -> &'static str {
        match &self.kind {
            FrameKind::Pseudo(_) => "pseudo-block",
            FrameKind::Sub(_) => "subroutine",
            FrameKind::Eval(_) => "eval",
            FrameKind::Loop(_) => "loop",
            FrameKind::Subst(_) => "substitution",
            FrameKind::Format(_) => "format",
        }
    }
}

/// Outcome of the unlabeled loop search: boundary frames are not
/// transparent to unlabeled loop control.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum LoopSearch {
    Found(usize),
    NoLoop,
}

#[derive(Default)]
pub(crate) struct ContextStack {
    frames: Vec<Frame>,
}

impl ContextStack {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn len(&self) -> usize {
        self.frames.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub(crate) fn push(&mut self, frame: Frame) {
        self.frames.push(frame);
    }

    pub(crate) fn pop(&mut self) -> Option<Frame> {
        self.frames.pop()
    }

    pub(crate) fn top(&self) -> Option<&Frame> {
        self.frames.last()
    }

    pub(crate) fn top_mut(&mut self) -> Option<&mut Frame> {
        self.frames.last_mut()
    }

    pub(crate) fn get(&self, ix: usize) -> Option<&Frame> {
        self.frames.get(ix)
    }

    pub(crate) fn get_mut(&mut self, ix: usize) -> Option<&mut Frame> {
        self.frames.get_mut(ix)
    }

    /// Generic outward scan from the top of the stack.
    pub(crate) fn find(
        &self,
        mut predicate: impl FnMut(usize, &Frame) -> bool,
    ) -> Option<usize> {
        for ix in (0..self.frames.len()).rev() {
            if predicate(ix, &self.frames[ix]) {
                return Some(ix);
            }
        }
        None
    }

    /// Nearest callable frame: the first `Sub`, `Eval`, or `Format`.
    /// Crossing a substitution frame on the way out is observable.
    pub(crate) fn find_callable(&self, via: &str) -> Option<usize> {
        self.find(|_, frame| match frame.kind {
            FrameKind::Sub(_) | FrameKind::Eval(_) | FrameKind::Format(_) => true,
            FrameKind::Subst(_) => {
                debug!("Exiting substitution via {via}");
                false
            }
            _ => false,
        })
    }

    /// Nearest exception frame: the first `Eval`, skipping everything else.
    pub(crate) fn find_eval(&self, via: &str) -> Option<usize> {
        self.find(|_, frame| match frame.kind {
            FrameKind::Eval(_) => true,
            FrameKind::Sub(_) | FrameKind::Format(_) | FrameKind::Subst(_) => {
                debug!("Exiting {} via {via}", frame.kind_name());
                false
            }
            _ => false,
        })
    }

    /// Nearest loop for unlabeled loop control. `Sub`, `Eval`, `Format`,
    /// and `Subst` frames are not transparent: crossing one aborts the
    /// search.
    pub(crate) fn find_loop_unlabeled(&self, via: &str) -> LoopSearch {
        for ix in (0..self.frames.len()).rev() {
            let frame = &self.frames[ix];
            match frame.kind {
                FrameKind::Loop(_) => return LoopSearch::Found(ix),
                FrameKind::Sub(_)
                | FrameKind::Eval(_)
                | FrameKind::Format(_)
                | FrameKind::Subst(_) => {
                    warn!("Exiting {} via {via}", frame.kind_name());
                    return LoopSearch::NoLoop;
                }
                FrameKind::Pseudo(_) => {}
            }
        }
        LoopSearch::NoLoop
    }

    /// Labeled loop search: only a `Loop` frame with a matching label stops
    /// the scan. Other loops are skipped; boundary frames are reported but
    /// crossed.
    pub(crate) fn find_loop_labeled(&self, label: &str, via: &str) -> Option<usize> {
        for ix in (0..self.frames.len()).rev() {
            let frame = &self.frames[ix];
            match &frame.kind {
                FrameKind::Loop(data) => match &data.label {
                    Some(l) if l == label => return Some(ix),
                    _ => debug!("skipping loop frame #{ix} without label {label}"),
                },
                FrameKind::Sub(_)
                | FrameKind::Eval(_)
                | FrameKind::Format(_)
                | FrameKind::Subst(_) => {
                    warn!("Exiting {} via {via}", frame.kind_name());
                }
                FrameKind::Pseudo(_) => {}
            }
        }
        None
    }
}
