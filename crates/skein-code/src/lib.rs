#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub mod verify;

pub use verify::{verify_program, VerifyError};

/// A stable identifier for a code unit (callable body) within a [`Program`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UnitId(pub u32);

/// A stable identifier for a declared host import within a [`Program`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct HostId(pub u32);

/// A variable binding slot index.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Slot(pub u32);

/// An index into a unit's lexical block table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockId(pub u32);

/// A program counter within a unit's code.
pub type Pc = u32;

/// The result arity a caller expects from a construct.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Want {
    Void,
    Scalar,
    List,
}

/// A literal value embedded in code.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Const {
    Undef,
    Int(i64),
    Num(f64),
    Str(String),
    Code(UnitId),
}

/// The source feeding an iterator loop.
///
/// `Stack` consumes the values above the topmost mark; `Range` pops a high
/// bound then a low bound and decides between numeric stepping and string
/// magic increment from the way the bounds look.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum IterSource {
    Stack,
    Range,
}

/// The kind of a lexical block in a unit's block tree.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockKind {
    Bare,
    Loop,
}

/// One lexical block: a half-open pc range `[start_pc, end_pc)` in the unit,
/// nested inside `parent`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub parent: Option<BlockId>,
    pub kind: BlockKind,
    pub start_pc: Pc,
    pub end_pc: Pc,
}

/// An in-memory instruction for the skein machine.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Op {
    /// Statement boundary: updates the current-location marker and carries
    /// the optional label `goto` searches for.
    Stmt { line: u32, label: Option<String> },

    Const { value: Const },
    Pop,
    PushMark,

    Load { slot: Slot },
    Store { slot: Slot },
    /// Dynamic-scope save of a slot's current value; restored when the
    /// enclosing scope closes.
    LocalScalar { slot: Slot },

    LoadArg { index: u32 },
    ArgCount,
    LastError,
    Wantarray,

    Add,
    Sub,
    Mul,
    Lt,
    Le,
    Gt,
    Ge,
    NumEq,
    NumNe,
    Concat,
    Not,

    Jump { target_pc: Pc },
    JumpIfFalse { target_pc: Pc },

    EnterBlock { block: BlockId },
    LeaveBlock,

    /// Pops the callee (a `Const::Code` value), takes the values above the
    /// topmost mark as arguments, and enters the callee with `want`.
    Call { want: Want },
    /// Lightweight callback entry: runs `unit` under a multicall
    /// pseudo-frame without an argument region or depth bookkeeping.
    LightCall { unit: UnitId },
    CallHost { host: HostId },
    EnterFormat { unit: UnitId },
    Return,

    EnterLoop {
        label: Option<String>,
        block: BlockId,
        body_pc: Pc,
        next_pc: Pc,
        exit_pc: Pc,
    },
    EnterIter {
        var: Slot,
        label: Option<String>,
        block: BlockId,
        source: IterSource,
        reversed: bool,
        body_pc: Pc,
        next_pc: Pc,
        exit_pc: Pc,
    },
    IterNext,
    LeaveLoop,

    Last { label: Option<String> },
    Next { label: Option<String> },
    Redo { label: Option<String> },

    Goto { label: String },
    /// Tail-call form: pops a code value and replaces the innermost
    /// subroutine frame's callee with it.
    GotoCode,

    EnterTry { resume_pc: Pc, keep_error: bool },
    LeaveTry,
    /// Pops the error message and transfers to the nearest exception frame.
    Raise,
    /// Pops source text, hands it to the compiler collaborator, and runs the
    /// result under an exception frame.
    EvalText { resume_pc: Pc },
    /// Pops a module name and loads it through the locator collaborator.
    Require,

    EnterSubst { cap: u32 },
    SubstIter { body_pc: Pc },
    LeaveSubst,

    GrepStart {
        topic: Slot,
        body_pc: Pc,
        done_pc: Pc,
        want: Want,
    },
    GrepWhile { body_pc: Pc },
    MapStart {
        topic: Slot,
        body_pc: Pc,
        done_pc: Pc,
        want: Want,
    },
    MapWhile { body_pc: Pc },

    /// Pops an exit status and terminates the run.
    Exit,
}

/// A callable body: code plus its lexical block tree.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CodeUnit {
    pub name: String,
    pub code: Vec<Op>,
    pub blocks: Vec<Block>,
}

impl CodeUnit {
    pub fn block(&self, id: BlockId) -> Option<&Block> {
        self.blocks.get(id.0 as usize)
    }

    /// The deepest block whose range contains `pc`, if any.
    pub fn enclosing_block(&self, pc: Pc) -> Option<BlockId> {
        let mut best: Option<(BlockId, Pc)> = None;
        for (i, b) in self.blocks.iter().enumerate() {
            if b.start_pc <= pc && pc < b.end_pc {
                let width = b.end_pc - b.start_pc;
                if best.map_or(true, |(_, w)| width < w) {
                    best = Some((BlockId(i as u32), width));
                }
            }
        }
        best.map(|(id, _)| id)
    }

    /// The chain of blocks enclosing `pc`, outermost first.
    pub fn block_chain(&self, pc: Pc) -> Vec<BlockId> {
        let mut chain = Vec::new();
        let mut cur = self.enclosing_block(pc);
        while let Some(id) = cur {
            chain.push(id);
            cur = self.blocks[id.0 as usize].parent;
        }
        chain.reverse();
        chain
    }

    /// Static search for a statement carrying `label`. First match in code
    /// order wins.
    pub fn find_label(&self, label: &str) -> Option<Pc> {
        self.code.iter().enumerate().find_map(|(pc, op)| match op {
            Op::Stmt { label: Some(l), .. } if l == label => Some(pc as Pc),
            _ => None,
        })
    }
}

/// A complete program: unit, host-import, and slot tables plus the entry
/// unit.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Program {
    pub units: Vec<CodeUnit>,
    pub unit_ids: BTreeMap<String, UnitId>,

    pub hosts: Vec<String>,
    pub host_ids: BTreeMap<String, HostId>,

    pub slots: Vec<String>,
    pub slot_ids: BTreeMap<String, Slot>,

    /// Entry unit for starting execution.
    pub entry: UnitId,
}

impl Program {
    pub fn add_unit(&mut self, unit: CodeUnit) -> Result<UnitId, String> {
        if self.unit_ids.contains_key(unit.name.as_str()) {
            return Err(format!("duplicate unit `{}`", unit.name));
        }
        let id_u32: u32 = self
            .units
            .len()
            .try_into()
            .map_err(|_| "unit table overflow".to_string())?;
        let id = UnitId(id_u32);
        self.unit_ids.insert(unit.name.clone(), id);
        self.units.push(unit);
        Ok(id)
    }

    pub fn unit(&self, id: UnitId) -> Option<&CodeUnit> {
        self.units.get(id.0 as usize)
    }

    pub fn unit_id(&self, name: &str) -> Option<UnitId> {
        self.unit_ids.get(name).copied()
    }

    pub fn add_host_import(&mut self, name: impl Into<String>) -> Result<HostId, String> {
        let name = name.into();
        if self.host_ids.contains_key(name.as_str()) {
            return Err(format!("duplicate host import `{name}`"));
        }
        let id_u32: u32 = self
            .hosts
            .len()
            .try_into()
            .map_err(|_| "host import table overflow".to_string())?;
        let id = HostId(id_u32);
        self.host_ids.insert(name.clone(), id);
        self.hosts.push(name);
        Ok(id)
    }

    pub fn host_import_id(&self, name: &str) -> Option<HostId> {
        self.host_ids.get(name).copied()
    }

    pub fn add_slot(&mut self, name: impl Into<String>) -> Result<Slot, String> {
        let name = name.into();
        if self.slot_ids.contains_key(name.as_str()) {
            return Err(format!("duplicate slot `{name}`"));
        }
        let id_u32: u32 = self
            .slots
            .len()
            .try_into()
            .map_err(|_| "slot table overflow".to_string())?;
        let id = Slot(id_u32);
        self.slot_ids.insert(name.clone(), id);
        self.slots.push(name);
        Ok(id)
    }

    pub fn slot_id(&self, name: &str) -> Option<Slot> {
        self.slot_ids.get(name).copied()
    }
}
