#![forbid(unsafe_code)]

//! skein — the control-transfer and context-stack engine of a stack-based
//! script interpreter.
//!
//! The engine proper lives in two member crates: [`skein_code`] holds the
//! program representation (ops, code units, lexical block trees) and
//! [`skein_vm`] holds the machine (context stack, save stack, loop
//! iterators, the lazy list evaluator, and the control-transfer
//! dispatcher). This crate is the embedding surface: collaborator
//! implementations and re-exports.

/// Filesystem module locator used by `Require`.
pub mod modules;

/// Canned collaborator implementations for tests and demos.
pub mod test_helpers;

pub use skein_code::{
    verify_program, Block, BlockId, BlockKind, CodeUnit, Const, HostId, IterSource, Op, Pc,
    Program, Slot, UnitId, VerifyError, Want,
};
pub use skein_vm::{
    CompileError, EvalScope, HostError, HostFn, Loc, LocateError, ModuleLocator, ModuleState,
    OwnedHandle, RunOutcome, SaveAction, TextCompiler, Value, Vm, VmError, Watermark,
};
