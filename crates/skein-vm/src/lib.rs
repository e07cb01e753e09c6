#![forbid(unsafe_code)]

//! The skein machine: a flat dispatch loop over [`skein_code`] programs with
//! a context stack of frames, a save stack of scoped undo actions, and a
//! control-transfer dispatcher for `return`, loop control, `goto`, and
//! raise/catch unwinding.

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use skein_code::{HostId, Program, Slot, UnitId, Want};

mod context;
mod dispatch;
mod iter;
mod lazy;
mod scope;
mod step;

pub use scope::{OwnedHandle, SaveAction, Watermark};

use context::ContextStack;
use lazy::LazyCtl;
use scope::{OwnedSlab, SaveStack};

/// A shared mutable binding cell. Variable slots bind to cells; rebinding a
/// slot and restoring its previous cell is what `RestoreBinding` undoes.
pub type ValueCell = Rc<RefCell<Value>>;

/// A runtime scalar value.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Undef,
    Int(i64),
    Num(f64),
    Str(String),
    Code(UnitId),
}

impl Value {
    pub fn is_true(&self) -> bool {
        match self {
            Value::Undef => false,
            Value::Int(n) => *n != 0,
            Value::Num(n) => *n != 0.0,
            Value::Str(s) => !s.is_empty() && s != "0",
            Value::Code(_) => true,
        }
    }

    pub fn as_num(&self) -> f64 {
        match self {
            Value::Undef => 0.0,
            Value::Int(n) => *n as f64,
            Value::Num(n) => *n,
            Value::Str(s) => parse_numeric_prefix(s),
            Value::Code(_) => 0.0,
        }
    }

    pub fn as_int(&self) -> i64 {
        match self {
            Value::Int(n) => *n,
            other => other.as_num() as i64,
        }
    }

    pub fn cell(self) -> ValueCell {
        Rc::new(RefCell::new(self))
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Undef => Ok(()),
            Value::Int(n) => write!(f, "{n}"),
            Value::Num(n) => {
                if n.fract() == 0.0 && n.abs() < 1e15 {
                    write!(f, "{}", *n as i64)
                } else {
                    write!(f, "{n}")
                }
            }
            Value::Str(s) => write!(f, "{s}"),
            Value::Code(id) => write!(f, "CODE({})", id.0),
        }
    }
}

/// Numeric value of a string's leading numeric portion, `0.0` when there is
/// none.
fn parse_numeric_prefix(s: &str) -> f64 {
    let t = s.trim_start();
    let bytes = t.as_bytes();
    let mut end = 0usize;
    let mut seen_digit = false;
    let mut seen_dot = false;
    let mut seen_exp = false;
    for (i, &b) in bytes.iter().enumerate() {
        match b {
            b'+' | b'-' if i == 0 || bytes[i - 1] == b'e' || bytes[i - 1] == b'E' => {}
            b'0'..=b'9' => seen_digit = true,
            b'.' if !seen_dot && !seen_exp => seen_dot = true,
            b'e' | b'E' if seen_digit && !seen_exp => {
                seen_exp = true;
                seen_dot = true;
            }
            _ => break,
        }
        end = i + 1;
    }
    if !seen_digit {
        return 0.0;
    }
    t[..end].parse::<f64>().unwrap_or(0.0)
}

/// The current source location: a unit plus the line of the last statement
/// boundary crossed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Loc {
    pub unit: UnitId,
    pub line: u32,
}

/// The result of driving a program to completion.
#[derive(Clone, Debug, PartialEq)]
pub enum RunOutcome {
    /// The entry unit ran off its end; `values` is what it left on the
    /// value stack.
    Done { values: Vec<Value> },
    /// An `Exit` op ran.
    Exited { status: i32 },
    /// An uncaught raise or an inconsistent program state. The message has
    /// already been written to the diagnostic stream.
    Fatal { message: String },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VmError {
    InvalidProgram { message: String },
    InvalidState { message: String },
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmError::InvalidProgram { message } => write!(f, "invalid program: {message}"),
            VmError::InvalidState { message } => write!(f, "invalid state: {message}"),
        }
    }
}

impl std::error::Error for VmError {}

/// An error returned by a host builtin; surfaced as a raise at the call
/// site, so it unwinds like any other exception.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostError {
    pub message: String,
}

impl fmt::Display for HostError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for HostError {}

pub trait HostFn {
    fn call(&mut self, args: &[Value]) -> Result<Vec<Value>, HostError>;
}

impl<F> HostFn for F
where
    F: FnMut(&[Value]) -> Result<Vec<Value>, HostError>,
{
    fn call(&mut self, args: &[Value]) -> Result<Vec<Value>, HostError> {
        self(args)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompileError {
    pub message: String,
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CompileError {}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LocateError {
    pub message: String,
}

impl fmt::Display for LocateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for LocateError {}

/// Where an `eval` was entered, handed to the compiler collaborator.
#[derive(Clone, Copy, Debug)]
pub struct EvalScope {
    pub unit: UnitId,
    pub loc: Loc,
}

/// The expression-compiler collaborator: turns source text into a new unit
/// appended to `program`. Failures surface exactly as a raise would.
pub trait TextCompiler {
    fn compile(
        &mut self,
        source: &str,
        scope: EvalScope,
        program: &mut Program,
    ) -> Result<UnitId, CompileError>;
}

/// The module-locator collaborator: resolves a module name to source text.
pub trait ModuleLocator {
    fn locate(&mut self, module: &str, search_paths: &[String]) -> Result<String, LocateError>;
}

/// Load bookkeeping for `Require`. `InProgress` is set before compiling and
/// rolled back if the attempt fails.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModuleState {
    InProgress,
    Loaded,
}

/// The machine. Owns the program, the value/mark stacks, the context stack,
/// and the save stack; all control transfer goes through `&mut` methods on
/// this one value.
pub struct Vm {
    pub(crate) program: Program,
    pub(crate) unit: UnitId,
    pub(crate) pc: usize,

    pub(crate) stack: Vec<Value>,
    pub(crate) marks: Vec<usize>,
    pub(crate) cx: ContextStack,
    pub(crate) saves: SaveStack,
    pub(crate) lazy: Vec<LazyCtl>,

    pub(crate) slots: Vec<ValueCell>,
    pub(crate) loc: Loc,
    pub(crate) last_error: Value,
    pub(crate) in_eval: bool,
    pub(crate) root_want: Want,
    pub(crate) unit_depths: Vec<u32>,

    pub(crate) owned: OwnedSlab,
    pub(crate) modules: HashMap<String, ModuleState>,
    pub(crate) search_paths: Vec<String>,
    pub(crate) compiler: Option<Box<dyn TextCompiler>>,
    pub(crate) locator: Option<Box<dyn ModuleLocator>>,
    pub(crate) host_fns: Vec<Option<Box<dyn HostFn>>>,

    pub(crate) finished: Option<RunOutcome>,
}

impl Vm {
    pub fn new(program: Program) -> Result<Self, VmError> {
        skein_code::verify_program(&program).map_err(|e| VmError::InvalidProgram {
            message: e.to_string(),
        })?;

        let entry = program.entry;
        let slots = program.slots.iter().map(|_| Value::Undef.cell()).collect();
        let unit_depths = vec![0; program.units.len()];
        let host_fns = {
            let mut host_fns: Vec<Option<Box<dyn HostFn>>> =
                Vec::with_capacity(program.hosts.len());
            host_fns.resize_with(program.hosts.len(), || None);
            host_fns
        };

        Ok(Self {
            program,
            unit: entry,
            pc: 0,
            stack: Vec::new(),
            marks: Vec::new(),
            cx: ContextStack::new(),
            saves: SaveStack::new(),
            lazy: Vec::new(),
            slots,
            loc: Loc {
                unit: entry,
                line: 0,
            },
            last_error: Value::Str(String::new()),
            in_eval: false,
            root_want: Want::List,
            unit_depths,
            owned: OwnedSlab::new(),
            modules: HashMap::new(),
            search_paths: Vec::new(),
            compiler: None,
            locator: None,
            host_fns,
            finished: None,
        })
    }

    pub fn register_host(&mut self, id: HostId, f: impl HostFn + 'static) -> Result<(), VmError> {
        let idx = id.0 as usize;
        if idx >= self.host_fns.len() {
            return Err(VmError::InvalidState {
                message: format!("host import id {} out of range", id.0),
            });
        }
        self.host_fns[idx] = Some(Box::new(f));
        Ok(())
    }

    pub fn set_compiler(&mut self, compiler: impl TextCompiler + 'static) {
        self.compiler = Some(Box::new(compiler));
    }

    pub fn set_locator(&mut self, locator: impl ModuleLocator + 'static) {
        self.locator = Some(Box::new(locator));
    }

    pub fn set_search_paths(&mut self, paths: Vec<String>) {
        self.search_paths = paths;
    }

    pub fn set_root_want(&mut self, want: Want) {
        self.root_want = want;
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    /// The process-wide last-error slot, exposed for host embedding.
    pub fn last_error(&self) -> &Value {
        &self.last_error
    }

    pub fn set_last_error(&mut self, value: Value) {
        self.last_error = value;
    }

    pub fn module_state(&self, name: &str) -> Option<ModuleState> {
        self.modules.get(name).copied()
    }

    pub fn slot_value(&self, slot: Slot) -> Value {
        self.slots[slot.0 as usize].borrow().clone()
    }

    pub fn set_slot_value(&mut self, slot: Slot, value: Value) {
        *self.slots[slot.0 as usize].borrow_mut() = value;
    }

    /// Registers a host resource for deterministic scoped release via
    /// [`SaveAction::ReleaseOwned`].
    pub fn own(&mut self, resource: Box<dyn Any>) -> OwnedHandle {
        self.owned.insert(resource)
    }

    /// Releases an owned resource immediately, returning it if the handle is
    /// still live.
    pub fn release_owned(&mut self, handle: OwnedHandle) -> Option<Box<dyn Any>> {
        self.owned.remove(handle)
    }

    pub(crate) fn unit_name(&self, id: UnitId) -> &str {
        self.program
            .unit(id)
            .map(|u| u.name.as_str())
            .unwrap_or("?")
    }

    pub(crate) fn cur_want(&self) -> Want {
        self.cx.top().map(|f| f.want).unwrap_or(self.root_want)
    }

    /// Appends the customary location suffix when the message does not end
    /// its own line.
    pub(crate) fn with_location(&self, msg: String) -> String {
        if msg.ends_with('\n') {
            msg
        } else {
            format!(
                "{msg} at {} line {}.\n",
                self.unit_name(self.loc.unit),
                self.loc.line
            )
        }
    }
}
