//! Canned collaborator implementations: a compiler that serves
//! pre-registered units keyed by exact source text, and an in-memory
//! locator. Tests and demos drive `EvalText`/`Require` with these without
//! touching a real front-end.

use std::collections::HashMap;

use skein_code::{CodeUnit, Program, UnitId};
use skein_vm::{CompileError, EvalScope, LocateError, ModuleLocator, TextCompiler};

/// A compiler collaborator that "compiles" by exact source lookup. Unknown
/// source text is a compile failure, which the engine surfaces as a raise.
/// Compiled units are named `(eval 1)`, `(eval 2)`, ... in creation order.
#[derive(Default)]
pub struct StaticCompiler {
    units: HashMap<String, CodeUnit>,
    evals: u32,
}

impl StaticCompiler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the unit served for `source`.
    pub fn provide(&mut self, source: &str, unit: CodeUnit) -> &mut Self {
        self.units.insert(source.trim().to_string(), unit);
        self
    }

    pub fn with(mut self, source: &str, unit: CodeUnit) -> Self {
        self.provide(source, unit);
        self
    }
}

impl TextCompiler for StaticCompiler {
    fn compile(
        &mut self,
        source: &str,
        _scope: EvalScope,
        program: &mut Program,
    ) -> Result<UnitId, CompileError> {
        let Some(unit) = self.units.get(source.trim()) else {
            return Err(CompileError {
                message: "syntax error".to_string(),
            });
        };
        let mut unit = unit.clone();
        self.evals += 1;
        unit.name = format!("(eval {})", self.evals);
        program
            .add_unit(unit)
            .map_err(|message| CompileError { message })
    }
}

/// An in-memory module locator keyed by module name.
#[derive(Default)]
pub struct StaticLocator {
    sources: HashMap<String, String>,
}

impl StaticLocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn provide(&mut self, module: &str, source: &str) -> &mut Self {
        self.sources.insert(module.to_string(), source.to_string());
        self
    }

    pub fn with(mut self, module: &str, source: &str) -> Self {
        self.provide(module, source);
        self
    }
}

impl ModuleLocator for StaticLocator {
    fn locate(&mut self, module: &str, _search_paths: &[String]) -> Result<String, LocateError> {
        self.sources.get(module).cloned().ok_or_else(|| LocateError {
            message: format!("module `{module}` not found"),
        })
    }
}
