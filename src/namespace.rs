//! The loaded namespace handed to the analysis engine.
//!
//! Loading happens inside the guarded window: every top-level import is
//! resolved through the live import guard, then the module's functions,
//! classes and assigned names are registered. Nothing here executes
//! submitted code; the engine gets a structural view plus a guarded
//! `import_module` for anything it needs to resolve later.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use anyhow::Result;
use serde::Serialize;

use crate::error::GateError;
use crate::guardian::{ImportGuardian, ModuleRef};
use crate::limiter::CancelToken;
use crate::syntax::{Expr, ExprKind, Location, Stmt, StmtKind, SyntaxTree};

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FunctionInfo {
    /// `name` for module functions, `Class.name` for methods.
    pub qualified_name: String,
    pub params: Vec<String>,
    pub location: Location,
}

impl FunctionInfo {
    pub fn is_method(&self) -> bool {
        self.qualified_name.contains('.')
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ClassInfo {
    pub name: String,
    pub methods: Vec<String>,
    pub location: Location,
}

pub struct Namespace {
    tree: Arc<SyntaxTree>,
    generation: u64,
    cancel: CancelToken,
    imports: Vec<ModuleRef>,
    functions: BTreeMap<String, FunctionInfo>,
    classes: BTreeMap<String, ClassInfo>,
    names: BTreeSet<String>,
}

impl Namespace {
    /// Load `tree` through the guard installed as `generation`.
    ///
    /// A blocked import aborts the load with [`GateError::ImportBlocked`] in
    /// the error chain.
    pub fn load(tree: Arc<SyntaxTree>, generation: u64, cancel: CancelToken) -> Result<Self> {
        let mut namespace = Self {
            tree: tree.clone(),
            generation,
            cancel,
            imports: Vec::new(),
            functions: BTreeMap::new(),
            classes: BTreeMap::new(),
            names: BTreeSet::new(),
        };
        for stmt in &tree.body {
            namespace.checkpoint()?;
            namespace.register(stmt)?;
        }
        log::debug!(
            "namespace: loaded {} import(s), {} function(s), {} class(es)",
            namespace.imports.len(),
            namespace.functions.len(),
            namespace.classes.len()
        );
        Ok(namespace)
    }

    fn register(&mut self, stmt: &Stmt) -> Result<(), GateError> {
        match &stmt.kind {
            StmtKind::Import { modules } => {
                for module in modules {
                    let module = self.import_module(module)?;
                    self.imports.push(module);
                }
            }
            StmtKind::ImportFrom {
                module,
                level,
                names,
            } => {
                let path = format!(
                    "{}{}",
                    ".".repeat(*level as usize),
                    module.as_deref().unwrap_or("")
                );
                let module = self.import_module(&path)?;
                self.imports.push(module);
                self.names.extend(names.iter().filter(|name| *name != "*").cloned());
            }
            StmtKind::FunctionDef {
                name, params, ..
            } => {
                self.functions.insert(
                    name.clone(),
                    FunctionInfo {
                        qualified_name: name.clone(),
                        params: params.clone(),
                        location: stmt.location,
                    },
                );
            }
            StmtKind::ClassDef { name, body, .. } => {
                let mut methods = Vec::new();
                for member in body {
                    if let StmtKind::FunctionDef {
                        name: method,
                        params,
                        ..
                    } = &member.kind
                    {
                        let qualified_name = format!("{}.{}", name, method);
                        methods.push(method.clone());
                        self.functions.insert(
                            qualified_name.clone(),
                            FunctionInfo {
                                qualified_name,
                                params: params.clone(),
                                location: member.location,
                            },
                        );
                    }
                }
                self.classes.insert(
                    name.clone(),
                    ClassInfo {
                        name: name.clone(),
                        methods,
                        location: stmt.location,
                    },
                );
            }
            StmtKind::Assign { targets, .. } => {
                for target in targets {
                    collect_names(target, &mut self.names);
                }
            }
            StmtKind::For { .. }
            | StmtKind::Block { .. }
            | StmtKind::Declare { .. }
            | StmtKind::Unsupported => {}
        }
        Ok(())
    }

    pub fn tree(&self) -> &SyntaxTree {
        &self.tree
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn function(&self, name: &str) -> Option<&FunctionInfo> {
        self.functions.get(name)
    }

    pub fn functions(&self) -> impl Iterator<Item = &FunctionInfo> {
        self.functions.values()
    }

    pub fn classes(&self) -> impl Iterator<Item = &ClassInfo> {
        self.classes.values()
    }

    pub fn imports(&self) -> &[ModuleRef] {
        &self.imports
    }

    /// Module-level names bound by assignment or `from .. import`.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }

    /// Resolve a module path computed at analysis time.
    pub fn import_module(&self, path: &str) -> Result<ModuleRef, GateError> {
        ImportGuardian::resolve(self.generation, path)
    }

    /// Fails with [`GateError::Cancelled`] once the limiter has given up on
    /// this run. Long-running engines should call it between steps.
    pub fn checkpoint(&self) -> Result<(), GateError> {
        if self.cancel.is_cancelled() {
            return Err(GateError::Cancelled);
        }
        Ok(())
    }
}

fn collect_names(target: &Expr, names: &mut BTreeSet<String>) {
    match &target.kind {
        ExprKind::Name(name) => {
            names.insert(name.clone());
        }
        ExprKind::List(elts) | ExprKind::Tuple(elts) => {
            for elt in elts {
                collect_names(elt, names);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guardian::lock_session;
    use crate::policy::PolicySet;
    use crate::syntax::parse;

    const SOURCE: &str = "\
import math
from collections import deque, OrderedDict
LIMIT, SCALE = 10, 2

def area(r, *, precise=False):
    return math.pi * r * r

class Stack:
    def push(self, item):
        pass
    def pop(self):
        pass
";

    #[test]
    fn registers_symbols_through_live_guard() {
        let _session = lock_session();
        let guard = ImportGuardian::install(Arc::new(PolicySet::default())).expect("install");
        let tree = Arc::new(parse(SOURCE).expect("parse"));
        let namespace =
            Namespace::load(tree, guard.generation(), CancelToken::new()).expect("load");

        let imports: Vec<&str> = namespace.imports().iter().map(|m| m.path.as_str()).collect();
        assert_eq!(imports, vec!["math", "collections"]);
        assert_eq!(
            namespace.function("area").map(|f| f.params.clone()),
            Some(vec!["r".to_string(), "precise".to_string()])
        );
        let push = namespace.function("Stack.push").expect("method registered");
        assert!(push.is_method());
        assert_eq!(
            namespace.classes().next().map(|c| c.methods.clone()),
            Some(vec!["push".to_string(), "pop".to_string()])
        );
        let names: Vec<&str> = namespace.names().collect();
        assert_eq!(names, vec!["LIMIT", "OrderedDict", "SCALE", "deque"]);
        assert_eq!(guard.resolved(), vec!["math", "collections"]);
    }

    #[test]
    fn runtime_import_goes_through_guard() {
        let _session = lock_session();
        let guard = ImportGuardian::install(Arc::new(PolicySet::default())).expect("install");
        let tree = Arc::new(parse("x = 1\n").expect("parse"));
        let namespace =
            Namespace::load(tree, guard.generation(), CancelToken::new()).expect("load");
        assert!(namespace.import_module("itertools").is_ok());
        let err = namespace
            .import_module(&format!("{}.{}", "subprocess", "run"))
            .expect_err("computed import blocked");
        assert_eq!(err.code(), "GATE_IMPORT_BLOCKED");
    }

    #[test]
    fn load_without_guard_is_blocked() {
        let _session = lock_session();
        let tree = Arc::new(parse("import math\n").expect("parse"));
        let err = Namespace::load(tree, u64::MAX, CancelToken::new())
            .err()
            .expect("blocked");
        let gate_err = err.downcast_ref::<GateError>().expect("gate error");
        assert!(matches!(gate_err, GateError::ImportBlocked { .. }));
    }

    #[test]
    fn checkpoint_reports_cancellation() {
        let _session = lock_session();
        let guard = ImportGuardian::install(Arc::new(PolicySet::default())).expect("install");
        let cancel = CancelToken::new();
        let tree = Arc::new(parse("y = 2\n").expect("parse"));
        let namespace = Namespace::load(tree, guard.generation(), cancel.clone()).expect("load");
        assert!(namespace.checkpoint().is_ok());
        cancel.cancel();
        assert!(matches!(namespace.checkpoint(), Err(GateError::Cancelled)));
    }
}
