//! Static validator: one pass over a [`SyntaxTree`], classifying every import
//! and every reference to a forbidden operation.
//!
//! The walk is pure. It never short-circuits: all violations are collected in
//! traversal order and a single one is enough to reject. Call sites are
//! resolved first (see `resolve`), so a forbidden leaf reached through a call
//! is attributed to the pattern that reached it; any forbidden leaf left over
//! afterwards is reported as a plain reference.

use std::collections::HashSet;

use serde::Serialize;

use crate::policy::PolicySet;
use crate::syntax::{Expr, ExprKind, Location, NodeId, Stmt, StmtKind, SyntaxTree};

mod resolve;

use resolve::{is_name_resolution_helper, Hit, Resolver};

/// Target recorded for statement forms the validator does not model.
pub const UNSUPPORTED_TARGET: &str = "<unsupported statement>";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum ViolationKind {
    Import,
    Operation,
}

/// How a forbidden operation was reached.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum ReferencePattern {
    /// `eval(..)`
    DirectCall,
    /// `builtins.eval(..)`, `x.__globals__`
    AttributeAccess,
    /// `{"f": eval}["f"](..)`, `__builtins__["eval"]`
    SubscriptAccess,
    /// `[eval][0](..)`, `(f,) = (eval,)`, `for f in [eval]: ..`
    ContainerIndirection,
    /// `getattr(obj, "ev" + "al")(..)`, `getattr(obj, name)(..)`
    ComputedName,
    /// A forbidden name handed around as a value: `f = eval`, `map(eval, xs)`.
    AliasReference,
}

impl ReferencePattern {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReferencePattern::DirectCall => "direct_call",
            ReferencePattern::AttributeAccess => "attribute_access",
            ReferencePattern::SubscriptAccess => "subscript_access",
            ReferencePattern::ContainerIndirection => "container_indirection",
            ReferencePattern::ComputedName => "computed_name",
            ReferencePattern::AliasReference => "alias_reference",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Violation {
    pub kind: ViolationKind,
    /// Module path for imports, operation name otherwise.
    pub target: String,
    pub location: Location,
    /// Always `None` for import violations.
    pub pattern: Option<ReferencePattern>,
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.kind, self.pattern) {
            (ViolationKind::Import, _) => {
                write!(f, "{}: import of '{}' not allowed", self.location, self.target)
            }
            (ViolationKind::Operation, Some(pattern)) => write!(
                f,
                "{}: forbidden operation '{}' ({})",
                self.location,
                self.target,
                pattern.as_str()
            ),
            (ViolationKind::Operation, None) => {
                write!(f, "{}: {}", self.location, self.target)
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ValidationVerdict {
    Accepted,
    Rejected(Vec<Violation>),
}

impl ValidationVerdict {
    pub fn is_accepted(&self) -> bool {
        matches!(self, ValidationVerdict::Accepted)
    }

    pub fn violations(&self) -> &[Violation] {
        match self {
            ValidationVerdict::Accepted => &[],
            ValidationVerdict::Rejected(violations) => violations,
        }
    }
}

/// Validate a tree against `policy`.
pub fn validate(tree: &SyntaxTree, policy: &PolicySet) -> ValidationVerdict {
    let mut walker = Walker {
        policy,
        resolver: Resolver::new(policy),
        violations: Vec::new(),
        reported: HashSet::new(),
        scopes: Vec::new(),
    };
    walker.stmts(&tree.body);
    if walker.violations.is_empty() {
        log::debug!("validator: accepted {} statements", tree.body.len());
        ValidationVerdict::Accepted
    } else {
        log::debug!(
            "validator: rejected with {} violation(s)",
            walker.violations.len()
        );
        ValidationVerdict::Rejected(walker.violations)
    }
}

struct Walker<'p> {
    policy: &'p PolicySet,
    resolver: Resolver<'p>,
    violations: Vec<Violation>,
    /// Forbidden leaves already attributed to a violation.
    reported: HashSet<NodeId>,
    /// Names bound in enclosing function, lambda and comprehension scopes.
    /// Module and class scopes are never recorded: there `open = open` still
    /// reads the builtin.
    scopes: Vec<HashSet<String>>,
}

impl Walker<'_> {
    fn stmts(&mut self, stmts: &[Stmt]) {
        for stmt in stmts {
            self.stmt(stmt);
        }
    }

    fn stmt(&mut self, stmt: &Stmt) {
        match &stmt.kind {
            StmtKind::Import { modules } => {
                for module in modules {
                    self.check_import(module, stmt.location);
                }
            }
            StmtKind::ImportFrom { module, level, .. } => {
                let path = format!(
                    "{}{}",
                    ".".repeat(*level as usize),
                    module.as_deref().unwrap_or("")
                );
                self.check_import(&path, stmt.location);
            }
            StmtKind::FunctionDef {
                params,
                header,
                body,
                ..
            } => {
                self.exprs(header);
                let mut bound: HashSet<String> = params
                    .iter()
                    .map(|param| param.trim_start_matches('*').to_string())
                    .collect();
                collect_local_bindings(body, &mut bound);
                let mut declared = HashSet::new();
                collect_declared(body, &mut declared);
                bound.retain(|name| !declared.contains(name));
                self.scopes.push(bound);
                self.stmts(body);
                self.scopes.pop();
            }
            StmtKind::ClassDef { header, body, .. } => {
                self.exprs(header);
                self.stmts(body);
            }
            StmtKind::Assign { targets, value } => {
                for target in targets {
                    if target.sequence_elements().is_some() {
                        let hits = self.resolver.container_members(value);
                        self.record(hits, value.location);
                    }
                    self.target(target);
                }
                self.expr(value);
            }
            StmtKind::For {
                target,
                iter,
                body,
                orelse,
            } => {
                self.target(target);
                let hits = self.resolver.container_members(iter);
                self.record(hits, iter.location);
                self.expr(iter);
                self.stmts(body);
                self.stmts(orelse);
            }
            StmtKind::Block { exprs, bodies } => {
                self.exprs(exprs);
                for body in bodies {
                    self.stmts(body);
                }
            }
            StmtKind::Declare { .. } => {}
            StmtKind::Unsupported => self.violations.push(Violation {
                kind: ViolationKind::Operation,
                target: UNSUPPORTED_TARGET.to_string(),
                location: stmt.location,
                pattern: None,
            }),
        }
    }

    fn check_import(&mut self, path: &str, location: Location) {
        if !self.policy.allows_module(path) {
            self.violations.push(Violation {
                kind: ViolationKind::Import,
                target: path.to_string(),
                location,
                pattern: None,
            });
        }
    }

    fn exprs(&mut self, exprs: &[Expr]) {
        for expr in exprs {
            self.expr(expr);
        }
    }

    /// Store context: plain names are bindings, not references.
    fn target(&mut self, target: &Expr) {
        match &target.kind {
            ExprKind::Name(_) => {}
            ExprKind::List(elts) | ExprKind::Tuple(elts) => {
                for elt in elts {
                    self.target(elt);
                }
            }
            _ => self.expr(target),
        }
    }

    fn expr(&mut self, expr: &Expr) {
        match &expr.kind {
            ExprKind::Name(name) => {
                if self.policy.forbids(name)
                    && !self.reported.contains(&expr.id)
                    && !self.is_bound(name)
                {
                    self.record_one(name.clone(), ReferencePattern::AliasReference, expr);
                }
            }
            ExprKind::Attribute { value, attr } => {
                if self.policy.forbids(attr) && !self.reported.contains(&expr.id) {
                    self.record_one(attr.clone(), ReferencePattern::AttributeAccess, expr);
                }
                self.expr(value);
            }
            ExprKind::Subscript { value, index } => {
                if !value.is_literal_container() {
                    if let Some(hit) = self.resolver.string_key(index) {
                        self.record(vec![hit], expr.location);
                    }
                }
                self.expr(value);
                self.expr(index);
            }
            ExprKind::Call {
                func,
                args,
                keywords,
            } => {
                let hits = self.resolver.callee(func);
                self.record(hits, expr.location);
                if is_name_resolution_helper(func) {
                    let hits = self.resolver.computed(func, args, false);
                    self.record(hits, expr.location);
                }
                let hits = self.resolver.lookup_keys(func, args);
                self.record(hits, expr.location);
                self.expr(func);
                self.exprs(args);
                for keyword in keywords {
                    self.expr(&keyword.value);
                }
            }
            ExprKind::List(elts) | ExprKind::Tuple(elts) | ExprKind::Set(elts) => {
                self.exprs(elts)
            }
            ExprKind::Dict(entries) => {
                for (key, value) in entries {
                    if let Some(key) = key {
                        self.expr(key);
                    }
                    self.expr(value);
                }
            }
            ExprKind::Str(_) | ExprKind::Int(_) | ExprKind::Constant => {}
            ExprKind::Comprehension {
                elements,
                generators,
            } => {
                for generator in generators {
                    let hits = self.resolver.container_members(&generator.iter);
                    self.record(hits, generator.iter.location);
                }
                // The outermost iterable is evaluated in the enclosing scope.
                if let Some(first) = generators.first() {
                    self.expr(&first.iter);
                }
                let mut bound = HashSet::new();
                for generator in generators {
                    collect_target_names(&generator.target, &mut bound);
                }
                self.scopes.push(bound);
                for (idx, generator) in generators.iter().enumerate() {
                    self.target(&generator.target);
                    if idx > 0 {
                        self.expr(&generator.iter);
                    }
                    self.exprs(&generator.conditions);
                }
                self.exprs(elements);
                self.scopes.pop();
            }
            ExprKind::Lambda {
                params,
                header,
                body,
            } => {
                self.exprs(header);
                self.scopes.push(
                    params
                        .iter()
                        .map(|param| param.trim_start_matches('*').to_string())
                        .collect(),
                );
                self.expr(body);
                self.scopes.pop();
            }
            ExprKind::Branch { tests, values } => {
                self.exprs(tests);
                self.exprs(values);
            }
            ExprKind::Concat(left, right) => {
                self.expr(left);
                self.expr(right);
            }
            ExprKind::Other(children) => self.exprs(children),
        }
    }

    fn is_bound(&self, name: &str) -> bool {
        self.scopes.iter().any(|scope| scope.contains(name))
    }

    fn record(&mut self, hits: Vec<Hit>, location: Location) {
        for hit in hits {
            if self.reported.insert(hit.leaf) {
                self.violations.push(Violation {
                    kind: ViolationKind::Operation,
                    target: hit.name,
                    location,
                    pattern: Some(hit.pattern),
                });
            }
        }
    }

    fn record_one(&mut self, name: String, pattern: ReferencePattern, leaf: &Expr) {
        self.record(
            vec![Hit {
                name,
                pattern,
                leaf: leaf.id,
            }],
            leaf.location,
        );
    }
}

/// Names assigned anywhere in a function body, excluding nested scopes.
/// Reading such a name before assignment fails at runtime, so inside the
/// function it never refers to a builtin.
fn collect_local_bindings(body: &[Stmt], bound: &mut HashSet<String>) {
    for stmt in body {
        match &stmt.kind {
            StmtKind::FunctionDef { name, .. } | StmtKind::ClassDef { name, .. } => {
                bound.insert(name.clone());
            }
            StmtKind::Assign { targets, .. } => {
                for target in targets {
                    collect_target_names(target, bound);
                }
            }
            StmtKind::For {
                target,
                body,
                orelse,
                ..
            } => {
                collect_target_names(target, bound);
                collect_local_bindings(body, bound);
                collect_local_bindings(orelse, bound);
            }
            StmtKind::Block { bodies, .. } => {
                for body in bodies {
                    collect_local_bindings(body, bound);
                }
            }
            StmtKind::Import { .. }
            | StmtKind::ImportFrom { .. }
            | StmtKind::Declare { .. }
            | StmtKind::Unsupported => {}
        }
    }
}

/// Names a function body declares `global` or `nonlocal`. Assigning them
/// rebinds the outer name, so they are never local.
fn collect_declared(body: &[Stmt], declared: &mut HashSet<String>) {
    for stmt in body {
        match &stmt.kind {
            StmtKind::Declare { names } => declared.extend(names.iter().cloned()),
            StmtKind::For { body, orelse, .. } => {
                collect_declared(body, declared);
                collect_declared(orelse, declared);
            }
            StmtKind::Block { bodies, .. } => {
                for body in bodies {
                    collect_declared(body, declared);
                }
            }
            _ => {}
        }
    }
}

fn collect_target_names(target: &Expr, bound: &mut HashSet<String>) {
    match &target.kind {
        ExprKind::Name(name) => {
            bound.insert(name.clone());
        }
        ExprKind::List(elts) | ExprKind::Tuple(elts) => {
            for elt in elts {
                collect_target_names(elt, bound);
            }
        }
        _ => {}
    }
}
