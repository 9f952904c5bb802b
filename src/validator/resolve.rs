use crate::policy::PolicySet;
use crate::syntax::{Expr, ExprKind, NodeId};

use super::ReferencePattern;

/// Target recorded for name lookups whose name cannot be computed statically.
pub(super) const DYNAMIC_TARGET: &str = "<dynamic>";

/// Lookup helpers that fetch an attribute named by a string argument.
const NAME_RESOLUTION_HELPERS: &[&str] = &[
    "getattr",
    "__getattribute__",
    "__getattr__",
    "attrgetter",
    "methodcaller",
];

/// Calls whose result is drawn from the elements of their argument.
const ITERATION_HELPERS: &[&str] = &[
    "next", "iter", "list", "tuple", "set", "reversed", "sorted", "min", "max", "enumerate",
];

/// Mapping methods taking a key, reported as computed names.
const MAPPING_LOOKUPS: &[&str] = &["get", "pop", "setdefault"];

/// Method and helper forms of `obj[key]`.
const SUBSCRIPT_LOOKUPS: &[&str] = &["__getitem__", "itemgetter"];

/// A forbidden operation reached by some expression.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(super) struct Hit {
    pub name: String,
    pub pattern: ReferencePattern,
    /// Node that names the operation; used to report each leaf once.
    pub leaf: NodeId,
}

impl Hit {
    fn with_pattern(mut self, pattern: ReferencePattern) -> Self {
        self.pattern = pattern;
        self
    }
}

pub(super) struct Resolver<'p> {
    policy: &'p PolicySet,
}

impl<'p> Resolver<'p> {
    pub(super) fn new(policy: &'p PolicySet) -> Self {
        Self { policy }
    }

    /// Forbidden operations an expression in callee position may invoke.
    pub(super) fn callee(&self, func: &Expr) -> Vec<Hit> {
        self.reference(func)
    }

    /// Forbidden operations the value of `expr` may statically be.
    fn reference(&self, expr: &Expr) -> Vec<Hit> {
        match &expr.kind {
            ExprKind::Name(name) if self.policy.forbids(name) => vec![Hit {
                name: name.clone(),
                pattern: ReferencePattern::DirectCall,
                leaf: expr.id,
            }],
            ExprKind::Attribute { value, attr } => {
                if self.policy.forbids(attr) {
                    return vec![Hit {
                        name: attr.clone(),
                        pattern: ReferencePattern::AttributeAccess,
                        leaf: expr.id,
                    }];
                }
                self.reference(value)
                    .into_iter()
                    .map(|hit| match hit.pattern {
                        ReferencePattern::DirectCall => {
                            hit.with_pattern(ReferencePattern::AttributeAccess)
                        }
                        _ => hit,
                    })
                    .collect()
            }
            ExprKind::Subscript { value, index } => self.subscript(value, index),
            ExprKind::Call { func, args, .. } => self.call_result(func, args),
            ExprKind::Branch { values, .. } => {
                values.iter().flat_map(|value| self.reference(value)).collect()
            }
            _ => Vec::new(),
        }
    }

    fn subscript(&self, value: &Expr, index: &Expr) -> Vec<Hit> {
        let mut hits = Vec::new();
        let mut literal_base = false;
        for base in self.candidates(value) {
            match &base.kind {
                ExprKind::Dict(entries) => {
                    literal_base = true;
                    hits.extend(
                        select_mapping(entries, index)
                            .into_iter()
                            .flat_map(|selected| self.reference(selected))
                            .map(|hit| hit.with_pattern(ReferencePattern::SubscriptAccess)),
                    );
                }
                ExprKind::Comprehension { .. } => {
                    literal_base = true;
                    hits.extend(self.container_members(base));
                }
                _ => {
                    if let Some(elements) = base.sequence_elements() {
                        literal_base = true;
                        hits.extend(
                            select_sequence(elements, index)
                                .into_iter()
                                .flat_map(|selected| self.reference(selected))
                                .map(|hit| {
                                    hit.with_pattern(ReferencePattern::ContainerIndirection)
                                }),
                        );
                    }
                }
            }
        }
        if !literal_base {
            hits.extend(self.string_key(index));
        }
        hits
    }

    /// A string subscript key that names a forbidden operation, e.g. `__builtins__["eval"]`.
    pub(super) fn string_key(&self, index: &Expr) -> Option<Hit> {
        let key = static_str(index)?;
        self.policy.forbids(&key).then(|| Hit {
            name: key,
            pattern: ReferencePattern::SubscriptAccess,
            leaf: index.id,
        })
    }

    /// Forbidden operations produced by calling `func(args..)`, when that
    /// result is itself called.
    fn call_result(&self, func: &Expr, args: &[Expr]) -> Vec<Hit> {
        if is_name_resolution_helper(func) {
            return self.computed(func, args, true);
        }
        match &func.kind {
            ExprKind::Lambda { body, .. } => self.reference(body),
            ExprKind::Attribute { value, attr } if is_key_lookup(attr) => {
                if let Some(key) = args.first() {
                    let dicts: Vec<Hit> = self
                        .candidates(value)
                        .into_iter()
                        .filter_map(|base| match &base.kind {
                            ExprKind::Dict(entries) => Some(entries),
                            _ => None,
                        })
                        .flat_map(|entries| select_mapping(entries, key))
                        .flat_map(|selected| self.reference(selected))
                        .map(|hit| hit.with_pattern(ReferencePattern::SubscriptAccess))
                        .collect();
                    if !dicts.is_empty() {
                        return dicts;
                    }
                }
                self.lookup_keys(func, args)
            }
            _ if callable_name(func) == Some("itemgetter") => self.lookup_keys(func, args),
            // `itemgetter(key)(obj)` is `obj[key]`.
            ExprKind::Call {
                func: getter,
                args: keys,
                ..
            } if callable_name(getter) == Some("itemgetter") => self.lookup_keys(getter, keys),
            _ if callable_name(func).is_some_and(|name| ITERATION_HELPERS.contains(&name)) => args
                .iter()
                .flat_map(|arg| self.container_members(arg))
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Static string keys passed to a key lookup method or helper:
    /// `d.__getitem__("eval")`, `dict.get(d, "eval")`, `itemgetter("eval")`.
    /// Every argument is checked, so unbound method forms are covered too.
    /// Lookups on a literal container are resolved by value instead.
    pub(super) fn lookup_keys(&self, func: &Expr, args: &[Expr]) -> Vec<Hit> {
        let Some(name) = callable_name(func) else {
            return Vec::new();
        };
        let pattern = if SUBSCRIPT_LOOKUPS.contains(&name) {
            ReferencePattern::SubscriptAccess
        } else if MAPPING_LOOKUPS.contains(&name) {
            ReferencePattern::ComputedName
        } else {
            return Vec::new();
        };
        if let ExprKind::Attribute { value, .. } = &func.kind {
            if value.is_literal_container() {
                return Vec::new();
            }
        }
        args.iter()
            .filter_map(|arg| self.string_key(arg))
            .map(|hit| hit.with_pattern(pattern))
            .collect()
    }

    /// Name-resolution helper analysis. With `callee` set, a name argument
    /// that cannot be computed statically is itself a violation.
    pub(super) fn computed(&self, func: &Expr, args: &[Expr], callee: bool) -> Vec<Hit> {
        let mut hits: Vec<Hit> = args
            .iter()
            .flat_map(|arg| self.reference(arg))
            .map(|hit| hit.with_pattern(ReferencePattern::ComputedName))
            .collect();
        for arg in args {
            if let Some(name) = static_str(arg) {
                if self.policy.forbids(&name) {
                    hits.push(Hit {
                        name,
                        pattern: ReferencePattern::ComputedName,
                        leaf: arg.id,
                    });
                }
            }
        }
        if callee && hits.is_empty() {
            let resolvable = args
                .get(name_argument_index(func))
                .is_some_and(|arg| static_str(arg).is_some());
            if !resolvable {
                hits.push(Hit {
                    name: DYNAMIC_TARGET.to_string(),
                    pattern: ReferencePattern::ComputedName,
                    leaf: func.id,
                });
            }
        }
        hits
    }

    /// Forbidden operations held by a literal container (or a comprehension
    /// drawing from one) that is iterated or unpacked.
    pub(super) fn container_members(&self, expr: &Expr) -> Vec<Hit> {
        let mut hits = Vec::new();
        for candidate in self.candidates(expr) {
            match &candidate.kind {
                ExprKind::Dict(entries) => {
                    for (key, value) in entries {
                        if let Some(key) = key {
                            hits.extend(self.reference(key));
                        }
                        hits.extend(self.reference(value));
                    }
                }
                ExprKind::Comprehension {
                    elements,
                    generators,
                } => {
                    for generator in generators {
                        hits.extend(self.container_members(&generator.iter));
                    }
                    hits.extend(elements.iter().flat_map(|element| self.reference(element)));
                }
                ExprKind::Call { func, args, .. }
                    if callable_name(func).is_some_and(|name| ITERATION_HELPERS.contains(&name)) =>
                {
                    for arg in args {
                        hits.extend(self.container_members(arg));
                    }
                }
                _ => {
                    if let Some(elements) = candidate.sequence_elements() {
                        for element in elements {
                            hits.extend(self.reference(element));
                            if element.is_literal_container() {
                                hits.extend(self.container_members(element));
                            }
                        }
                    }
                }
            }
        }
        hits.into_iter()
            .map(|hit| hit.with_pattern(ReferencePattern::ContainerIndirection))
            .collect()
    }

    /// Expressions `expr` may statically evaluate to, looking through literal
    /// subscripts and conditional forms.
    fn candidates<'e>(&self, expr: &'e Expr) -> Vec<&'e Expr> {
        match &expr.kind {
            ExprKind::Subscript { value, index } => {
                let mut out = Vec::new();
                for base in self.candidates(value) {
                    match &base.kind {
                        ExprKind::Dict(entries) => out.extend(select_mapping(entries, index)),
                        _ => {
                            if let Some(elements) = base.sequence_elements() {
                                out.extend(select_sequence(elements, index));
                            }
                        }
                    }
                }
                if out.is_empty() {
                    out.push(expr);
                }
                out
            }
            ExprKind::Branch { values, .. } => values
                .iter()
                .flat_map(|value| self.candidates(value))
                .collect(),
            _ => vec![expr],
        }
    }
}

pub(super) fn is_name_resolution_helper(func: &Expr) -> bool {
    callable_name(func).is_some_and(|name| NAME_RESOLUTION_HELPERS.contains(&name))
}

fn is_key_lookup(name: &str) -> bool {
    MAPPING_LOOKUPS.contains(&name) || SUBSCRIPT_LOOKUPS.contains(&name)
}

/// Final identifier of a callee: `f` for `f(..)`, `g` for `a.b.g(..)`.
fn callable_name(func: &Expr) -> Option<&str> {
    match &func.kind {
        ExprKind::Name(name) => Some(name),
        ExprKind::Attribute { attr, .. } => Some(attr),
        _ => None,
    }
}

/// Position of the attribute-name argument for a lookup helper.
fn name_argument_index(func: &Expr) -> usize {
    match &func.kind {
        ExprKind::Name(name) if name == "getattr" => 1,
        ExprKind::Attribute { value, attr }
            if attr == "__getattribute__" || attr == "__getattr__" =>
        {
            match value.as_name() {
                Some("object") | Some("type") => 1,
                _ => 0,
            }
        }
        _ => 0,
    }
}

/// Fold string constants and `+` concatenations of them.
pub(super) fn static_str(expr: &Expr) -> Option<String> {
    match &expr.kind {
        ExprKind::Str(text) => Some(text.clone()),
        ExprKind::Concat(left, right) => {
            let mut text = static_str(left)?;
            text.push_str(&static_str(right)?);
            Some(text)
        }
        _ => None,
    }
}

fn select_sequence<'e>(elements: &'e [Expr], index: &Expr) -> Vec<&'e Expr> {
    if let ExprKind::Int(position) = index.kind {
        let len = elements.len() as i64;
        let resolved = if position < 0 { len + position } else { position };
        return usize::try_from(resolved)
            .ok()
            .and_then(|idx| elements.get(idx))
            .into_iter()
            .collect();
    }
    elements.iter().collect()
}

fn select_mapping<'e>(entries: &'e [(Option<Expr>, Expr)], key: &Expr) -> Vec<&'e Expr> {
    let wanted = static_key(key);
    let all = || entries.iter().map(|(_, value)| value).collect::<Vec<_>>();
    let Some(wanted) = wanted else {
        return all();
    };
    let mut selected = Vec::new();
    for (entry_key, value) in entries {
        match entry_key.as_ref().map(static_key) {
            Some(Some(entry_key)) if entry_key == wanted => selected.push(value),
            Some(Some(_)) => {}
            // Splats and non-literal keys may hold the wanted key.
            _ => return all(),
        }
    }
    selected
}

#[derive(PartialEq, Eq)]
enum StaticKey {
    Str(String),
    Int(i64),
}

fn static_key(expr: &Expr) -> Option<StaticKey> {
    match &expr.kind {
        ExprKind::Int(value) => Some(StaticKey::Int(*value)),
        _ => static_str(expr).map(StaticKey::Str),
    }
}
