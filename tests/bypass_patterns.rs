//! Static validator coverage: every documented route to a forbidden
//! operation, the import rule, and the legitimate surface that must stay
//! open.

use admission_gate::{
    parse, validate, PolicySet, ReferencePattern, ValidationVerdict, Violation, ViolationKind,
};

fn check(source: &str) -> ValidationVerdict {
    let tree = parse(source).expect("source parses");
    validate(&tree, &PolicySet::default())
}

fn operation_violations(source: &str) -> Vec<Violation> {
    check(source)
        .violations()
        .iter()
        .filter(|v| v.kind == ViolationKind::Operation)
        .cloned()
        .collect()
}

fn assert_rejected_with(source: &str, target: &str, pattern: ReferencePattern) {
    let violations = operation_violations(source);
    assert!(
        violations
            .iter()
            .any(|v| v.target == target && v.pattern == Some(pattern)),
        "expected {target} via {pattern:?} for {source:?}, got {violations:?}"
    );
}

#[test]
fn direct_call_is_rejected() {
    let verdict = check("eval('1+1')\n");
    let violations = verdict.violations();
    assert_eq!(violations.len(), 1);
    assert_eq!(violations[0].kind, ViolationKind::Operation);
    assert_eq!(violations[0].target, "eval");
    assert_eq!(violations[0].pattern, Some(ReferencePattern::DirectCall));
    assert_eq!(violations[0].location.line, 1);
    assert_eq!(violations[0].location.column, 1);
}

#[test]
fn container_indirection_is_rejected() {
    assert_rejected_with(
        "[eval][0]('1+1')\n",
        "eval",
        ReferencePattern::ContainerIndirection,
    );
    assert_rejected_with(
        "(exec,)[0]('x = 1')\n",
        "exec",
        ReferencePattern::ContainerIndirection,
    );
    assert_rejected_with(
        "(f,) = (eval,)\nf('1')\n",
        "eval",
        ReferencePattern::ContainerIndirection,
    );
    assert_rejected_with(
        "for f in [print, eval]:\n    f('1')\n",
        "eval",
        ReferencePattern::ContainerIndirection,
    );
    assert_rejected_with(
        "[g for g in [compile]][0]('x', 'y', 'exec')\n",
        "compile",
        ReferencePattern::ContainerIndirection,
    );
    assert_rejected_with(
        "next(iter([eval]))('1')\n",
        "eval",
        ReferencePattern::ContainerIndirection,
    );
}

#[test]
fn subscript_access_is_rejected() {
    assert_rejected_with(
        "{\"f\": eval}[\"f\"](\"1+1\")\n",
        "eval",
        ReferencePattern::SubscriptAccess,
    );
    assert_rejected_with(
        "__builtins__['ev' + 'al']('1')\n",
        "eval",
        ReferencePattern::SubscriptAccess,
    );
    assert_rejected_with(
        "{'run': exec}.get('run')('x')\n",
        "exec",
        ReferencePattern::SubscriptAccess,
    );
}

#[test]
fn attribute_chain_is_rejected_at_any_depth() {
    assert_rejected_with(
        "import math\nmath.__loader__.load_module('os')\n",
        "__loader__",
        ReferencePattern::AttributeAccess,
    );
    assert_rejected_with(
        "a.b.c.d.system('ls')\n",
        "system",
        ReferencePattern::AttributeAccess,
    );
    assert_rejected_with(
        "eval.__call__('1')\n",
        "eval",
        ReferencePattern::AttributeAccess,
    );
    assert_rejected_with(
        "f = (lambda: 0).__globals__\n",
        "__globals__",
        ReferencePattern::AttributeAccess,
    );
    assert_rejected_with(
        "().__class__.__base__.__subclasses__()\n",
        "__subclasses__",
        ReferencePattern::AttributeAccess,
    );
}

#[test]
fn computed_names_are_rejected() {
    assert_rejected_with(
        "getattr(__builtins__, 'ev' + 'al')('1')\n",
        "eval",
        ReferencePattern::ComputedName,
    );
    assert_rejected_with(
        "import operator\nrun = operator.attrgetter('system')\n",
        "system",
        ReferencePattern::ComputedName,
    );
    assert_rejected_with(
        "getattr(thing, name)('payload')\n",
        "<dynamic>",
        ReferencePattern::ComputedName,
    );
    assert_rejected_with(
        "registry.get('exec')('x')\n",
        "exec",
        ReferencePattern::ComputedName,
    );
}

#[test]
fn forbidden_names_passed_as_values_are_rejected() {
    assert_rejected_with("f = eval\n", "eval", ReferencePattern::AliasReference);
    assert_rejected_with(
        "results = list(map(eval, ['1', '2']))\n",
        "eval",
        ReferencePattern::AliasReference,
    );
    assert_rejected_with(
        "table = {'run': exec}\ntable.get('run')('x')\n",
        "exec",
        ReferencePattern::AliasReference,
    );
    assert_rejected_with(
        "pick = open if flag else print\n",
        "open",
        ReferencePattern::AliasReference,
    );
}

#[test]
fn scope_declarations_never_shadow_builtins() {
    let source = "\
def f():
    global eval
    g = eval
    eval = None
    return g
f()('1+1')
";
    assert_rejected_with(source, "eval", ReferencePattern::AliasReference);

    let source = "\
def outer():
    exec = print
    def inner():
        nonlocal exec
        exec = len
        return exec
    return inner
";
    assert!(check(source).is_accepted());
}

#[test]
fn match_patterns_are_lookups() {
    assert_rejected_with(
        "match print.__self__.__dict__:\n    case {'eval': f}:\n        f('1+1')\n",
        "eval",
        ReferencePattern::SubscriptAccess,
    );
    assert_rejected_with(
        "match print.__self__:\n    case object(eval=f):\n        f('1+1')\n",
        "eval",
        ReferencePattern::AttributeAccess,
    );
    assert_rejected_with(
        "match cmd:\n    case builtins.open:\n        pass\n",
        "open",
        ReferencePattern::AttributeAccess,
    );

    let source = "\
match point:
    case {'x': x, 'y': y}:
        total = x + y
    case Point(x=0, y=y):
        total = y
    case [first, *rest]:
        total = first
    case _:
        total = 0
";
    assert!(check(source).is_accepted(), "{:?}", check(source).violations());
}

#[test]
fn method_form_subscripts_are_rejected() {
    assert_rejected_with(
        "print.__self__.__dict__.__getitem__('eval')('1+1')\n",
        "eval",
        ReferencePattern::SubscriptAccess,
    );
    assert_rejected_with(
        "dict.get(print.__self__.__dict__, 'eval')('1+1')\n",
        "eval",
        ReferencePattern::ComputedName,
    );
    assert_rejected_with(
        "import operator\nrun = operator.itemgetter('exec')(print.__self__.__dict__)\n",
        "exec",
        ReferencePattern::SubscriptAccess,
    );
    assert_rejected_with(
        "table = print.__self__.__dict__\nrun = table.__getitem__('eval')\n",
        "eval",
        ReferencePattern::SubscriptAccess,
    );
    assert!(check("row = {'a': 1}\nvalue = row.get('a', 0)\n").is_accepted());
}

#[test]
fn disallowed_imports_report_root_violations() {
    for source in ["import os\n", "from os import path\n"] {
        let verdict = check(source);
        let violations = verdict.violations();
        assert_eq!(violations.len(), 1, "{source:?}");
        assert_eq!(violations[0].kind, ViolationKind::Import);
        assert_eq!(violations[0].target, "os");
        assert_eq!(violations[0].pattern, None);
    }
}

#[test]
fn submodule_of_blocked_root_is_rejected() {
    for source in [
        "import os.path\n",
        "from os.path import join\n",
        "import xml.etree.ElementTree as ET\n",
        "import math, subprocess\n",
    ] {
        let verdict = check(source);
        assert!(
            verdict
                .violations()
                .iter()
                .any(|v| v.kind == ViolationKind::Import),
            "{source:?} should be rejected"
        );
    }
}

#[test]
fn nested_imports_are_checked() {
    let verdict = check("def f():\n    import socket\n    return socket\n");
    assert_eq!(verdict.violations().len(), 1);
    assert_eq!(verdict.violations()[0].target, "socket");
}

#[test]
fn legitimate_source_is_accepted() {
    assert!(check("import math; len([1,2,3])\n").is_accepted());
    let source = "\
from collections import defaultdict
from typing import List
import itertools
import re

PATTERN = re.escape('a.b')

def bucket(values: List[int], width: int = 10) -> dict:
    groups = defaultdict(list)
    for value in values:
        if value < 0:
            raise ValueError('negative')
        groups[value // width].append(value)
    return {k: sorted(v) for k, v in groups.items()}

class Counter:
    def __init__(self, start=0):
        self.count = start

    def bump(self, by=1):
        self.count += by
        return getattr(self, 'count')

pairs = list(itertools.combinations(range(4), 2))
total = sum(x * y for x, y in pairs)
message = 'never call eval or open here'
";
    let verdict = check(source);
    assert!(verdict.is_accepted(), "{:?}", verdict.violations());
}

#[test]
fn all_violations_are_collected() {
    let source = "\
import os
eval('1')
[exec][0]('x')
import socket
";
    let verdict = check(source);
    let summary: Vec<(ViolationKind, &str)> = verdict
        .violations()
        .iter()
        .map(|v| (v.kind, v.target.as_str()))
        .collect();
    assert_eq!(
        summary,
        vec![
            (ViolationKind::Import, "os"),
            (ViolationKind::Operation, "eval"),
            (ViolationKind::Operation, "exec"),
            (ViolationKind::Import, "socket"),
        ]
    );
}

#[test]
fn validation_is_idempotent() {
    let tree = parse("import os\nx = [eval][0]\ngetattr(a, b)()\n").expect("parse");
    let policy = PolicySet::default();
    let first = validate(&tree, &policy);
    let second = validate(&tree, &policy);
    assert_eq!(first, second);
    assert!(!first.is_accepted());
}

#[test]
fn custom_policy_changes_the_verdict() {
    let policy = PolicySet::new(["json"], ["print"]).expect("policy");
    let tree = parse("import json\nprint(json.dumps({}))\n").expect("parse");
    let verdict = validate(&tree, &policy);
    assert_eq!(verdict.violations().len(), 1);
    assert_eq!(verdict.violations()[0].target, "print");

    let tree = parse("eval('1')\n").expect("parse");
    assert!(validate(&tree, &policy).is_accepted());
}

#[test]
fn parse_errors_are_not_violations() {
    let err = parse("def broken(:\n    pass\n").expect_err("syntax error");
    assert_eq!(err.location.line, 1);
    assert!(!err.message.is_empty());
}
