use rustpython_parser::ast::{self, Ranged};
use rustpython_parser::Parse;

use super::{
    Expr, ExprKind, Generator, Keyword, LineIndex, Location, NodeId, ParseError, Stmt, StmtKind,
    SyntaxTree,
};

const SOURCE_PATH: &str = "<submitted>";

/// Parse submitted source into a [`SyntaxTree`].
pub fn parse(source: &str) -> Result<SyntaxTree, ParseError> {
    let index = LineIndex::new(source);
    let suite = ast::Suite::parse(source, SOURCE_PATH).map_err(|err| ParseError {
        message: err.error.to_string(),
        location: index.locate(usize::from(err.offset)),
    })?;
    let mut lowerer = Lowerer { index, next_id: 0 };
    let body = lowerer.stmts(&suite);
    log::debug!(
        "parsed {} top-level statements ({} expression nodes)",
        body.len(),
        lowerer.next_id
    );
    Ok(SyntaxTree { body })
}

struct Lowerer<'a> {
    index: LineIndex<'a>,
    next_id: u32,
}

impl Lowerer<'_> {
    fn stmts(&mut self, stmts: &[ast::Stmt]) -> Vec<Stmt> {
        stmts.iter().map(|stmt| self.stmt(stmt)).collect()
    }

    fn stmt(&mut self, stmt: &ast::Stmt) -> Stmt {
        let location = self.index.locate(usize::from(stmt.range().start()));
        let kind = match stmt {
            ast::Stmt::Import(ast::StmtImport { names, .. }) => StmtKind::Import {
                modules: names
                    .iter()
                    .map(|alias| alias.name.as_str().to_string())
                    .collect(),
            },
            ast::Stmt::ImportFrom(ast::StmtImportFrom {
                module,
                names,
                level,
                ..
            }) => StmtKind::ImportFrom {
                module: module.as_ref().map(|m| m.as_str().to_string()),
                level: level.as_ref().map_or(0, |level| level.to_u32()),
                names: names
                    .iter()
                    .map(|alias| alias.name.as_str().to_string())
                    .collect(),
            },
            ast::Stmt::FunctionDef(ast::StmtFunctionDef {
                name,
                args,
                body,
                decorator_list,
                returns,
                ..
            })
            | ast::Stmt::AsyncFunctionDef(ast::StmtAsyncFunctionDef {
                name,
                args,
                body,
                decorator_list,
                returns,
                ..
            }) => {
                let mut header = self.exprs(decorator_list);
                let params = self.arguments(args, &mut header);
                header.extend(returns.iter().map(|ret| self.expr(ret)));
                StmtKind::FunctionDef {
                    name: name.as_str().to_string(),
                    params,
                    header,
                    body: self.stmts(body),
                }
            }
            ast::Stmt::ClassDef(ast::StmtClassDef {
                name,
                bases,
                keywords,
                body,
                decorator_list,
                ..
            }) => {
                let mut header = self.exprs(decorator_list);
                header.extend(self.exprs(bases));
                header.extend(keywords.iter().map(|kw| self.expr(&kw.value)));
                StmtKind::ClassDef {
                    name: name.as_str().to_string(),
                    header,
                    body: self.stmts(body),
                }
            }
            ast::Stmt::Assign(ast::StmtAssign { targets, value, .. }) => StmtKind::Assign {
                targets: self.exprs(targets),
                value: self.expr(value),
            },
            ast::Stmt::AugAssign(ast::StmtAugAssign { target, value, .. }) => StmtKind::Assign {
                targets: vec![self.expr(target)],
                value: self.expr(value),
            },
            ast::Stmt::AnnAssign(ast::StmtAnnAssign {
                target,
                annotation,
                value,
                ..
            }) => match value {
                Some(value) => StmtKind::Assign {
                    targets: vec![self.expr(target), self.expr(annotation)],
                    value: self.expr(value),
                },
                None => StmtKind::Block {
                    exprs: vec![self.expr(target), self.expr(annotation)],
                    bodies: Vec::new(),
                },
            },
            ast::Stmt::For(ast::StmtFor {
                target,
                iter,
                body,
                orelse,
                ..
            })
            | ast::Stmt::AsyncFor(ast::StmtAsyncFor {
                target,
                iter,
                body,
                orelse,
                ..
            }) => StmtKind::For {
                target: self.expr(target),
                iter: self.expr(iter),
                body: self.stmts(body),
                orelse: self.stmts(orelse),
            },
            ast::Stmt::While(ast::StmtWhile {
                test, body, orelse, ..
            })
            | ast::Stmt::If(ast::StmtIf {
                test, body, orelse, ..
            }) => StmtKind::Block {
                exprs: vec![self.expr(test)],
                bodies: vec![self.stmts(body), self.stmts(orelse)],
            },
            ast::Stmt::With(ast::StmtWith { items, body, .. })
            | ast::Stmt::AsyncWith(ast::StmtAsyncWith { items, body, .. }) => {
                let mut exprs = Vec::new();
                for item in items {
                    exprs.push(self.expr(&item.context_expr));
                    exprs.extend(item.optional_vars.iter().map(|var| self.expr(var)));
                }
                StmtKind::Block {
                    exprs,
                    bodies: vec![self.stmts(body)],
                }
            }
            ast::Stmt::Match(ast::StmtMatch { subject, cases, .. }) => {
                let mut exprs = vec![self.expr(subject)];
                let mut bodies = Vec::new();
                for case in cases {
                    self.pattern(&case.pattern, &mut exprs);
                    exprs.extend(case.guard.iter().map(|guard| self.expr(guard)));
                    bodies.push(self.stmts(&case.body));
                }
                StmtKind::Block { exprs, bodies }
            }
            ast::Stmt::Try(ast::StmtTry {
                body,
                handlers,
                orelse,
                finalbody,
                ..
            })
            | ast::Stmt::TryStar(ast::StmtTryStar {
                body,
                handlers,
                orelse,
                finalbody,
                ..
            }) => {
                let mut exprs = Vec::new();
                let mut bodies = vec![self.stmts(body)];
                for handler in handlers {
                    let ast::ExceptHandler::ExceptHandler(handler) = handler;
                    exprs.extend(handler.type_.iter().map(|ty| self.expr(ty)));
                    bodies.push(self.stmts(&handler.body));
                }
                bodies.push(self.stmts(orelse));
                bodies.push(self.stmts(finalbody));
                StmtKind::Block { exprs, bodies }
            }
            ast::Stmt::Return(ast::StmtReturn { value, .. }) => StmtKind::Block {
                exprs: value.iter().map(|value| self.expr(value)).collect(),
                bodies: Vec::new(),
            },
            ast::Stmt::Delete(ast::StmtDelete { targets, .. }) => StmtKind::Block {
                exprs: self.exprs(targets),
                bodies: Vec::new(),
            },
            ast::Stmt::Raise(ast::StmtRaise { exc, cause, .. }) => StmtKind::Block {
                exprs: exc
                    .iter()
                    .chain(cause.iter())
                    .map(|expr| self.expr(expr))
                    .collect(),
                bodies: Vec::new(),
            },
            ast::Stmt::Assert(ast::StmtAssert { test, msg, .. }) => {
                let mut exprs = vec![self.expr(test)];
                exprs.extend(msg.iter().map(|msg| self.expr(msg)));
                StmtKind::Block {
                    exprs,
                    bodies: Vec::new(),
                }
            }
            ast::Stmt::Expr(ast::StmtExpr { value, .. }) => StmtKind::Block {
                exprs: vec![self.expr(value)],
                bodies: Vec::new(),
            },
            ast::Stmt::Global(ast::StmtGlobal { names, .. })
            | ast::Stmt::Nonlocal(ast::StmtNonlocal { names, .. }) => StmtKind::Declare {
                names: names.iter().map(|name| name.as_str().to_string()).collect(),
            },
            ast::Stmt::Pass(_)
            | ast::Stmt::Break(_)
            | ast::Stmt::Continue(_) => StmtKind::Block {
                exprs: Vec::new(),
                bodies: Vec::new(),
            },
            #[allow(unreachable_patterns)]
            _ => StmtKind::Unsupported,
        };
        Stmt { kind, location }
    }

    fn arguments(&mut self, args: &ast::Arguments, header: &mut Vec<Expr>) -> Vec<String> {
        let mut params = Vec::new();
        for arg in args
            .posonlyargs
            .iter()
            .chain(args.args.iter())
            .chain(args.kwonlyargs.iter())
        {
            params.push(arg.def.arg.as_str().to_string());
            header.extend(arg.def.annotation.iter().map(|ann| self.expr(ann)));
            header.extend(arg.default.iter().map(|default| self.expr(default)));
        }
        if let Some(vararg) = &args.vararg {
            params.push(format!("*{}", vararg.arg.as_str()));
            header.extend(vararg.annotation.iter().map(|ann| self.expr(ann)));
        }
        if let Some(kwarg) = &args.kwarg {
            params.push(format!("**{}", kwarg.arg.as_str()));
            header.extend(kwarg.annotation.iter().map(|ann| self.expr(ann)));
        }
        params
    }

    /// Case patterns look things up on the subject: mapping keys are
    /// subscripts and class keywords are attribute reads. Both are lowered
    /// onto an opaque placeholder base so the validator sees the lookup.
    fn pattern(&mut self, pattern: &ast::Pattern, out: &mut Vec<Expr>) {
        match pattern {
            ast::Pattern::MatchValue(ast::PatternMatchValue { value, .. }) => {
                out.push(self.expr(value))
            }
            ast::Pattern::MatchSingleton(_) | ast::Pattern::MatchStar(_) => {}
            ast::Pattern::MatchSequence(ast::PatternMatchSequence { patterns, .. })
            | ast::Pattern::MatchOr(ast::PatternMatchOr { patterns, .. }) => {
                for inner in patterns {
                    self.pattern(inner, out);
                }
            }
            ast::Pattern::MatchMapping(ast::PatternMatchMapping { keys, patterns, .. }) => {
                for key in keys {
                    let index = self.boxed(key);
                    let location = index.location;
                    let value = Box::new(self.node(ExprKind::Other(Vec::new()), location));
                    out.push(self.node(ExprKind::Subscript { value, index }, location));
                }
                for inner in patterns {
                    self.pattern(inner, out);
                }
            }
            ast::Pattern::MatchClass(ast::PatternMatchClass {
                cls,
                patterns,
                kwd_attrs,
                kwd_patterns,
                ..
            }) => {
                let cls = self.expr(cls);
                let location = cls.location;
                out.push(cls);
                for attr in kwd_attrs {
                    let value = Box::new(self.node(ExprKind::Other(Vec::new()), location));
                    out.push(self.node(
                        ExprKind::Attribute {
                            value,
                            attr: attr.as_str().to_string(),
                        },
                        location,
                    ));
                }
                for inner in patterns.iter().chain(kwd_patterns.iter()) {
                    self.pattern(inner, out);
                }
            }
            ast::Pattern::MatchAs(ast::PatternMatchAs { pattern: inner, .. }) => {
                if let Some(inner) = inner {
                    self.pattern(inner, out);
                }
            }
        }
    }

    fn fresh_id(&mut self) -> NodeId {
        let id = NodeId(self.next_id);
        self.next_id += 1;
        id
    }

    /// Node with no counterpart in the source text.
    fn node(&mut self, kind: ExprKind, location: Location) -> Expr {
        Expr {
            id: self.fresh_id(),
            kind,
            location,
        }
    }

    fn exprs(&mut self, exprs: &[ast::Expr]) -> Vec<Expr> {
        exprs.iter().map(|expr| self.expr(expr)).collect()
    }

    fn boxed(&mut self, expr: &ast::Expr) -> Box<Expr> {
        Box::new(self.expr(expr))
    }

    fn expr(&mut self, expr: &ast::Expr) -> Expr {
        let location = self.index.locate(usize::from(expr.range().start()));
        let id = self.fresh_id();
        let kind = match expr {
            ast::Expr::Name(ast::ExprName { id, .. }) => ExprKind::Name(id.as_str().to_string()),
            ast::Expr::Attribute(ast::ExprAttribute { value, attr, .. }) => ExprKind::Attribute {
                value: self.boxed(value),
                attr: attr.as_str().to_string(),
            },
            ast::Expr::Subscript(ast::ExprSubscript { value, slice, .. }) => ExprKind::Subscript {
                value: self.boxed(value),
                index: self.boxed(slice),
            },
            ast::Expr::Call(ast::ExprCall {
                func,
                args,
                keywords,
                ..
            }) => ExprKind::Call {
                func: self.boxed(func),
                args: self.exprs(args),
                keywords: keywords
                    .iter()
                    .map(|kw| Keyword {
                        name: kw.arg.as_ref().map(|arg| arg.as_str().to_string()),
                        value: self.expr(&kw.value),
                    })
                    .collect(),
            },
            ast::Expr::List(ast::ExprList { elts, .. }) => ExprKind::List(self.exprs(elts)),
            ast::Expr::Tuple(ast::ExprTuple { elts, .. }) => ExprKind::Tuple(self.exprs(elts)),
            ast::Expr::Set(ast::ExprSet { elts, .. }) => ExprKind::Set(self.exprs(elts)),
            ast::Expr::Dict(ast::ExprDict { keys, values, .. }) => ExprKind::Dict(
                keys.iter()
                    .zip(values.iter())
                    .map(|(key, value)| {
                        let key = key.as_ref().map(|key| self.expr(key));
                        (key, self.expr(value))
                    })
                    .collect(),
            ),
            ast::Expr::Constant(ast::ExprConstant { value, .. }) => match value {
                ast::Constant::Str(text) => ExprKind::Str(text.clone()),
                ast::Constant::Int(int) => int
                    .to_string()
                    .parse()
                    .map(ExprKind::Int)
                    .unwrap_or(ExprKind::Constant),
                _ => ExprKind::Constant,
            },
            ast::Expr::UnaryOp(ast::ExprUnaryOp { op, operand, .. }) => {
                let operand = self.expr(operand);
                match (op, &operand.kind) {
                    (ast::UnaryOp::USub, ExprKind::Int(value)) => ExprKind::Int(-value),
                    _ => ExprKind::Other(vec![operand]),
                }
            }
            ast::Expr::BinOp(ast::ExprBinOp {
                left, op, right, ..
            }) => {
                if matches!(op, ast::Operator::Add) {
                    ExprKind::Concat(self.boxed(left), self.boxed(right))
                } else {
                    ExprKind::Other(vec![self.expr(left), self.expr(right)])
                }
            }
            ast::Expr::BoolOp(ast::ExprBoolOp { values, .. }) => {
                let values = self.exprs(values);
                ExprKind::Branch {
                    tests: Vec::new(),
                    values,
                }
            }
            ast::Expr::IfExp(ast::ExprIfExp {
                test, body, orelse, ..
            }) => ExprKind::Branch {
                tests: vec![self.expr(test)],
                values: vec![self.expr(body), self.expr(orelse)],
            },
            ast::Expr::NamedExpr(ast::ExprNamedExpr { target, value, .. }) => ExprKind::Branch {
                tests: vec![self.expr(target)],
                values: vec![self.expr(value)],
            },
            ast::Expr::ListComp(ast::ExprListComp {
                elt, generators, ..
            })
            | ast::Expr::SetComp(ast::ExprSetComp {
                elt, generators, ..
            })
            | ast::Expr::GeneratorExp(ast::ExprGeneratorExp {
                elt, generators, ..
            }) => ExprKind::Comprehension {
                elements: vec![self.expr(elt)],
                generators: self.generators(generators),
            },
            ast::Expr::DictComp(ast::ExprDictComp {
                key,
                value,
                generators,
                ..
            }) => ExprKind::Comprehension {
                elements: vec![self.expr(key), self.expr(value)],
                generators: self.generators(generators),
            },
            ast::Expr::Lambda(ast::ExprLambda { args, body, .. }) => {
                let mut header = Vec::new();
                let params = self.arguments(args, &mut header);
                ExprKind::Lambda {
                    params,
                    header,
                    body: self.boxed(body),
                }
            }
            ast::Expr::Compare(ast::ExprCompare {
                left, comparators, ..
            }) => {
                let mut children = vec![self.expr(left)];
                children.extend(self.exprs(comparators));
                ExprKind::Other(children)
            }
            ast::Expr::Await(ast::ExprAwait { value, .. })
            | ast::Expr::YieldFrom(ast::ExprYieldFrom { value, .. })
            | ast::Expr::Starred(ast::ExprStarred { value, .. }) => {
                ExprKind::Other(vec![self.expr(value)])
            }
            ast::Expr::Yield(ast::ExprYield { value, .. }) => {
                ExprKind::Other(value.iter().map(|value| self.expr(value)).collect())
            }
            ast::Expr::FormattedValue(ast::ExprFormattedValue {
                value, format_spec, ..
            }) => {
                let mut children = vec![self.expr(value)];
                children.extend(format_spec.iter().map(|spec| self.expr(spec)));
                ExprKind::Other(children)
            }
            ast::Expr::JoinedStr(ast::ExprJoinedStr { values, .. }) => {
                ExprKind::Other(self.exprs(values))
            }
            ast::Expr::Slice(ast::ExprSlice {
                lower, upper, step, ..
            }) => ExprKind::Other(
                lower
                    .iter()
                    .chain(upper.iter())
                    .chain(step.iter())
                    .map(|part| self.expr(part))
                    .collect(),
            ),
        };
        Expr { id, kind, location }
    }

    fn generators(&mut self, generators: &[ast::Comprehension]) -> Vec<Generator> {
        generators
            .iter()
            .map(|generator| Generator {
                target: self.expr(&generator.target),
                iter: self.expr(&generator.iter),
                conditions: self.exprs(&generator.ifs),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::syntax::Location;

    #[test]
    fn lowers_imports_with_dotted_paths() {
        let tree = parse("import os.path, math\nfrom a.b import c, d\n").expect("parse");
        match &tree.body[0].kind {
            StmtKind::Import { modules } => assert_eq!(modules, &["os.path", "math"]),
            other => panic!("unexpected statement {:?}", other),
        }
        match &tree.body[1].kind {
            StmtKind::ImportFrom {
                module,
                level,
                names,
            } => {
                assert_eq!(module.as_deref(), Some("a.b"));
                assert_eq!(*level, 0);
                assert_eq!(names, &["c", "d"]);
            }
            other => panic!("unexpected statement {:?}", other),
        }
        assert_eq!(tree.body[1].location, Location { line: 2, column: 1 });
    }

    #[test]
    fn relative_import_records_level() {
        let tree = parse("from ..pkg import thing\n").expect("parse");
        match &tree.body[0].kind {
            StmtKind::ImportFrom { module, level, .. } => {
                assert_eq!(module.as_deref(), Some("pkg"));
                assert_eq!(*level, 2);
            }
            other => panic!("unexpected statement {:?}", other),
        }
    }

    #[test]
    fn function_params_include_star_args() {
        let tree = parse("def f(a, b=1, *rest, key, **extra):\n    return a\n").expect("parse");
        match &tree.body[0].kind {
            StmtKind::FunctionDef { name, params, .. } => {
                assert_eq!(name, "f");
                assert_eq!(params, &["a", "b", "key", "*rest", "**extra"]);
            }
            other => panic!("unexpected statement {:?}", other),
        }
    }

    #[test]
    fn negative_index_folds_to_int() {
        let tree = parse("x[-1]\n").expect("parse");
        let StmtKind::Block { exprs, .. } = &tree.body[0].kind else {
            panic!("expected expression statement");
        };
        let ExprKind::Subscript { index, .. } = &exprs[0].kind else {
            panic!("expected subscript");
        };
        assert!(matches!(index.kind, ExprKind::Int(-1)));
    }

    #[test]
    fn scope_declarations_keep_their_names() {
        let tree = parse("def f():\n    global a, b\n").expect("parse");
        let StmtKind::FunctionDef { body, .. } = &tree.body[0].kind else {
            panic!("expected function");
        };
        match &body[0].kind {
            StmtKind::Declare { names } => assert_eq!(names, &["a", "b"]),
            other => panic!("unexpected statement {:?}", other),
        }
    }

    #[test]
    fn case_patterns_lower_to_lookups() {
        let source = "match x:\n    case {'k': v}:\n        pass\n    case P(attr=w):\n        pass\n";
        let tree = parse(source).expect("parse");
        let StmtKind::Block { exprs, .. } = &tree.body[0].kind else {
            panic!("expected match block");
        };
        assert!(exprs.iter().any(|expr| matches!(
            &expr.kind,
            ExprKind::Subscript { index, .. } if matches!(&index.kind, ExprKind::Str(key) if key == "k")
        )));
        assert!(exprs.iter().any(|expr| matches!(
            &expr.kind,
            ExprKind::Attribute { attr, .. } if attr == "attr"
        )));
    }

    #[test]
    fn syntax_error_reports_location() {
        let err = parse("def broken(:\n    pass\n").expect_err("should fail");
        assert_eq!(err.location.line, 1);
        assert!(!err.message.is_empty());
    }
}
