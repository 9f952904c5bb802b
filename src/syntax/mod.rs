//! Syntax tree consumed by the validator and the namespace loader.
//!
//! Parsing is delegated to `rustpython-parser`; its AST is lowered once into
//! the closed node set below. Only the shapes the gate reasons about get their
//! own variant; everything else keeps its children so traversal stays total.

use serde::Serialize;

mod lower;

pub use lower::parse;

/// 1-based source position. Columns count characters, not bytes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Location {
    pub line: usize,
    pub column: usize,
}

impl std::fmt::Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

/// Identity of an expression node within one tree.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NodeId(pub u32);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParseError {
    pub message: String,
    pub location: Location,
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} at {}", self.message, self.location)
    }
}

impl std::error::Error for ParseError {}

#[derive(Clone, Debug)]
pub struct SyntaxTree {
    pub body: Vec<Stmt>,
}

#[derive(Clone, Debug)]
pub struct Stmt {
    pub kind: StmtKind,
    pub location: Location,
}

#[derive(Clone, Debug)]
pub enum StmtKind {
    /// `import a.b, c`: one dotted path per alias.
    Import { modules: Vec<String> },
    /// `from a.b import c`; `level` counts leading dots.
    ImportFrom {
        module: Option<String>,
        level: u32,
        names: Vec<String>,
    },
    FunctionDef {
        name: String,
        params: Vec<String>,
        /// Decorators, defaults, annotations and the return annotation.
        header: Vec<Expr>,
        body: Vec<Stmt>,
    },
    ClassDef {
        name: String,
        header: Vec<Expr>,
        body: Vec<Stmt>,
    },
    Assign {
        targets: Vec<Expr>,
        value: Expr,
    },
    For {
        target: Expr,
        iter: Expr,
        body: Vec<Stmt>,
        orelse: Vec<Stmt>,
    },
    /// Any other statement: its expressions followed by its nested bodies.
    Block {
        exprs: Vec<Expr>,
        bodies: Vec<Vec<Stmt>>,
    },
    /// `global` / `nonlocal`: names that never bind in the local scope.
    Declare { names: Vec<String> },
    /// Statement forms the lowering does not model. Rejected by the validator.
    Unsupported,
}

#[derive(Clone, Debug)]
pub struct Expr {
    pub id: NodeId,
    pub kind: ExprKind,
    pub location: Location,
}

#[derive(Clone, Debug)]
pub enum ExprKind {
    Name(String),
    Attribute {
        value: Box<Expr>,
        attr: String,
    },
    Subscript {
        value: Box<Expr>,
        index: Box<Expr>,
    },
    Call {
        func: Box<Expr>,
        args: Vec<Expr>,
        keywords: Vec<Keyword>,
    },
    List(Vec<Expr>),
    Tuple(Vec<Expr>),
    Set(Vec<Expr>),
    /// `None` keys are `**mapping` splats.
    Dict(Vec<(Option<Expr>, Expr)>),
    Str(String),
    Int(i64),
    Constant,
    Comprehension {
        elements: Vec<Expr>,
        generators: Vec<Generator>,
    },
    Lambda {
        params: Vec<String>,
        header: Vec<Expr>,
        body: Box<Expr>,
    },
    /// Conditional forms: `tests` are evaluated, `values` may become the result.
    Branch {
        tests: Vec<Expr>,
        values: Vec<Expr>,
    },
    /// Binary `+`, kept apart so string names can be folded.
    Concat(Box<Expr>, Box<Expr>),
    Other(Vec<Expr>),
}

#[derive(Clone, Debug)]
pub struct Keyword {
    pub name: Option<String>,
    pub value: Expr,
}

#[derive(Clone, Debug)]
pub struct Generator {
    pub target: Expr,
    pub iter: Expr,
    pub conditions: Vec<Expr>,
}

impl Expr {
    pub fn as_name(&self) -> Option<&str> {
        match &self.kind {
            ExprKind::Name(name) => Some(name),
            _ => None,
        }
    }

    /// Literal sequence elements for list, tuple and set displays.
    pub fn sequence_elements(&self) -> Option<&[Expr]> {
        match &self.kind {
            ExprKind::List(elts) | ExprKind::Tuple(elts) | ExprKind::Set(elts) => Some(elts),
            _ => None,
        }
    }

    pub fn is_literal_container(&self) -> bool {
        self.sequence_elements().is_some() || matches!(self.kind, ExprKind::Dict(_))
    }
}

/// Maps byte offsets reported by the parser to line/column pairs.
pub(crate) struct LineIndex<'a> {
    source: &'a str,
    line_starts: Vec<usize>,
}

impl<'a> LineIndex<'a> {
    pub(crate) fn new(source: &'a str) -> Self {
        let mut line_starts = vec![0];
        line_starts.extend(
            source
                .bytes()
                .enumerate()
                .filter(|(_, b)| *b == b'\n')
                .map(|(idx, _)| idx + 1),
        );
        Self {
            source,
            line_starts,
        }
    }

    pub(crate) fn locate(&self, offset: usize) -> Location {
        let offset = offset.min(self.source.len());
        let line = self.line_starts.partition_point(|start| *start <= offset);
        let line_start = self.line_starts[line.saturating_sub(1)];
        let column = self
            .source
            .get(line_start..offset)
            .map(|prefix| prefix.chars().count())
            .unwrap_or(0);
        Location {
            line,
            column: column + 1,
        }
    }
}
