//! Syntax tree for folio script.

use rkyv::{Archive, Deserialize, Serialize};

use super::types::SourceSpan;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Archive, Serialize, Deserialize)]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Archive, Serialize, Deserialize)]
pub enum BinaryOp {
    Mul,
    Div,
    Rem,
    Add,
    Sub,
    Lt,
    LtEq,
    Gt,
    GtEq,
    Eq,
    NotEq,
}

/// Built-in functions callable from a cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Archive, Serialize, Deserialize)]
pub enum Builtin {
    Print,
    Eprint,
    Len,
    Str,
    Fail,
    Sleep,
    Exit,
    Native,
}

impl Builtin {
    pub const ALL: [Builtin; 8] = [
        Builtin::Print,
        Builtin::Eprint,
        Builtin::Len,
        Builtin::Str,
        Builtin::Fail,
        Builtin::Sleep,
        Builtin::Exit,
        Builtin::Native,
    ];

    pub fn lookup(name: &str) -> Option<Builtin> {
        Some(match name {
            "print" => Builtin::Print,
            "eprint" => Builtin::Eprint,
            "len" => Builtin::Len,
            "str" => Builtin::Str,
            "fail" => Builtin::Fail,
            "sleep" => Builtin::Sleep,
            "exit" => Builtin::Exit,
            "native" => Builtin::Native,
            _ => return None,
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Builtin::Print => "print",
            Builtin::Eprint => "eprint",
            Builtin::Len => "len",
            Builtin::Str => "str",
            Builtin::Fail => "fail",
            Builtin::Sleep => "sleep",
            Builtin::Exit => "exit",
            Builtin::Native => "native",
        }
    }

    /// Accepted argument count range, inclusive.
    pub fn arity(&self) -> (usize, usize) {
        match self {
            Builtin::Print | Builtin::Eprint => (0, 16),
            Builtin::Len | Builtin::Str | Builtin::Fail | Builtin::Sleep => (1, 1),
            Builtin::Exit => (0, 1),
            Builtin::Native => (2, 2),
        }
    }

    pub fn parameters(&self) -> &'static [&'static str] {
        match self {
            Builtin::Print | Builtin::Eprint => &["values..."],
            Builtin::Len => &["text"],
            Builtin::Str => &["value"],
            Builtin::Fail => &["message"],
            Builtin::Sleep => &["milliseconds"],
            Builtin::Exit => &["code"],
            Builtin::Native => &["library", "symbol"],
        }
    }

    /// `name(param, ...)`.
    pub fn signature(&self) -> String {
        format!("{}({})", self.name(), self.parameters().join(", "))
    }

    pub fn summary(&self) -> &'static str {
        match self {
            Builtin::Print => "Write the values, space separated, to standard output.",
            Builtin::Eprint => "Write the values, space separated, to standard error.",
            Builtin::Len => "Number of characters in a string.",
            Builtin::Str => "The value as printed text.",
            Builtin::Fail => "Raise a fault carrying the message.",
            Builtin::Sleep => "Pause the cell. Abort still interrupts it.",
            Builtin::Exit => "End the execution context with an exit code (default 0).",
            Builtin::Native => "Whether a loaded native library exports the symbol.",
        }
    }

    /// Builtins evaluated only for their effect; they never yield a result.
    pub fn is_void(&self) -> bool {
        matches!(
            self,
            Builtin::Print | Builtin::Eprint | Builtin::Fail | Builtin::Sleep | Builtin::Exit
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    Int(i64),
    Str(String),
    Bool(bool),
    Nil,
    Name(String),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Call {
        name: String,
        name_span: SourceSpan,
        args: Vec<Expr>,
    },
    Member {
        target: String,
        member: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
    pub kind: ExprKind,
    pub span: SourceSpan,
}

impl Expr {
    /// The builtin this expression calls directly, if any.
    pub fn called_builtin(&self) -> Option<Builtin> {
        match &self.kind {
            ExprKind::Call { name, .. } => Builtin::lookup(name),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Var {
        name: String,
        value: Expr,
        span: SourceSpan,
    },
    Assign {
        name: String,
        value: Expr,
        span: SourceSpan,
    },
    If {
        condition: Expr,
        then_body: Vec<Stmt>,
        else_body: Vec<Stmt>,
        span: SourceSpan,
    },
    While {
        condition: Expr,
        body: Vec<Stmt>,
        span: SourceSpan,
    },
    Expr(Expr),
}

impl Stmt {
    pub fn span(&self) -> SourceSpan {
        match self {
            Stmt::Var { span, .. }
            | Stmt::Assign { span, .. }
            | Stmt::If { span, .. }
            | Stmt::While { span, .. } => *span,
            Stmt::Expr(expr) => expr.span,
        }
    }
}
