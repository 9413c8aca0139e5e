//! Syntax tree of a build script

/// A statement: a call, an assignment or a bare value
#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Expr(Expr),
    Assign { name: String, value: Expr, line: usize },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Nil,
    Bool(bool),
    Int(i64),
    Str(Vec<Segment>),
    Array(Vec<Expr>),
    Hash(Vec<(Expr, Expr)>),
    Call(Call),
}

/// Piece of a string literal after parsing interpolations
#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    Lit(String),
    Interp(Box<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub name: String,
    /// Positional arguments; trailing `key: value` pairs are folded into a
    /// final hash argument
    pub args: Vec<Expr>,
    pub block: Option<Vec<Stmt>>,
    /// Written without arguments, parentheses or block; may name a local
    pub bare: bool,
    pub line: usize,
}

impl Expr {
    pub fn string(s: impl Into<String>) -> Self {
        Expr::Str(vec![Segment::Lit(s.into())])
    }
}
