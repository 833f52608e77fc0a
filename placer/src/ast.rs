// AST node types for `.pgd` graph descriptions.
//
// Every node carries a `SimpleSpan` for error reporting in the builder and
// in placement diagnostics.
//
// Preconditions: produced by the parser from a valid or partially-valid token stream.
// Postconditions: each node's span covers the source range of the construct.
// Failure modes: none (data-only module).
// Side effects: none.

use chumsky::span::SimpleSpan;

use crate::graph::FrameKind;

/// Byte-offset span (alias for chumsky's `SimpleSpan`).
pub type Span = SimpleSpan;

// ── Root ──

/// A complete graph description: a sequence of statements.
#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    pub statements: Vec<Statement>,
    pub span: Span,
}

// ── Statements ──

#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub kind: StatementKind,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StatementKind {
    Set(SetStmt),
    Node(NodeStmt),
    Frame(FrameStmt),
    DeviceScope(DeviceScope),
    ColocateScope(ColocateScope),
    Colocate(ColocateStmt),
    Return(ReturnStmt),
}

// ── set_stmt: 'set' IDENT '=' STRING ──

#[derive(Debug, Clone, PartialEq)]
pub struct SetStmt {
    pub name: Ident,
    pub value: StringLit,
}

// ── node_stmt: IDENT '=' IDENT '(' args? ')' ('@' STRING)? ──

#[derive(Debug, Clone, PartialEq)]
pub struct NodeStmt {
    pub name: Ident,
    pub op: Ident,
    pub inputs: Vec<Ident>,
    pub device: Option<StringLit>,
}

// ── frame_stmt: IDENT '=' ('if'|'while') '(' args? ')' capture? device? '{' branch* '}' ──

#[derive(Debug, Clone, PartialEq)]
pub struct FrameStmt {
    pub name: Ident,
    pub kind: FrameKind,
    pub inputs: Vec<Ident>,
    pub captures: Vec<Ident>,
    pub device: Option<StringLit>,
    pub branches: Vec<Branch>,
}

/// `branch IDENT '(' params? ')' '{' statements '}'`
#[derive(Debug, Clone, PartialEq)]
pub struct Branch {
    pub name: Ident,
    pub params: Vec<Ident>,
    pub body: Vec<Statement>,
    pub span: Span,
}

// ── Scopes ──

/// `device STRING { statements }`
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceScope {
    pub device: StringLit,
    pub body: Vec<Statement>,
}

/// `colocate_with IDENT { statements }`
#[derive(Debug, Clone, PartialEq)]
pub struct ColocateScope {
    pub target: Ident,
    pub body: Vec<Statement>,
}

/// `colocate IDENT (',' IDENT)+`
#[derive(Debug, Clone, PartialEq)]
pub struct ColocateStmt {
    pub nodes: Vec<Ident>,
}

/// `return IDENT (',' IDENT)*`
#[derive(Debug, Clone, PartialEq)]
pub struct ReturnStmt {
    pub values: Vec<Ident>,
}

// ── Leaves ──

/// An identifier with its source text and span.
#[derive(Debug, Clone, PartialEq)]
pub struct Ident {
    pub name: String,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StringLit {
    pub value: String,
    pub span: Span,
}
