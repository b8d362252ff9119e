use crate::span::Span;
use crate::token::AssignOp;

#[derive(Clone, Debug, Default)]
pub struct Program {
    /// Source names indexed by `Span::file`.
    pub files: Vec<String>,
    pub decls: Vec<Decl>,
}

#[derive(Clone, Debug)]
pub enum Decl {
    Acl(AclDecl),
    Backend(BackendDecl),
    Director(DirectorDecl),
    Table(TableDecl),
    Sub(SubDecl),
    Penaltybox(NamedDecl),
    Ratecounter(NamedDecl),
    Import(Ident),
    Include(IncludeDecl),
}

#[derive(Clone, Debug, PartialEq)]
pub struct Ident {
    pub name: String,
    pub span: Span,
}

#[derive(Clone, Debug)]
pub struct IncludeDecl {
    pub module: String,
    pub span: Span,
}

#[derive(Clone, Debug)]
pub struct NamedDecl {
    pub name: Ident,
    pub span: Span,
}

#[derive(Clone, Debug)]
pub struct AclDecl {
    pub name: Ident,
    pub entries: Vec<AclEntry>,
    pub span: Span,
}

#[derive(Clone, Debug)]
pub struct AclEntry {
    pub negated: bool,
    pub ip: String,
    pub mask: Option<u8>,
    pub span: Span,
}

#[derive(Clone, Debug)]
pub struct BackendDecl {
    pub name: Ident,
    pub props: Vec<Property>,
    pub span: Span,
}

#[derive(Clone, Debug)]
pub struct Property {
    pub key: Ident,
    pub value: PropValue,
    pub span: Span,
}

#[derive(Clone, Debug)]
pub enum PropValue {
    Expr(Expr),
    /// `NN%` as written in director declarations.
    Percent(i64),
    Object(Vec<Property>),
}

#[derive(Clone, Debug)]
pub struct DirectorDecl {
    pub name: Ident,
    pub kind: Ident,
    pub props: Vec<Property>,
    pub backends: Vec<DirectorBackend>,
    pub span: Span,
}

#[derive(Clone, Debug)]
pub struct DirectorBackend {
    pub props: Vec<Property>,
    pub span: Span,
}

#[derive(Clone, Debug)]
pub struct TableDecl {
    pub name: Ident,
    pub value_type: Option<Ident>,
    pub entries: Vec<TableEntry>,
    pub span: Span,
}

#[derive(Clone, Debug)]
pub struct TableEntry {
    pub key: String,
    pub value: Expr,
    pub span: Span,
}

#[derive(Clone, Debug)]
pub struct SubDecl {
    pub name: Ident,
    pub params: Vec<Param>,
    pub return_type: Option<Ident>,
    pub body: Block,
    pub comments: Vec<String>,
    pub span: Span,
}

#[derive(Clone, Debug)]
pub struct Param {
    pub ty: Ident,
    pub name: Ident,
}

#[derive(Clone, Debug)]
pub struct Block {
    pub stmts: Vec<Stmt>,
    /// Comments between the last statement and the closing brace.
    pub infix_comments: Vec<String>,
    pub span: Span,
}

impl Block {
    pub fn new(stmts: Vec<Stmt>, span: Span) -> Self {
        Self {
            stmts,
            infix_comments: Vec::new(),
            span,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Stmt {
    pub kind: StmtKind,
    pub comments: Vec<String>,
    pub span: Span,
}

impl Stmt {
    pub fn new(kind: StmtKind, span: Span) -> Self {
        Self {
            kind,
            comments: Vec::new(),
            span,
        }
    }
}

#[derive(Clone, Debug)]
pub enum StmtKind {
    Declare {
        name: Ident,
        ty: Ident,
    },
    Set {
        target: Ident,
        op: AssignOp,
        value: Expr,
    },
    Unset {
        target: Ident,
    },
    Add {
        target: Ident,
        value: Expr,
    },
    Log(Expr),
    Synthetic(Expr),
    SyntheticBase64(Expr),
    Call(Ident),
    FunctionCall {
        name: Ident,
        args: Vec<Expr>,
    },
    If(IfStmt),
    Switch(SwitchStmt),
    Restart,
    Return(Option<Expr>),
    Error {
        code: Option<Expr>,
        response: Option<Expr>,
    },
    Block(Block),
    Esi,
    Goto(Ident),
    Label(Ident),
    Include(IncludeDecl),
    Break,
    Fallthrough,
}

#[derive(Clone, Debug)]
pub struct IfStmt {
    pub cond: Expr,
    pub consequence: Block,
    /// `else if` / `elsif` arms in source order.
    pub another: Vec<IfStmt>,
    pub alternative: Option<Block>,
    pub span: Span,
}

#[derive(Clone, Debug)]
pub struct SwitchStmt {
    pub control: Expr,
    pub cases: Vec<Case>,
    pub span: Span,
}

#[derive(Clone, Debug)]
pub struct Case {
    /// `None` for `default:`.
    pub test: Option<CaseTest>,
    pub stmts: Vec<Stmt>,
    pub fallthrough: bool,
    pub span: Span,
}

#[derive(Clone, Debug)]
pub struct CaseTest {
    pub regex: bool,
    pub value: String,
}

#[derive(Clone, Debug)]
pub struct Expr {
    pub kind: ExprKind,
    pub span: Span,
}

#[derive(Clone, Debug)]
pub enum ExprKind {
    Ident(String),
    String(String),
    Int(i64),
    Float(f64),
    RTime(i64),
    Bool(bool),
    Prefix {
        op: PrefixOp,
        right: Box<Expr>,
    },
    Group(Box<Expr>),
    If {
        cond: Box<Expr>,
        then: Box<Expr>,
        otherwise: Box<Expr>,
    },
    Call {
        name: Ident,
        args: Vec<Expr>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PrefixOp {
    Not,
    Neg,
    Plus,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinaryOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    Match,
    NotMatch,
    And,
    Or,
    /// Written `+`.
    Concat,
    /// Juxtaposed operands, `"a" req.url`.
    ImplicitConcat,
}

impl BinaryOp {
    pub fn as_str(self) -> &'static str {
        match self {
            BinaryOp::Eq => "==",
            BinaryOp::NotEq => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::LtEq => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::GtEq => ">=",
            BinaryOp::Match => "~",
            BinaryOp::NotMatch => "!~",
            BinaryOp::And => "&&",
            BinaryOp::Or => "||",
            BinaryOp::Concat => "+",
            BinaryOp::ImplicitConcat => "",
        }
    }
}

impl Expr {
    pub fn new(kind: ExprKind, span: Span) -> Self {
        Self { kind, span }
    }
}
