use crate::span::Span;

#[derive(Clone, Debug, PartialEq)]
pub enum TokenKind {
    Ident(String),
    Keyword(Keyword),
    String(String),
    Int(i64),
    Float(f64),
    /// Duration literal in milliseconds, e.g. `5m`, `1.5s`.
    RTime(i64),
    Bool(bool),
    Punct(Punct),
    Assign(AssignOp),
    Comment(String),
    Eof,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub span: Span,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Keyword {
    Acl,
    Backend,
    Director,
    Table,
    Sub,
    Penaltybox,
    Ratecounter,
    Import,
    Include,
    Set,
    Unset,
    Remove,
    Add,
    Declare,
    Local,
    Call,
    Return,
    Error,
    Restart,
    Esi,
    Log,
    Synthetic,
    SyntheticBase64,
    If,
    Else,
    Elseif,
    Switch,
    Case,
    Default,
    Break,
    Fallthrough,
    Goto,
}

impl Keyword {
    pub fn from_str(text: &str) -> Option<Self> {
        let kw = match text {
            "acl" => Keyword::Acl,
            "backend" => Keyword::Backend,
            "director" => Keyword::Director,
            "table" => Keyword::Table,
            "sub" => Keyword::Sub,
            "penaltybox" => Keyword::Penaltybox,
            "ratecounter" => Keyword::Ratecounter,
            "import" => Keyword::Import,
            "include" => Keyword::Include,
            "set" => Keyword::Set,
            "unset" => Keyword::Unset,
            "remove" => Keyword::Remove,
            "add" => Keyword::Add,
            "declare" => Keyword::Declare,
            "local" => Keyword::Local,
            "call" => Keyword::Call,
            "return" => Keyword::Return,
            "error" => Keyword::Error,
            "restart" => Keyword::Restart,
            "esi" => Keyword::Esi,
            "log" => Keyword::Log,
            "synthetic" => Keyword::Synthetic,
            "synthetic.base64" => Keyword::SyntheticBase64,
            "if" => Keyword::If,
            "else" => Keyword::Else,
            "elseif" | "elsif" => Keyword::Elseif,
            "switch" => Keyword::Switch,
            "case" => Keyword::Case,
            "default" => Keyword::Default,
            "break" => Keyword::Break,
            "fallthrough" => Keyword::Fallthrough,
            "goto" => Keyword::Goto,
            _ => return None,
        };
        Some(kw)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Punct {
    LBrace,
    RBrace,
    LParen,
    RParen,
    Semicolon,
    Comma,
    Colon,
    Slash,
    Percent,
    Bang,
    Tilde,
    NotTilde,
    EqEq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    AndAnd,
    OrOr,
    Plus,
    Minus,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AssignOp {
    Assign,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    BitOr,
    BitAnd,
    BitXor,
    Shl,
    Shr,
    Rol,
    Ror,
    LogicalOr,
    LogicalAnd,
}

impl AssignOp {
    pub fn as_str(self) -> &'static str {
        match self {
            AssignOp::Assign => "=",
            AssignOp::Add => "+=",
            AssignOp::Sub => "-=",
            AssignOp::Mul => "*=",
            AssignOp::Div => "/=",
            AssignOp::Rem => "%=",
            AssignOp::BitOr => "|=",
            AssignOp::BitAnd => "&=",
            AssignOp::BitXor => "^=",
            AssignOp::Shl => "<<=",
            AssignOp::Shr => ">>=",
            AssignOp::Rol => "rol=",
            AssignOp::Ror => "ror=",
            AssignOp::LogicalOr => "||=",
            AssignOp::LogicalAnd => "&&=",
        }
    }
}
