use crate::diag::Diagnostics;
use crate::span::Span;
use crate::token::{AssignOp, Keyword, Punct, Token, TokenKind};

pub fn lex(src: &str, file: u16, diags: &mut Diagnostics) -> Vec<Token> {
    let mut cursor = Cursor {
        src,
        pos: 0,
        line: 1,
        column: 1,
        file,
    };
    let mut tokens = Vec::new();

    loop {
        cursor.skip_whitespace();
        let Some(ch) = cursor.peek() else {
            break;
        };
        let mark = cursor.mark();

        if ch == '#' || cursor.starts_with("//") {
            let text = cursor.take_while(|c| c != '\n');
            let body = text.trim_start_matches('#').trim_start_matches("//").trim();
            tokens.push(cursor.token(mark, TokenKind::Comment(body.to_string())));
            continue;
        }
        if cursor.starts_with("/*") {
            cursor.advance(2);
            match cursor.src[cursor.pos..].find("*/") {
                Some(end) => {
                    let body = cursor.src[cursor.pos..cursor.pos + end].trim().to_string();
                    cursor.advance_bytes(end + 2);
                    tokens.push(cursor.token(mark, TokenKind::Comment(body)));
                }
                None => {
                    cursor.advance_bytes(cursor.src.len() - cursor.pos);
                    diags.error(cursor.span_from(mark), "unterminated block comment");
                }
            }
            continue;
        }
        if ch == '"' {
            cursor.bump();
            let body = cursor.take_while(|c| c != '"' && c != '\n');
            if cursor.peek() == Some('"') {
                cursor.bump();
                tokens.push(cursor.token(mark, TokenKind::String(body.to_string())));
            } else {
                diags.error(cursor.span_from(mark), "unterminated string literal");
            }
            continue;
        }
        if cursor.starts_with("{\"") {
            cursor.advance(2);
            match cursor.src[cursor.pos..].find("\"}") {
                Some(end) => {
                    let body = cursor.src[cursor.pos..cursor.pos + end].to_string();
                    cursor.advance_bytes(end + 2);
                    tokens.push(cursor.token(mark, TokenKind::String(body)));
                }
                None => {
                    cursor.advance_bytes(cursor.src.len() - cursor.pos);
                    diags.error(cursor.span_from(mark), "unterminated long string literal");
                }
            }
            continue;
        }
        if ch.is_ascii_digit() {
            let kind = lex_number(&mut cursor);
            match kind {
                Ok(kind) => tokens.push(cursor.token(mark, kind)),
                Err(message) => diags.error(cursor.span_from(mark), message),
            }
            continue;
        }
        if is_ident_start(ch) || (ch == '.' && cursor.peek_nth(1).is_some_and(is_ident_start)) {
            let text = lex_ident(&mut cursor);
            let kind = if (text == "rol" || text == "ror")
                && cursor.peek() == Some('=')
                && cursor.peek_nth(1) != Some('=')
            {
                cursor.bump();
                TokenKind::Assign(if text == "rol" {
                    AssignOp::Rol
                } else {
                    AssignOp::Ror
                })
            } else if let Some(kw) = Keyword::from_str(text) {
                TokenKind::Keyword(kw)
            } else if text == "true" {
                TokenKind::Bool(true)
            } else if text == "false" {
                TokenKind::Bool(false)
            } else {
                TokenKind::Ident(text.to_string())
            };
            tokens.push(cursor.token(mark, kind));
            continue;
        }

        match lex_operator(&mut cursor) {
            Some(kind) => tokens.push(cursor.token(mark, kind)),
            None => {
                cursor.bump();
                diags.error(
                    cursor.span_from(mark),
                    format!("unexpected character '{ch}'"),
                );
            }
        }
    }

    let mark = cursor.mark();
    tokens.push(cursor.token(mark, TokenKind::Eof));
    tokens
}

fn lex_number(cursor: &mut Cursor<'_>) -> Result<TokenKind, String> {
    let start = cursor.pos;
    cursor.take_while(|c| c.is_ascii_digit());
    let mut is_float = false;
    if cursor.peek() == Some('.') && cursor.peek_nth(1).is_some_and(|c| c.is_ascii_digit()) {
        is_float = true;
        cursor.bump();
        cursor.take_while(|c| c.is_ascii_digit());
    }
    let digits = &cursor.src[start..cursor.pos];

    let unit = ["ms", "s", "m", "h", "d", "y"].into_iter().find(|unit| {
        cursor.starts_with(unit)
            && !cursor
                .peek_nth(unit.len())
                .is_some_and(is_ident_continue)
    });
    if let Some(unit) = unit {
        cursor.advance(unit.len());
        let base: f64 = digits
            .parse()
            .map_err(|_| format!("invalid duration literal '{digits}{unit}'"))?;
        let factor = match unit {
            "ms" => 1.0,
            "s" => 1_000.0,
            "m" => 60_000.0,
            "h" => 3_600_000.0,
            "d" => 86_400_000.0,
            _ => 31_536_000_000.0,
        };
        return Ok(TokenKind::RTime((base * factor).round() as i64));
    }

    if is_float {
        digits
            .parse::<f64>()
            .map(TokenKind::Float)
            .map_err(|_| format!("invalid float literal '{digits}'"))
    } else {
        digits
            .parse::<i64>()
            .map(TokenKind::Int)
            .map_err(|_| format!("integer literal out of range '{digits}'"))
    }
}

fn lex_ident<'a>(cursor: &mut Cursor<'a>) -> &'a str {
    let start = cursor.pos;
    cursor.bump();
    while let Some(c) = cursor.peek() {
        if c == ':' {
            // `req.http.Cookie:name` keeps the colon, a goto label `name:` does not.
            if cursor.peek_nth(1).is_some_and(is_ident_continue) {
                cursor.bump();
                continue;
            }
            break;
        }
        if is_ident_continue(c) {
            cursor.bump();
        } else {
            break;
        }
    }
    &cursor.src[start..cursor.pos]
}

fn lex_operator(cursor: &mut Cursor<'_>) -> Option<TokenKind> {
    const TABLE: &[(&str, TokenKind)] = &[
        ("<<=", TokenKind::Assign(AssignOp::Shl)),
        (">>=", TokenKind::Assign(AssignOp::Shr)),
        ("&&=", TokenKind::Assign(AssignOp::LogicalAnd)),
        ("||=", TokenKind::Assign(AssignOp::LogicalOr)),
        ("==", TokenKind::Punct(Punct::EqEq)),
        ("!=", TokenKind::Punct(Punct::NotEq)),
        ("!~", TokenKind::Punct(Punct::NotTilde)),
        ("<=", TokenKind::Punct(Punct::LtEq)),
        (">=", TokenKind::Punct(Punct::GtEq)),
        ("&&", TokenKind::Punct(Punct::AndAnd)),
        ("||", TokenKind::Punct(Punct::OrOr)),
        ("+=", TokenKind::Assign(AssignOp::Add)),
        ("-=", TokenKind::Assign(AssignOp::Sub)),
        ("*=", TokenKind::Assign(AssignOp::Mul)),
        ("/=", TokenKind::Assign(AssignOp::Div)),
        ("%=", TokenKind::Assign(AssignOp::Rem)),
        ("|=", TokenKind::Assign(AssignOp::BitOr)),
        ("&=", TokenKind::Assign(AssignOp::BitAnd)),
        ("^=", TokenKind::Assign(AssignOp::BitXor)),
        ("=", TokenKind::Assign(AssignOp::Assign)),
        ("!", TokenKind::Punct(Punct::Bang)),
        ("~", TokenKind::Punct(Punct::Tilde)),
        ("<", TokenKind::Punct(Punct::Lt)),
        (">", TokenKind::Punct(Punct::Gt)),
        ("+", TokenKind::Punct(Punct::Plus)),
        ("-", TokenKind::Punct(Punct::Minus)),
        ("/", TokenKind::Punct(Punct::Slash)),
        ("%", TokenKind::Punct(Punct::Percent)),
        ("{", TokenKind::Punct(Punct::LBrace)),
        ("}", TokenKind::Punct(Punct::RBrace)),
        ("(", TokenKind::Punct(Punct::LParen)),
        (")", TokenKind::Punct(Punct::RParen)),
        (";", TokenKind::Punct(Punct::Semicolon)),
        (",", TokenKind::Punct(Punct::Comma)),
        (":", TokenKind::Punct(Punct::Colon)),
    ];
    let (text, kind) = TABLE.iter().find(|(text, _)| cursor.starts_with(text))?;
    cursor.advance(text.len());
    Some(kind.clone())
}

fn is_ident_start(ch: char) -> bool {
    ch.is_ascii_alphabetic() || ch == '_'
}

fn is_ident_continue(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || matches!(ch, '_' | '.' | '-')
}

struct Cursor<'a> {
    src: &'a str,
    pos: usize,
    line: u32,
    column: u32,
    file: u16,
}

#[derive(Clone, Copy)]
struct Mark {
    pos: usize,
    line: u32,
    column: u32,
}

impl<'a> Cursor<'a> {
    fn peek(&self) -> Option<char> {
        self.src[self.pos..].chars().next()
    }

    fn peek_nth(&self, n: usize) -> Option<char> {
        self.src[self.pos..].chars().nth(n)
    }

    fn starts_with(&self, text: &str) -> bool {
        self.src[self.pos..].starts_with(text)
    }

    fn bump(&mut self) -> Option<char> {
        let ch = self.peek()?;
        self.pos += ch.len_utf8();
        if ch == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(ch)
    }

    fn advance(&mut self, chars: usize) {
        for _ in 0..chars {
            self.bump();
        }
    }

    fn advance_bytes(&mut self, bytes: usize) {
        let target = self.pos + bytes;
        while self.pos < target && self.bump().is_some() {}
    }

    fn take_while<F: Fn(char) -> bool>(&mut self, pred: F) -> &'a str {
        let start = self.pos;
        while let Some(ch) = self.peek() {
            if !pred(ch) {
                break;
            }
            self.bump();
        }
        &self.src[start..self.pos]
    }

    fn skip_whitespace(&mut self) {
        self.take_while(char::is_whitespace);
    }

    fn mark(&self) -> Mark {
        Mark {
            pos: self.pos,
            line: self.line,
            column: self.column,
        }
    }

    fn span_from(&self, mark: Mark) -> Span {
        Span::new(self.file, mark.pos, self.pos, mark.line, mark.column)
    }

    fn token(&self, mark: Mark, kind: TokenKind) -> Token {
        Token {
            kind,
            span: self.span_from(mark),
        }
    }
}
