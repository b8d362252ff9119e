use crate::ast::*;
use crate::diag::Diagnostics;
use crate::span::Span;
use crate::token::{AssignOp, Keyword, Punct, Token, TokenKind};

pub struct Parser<'a> {
    tokens: Vec<Token>,
    /// Comments that appeared immediately before `tokens[i]`.
    comments: Vec<Vec<String>>,
    pos: usize,
    diags: &'a mut Diagnostics,
}

impl<'a> Parser<'a> {
    pub fn new(raw: Vec<Token>, diags: &'a mut Diagnostics) -> Self {
        let mut tokens = Vec::with_capacity(raw.len());
        let mut comments = Vec::with_capacity(raw.len());
        let mut pending = Vec::new();
        for token in raw {
            match token.kind {
                TokenKind::Comment(text) => pending.push(text),
                _ => {
                    tokens.push(token);
                    comments.push(std::mem::take(&mut pending));
                }
            }
        }
        if tokens.is_empty() {
            tokens.push(Token {
                kind: TokenKind::Eof,
                span: Span::synthetic(),
            });
            comments.push(pending);
        }
        Self {
            tokens,
            comments,
            pos: 0,
            diags,
        }
    }

    pub fn parse_decls(&mut self) -> Vec<Decl> {
        let mut decls = Vec::new();
        while !self.at_eof() {
            let comments = self.leading_comments();
            match self.parse_decl(comments) {
                Some(decl) => decls.push(decl),
                None => self.sync_to_next_decl(),
            }
        }
        decls
    }

    /// Parses a bare statement list, as used for boilerplate snippets.
    pub fn parse_statements(&mut self) -> Vec<Stmt> {
        let mut stmts = Vec::new();
        while !self.at_eof() {
            if let Some(brace) = self.eat_punct(Punct::RBrace) {
                self.diags.error(brace.span, "unbalanced `}`");
                continue;
            }
            match self.parse_stmt() {
                Some(stmt) => stmts.push(stmt),
                None => self.sync_to_stmt_end(),
            }
        }
        stmts
    }

    fn parse_decl(&mut self, comments: Vec<String>) -> Option<Decl> {
        let kw = match self.peek_kind() {
            TokenKind::Keyword(kw) => *kw,
            _ => {
                self.error_here("expected a declaration");
                return None;
            }
        };
        let start = self.bump().span;
        let decl = match kw {
            Keyword::Acl => Decl::Acl(self.parse_acl(start)?),
            Keyword::Backend => Decl::Backend(self.parse_backend(start)?),
            Keyword::Director => Decl::Director(self.parse_director(start)?),
            Keyword::Table => Decl::Table(self.parse_table(start)?),
            Keyword::Sub => Decl::Sub(self.parse_sub(start, comments)?),
            Keyword::Penaltybox => Decl::Penaltybox(self.parse_named_object(start)?),
            Keyword::Ratecounter => Decl::Ratecounter(self.parse_named_object(start)?),
            Keyword::Import => {
                let name = self.expect_ident()?;
                self.expect_punct(Punct::Semicolon)?;
                Decl::Import(name)
            }
            Keyword::Include => Decl::Include(self.parse_include(start)?),
            _ => {
                self.diags.error(start, "expected a declaration");
                return None;
            }
        };
        Some(decl)
    }

    fn parse_include(&mut self, start: Span) -> Option<IncludeDecl> {
        let module = self.expect_string()?;
        self.eat_punct(Punct::Semicolon);
        Some(IncludeDecl {
            module,
            span: start.merge(self.prev_span()),
        })
    }

    fn parse_acl(&mut self, start: Span) -> Option<AclDecl> {
        let name = self.expect_ident()?;
        self.expect_punct(Punct::LBrace)?;
        let mut entries = Vec::new();
        while !self.at_punct(Punct::RBrace) && !self.at_eof() {
            let entry_start = self.peek_span();
            let negated = self.eat_punct(Punct::Bang).is_some();
            let ip = self.expect_string()?;
            let mask = if self.eat_punct(Punct::Slash).is_some() {
                match self.bump().kind {
                    TokenKind::Int(v) if (0..=128).contains(&v) => Some(v as u8),
                    _ => {
                        self.diags.error(self.prev_span(), "invalid ACL mask");
                        return None;
                    }
                }
            } else {
                None
            };
            self.expect_punct(Punct::Semicolon)?;
            entries.push(AclEntry {
                negated,
                ip,
                mask,
                span: entry_start.merge(self.prev_span()),
            });
        }
        self.expect_punct(Punct::RBrace)?;
        Some(AclDecl {
            name,
            entries,
            span: start.merge(self.prev_span()),
        })
    }

    fn parse_backend(&mut self, start: Span) -> Option<BackendDecl> {
        let name = self.expect_ident()?;
        let props = self.parse_property_block()?;
        Some(BackendDecl {
            name,
            props,
            span: start.merge(self.prev_span()),
        })
    }

    fn parse_property_block(&mut self) -> Option<Vec<Property>> {
        self.expect_punct(Punct::LBrace)?;
        let mut props = Vec::new();
        while !self.at_punct(Punct::RBrace) && !self.at_eof() {
            props.push(self.parse_property()?);
        }
        self.expect_punct(Punct::RBrace)?;
        Some(props)
    }

    fn parse_property(&mut self) -> Option<Property> {
        let key = self.expect_property_key()?;
        self.expect_assign(AssignOp::Assign)?;
        let value = if self.at_punct(Punct::LBrace) {
            let props = self.parse_property_block()?;
            self.eat_punct(Punct::Semicolon);
            PropValue::Object(props)
        } else {
            let value = if let (TokenKind::Int(v), TokenKind::Punct(Punct::Percent)) =
                (self.peek_kind().clone(), self.peek_kind_n(1).clone())
            {
                self.bump();
                self.bump();
                PropValue::Percent(v)
            } else {
                PropValue::Expr(self.parse_expr()?)
            };
            self.expect_punct(Punct::Semicolon)?;
            value
        };
        let span = key.span.merge(self.prev_span());
        Some(Property { key, value, span })
    }

    fn expect_property_key(&mut self) -> Option<Ident> {
        let token = self.bump();
        match token.kind {
            TokenKind::Ident(name) if name.starts_with('.') && name.len() > 1 => Some(Ident {
                name: name[1..].to_string(),
                span: token.span,
            }),
            _ => {
                self.diags
                    .error(token.span, "expected a property name like `.host`");
                None
            }
        }
    }

    fn parse_director(&mut self, start: Span) -> Option<DirectorDecl> {
        let name = self.expect_ident()?;
        let kind = self.expect_ident()?;
        self.expect_punct(Punct::LBrace)?;
        let mut props = Vec::new();
        let mut backends = Vec::new();
        while !self.at_punct(Punct::RBrace) && !self.at_eof() {
            if self.at_punct(Punct::LBrace) {
                let block_start = self.peek_span();
                let block = self.parse_property_block()?;
                backends.push(DirectorBackend {
                    props: block,
                    span: block_start.merge(self.prev_span()),
                });
            } else {
                props.push(self.parse_property()?);
            }
        }
        self.expect_punct(Punct::RBrace)?;
        Some(DirectorDecl {
            name,
            kind,
            props,
            backends,
            span: start.merge(self.prev_span()),
        })
    }

    fn parse_table(&mut self, start: Span) -> Option<TableDecl> {
        let name = self.expect_ident()?;
        let value_type = match self.peek_kind() {
            TokenKind::Ident(_) => Some(self.expect_ident()?),
            _ => None,
        };
        self.expect_punct(Punct::LBrace)?;
        let mut entries = Vec::new();
        while !self.at_punct(Punct::RBrace) && !self.at_eof() {
            let entry_start = self.peek_span();
            let key = self.expect_string()?;
            self.expect_punct(Punct::Colon)?;
            let value = self.parse_prefix()?;
            entries.push(TableEntry {
                key,
                value,
                span: entry_start.merge(self.prev_span()),
            });
            if self.eat_punct(Punct::Comma).is_none() {
                break;
            }
        }
        self.expect_punct(Punct::RBrace)?;
        Some(TableDecl {
            name,
            value_type,
            entries,
            span: start.merge(self.prev_span()),
        })
    }

    fn parse_named_object(&mut self, start: Span) -> Option<NamedDecl> {
        let name = self.expect_ident()?;
        self.expect_punct(Punct::LBrace)?;
        self.expect_punct(Punct::RBrace)?;
        Some(NamedDecl {
            name,
            span: start.merge(self.prev_span()),
        })
    }

    fn parse_sub(&mut self, start: Span, comments: Vec<String>) -> Option<SubDecl> {
        let name = self.expect_ident()?;
        let mut params = Vec::new();
        if self.eat_punct(Punct::LParen).is_some() {
            while !self.at_punct(Punct::RParen) && !self.at_eof() {
                let ty = self.expect_ident()?;
                let param = self.expect_ident()?;
                params.push(Param { ty, name: param });
                if self.eat_punct(Punct::Comma).is_none() {
                    break;
                }
            }
            self.expect_punct(Punct::RParen)?;
        }
        let return_type = match self.peek_kind() {
            TokenKind::Ident(_) => Some(self.expect_ident()?),
            _ => None,
        };
        let body = self.parse_block()?;
        Some(SubDecl {
            name,
            params,
            return_type,
            body,
            comments,
            span: start.merge(self.prev_span()),
        })
    }

    fn parse_block(&mut self) -> Option<Block> {
        let start = self.expect_punct(Punct::LBrace)?;
        let mut stmts = Vec::new();
        while !self.at_punct(Punct::RBrace) && !self.at_eof() {
            match self.parse_stmt() {
                Some(stmt) => stmts.push(stmt),
                None => self.sync_to_stmt_end(),
            }
        }
        let infix_comments = self.leading_comments();
        self.expect_punct(Punct::RBrace)?;
        Some(Block {
            stmts,
            infix_comments,
            span: start.merge(self.prev_span()),
        })
    }

    fn parse_stmt(&mut self) -> Option<Stmt> {
        let comments = self.leading_comments();
        let start = self.peek_span();
        let kind = match self.peek_kind().clone() {
            TokenKind::Keyword(kw) => {
                self.bump();
                self.parse_keyword_stmt(kw, start)?
            }
            TokenKind::Punct(Punct::LBrace) => StmtKind::Block(self.parse_block()?),
            TokenKind::Ident(name) => {
                let ident = self.expect_ident()?;
                if self.eat_punct(Punct::Colon).is_some() {
                    StmtKind::Label(ident)
                } else if self.at_punct(Punct::LParen) {
                    let args = self.parse_call_args()?;
                    self.expect_punct(Punct::Semicolon)?;
                    StmtKind::FunctionCall { name: ident, args }
                } else {
                    self.diags
                        .error(start, format!("unexpected identifier '{name}' at statement start"));
                    return None;
                }
            }
            _ => {
                self.error_here("expected a statement");
                return None;
            }
        };
        Some(Stmt {
            kind,
            comments,
            span: start.merge(self.prev_span()),
        })
    }

    fn parse_keyword_stmt(&mut self, kw: Keyword, start: Span) -> Option<StmtKind> {
        let kind = match kw {
            Keyword::Declare => {
                if !matches!(self.peek_kind(), TokenKind::Keyword(Keyword::Local)) {
                    self.error_here("expected `local` after `declare`");
                    return None;
                }
                self.bump();
                let name = self.expect_ident()?;
                let ty = self.expect_ident()?;
                self.expect_punct(Punct::Semicolon)?;
                StmtKind::Declare { name, ty }
            }
            Keyword::Set => {
                let target = self.expect_ident()?;
                let op = match self.bump().kind {
                    TokenKind::Assign(op) => op,
                    _ => {
                        self.diags
                            .error(self.prev_span(), "expected an assignment operator");
                        return None;
                    }
                };
                let value = self.parse_expr()?;
                self.expect_punct(Punct::Semicolon)?;
                StmtKind::Set { target, op, value }
            }
            Keyword::Unset | Keyword::Remove => {
                let target = self.expect_ident()?;
                self.expect_punct(Punct::Semicolon)?;
                StmtKind::Unset { target }
            }
            Keyword::Add => {
                let target = self.expect_ident()?;
                self.expect_assign(AssignOp::Assign)?;
                let value = self.parse_expr()?;
                self.expect_punct(Punct::Semicolon)?;
                StmtKind::Add { target, value }
            }
            Keyword::Log => StmtKind::Log(self.parse_expr_stmt()?),
            Keyword::Synthetic => StmtKind::Synthetic(self.parse_expr_stmt()?),
            Keyword::SyntheticBase64 => StmtKind::SyntheticBase64(self.parse_expr_stmt()?),
            Keyword::Call => {
                let name = self.expect_ident()?;
                self.expect_punct(Punct::Semicolon)?;
                StmtKind::Call(name)
            }
            Keyword::If => StmtKind::If(self.parse_if(start)?),
            Keyword::Switch => StmtKind::Switch(self.parse_switch(start)?),
            Keyword::Restart => {
                self.expect_punct(Punct::Semicolon)?;
                StmtKind::Restart
            }
            Keyword::Esi => {
                self.expect_punct(Punct::Semicolon)?;
                StmtKind::Esi
            }
            Keyword::Break => {
                self.expect_punct(Punct::Semicolon)?;
                StmtKind::Break
            }
            Keyword::Fallthrough => {
                self.expect_punct(Punct::Semicolon)?;
                StmtKind::Fallthrough
            }
            Keyword::Return => {
                if self.eat_punct(Punct::Semicolon).is_some() {
                    StmtKind::Return(None)
                } else if let Some(state) = self.keyword_state() {
                    self.expect_punct(Punct::Semicolon)?;
                    StmtKind::Return(Some(state))
                } else {
                    let mut value = self.parse_expr()?;
                    if let ExprKind::Group(inner) = value.kind {
                        value = *inner;
                    }
                    self.expect_punct(Punct::Semicolon)?;
                    StmtKind::Return(Some(value))
                }
            }
            Keyword::Error => {
                let mut code = None;
                let mut response = None;
                if !self.at_punct(Punct::Semicolon) {
                    code = Some(self.parse_prefix()?);
                    if !self.at_punct(Punct::Semicolon) {
                        response = Some(self.parse_expr()?);
                    }
                }
                self.expect_punct(Punct::Semicolon)?;
                StmtKind::Error { code, response }
            }
            Keyword::Goto => {
                let label = self.expect_ident()?;
                self.expect_punct(Punct::Semicolon)?;
                StmtKind::Goto(label)
            }
            Keyword::Include => StmtKind::Include(self.parse_include(start)?),
            _ => {
                self.diags.error(start, "unexpected keyword at statement start");
                return None;
            }
        };
        Some(kind)
    }

    /// `(error)` and `(restart)` name states even though they are keywords.
    fn keyword_state(&mut self) -> Option<Expr> {
        let name = match (self.peek_kind(), self.peek_kind_n(1), self.peek_kind_n(2)) {
            (
                TokenKind::Punct(Punct::LParen),
                TokenKind::Keyword(Keyword::Error),
                TokenKind::Punct(Punct::RParen),
            ) => "error",
            (
                TokenKind::Punct(Punct::LParen),
                TokenKind::Keyword(Keyword::Restart),
                TokenKind::Punct(Punct::RParen),
            ) => "restart",
            _ => return None,
        };
        let start = self.bump().span;
        self.bump();
        let end = self.bump().span;
        Some(Expr::new(ExprKind::Ident(name.to_string()), start.merge(end)))
    }

    fn parse_expr_stmt(&mut self) -> Option<Expr> {
        let expr = self.parse_expr()?;
        self.expect_punct(Punct::Semicolon)?;
        Some(expr)
    }

    fn parse_if(&mut self, start: Span) -> Option<IfStmt> {
        self.expect_punct(Punct::LParen)?;
        let cond = self.parse_expr()?;
        self.expect_punct(Punct::RParen)?;
        let consequence = self.parse_block()?;
        let mut another = Vec::new();
        let mut alternative = None;
        loop {
            let arm_start = self.peek_span();
            match (self.peek_kind(), self.peek_kind_n(1)) {
                (TokenKind::Keyword(Keyword::Else), TokenKind::Keyword(Keyword::If)) => {
                    self.bump();
                    self.bump();
                }
                (TokenKind::Keyword(Keyword::Elseif), _) => {
                    self.bump();
                }
                (TokenKind::Keyword(Keyword::Else), _) => {
                    self.bump();
                    alternative = Some(self.parse_block()?);
                    break;
                }
                _ => break,
            }
            self.expect_punct(Punct::LParen)?;
            let arm_cond = self.parse_expr()?;
            self.expect_punct(Punct::RParen)?;
            let arm_block = self.parse_block()?;
            another.push(IfStmt {
                cond: arm_cond,
                consequence: arm_block,
                another: Vec::new(),
                alternative: None,
                span: arm_start.merge(self.prev_span()),
            });
        }
        Some(IfStmt {
            cond,
            consequence,
            another,
            alternative,
            span: start.merge(self.prev_span()),
        })
    }

    fn parse_switch(&mut self, start: Span) -> Option<SwitchStmt> {
        self.expect_punct(Punct::LParen)?;
        let control = self.parse_expr()?;
        self.expect_punct(Punct::RParen)?;
        self.expect_punct(Punct::LBrace)?;
        let mut cases = Vec::new();
        while !self.at_punct(Punct::RBrace) && !self.at_eof() {
            let case_start = self.peek_span();
            let test = match self.bump().kind {
                TokenKind::Keyword(Keyword::Case) => {
                    let regex = self.eat_punct(Punct::Tilde).is_some();
                    let value = self.expect_string()?;
                    Some(CaseTest { regex, value })
                }
                TokenKind::Keyword(Keyword::Default) => None,
                _ => {
                    self.diags
                        .error(self.prev_span(), "expected `case` or `default` in switch");
                    return None;
                }
            };
            self.expect_punct(Punct::Colon)?;
            let mut stmts = Vec::new();
            while !matches!(
                self.peek_kind(),
                TokenKind::Keyword(Keyword::Case | Keyword::Default)
                    | TokenKind::Punct(Punct::RBrace)
                    | TokenKind::Eof
            ) {
                match self.parse_stmt() {
                    Some(stmt) => stmts.push(stmt),
                    None => self.sync_to_stmt_end(),
                }
            }
            let mut fallthrough = false;
            match stmts.last().map(|s| &s.kind) {
                Some(StmtKind::Break) => {
                    stmts.pop();
                }
                Some(StmtKind::Fallthrough) => {
                    stmts.pop();
                    fallthrough = true;
                }
                _ => {}
            }
            cases.push(Case {
                test,
                stmts,
                fallthrough,
                span: case_start.merge(self.prev_span()),
            });
        }
        self.expect_punct(Punct::RBrace)?;
        Some(SwitchStmt {
            control,
            cases,
            span: start.merge(self.prev_span()),
        })
    }

    pub fn parse_expr(&mut self) -> Option<Expr> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Option<Expr> {
        let mut expr = self.parse_and()?;
        while self.eat_punct(Punct::OrOr).is_some() {
            let right = self.parse_and()?;
            expr = binary(BinaryOp::Or, expr, right);
        }
        Some(expr)
    }

    fn parse_and(&mut self) -> Option<Expr> {
        let mut expr = self.parse_cmp()?;
        while self.eat_punct(Punct::AndAnd).is_some() {
            let right = self.parse_cmp()?;
            expr = binary(BinaryOp::And, expr, right);
        }
        Some(expr)
    }

    fn parse_cmp(&mut self) -> Option<Expr> {
        let mut expr = self.parse_concat()?;
        loop {
            let op = match self.peek_kind() {
                TokenKind::Punct(Punct::EqEq) => BinaryOp::Eq,
                TokenKind::Punct(Punct::NotEq) => BinaryOp::NotEq,
                TokenKind::Punct(Punct::Lt) => BinaryOp::Lt,
                TokenKind::Punct(Punct::LtEq) => BinaryOp::LtEq,
                TokenKind::Punct(Punct::Gt) => BinaryOp::Gt,
                TokenKind::Punct(Punct::GtEq) => BinaryOp::GtEq,
                TokenKind::Punct(Punct::Tilde) => BinaryOp::Match,
                TokenKind::Punct(Punct::NotTilde) => BinaryOp::NotMatch,
                _ => break,
            };
            self.bump();
            let right = self.parse_concat()?;
            expr = binary(op, expr, right);
        }
        Some(expr)
    }

    fn parse_concat(&mut self) -> Option<Expr> {
        let mut expr = self.parse_prefix()?;
        loop {
            if self.eat_punct(Punct::Plus).is_some() {
                let right = self.parse_prefix()?;
                expr = binary(BinaryOp::Concat, expr, right);
            } else if self.at_operand_start() {
                let right = self.parse_prefix()?;
                expr = binary(BinaryOp::ImplicitConcat, expr, right);
            } else {
                break;
            }
        }
        Some(expr)
    }

    fn at_operand_start(&self) -> bool {
        match self.peek_kind() {
            TokenKind::String(_)
            | TokenKind::Int(_)
            | TokenKind::Float(_)
            | TokenKind::RTime(_)
            | TokenKind::Bool(_)
            | TokenKind::Ident(_) => true,
            TokenKind::Keyword(Keyword::If) => {
                matches!(self.peek_kind_n(1), TokenKind::Punct(Punct::LParen))
            }
            // `now -5m`: a signed literal juxtaposed to an operand
            TokenKind::Punct(Punct::Minus) => matches!(
                self.peek_kind_n(1),
                TokenKind::RTime(_) | TokenKind::Int(_) | TokenKind::Float(_)
            ),
            _ => false,
        }
    }

    fn parse_prefix(&mut self) -> Option<Expr> {
        let start = self.peek_span();
        let op = match self.peek_kind() {
            TokenKind::Punct(Punct::Bang) => Some(PrefixOp::Not),
            TokenKind::Punct(Punct::Minus) => Some(PrefixOp::Neg),
            TokenKind::Punct(Punct::Plus) => Some(PrefixOp::Plus),
            _ => None,
        };
        match op {
            Some(op) => {
                self.bump();
                let right = self.parse_prefix()?;
                let span = start.merge(right.span);
                Some(Expr::new(
                    ExprKind::Prefix {
                        op,
                        right: Box::new(right),
                    },
                    span,
                ))
            }
            None => self.parse_primary(),
        }
    }

    fn parse_primary(&mut self) -> Option<Expr> {
        let token = self.bump();
        let span = token.span;
        let kind = match token.kind {
            TokenKind::String(v) => ExprKind::String(v),
            TokenKind::Int(v) => ExprKind::Int(v),
            TokenKind::Float(v) => ExprKind::Float(v),
            TokenKind::RTime(v) => ExprKind::RTime(v),
            TokenKind::Bool(v) => ExprKind::Bool(v),
            TokenKind::Ident(name) => {
                if self.at_punct(Punct::LParen) {
                    let args = self.parse_call_args()?;
                    ExprKind::Call {
                        name: Ident { name, span },
                        args,
                    }
                } else {
                    ExprKind::Ident(name)
                }
            }
            TokenKind::Keyword(Keyword::If) => {
                self.expect_punct(Punct::LParen)?;
                let cond = self.parse_expr()?;
                self.expect_punct(Punct::Comma)?;
                let then = self.parse_expr()?;
                self.expect_punct(Punct::Comma)?;
                let otherwise = self.parse_expr()?;
                self.expect_punct(Punct::RParen)?;
                ExprKind::If {
                    cond: Box::new(cond),
                    then: Box::new(then),
                    otherwise: Box::new(otherwise),
                }
            }
            TokenKind::Punct(Punct::LParen) => {
                let inner = self.parse_expr()?;
                self.expect_punct(Punct::RParen)?;
                ExprKind::Group(Box::new(inner))
            }
            _ => {
                self.diags.error(span, "expected an expression");
                return None;
            }
        };
        Some(Expr::new(kind, span.merge(self.prev_span())))
    }

    fn parse_call_args(&mut self) -> Option<Vec<Expr>> {
        self.expect_punct(Punct::LParen)?;
        let mut args = Vec::new();
        while !self.at_punct(Punct::RParen) && !self.at_eof() {
            args.push(self.parse_expr()?);
            if self.eat_punct(Punct::Comma).is_none() {
                break;
            }
        }
        self.expect_punct(Punct::RParen)?;
        Some(args)
    }

    fn sync_to_stmt_end(&mut self) {
        while !self.at_eof() {
            if self.at_punct(Punct::RBrace) {
                return;
            }
            if self.bump().kind == TokenKind::Punct(Punct::Semicolon) {
                return;
            }
        }
    }

    fn sync_to_next_decl(&mut self) {
        let mut depth = 0i32;
        while !self.at_eof() {
            match self.peek_kind() {
                TokenKind::Punct(Punct::LBrace) => depth += 1,
                TokenKind::Punct(Punct::RBrace) => {
                    depth -= 1;
                    if depth <= 0 {
                        self.bump();
                        return;
                    }
                }
                kind if depth == 0 && kind.is_decl_start() => return,
                _ => {}
            }
            self.bump();
        }
    }

    fn leading_comments(&self) -> Vec<String> {
        self.comments.get(self.pos).cloned().unwrap_or_default()
    }

    fn expect_ident(&mut self) -> Option<Ident> {
        let token = self.bump();
        match token.kind {
            TokenKind::Ident(name) => Some(Ident {
                name,
                span: token.span,
            }),
            _ => {
                self.diags.error(token.span, "expected identifier");
                None
            }
        }
    }

    fn expect_string(&mut self) -> Option<String> {
        let token = self.bump();
        match token.kind {
            TokenKind::String(value) => Some(value),
            _ => {
                self.diags.error(token.span, "expected string literal");
                None
            }
        }
    }

    fn expect_assign(&mut self, op: AssignOp) -> Option<Span> {
        let token = self.bump();
        match token.kind {
            TokenKind::Assign(found) if found == op => Some(token.span),
            _ => {
                self.diags
                    .error(token.span, format!("expected `{}`", op.as_str()));
                None
            }
        }
    }

    fn expect_punct(&mut self, punct: Punct) -> Option<Span> {
        let token = self.bump();
        match token.kind {
            TokenKind::Punct(p) if p == punct => Some(token.span),
            _ => {
                self.diags
                    .error(token.span, format!("expected {}", punct_label(punct)));
                None
            }
        }
    }

    fn eat_punct(&mut self, punct: Punct) -> Option<Token> {
        if self.at_punct(punct) {
            Some(self.bump())
        } else {
            None
        }
    }

    fn at_punct(&self, punct: Punct) -> bool {
        matches!(self.peek_kind(), TokenKind::Punct(p) if *p == punct)
    }

    fn at_eof(&self) -> bool {
        matches!(self.peek_kind(), TokenKind::Eof)
    }

    fn error_here(&mut self, message: &str) {
        let span = self.peek_span();
        self.diags.error(span, message);
    }

    fn peek(&self) -> &Token {
        let last = self.tokens.len() - 1;
        &self.tokens[self.pos.min(last)]
    }

    fn peek_kind(&self) -> &TokenKind {
        &self.peek().kind
    }

    fn peek_kind_n(&self, n: usize) -> &TokenKind {
        let last = self.tokens.len() - 1;
        &self.tokens[(self.pos + n).min(last)].kind
    }

    fn bump(&mut self) -> Token {
        let tok = self.peek().clone();
        if !self.at_eof() {
            self.pos += 1;
        }
        tok
    }

    fn peek_span(&self) -> Span {
        self.peek().span
    }

    fn prev_span(&self) -> Span {
        if self.pos == 0 {
            self.peek().span
        } else {
            self.tokens[self.pos - 1].span
        }
    }
}

fn binary(op: BinaryOp, left: Expr, right: Expr) -> Expr {
    let span = left.span.merge(right.span);
    Expr::new(
        ExprKind::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        },
        span,
    )
}

fn punct_label(punct: Punct) -> &'static str {
    match punct {
        Punct::LBrace => "`{`",
        Punct::RBrace => "`}`",
        Punct::LParen => "`(`",
        Punct::RParen => "`)`",
        Punct::Semicolon => "`;`",
        Punct::Comma => "`,`",
        Punct::Colon => "`:`",
        _ => "punctuation",
    }
}

trait DeclStart {
    fn is_decl_start(&self) -> bool;
}

impl DeclStart for TokenKind {
    fn is_decl_start(&self) -> bool {
        matches!(
            self,
            TokenKind::Keyword(
                Keyword::Acl
                    | Keyword::Backend
                    | Keyword::Director
                    | Keyword::Table
                    | Keyword::Sub
                    | Keyword::Penaltybox
                    | Keyword::Ratecounter
                    | Keyword::Import
                    | Keyword::Include
            )
        )
    }
}
