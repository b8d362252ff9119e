//! Statement execution. Control transfers (`return`, `error`, `restart`,
//! `goto`, `break`) travel up as [`ExecError`] variants.

use super::{Context, ExecError, ExecResult, Interpreter, Scope, ScopeSet, State};
use crate::assign;
use crate::ast::{Block, Expr, ExprKind, Ident, IfStmt, Stmt, StmtKind, SwitchStmt};
use crate::exception::Exception;
use crate::http::{Response, reason_phrase};
use crate::limits::MAX_LOG_LINE_SIZE;
use crate::operator;
use crate::span::Span;
use crate::token::AssignOp;
use crate::trace::LogLine;
use crate::value::{LenientString, Value, ValueKind, ValueType};

const RESTART_SCOPES: ScopeSet = ScopeSet::of(&[
    Scope::Recv,
    Scope::Hit,
    Scope::Fetch,
    Scope::Error,
    Scope::Deliver,
]);
const ERROR_SCOPES: ScopeSet = ScopeSet::of(&[
    Scope::Recv,
    Scope::Hit,
    Scope::Miss,
    Scope::Pass,
    Scope::Fetch,
]);
const SYNTHETIC_SCOPES: ScopeSet = ScopeSet::of(&[Scope::Error]);
const ESI_SCOPES: ScopeSet = ScopeSet::of(&[Scope::Fetch]);

const ADDABLE_PREFIXES: &[&str] = &[
    "req.http.",
    "bereq.http.",
    "beresp.http.",
    "obj.http.",
    "resp.http.",
];

fn check_scope(ctx: &Context, allowed: ScopeSet, what: &str, span: Span) -> ExecResult<()> {
    if allowed.contains(ctx.scope) {
        Ok(())
    } else {
        Err(Exception::runtime(
            span,
            format!("{what} could not use in {} scope", ctx.scope.as_str()),
        )
        .into())
    }
}

fn has_process_marker(stmt: &Stmt) -> bool {
    stmt.comments
        .iter()
        .any(|comment| comment.trim_start().starts_with("@process"))
}

impl Interpreter {
    pub(super) fn exec_block(&self, ctx: &mut Context, block: &Block) -> ExecResult<()> {
        self.exec_stmts(ctx, &block.stmts)
    }

    /// Runs `stmts` in order. A `goto` whose label lies later in the same
    /// list resumes there; anything else keeps unwinding.
    fn exec_stmts(&self, ctx: &mut Context, stmts: &[Stmt]) -> ExecResult<()> {
        let mut idx = 0;
        while idx < stmts.len() {
            match self.exec_stmt(ctx, &stmts[idx]) {
                Ok(()) => idx += 1,
                Err(ExecError::Goto(label, span)) => {
                    let target = stmts[idx..].iter().position(|stmt| {
                        matches!(&stmt.kind, StmtKind::Label(name) if name.name == label)
                    });
                    match target {
                        Some(offset) => idx += offset + 1,
                        None => return Err(ExecError::Goto(label, span)),
                    }
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    fn exec_stmt(&self, ctx: &mut Context, stmt: &Stmt) -> ExecResult<()> {
        if has_process_marker(stmt) {
            let subroutine = ctx.call_stack.last().cloned().unwrap_or_default();
            self.record_flow(ctx, &subroutine, stmt.span);
        }
        match &stmt.kind {
            StmtKind::Declare { name, ty } => self.exec_declare(ctx, name, ty),
            StmtKind::Set { target, op, value } => self.exec_set(ctx, target, *op, value),
            StmtKind::Unset { target } => self
                .unset_variable(ctx, &target.name)
                .map_err(|msg| Exception::runtime(target.span, msg).into()),
            StmtKind::Add { target, value } => self.exec_add(ctx, target, value),
            StmtKind::Log(expr) => self.exec_log(ctx, expr, stmt.span),
            StmtKind::Synthetic(expr) => self.exec_synthetic(ctx, expr, stmt.span, false),
            StmtKind::SyntheticBase64(expr) => self.exec_synthetic(ctx, expr, stmt.span, true),
            StmtKind::Call(name) => {
                let Some(sub) = self.decls.subroutines.get(&name.name) else {
                    return Err(Exception::runtime(
                        name.span,
                        format!("Call subroutine {} is not defined", name.name),
                    )
                    .into());
                };
                self.call_subroutine(ctx, sub)
            }
            StmtKind::FunctionCall { name, args } => {
                self.call_named(ctx, name, args, stmt.span)?;
                Ok(())
            }
            StmtKind::If(stmt_if) => self.exec_if(ctx, stmt_if),
            StmtKind::Switch(switch) => self.exec_switch(ctx, switch),
            StmtKind::Restart => {
                check_scope(ctx, RESTART_SCOPES, "restart statement", stmt.span)?;
                Err(ExecError::Return(State::Restart))
            }
            StmtKind::Return(value) => self.exec_return(ctx, value.as_ref(), stmt.span),
            StmtKind::Error { code, response } => {
                self.exec_error(ctx, code.as_ref(), response.as_ref(), stmt.span)
            }
            StmtKind::Block(block) => self.exec_block(ctx, block),
            StmtKind::Esi => {
                check_scope(ctx, ESI_SCOPES, "esi statement", stmt.span)?;
                if ctx.esi_enabled {
                    ctx.esi_triggered = true;
                }
                Ok(())
            }
            StmtKind::Goto(label) => Err(ExecError::Goto(label.name.clone(), label.span)),
            StmtKind::Label(_) | StmtKind::Fallthrough => Ok(()),
            StmtKind::Include(include) => Err(Exception::system(format!(
                "include {} was not resolved before execution",
                include.module
            ))
            .into()),
            StmtKind::Break => Err(ExecError::Break),
        }
    }

    fn exec_declare(&self, ctx: &mut Context, name: &Ident, ty: &Ident) -> ExecResult<()> {
        if !name.name.starts_with("var.") {
            return Err(Exception::runtime(
                name.span,
                format!("Local variable name must start with var., got {}", name.name),
            )
            .into());
        }
        let Some(value_type) = ValueType::from_keyword(&ty.name) else {
            return Err(Exception::runtime(
                ty.span,
                format!("Unexpected variable type {}", ty.name),
            )
            .into());
        };
        if ctx.locals.contains_key(&name.name) {
            return Err(Exception::runtime(
                name.span,
                format!("Variable {} is already declared", name.name),
            )
            .into());
        }
        ctx.locals.insert(name.name.clone(), value_type.zero());
        Ok(())
    }

    fn exec_set(&self, ctx: &mut Context, target: &Ident, op: AssignOp, expr: &Expr) -> ExecResult<()> {
        let value = self.eval(ctx, expr, false)?;
        let fail = |msg: String| -> ExecError { Exception::runtime(target.span, msg).into() };

        if target.name.starts_with("var.") {
            let Some(local) = ctx.locals.get_mut(&target.name) else {
                return Err(fail(format!("Variable {} is not declared", target.name)));
            };
            if matches!(local.kind, ValueKind::Null) && op == AssignOp::Assign {
                if matches!(value.kind, ValueKind::Backend(_) | ValueKind::Acl(_)) {
                    *local = value;
                    local.literal = false;
                    return Ok(());
                }
            }
            return assign::apply(op, local, &value).map_err(fail);
        }

        if target.name == "req.hash" {
            if ctx.scope != Scope::Hash {
                return Err(fail("req.hash could not be set outside of vcl_hash".to_string()));
            }
            if op != AssignOp::Add {
                return Err(fail("req.hash only accepts += operator".to_string()));
            }
            ctx.request_hash = assign::update_hash(&ctx.request_hash, &value).map_err(fail)?;
            return Ok(());
        }

        self.set_variable(ctx, &target.name, op, &value).map_err(fail)
    }

    fn exec_add(&self, ctx: &mut Context, target: &Ident, expr: &Expr) -> ExecResult<()> {
        if !ADDABLE_PREFIXES
            .iter()
            .any(|prefix| target.name.starts_with(prefix))
        {
            return Err(Exception::runtime(
                target.span,
                format!("Add statement could not use for {}", target.name),
            )
            .into());
        }
        let value = self.eval(ctx, expr, false)?;
        self.add_variable(ctx, &target.name, value)
            .map_err(|msg| Exception::runtime(target.span, msg).into())
    }

    fn exec_log(&self, ctx: &mut Context, expr: &Expr, span: Span) -> ExecResult<()> {
        let value = self.eval(ctx, expr, false)?;
        let message = LenientString::from_value(value).lenient();
        if message.len() > MAX_LOG_LINE_SIZE {
            return Err(Exception::runtime(
                span,
                format!("Log line exceeds the {MAX_LOG_LINE_SIZE} bytes limit"),
            )
            .into());
        }
        edgesim_rt::log::debug(&format!("[{}] {message}", ctx.scope.as_str()));
        let line = LogLine {
            scope: ctx.scope.as_str().to_string(),
            file: self.file_name(span),
            line: span.line,
            position: span.column,
            message,
        };
        ctx.trace.logs.push(line);
        Ok(())
    }

    fn exec_synthetic(&self, ctx: &mut Context, expr: &Expr, span: Span, base64: bool) -> ExecResult<()> {
        check_scope(ctx, SYNTHETIC_SCOPES, "synthetic statement", span)?;
        let value = self.eval(ctx, expr, false)?;
        let text = LenientString::from_value(value).strict();
        let body = if base64 {
            edgesim_rt::bytes::decode_base64(text.trim())
                .map_err(|err| Exception::runtime(span, format!("Invalid synthetic.base64 payload: {err}")))?
        } else {
            text.into_bytes()
        };
        let object = ctx.object.get_or_insert_with(|| {
            let status = u16::try_from(ctx.object_status).unwrap_or(503);
            Response::new(status)
        });
        object.body = body;
        Ok(())
    }

    fn exec_if(&self, ctx: &mut Context, stmt_if: &IfStmt) -> ExecResult<()> {
        if self.condition(ctx, &stmt_if.cond)? {
            return self.exec_block(ctx, &stmt_if.consequence);
        }
        for arm in &stmt_if.another {
            if self.condition(ctx, &arm.cond)? {
                return self.exec_block(ctx, &arm.consequence);
            }
        }
        match &stmt_if.alternative {
            Some(block) => self.exec_block(ctx, block),
            None => Ok(()),
        }
    }

    fn exec_switch(&self, ctx: &mut Context, switch: &SwitchStmt) -> ExecResult<()> {
        let control = self.eval(ctx, &switch.control, false)?;
        let subject = match &control.kind {
            ValueKind::String { .. } | ValueKind::Lenient(_) => control.render(),
            _ => {
                return Err(Exception::runtime(
                    switch.control.span,
                    format!("Switch control must be STRING, got {}", control.ty()),
                )
                .into());
            }
        };

        let mut matched = None;
        for (idx, case) in switch.cases.iter().enumerate() {
            let Some(test) = &case.test else { continue };
            let hit = if test.regex {
                let pattern = Value::string(test.value.clone()).into_literal();
                let mut subject_value = control.clone();
                subject_value.literal = false;
                operator::regex_match(&subject_value, &pattern, &mut ctx.regex_groups)
                    .map_err(|msg| Exception::runtime(case.span, msg))?
                    .as_bool()
                    == Some(true)
            } else {
                subject == test.value
            };
            if hit {
                matched = Some(idx);
                break;
            }
        }
        let start = matched.or_else(|| switch.cases.iter().position(|case| case.test.is_none()));
        let Some(start) = start else {
            return Ok(());
        };

        for case in &switch.cases[start..] {
            match self.exec_stmts(ctx, &case.stmts) {
                Ok(()) => {}
                Err(ExecError::Break) => return Ok(()),
                Err(err) => return Err(err),
            }
            if !case.fallthrough {
                break;
            }
        }
        Ok(())
    }

    fn exec_return(&self, ctx: &mut Context, value: Option<&Expr>, span: Span) -> ExecResult<()> {
        ctx.return_called = true;
        let Some(expr) = value else {
            return Err(ExecError::Return(State::BareReturn));
        };
        if let ExprKind::Ident(name) = &expr.kind {
            if let Some(state) = State::parse(name) {
                return Err(ExecError::Return(state));
            }
        }
        if ctx.functional {
            let value = self.eval(ctx, expr, false)?;
            return Err(ExecError::ReturnValue(value));
        }
        let name = match &expr.kind {
            ExprKind::Ident(name) => name.clone(),
            _ => "expression".to_string(),
        };
        Err(Exception::runtime(span, format!("Unexpected return state value: {name}")).into())
    }

    fn exec_error(
        &self,
        ctx: &mut Context,
        code: Option<&Expr>,
        response: Option<&Expr>,
        span: Span,
    ) -> ExecResult<()> {
        check_scope(ctx, ERROR_SCOPES, "error statement", span)?;
        let status = match code {
            Some(expr) => {
                let value = self.eval(ctx, expr, false)?;
                value.as_int().ok_or_else(|| {
                    Exception::runtime(
                        expr.span,
                        format!("Error code must be INTEGER, got {}", value.ty()),
                    )
                })?
            }
            None => 503,
        };
        let message = match response {
            Some(expr) => {
                let value = self.eval(ctx, expr, false)?;
                LenientString::from_value(value).strict()
            }
            None => u16::try_from(status)
                .map(reason_phrase)
                .unwrap_or_default()
                .to_string(),
        };
        ctx.object_status = status;
        ctx.object_response = message;
        Err(ExecError::Return(State::Error))
    }
}
