//! Expression evaluation. `cond` selects condition mode, where unknown
//! identifiers read as null and `!` also applies to strings.

use super::{Context, ExecResult, Interpreter, builtins};
use crate::ast::{BinaryOp, Expr, ExprKind, Ident, PrefixOp};
use crate::coverage::{CoverageKind, if_expression_ids};
use crate::exception::Exception;
use crate::operator;
use crate::value::{LenientString, Value, ValueKind, ValueType, shift_time};

/// One operand of a flattened concatenation chain, with the operator that
/// joined it to the previous one.
type ConcatPart<'a> = (Option<BinaryOp>, &'a Expr);

fn flatten<'a>(expr: &'a Expr, op: Option<BinaryOp>, out: &mut Vec<ConcatPart<'a>>) {
    match &expr.kind {
        ExprKind::Binary {
            op: inner @ (BinaryOp::Concat | BinaryOp::ImplicitConcat),
            left,
            right,
        } => {
            flatten(left, op, out);
            flatten(right, Some(*inner), out);
        }
        _ => out.push((op, expr)),
    }
}

/// Signed milliseconds when `part` is an RTIME literal that may shift a
/// preceding TIME: `now + 5m`, `now -5m`.
fn time_delta(part: ConcatPart<'_>) -> Option<i64> {
    let (op, expr) = part;
    op?;
    match (&expr.kind, op) {
        (ExprKind::RTime(ms), Some(BinaryOp::Concat)) => Some(*ms),
        (ExprKind::Prefix { op: prefix, right }, _) => match (&right.kind, prefix) {
            (ExprKind::RTime(ms), PrefixOp::Neg) => Some(-ms),
            (ExprKind::RTime(ms), PrefixOp::Plus) => Some(*ms),
            _ => None,
        },
        _ => None,
    }
}

fn truthy(value: &Value) -> Result<bool, String> {
    match &value.kind {
        ValueKind::Bool(v) => Ok(*v),
        ValueKind::String { value, not_set } => Ok(!not_set && !value.is_empty()),
        ValueKind::Lenient(ls) => Ok(!ls.not_set && !ls.strict().is_empty()),
        ValueKind::Null => Ok(false),
        ValueKind::Ip(addr) => Ok(addr.is_some()),
        _ => Err(format!(
            "Condition must be BOOL or STRING, got {}",
            value.ty()
        )),
    }
}

impl Interpreter {
    pub(super) fn eval(&self, ctx: &mut Context, expr: &Expr, cond: bool) -> ExecResult<Value> {
        let fail = |msg: String| Exception::runtime(expr.span, msg);
        let value = match &expr.kind {
            ExprKind::String(v) => Value::string(v.clone()).into_literal(),
            ExprKind::Int(v) => Value::int(*v).into_literal(),
            ExprKind::Float(v) => Value::float(*v).into_literal(),
            ExprKind::RTime(ms) => Value::rtime(*ms).into_literal(),
            ExprKind::Bool(v) => Value::bool(*v).into_literal(),
            ExprKind::Ident(name) => self.resolve(ctx, name, cond).map_err(fail)?,
            ExprKind::Group(inner) => self.eval(ctx, inner, cond)?,
            ExprKind::Prefix { op, right } => {
                let value = self.eval(ctx, right, cond)?;
                prefix(*op, value, cond).map_err(fail)?
            }
            ExprKind::If {
                cond: test,
                then,
                otherwise,
            } => {
                let chosen = self.condition(ctx, test)?;
                if let Some(coverage) = &self.coverage {
                    let (on_true, on_false) = if_expression_ids(expr.span);
                    let id = if chosen { on_true } else { on_false };
                    coverage.mark(CoverageKind::Branch, &id);
                }
                let branch = if chosen { then } else { otherwise };
                self.eval(ctx, branch, false)?
            }
            ExprKind::Call { name, args } => self.call_named(ctx, name, args, expr.span)?,
            ExprKind::Binary { op, left, right } => match op {
                BinaryOp::Concat | BinaryOp::ImplicitConcat => self.concat(ctx, expr)?,
                BinaryOp::And | BinaryOp::Or => self.logical(ctx, *op, left, right, cond)?,
                _ => {
                    let l = self.eval(ctx, left, false)?;
                    let r = self.eval(ctx, right, false)?;
                    let result = match op {
                        BinaryOp::Eq => operator::equal(&l, &r),
                        BinaryOp::NotEq => operator::not_equal(&l, &r),
                        BinaryOp::Match => operator::regex_match(&l, &r, &mut ctx.regex_groups),
                        BinaryOp::NotMatch => {
                            operator::regex_not_match(&l, &r, &mut ctx.regex_groups)
                        }
                        _ => operator::compare(*op, &l, &r),
                    };
                    result.map_err(fail)?
                }
            },
        };
        Ok(value)
    }

    /// Evaluates `expr` in condition mode and reduces it to a boolean.
    pub(super) fn condition(&self, ctx: &mut Context, expr: &Expr) -> ExecResult<bool> {
        let value = self.eval(ctx, expr, true)?;
        Ok(truthy(&value).map_err(|msg| Exception::runtime(expr.span, msg))?)
    }

    fn resolve(&self, ctx: &mut Context, name: &str, cond: bool) -> Result<Value, String> {
        if let Some(backend) = self.decls.backends.get(name) {
            return Ok(Value::backend(backend.clone()));
        }
        if let Some(acl) = self.decls.acls.get(name) {
            return Ok(Value::acl(acl.clone()));
        }
        if self.decls.tables.contains_key(name)
            || self.decls.penaltyboxes.contains_key(name)
            || self.decls.ratecounters.contains_key(name)
        {
            return Ok(Value::ident(name));
        }
        if name.starts_with("var.") {
            return match ctx.locals.get(name) {
                Some(local) => {
                    let mut value = local.clone();
                    value.literal = false;
                    Ok(value)
                }
                None if cond => Ok(Value::null()),
                None => Err(format!("Variable {name} is not declared")),
            };
        }
        match self.get_variable(ctx, name)? {
            Some(value) => Ok(value),
            None if cond => Ok(Value::null()),
            None => Err(format!("Undefined variable {name}")),
        }
    }

    fn logical(
        &self,
        ctx: &mut Context,
        op: BinaryOp,
        left: &Expr,
        right: &Expr,
        cond: bool,
    ) -> ExecResult<Value> {
        if cond {
            let l = self.condition(ctx, left)?;
            let short = if op == BinaryOp::And { !l } else { l };
            if short {
                return Ok(Value::bool(l));
            }
            return Ok(Value::bool(self.condition(ctx, right)?));
        }
        let l = self.eval(ctx, left, false)?;
        match (op, l.as_bool()) {
            (BinaryOp::And, Some(false)) => return Ok(Value::bool(false)),
            (BinaryOp::Or, Some(true)) => return Ok(Value::bool(true)),
            _ => {}
        }
        let r = self.eval(ctx, right, false)?;
        let result = if op == BinaryOp::And {
            operator::logical_and(&l, &r)
        } else {
            operator::logical_or(&l, &r)
        };
        Ok(result.map_err(|msg| Exception::runtime(right.span, msg))?)
    }

    /// String concatenation, with TIME +/- RTIME literal folded in place.
    fn concat(&self, ctx: &mut Context, expr: &Expr) -> ExecResult<Value> {
        let mut parts = Vec::new();
        flatten(expr, None, &mut parts);

        let mut values: Vec<Value> = Vec::with_capacity(parts.len());
        for part in parts {
            if let Some(Value {
                kind: ValueKind::Time { at, out_of_bounds },
                ..
            }) = values.last_mut()
            {
                if let Some(ms) = time_delta(part) {
                    match shift_time(*at, ms) {
                        Some(next) => {
                            *at = next;
                            *out_of_bounds = false;
                        }
                        None => *out_of_bounds = true,
                    }
                    continue;
                }
            }
            let (_, operand) = part;
            match &operand.kind {
                ExprKind::Group(_) => {
                    return Err(Exception::runtime(
                        operand.span,
                        "Grouped expression could not use in string concatenation",
                    )
                    .into());
                }
                ExprKind::Call { name, .. } => {
                    let value = self.eval(ctx, operand, false)?;
                    if matches!(value.ty(), ValueType::Backend | ValueType::Acl) {
                        return Err(Exception::runtime(
                            operand.span,
                            format!(
                                "Function {} returns {} which could not use in string concatenation",
                                name.name,
                                value.ty()
                            ),
                        )
                        .into());
                    }
                    values.push(value);
                }
                _ => values.push(self.eval(ctx, operand, false)?),
            }
        }

        if values.len() == 1 {
            if let Some(value) = values.pop() {
                return Ok(value);
            }
        }
        let mut out = LenientString::default();
        for (idx, value) in values.into_iter().enumerate() {
            let side = if idx == 0 { "left" } else { "right" };
            operator::concat_operand(&value, side)
                .map_err(|msg| Exception::runtime(expr.span, msg))?;
            out.push(value);
        }
        Ok(Value::lenient(out))
    }

    /// Calls a functional subroutine or a builtin by name.
    pub(super) fn call_named(
        &self,
        ctx: &mut Context,
        name: &Ident,
        args: &[Expr],
        span: crate::span::Span,
    ) -> ExecResult<Value> {
        if let Some(sub) = self.decls.functions.get(&name.name) {
            let mut values = Vec::with_capacity(args.len());
            for arg in args {
                values.push(self.eval(ctx, arg, false)?);
            }
            return self.call_function(ctx, sub, values, span);
        }

        let Some(builtin) = builtins::lookup(&name.name) else {
            return Err(Exception::runtime(
                name.span,
                format!("Function {} is not defined", name.name),
            )
            .into());
        };
        if !builtin.scopes.contains(ctx.scope) {
            return Err(Exception::runtime(
                name.span,
                format!(
                    "Function {} could not call in {} scope",
                    name.name,
                    ctx.scope.as_str()
                ),
            )
            .into());
        }
        if args.len() < builtin.min_args || args.len() > builtin.max_args {
            let expected = if builtin.min_args == builtin.max_args {
                builtin.min_args.to_string()
            } else {
                format!("{} to {}", builtin.min_args, builtin.max_args)
            };
            return Err(Exception::runtime(
                span,
                format!(
                    "Function {} expects {expected} arguments, but got {}",
                    name.name,
                    args.len()
                ),
            )
            .into());
        }

        let mut values = Vec::with_capacity(args.len());
        for (idx, arg) in args.iter().enumerate() {
            if builtin.ident_args.contains(&idx) {
                let ExprKind::Ident(ident) = &arg.kind else {
                    return Err(Exception::runtime(
                        arg.span,
                        format!("Argument {} of {} must be an identifier", idx + 1, name.name),
                    )
                    .into());
                };
                values.push(Value::ident(ident.clone()));
            } else {
                values.push(self.eval(ctx, arg, false)?);
            }
        }
        let value = (builtin.call)(self, ctx, &values)
            .map_err(|msg| Exception::runtime(span, format!("{}: {msg}", name.name)))?;
        Ok(value)
    }
}

fn prefix(op: PrefixOp, value: Value, cond: bool) -> Result<Value, String> {
    let literal = value.literal;
    let out = match (op, &value.kind) {
        (PrefixOp::Not, ValueKind::Bool(v)) => Value::bool(!v),
        (PrefixOp::Not, ValueKind::String { .. } | ValueKind::Lenient(_) | ValueKind::Null)
            if cond =>
        {
            Value::bool(value.is_not_set())
        }
        (PrefixOp::Not, _) => {
            return Err(format!("Unexpected ! prefix operator for {}", value.ty()));
        }
        (PrefixOp::Neg, ValueKind::Integer { value: v, state }) => {
            Value::new(ValueKind::Integer {
                value: -v,
                state: *state,
            })
        }
        (PrefixOp::Neg, ValueKind::Float { value: v, .. }) => Value::float(-v),
        (PrefixOp::Neg, ValueKind::RTime(ms)) => Value::rtime(-ms),
        (PrefixOp::Plus, ValueKind::Integer { .. } | ValueKind::Float { .. } | ValueKind::RTime(_)) => {
            value.clone()
        }
        _ => {
            return Err(format!(
                "Unexpected {} prefix operator for {}",
                if op == PrefixOp::Neg { "-" } else { "+" },
                value.ty()
            ));
        }
    };
    Ok(Value { literal, ..out })
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use crate::config::Options;
    use crate::http::Request;
    use crate::interp::{Interpreter, Outcome};
    use crate::loader::{MemoryResolver, load_program};

    fn run(src: &str, req: Request) -> Outcome {
        let (program, diags) = load_program("main.vcl", src, &MemoryResolver::default());
        assert!(diags.is_empty(), "{diags:?}");
        let interp = Interpreter::new(program, Options::default()).expect("compile");
        let clock = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).single();
        interp.process_at(req, clock)
    }

    fn reason(src: &str) -> String {
        let outcome = run(src, Request::new("GET", "/path?q=1"));
        assert!(outcome.error.is_none(), "{:?}", outcome.trace.error);
        outcome.response.expect("response").reason
    }

    fn error_message(src: &str) -> String {
        run(src, Request::new("GET", "/")).error.expect("error").message
    }

    #[test]
    fn time_arithmetic_folds_into_concatenation() {
        assert_eq!(
            reason("sub vcl_recv { set req.http.T = now + 5m; error 600 req.http.T; }\n"),
            "Wed, 01 Jan 2025 00:05:00 GMT"
        );
        assert_eq!(
            reason("sub vcl_recv { set req.http.T = now -1d; error 600 req.http.T; }\n"),
            "Tue, 31 Dec 2024 00:00:00 GMT"
        );
    }

    #[test]
    fn time_arithmetic_past_the_calendar_is_out_of_bounds() {
        assert_eq!(
            reason("sub vcl_recv { set req.http.T = now + 1000000y; error 600 req.http.T; }\n"),
            "[out of bounds]"
        );
    }

    #[test]
    fn grouped_operands_are_rejected_in_concatenation() {
        let message = error_message("sub vcl_recv { set req.http.A = \"a\" + (req.url); }\n");
        assert_eq!(message, "Grouped expression could not use in string concatenation");
    }

    #[test]
    fn non_string_literals_are_rejected_in_concatenation() {
        let message = error_message("sub vcl_recv { set req.http.A = \"a\" 1; }\n");
        assert_eq!(
            message,
            "INTEGER type could not use as literal for right concatenation expression"
        );
    }

    #[test]
    fn condition_mode_tolerates_missing_values() {
        assert_eq!(
            reason(
                "sub vcl_recv {\n  if (!req.http.Missing && req.url ~ \"^/path\") {\n    error 600 \"yes\";\n  }\n  error 600 \"no\";\n}\n"
            ),
            "yes"
        );
        assert_eq!(
            reason("sub vcl_recv {\n  if (req.http.Empty) { error 600 \"set\"; }\n  error 600 \"unset\";\n}\n"),
            "unset"
        );
    }

    #[test]
    fn if_expressions_pick_a_branch() {
        assert_eq!(
            reason("sub vcl_recv { error 600 if(req.url ~ \"q=1\", \"one\", \"other\"); }\n"),
            "one"
        );
    }

    #[test]
    fn regex_captures_feed_re_group() {
        assert_eq!(
            reason(
                "sub vcl_recv {\n  if (req.url ~ \"^/(\\w+)\\?q=(\\d)\") {\n    error 600 re.group.1 \"-\" re.group.2;\n  }\n}\n"
            ),
            "path-1"
        );
    }

    #[test]
    fn unknown_identifiers_fail_outside_conditions() {
        assert_eq!(
            error_message("sub vcl_recv { set req.http.A = nothing.here; }\n"),
            "Undefined variable nothing.here"
        );
        assert_eq!(
            error_message("sub vcl_recv { set req.http.A = no_such_fn(\"x\"); }\n"),
            "Function no_such_fn is not defined"
        );
    }

    #[test]
    fn literal_comparisons_require_a_derived_left_side() {
        assert_eq!(
            error_message("sub vcl_recv { if (\"a\" == req.url) { error 600; } }\n"),
            "Could not use literal for equal operator"
        );
    }
}
