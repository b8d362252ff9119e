//! Call frames for phase, `call`ed and functional subroutines.

use std::collections::HashMap;

use super::{Context, ExecError, ExecResult, Interpreter, State};
use crate::assign;
use crate::ast::SubDecl;
use crate::exception::Exception;
use crate::span::Span;
use crate::trace::{Flow, request_json, response_json};
use crate::value::{Value, ValueType};

/// Deepest nesting of subroutine calls a request may reach.
pub const MAX_STACK_DEPTH: usize = 100;

/// Caller state saved while a subroutine runs.
struct Frame {
    regex_groups: Vec<String>,
    locals: HashMap<String, Value>,
    functional: bool,
}

/// Converts `value` to `ty` with the assignment rules. Literal-ness is
/// dropped first: arguments and return values are always derived.
pub(super) fn convert(ty: ValueType, value: &Value) -> Result<Value, String> {
    let mut derived = value.clone();
    derived.literal = false;
    if derived.ty() == ty {
        return Ok(derived);
    }
    if matches!(ty, ValueType::Backend | ValueType::Acl) {
        return Err(format!("{} could not convert to {ty}", derived.ty()));
    }
    let mut out = ty.zero();
    assign::assign(&mut out, &derived)?;
    Ok(out)
}

fn escaped(err: ExecError, sub: &SubDecl) -> Exception {
    match err {
        ExecError::Exception(err) => err,
        ExecError::Goto(label, span) => {
            Exception::runtime(span, format!("Goto label {label} is not found"))
        }
        ExecError::Break => Exception::runtime(
            sub.name.span,
            "break statement is only allowed inside switch",
        ),
        ExecError::ReturnValue(_) => Exception::runtime(
            sub.name.span,
            format!("Subroutine {} could not return a value", sub.name.name),
        ),
        ExecError::Return(state) => Exception::runtime(
            sub.name.span,
            format!("Unexpected return state {state} in {}", sub.name.name),
        ),
    }
}

impl Interpreter {
    /// Snapshot of the HTTP state at `span`, appended to the trace.
    pub(super) fn record_flow(&self, ctx: &mut Context, subroutine: &str, span: Span) {
        let flow = Flow {
            file: self.file_name(span),
            line: span.line,
            position: span.column,
            subroutine: subroutine.to_string(),
            req: Some(request_json(&ctx.request)),
            bereq: ctx.backend_request.as_ref().map(request_json),
            beresp: ctx.backend_response.as_ref().map(response_json),
            resp: ctx.response.as_ref().map(response_json),
            object: ctx.object.as_ref().map(response_json),
        };
        ctx.trace.flows.push(flow);
    }

    fn enter(&self, ctx: &mut Context, sub: &SubDecl, functional: bool) -> Result<Frame, Exception> {
        let name = &sub.name.name;
        if ctx.call_stack.iter().any(|active| active == name) {
            return Err(Exception::runtime(
                sub.name.span,
                format!(
                    "Subroutine {name} is called recursively: {} -> {name}",
                    ctx.call_stack.join(" -> ")
                ),
            ));
        }
        if ctx.call_stack.len() >= MAX_STACK_DEPTH {
            return Err(Exception::runtime(
                sub.name.span,
                format!("Max call stack depth of {MAX_STACK_DEPTH} exceeded calling {name}"),
            ));
        }
        self.record_flow(ctx, name, sub.span);
        ctx.call_stack.push(name.clone());
        Ok(Frame {
            regex_groups: std::mem::take(&mut ctx.regex_groups),
            locals: std::mem::take(&mut ctx.locals),
            functional: std::mem::replace(&mut ctx.functional, functional),
        })
    }

    fn leave(&self, ctx: &mut Context, sub: &SubDecl, frame: Frame) {
        ctx.regex_groups = frame.regex_groups;
        ctx.locals = frame.locals;
        ctx.functional = frame.functional;
        ctx.call_stack.pop();
        *ctx.sub_calls.entry(sub.name.name.clone()).or_insert(0) += 1;
    }

    /// Runs a reserved subroutine for its phase.
    pub(super) fn run_subroutine(&self, ctx: &mut Context, sub: &SubDecl) -> Result<State, Exception> {
        let frame = self.enter(ctx, sub, false)?;
        let result = self.exec_block(ctx, &sub.body);
        self.leave(ctx, sub, frame);
        match result {
            Ok(()) => Ok(State::None),
            Err(ExecError::Return(state)) => Ok(state),
            Err(err) => Err(escaped(err, sub)),
        }
    }

    /// `call name;`. A bare `return` resumes the caller; a returned state
    /// ends the phase.
    pub(super) fn call_subroutine(&self, ctx: &mut Context, sub: &SubDecl) -> ExecResult<()> {
        let frame = self.enter(ctx, sub, false)?;
        let result = self.exec_block(ctx, &sub.body);
        self.leave(ctx, sub, frame);
        match result {
            Ok(()) | Err(ExecError::Return(State::BareReturn)) => Ok(()),
            Err(ExecError::Return(state)) => Err(ExecError::Return(state)),
            Err(err) => Err(escaped(err, sub).into()),
        }
    }

    /// Invokes a subroutine declared with a return type.
    pub(super) fn call_function(
        &self,
        ctx: &mut Context,
        sub: &SubDecl,
        args: Vec<Value>,
        span: Span,
    ) -> ExecResult<Value> {
        let name = &sub.name.name;
        if args.len() != sub.params.len() {
            return Err(Exception::runtime(
                span,
                format!(
                    "Subroutine {name} expects {} arguments, but got {}",
                    sub.params.len(),
                    args.len()
                ),
            )
            .into());
        }
        let mut bound = Vec::with_capacity(args.len());
        for (param, arg) in sub.params.iter().zip(&args) {
            let ty = ValueType::from_keyword(&param.ty.name).ok_or_else(|| {
                Exception::runtime(param.ty.span, format!("Unexpected parameter type {}", param.ty.name))
            })?;
            let value = convert(ty, arg).map_err(|_| {
                Exception::runtime(
                    param.name.span,
                    format!(
                        "Parameter {} expects type {ty}, but got {}",
                        param.name.name,
                        arg.ty()
                    ),
                )
            })?;
            bound.push((param.name.name.clone(), value));
        }
        let return_type = match &sub.return_type {
            Some(ty) => ValueType::from_keyword(&ty.name).ok_or_else(|| {
                Exception::runtime(ty.span, format!("Unexpected return type {}", ty.name))
            })?,
            None => return Err(Exception::system(format!("{name} is not a functional subroutine")).into()),
        };

        let frame = self.enter(ctx, sub, true)?;
        ctx.locals.extend(bound);
        let result = self.exec_block(ctx, &sub.body);
        self.leave(ctx, sub, frame);
        match result {
            Err(ExecError::ReturnValue(value)) => convert(return_type, &value).map_err(|_| {
                Exception::runtime(
                    sub.name.span,
                    format!(
                        "Invalid return type, expects={return_type}, but got={}",
                        value.ty()
                    ),
                )
                .into()
            }),
            Err(ExecError::Return(state)) if state != State::BareReturn => {
                Err(ExecError::Return(state))
            }
            Ok(()) | Err(ExecError::Return(_)) => Err(Exception::runtime(
                sub.name.span,
                format!("Functional subroutine {name} did not return any values"),
            )
            .into()),
            Err(err) => Err(escaped(err, sub).into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::convert;
    use crate::config::Options;
    use crate::http::Request;
    use crate::interp::Interpreter;
    use crate::loader::{MemoryResolver, load_program};
    use crate::value::{Value, ValueType};

    fn run(src: &str) -> crate::interp::Outcome {
        let (program, diags) = load_program("main.vcl", src, &MemoryResolver::default());
        assert!(diags.is_empty(), "{diags:?}");
        let interp = Interpreter::new(program, Options::default()).expect("compile");
        interp.process(Request::new("GET", "/path?q=1"))
    }

    fn error_message(src: &str) -> String {
        run(src).error.expect("error").message
    }

    #[test]
    fn arguments_are_converted_to_parameter_types() {
        let value = convert(ValueType::String, &Value::int(42).into_literal()).expect("convert");
        assert_eq!(value.render(), "42");
        assert!(!value.literal);
        assert!(convert(ValueType::Backend, &Value::string("F_a")).is_err());
    }

    #[test]
    fn recursion_is_rejected() {
        let message = error_message(
            "sub loop_a { call loop_b; }\nsub loop_b { call loop_a; }\nsub vcl_recv { call loop_a; }\n",
        );
        assert!(message.contains("called recursively"), "{message}");
    }

    #[test]
    fn caller_locals_survive_a_call() {
        let outcome = run(
            "sub helper { declare local var.x STRING; set var.x = \"inner\"; }\n\
             sub vcl_recv {\n  declare local var.x STRING;\n  set var.x = \"outer\";\n  call helper;\n  error 600 var.x;\n}\n",
        );
        let response = outcome.response.expect("response");
        assert_eq!(response.status, 600);
        assert_eq!(response.reason, "outer");
    }

    #[test]
    fn functional_subroutines_return_typed_values() {
        let outcome = run(
            "sub add_one(INTEGER var.n) INTEGER {\n  declare local var.r INTEGER;\n  set var.r = var.n;\n  set var.r += 1;\n  return var.r;\n}\n\
             sub vcl_recv {\n  declare local var.v INTEGER;\n  set var.v = add_one(41);\n  error 600 \"v=\" var.v;\n}\n",
        );
        assert_eq!(outcome.response.expect("response").reason, "v=42");

        let message = error_message(
            "sub nothing(STRING var.s) STRING { set req.http.A = var.s; }\nsub vcl_recv { set req.http.B = nothing(\"x\"); }\n",
        );
        assert_eq!(message, "Functional subroutine nothing did not return any values");

        let message = error_message(
            "sub one(STRING var.s) STRING { return var.s; }\nsub vcl_recv { set req.http.B = one(); }\n",
        );
        assert_eq!(message, "Subroutine one expects 1 arguments, but got 0");
    }

    #[test]
    fn call_stack_flows_are_traced() {
        let outcome = run("sub helper { }\nsub vcl_recv { call helper; error 600; }\n");
        let names: Vec<&str> = outcome
            .trace
            .flows
            .iter()
            .map(|flow| flow.subroutine.as_str())
            .collect();
        assert_eq!(names[..2], ["vcl_recv", "helper"]);
    }
}
