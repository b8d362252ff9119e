//! The edge simulator: declarations compiled at init, and a per-request walk
//! of the VCL state machine over a [`Context`].

mod builtins;
mod context;
mod expression;
mod state;
mod statement;
mod subroutine;
mod variables;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use edgesim_rt::json::JsonValue;

use crate::acl::Acl;
use crate::ast::{Decl, ExprKind, Program, SubDecl, TableDecl};
use crate::cache::{Cache, DEFAULT_DATACENTER};
use crate::config::Options;
use crate::coverage::{self, Coverage};
use crate::director::{Backend, Director};
use crate::exception::Exception;
use crate::http::{Request, Response};
use crate::limits;
use crate::macros;
use crate::ratelimit::{Penaltybox, Ratecounter};
use crate::span::Span;
use crate::trace::Trace;
use crate::transport::Transport;
use crate::value::{BackendRef, Value, ValueType};

pub use context::{Context, Scope, ScopeSet};
pub use state::State;

/// `table` declaration with its entries already typed.
#[derive(Clone, Debug)]
pub struct Table {
    pub name: String,
    pub value_type: ValueType,
    pub entries: HashMap<String, Value>,
}

#[derive(Debug, Default)]
struct Declarations {
    /// Backends and directors share one namespace.
    backends: HashMap<String, BackendRef>,
    default_backend: Option<BackendRef>,
    acls: HashMap<String, Arc<Acl>>,
    tables: HashMap<String, Table>,
    subroutines: HashMap<String, SubDecl>,
    functions: HashMap<String, SubDecl>,
    penaltyboxes: HashMap<String, Penaltybox>,
    ratecounters: HashMap<String, Ratecounter>,
}

#[derive(Debug)]
enum ExecError {
    Exception(Exception),
    /// `return(state)`, `error` and `restart` unwind to the phase.
    Return(State),
    /// `return value;` from a functional subroutine.
    ReturnValue(Value),
    Goto(String, Span),
    Break,
}

impl From<Exception> for ExecError {
    fn from(err: Exception) -> Self {
        ExecError::Exception(err)
    }
}

type ExecResult<T> = Result<T, ExecError>;

/// What one request produced.
#[derive(Debug)]
pub struct Outcome {
    /// Client response; absent when the request aborted.
    pub response: Option<Response>,
    pub trace: Trace,
    pub error: Option<Exception>,
}

impl Outcome {
    pub fn status(&self) -> u16 {
        self.response.as_ref().map(|resp| resp.status).unwrap_or(500)
    }

    pub fn trace_json(&self) -> JsonValue {
        self.trace.to_json(self.response.as_ref())
    }
}

/// A program ready to serve requests. Shared by every connection; all
/// process-wide state inside it is synchronized.
#[derive(Debug)]
pub struct Interpreter {
    files: Vec<String>,
    decls: Declarations,
    cache: Cache,
    transport: Transport,
    coverage: Option<Coverage>,
    datacenter: String,
}

fn duplicated(span: Span, what: &str, name: &str) -> Exception {
    Exception::runtime(span, format!("{what} {name} is duplicated"))
}

fn table_value(
    decls: &Declarations,
    value_type: ValueType,
    kind: &ExprKind,
) -> Option<Value> {
    let value = match (value_type, kind) {
        (ValueType::String, ExprKind::String(v)) => Value::string(v.clone()),
        (ValueType::Integer, ExprKind::Int(v)) => Value::int(*v),
        (ValueType::Float, ExprKind::Float(v)) => Value::float(*v),
        (ValueType::Float, ExprKind::Int(v)) => Value::float(*v as f64),
        (ValueType::Bool, ExprKind::Bool(v)) => Value::bool(*v),
        (ValueType::RTime, ExprKind::RTime(v)) => Value::rtime(*v),
        (ValueType::Ip, ExprKind::String(v)) => Value::ip(v.parse().ok()?),
        (ValueType::Backend, ExprKind::Ident(name)) => {
            Value::backend(decls.backends.get(name)?.clone())
        }
        (ValueType::Acl, ExprKind::Ident(name)) => Value::acl(Arc::clone(decls.acls.get(name)?)),
        _ => return None,
    };
    Some(value)
}

fn compile_table(decls: &Declarations, decl: &TableDecl) -> Result<Table, Exception> {
    let value_type = match &decl.value_type {
        Some(ty) => ValueType::from_keyword(&ty.name).ok_or_else(|| {
            Exception::runtime(ty.span, format!("Unexpected table value type {}", ty.name))
        })?,
        None => ValueType::String,
    };
    let mut entries = HashMap::with_capacity(decl.entries.len());
    for entry in &decl.entries {
        let value = table_value(decls, value_type, &entry.value.kind).ok_or_else(|| {
            Exception::runtime(
                entry.span,
                format!(
                    "Table {} item {} is not {value_type} type",
                    decl.name.name, entry.key
                ),
            )
        })?;
        entries.insert(entry.key.clone(), value.into_literal());
    }
    Ok(Table {
        name: decl.name.name.clone(),
        value_type,
        entries,
    })
}

impl Interpreter {
    /// Compiles every declaration of a loaded program.
    pub fn new(mut program: Program, options: Options) -> Result<Self, Exception> {
        let coverage = options.coverage.then(Coverage::new);
        if let Some(coverage) = &coverage {
            coverage::instrument(&mut program, coverage);
        }
        let Program { mut files, decls } = program;
        let mut out = Declarations::default();
        let mut backend_count = 0usize;
        let mut acl_count = 0usize;

        let mut origins: HashMap<String, Arc<Backend>> = HashMap::new();
        for decl in &decls {
            if let Decl::Backend(backend) = decl {
                let name = &backend.name.name;
                if origins.contains_key(name) {
                    return Err(duplicated(backend.name.span, "Backend", name));
                }
                let compiled = Arc::new(Backend::from_decl(backend));
                let reference = BackendRef::Backend(Arc::clone(&compiled));
                if out.default_backend.is_none() {
                    out.default_backend = Some(reference.clone());
                }
                origins.insert(name.clone(), compiled);
                out.backends.insert(name.clone(), reference);
                backend_count += 1;
            }
        }

        let mut subroutines: Vec<SubDecl> = Vec::new();
        for decl in decls {
            match decl {
                Decl::Acl(acl) => {
                    let name = acl.name.name.clone();
                    if out.acls.contains_key(&name) {
                        return Err(duplicated(acl.name.span, "ACL", &name));
                    }
                    let compiled = Acl::from_decl(&acl)
                        .map_err(|message| Exception::runtime(acl.span, message))?;
                    out.acls.insert(name, Arc::new(compiled));
                    acl_count += 1;
                }
                Decl::Director(director) => {
                    let name = director.name.name.clone();
                    if out.backends.contains_key(&name) {
                        return Err(Exception::runtime(
                            director.name.span,
                            format!("Director {name} is duplicated in backend definition"),
                        ));
                    }
                    let compiled = Director::from_decl(&director, &origins)
                        .map_err(|err| err.at(director.span))?;
                    out.backends
                        .insert(name, BackendRef::Director(Arc::new(compiled)));
                }
                Decl::Table(table) => {
                    let name = table.name.name.clone();
                    if out.tables.contains_key(&name) {
                        return Err(duplicated(table.name.span, "Table", &name));
                    }
                    let compiled = compile_table(&out, &table)?;
                    out.tables.insert(name, compiled);
                }
                Decl::Penaltybox(pb) => {
                    let name = pb.name.name.clone();
                    if out.penaltyboxes.contains_key(&name) {
                        return Err(duplicated(pb.name.span, "Penaltybox", &name));
                    }
                    out.penaltyboxes.insert(name.clone(), Penaltybox::new(&name));
                }
                Decl::Ratecounter(rc) => {
                    let name = rc.name.name.clone();
                    if out.ratecounters.contains_key(&name) {
                        return Err(duplicated(rc.name.span, "Ratecounter", &name));
                    }
                    out.ratecounters.insert(name.clone(), Ratecounter::new(&name));
                }
                Decl::Sub(sub) => subroutines.push(sub),
                Decl::Backend(_) | Decl::Import(_) | Decl::Include(_) => {}
            }
        }

        for sub in subroutines {
            let name = sub.name.name.clone();
            if sub.return_type.is_some() {
                if out.functions.contains_key(&name) || out.subroutines.contains_key(&name) {
                    return Err(duplicated(sub.name.span, "Subroutine", &name));
                }
                out.functions.insert(name, sub);
                continue;
            }
            if out.functions.contains_key(&name) {
                return Err(duplicated(sub.name.span, "Subroutine", &name));
            }
            match out.subroutines.get_mut(&name) {
                Some(existing) if Scope::from_subroutine(&name).is_some() => {
                    existing.body.stmts.extend(sub.body.stmts);
                    existing.body.infix_comments.extend(sub.body.infix_comments);
                }
                Some(_) => return Err(duplicated(sub.name.span, "Subroutine", &name)),
                None => {
                    out.subroutines.insert(name, sub);
                }
            }
        }
        for sub in out.subroutines.values_mut() {
            macros::splice(sub, &mut files)?;
        }

        for (name, items) in &options.edge_dictionary {
            let table = out.tables.entry(name.clone()).or_insert_with(|| Table {
                name: name.clone(),
                value_type: ValueType::String,
                entries: HashMap::new(),
            });
            if table.value_type != ValueType::String {
                return Err(Exception::system(format!(
                    "EdgeDictionary injection error: {name} value type is not STRING"
                )));
            }
            for (key, value) in items {
                table
                    .entries
                    .insert(key.clone(), Value::string(value.clone()).into_literal());
            }
        }

        limits::check_resource_limit(
            backend_count,
            acl_count,
            options.max_backends,
            options.max_acls,
        )?;

        let datacenter = options
            .datacenter
            .clone()
            .unwrap_or_else(|| DEFAULT_DATACENTER.to_string());
        let transport = Transport::new(&options, &datacenter)?;
        edgesim_rt::log::debug(&format!(
            "program ready: {} backends, {} subroutines, {} tables",
            out.backends.len(),
            out.subroutines.len() + out.functions.len(),
            out.tables.len()
        ));

        Ok(Self {
            files,
            decls: out,
            cache: Cache::new(),
            transport,
            coverage,
            datacenter,
        })
    }

    /// Runs one request through the state machine.
    pub fn process(&self, request: Request) -> Outcome {
        self.process_at(request, None)
    }

    /// As [`Interpreter::process`], with `now` pinned to `clock` when given.
    pub fn process_at(&self, request: Request, clock: Option<DateTime<Utc>>) -> Outcome {
        let mut ctx = Context::new(request, clock);
        ctx.backend = self.decls.default_backend.clone();
        let result = self.run(&mut ctx);
        ctx.trace.elapsed = ctx.elapsed();
        ctx.trace.restarts = ctx.restarts;
        ctx.trace.coverage = self.coverage_report();
        match result {
            Ok(()) => Outcome {
                response: ctx.response.take(),
                trace: ctx.trace,
                error: None,
            },
            Err(err) => {
                let rendered = err.render(&self.files);
                edgesim_rt::log::warn(&rendered);
                ctx.trace.error = Some(rendered);
                Outcome {
                    response: None,
                    trace: ctx.trace,
                    error: Some(err),
                }
            }
        }
    }

    /// Source names indexed by span file id, boilerplate included.
    pub fn files(&self) -> &[String] {
        &self.files
    }

    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    pub fn datacenter(&self) -> &str {
        &self.datacenter
    }

    /// A declared origin, for toggling health from outside.
    pub fn backend(&self, name: &str) -> Option<Arc<Backend>> {
        match self.decls.backends.get(name)? {
            BackendRef::Backend(backend) => Some(Arc::clone(backend)),
            BackendRef::Director(_) => None,
        }
    }

    pub fn table(&self, name: &str) -> Option<&Table> {
        self.decls.tables.get(name)
    }

    pub fn coverage_report(&self) -> Option<JsonValue> {
        self.coverage.as_ref().map(Coverage::report)
    }

    fn file_name(&self, span: Span) -> String {
        self.files
            .get(span.file as usize)
            .cloned()
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::Interpreter;
    use crate::config::Options;
    use crate::loader::{MemoryResolver, load_program};
    use crate::value::ValueType;

    fn compile(src: &str, options: Options) -> Result<Interpreter, String> {
        let (program, diags) = load_program("main.vcl", src, &MemoryResolver::default());
        assert!(diags.is_empty(), "{diags:?}");
        Interpreter::new(program, options).map_err(|err| err.message)
    }

    #[test]
    fn duplicated_declarations_are_rejected() {
        let err = compile(
            "backend F_a { .host = \"a\"; }\nbackend F_a { .host = \"b\"; }",
            Options::default(),
        )
        .expect_err("duplicate");
        assert_eq!(err, "Backend F_a is duplicated");

        let err = compile(
            "sub helper { }\nsub helper { }",
            Options::default(),
        )
        .expect_err("duplicate sub");
        assert_eq!(err, "Subroutine helper is duplicated");
    }

    #[test]
    fn reserved_subroutines_are_concatenated() {
        let interp = compile(
            "sub vcl_recv { set req.http.A = \"1\"; }\nsub vcl_recv { set req.http.B = \"2\"; }",
            Options::default(),
        )
        .expect("compile");
        assert_eq!(interp.decls.subroutines["vcl_recv"].body.stmts.len(), 2);
    }

    #[test]
    fn tables_are_typed_at_init() {
        let interp = compile(
            "table ttls INTEGER { \"short\": 10, \"long\": 3600 }",
            Options::default(),
        )
        .expect("compile");
        let table = interp.table("ttls").expect("table");
        assert_eq!(table.value_type, ValueType::Integer);
        assert_eq!(table.entries["long"].as_int(), Some(3600));

        let err = compile("table bad INTEGER { \"a\": \"x\" }", Options::default())
            .expect_err("mismatch");
        assert_eq!(err, "Table bad item a is not INTEGER type");
    }

    #[test]
    fn edge_dictionaries_are_injected() {
        let mut options = Options::default();
        options
            .edge_dictionary
            .entry("flags".to_string())
            .or_default()
            .insert("beta".to_string(), "on".to_string());
        let interp = compile("sub vcl_recv { }", options).expect("compile");
        let table = interp.table("flags").expect("injected");
        assert_eq!(table.entries["beta"].render(), "on");

        let mut options = Options::default();
        options
            .edge_dictionary
            .entry("ints".to_string())
            .or_default()
            .insert("a".to_string(), "1".to_string());
        let err = compile("table ints INTEGER { \"a\": 1 }", options).expect_err("type");
        assert_eq!(err, "EdgeDictionary injection error: ints value type is not STRING");
    }

    #[test]
    fn backend_count_is_limited() {
        let src: String = (0..6)
            .map(|idx| format!("backend F_{idx} {{ .host = \"h{idx}\"; }}\n"))
            .collect();
        let err = compile(&src, Options::default()).expect_err("limit");
        assert!(err.contains("backend count"), "{err}");
        let options = Options {
            max_backends: 10,
            ..Options::default()
        };
        assert!(compile(&src, options).is_ok());
    }
}
