//! Coverage instrumentation. The program is rewritten so every subroutine,
//! statement and branch arm first calls a `coverage.*` builtin; the builtin
//! bumps a counter here.

use std::collections::BTreeMap;
use std::sync::Mutex;

use edgesim_rt::json::JsonValue;

use crate::ast::{
    Block, Case, Decl, Expr, ExprKind, Ident, IfStmt, Program, Stmt, StmtKind, SubDecl,
};
use crate::span::Span;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CoverageKind {
    Subroutine,
    Statement,
    Branch,
}

impl CoverageKind {
    /// Builtin that records a mark of this kind.
    pub fn builtin(self) -> &'static str {
        match self {
            CoverageKind::Subroutine => "coverage.subroutine",
            CoverageKind::Statement => "coverage.statement",
            CoverageKind::Branch => "coverage.branch",
        }
    }

    fn prefix(self) -> &'static str {
        match self {
            CoverageKind::Subroutine => "sub",
            CoverageKind::Statement => "stmt",
            CoverageKind::Branch => "branch",
        }
    }
}

#[derive(Debug, Default)]
struct Tables {
    subroutines: BTreeMap<String, u64>,
    statements: BTreeMap<String, u64>,
    branches: BTreeMap<String, u64>,
}

impl Tables {
    fn table(&mut self, kind: CoverageKind) -> &mut BTreeMap<String, u64> {
        match kind {
            CoverageKind::Subroutine => &mut self.subroutines,
            CoverageKind::Statement => &mut self.statements,
            CoverageKind::Branch => &mut self.branches,
        }
    }
}

/// Hit counters shared by every request of a process.
#[derive(Debug, Default)]
pub struct Coverage {
    tables: Mutex<Tables>,
}

fn summary(table: &BTreeMap<String, u64>) -> JsonValue {
    let total = table.len();
    let hit = table.values().filter(|count| **count > 0).count();
    let percent = if total == 0 {
        0.0
    } else {
        (hit as f64 / total as f64 * 10000.0).round() / 100.0
    };
    JsonValue::object([
        ("hit", JsonValue::Number(hit as f64)),
        ("total", JsonValue::Number(total as f64)),
        ("percent", JsonValue::Number(percent)),
        (
            "entries",
            JsonValue::object(
                table
                    .iter()
                    .map(|(id, count)| (id.clone(), JsonValue::Number(*count as f64))),
            ),
        ),
    ])
}

impl Coverage {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_tables<T>(&self, f: impl FnOnce(&mut Tables) -> T) -> T {
        let mut tables = match self.tables.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut tables)
    }

    pub fn register(&self, kind: CoverageKind, id: &str) {
        self.with_tables(|t| {
            t.table(kind).entry(id.to_string()).or_insert(0);
        });
    }

    pub fn mark(&self, kind: CoverageKind, id: &str) {
        self.with_tables(|t| *t.table(kind).entry(id.to_string()).or_insert(0) += 1);
    }

    pub fn count(&self, kind: CoverageKind, id: &str) -> Option<u64> {
        self.with_tables(|t| t.table(kind).get(id).copied())
    }

    pub fn report(&self) -> JsonValue {
        self.with_tables(|t| {
            JsonValue::object([
                ("subroutines", summary(&t.subroutines)),
                ("statements", summary(&t.statements)),
                ("branches", summary(&t.branches)),
            ])
        })
    }
}

/// Identifier for the node at `span`; sources other than the entry file are
/// tagged with their index so positions stay unique.
pub fn mark_id(kind: CoverageKind, span: Span) -> String {
    if span.file == 0 {
        format!("{}_{}_{}", kind.prefix(), span.line, span.column)
    } else {
        format!("{}_f{}_{}_{}", kind.prefix(), span.file, span.line, span.column)
    }
}

/// Branch ids for the two arms of an if-expression.
pub fn if_expression_ids(span: Span) -> (String, String) {
    let base = mark_id(CoverageKind::Branch, span);
    (format!("{base}_true"), format!("{base}_false"))
}

fn mark_stmt(kind: CoverageKind, id: String, span: Span) -> Stmt {
    Stmt::new(
        StmtKind::FunctionCall {
            name: Ident {
                name: kind.builtin().to_string(),
                span,
            },
            args: vec![Expr::new(ExprKind::String(id), span)],
        },
        span,
    )
}

/// Rewrites every subroutine of `program` with coverage marks and registers
/// each mark with zero hits.
pub fn instrument(program: &mut Program, coverage: &Coverage) {
    let mut walker = Instrumenter { coverage };
    for decl in &mut program.decls {
        if let Decl::Sub(sub) = decl {
            walker.subroutine(sub);
        }
    }
}

struct Instrumenter<'a> {
    coverage: &'a Coverage,
}

impl Instrumenter<'_> {
    fn mark(&mut self, kind: CoverageKind, id: String, span: Span) -> Stmt {
        self.coverage.register(kind, &id);
        mark_stmt(kind, id, span)
    }

    fn subroutine(&mut self, sub: &mut SubDecl) {
        self.block(&mut sub.body);
        let id = mark_id(CoverageKind::Subroutine, sub.span);
        let entry = self.mark(CoverageKind::Subroutine, id, sub.span);
        sub.body.stmts.insert(0, entry);
    }

    fn block(&mut self, block: &mut Block) {
        let stmts = std::mem::take(&mut block.stmts);
        block.stmts = self.stmts(stmts);
    }

    fn stmts(&mut self, stmts: Vec<Stmt>) -> Vec<Stmt> {
        let mut out = Vec::with_capacity(stmts.len() * 2);
        for mut stmt in stmts {
            if !matches!(
                stmt.kind,
                StmtKind::Label(_) | StmtKind::Include(_) | StmtKind::Break | StmtKind::Fallthrough
            ) {
                let id = mark_id(CoverageKind::Statement, stmt.span);
                out.push(self.mark(CoverageKind::Statement, id, stmt.span));
            }
            self.stmt_exprs(&stmt);
            match &mut stmt.kind {
                StmtKind::Block(block) => self.block(block),
                StmtKind::If(stmt_if) => self.if_stmt(stmt_if),
                StmtKind::Switch(switch) => {
                    for (idx, case) in switch.cases.iter_mut().enumerate() {
                        self.case(case, switch.span, idx);
                    }
                }
                _ => {}
            }
            out.push(stmt);
        }
        out
    }

    fn arm(&mut self, block: &mut Block, base: &str, idx: usize) {
        self.block(block);
        let id = format!("{base}_{idx}");
        let span = block.span;
        block.stmts.insert(0, self.mark(CoverageKind::Branch, id, span));
    }

    fn if_stmt(&mut self, stmt_if: &mut IfStmt) {
        let base = mark_id(CoverageKind::Branch, stmt_if.span);
        self.arm(&mut stmt_if.consequence, &base, 0);
        for (idx, arm) in stmt_if.another.iter_mut().enumerate() {
            self.expr(&arm.cond);
            self.arm(&mut arm.consequence, &base, idx + 1);
        }
        let last = stmt_if.another.len() + 1;
        let alternative = stmt_if
            .alternative
            .get_or_insert_with(|| Block::new(Vec::new(), stmt_if.span));
        self.arm(alternative, &base, last);
    }

    fn case(&mut self, case: &mut Case, switch_span: Span, idx: usize) {
        let stmts = std::mem::take(&mut case.stmts);
        case.stmts = self.stmts(stmts);
        let id = format!("{}_{idx}", mark_id(CoverageKind::Branch, switch_span));
        case.stmts
            .insert(0, self.mark(CoverageKind::Branch, id, case.span));
    }

    fn stmt_exprs(&mut self, stmt: &Stmt) {
        match &stmt.kind {
            StmtKind::Set { value, .. }
            | StmtKind::Add { value, .. }
            | StmtKind::Log(value)
            | StmtKind::Synthetic(value)
            | StmtKind::SyntheticBase64(value)
            | StmtKind::Return(Some(value)) => self.expr(value),
            StmtKind::FunctionCall { args, .. } => args.iter().for_each(|arg| self.expr(arg)),
            StmtKind::If(stmt_if) => self.expr(&stmt_if.cond),
            StmtKind::Switch(switch) => self.expr(&switch.control),
            StmtKind::Error { code, response } => {
                code.iter().chain(response.iter()).for_each(|e| self.expr(e))
            }
            _ => {}
        }
    }

    /// Registers the arms of every if-expression; they are marked when the
    /// expression is evaluated.
    fn expr(&mut self, expr: &Expr) {
        match &expr.kind {
            ExprKind::If {
                cond,
                then,
                otherwise,
            } => {
                let (on_true, on_false) = if_expression_ids(expr.span);
                self.coverage.register(CoverageKind::Branch, &on_true);
                self.coverage.register(CoverageKind::Branch, &on_false);
                self.expr(cond);
                self.expr(then);
                self.expr(otherwise);
            }
            ExprKind::Prefix { right, .. } => self.expr(right),
            ExprKind::Group(inner) => self.expr(inner),
            ExprKind::Binary { left, right, .. } => {
                self.expr(left);
                self.expr(right);
            }
            ExprKind::Call { args, .. } => args.iter().for_each(|arg| self.expr(arg)),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Coverage, CoverageKind, instrument};
    use crate::ast::{Decl, StmtKind};
    use crate::loader::{MemoryResolver, load_program};

    fn instrumented(src: &str) -> (crate::ast::Program, Coverage) {
        let (mut program, diags) = load_program("main.vcl", src, &MemoryResolver::default());
        assert!(diags.is_empty(), "{diags:?}");
        let coverage = Coverage::new();
        instrument(&mut program, &coverage);
        (program, coverage)
    }

    #[test]
    fn marks_subroutines_statements_and_branches() {
        let (program, coverage) = instrumented(
            "sub vcl_recv {\n  if (req.http.A) {\n    set req.http.B = \"1\";\n  }\n}\n",
        );
        let Decl::Sub(sub) = &program.decls[0] else {
            panic!("expected subroutine");
        };
        let StmtKind::FunctionCall { name, .. } = &sub.body.stmts[0].kind else {
            panic!("expected entry mark");
        };
        assert_eq!(name.name, "coverage.subroutine");
        let StmtKind::If(stmt_if) = &sub.body.stmts[2].kind else {
            panic!("expected if statement");
        };
        assert!(stmt_if.alternative.is_some(), "implicit else arm is added");

        let report = coverage.report();
        let total = |section: &str| {
            report
                .get(section)
                .and_then(|s| s.get("total"))
                .and_then(|t| t.as_f64())
        };
        assert_eq!(total("subroutines"), Some(1.0));
        assert_eq!(total("statements"), Some(2.0));
        assert_eq!(total("branches"), Some(2.0));
    }

    #[test]
    fn marks_accumulate_hits() {
        let coverage = Coverage::new();
        coverage.register(CoverageKind::Statement, "stmt_1_1");
        coverage.register(CoverageKind::Statement, "stmt_2_1");
        coverage.mark(CoverageKind::Statement, "stmt_1_1");
        coverage.mark(CoverageKind::Statement, "stmt_1_1");
        assert_eq!(coverage.count(CoverageKind::Statement, "stmt_1_1"), Some(2));
        let statements = coverage.report();
        let statements = statements.get("statements").expect("statements");
        assert_eq!(statements.get("hit").and_then(|v| v.as_f64()), Some(1.0));
        assert_eq!(statements.get("percent").and_then(|v| v.as_f64()), Some(50.0));
    }

    #[test]
    fn if_expressions_register_both_arms() {
        let (_, coverage) = instrumented(
            "sub vcl_recv {\n  set req.http.A = if(req.http.B, \"y\", \"n\");\n}\n",
        );
        let report = coverage.report();
        let branches = report.get("branches").expect("branches");
        assert_eq!(branches.get("total").and_then(|v| v.as_f64()), Some(2.0));
    }
}
