//! Fastly boilerplate spliced into reserved subroutines at `#FASTLY <phase>`.
//!
//! Delivery stamping (`X-Served-By`, `X-Cache`, debug paths) is done by the
//! state machine, so the snippets here only carry the header hygiene the
//! edge performs around it.

use crate::ast::{Stmt, SubDecl};
use crate::diag::Diagnostics;
use crate::exception::Exception;
use crate::interp::Scope;
use crate::lexer::lex;
use crate::parser::Parser;

const RECV: &str = r#"
if (req.restarts == 0) {
  if (!req.http.X-Timer) {
    set req.http.X-Timer = "S" time.start.sec "." time.start.usec_frac;
  }
  set req.http.X-Timer = req.http.X-Timer ",VS0";
}
"#;

const HASH: &str = r#"
set req.hash += req.vcl.generation;
"#;

const HIT: &str = r#"
set req.http.Fastly-Tmp-Obj-TTL = obj.ttl;
set req.http.Fastly-Tmp-Obj-Grace = obj.grace;
{
  set req.http.Fastly-Cachetype = "HIT";
}
"#;

const BEREQ: &str = r#"
  {
    if (req.http.Fastly-FF) {
      set bereq.http.Fastly-Client = "1";
    }
    unset bereq.http.Fastly-Original-Cookie;
    unset bereq.http.Fastly-Original-URL;
    unset bereq.http.Fastly-Vary-String;
    unset bereq.http.X-Varnish-Client;
    if (req.http.Fastly-Temp-XFF) {
      if (req.http.Fastly-Temp-XFF == "") {
        unset bereq.http.X-Forwarded-For;
      } else {
        set bereq.http.X-Forwarded-For = req.http.Fastly-Temp-XFF;
      }
    }
  }
"#;

const MISS_HEAD: &str = r#"
unset req.http.Fastly-Tmp-Obj-TTL;
unset req.http.Fastly-Tmp-Obj-Grace;
if (req.http.Fastly-Check-SHA1) {
  error 550 "Doesnt exist";
}
"#;

const FETCH: &str = r#"
if (req.http.Fastly-Vary-String) {
  if (beresp.http.Vary) {
    set beresp.http.Vary = "Fastly-Vary-String, " beresp.http.Vary;
  } else {
    set beresp.http.Vary = "Fastly-Vary-String, ";
  }
}
"#;

const ERROR: &str = r#"
if (obj.status == 801) {
  set obj.status = 301;
  set obj.response = "Moved Permanently";
  set obj.http.Location = "https://" req.http.host req.url;
  synthetic {""};
  return (deliver);
}
if (req.http.Fastly-Restart-On-Error) {
  if (obj.status == 503 && req.restarts == 0) {
    restart;
  }
}
if (obj.status == 550) {
  return (deliver);
}
"#;

const DELIVER: &str = r#"
if (req.http.X-Timer) {
  set resp.http.X-Timer = req.http.X-Timer ",VE" time.elapsed.msec;
}
{
  set resp.http.Vary = regsub(resp.http.Vary, "Fastly-Vary-String, ", "");
  if (resp.http.Vary ~ "^\s*$") {
    unset resp.http.Vary;
  }
}
unset resp.http.X-Varnish;
set req.http.Surrogate-Key = resp.http.Surrogate-Key;
set req.http.Surrogate-Control = resp.http.Surrogate-Control;
if (!req.http.Fastly-FF && !req.http.Fastly-Debug) {
  unset resp.http.Surrogate-Key;
  unset resp.http.Surrogate-Control;
}
"#;

const LOG: &str = "";

/// Boilerplate source for a phase.
pub fn boilerplate(scope: Scope) -> String {
    match scope {
        Scope::Recv => RECV.to_string(),
        Scope::Hash => HASH.to_string(),
        Scope::Hit => HIT.to_string(),
        Scope::Miss => format!(
            "{MISS_HEAD}{{\n{BEREQ}\n  set req.http.Fastly-Cachetype = \"MISS\";\n}}\n"
        ),
        Scope::Pass => format!("{{\n{BEREQ}\n  set req.http.Fastly-Cachetype = \"PASS\";\n}}\n"),
        Scope::Fetch => FETCH.to_string(),
        Scope::Error => ERROR.to_string(),
        Scope::Deliver => DELIVER.to_string(),
        Scope::Log | Scope::Init => LOG.to_string(),
    }
}

/// True when a comment reads `FASTLY <phase>` once its markers are stripped.
fn is_marker(comment: &str, scope: Scope) -> bool {
    let text = comment
        .trim_start_matches(|ch: char| matches!(ch, ' ' | '\t' | '*' | '/' | '#'))
        .to_ascii_uppercase();
    let mut words = text.split_whitespace();
    words.next() == Some("FASTLY") && words.next() == Some(scope.as_str())
}

fn has_marker(comments: &[String], scope: Scope) -> bool {
    comments.iter().any(|comment| is_marker(comment, scope))
}

fn parse_boilerplate(scope: Scope, files: &mut Vec<String>) -> Result<Vec<Stmt>, Exception> {
    let file = u16::try_from(files.len())
        .map_err(|_| Exception::system("Too many source files to splice boilerplate"))?;
    files.push(format!("FastlyMacro::{}", scope.as_str()));
    let source = boilerplate(scope);
    let mut diags = Diagnostics::default();
    let tokens = lex(&source, file, &mut diags);
    let stmts = Parser::new(tokens, &mut diags).parse_statements();
    if diags.has_errors() {
        let detail = diags
            .into_vec()
            .first()
            .map(|diag| diag.render(files))
            .unwrap_or_default();
        return Err(Exception::system(format!(
            "Failed to parse boilerplate for {}: {detail}",
            scope.as_str()
        )));
    }
    Ok(stmts)
}

/// Splices the phase boilerplate into a reserved subroutine at its first
/// `#FASTLY <phase>` marker. Returns whether anything was inserted.
pub fn splice(sub: &mut SubDecl, files: &mut Vec<String>) -> Result<bool, Exception> {
    let Some(scope) = Scope::from_subroutine(&sub.name.name) else {
        return Ok(false);
    };
    let at = if has_marker(&sub.body.infix_comments, scope) {
        0
    } else if let Some(idx) = sub
        .body
        .stmts
        .iter()
        .position(|stmt| has_marker(&stmt.comments, scope))
    {
        idx
    } else {
        return Ok(false);
    };
    let stmts = parse_boilerplate(scope, files)?;
    sub.body.stmts.splice(at..at, stmts);
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::{boilerplate, is_marker, splice};
    use crate::ast::{Decl, StmtKind};
    use crate::interp::Scope;
    use crate::loader::{MemoryResolver, load_program};

    fn recv_sub(src: &str) -> (crate::ast::SubDecl, Vec<String>) {
        let (program, diags) = load_program("main.vcl", src, &MemoryResolver::default());
        assert!(diags.is_empty(), "{diags:?}");
        let sub = program
            .decls
            .into_iter()
            .find_map(|decl| match decl {
                Decl::Sub(sub) => Some(sub),
                _ => None,
            })
            .expect("sub");
        (sub, program.files)
    }

    #[test]
    fn markers_are_matched_case_insensitively() {
        assert!(is_marker("FASTLY recv", Scope::Recv));
        assert!(is_marker("#FASTLY RECV", Scope::Recv));
        assert!(!is_marker("FASTLY recv", Scope::Deliver));
        assert!(!is_marker("--FASTLY RECV BEGIN", Scope::Recv));
    }

    #[test]
    fn boilerplate_is_spliced_before_the_marked_statement() {
        let (mut sub, mut files) = recv_sub(
            "sub vcl_recv {\n  set req.http.A = \"1\";\n  #FASTLY recv\n  return(lookup);\n}\n",
        );
        assert!(splice(&mut sub, &mut files).expect("splice"));
        assert!(matches!(sub.body.stmts[0].kind, StmtKind::Set { .. }));
        assert!(matches!(sub.body.stmts[1].kind, StmtKind::If(_)));
        assert!(matches!(
            sub.body.stmts.last().map(|s| &s.kind),
            Some(StmtKind::Return(_))
        ));
        assert_eq!(files.last().map(String::as_str), Some("FastlyMacro::RECV"));
    }

    #[test]
    fn unmarked_subroutines_are_left_alone() {
        let (mut sub, mut files) = recv_sub("sub vcl_recv {\n  return(pass);\n}\n");
        assert!(!splice(&mut sub, &mut files).expect("splice"));
        assert_eq!(sub.body.stmts.len(), 1);
    }

    #[test]
    fn every_phase_has_parsable_boilerplate() {
        for scope in [
            Scope::Recv,
            Scope::Hash,
            Scope::Hit,
            Scope::Miss,
            Scope::Pass,
            Scope::Fetch,
            Scope::Error,
            Scope::Deliver,
        ] {
            assert!(!boilerplate(scope).trim().is_empty(), "{}", scope.as_str());
            let src = format!("sub {} {{\n#FASTLY {}\n}}\n", scope.subroutine(), scope.as_str());
            let (mut sub, mut files) = recv_sub(&src);
            assert!(splice(&mut sub, &mut files).expect("splice"), "{}", scope.as_str());
            assert!(!sub.body.stmts.is_empty());
        }
    }
}
