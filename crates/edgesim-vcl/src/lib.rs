pub mod acl;
pub mod assign;
pub mod ast;
pub mod cache;
pub mod config;
pub mod coverage;
pub mod diag;
pub mod director;
pub mod esi;
pub mod exception;
pub mod header;
pub mod http;
pub mod interp;
pub mod lexer;
pub mod limits;
pub mod loader;
pub mod macros;
pub mod observability;
pub mod operator;
pub mod parser;
pub mod ratelimit;
pub mod server;
pub mod span;
mod task_pool;
pub mod token;
pub mod trace;
pub mod transport;
pub mod value;

use std::fs;
use std::path::{Path, PathBuf};

use crate::config::Options;
use crate::diag::{Diagnostics, Level};
use crate::interp::Interpreter;

pub use loader::{FileResolver, MemoryResolver, Resolver, load_program};

/// Engine version reported by the CLIs.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Parses one source without resolving includes.
pub fn parse_source(src: &str, name: &str) -> (ast::Program, Vec<diag::Diag>) {
    let mut diags = Diagnostics::default();
    let tokens = lexer::lex(src, 0, &mut diags);
    let decls = parser::Parser::new(tokens, &mut diags).parse_decls();
    let program = ast::Program {
        files: vec![name.to_string()],
        decls,
    };
    (program, diags.into_vec())
}

/// Loads the entry file with its includes and initializes the program.
/// Errors come back rendered, one per line; warnings are logged.
pub fn compile_entry(
    entry: &Path,
    include_paths: &[PathBuf],
    options: Options,
) -> Result<Interpreter, Vec<String>> {
    let src = fs::read_to_string(entry)
        .map_err(|err| vec![format!("failed to read {}: {err}", entry.display())])?;
    let resolver = FileResolver::new(entry, include_paths);
    let (program, diags) = load_program(&entry.display().to_string(), &src, &resolver);
    let mut errors = Vec::new();
    for diag in &diags {
        let rendered = diag.render(&program.files);
        match diag.level {
            Level::Error => errors.push(rendered),
            Level::Warning => edgesim_rt::log::warn(&rendered),
        }
    }
    if !errors.is_empty() {
        return Err(errors);
    }
    let files = program.files.clone();
    Interpreter::new(program, options).map_err(|err| vec![err.render(&files)])
}
