use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use crate::ast::{Block, Decl, IncludeDecl, Program, Stmt, StmtKind};
use crate::diag::{Diag, Diagnostics};
use crate::lexer;
use crate::limits;
use crate::parser::Parser;
use crate::span::Span;

/// Source of VCL modules referenced by `include "name";`.
pub trait Resolver {
    /// Returns the display name and source text of a module.
    fn resolve(&self, module: &str) -> Result<(String, String), String>;
}

/// Looks modules up next to the entry file, then in the configured include paths.
pub struct FileResolver {
    search: Vec<PathBuf>,
}

impl FileResolver {
    pub fn new(entry: &Path, include_paths: &[PathBuf]) -> Self {
        let mut search = Vec::new();
        search.push(
            entry
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from(".")),
        );
        search.extend(include_paths.iter().cloned());
        Self { search }
    }
}

impl Resolver for FileResolver {
    fn resolve(&self, module: &str) -> Result<(String, String), String> {
        for dir in &self.search {
            for candidate in [dir.join(module), dir.join(format!("{module}.vcl"))] {
                if candidate.is_file() {
                    let src = fs::read_to_string(&candidate).map_err(|err| {
                        format!("failed to read {}: {err}", candidate.display())
                    })?;
                    return Ok((candidate.display().to_string(), src));
                }
            }
        }
        Err(format!("include module '{module}' not found"))
    }
}

/// Parses the entry source and splices every include, top-level and in
/// subroutine bodies, into one program.
pub fn load_program(name: &str, src: &str, resolver: &dyn Resolver) -> (Program, Vec<Diag>) {
    let mut loader = Loader {
        resolver,
        files: Vec::new(),
        visiting: HashSet::new(),
        diags: Diagnostics::default(),
    };
    if src.len() > limits::MAX_CUSTOM_VCL_FILE_SIZE {
        loader.diags.error(
            Span::synthetic(),
            format!(
                "Overflow custom VCL file size limitation of {}",
                limits::MAX_CUSTOM_VCL_FILE_SIZE
            ),
        );
    }
    let decls = loader.load_decls(name, src);
    let program = Program {
        files: loader.files,
        decls,
    };
    (program, loader.diags.into_vec())
}

struct Loader<'a> {
    resolver: &'a dyn Resolver,
    files: Vec<String>,
    visiting: HashSet<String>,
    diags: Diagnostics,
}

impl Loader<'_> {
    fn register(&mut self, name: &str) -> u16 {
        self.files.push(name.to_string());
        (self.files.len() - 1) as u16
    }

    fn load_decls(&mut self, name: &str, src: &str) -> Vec<Decl> {
        let file = self.register(name);
        let tokens = lexer::lex(src, file, &mut self.diags);
        let decls = Parser::new(tokens, &mut self.diags).parse_decls();
        self.visiting.insert(name.to_string());
        let mut out = Vec::with_capacity(decls.len());
        for decl in decls {
            match decl {
                Decl::Include(include) => {
                    if let Some((module, src)) = self.fetch(&include) {
                        let nested = self.load_decls(&module, &src);
                        self.visiting.remove(&module);
                        out.extend(nested);
                    }
                }
                Decl::Sub(mut sub) => {
                    self.expand_block(&mut sub.body);
                    out.push(Decl::Sub(sub));
                }
                other => out.push(other),
            }
        }
        out
    }

    fn fetch(&mut self, include: &IncludeDecl) -> Option<(String, String)> {
        match self.resolver.resolve(&include.module) {
            Ok((module, src)) => {
                if self.visiting.contains(&module) {
                    self.diags
                        .error(include.span, format!("include cycle through '{module}'"));
                    return None;
                }
                Some((module, src))
            }
            Err(message) => {
                self.diags.error(include.span, message);
                None
            }
        }
    }

    fn expand_block(&mut self, block: &mut Block) {
        let stmts = std::mem::take(&mut block.stmts);
        block.stmts = self.expand_stmts(stmts);
    }

    fn expand_stmts(&mut self, stmts: Vec<Stmt>) -> Vec<Stmt> {
        let mut out = Vec::with_capacity(stmts.len());
        for mut stmt in stmts {
            match &mut stmt.kind {
                StmtKind::Include(include) => {
                    let include = include.clone();
                    let Some((module, src)) = self.fetch(&include) else {
                        continue;
                    };
                    let file = self.register(&module);
                    let tokens = lexer::lex(&src, file, &mut self.diags);
                    let nested = Parser::new(tokens, &mut self.diags).parse_statements();
                    self.visiting.insert(module.clone());
                    let nested = self.expand_stmts(nested);
                    self.visiting.remove(&module);
                    out.extend(nested);
                    continue;
                }
                StmtKind::Block(block) => self.expand_block(block),
                StmtKind::If(stmt_if) => {
                    self.expand_block(&mut stmt_if.consequence);
                    for arm in &mut stmt_if.another {
                        self.expand_block(&mut arm.consequence);
                    }
                    if let Some(alt) = &mut stmt_if.alternative {
                        self.expand_block(alt);
                    }
                }
                StmtKind::Switch(switch) => {
                    for case in &mut switch.cases {
                        let stmts = std::mem::take(&mut case.stmts);
                        case.stmts = self.expand_stmts(stmts);
                    }
                }
                _ => {}
            }
            out.push(stmt);
        }
        out
    }
}

/// Resolver over in-memory modules; used by tests and the single-request driver.
#[derive(Default)]
pub struct MemoryResolver {
    modules: Vec<(String, String)>,
}

impl MemoryResolver {
    pub fn with(mut self, name: &str, src: &str) -> Self {
        self.modules.push((name.to_string(), src.to_string()));
        self
    }
}

impl Resolver for MemoryResolver {
    fn resolve(&self, module: &str) -> Result<(String, String), String> {
        self.modules
            .iter()
            .find(|(name, _)| name == module || name.strip_suffix(".vcl") == Some(module))
            .cloned()
            .ok_or_else(|| format!("include module '{module}' not found"))
    }
}

#[cfg(test)]
mod tests {
    use super::{MemoryResolver, load_program};
    use crate::ast::{Decl, StmtKind};

    #[test]
    fn splices_top_level_and_statement_includes() {
        let resolver = MemoryResolver::default()
            .with("backends.vcl", "backend F_origin { .host = \"example.com\"; }")
            .with("recv_snippet", "set req.http.Snippet = \"1\";");
        let (program, diags) = load_program(
            "main.vcl",
            "include \"backends\";\nsub vcl_recv { include \"recv_snippet\"; restart; }",
            &resolver,
        );
        assert!(diags.is_empty(), "{diags:?}");
        assert!(matches!(program.decls[0], Decl::Backend(_)));
        let Decl::Sub(sub) = &program.decls[1] else {
            panic!("expected subroutine");
        };
        assert!(matches!(sub.body.stmts[0].kind, StmtKind::Set { .. }));
        assert!(matches!(sub.body.stmts[1].kind, StmtKind::Restart));
        assert_eq!(program.files.len(), 3);
    }

    #[test]
    fn detects_include_cycles() {
        let resolver = MemoryResolver::default()
            .with("a.vcl", "include \"b\";")
            .with("b.vcl", "include \"a\";");
        let (_, diags) = load_program("main.vcl", "include \"a\";", &resolver);
        assert!(diags.iter().any(|d| d.message.contains("include cycle")));
    }

    #[test]
    fn missing_module_is_reported() {
        let (_, diags) = load_program(
            "main.vcl",
            "include \"nope\";",
            &MemoryResolver::default(),
        );
        assert!(diags[0].message.contains("not found"));
    }
}
