use std::fmt;

use crate::span::Span;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Level {
    Error,
    Warning,
}

#[derive(Clone, Debug)]
pub struct Diag {
    pub level: Level,
    pub message: String,
    pub span: Span,
}

impl Diag {
    pub fn render(&self, files: &[String]) -> String {
        let file = files
            .get(self.span.file as usize)
            .map(String::as_str)
            .unwrap_or("<unknown>");
        format!(
            "{}: {} ({file}:{}:{})",
            self.level, self.message, self.span.line, self.span.column
        )
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Level::Error => f.write_str("error"),
            Level::Warning => f.write_str("warning"),
        }
    }
}

#[derive(Default, Debug)]
pub struct Diagnostics {
    diags: Vec<Diag>,
}

impl Diagnostics {
    pub fn error<S: Into<String>>(&mut self, span: Span, message: S) {
        self.diags.push(Diag {
            level: Level::Error,
            message: message.into(),
            span,
        });
    }

    pub fn warning<S: Into<String>>(&mut self, span: Span, message: S) {
        self.diags.push(Diag {
            level: Level::Warning,
            message: message.into(),
            span,
        });
    }

    pub fn has_errors(&self) -> bool {
        self.diags.iter().any(|d| d.level == Level::Error)
    }

    pub fn into_vec(self) -> Vec<Diag> {
        self.diags
    }

    pub fn extend(&mut self, other: Vec<Diag>) {
        self.diags.extend(other);
    }
}
