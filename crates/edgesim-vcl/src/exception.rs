use std::fmt;

use crate::span::Span;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExceptionKind {
    /// Caused by the VCL program.
    Runtime,
    /// Caused by the simulator itself or a resource limit.
    System,
}

impl ExceptionKind {
    fn label(self) -> &'static str {
        match self {
            ExceptionKind::Runtime => "RuntimeException",
            ExceptionKind::System => "SystemException",
        }
    }
}

#[derive(Clone, Debug)]
pub struct Exception {
    pub kind: ExceptionKind,
    pub message: String,
    pub span: Option<Span>,
}

impl Exception {
    pub fn runtime(span: Span, message: impl Into<String>) -> Self {
        Self {
            kind: ExceptionKind::Runtime,
            message: message.into(),
            span: Some(span),
        }
    }

    /// Runtime exception with no source position, e.g. from a builtin.
    pub fn runtime_bare(message: impl Into<String>) -> Self {
        Self {
            kind: ExceptionKind::Runtime,
            message: message.into(),
            span: None,
        }
    }

    pub fn system(message: impl Into<String>) -> Self {
        Self {
            kind: ExceptionKind::System,
            message: message.into(),
            span: None,
        }
    }

    /// Attaches a position unless one is already known.
    pub fn at(mut self, span: Span) -> Self {
        if self.span.is_none() {
            self.span = Some(span);
        }
        self
    }

    /// `[Type] message in FILE at line: L, position: P`, resolving the file
    /// index against the program's source names.
    pub fn render(&self, files: &[String]) -> String {
        let mut out = format!("[{}] {}", self.kind.label(), self.message);
        if let Some(span) = self.span.filter(|span| span.line > 0) {
            if let Some(file) = files.get(span.file as usize) {
                out.push_str(&format!(" in {file}"));
            }
            out.push_str(&format!(
                " at line: {}, position: {}",
                span.line, span.column
            ));
        }
        if self.kind == ExceptionKind::System {
            out.push_str("\n\nThis exception is raised by the simulator itself.");
            out.push_str("\nIt may be a bug; please report it with the VCL that triggered it.");
        }
        out
    }
}

impl fmt::Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render(&[]))
    }
}

impl std::error::Error for Exception {}

#[cfg(test)]
mod tests {
    use super::Exception;
    use crate::span::Span;

    #[test]
    fn runtime_exception_names_file_and_position() {
        let err = Exception::runtime(Span::new(0, 10, 14, 3, 5), "Max restart limit exceeded");
        assert_eq!(
            err.render(&["main.vcl".to_string()]),
            "[RuntimeException] Max restart limit exceeded in main.vcl at line: 3, position: 5"
        );
    }

    #[test]
    fn system_exception_carries_report_hint() {
        let rendered = Exception::system("URL size is limited under the 8192 bytes").to_string();
        assert!(rendered.starts_with("[SystemException] URL size"));
        assert!(rendered.contains("bug"));
    }
}
