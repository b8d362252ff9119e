use serde::{Deserialize, Serialize};

/// Byte range plus the 1-based line/column of its start, tagged with the
/// index of the source file it came from.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub file: u16,
    pub start: usize,
    pub end: usize,
    pub line: u32,
    pub column: u32,
}

impl Span {
    pub fn new(file: u16, start: usize, end: usize, line: u32, column: u32) -> Self {
        Self {
            file,
            start,
            end,
            line,
            column,
        }
    }

    /// Span for nodes synthesized by program transforms.
    pub fn synthetic() -> Self {
        Self::default()
    }

    pub fn merge(self, other: Span) -> Span {
        if other.file != self.file {
            return self;
        }
        let head = if other.start < self.start { other } else { self };
        Span {
            file: self.file,
            start: head.start,
            end: self.end.max(other.end),
            line: head.line,
            column: head.column,
        }
    }
}
