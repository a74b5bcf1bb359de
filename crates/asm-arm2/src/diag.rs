//! Assembly diagnostics.
//!
//! Parse and assemble errors are accumulated and reported in one batch.
//! Each diagnostic carries a source position and, where the fix is
//! obvious, a suggestion.

use std::fmt;

/// A source position: file, 1-based line, 1-based column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pos {
    pub file: String,
    pub line: u32,
    pub column: u32,
}

impl Pos {
    #[must_use]
    pub fn new(file: &str, line: u32, column: u32) -> Self {
        Self { file: file.to_string(), line, column }
    }
}

impl fmt::Display for Pos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.line, self.column)
    }
}

/// One assembly error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub pos: Pos,
    pub message: String,
    pub suggestion: Option<String>,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.pos, self.message)?;
        if let Some(s) = &self.suggestion {
            write!(f, " ({s})")?;
        }
        Ok(())
    }
}

impl std::error::Error for Diagnostic {}

/// Accumulates diagnostics up to a cap; further reports are counted but
/// dropped so a cascade cannot flood the caller.
#[derive(Debug, Default)]
pub struct Diagnostics {
    list: Vec<Diagnostic>,
    cap: usize,
    dropped: usize,
}

impl Diagnostics {
    #[must_use]
    pub fn new(cap: usize) -> Self {
        Self { list: Vec::new(), cap, dropped: 0 }
    }

    pub fn report(&mut self, pos: Pos, message: impl Into<String>) {
        self.report_with(pos, message, None);
    }

    pub fn report_with(
        &mut self,
        pos: Pos,
        message: impl Into<String>,
        suggestion: Option<String>,
    ) {
        if self.cap > 0 && self.list.len() >= self.cap {
            self.dropped += 1;
            return;
        }
        self.list.push(Diagnostic { pos, message: message.into(), suggestion });
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.list.len()
    }

    /// Finish, appending a summary entry when reports were dropped.
    #[must_use]
    pub fn into_vec(mut self) -> Vec<Diagnostic> {
        if self.dropped > 0 {
            let pos = self.list.last().map_or_else(|| Pos::new("<input>", 0, 0), |d| d.pos.clone());
            let dropped = self.dropped;
            self.list.push(Diagnostic {
                pos,
                message: format!("{dropped} further errors not shown"),
                suggestion: None,
            });
        }
        self.list
    }
}
