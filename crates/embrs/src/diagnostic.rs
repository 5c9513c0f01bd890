//! Compile-error diagnostics.
//!
//! Renders compile errors in a Rust-like format: the error message, the
//! file and line it came from, the offending source line, and a caret
//! underline pointing at the token that triggered it.

use std::fmt;

/// A compile error with enough context to render a source snippet.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    /// The error message (e.g. "expected ')' after argument list").
    pub message: String,
    /// The module file the error came from.
    pub file: String,
    /// 1-based line number.
    pub line: u32,
    /// The full text of the offending line, if available.
    pub source_line: Option<String>,
    /// 0-based column of the offending token within `source_line`.
    pub column: usize,
    /// Length of the underline in characters (at least 1).
    pub width: usize,
}

impl Diagnostic {
    pub fn new(message: impl Into<String>, file: impl Into<String>, line: u32) -> Self {
        Self {
            message: message.into(),
            file: file.into(),
            line,
            source_line: None,
            column: 0,
            width: 1,
        }
    }

    /// Attach the offending source line and the token position within it.
    pub fn with_snippet(mut self, source_line: impl Into<String>, column: usize, width: usize) -> Self {
        self.source_line = Some(source_line.into());
        self.column = column;
        self.width = width.max(1);
        self
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "error: {}", self.message)?;
        write!(f, "  --> {}:{}", self.file, self.line)?;

        if let Some(line_text) = &self.source_line {
            let gutter = self.line.to_string().len().max(1);
            writeln!(f)?;
            writeln!(f, "{:gutter$} |", "", gutter = gutter)?;
            writeln!(f, "{:gutter$} | {}", self.line, line_text, gutter = gutter)?;
            write!(f, "{:gutter$} | ", "", gutter = gutter)?;
            write!(f, "{:col$}", "", col = self.column)?;
            for _ in 0..self.width {
                write!(f, "^")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_message_and_location() {
        let diag = Diagnostic::new("expected ';' after expression", "main.em", 3);
        let out = diag.to_string();
        assert!(out.contains("error: expected ';' after expression"));
        assert!(out.contains("main.em:3"));
    }

    #[test]
    fn renders_snippet_with_underline() {
        let diag = Diagnostic::new("unexpected token", "main.em", 1)
            .with_snippet("var x = = 2", 8, 1);
        let out = diag.to_string();
        assert!(out.contains("var x = = 2"));
        assert!(out.contains("^"));
    }
}
