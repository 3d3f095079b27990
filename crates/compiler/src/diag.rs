//! Diagnostics and fatal error types.
//!
//! User-visible problems are reported as they are found (filename, line,
//! message, and the offending source line with a caret underline) and
//! counted; the pipeline refuses to emit anything once the count is
//! non-zero. Hard failures that cannot be recovered from are carried as
//! [`CompileError`] and propagated with `?`.

use std::rc::Rc;

use crate::lexer::{Line, Token};

/// Reporting stops and compilation aborts once this many diagnostics
/// have been recorded.
pub const MAX_ERROR_COUNT: usize = 25;

/// Severity of a recorded diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
}

/// A single user-visible diagnostic.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub severity: Severity,
    /// Source line the diagnostic points at, when known.
    pub line: Option<Rc<Line>>,
    /// Byte range within the line text to underline.
    pub span: Option<(usize, usize)>,
    pub message: String,
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(line) = &self.line {
            write!(f, "{}({}): ", line.filename, line.lineno)?;
        }
        writeln!(f, "{}", self.message)?;
        if let (Some(line), Some((begin, end))) = (&self.line, self.span) {
            let text = line.text.trim_end_matches('\n');
            writeln!(f, "{}", text)?;
            // Columns are byte offsets; the sources this compiler sees are
            // preprocessor output and effectively ASCII.
            let width = end.saturating_sub(begin).max(1);
            writeln!(f, "{}{}", " ".repeat(begin.min(text.len())), "^".repeat(width))?;
        }
        Ok(())
    }
}

/// Accumulator for diagnostics. Reporting aborts once the error cap is
/// reached.
#[derive(Debug, Default)]
pub struct Diagnostics {
    diags: Vec<Diagnostic>,
    error_count: usize,
}

impl Diagnostics {
    pub fn new() -> Self {
        Diagnostics::default()
    }

    pub fn error_count(&self) -> usize {
        self.error_count
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diags
    }

    /// Record a non-fatal error at a token. Returns `Err` only when the
    /// cap is reached, at which point the caller must abort.
    pub fn error_at(&mut self, token: Option<&Token>, message: String) -> Result<(), CompileError> {
        let (line, span) = match token {
            Some(t) => (Some(t.line.clone()), Some((t.begin, t.end))),
            None => (None, None),
        };
        self.record(Diagnostic {
            severity: Severity::Error,
            line,
            span,
            message,
        })
    }

    /// Record an error on a raw line (used by the lexer, which may not
    /// have a finished token to point at).
    pub fn error_on_line(
        &mut self,
        line: Rc<Line>,
        span: (usize, usize),
        message: String,
    ) -> Result<(), CompileError> {
        self.record(Diagnostic {
            severity: Severity::Error,
            line: Some(line),
            span: Some(span),
            message,
        })
    }

    fn record(&mut self, diag: Diagnostic) -> Result<(), CompileError> {
        eprint!("{}", diag);
        if diag.severity == Severity::Error {
            self.error_count += 1;
        }
        self.diags.push(diag);
        if self.error_count >= MAX_ERROR_COUNT {
            return Err(CompileError::TooManyErrors);
        }
        Ok(())
    }
}

/// Error type for the compilation pipeline.
///
/// This allows proper error propagation using `?` for unrecoverable
/// conditions; recoverable diagnostics go through [`Diagnostics`]
/// instead and only gate the final output.
#[derive(Debug)]
pub enum CompileError {
    /// A syntax or semantic error the parser could not recover from.
    /// The diagnostic has already been reported.
    Fatal,
    /// The diagnostic cap was reached.
    TooManyErrors,
    /// One or more non-fatal diagnostics were recorded; no output was
    /// produced.
    HasErrors(usize),
    /// A formatting error while writing assembly text.
    Format(std::fmt::Error),
    /// An I/O error reading source or writing output.
    Io(std::io::Error),
}

impl std::fmt::Display for CompileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompileError::Fatal => write!(f, "compilation aborted"),
            CompileError::TooManyErrors => {
                write!(f, "too many errors ({}), aborting", MAX_ERROR_COUNT)
            }
            CompileError::HasErrors(n) => write!(f, "{} error(s) reported", n),
            CompileError::Format(e) => write!(f, "emit error: {}", e),
            CompileError::Io(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for CompileError {}

impl From<std::fmt::Error> for CompileError {
    fn from(e: std::fmt::Error) -> Self {
        CompileError::Format(e)
    }
}

impl From<std::io::Error> for CompileError {
    fn from(e: std::io::Error) -> Self {
        CompileError::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_line() -> Rc<Line> {
        Rc::new(Line {
            filename: "test.c".into(),
            lineno: 3,
            text: "int x = $;".to_string(),
        })
    }

    #[test]
    fn test_display_with_caret() {
        let diag = Diagnostic {
            severity: Severity::Error,
            line: Some(dummy_line()),
            span: Some((8, 9)),
            message: "Unexpected character".to_string(),
        };
        let rendered = format!("{}", diag);
        assert!(rendered.starts_with("test.c(3): Unexpected character\n"));
        assert!(rendered.contains("int x = $;"));
        assert!(rendered.contains("        ^"));
    }

    #[test]
    fn test_warning_does_not_count_toward_cap() {
        let mut diags = Diagnostics::new();
        let warn = Diagnostic {
            severity: Severity::Warning,
            line: Some(dummy_line()),
            span: None,
            message: "suspicious but legal".to_string(),
        };
        diags.record(warn).unwrap();
        assert_eq!(diags.error_count(), 0);
        assert_eq!(diags.diagnostics().len(), 1);
    }

    #[test]
    fn test_error_cap() {
        let mut diags = Diagnostics::new();
        for i in 0..MAX_ERROR_COUNT - 1 {
            assert!(diags.error_on_line(dummy_line(), (0, 1), format!("e{}", i)).is_ok());
        }
        let last = diags.error_on_line(dummy_line(), (0, 1), "the last straw".to_string());
        assert!(matches!(last, Err(CompileError::TooManyErrors)));
        assert_eq!(diags.error_count(), MAX_ERROR_COUNT);
    }
}
