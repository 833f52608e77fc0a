// diag.rs — Unified diagnostics model
//
// Presentation layer shared by the front end, the placement passes and the
// CLI. Typed errors (`PlacementError`) and validation violations are
// converted into `Diagnostic`s for display; library callers that want
// structured data use the typed values directly.
//
// Preconditions: none (types only).
// Postconditions: none (types only).
// Failure modes: none.
// Side effects: none.

use std::fmt;

use crate::ast::Span;

// ── Diagnostic code ──────────────────────────────────────────────────────

/// A stable diagnostic code (e.g., `E0200`, `W0100`).
///
/// Once assigned, a code must never be reassigned to a different meaning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DiagCode(pub &'static str);

impl fmt::Display for DiagCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable diagnostic codes.
///
/// E00xx: graph description front end.
/// E01xx: structural graph errors.
/// E02xx: placement resolution.
/// E03xx: placement validation.
/// W01xx: front-end warnings.
pub mod codes {
    use super::DiagCode;

    pub const E0001: DiagCode = DiagCode("E0001"); // syntax error
    pub const E0002: DiagCode = DiagCode("E0002"); // undefined value
    pub const E0003: DiagCode = DiagCode("E0003"); // duplicate value name
    pub const E0004: DiagCode = DiagCode("E0004"); // malformed device string
    pub const E0005: DiagCode = DiagCode("E0005"); // return outside a branch
    pub const E0006: DiagCode = DiagCode("E0006"); // unknown set directive
    pub const E0007: DiagCode = DiagCode("E0007"); // branch arity mismatch

    pub const E0100: DiagCode = DiagCode("E0100"); // invalid reference

    pub const E0200: DiagCode = DiagCode("E0200"); // placement conflict
    pub const E0201: DiagCode = DiagCode("E0201"); // unresolved group

    pub const E0300: DiagCode = DiagCode("E0300"); // node not placed
    pub const E0301: DiagCode = DiagCode("E0301"); // group without device
    pub const E0302: DiagCode = DiagCode("E0302"); // group spans devices
    pub const E0303: DiagCode = DiagCode("E0303"); // handle crosses devices
    pub const E0304: DiagCode = DiagCode("E0304"); // capture crosses devices
    pub const E0305: DiagCode = DiagCode("E0305"); // conflicting requests in group
    pub const E0306: DiagCode = DiagCode("E0306"); // request not honored

    pub const W0100: DiagCode = DiagCode("W0100"); // unknown operation kind
}

// ── Severity level ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagLevel {
    Error,
    Warning,
}

// ── Related span ─────────────────────────────────────────────────────────

/// A secondary source location providing context for a diagnostic.
#[derive(Debug, Clone)]
pub struct RelatedSpan {
    pub span: Span,
    pub label: String,
}

// ── Diagnostic ───────────────────────────────────────────────────────────

/// A diagnostic emitted by any phase. Graphs built through the API rather
/// than from source text have no spans.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub code: Option<DiagCode>,
    pub level: DiagLevel,
    pub span: Option<Span>,
    pub message: String,
    pub hint: Option<String>,
    pub related_spans: Vec<RelatedSpan>,
}

impl Diagnostic {
    /// Create a new diagnostic with no code, hint, or related spans.
    pub fn new(level: DiagLevel, span: Option<Span>, message: impl Into<String>) -> Self {
        Self {
            code: None,
            level,
            span,
            message: message.into(),
            hint: None,
            related_spans: Vec::new(),
        }
    }

    pub fn error(span: Option<Span>, message: impl Into<String>) -> Self {
        Self::new(DiagLevel::Error, span, message)
    }

    pub fn warning(span: Option<Span>, message: impl Into<String>) -> Self {
        Self::new(DiagLevel::Warning, span, message)
    }

    /// Attach a stable diagnostic code.
    pub fn with_code(mut self, code: DiagCode) -> Self {
        self.code = Some(code);
        self
    }

    /// Attach a remediation hint.
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    /// Attach a related span, if the related item has one.
    pub fn with_related(mut self, span: Option<Span>, label: impl Into<String>) -> Self {
        if let Some(span) = span {
            self.related_spans.push(RelatedSpan {
                span,
                label: label.into(),
            });
        }
        self
    }

    pub fn is_error(&self) -> bool {
        self.level == DiagLevel::Error
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level = match self.level {
            DiagLevel::Error => "error",
            DiagLevel::Warning => "warning",
        };
        if let Some(code) = &self.code {
            write!(f, "{}[{}]: {}", level, code, self.message)?;
        } else {
            write!(f, "{}: {}", level, self.message)?;
        }
        if let Some(hint) = &self.hint {
            write!(f, "\n  hint: {}", hint)?;
        }
        Ok(())
    }
}

/// True if any diagnostic is error-level.
pub fn has_errors(diags: &[Diagnostic]) -> bool {
    diags.iter().any(Diagnostic::is_error)
}

/// Render `diag` with a `line:col` prefix computed from `source`.
pub fn render(diag: &Diagnostic, source: &str, path: &str) -> String {
    use chumsky::span::Span as _;

    match diag.span {
        Some(span) => {
            let (line, col) = line_col(source, span.start());
            format!("{path}:{line}:{col}: {diag}")
        }
        None => format!("{path}: {diag}"),
    }
}

fn line_col(source: &str, offset: usize) -> (usize, usize) {
    let offset = offset.min(source.len());
    let before = &source[..offset];
    let line = before.matches('\n').count() + 1;
    let col = before.rfind('\n').map_or(offset, |nl| offset - nl - 1) + 1;
    (line, col)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_span() -> Span {
        use chumsky::span::Span as _;
        Span::new((), 0..1)
    }

    #[test]
    fn display_without_code() {
        let d = Diagnostic::error(Some(dummy_span()), "something failed");
        assert_eq!(format!("{d}"), "error: something failed");
    }

    #[test]
    fn display_with_code() {
        let d = Diagnostic::warning(None, "unknown op 'Foo'").with_code(codes::W0100);
        assert_eq!(format!("{d}"), "warning[W0100]: unknown op 'Foo'");
    }

    #[test]
    fn builder_chain() {
        let d = Diagnostic::error(Some(dummy_span()), "placement conflict")
            .with_code(codes::E0200)
            .with_hint("remove one of the device requests")
            .with_related(Some(dummy_span()), "other request here")
            .with_related(None, "dropped: no span");

        assert_eq!(d.code, Some(codes::E0200));
        assert_eq!(d.hint.as_deref(), Some("remove one of the device requests"));
        assert_eq!(d.related_spans.len(), 1);
        assert!(has_errors(&[d]));
    }

    #[test]
    fn render_prefixes_line_and_column() {
        use chumsky::span::Span as _;
        let source = "a = Const()\nb = Foo(a)\n";
        let d = Diagnostic::error(Some(Span::new((), 16..19)), "bad");
        assert_eq!(render(&d, source, "g.pgd"), "g.pgd:2:5: error: bad");
        let d = Diagnostic::error(None, "bad");
        assert_eq!(render(&d, source, "g.pgd"), "g.pgd: error: bad");
    }
}
