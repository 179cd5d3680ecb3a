use std::path::PathBuf;

use colored::Colorize;

use self::lexer::Span;

pub mod ast;
pub mod intern;
pub mod lexer;
pub mod parser;

#[derive(Debug)]
pub struct SourceFile {
    pub contents: String,
    pub origin: SourceFileOrigin,
}

impl SourceFile {
    pub fn in_memory(contents: impl Into<String>) -> Self {
        Self {
            contents: contents.into(),
            origin: SourceFileOrigin::Memory,
        }
    }

    pub fn value_of_span(&self, span: Span) -> &str {
        &self.contents[span.start..span.end]
    }

    /// Computes the 1-based line and column of a byte offset
    pub fn line_and_column(&self, offset: usize) -> (usize, usize) {
        let offset = offset.min(self.contents.len());
        let before = &self.contents[..offset];

        let line = before.matches('\n').count() + 1;
        let column = before
            .rfind('\n')
            .map(|n| offset - n)
            .unwrap_or(offset + 1);

        (line, column)
    }

    pub fn format_span_position(&self, span: Span) -> String {
        let (line, column) = self.line_and_column(span.start);

        format!("{}:{line}:{column}", self.origin)
    }

    /// Prints the source line containing the span with the offending range
    /// underlined by carets
    pub fn highlight_span(&self, span: Span) {
        let line_start = self.contents[..span.start.min(self.contents.len())]
            .rfind('\n')
            .map(|n| n + 1)
            .unwrap_or(0);
        let line_end = self.contents[line_start..]
            .find('\n')
            .map(|n| line_start + n)
            .unwrap_or(self.contents.len());

        let (line_number, _) = self.line_and_column(span.start);
        let gutter = format!("{line_number} | ");

        eprintln!("{}{}", gutter.white(), &self.contents[line_start..line_end]);

        let caret_start = span.start.saturating_sub(line_start);
        let caret_len = (span.end.min(line_end) - span.start.min(line_end)).max(1);

        eprintln!(
            "{}{}",
            " ".repeat(gutter.len() + caret_start),
            "^".repeat(caret_len).red().bold()
        );
    }
}

#[derive(Debug)]
pub enum SourceFileOrigin {
    Memory,
    File(PathBuf),
}

impl core::fmt::Display for SourceFileOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceFileOrigin::Memory => f.write_str("<memory>"),
            SourceFileOrigin::File(path) => f.write_fmt(format_args!("{}", path.display())),
        }
    }
}
