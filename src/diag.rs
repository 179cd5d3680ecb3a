//! Compiler diagnostics. Diagnostics are built through the constructors on
//! [`Diag`] and rendered with an explicit [`Diag::emit`] call. Normal errors
//! set the error flag on the [`Context`] and let compilation continue so that
//! several errors can be reported in one invocation; fatal errors and internal
//! compiler errors terminate the process.

use std::cell::Cell;

use colored::Colorize;

use crate::frontend::{SourceFile, lexer::Span};

pub const COMPILE_ERROR_EXIT_CODE: i32 = 1;
pub const FATAL_EXIT_CODE: i32 = 2;
pub const ICE_EXIT_CODE: i32 = 101;

/// Per-compilation state shared by every pass: the source being compiled and
/// the sticky error flag consumed by the driver.
#[derive(Debug)]
pub struct Context {
    pub source: SourceFile,
    has_error: Cell<bool>,
}

impl Context {
    pub fn new(source: SourceFile) -> Self {
        Self {
            source,
            has_error: Cell::new(false),
        }
    }

    pub fn has_error(&self) -> bool {
        self.has_error.get()
    }

    pub fn set_error(&self) {
        self.has_error.set(true);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagKind {
    /// Internal compiler bug. Always fatal, prints a backtrace.
    Ice,
    /// Fatal user error, exits immediately.
    Fatal,
    /// Normal compilation error. Sets the error flag and continues.
    Error,
    Warning,
    /// Acknowledged unimplemented case.
    Sorry,
    /// Attaches extra information to the previous diagnostic.
    Note,
}

impl DiagKind {
    fn header(self) -> colored::ColoredString {
        match self {
            DiagKind::Ice => "internal compiler error".magenta().bold(),
            DiagKind::Fatal => "fatal error".red().bold(),
            DiagKind::Error => "error".red().bold(),
            DiagKind::Warning => "warning".yellow().bold(),
            DiagKind::Sorry => "sorry, unimplemented".cyan().bold(),
            DiagKind::Note => "note".green().bold(),
        }
    }
}

#[must_use = "A diagnostic does nothing until emit() is called"]
pub struct Diag<'ctx> {
    ctx: Option<&'ctx Context>,
    kind: DiagKind,
    span: Option<Span>,
    message: String,
}

impl<'ctx> Diag<'ctx> {
    pub fn error(ctx: &'ctx Context, span: Span, message: impl Into<String>) -> Self {
        Self {
            ctx: Some(ctx),
            kind: DiagKind::Error,
            span: Some(span),
            message: message.into(),
        }
    }

    pub fn warning(ctx: &'ctx Context, span: Span, message: impl Into<String>) -> Self {
        Self {
            ctx: Some(ctx),
            kind: DiagKind::Warning,
            span: Some(span),
            message: message.into(),
        }
    }

    pub fn note(ctx: &'ctx Context, span: Span, message: impl Into<String>) -> Self {
        Self {
            ctx: Some(ctx),
            kind: DiagKind::Note,
            span: Some(span),
            message: message.into(),
        }
    }

    pub fn sorry(ctx: &'ctx Context, span: Span, message: impl Into<String>) -> Self {
        Self {
            ctx: Some(ctx),
            kind: DiagKind::Sorry,
            span: Some(span),
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Diag<'static> {
        Diag {
            ctx: None,
            kind: DiagKind::Fatal,
            span: None,
            message: message.into(),
        }
    }

    /// Renders the diagnostic and applies its side effects (error flag,
    /// process exit for fatal kinds).
    pub fn emit(self) {
        match (self.ctx, self.span) {
            (Some(ctx), Some(span)) => {
                eprintln!(
                    "{}: {} {}",
                    self.kind.header(),
                    self.message,
                    format!("(at {})", ctx.source.format_span_position(span)).white()
                );
                ctx.source.highlight_span(span);
            }
            _ => eprintln!("{}: {}", self.kind.header(), self.message),
        }

        match self.kind {
            DiagKind::Error | DiagKind::Sorry => {
                if let Some(ctx) = self.ctx {
                    ctx.set_error();
                }
            }
            DiagKind::Fatal => std::process::exit(FATAL_EXIT_CODE),
            DiagKind::Ice => unreachable!("ICEs go through ice_abort"),
            DiagKind::Warning | DiagKind::Note => {}
        }
    }
}

/// Aborts the compiler with an internal-compiler-error report and backtrace.
pub fn ice_abort(message: std::fmt::Arguments<'_>) -> ! {
    eprintln!("{}: {}", DiagKind::Ice.header(), message);
    eprintln!("{}", std::backtrace::Backtrace::force_capture());
    std::process::exit(ICE_EXIT_CODE)
}

macro_rules! ice {
    ($($arg:tt)*) => {
        $crate::diag::ice_abort(format_args!($($arg)*))
    };
}

pub(crate) use ice;
