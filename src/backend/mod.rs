//! Code generation: the typed IR, AST lowering, the optimizer and the
//! x86-64 machine scaffolding.

use crate::{
    diag::{Context, Diag},
    frontend::ast::Module,
    target::Target,
};

pub mod ir;
pub mod lowering;
pub mod mir;
pub mod object;
pub mod opt;
pub mod x86_64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    X86_64Gas,
    Ir,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsmDialect {
    Att,
    Intel,
}

#[derive(Debug, Clone, Copy)]
pub struct CodegenOptions {
    pub format: OutputFormat,
    pub dialect: AsmDialect,
    pub optimise: bool,
    pub debug_ir: bool,
    /// Instruction-count threshold for the optimizer's inliner
    pub inline_threshold: isize,
}

impl Default for CodegenOptions {
    fn default() -> Self {
        Self {
            format: OutputFormat::X86_64Gas,
            dialect: AsmDialect::Intel,
            optimise: false,
            debug_ir: false,
            inline_threshold: 20,
        }
    }
}

/// Runs the whole backend over an analysed module and returns the emitted
/// text (assembly or textual IR). Returns None when a mandatory inlining
/// request could not be satisfied.
pub fn codegen_module(
    ctx: &Context,
    module: &Module,
    target: &Target,
    options: &CodegenOptions,
) -> Option<String> {
    let mut cg = ir::CodegenContext::new(options.format, options.dialect, *target);

    lowering::lower_module(module, &mut cg);

    if options.debug_ir {
        print!("{}", ir::print::print_ir(&cg));
    }

    // Calls to forceinline functions must be expanded even without -O
    if !opt::process_inline_calls(ctx, &mut cg) {
        return None;
    }

    if options.optimise {
        opt::optimise(ctx, &mut cg, options.inline_threshold);

        if options.debug_ir {
            print!("{}", ir::print::print_ir(&cg));
        }
    }

    match options.format {
        OutputFormat::Ir => Some(ir::print::print_ir(&cg)),
        OutputFormat::X86_64Gas => {
            let mir = x86_64::lower_to_mir(&cg);
            Some(x86_64::emit_gas(&cg, &mir, options.dialect))
        }
    }
}

/// Parses textual IR and emits it through the selected backend. Used by the
/// `ir` source language.
pub fn codegen_ir_input(
    ctx: &Context,
    source: &str,
    target: &Target,
    options: &CodegenOptions,
) -> Option<String> {
    let mut cg = ir::CodegenContext::new(options.format, options.dialect, *target);

    if let Err(message) = ir::parse::parse_ir(source, &mut cg) {
        Diag::error(
            ctx,
            crate::frontend::lexer::Span::new(0, 0),
            format!("ir parse error: {message}"),
        )
        .emit();
        return None;
    }

    if !opt::process_inline_calls(ctx, &mut cg) {
        return None;
    }

    if options.optimise {
        opt::optimise(ctx, &mut cg, options.inline_threshold);
    }

    match options.format {
        OutputFormat::Ir => Some(ir::print::print_ir(&cg)),
        OutputFormat::X86_64Gas => {
            let mir = x86_64::lower_to_mir(&cg);
            Some(x86_64::emit_gas(&cg, &mir, options.dialect))
        }
    }
}
