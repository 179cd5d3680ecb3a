use std::path::PathBuf;

use clap::{CommandFactory, Parser as ClapParser, error::ErrorKind};
use colored::Colorize;

use sable::{
    backend::{AsmDialect, CodegenOptions, OutputFormat, codegen_ir_input, codegen_module},
    diag::{COMPILE_ERROR_EXIT_CODE, Context},
    frontend::{SourceFile, SourceFileOrigin, parser::Parser},
    middle::sema,
    target::{CallingConvention, Target},
};

#[derive(Debug, ClapParser)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Source language of the input files
    #[arg(short = 'l', value_enum, default_value_t = Default::default())]
    language: Language,
    /// Output format
    #[arg(short = 'f', value_enum, default_value_t = Default::default())]
    format: EmitFormat,
    /// Calling convention
    #[arg(short = 'c', value_enum, default_value_t = Default::default())]
    calling_convention: CallConvArg,
    /// Assembly dialect
    #[arg(short = 'd', value_enum, default_value_t = Default::default())]
    dialect: DialectArg,

    /// Run the optimizer (constant folding and inlining)
    #[arg(short = 'O', long = "optimise")]
    optimise: bool,
    /// Dump the IR before and after optimization
    #[arg(long = "debug-ir")]
    debug_ir: bool,

    #[arg(short = 'o')]
    output_path: Option<PathBuf>,
    source_files: Vec<PathBuf>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Language {
    #[default]
    #[value(name = "sable")]
    Sable,
    #[value(name = "ir")]
    Ir,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum EmitFormat {
    #[default]
    #[value(name = "x86_64-gas")]
    X86_64Gas,
    #[value(name = "ir")]
    Ir,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum CallConvArg {
    #[default]
    #[value(name = "linux")]
    Linux,
    #[value(name = "mswin")]
    MsWin,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum DialectArg {
    #[default]
    #[value(name = "intel")]
    Intel,
    #[value(name = "att")]
    Att,
}

fn main() {
    install_ice_hook();

    let args = Args::parse();

    if args.source_files.is_empty() {
        Args::command()
            .error(ErrorKind::MissingRequiredArgument, "Missing source files!")
            .exit();
    }

    for source_file in &args.source_files {
        if !source_file.is_file() {
            Args::command()
                .error(
                    ErrorKind::InvalidValue,
                    format!("Input path '{}' is not a file!", source_file.display()),
                )
                .exit()
        }
    }

    let target = Target::x86_64(match args.calling_convention {
        CallConvArg::Linux => CallingConvention::Linux,
        CallConvArg::MsWin => CallingConvention::MsWin,
    });

    let options = CodegenOptions {
        format: match args.format {
            EmitFormat::X86_64Gas => OutputFormat::X86_64Gas,
            EmitFormat::Ir => OutputFormat::Ir,
        },
        dialect: match args.dialect {
            DialectArg::Intel => AsmDialect::Intel,
            DialectArg::Att => AsmDialect::Att,
        },
        optimise: args.optimise,
        debug_ir: args.debug_ir,
        ..Default::default()
    };

    for path in &args.source_files {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(error) => {
                eprintln!(
                    "{}: could not read '{}': {error}",
                    "fatal error".red().bold(),
                    path.display()
                );
                std::process::exit(sable::diag::FATAL_EXIT_CODE);
            }
        };

        let ctx = Context::new(SourceFile {
            contents,
            origin: SourceFileOrigin::File(path.clone()),
        });

        let output = match args.language {
            Language::Sable => {
                let module_name = path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .unwrap_or("module");

                // Construct the AST and analyse it in place
                let mut module = Parser::parse_module(&ctx, module_name);
                sema::analyse_module(&ctx, &mut module, &target);

                // Lowering and codegen do not run on a module with semantic
                // errors
                if ctx.has_error() {
                    std::process::exit(COMPILE_ERROR_EXIT_CODE);
                }

                codegen_module(&ctx, &module, &target, &options)
            }
            Language::Ir => {
                let source = ctx.source.contents.clone();
                codegen_ir_input(&ctx, &source, &target, &options)
            }
        };

        let Some(output) = output else {
            std::process::exit(COMPILE_ERROR_EXIT_CODE);
        };

        if ctx.has_error() {
            std::process::exit(COMPILE_ERROR_EXIT_CODE);
        }

        let output_path = match &args.output_path {
            Some(path) => path.clone(),
            None => {
                let extension = match options.format {
                    OutputFormat::X86_64Gas => "s",
                    OutputFormat::Ir => "ir",
                };
                path.with_extension(extension)
            }
        };

        if let Err(error) = std::fs::write(&output_path, output) {
            eprintln!(
                "{}: could not write '{}': {error}",
                "fatal error".red().bold(),
                output_path.display()
            );
            std::process::exit(sable::diag::FATAL_EXIT_CODE);
        }
    }
}

/// Internal compiler errors print a styled header and a backtrace; the
/// process exits with the ICE code (the default panic exit status)
fn install_ice_hook() {
    std::panic::set_hook(Box::new(|info| {
        eprintln!("{}: {info}", "internal compiler error".magenta().bold());
        eprintln!("{}", std::backtrace::Backtrace::force_capture());
    }));
}
