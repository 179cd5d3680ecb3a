//! End-to-end tests driving source text through parsing, semantic analysis,
//! lowering and the optimizer.

use indoc::indoc;

use sable::{
    backend::{
        AsmDialect, CodegenOptions, OutputFormat, codegen_ir_input, codegen_module,
        ir::{self, CodegenContext},
        lowering, opt,
    },
    diag::Context,
    frontend::{SourceFile, ast::Module, parser::Parser},
    middle::sema,
    target::{CallingConvention, Target},
};

fn analyse(source: &str) -> (Context, Module, Target) {
    let ctx = Context::new(SourceFile::in_memory(source));
    let mut module = Parser::parse_module(&ctx, "test");
    let target = Target::x86_64(CallingConvention::Linux);
    sema::analyse_module(&ctx, &mut module, &target);
    (ctx, module, target)
}

fn lower(source: &str) -> (Context, CodegenContext) {
    let (ctx, module, target) = analyse(source);
    assert!(!ctx.has_error(), "unexpected sema errors");

    let mut cg = CodegenContext::new(OutputFormat::Ir, AsmDialect::Intel, target);
    lowering::lower_module(&module, &mut cg);
    assert!(ir::validate(&cg).is_empty(), "{:?}", ir::validate(&cg));
    (ctx, cg)
}

#[test]
fn arithmetic_without_optimization_keeps_the_tree() {
    let (_, cg) = lower("2 + 3 * 4");
    let printed = ir::print::print_ir(&cg);

    assert!(printed.contains("mul int"), "{printed}");
    assert!(printed.contains("add int"), "{printed}");
}

#[test]
fn arithmetic_folds_to_fourteen_under_optimization() {
    let (ctx, mut cg) = lower("2 + 3 * 4");
    opt::optimise(&ctx, &mut cg, 20);

    let printed = ir::print::print_ir(&cg);
    assert!(printed.contains("immediate int 14"), "{printed}");
    assert!(!printed.contains("mul"), "{printed}");
}

#[test]
fn value_if_lowers_to_blocks_joined_by_phi() {
    let (_, cg) = lower(indoc! {"
        pick : int(x : bool) {
            if x { 1 } else { 2 }
        }
    "});

    let printed = ir::print::print_ir(&cg);
    assert!(printed.contains("branch_conditional"), "{printed}");
    assert!(printed.contains("phi int [bb1 %"), "{printed}");
}

#[test]
fn summing_loop_lowers_to_cond_and_body_blocks() {
    let (_, cg) = lower(indoc! {"
        sum : int(n : int) {
            total :: 0
            i :: 1
            while i <= n {
                total := total + i
                i := i + 1
            }
            total
        }
    "});

    let printed = ir::print::print_ir(&cg);
    assert!(printed.contains("branch_conditional"), "{printed}");
    // The body branches back up to the condition
    assert!(printed.contains("branch bb1"), "{printed}");
}

#[test]
fn inlining_eliminates_the_call() {
    let (ctx, mut cg) = lower(indoc! {"
        g : int() { 42 }
        f : int() { g() }
    "});

    opt::optimise(&ctx, &mut cg, 20);
    assert!(ir::validate(&cg).is_empty());

    let f = cg.functions.iter().find(|f| f.name.value() == "f").unwrap();
    let has_call = f
        .blocks
        .iter()
        .flat_map(|b| &cg.blocks[*b].insts)
        .any(|i| cg.insts[*i].opcode() == ir::Opcode::Call);
    assert!(!has_call, "the call to g must be gone");

    let printed = ir::print::print_ir(&cg);
    assert!(printed.contains("immediate int 42"), "{printed}");
}

#[test]
fn forced_inlining_of_non_tail_recursion_reports_one_error() {
    let (ctx, module, target) = analyse(indoc! {"
        f : int() inline {
            f() + 1
        }
    "});
    assert!(!ctx.has_error());

    let mut cg = CodegenContext::new(OutputFormat::Ir, AsmDialect::Intel, target);
    lowering::lower_module(&module, &mut cg);
    let before = ir::print::print_ir(&cg);

    let ok = opt::process_inline_calls(&ctx, &mut cg);
    assert!(!ok);
    assert!(ctx.has_error());
    assert_eq!(ir::print::print_ir(&cg), before, "the IR must be unchanged");
}

#[test]
fn byte_result_widens_through_an_inserted_cast() {
    let (_, cg) = lower(indoc! {"
        narrow : byte() { 7 }
        widen : int() { narrow() }
    "});

    let widen = cg
        .functions
        .iter()
        .find(|f| f.name.value() == "widen")
        .unwrap();
    let ops: Vec<_> = widen
        .blocks
        .iter()
        .flat_map(|b| &cg.blocks[*b].insts)
        .map(|i| cg.insts[*i].opcode())
        .collect();

    assert!(
        ops.contains(&ir::Opcode::ZeroExtend),
        "byte widens to int with a zero extension: {ops:?}"
    );
}

#[test]
fn whole_pipeline_emits_assembly() {
    let (ctx, module, target) = analyse(indoc! {r#"
        greeting :: "hello"
        add : int(a : int, b : int) { a + b }
        add(1, 2)
    "#});
    assert!(!ctx.has_error());

    let options = CodegenOptions::default();
    let asm = codegen_module(&ctx, &module, &target, &options).expect("codegen failed");

    assert!(asm.contains(".intel_syntax noprefix"), "{asm}");
    assert!(asm.contains(".globl main"), "{asm}");
    assert!(asm.contains("call add"), "{asm}");
    assert!(asm.contains(".asciz \"hello\""), "{asm}");
}

#[test]
fn textual_ir_round_trips_through_the_driver() {
    let (ctx, module, target) = analyse(indoc! {"
        double : int(x : int) { x + x }
        double(21)
    "});
    assert!(!ctx.has_error());

    let options = CodegenOptions {
        format: OutputFormat::Ir,
        ..Default::default()
    };
    let printed = codegen_module(&ctx, &module, &target, &options).expect("codegen failed");

    // Feed the textual IR back through the ir language path
    let ctx2 = Context::new(SourceFile::in_memory(""));
    let reprinted = codegen_ir_input(&ctx2, &printed, &target, &options).expect("reparse failed");
    assert_eq!(printed, reprinted);
}

#[test]
fn semantic_errors_block_codegen_and_keep_reporting() {
    let (ctx, _, _) = analyse(indoc! {"
        x : bool = 1 + true
        y : byte = 7000
    "});

    assert!(ctx.has_error(), "both declarations are ill-typed");
}

#[test]
fn structs_members_and_compound_literals_compile() {
    let (ctx, mut cg) = lower(indoc! {"
        point :: struct { x : int; y : int }

        p : point
        p.y := 4
        values : int[3] = [1, 2, 3]
        values[1] + p.y
    "});

    opt::optimise(&ctx, &mut cg, 20);
    assert!(ir::validate(&cg).is_empty());

    let printed = ir::print::print_ir(&cg);
    assert!(printed.contains("alloca"), "{printed}");
    assert!(printed.contains("store"), "{printed}");
}
