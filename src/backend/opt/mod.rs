//! The optimizer. The inliner is the load-bearing pass; constant folding and
//! dead value elimination mostly clean up after lowering and inlining.

use crate::{
    backend::ir::{BinaryOpcode, CodegenContext, InstData, InstId, UnaryOpcode},
    diag::Context,
};

pub mod inline;

/// Runs the optimization pipeline over the whole context
pub fn optimise(dctx: &Context, ctx: &mut CodegenContext, inline_threshold: isize) {
    fold_constants(ctx);
    inline::run_inliner(dctx, ctx, inline_threshold, true);
    fold_constants(ctx);
    eliminate_dead_values(ctx);
}

/// Expands every call to a forceinline function. Unlike the optimizer's
/// inliner this is not allowed to fail silently: refusals are reported as
/// errors. Returns false when a mandatory inline was refused.
pub fn process_inline_calls(dctx: &Context, ctx: &mut CodegenContext) -> bool {
    !inline::run_inliner(dctx, ctx, -1, false).failed
}

/// Statically evaluates instructions whose operands are immediates,
/// rewriting them into immediates. Runs to a fixpoint so folded values feed
/// further folds.
pub fn fold_constants(ctx: &mut CodegenContext) {
    loop {
        let mut changed = false;

        for inst in ctx.insts.indices().collect::<Vec<_>>() {
            if ctx.insts[inst].block.is_none() {
                continue;
            }

            let folded = match &ctx.insts[inst].data {
                InstData::Binary { op, lhs, rhs } => {
                    let (InstData::Immediate { value: a }, InstData::Immediate { value: b }) =
                        (&ctx.insts[*lhs].data, &ctx.insts[*rhs].data)
                    else {
                        continue;
                    };

                    fold_binary(*op, *a, *b)
                }

                InstData::Unary { op, operand } => {
                    let InstData::Immediate { value } = &ctx.insts[*operand].data else {
                        continue;
                    };

                    match op {
                        UnaryOpcode::Not => Some(!*value),
                        // Width adjustments of known constants are free
                        UnaryOpcode::ZeroExtend
                        | UnaryOpcode::SignExtend
                        | UnaryOpcode::Truncate
                        | UnaryOpcode::Bitcast => Some(*value),
                    }
                }

                _ => continue,
            };

            let Some(value) = folded else {
                continue;
            };

            let width = ctx.insts[inst]
                .ty
                .integer_info(&ctx.target)
                .map(|(bits, _)| bits)
                .unwrap_or(64);
            let value = mask_to_width(value, width);

            ctx.unmark_usees(inst);
            ctx.insts[inst].data = InstData::Immediate { value };
            changed = true;
        }

        if !changed {
            break;
        }
    }
}

fn fold_binary(op: BinaryOpcode, a: u64, b: u64) -> Option<u64> {
    Some(match op {
        BinaryOpcode::Add => a.wrapping_add(b),
        BinaryOpcode::Sub => a.wrapping_sub(b),
        BinaryOpcode::Mul => a.wrapping_mul(b),
        BinaryOpcode::Div => a.checked_div(b)?,
        BinaryOpcode::Mod => a.checked_rem(b)?,
        BinaryOpcode::Shl => a.wrapping_shl(b as u32),
        BinaryOpcode::Sar => (a as i64).wrapping_shr(b as u32) as u64,
        BinaryOpcode::Shr => a.wrapping_shr(b as u32),
        BinaryOpcode::And => a & b,
        BinaryOpcode::Or => a | b,
        BinaryOpcode::Lt => ((a as i64) < b as i64) as u64,
        BinaryOpcode::Le => ((a as i64) <= b as i64) as u64,
        BinaryOpcode::Gt => ((a as i64) > b as i64) as u64,
        BinaryOpcode::Ge => ((a as i64) >= b as i64) as u64,
        BinaryOpcode::Eq => (a == b) as u64,
        BinaryOpcode::Ne => (a != b) as u64,
    })
}

fn mask_to_width(value: u64, bits: usize) -> u64 {
    if bits >= 64 {
        value
    } else {
        value & ((1u64 << bits) - 1)
    }
}

/// Removes pure instructions nobody reads. Stores, calls and terminators
/// always survive.
pub fn eliminate_dead_values(ctx: &mut CodegenContext) {
    loop {
        let mut dead: Vec<InstId> = Vec::new();

        for (id, inst) in ctx.insts.enumerate() {
            if inst.block.is_none() || !inst.users.is_empty() {
                continue;
            }

            let pure = matches!(
                inst.data,
                InstData::Immediate { .. }
                    | InstData::StaticRef { .. }
                    | InstData::FuncRef { .. }
                    | InstData::Copy { .. }
                    | InstData::Load { .. }
                    | InstData::Phi { .. }
                    | InstData::Unary { .. }
                    | InstData::Binary { .. }
            );

            if pure {
                dead.push(id);
            }
        }

        if dead.is_empty() {
            break;
        }

        for inst in dead {
            ctx.remove(inst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::{
            AsmDialect, OutputFormat,
            ir::{parse::parse_ir, print::print_ir, Opcode},
        },
        frontend::SourceFile,
        target::{CallingConvention, Target},
    };
    use indoc::indoc;

    fn context_for(source: &str) -> (Context, CodegenContext) {
        let dctx = Context::new(SourceFile::in_memory(""));
        let mut ctx = CodegenContext::new(
            OutputFormat::Ir,
            AsmDialect::Intel,
            Target::x86_64(CallingConvention::Linux),
        );
        parse_ir(source, &mut ctx).expect("test IR must parse");
        (dctx, ctx)
    }

    #[test]
    fn constant_expression_folds_to_single_immediate() {
        let (dctx, mut ctx) = context_for(indoc! {r#"
            function @main() -> int global sable {
            bb0:
                %0 = immediate int 2
                %1 = immediate int 3
                %2 = immediate int 4
                %3 = mul int %1, %2
                %4 = add int %0, %3
                return %4
            }
        "#});

        optimise(&dctx, &mut ctx, 20);

        let printed = print_ir(&ctx);
        assert!(printed.contains("immediate int 14"), "{printed}");
        assert!(!printed.contains("add"), "{printed}");
        assert!(!printed.contains("mul"), "{printed}");
    }

    #[test]
    fn folding_respects_result_width() {
        let (_, mut ctx) = context_for(indoc! {r#"
            function @main() -> byte sable {
            bb0:
                %0 = immediate byte 200
                %1 = immediate byte 100
                %2 = add byte %0, %1
                return %2
            }
        "#});

        fold_constants(&mut ctx);
        let printed = print_ir(&ctx);
        assert!(printed.contains("immediate byte 44"), "{printed}");
    }

    #[test]
    fn dead_values_are_swept() {
        let (_, mut ctx) = context_for(indoc! {r#"
            function @main() -> int sable {
            bb0:
                %0 = immediate int 1
                %1 = immediate int 2
                %2 = add int %0, %0
                return %1
            }
        "#});

        eliminate_dead_values(&mut ctx);

        let printed = print_ir(&ctx);
        assert!(!printed.contains("add"), "{printed}");
        assert!(!printed.contains("immediate int 1"), "{printed}");
        assert!(printed.contains("immediate int 2"), "{printed}");
    }

    #[test]
    fn optimise_inlines_then_folds_through_the_call() {
        let (dctx, mut ctx) = context_for(indoc! {r#"
            function @g() -> int sable {
            bb0:
                %0 = immediate int 40
                %1 = immediate int 2
                %2 = add int %0, %1
                return %2
            }
            function @f() -> int sable {
            bb0:
                %0 = call int @g()
                return %0
            }
        "#});

        optimise(&dctx, &mut ctx, 20);

        let f = ctx
            .functions
            .iter()
            .find(|f| f.name.value() == "f")
            .unwrap();
        let ops: Vec<Opcode> = f
            .blocks
            .iter()
            .flat_map(|b| &ctx.blocks[*b].insts)
            .map(|i| ctx.insts[*i].opcode())
            .collect();

        assert!(!ops.contains(&Opcode::Call));
        let printed = print_ir(&ctx);
        assert!(printed.contains("immediate int 42"), "{printed}");
    }
}
