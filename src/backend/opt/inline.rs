//! The function inliner.
//!
//! Inlining clones a callee's instruction graph into the caller, rewires
//! parameter references onto the call's arguments, and merges the callee's
//! return paths into the caller, preserving use-def links and tail-call
//! semantics throughout. A history of inlining decisions, linked through
//! parent indices, detects inline cycles: if the inlining of a call can be
//! traced back to an inlining of the same function, expanding it would never
//! terminate.

use hashbrown::HashMap;
use std::collections::BTreeSet;

use crate::{
    backend::ir::{
        BlockId, Callee, CodegenContext, FuncId, InstData, InstId, PhiArg,
    },
    diag::{Context, Diag},
    frontend::lexer::Span,
    middle::ty::Type,
};

/// Parent index of a call that was present in the function before this
/// inlining pass started
const ROOT_INLINE_ENTRY: usize = usize::MAX;

#[derive(Debug)]
struct HistoryEntry {
    /// The call instruction this entry describes
    call: InstId,
    /// The function called; None for indirect calls
    callee: Option<FuncId>,
    /// Index of the inlining that introduced this call, or
    /// ROOT_INLINE_ENTRY
    inlined_via: usize,
}

pub struct InlineContext {
    history: Vec<HistoryEntry>,
    /// Calls we have already decided can never be inlined
    not_inlinable: BTreeSet<InstId>,
    /// Inline callees with at most this many instructions. 0 inlines every
    /// call; -1 inlines only forceinline requests.
    threshold: isize,
    /// Whether refusals are silent (true) or user-visible errors (false)
    may_fail: bool,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct InlineResult {
    pub changed: bool,
    pub failed: bool,
}

/// The number of instructions in a function, optionally counting its
/// parameter instructions
fn instruction_count(ctx: &CodegenContext, func: FuncId, include_parameters: bool) -> isize {
    let f = &ctx.functions[func];

    let mut count = f
        .blocks
        .iter()
        .map(|b| ctx.blocks[*b].insts.len())
        .sum::<usize>() as isize;

    if include_parameters {
        count += f.parameters.len() as isize;
    }

    count
}

/// Tries to mark a call as a tail call: the call must be immediately
/// followed by a return whose value is the call (or a bare return for void
/// calls), with no other uses of the call's value.
pub fn try_convert_to_tail_call(ctx: &mut CodegenContext, call: InstId) -> bool {
    let Some(block) = ctx.insts[call].block else {
        return false;
    };

    let insts = &ctx.blocks[block].insts;
    let Some(pos) = insts.iter().position(|i| *i == call) else {
        return false;
    };
    let Some(&next) = insts.get(pos + 1) else {
        return false;
    };

    let convertible = match &ctx.insts[next].data {
        InstData::Return { value: Some(value) } => {
            *value == call && ctx.insts[call].users.len() == 1
        }
        InstData::Return { value: None } => ctx.insts[call].users.is_empty(),
        _ => false,
    };

    if convertible {
        if let InstData::Call { tail_call, .. } = &mut ctx.insts[call].data {
            *tail_call = true;
        }
    }

    convertible
}

/// Expands one call. This always inlines the call if it is possible at all,
/// irrespective of the threshold; the caller decides whether expansion is
/// wanted. Returns false if the call is part of an inline cycle.
fn ir_inline_call(
    dctx: &Context,
    ctx: &mut CodegenContext,
    ictx: &mut InlineContext,
    call: InstId,
) -> bool {
    let InstData::Call {
        callee: Callee::Direct(callee),
        args,
        tail_call: is_tail_call,
    } = ctx.insts[call].data.clone()
    else {
        crate::diag::ice!("inlining a non-direct call");
    };

    let call_block = ctx.insts[call].block.unwrap();
    let caller = ctx.blocks[call_block].function.unwrap();

    /* Degenerate case: the callee is empty */

    let count = instruction_count(ctx, callee, true) as usize;
    if count == 0 {
        assert!(
            ctx.insts[call].users.is_empty(),
            "Call to empty function cannot possibly return a value"
        );
        ctx.remove(call);
        return true;
    }

    /* If the call is not yet in the history, add it as a root. If it is,
     * walk its ancestry: inlining a call that was itself produced by
     * inlining the same callee loops forever. */

    let call_history_index = {
        let existing = ictx.history.iter().position(|e| e.call == call);

        match existing {
            Some(index) => {
                let entry = &ictx.history[index];
                assert_ne!(entry.inlined_via, ROOT_INLINE_ENTRY);

                let mut cursor = entry.inlined_via;
                loop {
                    let parent = &ictx.history[cursor];

                    if parent.callee == Some(callee) {
                        if !ictx.may_fail {
                            Diag::error(
                                dctx,
                                Span::new(0, 0),
                                format!(
                                    "Failed to inline function {} into {}: Infinite loop detected",
                                    ctx.functions[callee].name,
                                    ctx.functions[caller].name,
                                ),
                            )
                            .emit();
                        }
                        return false;
                    }

                    if parent.inlined_via == ROOT_INLINE_ENTRY {
                        break;
                    }
                    cursor = parent.inlined_via;
                }

                index
            }
            None => {
                ictx.history.push(HistoryEntry {
                    call,
                    callee: Some(callee),
                    inlined_via: ROOT_INLINE_ENTRY,
                });
                ictx.history.len() - 1
            }
        }
    };

    /* Detach the call and everything after it from the block */

    let call_pos = ctx.blocks[call_block]
        .insts
        .iter()
        .position(|i| *i == call)
        .unwrap();
    let mut after = ctx.blocks[call_block].insts.split_off(call_pos);
    after.remove(0); // the call itself
    ctx.insts[call].block = None;
    let call_next = after;

    /* Build the skeleton: one fresh instruction per non-parameter callee
     * instruction, and one block per callee block except the first, which
     * maps onto the block containing the call. Parameters map onto the
     * call's arguments through the last N slots of the table. */

    let callee_blocks = ctx.functions[callee].blocks.clone();
    let callee_params = ctx.functions[callee].parameters.clone();
    let n_params = callee_params.len();
    let n_real = count - n_params;

    let mut inst_ids: HashMap<InstId, usize> = HashMap::new();
    let mut block_ids: HashMap<BlockId, usize> = HashMap::new();

    let mut next_inst = 0usize;
    for (i, block) in callee_blocks.iter().enumerate() {
        block_ids.insert(*block, i);
        for inst in &ctx.blocks[*block].insts {
            inst_ids.insert(*inst, next_inst);
            next_inst += 1;
        }
    }
    for (i, param) in callee_params.iter().enumerate() {
        inst_ids.insert(*param, n_real + i);
    }

    let mut map: Vec<InstId> = Vec::with_capacity(count);
    let mut shells: Vec<InstId> = Vec::with_capacity(n_real);
    for _ in 0..n_real {
        let shell = ctx.insts.push(crate::backend::ir::Inst {
            data: InstData::Unreachable,
            ty: Type::void(),
            block: None,
            users: BTreeSet::new(),
        });
        map.push(shell);
        shells.push(shell);
    }
    for i in 0..n_params {
        map.push(args[i]);
    }

    let mut new_blocks: Vec<BlockId> = Vec::with_capacity(callee_blocks.len());
    new_blocks.push(call_block);
    for _ in 1..callee_blocks.len() {
        new_blocks.push(ctx.block_create());
    }

    /* Copy the instructions, rewriting operands through the mapping */

    let last_callee_block = *callee_blocks.last().unwrap();
    let mut return_value: Option<InstId> = None;
    let mut return_block: Option<BlockId> = None;

    for src_block in &callee_blocks {
        let target_block = new_blocks[block_ids[src_block]];
        let src_insts = ctx.blocks[*src_block].insts.clone();

        for src_inst in &src_insts {
            let copy = map[inst_ids[src_inst]];
            let src_data = ctx.insts[*src_inst].data.clone();
            let src_ty = ctx.insts[*src_inst].ty.clone();

            macro_rules! m {
                ($inst:expr) => {
                    map[inst_ids[&$inst]]
                };
            }
            macro_rules! mb {
                ($block:expr) => {
                    new_blocks[block_ids[&$block]]
                };
            }

            let data = match src_data {
                InstData::Parameter { .. } => {
                    crate::diag::ice!("parameter instruction inside a block")
                }

                d @ (InstData::Immediate { .. }
                | InstData::LitInteger { .. }
                | InstData::LitString { .. }
                | InstData::StaticRef { .. }
                | InstData::FuncRef { .. }
                | InstData::Register { .. }
                | InstData::Alloca { .. }
                | InstData::Unreachable) => d,

                InstData::Copy { operand } => InstData::Copy {
                    operand: m!(operand),
                },
                InstData::Load { addr } => InstData::Load { addr: m!(addr) },
                InstData::Unary { op, operand } => InstData::Unary {
                    op,
                    operand: m!(operand),
                },
                InstData::Binary { op, lhs, rhs } => InstData::Binary {
                    op,
                    lhs: m!(lhs),
                    rhs: m!(rhs),
                },
                InstData::Store { value, addr } => InstData::Store {
                    value: m!(value),
                    addr: m!(addr),
                },
                InstData::Branch { target } => InstData::Branch {
                    target: mb!(target),
                },
                InstData::CondBranch {
                    condition,
                    then_block,
                    else_block,
                } => InstData::CondBranch {
                    condition: m!(condition),
                    then_block: mb!(then_block),
                    else_block: mb!(else_block),
                },
                InstData::Phi { args } => InstData::Phi {
                    args: args
                        .iter()
                        .map(|arg| PhiArg {
                            block: mb!(arg.block),
                            value: m!(arg.value),
                        })
                        .collect(),
                },

                InstData::Intrinsic { intrinsic, args } => InstData::Intrinsic {
                    intrinsic,
                    args: args.iter().map(|a| m!(*a)).collect(),
                },

                InstData::Call {
                    callee: inner_callee,
                    args: inner_args,
                    tail_call,
                } => {
                    /* Record where this call came from so cycles are
                     * detectable */
                    ictx.history.push(HistoryEntry {
                        call: copy,
                        callee: match inner_callee {
                            Callee::Direct(f) => Some(f),
                            Callee::Indirect(_) => None,
                        },
                        inlined_via: call_history_index,
                    });

                    InstData::Call {
                        callee: match inner_callee {
                            Callee::Direct(f) => Callee::Direct(f),
                            Callee::Indirect(i) => Callee::Indirect(m!(i)),
                        },
                        args: inner_args.iter().map(|a| m!(*a)).collect(),
                        // An inner tail call is only still a tail call if
                        // the call being expanded was one
                        tail_call: tail_call && is_tail_call,
                    }
                }

                /* Returns become the inlined value or branches into a
                 * dedicated return block */
                InstData::Return { value } => {
                    if is_tail_call {
                        // The caller returns right after; copy the return
                        // verbatim
                        InstData::Return {
                            value: value.map(|v| m!(v)),
                        }
                    } else {
                        let is_last = *src_block == last_callee_block
                            && Some(src_inst) == src_insts.last();

                        if return_block.is_none() && is_last {
                            // A single trailing return: its operand is the
                            // inlined value, the return itself is dropped
                            if let Some(v) = value {
                                return_value = Some(m!(v));
                                map[inst_ids[src_inst]] = call;
                            }
                            continue;
                        }

                        if return_block.is_none() {
                            let rb = ctx.block_create();
                            return_block = Some(rb);

                            if value.is_some() {
                                let phi = ctx.insts.push(crate::backend::ir::Inst {
                                    data: InstData::Phi { args: Vec::new() },
                                    ty: ctx.insts[call].ty.clone(),
                                    block: None,
                                    users: BTreeSet::new(),
                                });
                                ctx.force_insert_into(rb, phi);
                                return_value = Some(phi);
                            }
                        }

                        if let Some(v) = value {
                            let phi = return_value.unwrap();
                            let mapped = m!(v);
                            let InstData::Phi { args } = &mut ctx.insts[phi].data else {
                                unreachable!();
                            };
                            args.push(PhiArg {
                                block: target_block,
                                value: mapped,
                            });
                            ctx.mark_used(mapped, phi);
                            map[inst_ids[src_inst]] = call;
                        }

                        InstData::Branch {
                            target: return_block.unwrap(),
                        }
                    }
                }
            };

            ctx.insts[copy].data = data;
            ctx.insts[copy].ty = src_ty;
            ctx.force_insert_into(target_block, copy);
        }
    }

    /* Reconstruct use-def links from the callee's graph */

    let all_callee_insts: Vec<InstId> = callee_params
        .iter()
        .copied()
        .chain(
            callee_blocks
                .iter()
                .flat_map(|b| ctx.blocks[*b].insts.clone()),
        )
        .collect();

    for src_inst in all_callee_insts {
        let copy = map[inst_ids[&src_inst]];
        let users: Vec<InstId> = ctx.insts[src_inst].users.iter().copied().collect();

        for user in users {
            if let Some(user_slot) = inst_ids.get(&user) {
                let mapped_user = map[*user_slot];

                // Dropped returns map onto the call itself; the call is
                // about to be replaced, so it must not appear as a user
                if mapped_user == call {
                    continue;
                }

                ctx.mark_used(copy, mapped_user);
            }
        }
    }

    /* Replace all uses of the call with the inlined return value */

    if let Some(rv) = return_value {
        ctx.remove_use(rv, call);
        ctx.replace_uses(call, rv);
    }

    /* The return block, if any, goes after the last inlined block */

    if let Some(rb) = return_block {
        new_blocks.push(rb);
    }

    /* Reconnect the instructions that followed the call; a tail call
     * removes them instead since the function returns inside the inlined
     * body. This happens before the call is deleted so that a removed
     * trailing return releases its use of the call first. */

    let last_block = *new_blocks.last().unwrap();
    if is_tail_call {
        for inst in &call_next {
            ctx.unmark_usees(*inst);
        }
        for inst in call_next {
            ctx.insts[inst].users.clear();
            ctx.insts[inst].block = None;
            ctx.removed.push(inst);
        }
    } else {
        for inst in &call_next {
            ctx.insts[*inst].block = Some(last_block);
        }
        ctx.blocks[last_block].insts.extend(call_next);
    }

    ctx.remove(call);

    /* Attach and splice the new blocks into the caller at the call site */

    for block in new_blocks.iter().skip(1) {
        ctx.blocks[*block].function = Some(caller);
    }

    let insert_at = ctx.functions[caller]
        .blocks
        .iter()
        .position(|b| *b == call_block)
        .unwrap();
    ctx.functions[caller]
        .blocks
        .splice(insert_at + 1..insert_at + 1, new_blocks[1..].iter().copied());

    /* Free skeleton instructions that were never attached (parameter slots
     * and dropped returns) */

    for shell in shells {
        if ctx.insts[shell].block.is_none() && ctx.insts[shell].users.is_empty() {
            ctx.removed.push(shell);
        }
    }

    true
}

fn inline_calls_in_function(
    dctx: &Context,
    ctx: &mut CodegenContext,
    ictx: &mut InlineContext,
    func: FuncId,
) -> InlineResult {
    let mut res = InlineResult::default();
    ictx.history.clear();

    /* Each successful inlining may add blocks, so restart from the entry
     * after every change */

    'restart: loop {
        for block in ctx.functions[func].blocks.clone() {
            for inst in ctx.blocks[block].insts.clone() {
                let InstData::Call {
                    callee: Callee::Direct(callee),
                    tail_call,
                    ..
                } = ctx.insts[inst].data
                else {
                    continue;
                };

                /* Skip calls to external functions and calls we already gave
                 * up on */

                if ctx.functions[callee].is_extern {
                    continue;
                }
                if ctx.functions[callee]
                    .ty
                    .as_function()
                    .is_some_and(|f| f.variadic)
                {
                    continue;
                }
                if ictx.not_inlinable.contains(&inst) {
                    continue;
                }

                let must_inline =
                    ctx.functions[callee].attr_forceinline || ictx.threshold == 0;

                if !must_inline && ictx.threshold < instruction_count(ctx, callee, false) {
                    continue;
                }

                /* Self-recursion is only inlined as a tail call */

                if func == callee {
                    if !tail_call {
                        if must_inline && !try_convert_to_tail_call(ctx, inst) {
                            if !ictx.may_fail {
                                Diag::error(
                                    dctx,
                                    Span::new(0, 0),
                                    "Sorry, could not inline non-tail-recursive call",
                                )
                                .emit();
                            }
                            res.failed = true;
                            ictx.not_inlinable.insert(inst);
                        }
                    }

                    // Tail recursion is better than inlining, so leave
                    // tail-recursive calls alone
                    continue;
                }

                if ir_inline_call(dctx, ctx, ictx, inst) {
                    res.changed = true;
                } else {
                    res.failed = true;
                    ictx.not_inlinable.insert(inst);
                }

                continue 'restart;
            }
        }

        break;
    }

    res
}

/// Runs the inliner over every function.
///
/// `threshold` is measured in callee instructions (excluding parameters):
/// 0 inlines every call, -1 inlines only calls to forceinline functions,
/// a positive value inlines callees at most that large. When `may_fail` is
/// false, refusals (infinite inline loops, non-convertible self-recursion)
/// are user-visible errors.
pub fn run_inliner(
    dctx: &Context,
    ctx: &mut CodegenContext,
    threshold: isize,
    may_fail: bool,
) -> InlineResult {
    let mut ictx = InlineContext {
        history: Vec::new(),
        not_inlinable: BTreeSet::new(),
        threshold,
        may_fail,
    };

    let mut res = InlineResult::default();
    for func in ctx.functions.indices().collect::<Vec<_>>() {
        if ctx.functions[func].is_extern {
            continue;
        }

        let r = inline_calls_in_function(dctx, ctx, &mut ictx, func);
        res.changed |= r.changed;
        res.failed |= r.failed;
    }

    res
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::{
            AsmDialect, OutputFormat,
            ir::{parse::parse_ir, print::print_ir, validate, Opcode},
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

    fn opcodes(ctx: &CodegenContext, name: &str) -> Vec<Opcode> {
        let func = ctx
            .functions
            .iter()
            .find(|f| f.name.value() == name)
            .unwrap();
        func.blocks
            .iter()
            .flat_map(|b| &ctx.blocks[*b].insts)
            .map(|i| ctx.insts[*i].opcode())
            .collect()
    }

    #[test]
    fn trivial_callee_is_inlined_away() {
        let (dctx, mut ctx) = context_for(indoc! {r#"
            function @g() -> int sable {
            bb0:
                %0 = immediate int 42
                return %0
            }
            function @f() -> int sable {
            bb0:
                %0 = call int @g()
                return %0
            }
        "#});

        let res = run_inliner(&dctx, &mut ctx, 0, true);
        assert!(res.changed);
        assert!(!res.failed);

        let ops = opcodes(&ctx, "f");
        assert!(!ops.contains(&Opcode::Call), "call was not inlined: {ops:?}");
        assert!(ops.contains(&Opcode::Immediate));
        assert!(validate(&ctx).is_empty(), "{:?}", validate(&ctx));

        // f returns the callee's 42 directly
        let printed = print_ir(&ctx);
        assert!(printed.contains("immediate int 42"));
    }

    #[test]
    fn parameters_map_to_arguments() {
        let (dctx, mut ctx) = context_for(indoc! {r#"
            function @add1(%0 : int) -> int sable {
            bb0:
                %1 = immediate int 1
                %2 = add int %0, %1
                return %2
            }
            function @f(%0 : int) -> int sable {
            bb0:
                %1 = call int @add1(%0)
                return %1
            }
        "#});

        let res = run_inliner(&dctx, &mut ctx, 0, true);
        assert!(res.changed);
        assert!(validate(&ctx).is_empty(), "{:?}", validate(&ctx));

        // The inlined add reads f's own parameter
        let f = ctx
            .functions
            .iter()
            .find(|f| f.name.value() == "f")
            .unwrap();
        let param = f.parameters[0];
        let add = f
            .blocks
            .iter()
            .flat_map(|b| &ctx.blocks[*b].insts)
            .copied()
            .find(|i| ctx.insts[*i].opcode() == Opcode::Add)
            .expect("inlined add is missing");
        assert!(ctx.insts[add].operands().contains(&param));
    }

    #[test]
    fn multi_return_callee_merges_through_phi() {
        let (dctx, mut ctx) = context_for(indoc! {r#"
            function @pick(%0 : bool) -> int sable {
            bb0:
                branch_conditional %0 bb1 bb2
            bb1:
                %1 = immediate int 1
                return %1
            bb2:
                %2 = immediate int 2
                return %2
            }
            function @f(%0 : bool) -> int sable {
            bb0:
                %1 = call int @pick(%0)
                %2 = immediate int 10
                %3 = add int %1, %2
                return %3
            }
        "#});

        let res = run_inliner(&dctx, &mut ctx, 0, true);
        assert!(res.changed);
        assert!(!res.failed);
        assert!(validate(&ctx).is_empty(), "{:?}", validate(&ctx));

        let ops = opcodes(&ctx, "f");
        assert!(!ops.contains(&Opcode::Call));
        assert!(
            ops.contains(&Opcode::Phi),
            "multiple returns must merge through a phi: {ops:?}"
        );

        // The add now reads the phi
        let f = ctx
            .functions
            .iter()
            .find(|f| f.name.value() == "f")
            .unwrap();
        let phi = f
            .blocks
            .iter()
            .flat_map(|b| &ctx.blocks[*b].insts)
            .copied()
            .find(|i| ctx.insts[*i].opcode() == Opcode::Phi)
            .unwrap();
        let add = f
            .blocks
            .iter()
            .flat_map(|b| &ctx.blocks[*b].insts)
            .copied()
            .find(|i| ctx.insts[*i].opcode() == Opcode::Add)
            .unwrap();
        assert!(ctx.insts[phi].users.contains(&add));
    }

    #[test]
    fn non_tail_self_recursion_is_refused_with_error() {
        let (dctx, mut ctx) = context_for(indoc! {r#"
            function @f() -> int forceinline sable {
            bb0:
                %0 = call int @f()
                %1 = immediate int 1
                %2 = add int %0, %1
                return %2
            }
        "#});

        let before = print_ir(&ctx);
        let res = run_inliner(&dctx, &mut ctx, -1, false);
        assert!(res.failed);
        assert!(dctx.has_error(), "refusal must be a user-visible error");
        assert_eq!(print_ir(&ctx), before, "the IR must be unchanged");
    }

    #[test]
    fn tail_recursive_self_call_is_left_alone() {
        let (dctx, mut ctx) = context_for(indoc! {r#"
            function @loop_forever(%0 : int) -> int sable {
            bb0:
                %1 = tail call int @loop_forever(%0)
                return %1
            }
        "#});

        let res = run_inliner(&dctx, &mut ctx, 0, true);
        assert!(!res.changed);
        assert!(!res.failed);

        let ops = opcodes(&ctx, "loop_forever");
        assert!(ops.contains(&Opcode::Call));
    }

    #[test]
    fn self_recursive_return_position_call_converts_to_tail_call() {
        let (dctx, mut ctx) = context_for(indoc! {r#"
            function @f(%0 : int) -> int forceinline sable {
            bb0:
                %1 = call int @f(%0)
                return %1
            }
        "#});

        let res = run_inliner(&dctx, &mut ctx, -1, false);
        assert!(!res.failed, "return-position self call converts to a tail call");
        assert!(!dctx.has_error());

        let printed = print_ir(&ctx);
        assert!(printed.contains("tail call"));
    }

    #[test]
    fn inline_cycle_is_detected_through_the_history() {
        let (dctx, mut ctx) = context_for(indoc! {r#"
            function @a() -> int sable {
            bb0:
                %0 = call int @b()
                return %0
            }
            function @b() -> int sable {
            bb0:
                %0 = call int @c()
                return %0
            }
            function @c() -> int sable {
            bb0:
                %0 = call int @b()
                %1 = immediate int 1
                %2 = add int %0, %1
                return %2
            }
        "#});

        // threshold 0 forces inlining everywhere; expanding a pulls in b,
        // then c, then b again. The ancestry walk must cut the b -> c -> b
        // chain instead of looping forever.
        let res = run_inliner(&dctx, &mut ctx, 0, true);
        assert!(res.failed);
        assert!(validate(&ctx).is_empty(), "{:?}", validate(&ctx));
    }

    #[test]
    fn inliner_is_idempotent() {
        let (dctx, mut ctx) = context_for(indoc! {r#"
            function @g(%0 : int) -> int sable {
            bb0:
                %1 = immediate int 2
                %2 = mul int %0, %1
                return %2
            }
            function @f(%0 : int) -> int sable {
            bb0:
                %1 = call int @g(%0)
                return %1
            }
        "#});

        let first = run_inliner(&dctx, &mut ctx, 0, true);
        assert!(first.changed);
        let after_first = print_ir(&ctx);

        let second = run_inliner(&dctx, &mut ctx, 0, true);
        assert!(!second.changed, "second run must make no further changes");
        assert_eq!(print_ir(&ctx), after_first);
    }

    #[test]
    fn threshold_bounds_inlining_by_callee_size() {
        let source = indoc! {r#"
            function @big(%0 : int) -> int sable {
            bb0:
                %1 = immediate int 1
                %2 = add int %0, %1
                %3 = add int %2, %1
                %4 = add int %3, %1
                %5 = add int %4, %1
                return %5
            }
            function @f(%0 : int) -> int sable {
            bb0:
                %1 = call int @big(%0)
                return %1
            }
        "#};

        // big has 6 instructions (excluding its parameter)
        let (dctx, mut ctx) = context_for(source);
        let res = run_inliner(&dctx, &mut ctx, 3, true);
        assert!(!res.changed, "threshold 3 must not inline a 6-instruction callee");

        let (dctx, mut ctx) = context_for(source);
        let res = run_inliner(&dctx, &mut ctx, 6, true);
        assert!(res.changed, "threshold 6 must inline a 6-instruction callee");
        assert!(validate(&ctx).is_empty(), "{:?}", validate(&ctx));
    }

    #[test]
    fn instructions_after_the_call_move_to_the_last_inlined_block() {
        let (dctx, mut ctx) = context_for(indoc! {r#"
            function @pick(%0 : bool) -> int sable {
            bb0:
                branch_conditional %0 bb1 bb2
            bb1:
                %1 = immediate int 1
                return %1
            bb2:
                %2 = immediate int 2
                return %2
            }
            function @f(%0 : bool) -> int sable {
            bb0:
                %1 = call int @pick(%0)
                %2 = immediate int 3
                %3 = add int %1, %2
                return %3
            }
        "#});

        run_inliner(&dctx, &mut ctx, 0, true);
        assert!(validate(&ctx).is_empty(), "{:?}", validate(&ctx));

        // Every block of f is closed and the function still returns the sum
        let f = ctx
            .functions
            .iter()
            .find(|f| f.name.value() == "f")
            .unwrap();
        for block in &f.blocks {
            assert!(ctx.is_closed(*block));
        }
    }
}
