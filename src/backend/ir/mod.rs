//! The intermediate representation.
//!
//! Functions, blocks, instructions and static variables all live in arenas
//! owned by the [`CodegenContext`]; cross-links are arena indices. Use-def
//! information is kept symmetric through [`CodegenContext::mark_used`] and
//! [`CodegenContext::remove_use`]: if A reads B then B's user set contains A.

use std::collections::BTreeSet;

use crate::{
    backend::{AsmDialect, OutputFormat},
    diag::ice,
    frontend::{ast::Intrinsic, intern::InternedSymbol},
    index::{IndexVec, simple_index},
    middle::ty::{CallConv, Type},
    target::Target,
};

pub mod parse;
pub mod print;

simple_index! {
    pub struct FuncId;
}

simple_index! {
    pub struct BlockId;
}

simple_index! {
    pub struct InstId;
}

simple_index! {
    pub struct StaticId;
}

#[derive(Debug)]
pub struct IrFunction {
    pub name: InternedSymbol,
    /// The function's full type (parameters, return type, calling
    /// convention, variadic flag)
    pub ty: Type,
    pub blocks: Vec<BlockId>,
    /// One `Parameter` instruction per parameter; these are referenced by
    /// index and never appear inside blocks
    pub parameters: Vec<InstId>,
    pub is_extern: bool,
    pub attr_global: bool,
    pub attr_forceinline: bool,
    pub call_conv: CallConv,
}

impl IrFunction {
    pub fn return_type(&self) -> Type {
        self.ty
            .as_function()
            .map(|f| f.ret.clone())
            .unwrap_or_else(Type::void)
    }
}

#[derive(Debug)]
pub struct Block {
    pub function: Option<FuncId>,
    pub insts: Vec<InstId>,
}

#[derive(Debug)]
pub struct StaticVariable {
    pub name: InternedSymbol,
    pub ty: Type,
    /// An unattached `LitInteger` / `LitString` instruction, if the variable
    /// has a constant initializer
    pub init: Option<InstId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOpcode {
    Not,
    ZeroExtend,
    SignExtend,
    Truncate,
    Bitcast,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOpcode {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Shl,
    Sar,
    Shr,
    And,
    Or,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl BinaryOpcode {
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinaryOpcode::Lt
                | BinaryOpcode::Le
                | BinaryOpcode::Gt
                | BinaryOpcode::Ge
                | BinaryOpcode::Eq
                | BinaryOpcode::Ne
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Callee {
    Direct(FuncId),
    Indirect(InstId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhiArg {
    pub block: BlockId,
    pub value: InstId,
}

#[derive(Debug, Clone)]
pub enum InstData {
    Immediate {
        value: u64,
    },
    /// Static initializer payloads; never inside a block
    LitInteger {
        value: u64,
    },
    LitString {
        index: usize,
    },
    StaticRef {
        var: StaticId,
    },
    FuncRef {
        func: FuncId,
    },
    Parameter {
        index: usize,
    },
    /// A value pinned to a machine register by the backend
    Register {
        register: u32,
    },
    Copy {
        operand: InstId,
    },
    Load {
        addr: InstId,
    },
    Store {
        value: InstId,
        addr: InstId,
    },
    Alloca {
        allocated: Type,
    },
    Phi {
        args: Vec<PhiArg>,
    },
    Branch {
        target: BlockId,
    },
    CondBranch {
        condition: InstId,
        then_block: BlockId,
        else_block: BlockId,
    },
    Return {
        value: Option<InstId>,
    },
    Unreachable,
    Call {
        callee: Callee,
        args: Vec<InstId>,
        tail_call: bool,
    },
    Intrinsic {
        intrinsic: Intrinsic,
        args: Vec<InstId>,
    },
    Unary {
        op: UnaryOpcode,
        operand: InstId,
    },
    Binary {
        op: BinaryOpcode,
        lhs: InstId,
        rhs: InstId,
    },
}

/// The stable opcode classification. Every pass may rely on this set; the
/// `COUNT` sentinel is available through `strum::EnumCount`.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    strum::EnumCount,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "snake_case")]
pub enum Opcode {
    Immediate,
    LitInteger,
    LitString,
    StaticRef,
    FuncRef,
    Parameter,
    Register,
    Copy,
    Load,
    Store,
    Alloca,
    Phi,
    Branch,
    BranchConditional,
    Return,
    Unreachable,
    Call,
    Intrinsic,
    Not,
    ZeroExtend,
    SignExtend,
    Truncate,
    Bitcast,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Shl,
    Sar,
    Shr,
    And,
    Or,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

#[derive(Debug)]
pub struct Inst {
    pub data: InstData,
    pub ty: Type,
    /// The owning block; None for parameters, static initializers and
    /// instructions sitting on the removed list
    pub block: Option<BlockId>,
    /// Instructions that read this value
    pub users: BTreeSet<InstId>,
}

impl Inst {
    pub fn opcode(&self) -> Opcode {
        match &self.data {
            InstData::Immediate { .. } => Opcode::Immediate,
            InstData::LitInteger { .. } => Opcode::LitInteger,
            InstData::LitString { .. } => Opcode::LitString,
            InstData::StaticRef { .. } => Opcode::StaticRef,
            InstData::FuncRef { .. } => Opcode::FuncRef,
            InstData::Parameter { .. } => Opcode::Parameter,
            InstData::Register { .. } => Opcode::Register,
            InstData::Copy { .. } => Opcode::Copy,
            InstData::Load { .. } => Opcode::Load,
            InstData::Store { .. } => Opcode::Store,
            InstData::Alloca { .. } => Opcode::Alloca,
            InstData::Phi { .. } => Opcode::Phi,
            InstData::Branch { .. } => Opcode::Branch,
            InstData::CondBranch { .. } => Opcode::BranchConditional,
            InstData::Return { .. } => Opcode::Return,
            InstData::Unreachable => Opcode::Unreachable,
            InstData::Call { .. } => Opcode::Call,
            InstData::Intrinsic { .. } => Opcode::Intrinsic,
            InstData::Unary { op, .. } => match op {
                UnaryOpcode::Not => Opcode::Not,
                UnaryOpcode::ZeroExtend => Opcode::ZeroExtend,
                UnaryOpcode::SignExtend => Opcode::SignExtend,
                UnaryOpcode::Truncate => Opcode::Truncate,
                UnaryOpcode::Bitcast => Opcode::Bitcast,
            },
            InstData::Binary { op, .. } => match op {
                BinaryOpcode::Add => Opcode::Add,
                BinaryOpcode::Sub => Opcode::Sub,
                BinaryOpcode::Mul => Opcode::Mul,
                BinaryOpcode::Div => Opcode::Div,
                BinaryOpcode::Mod => Opcode::Mod,
                BinaryOpcode::Shl => Opcode::Shl,
                BinaryOpcode::Sar => Opcode::Sar,
                BinaryOpcode::Shr => Opcode::Shr,
                BinaryOpcode::And => Opcode::And,
                BinaryOpcode::Or => Opcode::Or,
                BinaryOpcode::Lt => Opcode::Lt,
                BinaryOpcode::Le => Opcode::Le,
                BinaryOpcode::Gt => Opcode::Gt,
                BinaryOpcode::Ge => Opcode::Ge,
                BinaryOpcode::Eq => Opcode::Eq,
                BinaryOpcode::Ne => Opcode::Ne,
            },
        }
    }

    pub fn is_terminator(&self) -> bool {
        matches!(
            self.data,
            InstData::Branch { .. }
                | InstData::CondBranch { .. }
                | InstData::Return { .. }
                | InstData::Unreachable
        )
    }

    /// Whether this instruction produces a value other instructions can read
    pub fn produces_value(&self) -> bool {
        !matches!(
            self.data,
            InstData::Store { .. }
                | InstData::Branch { .. }
                | InstData::CondBranch { .. }
                | InstData::Return { .. }
                | InstData::Unreachable
        )
    }

    /// Every instruction operand (not including block targets)
    pub fn operands(&self) -> Vec<InstId> {
        match &self.data {
            InstData::Immediate { .. }
            | InstData::LitInteger { .. }
            | InstData::LitString { .. }
            | InstData::StaticRef { .. }
            | InstData::FuncRef { .. }
            | InstData::Parameter { .. }
            | InstData::Register { .. }
            | InstData::Alloca { .. }
            | InstData::Branch { .. }
            | InstData::Unreachable => Vec::new(),

            InstData::Copy { operand }
            | InstData::Load { addr: operand }
            | InstData::Unary { operand, .. } => vec![*operand],

            InstData::Store { value, addr } => vec![*value, *addr],
            InstData::Binary { lhs, rhs, .. } => vec![*lhs, *rhs],

            InstData::Phi { args } => args.iter().map(|a| a.value).collect(),

            InstData::CondBranch { condition, .. } => vec![*condition],
            InstData::Return { value } => value.iter().copied().collect(),

            InstData::Call { callee, args, .. } => {
                let mut operands: Vec<InstId> = args.clone();
                if let Callee::Indirect(inst) = callee {
                    operands.push(*inst);
                }
                operands
            }
            InstData::Intrinsic { args, .. } => args.clone(),
        }
    }
}

#[derive(Debug)]
pub struct CodegenContext {
    pub functions: IndexVec<FuncId, IrFunction>,
    pub blocks: IndexVec<BlockId, Block>,
    pub insts: IndexVec<InstId, Inst>,
    pub statics: IndexVec<StaticId, StaticVariable>,
    /// String literal data referenced by `LitString` initializers
    pub strings: Vec<InternedSymbol>,
    /// Instructions detached from their blocks but not yet freed
    pub removed: Vec<InstId>,

    /// Lowering cursor
    pub function: Option<FuncId>,
    pub block: Option<BlockId>,

    pub format: OutputFormat,
    pub dialect: AsmDialect,
    pub target: Target,

    /// Names anonymous string literal statics; per-context, not global
    string_literal_count: usize,
}

impl CodegenContext {
    pub fn new(format: OutputFormat, dialect: AsmDialect, target: Target) -> Self {
        Self {
            functions: IndexVec::new(),
            blocks: IndexVec::new(),
            insts: IndexVec::new(),
            statics: IndexVec::new(),
            strings: Vec::new(),
            removed: Vec::new(),
            function: None,
            block: None,
            format,
            dialect,
            target,
            string_literal_count: 0,
        }
    }

    pub fn inst(&self, id: InstId) -> &Inst {
        &self.insts[id]
    }

    pub fn next_string_literal_name(&mut self) -> InternedSymbol {
        let name = format!("__str_lit{}", self.string_literal_count);
        self.string_literal_count += 1;
        InternedSymbol::new(&name)
    }

    pub fn intern_string(&mut self, value: InternedSymbol) -> usize {
        if let Some(index) = self.strings.iter().position(|s| *s == value) {
            return index;
        }
        self.strings.push(value);
        self.strings.len() - 1
    }

    /* Functions and blocks */

    pub fn create_function(&mut self, name: InternedSymbol, ty: Type) -> FuncId {
        let call_conv = ty
            .as_function()
            .map(|f| f.call_conv)
            .unwrap_or(CallConv::Sable);

        let func = self.functions.push(IrFunction {
            name,
            ty: ty.clone(),
            blocks: Vec::new(),
            parameters: Vec::new(),
            is_extern: false,
            attr_global: false,
            attr_forceinline: false,
            call_conv,
        });

        /* Parameter instructions, referenced by index */

        if let Some(f) = ty.as_function() {
            let params: Vec<InstId> = f
                .params
                .iter()
                .enumerate()
                .map(|(index, param)| {
                    self.insts.push(Inst {
                        data: InstData::Parameter { index },
                        ty: param.ty.clone(),
                        block: None,
                        users: BTreeSet::new(),
                    })
                })
                .collect();
            self.functions[func].parameters = params;
        }

        /* Entry block */

        let entry = self.block_create();
        self.attach_block_to(func, entry);

        func
    }

    pub fn block_create(&mut self) -> BlockId {
        self.blocks.push(Block {
            function: None,
            insts: Vec::new(),
        })
    }

    /// Appends a block to the current function and makes it the insertion
    /// point
    pub fn block_attach(&mut self, block: BlockId) {
        let func = self
            .function
            .unwrap_or_else(|| ice!("block_attach with no current function"));
        self.attach_block_to(func, block);
    }

    pub fn attach_block_to(&mut self, func: FuncId, block: BlockId) {
        assert!(
            self.blocks[block].function.is_none(),
            "block is already attached"
        );
        self.blocks[block].function = Some(func);
        self.functions[func].blocks.push(block);
        self.function = Some(func);
        self.block = Some(block);
    }

    /// A block is closed iff its last instruction is a terminator
    pub fn is_closed(&self, block: BlockId) -> bool {
        self.blocks[block]
            .insts
            .last()
            .is_some_and(|last| self.insts[*last].is_terminator())
    }

    /* Use lists */

    pub fn mark_used(&mut self, value: InstId, user: InstId) {
        self.insts[value].users.insert(user);
    }

    pub fn remove_use(&mut self, value: InstId, user: InstId) {
        self.insts[value].users.remove(&user);
    }

    /// Removes `inst` from the user sets of everything it reads
    pub fn unmark_usees(&mut self, inst: InstId) {
        for operand in self.insts[inst].operands() {
            self.remove_use(operand, inst);
        }
    }

    /// Replaces every use of `old` with `new`, updating both operand slots
    /// and user sets
    pub fn replace_uses(&mut self, old: InstId, new: InstId) {
        let users: Vec<InstId> = self.insts[old].users.iter().copied().collect();

        for user in users {
            let data = &mut self.insts[user].data;
            replace_operand(data, old, new);
            self.insts[new].users.insert(user);
        }

        self.insts[old].users.clear();
    }

    /// Detaches an instruction from its block and parks it on the removed
    /// list. The instruction must have no remaining users.
    pub fn remove(&mut self, inst: InstId) {
        assert!(
            self.insts[inst].users.is_empty(),
            "cannot remove an instruction that still has users"
        );

        self.unmark_usees(inst);

        if let Some(block) = self.insts[inst].block.take() {
            self.blocks[block].insts.retain(|i| *i != inst);
        }

        self.removed.push(inst);
    }

    /* Instruction builders */

    fn alloc_inst(&mut self, data: InstData, ty: Type) -> InstId {
        let id = self.insts.push(Inst {
            data,
            ty,
            block: None,
            users: BTreeSet::new(),
        });

        for operand in self.insts[id].operands() {
            self.mark_used(operand, id);
        }

        id
    }

    /// Appends an already-created instruction to the current block. Emission
    /// into a closed block is forbidden.
    pub fn insert(&mut self, inst: InstId) -> InstId {
        let block = self
            .block
            .unwrap_or_else(|| ice!("instruction emitted with no current block"));
        assert!(
            !self.is_closed(block),
            "cannot emit into a closed block"
        );

        self.insts[inst].block = Some(block);
        self.blocks[block].insts.push(inst);
        inst
    }

    /// Appends to a specific block even if that block is closed. The inliner
    /// needs this when copying already-terminated callee blocks.
    pub fn force_insert_into(&mut self, block: BlockId, inst: InstId) {
        self.insts[inst].block = Some(block);
        self.blocks[block].insts.push(inst);
    }

    fn emit(&mut self, data: InstData, ty: Type) -> InstId {
        let inst = self.alloc_inst(data, ty);
        self.insert(inst)
    }

    pub fn immediate(&mut self, ty: Type, value: u64) -> InstId {
        self.emit(InstData::Immediate { value }, ty)
    }

    pub fn copy(&mut self, operand: InstId) -> InstId {
        let ty = self.insts[operand].ty.clone();
        self.emit(InstData::Copy { operand }, ty)
    }

    pub fn load(&mut self, ty: Type, addr: InstId) -> InstId {
        self.emit(InstData::Load { addr }, ty)
    }

    pub fn store(&mut self, value: InstId, addr: InstId) -> InstId {
        self.emit(InstData::Store { value, addr }, Type::void())
    }

    pub fn stack_allocate(&mut self, allocated: Type) -> InstId {
        let ty = Type::pointer(allocated.clone());
        self.emit(InstData::Alloca { allocated }, ty)
    }

    pub fn phi(&mut self, ty: Type) -> InstId {
        self.emit(InstData::Phi { args: Vec::new() }, ty)
    }

    /// Adds a `(predecessor, value)` pair to a PHI
    pub fn phi_argument(&mut self, phi: InstId, block: BlockId, value: InstId) {
        let InstData::Phi { args } = &mut self.insts[phi].data else {
            ice!("phi_argument on non-phi");
        };
        args.push(PhiArg { block, value });
        self.mark_used(value, phi);
    }

    pub fn branch(&mut self, target: BlockId) -> InstId {
        self.emit(InstData::Branch { target }, Type::void())
    }

    pub fn branch_conditional(
        &mut self,
        condition: InstId,
        then_block: BlockId,
        else_block: BlockId,
    ) -> InstId {
        self.emit(
            InstData::CondBranch {
                condition,
                then_block,
                else_block,
            },
            Type::void(),
        )
    }

    pub fn ret(&mut self, value: Option<InstId>) -> InstId {
        self.emit(InstData::Return { value }, Type::void())
    }

    pub fn unreachable_inst(&mut self) -> InstId {
        self.emit(InstData::Unreachable, Type::void())
    }

    /// Creates a call instruction without inserting it; arguments are added
    /// with [`Self::add_call_argument`] and the call is placed with
    /// [`Self::insert`]
    pub fn direct_call(&mut self, func: FuncId) -> InstId {
        let ty = self.functions[func].return_type();
        self.alloc_inst(
            InstData::Call {
                callee: Callee::Direct(func),
                args: Vec::new(),
                tail_call: false,
            },
            ty,
        )
    }

    pub fn indirect_call(&mut self, callee: InstId, ret: Type) -> InstId {
        self.alloc_inst(
            InstData::Call {
                callee: Callee::Indirect(callee),
                args: Vec::new(),
                tail_call: false,
            },
            ret,
        )
    }

    pub fn add_call_argument(&mut self, call: InstId, arg: InstId) {
        let InstData::Call { args, .. } = &mut self.insts[call].data else {
            ice!("add_call_argument on non-call");
        };
        args.push(arg);
        self.mark_used(arg, call);
    }

    pub fn intrinsic(&mut self, intrinsic: Intrinsic, args: Vec<InstId>, ty: Type) -> InstId {
        self.emit(InstData::Intrinsic { intrinsic, args }, ty)
    }

    pub fn unary(&mut self, op: UnaryOpcode, ty: Type, operand: InstId) -> InstId {
        self.emit(InstData::Unary { op, operand }, ty)
    }

    pub fn binary(&mut self, op: BinaryOpcode, lhs: InstId, rhs: InstId) -> InstId {
        let ty = if op.is_comparison() {
            Type::bool()
        } else {
            self.insts[lhs].ty.clone()
        };
        self.emit(InstData::Binary { op, lhs, rhs }, ty)
    }

    pub fn funcref(&mut self, func: FuncId) -> InstId {
        let ty = Type::pointer(self.functions[func].ty.clone());
        self.emit(InstData::FuncRef { func }, ty)
    }

    pub fn static_reference(&mut self, var: StaticId) -> InstId {
        let ty = Type::pointer(self.statics[var].ty.clone());
        self.emit(InstData::StaticRef { var }, ty)
    }

    pub fn create_static(&mut self, name: InternedSymbol, ty: Type) -> StaticId {
        self.statics.push(StaticVariable {
            name,
            ty,
            init: None,
        })
    }

    /// An unattached initializer instruction for a static variable
    pub fn literal_integer(&mut self, ty: Type, value: u64) -> InstId {
        self.alloc_inst(InstData::LitInteger { value }, ty)
    }

    pub fn literal_string(&mut self, ty: Type, index: usize) -> InstId {
        self.alloc_inst(InstData::LitString { index }, ty)
    }

    /* CFG queries */

    /// The predecessor blocks of `block` within its function
    pub fn predecessors(&self, block: BlockId) -> Vec<BlockId> {
        let Some(func) = self.blocks[block].function else {
            return Vec::new();
        };

        let mut preds = Vec::new();
        for candidate in &self.functions[func].blocks {
            let Some(last) = self.blocks[*candidate].insts.last() else {
                continue;
            };

            match &self.insts[*last].data {
                InstData::Branch { target } if *target == block => preds.push(*candidate),
                InstData::CondBranch {
                    then_block,
                    else_block,
                    ..
                } if *then_block == block || *else_block == block => preds.push(*candidate),
                _ => {}
            }
        }

        preds
    }
}

fn replace_operand(data: &mut InstData, old: InstId, new: InstId) {
    let patch = |slot: &mut InstId| {
        if *slot == old {
            *slot = new;
        }
    };

    match data {
        InstData::Immediate { .. }
        | InstData::LitInteger { .. }
        | InstData::LitString { .. }
        | InstData::StaticRef { .. }
        | InstData::FuncRef { .. }
        | InstData::Parameter { .. }
        | InstData::Register { .. }
        | InstData::Alloca { .. }
        | InstData::Branch { .. }
        | InstData::Unreachable => {}

        InstData::Copy { operand }
        | InstData::Load { addr: operand }
        | InstData::Unary { operand, .. } => patch(operand),

        InstData::Store { value, addr } => {
            patch(value);
            patch(addr);
        }
        InstData::Binary { lhs, rhs, .. } => {
            patch(lhs);
            patch(rhs);
        }
        InstData::Phi { args } => {
            for arg in args {
                patch(&mut arg.value);
            }
        }
        InstData::CondBranch { condition, .. } => patch(condition),
        InstData::Return { value } => {
            if let Some(v) = value {
                patch(v);
            }
        }
        InstData::Call { callee, args, .. } => {
            if let Callee::Indirect(inst) = callee {
                patch(inst);
            }
            for arg in args {
                patch(arg);
            }
        }
        InstData::Intrinsic { args, .. } => {
            for arg in args {
                patch(arg);
            }
        }
    }
}

/// Checks the structural invariants of the IR: use-def symmetry, closed
/// blocks, and PHI argument blocks matching CFG predecessors. Returns a list
/// of violations (empty when the IR is well formed).
pub fn validate(ctx: &CodegenContext) -> Vec<String> {
    let mut problems = Vec::new();

    for (func_id, func) in ctx.functions.enumerate() {
        if func.is_extern {
            continue;
        }

        for block_id in &func.blocks {
            let block = &ctx.blocks[*block_id];

            if block.function != Some(func_id) {
                problems.push(format!(
                    "block {block_id:?} is listed by {} but does not point back at it",
                    func.name
                ));
            }

            if !ctx.is_closed(*block_id) {
                problems.push(format!(
                    "block {block_id:?} in {} does not end with a terminator",
                    func.name
                ));
            }

            for inst_id in &block.insts {
                let inst = &ctx.insts[*inst_id];

                if inst.block != Some(*block_id) {
                    problems.push(format!(
                        "instruction {inst_id:?} does not point back at its block"
                    ));
                }

                /* Use-def symmetry, forward direction */

                for operand in inst.operands() {
                    if !ctx.insts[operand].users.contains(inst_id) {
                        problems.push(format!(
                            "instruction {inst_id:?} reads {operand:?} but is not in its user set"
                        ));
                    }
                }

                /* PHI arguments match the CFG */

                if let InstData::Phi { args } = &inst.data {
                    let mut arg_blocks: Vec<BlockId> = args.iter().map(|a| a.block).collect();
                    let mut preds = ctx.predecessors(*block_id);
                    arg_blocks.sort();
                    preds.sort();

                    if arg_blocks != preds {
                        problems.push(format!(
                            "phi {inst_id:?} has argument blocks {arg_blocks:?} but predecessors {preds:?}"
                        ));
                    }
                }
            }
        }
    }

    /* Use-def symmetry, reverse direction */

    for (inst_id, inst) in ctx.insts.enumerate() {
        for user in &inst.users {
            if !ctx.insts[*user].operands().contains(&inst_id) {
                problems.push(format!(
                    "{inst_id:?} lists {user:?} as a user but is not one of its operands"
                ));
            }
        }
    }

    problems
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::{AsmDialect, OutputFormat},
        target::{CallingConvention, Target},
    };
    use strum::EnumCount;

    fn test_context() -> CodegenContext {
        CodegenContext::new(
            OutputFormat::Ir,
            AsmDialect::Intel,
            Target::x86_64(CallingConvention::Linux),
        )
    }

    fn int_function(ctx: &mut CodegenContext, name: &str) -> FuncId {
        let ty = Type::function(Vec::new(), Type::int(), CallConv::Sable, false);
        ctx.create_function(InternedSymbol::new(name), ty)
    }

    #[test]
    fn opcode_set_is_complete() {
        assert_eq!(Opcode::COUNT, 39);
    }

    #[test]
    fn use_lists_stay_symmetric() {
        let mut ctx = test_context();
        let _f = int_function(&mut ctx, "f");

        let a = ctx.immediate(Type::int(), 1);
        let b = ctx.immediate(Type::int(), 2);
        let sum = ctx.binary(BinaryOpcode::Add, a, b);

        assert!(ctx.insts[a].users.contains(&sum));
        assert!(ctx.insts[b].users.contains(&sum));

        let c = ctx.immediate(Type::int(), 3);
        ctx.replace_uses(a, c);

        assert!(ctx.insts[a].users.is_empty());
        assert!(ctx.insts[c].users.contains(&sum));
        assert_eq!(
            ctx.insts[sum].operands(),
            vec![c, b],
            "operand slot must be rewritten"
        );

        ctx.ret(Some(sum));
        assert!(validate(&ctx).is_empty());
    }

    #[test]
    fn removal_detaches_and_parks() {
        let mut ctx = test_context();
        let _f = int_function(&mut ctx, "f");

        let a = ctx.immediate(Type::int(), 1);
        let block = ctx.block.unwrap();
        assert!(ctx.blocks[block].insts.contains(&a));

        ctx.remove(a);
        assert!(!ctx.blocks[block].insts.contains(&a));
        assert!(ctx.removed.contains(&a));
        assert_eq!(ctx.insts[a].block, None);
    }

    #[test]
    #[should_panic(expected = "closed block")]
    fn emitting_into_closed_block_panics() {
        let mut ctx = test_context();
        let _f = int_function(&mut ctx, "f");

        let v = ctx.immediate(Type::int(), 0);
        ctx.ret(Some(v));
        ctx.immediate(Type::int(), 1);
    }

    #[test]
    fn validate_flags_open_blocks_and_phi_mismatches() {
        let mut ctx = test_context();
        let _f = int_function(&mut ctx, "f");

        // Entry block with no terminator
        ctx.immediate(Type::int(), 1);
        let problems = validate(&ctx);
        assert!(problems.iter().any(|p| p.contains("terminator")));
    }

    #[test]
    fn phi_predecessors_validate() {
        let mut ctx = test_context();
        let _f = int_function(&mut ctx, "f");

        let cond = ctx.immediate(Type::bool(), 1);
        let then_block = ctx.block_create();
        let else_block = ctx.block_create();
        let join = ctx.block_create();
        ctx.branch_conditional(cond, then_block, else_block);

        ctx.block_attach(then_block);
        let one = ctx.immediate(Type::int(), 1);
        ctx.branch(join);

        ctx.block_attach(else_block);
        let two = ctx.immediate(Type::int(), 2);
        ctx.branch(join);

        ctx.block_attach(join);
        let phi = ctx.phi(Type::int());
        ctx.phi_argument(phi, then_block, one);
        ctx.phi_argument(phi, else_block, two);
        ctx.ret(Some(phi));

        assert!(validate(&ctx).is_empty());

        // Dropping one phi argument must be flagged
        if let InstData::Phi { args } = &mut ctx.insts[phi].data {
            args.pop();
        }
        assert!(!validate(&ctx).is_empty());
    }
}
