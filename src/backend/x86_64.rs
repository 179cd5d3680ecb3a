//! x86-64 instruction selection and GAS emission.
//!
//! Selection uses a stack-slot scheme: every value-producing IR instruction
//! gets a slot in the frame, operations load their operands into scratch
//! registers, compute, and store the result back. PHIs are resolved by
//! having every predecessor write the argument value into the PHI's slot
//! before branching.

use hashbrown::HashMap;
use itertools::Itertools;

use crate::{
    backend::{
        AsmDialect,
        ir::{
            BinaryOpcode, BlockId, Callee, CodegenContext, FuncId, InstData, InstId, UnaryOpcode,
        },
        mir::{Linkage, MFunction},
    },
    diag::ice,
    frontend::ast::Intrinsic,
    middle::ty::{Type, align_to},
    target::CallingConvention,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum Reg {
    Rax,
    Rbx,
    Rcx,
    Rdx,
    Rsi,
    Rdi,
    Rbp,
    Rsp,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
}

impl Reg {
    /// The register's name at the given operand size
    pub fn sized(self, bytes: usize) -> &'static str {
        use Reg::*;

        match (self, bytes) {
            (Rax, 8) => "rax",
            (Rax, 4) => "eax",
            (Rax, 2) => "ax",
            (Rax, 1) => "al",
            (Rbx, 8) => "rbx",
            (Rbx, 4) => "ebx",
            (Rbx, 2) => "bx",
            (Rbx, 1) => "bl",
            (Rcx, 8) => "rcx",
            (Rcx, 4) => "ecx",
            (Rcx, 2) => "cx",
            (Rcx, 1) => "cl",
            (Rdx, 8) => "rdx",
            (Rdx, 4) => "edx",
            (Rdx, 2) => "dx",
            (Rdx, 1) => "dl",
            (Rsi, 8) => "rsi",
            (Rsi, 4) => "esi",
            (Rsi, 2) => "si",
            (Rsi, 1) => "sil",
            (Rdi, 8) => "rdi",
            (Rdi, 4) => "edi",
            (Rdi, 2) => "di",
            (Rdi, 1) => "dil",
            (Rbp, 8) => "rbp",
            (Rsp, 8) => "rsp",
            (R8, 8) => "r8",
            (R8, 4) => "r8d",
            (R8, 2) => "r8w",
            (R8, 1) => "r8b",
            (R9, 8) => "r9",
            (R9, 4) => "r9d",
            (R9, 2) => "r9w",
            (R9, 1) => "r9b",
            (R10, 8) => "r10",
            (R10, 4) => "r10d",
            (R10, 2) => "r10w",
            (R10, 1) => "r10b",
            (R11, 8) => "r11",
            (R11, 4) => "r11d",
            (R11, 2) => "r11w",
            (R11, 1) => "r11b",
            (R12, 8) => "r12",
            (R13, 8) => "r13",
            (R14, 8) => "r14",
            (R15, 8) => "r15",
            _ => ice!("no {bytes}-byte name for {self}"),
        }
    }
}

/// The register file and calling convention the selector works against
#[derive(Debug, Clone, Copy)]
pub struct MachineDescription {
    pub arg_registers: &'static [Reg],
    pub return_register: Reg,
    /// Stack bytes the caller must reserve for the callee (mswin shadow
    /// space)
    pub shadow_space: usize,
}

impl MachineDescription {
    pub fn for_convention(convention: CallingConvention) -> Self {
        match convention {
            CallingConvention::Linux => Self {
                arg_registers: &[Reg::Rdi, Reg::Rsi, Reg::Rdx, Reg::Rcx, Reg::R8, Reg::R9],
                return_register: Reg::Rax,
                shadow_space: 0,
            },
            CallingConvention::MsWin => Self {
                arg_registers: &[Reg::Rcx, Reg::Rdx, Reg::R8, Reg::R9],
                return_register: Reg::Rax,
                shadow_space: 32,
            },
        }
    }
}

#[derive(Debug, Clone)]
pub enum MInst {
    Label(String),
    /// One rendered instruction in the selected dialect
    Text(String),
    Comment(String),
}

/// Renders machine instructions. Knows the dialect so that callers work in
/// terms of operations, not syntax.
struct Assembler {
    dialect: AsmDialect,
    insts: Vec<MInst>,
}

#[derive(Debug, Clone)]
enum MOp {
    Reg(Reg, usize),
    Imm(u64),
    /// [rbp - offset], sized
    Frame(usize, usize),
    /// [reg], sized
    Deref(Reg, usize),
    /// RIP-relative symbol address
    Sym(String),
}

impl Assembler {
    fn new(dialect: AsmDialect) -> Self {
        Self {
            dialect,
            insts: Vec::new(),
        }
    }

    fn label(&mut self, name: impl Into<String>) {
        self.insts.push(MInst::Label(name.into()));
    }

    fn comment(&mut self, text: impl Into<String>) {
        self.insts.push(MInst::Comment(text.into()));
    }

    fn raw(&mut self, text: impl Into<String>) {
        self.insts.push(MInst::Text(text.into()));
    }

    fn size_keyword(bytes: usize) -> &'static str {
        match bytes {
            1 => "byte ptr",
            2 => "word ptr",
            4 => "dword ptr",
            _ => "qword ptr",
        }
    }

    fn att_suffix(bytes: usize) -> &'static str {
        match bytes {
            1 => "b",
            2 => "w",
            4 => "l",
            _ => "q",
        }
    }

    fn operand(&self, op: &MOp) -> String {
        match self.dialect {
            AsmDialect::Intel => match op {
                MOp::Reg(reg, size) => reg.sized(*size).to_string(),
                MOp::Imm(value) => format!("{value}"),
                MOp::Frame(offset, size) => {
                    format!("{} [rbp - {offset}]", Self::size_keyword(*size))
                }
                MOp::Deref(reg, size) => format!("{} [{reg}]", Self::size_keyword(*size)),
                MOp::Sym(name) => format!("{name}[rip]"),
            },
            AsmDialect::Att => match op {
                MOp::Reg(reg, size) => format!("%{}", reg.sized(*size)),
                MOp::Imm(value) => format!("${value}"),
                MOp::Frame(offset, _) => format!("-{offset}(%rbp)"),
                MOp::Deref(reg, _) => format!("(%{reg})"),
                MOp::Sym(name) => format!("{name}(%rip)"),
            },
        }
    }

    fn op_size(op: &MOp) -> Option<usize> {
        match op {
            MOp::Reg(_, size) | MOp::Frame(_, size) | MOp::Deref(_, size) => Some(*size),
            _ => None,
        }
    }

    /// A two-operand instruction, dst first in Intel order
    fn emit(&mut self, mnemonic: &str, dst: MOp, src: MOp) {
        let line = match self.dialect {
            AsmDialect::Intel => {
                format!("{mnemonic} {}, {}", self.operand(&dst), self.operand(&src))
            }
            AsmDialect::Att => {
                let size = Self::op_size(&dst).or(Self::op_size(&src)).unwrap_or(8);
                format!(
                    "{mnemonic}{} {}, {}",
                    Self::att_suffix(size),
                    self.operand(&src),
                    self.operand(&dst)
                )
            }
        };
        self.raw(line);
    }

    fn emit1(&mut self, mnemonic: &str, op: MOp) {
        let line = match self.dialect {
            AsmDialect::Intel => format!("{mnemonic} {}", self.operand(&op)),
            AsmDialect::Att => {
                let size = Self::op_size(&op).unwrap_or(8);
                format!("{mnemonic}{} {}", Self::att_suffix(size), self.operand(&op))
            }
        };
        self.raw(line);
    }
}

/// Lowers the whole context to MIR functions
pub fn lower_to_mir(ctx: &CodegenContext) -> Vec<MFunction> {
    let desc = MachineDescription::for_convention(ctx.target.call_convention);

    ctx.functions
        .indices()
        .map(|func| {
            let f = &ctx.functions[func];

            let linkage = if f.is_extern {
                Linkage::Imported
            } else if f.attr_global {
                Linkage::Exported
            } else {
                Linkage::Local
            };

            if f.is_extern {
                return MFunction {
                    name: f.name,
                    linkage,
                    insts: Vec::new(),
                    frame_size: 0,
                };
            }

            FunctionSelector::new(ctx, &desc, func).run()
        })
        .collect()
}

struct FunctionSelector<'a> {
    ctx: &'a CodegenContext,
    desc: &'a MachineDescription,
    func: FuncId,
    asm: Assembler,
    /// Frame offset of each value-producing instruction
    slots: HashMap<InstId, usize>,
    /// Frame offset of each alloca's backing storage
    alloca_storage: HashMap<InstId, usize>,
    /// PHI moves each predecessor must perform before its terminator
    phi_moves: HashMap<BlockId, Vec<(InstId, InstId)>>,
    frame_size: usize,
}

impl<'a> FunctionSelector<'a> {
    fn new(ctx: &'a CodegenContext, desc: &'a MachineDescription, func: FuncId) -> Self {
        Self {
            ctx,
            desc,
            func,
            asm: Assembler::new(ctx.dialect),
            slots: HashMap::new(),
            alloca_storage: HashMap::new(),
            phi_moves: HashMap::new(),
            frame_size: 0,
        }
    }

    fn slot_size(&self, ty: &Type) -> usize {
        ty.size(&self.ctx.target)
            .next_power_of_two()
            .clamp(1, 8)
    }

    fn allocate_slot(&mut self, bytes: usize, align: usize) -> usize {
        self.frame_size = align_to(self.frame_size + bytes, align.max(1));
        self.frame_size
    }

    fn frame_op(&self, inst: InstId) -> MOp {
        let size = self.slot_size(&self.ctx.insts[inst].ty);
        MOp::Frame(self.slots[&inst], size)
    }

    fn block_label(&self, block: BlockId) -> String {
        let f = &self.ctx.functions[self.func];
        let index = f.blocks.iter().position(|b| *b == block).unwrap_or(0);
        format!(".L{}_bb{}", f.name, index)
    }

    fn exit_label(&self) -> String {
        format!(".L{}_exit", self.ctx.functions[self.func].name)
    }

    /// Loads a value slot into a scratch register, widening small values
    fn load_slot(&mut self, reg: Reg, inst: InstId) {
        let size = self.slot_size(&self.ctx.insts[inst].ty);
        let src = self.frame_op(inst);

        match (self.ctx.dialect, size) {
            (_, 8) => self.asm.emit("mov", MOp::Reg(reg, 8), src),
            (_, 4) => self.asm.emit("mov", MOp::Reg(reg, 4), src),
            (AsmDialect::Intel, _) => self.asm.emit("movzx", MOp::Reg(reg, 8), src),
            (AsmDialect::Att, _) => {
                let suffix = if size == 1 { "b" } else { "w" };
                let line = format!(
                    "movz{suffix}q {}, %{}",
                    self.asm.operand(&src),
                    reg.sized(8)
                );
                self.asm.raw(line);
            }
        }
    }

    fn store_slot(&mut self, inst: InstId, reg: Reg) {
        let size = self.slot_size(&self.ctx.insts[inst].ty);
        let dst = self.frame_op(inst);
        self.asm.emit("mov", dst, MOp::Reg(reg, size));
    }

    fn run(mut self) -> MFunction {
        let f = &self.ctx.functions[self.func];

        /* Assign a frame slot to every value */

        for param in &f.parameters {
            let size = self.slot_size(&self.ctx.insts[*param].ty);
            let offset = self.allocate_slot(size, size);
            self.slots.insert(*param, offset);
        }

        for block in &f.blocks {
            for inst in &self.ctx.blocks[*block].insts {
                let data = &self.ctx.insts[*inst].data;

                if let InstData::Alloca { allocated } = data {
                    let size = allocated.size(&self.ctx.target).max(1);
                    let align = allocated.align(&self.ctx.target);
                    let storage = self.allocate_slot(size, align);
                    self.alloca_storage.insert(*inst, storage);
                }

                if self.ctx.insts[*inst].produces_value() {
                    let size = self.slot_size(&self.ctx.insts[*inst].ty);
                    let offset = self.allocate_slot(size, size);
                    self.slots.insert(*inst, offset);
                }

                if let InstData::Phi { args } = data {
                    for arg in args {
                        self.phi_moves
                            .entry(arg.block)
                            .or_default()
                            .push((*inst, arg.value));
                    }
                }
            }
        }

        /* Prologue */

        let frame = align_to(self.frame_size, 16);
        match self.ctx.dialect {
            AsmDialect::Intel => {
                self.asm.raw("push rbp");
                self.asm.raw("mov rbp, rsp");
                self.asm.raw(format!("sub rsp, {frame}"));
            }
            AsmDialect::Att => {
                self.asm.raw("pushq %rbp");
                self.asm.raw("movq %rsp, %rbp");
                self.asm.raw(format!("subq ${frame}, %rsp"));
            }
        }

        /* Spill register parameters into their slots */

        for (i, param) in f.parameters.iter().enumerate().collect::<Vec<_>>() {
            if i < self.desc.arg_registers.len() {
                self.store_slot(*param, self.desc.arg_registers[i]);
            } else {
                // Stack parameters sit above the saved rbp and return
                // address
                let offset = 16 + 8 * (i - self.desc.arg_registers.len());
                let line = match self.ctx.dialect {
                    AsmDialect::Intel => format!("mov rax, qword ptr [rbp + {offset}]"),
                    AsmDialect::Att => format!("movq {offset}(%rbp), %rax"),
                };
                self.asm.raw(line);
                self.store_slot(*param, Reg::Rax);
            }
        }

        /* Blocks */

        for block in f.blocks.clone() {
            let label = self.block_label(block);
            self.asm.label(label);

            for inst in self.ctx.blocks[block].insts.clone() {
                self.select(block, inst);
            }
        }

        /* Epilogue */

        self.asm.label(self.exit_label());
        self.asm.raw("leave");
        self.asm.raw("ret");

        MFunction {
            name: f.name,
            linkage: if f.attr_global {
                Linkage::Exported
            } else {
                Linkage::Local
            },
            insts: self.asm.insts,
            frame_size: frame,
        }
    }

    /// Emits the PHI moves owed to successors before a terminator
    fn flush_phi_moves(&mut self, block: BlockId) {
        if let Some(moves) = self.phi_moves.get(&block).cloned() {
            for (phi, value) in moves {
                self.load_slot(Reg::Rax, value);
                self.store_slot(phi, Reg::Rax);
            }
        }
    }

    fn select(&mut self, block: BlockId, inst: InstId) {
        let data = self.ctx.insts[inst].data.clone();

        match data {
            InstData::Immediate { value } => {
                self.asm.emit("mov", MOp::Reg(Reg::Rax, 8), MOp::Imm(value));
                self.store_slot(inst, Reg::Rax);
            }

            InstData::Copy { operand } => {
                self.load_slot(Reg::Rax, operand);
                self.store_slot(inst, Reg::Rax);
            }

            InstData::Load { addr } => {
                let size = self.slot_size(&self.ctx.insts[inst].ty);
                self.load_slot(Reg::Rax, addr);
                self.asm
                    .emit("mov", MOp::Reg(Reg::Rax, size), MOp::Deref(Reg::Rax, size));
                self.store_slot(inst, Reg::Rax);
            }

            InstData::Store { value, addr } => {
                let size = self.slot_size(&self.ctx.insts[value].ty);
                self.load_slot(Reg::Rax, value);
                self.load_slot(Reg::Rcx, addr);
                self.asm
                    .emit("mov", MOp::Deref(Reg::Rcx, size), MOp::Reg(Reg::Rax, size));
            }

            InstData::Alloca { .. } => {
                let storage = self.alloca_storage[&inst];
                let line = match self.ctx.dialect {
                    AsmDialect::Intel => format!("lea rax, [rbp - {storage}]"),
                    AsmDialect::Att => format!("leaq -{storage}(%rbp), %rax"),
                };
                self.asm.raw(line);
                self.store_slot(inst, Reg::Rax);
            }

            InstData::StaticRef { var } => {
                let name = self.ctx.statics[var].name;
                self.asm
                    .emit("lea", MOp::Reg(Reg::Rax, 8), MOp::Sym(name.value().into()));
                self.store_slot(inst, Reg::Rax);
            }

            InstData::FuncRef { func } => {
                let name = self.ctx.functions[func].name;
                self.asm
                    .emit("lea", MOp::Reg(Reg::Rax, 8), MOp::Sym(name.value().into()));
                self.store_slot(inst, Reg::Rax);
            }

            // Parameters were spilled in the prologue; PHI slots are written
            // by predecessors
            InstData::Parameter { .. } | InstData::Phi { .. } => {}

            InstData::Register { register } => {
                self.asm.comment(format!("pinned to machine register {register}"));
            }

            InstData::Branch { target } => {
                self.flush_phi_moves(block);
                let label = self.block_label(target);
                self.asm.raw(format!("jmp {label}"));
            }

            InstData::CondBranch {
                condition,
                then_block,
                else_block,
            } => {
                self.flush_phi_moves(block);
                self.load_slot(Reg::Rax, condition);
                match self.ctx.dialect {
                    AsmDialect::Intel => self.asm.raw("test al, al"),
                    AsmDialect::Att => self.asm.raw("testb %al, %al"),
                }
                self.asm.raw(format!("jnz {}", self.block_label(then_block)));
                self.asm.raw(format!("jmp {}", self.block_label(else_block)));
            }

            InstData::Return { value } => {
                if let Some(value) = value {
                    self.load_slot(self.desc.return_register, value);
                }
                self.asm.raw(format!("jmp {}", self.exit_label()));
            }

            InstData::Unreachable => {
                self.asm.raw("ud2");
            }

            InstData::Call { callee, args, .. } => {
                self.emit_call(inst, callee, &args);
            }

            InstData::Intrinsic { intrinsic, args } => self.emit_intrinsic(inst, intrinsic, &args),

            InstData::Unary { op, operand } => {
                match op {
                    UnaryOpcode::Not => {
                        self.load_slot(Reg::Rax, operand);
                        self.asm.emit1("not", MOp::Reg(Reg::Rax, 8));
                    }
                    UnaryOpcode::SignExtend => {
                        let from_size = self.slot_size(&self.ctx.insts[operand].ty);
                        let src = self.frame_op(operand);
                        match self.ctx.dialect {
                            AsmDialect::Intel => {
                                let mnemonic = if from_size == 4 { "movsxd" } else { "movsx" };
                                self.asm.emit(mnemonic, MOp::Reg(Reg::Rax, 8), src);
                            }
                            AsmDialect::Att => {
                                let suffix = match from_size {
                                    1 => "b",
                                    2 => "w",
                                    _ => "l",
                                };
                                let line =
                                    format!("movs{suffix}q {}, %rax", self.asm.operand(&src));
                                self.asm.raw(line);
                            }
                        }
                    }
                    UnaryOpcode::ZeroExtend | UnaryOpcode::Truncate | UnaryOpcode::Bitcast => {
                        // The load already zero-extends; truncation happens
                        // through the sized store
                        self.load_slot(Reg::Rax, operand);
                    }
                }

                self.store_slot(inst, Reg::Rax);
            }

            InstData::Binary { op, lhs, rhs } => self.emit_binary(inst, op, lhs, rhs),

            InstData::LitInteger { .. } | InstData::LitString { .. } => {
                ice!("static initializer instruction inside a block")
            }
        }
    }

    fn emit_binary(&mut self, inst: InstId, op: BinaryOpcode, lhs: InstId, rhs: InstId) {
        let signed = self.ctx.insts[lhs]
            .ty
            .integer_info(&self.ctx.target)
            .map(|(_, s)| s)
            .unwrap_or(false);

        self.load_slot(Reg::Rax, lhs);
        self.load_slot(Reg::Rcx, rhs);

        let a = MOp::Reg(Reg::Rax, 8);
        let c = MOp::Reg(Reg::Rcx, 8);

        match op {
            BinaryOpcode::Add => self.asm.emit("add", a, c),
            BinaryOpcode::Sub => self.asm.emit("sub", a, c),
            BinaryOpcode::Mul => self.asm.emit("imul", a, c),
            BinaryOpcode::And => self.asm.emit("and", a, c),
            BinaryOpcode::Or => self.asm.emit("or", a, c),

            BinaryOpcode::Div | BinaryOpcode::Mod => {
                if signed {
                    self.asm.raw("cqo");
                    self.asm.emit1("idiv", c);
                } else {
                    match self.ctx.dialect {
                        AsmDialect::Intel => self.asm.raw("xor edx, edx"),
                        AsmDialect::Att => self.asm.raw("xorl %edx, %edx"),
                    }
                    self.asm.emit1("div", c);
                }

                if op == BinaryOpcode::Mod {
                    self.asm.emit("mov", MOp::Reg(Reg::Rax, 8), MOp::Reg(Reg::Rdx, 8));
                }
            }

            BinaryOpcode::Shl | BinaryOpcode::Sar | BinaryOpcode::Shr => {
                let mnemonic = match op {
                    BinaryOpcode::Shl => "shl",
                    BinaryOpcode::Sar => "sar",
                    _ => "shr",
                };
                let line = match self.ctx.dialect {
                    AsmDialect::Intel => format!("{mnemonic} rax, cl"),
                    AsmDialect::Att => format!("{mnemonic}q %cl, %rax"),
                };
                self.asm.raw(line);
            }

            BinaryOpcode::Lt
            | BinaryOpcode::Le
            | BinaryOpcode::Gt
            | BinaryOpcode::Ge
            | BinaryOpcode::Eq
            | BinaryOpcode::Ne => {
                self.asm.emit("cmp", a, c);

                let cc = match (op, signed) {
                    (BinaryOpcode::Lt, true) => "setl",
                    (BinaryOpcode::Le, true) => "setle",
                    (BinaryOpcode::Gt, true) => "setg",
                    (BinaryOpcode::Ge, true) => "setge",
                    (BinaryOpcode::Lt, false) => "setb",
                    (BinaryOpcode::Le, false) => "setbe",
                    (BinaryOpcode::Gt, false) => "seta",
                    (BinaryOpcode::Ge, false) => "setae",
                    (BinaryOpcode::Eq, _) => "sete",
                    (BinaryOpcode::Ne, _) => "setne",
                    _ => unreachable!(),
                };
                match self.ctx.dialect {
                    AsmDialect::Intel => {
                        self.asm.raw(format!("{cc} al"));
                        self.asm
                            .emit("movzx", MOp::Reg(Reg::Rax, 8), MOp::Reg(Reg::Rax, 1));
                    }
                    AsmDialect::Att => {
                        self.asm.raw(format!("{cc} %al"));
                        self.asm.raw("movzbq %al, %rax");
                    }
                }
            }
        }

        self.store_slot(inst, Reg::Rax);
    }

    fn emit_call(&mut self, inst: InstId, callee: Callee, args: &[InstId]) {
        let n_regs = self.desc.arg_registers.len();

        /* Stack arguments are pushed right to left */

        let stack_args = args.len().saturating_sub(n_regs);
        for arg in args.iter().skip(n_regs).rev() {
            self.load_slot(Reg::Rax, *arg);
            match self.ctx.dialect {
                AsmDialect::Intel => self.asm.raw("push rax"),
                AsmDialect::Att => self.asm.raw("pushq %rax"),
            }
        }

        for (i, arg) in args.iter().take(n_regs).enumerate() {
            self.load_slot(self.desc.arg_registers[i], *arg);
        }

        if self.desc.shadow_space != 0 {
            let line = match self.ctx.dialect {
                AsmDialect::Intel => format!("sub rsp, {}", self.desc.shadow_space),
                AsmDialect::Att => format!("subq ${}, %rsp", self.desc.shadow_space),
            };
            self.asm.raw(line);
        }

        match callee {
            Callee::Direct(func) => {
                let name = self.ctx.functions[func].name;
                self.asm.raw(format!("call {name}"));
            }
            Callee::Indirect(target) => {
                self.load_slot(Reg::R10, target);
                match self.ctx.dialect {
                    AsmDialect::Intel => self.asm.raw("call r10"),
                    AsmDialect::Att => self.asm.raw("callq *%r10"),
                }
            }
        }

        let cleanup = self.desc.shadow_space + 8 * stack_args;
        if cleanup != 0 {
            let line = match self.ctx.dialect {
                AsmDialect::Intel => format!("add rsp, {cleanup}"),
                AsmDialect::Att => format!("addq ${cleanup}, %rsp"),
            };
            self.asm.raw(line);
        }

        if !self.ctx.insts[inst].ty.is_void() {
            self.store_slot(inst, self.desc.return_register);
        }
    }

    fn emit_intrinsic(&mut self, inst: InstId, intrinsic: Intrinsic, args: &[InstId]) {
        match intrinsic {
            Intrinsic::Syscall => {
                const SYSCALL_ARG_REGS: &[Reg] =
                    &[Reg::Rdi, Reg::Rsi, Reg::Rdx, Reg::R10, Reg::R8, Reg::R9];

                self.load_slot(Reg::Rax, args[0]);
                for (i, arg) in args.iter().skip(1).enumerate() {
                    self.load_slot(SYSCALL_ARG_REGS[i], *arg);
                }
                self.asm.raw("syscall");
                self.store_slot(inst, Reg::Rax);
            }
            Intrinsic::DebugTrap => {
                self.asm.raw("int3");
            }
            Intrinsic::MemCopy => {
                self.load_slot(Reg::Rdi, args[0]);
                self.load_slot(Reg::Rsi, args[1]);
                self.load_slot(Reg::Rcx, args[2]);
                self.asm.raw("rep movsb");
            }
        }
    }
}

/// Renders the MIR as a GAS module: directives, static data, then function
/// bodies
pub fn emit_gas(ctx: &CodegenContext, mir: &[MFunction], dialect: AsmDialect) -> String {
    let mut out = String::new();

    if dialect == AsmDialect::Intel {
        out.push_str(".intel_syntax noprefix\n");
    }

    /* Static data */

    let (initialized, uninitialized): (Vec<_>, Vec<_>) =
        ctx.statics.iter().partition(|var| var.init.is_some());

    if !initialized.is_empty() {
        out.push_str(".data\n");
        for var in initialized {
            out.push_str(&format!("{}:\n", var.name));

            match &ctx.insts[var.init.unwrap()].data {
                InstData::LitInteger { value } => {
                    let directive = match var.ty.size(&ctx.target) {
                        1 => ".byte",
                        2 => ".short",
                        4 => ".long",
                        _ => ".quad",
                    };
                    out.push_str(&format!("    {directive} {value}\n"));
                }
                InstData::LitString { index } => {
                    let escaped = ctx.strings[*index]
                        .value()
                        .chars()
                        .flat_map(char::escape_default)
                        .collect::<String>();
                    out.push_str(&format!("    .asciz \"{escaped}\"\n"));
                }
                other => ice!("invalid static initializer {other:?}"),
            }
        }
    }

    if !uninitialized.is_empty() {
        out.push_str(".bss\n");
        for var in uninitialized {
            let size = var.ty.size(&ctx.target).max(1);
            out.push_str(&format!("{}:\n    .zero {size}\n", var.name));
        }
    }

    /* Code */

    out.push_str(".text\n");
    for func in mir {
        if func.is_imported() {
            continue;
        }

        if func.linkage == Linkage::Exported {
            out.push_str(&format!(".globl {}\n", func.name));
        }
        out.push_str(&format!("{}:\n", func.name));

        out.push_str(
            &func
                .insts
                .iter()
                .map(|inst| match inst {
                    MInst::Label(name) => format!("{name}:"),
                    MInst::Text(text) => format!("    {text}"),
                    MInst::Comment(text) => format!("    # {text}"),
                })
                .join("\n"),
        );
        out.push('\n');
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::{AsmDialect, OutputFormat, ir::parse::parse_ir},
        target::Target,
    };
    use indoc::indoc;

    fn emit(source: &str, convention: CallingConvention, dialect: AsmDialect) -> String {
        let mut ctx = CodegenContext::new(
            OutputFormat::X86_64Gas,
            dialect,
            Target::x86_64(convention),
        );
        parse_ir(source, &mut ctx).expect("test IR must parse");
        let mir = lower_to_mir(&ctx);
        emit_gas(&ctx, &mir, dialect)
    }

    const ADD_FUNC: &str = indoc! {r#"
        function @add(%0 : int, %1 : int) -> int global sable {
        bb0:
            %2 = add int %0, %1
            return %2
        }
    "#};

    #[test]
    fn linux_arguments_arrive_in_sysv_registers() {
        let asm = emit(ADD_FUNC, CallingConvention::Linux, AsmDialect::Intel);

        assert!(asm.contains(".globl add"));
        // The first two SysV argument registers are spilled to the frame
        assert!(asm.contains("rdi"), "{asm}");
        assert!(asm.contains("rsi"), "{asm}");
    }

    #[test]
    fn mswin_arguments_arrive_in_win64_registers() {
        let asm = emit(ADD_FUNC, CallingConvention::MsWin, AsmDialect::Intel);

        assert!(asm.contains("rcx"), "{asm}");
        assert!(asm.contains("rdx"), "{asm}");
        assert!(!asm.contains("rdi"), "{asm}");
    }

    #[test]
    fn att_dialect_prefixes_registers() {
        let asm = emit(ADD_FUNC, CallingConvention::Linux, AsmDialect::Att);

        assert!(asm.contains("%rbp"), "{asm}");
        assert!(!asm.contains(".intel_syntax"), "{asm}");
    }

    #[test]
    fn statics_land_in_data_and_bss() {
        let asm = emit(
            indoc! {r#"
                static @counter : int = lit_integer 7
                static @buffer : [byte 32]

                function @main() -> int global sable {
                bb0:
                    %0 = immediate int 0
                    return %0
                }
            "#},
            CallingConvention::Linux,
            AsmDialect::Intel,
        );

        assert!(asm.contains(".data"), "{asm}");
        assert!(asm.contains(".quad 7"), "{asm}");
        assert!(asm.contains(".bss"), "{asm}");
        assert!(asm.contains(".zero 32"), "{asm}");
    }

    #[test]
    fn mswin_calls_reserve_shadow_space() {
        let asm = emit(
            indoc! {r#"
                declare @callee(int) -> int c
                function @main() -> int global sable {
                bb0:
                    %0 = immediate int 1
                    %1 = call int @callee(%0)
                    return %1
                }
            "#},
            CallingConvention::MsWin,
            AsmDialect::Intel,
        );

        assert!(asm.contains("sub rsp, 32"), "{asm}");
        assert!(asm.contains("add rsp, 32"), "{asm}");
    }
}
