//! Plain-text serialization of the IR. The grammar is co-specified with
//! `parse`: for every well-formed IR, print-then-parse produces a
//! structurally equal IR.

use hashbrown::HashMap;
use itertools::Itertools;

use crate::{
    backend::ir::{Callee, CodegenContext, FuncId, InstData, InstId, IrFunction},
    middle::ty::{Type, TypeKind},
};

/// Renders a type in the IR's structural type syntax: named structs print
/// their members, enums print as their underlying type and references print
/// as pointers (an address is an address at this level).
pub fn print_type(ty: &Type) -> String {
    match ty.kind() {
        TypeKind::Pointer(elem) | TypeKind::Reference(elem) => {
            format!("@{}", print_type(elem))
        }
        TypeKind::Array { elem, .. } => format!("[{} {}]", print_type(elem), ty.dimension()),
        TypeKind::DynamicArray { elem } => format!("[{}]", print_type(elem)),
        TypeKind::Struct(s) => {
            format!(
                "{{{}}}",
                s.members.iter().map(|m| print_type(&m.ty)).join(", ")
            )
        }
        TypeKind::Enum(e) => print_type(&e.underlying),
        TypeKind::Function(f) => {
            format!(
                "{}({})",
                print_type(&f.ret),
                f.params
                    .iter()
                    .map(|p| print_type(&p.ty))
                    .chain(f.variadic.then(|| "...".to_string()))
                    .join(", ")
            )
        }
        _ => ty.to_string(),
    }
}

fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    for c in value.chars() {
        match c {
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            '\0' => out.push_str("\\0"),
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            other => out.push(other),
        }
    }
    out
}

struct Printer<'a> {
    ctx: &'a CodegenContext,
    out: String,
    /// Value numbers of the current function
    values: HashMap<InstId, usize>,
    /// Block labels of the current function
    labels: HashMap<crate::backend::ir::BlockId, usize>,
}

pub fn print_ir(ctx: &CodegenContext) -> String {
    let mut printer = Printer {
        ctx,
        out: String::new(),
        values: HashMap::new(),
        labels: HashMap::new(),
    };

    for var in ctx.statics.iter() {
        printer.out.push_str(&format!(
            "static @{} : {}",
            var.name,
            print_type(&var.ty)
        ));

        if let Some(init) = var.init {
            match &ctx.insts[init].data {
                InstData::LitInteger { value } => {
                    printer.out.push_str(&format!(" = lit_integer {value}"));
                }
                InstData::LitString { index } => {
                    printer.out.push_str(&format!(
                        " = lit_string \"{}\"",
                        escape(ctx.strings[*index].value())
                    ));
                }
                other => crate::diag::ice!("invalid static initializer {other:?}"),
            }
        }

        printer.out.push('\n');
    }
    if !ctx.statics.is_empty() {
        printer.out.push('\n');
    }

    let mut first = true;
    for (func_id, func) in ctx.functions.enumerate() {
        if func.is_extern {
            printer.print_declare(func);
            continue;
        }

        if !first {
            printer.out.push('\n');
        }
        first = false;
        printer.print_function(func_id, func);
    }

    printer.out
}

impl<'a> Printer<'a> {
    fn print_declare(&mut self, func: &IrFunction) {
        let f = func.ty.as_function().unwrap();

        self.out.push_str(&format!(
            "declare @{}({}) -> {} {}\n",
            func.name,
            f.params
                .iter()
                .map(|p| print_type(&p.ty))
                .chain(f.variadic.then(|| "...".to_string()))
                .join(", "),
            print_type(&f.ret),
            func.call_conv,
        ));
    }

    fn print_function(&mut self, _func_id: FuncId, func: &IrFunction) {
        self.values.clear();
        self.labels.clear();

        /* Assign value numbers: parameters first, then block instructions */

        for (i, param) in func.parameters.iter().enumerate() {
            self.values.insert(*param, i);
        }

        let mut next = func.parameters.len();
        for (i, block) in func.blocks.iter().enumerate() {
            self.labels.insert(*block, i);

            for inst in &self.ctx.blocks[*block].insts {
                if self.ctx.insts[*inst].produces_value() {
                    self.values.insert(*inst, next);
                    next += 1;
                }
            }
        }

        /* Signature */

        let f = func.ty.as_function().unwrap();
        let params = func
            .parameters
            .iter()
            .zip(f.params.iter())
            .map(|(inst, p)| format!("%{} : {}", self.values[inst], print_type(&p.ty)))
            .chain(f.variadic.then(|| "...".to_string()))
            .join(", ");

        let mut attrs = String::new();
        if func.attr_global {
            attrs.push_str(" global");
        }
        if func.attr_forceinline {
            attrs.push_str(" forceinline");
        }

        self.out.push_str(&format!(
            "function @{}({}) -> {}{} {} {{\n",
            func.name,
            params,
            print_type(&f.ret),
            attrs,
            func.call_conv,
        ));

        for block in &func.blocks {
            self.out.push_str(&format!("bb{}:\n", self.labels[block]));

            for inst in self.ctx.blocks[*block].insts.clone() {
                let line = self.print_inst(inst);
                self.out.push_str("    ");
                self.out.push_str(&line);
                self.out.push('\n');
            }
        }

        self.out.push_str("}\n");
    }

    fn value(&self, inst: InstId) -> String {
        match self.values.get(&inst) {
            Some(n) => format!("%{n}"),
            None => format!("%?{}", crate::index::Index::index(inst)),
        }
    }

    fn label(&self, block: crate::backend::ir::BlockId) -> String {
        match self.labels.get(&block) {
            Some(n) => format!("bb{n}"),
            None => format!("bb?{}", crate::index::Index::index(block)),
        }
    }

    fn print_inst(&self, id: InstId) -> String {
        let inst = &self.ctx.insts[id];
        let opcode = inst.opcode();
        let ty = print_type(&inst.ty);

        let rhs = match &inst.data {
            InstData::Immediate { value } => format!("{opcode} {ty} {value}"),
            InstData::LitInteger { value } => format!("{opcode} {value}"),
            InstData::LitString { index } => {
                format!(
                    "{opcode} \"{}\"",
                    escape(self.ctx.strings[*index].value())
                )
            }
            InstData::StaticRef { var } => {
                format!("{opcode} @{}", self.ctx.statics[*var].name)
            }
            InstData::FuncRef { func } => {
                format!("{opcode} @{}", self.ctx.functions[*func].name)
            }
            InstData::Parameter { index } => format!("{opcode} {ty} {index}"),
            InstData::Register { register } => format!("{opcode} {ty} {register}"),
            InstData::Copy { operand } => format!("{opcode} {}", self.value(*operand)),
            InstData::Load { addr } => format!("{opcode} {ty} {}", self.value(*addr)),
            InstData::Store { value, addr } => {
                format!("{opcode} {} -> {}", self.value(*value), self.value(*addr))
            }
            InstData::Alloca { allocated } => {
                format!("{opcode} {}", print_type(allocated))
            }
            InstData::Phi { args } => {
                format!(
                    "{opcode} {ty} {}",
                    args.iter()
                        .map(|arg| format!("[{} {}]", self.label(arg.block), self.value(arg.value)))
                        .join(", ")
                )
            }
            InstData::Branch { target } => format!("{opcode} {}", self.label(*target)),
            InstData::CondBranch {
                condition,
                then_block,
                else_block,
            } => format!(
                "{opcode} {} {} {}",
                self.value(*condition),
                self.label(*then_block),
                self.label(*else_block)
            ),
            InstData::Return { value: Some(value) } => {
                format!("{opcode} {}", self.value(*value))
            }
            InstData::Return { value: None } => opcode.to_string(),
            InstData::Unreachable => opcode.to_string(),
            InstData::Call {
                callee,
                args,
                tail_call,
            } => {
                let callee = match callee {
                    Callee::Direct(func) => format!("@{}", self.ctx.functions[*func].name),
                    Callee::Indirect(inst) => self.value(*inst),
                };
                format!(
                    "{}call {ty} {callee}({})",
                    if *tail_call { "tail " } else { "" },
                    args.iter().map(|a| self.value(*a)).join(", ")
                )
            }
            InstData::Intrinsic { intrinsic, args } => {
                format!(
                    "{opcode} {ty} {intrinsic}({})",
                    args.iter().map(|a| self.value(*a)).join(", ")
                )
            }
            InstData::Unary { operand, .. } => {
                format!("{opcode} {ty} {}", self.value(*operand))
            }
            InstData::Binary { lhs, rhs, .. } => {
                format!("{opcode} {ty} {}, {}", self.value(*lhs), self.value(*rhs))
            }
        };

        if inst.produces_value() {
            format!("{} = {rhs}", self.value(id))
        } else {
            rhs
        }
    }
}

/// Dumps the IR to stdout. `--debug-ir` uses this between pipeline stages.
pub fn dump_ir(ctx: &CodegenContext) {
    print!("{}", print_ir(ctx));
}
