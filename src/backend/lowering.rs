//! Lowers the analysed AST into IR.
//!
//! Every function gets its blocks emitted through the context's cursor. The
//! lvalue/rvalue contract: `codegen_lvalue` never emits a load, it computes
//! an address and records it in the address table; `codegen_expr` produces
//! the value of an expression, loading through the address when the
//! expression has an lvalue interpretation.

use hashbrown::HashMap;

use crate::{
    backend::ir::{BinaryOpcode, Callee, CodegenContext, FuncId, InstId, StaticId, UnaryOpcode},
    diag::ice,
    frontend::ast::{
        BinaryOp, CastKind, ExprId, ExprKind, Linkage, Module, UnaryOp,
    },
    middle::{
        sema::eval_as_int,
        ty::{Type, TypeKind},
    },
    target::CallingConvention,
};

/// Lowers a fully-analysed module into the codegen context
pub fn lower_module(module: &Module, ctx: &mut CodegenContext) {
    let mut lowerer = Lowerer {
        module,
        ctx,
        values: HashMap::new(),
        addresses: HashMap::new(),
        func_map: HashMap::new(),
        statics_by_decl: Vec::new(),
    };

    lowerer.lower();
}

struct Lowerer<'a> {
    module: &'a Module,
    ctx: &'a mut CodegenContext,
    /// Expression -> the instruction producing its value
    values: HashMap<ExprId, InstId>,
    /// Expression -> the instruction producing its address
    addresses: HashMap<ExprId, InstId>,
    func_map: HashMap<ExprId, FuncId>,
    /// Static variables with the declaration that introduced them; each
    /// function re-references these on entry
    statics_by_decl: Vec<(ExprId, StaticId)>,
}

/// Maps a semantic type onto its IR shape: references are addresses and
/// enums are their underlying integers
fn ir_type(ty: &Type) -> Type {
    match ty.kind() {
        TypeKind::Reference(elem) => Type::pointer(ir_type(elem)),
        TypeKind::Pointer(elem) => Type::pointer(ir_type(elem)),
        TypeKind::Array { elem, .. } => Type::array_of(ir_type(elem), ty.dimension()),
        TypeKind::Enum(e) => e.underlying.clone(),
        _ => ty.clone(),
    }
}

impl<'a> Lowerer<'a> {
    fn lower(&mut self) {
        /* Create every function up front so that calls can reference them */

        let mut decls: Vec<ExprId> = Vec::new();
        if let Some(top_level) = self.module.top_level {
            decls.push(top_level);
        }
        decls.extend(self.module.functions.iter().copied());

        for decl_id in &decls {
            let ExprKind::FuncDecl(decl) = &self.module.expr(*decl_id).kind else {
                ice!("function list contains a non-function");
            };

            let func = self.ctx.create_function(decl.name, ir_type(&decl.ty));
            self.ctx.functions[func].call_conv =
                decl.ty.as_function().map(|f| f.call_conv).unwrap_or_default();

            if decl.body.is_none() {
                self.ctx.functions[func].is_extern = true;
            }
            if decl.linkage == Linkage::Exported {
                self.ctx.functions[func].attr_global = true;
            }
            if decl.forceinline {
                self.ctx.functions[func].attr_forceinline = true;
            }

            self.func_map.insert(*decl_id, func);
        }

        /* Emit bodies; the top-level function comes first so that statics
         * exist before other functions reference them */

        for decl_id in &decls {
            let ExprKind::FuncDecl(decl) = &self.module.expr(*decl_id).kind else {
                unreachable!();
            };
            if decl.body.is_some() {
                self.codegen_function(*decl_id);
            }
        }
    }

    fn codegen_function(&mut self, decl_id: ExprId) {
        let ExprKind::FuncDecl(decl) = self.module.expr(decl_id).kind.clone() else {
            unreachable!();
        };
        let func = self.func_map[&decl_id];
        let entry = self.ctx.functions[func].blocks[0];

        self.ctx.function = Some(func);
        self.ctx.block = Some(entry);

        /* Re-reference already emitted static variables */

        for (static_decl, var) in self.statics_by_decl.clone() {
            let address = self.ctx.static_reference(var);
            self.addresses.insert(static_decl, address);
        }

        /* Materialize parameters: register parameters are stored into stack
         * slots, memory parameters are already pointers */

        let max_register_args = match self.ctx.target.call_convention {
            CallingConvention::Linux => 6,
            CallingConvention::MsWin => 4,
        };

        for (i, param_decl) in decl.params.iter().enumerate() {
            let param_inst = self.ctx.functions[func].parameters[i];

            if i < max_register_args {
                self.codegen_lvalue(*param_decl);
                let address = self.addresses[param_decl];
                self.ctx.store(param_inst, address);
            } else {
                let pointee = self.ctx.insts[param_inst].ty.clone();
                self.ctx.insts[param_inst].ty = Type::pointer(pointee);
                self.addresses.insert(*param_decl, param_inst);
            }
        }

        /* The body, then the implicit return */

        let body = decl.body.unwrap();
        let body_value = self.codegen_expr(body);

        let current = self.ctx.block.unwrap();
        if !self.ctx.is_closed(current) {
            let ret_ty = self.ctx.functions[func].return_type();

            if ret_ty.is_void() {
                self.ctx.ret(None);
            } else if let Some(value) = body_value {
                self.ctx.ret(Some(value));
            } else if self.module.top_level == Some(decl_id) {
                // The program body implicitly evaluates to 0
                let zero = self.ctx.immediate(Type::int(), 0);
                self.ctx.ret(Some(zero));
            } else {
                self.ctx.ret(None);
            }
        }
    }

    /* lvalues */

    /// Computes the address of an lvalue expression. Never emits a load.
    fn codegen_lvalue(&mut self, id: ExprId) {
        if self.addresses.contains_key(&id) {
            return;
        }

        match self.module.expr(id).kind.clone() {
            ExprKind::VarDecl(decl) => {
                let address = if decl.is_static {
                    let var = self
                        .ctx
                        .create_static(decl.name, ir_type(&decl.ty));
                    self.statics_by_decl.push((id, var));

                    let address = self.ctx.static_reference(var);
                    self.addresses.insert(id, address);

                    if let Some(init) = decl.init {
                        self.lower_static_initializer(var, init, &decl.ty);
                    }
                    return;
                } else {
                    let address = self.ctx.stack_allocate(ir_type(&decl.ty));
                    self.addresses.insert(id, address);
                    address
                };

                if let Some(init) = decl.init {
                    let value = self.expr_value(init);
                    self.ctx.store(value, address);
                }
            }

            ExprKind::NameRef { target, name, .. } => {
                let target = target.unwrap_or_else(|| ice!("unresolved name '{name}'"));
                let Some(address) = self.addresses.get(&target).copied() else {
                    ice!("referencing variable '{name}' before it was emitted");
                };
                self.addresses.insert(id, address);
            }

            ExprKind::MemberAccess {
                object,
                index: Some(index),
                ..
            } => {
                self.codegen_lvalue(object);
                let base = self.addresses[&object];

                let object_ty = self.module.expr(object).ty.strip_references();
                let member = &object_ty.as_struct().unwrap().members[index];
                let offset = *member.byte_offset.get().unwrap() as u64;

                let offset_inst = self.ctx.immediate(Type::int(), offset);
                let address = self.ctx.binary(BinaryOpcode::Add, base, offset_inst);
                self.ctx.insts[address].ty = Type::pointer(ir_type(&member.ty));

                self.addresses.insert(id, address);
            }

            ExprKind::Unary {
                op: UnaryOp::Deref,
                operand,
            } => {
                let value = self.expr_value(operand);
                self.addresses.insert(id, value);
            }

            ExprKind::Cast {
                cast_kind: CastKind::ReferenceToLValue,
                operand,
                ..
            } => {
                // The reference's value is the address of the lvalue
                let value = self.expr_value(operand);
                self.addresses.insert(id, value);
            }

            ExprKind::StringLiteral { index } => {
                let address = self.lower_string_literal(id, index);
                self.addresses.insert(id, address);
            }

            ExprKind::Binary {
                op: BinaryOp::Subscript,
                lhs,
                rhs,
            } => {
                let address = self.subscript_address(id, lhs, rhs);
                self.addresses.insert(id, address);
            }

            other => ice!("expression kind {other:?} is not an lvalue"),
        }
    }

    fn lower_static_initializer(&mut self, var: StaticId, init: ExprId, ty: &Type) {
        /* Integer and string literal initializers fold into the static
         * itself; anything else is stored at runtime by the enclosing
         * function */

        let mut literal = init;
        while let ExprKind::Cast { operand, .. } = self.module.expr(literal).kind {
            literal = operand;
        }

        match self.module.expr(literal).kind {
            ExprKind::IntegerLiteral(value)
            | ExprKind::EvaluatedConstant { value, .. } => {
                let inst = self.ctx.literal_integer(ir_type(ty), value);
                self.ctx.statics[var].init = Some(inst);
            }
            ExprKind::BoolLiteral(value) => {
                let inst = self.ctx.literal_integer(ir_type(ty), value as u64);
                self.ctx.statics[var].init = Some(inst);
            }
            ExprKind::StringLiteral { index } => {
                let symbol = self.module.strings[index];
                let index = self.ctx.intern_string(symbol);
                let inst = self.ctx.literal_string(ir_type(ty), index);
                self.ctx.statics[var].init = Some(inst);
            }
            _ => {
                let value = self.expr_value(init);
                let address = self.addresses[&self
                    .statics_by_decl
                    .iter()
                    .find(|(_, v)| *v == var)
                    .map(|(d, _)| *d)
                    .unwrap()];
                self.ctx.store(value, address);
            }
        }
    }

    fn lower_string_literal(&mut self, id: ExprId, index: usize) -> InstId {
        let symbol = self.module.strings[index];
        let name = self.ctx.next_string_literal_name();

        let ty = ir_type(&self.module.expr(id).ty.strip_references());
        let var = self.ctx.create_static(name, ty.clone());

        let data_index = self.ctx.intern_string(symbol);
        let init = self.ctx.literal_string(ty, data_index);
        self.ctx.statics[var].init = Some(init);

        self.ctx.static_reference(var)
    }

    /// The address of `lhs[rhs]`: decay the base to a pointer to the element
    /// type, scale the index by the element size and add. Constant-zero
    /// indices reuse the base pointer directly.
    fn subscript_address(&mut self, id: ExprId, lhs: ExprId, rhs: ExprId) -> InstId {
        let elem_ty = ir_type(&self.module.expr(id).ty);
        let base_ty = self.module.expr(lhs).ty.strip_references();

        let base = if base_ty.is_array() {
            // Pointer to the array decays to a pointer to its first element
            self.codegen_lvalue(lhs);
            let address = self.addresses[&lhs];
            let decayed = self.ctx.copy(address);
            self.ctx.insts[decayed].ty = Type::pointer(elem_ty.clone());
            decayed
        } else {
            self.expr_value(lhs)
        };

        if eval_as_int(self.module, rhs) == Some(0) {
            return base;
        }

        let index = self.expr_value(rhs);
        let elem_size = elem_ty.size(&self.ctx.target) as u64;
        let size_inst = self.ctx.immediate(Type::int(), elem_size);
        let scaled = self.ctx.binary(BinaryOpcode::Mul, index, size_inst);

        let address = self.ctx.binary(BinaryOpcode::Add, base, scaled);
        self.ctx.insts[address].ty = Type::pointer(elem_ty);
        address
    }

    /* rvalues */

    /// Emits an expression. Declarations and void control flow produce no
    /// value.
    fn codegen_expr(&mut self, id: ExprId) -> Option<InstId> {
        if let Some(value) = self.values.get(&id) {
            return Some(*value);
        }

        let value = self.codegen_expr_uncached(id);
        if let Some(value) = value {
            self.values.insert(id, value);
        }
        value
    }

    /// The value of an expression that must produce one
    fn expr_value(&mut self, id: ExprId) -> InstId {
        self.codegen_expr(id)
            .unwrap_or_else(|| ice!("expression was expected to produce a value"))
    }

    fn codegen_expr_uncached(&mut self, id: ExprId) -> Option<InstId> {
        let expr_ty = ir_type(&self.module.expr(id).ty);

        match self.module.expr(id).kind.clone() {
            ExprKind::IntegerLiteral(value) => Some(self.ctx.immediate(expr_ty, value)),
            ExprKind::BoolLiteral(value) => Some(self.ctx.immediate(Type::bool(), value as u64)),
            ExprKind::EvaluatedConstant { value, .. } => Some(self.ctx.immediate(expr_ty, value)),

            ExprKind::StringLiteral { .. } => {
                self.codegen_lvalue(id);
                Some(self.addresses[&id])
            }

            ExprKind::VarDecl(_) => {
                self.codegen_lvalue(id);
                None
            }

            ExprKind::EnumeratorDecl { .. }
            | ExprKind::TypeDecl { .. }
            | ExprKind::TypeAliasDecl { .. } => None,

            ExprKind::NameRef { target, .. } => {
                let target = target.unwrap();

                if let ExprKind::FuncDecl(_) = self.module.expr(target).kind {
                    return Some(self.ctx.funcref(self.func_map[&target]));
                }

                self.codegen_lvalue(id);
                let address = self.addresses[&id];
                Some(self.ctx.load(expr_ty, address))
            }

            ExprKind::MemberAccess { .. } => {
                self.codegen_lvalue(id);
                let address = self.addresses[&id];
                Some(self.ctx.load(expr_ty, address))
            }

            ExprKind::Cast {
                cast_kind,
                operand,
                target,
            } => Some(self.codegen_cast(id, cast_kind, operand, &target)),

            ExprKind::Binary { op, lhs, rhs } => Some(self.codegen_binary(id, op, lhs, rhs)),
            ExprKind::Unary { op, operand } => Some(self.codegen_unary(id, op, operand)),

            ExprKind::Call { callee, args } => {
                /* Direct calls go straight to known functions */

                let call = if let Some(func) = self.direct_callee(callee) {
                    self.ctx.direct_call(func)
                } else {
                    let callee_value = self.expr_value(callee);
                    self.ctx.indirect_call(callee_value, expr_ty)
                };

                for arg in &args {
                    let value = self.expr_value(*arg);
                    self.ctx.add_call_argument(call, value);
                }

                Some(self.ctx.insert(call))
            }

            ExprKind::IntrinsicCall { intrinsic, args } => {
                let args = args.iter().map(|a| self.expr_value(*a)).collect();
                Some(self.ctx.intrinsic(intrinsic, args, expr_ty))
            }

            ExprKind::If {
                condition,
                then_branch,
                else_branch,
            } => self.codegen_if(id, condition, then_branch, else_branch),

            ExprKind::While { condition, body } => {
                self.codegen_while(condition, body);
                None
            }

            ExprKind::For {
                init,
                condition,
                increment,
                body,
            } => {
                self.codegen_for(init, condition, increment, body);
                None
            }

            ExprKind::Block { children, .. } => {
                let mut last = None;
                for child in &children {
                    if matches!(self.module.expr(*child).kind, ExprKind::FuncDecl(_)) {
                        continue;
                    }
                    last = self.codegen_expr(*child);

                    // Nothing after a diverging statement is reachable
                    if self.ctx.block.is_some_and(|b| self.ctx.is_closed(b)) {
                        break;
                    }
                }

                last
            }

            ExprKind::Return { value } => {
                let value = value.map(|v| self.expr_value(v));
                self.ctx.ret(value);
                None
            }

            ExprKind::CompoundLiteral { values } => {
                Some(self.codegen_compound_literal(id, values))
            }

            ExprKind::FuncDecl(_) => {
                let func = self.func_map[&id];
                Some(self.ctx.funcref(func))
            }

            other => ice!("cannot lower expression kind {other:?}"),
        }
    }

    fn direct_callee(&self, callee: ExprId) -> Option<FuncId> {
        match &self.module.expr(callee).kind {
            ExprKind::NameRef {
                target: Some(target),
                ..
            } => match self.module.expr(*target).kind {
                ExprKind::FuncDecl(_) => self.func_map.get(target).copied(),
                _ => None,
            },
            ExprKind::FuncDecl(_) => self.func_map.get(&callee).copied(),
            _ => None,
        }
    }

    fn codegen_cast(
        &mut self,
        id: ExprId,
        cast_kind: CastKind,
        operand: ExprId,
        target: &Type,
    ) -> InstId {
        match cast_kind {
            CastKind::LValueToRValue => {
                self.codegen_lvalue(operand);
                let address = self.addresses[&operand];
                let ty = ir_type(&self.module.expr(id).ty);
                return self.ctx.load(ty, address);
            }

            CastKind::LValueToReference => {
                self.codegen_lvalue(operand);
                return self.addresses[&operand];
            }

            CastKind::ReferenceToLValue => {
                let value = self.expr_value(operand);
                self.addresses.insert(id, value);
                return value;
            }

            CastKind::Soft | CastKind::Hard | CastKind::Implicit => {}
        }

        let target_ir = ir_type(target);
        let from_ty = self.module.expr(operand).ty.strip_references();

        /* Array decay reuses the array's address as the element pointer */

        if from_ty.is_array() && target_ir.is_pointer() {
            self.codegen_lvalue(operand);
            let address = self.addresses[&operand];
            let decayed = self.ctx.copy(address);
            self.ctx.insts[decayed].ty = target_ir;
            return decayed;
        }

        let value = self.expr_value(operand);

        let from_size = ir_type(&from_ty).size(&self.ctx.target);
        let to_size = target_ir.size(&self.ctx.target);

        if from_size == to_size {
            return self.ctx.unary(UnaryOpcode::Bitcast, target_ir, value);
        }

        if from_size < to_size {
            // Smaller to larger: sign extend signed sources, zero extend
            // everything else
            let signed = from_ty
                .integer_info(&self.ctx.target)
                .map(|(_, signed)| signed)
                .unwrap_or(false);

            let op = if signed {
                UnaryOpcode::SignExtend
            } else {
                UnaryOpcode::ZeroExtend
            };
            return self.ctx.unary(op, target_ir, value);
        }

        self.ctx.unary(UnaryOpcode::Truncate, target_ir, value)
    }

    fn codegen_binary(&mut self, id: ExprId, op: BinaryOp, lhs: ExprId, rhs: ExprId) -> InstId {
        match op {
            BinaryOp::Assign => {
                // The right-hand side is needed in any case
                let value = self.expr_value(rhs);
                self.codegen_lvalue(lhs);
                let address = self.addresses[&lhs];
                self.ctx.store(value, address);
                value
            }

            BinaryOp::Subscript => {
                let address = self.subscript_address(id, lhs, rhs);
                self.addresses.insert(id, address);
                address
            }

            _ => {
                let lhs_ty = self.module.expr(lhs).ty.clone();
                let a = self.expr_value(lhs);
                let b = self.expr_value(rhs);

                let opcode = match op {
                    BinaryOp::Add => BinaryOpcode::Add,
                    BinaryOp::Sub => BinaryOpcode::Sub,
                    BinaryOp::Mul => BinaryOpcode::Mul,
                    BinaryOp::Div => BinaryOpcode::Div,
                    BinaryOp::Mod => BinaryOpcode::Mod,
                    BinaryOp::Shl => BinaryOpcode::Shl,
                    BinaryOp::Shr => {
                        // Arithmetic shift for signed operands
                        let signed = lhs_ty
                            .integer_info(&self.ctx.target)
                            .map(|(_, s)| s)
                            .unwrap_or(false);
                        if signed { BinaryOpcode::Sar } else { BinaryOpcode::Shr }
                    }
                    BinaryOp::And => BinaryOpcode::And,
                    BinaryOp::Or => BinaryOpcode::Or,
                    BinaryOp::Eq => BinaryOpcode::Eq,
                    BinaryOp::Ne => BinaryOpcode::Ne,
                    BinaryOp::Lt => BinaryOpcode::Lt,
                    BinaryOp::Le => BinaryOpcode::Le,
                    BinaryOp::Gt => BinaryOpcode::Gt,
                    BinaryOp::Ge => BinaryOpcode::Ge,
                    BinaryOp::Assign | BinaryOp::Subscript => unreachable!(),
                };

                self.ctx.binary(opcode, a, b)
            }
        }
    }

    fn codegen_unary(&mut self, id: ExprId, op: UnaryOp, operand: ExprId) -> InstId {
        match op {
            UnaryOp::Deref => {
                // The dereference designates storage; reads go through an
                // lvalue-to-rvalue conversion above this node
                self.codegen_lvalue(id);
                self.addresses[&id]
            }

            UnaryOp::AddressOf => {
                self.codegen_lvalue(operand);
                self.addresses[&operand]
            }

            UnaryOp::BitwiseNot => {
                let value = self.expr_value(operand);
                let ty = self.ctx.insts[value].ty.clone();
                self.ctx.unary(UnaryOpcode::Not, ty, value)
            }

            UnaryOp::Negate => {
                let value = self.expr_value(operand);
                let ty = self.ctx.insts[value].ty.clone();
                let zero = self.ctx.immediate(ty, 0);
                self.ctx.binary(BinaryOpcode::Sub, zero, value)
            }

            UnaryOp::Plus => self.expr_value(operand),
        }
    }

    /// If expression.
    ///
    /// ```text
    ///      +---------+
    ///      | current |
    ///      +---------+
    ///     /           \
    /// +------+    +------+
    /// | then |    | else |
    /// +------+    +------+
    ///         \  /
    ///       +------+
    ///       | join |
    ///       +------+
    /// ```
    fn codegen_if(
        &mut self,
        id: ExprId,
        condition: ExprId,
        then_branch: ExprId,
        else_branch: Option<ExprId>,
    ) -> Option<InstId> {
        let cond_value = self.expr_value(condition);

        let then_block = self.ctx.block_create();
        let else_block = self.ctx.block_create();
        let join_block = self.ctx.block_create();

        self.ctx.branch_conditional(cond_value, then_block, else_block);

        /* Then */

        self.ctx.block_attach(then_block);
        let then_value = self.codegen_expr(then_branch);

        let last_then_block = self.ctx.block.unwrap();
        let then_open = !self.ctx.is_closed(last_then_block);
        if then_open {
            self.ctx.branch(join_block);
        }

        /* Else */

        self.ctx.block_attach(else_block);
        let mut else_value = None;
        if let Some(e) = else_branch {
            else_value = self.codegen_expr(e);
        }

        let last_else_block = self.ctx.block.unwrap();
        let else_open = !self.ctx.is_closed(last_else_block);
        if else_open {
            self.ctx.branch(join_block);
        }

        self.ctx.block_attach(join_block);

        /* A value-producing if merges its arms through a PHI */

        let ty = ir_type(&self.module.expr(id).ty);
        if !ty.is_void() {
            let phi = self.ctx.phi(ty);
            if let (true, Some(value)) = (then_open, then_value) {
                self.ctx.phi_argument(phi, last_then_block, value);
            }
            if let (true, Some(value)) = (else_open, else_value) {
                self.ctx.phi_argument(phi, last_else_block, value);
            }
            return Some(phi);
        }

        None
    }

    /// While expression. An empty body collapses onto the condition block.
    fn codegen_while(&mut self, condition: ExprId, body: ExprId) {
        let cond_block = self.ctx.block_create();
        let join_block = self.ctx.block_create();

        self.ctx.branch(cond_block);
        self.ctx.block_attach(cond_block);
        let cond_value = self.expr_value(condition);

        let body_is_empty = matches!(
            &self.module.expr(body).kind,
            ExprKind::Block { children, .. } if children.is_empty()
        );

        if body_is_empty {
            self.ctx.branch_conditional(cond_value, cond_block, join_block);
            self.ctx.block_attach(join_block);
            return;
        }

        let body_block = self.ctx.block_create();
        self.ctx.branch_conditional(cond_value, body_block, join_block);

        self.ctx.block_attach(body_block);
        self.codegen_expr(body);

        let last = self.ctx.block.unwrap();
        if !self.ctx.is_closed(last) {
            self.ctx.branch(cond_block);
        }

        self.ctx.block_attach(join_block);
    }

    fn codegen_for(&mut self, init: ExprId, condition: ExprId, increment: ExprId, body: ExprId) {
        let cond_block = self.ctx.block_create();
        let body_block = self.ctx.block_create();
        let join_block = self.ctx.block_create();

        self.codegen_expr(init);
        self.ctx.branch(cond_block);

        self.ctx.block_attach(cond_block);
        let cond_value = self.expr_value(condition);
        self.ctx.branch_conditional(cond_value, body_block, join_block);

        self.ctx.block_attach(body_block);
        self.codegen_expr(body);
        self.codegen_expr(increment);

        let last = self.ctx.block.unwrap();
        if !self.ctx.is_closed(last) {
            self.ctx.branch(cond_block);
        }

        self.ctx.block_attach(join_block);
    }

    /// Compound array literals allocate the array and store each element at
    /// its running address
    fn codegen_compound_literal(&mut self, id: ExprId, values: Vec<ExprId>) -> InstId {
        let array_ty = ir_type(&self.module.expr(id).ty);
        let elem_ty = array_ty.elem();
        let elem_size = elem_ty.size(&self.ctx.target) as u64;

        let slot = self.ctx.stack_allocate(array_ty.clone());

        let mut address = self.ctx.copy(slot);
        self.ctx.insts[address].ty = Type::pointer(elem_ty);

        for (i, value) in values.iter().enumerate() {
            let v = self.expr_value(*value);
            self.ctx.store(v, address);

            if i != values.len() - 1 {
                let size = self.ctx.immediate(Type::int(), elem_size);
                let next = self.ctx.binary(BinaryOpcode::Add, address, size);
                self.ctx.insts[next].ty = self.ctx.insts[address].ty.clone();
                address = next;
            }
        }

        self.ctx.load(array_ty, slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::{
            AsmDialect, OutputFormat,
            ir::{validate, InstData, Opcode},
        },
        diag::Context,
        frontend::{parser::Parser, SourceFile},
        middle::sema,
        target::{CallingConvention, Target},
    };

    fn lower(source: &str) -> CodegenContext {
        let ctx = Context::new(SourceFile::in_memory(source));
        let mut module = Parser::parse_module(&ctx, "test");
        let target = Target::x86_64(CallingConvention::Linux);
        sema::analyse_module(&ctx, &mut module, &target);
        assert!(!ctx.has_error(), "source failed sema");

        let mut cg = CodegenContext::new(OutputFormat::Ir, AsmDialect::Intel, target);
        lower_module(&module, &mut cg);
        cg
    }

    fn func_by_name<'a>(ctx: &'a CodegenContext, name: &str) -> &'a crate::backend::ir::IrFunction {
        ctx.functions
            .iter()
            .find(|f| f.name.value() == name)
            .unwrap_or_else(|| panic!("no function named {name}"))
    }

    fn opcodes_of(ctx: &CodegenContext, name: &str) -> Vec<Opcode> {
        func_by_name(ctx, name)
            .blocks
            .iter()
            .flat_map(|b| &ctx.blocks[*b].insts)
            .map(|i| ctx.insts[*i].opcode())
            .collect()
    }

    #[test]
    fn arithmetic_lowers_to_add_of_mul() {
        let ctx = lower("2 + 3 * 4");

        let ops = opcodes_of(&ctx, "main");
        assert!(ops.contains(&Opcode::Mul));
        assert!(ops.contains(&Opcode::Add));
        assert_eq!(*ops.last().unwrap(), Opcode::Return);

        // The multiply feeds the add
        let main = func_by_name(&ctx, "main");
        let entry = main.blocks[0];
        let mul = ctx.blocks[entry]
            .insts
            .iter()
            .copied()
            .find(|i| ctx.insts[*i].opcode() == Opcode::Mul)
            .unwrap();
        let add = ctx.blocks[entry]
            .insts
            .iter()
            .copied()
            .find(|i| ctx.insts[*i].opcode() == Opcode::Add)
            .unwrap();
        assert!(ctx.insts[mul].users.contains(&add));

        assert!(validate(&ctx).is_empty());
    }

    #[test]
    fn value_if_produces_phi_with_both_arms() {
        let ctx = lower("x : bool = true\ny :: if x { 1 } else { 2 }");

        let main = func_by_name(&ctx, "main");
        assert_eq!(main.blocks.len(), 4, "current, then, else, join");

        let join = main.blocks[3];
        let phi = ctx.blocks[join]
            .insts
            .iter()
            .copied()
            .find(|i| ctx.insts[*i].opcode() == Opcode::Phi)
            .expect("no phi in the join block");

        let InstData::Phi { args } = &ctx.insts[phi].data else {
            unreachable!();
        };
        assert_eq!(args.len(), 2);
        assert_eq!(args[0].block, main.blocks[1]);
        assert_eq!(args[1].block, main.blocks[2]);

        assert!(validate(&ctx).is_empty());
    }

    #[test]
    fn while_loop_shapes_cfg() {
        let ctx = lower("i :: 0\nn :: 10\nwhile i < n { i := i + 1 }");

        let main = func_by_name(&ctx, "main");
        // entry, cond, body, join
        assert_eq!(main.blocks.len(), 4);

        let cond = main.blocks[1];
        let body = main.blocks[2];
        let join = main.blocks[3];

        // The condition block ends in a conditional branch to body/join
        let last_cond = *ctx.blocks[cond].insts.last().unwrap();
        let InstData::CondBranch {
            then_block,
            else_block,
            ..
        } = ctx.insts[last_cond].data
        else {
            panic!("condition block does not end in a conditional branch");
        };
        assert_eq!(then_block, body);
        assert_eq!(else_block, join);

        // The body branches back to the condition
        let last_body = *ctx.blocks[body].insts.last().unwrap();
        assert!(matches!(
            ctx.insts[last_body].data,
            InstData::Branch { target } if target == cond
        ));

        assert!(validate(&ctx).is_empty());
    }

    #[test]
    fn empty_while_body_omits_the_body_block() {
        let ctx = lower("x : bool = false\nwhile x { }");

        let main = func_by_name(&ctx, "main");
        // entry, cond, join: no body block
        assert_eq!(main.blocks.len(), 3);

        let cond = main.blocks[1];
        let last = *ctx.blocks[cond].insts.last().unwrap();
        let InstData::CondBranch { then_block, .. } = ctx.insts[last].data else {
            panic!();
        };
        assert_eq!(then_block, cond, "loop branches back to the condition");

        assert!(validate(&ctx).is_empty());
    }

    #[test]
    fn byte_to_int_return_inserts_zero_extend() {
        let ctx = lower("widen : int(b : byte) { b }");

        let ops = opcodes_of(&ctx, "widen");
        assert!(
            ops.contains(&Opcode::ZeroExtend),
            "byte widens with a zero extension, got {ops:?}"
        );
    }

    #[test]
    fn calls_to_known_functions_are_direct() {
        let ctx = lower("g : int() { 42 }\ng()");

        let main = func_by_name(&ctx, "main");
        let call = main
            .blocks
            .iter()
            .flat_map(|b| &ctx.blocks[*b].insts)
            .copied()
            .find(|i| ctx.insts[*i].opcode() == Opcode::Call)
            .expect("no call emitted");

        let InstData::Call { callee, .. } = &ctx.insts[call].data else {
            unreachable!();
        };
        assert!(matches!(callee, Callee::Direct(_)));
    }

    #[test]
    fn constant_zero_subscript_elides_the_scaling() {
        let ctx = lower("buf : int[4] = [1, 2, 3, 4]\nbuf[0]");
        let ops_zero = opcodes_of(&ctx, "main");

        let ctx = lower("buf : int[4] = [1, 2, 3, 4]\nbuf[2]");
        let ops_two = opcodes_of(&ctx, "main");

        // The non-zero subscript needs a multiply that the zero one doesn't
        let muls = |ops: &[Opcode]| ops.iter().filter(|o| **o == Opcode::Mul).count();
        assert_eq!(muls(&ops_two), muls(&ops_zero) + 1);
    }

    #[test]
    fn string_literal_becomes_static_with_string_init() {
        let ctx = lower(r#"s :: "hi""#);

        let var = ctx
            .statics
            .iter()
            .find(|v| v.name.value().starts_with("__str_lit"))
            .expect("no string literal static");

        let init = var.init.expect("string static has no initializer");
        assert_eq!(ctx.insts[init].opcode(), Opcode::LitString);
    }

    #[test]
    fn lowered_modules_validate() {
        let ctx = lower(
            "fib : int(n : int) {\n\
                 if n < 2 { n } else { fib(n - 1) + fib(n - 2) }\n\
             }\n\
             fib(10)",
        );
        assert!(validate(&ctx).is_empty());
    }
}
