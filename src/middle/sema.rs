//! The semantic analyzer.
//!
//! Sema walks every top-level declaration and every function body, resolving
//! names and types and rewriting expression handles in place to insert
//! implicit casts, lvalue-to-rvalue conversions and operator rewrites. After
//! analysis every expression is either done or errored; the driver checks the
//! context's error flag before running lowering.
//!
//! Conversions are scored so that overload resolution can rank candidates:
//! `try_convert` returns -2 for already-errored expressions, -1 when no legal
//! conversion exists, 0 for a no-op and a positive number (lower is better)
//! for every legal non-trivial conversion.

use std::rc::Rc;

use crate::{
    diag::{Context, Diag},
    frontend::ast::{
        BinaryOp, CastKind, ExprId, ExprKind, Intrinsic, Linkage, Module, ScopeId, SemaState,
        UnaryOp, VarDecl,
    },
    frontend::lexer::Span,
    middle::ty::{
        align_to, CallConv, FfiKind, FuncParam, StructMember, StructType, Type, TypeKind,
    },
    target::Target,
};

/// Performs semantic analysis on the given module. Errors are reported
/// through the context; check its error flag afterwards.
pub fn analyse_module(ctx: &Context, module: &mut Module, target: &Target) {
    let mut sema = Sema {
        ctx,
        module,
        target,
        curr_func: Vec::new(),
    };

    sema.analyse_all();
}

struct Sema<'a> {
    ctx: &'a Context,
    module: &'a mut Module,
    target: &'a Target,
    /// Stack of functions whose bodies are being analysed; the top entry
    /// types `return` statements
    curr_func: Vec<ExprId>,
}

impl<'a> Sema<'a> {
    fn analyse_all(&mut self) {
        // Function signatures come first so that calls can reference
        // functions declared later in the file
        for func in self.module.functions.clone() {
            self.analyse_function_signature(func);
        }

        if let Some(mut top_level) = self.module.top_level {
            let _ = self.analyse(&mut top_level, None);
            self.module.top_level = Some(top_level);
        }

        for mut func in self.module.functions.clone() {
            let _ = self.analyse(&mut func, None);
        }
    }

    /* Helpers */

    fn expr_span(&self, id: ExprId) -> Span {
        self.module.expr(id).span
    }

    fn expr_ty(&self, id: ExprId) -> Type {
        self.module.expr(id).ty.clone()
    }

    fn is_errored(&self, id: ExprId) -> bool {
        self.module.expr(id).state == SemaState::Errored
    }

    fn error(&self, span: Span, message: impl Into<String>) {
        Diag::error(self.ctx, span, message).emit();
    }

    fn finish(&mut self, id: ExprId, ty: Type, lvalue: bool) -> bool {
        let expr = self.module.expr_mut(id);
        expr.ty = ty;
        expr.lvalue = lvalue;
        expr.state = SemaState::Done;
        true
    }

    fn fail(&mut self, id: ExprId) -> bool {
        let expr = self.module.expr_mut(id);
        expr.ty = Type::error();
        expr.state = SemaState::Errored;
        false
    }

    /// Replaces the expression behind `slot` with a cast of the given kind
    /// whose operand is the original expression
    fn wrap_with_cast(&mut self, slot: &mut ExprId, ty: Type, kind: CastKind, lvalue: bool) {
        let span = self.expr_span(*slot);
        let cast = self.module.alloc(
            ExprKind::Cast {
                cast_kind: kind,
                operand: *slot,
                target: ty.clone(),
            },
            span,
        );

        let expr = self.module.expr_mut(cast);
        expr.ty = ty;
        expr.lvalue = lvalue;
        expr.state = SemaState::Done;

        *slot = cast;
    }

    /// Converts lvalues to rvalues and leaves rvalues unchanged. References
    /// are first unwrapped to lvalues of their referenced type.
    fn lvalue_to_rvalue(&mut self, slot: &mut ExprId) {
        if self.is_errored(*slot) {
            return;
        }

        let ty = self.expr_ty(*slot);
        if ty.is_reference() {
            self.wrap_with_cast(slot, ty.strip_references(), CastKind::ReferenceToLValue, true);
        }

        if self.module.expr(*slot).lvalue {
            let ty = self.expr_ty(*slot);
            self.wrap_with_cast(slot, ty, CastKind::LValueToRValue, false);
        }
    }

    /* Conversion ladder */

    /// Attempts to convert an expression to a type without performing the
    /// conversion. Returns -2 if the expression is errored, -1 if no legal
    /// conversion exists, 0 for a no-op and a positive badness score
    /// otherwise.
    fn try_convert(&mut self, slot: ExprId, to: &Type) -> i32 {
        let mut probe = slot;
        let score = self.convert_impl(&mut probe, to, false);
        debug_assert_eq!(probe, slot, "try_convert must not rewrite");
        score
    }

    /// Converts an expression to a type, rewriting the handle to insert the
    /// required casts. Errored expressions convert successfully so that one
    /// root cause produces one diagnostic.
    fn convert(&mut self, slot: &mut ExprId, to: &Type) -> bool {
        self.convert_impl(slot, to, true) != -1
    }

    fn convert_or_error(&mut self, slot: &mut ExprId, to: &Type) -> bool {
        if self.convert(slot, to) {
            return true;
        }

        let span = self.expr_span(*slot);
        let from = self.expr_ty(*slot);
        self.error(span, format!("no implicit conversion from {from} to {to}"));
        false
    }

    fn convert_impl(&mut self, slot: &mut ExprId, to: &Type, perform: bool) -> i32 {
        if self.is_errored(*slot) || to.is_error() {
            return -2;
        }

        let from = self.expr_ty(*slot);
        let mut score = 0;

        /* Reference binding */

        if to.is_reference() {
            let to_elem = to.elem();

            if self.module.expr(*slot).lvalue && Type::equal(&from, &to_elem) {
                if perform {
                    self.wrap_with_cast(slot, to.clone(), CastKind::LValueToReference, false);
                }
                return 1;
            }

            if Type::equal(&from, to) {
                return 0;
            }

            return -1;
        }

        /* References decay to lvalues of their referenced type */

        let mut from = from;
        let mut is_lvalue = self.module.expr(*slot).lvalue;
        if from.is_reference() {
            from = from.strip_references();
            is_lvalue = true;
            if perform {
                self.wrap_with_cast(slot, from.clone(), CastKind::ReferenceToLValue, true);
            }
        }

        /* Array decay takes the address, so it happens before rvalue conversion */

        if is_lvalue && from.is_array() && to.is_pointer() && Type::equal(&from.elem(), &to.elem())
        {
            if perform {
                self.wrap_with_cast(slot, to.clone(), CastKind::Implicit, false);
            }
            return score + 2;
        }

        /* Function values convert to pointers to themselves */

        if from.is_function() && to.is_pointer() && Type::equal(&from, &to.elem()) {
            if perform {
                self.wrap_with_cast(slot, to.clone(), CastKind::Implicit, false);
            }
            return score + 1;
        }

        /* Overload sets resolve against concrete function types */

        if from.is_overload_set() {
            return self.resolve_overload_against(slot, to, perform);
        }

        /* lvalue -> rvalue is mandatory before using a value */

        if is_lvalue {
            score += 1;
            if perform {
                self.wrap_with_cast(slot, from.clone(), CastKind::LValueToRValue, false);
            }
        }

        /* Identity */

        if Type::equal(&from, to) {
            return score;
        }

        /* Integer literals convert freely if the value fits the target width */

        if let (Some(value), Some((bits, signed))) = (
            self.const_literal_value(*slot),
            to.integer_info(self.target),
        ) {
            if from.is_integer(true) {
                if literal_fits(value, bits, signed) {
                    if perform {
                        self.wrap_with_cast(slot, to.clone(), CastKind::Implicit, false);
                    }
                    return score;
                }
                return -1;
            }
        }

        /* Integer widening */

        if let (Some((from_bits, _from_signed)), Some((to_bits, to_signed))) = (
            from.integer_info(self.target),
            to.integer_info(self.target),
        ) {
            // The widening cast is sign- or zero-extending depending on the
            // source; lowering picks the instruction
            let _ = to_signed;

            if from_bits < to_bits {
                if perform {
                    self.wrap_with_cast(slot, to.clone(), CastKind::Implicit, false);
                }
                return score + 2;
            }

            if from_bits == to_bits {
                // Same width, different signedness: legal but penalized
                if perform {
                    self.wrap_with_cast(slot, to.clone(), CastKind::Implicit, false);
                }
                return score + 3;
            }

            // Narrowing only happens through literals or explicit casts
            return -1;
        }

        -1
    }

    /// Resolves an overload-set expression against a concrete function (or
    /// function pointer) type
    fn resolve_overload_against(&mut self, slot: &mut ExprId, to: &Type, perform: bool) -> i32 {
        let wanted = if to.is_pointer() { to.elem() } else { to.clone() };
        if !wanted.is_function() {
            return -1;
        }

        let ExprKind::OverloadSet { overloads } = self.module.expr(*slot).kind.clone() else {
            return -1;
        };

        let matches: Vec<ExprId> = overloads
            .into_iter()
            .filter(|decl| {
                let ExprKind::FuncDecl(f) = &self.module.expr(*decl).kind else {
                    return false;
                };
                Type::equal(&f.ty, &wanted)
            })
            .collect();

        match matches.as_slice() {
            [] => -1,
            [only] => {
                if perform {
                    self.rewrite_to_function_ref(slot, *only);
                    if to.is_pointer() {
                        self.wrap_with_cast(slot, to.clone(), CastKind::Implicit, false);
                    }
                }
                if to.is_pointer() { 1 } else { 0 }
            }
            _ => -1,
        }
    }

    fn rewrite_to_function_ref(&mut self, slot: &mut ExprId, decl: ExprId) {
        let ExprKind::FuncDecl(f) = &self.module.expr(decl).kind else {
            crate::diag::ice!("overload candidate is not a function");
        };
        let (name, ty) = (f.name, f.ty.clone());

        let span = self.expr_span(*slot);
        let new = self.module.alloc(
            ExprKind::NameRef {
                name,
                scope: ScopeId::GLOBAL,
                target: Some(decl),
            },
            span,
        );

        let expr = self.module.expr_mut(new);
        expr.ty = ty;
        expr.state = SemaState::Done;

        *slot = new;
    }

    /// Tries converting a to b's type and b to a's type, keeping whichever
    /// direction scores lower. An ambiguous tie between distinct types is an
    /// error.
    fn convert_to_common_type(&mut self, a: &mut ExprId, b: &mut ExprId) -> bool {
        let ta = self.expr_ty(*a);
        let tb = self.expr_ty(*b);

        let a_to_b = self.try_convert(*a, &tb);
        let b_to_a = self.try_convert(*b, &ta);

        // Errored operands "convert" so that no cascading error is issued
        if a_to_b == -2 || b_to_a == -2 {
            return true;
        }

        match (a_to_b, b_to_a) {
            (-1, -1) => false,
            (-1, _) => self.convert(b, &ta),
            (_, -1) => self.convert(a, &tb),
            (sa, sb) if sa < sb => self.convert(a, &tb),
            (sa, sb) if sb < sa => self.convert(b, &ta),
            _ => {
                if Type::equal(&ta, &tb) {
                    self.convert(a, &tb)
                } else {
                    let span = self.expr_span(*a).to(self.expr_span(*b));
                    self.error(
                        span,
                        format!("conversion between {ta} and {tb} is ambiguous"),
                    );
                    false
                }
            }
        }
    }

    fn const_literal_value(&self, id: ExprId) -> Option<u64> {
        match &self.module.expr(id).kind {
            ExprKind::IntegerLiteral(v) => Some(*v),
            ExprKind::EvaluatedConstant { value, .. } => Some(*value),
            _ => None,
        }
    }

    /* Type analysis */

    /// Resolves named types, evaluates array dimensions and computes struct
    /// layouts. Produces a new type handle when resolution changes structure.
    fn analyse_type(&mut self, ty: &mut Type, span: Span) -> bool {
        let new = match ty.kind() {
            TypeKind::Builtin(_)
            | TypeKind::Ffi(_)
            | TypeKind::Integer { .. }
            | TypeKind::Error => return true,

            TypeKind::Named(name) => {
                let Some(decls) = self.module.lookup(ScopeId::GLOBAL, *name) else {
                    self.error(span, format!("unknown type '{name}'"));
                    *ty = Type::error();
                    return false;
                };
                let decl = decls[0];

                let mut decl_slot = decl;
                if !self.analyse(&mut decl_slot, None) {
                    *ty = Type::error();
                    return false;
                }

                match &self.module.expr(decl).kind {
                    ExprKind::TypeDecl { ty: t, .. } | ExprKind::TypeAliasDecl { ty: t, .. } => {
                        t.clone()
                    }
                    _ => {
                        self.error(span, format!("'{name}' does not name a type"));
                        *ty = Type::error();
                        return false;
                    }
                }
            }

            TypeKind::Pointer(elem) => {
                let mut elem = elem.clone();
                if !self.analyse_type(&mut elem, span) {
                    return false;
                }
                Type::pointer(elem)
            }

            TypeKind::Reference(elem) => {
                let mut elem = elem.clone();
                if !self.analyse_type(&mut elem, span) {
                    return false;
                }
                if elem.is_reference() {
                    self.error(span, "references cannot nest");
                    *ty = Type::error();
                    return false;
                }
                Type::reference(elem)
            }

            TypeKind::Array { elem, size, dim } => {
                let mut new_elem = elem.clone();
                if !self.analyse_type(&mut new_elem, span) {
                    return false;
                }

                let dimension = match (dim.get(), size) {
                    (Some(d), _) => *d,
                    (None, Some(size_expr)) => {
                        let mut slot = *size_expr;
                        let _ = self.analyse(&mut slot, None);

                        match eval_as_int(self.module, slot) {
                            Some(value) => value as usize,
                            None => {
                                self.error(
                                    span,
                                    "array size must be a constant integer expression",
                                );
                                *ty = Type::error();
                                return false;
                            }
                        }
                    }
                    (None, None) => {
                        self.error(span, "array type has no size");
                        *ty = Type::error();
                        return false;
                    }
                };

                Type::array_of(new_elem, dimension)
            }

            TypeKind::DynamicArray { elem } => {
                let mut elem = elem.clone();
                if !self.analyse_type(&mut elem, span) {
                    return false;
                }
                Type::new(TypeKind::DynamicArray { elem })
            }

            TypeKind::Struct(s) => {
                if s.layout.get().is_some() {
                    return true;
                }

                let mut members = Vec::with_capacity(s.members.len());
                let mut offset = 0usize;
                let mut max_align = 1usize;

                for member in &s.members {
                    let mut member_ty = member.ty.clone();
                    if !self.analyse_type(&mut member_ty, span) {
                        *ty = Type::error();
                        return false;
                    }

                    let align = member_ty.align(self.target);
                    let size = member_ty.size(self.target);
                    offset = align_to(offset, align);

                    let cell = std::cell::OnceCell::new();
                    cell.set(offset).unwrap();
                    members.push(StructMember {
                        name: member.name,
                        ty: member_ty,
                        byte_offset: cell,
                    });

                    offset += size;
                    max_align = max_align.max(align);
                }

                let layout = std::cell::OnceCell::new();
                layout.set((align_to(offset, max_align), max_align)).unwrap();

                Type::new(TypeKind::Struct(Rc::new(StructType {
                    name: s.name,
                    members,
                    layout,
                })))
            }

            TypeKind::Enum(e) => {
                // Enumerator values are set through the shared cells so that
                // enumerator declarations referencing this type observe them
                let mut previous: Option<u64> = None;

                for enumerator in &e.enumerators {
                    if enumerator.value.get().is_some() {
                        previous = enumerator.value.get().copied();
                        continue;
                    }

                    let value = match enumerator.init {
                        Some(init) => match eval_as_int(self.module, init) {
                            Some(v) => v,
                            None => {
                                self.error(
                                    span,
                                    format!(
                                        "enumerator '{}' requires a constant integer value",
                                        enumerator.name
                                    ),
                                );
                                *ty = Type::error();
                                return false;
                            }
                        },
                        None => previous.map(|p| p.wrapping_add(1)).unwrap_or(0),
                    };

                    let _ = enumerator.value.set(value);
                    previous = Some(value);
                }

                return true;
            }

            TypeKind::Function(f) => {
                let mut params = Vec::with_capacity(f.params.len());
                for param in &f.params {
                    let mut p = param.ty.clone();
                    if !self.analyse_type(&mut p, span) {
                        return false;
                    }
                    params.push(FuncParam {
                        name: param.name,
                        ty: p,
                    });
                }

                let mut ret = f.ret.clone();
                if !self.analyse_type(&mut ret, span) {
                    return false;
                }

                Type::function(params, ret, f.call_conv, f.variadic)
            }
        };

        *ty = new;
        true
    }

    /* Expression analysis */

    /// Analyses the expression behind `slot`, possibly replacing it.
    /// Idempotent: returns immediately for done or errored expressions.
    fn analyse(&mut self, slot: &mut ExprId, expected: Option<&Type>) -> bool {
        match self.module.expr(*slot).state {
            SemaState::Done => return true,
            SemaState::Errored => return false,
            SemaState::InProgress => {
                let span = self.expr_span(*slot);
                self.error(span, "expression depends on its own value");
                return self.fail(*slot);
            }
            SemaState::Unanalysed => {}
        }

        self.module.expr_mut(*slot).state = SemaState::InProgress;

        let id = *slot;
        match self.module.expr(id).kind.clone() {
            ExprKind::FuncDecl(_) => self.analyse_func_decl(id),
            ExprKind::VarDecl(decl) => self.analyse_var_decl(id, *decl),
            ExprKind::EnumeratorDecl { .. } => {
                // The enum type's analysis computes all enumerator values
                let mut enum_ty = self.expr_ty(id);
                let span = self.expr_span(id);
                if !self.analyse_type(&mut enum_ty, span) {
                    return self.fail(id);
                }
                self.finish(id, enum_ty, false)
            }
            ExprKind::TypeDecl { name, mut ty } | ExprKind::TypeAliasDecl { name, mut ty } => {
                let span = self.expr_span(id);
                if !self.analyse_type(&mut ty, span) {
                    return self.fail(id);
                }

                let is_alias = matches!(self.module.expr(id).kind, ExprKind::TypeAliasDecl { .. });
                self.module.expr_mut(id).kind = if is_alias {
                    ExprKind::TypeAliasDecl { name, ty }
                } else {
                    ExprKind::TypeDecl { name, ty }
                };
                self.finish(id, Type::void(), false)
            }

            ExprKind::IntegerLiteral(_) => self.finish(id, Type::int(), false),
            ExprKind::BoolLiteral(_) => self.finish(id, Type::bool(), false),
            ExprKind::StringLiteral { index } => {
                let len = self.module.strings[index].value().len();
                self.finish(id, Type::array_of(Type::byte(), len + 1), true)
            }
            ExprKind::CompoundLiteral { values } => {
                self.analyse_compound_literal(id, values, expected)
            }

            ExprKind::NameRef { name, scope, .. } => self.analyse_name_ref(slot, name, scope),
            ExprKind::OverloadSet { .. } => self.finish(id, Type::overload_set(), false),
            ExprKind::EvaluatedConstant { .. } => {
                let ty = self.expr_ty(id);
                self.finish(id, ty, false)
            }
            ExprKind::ModuleRef { .. } => self.finish(id, Type::void(), false),
            ExprKind::TypeExpr { mut ty } => {
                let span = self.expr_span(id);
                let ok = self.analyse_type(&mut ty, span);
                self.module.expr_mut(id).kind = ExprKind::TypeExpr { ty: ty.clone() };
                if !ok {
                    return self.fail(id);
                }
                self.finish(id, ty, false)
            }

            ExprKind::MemberAccess { object, member, .. } => {
                self.analyse_member_access(id, object, member)
            }
            ExprKind::Call { callee, args } => self.analyse_call(id, callee, args),
            ExprKind::IntrinsicCall { intrinsic, args } => {
                self.analyse_intrinsic_call(id, intrinsic, args)
            }
            ExprKind::Cast {
                cast_kind,
                operand,
                target,
            } => self.analyse_cast(id, cast_kind, operand, target),
            ExprKind::Binary { op, lhs, rhs } => self.analyse_binary(id, op, lhs, rhs),
            ExprKind::CompoundAssignment { op, lhs, rhs } => {
                self.rewrite_to_binary_op_then_assign(slot, op, lhs, rhs)
            }
            ExprKind::Unary { op, operand } => self.analyse_unary(id, op, operand),

            ExprKind::If {
                condition,
                then_branch,
                else_branch,
            } => self.analyse_if(id, condition, then_branch, else_branch),
            ExprKind::While { condition, body } => self.analyse_while(id, condition, body),
            ExprKind::For {
                init,
                condition,
                increment,
                body,
            } => self.analyse_for(id, init, condition, increment, body),
            ExprKind::Block { children, scope } => self.analyse_block(id, children, scope),
            ExprKind::Return { value } => self.analyse_return(id, value),

            ExprKind::Sizeof { operand } => self.analyse_size_query(slot, operand, false),
            ExprKind::Alignof { operand } => self.analyse_size_query(slot, operand, true),
        }
    }

    /* Declarations */

    fn analyse_function_signature(&mut self, id: ExprId) {
        let ExprKind::FuncDecl(decl) = self.module.expr(id).kind.clone() else {
            crate::diag::ice!("analyse_function_signature on non-function");
        };
        let mut decl = decl;
        let span = self.expr_span(id);

        if !self.analyse_type(&mut decl.ty, span) {
            self.module.expr_mut(id).state = SemaState::Errored;
            return;
        }

        // Imported functions use the C calling convention
        if decl.linkage == Linkage::Imported {
            let f = decl.ty.as_function().unwrap().clone();
            if f.call_conv != CallConv::C {
                let params = f
                    .params
                    .iter()
                    .map(|p| FuncParam {
                        name: p.name,
                        ty: p.ty.clone(),
                    })
                    .collect();
                decl.ty = Type::function(params, f.ret.clone(), CallConv::C, f.variadic);
            }
        }

        /* Give every parameter declaration its resolved type */

        let func_ty = decl.ty.as_function().unwrap().clone();
        for (param_decl, param) in decl.params.iter().zip(func_ty.params.iter()) {
            let expr = self.module.expr_mut(*param_decl);
            expr.ty = param.ty.clone();
            expr.lvalue = true;
            expr.state = SemaState::Done;

            if let ExprKind::VarDecl(v) = &mut expr.kind {
                v.ty = param.ty.clone();
            }
        }

        // The signature's type is cached on the declaration node; the body is
        // analysed separately
        self.module.expr_mut(id).ty = decl.ty.clone();
        self.module.expr_mut(id).kind = ExprKind::FuncDecl(decl);
    }

    fn analyse_func_decl(&mut self, id: ExprId) -> bool {
        if !self.module.expr(id).ty.is_function() {
            self.analyse_function_signature(id);
            if self.module.expr(id).state == SemaState::Errored {
                return false;
            }
        }

        let ExprKind::FuncDecl(decl) = self.module.expr(id).kind.clone() else {
            unreachable!()
        };
        let func_ty = decl.ty.as_function().unwrap().clone();

        let Some(mut body) = decl.body else {
            return self.finish(id, decl.ty.clone(), false);
        };

        self.curr_func.push(id);
        let body_ok = self.analyse(&mut body, None);
        self.curr_func.pop();

        if !body_ok {
            // The body reported its own error; the declaration is still
            // usable by callers
            let mut decl = decl;
            decl.body = Some(body);
            self.module.expr_mut(id).kind = ExprKind::FuncDecl(decl);
            return self.fail(id);
        }

        /* Check the implicit return at the end of the body */

        let is_top_level = self.module.top_level == Some(id);
        if !func_ty.ret.is_void() && !is_top_level {
            if !self.convert_block_value(body, &func_ty.ret) {
                let span = self.expr_span(body);
                self.error(
                    span,
                    format!(
                        "function '{}' must end with a value of type {}",
                        decl.name, func_ty.ret
                    ),
                );
                return self.fail(id);
            }
        }

        let mut decl = decl;
        decl.body = Some(body);
        let ty = decl.ty.clone();
        self.module.expr_mut(id).kind = ExprKind::FuncDecl(decl);
        self.finish(id, ty, false)
    }

    /// Converts the trailing expression of a function body to the return
    /// type. A body whose last statement is an explicit return (or that
    /// diverges into one) needs no conversion.
    fn convert_block_value(&mut self, body: ExprId, ret: &Type) -> bool {
        let ExprKind::Block { children, scope } = self.module.expr(body).kind.clone() else {
            // Expression bodies convert directly
            let mut slot = body;
            let ok = self.convert_or_error(&mut slot, ret);
            debug_assert_eq!(slot, body, "block bodies only");
            return ok;
        };

        let Some(last_index) = children
            .iter()
            .rposition(|c| !self.module.expr(*c).kind.is_declaration())
        else {
            return false;
        };

        if matches!(
            self.module.expr(children[last_index]).kind,
            ExprKind::Return { .. }
        ) {
            return true;
        }

        let mut children = children;
        let ok = self.convert_or_error(&mut children[last_index], ret);

        let new_ty = self.expr_ty(children[last_index]);
        let expr = self.module.expr_mut(body);
        expr.kind = ExprKind::Block { children, scope };
        expr.ty = new_ty;

        ok
    }

    fn analyse_var_decl(&mut self, id: ExprId, mut decl: VarDecl) -> bool {
        let span = self.expr_span(id);

        if !self.analyse_type(&mut decl.ty, span) {
            return self.fail(id);
        }

        if decl.ty.is_unknown() && decl.init.is_none() {
            self.error(
                span,
                format!("cannot infer the type of '{}' without an initializer", decl.name),
            );
            return self.fail(id);
        }

        if let Some(mut init) = decl.init {
            let expected = (!decl.ty.is_unknown()).then(|| decl.ty.clone());
            let init_ok = self.analyse(&mut init, expected.as_ref());

            if !init_ok {
                decl.init = Some(init);
                self.module.expr_mut(id).kind = ExprKind::VarDecl(Box::new(decl));
                return self.fail(id);
            }

            if decl.ty.is_unknown() {
                // The declared type is inferred from the initializer's value
                self.lvalue_to_rvalue(&mut init);
                decl.ty = self.expr_ty(init);
            } else if decl.ty.is_reference() {
                // Reference variables bind to the initializer's address
                if !self.convert_or_error(&mut init, &decl.ty.clone()) {
                    decl.init = Some(init);
                    self.module.expr_mut(id).kind = ExprKind::VarDecl(Box::new(decl));
                    return self.fail(id);
                }
            } else if !self.convert_or_error(&mut init, &decl.ty.clone()) {
                decl.init = Some(init);
                self.module.expr_mut(id).kind = ExprKind::VarDecl(Box::new(decl));
                return self.fail(id);
            }

            decl.init = Some(init);
        }

        if decl.ty.is_void() {
            self.error(span, format!("variable '{}' cannot have type void", decl.name));
            return self.fail(id);
        }

        if matches!(decl.ty.kind(), TypeKind::DynamicArray { .. }) {
            Diag::sorry(self.ctx, span, "dynamic array variables are not supported yet").emit();
            return self.fail(id);
        }

        let ty = decl.ty.clone();
        self.module.expr_mut(id).kind = ExprKind::VarDecl(Box::new(decl));
        self.finish(id, ty, true)
    }

    /* Names */

    fn analyse_name_ref(
        &mut self,
        slot: &mut ExprId,
        name: crate::frontend::intern::InternedSymbol,
        scope: ScopeId,
    ) -> bool {
        let id = *slot;
        let span = self.expr_span(id);

        let Some(decls) = self.module.lookup(scope, name).map(|d| d.to_vec()) else {
            self.error(span, format!("unknown symbol '{name}'"));
            return self.fail(id);
        };

        if decls.len() > 1 {
            // A name bound to multiple function declarations becomes an
            // overload set; a later conversion or call resolves it
            self.module.expr_mut(id).kind = ExprKind::OverloadSet { overloads: decls };
            return self.finish(id, Type::overload_set(), false);
        }

        let target = decls[0];
        match self.module.expr(target).kind.clone() {
            ExprKind::FuncDecl(f) => {
                // Only the signature is needed; analysing the body here would
                // break mutual recursion
                if !f.ty.is_function() {
                    let mut t = target;
                    if !self.analyse(&mut t, None) {
                        return self.fail(id);
                    }
                }
                let ty = match &self.module.expr(target).kind {
                    ExprKind::FuncDecl(f) => f.ty.clone(),
                    _ => unreachable!(),
                };
                self.module.expr_mut(id).kind = ExprKind::NameRef {
                    name,
                    scope,
                    target: Some(target),
                };
                self.finish(id, ty, false)
            }

            ExprKind::VarDecl(_) => {
                let mut t = target;
                if !self.analyse(&mut t, None) {
                    return self.fail(id);
                }
                let ty = self.expr_ty(target);
                self.module.expr_mut(id).kind = ExprKind::NameRef {
                    name,
                    scope,
                    target: Some(target),
                };
                // A reference-typed variable is an lvalue of its referenced
                // type from the user's point of view; conversions handle the
                // unwrapping
                self.finish(id, ty, true)
            }

            ExprKind::EnumeratorDecl { .. } => {
                let mut t = target;
                if !self.analyse(&mut t, None) {
                    return self.fail(id);
                }

                let enum_ty = self.expr_ty(target);
                let value = enumerator_value(&enum_ty, name).unwrap_or(0);

                let new = self.module.alloc(
                    ExprKind::EvaluatedConstant { value, source: id },
                    span,
                );
                let expr = self.module.expr_mut(new);
                expr.ty = enum_ty;
                expr.state = SemaState::Done;

                self.module.expr_mut(id).state = SemaState::Done;
                *slot = new;
                true
            }

            ExprKind::TypeDecl { .. } | ExprKind::TypeAliasDecl { .. } => {
                let mut t = target;
                if !self.analyse(&mut t, None) {
                    return self.fail(id);
                }
                let ty = match &self.module.expr(target).kind {
                    ExprKind::TypeDecl { ty, .. } | ExprKind::TypeAliasDecl { ty, .. } => ty.clone(),
                    _ => unreachable!(),
                };
                self.module.expr_mut(id).kind = ExprKind::TypeExpr { ty: ty.clone() };
                self.finish(id, ty, false)
            }

            _ => {
                self.error(span, format!("'{name}' does not name a value"));
                self.fail(id)
            }
        }
    }

    /* Operators */

    fn analyse_binary(&mut self, id: ExprId, op: BinaryOp, mut lhs: ExprId, mut rhs: ExprId) -> bool {
        let span = self.expr_span(id);

        let lhs_ok = self.analyse(&mut lhs, None);
        let rhs_ok = self.analyse(&mut rhs, None);
        if !lhs_ok || !rhs_ok {
            self.write_binary(id, op, lhs, rhs);
            return self.fail(id);
        }

        match op {
            BinaryOp::Assign => {
                // Assigning through a reference stores to the referenced
                // storage
                if self.expr_ty(lhs).is_reference() {
                    let stripped = self.expr_ty(lhs).strip_references();
                    self.wrap_with_cast(&mut lhs, stripped, CastKind::ReferenceToLValue, true);
                }

                if !self.module.expr(lhs).lvalue {
                    self.error(span, "left-hand side of assignment is not assignable");
                    self.write_binary(id, op, lhs, rhs);
                    return self.fail(id);
                }

                let target_ty = self.expr_ty(lhs);
                if !self.convert_or_error(&mut rhs, &target_ty) {
                    self.write_binary(id, op, lhs, rhs);
                    return self.fail(id);
                }

                self.write_binary(id, op, lhs, rhs);
                self.finish(id, target_ty, false)
            }

            BinaryOp::Subscript => {
                let base_ty = self.expr_ty(lhs).strip_references();

                if !base_ty.is_array() && !base_ty.is_pointer() {
                    self.error(
                        span,
                        format!(
                            "subscript operator may only be applied to arrays and pointers, not {base_ty}"
                        ),
                    );
                    self.write_binary(id, op, lhs, rhs);
                    return self.fail(id);
                }

                if !self.convert_or_error(&mut rhs, &Type::int()) {
                    self.write_binary(id, op, lhs, rhs);
                    return self.fail(id);
                }

                let elem = base_ty.elem();
                self.write_binary(id, op, lhs, rhs);
                self.finish(id, elem, true)
            }

            op if op.is_arithmetic() => {
                self.lvalue_to_rvalue(&mut lhs);
                self.lvalue_to_rvalue(&mut rhs);

                for operand in [lhs, rhs] {
                    let t = self.expr_ty(operand);
                    if !t.is_integer(false) && !t.is_error() {
                        self.error(
                            self.expr_span(operand),
                            format!("cannot use type {t} in an arithmetic context"),
                        );
                        self.write_binary(id, op, lhs, rhs);
                        return self.fail(id);
                    }
                }

                if !self.convert_to_common_type(&mut lhs, &mut rhs) {
                    self.write_binary(id, op, lhs, rhs);
                    return self.fail(id);
                }

                let ty = self.expr_ty(lhs);
                self.write_binary(id, op, lhs, rhs);
                self.finish(id, ty, false)
            }

            op if op.is_comparison() => {
                self.lvalue_to_rvalue(&mut lhs);
                self.lvalue_to_rvalue(&mut rhs);

                if !self.convert_to_common_type(&mut lhs, &mut rhs) {
                    let (ta, tb) = (self.expr_ty(lhs), self.expr_ty(rhs));
                    self.error(span, format!("cannot compare {ta} with {tb}"));
                    self.write_binary(id, op, lhs, rhs);
                    return self.fail(id);
                }

                self.write_binary(id, op, lhs, rhs);
                self.finish(id, Type::bool(), false)
            }

            _ => unreachable!("unhandled binary operator {op}"),
        }
    }

    fn write_binary(&mut self, id: ExprId, op: BinaryOp, lhs: ExprId, rhs: ExprId) {
        self.module.expr_mut(id).kind = ExprKind::Binary { op, lhs, rhs };
    }

    /// Rewrites `lhs op= rhs` into `lhs := lhs op rhs`, duplicating the
    /// left-hand side via a deep clone, then analyses the result
    fn rewrite_to_binary_op_then_assign(
        &mut self,
        slot: &mut ExprId,
        op: BinaryOp,
        lhs: ExprId,
        rhs: ExprId,
    ) -> bool {
        let id = *slot;
        let span = self.expr_span(id);

        let lhs_copy = self.module.clone_expr(lhs);
        let inner = self.module.alloc(
            ExprKind::Binary {
                op,
                lhs: lhs_copy,
                rhs,
            },
            span,
        );
        let assign = self.module.alloc(
            ExprKind::Binary {
                op: BinaryOp::Assign,
                lhs,
                rhs: inner,
            },
            span,
        );

        self.module.expr_mut(id).state = SemaState::Done;
        *slot = assign;
        self.analyse(slot, None)
    }

    fn analyse_unary(&mut self, id: ExprId, op: UnaryOp, mut operand: ExprId) -> bool {
        let span = self.expr_span(id);

        if !self.analyse(&mut operand, None) {
            self.write_unary(id, op, operand);
            return self.fail(id);
        }

        match op {
            UnaryOp::Deref => {
                self.lvalue_to_rvalue(&mut operand);
                let ty = self.expr_ty(operand);

                let TypeKind::Pointer(elem) = ty.kind() else {
                    self.error(span, format!("type {ty} cannot be dereferenced"));
                    self.write_unary(id, op, operand);
                    return self.fail(id);
                };

                let elem = elem.clone();
                self.write_unary(id, op, operand);
                self.finish(id, elem, true)
            }

            UnaryOp::AddressOf => {
                if !self.module.expr(operand).lvalue {
                    self.error(span, "cannot take the address of an rvalue");
                    self.write_unary(id, op, operand);
                    return self.fail(id);
                }

                let pointee = self.expr_ty(operand).strip_references();
                self.write_unary(id, op, operand);
                self.finish(id, Type::pointer(pointee), false)
            }

            UnaryOp::BitwiseNot | UnaryOp::Negate | UnaryOp::Plus => {
                self.lvalue_to_rvalue(&mut operand);
                let ty = self.expr_ty(operand);

                if !ty.is_integer(false) && !ty.is_error() {
                    self.error(
                        span,
                        format!("cannot use type {ty} in an arithmetic context"),
                    );
                    self.write_unary(id, op, operand);
                    return self.fail(id);
                }

                self.write_unary(id, op, operand);
                self.finish(id, ty, false)
            }
        }
    }

    fn write_unary(&mut self, id: ExprId, op: UnaryOp, operand: ExprId) {
        self.module.expr_mut(id).kind = ExprKind::Unary { op, operand };
    }

    /* Calls */

    fn analyse_call(&mut self, id: ExprId, mut callee: ExprId, mut args: Vec<ExprId>) -> bool {
        let span = self.expr_span(id);

        let callee_ok = self.analyse(&mut callee, None);
        let mut args_ok = true;
        for arg in args.iter_mut() {
            args_ok &= self.analyse(arg, None);
        }

        if !callee_ok || !args_ok {
            self.write_call(id, callee, args);
            return self.fail(id);
        }

        /* Resolve overload sets by scoring each candidate */

        if self.expr_ty(callee).is_overload_set() {
            let ExprKind::OverloadSet { overloads } = self.module.expr(callee).kind.clone() else {
                unreachable!()
            };

            let mut best: Option<(i32, Vec<ExprId>)> = None;
            for candidate in overloads {
                let Some(score) = self.score_candidate(candidate, &args) else {
                    continue;
                };

                match &mut best {
                    None => best = Some((score, vec![candidate])),
                    Some((best_score, list)) => {
                        if score < *best_score {
                            best = Some((score, vec![candidate]));
                        } else if score == *best_score {
                            list.push(candidate);
                        }
                    }
                }
            }

            match best {
                None => {
                    self.error(span, "no overload matches this call");
                    self.write_call(id, callee, args);
                    return self.fail(id);
                }
                Some((_, list)) if list.len() > 1 => {
                    self.error(span, "call is ambiguous");
                    for candidate in &list {
                        Diag::note(
                            self.ctx,
                            self.expr_span(*candidate),
                            "candidate function",
                        )
                        .emit();
                    }
                    self.write_call(id, callee, args);
                    return self.fail(id);
                }
                Some((_, list)) => self.rewrite_to_function_ref(&mut callee, list[0]),
            }
        }

        /* Find the function type behind values, pointers and references */

        let mut callee_ty = self.expr_ty(callee).strip_references();
        while callee_ty.is_pointer() {
            self.lvalue_to_rvalue(&mut callee);
            callee_ty = callee_ty.elem();
        }

        let Some(func_ty) = callee_ty.as_function().cloned() else {
            self.error(
                span,
                format!("cannot use type {callee_ty} as the target of a function call"),
            );
            self.write_call(id, callee, args);
            return self.fail(id);
        };

        /* Check arity */

        let fixed = func_ty.params.len();
        let arity_ok = if func_ty.variadic {
            args.len() >= fixed
        } else {
            args.len() == fixed
        };

        if !arity_ok {
            self.error(
                span,
                format!("expected {fixed} argument(s) to this function but found {}", args.len()),
            );
            self.write_call(id, callee, args);
            return self.fail(id);
        }

        /* Convert arguments */

        let mut ok = true;
        for (arg, param) in args.iter_mut().zip(func_ty.params.iter()) {
            ok &= self.convert_or_error(arg, &param.ty);
        }

        // Variadic tail arguments follow C promotion rules for FFI callees
        for arg in args.iter_mut().skip(fixed) {
            self.lvalue_to_rvalue(arg);

            if func_ty.call_conv == CallConv::C {
                let ty = self.expr_ty(*arg);
                if let Some((bits, _)) = ty.integer_info(self.target) {
                    if bits < 32 {
                        ok &= self.convert_or_error(arg, &Type::new(TypeKind::Ffi(FfiKind::CInt)));
                    }
                }
            }
        }

        self.write_call(id, callee, args);
        if !ok {
            return self.fail(id);
        }
        self.finish(id, func_ty.ret.clone(), false)
    }

    /// Scores an overload candidate as the sum of its argument conversion
    /// scores; None if the candidate is not viable
    fn score_candidate(&mut self, candidate: ExprId, args: &[ExprId]) -> Option<i32> {
        let ExprKind::FuncDecl(f) = &self.module.expr(candidate).kind else {
            return None;
        };
        let func_ty = f.ty.as_function()?.clone();

        let fixed = func_ty.params.len();
        let arity_ok = if func_ty.variadic {
            args.len() >= fixed
        } else {
            args.len() == fixed
        };
        if !arity_ok {
            return None;
        }

        let mut total = 0;
        for (arg, param) in args.iter().zip(func_ty.params.iter()) {
            match self.try_convert(*arg, &param.ty) {
                -1 => return None,
                -2 => {}
                score => total += score,
            }
        }

        Some(total)
    }

    fn write_call(&mut self, id: ExprId, callee: ExprId, args: Vec<ExprId>) {
        self.module.expr_mut(id).kind = ExprKind::Call { callee, args };
    }

    fn analyse_intrinsic_call(
        &mut self,
        id: ExprId,
        intrinsic: Intrinsic,
        mut args: Vec<ExprId>,
    ) -> bool {
        let span = self.expr_span(id);
        let mut ok = true;

        for arg in args.iter_mut() {
            ok &= self.analyse(arg, None);
        }

        let ty = match intrinsic {
            Intrinsic::Syscall => {
                if args.is_empty() || args.len() > 7 {
                    self.error(span, "__builtin_syscall takes between 1 and 7 arguments");
                    ok = false;
                }
                for arg in args.iter_mut() {
                    ok &= self.convert_or_error(arg, &Type::int());
                }
                Type::int()
            }
            Intrinsic::DebugTrap => {
                if !args.is_empty() {
                    self.error(span, "__builtin_debugtrap takes no arguments");
                    ok = false;
                }
                Type::void()
            }
            Intrinsic::MemCopy => {
                if args.len() != 3 {
                    self.error(span, "__builtin_memcpy takes exactly 3 arguments");
                    ok = false;
                } else {
                    let byte_ptr = Type::pointer(Type::byte());
                    ok &= self.convert_or_error(&mut args[0], &byte_ptr);
                    ok &= self.convert_or_error(&mut args[1], &byte_ptr);
                    ok &= self.convert_or_error(&mut args[2], &Type::int());
                }
                Type::void()
            }
        };

        self.module.expr_mut(id).kind = ExprKind::IntrinsicCall { intrinsic, args };
        if !ok {
            return self.fail(id);
        }
        self.finish(id, ty, false)
    }

    fn analyse_cast(
        &mut self,
        id: ExprId,
        cast_kind: CastKind,
        mut operand: ExprId,
        mut target: Type,
    ) -> bool {
        let span = self.expr_span(id);

        let operand_ok = self.analyse(&mut operand, None);
        let target_ok = self.analyse_type(&mut target, span);

        if !operand_ok || !target_ok {
            self.write_cast(id, cast_kind, operand, target);
            return self.fail(id);
        }

        match cast_kind {
            CastKind::Soft => {
                if Type::equal(&self.expr_ty(operand).strip_references(), &target) {
                    Diag::warning(self.ctx, span, "cast to the same type has no effect").emit();
                }

                // Any legal implicit conversion, plus integer conversions in
                // either direction
                if self.try_convert(operand, &target) >= 0 {
                    // The conversion machinery inserts the casts; this node
                    // becomes a transparent wrapper
                    let _ = self.convert(&mut operand, &target);
                } else {
                    self.lvalue_to_rvalue(&mut operand);
                    let from = self.expr_ty(operand);

                    let both_integers = from.is_integer(true) && target.is_integer(true);
                    if !both_integers {
                        self.error(span, format!("{from} cannot be soft cast to {target}"));
                        self.write_cast(id, cast_kind, operand, target);
                        return self.fail(id);
                    }
                }
            }

            CastKind::Hard => {
                self.lvalue_to_rvalue(&mut operand);
                let from = self.expr_ty(operand);

                let pointer_reinterpret = (from.is_pointer()
                    && (target.is_pointer() || target.is_integer(false)))
                    || (from.is_integer(false) && target.is_pointer());
                let integers = from.is_integer(true) && target.is_integer(true);

                if !pointer_reinterpret && !integers && !Type::equal(&from, &target) {
                    self.error(span, format!("{from} cannot be cast to {target}"));
                    self.write_cast(id, cast_kind, operand, target);
                    return self.fail(id);
                }
            }

            // Conversion casts are created in analysed form by sema itself
            CastKind::Implicit
            | CastKind::LValueToRValue
            | CastKind::LValueToReference
            | CastKind::ReferenceToLValue => {}
        }

        let ty = target.clone();
        self.write_cast(id, cast_kind, operand, target);
        self.finish(id, ty, false)
    }

    fn write_cast(&mut self, id: ExprId, cast_kind: CastKind, operand: ExprId, target: Type) {
        self.module.expr_mut(id).kind = ExprKind::Cast {
            cast_kind,
            operand,
            target,
        };
    }

    fn analyse_member_access(
        &mut self,
        id: ExprId,
        mut object: ExprId,
        member: crate::frontend::intern::InternedSymbol,
    ) -> bool {
        let span = self.expr_span(id);

        if !self.analyse(&mut object, None) {
            self.module.expr_mut(id).kind = ExprKind::MemberAccess {
                object,
                member,
                index: None,
            };
            return self.fail(id);
        }

        let mut object_ty = self.expr_ty(object).strip_references();

        // Accessing a member through a pointer dereferences it implicitly
        if object_ty.is_pointer() {
            self.lvalue_to_rvalue(&mut object);
            let elem = object_ty.elem();

            let deref = self.module.alloc(
                ExprKind::Unary {
                    op: UnaryOp::Deref,
                    operand: object,
                },
                span,
            );
            let expr = self.module.expr_mut(deref);
            expr.ty = elem.clone();
            expr.lvalue = true;
            expr.state = SemaState::Done;

            object = deref;
            object_ty = elem;
        }

        let Some(struct_ty) = object_ty.as_struct().cloned() else {
            self.error(span, format!("type {object_ty} has no members"));
            self.module.expr_mut(id).kind = ExprKind::MemberAccess {
                object,
                member,
                index: None,
            };
            return self.fail(id);
        };

        let Some(index) = struct_ty.members.iter().position(|m| m.name == member) else {
            self.error(
                span,
                format!("type {object_ty} has no member named '{member}'"),
            );
            self.module.expr_mut(id).kind = ExprKind::MemberAccess {
                object,
                member,
                index: None,
            };
            return self.fail(id);
        };

        let member_ty = struct_ty.members[index].ty.clone();
        let lvalue = self.module.expr(object).lvalue;

        self.module.expr_mut(id).kind = ExprKind::MemberAccess {
            object,
            member,
            index: Some(index),
        };
        self.finish(id, member_ty, lvalue)
    }

    /* Control flow */

    fn analyse_if(
        &mut self,
        id: ExprId,
        mut condition: ExprId,
        mut then_branch: ExprId,
        else_branch: Option<ExprId>,
    ) -> bool {
        let cond_ok = self.analyse(&mut condition, None)
            && self.convert_or_error(&mut condition, &Type::bool());

        let then_ok = self.analyse(&mut then_branch, None);

        let mut else_branch = else_branch;
        let else_ok = match &mut else_branch {
            Some(e) => self.analyse(e, None),
            None => true,
        };

        let write = |sema: &mut Self, then_branch, else_branch| {
            sema.module.expr_mut(id).kind = ExprKind::If {
                condition,
                then_branch,
                else_branch,
            };
        };

        if !cond_ok || !then_ok || !else_ok {
            write(self, then_branch, else_branch);
            return self.fail(id);
        }

        /* A two-armed if whose arms both produce values is an expression */

        let ty = match &mut else_branch {
            Some(else_slot) => {
                let then_ty = self.expr_ty(then_branch);
                let else_ty = self.expr_ty(*else_slot);

                if !then_ty.is_void() && !else_ty.is_void() {
                    self.lvalue_to_rvalue(&mut then_branch);
                    self.lvalue_to_rvalue(else_slot);

                    if !self.convert_to_common_type(&mut then_branch, else_slot) {
                        let span = self.expr_span(id);
                        self.error(
                            span,
                            format!("if branches have incompatible types {then_ty} and {else_ty}"),
                        );
                        write(self, then_branch, else_branch);
                        return self.fail(id);
                    }

                    self.expr_ty(then_branch)
                } else {
                    Type::void()
                }
            }
            None => Type::void(),
        };

        write(self, then_branch, else_branch);
        self.finish(id, ty, false)
    }

    fn analyse_while(&mut self, id: ExprId, mut condition: ExprId, mut body: ExprId) -> bool {
        let cond_ok = self.analyse(&mut condition, None)
            && self.convert_or_error(&mut condition, &Type::bool());
        let body_ok = self.analyse(&mut body, None);

        self.module.expr_mut(id).kind = ExprKind::While { condition, body };
        if !cond_ok || !body_ok {
            return self.fail(id);
        }
        self.finish(id, Type::void(), false)
    }

    fn analyse_for(
        &mut self,
        id: ExprId,
        mut init: ExprId,
        mut condition: ExprId,
        mut increment: ExprId,
        mut body: ExprId,
    ) -> bool {
        let init_ok = self.analyse(&mut init, None);
        let cond_ok = self.analyse(&mut condition, None)
            && self.convert_or_error(&mut condition, &Type::bool());
        let incr_ok = self.analyse(&mut increment, None);
        let body_ok = self.analyse(&mut body, None);

        self.module.expr_mut(id).kind = ExprKind::For {
            init,
            condition,
            increment,
            body,
        };
        if !init_ok || !cond_ok || !incr_ok || !body_ok {
            return self.fail(id);
        }
        self.finish(id, Type::void(), false)
    }

    fn analyse_block(&mut self, id: ExprId, mut children: Vec<ExprId>, scope: ScopeId) -> bool {
        let mut ok = true;
        for child in children.iter_mut() {
            // A failed statement doesn't fail the whole block; later
            // statements are still analysed so that their errors surface
            ok &= self.analyse(child, None);
        }

        let (ty, lvalue) = children
            .last()
            .map(|last| {
                let e = self.module.expr(*last);
                (e.ty.clone(), e.lvalue)
            })
            .unwrap_or((Type::void(), false));

        self.module.expr_mut(id).kind = ExprKind::Block { children, scope };
        if !ok {
            return self.fail(id);
        }
        self.finish(id, ty, lvalue)
    }

    fn analyse_return(&mut self, id: ExprId, value: Option<ExprId>) -> bool {
        let span = self.expr_span(id);

        let ret_ty = self
            .curr_func
            .last()
            .and_then(|f| match &self.module.expr(*f).kind {
                ExprKind::FuncDecl(decl) => {
                    decl.ty.as_function().map(|func| func.ret.clone())
                }
                _ => None,
            })
            .unwrap_or_else(Type::void);

        let mut value = value;
        let ok = match &mut value {
            Some(slot) => {
                if !self.analyse(slot, None) {
                    false
                } else if ret_ty.is_void() {
                    self.error(span, "cannot return a value from a void function");
                    false
                } else {
                    self.convert_or_error(slot, &ret_ty)
                }
            }
            None => {
                if !ret_ty.is_void() {
                    self.error(
                        span,
                        format!("expected this return to produce a value of type {ret_ty}"),
                    );
                    false
                } else {
                    true
                }
            }
        };

        self.module.expr_mut(id).kind = ExprKind::Return { value };
        if !ok {
            return self.fail(id);
        }
        self.finish(id, Type::void(), false)
    }

    fn analyse_compound_literal(
        &mut self,
        id: ExprId,
        mut values: Vec<ExprId>,
        expected: Option<&Type>,
    ) -> bool {
        let span = self.expr_span(id);

        let mut ok = true;
        for value in values.iter_mut() {
            ok &= self.analyse(value, None);
        }
        if !ok {
            self.module.expr_mut(id).kind = ExprKind::CompoundLiteral { values };
            return self.fail(id);
        }

        if values.is_empty() {
            self.error(span, "compound literal cannot be empty");
            self.module.expr_mut(id).kind = ExprKind::CompoundLiteral { values };
            return self.fail(id);
        }

        let elem_ty = match expected {
            Some(t) if t.is_array() => t.elem(),
            _ => {
                self.lvalue_to_rvalue(&mut values[0]);
                self.expr_ty(values[0])
            }
        };

        for value in values.iter_mut() {
            ok &= self.convert_or_error(value, &elem_ty);
        }

        let ty = Type::array_of(elem_ty, values.len());
        self.module.expr_mut(id).kind = ExprKind::CompoundLiteral { values };
        if !ok {
            return self.fail(id);
        }
        self.finish(id, ty, false)
    }

    fn analyse_size_query(&mut self, slot: &mut ExprId, mut operand: ExprId, align: bool) -> bool {
        let id = *slot;
        let span = self.expr_span(id);

        if !self.analyse(&mut operand, None) {
            return self.fail(id);
        }

        let ty = self.expr_ty(operand).strip_references();
        let value = if align {
            ty.align(self.target)
        } else {
            ty.size(self.target)
        } as u64;

        let new = self
            .module
            .alloc(ExprKind::EvaluatedConstant { value, source: id }, span);
        let expr = self.module.expr_mut(new);
        expr.ty = Type::int();
        expr.state = SemaState::Done;

        self.module.expr_mut(id).state = SemaState::Done;
        *slot = new;
        true
    }
}

/* Constant evaluation */

fn enumerator_value(
    enum_ty: &Type,
    name: crate::frontend::intern::InternedSymbol,
) -> Option<u64> {
    let TypeKind::Enum(e) = enum_ty.kind() else {
        return None;
    };
    e.enumerators
        .iter()
        .find(|en| en.name == name)
        .and_then(|en| en.value.get().copied())
}

/// Evaluates a constant integer expression. Used for array dimensions,
/// enumerator values and literal-fit checks; returns None when the
/// expression is not a compile-time integer.
pub fn eval_as_int(module: &Module, id: ExprId) -> Option<u64> {
    match &module.expr(id).kind {
        ExprKind::IntegerLiteral(v) => Some(*v),
        ExprKind::BoolLiteral(v) => Some(*v as u64),
        ExprKind::EvaluatedConstant { value, .. } => Some(*value),

        ExprKind::Cast { operand, .. } => eval_as_int(module, *operand),

        ExprKind::NameRef { target, name, .. } => {
            let target = (*target)?;
            match &module.expr(target).kind {
                ExprKind::EnumeratorDecl { .. } => {
                    enumerator_value(&module.expr(target).ty, *name)
                }
                _ => None,
            }
        }

        ExprKind::Unary { op, operand } => {
            let v = eval_as_int(module, *operand)?;
            match op {
                UnaryOp::Negate => Some(v.wrapping_neg()),
                UnaryOp::BitwiseNot => Some(!v),
                UnaryOp::Plus => Some(v),
                UnaryOp::Deref | UnaryOp::AddressOf => None,
            }
        }

        ExprKind::Binary { op, lhs, rhs } => {
            let a = eval_as_int(module, *lhs)?;
            let b = eval_as_int(module, *rhs)?;

            match op {
                BinaryOp::Add => Some(a.wrapping_add(b)),
                BinaryOp::Sub => Some(a.wrapping_sub(b)),
                BinaryOp::Mul => Some(a.wrapping_mul(b)),
                BinaryOp::Div => a.checked_div(b),
                BinaryOp::Mod => a.checked_rem(b),
                BinaryOp::Shl => Some(a.wrapping_shl(b as u32)),
                BinaryOp::Shr => Some(a.wrapping_shr(b as u32)),
                BinaryOp::And => Some(a & b),
                BinaryOp::Or => Some(a | b),
                BinaryOp::Eq => Some((a == b) as u64),
                BinaryOp::Ne => Some((a != b) as u64),
                BinaryOp::Lt => Some(((a as i64) < b as i64) as u64),
                BinaryOp::Le => Some((a as i64 <= b as i64) as u64),
                BinaryOp::Gt => Some((a as i64 > b as i64) as u64),
                BinaryOp::Ge => Some((a as i64 >= b as i64) as u64),
                BinaryOp::Assign | BinaryOp::Subscript => None,
            }
        }

        _ => None,
    }
}

fn literal_fits(value: u64, bits: usize, signed: bool) -> bool {
    if bits >= 64 {
        return true;
    }

    if signed {
        value < (1u64 << (bits - 1))
    } else {
        value < (1u64 << bits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        diag::Context,
        frontend::{parser::Parser, SourceFile},
        target::{CallingConvention, Target},
    };

    fn check(source: &str) -> (Context, Module) {
        let ctx = Context::new(SourceFile::in_memory(source));
        let mut module = Parser::parse_module(&ctx, "test");
        let target = Target::x86_64(CallingConvention::Linux);
        analyse_module(&ctx, &mut module, &target);
        (ctx, module)
    }

    fn body_children(module: &Module, func: ExprId) -> Vec<ExprId> {
        let ExprKind::FuncDecl(decl) = &module.expr(func).kind else {
            panic!("not a function");
        };
        let ExprKind::Block { children, .. } = &module.expr(decl.body.unwrap()).kind else {
            panic!("body is not a block");
        };
        children.clone()
    }

    #[test]
    fn literal_arithmetic_types_as_int() {
        let (ctx, module) = check("2 + 3 * 4");
        assert!(!ctx.has_error());

        let children = body_children(&module, module.top_level.unwrap());
        let root = module.expr(children[0]);
        assert!(root.ty.is_integer(false));
        assert_eq!(root.state, SemaState::Done);
    }

    #[test]
    fn implicit_widening_inserts_cast_around_original() {
        // A byte value returned from an int function must be zero-extended
        let (ctx, module) = check("narrow : byte(b : byte) { b }\nwide : int(b : byte) { narrow(b) }");
        assert!(!ctx.has_error());

        let wide = module.functions[1];
        let children = body_children(&module, wide);
        let last = *children.last().unwrap();

        // convert() wraps the call in an implicit cast whose operand is the
        // original expression
        let ExprKind::Cast {
            cast_kind: CastKind::Implicit,
            operand,
            ..
        } = &module.expr(last).kind
        else {
            panic!("expected an implicit cast, got {:?}", module.expr(last).kind);
        };
        assert!(matches!(module.expr(*operand).kind, ExprKind::Call { .. }));
        assert!(Type::equal(&module.expr(last).ty, &Type::int()));
    }

    #[test]
    fn lvalue_use_inserts_lvalue_to_rvalue() {
        let (ctx, module) = check("x :: 1\nx + 1");
        assert!(!ctx.has_error());

        let children = body_children(&module, module.top_level.unwrap());
        let ExprKind::Binary { lhs, .. } = module.expr(children[1]).kind else {
            panic!("expected binary");
        };
        assert!(matches!(
            module.expr(lhs).kind,
            ExprKind::Cast {
                cast_kind: CastKind::LValueToRValue,
                ..
            }
        ));
    }

    #[test]
    fn type_errors_mark_nodes_and_set_flag() {
        let (ctx, module) = check("x : bool = true\ny :: x + 1");
        assert!(ctx.has_error());

        // Exactly one error: the parent declaration must not cascade
        let errored = module
            .exprs
            .iter()
            .filter(|e| e.state == SemaState::Errored)
            .count();
        assert!(errored >= 1);
    }

    #[test]
    fn assignment_requires_lvalue() {
        let (ctx, _) = check("1 := 2");
        assert!(ctx.has_error());

        let (ctx, _) = check("x :: 1\nx := 2");
        assert!(!ctx.has_error());
    }

    #[test]
    fn overload_resolution_picks_unique_lowest_score() {
        let (ctx, module) = check(
            "f : int(a : int) { a }\n\
             f : int(a : int, b : int) { a + b }\n\
             f(1)",
        );
        assert!(!ctx.has_error());

        let children = body_children(&module, module.top_level.unwrap());
        let call = *children.last().unwrap();
        let ExprKind::Call { callee, .. } = &module.expr(call).kind else {
            panic!("expected call");
        };
        let ExprKind::NameRef {
            target: Some(target),
            ..
        } = &module.expr(*callee).kind
        else {
            panic!("overload set was not resolved to a concrete function");
        };
        assert_eq!(*target, module.functions[0]);
    }

    #[test]
    fn ambiguous_overload_is_an_error() {
        // The literal converts to both candidates at the same score, so the
        // call cannot choose
        let (ctx, _) = check(
            "f : int(a : int) { a }\n\
             f : uint(a : uint) { a }\n\
             f(1)",
        );
        assert!(ctx.has_error());
    }

    #[test]
    fn compound_assignment_rewrites_to_assign_of_binary() {
        let (ctx, module) = check("x :: 1\nx += 2");
        assert!(!ctx.has_error());

        let children = body_children(&module, module.top_level.unwrap());
        let ExprKind::Binary {
            op: BinaryOp::Assign,
            rhs,
            ..
        } = module.expr(children[1]).kind
        else {
            panic!("compound assignment was not rewritten to an assignment");
        };

        // rhs is `x + 2` behind the conversion casts
        let mut rhs = rhs;
        while let ExprKind::Cast { operand, .. } = module.expr(rhs).kind {
            rhs = operand;
        }
        assert!(matches!(
            module.expr(rhs).kind,
            ExprKind::Binary {
                op: BinaryOp::Add,
                ..
            }
        ));
    }

    #[test]
    fn reference_variable_binds_without_copy() {
        let (ctx, module) = check("x :: 1\nr : &int = x");
        assert!(!ctx.has_error());

        let children = body_children(&module, module.top_level.unwrap());
        let ExprKind::VarDecl(decl) = &module.expr(children[1]).kind else {
            panic!("expected declaration");
        };
        assert!(matches!(
            module.expr(decl.init.unwrap()).kind,
            ExprKind::Cast {
                cast_kind: CastKind::LValueToReference,
                ..
            }
        ));
    }

    #[test]
    fn self_referential_initializer_is_rejected() {
        let (ctx, _) = check("x :: x + 1");
        assert!(ctx.has_error());
    }

    #[test]
    fn sizeof_folds_to_constant() {
        let (ctx, module) = check("sizeof 1");
        assert!(!ctx.has_error());

        let children = body_children(&module, module.top_level.unwrap());
        let ExprKind::EvaluatedConstant { value, .. } = module.expr(children[0]).kind else {
            panic!("sizeof did not fold");
        };
        assert_eq!(value, 8);
    }

    #[test]
    fn enum_members_become_constants() {
        let (ctx, module) = check("color :: enum { red; green; blue = 10 }\nx :: green\ny :: blue");
        assert!(!ctx.has_error());

        let children = body_children(&module, module.top_level.unwrap());
        let ExprKind::VarDecl(x) = &module.expr(children[1]).kind else {
            panic!();
        };

        let mut init = x.init.unwrap();
        while let ExprKind::Cast { operand, .. } = module.expr(init).kind {
            init = operand;
        }
        let ExprKind::EvaluatedConstant { value, .. } = module.expr(init).kind else {
            panic!("enumerator reference did not become a constant");
        };
        assert_eq!(value, 1);
    }

    #[test]
    fn struct_member_access_checks_and_offsets() {
        let (ctx, module) = check(
            "pair :: struct { a : int; b : byte }\n\
             p : pair\n\
             p.b",
        );
        assert!(!ctx.has_error());

        let children = body_children(&module, module.top_level.unwrap());
        let access = *children.last().unwrap();
        let ExprKind::MemberAccess {
            index: Some(index), ..
        } = module.expr(access).kind
        else {
            panic!("member access unresolved");
        };
        assert_eq!(index, 1);
        assert!(module.expr(access).ty.is_byte());

        let (ctx, _) = check("pair :: struct { a : int }\np : pair\np.missing");
        assert!(ctx.has_error());
    }

    #[test]
    fn literal_fit_scores_zero_and_rejects_overflow() {
        let (ctx, _) = check("b : byte = 255");
        assert!(!ctx.has_error());

        let (ctx, _) = check("b : byte = 256");
        assert!(ctx.has_error());
    }

    #[test]
    fn narrowing_requires_explicit_cast() {
        let (ctx, _) = check("x :: 1000\nb : byte = x");
        assert!(ctx.has_error());

        let (ctx, _) = check("x :: 1000\nb : byte = x as byte");
        assert!(!ctx.has_error());
    }

    #[test]
    fn pointer_integer_requires_hard_cast() {
        let (ctx, _) = check("x :: 1\np :: &x\ny :: p as int");
        assert!(ctx.has_error());

        let (ctx, _) = check("x :: 1\np :: &x\ny :: p as! int");
        assert!(!ctx.has_error());
    }
}
