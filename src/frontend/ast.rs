//! The abstract syntax tree. All nodes live in arenas owned by the
//! [`Module`]; child links are [`ExprId`] handles, so a pass that needs to
//! replace a sub-expression (e.g. sema inserting an implicit cast) swaps the
//! handle in the parent instead of performing pointer surgery.

use hashbrown::HashMap;

use crate::{
    frontend::{intern::InternedSymbol, lexer::Span},
    index::{IndexVec, simple_index},
    middle::ty::Type,
};

simple_index! {
    /// Identifies an expression node within its module's arena
    pub struct ExprId;
}

simple_index! {
    /// Identifies a scope within its module's arena
    pub struct ScopeId;
}

impl ScopeId {
    pub const GLOBAL: Self = Self(0);
}

#[derive(Debug)]
pub struct Module {
    pub name: InternedSymbol,
    pub exprs: IndexVec<ExprId, Expr>,
    pub scopes: IndexVec<ScopeId, Scope>,
    /// Interned string literal data, referenced by index from string literal
    /// expressions and IR string initializers
    pub strings: Vec<InternedSymbol>,
    /// The synthetic top-level function holding all top-level statements
    pub top_level: Option<ExprId>,
    /// Every explicit function declaration in the module
    pub functions: Vec<ExprId>,
    pub imports: HashMap<InternedSymbol, Span>,
}

impl Module {
    pub fn new(name: InternedSymbol) -> Self {
        let mut scopes = IndexVec::new();
        scopes.push(Scope::new(None));

        Self {
            name,
            exprs: IndexVec::new(),
            scopes,
            strings: Vec::new(),
            top_level: None,
            functions: Vec::new(),
            imports: HashMap::new(),
        }
    }

    pub fn alloc(&mut self, kind: ExprKind, span: Span) -> ExprId {
        self.exprs.push(Expr {
            kind,
            span,
            state: SemaState::Unanalysed,
            ty: Type::void(),
            lvalue: false,
        })
    }

    pub fn expr(&self, id: ExprId) -> &Expr {
        &self.exprs[id]
    }

    pub fn expr_mut(&mut self, id: ExprId) -> &mut Expr {
        &mut self.exprs[id]
    }

    pub fn create_scope(&mut self, parent: ScopeId) -> ScopeId {
        self.scopes.push(Scope::new(Some(parent)))
    }

    /// Declares a symbol in the given scope. Multiple declarations under one
    /// name are only permitted when every one of them is a function
    /// declaration (an overload set). On conflict, returns the previous
    /// declaration.
    pub fn declare(
        &mut self,
        scope: ScopeId,
        name: InternedSymbol,
        decl: ExprId,
    ) -> Result<(), ExprId> {
        let decl_is_func = matches!(self.exprs[decl].kind, ExprKind::FuncDecl(_));

        if let Some(existing) = self.scopes[scope].symbols.get(&name) {
            let all_funcs = existing
                .iter()
                .all(|id| matches!(self.exprs[*id].kind, ExprKind::FuncDecl(_)));

            if !(all_funcs && decl_is_func) {
                return Err(existing[0]);
            }
        }

        self.scopes[scope].symbols.entry(name).or_default().push(decl);
        Ok(())
    }

    /// Looks a name up through the scope chain
    pub fn lookup(&self, mut scope: ScopeId, name: InternedSymbol) -> Option<&[ExprId]> {
        loop {
            let s = &self.scopes[scope];

            if let Some(decls) = s.symbols.get(&name) {
                return Some(decls);
            }

            scope = s.parent?;
        }
    }

    pub fn intern_string(&mut self, value: &str) -> usize {
        let symbol = InternedSymbol::new(value);

        if let Some(index) = self.strings.iter().position(|s| *s == symbol) {
            return index;
        }

        self.strings.push(symbol);
        self.strings.len() - 1
    }

    /// Produces a deep copy of an expression sharing no mutable state with
    /// the original. Declarations cannot be cloned.
    pub fn clone_expr(&mut self, id: ExprId) -> ExprId {
        let expr = &self.exprs[id];
        let (span, state, ty, lvalue) = (expr.span, expr.state, expr.ty.clone(), expr.lvalue);

        let kind = match expr.kind.clone() {
            k @ (ExprKind::FuncDecl(_)
            | ExprKind::VarDecl(_)
            | ExprKind::EnumeratorDecl { .. }
            | ExprKind::TypeDecl { .. }
            | ExprKind::TypeAliasDecl { .. }) => {
                crate::diag::ice!("cannot clone declaration {k:?}")
            }

            k @ (ExprKind::IntegerLiteral(_)
            | ExprKind::BoolLiteral(_)
            | ExprKind::StringLiteral { .. }
            | ExprKind::NameRef { .. }
            | ExprKind::OverloadSet { .. }
            | ExprKind::ModuleRef { .. }
            | ExprKind::TypeExpr { .. }) => k,

            ExprKind::EvaluatedConstant { value, source } => ExprKind::EvaluatedConstant {
                value,
                source: self.clone_expr(source),
            },
            ExprKind::CompoundLiteral { values } => ExprKind::CompoundLiteral {
                values: values.into_iter().map(|v| self.clone_expr(v)).collect(),
            },
            ExprKind::MemberAccess {
                object,
                member,
                index,
            } => ExprKind::MemberAccess {
                object: self.clone_expr(object),
                member,
                index,
            },
            ExprKind::Call { callee, args } => ExprKind::Call {
                callee: self.clone_expr(callee),
                args: args.into_iter().map(|a| self.clone_expr(a)).collect(),
            },
            ExprKind::IntrinsicCall { intrinsic, args } => ExprKind::IntrinsicCall {
                intrinsic,
                args: args.into_iter().map(|a| self.clone_expr(a)).collect(),
            },
            ExprKind::Cast {
                cast_kind,
                operand,
                target,
            } => ExprKind::Cast {
                cast_kind,
                operand: self.clone_expr(operand),
                target,
            },
            ExprKind::Binary { op, lhs, rhs } => ExprKind::Binary {
                op,
                lhs: self.clone_expr(lhs),
                rhs: self.clone_expr(rhs),
            },
            ExprKind::CompoundAssignment { op, lhs, rhs } => ExprKind::CompoundAssignment {
                op,
                lhs: self.clone_expr(lhs),
                rhs: self.clone_expr(rhs),
            },
            ExprKind::Unary { op, operand } => ExprKind::Unary {
                op,
                operand: self.clone_expr(operand),
            },
            ExprKind::If {
                condition,
                then_branch,
                else_branch,
            } => ExprKind::If {
                condition: self.clone_expr(condition),
                then_branch: self.clone_expr(then_branch),
                else_branch: else_branch.map(|e| self.clone_expr(e)),
            },
            ExprKind::While { condition, body } => ExprKind::While {
                condition: self.clone_expr(condition),
                body: self.clone_expr(body),
            },
            ExprKind::For {
                init,
                condition,
                increment,
                body,
            } => ExprKind::For {
                init: self.clone_expr(init),
                condition: self.clone_expr(condition),
                increment: self.clone_expr(increment),
                body: self.clone_expr(body),
            },
            ExprKind::Block { children, scope } => ExprKind::Block {
                children: children.into_iter().map(|c| self.clone_expr(c)).collect(),
                scope,
            },
            ExprKind::Return { value } => ExprKind::Return {
                value: value.map(|v| self.clone_expr(v)),
            },
            ExprKind::Sizeof { operand } => ExprKind::Sizeof {
                operand: self.clone_expr(operand),
            },
            ExprKind::Alignof { operand } => ExprKind::Alignof {
                operand: self.clone_expr(operand),
            },
        };

        self.exprs.push(Expr {
            kind,
            span,
            state,
            ty,
            lvalue,
        })
    }
}

/// Maps names to declarations. Chained lookups walk the parent link.
#[derive(Debug)]
pub struct Scope {
    pub parent: Option<ScopeId>,
    symbols: HashMap<InternedSymbol, Vec<ExprId>>,
}

impl Scope {
    fn new(parent: Option<ScopeId>) -> Self {
        Self {
            parent,
            symbols: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SemaState {
    Unanalysed,
    /// Currently being analysed; guards against self-referential initializers
    InProgress,
    Done,
    Errored,
}

impl SemaState {
    pub fn done_or_errored(self) -> bool {
        matches!(self, SemaState::Done | SemaState::Errored)
    }
}

#[derive(Debug)]
pub struct Expr {
    pub kind: ExprKind,
    pub span: Span,
    pub state: SemaState,
    /// The cached semantic type; Void while untyped
    pub ty: Type,
    pub lvalue: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Linkage {
    Internal,
    Exported,
    Imported,
}

#[derive(Debug, Clone)]
pub struct FuncDecl {
    pub name: InternedSymbol,
    /// The function type as written; sema re-analyses it in place
    pub ty: Type,
    /// One variable declaration per parameter, declared in `scope`
    pub params: Vec<ExprId>,
    pub body: Option<ExprId>,
    pub linkage: Linkage,
    pub forceinline: bool,
    pub scope: ScopeId,
}

#[derive(Debug, Clone)]
pub struct VarDecl {
    pub name: InternedSymbol,
    /// Unknown when the declaration's type is inferred from the initializer
    pub ty: Type,
    pub init: Option<ExprId>,
    /// Module-level declarations get static storage
    pub is_static: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Shl,
    Shr,
    And,
    Or,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    /// lhs := rhs
    Assign,
    /// lhs[rhs]
    Subscript,
}

impl BinaryOp {
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinaryOp::Eq | BinaryOp::Ne | BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge
        )
    }

    pub fn is_arithmetic(self) -> bool {
        matches!(
            self,
            BinaryOp::Add
                | BinaryOp::Sub
                | BinaryOp::Mul
                | BinaryOp::Div
                | BinaryOp::Mod
                | BinaryOp::Shl
                | BinaryOp::Shr
                | BinaryOp::And
                | BinaryOp::Or
        )
    }
}

impl core::fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Mod => "%",
            BinaryOp::Shl => "<<",
            BinaryOp::Shr => ">>",
            BinaryOp::And => "&",
            BinaryOp::Or => "|",
            BinaryOp::Eq => "=",
            BinaryOp::Ne => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::Assign => ":=",
            BinaryOp::Subscript => "[]",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    /// @e: dereference a pointer or reference, yielding an lvalue
    Deref,
    /// &e: address of an lvalue, yielding a pointer
    AddressOf,
    /// ~e
    BitwiseNot,
    /// -e
    Negate,
    /// +e
    Plus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CastKind {
    /// `e as T`; only value-preserving conversions
    Soft,
    /// `e as! T`; additionally allows pointer/integer reinterpretation
    Hard,
    /// Inserted by sema during conversion
    Implicit,
    LValueToRValue,
    LValueToReference,
    ReferenceToLValue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::EnumString, strum::Display)]
pub enum Intrinsic {
    #[strum(serialize = "__builtin_syscall")]
    Syscall,
    #[strum(serialize = "__builtin_debugtrap")]
    DebugTrap,
    #[strum(serialize = "__builtin_memcpy")]
    MemCopy,
}

#[derive(Debug, Clone)]
pub enum ExprKind {
    /* Declarations */
    FuncDecl(Box<FuncDecl>),
    VarDecl(Box<VarDecl>),
    EnumeratorDecl {
        name: InternedSymbol,
        init: Option<ExprId>,
    },
    TypeDecl {
        name: InternedSymbol,
        ty: Type,
    },
    TypeAliasDecl {
        name: InternedSymbol,
        ty: Type,
    },

    /* Literals */
    IntegerLiteral(u64),
    BoolLiteral(bool),
    StringLiteral {
        /// Index into the module's string table
        index: usize,
    },
    CompoundLiteral {
        values: Vec<ExprId>,
    },

    /* Names */
    NameRef {
        name: InternedSymbol,
        scope: ScopeId,
        /// Filled in by sema
        target: Option<ExprId>,
    },
    /// A name bound to multiple function declarations; resolution rewrites
    /// this into a reference to a concrete function
    OverloadSet {
        overloads: Vec<ExprId>,
    },
    /// A constant produced by sema's evaluator; keeps the original around for
    /// diagnostics
    EvaluatedConstant {
        value: u64,
        source: ExprId,
    },
    ModuleRef {
        name: InternedSymbol,
    },
    /// A type in expression position
    TypeExpr {
        ty: Type,
    },

    /* Operations */
    MemberAccess {
        object: ExprId,
        member: InternedSymbol,
        /// Member index within the struct, filled in by sema
        index: Option<usize>,
    },
    Call {
        callee: ExprId,
        args: Vec<ExprId>,
    },
    IntrinsicCall {
        intrinsic: Intrinsic,
        args: Vec<ExprId>,
    },
    Cast {
        cast_kind: CastKind,
        operand: ExprId,
        target: Type,
    },
    Binary {
        op: BinaryOp,
        lhs: ExprId,
        rhs: ExprId,
    },
    /// `lhs op= rhs`; sema rewrites this to `lhs := lhs op rhs`
    CompoundAssignment {
        op: BinaryOp,
        lhs: ExprId,
        rhs: ExprId,
    },
    Unary {
        op: UnaryOp,
        operand: ExprId,
    },

    /* Control flow */
    If {
        condition: ExprId,
        then_branch: ExprId,
        else_branch: Option<ExprId>,
    },
    While {
        condition: ExprId,
        body: ExprId,
    },
    For {
        init: ExprId,
        condition: ExprId,
        increment: ExprId,
        body: ExprId,
    },
    Block {
        children: Vec<ExprId>,
        scope: ScopeId,
    },
    Return {
        value: Option<ExprId>,
    },

    /* Queries */
    Sizeof {
        operand: ExprId,
    },
    Alignof {
        operand: ExprId,
    },
}

impl ExprKind {
    pub fn is_declaration(&self) -> bool {
        matches!(
            self,
            ExprKind::FuncDecl(_)
                | ExprKind::VarDecl(_)
                | ExprKind::EnumeratorDecl { .. }
                | ExprKind::TypeDecl { .. }
                | ExprKind::TypeAliasDecl { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontend::lexer::Span;

    fn dummy_span() -> Span {
        Span::new(0, 0)
    }

    fn func_decl(module: &mut Module, name: &str) -> ExprId {
        let scope = module.create_scope(ScopeId::GLOBAL);
        module.alloc(
            ExprKind::FuncDecl(Box::new(FuncDecl {
                name: InternedSymbol::new(name),
                ty: Type::function(Vec::new(), Type::int(), crate::middle::ty::CallConv::Sable, false),
                params: Vec::new(),
                body: None,
                linkage: Linkage::Internal,
                forceinline: false,
                scope,
            })),
            dummy_span(),
        )
    }

    #[test]
    fn scope_permits_function_overloads_only() {
        let mut module = Module::new(InternedSymbol::new("test"));
        let name = InternedSymbol::new("f");

        let f1 = func_decl(&mut module, "f");
        let f2 = func_decl(&mut module, "f");
        assert!(module.declare(ScopeId::GLOBAL, name, f1).is_ok());
        assert!(module.declare(ScopeId::GLOBAL, name, f2).is_ok());
        assert_eq!(module.lookup(ScopeId::GLOBAL, name).unwrap().len(), 2);

        let var = module.alloc(
            ExprKind::VarDecl(Box::new(VarDecl {
                name,
                ty: Type::int(),
                init: None,
                is_static: false,
            })),
            dummy_span(),
        );
        assert_eq!(module.declare(ScopeId::GLOBAL, name, var), Err(f1));
    }

    #[test]
    fn lookup_chains_through_parents() {
        let mut module = Module::new(InternedSymbol::new("test"));
        let name = InternedSymbol::new("x");

        let var = module.alloc(
            ExprKind::VarDecl(Box::new(VarDecl {
                name,
                ty: Type::int(),
                init: None,
                is_static: false,
            })),
            dummy_span(),
        );
        module.declare(ScopeId::GLOBAL, name, var).unwrap();

        let inner = module.create_scope(ScopeId::GLOBAL);
        assert_eq!(module.lookup(inner, name), Some(&[var][..]));
        assert_eq!(module.lookup(inner, InternedSymbol::new("y")), None);
    }

    #[test]
    fn clone_expr_shares_nothing() {
        let mut module = Module::new(InternedSymbol::new("test"));

        let lhs = module.alloc(ExprKind::IntegerLiteral(1), dummy_span());
        let rhs = module.alloc(ExprKind::IntegerLiteral(2), dummy_span());
        let sum = module.alloc(
            ExprKind::Binary {
                op: BinaryOp::Add,
                lhs,
                rhs,
            },
            dummy_span(),
        );

        let copy = module.clone_expr(sum);
        assert_ne!(copy, sum);

        let ExprKind::Binary {
            lhs: clhs,
            rhs: crhs,
            ..
        } = module.expr(copy).kind
        else {
            panic!("clone changed the expression kind");
        };
        assert_ne!(clhs, lhs);
        assert_ne!(crhs, rhs);
    }
}
