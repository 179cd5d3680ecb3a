//! Recursive descent parser for the Sable language.
//!
//! A module is a sequence of declarations and statements. Functions are
//! declarations whose type is a function type and whose initializer is a
//! block:
//!
//! ```text
//! counter : int = 4                 // variable with explicit type
//! doubled :: counter * 2            // variable with inferred type
//! add : int(a : int, b : int) {     // function definition
//!     a + b
//! }
//! puts : int(s : @byte) extern      // imported C function
//! ```
//!
//! Top-level statements that are not function declarations are collected into
//! the body of a synthetic top-level function named `main`.

use std::{cell::OnceCell, rc::Rc};

use crate::{
    diag::{Context, Diag},
    frontend::{
        SourceFile,
        ast::{
            BinaryOp, CastKind, ExprId, ExprKind, FuncDecl, Intrinsic, Linkage, Module, ScopeId,
            UnaryOp, VarDecl,
        },
        intern::InternedSymbol,
        lexer::{self, Keyword, Lexer, Span, Token, TokenKind},
    },
    middle::ty::{CallConv, Enumerator, EnumType, FfiKind, FuncParam, StructMember, StructType, Type, TypeKind},
};

pub struct Parser<'ctx> {
    ctx: &'ctx Context,
    tokens: Vec<Token>,
    position: usize,
    module: Module,
}

impl<'ctx> Parser<'ctx> {
    pub fn parse_module(ctx: &'ctx Context, name: &str) -> Module {
        let tokens = Lexer::new(ctx).tokenize();

        let mut parser = Parser {
            ctx,
            tokens,
            position: 0,
            module: Module::new(InternedSymbol::new(name)),
        };

        parser.parse_top_level();
        parser.module
    }

    fn source(&self) -> &SourceFile {
        &self.ctx.source
    }

    /* Token plumbing */

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.position)
    }

    fn peek_kind(&self) -> Option<TokenKind> {
        self.peek().map(|t| t.kind)
    }

    fn peek_nth(&self, n: usize) -> Option<&Token> {
        self.tokens.get(self.position + n)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.position).cloned();
        self.position += 1;
        token
    }

    fn at(&self, kind: TokenKind) -> bool {
        self.peek_kind() == Some(kind)
    }

    fn eat(&mut self, kind: TokenKind) -> bool {
        if self.at(kind) {
            self.position += 1;
            return true;
        }

        false
    }

    fn current_span(&self) -> Span {
        match self.peek() {
            Some(token) => token.span,
            None => {
                let end = self.source().contents.len();
                Span::new(end, end)
            }
        }
    }

    fn previous_span(&self) -> Span {
        self.tokens
            .get(self.position.saturating_sub(1))
            .map(|t| t.span)
            .unwrap_or_else(|| self.current_span())
    }

    fn expect(&mut self, kind: TokenKind, what: &str) -> Option<Token> {
        if self.at(kind) {
            return self.next();
        }

        Diag::error(
            self.ctx,
            self.current_span(),
            format!("expected {what} but found {:?}", self.peek_kind()),
        )
        .emit();
        None
    }

    fn token_text(&self, token: &Token) -> &str {
        self.source().value_of_span(token.span)
    }

    fn symbol_of(&self, token: &Token) -> InternedSymbol {
        InternedSymbol::new(self.source().value_of_span(token.span))
    }

    /// Skips ahead to a statement boundary after a parse error
    fn recover(&mut self) {
        while let Some(kind) = self.peek_kind() {
            self.position += 1;
            if kind == TokenKind::Semicolon || kind == TokenKind::CloseBrace {
                break;
            }
        }
    }

    /* Top level */

    fn parse_top_level(&mut self) {
        let mut top_statements = Vec::new();
        let start = self.current_span();

        while self.peek().is_some() {
            if self.eat(TokenKind::Semicolon) {
                continue;
            }

            let Some(stmt) = self.parse_statement(ScopeId::GLOBAL) else {
                self.recover();
                continue;
            };

            match &self.module.expr(stmt).kind {
                ExprKind::FuncDecl(_) => {}
                ExprKind::VarDecl(decl) => {
                    // Top level variables get static storage
                    let mut decl = decl.clone();
                    decl.is_static = true;
                    self.module.expr_mut(stmt).kind = ExprKind::VarDecl(decl);
                    top_statements.push(stmt);
                }
                _ => top_statements.push(stmt),
            }
        }

        let end = self.previous_span();
        let span = start.to(end);

        /* Build the synthetic top-level function */

        let scope = self.module.create_scope(ScopeId::GLOBAL);
        let body = self.module.alloc(
            ExprKind::Block {
                children: top_statements,
                scope,
            },
            span,
        );

        let name = InternedSymbol::new("main");
        let ty = Type::function(Vec::new(), Type::int(), CallConv::Sable, false);
        let top_level = self.module.alloc(
            ExprKind::FuncDecl(Box::new(FuncDecl {
                name,
                ty,
                params: Vec::new(),
                body: Some(body),
                linkage: Linkage::Exported,
                forceinline: false,
                scope,
            })),
            span,
        );

        self.module.top_level = Some(top_level);
    }

    /* Statements */

    fn parse_statement(&mut self, scope: ScopeId) -> Option<ExprId> {
        // A declaration starts with `name :` or `name ::`
        if self.at(TokenKind::Identifier)
            && matches!(
                self.peek_nth(1).map(|t| t.kind),
                Some(TokenKind::Colon | TokenKind::DoubleColon)
            )
        {
            return self.parse_declaration(scope);
        }

        self.parse_expression(scope)
    }

    fn parse_declaration(&mut self, scope: ScopeId) -> Option<ExprId> {
        let name_token = self.next().unwrap();
        let name = self.symbol_of(&name_token);

        /* Inferred declarations and type declarations */

        if self.eat(TokenKind::DoubleColon) {
            if self.at(TokenKind::Keyword(Keyword::Struct)) {
                return self.parse_struct_decl(scope, name, name_token.span);
            }

            if self.at(TokenKind::Keyword(Keyword::Enum)) {
                return self.parse_enum_decl(scope, name, name_token.span);
            }

            let init = self.parse_expression(scope)?;
            let span = name_token.span.to(self.module.expr(init).span);

            let decl = self.module.alloc(
                ExprKind::VarDecl(Box::new(VarDecl {
                    name,
                    ty: Type::unknown(),
                    init: Some(init),
                    is_static: false,
                })),
                span,
            );
            self.declare_or_error(scope, name, decl);
            return Some(decl);
        }

        /* Explicitly typed declarations */

        self.expect(TokenKind::Colon, "`:`")?;
        let ty = self.parse_type(scope)?;

        // A function type followed by a block or linkage attributes is a
        // function declaration
        if ty.is_function() {
            let mut linkage = Linkage::Internal;
            let mut forceinline = false;

            loop {
                if self.eat(TokenKind::Keyword(Keyword::Extern)) {
                    linkage = Linkage::Imported;
                } else if self.eat(TokenKind::Keyword(Keyword::Export)) {
                    linkage = Linkage::Exported;
                } else if self.eat(TokenKind::Keyword(Keyword::Inline)) {
                    forceinline = true;
                } else {
                    break;
                }
            }

            if self.at(TokenKind::OpenBrace) || linkage == Linkage::Imported {
                return self.parse_function_decl(
                    scope,
                    name,
                    name_token.span,
                    ty,
                    linkage,
                    forceinline,
                );
            }
        }

        let init = if self.eat(TokenKind::Equals) {
            Some(self.parse_expression(scope)?)
        } else {
            None
        };

        let end = init
            .map(|e| self.module.expr(e).span)
            .unwrap_or_else(|| self.previous_span());

        let decl = self.module.alloc(
            ExprKind::VarDecl(Box::new(VarDecl {
                name,
                ty,
                init,
                is_static: false,
            })),
            name_token.span.to(end),
        );
        self.declare_or_error(scope, name, decl);
        Some(decl)
    }

    fn parse_function_decl(
        &mut self,
        scope: ScopeId,
        name: InternedSymbol,
        name_span: Span,
        ty: Type,
        linkage: Linkage,
        forceinline: bool,
    ) -> Option<ExprId> {
        if scope != ScopeId::GLOBAL {
            Diag::error(
                self.ctx,
                name_span,
                "function declarations are only permitted at the top level",
            )
            .emit();
        }

        if name.value() == "main" {
            Diag::error(
                self.ctx,
                name_span,
                "`main` is reserved for the top-level program body",
            )
            .emit();
        }

        let func_scope = self.module.create_scope(scope);

        /* Declare one variable per parameter in the function scope */

        let func_ty = ty.as_function().unwrap().clone();
        let mut params = Vec::new();
        for param in &func_ty.params {
            let decl = self.module.alloc(
                ExprKind::VarDecl(Box::new(VarDecl {
                    name: param.name,
                    ty: param.ty.clone(),
                    init: None,
                    is_static: false,
                })),
                name_span,
            );
            self.declare_or_error(func_scope, param.name, decl);
            params.push(decl);
        }

        let body = if self.at(TokenKind::OpenBrace) {
            Some(self.parse_block(func_scope)?)
        } else {
            None
        };

        let end = self.previous_span();
        let decl = self.module.alloc(
            ExprKind::FuncDecl(Box::new(FuncDecl {
                name,
                ty,
                params,
                body,
                linkage,
                forceinline,
                scope: func_scope,
            })),
            name_span.to(end),
        );

        self.declare_or_error(scope, name, decl);
        self.module.functions.push(decl);
        Some(decl)
    }

    fn parse_struct_decl(
        &mut self,
        scope: ScopeId,
        name: InternedSymbol,
        name_span: Span,
    ) -> Option<ExprId> {
        self.expect(TokenKind::Keyword(Keyword::Struct), "`struct`")?;
        self.expect(TokenKind::OpenBrace, "`{`")?;

        let mut members = Vec::new();
        while !self.at(TokenKind::CloseBrace) && self.peek().is_some() {
            if self.eat(TokenKind::Semicolon) {
                continue;
            }

            let member_name = self.expect(TokenKind::Identifier, "a member name")?;
            self.expect(TokenKind::Colon, "`:`")?;
            let member_ty = self.parse_type(scope)?;

            members.push(StructMember {
                name: self.symbol_of(&member_name),
                ty: member_ty,
                byte_offset: OnceCell::new(),
            });
        }
        self.expect(TokenKind::CloseBrace, "`}`")?;

        let ty = Type::new(TypeKind::Struct(Rc::new(StructType {
            name: Some(name),
            members,
            layout: OnceCell::new(),
        })));

        let decl = self.module.alloc(
            ExprKind::TypeDecl { name, ty },
            name_span.to(self.previous_span()),
        );
        self.declare_or_error(scope, name, decl);
        Some(decl)
    }

    fn parse_enum_decl(
        &mut self,
        scope: ScopeId,
        name: InternedSymbol,
        name_span: Span,
    ) -> Option<ExprId> {
        self.expect(TokenKind::Keyword(Keyword::Enum), "`enum`")?;
        self.expect(TokenKind::OpenBrace, "`{`")?;

        let mut enumerators = Vec::new();
        let mut enumerator_decls = Vec::new();

        while !self.at(TokenKind::CloseBrace) && self.peek().is_some() {
            if self.eat(TokenKind::Semicolon) {
                continue;
            }

            let enumerator_name = self.expect(TokenKind::Identifier, "an enumerator name")?;
            let init = if self.eat(TokenKind::Equals) {
                Some(self.parse_expression(scope)?)
            } else {
                None
            };

            let symbol = self.symbol_of(&enumerator_name);
            enumerators.push(Enumerator {
                name: symbol,
                init,
                value: OnceCell::new(),
            });

            let decl = self.module.alloc(
                ExprKind::EnumeratorDecl { name: symbol, init },
                enumerator_name.span,
            );
            enumerator_decls.push((symbol, decl));
        }
        self.expect(TokenKind::CloseBrace, "`}`")?;

        let ty = Type::new(TypeKind::Enum(Rc::new(EnumType {
            name,
            underlying: Type::int(),
            enumerators,
        })));

        // Enumerators are declared in the surrounding scope and carry the
        // enum type
        for (symbol, decl) in enumerator_decls {
            self.module.expr_mut(decl).ty = ty.clone();
            self.declare_or_error(scope, symbol, decl);
        }

        let decl = self.module.alloc(
            ExprKind::TypeDecl { name, ty },
            name_span.to(self.previous_span()),
        );
        self.declare_or_error(scope, name, decl);
        Some(decl)
    }

    fn declare_or_error(&mut self, scope: ScopeId, name: InternedSymbol, decl: ExprId) {
        if let Err(previous) = self.module.declare(scope, name, decl) {
            let span = self.module.expr(decl).span;
            Diag::error(self.ctx, span, format!("redeclaration of '{name}'")).emit();
            Diag::note(
                self.ctx,
                self.module.expr(previous).span,
                "previously declared here",
            )
            .emit();
        }
    }

    /* Types */

    fn parse_type(&mut self, scope: ScopeId) -> Option<Type> {
        if self.eat(TokenKind::At) {
            let inner = self.parse_type(scope)?;
            return Some(Type::pointer(inner));
        }

        if self.eat(TokenKind::Ampersand) {
            let inner = self.parse_type(scope)?;
            if inner.is_reference() {
                Diag::error(self.ctx, self.previous_span(), "references cannot nest").emit();
                return Some(Type::error());
            }
            return Some(Type::reference(inner));
        }

        let token = self.expect(TokenKind::Identifier, "a type name")?;
        let text = self.token_text(&token).to_owned();

        let mut ty = match text.as_str() {
            "int" => Type::int(),
            "uint" => Type::uint(),
            "bool" => Type::bool(),
            "byte" => Type::byte(),
            "void" => Type::void(),
            _ => {
                if let Ok(ffi) = text.parse::<FfiKind>() {
                    Type::new(TypeKind::Ffi(ffi))
                } else if let Some(int) = parse_sized_integer(&text) {
                    int
                } else {
                    Type::new(TypeKind::Named(InternedSymbol::new(&text)))
                }
            }
        };

        /* Suffixes: arrays and function types */

        loop {
            if self.eat(TokenKind::OpenBracket) {
                if self.eat(TokenKind::CloseBracket) {
                    ty = Type::new(TypeKind::DynamicArray { elem: ty });
                    continue;
                }

                let size = self.parse_expression(scope)?;
                self.expect(TokenKind::CloseBracket, "`]`")?;

                ty = Type::new(TypeKind::Array {
                    elem: ty,
                    size: Some(size),
                    dim: OnceCell::new(),
                });
                continue;
            }

            if self.at(TokenKind::OpenParen) {
                ty = self.parse_function_type_suffix(scope, ty)?;
                continue;
            }

            break;
        }

        Some(ty)
    }

    fn parse_function_type_suffix(&mut self, scope: ScopeId, ret: Type) -> Option<Type> {
        self.expect(TokenKind::OpenParen, "`(`")?;

        let mut params = Vec::new();
        let mut variadic = false;

        while !self.at(TokenKind::CloseParen) && self.peek().is_some() {
            if self.at(TokenKind::Dot) {
                // `...` marks a variadic function
                self.expect(TokenKind::Dot, "`.`")?;
                self.expect(TokenKind::Dot, "`.`")?;
                self.expect(TokenKind::Dot, "`.`")?;
                variadic = true;
                break;
            }

            let name = self.expect(TokenKind::Identifier, "a parameter name")?;
            self.expect(TokenKind::Colon, "`:`")?;
            let ty = self.parse_type(scope)?;

            params.push(FuncParam {
                name: self.symbol_of(&name),
                ty,
            });

            if !self.eat(TokenKind::Comma) {
                break;
            }
        }
        self.expect(TokenKind::CloseParen, "`)`")?;

        Some(Type::function(params, ret, CallConv::Sable, variadic))
    }

    /* Expressions */

    fn parse_expression(&mut self, scope: ScopeId) -> Option<ExprId> {
        self.parse_assignment(scope)
    }

    fn parse_assignment(&mut self, scope: ScopeId) -> Option<ExprId> {
        let lhs = self.parse_comparison(scope)?;

        if self.eat(TokenKind::ColonEquals) {
            let rhs = self.parse_assignment(scope)?;
            let span = self.span_of(lhs).to(self.span_of(rhs));
            return Some(self.module.alloc(
                ExprKind::Binary {
                    op: BinaryOp::Assign,
                    lhs,
                    rhs,
                },
                span,
            ));
        }

        if let Some(kind) = self.peek_kind() {
            if kind.is_compound_assignment_operator() {
                self.next();
                let op = compound_assignment_op(kind);
                let rhs = self.parse_assignment(scope)?;
                let span = self.span_of(lhs).to(self.span_of(rhs));
                return Some(
                    self.module
                        .alloc(ExprKind::CompoundAssignment { op, lhs, rhs }, span),
                );
            }
        }

        Some(lhs)
    }

    fn parse_comparison(&mut self, scope: ScopeId) -> Option<ExprId> {
        let mut lhs = self.parse_bit_or(scope)?;

        while self
            .peek_kind()
            .is_some_and(|k| k.is_comparison_operator())
        {
            let op = match self.next().unwrap().kind {
                TokenKind::Equals => BinaryOp::Eq,
                TokenKind::NotEquals => BinaryOp::Ne,
                TokenKind::LessThan => BinaryOp::Lt,
                TokenKind::LessThanOrEqualTo => BinaryOp::Le,
                TokenKind::GreaterThan => BinaryOp::Gt,
                TokenKind::GreaterThanOrEqualTo => BinaryOp::Ge,
                _ => unreachable!(),
            };
            let rhs = self.parse_bit_or(scope)?;
            let span = self.span_of(lhs).to(self.span_of(rhs));
            lhs = self.module.alloc(ExprKind::Binary { op, lhs, rhs }, span);
        }

        Some(lhs)
    }

    fn parse_bit_or(&mut self, scope: ScopeId) -> Option<ExprId> {
        let mut lhs = self.parse_bit_and(scope)?;

        while self.eat(TokenKind::Pipe) {
            let rhs = self.parse_bit_and(scope)?;
            let span = self.span_of(lhs).to(self.span_of(rhs));
            lhs = self.module.alloc(
                ExprKind::Binary {
                    op: BinaryOp::Or,
                    lhs,
                    rhs,
                },
                span,
            );
        }

        Some(lhs)
    }

    fn parse_bit_and(&mut self, scope: ScopeId) -> Option<ExprId> {
        let mut lhs = self.parse_shift(scope)?;

        while self.eat(TokenKind::Ampersand) {
            let rhs = self.parse_shift(scope)?;
            let span = self.span_of(lhs).to(self.span_of(rhs));
            lhs = self.module.alloc(
                ExprKind::Binary {
                    op: BinaryOp::And,
                    lhs,
                    rhs,
                },
                span,
            );
        }

        Some(lhs)
    }

    fn parse_shift(&mut self, scope: ScopeId) -> Option<ExprId> {
        let mut lhs = self.parse_term(scope)?;

        while self.peek_kind().is_some_and(|k| k.is_bit_shift_operator()) {
            let op = match self.next().unwrap().kind {
                TokenKind::ShiftLeft => BinaryOp::Shl,
                TokenKind::ShiftRight => BinaryOp::Shr,
                _ => unreachable!(),
            };
            let rhs = self.parse_term(scope)?;
            let span = self.span_of(lhs).to(self.span_of(rhs));
            lhs = self.module.alloc(ExprKind::Binary { op, lhs, rhs }, span);
        }

        Some(lhs)
    }

    fn parse_term(&mut self, scope: ScopeId) -> Option<ExprId> {
        let mut lhs = self.parse_factor(scope)?;

        while self.peek_kind().is_some_and(|k| k.is_term_operator()) {
            let op = match self.next().unwrap().kind {
                TokenKind::Plus => BinaryOp::Add,
                TokenKind::Minus => BinaryOp::Sub,
                _ => unreachable!(),
            };
            let rhs = self.parse_factor(scope)?;
            let span = self.span_of(lhs).to(self.span_of(rhs));
            lhs = self.module.alloc(ExprKind::Binary { op, lhs, rhs }, span);
        }

        Some(lhs)
    }

    fn parse_factor(&mut self, scope: ScopeId) -> Option<ExprId> {
        let mut lhs = self.parse_cast(scope)?;

        while self.peek_kind().is_some_and(|k| k.is_factor_operator()) {
            let op = match self.next().unwrap().kind {
                TokenKind::Asterisk => BinaryOp::Mul,
                TokenKind::Divide => BinaryOp::Div,
                TokenKind::Modulus => BinaryOp::Mod,
                _ => unreachable!(),
            };
            let rhs = self.parse_cast(scope)?;
            let span = self.span_of(lhs).to(self.span_of(rhs));
            lhs = self.module.alloc(ExprKind::Binary { op, lhs, rhs }, span);
        }

        Some(lhs)
    }

    fn parse_cast(&mut self, scope: ScopeId) -> Option<ExprId> {
        let mut operand = self.parse_unary(scope)?;

        while self.eat(TokenKind::Keyword(Keyword::As)) {
            let cast_kind = if self.eat(TokenKind::Bang) {
                CastKind::Hard
            } else {
                CastKind::Soft
            };
            let target = self.parse_type(scope)?;
            let span = self.span_of(operand).to(self.previous_span());

            operand = self.module.alloc(
                ExprKind::Cast {
                    cast_kind,
                    operand,
                    target,
                },
                span,
            );
        }

        Some(operand)
    }

    fn parse_unary(&mut self, scope: ScopeId) -> Option<ExprId> {
        if self.peek_kind().is_some_and(|k| k.is_unary_operator()) {
            let token = self.next().unwrap();
            let op = match token.kind {
                TokenKind::At => UnaryOp::Deref,
                TokenKind::Ampersand => UnaryOp::AddressOf,
                TokenKind::Tilde => UnaryOp::BitwiseNot,
                TokenKind::Minus => UnaryOp::Negate,
                TokenKind::Plus => UnaryOp::Plus,
                _ => unreachable!(),
            };

            let operand = self.parse_unary(scope)?;
            let span = token.span.to(self.span_of(operand));
            return Some(self.module.alloc(ExprKind::Unary { op, operand }, span));
        }

        self.parse_postfix(scope)
    }

    fn parse_postfix(&mut self, scope: ScopeId) -> Option<ExprId> {
        let mut expr = self.parse_primary(scope)?;

        loop {
            if self.at(TokenKind::OpenParen) {
                let args = self.parse_call_arguments(scope)?;
                let span = self.span_of(expr).to(self.previous_span());
                expr = self.module.alloc(ExprKind::Call { callee: expr, args }, span);
                continue;
            }

            if self.eat(TokenKind::OpenBracket) {
                let index = self.parse_expression(scope)?;
                self.expect(TokenKind::CloseBracket, "`]`")?;
                let span = self.span_of(expr).to(self.previous_span());
                expr = self.module.alloc(
                    ExprKind::Binary {
                        op: BinaryOp::Subscript,
                        lhs: expr,
                        rhs: index,
                    },
                    span,
                );
                continue;
            }

            if self.eat(TokenKind::Dot) {
                let member = self.expect(TokenKind::Identifier, "a member name")?;
                let span = self.span_of(expr).to(member.span);
                expr = self.module.alloc(
                    ExprKind::MemberAccess {
                        object: expr,
                        member: self.symbol_of(&member),
                        index: None,
                    },
                    span,
                );
                continue;
            }

            break;
        }

        Some(expr)
    }

    fn parse_call_arguments(&mut self, scope: ScopeId) -> Option<Vec<ExprId>> {
        self.expect(TokenKind::OpenParen, "`(`")?;

        let mut args = Vec::new();
        while !self.at(TokenKind::CloseParen) && self.peek().is_some() {
            args.push(self.parse_expression(scope)?);

            if !self.eat(TokenKind::Comma) {
                break;
            }
        }
        self.expect(TokenKind::CloseParen, "`)`")?;

        Some(args)
    }

    fn parse_primary(&mut self, scope: ScopeId) -> Option<ExprId> {
        let token = self.peek()?.clone();

        match token.kind {
            TokenKind::IntegerLiteral => {
                self.next();
                let text = self.token_text(&token).replace('_', "");

                let value = if let Some(hex) = text.strip_prefix("0x") {
                    u64::from_str_radix(hex, 16)
                } else if let Some(bin) = text.strip_prefix("0b") {
                    u64::from_str_radix(bin, 2)
                } else {
                    text.parse::<u64>()
                };

                let value = match value {
                    Ok(v) => v,
                    Err(_) => {
                        Diag::error(self.ctx, token.span, "integer literal does not fit in 64 bits")
                            .emit();
                        0
                    }
                };

                Some(self.module.alloc(ExprKind::IntegerLiteral(value), token.span))
            }

            TokenKind::StringLiteral => {
                self.next();
                let decoded = lexer::unescape_string_literal(self.token_text(&token));
                let index = self.module.intern_string(&decoded);
                Some(self.module.alloc(ExprKind::StringLiteral { index }, token.span))
            }

            TokenKind::Keyword(Keyword::True) => {
                self.next();
                Some(self.module.alloc(ExprKind::BoolLiteral(true), token.span))
            }

            TokenKind::Keyword(Keyword::False) => {
                self.next();
                Some(self.module.alloc(ExprKind::BoolLiteral(false), token.span))
            }

            TokenKind::Identifier => {
                self.next();
                let name = self.symbol_of(&token);

                // Intrinsic calls look like regular calls on reserved names
                if let Ok(intrinsic) = name.value().parse::<Intrinsic>() {
                    let args = self.parse_call_arguments(scope)?;
                    let span = token.span.to(self.previous_span());
                    return Some(
                        self.module
                            .alloc(ExprKind::IntrinsicCall { intrinsic, args }, span),
                    );
                }

                Some(self.module.alloc(
                    ExprKind::NameRef {
                        name,
                        scope,
                        target: None,
                    },
                    token.span,
                ))
            }

            TokenKind::OpenParen => {
                self.next();
                let inner = self.parse_expression(scope)?;
                self.expect(TokenKind::CloseParen, "`)`")?;
                Some(inner)
            }

            TokenKind::OpenBracket => {
                self.next();
                let mut values = Vec::new();

                while !self.at(TokenKind::CloseBracket) && self.peek().is_some() {
                    values.push(self.parse_expression(scope)?);
                    if !self.eat(TokenKind::Comma) {
                        break;
                    }
                }
                self.expect(TokenKind::CloseBracket, "`]`")?;

                let span = token.span.to(self.previous_span());
                Some(self.module.alloc(ExprKind::CompoundLiteral { values }, span))
            }

            TokenKind::OpenBrace => self.parse_block(scope),

            TokenKind::Keyword(Keyword::If) => {
                self.next();
                let condition = self.parse_expression(scope)?;
                let then_branch = self.parse_block(scope)?;
                let else_branch = if self.eat(TokenKind::Keyword(Keyword::Else)) {
                    if self.at(TokenKind::Keyword(Keyword::If)) {
                        Some(self.parse_primary(scope)?)
                    } else {
                        Some(self.parse_block(scope)?)
                    }
                } else {
                    None
                };

                let span = token.span.to(self.previous_span());
                Some(self.module.alloc(
                    ExprKind::If {
                        condition,
                        then_branch,
                        else_branch,
                    },
                    span,
                ))
            }

            TokenKind::Keyword(Keyword::While) => {
                self.next();
                let condition = self.parse_expression(scope)?;
                let body = self.parse_block(scope)?;
                let span = token.span.to(self.previous_span());
                Some(self.module.alloc(ExprKind::While { condition, body }, span))
            }

            TokenKind::Keyword(Keyword::For) => {
                self.next();
                let for_scope = self.module.create_scope(scope);

                let init = self.parse_statement(for_scope)?;
                self.expect(TokenKind::Semicolon, "`;`")?;
                let condition = self.parse_expression(for_scope)?;
                self.expect(TokenKind::Semicolon, "`;`")?;
                let increment = self.parse_expression(for_scope)?;
                let body = self.parse_block(for_scope)?;

                let span = token.span.to(self.previous_span());
                Some(self.module.alloc(
                    ExprKind::For {
                        init,
                        condition,
                        increment,
                        body,
                    },
                    span,
                ))
            }

            TokenKind::Keyword(Keyword::Return) => {
                self.next();

                let value = if self.at(TokenKind::Semicolon)
                    || self.at(TokenKind::CloseBrace)
                    || self.peek().is_none()
                {
                    None
                } else {
                    Some(self.parse_expression(scope)?)
                };

                let span = token.span.to(self.previous_span());
                Some(self.module.alloc(ExprKind::Return { value }, span))
            }

            TokenKind::Keyword(Keyword::Sizeof) => {
                self.next();
                let operand = self.parse_unary(scope)?;
                let span = token.span.to(self.span_of(operand));
                Some(self.module.alloc(ExprKind::Sizeof { operand }, span))
            }

            TokenKind::Keyword(Keyword::Alignof) => {
                self.next();
                let operand = self.parse_unary(scope)?;
                let span = token.span.to(self.span_of(operand));
                Some(self.module.alloc(ExprKind::Alignof { operand }, span))
            }

            _ => {
                Diag::error(
                    self.ctx,
                    token.span,
                    format!("expected an expression but found {:?}", token.kind),
                )
                .emit();
                None
            }
        }
    }

    fn parse_block(&mut self, parent: ScopeId) -> Option<ExprId> {
        let open = self.expect(TokenKind::OpenBrace, "`{`")?;
        let scope = self.module.create_scope(parent);

        let mut children = Vec::new();
        while !self.at(TokenKind::CloseBrace) && self.peek().is_some() {
            if self.eat(TokenKind::Semicolon) {
                continue;
            }

            match self.parse_statement(scope) {
                Some(stmt) => children.push(stmt),
                None => self.recover(),
            }
        }
        self.expect(TokenKind::CloseBrace, "`}`")?;

        let span = open.span.to(self.previous_span());
        Some(self.module.alloc(ExprKind::Block { children, scope }, span))
    }

    fn span_of(&self, expr: ExprId) -> Span {
        self.module.expr(expr).span
    }
}

fn compound_assignment_op(kind: TokenKind) -> BinaryOp {
    match kind {
        TokenKind::PlusEquals => BinaryOp::Add,
        TokenKind::MinusEquals => BinaryOp::Sub,
        TokenKind::MultiplyEquals => BinaryOp::Mul,
        TokenKind::DivideEquals => BinaryOp::Div,
        TokenKind::ModulusEquals => BinaryOp::Mod,
        TokenKind::AndEquals => BinaryOp::And,
        TokenKind::OrEquals => BinaryOp::Or,
        TokenKind::ShiftLeftEquals => BinaryOp::Shl,
        TokenKind::ShiftRightEquals => BinaryOp::Shr,
        _ => unreachable!(),
    }
}

/// Parses s24 / u8 style arbitrary-width integer type names
fn parse_sized_integer(text: &str) -> Option<Type> {
    let (first, rest) = text.split_at(1);

    let signed = match first {
        "s" => true,
        "u" => false,
        _ => return None,
    };

    let bits = rest.parse::<usize>().ok()?;
    if bits == 0 || bits > 64 {
        return None;
    }

    Some(Type::integer(bits, signed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontend::SourceFile;

    fn parse(source: &str) -> (Context, Module) {
        let ctx = Context::new(SourceFile::in_memory(source));
        let module = Parser::parse_module(&ctx, "test");
        (ctx, module)
    }

    fn top_level_children(module: &Module) -> Vec<ExprId> {
        let ExprKind::FuncDecl(top) = &module.expr(module.top_level.unwrap()).kind else {
            panic!("top level is not a function");
        };
        let ExprKind::Block { children, .. } = &module.expr(top.body.unwrap()).kind else {
            panic!("top level body is not a block");
        };
        children.clone()
    }

    #[test]
    fn parses_arithmetic_with_precedence() {
        let (ctx, module) = parse("2 + 3 * 4");
        assert!(!ctx.has_error());

        let children = top_level_children(&module);
        assert_eq!(children.len(), 1);

        let ExprKind::Binary {
            op: BinaryOp::Add,
            rhs,
            ..
        } = module.expr(children[0]).kind
        else {
            panic!("expected + at the root");
        };
        assert!(matches!(
            module.expr(rhs).kind,
            ExprKind::Binary {
                op: BinaryOp::Mul,
                ..
            }
        ));
    }

    #[test]
    fn parses_function_declaration() {
        let (ctx, module) = parse("add : int(a : int, b : int) { a + b }");
        assert!(!ctx.has_error());
        assert_eq!(module.functions.len(), 1);

        let ExprKind::FuncDecl(decl) = &module.expr(module.functions[0]).kind else {
            panic!("expected a function declaration");
        };
        assert_eq!(decl.name.value(), "add");
        assert_eq!(decl.params.len(), 2);
        assert!(decl.body.is_some());
        assert_eq!(decl.linkage, Linkage::Internal);
    }

    #[test]
    fn parses_extern_function_without_body() {
        let (ctx, module) = parse("puts : int(s : @byte) extern");
        assert!(!ctx.has_error());

        let ExprKind::FuncDecl(decl) = &module.expr(module.functions[0]).kind else {
            panic!("expected a function declaration");
        };
        assert_eq!(decl.linkage, Linkage::Imported);
        assert!(decl.body.is_none());
    }

    #[test]
    fn parses_forceinline_attribute() {
        let (ctx, module) = parse("g : int() inline { 42 }");
        assert!(!ctx.has_error());

        let ExprKind::FuncDecl(decl) = &module.expr(module.functions[0]).kind else {
            panic!("expected a function declaration");
        };
        assert!(decl.forceinline);
    }

    #[test]
    fn parses_if_else_as_expression() {
        let (ctx, module) = parse("x : bool = true\nif x { 1 } else { 2 }");
        assert!(!ctx.has_error());

        let children = top_level_children(&module);
        assert!(matches!(
            module.expr(children[1]).kind,
            ExprKind::If {
                else_branch: Some(_),
                ..
            }
        ));
    }

    #[test]
    fn parses_pointer_and_array_types() {
        let (ctx, module) = parse("buf : byte[16]\np : @int");
        assert!(!ctx.has_error());

        let children = top_level_children(&module);
        let ExprKind::VarDecl(buf) = &module.expr(children[0]).kind else {
            panic!();
        };
        assert!(buf.ty.is_array());

        let ExprKind::VarDecl(p) = &module.expr(children[1]).kind else {
            panic!();
        };
        assert!(p.ty.is_pointer());
    }

    #[test]
    fn compound_assignment_parses_into_rewritable_node() {
        let (ctx, module) = parse("x :: 1\nx += 2");
        assert!(!ctx.has_error());

        let children = top_level_children(&module);
        assert!(matches!(
            module.expr(children[1]).kind,
            ExprKind::CompoundAssignment {
                op: BinaryOp::Add,
                ..
            }
        ));
    }

    #[test]
    fn redeclaration_is_an_error_unless_overloading() {
        let (ctx, _) = parse("x :: 1\nx :: 2");
        assert!(ctx.has_error());

        let (ctx, module) = parse("f : int(a : int) { a }\nf : int(a : int, b : int) { a + b }");
        assert!(!ctx.has_error());
        assert_eq!(module.functions.len(), 2);
    }
}
