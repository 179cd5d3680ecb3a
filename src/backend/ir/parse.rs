//! Reads the textual IR format back into a [`CodegenContext`]. Together with
//! `print` this defines the stable interchange format: print-then-parse
//! produces a structurally equal IR.

use std::{cell::OnceCell, rc::Rc, str::FromStr};

use crate::{
    backend::ir::{
        BinaryOpcode, BlockId, Callee, CodegenContext, FuncId, InstData, InstId, UnaryOpcode,
    },
    frontend::{ast::Intrinsic, intern::InternedSymbol},
    middle::ty::{align_to, CallConv, FfiKind, FuncParam, StructMember, StructType, Type, TypeKind},
};

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Ident(String),
    /// %N
    Value(usize),
    Num(u64),
    Str(String),
    At,
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Colon,
    Comma,
    Equals,
    Arrow,
    Ellipsis,
}

fn tokenize(source: &str) -> Result<Vec<Tok>, String> {
    let mut toks = Vec::new();
    let mut chars = source.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '/' => {
                chars.next();
                if chars.peek() == Some(&'/') {
                    for c in chars.by_ref() {
                        if c == '\n' {
                            break;
                        }
                    }
                } else {
                    return Err("unexpected '/'".into());
                }
            }
            c if c.is_alphabetic() || c == '_' => {
                let mut ident = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_alphanumeric() || c == '_' {
                        ident.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                toks.push(Tok::Ident(ident));
            }
            c if c.is_ascii_digit() => {
                let mut num = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_digit() {
                        num.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                toks.push(Tok::Num(num.parse().map_err(|_| "integer overflow")?));
            }
            '%' => {
                chars.next();
                let mut num = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_digit() {
                        num.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                if num.is_empty() {
                    return Err("expected a value number after '%'".into());
                }
                toks.push(Tok::Value(num.parse().map_err(|_| "value number overflow")?));
            }
            '"' => {
                chars.next();
                let mut value = String::new();
                loop {
                    match chars.next() {
                        None => return Err("unterminated string".into()),
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some('n') => value.push('\n'),
                            Some('t') => value.push('\t'),
                            Some('r') => value.push('\r'),
                            Some('0') => value.push('\0'),
                            Some('"') => value.push('"'),
                            Some('\\') => value.push('\\'),
                            Some(other) => value.push(other),
                            None => return Err("unterminated escape".into()),
                        },
                        Some(other) => value.push(other),
                    }
                }
                toks.push(Tok::Str(value));
            }
            '-' => {
                chars.next();
                if chars.next() != Some('>') {
                    return Err("expected '->'".into());
                }
                toks.push(Tok::Arrow);
            }
            '.' => {
                chars.next();
                if chars.next() != Some('.') || chars.next() != Some('.') {
                    return Err("expected '...'".into());
                }
                toks.push(Tok::Ellipsis);
            }
            '@' => {
                chars.next();
                toks.push(Tok::At);
            }
            '(' => {
                chars.next();
                toks.push(Tok::LParen);
            }
            ')' => {
                chars.next();
                toks.push(Tok::RParen);
            }
            '[' => {
                chars.next();
                toks.push(Tok::LBracket);
            }
            ']' => {
                chars.next();
                toks.push(Tok::RBracket);
            }
            '{' => {
                chars.next();
                toks.push(Tok::LBrace);
            }
            '}' => {
                chars.next();
                toks.push(Tok::RBrace);
            }
            ':' => {
                chars.next();
                toks.push(Tok::Colon);
            }
            ',' => {
                chars.next();
                toks.push(Tok::Comma);
            }
            '=' => {
                chars.next();
                toks.push(Tok::Equals);
            }
            other => return Err(format!("unexpected character {other:?}")),
        }
    }

    Ok(toks)
}

#[derive(Debug, Clone)]
enum PCallee {
    Name(String),
    Value(usize),
}

#[derive(Debug, Clone)]
enum PData {
    Immediate(Type, u64),
    Register(Type, u64),
    StaticRef(String),
    FuncRef(String),
    Copy(usize),
    Load(Type, usize),
    Store(usize, usize),
    Alloca(Type),
    Phi(Type, Vec<(usize, usize)>),
    Branch(usize),
    CondBranch(usize, usize, usize),
    Return(Option<usize>),
    Unreachable,
    Call {
        ty: Type,
        tail: bool,
        callee: PCallee,
        args: Vec<usize>,
    },
    Intrinsic(Type, Intrinsic, Vec<usize>),
    Unary(UnaryOpcode, Type, usize),
    Binary(BinaryOpcode, Type, usize, usize),
}

#[derive(Debug)]
struct PendingInst {
    label: usize,
    number: Option<usize>,
    data: PData,
}

#[derive(Debug)]
struct PendingFunction {
    func: FuncId,
    label_count: usize,
    insts: Vec<PendingInst>,
}

pub fn parse_ir(source: &str, ctx: &mut CodegenContext) -> Result<(), String> {
    let toks = tokenize(source)?;
    let mut parser = IrParser {
        toks,
        pos: 0,
        ctx,
        pending: Vec::new(),
    };

    while !parser.eof() {
        match parser.expect_ident()?.as_str() {
            "static" => parser.parse_static()?,
            "declare" => parser.parse_declare()?,
            "function" => parser.parse_function()?,
            other => return Err(format!("expected a top-level entity, found '{other}'")),
        }
    }

    let pending = std::mem::take(&mut parser.pending);
    for func in pending {
        parser.materialize(func)?;
    }

    Ok(())
}

struct IrParser<'a> {
    toks: Vec<Tok>,
    pos: usize,
    ctx: &'a mut CodegenContext,
    pending: Vec<PendingFunction>,
}

impl<'a> IrParser<'a> {
    fn eof(&self) -> bool {
        self.pos >= self.toks.len()
    }

    fn peek(&self) -> Option<&Tok> {
        self.toks.get(self.pos)
    }

    fn next(&mut self) -> Result<Tok, String> {
        let tok = self.toks.get(self.pos).cloned().ok_or("unexpected end of input")?;
        self.pos += 1;
        Ok(tok)
    }

    fn eat(&mut self, tok: &Tok) -> bool {
        if self.peek() == Some(tok) {
            self.pos += 1;
            return true;
        }
        false
    }

    fn expect(&mut self, tok: Tok) -> Result<(), String> {
        let found = self.next()?;
        if found != tok {
            return Err(format!("expected {tok:?}, found {found:?}"));
        }
        Ok(())
    }

    fn expect_ident(&mut self) -> Result<String, String> {
        match self.next()? {
            Tok::Ident(s) => Ok(s),
            other => Err(format!("expected an identifier, found {other:?}")),
        }
    }

    fn expect_num(&mut self) -> Result<u64, String> {
        match self.next()? {
            Tok::Num(n) => Ok(n),
            other => Err(format!("expected a number, found {other:?}")),
        }
    }

    fn expect_value(&mut self) -> Result<usize, String> {
        match self.next()? {
            Tok::Value(n) => Ok(n),
            other => Err(format!("expected a value reference, found {other:?}")),
        }
    }

    fn expect_global(&mut self) -> Result<String, String> {
        self.expect(Tok::At)?;
        self.expect_ident()
    }

    /// `bbN`
    fn expect_label(&mut self) -> Result<usize, String> {
        let ident = self.expect_ident()?;
        let Some(num) = ident.strip_prefix("bb") else {
            return Err(format!("expected a block label, found '{ident}'"));
        };
        num.parse().map_err(|_| format!("bad block label '{ident}'"))
    }

    /* Types */

    fn parse_type(&mut self) -> Result<Type, String> {
        match self.next()? {
            Tok::At => Ok(Type::pointer(self.parse_type()?)),

            Tok::LBracket => {
                let elem = self.parse_type()?;
                if self.eat(&Tok::RBracket) {
                    return Ok(Type::new(TypeKind::DynamicArray { elem }));
                }
                let dim = self.expect_num()? as usize;
                self.expect(Tok::RBracket)?;
                Ok(Type::array_of(elem, dim))
            }

            Tok::LBrace => {
                let mut members = Vec::new();
                let mut offset = 0usize;
                let mut max_align = 1usize;

                while self.peek() != Some(&Tok::RBrace) {
                    let ty = self.parse_type()?;

                    let align = ty.align(&self.ctx.target);
                    offset = align_to(offset, align);

                    let cell = OnceCell::new();
                    cell.set(offset).unwrap();
                    offset += ty.size(&self.ctx.target);
                    max_align = max_align.max(align);

                    members.push(StructMember {
                        name: InternedSymbol::new(&format!("f{}", members.len())),
                        ty,
                        byte_offset: cell,
                    });

                    if !self.eat(&Tok::Comma) {
                        break;
                    }
                }
                self.expect(Tok::RBrace)?;

                let layout = OnceCell::new();
                layout.set((align_to(offset, max_align), max_align)).unwrap();

                Ok(Type::new(TypeKind::Struct(Rc::new(StructType {
                    name: None,
                    members,
                    layout,
                }))))
            }

            Tok::Ident(name) => {
                let base = match name.as_str() {
                    "int" => Type::int(),
                    "uint" => Type::uint(),
                    "bool" => Type::bool(),
                    "byte" => Type::byte(),
                    "void" => Type::void(),
                    "unknown" => Type::unknown(),
                    _ => {
                        if let Ok(ffi) = FfiKind::from_str(&name) {
                            Type::new(TypeKind::Ffi(ffi))
                        } else if let Some(int) = parse_sized_integer(&name) {
                            int
                        } else {
                            return Err(format!("unknown type '{name}'"));
                        }
                    }
                };

                /* Function type suffix */

                if self.eat(&Tok::LParen) {
                    let mut params = Vec::new();
                    let mut variadic = false;

                    while self.peek() != Some(&Tok::RParen) {
                        if self.eat(&Tok::Ellipsis) {
                            variadic = true;
                            break;
                        }
                        let ty = self.parse_type()?;
                        params.push(FuncParam {
                            name: InternedSymbol::new(&format!("arg{}", params.len())),
                            ty,
                        });
                        if !self.eat(&Tok::Comma) {
                            break;
                        }
                    }
                    self.expect(Tok::RParen)?;

                    return Ok(Type::function(params, base, CallConv::Sable, variadic));
                }

                Ok(base)
            }

            other => Err(format!("expected a type, found {other:?}")),
        }
    }

    /* Top level entities */

    fn parse_static(&mut self) -> Result<(), String> {
        let name = self.expect_global()?;
        self.expect(Tok::Colon)?;
        let ty = self.parse_type()?;

        let var = self.ctx.create_static(InternedSymbol::new(&name), ty.clone());

        if self.eat(&Tok::Equals) {
            let init = match self.expect_ident()?.as_str() {
                "lit_integer" => {
                    let value = self.expect_num()?;
                    self.ctx.literal_integer(ty, value)
                }
                "lit_string" => {
                    let Tok::Str(value) = self.next()? else {
                        return Err("expected a string literal".into());
                    };
                    let index = self.ctx.intern_string(InternedSymbol::new(&value));
                    self.ctx.literal_string(ty, index)
                }
                other => return Err(format!("invalid static initializer '{other}'")),
            };
            self.ctx.statics[var].init = Some(init);
        }

        Ok(())
    }

    fn parse_call_conv(&mut self) -> Result<CallConv, String> {
        match self.expect_ident()?.as_str() {
            "sable" => Ok(CallConv::Sable),
            "c" => Ok(CallConv::C),
            other => Err(format!("unknown calling convention '{other}'")),
        }
    }

    fn parse_declare(&mut self) -> Result<(), String> {
        let name = self.expect_global()?;

        self.expect(Tok::LParen)?;
        let mut params = Vec::new();
        let mut variadic = false;
        while self.peek() != Some(&Tok::RParen) {
            if self.eat(&Tok::Ellipsis) {
                variadic = true;
                break;
            }
            let ty = self.parse_type()?;
            params.push(FuncParam {
                name: InternedSymbol::new(&format!("arg{}", params.len())),
                ty,
            });
            if !self.eat(&Tok::Comma) {
                break;
            }
        }
        self.expect(Tok::RParen)?;
        self.expect(Tok::Arrow)?;
        let ret = self.parse_type()?;
        let call_conv = self.parse_call_conv()?;

        let ty = Type::function(params, ret, call_conv, variadic);
        let func = self.ctx.create_function(InternedSymbol::new(&name), ty);
        self.ctx.functions[func].is_extern = true;
        self.ctx.functions[func].call_conv = call_conv;

        Ok(())
    }

    fn parse_function(&mut self) -> Result<(), String> {
        let name = self.expect_global()?;

        /* Parameters */

        self.expect(Tok::LParen)?;
        let mut params = Vec::new();
        let mut variadic = false;
        while self.peek() != Some(&Tok::RParen) {
            if self.eat(&Tok::Ellipsis) {
                variadic = true;
                break;
            }
            let number = self.expect_value()?;
            if number != params.len() {
                return Err(format!("parameter %{number} out of order"));
            }
            self.expect(Tok::Colon)?;
            let ty = self.parse_type()?;
            params.push(FuncParam {
                name: InternedSymbol::new(&format!("arg{number}")),
                ty,
            });
            if !self.eat(&Tok::Comma) {
                break;
            }
        }
        self.expect(Tok::RParen)?;
        self.expect(Tok::Arrow)?;
        let ret = self.parse_type()?;

        /* Attributes and calling convention */

        let mut attr_global = false;
        let mut attr_forceinline = false;
        let mut call_conv = CallConv::Sable;

        loop {
            match self.peek() {
                Some(Tok::Ident(s)) if s == "global" => {
                    attr_global = true;
                    self.pos += 1;
                }
                Some(Tok::Ident(s)) if s == "forceinline" => {
                    attr_forceinline = true;
                    self.pos += 1;
                }
                Some(Tok::Ident(s)) if s == "sable" || s == "c" => {
                    call_conv = if s == "c" { CallConv::C } else { CallConv::Sable };
                    self.pos += 1;
                }
                _ => break,
            }
        }

        let ty = Type::function(params, ret, call_conv, variadic);
        let func = self.ctx.create_function(InternedSymbol::new(&name), ty);
        self.ctx.functions[func].attr_global = attr_global;
        self.ctx.functions[func].attr_forceinline = attr_forceinline;
        self.ctx.functions[func].call_conv = call_conv;

        /* Body */

        self.expect(Tok::LBrace)?;

        let mut insts = Vec::new();
        let mut label = 0usize;
        let mut label_count = 0usize;
        let mut seen_label = false;

        loop {
            if self.eat(&Tok::RBrace) {
                break;
            }

            // Block labels are `bbN :`
            if let (Some(Tok::Ident(ident)), Some(Tok::Colon)) =
                (self.peek(), self.toks.get(self.pos + 1))
            {
                if let Some(num) = ident.strip_prefix("bb") {
                    if let Ok(num) = num.parse::<usize>() {
                        if num != label_count {
                            return Err(format!("block label bb{num} out of order"));
                        }
                        label = num;
                        label_count += 1;
                        seen_label = true;
                        self.pos += 2;
                        continue;
                    }
                }
            }

            if !seen_label {
                return Err("instruction before the first block label".into());
            }

            insts.push(self.parse_inst(label)?);
        }

        self.pending.push(PendingFunction {
            func,
            label_count,
            insts,
        });

        Ok(())
    }

    /* Instructions */

    fn parse_inst(&mut self, label: usize) -> Result<PendingInst, String> {
        /* Value-producing instructions start with `%N =` */

        let number = match self.peek() {
            Some(Tok::Value(n)) => {
                let n = *n;
                self.pos += 1;
                self.expect(Tok::Equals)?;
                Some(n)
            }
            _ => None,
        };

        let mut opcode = self.expect_ident()?;
        let mut tail = false;
        if opcode == "tail" {
            tail = true;
            opcode = self.expect_ident()?;
        }

        let data = match opcode.as_str() {
            "immediate" => {
                let ty = self.parse_type()?;
                PData::Immediate(ty, self.expect_num()?)
            }
            "register" => {
                let ty = self.parse_type()?;
                PData::Register(ty, self.expect_num()?)
            }
            "static_ref" => PData::StaticRef(self.expect_global()?),
            "func_ref" => PData::FuncRef(self.expect_global()?),
            "copy" => PData::Copy(self.expect_value()?),
            "load" => {
                let ty = self.parse_type()?;
                PData::Load(ty, self.expect_value()?)
            }
            "store" => {
                let value = self.expect_value()?;
                self.expect(Tok::Arrow)?;
                PData::Store(value, self.expect_value()?)
            }
            "alloca" => PData::Alloca(self.parse_type()?),
            "phi" => {
                let ty = self.parse_type()?;
                let mut args = Vec::new();
                while self.eat(&Tok::LBracket) {
                    let block = self.expect_label()?;
                    let value = self.expect_value()?;
                    self.expect(Tok::RBracket)?;
                    args.push((block, value));
                    if !self.eat(&Tok::Comma) {
                        break;
                    }
                }
                PData::Phi(ty, args)
            }
            "branch" => PData::Branch(self.expect_label()?),
            "branch_conditional" => {
                let condition = self.expect_value()?;
                let then_block = self.expect_label()?;
                let else_block = self.expect_label()?;
                PData::CondBranch(condition, then_block, else_block)
            }
            "return" => {
                let value = match self.peek() {
                    Some(Tok::Value(n)) => {
                        let n = *n;
                        self.pos += 1;
                        Some(n)
                    }
                    _ => None,
                };
                PData::Return(value)
            }
            "unreachable" => PData::Unreachable,
            "call" => {
                let ty = self.parse_type()?;
                let callee = match self.next()? {
                    Tok::At => PCallee::Name(self.expect_ident()?),
                    Tok::Value(n) => PCallee::Value(n),
                    other => return Err(format!("expected a callee, found {other:?}")),
                };
                self.expect(Tok::LParen)?;
                let mut args = Vec::new();
                while self.peek() != Some(&Tok::RParen) {
                    args.push(self.expect_value()?);
                    if !self.eat(&Tok::Comma) {
                        break;
                    }
                }
                self.expect(Tok::RParen)?;
                PData::Call {
                    ty,
                    tail,
                    callee,
                    args,
                }
            }
            "intrinsic" => {
                let ty = self.parse_type()?;
                let name = self.expect_ident()?;
                let intrinsic = name
                    .parse::<Intrinsic>()
                    .map_err(|_| format!("unknown intrinsic '{name}'"))?;
                self.expect(Tok::LParen)?;
                let mut args = Vec::new();
                while self.peek() != Some(&Tok::RParen) {
                    args.push(self.expect_value()?);
                    if !self.eat(&Tok::Comma) {
                        break;
                    }
                }
                self.expect(Tok::RParen)?;
                PData::Intrinsic(ty, intrinsic, args)
            }
            "not" | "zero_extend" | "sign_extend" | "truncate" | "bitcast" => {
                let op = match opcode.as_str() {
                    "not" => UnaryOpcode::Not,
                    "zero_extend" => UnaryOpcode::ZeroExtend,
                    "sign_extend" => UnaryOpcode::SignExtend,
                    "truncate" => UnaryOpcode::Truncate,
                    "bitcast" => UnaryOpcode::Bitcast,
                    _ => unreachable!(),
                };
                let ty = self.parse_type()?;
                PData::Unary(op, ty, self.expect_value()?)
            }
            "add" | "sub" | "mul" | "div" | "mod" | "shl" | "sar" | "shr" | "and" | "or"
            | "lt" | "le" | "gt" | "ge" | "eq" | "ne" => {
                let op = match opcode.as_str() {
                    "add" => BinaryOpcode::Add,
                    "sub" => BinaryOpcode::Sub,
                    "mul" => BinaryOpcode::Mul,
                    "div" => BinaryOpcode::Div,
                    "mod" => BinaryOpcode::Mod,
                    "shl" => BinaryOpcode::Shl,
                    "sar" => BinaryOpcode::Sar,
                    "shr" => BinaryOpcode::Shr,
                    "and" => BinaryOpcode::And,
                    "or" => BinaryOpcode::Or,
                    "lt" => BinaryOpcode::Lt,
                    "le" => BinaryOpcode::Le,
                    "gt" => BinaryOpcode::Gt,
                    "ge" => BinaryOpcode::Ge,
                    "eq" => BinaryOpcode::Eq,
                    "ne" => BinaryOpcode::Ne,
                    _ => unreachable!(),
                };
                let ty = self.parse_type()?;
                let lhs = self.expect_value()?;
                self.expect(Tok::Comma)?;
                let rhs = self.expect_value()?;
                PData::Binary(op, ty, lhs, rhs)
            }
            other => return Err(format!("unknown opcode '{other}'")),
        };

        Ok(PendingInst {
            label,
            number,
            data,
        })
    }

    /* Materialization */

    fn materialize(&mut self, pending: PendingFunction) -> Result<(), String> {
        let func = pending.func;

        /* Blocks: bb0 is the entry created with the function */

        let mut labels: Vec<BlockId> = vec![self.ctx.functions[func].blocks[0]];
        for _ in 1..pending.label_count {
            let block = self.ctx.block_create();
            self.ctx.blocks[block].function = Some(func);
            self.ctx.functions[func].blocks.push(block);
            labels.push(block);
        }

        /* Value table: parameters first, then shells in order */

        let mut values: Vec<InstId> = self.ctx.functions[func].parameters.clone();
        let mut shells = Vec::with_capacity(pending.insts.len());

        for inst in &pending.insts {
            let shell = self.ctx.insts.push(super::Inst {
                data: InstData::Unreachable,
                ty: Type::void(),
                block: None,
                users: Default::default(),
            });

            if let Some(number) = inst.number {
                if number != values.len() {
                    return Err(format!("value %{number} out of order"));
                }
                values.push(shell);
            }

            let block = *labels
                .get(inst.label)
                .ok_or_else(|| format!("unknown block bb{}", inst.label))?;
            self.ctx.force_insert_into(block, shell);
            shells.push(shell);
        }

        /* Fill in instruction data, now that forward references resolve */

        let value = |n: usize| -> Result<InstId, String> {
            values
                .get(n)
                .copied()
                .ok_or_else(|| format!("reference to undefined value %{n}"))
        };
        let block = |n: usize| -> Result<BlockId, String> {
            labels
                .get(n)
                .copied()
                .ok_or_else(|| format!("reference to undefined block bb{n}"))
        };

        for (inst, shell) in pending.insts.iter().zip(shells) {
            let (data, ty) = match &inst.data {
                PData::Immediate(ty, v) => (InstData::Immediate { value: *v }, ty.clone()),
                PData::Register(ty, r) => (
                    InstData::Register {
                        register: *r as u32,
                    },
                    ty.clone(),
                ),
                PData::StaticRef(name) => {
                    let var = self
                        .ctx
                        .statics
                        .indices()
                        .find(|id| self.ctx.statics[*id].name.value() == name)
                        .ok_or_else(|| format!("unknown static '@{name}'"))?;
                    let ty = Type::pointer(self.ctx.statics[var].ty.clone());
                    (InstData::StaticRef { var }, ty)
                }
                PData::FuncRef(name) => {
                    let target = self.find_function(name)?;
                    let ty = Type::pointer(self.ctx.functions[target].ty.clone());
                    (InstData::FuncRef { func: target }, ty)
                }
                PData::Copy(operand) => {
                    let operand = value(*operand)?;
                    let ty = self.ctx.insts[operand].ty.clone();
                    (InstData::Copy { operand }, ty)
                }
                PData::Load(ty, addr) => (InstData::Load { addr: value(*addr)? }, ty.clone()),
                PData::Store(v, addr) => (
                    InstData::Store {
                        value: value(*v)?,
                        addr: value(*addr)?,
                    },
                    Type::void(),
                ),
                PData::Alloca(allocated) => (
                    InstData::Alloca {
                        allocated: allocated.clone(),
                    },
                    Type::pointer(allocated.clone()),
                ),
                PData::Phi(ty, args) => {
                    let args = args
                        .iter()
                        .map(|(b, v)| {
                            Ok(super::PhiArg {
                                block: block(*b)?,
                                value: value(*v)?,
                            })
                        })
                        .collect::<Result<Vec<_>, String>>()?;
                    (InstData::Phi { args }, ty.clone())
                }
                PData::Branch(target) => (
                    InstData::Branch {
                        target: block(*target)?,
                    },
                    Type::void(),
                ),
                PData::CondBranch(cond, then_block, else_block) => (
                    InstData::CondBranch {
                        condition: value(*cond)?,
                        then_block: block(*then_block)?,
                        else_block: block(*else_block)?,
                    },
                    Type::void(),
                ),
                PData::Return(v) => (
                    InstData::Return {
                        value: v.map(value).transpose()?,
                    },
                    Type::void(),
                ),
                PData::Unreachable => (InstData::Unreachable, Type::void()),
                PData::Call {
                    ty,
                    tail,
                    callee,
                    args,
                } => {
                    let callee = match callee {
                        PCallee::Name(name) => Callee::Direct(self.find_function(name)?),
                        PCallee::Value(n) => Callee::Indirect(value(*n)?),
                    };
                    let args = args
                        .iter()
                        .map(|a| value(*a))
                        .collect::<Result<Vec<_>, String>>()?;
                    (
                        InstData::Call {
                            callee,
                            args,
                            tail_call: *tail,
                        },
                        ty.clone(),
                    )
                }
                PData::Intrinsic(ty, intrinsic, args) => {
                    let args = args
                        .iter()
                        .map(|a| value(*a))
                        .collect::<Result<Vec<_>, String>>()?;
                    (
                        InstData::Intrinsic {
                            intrinsic: *intrinsic,
                            args,
                        },
                        ty.clone(),
                    )
                }
                PData::Unary(op, ty, operand) => (
                    InstData::Unary {
                        op: *op,
                        operand: value(*operand)?,
                    },
                    ty.clone(),
                ),
                PData::Binary(op, ty, lhs, rhs) => (
                    InstData::Binary {
                        op: *op,
                        lhs: value(*lhs)?,
                        rhs: value(*rhs)?,
                    },
                    ty.clone(),
                ),
            };

            self.ctx.insts[shell].data = data;
            self.ctx.insts[shell].ty = ty;

            for operand in self.ctx.insts[shell].operands() {
                self.ctx.mark_used(operand, shell);
            }
        }

        Ok(())
    }

    fn find_function(&self, name: &str) -> Result<FuncId, String> {
        self.ctx
            .functions
            .indices()
            .find(|id| self.ctx.functions[*id].name.value() == name)
            .ok_or_else(|| format!("unknown function '@{name}'"))
    }
}

/// s24 / u8 style integer type names
fn parse_sized_integer(text: &str) -> Option<Type> {
    let (first, rest) = text.split_at(1);
    let signed = match first {
        "s" => true,
        "u" => false,
        _ => return None,
    };
    let bits = rest.parse::<usize>().ok()?;
    (bits > 0 && bits <= 64).then(|| Type::integer(bits, signed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::{AsmDialect, OutputFormat, ir::print::print_ir},
        target::{CallingConvention, Target},
    };
    use indoc::indoc;

    fn roundtrip(source: &str) -> String {
        let mut ctx = CodegenContext::new(
            OutputFormat::Ir,
            AsmDialect::Intel,
            Target::x86_64(CallingConvention::Linux),
        );
        parse_ir(source, &mut ctx).expect("parse failed");
        print_ir(&ctx)
    }

    #[test]
    fn print_then_parse_is_stable() {
        let source = indoc! {r#"
            static @counter : int = lit_integer 42
            static @greeting : [byte 6] = lit_string "hello"

            declare @puts(@byte) -> int c
            function @main() -> int global sable {
            bb0:
                %0 = immediate int 2
                %1 = immediate int 3
                %2 = add int %0, %1
                return %2
            }
        "#};

        let once = roundtrip(source);
        let twice = roundtrip(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn phis_and_branches_roundtrip() {
        let source = indoc! {r#"
            function @pick(%0 : bool) -> int sable {
            bb0:
                branch_conditional %0 bb1 bb2
            bb1:
                %1 = immediate int 1
                branch bb3
            bb2:
                %2 = immediate int 2
                branch bb3
            bb3:
                %3 = phi int [bb1 %1], [bb2 %2]
                return %3
            }
        "#};

        let once = roundtrip(source);
        let twice = roundtrip(&once);
        assert_eq!(once, twice);
        assert!(once.contains("phi int"));
    }

    #[test]
    fn parsed_ir_validates() {
        let source = indoc! {r#"
            function @f(%0 : int) -> int sable {
            bb0:
                %1 = immediate int 1
                %2 = add int %0, %1
                return %2
            }
        "#};

        let mut ctx = CodegenContext::new(
            OutputFormat::Ir,
            AsmDialect::Intel,
            Target::x86_64(CallingConvention::Linux),
        );
        parse_ir(source, &mut ctx).unwrap();
        assert!(crate::backend::ir::validate(&ctx).is_empty());
    }

    #[test]
    fn calls_and_tail_calls_roundtrip() {
        let source = indoc! {r#"
            function @f(%0 : int) -> int sable {
            bb0:
                %1 = tail call int @f(%0)
                return %1
            }
        "#};

        let once = roundtrip(source);
        assert!(once.contains("tail call int @f"));
        assert_eq!(once, roundtrip(&once));
    }
}
