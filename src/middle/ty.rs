//! The semantic type model. Types are cheap shared handles to an immutable
//! [`TypeKind`]; layout details that only semantic analysis can compute
//! (array dimensions, struct offsets, enumerator values) live in `OnceCell`s
//! that sema fills in exactly once.

use std::{cell::OnceCell, rc::Rc};

use crate::{
    frontend::{ast::ExprId, intern::InternedSymbol},
    target::Target,
};

/// Rounds `value` up to the next multiple of `align`
pub fn align_to(value: usize, align: usize) -> usize {
    value.div_ceil(align.max(1)) * align.max(1)
}

/// Thin shared handle to a type. Structural equality goes through
/// [`Type::equal`]; named structs and enums compare by identity.
#[derive(Clone)]
pub struct Type(Rc<TypeKind>);

#[derive(Debug)]
pub enum TypeKind {
    Builtin(BuiltinKind),
    /// Platform C-ABI integer types for FFI declarations
    Ffi(FfiKind),
    /// An unresolved type name; sema replaces these with the named declaration's type
    Named(InternedSymbol),
    /// @T
    Pointer(Type),
    /// &T. References never nest.
    Reference(Type),
    /// T[N]. The size expression is evaluated to a constant dimension by sema.
    Array {
        elem: Type,
        size: Option<ExprId>,
        dim: OnceCell<usize>,
    },
    /// A runtime-sized array: pointer + length + capacity
    DynamicArray { elem: Type },
    Struct(Rc<StructType>),
    Enum(Rc<EnumType>),
    Function(Rc<FuncType>),
    /// Arbitrary bit-width integer, e.g. s24 / u3
    Integer { bits: usize, signed: bool },
    /// Produced by an illegal operation whose type cannot be computed. If you
    /// find this in a type, an error has already been reported.
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuiltinKind {
    Bool,
    Byte,
    Int,
    UInt,
    Void,
    /// A type that has not been specified and must be inferred
    Unknown,
    /// Marker type of a name bound to multiple function declarations
    OverloadSet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString)]
pub enum FfiKind {
    #[strum(serialize = "__c_char")]
    CChar,
    #[strum(serialize = "__c_schar")]
    CSChar,
    #[strum(serialize = "__c_uchar")]
    CUChar,
    #[strum(serialize = "__c_short")]
    CShort,
    #[strum(serialize = "__c_ushort")]
    CUShort,
    #[strum(serialize = "__c_int")]
    CInt,
    #[strum(serialize = "__c_uint")]
    CUInt,
    #[strum(serialize = "__c_long")]
    CLong,
    #[strum(serialize = "__c_ulong")]
    CULong,
    #[strum(serialize = "__c_longlong")]
    CLongLong,
    #[strum(serialize = "__c_ulonglong")]
    CULongLong,
}

#[derive(Debug)]
pub struct StructMember {
    pub name: InternedSymbol,
    pub ty: Type,
    pub byte_offset: OnceCell<usize>,
}

#[derive(Debug)]
pub struct StructType {
    /// Anonymous structs have no name and compare structurally; named structs
    /// compare by identity
    pub name: Option<InternedSymbol>,
    pub members: Vec<StructMember>,
    /// (byte size, alignment), computed by sema
    pub layout: OnceCell<(usize, usize)>,
}

#[derive(Debug)]
pub struct Enumerator {
    pub name: InternedSymbol,
    /// Explicit initializer expression, if one was written
    pub init: Option<ExprId>,
    pub value: OnceCell<u64>,
}

#[derive(Debug)]
pub struct EnumType {
    pub name: InternedSymbol,
    pub underlying: Type,
    pub enumerators: Vec<Enumerator>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum CallConv {
    #[default]
    #[strum(serialize = "sable")]
    Sable,
    #[strum(serialize = "c")]
    C,
}

#[derive(Debug)]
pub struct FuncParam {
    pub name: InternedSymbol,
    pub ty: Type,
}

#[derive(Debug)]
pub struct FuncType {
    pub params: Vec<FuncParam>,
    pub ret: Type,
    pub call_conv: CallConv,
    pub variadic: bool,
}

impl Type {
    pub fn new(kind: TypeKind) -> Self {
        Self(Rc::new(kind))
    }

    pub fn kind(&self) -> &TypeKind {
        &self.0
    }

    /* Constructors */

    pub fn void() -> Self {
        Self::new(TypeKind::Builtin(BuiltinKind::Void))
    }

    pub fn bool() -> Self {
        Self::new(TypeKind::Builtin(BuiltinKind::Bool))
    }

    pub fn byte() -> Self {
        Self::new(TypeKind::Builtin(BuiltinKind::Byte))
    }

    pub fn int() -> Self {
        Self::new(TypeKind::Builtin(BuiltinKind::Int))
    }

    pub fn uint() -> Self {
        Self::new(TypeKind::Builtin(BuiltinKind::UInt))
    }

    pub fn unknown() -> Self {
        Self::new(TypeKind::Builtin(BuiltinKind::Unknown))
    }

    pub fn overload_set() -> Self {
        Self::new(TypeKind::Builtin(BuiltinKind::OverloadSet))
    }

    pub fn error() -> Self {
        Self::new(TypeKind::Error)
    }

    pub fn integer(bits: usize, signed: bool) -> Self {
        Self::new(TypeKind::Integer { bits, signed })
    }

    pub fn pointer(elem: Type) -> Self {
        Self::new(TypeKind::Pointer(elem))
    }

    pub fn reference(elem: Type) -> Self {
        assert!(
            !elem.is_reference(),
            "Double references are not permitted"
        );
        Self::new(TypeKind::Reference(elem))
    }

    /// An array type with an already-known dimension (string literals,
    /// compound literals)
    pub fn array_of(elem: Type, dim: usize) -> Self {
        let cell = OnceCell::new();
        cell.set(dim).unwrap();
        Self::new(TypeKind::Array {
            elem,
            size: None,
            dim: cell,
        })
    }

    pub fn function(params: Vec<FuncParam>, ret: Type, call_conv: CallConv, variadic: bool) -> Self {
        Self::new(TypeKind::Function(Rc::new(FuncType {
            params,
            ret,
            call_conv,
            variadic,
        })))
    }

    /* Classification */

    pub fn is_builtin(&self, kind: BuiltinKind) -> bool {
        matches!(self.kind(), TypeKind::Builtin(k) if *k == kind)
    }

    pub fn is_void(&self) -> bool {
        self.is_builtin(BuiltinKind::Void)
    }

    pub fn is_bool(&self) -> bool {
        self.is_builtin(BuiltinKind::Bool)
    }

    pub fn is_byte(&self) -> bool {
        self.is_builtin(BuiltinKind::Byte)
    }

    pub fn is_unknown(&self) -> bool {
        self.is_builtin(BuiltinKind::Unknown)
    }

    pub fn is_overload_set(&self) -> bool {
        self.is_builtin(BuiltinKind::OverloadSet)
    }

    pub fn is_error(&self) -> bool {
        matches!(self.kind(), TypeKind::Error)
    }

    pub fn is_pointer(&self) -> bool {
        matches!(self.kind(), TypeKind::Pointer(_))
    }

    pub fn is_reference(&self) -> bool {
        matches!(self.kind(), TypeKind::Reference(_))
    }

    pub fn is_array(&self) -> bool {
        matches!(self.kind(), TypeKind::Array { .. })
    }

    pub fn is_struct(&self) -> bool {
        matches!(self.kind(), TypeKind::Struct(_))
    }

    pub fn is_function(&self) -> bool {
        matches!(self.kind(), TypeKind::Function(_))
    }

    pub fn is_integer(&self, include_bool: bool) -> bool {
        match self.kind() {
            TypeKind::Builtin(BuiltinKind::Int | BuiltinKind::UInt | BuiltinKind::Byte) => true,
            TypeKind::Builtin(BuiltinKind::Bool) => include_bool,
            TypeKind::Ffi(_) | TypeKind::Integer { .. } | TypeKind::Enum(_) => true,
            _ => false,
        }
    }

    pub fn as_function(&self) -> Option<&Rc<FuncType>> {
        match self.kind() {
            TypeKind::Function(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_struct(&self) -> Option<&Rc<StructType>> {
        match self.kind() {
            TypeKind::Struct(s) => Some(s),
            _ => None,
        }
    }

    /// The width and signedness of an integer-like type
    pub fn integer_info(&self, target: &Target) -> Option<(usize, bool)> {
        match self.kind() {
            TypeKind::Builtin(BuiltinKind::Bool) => Some((1, false)),
            TypeKind::Builtin(BuiltinKind::Byte) => Some((target.size_of_byte * 8, false)),
            TypeKind::Builtin(BuiltinKind::Int) => Some((target.size_of_int * 8, true)),
            TypeKind::Builtin(BuiltinKind::UInt) => Some((target.size_of_int * 8, false)),
            TypeKind::Integer { bits, signed } => Some((*bits, *signed)),
            TypeKind::Enum(e) => e.underlying.integer_info(target),
            TypeKind::Ffi(kind) => {
                use FfiKind::*;

                let size = match kind {
                    CChar | CSChar | CUChar => target.ffi_size_of_char,
                    CShort | CUShort => target.ffi_size_of_short,
                    CInt | CUInt => target.ffi_size_of_int,
                    CLong | CULong => target.ffi_size_of_long,
                    CLongLong | CULongLong => target.ffi_size_of_long_long,
                };
                let signed = match kind {
                    CSChar | CShort | CInt | CLong | CLongLong => true,
                    CUChar | CUShort | CUInt | CULong | CULongLong => false,
                    CChar => target.ffi_char_is_signed,
                };

                Some((size * 8, signed))
            }
            _ => None,
        }
    }

    /* Structure */

    /// Element type of sequence-like types (and the underlying type of enums)
    pub fn elem(&self) -> Type {
        match self.kind() {
            TypeKind::Pointer(t) | TypeKind::Reference(t) => t.clone(),
            TypeKind::Array { elem, .. } | TypeKind::DynamicArray { elem } => elem.clone(),
            TypeKind::Enum(e) => e.underlying.clone(),
            _ => crate::diag::ice!("type {self} has no element type"),
        }
    }

    /// Removes at most one reference
    pub fn strip_references(&self) -> Type {
        match self.kind() {
            TypeKind::Reference(t) => {
                assert!(!t.is_reference(), "Double references are not permitted");
                t.clone()
            }
            _ => self.clone(),
        }
    }

    pub fn dimension(&self) -> usize {
        match self.kind() {
            TypeKind::Array { dim, .. } => *dim
                .get()
                .expect("dimension() requires the array size to have been evaluated"),
            _ => crate::diag::ice!("dimension() called on non-array type {self}"),
        }
    }

    /* Equality */

    pub fn equal(a: &Type, b: &Type) -> bool {
        if Rc::ptr_eq(&a.0, &b.0) {
            return true;
        }

        match (a.kind(), b.kind()) {
            (TypeKind::Builtin(ka), TypeKind::Builtin(kb)) => ka == kb,
            (TypeKind::Ffi(ka), TypeKind::Ffi(kb)) => ka == kb,

            // Unresolved names are never equal unless they are the same node
            (TypeKind::Named(_), TypeKind::Named(_)) => false,

            (TypeKind::Pointer(ea), TypeKind::Pointer(eb))
            | (TypeKind::Reference(ea), TypeKind::Reference(eb))
            | (TypeKind::DynamicArray { elem: ea }, TypeKind::DynamicArray { elem: eb }) => {
                Type::equal(ea, eb)
            }

            (
                TypeKind::Array {
                    elem: ea, dim: da, ..
                },
                TypeKind::Array {
                    elem: eb, dim: db, ..
                },
            ) => da.get() == db.get() && Type::equal(ea, eb),

            // Enums compare by identity (covered by the pointer check above)
            (TypeKind::Enum(_), TypeKind::Enum(_)) => false,

            (TypeKind::Struct(sa), TypeKind::Struct(sb)) => {
                // Named structs compare by identity; anonymous structs are
                // equal if their fields have the same types
                if sa.name.is_some() || sb.name.is_some() {
                    return false;
                }

                sa.members.len() == sb.members.len()
                    && sa
                        .members
                        .iter()
                        .zip(sb.members.iter())
                        .all(|(ma, mb)| Type::equal(&ma.ty, &mb.ty))
            }

            (TypeKind::Function(fa), TypeKind::Function(fb)) => {
                fa.params.len() == fb.params.len()
                    && fa.variadic == fb.variadic
                    && fa
                        .params
                        .iter()
                        .zip(fb.params.iter())
                        .all(|(pa, pb)| Type::equal(&pa.ty, &pb.ty))
                    && Type::equal(&fa.ret, &fb.ret)
            }

            (
                TypeKind::Integer {
                    bits: wa,
                    signed: sa,
                },
                TypeKind::Integer {
                    bits: wb,
                    signed: sb,
                },
            ) => wa == wb && sa == sb,

            _ => false,
        }
    }

    /* Layout */

    pub fn size(&self, target: &Target) -> usize {
        match self.kind() {
            TypeKind::Builtin(kind) => match kind {
                BuiltinKind::Bool => target.size_of_bool,
                BuiltinKind::Byte => target.size_of_byte,
                BuiltinKind::Int | BuiltinKind::UInt => target.size_of_int,
                BuiltinKind::Void | BuiltinKind::Unknown | BuiltinKind::OverloadSet => 0,
            },
            TypeKind::Ffi(_) => {
                let (bits, _) = self.integer_info(target).unwrap();
                bits / 8
            }
            TypeKind::Named(_) => 0,
            TypeKind::Function(_) => 0,
            TypeKind::Pointer(_) | TypeKind::Reference(_) => target.size_of_pointer,
            TypeKind::Array { elem, .. } => self.dimension() * elem.size(target),
            TypeKind::DynamicArray { .. } => target.size_of_pointer + 2 * target.size_of_int,
            TypeKind::Struct(s) => s.layout.get().map(|(size, _)| *size).unwrap_or(0),
            TypeKind::Enum(e) => e.underlying.size(target),
            TypeKind::Integer { bits, .. } => bits.div_ceil(8),
            TypeKind::Error => 0,
        }
    }

    pub fn align(&self, target: &Target) -> usize {
        match self.kind() {
            TypeKind::Builtin(kind) => match kind {
                BuiltinKind::Bool | BuiltinKind::Byte => 1,
                BuiltinKind::Int | BuiltinKind::UInt => target.size_of_int,
                // Alignment must not be 0, so use 1
                BuiltinKind::Void | BuiltinKind::Unknown | BuiltinKind::OverloadSet => 1,
            },
            TypeKind::Ffi(_) => self.size(target).max(1),
            TypeKind::Named(_) | TypeKind::Function(_) => 1,
            TypeKind::Pointer(_) | TypeKind::Reference(_) => target.align_of_pointer,
            TypeKind::Array { elem, .. } => elem.align(target),
            TypeKind::DynamicArray { .. } => target.align_of_pointer,
            TypeKind::Struct(s) => s.layout.get().map(|(_, align)| *align).unwrap_or(1),
            TypeKind::Enum(e) => e.underlying.align(target),
            TypeKind::Integer { bits, .. } => bits.div_ceil(8).next_power_of_two().min(8),
            TypeKind::Error => 1,
        }
    }
}

impl core::fmt::Debug for Type {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Type").field(&self.0).finish()
    }
}

impl core::fmt::Display for Type {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.kind() {
            TypeKind::Builtin(kind) => match kind {
                BuiltinKind::Bool => write!(f, "bool"),
                BuiltinKind::Byte => write!(f, "byte"),
                BuiltinKind::Int => write!(f, "int"),
                BuiltinKind::UInt => write!(f, "uint"),
                BuiltinKind::Void => write!(f, "void"),
                BuiltinKind::Unknown => write!(f, "unknown"),
                BuiltinKind::OverloadSet => write!(f, "<overload set>"),
            },
            TypeKind::Ffi(kind) => write!(f, "{kind}"),
            TypeKind::Named(name) => write!(f, "{name}"),
            TypeKind::Pointer(elem) => write!(f, "@{elem}"),
            TypeKind::Reference(elem) => write!(f, "&{elem}"),
            TypeKind::Array { elem, dim, .. } => match dim.get() {
                Some(n) => write!(f, "[{elem} {n}]"),
                None => write!(f, "[{elem} ?]"),
            },
            TypeKind::DynamicArray { elem } => write!(f, "[{elem}]"),
            TypeKind::Struct(s) => match s.name {
                Some(name) => write!(f, "struct {name}"),
                None => {
                    write!(f, "{{")?;
                    for (i, member) in s.members.iter().enumerate() {
                        if i != 0 {
                            write!(f, ", ")?;
                        }
                        write!(f, "{}", member.ty)?;
                    }
                    write!(f, "}}")
                }
            },
            TypeKind::Enum(e) => write!(f, "enum {}", e.name),
            TypeKind::Function(func) => {
                write!(f, "{}(", func.ret)?;
                for (i, param) in func.params.iter().enumerate() {
                    if i != 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", param.ty)?;
                }
                if func.variadic {
                    if !func.params.is_empty() {
                        write!(f, ", ")?;
                    }
                    write!(f, "...")?;
                }
                write!(f, ")")
            }
            TypeKind::Integer { bits, signed } => {
                write!(f, "{}{bits}", if *signed { "s" } else { "u" })
            }
            TypeKind::Error => write!(f, "<error>"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::CallingConvention;

    #[test]
    fn equality_is_reflexive_and_structural() {
        let a = Type::pointer(Type::int());
        let b = Type::pointer(Type::int());

        assert!(Type::equal(&a, &a));
        assert!(Type::equal(&a, &b));
        assert!(!Type::equal(&a, &Type::pointer(Type::byte())));
    }

    #[test]
    fn strip_references_is_idempotent() {
        let ty = Type::reference(Type::array_of(Type::byte(), 4));

        let once = ty.strip_references();
        let twice = once.strip_references();

        assert!(Type::equal(&once, &twice));
        assert!(once.is_array());
    }

    #[test]
    fn integer_types_compare_by_width_and_signedness() {
        assert!(Type::equal(&Type::integer(24, true), &Type::integer(24, true)));
        assert!(!Type::equal(&Type::integer(24, true), &Type::integer(24, false)));
        assert!(!Type::equal(&Type::integer(24, true), &Type::integer(32, true)));
    }

    #[test]
    fn named_structs_compare_by_identity() {
        let make = |name| {
            Type::new(TypeKind::Struct(Rc::new(StructType {
                name: Some(crate::frontend::intern::InternedSymbol::new(name)),
                members: vec![StructMember {
                    name: crate::frontend::intern::InternedSymbol::new("x"),
                    ty: Type::int(),
                    byte_offset: OnceCell::new(),
                }],
                layout: OnceCell::new(),
            })))
        };

        let a = make("vec");
        let b = make("vec");

        assert!(Type::equal(&a, &a));
        assert!(!Type::equal(&a, &b));
    }

    #[test]
    fn errored_type_has_degenerate_layout() {
        let target = Target::x86_64(CallingConvention::Linux);

        assert_eq!(Type::error().size(&target), 0);
        assert_eq!(Type::error().align(&target), 1);
    }

    #[test]
    fn array_layout_uses_dimension() {
        let target = Target::x86_64(CallingConvention::Linux);
        let ty = Type::array_of(Type::int(), 5);

        assert_eq!(ty.size(&target), 40);
        assert_eq!(ty.align(&target), 8);
    }
}
