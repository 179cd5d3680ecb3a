//! Generic object file construction: the three standard sections plus a
//! flat symbol table built from IR globals and MIR functions. The byte-level
//! instruction encoder is a separate collaborator; until it runs, function
//! symbols carry their offsets into an empty `.text`.

use crate::backend::{
    ir::{CodegenContext, InstData},
    mir::MFunction,
};

#[derive(Debug, Clone)]
pub struct Section {
    pub name: &'static str,
    pub contents: Vec<u8>,
    /// `.bss` carries no contents, only a size
    pub uninitialized_size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolKind {
    Function,
    Object,
    External,
}

#[derive(Debug, Clone)]
pub struct Symbol {
    pub kind: SymbolKind,
    pub name: String,
    /// Empty for external symbols
    pub section_name: &'static str,
    pub byte_offset: usize,
}

#[derive(Debug, Default)]
pub struct GenericObject {
    pub sections: Vec<Section>,
    pub symbols: Vec<Symbol>,
}

impl GenericObject {
    pub fn section(&self, name: &str) -> Option<&Section> {
        self.sections.iter().find(|s| s.name == name)
    }

    pub fn symbol(&self, name: &str) -> Option<&Symbol> {
        self.symbols.iter().find(|s| s.name == name)
    }
}

fn static_bytes(ctx: &CodegenContext, var: &crate::backend::ir::StaticVariable) -> Option<Vec<u8>> {
    let init = var.init?;

    match &ctx.insts[init].data {
        InstData::LitInteger { value } => {
            let size = var.ty.size(&ctx.target).clamp(1, 8);
            Some(value.to_le_bytes()[..size].to_vec())
        }
        InstData::LitString { index } => {
            let mut bytes = ctx.strings[*index].value().as_bytes().to_vec();
            bytes.push(0);
            Some(bytes)
        }
        _ => None,
    }
}

/// Builds the object scaffolding for the module: `.text`, `.data` and
/// `.bss` plus the symbol table
pub fn emit_mcode_gobj(ctx: &CodegenContext, mir: &[MFunction]) -> GenericObject {
    let mut out = GenericObject {
        sections: vec![
            Section {
                name: ".text",
                contents: Vec::new(),
                uninitialized_size: 0,
            },
            Section {
                name: ".data",
                contents: Vec::new(),
                uninitialized_size: 0,
            },
            Section {
                name: ".bss",
                contents: Vec::new(),
                uninitialized_size: 0,
            },
        ],
        symbols: Vec::new(),
    };

    /* Globals */

    for var in ctx.statics.iter() {
        match static_bytes(ctx, var) {
            Some(bytes) => {
                let data = out
                    .sections
                    .iter_mut()
                    .find(|s| s.name == ".data")
                    .unwrap();

                out.symbols.push(Symbol {
                    kind: SymbolKind::Object,
                    name: var.name.value().to_string(),
                    section_name: ".data",
                    byte_offset: data.contents.len(),
                });
                data.contents.extend(bytes);
            }
            None => {
                let bss = out.sections.iter_mut().find(|s| s.name == ".bss").unwrap();

                out.symbols.push(Symbol {
                    kind: SymbolKind::Object,
                    name: var.name.value().to_string(),
                    section_name: ".bss",
                    byte_offset: bss.uninitialized_size,
                });
                bss.uninitialized_size += var.ty.size(&ctx.target).max(1);
            }
        }
    }

    /* Functions */

    let text_len = out.section(".text").unwrap().contents.len();
    for func in mir {
        if func.is_imported() {
            out.symbols.push(Symbol {
                kind: SymbolKind::External,
                name: func.name.value().to_string(),
                section_name: "",
                byte_offset: 0,
            });
        } else {
            out.symbols.push(Symbol {
                kind: SymbolKind::Function,
                name: func.name.value().to_string(),
                section_name: ".text",
                byte_offset: text_len,
            });

            // TODO: run the instruction encoder and append the function's
            // bytes here
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::{AsmDialect, OutputFormat, ir::parse::parse_ir, x86_64},
        target::{CallingConvention, Target},
    };
    use indoc::indoc;

    #[test]
    fn object_has_standard_sections_and_symbols() {
        let mut ctx = CodegenContext::new(
            OutputFormat::X86_64Gas,
            AsmDialect::Intel,
            Target::x86_64(CallingConvention::Linux),
        );
        parse_ir(
            indoc! {r#"
                static @counter : int = lit_integer 9
                static @scratch : [byte 16]

                declare @puts(@byte) -> int c
                function @main() -> int global sable {
                bb0:
                    %0 = immediate int 0
                    return %0
                }
            "#},
            &mut ctx,
        )
        .unwrap();

        let mir = x86_64::lower_to_mir(&ctx);
        let obj = emit_mcode_gobj(&ctx, &mir);

        for name in [".text", ".data", ".bss"] {
            assert!(obj.section(name).is_some(), "missing section {name}");
        }

        let counter = obj.symbol("counter").unwrap();
        assert_eq!(counter.kind, SymbolKind::Object);
        assert_eq!(counter.section_name, ".data");
        assert_eq!(counter.byte_offset, 0);

        let scratch = obj.symbol("scratch").unwrap();
        assert_eq!(scratch.section_name, ".bss");

        let main = obj.symbol("main").unwrap();
        assert_eq!(main.kind, SymbolKind::Function);
        assert_eq!(main.section_name, ".text");

        let puts = obj.symbol("puts").unwrap();
        assert_eq!(puts.kind, SymbolKind::External);
        assert_eq!(puts.section_name, "");
    }

    #[test]
    fn integer_statics_are_encoded_little_endian() {
        let mut ctx = CodegenContext::new(
            OutputFormat::X86_64Gas,
            AsmDialect::Intel,
            Target::x86_64(CallingConvention::Linux),
        );
        parse_ir(
            indoc! {r#"
                static @value : int = lit_integer 258
                function @main() -> int global sable {
                bb0:
                    %0 = immediate int 0
                    return %0
                }
            "#},
            &mut ctx,
        )
        .unwrap();

        let mir = x86_64::lower_to_mir(&ctx);
        let obj = emit_mcode_gobj(&ctx, &mir);

        let data = obj.section(".data").unwrap();
        assert_eq!(&data.contents[..2], &[2, 1]);
    }
}
