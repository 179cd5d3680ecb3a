//! Machine IR: the target-shaped form of a function after instruction
//! selection. Each MIR function is either an imported symbol or a body of
//! rendered machine instructions destined for `.text`.

use crate::{backend::x86_64::MInst, frontend::intern::InternedSymbol};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Linkage {
    Local,
    Exported,
    Imported,
}

#[derive(Debug)]
pub struct MFunction {
    pub name: InternedSymbol,
    pub linkage: Linkage,
    pub insts: Vec<MInst>,
    /// Bytes of stack frame used by the function's value slots
    pub frame_size: usize,
}

impl MFunction {
    pub fn is_imported(&self) -> bool {
        self.linkage == Linkage::Imported
    }
}
