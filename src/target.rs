//! Description of the machine the compiler is targeting. The semantic
//! analyzer needs type sizes and alignments; the backend additionally needs
//! the register file and calling convention (see `backend::x86_64`).

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallingConvention {
    MsWin,
    Linux,
}

#[derive(Debug, Clone, Copy)]
pub struct Target {
    pub call_convention: CallingConvention,

    pub size_of_pointer: usize,
    pub align_of_pointer: usize,

    /* Sable builtin types */
    pub size_of_bool: usize,
    pub size_of_byte: usize,
    pub size_of_int: usize,

    /* C ABI types */
    pub ffi_size_of_char: usize,
    pub ffi_size_of_short: usize,
    pub ffi_size_of_int: usize,
    pub ffi_size_of_long: usize,
    pub ffi_size_of_long_long: usize,
    pub ffi_char_is_signed: bool,
}

impl Target {
    pub fn x86_64(call_convention: CallingConvention) -> Self {
        Self {
            call_convention,
            size_of_pointer: 8,
            align_of_pointer: 8,
            size_of_bool: 1,
            size_of_byte: 1,
            size_of_int: 8,
            ffi_size_of_char: 1,
            ffi_size_of_short: 2,
            ffi_size_of_int: 4,
            // LLP64 on windows, LP64 everywhere else
            ffi_size_of_long: match call_convention {
                CallingConvention::MsWin => 4,
                CallingConvention::Linux => 8,
            },
            ffi_size_of_long_long: 8,
            ffi_char_is_signed: true,
        }
    }
}
