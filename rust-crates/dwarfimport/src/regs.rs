// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! DWARF register number mapping.

/// DWARF register numbers 0..=8 for 32 bit x86.
const X86_REGS: [&str; 9] = ["eax", "ecx", "edx", "ebx", "esp", "ebp", "esi", "edi", "eip"];

/// DWARF register numbers 0..=16 for x86-64 (System V psABI numbering).
const X86_64_REGS: [&str; 17] = [
    "rax", "rdx", "rcx", "rbx", "rsi", "rdi", "rbp", "rsp", "r8", "r9", "r10", "r11", "r12",
    "r13", "r14", "r15", "rip",
];

/// CPU architecture whose register file location expressions refer to.
#[non_exhaustive]
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Arch {
    /// 32 bit x86.
    #[default]
    X86,
    /// `x86_64` aka `amd64`.
    X86_64,
}

impl Arch {
    /// Maps a DWARF register number to the canonical register name.
    ///
    /// Only general purpose registers and the program counter are mapped.
    pub fn register_name(self, reg: u16) -> Option<&'static str> {
        let table: &[&str] = match self {
            Arch::X86 => &X86_REGS,
            Arch::X86_64 => &X86_64_REGS,
        };

        table.get(usize::from(reg)).copied()
    }

    /// DWARF register number of the frame pointer.
    pub const fn frame_pointer(self) -> u16 {
        match self {
            Arch::X86 => 5,
            Arch::X86_64 => 6,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names() {
        assert_eq!(Arch::X86.register_name(0), Some("eax"));
        assert_eq!(Arch::X86.register_name(5), Some("ebp"));
        assert_eq!(Arch::X86.register_name(8), Some("eip"));
        assert_eq!(Arch::X86.register_name(9), None);
        assert_eq!(Arch::X86_64.register_name(6), Some("rbp"));
        assert_eq!(Arch::X86_64.register_name(16), Some("rip"));
    }

    #[test]
    fn frame_pointer_is_named() {
        for arch in [Arch::X86, Arch::X86_64] {
            let name = arch.register_name(arch.frame_pointer()).unwrap();
            assert!(name.ends_with("bp"));
        }
    }
}
