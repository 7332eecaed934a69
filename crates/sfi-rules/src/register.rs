// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! x86 general-purpose registers
//!
//! Registers are identified by their 64-bit family (`rax`, `r15`, ...) and the
//! width of the alias being used (`eax` is the 32-bit alias of `rax`). The
//! sandboxing rules only care about these two properties, so every register
//! name the disassembler can print is parsed into that pair.

use std::fmt;

/// 64-bit register family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Gpr {
    Rax,
    Rcx,
    Rdx,
    Rbx,
    Rsp,
    Rbp,
    Rsi,
    Rdi,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
    /// Instruction pointer, only ever seen as a memory base
    Rip,
}

/// Width of a register alias
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Width {
    /// `al`, `sil`, `r8b`
    Byte,
    /// `ah`, `ch`, `dh`, `bh`
    HighByte,
    /// `ax`, `r8w`
    Word,
    /// `eax`, `r8d`
    Dword,
    /// `rax`, `r8`
    Qword,
}

/// A general-purpose register alias
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Register {
    pub family: Gpr,
    pub width: Width,
}

const LEGACY: [(Gpr, [&str; 4]); 8] = [
    (Gpr::Rax, ["rax", "eax", "ax", "al"]),
    (Gpr::Rcx, ["rcx", "ecx", "cx", "cl"]),
    (Gpr::Rdx, ["rdx", "edx", "dx", "dl"]),
    (Gpr::Rbx, ["rbx", "ebx", "bx", "bl"]),
    (Gpr::Rsp, ["rsp", "esp", "sp", "spl"]),
    (Gpr::Rbp, ["rbp", "ebp", "bp", "bpl"]),
    (Gpr::Rsi, ["rsi", "esi", "si", "sil"]),
    (Gpr::Rdi, ["rdi", "edi", "di", "dil"]),
];

const EXTENDED: [Gpr; 8] = [
    Gpr::R8,
    Gpr::R9,
    Gpr::R10,
    Gpr::R11,
    Gpr::R12,
    Gpr::R13,
    Gpr::R14,
    Gpr::R15,
];

impl Gpr {
    /// Name of the 64-bit register
    pub fn name(self) -> &'static str {
        self.alias(Width::Qword)
    }

    /// Name of the alias with the given width
    pub fn alias(self, width: Width) -> &'static str {
        let width_index = match width {
            Width::Qword => 0,
            Width::Dword => 1,
            Width::Word => 2,
            Width::Byte | Width::HighByte => 3,
        };
        if self == Gpr::Rip {
            return if width == Width::Qword { "rip" } else { "eip" };
        }
        if width == Width::HighByte {
            match self {
                Gpr::Rax => return "ah",
                Gpr::Rcx => return "ch",
                Gpr::Rdx => return "dh",
                Gpr::Rbx => return "bh",
                _ => {}
            }
        }
        if let Some((_, names)) = LEGACY.iter().find(|(gpr, _)| *gpr == self) {
            return names[width_index];
        }
        const EXTENDED_NAMES: [[&str; 4]; 8] = [
            ["r8", "r8d", "r8w", "r8b"],
            ["r9", "r9d", "r9w", "r9b"],
            ["r10", "r10d", "r10w", "r10b"],
            ["r11", "r11d", "r11w", "r11b"],
            ["r12", "r12d", "r12w", "r12b"],
            ["r13", "r13d", "r13w", "r13b"],
            ["r14", "r14d", "r14w", "r14b"],
            ["r15", "r15d", "r15w", "r15b"],
        ];
        let index = EXTENDED
            .iter()
            .position(|gpr| *gpr == self)
            .unwrap_or_default();
        EXTENDED_NAMES[index][width_index]
    }

    /// Registers whose 64-bit value is an address inside the sandbox at all times
    pub fn is_sandbox_pointer(self) -> bool {
        matches!(self, Gpr::Rsp | Gpr::Rbp | Gpr::R15)
    }
}

impl Register {
    pub const fn new(family: Gpr, width: Width) -> Self {
        Self { family, width }
    }

    pub const fn qword(family: Gpr) -> Self {
        Self::new(family, Width::Qword)
    }

    pub const fn dword(family: Gpr) -> Self {
        Self::new(family, Width::Dword)
    }

    /// Parse a register name as printed by the disassembler
    ///
    /// Returns `None` for anything that is not a general-purpose register
    /// (vector, x87, segment, control or debug registers).
    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.trim().to_ascii_lowercase();
        match name.as_str() {
            "rip" => return Some(Self::qword(Gpr::Rip)),
            "eip" => return Some(Self::dword(Gpr::Rip)),
            "ah" => return Some(Self::new(Gpr::Rax, Width::HighByte)),
            "ch" => return Some(Self::new(Gpr::Rcx, Width::HighByte)),
            "dh" => return Some(Self::new(Gpr::Rdx, Width::HighByte)),
            "bh" => return Some(Self::new(Gpr::Rbx, Width::HighByte)),
            _ => {}
        }

        const WIDTHS: [Width; 4] = [Width::Qword, Width::Dword, Width::Word, Width::Byte];
        for (family, names) in LEGACY {
            if let Some(index) = names.iter().position(|n| *n == name) {
                return Some(Self::new(family, WIDTHS[index]));
            }
        }

        let number = name.strip_prefix('r')?;
        let (digits, width) = match number.char_indices().last()? {
            (i, 'd') => (&number[..i], Width::Dword),
            (i, 'w') => (&number[..i], Width::Word),
            (i, 'b') | (i, 'l') => (&number[..i], Width::Byte),
            _ => (number, Width::Qword),
        };
        let index: usize = digits.parse().ok()?;
        let family = *EXTENDED.get(index.checked_sub(8)?)?;
        Some(Self::new(family, width))
    }

    /// True for the 32-bit alias of a register (`eax`, `r9d`)
    pub fn is_dword(&self) -> bool {
        self.width == Width::Dword
    }

    pub fn is_qword(&self) -> bool {
        self.width == Width::Qword
    }
}

impl fmt::Display for Gpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.name())
    }
}

impl fmt::Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.family.alias(self.width))
    }
}
