// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Decoder-independent instruction model
//!
//! The validator never looks at raw encodings. A decoder turns bytes into
//! [`DecodedInstruction`]s (address, length, disassembly text, plus the
//! operand shapes the sandboxing rules inspect) and everything downstream
//! works on this model. Operands are in Intel order: destination first.

use std::fmt;

use crate::register::{Gpr, Register};
use crate::x86::ClassifiedOpcode;

/// Memory operand `[base + index * scale + displacement]`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Memory {
    pub base: Option<Register>,
    pub index: Option<Register>,
    pub scale: u8,
    pub displacement: i64,
}

impl Memory {
    pub fn base(base: Register) -> Self {
        Self {
            base: Some(base),
            index: None,
            scale: 1,
            displacement: 0,
        }
    }

    pub fn base_index(base: Register, index: Register) -> Self {
        Self {
            base: Some(base),
            index: Some(index),
            scale: 1,
            displacement: 0,
        }
    }

    pub fn absolute(displacement: i64) -> Self {
        Self {
            base: None,
            index: None,
            scale: 1,
            displacement,
        }
    }

    pub fn with_displacement(mut self, displacement: i64) -> Self {
        self.displacement = displacement;
        self
    }
}

/// Instruction operand
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operand {
    /// General-purpose register
    Register(Register),
    /// Immediate value; for relative branches, the displacement from the end
    /// of the instruction
    Immediate(i64),
    /// Memory reference
    Memory(Memory),
    /// Segment, control or debug register (by name)
    SystemRegister(String),
    /// Anything else the rules do not inspect (vector registers, x87 stack, ...)
    Other,
}

/// Instruction prefixes the sandboxing rules care about
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Prefixes {
    pub lock: bool,
    /// Any of `rep`, `repe`, `repne`
    pub rep: bool,
    /// `fs:` or `gs:` segment override
    pub segment_override: bool,
}

/// A decoded instruction with its location information
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedInstruction {
    /// Offset from the start of the chunk (in bytes)
    pub address: usize,
    /// Encoded length in bytes (always at least 1)
    pub length: usize,
    /// Human-readable disassembly, used only for diagnostics
    pub disassembly: String,
    /// Lowercase mnemonic without prefixes (e.g. "mov", "jz")
    pub mnemonic: String,
    pub operands: Vec<Operand>,
    pub prefixes: Prefixes,
}

impl DecodedInstruction {
    /// Create an instruction with no operands and no prefixes
    ///
    /// The disassembly text defaults to the mnemonic.
    pub fn new(address: usize, length: usize, mnemonic: &str) -> Self {
        Self {
            address,
            length,
            disassembly: mnemonic.to_string(),
            mnemonic: mnemonic.to_ascii_lowercase(),
            operands: Vec::new(),
            prefixes: Prefixes::default(),
        }
    }

    pub fn with_operands(mut self, operands: impl IntoIterator<Item = Operand>) -> Self {
        self.operands = operands.into_iter().collect();
        self
    }

    pub fn with_prefixes(mut self, prefixes: Prefixes) -> Self {
        self.prefixes = prefixes;
        self
    }

    pub fn with_disassembly(mut self, disassembly: impl Into<String>) -> Self {
        self.disassembly = disassembly.into();
        self
    }

    /// Offset of the first byte after this instruction
    pub fn end(&self) -> usize {
        self.address + self.length
    }

    /// Opcode classification, `None` for mnemonics missing from the table
    pub fn classify(&self) -> Option<&'static ClassifiedOpcode> {
        ClassifiedOpcode::from_mnemonic(&self.mnemonic)
    }

    /// Destination of a direct (relative) branch
    ///
    /// The result is signed: a backward branch near the start of the chunk
    /// may point before offset 0.
    pub fn branch_target(&self) -> Option<i64> {
        if !self.classify().is_some_and(|c| c.is_branch()) {
            return None;
        }
        match self.operands.as_slice() {
            [Operand::Immediate(displacement)] => {
                Some(self.end() as i64 + displacement)
            }
            _ => None,
        }
    }

    /// The single register operand of an indirect `jmp`/`call`, if any
    pub fn indirect_target(&self) -> Option<Register> {
        if !self.classify().is_some_and(|c| c.is_branch()) {
            return None;
        }
        match self.operands.as_slice() {
            [Operand::Register(register)] => Some(*register),
            _ => None,
        }
    }

    pub fn operand(&self, index: usize) -> Option<&Operand> {
        self.operands.get(index)
    }

    pub fn register_operand(&self, index: usize) -> Option<Register> {
        match self.operands.get(index) {
            Some(Operand::Register(register)) => Some(*register),
            _ => None,
        }
    }

    pub fn immediate_operand(&self, index: usize) -> Option<i64> {
        match self.operands.get(index) {
            Some(Operand::Immediate(value)) => Some(*value),
            _ => None,
        }
    }

    /// All memory operands
    pub fn memory_operands(&self) -> impl Iterator<Item = &Memory> {
        self.operands.iter().filter_map(|op| match op {
            Operand::Memory(memory) => Some(memory),
            _ => None,
        })
    }

    /// True if `self` is exactly `mnemonic dst, src` over two registers
    pub fn is_register_pair(&self, mnemonic: &str, dst: Register, src: Register) -> bool {
        self.mnemonic == mnemonic
            && self.operands.len() == 2
            && self.register_operand(0) == Some(dst)
            && self.register_operand(1) == Some(src)
    }

    /// True if this instruction touches any alias of `family` as an operand
    pub fn mentions(&self, family: Gpr) -> bool {
        self.operands.iter().any(|op| match op {
            Operand::Register(register) => register.family == family,
            Operand::Memory(memory) => {
                memory.base.is_some_and(|r| r.family == family)
                    || memory.index.is_some_and(|r| r.family == family)
            }
            _ => false,
        })
    }
}

impl fmt::Display for DecodedInstruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}: {}", self.address, self.disassembly)
    }
}
