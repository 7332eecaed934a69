// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! x86 instruction decoding
//!
//! Decodes raw bytes into [`DecodedInstruction`]s using the `yaxpeax-x86` crate.
//! Only the instruction shape the sandboxing rules inspect is kept: mnemonic,
//! operands in Intel order, and the `lock`/`rep`/segment-override prefixes.

use sfi_rules::{Bitness, DecodedInstruction, Memory, Operand, Prefixes, Register};
use yaxpeax_arch::{Decoder, U8Reader};
use yaxpeax_x86::{long_mode, protected_mode};

use crate::error::DecodeError;

/// Turns a chunk of bytes into an ordered instruction sequence
pub trait InstructionDecoder {
    /// Decode the whole chunk
    ///
    /// Fails at the first position that does not start a valid instruction.
    fn decode(
        &self,
        code: &[u8],
        bitness: Bitness,
    ) -> Result<Vec<DecodedInstruction>, DecodeError>;
}

/// Decoder backed by `yaxpeax-x86`
#[derive(Debug, Default, Clone, Copy)]
pub struct X86Decoder;

impl InstructionDecoder for X86Decoder {
    fn decode(
        &self,
        code: &[u8],
        bitness: Bitness,
    ) -> Result<Vec<DecodedInstruction>, DecodeError> {
        let mut instructions = Vec::new();
        let mut offset = 0;

        while offset < code.len() {
            let instruction = match bitness {
                Bitness::Bits64 => decode_long_mode(&code[offset..], offset)?,
                Bitness::Bits32 => decode_protected_mode(&code[offset..], offset)?,
            };
            offset = instruction.end();
            instructions.push(instruction);
        }

        Ok(instructions)
    }
}

/// Define a decoding function for one yaxpeax-x86 processor mode
///
/// The modes share the operand model; long mode adds its 64-bit immediates
/// and displacements as extra match arms.
macro_rules! decode_mode {
    ($name:ident, $mode:ident, { $($pattern:pat => $operand:expr),* $(,)? }) => {
        fn $name(bytes: &[u8], address: usize) -> Result<DecodedInstruction, DecodeError> {
            use $mode::Operand as O;

            let decoder = $mode::InstDecoder::default();
            let mut reader = U8Reader::new(bytes);
            let instruction =
                decoder
                    .decode(&mut reader)
                    .map_err(|e| DecodeError::InvalidInstruction {
                        offset: address,
                        message: e.to_string(),
                    })?;
            let length =
                <U8Reader<'_> as yaxpeax_arch::Reader<u64, u8>>::total_offset(&mut reader) as usize;

            let mut operands = Vec::new();
            for i in 0..instruction.operand_count() {
                let operand = match instruction.operand(i) {
                    O::Nothing => continue,
                    O::Register(reg) => register(reg.to_string()),
                    O::ImmediateI8(v) => Operand::Immediate(v as i64),
                    O::ImmediateU8(v) => Operand::Immediate(v as i64),
                    O::ImmediateI16(v) => Operand::Immediate(v as i64),
                    O::ImmediateU16(v) => Operand::Immediate(v as i64),
                    O::ImmediateI32(v) => Operand::Immediate(v as i64),
                    O::ImmediateU32(v) => Operand::Immediate(v as i64),
                    O::DisplacementU32(disp) => Operand::Memory(Memory::absolute(disp as i64)),
                    O::RegDeref(base) => memory(Some(base.to_string()), None, 1, 0),
                    O::RegDisp(base, disp) => memory(Some(base.to_string()), None, 1, disp),
                    O::RegScale(index, scale) => memory(None, Some(index.to_string()), scale, 0),
                    O::RegScaleDisp(index, scale, disp) => {
                        memory(None, Some(index.to_string()), scale, disp)
                    }
                    O::RegIndexBase(base, index) => {
                        memory(Some(base.to_string()), Some(index.to_string()), 1, 0)
                    }
                    O::RegIndexBaseDisp(base, index, disp) => {
                        memory(Some(base.to_string()), Some(index.to_string()), 1, disp)
                    }
                    O::RegIndexBaseScale(base, index, scale) => {
                        memory(Some(base.to_string()), Some(index.to_string()), scale, 0)
                    }
                    O::RegIndexBaseScaleDisp(base, index, scale, disp) => {
                        memory(Some(base.to_string()), Some(index.to_string()), scale, disp)
                    }
                    $($pattern => $operand,)*
                    _ => Operand::Other,
                };
                operands.push(operand);
            }

            let decoded = &instruction.prefixes;
            let prefixes = Prefixes {
                lock: decoded.lock(),
                rep: decoded.rep() || decoded.repnz(),
                segment_override: decoded.fs() || decoded.gs(),
            };

            Ok(
                DecodedInstruction::new(address, length, &instruction.opcode().to_string())
                    .with_operands(operands)
                    .with_prefixes(prefixes)
                    .with_disassembly(instruction.to_string()),
            )
        }
    };
}

decode_mode!(decode_long_mode, long_mode, {
    long_mode::Operand::ImmediateI64(v) => Operand::Immediate(v),
    long_mode::Operand::ImmediateU64(v) => Operand::Immediate(v as i64),
    long_mode::Operand::DisplacementU64(disp) => Operand::Memory(Memory::absolute(disp as i64)),
});

decode_mode!(decode_protected_mode, protected_mode, {});

/// Register operand, by disassembler name
fn register(name: String) -> Operand {
    match Register::from_name(&name) {
        Some(register) => Operand::Register(register),
        None if is_system_register(&name) => Operand::SystemRegister(name),
        None => Operand::Other,
    }
}

fn is_system_register(name: &str) -> bool {
    const SEGMENTS: [&str; 6] = ["es", "cs", "ss", "ds", "fs", "gs"];
    SEGMENTS.contains(&name)
        || ["cr", "dr"].iter().any(|prefix| {
            name.strip_prefix(prefix)
                .is_some_and(|n| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()))
        })
}

/// Memory operand from its register names
///
/// A register the rules do not model leaves the operand without a base, so
/// it is treated like an absolute address.
fn memory(base: Option<String>, index: Option<String>, scale: u8, displacement: i32) -> Operand {
    let base = base.as_deref().and_then(Register::from_name);
    let index = index.as_deref().and_then(Register::from_name);
    Operand::Memory(Memory {
        base,
        index,
        scale,
        displacement: displacement as i64,
    })
}
