// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Multi-instruction sandboxing idioms
//!
//! Indirect control transfers and string operations are only safe when the
//! instructions that sandbox their operands run immediately before them, so
//! the whole sequence is accepted (or rejected) as one unit:
//!
//! ```text
//! 32-bit  and  %eax, -32         64-bit  and  %eax, -32
//!         jmp  *%eax                     add  %rax, %r15
//!                                        jmp  *%rax
//!
//! 64-bit  mov  %esi, %esi                mov  %edi, %edi
//!         lea  (%r15,%rsi), %rsi         lea  (%r15,%rdi), %rdi
//!         [rep] lods                     [rep] stos | scas
//!
//! 64-bit  mov  %esi, %esi / lea (%r15,%rsi), %rsi
//!         mov  %edi, %edi / lea (%r15,%rdi), %rdi   (either order)
//!         [rep] movs | cmps
//! ```
//!
//! `call` may replace `jmp` and must end at a bundle boundary.

use crate::{
    BUNDLE_SIZE, DecodedInstruction,
    instruction::{Memory, Operand},
    pattern::{Bitness, Match},
    register::{Gpr, Register},
};

/// Validate `window` as a single superinstruction
pub fn validate(window: &[DecodedInstruction], bitness: Bitness) -> Match<()> {
    match (bitness, window) {
        (Bitness::Bits32, [and, jump]) => {
            let Some(register) = masked_register(and) else {
                return Match::NoMatch;
            };
            if !register.is_dword() || register.family == Gpr::Rsp {
                return Match::NoMatch;
            }
            if jump.indirect_target() != Some(register) || has_prefix(jump) {
                return Match::NoMatch;
            }
            check_call_alignment(jump)
        }
        (Bitness::Bits64, [and, add, jump]) => {
            indirect_jump_64(and, add, jump).or_else(|| string_operation(and, add, jump))
        }
        (Bitness::Bits64, [first_mov, first_lea, second_mov, second_lea, string_op]) => {
            let first = sandboxed_register(first_mov, first_lea);
            let second = sandboxed_register(second_mov, second_lea);
            let pair_ok = matches!(
                (first, second),
                (Some(Gpr::Rsi), Some(Gpr::Rdi)) | (Some(Gpr::Rdi), Some(Gpr::Rsi))
            );
            if pair_ok && is_string_operation(string_op, &["movs", "cmps"]) {
                Match::Matched(())
            } else {
                Match::NoMatch
            }
        }
        _ => Match::NoMatch,
    }
}

fn indirect_jump_64(
    and: &DecodedInstruction,
    add: &DecodedInstruction,
    jump: &DecodedInstruction,
) -> Match<()> {
    let Some(register) = masked_register(and) else {
        return Match::NoMatch;
    };
    if !register.is_dword() || register.family.is_sandbox_pointer() {
        return Match::NoMatch;
    }
    let full = Register::qword(register.family);
    if !add.is_register_pair("add", full, Register::qword(Gpr::R15)) {
        return Match::NoMatch;
    }
    if jump.indirect_target() != Some(full) || has_prefix(jump) {
        return Match::NoMatch;
    }
    check_call_alignment(jump)
}

/// Three-instruction string operation sandboxing one of `rsi`/`rdi`
fn string_operation(
    mov: &DecodedInstruction,
    lea: &DecodedInstruction,
    string_op: &DecodedInstruction,
) -> Match<()> {
    let mnemonics: &[&str] = match sandboxed_register(mov, lea) {
        Some(Gpr::Rsi) => &["lods"],
        Some(Gpr::Rdi) => &["stos", "scas"],
        _ => return Match::NoMatch,
    };
    if is_string_operation(string_op, mnemonics) {
        Match::Matched(())
    } else {
        Match::NoMatch
    }
}

/// Register cleared to a bundle-aligned value by `and reg, -BUNDLE_SIZE`
fn masked_register(and: &DecodedInstruction) -> Option<Register> {
    if and.mnemonic != "and" || and.operands.len() != 2 || has_prefix(and) {
        return None;
    }
    let mask = and.immediate_operand(1)?;
    if mask as u32 != !(BUNDLE_SIZE as u32 - 1) {
        return None;
    }
    and.register_operand(0)
}

/// Register family moved into the sandbox by `mov %e?i, %e?i; lea (%r15,%r?i), %r?i`
fn sandboxed_register(mov: &DecodedInstruction, lea: &DecodedInstruction) -> Option<Gpr> {
    let family = [Gpr::Rsi, Gpr::Rdi].into_iter().find(|family| {
        let low = Register::dword(*family);
        mov.is_register_pair("mov", low, low)
    })?;

    let full = Register::qword(family);
    let expected = Operand::Memory(Memory::base_index(Register::qword(Gpr::R15), full));
    let lea_ok = lea.mnemonic == "lea"
        && lea.operands.len() == 2
        && lea.register_operand(0) == Some(full)
        && lea.operand(1) == Some(&expected);
    lea_ok.then_some(family)
}

/// String instruction with one of `mnemonics`, addressing through 64-bit registers
fn is_string_operation(instruction: &DecodedInstruction, mnemonics: &[&str]) -> bool {
    mnemonics.contains(&instruction.mnemonic.as_str())
        && !instruction.prefixes.lock
        && !instruction.prefixes.segment_override
        && instruction
            .memory_operands()
            .all(|memory| memory.base.is_some_and(|base| base.is_qword()))
}

fn has_prefix(instruction: &DecodedInstruction) -> bool {
    let prefixes = &instruction.prefixes;
    prefixes.lock || prefixes.rep || prefixes.segment_override
}

fn check_call_alignment(jump: &DecodedInstruction) -> Match<()> {
    let is_call = jump.classify().is_some_and(|class| class.is_call());
    if is_call && !jump.end().is_multiple_of(BUNDLE_SIZE) {
        return Match::Violation("call must end at a bundle boundary".to_string());
    }
    Match::Matched(())
}
