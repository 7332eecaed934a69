// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Single-instruction rules
//!
//! # Both modes
//!
//! - The mnemonic must be in the opcode table and allowed by it.
//! - Segment, control and debug register operands are never accepted.
//! - Direct jumps and calls are accepted and report their destination; a
//!   direct `call` must end at a bundle boundary so that the return address
//!   is a valid jump target. Indirect jumps only appear inside
//!   superinstructions.
//!
//! # 64-bit mode
//!
//! Untrusted code runs inside a 4GiB region based at `%r15`:
//!
//! - Memory is addressed from `%r15`, `%rsp`, `%rbp` or `%rip`. An index
//!   register must be zero-extended by the previous instruction (the
//!   instruction requires `restricted(index)`).
//! - `%r15` is never written.
//! - `%rsp` and `%rbp` are written through their 32-bit aliases followed by
//!   `add %r15`, or copied into each other, or aligned with a negative `and`.
//! - A zero-extending write to any other 32-bit register establishes
//!   `restricted` for the next instruction.

use crate::{
    BUNDLE_SIZE, DecodedInstruction,
    condition::Condition,
    instruction::{Memory, Operand},
    pattern::{Bitness, InstructionInfo, Match},
    register::{Gpr, Register, Width},
    x86::{ClassifiedOpcode, Writes},
};

/// Validate a single instruction
pub fn validate(instruction: &DecodedInstruction, bitness: Bitness) -> Match<InstructionInfo> {
    let Some(class) = instruction.classify() else {
        return Match::NoMatch;
    };
    if !class.is_allowed() {
        return Match::NoMatch;
    }
    if instruction
        .operands
        .iter()
        .any(|op| matches!(op, Operand::SystemRegister(_)))
    {
        return Match::NoMatch;
    }

    if class.is_branch() {
        return validate_direct_jump(instruction, class);
    }

    match bitness {
        Bitness::Bits32 => Match::Matched(InstructionInfo::default()),
        Bitness::Bits64 => validate_64(instruction, class),
    }
}

fn validate_direct_jump(
    instruction: &DecodedInstruction,
    class: &ClassifiedOpcode,
) -> Match<InstructionInfo> {
    let Some(target) = instruction.branch_target() else {
        return Match::NoMatch;
    };
    if instruction.prefixes.lock || instruction.prefixes.rep {
        return Match::NoMatch;
    }
    if class.is_call() && !instruction.end().is_multiple_of(BUNDLE_SIZE) {
        return Match::Violation("call must end at a bundle boundary".to_string());
    }
    Match::Matched(InstructionInfo::jump(target))
}

fn validate_64(instruction: &DecodedInstruction, class: &ClassifiedOpcode) -> Match<InstructionInfo> {
    if instruction.prefixes.segment_override {
        return Match::Violation("segment override prefixes are not allowed".to_string());
    }
    if let Some(outcome) = stack_register_update(instruction) {
        return outcome;
    }

    let mut precondition = Condition::default();
    if class.accesses_memory {
        for memory in instruction.memory_operands() {
            match check_memory(memory) {
                Ok(None) => {}
                Ok(Some(index)) => {
                    let required = Condition::restricted(index);
                    if !precondition.is_default() && precondition != required {
                        return Match::Violation(
                            "memory operands need different zero-extended registers".to_string(),
                        );
                    }
                    precondition = required;
                }
                Err(message) => return Match::Violation(message),
            }
        }
    }

    let written: Vec<Register> = match class.writes {
        Writes::Nothing => Vec::new(),
        Writes::Destination => instruction.register_operand(0).into_iter().collect(),
        Writes::DestinationIfBinary if instruction.operands.len() >= 2 => {
            instruction.register_operand(0).into_iter().collect()
        }
        Writes::DestinationIfBinary => Vec::new(),
        Writes::Both => [instruction.register_operand(0), instruction.register_operand(1)]
            .into_iter()
            .flatten()
            .collect(),
        Writes::FramePointer => {
            return Match::Violation(format!(
                "{} modifies %rsp and %rbp without sandboxing",
                class.mnemonic
            ));
        }
    };

    // Only one stack register can be rebased by the next instruction.
    let mut postcondition = Condition::default();
    for register in written {
        let condition = match postcondition_for_write(register, class) {
            Ok(Some(condition)) => condition,
            Ok(None) => continue,
            Err(message) => return Match::Violation(message),
        };
        match (postcondition.unsandboxed_register(), condition.unsandboxed_register()) {
            (Some(pending), Some(truncated)) if pending != truncated => {
                return Match::Violation(format!(
                    "{pending} and {truncated} cannot both be truncated"
                ));
            }
            (Some(_), _) => {}
            (None, _) => postcondition = condition,
        }
    }

    Match::Matched(InstructionInfo::conditions(precondition, postcondition))
}

/// Accepted forms that write the 64-bit `%rsp` or `%rbp` directly
fn stack_register_update(instruction: &DecodedInstruction) -> Option<Match<InstructionInfo>> {
    let rsp = Register::qword(Gpr::Rsp);
    let rbp = Register::qword(Gpr::Rbp);
    let r15 = Register::qword(Gpr::R15);

    if instruction.is_register_pair("mov", rsp, rbp) || instruction.is_register_pair("mov", rbp, rsp)
    {
        return Some(Match::Matched(InstructionInfo::default()));
    }

    for register in [rsp, rbp] {
        if instruction.is_register_pair("add", register, r15) {
            return Some(Match::Matched(InstructionInfo::conditions(
                Condition::restricted_instead_of_sandboxed(register.family),
                Condition::default(),
            )));
        }
    }

    // Clearing low bits keeps %rsp inside the region as long as the
    // region base is 4GiB aligned.
    if instruction.mnemonic == "and"
        && instruction.register_operand(0) == Some(rsp)
        && instruction.immediate_operand(1).is_some_and(|mask| mask < 0)
    {
        return Some(Match::Matched(InstructionInfo::default()));
    }

    None
}

/// Check a dereferenced memory operand, returning the index register that
/// has to be zero-extended
fn check_memory(memory: &Memory) -> Result<Option<Gpr>, String> {
    let Some(base) = memory.base else {
        return Err(format!(
            "absolute memory reference {:#x} is not sandboxed",
            memory.displacement
        ));
    };

    match base.family {
        Gpr::Rip => match memory.index {
            Some(index) => Err(format!("rip-relative reference with index {index}")),
            None => Ok(None),
        },
        Gpr::R15 | Gpr::Rsp | Gpr::Rbp => {
            if !base.is_qword() {
                return Err(format!("memory reference through 32-bit base {base}"));
            }
            match memory.index {
                None => Ok(None),
                Some(index) if !index.is_qword() => {
                    Err(format!("memory reference through 32-bit index {index}"))
                }
                Some(index) if index.family.is_sandbox_pointer() => {
                    Err(format!("{index} cannot be used as an index"))
                }
                Some(index) => Ok(Some(index.family)),
            }
        }
        _ => Err(format!("memory reference through unsandboxed base {base}")),
    }
}

/// Condition established by writing `register`
fn postcondition_for_write(
    register: Register,
    class: &ClassifiedOpcode,
) -> Result<Option<Condition>, String> {
    match (register.family, register.width) {
        (Gpr::R15, _) => Err(format!("{register} must not be modified")),
        (Gpr::Rsp | Gpr::Rbp, Width::Dword) if class.zero_extends => Ok(Some(
            Condition::restricted_instead_of_sandboxed(register.family),
        )),
        (Gpr::Rsp | Gpr::Rbp, Width::Qword) => Err(format!(
            "{register} can only be modified through a sandboxing sequence"
        )),
        (Gpr::Rsp | Gpr::Rbp, _) => Err(format!("{register} must not be partially modified")),
        (family, Width::Dword) if class.zero_extends => Ok(Some(Condition::restricted(family))),
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::validate;
    use crate::{
        DecodedInstruction,
        condition::Condition,
        instruction::{Memory, Operand, Prefixes},
        pattern::{Bitness, InstructionInfo, Match},
        register::{Gpr, Register, Width},
    };

    fn reg(family: Gpr) -> Operand {
        Operand::Register(Register::qword(family))
    }

    fn reg32(family: Gpr) -> Operand {
        Operand::Register(Register::dword(family))
    }

    fn instr(mnemonic: &str, operands: impl IntoIterator<Item = Operand>) -> DecodedInstruction {
        DecodedInstruction::new(0, 3, mnemonic).with_operands(operands)
    }

    fn r15_indexed(index: Gpr) -> Operand {
        Operand::Memory(Memory::base_index(
            Register::qword(Gpr::R15),
            Register::qword(index),
        ))
    }

    #[test]
    fn test_unknown_mnemonic_does_not_match() {
        let fld = instr("fld", [Operand::Other]);
        assert_eq!(validate(&fld, Bitness::Bits64), Match::NoMatch);
        assert_eq!(validate(&fld, Bitness::Bits32), Match::NoMatch);
    }

    #[test]
    fn test_rejected_opcode_does_not_match() {
        for mnemonic in ["syscall", "ret", "int", "stos"] {
            assert_eq!(validate(&instr(mnemonic, []), Bitness::Bits64), Match::NoMatch);
        }
    }

    #[test]
    fn test_segment_register_operand_does_not_match() {
        let mov = instr(
            "mov",
            [
                Operand::SystemRegister("ds".into()),
                Operand::Register(Register::new(Gpr::Rax, Width::Word)),
            ],
        );
        assert_eq!(validate(&mov, Bitness::Bits32), Match::NoMatch);
    }

    #[test]
    fn test_direct_jump_reports_target() {
        let jmp = DecodedInstruction::new(0x10, 2, "jmp").with_operands([Operand::Immediate(4)]);
        assert_eq!(
            validate(&jmp, Bitness::Bits64),
            Match::Matched(InstructionInfo::jump(0x16))
        );
        assert_eq!(
            validate(&jmp, Bitness::Bits32),
            Match::Matched(InstructionInfo::jump(0x16))
        );
    }

    #[test]
    fn test_direct_call_must_end_bundle() {
        let aligned = DecodedInstruction::new(27, 5, "call").with_operands([Operand::Immediate(-32)]);
        assert_eq!(
            validate(&aligned, Bitness::Bits64),
            Match::Matched(InstructionInfo::jump(0))
        );

        let misaligned = DecodedInstruction::new(0, 5, "call").with_operands([Operand::Immediate(0)]);
        assert!(matches!(
            validate(&misaligned, Bitness::Bits32),
            Match::Violation(message) if message.contains("bundle boundary")
        ));
    }

    #[test]
    fn test_indirect_jump_alone_does_not_match() {
        let jmp = instr("jmp", [reg(Gpr::Rax)]);
        assert_eq!(validate(&jmp, Bitness::Bits64), Match::NoMatch);
        let jmp = instr("jmp", [reg32(Gpr::Rax)]);
        assert_eq!(validate(&jmp, Bitness::Bits32), Match::NoMatch);
    }

    #[test]
    fn test_32bit_memory_is_unrestricted() {
        let mov = instr(
            "mov",
            [reg32(Gpr::Rax), Operand::Memory(Memory::absolute(0x1000))],
        );
        assert_eq!(
            validate(&mov, Bitness::Bits32),
            Match::Matched(InstructionInfo::default())
        );
    }

    #[test]
    fn test_zero_extending_write_restricts_register() {
        let mov = instr("mov", [reg32(Gpr::Rax), reg32(Gpr::Rax)]);
        assert_eq!(
            validate(&mov, Bitness::Bits64),
            Match::Matched(InstructionInfo::conditions(
                Condition::default(),
                Condition::restricted(Gpr::Rax)
            ))
        );
    }

    #[test]
    fn test_non_zero_extending_write_keeps_default() {
        let bsf = instr("bsf", [reg32(Gpr::Rcx), reg32(Gpr::Rdx)]);
        assert_eq!(
            validate(&bsf, Bitness::Bits64),
            Match::Matched(InstructionInfo::default())
        );
        let add = instr("add", [reg(Gpr::Rcx), reg(Gpr::Rdx)]);
        assert_eq!(
            validate(&add, Bitness::Bits64),
            Match::Matched(InstructionInfo::default())
        );
    }

    #[test]
    fn test_one_operand_imul_writes_nothing_explicit() {
        let imul = instr("imul", [reg32(Gpr::Rcx)]);
        assert_eq!(
            validate(&imul, Bitness::Bits64),
            Match::Matched(InstructionInfo::default())
        );
        let imul = instr("imul", [reg32(Gpr::Rcx), reg32(Gpr::Rdx)]);
        assert_eq!(
            validate(&imul, Bitness::Bits64),
            Match::Matched(InstructionInfo::conditions(
                Condition::default(),
                Condition::restricted(Gpr::Rcx)
            ))
        );
    }

    #[test]
    fn test_indexed_load_requires_restricted_index() {
        let mov = instr("mov", [reg32(Gpr::Rcx), r15_indexed(Gpr::Rax)]);
        assert_eq!(
            validate(&mov, Bitness::Bits64),
            Match::Matched(InstructionInfo::conditions(
                Condition::restricted(Gpr::Rax),
                Condition::restricted(Gpr::Rcx)
            ))
        );
    }

    #[test]
    fn test_stack_and_rip_relative_access() {
        let load = instr(
            "mov",
            [
                reg(Gpr::Rax),
                Operand::Memory(Memory::base(Register::qword(Gpr::Rsp)).with_displacement(8)),
            ],
        );
        assert!(matches!(validate(&load, Bitness::Bits64), Match::Matched(_)));

        let rip = instr(
            "mov",
            [
                reg(Gpr::Rax),
                Operand::Memory(Memory::base(Register::qword(Gpr::Rip)).with_displacement(0x100)),
            ],
        );
        assert!(matches!(validate(&rip, Bitness::Bits64), Match::Matched(_)));
    }

    #[test]
    fn test_unsandboxed_memory_is_violation() {
        let through_rax = instr(
            "mov",
            [
                Operand::Memory(Memory::base(Register::qword(Gpr::Rax))),
                reg32(Gpr::Rcx),
            ],
        );
        assert!(matches!(
            validate(&through_rax, Bitness::Bits64),
            Match::Violation(message) if message.contains("%rax")
        ));

        let absolute = instr(
            "mov",
            [reg32(Gpr::Rax), Operand::Memory(Memory::absolute(0x1000))],
        );
        assert!(matches!(validate(&absolute, Bitness::Bits64), Match::Violation(_)));

        let rip_index = instr(
            "mov",
            [
                reg32(Gpr::Rax),
                Operand::Memory(Memory::base_index(
                    Register::qword(Gpr::Rip),
                    Register::qword(Gpr::Rax),
                )),
            ],
        );
        assert!(matches!(validate(&rip_index, Bitness::Bits64), Match::Violation(_)));
    }

    #[test]
    fn test_lea_and_nop_skip_memory_checks() {
        let lea = instr(
            "lea",
            [reg32(Gpr::Rax), Operand::Memory(Memory::base(Register::qword(Gpr::Rbx)))],
        );
        assert_eq!(
            validate(&lea, Bitness::Bits64),
            Match::Matched(InstructionInfo::conditions(
                Condition::default(),
                Condition::restricted(Gpr::Rax)
            ))
        );

        let nop = instr(
            "nop",
            [Operand::Memory(Memory::base_index(
                Register::qword(Gpr::Rax),
                Register::qword(Gpr::Rax),
            ))],
        );
        assert!(matches!(validate(&nop, Bitness::Bits64), Match::Matched(_)));
    }

    #[test]
    fn test_r15_is_read_only() {
        for width in [Width::Qword, Width::Dword, Width::Byte] {
            let mov = instr(
                "mov",
                [Operand::Register(Register::new(Gpr::R15, width)), reg(Gpr::Rax)],
            );
            assert!(matches!(
                validate(&mov, Bitness::Bits64),
                Match::Violation(message) if message.contains("must not be modified")
            ));
        }
    }

    #[test]
    fn test_stack_pointer_writes() {
        let sub = instr("sub", [reg32(Gpr::Rsp), Operand::Immediate(8)]);
        assert_eq!(
            validate(&sub, Bitness::Bits64),
            Match::Matched(InstructionInfo::conditions(
                Condition::default(),
                Condition::restricted_instead_of_sandboxed(Gpr::Rsp)
            ))
        );

        let rebase = instr("add", [reg(Gpr::Rsp), reg(Gpr::R15)]);
        assert_eq!(
            validate(&rebase, Bitness::Bits64),
            Match::Matched(InstructionInfo::conditions(
                Condition::restricted_instead_of_sandboxed(Gpr::Rsp),
                Condition::default()
            ))
        );

        let sub64 = instr("sub", [reg(Gpr::Rsp), Operand::Immediate(8)]);
        assert!(matches!(validate(&sub64, Bitness::Bits64), Match::Violation(_)));

        let partial = instr(
            "mov",
            [Operand::Register(Register::new(Gpr::Rbp, Width::Word)), reg32(Gpr::Rax)],
        );
        assert!(matches!(validate(&partial, Bitness::Bits64), Match::Violation(_)));

        let pop = instr("pop", [reg(Gpr::Rbp)]);
        assert!(matches!(validate(&pop, Bitness::Bits64), Match::Violation(_)));
        assert!(matches!(validate(&pop, Bitness::Bits32), Match::Matched(_)));
    }

    #[test]
    fn test_exchanging_stack_registers_is_violation() {
        for mnemonic in ["xchg", "xadd"] {
            let exchange = instr(mnemonic, [reg32(Gpr::Rsp), reg32(Gpr::Rbp)]);
            assert_eq!(
                validate(&exchange, Bitness::Bits64),
                Match::Violation("%rsp and %rbp cannot both be truncated".to_string())
            );
        }

        // One truncated stack register next to a plain register is fine
        let exchange = instr("xchg", [reg32(Gpr::Rax), reg32(Gpr::Rsp)]);
        assert_eq!(
            validate(&exchange, Bitness::Bits64),
            Match::Matched(InstructionInfo::conditions(
                Condition::default(),
                Condition::restricted_instead_of_sandboxed(Gpr::Rsp)
            ))
        );
    }

    #[test]
    fn test_frame_pointer_copies_and_alignment() {
        let copy = instr("mov", [reg(Gpr::Rbp), reg(Gpr::Rsp)]);
        assert_eq!(
            validate(&copy, Bitness::Bits64),
            Match::Matched(InstructionInfo::default())
        );
        let align = instr("and", [reg(Gpr::Rsp), Operand::Immediate(-16)]);
        assert_eq!(
            validate(&align, Bitness::Bits64),
            Match::Matched(InstructionInfo::default())
        );
        let leave = instr("leave", []);
        assert!(matches!(validate(&leave, Bitness::Bits64), Match::Violation(_)));
        assert!(matches!(validate(&leave, Bitness::Bits32), Match::Matched(_)));
    }

    #[test]
    fn test_segment_override_is_violation_in_64bit() {
        let mov = instr("mov", [reg(Gpr::Rax), Operand::Memory(Memory::base(Register::qword(Gpr::Rsp)))])
            .with_prefixes(Prefixes {
                segment_override: true,
                ..Prefixes::default()
            });
        assert!(matches!(validate(&mov, Bitness::Bits64), Match::Violation(_)));
        assert!(matches!(validate(&mov, Bitness::Bits32), Match::Matched(_)));
    }
}
