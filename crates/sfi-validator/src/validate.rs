// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Validation of sandboxed x86 code chunks
//!
//! Provides [`Validator`], which scans a chunk once from start to end:
//!
//! 1. Every instruction start is recorded as a valid jump target before the
//!    instruction is examined, whether or not it is accepted later.
//! 2. Superinstructions are tried greedily, longest window first.
//! 3. Otherwise the instruction is checked on its own.
//! 4. Accepted units must satisfy the current condition and update it.
//!
//! Direct jump destinations are checked after the scan, once all
//! instruction starts are known.

use std::collections::{BTreeMap, HashSet};

use sfi_rules::{
    BUNDLE_SIZE, Bitness, Condition, DecodedInstruction, Match, PatternSpec, SandboxRules,
};
use tracing::{debug, trace};

use crate::{
    decode::{InstructionDecoder, X86Decoder},
    error::{ValidationError, ValidationResult},
    policy::{ArchPolicy, policy_for},
};

/// Validator for one code chunk
///
/// Runs exactly once: [`Validator::validate`] consumes it.
pub struct Validator<'a, D = X86Decoder, P = SandboxRules> {
    code: &'a [u8],
    policy: &'a dyn ArchPolicy,
    decoder: D,
    patterns: P,
}

impl<'a> Validator<'a> {
    /// Create a validator using the production decoder and sandboxing rules
    pub fn new(code: &'a [u8], bitness: Bitness) -> Self {
        Self::with_collaborators(code, policy_for(bitness), X86Decoder, SandboxRules)
    }
}

impl<'a, D: InstructionDecoder, P: PatternSpec> Validator<'a, D, P> {
    /// Create a validator with a custom decoder and rule table
    pub fn with_collaborators(
        code: &'a [u8],
        policy: &'a dyn ArchPolicy,
        decoder: D,
        patterns: P,
    ) -> Self {
        Self {
            code,
            policy,
            decoder,
            patterns,
        }
    }

    /// Validate the chunk, returning every problem found
    ///
    /// Only a misaligned chunk size or a decoding failure stops the scan
    /// early; every other problem is reported and scanning continues.
    pub fn validate(self) -> ValidationResult {
        let mut result = ValidationResult::default();
        let bitness = self.policy.bitness();

        if !self.code.len().is_multiple_of(BUNDLE_SIZE) {
            let error = ValidationError::ChunkSizeNotAligned {
                size: self.code.len(),
            };
            debug!(%error, "rejecting chunk");
            result.push(error);
            return result;
        }

        let instructions = match self.decoder.decode(self.code, bitness) {
            Ok(instructions) => instructions,
            Err(source) => {
                debug!(%source, "rejecting chunk");
                result.push(ValidationError::DecodeFailed {
                    offset: source.offset(),
                    source,
                });
                return result;
            }
        };

        let mut scan = Scan::new(&instructions, self.policy, &self.patterns);
        scan.run();
        scan.check_jumps();

        debug!(
            %bitness,
            size = self.code.len(),
            instructions = instructions.len(),
            errors = scan.result.errors().len(),
            "validated chunk"
        );
        scan.result
    }
}

/// Mutable state of one scan
struct Scan<'s, P> {
    instructions: &'s [DecodedInstruction],
    policy: &'s dyn ArchPolicy,
    patterns: &'s P,
    condition: Condition,
    /// Offsets of every instruction start reached by the scan
    valid_targets: HashSet<usize>,
    /// Direct jumps by source offset
    pending_jumps: BTreeMap<usize, i64>,
    result: ValidationResult,
}

impl<'s, P: PatternSpec> Scan<'s, P> {
    fn new(
        instructions: &'s [DecodedInstruction],
        policy: &'s dyn ArchPolicy,
        patterns: &'s P,
    ) -> Self {
        Self {
            instructions,
            policy,
            patterns,
            condition: Condition::default(),
            valid_targets: HashSet::with_capacity(instructions.len()),
            pending_jumps: BTreeMap::new(),
            result: ValidationResult::default(),
        }
    }

    fn run(&mut self) {
        let instructions = self.instructions;
        let mut index = 0;

        while index < instructions.len() {
            let instruction = &instructions[index];
            self.valid_targets.insert(instruction.address);

            index += match self.try_superinstruction(index) {
                Some(consumed) => consumed,
                None => self.try_instruction(instruction),
            };
        }
    }

    /// Try windows starting at `index`, longest first
    ///
    /// Returns the number of instructions consumed, or `None` if no window
    /// is a superinstruction.
    fn try_superinstruction(&mut self, index: usize) -> Option<usize> {
        let instructions = self.instructions;
        let bitness = self.policy.bitness();
        let longest = self
            .policy
            .max_superinstruction_length()
            .min(instructions.len() - index);

        for length in (2..=longest).rev() {
            let window = &instructions[index..index + length];
            let start = window[0].address;
            let end = window[length - 1].end();

            match self.patterns.validate_superinstruction(window, bitness) {
                Match::NoMatch => continue,
                Match::Violation(message) => {
                    self.violation(start, message);
                    return Some(1);
                }
                Match::Matched(()) => {
                    if crosses_bundle(start, end) {
                        self.report(ValidationError::SuperinstructionCrossesBundle {
                            offset: start,
                        });
                    }
                    let default = Condition::default();
                    let checked =
                        self.policy
                            .check_conditions(&mut self.condition, end, &default, &default);
                    if let Err(message) = checked {
                        self.violation(start, message);
                        return Some(1);
                    }
                    trace!(offset = start, length, "accepted superinstruction");
                    return Some(length);
                }
            }
        }

        None
    }

    /// Check a single instruction; always consumes exactly one
    fn try_instruction(&mut self, instruction: &DecodedInstruction) -> usize {
        let address = instruction.address;

        match self
            .patterns
            .validate_instruction(instruction, self.policy.bitness())
        {
            Match::Matched(info) => {
                if crosses_bundle(address, instruction.end()) {
                    self.report(ValidationError::InstructionCrossesBundle { offset: address });
                }
                let checked = self.policy.check_conditions(
                    &mut self.condition,
                    instruction.end(),
                    &info.precondition,
                    &info.postcondition,
                );
                match checked {
                    Ok(()) => {
                        if let Some(destination) = info.jump_target {
                            self.pending_jumps.insert(address, destination);
                        }
                        trace!(%instruction, condition = %self.condition, "accepted instruction");
                    }
                    Err(message) => self.violation(address, message),
                }
            }
            Match::NoMatch => {
                if let Some(reason) = instruction.classify().and_then(|c| c.rejection_reason()) {
                    trace!(%instruction, %reason, "rejected opcode");
                }
                self.report(ValidationError::UnrecognizedInstruction {
                    offset: address,
                    disassembly: instruction.disassembly.clone(),
                });
                self.condition = Condition::default();
            }
            Match::Violation(message) => self.violation(address, message),
        }

        1
    }

    /// Destinations must start an instruction or a bundle
    fn check_jumps(&mut self) {
        let pending = std::mem::take(&mut self.pending_jumps);

        for (source, destination) in pending {
            let bundle_aligned = destination.rem_euclid(BUNDLE_SIZE as i64) == 0;
            let instruction_start = usize::try_from(destination)
                .is_ok_and(|destination| self.valid_targets.contains(&destination));

            if !bundle_aligned && !instruction_start {
                self.report(ValidationError::JumpIntoInstruction {
                    offset: source,
                    destination,
                });
            }
        }
    }

    fn violation(&mut self, offset: usize, message: String) {
        self.report(ValidationError::SandboxingViolation { offset, message });
        self.condition = Condition::default();
    }

    fn report(&mut self, error: ValidationError) {
        debug!(offset = error.offset(), %error, "validation error");
        self.result.push(error);
    }
}

/// True if `[start, end)` spans more than one bundle
fn crosses_bundle(start: usize, end: usize) -> bool {
    let last = end.saturating_sub(1).max(start);
    start / BUNDLE_SIZE != last / BUNDLE_SIZE
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use sfi_rules::{
        BUNDLE_SIZE, Bitness, Condition, DecodedInstruction, Gpr, InstructionInfo, Match, Operand,
        PatternSpec,
    };

    use super::{Validator, crosses_bundle};
    use crate::{
        decode::InstructionDecoder,
        error::{DecodeError, ValidationError},
        policy::{Validator32Policy, Validator64Policy, policy_for},
    };

    /// Decoder returning a fixed instruction list
    struct StubDecoder(Result<Vec<DecodedInstruction>, DecodeError>);

    impl InstructionDecoder for StubDecoder {
        fn decode(
            &self,
            _code: &[u8],
            _bitness: Bitness,
        ) -> Result<Vec<DecodedInstruction>, DecodeError> {
            self.0.clone()
        }
    }

    /// Rules keyed by mnemonic:
    ///
    /// - `ok`: default to default
    /// - `zext`: establishes `restricted(rax)`
    /// - `load`: requires `restricted(rax)`
    /// - `pin`: leaves a pending `%rsp` rebase
    /// - `jmp`: jumps to its immediate operand (an absolute offset)
    /// - `unsafe`: a rule violation
    /// - anything else: not recognized
    ///
    /// Superinstructions are the listed `(start offset, window length)` pairs.
    #[derive(Default)]
    struct StubPatterns {
        superinstructions: Vec<(usize, usize)>,
        attempts: RefCell<Vec<(usize, usize)>>,
    }

    impl StubPatterns {
        fn with_superinstructions(superinstructions: &[(usize, usize)]) -> Self {
            Self {
                superinstructions: superinstructions.to_vec(),
                ..Self::default()
            }
        }
    }

    impl PatternSpec for StubPatterns {
        fn validate_superinstruction(
            &self,
            window: &[DecodedInstruction],
            _bitness: Bitness,
        ) -> Match<()> {
            let key = (window[0].address, window.len());
            self.attempts.borrow_mut().push(key);
            if self.superinstructions.contains(&key) {
                Match::Matched(())
            } else {
                Match::NoMatch
            }
        }

        fn validate_instruction(
            &self,
            instruction: &DecodedInstruction,
            _bitness: Bitness,
        ) -> Match<InstructionInfo> {
            let restricted = Condition::restricted(Gpr::Rax);
            match instruction.mnemonic.as_str() {
                "ok" => Match::Matched(InstructionInfo::default()),
                "zext" => Match::Matched(InstructionInfo::conditions(
                    Condition::default(),
                    restricted,
                )),
                "load" => Match::Matched(InstructionInfo::conditions(
                    restricted,
                    Condition::default(),
                )),
                "pin" => Match::Matched(InstructionInfo::conditions(
                    Condition::default(),
                    Condition::restricted_instead_of_sandboxed(Gpr::Rsp),
                )),
                "jmp" => match instruction.immediate_operand(0) {
                    Some(destination) => Match::Matched(InstructionInfo::jump(destination)),
                    None => Match::NoMatch,
                },
                "unsafe" => Match::Violation("stub violation".to_string()),
                _ => Match::NoMatch,
            }
        }
    }

    /// Lay out `(mnemonic, length)` pairs back to back from offset 0
    fn layout(shape: &[(&str, usize)]) -> Vec<DecodedInstruction> {
        let mut address = 0;
        shape.iter()
            .map(|(mnemonic, length)| {
                let instruction = DecodedInstruction::new(address, *length, mnemonic);
                address += length;
                instruction
            })
            .collect()
    }

    /// Pad with one-byte `ok` instructions up to `size`
    fn pad(mut instructions: Vec<DecodedInstruction>, size: usize) -> Vec<DecodedInstruction> {
        let mut address = instructions.last().map_or(0, |i| i.end());
        while address < size {
            instructions.push(DecodedInstruction::new(address, 1, "ok"));
            address += 1;
        }
        instructions
    }

    fn jump(address: usize, length: usize, destination: i64) -> DecodedInstruction {
        DecodedInstruction::new(address, length, "jmp")
            .with_operands([Operand::Immediate(destination)])
    }

    fn run(
        bitness: Bitness,
        instructions: Vec<DecodedInstruction>,
        patterns: &StubPatterns,
    ) -> Vec<(usize, String)> {
        let size = instructions.last().map_or(0, |i| i.end());
        let code = vec![0u8; size];
        Validator::with_collaborators(
            &code,
            policy_for(bitness),
            StubDecoder(Ok(instructions)),
            patterns,
        )
        .validate()
        .diagnostics()
    }

    impl PatternSpec for &StubPatterns {
        fn validate_superinstruction(
            &self,
            window: &[DecodedInstruction],
            bitness: Bitness,
        ) -> Match<()> {
            (**self).validate_superinstruction(window, bitness)
        }

        fn validate_instruction(
            &self,
            instruction: &DecodedInstruction,
            bitness: Bitness,
        ) -> Match<InstructionInfo> {
            (**self).validate_instruction(instruction, bitness)
        }
    }

    #[test]
    fn test_misaligned_chunk_is_rejected_upfront() {
        let code = [0x90u8; 33];
        let patterns = StubPatterns::default();
        let result = Validator::with_collaborators(
            &code,
            &Validator64Policy,
            StubDecoder(Ok(layout(&[("unknown", 33)]))),
            &patterns,
        )
        .validate();

        assert_eq!(result.errors().len(), 1);
        assert!(matches!(
            result.errors()[0],
            ValidationError::ChunkSizeNotAligned { size: 33 }
        ));
        assert_eq!(result.errors()[0].offset(), 0);
        assert!(patterns.attempts.borrow().is_empty());
    }

    #[test]
    fn test_empty_chunk_is_valid() {
        assert!(run(Bitness::Bits64, Vec::new(), &StubPatterns::default()).is_empty());
    }

    #[test]
    fn test_clean_chunk_has_no_diagnostics() {
        let instructions = pad(layout(&[("ok", 4), ("ok", 3)]), 2 * BUNDLE_SIZE);
        assert!(run(Bitness::Bits64, instructions.clone(), &StubPatterns::default()).is_empty());
        assert!(run(Bitness::Bits32, instructions, &StubPatterns::default()).is_empty());
    }

    #[test]
    fn test_decode_failure_stops_the_scan() {
        let code = [0u8; 32];
        let error = DecodeError::InvalidInstruction {
            offset: 0,
            message: "invalid opcode".into(),
        };
        let patterns = StubPatterns::default();
        let result = Validator::with_collaborators(
            &code,
            &Validator64Policy,
            StubDecoder(Err(error)),
            &patterns,
        )
        .validate();

        assert_eq!(
            result.diagnostics(),
            vec![(0, "failed to decode instruction".to_string())]
        );
        assert!(patterns.attempts.borrow().is_empty());
    }

    #[test]
    fn test_validation_is_idempotent() {
        let instructions = pad(
            vec![
                DecodedInstruction::new(0, 2, "bogus"),
                DecodedInstruction::new(2, 2, "load"),
                jump(4, 2, 9),
                DecodedInstruction::new(6, 4, "ok"),
                DecodedInstruction::new(10, 1, "unsafe"),
            ],
            BUNDLE_SIZE,
        );
        let first = run(Bitness::Bits64, instructions.clone(), &StubPatterns::default());
        let second = run(Bitness::Bits64, instructions, &StubPatterns::default());
        assert_eq!(first.len(), 4);
        assert_eq!(first, second);
    }

    #[test]
    fn test_superinstruction_crossing_bundle_is_reported_once() {
        let mut instructions = pad(Vec::new(), 28);
        instructions.push(DecodedInstruction::new(28, 3, "ok"));
        instructions.push(DecodedInstruction::new(31, 3, "ok"));
        let instructions = pad(instructions, 2 * BUNDLE_SIZE);
        let patterns = StubPatterns::with_superinstructions(&[(28, 2)]);

        assert_eq!(
            run(Bitness::Bits64, instructions, &patterns),
            vec![(28, "superinstruction crosses bundle boundary".to_string())]
        );
    }

    #[test]
    fn test_instruction_crossing_bundle_is_reported_but_accepted() {
        let mut instructions = pad(Vec::new(), 30);
        instructions.push(DecodedInstruction::new(30, 4, "zext"));
        instructions.push(DecodedInstruction::new(34, 2, "load"));
        let instructions = pad(instructions, 2 * BUNDLE_SIZE);

        // The condition established by the crossing instruction still holds.
        assert_eq!(
            run(Bitness::Bits64, instructions, &StubPatterns::default()),
            vec![(30, "instruction crosses bundle boundary".to_string())]
        );
    }

    #[test]
    fn test_jump_to_instruction_start_is_valid() {
        let instructions = pad(
            vec![
                jump(0, 2, 6),
                DecodedInstruction::new(2, 4, "ok"),
                DecodedInstruction::new(6, 4, "ok"),
                jump(10, 2, 2),
            ],
            BUNDLE_SIZE,
        );
        assert!(run(Bitness::Bits64, instructions, &StubPatterns::default()).is_empty());
    }

    #[test]
    fn test_jump_into_instruction_is_reported() {
        let instructions = pad(
            vec![
                jump(0, 2, 4),
                DecodedInstruction::new(2, 4, "ok"),
            ],
            BUNDLE_SIZE,
        );
        assert_eq!(
            run(Bitness::Bits64, instructions, &StubPatterns::default()),
            vec![(0, "jump into a middle of instruction".to_string())]
        );
    }

    #[test]
    fn test_bundle_aligned_jumps_always_land() {
        let instructions = pad(
            vec![
                jump(0, 2, 64),
                jump(2, 2, -32),
                jump(4, 2, 0),
            ],
            BUNDLE_SIZE,
        );
        assert!(run(Bitness::Bits64, instructions, &StubPatterns::default()).is_empty());

        let instructions = pad(vec![jump(0, 2, -3), jump(2, 2, 40)], BUNDLE_SIZE);
        assert_eq!(
            run(Bitness::Bits32, instructions, &StubPatterns::default()),
            vec![
                (0, "jump into a middle of instruction".to_string()),
                (2, "jump into a middle of instruction".to_string()),
            ]
        );
    }

    #[test]
    fn test_jump_diagnostics_come_last_in_source_order() {
        let instructions = pad(
            vec![
                jump(0, 2, 13),
                DecodedInstruction::new(2, 10, "ok"),
                jump(12, 2, 3),
                DecodedInstruction::new(14, 1, "bogus"),
            ],
            BUNDLE_SIZE,
        );
        let diagnostics = run(Bitness::Bits64, instructions, &StubPatterns::default());
        let offsets: Vec<usize> = diagnostics.iter().map(|(offset, _)| *offset).collect();
        assert_eq!(offsets, vec![14, 0, 12]);
    }

    #[test]
    fn test_rejected_instruction_is_still_a_jump_target() {
        let instructions = pad(
            vec![
                jump(0, 2, 2),
                DecodedInstruction::new(2, 3, "bogus"),
            ],
            BUNDLE_SIZE,
        );
        assert_eq!(
            run(Bitness::Bits64, instructions, &StubPatterns::default()),
            vec![(2, "unrecognized instruction bogus".to_string())]
        );
    }

    #[test]
    fn test_longest_superinstruction_wins() {
        let instructions = pad(layout(&[("ok", 2), ("ok", 2), ("ok", 2), ("ok", 2)]), BUNDLE_SIZE);
        let patterns = StubPatterns::with_superinstructions(&[(0, 2), (0, 3)]);

        assert!(run(Bitness::Bits64, instructions, &patterns).is_empty());

        let attempts = patterns.attempts.borrow();
        let at_start: Vec<_> = attempts.iter().filter(|(start, _)| *start == 0).collect();
        assert_eq!(at_start, vec![&(0, 5), &(0, 4), &(0, 3)]);
        // The next scan position is the instruction after the 3-long window.
        assert!(!attempts.iter().any(|(start, _)| *start == 2 || *start == 4));
        assert!(attempts.iter().any(|(start, _)| *start == 6));
    }

    #[test]
    fn test_window_length_limited_by_policy_and_chunk_end() {
        let instructions = pad(Vec::new(), BUNDLE_SIZE);
        let patterns = StubPatterns::default();
        run(Bitness::Bits32, instructions, &patterns);

        let attempts = patterns.attempts.borrow();
        assert!(attempts.iter().all(|(_, length)| *length == 2));
        assert!(!attempts.iter().any(|(start, _)| *start == BUNDLE_SIZE - 1));
    }

    #[test]
    fn test_64bit_condition_propagates() {
        let instructions = pad(layout(&[("zext", 2), ("load", 4)]), BUNDLE_SIZE);
        assert!(run(Bitness::Bits64, instructions, &StubPatterns::default()).is_empty());

        let instructions = pad(layout(&[("ok", 2), ("load", 4)]), BUNDLE_SIZE);
        assert_eq!(
            run(Bitness::Bits64, instructions, &StubPatterns::default()),
            vec![(
                2,
                "sandboxing violation: %rax is not zero-extended".to_string()
            )]
        );
    }

    #[test]
    fn test_condition_does_not_survive_intervening_instruction() {
        let instructions = pad(layout(&[("zext", 2), ("ok", 1), ("load", 4)]), BUNDLE_SIZE);
        assert_eq!(
            run(Bitness::Bits64, instructions, &StubPatterns::default()),
            vec![(
                3,
                "sandboxing violation: %rax is not zero-extended".to_string()
            )]
        );
    }

    #[test]
    fn test_unrecognized_instruction_resets_condition() {
        let instructions = pad(layout(&[("zext", 2), ("bogus", 1), ("load", 4)]), BUNDLE_SIZE);
        let diagnostics = run(Bitness::Bits64, instructions, &StubPatterns::default());
        assert_eq!(diagnostics.len(), 2);
        assert_eq!(diagnostics[0], (2, "unrecognized instruction bogus".to_string()));
        assert_eq!(diagnostics[1].0, 3);
    }

    #[test]
    fn test_violation_resets_condition_and_continues() {
        let instructions = pad(
            layout(&[("zext", 2), ("unsafe", 1), ("zext", 2), ("load", 4)]),
            BUNDLE_SIZE,
        );
        assert_eq!(
            run(Bitness::Bits64, instructions, &StubPatterns::default()),
            vec![(2, "sandboxing violation: stub violation".to_string())]
        );
    }

    #[test]
    fn test_obligation_at_bundle_edge_is_violation() {
        let mut instructions = pad(Vec::new(), 28);
        instructions.push(DecodedInstruction::new(28, 4, "pin"));
        let instructions = pad(instructions, 2 * BUNDLE_SIZE);

        assert_eq!(
            run(Bitness::Bits64, instructions, &StubPatterns::default()),
            vec![(
                28,
                "sandboxing violation: %rsp must be sandboxed with %r15".to_string()
            )]
        );
    }

    #[test]
    fn test_superinstruction_needs_default_condition() {
        let instructions = pad(layout(&[("pin", 2), ("ok", 2), ("ok", 2)]), BUNDLE_SIZE);
        let patterns = StubPatterns::with_superinstructions(&[(2, 2)]);
        let diagnostics = run(Bitness::Bits64, instructions, &patterns);

        assert_eq!(
            diagnostics,
            vec![(
                2,
                "sandboxing violation: %rsp must be sandboxed with %r15".to_string()
            )]
        );
    }

    #[test]
    fn test_jump_is_not_recorded_after_violation() {
        let instructions = pad(
            vec![
                DecodedInstruction::new(0, 2, "pin"),
                jump(2, 2, 5),
                DecodedInstruction::new(4, 4, "ok"),
            ],
            BUNDLE_SIZE,
        );
        let diagnostics = run(Bitness::Bits64, instructions, &StubPatterns::default());
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].0, 2);
    }

    #[test]
    #[should_panic(expected = "32-bit rule produced conditions")]
    fn test_32bit_rule_table_conditions_panic() {
        let instructions = pad(layout(&[("zext", 2)]), BUNDLE_SIZE);
        let code = [0u8; BUNDLE_SIZE];
        let patterns = StubPatterns::default();
        Validator::with_collaborators(
            &code,
            &Validator32Policy,
            StubDecoder(Ok(instructions)),
            &patterns,
        )
        .validate();
    }

    #[test]
    fn test_crosses_bundle() {
        assert!(!crosses_bundle(0, 32));
        assert!(crosses_bundle(31, 33));
        assert!(!crosses_bundle(32, 33));
        assert!(crosses_bundle(28, 34));
    }
}
