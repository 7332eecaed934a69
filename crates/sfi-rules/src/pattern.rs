// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Pattern matching interface between the validator and the rule table

use std::fmt;

use crate::{DecodedInstruction, condition::Condition, regular, superinstruction};

/// Processor mode the code runs in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Bitness {
    Bits32,
    Bits64,
}

impl Bitness {
    pub fn bits(self) -> u32 {
        match self {
            Bitness::Bits32 => 32,
            Bitness::Bits64 => 64,
        }
    }
}

impl fmt::Display for Bitness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-bit", self.bits())
    }
}

/// Outcome of matching an instruction or instruction window against the rules
///
/// `NoMatch` and `Violation` are both expected outcomes: the former means
/// "not this pattern, try something else", the latter means the pattern was
/// recognized but is unsafe as written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Match<T> {
    Matched(T),
    NoMatch,
    Violation(String),
}

impl<T> Match<T> {
    /// Keep `self` unless it is `NoMatch`, in which case evaluate `other`
    pub fn or_else(self, other: impl FnOnce() -> Match<T>) -> Match<T> {
        match self {
            Match::NoMatch => other(),
            matched_or_violation => matched_or_violation,
        }
    }
}

/// What an accepted single instruction requires and provides
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InstructionInfo {
    /// Destination of a direct jump, relative to the chunk start
    pub jump_target: Option<i64>,
    /// Condition that must hold before the instruction
    pub precondition: Condition,
    /// Condition established by the instruction
    pub postcondition: Condition,
}

impl InstructionInfo {
    pub fn jump(target: i64) -> Self {
        Self {
            jump_target: Some(target),
            ..Self::default()
        }
    }

    pub fn conditions(precondition: Condition, postcondition: Condition) -> Self {
        Self {
            jump_target: None,
            precondition,
            postcondition,
        }
    }
}

/// Rule table consulted by the validator
///
/// Implementations must be pure: the validator may ask about the same window
/// more than once across runs and relies on identical answers.
pub trait PatternSpec {
    /// Check whether `window` (at least two instructions) is one atomic
    /// sandboxing idiom. Superinstructions require and leave the default
    /// condition.
    fn validate_superinstruction(
        &self,
        window: &[DecodedInstruction],
        bitness: Bitness,
    ) -> Match<()>;

    /// Check a single instruction on its own
    fn validate_instruction(
        &self,
        instruction: &DecodedInstruction,
        bitness: Bitness,
    ) -> Match<InstructionInfo>;
}

/// The production x86 sandboxing rules
#[derive(Debug, Clone, Copy, Default)]
pub struct SandboxRules;

impl PatternSpec for SandboxRules {
    fn validate_superinstruction(
        &self,
        window: &[DecodedInstruction],
        bitness: Bitness,
    ) -> Match<()> {
        superinstruction::validate(window, bitness)
    }

    fn validate_instruction(
        &self,
        instruction: &DecodedInstruction,
        bitness: Bitness,
    ) -> Match<InstructionInfo> {
        regular::validate(instruction, bitness)
    }
}
