// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Per-architecture validation policy
//!
//! The scan engine is shared between 32-bit and 64-bit code. What differs is
//! the longest superinstruction worth trying and how standing conditions are
//! carried from one accepted unit to the next.

use sfi_rules::{BUNDLE_SIZE, Bitness, Condition};

/// Architecture-specific part of the validator
pub trait ArchPolicy {
    fn bitness(&self) -> Bitness;

    /// Longest instruction window tried as a superinstruction
    fn max_superinstruction_length(&self) -> usize;

    /// Check a unit's conditions against the current one and advance it
    ///
    /// `unit_end` is the offset just past the unit. On failure `current` is
    /// left untouched and the message explains the violation.
    fn check_conditions(
        &self,
        current: &mut Condition,
        unit_end: usize,
        precondition: &Condition,
        postcondition: &Condition,
    ) -> Result<(), String>;
}

/// 32-bit code keeps no standing conditions
#[derive(Debug, Default, Clone, Copy)]
pub struct Validator32Policy;

impl ArchPolicy for Validator32Policy {
    fn bitness(&self) -> Bitness {
        Bitness::Bits32
    }

    fn max_superinstruction_length(&self) -> usize {
        2
    }

    fn check_conditions(
        &self,
        current: &mut Condition,
        _unit_end: usize,
        precondition: &Condition,
        postcondition: &Condition,
    ) -> Result<(), String> {
        assert!(
            precondition.is_default() && postcondition.is_default(),
            "32-bit rule produced conditions {precondition} -> {postcondition}"
        );
        assert!(current.is_default(), "32-bit scan carried {current}");
        Ok(())
    }
}

/// 64-bit code carries zero-extension guarantees and stack rebasing
/// obligations between instructions, never across a bundle boundary
#[derive(Debug, Default, Clone, Copy)]
pub struct Validator64Policy;

impl ArchPolicy for Validator64Policy {
    fn bitness(&self) -> Bitness {
        Bitness::Bits64
    }

    fn max_superinstruction_length(&self) -> usize {
        5
    }

    fn check_conditions(
        &self,
        current: &mut Condition,
        unit_end: usize,
        precondition: &Condition,
        postcondition: &Condition,
    ) -> Result<(), String> {
        if !current.implies(precondition) {
            return Err(current.why_not_implies(precondition));
        }

        if unit_end.is_multiple_of(BUNDLE_SIZE) {
            let default = Condition::default();
            if !postcondition.implies(&default) {
                return Err(postcondition.why_not_implies(&default));
            }
            *current = default;
        } else {
            *current = *postcondition;
        }
        Ok(())
    }
}

/// Policy for the given processor mode
pub fn policy_for(bitness: Bitness) -> &'static dyn ArchPolicy {
    match bitness {
        Bitness::Bits32 => &Validator32Policy,
        Bitness::Bits64 => &Validator64Policy,
    }
}
