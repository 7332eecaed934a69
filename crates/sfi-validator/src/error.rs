// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Error types for chunk validation

use sfi_rules::BUNDLE_SIZE;
use thiserror::Error;

/// Errors that can occur during decoding
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("failed to decode instruction at offset {offset:#x}: {message}")]
    InvalidInstruction { offset: usize, message: String },
}

impl DecodeError {
    pub fn offset(&self) -> usize {
        match self {
            DecodeError::InvalidInstruction { offset, .. } => *offset,
        }
    }
}

/// Problems discovered while validating a chunk
///
/// `Display` renders the diagnostic message; the offset is reported
/// separately through [`ValidationError::offset`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("chunk size {size} is not a multiple of {}", BUNDLE_SIZE)]
    ChunkSizeNotAligned { size: usize },

    #[error("failed to decode instruction")]
    DecodeFailed {
        offset: usize,
        #[source]
        source: DecodeError,
    },

    #[error("superinstruction crosses bundle boundary")]
    SuperinstructionCrossesBundle { offset: usize },

    #[error("instruction crosses bundle boundary")]
    InstructionCrossesBundle { offset: usize },

    #[error("unrecognized instruction {disassembly}")]
    UnrecognizedInstruction { offset: usize, disassembly: String },

    #[error("sandboxing violation: {message}")]
    SandboxingViolation { offset: usize, message: String },

    #[error("jump into a middle of instruction")]
    JumpIntoInstruction { offset: usize, destination: i64 },
}

impl ValidationError {
    /// Chunk offset the diagnostic is attached to
    pub fn offset(&self) -> usize {
        match self {
            ValidationError::ChunkSizeNotAligned { .. } => 0,
            ValidationError::DecodeFailed { offset, .. }
            | ValidationError::SuperinstructionCrossesBundle { offset }
            | ValidationError::InstructionCrossesBundle { offset }
            | ValidationError::UnrecognizedInstruction { offset, .. }
            | ValidationError::SandboxingViolation { offset, .. }
            | ValidationError::JumpIntoInstruction { offset, .. } => *offset,
        }
    }

    /// True for the errors that stop the scan before any instruction is checked
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ValidationError::ChunkSizeNotAligned { .. } | ValidationError::DecodeFailed { .. }
        )
    }
}

/// Result of validation containing any errors found, in scan order
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ValidationResult {
    errors: Vec<ValidationError>,
}

impl ValidationResult {
    /// Returns true if validation passed with no errors
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    /// Returns the list of validation errors
    pub fn errors(&self) -> &[ValidationError] {
        &self.errors
    }

    /// Consumes the result and returns the errors
    pub fn into_errors(self) -> Vec<ValidationError> {
        self.errors
    }

    /// `(offset, message)` pairs, one per error
    pub fn diagnostics(&self) -> Vec<(usize, String)> {
        self.errors
            .iter()
            .map(|error| (error.offset(), error.to_string()))
            .collect()
    }

    pub(crate) fn push(&mut self, error: ValidationError) {
        self.errors.push(error);
    }
}
