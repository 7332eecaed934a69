// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Software-fault-isolation validator for x86 code chunks
//!
//! Confirms that a chunk of machine code follows the sandboxing discipline
//! described in [`sfi_rules`]: every instruction is either safe on its own or
//! part of a vetted superinstruction, and every direct jump lands on an
//! instruction or bundle start.
//!
//! # Validation Checklist
//!
//! | Check | Description |
//! |-------|-------------|
//! | **Chunk size** | Length must be a multiple of the bundle size |
//! | **Decoding** | Every byte must belong to a decodable instruction |
//! | **Instruction rules** | Each unit matches a superinstruction or a single-instruction rule |
//! | **Conditions** (64-bit) | Each unit's precondition holds; nothing pending at a bundle edge |
//! | **Bundle crossing** | Reported, but the unit is still accepted |
//! | **Jump targets** | Direct jumps land on an instruction start or a bundle start |
//!
//! # Example
//!
//! ```
//! use sfi_rules::Bitness;
//! use sfi_validator::Validator;
//!
//! // mov eax, eax; mov ecx, [r15 + rax]; nop padding
//! let mut code = vec![0x89, 0xc0, 0x41, 0x8b, 0x0c, 0x07];
//! code.resize(32, 0x90);
//!
//! let result = Validator::new(&code, Bitness::Bits64).validate();
//! assert!(result.is_ok(), "{:?}", result.diagnostics());
//! ```

mod decode;
mod error;
mod policy;
mod validate;

pub use decode::{InstructionDecoder, X86Decoder};
pub use error::{DecodeError, ValidationError, ValidationResult};
pub use policy::{ArchPolicy, Validator32Policy, Validator64Policy, policy_for};
pub use validate::Validator;

pub use sfi_rules::{BUNDLE_SIZE, Bitness};
