// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Sandboxing rules for x86 machine code
//!
//! Describes which instructions and instruction sequences may appear in
//! software-fault-isolated x86 code. The validator consumes these rules
//! through the [`PatternSpec`] trait and never inspects encodings itself.
//!
//! # Rules
//!
//! | Rule | 32-bit | 64-bit |
//! |------|--------|--------|
//! | **Opcode whitelist** | yes | yes |
//! | **Direct calls end at a bundle boundary** | yes | yes |
//! | **Indirect jumps masked to a bundle** | `and; jmp` | `and; add %r15; jmp` |
//! | **Memory addressed from `%r15`/`%rsp`/`%rbp`/`%rip`** | - | yes |
//! | **Index registers zero-extended first** | - | yes |
//! | **`%r15` read-only** | - | yes |
//! | **`%rsp`/`%rbp` rebased after 32-bit writes** | - | yes |
//! | **String operations sandboxed** | - | yes |
//!
//! Code is split into bundles of [`BUNDLE_SIZE`] bytes. Indirect jumps may
//! only land on bundle starts, so no instruction or sandboxing sequence may
//! straddle a bundle boundary.

mod condition;
mod instruction;
mod pattern;
mod register;
mod regular;
mod superinstruction;
mod x86;

pub use condition::Condition;
pub use instruction::{DecodedInstruction, Memory, Operand, Prefixes};
pub use pattern::{Bitness, InstructionInfo, Match, PatternSpec, SandboxRules};
pub use register::{Gpr, Register, Width};
pub use x86::{CheckResult, ClassifiedOpcode, Flow, RejectionReason, Writes};

/// Size of an aligned code bundle in bytes
pub const BUNDLE_SIZE: usize = 32;
