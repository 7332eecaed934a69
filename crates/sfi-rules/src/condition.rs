// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Standing assumptions about machine state between instructions
//!
//! In 64-bit mode some instructions establish facts the next instruction may
//! rely on instead of re-establishing them itself. Two kinds are tracked:
//!
//! - **restricted**: the upper 32 bits of a register are known to be zero,
//!   because a zero-extending 32-bit write just happened. A following memory
//!   access may use that register as an index next to `%r15`. This is a
//!   guarantee: dropping it is always safe.
//! - **restricted instead of sandboxed**: `%rsp` or `%rbp` was written through
//!   its 32-bit alias and has to be rebased with `add %r15` before any other
//!   instruction runs. This is an obligation: it must be discharged exactly.
//!
//! [`Condition::default`] is "no standing assumptions".

use std::fmt;

use crate::register::Gpr;

/// Set of standing assumptions, see the module documentation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Condition {
    restricted: Option<Gpr>,
    restricted_instead_of_sandboxed: Option<Gpr>,
}

impl Condition {
    /// The upper half of `register` is known to be zero
    pub fn restricted(register: Gpr) -> Self {
        Self {
            restricted: Some(register),
            restricted_instead_of_sandboxed: None,
        }
    }

    /// `register` (`%rsp` or `%rbp`) still needs `add %r15`
    pub fn restricted_instead_of_sandboxed(register: Gpr) -> Self {
        Self {
            restricted: None,
            restricted_instead_of_sandboxed: Some(register),
        }
    }

    pub fn unsandboxed_register(&self) -> Option<Gpr> {
        self.restricted_instead_of_sandboxed
    }

    pub fn is_default(&self) -> bool {
        *self == Self::default()
    }

    /// Whether every assumption `other` needs holds under `self`
    ///
    /// Zero-extension guarantees may be dropped, sandboxing obligations may
    /// not: `restricted(rax)` implies the default condition, while
    /// `restricted_instead_of_sandboxed(rsp)` implies nothing but itself.
    pub fn implies(&self, other: &Condition) -> bool {
        let restricted_ok = other.restricted.is_none() || self.restricted == other.restricted;
        restricted_ok
            && self.restricted_instead_of_sandboxed == other.restricted_instead_of_sandboxed
    }

    /// Human-readable explanation of why `self` does not imply `other`
    ///
    /// Only meaningful when `self.implies(other)` is false.
    pub fn why_not_implies(&self, other: &Condition) -> String {
        match (
            self.restricted_instead_of_sandboxed,
            other.restricted_instead_of_sandboxed,
        ) {
            (Some(have), None) => return format!("{have} must be sandboxed with %r15"),
            (None, Some(want)) => return format!("{want} is not restricted"),
            (Some(have), Some(want)) if have != want => {
                return format!("{have} must be sandboxed with %r15 before {want} is restricted");
            }
            _ => {}
        }
        match (self.restricted, other.restricted) {
            (_, None) => format!("{self} implies {other}"),
            (None, Some(want)) => format!("{want} is not zero-extended"),
            (Some(have), Some(want)) => {
                format!("{want} is not zero-extended ({have} is zero-extended instead)")
            }
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.restricted, self.restricted_instead_of_sandboxed) {
            (None, None) => write!(f, "default"),
            (Some(r), None) => write!(f, "restricted({r})"),
            (None, Some(r)) => write!(f, "restricted_instead_of_sandboxed({r})"),
            (Some(r), Some(s)) => {
                write!(f, "restricted({r}), restricted_instead_of_sandboxed({s})")
            }
        }
    }
}
