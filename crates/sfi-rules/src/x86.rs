// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! x86 opcode classification
//!
//! Single source of truth for which mnemonics may appear in sandboxed code,
//! how they transfer control, and which of their operands they write. Both
//! the 32-bit and 64-bit rules consult this table; mode-specific operand
//! restrictions live in [`crate::regular`].
//!
//! Mnemonics are the lowercase names printed by the disassembler. Anything
//! missing from the table is unknown and therefore not accepted.

use std::collections::HashMap;

use lazy_static::lazy_static;

/// Result of checking an opcode against the whitelist
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckResult {
    /// Instruction is allowed (subject to operand rules)
    Allowed,
    /// Instruction is rejected with a reason
    Rejected(RejectionReason),
}

/// Reason an opcode is rejected on its own
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectionReason {
    /// Enters the kernel or another privilege level
    System,
    /// Software interrupt or interrupt return
    Interrupt,
    /// `ret` pops an unverifiable target
    Return,
    /// Far transfer through a segment selector
    FarTransfer,
    /// Port I/O
    Io,
    /// Segment register load
    SegmentLoad,
    /// String operation; only valid inside a sandboxing superinstruction
    StringOperation,
}

impl std::fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectionReason::System => write!(f, "system instruction"),
            RejectionReason::Interrupt => write!(f, "interrupt instruction"),
            RejectionReason::Return => write!(f, "return instruction"),
            RejectionReason::FarTransfer => write!(f, "far control transfer"),
            RejectionReason::Io => write!(f, "port I/O instruction"),
            RejectionReason::SegmentLoad => write!(f, "segment register load"),
            RejectionReason::StringOperation => write!(f, "unsandboxed string operation"),
        }
    }
}

/// How an instruction transfers control
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Sequential,
    /// Conditional or unconditional jump
    Jump,
    Call,
}

/// Which explicit operands an instruction writes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Writes {
    /// Only reads its operands (`cmp`, `test`, `push`, `mul`)
    Nothing,
    /// Writes operand 0
    Destination,
    /// Writes operand 0 only in its two- and three-operand forms (`imul`)
    DestinationIfBinary,
    /// Writes operands 0 and 1 (`xchg`, `xadd`)
    Both,
    /// Implicitly rewrites `rsp` and `rbp` (`leave`, `enter`)
    FramePointer,
}

/// Classification of an x86 mnemonic
#[derive(Debug)]
pub struct ClassifiedOpcode {
    /// The mnemonic string (e.g., "add", "jz")
    pub mnemonic: &'static str,
    /// Control flow kind
    pub flow: Flow,
    /// Which operands are written
    pub writes: Writes,
    /// Whether a 32-bit register destination clears the upper half of its
    /// 64-bit register
    pub zero_extends: bool,
    /// Whether memory operands are dereferenced (false for `lea`, `nop`)
    pub accesses_memory: bool,
    /// Verification result
    pub check_result: CheckResult,
}

impl ClassifiedOpcode {
    const fn allowed(mnemonic: &'static str) -> Self {
        Self {
            mnemonic,
            flow: Flow::Sequential,
            writes: Writes::Destination,
            zero_extends: true,
            accesses_memory: true,
            check_result: CheckResult::Allowed,
        }
    }

    const fn read_only(mnemonic: &'static str) -> Self {
        Self {
            writes: Writes::Nothing,
            ..Self::allowed(mnemonic)
        }
    }

    const fn exchange(mnemonic: &'static str) -> Self {
        Self {
            writes: Writes::Both,
            ..Self::allowed(mnemonic)
        }
    }

    const fn address(mnemonic: &'static str) -> Self {
        Self {
            accesses_memory: false,
            ..Self::allowed(mnemonic)
        }
    }

    const fn hint(mnemonic: &'static str) -> Self {
        Self {
            writes: Writes::Nothing,
            accesses_memory: false,
            ..Self::allowed(mnemonic)
        }
    }

    const fn jump(mnemonic: &'static str) -> Self {
        Self {
            flow: Flow::Jump,
            ..Self::read_only(mnemonic)
        }
    }

    const fn call(mnemonic: &'static str) -> Self {
        Self {
            flow: Flow::Call,
            ..Self::read_only(mnemonic)
        }
    }

    const fn rejected(mnemonic: &'static str, reason: RejectionReason) -> Self {
        Self {
            check_result: CheckResult::Rejected(reason),
            ..Self::read_only(mnemonic)
        }
    }

    const fn keeps_upper_bits(self) -> Self {
        Self {
            zero_extends: false,
            ..self
        }
    }

    const fn writes(self, writes: Writes) -> Self {
        Self { writes, ..self }
    }

    /// Any control transfer (jump or call)
    pub fn is_branch(&self) -> bool {
        self.flow != Flow::Sequential
    }

    pub fn is_call(&self) -> bool {
        self.flow == Flow::Call
    }

    pub fn is_allowed(&self) -> bool {
        self.check_result == CheckResult::Allowed
    }

    pub fn rejection_reason(&self) -> Option<RejectionReason> {
        match self.check_result {
            CheckResult::Allowed => None,
            CheckResult::Rejected(reason) => Some(reason),
        }
    }

    /// Classify by mnemonic string
    ///
    /// Returns None for unknown mnemonics.
    pub fn from_mnemonic(mnemonic: &str) -> Option<&'static Self> {
        BY_MNEMONIC
            .get(mnemonic.to_ascii_lowercase().as_str())
            .copied()
    }
}

/// Single source of truth: all classified opcodes
const OPCODE_TABLE: &[ClassifiedOpcode] = &[
    // Integer arithmetic
    ClassifiedOpcode::allowed("add"),
    ClassifiedOpcode::allowed("adc"),
    ClassifiedOpcode::allowed("sub"),
    ClassifiedOpcode::allowed("sbb"),
    ClassifiedOpcode::allowed("inc"),
    ClassifiedOpcode::allowed("dec"),
    ClassifiedOpcode::allowed("neg"),
    ClassifiedOpcode::allowed("imul").writes(Writes::DestinationIfBinary),
    ClassifiedOpcode::read_only("mul"),
    ClassifiedOpcode::read_only("div"),
    ClassifiedOpcode::read_only("idiv"),
    ClassifiedOpcode::read_only("cmp"),
    ClassifiedOpcode::read_only("cbw"),
    ClassifiedOpcode::read_only("cwde"),
    ClassifiedOpcode::read_only("cdqe"),
    ClassifiedOpcode::read_only("cwd"),
    ClassifiedOpcode::read_only("cdq"),
    ClassifiedOpcode::read_only("cqo"),
    // Logic
    ClassifiedOpcode::allowed("and"),
    ClassifiedOpcode::allowed("or"),
    ClassifiedOpcode::allowed("xor"),
    ClassifiedOpcode::allowed("not"),
    ClassifiedOpcode::read_only("test"),
    // Shifts and rotates
    ClassifiedOpcode::allowed("shl"),
    ClassifiedOpcode::allowed("sal"),
    ClassifiedOpcode::allowed("shr"),
    ClassifiedOpcode::allowed("sar"),
    ClassifiedOpcode::allowed("rol"),
    ClassifiedOpcode::allowed("ror"),
    ClassifiedOpcode::allowed("rcl"),
    ClassifiedOpcode::allowed("rcr"),
    ClassifiedOpcode::allowed("shld"),
    ClassifiedOpcode::allowed("shrd"),
    // Bit manipulation
    ClassifiedOpcode::read_only("bt"),
    ClassifiedOpcode::allowed("bts"),
    ClassifiedOpcode::allowed("btr"),
    ClassifiedOpcode::allowed("btc"),
    // bsf/bsr leave the destination untouched on zero input
    ClassifiedOpcode::allowed("bsf").keeps_upper_bits(),
    ClassifiedOpcode::allowed("bsr").keeps_upper_bits(),
    ClassifiedOpcode::allowed("bswap"),
    ClassifiedOpcode::allowed("popcnt"),
    ClassifiedOpcode::allowed("lzcnt"),
    ClassifiedOpcode::allowed("tzcnt"),
    // Data movement
    ClassifiedOpcode::allowed("mov"),
    ClassifiedOpcode::allowed("movzx"),
    ClassifiedOpcode::allowed("movsx"),
    ClassifiedOpcode::allowed("movsxd"),
    ClassifiedOpcode::allowed("movbe"),
    ClassifiedOpcode::address("lea"),
    ClassifiedOpcode::exchange("xchg"),
    ClassifiedOpcode::exchange("xadd"),
    ClassifiedOpcode::allowed("cmpxchg"),
    ClassifiedOpcode::read_only("push"),
    ClassifiedOpcode::allowed("pop"),
    ClassifiedOpcode::read_only("leave").writes(Writes::FramePointer),
    ClassifiedOpcode::read_only("enter").writes(Writes::FramePointer),
    // Conditional moves
    ClassifiedOpcode::allowed("cmovo"),
    ClassifiedOpcode::allowed("cmovno"),
    ClassifiedOpcode::allowed("cmovb"),
    ClassifiedOpcode::allowed("cmovnb"),
    ClassifiedOpcode::allowed("cmovz"),
    ClassifiedOpcode::allowed("cmovnz"),
    ClassifiedOpcode::allowed("cmovna"),
    ClassifiedOpcode::allowed("cmova"),
    ClassifiedOpcode::allowed("cmovs"),
    ClassifiedOpcode::allowed("cmovns"),
    ClassifiedOpcode::allowed("cmovp"),
    ClassifiedOpcode::allowed("cmovnp"),
    ClassifiedOpcode::allowed("cmovl"),
    ClassifiedOpcode::allowed("cmovge"),
    ClassifiedOpcode::allowed("cmovle"),
    ClassifiedOpcode::allowed("cmovg"),
    // Conditional sets
    ClassifiedOpcode::allowed("seto"),
    ClassifiedOpcode::allowed("setno"),
    ClassifiedOpcode::allowed("setb"),
    ClassifiedOpcode::allowed("setae"),
    ClassifiedOpcode::allowed("setz"),
    ClassifiedOpcode::allowed("setnz"),
    ClassifiedOpcode::allowed("setbe"),
    ClassifiedOpcode::allowed("seta"),
    ClassifiedOpcode::allowed("sets"),
    ClassifiedOpcode::allowed("setns"),
    ClassifiedOpcode::allowed("setp"),
    ClassifiedOpcode::allowed("setnp"),
    ClassifiedOpcode::allowed("setl"),
    ClassifiedOpcode::allowed("setge"),
    ClassifiedOpcode::allowed("setle"),
    ClassifiedOpcode::allowed("setg"),
    // Flags and harmless system state
    ClassifiedOpcode::read_only("clc"),
    ClassifiedOpcode::read_only("stc"),
    ClassifiedOpcode::read_only("cmc"),
    ClassifiedOpcode::read_only("cld"),
    ClassifiedOpcode::read_only("std"),
    ClassifiedOpcode::read_only("lahf"),
    ClassifiedOpcode::read_only("sahf"),
    ClassifiedOpcode::read_only("pushf"),
    ClassifiedOpcode::read_only("popf"),
    ClassifiedOpcode::read_only("cpuid"),
    ClassifiedOpcode::read_only("rdtsc"),
    ClassifiedOpcode::read_only("pause"),
    ClassifiedOpcode::read_only("mfence"),
    ClassifiedOpcode::read_only("lfence"),
    ClassifiedOpcode::read_only("sfence"),
    // Padding and traps
    ClassifiedOpcode::hint("nop"),
    ClassifiedOpcode::read_only("hlt"),
    // SSE moves and arithmetic
    ClassifiedOpcode::allowed("movd"),
    ClassifiedOpcode::allowed("movq"),
    ClassifiedOpcode::allowed("movss"),
    ClassifiedOpcode::allowed("movsd"),
    ClassifiedOpcode::allowed("movaps"),
    ClassifiedOpcode::allowed("movups"),
    ClassifiedOpcode::allowed("movapd"),
    ClassifiedOpcode::allowed("movupd"),
    ClassifiedOpcode::allowed("movdqa"),
    ClassifiedOpcode::allowed("movdqu"),
    ClassifiedOpcode::allowed("addss"),
    ClassifiedOpcode::allowed("addsd"),
    ClassifiedOpcode::allowed("subss"),
    ClassifiedOpcode::allowed("subsd"),
    ClassifiedOpcode::allowed("mulss"),
    ClassifiedOpcode::allowed("mulsd"),
    ClassifiedOpcode::allowed("divss"),
    ClassifiedOpcode::allowed("divsd"),
    ClassifiedOpcode::allowed("sqrtsd"),
    ClassifiedOpcode::allowed("xorps"),
    ClassifiedOpcode::allowed("xorpd"),
    ClassifiedOpcode::allowed("pxor"),
    ClassifiedOpcode::allowed("paddd"),
    ClassifiedOpcode::allowed("psubd"),
    ClassifiedOpcode::read_only("ucomiss"),
    ClassifiedOpcode::read_only("ucomisd"),
    ClassifiedOpcode::read_only("comiss"),
    ClassifiedOpcode::read_only("comisd"),
    ClassifiedOpcode::allowed("cvtsi2ss"),
    ClassifiedOpcode::allowed("cvtsi2sd"),
    ClassifiedOpcode::allowed("cvttss2si"),
    ClassifiedOpcode::allowed("cvttsd2si"),
    ClassifiedOpcode::allowed("cvtss2sd"),
    ClassifiedOpcode::allowed("cvtsd2ss"),
    // Direct or register-indirect control transfer
    ClassifiedOpcode::jump("jmp"),
    ClassifiedOpcode::call("call"),
    ClassifiedOpcode::jump("jo"),
    ClassifiedOpcode::jump("jno"),
    ClassifiedOpcode::jump("jb"),
    ClassifiedOpcode::jump("jnb"),
    ClassifiedOpcode::jump("jae"),
    ClassifiedOpcode::jump("jz"),
    ClassifiedOpcode::jump("je"),
    ClassifiedOpcode::jump("jnz"),
    ClassifiedOpcode::jump("jne"),
    ClassifiedOpcode::jump("jna"),
    ClassifiedOpcode::jump("jbe"),
    ClassifiedOpcode::jump("ja"),
    ClassifiedOpcode::jump("js"),
    ClassifiedOpcode::jump("jns"),
    ClassifiedOpcode::jump("jp"),
    ClassifiedOpcode::jump("jnp"),
    ClassifiedOpcode::jump("jl"),
    ClassifiedOpcode::jump("jge"),
    ClassifiedOpcode::jump("jle"),
    ClassifiedOpcode::jump("jg"),
    // Rejected: string operations outside a sandboxing sequence
    ClassifiedOpcode::rejected("movs", RejectionReason::StringOperation),
    ClassifiedOpcode::rejected("cmps", RejectionReason::StringOperation),
    ClassifiedOpcode::rejected("stos", RejectionReason::StringOperation),
    ClassifiedOpcode::rejected("lods", RejectionReason::StringOperation),
    ClassifiedOpcode::rejected("scas", RejectionReason::StringOperation),
    // Rejected: returns and far transfers
    ClassifiedOpcode::rejected("ret", RejectionReason::Return),
    ClassifiedOpcode::rejected("retf", RejectionReason::Return),
    ClassifiedOpcode::rejected("jmpf", RejectionReason::FarTransfer),
    ClassifiedOpcode::rejected("callf", RejectionReason::FarTransfer),
    // Rejected: interrupts
    ClassifiedOpcode::rejected("int", RejectionReason::Interrupt),
    ClassifiedOpcode::rejected("int3", RejectionReason::Interrupt),
    ClassifiedOpcode::rejected("into", RejectionReason::Interrupt),
    ClassifiedOpcode::rejected("iret", RejectionReason::Interrupt),
    ClassifiedOpcode::rejected("iretd", RejectionReason::Interrupt),
    ClassifiedOpcode::rejected("iretq", RejectionReason::Interrupt),
    // Rejected: system instructions
    ClassifiedOpcode::rejected("syscall", RejectionReason::System),
    ClassifiedOpcode::rejected("sysret", RejectionReason::System),
    ClassifiedOpcode::rejected("sysenter", RejectionReason::System),
    ClassifiedOpcode::rejected("sysexit", RejectionReason::System),
    ClassifiedOpcode::rejected("cli", RejectionReason::System),
    ClassifiedOpcode::rejected("sti", RejectionReason::System),
    ClassifiedOpcode::rejected("clts", RejectionReason::System),
    ClassifiedOpcode::rejected("lgdt", RejectionReason::System),
    ClassifiedOpcode::rejected("lidt", RejectionReason::System),
    ClassifiedOpcode::rejected("lldt", RejectionReason::System),
    ClassifiedOpcode::rejected("ltr", RejectionReason::System),
    ClassifiedOpcode::rejected("sgdt", RejectionReason::System),
    ClassifiedOpcode::rejected("sidt", RejectionReason::System),
    ClassifiedOpcode::rejected("invd", RejectionReason::System),
    ClassifiedOpcode::rejected("wbinvd", RejectionReason::System),
    ClassifiedOpcode::rejected("invlpg", RejectionReason::System),
    ClassifiedOpcode::rejected("rdmsr", RejectionReason::System),
    ClassifiedOpcode::rejected("wrmsr", RejectionReason::System),
    ClassifiedOpcode::rejected("rdpmc", RejectionReason::System),
    ClassifiedOpcode::rejected("swapgs", RejectionReason::System),
    // Rejected: port I/O
    ClassifiedOpcode::rejected("in", RejectionReason::Io),
    ClassifiedOpcode::rejected("out", RejectionReason::Io),
    ClassifiedOpcode::rejected("ins", RejectionReason::Io),
    ClassifiedOpcode::rejected("outs", RejectionReason::Io),
    // Rejected: segment register loads
    ClassifiedOpcode::rejected("lds", RejectionReason::SegmentLoad),
    ClassifiedOpcode::rejected("les", RejectionReason::SegmentLoad),
    ClassifiedOpcode::rejected("lfs", RejectionReason::SegmentLoad),
    ClassifiedOpcode::rejected("lgs", RejectionReason::SegmentLoad),
    ClassifiedOpcode::rejected("lss", RejectionReason::SegmentLoad),
];

lazy_static! {
    /// Map from mnemonic string to ClassifiedOpcode
    pub static ref BY_MNEMONIC: HashMap<&'static str, &'static ClassifiedOpcode> = {
        OPCODE_TABLE.iter().map(|c| (c.mnemonic, c)).collect()
    };
}
