// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! CLI for sfi-validator
//!
//! Validates the code section of an x86 object file, or a raw code chunk,
//! printing one `offset: message` line per problem found.
//!
//! # Usage
//!
//! ```bash
//! # Validate the .text section of an object file
//! sfi-validator module.o
//!
//! # Validate a raw 32-bit chunk
//! sfi-validator --raw --bits 32 chunk.bin
//! ```
//!
//! Exits with 0 when the code is valid, 1 when problems were found and 2 when
//! the input could not be read.

use std::{fs, path::PathBuf, process::ExitCode};

use anyhow::{Context, Result, anyhow};
use clap::{Parser, ValueEnum};
use object::{Architecture, Object, ObjectSection};
use sfi_validator::{Bitness, Validator};
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Bits {
    #[value(name = "32")]
    Bits32,
    #[value(name = "64")]
    Bits64,
}

impl From<Bits> for Bitness {
    fn from(bits: Bits) -> Self {
        match bits {
            Bits::Bits32 => Bitness::Bits32,
            Bits::Bits64 => Bitness::Bits64,
        }
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "sfi-validator",
    version,
    about = "Validate sandboxed x86 machine code"
)]
struct Cli {
    /// Object file (or raw code with --raw)
    file: PathBuf,

    /// Processor mode, when the input does not say
    #[arg(long, value_enum)]
    bits: Option<Bits>,

    /// Treat the whole file as one code chunk
    #[arg(long)]
    raw: bool,

    /// Section to validate instead of .text
    #[arg(long, conflicts_with = "raw")]
    section: Option<String>,

    /// Log the scan at debug level
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(&cli) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(error) => {
            eprintln!("error: {error:#}");
            ExitCode::from(2)
        }
    }
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Validate the input, returning whether it is valid
fn run(cli: &Cli) -> Result<bool> {
    let data = fs::read(&cli.file)
        .with_context(|| format!("failed to read {}", cli.file.display()))?;
    let requested = cli.bits.map(Bitness::from);

    let result = if cli.raw {
        let bitness = requested.unwrap_or(Bitness::Bits64);
        debug!(size = data.len(), %bitness, "validating raw chunk");
        Validator::new(&data, bitness).validate()
    } else {
        let file = object::File::parse(&*data).context("failed to parse object file")?;

        let section = match &cli.section {
            Some(name) => file.section_by_name(name),
            None => file
                .section_by_name(".text") // ELF
                .or_else(|| file.section_by_name("__text")), // Mach-O
        }
        .ok_or_else(|| anyhow!("no code section found"))?;
        let code = section.data().context("failed to read code section")?;

        let bitness = match (architecture_bitness(file.architecture()), requested) {
            (Some(native), Some(requested)) if native != requested => {
                warn!(%native, %requested, "ignoring --bits for object file");
                native
            }
            (Some(native), _) => native,
            (None, requested) => requested.unwrap_or(Bitness::Bits64),
        };
        debug!(size = code.len(), %bitness, "validating code section");
        Validator::new(code, bitness).validate()
    };

    for (offset, message) in result.diagnostics() {
        println!("{offset:#x}: {message}");
    }
    Ok(result.is_ok())
}

fn architecture_bitness(architecture: Architecture) -> Option<Bitness> {
    match architecture {
        Architecture::I386 => Some(Bitness::Bits32),
        Architecture::X86_64 | Architecture::X86_64_X32 => Some(Bitness::Bits64),
        _ => None,
    }
}
