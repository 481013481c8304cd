//! Emulator front end.
//!
//! `emu <path-to-elf>` loads a static x86-64 Linux executable into the
//! emulated address space and runs it to completion. The process exits 0
//! on a clean run; guest exits and diagnostics go to stderr with the
//! `[LEVEL]` prefix.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};

use emu_core::Core;
use emu_core::backend::BackendKind;
use emu_log::LogLevel;

/// Backend selection on the command line.
#[derive(Debug, Clone, Copy, ValueEnum)]
enum BackendChoice {
    /// IR-walking interpreter (default).
    Interpreter,
    /// Native code generation.
    Jit,
    /// Stub backend; everything runs on the reference interpreter.
    Aarch64,
}

impl From<BackendChoice> for BackendKind {
    fn from(choice: BackendChoice) -> Self {
        match choice {
            BackendChoice::Interpreter => BackendKind::Interpreter,
            BackendChoice::Jit => BackendKind::Jit,
            BackendChoice::Aarch64 => BackendKind::AArch64,
        }
    }
}

/// User-space x86-64 Linux binary emulator.
#[derive(Parser)]
#[command(name = "emu", version, about)]
struct Cli {
    /// Path to the guest ELF executable.
    elf: PathBuf,

    /// Code-generation backend.
    #[arg(long, value_enum, default_value = "interpreter")]
    backend: BackendChoice,

    /// Show debug-level emulator output.
    #[arg(short, long)]
    verbose: bool,

    /// Arguments for the guest (recorded; the initial process image is
    /// the fixed bring-up shape).
    #[arg(trailing_var_arg = true)]
    args: Vec<String>,
}

static VERBOSE: AtomicBool = AtomicBool::new(false);

fn message_handler(level: LogLevel, message: &str) {
    if level == LogLevel::Debug && !VERBOSE.load(Ordering::Relaxed) {
        return;
    }
    eprintln!("[{level}] {message}");
}

fn assert_handler(message: &str) {
    eprintln!("[ASSERT] {message}");
}

fn main() -> Result<()> {
    emu_log::install_msg_handler(message_handler);
    emu_log::install_assert_handler(assert_handler);

    let cli = Cli::parse();
    VERBOSE.store(cli.verbose, Ordering::Relaxed);

    let core = Core::new(cli.backend.into()).context("emulator setup failed")?;
    core.load(&cli.elf, &cli.args)
        .with_context(|| format!("could not load {}", cli.elf.display()))?;
    core.run();
    Ok(())
}
