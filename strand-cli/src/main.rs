//! The strand command line: compile and run a source file.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use strand_vm::{compile_source, std_registry, CompilerOptions, Executor, VmError};
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "strand", about = "The strand programming language", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Compile and run a source file.
    Run {
        /// Path to the source file.
        file: PathBuf,

        /// Skip the peephole optimizer.
        #[arg(long)]
        no_optimize: bool,

        /// Print the compiled instruction streams before running.
        #[arg(long)]
        disasm: bool,
    },
}

fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Run {
            file,
            no_optimize,
            disasm,
        } => run(file, !no_optimize, disasm),
    }
}

fn run(file: PathBuf, optimize: bool, disasm: bool) -> Result<ExitCode> {
    let source = std::fs::read_to_string(&file)
        .with_context(|| format!("failed to read {}", file.display()))?;
    let path = file.canonicalize().unwrap_or(file);

    let registry = Arc::new(std_registry());
    let options = CompilerOptions {
        optimize,
        global_entry: true,
    };
    let program = compile_source(&source, &registry, options, Some(path))?;
    debug!(
        constants = program.unit.constants.len(),
        functions = program.unit.protos.len(),
        "compiled"
    );

    if disasm {
        println!("; entry");
        print!("{}", strand_bytecode::disassemble(&program.entry.ops));
        for (i, proto) in program.unit.protos.iter().enumerate() {
            println!("; function {}", i);
            print!("{}", strand_bytecode::disassemble(&proto.ops));
        }
    }

    let executor = Executor::new(registry);
    match executor.run_main(&program) {
        Ok(value) if value.is_error() => {
            eprintln!("{}", value);
            Ok(ExitCode::FAILURE)
        }
        Ok(_) => Ok(ExitCode::SUCCESS),
        Err(VmError::Raise(error)) => {
            eprintln!("{}", error);
            Ok(ExitCode::FAILURE)
        }
        Err(VmError::Fault(msg)) => {
            eprintln!("fault: {}", msg);
            Ok(ExitCode::FAILURE)
        }
    }
}
