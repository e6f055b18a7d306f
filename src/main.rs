use std::path::{Path, PathBuf};
use std::process;

use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, fmt};

use cinder::bytecode::debug::DebugInfo;
use cinder::bytecode::disasm::disassemble;
use cinder::driver::{self, DriverError};
use cinder::runtime::prelude;
use cinder::{Program, VmConfig};

#[derive(Parser, Debug)]
#[command(name = "cinder")]
#[command(about = "Compile and run Cinder programs")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Compile a source file to a linked binary (plus `<out>.dbg`)
    Compile {
        file: PathBuf,
        #[arg(short = 'o', long = "output")]
        output: PathBuf,
        #[arg(long, default_value = "main")]
        entry: String,
    },
    /// Run a source file or a compiled binary and print the entry's result
    Run {
        file: PathBuf,
        #[arg(long, default_value = "main")]
        entry: String,
        #[arg(long = "stack-size")]
        stack_size: Option<u32>,
        #[arg(long = "max-steps")]
        max_steps: Option<u64>,
    },
    /// Print the disassembly of a source file or a compiled binary
    Disasm {
        file: PathBuf,
        #[arg(long, default_value = "main")]
        entry: String,
    },
    /// Dump the token stream of a source file
    Tokens {
        file: PathBuf,
        #[arg(long = "no-color")]
        no_color: bool,
    },
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    init_logging();

    let cli = Cli::parse();
    if let Err(e) = execute(cli.command) {
        println!("{}", e);
        process::exit(1);
    }
}

fn execute(command: Command) -> Result<(), DriverError> {
    match command {
        Command::Compile {
            file,
            output,
            entry,
        } => {
            let build = build(&file, &entry)?;
            driver::write_artifact(&build.compiled, &output)?;
        }
        Command::Run {
            file,
            entry,
            stack_size,
            max_steps,
        } => {
            let (program, debug) = load(&file, &entry)?;
            let mut config = VmConfig {
                max_steps,
                ..VmConfig::default()
            };
            if let Some(size) = stack_size {
                config.stack_size = size;
            }
            let natives = prelude::stdout_registry();
            let outcome = driver::run_program(&program, debug.as_ref(), &natives, config)?;
            println!("{}", outcome);
        }
        Command::Disasm { file, entry } => {
            let (program, debug) = load(&file, &entry)?;
            print!("{}", disassemble(&program, debug.as_ref())?);
        }
        Command::Tokens { file, no_color } => {
            let source = driver::read_source(&file)?;
            print!(
                "{}",
                driver::dump_tokens(&file.display().to_string(), &source, !no_color)
            );
        }
    }
    Ok(())
}

/// Compiles `file`, printing warnings.
fn build(file: &Path, entry: &str) -> Result<driver::Build, DriverError> {
    let build = driver::compile_file(file, entry)?;
    if !build.warnings.is_empty() {
        println!("{}", build.warnings);
    }
    Ok(build)
}

fn load(file: &Path, entry: &str) -> Result<(Program, Option<DebugInfo>), DriverError> {
    if driver::is_source(file) {
        let build = build(file, entry)?;
        Ok((build.compiled.program, Some(build.compiled.debug)))
    } else {
        driver::read_artifact(file)
    }
}
