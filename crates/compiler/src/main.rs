//! cc1: C compiler front end and code generator.
//!
//! Reads preprocessed translation units (files in order, or stdin when
//! none are given) and writes x86-64 assembly text to stdout or `-o`.
//! Exit code 1 when any diagnostic was reported; nothing is written in
//! that case.

use std::fs;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::process;

use clap::Parser as ClapParser;
use tracing_subscriber::EnvFilter;

use micac::{CompileError, Compiler};

#[derive(ClapParser)]
#[command(name = "cc1")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "C compiler front end - compile preprocessed C to x86-64 assembly", long_about = None)]
struct Cli {
    /// Input files (preprocessed C); stdin when omitted
    files: Vec<PathBuf>,

    /// Write assembly to a file instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let mut compiler = Compiler::new();

    let result = if cli.files.is_empty() {
        let mut source = String::new();
        match io::stdin().read_to_string(&mut source) {
            Ok(_) => compiler.add_source(&source, "*stdin*"),
            Err(e) => {
                eprintln!("cc1: cannot read stdin: {}", e);
                process::exit(1);
            }
        }
    } else {
        let mut result = Ok(());
        for path in &cli.files {
            let source = match fs::read_to_string(path) {
                Ok(source) => source,
                Err(e) => {
                    eprintln!("cc1: cannot open file: {}: {}", path.display(), e);
                    process::exit(1);
                }
            };
            result = compiler.add_source(&source, &path.display().to_string());
            if result.is_err() {
                break;
            }
        }
        result
    };

    if let Err(e) = result {
        report_and_exit(e);
    }

    match compiler.finish() {
        Ok(asm) => {
            let write_result = match &cli.output {
                Some(path) => fs::write(path, asm.as_bytes()),
                None => io::stdout().write_all(asm.as_bytes()),
            };
            if let Err(e) = write_result {
                eprintln!("cc1: cannot write output: {}", e);
                process::exit(1);
            }
        }
        Err(e) => report_and_exit(e),
    }
}

fn report_and_exit(e: CompileError) -> ! {
    match e {
        // Diagnostics were already printed as they were found.
        CompileError::Fatal | CompileError::HasErrors(_) => {}
        other => eprintln!("cc1: {}", other),
    }
    process::exit(1);
}
