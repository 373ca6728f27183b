// File: src/main.rs
//
// Main entry point for the Ruff bytecode VM. Handles command-line argument
// parsing and dispatches to the `run` or `repl` subcommand. Exit codes
// follow the Unix sysexits convention spec.md §6 calls for: 0 success, 65
// compile error, 70 runtime error.

mod chunk;
mod compiler;
mod errors;
mod hashmap;
mod lexer;
mod memory;
mod natives;
mod value;
mod vm;

use clap::{Parser as ClapParser, Subcommand};
use std::fs;
use std::path::PathBuf;
use vm::{InterpretError, Vm};

const EXIT_COMPILE_ERROR: i32 = 65;
const EXIT_RUNTIME_ERROR: i32 = 70;

#[derive(ClapParser)]
#[command(
    name = "ruff",
    about = "Ruff: a small bytecode-compiled scripting language",
    version = env!("CARGO_PKG_VERSION"),
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
#[command(arg_required_else_help = true)]
enum Commands {
    /// Run a Ruff script file
    Run {
        /// Path to the script file
        file: PathBuf,
    },
    /// Launch the interactive Ruff REPL
    Repl,
}

fn main() {
    let cli = Cli::parse();
    match cli.command {
        Commands::Run { file } => run_file(&file),
        Commands::Repl => run_repl(),
    }
}

fn run_file(path: &PathBuf) {
    let source = match fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("could not read '{}': {}", path.display(), e);
            std::process::exit(EXIT_RUNTIME_ERROR);
        }
    };
    let mut vm = Vm::new();
    match vm.interpret(&source) {
        Ok(()) => {}
        Err(InterpretError::Compile(compile_errors)) => {
            for error in &compile_errors {
                eprintln!("{}", errors::format_compile_error(error));
            }
            std::process::exit(EXIT_COMPILE_ERROR);
        }
        Err(InterpretError::Runtime(runtime_error)) => {
            eprintln!("{}", errors::format_runtime_error(&runtime_error));
            std::process::exit(EXIT_RUNTIME_ERROR);
        }
    }
}

fn run_repl() {
    use rustyline::error::ReadlineError;
    use rustyline::DefaultEditor;

    let mut vm = Vm::new();
    let mut editor = match DefaultEditor::new() {
        Ok(e) => e,
        Err(e) => {
            eprintln!("failed to start REPL: {}", e);
            std::process::exit(EXIT_RUNTIME_ERROR);
        }
    };

    println!("Ruff {} — Ctrl-D to exit", env!("CARGO_PKG_VERSION"));
    loop {
        match editor.readline("ruff> ") {
            Ok(line) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let _ = editor.add_history_entry(trimmed);
                match vm.interpret_repl_line(trimmed) {
                    Ok(Some(value)) => println!("{}", format_repl_value(&vm, value)),
                    Ok(None) => {}
                    Err(InterpretError::Compile(compile_errors)) => {
                        for error in &compile_errors {
                            eprintln!("{}", errors::format_compile_error(error));
                        }
                    }
                    Err(InterpretError::Runtime(runtime_error)) => {
                        eprintln!("{}", errors::format_runtime_error(&runtime_error));
                    }
                }
            }
            Err(ReadlineError::Interrupted) => continue,
            Err(ReadlineError::Eof) => break,
            Err(e) => {
                eprintln!("readline error: {}", e);
                break;
            }
        }
    }
}

fn format_repl_value(vm: &Vm, value: value::Value) -> String {
    struct Echo<'a>(&'a Vm, value::Value);
    impl std::fmt::Display for Echo<'_> {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            value::display_value(&self.0.heap, self.1, f)
        }
    }
    format!("{}", Echo(vm, value))
}
