#![warn(rust_2018_idioms)]

use std::fs;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process;

use clap::Parser;

mod compiler;
mod debug;
mod memory;
mod vm;

use memory::GC;
use vm::{VMError, VM};

// BSD sysexits, so scripts can tell failure modes apart.
const EX_USAGE: i32 = 64;
const EX_DATAERR: i32 = 65;
const EX_SOFTWARE: i32 = 70;
const EX_IOERR: i32 = 74;

#[derive(Parser)]
#[command(name = "rlox", about = "Bytecode interpreter for the Lox language")]
struct Cli {
    /// Script to run; starts a REPL when omitted.
    script: Option<PathBuf>,
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            // --help and --version are not usage errors.
            process::exit(if err.use_stderr() { EX_USAGE } else { 0 });
        }
    };

    let mut gc = GC::new();
    let mut vm = VM::new(&mut gc);

    match cli.script {
        Some(path) => run_file(&mut vm, &path),
        None => repl(&mut vm),
    }
}

fn run_file(vm: &mut VM<'_>, path: &PathBuf) {
    let source = match fs::read_to_string(path) {
        Ok(source) => source,
        Err(err) => {
            eprintln!("Could not read {}: {}", path.display(), err);
            process::exit(EX_IOERR);
        }
    };

    if let Err(err) = vm.interpret(&source) {
        let code = match err {
            VMError::CompileError(_) => EX_DATAERR,
            VMError::Io(_) => EX_IOERR,
            _ => EX_SOFTWARE,
        };
        process::exit(code);
    }
}

fn repl(vm: &mut VM<'_>) {
    let stdin = io::stdin();
    prompt();
    for line in stdin.lock().lines() {
        match line {
            // Errors are already reported; the session keeps going.
            Ok(line) => {
                let _ = vm.interpret(&line);
            }
            Err(_) => break,
        }
        prompt();
    }
}

fn prompt() {
    print!("> ");
    let _ = io::stdout().flush();
}
