use std::io::{self, BufRead, Write};
use std::process::ExitCode;

use perch::{Error, VM};

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();
    match args.as_slice() {
        [_] => repl(),
        [_, script] => run_file(script),
        _ => {
            eprintln!("Usage: perch [script]");
            ExitCode::from(64)
        }
    }
}

fn run_file(path: &str) -> ExitCode {
    let src = match std::fs::read_to_string(path) {
        Ok(src) => src,
        Err(err) => {
            eprintln!("Could not read file \"{path}\": {err}.");
            return ExitCode::from(74);
        }
    };
    let mut vm = VM::default();
    match vm.interpret(&src) {
        Ok(()) => ExitCode::SUCCESS,
        Err(Error::Compile) => ExitCode::from(65),
        Err(Error::Runtime) => ExitCode::from(70),
    }
}

fn repl() -> ExitCode {
    let mut vm = VM::default();
    let stdin = io::stdin();
    loop {
        print!("> ");
        let _ = io::stdout().flush();
        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                // Errors were already reported; the session keeps going.
                let _ = vm.interpret(&line);
            }
        }
    }
    ExitCode::SUCCESS
}
