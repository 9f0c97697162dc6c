//! Shared helpers for the integration tests.
//!
//! Each helper spins up an independent machine, feeds it one program, and
//! hands back what the program printed. Diagnostics go to stderr as usual;
//! the tests only assert on program output and on the error kind.

#![allow(dead_code, unused_macros)]

pub use perch::{Error, VM};

/// Run a program that must succeed and return everything it printed.
pub fn run(src: &str) -> String {
    let mut out = Vec::new();
    let mut vm = VM::new(&mut out);
    vm.interpret(src).expect("program runs");
    drop(vm);
    String::from_utf8(out).expect("program output is valid UTF-8")
}

/// Run a program that must fail and return the error kind.
pub fn run_err(src: &str) -> Error {
    let mut vm = VM::new(Vec::new());
    vm.interpret(src).expect_err("program is rejected")
}

/// Like [`run`], with a collection forced at every allocation point.
pub fn run_stressed(src: &str) -> String {
    let mut out = Vec::new();
    let mut vm = VM::new(&mut out);
    vm.enable_gc_stress();
    vm.interpret(src).expect("program runs under gc stress");
    drop(vm);
    String::from_utf8(out).expect("program output is valid UTF-8")
}

/// Assert that a program prints the expected lines.
macro_rules! assert_prints {
    ($src:expr, $($line:expr),+ $(,)?) => {{
        let expected: Vec<&str> = vec![$($line),+];
        let out = $crate::common::run($src);
        let got: Vec<&str> = out.lines().collect();
        assert_eq!(got, expected, "program: {}", $src);
    }};
}

/// Assert that a program fails to compile.
macro_rules! assert_compile_err {
    ($src:expr) => {{
        assert!(
            matches!($crate::common::run_err($src), $crate::common::Error::Compile),
            "expected a compile error: {}",
            $src,
        );
    }};
}

/// Assert that a program compiles and then fails at runtime.
macro_rules! assert_runtime_err {
    ($src:expr) => {{
        assert!(
            matches!($crate::common::run_err($src), $crate::common::Error::Runtime),
            "expected a runtime error: {}",
            $src,
        );
    }};
}
