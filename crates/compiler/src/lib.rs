//! mica C compiler library.
//!
//! Compilation from a preprocessed C translation unit to x86-64 assembly
//! text, as a strict pipeline: lex/parse to a typed AST, lower every
//! function body to basic-block IR over virtual registers, run
//! linear-scan register allocation, then emit AT&T-syntax text.
//!
//! ```rust,ignore
//! use micac::compile_source;
//!
//! let asm = compile_source("int main(void) { return 0; }", "main.c")?;
//! print!("{}", asm);
//! ```
//!
//! Diagnostics print to stderr as they are found; when any were
//! recorded, [`Compiler::finish`] refuses to produce output.

pub mod ast;
pub mod codegen;
pub mod config;
pub mod diag;
pub mod emit;
pub mod ir;
pub mod lexer;
pub mod parser;
pub mod regalloc;
pub mod symbols;
pub mod types;

pub use config::TargetConfig;
pub use diag::{CompileError, Diagnostics};
pub use lexer::Lexer;
pub use parser::Parser;
pub use symbols::{NameTable, Session};

use std::cell::RefCell;
use std::rc::Rc;

use tracing::debug;

use crate::ast::Declaration;

/// One compilation: accepts source files in order, produces a single
/// assembly stream.
pub struct Compiler {
    names: Rc<RefCell<NameTable>>,
    diags: Rc<RefCell<Diagnostics>>,
    session: Session,
    decls: Vec<Declaration>,
    config: TargetConfig,
}

impl Compiler {
    pub fn new() -> Compiler {
        Compiler::with_config(TargetConfig::default())
    }

    pub fn with_config(config: TargetConfig) -> Compiler {
        let names = Rc::new(RefCell::new(NameTable::new()));
        let diags = Rc::new(RefCell::new(Diagnostics::new()));
        let session = Session::new(names.clone(), diags.clone());
        Compiler { names, diags, session, decls: Vec::new(), config }
    }

    /// Parse one translation-unit chunk into the shared declaration
    /// list. Later files see earlier files' globals, the way a driver
    /// feeding multiple inputs expects.
    pub fn add_source(&mut self, source: &str, filename: &str) -> Result<(), CompileError> {
        debug!(filename, bytes = source.len(), "parsing");
        let mut lexer = Lexer::new(source, filename, self.names.clone(), self.diags.clone());
        let mut parser = Parser::new(&mut lexer, &mut self.session);
        parser.parse(&mut self.decls)
    }

    pub fn error_count(&self) -> usize {
        self.diags.borrow().error_count()
    }

    /// Lower, allocate, and emit. No output is produced when any
    /// diagnostic was recorded.
    pub fn finish(mut self) -> Result<String, CompileError> {
        let errors = self.error_count();
        if errors > 0 {
            return Err(CompileError::HasErrors(errors));
        }
        let mut lowered = codegen::lower(&mut self.session, &self.config, &self.decls)?;
        for lf in &mut lowered {
            regalloc::allocate(&mut lf.backend, &self.config);
        }
        emit::emit(&self.session, &self.config, &self.decls, &lowered)
    }
}

impl Default for Compiler {
    fn default() -> Self {
        Compiler::new()
    }
}

/// Compile a single translation unit to assembly text.
pub fn compile_source(source: &str, filename: &str) -> Result<String, CompileError> {
    let mut compiler = Compiler::new();
    compiler.add_source(source, filename)?;
    compiler.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile(source: &str) -> String {
        compile_source(source, "test.c").expect("compile")
    }

    #[test]
    fn test_return_constant() {
        let asm = compile("int main(void) { return 42; }");
        assert!(asm.contains("main:"));
        assert!(asm.contains("$42"));
    }

    #[test]
    fn test_loop_accumulation_compiles() {
        let asm = compile("int main(void) { int a = 0; for (int i = 0; i < 10; ++i) a += i; return a; }");
        // A backward jump for the loop and a comparison against 10.
        assert!(asm.contains("$10"));
        assert!(asm.contains("jmp .L"));
    }

    #[test]
    fn test_funcall_compiles() {
        let asm = compile("int puts(const char *s); int main(void) { puts(\"hi\"); return 0; }");
        assert!(asm.contains("call puts"));
        assert!(asm.contains(".ascii \"hi\\000\""));
    }

    #[test]
    fn test_designated_struct_init() {
        let asm = compile(
            "struct P { int x, y; };\n\
             int main(void) { struct P p = {.y = 3, .x = 2}; return p.x * 10 + p.y; }",
        );
        assert!(asm.contains("main:"));
    }

    #[test]
    fn test_recursion_compiles() {
        let asm = compile(
            "int f(int n) { if (n < 2) return n; return f(n - 1) + f(n - 2); }\n\
             int main(void) { return f(10); }",
        );
        assert!(asm.contains("call f"));
    }

    #[test]
    fn test_designated_array_init_local() {
        let asm = compile(
            "int main(void) { int a[] = {[2] = 7, 1, 2, [0] = 9}; return a[0] + a[1] + a[2] + a[3]; }",
        );
        assert!(asm.contains("main:"));
        // Skipped elements are zeroed before the stores.
        assert!(asm.contains("rep stosb"));
    }

    #[test]
    fn test_compile_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prog.c");
        std::fs::write(&path, "int main(void) { return 7; }").unwrap();
        let source = std::fs::read_to_string(&path).unwrap();
        let asm = compile_source(&source, &path.display().to_string()).unwrap();
        assert!(asm.contains("main:"));
        assert!(asm.contains("$7"));
    }

    #[test]
    fn test_errors_suppress_output() {
        let result = compile_source("int main(void) { return undeclared_thing; }", "bad.c");
        assert!(matches!(result, Err(CompileError::HasErrors(1))));
    }

    #[test]
    fn test_multiple_sources_share_globals() {
        let mut compiler = Compiler::new();
        compiler.add_source("int shared = 3;", "a.c").unwrap();
        compiler.add_source("extern int shared; int main(void) { return shared; }", "b.c").unwrap();
        let asm = compiler.finish().unwrap();
        assert!(asm.contains("shared:"));
        // The redeclaration must not lose the initializer.
        assert!(asm.contains(".long 3"));
        assert!(asm.contains("main:"));
    }

    #[test]
    fn test_float_arithmetic_compiles() {
        let asm = compile(
            "double half(double x) { return x / 2.0; }\n\
             int main(void) { return (int)half(8.0); }",
        );
        assert!(asm.contains("divsd"));
        assert!(asm.contains("cvttsd2si"));
    }

    #[test]
    fn test_string_copy_into_char_array() {
        let asm = compile("int main(void) { char s[3] = \"ab\"; return s[0]; }");
        assert!(asm.contains("main:"));
        assert!(asm.contains(".ascii"));
    }

    #[test]
    fn test_static_local_counter() {
        let asm = compile("int next(void) { static int n = 10; return ++n; }");
        // The shadow global carries the initial value.
        assert!(asm.contains(".long 10"));
    }

    #[test]
    fn test_goto_and_labels() {
        let asm = compile(
            "int main(void) { int i = 0; again: ++i; if (i < 3) goto again; return i; }",
        );
        assert!(asm.contains("main:"));
    }

    #[test]
    fn test_sizeof_is_constant_in_output() {
        let asm = compile("struct S { char c; long l; }; int main(void) { return sizeof(struct S); }");
        assert!(asm.contains("$16"));
    }
}
