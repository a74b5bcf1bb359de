//! Two-pass ARM2 assembler.
//!
//! Source text goes through the preprocessor (`.include`, macros,
//! conditionals), the line lexer and the statement parser; the assembler
//! then lays out text/data/bss sections, resolves symbols and literal
//! pools across two passes, and invokes the `cpu-arm2` encoder to produce
//! the binary image. Errors are accumulated as [`Diagnostic`]s and
//! reported in one batch; a successful run resolves every reference.

mod assembler;
mod diag;
mod expr;
mod lexer;
mod parser;
mod preprocess;
mod symbols;

pub use assembler::{assemble, Image, Options, Program, Section};
pub use diag::{Diagnostic, Pos};
pub use expr::{EvalError, Expr};
pub use preprocess::{FsProvider, MapProvider, SourceProvider};
pub use symbols::SymbolTable;
