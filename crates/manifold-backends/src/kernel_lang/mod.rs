//! Kernel language of the simulated device
//!
//! [`CpuBackend`](crate::CpuBackend) accepts the OpenCL-C subset that the
//! expression compiler emits, so generated source is really built and run
//! rather than pattern-matched:
//!
//! - scalar types `int uint long ulong size_t float double` and `global T *`
//!   parameters
//! - `kernel void` entry points plus helper functions defined before use
//! - declarations, `if`/`else`, `for`, `while`, `return`, `break`, `continue`
//! - C expression precedence, casts, ternaries, compound assignment, `++`/`--`
//! - work-item queries (`get_global_id` ...) and common math builtins
//!
//! ```rust
//! use manifold_backends::kernel_lang;
//!
//! let program = kernel_lang::compile(
//!     "kernel void scale(ulong n, global float *x, float a) {\n\
//!          for(size_t i = get_global_id(0); i < n; i += get_global_size(0)) x[i] *= a;\n\
//!      }",
//! )
//! .unwrap();
//! assert!(program.kernel("scale").is_some());
//!
//! let err = kernel_lang::compile("kernel void broken() { y = 1; }").unwrap_err();
//! assert_eq!(err.to_string(), "1:24: error: use of undeclared identifier 'y'");
//! ```

mod ast;
mod interp;
mod lexer;
mod parser;
mod value;

use std::fmt;

pub use ast::{Program, VarType};
pub use interp::{launch, DeviceMemory, ExecError};
pub use value::Value;

/// Position in kernel source, 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pos {
    pub line: u32,
    pub col: u32,
}

/// A syntax or name-resolution error; rendered as one build log line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildError {
    pub pos: Pos,
    pub message: String,
}

impl BuildError {
    pub(crate) fn new(pos: Pos, message: impl Into<String>) -> Self {
        BuildError {
            pos,
            message: message.into(),
        }
    }
}

impl fmt::Display for BuildError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}: error: {}", self.pos.line, self.pos.col, self.message)
    }
}

impl std::error::Error for BuildError {}

/// Lex, parse and resolve kernel source.
pub fn compile(source: &str) -> Result<Program, BuildError> {
    let tokens = lexer::tokenize(source)?;
    parser::Parser::new(tokens).parse_program()
}
