//! The strand runtime: values, bytecode compiler, peephole optimizer,
//! virtual machine, fiber executor and builtin registry.

pub mod compiler;
pub mod concurrent;
pub mod error;
pub mod executor;
pub mod optimizer;
pub mod registry;
pub mod stdlib;
pub mod value;
pub mod vm;

use std::path::PathBuf;

use thiserror::Error;

pub use compiler::{compile, CompileError, CompiledProgram, CompilerOptions};
pub use error::{VmError, VmResult};
pub use executor::Executor;
pub use registry::{Registry, RegistryBuilder};
pub use stdlib::std_registry;
pub use value::Value;
pub use vm::Vm;

/// Everything that can go wrong between source text and bytecode.
#[derive(Error, Debug)]
pub enum BuildError {
    #[error(transparent)]
    Parse(#[from] strand_syntax::ParseError),

    #[error(transparent)]
    Lower(#[from] strand_ir::LowerError),

    #[error(transparent)]
    Compile(#[from] CompileError),
}

/// Parse, lower and compile source text against a registry.
pub fn compile_source(
    source: &str,
    registry: &Registry,
    options: CompilerOptions,
    path: Option<PathBuf>,
) -> Result<CompiledProgram, BuildError> {
    let ast = strand_syntax::parse(source)?;
    let ir = strand_ir::lower(&ast, registry.names())?;
    let program = compiler::compile(&ir, registry, options, path)?;
    Ok(program)
}
