//! Loading and launching a bundled program.
//!
//! Loading is two passes over the entry point's dependency closure. The
//! first pass defines a placeholder identity record (UNDEF, with the
//! binding's lazy flag) for every name, so that when bodies compile in the
//! second pass every global reference — including forward and mutually
//! recursive ones — already has a stable record to embed. The second pass
//! compiles each body, places the function in the heap, and rebinds the
//! existing record to it.

use std::fmt;
use std::path::Path;

use tracing::{debug, info};

use crate::bundle::{BundleError, BundleReader};
use crate::machine::cell::Cell;
use crate::machine::compiler::CompileError;
use crate::machine::{ExecError, Machine};

#[derive(Debug)]
pub enum LoadError {
    Bundle(BundleError),
    /// A body failed to compile; carries the binding's name.
    Compile { binding: String, error: CompileError },
    Exec(ExecError),
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bundle(err) => write!(f, "{}", err),
            Self::Compile { binding, error } => write!(f, "compiling {}: {}", binding, error),
            Self::Exec(err) => write!(f, "{}", err),
        }
    }
}

impl std::error::Error for LoadError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Bundle(err) => Some(err),
            Self::Compile { error, .. } => Some(error),
            Self::Exec(err) => Some(err),
        }
    }
}

impl From<BundleError> for LoadError {
    fn from(err: BundleError) -> LoadError {
        LoadError::Bundle(err)
    }
}

impl From<ExecError> for LoadError {
    fn from(err: ExecError) -> LoadError {
        LoadError::Exec(err)
    }
}

pub type LoadResult<T> = Result<T, LoadError>;

/// Pick the entry point to run: an explicit request wins; otherwise the
/// bundle must declare exactly one.
pub fn select_entry_point(reader: &BundleReader, requested: Option<&str>) -> LoadResult<String> {
    if let Some(name) = requested {
        return Ok(name.to_string());
    }
    let mut entries = reader.entry_points()?;
    match entries.len() {
        0 => Err(LoadError::Bundle(BundleError::NoEntryPoint)),
        1 => Ok(entries.remove(0)),
        _ => Err(LoadError::Bundle(BundleError::AmbiguousEntryPoint(entries))),
    }
}

/// Load the entry point's dependency closure into the machine. After this
/// returns, every binding in the closure holds its compiled function and
/// the reader is no longer needed.
pub fn load_program(machine: &mut Machine, reader: &BundleReader, entry: &str) -> LoadResult<()> {
    let closure = reader.dependency_closure(entry)?;
    debug!(target: "filament::load", entry, bindings = closure.len(), "loading closure");

    // Pass one: stable identity records before any compilation.
    for (name, &lazy) in &closure {
        machine.define_global(name, Cell::UNDEF, lazy);
    }

    // Pass two: compile and rebind.
    for (name, &lazy) in &closure {
        let binding = reader.binding(name)?;
        let func = machine
            .compile_function(name, &closure, &binding.body)
            .map_err(|error| LoadError::Compile { binding: name.clone(), error })?;
        let obj = machine.add_function(&func)?;
        machine.define_global(name, Cell::tag_ptr(obj), lazy);
        debug!(target: "filament::load", binding = %name, lazy, code_len = machine.heap().function_code_len(obj).unwrap_or(0), "bound");
    }

    Ok(())
}

/// Load a bundle and run `entry` (or the bundle's sole entry point) with
/// the given program arguments. The bundle handle is released before
/// execution starts.
pub fn run_bundle(
    machine: &mut Machine,
    bundle_path: &Path,
    requested_entry: Option<&str>,
    args: &[String],
) -> LoadResult<()> {
    let reader = BundleReader::open(bundle_path)?;
    let entry = select_entry_point(&reader, requested_entry)?;
    info!(target: "filament::load", bundle = %bundle_path.display(), entry = %entry, "running");

    load_program(machine, &reader, &entry)?;
    drop(reader);

    // Program arguments become operand-stack strings; the entry frame
    // picks up as many as the entry function declares parameters.
    for arg in args {
        let cell = machine.alloc_string(arg)?;
        machine.push(cell)?;
    }

    let value = machine.global_value(&entry)?;
    if !value.is_ptr() {
        return Err(LoadError::Exec(ExecError::TypeError {
            expected: "function object",
            got: machine.render(value),
        }));
    }
    machine.execute(value.untag_ptr())?;
    Ok(())
}
