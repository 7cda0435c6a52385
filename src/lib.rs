//! Filament — a stack-based virtual machine for pre-compiled bundles.
//!
//! A bundle carries named top-level bindings whose values are function
//! bodies written as lists of symbolic instructions. Filament loads the
//! bindings an entry point depends on, compiles each body into a
//! directly-threaded instruction stream inside a VM-managed heap, and
//! executes the entry point.
//!
//! # Architecture
//!
//! - **`machine`** is the runtime core: the tagged 64-bit cell, the bump
//!   arena heap with datakey-typed objects, the dual operand/return
//!   stacks, the instruction compiler, the threaded interpreter, and the
//!   built-in system functions.
//! - **`bundle`** reads programs from SQLite bundle files.
//! - **`loader`** ties the two together: it defines placeholder globals
//!   for the whole dependency closure, compiles every body against them,
//!   and launches the entry point.
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//! use filament::machine::Machine;
//! use filament::loader::run_bundle;
//!
//! let mut machine = Machine::new();
//! run_bundle(&mut machine, Path::new("program.bundle"), None, &[]).unwrap();
//! ```

pub mod bundle;
pub mod loader;
pub mod machine;

pub use bundle::{Binding, BundleError, BundleReader};
pub use loader::{load_program, run_bundle, LoadError};
pub use machine::{ExecError, Machine, MachineConfig};
