//! System functions: built-in operations invoked by name.
//!
//! The registry maps names to plain function pointers and assigns each a
//! stable id; the compiler resolves a `syscall.counted` name to its id
//! once and plants the id as an instruction operand, so the interpreter
//! dispatches without any name lookup. The registry is append-only and
//! immutable after construction.
//!
//! Every system function receives the machine and the caller-counted
//! argument count, and reads and writes the operand stack directly.

use std::collections::HashMap;

use super::cell::Cell;
use super::{ExecError, ExecResult, Machine};

/// Signature of a system function.
pub type SysFunction = fn(&mut Machine, u64) -> ExecResult<()>;

struct Entry {
    name: &'static str,
    func: SysFunction,
}

/// Registry of system functions callable from compiled code.
pub struct SysRegistry {
    entries: Vec<Entry>,
    by_name: HashMap<&'static str, u64>,
}

impl SysRegistry {
    pub fn new() -> SysRegistry {
        SysRegistry { entries: Vec::new(), by_name: HashMap::new() }
    }

    /// A registry with the standard built-ins installed.
    pub fn with_builtins() -> SysRegistry {
        let mut registry = SysRegistry::new();
        registry.register("println", sys_println);
        registry.register("+", sys_add);
        registry.register("-", sys_subtract);
        registry.register("*", sys_multiply);
        registry.register("/", sys_divide);
        registry.register("negate", sys_negate);
        registry.register("<", sys_less_than);
        registry.register(">", sys_greater_than);
        registry.register("<=", sys_less_or_equal);
        registry.register(">=", sys_greater_or_equal);
        registry.register("===", sys_identical);
        registry.register("!==", sys_not_identical);
        registry
    }

    /// Register a function, returning its id.
    pub fn register(&mut self, name: &'static str, func: SysFunction) -> u64 {
        if let Some(&id) = self.by_name.get(name) {
            return id;
        }
        let id = self.entries.len() as u64;
        self.entries.push(Entry { name, func });
        self.by_name.insert(name, id);
        id
    }

    pub fn lookup(&self, name: &str) -> Option<u64> {
        self.by_name.get(name).copied()
    }

    pub fn get(&self, id: u64) -> Option<SysFunction> {
        self.entries.get(id as usize).map(|e| e.func)
    }

    pub fn name_of(&self, id: u64) -> Option<&'static str> {
        self.entries.get(id as usize).map(|e| e.name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for SysRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl std::fmt::Debug for SysRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SysRegistry")
            .field("count", &self.entries.len())
            .field("names", &self.entries.iter().map(|e| e.name).collect::<Vec<_>>())
            .finish()
    }
}

// === println ===

/// Pop `nargs` values and print them space-separated, newline-terminated.
fn sys_println(machine: &mut Machine, nargs: u64) -> ExecResult<()> {
    let nargs = nargs as usize;
    let size = machine.stack_size();
    if size < nargs {
        return Err(ExecError::StackUnderflow);
    }

    let mut rendered = Vec::with_capacity(nargs);
    for i in 0..nargs {
        let value = machine.peek_at(size - nargs + i)?;
        rendered.push(machine.render(value));
    }
    machine.pop_multiple(nargs)?;
    machine.write_line(&rendered.join(" "))
}

// === Integer arithmetic and comparison ===
//
// All binary operations take exactly two tagged-int arguments, pop the
// second and overwrite the first in place, so the net stack effect is one
// slot.

fn binary_int_op(
    machine: &mut Machine,
    nargs: u64,
    op: fn(i64, i64) -> ExecResult<Cell>,
) -> ExecResult<()> {
    if nargs != 2 {
        return Err(ExecError::ArityError { expected: 2, got: nargs as usize });
    }

    let second = machine.pop()?;
    let first = machine.peek()?;
    if !first.is_int() {
        return Err(ExecError::TypeError { expected: "int", got: machine.render(first) });
    }
    if !second.is_int() {
        return Err(ExecError::TypeError { expected: "int", got: machine.render(second) });
    }

    let result = op(first.untag_int(), second.untag_int())?;
    machine.set_top(result)
}

fn sys_add(machine: &mut Machine, nargs: u64) -> ExecResult<()> {
    binary_int_op(machine, nargs, |a, b| Ok(Cell::tag_int(a.wrapping_add(b))))
}

fn sys_subtract(machine: &mut Machine, nargs: u64) -> ExecResult<()> {
    binary_int_op(machine, nargs, |a, b| Ok(Cell::tag_int(a.wrapping_sub(b))))
}

fn sys_multiply(machine: &mut Machine, nargs: u64) -> ExecResult<()> {
    binary_int_op(machine, nargs, |a, b| Ok(Cell::tag_int(a.wrapping_mul(b))))
}

fn sys_divide(machine: &mut Machine, nargs: u64) -> ExecResult<()> {
    binary_int_op(machine, nargs, |a, b| {
        if b == 0 {
            Err(ExecError::DivByZero)
        } else {
            Ok(Cell::tag_int(a.wrapping_div(b)))
        }
    })
}

fn sys_less_than(machine: &mut Machine, nargs: u64) -> ExecResult<()> {
    binary_int_op(machine, nargs, |a, b| Ok(Cell::from_bool(a < b)))
}

fn sys_greater_than(machine: &mut Machine, nargs: u64) -> ExecResult<()> {
    binary_int_op(machine, nargs, |a, b| Ok(Cell::from_bool(a > b)))
}

fn sys_less_or_equal(machine: &mut Machine, nargs: u64) -> ExecResult<()> {
    binary_int_op(machine, nargs, |a, b| Ok(Cell::from_bool(a <= b)))
}

fn sys_greater_or_equal(machine: &mut Machine, nargs: u64) -> ExecResult<()> {
    binary_int_op(machine, nargs, |a, b| Ok(Cell::from_bool(a >= b)))
}

fn sys_identical(machine: &mut Machine, nargs: u64) -> ExecResult<()> {
    binary_int_op(machine, nargs, |a, b| Ok(Cell::from_bool(a == b)))
}

fn sys_not_identical(machine: &mut Machine, nargs: u64) -> ExecResult<()> {
    binary_int_op(machine, nargs, |a, b| Ok(Cell::from_bool(a != b)))
}

/// Unary integer negation, in place.
fn sys_negate(machine: &mut Machine, nargs: u64) -> ExecResult<()> {
    if nargs != 1 {
        return Err(ExecError::ArityError { expected: 1, got: nargs as usize });
    }
    let value = machine.peek()?;
    if !value.is_int() {
        return Err(ExecError::TypeError { expected: "int", got: machine.render(value) });
    }
    machine.set_top(Cell::tag_int(value.untag_int().wrapping_neg()))
}
