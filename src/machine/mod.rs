//! The virtual machine: dual-stack threaded interpreter.
//!
//! A `Machine` owns everything it touches: the heap arena, the operand and
//! return stacks, the globals table, and the system-function registry.
//! Compiled code is a stream of cells in the heap whose first cell per
//! instruction is a raw handler id; `step` fetches that id and calls
//! straight through the handler table, and each handler fetches its own
//! operands and leaves `pc` at the next instruction. Lazy bindings are
//! forced at most once; the forcing instructions rewrite their own handler
//! cell to the eager variant afterwards.
//!
//! # Module structure
//!
//! - `cell`: the 64-bit tagged cell
//! - `heap`: pool, object layouts, datakey bootstrap
//! - `stack`: fixed-capacity cell stacks
//! - `globals`: name → identity record table
//! - `opcodes`: handler ids and the symbolic-name mapping
//! - `compiler`: JSON bodies → threaded code
//! - `sysfn`: built-in functions callable by SYSCALL_COUNTED

pub mod cell;
pub mod compiler;
pub mod globals;
pub mod heap;
pub mod opcodes;
pub mod stack;
pub mod sysfn;

#[cfg(test)]
mod tests;

use std::fmt;
use std::io::{self, Write};
use std::ops::ControlFlow;

use smallvec::SmallVec;
use tracing::trace;

use cell::{Cell, CellIdx};
use compiler::{CompileResult, FunctionCompiler, FunctionObject, LazyView};
use globals::{Globals, Ident, IdentRef};
use heap::{Heap, HeapError, ObjectBuilder, DEFAULT_POOL_CELLS};
use opcodes::{Op, OP_COUNT};
use stack::{CellStack, StackError, DEFAULT_STACK_CELLS};
use sysfn::SysRegistry;

/// Result of VM execution.
pub type ExecResult<T> = Result<T, ExecError>;

/// Errors that can occur during execution.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecError {
    /// Wrong kind of value in an operation.
    TypeError { expected: &'static str, got: String },
    /// Call-site argument count does not match the callee's parameters.
    ArityError { expected: usize, got: usize },
    /// Integer division by zero.
    DivByZero,
    /// A stack exceeded its fixed capacity.
    StackOverflow,
    /// A pop or frame read reached below the stack base.
    StackUnderflow,
    /// The heap arena is exhausted.
    OutOfMemory { requested: usize, available: usize },
    /// A global was read before being defined.
    UndefinedGlobal(String),
    /// A lazy binding was re-entered while being forced.
    RecursiveLazyForce(String),
    /// A counted-instruction post-condition failed.
    AssertionError(String),
    /// A code cell did not hold a known handler id.
    InvalidHandler(u64),
    /// A code cell named a system function id that is not registered.
    InvalidSysFunction(u64),
    /// An instruction operand referenced a nonexistent identity record.
    InvalidIdent(usize),
    /// The program counter or an embedded address left the pool.
    BadAddress(usize),
    /// Writing program output failed.
    Io(String),
}

impl fmt::Display for ExecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TypeError { expected, got } => {
                write!(f, "type error: expected {}, got {}", expected, got)
            }
            Self::ArityError { expected, got } => {
                write!(f, "arity error: expected {} arguments, got {}", expected, got)
            }
            Self::DivByZero => write!(f, "division by zero"),
            Self::StackOverflow => write!(f, "stack overflow"),
            Self::StackUnderflow => write!(f, "stack underflow"),
            Self::OutOfMemory { requested, available } => {
                write!(f, "out of memory: requested {} cells, {} available", requested, available)
            }
            Self::UndefinedGlobal(name) => write!(f, "undefined global: {}", name),
            Self::RecursiveLazyForce(name) => {
                write!(f, "recursive evaluation of lazy binding: {}", name)
            }
            Self::AssertionError(msg) => write!(f, "assertion failed: {}", msg),
            Self::InvalidHandler(word) => write!(f, "invalid handler id: {:#x}", word),
            Self::InvalidSysFunction(id) => write!(f, "invalid system function id: {}", id),
            Self::InvalidIdent(ident) => write!(f, "invalid identity reference: {}", ident),
            Self::BadAddress(addr) => write!(f, "address out of bounds: {:#x}", addr),
            Self::Io(msg) => write!(f, "output error: {}", msg),
        }
    }
}

impl std::error::Error for ExecError {}

impl From<StackError> for ExecError {
    fn from(err: StackError) -> ExecError {
        match err {
            StackError::Overflow => ExecError::StackOverflow,
            StackError::Underflow => ExecError::StackUnderflow,
        }
    }
}

impl From<HeapError> for ExecError {
    fn from(err: HeapError) -> ExecError {
        match err {
            HeapError::OutOfMemory { requested, available } => {
                ExecError::OutOfMemory { requested, available }
            }
        }
    }
}

/// Configuration for a machine instance.
#[derive(Debug, Clone)]
pub struct MachineConfig {
    /// Heap arena size in cells.
    pub heap_cells: usize,
    /// Operand stack capacity in cells.
    pub operand_capacity: usize,
    /// Return stack capacity in cells.
    pub return_capacity: usize,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            heap_cells: DEFAULT_POOL_CELLS,
            operand_capacity: DEFAULT_STACK_CELLS,
            return_capacity: DEFAULT_STACK_CELLS,
        }
    }
}

type Handler = fn(&mut Machine) -> ExecResult<ControlFlow<()>>;

/// The handler table. A compiled instruction's first cell is an index
/// into this array, so dispatch is one indexed call; there is no central
/// decode step.
const HANDLERS: [Handler; OP_COUNT] = [
    Machine::op_push_value,         // PushInt
    Machine::op_push_value,         // PushBool
    Machine::op_push_value,         // PushString
    Machine::op_push_local,         // PushLocal
    Machine::op_pop_local,          // PopLocal
    Machine::op_push_global,        // PushGlobal
    Machine::op_push_global_lazy,   // PushGlobalLazy
    Machine::op_call_global,        // CallGlobalCounted
    Machine::op_call_global_lazy,   // CallGlobalCountedLazy
    Machine::op_syscall,            // SyscallCounted
    Machine::op_stack_length,       // StackLength
    Machine::op_check_bool,         // CheckBool
    Machine::op_goto,               // Goto
    Machine::op_if_not,             // IfNot
    Machine::op_return,             // Return
    Machine::op_halt,               // Halt
    Machine::op_done,               // Done
    Machine::op_launch,             // Launch
];

/// A single-task virtual machine instance.
pub struct Machine {
    heap: Heap,
    operand: CellStack,
    rstack: CellStack,
    globals: Globals,
    sysfns: SysRegistry,
    pc: CellIdx,
    /// A lone HALT instruction used as the return continuation when a lazy
    /// binding is forced in a nested dispatch.
    halt_cell: CellIdx,
    out: Box<dyn Write>,
}

impl Machine {
    pub fn new() -> Machine {
        Machine::with_config(MachineConfig::default())
    }

    pub fn with_config(config: MachineConfig) -> Machine {
        // Keep room for the bootstrap datakeys, the forcing continuation,
        // and a launcher even under tiny test configurations.
        let mut heap = Heap::new(config.heap_cells.max(64));
        let halt_cell = match heap.allocate(1) {
            Ok(ix) => ix,
            Err(_) => unreachable!("bootstrap pool too small"),
        };
        heap.set(halt_cell, Cell::raw_u64(Op::Halt as u64));

        Machine {
            heap,
            operand: CellStack::new(config.operand_capacity),
            rstack: CellStack::new(config.return_capacity),
            globals: Globals::new(),
            sysfns: SysRegistry::with_builtins(),
            pc: 0,
            halt_cell,
            out: Box::new(io::stdout()),
        }
    }

    /// Redirect program output (`println` and friends).
    pub fn set_output(&mut self, out: Box<dyn Write>) {
        self.out = out;
    }

    // === Component access ===

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    pub fn globals(&self) -> &Globals {
        &self.globals
    }

    pub fn sysfns(&self) -> &SysRegistry {
        &self.sysfns
    }

    // === Operand stack (also the system-function interface) ===

    pub fn push(&mut self, value: Cell) -> ExecResult<()> {
        Ok(self.operand.push(value)?)
    }

    pub fn pop(&mut self) -> ExecResult<Cell> {
        Ok(self.operand.pop()?)
    }

    pub fn pop_multiple(&mut self, count: usize) -> ExecResult<()> {
        Ok(self.operand.pop_multiple(count)?)
    }

    pub fn peek(&self) -> ExecResult<Cell> {
        Ok(self.operand.peek()?)
    }

    pub fn peek_at(&self, index: usize) -> ExecResult<Cell> {
        Ok(self.operand.peek_at(index)?)
    }

    pub fn set_top(&mut self, value: Cell) -> ExecResult<()> {
        Ok(self.operand.set_top(value)?)
    }

    pub fn stack_size(&self) -> usize {
        self.operand.len()
    }

    pub fn return_stack_size(&self) -> usize {
        self.rstack.len()
    }

    // === Globals ===

    pub fn define_global(&mut self, name: &str, value: Cell, lazy: bool) -> IdentRef {
        trace!(target: "filament::vm", name, lazy, "define global");
        self.globals.define(name, value, lazy)
    }

    pub fn global_value(&self, name: &str) -> ExecResult<Cell> {
        self.globals
            .value_of(name)
            .ok_or_else(|| ExecError::UndefinedGlobal(name.to_string()))
    }

    fn ident(&self, ident: IdentRef) -> ExecResult<&Ident> {
        self.globals.get(ident).ok_or(ExecError::InvalidIdent(ident))
    }

    fn ident_mut(&mut self, ident: IdentRef) -> ExecResult<&mut Ident> {
        self.globals.get_mut(ident).ok_or(ExecError::InvalidIdent(ident))
    }

    // === Heap conveniences ===

    /// Allocate a heap string and return the tagged pointer to it.
    pub fn alloc_string(&mut self, text: &str) -> ExecResult<Cell> {
        let obj = self.heap.alloc_string(text)?;
        Ok(Cell::tag_ptr(obj))
    }

    /// Allocate a compiled function in the heap; returns the object index.
    pub fn add_function(&mut self, func: &FunctionObject) -> ExecResult<CellIdx> {
        Ok(self.heap.alloc_function(&func.code, func.nlocals, func.nparams)?)
    }

    /// Compile one JSON function body against this machine's globals and
    /// system functions.
    pub fn compile_function(
        &mut self,
        name: &str,
        deps: &LazyView,
        body: &str,
    ) -> CompileResult<FunctionObject> {
        let Machine { heap, globals, sysfns, .. } = self;
        FunctionCompiler::new(heap, globals, sysfns, deps, name).compile(body)
    }

    // === Rendering ===

    /// Human-readable form of a cell, following pointers into the heap.
    pub fn render(&self, value: Cell) -> String {
        if value.is_int() {
            value.untag_int().to_string()
        } else if value.is_ptr() {
            let obj = value.untag_ptr();
            if let Some(text) = self.heap.string_text(obj) {
                text
            } else if self.heap.is_function_object(obj) {
                format!("<fn:{:#x}>", obj << 3)
            } else {
                format!("<obj:{:#x}>", obj << 3)
            }
        } else if value.is_bool() {
            if value.as_bool() { "true".to_string() } else { "false".to_string() }
        } else if value.is_nil() {
            "nil".to_string()
        } else if value.is_undef() {
            "undef".to_string()
        } else if value.is_float() {
            value.untag_float().to_string()
        } else {
            format!("{:#018x}", value.bits())
        }
    }

    /// Write a line of program output.
    pub fn write_line(&mut self, line: &str) -> ExecResult<()> {
        self.out
            .write_all(line.as_bytes())
            .and_then(|_| self.out.write_all(b"\n"))
            .and_then(|_| self.out.flush())
            .map_err(|e| ExecError::Io(e.to_string()))
    }

    // === Execution ===

    /// Execute a function object to completion. Builds a three-cell
    /// launcher `{LAUNCH, func, HALT}` in the pool and dispatches into it;
    /// parameters of the entry function are taken from whatever is on the
    /// operand stack.
    pub fn execute(&mut self, func: CellIdx) -> ExecResult<()> {
        if !self.heap.is_function_object(func) {
            return Err(ExecError::TypeError {
                expected: "function object",
                got: format!("heap object at {:#x}", func << 3),
            });
        }

        let mut builder = ObjectBuilder::new();
        builder.push(Cell::raw_u64(Op::Launch as u64));
        builder.push(Cell::raw_ptr(func));
        builder.push(Cell::raw_u64(Op::Halt as u64));
        let launcher = builder.commit(self.heap.pool_mut())?;

        trace!(target: "filament::vm", launcher, func, "execute");
        self.pc = launcher;
        let saved_rstack = self.rstack.len();
        let result = self.run();
        // An entry function that stops at HALT instead of RETURN leaves
        // its frame behind; discard it with the launcher.
        self.rstack.truncate(saved_rstack);
        result
    }

    /// Run the dispatch loop until a handler halts it.
    pub fn run(&mut self) -> ExecResult<()> {
        loop {
            match self.step()? {
                ControlFlow::Continue(()) => continue,
                ControlFlow::Break(()) => return Ok(()),
            }
        }
    }

    /// Execute a single instruction: fetch the handler cell and call
    /// through the table.
    pub fn step(&mut self) -> ExecResult<ControlFlow<()>> {
        let word = self.fetch()?;
        let handler = HANDLERS
            .get(word.bits() as usize)
            .copied()
            .ok_or(ExecError::InvalidHandler(word.bits()))?;
        handler(self)
    }

    #[inline]
    fn fetch(&mut self) -> ExecResult<Cell> {
        let cell = self.heap.get(self.pc).ok_or(ExecError::BadAddress(self.pc))?;
        self.pc += 1;
        Ok(cell)
    }

    // === Frame access ===
    //
    // Frame layout, bottom to top:
    //   [param_0 .. param_{p-1}, local_p .. local_{L-1}, saved_func, saved_ret]
    // A raw offset emitted by the compiler addresses local i as
    // `len - (L - i + 2)`; the saved cells are raw, never tagged.

    fn local_slot(&self, offset: i64) -> ExecResult<usize> {
        let offset = usize::try_from(offset).map_err(|_| ExecError::StackUnderflow)?;
        self.rstack.len().checked_sub(offset).ok_or(ExecError::StackUnderflow)
    }

    fn local(&self, offset: i64) -> ExecResult<Cell> {
        let slot = self.local_slot(offset)?;
        Ok(self.rstack.peek_at(slot)?)
    }

    fn set_local(&mut self, offset: i64, value: Cell) -> ExecResult<()> {
        let slot = self.local_slot(offset)?;
        Ok(self.rstack.set_at(slot, value)?)
    }

    /// Arguments pushed since the snapshot recorded in `frame[offset]`.
    fn counted_args(&self, offset: i64) -> ExecResult<usize> {
        let snapshot = self.local(offset)?.untag_int();
        let nargs = self.operand.len() as i64 - snapshot;
        usize::try_from(nargs).map_err(|_| ExecError::StackUnderflow)
    }

    /// Push a call frame for `func` and transfer control to its code.
    /// The i-th argument pushed by the caller becomes local i.
    fn push_frame(&mut self, func: CellIdx, nargs: usize, ret: CellIdx) -> ExecResult<()> {
        let nlocals = self.heap.function_nlocals(func).ok_or(ExecError::BadAddress(func))?;
        let nparams = self.heap.function_nparams(func).ok_or(ExecError::BadAddress(func))?;

        if nargs != nparams {
            return Err(ExecError::ArityError { expected: nparams, got: nargs });
        }

        // Pop into a buffer (top of stack is the last argument), then
        // replay so the first-pushed argument lands deepest.
        let mut args: SmallVec<[Cell; 8]> = SmallVec::with_capacity(nparams);
        for _ in 0..nparams {
            args.push(self.operand.pop()?);
        }
        for &arg in args.iter().rev() {
            self.rstack.push(arg)?;
        }
        for _ in nparams..nlocals {
            self.rstack.push(Cell::NIL)?;
        }
        self.rstack.push(Cell::raw_ptr(func))?;
        self.rstack.push(Cell::raw_ptr(ret))?;

        trace!(target: "filament::vm::call", func, nparams, nlocals, ret, "push frame");
        self.pc = self.heap.function_code(func);
        Ok(())
    }

    /// The function object held by an identity record, or a type error.
    fn function_of_ident(&self, ident: IdentRef) -> ExecResult<CellIdx> {
        let value = self.ident(ident)?.value;
        if !value.is_ptr() {
            return Err(ExecError::TypeError { expected: "function", got: self.render(value) });
        }
        let func = value.untag_ptr();
        if !self.heap.is_function_object(func) {
            return Err(ExecError::TypeError { expected: "function", got: self.render(value) });
        }
        Ok(func)
    }

    /// Force a lazy binding by running its thunk in a nested dispatch.
    ///
    /// The thunk's frame returns to the machine's standing HALT cell, so
    /// the nested loop ends whether the body executes RETURN or falls into
    /// its trailing HALT. The body's DONE instruction leaves exactly one
    /// value on the operand stack and clears the record's lazy flag.
    fn force_global(&mut self, ident: IdentRef) -> ExecResult<()> {
        {
            let record = self.ident(ident)?;
            if record.in_progress {
                return Err(ExecError::RecursiveLazyForce(record.name.clone()));
            }
            trace!(target: "filament::vm::lazy", name = %record.name, "forcing");
        }
        let func = self.function_of_ident(ident)?;
        self.ident_mut(ident)?.in_progress = true;

        let saved_pc = self.pc;
        let saved_rstack = self.rstack.len();
        let halt = self.halt_cell;

        let result = self.push_frame(func, 0, halt).and_then(|_| self.run());

        // The thunk's frame is gone after RETURN but still present if the
        // body fell into HALT; either way restore the caller's view.
        self.rstack.truncate(saved_rstack);
        self.pc = saved_pc;
        result
    }

    // === Handlers ===

    /// PUSH_INT / PUSH_BOOL / PUSH_STRING: the operand is the value.
    fn op_push_value(&mut self) -> ExecResult<ControlFlow<()>> {
        let value = self.fetch()?;
        self.operand.push(value)?;
        Ok(ControlFlow::Continue(()))
    }

    fn op_push_local(&mut self) -> ExecResult<ControlFlow<()>> {
        let offset = self.fetch()?.as_raw_i64();
        let value = self.local(offset)?;
        self.operand.push(value)?;
        Ok(ControlFlow::Continue(()))
    }

    fn op_pop_local(&mut self) -> ExecResult<ControlFlow<()>> {
        let offset = self.fetch()?.as_raw_i64();
        let value = self.operand.pop()?;
        self.set_local(offset, value)?;
        Ok(ControlFlow::Continue(()))
    }

    fn op_push_global(&mut self) -> ExecResult<ControlFlow<()>> {
        let ident = self.fetch()?.bits() as usize;
        let value = self.ident(ident)?.value;
        self.operand.push(value)?;
        Ok(ControlFlow::Continue(()))
    }

    /// First read of a lazy global: rewrite the handler cell to the eager
    /// PUSH_GLOBAL, then force the binding; the value the thunk leaves on
    /// the operand stack is the pushed result. Once the binding is no
    /// longer lazy the instruction rewrites itself and re-dispatches.
    fn op_push_global_lazy(&mut self) -> ExecResult<ControlFlow<()>> {
        let self_cell = self.pc - 1;
        let ident = self.fetch()?.bits() as usize;
        let lazy = self.ident(ident)?.lazy;

        self.heap
            .set(self_cell, Cell::raw_u64(Op::PushGlobal as u64))
            .ok_or(ExecError::BadAddress(self_cell))?;

        if lazy {
            self.force_global(ident)?;
        } else {
            self.pc = self_cell;
        }
        Ok(ControlFlow::Continue(()))
    }

    fn op_call_global(&mut self) -> ExecResult<ControlFlow<()>> {
        let offset = self.fetch()?.as_raw_i64();
        let ident = self.fetch()?.bits() as usize;
        let nargs = self.counted_args(offset)?;
        let func = self.function_of_ident(ident)?;
        let ret = self.pc;
        self.push_frame(func, nargs, ret)?;
        Ok(ControlFlow::Continue(()))
    }

    /// First call through a lazy global: rewrite to the eager handler,
    /// force the binding, discard the value the force left (the eager call
    /// re-reads the record), and re-dispatch against the untouched
    /// argument stack.
    fn op_call_global_lazy(&mut self) -> ExecResult<ControlFlow<()>> {
        let self_cell = self.pc - 1;
        let _offset = self.fetch()?;
        let ident = self.fetch()?.bits() as usize;
        let lazy = self.ident(ident)?.lazy;

        self.heap
            .set(self_cell, Cell::raw_u64(Op::CallGlobalCounted as u64))
            .ok_or(ExecError::BadAddress(self_cell))?;

        if lazy {
            self.force_global(ident)?;
            self.operand.pop()?;
        }
        self.pc = self_cell;
        Ok(ControlFlow::Continue(()))
    }

    fn op_syscall(&mut self) -> ExecResult<ControlFlow<()>> {
        let offset = self.fetch()?.as_raw_i64();
        let id = self.fetch()?.bits();
        let nargs = self.counted_args(offset)?;
        let func = self.sysfns.get(id).ok_or(ExecError::InvalidSysFunction(id))?;
        trace!(target: "filament::vm::call", id, nargs, "syscall");
        func(self, nargs as u64)?;
        Ok(ControlFlow::Continue(()))
    }

    fn op_stack_length(&mut self) -> ExecResult<ControlFlow<()>> {
        let offset = self.fetch()?.as_raw_i64();
        let size = self.operand.len() as i64;
        self.set_local(offset, Cell::tag_int(size))?;
        Ok(ControlFlow::Continue(()))
    }

    fn op_check_bool(&mut self) -> ExecResult<ControlFlow<()>> {
        let offset = self.fetch()?.as_raw_i64();
        let before = self.local(offset)?.untag_int();
        let current = self.operand.len() as i64;
        if current != before + 1 {
            return Err(ExecError::AssertionError(format!(
                "expected one condition value, stack grew from {} to {}",
                before, current
            )));
        }
        let top = self.operand.peek()?;
        if !top.is_bool() {
            return Err(ExecError::TypeError { expected: "bool", got: self.render(top) });
        }
        Ok(ControlFlow::Continue(()))
    }

    fn op_goto(&mut self) -> ExecResult<ControlFlow<()>> {
        let offset = self.fetch()?.as_raw_i64();
        self.jump(offset)?;
        Ok(ControlFlow::Continue(()))
    }

    /// Only the FALSE literal jumps; every other value, including 0 and
    /// NIL, falls through.
    fn op_if_not(&mut self) -> ExecResult<ControlFlow<()>> {
        let offset = self.fetch()?.as_raw_i64();
        let condition = self.operand.pop()?;
        if condition == Cell::FALSE {
            self.jump(offset)?;
        }
        Ok(ControlFlow::Continue(()))
    }

    fn jump(&mut self, offset: i64) -> ExecResult<()> {
        let target = (self.pc as i64).checked_add(offset).filter(|&t| t >= 0);
        match target {
            Some(t) => {
                self.pc = t as usize;
                Ok(())
            }
            None => Err(ExecError::BadAddress(self.pc)),
        }
    }

    fn op_return(&mut self) -> ExecResult<ControlFlow<()>> {
        let ret = self.rstack.pop()?.as_raw_ptr();
        let func = self.rstack.pop()?.as_raw_ptr();
        let nlocals = self.heap.function_nlocals(func).ok_or(ExecError::BadAddress(func))?;
        self.rstack.pop_multiple(nlocals)?;
        self.pc = ret;
        Ok(ControlFlow::Continue(()))
    }

    fn op_halt(&mut self) -> ExecResult<ControlFlow<()>> {
        trace!(target: "filament::vm", "halt");
        Ok(ControlFlow::Break(()))
    }

    /// Finalise a lazy binding. Exactly one value must have been produced
    /// since the snapshot; it stays on the operand stack and becomes the
    /// record's value. A heap pointer stored this way must be a function
    /// object; immediate values pass as-is.
    fn op_done(&mut self) -> ExecResult<ControlFlow<()>> {
        let offset = self.fetch()?.as_raw_i64();
        let ident = self.fetch()?.bits() as usize;

        let produced = self.counted_args(offset)?;
        if produced != 1 {
            return Err(ExecError::AssertionError(format!(
                "lazy binding produced {} values, expected 1",
                produced
            )));
        }

        let value = self.operand.peek()?;
        if value.is_ptr() && !self.heap.is_function_object(value.untag_ptr()) {
            return Err(ExecError::AssertionError(format!(
                "lazy binding produced a non-function object: {}",
                self.render(value)
            )));
        }

        let record = self.ident_mut(ident)?;
        record.value = value;
        record.lazy = false;
        record.in_progress = false;
        trace!(target: "filament::vm::lazy", name = %record.name, "bound");
        Ok(ControlFlow::Continue(()))
    }

    /// Entry-frame construction for a synthesised launcher. The callee's
    /// parameters are taken implicitly from the operand stack top.
    fn op_launch(&mut self) -> ExecResult<ControlFlow<()>> {
        let func = self.fetch()?.as_raw_ptr();
        let nparams = self.heap.function_nparams(func).ok_or(ExecError::BadAddress(func))?;
        let ret = self.pc;
        self.push_frame(func, nparams, ret)?;
        Ok(ControlFlow::Continue(()))
    }
}

impl Default for Machine {
    fn default() -> Self {
        Machine::new()
    }
}

impl fmt::Debug for Machine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Machine")
            .field("pc", &self.pc)
            .field("operand", &self.operand)
            .field("rstack", &self.rstack)
            .field("globals", &self.globals.len())
            .field("heap", &self.heap)
            .finish()
    }
}
