//! Compilation of symbolic instructions into threaded code.
//!
//! A binding's body arrives as a JSON document listing symbolic
//! instructions. The compiler maps each to its handler id plus operand
//! cells, resolving global names to identity references, system-function
//! names to registry ids, local indices to frame offsets, and labels to
//! relative jump offsets (with forward references patched when the label
//! is reached). Instructions that reference a binding marked lazy in the
//! dependency view get the lazy opcode variant.
//!
//! Every identity record a body mentions must already exist: the loader
//! defines placeholder records for the whole dependency closure before
//! compiling any body, so even mutually recursive bindings resolve.

use std::collections::HashMap;

use serde::Deserialize;
use tracing::trace;

use super::cell::Cell;
use super::globals::Globals;
use super::heap::{Heap, HeapError};
use super::opcodes::{opcode_pair, Op};
use super::sysfn::SysRegistry;

/// Which referenced bindings are lazy, as reported by the bundle.
pub type LazyView = HashMap<String, bool>;

/// A compiled function ready to be placed in the heap.
#[derive(Debug, Clone)]
pub struct FunctionObject {
    pub nlocals: u16,
    pub nparams: u16,
    /// Threaded instruction stream, terminated by a safety HALT.
    pub code: Vec<Cell>,
}

/// Compiler error types.
#[derive(Debug, Clone, PartialEq)]
pub enum CompileError {
    /// The body was not valid JSON of the expected shape.
    Json(String),
    /// An instruction type string has no opcode mapping.
    UnknownOpcode(String),
    /// An instruction is missing a field its opcode requires.
    MissingField { field: &'static str, opcode: String },
    /// A field is present but holds an unusable value.
    InvalidField { field: &'static str, opcode: String },
    /// Jumps were made to labels never defined.
    UnresolvedLabel(Vec<String>),
    /// A referenced global has no identity record.
    UndefinedGlobal(String),
    /// A syscall names an unregistered system function.
    UnknownSysFunction(String),
    /// Local counts do not fit the packed metadata field.
    TooManyLocals { nlocals: i64, nparams: i64 },
    /// String allocation exhausted the heap.
    Heap(HeapError),
}

impl std::fmt::Display for CompileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Json(msg) => write!(f, "malformed function body: {}", msg),
            Self::UnknownOpcode(name) => write!(f, "unknown instruction type: {}", name),
            Self::MissingField { field, opcode } => {
                write!(f, "{} requires a {} field", opcode, field)
            }
            Self::InvalidField { field, opcode } => {
                write!(f, "{} has an invalid {} field", opcode, field)
            }
            Self::UnresolvedLabel(names) => {
                write!(f, "unresolved label references: {}", names.join(", "))
            }
            Self::UndefinedGlobal(name) => write!(f, "undefined global: {}", name),
            Self::UnknownSysFunction(name) => write!(f, "unknown system function: {}", name),
            Self::TooManyLocals { nlocals, nparams } => {
                write!(f, "bad local counts: nlocals={}, nparams={}", nlocals, nparams)
            }
            Self::Heap(err) => write!(f, "{}", err),
        }
    }
}

impl std::error::Error for CompileError {}

impl From<HeapError> for CompileError {
    fn from(err: HeapError) -> CompileError {
        CompileError::Heap(err)
    }
}

pub type CompileResult<T> = Result<T, CompileError>;

/// JSON shape of a function body.
#[derive(Debug, Deserialize)]
struct Body {
    nlocals: i64,
    nparams: i64,
    instructions: Vec<RawInstruction>,
}

/// JSON shape of one symbolic instruction. Only the fields the type needs
/// are populated.
#[derive(Debug, Deserialize)]
struct RawInstruction {
    #[serde(rename = "type")]
    type_name: String,
    #[serde(default)]
    index: Option<i64>,
    #[serde(default)]
    ivalue: Option<i64>,
    #[serde(default)]
    value: Option<String>,
    #[serde(default)]
    name: Option<String>,
}

/// One-shot compiler for a single function body.
pub struct FunctionCompiler<'a> {
    heap: &'a mut Heap,
    globals: &'a Globals,
    sysfns: &'a SysRegistry,
    deps: &'a LazyView,
    binding_name: &'a str,

    nlocals: i64,
    code: Vec<Cell>,
    /// Label name → instruction-stream position.
    labels: HashMap<String, usize>,
    /// Label name → operand positions awaiting a patch.
    forward_refs: HashMap<String, Vec<usize>>,
}

impl<'a> FunctionCompiler<'a> {
    pub fn new(
        heap: &'a mut Heap,
        globals: &'a Globals,
        sysfns: &'a SysRegistry,
        deps: &'a LazyView,
        binding_name: &'a str,
    ) -> FunctionCompiler<'a> {
        FunctionCompiler {
            heap,
            globals,
            sysfns,
            deps,
            binding_name,
            nlocals: 0,
            code: Vec::new(),
            labels: HashMap::new(),
            forward_refs: HashMap::new(),
        }
    }

    pub fn compile(mut self, body: &str) -> CompileResult<FunctionObject> {
        let body: Body = serde_json::from_str(body).map_err(|e| CompileError::Json(e.to_string()))?;

        if body.nlocals < 0
            || body.nparams < 0
            || body.nlocals > u16::MAX as i64
            || body.nparams > body.nlocals
        {
            return Err(CompileError::TooManyLocals {
                nlocals: body.nlocals,
                nparams: body.nparams,
            });
        }
        self.nlocals = body.nlocals;

        trace!(
            target: "filament::compile",
            binding = self.binding_name,
            nlocals = body.nlocals,
            nparams = body.nparams,
            instructions = body.instructions.len(),
            "compiling"
        );

        for inst in &body.instructions {
            self.plant(inst)?;
        }

        if !self.forward_refs.is_empty() {
            let mut names: Vec<String> = self.forward_refs.keys().cloned().collect();
            names.sort();
            return Err(CompileError::UnresolvedLabel(names));
        }

        // Safety terminator after the last user instruction.
        self.emit_op(Op::Halt);

        Ok(FunctionObject {
            nlocals: body.nlocals as u16,
            nparams: body.nparams as u16,
            code: self.code,
        })
    }

    fn plant(&mut self, inst: &RawInstruction) -> CompileResult<()> {
        // A label records a position; it emits no code.
        if inst.type_name == "label" {
            return self.plant_label(inst);
        }

        let (eager, lazy) = opcode_pair(&inst.type_name)
            .ok_or_else(|| CompileError::UnknownOpcode(inst.type_name.clone()))?;

        let is_lazy = match &inst.name {
            Some(name) => self.deps.get(name.as_str()).copied().unwrap_or(false),
            None => false,
        };
        let op = if is_lazy { lazy } else { eager };

        self.emit_op(op);
        match op {
            Op::PushInt => {
                let ivalue = require(inst.ivalue, "ivalue", op)?;
                self.code.push(Cell::tag_int(ivalue));
            }
            Op::PushBool => {
                let value = require_ref(&inst.value, "value", op)?;
                let cell = match value.as_str() {
                    "true" => Cell::TRUE,
                    "false" => Cell::FALSE,
                    _ => {
                        return Err(CompileError::InvalidField {
                            field: "value",
                            opcode: op.name().to_string(),
                        })
                    }
                };
                self.code.push(cell);
            }
            Op::PushString => {
                let value = require_ref(&inst.value, "value", op)?;
                let obj = self.heap.alloc_string(value)?;
                self.code.push(Cell::tag_ptr(obj));
            }
            Op::PushLocal | Op::PopLocal => {
                let index = require(inst.index, "index", op)?;
                self.code.push(Cell::raw_i64(self.frame_offset(index)));
            }
            Op::PushGlobal | Op::PushGlobalLazy => {
                let ident = self.resolve_global(inst, op)?;
                self.code.push(Cell::raw_u64(ident as u64));
            }
            Op::CallGlobalCounted | Op::CallGlobalCountedLazy | Op::Done => {
                let index = require(inst.index, "index", op)?;
                let ident = self.resolve_global(inst, op)?;
                self.code.push(Cell::raw_i64(self.frame_offset(index)));
                self.code.push(Cell::raw_u64(ident as u64));
            }
            Op::SyscallCounted => {
                let index = require(inst.index, "index", op)?;
                let name = require_ref(&inst.name, "name", op)?;
                let id = self
                    .sysfns
                    .lookup(name)
                    .ok_or_else(|| CompileError::UnknownSysFunction(name.clone()))?;
                self.code.push(Cell::raw_i64(self.frame_offset(index)));
                self.code.push(Cell::raw_u64(id));
            }
            Op::StackLength | Op::CheckBool => {
                let index = require(inst.index, "index", op)?;
                self.code.push(Cell::raw_i64(self.frame_offset(index)));
            }
            Op::Goto | Op::IfNot => {
                let label = require_ref(&inst.value, "value", op)?.clone();
                self.plant_jump_operand(&label);
            }
            Op::Return | Op::Halt => {}
            Op::Launch => {
                // Launchers are synthesised by the machine, never written
                // in a body.
                return Err(CompileError::UnknownOpcode(inst.type_name.clone()));
            }
        }
        Ok(())
    }

    fn emit_op(&mut self, op: Op) {
        self.code.push(Cell::raw_u64(op as u64));
    }

    /// Frame offset for symbolic local `i`: counted down from the return
    /// stack top past the two saved frame cells.
    fn frame_offset(&self, index: i64) -> i64 {
        self.nlocals - index + 2
    }

    fn resolve_global(&self, inst: &RawInstruction, op: Op) -> CompileResult<usize> {
        let name = require_ref(&inst.name, "name", op)?;
        self.globals
            .lookup(name)
            .ok_or_else(|| CompileError::UndefinedGlobal(name.clone()))
    }

    fn plant_label(&mut self, inst: &RawInstruction) -> CompileResult<()> {
        let name = match &inst.value {
            Some(name) => name.clone(),
            None => {
                return Err(CompileError::MissingField {
                    field: "value",
                    opcode: "label".to_string(),
                })
            }
        };

        let position = self.code.len();
        self.labels.insert(name.clone(), position);

        // Patch every jump that was waiting on this label.
        if let Some(refs) = self.forward_refs.remove(&name) {
            for operand_pos in refs {
                let offset = position as i64 - (operand_pos as i64 + 1);
                self.code[operand_pos] = Cell::raw_i64(offset);
            }
        }
        trace!(target: "filament::compile", binding = self.binding_name, label = %name, position, "label");
        Ok(())
    }

    /// Emit the offset operand for a jump. Backward targets resolve
    /// immediately; forward targets get a placeholder patched at label
    /// time. Offsets are relative to the cell after the operand.
    fn plant_jump_operand(&mut self, label: &str) {
        let operand_pos = self.code.len();
        self.code.push(Cell::ZERO);

        if let Some(&target) = self.labels.get(label) {
            let offset = target as i64 - (operand_pos as i64 + 1);
            self.code[operand_pos] = Cell::raw_i64(offset);
        } else {
            self.forward_refs.entry(label.to_string()).or_default().push(operand_pos);
        }
    }
}

fn require(field: Option<i64>, name: &'static str, op: Op) -> CompileResult<i64> {
    field.ok_or(CompileError::MissingField { field: name, opcode: op.name().to_string() })
}

fn require_ref<'v>(
    field: &'v Option<String>,
    name: &'static str,
    op: Op,
) -> CompileResult<&'v String> {
    field
        .as_ref()
        .ok_or(CompileError::MissingField { field: name, opcode: op.name().to_string() })
}
