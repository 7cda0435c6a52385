//! Threaded-code opcodes.
//!
//! In a compiled instruction stream the first cell of every instruction is
//! the raw id of its handler; the ids here are the indices into the
//! machine's handler table, so dispatch is one indexed call per
//! instruction. Each opcode is followed by a fixed number of operand
//! cells.
//!
//! Symbolic instructions that reference a global come in an eager/lazy
//! pair; the compiler picks the lazy variant when the referenced binding
//! is marked lazy. `label` never reaches this table: it is consumed at
//! compile time and emits no code.

use std::fmt;

/// Bytecode opcode enumeration. The discriminant is the handler id planted
/// in instruction streams.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    // === Pushes ===
    /// Push the tagged-int operand.
    PushInt = 0,
    /// Push the special-cell operand.
    PushBool = 1,
    /// Push the tagged pointer to a heap string.
    PushString = 2,
    /// Push the frame slot named by the raw offset operand.
    PushLocal = 3,
    /// Pop the top of the operand stack into a frame slot.
    PopLocal = 4,
    /// Push the value of the identity record named by the operand.
    PushGlobal = 5,
    /// Like PushGlobal, but forces the binding first and rewrites itself
    /// to PushGlobal.
    PushGlobalLazy = 6,

    // === Calls ===
    /// Call the function held by a global, with the argument count
    /// recovered from a frame-slot snapshot. Operands: raw frame offset,
    /// identity reference.
    CallGlobalCounted = 7,
    /// Lazy variant: forces the binding, then re-dispatches as the eager
    /// call.
    CallGlobalCountedLazy = 8,
    /// Invoke a built-in by registry id with a counted argument protocol.
    /// Operands: raw frame offset, raw registry id.
    SyscallCounted = 9,

    // === Counted-argument bookkeeping ===
    /// Record the current operand-stack size into a frame slot.
    StackLength = 10,
    /// Assert that exactly one value was pushed since the snapshot and
    /// that it is a boolean.
    CheckBool = 11,

    // === Control flow ===
    /// Unconditional relative jump; operand is a raw signed offset.
    Goto = 12,
    /// Pop; jump only when the popped cell is the FALSE literal.
    IfNot = 13,
    /// Unwind the current frame.
    Return = 14,
    /// Stop the current dispatch loop.
    Halt = 15,

    // === Binding finalisation ===
    /// Finalise a lazy binding: store the single produced value into the
    /// identity record and clear its lazy/in-progress flags. Operands:
    /// raw frame offset, identity reference.
    Done = 16,
    /// Build the entry frame for a function object, taking its parameters
    /// from the operand stack. Only synthesised launchers contain this.
    Launch = 17,
}

/// Number of opcodes; the handler table has exactly this many entries.
pub const OP_COUNT: usize = 18;

impl Op {
    pub fn from_u64(word: u64) -> Option<Op> {
        use Op::*;
        Some(match word {
            0 => PushInt,
            1 => PushBool,
            2 => PushString,
            3 => PushLocal,
            4 => PopLocal,
            5 => PushGlobal,
            6 => PushGlobalLazy,
            7 => CallGlobalCounted,
            8 => CallGlobalCountedLazy,
            9 => SyscallCounted,
            10 => StackLength,
            11 => CheckBool,
            12 => Goto,
            13 => IfNot,
            14 => Return,
            15 => Halt,
            16 => Done,
            17 => Launch,
            _ => return None,
        })
    }

    /// Fixed number of operand cells that follow the handler cell.
    pub fn operand_count(self) -> usize {
        use Op::*;
        match self {
            Return | Halt => 0,
            PushInt | PushBool | PushString | PushLocal | PopLocal | PushGlobal
            | PushGlobalLazy | StackLength | CheckBool | Goto | IfNot | Launch => 1,
            CallGlobalCounted | CallGlobalCountedLazy | SyscallCounted | Done => 2,
        }
    }

    pub fn name(self) -> &'static str {
        use Op::*;
        match self {
            PushInt => "PUSH_INT",
            PushBool => "PUSH_BOOL",
            PushString => "PUSH_STRING",
            PushLocal => "PUSH_LOCAL",
            PopLocal => "POP_LOCAL",
            PushGlobal => "PUSH_GLOBAL",
            PushGlobalLazy => "PUSH_GLOBAL_LAZY",
            CallGlobalCounted => "CALL_GLOBAL_COUNTED",
            CallGlobalCountedLazy => "CALL_GLOBAL_COUNTED_LAZY",
            SyscallCounted => "SYSCALL_COUNTED",
            StackLength => "STACK_LENGTH",
            CheckBool => "CHECK_BOOL",
            Goto => "GOTO",
            IfNot => "IF_NOT",
            Return => "RETURN",
            Halt => "HALT",
            Done => "DONE",
            Launch => "LAUNCH",
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Map a symbolic instruction type to its (eager, lazy) opcode pair. For
/// instructions without a global reference the two collapse. `label`,
/// which emits no code, is not in this table.
pub fn opcode_pair(type_name: &str) -> Option<(Op, Op)> {
    use Op::*;
    Some(match type_name {
        "push.int" => (PushInt, PushInt),
        "push.bool" => (PushBool, PushBool),
        "push.string" => (PushString, PushString),
        "push.local" => (PushLocal, PushLocal),
        "pop.local" => (PopLocal, PopLocal),
        "push.global" => (PushGlobal, PushGlobalLazy),
        "call.global.counted" => (CallGlobalCounted, CallGlobalCountedLazy),
        "syscall.counted" => (SyscallCounted, SyscallCounted),
        "stack.length" => (StackLength, StackLength),
        "check.bool" => (CheckBool, CheckBool),
        "goto" => (Goto, Goto),
        "if.not" => (IfNot, IfNot),
        "return" => (Return, Return),
        "halt" => (Halt, Halt),
        "done" => (Done, Done),
        _ => return None,
    })
}
