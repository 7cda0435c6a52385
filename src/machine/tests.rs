//! Execution tests for the threaded interpreter.

use std::cell::RefCell;
use std::io::Write;
use std::rc::Rc;

use super::cell::{Cell, CellIdx};
use super::compiler::LazyView;
use super::opcodes::Op;
use super::{ExecError, Machine, MachineConfig};

/// An output sink the test can read back after the machine wrote to it.
#[derive(Clone, Default)]
struct SharedOut(Rc<RefCell<Vec<u8>>>);

impl SharedOut {
    fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.borrow()).into_owned()
    }
}

impl Write for SharedOut {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn capture(machine: &mut Machine) -> SharedOut {
    let out = SharedOut::default();
    machine.set_output(Box::new(out.clone()));
    out
}

/// Plant raw threaded code as a function object and return its index.
fn plant(machine: &mut Machine, code: &[Cell], nlocals: u16, nparams: u16) -> CellIdx {
    machine.heap_mut().alloc_function(code, nlocals, nparams).unwrap()
}

fn op(opcode: Op) -> Cell {
    Cell::raw_u64(opcode as u64)
}

/// Compile a JSON body, place it in the heap, and bind it to `name`.
/// The placeholder record must already exist when the body references
/// other globals.
fn define_compiled(
    machine: &mut Machine,
    name: &str,
    lazy: bool,
    deps: &LazyView,
    body: &str,
) -> CellIdx {
    machine.define_global(name, Cell::UNDEF, lazy);
    let func = machine.compile_function(name, deps, body).unwrap();
    let obj = machine.add_function(&func).unwrap();
    machine.define_global(name, Cell::tag_ptr(obj), lazy);
    obj
}

#[test]
fn executes_simple_pushes() {
    let mut machine = Machine::new();
    let code = [
        op(Op::PushInt),
        Cell::tag_int(42),
        op(Op::PushInt),
        Cell::tag_int(100),
        op(Op::Halt),
    ];
    let func = plant(&mut machine, &code, 0, 0);
    machine.execute(func).unwrap();

    assert_eq!(machine.stack_size(), 2);
    assert_eq!(machine.pop().unwrap().untag_int(), 100);
    assert_eq!(machine.pop().unwrap().untag_int(), 42);
}

#[test]
fn goto_skips_over_code() {
    let mut machine = Machine::new();
    let code = [
        op(Op::PushInt),
        Cell::tag_int(1),
        op(Op::Goto),
        Cell::raw_i64(2),
        op(Op::PushInt),
        Cell::tag_int(999),
        op(Op::PushInt),
        Cell::tag_int(2),
        op(Op::Halt),
    ];
    let func = plant(&mut machine, &code, 0, 0);
    machine.execute(func).unwrap();

    assert_eq!(machine.stack_size(), 2);
    assert_eq!(machine.pop().unwrap().untag_int(), 2);
    assert_eq!(machine.pop().unwrap().untag_int(), 1);
}

#[test]
fn goto_pair_restores_pc() {
    // GOTO k followed by GOTO -k brings pc back where it started.
    let mut machine = Machine::new();
    let code = [
        op(Op::Goto),
        Cell::raw_i64(2),
        op(Op::PushInt),
        Cell::tag_int(42),
        op(Op::Goto),
        Cell::raw_i64(-6),
    ];
    let func = plant(&mut machine, &code, 0, 0);
    let start = machine.heap().function_code(func);

    machine.pc = start;
    machine.step().unwrap();
    assert_eq!(machine.pc, start + 4);
    machine.step().unwrap();
    assert_eq!(machine.pc, start);
    assert_eq!(machine.stack_size(), 0);
}

enum Condition {
    Literal(Cell),
    AString,
}

#[test]
fn if_not_jumps_only_on_false() {
    // Values that are not the FALSE literal all fall through, including
    // zero, nil, and heap strings.
    for (condition, expect_jump) in [
        (Condition::Literal(Cell::FALSE), true),
        (Condition::Literal(Cell::TRUE), false),
        (Condition::Literal(Cell::tag_int(0)), false),
        (Condition::Literal(Cell::NIL), false),
        (Condition::AString, false),
    ] {
        let mut machine = Machine::new();
        let condition = match condition {
            Condition::Literal(cell) => cell,
            Condition::AString => machine.alloc_string("truthy").unwrap(),
        };
        let code = [
            op(Op::PushBool),
            condition,
            op(Op::IfNot),
            Cell::raw_i64(2),
            op(Op::PushInt),
            Cell::tag_int(99),
            op(Op::PushInt),
            Cell::tag_int(42),
            op(Op::Halt),
        ];
        let func = plant(&mut machine, &code, 0, 0);
        machine.execute(func).unwrap();

        assert_eq!(machine.pop().unwrap().untag_int(), 42);
        if expect_jump {
            assert_eq!(machine.stack_size(), 0, "{:?} should jump", condition);
        } else {
            assert_eq!(machine.pop().unwrap().untag_int(), 99, "{:?} should fall through", condition);
        }
    }
}

#[test]
fn pop_local_writes_the_frame_slot() {
    let mut machine = Machine::new();
    let deps = LazyView::new();
    let func = define_compiled(
        &mut machine,
        "main",
        false,
        &deps,
        r#"{"nlocals": 1, "nparams": 0, "instructions": [
            {"type": "push.int", "ivalue": 9},
            {"type": "pop.local", "index": 0},
            {"type": "push.local", "index": 0},
            {"type": "push.local", "index": 0},
            {"type": "halt"}
        ]}"#,
    );
    machine.execute(func).unwrap();

    assert_eq!(machine.stack_size(), 2);
    assert_eq!(machine.pop().unwrap().untag_int(), 9);
    assert_eq!(machine.pop().unwrap().untag_int(), 9);
}

#[test]
fn first_pushed_argument_is_local_zero() {
    let mut machine = Machine::new();
    let deps = LazyView::new();
    define_compiled(
        &mut machine,
        "first",
        false,
        &deps,
        r#"{"nlocals": 2, "nparams": 2, "instructions": [
            {"type": "push.local", "index": 0},
            {"type": "return"}
        ]}"#,
    );
    let main = define_compiled(
        &mut machine,
        "main",
        false,
        &deps,
        r#"{"nlocals": 1, "nparams": 0, "instructions": [
            {"type": "stack.length", "index": 0},
            {"type": "push.int", "ivalue": 11},
            {"type": "push.int", "ivalue": 22},
            {"type": "call.global.counted", "index": 0, "name": "first"},
            {"type": "halt"}
        ]}"#,
    );

    let operand_before = machine.stack_size();
    machine.execute(main).unwrap();

    // The callee saw the first-pushed value as local 0.
    assert_eq!(machine.stack_size(), operand_before + 1);
    assert_eq!(machine.pop().unwrap().untag_int(), 11);
    // All frames unwound.
    assert_eq!(machine.return_stack_size(), 0);
}

#[test]
fn call_arity_mismatch() {
    let mut machine = Machine::new();
    let deps = LazyView::new();
    define_compiled(
        &mut machine,
        "two",
        false,
        &deps,
        r#"{"nlocals": 2, "nparams": 2, "instructions": [{"type": "return"}]}"#,
    );
    let main = define_compiled(
        &mut machine,
        "main",
        false,
        &deps,
        r#"{"nlocals": 1, "nparams": 0, "instructions": [
            {"type": "stack.length", "index": 0},
            {"type": "push.int", "ivalue": 1},
            {"type": "call.global.counted", "index": 0, "name": "two"}
        ]}"#,
    );

    let err = machine.execute(main).unwrap_err();
    assert_eq!(err, ExecError::ArityError { expected: 2, got: 1 });
}

#[test]
fn calling_a_non_function_global() {
    let mut machine = Machine::new();
    machine.define_global("n", Cell::tag_int(5), false);
    let deps = LazyView::new();
    let main = define_compiled(
        &mut machine,
        "main",
        false,
        &deps,
        r#"{"nlocals": 1, "nparams": 0, "instructions": [
            {"type": "stack.length", "index": 0},
            {"type": "call.global.counted", "index": 0, "name": "n"}
        ]}"#,
    );

    assert!(matches!(
        machine.execute(main),
        Err(ExecError::TypeError { expected: "function", .. })
    ));
}

#[test]
fn println_through_the_machine() {
    let mut machine = Machine::new();
    let out = capture(&mut machine);
    let deps = LazyView::new();
    let main = define_compiled(
        &mut machine,
        "main",
        false,
        &deps,
        r#"{"nlocals": 1, "nparams": 0, "instructions": [
            {"type": "stack.length", "index": 0},
            {"type": "push.string", "value": "hello"},
            {"type": "syscall.counted", "index": 0, "name": "println"},
            {"type": "halt"}
        ]}"#,
    );
    machine.execute(main).unwrap();

    assert_eq!(out.text(), "hello\n");
    assert_eq!(machine.stack_size(), 0);
}

#[test]
fn arithmetic_through_syscalls() {
    let mut machine = Machine::new();
    let out = capture(&mut machine);
    let deps = LazyView::new();
    let main = define_compiled(
        &mut machine,
        "main",
        false,
        &deps,
        r#"{"nlocals": 1, "nparams": 0, "instructions": [
            {"type": "stack.length", "index": 0},
            {"type": "push.int", "ivalue": 3},
            {"type": "push.int", "ivalue": 4},
            {"type": "syscall.counted", "index": 0, "name": "+"},
            {"type": "syscall.counted", "index": 0, "name": "println"},
            {"type": "halt"}
        ]}"#,
    );
    machine.execute(main).unwrap();

    assert_eq!(out.text(), "7\n");
}

#[test]
fn countdown_loop_with_backward_jump() {
    let mut machine = Machine::new();
    let deps = LazyView::new();
    let main = define_compiled(
        &mut machine,
        "main",
        false,
        &deps,
        r#"{"nlocals": 2, "nparams": 0, "instructions": [
            {"type": "push.int", "ivalue": 3},
            {"type": "pop.local", "index": 0},
            {"type": "label", "value": "top"},
            {"type": "stack.length", "index": 1},
            {"type": "push.local", "index": 0},
            {"type": "push.int", "ivalue": 0},
            {"type": "syscall.counted", "index": 1, "name": ">"},
            {"type": "check.bool", "index": 1},
            {"type": "if.not", "value": "end"},
            {"type": "stack.length", "index": 1},
            {"type": "push.local", "index": 0},
            {"type": "push.int", "ivalue": 1},
            {"type": "syscall.counted", "index": 1, "name": "-"},
            {"type": "pop.local", "index": 0},
            {"type": "goto", "value": "top"},
            {"type": "label", "value": "end"},
            {"type": "push.local", "index": 0},
            {"type": "halt"}
        ]}"#,
    );
    machine.execute(main).unwrap();

    assert_eq!(machine.stack_size(), 1);
    assert_eq!(machine.pop().unwrap().untag_int(), 0);
}

#[test]
fn check_bool_rejects_non_bool_witness() {
    let mut machine = Machine::new();
    let deps = LazyView::new();
    let main = define_compiled(
        &mut machine,
        "main",
        false,
        &deps,
        r#"{"nlocals": 1, "nparams": 0, "instructions": [
            {"type": "stack.length", "index": 0},
            {"type": "push.int", "ivalue": 5},
            {"type": "check.bool", "index": 0}
        ]}"#,
    );

    assert!(matches!(
        machine.execute(main),
        Err(ExecError::TypeError { expected: "bool", .. })
    ));
}

#[test]
fn check_bool_rejects_wrong_count() {
    let mut machine = Machine::new();
    let deps = LazyView::new();
    let main = define_compiled(
        &mut machine,
        "main",
        false,
        &deps,
        r#"{"nlocals": 1, "nparams": 0, "instructions": [
            {"type": "stack.length", "index": 0},
            {"type": "push.bool", "value": "true"},
            {"type": "push.bool", "value": "false"},
            {"type": "check.bool", "index": 0}
        ]}"#,
    );

    assert!(matches!(machine.execute(main), Err(ExecError::AssertionError(_))));
}

#[test]
fn lazy_global_forces_once_and_caches() {
    let mut machine = Machine::new();
    let out = capture(&mut machine);
    let mut deps = LazyView::new();
    deps.insert("a".to_string(), true);

    // The thunk announces itself so re-execution is observable.
    define_compiled(
        &mut machine,
        "a",
        true,
        &deps,
        r#"{"nlocals": 1, "nparams": 0, "instructions": [
            {"type": "stack.length", "index": 0},
            {"type": "push.string", "value": "forced"},
            {"type": "syscall.counted", "index": 0, "name": "println"},
            {"type": "push.int", "ivalue": 7},
            {"type": "done", "index": 0, "name": "a"}
        ]}"#,
    );
    let main = define_compiled(
        &mut machine,
        "main",
        false,
        &deps,
        r#"{"nlocals": 1, "nparams": 0, "instructions": [
            {"type": "stack.length", "index": 0},
            {"type": "push.global", "name": "a"},
            {"type": "syscall.counted", "index": 0, "name": "println"},
            {"type": "halt"}
        ]}"#,
    );

    machine.execute(main).unwrap();
    assert_eq!(out.text(), "forced\n7\n");

    // The record now holds the cached value eagerly.
    let record = machine.globals().get(machine.globals().lookup("a").unwrap()).unwrap();
    assert!(!record.lazy);
    assert!(!record.in_progress);
    assert_eq!(record.value.untag_int(), 7);

    // A second run reads the cache; the thunk does not execute again.
    machine.execute(main).unwrap();
    assert_eq!(out.text(), "forced\n7\n7\n");
    assert_eq!(machine.return_stack_size(), 0);
}

#[test]
fn stale_lazy_instruction_rewrites_itself() {
    let mut machine = Machine::new();
    let out = capture(&mut machine);
    let mut deps = LazyView::new();
    deps.insert("a".to_string(), true);

    define_compiled(
        &mut machine,
        "a",
        true,
        &deps,
        r#"{"nlocals": 1, "nparams": 0, "instructions": [
            {"type": "stack.length", "index": 0},
            {"type": "push.int", "ivalue": 7},
            {"type": "done", "index": 0, "name": "a"}
        ]}"#,
    );
    let first = define_compiled(
        &mut machine,
        "first",
        false,
        &deps,
        r#"{"nlocals": 1, "nparams": 0, "instructions": [
            {"type": "stack.length", "index": 0},
            {"type": "push.global", "name": "a"},
            {"type": "syscall.counted", "index": 0, "name": "println"},
            {"type": "halt"}
        ]}"#,
    );
    // A second call site compiled against the lazy view, reached only
    // after the binding was already forced.
    let second = define_compiled(
        &mut machine,
        "second",
        false,
        &deps,
        r#"{"nlocals": 1, "nparams": 0, "instructions": [
            {"type": "stack.length", "index": 0},
            {"type": "push.global", "name": "a"},
            {"type": "syscall.counted", "index": 0, "name": "println"},
            {"type": "halt"}
        ]}"#,
    );

    machine.execute(first).unwrap();
    machine.execute(second).unwrap();
    machine.execute(second).unwrap();
    assert_eq!(out.text(), "7\n7\n7\n");

    // The stale instruction rewrote itself to the eager handler.
    let code = machine.heap().function_code(second);
    assert_eq!(machine.heap().get(code + 2).unwrap().bits(), Op::PushGlobal as u64);
}

#[test]
fn lazy_call_forces_then_calls() {
    let mut machine = Machine::new();
    let out = capture(&mut machine);
    let mut deps = LazyView::new();
    deps.insert("a".to_string(), true);
    deps.insert("adder".to_string(), false);

    // An eager function of two parameters.
    define_compiled(
        &mut machine,
        "adder",
        false,
        &deps,
        r#"{"nlocals": 3, "nparams": 2, "instructions": [
            {"type": "stack.length", "index": 2},
            {"type": "push.local", "index": 0},
            {"type": "push.local", "index": 1},
            {"type": "syscall.counted", "index": 2, "name": "+"},
            {"type": "return"}
        ]}"#,
    );
    // A lazy binding whose value is that function.
    define_compiled(
        &mut machine,
        "a",
        true,
        &deps,
        r#"{"nlocals": 1, "nparams": 0, "instructions": [
            {"type": "stack.length", "index": 0},
            {"type": "push.global", "name": "adder"},
            {"type": "done", "index": 0, "name": "a"}
        ]}"#,
    );
    let main = define_compiled(
        &mut machine,
        "main",
        false,
        &deps,
        r#"{"nlocals": 1, "nparams": 0, "instructions": [
            {"type": "stack.length", "index": 0},
            {"type": "push.int", "ivalue": 5},
            {"type": "push.int", "ivalue": 6},
            {"type": "call.global.counted", "index": 0, "name": "a"},
            {"type": "syscall.counted", "index": 0, "name": "println"},
            {"type": "halt"}
        ]}"#,
    );

    machine.execute(main).unwrap();
    assert_eq!(out.text(), "11\n");

    // Forcing resolved the binding to the function object itself.
    let a_value = machine.global_value("a").unwrap();
    let adder_value = machine.global_value("adder").unwrap();
    assert_eq!(a_value, adder_value);

    // Run again: the call site is eager now.
    machine.execute(main).unwrap();
    assert_eq!(out.text(), "11\n11\n");
}

#[test]
fn recursive_lazy_force_is_detected() {
    let mut machine = Machine::new();
    let mut deps = LazyView::new();
    deps.insert("a".to_string(), true);

    define_compiled(
        &mut machine,
        "a",
        true,
        &deps,
        r#"{"nlocals": 1, "nparams": 0, "instructions": [
            {"type": "stack.length", "index": 0},
            {"type": "push.global", "name": "a"},
            {"type": "done", "index": 0, "name": "a"}
        ]}"#,
    );
    let main = define_compiled(
        &mut machine,
        "main",
        false,
        &deps,
        r#"{"nlocals": 1, "nparams": 0, "instructions": [
            {"type": "stack.length", "index": 0},
            {"type": "push.global", "name": "a"},
            {"type": "halt"}
        ]}"#,
    );

    assert_eq!(
        machine.execute(main).unwrap_err(),
        ExecError::RecursiveLazyForce("a".to_string())
    );
}

#[test]
fn done_requires_exactly_one_value() {
    let mut machine = Machine::new();
    let mut deps = LazyView::new();
    deps.insert("a".to_string(), true);

    define_compiled(
        &mut machine,
        "a",
        true,
        &deps,
        r#"{"nlocals": 1, "nparams": 0, "instructions": [
            {"type": "stack.length", "index": 0},
            {"type": "push.int", "ivalue": 1},
            {"type": "push.int", "ivalue": 2},
            {"type": "done", "index": 0, "name": "a"}
        ]}"#,
    );
    let main = define_compiled(
        &mut machine,
        "main",
        false,
        &deps,
        r#"{"nlocals": 1, "nparams": 0, "instructions": [
            {"type": "stack.length", "index": 0},
            {"type": "push.global", "name": "a"},
            {"type": "halt"}
        ]}"#,
    );

    assert!(matches!(machine.execute(main), Err(ExecError::AssertionError(_))));
}

#[test]
fn done_rejects_non_function_heap_objects() {
    let mut machine = Machine::new();
    let mut deps = LazyView::new();
    deps.insert("a".to_string(), true);

    // The thunk produces a string object, which may not be bound.
    define_compiled(
        &mut machine,
        "a",
        true,
        &deps,
        r#"{"nlocals": 1, "nparams": 0, "instructions": [
            {"type": "stack.length", "index": 0},
            {"type": "push.string", "value": "oops"},
            {"type": "done", "index": 0, "name": "a"}
        ]}"#,
    );
    let main = define_compiled(
        &mut machine,
        "main",
        false,
        &deps,
        r#"{"nlocals": 1, "nparams": 0, "instructions": [
            {"type": "stack.length", "index": 0},
            {"type": "push.global", "name": "a"},
            {"type": "halt"}
        ]}"#,
    );

    assert!(matches!(machine.execute(main), Err(ExecError::AssertionError(_))));
}

#[test]
fn pop_on_empty_stack_underflows() {
    let mut machine = Machine::new();
    assert_eq!(machine.pop().unwrap_err(), ExecError::StackUnderflow);
}

#[test]
fn heap_exhaustion_is_out_of_memory() {
    let mut machine = Machine::with_config(MachineConfig {
        heap_cells: 64,
        ..MachineConfig::default()
    });
    let long = "x".repeat(4096);
    let used = machine.heap().pool().next_free();

    let err = machine.alloc_string(&long).unwrap_err();
    assert!(matches!(err, ExecError::OutOfMemory { .. }));
    assert_eq!(machine.heap().pool().next_free(), used);
}

#[test]
fn executing_a_non_function_fails() {
    let mut machine = Machine::new();
    let s = machine.alloc_string("text").unwrap();
    assert!(matches!(
        machine.execute(s.untag_ptr()),
        Err(ExecError::TypeError { expected: "function object", .. })
    ));
}

#[test]
fn compile_then_execute_leaves_the_value() {
    // A body of push.int V / return leaves tag_int(V) on the operand
    // stack once executed.
    let mut machine = Machine::new();
    let deps = LazyView::new();
    let main = define_compiled(
        &mut machine,
        "main",
        false,
        &deps,
        r#"{"nlocals": 0, "nparams": 0, "instructions": [
            {"type": "push.int", "ivalue": 1234},
            {"type": "return"}
        ]}"#,
    );
    machine.execute(main).unwrap();

    assert_eq!(machine.stack_size(), 1);
    assert_eq!(machine.pop().unwrap(), Cell::tag_int(1234));
    assert_eq!(machine.return_stack_size(), 0);
}
