// Integration tests for the Ruff bytecode VM.
//
// Exercises the pipeline end to end (source text -> compiler -> chunk ->
// VM) through the public `ruff` library API, covering the concrete
// scenarios spec.md §8 calls out plus the GC-stress safety property.
// `print` writes straight to stdout, so most assertions here read results
// back out of globals rather than capturing process output — the same
// style the unit tests in `vm.rs` already use.

use ruff::value::Value;
use ruff::vm::{InterpretError, Vm};

fn run(source: &str) -> Vm {
    let mut vm = Vm::new();
    match vm.interpret(source) {
        Ok(()) => vm,
        Err(InterpretError::Compile(errs)) => panic!(
            "unexpected compile error: {}",
            errs.iter().map(|e| e.to_string()).collect::<Vec<_>>().join("; ")
        ),
        Err(InterpretError::Runtime(e)) => panic!("unexpected runtime error: {}", e),
    }
}

/// Reads back a global's value by compiling and running it as a bare REPL
/// expression against the already-mutated `vm`. Avoids reaching into the
/// VM's private `globals` map from outside the crate — the REPL-line path
/// (`interpret_repl_line`) is the public surface for exactly this.
fn global(vm: &mut Vm, name: &str) -> Value {
    match vm.interpret_repl_line(name) {
        Ok(Some(v)) => v,
        Ok(None) => panic!("global '{}' produced no value", name),
        Err(InterpretError::Compile(errs)) => panic!(
            "unexpected compile error reading '{}': {}",
            name,
            errs.iter().map(|e| e.to_string()).collect::<Vec<_>>().join("; ")
        ),
        Err(InterpretError::Runtime(e)) => panic!("global '{}' not found: {}", name, e),
    }
}

#[test]
fn arithmetic_precedence_matches_standard_order() {
    // spec.md §8 scenario 1: `print 1 + 2 * 3;` -> 7
    let mut vm = run("let result = 1 + 2 * 3;");
    assert_eq!(global(&mut vm, "result"), Value::Number(7.0));
}

#[test]
fn interned_strings_compare_equal() {
    // spec.md §8 scenario 2
    let mut vm = run("let a = \"foo\"; let b = \"foo\"; let same = a == b;");
    assert_eq!(global(&mut vm, "same"), Value::Bool(true));
}

#[test]
fn closures_keep_independent_captured_state_per_instance() {
    // spec.md §8 scenario 3, extended: two counters must not share a cell.
    let mut vm = run(
        "fn make() {
             let x = 0;
             fn inc() { x = x + 1; return x; }
             return inc;
         }
         let f = make();
         let g = make();
         let f1 = f();
         let f2 = f();
         let f3 = f();
         let g1 = g();",
    );
    assert_eq!(global(&mut vm, "f1"), Value::Number(1.0));
    assert_eq!(global(&mut vm, "f2"), Value::Number(2.0));
    assert_eq!(global(&mut vm, "f3"), Value::Number(3.0));
    assert_eq!(global(&mut vm, "g1"), Value::Number(1.0));
}

#[test]
fn division_by_zero_is_a_runtime_error_with_clean_stack() {
    // spec.md §8 scenario 4
    let mut vm = Vm::new();
    let err = match vm.interpret("let x = 1 / 0;") {
        Err(InterpretError::Runtime(e)) => e,
        other => panic!("expected runtime error, got {:?}", other.is_ok()),
    };
    assert!(err.message.contains("divide by zero"));
    // The VM must be reusable after a runtime error: a fresh statement
    // should still run cleanly.
    vm.interpret("let y = 1 + 1;").expect("vm should recover after a runtime error");
}

#[test]
fn while_loop_counts_up() {
    // spec.md §8 scenario 5
    let mut vm = run("let i = 0; while (i < 3) { i = i + 1; }");
    assert_eq!(global(&mut vm, "i"), Value::Number(3.0));
}

#[test]
fn array_indexing_set_and_get_round_trip() {
    // spec.md §8 scenario 6
    let mut vm = run("let a = [10, 20, 30]; a[1] = 99; let got = a[1];");
    assert_eq!(global(&mut vm, "got"), Value::Number(99.0));
}

#[test]
fn dict_literal_and_indexing() {
    let mut vm = run("let d = {\"a\": 1, \"b\": 2}; let v = d[\"b\"];");
    assert_eq!(global(&mut vm, "v"), Value::Number(2.0));
}

#[test]
fn recursive_function_computes_fibonacci() {
    let mut vm = run(
        "fn fib(n) {
             if (n < 2) { return n; }
             return fib(n - 1) + fib(n - 2);
         }
         let result = fib(10);",
    );
    assert_eq!(global(&mut vm, "result"), Value::Number(55.0));
}

#[test]
fn wrong_arity_call_is_a_runtime_error() {
    let mut vm = Vm::new();
    let err = match vm.interpret("fn add(a, b) { return a + b; } let x = add(1);") {
        Err(InterpretError::Runtime(e)) => e,
        other => panic!("expected runtime error, got {:?}", other.is_ok()),
    };
    assert!(err.message.contains("expected 2 arguments"));
}

#[test]
fn native_len_type_name_and_clock_are_callable() {
    let mut vm = run(
        "let n = len(\"hello\");
         let t = type_name(42);
         let c = clock();",
    );
    assert_eq!(global(&mut vm, "n"), Value::Number(5.0));
    assert!(matches!(global(&mut vm, "t"), Value::Obj(_)));
    assert!(matches!(global(&mut vm, "c"), Value::Number(_)));
}

#[test]
fn undefined_global_get_is_a_runtime_error() {
    let mut vm = Vm::new();
    let err = match vm.interpret("print undefined_name;") {
        Err(InterpretError::Runtime(e)) => e,
        other => panic!("expected runtime error, got {:?}", other.is_ok()),
    };
    assert!(err.message.contains("undefined"));
}

#[test]
fn undefined_global_set_does_not_mutate_globals() {
    let mut vm = Vm::new();
    match vm.interpret("undefined_name = 1;") {
        Err(InterpretError::Runtime(e)) => assert!(e.message.contains("undefined")),
        other => panic!("expected runtime error, got {:?}", other.is_ok()),
    }
    // Still undefined: reading it back must fail the same way, not
    // observe a value the failed assignment might have left behind.
    match vm.interpret_repl_line("undefined_name") {
        Err(InterpretError::Runtime(e)) => assert!(e.message.contains("undefined")),
        other => panic!("expected undefined_name to remain undefined, got {:?}", other.is_ok()),
    }
}

#[test]
fn gc_stress_mode_does_not_change_program_output() {
    // spec.md §8 "GC safety": the same program must produce identical
    // results whether or not every allocation triggers a collection.
    std::env::set_var("RUFF_GC_STRESS", "1");
    let mut stressed = run(
        "fn make() { let x = 0; fn inc() { x = x + 1; return x; } return inc; }
         let counter = make();
         let results = [counter(), counter(), counter()];
         let joined = \"\" .. results[0] .. results[1] .. results[2];",
    );
    std::env::remove_var("RUFF_GC_STRESS");

    let mut normal = run(
        "fn make() { let x = 0; fn inc() { x = x + 1; return x; } return inc; }
         let counter = make();
         let results = [counter(), counter(), counter()];
         let joined = \"\" .. results[0] .. results[1] .. results[2];",
    );

    let joined_stressed = global(&mut stressed, "joined");
    let joined_normal = global(&mut normal, "joined");
    match (joined_stressed, joined_normal) {
        (Value::Obj(a), Value::Obj(b)) => {
            assert_eq!(stressed.heap.as_string(a), normal.heap.as_string(b));
        }
        other => panic!("expected string values, got {:?}", other),
    }
}

#[test]
fn compile_error_prevents_execution() {
    let mut vm = Vm::new();
    match vm.interpret("let x = ;") {
        Err(InterpretError::Compile(errs)) => assert!(!errs.is_empty()),
        other => panic!("expected compile error, got {:?}", other.is_ok()),
    }
}
