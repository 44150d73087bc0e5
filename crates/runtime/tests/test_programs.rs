//! End-to-end program tests: source text through the lexer, parser,
//! compiler, and VM, asserting on what `log` wrote to the run stream.

use ayu_compiler::compile_source;
use ayu_core::value::Value;
use ayu_runtime::{Vm, install_defaults};

fn try_run(source: &str) -> Result<(String, Vm), String> {
    let script = compile_source(source, "test")?;
    let mut vm = Vm::new(script);
    install_defaults(&mut vm);
    let mut out = Vec::new();
    vm.run(&mut out)?;
    Ok((String::from_utf8(out).expect("output is utf-8"), vm))
}

fn stdout_of(source: &str) -> String {
    match try_run(source) {
        Ok((out, _)) => out,
        Err(e) => panic!("program failed: {e}"),
    }
}

fn error_of(source: &str) -> String {
    match try_run(source) {
        Ok((out, _)) => panic!("program unexpectedly succeeded, wrote: {out:?}"),
        Err(e) => e,
    }
}

#[test]
fn arithmetic_precedence() {
    assert_eq!(stdout_of("x := 2 + 3 * 4; log(x)"), "14\n");
}

#[test]
fn if_elif_else_picks_the_matching_arm() {
    let source = r#"n := 2; if n == 1 { log("a") } elif n == 2 { log("b") } else { log("c") }"#;
    assert_eq!(stdout_of(source), "b\n");
}

#[test]
fn for_loop_over_a_range() {
    assert_eq!(
        stdout_of("total := 0; for i : 1..5 { total = total + i }; log(total)"),
        "10\n"
    );
}

#[test]
fn closures_share_their_captured_counter() {
    let source = r#"
make_counter : -> {
  c := 0
  : -> { c = c + 1; c }
}
f := make_counter()
log(f()); log(f()); log(f())
"#;
    assert_eq!(stdout_of(source), "1\n2\n3\n");
}

#[test]
fn separate_counters_do_not_share_state() {
    let source = r#"
make_counter : -> {
  c := 0
  : -> { c = c + 1; c }
}
f := make_counter()
g := make_counter()
log(f()); log(f()); log(g())
"#;
    assert_eq!(stdout_of(source), "1\n2\n1\n");
}

#[test]
fn object_operator_overload() {
    let source = r#"
v := [| x=1, "+" : a b -> [| x = a.x + b.x |] |]
w := [| x=2 |]
log((v + w).x)
"#;
    assert_eq!(stdout_of(source), "3\n");
}

#[test]
fn with_overlays_rhs_fields() {
    let source = r#"a := [| k=1 |] with [| k=9, j=2 |]; log(a.k); log(a.j)"#;
    assert_eq!(stdout_of(source), "9\n2\n");
}

#[test]
fn with_on_disjoint_objects_is_a_union() {
    let source = r#"
a := [| x=1 |] with [| y=2 |]
log(a.x); log(a.y)
"#;
    assert_eq!(stdout_of(source), "1\n2\n");
}

#[test]
fn with_does_not_mutate_its_operands() {
    let source = r#"
a := [| k=1 |]
b := a with [| k=2 |]
log(a.k); log(b.k)
"#;
    assert_eq!(stdout_of(source), "1\n2\n");
}

#[test]
fn globals_round_trip() {
    let (_, vm) = try_run("x := 41 + 1").unwrap();
    assert_eq!(vm.global("x"), Some(Value::Num(42.0)));
}

#[test]
fn array_write_then_read() {
    assert_eq!(stdout_of("a := [1, 2, 3]; a[1] = 9; log(a[1])"), "9\n");
}

#[test]
fn array_printing() {
    assert_eq!(stdout_of("log([1, \"two\", nil])"), "[1, two, nil]\n");
}

#[test]
fn sized_array_literal() {
    assert_eq!(stdout_of("a := [3; 7]; log(a[0] + a[1] + a[2])"), "21\n");
}

#[test]
fn string_concatenation() {
    assert_eq!(stdout_of(r#"log("foo" + "bar")"#), "foobar\n");
}

#[test]
fn truthiness_of_zero_and_empty_string() {
    assert_eq!(
        stdout_of(r#"if 0 { log("zero is truthy") }; if "" { log("empty is truthy") }"#),
        "zero is truthy\nempty is truthy\n"
    );
}

#[test]
fn logical_operators_short_circuit_to_operands() {
    // `&` keeps the falsy lhs or yields the rhs; `|` the reverse.
    assert_eq!(stdout_of("log(nil & 1); log(2 & 3); log(nil | 4); log(5 | 6)"), "nil\n3\n4\n5\n");
}

#[test]
fn comparison_chain() {
    assert_eq!(
        stdout_of("log(1 < 2); log(2 <= 2); log(3 > 4); log(1 <> 2); log(1 == 1)"),
        "true\ntrue\nfalse\ntrue\ntrue\n"
    );
}

#[test]
fn aggregate_equality_is_identity() {
    let source = r#"
a := [1]
b := [1]
log(a == a); log(a == b)
o := [| k=1 |]
p := [| k=1 |]
log(o == o); log(o == p)
"#;
    assert_eq!(stdout_of(source), "true\nfalse\ntrue\nfalse\n");
}

#[test]
fn member_call_passes_receiver_first() {
    let source = r#"
v := [| x=3, scaled : self n -> self.x * n |]
log(v:scaled(4))
"#;
    assert_eq!(stdout_of(source), "12\n");
}

#[test]
fn if_is_an_expression() {
    assert_eq!(stdout_of("x := if true { 1 } else { 2 }; log(x)"), "1\n");
    assert_eq!(stdout_of("x := if false { 1 } else { 2 }; log(x)"), "2\n");
    assert_eq!(stdout_of("x := if false { 1 }; log(x)"), "nil\n");
}

#[test]
fn nested_functions_and_returns() {
    let source = r#"
classify : n -> {
  if n < 0 { ret "neg" }
  if n == 0 { ret "zero" }
  "pos"
}
log(classify(0 - 5)); log(classify(0)); log(classify(3))
"#;
    assert_eq!(stdout_of(source), "neg\nzero\npos\n");
}

#[test]
fn next_skips_and_break_exits() {
    let source = r#"
total := 0
for i : 0..10 {
  if i == 2 { next }
  if i == 5 { break }
  total = total + i
}
log(total)
"#;
    // 0 + 1 + 3 + 4
    assert_eq!(stdout_of(source), "8\n");
}

#[test]
fn nested_loops_bind_jumps_to_the_innermost() {
    let source = r#"
hits := 0
for i : 0..3 {
  for j : 0..3 {
    if j == 1 { break }
    hits = hits + 1
  }
}
log(hits)
"#;
    assert_eq!(stdout_of(source), "3\n");
}

#[test]
fn compound_assignment_forms() {
    let source = r#"
x := 10
x += 5; log(x)
x -= 3; log(x)
x *= 2; log(x)
x /= 4; log(x)
x %= 4; log(x)
"#;
    assert_eq!(stdout_of(source), "15\n12\n24\n6\n2\n");
}

#[test]
fn compound_assignment_on_fields_and_indexes() {
    let source = r#"
o := [| n=1 |]
o.n += 4
log(o.n)
a := [1, 2]
a[0] += 9
log(a[0])
"#;
    assert_eq!(stdout_of(source), "5\n10\n");
}

#[test]
fn increment_and_decrement_yield_the_new_value() {
    assert_eq!(stdout_of("x := 5; log(x++); log(x); log(x--); log(x)"), "6\n6\n5\n5\n");
}

#[test]
fn unary_operators() {
    assert_eq!(stdout_of("log(-(3)); log(!true); log(!nil); log(+(4))"), "-3\ntrue\ntrue\n4\n");
}

#[test]
fn variadic_functions_pack_surplus_arguments() {
    let source = r#"
f : a rest \ -> rest
r := f(1, 2, 3)
log(r[0]); log(r[1])
log(f(1))
"#;
    assert_eq!(stdout_of(source), "2\n3\n[]\n");
}

#[test]
fn variadic_functions_require_the_leading_arguments() {
    let err = error_of("f : a rest \\ -> rest; f()");
    assert!(err.contains("at least"), "got: {err}");
}

#[test]
fn by_ref_parameters_share_a_box() {
    let source = r#"
bump : cell* -> { cell = cell + 1; cell }
shared := 10
log(bump(shared))
log(shared)
"#;
    // The callee sees a boxed copy; the caller's binding is untouched.
    assert_eq!(stdout_of(source), "11\n10\n");
}

#[test]
fn decorators_wrap_functions() {
    let source = r#"
twice : f -> : x -> f(f(x))
@twice
inc : x -> x + 1
log(inc(5))
"#;
    assert_eq!(stdout_of(source), "7\n");
}

#[test]
fn decorator_fields_arrive_as_an_object() {
    let source = r#"
scaled : f opts -> : x -> f(x) * opts.factor
@scaled(factor=10)
inc : x -> x + 1
log(inc(4))
"#;
    assert_eq!(stdout_of(source), "50\n");
}

#[test]
fn decorator_chains_fold_left_to_right() {
    let source = r#"
add_a : f -> : x -> f(x) + "a"
add_b : f -> : x -> f(x) + "b"
@add_a @add_b
base : x -> x
log(base("s"))
"#;
    assert_eq!(stdout_of(source), "sab\n");
}

#[test]
fn to_str_renders_values() {
    assert_eq!(stdout_of("log(to_str(3) + to_str(nil))"), "3nil\n");
}

#[test]
fn function_values_print_their_name() {
    assert_eq!(stdout_of("f : x -> x; log(f)"), "<function f>\n");
    assert_eq!(stdout_of("log(log)"), "<native function>\n");
}

#[test]
fn arity_mismatch_is_a_runtime_error() {
    let err = error_of("f : a b -> a; f(1)");
    assert!(err.contains("Expected 2 args"), "got: {err}");
}

#[test]
fn type_error_on_arithmetic() {
    let err = error_of("1 + nil");
    assert!(err.contains("Couldn't do"), "got: {err}");
}

#[test]
fn comparison_on_non_numbers_is_an_error() {
    let err = error_of(r#""a" < "b""#);
    assert!(err.contains("Couldn't do"), "got: {err}");
}

#[test]
fn missing_field_is_a_runtime_error() {
    let err = error_of("o := [| k=1 |]; log(o.j)");
    assert!(err.contains("Failed to find j"), "got: {err}");
}

#[test]
fn unbound_global_is_a_runtime_error() {
    let err = error_of("log(nope)");
    assert!(err.contains("Could not find nope"), "got: {err}");
}

#[test]
fn deep_recursion_overflows_the_frame_stack() {
    let err = error_of("spin : n -> spin(n + 1); spin(0)");
    assert!(err.contains("overflow"), "got: {err}");
}

#[test]
fn recursion_through_globals() {
    let source = r#"
fib : n -> {
  if n < 2 { ret n }
  fib(n - 1) + fib(n - 2)
}
log(fib(10))
"#;
    assert_eq!(stdout_of(source), "55\n");
}

#[test]
fn loop_variable_capture_sees_final_values() {
    // Each iteration's closure shares the single loop variable cell.
    let source = r#"
fs := [0, 0, 0]
for i : 0..3 { fs[i] = : -> i }
log(fs[0]()); log(fs[1]()); log(fs[2]())
"#;
    assert_eq!(stdout_of(source), "3\n3\n3\n");
}

#[test]
fn stack_is_balanced_after_every_scenario() {
    let sources = [
        "x := 2 + 3 * 4; log(x)",
        "total := 0; for i : 1..5 { total = total + i }; log(total)",
        "x := if true { 1 } else { 2 }",
        "f : a -> a; f(9)",
    ];
    for source in sources {
        let (_, vm) = try_run(source).unwrap();
        assert_eq!(vm.stack_len(), 0, "stack not empty after: {source}");
    }
}
