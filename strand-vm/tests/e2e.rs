//! End-to-end tests: source text through the whole pipeline, each program
//! run under both unoptimised and optimised compilation.

use std::sync::Arc;

use strand_vm::{
    compile_source, std_registry, CompilerOptions, Executor, Value, VmError,
};

fn run_with(src: &str, optimize: bool) -> Result<Value, VmError> {
    let registry = Arc::new(std_registry());
    let options = CompilerOptions {
        optimize,
        global_entry: true,
    };
    let program = compile_source(src, &registry, options, None)
        .unwrap_or_else(|e| panic!("compile failed: {e}\n{src}"));
    Executor::new(registry).run_main(&program)
}

/// Assert the program runs cleanly under both compilation modes. Programs
/// verify themselves with `assert()`, which raises on failure.
fn run_ok(src: &str) {
    for optimize in [false, true] {
        match run_with(src, optimize) {
            Ok(value) => assert!(
                !value.is_error(),
                "program failed (optimize={optimize}): {value}\n{src}"
            ),
            Err(e) => panic!("program failed (optimize={optimize}): {e}\n{src}"),
        }
    }
}

#[test]
fn variables_and_assignment() {
    run_ok("x := 1\nx == 1 |> assert()");
    run_ok("x := 1\nx = 2\nx == 2 |> assert()");
    run_ok("x := 1\ny := x = 3\ny == 3 |> assert()");
}

#[test]
fn branches() {
    run_ok(
        "x := 1
        cond := true
        if cond { x = 2 } else { x = 3 }
        x == 2 |> assert()",
    );
    run_ok(
        "x := 1
        cond := false
        if cond { x = 2 } else { x = 3 }
        x == 3 |> assert()",
    );
    run_ok("x := 2 > 1 ? \"a\" : \"b\"\nx == \"a\" |> assert()");
}

#[test]
fn loops_count_evens_and_odds() {
    run_ok(
        "even := 0
        odd := 0
        for i := 0; i < 10; i = i + 1 {
            if i % 2 == 0 { even = even + 1 } else { odd = odd + 1 }
        }
        even == 5 |> assert()
        odd == 5 |> assert()",
    );
    run_ok(
        "even := 0
        odd := 0
        isEven := |x| x % 2 == 0
        i := 0
        while i < 10 {
            if isEven(i) { even = even + 1 } else { odd = odd + 1 }
            i = i + 1
        }
        even == 5 |> assert()
        odd == 5 |> assert()",
    );
}

#[test]
fn for_range_sums() {
    run_ok(
        "sum := 0
        for i in 0..5 { sum = sum + i }
        sum == 10 |> assert()",
    );
}

#[test]
fn break_and_continue() {
    run_ok(
        "sum := 0
        for i := 0; i < 10; i = i + 1 {
            if i % 2 == 1 { continue }
            if i >= 8 { break }
            sum = sum + i
        }
        sum == 12 |> assert()",
    );
    run_ok(
        "i := 0
        hits := 0
        while i < 10 {
            i = i + 1
            if i % 2 == 0 { continue }
            hits = hits + 1
        }
        hits == 5 |> assert()",
    );
}

#[test]
fn closures_capture_and_curry() {
    run_ok(
        "adder := |x| |y| x + y
        addFive := adder(5)
        addFive(5) == 10 |> assert()",
    );
}

#[test]
fn closure_instances_are_independent() {
    run_ok(
        "f := || {
            x := 0
            return { get: || x, inc: || x = x + 1 }
        }
        a := f()
        b := f()
        a.inc()
        a.get() == 1 |> assert()
        b.get() == 0 |> assert()",
    );
}

#[test]
fn recursion_fib() {
    run_ok(
        "fib := |n| {
            if n <= 1 { return n }
            return fib(n - 1) + fib(n - 2)
        }
        fib(10) == 55 |> assert()",
    );
}

#[test]
fn sibling_blocks_do_not_share_values() {
    run_ok("{ a := 1 }\n{ a := 2\na == 2 |> assert() }");
}

#[test]
fn arrays_and_objects() {
    run_ok("x := [1, 2, 3]\nx[0] = 2\nx[0] == 2 |> assert()");
    run_ok("x := [[1], [2], [3]]\nx[0][0] = 2\nx[0][0] == 2 |> assert()");
    run_ok("x := { a: 1 }\nx[\"a\"] = 2\nx.a == 2 |> assert()");
    run_ok("x := { a: 1 }\nx.a = 2\nx.a == 2 |> assert()");
    run_ok("x := [{a: [9]}]\nx[0].a[0] == 9 |> assert()");
    run_ok("x := [{a: [9]}]\nx[0].a[0] = 41\nx[0].a[0] == 41 |> assert()");
    run_ok(
        "x := [1, 2, 3]
        x |> push(4)
        len(x) == 4 |> assert()
        x[3] == 4 |> assert()",
    );
}

#[test]
fn higher_order_builtins() {
    run_ok(
        "x := [1, 2, 3]
        l := x |> map(|v| v + 1) |> filter(|v| v % 2 == 0) |> len()
        l == 2 |> assert()",
    );
    run_ok(
        "a := 1
        b := 2
        x := [1, 2, 3]
        l := x |> map(|v| v + a) |> filter(|v| v % b == 0) |> len()
        l == 2 |> assert()",
    );
    run_ok("[1, 2, 3] |> contains(2) |> assert()");
    run_ok("[1, 2, 3] |> contains(|v| v > 2) |> assert()");
    run_ok("([1, 2] |> contains(9)) == false |> assert()");
}

#[test]
fn pipe_is_first_argument_insertion() {
    run_ok(
        "add := |a, b| a + b
        r := 3 |> add(4)
        r == 7 |> assert()",
    );
}

#[test]
fn pattern_matching_binds_and_guards() {
    run_ok(
        "matched := false
        match [1, {k: \"v\"}] {
            [1, {k: s}] => {
                s == \"v\" |> assert()
                matched = true
            }
        }
        matched |> assert()",
    );
    // length guard: a pattern longer than the value must not match
    run_ok(
        "match [1] {
            [1, 2] => false |> assert(),
            else => true |> assert()
        }",
    );
    run_ok(
        "match 3 {
            n if n > 2 => n == 3 |> assert(),
            else => false |> assert()
        }",
    );
    run_ok(
        "match \"hi\" {
            \"hi\" => true |> assert(),
            else => false |> assert()
        }",
    );
    run_ok(
        "hit := false
        match nil { nil => hit = true }
        hit |> assert()",
    );
}

#[test]
fn match_without_else_falls_through_silently() {
    run_ok(
        "x := 0
        y := 5
        match x {
            0 => {
                match y {
                    0 => false |> assert(),
                    1 => false |> assert(),
                    4 => false |> assert()
                }
            },
            1 => false |> assert()
        }
        true |> assert()",
    );
}

#[test]
fn match_cases_reuse_scratch_slots_cleanly() {
    run_ok(
        "check := |v| {
            out := nil
            match v {
                [a, b] => out = a + b,
                [a] => out = a,
                {k: x} => out = x,
                else => out = 0
            }
            return out
        }
        check([1, 2]) == 3 |> assert()
        check([7]) == 7 |> assert()
        check({k: 9}) == 9 |> assert()
        check(4) == 0 |> assert()",
    );
}

#[test]
fn try_catches_raised_errors() {
    run_ok(
        "f := || { raise error(\"boom\") }
        r := try f()
        isError(r) |> assert()
        r.msg == \"boom\" |> assert()",
    );
    run_ok(
        "r := try (1 / 0)
        isError(r) |> assert()",
    );
    run_ok(
        "r := try import(\"no-such-file.sd\")
        isError(r) |> assert()",
    );
}

#[test]
fn uncaught_raise_fails_the_program() {
    for optimize in [false, true] {
        let result = run_with("raise error(\"boom\")", optimize);
        assert!(matches!(result, Err(VmError::Raise(v)) if v.is_error()));
    }
}

#[test]
fn error_values_carry_data() {
    run_ok(
        "e := error(\"bad\", {code: 7})
        e.msg == \"bad\" |> assert()
        e.data.code == 7 |> assert()
        isError(e) |> assert()",
    );
}

#[test]
fn out_of_bounds_index_is_an_error_value() {
    run_ok("x := [1]\nisError(x[5]) |> assert()");
    run_ok("x := {a: 1}\n(x.b == nil) |> assert()");
}

#[test]
fn type_faults_abort_the_run() {
    for optimize in [false, true] {
        let result = run_with("x := 1 + true", optimize);
        assert!(matches!(result, Err(VmError::Fault(_))), "{result:?}");
    }
}

#[test]
fn numeric_tower() {
    run_ok("(1 + 2.5) == 3.5 |> assert()");
    run_ok("(7 / 2) == 3 |> assert()");
    run_ok("(7.0 / 2) == 3.5 |> assert()");
    run_ok("(-3 < 2) |> assert()");
    run_ok("(\"a\" + \"b\") == \"ab\" |> assert()");
    run_ok("type(1) == \"int\" |> assert()");
    run_ok("type(1.5) == \"float\" |> assert()");
}

#[test]
fn optimizer_preserves_results() {
    let programs = [
        "return 1 + 2 * 3",
        "x := 10\ny := x * x\nreturn y - x",
        "fib := |n| { if n <= 1 { return n } return fib(n-1) + fib(n-2) }\nreturn fib(12)",
        "s := 0\nfor i := 0; i < 100; i = i + 1 { s = s + i }\nreturn s",
        "f := || { x := 0\nreturn { inc: || x = x + 1 } }\na := f()\na.inc()\na.inc()\nreturn a.inc()",
    ];
    for src in programs {
        let plain = run_with(src, false).expect(src);
        let optimized = run_with(src, true).expect(src);
        assert!(
            plain.equals(&optimized),
            "optimizer changed result of {src}: {plain} vs {optimized}"
        );
    }
}

#[test]
fn top_level_return_yields_program_value() {
    for optimize in [false, true] {
        let value = run_with("return 41 + 1", optimize).unwrap();
        assert!(value.equals(&Value::Int(42)));
    }
}

#[test]
fn fibers_run_and_wait() {
    run_ok(
        "t := fiber.run(|| 1 + 1)
        fiber.wait(t) == 2 |> assert()",
    );
    run_ok(
        "tasks := []
        for i := 0; i < 4; i = i + 1 {
            tasks |> push(fiber.run(|| 21 * 2))
        }
        results := fiber.wait(tasks)
        len(results) == 4 |> assert()
        results |> contains(42) |> assert()",
    );
}

#[test]
fn fibers_see_shared_captures_through_cells() {
    run_ok(
        "x := 10
        t := fiber.run(|| x + 1)
        fiber.wait(t) == 11 |> assert()",
    );
}

#[test]
fn channel_send_recv_preserves_order() {
    run_ok(
        "ch := fiber.newChannel()
        t := fiber.run(|| {
            for i := 0; i < 5; i = i + 1 { fiber.send(ch, i) }
            fiber.close(ch)
        })
        got := []
        fiber.onRecv(ch, |v| { got |> push(v) })
        fiber.wait(t)
        len(got) == 5 |> assert()
        for i := 0; i < 5; i = i + 1 { got[i] == i |> assert() }",
    );
}

#[test]
fn buffered_channels_and_recv_after_close() {
    run_ok(
        "ch := fiber.newChannel(2)
        fiber.send(ch, 1)
        fiber.send(ch, 2)
        fiber.close(ch)
        fiber.recv(ch) == 1 |> assert()
        fiber.recv(ch) == 2 |> assert()
        fiber.recv(ch) == nil |> assert()",
    );
}

#[test]
fn locks_serialize_fiber_updates() {
    run_ok(
        "l := fiber.newLock()
        counter := 0
        tasks := []
        for i := 0; i < 4; i = i + 1 {
            tasks |> push(fiber.run(|| {
                for j := 0; j < 50; j = j + 1 {
                    l.lock(|| { counter = counter + 1 })
                }
            }))
        }
        fiber.wait(tasks)
        counter == 200 |> assert()",
    );
}

#[test]
fn cancel_resolves_the_task_to_nil() {
    run_ok(
        "ch := fiber.newChannel()
        t := fiber.run(|| fiber.recv(ch))
        fiber.cancel(t)
        fiber.wait(t) == nil |> assert()",
    );
    run_ok(
        "t := fiber.run(|| { while true { } })
        fiber.cancel(t)
        fiber.wait(t) == nil |> assert()",
    );
}

#[test]
fn faults_terminate_only_their_fiber() {
    run_ok(
        "t := fiber.run(|| 1 + true)
        r := fiber.wait(t)
        isError(r) |> assert()
        2 + 2 == 4 |> assert()",
    );
}

#[test]
fn builtin_modules() {
    run_ok("math.abs(0 - 5) == 5 |> assert()");
    run_ok("math.pi > 3 |> assert()");
    run_ok("strings.upper(\"ab\") == \"AB\" |> assert()");
    run_ok("(strings.split(\"a,b\", \",\") |> len()) == 2 |> assert()");
    run_ok("m := import(\"math\")\nm.floor(2.9) == 2 |> assert()");
    run_ok("t := time.now()\ntime.since(t) >= 0.0 |> assert()");
    run_ok("v := json.parse(\"{\\\"a\\\": [1, 2]}\")\nv.a[1] == 2 |> assert()");
    run_ok("json.stringify([1, 2]) == \"[1,2]\" |> assert()");
}

#[test]
fn imports_compile_run_and_cache_per_path() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("counter.sd"),
        "count := 0
        return {
            add: |n| count = count + n,
            get: || count
        }",
    )
    .unwrap();

    let src = "m := import(\"counter.sd\")
        m.add(2)
        m.add(3)
        m.get() == 5 |> assert()
        again := import(\"counter.sd\")
        again.get() == 5 |> assert()";

    let registry = Arc::new(std_registry());
    let program = compile_source(
        src,
        &registry,
        CompilerOptions::default(),
        Some(dir.path().join("main.sd")),
    )
    .unwrap();
    let result = Executor::new(registry).run_main(&program);
    match result {
        Ok(value) => assert!(!value.is_error(), "{value}"),
        Err(e) => panic!("import test failed: {e}"),
    }
}
