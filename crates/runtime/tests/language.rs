//! End-to-end language semantics
//!
//! Each test evaluates a small program through the full pipeline (lexer,
//! parser, evaluator on the scheduler) and checks its final value or its
//! printed output.

use hemlock_runtime::{eval_source, eval_source_with, InterpOptions, RunOutcome};
use serial_test::serial;

fn run(source: &str) -> RunOutcome {
    eval_source(source).expect("program should parse")
}

#[test]
#[serial]
fn test_fibonacci() {
    let out = run(
        "let fib = fn(n) { if (n < 2) { return n; } return fib(n-1) + fib(n-2); }; fib(10);",
    );
    assert_eq!(out.value_ok(), "55");
}

#[test]
#[serial]
fn test_string_interpolation() {
    let out = run(r#"let n = 3; "count: ${n*2}";"#);
    assert_eq!(out.value_ok(), "count: 6");
}

#[test]
#[serial]
fn test_optional_chain_with_coalesce() {
    let out = run(r#"let o = null; o?.field ?? "default";"#);
    assert_eq!(out.value_ok(), "default");
}

#[test]
#[serial]
fn test_typed_array_push_throws() {
    let out = run(
        r#"
        let a: array<i32> = [1, 2, 3];
        try { a.push("hello"); } catch (e) { e; }
        "#,
    );
    assert!(out.value_ok().starts_with("TypeError"));
}

#[test]
#[serial]
fn test_typed_array_push_coerces() {
    let out = run("let a: array<i32> = [1]; a.push(2); a[1];");
    assert_eq!(out.value_ok(), "2");
}

#[test]
#[serial]
fn test_lexical_scope_captures_binding_not_name() {
    let out = run("let x = 1; let g = fn() { return x; }; let x = 2; g();");
    assert_eq!(out.value_ok(), "1");
}

#[test]
#[serial]
fn test_closure_mutation_visibility() {
    let out = run(
        "let c = 0; let inc = fn() { c = c + 1; return c; }; \
         print(inc()); print(inc()); print(inc());",
    );
    assert_eq!(out.output, "1\n2\n3\n");
}

#[test]
#[serial]
fn test_defer_runs_lifo() {
    let out = run(
        r#"
        let f = fn() {
            defer print("a");
            defer print("b");
            return null;
        };
        f();
        "#,
    );
    assert_eq!(out.output, "b\na\n");
}

#[test]
#[serial]
fn test_unreached_defer_does_not_run() {
    let out = run(
        r#"
        let f = fn() {
            defer print("ran");
            return 1;
            defer print("never");
        };
        f();
        "#,
    );
    assert_eq!(out.output, "ran\n");
}

#[test]
#[serial]
fn test_defer_runs_on_throw() {
    let out = run(
        r#"
        let f = fn() {
            defer print("cleanup");
            throw "boom";
        };
        try { f(); } catch (e) { print(e); }
        "#,
    );
    assert_eq!(out.output, "cleanup\nboom\n");
}

#[test]
#[serial]
fn test_try_finally_order() {
    let out = run(
        r#"
        let f = fn() {
            try { throw "x"; }
            catch (e) { return e + "!"; }
            finally { print("F"); }
        };
        f();
        "#,
    );
    assert_eq!(out.output, "F\n");
    assert_eq!(out.value_ok(), "x!");
}

#[test]
#[serial]
fn test_finally_signal_supersedes() {
    let out = run(
        r#"
        let f = fn() {
            try { return 1; }
            finally { return 2; }
        };
        f();
        "#,
    );
    assert_eq!(out.value_ok(), "2");
}

#[test]
#[serial]
fn test_switch_no_fallthrough() {
    let out = run(
        r#"
        let describe = fn(x) {
            switch (x) {
                case 1: print("one");
                case 2: print("two"); break; print("dead");
                default: print("other");
            }
            return null;
        };
        describe(1); describe(2); describe(9);
        "#,
    );
    assert_eq!(out.output, "one\ntwo\nother\n");
}

#[test]
#[serial]
fn test_switch_structural_string_match() {
    let out = run(
        r#"
        switch ("b" + "c") {
            case "bc": "matched";
            default: "default";
        }
        "#,
    );
    assert_eq!(out.value_ok(), "matched");
}

#[test]
#[serial]
fn test_enum_auto_increment() {
    let out = run(
        "enum Color { Red, Green = 5, Blue } \
         print(Color.Red, Color.Green, Color.Blue);",
    );
    assert_eq!(out.output, "0 5 6\n");
}

#[test]
#[serial]
fn test_define_object_duck_typing() {
    let out = run(
        r#"
        define_object Point { x: i32, y: i32 }
        let p: Point = { x: 1, y: 2, extra: "fine" };
        p.x + p.y;
        "#,
    );
    assert_eq!(out.value_ok(), "3");
}

#[test]
#[serial]
fn test_define_object_missing_field_throws() {
    let out = run(
        r#"
        define_object Point { x: i32, y: i32 }
        try { let p: Point = { x: 1 }; } catch (e) { e; }
        "#,
    );
    assert!(out.value_ok().contains("missing field 'y'"));
}

#[test]
#[serial]
fn test_for_in_over_array_and_object() {
    let out = run(
        r#"
        for (v in [10, 20]) { print(v); }
        for (k, v in {a: 1, b: 2}) { print(k, v); }
        "#,
    );
    assert_eq!(out.output, "10\n20\na 1\nb 2\n");
}

#[test]
#[serial]
fn test_loop_break_continue() {
    let out = run(
        r#"
        for (let i = 0; i < 5; i++) {
            if (i == 1) { continue; }
            if (i == 3) { break; }
            print(i);
        }
        "#,
    );
    assert_eq!(out.output, "0\n2\n");
}

#[test]
#[serial]
fn test_truthiness_of_containers() {
    let out = run(
        r#"
        let report = fn(v) { if (v) { print("t"); } else { print("f"); } return null; };
        report(""); report([]); report({}); report(0); report(null); report(false);
        "#,
    );
    assert_eq!(out.output, "t\nt\nt\nf\nf\nf\n");
}

#[test]
#[serial]
fn test_logical_operators_return_deciding_operand() {
    let out = run(r#"print(0 && "x"); print(1 && "x"); print(0 || "y"); print("z" || "y");"#);
    assert_eq!(out.output, "0\nx\ny\nz\n");
}

#[test]
#[serial]
fn test_array_out_of_range_reads_null_strings_throw() {
    let out = run(
        r#"
        let a = [1];
        print(a[5]);
        try { let c = "ab"[9]; } catch (e) { print(e); }
        "#,
    );
    assert!(out.output.starts_with("null\n"));
    assert!(out.output.contains("IndexError"));
}

#[test]
#[serial]
fn test_string_index_yields_single_character_string() {
    let out = run(r#"let s = "abc"; typeof(s[1]) + ":" + s[1];"#);
    assert_eq!(out.value_ok(), "string:b");
}

#[test]
#[serial]
fn test_integer_literal_narrowing_and_typeof() {
    let out = run("print(typeof(5), typeof(3000000000), typeof(2.5), typeof(255u8));");
    assert_eq!(out.output, "i32 i64 f64 u8\n");
}

#[test]
#[serial]
fn test_integer_overflow_wraps() {
    let out = run("let x = 2147483647; x + 1;");
    assert_eq!(out.value_ok(), "-2147483648");
}

#[test]
#[serial]
fn test_const_violation() {
    let out = run(r#"const k = 1; try { k = 2; } catch (e) { e; }"#);
    assert!(out.value_ok().starts_with("ConstViolation"));
}

#[test]
#[serial]
fn test_name_error_is_catchable() {
    let out = run("try { missing; } catch (e) { e; }");
    assert!(out.value_ok().starts_with("NameError"));
}

#[test]
#[serial]
fn test_builtin_shadowing() {
    // A user binding wins over the builtin of the same name.
    let out = run(
        r#"
        let sleep = fn(label) { return "shadowed " + label; };
        sleep("sleep");
        "#,
    );
    assert_eq!(out.value_ok(), "shadowed sleep");
}

#[test]
#[serial]
fn test_prefix_postfix_inc_dec() {
    let out = run("let x = 5; print(x++); print(x); print(--x); print(x);");
    assert_eq!(out.output, "5\n6\n5\n5\n");
}

#[test]
#[serial]
fn test_ternary_and_equality() {
    let out = run(
        r#"
        print(1 == 1.0, "a" == "a", [1] == [1]);
        let xs = [1]; print(xs == xs);
        print(2 < 3 ? "yes" : "no");
        "#,
    );
    assert_eq!(out.output, "true true false\ntrue\nyes\n");
}

#[test]
#[serial]
fn test_deep_equal_builtin() {
    let out = run("deep_equal({a: [1, 2]}, {a: [1, 2]});");
    assert_eq!(out.value_ok(), "true");
}

#[test]
#[serial]
fn test_string_methods() {
    let out = run(
        r#"
        let s = "  Hello,World  ";
        print(s.trim());
        print("a,b,c".split(","));
        print("hemlock".to_upper(), "HEMLOCK".to_lower());
        print("hemlock".substring(0, 3));
        "#,
    );
    assert_eq!(
        out.output,
        "Hello,World\n[\"a\", \"b\", \"c\"]\nHEMLOCK hemlock\nhem\n"
    );
}

#[test]
#[serial]
fn test_json_builtins() {
    let out = run(
        r#"
        let parsed = json_parse("{\"n\": 3, \"xs\": [1, 2]}");
        print(parsed.n, parsed.xs[1]);
        json_stringify([1, "two", null]);
        "#,
    );
    assert_eq!(out.output, "3 2\n");
    assert_eq!(out.value_ok(), r#"[1,"two",null]"#);
}

#[test]
#[serial]
fn test_uncaught_throw_reports_trace() {
    let out = run(
        r#"
        let inner = fn() { throw "kaboom"; };
        let outer = fn() { return inner(); };
        outer();
        "#,
    );
    assert_eq!(out.value_err(), "kaboom");
}

#[test]
#[serial]
fn test_throw_non_string_value() {
    let out = run("try { throw {code: 7}; } catch (e) { e.code; }");
    assert_eq!(out.value_ok(), "7");
}

#[test]
#[serial]
fn test_args_binding() {
    let out = eval_source_with(
        "print(args[0], args[1], args.length);",
        InterpOptions {
            args: vec!["alpha".to_string(), "beta".to_string()],
            ..Default::default()
        },
    )
    .expect("program should parse");
    assert_eq!(out.output, "alpha beta 2\n");
}

#[test]
#[serial]
fn test_module_import() {
    let dir = tempfile::TempDir::new().unwrap();
    std::fs::write(dir.path().join("m.hml"), "export let x = 41;").unwrap();
    let main = dir.path().join("main.hml");
    let source = r#"import { x } from "./m"; print(x + 1);"#;
    std::fs::write(&main, source).unwrap();
    let out = eval_source_with(
        source,
        InterpOptions {
            main_file: Some(main),
            ..Default::default()
        },
    )
    .expect("program should parse");
    assert_eq!(out.output, "42\n");
}

#[test]
#[serial]
fn test_module_cycle_detected() {
    let dir = tempfile::TempDir::new().unwrap();
    std::fs::write(
        dir.path().join("a.hml"),
        "import { b } from \"./b\"; export let a = 1;",
    )
    .unwrap();
    std::fs::write(
        dir.path().join("b.hml"),
        "import { a } from \"./a\"; export let b = 2;",
    )
    .unwrap();
    let main = dir.path().join("main.hml");
    let source = r#"import { a } from "./a";"#;
    std::fs::write(&main, source).unwrap();
    let out = eval_source_with(
        source,
        InterpOptions {
            main_file: Some(main),
            ..Default::default()
        },
    )
    .expect("program should parse");
    assert!(out.value_err().contains("Cycle detected"));
}

#[test]
#[serial]
fn test_module_initializes_once_deepest_first() {
    let dir = tempfile::TempDir::new().unwrap();
    std::fs::write(
        dir.path().join("leaf.hml"),
        r#"print("leaf"); export let l = 1;"#,
    )
    .unwrap();
    std::fs::write(
        dir.path().join("mid.hml"),
        r#"import { l } from "./leaf"; print("mid"); export let m = l + 1;"#,
    )
    .unwrap();
    let main = dir.path().join("main.hml");
    let source = r#"
        import { m } from "./mid";
        import { l } from "./leaf";
        print("main", l, m);
    "#;
    std::fs::write(&main, source).unwrap();
    let out = eval_source_with(
        source,
        InterpOptions {
            main_file: Some(main),
            ..Default::default()
        },
    )
    .expect("program should parse");
    assert_eq!(out.output, "leaf\nmid\nmain 1 2\n");
}

#[test]
#[serial]
fn test_hmlc_round_trip_preserves_behavior() {
    let source = r#"
        let fib = fn(n) { if (n < 2) { return n; } return fib(n-1) + fib(n-2); };
        print("fib", fib(10));
        let c = 0;
        let inc = fn() { c = c + 1; return c; };
        inc(); inc();
        print("count: ${c}");
    "#;
    let direct = eval_source(source).unwrap();
    let program =
        hemlock_compiler::parse_source(source, std::path::Path::new("t.hml")).unwrap();
    let bytes = hemlock_compiler::codec::serialize(&program, true);
    let reloaded = hemlock_compiler::codec::deserialize(&bytes, "t.hml").unwrap();
    let replayed =
        hemlock_runtime::eval_program(reloaded, InterpOptions::default()).unwrap();
    assert_eq!(direct.output, replayed.output);
    assert_eq!(direct.value_ok(), replayed.value_ok());
}
