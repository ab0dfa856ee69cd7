//! Cooperative task runtime, end to end
//!
//! These run on the single-worker scheduler, so every interleaving is a
//! deterministic consequence of suspension points.

use hemlock_runtime::eval_source;
use serial_test::serial;

#[test]
#[serial]
fn test_channel_rendezvous() {
    let out = eval_source(
        r#"
        let c = channel(0);
        spawn(fn() { c.send(42); });
        c.recv();
        "#,
    )
    .unwrap();
    assert_eq!(out.value_ok(), "42");
}

#[test]
#[serial]
fn test_spawn_join_returns_result() {
    let out = eval_source(
        r#"
        let t = spawn(fn(a, b) { return a * b; }, 6, 7);
        join(t);
        "#,
    )
    .unwrap();
    assert_eq!(out.value_ok(), "42");
}

#[test]
#[serial]
fn test_join_rethrows_task_throw() {
    let out = eval_source(
        r#"
        let t = spawn(fn() { throw "task failed"; });
        try { join(t); } catch (e) { "caught: " + e; }
        "#,
    )
    .unwrap();
    assert_eq!(out.value_ok(), "caught: task failed");
}

#[test]
#[serial]
fn test_buffered_channel_preserves_fifo() {
    let out = eval_source(
        r#"
        let c = channel(3);
        c.send(1); c.send(2); c.send(3);
        print(c.recv(), c.recv(), c.recv());
        "#,
    )
    .unwrap();
    assert_eq!(out.output, "1 2 3\n");
}

#[test]
#[serial]
fn test_closed_channel_drains_then_throws() {
    let out = eval_source(
        r#"
        let c = channel(2);
        c.send(7);
        c.close();
        print(c.recv());
        try { c.recv(); } catch (e) { print(e); }
        try { c.send(1); } catch (e) { print(e); }
        "#,
    )
    .unwrap();
    let lines: Vec<&str> = out.output.lines().collect();
    assert_eq!(lines[0], "7");
    assert!(lines[1].starts_with("IOError"));
    assert!(lines[2].starts_with("IOError"));
}

#[test]
#[serial]
fn test_recv_timeout_returns_null() {
    let out = eval_source("let c = channel(1); c.recv(5);").unwrap();
    assert_eq!(out.value_ok(), "null");
}

#[test]
#[serial]
fn test_causal_ordering_through_join() {
    // A task's effects are visible after join (causal ordering).
    let out = eval_source(
        r#"
        let log = [];
        let t = spawn(fn() { log.push("task"); return null; });
        join(t);
        log.push("main");
        print(log.join(","));
        "#,
    )
    .unwrap();
    assert_eq!(out.output, "task,main\n");
}

#[test]
#[serial]
fn test_cancel_surfaces_at_suspension_point() {
    let out = eval_source(
        r#"
        let t = spawn(fn() {
            let i = 0;
            while (true) { sleep(1); i = i + 1; }
            return i;
        });
        sleep(5);
        cancel(t);
        try { join(t); } catch (e) { e; }
        "#,
    )
    .unwrap();
    assert_eq!(out.value_ok(), "Cancelled");
}

#[test]
#[serial]
fn test_async_fn_call_spawns_and_await_joins() {
    let out = eval_source(
        r#"
        let work = async fn(n) { return n + 1; };
        let t = work(41);
        print(typeof(t));
        await t;
        "#,
    )
    .unwrap();
    assert_eq!(out.output, "task\n");
    assert_eq!(out.value_ok(), "42");
}

#[test]
#[serial]
fn test_await_non_task_is_identity() {
    let out = eval_source("await 7;").unwrap();
    assert_eq!(out.value_ok(), "7");
}

#[test]
#[serial]
fn test_detach_keeps_running() {
    let out = eval_source(
        r#"
        let c = channel(0);
        let t = spawn(fn() { c.send("from detached"); });
        detach(t);
        c.recv();
        "#,
    )
    .unwrap();
    assert_eq!(out.value_ok(), "from detached");
}

#[test]
#[serial]
fn test_worker_pipeline_over_channels() {
    let out = eval_source(
        r#"
        let input = channel(4);
        let output = channel(4);
        spawn(fn() {
            while (true) {
                let n = input.recv();
                if (n == null) { break; }
                output.send(n * n);
            }
            output.send(null);
        });
        input.send(1); input.send(2); input.send(3); input.send(null);
        let total = 0;
        while (true) {
            let sq = output.recv();
            if (sq == null) { break; }
            total = total + sq;
        }
        total;
        "#,
    )
    .unwrap();
    assert_eq!(out.value_ok(), "14");
}

#[test]
#[serial]
fn test_cycle_safety_at_teardown() {
    use hemlock_compiler::parse_source;
    use hemlock_core::value::Value;
    use hemlock_runtime::{scheduler, Interp, InterpOptions};
    use std::path::Path;

    // `let f = fn() { f() }; f;` - a closure cycle through the global
    // scope. The result is released first, then teardown's cycle-break
    // pass must let the whole interpreter free.
    let freed = scheduler::run_on_worker(|| {
        let program =
            parse_source("let f = fn() { return f(); }; f;", Path::new("t.hml")).unwrap();
        let interp = Interp::new(InterpOptions {
            capture_output: true,
            ..Default::default()
        });
        let result = interp.run(&program).unwrap();
        let weak = match &result {
            Value::Function(cell) => std::rc::Rc::downgrade(cell),
            other => panic!("expected function result, got {}", other.type_name()),
        };
        drop(result);
        interp.teardown();
        drop(interp);
        weak.upgrade().is_none()
    });
    assert!(freed, "closure cycle survived teardown");
}
