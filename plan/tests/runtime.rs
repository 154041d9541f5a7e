//! End-to-end plan runtime tests against a scripted tool host.
#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use scout_plan::PlanStatus;
use scout_plan::RuntimeOptions;
use scout_plan::ToolHost;
use scout_plan::execute;

/// Host whose tools are canned closures; `bash` sleeps `n * 50ms` for a
/// numeric argument `n` so tests can observe fan-out scheduling.
#[derive(Default)]
struct FakeHost {
    calls: Mutex<Vec<String>>,
}

impl FakeHost {
    fn record(&self, line: String) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(line);
        }
    }

    fn call_count(&self) -> usize {
        self.calls.lock().map(|c| c.len()).unwrap_or(0)
    }
}

impl ToolHost for FakeHost {
    fn has_tool(&self, name: &str) -> bool {
        matches!(
            name,
            "search" | "query" | "extract" | "listFiles" | "bash" | "LLM" | "delegate"
        )
    }

    fn call_tool(
        &self,
        name: &str,
        args: Vec<serde_json::Value>,
        _cancel: CancellationToken,
    ) -> BoxFuture<'static, Result<serde_json::Value, String>> {
        self.record(format!("{name}({args:?})"));
        let name = name.to_string();
        async move {
            match name.as_str() {
                "search" => Ok(json!("{\"files\": [\"a.rs\", \"b.rs\"]}")),
                "extract" => {
                    let target = args
                        .first()
                        .and_then(|a| a.as_str())
                        .unwrap_or_default()
                        .to_string();
                    Ok(json!(format!("content of {target}")))
                }
                "LLM" => Ok(json!({
                    "content": [{"type": "text", "text": "summary"}]
                })),
                "bash" => {
                    let n = args.first().and_then(|a| a.as_f64()).unwrap_or(0.0);
                    tokio::time::sleep(Duration::from_millis((n * 50.0) as u64)).await;
                    Ok(json!(format!("slept {n}")))
                }
                "delegate" => Err("delegate failed: no capacity".to_string()),
                other => Err(format!("Error: unknown tool '{other}'")),
            }
        }
        .boxed()
    }
}

async fn run(source: &str) -> scout_plan::PlanOutcome {
    run_with(source, RuntimeOptions::default()).await
}

async fn run_with(source: &str, options: RuntimeOptions) -> scout_plan::PlanOutcome {
    let host = Arc::new(FakeHost::default());
    execute(source, host, options, CancellationToken::new()).await
}

#[tokio::test]
async fn returns_explicit_return_value() {
    let outcome = run("const x = []; for (const i of [1, 2]) x.push(i); return x;").await;
    assert_eq!(outcome.status, PlanStatus::Success);
    assert_eq!(outcome.result, Some(json!([1, 2])));
}

#[tokio::test]
async fn search_results_are_auto_parsed_json() {
    let outcome = run("const r = search('x'); return r.files.length;").await;
    assert_eq!(outcome.status, PlanStatus::Success, "{:?}", outcome.error);
    assert_eq!(outcome.result, Some(json!(2)));
}

#[tokio::test]
async fn llm_envelope_is_unwrapped_to_text() {
    let outcome = run("return LLM('summarize', 'data');").await;
    assert_eq!(outcome.result, Some(json!("summary")));
}

#[tokio::test]
async fn map_preserves_order_and_bounds_concurrency() {
    let source = "return map([5, 4, 3, 2, 1], n => bash(n));";
    let started = tokio::time::Instant::now();
    let outcome = run_with(
        source,
        RuntimeOptions {
            concurrency: 2,
            ..RuntimeOptions::default()
        },
    )
    .await;
    let elapsed = started.elapsed();

    assert_eq!(outcome.status, PlanStatus::Success, "{:?}", outcome.error);
    assert_eq!(
        outcome.result,
        Some(json!([
            "slept 5", "slept 4", "slept 3", "slept 2", "slept 1"
        ]))
    );
    // Serial execution would sleep 750ms; two lanes finish well under that.
    assert!(
        elapsed < Duration::from_millis(700),
        "took {elapsed:?}, expected concurrent execution"
    );
}

#[tokio::test]
async fn map_turns_item_failures_into_error_strings() {
    let outcome = run("return map([1, 2], n => delegate(n));").await;
    assert_eq!(outcome.status, PlanStatus::Success);
    assert_eq!(
        outcome.result,
        Some(json!([
            "ERROR: delegate failed: no capacity",
            "ERROR: delegate failed: no capacity"
        ]))
    );
}

#[tokio::test]
async fn map_result_length_matches_input_length() {
    let outcome = run("return map(range(0, 7), n => n * 2).length;").await;
    assert_eq!(outcome.result, Some(json!(7)));
}

#[tokio::test]
async fn thrown_values_survive_catch_unboxed() {
    let outcome = run(
        r#"
        try {
            throw "boom";
        } catch (e) {
            return "caught " + e;
        }
        "#,
    )
    .await;
    assert_eq!(outcome.result, Some(json!("caught boom")));
}

#[tokio::test]
async fn tool_errors_are_catchable_as_messages() {
    let outcome = run(
        r#"
        try {
            delegate("task");
            return "unreachable";
        } catch (e) {
            return e;
        }
        "#,
    )
    .await;
    assert_eq!(outcome.result, Some(json!("delegate failed: no capacity")));
}

#[tokio::test]
async fn uncaught_throw_becomes_error_outcome() {
    let outcome = run("throw new Error('bad plan');").await;
    assert_eq!(outcome.status, PlanStatus::Error);
    assert_eq!(outcome.error.as_deref(), Some("Error: bad plan"));
}

#[tokio::test]
async fn loop_budget_aborts_infinite_loops() {
    let outcome = run_with(
        "let i = 0; while (true) { i = i + 1; } return i;",
        RuntimeOptions {
            loop_budget: 100,
            ..RuntimeOptions::default()
        },
    )
    .await;
    assert_eq!(outcome.status, PlanStatus::Error);
    assert!(
        outcome
            .error
            .as_deref()
            .unwrap_or_default()
            .contains("Loop iteration budget exceeded"),
        "{:?}",
        outcome.error
    );
}

#[tokio::test]
async fn loop_budget_is_shared_across_loops() {
    let outcome = run_with(
        "for (const a of range(0, 60)) {}\nfor (const b of range(0, 60)) {}\nreturn 1;",
        RuntimeOptions {
            loop_budget: 100,
            ..RuntimeOptions::default()
        },
    )
    .await;
    assert_eq!(outcome.status, PlanStatus::Error);
}

#[tokio::test]
async fn budget_fault_is_not_catchable() {
    let outcome = run_with(
        "try { while (true) {} } catch (e) { return 'caught'; }",
        RuntimeOptions {
            loop_budget: 50,
            ..RuntimeOptions::default()
        },
    )
    .await;
    assert_eq!(outcome.status, PlanStatus::Error);
}

#[tokio::test]
async fn deadline_cancels_long_plans() {
    let outcome = run_with(
        "return bash(100);", // 5s sleep
        RuntimeOptions {
            deadline: Duration::from_millis(200),
            ..RuntimeOptions::default()
        },
    )
    .await;
    assert_eq!(outcome.status, PlanStatus::Error);
    assert!(
        outcome
            .error
            .as_deref()
            .unwrap_or_default()
            .contains("deadline"),
        "{:?}",
        outcome.error
    );
}

#[tokio::test]
async fn cancellation_stops_execution() {
    let host = Arc::new(FakeHost::default());
    let cancel = CancellationToken::new();
    cancel.cancel();
    let outcome = execute(
        "return bash(100);",
        host,
        RuntimeOptions::default(),
        cancel,
    )
    .await;
    assert_eq!(outcome.status, PlanStatus::Error);
    assert!(
        outcome
            .error
            .as_deref()
            .unwrap_or_default()
            .contains("cancelled"),
        "{:?}",
        outcome.error
    );
}

#[tokio::test]
async fn logs_are_collected_in_order() {
    let outcome = run("log('first'); log('second', 2); return 1;").await;
    assert_eq!(outcome.logs, vec!["first".to_string(), "second 2".to_string()]);
}

#[tokio::test]
async fn error_outcomes_carry_a_diagnostic_log_line() {
    let outcome = run("throw 'oops';").await;
    assert_eq!(outcome.status, PlanStatus::Error);
    assert!(outcome.logs.iter().any(|l| l.contains("oops")));
}

#[tokio::test]
async fn validation_failure_short_circuits_execution() {
    let host = Arc::new(FakeHost::default());
    let outcome = execute(
        "process.exit(1)",
        Arc::clone(&host) as Arc<dyn ToolHost>,
        RuntimeOptions::default(),
        CancellationToken::new(),
    )
    .await;
    assert_eq!(outcome.status, PlanStatus::Error);
    assert!(
        outcome
            .error
            .as_deref()
            .unwrap_or_default()
            .contains("Blocked identifier: 'process'"),
        "{:?}",
        outcome.error
    );
    assert_eq!(host.call_count(), 0);
}

#[tokio::test]
async fn helpers_compose_with_tools() {
    let outcome = run(
        r#"
        const chunks = chunk("aaaa\nbbbb\ncccc\n", 10);
        const summaries = map(chunks, c => LLM("summarize", c));
        return { groups: groupBy([{k: "x"}, {k: "y"}, {k: "x"}], "k"), n: summaries.length };
        "#,
    )
    .await;
    assert_eq!(outcome.status, PlanStatus::Success, "{:?}", outcome.error);
    let result = outcome.result.expect("result");
    assert_eq!(result["n"], json!(2));
    assert_eq!(result["groups"]["x"], json!([{"k": "x"}, {"k": "x"}]));
}

#[tokio::test]
async fn completion_value_is_last_expression_without_return() {
    let outcome = run("1 + 1; 'final'").await;
    assert_eq!(outcome.result, Some(json!("final")));
}

#[tokio::test]
async fn user_functions_and_closures_work() {
    let outcome = run(
        r#"
        function total(xs) {
            let sum = 0;
            for (const x of xs) { sum += x; }
            return sum;
        }
        const double = x => x * 2;
        return double(total([1, 2, 3]));
        "#,
    )
    .await;
    assert_eq!(outcome.result, Some(json!(12)));
}

#[tokio::test]
async fn json_and_string_builtins_work() {
    let outcome = run(
        r#"
        const parsed = JSON.parse('{"a": [1, 2]}');
        const upper = "hello".toUpperCase();
        return JSON.stringify({ a: parsed.a.length, upper: upper });
        "#,
    )
    .await;
    assert_eq!(
        outcome.result,
        Some(json!("{\"a\":2,\"upper\":\"HELLO\"}"))
    );
}
