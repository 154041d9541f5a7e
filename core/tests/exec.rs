//! Executor integration tests: timeouts, output caps, working-directory
//! containment, and shell vs no-shell spawning.
#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::path::PathBuf;
use std::time::Duration;
use std::time::Instant;

use tokio_util::sync::CancellationToken;

use scout_core::ExecRequest;
use scout_core::SpawnMode;
use scout_core::exec::execute;
use scout_core::exec::is_within_allowed_roots;

fn shell_request(script: &str, cwd: PathBuf) -> ExecRequest {
    ExecRequest::new(SpawnMode::Shell(script.to_string()), script, cwd)
}

fn roots(cwd: &PathBuf) -> Vec<PathBuf> {
    vec![cwd.clone()]
}

#[tokio::test]
async fn captures_stdout_stderr_and_exit_code() -> anyhow::Result<()> {
    let cwd = std::env::temp_dir();
    let request = shell_request("echo out; echo err >&2; exit 3", cwd.clone());
    let result = execute(request, &roots(&cwd), &CancellationToken::new()).await;

    assert!(!result.success);
    assert_eq!(result.exit_code, Some(3));
    assert!(!result.killed);
    assert_eq!(result.stdout.trim_end(), "out");
    assert_eq!(result.stderr.trim_end(), "err");
    assert!(result.error_message.is_none());
    Ok(())
}

#[tokio::test]
async fn success_requires_exit_zero_and_not_killed() {
    let cwd = std::env::temp_dir();
    let request = ExecRequest::new(
        SpawnMode::Direct(vec!["echo".to_string(), "ok".to_string()]),
        "echo ok",
        cwd.clone(),
    );
    let result = execute(request, &roots(&cwd), &CancellationToken::new()).await;
    assert!(result.success);
    assert_eq!(result.exit_code, Some(0));
    assert_eq!(result.stdout.trim_end(), "ok");
}

#[tokio::test]
async fn direct_spawn_does_not_interpret_shell_operators() {
    let cwd = std::env::temp_dir();
    // Without a shell, `&&` is just an argument.
    let request = ExecRequest::new(
        SpawnMode::Direct(vec!["echo".to_string(), "a".to_string(), "&&".to_string(), "b".to_string()]),
        "echo a && b",
        cwd.clone(),
    );
    let result = execute(request, &roots(&cwd), &CancellationToken::new()).await;
    assert_eq!(result.stdout.trim_end(), "a && b");
}

#[tokio::test]
async fn timeout_kills_the_child() {
    let cwd = std::env::temp_dir();
    let mut request = shell_request("sleep 10", cwd.clone());
    request.timeout = Duration::from_millis(1_000);

    let started = Instant::now();
    let result = execute(request, &roots(&cwd), &CancellationToken::new()).await;
    let elapsed = started.elapsed();

    assert!(!result.success);
    assert!(result.killed);
    assert_eq!(
        result.error_message.as_deref(),
        Some("Command timed out after 1000ms")
    );
    assert!(elapsed >= Duration::from_millis(1_000), "{elapsed:?}");
    assert!(elapsed <= Duration::from_millis(6_500), "{elapsed:?}");
}

#[tokio::test]
async fn output_overflow_kills_the_child() {
    let cwd = std::env::temp_dir();
    let mut request = shell_request("yes scout-overflow", cwd.clone());
    request.timeout = Duration::from_secs(30);
    request.max_output_bytes = 2048;

    let started = Instant::now();
    let result = execute(request, &roots(&cwd), &CancellationToken::new()).await;

    assert!(!result.success);
    assert!(result.killed);
    assert!(
        result
            .error_message
            .as_deref()
            .unwrap_or_default()
            .contains("output exceeded"),
        "{:?}",
        result.error_message
    );
    assert!(result.stdout.len() <= 2048);
    assert!(started.elapsed() < Duration::from_secs(20));
}

#[tokio::test]
async fn cancellation_kills_the_child() {
    let cwd = std::env::temp_dir();
    let mut request = shell_request("sleep 10", cwd.clone());
    request.timeout = Duration::from_secs(30);

    let cancel = CancellationToken::new();
    let child_cancel = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        child_cancel.cancel();
    });

    let result = execute(request, &roots(&cwd), &cancel).await;
    assert!(result.killed);
    assert_eq!(result.error_message.as_deref(), Some("Command cancelled"));
}

#[tokio::test]
async fn missing_working_directory_fails_without_spawning() {
    let cwd = PathBuf::from("/definitely/not/a/real/dir");
    let request = shell_request("echo hi", cwd.clone());
    let result = execute(request, &[std::env::temp_dir()], &CancellationToken::new()).await;
    assert!(!result.success);
    assert!(
        result
            .error_message
            .as_deref()
            .unwrap_or_default()
            .contains("working directory does not exist")
    );
}

#[tokio::test]
async fn working_directory_outside_allowed_roots_is_rejected() {
    let allowed = tempfile::tempdir().unwrap();
    let outside = tempfile::tempdir().unwrap();
    let request = shell_request("echo hi", outside.path().to_path_buf());
    let result = execute(
        request,
        &[allowed.path().to_path_buf()],
        &CancellationToken::new(),
    )
    .await;
    assert!(!result.success);
    assert!(
        result
            .error_message
            .as_deref()
            .unwrap_or_default()
            .contains("outside the allowed folders")
    );
}

#[test]
fn allowed_root_check_respects_path_component_boundaries() {
    let tmp = PathBuf::from("/tmp");
    assert!(is_within_allowed_roots(&PathBuf::from("/tmp"), &[tmp.clone()]));
    assert!(is_within_allowed_roots(
        &PathBuf::from("/tmp/project"),
        &[tmp.clone()]
    ));
    // Substring match without a separator boundary must not pass.
    assert!(!is_within_allowed_roots(
        &PathBuf::from("/tmp-attack"),
        &[tmp.clone()]
    ));
    assert!(!is_within_allowed_roots(&PathBuf::from("/tmp"), &[]));
}

#[test]
fn render_includes_stderr_section_and_metadata() {
    let cwd = std::env::temp_dir();
    let request = shell_request("echo out; echo err >&2", cwd.clone());
    let result = tokio_test::block_on(async {
        execute(request, &roots(&cwd), &CancellationToken::new()).await
    });
    let rendered = result.render(true);
    assert!(rendered.contains("Command: echo out; echo err >&2"));
    assert!(rendered.contains("out"));
    assert!(rendered.contains("--- STDERR ---"));
    assert!(rendered.contains("err"));
}
