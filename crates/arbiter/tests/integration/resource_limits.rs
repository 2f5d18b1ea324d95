use std::time::{Duration, Instant};

use arbiter::sandbox::IsolationOptions;
use arbiter::{ErrorKind, JudgeRequest, JudgeStatus, TestCase};

use super::{fixture_source, test_judge};

fn single_case() -> Vec<TestCase> {
    vec![TestCase::new("", "")]
}

#[tokio::test]
async fn test_python_infinite_loop_is_tle() {
    require_language!("python3");
    let judge = test_judge();
    let request =
        JudgeRequest::new("python3", fixture_source("infinite_loop.py"), single_case())
            .with_time_limit_ms(1000);

    let started = Instant::now();
    let result = judge.judge(request).await;

    assert_eq!(result.status, JudgeStatus::Tle, "{result:?}");
    assert_eq!(result.test_results[0].error_kind, ErrorKind::Timeout);
    assert!(result.exec_time_ms >= 1000);
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn test_cpp_infinite_loop_is_tle() {
    require_language!("cpp17");
    let judge = test_judge();
    let request = JudgeRequest::new("cpp17", fixture_source("infinite_loop.cpp"), single_case())
        .with_time_limit_ms(1000);

    let result = judge.judge(request).await;

    assert_eq!(result.status, JudgeStatus::Tle, "{result:?}");
}

#[tokio::test]
async fn test_python_memory_hog_is_mle() {
    require_language!("python3");
    let judge = test_judge();
    let request = JudgeRequest::new("python3", fixture_source("memory_hog.py"), single_case())
        .with_time_limit_ms(5000)
        .with_memory_limit_mb(256);

    let result = judge.judge(request).await;

    assert_eq!(result.status, JudgeStatus::Mle, "{result:?}");
    assert_eq!(result.test_results[0].error_kind, ErrorKind::MemoryExceeded);
}

#[tokio::test]
async fn test_cpp_memory_hog_is_mle() {
    require_language!("cpp17");
    let judge = test_judge();
    let request = JudgeRequest::new("cpp17", fixture_source("memory_hog.cpp"), single_case())
        .with_time_limit_ms(5000)
        .with_memory_limit_mb(256);

    let result = judge.judge(request).await;

    assert_eq!(result.status, JudgeStatus::Mle, "{result:?}");
}

#[tokio::test]
async fn test_runtime_error_reports_stderr() {
    require_language!("python3");
    let judge = test_judge();
    let cases = vec![TestCase::new("5\n", "2"), TestCase::new("0\n", "")];
    let request = JudgeRequest::new("python3", fixture_source("runtime_error.py"), cases);

    let result = judge.judge(request).await;

    assert_eq!(result.status, JudgeStatus::Error, "{result:?}");
    assert_eq!(result.tests_passed, 1);
    assert!(result.error_message.unwrap().contains("ZeroDivisionError"));
    assert_eq!(result.test_results[1].error_kind, ErrorKind::RuntimeError);
}

#[tokio::test]
async fn test_unbounded_output_is_capped() {
    require_language!("python3");
    let judge = test_judge();
    let request = JudgeRequest::new("python3", fixture_source("big_output.py"), single_case())
        .with_time_limit_ms(1000);

    let result = judge.judge(request).await;

    let case = &result.test_results[0];
    assert_eq!(result.status, JudgeStatus::Tle, "{result:?}");
    assert!(case.truncated);
    assert!(case.actual_output.len() <= 64 * 1024);
}

#[tokio::test]
async fn test_fork_loop_is_stopped() {
    require_language!("python3");
    let judge = test_judge();
    let cases = vec![TestCase::new("", "60\n")];
    let request = JudgeRequest::new("python3", fixture_source("fork_loop.py"), cases)
        .with_time_limit_ms(5000);

    let result = judge.judge(request).await;

    assert_eq!(result.status, JudgeStatus::Error, "{result:?}");
    if let Some(case) = result.test_results.first() {
        assert_ne!(case.actual_output.trim(), "60");
    }
}

#[tokio::test]
async fn test_program_only_writes_its_scratch_directory() {
    require_language!("python3");
    let judge = test_judge();
    let cases = vec![TestCase::new("", "kept\n")];
    let request = JudgeRequest::new("python3", fixture_source("escape.py"), cases);

    let result = judge.judge(request).await;

    assert!(!std::path::Path::new("/tmp/arbiter-escaped.txt").exists());
    if IsolationOptions::namespaces_available() {
        assert_eq!(result.status, JudgeStatus::Accepted, "{result:?}");
    } else {
        // strict isolation refuses to run unconfined
        assert_eq!(result.status, JudgeStatus::Error, "{result:?}");
    }
}
