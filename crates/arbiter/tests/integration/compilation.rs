use arbiter::{JudgeRequest, JudgeStatus, TestCase};

use super::{fixture_source, reverse_cases, test_judge};

#[tokio::test]
async fn test_compile_error_runs_nothing() {
    require_language!("cpp17");
    let judge = test_judge();
    let request = JudgeRequest::new("cpp17", fixture_source("compile_error.cpp"), reverse_cases());

    let result = judge.judge(request).await;

    assert_eq!(result.status, JudgeStatus::Error);
    let message = result.error_message.expect("compiler output expected");
    assert!(message.contains("error"), "{message}");
    assert_eq!(result.tests_passed, 0);
    assert_eq!(result.tests_total, 4);
    assert!(result.test_results.is_empty());
}

#[tokio::test]
async fn test_trailing_whitespace_is_significant() {
    require_language!("python3");
    let judge = test_judge();
    let cases = vec![
        TestCase::new("", "olleh"),
        TestCase::new("", "olleh\n"),
        TestCase::new("", "olleh \n"),
        TestCase::new("", "olleh\n\n"),
    ];
    let request = JudgeRequest::new("python3", "print('olleh')", cases);

    let result = judge.judge(request).await;

    let passed: Vec<bool> = result.test_results.iter().map(|r| r.passed).collect();
    assert_eq!(passed, vec![true, true, false, false]);
    assert_eq!(result.status, JudgeStatus::WrongAnswer);
}

#[tokio::test]
async fn test_unknown_language_is_rejected() {
    let judge = test_judge();
    let request = JudgeRequest::new("brainfuck", "+[]", reverse_cases());

    let result = judge.judge(request).await;

    assert_eq!(result.status, JudgeStatus::Error);
    assert!(result.error_message.unwrap().contains("unsupported language"));
}
