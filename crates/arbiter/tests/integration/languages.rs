use arbiter::{JudgeRequest, JudgeStatus, TestCase};

use super::{fixture_source, reverse_array_cases, reverse_cases, test_judge};

async fn assert_accepted(language: &str, fixture: &str, cases: Vec<TestCase>) {
    let judge = test_judge();
    let total = cases.len();
    let request = JudgeRequest::new(language, fixture_source(fixture), cases)
        .with_time_limit_ms(5000)
        .with_memory_limit_mb(512);

    let result = judge.judge(request).await;

    assert_eq!(result.status, JudgeStatus::Accepted, "{language}: {result:?}");
    assert_eq!(result.tests_passed, total);
    assert_eq!(result.tests_total, total);
    assert!(result.error_message.is_none());
    assert_eq!(result.test_results.len(), total);
}

#[tokio::test]
async fn test_python_reverse() {
    require_language!("python3");
    assert_accepted("python3", "reverse.py", reverse_cases()).await;
    assert_accepted("python3", "reverse_array.py", reverse_array_cases()).await;
}

#[tokio::test]
async fn test_cpp_reverse() {
    require_language!("cpp17");
    assert_accepted("cpp17", "reverse.cpp", reverse_cases()).await;
    assert_accepted("cpp17", "reverse_array.cpp", reverse_array_cases()).await;
}

#[tokio::test]
async fn test_c_reverse() {
    require_language!("c");
    assert_accepted("c", "reverse.c", reverse_cases()).await;
    assert_accepted("c", "reverse_array.c", reverse_array_cases()).await;
}

#[tokio::test]
async fn test_rust_reverse() {
    require_language!("rust");
    assert_accepted("rust", "reverse.rs", reverse_cases()).await;
    assert_accepted("rust", "reverse_array.rs", reverse_array_cases()).await;
}

#[tokio::test]
async fn test_java_reverse() {
    require_language!("java");
    assert_accepted("java", "Reverse.java", reverse_cases()).await;
    assert_accepted("java", "ReverseArray.java", reverse_array_cases()).await;
}

#[tokio::test]
async fn test_javascript_reverse() {
    require_language!("javascript");
    assert_accepted("javascript", "reverse.js", reverse_cases()).await;
    assert_accepted("javascript", "reverse_array.js", reverse_array_cases()).await;
}

#[tokio::test]
async fn test_go_reverse() {
    require_language!("go");
    assert_accepted("go", "reverse.go", reverse_cases()).await;
    assert_accepted("go", "reverse_array.go", reverse_array_cases()).await;
}
