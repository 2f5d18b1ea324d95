//! Wire types of the judge API (camelCase JSON)

use serde::{Deserialize, Serialize};

/// Default per-test-case wall clock when a request omits `timeLimitMs`
pub const DEFAULT_TIME_LIMIT_MS: i64 = 2000;

/// Default memory ceiling when a request omits `memoryLimitMb`
pub const DEFAULT_MEMORY_LIMIT_MB: i64 = 256;

/// A submission to judge
///
/// Limits are signed so a zero or negative value reaches validation and is
/// reported as a verdict instead of failing deserialisation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JudgeRequest {
    /// Language ID from the registry
    pub language: String,

    /// Source code
    pub code: String,

    /// Test cases, judged in this order
    pub test_cases: Vec<TestCase>,

    /// Wall clock limit per test case, in milliseconds
    #[serde(default = "default_time_limit_ms")]
    pub time_limit_ms: i64,

    /// Memory limit per test case, in megabytes
    #[serde(default = "default_memory_limit_mb")]
    pub memory_limit_mb: i64,

    /// Stop after the first failing test case (overrides the server default)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fail_fast: Option<bool>,
}

impl JudgeRequest {
    pub fn new(language: impl Into<String>, code: impl Into<String>, test_cases: Vec<TestCase>) -> Self {
        Self {
            language: language.into(),
            code: code.into(),
            test_cases,
            time_limit_ms: DEFAULT_TIME_LIMIT_MS,
            memory_limit_mb: DEFAULT_MEMORY_LIMIT_MB,
            fail_fast: None,
        }
    }

    pub fn with_time_limit_ms(mut self, ms: i64) -> Self {
        self.time_limit_ms = ms;
        self
    }

    pub fn with_memory_limit_mb(mut self, mb: i64) -> Self {
        self.memory_limit_mb = mb;
        self
    }

    pub fn with_fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = Some(fail_fast);
        self
    }
}

fn default_time_limit_ms() -> i64 {
    DEFAULT_TIME_LIMIT_MS
}

fn default_memory_limit_mb() -> i64 {
    DEFAULT_MEMORY_LIMIT_MB
}

/// One input and the output it must produce
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestCase {
    pub input: String,
    pub expected_output: String,
}

impl TestCase {
    pub fn new(input: impl Into<String>, expected_output: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            expected_output: expected_output.into(),
        }
    }
}

/// Overall verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JudgeStatus {
    Accepted,
    WrongAnswer,
    Tle,
    Mle,
    Error,
}

/// Why a test case failed to produce a comparable output
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    #[default]
    None,
    RuntimeError,
    Timeout,
    MemoryExceeded,
}

/// Result of one test case
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestCaseResult {
    /// Position of the case in the request
    pub index: usize,

    pub passed: bool,

    /// Captured stdout, cut to the report size
    pub actual_output: String,

    pub exec_time_ms: u64,

    pub memory_mb: u64,

    pub error_kind: ErrorKind,

    /// stdout hit the capture cap; the captured prefix was judged
    pub truncated: bool,

    /// stderr excerpt for runtime errors
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl TestCaseResult {
    /// Whether this case counts against the submission
    pub fn is_failure(&self) -> bool {
        !self.passed || self.error_kind != ErrorKind::None
    }
}

/// Verdict for a whole submission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JudgeResult {
    pub status: JudgeStatus,

    pub tests_passed: usize,

    pub tests_total: usize,

    /// Slowest executed test case
    pub exec_time_ms: u64,

    /// Largest peak memory among executed test cases
    pub memory_mb: u64,

    /// Only set when `status` is `error`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    /// Per-case results in input order
    #[serde(default)]
    pub test_results: Vec<TestCaseResult>,
}

impl JudgeResult {
    /// A verdict of `error` with nothing run
    pub fn error(message: impl Into<String>, tests_total: usize) -> Self {
        Self {
            status: JudgeStatus::Error,
            tests_passed: 0,
            tests_total,
            exec_time_ms: 0,
            memory_mb: 0,
            error_message: Some(message.into()),
            test_results: Vec::new(),
        }
    }

    pub fn is_accepted(&self) -> bool {
        self.status == JudgeStatus::Accepted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_defaults() {
        let json = r#"{
            "language": "python3",
            "code": "print(input()[::-1])",
            "testCases": [{"input": "hello", "expectedOutput": "olleh"}]
        }"#;
        let request: JudgeRequest = serde_json::from_str(json).unwrap();

        assert_eq!(request.time_limit_ms, 2000);
        assert_eq!(request.memory_limit_mb, 256);
        assert_eq!(request.fail_fast, None);
        assert_eq!(request.test_cases[0].expected_output, "olleh");
    }

    #[test]
    fn request_accepts_negative_limits() {
        let json = r#"{
            "language": "c", "code": "", "testCases": [],
            "timeLimitMs": -5, "memoryLimitMb": 0, "failFast": true
        }"#;
        let request: JudgeRequest = serde_json::from_str(json).unwrap();
        assert_eq!(request.time_limit_ms, -5);
        assert_eq!(request.memory_limit_mb, 0);
        assert_eq!(request.fail_fast, Some(true));
    }

    #[test]
    fn result_wire_format() {
        let result = JudgeResult {
            status: JudgeStatus::WrongAnswer,
            tests_passed: 1,
            tests_total: 2,
            exec_time_ms: 40,
            memory_mb: 9,
            error_message: None,
            test_results: vec![],
        };
        let json = serde_json::to_value(&result).unwrap();

        assert_eq!(json["status"], "wrong_answer");
        assert_eq!(json["testsPassed"], 1);
        assert_eq!(json["testsTotal"], 2);
        assert_eq!(json["execTimeMs"], 40);
        assert_eq!(json["memoryMb"], 9);
        assert!(json.get("errorMessage").is_none());
    }

    #[test]
    fn error_result_carries_message() {
        let result = JudgeResult::error("unsupported language: cobol", 3);
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["status"], "error");
        assert_eq!(json["errorMessage"], "unsupported language: cobol");
        assert_eq!(json["testsTotal"], 3);
        assert_eq!(json["testsPassed"], 0);
    }

    #[test]
    fn status_names() {
        for (status, name) in [
            (JudgeStatus::Accepted, "accepted"),
            (JudgeStatus::WrongAnswer, "wrong_answer"),
            (JudgeStatus::Tle, "tle"),
            (JudgeStatus::Mle, "mle"),
            (JudgeStatus::Error, "error"),
        ] {
            assert_eq!(serde_json::to_value(status).unwrap(), name);
        }
        assert_eq!(
            serde_json::to_value(ErrorKind::MemoryExceeded).unwrap(),
            "memory_exceeded"
        );
    }

    #[test]
    fn failure_classification() {
        let mut case = TestCaseResult {
            index: 0,
            passed: true,
            actual_output: "5".into(),
            exec_time_ms: 1,
            memory_mb: 1,
            error_kind: ErrorKind::None,
            truncated: false,
            error_message: None,
        };
        assert!(!case.is_failure());
        case.passed = false;
        assert!(case.is_failure());
    }
}
