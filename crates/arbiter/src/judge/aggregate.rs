//! Folding test case results into one verdict

use crate::judge::{ErrorKind, JudgeResult, JudgeStatus, TestCaseResult};

/// Build the verdict from per-case results sorted by index.
///
/// The status comes from the first failing case in input order. Time and
/// memory are maxima over the executed cases. `results` may be shorter than
/// `tests_total` when fail-fast stopped early.
pub fn aggregate(results: Vec<TestCaseResult>, tests_total: usize) -> JudgeResult {
    let tests_passed = results.iter().filter(|r| !r.is_failure()).count();
    let exec_time_ms = results.iter().map(|r| r.exec_time_ms).max().unwrap_or(0);
    let memory_mb = results.iter().map(|r| r.memory_mb).max().unwrap_or(0);

    let (status, error_message) = match results.iter().find(|r| r.is_failure()) {
        Some(failed) => match failed.error_kind {
            ErrorKind::None => (JudgeStatus::WrongAnswer, None),
            ErrorKind::Timeout => (JudgeStatus::Tle, None),
            ErrorKind::MemoryExceeded => (JudgeStatus::Mle, None),
            ErrorKind::RuntimeError => (
                JudgeStatus::Error,
                Some(
                    failed
                        .error_message
                        .clone()
                        .unwrap_or_else(|| format!("runtime error on test case {}", failed.index + 1)),
                ),
            ),
        },
        None if results.len() == tests_total => (JudgeStatus::Accepted, None),
        None => (
            JudgeStatus::Error,
            Some(format!(
                "only {} of {tests_total} test cases were run",
                results.len()
            )),
        ),
    };

    JudgeResult {
        status,
        tests_passed,
        tests_total,
        exec_time_ms,
        memory_mb,
        error_message,
        test_results: results,
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    fn arb_kind() -> impl Strategy<Value = ErrorKind> {
        prop_oneof![
            Just(ErrorKind::None),
            Just(ErrorKind::RuntimeError),
            Just(ErrorKind::Timeout),
            Just(ErrorKind::MemoryExceeded),
        ]
    }

    fn arb_results() -> impl Strategy<Value = Vec<TestCaseResult>> {
        prop::collection::vec((any::<bool>(), arb_kind(), 0u64..5000, 0u64..1024), 1..20).prop_map(
            |cases| {
                cases
                    .into_iter()
                    .enumerate()
                    .map(|(index, (passed, kind, time, mem))| TestCaseResult {
                        index,
                        passed: passed && kind == ErrorKind::None,
                        actual_output: String::new(),
                        exec_time_ms: time,
                        memory_mb: mem,
                        error_kind: kind,
                        truncated: false,
                        error_message: None,
                    })
                    .collect()
            },
        )
    }

    proptest! {
        #[test]
        fn passed_never_exceeds_total(results in arb_results()) {
            let total = results.len();
            let verdict = aggregate(results, total);
            prop_assert!(verdict.tests_passed <= verdict.tests_total);
        }

        #[test]
        fn accepted_iff_every_case_passed(results in arb_results()) {
            let total = results.len();
            let all_passed = results.iter().all(|r| r.passed && r.error_kind == ErrorKind::None);
            let verdict = aggregate(results, total);
            prop_assert_eq!(verdict.status == JudgeStatus::Accepted, all_passed);
            prop_assert_eq!(verdict.status == JudgeStatus::Accepted, verdict.tests_passed == total);
        }

        #[test]
        fn error_message_only_for_error(results in arb_results()) {
            let total = results.len();
            let verdict = aggregate(results, total);
            prop_assert_eq!(verdict.error_message.is_some(), verdict.status == JudgeStatus::Error);
        }

        #[test]
        fn maxima_cover_every_case(results in arb_results()) {
            let total = results.len();
            let max_time = results.iter().map(|r| r.exec_time_ms).max().unwrap_or(0);
            let max_mem = results.iter().map(|r| r.memory_mb).max().unwrap_or(0);
            let verdict = aggregate(results, total);
            prop_assert_eq!(verdict.exec_time_ms, max_time);
            prop_assert_eq!(verdict.memory_mb, max_mem);
        }
    }
}
