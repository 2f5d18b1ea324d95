use arbiter::{JudgeRequest, JudgeStatus, TestCase};
use tokio::task::JoinSet;

use super::{fixture_source, reverse_cases, test_judge};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_fifty_concurrent_submissions() {
    require_language!("python3");
    let judge = test_judge();
    let correct = fixture_source("reverse.py");

    let mut tasks = JoinSet::new();
    for i in 0..50 {
        let judge = judge.clone();
        let request = if i % 2 == 0 {
            JudgeRequest::new("python3", correct.clone(), reverse_cases())
        } else {
            let cases = vec![TestCase::new(format!("{i}\n"), format!("{i}"))];
            JudgeRequest::new("python3", "print(input())", cases)
        };
        tasks.spawn(async move { (i, judge.judge(request).await) });
    }

    let mut seen = 0;
    while let Some(joined) = tasks.join_next().await {
        let (i, result) = joined.expect("judge task panicked");
        assert_eq!(result.status, JudgeStatus::Accepted, "submission {i}: {result:?}");
        if i % 2 == 1 {
            assert_eq!(result.test_results[0].actual_output, format!("{i}\n"));
        }
        seen += 1;
    }
    assert_eq!(seen, 50);
    assert_eq!(judge.pool().available(), judge.pool().capacity());
}
