//! One more attempt for steps the host failed

use std::fmt::Display;

use tracing::warn;

/// Attempts made for a step whose failure is the host's
pub const INFRASTRUCTURE_ATTEMPTS: u32 = 2;

/// Run `attempt` until it succeeds, fails for a reason `is_infrastructure`
/// rejects, or [`INFRASTRUCTURE_ATTEMPTS`] are used up.
///
/// Only host failures (scratch directory, spawn, cgroup) are retried; a
/// verdict about the submission is returned as is.
pub async fn retry_infrastructure<T, E, F, Fut>(
    step: &str,
    is_infrastructure: fn(&E) -> bool,
    mut attempt: F,
) -> Result<T, E>
where
    E: Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut tries = 1;
    loop {
        match attempt().await {
            Err(e) if tries < INFRASTRUCTURE_ATTEMPTS && is_infrastructure(&e) => {
                warn!(step, attempt = tries, error = %e, "infrastructure failure, retrying");
                tries += 1;
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::SandboxError;

    fn transient() -> SandboxError {
        SandboxError::SpawnFailed(std::io::Error::other("EAGAIN"))
    }

    #[tokio::test]
    async fn transient_failure_is_retried_once() {
        let mut calls = 0;
        let result = retry_infrastructure("run", SandboxError::is_infrastructure, || {
            calls += 1;
            let call = calls;
            async move { if call == 1 { Err(transient()) } else { Ok(call) } }
        })
        .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls, 2);
    }

    #[tokio::test]
    async fn second_failure_is_returned() {
        let mut calls = 0;
        let result: Result<(), _> =
            retry_infrastructure("build", SandboxError::is_infrastructure, || {
                calls += 1;
                async { Err(transient()) }
            })
            .await;

        assert!(matches!(result, Err(SandboxError::SpawnFailed(_))));
        assert_eq!(calls, INFRASTRUCTURE_ATTEMPTS);
    }

    #[tokio::test]
    async fn other_failures_are_not_retried() {
        let mut calls = 0;
        let result: Result<(), _> =
            retry_infrastructure("run", SandboxError::is_infrastructure, || {
                calls += 1;
                async { Err(SandboxError::CommandNotFound("g++".into())) }
            })
            .await;

        assert!(matches!(result, Err(SandboxError::CommandNotFound(_))));
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn success_runs_once() {
        let mut calls = 0;
        let result: Result<_, SandboxError> =
            retry_infrastructure("run", SandboxError::is_infrastructure, || {
                calls += 1;
                async { Ok("done") }
            })
            .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls, 1);
    }
}
