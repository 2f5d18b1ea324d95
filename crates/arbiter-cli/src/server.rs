//! HTTP front end for the judge

use anyhow::{Context, Result};
use arbiter::{Judge, JudgeRequest, JudgeResult, LanguageRegistry};
use axum::Router;
use axum::extract::{DefaultBodyLimit, Json, State};
use axum::routing::{get, post};
use serde::Serialize;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

/// Entry of `GET /languages`
#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct LanguageInfo {
    pub id: String,
    pub name: String,
    pub compiled: bool,
}

/// Build the service routes around a shared judge
pub fn router(judge: Judge, max_body_bytes: usize) -> Router {
    Router::new()
        .route("/judge", post(judge_handler))
        .route("/health", get(health_handler))
        .route("/languages", get(languages_handler))
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(judge)
}

/// Serve until Ctrl-C
pub async fn serve(judge: Judge, bind: &str, max_body_bytes: usize) -> Result<()> {
    let listener = TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;
    info!(
        addr = %listener.local_addr().context("listener has no address")?,
        workers = judge.pool().capacity(),
        "listening"
    );

    axum::serve(listener, router(judge, max_body_bytes))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("shutting down");
    }
}

/// Every verdict, `error` included, is a 200. If the client goes away the
/// handler future is dropped, which aborts the request's test cases.
async fn judge_handler(
    State(judge): State<Judge>,
    Json(request): Json<JudgeRequest>,
) -> Json<JudgeResult> {
    Json(judge.judge(request).await)
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

async fn languages_handler(State(judge): State<Judge>) -> Json<Vec<LanguageInfo>> {
    Json(language_list(judge.registry()))
}

pub fn language_list(registry: &LanguageRegistry) -> Vec<LanguageInfo> {
    registry
        .iter()
        .map(|(id, language)| LanguageInfo {
            id: id.to_string(),
            name: language.name.clone(),
            compiled: language.is_compiled(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbiter::Config;

    #[test]
    fn languages_are_sorted() {
        let registry = Config::default().registry();
        let list = language_list(&registry);

        let ids: Vec<&str> = list.iter().map(|l| l.id.as_str()).collect();
        let mut sorted = ids.clone();
        sorted.sort_unstable();
        assert_eq!(ids, sorted);

        let python = list.iter().find(|l| l.id == "python3").unwrap();
        assert!(!python.compiled);
        let cpp = list.iter().find(|l| l.id == "cpp17").unwrap();
        assert!(cpp.compiled);
    }

    #[test]
    fn health_body() {
        let body = serde_json::to_value(HealthResponse { status: "ok" }).unwrap();
        assert_eq!(body, serde_json::json!({"status": "ok"}));
    }
}
