use std::net::SocketAddr;
use std::sync::Arc;

use axum::{body::Bytes, extract::State, http::StatusCode, routing::any, Json, Router};
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::{error, info, info_span, Instrument};
use uuid::Uuid;

use crate::config::PipelineSettings;
use crate::error::{AnalyticsError, AnalyticsResult};
use crate::models::{ChartFailure, DatasetSummary};
use crate::pipeline::{self, InvocationOutcome, InvocationRequest};
use crate::storage::ArtifactWriter;

pub struct AppState {
    pub settings: PipelineSettings,
    pub writer: Arc<dyn ArtifactWriter>,
}

#[derive(Debug, Clone, Serialize)]
pub struct InvocationResponse {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifacts: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<ChartFailure>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<DatasetSummary>,
    #[serde(skip_serializing_if = "is_zero")]
    pub dropped_records: usize,
}

fn is_zero(value: &usize) -> bool {
    *value == 0
}

impl InvocationResponse {
    fn failure(message: String) -> Self {
        Self {
            status: "error",
            message: Some(message),
            artifacts: None,
            errors: Vec::new(),
            summary: None,
            dropped_records: 0,
        }
    }
}

pub fn status_for(error: &AnalyticsError) -> StatusCode {
    match error {
        AnalyticsError::BadRequest(_) => StatusCode::BAD_REQUEST,
        AnalyticsError::Validation(_) | AnalyticsError::Render { .. } => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        AnalyticsError::DataUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        AnalyticsError::Persistence { .. } => StatusCode::BAD_GATEWAY,
    }
}

pub fn parse_request(body: &[u8]) -> AnalyticsResult<InvocationRequest> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(InvocationRequest::default());
    }
    serde_json::from_slice(body).map_err(|e| AnalyticsError::BadRequest(e.to_string()))
}

/// Maps an outcome onto the wire. All charts written is `ok`; some written is
/// `partial` (207); none written while some failed is `error` with the status
/// of the first failure.
pub fn build_response(outcome: InvocationOutcome) -> (StatusCode, InvocationResponse) {
    let (artifacts, failures, summary) = match outcome {
        InvocationOutcome::Aborted(e) => {
            return (
                status_for(&e),
                InvocationResponse::failure(format!("{}: {e}", e.kind())),
            );
        }
        InvocationOutcome::Completed {
            artifacts,
            failures,
            summary,
        } => (artifacts, failures, summary),
    };

    let errors: Vec<ChartFailure> = failures
        .iter()
        .map(|f| ChartFailure {
            chart: f.chart.clone(),
            kind: f.error.kind(),
            message: f.error.to_string(),
        })
        .collect();

    let (code, status, message) = match (artifacts.is_empty(), failures.first()) {
        (_, None) => (StatusCode::OK, "ok", None),
        (false, Some(_)) => (
            StatusCode::MULTI_STATUS,
            "partial",
            Some(format!("{} of {} charts failed", failures.len(), failures.len() + artifacts.len())),
        ),
        (true, Some(first)) => (
            status_for(&first.error),
            "error",
            Some(format!("{}: {}", first.error.kind(), first.error)),
        ),
    };

    let dropped_records = summary.dropped_count;
    (
        code,
        InvocationResponse {
            status,
            message,
            artifacts: Some(artifacts),
            errors,
            summary: Some(summary),
            dropped_records,
        },
    )
}

/// The single function target. Every method and path lands here.
pub async fn generate_and_save_plots(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> (StatusCode, Json<InvocationResponse>) {
    let request = match parse_request(&body) {
        Ok(request) => request,
        Err(e) => {
            let (code, response) = build_response(InvocationOutcome::Aborted(e));
            return (code, Json(response));
        }
    };

    let span = info_span!("invocation", id = %Uuid::new_v4());
    // Run on its own task so a panic inside rendering still becomes a response.
    let task = tokio::spawn(
        async move {
            let outcome = pipeline::invoke(request, &state.settings, state.writer.as_ref()).await;
            build_response(outcome)
        }
        .instrument(span),
    );

    match task.await {
        Ok((code, response)) => {
            info!(status = %code, "responded");
            (code, Json(response))
        }
        Err(e) => {
            error!("invocation task failed: {e}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(InvocationResponse::failure(
                    "invocation aborted unexpectedly".to_string(),
                )),
            )
        }
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", any(generate_and_save_plots))
        .fallback(generate_and_save_plots)
        .with_state(state)
}

/// Resolves on Ctrl-C or SIGTERM, which is how Cloud Run stops an instance.
/// A signal that cannot be registered is logged and never fires.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("cannot listen for ctrl-c: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("cannot listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("ctrl-c received"),
        _ = terminate => info!("SIGTERM received"),
    }
}

/// Serves until `shutdown` resolves, then drains in-flight invocations.
pub async fn serve_until<F>(
    listener: TcpListener,
    state: Arc<AppState>,
    shutdown: F,
) -> anyhow::Result<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    info!("server stopped");
    Ok(())
}

pub async fn serve(state: Arc<AppState>, addr: SocketAddr) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("generate_and_save_plots listening on http://{}", listener.local_addr()?);
    serve_until(listener, state, shutdown_signal()).await
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use super::*;
    use crate::config::EmptyPolicy;
    use crate::loader::DataSource;
    use crate::models::ChartKind;
    use crate::storage::testing::MemoryWriter;
    use crate::storage::LocalDirWriter;

    fn state(writer: Arc<dyn ArtifactWriter>, source: DataSource) -> Arc<AppState> {
        Arc::new(AppState {
            settings: PipelineSettings {
                source,
                charts: vec![ChartKind::CumulativeHours, ChartKind::HoursByDate],
                strict: false,
                empty_policy: EmptyPolicy::Skip,
                artifact_prefix: String::new(),
            },
            writer,
        })
    }

    async fn call(state: Arc<AppState>, body: Value) -> (StatusCode, Value) {
        let (code, Json(response)) =
            generate_and_save_plots(State(state), Bytes::from(body.to_string())).await;
        (code, serde_json::to_value(response).unwrap())
    }

    #[tokio::test]
    async fn category_scenario_returns_one_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(
            Arc::new(LocalDirWriter::new(dir.path())),
            DataSource::Inline(vec![]),
        );

        let (code, body) = call(
            state,
            json!({
                "charts": ["hours_by_category"],
                "records": [
                    {"category": "A", "hours": 2},
                    {"category": "A", "hours": 3},
                    {"category": "B", "hours": 1}
                ]
            }),
        )
        .await;

        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        let artifacts = body["artifacts"].as_array().unwrap();
        assert_eq!(artifacts.len(), 1);
        assert!(artifacts[0].as_str().unwrap().ends_with("hours_by_category_plot.svg"));
        assert_eq!(body["summary"]["total_hours"], 6.0);
        assert!(body.get("errors").is_none());
    }

    #[tokio::test]
    async fn empty_dataset_is_ok_with_no_artifacts() {
        let state = state(Arc::new(MemoryWriter::default()), DataSource::Inline(vec![]));
        let (code, body) = call(state, json!({})).await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["artifacts"], json!([]));
    }

    #[tokio::test]
    async fn unreachable_source_is_a_5xx() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let writer = Arc::new(MemoryWriter::default());
        let state = state(
            writer.clone(),
            DataSource::Url {
                url: format!("http://{addr}/export"),
                token: None,
            },
        );

        let (code, body) = call(state, json!({})).await;
        assert!(code.is_server_error());
        assert_eq!(body["status"], "error");
        assert!(body["message"].as_str().unwrap().starts_with("DataUnavailable"));
        assert!(writer.names().is_empty());
    }

    #[tokio::test]
    async fn rejected_write_reports_partial_success() {
        let state = state(
            Arc::new(MemoryWriter::rejecting(&["cumulative_hours_plot.svg"])),
            DataSource::Inline(vec![]),
        );
        let (code, body) = call(
            state,
            json!({
                "records": [
                    {"hours": 2, "submission_date": "2025-09-05"},
                    {"hours": 1, "submission_date": "2025-09-06"}
                ]
            }),
        )
        .await;

        assert_eq!(code, StatusCode::MULTI_STATUS);
        assert_eq!(body["status"], "partial");
        assert_eq!(body["artifacts"], json!(["memory://total_hours_plot.svg"]));
        assert_eq!(body["errors"][0]["chart"], "cumulative_hours");
        assert_eq!(body["errors"][0]["kind"], "PersistenceError");
    }

    #[tokio::test]
    async fn every_chart_rejected_is_an_error() {
        let state = state(
            Arc::new(MemoryWriter::rejecting(&[
                "cumulative_hours_plot.svg",
                "total_hours_plot.svg",
            ])),
            DataSource::Inline(vec![]),
        );
        let (code, body) = call(
            state,
            json!({"records": [{"hours": 2, "submission_date": "2025-09-05"}]}),
        )
        .await;

        assert_eq!(code, StatusCode::BAD_GATEWAY);
        assert_eq!(body["status"], "error");
        assert_eq!(body["errors"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn malformed_body_is_a_bad_request() {
        let state = state(Arc::new(MemoryWriter::default()), DataSource::Inline(vec![]));
        let (code, Json(response)) =
            generate_and_save_plots(State(state), Bytes::from_static(b"{not json")).await;
        assert_eq!(code, StatusCode::BAD_REQUEST);
        assert_eq!(response.status, "error");
    }

    #[test]
    fn blank_body_means_default_request() {
        let request = parse_request(b"  \n").unwrap();
        assert!(request.charts.is_none());
        assert!(request.records.is_none());
    }

    #[test]
    fn dropped_rows_are_counted_in_the_response() {
        let outcome = InvocationOutcome::Completed {
            artifacts: vec!["memory://a.svg".to_string()],
            failures: vec![],
            summary: DatasetSummary {
                dropped_count: 2,
                ..Default::default()
            },
        };
        let (code, response) = build_response(outcome);
        assert_eq!(code, StatusCode::OK);
        assert_eq!(response.dropped_records, 2);
    }

    #[tokio::test]
    async fn server_stops_when_shutdown_fires() {
        let state = state(Arc::new(MemoryWriter::default()), DataSource::Inline(vec![]));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop, stopped) = tokio::sync::oneshot::channel::<()>();
        let server = tokio::spawn(serve_until(listener, state, async {
            stopped.await.ok();
        }));

        let response = reqwest::Client::new()
            .get(format!("http://{addr}/"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 200);

        stop.send(()).unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(5), server)
            .await
            .expect("server did not stop")
            .unwrap()
            .unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn sigterm_triggers_shutdown() {
        let signal = tokio::spawn(shutdown_signal());
        // Let the handler register before the signal is raised.
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        let status = std::process::Command::new("kill")
            .args(["-TERM", &std::process::id().to_string()])
            .status()
            .unwrap();
        assert!(status.success());
        tokio::time::timeout(std::time::Duration::from_secs(5), signal)
            .await
            .expect("SIGTERM was not observed")
            .unwrap();
    }

    #[tokio::test]
    async fn router_serves_any_path() {
        let state = state(Arc::new(MemoryWriter::default()), DataSource::Inline(vec![]));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router(state)).await.ok();
        });

        let response = reqwest::Client::new()
            .post(format!("http://{addr}/anything"))
            .body(r#"{"records": [{"category": "A", "hours": 1}], "charts": ["hours_by_category"]}"#)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 200);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["artifacts"], json!(["memory://hours_by_category_plot.svg"]));
    }
}
