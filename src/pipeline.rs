use serde::Deserialize;
use serde_json::Value;
use tracing::{error, info, warn};

use crate::aggregate;
use crate::config::{EmptyPolicy, PipelineSettings};
use crate::error::{AnalyticsError, AnalyticsResult};
use crate::loader::{self, DataSource};
use crate::models::{ChartArtifact, ChartKind, DatasetSummary};
use crate::render;
use crate::storage::ArtifactWriter;

/// Optional overrides carried in a request body. An empty body means "use
/// the deployment settings".
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InvocationRequest {
    #[serde(default)]
    pub charts: Option<Vec<ChartKind>>,
    #[serde(default)]
    pub records: Option<Vec<Value>>,
    #[serde(default)]
    pub strict: Option<bool>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChartError {
    pub chart: String,
    pub error: AnalyticsError,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InvocationOutcome {
    /// The data loaded; each requested chart either produced an artifact or
    /// a failure.
    Completed {
        artifacts: Vec<String>,
        failures: Vec<ChartError>,
        summary: DatasetSummary,
    },
    /// Nothing was written.
    Aborted(AnalyticsError),
}

async fn persist(
    writer: &dyn ArtifactWriter,
    prefix: &str,
    artifact: &ChartArtifact,
) -> AnalyticsResult<String> {
    let name = format!("{prefix}{}", artifact.file_name);
    writer.write(&name, &artifact.bytes, artifact.content_type).await
}

fn requested_charts(request: Option<Vec<ChartKind>>, settings: &PipelineSettings) -> Vec<ChartKind> {
    let requested = request
        .filter(|charts| !charts.is_empty())
        .unwrap_or_else(|| settings.charts.clone());

    let mut charts = Vec::with_capacity(requested.len());
    for kind in requested {
        if !charts.contains(&kind) {
            charts.push(kind);
        }
    }
    charts
}

/// One invocation: load, aggregate, render and write every requested chart.
///
/// Charts are independent. A chart that fails to render or write is reported
/// next to the ones that succeeded; only a failed load aborts the whole call.
pub async fn invoke(
    request: InvocationRequest,
    settings: &PipelineSettings,
    writer: &dyn ArtifactWriter,
) -> InvocationOutcome {
    let source = match request.records {
        Some(values) => DataSource::Inline(values),
        None => settings.source.clone(),
    };
    let strict = request.strict.unwrap_or(settings.strict);
    let charts = requested_charts(request.charts, settings);

    let dataset = match loader::load(&source, strict).await {
        Ok(dataset) => dataset,
        Err(e) => {
            error!(kind = e.kind(), "load failed: {e}");
            return InvocationOutcome::Aborted(e);
        }
    };
    let summary = aggregate::summarize(&dataset);

    let mut artifacts = Vec::new();
    let mut failures = Vec::new();

    if dataset.records.is_empty() {
        if settings.empty_policy == EmptyPolicy::Placeholder {
            let written = match render::render_placeholder() {
                Ok(artifact) => persist(writer, &settings.artifact_prefix, &artifact).await,
                Err(e) => Err(e),
            };
            match written {
                Ok(location) => artifacts.push(location),
                Err(e) => failures.push(ChartError {
                    chart: render::PLACEHOLDER_NAME.to_string(),
                    error: e,
                }),
            }
        } else {
            info!("no activity records, nothing to plot");
        }
        return InvocationOutcome::Completed {
            artifacts,
            failures,
            summary,
        };
    }

    for kind in charts {
        let aggregate = aggregate::aggregate(kind, &dataset.records);
        let written = match render::render(&aggregate) {
            Ok(artifact) => persist(writer, &settings.artifact_prefix, &artifact).await,
            Err(e) => Err(e),
        };

        match written {
            Ok(location) => artifacts.push(location),
            Err(e) => {
                warn!(chart = kind.name(), kind = e.kind(), "chart skipped: {e}");
                failures.push(ChartError {
                    chart: kind.name().to_string(),
                    error: e,
                });
            }
        }
    }

    info!(
        written = artifacts.len(),
        failed = failures.len(),
        destination = %writer.describe(),
        "invocation finished"
    );

    InvocationOutcome::Completed {
        artifacts,
        failures,
        summary,
    }
}
