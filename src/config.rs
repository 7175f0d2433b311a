use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, ValueEnum};

use crate::loader::DataSource;
use crate::models::ChartKind;
use crate::storage::{ArtifactWriter, GcsWriter, LocalDirWriter, TokenSource, METADATA_TOKEN_URL};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SourceKind {
    Csv,
    Url,
    Postgres,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DestinationKind {
    Local,
    Gcs,
}

/// What to do when the loaded dataset has no records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum EmptyPolicy {
    /// Succeed without writing anything.
    #[default]
    Skip,
    /// Write a single "no data" chart.
    Placeholder,
}

/// Settings shared by `serve` and `run`, read from flags or the environment.
#[derive(Debug, Clone, Args)]
pub struct PipelineArgs {
    #[arg(long, env = "DATA_SOURCE", value_enum, default_value = "csv")]
    pub source: SourceKind,
    #[arg(long, env = "VOLUNTEER_CSV_PATH", default_value = "volunteer_hours.csv")]
    pub csv_path: PathBuf,
    #[arg(long, env = "SHEET_CSV_URL")]
    pub source_url: Option<String>,
    #[arg(long, env = "SOURCE_BEARER_TOKEN", hide_env_values = true)]
    pub source_token: Option<String>,
    /// Authorize the sheet export with the runtime service account.
    #[arg(long, env = "SOURCE_USE_METADATA_TOKEN", conflicts_with = "source_token")]
    pub source_metadata_token: bool,
    #[arg(long, env = "DATABASE_URL", hide_env_values = true)]
    pub database_url: Option<String>,

    #[arg(long, env = "ARTIFACT_DESTINATION", value_enum, default_value = "local")]
    pub destination: DestinationKind,
    #[arg(long, env = "OUTPUT_DIR", default_value = "plots")]
    pub output_dir: PathBuf,
    #[arg(long, env = "BUCKET_NAME", default_value = "volunteer_hours")]
    pub bucket: String,
    #[arg(long, env = "GCS_ENDPOINT", default_value = "https://storage.googleapis.com")]
    pub gcs_endpoint: String,
    #[arg(long, env = "GCS_ACCESS_TOKEN", hide_env_values = true)]
    pub gcs_token: Option<String>,
    #[arg(long, env = "ARTIFACT_PREFIX", default_value = "")]
    pub artifact_prefix: String,

    #[arg(
        long,
        env = "CHARTS",
        value_enum,
        value_delimiter = ',',
        default_values_t = [ChartKind::CumulativeHours, ChartKind::HoursByDate]
    )]
    pub charts: Vec<ChartKind>,
    #[arg(long, env = "STRICT_VALIDATION")]
    pub strict: bool,
    #[arg(long, env = "EMPTY_DATA_POLICY", value_enum, default_value = "skip")]
    pub empty_policy: EmptyPolicy,
}

/// Immutable per-deployment settings handed to every invocation.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub source: DataSource,
    pub charts: Vec<ChartKind>,
    pub strict: bool,
    pub empty_policy: EmptyPolicy,
    pub artifact_prefix: String,
}

impl PipelineArgs {
    pub fn settings(&self) -> anyhow::Result<PipelineSettings> {
        let source = match self.source {
            SourceKind::Csv => DataSource::Csv(self.csv_path.clone()),
            SourceKind::Url => DataSource::Url {
                url: self
                    .source_url
                    .clone()
                    .context("SHEET_CSV_URL must be set when DATA_SOURCE=url")?,
                token: self.source_token_source(),
            },
            SourceKind::Postgres => DataSource::Postgres {
                database_url: self
                    .database_url
                    .clone()
                    .context("DATABASE_URL must be set when DATA_SOURCE=postgres")?,
            },
        };

        anyhow::ensure!(!self.charts.is_empty(), "at least one chart must be requested");

        Ok(PipelineSettings {
            source,
            charts: self.charts.clone(),
            strict: self.strict,
            empty_policy: self.empty_policy,
            artifact_prefix: self.artifact_prefix.clone(),
        })
    }

    fn source_token_source(&self) -> Option<TokenSource> {
        match &self.source_token {
            Some(token) => Some(TokenSource::Static(token.clone())),
            None if self.source_metadata_token => {
                Some(TokenSource::MetadataServer(METADATA_TOKEN_URL.to_string()))
            }
            None => None,
        }
    }

    pub fn writer(&self) -> Arc<dyn ArtifactWriter> {
        match self.destination {
            DestinationKind::Local => Arc::new(LocalDirWriter::new(self.output_dir.clone())),
            DestinationKind::Gcs => {
                let token = match &self.gcs_token {
                    Some(token) => TokenSource::Static(token.clone()),
                    None => TokenSource::MetadataServer(METADATA_TOKEN_URL.to_string()),
                };
                Arc::new(GcsWriter::new(&self.gcs_endpoint, &self.bucket, token))
            }
        }
    }
}
