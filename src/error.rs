use thiserror::Error;

/// Failures surfaced by one invocation of the plot pipeline.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum AnalyticsError {
    /// The configured source could not be reached or parsed.
    #[error("data unavailable: {0}")]
    DataUnavailable(String),

    /// A record failed validation under strict loading.
    #[error("invalid record: {0}")]
    Validation(String),

    /// The aggregate cannot be drawn as the requested chart.
    #[error("cannot render {chart}: {reason}")]
    Render { chart: String, reason: String },

    /// The destination refused or could not take the artifact.
    #[error("could not persist {name}: {reason}")]
    Persistence { name: String, reason: String },

    /// The request body could not be understood.
    #[error("bad request: {0}")]
    BadRequest(String),
}

impl AnalyticsError {
    pub fn kind(&self) -> &'static str {
        match self {
            AnalyticsError::DataUnavailable(_) => "DataUnavailable",
            AnalyticsError::Validation(_) => "ValidationError",
            AnalyticsError::Render { .. } => "RenderError",
            AnalyticsError::Persistence { .. } => "PersistenceError",
            AnalyticsError::BadRequest(_) => "BadRequest",
        }
    }

    pub fn render(chart: impl Into<String>, reason: impl ToString) -> Self {
        AnalyticsError::Render {
            chart: chart.into(),
            reason: reason.to_string(),
        }
    }

    pub fn persistence(name: impl Into<String>, reason: impl ToString) -> Self {
        AnalyticsError::Persistence {
            name: name.into(),
            reason: reason.to_string(),
        }
    }
}

pub type AnalyticsResult<T> = Result<T, AnalyticsError>;
