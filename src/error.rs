use std::fmt;

use thiserror::Error;

/// Failures raised by a provider adapter while talking to its vendor.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("{provider}: {context}")]
    Query {
        provider: &'static str,
        context: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("{provider}: unexpected response shape for {context}")]
    Decode {
        provider: &'static str,
        context: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("{provider} is not configured: {message}")]
    Configuration {
        provider: &'static str,
        message: String,
    },

    #[error("unknown provider '{name}' (available: {available})")]
    UnknownProvider { name: String, available: String },
}

impl ProviderError {
    pub fn query(
        provider: &'static str,
        context: impl Into<String>,
        source: impl Into<anyhow::Error>,
    ) -> Self {
        ProviderError::Query {
            provider,
            context: context.into(),
            source: source.into(),
        }
    }

    pub fn decode(
        provider: &'static str,
        context: impl Into<String>,
        source: impl Into<anyhow::Error>,
    ) -> Self {
        ProviderError::Decode {
            provider,
            context: context.into(),
            source: source.into(),
        }
    }

    pub fn configuration(provider: &'static str, message: impl Into<String>) -> Self {
        ProviderError::Configuration {
            provider,
            message: message.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("failed to fetch {what} data")]
    Provider {
        what: &'static str,
        #[source]
        source: ProviderError,
    },

    #[error("unsupported report type: {0} (expected usage, cost or full)")]
    UnsupportedReportType(String),

    #[error("unsupported output format: {0} (expected table, summary, json or csv)")]
    UnsupportedOutputFormat(String),

    #[error("writing report output")]
    Io(#[from] std::io::Error),

    #[error("encoding report as JSON")]
    Json(#[from] serde_json::Error),

    #[error("encoding report as CSV")]
    Csv(#[from] csv::Error),
}

/// A secondary data source failed while the primary one succeeded.
///
/// Never fatal: the caller keeps what it has and emits this as a warning.
#[derive(Debug)]
pub struct PartialDataWarning {
    pub provider: &'static str,
    pub source_name: String,
    pub cause: String,
}

impl PartialDataWarning {
    pub fn new(provider: &'static str, source_name: impl Into<String>, cause: impl fmt::Display) -> Self {
        PartialDataWarning {
            provider,
            source_name: source_name.into(),
            cause: format!("{cause:#}"),
        }
    }

    pub fn emit(self) {
        tracing::warn!(
            provider = self.provider,
            source = %self.source_name,
            "{}",
            self
        );
    }
}

impl fmt::Display for PartialDataWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "partial data: {} unavailable, continuing without it ({})",
            self.source_name, self.cause
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_errors_keep_their_cause() {
        let err = ProviderError::query("aws", "GetCostAndUsage", anyhow::anyhow!("throttled"));
        assert_eq!(err.to_string(), "aws: GetCostAndUsage");
        let chain = format!("{:#}", anyhow::Error::new(err));
        assert!(chain.contains("throttled"));
    }

    #[test]
    fn partial_warning_mentions_source() {
        let warning = PartialDataWarning::new("newrelic", "license usage", "403 Forbidden");
        let text = warning.to_string();
        assert!(text.contains("license usage"));
        assert!(text.contains("403 Forbidden"));
    }
}
