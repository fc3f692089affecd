//! Vendor integrations behind one capability trait.
//!
//! Adapters normalize whatever their vendor returns into [`UsageRecord`] and
//! [`CostRecord`]; everything downstream only sees this module's surface.

pub mod aws;
pub mod file;
pub mod newrelic;

use tracing::{debug, info};

use crate::{
    error::{PartialDataWarning, ProviderError, ReportError},
    model::{CostRecord, DateRange, Report, ReportKind, UsageRecord},
};

pub trait Provider {
    /// Human-readable name printed in report headers.
    fn name(&self) -> &'static str;

    fn usage_data(&self, range: &DateRange) -> Result<Vec<UsageRecord>, ProviderError>;

    fn cost_data(&self, range: &DateRange) -> Result<Vec<CostRecord>, ProviderError>;

    /// Supplementary free-text sections as `(title, body)` pairs.
    fn custom_sections(&self, _range: &DateRange) -> Result<Vec<(String, String)>, ProviderError> {
        Ok(Vec::new())
    }
}

/// Everything an adapter may need to construct itself.
#[derive(Debug, Clone, Default)]
pub struct ProviderSettings {
    pub aws: aws::AwsSettings,
    pub newrelic: newrelic::NewRelicSettings,
    pub file: file::FileSettings,
}

type Factory = fn(&ProviderSettings) -> Result<Box<dyn Provider>, ProviderError>;

struct CatalogEntry {
    key: &'static str,
    description: &'static str,
    factory: Factory,
}

/// Name → constructor table handed to the command driver.
pub struct ProviderCatalog {
    entries: Vec<CatalogEntry>,
}

impl ProviderCatalog {
    pub fn builtin() -> Self {
        ProviderCatalog {
            entries: vec![
                CatalogEntry {
                    key: "aws",
                    description: "AWS CloudWatch metrics and Cost Explorer billing",
                    factory: |s| Ok(Box::new(aws::AwsProvider::new(&s.aws)?)),
                },
                CatalogEntry {
                    key: "newrelic",
                    description: "New Relic NerdGraph usage, consumption and licenses",
                    factory: |s| Ok(Box::new(newrelic::NewRelicProvider::new(&s.newrelic)?)),
                },
                CatalogEntry {
                    key: "file",
                    description: "Saved usage and cost records from local JSONL files",
                    factory: |s| Ok(Box::new(file::FileProvider::new(&s.file)?)),
                },
            ],
        }
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.entries.iter().map(|e| e.key).collect()
    }

    pub fn describe(&self) -> impl Iterator<Item = (&'static str, &'static str)> + '_ {
        self.entries.iter().map(|e| (e.key, e.description))
    }

    pub fn create(
        &self,
        name: &str,
        settings: &ProviderSettings,
    ) -> Result<Box<dyn Provider>, ProviderError> {
        let wanted = name.trim().to_ascii_lowercase();
        let entry = self
            .entries
            .iter()
            .find(|e| e.key == wanted)
            .ok_or_else(|| ProviderError::UnknownProvider {
                name: name.to_string(),
                available: self.names().join(", "),
            })?;
        debug!(provider = entry.key, "constructing provider");
        (entry.factory)(settings)
    }
}

/// Fetch what `kind` asks for, then assemble the report.
///
/// Usage is fetched before cost. Custom sections are secondary: their failure
/// is logged as a partial-data warning and the report is still returned.
pub fn generate_report(
    provider: &dyn Provider,
    kind: ReportKind,
    range: DateRange,
) -> Result<Report, ReportError> {
    let usage = if kind.includes_usage() {
        let usage = provider
            .usage_data(&range)
            .map_err(|source| ReportError::Provider { what: "usage", source })?;
        info!(provider = provider.name(), records = usage.len(), "fetched usage data");
        usage
    } else {
        Vec::new()
    };

    let costs = if kind.includes_cost() {
        let costs = provider
            .cost_data(&range)
            .map_err(|source| ReportError::Provider { what: "cost", source })?;
        info!(provider = provider.name(), records = costs.len(), "fetched cost data");
        costs
    } else {
        Vec::new()
    };

    let mut report = Report::build(provider.name(), kind, range, usage, costs);

    match provider.custom_sections(&range) {
        Ok(sections) => {
            for (title, body) in sections {
                report.append_custom_section(title, body);
            }
        }
        Err(err) => PartialDataWarning::new(provider.name(), "custom report sections", err).emit(),
    }

    Ok(report)
}
