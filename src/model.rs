use std::{collections::BTreeMap, fmt, str::FromStr};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ReportError;

pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// One observed usage data point reported by a provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageRecord {
    pub service: String,
    pub metric: String,
    pub value: f64,
    pub unit: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
}

/// One billed line item for one account and period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CostRecord {
    pub service: String,
    pub item_name: String,
    pub cost: f64,
    pub currency: String,
    pub period: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub account_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantity: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage_unit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl CostRecord {
    /// Calendar day the charge is billed on.
    ///
    /// Vendors label billing periods with plain dates, stored as midnight UTC,
    /// so the day is read in UTC regardless of the display timezone.
    pub fn billing_day(&self) -> NaiveDate {
        self.start_time.date_naive()
    }
}

/// Inclusive calendar range a report covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> anyhow::Result<Self> {
        if start > end {
            anyhow::bail!(
                "start date {} is after end date {}",
                start.format(DATE_FORMAT),
                end.format(DATE_FORMAT)
            );
        }
        Ok(DateRange { start, end })
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.start && date <= self.end
    }

    /// First instant after the range, for vendor APIs with exclusive end bounds.
    pub fn end_exclusive(&self) -> NaiveDate {
        self.end.succ_opt().unwrap_or(self.end)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ReportKind {
    Usage,
    Cost,
    Full,
}

impl ReportKind {
    pub fn includes_usage(self) -> bool {
        matches!(self, ReportKind::Usage | ReportKind::Full)
    }

    pub fn includes_cost(self) -> bool {
        matches!(self, ReportKind::Cost | ReportKind::Full)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ReportKind::Usage => "usage",
            ReportKind::Cost => "cost",
            ReportKind::Full => "full",
        }
    }
}

impl fmt::Display for ReportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReportKind {
    type Err = ReportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "usage" => Ok(ReportKind::Usage),
            "cost" => Ok(ReportKind::Cost),
            "full" => Ok(ReportKind::Full),
            _ => Err(ReportError::UnsupportedReportType(s.to_string())),
        }
    }
}

/// The aggregated result of a single report run.
#[derive(Debug, Clone)]
pub struct Report {
    pub provider_name: String,
    pub kind: ReportKind,
    pub range: DateRange,
    pub usage: Vec<UsageRecord>,
    pub costs: Vec<CostRecord>,
    pub total_cost: f64,
    custom_sections: BTreeMap<String, String>,
}

impl Report {
    /// Assemble a report from already-fetched records.
    ///
    /// Records the kind does not ask for are dropped, usage is ordered by
    /// timestamp and `total_cost` is the sum over every cost record kept.
    pub fn build(
        provider_name: impl Into<String>,
        kind: ReportKind,
        range: DateRange,
        usage: Vec<UsageRecord>,
        costs: Vec<CostRecord>,
    ) -> Self {
        let mut usage = if kind.includes_usage() { usage } else { Vec::new() };
        usage.sort_by_key(|u| u.timestamp);
        let costs = if kind.includes_cost() { costs } else { Vec::new() };
        let total_cost = costs.iter().map(|c| c.cost).sum();

        Report {
            provider_name: provider_name.into(),
            kind,
            range,
            usage,
            costs,
            total_cost,
            custom_sections: BTreeMap::new(),
        }
    }

    pub fn append_custom_section(&mut self, title: impl Into<String>, body: impl Into<String>) {
        self.custom_sections.insert(title.into(), body.into());
    }

    pub fn custom_sections(&self) -> &BTreeMap<String, String> {
        &self.custom_sections
    }
}
