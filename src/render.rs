//! Turns a [`Report`] into one of the supported output encodings.

use std::{collections::BTreeMap, fmt, io::Write, str::FromStr};

use chrono::DateTime;
use chrono_tz::Tz;
use colored::Colorize;
use serde::Serialize;
use tracing::debug;

use crate::{
    aggregate::{AccountBreakdown, CostBreakdown, CurrencyTotals},
    error::ReportError,
    model::{CostRecord, DATE_FORMAT, Report, UsageRecord},
    table::{SimpleTable, truncate_str},
};

const DESCRIPTION_WIDTH: usize = 33;
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    Table,
    Summary,
    Json,
    Csv,
}

impl FromStr for OutputFormat {
    type Err = ReportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "table" => Ok(OutputFormat::Table),
            "summary" => Ok(OutputFormat::Summary),
            "json" => Ok(OutputFormat::Json),
            "csv" => Ok(OutputFormat::Csv),
            _ => Err(ReportError::UnsupportedOutputFormat(s.to_string())),
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OutputFormat::Table => "table",
            OutputFormat::Summary => "summary",
            OutputFormat::Json => "json",
            OutputFormat::Csv => "csv",
        };
        f.write_str(name)
    }
}

/// Renders reports; usage timestamps are shown in `tz`.
pub struct Renderer {
    tz: Tz,
}

impl Renderer {
    pub fn new(tz: Tz) -> Self {
        Renderer { tz }
    }

    pub fn render(
        &self,
        report: &Report,
        format: OutputFormat,
        sink: &mut dyn Write,
    ) -> Result<(), ReportError> {
        let breakdown = CostBreakdown::from_records(&report.costs);
        debug!(
            %format,
            accounts = breakdown.accounts.len(),
            records = breakdown.record_count(),
            "rendering report"
        );
        match format {
            OutputFormat::Table => self.write_table(report, &breakdown, sink)?,
            OutputFormat::Summary => self.write_summary(report, &breakdown, sink)?,
            OutputFormat::Json => write_json(report, &breakdown, sink)?,
            OutputFormat::Csv => write_csv(report, sink)?,
        }
        sink.flush()?;
        Ok(())
    }

    fn local_time(&self, ts: &DateTime<chrono::Utc>) -> String {
        ts.with_timezone(&self.tz).format(TIMESTAMP_FORMAT).to_string()
    }

    fn write_table(
        &self,
        report: &Report,
        breakdown: &CostBreakdown<'_>,
        w: &mut dyn Write,
    ) -> Result<(), ReportError> {
        write_header(report, w)?;

        if report.kind.includes_usage() {
            writeln!(w, "{}", "Usage Data".bold())?;
            let mut table = SimpleTable::new(vec!["Service", "Metric", "Value", "Unit", "Timestamp"])
                .header_style(|s| s.cyan().bold());
            for usage in &report.usage {
                table.add_row(vec![
                    usage.service.clone(),
                    usage.metric.clone(),
                    format!("{:.4}", usage.value),
                    usage.unit.clone(),
                    self.local_time(&usage.timestamp),
                ]);
            }
            table.write_to(w)?;
            writeln!(w)?;
        }

        if report.kind.includes_cost() {
            writeln!(w, "{}", "Account Cost Summary".bold())?;
            let mut summary = SimpleTable::new(vec!["Account ID", "Total Cost", "Currency"])
                .header_style(|s| s.cyan().bold());
            for account in &breakdown.accounts {
                for (cost, currency) in currency_rows(account.cost, &account.currencies) {
                    summary.add_row(vec![account.account_id.clone(), format_cost(cost), currency]);
                }
            }
            for (cost, currency) in currency_rows(breakdown.grand_total, &breakdown.currencies) {
                summary.add_footer(vec![
                    "TOTAL".yellow().bold().to_string(),
                    format_cost(cost).yellow().to_string(),
                    currency.yellow().to_string(),
                ]);
            }
            summary.write_to(w)?;
            writeln!(w)?;

            if !breakdown.accounts.is_empty() {
                writeln!(w, "{}", "Detailed Cost Breakdown by Account".bold())?;
            }
            for account in &breakdown.accounts {
                self.write_account_table(account, w)?;
            }
        }

        write_custom_sections(report, w)
    }

    fn write_account_table(
        &self,
        account: &AccountBreakdown<'_>,
        w: &mut dyn Write,
    ) -> Result<(), ReportError> {
        writeln!(w, "Account ID: {}", account.account_id)?;
        let mut table = SimpleTable::new(vec!["Date", "Service", "Cost", "Usage", "Description"])
            .header_style(|s| s.cyan().bold());

        for (i, day) in account.days.iter().enumerate() {
            let date = day.date.format(DATE_FORMAT).to_string();
            for record in &day.records {
                table.add_row(vec![
                    date.clone(),
                    record.service.clone(),
                    format!("{} {}", format_cost(record.cost), record.currency),
                    format_quantity(record),
                    truncate_str(record.description.as_deref().unwrap_or(""), DESCRIPTION_WIDTH),
                ]);
            }
            for (cost, currency) in currency_rows(day.cost, &day.currencies) {
                table.add_row(vec![
                    date.clone(),
                    "DAILY TOTAL".bold().to_string(),
                    format!("{} {}", format_cost(cost), currency).bold().to_string(),
                    format!("{:.2}", day.quantity),
                    String::new(),
                ]);
            }
            if i + 1 < account.days.len() {
                table.add_separator();
            }
        }

        for (cost, currency) in currency_rows(account.cost, &account.currencies) {
            table.add_footer(vec![
                String::new(),
                "ACCOUNT TOTAL".yellow().bold().to_string(),
                format!("{} {}", format_cost(cost), currency).yellow().to_string(),
                format!("{:.2}", account.quantity).yellow().to_string(),
                String::new(),
            ]);
        }
        table.write_to(w)?;
        writeln!(w)?;
        Ok(())
    }

    fn write_summary(
        &self,
        report: &Report,
        breakdown: &CostBreakdown<'_>,
        w: &mut dyn Write,
    ) -> Result<(), ReportError> {
        write_header(report, w)?;

        if report.kind.includes_usage() {
            writeln!(w, "=== Usage Data ===")?;
            writeln!(
                w,
                "{:<20} {:<32} {:>14} {:<10} {:<19}",
                "SERVICE", "METRIC", "VALUE", "UNIT", "TIMESTAMP"
            )?;
            writeln!(w, "{}", "-".repeat(99))?;
            for usage in &report.usage {
                writeln!(
                    w,
                    "{:<20} {:<32} {:>14.4} {:<10} {:<19}",
                    usage.service,
                    usage.metric,
                    usage.value,
                    usage.unit,
                    self.local_time(&usage.timestamp)
                )?;
            }
            writeln!(w)?;
        }

        if report.kind.includes_cost() {
            writeln!(w, "=== Account Cost Summary ===")?;
            writeln!(w, "{:<16} {:>16} {:<10}", "ACCOUNT ID", "TOTAL COST", "CURRENCY")?;
            writeln!(w, "{}", "-".repeat(44))?;
            for account in &breakdown.accounts {
                for (cost, currency) in currency_rows(account.cost, &account.currencies) {
                    writeln!(
                        w,
                        "{:<16} {:>16} {:<10}",
                        account.account_id,
                        format_cost(cost),
                        currency
                    )?;
                }
            }
            writeln!(w, "{}", "-".repeat(44))?;
            for (cost, currency) in currency_rows(breakdown.grand_total, &breakdown.currencies) {
                writeln!(w, "{:<16} {:>16} {:<10}", "TOTAL", format_cost(cost), currency)?;
            }
            writeln!(w)?;

            for account in &breakdown.accounts {
                writeln!(w, "=== Account: {} ===", account.account_id)?;
                writeln!(
                    w,
                    "{:<12} {:<24} {:>18} {:>16} {:<33}",
                    "DATE", "SERVICE", "COST", "USAGE", "DESCRIPTION"
                )?;
                writeln!(w, "{}", "-".repeat(107))?;
                for day in &account.days {
                    let date = day.date.format(DATE_FORMAT).to_string();
                    for record in &day.records {
                        writeln!(
                            w,
                            "{:<12} {:<24} {:>18} {:>16} {:<33}",
                            date,
                            record.service,
                            format!("{} {}", format_cost(record.cost), record.currency),
                            format_quantity(record),
                            truncate_str(record.description.as_deref().unwrap_or(""), DESCRIPTION_WIDTH)
                        )?;
                    }
                    for (cost, currency) in currency_rows(day.cost, &day.currencies) {
                        writeln!(
                            w,
                            "{:<12} {:<24} {:>18} {:>16.2}",
                            date,
                            "DAILY TOTAL",
                            format!("{} {}", format_cost(cost), currency),
                            day.quantity
                        )?;
                    }
                    writeln!(w, "{}", "-".repeat(107))?;
                }
                for (cost, currency) in currency_rows(account.cost, &account.currencies) {
                    writeln!(
                        w,
                        "{:<12} {:<24} {:>18} {:>16.2}",
                        "",
                        "ACCOUNT TOTAL",
                        format!("{} {}", format_cost(cost), currency),
                        account.quantity
                    )?;
                }
                writeln!(w)?;
            }
        }

        write_custom_sections(report, w)
    }
}

fn write_csv(report: &Report, sink: &mut dyn Write) -> Result<(), ReportError> {
    let mut writer = csv::Writer::from_writer(sink);
    for usage in &report.usage {
        writer.serialize(CsvRow::from_usage(usage))?;
    }
    for cost in &report.costs {
        writer.serialize(CsvRow::from_cost(cost))?;
    }
    if report.usage.is_empty() && report.costs.is_empty() {
        writer.write_record(CsvRow::HEADERS)?;
    }
    writer.flush()?;
    Ok(())
}

fn write_header(report: &Report, w: &mut dyn Write) -> Result<(), ReportError> {
    writeln!(w, "Report for {}", report.provider_name)?;
    writeln!(
        w,
        "Period: {} to {}",
        report.range.start.format(DATE_FORMAT),
        report.range.end.format(DATE_FORMAT)
    )?;
    writeln!(w, "Report Type: {}", report.kind)?;
    writeln!(w, "Usage data entries: {}", report.usage.len())?;
    writeln!(w, "Cost data entries: {}", report.costs.len())?;
    writeln!(w)?;
    Ok(())
}

fn write_custom_sections(report: &Report, w: &mut dyn Write) -> Result<(), ReportError> {
    for (title, body) in report.custom_sections() {
        writeln!(w, "=== {title} ===")?;
        writeln!(w)?;
        writeln!(w, "{}", body.trim_end())?;
        writeln!(w)?;
    }
    Ok(())
}

/// One row per currency, or a single row carrying the plain total when uniform.
fn currency_rows(total: f64, currencies: &CurrencyTotals) -> Vec<(f64, String)> {
    if currencies.is_mixed() {
        currencies
            .iter()
            .map(|(currency, amount)| (amount, currency.to_string()))
            .collect()
    } else {
        vec![(total, currencies.label().unwrap_or("").to_string())]
    }
}

fn format_cost(value: f64) -> String {
    format!("{value:.4}")
}

fn format_quantity(record: &CostRecord) -> String {
    let quantity = record.quantity.unwrap_or(0.0);
    match record.usage_unit.as_deref() {
        Some(unit) if !unit.is_empty() => format!("{quantity:.2} {unit}"),
        _ => format!("{quantity:.2}"),
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct JsonReport<'a> {
    provider: &'a str,
    report_type: &'static str,
    start_date: String,
    end_date: String,
    usage_data: &'a [UsageRecord],
    cost_data: &'a [CostRecord],
    custom_sections: &'a BTreeMap<String, String>,
    summary: JsonSummary,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct JsonSummary {
    usage_data_entries: usize,
    cost_data_entries: usize,
    accounts: Vec<JsonAccount>,
    total_cost: f64,
    currency: Option<String>,
    currency_totals: BTreeMap<String, f64>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct JsonAccount {
    account_id: String,
    cost: f64,
    currency: Option<String>,
    currency_totals: BTreeMap<String, f64>,
}

fn write_json(
    report: &Report,
    breakdown: &CostBreakdown<'_>,
    w: &mut dyn Write,
) -> Result<(), ReportError> {
    let accounts = breakdown
        .accounts
        .iter()
        .map(|a| JsonAccount {
            account_id: a.account_id.clone(),
            cost: a.cost,
            currency: a.currencies.label().map(str::to_string),
            currency_totals: a.currencies.as_map().clone(),
        })
        .collect();

    let doc = JsonReport {
        provider: &report.provider_name,
        report_type: report.kind.as_str(),
        start_date: report.range.start.format(DATE_FORMAT).to_string(),
        end_date: report.range.end.format(DATE_FORMAT).to_string(),
        usage_data: &report.usage,
        cost_data: &report.costs,
        custom_sections: report.custom_sections(),
        summary: JsonSummary {
            usage_data_entries: report.usage.len(),
            cost_data_entries: report.costs.len(),
            accounts,
            total_cost: report.total_cost,
            currency: breakdown.currencies.label().map(str::to_string),
            currency_totals: breakdown.currencies.as_map().clone(),
        },
    };

    serde_json::to_writer_pretty(&mut *w, &doc)?;
    writeln!(w)?;
    Ok(())
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CsvRow<'a> {
    record_type: &'static str,
    service: &'a str,
    name: &'a str,
    amount: f64,
    unit: &'a str,
    currency: &'a str,
    account_id: &'a str,
    region: &'a str,
    date: String,
    start_time: String,
    end_time: String,
    description: &'a str,
}

impl<'a> CsvRow<'a> {
    const HEADERS: [&'static str; 12] = [
        "recordType",
        "service",
        "name",
        "amount",
        "unit",
        "currency",
        "accountId",
        "region",
        "date",
        "startTime",
        "endTime",
        "description",
    ];

    fn from_usage(usage: &'a UsageRecord) -> Self {
        CsvRow {
            record_type: "usage",
            service: &usage.service,
            name: &usage.metric,
            amount: usage.value,
            unit: &usage.unit,
            currency: "",
            account_id: usage
                .metadata
                .get("accountId")
                .and_then(|v| v.as_str())
                .unwrap_or(""),
            region: "",
            date: usage.timestamp.format(DATE_FORMAT).to_string(),
            start_time: usage.timestamp.to_rfc3339(),
            end_time: String::new(),
            description: "",
        }
    }

    fn from_cost(cost: &'a CostRecord) -> Self {
        CsvRow {
            record_type: "cost",
            service: &cost.service,
            name: &cost.item_name,
            amount: cost.cost,
            unit: cost.usage_unit.as_deref().unwrap_or(""),
            currency: &cost.currency,
            account_id: &cost.account_id,
            region: cost.region.as_deref().unwrap_or(""),
            date: cost.billing_day().format(DATE_FORMAT).to_string(),
            start_time: cost.start_time.to_rfc3339(),
            end_time: cost.end_time.to_rfc3339(),
            description: cost.description.as_deref().unwrap_or(""),
        }
    }
}
