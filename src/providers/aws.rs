//! CloudWatch metrics and Cost Explorer billing for AWS accounts.

use std::collections::{BTreeMap, HashMap};

use anyhow::Context;
use aws_sdk_cloudwatch::{
    primitives::DateTime as AwsDateTime,
    types::{Dimension, Statistic},
};
use aws_sdk_costexplorer::types::{
    DateInterval, Dimension as CostDimension, DimensionValues, Expression, Granularity,
    GroupDefinition, GroupDefinitionType, MetricValue, ResultByTime,
};
use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Value;
use tokio::runtime::Runtime;
use tracing::{debug, info};

use super::Provider;
use crate::{
    error::{PartialDataWarning, ProviderError},
    model::{CostRecord, DATE_FORMAT, DateRange, UsageRecord},
};

const PROVIDER: &str = "aws";
const DAY_SECONDS: i32 = 86_400;
const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

const USAGE_METRICS: &[&str] = &[
    "NumberOfMetricsIngested",
    "NumberOfLogsIngested",
    "NumberOfDashboards",
    "NumberOfAlarms",
    "EstimatedBillableSizeBytes",
    "IncomingBytes",
    "IncomingLogEvents",
    "CallCount",
    "ThrottleCount",
    "PutLogEvents.BytesIngested",
    "GetMetricData.DatapointsReturned",
];

const BYTE_METRICS: &[&str] = &[
    "EstimatedBillableSizeBytes",
    "IncomingBytes",
    "PutLogEvents.BytesIngested",
];

const CLOUDWATCH_SERVICES: &[&[&str]] = &[
    &["AmazonCloudWatch", "CloudWatch"],
    &["AmazonCloudWatchLogs", "CloudWatchLogs"],
    &["AmazonCloudWatchMetrics", "CloudWatchMetrics"],
];

const CLOUDWATCH_KEYWORDS: &[&str] = &["cloudwatch", "logs", "metrics"];

#[derive(Debug, Clone, Default)]
pub struct AwsSettings {
    pub region: Option<String>,
    pub profile: Option<String>,
}

pub struct AwsProvider {
    runtime: Runtime,
    cloudwatch: aws_sdk_cloudwatch::Client,
    cost_explorer: aws_sdk_costexplorer::Client,
    region: String,
}

impl AwsProvider {
    pub fn new(settings: &AwsSettings) -> Result<Self, ProviderError> {
        let region = settings
            .region
            .clone()
            .filter(|r| !r.trim().is_empty())
            .ok_or_else(|| {
                ProviderError::configuration(PROVIDER, "region is required (aws.region or AWS_REGION)")
            })?;

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| ProviderError::query(PROVIDER, "starting async runtime", e))?;

        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(region.clone()));
        if let Some(profile) = settings.profile.as_deref().filter(|p| !p.is_empty()) {
            loader = loader.profile_name(profile);
        }
        let config = runtime.block_on(loader.load());
        info!(region = %region, profile = ?settings.profile, "initialized AWS clients");

        Ok(AwsProvider {
            cloudwatch: aws_sdk_cloudwatch::Client::new(&config),
            cost_explorer: aws_sdk_costexplorer::Client::new(&config),
            runtime,
            region,
        })
    }

    async fn metric_statistics(
        &self,
        metric: &str,
        range: &DateRange,
    ) -> anyhow::Result<Vec<UsageRecord>> {
        let namespace = namespace_for(metric);
        let start = AwsDateTime::from_secs(day_start(range.start).timestamp());
        let end = AwsDateTime::from_secs(day_start(range.end_exclusive()).timestamp());

        let mut request = self
            .cloudwatch
            .get_metric_statistics()
            .namespace(namespace)
            .metric_name(metric)
            .start_time(start)
            .end_time(end)
            .period(DAY_SECONDS)
            .statistics(Statistic::Sum);
        if namespace == "AWS/Usage" {
            request = request.set_dimensions(Some(usage_dimensions()));
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("GetMetricStatistics {namespace}/{metric}"))?;

        let mut records = Vec::new();
        for datapoint in response.datapoints() {
            let secs = datapoint
                .timestamp()
                .map(|t| t.secs())
                .with_context(|| format!("datapoint for {metric} has no timestamp"))?;
            let timestamp = DateTime::<Utc>::from_timestamp(secs, 0)
                .with_context(|| format!("datapoint for {metric} has invalid timestamp {secs}"))?;
            let raw_unit = datapoint.unit().map(|u| u.as_str()).unwrap_or("Count");
            let (value, unit) = normalize_metric(metric, datapoint.sum().unwrap_or(0.0), raw_unit);

            let mut metadata = BTreeMap::new();
            metadata.insert("namespace".to_string(), Value::from(namespace));
            metadata.insert("region".to_string(), Value::from(self.region.as_str()));

            records.push(UsageRecord {
                service: "CloudWatch".to_string(),
                metric: metric.to_string(),
                value,
                unit,
                timestamp,
                metadata,
            });
        }
        Ok(records)
    }

    async fn cost_and_usage(
        &self,
        range: &DateRange,
        filter: Option<Expression>,
    ) -> Result<Vec<ResultByTime>, ProviderError> {
        let interval = DateInterval::builder()
            .start(range.start.format(DATE_FORMAT).to_string())
            .end(range.end_exclusive().format(DATE_FORMAT).to_string())
            .build()
            .map_err(|e| ProviderError::query(PROVIDER, "building Cost Explorer date interval", e))?;

        let mut results = Vec::new();
        let mut next_token: Option<String> = None;
        loop {
            let response = self
                .cost_explorer
                .get_cost_and_usage()
                .time_period(interval.clone())
                .granularity(Granularity::Daily)
                .metrics("UnblendedCost")
                .metrics("UsageQuantity")
                .group_by(dimension_group("SERVICE"))
                .group_by(dimension_group("LINKED_ACCOUNT"))
                .set_filter(filter.clone())
                .set_next_page_token(next_token.take())
                .send()
                .await
                .map_err(|e| ProviderError::query(PROVIDER, "GetCostAndUsage", e))?;

            results.extend(response.results_by_time().iter().cloned());
            match response.next_page_token() {
                Some(token) if !token.is_empty() => next_token = Some(token.to_string()),
                _ => break,
            }
        }
        debug!(periods = results.len(), "Cost Explorer returned result periods");
        Ok(results)
    }
}

impl Provider for AwsProvider {
    fn name(&self) -> &'static str {
        "AWS CloudWatch"
    }

    fn usage_data(&self, range: &DateRange) -> Result<Vec<UsageRecord>, ProviderError> {
        let mut records = Vec::new();
        for metric in USAGE_METRICS {
            match self.runtime.block_on(self.metric_statistics(metric, range)) {
                Ok(points) => records.extend(points),
                Err(err) => PartialDataWarning::new(PROVIDER, format!("metric {metric}"), err).emit(),
            }
        }
        Ok(records)
    }

    fn cost_data(&self, range: &DateRange) -> Result<Vec<CostRecord>, ProviderError> {
        let filtered = self
            .runtime
            .block_on(self.cost_and_usage(range, Some(cloudwatch_filter())))?;
        let records = cost_records(&filtered, &self.region, |_| true)?;
        if !records.is_empty() {
            return Ok(records);
        }

        info!("no CloudWatch services matched the service filter, retrying unfiltered");
        let unfiltered = self.runtime.block_on(self.cost_and_usage(range, None))?;
        cost_records(&unfiltered, &self.region, is_cloudwatch_service)
    }
}

fn namespace_for(metric: &str) -> &'static str {
    match metric {
        "EstimatedBillableSizeBytes" | "IncomingBytes" | "IncomingLogEvents" | "PutLogEvents.BytesIngested" => {
            "AWS/Logs"
        }
        "CallCount" | "ThrottleCount" => "AWS/Usage",
        _ => "AWS/CloudWatch",
    }
}

/// Byte-valued metrics are reported in gigabytes.
fn normalize_metric(metric: &str, value: f64, unit: &str) -> (f64, String) {
    if unit == "Bytes" || BYTE_METRICS.contains(&metric) {
        (value / BYTES_PER_GB, "GB".to_string())
    } else {
        (value, unit.to_string())
    }
}

/// `AWS/Usage` metrics are scoped to CloudWatch API calls.
fn usage_dimensions() -> Vec<Dimension> {
    vec![
        Dimension::builder().name("Service").value("CloudWatch").build(),
        Dimension::builder().name("Type").value("API").build(),
    ]
}

fn day_start(date: NaiveDate) -> DateTime<Utc> {
    date.and_time(chrono::NaiveTime::MIN).and_utc()
}

fn dimension_group(key: &str) -> GroupDefinition {
    GroupDefinition::builder()
        .r#type(GroupDefinitionType::Dimension)
        .key(key)
        .build()
}

fn cloudwatch_filter() -> Expression {
    let mut filter = Expression::builder();
    for names in CLOUDWATCH_SERVICES {
        let mut values = DimensionValues::builder().key(CostDimension::Service);
        for name in *names {
            values = values.values(*name);
        }
        filter = filter.or(Expression::builder().dimensions(values.build()).build());
    }
    filter.build()
}

fn is_cloudwatch_service(service: &str) -> bool {
    let lower = service.to_ascii_lowercase();
    CLOUDWATCH_KEYWORDS.iter().any(|k| lower.contains(k))
}

/// Usage unit and a short description guessed from the billed service name.
fn infer_usage_info(service: &str, usage: f64) -> (&'static str, &'static str) {
    let lower = service.to_ascii_lowercase();
    if lower.contains("logs") {
        if usage > 1000.0 {
            ("Events", "Log Events")
        } else {
            ("GB", "Log Data")
        }
    } else if lower.contains("metric") {
        ("MetricMonths", "Metrics Monitored")
    } else if lower.contains("dashboard") {
        ("DashboardMonths", "Dashboard Usage")
    } else if lower.contains("alarm") {
        ("AlarmMonths", "Alarm Monitoring")
    } else if lower.contains("api") {
        ("API-Requests", "API Calls")
    } else if usage > 1_000_000.0 {
        ("Count", "High Volume Events")
    } else if usage > 1000.0 {
        ("Count", "Medium Volume Events")
    } else if usage > 1.0 {
        ("GB", "Data Processing")
    } else {
        ("Units", "Standard Usage")
    }
}

fn cost_records(
    results: &[ResultByTime],
    region: &str,
    keep: impl Fn(&str) -> bool,
) -> Result<Vec<CostRecord>, ProviderError> {
    let mut records = Vec::new();
    for result in results {
        let period = result.time_period().ok_or_else(|| {
            ProviderError::decode(PROVIDER, "GetCostAndUsage", anyhow::anyhow!("result has no time period"))
        })?;
        let start_time = parse_period_date(period.start())?;
        let end_time = parse_period_date(period.end())?;

        for group in result.groups() {
            let (service, account_id) = match group.keys() {
                [service, account, ..] => (service.as_str(), account.as_str()),
                keys => {
                    return Err(ProviderError::decode(
                        PROVIDER,
                        "GetCostAndUsage group keys",
                        anyhow::anyhow!("expected service and account, got {keys:?}"),
                    ));
                }
            };
            if !keep(service) {
                continue;
            }
            records.push(cost_record(
                service,
                account_id,
                group.metrics(),
                start_time,
                end_time,
                region,
            )?);
        }
    }
    Ok(records)
}

fn cost_record(
    service: &str,
    account_id: &str,
    metrics: Option<&HashMap<String, MetricValue>>,
    start_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
    region: &str,
) -> Result<CostRecord, ProviderError> {
    let unblended = metrics.and_then(|m| m.get("UnblendedCost")).ok_or_else(|| {
        ProviderError::decode(
            PROVIDER,
            format!("UnblendedCost for {service}"),
            anyhow::anyhow!("metric missing from group"),
        )
    })?;
    let cost = parse_amount(unblended, service, "UnblendedCost")?;
    let quantity = match metrics.and_then(|m| m.get("UsageQuantity")) {
        Some(value) => parse_amount(value, service, "UsageQuantity")?,
        None => 0.0,
    };
    let (unit, description) = infer_usage_info(service, quantity);

    Ok(CostRecord {
        service: service.to_string(),
        item_name: format!("Account: {account_id}"),
        cost,
        currency: unblended.unit().unwrap_or("USD").to_string(),
        period: "Daily".to_string(),
        start_time,
        end_time,
        account_id: account_id.to_string(),
        region: Some(region.to_string()),
        quantity: Some(quantity),
        usage_unit: Some(unit.to_string()),
        description: Some(description.to_string()),
    })
}

fn parse_amount(value: &MetricValue, service: &str, metric: &str) -> Result<f64, ProviderError> {
    let raw = value.amount().unwrap_or("0");
    raw.parse::<f64>().map_err(|e| {
        ProviderError::decode(PROVIDER, format!("{metric} amount '{raw}' for {service}"), e)
    })
}

fn parse_period_date(raw: &str) -> Result<DateTime<Utc>, ProviderError> {
    NaiveDate::parse_from_str(raw, DATE_FORMAT)
        .map(day_start)
        .map_err(|e| ProviderError::decode(PROVIDER, format!("period date '{raw}'"), e))
}

#[cfg(test)]
mod tests {
    use aws_sdk_costexplorer::types::Group;

    use super::*;

    fn metric(amount: &str, unit: &str) -> MetricValue {
        MetricValue::builder().amount(amount).unit(unit).build()
    }

    fn group(service: &str, account: &str, cost: &str, quantity: &str) -> Group {
        Group::builder()
            .keys(service)
            .keys(account)
            .metrics("UnblendedCost", metric(cost, "USD"))
            .metrics("UsageQuantity", metric(quantity, "N/A"))
            .build()
    }

    fn day_result(start: &str, end: &str, groups: Vec<Group>) -> ResultByTime {
        ResultByTime::builder()
            .time_period(DateInterval::builder().start(start).end(end).build().unwrap())
            .set_groups(Some(groups))
            .build()
    }

    #[test]
    fn namespaces_follow_metric_family() {
        assert_eq!(namespace_for("IncomingBytes"), "AWS/Logs");
        assert_eq!(namespace_for("CallCount"), "AWS/Usage");
        assert_eq!(namespace_for("NumberOfAlarms"), "AWS/CloudWatch");
    }

    #[test]
    fn usage_namespace_is_scoped_to_cloudwatch_api_calls() {
        let dims: Vec<_> = usage_dimensions()
            .iter()
            .map(|d| (d.name().map(str::to_string), d.value().map(str::to_string)))
            .collect();
        assert_eq!(
            dims,
            [
                (Some("Service".to_string()), Some("CloudWatch".to_string())),
                (Some("Type".to_string()), Some("API".to_string())),
            ]
        );
    }

    #[test]
    fn byte_metrics_become_gigabytes() {
        let (value, unit) = normalize_metric("IncomingBytes", BYTES_PER_GB * 2.0, "None");
        assert_eq!((value, unit.as_str()), (2.0, "GB"));
        let (value, unit) = normalize_metric("CallCount", 12.0, "Count");
        assert_eq!((value, unit.as_str()), (12.0, "Count"));
    }

    #[test]
    fn usage_info_is_inferred_from_service_name() {
        assert_eq!(infer_usage_info("AmazonCloudWatchLogs", 5.0), ("GB", "Log Data"));
        assert_eq!(infer_usage_info("AmazonCloudWatchLogs", 5000.0), ("Events", "Log Events"));
        assert_eq!(infer_usage_info("CloudWatchMetrics", 1.0), ("MetricMonths", "Metrics Monitored"));
        assert_eq!(infer_usage_info("Dashboards", 1.0), ("DashboardMonths", "Dashboard Usage"));
        assert_eq!(infer_usage_info("AmazonCloudWatch", 2_000_000.0), ("Count", "High Volume Events"));
        assert_eq!(infer_usage_info("AmazonCloudWatch", 2_000.0), ("Count", "Medium Volume Events"));
        assert_eq!(infer_usage_info("AmazonCloudWatch", 2.0), ("GB", "Data Processing"));
        assert_eq!(infer_usage_info("AmazonCloudWatch", 0.5), ("Units", "Standard Usage"));
    }

    #[test]
    fn groups_become_daily_cost_records() {
        let results = vec![day_result(
            "2024-01-01",
            "2024-01-02",
            vec![group("AmazonCloudWatch", "111", "10.25", "3.5")],
        )];
        let records = cost_records(&results, "us-west-2", |_| true).unwrap();
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.account_id, "111");
        assert_eq!(record.item_name, "Account: 111");
        assert_eq!(record.cost, 10.25);
        assert_eq!(record.currency, "USD");
        assert_eq!(record.quantity, Some(3.5));
        assert_eq!(record.usage_unit.as_deref(), Some("GB"));
        assert_eq!(record.region.as_deref(), Some("us-west-2"));
        assert_eq!(record.start_time.format(DATE_FORMAT).to_string(), "2024-01-01");
    }

    #[test]
    fn unfiltered_results_keep_cloudwatch_services_only() {
        let results = vec![day_result(
            "2024-01-01",
            "2024-01-02",
            vec![
                group("Amazon Elastic Compute Cloud", "111", "50", "1"),
                group("AmazonCloudWatch", "111", "1", "1"),
                group("CloudWatch Logs", "222", "2", "1"),
            ],
        )];
        let records = cost_records(&results, "eu-west-1", is_cloudwatch_service).unwrap();
        let services: Vec<_> = records.iter().map(|r| r.service.as_str()).collect();
        assert_eq!(services, ["AmazonCloudWatch", "CloudWatch Logs"]);
    }

    #[test]
    fn malformed_groups_are_decode_errors() {
        let short = Group::builder()
            .keys("AmazonCloudWatch")
            .metrics("UnblendedCost", metric("1", "USD"))
            .build();
        let results = vec![day_result("2024-01-01", "2024-01-02", vec![short])];
        assert!(matches!(
            cost_records(&results, "r", |_| true),
            Err(ProviderError::Decode { .. })
        ));

        let results = vec![day_result(
            "2024-01-01",
            "2024-01-02",
            vec![group("AmazonCloudWatch", "111", "ten", "1")],
        )];
        assert!(matches!(
            cost_records(&results, "r", |_| true),
            Err(ProviderError::Decode { .. })
        ));
    }

    #[test]
    fn missing_region_is_a_configuration_error() {
        let err = match AwsProvider::new(&AwsSettings::default()) {
            Err(err) => err,
            Ok(_) => panic!("region should be required"),
        };
        assert!(matches!(err, ProviderError::Configuration { .. }));
    }
}
