use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, anyhow};
use chrono::{Months, NaiveDate};
use chrono_tz::Tz;
use directories::ProjectDirs;
use jsonschema::{Draft, JSONSchema};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::model::DATE_FORMAT;

pub const LOCAL_CONFIG_NAME: &str = "observability-cost-center.yaml";
const HOME_CONFIG_NAME: &str = ".observability-cost-center.yaml";

pub const DEFAULT_CONFIG: &str = r#"# observability-cost-center configuration
#
# Command-line flags and environment variables take precedence over this file.

# Provider queried when --provider is not given: aws, newrelic or file.
provider: aws

# Timezone for usage timestamps and the default end date.
timezone: UTC

output:
  # table, summary, json or csv
  format: table
  # file: report.json

report:
  # usage, cost or full
  type: full
  # Users idle for longer than this are counted as reclaimable licenses.
  inactive_days: 30

aws:
  region: us-east-1
  # profile: default

newrelic:
  # api_key: NRAK-XXXXXXXXXXXXXXXXXXXXXXXXXX   (or NEW_RELIC_API_KEY)
  # account_id: 1234567
  region: us

file:
  data_dirs: []
"#;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub provider: Option<String>,
    pub timezone: Option<String>,
    pub output: OutputConfig,
    pub report: ReportConfig,
    pub aws: AwsConfig,
    pub newrelic: NewRelicConfig,
    pub file: FileSourceConfig,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub format: Option<String>,
    pub file: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ReportConfig {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub inactive_days: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct AwsConfig {
    pub region: Option<String>,
    pub profile: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct NewRelicConfig {
    pub api_key: Option<String>,
    pub account_id: Option<i64>,
    pub region: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct FileSourceConfig {
    pub data_dirs: Vec<PathBuf>,
}

/// Candidate config locations, most specific first.
fn config_candidates() -> Vec<PathBuf> {
    let mut candidates = vec![PathBuf::from(LOCAL_CONFIG_NAME)];
    if let Some(dirs) = ProjectDirs::from("io", "observability", "observability-cost-center") {
        candidates.push(dirs.config_dir().join("config.yaml"));
    }
    if let Some(home) = home_dir() {
        candidates.push(home.join(HOME_CONFIG_NAME));
    }
    candidates
}

pub fn load_config(path: Option<&Path>) -> Result<FileConfig> {
    let candidate = match path {
        Some(p) => Some(p.to_path_buf()),
        None => config_candidates().into_iter().find(|p| p.exists()),
    };

    let Some(path) = candidate else {
        debug!("no config file found, using defaults");
        return Ok(FileConfig::default());
    };

    debug!(path = %path.display(), "loading config file");
    let content = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    parse_config(&content).with_context(|| format!("Invalid config file {}", path.display()))
}

fn parse_config(content: &str) -> Result<FileConfig> {
    let value: Value = serde_yaml::from_str(content).context("parsing YAML")?;
    if value.is_null() {
        return Ok(FileConfig::default());
    }
    validate_config(&value)?;
    serde_json::from_value(value).context("deserializing settings")
}

fn validate_config(value: &Value) -> Result<()> {
    let schema_value: Value = serde_json::from_str(include_str!("../config-schema.json"))
        .context("parsing config schema")?;
    let schema = JSONSchema::options()
        .with_draft(Draft::Draft7)
        .compile(&schema_value)
        .map_err(|e| anyhow!("compiling config schema: {e}"))?;

    if let Err(errors) = schema.validate(value) {
        let mut msg = String::from("Config validation failed:\n");
        for err in errors {
            msg.push_str(&format!(" - {} at {}\n", err, err.instance_path));
        }
        anyhow::bail!(msg.trim_end().to_string());
    }
    Ok(())
}

/// Write the commented default config, never replacing an existing file.
pub fn generate_config(path: &Path) -> Result<()> {
    if path.exists() {
        anyhow::bail!("config file {} already exists; not overwriting", path.display());
    }
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating config dir {}", parent.display()))?;
    }
    fs::write(path, DEFAULT_CONFIG)
        .with_context(|| format!("writing config file {}", path.display()))?;
    Ok(())
}

pub fn resolve_string(cli: Option<&String>, file: Option<&String>) -> Option<String> {
    cli.or(file).filter(|s| !s.trim().is_empty()).cloned()
}

pub fn resolve_u32(cli: Option<u32>, file: Option<u32>, fallback: u32) -> u32 {
    cli.or(file).unwrap_or(fallback)
}

pub fn parse_timezone(raw: Option<String>) -> Result<Tz> {
    let tz_str = raw.unwrap_or_else(|| "UTC".to_string());
    tz_str.parse::<Tz>().map_err(|e| {
        anyhow!(
            "Invalid timezone '{}': {}. Example: 'UTC' or 'America/Los_Angeles'",
            tz_str,
            e
        )
    })
}

pub fn parse_date_opt(raw: Option<&str>) -> Result<Option<NaiveDate>> {
    match raw {
        None => Ok(None),
        Some(s) => {
            let d = NaiveDate::parse_from_str(s, DATE_FORMAT)
                .with_context(|| format!("Could not parse date '{}', expected YYYY-MM-DD", s))?;
            Ok(Some(d))
        }
    }
}

/// The last month up to and including `today`.
pub fn default_start(today: NaiveDate) -> NaiveDate {
    today.checked_sub_months(Months::new(1)).unwrap_or(today)
}

/// CLI directories win outright; otherwise the config file's list is used.
pub fn resolve_data_dirs(cli_dirs: &[PathBuf], file_dirs: &[PathBuf]) -> Vec<PathBuf> {
    let source = if cli_dirs.is_empty() { file_dirs } else { cli_dirs };
    source.iter().map(|d| expand_tilde(d)).collect()
}

fn expand_tilde(path: &Path) -> PathBuf {
    if let Some(path_str) = path.to_str() {
        if let Some(rest) = path_str.strip_prefix("~/") {
            if let Some(home) = home_dir() {
                return home.join(rest);
            }
        }
    }
    path.to_path_buf()
}

fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_config_passes_validation() {
        let cfg = parse_config(DEFAULT_CONFIG).unwrap();
        assert_eq!(cfg.provider.as_deref(), Some("aws"));
        assert_eq!(cfg.output.format.as_deref(), Some("table"));
        assert_eq!(cfg.report.kind.as_deref(), Some("full"));
        assert_eq!(cfg.report.inactive_days, Some(30));
        assert_eq!(cfg.aws.region.as_deref(), Some("us-east-1"));
        assert!(cfg.newrelic.api_key.is_none());
        assert!(cfg.file.data_dirs.is_empty());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = parse_config("provider: aws\ncolour: blue\n").unwrap_err();
        assert!(format!("{err:#}").contains("Config validation failed"));
    }

    #[test]
    fn wrong_types_are_rejected() {
        assert!(parse_config("newrelic:\n  account_id: abc\n").is_err());
        assert!(parse_config("output:\n  format: xml\n").is_err());
    }

    #[test]
    fn partial_config_fills_defaults() {
        let cfg = parse_config("file:\n  data_dirs: [\"/tmp/exports\"]\n").unwrap();
        assert!(cfg.provider.is_none());
        assert_eq!(cfg.file.data_dirs, [PathBuf::from("/tmp/exports")]);
    }

    #[test]
    fn explicit_missing_path_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_config(Some(&dir.path().join("absent.yaml"))).is_err());
    }

    #[test]
    fn generate_refuses_to_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/config.yaml");
        generate_config(&path).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), DEFAULT_CONFIG);

        fs::write(&path, "provider: file\n").unwrap();
        assert!(generate_config(&path).is_err());
        assert_eq!(fs::read_to_string(&path).unwrap(), "provider: file\n");
    }

    #[test]
    fn cli_values_take_precedence() {
        let cli = "json".to_string();
        let file = "table".to_string();
        assert_eq!(resolve_string(Some(&cli), Some(&file)).as_deref(), Some("json"));
        assert_eq!(resolve_string(None, Some(&file)).as_deref(), Some("table"));
        assert_eq!(resolve_u32(None, Some(7), 30), 7);
        assert_eq!(resolve_u32(None, None, 30), 30);
    }

    #[test]
    fn dates_and_timezones_parse() {
        let date = parse_date_opt(Some("2024-03-31")).unwrap().unwrap();
        assert_eq!(default_start(date), NaiveDate::from_ymd_opt(2024, 2, 29).unwrap());
        assert!(parse_date_opt(Some("03/31/2024")).is_err());
        assert!(parse_timezone(Some("Mars/Olympus".into())).is_err());
        assert_eq!(parse_timezone(None).unwrap(), Tz::UTC);
    }

    #[test]
    fn cli_data_dirs_replace_configured_ones() {
        let cli = [PathBuf::from("a")];
        let file = [PathBuf::from("b"), PathBuf::from("c")];
        assert_eq!(resolve_data_dirs(&cli, &file), [PathBuf::from("a")]);
        assert_eq!(resolve_data_dirs(&[], &file).len(), 2);
    }
}
