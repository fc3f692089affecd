use assert_cmd::prelude::*;
use serde_json::{Value, json};
use std::{fs, process::Command};

const JANUARY: [&str; 4] = ["--start-date", "2024-01-01", "--end-date", "2024-01-31"];

fn cli() -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("obs-cost-center"));
    for var in [
        "OBS_PROVIDER",
        "OBS_OUTPUT",
        "NEW_RELIC_API_KEY",
        "NEW_RELIC_REGION",
        "AWS_REGION",
        "AWS_PROFILE",
        "RUST_LOG",
        "XDG_CONFIG_HOME",
    ] {
        cmd.env_remove(var);
    }
    cmd.env("HOME", concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures"));
    cmd
}

fn file_report(extra: &[&str]) -> Command {
    let mut cmd = cli();
    cmd.args(["report", "--provider", "file", "--data-dir", "tests/fixtures"])
        .args(JANUARY)
        .args(extra);
    cmd
}

fn stdout_of(mut cmd: Command) -> String {
    let output = cmd.assert().success().get_output().stdout.clone();
    String::from_utf8(output).expect("utf-8 output")
}

fn run_json(extra: &[&str]) -> Value {
    let mut args = vec!["--output", "json"];
    args.extend_from_slice(extra);
    serde_json::from_str(&stdout_of(file_report(&args))).expect("valid json output")
}

fn approx(v: &Value, expected: f64) -> bool {
    v.as_f64().is_some_and(|x| (x - expected).abs() < 1e-6)
}

#[test]
fn full_json_report_matches_fixture() {
    let v = run_json(&[]);
    assert_eq!(v["provider"], "Local export");
    assert_eq!(v["reportType"], "full");
    assert_eq!(v["startDate"], "2024-01-01");
    assert_eq!(v["endDate"], "2024-01-31");

    let summary = &v["summary"];
    assert_eq!(summary["usageDataEntries"], json!(3));
    assert_eq!(summary["costDataEntries"], json!(5));
    assert_eq!(v["usageData"].as_array().unwrap().len(), 3);
    assert_eq!(v["costData"].as_array().unwrap().len(), 5);
    assert!(approx(&summary["totalCost"], 45.0));
    assert_eq!(summary["currency"], "USD");

    let accounts = summary["accounts"].as_array().unwrap();
    assert_eq!(accounts.len(), 2);
    assert_eq!(accounts[0]["accountId"], "111");
    assert!(approx(&accounts[0]["cost"], 35.0));
    assert_eq!(accounts[1]["accountId"], "222");
    assert!(approx(&accounts[1]["cost"], 10.0));
}

#[test]
fn usage_data_is_sorted_by_timestamp() {
    let v = run_json(&["--type", "usage"]);
    let metrics: Vec<_> = v["usageData"]
        .as_array()
        .unwrap()
        .iter()
        .map(|u| u["metric"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(metrics, ["CallCount", "IncomingBytes", "NumberOfAlarms"]);
    assert!(v["costData"].as_array().unwrap().is_empty());
    assert_eq!(v["summary"]["totalCost"], json!(0.0));
    assert!(v["summary"]["currency"].is_null());
}

#[test]
fn cost_report_has_no_usage() {
    let v = run_json(&["--type", "cost"]);
    assert!(v["usageData"].as_array().unwrap().is_empty());
    assert_eq!(v["summary"]["costDataEntries"], json!(5));
    assert!(approx(&v["summary"]["totalCost"], 45.0));
}

#[test]
fn table_report_shows_account_breakdown() {
    let text = stdout_of(file_report(&[]));
    assert!(text.contains("Report for Local export"));
    assert!(text.contains("Period: 2024-01-01 to 2024-01-31"));
    assert!(text.contains("Account Cost Summary"));
    assert!(text.contains("Account ID: 111"));
    assert!(text.contains("Account ID: 222"));
    assert!(text.contains("DAILY TOTAL"));
    assert!(text.contains("ACCOUNT TOTAL"));
    assert!(text.contains("35.0000 USD"));
    assert!(text.contains("45.0000"));
    assert!(!text.contains("99.0000"));
    assert!(!text.contains('\x1b'), "piped output should not be colored");
}

#[test]
fn summary_report_is_plain_text() {
    let text = stdout_of(file_report(&["--output", "summary", "--type", "cost"]));
    assert!(text.contains("=== Account Cost Summary ==="));
    assert!(text.contains("=== Account: 111 ==="));
    assert!(text.contains("=== Account: 222 ==="));
    assert!(!text.contains("=== Usage Data ==="));
    assert!(!text.contains('│'));
}

#[test]
fn timezone_only_shifts_usage_timestamps() {
    let text = stdout_of(file_report(&[
        "--output",
        "summary",
        "--timezone",
        "America/Los_Angeles",
    ]));
    assert!(text.contains("2023-12-31 16:00:00"), "{text}");

    let cost_days: Vec<&str> = text
        .lines()
        .skip_while(|l| !l.starts_with("=== Account: "))
        .filter_map(|l| l.get(..10))
        .filter(|d| d.starts_with("20"))
        .collect();
    assert!(!cost_days.is_empty());
    assert!(
        cost_days.iter().all(|d| ("2024-01-01"..="2024-01-31").contains(d)),
        "{cost_days:?}"
    );
}

#[test]
fn csv_report_has_a_row_per_record() {
    let text = stdout_of(file_report(&["--output", "csv"]));
    let mut lines = text.lines();
    assert!(lines.next().unwrap().starts_with("recordType,service,name,amount"));
    let rows: Vec<_> = lines.collect();
    assert_eq!(rows.len(), 8);
    assert_eq!(rows.iter().filter(|r| r.starts_with("cost,")).count(), 5);
}

#[test]
fn unsupported_format_fails_without_output() {
    let output = file_report(&["--output", "xml"])
        .assert()
        .failure()
        .get_output()
        .clone();
    assert!(output.stdout.is_empty());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("unsupported output format: xml"), "{stderr}");
}

#[test]
fn unsupported_report_type_fails() {
    let output = file_report(&["--type", "weekly"])
        .assert()
        .failure()
        .get_output()
        .clone();
    assert!(output.stdout.is_empty());
    assert!(String::from_utf8_lossy(&output.stderr).contains("unsupported report type: weekly"));
}

#[test]
fn inverted_dates_are_rejected() {
    let mut cmd = cli();
    cmd.args([
        "report",
        "--provider",
        "file",
        "--data-dir",
        "tests/fixtures",
        "--start-date",
        "2024-02-01",
        "--end-date",
        "2024-01-01",
    ]);
    let output = cmd.assert().failure().get_output().clone();
    assert!(String::from_utf8_lossy(&output.stderr).contains("is after end date"));
}

#[test]
fn unknown_provider_lists_alternatives() {
    let mut cmd = cli();
    cmd.args(["report", "--provider", "datadog"]).args(JANUARY);
    let output = cmd.assert().failure().get_output().clone();
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("unknown provider 'datadog'"), "{stderr}");
    assert!(stderr.contains("aws, newrelic, file"));
}

#[test]
fn newrelic_without_api_key_is_a_configuration_error() {
    let mut cmd = cli();
    cmd.args(["report", "--provider", "newrelic"]).args(JANUARY);
    let output = cmd.assert().failure().get_output().clone();
    assert!(String::from_utf8_lossy(&output.stderr).contains("API key is required"));
}

#[test]
fn env_var_selects_provider_and_format() {
    let mut cmd = cli();
    cmd.env("OBS_PROVIDER", "file")
        .env("OBS_OUTPUT", "json")
        .args(["report", "--data-dir", "tests/fixtures"])
        .args(JANUARY);
    let v: Value = serde_json::from_str(&stdout_of(cmd)).unwrap();
    assert_eq!(v["summary"]["costDataEntries"], json!(5));
}

#[test]
fn output_file_receives_the_report() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("report.json");
    let output = file_report(&["--output", "json", "--output-file", path.to_str().unwrap()])
        .assert()
        .success()
        .get_output()
        .clone();
    assert!(output.stdout.is_empty());

    let v: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
    assert!(approx(&v["summary"]["totalCost"], 45.0));
}

#[test]
fn config_file_supplies_defaults_and_flags_override_it() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("config.yaml");
    let data_dir = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures");
    fs::write(
        &config,
        format!(
            "provider: file\noutput:\n  format: json\nreport:\n  type: cost\nfile:\n  data_dirs:\n    - {data_dir}\n"
        ),
    )
    .unwrap();

    let mut cmd = cli();
    cmd.args(["report", "--config", config.to_str().unwrap()]).args(JANUARY);
    let v: Value = serde_json::from_str(&stdout_of(cmd)).unwrap();
    assert_eq!(v["reportType"], "cost");
    assert_eq!(v["summary"]["costDataEntries"], json!(5));

    let mut cmd = cli();
    cmd.args(["report", "--config", config.to_str().unwrap(), "--output", "summary"])
        .args(JANUARY);
    assert!(stdout_of(cmd).contains("=== Account: 111 ==="));
}

#[test]
fn invalid_config_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("config.yaml");
    fs::write(&config, "provider: file\nretries: 3\n").unwrap();

    let mut cmd = cli();
    cmd.args(["report", "--config", config.to_str().unwrap()]).args(JANUARY);
    let output = cmd.assert().failure().get_output().clone();
    assert!(String::from_utf8_lossy(&output.stderr).contains("Config validation failed"));
}

#[test]
fn malformed_records_name_the_file() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("broken.jsonl"), "{\"kind\":\"cost\"}\n").unwrap();

    let mut cmd = cli();
    cmd.args(["report", "--provider", "file", "--data-dir", dir.path().to_str().unwrap()])
        .args(JANUARY);
    let output = cmd.assert().failure().get_output().clone();
    assert!(String::from_utf8_lossy(&output.stderr).contains("broken.jsonl:1"));
}

#[test]
fn config_generate_refuses_to_overwrite() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("obs.yaml");

    let mut cmd = cli();
    cmd.args(["config", "generate", "--path", path.to_str().unwrap()]);
    cmd.assert().success();
    let written = fs::read_to_string(&path).unwrap();
    assert!(written.contains("provider: aws"));

    let mut cmd = cli();
    cmd.args(["config", "generate", "--path", path.to_str().unwrap()]);
    let output = cmd.assert().failure().get_output().clone();
    assert!(String::from_utf8_lossy(&output.stderr).contains("already exists"));
    assert_eq!(fs::read_to_string(&path).unwrap(), written);
}

#[test]
fn providers_are_listed() {
    let mut cmd = cli();
    cmd.arg("providers");
    let text = stdout_of(cmd);
    for name in ["aws", "newrelic", "file"] {
        assert!(text.lines().any(|l| l.starts_with(name)), "{name} missing: {text}");
    }
}
