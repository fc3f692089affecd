mod aggregate;
mod config;
mod error;
mod model;
mod providers;
mod render;
mod table;

use std::{
    fs::File,
    io::{self, BufWriter, IsTerminal, Write},
    path::PathBuf,
};

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{ArgAction, Args, Parser, Subcommand};
use tracing::debug;
use tracing_subscriber::EnvFilter;

use crate::{
    config::{FileConfig, LOCAL_CONFIG_NAME},
    model::{DateRange, ReportKind},
    providers::{
        ProviderCatalog, ProviderSettings, aws::AwsSettings, file::FileSettings,
        newrelic::{DEFAULT_INACTIVE_DAYS, NewRelicSettings},
    },
    render::{OutputFormat, Renderer},
};

#[derive(Parser, Debug)]
#[command(
    name = "obs-cost-center",
    version,
    about = "Usage and cost reports for observability vendors"
)]
struct Cli {
    /// Config file (YAML). If omitted, tries ./observability-cost-center.yaml, the platform
    /// config dir, then ~/.observability-cost-center.yaml
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Provider to query (aws, newrelic, file)
    #[arg(short, long, global = true, env = "OBS_PROVIDER")]
    provider: Option<String>,

    /// Output format (table, summary, json, csv)
    #[arg(short, long, global = true, env = "OBS_OUTPUT")]
    output: Option<String>,

    /// Timezone for usage timestamps and the default end date (IANA name, e.g. UTC, Europe/Lisbon)
    #[arg(long, global = true)]
    timezone: Option<String>,

    /// Log more (-v info, -vv debug). RUST_LOG overrides this.
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate a usage and cost report
    Report(ReportArgs),
    /// Manage the configuration file
    #[command(subcommand)]
    Config(ConfigCommand),
    /// List available providers
    Providers,
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    /// Write a commented default configuration file
    Generate {
        /// Destination (default ./observability-cost-center.yaml)
        #[arg(short = 'f', long)]
        path: Option<PathBuf>,
    },
}

#[derive(Args, Debug)]
struct ReportArgs {
    /// Report type (usage, cost, full)
    #[arg(short = 't', long = "type")]
    kind: Option<String>,

    /// First day of the report (YYYY-MM-DD, default one month ago)
    #[arg(long)]
    start_date: Option<String>,

    /// Last day of the report, inclusive (YYYY-MM-DD, default today)
    #[arg(long)]
    end_date: Option<String>,

    /// Write the report to this file instead of stdout
    #[arg(short = 'f', long)]
    output_file: Option<PathBuf>,

    /// Days without activity before a license counts as inactive
    #[arg(long)]
    inactive_days: Option<u32>,

    /// Directory of saved JSONL records for the file provider. You can repeat this flag.
    #[arg(long = "data-dir")]
    data_dirs: Vec<PathBuf>,

    #[arg(long, env = "AWS_REGION")]
    aws_region: Option<String>,

    #[arg(long, env = "AWS_PROFILE")]
    aws_profile: Option<String>,

    #[arg(long, env = "NEW_RELIC_API_KEY", hide_env_values = true)]
    newrelic_api_key: Option<String>,

    #[arg(long)]
    newrelic_account_id: Option<i64>,

    #[arg(long, env = "NEW_RELIC_REGION")]
    newrelic_region: Option<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let catalog = ProviderCatalog::builtin();

    match &cli.command {
        Command::Report(args) => run_report(&cli, args, &catalog),
        Command::Config(ConfigCommand::Generate { path }) => {
            let path = path.clone().unwrap_or_else(|| PathBuf::from(LOCAL_CONFIG_NAME));
            config::generate_config(&path)?;
            println!("Wrote default configuration to {}", path.display());
            Ok(())
        }
        Command::Providers => {
            for (name, description) in catalog.describe() {
                println!("{name:<10} {description}");
            }
            Ok(())
        }
    }
}

fn init_tracing(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

fn run_report(cli: &Cli, args: &ReportArgs, catalog: &ProviderCatalog) -> Result<()> {
    let file_cfg = config::load_config(cli.config.as_deref())?;

    let format_raw = config::resolve_string(cli.output.as_ref(), file_cfg.output.format.as_ref())
        .unwrap_or_else(|| "table".to_string());
    let format: OutputFormat = format_raw.parse()?;

    let kind_raw = config::resolve_string(args.kind.as_ref(), file_cfg.report.kind.as_ref())
        .unwrap_or_else(|| "full".to_string());
    let kind: ReportKind = kind_raw.parse()?;

    let tz = config::parse_timezone(config::resolve_string(
        cli.timezone.as_ref(),
        file_cfg.timezone.as_ref(),
    ))?;

    let today = Utc::now().with_timezone(&tz).date_naive();
    let end = config::parse_date_opt(args.end_date.as_deref())?.unwrap_or(today);
    let start = config::parse_date_opt(args.start_date.as_deref())?
        .unwrap_or_else(|| config::default_start(end));
    let range = DateRange::new(start, end)?;

    let provider_name = config::resolve_string(cli.provider.as_ref(), file_cfg.provider.as_ref())
        .with_context(|| {
            format!(
                "No provider selected. Use --provider or set `provider` in the config file (available: {})",
                catalog.names().join(", ")
            )
        })?;

    let settings = provider_settings(args, &file_cfg);
    debug!(
        provider = %provider_name,
        %format,
        %kind,
        start = %range.start,
        end = %range.end,
        timezone = %tz,
        "resolved report settings"
    );

    let provider = catalog
        .create(&provider_name, &settings)
        .with_context(|| format!("Failed to initialize provider '{provider_name}'"))?;
    let report = providers::generate_report(provider.as_ref(), kind, range)
        .with_context(|| format!("Failed to generate {kind} report from {}", provider.name()))?;

    let output_file = args.output_file.clone().or_else(|| file_cfg.output.file.clone());
    let renderer = Renderer::new(tz);
    match output_file {
        Some(path) => {
            colored::control::set_override(false);
            let file = File::create(&path)
                .with_context(|| format!("Failed to create output file {}", path.display()))?;
            let mut sink = BufWriter::new(file);
            renderer.render(&report, format, &mut sink)?;
            eprintln!("Report saved to {}", path.display());
        }
        None => {
            let stdout = io::stdout();
            if !stdout.is_terminal() {
                colored::control::set_override(false);
            }
            let mut sink = stdout.lock();
            renderer.render(&report, format, &mut sink)?;
            sink.flush()?;
        }
    }
    Ok(())
}

fn provider_settings(args: &ReportArgs, file_cfg: &FileConfig) -> ProviderSettings {
    ProviderSettings {
        aws: AwsSettings {
            region: config::resolve_string(args.aws_region.as_ref(), file_cfg.aws.region.as_ref()),
            profile: config::resolve_string(args.aws_profile.as_ref(), file_cfg.aws.profile.as_ref()),
        },
        newrelic: NewRelicSettings {
            api_key: config::resolve_string(
                args.newrelic_api_key.as_ref(),
                file_cfg.newrelic.api_key.as_ref(),
            ),
            account_id: args.newrelic_account_id.or(file_cfg.newrelic.account_id),
            region: config::resolve_string(
                args.newrelic_region.as_ref(),
                file_cfg.newrelic.region.as_ref(),
            ),
            inactive_days: Some(config::resolve_u32(
                args.inactive_days,
                file_cfg.report.inactive_days,
                DEFAULT_INACTIVE_DAYS,
            )),
        },
        file: FileSettings {
            data_dirs: config::resolve_data_dirs(&args.data_dirs, &file_cfg.file.data_dirs),
        },
    }
}
