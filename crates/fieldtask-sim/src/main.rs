//! Fieldtask boot simulator
//!
//! Runs a boot scenario against in-memory collaborators and prints the
//! observed phase sequence with the final diagnostics.

mod scenario;

use anyhow::Context;
use clap::builder::PossibleValuesParser;
use clap::{value_parser, Arg, ArgAction, Command};
use fieldtask_boot::BootConfig;
use scenario::{default_config, run_scenario, Scenario};
use std::path::PathBuf;
use tracing_subscriber::{fmt, EnvFilter};

fn cli() -> Command {
    let names: Vec<&'static str> = Scenario::ALL.iter().map(|s| s.as_str()).collect();
    Command::new("fieldtask-sim")
        .version(fieldtask_boot::VERSION)
        .about("Fieldtask boot scenario simulator")
        .arg(
            Arg::new("json-logs")
                .long("json-logs")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Emit logs as JSON"),
        )
        .subcommand_required(true)
        .subcommand(
            Command::new("run")
                .about("Run one boot scenario")
                .arg(
                    Arg::new("scenario")
                        .long("scenario")
                        .required(true)
                        .value_parser(PossibleValuesParser::new(names))
                        .help("Scenario to run"),
                )
                .arg(
                    Arg::new("config")
                        .long("config")
                        .value_parser(value_parser!(PathBuf))
                        .help("Boot configuration (TOML)"),
                )
                .arg(
                    Arg::new("json")
                        .long("json")
                        .action(ArgAction::SetTrue)
                        .help("Print the report as JSON"),
                ),
        )
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = fmt().with_env_filter(filter).with_writer(std::io::stderr);
    let _ = if json { builder.json().try_init() } else { builder.try_init() };
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let matches = cli().get_matches();
    init_tracing(matches.get_flag("json-logs"));

    let Some(("run", args)) = matches.subcommand() else {
        anyhow::bail!("no subcommand given");
    };
    let scenario: Scenario = args
        .get_one::<String>("scenario")
        .context("missing --scenario")?
        .parse()
        .map_err(anyhow::Error::msg)?;
    let config = match args.get_one::<PathBuf>("config") {
        Some(path) => BootConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => default_config(),
    };

    let report = run_scenario(scenario, config).await;
    if args.get_flag("json") {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{}", report.generate_text());
    }

    std::process::exit(if report.passed() { 0 } else { 1 });
}
