use anyhow::Context;
use clap::{value_parser, Arg, ArgAction, Command};
use recovery_core::RecoveryConfig;
use recovery_sim::{run_simulator, SimulatorConfig};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

fn cli() -> Command {
    Command::new("recovery-sim")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Recovery core simulator and configuration tool")
        .subcommand_required(true)
        .subcommand(
            Command::new("simulate")
                .about("Drive a seeded mix of recoveries through the orchestrator")
                .arg(
                    Arg::new("operations")
                        .long("operations")
                        .default_value("200")
                        .value_parser(value_parser!(u64))
                        .help("Number of operations to simulate"),
                )
                .arg(
                    Arg::new("seed")
                        .long("seed")
                        .default_value("42")
                        .value_parser(value_parser!(u64))
                        .help("Random seed for reproducibility"),
                )
                .arg(
                    Arg::new("stop-on-violation")
                        .long("stop-on-violation")
                        .action(ArgAction::SetTrue)
                        .help("Stop simulation on first violation"),
                )
                .arg(
                    Arg::new("json")
                        .long("json")
                        .action(ArgAction::SetTrue)
                        .help("Output as JSON"),
                ),
        )
        .subcommand(
            Command::new("config")
                .about("Print the effective configuration as TOML")
                .arg(
                    Arg::new("file")
                        .long("file")
                        .value_parser(value_parser!(PathBuf))
                        .help("Configuration file to load and validate"),
                ),
        )
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let matches = cli().get_matches();

    match matches.subcommand() {
        Some(("simulate", args)) => {
            let operations = args.get_one::<u64>("operations").copied().unwrap_or(200);
            let seed = args.get_one::<u64>("seed").copied().unwrap_or(42);
            let json = args.get_flag("json");

            let config = SimulatorConfig {
                seed,
                operations,
                stop_on_first_violation: args.get_flag("stop-on-violation"),
            };
            tracing::info!(operations, seed, "running recovery simulator");

            let report = run_simulator(config).await;
            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&report).context("rendering report")?
                );
            } else {
                println!("{}", report.generate_text());
            }

            std::process::exit(if report.passed() { 0 } else { 1 });
        }
        Some(("config", args)) => {
            let config = match args.get_one::<PathBuf>("file") {
                Some(path) => RecoveryConfig::from_file(path)
                    .with_context(|| format!("loading {}", path.display()))?,
                None => RecoveryConfig::default(),
            };
            print!("{}", config.to_toml_string().context("rendering configuration")?);
            Ok(())
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        cli().debug_assert();
    }

    #[test]
    fn simulate_defaults() {
        let matches = cli().get_matches_from(["recovery-sim", "simulate"]);
        let (name, args) = matches.subcommand().unwrap();
        assert_eq!(name, "simulate");
        assert_eq!(args.get_one::<u64>("operations"), Some(&200));
        assert!(!args.get_flag("json"));
    }
}
