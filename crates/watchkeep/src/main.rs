//! watchkeep CLI
//!
//! Entry point for the `wk` binary: inspect the resolved capture schedule,
//! upcoming mode changes and retry backoff, and run consensus synthesis over
//! a recorded sample sequence.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use chrono::{Duration as ChronoDuration, Local, NaiveDateTime};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing::debug;

use watchkeep_core::analysis::parse_sequence;
use watchkeep_core::config::{Config, LogFormat};
use watchkeep_core::error::SynthesisError;
use watchkeep_core::logging::init_logging;
use watchkeep_core::retry::RetryPolicy;
use watchkeep_core::schedule::ScheduleResolver;
use watchkeep_core::synthesis::{SequenceReport, Synthesizer};

/// Exit code for a sequence that could not be synthesized.
const EXIT_ANALYSIS_UNAVAILABLE: u8 = 2;

#[derive(Parser, Debug)]
#[command(name = "wk")]
#[command(
    author,
    version,
    about = "watchkeep - adaptive capture scheduling and consensus analysis"
)]
struct Cli {
    /// Configuration file (TOML or YAML)
    #[arg(short, long, global = true, env = "WATCHKEEP_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Log format (pretty or json)
    #[arg(long, global = true)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the effective schedule at an instant as JSON
    Resolve {
        /// Local time to resolve (defaults to now)
        #[arg(long, value_parser = parse_datetime)]
        at: Option<NaiveDateTime>,
    },

    /// List upcoming mode changes
    Timeline {
        /// Start of the window (defaults to now)
        #[arg(long, value_parser = parse_datetime)]
        from: Option<NaiveDateTime>,

        /// Window length in hours
        #[arg(long, default_value_t = 24)]
        hours: u32,
    },

    /// Synthesize a consensus report from a JSON array of samples
    Synthesize {
        /// Path to the samples file
        file: PathBuf,

        /// Subject the samples belong to
        #[arg(long, default_value = "cli")]
        subject: String,

        /// Override the configured sequence length
        #[arg(long)]
        sequence_length: Option<usize>,
    },

    /// Print the deterministic retry backoff table for a period
    RetryPlan {
        #[arg(long, value_enum, default_value_t = Period::Day)]
        period: Period,

        /// Emit JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Inspect configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Load and validate the configuration
    Check,
    /// Print the effective configuration as TOML
    Show,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Period {
    Day,
    Night,
}

#[derive(Debug, Serialize)]
struct RetryStep {
    attempt: u32,
    /// Un-jittered delay before the next attempt; `None` on the final attempt.
    delay_secs: Option<f64>,
    /// Upper bound once jitter is applied.
    max_jittered_secs: Option<f64>,
    cumulative_secs: f64,
}

fn parse_datetime(s: &str) -> std::result::Result<NaiveDateTime, String> {
    const FORMATS: &[&str] = &[
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%dT%H:%M",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%d %H:%M",
    ];
    FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .ok_or_else(|| format!("invalid datetime '{s}', expected YYYY-MM-DDTHH:MM[:SS]"))
}

fn now() -> NaiveDateTime {
    Local::now().naive_local()
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(level) = &cli.log_level {
        config.logging.level.clone_from(level);
    }
    if let Some(format) = cli.log_format {
        config.logging.format = format;
    }
    Ok(config)
}

fn retry_plan(config: &Config, period: Period) -> (String, RetryPolicy, Vec<RetryStep>) {
    let settings = match period {
        Period::Day => &config.schedule.day,
        Period::Night => &config.schedule.night,
    };
    let policy = RetryPolicy::from_settings(&settings.retry);

    let mut cumulative = 0.0;
    let steps = (1..=policy.max_attempts)
        .map(|attempt| {
            let last = attempt == policy.max_attempts;
            let delay = (!last).then(|| policy.base_delay_for_attempt(attempt).as_secs_f64());
            cumulative += delay.unwrap_or(0.0);
            RetryStep {
                attempt,
                delay_secs: delay,
                max_jittered_secs: delay.map(|d| d * (1.0 + policy.jitter_fraction)),
                cumulative_secs: cumulative,
            }
        })
        .collect();
    (settings.name.clone(), policy, steps)
}

fn synthesize(
    config: &Config,
    file: &Path,
    subject: &str,
    sequence_length: Option<usize>,
) -> Result<ExitCode> {
    let content = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read samples from {}", file.display()))?;
    let entries = parse_sequence(&content).map_err(watchkeep_core::Error::from)?;

    let mut synthesis = config.synthesis.clone();
    if let Some(n) = sequence_length {
        synthesis.sequence_length = n;
    }
    debug!(samples = entries.len(), n = synthesis.sequence_length, "Synthesizing");

    match Synthesizer::new(synthesis).synthesize(&entries) {
        Ok(report) => {
            print_json(&report)?;
            Ok(ExitCode::SUCCESS)
        }
        Err(err @ SynthesisError::InsufficientData { .. }) => {
            let report = SequenceReport::from_result(subject, 0, now(), &entries, Err(err));
            print_json(&report)?;
            Ok(ExitCode::from(EXIT_ANALYSIS_UNAVAILABLE))
        }
        Err(err) => Err(watchkeep_core::Error::from(err).into()),
    }
}

fn run(cli: &Cli) -> Result<ExitCode> {
    let config = load_config(cli)?;
    init_logging(&config.logging)?;
    let resolver = ScheduleResolver::new(config.schedule.clone());

    match &cli.command {
        Commands::Resolve { at } => {
            print_json(&resolver.resolve(at.unwrap_or_else(now)))?;
        }
        Commands::Timeline { from, hours } => {
            let from = from.unwrap_or_else(now);
            let transitions = resolver.transitions(from, ChronoDuration::hours(i64::from(*hours)));
            print_json(&transitions)?;
        }
        Commands::Synthesize {
            file,
            subject,
            sequence_length,
        } => return synthesize(&config, file, subject, *sequence_length),
        Commands::RetryPlan { period, json } => {
            let (name, policy, steps) = retry_plan(&config, *period);
            if *json {
                print_json(&steps)?;
            } else {
                println!(
                    "{name}: max_attempts={} base={}s multiplier={} cap={}s jitter<={:.0}%",
                    policy.max_attempts,
                    policy.base_delay.as_secs_f64(),
                    policy.backoff_multiplier,
                    policy.max_delay.as_secs_f64(),
                    policy.jitter_fraction * 100.0
                );
                println!("{:<8} {:>10} {:>12} {:>12}", "attempt", "delay", "jittered<=", "cumulative");
                for step in &steps {
                    let delay = step.delay_secs.map_or_else(|| "give up".to_string(), |d| format!("{d:.1}s"));
                    let jittered = step.max_jittered_secs.map_or_else(|| "-".to_string(), |d| format!("{d:.1}s"));
                    println!(
                        "{:<8} {:>10} {:>12} {:>11.1}s",
                        step.attempt, delay, jittered, step.cumulative_secs
                    );
                }
            }
        }
        Commands::Config {
            command: ConfigCommands::Show,
        } => {
            print!("{}", config.to_toml_string()?);
        }
        Commands::Config {
            command: ConfigCommands::Check,
        } => match cli.config.clone().or_else(Config::default_path) {
            Some(path) if path.exists() => println!("Config OK: {}", path.display()),
            _ => println!("Config OK: built-in defaults"),
        },
    }
    Ok(ExitCode::SUCCESS)
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(&cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error: {err:#}");
            if let Some(remediation) = err
                .downcast_ref::<watchkeep_core::Error>()
                .and_then(watchkeep_core::Error::remediation)
            {
                eprintln!();
                eprint!("{}", remediation.render_plain());
            }
            ExitCode::FAILURE
        }
    }
}
