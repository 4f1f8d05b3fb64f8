//! seqflow CLI Entry Point
//!
//! # Usage
//!
//! ```bash
//! # Build the pipeline's default targets
//! seqflow pipeline.yaml
//!
//! # Build specific targets
//! seqflow pipeline.yaml aligned/A.bam aligned/B.bam
//!
//! # Preview the task graph without running anything
//! seqflow pipeline.yaml --dry-run
//!
//! # Limit the budget and allow retries
//! seqflow pipeline.yaml --cores 8 --memory 16000 --max-attempts 3
//! ```

use std::env;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use colored::Colorize;
use log::{error, info};

use seqflow::execution::{Capacity, Engine, RunReport};
use seqflow::workflow::planner::TaskState;
use seqflow::workflow::parser::load_pipeline;
use seqflow::{APP_NAME, VERSION};

/// Default pipeline file used when none is specified.
const DEFAULT_PIPELINE: &str = "pipeline.yaml";

/// Command-line configuration parsed from arguments.
#[derive(Debug, Default)]
struct Config {
    pipeline_path: Option<String>,
    targets: Vec<String>,
    dry_run: bool,
    working_dir: Option<PathBuf>,
    cores: Option<usize>,
    memory_mb: Option<u64>,
    max_attempts: Option<u32>,
    verbose: bool,
}

/// Configures the logging system with appropriate formatting.
fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| {
            use std::io::Write;

            match record.level() {
                log::Level::Warn | log::Level::Error => {
                    writeln!(buf, "[{}] {}", record.level(), record.args())
                }
                _ => writeln!(buf, "{}", record.args()),
            }
        })
        .init();
}

fn print_banner() {
    println!();
    println!("{} v{}", APP_NAME, VERSION);
    println!("Rule-based sequencing pipeline engine");
    println!();
}

fn print_usage() {
    println!("Usage: seqflow [OPTIONS] <PIPELINE_FILE> [TARGET...]");
    println!();
    println!("Arguments:");
    println!("  <PIPELINE_FILE>     Path to pipeline YAML file (default: {})", DEFAULT_PIPELINE);
    println!("  [TARGET...]         Paths to build (default: the pipeline's targets)");
    println!();
    println!("Options:");
    println!("  --dry-run           Show the tasks that would run without running them");
    println!("  --working-dir PATH  Directory all pipeline paths are relative to");
    println!("  --cores N           Thread budget (default: all CPUs)");
    println!("  --memory MB         Memory budget in MB (default: physical memory)");
    println!("  --max-attempts N    Attempts per task unless a rule sets its own (default: 1)");
    println!("  --verbose           Enable debug logging");
    println!("  --help              Show this help message");
    println!("  --version           Show version information");
    println!();
    println!("Examples:");
    println!("  seqflow pipeline.yaml");
    println!("  seqflow pipeline.yaml counts/A.raw.count --dry-run");
    println!("  seqflow pipeline.yaml --working-dir /data/run42 --cores 8 --max-attempts 3");
}

/// Reads the value following an option.
fn option_value<'a>(args: &'a [String], i: &mut usize, option: &str) -> Result<&'a str, String> {
    *i += 1;
    args.get(*i)
        .map(String::as_str)
        .ok_or_else(|| format!("{} requires a value", option))
}

fn parse_number<T: std::str::FromStr>(value: &str, option: &str) -> Result<T, String> {
    value
        .parse()
        .map_err(|_| format!("Invalid {} value: {}", option, value))
}

/// Parses command-line arguments into a Config struct.
fn parse_arguments(args: &[String]) -> Result<Config, String> {
    let mut config = Config::default();
    let mut i = 1; // Skip program name

    while i < args.len() {
        let arg = &args[i];

        match arg.as_str() {
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("{} {}", APP_NAME, VERSION);
                std::process::exit(0);
            }
            "--dry-run" | "-n" => config.dry_run = true,
            "--verbose" | "-v" => config.verbose = true,
            "--working-dir" => {
                let value = option_value(args, &mut i, "--working-dir")?;
                config.working_dir = Some(PathBuf::from(value));
            }
            "--cores" | "-j" => {
                let value = option_value(args, &mut i, "--cores")?;
                let cores: usize = parse_number(value, "--cores")?;
                if cores == 0 {
                    return Err("--cores must be at least 1".to_string());
                }
                config.cores = Some(cores);
            }
            "--memory" => {
                let value = option_value(args, &mut i, "--memory")?;
                config.memory_mb = Some(parse_number(value, "--memory")?);
            }
            "--max-attempts" => {
                let value = option_value(args, &mut i, "--max-attempts")?;
                let attempts: u32 = parse_number(value, "--max-attempts")?;
                if attempts == 0 {
                    return Err("--max-attempts must be at least 1".to_string());
                }
                config.max_attempts = Some(attempts);
            }
            arg if arg.starts_with('-') => {
                return Err(format!("Unknown option: {}", arg));
            }
            _ => {
                if config.pipeline_path.is_none() {
                    config.pipeline_path = Some(arg.clone());
                } else {
                    config.targets.push(arg.clone());
                }
            }
        }
        i += 1;
    }

    Ok(config)
}

/// Validates the working directory.
fn resolve_working_directory(
    working_dir: Option<PathBuf>,
) -> Result<PathBuf, Box<dyn std::error::Error>> {
    let Some(dir) = working_dir else {
        return Ok(env::current_dir()?);
    };

    if !dir.exists() {
        return Err(format!("Working directory does not exist: {}", dir.display()).into());
    }
    if !dir.is_dir() {
        return Err(format!("Path is not a directory: {}", dir.display()).into());
    }
    Ok(dir)
}

/// Prints the colored end-of-run summary.
fn print_summary(report: &RunReport, verbose: bool) {
    println!();
    if report.dry_run {
        println!(
            "{} {} task(s) would run",
            "DRY RUN".cyan().bold(),
            report.tasks.len()
        );
        return;
    }

    if verbose && report.dispatched > 0 {
        println!("{}", report.timeline.gantt_chart());
    }

    println!(
        "{} succeeded, {} failed, {} cancelled ({} attempt(s) in {} ms)",
        report.count(TaskState::Succeeded).to_string().green(),
        report.count(TaskState::FailedTerminal).to_string().red(),
        report.count(TaskState::Cancelled).to_string().yellow(),
        report.dispatched,
        report.elapsed_ms
    );

    for (task, error) in &report.failures {
        println!("  {} {}: {}", "FAILED".red().bold(), task, error);
    }
    for target in &report.unreachable {
        println!(
            "  {} {} ({})",
            "UNREACHABLE".yellow().bold(),
            target.target,
            target.chain.join(" -> ")
        );
    }

    println!();
    if report.is_success() {
        println!("{}", "Pipeline completed successfully".green().bold());
    } else {
        println!("{}", "Pipeline finished with failures".red().bold());
    }
}

/// Main application entry point. Returns whether the run succeeded.
fn run() -> Result<bool, Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();

    let config = parse_arguments(&args).map_err(|e| {
        eprintln!("Error: {}", e);
        eprintln!();
        print_usage();
        e
    })?;

    setup_logging(config.verbose);
    print_banner();

    if config.dry_run {
        info!("Mode: DRY RUN (commands will not execute)");
    }

    let working_dir = resolve_working_directory(config.working_dir)?;
    info!("Working directory: {}", working_dir.display());

    let pipeline_path = config
        .pipeline_path
        .unwrap_or_else(|| DEFAULT_PIPELINE.to_string());
    info!("Loading pipeline: {}", pipeline_path);
    let pipeline = load_pipeline(Path::new(&pipeline_path)).map_err(|e| {
        error!("Failed to load pipeline: {}", e);
        format!("Could not load pipeline from '{}': {}", pipeline_path, e)
    })?;

    let targets = if config.targets.is_empty() {
        pipeline.targets
    } else {
        config.targets
    };
    if targets.is_empty() {
        return Err("No targets given and the pipeline declares none".into());
    }
    info!(
        "Pipeline loaded: {} rule(s), {} target(s)",
        pipeline.registry.len(),
        targets.len()
    );

    let system = Capacity::system();
    let capacity = Capacity::new(
        config.memory_mb.unwrap_or(system.mem_mb),
        config.cores.unwrap_or(system.threads),
    );

    let mut engine = Engine::new(pipeline.registry, targets);
    engine.set_pipeline_path(&pipeline_path);
    engine.set_working_dir(working_dir);
    engine.set_capacity(capacity);
    engine.set_dry_run(config.dry_run);
    if let Some(attempts) = config.max_attempts {
        engine.set_max_attempts(attempts);
    }

    let report = engine.run()?;
    print_summary(&report, config.verbose);

    Ok(report.is_success())
}

fn main() -> ExitCode {
    match run() {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!();
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("seqflow")
            .chain(list.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn test_parse_pipeline_and_targets() {
        let config = parse_arguments(&args(&["p.yaml", "a.txt", "b.txt"])).unwrap();
        assert_eq!(config.pipeline_path.as_deref(), Some("p.yaml"));
        assert_eq!(config.targets, vec!["a.txt", "b.txt"]);
        assert!(!config.dry_run);
    }

    #[test]
    fn test_parse_options() {
        let config = parse_arguments(&args(&[
            "--dry-run",
            "--cores",
            "8",
            "--memory",
            "16000",
            "--max-attempts",
            "3",
            "--working-dir",
            "/tmp",
            "p.yaml",
        ]))
        .unwrap();
        assert!(config.dry_run);
        assert_eq!(config.cores, Some(8));
        assert_eq!(config.memory_mb, Some(16000));
        assert_eq!(config.max_attempts, Some(3));
        assert_eq!(config.working_dir, Some(PathBuf::from("/tmp")));
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse_arguments(&args(&["--cores"])).is_err());
        assert!(parse_arguments(&args(&["--cores", "zero"])).is_err());
        assert!(parse_arguments(&args(&["--cores", "0"])).is_err());
        assert!(parse_arguments(&args(&["--max-attempts", "0"])).is_err());
        assert!(parse_arguments(&args(&["--bogus"])).is_err());
    }

    #[test]
    fn test_missing_working_directory() {
        let result = resolve_working_directory(Some(PathBuf::from("/no/such/seqflow/dir")));
        assert!(result.is_err());
    }
}
