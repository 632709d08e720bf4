mod config;
mod signals;
mod supervisor;

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

/// Run a set of processes until they exit or Ctrl-C is pressed.
///
/// The first Ctrl-C kills the supervised processes and exits; a second one
/// terminates warden immediately.
#[derive(Parser, Debug)]
#[command(name = "warden", version, about)]
pub struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "warden.toml")]
    config: PathBuf,

    /// Validate config and print the processes that would run, don't run
    #[arg(long)]
    dry_run: bool,

    /// Extra logging (process lifecycle details)
    #[arg(short, long)]
    verbose: bool,

    /// Only warnings and errors
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,
}

/// Exit status reported when a run was ended by Ctrl-C (128 + SIGINT).
const EXIT_INTERRUPTED: u8 = 130;

/// How a run ended, when it ended without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Finish {
    Completed,
    Interrupted,
}

impl Finish {
    fn exit_status(self) -> u8 {
        match self {
            Finish::Completed => 0,
            Finish::Interrupted => EXIT_INTERRUPTED,
        }
    }
}

/// Errors that abort a run.
#[derive(Debug)]
enum RunError {
    Config(config::ConfigError),
    Registration(signals::RegistrationError),
    Supervise(supervisor::SuperviseError),
}

impl std::fmt::Display for RunError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunError::Config(e) => write!(f, "{e}"),
            RunError::Registration(e) => write!(f, "{e}"),
            RunError::Supervise(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for RunError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RunError::Config(e) => Some(e),
            RunError::Registration(e) => Some(e),
            RunError::Supervise(e) => Some(e),
        }
    }
}

impl From<config::ConfigError> for RunError {
    fn from(e: config::ConfigError) -> Self {
        RunError::Config(e)
    }
}

impl From<signals::RegistrationError> for RunError {
    fn from(e: signals::RegistrationError) -> Self {
        RunError::Registration(e)
    }
}

impl From<supervisor::SuperviseError> for RunError {
    fn from(e: supervisor::SuperviseError) -> Self {
        RunError::Supervise(e)
    }
}

fn default_log_level(cli: &Cli) -> &'static str {
    if cli.verbose {
        "debug"
    } else if cli.quiet {
        "warn"
    } else {
        "info"
    }
}

async fn run(cli: &Cli) -> Result<Finish, RunError> {
    let config = config::load(&cli.config)?;

    if cli.dry_run {
        println!("warden v{}", env!("CARGO_PKG_VERSION"));
        println!("Config file: {}", cli.config.display());
        for spec in &config.processes {
            println!("  {}: {} {}", spec.name(), spec.command, spec.args.join(" "));
        }
        println!("Dry run mode: config validated, not running.");
        return Ok(Finish::Completed);
    }

    let (token, mut release) = signals::create()?;

    let result = supervisor::supervise(&config.processes, &token).await;
    release.release();
    release.listener_exited().await;
    let report = result?;

    for outcome in &report.outcomes {
        tracing::debug!(
            name = %outcome.name,
            pid = outcome.pid,
            status = %outcome.status,
            cancelled = outcome.cancelled,
            "process outcome"
        );
    }
    if release.was_interrupted() {
        Ok(Finish::Interrupted)
    } else {
        Ok(Finish::Completed)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_log_level(&cli))),
        )
        .with_target(false)
        .with_thread_ids(false)
        .init();

    tracing::debug!(?cli, "parsed CLI arguments");

    match run(&cli).await {
        Ok(finish) => ExitCode::from(finish.exit_status()),
        Err(e) => {
            tracing::error!(error = %e, "warden failed");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::try_parse_from(["warden"]).unwrap();
        assert_eq!(cli.config, PathBuf::from("warden.toml"));
        assert!(!cli.dry_run);
        assert_eq!(default_log_level(&cli), "info");
    }

    #[test]
    fn test_cli_flags() {
        let cli = Cli::try_parse_from(["warden", "-c", "/etc/warden.toml", "--dry-run", "-v"])
            .unwrap();
        assert_eq!(cli.config, PathBuf::from("/etc/warden.toml"));
        assert!(cli.dry_run);
        assert_eq!(default_log_level(&cli), "debug");

        let cli = Cli::try_parse_from(["warden", "--quiet"]).unwrap();
        assert_eq!(default_log_level(&cli), "warn");
    }

    #[test]
    fn test_verbose_and_quiet_conflict() {
        assert!(Cli::try_parse_from(["warden", "-v", "-q"]).is_err());
    }

    #[tokio::test]
    async fn test_dry_run_accepts_valid_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("warden.toml");
        std::fs::write(&path, "[[process]]\ncommand = \"etcd\"\n").unwrap();
        let cli = Cli::try_parse_from(["warden", "--dry-run", "-c", path.to_str().unwrap()])
            .unwrap();

        assert_eq!(run(&cli).await.unwrap(), Finish::Completed);
    }

    #[tokio::test]
    async fn test_dry_run_rejects_config_without_processes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("warden.toml");
        std::fs::write(&path, "process = []\n").unwrap();
        let cli = Cli::try_parse_from(["warden", "--dry-run", "-c", path.to_str().unwrap()])
            .unwrap();

        let err = run(&cli).await.unwrap_err();
        assert!(matches!(
            err,
            RunError::Config(config::ConfigError::NoProcesses { .. })
        ));
    }

    #[test]
    fn test_exit_status() {
        assert_eq!(Finish::Completed.exit_status(), 0);
        assert_eq!(Finish::Interrupted.exit_status(), 130);
    }
}
