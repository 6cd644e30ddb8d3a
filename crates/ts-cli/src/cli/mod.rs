mod commands;
mod helpers;

use clap::error::ErrorKind;
use clap::{Parser, Subcommand};
use ts_core::domain::TsError;

const BINARY_NAME: &str = "ts-analysis";

/// Runs the process arguments and returns the exit code, printing the diagnostic on failure.
pub fn run_from_env() -> i32 {
    run(std::env::args().skip(1)).unwrap_or_else(|failure| {
        let error = failure.as_ts_error();
        eprintln!("{}", error.diagnostic_line());
        error.exit_code()
    })
}

pub fn run<I, S>(args: I) -> Result<i32, CliError>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let argv = std::iter::once(BINARY_NAME.to_string()).chain(args.into_iter().map(Into::into));
    let cli = match Cli::try_parse_from(argv) {
        Ok(cli) => cli,
        Err(clap_error)
            if matches!(
                clap_error.kind(),
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion
            ) =>
        {
            print!("{clap_error}");
            return Ok(0);
        }
        Err(clap_error) => return Err(CliError::Usage(clap_error.to_string())),
    };

    helpers::init_logging(cli.verbose);
    cli.command.execute()
}

#[derive(Parser)]
#[command(name = BINARY_NAME, about = "Thomson-scattering spectral analysis")]
struct Cli {
    /// Log optimizer and stage details (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: AnalysisCommand,
}

#[derive(Subcommand)]
enum AnalysisCommand {
    /// Preview fibre edges against a shot frame's row profile
    Edges(commands::EdgesArgs),
    /// Split, zero and pair fibres from a config and list them
    Split(commands::ConfigArgs),
    /// Run calibration and scattering fits from a config
    Fit(commands::FitArgs),
    /// Look up mean ionization in the Z-Te tables
    Ionization(commands::IonizationArgs),
}

impl AnalysisCommand {
    fn execute(self) -> Result<i32, CliError> {
        match self {
            Self::Edges(args) => commands::run_edges_command(args),
            Self::Split(args) => commands::run_split_command(args),
            Self::Fit(args) => commands::run_fit_command(args),
            Self::Ionization(args) => commands::run_ionization_command(args),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("{0}")]
    Usage(String),
    #[error(transparent)]
    Analysis(#[from] TsError),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl CliError {
    fn as_ts_error(&self) -> TsError {
        match self {
            Self::Usage(message) => TsError::configuration("CONFIG.CLI_USAGE", message.clone()),
            Self::Analysis(error) => error.clone(),
            Self::Internal(error) => TsError::io_system("IO.CLI", format!("{error:#}")),
        }
    }
}
