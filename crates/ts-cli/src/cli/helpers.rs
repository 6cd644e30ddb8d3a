use super::CliError;
use anyhow::Context;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;
use ts_core::config::{AnalysisConfig, load_analysis_config};
use ts_core::domain::ExecutionMode;

/// Stderr logging; `RUST_LOG` wins over `--verbose`.
pub(super) fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

pub(super) fn load_config(
    path: &Path,
    output: Option<PathBuf>,
    execution: Option<ExecutionMode>,
) -> Result<AnalysisConfig, CliError> {
    let mut config = load_analysis_config(path).map_err(|error| CliError::Analysis(error.into()))?;
    if let Some(output) = output {
        config.output.directory = output;
    }
    if let Some(execution) = execution {
        config.execution = execution;
    }
    config.validate()?;
    Ok(config)
}

pub(super) fn shot_path(config: &AnalysisConfig) -> Result<&Path, CliError> {
    config
        .input
        .shot
        .as_deref()
        .ok_or_else(|| CliError::Usage("the config does not name a shot file".to_string()))
}

pub(super) fn write_json_stdout<T: serde::Serialize>(value: &T) -> Result<(), CliError> {
    let rendered =
        serde_json::to_string_pretty(value).context("failed to render JSON output")?;
    println!("{rendered}");
    Ok(())
}

pub(super) fn format_optional(value: Option<f64>) -> String {
    value.map_or_else(|| "-".to_string(), |value| format!("{value:.4E}"))
}

pub(super) fn parse_execution(value: &str) -> Result<ExecutionMode, String> {
    match value.trim().to_ascii_lowercase().as_str() {
        "serial" => Ok(ExecutionMode::Serial),
        "parallel" => Ok(ExecutionMode::Parallel),
        other => Err(format!("unknown execution mode '{other}' (serial | parallel)")),
    }
}

#[cfg(test)]
mod tests {
    use super::{format_optional, parse_execution};
    use ts_core::domain::ExecutionMode;

    #[test]
    fn execution_modes_parse_case_insensitively() {
        assert_eq!(parse_execution("Parallel"), Ok(ExecutionMode::Parallel));
        assert_eq!(parse_execution("serial"), Ok(ExecutionMode::Serial));
        assert!(parse_execution("gpu").is_err());
    }

    #[test]
    fn optional_values_render_placeholder() {
        assert_eq!(format_optional(None), "-");
        assert_eq!(format_optional(Some(1250.0)), "1.2500E3");
    }
}
