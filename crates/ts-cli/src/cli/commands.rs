use super::CliError;
use super::helpers::*;
use std::path::PathBuf;
use ts_core::domain::ExecutionMode;
use ts_core::frame::{DEFAULT_EDGE_OFFSET, DEFAULT_EDGE_SPACING, discover_backgrounds};
use ts_core::ionization::{DEFAULT_Z_GUESS, Element, IonizationTables, z_finder, z_te_finder};
use ts_core::session::{TsAnalysis, run_configured_analysis};

#[derive(clap::Args)]
pub(super) struct EdgesArgs {
    /// Shot frame (tab-delimited .asc)
    #[arg(long)]
    shot: PathBuf,

    /// Trailing lines to drop from the frame file
    #[arg(long, default_value_t = 0)]
    skip_footer: usize,

    /// Rows between fibre edges
    #[arg(long, default_value_t = DEFAULT_EDGE_SPACING)]
    spacing: f64,

    /// Row of the first edge
    #[arg(long, default_value_t = DEFAULT_EDGE_OFFSET)]
    offset: f64,

    /// First wavelength column of the row profile
    #[arg(long, default_value_t = 950)]
    column_start: usize,

    /// End (exclusive) wavelength column of the row profile
    #[arg(long, default_value_t = 1100)]
    column_end: usize,

    /// Print the row profile alongside the edges
    #[arg(long)]
    profile: bool,
}

#[derive(clap::Args)]
pub(super) struct ConfigArgs {
    /// Analysis config (JSON)
    #[arg(long)]
    config: PathBuf,
}

#[derive(clap::Args)]
pub(super) struct FitArgs {
    /// Analysis config (JSON)
    #[arg(long)]
    config: PathBuf,

    /// Output directory for exports and report.json
    #[arg(long)]
    output: Option<PathBuf>,

    /// Fibre scheduling: serial or parallel
    #[arg(long, value_parser = parse_execution)]
    execution: Option<ExecutionMode>,
}

#[derive(clap::Args)]
pub(super) struct IonizationArgs {
    /// Directory holding zb_C.dat, zb_Al.dat and zb_W.dat
    #[arg(long)]
    tables: PathBuf,

    /// Element symbol (C, Al, W)
    #[arg(long)]
    element: String,

    /// Electron density (m^-3)
    #[arg(long)]
    n_e: f64,

    /// Measured electron temperature (eV)
    #[arg(long, conflicts_with = "zte", required_unless_present = "zte")]
    te: Option<f64>,

    /// Measured Z*Te product (eV)
    #[arg(long)]
    zte: Option<f64>,

    /// Starting Z used to pick the density bracket
    #[arg(long, default_value_t = DEFAULT_Z_GUESS)]
    z_guess: f64,
}

pub(super) fn run_edges_command(args: EdgesArgs) -> Result<i32, CliError> {
    if args.column_start > args.column_end {
        return Err(CliError::Usage(format!(
            "--column-start {} exceeds --column-end {}",
            args.column_start, args.column_end
        )));
    }
    let mut analysis = TsAnalysis::load(&args.shot, &[], None, args.skip_footer)?;
    let profile = analysis.edge_profile(args.column_start..args.column_end);
    let edges = analysis.find_fibre_edges(args.spacing, args.offset)?.to_vec();

    println!("Shot: {}", analysis.shot_name());
    println!(
        "Edges ({} fibres): {}",
        edges.len().saturating_sub(1),
        edges
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    );
    if args.profile {
        println!("row\tintensity\tedge");
        for (row, value) in profile.iter().enumerate() {
            let marker = if edges.contains(&row) { "*" } else { "" };
            println!("{row}\t{value}\t{marker}");
        }
    }
    Ok(0)
}

pub(super) fn run_split_command(args: ConfigArgs) -> Result<i32, CliError> {
    let config = load_config(&args.config, None, None)?;
    let mut backgrounds = config.input.backgrounds.clone();
    if let Some((directory, pattern)) = config.background_search() {
        backgrounds.extend(discover_backgrounds(&directory, &pattern)?);
    }

    let mut analysis = TsAnalysis::load(
        shot_path(&config)?,
        &backgrounds,
        config.input.calibration.as_deref(),
        config.input.skip_footer,
    )?;
    analysis.find_fibre_edges(config.edges.spacing, config.edges.offset)?;
    analysis.split_fibres(config.split.discard_rows)?;
    analysis.zero_fibres(config.window.range())?;
    analysis.pair_fibres(&config.angles.set_a, &config.angles.set_b)?;
    for patch in &config.background_patches {
        analysis.copy_background(patch.good, patch.bad)?;
    }

    println!("Shot: {}", analysis.shot_name());
    println!("fibre\ttheta_deg\tsamples\tS_T");
    for fibre in analysis.fibres() {
        println!(
            "{}\t{:.3}\t{}\t{:.6E}",
            fibre.label(),
            fibre.theta().to_degrees(),
            fibre.wavelength().len(),
            fibre.scattered_amplitude()
        );
    }
    Ok(0)
}

pub(super) fn run_fit_command(args: FitArgs) -> Result<i32, CliError> {
    let config = load_config(&args.config, args.output, args.execution)?;
    let outcome = run_configured_analysis(&config)?;

    println!("Shot: {}", outcome.report.shot_name);
    println!("fibre\tstage\tl0_m\tT_e\tT_i\tchi2\talpha");
    for fibre in &outcome.report.fibres {
        let parameters = fibre.fit.as_ref().map(|fit| fit.parameters);
        println!(
            "{}\t{}\t{}\t{}\t{}\t{}\t{}",
            fibre.label,
            fibre.stage,
            format_optional(fibre.calibration.as_ref().map(|calibration| calibration.l0())),
            format_optional(parameters.map(|parameters| parameters.t_e)),
            format_optional(parameters.map(|parameters| parameters.t_i)),
            format_optional(fibre.fit.as_ref().map(|fit| fit.chi_square)),
            format_optional(fibre.derived.alpha),
        );
    }
    for path in &outcome.exports {
        println!("Export: {}", path.display());
    }
    if let Some(path) = &outcome.report_path {
        println!("JSON report: {}", path.display());
    }

    if outcome.report.failures.is_empty() {
        return Ok(0);
    }
    for failure in &outcome.report.failures {
        eprintln!("ERROR: [{}] {}", failure.code, failure.message);
    }
    Ok(1)
}

pub(super) fn run_ionization_command(args: IonizationArgs) -> Result<i32, CliError> {
    let element = Element::from_symbol(&args.element).ok_or_else(|| {
        CliError::Usage(format!(
            "unknown element '{}'; expected one of C, Al, W",
            args.element
        ))
    })?;
    let tables = IonizationTables::new(&args.tables);
    let estimate = match (args.te, args.zte) {
        (Some(t_e), _) => z_finder(&tables, element, args.n_e, t_e, args.z_guess)?,
        (None, Some(zte)) => z_te_finder(&tables, element, args.n_e, zte, args.z_guess)?,
        (None, None) => {
            return Err(CliError::Usage("one of --te or --zte is required".to_string()));
        }
    };
    write_json_stdout(&estimate)?;
    Ok(0)
}
