use super::RawFrame;
use crate::domain::{TsError, TsResult};
use crate::numerics::DenseMatrix;
use globset::Glob;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

const SHOT_NAME_LENGTH: usize = 8;

#[derive(Debug, Clone)]
pub struct LoadedFrames {
    pub shot_name: String,
    pub shot: RawFrame,
    /// Element-wise sum of every background exposure; all zeros when none were given.
    pub background: RawFrame,
}

/// Loads a shot, sums its backgrounds and optionally borrows the wavelength axis of a
/// calibration file.
pub fn load_frames(
    shot: &Path,
    backgrounds: &[PathBuf],
    calibration: Option<&Path>,
    skip_footer: usize,
) -> TsResult<LoadedFrames> {
    let mut shot_frame = read_frame(shot, skip_footer)?;
    if let Some(calibration) = calibration {
        let axis = read_frame(calibration, 0)?.axis().to_vec();
        shot_frame = shot_frame.with_axis(axis)?;
    }

    let mut background = RawFrame::zeros(shot_frame.rows(), shot_frame.axis().to_vec());
    for path in backgrounds {
        let frame = read_frame(path, skip_footer)?;
        background
            .accumulate(&frame)
            .map_err(|error| error.with_context(format_args!("background '{}'", path.display())))?;
    }

    info!(
        shot = %shot.display(),
        rows = shot_frame.rows(),
        columns = shot_frame.columns(),
        backgrounds = backgrounds.len(),
        "loaded detector frames"
    );

    Ok(LoadedFrames {
        shot_name: shot_name(shot),
        shot: shot_frame,
        background,
    })
}

/// First eight characters of the file's base name.
pub fn shot_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().chars().take(SHOT_NAME_LENGTH).collect())
        .unwrap_or_default()
}

/// Files in `directory` whose names match `pattern`, sorted by path.
pub fn discover_backgrounds(directory: &Path, pattern: &str) -> TsResult<Vec<PathBuf>> {
    let matcher = Glob::new(pattern)
        .map_err(|source| {
            TsError::configuration(
                "CONFIG.BACKGROUND_GLOB",
                format!("invalid background glob '{pattern}': {source}"),
            )
        })?
        .compile_matcher();

    let entries = fs::read_dir(directory).map_err(|source| {
        TsError::io_system(
            "IO.BACKGROUND_DIRECTORY",
            format!(
                "failed to list background directory '{}': {}",
                directory.display(),
                source
            ),
        )
    })?;

    let mut matches = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| {
            TsError::io_system(
                "IO.BACKGROUND_DIRECTORY",
                format!(
                    "failed to read entry in '{}': {}",
                    directory.display(),
                    source
                ),
            )
        })?;
        let path = entry.path();
        if path.is_file() && entry.file_name().to_str().is_some_and(|name| matcher.is_match(name)) {
            matches.push(path);
        }
    }
    matches.sort();
    Ok(matches)
}

fn read_frame(path: &Path, skip_footer: usize) -> TsResult<RawFrame> {
    let source = fs::read_to_string(path).map_err(|source| {
        TsError::io_system(
            "IO.FRAME_READ",
            format!("failed to read frame '{}': {}", path.display(), source),
        )
    })?;
    parse_asc(&source, skip_footer).map_err(|error| error.with_context(path.display()))
}

/// Parses a tab-delimited spectrometer export.
///
/// Each line holds one wavelength sample: the axis value followed by one intensity per detector
/// row. A trailing tab is tolerated. The matrix is rotated a quarter turn counter-clockwise, so
/// frame row `r` is intensity column `ncols - 1 - r`.
pub fn parse_asc(source: &str, skip_footer: usize) -> TsResult<RawFrame> {
    let lines: Vec<(usize, &str)> = source
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .collect();
    let kept = lines.len().saturating_sub(skip_footer);
    if kept == 0 {
        return Err(TsError::data_shape(
            "FRAME.EMPTY",
            "frame file contains no data lines",
        ));
    }

    let mut axis = Vec::with_capacity(kept);
    let mut samples: Vec<Vec<f64>> = Vec::with_capacity(kept);
    for &(line_index, line) in &lines[..kept] {
        let mut fields: Vec<&str> = line.split('\t').collect();
        if fields.len() > 1 && fields.last().is_some_and(|field| field.trim().is_empty()) {
            fields.pop();
        }

        let values = fields
            .iter()
            .map(|field| parse_field(field))
            .collect::<Option<Vec<f64>>>()
            .ok_or_else(|| {
                TsError::data_shape(
                    "FRAME.PARSE",
                    format!("line {} contains a non-numeric field", line_index + 1),
                )
            })?;

        let expected = samples.first().map(|first| first.len() + 1);
        if expected.is_some_and(|expected| expected != values.len()) {
            return Err(TsError::data_shape(
                "FRAME.RAGGED",
                format!(
                    "line {} has {} fields, expected {}",
                    line_index + 1,
                    values.len(),
                    expected.unwrap_or_default()
                ),
            ));
        }
        if values.len() < 2 {
            return Err(TsError::data_shape(
                "FRAME.PARSE",
                format!("line {} has no intensity columns", line_index + 1),
            ));
        }

        axis.push(values[0]);
        samples.push(values[1..].to_vec());
    }

    let detector_rows = samples[0].len();
    let mut intensities = DenseMatrix::zeros(detector_rows, samples.len());
    for (column, sample) in samples.iter().enumerate() {
        for (source_column, value) in sample.iter().enumerate() {
            intensities[(detector_rows - 1 - source_column, column)] = *value;
        }
    }

    RawFrame::new(intensities, axis)
}

fn parse_field(field: &str) -> Option<f64> {
    let trimmed = field.trim();
    if trimmed.is_empty() {
        return None;
    }
    trimmed.parse::<f64>().ok()
}
