use crate::domain::{TsError, TsResult};
use crate::fibre::Fibre;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

pub const EXPORT_COLUMNS: [&str; 5] = ["Wavelength shift", "Background", "Response", "Shot", "Fit"];
pub const EXPORT_UNITS: [&str; 5] = ["Angstroms", "a.u.", "a.u.", "a.u.", "a.u."];
pub const METRES_TO_ANGSTROMS: f64 = 1.0e10;
pub const REPORT_FILE_NAME: &str = "report.json";

const DELIMITER: char = ',';

/// Per-sample columns of a fitted fibre, shift already in angstroms.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportTable {
    pub shift_angstroms: Vec<f64>,
    pub background: Vec<f64>,
    pub response: Vec<f64>,
    pub shot: Vec<f64>,
    pub fit: Vec<f64>,
}

impl ExportTable {
    pub fn from_fibre(fibre: &Fibre) -> TsResult<Self> {
        let shift = fibre.shift().ok_or_else(|| {
            TsError::missing_dependency(
                "EXPORT.STAGE",
                format!("fibre {} has not been cropped", fibre.label()),
            )
        })?;
        let response = fibre.response().ok_or_else(|| {
            TsError::missing_dependency(
                "EXPORT.STAGE",
                format!("fibre {} has no response", fibre.label()),
            )
        })?;
        let fit = fibre.fit().ok_or_else(|| {
            TsError::missing_dependency(
                "EXPORT.STAGE",
                format!("fibre {} has not been fitted", fibre.label()),
            )
        })?;

        let table = Self {
            shift_angstroms: shift.iter().map(|value| value * METRES_TO_ANGSTROMS).collect(),
            background: fibre.background().to_vec(),
            response: response.to_vec(),
            shot: fibre.shot().to_vec(),
            fit: fit.best_fit.clone(),
        };
        table.validate()?;
        Ok(table)
    }

    pub fn len(&self) -> usize {
        self.shift_angstroms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shift_angstroms.is_empty()
    }

    pub fn render(&self) -> TsResult<String> {
        self.validate()?;

        let mut content = String::new();
        content.push_str(&EXPORT_COLUMNS.join(","));
        content.push('\n');
        content.push_str(&EXPORT_UNITS.join(","));
        content.push('\n');
        for row in 0..self.len() {
            let line = [
                self.shift_angstroms[row],
                self.background[row],
                self.response[row],
                self.shot[row],
                self.fit[row],
            ]
            .iter()
            .map(|value| value.to_string())
            .collect::<Vec<_>>()
            .join(",");
            content.push_str(&line);
            content.push('\n');
        }
        Ok(content)
    }

    pub fn parse(source: &str) -> TsResult<Self> {
        let normalized = normalize_text_artifact(source);
        let mut lines = normalized.lines();

        let header = lines.next().unwrap_or_default();
        if split_fields(header) != EXPORT_COLUMNS {
            return Err(TsError::data_shape(
                "EXPORT.HEADER",
                format!("unexpected export header '{header}'"),
            ));
        }
        let units = lines.next().unwrap_or_default();
        if split_fields(units) != EXPORT_UNITS {
            return Err(TsError::data_shape(
                "EXPORT.HEADER",
                format!("unexpected export units '{units}'"),
            ));
        }

        let mut columns: [Vec<f64>; 5] = Default::default();
        for (offset, line) in lines.enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let fields = split_fields(line);
            if fields.len() != EXPORT_COLUMNS.len() {
                return Err(TsError::data_shape(
                    "EXPORT.ROW",
                    format!(
                        "line {} has {} fields, expected {}",
                        offset + 3,
                        fields.len(),
                        EXPORT_COLUMNS.len()
                    ),
                ));
            }
            for (column, field) in columns.iter_mut().zip(fields) {
                let value = field.parse::<f64>().map_err(|_| {
                    TsError::data_shape(
                        "EXPORT.ROW",
                        format!("line {}: '{}' is not a number", offset + 3, field),
                    )
                })?;
                column.push(value);
            }
        }

        let [shift_angstroms, background, response, shot, fit] = columns;
        Ok(Self {
            shift_angstroms,
            background,
            response,
            shot,
            fit,
        })
    }

    fn validate(&self) -> TsResult<()> {
        let expected = self.len();
        let lengths = [
            self.background.len(),
            self.response.len(),
            self.shot.len(),
            self.fit.len(),
        ];
        if lengths.iter().any(|length| *length != expected) {
            return Err(TsError::data_shape(
                "EXPORT.LENGTH",
                format!("export columns {lengths:?} do not match {expected} shift samples"),
            ));
        }
        Ok(())
    }
}

fn split_fields(line: &str) -> Vec<&str> {
    line.split(DELIMITER).map(str::trim).collect()
}

/// `<shot> fit dat files/<shot>_<label>_data_and_fit.dat`, relative to an output directory.
pub fn export_relative_path(shot_name: &str, fibre_label: &str) -> PathBuf {
    PathBuf::from(format!("{shot_name} fit dat files"))
        .join(format!("{shot_name}_{fibre_label}_data_and_fit.dat"))
}

pub fn normalize_text_artifact(content: &str) -> String {
    let mut normalized = content.replace("\r\n", "\n").replace('\r', "\n");
    if !normalized.is_empty() && !normalized.ends_with('\n') {
        normalized.push('\n');
    }
    normalized
}

pub fn write_text_artifact(path: &Path, content: &str) -> TsResult<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|source| {
                TsError::io_system(
                    "IO.OUTPUT_CREATE",
                    format!("failed to create '{}': {}", parent.display(), source),
                )
            })?;
        }
    }
    fs::write(path, normalize_text_artifact(content)).map_err(|source| {
        TsError::io_system(
            "IO.OUTPUT_WRITE",
            format!("failed to write '{}': {}", path.display(), source),
        )
    })
}

pub fn write_export(path: &Path, table: &ExportTable) -> TsResult<()> {
    write_text_artifact(path, &table.render()?)
}

pub fn read_export(path: &Path) -> TsResult<ExportTable> {
    let source = fs::read_to_string(path).map_err(|source| {
        TsError::io_system(
            "IO.EXPORT_READ",
            format!("failed to read '{}': {}", path.display(), source),
        )
    })?;
    ExportTable::parse(&source)
}

pub fn write_json_report<T: Serialize + ?Sized>(path: &Path, report: &T) -> TsResult<()> {
    let content = serde_json::to_string_pretty(report).map_err(|source| {
        TsError::internal(
            "REPORT.SERIALIZE",
            format!("failed to serialize report: {source}"),
        )
    })?;
    write_text_artifact(path, &content)
}

#[cfg(test)]
mod tests {
    use super::{
        ExportTable, export_relative_path, normalize_text_artifact, read_export, write_export,
        write_text_artifact,
    };
    use crate::domain::TsErrorCategory;
    use std::fs;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn table() -> ExportTable {
        ExportTable {
            shift_angstroms: vec![-2.5, 0.0, 2.5],
            background: vec![1.0, 10.0, 1.0],
            response: vec![0.9, 9.5, 0.9],
            shot: vec![0.25, 3.0, 0.5],
            fit: vec![0.3, 2.9, 0.45],
        }
    }

    #[test]
    fn rendered_table_starts_with_header_and_units() {
        let content = table().render().expect("render");
        let mut lines = content.lines();
        assert_eq!(
            lines.next(),
            Some("Wavelength shift,Background,Response,Shot,Fit")
        );
        assert_eq!(lines.next(), Some("Angstroms,a.u.,a.u.,a.u.,a.u."));
        assert_eq!(lines.next(), Some("-2.5,1,0.9,0.25,0.3"));
        assert_eq!(content.lines().count(), 5);
    }

    #[test]
    fn export_round_trip_reproduces_columns() {
        let temp = TempDir::new().expect("tempdir should be created");
        let path = temp
            .path()
            .join(export_relative_path("shot0001", "3A"));

        write_export(&path, &table()).expect("export should be written");
        let restored = read_export(&path).expect("export should be readable");
        assert_eq!(restored, table());
    }

    #[test]
    fn export_path_follows_shot_naming() {
        assert_eq!(
            export_relative_path("s0415_01", "2B"),
            PathBuf::from("s0415_01 fit dat files").join("s0415_01_2B_data_and_fit.dat")
        );
    }

    #[test]
    fn mismatched_columns_are_rejected() {
        let mut table = table();
        table.fit.pop();
        let error = table.render().expect_err("length mismatch");
        assert_eq!(error.category(), TsErrorCategory::DataShape);
    }

    #[test]
    fn parse_rejects_foreign_headers() {
        let error = ExportTable::parse("a,b,c\n1,2,3\n").expect_err("wrong header");
        assert_eq!(error.code(), "EXPORT.HEADER");
    }

    #[test]
    fn text_artifacts_use_canonical_line_endings() {
        assert_eq!(normalize_text_artifact("alpha\r\nbeta\rgamma"), "alpha\nbeta\ngamma\n");

        let temp = TempDir::new().expect("tempdir should be created");
        let path = temp.path().join("nested").join("artifact.dat");
        write_text_artifact(&path, "line 1\r\nline 2").expect("write should succeed");
        assert_eq!(fs::read(&path).expect("readable"), b"line 1\nline 2\n");
    }
}
