use crate::numerics::interpolate_linear;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TableParseError {
    #[error("Z-Te table has no data rows")]
    Empty,
    #[error("Z-Te table needs at least 2 rows, got {rows}")]
    TooFewRows { rows: usize },
    #[error("line {line}: non-numeric field")]
    NonNumeric { line: usize },
    #[error("line {line}: expected a temperature and at least one Z column")]
    NoZColumns { line: usize },
    #[error("line {line}: expected {expected} columns, got {actual}")]
    Ragged {
        line: usize,
        expected: usize,
        actual: usize,
    },
    #[error("line {line}: temperatures must be non-decreasing")]
    NotMonotonic { line: usize },
}

/// Mean ionization `Z` tabulated against electron temperature, one column per ion-density bracket.
#[derive(Debug, Clone, PartialEq)]
pub struct ZTeTable {
    temperatures: Vec<f64>,
    brackets: Vec<Vec<f64>>,
}

impl ZTeTable {
    pub fn new(temperatures: Vec<f64>, brackets: Vec<Vec<f64>>) -> Result<Self, TableParseError> {
        if temperatures.is_empty() {
            return Err(TableParseError::Empty);
        }
        if temperatures.len() < 2 {
            return Err(TableParseError::TooFewRows {
                rows: temperatures.len(),
            });
        }
        if brackets.is_empty() {
            return Err(TableParseError::NoZColumns { line: 1 });
        }
        for bracket in &brackets {
            if bracket.len() != temperatures.len() {
                return Err(TableParseError::Ragged {
                    line: bracket.len().min(temperatures.len()) + 1,
                    expected: temperatures.len(),
                    actual: bracket.len(),
                });
            }
        }
        if let Some(position) = temperatures.windows(2).position(|pair| pair[1] < pair[0]) {
            return Err(TableParseError::NotMonotonic { line: position + 2 });
        }
        Ok(Self {
            temperatures,
            brackets,
        })
    }

    /// Parses a whitespace-delimited table after skipping `header_lines` raw lines.
    pub fn parse(source: &str, header_lines: usize) -> Result<Self, TableParseError> {
        let mut temperatures = Vec::new();
        let mut brackets: Vec<Vec<f64>> = Vec::new();
        let mut previous: Option<f64> = None;

        for (offset, line) in source.lines().enumerate().skip(header_lines) {
            let line_number = offset + 1;
            if line.trim().is_empty() {
                continue;
            }

            let values = line
                .split_whitespace()
                .map(|token| token.parse::<f64>().ok())
                .collect::<Option<Vec<f64>>>()
                .ok_or(TableParseError::NonNumeric { line: line_number })?;
            if values.len() < 2 {
                return Err(TableParseError::NoZColumns { line: line_number });
            }
            if brackets.is_empty() {
                brackets = vec![Vec::new(); values.len() - 1];
            } else if values.len() != brackets.len() + 1 {
                return Err(TableParseError::Ragged {
                    line: line_number,
                    expected: brackets.len() + 1,
                    actual: values.len(),
                });
            }
            if previous.is_some_and(|previous| values[0] < previous) {
                return Err(TableParseError::NotMonotonic { line: line_number });
            }
            previous = Some(values[0]);

            temperatures.push(values[0]);
            for (bracket, value) in brackets.iter_mut().zip(&values[1..]) {
                bracket.push(*value);
            }
        }

        Self::new(temperatures, brackets)
    }

    pub fn temperatures(&self) -> &[f64] {
        &self.temperatures
    }

    pub fn bracket_count(&self) -> usize {
        self.brackets.len()
    }

    pub fn bracket(&self, index: usize) -> Option<&[f64]> {
        self.brackets.get(index).map(Vec::as_slice)
    }

    /// Z at `t_e` from the lowest-density bracket, linearly interpolated and clamped to the
    /// tabulated temperature range.
    pub fn ionization(&self, t_e: f64) -> Option<f64> {
        self.ionization_in(0, t_e)
    }

    pub fn ionization_in(&self, bracket: usize, t_e: f64) -> Option<f64> {
        if !t_e.is_finite() {
            return None;
        }
        interpolate_linear(t_e, &self.temperatures, self.bracket(bracket)?)
    }

    /// First tabulated `(Z, Te)` whose product reaches `zte`.
    pub fn first_reaching_zte(&self, bracket: usize, zte: f64) -> Option<(f64, f64)> {
        let column = self.bracket(bracket)?;
        self.temperatures
            .iter()
            .zip(column)
            .find(|(t_e, z)| *t_e * *z >= zte)
            .map(|(t_e, z)| (*z, *t_e))
    }

    /// Z of the first tabulated temperature at or above `t_e`.
    pub fn first_reaching_te(&self, bracket: usize, t_e: f64) -> Option<f64> {
        let column = self.bracket(bracket)?;
        self.temperatures
            .iter()
            .position(|candidate| *candidate >= t_e)
            .map(|index| column[index])
    }
}
