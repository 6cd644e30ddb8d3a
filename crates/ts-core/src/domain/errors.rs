use std::error::Error;
use std::fmt::{Display, Formatter};

pub type TsResult<T> = Result<T, TsError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TsErrorCategory {
    Configuration,
    DataShape,
    NumericalConvergence,
    MissingDependency,
    IoSystem,
    Internal,
}

impl TsErrorCategory {
    pub const fn exit_code(self) -> i32 {
        match self {
            Self::Configuration => 2,
            Self::DataShape => 3,
            Self::NumericalConvergence => 4,
            Self::MissingDependency => 5,
            Self::IoSystem => 6,
            Self::Internal => 7,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Configuration => "ConfigurationError",
            Self::DataShape => "DataShapeError",
            Self::NumericalConvergence => "NumericalConvergenceError",
            Self::MissingDependency => "MissingDependencyError",
            Self::IoSystem => "IoSystemError",
            Self::Internal => "InternalError",
        }
    }
}

/// Optimizer state at the moment a fit was abandoned.
#[derive(Debug, Clone, PartialEq)]
pub struct ConvergenceDiagnostics {
    pub iterations: usize,
    pub chi_square: f64,
    pub parameter_names: Vec<String>,
    pub parameter_values: Vec<f64>,
}

impl Display for ConvergenceDiagnostics {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "after {} iterations, chi2={:.6E}",
            self.iterations, self.chi_square
        )?;
        for (name, value) in self.parameter_names.iter().zip(&self.parameter_values) {
            write!(f, ", {}={:.6E}", name, value)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TsError {
    category: TsErrorCategory,
    code: &'static str,
    message: String,
    diagnostics: Option<Box<ConvergenceDiagnostics>>,
}

impl TsError {
    pub fn new(category: TsErrorCategory, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            category,
            code,
            message: message.into(),
            diagnostics: None,
        }
    }

    pub fn configuration(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(TsErrorCategory::Configuration, code, message)
    }

    pub fn data_shape(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(TsErrorCategory::DataShape, code, message)
    }

    pub fn convergence(
        code: &'static str,
        message: impl Into<String>,
        diagnostics: ConvergenceDiagnostics,
    ) -> Self {
        let mut error = Self::new(TsErrorCategory::NumericalConvergence, code, message);
        error.diagnostics = Some(Box::new(diagnostics));
        error
    }

    pub fn missing_dependency(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(TsErrorCategory::MissingDependency, code, message)
    }

    pub fn io_system(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(TsErrorCategory::IoSystem, code, message)
    }

    pub fn internal(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(TsErrorCategory::Internal, code, message)
    }

    /// Prefixes the message, keeping category, code and diagnostics.
    pub fn with_context(mut self, context: impl Display) -> Self {
        self.message = format!("{}: {}", context, self.message);
        self
    }

    pub const fn category(&self) -> TsErrorCategory {
        self.category
    }

    pub const fn code(&self) -> &'static str {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn diagnostics(&self) -> Option<&ConvergenceDiagnostics> {
        self.diagnostics.as_deref()
    }

    pub const fn exit_code(&self) -> i32 {
        self.category.exit_code()
    }

    pub fn diagnostic_line(&self) -> String {
        match &self.diagnostics {
            Some(diagnostics) => format!(
                "ERROR: [{}] {} ({})",
                self.code, self.message, diagnostics
            ),
            None => format!("ERROR: [{}] {}", self.code, self.message),
        }
    }
}

impl Display for TsError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} [{}] {}",
            self.category.as_str(),
            self.code,
            self.message
        )
    }
}

impl Error for TsError {}

#[cfg(test)]
mod tests {
    use super::{ConvergenceDiagnostics, TsError, TsErrorCategory};

    #[test]
    fn exit_codes_are_stable_per_category() {
        let cases = [
            (TsErrorCategory::Configuration, 2, "ConfigurationError"),
            (TsErrorCategory::DataShape, 3, "DataShapeError"),
            (
                TsErrorCategory::NumericalConvergence,
                4,
                "NumericalConvergenceError",
            ),
            (TsErrorCategory::MissingDependency, 5, "MissingDependencyError"),
            (TsErrorCategory::IoSystem, 6, "IoSystemError"),
            (TsErrorCategory::Internal, 7, "InternalError"),
        ];

        for (category, exit_code, name) in cases {
            assert_eq!(category.exit_code(), exit_code);
            assert_eq!(category.as_str(), name);
        }
    }

    #[test]
    fn configuration_error_renders_diagnostic_line() {
        let error = TsError::configuration("CONFIG.ZTE_TABLE", "no data available for A=14");
        assert_eq!(error.exit_code(), 2);
        assert_eq!(
            error.diagnostic_line(),
            "ERROR: [CONFIG.ZTE_TABLE] no data available for A=14"
        );
        assert_eq!(
            error.to_string(),
            "ConfigurationError [CONFIG.ZTE_TABLE] no data available for A=14"
        );
        assert!(error.diagnostics().is_none());
    }

    #[test]
    fn convergence_error_keeps_last_optimizer_state() {
        let error = TsError::convergence(
            "FIT.NOT_CONVERGED",
            "scattering fit did not converge",
            ConvergenceDiagnostics {
                iterations: 200,
                chi_square: 12.5,
                parameter_names: vec!["T_e".to_string()],
                parameter_values: vec![40.0],
            },
        );

        let diagnostics = error.diagnostics().expect("diagnostics should be attached");
        assert_eq!(diagnostics.iterations, 200);
        assert_eq!(error.category(), TsErrorCategory::NumericalConvergence);
        assert!(error.diagnostic_line().contains("T_e=4.000000E1"));
    }
}
