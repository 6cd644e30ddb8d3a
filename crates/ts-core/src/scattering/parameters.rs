use crate::domain::{TsError, TsResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt::{Display, Formatter};
use tracing::warn;

pub const MODEL_KEY: &str = "model";

/// Physical inputs of a scattering lineshape, in fit order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ParameterName {
    ElectronDensity,
    ElectronTemperature,
    ElectronFlow,
    MassNumber,
    IonTemperature,
    IonFlow,
    Stray,
    Amplitude,
    Offset,
    Shift,
}

impl ParameterName {
    pub const ALL: [ParameterName; 10] = [
        Self::ElectronDensity,
        Self::ElectronTemperature,
        Self::ElectronFlow,
        Self::MassNumber,
        Self::IonTemperature,
        Self::IonFlow,
        Self::Stray,
        Self::Amplitude,
        Self::Offset,
        Self::Shift,
    ];

    pub const fn key(self) -> &'static str {
        match self {
            Self::ElectronDensity => "n_e",
            Self::ElectronTemperature => "T_e",
            Self::ElectronFlow => "V_fe",
            Self::MassNumber => "A",
            Self::IonTemperature => "T_i",
            Self::IonFlow => "V_fi",
            Self::Stray => "stray",
            Self::Amplitude => "amplitude",
            Self::Offset => "offset",
            Self::Shift => "shift",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|name| name.key() == key)
    }
}

impl Display for ParameterName {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str((*self).key())
    }
}

/// `(value, is_independent, optional_min)`; independent entries are held fixed.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
#[serde(from = "RawEntry")]
pub struct ParameterEntry {
    pub value: f64,
    pub independent: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
}

impl ParameterEntry {
    pub const fn fixed(value: f64) -> Self {
        Self {
            value,
            independent: true,
            min: None,
        }
    }

    pub const fn free(value: f64, min: Option<f64>) -> Self {
        Self {
            value,
            independent: false,
            min,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawEntry {
    Pair(f64, bool),
    Triple(f64, bool, Option<f64>),
    Object {
        value: f64,
        #[serde(default)]
        independent: bool,
        #[serde(default)]
        min: Option<f64>,
    },
}

impl From<RawEntry> for ParameterEntry {
    fn from(raw: RawEntry) -> Self {
        match raw {
            RawEntry::Pair(value, independent) => Self {
                value,
                independent,
                min: None,
            },
            RawEntry::Triple(value, independent, min) => Self {
                value,
                independent,
                min,
            },
            RawEntry::Object {
                value,
                independent,
                min,
            } => Self {
                value,
                independent,
                min,
            },
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawModel {
    Name(String),
    Pair(String, bool),
    Object {
        name: String,
        #[serde(default = "independent_by_default")]
        independent: bool,
    },
}

fn independent_by_default() -> bool {
    true
}

/// Validated parameter set with exactly the recognized entries.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParameterSpecification {
    pub model: String,
    #[serde(rename = "n_e")]
    pub n_e: ParameterEntry,
    #[serde(rename = "T_e")]
    pub t_e: ParameterEntry,
    #[serde(rename = "V_fe")]
    pub v_fe: ParameterEntry,
    #[serde(rename = "A")]
    pub a: ParameterEntry,
    #[serde(rename = "T_i")]
    pub t_i: ParameterEntry,
    #[serde(rename = "V_fi")]
    pub v_fi: ParameterEntry,
    pub stray: ParameterEntry,
    pub amplitude: ParameterEntry,
    pub offset: ParameterEntry,
    pub shift: ParameterEntry,
}

impl ParameterSpecification {
    /// Builds from a flat key → entry mapping. Missing keys are configuration errors;
    /// unrecognized keys are ignored.
    pub fn from_map(map: &Map<String, Value>) -> TsResult<Self> {
        for key in map.keys() {
            if key != MODEL_KEY && ParameterName::from_key(key).is_none() {
                warn!(key = %key, "ignoring unrecognized fit parameter");
            }
        }

        let model_value = map.get(MODEL_KEY).ok_or_else(|| missing(MODEL_KEY))?;
        let (model, independent) = match serde_json::from_value::<RawModel>(model_value.clone())
            .map_err(|source| invalid(MODEL_KEY, &source))?
        {
            RawModel::Name(name) => (name, true),
            RawModel::Pair(name, independent) => (name, independent),
            RawModel::Object { name, independent } => (name, independent),
        };
        if !independent {
            return Err(TsError::configuration(
                "CONFIG.PARAMETER_MODEL",
                "the 'model' entry names a lineshape and must be independent",
            ));
        }

        let entry = |name: ParameterName| -> TsResult<ParameterEntry> {
            let value = map.get(name.key()).ok_or_else(|| missing(name.key()))?;
            let entry: ParameterEntry = serde_json::from_value(value.clone())
                .map_err(|source| invalid(name.key(), &source))?;
            if !entry.value.is_finite() || entry.min.is_some_and(|min| !min.is_finite()) {
                return Err(TsError::configuration(
                    "CONFIG.PARAMETER_VALUE",
                    format!("fit parameter '{}' must be finite", name.key()),
                ));
            }
            Ok(entry)
        };

        Ok(Self {
            model,
            n_e: entry(ParameterName::ElectronDensity)?,
            t_e: entry(ParameterName::ElectronTemperature)?,
            v_fe: entry(ParameterName::ElectronFlow)?,
            a: entry(ParameterName::MassNumber)?,
            t_i: entry(ParameterName::IonTemperature)?,
            v_fi: entry(ParameterName::IonFlow)?,
            stray: entry(ParameterName::Stray)?,
            amplitude: entry(ParameterName::Amplitude)?,
            offset: entry(ParameterName::Offset)?,
            shift: entry(ParameterName::Shift)?,
        })
    }

    pub fn from_value(value: &Value) -> TsResult<Self> {
        let map = value.as_object().ok_or_else(|| {
            TsError::configuration(
                "CONFIG.PARAMETERS",
                "fit parameters must be a JSON object keyed by parameter name",
            )
        })?;
        Self::from_map(map)
    }

    pub fn entry(&self, name: ParameterName) -> &ParameterEntry {
        match name {
            ParameterName::ElectronDensity => &self.n_e,
            ParameterName::ElectronTemperature => &self.t_e,
            ParameterName::ElectronFlow => &self.v_fe,
            ParameterName::MassNumber => &self.a,
            ParameterName::IonTemperature => &self.t_i,
            ParameterName::IonFlow => &self.v_fi,
            ParameterName::Stray => &self.stray,
            ParameterName::Amplitude => &self.amplitude,
            ParameterName::Offset => &self.offset,
            ParameterName::Shift => &self.shift,
        }
    }

    /// Splits entries into fixed values and free parameters, in [`ParameterName::ALL`] order.
    pub fn partition(&self) -> Vec<FitParameter> {
        ParameterName::ALL
            .into_iter()
            .map(|name| {
                let entry = self.entry(name);
                if entry.independent {
                    FitParameter::Fixed {
                        name,
                        value: entry.value,
                    }
                } else {
                    FitParameter::Free {
                        name,
                        initial: entry.value,
                        min: entry.min,
                    }
                }
            })
            .collect()
    }
}

fn missing(key: &str) -> TsError {
    TsError::configuration(
        "CONFIG.PARAMETER_MISSING",
        format!("fit parameter '{key}' is missing"),
    )
}

fn invalid(key: &str, source: &serde_json::Error) -> TsError {
    TsError::configuration(
        "CONFIG.PARAMETER_INVALID",
        format!("fit parameter '{key}' is malformed: {source}"),
    )
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FitParameter {
    Fixed {
        name: ParameterName,
        value: f64,
    },
    Free {
        name: ParameterName,
        initial: f64,
        min: Option<f64>,
    },
}

impl FitParameter {
    pub const fn name(&self) -> ParameterName {
        match self {
            Self::Fixed { name, .. } | Self::Free { name, .. } => *name,
        }
    }

    pub const fn is_free(&self) -> bool {
        matches!(self, Self::Free { .. })
    }
}

/// Complete physical parameter set handed to a lineshape.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct PlasmaParameters {
    #[serde(rename = "n_e")]
    pub n_e: f64,
    #[serde(rename = "T_e")]
    pub t_e: f64,
    #[serde(rename = "V_fe")]
    pub v_fe: f64,
    #[serde(rename = "A")]
    pub a: f64,
    #[serde(rename = "T_i")]
    pub t_i: f64,
    #[serde(rename = "V_fi")]
    pub v_fi: f64,
    pub stray: f64,
    pub amplitude: f64,
    pub offset: f64,
    pub shift: f64,
}

impl PlasmaParameters {
    /// Fixed values merged with `free_values`, which follow the order of the free entries.
    pub fn assemble(parameters: &[FitParameter], free_values: &[f64]) -> Self {
        let mut assembled = Self::default();
        let mut free = free_values.iter();
        for parameter in parameters {
            match parameter {
                FitParameter::Fixed { name, value } => assembled.set(*name, *value),
                FitParameter::Free { name, initial, .. } => {
                    assembled.set(*name, free.next().copied().unwrap_or(*initial));
                }
            }
        }
        assembled
    }

    pub fn get(&self, name: ParameterName) -> f64 {
        match name {
            ParameterName::ElectronDensity => self.n_e,
            ParameterName::ElectronTemperature => self.t_e,
            ParameterName::ElectronFlow => self.v_fe,
            ParameterName::MassNumber => self.a,
            ParameterName::IonTemperature => self.t_i,
            ParameterName::IonFlow => self.v_fi,
            ParameterName::Stray => self.stray,
            ParameterName::Amplitude => self.amplitude,
            ParameterName::Offset => self.offset,
            ParameterName::Shift => self.shift,
        }
    }

    pub fn set(&mut self, name: ParameterName, value: f64) {
        let slot = match name {
            ParameterName::ElectronDensity => &mut self.n_e,
            ParameterName::ElectronTemperature => &mut self.t_e,
            ParameterName::ElectronFlow => &mut self.v_fe,
            ParameterName::MassNumber => &mut self.a,
            ParameterName::IonTemperature => &mut self.t_i,
            ParameterName::IonFlow => &mut self.v_fi,
            ParameterName::Stray => &mut self.stray,
            ParameterName::Amplitude => &mut self.amplitude,
            ParameterName::Offset => &mut self.offset,
            ParameterName::Shift => &mut self.shift,
        };
        *slot = value;
    }
}

#[cfg(test)]
mod tests {
    use super::{FitParameter, ParameterName, ParameterSpecification, PlasmaParameters};
    use crate::domain::TsErrorCategory;
    use serde_json::json;

    fn full_specification() -> serde_json::Value {
        json!({
            "model": ["nLTE", true],
            "n_e": [1.0e18, true],
            "T_e": [100.0, false, 1.0],
            "V_fe": [0.0, true],
            "A": [27, true],
            "T_i": {"value": 50.0, "independent": false, "min": 0.5},
            "V_fi": [0.0, false],
            "stray": [0.1, false, 0.0],
            "amplitude": [1.0, false],
            "offset": [0.0, false],
            "shift": [0.0, true],
        })
    }

    #[test]
    fn parses_array_and_object_entries() {
        let specification =
            ParameterSpecification::from_value(&full_specification()).expect("spec should parse");

        assert_eq!(specification.model, "nLTE");
        assert!(specification.n_e.independent);
        assert_eq!(specification.t_e.min, Some(1.0));
        assert_eq!(specification.a.value, 27.0);
        assert_eq!(specification.t_i.min, Some(0.5));
        assert!(!specification.t_i.independent);
        assert_eq!(specification.v_fi.min, None);
    }

    #[test]
    fn missing_key_is_a_configuration_error() {
        let mut value = full_specification();
        value.as_object_mut().expect("object").remove("T_i");

        let error = ParameterSpecification::from_value(&value).expect_err("missing T_i");
        assert_eq!(error.category(), TsErrorCategory::Configuration);
        assert_eq!(error.code(), "CONFIG.PARAMETER_MISSING");
        assert!(error.message().contains("T_i"));
    }

    #[test]
    fn unrecognized_keys_are_ignored() {
        let mut value = full_specification();
        value
            .as_object_mut()
            .expect("object")
            .insert("Z".to_string(), json!([3.0, true]));

        let specification = ParameterSpecification::from_value(&value).expect("extra key ignored");
        assert_eq!(specification.partition().len(), ParameterName::ALL.len());
    }

    #[test]
    fn dependent_model_entry_is_rejected() {
        let mut value = full_specification();
        value
            .as_object_mut()
            .expect("object")
            .insert("model".to_string(), json!(["nLTE", false]));

        let error = ParameterSpecification::from_value(&value).expect_err("model must be fixed");
        assert_eq!(error.code(), "CONFIG.PARAMETER_MODEL");
    }

    #[test]
    fn partition_separates_fixed_and_free_entries() {
        let specification =
            ParameterSpecification::from_value(&full_specification()).expect("spec");
        let parameters = specification.partition();

        let free: Vec<ParameterName> = parameters
            .iter()
            .filter(|parameter| parameter.is_free())
            .map(FitParameter::name)
            .collect();
        assert_eq!(
            free,
            vec![
                ParameterName::ElectronTemperature,
                ParameterName::IonTemperature,
                ParameterName::IonFlow,
                ParameterName::Stray,
                ParameterName::Amplitude,
                ParameterName::Offset,
            ]
        );
        assert_eq!(
            parameters[3],
            FitParameter::Fixed {
                name: ParameterName::MassNumber,
                value: 27.0
            }
        );
    }

    #[test]
    fn assemble_merges_free_values_in_order() {
        let specification =
            ParameterSpecification::from_value(&full_specification()).expect("spec");
        let parameters = specification.partition();

        let merged =
            PlasmaParameters::assemble(&parameters, &[120.0, 60.0, 1.0e4, 0.2, 2.0, 5.0]);
        assert_eq!(merged.n_e, 1.0e18);
        assert_eq!(merged.t_e, 120.0);
        assert_eq!(merged.t_i, 60.0);
        assert_eq!(merged.v_fi, 1.0e4);
        assert_eq!(merged.offset, 5.0);
        assert_eq!(merged.get(ParameterName::MassNumber), 27.0);
    }
}
