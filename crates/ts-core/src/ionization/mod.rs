//! Mean-ionization tables and the lookups built on them.

mod table;

pub use table::{TableParseError, ZTeTable};

use crate::domain::{TsError, TsResult};
use crate::numerics::nearest_index;
use serde::Serialize;
use std::fmt::{Display, Formatter};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use tracing::info;

pub const DEFAULT_Z_GUESS: f64 = 4.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Element {
    Carbon,
    Aluminium,
    Tungsten,
}

impl Element {
    pub const ALL: [Element; 3] = [Self::Carbon, Self::Aluminium, Self::Tungsten];

    pub const fn mass_number(self) -> u32 {
        match self {
            Self::Carbon => 12,
            Self::Aluminium => 27,
            Self::Tungsten => 183,
        }
    }

    pub fn from_mass_number(mass_number: u32) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|element| element.mass_number() == mass_number)
    }

    /// Exact match of a fitted/fixed `A` value against the registry.
    pub fn from_mass(mass: f64) -> TsResult<Self> {
        let integral = mass.is_finite() && mass.fract() == 0.0 && mass >= 0.0;
        integral
            .then(|| Self::from_mass_number(mass as u32))
            .flatten()
            .ok_or_else(|| {
                TsError::configuration(
                    "CONFIG.ZTE_TABLE",
                    format!("no data available for A={mass}"),
                )
            })
    }

    pub fn from_symbol(symbol: &str) -> Option<Self> {
        match symbol.trim() {
            "C" | "c" => Some(Self::Carbon),
            "Al" | "al" | "AL" => Some(Self::Aluminium),
            "W" | "w" => Some(Self::Tungsten),
            _ => None,
        }
    }

    pub const fn symbol(self) -> &'static str {
        match self {
            Self::Carbon => "C",
            Self::Aluminium => "Al",
            Self::Tungsten => "W",
        }
    }

    pub const fn file_name(self) -> &'static str {
        match self {
            Self::Carbon => "zb_C.dat",
            Self::Aluminium => "zb_Al.dat",
            Self::Tungsten => "zb_W.dat",
        }
    }

    pub const fn header_lines(self) -> usize {
        match self {
            Self::Carbon => 4,
            Self::Aluminium => 2,
            Self::Tungsten => 0,
        }
    }

    /// Ion densities (m^-3) of the tabulated Z columns, in column order.
    pub const fn density_brackets(self) -> &'static [f64] {
        match self {
            Self::Carbon => &[1.0e19],
            Self::Aluminium => &[1.0e17, 5.0e17, 1.0e18, 5.0e18, 1.0e19],
            Self::Tungsten => &[],
        }
    }
}

impl Display for Element {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str((*self).symbol())
    }
}

/// Lazily loaded, shared Z-Te tables rooted at one directory.
#[derive(Debug, Default)]
pub struct IonizationTables {
    directory: PathBuf,
    carbon: OnceLock<Arc<ZTeTable>>,
    aluminium: OnceLock<Arc<ZTeTable>>,
    tungsten: OnceLock<Arc<ZTeTable>>,
}

impl IonizationTables {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            ..Self::default()
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn table(&self, element: Element) -> TsResult<Arc<ZTeTable>> {
        let cell = match element {
            Element::Carbon => &self.carbon,
            Element::Aluminium => &self.aluminium,
            Element::Tungsten => &self.tungsten,
        };
        if let Some(table) = cell.get() {
            return Ok(Arc::clone(table));
        }

        let loaded = Arc::new(self.load(element)?);
        Ok(Arc::clone(cell.get_or_init(|| loaded)))
    }

    pub fn for_mass(&self, mass: f64) -> TsResult<Arc<ZTeTable>> {
        self.table(Element::from_mass(mass)?)
    }

    fn load(&self, element: Element) -> TsResult<ZTeTable> {
        let path = self.directory.join(element.file_name());
        let source = fs::read_to_string(&path).map_err(|source| {
            TsError::io_system(
                "IO.ZTE_TABLE_READ",
                format!("failed to read Z-Te table '{}': {}", path.display(), source),
            )
        })?;
        let table = ZTeTable::parse(&source, element.header_lines()).map_err(|source| {
            TsError::data_shape(
                "IONIZATION.TABLE_PARSE",
                format!("Z-Te table '{}': {}", path.display(), source),
            )
        })?;
        info!(
            element = %element,
            rows = table.temperatures().len(),
            brackets = table.bracket_count(),
            "loaded Z-Te table"
        );
        Ok(table)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct IonizationEstimate {
    pub z: f64,
    pub t_e: f64,
    pub bracket: usize,
}

/// Z column whose ion density is nearest `n_e / z_guess`; the first column when the element has
/// no registered brackets.
pub fn select_bracket(element: Element, n_e: f64, z_guess: f64) -> TsResult<usize> {
    if !z_guess.is_finite() || z_guess <= 0.0 {
        return Err(TsError::configuration(
            "CONFIG.Z_GUESS",
            format!("Z guess must be finite and > 0, got {z_guess}"),
        ));
    }
    Ok(nearest_index(element.density_brackets(), n_e / z_guess).unwrap_or(0))
}

/// Tabulated `(Z, Te)` at the first temperature whose `Z·Te` reaches a measured `Z·Te`.
pub fn z_te_finder(
    tables: &IonizationTables,
    element: Element,
    n_e: f64,
    zte_measured: f64,
    z_guess: f64,
) -> TsResult<IonizationEstimate> {
    let bracket = select_bracket(element, n_e, z_guess)?;
    let table = tables.table(element)?;
    let (z, t_e) = table
        .first_reaching_zte(bracket, zte_measured)
        .ok_or_else(|| out_of_table(element, format!("Z*Te={zte_measured}")))?;
    Ok(IonizationEstimate { z, t_e, bracket })
}

/// Tabulated Z at the first temperature at or above a measured Te.
pub fn z_finder(
    tables: &IonizationTables,
    element: Element,
    n_e: f64,
    t_e_measured: f64,
    z_guess: f64,
) -> TsResult<IonizationEstimate> {
    let bracket = select_bracket(element, n_e, z_guess)?;
    let table = tables.table(element)?;
    let z = table
        .first_reaching_te(bracket, t_e_measured)
        .ok_or_else(|| out_of_table(element, format!("Te={t_e_measured}")))?;
    Ok(IonizationEstimate {
        z,
        t_e: t_e_measured,
        bracket,
    })
}

fn out_of_table(element: Element, what: String) -> TsError {
    TsError::configuration(
        "CONFIG.ZTE_RANGE",
        format!("{what} lies beyond the {element} Z-Te table"),
    )
}
