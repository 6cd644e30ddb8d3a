//! Thomson-scattering spectral analysis: detector frames to fitted plasma parameters.

pub mod calibration;
pub mod config;
pub mod domain;
pub mod export;
pub mod fibre;
pub mod frame;
pub mod ionization;
pub mod numerics;
pub mod preprocess;
pub mod scattering;
pub mod session;
