//! Polyspec-Core: n-point polyspectra of periodic density fields
//!
//! This crate estimates power spectra, bispectra, and higher-order
//! polyspectra of scalar fields sampled on a periodic grid, distributed
//! across a pool of workers by slab decomposition, together with the
//! particle-to-grid density estimators that feed them.
//!
//! # Modules
//! - `comm`: worker pool and message-passing primitives
//! - `grid`: slab-decomposed real/Fourier scalar field with ghost planes
//! - `fft`: distributed real-to-complex transform using rustfft
//! - `particles`: particle records and slab re-homing
//! - `assignment`: NGP/CIC/TSC/PCS scatter and window deconvolution
//! - `binning`: radial binning accumulators for P(k) and P(k1..kn)
//! - `power`: P(k) estimators, interlacing, direct summation, multipoles
//! - `polyspectrum`: shell-field n-point estimator and the bispectrum
//! - `smoothing`: sharp-k, Gaussian, and top-hat Fourier filters
//!
//! Positions are box-normalized to `[0, 1)^D` and wavevectors are in units
//! of 2π per box length; results are rescaled to physical units by the
//! caller (`k` by `1/L_box`, spectra by `L_box^D`).

// Core infrastructure
pub mod comm;
pub mod error;
pub mod fft;
pub mod grid;

// Estimator inputs
pub mod assignment;
pub mod binning;
pub mod particles;

// Estimators
pub mod polyspectrum;
pub mod power;
pub mod smoothing;

pub use error::{Error, Result};
