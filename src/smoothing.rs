//! Low-pass smoothing filters applied in Fourier space
//!
//! Each Fourier amplitude is multiplied by a radial filter `F(|k| R)`:
//! a sharp-k cutoff, a Gaussian, or the transform of a real-space top-hat
//! (defined for 2D and 3D only). `R` is the smoothing scale in box units,
//! matching the grid's k convention of 2π per box length.

use rayon::prelude::*;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::grid::{wavevector_of, GridStatus, SlabGrid};

/// Arguments below this are treated as kR = 0, where every filter is 1.
const KR_FLOOR: f64 = 1e-5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmoothingFilter {
    /// Unit response for kR < 1, zero beyond.
    SharpK,
    /// `exp(-(kR)^2 / 2)`.
    Gaussian,
    /// Fourier transform of a real-space spherical top-hat.
    TopHat,
}

impl FromStr for SmoothingFilter {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "sharpk" => Ok(SmoothingFilter::SharpK),
            "gaussian" => Ok(SmoothingFilter::Gaussian),
            "tophat" => Ok(SmoothingFilter::TopHat),
            other => Err(Error::UnknownKernel(other.to_string())),
        }
    }
}

/// Multiply every mode of a Fourier grid by `F(|k| R)`.
pub fn smoothing_filter_fourier_space<const D: usize>(
    grid: &mut SlabGrid<D>,
    smoothing_scale: f64,
    filter: SmoothingFilter,
) -> Result<()> {
    grid.require_status(GridStatus::Fourier)?;
    if filter == SmoothingFilter::TopHat && !(D == 2 || D == 3) {
        return Err(Error::UnsupportedDim { what: "tophat filter", dim: D });
    }

    let n = grid.nmesh();
    let x_start = grid.local_x_start();
    grid.fourier_cells_mut().par_iter_mut().enumerate().for_each(|(idx, c)| {
        let k = wavevector_of::<D>(idx, n, x_start);
        let kmag = k.iter().map(|&x| x * x).sum::<f64>().sqrt();
        *c *= filter_value::<D>(filter, kmag * smoothing_scale);
    });
    Ok(())
}

fn filter_value<const D: usize>(filter: SmoothingFilter, kr: f64) -> f64 {
    match filter {
        SmoothingFilter::SharpK => {
            if kr < 1.0 {
                1.0
            } else {
                0.0
            }
        }
        SmoothingFilter::Gaussian => (-0.5 * kr * kr).exp(),
        SmoothingFilter::TopHat => {
            if kr < KR_FLOOR {
                1.0
            } else if D == 2 {
                2.0 / (kr * kr) * (1.0 - kr.cos())
            } else {
                3.0 * (kr.sin() - kr * kr.cos()) / (kr * kr * kr)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::LocalComm;
    use crate::fft;
    use num_complex::Complex64;

    #[test]
    fn test_filter_parsing() {
        assert_eq!("sharpk".parse::<SmoothingFilter>().unwrap(), SmoothingFilter::SharpK);
        assert_eq!("gaussian".parse::<SmoothingFilter>().unwrap(), SmoothingFilter::Gaussian);
        assert_eq!("tophat".parse::<SmoothingFilter>().unwrap(), SmoothingFilter::TopHat);
        assert!("boxcar".parse::<SmoothingFilter>().is_err());
    }

    #[test]
    fn test_filters_are_unity_at_k_zero() {
        for filter in [SmoothingFilter::SharpK, SmoothingFilter::Gaussian, SmoothingFilter::TopHat]
        {
            assert_eq!(filter_value::<3>(filter, 0.0), 1.0);
            assert_eq!(filter_value::<3>(filter, 1e-6), 1.0);
        }
    }

    #[test]
    fn test_sharpk_is_a_strict_cutoff() {
        assert_eq!(filter_value::<3>(SmoothingFilter::SharpK, 0.999), 1.0);
        assert_eq!(filter_value::<3>(SmoothingFilter::SharpK, 1.0), 0.0);
        assert_eq!(filter_value::<3>(SmoothingFilter::SharpK, 5.0), 0.0);
    }

    #[test]
    fn test_tophat_rejects_unsupported_dimension() {
        let comm = LocalComm;
        let mut grid = SlabGrid::<4>::new(4, 0, 0, &comm).unwrap();
        fft::forward(&mut grid, &comm).unwrap();
        assert!(smoothing_filter_fourier_space(&mut grid, 0.1, SmoothingFilter::TopHat).is_err());
        // The other filters are dimension-agnostic.
        assert!(smoothing_filter_fourier_space(&mut grid, 0.1, SmoothingFilter::Gaussian).is_ok());
    }

    #[test]
    fn test_requires_fourier_state() {
        let comm = LocalComm;
        let mut grid = SlabGrid::<3>::new(4, 0, 0, &comm).unwrap();
        assert!(smoothing_filter_fourier_space(&mut grid, 0.1, SmoothingFilter::Gaussian).is_err());
    }

    #[test]
    fn test_tophat_matches_analytic_transform() {
        // Unit spectrum in, filter amplitudes out: every mode must equal
        // 3 (sin kR - kR cos kR) / (kR)^3.
        let comm = LocalComm;
        let n = 32;
        let mut grid = SlabGrid::<3>::new(n, 0, 0, &comm).unwrap();
        grid.set_status(GridStatus::Fourier);
        grid.fill_fourier(Complex64::new(1.0, 0.0));

        let r = 2.0 / n as f64;
        smoothing_filter_fourier_space(&mut grid, r, SmoothingFilter::TopHat).unwrap();

        for idx in 0..grid.n_fourier_local() {
            let (_, kmag) = grid.fourier_wavevector_and_norm(idx);
            let kr = kmag * r;
            let expect = if kr < KR_FLOOR {
                1.0
            } else {
                3.0 * (kr.sin() - kr * kr.cos()) / (kr * kr * kr)
            };
            let got = grid.get_fourier(idx).re;
            assert!((got - expect).abs() < 1e-12, "mode {idx}: {got} vs {expect}");
        }
    }

    #[test]
    fn test_gaussian_suppresses_high_k() {
        let comm = LocalComm;
        let mut grid = SlabGrid::<2>::new(16, 0, 0, &comm).unwrap();
        for (i, c) in grid.real_cells_mut().iter_mut().enumerate() {
            *c = if i % 2 == 0 { 1.0 } else { -1.0 };
        }
        fft::forward(&mut grid, &comm).unwrap();
        smoothing_filter_fourier_space(&mut grid, 0.5, SmoothingFilter::Gaussian).unwrap();
        fft::inverse(&mut grid, &comm).unwrap();
        // The alternating pattern lives at the Nyquist frequency; a wide
        // Gaussian all but removes it.
        let max = grid.real_cells().iter().fold(0.0f64, |m, &v| m.max(v.abs()));
        assert!(max < 1e-6, "Nyquist mode survived smoothing: {max}");
    }
}
