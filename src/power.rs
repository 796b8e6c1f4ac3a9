//! Power spectrum estimators
//!
//! `bin_up_power_spectrum` turns a Fourier grid into a binned P(k);
//! the `compute_power_spectrum*` drivers run the full pipeline from
//! particles (scatter, transform, window deconvolution, binning, shot-noise
//! subtraction), with interlaced and alias-free direct-summation variants.
//! Multipoles under a fixed line of sight are estimated from the moments
//! `<|delta|^2 mu^m>` and projected onto Legendre polynomials.
//!
//! The packed last axis stores only the non-negative half spectrum, so
//! interior modes stand for a Hermitian-conjugate pair and are binned with
//! weight 2; the DC and Nyquist planes carry weight 1.

use num_complex::Complex64;
use rayon::prelude::*;

use crate::assignment::{deconvolve_window, particles_to_grid, AssignmentKernel};
use crate::binning::PowerSpectrumBinning;
use crate::comm::Communicator;
use crate::error::{Error, Result};
use crate::fft;
use crate::grid::{wavevector_of, GridStatus, SlabGrid};
use crate::particles::ParticleSet;

/// How the particle-based multipole estimator treats the line of sight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LosAveraging {
    /// Use every coordinate axis as the line of sight in turn and average
    /// the resulting multipoles.
    MeanOverAxes,
    /// Use a single fixed coordinate axis.
    Axis(usize),
}

/// Weight reconstructing the full Hermitian pair count from the packed
/// half spectrum.
#[inline]
fn hermitian_weight(last: usize, nmesh: usize) -> f64 {
    if last > 0 && last < nmesh / 2 {
        2.0
    } else {
        1.0
    }
}

/// Bin `|delta(k)|^2` of a Fourier grid into radial shells. Collective
/// (ends in the binning's `normalize`).
pub fn bin_up_power_spectrum<const D: usize, C: Communicator>(
    grid: &SlabGrid<D>,
    pofk: &mut PowerSpectrumBinning,
    comm: &C,
) -> Result<()> {
    grid.require_status(GridStatus::Fourier)?;
    let n = grid.nmesh();
    let x_start = grid.local_x_start();
    let nlast = n / 2 + 1;

    pofk.reset();
    let template = pofk.clone();
    let partial = grid
        .fourier_cells()
        .par_iter()
        .enumerate()
        .fold(
            || template.clone(),
            |mut acc, (idx, c)| {
                let weight = hermitian_weight(idx % nlast, n);
                let k = wavevector_of::<D>(idx, n, x_start);
                let kmag = k.iter().map(|&x| x * x).sum::<f64>().sqrt();
                acc.add_to_bin(kmag, c.norm_sqr(), weight);
                acc
            },
        )
        .reduce(
            || template.clone(),
            |mut a, b| {
                a.merge(&b);
                a
            },
        );
    pofk.merge(&partial);
    pofk.normalize(comm);
    Ok(())
}

/// P(k) from particles: scatter with the given kernel, transform,
/// deconvolve the assignment window, bin up, and subtract the shot noise
/// `1 / npart_total`.
pub fn compute_power_spectrum<const D: usize, C: Communicator>(
    ngrid: usize,
    set: &ParticleSet<D>,
    pofk: &mut PowerSpectrumBinning,
    kernel: AssignmentKernel,
    comm: &C,
) -> Result<()> {
    let (n_left, n_right) = kernel.extra_slices();
    let mut density_k = SlabGrid::<D>::new(ngrid, n_left, n_right, comm)?;
    particles_to_grid(set, &mut density_k, kernel, comm)?;
    fft::forward(&mut density_k, comm)?;
    deconvolve_window(&mut density_k, kernel)?;
    bin_up_power_spectrum(&density_k, pofk, comm)?;

    let shot_noise = 1.0 / set.npart_total() as f64;
    for p in pofk.pofk.iter_mut() {
        *p -= shot_noise;
    }
    Ok(())
}

/// P(k) with interlacing: a second scatter of the particles shifted by half
/// a cell along every axis is phase-rotated and averaged with the first,
/// cancelling the leading alias images before deconvolution.
///
/// The particle positions are shifted in place and restored before the
/// function returns. The shift along the slab axis is left unwrapped (the
/// extra right ghost plane absorbs it), so no re-homing is needed.
pub fn compute_power_spectrum_interlacing<const D: usize, C: Communicator>(
    ngrid: usize,
    set: &mut ParticleSet<D>,
    pofk: &mut PowerSpectrumBinning,
    kernel: AssignmentKernel,
    comm: &C,
) -> Result<()> {
    let (n_left, mut n_right) = kernel.extra_slices();
    // The half-cell shift can push deposits one plane further right.
    n_right += 1;

    let mut density_k = SlabGrid::<D>::new(ngrid, n_left, n_right, comm)?;
    particles_to_grid(set, &mut density_k, kernel, comm)?;

    let shift = 1.0 / (2.0 * ngrid as f64);
    set.particles_mut().par_iter_mut().for_each(|p| {
        p.pos[0] += shift;
        for x in p.pos[1..].iter_mut() {
            *x += shift;
            if *x >= 1.0 {
                *x -= 1.0;
            }
        }
    });

    let mut density_k2 = SlabGrid::<D>::new(ngrid, n_left, n_right, comm)?;
    let scatter_result = particles_to_grid(set, &mut density_k2, kernel, comm);

    // Undo the shift before propagating any error.
    set.particles_mut().par_iter_mut().for_each(|p| {
        p.pos[0] -= shift;
        for x in p.pos[1..].iter_mut() {
            *x -= shift;
            if *x < 0.0 {
                *x += 1.0;
            }
        }
    });
    scatter_result?;

    fft::forward(&mut density_k, comm)?;
    fft::forward(&mut density_k2, comm)?;

    // delta = (G1 + exp(i sum_j k_j / 2N) G2) / 2
    let n = density_k.nmesh();
    let x_start = density_k.local_x_start();
    let shifted = density_k2.fourier_cells().to_vec();
    density_k
        .fourier_cells_mut()
        .par_iter_mut()
        .zip(shifted.par_iter())
        .enumerate()
        .for_each(|(idx, (c, g2))| {
            let k = wavevector_of::<D>(idx, n, x_start);
            let ksum: f64 = k.iter().sum();
            let phase = Complex64::new(0.0, ksum * shift).exp();
            *c = (*c + phase * g2) / 2.0;
        });

    deconvolve_window(&mut density_k, kernel)?;
    bin_up_power_spectrum(&density_k, pofk, comm)?;

    let shot_noise = 1.0 / set.npart_total() as f64;
    for p in pofk.pofk.iter_mut() {
        *p -= shot_noise;
    }
    Ok(())
}

/// Alias-free P(k) by direct summation of `exp(-i k x)` over particles for
/// every grid mode, `O(npart * ngrid^D)`.
///
/// Precondition: every worker must hold the complete, identical particle
/// set (the mode loop is parallelized over slabs, the particle loop is
/// not). Mismatched local counts across workers are rejected.
pub fn compute_power_spectrum_direct_summation<const D: usize, C: Communicator>(
    ngrid: usize,
    set: &ParticleSet<D>,
    pofk: &mut PowerSpectrumBinning,
    comm: &C,
) -> Result<()> {
    let npart = set.npart();
    let total = comm.allreduce_sum(npart as f64);
    if npart == 0 || total != (npart * comm.size()) as f64 {
        return Err(Error::Precondition(
            "direct summation requires every worker to hold the full particle set".to_string(),
        ));
    }

    let mut density_k = SlabGrid::<D>::new(ngrid, 0, 0, comm)?;
    let n = density_k.nmesh();
    let x_start = density_k.local_x_start();
    let rank = comm.rank();
    let norm = 1.0 / npart as f64;
    let particles = set.particles();

    let modes: Vec<Complex64> = (0..density_k.n_fourier_local())
        .into_par_iter()
        .map(|idx| {
            let k = wavevector_of::<D>(idx, n, x_start);
            let sum: Complex64 = particles
                .iter()
                .map(|p| {
                    let kx: f64 = k.iter().zip(p.pos.iter()).map(|(&kj, &xj)| kj * xj).sum();
                    Complex64::new(0.0, -kx).exp()
                })
                .sum();
            let mut delta = sum * norm;
            if rank == 0 && idx == 0 {
                // Remove the mean so the DC mode vanishes.
                delta -= 1.0;
            }
            delta
        })
        .collect();
    density_k.fourier_cells_mut().copy_from_slice(&modes);
    density_k.set_status(GridStatus::Fourier);

    bin_up_power_spectrum(&density_k, pofk, comm)?;

    let shot_noise = 1.0 / npart as f64;
    for p in pofk.pofk.iter_mut() {
        *p -= shot_noise;
    }
    Ok(())
}

/// Multipoles P_0 .. P_{lmax} of a Fourier grid under a fixed line of
/// sight, with `lmax = pell.len() - 1`. The moments `<|delta|^2 mu^m>` are
/// binned first, then projected onto Legendre polynomials in place.
pub fn compute_power_spectrum_multipoles<const D: usize, C: Communicator>(
    grid: &SlabGrid<D>,
    pell: &mut [PowerSpectrumBinning],
    line_of_sight: &[f64; D],
    comm: &C,
) -> Result<()> {
    grid.require_status(GridStatus::Fourier)?;
    if pell.is_empty() {
        return Err(Error::Precondition("need at least one multipole binning".to_string()));
    }
    let rnorm = line_of_sight.iter().map(|&r| r * r).sum::<f64>().sqrt();
    if rnorm <= 0.0 {
        return Err(Error::BadLineOfSight("line of sight has zero length".to_string()));
    }

    let n = grid.nmesh();
    let x_start = grid.local_x_start();
    let nlast = n / 2 + 1;

    for b in pell.iter_mut() {
        b.reset();
    }
    let template: Vec<PowerSpectrumBinning> = pell.to_vec();

    // Accumulate <|delta|^2 mu^m> for m = 0 .. lmax.
    let partial = grid
        .fourier_cells()
        .par_iter()
        .enumerate()
        .fold(
            || template.clone(),
            |mut acc, (idx, c)| {
                let weight = hermitian_weight(idx % nlast, n);
                let k = wavevector_of::<D>(idx, n, x_start);
                let kmag = k.iter().map(|&x| x * x).sum::<f64>().sqrt();
                let power = c.norm_sqr();
                let mu = if kmag > 0.0 {
                    k.iter().zip(line_of_sight.iter()).map(|(&kj, &rj)| kj * rj).sum::<f64>()
                        / (kmag * rnorm)
                } else {
                    0.0
                };
                let mut mu_to_m = 1.0;
                for b in acc.iter_mut() {
                    b.add_to_bin(kmag, power * mu_to_m, weight);
                    mu_to_m *= mu;
                }
                acc
            },
        )
        .reduce(
            || template.clone(),
            |mut a, b| {
                for (x, y) in a.iter_mut().zip(b.iter()) {
                    x.merge(y);
                }
                a
            },
        );
    for (b, p) in pell.iter_mut().zip(partial.iter()) {
        b.merge(p);
        b.normalize(comm);
    }

    legendre_project(pell);
    Ok(())
}

/// Redshift-space multipoles straight from simulation particles: displace
/// along the line of sight by velocity times `velocity_to_displacement`,
/// re-home, scatter, transform, deconvolve, and measure grid multipoles;
/// then undo the displacement. With [`LosAveraging::MeanOverAxes`] this is
/// repeated with each coordinate axis as the line of sight and the results
/// are averaged. Shot noise is subtracted from the monopole.
pub fn compute_power_spectrum_multipoles_particles<const D: usize, C: Communicator>(
    ngrid: usize,
    set: &mut ParticleSet<D>,
    velocity_to_displacement: f64,
    pell: &mut [PowerSpectrumBinning],
    kernel: AssignmentKernel,
    averaging: LosAveraging,
    comm: &C,
) -> Result<()> {
    if pell.is_empty() {
        return Err(Error::Precondition("need at least one multipole binning".to_string()));
    }
    let axes: Vec<usize> = match averaging {
        LosAveraging::MeanOverAxes => (0..D).collect(),
        LosAveraging::Axis(dir) => {
            if dir >= D {
                return Err(Error::BadLineOfSight(format!(
                    "axis {dir} out of range for dimension {D}"
                )));
            }
            vec![dir]
        }
    };

    for b in pell.iter_mut() {
        b.reset();
    }
    let template: Vec<PowerSpectrumBinning> = pell.to_vec();
    let (n_left, n_right) = kernel.extra_slices();

    let mut accumulated = template.clone();
    for &dir in &axes {
        let mut line_of_sight = [0.0; D];
        line_of_sight[dir] = 1.0;

        displace_along_axis(set, dir, velocity_to_displacement);
        set.communicate(ngrid, comm);

        let mut density_k = SlabGrid::<D>::new(ngrid, n_left, n_right, comm)?;
        let run = (|| -> Result<Vec<PowerSpectrumBinning>> {
            particles_to_grid(set, &mut density_k, kernel, comm)?;
            fft::forward(&mut density_k, comm)?;
            deconvolve_window(&mut density_k, kernel)?;
            let mut pell_dir = template.clone();
            compute_power_spectrum_multipoles(&density_k, &mut pell_dir, &line_of_sight, comm)?;
            Ok(pell_dir)
        })();

        // Put the particles back where they came from before bailing out.
        displace_along_axis(set, dir, -velocity_to_displacement);
        set.communicate(ngrid, comm);

        for (acc, b) in accumulated.iter_mut().zip(run?.iter()) {
            acc.merge(b);
        }
    }

    let inv_axes = 1.0 / axes.len() as f64;
    for (b, acc) in pell.iter_mut().zip(accumulated.iter()) {
        b.merge(acc);
        for v in b.pofk.iter_mut() {
            *v *= inv_axes;
        }
        for v in b.count.iter_mut() {
            *v *= inv_axes;
        }
        for v in b.kbin.iter_mut() {
            *v *= inv_axes;
        }
    }

    let shot_noise = 1.0 / set.npart_total() as f64;
    for p in pell[0].pofk.iter_mut() {
        *p -= shot_noise;
    }
    Ok(())
}

/// Shift every particle along `dir` by its velocity component times
/// `factor`, with periodic wrap.
fn displace_along_axis<const D: usize>(set: &mut ParticleSet<D>, dir: usize, factor: f64) {
    set.particles_mut().par_iter_mut().for_each(|p| {
        let x = &mut p.pos[dir];
        *x += p.vel[dir] * factor;
        if *x >= 1.0 {
            *x -= 1.0;
        }
        if *x < 0.0 {
            *x += 1.0;
        }
    });
}

/// In-place projection from the moments `<|delta|^2 mu^m>` to the Legendre
/// multipoles `P_ell = sum_m (-1)^m C(ell,m) C(2ell-2m,ell) / 2^ell *
/// <|delta|^2 mu^(ell-2m)>`.
fn legendre_project(pell: &mut [PowerSpectrumBinning]) {
    let nell = pell.len();
    let binomial = |n: f64, k: usize| -> f64 {
        let mut res = 1.0;
        for i in 0..k {
            res *= (n - i as f64) / (k - i) as f64;
        }
        res
    };
    let summand = |m: usize, ell: usize| -> f64 {
        let sign = if m % 2 == 0 { 1.0 } else { -1.0 };
        sign * binomial(ell as f64, m) * binomial((2 * ell - 2 * m) as f64, ell)
            / 2f64.powi(ell as i32)
    };

    let nbins = pell[0].pofk.len();
    let mut projected = Vec::with_capacity(nell);
    for ell in 0..nell {
        let mut sum = vec![0.0; nbins];
        for m in 0..=ell / 2 {
            let c = summand(m, ell);
            for (s, &v) in sum.iter_mut().zip(pell[ell - 2 * m].pofk.iter()) {
                *s += c * v;
            }
        }
        projected.push(sum);
    }
    for (b, proj) in pell.iter_mut().zip(projected.into_iter()) {
        b.pofk = proj;
    }
}
