//! n-point polyspectrum estimator
//!
//! For each radial shell the packed spectrum is masked twice: `F_i` keeps
//! the modes inside the shell, `N_i` replaces them with 1. Both are
//! inverse-transformed, after which the polyspectrum of an ordered bin
//! tuple is the ratio of the real-space product sums
//! `sum_x prod_a F_{i_a}(x)` and `sum_x prod_a N_{i_a}(x)` — the count sum
//! is the number of closable k-space polygons in the tuple's shells. Only
//! non-decreasing tuples are evaluated; the rest are filled in by symmetry.
//!
//! The shell masks live on the packed half spectrum, so their inverse
//! transforms already sum over both Hermitian half-spaces; no extra mode
//! weighting is needed here.

use rayon::prelude::*;

use crate::assignment::{deconvolve_window, particles_to_grid, AssignmentKernel};
use crate::binning::{BispectrumBinning, PolyspectrumBinning};
use crate::comm::Communicator;
use crate::error::Result;
use crate::fft;
use crate::grid::{wavevector_of, GridStatus, SlabGrid};
use crate::particles::ParticleSet;

/// Compute the order-`ORDER` polyspectrum of a Fourier density grid.
/// Collective: every rank enters the same sequence of inverse transforms
/// and reductions. Results are left in grid units; see
/// [`PowerSpectrumBinning::scale`](crate::binning::PowerSpectrumBinning::scale)
/// for the unit convention.
pub fn compute_polyspectrum_grid<const D: usize, const ORDER: usize, C: Communicator>(
    density_k: &SlabGrid<D>,
    poly: &mut PolyspectrumBinning<ORDER>,
    comm: &C,
) -> Result<()> {
    density_k.require_status(GridStatus::Fourier)?;
    let nbins = poly.n();
    let nmesh = density_k.nmesh();
    let x_start = density_k.local_x_start();
    poly.reset();

    let (klow, khigh) = poly.edges();
    let deltak = poly.deltak();
    // Effective bin centers: midpoints of the truncated shell edges.
    let centers: Vec<f64> =
        klow.iter().zip(khigh.iter()).map(|(&lo, &hi)| 0.5 * (lo + hi)).collect();

    // Shell-masked fields F_i and shell indicators N_i, both taken to real
    // space. Per shell we also collect the mean |k| and the in-shell P(k).
    let mut f_real: Vec<SlabGrid<D>> = Vec::with_capacity(nbins);
    let mut n_real: Vec<SlabGrid<D>> = Vec::with_capacity(nbins);
    for i in 0..nbins {
        if comm.rank() == 0 {
            log::debug!(
                "polyspectrum shell {}/{}: k in [{:.3}, {:.3})",
                i + 1,
                nbins,
                klow[i],
                khigh[i]
            );
        }
        let mut f_grid = density_k.clone();
        let mut n_grid = density_k.clone();
        n_grid.fill_fourier(num_complex::Complex64::new(0.0, 0.0));

        let kmag2_min = klow[i] * klow[i];
        let kmag2_max = khigh[i] * khigh[i];

        let mut shell_stats = {
            let n_cells = n_grid.fourier_cells_mut();
            f_grid
                .fourier_cells_mut()
                .par_iter_mut()
                .zip(n_cells.par_iter_mut())
                .enumerate()
                .fold(
                    || [0.0f64; 3],
                    |mut acc, (idx, (f, count))| {
                        let k = wavevector_of::<D>(idx, nmesh, x_start);
                        let kmag2: f64 = k.iter().map(|&x| x * x).sum();
                        if kmag2 >= kmag2_max || kmag2 < kmag2_min {
                            *f = num_complex::Complex64::new(0.0, 0.0);
                        } else {
                            acc[0] += kmag2.sqrt();
                            acc[1] += f.norm_sqr();
                            acc[2] += 1.0;
                            *count = num_complex::Complex64::new(1.0, 0.0);
                        }
                        acc
                    },
                )
                .reduce(
                    || [0.0f64; 3],
                    |mut a, b| {
                        for (x, y) in a.iter_mut().zip(b.iter()) {
                            *x += y;
                        }
                        a
                    },
                )
        };
        comm.allreduce_sum_in_place(&mut shell_stats);
        let [kmean, pofk_sum, nk] = shell_stats;
        poly.kbin[i] = if nk > 0.0 { kmean / nk } else { centers[i] };
        poly.pofk[i] = if nk > 0.0 { pofk_sum / nk } else { 0.0 };

        fft::inverse(&mut f_grid, comm)?;
        fft::inverse(&mut n_grid, comm)?;
        f_real.push(f_grid);
        n_real.push(n_grid);
    }

    // Integrate over every canonical (non-decreasing) bin tuple; each one
    // needs a pair of global sums.
    let ntot = nbins.pow(ORDER as u32);
    let volume_norm = (1.0 / (nmesh as f64 * 2.0 * std::f64::consts::PI)).powi(D as i32);
    for t in 0..ntot {
        let ik = poly.tuple(t);
        if ik.windows(2).any(|w| w[0] > w[1]) {
            continue;
        }

        // A polygon with sides k_1 .. k_n can only close if the first n-1
        // sides reach the last one (up to the bin widths).
        let ksum: f64 = ik[..ORDER - 1].iter().map(|&i| centers[i]).sum();
        if ksum < centers[ik[ORDER - 1]] - ORDER as f64 * deltak / 2.0 {
            poly.set_computed(t);
            continue;
        }
        if comm.rank() == 0 {
            log::trace!("polyspectrum tuple {ik:?}");
        }

        let n_cells = f_real[0].real_cells().len();
        let mut sums = [0.0f64; 2];
        sums[0] = (0..n_cells)
            .into_par_iter()
            .map(|cell| ik.iter().map(|&i| f_real[i].real_cells()[cell]).product::<f64>())
            .sum();
        sums[1] = (0..n_cells)
            .into_par_iter()
            .map(|cell| ik.iter().map(|&i| n_real[i].real_cells()[cell]).product::<f64>())
            .sum();
        comm.allreduce_sum_in_place(&mut sums);
        let f123 = sums[0] * volume_norm;
        // Round-off can drive an empty configuration slightly negative.
        let n123 = (sums[1] * volume_norm).max(0.0);

        poly.p123[t] = if n123 > 0.0 { f123 / n123 } else { 0.0 };
        poly.n123[t] = n123;
        poly.set_computed(t);
    }

    // Fill the non-canonical tuples from their sorted representatives.
    for t in 0..ntot {
        let mut ik = poly.tuple(t);
        if ik.windows(2).all(|w| w[0] <= w[1]) {
            continue;
        }
        ik.sort_unstable();
        let src = poly.index(&ik);
        poly.copy_entry(src, t);
    }
    Ok(())
}

/// Bispectrum of a Fourier grid, in reduced form: `B(k1,k2,k3)` divided by
/// `P(k1)P(k2) + P(k2)P(k3) + P(k3)P(k1)` wherever that sum is positive.
pub fn compute_bispectrum_grid<const D: usize, C: Communicator>(
    density_k: &SlabGrid<D>,
    bofk: &mut BispectrumBinning,
    comm: &C,
) -> Result<()> {
    compute_polyspectrum_grid::<D, 3, C>(density_k, bofk, comm)?;
    let ntot = bofk.p123.len();
    for t in 0..ntot {
        let [i, j, k] = bofk.tuple(t);
        let norm = bofk.pofk[i] * bofk.pofk[j]
            + bofk.pofk[j] * bofk.pofk[k]
            + bofk.pofk[k] * bofk.pofk[i];
        if norm > 0.0 {
            bofk.p123[t] /= norm;
        }
    }
    Ok(())
}

/// Polyspectrum from particles: scatter, transform, deconvolve the
/// assignment window, then run the grid estimator.
pub fn compute_polyspectrum<const D: usize, const ORDER: usize, C: Communicator>(
    ngrid: usize,
    set: &ParticleSet<D>,
    poly: &mut PolyspectrumBinning<ORDER>,
    kernel: AssignmentKernel,
    comm: &C,
) -> Result<()> {
    let density_k = density_grid_from_particles(ngrid, set, kernel, comm)?;
    compute_polyspectrum_grid(&density_k, poly, comm)
}

/// Reduced bispectrum from particles.
pub fn compute_bispectrum<const D: usize, C: Communicator>(
    ngrid: usize,
    set: &ParticleSet<D>,
    bofk: &mut BispectrumBinning,
    kernel: AssignmentKernel,
    comm: &C,
) -> Result<()> {
    let density_k = density_grid_from_particles(ngrid, set, kernel, comm)?;
    compute_bispectrum_grid(&density_k, bofk, comm)
}

fn density_grid_from_particles<const D: usize, C: Communicator>(
    ngrid: usize,
    set: &ParticleSet<D>,
    kernel: AssignmentKernel,
    comm: &C,
) -> Result<SlabGrid<D>> {
    let (n_left, n_right) = kernel.extra_slices();
    let mut density_k = SlabGrid::<D>::new(ngrid, n_left, n_right, comm)?;
    particles_to_grid(set, &mut density_k, kernel, comm)?;
    fft::forward(&mut density_k, comm)?;
    deconvolve_window(&mut density_k, kernel)?;
    Ok(density_k)
}
