//! Distributed real-to-complex FFT over a slab grid
//!
//! The transform is separable: the last (contiguous) axis and the middle
//! axes are fully local to each slab and are transformed with per-axis
//! gather/scatter line buffers. The first axis is distributed, so its
//! transform is bracketed by a pair of all-to-all slab transposes that make
//! it local and then restore the x-slab layout. The Fourier view therefore
//! keeps the same `local_nx` decomposition as the real view.
//!
//! Normalization: `forward` scales by `1/N^D`, so the DC amplitude equals
//! the mean of the real field (`sum_real / N^D` on the rank owning k = 0);
//! `inverse` applies no scale, making `forward` and `inverse` exact
//! inverses of each other.

use num_complex::Complex64;
use rayon::prelude::*;
use rustfft::{Fft, FftDirection, FftPlanner};
use std::sync::Arc;

use crate::comm::Communicator;
use crate::error::Result;
use crate::grid::{slab_partition, GridStatus, SlabGrid};

/// Forward real-to-complex transform. Requires `Real` state; leaves the
/// grid in `Fourier` state. Ghost planes are ignored.
pub fn forward<const D: usize, C: Communicator>(grid: &mut SlabGrid<D>, comm: &C) -> Result<()> {
    grid.require_status(GridStatus::Real)?;
    let n = grid.nmesh();
    let nlast = n / 2 + 1;
    let local_nx = grid.local_nx();
    let mid = grid.n_fourier_mid();

    let mut planner = FftPlanner::new();
    let plan = planner.plan_fft(n, FftDirection::Forward);

    // Last axis: real lines are contiguous; transform and keep the
    // non-negative half of the spectrum.
    let mut work = vec![Complex64::new(0.0, 0.0); local_nx * mid * nlast];
    work.par_chunks_mut(nlast)
        .zip(grid.real_cells().par_chunks(n))
        .for_each_init(
            || line_buffers(n, &plan),
            |(line, scratch), (packed, cells)| {
                for (c, &r) in line.iter_mut().zip(cells.iter()) {
                    *c = Complex64::new(r, 0.0);
                }
                plan.process_with_scratch(line, scratch);
                packed.copy_from_slice(&line[..nlast]);
            },
        );

    // Middle axes are local as well.
    let dims = packed_dims::<D>(local_nx, n, nlast);
    for axis in 1..D - 1 {
        transform_axis(&mut work, &dims, axis, &plan);
    }

    // Distributed first axis: transpose, transform, transpose back.
    transform_x_axis(&mut work, local_nx, dims[1], dims[2..].iter().product(), n, &plan, comm);

    // FFTW-style normalization so that the DC mode carries the field mean.
    let norm = 1.0 / (n as f64).powi(D as i32);
    for c in work.iter_mut() {
        *c *= norm;
    }

    grid.fourier_cells_mut().copy_from_slice(&work);
    grid.set_status(GridStatus::Fourier);
    Ok(())
}

/// Inverse complex-to-real transform. Requires `Fourier` state; leaves the
/// grid in `Real` state with the owned planes rewritten (ghost planes are
/// left stale — re-fill them with `communicate_ghosts` when needed).
pub fn inverse<const D: usize, C: Communicator>(grid: &mut SlabGrid<D>, comm: &C) -> Result<()> {
    grid.require_status(GridStatus::Fourier)?;
    let n = grid.nmesh();
    let nlast = n / 2 + 1;
    let local_nx = grid.local_nx();

    let mut planner = FftPlanner::new();
    let plan = planner.plan_fft(n, FftDirection::Inverse);

    let mut work = grid.fourier_cells().to_vec();
    let dims = packed_dims::<D>(local_nx, n, nlast);

    // Undo the forward steps in reverse order.
    transform_x_axis(&mut work, local_nx, dims[1], dims[2..].iter().product(), n, &plan, comm);
    for axis in (1..D - 1).rev() {
        transform_axis(&mut work, &dims, axis, &plan);
    }

    // Last axis: rebuild the negative-frequency half from Hermitian
    // symmetry, transform, and keep the real part.
    work.par_chunks(nlast)
        .zip(grid.real_cells_mut().par_chunks_mut(n))
        .for_each_init(
            || line_buffers(n, &plan),
            |(line, scratch), (packed, cells)| {
                line[..nlast].copy_from_slice(packed);
                for j in nlast..n {
                    line[j] = packed[n - j].conj();
                }
                plan.process_with_scratch(line, scratch);
                for (r, c) in cells.iter_mut().zip(line.iter()) {
                    *r = c.re;
                }
            },
        );

    grid.set_status(GridStatus::Real);
    Ok(())
}

/// Dims of the packed spectrum seen as a `D`-dimensional row-major array:
/// `[local_nx, N, ..., N, N/2 + 1]`.
fn packed_dims<const D: usize>(local_nx: usize, n: usize, nlast: usize) -> Vec<usize> {
    let mut dims = vec![n; D];
    dims[0] = local_nx;
    dims[D - 1] = nlast;
    dims
}

fn line_buffers(n: usize, plan: &Arc<dyn Fft<f64>>) -> (Vec<Complex64>, Vec<Complex64>) {
    (
        vec![Complex64::new(0.0, 0.0); n],
        vec![Complex64::new(0.0, 0.0); plan.get_inplace_scratch_len()],
    )
}

/// Transform every line of `data` along `axis` (a local, possibly strided
/// axis) with gather/scatter line buffers.
fn transform_axis(data: &mut [Complex64], dims: &[usize], axis: usize, plan: &Arc<dyn Fft<f64>>) {
    let len = dims[axis];
    let inner: usize = dims[axis + 1..].iter().product();
    let block = len * inner;
    data.par_chunks_mut(block).for_each_init(
        || line_buffers(len, plan),
        |(line, scratch), chunk| {
            for i in 0..inner {
                for t in 0..len {
                    line[t] = chunk[t * inner + i];
                }
                plan.process_with_scratch(line, scratch);
                for t in 0..len {
                    chunk[t * inner + i] = line[t];
                }
            }
        },
    );
}

/// Transform along the distributed x axis: transpose so that each rank
/// holds full x lines for a chunk of the second axis, transform them, and
/// transpose back into the x-slab layout. `n1` is the second-axis length
/// (`N` for D >= 3, `N/2 + 1` for D = 2) and `rest` the product of the
/// remaining axis lengths.
fn transform_x_axis<C: Communicator>(
    work: &mut [Complex64],
    local_nx: usize,
    n1: usize,
    rest: usize,
    n: usize,
    plan: &Arc<dyn Fft<f64>>,
    comm: &C,
) {
    let parts_x = slab_partition(n, comm.size());
    let parts_1 = slab_partition(n1, comm.size());
    let my_nj1 = parts_1[comm.rank()].1;

    // Scatter: the block for rank r holds my x planes restricted to r's
    // chunk of the second axis.
    let sends = parts_1
        .iter()
        .map(|&(j1_start, nj1)| {
            let mut buf = Vec::with_capacity(2 * local_nx * nj1 * rest);
            for ix in 0..local_nx {
                for j1 in j1_start..j1_start + nj1 {
                    let base = (ix * n1 + j1) * rest;
                    for c in &work[base..base + rest] {
                        buf.push(c.re);
                        buf.push(c.im);
                    }
                }
            }
            buf
        })
        .collect();
    let recvs = comm.all_to_all(sends);

    // Gather into `[my_nj1][N][rest]` with the global x index in the middle.
    let mut lines = vec![Complex64::new(0.0, 0.0); my_nj1 * n * rest];
    for (src, buf) in recvs.iter().enumerate() {
        let (x_start, nx) = parts_x[src];
        let mut it = buf.chunks_exact(2);
        for ix in 0..nx {
            let gx = x_start + ix;
            for j1 in 0..my_nj1 {
                for t in 0..rest {
                    let pair = it.next().expect("transpose block too short");
                    lines[(j1 * n + gx) * rest + t] = Complex64::new(pair[0], pair[1]);
                }
            }
        }
    }

    transform_axis(&mut lines, &[my_nj1, n, rest], 1, plan);

    // Reverse transpose: send each rank its x planes back.
    let sends = parts_x
        .iter()
        .map(|&(x_start, nx)| {
            let mut buf = Vec::with_capacity(2 * nx * my_nj1 * rest);
            for ix in x_start..x_start + nx {
                for j1 in 0..my_nj1 {
                    let base = (j1 * n + ix) * rest;
                    for c in &lines[base..base + rest] {
                        buf.push(c.re);
                        buf.push(c.im);
                    }
                }
            }
            buf
        })
        .collect();
    let recvs = comm.all_to_all(sends);

    for (src, buf) in recvs.iter().enumerate() {
        let (j1_start, nj1) = parts_1[src];
        let mut it = buf.chunks_exact(2);
        for ix in 0..local_nx {
            for j1 in j1_start..j1_start + nj1 {
                for t in 0..rest {
                    let pair = it.next().expect("transpose block too short");
                    work[(ix * n1 + j1) * rest + t] = Complex64::new(pair[0], pair[1]);
                }
            }
        }
    }
}
