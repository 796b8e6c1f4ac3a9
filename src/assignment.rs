//! Particle-to-grid density assignment and window deconvolution
//!
//! Mass is spread over neighboring cells with the classic B-spline family
//! of kernels (NGP, CIC, TSC, PCS). Cell centers sit at half-integer grid
//! coordinates, so a particle at `x` has grid position `p = x N` and the
//! cell containing it is `floor(p)`; deposits can spill into at most
//! `ceil(support)` ghost planes on either side of the slab, which are
//! folded back onto their owners afterwards.
//!
//! Each deposit carries `N^D / npart_total` times the kernel weight, so the
//! finished grid holds the density in units of the mean density and the DC
//! amplitude of its transform is 1.
//!
//! In Fourier space the assignment appears as multiplication by the kernel
//! window `W(k) = prod_j sinc^p(k_j / 2N)` with `p` the kernel order;
//! [`deconvolve_window`] divides it back out.

use rayon::prelude::*;
use std::str::FromStr;

use crate::comm::Communicator;
use crate::error::{Error, Result};
use crate::grid::{wavevector_of, GridStatus, SlabGrid};
use crate::particles::ParticleSet;

/// Window amplitudes below this are left untouched by deconvolution to
/// avoid amplifying round-off.
const WINDOW_FLOOR: f64 = 1e-10;

/// Density assignment kernel family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignmentKernel {
    /// Nearest grid point.
    Ngp,
    /// Cloud-in-cell (linear).
    Cic,
    /// Triangular-shaped cloud (quadratic).
    Tsc,
    /// Piecewise cubic spline.
    Pcs,
}

impl FromStr for AssignmentKernel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "NGP" => Ok(AssignmentKernel::Ngp),
            "CIC" => Ok(AssignmentKernel::Cic),
            "TSC" => Ok(AssignmentKernel::Tsc),
            "PCS" => Ok(AssignmentKernel::Pcs),
            other => Err(Error::UnknownKernel(other.to_string())),
        }
    }
}

impl AssignmentKernel {
    /// Interpolation order: the exponent of the per-axis sinc window.
    pub fn order(self) -> i32 {
        match self {
            AssignmentKernel::Ngp => 1,
            AssignmentKernel::Cic => 2,
            AssignmentKernel::Tsc => 3,
            AssignmentKernel::Pcs => 4,
        }
    }

    /// Ghost planes needed on each side of a slab for the scatter
    /// (`ceil` of the support radius). The interlaced scatter needs one
    /// more on the right for the half-cell shift.
    pub fn extra_slices(self) -> (usize, usize) {
        match self {
            AssignmentKernel::Ngp => (0, 0),
            AssignmentKernel::Cic => (1, 1),
            AssignmentKernel::Tsc => (2, 2),
            AssignmentKernel::Pcs => (2, 2),
        }
    }

    /// Largest cell offset from `floor(p)` that can carry weight.
    fn reach(self) -> isize {
        match self {
            AssignmentKernel::Ngp => 0,
            AssignmentKernel::Cic => 1,
            AssignmentKernel::Tsc => 1,
            AssignmentKernel::Pcs => 2,
        }
    }

    /// One-dimensional kernel weight at distance `u` from a cell center.
    fn weight(self, u: f64) -> f64 {
        let a = u.abs();
        match self {
            AssignmentKernel::Ngp => {
                // Floor assignment: u = frac(p) - 0.5 lies in [-0.5, 0.5).
                if (-0.5..0.5).contains(&u) {
                    1.0
                } else {
                    0.0
                }
            }
            AssignmentKernel::Cic => (1.0 - a).max(0.0),
            AssignmentKernel::Tsc => {
                if a < 0.5 {
                    0.75 - u * u
                } else if a < 1.5 {
                    0.5 * (1.5 - a) * (1.5 - a)
                } else {
                    0.0
                }
            }
            AssignmentKernel::Pcs => {
                if a < 1.0 {
                    (4.0 - 6.0 * u * u + 3.0 * a * a * a) / 6.0
                } else if a < 2.0 {
                    let t = 2.0 - a;
                    t * t * t / 6.0
                } else {
                    0.0
                }
            }
        }
    }
}

/// Scatter a worker's particles onto its slab, then fold ghost-plane
/// deposits back onto the owning ranks. The grid is zeroed first and must
/// be in `Real` state with at least `extra_slices()` ghost planes.
///
/// Particles whose kernel footprint does not fit inside the materialized
/// planes (i.e. particles that belong to another rank's slab) are a
/// precondition violation.
pub fn particles_to_grid<const D: usize, C: Communicator>(
    set: &ParticleSet<D>,
    grid: &mut SlabGrid<D>,
    kernel: AssignmentKernel,
    comm: &C,
) -> Result<()> {
    grid.require_status(GridStatus::Real)?;
    let (need_left, need_right) = kernel.extra_slices();
    if grid.n_left() < need_left || grid.n_right() < need_right {
        return Err(Error::Precondition(format!(
            "{kernel:?} assignment needs ({need_left}, {need_right}) ghost planes, grid has ({}, {})",
            grid.n_left(),
            grid.n_right()
        )));
    }

    let n = grid.nmesh();
    let reach = kernel.reach();
    let x_lo = grid.local_x_start() as isize - grid.n_left() as isize;
    let x_hi = (grid.local_x_start() + grid.local_nx() + grid.n_right()) as isize;

    // Every cell that will receive weight must be materialized locally.
    set.particles().par_iter().try_for_each(|p| {
        let p0 = p.pos[0] * n as f64;
        let c0 = p0.floor() as isize;
        for o in -reach..=reach {
            let c = c0 + o;
            if kernel.weight(p0 - c as f64 - 0.5) != 0.0 && !(x_lo..x_hi).contains(&c) {
                return Err(Error::Precondition(format!(
                    "particle at x = {} deposits outside this worker's slab",
                    p.pos[0]
                )));
            }
        }
        Ok(())
    })?;

    let real_len = grid.real_raw().len();
    let width = (2 * reach + 1) as usize;
    let combos = width.pow(D as u32);
    let deposit_norm = (n as f64).powi(D as i32) / set.npart_total() as f64;

    // Per-thread accumulation buffers, merged afterwards; concurrent
    // deposits into the same cell are expected.
    let deposits = set
        .particles()
        .par_chunks(2048)
        .fold(
            || vec![0.0f64; real_len],
            |mut buf, chunk| {
                let mut cells = [[0usize; 8]; D];
                let mut weights = [[0.0f64; 8]; D];
                for p in chunk {
                    for axis in 0..D {
                        let pa = p.pos[axis] * n as f64;
                        let ca = pa.floor() as isize;
                        for (slot, o) in (-reach..=reach).enumerate() {
                            let c = ca + o;
                            weights[axis][slot] = kernel.weight(pa - c as f64 - 0.5);
                            cells[axis][slot] = if axis == 0 {
                                (c - x_lo) as usize
                            } else {
                                c.rem_euclid(n as isize) as usize
                            };
                        }
                    }
                    for combo in 0..combos {
                        let mut slots = [0usize; D];
                        let mut rest = combo;
                        let mut w = 1.0;
                        for axis in 0..D {
                            slots[axis] = rest % width;
                            rest /= width;
                            w *= weights[axis][slots[axis]];
                        }
                        if w == 0.0 {
                            continue;
                        }
                        let mut idx = 0usize;
                        for axis in 0..D {
                            idx = idx * n + cells[axis][slots[axis]];
                        }
                        buf[idx] += deposit_norm * w;
                    }
                }
                buf
            },
        )
        .reduce(
            || vec![0.0f64; real_len],
            |mut a, b| {
                for (x, y) in a.iter_mut().zip(b.iter()) {
                    *x += y;
                }
                a
            },
        );

    grid.real_raw_mut().copy_from_slice(&deposits);
    grid.reduce_ghosts(comm);
    Ok(())
}

/// Divide every Fourier amplitude by the assignment window
/// `prod_j sinc^p(k_j / 2N)`. Modes whose window falls below the numeric
/// floor are left unchanged.
pub fn deconvolve_window<const D: usize>(
    grid: &mut SlabGrid<D>,
    kernel: AssignmentKernel,
) -> Result<()> {
    grid.require_status(GridStatus::Fourier)?;
    let n = grid.nmesh();
    let x_start = grid.local_x_start();
    let order = kernel.order();
    let half_cell = 1.0 / (2.0 * n as f64);

    grid.fourier_cells_mut().par_iter_mut().enumerate().for_each(|(idx, c)| {
        let k = wavevector_of::<D>(idx, n, x_start);
        let mut window = 1.0;
        for &kj in &k {
            window *= sinc(kj * half_cell);
        }
        let window = window.powi(order);
        if window.abs() > WINDOW_FLOOR {
            *c /= window;
        }
    });
    Ok(())
}

#[inline]
fn sinc(x: f64) -> f64 {
    if x.abs() < 1e-12 {
        1.0
    } else {
        x.sin() / x
    }
}
