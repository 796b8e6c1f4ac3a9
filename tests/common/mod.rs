//! Common test utilities for the polyspec-core integration tests

#![allow(dead_code)]

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

use polyspec_core::grid::SlabGrid;
use polyspec_core::particles::Particle;

pub fn seeded_rng(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}

/// Uniform random particles in the unit box.
pub fn random_particles<const D: usize>(n: usize, rng: &mut StdRng) -> Vec<Particle<D>> {
    (0..n)
        .map(|_| {
            let mut pos = [0.0; D];
            for x in pos.iter_mut() {
                *x = rng.gen::<f64>();
            }
            Particle { pos, vel: [0.0; D] }
        })
        .collect()
}

/// Fill a grid's owned cells with unit-variance white noise. Every rank
/// draws the full field from the same seed and keeps its own slab, so the
/// global field is identical for every world size.
pub fn fill_white_noise<const D: usize>(grid: &mut SlabGrid<D>, seed: u64) {
    let mut rng = seeded_rng(seed);
    let n = grid.nmesh();
    let plane: usize = n.pow(D as u32 - 1);
    let skip = grid.local_x_start() * plane;
    for _ in 0..skip {
        let _: f64 = rng.sample(StandardNormal);
    }
    for c in grid.real_cells_mut().iter_mut() {
        *c = rng.sample(StandardNormal);
    }
}

/// Keep only the particles owned by this rank's slab of an `nmesh` grid.
pub fn take_local_slice<const D: usize>(
    all: &[Particle<D>],
    nmesh: usize,
    rank: usize,
    nranks: usize,
) -> Vec<Particle<D>> {
    let parts = polyspec_core::grid::slab_partition(nmesh, nranks);
    let (start, len) = parts[rank];
    all.iter()
        .copied()
        .filter(|p| {
            let plane = ((p.pos[0] * nmesh as f64).floor() as usize).min(nmesh - 1);
            plane >= start && plane < start + len
        })
        .collect()
}

/// Largest relative deviation between two binned spectra, ignoring bins
/// whose magnitudes both sit below the absolute floor.
pub fn max_rel_diff(a: &[f64], b: &[f64], floor: f64) -> f64 {
    a.iter()
        .zip(b.iter())
        .map(|(&x, &y)| {
            let scale = x.abs().max(y.abs());
            if scale < floor {
                0.0
            } else {
                (x - y).abs() / scale
            }
        })
        .fold(0.0, f64::max)
}
