//! Particle records and slab-ownership redistribution
//!
//! Particles carry box-normalized positions in `[0, 1)^D` and velocities in
//! caller units. Each worker holds the particles whose first coordinate
//! falls inside its slab of the mesh; after any displacement along the
//! first axis the set must be re-homed with [`ParticleSet::communicate`]
//! before the next scatter.

use crate::comm::Communicator;
use crate::grid::slab_partition;

/// One tracer particle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Particle<const D: usize> {
    /// Position in box units, `[0, 1)` per axis.
    pub pos: [f64; D],
    /// Velocity in caller units (converted to displacements by the
    /// redshift-space estimator's `velocity_to_displacement` factor).
    pub vel: [f64; D],
}

impl<const D: usize> Particle<D> {
    pub fn at(pos: [f64; D]) -> Self {
        Particle { pos, vel: [0.0; D] }
    }
}

/// A worker's share of the particle distribution, plus the global count.
#[derive(Debug, Clone)]
pub struct ParticleSet<const D: usize> {
    particles: Vec<Particle<D>>,
    npart_total: u64,
}

impl<const D: usize> ParticleSet<D> {
    /// Wrap this worker's local particles; the global count is summed over
    /// the pool.
    pub fn from_local<C: Communicator>(particles: Vec<Particle<D>>, comm: &C) -> Self {
        let npart_total = comm.allreduce_sum(particles.len() as f64) as u64;
        ParticleSet { particles, npart_total }
    }

    pub fn npart(&self) -> usize {
        self.particles.len()
    }

    pub fn npart_total(&self) -> u64 {
        self.npart_total
    }

    pub fn particles(&self) -> &[Particle<D>] {
        &self.particles
    }

    pub fn particles_mut(&mut self) -> &mut [Particle<D>] {
        &mut self.particles
    }

    /// Re-home every particle to the rank owning its x plane on an
    /// `nmesh`-cell slab decomposition. A collective call; the received
    /// particles arrive ordered by source rank, so the global multiset is
    /// preserved deterministically.
    pub fn communicate<C: Communicator>(&mut self, nmesh: usize, comm: &C) {
        let parts = slab_partition(nmesh, comm.size());
        let mut outgoing: Vec<Vec<f64>> = vec![Vec::new(); comm.size()];
        for p in &self.particles {
            let dest = owner_rank(p.pos[0], nmesh, &parts);
            let buf = &mut outgoing[dest];
            buf.extend_from_slice(&p.pos);
            buf.extend_from_slice(&p.vel);
        }
        let incoming = comm.all_to_all(outgoing);

        self.particles.clear();
        for buf in incoming {
            debug_assert_eq!(buf.len() % (2 * D), 0);
            for rec in buf.chunks_exact(2 * D) {
                let mut p = Particle { pos: [0.0; D], vel: [0.0; D] };
                p.pos.copy_from_slice(&rec[..D]);
                p.vel.copy_from_slice(&rec[D..]);
                self.particles.push(p);
            }
        }
    }
}

/// Rank owning position `x` under the given slab partition.
fn owner_rank(x: f64, nmesh: usize, parts: &[(usize, usize)]) -> usize {
    let plane = ((x * nmesh as f64).floor() as usize).min(nmesh - 1);
    for (rank, &(start, len)) in parts.iter().enumerate() {
        if plane < start + len {
            return rank;
        }
    }
    parts.len() - 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::{LocalComm, ThreadWorld};

    #[test]
    fn test_total_count_is_reduced() {
        let counts = ThreadWorld::run(3, |comm| {
            let local: Vec<Particle<2>> =
                (0..=comm.rank()).map(|_| Particle::at([0.5, 0.5])).collect();
            ParticleSet::from_local(local, &comm).npart_total()
        });
        assert_eq!(counts, vec![6, 6, 6]);
    }

    #[test]
    fn test_communicate_rehomes_particles() {
        let sets = ThreadWorld::run(2, |comm| {
            // Rank 0 starts with everything; mesh 8 over 2 ranks splits at x = 0.5.
            let local = if comm.rank() == 0 {
                vec![
                    Particle::<2>::at([0.1, 0.0]),
                    Particle::<2>::at([0.6, 0.0]),
                    Particle::<2>::at([0.45, 0.0]),
                    Particle::<2>::at([0.99, 0.0]),
                ]
            } else {
                Vec::new()
            };
            let mut set = ParticleSet::from_local(local, &comm);
            set.communicate(8, &comm);
            set.particles().iter().map(|p| p.pos[0]).collect::<Vec<_>>()
        });
        assert_eq!(sets[0], vec![0.1, 0.45]);
        assert_eq!(sets[1], vec![0.6, 0.99]);
    }

    #[test]
    fn test_communicate_single_rank_is_identity() {
        let comm = LocalComm;
        let mut set = ParticleSet::from_local(
            vec![Particle::<3>::at([0.2, 0.3, 0.4]), Particle::<3>::at([0.9, 0.1, 0.5])],
            &comm,
        );
        set.communicate(4, &comm);
        assert_eq!(set.npart(), 2);
        assert_eq!(set.particles()[0].pos, [0.2, 0.3, 0.4]);
    }
}
