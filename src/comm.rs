//! Worker-pool communication layer
//!
//! The estimators run on a fixed pool of workers, each owning one slab of
//! every grid. Workers communicate only through the [`Communicator`] trait:
//! neighbor send/receive for ghost planes, all-to-all for the FFT slab
//! transpose and particle redistribution, and all-reduce sums for the
//! binning reductions. Rank and world size are captured once at
//! construction and threaded explicitly through every collective call.
//!
//! Two implementations are provided: [`LocalComm`] for a world of size one
//! (every exchange loops back periodically onto the caller) and
//! [`ThreadWorld`], an in-process pool of scoped threads with mailbox slots
//! and barriers. All collective calls must be entered by every rank in the
//! same order; a rank that errors out must abort the whole computation
//! rather than skip a collective.

use std::sync::{Barrier, Mutex};

/// Message-passing interface between slab workers.
///
/// Every method except `rank`/`size` is collective: all ranks must call it
/// in the same program order. The all-reduce sums contributions in rank
/// order, so results are bitwise identical on every rank and across runs
/// with the same world size.
pub trait Communicator: Sync {
    /// This worker's rank in `0..size()`.
    fn rank(&self) -> usize;

    /// Number of workers in the pool.
    fn size(&self) -> usize;

    /// Send `send` to rank `dest` and receive the matching buffer from
    /// rank `src`. Used pairwise for the periodic halo exchange.
    fn sendrecv(&self, dest: usize, send: &[f64], src: usize) -> Vec<f64>;

    /// Exchange one buffer with every rank: `sends[r]` goes to rank `r`,
    /// the result's entry `r` is what rank `r` sent here. `sends` must have
    /// length `size()`.
    fn all_to_all(&self, sends: Vec<Vec<f64>>) -> Vec<Vec<f64>>;

    /// Element-wise sum of `data` over all ranks, written back in place.
    fn allreduce_sum_in_place(&self, data: &mut [f64]);

    /// Scalar all-reduce sum.
    fn allreduce_sum(&self, value: f64) -> f64 {
        let mut buf = [value];
        self.allreduce_sum_in_place(&mut buf);
        buf[0]
    }

    /// Synchronization point with no data exchange.
    fn barrier(&self);
}

/// Single-worker world. The periodic neighbor of rank 0 is rank 0 itself,
/// so `sendrecv` returns its own payload and reductions are the identity.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalComm;

impl Communicator for LocalComm {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn sendrecv(&self, dest: usize, send: &[f64], src: usize) -> Vec<f64> {
        assert_eq!(dest, 0, "rank out of range for single-worker world");
        assert_eq!(src, 0, "rank out of range for single-worker world");
        send.to_vec()
    }

    fn all_to_all(&self, sends: Vec<Vec<f64>>) -> Vec<Vec<f64>> {
        assert_eq!(sends.len(), 1, "all_to_all needs one buffer per rank");
        sends
    }

    fn allreduce_sum_in_place(&self, _data: &mut [f64]) {}

    fn barrier(&self) {}
}

/// In-process worker pool backed by scoped threads.
///
/// Each worker gets a [`ThreadComm`] handle. Point-to-point and all-to-all
/// traffic goes through per-(src, dst) mailbox slots; a shared [`Barrier`]
/// separates the fill and drain phases of every collective. The all-reduce
/// has every rank sum the per-rank contribution slots in rank order, which
/// makes the reduction deterministic.
pub struct ThreadWorld {
    size: usize,
    barrier: Barrier,
    slots: Vec<Mutex<Option<Vec<f64>>>>,
    contrib: Vec<Mutex<Vec<f64>>>,
}

impl ThreadWorld {
    pub fn new(size: usize) -> Self {
        assert!(size > 0, "world size must be positive");
        ThreadWorld {
            size,
            barrier: Barrier::new(size),
            slots: (0..size * size).map(|_| Mutex::new(None)).collect(),
            contrib: (0..size).map(|_| Mutex::new(Vec::new())).collect(),
        }
    }

    /// Run `f` once per rank on its own thread and collect the results in
    /// rank order. Panics in any worker propagate.
    pub fn run<F, R>(size: usize, f: F) -> Vec<R>
    where
        F: Fn(ThreadComm<'_>) -> R + Sync,
        R: Send,
    {
        let world = ThreadWorld::new(size);
        let mut results: Vec<Option<R>> = (0..size).map(|_| None).collect();
        std::thread::scope(|scope| {
            let mut handles = Vec::with_capacity(size);
            for rank in 0..size {
                let world = &world;
                let f = &f;
                handles.push(scope.spawn(move || f(ThreadComm { rank, world })));
            }
            for (rank, handle) in handles.into_iter().enumerate() {
                results[rank] = Some(handle.join().expect("worker thread panicked"));
            }
        });
        results.into_iter().map(|r| r.expect("missing worker result")).collect()
    }

    fn slot(&self, src: usize, dst: usize) -> &Mutex<Option<Vec<f64>>> {
        &self.slots[src * self.size + dst]
    }
}

/// Per-rank handle into a [`ThreadWorld`].
pub struct ThreadComm<'w> {
    rank: usize,
    world: &'w ThreadWorld,
}

impl Communicator for ThreadComm<'_> {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.world.size
    }

    fn sendrecv(&self, dest: usize, send: &[f64], src: usize) -> Vec<f64> {
        assert!(dest < self.world.size && src < self.world.size, "rank out of range");
        *self.world.slot(self.rank, dest).lock().unwrap() = Some(send.to_vec());
        self.world.barrier.wait();
        let recv = self
            .world
            .slot(src, self.rank)
            .lock()
            .unwrap()
            .take()
            .expect("sendrecv: no message from source rank");
        self.world.barrier.wait();
        recv
    }

    fn all_to_all(&self, sends: Vec<Vec<f64>>) -> Vec<Vec<f64>> {
        assert_eq!(sends.len(), self.world.size, "all_to_all needs one buffer per rank");
        for (dst, buf) in sends.into_iter().enumerate() {
            *self.world.slot(self.rank, dst).lock().unwrap() = Some(buf);
        }
        self.world.barrier.wait();
        let recvs = (0..self.world.size)
            .map(|src| {
                self.world
                    .slot(src, self.rank)
                    .lock()
                    .unwrap()
                    .take()
                    .expect("all_to_all: missing block")
            })
            .collect();
        self.world.barrier.wait();
        recvs
    }

    fn allreduce_sum_in_place(&self, data: &mut [f64]) {
        *self.world.contrib[self.rank].lock().unwrap() = data.to_vec();
        self.world.barrier.wait();
        for x in data.iter_mut() {
            *x = 0.0;
        }
        // Rank-ordered summation keeps the result identical on every rank.
        for src in 0..self.world.size {
            let part = self.world.contrib[src].lock().unwrap();
            assert_eq!(part.len(), data.len(), "allreduce length mismatch across ranks");
            for (x, &p) in data.iter_mut().zip(part.iter()) {
                *x += p;
            }
        }
        self.world.barrier.wait();
    }

    fn barrier(&self) {
        self.world.barrier.wait();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_comm_loops_back() {
        let comm = LocalComm;
        let got = comm.sendrecv(0, &[1.0, 2.0], 0);
        assert_eq!(got, vec![1.0, 2.0]);
        assert_eq!(comm.allreduce_sum(3.5), 3.5);
    }

    #[test]
    fn test_thread_world_allreduce() {
        let sums = ThreadWorld::run(4, |comm| {
            let mut data = vec![comm.rank() as f64, 1.0];
            comm.allreduce_sum_in_place(&mut data);
            data
        });
        for s in sums {
            assert_eq!(s, vec![6.0, 4.0]);
        }
    }

    #[test]
    fn test_thread_world_ring_sendrecv() {
        let got = ThreadWorld::run(3, |comm| {
            let right = (comm.rank() + 1) % comm.size();
            let left = (comm.rank() + comm.size() - 1) % comm.size();
            comm.sendrecv(right, &[comm.rank() as f64], left)
        });
        assert_eq!(got, vec![vec![2.0], vec![0.0], vec![1.0]]);
    }

    #[test]
    fn test_thread_world_all_to_all() {
        let got = ThreadWorld::run(2, |comm| {
            let sends = vec![vec![comm.rank() as f64 * 10.0], vec![comm.rank() as f64 * 10.0 + 1.0]];
            comm.all_to_all(sends)
        });
        assert_eq!(got[0], vec![vec![0.0], vec![10.0]]);
        assert_eq!(got[1], vec![vec![1.0], vec![11.0]]);
    }

    #[test]
    fn test_thread_world_repeated_collectives() {
        let got = ThreadWorld::run(2, |comm| {
            let mut acc = 0.0;
            for round in 0..5 {
                acc += comm.allreduce_sum(round as f64 + comm.rank() as f64);
            }
            acc
        });
        // Each round sums (round + 0) + (round + 1) = 2*round + 1.
        assert_eq!(got[0], 25.0);
        assert_eq!(got[1], 25.0);
    }
}
