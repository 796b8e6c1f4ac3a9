//! Worker-pool parity tests: every estimator must produce the same numbers
//! on one worker and on a multi-worker world holding the same global data.

mod common;

use std::f64::consts::PI;

use rand::Rng;

use polyspec_core::assignment::AssignmentKernel;
use polyspec_core::binning::{BispectrumBinning, PowerSpectrumBinning};
use polyspec_core::comm::{Communicator, LocalComm, ThreadWorld};
use polyspec_core::fft;
use polyspec_core::grid::SlabGrid;
use polyspec_core::particles::ParticleSet;
use polyspec_core::polyspectrum::compute_bispectrum;
use polyspec_core::power::{
    bin_up_power_spectrum, compute_power_spectrum, compute_power_spectrum_interlacing,
    compute_power_spectrum_multipoles_particles, LosAveraging,
};

use common::{fill_white_noise, max_rel_diff, random_particles, seeded_rng, take_local_slice};

const TWO_PI: f64 = 2.0 * PI;

#[test]
fn test_bin_up_parity_across_world_sizes() {
    let n = 16;
    let reference = {
        let comm = LocalComm;
        let mut grid = SlabGrid::<3>::new(n, 0, 0, &comm).unwrap();
        fill_white_noise(&mut grid, 271);
        fft::forward(&mut grid, &comm).unwrap();
        let mut pofk = PowerSpectrumBinning::linear(6, 0.0, 8.0 * TWO_PI).unwrap();
        bin_up_power_spectrum(&grid, &mut pofk, &comm).unwrap();
        pofk
    };

    for nranks in [2, 3] {
        let results = ThreadWorld::run(nranks, |comm| {
            let mut grid = SlabGrid::<3>::new(n, 0, 0, &comm).unwrap();
            fill_white_noise(&mut grid, 271);
            fft::forward(&mut grid, &comm).unwrap();
            let mut pofk = PowerSpectrumBinning::linear(6, 0.0, 8.0 * TWO_PI).unwrap();
            bin_up_power_spectrum(&grid, &mut pofk, &comm).unwrap();
            pofk
        });
        for pofk in results {
            assert_eq!(pofk.count, reference.count, "mode counts differ on {nranks} ranks");
            let diff = max_rel_diff(&pofk.pofk, &reference.pofk, 1e-14);
            assert!(diff < 1e-9, "P(k) differs by {diff} on {nranks} ranks");
        }
    }
}

#[test]
fn test_power_spectrum_parity_with_two_workers() {
    let n = 16;
    let mut rng = seeded_rng(313);
    let all = random_particles::<3>(500, &mut rng);

    let reference = {
        let comm = LocalComm;
        let set = ParticleSet::from_local(all.clone(), &comm);
        let mut pofk = PowerSpectrumBinning::linear(6, 0.0, 8.0 * TWO_PI).unwrap();
        compute_power_spectrum(n, &set, &mut pofk, AssignmentKernel::Tsc, &comm).unwrap();
        pofk
    };

    let results = ThreadWorld::run(2, |comm| {
        let local = take_local_slice(&all, n, comm.rank(), comm.size());
        let set = ParticleSet::from_local(local, &comm);
        assert_eq!(set.npart_total(), 500);
        let mut pofk = PowerSpectrumBinning::linear(6, 0.0, 8.0 * TWO_PI).unwrap();
        compute_power_spectrum(n, &set, &mut pofk, AssignmentKernel::Tsc, &comm).unwrap();
        pofk
    });
    for pofk in results {
        let diff = max_rel_diff(&pofk.pofk, &reference.pofk, 1e-14);
        assert!(diff < 1e-9, "distributed P(k) deviates by {diff}");
        assert_eq!(pofk.count, reference.count);
    }
}

#[test]
fn test_interlaced_power_spectrum_parity_with_two_workers() {
    let n = 16;
    let mut rng = seeded_rng(127);
    let all = random_particles::<3>(400, &mut rng);

    let reference = {
        let comm = LocalComm;
        let mut set = ParticleSet::from_local(all.clone(), &comm);
        let mut pofk = PowerSpectrumBinning::linear(5, 0.0, 8.0 * TWO_PI).unwrap();
        compute_power_spectrum_interlacing(n, &mut set, &mut pofk, AssignmentKernel::Pcs, &comm)
            .unwrap();
        pofk
    };

    let results = ThreadWorld::run(2, |comm| {
        let local = take_local_slice(&all, n, comm.rank(), comm.size());
        let mut set = ParticleSet::from_local(local, &comm);
        let mut pofk = PowerSpectrumBinning::linear(5, 0.0, 8.0 * TWO_PI).unwrap();
        compute_power_spectrum_interlacing(n, &mut set, &mut pofk, AssignmentKernel::Pcs, &comm)
            .unwrap();
        pofk
    });
    for pofk in results {
        let diff = max_rel_diff(&pofk.pofk, &reference.pofk, 1e-14);
        assert!(diff < 1e-9, "distributed interlaced P(k) deviates by {diff}");
    }
}

#[test]
fn test_redshift_multipoles_parity_with_two_workers() {
    // Exercises particle re-homing: the velocity displacement moves
    // particles across the slab boundary and back.
    let n = 8;
    let mut rng = seeded_rng(997);
    let mut all = random_particles::<3>(300, &mut rng);
    for p in all.iter_mut() {
        for v in p.vel.iter_mut() {
            *v = 2.0 * (rng.gen::<f64>() - 0.5);
        }
    }

    let run_local = {
        let comm = LocalComm;
        let mut set = ParticleSet::from_local(all.clone(), &comm);
        let mut pell: Vec<PowerSpectrumBinning> = (0..3)
            .map(|_| PowerSpectrumBinning::linear(3, TWO_PI, 4.0 * TWO_PI).unwrap())
            .collect();
        compute_power_spectrum_multipoles_particles(
            n,
            &mut set,
            0.05,
            &mut pell,
            AssignmentKernel::Cic,
            LosAveraging::MeanOverAxes,
            &comm,
        )
        .unwrap();
        pell
    };

    let results = ThreadWorld::run(2, |comm| {
        let local = take_local_slice(&all, n, comm.rank(), comm.size());
        let mut set = ParticleSet::from_local(local, &comm);
        let mut pell: Vec<PowerSpectrumBinning> = (0..3)
            .map(|_| PowerSpectrumBinning::linear(3, TWO_PI, 4.0 * TWO_PI).unwrap())
            .collect();
        compute_power_spectrum_multipoles_particles(
            n,
            &mut set,
            0.05,
            &mut pell,
            AssignmentKernel::Cic,
            LosAveraging::MeanOverAxes,
            &comm,
        )
        .unwrap();
        pell
    });
    for pell in results {
        for ell in 0..3 {
            let diff = max_rel_diff(&pell[ell].pofk, &run_local[ell].pofk, 1e-12);
            assert!(diff < 1e-9, "multipole {ell} deviates by {diff}");
        }
    }
}

#[test]
fn test_bispectrum_parity_with_two_workers() {
    let n = 8;
    let mut rng = seeded_rng(31);
    let all = random_particles::<3>(200, &mut rng);

    let reference = {
        let comm = LocalComm;
        let set = ParticleSet::from_local(all.clone(), &comm);
        let mut bofk = BispectrumBinning::new(3, TWO_PI, 3.0 * TWO_PI).unwrap();
        compute_bispectrum(n, &set, &mut bofk, AssignmentKernel::Cic, &comm).unwrap();
        bofk
    };

    let results = ThreadWorld::run(2, |comm| {
        let local = take_local_slice(&all, n, comm.rank(), comm.size());
        let set = ParticleSet::from_local(local, &comm);
        let mut bofk = BispectrumBinning::new(3, TWO_PI, 3.0 * TWO_PI).unwrap();
        compute_bispectrum(n, &set, &mut bofk, AssignmentKernel::Cic, &comm).unwrap();
        bofk
    });
    for bofk in results {
        let diff = max_rel_diff(&bofk.p123, &reference.p123, 1e-12);
        assert!(diff < 1e-8, "distributed bispectrum deviates by {diff}");
        let diff = max_rel_diff(&bofk.n123, &reference.n123, 1e-12);
        assert!(diff < 1e-8, "distributed triangle counts deviate by {diff}");
    }
}

#[test]
fn test_direct_summation_precondition_on_two_workers() {
    use polyspec_core::power::compute_power_spectrum_direct_summation;
    let n = 8;
    let mut rng = seeded_rng(61);
    let all = random_particles::<3>(64, &mut rng);

    // Every worker holding the full set is accepted and reproduces the
    // single-worker answer.
    let reference = {
        let comm = LocalComm;
        let set = ParticleSet::from_local(all.clone(), &comm);
        let mut pofk = PowerSpectrumBinning::linear(3, 0.5 * TWO_PI, 2.0 * TWO_PI).unwrap();
        compute_power_spectrum_direct_summation(n, &set, &mut pofk, &comm).unwrap();
        pofk
    };
    let results = ThreadWorld::run(2, |comm| {
        let set = ParticleSet::from_local(all.clone(), &comm);
        let mut pofk = PowerSpectrumBinning::linear(3, 0.5 * TWO_PI, 2.0 * TWO_PI).unwrap();
        compute_power_spectrum_direct_summation(n, &set, &mut pofk, &comm).unwrap();
        pofk
    });
    for pofk in results {
        let diff = max_rel_diff(&pofk.pofk, &reference.pofk, 1e-14);
        assert!(diff < 1e-9, "direct summation deviates by {diff}");
    }

    // Mismatched local counts violate the precondition on every rank.
    let failures = ThreadWorld::run(2, |comm| {
        let local = if comm.rank() == 0 { all.clone() } else { all[..32].to_vec() };
        let set = ParticleSet::from_local(local, &comm);
        let mut pofk = PowerSpectrumBinning::linear(3, 0.5 * TWO_PI, 2.0 * TWO_PI).unwrap();
        compute_power_spectrum_direct_summation(n, &set, &mut pofk, &comm).is_err()
    });
    assert!(failures[0] && failures[1]);
}
