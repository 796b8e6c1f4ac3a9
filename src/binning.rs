//! Binning accumulators for the spectrum estimators
//!
//! A [`PowerSpectrumBinning`] collects weighted `|delta(k)|^2` samples into
//! radial shells; `normalize` folds the per-worker partial sums together
//! (an all-reduce) and converts them to count-weighted means. The
//! [`PolyspectrumBinning`] adds the flat `n^ORDER` tensors for the n-point
//! estimator, indexed mixed-radix with the first bin index most
//! significant, plus a `computed` bitmap that distinguishes entries the
//! engine actually evaluated from genuine zeros.
//!
//! All k values are in units of 2π per box length; `scale` converts to
//! physical units once a spectrum has been computed.

use crate::comm::Communicator;
use crate::error::{Error, Result};

/// Linear or logarithmic shell spacing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinScale {
    Linear,
    Log,
}

/// Radial binning for P(k).
#[derive(Debug, Clone)]
pub struct PowerSpectrumBinning {
    n: usize,
    kmin: f64,
    kmax: f64,
    scale: BinScale,
    /// Count-weighted mean k per bin (after `normalize`).
    pub kbin: Vec<f64>,
    /// Count-weighted mean power per bin (after `normalize`).
    pub pofk: Vec<f64>,
    /// Accumulated mode weight per bin.
    pub count: Vec<f64>,
}

impl PowerSpectrumBinning {
    pub fn new(n: usize, kmin: f64, kmax: f64, scale: BinScale) -> Result<Self> {
        if n < 1 {
            return Err(Error::BadBinning("need at least one bin".to_string()));
        }
        if kmin < 0.0 || kmin >= kmax {
            return Err(Error::BadBinning(format!(
                "need 0 <= kmin < kmax, got [{kmin}, {kmax}]"
            )));
        }
        if scale == BinScale::Log && kmin <= 0.0 {
            return Err(Error::BadBinning("log binning needs kmin > 0".to_string()));
        }
        Ok(PowerSpectrumBinning {
            n,
            kmin,
            kmax,
            scale,
            kbin: vec![0.0; n],
            pofk: vec![0.0; n],
            count: vec![0.0; n],
        })
    }

    /// Linear binning over `[kmin, kmax]` with `n` bins.
    pub fn linear(n: usize, kmin: f64, kmax: f64) -> Result<Self> {
        Self::new(n, kmin, kmax, BinScale::Linear)
    }

    pub fn n(&self) -> usize {
        self.n
    }

    pub fn kmin(&self) -> f64 {
        self.kmin
    }

    pub fn kmax(&self) -> f64 {
        self.kmax
    }

    /// Bin index for a mode of magnitude `k`, or `None` when out of range.
    pub fn bin_index(&self, k: f64) -> Option<usize> {
        let t = match self.scale {
            BinScale::Linear => (k - self.kmin) / (self.kmax - self.kmin),
            BinScale::Log => {
                if k <= 0.0 {
                    return None;
                }
                (k.ln() - self.kmin.ln()) / (self.kmax.ln() - self.kmin.ln())
            }
        };
        if !(0.0..1.0).contains(&t) {
            return None;
        }
        Some(((t * self.n as f64) as usize).min(self.n - 1))
    }

    /// Accumulate one weighted sample.
    pub fn add_to_bin(&mut self, k: f64, value: f64, weight: f64) {
        if let Some(i) = self.bin_index(k) {
            self.kbin[i] += k * weight;
            self.pofk[i] += value * weight;
            self.count[i] += weight;
        }
    }

    /// Zero all accumulators.
    pub fn reset(&mut self) {
        self.kbin.fill(0.0);
        self.pofk.fill(0.0);
        self.count.fill(0.0);
    }

    /// Midpoint of bin `i` on the binning's own scale.
    pub fn bin_midpoint(&self, i: usize) -> f64 {
        match self.scale {
            BinScale::Linear => {
                self.kmin + (i as f64 + 0.5) * (self.kmax - self.kmin) / self.n as f64
            }
            BinScale::Log => {
                let dln = (self.kmax.ln() - self.kmin.ln()) / self.n as f64;
                (self.kmin.ln() + (i as f64 + 0.5) * dln).exp()
            }
        }
    }

    /// Sum the accumulators over all workers, then turn them into
    /// count-weighted means. Empty bins keep zero power and report the bin
    /// midpoint as their k. Collective.
    pub fn normalize<C: Communicator>(&mut self, comm: &C) {
        let mut buf = Vec::with_capacity(3 * self.n);
        buf.extend_from_slice(&self.kbin);
        buf.extend_from_slice(&self.pofk);
        buf.extend_from_slice(&self.count);
        comm.allreduce_sum_in_place(&mut buf);
        self.kbin.copy_from_slice(&buf[..self.n]);
        self.pofk.copy_from_slice(&buf[self.n..2 * self.n]);
        self.count.copy_from_slice(&buf[2 * self.n..]);

        for i in 0..self.n {
            if self.count[i] > 0.0 {
                self.kbin[i] /= self.count[i];
                self.pofk[i] /= self.count[i];
            } else {
                self.kbin[i] = self.bin_midpoint(i);
            }
        }
    }

    /// Rescale to physical units: `kscale = 1 / L_box`,
    /// `pofkscale = L_box^D`.
    pub fn scale(&mut self, kscale: f64, pofkscale: f64) {
        for k in self.kbin.iter_mut() {
            *k *= kscale;
        }
        for p in self.pofk.iter_mut() {
            *p *= pofkscale;
        }
    }

    /// Merge another partial accumulation into this one (element-wise sum,
    /// valid before `normalize`).
    pub(crate) fn merge(&mut self, other: &PowerSpectrumBinning) {
        for (a, b) in self.kbin.iter_mut().zip(other.kbin.iter()) {
            *a += b;
        }
        for (a, b) in self.pofk.iter_mut().zip(other.pofk.iter()) {
            *a += b;
        }
        for (a, b) in self.count.iter_mut().zip(other.count.iter()) {
            *a += b;
        }
    }
}

/// Binning for the order-`ORDER` polyspectrum; `ORDER = 3` is the
/// bispectrum.
#[derive(Debug, Clone)]
pub struct PolyspectrumBinning<const ORDER: usize> {
    n: usize,
    kmin: f64,
    kmax: f64,
    /// Bin centers, linearly spaced over `[kmin, kmax]`.
    pub k: Vec<f64>,
    /// Mean |k| of the modes in each shell (bin center when empty).
    pub kbin: Vec<f64>,
    /// In-shell power spectrum.
    pub pofk: Vec<f64>,
    /// Polyspectrum values, flat tensor of length `n^ORDER`.
    pub p123: Vec<f64>,
    /// Generalized triangle counts, same shape.
    pub n123: Vec<f64>,
    computed: Vec<bool>,
}

pub type BispectrumBinning = PolyspectrumBinning<3>;

impl<const ORDER: usize> PolyspectrumBinning<ORDER> {
    pub fn new(n: usize, kmin: f64, kmax: f64) -> Result<Self> {
        if ORDER < 2 {
            return Err(Error::BadBinning("polyspectrum order must be >= 2".to_string()));
        }
        if n < 1 {
            return Err(Error::BadBinning("need at least one bin".to_string()));
        }
        if kmin < 0.0 || kmin >= kmax {
            return Err(Error::BadBinning(format!(
                "need 0 <= kmin < kmax, got [{kmin}, {kmax}]"
            )));
        }
        let k = if n == 1 {
            vec![0.5 * (kmin + kmax)]
        } else {
            (0..n)
                .map(|i| kmin + i as f64 * (kmax - kmin) / (n - 1) as f64)
                .collect()
        };
        let ntot = n.pow(ORDER as u32);
        Ok(PolyspectrumBinning {
            n,
            kmin,
            kmax,
            k,
            kbin: vec![0.0; n],
            pofk: vec![0.0; n],
            p123: vec![0.0; ntot],
            n123: vec![0.0; ntot],
            computed: vec![false; ntot],
        })
    }

    pub fn n(&self) -> usize {
        self.n
    }

    /// Center-to-center bin spacing.
    pub fn deltak(&self) -> f64 {
        if self.n > 1 {
            self.k[1] - self.k[0]
        } else {
            0.0
        }
    }

    /// Shell edges `[k_lo, k_hi)` per bin: midpoints between neighboring
    /// centers, truncated to the first and last center at the ends.
    pub fn edges(&self) -> (Vec<f64>, Vec<f64>) {
        let n = self.n;
        if n == 1 {
            return (vec![self.kmin], vec![self.kmax]);
        }
        let mut klow = vec![0.0; n];
        let mut khigh = vec![0.0; n];
        for i in 0..n {
            if i == 0 {
                klow[i] = self.k[0];
                khigh[i] = self.k[0] + (self.k[1] - self.k[0]) / 2.0;
            } else if i < n - 1 {
                klow[i] = khigh[i - 1];
                khigh[i] = self.k[i] + (self.k[i + 1] - self.k[i]) / 2.0;
            } else {
                klow[i] = khigh[i - 1];
                khigh[i] = self.k[n - 1];
            }
        }
        (klow, khigh)
    }

    /// Flat tensor index of an ordered bin tuple, first index most
    /// significant.
    pub fn index(&self, ik: &[usize; ORDER]) -> usize {
        let mut idx = 0;
        for &i in ik.iter() {
            debug_assert!(i < self.n);
            idx = idx * self.n + i;
        }
        idx
    }

    /// Inverse of [`Self::index`].
    pub fn tuple(&self, mut idx: usize) -> [usize; ORDER] {
        let mut ik = [0usize; ORDER];
        for slot in (0..ORDER).rev() {
            ik[slot] = idx % self.n;
            idx /= self.n;
        }
        ik
    }

    /// Polyspectrum value of a bin tuple.
    pub fn get(&self, ik: &[usize; ORDER]) -> f64 {
        self.p123[self.index(ik)]
    }

    /// Whether the engine has evaluated (or symmetry-filled) this entry.
    pub fn is_computed(&self, idx: usize) -> bool {
        self.computed[idx]
    }

    pub(crate) fn set_computed(&mut self, idx: usize) {
        self.computed[idx] = true;
    }

    pub(crate) fn copy_entry(&mut self, from: usize, to: usize) {
        self.p123[to] = self.p123[from];
        self.n123[to] = self.n123[from];
        self.computed[to] = self.computed[from];
    }

    pub fn reset(&mut self) {
        self.kbin.fill(0.0);
        self.pofk.fill(0.0);
        self.p123.fill(0.0);
        self.n123.fill(0.0);
        self.computed.fill(false);
    }
}
