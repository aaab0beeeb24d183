//! Discretization of continuous survival time into ordinal risk bins and the
//! composite (risk bin, censorship) label space.
use crate::{Censorship, Result};
use itertools::Itertools;
use qu::ick_use::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Margin added below the global minimum and above the global maximum so the
/// right-open bins cover every patient.
pub const DEFAULT_EPS: f64 = 1e-6;

/// Quantile cut-points over the event-observed patients' times.
///
/// Linear-interpolation quantiles (the closest-ranks scheme pandas uses), one
/// at each multiple of `1 / n_bins`, so the result always has `n_bins + 1`
/// entries. Degenerate distributions are an error rather than a silently
/// shrunken bin count.
pub fn quantile_cut_points(times: &[f64], n_bins: usize) -> Result<Vec<f64>> {
    ensure!(n_bins >= 1, "requested bin count must be at least 1");
    ensure!(
        !times.is_empty(),
        "no event-observed patients to compute quantiles from"
    );
    ensure!(
        times.iter().all(|t| t.is_finite()),
        "non-finite event time among event-observed patients"
    );
    let mut sorted = times.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).expect("times checked finite above"));
    let distinct = sorted.iter().dedup().count();
    ensure!(
        distinct >= n_bins,
        "event-observed patients have {} distinct times, fewer than the {} requested bins",
        distinct,
        n_bins
    );
    let cut_points: Vec<f64> = (0..=n_bins)
        .map(|i| quantile(&sorted, i as f64 / n_bins as f64))
        .collect();
    for (a, b) in cut_points.iter().tuple_windows() {
        ensure!(
            a < b,
            "degenerate time distribution: quantile cut-points {} and {} coincide",
            a,
            b
        );
    }
    Ok(cut_points)
}

fn quantile(sorted: &[f64], q: f64) -> f64 {
    let pos = q * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    if lo == hi {
        sorted[lo]
    } else {
        sorted[lo] + (pos - lo as f64) * (sorted[hi] - sorted[lo])
    }
}

/// Push the outermost cut-points a little past the global (all-patient)
/// extremes, so right-open membership assigns censored patients outside the
/// event-observed range to the first or last bin instead of to nothing.
pub fn widen_cut_points(cut_points: &mut [f64], global_min: f64, global_max: f64, eps: f64) {
    let last = cut_points.len() - 1;
    cut_points[0] = global_min - eps;
    cut_points[last] = global_max + eps;
}

/// Right-open interval membership: bin `i` is `[cut_points[i], cut_points[i+1])`.
pub fn assign_bin(time: f64, cut_points: &[f64]) -> Result<usize> {
    cut_points
        .windows(2)
        .position(|w| time >= w[0] && time < w[1])
        .ok_or_else(|| {
            format_err!(
                "event time {} falls outside the widened bins {:?}",
                time,
                cut_points
            )
        })
}

/// The composite label space: every (risk bin, censorship) pair mapped to a
/// unique id, enumerated bin-major then censorship, `2 * n_bins` ids total.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabelSpace {
    n_bins: usize,
    ids: BTreeMap<(usize, u8), usize>,
}

impl LabelSpace {
    pub fn new(n_bins: usize) -> Self {
        let mut ids = BTreeMap::new();
        let mut next_id = 0;
        for bin in 0..n_bins {
            for censorship in [Censorship::Observed, Censorship::Censored] {
                ids.insert((bin, censorship.as_u8()), next_id);
                next_id += 1;
            }
        }
        LabelSpace { n_bins, ids }
    }

    pub fn n_bins(&self) -> usize {
        self.n_bins
    }

    pub fn num_classes(&self) -> usize {
        self.ids.len()
    }

    /// Composite id for the pair. A miss is structurally impossible for bins
    /// in range, but validated all the same.
    pub fn id(&self, bin: usize, censorship: Censorship) -> Result<usize> {
        self.ids
            .get(&(bin, censorship.as_u8()))
            .copied()
            .ok_or_else(|| {
                format_err!(
                    "no composite label for bin {} with censorship {}",
                    bin,
                    censorship
                )
            })
    }

    /// All `((bin, censorship), id)` entries in enumeration order.
    pub fn entries(&self) -> impl Iterator<Item = ((usize, u8), usize)> + '_ {
        self.ids.iter().map(|(&key, &id)| (key, id))
    }
}

/// Group row indices by class id. Labels must already be in `[0, num_classes)`.
pub fn class_index_groups(
    labels: impl IntoIterator<Item = usize>,
    num_classes: usize,
) -> Vec<Vec<usize>> {
    let mut groups = vec![Vec::new(); num_classes];
    for (idx, label) in labels.into_iter().enumerate() {
        groups[label].push(idx);
    }
    groups
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn cut_point_count() {
        let times: Vec<f64> = (0..50).map(f64::from).collect();
        for n_bins in 1..6 {
            let cuts = quantile_cut_points(&times, n_bins).unwrap();
            assert_eq!(cuts.len(), n_bins + 1);
        }
    }

    #[test]
    fn every_patient_lands_in_a_bin() {
        let uncensored: Vec<f64> = (10..90).map(f64::from).collect();
        let mut cuts = quantile_cut_points(&uncensored, 4).unwrap();
        // censored patients extend the observed range on both sides
        widen_cut_points(&mut cuts, 2., 120., DEFAULT_EPS);
        for time in [2., 10., 55., 89., 120.] {
            let bin = assign_bin(time, &cuts).unwrap();
            assert!(bin < 4);
        }
    }

    #[test]
    fn quartiles_split_evenly() {
        // 100 patients, all events observed, 4 bins -> 25 per bin.
        let times: Vec<f64> = (0..100).map(f64::from).collect();
        let mut cuts = quantile_cut_points(&times, 4).unwrap();
        widen_cut_points(&mut cuts, 0., 99., DEFAULT_EPS);
        let mut counts = [0usize; 4];
        for &t in &times {
            counts[assign_bin(t, &cuts).unwrap()] += 1;
        }
        assert_eq!(counts, [25, 25, 25, 25]);
    }

    #[test]
    fn too_few_distinct_times() {
        let times = [1., 1., 1., 2.];
        assert!(quantile_cut_points(&times, 4).is_err());
    }

    #[test]
    fn empty_uncensored_subset() {
        assert!(quantile_cut_points(&[], 4).is_err());
    }

    #[test]
    fn label_space_is_a_bijection() {
        for n_bins in 1..5 {
            let space = LabelSpace::new(n_bins);
            assert_eq!(space.num_classes(), 2 * n_bins);
            let mut seen: Vec<usize> = space.entries().map(|(_, id)| id).collect();
            seen.sort_unstable();
            assert_eq!(seen, (0..2 * n_bins).collect::<Vec<_>>());
        }
    }

    #[test]
    fn label_enumeration_is_bin_major() {
        let space = LabelSpace::new(2);
        assert_eq!(space.id(0, Censorship::Observed).unwrap(), 0);
        assert_eq!(space.id(0, Censorship::Censored).unwrap(), 1);
        assert_eq!(space.id(1, Censorship::Observed).unwrap(), 2);
        assert_eq!(space.id(1, Censorship::Censored).unwrap(), 3);
        assert!(space.id(2, Censorship::Observed).is_err());
    }

    #[test]
    fn group_sizes_sum_to_row_count() {
        let labels = [0usize, 1, 1, 3, 0, 2];
        let groups = class_index_groups(labels, 4);
        assert_eq!(groups.iter().map(Vec::len).sum::<usize>(), 6);
        assert_eq!(groups[1], vec![1, 2]);
    }
}
