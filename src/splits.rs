//! Repeated stratified train/val/test partitioning.
//!
//! A [`SplitGenerator`] is built once from validated [`SplitSettings`] and
//! yields exactly `n_splits` folds. All randomness comes from a single
//! explicitly seeded PRNG owned by the generator, advanced fold by fold, so
//! two generators built with the same seed and inputs produce identical
//! partitions and nothing leaks through process-global state.
use crate::Result;
use qu::ick_use::*;
use rand::{seq::SliceRandom, SeedableRng as _};
use rand_pcg::Pcg64Mcg;
use std::collections::BTreeSet;

#[derive(Debug, Clone)]
pub struct SplitSettings {
    /// Number of folds the generator will yield.
    pub n_splits: usize,
    /// Per-class validation quotas, one entry per label class.
    pub val_num: Vec<usize>,
    /// Per-class test quotas, one entry per label class.
    pub test_num: Vec<usize>,
    /// Per-class fraction of the post-quota remainder kept for training.
    pub label_frac: Vec<f64>,
    pub seed: u64,
    /// Fixed test set; overrides quota-based test sampling when present.
    pub custom_test_ids: Option<BTreeSet<usize>>,
    /// Per-class row-index groupings to sample from.
    pub cls_ids: Vec<Vec<usize>>,
    /// Total row count of the table the indices point into.
    pub samples: usize,
}

impl SplitSettings {
    /// Broadcast a scalar training fraction over `num_classes` classes.
    pub fn uniform_label_frac(frac: f64, num_classes: usize) -> Vec<f64> {
        vec![frac; num_classes]
    }
}

/// One generated partition triple of row indices.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FoldIndices {
    pub train: Vec<usize>,
    pub val: Vec<usize>,
    pub test: Vec<usize>,
}

impl FoldIndices {
    /// Partitions must never overlap; this re-checks what construction
    /// already guarantees and fails loudly if it ever stops holding.
    pub fn assert_disjoint(&self) -> Result {
        let train: BTreeSet<usize> = self.train.iter().copied().collect();
        let val: BTreeSet<usize> = self.val.iter().copied().collect();
        let test: BTreeSet<usize> = self.test.iter().copied().collect();
        ensure!(
            train.intersection(&val).next().is_none(),
            "train and val partitions overlap"
        );
        ensure!(
            train.intersection(&test).next().is_none(),
            "train and test partitions overlap"
        );
        ensure!(
            val.intersection(&test).next().is_none(),
            "val and test partitions overlap"
        );
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.train.len() + self.val.len() + self.test.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Lazy sequence of stratified folds. See the module docs for the
/// determinism contract.
pub struct SplitGenerator {
    settings: SplitSettings,
    rng: Pcg64Mcg,
    produced: usize,
}

impl SplitGenerator {
    /// Validate the settings and seed the generator.
    ///
    /// Quota and accounting problems are caught here, before any fold is
    /// produced: mismatched per-class sequences, quotas exceeding a class
    /// population, custom test ids that no class grouping accounts for.
    pub fn new(settings: SplitSettings) -> Result<Self> {
        let num_classes = settings.cls_ids.len();
        ensure!(num_classes > 0, "no label classes to stratify over");
        ensure!(settings.n_splits > 0, "requested zero folds");
        ensure!(
            settings.val_num.len() == num_classes,
            "val_num has {} entries for {} classes",
            settings.val_num.len(),
            num_classes
        );
        ensure!(
            settings.test_num.len() == num_classes,
            "test_num has {} entries for {} classes",
            settings.test_num.len(),
            num_classes
        );
        ensure!(
            settings.label_frac.len() == num_classes,
            "label_frac has {} entries for {} classes",
            settings.label_frac.len(),
            num_classes
        );
        for (cls, frac) in settings.label_frac.iter().enumerate() {
            ensure!(
                (0. ..=1.).contains(frac),
                "label_frac for class {} out of range: {}",
                cls,
                frac
            );
        }
        for (cls, group) in settings.cls_ids.iter().enumerate() {
            if let Some(&idx) = group.iter().find(|&&idx| idx >= settings.samples) {
                return Err(format_err!(
                    "class {} references row {} beyond the table's {} rows",
                    cls,
                    idx,
                    settings.samples
                ));
            }
            let reserved_test = match &settings.custom_test_ids {
                Some(custom) => group.iter().filter(|idx| custom.contains(idx)).count(),
                None => settings.test_num[cls],
            };
            ensure!(
                reserved_test + settings.val_num[cls] <= group.len(),
                "class {} has {} samples, fewer than the {} reserved for val and test",
                cls,
                group.len(),
                reserved_test + settings.val_num[cls]
            );
        }
        if let Some(custom) = &settings.custom_test_ids {
            let matched: BTreeSet<usize> = settings
                .cls_ids
                .iter()
                .flatten()
                .copied()
                .filter(|idx| custom.contains(idx))
                .collect();
            let missing: Vec<usize> = custom.difference(&matched).copied().collect();
            ensure!(
                missing.is_empty(),
                "custom test ids {:?} not found among class indices",
                missing
            );
        }
        let rng = Pcg64Mcg::seed_from_u64(settings.seed);
        Ok(SplitGenerator {
            settings,
            rng,
            produced: 0,
        })
    }

    pub fn settings(&self) -> &SplitSettings {
        &self.settings
    }
}

impl Iterator for SplitGenerator {
    type Item = FoldIndices;

    fn next(&mut self) -> Option<FoldIndices> {
        if self.produced == self.settings.n_splits {
            return None;
        }
        self.produced += 1;

        let settings = &self.settings;
        let mut fold = FoldIndices::default();
        for (cls, group) in settings.cls_ids.iter().enumerate() {
            let mut pool = group.clone();
            pool.shuffle(&mut self.rng);
            match &settings.custom_test_ids {
                Some(custom) => {
                    // the fixed test set replaces quota sampling for this class
                    pool.retain(|idx| !custom.contains(idx));
                    fold.test
                        .extend(group.iter().copied().filter(|idx| custom.contains(idx)));
                }
                None => {
                    fold.test.extend(pool.drain(..settings.test_num[cls]));
                }
            }
            fold.val.extend(pool.drain(..settings.val_num[cls]));
            // ceil keeps at least one sample for any positive fraction
            let keep = (settings.label_frac[cls] * pool.len() as f64).ceil() as usize;
            fold.train.extend(pool.drain(..keep.min(pool.len())));
        }
        Some(fold)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.settings.n_splits - self.produced;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for SplitGenerator {}
