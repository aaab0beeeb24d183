//! The labeled survival dataset and its materialized partition views.
use crate::{
    archive::{archive_key, DataSource, Sample, SlideArchive, SlideTensors},
    labels::{self, LabelSpace},
    patient_slide_map,
    splits::{FoldIndices, SplitGenerator, SplitSettings},
    util, ArcStr, CaseId, Censorship, CovariateScaler, Result, SignatureSet, SlideId, SlideTable,
};
use itertools::Itertools;
use ndarray::Array2;
use parking_lot::Mutex;
use qu::ick_use::*;
use rand::{seq::SliceRandom, SeedableRng as _};
use rand_pcg::Pcg64Mcg;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    path::Path,
    sync::Arc,
};

#[derive(Debug, Clone)]
pub struct DatasetConfig {
    /// Time-to-event column; `None` means `survival_months`.
    pub label_col: Option<String>,
    pub n_bins: usize,
    /// Outward widening applied to the extreme cut-points.
    pub eps: f64,
    /// Seed for the optional row shuffle and for split generation.
    pub seed: u64,
    pub shuffle: bool,
    /// Stratify folds over patients rather than slides.
    pub patient_strat: bool,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        DatasetConfig {
            label_col: None,
            n_bins: 4,
            eps: labels::DEFAULT_EPS,
            seed: 7,
            shuffle: false,
            patient_strat: false,
        }
    }
}

/// A row of the labeled, patient-collapsed table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatientRow {
    pub case_id: CaseId,
    pub event_time: f64,
    pub censorship: Censorship,
    /// Risk bin in `[0, n_bins)`.
    pub disc_label: usize,
    /// Composite (bin, censorship) label id.
    pub label: usize,
    pub source: Option<ArcStr>,
    pub covariates: Vec<f64>,
}

/// The full labeled dataset: one row per patient, the patient->slides
/// mapping, the label space, and the current split assignment.
pub struct SurvivalDataset {
    rows: Arc<Vec<PatientRow>>,
    label_col: ArcStr,
    label_space: Arc<LabelSpace>,
    cut_points: Vec<f64>,
    patient_slides: Arc<BTreeMap<CaseId, Vec<SlideId>>>,
    covariate_names: Arc<[ArcStr]>,
    patient_cls_ids: Vec<Vec<usize>>,
    slide_cls_ids: Vec<Vec<usize>>,
    data_source: DataSource,
    archive: Arc<dyn SlideArchive>,
    signatures: Option<SignatureSet>,
    patient_strat: bool,
    seed: u64,
    train_ids: Vec<usize>,
    val_ids: Vec<usize>,
    test_ids: Vec<usize>,
}

impl SurvivalDataset {
    /// Load the cohort CSV and build labels in one go.
    pub fn from_csv(
        config: DatasetConfig,
        path: impl AsRef<Path>,
        data_source: DataSource,
        archive: Arc<dyn SlideArchive>,
    ) -> Result<Self> {
        let table = SlideTable::load_csv(path, config.label_col.as_deref())?;
        Self::new(config, table, data_source, archive)
    }

    /// Build the labeled dataset: collapse the table to one row per patient,
    /// compute widened quantile cut-points over the event-observed patients,
    /// bin everyone, and attach composite labels. All configuration and data
    /// problems surface here, before any split exists.
    pub fn new(
        config: DatasetConfig,
        table: SlideTable,
        data_source: DataSource,
        archive: Arc<dyn SlideArchive>,
    ) -> Result<Self> {
        ensure!(config.n_bins >= 1, "n_bins must be at least 1");
        let (mut records, covariate_names, label_col) = table.into_parts();
        ensure!(!records.is_empty(), "cohort table has no rows");
        if config.shuffle {
            records.shuffle(&mut Pcg64Mcg::seed_from_u64(config.seed));
        }
        let patient_slides = patient_slide_map(&records);

        // first occurrence per patient wins
        let mut seen = BTreeSet::new();
        let patients: Vec<&crate::SlideRecord> = records
            .iter()
            .filter(|rec| seen.insert(rec.case_id.clone()))
            .collect();

        let uncensored: Vec<f64> = patients
            .iter()
            .filter(|rec| rec.censorship == Censorship::Observed)
            .map(|rec| rec.event_time)
            .collect();
        let mut cut_points = labels::quantile_cut_points(&uncensored, config.n_bins)
            .context("computing survival time quantiles")?;
        let (global_min, global_max) = patients
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), rec| {
                (lo.min(rec.event_time), hi.max(rec.event_time))
            });
        labels::widen_cut_points(&mut cut_points, global_min, global_max, config.eps);

        let label_space = LabelSpace::new(config.n_bins);
        let mut rows = Vec::with_capacity(patients.len());
        for rec in &patients {
            let disc_label = labels::assign_bin(rec.event_time, &cut_points)
                .with_context(|| format!("binning case \"{}\"", rec.case_id))?;
            let label = label_space.id(disc_label, rec.censorship)?;
            ensure!(
                patient_slides
                    .get(&rec.case_id)
                    .map_or(false, |slides| !slides.is_empty()),
                "case \"{}\" has no resolvable slide identifiers",
                rec.case_id
            );
            rows.push(PatientRow {
                case_id: rec.case_id.clone(),
                event_time: rec.event_time,
                censorship: rec.censorship,
                disc_label,
                label,
                source: rec.source.clone(),
                covariates: rec.covariates.clone(),
            });
        }

        let patient_cls_ids =
            labels::class_index_groups(rows.iter().map(|row| row.label), label_space.num_classes());
        // the working table is patient-collapsed, so slide-level groupings
        // coincide with patient-level ones
        let slide_cls_ids = patient_cls_ids.clone();

        Ok(SurvivalDataset {
            rows: Arc::new(rows),
            label_col,
            label_space: Arc::new(label_space),
            cut_points,
            patient_slides: Arc::new(patient_slides),
            covariate_names,
            patient_cls_ids,
            slide_cls_ids,
            data_source,
            archive,
            signatures: None,
            patient_strat: config.patient_strat,
            seed: config.seed,
            train_ids: Vec::new(),
            val_ids: Vec::new(),
            test_ids: Vec::new(),
        })
    }

    /// Attach a signature set. Stored for downstream consumers; this crate
    /// never reads it back.
    pub fn with_signatures(mut self, signatures: SignatureSet) -> Self {
        self.signatures = Some(signatures);
        self
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn rows(&self) -> &[PatientRow] {
        &self.rows
    }

    pub fn num_classes(&self) -> usize {
        self.label_space.num_classes()
    }

    pub fn label_space(&self) -> &LabelSpace {
        &self.label_space
    }

    pub fn cut_points(&self) -> &[f64] {
        &self.cut_points
    }

    pub fn patient_slides(&self) -> &BTreeMap<CaseId, Vec<SlideId>> {
        &self.patient_slides
    }

    pub fn patient_cls_ids(&self) -> &[Vec<usize>] {
        &self.patient_cls_ids
    }

    pub fn slide_cls_ids(&self) -> &[Vec<usize>] {
        &self.slide_cls_ids
    }

    pub fn signatures(&self) -> Option<&SignatureSet> {
        self.signatures.as_ref()
    }

    /// Package the per-class groupings into a seeded split generator.
    pub fn create_splits(
        &self,
        n_splits: usize,
        val_num: Vec<usize>,
        test_num: Vec<usize>,
        label_frac: Vec<f64>,
        custom_test_ids: Option<BTreeSet<usize>>,
    ) -> Result<SplitGenerator> {
        let cls_ids = if self.patient_strat {
            self.patient_cls_ids.clone()
        } else {
            self.slide_cls_ids.clone()
        };
        SplitGenerator::new(SplitSettings {
            n_splits,
            val_num,
            test_num,
            label_frac,
            seed: self.seed,
            custom_test_ids,
            cls_ids,
            samples: self.rows.len(),
        })
    }

    /// Consume the generator's next fold and store it as the current
    /// assignment.
    pub fn set_splits(&mut self, generator: &mut SplitGenerator) -> Result {
        let fold = generator
            .next()
            .ok_or_else(|| format_err!("split generator is exhausted"))?;
        self.apply_fold(fold)
    }

    /// Skip ahead and store the fold `n` positions further on.
    pub fn set_splits_nth(&mut self, generator: &mut SplitGenerator, n: usize) -> Result {
        let fold = generator
            .nth(n)
            .ok_or_else(|| format_err!("split generator is exhausted"))?;
        self.apply_fold(fold)
    }

    fn apply_fold(&mut self, fold: FoldIndices) -> Result {
        let fold = if self.patient_strat {
            self.expand_patient_fold(fold)?
        } else {
            fold
        };
        for &idx in fold.train.iter().chain(fold.val.iter()).chain(fold.test.iter()) {
            ensure!(
                idx < self.rows.len(),
                "split index {} out of bounds ({} rows)",
                idx,
                self.rows.len()
            );
        }
        fold.assert_disjoint().context("generated partitions overlap")?;
        self.train_ids = fold.train;
        self.val_ids = fold.val;
        self.test_ids = fold.test;
        Ok(())
    }

    /// Patient-stratified folds index patients; expand each to every table
    /// row carrying that patient's case id.
    fn expand_patient_fold(&self, fold: FoldIndices) -> Result<FoldIndices> {
        let expand = |ids: &[usize]| -> Result<Vec<usize>> {
            let mut out = Vec::new();
            for &idx in ids {
                let case_id = &self
                    .rows
                    .get(idx)
                    .ok_or_else(|| format_err!("patient index {} out of bounds", idx))?
                    .case_id;
                out.extend(self.rows.iter().positions(|row| row.case_id == *case_id));
            }
            Ok(out)
        };
        Ok(FoldIndices {
            train: expand(&fold.train)?,
            val: expand(&fold.val)?,
            test: expand(&fold.test)?,
        })
    }

    fn has_assignment(&self) -> bool {
        !(self.train_ids.is_empty() && self.val_ids.is_empty() && self.test_ids.is_empty())
    }

    /// Identifiers for an index list into the labeled table.
    pub fn identifiers(&self, ids: &[usize]) -> Result<Vec<CaseId>> {
        ids.iter()
            .map(|&idx| {
                self.rows
                    .get(idx)
                    .map(|row| row.case_id.clone())
                    .ok_or_else(|| format_err!("row index {} out of bounds", idx))
            })
            .collect()
    }

    /// Composite labels for an index list into the labeled table.
    pub fn labels_for(&self, ids: &[usize]) -> Result<Vec<usize>> {
        ids.iter()
            .map(|&idx| {
                self.rows
                    .get(idx)
                    .map(|row| row.label)
                    .ok_or_else(|| format_err!("row index {} out of bounds", idx))
            })
            .collect()
    }

    /// Materialize the stored assignment as up to three `Split`s. An empty
    /// partition yields `None`; a dataset with no stored assignment at all
    /// is an error.
    pub fn return_splits(
        &self,
        backbone: &str,
        patch_size: u32,
    ) -> Result<(Option<Split>, Option<Split>, Option<Split>)> {
        ensure!(
            self.has_assignment(),
            "no split assignment; generate or load one first"
        );
        let make = |ids: &[usize]| -> Result<Option<Split>> {
            if ids.is_empty() {
                return Ok(None);
            }
            let rows = ids
                .iter()
                .map(|&idx| {
                    self.rows
                        .get(idx)
                        .cloned()
                        .ok_or_else(|| format_err!("split index {} out of bounds", idx))
                })
                .collect::<Result<Vec<_>>>()?;
            Ok(Some(self.make_split(rows, backbone, patch_size)))
        };
        Ok((
            make(&self.train_ids)?,
            make(&self.val_ids)?,
            make(&self.test_ids)?,
        ))
    }

    /// Materialize splits from a persisted identifier file: three columns
    /// `train,val,test`, each listing identifiers, shorter columns padded
    /// with blanks.
    pub fn return_splits_from_csv(
        &self,
        backbone: &str,
        patch_size: u32,
        path: impl AsRef<Path>,
    ) -> Result<(Option<Split>, Option<Split>, Option<Split>)> {
        fn read_columns(path: &Path) -> Result<BTreeMap<String, Vec<ArcStr>>> {
            let mut reader = csv::ReaderBuilder::new()
                .has_headers(true)
                .trim(csv::Trim::All)
                .from_path(path)?;
            let headers = reader.headers()?.clone();
            let mut columns: Vec<Vec<ArcStr>> = vec![Vec::new(); headers.len()];
            for record in reader.into_records() {
                let record = record?;
                for (idx, value) in record.iter().enumerate() {
                    if !value.is_empty() {
                        columns[idx].push(value.into());
                    }
                }
            }
            Ok(headers.iter().map(String::from).zip(columns).collect())
        }
        let path = path.as_ref();
        let mut columns = read_columns(path)
            .with_context(|| format!("loading split assignment from \"{}\"", path.display()))?;
        let mut take = |key: &str| -> Result<Option<Split>> {
            let ids = columns.remove(key).ok_or_else(|| {
                format_err!("split file \"{}\" has no \"{}\" column", path.display(), key)
            })?;
            Ok(self.split_for_identifiers(&ids, backbone, patch_size))
        };
        Ok((take("train")?, take("val")?, take("test")?))
    }

    fn split_for_identifiers(
        &self,
        ids: &[ArcStr],
        backbone: &str,
        patch_size: u32,
    ) -> Option<Split> {
        let wanted: BTreeSet<&str> = ids.iter().map(|id| &**id).collect();
        let rows: Vec<PatientRow> = self
            .rows
            .iter()
            .filter(|row| wanted.contains(&*row.case_id))
            .cloned()
            .collect();
        if rows.is_empty() {
            None
        } else {
            Some(self.make_split(rows, backbone, patch_size))
        }
    }

    fn make_split(&self, rows: Vec<PatientRow>, backbone: &str, patch_size: u32) -> Split {
        Split::new(
            rows,
            Arc::clone(&self.label_space),
            Arc::clone(&self.patient_slides),
            Arc::clone(&self.covariate_names),
            self.data_source.clone(),
            Arc::clone(&self.archive),
            backbone,
            patch_size,
        )
    }

    /// Persist the stored assignment: columns `train,val,test` of
    /// identifiers, shorter columns padded with blanks.
    pub fn save_split(&self, path: impl AsRef<Path>) -> Result {
        fn inner(this: &SurvivalDataset, path: &Path) -> Result {
            if util::path_exists(path)? {
                event!(
                    Level::WARN,
                    "overwriting existing file at \"{}\"",
                    path.display()
                );
            }
            let train = this.identifiers(&this.train_ids)?;
            let val = this.identifiers(&this.val_ids)?;
            let test = this.identifiers(&this.test_ids)?;
            let mut writer = csv::Writer::from_path(path)?;
            writer.write_record(["train", "val", "test"])?;
            let rows = train.len().max(val.len()).max(test.len());
            let cell = |column: &[CaseId], idx: usize| {
                column.get(idx).map(|id| id.to_string()).unwrap_or_default()
            };
            for idx in 0..rows {
                writer.write_record([
                    cell(&train, idx),
                    cell(&val, idx),
                    cell(&test, idx),
                ])?;
            }
            writer.flush()?;
            Ok(())
        }
        let path = path.as_ref();
        util::check_extension(path, "csv")?;
        inner(self, path)
            .with_context(|| format!("writing split assignment to \"{}\"", path.display()))
    }

    /// Print the label space and per-class counts.
    pub fn summarize(&self) {
        util::header("survival dataset");
        println!("label column: {}", self.label_col);
        println!(
            "bins: {} ({} composite classes)",
            self.label_space.n_bins(),
            self.num_classes()
        );
        println!("cut points: {:?}", self.cut_points);
        for ((bin, censorship), id) in self.label_space.entries() {
            println!("({}, {}) : {}", bin, censorship, id);
        }
        for (cls, (patient_group, slide_group)) in self
            .patient_cls_ids
            .iter()
            .zip(&self.slide_cls_ids)
            .enumerate()
        {
            println!(
                "class {}: {} patients, {} slides",
                cls,
                patient_group.len(),
                slide_group.len()
            );
        }
    }

    /// Per-class counts for the stored assignment, after re-checking that
    /// the partitions are pairwise disjoint.
    pub fn split_summary(&self) -> Result<Vec<[usize; 3]>> {
        let fold = FoldIndices {
            train: self.train_ids.clone(),
            val: self.val_ids.clone(),
            test: self.test_ids.clone(),
        };
        fold.assert_disjoint()
            .context("stored split assignment overlaps")?;
        let mut counts = vec![[0usize; 3]; self.num_classes()];
        for (col, ids) in [(0, &self.train_ids), (1, &self.val_ids), (2, &self.test_ids)] {
            for &idx in ids.iter() {
                let label = self
                    .rows
                    .get(idx)
                    .ok_or_else(|| format_err!("row index {} out of bounds", idx))?
                    .label;
                counts[label][col] += 1;
            }
        }
        util::header("split assignment");
        println!(
            "samples: {} train, {} val, {} test",
            self.train_ids.len(),
            self.val_ids.len(),
            self.test_ids.len()
        );
        for (cls, row) in counts.iter().enumerate() {
            println!(
                "class {}: train {}, val {}, test {}",
                cls, row[0], row[1], row[2]
            );
        }
        Ok(counts)
    }
}

/// One partition materialized as an independent view: its own rows, shared
/// label/config data, and per-class groupings recomputed from the restricted
/// table. Immutable after construction except for explicit scaler
/// application.
pub struct Split {
    rows: Vec<PatientRow>,
    label_space: Arc<LabelSpace>,
    patient_slides: Arc<BTreeMap<CaseId, Vec<SlideId>>>,
    covariate_names: Arc<[ArcStr]>,
    data_source: DataSource,
    archive: Arc<dyn SlideArchive>,
    backbone: ArcStr,
    patch_size: u32,
    cls_ids: Vec<Vec<usize>>,
    cache: Mutex<HashMap<SlideId, Arc<SlideTensors>>>,
}

impl Split {
    #[allow(clippy::too_many_arguments)]
    fn new(
        rows: Vec<PatientRow>,
        label_space: Arc<LabelSpace>,
        patient_slides: Arc<BTreeMap<CaseId, Vec<SlideId>>>,
        covariate_names: Arc<[ArcStr]>,
        data_source: DataSource,
        archive: Arc<dyn SlideArchive>,
        backbone: &str,
        patch_size: u32,
    ) -> Self {
        let cls_ids =
            labels::class_index_groups(rows.iter().map(|row| row.label), label_space.num_classes());
        Split {
            rows,
            label_space,
            patient_slides,
            covariate_names,
            data_source,
            archive,
            backbone: backbone.into(),
            patch_size,
            cls_ids,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn rows(&self) -> &[PatientRow] {
        &self.rows
    }

    pub fn num_classes(&self) -> usize {
        self.label_space.num_classes()
    }

    pub fn cls_ids(&self) -> &[Vec<usize>] {
        &self.cls_ids
    }

    pub fn backbone(&self) -> &str {
        &self.backbone
    }

    pub fn patch_size(&self) -> u32 {
        self.patch_size
    }

    pub fn covariate_names(&self) -> &Arc<[ArcStr]> {
        &self.covariate_names
    }

    /// The split's covariates as one rows x columns matrix, for fitting a
    /// scaler externally.
    pub fn covariate_matrix(&self) -> Array2<f64> {
        let mut matrix = Array2::zeros((self.rows.len(), self.covariate_names.len()));
        for (r, row) in self.rows.iter().enumerate() {
            for (c, value) in row.covariates.iter().enumerate() {
                matrix[[r, c]] = *value;
            }
        }
        matrix
    }

    /// Apply a fitted scaler to every row's covariates. The only sanctioned
    /// mutation after construction.
    pub fn apply_scaler(&mut self, scaler: &dyn CovariateScaler) {
        for row in &mut self.rows {
            scaler.transform(&mut row.covariates);
        }
    }

    /// Assemble the sample for one row: resolve the patient's slide list,
    /// read the first slide's tensors through the archive, and pair them
    /// with the survival target. Archive failures propagate; nothing is
    /// retried.
    pub fn sample(&self, idx: usize) -> Result<Sample> {
        let row = self.rows.get(idx).ok_or_else(|| {
            format_err!("sample index {} out of bounds ({} rows)", idx, self.rows.len())
        })?;
        let slides = self
            .patient_slides
            .get(&row.case_id)
            .filter(|slides| !slides.is_empty())
            .ok_or_else(|| {
                format_err!("no slide identifiers recorded for case \"{}\"", row.case_id)
            })?;
        // only the first slide is read; the rest stay in the mapping
        let slide_id = &slides[0];
        let cached = self.cache.lock().get(slide_id).cloned();
        let tensors = match cached {
            Some(tensors) => tensors,
            None => {
                let dir = self
                    .data_source
                    .resolve(row.source.as_deref())
                    .with_context(|| {
                        format!("resolving feature directory for case \"{}\"", row.case_id)
                    })?;
                let tensors = Arc::new(
                    self.archive
                        .read(dir, archive_key(slide_id))
                        .with_context(|| format!("loading features for slide \"{}\"", slide_id))?,
                );
                self.cache
                    .lock()
                    .insert(slide_id.clone(), Arc::clone(&tensors));
                tensors
            }
        };
        Ok(Sample {
            tensors,
            aux: Array2::zeros((1, 1)),
            label: row.label,
            event_time: row.event_time,
            censorship: row.censorship,
        })
    }

    /// Warm the tensor cache for every row over a bounded worker pool. Only
    /// an I/O overlap optimization; failed reads are logged and surface
    /// again on the next `sample` call.
    pub fn prefetch(&self, threads: usize) -> Result {
        ensure!(threads > 0, "prefetch needs at least one worker");
        let pool = rayon::ThreadPoolBuilder::new().num_threads(threads).build()?;
        pool.install(|| {
            (0..self.rows.len()).into_par_iter().for_each(|idx| {
                if let Err(error) = self.sample(idx) {
                    event!(Level::WARN, "prefetch failed for sample {}: {:#}", idx, error);
                }
            });
        });
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::SlideRecord;
    use ndarray::array;

    fn record(case: &str, slide: &str, time: f64, censorship: Censorship) -> SlideRecord {
        SlideRecord {
            case_id: case.into(),
            slide_id: slide.into(),
            event_time: time,
            censorship,
            source: None,
            covariates: vec![time / 10.],
        }
    }

    fn cohort(n_patients: usize) -> SlideTable {
        let records = (0..n_patients)
            .map(|idx| {
                record(
                    &format!("C{:03}", idx),
                    &format!("C{:03}-S1.svs", idx),
                    idx as f64,
                    Censorship::Observed,
                )
            })
            .collect();
        SlideTable::from_records(records, [ArcStr::from("time_tenth")], "survival_months")
    }

    struct FakeArchive {
        tensors: BTreeMap<String, SlideTensors>,
    }

    impl FakeArchive {
        fn with_keys(keys: &[&str]) -> Self {
            let tensors = keys
                .iter()
                .enumerate()
                .map(|(idx, key)| {
                    let fill = idx as f32;
                    (
                        key.to_string(),
                        SlideTensors {
                            features: array![[fill, fill], [fill, fill]],
                            coords: array![[0.0f32, 0.0], [1.0, 1.0]],
                        },
                    )
                })
                .collect();
            FakeArchive { tensors }
        }
    }

    impl SlideArchive for FakeArchive {
        fn read(&self, _dir: &std::path::Path, key: &str) -> Result<SlideTensors> {
            self.tensors
                .get(key)
                .cloned()
                .ok_or_else(|| format_err!("no archive entry for key \"{}\"", key))
        }
    }

    fn dataset(table: SlideTable, archive: FakeArchive) -> SurvivalDataset {
        SurvivalDataset::new(
            DatasetConfig::default(),
            table,
            DataSource::SingleDirectory("/nonexistent".into()),
            Arc::new(archive),
        )
        .unwrap()
    }

    #[test]
    fn all_observed_quartiles_are_even() {
        // 100 patients, 4 bins, everything observed: 25 patients per bin.
        let ds = dataset(cohort(100), FakeArchive::with_keys(&[]));
        assert_eq!(ds.len(), 100);
        assert_eq!(ds.cut_points().len(), 5);
        assert_eq!(ds.num_classes(), 8);
        let mut bin_counts = [0usize; 4];
        for row in ds.rows() {
            bin_counts[row.disc_label] += 1;
        }
        assert_eq!(bin_counts, [25, 25, 25, 25]);
        // observed-only cohort populates only the censorship-0 classes
        for (cls, group) in ds.patient_cls_ids().iter().enumerate() {
            let expected = if cls % 2 == 0 { 25 } else { 0 };
            assert_eq!(group.len(), expected, "class {}", cls);
        }
    }

    #[test]
    fn duplicate_slides_collapse_to_one_patient_row() {
        let records = vec![
            record("C1", "C1-S1.svs", 5., Censorship::Observed),
            record("C1", "C1-S2.svs", 5., Censorship::Observed),
            record("C2", "C2-S1.svs", 10., Censorship::Observed),
            record("C3", "C3-S1.svs", 15., Censorship::Censored),
            record("C4", "C4-S1.svs", 20., Censorship::Observed),
        ];
        let table = SlideTable::from_records(records, [], "survival_months");
        let ds = SurvivalDataset::new(
            DatasetConfig {
                n_bins: 2,
                ..DatasetConfig::default()
            },
            table,
            DataSource::SingleDirectory("/nonexistent".into()),
            Arc::new(FakeArchive::with_keys(&[])),
        )
        .unwrap();
        assert_eq!(ds.len(), 4);
        assert_eq!(ds.patient_slides()[&CaseId::from("C1")].len(), 2);
        // censored patient still got a bin
        let censored = ds.rows().iter().find(|r| r.censorship.is_censored()).unwrap();
        assert!(censored.disc_label < 2);
    }

    /// Quotas for a fully event-observed cohort: only the censorship-0
    /// classes (the even ids) hold any samples.
    fn observed_quota(n: usize) -> Vec<usize> {
        (0..8).map(|cls| if cls % 2 == 0 { n } else { 0 }).collect()
    }

    #[test]
    fn generated_folds_are_disjoint_and_deterministic() {
        let mut ds = dataset(cohort(100), FakeArchive::with_keys(&[]));
        let mut generator = ds
            .create_splits(3, observed_quota(2), observed_quota(2), vec![1.; 8], None)
            .unwrap();
        ds.set_splits(&mut generator).unwrap();
        let counts = ds.split_summary().unwrap();
        for (cls, row) in counts.iter().enumerate() {
            if cls % 2 == 0 {
                assert_eq!(row, &[21, 2, 2]);
            } else {
                assert_eq!(row, &[0, 0, 0]);
            }
        }

        // same seed, fresh generator: identical assignment
        let first = (ds.train_ids.clone(), ds.val_ids.clone(), ds.test_ids.clone());
        let mut generator = ds
            .create_splits(3, observed_quota(2), observed_quota(2), vec![1.; 8], None)
            .unwrap();
        ds.set_splits(&mut generator).unwrap();
        assert_eq!(
            first,
            (ds.train_ids.clone(), ds.val_ids.clone(), ds.test_ids.clone())
        );
    }

    #[test]
    fn empty_partition_materializes_as_none() {
        let mut ds = dataset(cohort(40), FakeArchive::with_keys(&[]));
        // no val quota anywhere: the val partition must come back absent
        let mut generator = ds
            .create_splits(1, vec![0; 8], observed_quota(1), vec![1.; 8], None)
            .unwrap();
        ds.set_splits(&mut generator).unwrap();
        let (train, val, test) = ds.return_splits("resnet50", 256).unwrap();
        assert!(train.is_some());
        assert!(val.is_none());
        let test = test.unwrap();
        assert_eq!(test.len(), 4);
        assert_eq!(test.backbone(), "resnet50");
        assert_eq!(test.patch_size(), 256);
    }

    #[test]
    fn missing_assignment_is_an_error() {
        let ds = dataset(cohort(40), FakeArchive::with_keys(&[]));
        assert!(ds.return_splits("resnet50", 256).is_err());
    }

    #[test]
    fn split_class_groups_cover_all_rows() {
        let mut ds = dataset(cohort(60), FakeArchive::with_keys(&[]));
        let mut generator = ds
            .create_splits(1, observed_quota(1), observed_quota(1), vec![1.; 8], None)
            .unwrap();
        ds.set_splits(&mut generator).unwrap();
        let (train, _, _) = ds.return_splits("resnet50", 256).unwrap();
        let train = train.unwrap();
        let grouped: usize = train.cls_ids().iter().map(Vec::len).sum();
        assert_eq!(grouped, train.len());
    }

    #[test]
    fn save_and_reload_round_trip() {
        let mut ds = dataset(cohort(50), FakeArchive::with_keys(&[]));
        let mut generator = ds
            .create_splits(1, observed_quota(1), observed_quota(1), vec![1.; 8], None)
            .unwrap();
        ds.set_splits(&mut generator).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("splits_0.csv");
        ds.save_split(&path).unwrap();

        let (train, val, test) = ds.return_splits("resnet50", 256).unwrap();
        let (train2, val2, test2) = ds.return_splits_from_csv("resnet50", 256, &path).unwrap();
        let cases = |split: &Option<Split>| -> BTreeSet<CaseId> {
            split
                .as_ref()
                .map(|s| s.rows().iter().map(|r| r.case_id.clone()).collect())
                .unwrap_or_default()
        };
        assert_eq!(cases(&train), cases(&train2));
        assert_eq!(cases(&val), cases(&val2));
        assert_eq!(cases(&test), cases(&test2));
        assert!(!cases(&train).is_empty());
    }

    #[test]
    fn sample_reads_only_the_first_slide() {
        let records = vec![
            record("C1", "first.svs", 5., Censorship::Observed),
            record("C1", "second.svs", 5., Censorship::Observed),
            record("C2", "third.svs", 10., Censorship::Observed),
            record("C3", "fourth.svs", 15., Censorship::Observed),
        ];
        let table = SlideTable::from_records(records, [], "survival_months");
        let archive = FakeArchive::with_keys(&["first", "second", "third", "fourth"]);
        let first_features = archive.tensors["first"].features.clone();
        let mut ds = SurvivalDataset::new(
            DatasetConfig {
                n_bins: 3,
                ..DatasetConfig::default()
            },
            table,
            DataSource::SingleDirectory("/nonexistent".into()),
            Arc::new(archive),
        )
        .unwrap();
        let mut generator = ds
            .create_splits(1, vec![0; 6], vec![0; 6], vec![1.; 6], None)
            .unwrap();
        ds.set_splits(&mut generator).unwrap();
        let (train, _, _) = ds.return_splits("resnet50", 256).unwrap();
        let train = train.unwrap();
        let idx = train
            .rows()
            .iter()
            .position(|row| &*row.case_id == "C1")
            .unwrap();
        let sample = train.sample(idx).unwrap();
        assert_eq!(sample.tensors.features, first_features);
        assert_eq!(sample.aux.shape(), &[1, 1]);
    }

    #[test]
    fn missing_archive_entry_fails_the_sample() {
        let records = vec![
            record("C1", "present.svs", 5., Censorship::Observed),
            record("C2", "absent.svs", 10., Censorship::Observed),
        ];
        let table = SlideTable::from_records(records, [], "survival_months");
        let mut ds = SurvivalDataset::new(
            DatasetConfig {
                n_bins: 2,
                ..DatasetConfig::default()
            },
            table,
            DataSource::SingleDirectory("/nonexistent".into()),
            Arc::new(FakeArchive::with_keys(&["present"])),
        )
        .unwrap();
        let mut generator = ds
            .create_splits(1, vec![0; 4], vec![0; 4], vec![1.; 4], None)
            .unwrap();
        ds.set_splits(&mut generator).unwrap();
        let (train, _, _) = ds.return_splits("resnet50", 256).unwrap();
        let train = train.unwrap();
        let absent = train
            .rows()
            .iter()
            .position(|row| &*row.case_id == "C2")
            .unwrap();
        assert!(train.sample(absent).is_err());
        let present = train
            .rows()
            .iter()
            .position(|row| &*row.case_id == "C1")
            .unwrap();
        assert!(train.sample(present).is_ok());
    }

    #[test]
    fn prefetch_warms_the_cache() {
        let records = vec![
            record("C1", "a.svs", 5., Censorship::Observed),
            record("C2", "b.svs", 10., Censorship::Observed),
        ];
        let table = SlideTable::from_records(records, [], "survival_months");
        let mut ds = SurvivalDataset::new(
            DatasetConfig {
                n_bins: 2,
                ..DatasetConfig::default()
            },
            table,
            DataSource::SingleDirectory("/nonexistent".into()),
            Arc::new(FakeArchive::with_keys(&["a", "b"])),
        )
        .unwrap();
        let mut generator = ds
            .create_splits(1, vec![0; 4], vec![0; 4], vec![1.; 4], None)
            .unwrap();
        ds.set_splits(&mut generator).unwrap();
        let (train, _, _) = ds.return_splits("resnet50", 256).unwrap();
        let train = train.unwrap();
        train.prefetch(2).unwrap();
        assert_eq!(train.cache.lock().len(), 2);
        assert!(train.sample(0).is_ok());
    }

    #[test]
    fn scaler_application_rewrites_covariates() {
        struct Center(f64);
        impl CovariateScaler for Center {
            fn transform(&self, covariates: &mut [f64]) {
                for value in covariates {
                    *value -= self.0;
                }
            }
        }
        let mut ds = dataset(cohort(40), FakeArchive::with_keys(&[]));
        let mut generator = ds
            .create_splits(1, vec![0; 8], vec![0; 8], vec![1.; 8], None)
            .unwrap();
        ds.set_splits(&mut generator).unwrap();
        let (train, _, _) = ds.return_splits("resnet50", 256).unwrap();
        let mut train = train.unwrap();
        let before = train.covariate_matrix();
        train.apply_scaler(&Center(1.));
        let after = train.covariate_matrix();
        assert_eq!(after[[0, 0]], before[[0, 0]] - 1.);
    }
}
