pub mod archive;
pub mod dataset;
pub mod labels;
pub mod splits;
pub mod tasks;
mod util;

pub use anyhow::{Context, Error};
use qu::ick_use::*;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, ops::Deref, path::Path, sync::Arc};

pub use crate::{
    archive::{
        CovariateScaler, DataSource, NpyArchive, Sample, SignatureSet, SlideArchive, SlideTensors,
    },
    dataset::{DatasetConfig, Split, SurvivalDataset},
    labels::LabelSpace,
    splits::{FoldIndices, SplitGenerator, SplitSettings},
    util::{check_extension, header, path_exists},
};

pub type Result<T = (), E = anyhow::Error> = std::result::Result<T, E>;
pub type ArcStr = Arc<str>;
pub type CaseId = ArcStr;
pub type SlideId = ArcStr;

/// Column holding the continuous time-to-event value unless overridden.
pub const DEFAULT_LABEL_COL: &str = "survival_months";

/// Whether the time-to-event was observed (0) or the observation window
/// closed first (1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Censorship {
    Observed,
    Censored,
}

impl Censorship {
    /// Parse a censorship field. Any numeric value below 1 counts as an
    /// observed event, everything else as censored.
    pub fn from_field(field: &str) -> Result<Self> {
        let value: f64 = field
            .parse()
            .map_err(|_| format_err!("censorship value \"{}\" is not numeric", field))?;
        ensure!(value.is_finite(), "censorship value \"{}\" is not finite", field);
        Ok(if value < 1. {
            Censorship::Observed
        } else {
            Censorship::Censored
        })
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Censorship::Observed => 0,
            Censorship::Censored => 1,
        }
    }

    pub fn is_censored(self) -> bool {
        matches!(self, Censorship::Censored)
    }
}

impl fmt::Display for Censorship {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_u8())
    }
}

/// A row in the cohort table: one record per slide. Several records may share
/// a `case_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlideRecord {
    pub case_id: CaseId,
    pub slide_id: SlideId,
    pub event_time: f64,
    pub censorship: Censorship,
    /// Per-row source key (e.g. oncotree code) used to pick a feature
    /// directory when archives are spread over several locations.
    pub source: Option<ArcStr>,
    /// Numeric covariate values, parallel to the table's covariate names.
    pub covariates: Vec<f64>,
}

/// The parsed cohort table, slide-level, with covariate column names shared
/// across rows.
#[derive(Debug)]
pub struct SlideTable {
    records: Vec<SlideRecord>,
    covariate_names: Arc<[ArcStr]>,
    label_col: ArcStr,
}

impl SlideTable {
    /// Load a cohort CSV.
    ///
    /// Required columns: `slide_id`, `censorship` and the label column
    /// (`survival_months` unless overridden). `case_id` is derived from the
    /// first 12 characters of `slide_id` when absent. Remaining columns that
    /// parse as numbers on every row are kept as covariates.
    pub fn load_csv(path: impl AsRef<Path>, label_col: Option<&str>) -> Result<Self> {
        fn inner(path: &Path, label_col: Option<&str>) -> Result<SlideTable> {
            let mut reader = csv::ReaderBuilder::new()
                .has_headers(true)
                .trim(csv::Trim::All)
                .from_path(path)?;
            let headers = reader.headers()?.clone();
            let find = |name: &str| headers.iter().position(|h| h == name);

            let slide_idx = find("slide_id")
                .ok_or_else(|| format_err!("missing required column \"slide_id\""))?;
            let cens_idx = find("censorship")
                .ok_or_else(|| format_err!("missing required column \"censorship\""))?;
            let label_name = label_col.unwrap_or(DEFAULT_LABEL_COL);
            let label_idx = find(label_name)
                .ok_or_else(|| format_err!("label column \"{}\" not present", label_name))?;
            let case_idx = find("case_id");
            let source_idx = find("oncotree_code");

            let records = reader
                .into_records()
                .collect::<Result<Vec<_>, _>>()
                .map_err(Error::from)?;
            ensure!(!records.is_empty(), "cohort table has no rows");

            // Keep the columns that are numeric on every row as covariates.
            let reserved = [
                Some(slide_idx),
                Some(cens_idx),
                Some(label_idx),
                case_idx,
                source_idx,
            ];
            let covariate_idx: Vec<usize> = (0..headers.len())
                .filter(|idx| !reserved.contains(&Some(*idx)))
                .filter(|&idx| {
                    records
                        .iter()
                        .all(|rec| matches!(rec.get(idx), Some(v) if v.parse::<f64>().is_ok()))
                })
                .collect();
            let covariate_names: Arc<[ArcStr]> = covariate_idx
                .iter()
                .map(|&idx| ArcStr::from(&headers[idx]))
                .collect();

            let mut out = Vec::with_capacity(records.len());
            for (row, record) in records.iter().enumerate() {
                let slide_id: SlideId = record.get(slide_idx).unwrap_or("").into();
                ensure!(!slide_id.is_empty(), "row {}: empty slide_id", row + 1);
                let case_id = match case_idx {
                    Some(idx) => {
                        let raw = record.get(idx).unwrap_or("");
                        ensure!(!raw.is_empty(), "row {}: empty case_id", row + 1);
                        raw.into()
                    }
                    None => derive_case_id(&slide_id),
                };
                let raw_time = record.get(label_idx).unwrap_or("");
                let event_time: f64 = raw_time.parse().map_err(|_| {
                    format_err!("row {}: \"{}\" is not a number", row + 1, raw_time)
                })?;
                ensure!(
                    event_time.is_finite() && event_time >= 0.,
                    "row {}: event time {} out of range",
                    row + 1,
                    event_time
                );
                let censorship = Censorship::from_field(record.get(cens_idx).unwrap_or(""))
                    .with_context(|| format!("row {}", row + 1))?;
                let source = source_idx
                    .and_then(|idx| record.get(idx))
                    .filter(|v| !v.is_empty())
                    .map(Into::into);
                let covariates = covariate_idx
                    .iter()
                    .map(|&idx| {
                        record[idx]
                            .parse()
                            .expect("covariate column checked numeric above")
                    })
                    .collect();
                out.push(SlideRecord {
                    case_id,
                    slide_id,
                    event_time,
                    censorship,
                    source,
                    covariates,
                });
            }
            Ok(SlideTable {
                records: out,
                covariate_names,
                label_col: label_name.into(),
            })
        }
        let path = path.as_ref();
        inner(path, label_col)
            .with_context(|| format!("loading cohort table from \"{}\"", path.display()))
    }

    /// Build a table from in-memory records, e.g. rows assembled by hand.
    pub fn from_records(
        records: Vec<SlideRecord>,
        covariate_names: impl IntoIterator<Item = ArcStr>,
        label_col: &str,
    ) -> Self {
        SlideTable {
            records,
            covariate_names: covariate_names.into_iter().collect(),
            label_col: label_col.into(),
        }
    }

    pub fn covariate_names(&self) -> &Arc<[ArcStr]> {
        &self.covariate_names
    }

    pub fn label_col(&self) -> &ArcStr {
        &self.label_col
    }

    /// The `case_id -> [slide_id]` mapping, preserving per-patient row order.
    pub fn patient_slides(&self) -> BTreeMap<CaseId, Vec<SlideId>> {
        patient_slide_map(&self.records)
    }

    pub fn iter(&self) -> impl Iterator<Item = &SlideRecord> + '_ {
        self.records.iter()
    }

    pub(crate) fn into_parts(self) -> (Vec<SlideRecord>, Arc<[ArcStr]>, ArcStr) {
        (self.records, self.covariate_names, self.label_col)
    }
}

impl Deref for SlideTable {
    type Target = [SlideRecord];
    fn deref(&self) -> &Self::Target {
        &self.records
    }
}

/// When the table carries no `case_id` column the patient key is the leading
/// 12 characters of the slide identifier (the TCGA barcode prefix).
fn derive_case_id(slide_id: &str) -> CaseId {
    slide_id.chars().take(12).collect::<String>().into()
}

pub(crate) fn patient_slide_map(records: &[SlideRecord]) -> BTreeMap<CaseId, Vec<SlideId>> {
    let mut map: BTreeMap<CaseId, Vec<SlideId>> = BTreeMap::new();
    for record in records {
        map.entry(record.case_id.clone())
            .or_default()
            .push(record.slide_id.clone());
    }
    map
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Write;

    fn write_csv(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn load_basic_table() {
        let file = write_csv(
            "case_id,slide_id,survival_months,censorship,age\n\
             C1,C1-S1.svs,12.5,0,61\n\
             C1,C1-S2.svs,12.5,0,61\n\
             C2,C2-S1.svs,40.0,1,58\n",
        );
        let table = SlideTable::load_csv(file.path(), None).unwrap();
        assert_eq!(table.len(), 3);
        assert_eq!(&**table.covariate_names(), &[ArcStr::from("age")] as &[ArcStr]);
        assert_eq!(table[0].covariates, vec![61.]);
        assert_eq!(table[2].censorship, Censorship::Censored);
        let slides = table.patient_slides();
        assert_eq!(slides[&CaseId::from("C1")].len(), 2);
    }

    #[test]
    fn case_id_derived_from_slide_id() {
        let file = write_csv(
            "slide_id,survival_months,censorship\n\
             TCGA-AA-0001-01Z-00-DX1.svs,3.0,0\n",
        );
        let table = SlideTable::load_csv(file.path(), None).unwrap();
        assert_eq!(&*table[0].case_id, "TCGA-AA-0001");
    }

    #[test]
    fn missing_label_column_is_an_error() {
        let file = write_csv("case_id,slide_id,censorship\nC1,S1,0\n");
        let err = SlideTable::load_csv(file.path(), Some("overall_survival")).unwrap_err();
        assert!(format!("{:#}", err).contains("overall_survival"));
    }

    #[test]
    fn non_numeric_columns_are_not_covariates() {
        let file = write_csv(
            "case_id,slide_id,survival_months,censorship,site,bmi\n\
             C1,S1,1.0,0,lung,22.1\n\
             C2,S2,2.0,0,breast,30.4\n",
        );
        let table = SlideTable::load_csv(file.path(), None).unwrap();
        assert_eq!(&**table.covariate_names(), &[ArcStr::from("bmi")] as &[ArcStr]);
    }
}
