//! The per-slide feature archive boundary: directory resolution, the reader
//! collaborator interface, and the assembled sample type.
use crate::{ArcStr, Censorship, Result};
use ndarray::Array2;
use ndarray_npy::ReadNpyExt;
use qu::ick_use::*;
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

/// Where the feature archives live: one directory for the whole cohort, or
/// one per source key (e.g. oncotree code).
#[derive(Debug, Clone)]
pub enum DataSource {
    SingleDirectory(PathBuf),
    PerSourceDirectory(BTreeMap<ArcStr, PathBuf>),
}

impl DataSource {
    /// Resolve the archive directory for a row. Pure function of the variant
    /// and the row's source key.
    pub fn resolve(&self, source: Option<&str>) -> Result<&Path> {
        match self {
            DataSource::SingleDirectory(dir) => Ok(dir),
            DataSource::PerSourceDirectory(map) => {
                let key = source.ok_or_else(|| {
                    format_err!("feature directories are keyed by source but the row has no source")
                })?;
                map.get(key)
                    .map(PathBuf::as_path)
                    .ok_or_else(|| format_err!("no feature directory for source \"{}\"", key))
            }
        }
    }
}

/// Archive key for a slide: the identifier with its trailing extension
/// stripped (`TCGA-XX-0001-DX1.svs` -> `TCGA-XX-0001-DX1`).
pub fn archive_key(slide_id: &str) -> &str {
    match slide_id.rfind('.') {
        Some(pos) if pos > 0 => &slide_id[..pos],
        _ => slide_id,
    }
}

/// The two named datasets every slide archive exposes.
#[derive(Debug, Clone)]
pub struct SlideTensors {
    /// instances x feature-dim
    pub features: Array2<f32>,
    /// instances x 2 spatial coordinates
    pub coords: Array2<f32>,
}

/// Reader side of the on-disk archive format. The binary layout is not this
/// crate's concern; implementations map `(directory, key)` to the two
/// tensors. Failures propagate to the caller, nothing is retried.
pub trait SlideArchive: Send + Sync {
    fn read(&self, dir: &Path, key: &str) -> Result<SlideTensors>;
}

/// Bundled archive reader: a pair of `.npy` files per slide,
/// `<dir>/<key>.features.npy` and `<dir>/<key>.coords.npy`.
pub struct NpyArchive;

impl SlideArchive for NpyArchive {
    fn read(&self, dir: &Path, key: &str) -> Result<SlideTensors> {
        fn load(path: &Path) -> Result<Array2<f32>> {
            let reader = fs::File::open(path)?;
            Array2::read_npy(reader).map_err(Error::from)
        }
        let features_path = dir.join(format!("{}.features.npy", key));
        let coords_path = dir.join(format!("{}.coords.npy", key));
        let features = load(&features_path)
            .with_context(|| format!("reading \"{}\"", features_path.display()))?;
        let coords = load(&coords_path)
            .with_context(|| format!("reading \"{}\"", coords_path.display()))?;
        Ok(SlideTensors { features, coords })
    }
}

/// One retrieved sample: the slide tensors plus the survival target. The
/// `aux` tensor is a 1x1 zero placeholder reserved for an unused auxiliary
/// signal, kept so downstream consumers see a fixed shape.
pub struct Sample {
    pub tensors: Arc<SlideTensors>,
    pub aux: Array2<f32>,
    pub label: usize,
    pub event_time: f64,
    pub censorship: Censorship,
}

/// Fitted standardization step for the auxiliary covariates. Fitting is the
/// collaborator's business (e.g. over [`crate::Split::covariate_matrix`]);
/// the split only ever applies the transform.
pub trait CovariateScaler {
    fn transform(&self, covariates: &mut [f64]);
}

/// Named groups of covariate column names, loaded from a CSV whose header
/// row names the groups and whose columns list member columns (shorter
/// columns padded with blanks).
///
/// Retained as an integration hook for genomic-signature consumers; nothing
/// in this crate reads the groups back.
#[derive(Debug, Clone)]
pub struct SignatureSet {
    groups: Vec<(ArcStr, Vec<ArcStr>)>,
}

impl SignatureSet {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        fn inner(path: &Path) -> Result<SignatureSet> {
            let mut reader = csv::ReaderBuilder::new()
                .has_headers(true)
                .trim(csv::Trim::All)
                .from_path(path)?;
            let headers = reader.headers()?.clone();
            let mut groups: Vec<(ArcStr, Vec<ArcStr>)> = headers
                .iter()
                .map(|name| (ArcStr::from(name), Vec::new()))
                .collect();
            for record in reader.into_records() {
                let record = record?;
                for (idx, value) in record.iter().enumerate() {
                    if !value.is_empty() {
                        groups[idx].1.push(value.into());
                    }
                }
            }
            Ok(SignatureSet { groups })
        }
        let path = path.as_ref();
        inner(path).with_context(|| format!("loading signatures from \"{}\"", path.display()))
    }

    pub fn groups(&self) -> impl Iterator<Item = (&ArcStr, &[ArcStr])> + '_ {
        self.groups.iter().map(|(name, cols)| (name, &cols[..]))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use ndarray::array;
    use ndarray_npy::WriteNpyExt;
    use std::io::Write;

    #[test]
    fn archive_key_strips_one_extension() {
        assert_eq!(archive_key("TCGA-AA-0001-DX1.svs"), "TCGA-AA-0001-DX1");
        assert_eq!(archive_key("slide.ABC.svs"), "slide.ABC");
        assert_eq!(archive_key("no_extension"), "no_extension");
        assert_eq!(archive_key(".hidden"), ".hidden");
    }

    #[test]
    fn resolve_single_and_per_source() {
        let single = DataSource::SingleDirectory("/tmp/features".into());
        assert_eq!(single.resolve(None).unwrap(), Path::new("/tmp/features"));

        let mapped = DataSource::PerSourceDirectory(
            [(ArcStr::from("LUAD"), PathBuf::from("/tmp/luad"))]
                .into_iter()
                .collect(),
        );
        assert_eq!(mapped.resolve(Some("LUAD")).unwrap(), Path::new("/tmp/luad"));
        assert!(mapped.resolve(Some("BRCA")).is_err());
        assert!(mapped.resolve(None).is_err());
    }

    #[test]
    fn npy_archive_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let features = array![[1.0f32, 2.0], [3.0, 4.0]];
        let coords = array![[0.0f32, 0.0], [512.0, 0.0]];
        features
            .write_npy(fs::File::create(dir.path().join("s1.features.npy")).unwrap())
            .unwrap();
        coords
            .write_npy(fs::File::create(dir.path().join("s1.coords.npy")).unwrap())
            .unwrap();

        let tensors = NpyArchive.read(dir.path(), "s1").unwrap();
        assert_eq!(tensors.features, features);
        assert_eq!(tensors.coords, coords);
        assert!(NpyArchive.read(dir.path(), "missing").is_err());
    }

    #[test]
    fn signature_groups_ignore_padding() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"hallmark_a,hallmark_b\ng1,g4\ng2,\ng3,\n")
            .unwrap();
        let signatures = SignatureSet::load(file.path()).unwrap();
        let groups: Vec<_> = signatures.groups().collect();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].1.len(), 3);
        assert_eq!(groups[1].1.len(), 1);
    }
}
