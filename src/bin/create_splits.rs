use clap::Parser;
use qu::ick_use::*;
use std::{fs, path::PathBuf, sync::Arc};
use wsi_survival_data::{
    DataSource, DatasetConfig, NpyArchive, SplitSettings, SurvivalDataset,
};

/// Build survival labels for a cohort CSV and write k stratified
/// train/val/test splits.
#[derive(Parser)]
struct Opt {
    /// Cohort CSV with slide_id, censorship and survival columns.
    csv: PathBuf,
    /// Directory holding the per-slide feature archives.
    #[clap(long, default_value = "features")]
    data_dir: PathBuf,
    /// Time-to-event column, if not survival_months.
    #[clap(long)]
    label_col: Option<String>,
    #[clap(long, default_value_t = 4)]
    n_bins: usize,
    #[clap(long, default_value_t = 7)]
    seed: u64,
    /// Number of folds to generate.
    #[clap(short, default_value_t = 5)]
    k: usize,
    /// Per-class validation quotas; a single value is broadcast over all
    /// classes.
    #[clap(long, value_delimiter = ',', default_value = "5")]
    val_num: Vec<usize>,
    /// Per-class test quotas; a single value is broadcast over all classes.
    #[clap(long, value_delimiter = ',', default_value = "5")]
    test_num: Vec<usize>,
    /// Fraction of the post-quota remainder kept for training.
    #[clap(long, default_value_t = 1.0)]
    label_frac: f64,
    /// Stratify over patients instead of slides.
    #[clap(long)]
    patient_strat: bool,
    /// Output directory for the split CSVs.
    #[clap(long, default_value = "splits")]
    out: PathBuf,
}

#[qu::ick]
pub fn main(opt: Opt) -> Result {
    let config = DatasetConfig {
        label_col: opt.label_col.clone(),
        n_bins: opt.n_bins,
        seed: opt.seed,
        patient_strat: opt.patient_strat,
        ..DatasetConfig::default()
    };
    let mut dataset = SurvivalDataset::from_csv(
        config,
        &opt.csv,
        DataSource::SingleDirectory(opt.data_dir.clone()),
        Arc::new(NpyArchive),
    )?;
    dataset.summarize();

    let num_classes = dataset.num_classes();
    let broadcast = |quotas: &[usize], what: &str| -> Result<Vec<usize>> {
        match quotas {
            [single] => Ok(vec![*single; num_classes]),
            exact if exact.len() == num_classes => Ok(exact.to_vec()),
            other => Err(format_err!(
                "{} has {} entries for {} classes",
                what,
                other.len(),
                num_classes
            )),
        }
    };
    let mut generator = dataset.create_splits(
        opt.k,
        broadcast(&opt.val_num, "val-num")?,
        broadcast(&opt.test_num, "test-num")?,
        SplitSettings::uniform_label_frac(opt.label_frac, num_classes),
        None,
    )?;

    fs::create_dir_all(&opt.out)
        .with_context(|| format!("creating output directory \"{}\"", opt.out.display()))?;
    for fold in 0..opt.k {
        dataset.set_splits(&mut generator)?;
        dataset.split_summary()?;
        let path = opt.out.join(format!("splits_{}.csv", fold));
        dataset.save_split(&path)?;
        println!("wrote {}", path.display());
    }
    Ok(())
}
