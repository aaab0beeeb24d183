use clap::Parser;
use qu::ick_use::*;
use std::{path::PathBuf, sync::Arc};
use wsi_survival_data::{
    tasks, DataSource, DatasetConfig, NpyArchive, SurvivalDataset,
};

/// Print the label space and per-class counts for a cohort CSV.
#[derive(Parser)]
struct Opt {
    csv: PathBuf,
    #[clap(long)]
    label_col: Option<String>,
    #[clap(long, default_value_t = 4)]
    n_bins: usize,
    /// Task name to look up model tensor bounds for (e.g. BRCA, LUAD).
    #[clap(long)]
    task: Option<String>,
}

#[qu::ick]
pub fn main(opt: Opt) -> Result {
    let config = DatasetConfig {
        label_col: opt.label_col.clone(),
        n_bins: opt.n_bins,
        ..DatasetConfig::default()
    };
    let dataset = SurvivalDataset::from_csv(
        config,
        &opt.csv,
        DataSource::SingleDirectory("features".into()),
        Arc::new(NpyArchive),
    )?;
    dataset.summarize();

    if let Some(task) = &opt.task {
        match tasks::task_size(task) {
            Some(size) => println!(
                "task {}: max width {}, max height {}",
                task, size.max_width, size.max_height
            ),
            None => println!("task {}: no registered tensor bounds", task),
        }
    }
    Ok(())
}
