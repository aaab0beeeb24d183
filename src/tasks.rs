//! Fixed per-task tensor bounds consumed by the downstream model.
use once_cell::sync::Lazy;
use std::collections::BTreeMap;

/// Class count the survival tasks below are trained with (4 bins x 2
/// censorship states).
pub const SURVIVAL_N_CLASSES: usize = 8;

/// Maximum patch-grid extent of any slide in a task's cohort.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskSize {
    pub max_width: u32,
    pub max_height: u32,
}

static TASK_SIZES: Lazy<BTreeMap<&'static str, TaskSize>> = Lazy::new(|| {
    let mut map = BTreeMap::new();
    let mut insert = |task, max_width, max_height| {
        map.insert(task, TaskSize { max_width, max_height });
    };
    insert("BRCA", 212_297, 418_560);
    insert("KIRC", 205_262, 222_080);
    insert("KIRP", 205_262, 222_080);
    insert("UCEC", 198_656, 122_176);
    insert("STAD", 198_656, 94_014);
    insert("LUAD", 197_796, 110_976);
    map
});

/// Bounds for a task name; unknown tasks get none.
pub fn task_size(task: &str) -> Option<TaskSize> {
    TASK_SIZES.get(task).copied()
}
