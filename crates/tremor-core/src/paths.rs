use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// Directory constants
// ---------------------------------------------------------------------------

pub const TREMOR_DIR: &str = ".tremor";
pub const CONFIG_FILE: &str = ".tremor/config.yaml";
pub const SUBSCRIBERS_FILE: &str = ".tremor/subscribers.yaml";
pub const PIPELINE_DB: &str = ".tremor/pipeline.db";

/// Default canonical dataset location, relative to the root.
pub const DATASET_FILE: &str = "data/tremor.csv";
/// Pre-canonical single-file location, consulted only at bootstrap.
pub const LEGACY_DATASET_FILE: &str = "tremor.csv";
/// Bundled seed snapshot, consulted only at bootstrap.
pub const SEED_DATASET_FILE: &str = "seed/tremor_seed.csv";

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

pub fn tremor_dir(root: &Path) -> PathBuf {
    root.join(TREMOR_DIR)
}

pub fn config_path(root: &Path) -> PathBuf {
    root.join(CONFIG_FILE)
}

pub fn subscribers_path(root: &Path) -> PathBuf {
    root.join(SUBSCRIBERS_FILE)
}

pub fn pipeline_db_path(root: &Path) -> PathBuf {
    root.join(PIPELINE_DB)
}

/// Resolve a configured path: absolute paths pass through, relative ones
/// hang off `root`.
pub fn resolve(root: &Path, configured: &str) -> PathBuf {
    let p = Path::new(configured);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        root.join(p)
    }
}
