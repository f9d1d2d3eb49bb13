use anyhow::Context;
use std::path::Path;
use tremor_core::{config::Config, io, paths, store::DatasetStore};

const EMPTY_SUBSCRIBERS: &str = "subscribers: []\n";

pub fn run(root: &Path, url: Option<&str>, fallback_url: Option<&str>) -> anyhow::Result<()> {
    println!("Initializing tremor in: {}", root.display());

    let dir = paths::tremor_dir(root);
    io::ensure_dir(&dir).with_context(|| format!("failed to create {}", dir.display()))?;

    let config = if paths::config_path(root).exists() {
        println!("  exists:  {}", paths::CONFIG_FILE);
        if url.is_some() || fallback_url.is_some() {
            eprintln!("warning: config already exists; --url/--fallback-url ignored");
        }
        Config::load(root).context("failed to load config.yaml")?
    } else {
        let mut cfg = Config::new(url.unwrap_or_default());
        cfg.source.fallback_url = fallback_url.map(str::to_string);
        cfg.save(root).context("failed to write config.yaml")?;
        println!("  created: {}", paths::CONFIG_FILE);
        cfg
    };

    let created = io::write_if_missing(
        &paths::subscribers_path(root),
        EMPTY_SUBSCRIBERS.as_bytes(),
    )
    .context("failed to write subscribers.yaml")?;
    if created {
        println!("  created: {}", paths::SUBSCRIBERS_FILE);
    } else {
        println!("  exists:  {}", paths::SUBSCRIBERS_FILE);
    }

    let store = DatasetStore::from_config(root, &config.store);
    let source = store.bootstrap().context("failed to prepare dataset")?;
    println!("  dataset: {} ({source:?})", config.store.path);

    if config.source.primary_url.is_empty() {
        println!("\nSet source.primary_url in {} before running.", paths::CONFIG_FILE);
    }
    Ok(())
}
