//! Subscriber list consumed by the alert evaluator.
//!
//! Subscribers are owned by an external account system. The default source
//! reads `.tremor/subscribers.yaml`, which that system keeps up to date.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::paths;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscriber {
    pub id: String,
    pub channel_id: String,
    /// Personal alert threshold; only honoured for premium subscribers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f64>,
    #[serde(default)]
    pub premium: bool,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

pub trait SubscriberSource: Send + Sync {
    fn list_active_subscribers(&self) -> Result<Vec<Subscriber>>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubscriberFile {
    #[serde(default)]
    pub subscribers: Vec<Subscriber>,
}

/// Reads the YAML subscriber file on every call so external edits are
/// picked up by the next run. A missing file means no subscribers.
#[derive(Debug, Clone)]
pub struct YamlSubscribers {
    path: PathBuf,
}

impl YamlSubscribers {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn for_root(root: &Path) -> Self {
        Self::new(paths::subscribers_path(root))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<SubscriberFile> {
        if !self.path.exists() {
            return Ok(SubscriberFile::default());
        }
        let data = std::fs::read_to_string(&self.path)?;
        if data.trim().is_empty() {
            return Ok(SubscriberFile::default());
        }
        Ok(serde_yaml::from_str(&data)?)
    }
}

impl SubscriberSource for YamlSubscribers {
    fn list_active_subscribers(&self) -> Result<Vec<Subscriber>> {
        let file = self.load()?;
        let mut seen = std::collections::HashSet::new();
        Ok(file
            .subscribers
            .into_iter()
            .filter(|s| s.active)
            .filter(|s| {
                let fresh = seen.insert(s.id.clone());
                if !fresh {
                    tracing::warn!(subscriber = %s.id, "duplicate subscriber id, keeping first entry");
                }
                fresh
            })
            .collect())
    }
}

/// Fixed in-memory list.
#[derive(Debug, Clone, Default)]
pub struct StaticSubscribers(pub Vec<Subscriber>);

impl SubscriberSource for StaticSubscribers {
    fn list_active_subscribers(&self) -> Result<Vec<Subscriber>> {
        Ok(self.0.iter().filter(|s| s.active).cloned().collect())
    }
}
