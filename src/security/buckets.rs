//! Persisted permission buckets.
//!
//! Base command names are sorted into `always_allow`, `always_ask` and
//! `always_block`. The mapping lives in a JSON file that operators edit by
//! hand, so it is always written back sorted and pretty-printed.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::PermissionBucket;

/// On-disk shape of the permission file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BucketMap {
    #[serde(default)]
    pub always_allow: BTreeSet<String>,
    #[serde(default)]
    pub always_ask: BTreeSet<String>,
    #[serde(default)]
    pub always_block: BTreeSet<String>,
}

impl Default for BucketMap {
    /// Seed used when no permission file exists yet.
    fn default() -> Self {
        fn set(names: &[&str]) -> BTreeSet<String> {
            names.iter().map(|n| n.to_string()).collect()
        }
        Self {
            always_allow: set(&[
                "cat", "date", "df", "du", "echo", "file", "find", "grep", "head", "ls", "pwd",
                "stat", "tail", "uname", "wc", "which", "whoami",
            ]),
            always_ask: set(&[
                "chmod", "chown", "cp", "curl", "git", "kill", "mkdir", "mv", "rm", "wget",
            ]),
            always_block: set(&[
                "emacs", "htop", "less", "man", "more", "nano", "ssh", "top", "vi", "vim",
                "watch",
            ]),
        }
    }
}

impl BucketMap {
    /// Precedence when a name is listed twice: block > ask > allow.
    pub fn classify(&self, base: &str) -> PermissionBucket {
        if self.always_block.contains(base) {
            PermissionBucket::AlwaysBlock
        } else if self.always_ask.contains(base) {
            PermissionBucket::AlwaysAsk
        } else if self.always_allow.contains(base) {
            PermissionBucket::AlwaysAllow
        } else {
            PermissionBucket::AlwaysAsk
        }
    }
}

pub struct PermissionBucketStore {
    path: PathBuf,
    buckets: RwLock<Arc<BucketMap>>,
}

impl PermissionBucketStore {
    /// Load the mapping from `path`.
    pub fn open(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let buckets = load(&path)?;
        Ok(Self {
            path,
            buckets: RwLock::new(Arc::new(buckets)),
        })
    }

    /// Like [`open`](Self::open), but writes the default mapping first when
    /// the file does not exist.
    pub fn open_or_seed(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        if !path.exists() {
            warn!("Permission file {} missing, seeding defaults", path.display());
            save(&path, &BucketMap::default())?;
        }
        Self::open(path)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current mapping. Holders keep a consistent view across a reload.
    pub fn snapshot(&self) -> Arc<BucketMap> {
        match self.buckets.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn classify(&self, base: &str) -> PermissionBucket {
        self.snapshot().classify(base)
    }

    /// Re-read the file and swap the whole mapping in one step. On a parse
    /// error the previous mapping stays in effect.
    pub fn reload(&self) -> anyhow::Result<()> {
        let fresh = Arc::new(load(&self.path)?);
        self.swap(fresh);
        info!("Reloaded permission buckets from {}", self.path.display());
        Ok(())
    }

    /// Move `base` from `always_ask` to `always_allow` and persist.
    /// Promoting a name that is already allowed is a no-op rewrite.
    pub fn promote(&self, base: &str) -> anyhow::Result<()> {
        let mut next = (*self.snapshot()).clone();
        next.always_ask.remove(base);
        next.always_allow.insert(base.to_string());
        save(&self.path, &next)?;
        self.swap(Arc::new(next));
        info!("Promoted '{}' to always_allow", base);
        Ok(())
    }

    fn swap(&self, next: Arc<BucketMap>) {
        match self.buckets.write() {
            Ok(mut guard) => *guard = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }
    }
}

fn load(path: &Path) -> anyhow::Result<BucketMap> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let buckets: BucketMap = serde_json::from_str(&raw)
        .with_context(|| format!("Invalid permission JSON at {}", path.display()))?;
    Ok(buckets)
}

fn save(path: &Path, buckets: &BucketMap) -> anyhow::Result<()> {
    let data = serde_json::to_vec_pretty(buckets).context("Failed to serialize buckets")?;
    write_atomic(path, &data)
}

fn write_atomic(path: &Path, data: &[u8]) -> anyhow::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, data).with_context(|| format!("Failed to write temp file: {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| {
        format!("Failed to replace {} with {}", path.display(), tmp.display())
    })?;
    Ok(())
}
