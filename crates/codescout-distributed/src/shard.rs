//! Shard directory ownership: per-package indexing, merging, publication.
//!
//! A shard directory holds `src/<package>/...` (the indexed source files),
//! `idx/<package>` (per-package indexes) and published `full.<timestamp>`
//! merged indexes. Indexing runs on blocking threads, bounded by a
//! semaphore sized to the machine; merging is exclusive — a second merge
//! attempt fails immediately instead of queueing.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use codescout_index::concat::concat_n;
use codescout_index::walk::DefaultIgnorePolicy;
use codescout_index::{Error, IndexWriter};
use tokio::sync::{Semaphore, SemaphorePermit};

pub struct ShardPublisher {
    root: PathBuf,
    unpack_sem: Semaphore,
    merge_sem: Semaphore,
}

/// Exclusive merge token; holding it makes `merge` fail fast.
pub struct MergeGuard<'a> {
    _permit: SemaphorePermit<'a>,
}

impl ShardPublisher {
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(root.join("src"))?;
        fs::create_dir_all(root.join("idx"))?;
        let parallelism = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Ok(ShardPublisher {
            root,
            unpack_sem: Semaphore::new(parallelism),
            merge_sem: Semaphore::new(1),
        })
    }

    pub fn src_dir(&self) -> PathBuf {
        self.root.join("src")
    }

    pub fn idx_dir(&self) -> PathBuf {
        self.root.join("idx")
    }

    /// Index the unpacked tree at `<staging>/<pkg>` into `idx/<pkg>`,
    /// copying every accepted file into `src/<pkg>/...`. Returns the number
    /// of indexed files. Concurrency is bounded by the CPU count.
    pub async fn index_package(&self, pkg: &str, staging: &Path) -> Result<usize> {
        let _permit = self.unpack_sem.acquire().await.context("unpack semaphore")?;
        let pkg = pkg.to_string();
        let staging = staging.to_path_buf();
        let src_root = self.src_dir();
        let idx_path = self.idx_dir().join(&pkg);
        tokio::task::spawn_blocking(move || index_package_sync(&pkg, &staging, &src_root, &idx_path))
            .await
            .context("indexing task panicked")?
    }

    /// Sorted source package names present in the shard.
    pub fn packages(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let src = self.src_dir();
        let entries = match fs::read_dir(&src) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
            Err(e) => return Err(e).with_context(|| format!("read {}", src.display())),
        };
        for entry in entries {
            let entry = entry?;
            if let Ok(name) = entry.file_name().into_string() {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    /// Remove a package's sources and index from the shard.
    pub fn garbage_collect(&self, pkg: &str) -> Result<()> {
        if !self.packages()?.iter().any(|n| n == pkg) {
            bail!("no such package {:?}", pkg);
        }
        fs::remove_dir_all(self.src_dir().join(pkg))?;
        match fs::remove_file(self.idx_dir().join(pkg)) {
            Ok(()) => {}
            // A package can be present without having been indexed yet.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        tracing::info!(pkg, "garbage-collected package");
        Ok(())
    }

    /// Claim merge exclusivity, or fail with the merge-in-progress error.
    pub fn try_begin_merge(&self) -> Result<MergeGuard<'_>> {
        match self.merge_sem.try_acquire() {
            Ok(permit) => Ok(MergeGuard { _permit: permit }),
            Err(_) => Err(Error::MergeInProgress.into()),
        }
    }

    /// Merge all package indexes into a fresh `full.<timestamp>` sibling
    /// and return its path; swapping it in is the control plane's job.
    pub async fn merge(&self) -> Result<PathBuf> {
        let _guard = self.try_begin_merge()?;
        let idx_dir = self.idx_dir();
        let inputs: Vec<PathBuf> = self
            .packages()?
            .into_iter()
            .map(|name| idx_dir.join(name))
            .filter(|p| p.is_file())
            .collect();
        if inputs.len() < 2 {
            bail!("got {} index files, want at least 2", inputs.len());
        }
        let ts = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs();
        let dest = self.root.join(format!("full.{}", ts));
        let out = dest.clone();
        let started = std::time::Instant::now();
        tokio::task::spawn_blocking(move || concat_n(&out, &inputs))
            .await
            .context("merge task panicked")??;
        tracing::info!(dest = %dest.display(), elapsed = ?started.elapsed(), "merged shard index");
        Ok(dest)
    }

    /// Delete published full indexes other than `keep`. Returns how many
    /// were removed.
    pub fn collect_stale(&self, keep: &Path) -> Result<usize> {
        let mut removed = 0;
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with("full.") && entry.path() != keep {
                fs::remove_file(entry.path())?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

fn index_package_sync(
    pkg: &str,
    staging: &Path,
    src_root: &Path,
    idx_path: &Path,
) -> Result<usize> {
    let unpacked = staging.join(pkg);
    if !unpacked.is_dir() {
        bail!("no unpacked tree at {}", unpacked.display());
    }
    tracing::info!(pkg, "indexing package");
    let mut writer = IndexWriter::create(idx_path)?;
    let policy = DefaultIgnorePolicy::default();
    let mut accepted = 0usize;
    let mut copy_err: Option<anyhow::Error> = None;
    writer.add_dir(
        &unpacked,
        staging,
        &policy,
        |v, reason| tracing::debug!(path = %v.rel, %reason, "skipping"),
        |v, _docid| {
            accepted += 1;
            if copy_err.is_none() {
                if let Err(e) = copy_into_shard(&v.path, &src_root.join(&v.rel)) {
                    copy_err = Some(e);
                }
            }
        },
    )?;
    if let Some(e) = copy_err {
        return Err(e.context(format!("copy {} sources into shard", pkg)));
    }
    writer.flush()?;
    Ok(accepted)
}

fn copy_into_shard(from: &Path, to: &Path) -> Result<()> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::copy(from, to)
        .with_context(|| format!("copy {} to {}", from.display(), to.display()))?;
    Ok(())
}
