//! Per-backend spill files, result pointers, and disk headroom management.
//!
//! Results stream in faster than anyone pages through them, so the raw JSON
//! bytes go straight to an append-only spill file per backend and only a
//! small `ResultPointer` stays in memory. Page files are later spliced
//! together from spill regions without re-parsing the JSON.

use std::fs::File;
use std::hash::Hasher;
use std::io::Write;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use anyhow::{Context, Result};
use parking_lot::Mutex;

/// Locates one JSON-encoded result inside a spill file, with the keys the
/// final ordering needs.
#[derive(Debug, Clone)]
pub struct ResultPointer {
    pub backend_idx: usize,
    pub ranking: f32,
    pub offset: u64,
    pub length: u64,
    /// FNV-1a of the result path; tie-breaker that keeps ordering stable no
    /// matter which backend answered first.
    pub path_hash: u64,
    /// Interned package name (see `StringPool`).
    pub package: Arc<str>,
}

/// (ranking DESC, path hash DESC). Paths are unique per index, so this is a
/// total order.
pub fn sort_pointers(pointers: &mut [ResultPointer]) {
    pointers.sort_by(|a, b| {
        b.ranking
            .total_cmp(&a.ranking)
            .then_with(|| b.path_hash.cmp(&a.path_hash))
    });
}

pub fn fnv64a(bytes: &[u8]) -> u64 {
    let mut h = fnv::FnvHasher::default();
    h.write(bytes);
    h.finish()
}

/// Append-only spill file. Writes are serialized per backend; offsets are
/// captured around each write so pointers stay valid regardless of how the
/// other backends' files interleave.
#[derive(Debug)]
pub struct SpillFile {
    inner: Mutex<SpillInner>,
}

#[derive(Debug)]
struct SpillInner {
    file: File,
    len: u64,
}

impl SpillFile {
    pub fn create(path: PathBuf) -> Result<Self> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .with_context(|| format!("create spill file {}", path.display()))?;
        Ok(SpillFile {
            inner: Mutex::new(SpillInner { file, len: 0 }),
        })
    }

    /// Append `bytes`, returning `(offset, length)` of the written region.
    pub fn append(&self, bytes: &[u8]) -> Result<(u64, u64)> {
        let mut g = self.inner.lock();
        let offset = g.len;
        g.file.write_all_at(bytes, offset)?;
        g.len += bytes.len() as u64;
        Ok((offset, bytes.len() as u64))
    }

    pub fn read_region(&self, offset: u64, length: u64) -> Result<Vec<u8>> {
        let g = self.inner.lock();
        let mut buf = vec![0u8; length as usize];
        g.file.read_exact_at(&mut buf, offset)?;
        Ok(buf)
    }

    pub fn len(&self) -> u64 {
        self.inner.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Splice the regions behind `pointers` into a JSON array (no trailing
/// newline; each region already ends in one).
pub fn write_pointer_regions(
    w: &mut impl Write,
    spills: &[SpillFile],
    pointers: &[ResultPointer],
) -> Result<()> {
    w.write_all(b"[")?;
    for (i, p) in pointers.iter().enumerate() {
        if i > 0 {
            w.write_all(b",")?;
        }
        let region = spills[p.backend_idx].read_region(p.offset, p.length)?;
        w.write_all(&region)?;
    }
    w.write_all(b"]")?;
    Ok(())
}

/// Available and total bytes of the filesystem backing `path`.
pub fn fs_bytes(path: &Path) -> Result<(u64, u64)> {
    use std::os::unix::ffi::OsStrExt;
    let c = std::ffi::CString::new(path.as_os_str().as_bytes())
        .context("path contains NUL byte")?;
    let mut st: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c.as_ptr(), &mut st) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error())
            .with_context(|| format!("statvfs {}", path.display()));
    }
    let frsize = if st.f_frsize > 0 {
        st.f_frsize as u64
    } else {
        st.f_bsize as u64
    };
    Ok((st.f_bavail as u64 * frsize, st.f_blocks as u64 * frsize))
}

/// Make sure `fraction` of the partition backing `root` is available,
/// deleting entire query result directories, oldest mtime first, until it
/// is.
pub fn ensure_headroom(root: &Path, fraction: f64) -> Result<()> {
    let (mut available, total) = fs_bytes(root)?;
    let headroom = (fraction * total as f64) as u64;
    if available >= headroom {
        return Ok(());
    }
    tracing::warn!(
        available,
        headroom,
        root = %root.display(),
        "result partition below headroom, deleting old query results"
    );
    let mut dirs: Vec<(SystemTime, PathBuf)> = Vec::new();
    for entry in std::fs::read_dir(root)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let mtime = entry.metadata()?.modified()?;
        dirs.push((mtime, entry.path()));
    }
    dirs.sort_by_key(|(t, _)| *t);
    for (_, dir) in dirs {
        tracing::info!(dir = %dir.display(), "removing query results for headroom");
        std::fs::remove_dir_all(&dir)?;
        available = fs_bytes(root)?.0;
        if available >= headroom {
            break;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ptr(ranking: f32, path: &str) -> ResultPointer {
        ResultPointer {
            backend_idx: 0,
            ranking,
            offset: 0,
            length: 0,
            path_hash: fnv64a(path.as_bytes()),
            package: Arc::from("pkg_1.0"),
        }
    }

    #[test]
    fn ranking_then_path_hash_descending() {
        // Same ranking: the path hash decides, descending; fnv("b") is the
        // larger of the two.
        assert!(fnv64a(b"b") > fnv64a(b"a"));
        let mut ptrs = vec![ptr(0.9, "a"), ptr(0.9, "b"), ptr(1.5, "c")];
        sort_pointers(&mut ptrs);
        let hashes: Vec<u64> = ptrs.iter().map(|p| p.path_hash).collect();
        assert_eq!(
            hashes,
            vec![fnv64a(b"c"), fnv64a(b"b"), fnv64a(b"a")]
        );
    }

    #[test]
    fn spill_append_records_exact_regions() {
        let dir = tempfile::tempdir().unwrap();
        let spill = SpillFile::create(dir.path().join("unsorted_0.json")).unwrap();
        let (o1, l1) = spill.append(b"{\"a\":1}\n").unwrap();
        let (o2, l2) = spill.append(b"{\"b\":2}\n").unwrap();
        assert_eq!((o1, l1), (0, 8));
        assert_eq!(o2, 8);
        assert_eq!(spill.read_region(o2, l2).unwrap(), b"{\"b\":2}\n");
    }

    #[test]
    fn pointer_regions_form_a_json_array() {
        let dir = tempfile::tempdir().unwrap();
        let spill = SpillFile::create(dir.path().join("unsorted_0.json")).unwrap();
        let (o1, l1) = spill.append(b"{\"a\":1}\n").unwrap();
        let (o2, l2) = spill.append(b"{\"b\":2}\n").unwrap();
        let mut p1 = ptr(1.0, "x");
        p1.offset = o1;
        p1.length = l1;
        let mut p2 = ptr(0.5, "y");
        p2.offset = o2;
        p2.length = l2;
        let spills = vec![spill];
        let mut out = Vec::new();
        write_pointer_regions(&mut out, &spills, &[p1, p2]).unwrap();
        let parsed: Vec<serde_json::Value> = serde_json::from_slice(&out).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0]["a"], 1);
    }

    #[test]
    fn fs_bytes_reports_something() {
        let (avail, total) = fs_bytes(Path::new("/")).unwrap();
        assert!(total > 0);
        assert!(avail <= total);
    }
}
