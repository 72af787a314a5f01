//! Deterministic source-tree traversal with pluggable skip policies.
//!
//! Traversal and the decision of what to index are kept apart: the walker
//! yields one `Visit` per file-like entry, each either accepted or skipped
//! with a reason, and an `IgnorePolicy` decides by name, extension and size.
//! Content-based skips (binary detection) happen later, in the index writer,
//! once the file has been read.

use std::fmt::{self, Display};
use std::path::{Path, PathBuf};

/// Why an entry was excluded from the index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    IgnoredName,
    IgnoredExtension,
    TooLarge(u64),
    /// NUL byte within the first `write::BINARY_CHECK_LEN` bytes.
    Binary,
    /// Symlink, device node, or anything else that is not a regular file.
    NotAFile,
    NonUtf8Path,
    Unreadable(String),
}

impl Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::IgnoredName => write!(f, "ignored file name"),
            SkipReason::IgnoredExtension => write!(f, "ignored extension"),
            SkipReason::TooLarge(n) => write!(f, "file too large ({} bytes)", n),
            SkipReason::Binary => write!(f, "binary content"),
            SkipReason::NotAFile => write!(f, "not a regular file"),
            SkipReason::NonUtf8Path => write!(f, "path is not valid UTF-8"),
            SkipReason::Unreadable(e) => write!(f, "unreadable: {}", e),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Accepted,
    Skipped(SkipReason),
}

/// One file-like entry seen during traversal.
#[derive(Debug, Clone)]
pub struct Visit {
    pub path: PathBuf,
    /// Path with the configured prefix stripped; this is what the docid map
    /// records.
    pub rel: String,
    pub len: u64,
    pub outcome: Outcome,
}

/// Decides, from metadata alone, whether a file is excluded.
pub trait IgnorePolicy: Sync {
    fn ignore(&self, rel: &str, len: u64) -> Option<SkipReason>;
}

/// Skips well-known binary and generated artifacts plus oversized files.
#[derive(Debug, Clone)]
pub struct DefaultIgnorePolicy {
    pub max_file_size: u64,
}

impl Default for DefaultIgnorePolicy {
    fn default() -> Self {
        DefaultIgnorePolicy {
            max_file_size: 1_000_000,
        }
    }
}

const IGNORED_EXTENSIONS: &[&str] = &[
    "a", "bmp", "bz2", "class", "gif", "gz", "ico", "jar", "jpeg", "jpg", "mo", "o", "pdf", "png",
    "so", "svg", "tar", "tgz", "ttf", "woff", "xz", "zip",
];

const IGNORED_NAMES: &[&str] = &["config.guess", "config.sub", "configure", "ltmain.sh"];

impl IgnorePolicy for DefaultIgnorePolicy {
    fn ignore(&self, rel: &str, len: u64) -> Option<SkipReason> {
        if len > self.max_file_size {
            return Some(SkipReason::TooLarge(len));
        }
        let name = rel.rsplit('/').next().unwrap_or(rel);
        if IGNORED_NAMES.contains(&name) {
            return Some(SkipReason::IgnoredName);
        }
        if let Some(ext) = name.rsplit_once('.').map(|(_, e)| e) {
            if IGNORED_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()) {
                return Some(SkipReason::IgnoredExtension);
            }
        }
        None
    }
}

/// Walk `root` in lexicographic order, yielding a `Visit` for every
/// non-directory entry. Identical trees produce identical visit sequences,
/// which is what makes index builds reproducible.
pub fn walk_tree<'a>(
    root: &Path,
    strip_prefix: &'a Path,
    policy: &'a dyn IgnorePolicy,
) -> impl Iterator<Item = Visit> + 'a {
    let walker = ignore::WalkBuilder::new(root)
        .standard_filters(false)
        .follow_links(false)
        .sort_by_file_name(|a, b| a.cmp(b))
        .build();

    walker.filter_map(move |entry| {
        let entry = match entry {
            Ok(e) => e,
            Err(err) => {
                log::warn!("walk error: {}", err);
                return None;
            }
        };
        let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
        if is_dir {
            return None;
        }
        let path = entry.path().to_path_buf();
        let rel_path = path.strip_prefix(strip_prefix).unwrap_or(&path);
        let rel = match rel_path.to_str() {
            Some(s) => s.to_string(),
            None => {
                return Some(Visit {
                    rel: rel_path.to_string_lossy().into_owned(),
                    path,
                    len: 0,
                    outcome: Outcome::Skipped(SkipReason::NonUtf8Path),
                })
            }
        };
        let is_file = entry.file_type().map(|t| t.is_file()).unwrap_or(false);
        if !is_file {
            return Some(Visit {
                path,
                rel,
                len: 0,
                outcome: Outcome::Skipped(SkipReason::NotAFile),
            });
        }
        let len = match entry.metadata() {
            Ok(m) => m.len(),
            Err(e) => {
                return Some(Visit {
                    path,
                    rel,
                    len: 0,
                    outcome: Outcome::Skipped(SkipReason::Unreadable(e.to_string())),
                })
            }
        };
        let outcome = match policy.ignore(&rel, len) {
            Some(reason) => Outcome::Skipped(reason),
            None => Outcome::Accepted,
        };
        Some(Visit {
            path,
            rel,
            len,
            outcome,
        })
    })
}
