//! N-way index merge: concatenates per-package indexes into one shard index.
//!
//! Input `i` contributes docids `[base_i, base_i + count_i)` where `base_i`
//! is the sum of the doc counts before it. Per-input posting lists are
//! already ascending and bases increase across inputs, so each merged list
//! is a straight concatenation with shifted docids; nothing is ever held in
//! memory beyond the current trigram's merged postings.

use std::path::Path;
use std::time::Instant;

use anyhow::{bail, Context, Result};

use crate::docidmap::DocidMapWriter;
use crate::read::Index;
use crate::write::IndexFileBuilder;

/// Merge `inputs` (in order) into a new index at `out`. Deterministic given
/// the input order; a single-input merge re-serializes to identical bytes.
pub fn concat_n<P: AsRef<Path>>(out: &Path, inputs: &[P]) -> Result<()> {
    if inputs.is_empty() {
        bail!("concat_n: no input indexes");
    }
    let start = Instant::now();
    let mut readers = Vec::with_capacity(inputs.len());
    for p in inputs {
        let p = p.as_ref();
        readers.push(
            Index::open(p).with_context(|| format!("open merge input {}", p.display()))?,
        );
    }

    let mut bases = Vec::with_capacity(readers.len());
    let mut total: u64 = 0;
    for r in &readers {
        bases.push(total as u32);
        total += r.doc_count() as u64;
        if total > u32::MAX as u64 {
            bail!("merged index would exceed {} documents", u32::MAX);
        }
    }

    let mut docids = DocidMapWriter::new();
    for r in &readers {
        for d in 0..r.doc_count() {
            docids.append(r.resolve(d)?)?;
        }
    }

    let mut builder = IndexFileBuilder::create(out)?;

    // Cursor per input over its sorted trigram directory.
    let dirs: Vec<Vec<crate::DirEntry>> =
        readers.iter().map(|r| r.directory().collect()).collect();
    let mut pos = vec![0usize; readers.len()];
    let mut merged_docs: Vec<u32> = Vec::new();
    let mut merged_blocks: Vec<(u32, Vec<u32>)> = Vec::new();

    loop {
        let mut tri: Option<u32> = None;
        for (i, dir) in dirs.iter().enumerate() {
            if let Some(e) = dir.get(pos[i]) {
                tri = Some(match tri {
                    None => e.trigram,
                    Some(t) => t.min(e.trigram),
                });
            }
        }
        let tri = match tri {
            None => break,
            Some(t) => t,
        };

        merged_docs.clear();
        merged_blocks.clear();
        for (i, r) in readers.iter().enumerate() {
            match dirs[i].get(pos[i]) {
                Some(e) if e.trigram == tri => {}
                _ => continue,
            }
            pos[i] += 1;
            let t = crate::u32_to_tri(tri);
            for d in r.posting_list(t)? {
                merged_docs.push(d + bases[i]);
            }
            for (d, offsets) in r.positional_list(t)? {
                merged_blocks.push((d + bases[i], offsets));
            }
        }
        builder.add_trigram(tri, &merged_docs, &merged_blocks)?;
    }

    builder.finish(&docids.serialize())?;
    log::info!(
        "merged {} indexes ({} documents) into {} in {:?}",
        readers.len(),
        total,
        out.display(),
        start.elapsed()
    );
    Ok(())
}
