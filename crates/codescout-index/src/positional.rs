//! Positional verification for literal queries.
//!
//! The trigram AND gives candidate documents; the positional postings then
//! pin down the byte offsets where the literal can actually start. Byte-wise
//! verification against file content stays with the caller.

use anyhow::{bail, Result};

use crate::read::{intersect_sorted, Index};
use crate::trigram::trigram_at;
use crate::Trigram;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PositionalMatch {
    pub docid: u32,
    /// Byte offset of the literal's first byte within the document.
    pub offset: u32,
}

/// Find every `(docid, offset)` at which `literal` can occur, using only the
/// index. Offsets are verified by checking that the literal's covering
/// trigrams appear at their expected relative positions.
pub fn query_positional(ix: &Index, literal: &[u8]) -> Result<Vec<PositionalMatch>> {
    if literal.len() < 3 {
        bail!(
            "positional query needs a literal of at least 3 bytes, got {}",
            literal.len()
        );
    }

    // Candidate documents: AND of all distinct trigrams, smallest list first.
    let mut distinct: Vec<Trigram> = (0..=literal.len() - 3)
        .map(|i| trigram_at(literal, i))
        .collect();
    distinct.sort_unstable();
    distinct.dedup();
    let mut lists = Vec::with_capacity(distinct.len());
    for &t in &distinct {
        lists.push(ix.posting_list(t)?);
    }
    lists.sort_by_key(|l| l.len());
    let mut candidates = match lists.first() {
        None => return Ok(Vec::new()),
        Some(l) => l.clone(),
    };
    for l in &lists[1..] {
        if candidates.is_empty() {
            return Ok(Vec::new());
        }
        candidates = intersect_sorted(&candidates, l);
    }

    // Covering windows: every third trigram plus the final one reaches every
    // byte of the literal.
    let last = literal.len() - 3;
    let mut checks: Vec<usize> = (3..=last).step_by(3).collect();
    if last > 0 && checks.last() != Some(&last) {
        checks.push(last);
    }

    let first_tri = trigram_at(literal, 0);
    let mut out = Vec::new();
    for docid in candidates {
        let starts = ix.positional_for_doc(first_tri, docid)?;
        if starts.is_empty() {
            continue;
        }
        let check_offsets: Vec<(u32, Vec<u32>)> = checks
            .iter()
            .map(|&k| {
                ix.positional_for_doc(trigram_at(literal, k), docid)
                    .map(|v| (k as u32, v))
            })
            .collect::<Result<_>>()?;
        'starts: for start in starts {
            for (k, offsets) in &check_offsets {
                match start.checked_add(*k) {
                    Some(want) if offsets.binary_search(&want).is_ok() => {}
                    _ => continue 'starts,
                }
            }
            out.push(PositionalMatch {
                docid,
                offset: start,
            });
        }
    }
    Ok(out)
}
