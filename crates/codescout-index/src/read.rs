//! Memory-mapped index reader and posting-list query evaluation.

use std::fs::File;
use std::path::Path;

use anyhow::{Context, Result};
use memmap2::Mmap;

use crate::docidmap::DocidMapView;
use crate::error::Error;
use crate::query::{Query, QueryOp};
use crate::varint::{decode_delta_list, read_uvarint, DeltaList};
use crate::{trailer_checksum, tri_to_u32, DirEntry, Trigram, DIR_ENTRY_LEN, MAGIC, TRAILER_LEN, VERSION};

/// A read-only view of one index file. Safe to share across threads; all
/// lookups borrow the mapping, which lives as long as the `Index`.
pub struct Index {
    mmap: Mmap,
    dir_off: usize,
    dir_count: usize,
    postings_off: usize,
    positional_off: usize,
    docidmap_off: usize,
    doc_count: u32,
}

impl Index {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
        let mmap = unsafe { Mmap::map(&file).context("mmap index file")? };
        if mmap.len() < 8 + TRAILER_LEN {
            return Err(Error::BadHeader(format!("file too small ({} bytes)", mmap.len())).into());
        }
        let magic = u32::from_le_bytes(mmap[0..4].try_into().unwrap());
        if magic != MAGIC {
            return Err(Error::BadHeader(format!("bad magic {:#010x}", magic)).into());
        }
        let version = u32::from_le_bytes(mmap[4..8].try_into().unwrap());
        if version != VERSION {
            return Err(Error::BadHeader(format!(
                "unsupported version {} (want {})",
                version, VERSION
            ))
            .into());
        }

        let trailer = &mmap[mmap.len() - TRAILER_LEN..];
        let checksum = u64::from_le_bytes(trailer[32..40].try_into().unwrap());
        if checksum != trailer_checksum(&trailer[..32]) {
            return Err(Error::BadHeader("trailer checksum mismatch".into()).into());
        }
        let dir_off = u64::from_le_bytes(trailer[0..8].try_into().unwrap()) as usize;
        let postings_off = u64::from_le_bytes(trailer[8..16].try_into().unwrap()) as usize;
        let positional_off = u64::from_le_bytes(trailer[16..24].try_into().unwrap()) as usize;
        let docidmap_off = u64::from_le_bytes(trailer[24..32].try_into().unwrap()) as usize;

        let end = mmap.len() - TRAILER_LEN;
        if dir_off != 8
            || postings_off < dir_off
            || positional_off < postings_off
            || docidmap_off < positional_off
            || docidmap_off > end
        {
            return Err(Error::Corrupt("trailer offsets out of order".into()).into());
        }
        let dir_len = postings_off - dir_off;
        if dir_len % DIR_ENTRY_LEN != 0 {
            return Err(Error::Corrupt("trigram directory misaligned".into()).into());
        }
        let dir_count = dir_len / DIR_ENTRY_LEN;

        let ix = Index {
            mmap,
            dir_off,
            dir_count,
            postings_off,
            positional_off,
            docidmap_off,
            doc_count: 0,
        };
        ix.validate_directory(end)?;
        let doc_count = ix.docidmap()?.count();
        Ok(Index { doc_count, ..ix })
    }

    fn validate_directory(&self, file_end: usize) -> Result<()> {
        let postings_len = self.positional_off - self.postings_off;
        let positional_len = self.docidmap_off - self.positional_off;
        let mut prev: Option<u32> = None;
        for i in 0..self.dir_count {
            let e = self.dir_entry(i);
            if let Some(p) = prev {
                if e.trigram <= p {
                    return Err(Error::Corrupt(format!(
                        "trigram directory not sorted at entry {}",
                        i
                    ))
                    .into());
                }
            }
            prev = Some(e.trigram);
            if e.posting_range().end > postings_len || e.positional_range().end > positional_len {
                return Err(
                    Error::Corrupt(format!("directory entry {} points past its region", i)).into(),
                );
            }
        }
        if self.docidmap_off > file_end {
            return Err(Error::Corrupt("docid map region out of bounds".into()).into());
        }
        Ok(())
    }

    fn dir_entry(&self, i: usize) -> DirEntry {
        let base = self.dir_off + i * DIR_ENTRY_LEN;
        let b = &self.mmap[base..base + DIR_ENTRY_LEN];
        DirEntry {
            trigram: u32::from_le_bytes(b[0..4].try_into().unwrap()),
            posting_off: u32::from_le_bytes(b[4..8].try_into().unwrap()),
            posting_len: u32::from_le_bytes(b[8..12].try_into().unwrap()),
            positional_off: u32::from_le_bytes(b[12..16].try_into().unwrap()),
            positional_len: u32::from_le_bytes(b[16..20].try_into().unwrap()),
        }
    }

    pub(crate) fn docidmap(&self) -> Result<DocidMapView<'_>> {
        DocidMapView::parse(&self.mmap[self.docidmap_off..self.mmap.len() - TRAILER_LEN])
    }

    pub fn doc_count(&self) -> u32 {
        self.doc_count
    }

    pub fn resolve(&self, docid: u32) -> Result<&str> {
        self.docidmap()?.lookup(docid)
    }

    /// Binary search the trigram directory.
    pub fn lookup_trigram(&self, tri: Trigram) -> Option<DirEntry> {
        let want = tri_to_u32(tri);
        let mut lo = 0usize;
        let mut hi = self.dir_count;
        while lo < hi {
            let mid = (lo + hi) / 2;
            let e = self.dir_entry(mid);
            if e.trigram == want {
                return Some(e);
            } else if e.trigram < want {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        None
    }

    pub fn directory(&self) -> impl Iterator<Item = DirEntry> + '_ {
        (0..self.dir_count).map(move |i| self.dir_entry(i))
    }

    fn posting_bytes(&self, e: &DirEntry) -> &[u8] {
        let r = e.posting_range();
        &self.mmap[self.postings_off + r.start..self.postings_off + r.end]
    }

    fn positional_bytes(&self, e: &DirEntry) -> &[u8] {
        let r = e.positional_range();
        &self.mmap[self.positional_off + r.start..self.positional_off + r.end]
    }

    /// Decode the posting list for `tri`; empty for absent trigrams.
    pub fn posting_list(&self, tri: Trigram) -> Result<Vec<u32>> {
        match self.lookup_trigram(tri) {
            None => Ok(Vec::new()),
            Some(e) => decode_delta_list(self.posting_bytes(&e))
                .map_err(|err| Error::Corrupt(format!("posting list: {}", err)).into()),
        }
    }

    /// Lazily decoded posting list; items surface corruption as errors.
    pub fn postings(&self, tri: Trigram) -> DeltaList<'_> {
        match self.lookup_trigram(tri) {
            None => DeltaList::new(&[]),
            Some(e) => DeltaList::new(self.posting_bytes(&e)),
        }
    }

    /// Decode every positional block for `tri` as `(docid, offsets)`.
    pub fn positional_list(&self, tri: Trigram) -> Result<Vec<(u32, Vec<u32>)>> {
        let e = match self.lookup_trigram(tri) {
            None => return Ok(Vec::new()),
            Some(e) => e,
        };
        let buf = self.positional_bytes(&e);
        let mut out = Vec::new();
        let mut off = 0usize;
        let mut prev_doc = 0u32;
        let mut first = true;
        while off < buf.len() {
            let gap = read_uvarint(buf, &mut off)?;
            let doc = if first { gap } else { prev_doc + gap };
            if !first && gap == 0 {
                return Err(Error::Corrupt("positional docids not ascending".into()).into());
            }
            first = false;
            prev_doc = doc;
            let count = read_uvarint(buf, &mut off)? as usize;
            let mut offsets = Vec::with_capacity(count.min(4096));
            let mut prev_pos: Option<u32> = None;
            for _ in 0..count {
                let d = read_uvarint(buf, &mut off)?;
                let pos = match prev_pos {
                    None => d,
                    Some(p) => p
                        .checked_add(d)
                        .ok_or_else(|| Error::Corrupt("positional offset overflow".into()))?,
                };
                prev_pos = Some(pos);
                offsets.push(pos);
            }
            out.push((doc, offsets));
        }
        Ok(out)
    }

    /// Offsets of `tri` within one document; empty when absent.
    pub fn positional_for_doc(&self, tri: Trigram, docid: u32) -> Result<Vec<u32>> {
        let e = match self.lookup_trigram(tri) {
            None => return Ok(Vec::new()),
            Some(e) => e,
        };
        let buf = self.positional_bytes(&e);
        let mut off = 0usize;
        let mut prev_doc = 0u32;
        let mut first = true;
        while off < buf.len() {
            let gap = read_uvarint(buf, &mut off)?;
            let doc = if first { gap } else { prev_doc + gap };
            first = false;
            prev_doc = doc;
            let count = read_uvarint(buf, &mut off)? as usize;
            if doc == docid {
                let mut offsets = Vec::with_capacity(count.min(4096));
                let mut prev_pos: Option<u32> = None;
                for _ in 0..count {
                    let d = read_uvarint(buf, &mut off)?;
                    let pos = match prev_pos {
                        None => d,
                        Some(p) => p + d,
                    };
                    prev_pos = Some(pos);
                    offsets.push(pos);
                }
                return Ok(offsets);
            }
            if doc > docid {
                return Ok(Vec::new());
            }
            for _ in 0..count {
                let _ = read_uvarint(buf, &mut off)?;
            }
        }
        Ok(Vec::new())
    }

    /// Evaluate a trigram query into a sorted candidate docid set. Within an
    /// AND, the smallest posting list drives the intersection first.
    pub fn posting_query(&self, q: &Query) -> Result<Vec<u32>> {
        match q.op {
            QueryOp::All => Ok((0..self.doc_count).collect()),
            QueryOp::None => Ok(Vec::new()),
            QueryOp::And => {
                let mut lists: Vec<Vec<u32>> = Vec::with_capacity(q.trigram.len() + q.sub.len());
                for &tri in &q.trigram {
                    lists.push(self.posting_list(tri)?);
                }
                for sub in &q.sub {
                    lists.push(self.posting_query(sub)?);
                }
                if lists.is_empty() {
                    return Ok((0..self.doc_count).collect());
                }
                lists.sort_by_key(|l| l.len());
                let mut acc = lists.remove(0);
                for l in &lists {
                    if acc.is_empty() {
                        break;
                    }
                    acc = intersect_sorted(&acc, l);
                }
                Ok(acc)
            }
            QueryOp::Or => {
                let mut acc: Vec<u32> = Vec::new();
                for &tri in &q.trigram {
                    acc = union_sorted(&acc, &self.posting_list(tri)?);
                }
                for sub in &q.sub {
                    acc = union_sorted(&acc, &self.posting_query(sub)?);
                }
                Ok(acc)
            }
        }
    }
}

pub(crate) fn intersect_sorted(a: &[u32], b: &[u32]) -> Vec<u32> {
    let mut out = Vec::with_capacity(a.len().min(b.len()));
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        if a[i] == b[j] {
            out.push(a[i]);
            i += 1;
            j += 1;
        } else if a[i] < b[j] {
            i += 1;
        } else {
            j += 1;
        }
    }
    out
}

pub(crate) fn union_sorted(a: &[u32], b: &[u32]) -> Vec<u32> {
    let mut out = Vec::with_capacity(a.len() + b.len());
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        if a[i] == b[j] {
            out.push(a[i]);
            i += 1;
            j += 1;
        } else if a[i] < b[j] {
            out.push(a[i]);
            i += 1;
        } else {
            out.push(b[j]);
            j += 1;
        }
    }
    out.extend_from_slice(&a[i..]);
    out.extend_from_slice(&b[j..]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intersect_and_union() {
        assert_eq!(intersect_sorted(&[1, 3, 5], &[2, 3, 5, 7]), vec![3, 5]);
        assert_eq!(union_sorted(&[1, 3], &[2, 3, 4]), vec![1, 2, 3, 4]);
        assert_eq!(intersect_sorted(&[], &[1]), Vec::<u32>::new());
        assert_eq!(union_sorted(&[], &[1]), vec![1]);
    }
}
