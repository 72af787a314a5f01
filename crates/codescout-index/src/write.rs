//! Index writer: turns a directory tree into an index file.
//!
//! Postings are accumulated as packed `u128` keys (`tri24|doc32|pos32`).
//! When the in-memory buffer crosses the spill threshold, the sorted run is
//! written to a sibling temp file; `flush` merges all runs in one pass,
//! groups them by trigram and emits the final file, which becomes visible
//! only through the terminal rename of its `.tmp` sibling.

use std::collections::BinaryHeap;
use std::cmp::Reverse;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{bail, Context, Result};
use rayon::prelude::*;

use crate::docidmap::DocidMapWriter;
use crate::error::Error;
use crate::trigram::trigrams_with_pos;
use crate::varint::{encode_delta_list, write_uvarint};
use crate::walk::{walk_tree, IgnorePolicy, Outcome, SkipReason, Visit};
use crate::{trailer_checksum, DirEntry, DIR_ENTRY_LEN, MAGIC, VERSION};

#[derive(Debug, Clone)]
pub struct IndexWriterOptions {
    /// Spill the in-memory posting buffer once its estimate exceeds this.
    pub spill_threshold_bytes: usize,
    /// A NUL byte within this prefix marks a file as binary.
    pub binary_check_len: usize,
}

impl Default for IndexWriterOptions {
    fn default() -> Self {
        IndexWriterOptions {
            spill_threshold_bytes: 64 << 20,
            binary_check_len: 1024,
        }
    }
}

const BATCH_MAX_FILES: usize = 128;
const BATCH_MAX_BYTES: usize = 16 << 20;

fn pack_key(tri: crate::Trigram, docid: u32, pos: u32) -> u128 {
    ((crate::tri_to_u32(tri) as u128) << 64) | ((docid as u128) << 32) | (pos as u128)
}

// LSD radix sort over the packed keys. Only the low 88 bits are ever set
// (tri24|doc32|pos32), so six 16-bit passes cover them.
pub(crate) fn radix_sort_keys(buf: &mut Vec<u128>) {
    if buf.len() <= 1 {
        return;
    }
    const RADIX_BITS: usize = 16;
    const RADIX: usize = 1 << RADIX_BITS;
    const PASSES: usize = 6; // ceil(88 / 16)
    let n = buf.len();
    let mut tmp: Vec<u128> = vec![0u128; n];
    for pass in 0..PASSES {
        let shift = pass * RADIX_BITS;
        let mut counts = vec![0usize; RADIX];
        for &k in buf.iter() {
            counts[((k >> shift) as usize) & (RADIX - 1)] += 1;
        }
        let mut sum = 0usize;
        for c in counts.iter_mut() {
            let v = *c;
            *c = sum;
            sum += v;
        }
        for &k in buf.iter() {
            let bucket = ((k >> shift) as usize) & (RADIX - 1);
            tmp[counts[bucket]] = k;
            counts[bucket] += 1;
        }
        buf.copy_from_slice(&tmp[..n]);
    }
}

/// Streams the posting and positional regions to temp files while collecting
/// directory entries, then assembles the final index file and renames it
/// into place. Shared between the writer and the merge engine.
pub(crate) struct IndexFileBuilder {
    out_path: PathBuf,
    postings_path: PathBuf,
    postings: BufWriter<File>,
    postings_len: u64,
    positional_path: PathBuf,
    positional: BufWriter<File>,
    positional_len: u64,
    dir: Vec<DirEntry>,
}

impl IndexFileBuilder {
    pub(crate) fn create(out_path: &Path) -> Result<Self> {
        let postings_path = sibling(out_path, "postings");
        let positional_path = sibling(out_path, "positional");
        Ok(IndexFileBuilder {
            out_path: out_path.to_path_buf(),
            postings: BufWriter::new(
                File::options()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(&postings_path)
                    .context("create posting temp file")?,
            ),
            postings_path,
            postings_len: 0,
            positional: BufWriter::new(
                File::options()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(&positional_path)
                    .context("create positional temp file")?,
            ),
            positional_path,
            positional_len: 0,
            dir: Vec::new(),
        })
    }

    /// Append one trigram's posting list and positional blocks. Trigrams
    /// must arrive in strictly ascending order.
    pub(crate) fn add_trigram(
        &mut self,
        tri: u32,
        docids: &[u32],
        blocks: &[(u32, Vec<u32>)],
    ) -> Result<()> {
        if let Some(last) = self.dir.last() {
            if tri <= last.trigram {
                return Err(
                    Error::Corrupt(format!("trigram {:06x} emitted out of order", tri)).into(),
                );
            }
        }
        let mut posting: Vec<u8> = Vec::new();
        encode_delta_list(docids, &mut posting)?;

        let mut positional: Vec<u8> = Vec::new();
        let mut prev_doc = 0u32;
        for (i, (doc, offsets)) in blocks.iter().enumerate() {
            let gap = if i == 0 { *doc } else { *doc - prev_doc };
            write_uvarint(&mut positional, gap)?;
            write_uvarint(&mut positional, offsets.len() as u32)?;
            encode_delta_list(offsets, &mut positional)?;
            prev_doc = *doc;
        }

        let entry = DirEntry {
            trigram: tri,
            posting_off: region_offset(self.postings_len, posting.len())?,
            posting_len: posting.len() as u32,
            positional_off: region_offset(self.positional_len, positional.len())?,
            positional_len: positional.len() as u32,
        };
        self.postings.write_all(&posting)?;
        self.postings_len += posting.len() as u64;
        self.positional.write_all(&positional)?;
        self.positional_len += positional.len() as u64;
        self.dir.push(entry);
        Ok(())
    }

    /// Assemble `<out>.tmp` and rename it to the final path.
    pub(crate) fn finish(mut self, docidmap: &[u8]) -> Result<()> {
        self.postings.flush()?;
        self.positional.flush()?;

        let tmp_path = sibling(&self.out_path, "tmp");
        let mut out = BufWriter::new(File::create(&tmp_path).context("create index temp file")?);

        out.write_all(&MAGIC.to_le_bytes())?;
        out.write_all(&VERSION.to_le_bytes())?;
        for e in &self.dir {
            out.write_all(&e.trigram.to_le_bytes())?;
            out.write_all(&e.posting_off.to_le_bytes())?;
            out.write_all(&e.posting_len.to_le_bytes())?;
            out.write_all(&e.positional_off.to_le_bytes())?;
            out.write_all(&e.positional_len.to_le_bytes())?;
        }

        let dir_off = 8u64;
        let postings_off = dir_off + (self.dir.len() * DIR_ENTRY_LEN) as u64;
        let positional_off = postings_off + self.postings_len;
        let docidmap_off = positional_off + self.positional_len;

        copy_back(self.postings.into_inner()?, &mut out)?;
        copy_back(self.positional.into_inner()?, &mut out)?;
        out.write_all(docidmap)?;

        let mut offsets = [0u8; 32];
        offsets[0..8].copy_from_slice(&dir_off.to_le_bytes());
        offsets[8..16].copy_from_slice(&postings_off.to_le_bytes());
        offsets[16..24].copy_from_slice(&positional_off.to_le_bytes());
        offsets[24..32].copy_from_slice(&docidmap_off.to_le_bytes());
        out.write_all(&offsets)?;
        out.write_all(&trailer_checksum(&offsets).to_le_bytes())?;

        let f = out.into_inner()?;
        f.sync_all()?;
        drop(f);
        fs::rename(&tmp_path, &self.out_path).context("publish index file")?;
        let _ = fs::remove_file(&self.postings_path);
        let _ = fs::remove_file(&self.positional_path);
        Ok(())
    }
}

fn region_offset(len: u64, adding: usize) -> Result<u32> {
    let end = len + adding as u64;
    if end > u32::MAX as u64 {
        bail!("index region exceeds 4 GiB");
    }
    Ok(len as u32)
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut s = path.as_os_str().to_os_string();
    s.push(format!(".{}", suffix));
    PathBuf::from(s)
}

fn copy_back(mut f: File, out: &mut impl Write) -> Result<()> {
    f.seek(SeekFrom::Start(0))?;
    io::copy(&mut BufReader::new(f), out)?;
    Ok(())
}

enum RunStream {
    Mem(std::vec::IntoIter<u128>),
    File(BufReader<File>),
}

impl RunStream {
    fn next_key(&mut self) -> Result<Option<u128>> {
        match self {
            RunStream::Mem(it) => Ok(it.next()),
            RunStream::File(r) => {
                let mut buf = [0u8; 16];
                match r.read_exact(&mut buf) {
                    Ok(()) => Ok(Some(u128::from_le_bytes(buf))),
                    Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(None),
                    Err(e) => Err(e).context("read spill run"),
                }
            }
        }
    }
}

/// Builds one index file from one or more directory trees.
pub struct IndexWriter {
    out_path: PathBuf,
    opts: IndexWriterOptions,
    docids: DocidMapWriter,
    keys: Vec<u128>,
    batch: Vec<(u32, Vec<u8>)>,
    batch_bytes: usize,
    spills: Vec<PathBuf>,
}

impl IndexWriter {
    pub fn create(out_path: impl AsRef<Path>) -> Result<Self> {
        Self::create_with_options(out_path, IndexWriterOptions::default())
    }

    pub fn create_with_options(
        out_path: impl AsRef<Path>,
        opts: IndexWriterOptions,
    ) -> Result<Self> {
        Ok(IndexWriter {
            out_path: out_path.as_ref().to_path_buf(),
            opts,
            docids: DocidMapWriter::new(),
            keys: Vec::new(),
            batch: Vec::new(),
            batch_bytes: 0,
            spills: Vec::new(),
        })
    }

    /// Walk `root`, skipping what `policy` excludes, and index the rest.
    /// `on_skip` fires exactly once per excluded entry, before any index
    /// state referencing it exists; `on_accept` fires once per indexed file
    /// with its freshly assigned docid (callers use it to copy the file into
    /// the shard's source tree).
    pub fn add_dir<FS, FA>(
        &mut self,
        root: &Path,
        strip_prefix: &Path,
        policy: &dyn IgnorePolicy,
        mut on_skip: FS,
        mut on_accept: FA,
    ) -> Result<()>
    where
        FS: FnMut(&Visit, &SkipReason),
        FA: FnMut(&Visit, u32),
    {
        for visit in walk_tree(root, strip_prefix, policy) {
            match &visit.outcome {
                Outcome::Skipped(reason) => on_skip(&visit, reason),
                Outcome::Accepted => {
                    let content = match fs::read(&visit.path) {
                        Ok(c) => c,
                        Err(e) => {
                            let reason = SkipReason::Unreadable(e.to_string());
                            log::warn!("skipping {}: {}", visit.rel, reason);
                            on_skip(&visit, &reason);
                            continue;
                        }
                    };
                    let head = &content[..content.len().min(self.opts.binary_check_len)];
                    if head.contains(&0) {
                        on_skip(&visit, &SkipReason::Binary);
                        continue;
                    }
                    let docid = self.docids.append(&visit.rel)?;
                    on_accept(&visit, docid);
                    self.batch_bytes += content.len();
                    self.batch.push((docid, content));
                    if self.batch.len() >= BATCH_MAX_FILES || self.batch_bytes >= BATCH_MAX_BYTES {
                        self.drain_batch()?;
                    }
                }
            }
        }
        self.drain_batch()
    }

    fn drain_batch(&mut self) -> Result<()> {
        if self.batch.is_empty() {
            return Ok(());
        }
        self.batch_bytes = 0;
        let batch = std::mem::take(&mut self.batch);
        // Extraction is parallel but appended in docid order, so the key
        // stream (and therefore the file) is reproducible.
        let per_doc: Vec<Vec<u128>> = batch
            .par_iter()
            .map(|(docid, content)| {
                trigrams_with_pos(content)
                    .map(|(tri, pos)| pack_key(tri, *docid, pos))
                    .collect()
            })
            .collect();
        for keys in per_doc {
            self.keys.extend(keys);
        }
        if self.keys.len() * 16 >= self.opts.spill_threshold_bytes {
            self.spill()?;
        }
        Ok(())
    }

    fn spill(&mut self) -> Result<()> {
        let mut keys = std::mem::take(&mut self.keys);
        radix_sort_keys(&mut keys);
        let path = sibling(&self.out_path, &format!("spill{}", self.spills.len()));
        let mut w = BufWriter::new(File::create(&path).context("create spill file")?);
        for k in &keys {
            w.write_all(&k.to_le_bytes())?;
        }
        w.flush()?;
        log::debug!("spilled {} postings to {}", keys.len(), path.display());
        self.spills.push(path);
        Ok(())
    }

    /// Materialize the index file. Consumes the writer.
    pub fn flush(mut self) -> Result<()> {
        let start = Instant::now();
        self.drain_batch()?;
        radix_sort_keys(&mut self.keys);

        let mut streams: Vec<RunStream> = Vec::with_capacity(self.spills.len() + 1);
        for path in &self.spills {
            streams.push(RunStream::File(BufReader::new(
                File::open(path).context("reopen spill file")?,
            )));
        }
        streams.push(RunStream::Mem(std::mem::take(&mut self.keys).into_iter()));

        let mut heap: BinaryHeap<Reverse<(u128, usize)>> = BinaryHeap::new();
        for (i, s) in streams.iter_mut().enumerate() {
            if let Some(k) = s.next_key()? {
                heap.push(Reverse((k, i)));
            }
        }

        let mut builder = IndexFileBuilder::create(&self.out_path)?;
        let mut cur_tri: Option<u32> = None;
        let mut docids: Vec<u32> = Vec::new();
        let mut blocks: Vec<(u32, Vec<u32>)> = Vec::new();
        let mut trigram_count = 0usize;

        while let Some(Reverse((key, i))) = heap.pop() {
            if let Some(k) = streams[i].next_key()? {
                heap.push(Reverse((k, i)));
            }
            let tri = ((key >> 64) as u32) & 0xFF_FFFF;
            let doc = (key >> 32) as u32;
            let pos = key as u32;
            if cur_tri != Some(tri) {
                if let Some(t) = cur_tri {
                    builder.add_trigram(t, &docids, &blocks)?;
                    trigram_count += 1;
                    docids.clear();
                    blocks.clear();
                }
                cur_tri = Some(tri);
            }
            match blocks.last_mut() {
                Some((d, offsets)) if *d == doc => offsets.push(pos),
                _ => {
                    docids.push(doc);
                    blocks.push((doc, vec![pos]));
                }
            }
        }
        if let Some(t) = cur_tri {
            builder.add_trigram(t, &docids, &blocks)?;
            trigram_count += 1;
        }

        let doc_count = self.docids.count();
        builder.finish(&self.docids.serialize())?;
        for path in &self.spills {
            let _ = fs::remove_file(path);
        }
        log::info!(
            "indexed {} documents, {} trigrams into {} in {:?}",
            doc_count,
            trigram_count,
            self.out_path.display(),
            start.elapsed()
        );
        Ok(())
    }
}
